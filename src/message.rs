//! The domain-level message type and the codec contract used to move between
//! wire deliveries and [`Message`]s.
use lapin::protocol::basic::AMQPProperties;
use uuid::Uuid;

/// A decoded, validated message.
///
/// Produced by a [`MessageCodec`] from an incoming delivery, or constructed by
/// application code before publishing. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct Message {
    /// The topic the message was (or will be) routed with.
    pub topic: String,
    /// The message identifier, taken from the AMQP `message_id` property.
    pub id: String,
    /// The AMQP properties attached to the message.
    pub properties: AMQPProperties,
    /// The validated payload.
    pub body: Vec<u8>,
}

impl Message {
    /// Build an outgoing message on a topic with a freshly generated id.
    pub fn new(topic: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            id: Uuid::new_v4().to_string(),
            properties: AMQPProperties::default(),
            body,
        }
    }
}

/// The wire-ready form of an outgoing message.
pub struct SerializedMessage {
    pub body: Vec<u8>,
    pub routing_key: String,
    pub properties: AMQPProperties,
}

/// Error returned when an incoming delivery fails schema validation.
///
/// A validation failure is the publisher's fault: the delivery is dropped
/// without requeueing (requeueing would loop on the same poison message) and
/// the read loop keeps going.
#[derive(thiserror::Error, Debug)]
#[error("message failed schema validation: {reason}")]
pub struct ValidationError {
    pub reason: String,
}

impl ValidationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Schema validation and (de)serialization of messages.
///
/// The protocol layer treats both directions as opaque calls: `decode` turns a
/// raw delivery into a [`Message`] or rejects it with a [`ValidationError`];
/// `serialize` turns a [`Message`] into its wire-ready form.
pub trait MessageCodec: Send + Sync + 'static {
    fn decode(
        &self,
        routing_key: &str,
        properties: &AMQPProperties,
        body: &[u8],
    ) -> Result<Message, ValidationError>;

    fn serialize(&self, message: &Message) -> Result<SerializedMessage, anyhow::Error>;
}

/// A schema-less codec: the payload is carried as-is.
///
/// The topic is the routing key, the id comes from the `message_id` property
/// (generated when absent). The only validation rule is that the payload must
/// not be empty.
pub struct RawCodec;

impl MessageCodec for RawCodec {
    fn decode(
        &self,
        routing_key: &str,
        properties: &AMQPProperties,
        body: &[u8],
    ) -> Result<Message, ValidationError> {
        if body.is_empty() {
            return Err(ValidationError::new("empty payload"));
        }
        let id = properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_owned())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Ok(Message {
            topic: routing_key.to_owned(),
            id,
            properties: properties.clone(),
            body: body.to_vec(),
        })
    }

    fn serialize(&self, message: &Message) -> Result<SerializedMessage, anyhow::Error> {
        Ok(SerializedMessage {
            body: message.body.clone(),
            routing_key: message.topic.clone(),
            properties: message
                .properties
                .clone()
                .with_message_id(message.id.as_str().into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_codec_derives_topic_and_id_from_the_delivery() {
        let properties = AMQPProperties::default().with_message_id("abc-123".into());

        let message = RawCodec
            .decode("test.topic", &properties, b"payload")
            .unwrap();

        assert_eq!(message.topic, "test.topic");
        assert_eq!(message.id, "abc-123");
        assert_eq!(message.body, b"payload");
    }

    #[test]
    fn raw_codec_generates_an_id_when_the_property_is_absent() {
        let message = RawCodec
            .decode("test.topic", &AMQPProperties::default(), b"payload")
            .unwrap();

        assert!(!message.id.is_empty());
    }

    #[test]
    fn raw_codec_rejects_an_empty_payload() {
        let result = RawCodec.decode("test.topic", &AMQPProperties::default(), b"");

        assert!(result.is_err());
    }

    #[test]
    fn raw_codec_serializes_the_topic_as_routing_key() {
        let message = Message::new("outbound.topic", b"payload".to_vec());

        let serialized = RawCodec.serialize(&message).unwrap();

        assert_eq!(serialized.routing_key, "outbound.topic");
        assert_eq!(serialized.body, b"payload");
        assert_eq!(
            serialized.properties.message_id().as_ref().unwrap().as_str(),
            message.id
        );
    }
}
