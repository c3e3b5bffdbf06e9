//! Publishing messages to an exchange, optionally waiting for the broker's
//! delivery confirmation.
use crate::message::{Message, MessageCodec, SerializedMessage};
use crate::session::Session;
use lapin::message::BasicReturnMessage;
use lapin::options::BasicPublishOptions;
use lapin::protocol::basic::AMQPProperties;
use lapin::publisher_confirm::Confirmation;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;
use uuid::Uuid;

/// Error returned when trying to publish a message.
///
/// There is no internal retry: the caller decides whether a failed publish is
/// worth retrying.
#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    #[error("failed to serialize the outgoing message")]
    Serialize(#[source] anyhow::Error),
    #[error("error encountered when publishing to the broker")]
    Transport(#[source] lapin::Error),
    #[error("the message could not be routed: {0:?}")]
    Unroutable(Box<BasicReturnMessage>),
    #[error("the broker refused to confirm the delivery: {0:?}")]
    NotConfirmed(Option<Box<BasicReturnMessage>>),
}

/// A publisher over an open session.
///
/// If the session is in confirm-delivery mode, every publish completes only
/// once the broker has acknowledged the delivery; a broker-side nack surfaces
/// as [`PublishError::NotConfirmed`].
pub struct Publisher {
    session: Session,
    codec: Arc<dyn MessageCodec>,
}

impl Publisher {
    pub fn new(session: Session, codec: Arc<dyn MessageCodec>) -> Self {
        Self { session, codec }
    }

    /// Publish a message to an exchange on the message broker.
    #[tracing::instrument(name = "publish", skip(self, message), fields(topic = %message.topic))]
    pub async fn publish(&self, message: &Message, exchange: &str) -> Result<(), PublishError> {
        let SerializedMessage {
            body,
            routing_key,
            properties,
        } = self
            .codec
            .serialize(message)
            .map_err(PublishError::Serialize)?;
        let properties = stamp_properties(properties);

        let options = BasicPublishOptions {
            // With confirms enabled we also ask the server to return
            // unroutable messages instead of silently dropping them.
            mandatory: self.session.confirms(),
            // The immediate flag was dropped in RabbitMQ 3.0; setting it
            // causes a not-supported error.
            immediate: false,
        };
        // Delivery mode: persistent (2).
        let properties = properties.with_delivery_mode(2);
        let confirm = self
            .session
            .channel()
            .basic_publish(exchange, &routing_key, options, &body, properties)
            .await
            .map_err(PublishError::Transport)?
            .await
            .map_err(PublishError::Transport)?;

        if !self.session.confirms() {
            return Ok(());
        }
        match confirm {
            Confirmation::Ack(return_message) => {
                if let Some(return_message) = return_message {
                    // Reply code 312 - NO_ROUTE.
                    if return_message.reply_code == 312 {
                        return Err(PublishError::Unroutable(return_message));
                    }
                }
                Ok(())
            }
            Confirmation::Nack(return_message) => {
                Err(PublishError::NotConfirmed(return_message))
            }
            Confirmation::NotRequested => Ok(()),
        }
    }
}

/// Inject a timestamp and a message id into the properties, unless the caller
/// already provided them.
fn stamp_properties(properties: AMQPProperties) -> AMQPProperties {
    let properties = match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(now) => {
            let timestamp = *properties.timestamp();
            properties.with_timestamp(timestamp.unwrap_or_else(|| now.as_secs()))
        }
        Err(_) => {
            warn!("System time is before 1970");
            properties
        }
    };
    let message_id = properties.message_id().clone();
    properties
        .with_message_id(message_id.unwrap_or_else(|| Uuid::new_v4().to_string().into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamping_injects_a_message_id_and_timestamp_when_missing() {
        let stamped = stamp_properties(AMQPProperties::default());

        assert!(stamped.message_id().is_some());
        assert!(stamped.timestamp().is_some());
    }

    #[test]
    fn stamping_preserves_caller_supplied_values() {
        let properties = AMQPProperties::default()
            .with_message_id("abc-123".into())
            .with_timestamp(42);

        let stamped = stamp_properties(properties);

        assert_eq!(stamped.message_id().as_ref().unwrap().as_str(), "abc-123");
        assert_eq!(*stamped.timestamp(), Some(42));
    }
}
