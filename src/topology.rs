//! Declaring the exchange/queue/binding topology a consumer needs on an open channel.
use crate::session::Session;
use amq_protocol_types::FieldTable;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    ExchangeKind,
};
use serde::Deserialize;
use std::collections::BTreeSet;
use tracing::debug;

/// A topology descriptor: one `Binding` produces one declared
/// exchange/queue/binding triple.
///
/// `Binding` is `Deserialize`-able so binding lists can be loaded straight from
/// configuration files.
#[derive(Debug, Clone, Deserialize)]
pub struct Binding {
    /// The exchange to declare and bind to. Declared as a durable topic exchange.
    pub exchange: String,
    /// The queue to declare. Leave empty to let the broker generate a name.
    #[serde(default)]
    pub queue_name: String,
    /// The routing-key pattern connecting the exchange to the queue.
    pub routing_key: String,
    /// Whether the queue should be deleted when its last consumer disconnects.
    #[serde(default)]
    pub queue_auto_delete: bool,
    /// Extra arguments passed to the queue declaration (e.g. `x-message-ttl`).
    #[serde(default)]
    pub queue_arguments: Option<FieldTable>,
}

/// Error returned when a topology declaration is rejected by the broker.
///
/// Declarations already applied are not rolled back: broker-side topology is
/// idempotent to re-declaration.
#[derive(thiserror::Error, Debug)]
pub enum TopologyError {
    #[error("failed to declare exchange `{exchange}`")]
    ExchangeDeclare {
        exchange: String,
        #[source]
        source: lapin::Error,
    },
    #[error("failed to declare queue `{queue}`")]
    QueueDeclare {
        queue: String,
        #[source]
        source: lapin::Error,
    },
    #[error("failed to bind queue `{queue}` to exchange `{exchange}` with key `{routing_key}`")]
    QueueBind {
        queue: String,
        exchange: String,
        routing_key: String,
        #[source]
        source: lapin::Error,
    },
}

/// Declare the given bindings on the session's channel, in order, and return
/// the set of resolved queue names.
///
/// Queue names are resolved after declaration: when `queue_name` is empty the
/// broker assigns one, and the broker-assigned name is what gets bound and
/// consumed. An empty `bindings` slice is a no-op (publish-only mode).
#[tracing::instrument(name = "declare_bindings", skip_all, fields(bindings = bindings.len()))]
pub async fn declare_bindings(
    session: &Session,
    bindings: &[Binding],
) -> Result<BTreeSet<String>, TopologyError> {
    let channel = session.channel();
    let mut queues = BTreeSet::new();
    for binding in bindings {
        channel
            .exchange_declare(
                &binding.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|source| TopologyError::ExchangeDeclare {
                exchange: binding.exchange.clone(),
                source,
            })?;
        let queue = channel
            .queue_declare(
                &binding.queue_name,
                QueueDeclareOptions {
                    durable: true,
                    auto_delete: binding.queue_auto_delete,
                    ..QueueDeclareOptions::default()
                },
                binding.queue_arguments.clone().unwrap_or_default(),
            )
            .await
            .map_err(|source| TopologyError::QueueDeclare {
                queue: binding.queue_name.clone(),
                source,
            })?;
        // The broker-assigned name, which differs from `queue_name` when the
        // latter is empty.
        let queue_name = queue.name().as_str().to_owned();
        channel
            .queue_bind(
                &queue_name,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|source| TopologyError::QueueBind {
                queue: queue_name.clone(),
                exchange: binding.exchange.clone(),
                routing_key: binding.routing_key.clone(),
                source,
            })?;
        queues.insert(queue_name);
    }
    debug!("AMQP bindings declared");
    Ok(queues)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_deserialization_fills_in_defaults() {
        let binding: Binding = serde_json::from_value(serde_json::json!({
            "exchange": "amq.topic",
            "routing_key": "test.#",
        }))
        .unwrap();

        assert_eq!(binding.exchange, "amq.topic");
        assert_eq!(binding.routing_key, "test.#");
        assert_eq!(binding.queue_name, "");
        assert!(!binding.queue_auto_delete);
        assert!(binding.queue_arguments.is_none());
    }

    #[test]
    fn binding_deserialization_honours_explicit_values() {
        let binding: Binding = serde_json::from_value(serde_json::json!({
            "exchange": "amq.topic",
            "queue_name": "inbox",
            "routing_key": "test.#",
            "queue_auto_delete": true,
        }))
        .unwrap();

        assert_eq!(binding.queue_name, "inbox");
        assert!(binding.queue_auto_delete);
    }
}
