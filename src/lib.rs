//! `mailroom` is a message-consumption and publication protocol layer, built on
//! top of [`lapin`], sitting between an AMQP broker connection and your
//! application code.
//!
//! Once a connection is ready it opens a channel ([`Session`]), declares the
//! topology you need ([`topology::Binding`]), pulls messages from the bound
//! queues and drives them through validation and your [`handler::Handler`],
//! mapping each outcome to the right broker acknowledgement. Outgoing messages
//! go through a [`Publisher`], optionally gated on the broker's delivery
//! confirmation.
//!
//! [`Session`]: crate::session::Session
//! [`Publisher`]: crate::publisher::Publisher
//!
//! ```rust,no_run
//! use mailroom::{
//!     configuration::BrokerSettings,
//!     connection::ConnectionFactory,
//!     consumer::Consumer,
//!     handler::{ClosureHandler, Incoming, Signal},
//!     message::RawCodec,
//!     session::{Session, SessionOptions},
//!     topology::Binding,
//! };
//! use std::sync::Arc;
//!
//! async fn run() -> Result<(), anyhow::Error> {
//!     let connection = ConnectionFactory::new_from_config(&BrokerSettings::default())?
//!         .connect()
//!         .await?;
//!     let session = Session::open(&connection, &SessionOptions::default()).await?;
//!
//!     async fn handle(incoming: Incoming<'_, ()>) -> Result<(), Signal> {
//!         println!("{}: {} bytes", incoming.message.topic, incoming.message.body.len());
//!         Ok(())
//!     }
//!     let consumer = Consumer::new(
//!         session,
//!         Arc::new(RawCodec),
//!         Arc::new(ClosureHandler(handle)),
//!         (),
//!     );
//!     consumer
//!         .bind(&[Binding {
//!             exchange: "amq.topic".into(),
//!             queue_name: "".into(),
//!             routing_key: "test.#".into(),
//!             queue_auto_delete: false,
//!             queue_arguments: None,
//!         }])
//!         .await?;
//!     consumer.start().await?;
//!     Ok(())
//! }
//! ```

pub mod configuration;
pub mod connection;
pub mod consumer;
pub mod disposition;
pub mod handler;
pub mod message;
pub mod publisher;
pub mod session;
pub mod topology;

mod dispatcher;

// Re-export of the `lapin` types that appear in this crate's public API, so
// users do not need `lapin` as a direct dependency.
pub mod amqp {
    pub use amq_protocol_types::{AMQPValue, FieldTable};
    pub use lapin::message::Delivery;
    pub use lapin::protocol::basic::AMQPProperties;
    pub use lapin::Error;
}
