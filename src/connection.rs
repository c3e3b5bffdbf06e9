//! Establishing connections to an AMQP broker, with or without TLS.
use crate::configuration::BrokerSettings;
use anyhow::Context;
use lapin::{
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    uri::{AMQPScheme, AMQPUri},
    ConnectionProperties,
};
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
/// All the information required to connect to an AMQP broker.
pub struct ConnectionFactory {
    uri: AMQPUri,
    /// The timeout observed when trying to connect to the broker.
    connection_timeout: std::time::Duration,
    /// TLS configuration for the connection.
    /// If `None`, the connection will not be encrypted.
    tls: Option<Arc<Tls>>,
}

#[derive(Clone)]
struct Tls {
    connector: NativeTlsConnector,
    domain_name: String,
}

/// A connection to an AMQP broker.
///
/// Connections should be re-used across multiple actions given the initial setup cost.
pub struct Connection(lapin::Connection);

impl ConnectionFactory {
    /// Create a new connection factory from settings.
    ///
    /// A connection timeout can be (optionally) specified in `settings`.
    /// If the connection timeout is left unspecified, it will be defaulted to 10 seconds.
    pub fn new_from_config(settings: &BrokerSettings) -> Result<Self, anyhow::Error> {
        let tls = settings
            .tls
            .as_ref()
            .map::<Result<Tls, anyhow::Error>, _>(|tls_settings| {
                let domain_name = tls_settings
                    .domain
                    .clone()
                    .unwrap_or_else(|| settings.host.clone());
                let mut builder = NativeTlsConnector::builder();
                if let Some(root_certificate) = tls_settings
                    .ca_certificate_chain()
                    .with_context(|| "Failed to parse CA certificate for the broker TLS settings.")?
                {
                    builder.add_root_certificate(root_certificate);
                }
                let connector = builder
                    .build()
                    .context("TLS configuration for the broker connection failed.")?;
                Ok(Tls {
                    connector,
                    domain_name,
                })
            })
            .transpose()?;
        let connection_timeout = settings
            .connection_timeout()
            .unwrap_or_else(|| std::time::Duration::from_secs(10));
        Ok(Self {
            uri: settings.amqp_uri(),
            connection_timeout,
            tls: tls.map(Arc::new),
        })
    }

    /// Establish a new connection to the broker.
    ///
    /// The connection is encrypted if TLS settings were provided, plain otherwise.
    #[tracing::instrument(name = "broker_connect", skip(self))]
    pub async fn connect(&self) -> Result<Connection, anyhow::Error> {
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        let connection = match &self.tls {
            None => {
                connect_with_timeout(
                    self.connection_timeout,
                    lapin::Connection::connect_uri(self.uri.clone(), properties),
                )
                .await?
            }
            Some(tls) => {
                let tls = Arc::clone(tls);
                // Establish a plain TCP connection first, then perform the TLS handshake
                // with the configured connector and expected server domain.
                let mut amqp_uri = self.uri.clone();
                amqp_uri.scheme = AMQPScheme::AMQP;
                connect_with_timeout(
                    self.connection_timeout,
                    lapin::Connection::connector(
                        amqp_uri,
                        Box::new(move |uri| {
                            uri.connect().and_then(|tcp| {
                                tcp.into_native_tls(&tls.connector, &tls.domain_name)
                            })
                        }),
                        properties,
                    ),
                )
                .await?
            }
        };
        // Log connection-level errors surfaced by the transport.
        connection.on_error(|e| {
            warn!("Broken broker connection: {:?}", e);
        });
        Ok(Connection(connection))
    }
}

async fn connect_with_timeout<F>(
    timeout: std::time::Duration,
    connecting: F,
) -> Result<lapin::Connection, anyhow::Error>
where
    F: std::future::Future<Output = Result<lapin::Connection, lapin::Error>>,
{
    match tokio::time::timeout(timeout, connecting).await {
        Ok(result) => result.with_context(|| "Failed to connect to the AMQP broker."),
        Err(_) => Err(anyhow::anyhow!(
            "Timed out while trying to connect to the AMQP broker."
        )),
    }
}

impl Connection {
    pub fn raw(&self) -> &lapin::Connection {
        &self.0
    }
}

impl AsRef<lapin::Connection> for Connection {
    fn as_ref(&self) -> &lapin::Connection {
        &self.0
    }
}
