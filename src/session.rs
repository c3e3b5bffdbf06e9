//! Channel lifecycle: opening a channel once the connection is ready, applying
//! flow-control limits and (optionally) switching it into confirm-delivery mode.
use crate::connection::Connection;
use lapin::options::{BasicQosOptions, ConfirmSelectOptions};
use tracing::debug;

/// Options applied to the channel when a [`Session`] is opened.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// If `true`, the channel is switched into confirm-delivery mode: every publish
    /// waits for the broker to ack (or nack) the delivery.
    pub confirms: bool,
    /// Maximum number of unacknowledged deliveries a consumer may hold at once.
    /// `0` means no limit.
    pub prefetch_count: u16,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            confirms: false,
            prefetch_count: 0,
        }
    }
}

/// An open channel on a broker connection, shared by consumers and publishers
/// for the lifetime of the connection.
#[derive(Clone)]
pub struct Session {
    channel: lapin::Channel,
    confirms: bool,
}

/// Error returned when the channel could not be set up after the connection
/// signalled readiness.
///
/// This is fatal to the connection: it must propagate to whatever supervises
/// the connection, never be swallowed.
#[derive(thiserror::Error, Debug)]
pub enum ChannelSetupError {
    #[error("failed to open a channel on the broker connection")]
    OpenChannel(#[source] lapin::Error),
    #[error("failed to apply prefetch limits to the channel")]
    Qos(#[source] lapin::Error),
    #[error("failed to switch the channel into confirm-delivery mode")]
    ConfirmSelect(#[source] lapin::Error),
}

impl Session {
    /// Open a channel on a ready connection.
    ///
    /// Applies the prefetch limit (unlimited by default) and, if requested,
    /// enables confirm-delivery mode so publishes can be awaited for broker
    /// acknowledgement.
    #[tracing::instrument(name = "session_open", skip(connection))]
    pub async fn open(
        connection: &Connection,
        options: &SessionOptions,
    ) -> Result<Session, ChannelSetupError> {
        let channel = connection
            .raw()
            .create_channel()
            .await
            .map_err(ChannelSetupError::OpenChannel)?;
        debug!("AMQP channel created");
        channel
            .basic_qos(options.prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(ChannelSetupError::Qos)?;
        if options.confirms {
            channel
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await
                .map_err(ChannelSetupError::ConfirmSelect)?;
        }
        Ok(Session {
            channel,
            confirms: options.confirms,
        })
    }

    /// Get access to the underlying raw channel.
    pub fn channel(&self) -> &lapin::Channel {
        &self.channel
    }

    /// Whether the channel is in confirm-delivery mode.
    pub fn confirms(&self) -> bool {
        self.confirms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_leave_deliveries_unconfirmed_and_prefetch_unlimited() {
        let options = SessionOptions::default();
        assert!(!options.confirms);
        assert_eq!(options.prefetch_count, 0);
    }
}
