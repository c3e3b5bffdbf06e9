//! Driving a single delivery through decode, the user handler and the broker
//! acknowledgement decided for it.
use crate::disposition::{decide, Outcome, Verdict};
use crate::handler::{Handler, Incoming, Signal};
use crate::message::MessageCodec;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Decodes deliveries, invokes the user handler and applies the resulting
/// disposition.
///
/// Per-delivery errors are fully resolved here: nothing propagates past one
/// delivery. The returned [`Verdict`] tells the read loop whether the flow
/// controller's stop sequence must run.
pub(crate) struct Dispatcher<C: Send + Sync + 'static> {
    pub(crate) codec: Arc<dyn MessageCodec>,
    pub(crate) handler: Arc<dyn Handler<C>>,
    pub(crate) context: Arc<C>,
}

impl<C: Send + Sync + 'static> Dispatcher<C> {
    /// Process one delivery end to end and return the verdict that was applied.
    ///
    /// Exactly one ack/nack is issued per delivery tag on every path, with one
    /// deliberate exception: `HaltAndHardCancel` skips the ack and relies on
    /// the subsequent channel close to return the delivery to the queue.
    pub(crate) async fn dispatch(&self, queue_name: &str, delivery: &Delivery) -> Verdict {
        debug!(
            delivery_tag = delivery.delivery_tag,
            queue_name, "message arrived"
        );
        let message = match self.codec.decode(
            delivery.routing_key.as_str(),
            &delivery.properties,
            &delivery.data,
        ) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    delivery_tag = delivery.delivery_tag,
                    "message did not pass validation: {}", e
                );
                let verdict = decide(Outcome::InvalidMessage);
                self.apply(delivery, verdict).await;
                return verdict;
            }
        };

        debug!(
            topic = %message.topic,
            message_id = %message.id,
            "consuming message"
        );
        let incoming = Incoming {
            context: self.context.clone(),
            message: &message,
            queue_name,
        };
        let outcome = match self.handler.handle(incoming).await {
            Ok(()) => Outcome::Handled,
            Err(Signal::Requeue) => {
                warn!(message_id = %message.id, "returning message to the queue");
                Outcome::RetryLater
            }
            Err(Signal::Discard) => {
                warn!(message_id = %message.id, "dropping message");
                Outcome::Discard
            }
            Err(Signal::Halt) => {
                warn!("handler requested that consumption halts, shutting down");
                Outcome::HaltRequested
            }
            Err(Signal::Fault(e)) => {
                error!(
                    message_id = %message.id,
                    "unexpected error from message handler: {:?}", e
                );
                Outcome::UnexpectedFailure
            }
        };

        let verdict = decide(outcome);
        self.apply(delivery, verdict).await;
        verdict
    }

    /// Issue the broker call a verdict maps to.
    ///
    /// Disposition failures cannot be recovered from within a dispatch: they
    /// are logged and the delivery's fate is left to the channel teardown.
    async fn apply(&self, delivery: &Delivery, verdict: Verdict) {
        let result = match verdict {
            Verdict::Ack => delivery.acker.ack(BasicAckOptions::default()).await,
            Verdict::NackRequeue => {
                delivery
                    .acker
                    .nack(BasicNackOptions {
                        multiple: false,
                        requeue: true,
                    })
                    .await
            }
            Verdict::NackDrop => {
                delivery
                    .acker
                    .nack(BasicNackOptions {
                        multiple: false,
                        requeue: false,
                    })
                    .await
            }
            // The delivery stays unacknowledged on purpose: the stop sequence
            // closes the channel, which returns it to the queue.
            Verdict::HaltAndHardCancel => Ok(()),
            Verdict::FatalNackAllAndHalt => {
                delivery
                    .acker
                    .nack(BasicNackOptions {
                        multiple: true,
                        requeue: true,
                    })
                    .await
            }
        };
        if let Err(e) = result {
            error!(
                delivery_tag = delivery.delivery_tag,
                "failed to resolve the delivery with the broker: {}", e
            );
        }
    }
}
