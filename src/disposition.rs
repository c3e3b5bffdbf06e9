//! The decision table mapping handler outcomes to broker-facing dispositions.

/// What happened while processing a single delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The delivery failed schema validation and never reached the handler.
    InvalidMessage,
    /// The handler returned normally.
    Handled,
    /// The handler asked for the message to be retried later.
    RetryLater,
    /// The handler asked for the message to be discarded.
    Discard,
    /// The handler asked for consumption to stop.
    HaltRequested,
    /// The handler failed in a way it did not anticipate.
    UnexpectedFailure,
}

/// The broker-facing action taken for a single delivery.
///
/// Computed per delivery, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Ack this delivery tag.
    Ack,
    /// Nack this delivery tag, requeueing it.
    NackRequeue,
    /// Nack this delivery tag without requeueing.
    NackDrop,
    /// Skip the ack and stop consuming; closing the channel returns the
    /// unacknowledged delivery to the queue.
    HaltAndHardCancel,
    /// Nack all deliveries up to and including this one (cumulative,
    /// requeue=true), then stop consuming.
    FatalNackAllAndHalt,
}

impl Verdict {
    /// Whether this verdict requires the flow controller's stop sequence to
    /// run once the delivery's disposition is resolved.
    pub fn halts_consumption(&self) -> bool {
        matches!(self, Verdict::HaltAndHardCancel | Verdict::FatalNackAllAndHalt)
    }
}

/// Map a processing outcome to its broker disposition.
///
/// Validation failures are the publisher's fault and not retryable: dropping
/// avoids poison-message loops. An unexpected failure is treated as a
/// potential systemic problem: all in-flight unacknowledged work is returned
/// to the queue and consumption halts rather than risk silently losing or
/// mis-processing further messages.
pub fn decide(outcome: Outcome) -> Verdict {
    match outcome {
        Outcome::InvalidMessage => Verdict::NackDrop,
        Outcome::Handled => Verdict::Ack,
        Outcome::RetryLater => Verdict::NackRequeue,
        Outcome::Discard => Verdict::NackDrop,
        Outcome::HaltRequested => Verdict::HaltAndHardCancel,
        Outcome::UnexpectedFailure => Verdict::FatalNackAllAndHalt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_decision_table_is_exactly_as_documented() {
        assert_eq!(decide(Outcome::InvalidMessage), Verdict::NackDrop);
        assert_eq!(decide(Outcome::Handled), Verdict::Ack);
        assert_eq!(decide(Outcome::RetryLater), Verdict::NackRequeue);
        assert_eq!(decide(Outcome::Discard), Verdict::NackDrop);
        assert_eq!(decide(Outcome::HaltRequested), Verdict::HaltAndHardCancel);
        assert_eq!(decide(Outcome::UnexpectedFailure), Verdict::FatalNackAllAndHalt);
    }

    #[test]
    fn only_the_two_halting_verdicts_stop_consumption() {
        assert!(Verdict::HaltAndHardCancel.halts_consumption());
        assert!(Verdict::FatalNackAllAndHalt.halts_consumption());
        assert!(!Verdict::Ack.halts_consumption());
        assert!(!Verdict::NackRequeue.halts_consumption());
        assert!(!Verdict::NackDrop.halts_consumption());
    }
}
