//! The consumer side of the protocol layer: per-queue read loops and the
//! start/pause/stop lifecycle that governs them.
use crate::dispatcher::Dispatcher;
use crate::disposition::Verdict;
use crate::handler::Handler;
use crate::message::MessageCodec;
use crate::session::Session;
use crate::topology::{declare_bindings, Binding, TopologyError};
use amq_protocol_types::FieldTable;
use futures_util::{Stream, StreamExt};
use lapin::message::Delivery;
use lapin::options::{BasicCancelOptions, BasicConsumeOptions};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Process-wide lifecycle state of the consumer side.
///
/// Read loops run only while the state is `Consuming`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No queues bound yet (or none will be: publish-only mode).
    Idle,
    /// Topology declared, ready to start consuming.
    Ready,
    /// Read loops are running.
    Consuming,
    /// Consumers cancelled, can be resumed with `start`.
    Paused,
    /// Channel closed; terminal.
    Stopped,
}

/// The record of one queue being actively consumed.
///
/// The set of active registrations is the authoritative record of what is
/// currently being consumed.
#[derive(Debug, Clone)]
pub struct QueueRegistration {
    pub queue_name: String,
    pub consumer_tag: String,
}

/// Error returned when a consume request is rejected while starting.
#[derive(thiserror::Error, Debug)]
#[error("failed to start consuming from queue `{queue}`")]
pub struct ConsumeError {
    pub queue: String,
    #[source]
    pub source: lapin::Error,
}

/// The mutable lifecycle state, guarded by a single mutex.
struct FlowState {
    run: RunState,
    /// Resolved queue names, as returned by topology declaration.
    queues: BTreeSet<String>,
    registrations: Vec<QueueRegistration>,
}

impl FlowState {
    fn new() -> Self {
        Self {
            run: RunState::Idle,
            queues: BTreeSet::new(),
            registrations: Vec::new(),
        }
    }

    /// Record resolved queue names; the first non-empty batch makes the
    /// consumer ready to start.
    fn note_queues(&mut self, queues: impl IntoIterator<Item = String>) {
        self.queues.extend(queues);
        if self.run == RunState::Idle && !self.queues.is_empty() {
            self.run = RunState::Ready;
        }
    }

    fn may_start(&self) -> bool {
        matches!(self.run, RunState::Ready | RunState::Paused)
    }

    fn take_registrations(&mut self) -> Vec<QueueRegistration> {
        std::mem::take(&mut self.registrations)
    }

    fn drop_registration(&mut self, queue_name: &str) {
        self.registrations.retain(|r| r.queue_name != queue_name);
    }

    /// Transition to `Stopped` and return the registrations whose consumer
    /// tags still need cancelling on the channel, or `None` when already
    /// stopped (a second stop has nothing left to do).
    fn halt(&mut self) -> Option<Vec<QueueRegistration>> {
        if self.run == RunState::Stopped {
            return None;
        }
        let pending = if self.run == RunState::Consuming {
            self.take_registrations()
        } else {
            Vec::new()
        };
        self.run = RunState::Stopped;
        Some(pending)
    }
}

/// A message consumer over one channel: binds topology, then pulls deliveries
/// from every bound queue and drives them through the dispatcher.
///
/// Cheap to clone; all clones share the same lifecycle state.
pub struct Consumer<C: Send + Sync + 'static> {
    inner: Arc<Inner<C>>,
}

impl<C: Send + Sync + 'static> Clone for Consumer<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<C: Send + Sync + 'static> {
    session: Session,
    dispatcher: Dispatcher<C>,
    state: Mutex<FlowState>,
}

impl<C: Send + Sync + 'static> Consumer<C> {
    /// Create a consumer on an open session.
    ///
    /// `context` is shared by every message handled by this consumer; if it is
    /// already behind an `Arc` pointer, it won't be double-wrapped.
    pub fn new(
        session: Session,
        codec: Arc<dyn MessageCodec>,
        handler: Arc<dyn Handler<C>>,
        context: impl Into<Arc<C>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                session,
                dispatcher: Dispatcher {
                    codec,
                    handler,
                    context: context.into(),
                },
                state: Mutex::new(FlowState::new()),
            }),
        }
    }

    /// Declare the given bindings and record the resolved queue names for
    /// consumption.
    ///
    /// An empty binding list is a no-op: no read loop is ever started and the
    /// session can be used for publishing only. Re-binding is safe - broker
    /// declarations are idempotent and resolved names are kept as a set.
    pub async fn bind(&self, bindings: &[Binding]) -> Result<BTreeSet<String>, TopologyError> {
        let queues = declare_bindings(&self.inner.session, bindings).await?;
        self.inner
            .state
            .lock()
            .await
            .note_queues(queues.iter().cloned());
        Ok(queues)
    }

    /// Start (or resume) the retrieval of messages from every bound queue.
    ///
    /// One read loop is spawned per queue; within a queue deliveries are
    /// dispatched strictly in arrival order, one at a time. No-op when already
    /// consuming, when nothing is bound, or after `stop`.
    ///
    /// On failure nothing stays half-started: the consumers registered before
    /// the failing one are cancelled on the channel, so a retry registers each
    /// queue exactly once.
    #[tracing::instrument(name = "consumer_start", skip_all)]
    pub async fn start(&self) -> Result<(), ConsumeError> {
        let mut state = self.inner.state.lock().await;
        if state.run == RunState::Consuming {
            return Ok(());
        }
        if !state.may_start() {
            debug!(run_state = ?state.run, "nothing to consume, start is a no-op");
            return Ok(());
        }
        for queue_name in state.queues.clone() {
            let deliveries = match self
                .inner
                .session
                .channel()
                .basic_consume(
                    &queue_name,
                    &Uuid::new_v4().to_string(),
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
            {
                Ok(deliveries) => deliveries,
                Err(source) => {
                    // The consumers registered so far must not stay active on
                    // the broker while the state says we are not consuming.
                    let registered = state.take_registrations();
                    self.inner.cancel_registrations(registered).await;
                    return Err(ConsumeError {
                        queue: queue_name,
                        source,
                    });
                }
            };
            state.registrations.push(QueueRegistration {
                queue_name: queue_name.clone(),
                consumer_tag: deliveries.tag().as_str().to_owned(),
            });
            tokio::spawn(read_loop(Arc::clone(&self.inner), queue_name, deliveries));
        }
        state.run = RunState::Consuming;
        debug!("AMQP consumer is ready");
        Ok(())
    }

    /// Pause the reception of messages without disconnecting from the broker.
    ///
    /// Every active consumer tag is cancelled on the channel, which ends the
    /// underlying delivery streams so in-flight read loops observe a clean
    /// stop. Reception can be resumed with [`Consumer::start`] - the topology
    /// does not need to be re-declared. No-op unless currently consuming.
    #[tracing::instrument(name = "consumer_pause", skip_all)]
    pub async fn pause(&self) {
        let mut state = self.inner.state.lock().await;
        if state.run != RunState::Consuming {
            return;
        }
        let registrations = state.take_registrations();
        self.inner.cancel_registrations(registrations).await;
        state.run = RunState::Paused;
        debug!("paused retrieval of messages from the server queues");
    }

    /// Stop consuming and close the channel.
    ///
    /// Idempotent: stopping an already-stopped consumer performs no broker
    /// calls. Safe to invoke from within a read loop's own dispatch - the loop
    /// that triggers the stop simply observes its own cancellation.
    pub async fn stop(&self) {
        self.inner.stop().await;
    }

    /// The current lifecycle state.
    pub async fn run_state(&self) -> RunState {
        self.inner.state.lock().await.run
    }

    /// A snapshot of the queues currently being consumed.
    pub async fn registrations(&self) -> Vec<QueueRegistration> {
        self.inner.state.lock().await.registrations.clone()
    }
}

impl<C: Send + Sync + 'static> Inner<C> {
    /// Cancel the given consumer tags on the channel, best-effort.
    ///
    /// Cancel failures are logged and skipped: they almost always mean the
    /// channel is already going away, and the read loops will observe the end
    /// of their streams regardless.
    async fn cancel_registrations(&self, registrations: Vec<QueueRegistration>) {
        for registration in registrations {
            if let Err(e) = self
                .session
                .channel()
                .basic_cancel(&registration.consumer_tag, BasicCancelOptions::default())
                .await
            {
                warn!(
                    consumer_tag = %registration.consumer_tag,
                    "failed to cancel consumer: {}", e
                );
            }
        }
    }

    async fn stop(&self) {
        let mut state = self.state.lock().await;
        let pending = match state.halt() {
            Some(pending) => pending,
            None => return,
        };
        self.cancel_registrations(pending).await;
        if self.session.channel().status().connected() {
            debug!("disconnecting from the broker");
            if let Err(e) = self.session.channel().close(200, "client shutdown").await {
                warn!("failed to close the channel cleanly: {}", e);
            }
        }
    }
}

/// The lifecycle operations a read loop needs from its owner.
///
/// This is the seam between the per-queue loop and the shared consumer state:
/// the loop body never touches the channel directly.
#[async_trait::async_trait]
trait FlowControl: Send + Sync {
    async fn keeps_consuming(&self) -> bool;
    async fn dispatch(&self, queue_name: &str, delivery: &Delivery) -> Verdict;
    async fn stop(&self);
    async fn forget_queue(&self, queue_name: &str);
}

#[async_trait::async_trait]
impl<C: Send + Sync + 'static> FlowControl for Inner<C> {
    async fn keeps_consuming(&self) -> bool {
        self.state.lock().await.run == RunState::Consuming
    }

    async fn dispatch(&self, queue_name: &str, delivery: &Delivery) -> Verdict {
        self.dispatcher.dispatch(queue_name, delivery).await
    }

    async fn stop(&self) {
        Inner::stop(self).await;
    }

    async fn forget_queue(&self, queue_name: &str) {
        self.state.lock().await.drop_registration(queue_name);
    }
}

/// The per-queue read loop: pull the next delivery, dispatch it, repeat.
///
/// A read loop never raises past itself. Its termination is a quiet return,
/// observed only through the lifecycle state, the registration bookkeeping
/// and the logs.
async fn read_loop<F, S>(flow: Arc<F>, queue_name: String, mut deliveries: S)
where
    F: FlowControl,
    S: Stream<Item = Result<Delivery, lapin::Error>> + Unpin + Send,
{
    loop {
        if !flow.keeps_consuming().await {
            debug!(%queue_name, "consumption is no longer running, exiting the read loop");
            break;
        }
        match deliveries.next().await {
            // The consumer was cancelled by us or the connection ended
            // cleanly. This is deliberate.
            None => {
                debug!(%queue_name, "closing the read loop on the consumer");
                break;
            }
            Some(Err(e)) => {
                error!(
                    %queue_name,
                    "failed to get the next message from the queue, stopping: {}", e
                );
                break;
            }
            Some(Ok(delivery)) => {
                let verdict = flow.dispatch(&queue_name, &delivery).await;
                if verdict.halts_consumption() {
                    // The loop that triggers the stop is allowed to observe
                    // its own cancellation; the state mutex is not held here.
                    flow.stop().await;
                    break;
                }
            }
        }
    }
    flow.forget_queue(&queue_name).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{ClosureHandler, Incoming, Signal};
    use crate::message::RawCodec;
    use futures_util::stream;
    use lapin::protocol::basic::AMQPProperties;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn a_new_flow_state_is_idle_with_no_registrations() {
        let state = FlowState::new();
        assert_eq!(state.run, RunState::Idle);
        assert!(state.queues.is_empty());
        assert!(state.registrations.is_empty());
    }

    #[test]
    fn noting_queues_makes_the_state_ready() {
        let mut state = FlowState::new();
        state.note_queues(["inbox".to_owned()]);
        assert_eq!(state.run, RunState::Ready);
    }

    #[test]
    fn noting_no_queues_keeps_the_state_idle() {
        let mut state = FlowState::new();
        state.note_queues(Vec::new());
        assert_eq!(state.run, RunState::Idle);
        assert!(!state.may_start());
    }

    #[test]
    fn two_bindings_on_the_same_queue_resolve_to_one_consumable_queue() {
        let mut state = FlowState::new();
        state.note_queues(["inbox".to_owned()]);
        state.note_queues(["inbox".to_owned()]);
        assert_eq!(state.queues.len(), 1);
    }

    #[test]
    fn start_is_only_possible_from_ready_or_paused() {
        let mut state = FlowState::new();
        assert!(!state.may_start());

        state.note_queues(["inbox".to_owned()]);
        assert!(state.may_start());

        state.run = RunState::Consuming;
        assert!(!state.may_start());

        state.run = RunState::Paused;
        assert!(state.may_start());

        state.run = RunState::Stopped;
        assert!(!state.may_start());
    }

    #[test]
    fn taking_registrations_leaves_none_behind_for_a_second_stop() {
        let mut state = FlowState::new();
        state.registrations.push(registration("inbox", "tag-1"));

        let cancelled = state.take_registrations();
        assert_eq!(cancelled.len(), 1);
        // A second pass has nothing left to cancel: no additional broker calls.
        assert!(state.take_registrations().is_empty());
    }

    #[test]
    fn a_failed_start_rolls_back_to_a_cleanly_retryable_state() {
        let mut state = FlowState::new();
        state.note_queues(["inbox".to_owned(), "outbox".to_owned()]);
        // The first queue registers fine, then the second consume request is
        // rejected by the broker.
        state.registrations.push(registration("inbox", "tag-1"));

        let rolled_back = state.take_registrations();

        // The surviving server-side consumer is handed over for cancellation,
        // and a retried start registers each queue exactly once.
        assert_eq!(rolled_back.len(), 1);
        assert_eq!(rolled_back[0].consumer_tag, "tag-1");
        assert!(state.registrations.is_empty());
        assert!(state.may_start());
    }

    #[test]
    fn halting_while_consuming_hands_over_the_tags_to_cancel_exactly_once() {
        let mut state = FlowState::new();
        state.note_queues(["inbox".to_owned()]);
        state.run = RunState::Consuming;
        state.registrations.push(registration("inbox", "tag-1"));

        let pending = state.halt().unwrap();

        assert_eq!(pending.len(), 1);
        assert_eq!(state.run, RunState::Stopped);
        // A second stop performs no broker calls at all.
        assert!(state.halt().is_none());
    }

    #[test]
    fn halting_when_not_consuming_has_no_tags_left_to_cancel() {
        let mut state = FlowState::new();
        state.note_queues(["inbox".to_owned()]);
        state.run = RunState::Paused;

        let pending = state.halt().unwrap();

        assert!(pending.is_empty());
        assert_eq!(state.run, RunState::Stopped);
    }

    #[test]
    fn a_read_loop_exit_removes_only_its_own_registration() {
        let mut state = FlowState::new();
        state.registrations.push(registration("inbox", "tag-1"));
        state.registrations.push(registration("outbox", "tag-2"));

        state.drop_registration("inbox");

        assert_eq!(state.registrations.len(), 1);
        assert_eq!(state.registrations[0].queue_name, "outbox");
    }

    fn registration(queue_name: &str, consumer_tag: &str) -> QueueRegistration {
        QueueRegistration {
            queue_name: queue_name.into(),
            consumer_tag: consumer_tag.into(),
        }
    }

    // A consuming flow over real dispatch and state-machine code, minus the
    // channel, so the read loop can be driven from an in-memory stream.
    struct Flow {
        dispatcher: Dispatcher<Counts>,
        state: Mutex<FlowState>,
    }

    #[derive(Default)]
    struct Counts {
        handled: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl FlowControl for Flow {
        async fn keeps_consuming(&self) -> bool {
            self.state.lock().await.run == RunState::Consuming
        }

        async fn dispatch(&self, queue_name: &str, delivery: &Delivery) -> Verdict {
            self.dispatcher.dispatch(queue_name, delivery).await
        }

        async fn stop(&self) {
            self.state.lock().await.halt();
        }

        async fn forget_queue(&self, queue_name: &str) {
            self.state.lock().await.drop_registration(queue_name);
        }
    }

    fn consuming_flow<F>(handler: F) -> Arc<Flow>
    where
        ClosureHandler<F>: Handler<Counts>,
    {
        let mut state = FlowState::new();
        state.note_queues(["inbox".to_owned()]);
        state.run = RunState::Consuming;
        state.registrations.push(registration("inbox", "tag-1"));
        Arc::new(Flow {
            dispatcher: Dispatcher {
                codec: Arc::new(RawCodec),
                handler: Arc::new(ClosureHandler(handler)),
                context: Arc::new(Counts::default()),
            },
            state: Mutex::new(state),
        })
    }

    fn delivery(tag: u64) -> Result<Delivery, lapin::Error> {
        Ok(Delivery {
            delivery_tag: tag,
            exchange: "".into(),
            routing_key: "test.topic".into(),
            redelivered: false,
            properties: AMQPProperties::default(),
            data: b"payload".to_vec(),
            acker: Default::default(),
        })
    }

    async fn succeeding(incoming: Incoming<'_, Counts>) -> Result<(), Signal> {
        incoming.context.handled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn faulting(incoming: Incoming<'_, Counts>) -> Result<(), Signal> {
        incoming.context.handled.fetch_add(1, Ordering::SeqCst);
        Err(anyhow::anyhow!("boom"))?;
        Ok(())
    }

    async fn halting(incoming: Incoming<'_, Counts>) -> Result<(), Signal> {
        incoming.context.handled.fetch_add(1, Ordering::SeqCst);
        Err(Signal::Halt)
    }

    #[tokio::test]
    async fn an_unexpected_fault_stops_consumption_and_lands_in_stopped() {
        let flow = consuming_flow(faulting);
        let deliveries = stream::iter(vec![delivery(1), delivery(2), delivery(3)]);

        read_loop(Arc::clone(&flow), "inbox".into(), deliveries).await;

        let state = flow.state.lock().await;
        assert_eq!(state.run, RunState::Stopped);
        assert!(state.registrations.is_empty());
        // The deliveries queued behind the faulting one were never dispatched.
        assert_eq!(flow.dispatcher.context.handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_halt_request_stops_consumption_and_lands_in_stopped() {
        let flow = consuming_flow(halting);
        let deliveries = stream::iter(vec![delivery(1), delivery(2)]);

        read_loop(Arc::clone(&flow), "inbox".into(), deliveries).await;

        let state = flow.state.lock().await;
        assert_eq!(state.run, RunState::Stopped);
        assert_eq!(flow.dispatcher.context.handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn an_exhausted_stream_ends_the_loop_without_stopping_the_consumer() {
        let flow = consuming_flow(succeeding);
        let deliveries = stream::iter(vec![delivery(1)]);

        read_loop(Arc::clone(&flow), "inbox".into(), deliveries).await;

        let state = flow.state.lock().await;
        // A cancelled stream only retires its own loop; pause/stop decide what
        // the lifecycle does next.
        assert_eq!(state.run, RunState::Consuming);
        assert!(state.registrations.is_empty());
        assert_eq!(flow.dispatcher.context.handled.load(Ordering::SeqCst), 1);
    }
}
