//! The `Handler` trait is heavily inspired by `tide`'s approach to endpoint handlers.
use crate::message::Message;
use std::future::Future;
use std::sync::Arc;

/// The signals a handler can raise instead of returning normally.
///
/// Each signal has a defined broker disposition (see [`decide`]); anything the
/// handler did not anticipate travels as [`Signal::Fault`], which the
/// `#[from]` conversion lets you produce with plain `?` on any error that
/// converts into `anyhow::Error`.
///
/// [`decide`]: crate::disposition::decide
#[derive(thiserror::Error, Debug)]
pub enum Signal {
    /// Processing should be retried later: the message is returned to the queue.
    #[error("the handler asked for the message to be returned to the queue")]
    Requeue,
    /// The message should be discarded without requeueing.
    #[error("the handler asked for the message to be discarded")]
    Discard,
    /// Consumption should stop entirely.
    #[error("the handler asked for consumption to halt")]
    Halt,
    /// An unanticipated failure: treated as potentially systemic, it returns
    /// all in-flight unacknowledged work to the queue and halts consumption.
    #[error("the handler failed unexpectedly")]
    Fault(#[from] anyhow::Error),
}

/// A decoded message enriched with auxiliary data, ready for processing.
///
/// `Incoming` is the input type of message handlers.
pub struct Incoming<'m, C> {
    /// `context` is a set of resources that outlive the lifecycle of a single
    /// message - e.g. an HTTP client for a third-party API, a db connection
    /// pool, etc. It is behind an `Arc` pointer so multiple messages can share
    /// it across task boundaries.
    pub context: Arc<C>,
    /// The decoded, validated message.
    pub message: &'m Message,
    /// The name of the queue the message was pulled from.
    pub queue_name: &'m str,
}

/// Implementers of the `Handler` trait process messages pulled from a queue.
///
/// # Scope
///
/// `handle` does not get access to the underlying AMQP channel.
/// The protocol layer takes care of acking/nacking the message with the broker
/// according to the outcome of processing: a normal return means success,
/// every other disposition is requested through a [`Signal`].
/// This decouples the low-level interactions with the message broker from the
/// business logic associated with the processing of a message.
///
/// # Implementors
///
/// While you can implement `Handler` for a struct or enum, most of the time
/// you will rely on the blanket support for async functions with a matching
/// signature, via [`ClosureHandler`].
#[async_trait::async_trait]
pub trait Handler<Context>: Send + Sync + 'static {
    async fn handle(&self, incoming: Incoming<'_, Context>) -> Result<(), Signal>;
}

/// Implement the [`Handler`] trait for all Boxed handlers.
///
/// E.g. Box<dyn Handler<Context>>.
#[async_trait::async_trait]
impl<Context, H> Handler<Context> for Box<H>
where
    Context: Send + Sync + 'static,
    H: Handler<Context> + ?Sized,
{
    async fn handle(&self, incoming: Incoming<'_, Context>) -> Result<(), Signal> {
        H::handle(self, incoming).await
    }
}

/// `AsyncClosure` is implemented for all functions of the form:
/// ```ignore
/// async fn(incoming: Incoming<'_, Context>) -> Result<(), impl Into<Signal>>;
/// ```
///
/// When combined with the [`ClosureHandler`] type, you get a [`Handler`] out
/// of a plain async function.
pub trait AsyncClosure<'a, Context>: Send + Sync + 'static {
    type Output: Future<Output = Result<(), Self::Err>> + Send + 'a;
    type Err: Into<Signal> + 'static;
    fn call(&'a self, incoming: Incoming<'a, Context>) -> Self::Output;
}

/// Implement `AsyncClosure` for all functions that match the required signature.
impl<'a, F, Fut, Err, Context> AsyncClosure<'a, Context> for F
where
    Context: 'static,
    F: Send + Sync + 'static,
    F: Fn(Incoming<'a, Context>) -> Fut,
    Fut: Future<Output = Result<(), Err>> + Send + 'a,
    Err: Into<Signal> + 'static,
{
    type Err = Err;
    type Output = Fut;

    fn call(&'a self, incoming: Incoming<'a, Context>) -> Self::Output {
        // `self`, in this case, is a function, which we are calling on its
        // argument using parenthesis notation - self(_)
        (self)(incoming)
    }
}

/// Wrapper type to turn an [`AsyncClosure`] into a [`Handler`].
pub struct ClosureHandler<H>(pub H);

/// Implement the [`Handler`] trait for all [`ClosureHandler`]s that match the
/// expected signature.
///
/// Handlers are not required to produce a [`Signal`] directly - it is enough
/// for them to return an error type that converts into one.
#[async_trait::async_trait]
impl<Context, F> Handler<Context> for ClosureHandler<F>
where
    Context: Send + Sync + 'static,
    F: for<'a> AsyncClosure<'a, Context>,
{
    async fn handle(&self, incoming: Incoming<'_, Context>) -> Result<(), Signal> {
        self.0.call(incoming).await.map_err(|e| e.into())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    async fn handler(_incoming: Incoming<'_, ()>) -> Result<(), Signal> {
        Ok(())
    }

    // This asserts that the implementation of Handler for Box<dyn Handler>
    // calls down the chain and does not recurse.
    #[tokio::test]
    async fn test_boxed_handler() {
        let handler: Box<dyn Handler<()>> = Box::new(ClosureHandler(handler));
        check(handler).await;
    }

    async fn check(h: impl Handler<()>) {
        let message = Message::new("test.topic", b"payload".to_vec());
        let incoming = Incoming {
            context: Arc::new(()),
            message: &message,
            queue_name: "inbox",
        };
        assert!(h.handle(incoming).await.is_ok());
    }

    #[tokio::test]
    async fn arbitrary_errors_surface_as_faults() {
        async fn failing(_incoming: Incoming<'_, ()>) -> Result<(), Signal> {
            Err(anyhow::anyhow!("boom"))?;
            Ok(())
        }

        let message = Message::new("test.topic", b"payload".to_vec());
        let incoming = Incoming {
            context: Arc::new(()),
            message: &message,
            queue_name: "inbox",
        };

        let outcome = ClosureHandler(failing).handle(incoming).await;
        assert!(matches!(outcome, Err(Signal::Fault(_))));
    }
}
