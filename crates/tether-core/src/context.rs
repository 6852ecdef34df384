//! The asynchronous execution-context boundary.
//!
//! Operations that may take arbitrarily long (scene-graph queries, field
//! observation) never run on the device loop. The router hands them to an
//! [`ExecutionContext`] and returns immediately; the context later reports
//! the outcome through a [`CompletionSender`], which posts a
//! [`ContextCompletion`] into the loop's event channel. That event is the
//! only path by which context results reach loop-owned state.
//!
//! # Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use tether_core::context::{AsyncHandler, SpawnedContext};
//! use tether_core::envelope::Operation;
//! use tether_core::handler::{HandlerOutput, HandlerResult};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl AsyncHandler for Echo {
//!     async fn handle(&self, operation: Operation, _binary: Vec<u8>) -> HandlerResult {
//!         Ok(HandlerOutput::new().with("type", operation.kind().as_str()))
//!     }
//! }
//!
//! # async fn example(manager: tether_core::connection::ConnectionManager) {
//! let context = SpawnedContext::new(Echo, manager.completion_sender());
//! # }
//! ```

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn, Instrument};

use crate::connection::LoopEvent;
use crate::envelope::Operation;
use crate::handler::{HandlerError, HandlerResult};

/// The outcome of an asynchronous operation, correlated by request id.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextCompletion {
    pub id: String,
    pub result: HandlerResult,
}

/// Posts completions back into the device loop. Cheap to clone and safe to
/// move to any task or thread.
#[derive(Debug, Clone)]
pub struct CompletionSender {
    events: mpsc::UnboundedSender<LoopEvent>,
}

impl CompletionSender {
    pub fn new(events: mpsc::UnboundedSender<LoopEvent>) -> Self {
        Self { events }
    }

    /// Report the result for `id`. Returns `false` if the loop has shut down.
    pub fn complete(&self, id: impl Into<String>, result: HandlerResult) -> bool {
        let completion = ContextCompletion {
            id: id.into(),
            result,
        };
        self.events.send(LoopEvent::Completion(completion)).is_ok()
    }
}

/// Accepts asynchronous operations from the router.
///
/// `submit` must not block; the result is reported later through a
/// [`CompletionSender`].
pub trait ExecutionContext: Send {
    fn submit(&mut self, id: String, operation: Operation, binary: Vec<u8>);
}

/// An async operation handler run by [`SpawnedContext`].
#[async_trait]
pub trait AsyncHandler: Send + Sync + 'static {
    async fn handle(&self, operation: Operation, binary: Vec<u8>) -> HandlerResult;
}

/// Runs each submitted operation on its own spawned task.
pub struct SpawnedContext<H> {
    handler: Arc<H>,
    completions: CompletionSender,
}

impl<H: AsyncHandler> SpawnedContext<H> {
    pub fn new(handler: H, completions: CompletionSender) -> Self {
        Self {
            handler: Arc::new(handler),
            completions,
        }
    }
}

impl<H: AsyncHandler> ExecutionContext for SpawnedContext<H> {
    fn submit(&mut self, id: String, operation: Operation, binary: Vec<u8>) {
        let handler = Arc::clone(&self.handler);
        let completions = self.completions.clone();
        let span = tracing::debug_span!("context", id = %id, op = operation.kind().as_str());
        let work = tokio::spawn(
            async move { handler.handle(operation, binary).await }.instrument(span.clone()),
        );
        tokio::spawn(
            async move {
                // The inner task isolates a panicking handler so the request
                // still completes.
                let result = match work.await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => {
                        let message = panic_message(e.into_panic());
                        warn!(%message, "handler panicked");
                        Err(HandlerError::new(format!("handler panicked: {message}")))
                    }
                    Err(e) => Err(HandlerError::new(format!("handler did not finish: {e}"))),
                };
                if !completions.complete(id, result) {
                    debug!("device loop gone; completion dropped");
                }
            }
            .instrument(span),
        );
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".into()
    }
}
