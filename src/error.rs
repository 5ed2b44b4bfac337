//! Errors reported by future handles and synchronization primitives.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Errors produced when operating on future handles.
///
/// Contract violations on the locking primitives (such as unlocking a mutex that is not locked) are not represented here: those are
/// programmer errors and fail with a panic instead of being reported as a value.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The handle was default-constructed and has no associated computation.
    #[error("future has no associated computation")]
    NoState,
    /// Timed waits are part of the handle surface but are intentionally not implemented.
    #[error("timed waits are not implemented")]
    TimedWaitUnsupported,
    /// The computation panicked. The payload is retained and delivered identically to every retriever.
    #[error("computation panicked: {0}")]
    Panicked(PanicPayload),
}

/// A shared, re-deliverable panic payload captured from a failed computation.
///
/// A payload raised inside a computation is caught at the computation's finishing point and stored alongside where its value would have
/// gone. Every subsequent retrieval observes the same payload; retrieving it does not consume it.
#[derive(Clone)]
pub struct PanicPayload(Arc<dyn Any + Send + 'static>);

impl PanicPayload {
    pub(crate) fn new(payload: Box<dyn Any + Send + 'static>) -> PanicPayload {
        PanicPayload(Arc::from(payload))
    }

    /// Gets the panic message if the payload was a string, as payloads produced by the `panic!` macro are.
    pub fn message(&self) -> &str {
        if let Some(msg) = self.0.downcast_ref::<&'static str>() {
            msg
        } else if let Some(msg) = self.0.downcast_ref::<String>() {
            msg
        } else {
            "non-string panic payload"
        }
    }

    /// Gets the raw payload for downcasting to a concrete type.
    pub fn payload(&self) -> &(dyn Any + Send + 'static) {
        &*self.0
    }
}

impl fmt::Display for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl fmt::Debug for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PanicPayload").field(&self.message()).finish()
    }
}
