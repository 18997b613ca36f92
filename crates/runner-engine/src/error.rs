use paceforge_core::Authority;

/// Errors surfaced to authority task bodies by the engine.
///
/// A task may catch a `Transport` error, log it and continue; anything
/// else indicates the engine is tearing the operation down and should be
/// propagated.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// The HTTP request failed at the transport level.
    #[error("transport error for {authority}: {message}")]
    Transport {
        /// Authority whose request failed.
        authority: Authority,
        /// Human-readable failure description.
        message: String,
    },
    /// The HTTP client could not be constructed.
    #[error("agent construction failed: {0}")]
    Build(String),
    /// The operation was resumed with an abort token; the task should
    /// unwind so its cleanup runs.
    #[error("operation aborted by the scheduler")]
    Aborted,
    /// A worker channel closed while a request was outstanding.
    #[error("worker channel closed unexpectedly")]
    ChannelClosed,
    /// The engine handed a task a value that violates its own protocol.
    #[error("engine protocol violation: {0}")]
    Protocol(&'static str),
}

impl EngineError {
    /// True when the task was cancelled rather than failed.
    pub fn is_aborted(&self) -> bool {
        matches!(self, EngineError::Aborted)
    }
}
