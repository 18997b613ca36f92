use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use paceforge_core::Authority;

use crate::agent::{AgentCommand, FetchPayload, PoliteAgent};
use crate::error::EngineError;

/// A request queued to a worker's I/O task. At most one exists per
/// authority at any instant.
pub(crate) enum IoRequest {
    /// Run a command against the authority's agent.
    Process {
        authority: Authority,
        agent: Arc<PoliteAgent>,
        command: AgentCommand,
    },
    /// Sleep until an absolute instant; converts a pure politeness delay
    /// into a schedulable response without blocking the scheduler.
    Delay { authority: Authority, until: Instant },
}

impl IoRequest {
    pub(crate) fn authority(&self) -> &Authority {
        match self {
            IoRequest::Process { authority, .. } | IoRequest::Delay { authority, .. } => authority,
        }
    }
}

/// Which kind of request produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseKind {
    Processed,
    Delayed,
}

/// What a completed request delivers back into the task.
pub(crate) enum ResponsePayload {
    Fetched(FetchPayload),
    Slept,
}

/// Outcome of one I/O request, correlated back to its worker by
/// authority. Exactly one of the `Ok`/`Err` arms of `outcome` is set.
pub(crate) struct IoResponse {
    pub(crate) authority: Authority,
    pub(crate) kind: ResponseKind,
    pub(crate) outcome: Result<ResponsePayload, EngineError>,
    pub(crate) time_taken: Duration,
    /// Absolute instant before which the originating worker must not be
    /// resumed; may already have passed.
    pub(crate) delay_till: Option<Instant>,
}

/// Executes one request to completion. Runs on the worker's I/O task in
/// threaded mode, or inline on the worker's own context otherwise.
pub(crate) async fn execute_io(request: IoRequest) -> IoResponse {
    match request {
        IoRequest::Process {
            authority,
            agent,
            command,
        } => {
            let started = Instant::now();
            let (result, delay_till) = agent.perform(command).await;
            IoResponse {
                authority,
                kind: ResponseKind::Processed,
                outcome: result.map(ResponsePayload::Fetched),
                time_taken: started.elapsed(),
                delay_till,
            }
        }
        IoRequest::Delay { authority, until } => {
            let started = Instant::now();
            tokio::time::sleep_until(until).await;
            IoResponse {
                authority,
                kind: ResponseKind::Delayed,
                outcome: Ok(ResponsePayload::Slept),
                time_taken: started.elapsed(),
                delay_till: None,
            }
        }
    }
}
