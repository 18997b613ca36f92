use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use paceforge_core::Authority;

use crate::agent::{AgentCommand, FetchPayload, PoliteAgent};
use crate::error::EngineError;
use crate::request::{execute_io, IoRequest, ResponsePayload};
use crate::util::lock_unpoisoned;
use crate::worker::{save_thread_response, ControlEvent, PendingResume, ResumeSignal, WorkerShared};

/// The execution handle given to an authority's task body.
///
/// A task suspends only inside [`execute`](Self::execute) and the
/// [`pause`](Self::pause) family, nowhere else. Everything between
/// suspensions (record assembly, validation, logging) runs to completion
/// before the scheduler considers another worker.
pub struct OperationContext {
    authority: Authority,
    shared: Arc<Mutex<WorkerShared>>,
    io_tx: Option<mpsc::Sender<IoRequest>>,
    resume_rx: mpsc::Receiver<ResumeSignal>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
}

impl OperationContext {
    pub(crate) fn new(
        authority: Authority,
        shared: Arc<Mutex<WorkerShared>>,
        io_tx: Option<mpsc::Sender<IoRequest>>,
        resume_rx: mpsc::Receiver<ResumeSignal>,
        control_tx: mpsc::UnboundedSender<ControlEvent>,
    ) -> Self {
        Self {
            authority,
            shared,
            io_tx,
            resume_rx,
            control_tx,
        }
    }

    /// The authority this task scrapes.
    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Blocks until the scheduler delivers the start token. Returns false
    /// when the operation was aborted before it ever ran.
    pub(crate) async fn wait_for_start(&mut self) -> bool {
        matches!(self.resume_rx.recv().await, Some(ResumeSignal::Start))
    }

    /// Runs one agent command, honouring the agent's politeness deadline
    /// first: any remaining wait becomes a schedulable delay so other
    /// workers run during it.
    pub async fn execute(
        &mut self,
        agent: &Arc<PoliteAgent>,
        command: AgentCommand,
    ) -> Result<FetchPayload, EngineError> {
        if let Some(until) = agent.next_allowed_at() {
            if until > Instant::now() {
                self.pause_until(until).await?;
            }
        }

        let request = IoRequest::Process {
            authority: self.authority.clone(),
            agent: Arc::clone(agent),
            command,
        };
        match self.dispatch(request).await? {
            ResponsePayload::Fetched(payload) => Ok(payload),
            ResponsePayload::Slept => Err(EngineError::Protocol(
                "delay response delivered for a process request",
            )),
        }
    }

    /// Suspends this task for `delay` while the scheduler services other
    /// workers.
    pub async fn pause(&mut self, delay: Duration) -> Result<(), EngineError> {
        self.pause_until(Instant::now() + delay).await
    }

    /// Suspends this task until `until` while the scheduler services
    /// other workers.
    pub async fn pause_until(&mut self, until: Instant) -> Result<(), EngineError> {
        let request = IoRequest::Delay {
            authority: self.authority.clone(),
            until,
        };
        match self.dispatch(request).await? {
            ResponsePayload::Slept => Ok(()),
            ResponsePayload::Fetched(_) => Err(EngineError::Protocol(
                "process response delivered for a delay request",
            )),
        }
    }

    /// Submits a request and waits for its response.
    ///
    /// Threaded mode queues the request to the worker's I/O task, reports
    /// the suspension, and parks on the resume channel; the scheduler
    /// alone decides when the stored response comes back. Non-threaded
    /// mode executes inline on this context, runs the response through
    /// the same save path, and returns directly without suspending; the
    /// shared completion channel is never touched.
    async fn dispatch(&mut self, request: IoRequest) -> Result<ResponsePayload, EngineError> {
        {
            let mut state = lock_unpoisoned(&self.shared);
            assert!(
                !state.waiting_for_response,
                "request issued for {} while another is in flight",
                request.authority()
            );
            state.waiting_for_response = true;
            state.response = None;
        }

        match self.io_tx.clone() {
            Some(io_tx) => {
                if io_tx.send(request).await.is_err() {
                    lock_unpoisoned(&self.shared).waiting_for_response = false;
                    return Err(EngineError::ChannelClosed);
                }
                let _ = self
                    .control_tx
                    .send(ControlEvent::Suspended(self.authority.clone()));

                match self.resume_rx.recv().await {
                    Some(ResumeSignal::Response(response)) => response.outcome,
                    Some(ResumeSignal::Abort) | None => Err(EngineError::Aborted),
                    Some(ResumeSignal::Start) => {
                        Err(EngineError::Protocol("start token delivered twice"))
                    }
                }
            }
            None => {
                let response = execute_io(request).await;
                save_thread_response(&self.shared, response);
                match lock_unpoisoned(&self.shared).response.take() {
                    Some(PendingResume::Ready(response)) => response.outcome,
                    _ => Err(EngineError::Protocol("inline response was not stored")),
                }
            }
        }
    }
}
