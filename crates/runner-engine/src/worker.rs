use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

use paceforge_core::Authority;

use crate::request::{execute_io, IoRequest, IoResponse};
use crate::util::lock_unpoisoned;

/// The value a worker's next resume will deliver. The start token is a
/// tagged variant, never a magic value: it is consumed exactly once, by
/// the first resume.
pub(crate) enum PendingResume {
    /// First resume: start the task body.
    Start,
    /// Deliver a completed response.
    Ready(IoResponse),
}

/// What the scheduler pushes down a worker's resume channel.
pub(crate) enum ResumeSignal {
    /// Begin executing the task body.
    Start,
    /// The response for the outstanding request.
    Response(IoResponse),
    /// Unwind: the scheduler is tearing this operation down.
    Abort,
}

/// Events a task sends up to the scheduler. These are the only way a
/// task returns control; the scheduler blocks on them after every resume.
pub(crate) enum ControlEvent {
    /// The task queued a request and suspended.
    Suspended(Authority),
    /// The task body returned (or failed) and will not run again.
    Finished(Authority, anyhow::Result<()>),
}

/// The three fields that cross the worker-task/scheduler boundary. One
/// mutex covers all three; every critical section is a handful of loads
/// and stores.
pub(crate) struct WorkerShared {
    pub(crate) response: Option<PendingResume>,
    pub(crate) waiting_for_response: bool,
    pub(crate) resume_at: Instant,
}

/// Stores a completed response on the worker and computes its next resume
/// time. `resume_at` never moves below now: a `delay_till` in the past
/// resumes immediately, a future one defers resumption.
pub(crate) fn save_thread_response(shared: &Mutex<WorkerShared>, response: IoResponse) {
    let now = Instant::now();
    let mut state = lock_unpoisoned(shared);
    if !state.waiting_for_response {
        // Late response from an I/O task whose authority was re-registered.
        warn!(authority = %response.authority, "dropping response for worker with no request in flight");
        return;
    }
    state.waiting_for_response = false;
    state.resume_at = match response.delay_till {
        Some(till) if till > now => till,
        _ => now,
    };
    state.response = Some(PendingResume::Ready(response));
}

/// Everything the scheduler holds for one live authority.
pub(crate) struct OperationWorker {
    authority: Authority,
    shared: Arc<Mutex<WorkerShared>>,
    resume_tx: mpsc::Sender<ResumeSignal>,
    io_tx: Option<mpsc::Sender<IoRequest>>,
    io_join: Option<JoinHandle<()>>,
    task_join: JoinHandle<()>,
}

impl OperationWorker {
    pub(crate) fn new(
        authority: Authority,
        shared: Arc<Mutex<WorkerShared>>,
        resume_tx: mpsc::Sender<ResumeSignal>,
        io_tx: Option<mpsc::Sender<IoRequest>>,
        io_join: Option<JoinHandle<()>>,
        task_join: JoinHandle<()>,
    ) -> Self {
        Self {
            authority,
            shared,
            resume_tx,
            io_tx,
            io_join,
            task_join,
        }
    }

    pub(crate) fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Resumable means the task is alive and a response (or the start
    /// token) is waiting to be delivered.
    pub(crate) fn can_resume(&self) -> bool {
        !self.task_join.is_finished() && lock_unpoisoned(&self.shared).response.is_some()
    }

    pub(crate) fn resume_at(&self) -> Instant {
        lock_unpoisoned(&self.shared).resume_at
    }

    pub(crate) fn waiting_for_response(&self) -> bool {
        lock_unpoisoned(&self.shared).waiting_for_response
    }

    pub(crate) fn task_finished(&self) -> bool {
        self.task_join.is_finished()
    }

    /// Takes the pending resume value; the caller delivers it through the
    /// resume channel.
    pub(crate) fn take_response(&self) -> Option<PendingResume> {
        lock_unpoisoned(&self.shared).response.take()
    }

    /// Stores a completion routed here by the scheduler.
    pub(crate) fn store_response(&self, response: IoResponse) {
        save_thread_response(&self.shared, response);
    }

    pub(crate) fn resume_sender(&self) -> mpsc::Sender<ResumeSignal> {
        self.resume_tx.clone()
    }

    /// Best-effort abort token for a task that is still alive; never
    /// blocks. Returns false when the task is gone or not receiving.
    pub(crate) fn send_abort(&self) -> bool {
        !self.task_join.is_finished() && self.resume_tx.try_send(ResumeSignal::Abort).is_ok()
    }

    /// Kills the task outright; used only after the abort token and the
    /// grace period have both been exhausted.
    pub(crate) fn abort_task(&self) {
        self.task_join.abort();
    }

    /// Tears the worker down: closes the request queue and joins the I/O
    /// task with a bounded wait (off the scheduler's context).
    pub(crate) fn close(mut self, grace: Duration) {
        self.io_tx = None;
        if let Some(join) = self.io_join.take() {
            let authority = self.authority.clone();
            let abort = join.abort_handle();
            tokio::spawn(async move {
                if tokio::time::timeout(grace, join).await.is_err() {
                    warn!(authority = %authority, "I/O task did not exit within grace period; aborting it");
                    abort.abort();
                }
            });
        }
    }
}

/// Body of a worker's dedicated I/O task: execute queued requests one at
/// a time and push each outcome onto the scheduler's shared completion
/// channel. Exits when the request queue closes.
pub(crate) async fn run_io_task(
    mut requests: mpsc::Receiver<IoRequest>,
    completions: mpsc::UnboundedSender<IoResponse>,
) {
    while let Some(request) = requests.recv().await {
        let response = execute_io(request).await;
        if completions.send(response).is_err() {
            // Scheduler is gone; nothing left to report to.
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{ResponseKind, ResponsePayload};

    fn response(authority: &Authority, delay_till: Option<Instant>) -> IoResponse {
        IoResponse {
            authority: authority.clone(),
            kind: ResponseKind::Delayed,
            outcome: Ok(ResponsePayload::Slept),
            time_taken: Duration::from_millis(1),
            delay_till,
        }
    }

    #[tokio::test]
    async fn save_clears_waiting_and_floors_resume_at_now() {
        let authority = Authority::new("a");
        let shared = Mutex::new(WorkerShared {
            response: None,
            waiting_for_response: true,
            resume_at: Instant::now(),
        });

        let stale = Instant::now()
            .checked_sub(Duration::from_secs(5))
            .unwrap_or_else(Instant::now);
        let before = Instant::now();
        save_thread_response(&shared, response(&authority, Some(stale)));

        let state = lock_unpoisoned(&shared);
        assert!(!state.waiting_for_response);
        assert!(state.response.is_some());
        assert!(state.resume_at >= before);
    }

    #[tokio::test]
    async fn future_delay_till_defers_resumption() {
        let authority = Authority::new("a");
        let shared = Mutex::new(WorkerShared {
            response: None,
            waiting_for_response: true,
            resume_at: Instant::now(),
        });

        let till = Instant::now() + Duration::from_secs(30);
        save_thread_response(&shared, response(&authority, Some(till)));
        assert_eq!(lock_unpoisoned(&shared).resume_at, till);
    }

    #[tokio::test]
    async fn unexpected_response_is_dropped_not_stored() {
        let authority = Authority::new("a");
        let shared = Mutex::new(WorkerShared {
            response: None,
            waiting_for_response: false,
            resume_at: Instant::now(),
        });

        save_thread_response(&shared, response(&authority, None));
        assert!(lock_unpoisoned(&shared).response.is_none());
    }
}
