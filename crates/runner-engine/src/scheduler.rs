use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use paceforge_core::Authority;

use crate::agent::{AgentCommand, FetchPayload, PoliteAgent};
use crate::api::{format_duration, RunStats, SchedulerConfig};
use crate::context::OperationContext;
use crate::error::EngineError;
use crate::registry::OperationRegistry;
use crate::request::{execute_io, IoRequest, IoResponse, ResponsePayload};
use crate::worker::{
    run_io_task, ControlEvent, OperationWorker, PendingResume, ResumeSignal, WorkerShared,
};

/// Runs one agent command outside any registered operation, for tests and
/// direct callers. The politeness wait, if any, is slept inline.
pub async fn execute_inline(
    agent: &Arc<PoliteAgent>,
    command: AgentCommand,
) -> Result<FetchPayload, EngineError> {
    if let Some(until) = agent.next_allowed_at() {
        tokio::time::sleep_until(until).await;
    }
    let request = IoRequest::Process {
        authority: agent.authority().clone(),
        agent: Arc::clone(agent),
        command,
    };
    match execute_io(request).await.outcome? {
        ResponsePayload::Fetched(payload) => Ok(payload),
        ResponsePayload::Slept => Err(EngineError::Protocol(
            "delay response delivered for a process request",
        )),
    }
}

/// The hybrid cooperative/parallel engine: multiplexes every authority's
/// task on one context, with one dedicated I/O task per live worker, so a
/// worker's mandatory inter-request delay is spent servicing another
/// worker's ready response.
pub struct Scheduler {
    config: SchedulerConfig,
    registry: OperationRegistry,
    completion_tx: mpsc::UnboundedSender<IoResponse>,
    completion_rx: mpsc::UnboundedReceiver<IoResponse>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    control_rx: mpsc::UnboundedReceiver<ControlEvent>,
    exceptions: HashMap<Authority, anyhow::Error>,
    stats: RunStats,
    stop: Arc<AtomicBool>,
    next_seq: u64,
    stagger_base: Instant,
}

impl Scheduler {
    /// Creates a scheduler with the given configuration.
    pub fn new(config: SchedulerConfig) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            config,
            registry: OperationRegistry::new(),
            completion_tx,
            completion_rx,
            control_tx,
            control_rx,
            exceptions: HashMap::new(),
            stats: RunStats::default(),
            stop: Arc::new(AtomicBool::new(false)),
            next_seq: 0,
            stagger_base: Instant::now(),
        }
    }

    /// Idempotent teardown and re-initialization: aborts any live
    /// workers, drains the channels, clears the registry and exceptions,
    /// and reloads configuration from the environment.
    pub async fn reset(&mut self) {
        self.shutdown_all().await;
        *self = Scheduler::new(SchedulerConfig::from_env());
    }

    /// The configuration this scheduler runs with.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Cooperative stop flag; setting it makes the run resume each live
    /// worker once with an abort token and wind down.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Errors captured so far, keyed by authority.
    pub fn exceptions(&self) -> &HashMap<Authority, anyhow::Error> {
        &self.exceptions
    }

    /// Aggregate counters for the runs performed so far.
    pub fn stats(&self) -> RunStats {
        self.stats
    }

    /// Number of live workers.
    pub fn live_workers(&self) -> usize {
        self.registry.len()
    }

    /// Registers one authority's task body and its worker.
    ///
    /// New workers receive staggered initial resume times (≥ 1 ms apart)
    /// so no two share an initial slot. If the live-worker count reaches
    /// `max_workers`, the caller becomes the scheduler: this call only
    /// returns once the whole batch has drained.
    pub async fn register_operation<F, Fut>(
        &mut self,
        authority: Authority,
        body: F,
    ) -> anyhow::Result<()>
    where
        F: FnOnce(OperationContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.registry.contains(&authority) {
            anyhow::bail!("authority {authority} is already registered");
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let resume_at = self.stagger_base + Duration::from_millis(seq);

        let (resume_tx, resume_rx) = mpsc::channel(1);
        let (io_tx, io_join) = if self.config.threaded {
            let (tx, rx) = mpsc::channel(1);
            let join = tokio::spawn(run_io_task(rx, self.completion_tx.clone()));
            (Some(tx), Some(join))
        } else {
            (None, None)
        };

        let shared = Arc::new(Mutex::new(WorkerShared {
            response: Some(PendingResume::Start),
            waiting_for_response: false,
            resume_at,
        }));

        let context = OperationContext::new(
            authority.clone(),
            Arc::clone(&shared),
            io_tx.clone(),
            resume_rx,
            self.control_tx.clone(),
        );
        let control_tx = self.control_tx.clone();
        let task_authority = authority.clone();
        let task_join = tokio::spawn(async move {
            let mut context = context;
            if !context.wait_for_start().await {
                let _ = control_tx.send(ControlEvent::Finished(
                    task_authority,
                    Err(EngineError::Aborted.into()),
                ));
                return;
            }
            let result = body(context).await;
            let _ = control_tx.send(ControlEvent::Finished(task_authority, result));
        });

        debug!(
            authority = %authority,
            seq,
            threaded = self.config.threaded,
            "registered operation"
        );
        self.registry.insert(OperationWorker::new(
            authority,
            shared,
            resume_tx,
            io_tx,
            io_join,
            task_join,
        ));

        if self.registry.len() >= self.config.max_workers {
            debug!(
                live = self.registry.len(),
                max = self.config.max_workers,
                "worker limit reached; running scheduler to drain the batch"
            );
            self.run_operations().await;
        }
        Ok(())
    }

    /// The main loop: drains completions, resumes the earliest-ready
    /// worker, and repeats until every registered task has terminated.
    /// Returns the per-authority exceptions captured so far.
    pub async fn run_operations(&mut self) -> &HashMap<Authority, anyhow::Error> {
        if self.registry.is_empty() {
            return &self.exceptions;
        }

        let started = Instant::now();
        let watchdog = self.spawn_watchdog();
        self.run_loop().await;
        watchdog.abort();

        let total = started.elapsed();
        let total_s = total.as_secs_f64().max(f64::EPSILON);
        info!(
            resumes = self.stats.resume_count,
            total = %format_duration(total),
            delay_wait_pct =
                %format!("{:.1}", 100.0 * self.stats.wait_delay.as_secs_f64() / total_s),
            response_wait_pct =
                %format!("{:.1}", 100.0 * self.stats.wait_response.as_secs_f64() / total_s),
            "run complete"
        );
        &self.exceptions
    }

    async fn run_loop(&mut self) {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                self.shutdown_all().await;
            }
            self.drain_completions();
            self.drain_control();
            self.reap_dead_tasks();
            if self.registry.is_empty() {
                break;
            }

            let now = Instant::now();
            match self.registry.select_resumable() {
                None => {
                    let delay = match self.registry.earliest_future_resume(now) {
                        Some(at) => (at - now).min(self.config.poll_period),
                        None => self.config.poll_period,
                    };
                    self.attributed_sleep(delay).await;
                }
                Some(authority) => {
                    let resume_at = match self.registry.get(&authority) {
                        Some(worker) => worker.resume_at(),
                        None => continue,
                    };
                    if resume_at > now {
                        // Sleep at most one poll period, then re-select: a
                        // completion landing mid-wait can make an earlier
                        // worker eligible.
                        self.attributed_sleep((resume_at - now).min(self.config.poll_period))
                            .await;
                        continue;
                    }
                    self.resume_worker(authority).await;
                }
            }
        }
    }

    /// Non-blocking drain of the shared completion channel. Responses are
    /// attached to their owning worker; a response with no owner is
    /// logged and dropped.
    fn drain_completions(&mut self) {
        while let Ok(response) = self.completion_rx.try_recv() {
            debug!(
                authority = %response.authority,
                kind = ?response.kind,
                took_ms = response.time_taken.as_millis() as u64,
                "request completed"
            );
            match self.registry.get(&response.authority) {
                Some(worker) => worker.store_response(response),
                None => {
                    warn!(authority = %response.authority, "dropping response for unregistered worker")
                }
            }
        }
    }

    /// Non-blocking drain of the control channel; picks up finish reports
    /// that arrived outside a resume (abort paths, shutdown).
    fn drain_control(&mut self) {
        while let Ok(event) = self.control_rx.try_recv() {
            self.handle_control(event);
        }
    }

    fn handle_control(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Suspended(authority) => {
                warn!(authority = %authority, "unexpected suspension outside a resume");
            }
            ControlEvent::Finished(authority, result) => self.finish_worker(authority, result),
        }
    }

    /// Reaps workers whose task terminated without reporting (a panic in
    /// the body). Candidates are gathered first and the control channel
    /// drained after, so a normally-finished task is never misreported.
    fn reap_dead_tasks(&mut self) {
        let candidates = self.registry.dead_tasks();
        if candidates.is_empty() {
            return;
        }
        self.drain_control();
        for authority in candidates {
            if self.registry.contains(&authority) {
                warn!(authority = %authority, "task terminated without reporting; reaping");
                self.finish_worker(
                    authority.clone(),
                    Err(anyhow::anyhow!(
                        "task for {authority} terminated without reporting (panicked?)"
                    )),
                );
            }
        }
    }

    /// Delivers a worker's pending response and blocks until that worker
    /// suspends again or finishes. Other tasks cannot run meanwhile, so
    /// the control events seen here belong to the resumed worker.
    async fn resume_worker(&mut self, authority: Authority) {
        let (signal, resume_tx) = {
            let Some(worker) = self.registry.get(&authority) else {
                return;
            };
            let Some(pending) = worker.take_response() else {
                return;
            };
            let signal = match pending {
                PendingResume::Start => ResumeSignal::Start,
                PendingResume::Ready(response) => ResumeSignal::Response(response),
            };
            (signal, worker.resume_sender())
        };

        self.stats.resume_count += 1;
        if resume_tx.send(signal).await.is_err() {
            self.finish_worker(
                authority.clone(),
                Err(anyhow::anyhow!(
                    "task for {authority} dropped its resume channel"
                )),
            );
            return;
        }

        let mut ticker = tokio::time::interval(Duration::from_millis(50));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        enum Waited {
            Control(Option<ControlEvent>),
            Tick,
        }

        loop {
            let waited = {
                let control_rx = &mut self.control_rx;
                tokio::select! {
                    event = control_rx.recv() => Waited::Control(event),
                    _ = ticker.tick() => Waited::Tick,
                }
            };

            match waited {
                Waited::Control(Some(ControlEvent::Suspended(suspended))) => {
                    if suspended == authority {
                        break;
                    }
                    warn!(authority = %suspended, "suspension from a worker that was not resumed");
                }
                Waited::Control(Some(ControlEvent::Finished(finished, result))) => {
                    let was_resumed = finished == authority;
                    self.finish_worker(finished, result);
                    if was_resumed {
                        break;
                    }
                }
                Waited::Control(None) => break,
                Waited::Tick => {
                    let gone = self
                        .registry
                        .get(&authority)
                        .map(|worker| worker.task_finished())
                        .unwrap_or(true);
                    if gone {
                        self.drain_control();
                        if self.registry.contains(&authority) {
                            self.finish_worker(
                                authority.clone(),
                                Err(anyhow::anyhow!(
                                    "task for {authority} terminated without reporting (panicked?)"
                                )),
                            );
                        }
                        break;
                    }
                }
            }
        }
    }

    /// Records the task's outcome and deregisters its worker. Called
    /// exactly once per worker: removal makes later calls no-ops.
    fn finish_worker(&mut self, authority: Authority, result: anyhow::Result<()>) {
        if !self.registry.contains(&authority) {
            return;
        }
        match &result {
            Ok(()) => debug!(authority = %authority, "operation finished"),
            Err(err) => {
                debug!(authority = %authority, error = %format!("{err:#}"), "operation failed");
            }
        }
        if let Err(err) = result {
            self.exceptions.insert(authority.clone(), err);
        }
        self.close_worker(&authority);
    }

    fn close_worker(&mut self, authority: &Authority) {
        if let Some(worker) = self.registry.remove(authority) {
            worker.close(self.config.shutdown_grace);
        }
    }

    /// Sleeps `delay`, splitting it between the politeness-delay and
    /// response-wait totals in proportion to what the live workers are
    /// actually waiting on.
    async fn attributed_sleep(&mut self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        let (io_waiting, live) = self.registry.wait_profile();
        tokio::time::sleep(delay).await;
        if live == 0 {
            return;
        }
        let io_fraction = io_waiting as f64 / live as f64;
        self.stats.wait_response += delay.mul_f64(io_fraction);
        self.stats.wait_delay += delay.mul_f64(1.0 - io_fraction);
    }

    /// Resumes every live worker once with an abort token, waits out the
    /// grace period for their finish reports, then force-closes whatever
    /// is left.
    async fn shutdown_all(&mut self) {
        if self.registry.is_empty() {
            return;
        }
        info!(live = self.registry.len(), "shutting down live workers");

        for authority in self.registry.authorities() {
            if let Some(worker) = self.registry.get(&authority) {
                worker.send_abort();
            }
        }

        let deadline = Instant::now() + self.config.shutdown_grace;
        while !self.registry.is_empty() {
            let event = tokio::time::timeout_at(deadline, self.control_rx.recv()).await;
            match event {
                Ok(Some(event)) => self.handle_control(event),
                Ok(None) | Err(_) => break,
            }
        }

        for authority in self.registry.authorities() {
            warn!(authority = %authority, "force-closing worker that ignored the abort token");
            if !self.exceptions.contains_key(&authority) {
                self.exceptions
                    .insert(authority.clone(), EngineError::Aborted.into());
            }
            if let Some(worker) = self.registry.get(&authority) {
                worker.abort_task();
            }
            self.close_worker(&authority);
        }
        self.drain_completions();
    }

    /// The global timeout watchdog: once armed, it terminates the whole
    /// process with exit code 124 when the run overruns.
    fn spawn_watchdog(&self) -> tokio::task::JoinHandle<()> {
        let timeout = self.config.run_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            error!(
                "run timed out after {}; terminating process",
                format_duration(timeout)
            );
            std::process::exit(124);
        })
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.registry.is_empty() {
            warn!(
                live = self.registry.len(),
                "scheduler dropped with live workers; their tasks will be detached"
            );
        }
    }
}
