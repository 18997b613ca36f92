use std::collections::HashMap;

use tokio::time::Instant;

use paceforge_core::Authority;

use crate::worker::OperationWorker;

/// Index of live workers, keyed by authority. Registration order is kept
/// for the scheduler's stable selection tiebreak. Mutated only from the
/// scheduler's context.
#[derive(Default)]
pub(crate) struct OperationRegistry {
    workers: HashMap<Authority, OperationWorker>,
    order: Vec<Authority>,
}

impl OperationRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub(crate) fn contains(&self, authority: &Authority) -> bool {
        self.workers.contains_key(authority)
    }

    pub(crate) fn get(&self, authority: &Authority) -> Option<&OperationWorker> {
        self.workers.get(authority)
    }

    pub(crate) fn insert(&mut self, worker: OperationWorker) {
        let authority = worker.authority().clone();
        debug_assert!(!self.workers.contains_key(&authority));
        self.order.push(authority.clone());
        self.workers.insert(authority, worker);
    }

    /// Removes a worker exactly once; subsequent calls return `None`.
    pub(crate) fn remove(&mut self, authority: &Authority) -> Option<OperationWorker> {
        let worker = self.workers.remove(authority)?;
        self.order.retain(|a| a != authority);
        Some(worker)
    }

    /// Authorities in registration order.
    pub(crate) fn authorities(&self) -> Vec<Authority> {
        self.order.clone()
    }

    /// The resumable worker with the earliest `resume_at`. Iteration in
    /// registration order makes the tiebreak deterministic and stable.
    pub(crate) fn select_resumable(&self) -> Option<Authority> {
        let mut best: Option<(Instant, &Authority)> = None;
        for authority in &self.order {
            let Some(worker) = self.workers.get(authority) else {
                continue;
            };
            if !worker.can_resume() {
                continue;
            }
            let at = worker.resume_at();
            if best.map(|(current, _)| at < current).unwrap_or(true) {
                best = Some((at, authority));
            }
        }
        best.map(|(_, authority)| authority.clone())
    }

    /// The earliest `resume_at` still in the future, across all live
    /// workers; bounds the scheduler's idle sleep.
    pub(crate) fn earliest_future_resume(&self, now: Instant) -> Option<Instant> {
        self.workers
            .values()
            .map(|worker| worker.resume_at())
            .filter(|at| *at > now)
            .min()
    }

    /// `(workers waiting on in-flight I/O, live workers)`; used to split
    /// scheduler wait time between response waits and politeness delays.
    pub(crate) fn wait_profile(&self) -> (usize, usize) {
        let waiting = self
            .workers
            .values()
            .filter(|worker| worker.waiting_for_response())
            .count();
        (waiting, self.workers.len())
    }

    /// Workers whose task terminated without reporting; candidates for
    /// reaping once any pending control events have been drained.
    pub(crate) fn dead_tasks(&self) -> Vec<Authority> {
        self.order
            .iter()
            .filter(|authority| {
                self.workers
                    .get(*authority)
                    .map(|worker| worker.task_finished())
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}
