//! Admission control and ordering of backup jobs
//!
//! Every queued or running job is tracked in one table behind a single
//! mutex, so the overlap check and the insertion of a new job happen
//! atomically. Jobs wait in a priority queue (criticality first, then FIFO)
//! until a concurrency slot frees up.

use crate::config::Criticality;
use crate::error::{BackupRecoveryError, BackupRecoveryResult};
use crate::types::{BackupId, BackupJob};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

/// Cooperative cancellation signal checked between pipeline stages
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Unset flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::SeqCst)
    }
}

/// A job cleared to run, with its cancellation flag
#[derive(Debug, Clone)]
pub struct ReadyJob {
    /// Job to execute
    pub job: BackupJob,
    /// Cancellation flag shared with the queue
    pub cancel: CancelFlag,
}

/// Result of asking to cancel a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Removed before it started
    Dequeued,
    /// Running; it stops at its next stage boundary
    Signalled,
    /// Not queued or running
    NotFound,
}

struct ActiveEntry {
    job: BackupJob,
    cancel: CancelFlag,
    running: bool,
}

#[derive(Debug, PartialEq, Eq)]
struct WaitingJob {
    priority: Criticality,
    sequence: u64,
    id: BackupId,
}

impl Ord for WaitingJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher criticality first, then earlier submission
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for WaitingJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueState {
    active: HashMap<BackupId, ActiveEntry>,
    waiting: BinaryHeap<WaitingJob>,
    running: usize,
    sequence: u64,
    closed: bool,
}

/// Bounded-concurrency job queue with component mutual exclusion
pub struct JobQueue {
    max_concurrent: usize,
    state: Mutex<QueueState>,
    idle: Notify,
}

impl JobQueue {
    /// Queue running at most `max_concurrent` jobs
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            state: Mutex::new(QueueState::default()),
            idle: Notify::new(),
        }
    }

    /// Admit a job. Returns it back when it may start immediately, `None`
    /// when it was queued. Fails if any component is covered by a queued or
    /// running job.
    pub fn admit(&self, job: BackupJob) -> BackupRecoveryResult<Option<ReadyJob>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(BackupRecoveryError::Validation {
                message: "backup service is shutting down".to_string(),
            });
        }

        if let Some(entry) = state
            .active
            .values()
            .find(|entry| entry.job.overlaps(&job.components))
        {
            let components = job
                .components
                .iter()
                .filter(|c| entry.job.components.contains(*c))
                .cloned()
                .collect();
            return Err(BackupRecoveryError::Conflict {
                job_id: entry.job.id.to_string(),
                components,
            });
        }

        let cancel = CancelFlag::new();
        let run_now = state.running < self.max_concurrent;
        state.active.insert(
            job.id.clone(),
            ActiveEntry {
                job: job.clone(),
                cancel: cancel.clone(),
                running: run_now,
            },
        );

        if run_now {
            state.running += 1;
            return Ok(Some(ReadyJob { job, cancel }));
        }

        state.sequence += 1;
        let sequence = state.sequence;
        debug!(job_id = %job.id, priority = ?job.priority, "Backup job queued");
        state.waiting.push(WaitingJob {
            priority: job.priority,
            sequence,
            id: job.id,
        });
        Ok(None)
    }

    /// Release a finished job and return the jobs that may start now
    pub fn finish(&self, id: &BackupId) -> Vec<ReadyJob> {
        let mut state = self.state.lock();
        if let Some(entry) = state.active.remove(id) {
            if entry.running {
                state.running = state.running.saturating_sub(1);
            }
        }

        let mut ready = Vec::new();
        while state.running < self.max_concurrent && !state.closed {
            let Some(next) = state.waiting.pop() else {
                break;
            };
            let Some(entry) = state.active.get_mut(&next.id) else {
                continue;
            };
            entry.running = true;
            ready.push(ReadyJob {
                job: entry.job.clone(),
                cancel: entry.cancel.clone(),
            });
            state.running += 1;
        }
        if state.running == 0 {
            self.idle.notify_waiters();
        }
        ready
    }

    /// Wait until no job is running. Jobs admitted while waiting are
    /// waited for as well.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.running_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Cancel a queued or running job
    pub fn cancel(&self, id: &BackupId) -> CancelOutcome {
        let mut state = self.state.lock();
        let Some(entry) = state.active.get(id) else {
            return CancelOutcome::NotFound;
        };
        if entry.running {
            entry.cancel.cancel();
            return CancelOutcome::Signalled;
        }

        state.active.remove(id);
        state.waiting.retain(|w| &w.id != id);
        CancelOutcome::Dequeued
    }

    /// Refuse new jobs and drop everything still waiting. Running jobs are
    /// left to finish. Returns the dropped job IDs.
    pub fn close(&self) -> Vec<BackupId> {
        let mut state = self.state.lock();
        state.closed = true;
        state.waiting.clear();

        let mut dropped = Vec::new();
        state.active.retain(|id, entry| {
            if !entry.running {
                dropped.push(id.clone());
            }
            entry.running
        });
        dropped.sort();
        dropped
    }

    /// Whether `id` is running or waiting
    pub fn is_active(&self, id: &BackupId) -> bool {
        self.state.lock().active.contains_key(id)
    }

    /// Queued and running job IDs
    pub fn active_ids(&self) -> Vec<BackupId> {
        let mut ids: Vec<BackupId> = self.state.lock().active.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of running jobs
    pub fn running_count(&self) -> usize {
        self.state.lock().running
    }

    /// Number of waiting jobs
    pub fn waiting_count(&self) -> usize {
        let state = self.state.lock();
        state.active.len() - state.running
    }
}
