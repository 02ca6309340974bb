//! Worker threads of the cooperative scheduler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::instrument;

use super::tasklet::{ProcessorTasklet, Progress};
use crate::errors::ExecutionError;

/// Shared between the job handle and its workers.
#[derive(Debug, Default)]
pub(crate) struct JobState {
    /// Observed by every processor through its context.
    pub(crate) cancel: Arc<AtomicBool>,
    /// The user asked for cancellation.
    pub(crate) cancel_requested: AtomicBool,
    /// Some worker stopped with unfinished tasklets.
    pub(crate) interrupted: AtomicBool,
    failure: Mutex<Option<ExecutionError>>,
}

impl JobState {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Record a failure and stop the job. Only the first failure is
    /// kept.
    pub(crate) fn fail(&self, err: ExecutionError) {
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        if failure.is_none() {
            tracing::error!(%err, "job failed");
            *failure = Some(err);
        } else {
            tracing::debug!(%err, "further failure after the job failed");
        }
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub(crate) fn take_failure(&self) -> Option<ExecutionError> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Give every tasklet one turn. Returns whether any made progress.
fn step(tasklets: &mut Vec<ProcessorTasklet>, state: &JobState) -> bool {
    let mut progress = false;
    tasklets.retain_mut(|tasklet| {
        if state.is_cancelled() {
            return true;
        }
        match tasklet.call() {
            Ok(Progress::Made) => {
                progress = true;
                true
            }
            Ok(Progress::Idle) => true,
            Ok(Progress::Done) => {
                progress = true;
                false
            }
            Err(err) => {
                state.fail(err);
                false
            }
        }
    });
    progress
}

/// Main loop of a worker thread: run tasklets round-robin until all
/// are done or the job is cancelled, parking for `cooldown` after a
/// pass without progress.
#[instrument(name = "worker_main", skip_all, fields(worker = index))]
pub(crate) fn worker_main(
    index: usize,
    mut tasklets: Vec<ProcessorTasklet>,
    state: Arc<JobState>,
    cooldown: Duration,
) {
    tracing::info!(tasklets = tasklets.len(), "worker start");
    while !tasklets.is_empty() {
        if state.is_cancelled() {
            state.interrupted.store(true, Ordering::Relaxed);
            tracing::info!(unfinished = tasklets.len(), "worker cancelled");
            break;
        }
        let progress = tracing::debug_span!("step").in_scope(|| step(&mut tasklets, &state));
        if !progress {
            thread::park_timeout(cooldown);
        }
    }
    tracing::info!("worker stop");
}
