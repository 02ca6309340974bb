//! Running a finalized pipeline on this machine.
//!
//! [`Job::submit`] plans the DAG into processor instances (see
//! [`plan`]) and spreads them round-robin over a fixed pool of worker
//! threads. Each worker gives its instances one turn each in a loop
//! and parks briefly when none of them made progress.
//!
//! The first processor failure cancels the job: every instance stops
//! at its next turn boundary and unfinished state is dropped.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::instrument;

use crate::config::ExecutionConfig;
use crate::errors::{panic_message, ExecutionError, Result};
use crate::pipeline::Dag;

mod plan;
mod tasklet;
mod worker;

use worker::{worker_main, JobState};

/// Handle to a running job.
#[derive(Debug)]
pub struct Job {
    state: Arc<JobState>,
    workers: Vec<JoinHandle<()>>,
}

impl Job {
    /// Start running `dag`. Returns once all workers are started.
    #[instrument(name = "submit", skip_all, fields(transforms = dag.transforms().len()))]
    pub fn submit(dag: &Dag, config: &ExecutionConfig) -> Result<Self> {
        config.validate()?;
        let state = Arc::new(JobState::default());
        let tasklets = plan::plan(dag, config, &state.cancel)?;
        let threads = config.worker_threads.min(tasklets.len()).max(1);
        tracing::info!(
            instances = tasklets.len(),
            workers = threads,
            "starting job"
        );

        let mut assignments: Vec<Vec<_>> = (0..threads).map(|_| Vec::new()).collect();
        for (i, tasklet) in tasklets.into_iter().enumerate() {
            if let Some(assigned) = assignments.get_mut(i % threads) {
                assigned.push(tasklet);
            }
        }

        let mut workers = Vec::with_capacity(threads);
        for (index, tasklets) in assignments.into_iter().enumerate() {
            let worker_state = state.clone();
            let cooldown = config.cooldown();
            let spawned = thread::Builder::new()
                .name(format!("jetflow-worker-{index}"))
                .spawn(move || worker_main(index, tasklets, worker_state, cooldown));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    state.fail(ExecutionError::WorkerPanicked(format!(
                        "could not start worker {index}: {err}"
                    )));
                    break;
                }
            }
        }
        Ok(Self { state, workers })
    }

    /// Ask every processor to stop at its next turn boundary.
    /// [`Job::join`] then reports [`ExecutionError::Cancelled`] unless
    /// the job had already finished.
    pub fn cancel(&self) {
        tracing::info!("cancelling job");
        self.state.cancel_requested.store(true, Ordering::Relaxed);
        self.state.cancel.store(true, Ordering::Relaxed);
        for worker in self.workers.iter() {
            worker.thread().unpark();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.workers.iter().all(JoinHandle::is_finished)
    }

    /// Wait for all workers. Returns the first processor failure, if
    /// any.
    pub fn join(self) -> Result<()> {
        let mut panicked = None;
        for worker in self.workers {
            if let Err(payload) = worker.join() {
                panicked.get_or_insert_with(|| panic_message(payload));
            }
        }
        if let Some(err) = self.state.take_failure() {
            return Err(err.into());
        }
        if let Some(message) = panicked {
            return Err(ExecutionError::WorkerPanicked(message).into());
        }
        if self.state.interrupted.load(Ordering::Relaxed)
            && self.state.cancel_requested.load(Ordering::Relaxed)
        {
            return Err(ExecutionError::Cancelled.into());
        }
        tracing::info!("job finished");
        Ok(())
    }
}
