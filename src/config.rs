//! Tuning knobs for running a job.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigurationError;

fn default_worker_threads() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

fn default_parallelism() -> usize {
    2
}

fn default_inbox_batch_size() -> usize {
    64
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_outbox_capacity() -> usize {
    256
}

fn default_cooldown_ms() -> u64 {
    1
}

/// How a job is executed on this machine.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```
/// let config = jetflow::config::ExecutionConfig::from_json(r#"{"worker_threads": 2}"#).unwrap();
/// assert_eq!(config.worker_threads, 2);
/// assert_eq!(config.default_parallelism, 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Threads the processor instances are spread over.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Instances per vertex, unless the transform sets its own local
    /// parallelism.
    #[serde(default = "default_parallelism")]
    pub default_parallelism: usize,
    /// Most records handed to one `process` call.
    #[serde(default = "default_inbox_batch_size")]
    pub inbox_batch_size: usize,
    /// Messages buffered per channel between two instances.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Records an outbox holds per target before refusing more.
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
    /// How long an idle worker parks before polling again.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            default_parallelism: default_parallelism(),
            inbox_batch_size: default_inbox_batch_size(),
            queue_capacity: default_queue_capacity(),
            outbox_capacity: default_outbox_capacity(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

impl ExecutionConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigurationError> {
        let config: Self =
            serde_json::from_str(json).map_err(|err| ConfigurationError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn with_default_parallelism(mut self, parallelism: usize) -> Self {
        self.default_parallelism = parallelism;
        self
    }

    pub fn with_inbox_batch_size(mut self, size: usize) -> Self {
        self.inbox_batch_size = size;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity;
        self
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    /// All sizes must be at least 1. A cooldown of 0 is allowed and
    /// makes idle workers spin.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let fields = [
            ("worker_threads", self.worker_threads),
            ("default_parallelism", self.default_parallelism),
            ("inbox_batch_size", self.inbox_batch_size),
            ("queue_capacity", self.queue_capacity),
            ("outbox_capacity", self.outbox_capacity),
        ];
        match fields.iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(ConfigurationError::Config(format!(
                "{name} must be at least 1"
            ))),
            None => Ok(()),
        }
    }
}
