//! Directed connections between transforms.
//!
//! An [`Edge`] is configured with builder calls and then handed to
//! the pipeline, which freezes it. Any later attempt to reconfigure
//! it fails with [`EdgeFrozenError`].

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::{EdgeFrozenError, ExecutionError, RoutingError};
use crate::item::Item;
use crate::routing::{
    default_hashing, default_partitioning, HashingStrategy, KeyFn, PartitionKey,
    PartitioningStrategy, ProcessingStrategy, Router,
};
use crate::transform::TransformId;

/// Restricts a distributed edge to a single target member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShufflingStrategy {
    pub address: String,
}

impl ShufflingStrategy {
    pub fn to_member(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

/// How records are handed over on a local edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataTransferStrategy {
    ByReference,
    ByValue,
}

#[derive(Clone)]
pub struct Edge {
    name: String,
    from: TransformId,
    to: TransformId,
    shuffled: bool,
    processing: ProcessingStrategy,
    partitioning: Arc<dyn PartitioningStrategy>,
    hashing: Arc<dyn HashingStrategy>,
    shuffling: Option<ShufflingStrategy>,
    data_transfer: Option<DataTransferStrategy>,
    key_fn: Option<KeyFn>,
    ordinal: usize,
    frozen: bool,
}

impl Edge {
    /// An unshuffled round-robin edge with the default partitioning
    /// and hashing strategies.
    pub fn between(from: TransformId, to: TransformId) -> Self {
        Self {
            name: format!("{from}->{to}"),
            from,
            to,
            shuffled: false,
            processing: ProcessingStrategy::RoundRobin,
            partitioning: default_partitioning(),
            hashing: default_hashing(),
            shuffling: None,
            data_transfer: None,
            key_fn: None,
            ordinal: 0,
            frozen: false,
        }
    }

    fn ensure_mutable(&self) -> Result<(), EdgeFrozenError> {
        if self.frozen {
            Err(EdgeFrozenError {
                name: self.name.clone(),
            })
        } else {
            Ok(())
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Result<Self, EdgeFrozenError> {
        self.ensure_mutable()?;
        self.name = name.into();
        Ok(self)
    }

    /// Let records cross members.
    pub fn shuffled(mut self) -> Result<Self, EdgeFrozenError> {
        self.ensure_mutable()?;
        self.shuffled = true;
        Ok(self)
    }

    /// Let records cross members, but only towards the member picked
    /// by `strategy`.
    pub fn shuffled_with(mut self, strategy: ShufflingStrategy) -> Result<Self, EdgeFrozenError> {
        self.ensure_mutable()?;
        self.shuffled = true;
        self.shuffling = Some(strategy);
        Ok(self)
    }

    pub fn broadcast(mut self) -> Result<Self, EdgeFrozenError> {
        self.ensure_mutable()?;
        self.processing = ProcessingStrategy::Broadcast;
        Ok(self)
    }

    /// Partition by the record itself, with the default strategies.
    pub fn partitioned(mut self) -> Result<Self, EdgeFrozenError> {
        self.ensure_mutable()?;
        self.processing = ProcessingStrategy::Partitioning;
        Ok(self)
    }

    pub fn partitioned_by(mut self, key_fn: KeyFn) -> Result<Self, EdgeFrozenError> {
        self.ensure_mutable()?;
        self.processing = ProcessingStrategy::Partitioning;
        self.key_fn = Some(key_fn);
        Ok(self)
    }

    /// Partition every record under one constant key, so they all
    /// meet at a single instance of the destination.
    pub fn all_to_one(self) -> Result<Self, EdgeFrozenError> {
        self.partitioned_by(Arc::new(
            |_: &Item| -> Result<PartitionKey, ExecutionError> { Ok(PartitionKey::from("all")) },
        ))
    }

    pub fn partitioned_with_strategy(
        mut self,
        key_fn: KeyFn,
        partitioning: Arc<dyn PartitioningStrategy>,
    ) -> Result<Self, EdgeFrozenError> {
        self.ensure_mutable()?;
        self.processing = ProcessingStrategy::Partitioning;
        self.key_fn = Some(key_fn);
        self.partitioning = partitioning;
        Ok(self)
    }

    pub fn partitioned_with(
        mut self,
        key_fn: KeyFn,
        partitioning: Arc<dyn PartitioningStrategy>,
        hashing: Arc<dyn HashingStrategy>,
    ) -> Result<Self, EdgeFrozenError> {
        self.ensure_mutable()?;
        self.processing = ProcessingStrategy::Partitioning;
        self.key_fn = Some(key_fn);
        self.partitioning = partitioning;
        self.hashing = hashing;
        Ok(self)
    }

    pub fn with_data_transfer(
        mut self,
        strategy: DataTransferStrategy,
    ) -> Result<Self, EdgeFrozenError> {
        self.ensure_mutable()?;
        self.data_transfer = Some(strategy);
        Ok(self)
    }

    pub(crate) fn freeze(&mut self, ordinal: usize) {
        self.ordinal = ordinal;
        self.frozen = true;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn from(&self) -> TransformId {
        self.from
    }

    pub fn to(&self) -> TransformId {
        self.to
    }

    /// Position of this edge among the inbound edges of its
    /// destination. Only meaningful once frozen.
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn is_shuffled(&self) -> bool {
        self.shuffled
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn processing(&self) -> ProcessingStrategy {
        self.processing
    }

    pub fn partitioning(&self) -> &Arc<dyn PartitioningStrategy> {
        &self.partitioning
    }

    pub fn hashing(&self) -> &Arc<dyn HashingStrategy> {
        &self.hashing
    }

    pub fn shuffling(&self) -> Option<&ShufflingStrategy> {
        self.shuffling.as_ref()
    }

    pub fn data_transfer(&self) -> Option<DataTransferStrategy> {
        self.data_transfer
    }

    pub fn key_fn(&self) -> Option<&KeyFn> {
        self.key_fn.as_ref()
    }

    /// Router for one sending instance of this edge.
    pub fn router(&self, parallelism: usize) -> Result<Router, RoutingError> {
        Router::new(
            self.name.clone(),
            self.processing,
            parallelism,
            self.key_fn.clone(),
            self.partitioning.clone(),
            self.hashing.clone(),
        )
    }
}

/// Partitioning and hashing strategies compare by concrete type,
/// shuffling strategies by value. The data transfer strategy and the
/// key function don't take part.
impl PartialEq for Edge {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.from == other.from
            && self.to == other.to
            && self.shuffled == other.shuffled
            && self.processing == other.processing
            && self.hashing.strategy_type() == other.hashing.strategy_type()
            && self.partitioning.strategy_type() == other.partitioning.strategy_type()
            && self.shuffling == other.shuffling
    }
}

impl Eq for Edge {}

impl Hash for Edge {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.from.hash(state);
        self.to.hash(state);
        self.shuffled.hash(state);
        self.processing.hash(state);
        self.hashing.strategy_type().hash(state);
        self.partitioning.strategy_type().hash(state);
        self.shuffling.hash(state);
    }
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Edge")
            .field("name", &self.name)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("ordinal", &self.ordinal)
            .field("shuffled", &self.shuffled)
            .field("processing", &self.processing)
            .field("partitioning", &self.partitioning)
            .field("hashing", &self.hashing)
            .field("shuffling", &self.shuffling)
            .field("data_transfer", &self.data_transfer)
            .field("frozen", &self.frozen)
            .finish()
    }
}
