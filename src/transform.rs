//! Nodes of the transform graph.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::processor::{Processor, ProcessorContext};

/// Identity of a transform within one pipeline.
///
/// Allocated by the pipeline, so two transforms that happen to carry
/// the same name and upstream list are still distinct nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransformId(pub(crate) usize);

impl fmt::Display for TransformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    Source,
    Map,
    Filter,
    FlatMap,
    Peek,
    Custom,
    Timestamp,
    Group,
    CoGroup,
    WindowGroup,
    Aggregate,
    HashJoin,
    Sink,
}

/// Creates one processor instance per call.
pub type ProcessorSupplier =
    Arc<dyn Fn(&ProcessorContext) -> Box<dyn Processor> + Send + Sync>;

/// A named node in the pipeline's graph.
///
/// Built by the stage layer and immutable once registered, apart
/// from its local parallelism which may be tuned until the pipeline
/// is finalized.
#[derive(Clone)]
pub struct Transform {
    id: TransformId,
    name: String,
    kind: TransformKind,
    upstream: Vec<TransformId>,
    local_parallelism: Option<usize>,
    accumulate_count: Option<usize>,
    supplier: ProcessorSupplier,
}

impl Transform {
    pub fn new(
        id: TransformId,
        name: impl Into<String>,
        kind: TransformKind,
        upstream: Vec<TransformId>,
        supplier: ProcessorSupplier,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            upstream,
            local_parallelism: None,
            accumulate_count: None,
            supplier,
        }
    }

    /// Fix the number of processor instances instead of taking the
    /// configured default.
    pub fn with_local_parallelism(mut self, parallelism: usize) -> Self {
        self.local_parallelism = Some(parallelism);
        self
    }

    /// Number of accumulate functions of the aggregate operation this
    /// transform runs. The pipeline refuses to finalize if more edges
    /// flow in than there are functions.
    pub fn with_accumulate_count(mut self, count: usize) -> Self {
        self.accumulate_count = Some(count);
        self
    }

    pub fn id(&self) -> TransformId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TransformKind {
        self.kind
    }

    pub fn upstream(&self) -> &[TransformId] {
        &self.upstream
    }

    pub fn local_parallelism(&self) -> Option<usize> {
        self.local_parallelism
    }

    pub(crate) fn set_local_parallelism(&mut self, parallelism: usize) {
        self.local_parallelism = Some(parallelism);
    }

    pub fn accumulate_count(&self) -> Option<usize> {
        self.accumulate_count
    }

    pub fn create_processor(&self, context: &ProcessorContext) -> Box<dyn Processor> {
        (self.supplier)(context)
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transform")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("upstream", &self.upstream)
            .field("local_parallelism", &self.local_parallelism)
            .field("accumulate_count", &self.accumulate_count)
            .finish_non_exhaustive()
    }
}
