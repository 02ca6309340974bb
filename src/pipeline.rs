//! The transform graph.
//!
//! A [`Pipeline`] is mutated while stages are declared, one thread at
//! a time, and turned into an immutable [`Dag`] by
//! [`Pipeline::finalize`]. Transforms can only name transforms that
//! are already registered as their upstream, so the graph is acyclic
//! by construction; finalize checks it anyway.

use std::cell::{Ref, RefCell, RefMut};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use serde::Serialize;

use crate::config::ExecutionConfig;
use crate::connectors::{Sink, Source};
use crate::edge::{DataTransferStrategy, Edge};
use crate::errors::{ArityError, ConfigurationError, Error, GraphError, Result};
use crate::execution::Job;
use crate::item::Data;
use crate::routing::ProcessingStrategy;
use crate::stage::Stage;
use crate::transform::{Transform, TransformId, TransformKind};

/// What may hang off a transform.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Downstream {
    /// Sinks: nothing may be attached.
    Terminal,
    FanOut(Vec<TransformId>),
}

/// Registry of all transforms of a pipeline and the edges between
/// them.
#[derive(Default)]
pub struct TransformGraph {
    /// In registration order.
    transforms: Vec<Transform>,
    positions: HashMap<TransformId, usize>,
    downstream: HashMap<TransformId, Downstream>,
    /// Inbound edges per destination, in ordinal order.
    inbound: HashMap<TransformId, Vec<Edge>>,
    next_id: usize,
    name_counts: HashMap<String, usize>,
    /// First error hit by a builder call that can't return one.
    deferred: Option<Error>,
}

impl TransformGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> TransformId {
        let id = TransformId(self.next_id);
        self.next_id += 1;
        id
    }

    /// `base`, or `base-2`, `base-3`... if that name is taken.
    pub fn unique_name(&mut self, base: &str) -> String {
        let count = self.name_counts.entry(base.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            base.to_string()
        } else {
            format!("{base}-{count}")
        }
    }

    /// Add a node. A `downstream_capacity` of 0 makes it terminal:
    /// connecting anything after it fails.
    pub fn register(
        &mut self,
        transform: Transform,
        downstream_capacity: usize,
    ) -> Result<TransformId, GraphError> {
        let id = transform.id();
        if self.positions.contains_key(&id) {
            return Err(GraphError::DuplicateRegistration {
                id,
                name: transform.name().to_string(),
            });
        }
        let downstream = if downstream_capacity == 0 {
            Downstream::Terminal
        } else {
            Downstream::FanOut(Vec::with_capacity(downstream_capacity))
        };
        tracing::trace!(%id, name = transform.name(), kind = ?transform.kind(), "registering transform");
        self.positions.insert(id, self.transforms.len());
        self.downstream.insert(id, downstream);
        self.inbound.insert(id, Vec::new());
        self.transforms.push(transform);
        Ok(id)
    }

    /// Connect with a default edge.
    pub fn connect(&mut self, from: TransformId, to: TransformId) -> Result<(), GraphError> {
        self.connect_edge(Edge::between(from, to))
    }

    /// Add an edge. It gets the next free ordinal of its destination
    /// and is frozen.
    pub fn connect_edge(&mut self, mut edge: Edge) -> Result<(), GraphError> {
        let (from, to) = (edge.from(), edge.to());
        if !self.positions.contains_key(&from) || !self.positions.contains_key(&to) {
            return Err(GraphError::DanglingUpstream { from, to });
        }
        match self.downstream.get_mut(&from) {
            Some(Downstream::FanOut(list)) => list.push(to),
            _ => {
                return Err(GraphError::TerminalTransform {
                    name: self.name_of(from),
                })
            }
        }
        let inbound = self.inbound.entry(to).or_default();
        edge.freeze(inbound.len());
        inbound.push(edge);
        Ok(())
    }

    fn name_of(&self, id: TransformId) -> String {
        self.transform(id)
            .map(|t| t.name().to_string())
            .unwrap_or_else(|| id.to_string())
    }

    pub fn transform(&self, id: TransformId) -> Option<&Transform> {
        self.positions
            .get(&id)
            .and_then(|pos| self.transforms.get(*pos))
    }

    pub(crate) fn transform_mut(&mut self, id: TransformId) -> Option<&mut Transform> {
        let pos = *self.positions.get(&id)?;
        self.transforms.get_mut(pos)
    }

    /// The inbound edge of `to` with the given ordinal.
    pub fn edge(&self, to: TransformId, ordinal: usize) -> Option<&Edge> {
        self.inbound.get(&to)?.get(ordinal)
    }

    pub fn downstream_of(&self, id: TransformId) -> &[TransformId] {
        match self.downstream.get(&id) {
            Some(Downstream::FanOut(list)) => list,
            _ => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    /// Keep the first error for [`TransformGraph::finalize`].
    pub(crate) fn defer(&mut self, err: impl Into<Error>) {
        let err = err.into();
        tracing::debug!(%err, "deferring pipeline error to finalize");
        self.deferred.get_or_insert(err);
    }

    /// Validate the graph and produce the immutable DAG.
    ///
    /// Transforms come out in topological order; ties are broken by
    /// registration order, so the order is stable between runs.
    pub fn finalize(&self) -> Result<Dag> {
        if let Some(err) = &self.deferred {
            return Err(err.clone());
        }

        let mut in_degree: HashMap<TransformId, usize> = self
            .transforms
            .iter()
            .map(|t| (t.id(), self.inbound.get(&t.id()).map_or(0, Vec::len)))
            .collect();
        let mut ready: BinaryHeap<Reverse<usize>> = self
            .transforms
            .iter()
            .enumerate()
            .filter(|(_, t)| in_degree.get(&t.id()) == Some(&0))
            .map(|(pos, _)| Reverse(pos))
            .collect();
        let mut order = Vec::with_capacity(self.transforms.len());
        while let Some(Reverse(pos)) = ready.pop() {
            let transform = &self.transforms[pos];
            order.push(transform.clone());
            for next in self.downstream_of(transform.id()) {
                if let Some(degree) = in_degree.get_mut(next) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse(self.positions[next]));
                    }
                }
            }
        }
        if order.len() < self.transforms.len() {
            let stuck = self
                .transforms
                .iter()
                .find(|t| in_degree.get(&t.id()).map_or(false, |d| *d > 0))
                .map(|t| t.name().to_string())
                .unwrap_or_default();
            return Err(GraphError::Cycle { name: stuck }.into());
        }

        for transform in order.iter() {
            let inbound = self.inbound.get(&transform.id()).map_or(0, Vec::len);
            if let Some(accumulators) = transform.accumulate_count() {
                if inbound > accumulators {
                    return Err(ArityError {
                        operation: transform.name().to_string(),
                        inbound,
                        accumulators,
                    }
                    .into());
                }
            }
            if transform.local_parallelism() == Some(0) {
                return Err(ConfigurationError::InvalidParallelism {
                    name: transform.name().to_string(),
                }
                .into());
            }
            if transform.kind() == TransformKind::Aggregate {
                if let Some(requested) = transform.local_parallelism().filter(|p| *p != 1) {
                    return Err(ConfigurationError::SingleInstance {
                        name: transform.name().to_string(),
                        requested,
                    }
                    .into());
                }
            }
        }

        let edges = order
            .iter()
            .flat_map(|t| self.inbound.get(&t.id()).into_iter().flatten().cloned())
            .collect();
        tracing::debug!(transforms = order.len(), "pipeline finalized");
        Ok(Dag {
            transforms: order,
            edges,
        })
    }
}

impl fmt::Debug for TransformGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformGraph")
            .field("transforms", &self.transforms)
            .field("inbound", &self.inbound)
            .finish_non_exhaustive()
    }
}

/// Finalized, immutable graph of a pipeline.
#[derive(Debug, Clone)]
pub struct Dag {
    transforms: Vec<Transform>,
    edges: Vec<Edge>,
}

#[derive(Serialize)]
struct VertexDescription<'a> {
    id: TransformId,
    name: &'a str,
    kind: TransformKind,
    local_parallelism: Option<usize>,
}

#[derive(Serialize)]
struct EdgeDescription<'a> {
    name: &'a str,
    from: TransformId,
    to: TransformId,
    ordinal: usize,
    processing: ProcessingStrategy,
    shuffled: bool,
    data_transfer: Option<DataTransferStrategy>,
}

#[derive(Serialize)]
struct DagDescription<'a> {
    vertices: Vec<VertexDescription<'a>>,
    edges: Vec<EdgeDescription<'a>>,
}

impl Dag {
    /// In topological order.
    pub fn transforms(&self) -> &[Transform] {
        &self.transforms
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn transform(&self, id: TransformId) -> Option<&Transform> {
        self.transforms.iter().find(|t| t.id() == id)
    }

    /// Edges into `to`, by ordinal.
    pub fn inbound(&self, to: TransformId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.to() == to)
    }

    pub fn outbound(&self, from: TransformId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.from() == from)
    }

    /// Describe vertices and edges as JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        let description = DagDescription {
            vertices: self
                .transforms
                .iter()
                .map(|t| VertexDescription {
                    id: t.id(),
                    name: t.name(),
                    kind: t.kind(),
                    local_parallelism: t.local_parallelism(),
                })
                .collect(),
            edges: self
                .edges
                .iter()
                .map(|e| EdgeDescription {
                    name: e.name(),
                    from: e.from(),
                    to: e.to(),
                    ordinal: e.ordinal(),
                    processing: e.processing(),
                    shuffled: e.is_shuffled(),
                    data_transfer: e.data_transfer(),
                })
                .collect(),
        };
        serde_json::to_string_pretty(&description)
    }
}

/// Handle to the graph being built. Cheap to clone; every stage holds
/// one.
#[derive(Clone, Default)]
pub struct Pipeline(Rc<RefCell<TransformGraph>>);

impl Pipeline {
    pub fn create() -> Self {
        Self::default()
    }

    pub(crate) fn graph(&self) -> Ref<'_, TransformGraph> {
        self.0.borrow()
    }

    pub(crate) fn graph_mut(&self) -> RefMut<'_, TransformGraph> {
        self.0.borrow_mut()
    }

    /// Start a stage reading from `source`.
    pub fn read_from<T: Data>(&self, source: impl Source<T> + 'static) -> Stage<T> {
        Stage::from_source(self.clone(), Arc::new(source))
    }

    /// The inbound edge of `to` with the given ordinal.
    pub fn edge(&self, to: TransformId, ordinal: usize) -> Option<Edge> {
        self.graph().edge(to, ordinal).cloned()
    }

    pub fn finalize(&self) -> Result<Dag> {
        self.graph().finalize()
    }

    /// Finalize and start running.
    pub fn submit(&self, config: &ExecutionConfig) -> Result<Job> {
        let dag = self.finalize()?;
        Job::submit(&dag, config)
    }

    /// Finalize, run and wait for the job to finish.
    pub fn run(&self, config: &ExecutionConfig) -> Result<()> {
        self.submit(config)?.join()
    }

    /// Drain several stages into one sink transform.
    pub fn drain_all<T: Data>(
        &self,
        sink: impl Sink<T> + 'static,
        stages: &[&Stage<T>],
    ) -> TransformId {
        crate::stage::drain(self, Arc::new(sink), stages.iter().map(|s| s.input()).collect())
    }

    pub fn len(&self) -> usize {
        self.graph().len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph().is_empty()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.borrow().fmt(f)
    }
}
