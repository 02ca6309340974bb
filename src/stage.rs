//! Fluent, typed view over the transform graph.
//!
//! Every [`Stage`] is a handle to one transform plus the
//! [`FunctionAdapter`] that says how its records look on the wire.
//! Calling an operation on a stage registers a new transform
//! downstream of it and returns the stage for that transform; the
//! user functions passed in are wrapped by the adapter on the way.
//!
//! Operations that can be rejected while building (aggregating an
//! unbounded stage, windowing a stage without timestamps, arity
//! mismatches) return a [`Result`]. Everything else returns the new
//! stage directly, and any graph error is reported by
//! [`Pipeline::finalize`].

use std::fmt::Display;
use std::marker::PhantomData;
use std::panic::Location;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::adapter::{FlatMapFn, FunctionAdapter, ItemKeyFn, ItemTimestampFn};
use crate::aggregate::{
    AggregateOperation, AggregateOperation1, AggregateOperation2, AggregateOperation3, Tag,
};
use crate::connectors::{Sink, Source};
use crate::edge::Edge;
use crate::errors::{ArityError, ConfigurationError, EdgeFrozenError, ExecutionError, Result};
use crate::item::{Data, Item, Key};
use crate::pipeline::Pipeline;
use crate::processor::aggregate::{AggregateP, GroupP};
use crate::processor::connector::{SinkP, SourceP};
use crate::processor::join::{HashJoinP, JoinOutputFn, JoinTable, KeyedTable, ProjectFn};
use crate::processor::transform::{PeekFn, PeekP, TransformP};
use crate::processor::window::{InsertWatermarksP, WindowGroupP};
use crate::processor::{Processor, ProcessorContext};
use crate::routing::KeyFn;
use crate::transform::{ProcessorSupplier, Transform, TransformId, TransformKind};
use crate::window::{
    TimestampDefinition, WatermarkPolicySupplier, WindowDefinition, WindowResult,
};

/// How an input edge of a new vertex routes records.
enum Input {
    /// Stay on the sending instance's side, round-robin.
    Local,
    /// Everything to the single instance of the vertex.
    AllToOne,
    Partitioned(KeyFn),
    Broadcast,
}

impl Input {
    fn edge(self, from: TransformId, to: TransformId) -> Result<Edge, EdgeFrozenError> {
        let edge = Edge::between(from, to);
        match self {
            Self::Local => Ok(edge),
            Self::AllToOne => edge.all_to_one()?.shuffled(),
            Self::Partitioned(key_fn) => edge.partitioned_by(key_fn)?.shuffled(),
            Self::Broadcast => edge.broadcast()?.shuffled(),
        }
    }
}

fn supplier<P, F>(create: F) -> ProcessorSupplier
where
    P: Processor + 'static,
    F: Fn(&ProcessorContext) -> P + Send + Sync + 'static,
{
    Arc::new(move |context: &ProcessorContext| -> Box<dyn Processor> {
        Box::new(create(context))
    })
}

/// A transform about to be added to the graph.
struct Vertex {
    name: String,
    kind: TransformKind,
    inputs: Vec<(TransformId, Input)>,
    supplier: ProcessorSupplier,
    terminal: bool,
    local_parallelism: Option<usize>,
    accumulate_count: Option<usize>,
}

impl Vertex {
    fn new(name: impl Into<String>, kind: TransformKind, supplier: ProcessorSupplier) -> Self {
        Self {
            name: name.into(),
            kind,
            inputs: Vec::new(),
            supplier,
            terminal: false,
            local_parallelism: None,
            accumulate_count: None,
        }
    }

    fn input(mut self, from: TransformId, input: Input) -> Self {
        self.inputs.push((from, input));
        self
    }

    fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }

    fn local_parallelism(mut self, parallelism: Option<usize>) -> Self {
        self.local_parallelism = parallelism;
        self
    }

    fn accumulate_count(mut self, count: usize) -> Self {
        self.accumulate_count = Some(count);
        self
    }

    /// Register the transform and connect its inputs, in ordinal
    /// order.
    fn add_to(self, pipeline: &Pipeline) -> TransformId {
        let mut graph = pipeline.graph_mut();
        let id = graph.next_id();
        let name = graph.unique_name(&self.name);
        let upstream = self.inputs.iter().map(|(from, _)| *from).collect();
        let mut transform = Transform::new(id, name, self.kind, upstream, self.supplier);
        if let Some(parallelism) = self.local_parallelism {
            transform = transform.with_local_parallelism(parallelism);
        }
        if let Some(count) = self.accumulate_count {
            transform = transform.with_accumulate_count(count);
        }
        let capacity = if self.terminal { 0 } else { 1 };
        if let Err(err) = graph.register(transform, capacity) {
            graph.defer(err);
            return id;
        }
        for (from, input) in self.inputs {
            match input.edge(from, id) {
                Ok(edge) => {
                    if let Err(err) = graph.connect_edge(edge) {
                        graph.defer(err);
                    }
                }
                Err(err) => graph.defer(err),
            }
        }
        id
    }
}

/// A stage of a pipeline producing records of type `T`.
pub struct Stage<T> {
    pipeline: Pipeline,
    transform: TransformId,
    adapter: FunctionAdapter,
    bounded: bool,
    _type: PhantomData<fn() -> T>,
}

impl<T> Clone for Stage<T> {
    fn clone(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
            transform: self.transform,
            adapter: self.adapter,
            bounded: self.bounded,
            _type: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Stage<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("transform", &self.transform)
            .field("adapter", &self.adapter)
            .field("bounded", &self.bounded)
            .finish()
    }
}

impl<T: Data> Stage<T> {
    fn new(pipeline: Pipeline, transform: TransformId, adapter: FunctionAdapter, bounded: bool) -> Self {
        Self {
            pipeline,
            transform,
            adapter,
            bounded,
            _type: PhantomData,
        }
    }

    pub(crate) fn from_source(pipeline: Pipeline, source: Arc<dyn Source<T>>) -> Self {
        let bounded = source.is_bounded();
        let vertex = Vertex::new(source.name(), TransformKind::Source, {
            let source = source.clone();
            supplier(move |_: &ProcessorContext| SourceP::new(source.clone()))
        })
        .local_parallelism(source.local_parallelism());
        let id = vertex.add_to(&pipeline);
        Self::new(pipeline, id, FunctionAdapter::Raw, bounded)
    }

    fn derive<R: Data>(&self, transform: TransformId, adapter: FunctionAdapter) -> Stage<R> {
        Stage::new(self.pipeline.clone(), transform, adapter, self.bounded)
    }

    /// The transform this stage stands for.
    pub fn transform(&self) -> TransformId {
        self.transform
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn adapter(&self) -> FunctionAdapter {
        self.adapter
    }

    pub fn is_bounded(&self) -> bool {
        self.bounded
    }

    pub fn name(&self) -> String {
        self.pipeline
            .graph()
            .transform(self.transform)
            .map(|t| t.name().to_string())
            .unwrap_or_default()
    }

    /// Run this stage's transform with exactly this many instances.
    /// A global aggregation only runs on one instance; asking for more
    /// makes [`Pipeline::finalize`] fail.
    pub fn set_local_parallelism(self, parallelism: usize) -> Self {
        if let Some(transform) = self.pipeline.graph_mut().transform_mut(self.transform) {
            transform.set_local_parallelism(parallelism);
        }
        self
    }

    fn stateless<R: Data>(&self, name: &str, kind: TransformKind, f: FlatMapFn) -> Stage<R> {
        let id = Vertex::new(
            name,
            kind,
            supplier(move |_: &ProcessorContext| TransformP::new(f.clone())),
        )
        .input(self.transform, Input::Local)
        .add_to(&self.pipeline);
        self.derive(id, self.adapter)
    }

    pub fn map<R: Data>(&self, f: impl Fn(T) -> R + Send + Sync + 'static) -> Stage<R> {
        self.stateless("map", TransformKind::Map, self.adapter.adapt_map(f))
    }

    /// Like [`Stage::map`], but an error fails the job. The failure
    /// names the location of this call.
    #[track_caller]
    pub fn try_map<R, E>(&self, f: impl Fn(T) -> Result<R, E> + Send + Sync + 'static) -> Stage<R>
    where
        R: Data,
        E: Display,
    {
        let f = self.adapter.adapt_try_map(Location::caller(), f);
        self.stateless("map", TransformKind::Map, f)
    }

    pub fn filter(&self, f: impl Fn(&T) -> bool + Send + Sync + 'static) -> Stage<T> {
        self.stateless("filter", TransformKind::Filter, self.adapter.adapt_filter(f))
    }

    pub fn flat_map<R, I>(&self, f: impl Fn(T) -> I + Send + Sync + 'static) -> Stage<R>
    where
        R: Data,
        I: IntoIterator<Item = R>,
    {
        self.stateless("flat-map", TransformKind::FlatMap, self.adapter.adapt_flat_map(f))
    }

    /// Log the records for which `should_log` holds, formatted with
    /// `to_string`, and pass every record on unchanged.
    pub fn peek(
        &self,
        should_log: impl Fn(&T) -> bool + Send + Sync + 'static,
        to_string: impl Fn(&T) -> String + Send + Sync + 'static,
    ) -> Stage<T> {
        let adapter = self.adapter;
        let format: PeekFn = Arc::new(
            move |item: &Item| -> Result<Option<String>, ExecutionError> {
                let value = adapter.unwrap_ref::<T>(item)?;
                Ok(should_log(value).then(|| to_string(value)))
            },
        );
        let id = Vertex::new(
            "peek",
            TransformKind::Peek,
            supplier(move |_: &ProcessorContext| PeekP::new(format.clone())),
        )
        .input(self.transform, Input::Local)
        .add_to(&self.pipeline);
        self.derive(id, self.adapter)
    }

    /// Attach a hand-written processor. It sees records in this
    /// stage's representation and must emit records of type `R` in the
    /// same representation.
    pub fn custom_transform<R, P>(
        &self,
        name: &str,
        create: impl Fn(&ProcessorContext) -> P + Send + Sync + 'static,
    ) -> Stage<R>
    where
        R: Data,
        P: Processor + 'static,
    {
        let id = Vertex::new(name, TransformKind::Custom, supplier(create))
            .input(self.transform, Input::Local)
            .add_to(&self.pipeline);
        self.derive(id, self.adapter)
    }

    /// Attach event time. Downstream stages see the same `T`, but
    /// records travel in event envelopes and watermarks flow with
    /// them.
    pub fn timestamp(
        &self,
        timestamp_fn: impl Fn(&T) -> DateTime<Utc> + Send + Sync + 'static,
        policy: WatermarkPolicySupplier,
    ) -> Stage<T> {
        self.timestamp_with(TimestampDefinition::new(timestamp_fn, policy))
    }

    pub fn timestamp_with(&self, def: TimestampDefinition<T>) -> Stage<T> {
        let upstream = self.adapter;
        let id = Vertex::new(
            "timestamp",
            TransformKind::Timestamp,
            supplier(move |_: &ProcessorContext| InsertWatermarksP::new(def.clone(), upstream)),
        )
        .input(self.transform, Input::Local)
        .add_to(&self.pipeline);
        self.derive(id, FunctionAdapter::Timestamped)
    }

    pub fn grouping_key<K: Key>(
        &self,
        key_fn: impl Fn(&T) -> K + Send + Sync + 'static,
    ) -> GroupedStage<T, K> {
        GroupedStage {
            stage: self.clone(),
            key_fn: Arc::new(key_fn),
        }
    }

    /// Window the whole stream, without grouping.
    pub fn window(&self, def: WindowDefinition) -> WindowedStage<T, ()> {
        self.grouping_key(|_: &T| ()).window(def)
    }

    fn require_bounded(&self, operation: &str) -> Result<(), ConfigurationError> {
        if self.bounded {
            Ok(())
        } else {
            Err(ConfigurationError::UnboundedAggregation {
                operation: operation.to_string(),
            })
        }
    }

    /// Aggregate every record into a single result.
    pub fn aggregate<A, R>(&self, op: AggregateOperation1<T, A, R>) -> Result<Stage<R>>
    where
        A: Send + 'static,
        R: Data,
    {
        self.require_bounded("aggregate")?;
        global_aggregate(
            &self.pipeline,
            "aggregate",
            op.into_operation(),
            vec![(self.transform, self.adapter)],
        )
    }

    pub fn aggregate2<T1, A, R>(
        &self,
        other: &Stage<T1>,
        op: AggregateOperation2<T, T1, A, R>,
    ) -> Result<Stage<R>>
    where
        T1: Data,
        A: Send + 'static,
        R: Data,
    {
        self.require_bounded("aggregate2")?;
        other.require_bounded("aggregate2")?;
        global_aggregate(
            &self.pipeline,
            "aggregate2",
            op.into_operation(),
            vec![
                (self.transform, self.adapter),
                (other.transform, other.adapter),
            ],
        )
    }

    pub fn aggregate3<T1, T2, A, R>(
        &self,
        other1: &Stage<T1>,
        other2: &Stage<T2>,
        op: AggregateOperation3<T, T1, T2, A, R>,
    ) -> Result<Stage<R>>
    where
        T1: Data,
        T2: Data,
        A: Send + 'static,
        R: Data,
    {
        self.require_bounded("aggregate3")?;
        other1.require_bounded("aggregate3")?;
        other2.require_bounded("aggregate3")?;
        global_aggregate(
            &self.pipeline,
            "aggregate3",
            op.into_operation(),
            vec![
                (self.transform, self.adapter),
                (other1.transform, other1.adapter),
                (other2.transform, other2.adapter),
            ],
        )
    }

    fn join_side<K, T1, P>(&self, aux: &Stage<T1>, clause: JoinClause<K, T, T1, P>) -> Result<JoinSide>
    where
        K: Key,
        T1: Data,
        P: Data,
    {
        if !aux.bounded {
            return Err(ConfigurationError::UnboundedJoinSide { name: aux.name() }.into());
        }
        let primary_key = self.adapter.adapt_key_fn(clause.left_key);
        let aux_key = aux.adapter.adapt_key_fn(clause.right_key);
        let aux_adapter = aux.adapter;
        let project_fn = clause.project;
        let project: ProjectFn = Arc::new(move |item: Item| -> Result<Item, ExecutionError> {
            Ok(Item::new(project_fn(aux_adapter.unwrap_value::<T1>(item)?)))
        });
        Ok(JoinSide {
            transform: aux.transform,
            table: Arc::new(move || -> Box<dyn JoinTable> {
                Box::new(KeyedTable::new(
                    primary_key.clone(),
                    aux_key.clone(),
                    project.clone(),
                ))
            }),
        })
    }

    fn join<R: Data>(&self, sides: Vec<JoinSide>, output: JoinOutputFn) -> Stage<R> {
        let tables: Vec<_> = sides.iter().map(|side| side.table.clone()).collect();
        let mut vertex = Vertex::new(
            "hash-join",
            TransformKind::HashJoin,
            supplier(move |_: &ProcessorContext| {
                HashJoinP::new(tables.iter().map(|table| table()).collect(), output.clone())
            }),
        )
        .input(self.transform, Input::Local);
        for side in sides {
            vertex = vertex.input(side.transform, Input::Broadcast);
        }
        let id = vertex.add_to(&self.pipeline);
        self.derive(id, self.adapter)
    }

    /// Enrich every record with the matching record of `aux`, or
    /// `None` if there is none. `aux` is loaded in full into every
    /// instance before any record of this stage is joined.
    pub fn hash_join<K, T1, P, R>(
        &self,
        aux: &Stage<T1>,
        clause: JoinClause<K, T, T1, P>,
        map_out: impl Fn(T, Option<P>) -> R + Send + Sync + 'static,
    ) -> Result<Stage<R>>
    where
        K: Key,
        T1: Data,
        P: Data,
        R: Data,
    {
        let side = self.join_side(aux, clause)?;
        let output = self.adapter.adapt_join_output::<T, P, R, _>(map_out);
        Ok(self.join(vec![side], output))
    }

    pub fn hash_join2<K1, T1, P1, K2, T2, P2, R>(
        &self,
        aux1: &Stage<T1>,
        clause1: JoinClause<K1, T, T1, P1>,
        aux2: &Stage<T2>,
        clause2: JoinClause<K2, T, T2, P2>,
        map_out: impl Fn(T, Option<P1>, Option<P2>) -> R + Send + Sync + 'static,
    ) -> Result<Stage<R>>
    where
        K1: Key,
        T1: Data,
        P1: Data,
        K2: Key,
        T2: Data,
        P2: Data,
        R: Data,
    {
        let sides = vec![self.join_side(aux1, clause1)?, self.join_side(aux2, clause2)?];
        let output = self
            .adapter
            .adapt_join_output2::<T, P1, P2, R, _>(map_out);
        Ok(self.join(sides, output))
    }

    /// Write every record to `sink`. Returns the sink's transform.
    pub fn drain_to(&self, sink: impl Sink<T> + 'static) -> TransformId {
        drain(&self.pipeline, Arc::new(sink), vec![(self.transform, self.adapter)])
    }

    pub(crate) fn input(&self) -> (TransformId, FunctionAdapter) {
        (self.transform, self.adapter)
    }
}

pub(crate) fn drain<T: Data>(
    pipeline: &Pipeline,
    sink: Arc<dyn Sink<T>>,
    inputs: Vec<(TransformId, FunctionAdapter)>,
) -> TransformId {
    let adapters: Vec<_> = inputs.iter().map(|(_, adapter)| *adapter).collect();
    let mut vertex = Vertex::new(sink.name(), TransformKind::Sink, {
        let sink = sink.clone();
        supplier(move |_: &ProcessorContext| SinkP::new(sink.clone(), adapters.clone()))
    })
    .local_parallelism(sink.local_parallelism())
    .terminal();
    for (from, _) in inputs {
        vertex = vertex.input(from, Input::Local);
    }
    vertex.add_to(pipeline)
}

fn check_arity<A: 'static, R: 'static>(
    operation: &str,
    op: &AggregateOperation<A, R>,
    inputs: usize,
) -> Result<(), ArityError> {
    match (0..inputs).find(|ordinal| !op.has_accumulate(*ordinal)) {
        Some(_) => Err(ArityError {
            operation: operation.to_string(),
            inbound: inputs,
            accumulators: op.accumulate_count(),
        }),
        None => Ok(()),
    }
}

fn global_aggregate<A, R>(
    pipeline: &Pipeline,
    name: &str,
    op: AggregateOperation<A, R>,
    inputs: Vec<(TransformId, FunctionAdapter)>,
) -> Result<Stage<R>>
where
    A: Send + 'static,
    R: Data,
{
    check_arity(name, &op, inputs.len())?;
    let adapters: Vec<_> = inputs.iter().map(|(_, adapter)| *adapter).collect();
    let count = op.accumulate_count();
    let mut vertex = Vertex::new(
        name,
        TransformKind::Aggregate,
        supplier(move |_: &ProcessorContext| {
            AggregateP::new(op.clone(), adapters.clone(), Arc::new(|r: R| Item::new(r)))
        }),
    )
    .local_parallelism(Some(1))
    .accumulate_count(count);
    for (from, _) in inputs {
        vertex = vertex.input(from, Input::AllToOne);
    }
    let id = vertex.add_to(pipeline);
    Ok(Stage::new(pipeline.clone(), id, FunctionAdapter::Raw, true))
}

/// One keyed input of a group, co-group or window transform.
struct KeyedInput<K> {
    transform: TransformId,
    adapter: FunctionAdapter,
    bounded: bool,
    key: ItemKeyFn<K>,
    partition: KeyFn,
    timestamp: ItemTimestampFn,
}

fn group<K, A, R, O>(
    pipeline: &Pipeline,
    name: &str,
    op: AggregateOperation<A, R>,
    inputs: Vec<KeyedInput<K>>,
    map_out: impl Fn(K, R) -> O + Send + Sync + 'static,
) -> Result<Stage<O>>
where
    K: Key,
    A: Send + 'static,
    R: Data,
    O: Data,
{
    if inputs.iter().any(|input| !input.bounded) {
        return Err(ConfigurationError::UnboundedAggregation {
            operation: name.to_string(),
        }
        .into());
    }
    check_arity(name, &op, inputs.len())?;
    let kind = if inputs.len() > 1 {
        TransformKind::CoGroup
    } else {
        TransformKind::Group
    };
    let key_fns: Vec<_> = inputs.iter().map(|input| input.key.clone()).collect();
    let adapters: Vec<_> = inputs.iter().map(|input| input.adapter).collect();
    let output: Arc<dyn Fn(K, R) -> Item + Send + Sync> =
        Arc::new(move |key: K, result: R| Item::new(map_out(key, result)));
    let count = op.accumulate_count();
    let mut vertex = Vertex::new(
        name,
        kind,
        supplier(move |_: &ProcessorContext| {
            GroupP::new(
                op.clone(),
                key_fns.clone(),
                adapters.clone(),
                output.clone(),
            )
        }),
    )
    .accumulate_count(count);
    for input in inputs {
        vertex = vertex.input(input.transform, Input::Partitioned(input.partition));
    }
    let id = vertex.add_to(pipeline);
    Ok(Stage::new(pipeline.clone(), id, FunctionAdapter::Raw, true))
}

fn windowed<K, A, R>(
    pipeline: &Pipeline,
    name: &str,
    def: WindowDefinition,
    op: AggregateOperation<A, R>,
    inputs: Vec<KeyedInput<K>>,
) -> Result<Stage<WindowResult<K, R>>>
where
    K: Key,
    A: Send + 'static,
    R: Data,
{
    if inputs.iter().any(|input| !input.adapter.is_timestamped()) {
        return Err(ConfigurationError::MissingTimestamp {
            operation: name.to_string(),
        }
        .into());
    }
    def.validate()?;
    check_arity(name, &op, inputs.len())?;
    let bounded = inputs.iter().all(|input| input.bounded);
    let key_fns: Vec<_> = inputs.iter().map(|input| input.key.clone()).collect();
    let timestamp_fns: Vec<_> = inputs.iter().map(|input| input.timestamp.clone()).collect();
    let adapters: Vec<_> = inputs.iter().map(|input| input.adapter).collect();
    let count = op.accumulate_count();
    let mut vertex = Vertex::new(
        name,
        TransformKind::WindowGroup,
        supplier(move |_: &ProcessorContext| {
            WindowGroupP::new(
                def,
                op.clone(),
                key_fns.clone(),
                timestamp_fns.clone(),
                adapters.clone(),
            )
        }),
    )
    .accumulate_count(count);
    for input in inputs {
        vertex = vertex.input(input.transform, Input::Partitioned(input.partition));
    }
    let id = vertex.add_to(pipeline);
    Ok(Stage::new(
        pipeline.clone(),
        id,
        FunctionAdapter::Timestamped,
        bounded,
    ))
}

/// A stage with a grouping key, ready for keyed aggregation.
pub struct GroupedStage<T, K> {
    stage: Stage<T>,
    key_fn: Arc<dyn Fn(&T) -> K + Send + Sync>,
}

impl<T, K> Clone for GroupedStage<T, K> {
    fn clone(&self) -> Self {
        Self {
            stage: self.stage.clone(),
            key_fn: self.key_fn.clone(),
        }
    }
}

impl<T: Data, K: Key> GroupedStage<T, K> {
    pub fn stage(&self) -> &Stage<T> {
        &self.stage
    }

    fn keyed_input(&self) -> KeyedInput<K> {
        let adapter = self.stage.adapter;
        KeyedInput {
            transform: self.stage.transform,
            adapter,
            bounded: self.stage.bounded,
            key: adapter.adapt_key_fn(self.key_fn.clone()),
            partition: adapter.adapt_partition_key(self.key_fn.clone()),
            timestamp: adapter.adapt_timestamp_of::<T>(),
        }
    }

    /// Aggregate per key. Emits `(key, result)` once the input is
    /// done.
    pub fn aggregate<A, R>(&self, op: AggregateOperation1<T, A, R>) -> Result<Stage<(K, R)>>
    where
        A: Send + 'static,
        R: Data,
    {
        self.aggregate_with(op, |key, result| (key, result))
    }

    pub fn aggregate_with<A, R, O>(
        &self,
        op: AggregateOperation1<T, A, R>,
        map_out: impl Fn(K, R) -> O + Send + Sync + 'static,
    ) -> Result<Stage<O>>
    where
        A: Send + 'static,
        R: Data,
        O: Data,
    {
        group(
            &self.stage.pipeline,
            "group-and-aggregate",
            op.into_operation(),
            vec![self.keyed_input()],
            map_out,
        )
    }

    /// Co-group with `other`: records of both stages with equal keys
    /// go into one accumulator.
    pub fn aggregate2<T1, A, R>(
        &self,
        other: &GroupedStage<T1, K>,
        op: AggregateOperation2<T, T1, A, R>,
    ) -> Result<Stage<(K, R)>>
    where
        T1: Data,
        A: Send + 'static,
        R: Data,
    {
        group(
            &self.stage.pipeline,
            "co-group",
            op.into_operation(),
            vec![self.keyed_input(), other.keyed_input()],
            |key, result| (key, result),
        )
    }

    pub fn aggregate3<T1, T2, A, R>(
        &self,
        other1: &GroupedStage<T1, K>,
        other2: &GroupedStage<T2, K>,
        op: AggregateOperation3<T, T1, T2, A, R>,
    ) -> Result<Stage<(K, R)>>
    where
        T1: Data,
        T2: Data,
        A: Send + 'static,
        R: Data,
    {
        group(
            &self.stage.pipeline,
            "co-group",
            op.into_operation(),
            vec![
                self.keyed_input(),
                other1.keyed_input(),
                other2.keyed_input(),
            ],
            |key, result| (key, result),
        )
    }

    /// Co-group any number of stages. This stage is
    /// [`CoGroupBuilder::tag0`].
    pub fn aggregate_builder(&self) -> CoGroupBuilder<T, K> {
        CoGroupBuilder {
            pipeline: self.stage.pipeline.clone(),
            inputs: vec![self.keyed_input()],
            _type: PhantomData,
        }
    }

    pub fn window(&self, def: WindowDefinition) -> WindowedStage<T, K> {
        WindowedStage {
            grouped: self.clone(),
            def,
        }
    }
}

/// Collects the inputs of an N-way co-group.
pub struct CoGroupBuilder<T0, K> {
    pipeline: Pipeline,
    inputs: Vec<KeyedInput<K>>,
    _type: PhantomData<fn() -> T0>,
}

impl<T0: Data, K: Key> CoGroupBuilder<T0, K> {
    pub fn tag0(&self) -> Tag<T0> {
        Tag::tag0()
    }

    /// Add an input. Its records go to the accumulate function of the
    /// returned tag.
    pub fn add<T: Data>(&mut self, stage: &GroupedStage<T, K>) -> Tag<T> {
        let tag = Tag::new(self.inputs.len());
        self.inputs.push(stage.keyed_input());
        tag
    }

    /// Fails if some input has no accumulate function.
    pub fn build<A, R>(self, op: AggregateOperation<A, R>) -> Result<Stage<(K, R)>>
    where
        A: Send + 'static,
        R: Data,
    {
        self.build_with(op, |key, result| (key, result))
    }

    pub fn build_with<A, R, O>(
        self,
        op: AggregateOperation<A, R>,
        map_out: impl Fn(K, R) -> O + Send + Sync + 'static,
    ) -> Result<Stage<O>>
    where
        A: Send + 'static,
        R: Data,
        O: Data,
    {
        group(&self.pipeline, "co-group", op, self.inputs, map_out)
    }
}

/// A keyed stage with a window definition, ready for windowed
/// aggregation.
pub struct WindowedStage<T, K> {
    grouped: GroupedStage<T, K>,
    def: WindowDefinition,
}

impl<T: Data, K: Key> WindowedStage<T, K> {
    pub fn definition(&self) -> WindowDefinition {
        self.def
    }

    /// Aggregate per key and window. Each result is stamped with its
    /// window end and emitted once the watermark passes it.
    pub fn aggregate<A, R>(
        &self,
        op: AggregateOperation1<T, A, R>,
    ) -> Result<Stage<WindowResult<K, R>>>
    where
        A: Send + 'static,
        R: Data,
    {
        windowed(
            &self.grouped.stage.pipeline,
            "window-aggregate",
            self.def,
            op.into_operation(),
            vec![self.grouped.keyed_input()],
        )
    }

    pub fn aggregate2<T1, A, R>(
        &self,
        other: &GroupedStage<T1, K>,
        op: AggregateOperation2<T, T1, A, R>,
    ) -> Result<Stage<WindowResult<K, R>>>
    where
        T1: Data,
        A: Send + 'static,
        R: Data,
    {
        windowed(
            &self.grouped.stage.pipeline,
            "window-co-group",
            self.def,
            op.into_operation(),
            vec![self.grouped.keyed_input(), other.keyed_input()],
        )
    }
}

/// How a hash-join matches an auxiliary stream `T1` to the primary
/// stream `T0`, and what part of a match to keep.
pub struct JoinClause<K, T0, T1, P> {
    left_key: Arc<dyn Fn(&T0) -> K + Send + Sync>,
    right_key: Arc<dyn Fn(&T1) -> K + Send + Sync>,
    project: Arc<dyn Fn(T1) -> P + Send + Sync>,
}

impl<K, T0, T1> JoinClause<K, T0, T1, T1>
where
    T1: 'static,
{
    /// Match on equal keys, keeping the whole auxiliary record.
    pub fn on_keys(
        left_key: impl Fn(&T0) -> K + Send + Sync + 'static,
        right_key: impl Fn(&T1) -> K + Send + Sync + 'static,
    ) -> Self {
        Self {
            left_key: Arc::new(left_key),
            right_key: Arc::new(right_key),
            project: Arc::new(|aux: T1| aux),
        }
    }
}

impl<K, T0, T1, P> JoinClause<K, T0, T1, P> {
    /// Keep only a projection of the matched auxiliary record.
    pub fn projecting<P2>(
        self,
        project: impl Fn(T1) -> P2 + Send + Sync + 'static,
    ) -> JoinClause<K, T0, T1, P2> {
        JoinClause {
            left_key: self.left_key,
            right_key: self.right_key,
            project: Arc::new(project),
        }
    }
}

struct JoinSide {
    transform: TransformId,
    table: Arc<dyn Fn() -> Box<dyn JoinTable> + Send + Sync>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{counting, summing};
    use crate::connectors::{collect, list};
    use crate::errors::Error;
    use crate::routing::ProcessingStrategy;
    use crate::window::limiting_lag;

    #[test]
    fn map_chain_builds_linear_graph() {
        let p = Pipeline::create();
        let (sink, _) = collect::<String>();
        let sink_id = p
            .read_from(list(vec![1u32, 2]))
            .map(|x| x * 2)
            .filter(|x| *x > 2)
            .map(|x| x.to_string())
            .drain_to(sink);
        let dag = p.finalize().unwrap();
        let names: Vec<_> = dag.transforms().iter().map(|t| t.name().to_string()).collect();
        assert_eq!(names, vec!["list-source", "map", "filter", "map-2", "collect-sink"]);
        assert_eq!(dag.inbound(sink_id).count(), 1);
    }

    #[test]
    fn group_edges_are_partitioned_and_shuffled() {
        let p = Pipeline::create();
        let grouped = p
            .read_from(list(0i64..5))
            .grouping_key(|x: &i64| x % 2)
            .aggregate(summing(|x: &i64| *x))
            .unwrap();
        let edge = p.edge(grouped.transform(), 0).unwrap();
        assert_eq!(edge.processing(), ProcessingStrategy::Partitioning);
        assert!(edge.is_shuffled());
        assert!(edge.key_fn().is_some());
    }

    #[test]
    fn windowing_raw_stage_is_rejected() {
        let p = Pipeline::create();
        let err = p
            .read_from(list(vec!["a".to_string()]))
            .grouping_key(|s: &String| s.clone())
            .window(WindowDefinition::tumbling(chrono::Duration::seconds(1)))
            .aggregate(counting())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Configuration(ConfigurationError::MissingTimestamp { .. })
        ));
        assert!(err.to_string().contains("Call .timestamp()"));
    }

    #[test]
    fn windowing_timestamped_stage_is_accepted() {
        let p = Pipeline::create();
        let windowed = p
            .read_from(list(vec![1i64, 2]))
            .timestamp(
                |x: &i64| DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::seconds(*x),
                limiting_lag(chrono::Duration::zero()),
            )
            .window(WindowDefinition::tumbling(chrono::Duration::seconds(1)))
            .aggregate(counting())
            .unwrap();
        assert_eq!(windowed.adapter(), FunctionAdapter::Timestamped);
    }

    #[test]
    fn unbounded_aggregation_is_rejected() {
        let p = Pipeline::create();
        let err = p
            .read_from(list(vec![1u8]).unbounded())
            .aggregate(counting())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Configuration(ConfigurationError::UnboundedAggregation { .. })
        ));
    }

    #[test]
    fn co_group_builder_checks_every_tag() {
        let p = Pipeline::create();
        let left = p.read_from(list(vec![1u32])).grouping_key(|x: &u32| *x);
        let right = p.read_from(list(vec![2u32])).grouping_key(|x: &u32| *x);
        let mut builder = left.aggregate_builder();
        let tag0 = builder.tag0();
        let _tag1 = builder.add(&right);
        let op = crate::aggregate::with_create(|| 0u32)
            .and_accumulate(tag0, |acc: &mut u32, _: u32| *acc += 1)
            .and_finish(|acc| acc);
        assert!(matches!(builder.build(op), Err(Error::Arity(_))));
    }

    #[test]
    fn hash_join_side_must_be_bounded() {
        let p = Pipeline::create();
        let primary = p.read_from(list(vec![1u32]));
        let aux = p.read_from(list(vec![(1u32, "x".to_string())]).unbounded());
        let err = primary
            .hash_join(
                &aux,
                JoinClause::on_keys(|x: &u32| *x, |a: &(u32, String)| a.0),
                |x, a| (x, a),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Configuration(ConfigurationError::UnboundedJoinSide { .. })
        ));
    }

    #[test]
    fn hash_join_aux_edges_are_broadcast() {
        let p = Pipeline::create();
        let primary = p.read_from(list(vec![1u32]));
        let aux = p.read_from(list(vec![(1u32, "x".to_string())]));
        let joined = primary
            .hash_join(
                &aux,
                JoinClause::on_keys(|x: &u32| *x, |a: &(u32, String)| a.0)
                    .projecting(|a: (u32, String)| a.1),
                |x, a| (x, a),
            )
            .unwrap();
        let primary_edge = p.edge(joined.transform(), 0).unwrap();
        let aux_edge = p.edge(joined.transform(), 1).unwrap();
        assert_eq!(primary_edge.processing(), ProcessingStrategy::RoundRobin);
        assert_eq!(aux_edge.processing(), ProcessingStrategy::Broadcast);
        assert!(aux_edge.is_shuffled());
    }

    #[test]
    fn global_aggregate_runs_on_one_instance() {
        let p = Pipeline::create();
        let total = p
            .read_from(list(vec![1u32]))
            .aggregate(counting())
            .unwrap();
        let dag = p.finalize().unwrap();
        assert_eq!(
            dag.transform(total.transform()).unwrap().local_parallelism(),
            Some(1)
        );
    }

    #[test]
    fn global_aggregate_refuses_more_instances() {
        let p = Pipeline::create();
        let total = p
            .read_from(list(vec![1u32]))
            .aggregate(counting())
            .unwrap()
            .set_local_parallelism(3);
        assert_eq!(
            p.edge(total.transform(), 0).unwrap().processing(),
            ProcessingStrategy::Partitioning
        );
        assert!(matches!(
            p.finalize(),
            Err(Error::Configuration(ConfigurationError::SingleInstance { requested: 3, .. }))
        ));
    }
}
