use std::sync::Arc;

use jetflow::aggregate::{counting, with_create};
use jetflow::connectors::{collect, list};
use jetflow::edge::ShufflingStrategy;
use jetflow::errors::{ArityError, ConfigurationError, Error, ExecutionError, GraphError};
use jetflow::pipeline::TransformGraph;
use jetflow::processor::{Inbox, Outbox, Processor, ProcessorContext};
use jetflow::routing::ProcessingStrategy;
use jetflow::transform::ProcessorSupplier;
use jetflow::window::limiting_lag;
use jetflow::{Edge, Pipeline, Transform, TransformKind, WindowDefinition};

struct Discard;

impl Processor for Discard {
    fn process(
        &mut self,
        _ordinal: usize,
        inbox: &mut Inbox,
        _outbox: &mut Outbox,
    ) -> Result<(), ExecutionError> {
        inbox.drain().for_each(drop);
        Ok(())
    }
}

fn discard() -> ProcessorSupplier {
    Arc::new(|_: &ProcessorContext| -> Box<dyn Processor> { Box::new(Discard) })
}

fn add(graph: &mut TransformGraph, name: &str, kind: TransformKind) -> jetflow::TransformId {
    let id = graph.next_id();
    graph
        .register(Transform::new(id, name, kind, Vec::new(), discard()), 1)
        .unwrap()
}

#[test]
fn cycle_is_rejected() {
    let mut graph = TransformGraph::new();
    let a = add(&mut graph, "a", TransformKind::Map);
    let b = add(&mut graph, "b", TransformKind::Map);
    graph.connect(a, b).unwrap();
    graph.connect(b, a).unwrap();
    assert!(matches!(
        graph.finalize(),
        Err(Error::Graph(GraphError::Cycle { .. }))
    ));
}

#[test]
fn dangling_edge_is_rejected() {
    let mut graph = TransformGraph::new();
    let a = add(&mut graph, "a", TransformKind::Source);
    let ghost = graph.next_id();
    assert_eq!(
        graph.connect(a, ghost),
        Err(GraphError::DanglingUpstream { from: a, to: ghost })
    );
}

#[test]
fn sinks_are_terminal() {
    let mut graph = TransformGraph::new();
    let source = add(&mut graph, "source", TransformKind::Source);
    let id = graph.next_id();
    let sink = graph
        .register(
            Transform::new(id, "sink", TransformKind::Sink, vec![source], discard()),
            0,
        )
        .unwrap();
    let after = add(&mut graph, "after", TransformKind::Map);
    assert!(matches!(
        graph.connect(sink, after),
        Err(GraphError::TerminalTransform { name }) if name == "sink"
    ));
}

#[test]
fn duplicate_registration_is_rejected() {
    let mut graph = TransformGraph::new();
    let id = graph.next_id();
    let transform = Transform::new(id, "once", TransformKind::Map, Vec::new(), discard());
    graph.register(transform.clone(), 1).unwrap();
    assert!(matches!(
        graph.register(transform, 1),
        Err(GraphError::DuplicateRegistration { .. })
    ));
}

#[test]
fn finalize_orders_topologically() {
    let mut graph = TransformGraph::new();
    let sink = add(&mut graph, "sink", TransformKind::Map);
    let source = add(&mut graph, "source", TransformKind::Source);
    let middle = add(&mut graph, "middle", TransformKind::Map);
    graph.connect(middle, sink).unwrap();
    graph.connect(source, middle).unwrap();
    let dag = graph.finalize().unwrap();
    let names: Vec<_> = dag.transforms().iter().map(|t| t.name()).collect();
    assert_eq!(names, ["source", "middle", "sink"]);
}

#[test]
fn more_inputs_than_accumulators_is_an_arity_error() {
    let mut graph = TransformGraph::new();
    let left = add(&mut graph, "left", TransformKind::Source);
    let right = add(&mut graph, "right", TransformKind::Source);
    let id = graph.next_id();
    let agg = graph
        .register(
            Transform::new(id, "agg", TransformKind::CoGroup, vec![left, right], discard())
                .with_accumulate_count(1),
            1,
        )
        .unwrap();
    graph.connect(left, agg).unwrap();
    graph.connect(right, agg).unwrap();
    assert_eq!(
        graph.finalize().unwrap_err(),
        Error::Arity(ArityError {
            operation: "agg".to_string(),
            inbound: 2,
            accumulators: 1,
        })
    );
}

#[test]
fn co_group_without_second_accumulator_fails() {
    let p = Pipeline::create();
    let left = p.read_from(list(vec![1u32])).grouping_key(|x: &u32| *x);
    let right = p.read_from(list(vec![2u32])).grouping_key(|x: &u32| *x);
    let mut builder = left.aggregate_builder();
    let tag0 = builder.tag0();
    builder.add(&right);
    let op = with_create(|| 0u32)
        .and_accumulate(tag0, |acc: &mut u32, x: u32| *acc += x)
        .and_finish(|acc| acc);
    assert!(matches!(builder.build(op), Err(Error::Arity(_))));
}

#[test]
fn windowing_needs_timestamps() {
    let p = Pipeline::create();
    let raw = p
        .read_from(list(vec![1u32]))
        .window(WindowDefinition::tumbling(chrono::Duration::seconds(1)))
        .aggregate(counting());
    assert!(matches!(
        raw,
        Err(Error::Configuration(ConfigurationError::MissingTimestamp { .. }))
    ));

    let stamped = p
        .read_from(list(vec![1u32]))
        .timestamp(
            |_: &u32| chrono::DateTime::<chrono::Utc>::UNIX_EPOCH,
            limiting_lag(chrono::Duration::zero()),
        )
        .window(WindowDefinition::tumbling(chrono::Duration::seconds(1)))
        .aggregate(counting());
    assert!(stamped.is_ok());
}

#[test]
fn zero_window_size_is_invalid() {
    let p = Pipeline::create();
    let result = p
        .read_from(list(vec![1u32]))
        .timestamp(
            |_: &u32| chrono::DateTime::<chrono::Utc>::UNIX_EPOCH,
            limiting_lag(chrono::Duration::zero()),
        )
        .window(WindowDefinition::tumbling(chrono::Duration::zero()))
        .aggregate(counting());
    assert!(matches!(
        result,
        Err(Error::Configuration(ConfigurationError::InvalidWindow(_)))
    ));
}

#[test]
fn edges_compare_by_value() {
    let mut graph = TransformGraph::new();
    let a = add(&mut graph, "a", TransformKind::Source);
    let b = add(&mut graph, "b", TransformKind::Map);
    let plain = Edge::between(a, b);
    assert_eq!(plain, Edge::between(a, b));
    assert_ne!(plain, Edge::between(a, b).broadcast().unwrap());
    assert_ne!(plain, Edge::between(a, b).shuffled().unwrap());
    assert_eq!(
        Edge::between(a, b).partitioned().unwrap().shuffled().unwrap(),
        Edge::between(a, b).partitioned().unwrap().shuffled().unwrap()
    );
    let to = |member: &str| {
        Edge::between(a, b)
            .shuffled_with(ShufflingStrategy::to_member(member))
            .unwrap()
    };
    assert_eq!(to("m1"), to("m1"));
    assert_ne!(to("m1"), to("m2"));
}

#[test]
fn connected_edges_are_frozen() {
    let mut graph = TransformGraph::new();
    let a = add(&mut graph, "a", TransformKind::Source);
    let b = add(&mut graph, "b", TransformKind::Map);
    graph
        .connect_edge(Edge::between(a, b).broadcast().unwrap())
        .unwrap();
    let edge = graph.edge(b, 0).unwrap().clone();
    assert!(edge.is_frozen());
    assert_eq!(edge.processing(), ProcessingStrategy::Broadcast);
    assert!(edge.shuffled().is_err());
}

#[test]
fn dag_describes_itself_as_json() {
    let p = Pipeline::create();
    let (sink, _) = collect::<u32>();
    p.read_from(list(vec![1u32]))
        .map(|x| x + 1)
        .set_local_parallelism(3)
        .drain_to(sink);
    let json: serde_json::Value = serde_json::from_str(&p.finalize().unwrap().to_json().unwrap()).unwrap();

    let vertices = json["vertices"].as_array().unwrap();
    let names: Vec<_> = vertices.iter().map(|v| v["name"].as_str().unwrap()).collect();
    assert_eq!(names, ["list-source", "map", "collect-sink"]);
    assert_eq!(vertices[1]["kind"], "map");
    assert_eq!(vertices[1]["local_parallelism"], 3);
    let edges = json["edges"].as_array().unwrap();
    assert_eq!(edges.len(), 2);
    assert_eq!(edges[0]["processing"], "ROUND_ROBIN");
}
