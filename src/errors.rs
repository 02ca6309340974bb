//! Error taxonomy.
//!
//! Graph, arity and configuration errors are reported while the
//! pipeline is being built or finalized, before anything runs.
//! [`ExecutionError`] is what a processor instance fails with at
//! runtime; the first one aborts the whole job.

use std::any::Any;
use std::panic::Location;

use thiserror::Error;

use crate::transform::TransformId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("transform {name:?} ({id}) is already registered")]
    DuplicateRegistration { id: TransformId, name: String },
    #[error("edge {from} -> {to} references a transform that is not registered")]
    DanglingUpstream { from: TransformId, to: TransformId },
    #[error("transform graph contains a cycle through {name:?}")]
    Cycle { name: String },
    #[error("transform {name:?} is terminal and does not accept downstream transforms")]
    TerminalTransform { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("edge {name:?} is already registered with a pipeline and can't be modified")]
pub struct EdgeFrozenError {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "{operation:?} has {inbound} inbound edges but its aggregate operation \
     only defines {accumulators} accumulate functions"
)]
pub struct ArityError {
    pub operation: String,
    pub inbound: usize,
    pub accumulators: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error(
        "{operation} is missing a timestamp and watermark definition. \
         Call .timestamp() on it before performing the aggregation."
    )]
    MissingTimestamp { operation: String },
    #[error("{operation} on an unbounded stage needs a window definition")]
    UnboundedAggregation { operation: String },
    #[error("hash-join side {name:?} must be a bounded stage")]
    UnboundedJoinSide { name: String },
    #[error("invalid window definition: {0}")]
    InvalidWindow(String),
    #[error("local parallelism of {name:?} must be at least 1")]
    InvalidParallelism { name: String },
    #[error("{name:?} aggregates its whole input and must run on one instance, not {requested}")]
    SingleInstance { name: String, requested: usize },
    #[error("unknown log level {0:?}")]
    InvalidLogLevel(String),
    #[error("invalid execution config: {0}")]
    Config(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("edge {edge:?} has no downstream instances to route to")]
    NoInstances { edge: String },
    #[error("could not derive a partitioning key: {0}")]
    KeyEncoding(String),
    #[error("edge {edge:?} routed to instance {index} of {parallelism}")]
    InstanceOutOfRange {
        edge: String,
        index: usize,
        parallelism: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("expected an item of type {expected}")]
    ItemType { expected: &'static str },
    #[error("processor {vertex}#{instance} failed: {message}")]
    ProcessorFailed {
        vertex: String,
        instance: usize,
        message: String,
    },
    #[error("user function failed: {0}")]
    UserFunction(String),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Arity(#[from] ArityError),
    #[error("job was cancelled")]
    Cancelled,
    #[error("worker thread panicked: {0}")]
    WorkerPanicked(String),
}

impl ExecutionError {
    pub(crate) fn item_type<T>() -> Self {
        Self::ItemType {
            expected: std::any::type_name::<T>(),
        }
    }

    /// Turn a user error into an [`ExecutionError::UserFunction`]
    /// tagged with the location the user function was declared at.
    pub(crate) fn user<E: std::fmt::Display>(caller: &'static Location<'static>, err: E) -> Self {
        Self::UserFunction(prepend_caller(caller, &err.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    EdgeFrozen(#[from] EdgeFrozenError),
    #[error(transparent)]
    Arity(#[from] ArityError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Prepend '({caller}) ' to the message
fn prepend_caller(caller: &Location, msg: &str) -> String {
    format!("({caller}) {msg}")
}

/// Prepend the name of the current thread to each line,
/// if present.
pub(crate) fn prepend_tname(msg: String) -> String {
    let tname = std::thread::current()
        .name()
        .unwrap_or("unnamed-thread")
        .to_string();
    msg.lines()
        .map(|line| format!("<{tname}> {line}\n"))
        .collect()
}

/// Extract a readable message out of a caught panic payload.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else {
        "unknown panic payload".to_string()
    }
}

#[test]
fn prepend_tname_prefixes_every_line() {
    let msg = std::thread::Builder::new()
        .name("worker-7".into())
        .spawn(|| prepend_tname("first\nsecond".into()))
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(msg, "<worker-7> first\n<worker-7> second\n");
}

#[test]
fn panic_message_reads_str_and_string() {
    assert_eq!(panic_message(Box::new("boom")), "boom");
    assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
    assert_eq!(panic_message(Box::new(7u8)), "unknown panic payload");
}

#[test]
fn user_error_carries_declaration_site() {
    let err = ExecutionError::user(Location::caller(), "bad input");
    match err {
        ExecutionError::UserFunction(msg) => {
            assert!(msg.contains("errors.rs"));
            assert!(msg.ends_with("bad input"));
        }
        other => panic!("unexpected error {other:?}"),
    }
}
