//! A parallel stream processing engine.
//!
//! A job is declared as a [`Pipeline`] of typed [`Stage`]s: read from
//! a source, map, filter, group, join, window, aggregate and drain to
//! a sink. Declaring a stage registers a transform in the pipeline's
//! graph; [`Pipeline::finalize`] validates the graph into a [`Dag`],
//! and [`Job::submit`] runs it on a pool of worker threads, each
//! driving many cooperative processor instances.
//!
//! ```
//! use jetflow::aggregate::summing;
//! use jetflow::config::ExecutionConfig;
//! use jetflow::connectors::{collect, list};
//! use jetflow::Pipeline;
//!
//! let p = Pipeline::create();
//! let (sink, results) = collect();
//! p.read_from(list(vec![1i64, 2, 3, 4, 5]))
//!     .grouping_key(|x: &i64| x % 2)
//!     .aggregate(summing(|x: &i64| *x))
//!     .unwrap()
//!     .drain_to(sink);
//! p.run(&ExecutionConfig::default()).unwrap();
//!
//! let mut sums = results.take();
//! sums.sort();
//! assert_eq!(sums, vec![(0, 6), (1, 9)]);
//! ```

pub mod adapter;
pub mod aggregate;
pub mod config;
pub mod connectors;
pub mod edge;
pub mod errors;
pub mod execution;
pub mod item;
pub mod pipeline;
pub mod processor;
pub mod routing;
pub mod stage;
pub mod tracing;
pub mod transform;
pub mod window;

pub use crate::adapter::FunctionAdapter;
pub use crate::config::ExecutionConfig;
pub use crate::edge::Edge;
pub use crate::errors::{Error, Result};
pub use crate::execution::Job;
pub use crate::item::{Data, Item, Key, Timestamped};
pub use crate::pipeline::{Dag, Pipeline};
pub use crate::stage::{CoGroupBuilder, GroupedStage, JoinClause, Stage, WindowedStage};
pub use crate::transform::{Transform, TransformId, TransformKind};
pub use crate::window::{Watermark, WindowDefinition, WindowResult};
