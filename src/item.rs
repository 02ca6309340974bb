//! Type-erased records flowing between processors.
//!
//! Stages are typed while the pipeline is being built, but the
//! transform graph and the runtime only ever see [`Item`]s. Each
//! stage knows the concrete type it produces and downcasts on the
//! way in.

use std::any::Any;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ExecutionError;

/// Anything that can flow through a pipeline.
///
/// Records are cloned when an edge broadcasts them, and may be
/// handed across worker threads.
pub trait Data: Clone + Send + Sync + 'static {}

impl<T> Data for T where T: Clone + Send + Sync + 'static {}

/// Anything records can be grouped by. Serializable so that equal
/// keys land on the same instance of a partitioned edge.
pub trait Key: Data + Hash + Eq + Serialize {}

impl<T> Key for T where T: Data + Hash + Eq + Serialize {}

/// A single record on an edge.
///
/// Cloning is cheap: broadcast fans out the same allocation to every
/// target instance.
#[derive(Clone)]
pub struct Item(Arc<dyn Any + Send + Sync>);

impl Item {
    pub fn new<T: Data>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn is<T: Data>(&self) -> bool {
        self.0.is::<T>()
    }

    pub fn downcast_ref<T: Data>(&self) -> Result<&T, ExecutionError> {
        self.0
            .downcast_ref::<T>()
            .ok_or_else(ExecutionError::item_type::<T>)
    }

    /// Take the value out. Only clones when some other holder still
    /// shares it (e.g. after a broadcast).
    pub fn downcast<T: Data>(self) -> Result<T, ExecutionError> {
        let arc = self
            .0
            .downcast::<T>()
            .map_err(|_| ExecutionError::item_type::<T>())?;
        Ok(Arc::try_unwrap(arc).unwrap_or_else(|shared| (*shared).clone()))
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Item").finish_non_exhaustive()
    }
}

/// The event envelope: a record plus its event timestamp.
///
/// Produced once a stage has a timestamp definition, and carried
/// unchanged through every downstream stage until a transform that
/// drops timestamps (a non-windowed aggregation) unwraps it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamped<T> {
    pub timestamp: DateTime<Utc>,
    pub item: T,
}

impl<T> Timestamped<T> {
    pub fn new(timestamp: DateTime<Utc>, item: T) -> Self {
        Self { timestamp, item }
    }
}

#[test]
fn downcast_works() {
    let item = Item::new(42u64);
    assert!(item.is::<u64>());
    assert_eq!(*item.downcast_ref::<u64>().unwrap(), 42);
    assert_eq!(item.downcast::<u64>().unwrap(), 42);
}

#[test]
fn downcast_clones_shared_values() {
    let item = Item::new(String::from("shared"));
    let other = item.clone();
    assert_eq!(item.downcast::<String>().unwrap(), "shared");
    assert_eq!(other.downcast::<String>().unwrap(), "shared");
}

#[test]
fn downcast_to_wrong_type_is_an_error() {
    let item = Item::new(1i32);
    assert_eq!(
        item.downcast::<String>(),
        Err(ExecutionError::ItemType {
            expected: "alloc::string::String"
        })
    );
}
