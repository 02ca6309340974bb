//! How records pick a downstream processor instance.
//!
//! Every edge carries a [`ProcessingStrategy`]. Partitioned edges
//! also carry a key function, a [`PartitioningStrategy`] that derives
//! the partition key from the record key, and a [`HashingStrategy`]
//! that turns the partition key into an instance index. Routing a
//! given key is a pure function of the key and the number of target
//! instances, so every upstream instance agrees on where a key lives.

use std::any::TypeId;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ExecutionError, RoutingError};
use crate::item::{Data, Item};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStrategy {
    /// Each record goes to exactly one instance, cycling through
    /// them in order.
    #[default]
    RoundRobin,
    /// Every record goes to every instance.
    Broadcast,
    /// Each record goes to the instance its key hashes to.
    Partitioning,
}

/// Routing key, in the canonical string form hashing works on.
///
/// Keys are encoded through serde so that equal keys of any
/// serializable type always hash the same way.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey(pub String);

impl PartitionKey {
    pub fn of<K: Serialize + ?Sized>(key: &K) -> Result<Self, RoutingError> {
        let value =
            serde_json::to_value(key).map_err(|err| RoutingError::KeyEncoding(err.to_string()))?;
        Ok(match value {
            Value::String(s) => Self(s),
            other => Self(other.to_string()),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PartitionKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PartitionKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Extracts the routing key out of a record.
pub type KeyFn = Arc<dyn Fn(&Item) -> Result<PartitionKey, ExecutionError> + Send + Sync>;

/// Build a [`KeyFn`] for edges whose records are plain `T`.
pub fn key_fn<T, K, F>(f: F) -> KeyFn
where
    T: Data,
    K: Serialize,
    F: Fn(&T) -> K + Send + Sync + 'static,
{
    Arc::new(move |item: &Item| -> Result<PartitionKey, ExecutionError> {
        let value = item.downcast_ref::<T>()?;
        Ok(PartitionKey::of(&f(value))?)
    })
}

/// Key function used by partitioned edges that were not given one:
/// records that already are strings or integers are their own key.
pub(crate) fn default_key_fn() -> KeyFn {
    Arc::new(|item: &Item| -> Result<PartitionKey, ExecutionError> {
        if let Ok(key) = item.downcast_ref::<PartitionKey>() {
            return Ok(key.clone());
        }
        if let Ok(s) = item.downcast_ref::<String>() {
            return Ok(PartitionKey(s.clone()));
        }
        if let Ok(s) = item.downcast_ref::<&'static str>() {
            return Ok(PartitionKey(s.to_string()));
        }
        if let Ok(n) = item.downcast_ref::<i64>() {
            return Ok(PartitionKey(n.to_string()));
        }
        if let Ok(n) = item.downcast_ref::<u64>() {
            return Ok(PartitionKey(n.to_string()));
        }
        if let Ok(n) = item.downcast_ref::<i32>() {
            return Ok(PartitionKey(n.to_string()));
        }
        if let Ok(n) = item.downcast_ref::<u32>() {
            return Ok(PartitionKey(n.to_string()));
        }
        if let Ok(n) = item.downcast_ref::<usize>() {
            return Ok(PartitionKey(n.to_string()));
        }
        Err(RoutingError::KeyEncoding(
            "record has no default partitioning key, give the edge a key function".to_string(),
        )
        .into())
    })
}

/// Derives the partition key from a record key.
///
/// Two strategies are considered the same when they are of the same
/// concrete type.
pub trait PartitioningStrategy: fmt::Debug + Send + Sync + 'static {
    fn partition_key(&self, key: PartitionKey) -> PartitionKey;

    fn strategy_type(&self) -> TypeId {
        TypeId::of::<Self>()
    }
}

/// Keys of the form `name@partition` are routed by the part after
/// the first `@`, so related keys can be co-located. Other keys are
/// used as is.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringPartitioningStrategy;

impl PartitioningStrategy for StringPartitioningStrategy {
    fn partition_key(&self, key: PartitionKey) -> PartitionKey {
        match key.0.find('@') {
            Some(at) => PartitionKey(key.0[at + 1..].to_string()),
            None => key,
        }
    }
}

/// Turns a partition key into a hash.
///
/// Two strategies are considered the same when they are of the same
/// concrete type.
pub trait HashingStrategy: fmt::Debug + Send + Sync + 'static {
    fn hash(&self, key: &PartitionKey) -> u64;

    fn strategy_type(&self) -> TypeId {
        TypeId::of::<Self>()
    }
}

/// Default hashing, stable across processes and platforms.
#[derive(Debug, Default, Clone, Copy)]
pub struct SeaHashingStrategy;

impl HashingStrategy for SeaHashingStrategy {
    fn hash(&self, key: &PartitionKey) -> u64 {
        seahash::hash(key.0.as_bytes())
    }
}

/// Hashing with the standard library's SipHash.
#[derive(Debug, Default, Clone, Copy)]
pub struct SipHashingStrategy;

impl HashingStrategy for SipHashingStrategy {
    fn hash(&self, key: &PartitionKey) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.0.hash(&mut hasher);
        hasher.finish()
    }
}

pub fn default_partitioning() -> Arc<dyn PartitioningStrategy> {
    Arc::new(StringPartitioningStrategy)
}

pub fn default_hashing() -> Arc<dyn HashingStrategy> {
    Arc::new(SeaHashingStrategy)
}

/// Instance a partition key belongs to.
pub fn partition_for(
    partitioning: &dyn PartitioningStrategy,
    hashing: &dyn HashingStrategy,
    key: PartitionKey,
    parallelism: usize,
) -> Option<usize> {
    if parallelism == 0 {
        return None;
    }
    let key = partitioning.partition_key(key);
    Some((hashing.hash(&key) % parallelism as u64) as usize)
}

/// Where a single record is going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    One(usize),
    All,
}

/// Per-sender routing state for one edge.
///
/// Each upstream instance owns its own router, so the round-robin
/// cursor is local and starts at instance `0`.
pub struct Router {
    edge: String,
    strategy: ProcessingStrategy,
    parallelism: usize,
    next: usize,
    key_fn: KeyFn,
    partitioning: Arc<dyn PartitioningStrategy>,
    hashing: Arc<dyn HashingStrategy>,
}

impl Router {
    pub fn new(
        edge: String,
        strategy: ProcessingStrategy,
        parallelism: usize,
        key_fn: Option<KeyFn>,
        partitioning: Arc<dyn PartitioningStrategy>,
        hashing: Arc<dyn HashingStrategy>,
    ) -> Result<Self, RoutingError> {
        if parallelism == 0 {
            return Err(RoutingError::NoInstances { edge });
        }
        Ok(Self {
            edge,
            strategy,
            parallelism,
            next: 0,
            key_fn: key_fn.unwrap_or_else(default_key_fn),
            partitioning,
            hashing,
        })
    }

    /// A router with the default strategies for the given processing
    /// strategy.
    pub fn with_strategy(
        edge: impl Into<String>,
        strategy: ProcessingStrategy,
        parallelism: usize,
        key_fn: Option<KeyFn>,
    ) -> Result<Self, RoutingError> {
        Self::new(
            edge.into(),
            strategy,
            parallelism,
            key_fn,
            default_partitioning(),
            default_hashing(),
        )
    }

    pub fn edge(&self) -> &str {
        &self.edge
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub fn route(&mut self, item: &Item) -> Result<Route, ExecutionError> {
        match self.strategy {
            ProcessingStrategy::RoundRobin => {
                let index = self.next;
                self.next = (self.next + 1) % self.parallelism;
                Ok(Route::One(index))
            }
            ProcessingStrategy::Broadcast => Ok(Route::All),
            ProcessingStrategy::Partitioning => {
                let key = (self.key_fn)(item)?;
                partition_for(
                    self.partitioning.as_ref(),
                    self.hashing.as_ref(),
                    key,
                    self.parallelism,
                )
                .map(Route::One)
                .ok_or_else(|| {
                    RoutingError::NoInstances {
                        edge: self.edge.clone(),
                    }
                    .into()
                })
            }
        }
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("edge", &self.edge)
            .field("strategy", &self.strategy)
            .field("parallelism", &self.parallelism)
            .field("next", &self.next)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serde_test::{assert_tokens, Token};

    use super::*;

    #[test]
    fn round_robin_cycles_from_zero() {
        let mut router =
            Router::with_strategy("e", ProcessingStrategy::RoundRobin, 3, None).unwrap();
        let routes: Vec<_> = (0..9)
            .map(|i| router.route(&Item::new(i)).unwrap())
            .collect();
        let expected: Vec<_> = [0, 1, 2, 0, 1, 2, 0, 1, 2]
            .into_iter()
            .map(Route::One)
            .collect();
        assert_eq!(routes, expected);
    }

    #[test]
    fn broadcast_routes_everywhere() {
        let mut router =
            Router::with_strategy("e", ProcessingStrategy::Broadcast, 4, None).unwrap();
        assert_eq!(router.route(&Item::new(1u8)).unwrap(), Route::All);
    }

    #[test]
    fn zero_instances_is_an_error() {
        let err = Router::with_strategy("lonely", ProcessingStrategy::RoundRobin, 0, None)
            .unwrap_err();
        assert_eq!(
            err,
            RoutingError::NoInstances {
                edge: "lonely".into()
            }
        );
    }

    #[test]
    fn partitioning_is_stable() {
        let key_fn = key_fn(|x: &(String, u32)| x.0.clone());
        let mut a = Router::with_strategy(
            "a",
            ProcessingStrategy::Partitioning,
            7,
            Some(key_fn.clone()),
        )
        .unwrap();
        let mut b =
            Router::with_strategy("b", ProcessingStrategy::Partitioning, 7, Some(key_fn)).unwrap();
        for i in 0..100u32 {
            let key = format!("key-{}", i % 13);
            let first = a.route(&Item::new((key.clone(), i))).unwrap();
            let second = b.route(&Item::new((key.clone(), i + 1))).unwrap();
            let again = a.route(&Item::new((key, 0u32))).unwrap();
            assert_eq!(first, second);
            assert_eq!(first, again);
        }
    }

    #[test]
    fn partition_for_matches_hash_modulo() {
        let key = PartitionKey::from("hello");
        let expected = (seahash::hash(b"hello") % 5) as usize;
        assert_eq!(
            partition_for(&StringPartitioningStrategy, &SeaHashingStrategy, key, 5),
            Some(expected)
        );
    }

    #[test]
    fn string_partitioning_uses_suffix_after_at() {
        let strategy = StringPartitioningStrategy;
        assert_eq!(
            strategy.partition_key("order-1@customer-9".into()),
            PartitionKey::from("customer-9")
        );
        assert_eq!(
            strategy.partition_key("plain".into()),
            PartitionKey::from("plain")
        );
    }

    #[test]
    fn keys_encode_canonically() {
        assert_eq!(PartitionKey::of("abc").unwrap(), PartitionKey::from("abc"));
        assert_eq!(PartitionKey::of(&42).unwrap(), PartitionKey::from("42"));
        assert_eq!(
            PartitionKey::of(&(1, "x")).unwrap(),
            PartitionKey::from("[1,\"x\"]")
        );
    }

    #[test]
    fn default_key_fn_handles_strings_and_integers() {
        let key_fn = default_key_fn();
        assert_eq!(
            key_fn(&Item::new(String::from("k"))).unwrap(),
            PartitionKey::from("k")
        );
        assert_eq!(key_fn(&Item::new(5i64)).unwrap(), PartitionKey::from("5"));
        assert!(key_fn(&Item::new(1.5f64)).is_err());
    }

    #[test]
    fn strategy_types_compare_by_class() {
        let sea: Arc<dyn HashingStrategy> = Arc::new(SeaHashingStrategy);
        let other_sea: Arc<dyn HashingStrategy> = Arc::new(SeaHashingStrategy);
        let sip: Arc<dyn HashingStrategy> = Arc::new(SipHashingStrategy);
        assert_eq!(sea.strategy_type(), other_sea.strategy_type());
        assert_ne!(sea.strategy_type(), sip.strategy_type());
    }

    #[test]
    fn processing_strategy_ser_de() {
        assert_tokens(
            &ProcessingStrategy::RoundRobin,
            &[Token::UnitVariant {
                name: "ProcessingStrategy",
                variant: "ROUND_ROBIN",
            }],
        );
        assert_tokens(
            &ProcessingStrategy::Partitioning,
            &[Token::UnitVariant {
                name: "ProcessingStrategy",
                variant: "PARTITIONING",
            }],
        );
    }
}
