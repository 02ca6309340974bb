//! Switching user functions between raw records and event-time
//! envelopes.
//!
//! User functions are always written against the record type `T`.
//! Once a stage has a timestamp definition its records travel as
//! [`Timestamped<T>`], so every function attached downstream has to
//! be wrapped: unwrap the record, call the function, and put the
//! result back into an envelope carrying the same timestamp. The
//! [`FunctionAdapter`] of a stage does exactly that when a function
//! is registered on a transform.

use std::fmt::Display;
use std::panic::Location;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ExecutionError;
use crate::item::{Data, Item, Timestamped};
use crate::routing::{KeyFn, PartitionKey};

/// A record in, any number of records out.
pub type FlatMapFn = Arc<dyn Fn(Item) -> Result<Vec<Item>, ExecutionError> + Send + Sync>;

/// Extracts a typed key out of a record on an edge.
pub type ItemKeyFn<K> = Arc<dyn Fn(&Item) -> Result<K, ExecutionError> + Send + Sync>;

/// Reads the event time out of a record on an edge.
pub type ItemTimestampFn =
    Arc<dyn Fn(&Item) -> Result<DateTime<Utc>, ExecutionError> + Send + Sync>;

/// How records of a stage are represented on the wire.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionAdapter {
    /// Records are plain `T`.
    #[default]
    Raw,
    /// Records are [`Timestamped<T>`].
    Timestamped,
}

impl FunctionAdapter {
    pub fn is_timestamped(self) -> bool {
        self == Self::Timestamped
    }

    /// Split a record into its timestamp, if any, and its value.
    pub(crate) fn unwrap<T: Data>(
        self,
        item: Item,
    ) -> Result<(Option<DateTime<Utc>>, T), ExecutionError> {
        match self {
            Self::Raw => Ok((None, item.downcast::<T>()?)),
            Self::Timestamped => {
                let event = item.downcast::<Timestamped<T>>()?;
                Ok((Some(event.timestamp), event.item))
            }
        }
    }

    pub(crate) fn unwrap_value<T: Data>(self, item: Item) -> Result<T, ExecutionError> {
        self.unwrap(item).map(|(_, value)| value)
    }

    pub(crate) fn unwrap_ref<T: Data>(self, item: &Item) -> Result<&T, ExecutionError> {
        match self {
            Self::Raw => item.downcast_ref::<T>(),
            Self::Timestamped => Ok(&item.downcast_ref::<Timestamped<T>>()?.item),
        }
    }

    pub(crate) fn timestamp_of<T: Data>(
        self,
        item: &Item,
    ) -> Result<Option<DateTime<Utc>>, ExecutionError> {
        match self {
            Self::Raw => Ok(None),
            Self::Timestamped => Ok(Some(item.downcast_ref::<Timestamped<T>>()?.timestamp)),
        }
    }

    /// Event time of records of type `T`. Records of a raw stage have
    /// none, so every call fails.
    pub(crate) fn adapt_timestamp_of<T: Data>(self) -> ItemTimestampFn {
        Arc::new(move |item: &Item| -> Result<DateTime<Utc>, ExecutionError> {
            self.timestamp_of::<T>(item)?
                .ok_or_else(ExecutionError::item_type::<Timestamped<T>>)
        })
    }

    /// Put a value back into the representation of this adapter.
    pub(crate) fn wrap<R: Data>(self, timestamp: Option<DateTime<Utc>>, value: R) -> Item {
        match (self, timestamp) {
            (Self::Timestamped, Some(timestamp)) => Item::new(Timestamped::new(timestamp, value)),
            _ => Item::new(value),
        }
    }

    pub(crate) fn adapt_map<T, R, F>(self, f: F) -> FlatMapFn
    where
        T: Data,
        R: Data,
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        Arc::new(move |item: Item| -> Result<Vec<Item>, ExecutionError> {
            let (timestamp, value) = self.unwrap::<T>(item)?;
            Ok(vec![self.wrap(timestamp, f(value))])
        })
    }

    /// Errors of `f` are tagged with `caller`.
    pub(crate) fn adapt_try_map<T, R, E, F>(
        self,
        caller: &'static Location<'static>,
        f: F,
    ) -> FlatMapFn
    where
        T: Data,
        R: Data,
        E: Display,
        F: Fn(T) -> Result<R, E> + Send + Sync + 'static,
    {
        Arc::new(move |item: Item| -> Result<Vec<Item>, ExecutionError> {
            let (timestamp, value) = self.unwrap::<T>(item)?;
            let mapped = f(value).map_err(|err| ExecutionError::user(caller, err))?;
            Ok(vec![self.wrap(timestamp, mapped)])
        })
    }

    pub(crate) fn adapt_filter<T, F>(self, f: F) -> FlatMapFn
    where
        T: Data,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Arc::new(move |item: Item| -> Result<Vec<Item>, ExecutionError> {
            if f(self.unwrap_ref::<T>(&item)?) {
                Ok(vec![item])
            } else {
                Ok(Vec::new())
            }
        })
    }

    pub(crate) fn adapt_flat_map<T, R, I, F>(self, f: F) -> FlatMapFn
    where
        T: Data,
        R: Data,
        I: IntoIterator<Item = R>,
        F: Fn(T) -> I + Send + Sync + 'static,
    {
        Arc::new(move |item: Item| -> Result<Vec<Item>, ExecutionError> {
            let (timestamp, value) = self.unwrap::<T>(item)?;
            Ok(f(value)
                .into_iter()
                .map(|out| self.wrap(timestamp, out))
                .collect())
        })
    }

    pub(crate) fn adapt_key_fn<T, K>(
        self,
        f: Arc<dyn Fn(&T) -> K + Send + Sync>,
    ) -> ItemKeyFn<K>
    where
        T: Data,
        K: 'static,
    {
        Arc::new(move |item: &Item| -> Result<K, ExecutionError> {
            Ok(f(self.unwrap_ref::<T>(item)?))
        })
    }

    /// Key function for the partitioned edge feeding a keyed
    /// transform, so that records with equal keys meet on the same
    /// instance.
    pub(crate) fn adapt_partition_key<T, K>(self, f: Arc<dyn Fn(&T) -> K + Send + Sync>) -> KeyFn
    where
        T: Data,
        K: Serialize + 'static,
    {
        Arc::new(move |item: &Item| -> Result<PartitionKey, ExecutionError> {
            let key = f(self.unwrap_ref::<T>(item)?);
            Ok(PartitionKey::of(&key)?)
        })
    }

    /// Turn the output of a hash-join into a record carrying the
    /// primary record's timestamp.
    #[allow(clippy::type_complexity)]
    pub(crate) fn adapt_join_output<T0, T1, R, F>(
        self,
        f: F,
    ) -> Arc<dyn Fn(Item, Vec<Option<Item>>) -> Result<Item, ExecutionError> + Send + Sync>
    where
        T0: Data,
        T1: Data,
        R: Data,
        F: Fn(T0, Option<T1>) -> R + Send + Sync + 'static,
    {
        Arc::new(
            move |primary: Item, mut matches: Vec<Option<Item>>| -> Result<Item, ExecutionError> {
                let (timestamp, value) = self.unwrap::<T0>(primary)?;
                let first = take_match::<T1>(&mut matches, 0)?;
                Ok(self.wrap(timestamp, f(value, first)))
            },
        )
    }

    #[allow(clippy::type_complexity)]
    pub(crate) fn adapt_join_output2<T0, T1, T2, R, F>(
        self,
        f: F,
    ) -> Arc<dyn Fn(Item, Vec<Option<Item>>) -> Result<Item, ExecutionError> + Send + Sync>
    where
        T0: Data,
        T1: Data,
        T2: Data,
        R: Data,
        F: Fn(T0, Option<T1>, Option<T2>) -> R + Send + Sync + 'static,
    {
        Arc::new(
            move |primary: Item, mut matches: Vec<Option<Item>>| -> Result<Item, ExecutionError> {
                let (timestamp, value) = self.unwrap::<T0>(primary)?;
                let first = take_match::<T1>(&mut matches, 0)?;
                let second = take_match::<T2>(&mut matches, 1)?;
                Ok(self.wrap(timestamp, f(value, first, second)))
            },
        )
    }
}

fn take_match<T: Data>(
    matches: &mut [Option<Item>],
    index: usize,
) -> Result<Option<T>, ExecutionError> {
    matches
        .get_mut(index)
        .and_then(Option::take)
        .map(Item::downcast::<T>)
        .transpose()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn raw_map_sees_plain_records() {
        let map = FunctionAdapter::Raw.adapt_map(|x: u32| x * 2);
        let out = map(Item::new(21u32)).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].clone().downcast::<u32>().unwrap(), 42);
    }

    #[test]
    fn timestamped_map_keeps_timestamp() {
        let map = FunctionAdapter::Timestamped.adapt_map(|x: u32| format!("n{x}"));
        let out = map(Item::new(Timestamped::new(ts(), 7u32))).unwrap();
        let event = out[0].clone().downcast::<Timestamped<String>>().unwrap();
        assert_eq!(event, Timestamped::new(ts(), "n7".to_string()));
    }

    #[test]
    fn timestamped_filter_passes_envelope_through() {
        let filter = FunctionAdapter::Timestamped.adapt_filter(|x: &u32| *x > 5);
        assert!(filter(Item::new(Timestamped::new(ts(), 3u32)))
            .unwrap()
            .is_empty());
        let kept = filter(Item::new(Timestamped::new(ts(), 9u32))).unwrap();
        assert!(kept[0].is::<Timestamped<u32>>());
    }

    #[test]
    fn flat_map_wraps_each_output() {
        let flat_map =
            FunctionAdapter::Timestamped.adapt_flat_map(|s: String| s.chars().collect::<Vec<_>>());
        let out = flat_map(Item::new(Timestamped::new(ts(), "ab".to_string()))).unwrap();
        let chars: Vec<_> = out
            .into_iter()
            .map(|item| item.downcast::<Timestamped<char>>().unwrap().item)
            .collect();
        assert_eq!(chars, vec!['a', 'b']);
    }

    #[test]
    fn key_fn_unwraps_envelope() {
        let key_fn = FunctionAdapter::Timestamped
            .adapt_key_fn::<(String, u32), String>(Arc::new(|x: &(String, u32)| x.0.clone()));
        let key = key_fn(&Item::new(Timestamped::new(ts(), ("k".to_string(), 1u32)))).unwrap();
        assert_eq!(key, "k");
    }

    #[test]
    fn raw_adapter_rejects_envelopes() {
        let map = FunctionAdapter::Raw.adapt_map(|x: u32| x);
        assert!(matches!(
            map(Item::new(Timestamped::new(ts(), 1u32))),
            Err(ExecutionError::ItemType { .. })
        ));
    }

    #[test]
    fn try_map_reports_user_errors() {
        let map =
            FunctionAdapter::Raw.adapt_try_map(Location::caller(), |s: String| s.parse::<u32>());
        match map(Item::new("nope".to_string())) {
            Err(ExecutionError::UserFunction(msg)) => assert!(msg.contains("adapter.rs"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
