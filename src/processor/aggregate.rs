//! Aggregation processors: one global accumulator, or one per key.

use std::collections::{HashMap, VecDeque};
use std::hash::{BuildHasherDefault, Hash};
use std::sync::Arc;
use std::task::Poll;

use seahash::SeaHasher;

use crate::adapter::{FunctionAdapter, ItemKeyFn};
use crate::aggregate::AggregateOperation;
use crate::errors::ExecutionError;
use crate::item::Item;
use crate::processor::{Inbox, Outbox, Pending, Processor};
use crate::window::Watermark;

pub(crate) type KeyedMap<K, V> = HashMap<K, V, BuildHasherDefault<SeaHasher>>;

enum AggregateState<A> {
    Accumulating(A),
    /// `finish` already ran, the result waits for room in the outbox.
    Emitting(Item),
    Done,
}

/// Aggregates everything it receives into a single accumulator and
/// emits one result once all input is done.
pub(crate) struct AggregateP<A, R> {
    op: AggregateOperation<A, R>,
    adapters: Vec<FunctionAdapter>,
    output: Arc<dyn Fn(R) -> Item + Send + Sync>,
    state: AggregateState<A>,
}

impl<A: Send + 'static, R: 'static> AggregateP<A, R> {
    pub(crate) fn new(
        op: AggregateOperation<A, R>,
        adapters: Vec<FunctionAdapter>,
        output: Arc<dyn Fn(R) -> Item + Send + Sync>,
    ) -> Self {
        let acc = op.create_accumulator();
        Self {
            op,
            adapters,
            output,
            state: AggregateState::Accumulating(acc),
        }
    }
}

impl<A: Send + 'static, R: 'static> Processor for AggregateP<A, R> {
    fn process(
        &mut self,
        ordinal: usize,
        inbox: &mut Inbox,
        _outbox: &mut Outbox,
    ) -> Result<(), ExecutionError> {
        let adapter = self.adapters.get(ordinal).copied().unwrap_or_default();
        if let AggregateState::Accumulating(acc) = &mut self.state {
            while let Some(item) = inbox.poll() {
                self.op.accumulate_item(ordinal, acc, item, adapter)?;
            }
        }
        Ok(())
    }

    /// The result has no event time, so watermarks stop here.
    fn try_process_watermark(
        &mut self,
        _watermark: Watermark,
        _outbox: &mut Outbox,
    ) -> Result<Poll<()>, ExecutionError> {
        Ok(Poll::Ready(()))
    }

    fn complete(&mut self, outbox: &mut Outbox) -> Result<Poll<()>, ExecutionError> {
        if let AggregateState::Accumulating(_) = self.state {
            if let AggregateState::Accumulating(acc) =
                std::mem::replace(&mut self.state, AggregateState::Done)
            {
                let result = self.op.finish(acc);
                self.state = AggregateState::Emitting((self.output)(result));
            }
        }
        match &self.state {
            AggregateState::Emitting(item) => {
                if outbox.offer(item)? {
                    self.state = AggregateState::Done;
                    Ok(Poll::Ready(()))
                } else {
                    Ok(Poll::Pending)
                }
            }
            _ => Ok(Poll::Ready(())),
        }
    }
}

/// Aggregates records per key, across any number of inbound
/// ordinals, and emits one result per key once all input is done.
///
/// Accumulators are created lazily on a key's first record.
pub(crate) struct GroupP<K, A, R> {
    op: AggregateOperation<A, R>,
    key_fns: Vec<ItemKeyFn<K>>,
    adapters: Vec<FunctionAdapter>,
    output: Arc<dyn Fn(K, R) -> Item + Send + Sync>,
    groups: KeyedMap<K, A>,
    emitting: Option<VecDeque<(K, A)>>,
    pending: Pending,
}

impl<K, A, R> GroupP<K, A, R>
where
    K: Hash + Eq + Send + 'static,
    A: Send + 'static,
    R: 'static,
{
    pub(crate) fn new(
        op: AggregateOperation<A, R>,
        key_fns: Vec<ItemKeyFn<K>>,
        adapters: Vec<FunctionAdapter>,
        output: Arc<dyn Fn(K, R) -> Item + Send + Sync>,
    ) -> Self {
        Self {
            op,
            key_fns,
            adapters,
            output,
            groups: KeyedMap::default(),
            emitting: None,
            pending: Pending::default(),
        }
    }
}

impl<K, A, R> Processor for GroupP<K, A, R>
where
    K: Hash + Eq + Send + 'static,
    A: Send + 'static,
    R: 'static,
{
    fn process(
        &mut self,
        ordinal: usize,
        inbox: &mut Inbox,
        _outbox: &mut Outbox,
    ) -> Result<(), ExecutionError> {
        let adapter = self.adapters.get(ordinal).copied().unwrap_or_default();
        let key_fn = self.key_fns.get(ordinal).ok_or_else(|| {
            ExecutionError::Arity(crate::errors::ArityError {
                operation: "group-and-aggregate".to_string(),
                inbound: ordinal + 1,
                accumulators: self.key_fns.len(),
            })
        })?;
        while let Some(item) = inbox.poll() {
            let key = key_fn(&item)?;
            let acc = self
                .groups
                .entry(key)
                .or_insert_with(|| self.op.create_accumulator());
            self.op.accumulate_item(ordinal, acc, item, adapter)?;
        }
        Ok(())
    }

    fn try_process_watermark(
        &mut self,
        _watermark: Watermark,
        _outbox: &mut Outbox,
    ) -> Result<Poll<()>, ExecutionError> {
        Ok(Poll::Ready(()))
    }

    fn complete(&mut self, outbox: &mut Outbox) -> Result<Poll<()>, ExecutionError> {
        let groups = &mut self.groups;
        let emitting = self
            .emitting
            .get_or_insert_with(|| groups.drain().collect());
        loop {
            if !self.pending.offer_to(outbox)? {
                return Ok(Poll::Pending);
            }
            match emitting.pop_front() {
                Some((key, acc)) => {
                    let result = self.op.finish(acc);
                    self.pending.push((self.output)(key, result));
                }
                None => return Ok(Poll::Ready(())),
            }
        }
    }
}
