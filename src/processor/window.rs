//! Event-time processors: stamping records with their timestamp and
//! aggregating them into windows.

use std::collections::BTreeMap;
use std::hash::Hash;
use std::marker::PhantomData;
use std::task::Poll;

use chrono::{DateTime, Utc};

use crate::adapter::{FunctionAdapter, ItemKeyFn, ItemTimestampFn};
use crate::aggregate::AggregateOperation;
use crate::errors::ExecutionError;
use crate::item::{Data, Item, Timestamped};
use crate::processor::aggregate::KeyedMap;
use crate::processor::{Inbox, Outbox, Pending, Processor, ProcessorContext};
use crate::window::{
    TimestampDefinition, Watermark, WatermarkPolicy, WindowDefinition, WindowKey, WindowResult,
};

/// Wraps records into [`Timestamped`] envelopes and emits the
/// watermarks its policy allows.
///
/// Watermarks coming from upstream are dropped; from here on event
/// time is whatever this processor says it is.
pub(crate) struct InsertWatermarksP<T> {
    def: TimestampDefinition<T>,
    upstream: FunctionAdapter,
    policy: Box<dyn WatermarkPolicy>,
    last_emitted: Option<DateTime<Utc>>,
    pending: Pending,
    pending_watermark: Option<Watermark>,
    _type: PhantomData<fn() -> T>,
}

impl<T: Data> InsertWatermarksP<T> {
    pub(crate) fn new(def: TimestampDefinition<T>, upstream: FunctionAdapter) -> Self {
        let policy = (def.policy)();
        Self {
            def,
            upstream,
            policy,
            last_emitted: None,
            pending: Pending::default(),
            pending_watermark: None,
            _type: PhantomData,
        }
    }

    fn consider(&mut self, policy_watermark: DateTime<Utc>) {
        let candidate = policy_watermark
            .checked_sub_signed(self.def.allowed_lateness)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        if self.def.emission.should_emit(self.last_emitted, candidate) {
            self.last_emitted = Some(candidate);
            self.pending_watermark = Some(Watermark(candidate));
        }
    }

    /// Records first, then the watermark that follows them. Returns
    /// whether everything went out.
    fn flush(&mut self, outbox: &mut Outbox) -> Result<bool, ExecutionError> {
        if !self.pending.offer_to(outbox)? {
            return Ok(false);
        }
        if let Some(watermark) = self.pending_watermark {
            if !outbox.offer_watermark(watermark) {
                return Ok(false);
            }
            self.pending_watermark = None;
        }
        Ok(true)
    }
}

impl<T: Data> Processor for InsertWatermarksP<T> {
    fn process(
        &mut self,
        _ordinal: usize,
        inbox: &mut Inbox,
        outbox: &mut Outbox,
    ) -> Result<(), ExecutionError> {
        if !self.flush(outbox)? {
            return Ok(());
        }
        while let Some(item) = inbox.poll() {
            let value = self.upstream.unwrap_value::<T>(item)?;
            let timestamp = (self.def.timestamp_fn)(&value);
            let policy_watermark = self.policy.report_event(timestamp);
            self.pending
                .push(Item::new(Timestamped::new(timestamp, value)));
            self.consider(policy_watermark);
            if !self.flush(outbox)? {
                break;
            }
        }
        Ok(())
    }

    fn on_idle(&mut self, outbox: &mut Outbox) -> Result<(), ExecutionError> {
        if self.flush(outbox)? {
            let policy_watermark = self.policy.current_watermark();
            self.consider(policy_watermark);
            self.flush(outbox)?;
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
        Ok(if self.flush(outbox)? {
            Poll::Ready(())
        } else {
            Poll::Pending
        })
    }
}

struct Window<K, A> {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    groups: KeyedMap<K, A>,
}

/// Keyed aggregation over event-time windows.
///
/// Emits a [`WindowResult`] per key and window, stamped with the
/// window end, as soon as the watermark reaches the window end. The
/// watermark is forwarded after the results it closed.
pub(crate) struct WindowGroupP<K, A, R> {
    def: WindowDefinition,
    op: AggregateOperation<A, R>,
    key_fns: Vec<ItemKeyFn<K>>,
    timestamp_fns: Vec<ItemTimestampFn>,
    adapters: Vec<FunctionAdapter>,
    windows: BTreeMap<WindowKey, Window<K, A>>,
    watermark: Option<DateTime<Utc>>,
    pending: Pending,
    late_items: u64,
    vertex: String,
}

impl<K, A, R> WindowGroupP<K, A, R>
where
    K: Data + Hash + Eq,
    A: Send + 'static,
    R: Data,
{
    pub(crate) fn new(
        def: WindowDefinition,
        op: AggregateOperation<A, R>,
        key_fns: Vec<ItemKeyFn<K>>,
        timestamp_fns: Vec<ItemTimestampFn>,
        adapters: Vec<FunctionAdapter>,
    ) -> Self {
        Self {
            def,
            op,
            key_fns,
            timestamp_fns,
            adapters,
            windows: BTreeMap::new(),
            watermark: None,
            pending: Pending::default(),
            late_items: 0,
            vertex: String::new(),
        }
    }

    fn is_late(&self, end: DateTime<Utc>) -> bool {
        self.watermark.map_or(false, |wm| end <= wm)
    }

    /// Finish every window ending at or before `until` and queue the
    /// results in window order.
    fn close_windows(&mut self, until: Option<DateTime<Utc>>) {
        while let Some(entry) = self.windows.first_entry() {
            if until.map_or(false, |until| entry.get().end > until) {
                break;
            }
            let window = entry.remove();
            for (key, acc) in window.groups {
                let result = WindowResult {
                    start: window.start,
                    end: window.end,
                    key,
                    result: self.op.finish(acc),
                };
                self.pending
                    .push(Item::new(Timestamped::new(window.end, result)));
            }
        }
    }
}

impl<K, A, R> Processor for WindowGroupP<K, A, R>
where
    K: Data + Hash + Eq,
    A: Send + 'static,
    R: Data,
{
    fn init(&mut self, context: &ProcessorContext) -> Result<(), ExecutionError> {
        self.vertex = context.vertex().to_string();
        Ok(())
    }

    fn process(
        &mut self,
        ordinal: usize,
        inbox: &mut Inbox,
        _outbox: &mut Outbox,
    ) -> Result<(), ExecutionError> {
        let adapter = self.adapters.get(ordinal).copied().unwrap_or_default();
        let (Some(key_fn), Some(timestamp_fn)) =
            (self.key_fns.get(ordinal), self.timestamp_fns.get(ordinal))
        else {
            return Err(crate::errors::ArityError {
                operation: "window-aggregate".to_string(),
                inbound: ordinal + 1,
                accumulators: self.key_fns.len(),
            }
            .into());
        };
        let (key_fn, timestamp_fn) = (key_fn.clone(), timestamp_fn.clone());

        while let Some(item) = inbox.poll() {
            let timestamp = timestamp_fn(&item)?;
            let all_bounds: Vec<_> = self.def.intersects(timestamp).collect();
            if all_bounds.is_empty() {
                // Falls in a gap between windows.
                continue;
            }
            let key = key_fn(&item)?;
            let mut accepted = false;
            for bounds in all_bounds {
                if self.is_late(bounds.end) {
                    continue;
                }
                accepted = true;
                let window = self.windows.entry(bounds.key).or_insert_with(|| Window {
                    start: bounds.start,
                    end: bounds.end,
                    groups: KeyedMap::default(),
                });
                let acc = window
                    .groups
                    .entry(key.clone())
                    .or_insert_with(|| self.op.create_accumulator());
                self.op.accumulate_item(ordinal, acc, item.clone(), adapter)?;
            }
            if !accepted {
                self.late_items += 1;
                tracing::debug!(
                    vertex = %self.vertex,
                    %timestamp,
                    watermark = ?self.watermark,
                    "dropping late record"
                );
            }
        }
        Ok(())
    }

    fn try_process_watermark(
        &mut self,
        watermark: Watermark,
        outbox: &mut Outbox,
    ) -> Result<Poll<()>, ExecutionError> {
        if self.watermark.map_or(true, |current| watermark.0 > current) {
            self.watermark = Some(watermark.0);
            self.close_windows(Some(watermark.0));
        }
        if !self.pending.offer_to(outbox)? || !outbox.offer_watermark(watermark) {
            return Ok(Poll::Pending);
        }
        Ok(Poll::Ready(()))
    }

    fn complete(&mut self, outbox: &mut Outbox) -> Result<Poll<()>, ExecutionError> {
        if !self.windows.is_empty() {
            self.close_windows(None);
            if self.late_items > 0 {
                tracing::debug!(
                    vertex = %self.vertex,
                    late_items = self.late_items,
                    "window aggregation dropped late records"
                );
            }
        }
        Ok(if self.pending.offer_to(outbox)? {
            Poll::Ready(())
        } else {
            Poll::Pending
        })
    }
}
