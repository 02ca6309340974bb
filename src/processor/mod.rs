//! Cooperative processors.
//!
//! A [`Processor`] is the runtime half of a transform. The execution
//! engine creates one instance per unit of parallelism and drives it
//! from a worker thread, one turn at a time. No method may block: if
//! a processor can't make progress (most often because its
//! [`Outbox`] is full) it returns and is called again on a later
//! turn.
//!
//! Per turn the engine calls, in order of priority:
//!
//! 1. [`Processor::process`] with a batch of records from one inbound
//!    ordinal. Records left in the [`Inbox`] are offered again.
//! 2. [`Processor::try_process_watermark`] when the coalesced
//!    watermark over all inputs advanced.
//! 3. [`Processor::complete_edge`] once an ordinal is exhausted.
//! 4. [`Processor::complete`] once all ordinals are exhausted, until
//!    it reports [`Poll::Ready`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Poll;

use crate::errors::ExecutionError;
use crate::item::Item;
use crate::window::Watermark;

pub(crate) mod aggregate;
pub(crate) mod connector;
pub(crate) mod join;
mod outbox;
pub(crate) mod transform;
pub(crate) mod window;

#[cfg(test)]
pub(crate) use outbox::testing;
pub use outbox::Outbox;
pub(crate) use outbox::{Message, Packet};

pub trait Processor: Send {
    fn init(&mut self, _context: &ProcessorContext) -> Result<(), ExecutionError> {
        Ok(())
    }

    /// Take records from `inbox`, which all arrived on `ordinal`.
    fn process(
        &mut self,
        ordinal: usize,
        inbox: &mut Inbox,
        outbox: &mut Outbox,
    ) -> Result<(), ExecutionError>;

    /// Called when no input was available this turn. Lets a processor
    /// emit things driven by the passing of time.
    fn on_idle(&mut self, _outbox: &mut Outbox) -> Result<(), ExecutionError> {
        Ok(())
    }

    /// The watermark over all inputs advanced. By default it's
    /// forwarded downstream.
    fn try_process_watermark(
        &mut self,
        watermark: Watermark,
        outbox: &mut Outbox,
    ) -> Result<Poll<()>, ExecutionError> {
        Ok(if outbox.offer_watermark(watermark) {
            Poll::Ready(())
        } else {
            Poll::Pending
        })
    }

    /// All upstream instances of `ordinal` are done.
    fn complete_edge(
        &mut self,
        _ordinal: usize,
        _outbox: &mut Outbox,
    ) -> Result<Poll<()>, ExecutionError> {
        Ok(Poll::Ready(()))
    }

    /// All input is done. Called again on later turns until it
    /// returns [`Poll::Ready`]. Processors without inputs (sources)
    /// do all of their work here.
    fn complete(&mut self, _outbox: &mut Outbox) -> Result<Poll<()>, ExecutionError> {
        Ok(Poll::Ready(()))
    }
}

/// Where a processor instance sits in the job.
#[derive(Debug, Clone)]
pub struct ProcessorContext {
    vertex: String,
    instance: usize,
    parallelism: usize,
    cancelled: Arc<AtomicBool>,
}

impl ProcessorContext {
    pub fn new(vertex: impl Into<String>, instance: usize, parallelism: usize) -> Self {
        Self::with_cancel_flag(vertex, instance, parallelism, Arc::new(AtomicBool::new(false)))
    }

    pub(crate) fn with_cancel_flag(
        vertex: impl Into<String>,
        instance: usize,
        parallelism: usize,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            vertex: vertex.into(),
            instance,
            parallelism,
            cancelled,
        }
    }

    pub fn vertex(&self) -> &str {
        &self.vertex
    }

    /// Index of this instance among the vertex's instances.
    pub fn instance(&self) -> usize {
        self.instance
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Records waiting to be processed, all from one ordinal.
#[derive(Debug, Default)]
pub struct Inbox {
    items: VecDeque<Item>,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn peek(&self) -> Option<&Item> {
        self.items.front()
    }

    pub fn poll(&mut self) -> Option<Item> {
        self.items.pop_front()
    }

    pub fn push(&mut self, item: Item) {
        self.items.push_back(item);
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Item> + '_ {
        self.items.drain(..)
    }
}

impl FromIterator<Item> for Inbox {
    fn from_iter<I: IntoIterator<Item = Item>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

/// Output a processor has produced but the outbox didn't take yet.
///
/// Offered again, in order, before anything new.
#[derive(Debug, Default)]
pub(crate) struct Pending {
    items: VecDeque<Item>,
}

impl Pending {
    pub(crate) fn push(&mut self, item: Item) {
        self.items.push_back(item);
    }

    pub(crate) fn extend(&mut self, items: impl IntoIterator<Item = Item>) {
        self.items.extend(items);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns whether everything was taken.
    pub(crate) fn offer_to(&mut self, outbox: &mut Outbox) -> Result<bool, ExecutionError> {
        while let Some(item) = self.items.front() {
            if outbox.offer(item)? {
                self.items.pop_front();
            } else {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
