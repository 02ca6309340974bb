//! Stateless one-record-at-a-time processors.

use std::sync::Arc;
use std::task::Poll;

use crate::adapter::FlatMapFn;
use crate::errors::ExecutionError;
use crate::item::Item;
use crate::processor::{Inbox, Outbox, Pending, Processor, ProcessorContext};
use crate::window::Watermark;

/// Runs a map, filter or flat-map function over every record.
pub(crate) struct TransformP {
    f: FlatMapFn,
    pending: Pending,
}

impl TransformP {
    pub(crate) fn new(f: FlatMapFn) -> Self {
        Self {
            f,
            pending: Pending::default(),
        }
    }
}

impl Processor for TransformP {
    fn process(
        &mut self,
        _ordinal: usize,
        inbox: &mut Inbox,
        outbox: &mut Outbox,
    ) -> Result<(), ExecutionError> {
        if !self.pending.offer_to(outbox)? {
            return Ok(());
        }
        while let Some(item) = inbox.poll() {
            self.pending.extend((self.f)(item)?);
            if !self.pending.offer_to(outbox)? {
                break;
            }
        }
        Ok(())
    }

    fn try_process_watermark(
        &mut self,
        watermark: Watermark,
        outbox: &mut Outbox,
    ) -> Result<Poll<()>, ExecutionError> {
        if !self.pending.offer_to(outbox)? || !outbox.offer_watermark(watermark) {
            return Ok(Poll::Pending);
        }
        Ok(Poll::Ready(()))
    }

    fn complete(&mut self, outbox: &mut Outbox) -> Result<Poll<()>, ExecutionError> {
        Ok(if self.pending.offer_to(outbox)? {
            Poll::Ready(())
        } else {
            Poll::Pending
        })
    }
}

pub(crate) type PeekFn = Arc<dyn Fn(&Item) -> Result<Option<String>, ExecutionError> + Send + Sync>;

/// Logs records as they pass through, untouched.
pub(crate) struct PeekP {
    format: PeekFn,
    vertex: String,
    instance: usize,
}

impl PeekP {
    pub(crate) fn new(format: PeekFn) -> Self {
        Self {
            format,
            vertex: String::new(),
            instance: 0,
        }
    }
}

impl Processor for PeekP {
    fn init(&mut self, context: &ProcessorContext) -> Result<(), ExecutionError> {
        self.vertex = context.vertex().to_string();
        self.instance = context.instance();
        Ok(())
    }

    fn process(
        &mut self,
        _ordinal: usize,
        inbox: &mut Inbox,
        outbox: &mut Outbox,
    ) -> Result<(), ExecutionError> {
        while let Some(item) = inbox.peek() {
            if !outbox.offer(item)? {
                break;
            }
            if let Some(line) = (self.format)(item)? {
                tracing::info!(vertex = %self.vertex, instance = self.instance, "{line}");
            }
            inbox.poll();
        }
        Ok(())
    }
}
