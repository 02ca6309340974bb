//! Processors at the ends of a pipeline.

use std::sync::Arc;
use std::task::Poll;

use crate::adapter::FunctionAdapter;
use crate::connectors::{Sink, SinkWriter, Source, SourceReader};
use crate::errors::ExecutionError;
use crate::item::{Data, Item};
use crate::processor::{Inbox, Outbox, Processor, ProcessorContext};

/// Most items a source emits per turn, so other processors on the
/// same worker get to run.
const SOURCE_BATCH: usize = 1024;

pub(crate) struct SourceP<T> {
    source: Arc<dyn Source<T>>,
    reader: Option<Box<dyn SourceReader<T>>>,
    /// Read but not yet taken by the outbox.
    stashed: Option<Item>,
    emitted: u64,
}

impl<T: Data> SourceP<T> {
    pub(crate) fn new(source: Arc<dyn Source<T>>) -> Self {
        Self {
            source,
            reader: None,
            stashed: None,
            emitted: 0,
        }
    }
}

impl<T: Data> Processor for SourceP<T> {
    fn init(&mut self, context: &ProcessorContext) -> Result<(), ExecutionError> {
        tracing::debug!(
            source = self.source.name(),
            instance = context.instance(),
            "opening source"
        );
        self.reader = Some(self.source.open(context.instance(), context.parallelism()));
        Ok(())
    }

    fn process(
        &mut self,
        _ordinal: usize,
        _inbox: &mut Inbox,
        _outbox: &mut Outbox,
    ) -> Result<(), ExecutionError> {
        Ok(())
    }

    fn complete(&mut self, outbox: &mut Outbox) -> Result<Poll<()>, ExecutionError> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(Poll::Ready(()));
        };
        for _ in 0..SOURCE_BATCH {
            if let Some(item) = &self.stashed {
                if !outbox.offer(item)? {
                    return Ok(Poll::Pending);
                }
                self.stashed = None;
                self.emitted += 1;
            }
            match reader.next() {
                Poll::Ready(Some(value)) => self.stashed = Some(Item::new(value)),
                Poll::Ready(None) => {
                    tracing::debug!(
                        source = self.source.name(),
                        emitted = self.emitted,
                        "source exhausted"
                    );
                    self.reader = None;
                    return Ok(Poll::Ready(()));
                }
                Poll::Pending => return Ok(Poll::Pending),
            }
        }
        Ok(Poll::Pending)
    }
}

pub(crate) struct SinkP<T> {
    sink: Arc<dyn Sink<T>>,
    adapters: Vec<FunctionAdapter>,
    writer: Option<Box<dyn SinkWriter<T>>>,
}

impl<T: Data> SinkP<T> {
    pub(crate) fn new(sink: Arc<dyn Sink<T>>, adapters: Vec<FunctionAdapter>) -> Self {
        Self {
            sink,
            adapters,
            writer: None,
        }
    }
}

impl<T: Data> Processor for SinkP<T> {
    fn init(&mut self, context: &ProcessorContext) -> Result<(), ExecutionError> {
        self.writer = Some(self.sink.open(context.instance(), context.parallelism()));
        Ok(())
    }

    fn process(
        &mut self,
        ordinal: usize,
        inbox: &mut Inbox,
        _outbox: &mut Outbox,
    ) -> Result<(), ExecutionError> {
        let adapter = self.adapters.get(ordinal).copied().unwrap_or_default();
        if let Some(writer) = self.writer.as_mut() {
            while let Some(item) = inbox.poll() {
                writer.push(adapter.unwrap_value::<T>(item)?)?;
            }
            writer.flush()?;
        }
        Ok(())
    }

    fn complete(&mut self, _outbox: &mut Outbox) -> Result<Poll<()>, ExecutionError> {
        if let Some(mut writer) = self.writer.take() {
            writer.close()?;
            tracing::debug!(sink = self.sink.name(), "sink closed");
        }
        Ok(Poll::Ready(()))
    }
}
