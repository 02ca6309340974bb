use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{Sink, SinkWriter};
use crate::errors::ExecutionError;
use crate::item::Data;

/// Shared handle to everything a [`CollectSink`] received.
pub struct Collected<T>(Arc<Mutex<Vec<T>>>);

impl<T> Clone for Collected<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Clone> Collected<T> {
    fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        // A panicking writer can't leave a half-pushed item behind.
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the items received so far.
    pub fn snapshot(&self) -> Vec<T> {
        self.lock().clone()
    }

    /// Remove and return the items received so far.
    pub fn take(&self) -> Vec<T> {
        std::mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl<T: fmt::Debug> fmt::Debug for Collected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Collected").field(&self.0).finish()
    }
}

/// Collects all items into memory, in the order each instance
/// received them.
pub struct CollectSink<T> {
    items: Collected<T>,
}

/// Collect into a shared list. Returns the sink and the handle to
/// read the items from once the job is done.
pub fn collect<T: Data>() -> (CollectSink<T>, Collected<T>) {
    let items = Collected(Arc::new(Mutex::new(Vec::new())));
    (
        CollectSink {
            items: items.clone(),
        },
        items,
    )
}

impl<T: Data> Sink<T> for CollectSink<T> {
    fn name(&self) -> &str {
        "collect-sink"
    }

    fn open(&self, _instance: usize, _parallelism: usize) -> Box<dyn SinkWriter<T>> {
        Box::new(CollectWriter {
            items: self.items.clone(),
            buffer: Vec::new(),
        })
    }
}

struct CollectWriter<T> {
    items: Collected<T>,
    buffer: Vec<T>,
}

impl<T: Data> SinkWriter<T> for CollectWriter<T> {
    fn push(&mut self, item: T) -> Result<(), ExecutionError> {
        self.buffer.push(item);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ExecutionError> {
        self.items.lock().append(&mut self.buffer);
        Ok(())
    }

    fn close(&mut self) -> Result<(), ExecutionError> {
        self.flush()
    }
}

type CreateBufferFn<B> = Arc<dyn Fn(usize) -> B + Send + Sync>;
type ReceiveFn<B, T> = Arc<dyn Fn(&mut B, T) + Send + Sync>;
type FlushFn<B> = Arc<dyn Fn(&mut B) + Send + Sync>;
type DisposeFn<B> = Arc<dyn Fn(B) + Send + Sync>;

/// Sink around a user-managed buffer, one per instance.
pub struct BufferedSink<B, T> {
    name: String,
    create: CreateBufferFn<B>,
    on_receive: ReceiveFn<B, T>,
    flush: FlushFn<B>,
    dispose: DisposeFn<B>,
}

/// Build a sink out of four functions:
///
/// - `create(instance)` makes the instance's buffer, once.
/// - `on_receive(&mut buffer, item)` is called per item.
/// - `flush(&mut buffer)` is called after every batch of items.
/// - `dispose(buffer)` is called once the instance is done.
pub fn buffered<B, T>(
    name: impl Into<String>,
    create: impl Fn(usize) -> B + Send + Sync + 'static,
    on_receive: impl Fn(&mut B, T) + Send + Sync + 'static,
    flush: impl Fn(&mut B) + Send + Sync + 'static,
    dispose: impl Fn(B) + Send + Sync + 'static,
) -> BufferedSink<B, T>
where
    B: Send + 'static,
    T: Data,
{
    BufferedSink {
        name: name.into(),
        create: Arc::new(create),
        on_receive: Arc::new(on_receive),
        flush: Arc::new(flush),
        dispose: Arc::new(dispose),
    }
}

impl<B: Send + 'static, T: Data> Sink<T> for BufferedSink<B, T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self, instance: usize, _parallelism: usize) -> Box<dyn SinkWriter<T>> {
        Box::new(BufferedWriter {
            buffer: Some((self.create)(instance)),
            on_receive: self.on_receive.clone(),
            flush: self.flush.clone(),
            dispose: self.dispose.clone(),
        })
    }
}

struct BufferedWriter<B, T> {
    /// `None` once disposed.
    buffer: Option<B>,
    on_receive: ReceiveFn<B, T>,
    flush: FlushFn<B>,
    dispose: DisposeFn<B>,
}

impl<B: Send, T: Data> SinkWriter<T> for BufferedWriter<B, T> {
    fn push(&mut self, item: T) -> Result<(), ExecutionError> {
        match self.buffer.as_mut() {
            Some(buffer) => {
                (self.on_receive)(buffer, item);
                Ok(())
            }
            None => Err(ExecutionError::UserFunction(
                "buffered sink received an item after it was disposed".to_string(),
            )),
        }
    }

    fn flush(&mut self) -> Result<(), ExecutionError> {
        if let Some(buffer) = self.buffer.as_mut() {
            (self.flush)(buffer);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), ExecutionError> {
        if let Some(mut buffer) = self.buffer.take() {
            (self.flush)(&mut buffer);
            (self.dispose)(buffer);
        }
        Ok(())
    }
}

/// Logs every item at info level.
pub struct LoggerSink<T> {
    to_string: Arc<dyn Fn(&T) -> String + Send + Sync>,
}

pub fn logger<T: Data>(to_string: impl Fn(&T) -> String + Send + Sync + 'static) -> LoggerSink<T> {
    LoggerSink {
        to_string: Arc::new(to_string),
    }
}

impl<T: Data> Sink<T> for LoggerSink<T> {
    fn name(&self) -> &str {
        "logger-sink"
    }

    fn open(&self, instance: usize, _parallelism: usize) -> Box<dyn SinkWriter<T>> {
        Box::new(LoggerWriter {
            instance,
            to_string: self.to_string.clone(),
        })
    }
}

struct LoggerWriter<T> {
    instance: usize,
    to_string: Arc<dyn Fn(&T) -> String + Send + Sync>,
}

impl<T: Data> SinkWriter<T> for LoggerWriter<T> {
    fn push(&mut self, item: T) -> Result<(), ExecutionError> {
        tracing::info!(instance = self.instance, "{}", (self.to_string)(&item));
        Ok(())
    }
}
