//! Sources and sinks.
//!
//! Connectors are the edges of a pipeline: a [`Source`] feeds records
//! in, a [`Sink`] takes them out. Both are opened once per processor
//! instance, so a connector decides itself how to split its work
//! across instances.
//!
//! Input is based around [`SourceReader`] and output around
//! [`SinkWriter`]. Like processors, neither may block.

use std::task::Poll;

use crate::errors::ExecutionError;

mod sinks;
mod sources;

pub use sinks::*;
pub use sources::*;

/// Defines where the records of a pipeline come from.
pub trait Source<T>: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the source eventually runs out. Aggregations over an
    /// unbounded source need a window.
    fn is_bounded(&self) -> bool {
        true
    }

    /// Number of instances to read with, if the source wants a
    /// specific one.
    fn local_parallelism(&self) -> Option<usize> {
        None
    }

    /// Create the reader for one instance out of `parallelism`.
    fn open(&self, instance: usize, parallelism: usize) -> Box<dyn SourceReader<T>>;
}

/// Defines how a single instance of a source reads data.
pub trait SourceReader<T>: Send {
    /// Return the next item from this source, if any.
    ///
    /// This method must _never block or wait_ on data. If there's no
    /// data yet, return [`Poll::Pending`].
    ///
    /// - [`Poll::Pending`]: no new values ready yet.
    ///
    /// - [`Poll::Ready`] with a [`Some`]: a new value has arrived.
    ///
    /// - [`Poll::Ready`] with a [`None`]: the stream has ended and
    ///   [`SourceReader::next`] should not be called again.
    fn next(&mut self) -> Poll<Option<T>>;
}

/// Defines where the records of a pipeline end up.
pub trait Sink<T>: Send + Sync {
    fn name(&self) -> &str;

    fn local_parallelism(&self) -> Option<usize> {
        None
    }

    /// Create the writer for one instance out of `parallelism`.
    fn open(&self, instance: usize, parallelism: usize) -> Box<dyn SinkWriter<T>>;
}

/// Defines how a single instance of a sink writes data.
pub trait SinkWriter<T>: Send {
    /// Write a single item.
    fn push(&mut self, item: T) -> Result<(), ExecutionError>;

    /// Called after every batch of pushed items.
    fn flush(&mut self) -> Result<(), ExecutionError> {
        Ok(())
    }

    /// Called once, after the last item.
    fn close(&mut self) -> Result<(), ExecutionError> {
        Ok(())
    }
}
