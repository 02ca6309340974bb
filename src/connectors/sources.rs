use std::marker::PhantomData;
use std::sync::Arc;
use std::task::Poll;

use super::{Source, SourceReader};
use crate::item::Data;

/// Emits the items of a list, split between instances by index.
pub struct ListSource<T> {
    name: String,
    items: Arc<Vec<T>>,
    bounded: bool,
}

/// Read from a list. Instance `i` of `p` reads the items whose index
/// is `i` modulo `p`.
pub fn list<T: Data>(items: impl IntoIterator<Item = T>) -> ListSource<T> {
    ListSource {
        name: "list-source".to_string(),
        items: Arc::new(items.into_iter().collect()),
        bounded: true,
    }
}

impl<T> ListSource<T> {
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Treat the list as an endless stream, so the pipeline has to
    /// handle it like one.
    pub fn unbounded(mut self) -> Self {
        self.bounded = false;
        self
    }
}

impl<T: Data> Source<T> for ListSource<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_bounded(&self) -> bool {
        self.bounded
    }

    fn open(&self, instance: usize, parallelism: usize) -> Box<dyn SourceReader<T>> {
        Box::new(ListReader {
            items: self.items.clone(),
            next: instance,
            step: parallelism.max(1),
        })
    }
}

struct ListReader<T> {
    items: Arc<Vec<T>>,
    next: usize,
    step: usize,
}

impl<T: Data> SourceReader<T> for ListReader<T> {
    fn next(&mut self) -> Poll<Option<T>> {
        let item = self.items.get(self.next).cloned();
        self.next += self.step;
        Poll::Ready(item)
    }
}

/// A source that calls a builder once per instance and then polls
/// the function it returned.
pub struct FnSource<T, B> {
    name: String,
    builder: B,
    bounded: bool,
    _type: PhantomData<fn() -> T>,
}

/// Read by polling a function.
///
/// `builder(instance, parallelism)` returns a poll function per
/// instance; it must return [`Poll::Pending`] instead of waiting when
/// nothing is available, and `Poll::Ready(None)` once done. The source
/// is unbounded unless [`FnSource::bounded`] is called.
pub fn from_fn<T, B, F>(name: impl Into<String>, builder: B) -> FnSource<T, B>
where
    T: Data,
    B: Fn(usize, usize) -> F + Send + Sync + 'static,
    F: FnMut() -> Poll<Option<T>> + Send + 'static,
{
    FnSource {
        name: name.into(),
        builder,
        bounded: false,
        _type: PhantomData,
    }
}

impl<T, B> FnSource<T, B> {
    pub fn bounded(mut self) -> Self {
        self.bounded = true;
        self
    }
}

impl<T, B, F> Source<T> for FnSource<T, B>
where
    T: Data,
    B: Fn(usize, usize) -> F + Send + Sync + 'static,
    F: FnMut() -> Poll<Option<T>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn is_bounded(&self) -> bool {
        self.bounded
    }

    fn open(&self, instance: usize, parallelism: usize) -> Box<dyn SourceReader<T>> {
        Box::new(FnReader((self.builder)(instance, parallelism)))
    }
}

struct FnReader<F>(F);

impl<T, F> SourceReader<T> for FnReader<F>
where
    F: FnMut() -> Poll<Option<T>> + Send,
{
    fn next(&mut self) -> Poll<Option<T>> {
        (self.0)()
    }
}
