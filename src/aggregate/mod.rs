//! Aggregate operations.
//!
//! An [`AggregateOperation`] is a bundle of primitives over a mutable
//! accumulator: `create` makes a fresh one, an `accumulate` function
//! per input ordinal folds one record into it, the optional `combine`
//! merges two partial accumulators and `finish` turns it into the
//! result.
//!
//! Operations are put together with a builder that tracks the record
//! type of every ordinal:
//!
//! ```
//! use jetflow::aggregate::with_create;
//!
//! let op = with_create(|| (0i64, 0i64))
//!     .and_accumulate0(|acc: &mut (i64, i64), x: i64| acc.0 += x)
//!     .and_accumulate1(|acc: &mut (i64, i64), x: i64| acc.1 += x)
//!     .and_combine(|acc, other| {
//!         acc.0 += other.0;
//!         acc.1 += other.1;
//!     })
//!     .and_finish(|acc| acc.0 - acc.1);
//! assert_eq!(op.arity(), 2);
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

use crate::adapter::FunctionAdapter;
use crate::errors::{ArityError, ExecutionError};
use crate::item::{Data, Item};

pub mod operations;

pub use operations::*;

type CreateFn<A> = Arc<dyn Fn() -> A + Send + Sync>;
pub(crate) type AccumulateFn<A> =
    Arc<dyn Fn(&mut A, Item, FunctionAdapter) -> Result<(), ExecutionError> + Send + Sync>;
type CombineFn<A> = Arc<dyn Fn(&mut A, A) + Send + Sync>;
type FinishFn<A, R> = Arc<dyn Fn(A) -> R + Send + Sync>;

/// Identifies the input ordinal of a multi-input aggregation and the
/// type of its records.
pub struct Tag<T> {
    index: usize,
    _type: PhantomData<fn() -> T>,
}

impl<T> Tag<T> {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            _type: PhantomData,
        }
    }

    pub fn tag0() -> Self {
        Self::new(0)
    }

    pub fn tag1() -> Self {
        Self::new(1)
    }

    pub fn tag2() -> Self {
        Self::new(2)
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl<T> Clone for Tag<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Tag<T> {}

impl<T> fmt::Debug for Tag<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({})", self.index)
    }
}

/// Erased form of an aggregate operation. See the typed
/// [`AggregateOperation1`], [`AggregateOperation2`] and
/// [`AggregateOperation3`] wrappers.
pub struct AggregateOperation<A, R> {
    create: CreateFn<A>,
    accumulate: Vec<Option<AccumulateFn<A>>>,
    combine: Option<CombineFn<A>>,
    finish: FinishFn<A, R>,
}

impl<A, R> Clone for AggregateOperation<A, R> {
    fn clone(&self) -> Self {
        Self {
            create: self.create.clone(),
            accumulate: self.accumulate.clone(),
            combine: self.combine.clone(),
            finish: self.finish.clone(),
        }
    }
}

impl<A: 'static, R: 'static> AggregateOperation<A, R> {
    /// Number of input ordinals, including any gaps left by a builder
    /// that skipped a tag.
    pub fn arity(&self) -> usize {
        self.accumulate.len()
    }

    /// Number of ordinals that actually have an accumulate function.
    pub fn accumulate_count(&self) -> usize {
        self.accumulate.iter().filter(|f| f.is_some()).count()
    }

    pub fn has_accumulate(&self, ordinal: usize) -> bool {
        matches!(self.accumulate.get(ordinal), Some(Some(_)))
    }

    pub fn create_accumulator(&self) -> A {
        (self.create)()
    }

    pub(crate) fn accumulate_item(
        &self,
        ordinal: usize,
        acc: &mut A,
        item: Item,
        adapter: FunctionAdapter,
    ) -> Result<(), ExecutionError> {
        match self.accumulate.get(ordinal) {
            Some(Some(f)) => f(acc, item, adapter),
            _ => Err(ArityError {
                operation: "aggregate operation".to_string(),
                inbound: ordinal + 1,
                accumulators: self.accumulate_count(),
            }
            .into()),
        }
    }

    pub fn has_combine(&self) -> bool {
        self.combine.is_some()
    }

    /// Merge `other` into `acc`. Returns `false` and leaves `acc`
    /// alone if the operation has no combine function.
    pub fn combine(&self, acc: &mut A, other: A) -> bool {
        match &self.combine {
            Some(combine) => {
                combine(acc, other);
                true
            }
            None => false,
        }
    }

    /// Rebuild one accumulator out of partial accumulators, e.g.
    /// restored from a snapshot. `None` if the operation can't
    /// combine.
    pub fn restore_partial(&self, partials: impl IntoIterator<Item = A>) -> Option<A> {
        let combine = self.combine.as_ref()?;
        let mut acc = self.create_accumulator();
        for partial in partials {
            combine(&mut acc, partial);
        }
        Some(acc)
    }

    pub fn finish(&self, acc: A) -> R {
        (self.finish)(acc)
    }

    /// Transform the result of `finish`.
    pub fn and_then<R2: 'static>(
        self,
        then: impl Fn(R) -> R2 + Send + Sync + 'static,
    ) -> AggregateOperation<A, R2> {
        let finish = self.finish;
        AggregateOperation {
            create: self.create,
            accumulate: self.accumulate,
            combine: self.combine,
            finish: Arc::new(move |acc| then(finish(acc))),
        }
    }
}

impl<A, R> fmt::Debug for AggregateOperation<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateOperation")
            .field("arity", &self.accumulate.len())
            .field("combine", &self.combine.is_some())
            .finish_non_exhaustive()
    }
}

macro_rules! typed_operation {
    ($name:ident, $($t:ident),+) => {
        /// Aggregate operation with statically typed inputs.
        pub struct $name<$($t,)+ A, R> {
            op: AggregateOperation<A, R>,
            _types: PhantomData<fn($($t),+)>,
        }

        impl<$($t,)+ A, R> Clone for $name<$($t,)+ A, R> {
            fn clone(&self) -> Self {
                Self {
                    op: self.op.clone(),
                    _types: PhantomData,
                }
            }
        }

        impl<$($t,)+ A, R> Deref for $name<$($t,)+ A, R> {
            type Target = AggregateOperation<A, R>;

            fn deref(&self) -> &Self::Target {
                &self.op
            }
        }

        impl<$($t,)+ A, R> fmt::Debug for $name<$($t,)+ A, R> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.op.fmt(f)
            }
        }

        impl<$($t,)+ A: 'static, R: 'static> $name<$($t,)+ A, R> {
            fn wrap(op: AggregateOperation<A, R>) -> Self {
                Self {
                    op,
                    _types: PhantomData,
                }
            }

            pub fn and_then<R2: 'static>(
                self,
                then: impl Fn(R) -> R2 + Send + Sync + 'static,
            ) -> $name<$($t,)+ A, R2> {
                $name::wrap(self.op.and_then(then))
            }

            pub fn into_operation(self) -> AggregateOperation<A, R> {
                self.op
            }
        }
    };
}

typed_operation!(AggregateOperation1, T0);
typed_operation!(AggregateOperation2, T0, T1);
typed_operation!(AggregateOperation3, T0, T1, T2);

impl<T0: Data, A: 'static, R: 'static> AggregateOperation1<T0, A, R> {
    pub fn accumulate(&self, acc: &mut A, item: T0) -> Result<(), ExecutionError> {
        self.op
            .accumulate_item(0, acc, Item::new(item), FunctionAdapter::Raw)
    }
}

impl<T0: Data, T1: Data, A: 'static, R: 'static> AggregateOperation2<T0, T1, A, R> {
    pub fn accumulate0(&self, acc: &mut A, item: T0) -> Result<(), ExecutionError> {
        self.op
            .accumulate_item(0, acc, Item::new(item), FunctionAdapter::Raw)
    }

    pub fn accumulate1(&self, acc: &mut A, item: T1) -> Result<(), ExecutionError> {
        self.op
            .accumulate_item(1, acc, Item::new(item), FunctionAdapter::Raw)
    }
}

fn erase<A, T, F>(f: F) -> AccumulateFn<A>
where
    A: 'static,
    T: Data,
    F: Fn(&mut A, T) + Send + Sync + 'static,
{
    Arc::new(
        move |acc: &mut A, item: Item, adapter: FunctionAdapter| -> Result<(), ExecutionError> {
            f(acc, adapter.unwrap_value::<T>(item)?);
            Ok(())
        },
    )
}

/// Start building an aggregate operation around an accumulator
/// factory.
pub fn with_create<A: 'static>(
    create: impl Fn() -> A + Send + Sync + 'static,
) -> AggregateOperationBuilder<A, ()> {
    AggregateOperationBuilder {
        create: Arc::new(create),
        accumulate: Vec::new(),
        combine: None,
        _types: PhantomData,
    }
}

/// Builder for operations with 1 to 3 statically typed inputs. `Ts`
/// is the tuple of input types defined so far.
pub struct AggregateOperationBuilder<A, Ts> {
    create: CreateFn<A>,
    accumulate: Vec<Option<AccumulateFn<A>>>,
    combine: Option<CombineFn<A>>,
    _types: PhantomData<fn() -> Ts>,
}

impl<A: 'static, Ts> AggregateOperationBuilder<A, Ts> {
    fn push<Ts2>(mut self, f: AccumulateFn<A>) -> AggregateOperationBuilder<A, Ts2> {
        self.accumulate.push(Some(f));
        AggregateOperationBuilder {
            create: self.create,
            accumulate: self.accumulate,
            combine: self.combine,
            _types: PhantomData,
        }
    }

    fn build<R: 'static>(
        self,
        finish: impl Fn(A) -> R + Send + Sync + 'static,
    ) -> AggregateOperation<A, R> {
        AggregateOperation {
            create: self.create,
            accumulate: self.accumulate,
            combine: self.combine,
            finish: Arc::new(finish),
        }
    }

    pub fn and_combine(mut self, combine: impl Fn(&mut A, A) + Send + Sync + 'static) -> Self {
        self.combine = Some(Arc::new(combine));
        self
    }
}

impl<A: 'static> AggregateOperationBuilder<A, ()> {
    pub fn and_accumulate0<T0: Data>(
        self,
        f: impl Fn(&mut A, T0) + Send + Sync + 'static,
    ) -> AggregateOperationBuilder<A, (T0,)> {
        self.push(erase(f))
    }

    /// Switch to the builder for an arbitrary number of inputs,
    /// identified by tags.
    pub fn and_accumulate<T: Data>(
        self,
        tag: Tag<T>,
        f: impl Fn(&mut A, T) + Send + Sync + 'static,
    ) -> VarArityBuilder<A> {
        VarArityBuilder {
            create: self.create,
            accumulate: Vec::new(),
            combine: self.combine,
        }
        .and_accumulate(tag, f)
    }
}

impl<A: 'static, T0> AggregateOperationBuilder<A, (T0,)> {
    pub fn and_accumulate1<T1: Data>(
        self,
        f: impl Fn(&mut A, T1) + Send + Sync + 'static,
    ) -> AggregateOperationBuilder<A, (T0, T1)> {
        self.push(erase(f))
    }

    pub fn and_finish<R: 'static>(
        self,
        finish: impl Fn(A) -> R + Send + Sync + 'static,
    ) -> AggregateOperation1<T0, A, R> {
        AggregateOperation1::wrap(self.build(finish))
    }
}

impl<A: 'static, T0, T1> AggregateOperationBuilder<A, (T0, T1)> {
    pub fn and_accumulate2<T2: Data>(
        self,
        f: impl Fn(&mut A, T2) + Send + Sync + 'static,
    ) -> AggregateOperationBuilder<A, (T0, T1, T2)> {
        self.push(erase(f))
    }

    pub fn and_finish<R: 'static>(
        self,
        finish: impl Fn(A) -> R + Send + Sync + 'static,
    ) -> AggregateOperation2<T0, T1, A, R> {
        AggregateOperation2::wrap(self.build(finish))
    }
}

impl<A: 'static, T0, T1, T2> AggregateOperationBuilder<A, (T0, T1, T2)> {
    pub fn and_finish<R: 'static>(
        self,
        finish: impl Fn(A) -> R + Send + Sync + 'static,
    ) -> AggregateOperation3<T0, T1, T2, A, R> {
        AggregateOperation3::wrap(self.build(finish))
    }
}

/// Builder for operations over any number of inputs.
pub struct VarArityBuilder<A> {
    create: CreateFn<A>,
    accumulate: Vec<Option<AccumulateFn<A>>>,
    combine: Option<CombineFn<A>>,
}

impl<A: 'static> VarArityBuilder<A> {
    pub fn and_accumulate<T: Data>(
        mut self,
        tag: Tag<T>,
        f: impl Fn(&mut A, T) + Send + Sync + 'static,
    ) -> Self {
        if self.accumulate.len() <= tag.index() {
            self.accumulate.resize(tag.index() + 1, None);
        }
        self.accumulate[tag.index()] = Some(erase(f));
        self
    }

    pub fn and_combine(mut self, combine: impl Fn(&mut A, A) + Send + Sync + 'static) -> Self {
        self.combine = Some(Arc::new(combine));
        self
    }

    pub fn and_finish<R: 'static>(
        self,
        finish: impl Fn(A) -> R + Send + Sync + 'static,
    ) -> AggregateOperation<A, R> {
        AggregateOperation {
            create: self.create,
            accumulate: self.accumulate,
            combine: self.combine,
            finish: Arc::new(finish),
        }
    }
}
