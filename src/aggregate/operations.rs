//! Ready-made single-input aggregate operations.

use num::{Num, ToPrimitive};

use super::{with_create, AggregateOperation1};
use crate::item::Data;

/// Count the records.
pub fn counting<T: Data>() -> AggregateOperation1<T, i64, i64> {
    with_create(|| 0i64)
        .and_accumulate0(|acc: &mut i64, _: T| *acc += 1)
        .and_combine(|acc, other| *acc += other)
        .and_finish(|acc| acc)
}

/// Sum a number extracted from each record.
pub fn summing<T, N>(get: impl Fn(&T) -> N + Send + Sync + 'static) -> AggregateOperation1<T, N, N>
where
    T: Data,
    N: Num + Copy + Send + Sync + 'static,
{
    with_create(N::zero)
        .and_accumulate0(move |acc: &mut N, item: T| *acc = *acc + get(&item))
        .and_combine(|acc, other| *acc = *acc + other)
        .and_finish(|acc| acc)
}

/// Arithmetic mean of a number extracted from each record. NaN if
/// there were no records.
pub fn averaging<T, N>(
    get: impl Fn(&T) -> N + Send + Sync + 'static,
) -> AggregateOperation1<T, (f64, u64), f64>
where
    T: Data,
    N: ToPrimitive,
{
    with_create(|| (0.0f64, 0u64))
        .and_accumulate0(move |acc: &mut (f64, u64), item: T| {
            acc.0 += get(&item).to_f64().unwrap_or(f64::NAN);
            acc.1 += 1;
        })
        .and_combine(|acc, other| {
            acc.0 += other.0;
            acc.1 += other.1;
        })
        .and_finish(|(sum, count)| sum / count as f64)
}

/// Collect all records, in arrival order.
pub fn to_list<T: Data>() -> AggregateOperation1<T, Vec<T>, Vec<T>> {
    with_create(Vec::new)
        .and_accumulate0(|acc: &mut Vec<T>, item: T| acc.push(item))
        .and_combine(|acc, mut other| acc.append(&mut other))
        .and_finish(|acc| acc)
}

/// The record with the greatest key. On ties the first one seen
/// wins.
pub fn max_by<T, K>(
    key: impl Fn(&T) -> K + Send + Sync + 'static,
) -> AggregateOperation1<T, Option<T>, Option<T>>
where
    T: Data,
    K: Ord,
{
    let key = std::sync::Arc::new(key);
    let combine_key = key.clone();
    with_create(|| None)
        .and_accumulate0(move |acc: &mut Option<T>, item: T| {
            let replace = match acc {
                Some(current) => key(&item) > key(current),
                None => true,
            };
            if replace {
                *acc = Some(item);
            }
        })
        .and_combine(move |acc, other| {
            if let Some(other) = other {
                let replace = match acc {
                    Some(current) => combine_key(&other) > combine_key(current),
                    None => true,
                };
                if replace {
                    *acc = Some(other);
                }
            }
        })
        .and_finish(|acc| acc)
}

/// The record with the smallest key. On ties the first one seen
/// wins.
pub fn min_by<T, K>(
    key: impl Fn(&T) -> K + Send + Sync + 'static,
) -> AggregateOperation1<T, Option<T>, Option<T>>
where
    T: Data,
    K: Ord,
{
    max_by(move |item: &T| std::cmp::Reverse(key(item)))
}
