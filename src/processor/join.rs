//! Hash-join of one primary stream with any number of bounded
//! auxiliary streams.

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::Arc;
use std::task::Poll;

use crate::adapter::ItemKeyFn;
use crate::errors::ExecutionError;
use crate::item::Item;
use crate::processor::aggregate::KeyedMap;
use crate::processor::{Inbox, Outbox, Pending, Processor};
use crate::window::Watermark;

pub(crate) type ProjectFn = Arc<dyn Fn(Item) -> Result<Item, ExecutionError> + Send + Sync>;

pub(crate) type JoinOutputFn =
    Arc<dyn Fn(Item, Vec<Option<Item>>) -> Result<Item, ExecutionError> + Send + Sync>;

/// Lookup table built from one auxiliary stream.
pub(crate) trait JoinTable: Send {
    fn insert(&mut self, item: Item) -> Result<(), ExecutionError>;

    /// The projected auxiliary record matching a primary record.
    fn lookup(&self, primary: &Item) -> Result<Option<Item>, ExecutionError>;

    fn len(&self) -> usize;
}

/// Table keyed by `K`. When two auxiliary records share a key the
/// later one replaces the earlier.
pub(crate) struct KeyedTable<K> {
    primary_key: ItemKeyFn<K>,
    aux_key: ItemKeyFn<K>,
    project: ProjectFn,
    rows: KeyedMap<K, Item>,
}

impl<K> KeyedTable<K> {
    pub(crate) fn new(primary_key: ItemKeyFn<K>, aux_key: ItemKeyFn<K>, project: ProjectFn) -> Self {
        Self {
            primary_key,
            aux_key,
            project,
            rows: KeyedMap::default(),
        }
    }
}

impl<K: Hash + Eq + Send + 'static> JoinTable for KeyedTable<K> {
    fn insert(&mut self, item: Item) -> Result<(), ExecutionError> {
        let key = (self.aux_key)(&item)?;
        let row = (self.project)(item)?;
        self.rows.insert(key, row);
        Ok(())
    }

    fn lookup(&self, primary: &Item) -> Result<Option<Item>, ExecutionError> {
        let key = (self.primary_key)(primary)?;
        Ok(self.rows.get(&key).cloned())
    }

    fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Ordinal 0 is the primary stream, ordinal `n` feeds `tables[n - 1]`.
///
/// Primary records that arrive before every auxiliary stream is
/// complete are buffered, as are their watermarks.
pub(crate) struct HashJoinP {
    tables: Vec<Box<dyn JoinTable>>,
    aux_done: Vec<bool>,
    output: JoinOutputFn,
    buffered: VecDeque<Item>,
    held_watermark: Option<Watermark>,
    pending: Pending,
}

impl HashJoinP {
    pub(crate) fn new(tables: Vec<Box<dyn JoinTable>>, output: JoinOutputFn) -> Self {
        let aux_done = vec![false; tables.len()];
        Self {
            tables,
            aux_done,
            output,
            buffered: VecDeque::new(),
            held_watermark: None,
            pending: Pending::default(),
        }
    }

    fn tables_ready(&self) -> bool {
        self.aux_done.iter().all(|done| *done)
    }

    fn join(&self, primary: Item) -> Result<Item, ExecutionError> {
        let matches = self
            .tables
            .iter()
            .map(|table| table.lookup(&primary))
            .collect::<Result<Vec<_>, _>>()?;
        (self.output)(primary, matches)
    }

    /// Join and emit buffered primaries, then the watermark held back
    /// behind them.
    fn drain_buffered(&mut self, outbox: &mut Outbox) -> Result<Poll<()>, ExecutionError> {
        loop {
            if !self.pending.offer_to(outbox)? {
                return Ok(Poll::Pending);
            }
            match self.buffered.pop_front() {
                Some(primary) => {
                    let joined = self.join(primary)?;
                    self.pending.push(joined);
                }
                None => break,
            }
        }
        if let Some(watermark) = self.held_watermark {
            if !outbox.offer_watermark(watermark) {
                return Ok(Poll::Pending);
            }
            self.held_watermark = None;
        }
        Ok(Poll::Ready(()))
    }
}

impl Processor for HashJoinP {
    fn process(
        &mut self,
        ordinal: usize,
        inbox: &mut Inbox,
        outbox: &mut Outbox,
    ) -> Result<(), ExecutionError> {
        if ordinal > 0 {
            let table = self.tables.get_mut(ordinal - 1).ok_or_else(|| {
                crate::errors::ArityError {
                    operation: "hash-join".to_string(),
                    inbound: ordinal + 1,
                    accumulators: self.aux_done.len() + 1,
                }
            })?;
            while let Some(item) = inbox.poll() {
                table.insert(item)?;
            }
            return Ok(());
        }

        if !self.tables_ready() {
            self.buffered.extend(inbox.drain());
            return Ok(());
        }
        if self.drain_buffered(outbox)?.is_pending() {
            return Ok(());
        }
        while let Some(primary) = inbox.poll() {
            let joined = self.join(primary)?;
            self.pending.push(joined);
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
        if !self.tables_ready() {
            self.held_watermark = Some(watermark);
            return Ok(Poll::Ready(()));
        }
        if !self.pending.offer_to(outbox)? || !outbox.offer_watermark(watermark) {
            return Ok(Poll::Pending);
        }
        Ok(Poll::Ready(()))
    }

    fn complete_edge(
        &mut self,
        ordinal: usize,
        outbox: &mut Outbox,
    ) -> Result<Poll<()>, ExecutionError> {
        if ordinal > 0 {
            if let Some(done) = self.aux_done.get_mut(ordinal - 1) {
                if !*done {
                    *done = true;
                    tracing::debug!(
                        ordinal,
                        rows = self.tables[ordinal - 1].len(),
                        "hash-join side loaded"
                    );
                }
            }
        }
        if self.tables_ready() {
            self.drain_buffered(outbox)
        } else {
            Ok(Poll::Ready(()))
        }
    }

    fn complete(&mut self, outbox: &mut Outbox) -> Result<Poll<()>, ExecutionError> {
        self.drain_buffered(outbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::FunctionAdapter;
    use crate::processor::testing;

    fn table() -> Box<dyn JoinTable> {
        let raw = FunctionAdapter::Raw;
        Box::new(KeyedTable::new(
            raw.adapt_key_fn(Arc::new(|p: &(String, u32)| p.0.clone())),
            raw.adapt_key_fn(Arc::new(|a: &(String, i32)| a.0.clone())),
            Arc::new(|item: Item| -> Result<Item, ExecutionError> {
                let (_, value) = item.downcast::<(String, i32)>()?;
                Ok(Item::new(value))
            }),
        ))
    }

    fn join_p() -> HashJoinP {
        let output = FunctionAdapter::Raw
            .adapt_join_output(|p: (String, u32), aux: Option<i32>| (p.0, aux));
        HashJoinP::new(vec![table()], output)
    }

    fn primaries(keys: &[&str]) -> Inbox {
        keys.iter()
            .map(|k| Item::new((k.to_string(), 0u32)))
            .collect()
    }

    type Joined = (String, Option<i32>);

    #[test]
    fn joins_after_aux_is_loaded() {
        let mut p = join_p();
        let (mut outbox, rx) = testing::outbox(16);
        let mut aux: Inbox = [("a", 10i32), ("b", 20)]
            .into_iter()
            .map(|(k, v)| Item::new((k.to_string(), v)))
            .collect();
        p.process(1, &mut aux, &mut outbox).unwrap();
        assert!(p.complete_edge(1, &mut outbox).unwrap().is_ready());

        let mut inbox = primaries(&["a", "z"]);
        p.process(0, &mut inbox, &mut outbox).unwrap();
        assert_eq!(
            testing::drain::<Joined>(&mut outbox, &rx),
            vec![("a".to_string(), Some(10)), ("z".to_string(), None)]
        );
    }

    #[test]
    fn buffers_primaries_until_aux_completes() {
        let mut p = join_p();
        let (mut outbox, rx) = testing::outbox(16);
        let mut inbox = primaries(&["a"]);
        p.process(0, &mut inbox, &mut outbox).unwrap();
        assert!(p
            .try_process_watermark(Watermark::MIN, &mut outbox)
            .unwrap()
            .is_ready());
        assert!(testing::drain::<Joined>(&mut outbox, &rx).is_empty());

        let mut aux: Inbox = [Item::new(("a".to_string(), 1i32))].into_iter().collect();
        p.process(1, &mut aux, &mut outbox).unwrap();
        assert!(p.complete_edge(1, &mut outbox).unwrap().is_ready());
        outbox.flush();
        let kinds: Vec<_> = rx
            .try_iter()
            .map(|packet| matches!(packet.message, crate::processor::Message::Item(_)))
            .collect();
        // The joined record, then the held watermark.
        assert_eq!(kinds, vec![true, false]);
    }

    #[test]
    fn duplicate_aux_keys_keep_last() {
        let mut p = join_p();
        let (mut outbox, rx) = testing::outbox(16);
        let mut aux: Inbox = [("a", 1i32), ("a", 2)]
            .into_iter()
            .map(|(k, v)| Item::new((k.to_string(), v)))
            .collect();
        p.process(1, &mut aux, &mut outbox).unwrap();
        p.complete_edge(1, &mut outbox).unwrap();
        let mut inbox = primaries(&["a"]);
        p.process(0, &mut inbox, &mut outbox).unwrap();
        assert_eq!(
            testing::drain::<Joined>(&mut outbox, &rx),
            vec![("a".to_string(), Some(2))]
        );
    }
}
