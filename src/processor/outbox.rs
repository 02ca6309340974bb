use std::collections::VecDeque;
use std::sync::mpsc::{SyncSender, TrySendError};

use crate::errors::{ExecutionError, RoutingError};
use crate::item::Item;
use crate::routing::{Route, Router};
use crate::window::Watermark;

#[derive(Debug, Clone)]
pub(crate) enum Message {
    Item(Item),
    Watermark(Watermark),
    /// The sender won't send anything else.
    Done,
}

/// A message tagged with the index of the upstream instance that
/// sent it, so the receiver can coalesce watermarks and count
/// finished senders.
#[derive(Debug)]
pub(crate) struct Packet {
    pub(crate) sender: usize,
    pub(crate) message: Message,
}

struct Target {
    sender: SyncSender<Packet>,
    pending: VecDeque<Message>,
}

struct OutboundEdge {
    router: Router,
    targets: Vec<Target>,
}

/// Bounded output of one processor instance.
///
/// Records are routed as soon as they're offered and then queue up
/// per target instance until the channel to it has room. Once any
/// target queue is full, [`Outbox::offer`] refuses new records, which
/// is how backpressure reaches the processor.
pub struct Outbox {
    instance: usize,
    capacity: usize,
    edges: Vec<OutboundEdge>,
    /// Something was offered since the last [`Outbox::take_activity`].
    activity: bool,
}

impl Outbox {
    pub(crate) fn new(instance: usize, capacity: usize) -> Self {
        Self {
            instance,
            capacity: capacity.max(1),
            edges: Vec::new(),
            activity: false,
        }
    }

    /// Add an edge with one sender per target instance, in instance
    /// order.
    pub(crate) fn add_edge(&mut self, router: Router, senders: Vec<SyncSender<Packet>>) {
        let targets = senders
            .into_iter()
            .map(|sender| Target {
                sender,
                pending: VecDeque::new(),
            })
            .collect();
        self.edges.push(OutboundEdge { router, targets });
    }

    pub fn has_capacity(&self) -> bool {
        self.edges
            .iter()
            .all(|edge| edge.targets.iter().all(|t| t.pending.len() < self.capacity))
    }

    /// Offer a record to every outbound edge. Returns `false` without
    /// taking it if there is no room; offer it again on a later turn.
    /// Every edge routes the record before any edge queues it, so a
    /// routing error leaves the outbox untouched.
    pub fn offer(&mut self, item: &Item) -> Result<bool, ExecutionError> {
        if !self.has_capacity() {
            return Ok(false);
        }
        let mut routes = Vec::with_capacity(self.edges.len());
        for edge in self.edges.iter_mut() {
            let route = edge.router.route(item)?;
            if let Route::One(index) = route {
                if index >= edge.targets.len() {
                    return Err(RoutingError::InstanceOutOfRange {
                        edge: edge.router.edge().to_string(),
                        index,
                        parallelism: edge.router.parallelism(),
                    }
                    .into());
                }
            }
            routes.push(route);
        }
        for (edge, route) in self.edges.iter_mut().zip(routes) {
            match route {
                Route::One(index) => {
                    if let Some(target) = edge.targets.get_mut(index) {
                        target.pending.push_back(Message::Item(item.clone()));
                    }
                }
                Route::All => {
                    for target in edge.targets.iter_mut() {
                        target.pending.push_back(Message::Item(item.clone()));
                    }
                }
            }
        }
        self.activity = true;
        Ok(true)
    }

    /// Send a watermark to every target instance of every edge.
    pub fn offer_watermark(&mut self, watermark: Watermark) -> bool {
        if !self.has_capacity() {
            return false;
        }
        self.broadcast(Message::Watermark(watermark));
        self.activity = true;
        true
    }

    /// Tell every target this instance is done.
    pub(crate) fn close(&mut self) {
        self.broadcast(Message::Done);
    }

    fn broadcast(&mut self, message: Message) {
        for edge in self.edges.iter_mut() {
            for target in edge.targets.iter_mut() {
                target.pending.push_back(message.clone());
            }
        }
    }

    /// Move as much as the channels take. Returns whether anything
    /// moved.
    pub(crate) fn flush(&mut self) -> bool {
        let mut progress = false;
        for edge in self.edges.iter_mut() {
            for target in edge.targets.iter_mut() {
                while let Some(message) = target.pending.pop_front() {
                    let packet = Packet {
                        sender: self.instance,
                        message,
                    };
                    match target.sender.try_send(packet) {
                        Ok(()) => progress = true,
                        Err(TrySendError::Full(packet)) => {
                            target.pending.push_front(packet.message);
                            break;
                        }
                        Err(TrySendError::Disconnected(_)) => {
                            // Receiver is gone, the job is shutting
                            // down.
                            tracing::trace!(
                                edge = edge.router.edge(),
                                dropped = target.pending.len() + 1,
                                "downstream instance gone, dropping output"
                            );
                            target.pending.clear();
                            break;
                        }
                    }
                }
            }
        }
        progress
    }

    pub(crate) fn take_activity(&mut self) -> bool {
        std::mem::take(&mut self.activity)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.edges
            .iter()
            .all(|edge| edge.targets.iter().all(|t| t.pending.is_empty()))
    }
}


#[cfg(test)]
mod tests {
    use std::sync::mpsc::sync_channel;

    use super::*;
    use crate::routing::ProcessingStrategy;

    #[test]
    fn broadcast_reaches_every_instance_once() {
        let mut outbox = Outbox::new(0, 16);
        let mut receivers = Vec::new();
        let mut senders = Vec::new();
        for _ in 0..4 {
            let (tx, rx) = sync_channel(16);
            senders.push(tx);
            receivers.push(rx);
        }
        let router = Router::with_strategy("b", ProcessingStrategy::Broadcast, 4, None).unwrap();
        outbox.add_edge(router, senders);

        for i in 0..5u32 {
            assert!(outbox.offer(&Item::new(i)).unwrap());
        }
        outbox.flush();

        for rx in receivers {
            let got: Vec<u32> = rx
                .try_iter()
                .map(|packet| match packet.message {
                    Message::Item(item) => item.downcast::<u32>().unwrap(),
                    other => panic!("unexpected {other:?}"),
                })
                .collect();
            assert_eq!(got, vec![0, 1, 2, 3, 4]);
        }
    }

    #[test]
    fn full_outbox_refuses_offers() {
        let (tx, rx) = sync_channel(1);
        let mut outbox = Outbox::new(3, 2);
        let router =
            Router::with_strategy("e", ProcessingStrategy::RoundRobin, 1, None).unwrap();
        outbox.add_edge(router, vec![tx]);

        assert!(outbox.offer(&Item::new(1u8)).unwrap());
        assert!(outbox.offer(&Item::new(2u8)).unwrap());
        assert!(!outbox.offer(&Item::new(3u8)).unwrap());
        assert!(!outbox.offer_watermark(Watermark::MIN));

        // Channel holds one, one stays pending.
        assert!(outbox.flush());
        assert!(!outbox.is_empty());
        assert!(outbox.offer(&Item::new(3u8)).unwrap());

        let packet = rx.try_recv().unwrap();
        assert_eq!(packet.sender, 3);
    }

    #[test]
    fn close_sends_done_to_all() {
        let (tx0, rx0) = sync_channel(4);
        let (tx1, rx1) = sync_channel(4);
        let mut outbox = Outbox::new(0, 4);
        let router =
            Router::with_strategy("e", ProcessingStrategy::RoundRobin, 2, None).unwrap();
        outbox.add_edge(router, vec![tx0, tx1]);
        outbox.close();
        outbox.flush();
        assert!(matches!(rx0.try_recv().unwrap().message, Message::Done));
        assert!(matches!(rx1.try_recv().unwrap().message, Message::Done));
    }

    #[test]
    fn routing_error_queues_nothing() {
        let (tx0, rx0) = sync_channel(4);
        let (tx1, _rx1) = sync_channel(4);
        let mut outbox = Outbox::new(0, 4);
        let plain = Router::with_strategy("plain", ProcessingStrategy::RoundRobin, 1, None).unwrap();
        let keyed = Router::with_strategy(
            "keyed",
            ProcessingStrategy::Partitioning,
            1,
            Some(crate::routing::key_fn(|x: &u64| *x)),
        )
        .unwrap();
        outbox.add_edge(plain, vec![tx0]);
        outbox.add_edge(keyed, vec![tx1]);

        assert!(outbox.offer(&Item::new("not a u64".to_string())).is_err());
        assert!(outbox.is_empty());
        outbox.flush();
        assert!(rx0.try_recv().is_err());
    }

    #[test]
    fn output_to_a_gone_instance_is_dropped() {
        let (tx, rx) = sync_channel(4);
        let mut outbox = Outbox::new(0, 4);
        let router =
            Router::with_strategy("e", ProcessingStrategy::RoundRobin, 1, None).unwrap();
        outbox.add_edge(router, vec![tx]);
        drop(rx);

        assert!(outbox.offer(&Item::new(1u8)).unwrap());
        assert!(outbox.offer(&Item::new(2u8)).unwrap());
        assert!(!outbox.flush());
        assert!(outbox.is_empty());
    }
}
