//! Room registry: per-batch fan-out channels for real-time subscribers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use mast_proto::ResultMessage;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Clone)]
pub struct RoomRegistry {
    /// batch_id -> (subscriber id -> sender)
    rooms: Arc<DashMap<String, DashMap<u64, mpsc::UnboundedSender<ResultMessage>>>>,
    next_id: Arc<AtomicU64>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn subscribe(&self, batch_id: &str) -> (u64, mpsc::UnboundedReceiver<ResultMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.rooms
            .entry(batch_id.to_string())
            .or_default()
            .insert(id, tx);
        debug!(%batch_id, subscriber = id, "joined room");
        (id, rx)
    }

    pub fn unsubscribe(&self, batch_id: &str, subscriber: u64) {
        if let Some(room) = self.rooms.get(batch_id) {
            room.remove(&subscriber);
        }
        // The emptiness check and removal must be one atomic step so a
        // concurrent subscribe cannot land in a room about to be dropped.
        self.rooms.remove_if(batch_id, |_, room| room.is_empty());
    }

    /// Deliver a result frame to every subscriber of its batch's room.
    /// Returns how many subscribers received it; zero when nobody joined.
    pub fn publish(&self, message: &ResultMessage) -> usize {
        let Some(room) = self.rooms.get(message.batch_id()) else {
            return 0;
        };
        let mut delivered = 0;
        for subscriber in room.iter() {
            if subscriber.value().send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mast_proto::CommandResult;

    fn result(batch_id: &str, output: &str) -> ResultMessage {
        ResultMessage::Result(CommandResult {
            batch_id: batch_id.into(),
            command_id: 0,
            output: output.into(),
        })
    }

    #[tokio::test]
    async fn fan_out_reaches_every_room_subscriber() {
        let rooms = RoomRegistry::new();
        let (_a, mut rx_a) = rooms.subscribe("batch-x");
        let (_b, mut rx_b) = rooms.subscribe("batch-x");
        let (_c, mut rx_other) = rooms.subscribe("batch-y");

        assert_eq!(rooms.publish(&result("batch-x", "hello")), 2);

        assert_eq!(rx_a.recv().await.unwrap().batch_id(), "batch-x");
        assert_eq!(rx_b.recv().await.unwrap().batch_id(), "batch-x");
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_empties_and_removes_room() {
        let rooms = RoomRegistry::new();
        let (id, _rx) = rooms.subscribe("batch-x");
        rooms.unsubscribe("batch-x", id);
        assert_eq!(rooms.publish(&result("batch-x", "nobody home")), 0);
    }

    #[tokio::test]
    async fn unsubscribe_keeps_room_while_others_remain() {
        let rooms = RoomRegistry::new();
        let (first, _rx_first) = rooms.subscribe("batch-x");
        let (_second, mut rx_second) = rooms.subscribe("batch-x");

        rooms.unsubscribe("batch-x", first);
        assert_eq!(rooms.publish(&result("batch-x", "still here")), 1);
        assert_eq!(rx_second.recv().await.unwrap().batch_id(), "batch-x");
    }

    #[tokio::test]
    async fn results_are_delivered_in_emission_order() {
        let rooms = RoomRegistry::new();
        let (_id, mut rx) = rooms.subscribe("batch-x");
        rooms.publish(&result("batch-x", "first"));
        rooms.publish(&result("batch-x", "second"));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        match (first, second) {
            (ResultMessage::Result(a), ResultMessage::Result(b)) => {
                assert_eq!(a.output, "first");
                assert_eq!(b.output, "second");
            }
            other => panic!("unexpected frames: {other:?}"),
        }
    }
}
