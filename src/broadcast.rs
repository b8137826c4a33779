//! Snapshot fan-out to live subscribers.
//!
//! Each subscriber owns the receiving half of a small bounded channel. A
//! broadcast copies the sender list out of the lock before delivering, so
//! subscribers can attach or detach while a broadcast is in flight. A
//! subscriber whose receiver is gone is pruned; one that is merely behind
//! misses that snapshot and stays attached.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::logging::{log, obj, Domain, Level};
use crate::snapshot::GovernorSnapshot;

pub const SUBSCRIBER_BUFFER: usize = 8;

type Sender = mpsc::Sender<Arc<GovernorSnapshot>>;

#[derive(Debug, Default)]
struct HubInner {
    next_id: u64,
    subscribers: HashMap<u64, Sender>,
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastHub {
    inner: Arc<Mutex<HubInner>>,
}

#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Arc<GovernorSnapshot>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Arc<GovernorSnapshot>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<GovernorSnapshot>> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub lagging: usize,
    pub pruned: usize,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.subscribers.insert(id, tx);
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.lock().subscribers.remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Deliver to every current subscriber. Never fails.
    pub fn broadcast(&self, snapshot: Arc<GovernorSnapshot>) -> BroadcastReport {
        let targets: Vec<(u64, Sender)> = self
            .lock()
            .subscribers
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut report = BroadcastReport::default();
        let mut closed = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(Arc::clone(&snapshot)) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => report.lagging += 1,
                Err(TrySendError::Closed(_)) => closed.push(id),
            }
        }

        if !closed.is_empty() {
            let mut inner = self.lock();
            for id in &closed {
                inner.subscribers.remove(id);
            }
            report.pruned = closed.len();
        }

        if report.pruned > 0 || report.lagging > 0 {
            log(
                Level::Debug,
                Domain::Broadcast,
                "fanout",
                obj(&[
                    ("delivered", json!(report.delivered)),
                    ("lagging", json!(report.lagging)),
                    ("pruned", json!(report.pruned)),
                ]),
            );
        }
        report
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Mode;

    fn snap(tick: u64) -> Arc<GovernorSnapshot> {
        let mut s = GovernorSnapshot::empty(Mode::Observe);
        s.tick = tick;
        Arc::new(s)
    }

    #[tokio::test]
    async fn test_every_subscriber_gets_full_snapshot() {
        let hub = BroadcastHub::new();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        let report = hub.broadcast(snap(7));
        assert_eq!(report.delivered, 2);
        assert_eq!(a.recv().await.unwrap().tick, 7);
        assert_eq!(b.recv().await.unwrap().tick, 7);
    }

    #[test]
    fn test_dropped_subscriber_is_pruned_without_affecting_others() {
        let hub = BroadcastHub::new();
        let gone = hub.subscribe();
        let mut alive = hub.subscribe();
        drop(gone);

        let report = hub.broadcast(snap(1));
        assert_eq!(report, BroadcastReport { delivered: 1, lagging: 0, pruned: 1 });
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(alive.try_recv().unwrap().tick, 1);
    }

    #[test]
    fn test_slow_subscriber_lags_but_stays() {
        let hub = BroadcastHub::new();
        let mut slow = hub.subscribe();
        for i in 0..(SUBSCRIBER_BUFFER as u64 + 3) {
            hub.broadcast(snap(i));
        }
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(slow.try_recv().unwrap().tick, 0);
    }

    #[test]
    fn test_unsubscribe_removes_handle() {
        let hub = BroadcastHub::new();
        let sub = hub.subscribe();
        assert!(hub.unsubscribe(sub.id()));
        assert!(!hub.unsubscribe(sub.id()));
        assert_eq!(hub.broadcast(snap(1)).delivered, 0);
    }

    #[test]
    fn test_broadcast_with_no_subscribers_is_noop() {
        let hub = BroadcastHub::new();
        assert_eq!(hub.broadcast(snap(1)), BroadcastReport::default());
    }

    #[test]
    fn test_subscribe_during_concurrent_broadcasts() {
        let hub = BroadcastHub::new();
        let writer = {
            let hub = hub.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    hub.broadcast(snap(i));
                }
            })
        };
        let mut subs = Vec::new();
        for _ in 0..50 {
            subs.push(hub.subscribe());
            if subs.len() % 5 == 0 {
                subs.remove(0);
            }
        }
        writer.join().unwrap();
        hub.broadcast(snap(999));
        assert_eq!(hub.subscriber_count(), subs.len());
    }
}
