//! Last-value, single-writer / multi-reader topics.
//!
//! Publishing overwrites the previous value. Readers never drain a queue: they
//! see either nothing yet or the newest value, stamped with a sequence number
//! and the monotonic instant it was published.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

#[derive(Debug)]
pub struct Stamped<T> {
    /// 1 for the first publication, then +1 per publication.
    pub seq: u64,
    pub at: Instant,
    pub value: T,
}

impl<T> Stamped<T> {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.at)
    }

    pub fn is_fresh(&self, now: Instant, max_age: Duration) -> bool {
        self.age(now) <= max_age
    }
}

type Slot<T> = Option<Arc<Stamped<T>>>;

/// Writing end. Deliberately not `Clone`: a topic has one owner.
pub struct Topic<T> {
    name: &'static str,
    tx: watch::Sender<Slot<T>>,
}

impl<T> Topic<T> {
    pub fn new(name: &'static str) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { name, tx }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn publish(&self, value: T) -> u64 {
        self.publish_at(value, Instant::now())
    }

    pub fn publish_at(&self, value: T, at: Instant) -> u64 {
        let mut seq = 0;
        self.tx.send_modify(|slot| {
            seq = slot.as_ref().map_or(1, |s| s.seq + 1);
            *slot = Some(Arc::new(Stamped { seq, at, value }));
        });
        seq
    }

    pub fn subscribe(&self) -> Subscriber<T> {
        Subscriber { name: self.name, rx: self.tx.subscribe() }
    }
}

pub struct Subscriber<T> {
    name: &'static str,
    rx: watch::Receiver<Slot<T>>,
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        Self { name: self.name, rx: self.rx.clone() }
    }
}

impl<T> Subscriber<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Newest value, or `None` if nothing was published yet. Never blocks.
    pub fn latest(&self) -> Option<Arc<Stamped<T>>> {
        self.rx.borrow().clone()
    }

    /// Newest value only if it is younger than `max_age`.
    pub fn latest_fresh(&self, now: Instant, max_age: Duration) -> Option<Arc<Stamped<T>>> {
        self.latest().filter(|s| s.is_fresh(now, max_age))
    }

    /// Newest value only if its sequence number is past `seen`.
    pub fn newer_than(&self, seen: u64) -> Option<Arc<Stamped<T>>> {
        self.latest().filter(|s| s.seq > seen)
    }
}
