use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    time::{Duration, Instant},
};

use hashbrown::HashSet;
use tracing::debug;

use crate::ingest::Item;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupPolicy {
    /// Remember every content for the life of the process.
    Unbounded,
    /// Forget a content once this long has passed since it was first seen.
    Window(Duration),
}

impl From<Option<Duration>> for DedupPolicy {
    fn from(window: Option<Duration>) -> Self {
        window.map_or(DedupPolicy::Unbounded, DedupPolicy::Window)
    }
}

/// Drops items whose exact content has been seen before.
///
/// Runs on the ingestion task only, so membership test and insert need no
/// synchronization.
pub struct Deduplicator {
    seen: SeenSet,
    duplicates: u64,
}

enum SeenSet {
    Unbounded(HashSet<String>),
    Window(ExpiringSet),
}

impl Deduplicator {
    pub fn new(policy: DedupPolicy) -> Self {
        let seen = match policy {
            DedupPolicy::Unbounded => SeenSet::Unbounded(HashSet::new()),
            DedupPolicy::Window(ttl) => SeenSet::Window(ExpiringSet::new(ttl)),
        };
        Self {
            seen,
            duplicates: 0,
        }
    }

    /// Returns true if the item is new and should be dispatched.
    pub fn offer(&mut self, item: &Item) -> bool {
        self.offer_at(item, Instant::now())
    }

    fn offer_at(&mut self, item: &Item, now: Instant) -> bool {
        let novel = match &mut self.seen {
            SeenSet::Unbounded(set) => set.insert(item.text.clone()),
            SeenSet::Window(set) => {
                set.remove_expired(now);
                set.insert(&item.text, now)
            }
        };
        if !novel {
            self.duplicates += 1;
            debug!(seq = item.seq, duplicates = self.duplicates, "dropping duplicate item");
        }
        novel
    }

    /// Number of contents currently remembered.
    pub fn len(&self) -> usize {
        match &self.seen {
            SeenSet::Unbounded(set) => set.len(),
            SeenSet::Window(set) => set.set.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }
}

/// A content set that expires its entries a fixed time after insertion.
struct ExpiringSet {
    ttl: Duration,
    /// The set of contents used for membership checks.
    set: HashSet<String>,
    /// A priority queue of contents and their expiry times.
    queue: BinaryHeap<(Reverse<Instant>, String)>,
}

impl ExpiringSet {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            set: HashSet::new(),
            queue: BinaryHeap::new(),
        }
    }

    /// Inserts the content unless it's already present. Re-inserting does
    /// not extend an entry's life.
    fn insert(&mut self, value: &str, now: Instant) -> bool {
        if self.set.contains(value) {
            return false;
        }
        self.set.insert(value.to_string());
        self.queue.push((Reverse(now + self.ttl), value.to_string()));
        true
    }

    fn remove_expired(&mut self, now: Instant) {
        while self
            .queue
            .peek()
            .map_or(false, |(expiry, _)| expiry.0 <= now)
        {
            if let Some((_, value)) = self.queue.pop() {
                self.set.remove(&value);
            }
        }
    }
}
