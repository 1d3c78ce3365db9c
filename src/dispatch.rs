use tracing::{error, trace, warn};

use crate::{
    cluster::{WorkItem, WorkSender},
    error::Error,
    ingest::Item,
};

/// Hands items to workers in strict round-robin order.
///
/// Dispatch is fire-and-forget: the cursor moves on as soon as the item is
/// written to the worker's stream, without waiting for the worker to process
/// it. There is no acknowledgement or redelivery, so a failed send is fatal.
pub struct Dispatcher {
    workers: Vec<WorkSender>,
    cursor: usize,
    dispatched: u64,
    max_item_bytes: usize,
}

impl Dispatcher {
    pub fn new(
        mut workers: Vec<WorkSender>,
        max_item_bytes: usize,
    ) -> Result<Self, Error> {
        if workers.is_empty() {
            error!("refusing to dispatch without workers");
            return Err(Error::NoWorkers);
        }
        workers.sort_by_key(WorkSender::rank);
        Ok(Self {
            workers,
            cursor: 0,
            dispatched: 0,
            max_item_bytes,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// The rank the next item will go to.
    pub fn next_rank(&self) -> u32 {
        self.workers[self.cursor].rank()
    }

    /// Items sent so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    /// Sends the item to the worker under the cursor and advances the cursor
    /// by one, wrapping back to the first worker. Returns the rank it went to.
    pub async fn dispatch(&mut self, item: Item) -> Result<u32, Error> {
        let Item { seq, mut text } = item;
        if text.len() > self.max_item_bytes {
            warn!(
                seq,
                len = text.len(),
                max = self.max_item_bytes,
                "item is over the size limit, truncating"
            );
            truncate_at_char_boundary(&mut text, self.max_item_bytes);
        }

        let worker = &mut self.workers[self.cursor];
        let rank = worker.rank();
        if let Err(e) = worker.send(WorkItem { seq, text }).await {
            error!(seq, rank, "could not send item to worker: {}", e);
            return Err(e);
        }
        trace!(seq, rank, "dispatched item");

        self.cursor = (self.cursor + 1) % self.workers.len();
        self.dispatched += 1;
        Ok(rank)
    }
}

fn truncate_at_char_boundary(text: &mut String, max: usize) {
    let mut end = max.min(text.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}
