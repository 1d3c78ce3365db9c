use std::sync::Arc;

use tokio::select;
use tracing::{debug, info, trace};

use crate::{
    analysis::Analyzer,
    dedup::Deduplicator,
    dispatch::Dispatcher,
    error::Error,
    ingest::{Item, StreamIngestor},
    shutdown::Shutdown,
    worker::ProcessedCounter,
};

/// Where novel items go once they pass dedup.
pub enum Route {
    /// Analyze on the ingestion task itself.
    Sequential {
        analyzer: Arc<dyn Analyzer>,
        counter: Arc<ProcessedCounter>,
    },
    /// Analyze on the blocking pool without holding up ingestion.
    Parallel {
        analyzer: Arc<dyn Analyzer>,
        counter: Arc<ProcessedCounter>,
    },
    /// Hand off to the cluster's workers.
    Distributed(Dispatcher),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Duplicate,
    /// Analyzed (or queued for analysis) in this process.
    Processed,
    /// Sent to the worker with this rank.
    Dispatched(u32),
}

/// Ingestion, dedup and dispatch in one loop. Each item is fully handled
/// before the next frame is read.
pub struct Pipeline {
    dedup: Deduplicator,
    route: Route,
}

impl Pipeline {
    pub fn new(dedup: Deduplicator, route: Route) -> Self {
        Self { dedup, route }
    }

    pub async fn accept(&mut self, item: Item) -> Result<Outcome, Error> {
        if !self.dedup.offer(&item) {
            return Ok(Outcome::Duplicate);
        }
        match &mut self.route {
            Route::Sequential { analyzer, counter } => {
                analyze(analyzer.as_ref(), &item);
                counter.increment();
                Ok(Outcome::Processed)
            }
            Route::Parallel { analyzer, counter } => {
                let analyzer = analyzer.clone();
                let counter = counter.clone();
                tokio::task::spawn_blocking(move || {
                    analyze(analyzer.as_ref(), &item);
                    counter.increment();
                });
                Ok(Outcome::Processed)
            }
            Route::Distributed(dispatcher) => {
                dispatcher.dispatch(item).await.map(Outcome::Dispatched)
            }
        }
    }

    /// Pulls items off the stream until shutdown or a transport error.
    pub async fn run(
        &mut self,
        ingestor: &mut StreamIngestor,
        mut shutdown: Shutdown,
    ) -> Result<(), Error> {
        let result = loop {
            select! {
                _ = shutdown.wait() => break Ok(()),
                item = ingestor.next_item() => {
                    let handled = match item {
                        Ok(item) => self.accept(item).await.map(|_| ()),
                        Err(e) => Err(e),
                    };
                    if let Err(e) = handled {
                        break Err(e);
                    }
                }
            }
        };
        info!(
            seen = self.dedup.len(),
            duplicates = self.dedup.duplicates(),
            decode_errors = ingestor.decode_errors(),
            "ingestion stopped"
        );
        result
    }

    pub fn dedup(&self) -> &Deduplicator {
        &self.dedup
    }
}

fn analyze(analyzer: &dyn Analyzer, item: &Item) {
    match analyzer.analyze(&item.text) {
        Some(sentiment) => trace!(seq = item.seq, %sentiment, "analyzed item"),
        None => debug!(seq = item.seq, "item could not be classified"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::LexiconAnalyzer,
        cluster::{local::pipes, wire::Frame, WorkSender},
        config::Topic,
        dedup::DedupPolicy,
        ingest::decode_envelope,
    };

    const MUSIC_FRAME: &str = r#"{"music": "{\"reviewText\":\"great\",\"overall\":5.0}"}"#;

    fn sequential() -> (Pipeline, Arc<ProcessedCounter>) {
        let counter = Arc::new(ProcessedCounter::default());
        let route = Route::Sequential {
            analyzer: Arc::new(LexiconAnalyzer::default()),
            counter: counter.clone(),
        };
        (
            Pipeline::new(Deduplicator::new(DedupPolicy::Unbounded), route),
            counter,
        )
    }

    #[tokio::test]
    async fn the_same_frame_twice_is_dispatched_once() {
        let topic: Topic = "music".parse().unwrap();
        let (coordinator, mut worker) = pipes(1024);
        let dispatcher =
            Dispatcher::new(vec![WorkSender::new(1, coordinator.tx)], 1024).unwrap();
        let mut pipeline = Pipeline::new(
            Deduplicator::new(DedupPolicy::Unbounded),
            Route::Distributed(dispatcher),
        );

        let mut outcomes = Vec::new();
        for seq in 0..2 {
            let text = decode_envelope(MUSIC_FRAME, &topic).unwrap();
            outcomes.push(pipeline.accept(Item { seq, text }).await.unwrap());
        }
        assert_eq!(outcomes, vec![Outcome::Dispatched(1), Outcome::Duplicate]);

        match worker.rx.recv().await.unwrap() {
            Frame::Work(work) => assert_eq!((work.seq, work.text.as_str()), (0, "great")),
            other => panic!("unexpected frame {:?}", other),
        }
        if let Route::Distributed(dispatcher) = &pipeline.route {
            assert_eq!(dispatcher.dispatched(), 1);
        }
    }

    #[tokio::test]
    async fn sequential_mode_counts_novel_items() {
        let (mut pipeline, counter) = sequential();
        for (seq, text) in ["great", "bad", "great", "fine"].into_iter().enumerate() {
            pipeline
                .accept(Item {
                    seq: seq as u64,
                    text: text.into(),
                })
                .await
                .unwrap();
        }
        assert_eq!(counter.take(), 3);
        assert_eq!(pipeline.dedup().duplicates(), 1);
    }

    #[tokio::test]
    async fn parallel_mode_counts_off_the_ingestion_task() {
        let counter = Arc::new(ProcessedCounter::default());
        let mut pipeline = Pipeline::new(
            Deduplicator::new(DedupPolicy::Unbounded),
            Route::Parallel {
                analyzer: Arc::new(LexiconAnalyzer::default()),
                counter: counter.clone(),
            },
        );
        for seq in 0..10 {
            let outcome = pipeline
                .accept(Item {
                    seq,
                    text: format!("review {}", seq % 5),
                })
                .await
                .unwrap();
            assert_eq!(outcome == Outcome::Duplicate, seq >= 5);
        }
        let mut total = 0;
        while total < 5 {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            total += counter.take();
        }
        assert_eq!(total, 5);
    }
}
