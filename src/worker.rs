use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tokio::select;
use tracing::{debug, info, info_span, trace, Instrument};

use crate::{
    analysis::Analyzer,
    cluster::{wire::Frame, wire::MessageType, CoordinatorLink, WorkItem},
    error::Error,
    shutdown::Shutdown,
    telemetry,
};

/// Items processed since the last report. Shared between the loop that
/// processes items and whatever reports the count.
#[derive(Debug, Default)]
pub struct ProcessedCounter(AtomicU64);

impl ProcessedCounter {
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the count and resets it to zero in one step.
    pub fn take(&self) -> u64 {
        self.0.swap(0, Ordering::AcqRel)
    }
}

/// Runs on every worker rank: receives items from the coordinator, analyzes
/// them and counts them.
pub struct WorkerAgent {
    rank: u32,
    analyzer: Arc<dyn Analyzer>,
    counter: Arc<ProcessedCounter>,
}

impl WorkerAgent {
    pub fn new(rank: u32, analyzer: Arc<dyn Analyzer>) -> Self {
        Self {
            rank,
            analyzer,
            counter: Arc::new(ProcessedCounter::default()),
        }
    }

    pub fn counter(&self) -> Arc<ProcessedCounter> {
        self.counter.clone()
    }

    /// Processes items until shutdown or until either stream fails. The
    /// telemetry side runs as its own task so a slow item never delays a
    /// count report.
    pub async fn run(
        self,
        link: CoordinatorLink,
        mut shutdown: Shutdown,
    ) -> Result<(), Error> {
        let span = info_span!("worker", rank = self.rank);
        async move {
            let CoordinatorLink {
                mut work,
                telemetry,
                settings,
                conn: _conn,
                ..
            } = link;
            let mut reporter = tokio::spawn(telemetry::report_counts(
                telemetry,
                settings,
                self.counter.clone(),
                shutdown.clone(),
            ));
            info!(?settings, "worker ready");

            let result = loop {
                select! {
                    _ = shutdown.wait() => break Ok(()),
                    reported = &mut reporter => break reported?,
                    frame = work.recv() => match frame {
                        Ok(Frame::Work(item)) => self.process(item),
                        Ok(other) => break Err(Error::ReceivedUnexpectedMessage {
                            expected: MessageType::Work,
                            received: other.msg_type(),
                        }),
                        Err(e) => break Err(e),
                    },
                }
            };
            reporter.abort();
            debug!("worker stopped");
            result
        }
        .instrument(span)
        .await
    }

    fn process(&self, item: WorkItem) {
        match self.analyzer.analyze(&item.text) {
            Some(sentiment) => trace!(seq = item.seq, %sentiment, "analyzed item"),
            None => debug!(seq = item.seq, "item could not be classified"),
        }
        self.counter.increment();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::Sentiment,
        cluster::{
            axon::join,
            local,
            wire::{Hello, Ready},
            ThroughputSample,
        },
        config::TelemetryMode,
        shutdown,
    };
    use std::sync::Mutex;

    /// Remembers every text it was asked about.
    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl Analyzer for Recorder {
        fn analyze(&self, text: &str) -> Option<Sentiment> {
            self.0.lock().unwrap().push(text.to_string());
            None
        }
    }

    #[test]
    fn take_resets_the_counter() {
        let counter = ProcessedCounter::default();
        counter.increment();
        counter.increment();
        assert_eq!(counter.take(), 2);
        assert_eq!(counter.take(), 0);
    }

    #[tokio::test]
    async fn processes_items_and_answers_count_requests() {
        let settings = Ready {
            telemetry: TelemetryMode::Pull,
            interval_ms: 1000,
        };
        let (mut links, mut workers) = local::connect(2, settings, 1024).await.unwrap();
        let mut link = links.remove(0);
        let recorder = Arc::new(Recorder::default());
        let (trigger, shutdown) = shutdown::channel();
        let agent = WorkerAgent::new(1, recorder.clone());
        let running = tokio::spawn(agent.run(workers.remove(0), shutdown));

        for (seq, text) in ["great", "awful", "fine"].into_iter().enumerate() {
            link.work
                .send(WorkItem {
                    seq: seq as u64,
                    text: text.into(),
                })
                .await
                .unwrap();
        }
        // the work stream is ordered, but the report travels on another
        // stream, so poll until all three have been counted
        let mut total = 0;
        while total < 3 {
            let ThroughputSample { rank, count, .. } =
                link.telemetry.request_count().await.unwrap();
            assert_eq!(rank, 1);
            total += count;
        }
        assert_eq!(total, 3);
        assert_eq!(*recorder.0.lock().unwrap(), vec!["great", "awful", "fine"]);

        trigger.fire();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn coordinator_hangup_ends_the_worker() {
        let settings = Ready {
            telemetry: TelemetryMode::Pull,
            interval_ms: 1000,
        };
        let (links, mut workers) = local::connect(2, settings, 1024).await.unwrap();
        let (_trigger, shutdown) = shutdown::channel();
        let agent = WorkerAgent::new(1, Arc::new(Recorder::default()));
        let running = tokio::spawn(agent.run(workers.remove(0), shutdown));
        drop(links);
        assert!(matches!(running.await.unwrap(), Err(Error::PeerClosed)));
    }

    #[tokio::test]
    async fn a_non_work_frame_on_the_work_stream_is_an_error() {
        let settings = Ready {
            telemetry: TelemetryMode::Pull,
            interval_ms: 1000,
        };
        let (mut c_work, w_work) = local::pipes(1024);
        let (mut c_tel, w_tel) = local::pipes(1024);
        let joining = tokio::spawn(join(1, w_work, w_tel));
        assert_eq!(c_work.rx.recv().await.unwrap(), Frame::Hello(Hello { rank: 1 }));
        c_work.tx.send(&Frame::Ready(settings)).await.unwrap();
        assert_eq!(c_tel.rx.recv().await.unwrap(), Frame::Hello(Hello { rank: 1 }));
        let link = joining.await.unwrap().unwrap();

        let (_trigger, shutdown) = shutdown::channel();
        let agent = WorkerAgent::new(1, Arc::new(Recorder::default()));
        let running = tokio::spawn(agent.run(link, shutdown));
        c_work.tx.send(&Frame::CountRequest).await.unwrap();
        assert!(matches!(
            running.await.unwrap(),
            Err(Error::ReceivedUnexpectedMessage {
                expected: MessageType::Work,
                received: MessageType::CountRequest,
            })
        ));
    }
}
