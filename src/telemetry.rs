use std::{io, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    fs::File,
    io::{AsyncWriteExt, BufWriter},
    select,
    sync::mpsc::{self, error::TryRecvError},
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    cluster::{Ready, TelemetryChannel, ThroughputSample},
    config::TelemetryMode,
    error::Error,
    shutdown::Shutdown,
    worker::ProcessedCounter,
};

pub const REPORT_PREFIX: &str = "Reviews processed per second: ";

/// Where aggregated rates go, one call per interval.
#[async_trait]
pub trait RateSink: Send {
    async fn record(&mut self, count: u64) -> io::Result<()>;
}

/// Appends one report line per interval to a file, flushing after each.
pub struct FileSink {
    out: BufWriter<File>,
}

impl FileSink {
    /// Creates the file, truncating whatever a previous run left there.
    pub async fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::create(path.as_ref()).await?;
        debug!(path = %path.as_ref().display(), "opened report file");
        Ok(Self {
            out: BufWriter::new(file),
        })
    }
}

#[async_trait]
impl RateSink for FileSink {
    async fn record(&mut self, count: u64) -> io::Result<()> {
        let line = format!("{}{}\n", REPORT_PREFIX, count);
        self.out.write_all(line.as_bytes()).await?;
        self.out.flush().await
    }
}

#[async_trait]
impl RateSink for mpsc::UnboundedSender<u64> {
    async fn record(&mut self, count: u64) -> io::Result<()> {
        self.send(count)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "rate receiver dropped"))
    }
}

/// Where the aggregator gets its per-interval counts from.
pub enum CountSource {
    /// The standalone modes count in-process.
    Local(Arc<ProcessedCounter>),
    /// Asks every worker in turn, in rank order.
    Pull(Vec<TelemetryChannel>),
    /// Reports the workers sent on their own timers.
    Push(mpsc::UnboundedReceiver<Result<ThroughputSample, Error>>),
}

impl CountSource {
    /// Picks the cluster source matching the telemetry mode the workers were
    /// told to use.
    pub fn cluster(
        mode: TelemetryMode,
        mut channels: Vec<TelemetryChannel>,
        shutdown: Shutdown,
    ) -> Self {
        channels.sort_by_key(TelemetryChannel::rank);
        match mode {
            TelemetryMode::Pull => CountSource::Pull(channels),
            TelemetryMode::Push => {
                CountSource::Push(forward_reports(channels, shutdown))
            }
        }
    }
}

/// Spawns one reader per telemetry channel and funnels every report, or the
/// error that ended the reader, into one receiver.
pub fn forward_reports(
    channels: Vec<TelemetryChannel>,
    shutdown: Shutdown,
) -> mpsc::UnboundedReceiver<Result<ThroughputSample, Error>> {
    let (tx, rx) = mpsc::unbounded_channel();
    for mut channel in channels {
        let tx = tx.clone();
        let mut shutdown = shutdown.clone();
        let span = info_span!("report_reader", rank = channel.rank());
        tokio::spawn(
            async move {
                loop {
                    select! {
                        _ = shutdown.wait() => break,
                        report = channel.next_report() => {
                            let failed = report.is_err();
                            if tx.send(report).is_err() || failed {
                                break;
                            }
                        }
                    }
                }
                debug!("report reader stopped");
            }
            .instrument(span),
        );
    }
    rx
}

/// Collects every worker's count once per interval and emits the sum.
pub struct RateAggregator<S> {
    source: CountSource,
    sink: S,
    interval: Duration,
}

impl<S: RateSink> RateAggregator<S> {
    pub fn new(source: CountSource, sink: S, interval: Duration) -> Self {
        Self {
            source,
            sink,
            interval,
        }
    }

    /// Runs until shutdown. The first report goes out one interval after
    /// start.
    pub async fn run(mut self, mut shutdown: Shutdown) -> Result<(), Error> {
        let mut ticker =
            interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            select! {
                _ = shutdown.wait() => return Ok(()),
                _ = ticker.tick() => {
                    let count = select! {
                        _ = shutdown.wait() => return Ok(()),
                        count = self.collect() => count?,
                    };
                    self.emit(count).await?;
                }
            }
        }
    }

    async fn collect(&mut self) -> Result<u64, Error> {
        match &mut self.source {
            CountSource::Local(counter) => Ok(counter.take()),
            CountSource::Pull(channels) => {
                let mut total = 0;
                for channel in channels.iter_mut() {
                    let sample = channel.request_count().await?;
                    debug!(rank = sample.rank, count = sample.count, "pulled count");
                    total += sample.count;
                }
                Ok(total)
            }
            CountSource::Push(reports) => {
                let mut total = 0;
                loop {
                    match reports.try_recv() {
                        Ok(report) => {
                            let sample = report?;
                            debug!(rank = sample.rank, count = sample.count, "pushed count");
                            total += sample.count;
                        }
                        Err(TryRecvError::Empty) => return Ok(total),
                        Err(TryRecvError::Disconnected) => {
                            warn!("every report reader has stopped");
                            Err(Error::PeerClosed)?
                        }
                    }
                }
            }
        }
    }

    async fn emit(&mut self, count: u64) -> Result<(), Error> {
        info!(count, "{}{}", REPORT_PREFIX, count);
        self.sink.record(count).await?;
        Ok(())
    }
}

/// Worker side of telemetry: answers count requests (pull) or sends a count
/// every interval (push) until shutdown or until the channel fails.
pub async fn report_counts(
    mut channel: TelemetryChannel,
    settings: Ready,
    counter: Arc<ProcessedCounter>,
    mut shutdown: Shutdown,
) -> Result<(), Error> {
    match settings.telemetry {
        TelemetryMode::Pull => loop {
            select! {
                _ = shutdown.wait() => return Ok(()),
                request = channel.next_request() => {
                    request?;
                    channel.report(counter.take()).await?;
                }
            }
        },
        TelemetryMode::Push => {
            let period = Duration::from_millis(settings.interval_ms.max(1));
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                select! {
                    _ = shutdown.wait() => return Ok(()),
                    _ = ticker.tick() => channel.report(counter.take()).await?,
                }
            }
        }
    }
}
