use std::sync::Arc;

use tokio::{select, signal, time::sleep};
use tracing::{info, info_span, warn, Instrument};

use crate::{
    analysis::{Analyzer, LexiconAnalyzer},
    cluster::{local, wire::max_payload_len, ClusterEndpoint, Ready, WorkerLink},
    config::{Config, ConfigError, Mode, Role},
    dedup::Deduplicator,
    dispatch::Dispatcher,
    error::Error,
    ingest::StreamIngestor,
    pipeline::{Pipeline, Route},
    shutdown::{self, Shutdown},
    telemetry::{CountSource, FileSink, RateAggregator},
    worker::{ProcessedCounter, WorkerAgent},
};

/// Owns a validated configuration and runs whatever role it resolves to
/// until the run duration elapses, Ctrl-C arrives, or the role fails.
pub struct Supervisor {
    config: Config,
    role: Role,
    analyzer: Arc<dyn Analyzer>,
}

impl Supervisor {
    /// Validates the configuration. Nothing is connected yet.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        let role = config.validate()?;
        Ok(Self {
            config,
            role,
            analyzer: Arc::new(LexiconAnalyzer::default()),
        })
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn run(self) -> Result<(), Error> {
        let (trigger, shutdown) = shutdown::channel();
        let run_for = self.config.run_for;
        let timer = tokio::spawn(async move {
            select! {
                _ = sleep(run_for) => info!(?run_for, "run duration elapsed"),
                _ = interrupted() => info!("interrupted"),
            }
            trigger.fire();
        });

        let span = info_span!("supervisor", role = ?self.role);
        let result = async {
            info!(topic = %self.config.topic, mode = %self.config.mode, "starting");
            match self.role {
                Role::Standalone(mode) => self.run_standalone(mode, shutdown).await,
                Role::Coordinator { size } => self.run_coordinator(size, shutdown).await,
                Role::Worker { rank, .. } => self.run_worker(rank, shutdown).await,
                Role::InProcessCluster { size } => {
                    self.run_in_process(size, shutdown).await
                }
            }
        }
        .instrument(span)
        .await;

        timer.abort();
        result
    }

    async fn run_standalone(&self, mode: Mode, shutdown: Shutdown) -> Result<(), Error> {
        let counter = Arc::new(ProcessedCounter::default());
        let analyzer = self.analyzer.clone();
        let route = match mode {
            Mode::Parallel => Route::Parallel {
                analyzer,
                counter: counter.clone(),
            },
            _ => Route::Sequential {
                analyzer,
                counter: counter.clone(),
            },
        };
        self.coordinate(route, CountSource::Local(counter), shutdown).await
    }

    async fn run_coordinator(&self, size: u32, mut shutdown: Shutdown) -> Result<(), Error> {
        let endpoint = ClusterEndpoint::listen(self.config.listen_addr)?;
        info!(size, "waiting for workers");
        let links = select! {
            _ = shutdown.wait() => return Ok(()),
            links = endpoint.accept_workers(size, self.settings(), self.max_payload()) => links?,
        };
        self.distribute(links, shutdown).await
    }

    async fn run_worker(&self, rank: u32, mut shutdown: Shutdown) -> Result<(), Error> {
        let coordinator = self
            .config
            .coordinator_addr
            .ok_or(ConfigError::MissingCoordinatorAddr { rank })?;
        let (_endpoint, link) = select! {
            _ = shutdown.wait() => return Ok(()),
            joined = ClusterEndpoint::connect(coordinator, rank, self.max_payload()) => joined?,
        };
        WorkerAgent::new(rank, self.analyzer.clone())
            .run(link, shutdown)
            .await
    }

    async fn run_in_process(&self, size: u32, shutdown: Shutdown) -> Result<(), Error> {
        let (links, workers) =
            local::connect(size, self.settings(), self.max_payload()).await?;

        // the workers stop when the coordinator does, whatever the reason
        let (stop_workers, worker_shutdown) = shutdown::channel();
        let agents: Vec<_> = workers
            .into_iter()
            .map(|link| {
                let agent = WorkerAgent::new(link.rank, self.analyzer.clone());
                tokio::spawn(agent.run(link, worker_shutdown.clone()))
            })
            .collect();

        let result = self.distribute(links, shutdown).await;
        stop_workers.fire();
        for agent in agents {
            match agent.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("in-process worker failed: {}", e),
                Err(e) => warn!("in-process worker panicked: {}", e),
            }
        }
        result
    }

    /// Coordinator side of a distributed run once every worker has joined.
    async fn distribute(&self, links: Vec<WorkerLink>, shutdown: Shutdown) -> Result<(), Error> {
        let mut senders = Vec::with_capacity(links.len());
        let mut channels = Vec::with_capacity(links.len());
        let mut _conns = Vec::with_capacity(links.len());
        for WorkerLink {
            work,
            telemetry,
            conn,
            ..
        } in links
        {
            senders.push(work);
            channels.push(telemetry);
            _conns.push(conn);
        }

        let dispatcher = Dispatcher::new(senders, self.config.max_item_bytes)?;
        info!(workers = dispatcher.worker_count(), "dispatching round robin");
        let source = CountSource::cluster(self.config.telemetry, channels, shutdown.clone());
        self.coordinate(Route::Distributed(dispatcher), source, shutdown)
            .await
    }

    /// Runs ingestion and rate aggregation side by side. Whichever stops
    /// first ends the run.
    async fn coordinate(
        &self,
        route: Route,
        source: CountSource,
        mut shutdown: Shutdown,
    ) -> Result<(), Error> {
        let sink = FileSink::create(self.config.report_path()).await?;
        let mut ingestor = select! {
            _ = shutdown.wait() => return Ok(()),
            ingestor = StreamIngestor::connect(
                &self.config.stream_url,
                self.config.topic.clone(),
            ) => ingestor?,
        };

        let aggregator = RateAggregator::new(source, sink, self.config.interval);
        let mut aggregating = tokio::spawn(aggregator.run(shutdown.clone()));
        let dedup = Deduplicator::new(self.config.dedup_window.into());
        let mut pipeline = Pipeline::new(dedup, route);

        let result = select! {
            ingested = pipeline.run(&mut ingestor, shutdown) => ingested,
            aggregated = &mut aggregating => aggregated.map_err(Error::from).and_then(|r| r),
        };
        aggregating.abort();
        result
    }

    fn settings(&self) -> Ready {
        Ready {
            telemetry: self.config.telemetry,
            interval_ms: self.config.interval.as_millis() as u64,
        }
    }

    fn max_payload(&self) -> usize {
        max_payload_len(self.config.max_item_bytes)
    }
}

/// Resolves on Ctrl-C. If the signal handler can't be installed the run is
/// bounded by its duration alone.
async fn interrupted() {
    if let Err(e) = signal::ctrl_c().await {
        warn!("could not listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}
