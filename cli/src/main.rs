use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    process::ExitCode,
    time::Duration,
};

use clap::{error::ErrorKind, CommandFactory, Parser};
use fanout::{
    config::{
        Mode, TelemetryMode, Topic, DEFAULT_CLUSTER_PORT, DEFAULT_MAX_ITEM_BYTES,
        DEFAULT_STREAM_URL,
    },
    summary::summarize_reports,
    Config, Supervisor,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fanout", about = "Stream reviews, drop repeats, fan out to workers")]
struct Args {
    /// Topic to subscribe to: movies, electronics, music, toys, pet-supplies,
    /// automotive or sport.
    #[arg(long, required_unless_present = "summarize")]
    topic: Option<Topic>,

    /// sequential, parallel or distributed.
    #[arg(long, required_unless_present = "summarize")]
    mode: Option<Mode>,

    /// Print statistics for the report files in --output-dir instead of
    /// running.
    #[arg(long, conflicts_with_all = ["topic", "mode", "rank", "size", "coordinator"])]
    summarize: bool,

    /// This process's rank in a distributed run. Leave unset to run every
    /// rank in this process.
    #[arg(long, env = "FANOUT_RANK")]
    rank: Option<u32>,

    /// Number of ranks in a distributed run, coordinator included.
    #[arg(long, env = "FANOUT_SIZE")]
    size: Option<u32>,

    #[arg(long, env = "FANOUT_STREAM_URL", default_value = DEFAULT_STREAM_URL)]
    url: String,

    /// Where the coordinator accepts workers.
    #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_CLUSTER_PORT)))]
    listen: SocketAddr,

    /// Where workers find the coordinator.
    #[arg(long, env = "FANOUT_COORDINATOR")]
    coordinator: Option<SocketAddr>,

    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Stop after this many seconds.
    #[arg(long, default_value_t = 600)]
    run_for_secs: u64,

    /// How workers report counts: pull or push.
    #[arg(long, default_value = "pull")]
    telemetry: TelemetryMode,

    /// Forget seen reviews after this many seconds. Unset remembers them
    /// for the whole run.
    #[arg(long)]
    dedup_window_secs: Option<u64>,

    #[arg(long, default_value_t = DEFAULT_MAX_ITEM_BYTES)]
    max_item_bytes: usize,

    /// Directory the report file is written to.
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,
}

impl TryFrom<Args> for Config {
    type Error = clap::Error;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        let (Some(topic), Some(mode)) = (args.topic, args.mode) else {
            return Err(Args::command().error(
                ErrorKind::MissingRequiredArgument,
                "--topic and --mode are required",
            ));
        };
        Ok(Config::builder()
            .topic(topic)
            .mode(mode)
            .rank(args.rank)
            .size(args.size)
            .stream_url(args.url)
            .listen_addr(args.listen)
            .coordinator_addr(args.coordinator)
            .interval(Duration::from_millis(args.interval_ms))
            .run_for(Duration::from_secs(args.run_for_secs))
            .telemetry(args.telemetry)
            .dedup_window(args.dedup_window_secs.map(Duration::from_secs))
            .max_item_bytes(args.max_item_bytes)
            .output_dir(args.output_dir)
            .build())
    }
}

async fn summarize(dir: &Path) -> ExitCode {
    let summaries = match summarize_reports(dir).await {
        Ok(summaries) => summaries,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    if summaries.is_empty() {
        error!(dir = %dir.display(), "no report files to summarize");
        return ExitCode::FAILURE;
    }
    for (mode, summary) in summaries {
        match summary {
            Some(summary) => {
                println!("{} ({} reports): {}", mode, summary.samples, summary)
            }
            None => println!("{}: no reports", mode),
        }
    }
    ExitCode::SUCCESS
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.summarize {
        return summarize(&args.output_dir).await;
    }
    let config = match Config::try_from(args) {
        Ok(config) => config,
        Err(e) => e.exit(),
    };
    let supervisor = match Supervisor::new(config) {
        Ok(supervisor) => supervisor,
        // prints the usage and exits with status 2
        Err(e) => Args::command().error(ErrorKind::ValueValidation, e).exit(),
    };

    info!(role = ?supervisor.role(), "configuration accepted");
    match supervisor.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout::config::Role;

    #[test]
    fn args_are_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn flags_map_onto_the_config() {
        let args = Args::try_parse_from([
            "fanout",
            "--topic",
            "Music",
            "--mode",
            "distributed",
            "--size",
            "4",
            "--telemetry",
            "push",
            "--dedup-window-secs",
            "30",
        ])
        .unwrap();
        let config = Config::try_from(args).unwrap();
        assert_eq!(config.topic.as_str(), "music");
        assert_eq!(config.telemetry, TelemetryMode::Push);
        assert_eq!(config.dedup_window, Some(Duration::from_secs(30)));
        assert_eq!(config.validate(), Ok(Role::InProcessCluster { size: 4 }));
    }

    #[test]
    fn unknown_topics_are_usage_errors() {
        let err = Args::try_parse_from(["fanout", "--topic", "books", "--mode", "sequential"])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
    }

    #[test]
    fn summarize_needs_no_topic_or_mode() {
        let args =
            Args::try_parse_from(["fanout", "--summarize", "--output-dir", "runs"]).unwrap();
        assert!(args.summarize);
        assert_eq!(args.output_dir, PathBuf::from("runs"));

        let err = Args::try_parse_from(["fanout", "--summarize", "--mode", "parallel"])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentConflict);
    }

    #[test]
    fn running_still_needs_topic_and_mode() {
        let err = Args::try_parse_from(["fanout", "--mode", "parallel"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }
}
