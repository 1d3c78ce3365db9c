use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use rkyv::{Archive, Deserialize, Serialize};
use typed_builder::TypedBuilder;

/// Topics the review stream serves.
pub const TOPICS: [&str; 7] = [
    "movies",
    "electronics",
    "music",
    "toys",
    "pet-supplies",
    "automotive",
    "sport",
];

pub const DEFAULT_STREAM_URL: &str =
    "wss://prog3.student.famnit.upr.si/sentiment";
pub const DEFAULT_CLUSTER_PORT: u16 = 4710;
pub const DEFAULT_MAX_ITEM_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    UnknownTopic(String),
    UnknownMode(String),
    UnknownTelemetryMode(String),
    TooFewProcesses(u32),
    RankOutOfRange { rank: u32, size: u32 },
    MissingCoordinatorAddr { rank: u32 },
    ZeroInterval,
    ZeroDedupWindow,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::UnknownTopic(topic) => write!(
                f,
                "invalid topic {:?}, expected one of: {}",
                topic,
                TOPICS.join(", ")
            ),
            ConfigError::UnknownMode(mode) => write!(
                f,
                "invalid mode {:?}, expected sequential, parallel or distributed",
                mode
            ),
            ConfigError::UnknownTelemetryMode(mode) => {
                write!(f, "invalid telemetry mode {:?}, expected pull or push", mode)
            }
            ConfigError::TooFewProcesses(size) => write!(
                f,
                "distributed mode requires at least 2 processes, got {}",
                size
            ),
            ConfigError::RankOutOfRange { rank, size } => {
                write!(f, "rank {} is out of range for {} processes", rank, size)
            }
            ConfigError::MissingCoordinatorAddr { rank } => write!(
                f,
                "worker rank {} needs the coordinator's address",
                rank
            ),
            ConfigError::ZeroInterval => {
                write!(f, "the reporting interval must be non-zero")
            }
            ConfigError::ZeroDedupWindow => {
                write!(f, "the dedup window must be non-zero when set")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// A subscription topic from the allow-list, normalized to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Topic {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let topic = s.trim().to_lowercase();
        if TOPICS.contains(&topic.as_str()) {
            Ok(Self(topic))
        } else {
            Err(ConfigError::UnknownTopic(s.to_string()))
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Analyze every item inline on the ingestion task.
    Sequential,
    /// Analyze every item on the blocking thread pool.
    Parallel,
    /// Fan items out to worker ranks.
    Distributed,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Sequential => "sequential",
            Mode::Parallel => "parallel",
            Mode::Distributed => "distributed",
        }
    }

    /// Name of the file the per-interval rates are appended to.
    pub fn report_file(&self) -> String {
        format!("{}_review_counts.txt", self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sequential" => Ok(Mode::Sequential),
            "parallel" => Ok(Mode::Parallel),
            "distributed" => Ok(Mode::Distributed),
            _ => Err(ConfigError::UnknownMode(s.to_string())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How worker counts reach the coordinator. Sent to every worker in the join
/// handshake so the whole cluster agrees on it.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum TelemetryMode {
    /// The coordinator asks each worker in turn once per interval.
    Pull,
    /// Each worker reports on its own timer.
    Push,
}

impl FromStr for TelemetryMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pull" => Ok(TelemetryMode::Pull),
            "push" => Ok(TelemetryMode::Push),
            _ => Err(ConfigError::UnknownTelemetryMode(s.to_string())),
        }
    }
}

/// What this process does, resolved from the configuration at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// A single process that ingests and analyzes everything itself.
    Standalone(Mode),
    /// Rank 0 of a networked cluster of `size` processes.
    Coordinator { size: u32 },
    /// A networked worker.
    Worker { rank: u32, size: u32 },
    /// The coordinator and `size - 1` workers as tasks of this process.
    InProcessCluster { size: u32 },
}

#[derive(TypedBuilder, Debug, Clone)]
pub struct Config {
    pub topic: Topic,
    pub mode: Mode,
    /// This process's rank. Leave unset to run every rank in-process.
    #[builder(default)]
    pub rank: Option<u32>,
    /// Total number of ranks, coordinator included.
    #[builder(default)]
    pub size: Option<u32>,
    #[builder(default = DEFAULT_STREAM_URL.to_string(), setter(into))]
    pub stream_url: String,
    /// Where the coordinator accepts workers.
    #[builder(default = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_CLUSTER_PORT))]
    pub listen_addr: SocketAddr,
    /// Where workers find the coordinator.
    #[builder(default)]
    pub coordinator_addr: Option<SocketAddr>,
    #[builder(default = Duration::from_secs(1))]
    pub interval: Duration,
    #[builder(default = Duration::from_secs(10 * 60))]
    pub run_for: Duration,
    #[builder(default = TelemetryMode::Pull)]
    pub telemetry: TelemetryMode,
    /// Forget seen contents after this long. Unset keeps them forever.
    #[builder(default)]
    pub dedup_window: Option<Duration>,
    #[builder(default = DEFAULT_MAX_ITEM_BYTES)]
    pub max_item_bytes: usize,
    #[builder(default = PathBuf::from("."), setter(into))]
    pub output_dir: PathBuf,
}

impl Config {
    /// Checks the preconditions that must hold before any connection is made
    /// and resolves this process's role.
    pub fn validate(&self) -> Result<Role, ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        if self.dedup_window.map_or(false, |window| window.is_zero()) {
            return Err(ConfigError::ZeroDedupWindow);
        }
        let size = match self.mode {
            Mode::Sequential | Mode::Parallel => {
                return Ok(Role::Standalone(self.mode))
            }
            Mode::Distributed => self.size.unwrap_or(1),
        };
        if size < 2 {
            return Err(ConfigError::TooFewProcesses(size));
        }
        match self.rank {
            None => Ok(Role::InProcessCluster { size }),
            Some(0) => Ok(Role::Coordinator { size }),
            Some(rank) if rank >= size => {
                Err(ConfigError::RankOutOfRange { rank, size })
            }
            Some(rank) => {
                if self.coordinator_addr.is_none() {
                    return Err(ConfigError::MissingCoordinatorAddr { rank });
                }
                Ok(Role::Worker { rank, size })
            }
        }
    }

    pub fn report_path(&self) -> PathBuf {
        self.output_dir.join(self.mode.report_file())
    }
}
