//! Ingests a live stream of reviews, drops repeats, and fans the rest out
//! round robin to a pool of workers while reporting how many items the pool
//! processes per second.
//!
//! Rank 0 of a cluster runs the [`supervisor::Supervisor`] coordinator path:
//! [`ingest`] into [`dedup`] into [`dispatch`], with the
//! [`telemetry::RateAggregator`] alongside. Every other rank runs a
//! [`worker::WorkerAgent`]. The standalone modes skip the cluster and
//! analyze in-process.

pub mod analysis;
pub mod cluster;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod ingest;
pub mod pipeline;
pub mod shutdown;
pub mod summary;
pub mod supervisor;
pub mod telemetry;
pub mod worker;

pub use config::Config;
pub use error::Error;
pub use supervisor::Supervisor;
