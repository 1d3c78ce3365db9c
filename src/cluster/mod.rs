// The cluster is a star: rank 0 coordinates and every other rank is a worker
// connected to it alone. Workers never talk to each other, so there is no
// routing. Each worker link carries a work stream that only the coordinator
// writes to and a telemetry stream for counts. Keeping the two apart lets the
// ingestion path own every work stream and the rate aggregator own every
// telemetry stream without sharing anything between them.

pub mod axon;
pub mod endpoint;
pub mod local;
pub mod wire;

pub use axon::{CoordinatorLink, TelemetryChannel, WorkSender, WorkerLink};
pub use endpoint::ClusterEndpoint;
pub use wire::{Ready, ThroughputSample, WorkItem};
