//! In-memory links for running every rank inside one process.

use futures::future::try_join_all;
use hashbrown::HashSet;
use tracing::{debug, info};

use super::{
    axon::{
        admit, bind_telemetry, join, CoordinatorLink, FrameReader,
        FrameWriter, FramedStream, WorkerLink,
    },
    wire::Ready,
};
use crate::error::Error;

const PIPE_BUFFER: usize = 256 * 1024;

/// Returns the two ends of an in-memory framed stream.
pub fn pipes(max_payload: usize) -> (FramedStream, FramedStream) {
    let (a, b) = tokio::io::duplex(PIPE_BUFFER);
    let (a_rx, a_tx) = tokio::io::split(a);
    let (b_rx, b_tx) = tokio::io::split(b);
    (
        FramedStream::new(
            FrameWriter::new(a_tx),
            FrameReader::new(a_rx, max_payload),
        ),
        FramedStream::new(
            FrameWriter::new(b_tx),
            FrameReader::new(b_rx, max_payload),
        ),
    )
}

/// Builds a cluster of `size` ranks out of pipes and runs the join handshake
/// for every worker. Returns the coordinator's links and the workers' links,
/// both ordered by rank.
pub async fn connect(
    size: u32,
    settings: Ready,
    max_payload: usize,
) -> Result<(Vec<WorkerLink>, Vec<CoordinatorLink>), Error> {
    let mut coordinator_ends = Vec::new();
    let mut joins = Vec::new();
    for rank in 1..size {
        let (c_work, w_work) = pipes(max_payload);
        let (c_tel, w_tel) = pipes(max_payload);
        coordinator_ends.push((rank, c_work, c_tel));
        joins.push(join(rank, w_work, w_tel));
    }

    let coordinator = async {
        let mut joined = HashSet::new();
        let mut links = Vec::new();
        for (rank, work, telemetry) in coordinator_ends {
            let work = admit(work, size, &joined, settings).await?;
            let telemetry = bind_telemetry(rank, telemetry).await?;
            joined.insert(rank);
            debug!(rank, "in-process worker joined");
            links.push(WorkerLink {
                rank,
                work,
                telemetry,
                conn: None,
            });
        }
        Ok::<_, Error>(links)
    };

    let (links, workers) = tokio::try_join!(coordinator, try_join_all(joins))?;
    info!(workers = links.len(), "in-process cluster ready");
    Ok((links, workers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TelemetryMode;

    #[tokio::test]
    async fn every_worker_rank_joins() {
        let settings = Ready {
            telemetry: TelemetryMode::Push,
            interval_ms: 250,
        };
        let (links, workers) = connect(4, settings, 1024).await.unwrap();
        assert_eq!(
            links.iter().map(|l| l.rank).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(
            workers.iter().map(|w| w.rank).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(workers.iter().all(|w| w.settings == settings));
    }
}
