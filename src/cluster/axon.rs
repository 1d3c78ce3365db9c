use byteorder::{ByteOrder, LittleEndian};
use hashbrown::HashSet;
use rkyv::AlignedVec;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::wire::{
    Frame, Hello, MessageType, Ready, ThroughputSample, WorkItem, HEADER_LEN,
};
use crate::error::Error::{self, *};

/// Axons are the links between the coordinator and its workers. Each axon
/// carries two streams: a work stream (coordinator to worker) and a
/// telemetry stream (counts flowing back). They are framed the same way
/// whether they run over QUIC or in-memory pipes.
pub struct FrameWriter(Box<dyn AsyncWrite + Send + Unpin>);

impl FrameWriter {
    pub fn new(stream: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self(Box::new(stream))
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<(), Error> {
        let buf = frame.encode()?;
        self.0.write_all(&buf).await?;
        self.0.flush().await?;
        Ok(())
    }
}

pub struct FrameReader {
    stream: Box<dyn AsyncRead + Send + Unpin>,
    max_payload: usize,
}

impl FrameReader {
    pub fn new(
        stream: impl AsyncRead + Send + Unpin + 'static,
        max_payload: usize,
    ) -> Self {
        Self {
            stream: Box::new(stream),
            max_payload,
        }
    }

    pub async fn recv(&mut self) -> Result<Frame, Error> {
        let mut header = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut header).await?;
        let msg_type = MessageType::try_from(header[0])?;
        let len = LittleEndian::read_u32(&header[1..]) as usize;
        if len > self.max_payload {
            warn!(
                ?msg_type,
                len,
                max = self.max_payload,
                "peer sent a frame over the size limit"
            );
            Err(MessageLengthOverflowed {
                len,
                max: self.max_payload,
            })?
        }

        // rkyv validates alignment, so read into an aligned buffer
        let mut payload = AlignedVec::with_capacity(len);
        payload.resize(len, 0);
        self.stream.read_exact(payload.as_mut_slice()).await?;
        Frame::decode(msg_type, &payload)
    }

    /// Receives the next frame, failing if it isn't of the given type.
    pub async fn expect(&mut self, expected: MessageType) -> Result<Frame, Error> {
        let frame = self.recv().await?;
        if frame.msg_type() != expected {
            Err(ReceivedUnexpectedMessage {
                expected,
                received: frame.msg_type(),
            })?
        }
        Ok(frame)
    }
}

/// Both directions of one stream, before the handshake has bound it to a
/// rank.
pub struct FramedStream {
    pub tx: FrameWriter,
    pub rx: FrameReader,
}

impl FramedStream {
    pub fn new(tx: FrameWriter, rx: FrameReader) -> Self {
        Self { tx, rx }
    }
}

/// The coordinator's handle on one worker's work stream.
pub struct WorkSender {
    rank: u32,
    tx: FrameWriter,
}

impl WorkSender {
    pub fn new(rank: u32, tx: FrameWriter) -> Self {
        Self { rank, tx }
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub async fn send(&mut self, item: WorkItem) -> Result<(), Error> {
        self.tx.send(&Frame::Work(item)).await
    }
}

/// The telemetry stream between the coordinator and one worker. Both ends
/// use the same type; `rank` is always the worker's.
pub struct TelemetryChannel {
    rank: u32,
    tx: FrameWriter,
    rx: FrameReader,
}

impl TelemetryChannel {
    pub fn new(rank: u32, stream: FramedStream) -> Self {
        Self {
            rank,
            tx: stream.tx,
            rx: stream.rx,
        }
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// Coordinator side of a pull: asks for the worker's count and waits for
    /// the answer.
    pub async fn request_count(&mut self) -> Result<ThroughputSample, Error> {
        self.tx.send(&Frame::CountRequest).await?;
        self.next_report().await
    }

    /// Coordinator side: waits for the worker's next report.
    pub async fn next_report(&mut self) -> Result<ThroughputSample, Error> {
        match self.rx.expect(MessageType::CountReport).await? {
            Frame::CountReport(sample) if sample.rank == self.rank => Ok(sample),
            Frame::CountReport(sample) => Err(RankMismatch {
                expected: self.rank,
                received: sample.rank,
            }),
            other => Err(ReceivedUnexpectedMessage {
                expected: MessageType::CountReport,
                received: other.msg_type(),
            }),
        }
    }

    /// Worker side: waits for the coordinator to ask for a count.
    pub async fn next_request(&mut self) -> Result<(), Error> {
        self.rx.expect(MessageType::CountRequest).await.map(|_| ())
    }

    /// Worker side: sends a count.
    pub async fn report(&mut self, count: u64) -> Result<(), Error> {
        let sample = ThroughputSample::now(self.rank, count);
        self.tx.send(&Frame::CountReport(sample)).await
    }
}

/// The coordinator's view of a worker that completed the join handshake.
pub struct WorkerLink {
    pub rank: u32,
    pub work: WorkSender,
    pub telemetry: TelemetryChannel,
    /// Held so the QUIC connection outlives the handshake.
    pub conn: Option<quinn::Connection>,
}

/// A worker's view of the coordinator after the join handshake.
pub struct CoordinatorLink {
    pub rank: u32,
    pub work: FrameReader,
    pub telemetry: TelemetryChannel,
    pub settings: Ready,
    pub conn: Option<quinn::Connection>,
}

/// Worker side of the join handshake. The worker announces its rank on the
/// work stream, waits for the coordinator's settings, then announces itself
/// again on the telemetry stream so the coordinator can pair the two.
pub async fn join(
    rank: u32,
    work: FramedStream,
    telemetry: FramedStream,
) -> Result<CoordinatorLink, Error> {
    let FramedStream {
        tx: mut work_tx,
        rx: mut work_rx,
    } = work;
    work_tx.send(&Frame::Hello(Hello { rank })).await?;
    debug!(rank, "sent hello on work stream");

    let settings = match work_rx.expect(MessageType::Ready).await? {
        Frame::Ready(settings) => settings,
        other => Err(ReceivedUnexpectedMessage {
            expected: MessageType::Ready,
            received: other.msg_type(),
        })?,
    };
    debug!(rank, ?settings, "coordinator accepted us");

    let mut telemetry = telemetry;
    telemetry.tx.send(&Frame::Hello(Hello { rank })).await?;
    debug!(rank, "sent hello on telemetry stream");

    Ok(CoordinatorLink {
        rank,
        work: work_rx,
        telemetry: TelemetryChannel::new(rank, telemetry),
        settings,
        conn: None,
    })
}

/// Coordinator side of the join handshake, work stream half. Checks that the
/// announced rank is a worker rank that hasn't joined yet and answers with
/// the cluster settings.
pub async fn admit(
    work: FramedStream,
    size: u32,
    joined: &HashSet<u32>,
    settings: Ready,
) -> Result<WorkSender, Error> {
    let FramedStream { mut tx, mut rx } = work;
    let rank = read_hello(&mut rx).await?;
    if rank == 0 || rank >= size {
        Err(RankOutOfRange { rank, size })?
    }
    if joined.contains(&rank) {
        Err(DuplicateRank(rank))?
    }
    tx.send(&Frame::Ready(settings)).await?;
    debug!(rank, "admitted worker");
    Ok(WorkSender::new(rank, tx))
}

/// Coordinator side of the join handshake, telemetry stream half.
pub async fn bind_telemetry(
    rank: u32,
    mut telemetry: FramedStream,
) -> Result<TelemetryChannel, Error> {
    let received = read_hello(&mut telemetry.rx).await?;
    if received != rank {
        Err(RankMismatch {
            expected: rank,
            received,
        })?
    }
    Ok(TelemetryChannel::new(rank, telemetry))
}

async fn read_hello(rx: &mut FrameReader) -> Result<u32, Error> {
    match rx.expect(MessageType::Hello).await? {
        Frame::Hello(Hello { rank }) => Ok(rank),
        other => Err(ReceivedUnexpectedMessage {
            expected: MessageType::Hello,
            received: other.msg_type(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cluster::local::pipes, config::TelemetryMode};

    const MAX: usize = 1024;

    fn settings() -> Ready {
        Ready {
            telemetry: TelemetryMode::Pull,
            interval_ms: 1000,
        }
    }

    #[tokio::test]
    async fn frames_cross_a_pipe() {
        let (mut a, mut b) = pipes(MAX);
        let item = WorkItem {
            seq: 3,
            text: "works great".into(),
        };
        a.tx.send(&Frame::Work(item.clone())).await.unwrap();
        assert_eq!(b.rx.recv().await.unwrap(), Frame::Work(item));

        b.tx.send(&Frame::CountRequest).await.unwrap();
        assert_eq!(a.rx.recv().await.unwrap(), Frame::CountRequest);
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let (tx, rx) = tokio::io::duplex(4096);
        let mut tx = FrameWriter::new(tx);
        let mut rx = FrameReader::new(rx, 16);
        tx.send(&Frame::Work(WorkItem {
            seq: 0,
            text: "x".repeat(100),
        }))
        .await
        .unwrap();
        assert!(matches!(
            rx.recv().await,
            Err(MessageLengthOverflowed { max: 16, .. })
        ));
    }

    #[tokio::test]
    async fn closed_peer_is_reported() {
        let (tx, rx) = tokio::io::duplex(64);
        drop(tx);
        let mut rx = FrameReader::new(rx, MAX);
        assert!(matches!(rx.recv().await, Err(PeerClosed)));
    }

    #[tokio::test]
    async fn join_and_admit_agree() {
        let (c_work, w_work) = pipes(MAX);
        let (c_tel, w_tel) = pipes(MAX);
        let worker = tokio::spawn(join(2, w_work, w_tel));

        let sender = admit(c_work, 3, &HashSet::new(), settings())
            .await
            .unwrap();
        assert_eq!(sender.rank(), 2);
        let channel = bind_telemetry(2, c_tel).await.unwrap();
        assert_eq!(channel.rank(), 2);

        let link = worker.await.unwrap().unwrap();
        assert_eq!(link.rank, 2);
        assert_eq!(link.settings, settings());
    }

    #[tokio::test]
    async fn admit_rejects_bad_ranks() {
        for (rank, joined) in [(0, vec![]), (3, vec![]), (1, vec![1])] {
            let (c_work, mut w_work) = pipes(MAX);
            w_work
                .tx
                .send(&Frame::Hello(Hello { rank }))
                .await
                .unwrap();
            let joined: HashSet<u32> = joined.into_iter().collect();
            let result = admit(c_work, 3, &joined, settings()).await;
            match rank {
                1 => assert!(matches!(result, Err(DuplicateRank(1)))),
                _ => assert!(matches!(result, Err(RankOutOfRange { .. }))),
            }
        }
    }

    #[tokio::test]
    async fn telemetry_must_come_from_the_admitted_rank() {
        let (c_tel, mut w_tel) = pipes(MAX);
        w_tel
            .tx
            .send(&Frame::Hello(Hello { rank: 1 }))
            .await
            .unwrap();
        assert!(matches!(
            bind_telemetry(2, c_tel).await,
            Err(RankMismatch {
                expected: 2,
                received: 1
            })
        ));
    }

    #[tokio::test]
    async fn pull_round_trip() {
        let (c_tel, w_tel) = pipes(MAX);
        let mut coordinator = TelemetryChannel::new(1, c_tel);
        let mut worker = TelemetryChannel::new(1, w_tel);
        let answer = tokio::spawn(async move {
            worker.next_request().await.unwrap();
            worker.report(5).await.unwrap();
        });
        let sample = coordinator.request_count().await.unwrap();
        assert_eq!((sample.rank, sample.count), (1, 5));
        answer.await.unwrap();
    }
}
