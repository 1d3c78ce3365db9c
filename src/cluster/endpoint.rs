use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::{Duration, SystemTime},
};

use hashbrown::HashSet;
use quinn::{Connecting, Connection, VarInt};
use rustls::{
    client::{ServerCertVerified, ServerCertVerifier},
    Certificate, PrivateKey, ServerName,
};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, debug_span, info, warn, Instrument};

use super::{
    axon::{
        admit, bind_telemetry, join, CoordinatorLink, FrameReader,
        FrameWriter, FramedStream, WorkerLink,
    },
    wire::Ready,
};
use crate::error::Error;

/// Name the coordinator's certificate is issued for.
const SERVER_NAME: &str = "fanout-coordinator";
const KEEP_ALIVE: Duration = Duration::from_secs(2);
/// How long a connecting worker gets to finish the join handshake before the
/// coordinator moves on to the next one.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
/// Application close code sent to workers that fail the join handshake.
const REJECTED: u32 = 1;

pub struct ClusterEndpoint {
    ep: quinn::Endpoint,
    join_timeout: Duration,
}

impl ClusterEndpoint {
    /// Binds the coordinator's QUIC endpoint with a freshly generated
    /// self-signed certificate.
    pub fn listen(addr: SocketAddr) -> Result<Self, Error> {
        let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.into()])?;
        let cert_der = cert.serialize_der()?;
        let key_der = cert.serialize_private_key_der();

        let mut server_config = quinn::ServerConfig::with_single_cert(
            vec![Certificate(cert_der)],
            PrivateKey(key_der),
        )?;
        server_config.transport_config(transport_config());

        let ep = quinn::Endpoint::server(server_config, addr)?;
        info!(addr = %ep.local_addr()?, "coordinator listening for workers");
        Ok(Self {
            ep,
            join_timeout: JOIN_TIMEOUT,
        })
    }

    pub fn with_join_timeout(mut self, join_timeout: Duration) -> Self {
        self.join_timeout = join_timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.ep.local_addr()?)
    }

    /// Accepts workers until every rank in `1..size` has joined. Workers that
    /// fail the handshake, or don't finish it within the join timeout, are
    /// disconnected and don't count.
    pub async fn accept_workers(
        &self,
        size: u32,
        settings: Ready,
        max_payload: usize,
    ) -> Result<Vec<WorkerLink>, Error> {
        let mut joined = HashSet::new();
        let mut links = Vec::new();
        while joined.len() + 1 < size as usize {
            let in_progress = self.ep.accept().await.ok_or(Error::EndpointClosed)?;
            let remote = in_progress.remote_address();
            let span = debug_span!("join", remote = %remote);
            let deadline = Instant::now() + self.join_timeout;
            let joining = Self::admit_worker(
                in_progress,
                size,
                &joined,
                settings,
                max_payload,
                deadline,
            );
            match joining.instrument(span).await {
                Ok(link) => {
                    info!(rank = link.rank, %remote, "worker joined");
                    joined.insert(link.rank);
                    links.push(link);
                }
                Err(e) => warn!(%remote, "rejected worker: {}", e),
            }
        }
        links.sort_by_key(|link| link.rank);
        Ok(links)
    }

    async fn admit_worker(
        in_progress: Connecting,
        size: u32,
        joined: &HashSet<u32>,
        settings: Ready,
        max_payload: usize,
        deadline: Instant,
    ) -> Result<WorkerLink, Error> {
        debug!("establishing QUIC connection");
        let conn = timeout_at(deadline, in_progress)
            .await
            .map_err(|_| Error::JoinTimedOut)??;
        let handshake = async {
            let work = accept_stream(&conn, max_payload).await?;
            let work = admit(work, size, joined, settings).await?;
            let telemetry = accept_stream(&conn, max_payload).await?;
            let telemetry = bind_telemetry(work.rank(), telemetry).await?;
            Ok::<_, Error>((work, telemetry))
        };
        let result = timeout_at(deadline, handshake)
            .await
            .unwrap_or(Err(Error::JoinTimedOut));
        match result {
            Ok((work, telemetry)) => Ok(WorkerLink {
                rank: work.rank(),
                work,
                telemetry,
                conn: Some(conn),
            }),
            Err(e) => {
                conn.close(VarInt::from_u32(REJECTED), b"rejected");
                Err(e)
            }
        }
    }

    /// Connects a worker to the coordinator and runs the join handshake.
    /// The returned endpoint must be kept alive for as long as the link is
    /// used.
    pub async fn connect(
        coordinator: SocketAddr,
        rank: u32,
        max_payload: usize,
    ) -> Result<(Self, CoordinatorLink), Error> {
        let span = debug_span!("join", rank, coordinator = %coordinator);
        let (ep, link) = async {
            let (ep, conn) = Self::dial(coordinator).await?;
            // opening is lazy; the telemetry stream only reaches the
            // coordinator once join() writes to it, after Ready
            let work = open_stream(&conn, max_payload).await?;
            let telemetry = open_stream(&conn, max_payload).await?;
            let mut link = join(rank, work, telemetry).await?;
            link.conn = Some(conn);
            Ok::<_, Error>((ep, link))
        }
        .instrument(span)
        .await?;
        info!(rank, %coordinator, "joined cluster");
        Ok((ep, link))
    }

    /// Opens a QUIC connection to the coordinator without joining.
    pub async fn dial(coordinator: SocketAddr) -> Result<(Self, Connection), Error> {
        let bind_ip = match coordinator.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let mut ep = quinn::Endpoint::client(SocketAddr::new(bind_ip, 0))?;
        ep.set_default_client_config(client_config());

        debug!("establishing QUIC connection");
        let conn = ep.connect(coordinator, SERVER_NAME)?.await?;
        debug!("connected via QUIC");
        Ok((
            Self {
                ep,
                join_timeout: JOIN_TIMEOUT,
            },
            conn,
        ))
    }
}

async fn accept_stream(
    conn: &Connection,
    max_payload: usize,
) -> Result<FramedStream, Error> {
    let (tx, rx) = conn.accept_bi().await?;
    Ok(FramedStream::new(
        FrameWriter::new(tx),
        FrameReader::new(rx, max_payload),
    ))
}

async fn open_stream(
    conn: &Connection,
    max_payload: usize,
) -> Result<FramedStream, Error> {
    let (tx, rx) = conn.open_bi().await?;
    Ok(FramedStream::new(
        FrameWriter::new(tx),
        FrameReader::new(rx, max_payload),
    ))
}

/// Shared transport configuration for both sides: BBR congestion control
/// and keep-alives so idle workers aren't timed out between items.
fn transport_config() -> Arc<quinn::TransportConfig> {
    let mut transport_config = quinn::TransportConfig::default();
    let bbr_config = quinn::congestion::BbrConfig::default();
    transport_config.congestion_controller_factory(Arc::new(bbr_config));
    transport_config.keep_alive_interval(Some(KEEP_ALIVE));
    Arc::new(transport_config)
}

fn client_config() -> quinn::ClientConfig {
    let crypto = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(TrustCoordinator))
        .with_no_client_auth();
    let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
    client_config.transport_config(transport_config());
    client_config
}

/// The coordinator generates its certificate at startup, so workers have
/// nothing to pin it against. Cluster links are expected to run on a
/// trusted network.
// TODO: pass the coordinator's certificate fingerprint to workers and check it here
struct TrustCoordinator;

impl ServerCertVerifier for TrustCoordinator {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
