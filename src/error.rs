use std::{fmt, io};

use quinn::{ConnectError, ConnectionError};
use tokio::task::JoinError;
use tokio_tungstenite::tungstenite;

use crate::{cluster::wire::MessageType, config::ConfigError};

#[derive(Debug)]
pub enum Error {
    Config(ConfigError),
    ConnectError(ConnectError),
    ConnectionError(ConnectionError),
    Io(io::Error),
    Tls(rustls::Error),
    Certificate(rcgen::RcgenError),
    WebSocket(tungstenite::Error),
    Task(JoinError),
    /// The inbound stream sent a close frame or ended.
    StreamClosed,
    /// A cluster peer closed its end of a stream.
    PeerClosed,
    EndpointClosed,
    /// A connecting worker didn't finish the join handshake in time.
    JoinTimedOut,
    UnknownMessageType(u8),
    ReceivedUnexpectedMessage {
        expected: MessageType,
        received: MessageType,
    },
    CouldNotEncodeMessage(MessageType),
    CouldNotDecodeMessage(MessageType),
    MessageLengthOverflowed {
        len: usize,
        max: usize,
    },
    RankOutOfRange {
        rank: u32,
        size: u32,
    },
    DuplicateRank(u32),
    RankMismatch {
        expected: u32,
        received: u32,
    },
    NoWorkers,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(e) => write!(f, "configuration error: {}", e),
            Error::ConnectError(e) => write!(f, "could not connect: {}", e),
            Error::ConnectionError(e) => write!(f, "connection lost: {}", e),
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Tls(e) => write!(f, "tls error: {}", e),
            Error::Certificate(e) => write!(f, "certificate error: {}", e),
            Error::WebSocket(e) => write!(f, "websocket error: {}", e),
            Error::Task(e) => write!(f, "task failed: {}", e),
            Error::StreamClosed => write!(f, "inbound stream closed"),
            Error::PeerClosed => write!(f, "peer closed the stream"),
            Error::EndpointClosed => write!(f, "cluster endpoint closed"),
            Error::JoinTimedOut => {
                write!(f, "worker did not finish joining in time")
            }
            Error::UnknownMessageType(byte) => {
                write!(f, "unknown message type {:#04x}", byte)
            }
            Error::ReceivedUnexpectedMessage { expected, received } => write!(
                f,
                "expected a {:?} message but received {:?}",
                expected, received
            ),
            Error::CouldNotEncodeMessage(t) => {
                write!(f, "could not encode {:?} message", t)
            }
            Error::CouldNotDecodeMessage(t) => {
                write!(f, "could not decode {:?} message", t)
            }
            Error::MessageLengthOverflowed { len, max } => write!(
                f,
                "message of {} bytes exceeds the {} byte limit",
                len, max
            ),
            Error::RankOutOfRange { rank, size } => write!(
                f,
                "rank {} is not a worker rank for {} processes",
                rank, size
            ),
            Error::DuplicateRank(rank) => {
                write!(f, "rank {} has already joined", rank)
            }
            Error::RankMismatch { expected, received } => write!(
                f,
                "expected rank {} but peer identified as {}",
                expected, received
            ),
            Error::NoWorkers => write!(f, "no worker slots to dispatch to"),
        }
    }
}

impl std::error::Error for Error {}

impl From<ConfigError> for Error {
    fn from(error: ConfigError) -> Self {
        Self::Config(error)
    }
}

impl From<ConnectError> for Error {
    fn from(error: ConnectError) -> Self {
        Self::ConnectError(error)
    }
}

impl From<ConnectionError> for Error {
    fn from(error: ConnectionError) -> Self {
        Self::ConnectionError(error)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => {
                Self::PeerClosed
            }
            _ => Self::Io(e),
        }
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Self::Tls(e)
    }
}

impl From<rcgen::RcgenError> for Error {
    fn from(e: rcgen::RcgenError) -> Self {
        Self::Certificate(e)
    }
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::ConnectionClosed
            | tungstenite::Error::AlreadyClosed => Self::StreamClosed,
            other => Self::WebSocket(other),
        }
    }
}

impl From<JoinError> for Error {
    fn from(e: JoinError) -> Self {
        Self::Task(e)
    }
}
