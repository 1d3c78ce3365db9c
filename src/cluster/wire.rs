use byteorder::{ByteOrder, LittleEndian};
use chrono::Utc;
use rkyv::{from_bytes, to_bytes, AlignedVec, Archive, Deserialize, Serialize};

use crate::{config::TelemetryMode, error::Error};

/// Every frame on a cluster stream is `msg_type | len | payload`: one type
/// byte, the payload length as a little endian u32, then `len` bytes of
/// rkyv-archived payload.
pub const HEADER_LEN: usize = 1 + 4;

/// Room for the archived fields that travel next to an item's text.
pub const WORK_FRAME_OVERHEAD: usize = 64;

/// Largest payload a receiver accepts when items are capped at
/// `max_item_bytes`.
pub fn max_payload_len(max_item_bytes: usize) -> usize {
    max_item_bytes + WORK_FRAME_OVERHEAD
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    // HANDSHAKE MESSAGES
    /// A worker announcing its rank on a stream it opened
    Hello = 0,
    /// The coordinator accepted the worker's rank
    Ready = 1,

    // WORK MESSAGES
    /// An item for the worker to analyze
    Work = 2,

    // TELEMETRY MESSAGES
    /// The coordinator asking for the worker's count since its last report
    CountRequest = 3,
    /// A worker's processed count for one window
    CountReport = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Hello),
            1 => Ok(MessageType::Ready),
            2 => Ok(MessageType::Work),
            3 => Ok(MessageType::CountRequest),
            4 => Ok(MessageType::CountReport),
            other => Err(Error::UnknownMessageType(other)),
        }
    }
}

#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Hello {
    pub rank: u32,
}

/// Cluster-wide settings the coordinator hands every worker that joins.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Ready {
    pub telemetry: TelemetryMode,
    pub interval_ms: u64,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct WorkItem {
    /// Arrival order at the coordinator, after dedup.
    pub seq: u64,
    pub text: String,
}

/// One worker's processed count for the window ending at `window_end`
/// (microseconds since the Unix epoch).
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct ThroughputSample {
    pub rank: u32,
    pub count: u64,
    pub window_end: i64,
}

impl ThroughputSample {
    pub fn now(rank: u32, count: u64) -> Self {
        Self {
            rank,
            count,
            window_end: Utc::now().timestamp_micros(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Hello(Hello),
    Ready(Ready),
    Work(WorkItem),
    CountRequest,
    CountReport(ThroughputSample),
}

impl Frame {
    pub fn msg_type(&self) -> MessageType {
        match self {
            Frame::Hello(_) => MessageType::Hello,
            Frame::Ready(_) => MessageType::Ready,
            Frame::Work(_) => MessageType::Work,
            Frame::CountRequest => MessageType::CountRequest,
            Frame::CountReport(_) => MessageType::CountReport,
        }
    }

    /// Encodes the frame, header included.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let msg_type = self.msg_type();
        let payload = match self {
            Frame::Hello(msg) => to_bytes::<_, 64>(msg).ok(),
            Frame::Ready(msg) => to_bytes::<_, 64>(msg).ok(),
            Frame::Work(msg) => to_bytes::<_, 1024>(msg).ok(),
            Frame::CountRequest => Some(AlignedVec::new()),
            Frame::CountReport(msg) => to_bytes::<_, 64>(msg).ok(),
        }
        .ok_or(Error::CouldNotEncodeMessage(msg_type))?;

        let len = u32::try_from(payload.len()).map_err(|_| {
            Error::MessageLengthOverflowed {
                len: payload.len(),
                max: u32::MAX as usize,
            }
        })?;
        let mut buf = vec![0u8; HEADER_LEN + payload.len()];
        buf[0] = msg_type as u8;
        LittleEndian::write_u32(&mut buf[1..HEADER_LEN], len);
        buf[HEADER_LEN..].copy_from_slice(&payload);
        Ok(buf)
    }

    /// Decodes a payload whose header has already been read.
    pub fn decode(msg_type: MessageType, payload: &[u8]) -> Result<Self, Error> {
        let frame = match msg_type {
            MessageType::Hello => from_bytes::<Hello>(payload).ok().map(Frame::Hello),
            MessageType::Ready => from_bytes::<Ready>(payload).ok().map(Frame::Ready),
            MessageType::Work => from_bytes::<WorkItem>(payload).ok().map(Frame::Work),
            MessageType::CountRequest => {
                payload.is_empty().then_some(Frame::CountRequest)
            }
            MessageType::CountReport => from_bytes::<ThroughputSample>(payload)
                .ok()
                .map(Frame::CountReport),
        };
        frame.ok_or(Error::CouldNotDecodeMessage(msg_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_message_type_is_rejected() {
        assert!(matches!(
            MessageType::try_from(0x2a),
            Err(Error::UnknownMessageType(0x2a))
        ));
    }

    #[test]
    fn header_carries_type_and_length() {
        let buf = Frame::Work(WorkItem {
            seq: 7,
            text: "great".into(),
        })
        .encode()
        .unwrap();
        assert_eq!(buf[0], MessageType::Work as u8);
        let len = LittleEndian::read_u32(&buf[1..HEADER_LEN]) as usize;
        assert_eq!(len, buf.len() - HEADER_LEN);
    }

    #[test]
    fn count_request_has_no_payload() {
        let buf = Frame::CountRequest.encode().unwrap();
        assert_eq!(buf, vec![MessageType::CountRequest as u8, 0, 0, 0, 0]);
    }

    #[test]
    fn garbage_payload_does_not_decode() {
        let mut payload = AlignedVec::new();
        payload.extend_from_slice(&[0xff; 3]);
        assert!(matches!(
            Frame::decode(MessageType::Work, &payload),
            Err(Error::CouldNotDecodeMessage(MessageType::Work))
        ));
        assert!(matches!(
            Frame::decode(MessageType::CountRequest, &payload),
            Err(Error::CouldNotDecodeMessage(MessageType::CountRequest))
        ));
    }
}
