mod envelope;
mod stream;

pub use envelope::{decode_envelope, subscription_frame, DecodeError, TEXT_FIELD};
pub use stream::StreamIngestor;

/// A decoded item. Its content is its identity for deduplication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Position in the inbound stream among successfully decoded frames.
    pub seq: u64,
    pub text: String,
}
