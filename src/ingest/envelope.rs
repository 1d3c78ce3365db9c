use std::fmt;

use serde::Deserialize;
use serde_json::Value;

use crate::config::Topic;

/// Field of the inner record that holds the text to analyze.
pub const TEXT_FIELD: &str = "reviewText";

#[derive(Debug)]
pub enum DecodeError {
    MalformedEnvelope(serde_json::Error),
    MissingTopic(String),
    TopicNotAString(String),
    MalformedRecord(serde_json::Error),
    RecordNotAnObject,
    MissingText,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::MalformedEnvelope(e) => {
                write!(f, "envelope is not valid JSON: {}", e)
            }
            DecodeError::MissingTopic(topic) => {
                write!(f, "envelope has no {:?} entry", topic)
            }
            DecodeError::TopicNotAString(topic) => {
                write!(f, "envelope entry {:?} is not a string", topic)
            }
            DecodeError::MalformedRecord(e) => {
                write!(f, "inner record is not valid JSON: {}", e)
            }
            DecodeError::RecordNotAnObject => {
                write!(f, "inner record is not a JSON object")
            }
            DecodeError::MissingText => {
                write!(f, "inner record has no {} field", TEXT_FIELD)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

#[derive(Deserialize)]
struct Record {
    #[serde(rename = "reviewText")]
    review_text: Option<String>,
}

/// Extracts the item text from an inbound frame.
///
/// The frame is a JSON object keyed by topic whose value is itself a JSON
/// document encoded as a string:
///
/// ```text
/// {"music": "{\"reviewText\": \"great\", \"overall\": 5.0}"}
/// ```
///
/// Fields other than the text are ignored.
pub fn decode_envelope(frame: &str, topic: &Topic) -> Result<String, DecodeError> {
    let envelope: Value =
        serde_json::from_str(frame).map_err(DecodeError::MalformedEnvelope)?;
    let inner = match envelope.get(topic.as_str()) {
        None | Some(Value::Null) => {
            return Err(DecodeError::MissingTopic(topic.to_string()))
        }
        Some(Value::String(inner)) => inner,
        Some(_) => return Err(DecodeError::TopicNotAString(topic.to_string())),
    };
    // serde would also read a struct out of a JSON array, so insist on an
    // object before deserializing
    let record: Value =
        serde_json::from_str(inner).map_err(DecodeError::MalformedRecord)?;
    if !record.is_object() {
        return Err(DecodeError::RecordNotAnObject);
    }
    let record =
        Record::deserialize(record).map_err(DecodeError::MalformedRecord)?;
    record.review_text.ok_or(DecodeError::MissingText)
}

/// The control frame that subscribes a connection to a topic.
pub fn subscription_frame(topic: &Topic) -> String {
    format!("topic: {}", topic)
}
