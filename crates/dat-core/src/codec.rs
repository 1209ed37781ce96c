//! Newline-delimited JSON framing.
//!
//! Decoding is forgiving: a line that is not JSON, or that
//! names a known `type` without the matching payload, is dropped. A JSON
//! object whose `type` this version does not know is handed back untouched
//! so a stage can forward it downstream.

use serde_json::Value;

use crate::error::Result;
use crate::protocol::{DatMessage, MessageType};

/// One decoded input line.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Message(DatMessage),
    /// Well-formed JSON with an unrecognized `type`; forward as-is.
    Unrecognized(Value),
}

/// Decode a single line. Returns `None` for lines that should be skipped.
pub fn decode_line(line: &str) -> Option<Incoming> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let value: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "skipping non-JSON line");
            return None;
        }
    };

    let kind = value.get("type").and_then(Value::as_str);
    match kind.and_then(MessageType::from_wire) {
        Some(_) => match serde_json::from_value::<DatMessage>(value) {
            Ok(msg) => match msg.validate() {
                Ok(()) => Some(Incoming::Message(msg)),
                Err(e) => {
                    tracing::debug!(error = %e, "skipping envelope");
                    None
                }
            },
            Err(e) => {
                tracing::debug!(error = %e, "skipping undecodable envelope");
                None
            }
        },
        None if value.is_object() && kind.is_some() => Some(Incoming::Unrecognized(value)),
        None => {
            tracing::debug!("skipping line without a message type");
            None
        }
    }
}

/// Encode a message as one line, newline included.
pub fn encode_line(msg: &DatMessage) -> Result<String> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

/// Encode a pass-through value as one line, newline included.
pub fn encode_value(value: &Value) -> Result<String> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    Ok(line)
}

impl Incoming {
    pub fn encode(&self) -> Result<String> {
        match self {
            Incoming::Message(msg) => encode_line(msg),
            Incoming::Unrecognized(value) => encode_value(value),
        }
    }
}
