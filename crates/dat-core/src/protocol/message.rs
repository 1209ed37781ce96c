use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::catalog::{DatCatalog, WriteSyncMode};
use super::record::{now_millis, DatDocumentMessage};
use super::state::DatStateMessage;
use crate::error::{DatError, Result};

/// The `type` discriminator of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Record,
    State,
    Log,
    Spec,
    ConnectionStatus,
    Catalog,
    Trace,
}

impl MessageType {
    pub const ALL: [MessageType; 7] = [
        Self::Record,
        Self::State,
        Self::Log,
        Self::Spec,
        Self::ConnectionStatus,
        Self::Catalog,
        Self::Trace,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Record => "RECORD",
            Self::State => "STATE",
            Self::Log => "LOG",
            Self::Spec => "SPEC",
            Self::ConnectionStatus => "CONNECTION_STATUS",
            Self::Catalog => "CATALOG",
            Self::Trace => "TRACE",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Fatal,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatLogMessage {
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatConnectionStatus {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TraceType {
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatErrorTrace {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_message: Option<String>,
}

/// A `TRACE` payload: a structured report of a failure that ended a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatTraceMessage {
    #[serde(rename = "type")]
    pub trace_type: TraceType,
    pub emitted_at: i64,
    pub error: DatErrorTrace,
}

/// Describes a connector and the configuration it expects.
///
/// The same shape is used for the `SPEC` payload and for the configuration
/// file handed to every command: `connection_specification` carries the
/// connector-specific settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorSpecification {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation_url: Option<String>,
    #[serde(default)]
    pub supports_incremental: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supported_destination_sync_modes: Vec<WriteSyncMode>,
    #[serde(
        rename = "connectionSpecification",
        alias = "connection_specification",
        default
    )]
    pub connection_specification: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConnectorSpecification {
    pub fn new(name: impl Into<String>, connection_specification: Value) -> Self {
        Self {
            name: name.into(),
            protocol_version: None,
            documentation_url: None,
            supports_incremental: false,
            supported_destination_sync_modes: Vec::new(),
            connection_specification,
            extra: Map::new(),
        }
    }

    /// Read one connector setting.
    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.connection_specification.get(key)
    }

    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.setting(key).and_then(Value::as_str)
    }

    /// Read a required string setting.
    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.setting_str(key).ok_or_else(|| {
            DatError::Configuration(format!(
                "connector '{}' requires connectionSpecification.{}",
                self.name, key
            ))
        })
    }
}

/// One line of the wire protocol.
///
/// Exactly one payload is populated and it matches `kind`; constructors
/// guarantee that, and [`DatMessage::validate`] checks decoded input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<DatDocumentMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<DatStateMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<DatLogMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<ConnectorSpecification>,
    #[serde(
        rename = "connectionStatus",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub connection_status: Option<DatConnectionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog: Option<DatCatalog>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<DatTraceMessage>,
}

impl DatMessage {
    fn empty(kind: MessageType) -> Self {
        Self {
            kind,
            record: None,
            state: None,
            log: None,
            spec: None,
            connection_status: None,
            catalog: None,
            trace: None,
        }
    }

    pub fn record(record: DatDocumentMessage) -> Self {
        Self {
            record: Some(record),
            ..Self::empty(MessageType::Record)
        }
    }

    pub fn state(state: DatStateMessage) -> Self {
        Self {
            state: Some(state),
            ..Self::empty(MessageType::State)
        }
    }

    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            log: Some(DatLogMessage {
                level,
                message: message.into(),
            }),
            ..Self::empty(MessageType::Log)
        }
    }

    pub fn spec(spec: ConnectorSpecification) -> Self {
        Self {
            spec: Some(spec),
            ..Self::empty(MessageType::Spec)
        }
    }

    pub fn connection_status(status: DatConnectionStatus) -> Self {
        Self {
            connection_status: Some(status),
            ..Self::empty(MessageType::ConnectionStatus)
        }
    }

    pub fn catalog(catalog: DatCatalog) -> Self {
        Self {
            catalog: Some(catalog),
            ..Self::empty(MessageType::Catalog)
        }
    }

    /// An error trace for a failure, optionally attributed to a stream.
    pub fn trace(message: impl Into<String>, stream: Option<String>, internal: Option<String>) -> Self {
        Self {
            trace: Some(DatTraceMessage {
                trace_type: TraceType::Error,
                emitted_at: now_millis(),
                error: DatErrorTrace {
                    message: message.into(),
                    stream,
                    internal_message: internal,
                },
            }),
            ..Self::empty(MessageType::Trace)
        }
    }

    /// Check that the payload named by `kind` is present.
    ///
    /// Other payload fields are ignored: consumers never infer the type
    /// from which fields happen to be set.
    pub fn validate(&self) -> Result<()> {
        let present = match self.kind {
            MessageType::Record => self.record.is_some(),
            MessageType::State => self.state.is_some(),
            MessageType::Log => self.log.is_some(),
            MessageType::Spec => self.spec.is_some(),
            MessageType::ConnectionStatus => self.connection_status.is_some(),
            MessageType::Catalog => self.catalog.is_some(),
            MessageType::Trace => self.trace.is_some(),
        };
        if present {
            Ok(())
        } else {
            Err(DatError::MalformedInput(format!(
                "{} envelope has no matching payload",
                self.kind.as_str()
            )))
        }
    }

    /// The record payload, only when this is a `RECORD` envelope.
    pub fn as_record(&self) -> Option<&DatDocumentMessage> {
        match self.kind {
            MessageType::Record => self.record.as_ref(),
            _ => None,
        }
    }

    pub fn as_state(&self) -> Option<&DatStateMessage> {
        match self.kind {
            MessageType::State => self.state.as_ref(),
            _ => None,
        }
    }

    pub fn as_log(&self) -> Option<&DatLogMessage> {
        match self.kind {
            MessageType::Log => self.log.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Data, DatDocumentStream, StreamMetadata};
    use serde_json::json;

    #[test]
    fn payload_field_names_match_the_wire() {
        let msg = DatMessage::connection_status(DatConnectionStatus {
            status: Status::Failed,
            message: Some("refused".into()),
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            json!({
                "type": "CONNECTION_STATUS",
                "connectionStatus": {"status": "FAILED", "message": "refused"}
            })
        );
    }

    #[test]
    fn only_the_matching_payload_is_serialized() {
        let record = DatDocumentMessage::new(
            DatDocumentStream::new("files"),
            Data::new("hi", StreamMetadata::default()),
        );
        let json = serde_json::to_value(DatMessage::record(record)).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert_eq!(obj["type"], "RECORD");
        assert!(obj.contains_key("record"));
    }

    #[test]
    fn validate_rejects_missing_payload() {
        let msg: DatMessage = serde_json::from_value(json!({
            "type": "STATE",
            "log": {"level": "INFO", "message": "not a state"}
        }))
        .unwrap();
        assert!(matches!(msg.validate(), Err(DatError::MalformedInput(_))));
        assert!(msg.as_state().is_none());
        assert!(msg.as_log().is_none());
    }

    #[test]
    fn spec_reads_camel_case_and_keeps_extras() {
        let spec: ConnectorSpecification = serde_json::from_value(json!({
            "name": "sqlite",
            "connectionSpecification": {"path": "out.db"},
            "module_version": "1.2"
        }))
        .unwrap();
        assert_eq!(spec.require_str("path").unwrap(), "out.db");
        assert!(spec.require_str("table").is_err());
        assert_eq!(spec.extra["module_version"], "1.2");

        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["connectionSpecification"]["path"], "out.db");
    }

    #[test]
    fn message_type_round_trips_through_wire_names() {
        for kind in MessageType::ALL {
            assert_eq!(MessageType::from_wire(kind.as_str()), Some(kind));
        }
        assert_eq!(MessageType::from_wire("HEARTBEAT"), None);
    }
}
