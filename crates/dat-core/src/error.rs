//! Error types for the sync engine.

/// Errors produced by the protocol and sync engine.
///
/// The first four variants are the protocol's error classes; the rest wrap
/// failures raised by connector collaborators so callers can tell which
/// boundary failed.
#[derive(Debug, thiserror::Error)]
pub enum DatError {
    /// Fatal: an envelope or catalog references a stream the run does not
    /// know, or a stream is configured inconsistently.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A connectivity check failed. Reported as a `CONNECTION_STATUS`
    /// envelope rather than raised by the CLI.
    #[error("connection error: {0}")]
    Connection(String),

    /// A line could not be decoded as an envelope.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// Retryable transport failure at the loader or stream boundary.
    #[error("transient i/o error: {0}")]
    Transient(String),

    /// A stream's record sequence failed; the read is aborted.
    #[error("stream '{stream}' failed: {source}")]
    Stream {
        stream: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("loader error: {0}")]
    Loader(#[source] anyhow::Error),

    #[error("generator error: {0}")]
    Generator(#[source] anyhow::Error),

    #[error("state error: {0}")]
    State(#[source] anyhow::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, DatError>;

impl DatError {
    /// Returns `true` for failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Loader(e) | Self::Generator(e) | Self::Stream { source: e, .. } => {
                is_transient(e)
            }
            _ => false,
        }
    }
}

/// Walk an error chain looking for a [`DatError::Transient`] marker.
///
/// Connectors signal a retryable failure by returning
/// `DatError::Transient(..)` converted into `anyhow::Error`; any context
/// added on top does not hide it.
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<DatError>(),
            Some(DatError::Transient(_))
        )
    })
}
