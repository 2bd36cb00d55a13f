// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors returned by the buffering engine to producers and to the task driving its consumer loop
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("Buffer is shutting down")]
    ShuttingDown,

    #[error("Buffer consumer has stopped")]
    Closed,

    #[error("Flush handler failed: {0}")]
    Flush(#[from] FlushError),
}

/// Error a flush handler reports for one batch.
///
/// `Fatal` always stops the consumer loop. `Transient` stops it only when the engine is
/// configured with [`crate::buffer::FlushErrorPolicy::Terminate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlushError {
    #[error("Transient flush failure: {0}")]
    Transient(String),

    #[error("Fatal flush failure: {0}")]
    Fatal(String),
}

impl FlushError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, FlushError::Fatal(_))
    }
}

/// Errors raised by an egress sink when a whole batch could not be written
#[derive(Debug, thiserror::Error)]
pub enum EgressError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Sink responded with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to serialize log document: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid egress configuration: {0}")]
    Configuration(String),

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),
}

impl EgressError {
    /// True when the sink can never succeed without operator action, e.g. the client could
    /// not be built from its configuration or the sink rejects the request as malformed.
    pub fn is_fatal(&self) -> bool {
        match self {
            EgressError::Configuration(_) => true,
            // 404 means the target data stream does not exist, 401/403 mean credentials are wrong
            EgressError::Status { status, .. } => matches!(status, 401 | 403 | 404),
            _ => false,
        }
    }
}

impl From<EgressError> for FlushError {
    fn from(err: EgressError) -> Self {
        if err.is_fatal() {
            FlushError::Fatal(err.to_string())
        } else {
            FlushError::Transient(err.to_string())
        }
    }
}

/// Raised when an OTLP request body cannot be parsed
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Malformed OTLP logs payload: {0}")]
    Protobuf(#[from] prost::DecodeError),
}

/// Errors surfaced to the ingest endpoint for one inbound request
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Unsupported content type: {0}")]
    UnsupportedMediaType(String),

    #[error("Request body exceeds the maximum of {limit} bytes")]
    CapacityExceeded { limit: usize },

    #[error("Egress failed for every log group: {0}")]
    Egress(#[from] EgressError),

    #[error("Ingestion is shutting down")]
    ShuttingDown,
}

/// Errors raised while loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
