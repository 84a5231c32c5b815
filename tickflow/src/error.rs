use crate::model::InstrumentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Non-fatal, per-tick data problems. These are logged, counted and skipped; they never halt
/// the pipeline and never block other instruments.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataError {
    #[error(
        "DataGap: {instrument} tick at {received} precedes last processed tick at {last}"
    )]
    DataGap {
        instrument: InstrumentId,
        last: DateTime<Utc>,
        received: DateTime<Utc>,
    },

    #[error("unknown instrument dropped at ingestion: {0}")]
    UnknownInstrument(InstrumentId),

    #[error(
        "insufficient history for {indicator}: requires {required} closed bars, have {available}"
    )]
    InsufficientHistory {
        indicator: &'static str,
        required: usize,
        available: usize,
    },

    #[error("large trade threshold unavailable for {0}")]
    ThresholdUnavailable(InstrumentId),

    #[error("failed to decode tick: {0}")]
    Decode(String),
}

impl DataError {
    /// Data errors only ever affect the tick or indicator they were raised for.
    pub fn is_fatal(&self) -> bool {
        false
    }
}

/// Errors generated by a bar or signal sink.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Error)]
pub enum SinkError {
    #[error("sink io error: {0}")]
    Io(String),

    #[error("sink serialisation error: {0}")]
    Serde(String),

    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

impl SinkError {
    /// Determine if a failed write is worth retrying.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_transient(&self) -> bool {
        match self {
            SinkError::Serde(_) => false,
            _ => true,
        }
    }
}

impl From<std::io::Error> for SinkError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<serde_json::Error> for SinkError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serde(value.to_string())
    }
}

/// Fatal pipeline conditions requiring operator intervention.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum PipelineError {
    #[error("failed to construct {stage} channel: {reason}")]
    ChannelConstruction { stage: &'static str, reason: String },

    #[error("{sink} sink unavailable after {attempts} attempts: {source}")]
    SinkUnavailable {
        sink: &'static str,
        attempts: u32,
        source: SinkError,
    },

    #[error("tick source failed: {0}")]
    SourceFailed(String),

    #[error("{0} task panicked or was aborted")]
    WorkerPanicked(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}
