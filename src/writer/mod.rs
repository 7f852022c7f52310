pub mod binary;
pub mod clickhouse;
pub mod text;

pub use binary::BinaryWriter;
pub use clickhouse::{FlowMetricsWriter, HeavyHittersWriter};
pub use text::TextWriter;

use std::time::{Duration, SystemTime};

use thiserror::Error;

use crate::task::{FieldDescriptor, SnapshotPayload};

/// Errors surfaced by writers. They are logged by the snapshotter and never
/// propagate into the packet path.
#[derive(Debug, Error)]
pub enum WriterError {
    #[error("{writer} writer got a {got} payload, expected {expected}")]
    PayloadMismatch {
        writer: &'static str,
        expected: &'static str,
        got: &'static str,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("clickhouse: {0}")]
    ClickHouse(#[from] clickhouse_rs::errors::Error),

    #[error("encoding shard: {0}")]
    Encode(#[from] bincode::Error),

    #[error("encoding summary: {0}")]
    Json(#[from] serde_json::Error),
}

/// Output channels for snapshots. Each writer runs on its own cadence,
/// driven by a dedicated snapshotter that serializes its writes.
#[derive(Debug)]
pub enum Writer {
    FlowMetrics(FlowMetricsWriter),
    HeavyHitters(HeavyHittersWriter),
    Binary(BinaryWriter),
    Text(TextWriter),
}

impl Writer {
    /// Writer name for logging and health labels.
    pub fn name(&self) -> &'static str {
        match self {
            Self::FlowMetrics(_) => "clickhouse_flow_metrics",
            Self::HeavyHitters(_) => "clickhouse_heavy_hitters",
            Self::Binary(_) => "binary",
            Self::Text(_) => "text",
        }
    }

    /// Snapshot cadence of this writer.
    pub fn interval(&self) -> Duration {
        match self {
            Self::FlowMetrics(w) => w.interval(),
            Self::HeavyHitters(w) => w.interval(),
            Self::Binary(w) => w.interval(),
            Self::Text(w) => w.interval(),
        }
    }

    /// One-time initialization (connectivity check, table DDL). Failures are
    /// non-fatal: the snapshotter logs and keeps the writer, later writes
    /// retry.
    pub async fn start(&self) -> Result<(), WriterError> {
        match self {
            Self::FlowMetrics(w) => w.start().await,
            Self::HeavyHitters(w) => w.start().await,
            Self::Binary(_) | Self::Text(_) => Ok(()),
        }
    }

    /// Persists one task's snapshot. Returns the number of rows or entries
    /// written; empty payloads are a no-op.
    pub async fn write(
        &self,
        payload: &SnapshotPayload,
        timestamp: SystemTime,
        task_name: &str,
        descriptor: &FieldDescriptor,
    ) -> Result<usize, WriterError> {
        match self {
            Self::FlowMetrics(w) => w.write(payload, timestamp).await,
            Self::HeavyHitters(w) => w.write(payload, timestamp, task_name, descriptor).await,
            Self::Binary(w) => w.write(payload, timestamp),
            Self::Text(w) => w.write(payload, timestamp, task_name, descriptor),
        }
    }
}

/// Directory-name form of a snapshot timestamp, shared by the file writers.
pub(crate) fn snapshot_dir_name(timestamp: SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(timestamp)
        .format("%Y-%m-%d_%H-%M-%S")
        .to_string()
}
