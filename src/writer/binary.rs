use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use crate::task::SnapshotPayload;

use super::{snapshot_dir_name, WriterError};

/// Snapshot totals written alongside the shard files.
#[derive(Debug, Serialize)]
struct Summary {
    task_name: String,
    total_flows: usize,
    total_bytes: u64,
    total_packets: u64,
    shards: usize,
    timestamp_iso: String,
}

/// Writes exact snapshots to disk: one binary-encoded file per non-empty
/// shard under `root/<timestamp>/<task>/`, plus a `summary.json`.
#[derive(Debug)]
pub struct BinaryWriter {
    root_path: PathBuf,
    interval: Duration,
}

impl BinaryWriter {
    pub fn new(root_path: &str, interval: Duration) -> Self {
        Self {
            root_path: PathBuf::from(root_path),
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn write(
        &self,
        payload: &SnapshotPayload,
        timestamp: SystemTime,
    ) -> Result<usize, WriterError> {
        let SnapshotPayload::Exact(snapshot) = payload else {
            return Err(WriterError::PayloadMismatch {
                writer: "binary",
                expected: "exact",
                got: payload.kind(),
            });
        };

        if snapshot.is_empty() {
            return Ok(0);
        }

        let task_dir = self
            .root_path
            .join(snapshot_dir_name(timestamp))
            .join(&snapshot.task_name);
        std::fs::create_dir_all(&task_dir)?;

        let mut total_flows = 0usize;
        let mut total_packets = 0u64;
        let mut total_bytes = 0u64;

        for (i, shard) in snapshot.shards.iter().enumerate() {
            if shard.is_empty() {
                continue;
            }

            total_flows += shard.len();
            for flow in shard.values() {
                total_packets += flow.packet_count;
                total_bytes += flow.byte_count;
            }

            let file = File::create(task_dir.join(format!("shard_{i}.dat")))?;
            bincode::serialize_into(BufWriter::new(file), shard)?;
        }

        let summary = Summary {
            task_name: snapshot.task_name.clone(),
            total_flows,
            total_bytes,
            total_packets,
            shards: snapshot.shards.len(),
            timestamp_iso: Utc::now().to_rfc3339(),
        };
        let summary_file = File::create(task_dir.join("summary.json"))?;
        serde_json::to_writer_pretty(BufWriter::new(summary_file), &summary)?;

        debug!(
            task = %snapshot.task_name,
            flows = total_flows,
            dir = %task_dir.display(),
            "wrote binary snapshot",
        );

        Ok(total_flows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use tempfile::tempdir;

    use crate::task::{ExactSnapshot, Flow};

    fn flow(packets: u64, bytes: u64) -> Flow {
        Flow {
            key: "10.0.0.1".to_string(),
            fields: vec!["10.0.0.1".to_string()],
            field_names: vec!["SrcIP".to_string()],
            start_time: SystemTime::UNIX_EPOCH,
            end_time: SystemTime::UNIX_EPOCH,
            packet_count: packets,
            byte_count: bytes,
        }
    }

    fn snapshot() -> ExactSnapshot {
        let mut shard0 = HashMap::new();
        shard0.insert(vec![1u8], flow(3, 300));
        let mut shard2 = HashMap::new();
        shard2.insert(vec![2u8], flow(1, 50));
        ExactSnapshot {
            task_name: "per_src".to_string(),
            shards: vec![shard0, HashMap::new(), shard2],
        }
    }

    #[test]
    fn test_writes_non_empty_shards_and_summary() {
        let dir = tempdir().expect("tempdir");
        let writer = BinaryWriter::new(dir.path().to_str().unwrap(), Duration::from_secs(30));

        let ts = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let rows = writer
            .write(&SnapshotPayload::Exact(snapshot()), ts)
            .expect("write succeeds");
        assert_eq!(rows, 2);

        let task_dir = dir.path().join("2023-11-14_22-13-20").join("per_src");
        assert!(task_dir.join("shard_0.dat").exists());
        assert!(!task_dir.join("shard_1.dat").exists());
        assert!(task_dir.join("shard_2.dat").exists());

        let summary: serde_json::Value = serde_json::from_reader(
            File::open(task_dir.join("summary.json")).expect("summary exists"),
        )
        .expect("valid json");
        assert_eq!(summary["task_name"], "per_src");
        assert_eq!(summary["total_flows"], 2);
        assert_eq!(summary["total_packets"], 4);
        assert_eq!(summary["total_bytes"], 350);
        assert_eq!(summary["shards"], 3);
        assert!(summary["timestamp_iso"].is_string());
    }

    #[test]
    fn test_shard_round_trips_through_bincode() {
        let dir = tempdir().expect("tempdir");
        let writer = BinaryWriter::new(dir.path().to_str().unwrap(), Duration::from_secs(30));
        let ts = SystemTime::UNIX_EPOCH;
        writer
            .write(&SnapshotPayload::Exact(snapshot()), ts)
            .expect("write succeeds");

        let path = dir
            .path()
            .join(snapshot_dir_name(ts))
            .join("per_src")
            .join("shard_0.dat");
        let decoded: HashMap<Vec<u8>, Flow> =
            bincode::deserialize_from(File::open(path).expect("shard file")).expect("decodes");
        assert_eq!(decoded[&vec![1u8]].packet_count, 3);
        assert_eq!(decoded[&vec![1u8]].field_named("SrcIP"), Some("10.0.0.1"));
    }

    #[test]
    fn test_empty_snapshot_is_noop() {
        let dir = tempdir().expect("tempdir");
        let writer = BinaryWriter::new(dir.path().to_str().unwrap(), Duration::from_secs(30));

        let empty = ExactSnapshot {
            task_name: "per_src".to_string(),
            shards: vec![HashMap::new()],
        };
        let rows = writer
            .write(&SnapshotPayload::Exact(empty), SystemTime::UNIX_EPOCH)
            .expect("noop succeeds");
        assert_eq!(rows, 0);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_rejects_heavy_payload() {
        let dir = tempdir().expect("tempdir");
        let writer = BinaryWriter::new(dir.path().to_str().unwrap(), Duration::from_secs(30));
        let err = writer
            .write(
                &SnapshotPayload::Heavy(crate::sketch::HeavyRecord::default()),
                SystemTime::UNIX_EPOCH,
            )
            .unwrap_err();
        assert!(matches!(err, WriterError::PayloadMismatch { .. }));
    }
}
