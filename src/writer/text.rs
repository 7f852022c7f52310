use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tracing::debug;

use crate::sketch::HeavyEntry;
use crate::task::{FieldDescriptor, SnapshotPayload};

use super::{snapshot_dir_name, WriterError};

/// Writes sketch snapshots as plain text: `count_hh.txt` and `size_hh.txt`
/// under `root/<timestamp>/<task>/`, one `<decoded-flow> <value>` line per
/// heavy hitter.
#[derive(Debug)]
pub struct TextWriter {
    root_path: PathBuf,
    interval: Duration,
}

impl TextWriter {
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
        task_name: &str,
        descriptor: &FieldDescriptor,
    ) -> Result<usize, WriterError> {
        let SnapshotPayload::Heavy(record) = payload else {
            return Err(WriterError::PayloadMismatch {
                writer: "text",
                expected: "heavy",
                got: payload.kind(),
            });
        };

        if record.is_empty() {
            return Ok(0);
        }

        let task_dir = self
            .root_path
            .join(snapshot_dir_name(timestamp))
            .join(task_name);
        std::fs::create_dir_all(&task_dir)?;

        let mut total = 0usize;
        total += write_entries(&task_dir.join("size_hh.txt"), &record.size, descriptor)?;
        total += write_entries(&task_dir.join("count_hh.txt"), &record.count, descriptor)?;

        debug!(task = task_name, entries = total, dir = %task_dir.display(), "wrote heavy hitters");

        Ok(total)
    }
}

fn write_entries(
    path: &std::path::Path,
    entries: &[HeavyEntry],
    descriptor: &FieldDescriptor,
) -> Result<usize, WriterError> {
    let mut out = BufWriter::new(File::create(path)?);
    for entry in entries {
        writeln!(out, "{} {}", descriptor.decode(&entry.flow), entry.value)?;
    }
    out.flush()?;
    Ok(entries.len())
}
