use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::{Config, WriterDef};
use crate::task::{ExactTask, SketchTask, Task};
use crate::writer::{BinaryWriter, FlowMetricsWriter, HeavyHittersWriter, TextWriter, Writer};

/// One aggregator group: its tasks and the writers persisting their
/// snapshots.
#[derive(Debug)]
pub struct TaskGroup {
    pub kind: &'static str,
    pub tasks: Vec<Arc<Task>>,
    pub writers: Vec<Writer>,
}

type Builder = fn(&Config) -> Result<TaskGroup>;

/// Write-once mapping from aggregator kind to group builder. Constructed
/// explicitly before the Manager and frozen thereafter.
pub struct Registry {
    builders: HashMap<&'static str, Builder>,
}

impl Registry {
    /// Registers the built-in aggregator kinds.
    pub fn builtin() -> Self {
        let mut builders: HashMap<&'static str, Builder> = HashMap::new();
        builders.insert("exact", build_exact_group);
        builders.insert("sketch", build_sketch_group);
        Self { builders }
    }

    /// Builds one group per configured aggregator kind. An unknown kind is a
    /// fatal configuration error.
    pub fn create(&self, cfg: &Config) -> Result<Vec<TaskGroup>> {
        let mut groups = Vec::with_capacity(cfg.aggregator.types.len());

        for kind in &cfg.aggregator.types {
            let builder = self
                .builders
                .get(kind.as_str())
                .with_context(|| format!("unknown aggregator type: '{kind}'"))?;

            let group =
                builder(cfg).with_context(|| format!("creating aggregator type '{kind}'"))?;

            info!(
                kind = %kind,
                tasks = group.tasks.len(),
                writers = group.writers.len(),
                "aggregator group created",
            );
            groups.push(group);
        }

        Ok(groups)
    }
}

fn build_exact_group(cfg: &Config) -> Result<TaskGroup> {
    let mut tasks = Vec::with_capacity(cfg.aggregator.exact.tasks.len());
    for def in &cfg.aggregator.exact.tasks {
        let task = ExactTask::new(&def.name, &def.key_fields, def.num_shards)
            .with_context(|| format!("creating exact task '{}'", def.name))?;
        tasks.push(Arc::new(Task::Exact(task)));
    }

    Ok(TaskGroup {
        kind: "exact",
        tasks,
        writers: build_writers(&cfg.aggregator.exact.writers, "exact"),
    })
}

fn build_sketch_group(cfg: &Config) -> Result<TaskGroup> {
    let mut tasks = Vec::with_capacity(cfg.aggregator.sketch.tasks.len());
    for def in &cfg.aggregator.sketch.tasks {
        let task = SketchTask::new(def)?;
        tasks.push(Arc::new(Task::Sketch(task)));
    }

    Ok(TaskGroup {
        kind: "sketch",
        tasks,
        writers: build_writers(&cfg.aggregator.sketch.writers, "sketch"),
    })
}

/// Builds the enabled writers of a group. Disabled entries, unknown writer
/// types, and zero intervals are skipped with a warning, never fatal.
fn build_writers(defs: &[WriterDef], group: &'static str) -> Vec<Writer> {
    let mut writers = Vec::with_capacity(defs.len());

    for def in defs {
        if !def.enabled {
            continue;
        }

        if def.snapshot_interval.is_zero() {
            warn!(
                group,
                writer = %def.kind,
                "zero snapshot_interval, skipping writer",
            );
            continue;
        }

        let writer = match (group, def.kind.as_str()) {
            ("exact", "clickhouse") => {
                Writer::FlowMetrics(FlowMetricsWriter::new(&def.clickhouse, def.snapshot_interval))
            }
            ("sketch", "clickhouse") => Writer::HeavyHitters(HeavyHittersWriter::new(
                &def.clickhouse,
                def.snapshot_interval,
            )),
            ("exact", "binary") => {
                Writer::Binary(BinaryWriter::new(&def.root_path, def.snapshot_interval))
            }
            ("sketch", "text") => {
                Writer::Text(TextWriter::new(&def.root_path, def.snapshot_interval))
            }
            _ => {
                warn!(
                    group,
                    writer = %def.kind,
                    "unknown writer type for this aggregator, skipping",
                );
                continue;
            }
        };

        info!(
            group,
            writer = writer.name(),
            interval = ?def.snapshot_interval,
            "writer created",
        );
        writers.push(writer);
    }

    writers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Config {
        let cfg: Config = serde_yaml::from_str(yaml).expect("parses");
        cfg.validate().expect("valid");
        cfg
    }

    #[test]
    fn test_creates_groups_in_config_order() {
        let cfg = parse(
            r#"
aggregator:
  types: [exact, sketch]
  period: 1m
  exact:
    tasks:
      - name: per_src
        key_fields: [SrcIP]
  sketch:
    tasks:
      - name: hh
        skt_type: 0
        flow_fields: [SrcIP]
        width: 64
        depth: 2
"#,
        );

        let groups = Registry::builtin().create(&cfg).expect("creates");
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].kind, "exact");
        assert_eq!(groups[0].tasks[0].name(), "per_src");
        assert_eq!(groups[1].kind, "sketch");
        assert_eq!(groups[1].tasks[0].name(), "hh");
    }

    #[test]
    fn test_unknown_kind_is_fatal() {
        let cfg = parse(
            r#"
aggregator:
  types: [streaming]
  period: 1m
"#,
        );
        let err = Registry::builtin().create(&cfg).unwrap_err();
        assert!(format!("{err:#}").contains("unknown aggregator type"));
    }

    #[test]
    fn test_unknown_key_field_is_fatal() {
        let cfg = parse(
            r#"
aggregator:
  types: [exact]
  period: 1m
  exact:
    tasks:
      - name: per_src
        key_fields: [TTL]
"#,
        );
        assert!(Registry::builtin().create(&cfg).is_err());
    }

    #[test]
    fn test_disabled_and_unknown_writers_skipped() {
        let cfg = parse(
            r#"
aggregator:
  types: [exact]
  period: 1m
  exact:
    writers:
      - type: binary
        enabled: false
        root_path: /tmp/ns
      - type: text
        enabled: true
        root_path: /tmp/ns
      - type: binary
        enabled: true
        root_path: /tmp/ns
    tasks:
      - name: per_src
        key_fields: [SrcIP]
"#,
        );

        let groups = Registry::builtin().create(&cfg).expect("creates");
        // Disabled binary and exact-group text both skipped.
        assert_eq!(groups[0].writers.len(), 1);
        assert_eq!(groups[0].writers[0].name(), "binary");
    }
}
