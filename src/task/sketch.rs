use std::cell::RefCell;
use std::fmt::Write;

use anyhow::{bail, Result};
use tracing::debug;

use crate::codec::{FieldCodec, MAX_KEY_LEN};
use crate::config::{AlerterRule, SketchTaskDef};
use crate::model::PacketInfo;
use crate::sketch::{CountMinSketch, HeavyEntry, HeavyRecord, Sketch, SuperSpreaderSketch};

use super::{check, FieldDescriptor};

thread_local! {
    // Scratch key buffers for the hot path; acquired per process() call and
    // released before it returns on every path.
    static KEY_BUFS: RefCell<([u8; MAX_KEY_LEN], [u8; MAX_KEY_LEN])> =
        const { RefCell::new(([0; MAX_KEY_LEN], [0; MAX_KEY_LEN])) };
}

/// Binds a sketch to the task surface: owns the flow and element codecs and
/// delegates processing, snapshots, and alert evaluation to the sketch.
#[derive(Debug)]
pub struct SketchTask {
    name: String,
    flow_codec: FieldCodec,
    elem_codec: Option<FieldCodec>,
    sketch: Sketch,
}

impl SketchTask {
    pub fn new(cfg: &SketchTaskDef) -> Result<Self> {
        let flow_codec = FieldCodec::new(&cfg.flow_fields)?;
        let elem_codec = if cfg.element_fields.is_empty() {
            None
        } else {
            Some(FieldCodec::new(&cfg.element_fields)?)
        };
        let fp_len = flow_codec.key_len();

        let sketch = match cfg.skt_type {
            0 => {
                debug!(
                    task = %cfg.name,
                    width = cfg.width,
                    depth = cfg.depth,
                    size_threshold = cfg.size_threshold,
                    count_threshold = cfg.count_threshold,
                    fp_len,
                    "creating count-min sketch task",
                );
                Sketch::CountMin(CountMinSketch::new(
                    cfg.width,
                    cfg.depth,
                    cfg.size_threshold,
                    cfg.count_threshold,
                    fp_len,
                ))
            }
            1 => {
                if elem_codec.is_none() {
                    bail!("sketch task '{}': super-spreader requires element_fields", cfg.name);
                }
                debug!(
                    task = %cfg.name,
                    width = cfg.width,
                    depth = cfg.depth,
                    threshold = cfg.count_threshold,
                    m = cfg.m,
                    register_bits = cfg.size,
                    "creating super-spreader sketch task",
                );
                Sketch::SuperSpreader(SuperSpreaderSketch::new(
                    cfg.width,
                    cfg.depth,
                    cfg.count_threshold,
                    cfg.m,
                    cfg.size,
                    cfg.base,
                    cfg.b,
                    fp_len,
                ))
            }
            other => bail!("unknown sketch type {other} for task '{}'", cfg.name),
        };

        Ok(Self {
            name: cfg.name.clone(),
            flow_codec,
            elem_codec,
            sketch,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_descriptor(&self) -> FieldDescriptor {
        FieldDescriptor::new(self.flow_codec.clone())
    }

    /// Encodes the flow and element keys into per-thread scratch buffers and
    /// inserts into the sketch.
    pub fn process(&self, packet: &PacketInfo) {
        KEY_BUFS.with(|bufs| {
            let mut bufs = bufs.borrow_mut();
            let (flow_buf, elem_buf) = &mut *bufs;

            let flow_len = self.flow_codec.encode(&packet.five_tuple, flow_buf);
            let elem_len = match &self.elem_codec {
                Some(codec) => codec.encode(&packet.five_tuple, elem_buf),
                None => 0,
            };

            self.sketch.insert(
                &flow_buf[..flow_len],
                &elem_buf[..elem_len],
                packet.length,
            );
        });
    }

    /// Point estimate for an encoded flow key (Count-Min packs count and
    /// size into one word; SuperSpreader returns the spread).
    pub fn query(&self, flow: &[u8]) -> u64 {
        self.sketch.query(flow)
    }

    pub fn snapshot(&self) -> HeavyRecord {
        self.sketch.heavy_hitters()
    }

    pub fn reset(&self) {
        self.sketch.reset();
    }

    /// Evaluates heavy-hitter rules against a fresh snapshot; each triggered
    /// rule renders an HTML table of its triggering items.
    pub fn alert_message(&self, rules: &[AlerterRule]) -> String {
        let record = self.snapshot();
        let mut triggered = Vec::new();

        for rule in rules {
            if rule.task_name != self.name {
                continue;
            }

            let rows = match rule.metric.as_str() {
                "heavy_hitter_count" => self.triggering_rows(&record.count, rule, ""),
                "heavy_hitter_size" => self.triggering_rows(&record.size, rule, " bytes"),
                "super_spreader_spread" if record.is_spread => {
                    self.triggering_rows(&record.count, rule, "")
                }
                _ => Vec::new(),
            };

            if rows.is_empty() {
                continue;
            }

            let mut msg = String::new();
            let _ = write!(
                msg,
                "<h3>Alert: {}</h3>\
                 <ul>\
                 <li><b>Task:</b> <code>{}</code></li>\
                 <li><b>Metric:</b> <code>{}</code></li>\
                 <li><b>Condition:</b> <code>{} {:.2}</code></li>\
                 </ul>\
                 <p><b>Triggering Items:</b></p>\
                 <table border=\"1\" cellpadding=\"5\" cellspacing=\"0\">\
                 <tr><th>Flow/Source</th><th>Value</th></tr>{}</table>",
                rule.name,
                rule.task_name,
                rule.metric,
                rule.operator,
                rule.threshold,
                rows.join(""),
            );
            triggered.push(msg);
        }

        triggered.join("<br><hr><br>")
    }

    fn triggering_rows(&self, entries: &[HeavyEntry], rule: &AlerterRule, unit: &str) -> Vec<String> {
        entries
            .iter()
            .filter(|e| check(f64::from(e.value), rule.threshold, &rule.operator))
            .map(|e| {
                format!(
                    "<tr><td><code>{}</code></td><td>{}{}</td></tr>",
                    self.flow_codec.decode(&e.flow),
                    e.value,
                    unit,
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{normalize_addr, FiveTuple};
    use std::time::SystemTime;

    fn def(skt_type: u8) -> SketchTaskDef {
        SketchTaskDef {
            name: "per_src".to_string(),
            skt_type,
            flow_fields: vec!["SrcIP".to_string()],
            element_fields: vec!["DstIP".to_string()],
            width: 1024,
            depth: 3,
            size_threshold: 1,
            count_threshold: 5,
            m: 128,
            size: 5,
            base: 0.5,
            b: 1.08,
        }
    }

    fn packet(src: [u8; 4], dst: [u8; 4], len: u32) -> PacketInfo {
        PacketInfo {
            timestamp: SystemTime::UNIX_EPOCH,
            five_tuple: FiveTuple {
                src_ip: normalize_addr(&src).unwrap(),
                dst_ip: normalize_addr(&dst).unwrap(),
                src_port: 1000,
                dst_port: 53,
                protocol: 17,
            },
            length: len,
        }
    }

    fn rule(metric: &str, threshold: f64) -> AlerterRule {
        AlerterRule {
            name: format!("{metric} rule"),
            task_name: "per_src".to_string(),
            metric: metric.to_string(),
            operator: ">=".to_string(),
            threshold,
        }
    }

    #[test]
    fn test_count_min_task_counts_per_flow_key() {
        let task = SketchTask::new(&def(0)).expect("valid task");
        for _ in 0..10 {
            task.process(&packet([10, 0, 0, 1], [8, 8, 8, 8], 100));
        }

        let codec = FieldCodec::new(&["SrcIP".to_string()]).unwrap();
        let key = codec.encode_vec(&packet([10, 0, 0, 1], [8, 8, 8, 8], 0).five_tuple);
        let est = task.query(&key);
        assert_eq!(est >> 32, 10);
        assert_eq!(est & 0xffff_ffff, 1000);
    }

    #[test]
    fn test_snapshot_decodes_to_source_address() {
        let task = SketchTask::new(&def(0)).expect("valid task");
        for _ in 0..10 {
            task.process(&packet([1, 1, 1, 1], [8, 8, 8, 8], 64));
        }

        let record = task.snapshot();
        assert!(!record.count.is_empty());
        let decoded = task.field_descriptor().decode(&record.count[0].flow);
        assert_eq!(decoded, "1.1.1.1");
    }

    #[test]
    fn test_super_spreader_requires_elements() {
        let mut cfg = def(1);
        cfg.element_fields.clear();
        assert!(SketchTask::new(&cfg).is_err());
    }

    #[test]
    fn test_unknown_sketch_type_is_error() {
        assert!(SketchTask::new(&def(9)).is_err());
    }

    #[test]
    fn test_alert_message_count_axis() {
        let task = SketchTask::new(&def(0)).expect("valid task");
        for _ in 0..50 {
            task.process(&packet([9, 9, 9, 9], [8, 8, 8, 8], 64));
        }

        let msg = task.alert_message(&[rule("heavy_hitter_count", 10.0)]);
        assert!(msg.contains("<h3>Alert: heavy_hitter_count rule</h3>"));
        assert!(msg.contains("<code>9.9.9.9</code>"));
        assert!(msg.contains("<table"));
    }

    #[test]
    fn test_alert_message_quiet_when_below_threshold() {
        let task = SketchTask::new(&def(0)).expect("valid task");
        for _ in 0..50 {
            task.process(&packet([9, 9, 9, 9], [8, 8, 8, 8], 64));
        }
        assert!(task
            .alert_message(&[rule("heavy_hitter_count", 1_000_000.0)])
            .is_empty());
    }

    #[test]
    fn test_spread_metric_only_matches_spreader_records() {
        // Count-Min snapshots carry a size axis, so the spread metric must
        // not fire on them.
        let task = SketchTask::new(&def(0)).expect("valid task");
        for _ in 0..50 {
            task.process(&packet([9, 9, 9, 9], [8, 8, 8, 8], 64));
        }
        assert!(task
            .alert_message(&[rule("super_spreader_spread", 1.0)])
            .is_empty());

        let spreader = SketchTask::new(&def(1)).expect("valid task");
        for i in 0..200u8 {
            spreader.process(&packet([9, 9, 9, 9], [10, 0, 0, i], 64));
        }
        let msg = spreader.alert_message(&[rule("super_spreader_spread", 5.0)]);
        assert!(msg.contains("super_spreader_spread rule"));
    }

    #[test]
    fn test_reset_clears_sketch() {
        let task = SketchTask::new(&def(0)).expect("valid task");
        for _ in 0..50 {
            task.process(&packet([9, 9, 9, 9], [8, 8, 8, 8], 64));
        }
        task.reset();
        assert!(task.snapshot().is_empty());
    }
}
