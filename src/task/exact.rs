use std::collections::HashMap;
use std::fmt::Write;
use std::time::SystemTime;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::{CodecError, FieldCodec, MAX_KEY_LEN};
use crate::config::AlerterRule;
use crate::hash::fnv1a_32;
use crate::model::PacketInfo;

use super::{check, FieldDescriptor};

const DEFAULT_SHARD_COUNT: u32 = 256;
const MAX_SHARD_COUNT: u32 = 32768;

/// An aggregated flow: all packets sharing the task's key-field values
/// within one measurement window. Counters only grow; `end_time` only
/// advances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    /// Printable decoded key, e.g. "10.0.0.1 53 17".
    pub key: String,
    /// Decoded field values in the task's key-field order.
    pub fields: Vec<String>,
    /// Key-field names paired with `fields`.
    pub field_names: Vec<String>,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
    pub packet_count: u64,
    pub byte_count: u64,
}

impl Flow {
    /// Decoded value of the named key field, if it is part of this flow's
    /// identity.
    pub fn field_named(&self, name: &str) -> Option<&str> {
        self.field_names
            .iter()
            .position(|n| n == name)
            .map(|i| self.fields[i].as_str())
    }
}

/// Deep-copied point-in-time view of an exact task: one map clone per shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExactSnapshot {
    pub task_name: String,
    pub shards: Vec<HashMap<Vec<u8>, Flow>>,
}

impl ExactSnapshot {
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(HashMap::is_empty)
    }

    /// (total packets, total bytes, flow count) across all shards.
    pub fn totals(&self) -> (u64, u64, u64) {
        let mut packets = 0u64;
        let mut bytes = 0u64;
        let mut flows = 0u64;
        for shard in &self.shards {
            for flow in shard.values() {
                packets += flow.packet_count;
                bytes += flow.byte_count;
                flows += 1;
            }
        }
        (packets, bytes, flows)
    }
}

/// Exact per-flow counters over a configurable key-field subset, held in a
/// fixed array of shards each guarded by a reader-writer lock. The shard
/// count is fixed for the task's life.
#[derive(Debug)]
pub struct ExactTask {
    name: String,
    codec: FieldCodec,
    shards: Vec<RwLock<HashMap<Vec<u8>, Flow>>>,
    shard_count: u32,
}

impl ExactTask {
    pub fn new(name: &str, key_fields: &[String], num_shards: u32) -> Result<Self, CodecError> {
        let codec = FieldCodec::new(key_fields)?;

        let shard_count = if num_shards == 0 || num_shards >= MAX_SHARD_COUNT {
            DEFAULT_SHARD_COUNT
        } else {
            num_shards
        };

        debug!(
            task = name,
            shards = shard_count,
            key_len = codec.key_len(),
            "created exact task",
        );

        Ok(Self {
            name: name.to_string(),
            codec,
            shards: (0..shard_count).map(|_| RwLock::new(HashMap::new())).collect(),
            shard_count,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    pub fn field_descriptor(&self) -> FieldDescriptor {
        FieldDescriptor::new(self.codec.clone())
    }

    fn shard_index(&self, key: &[u8]) -> usize {
        (fnv1a_32(key) % self.shard_count) as usize
    }

    /// Creates or advances the flow for this packet's key under the shard's
    /// write lock.
    pub fn process(&self, packet: &PacketInfo) {
        let mut key_buf = [0u8; MAX_KEY_LEN];
        let len = self.codec.encode(&packet.five_tuple, &mut key_buf);
        let key = &key_buf[..len];

        let mut shard = self.shards[self.shard_index(key)].write();
        if let Some(flow) = shard.get_mut(key) {
            // Workers may hand over packets out of order; the window bounds
            // only ever widen.
            if packet.timestamp > flow.end_time {
                flow.end_time = packet.timestamp;
            }
            if packet.timestamp < flow.start_time {
                flow.start_time = packet.timestamp;
            }
            flow.packet_count += 1;
            flow.byte_count += u64::from(packet.length);
        } else {
            let fields = self.codec.decode_parts(key);
            let field_names = self
                .codec
                .fields()
                .iter()
                .map(|f| f.name().to_string())
                .collect();
            shard.insert(
                key.to_vec(),
                Flow {
                    key: fields.join(" "),
                    fields,
                    field_names,
                    start_time: packet.timestamp,
                    end_time: packet.timestamp,
                    packet_count: 1,
                    byte_count: u64::from(packet.length),
                },
            );
        }
    }

    /// Clones each shard map under its read lock. The result is independent
    /// of later `process` and `reset` calls.
    pub fn snapshot(&self) -> ExactSnapshot {
        let shards = self
            .shards
            .iter()
            .map(|shard| shard.read().clone())
            .collect();

        ExactSnapshot {
            task_name: self.name.clone(),
            shards,
        }
    }

    /// Replaces each shard map with an empty one under its write lock.
    pub fn reset(&self) {
        for shard in &self.shards {
            let mut map = shard.write();
            *map = HashMap::new();
        }
    }

    /// Point lookup: (packet_count, byte_count) for an encoded key.
    pub fn query(&self, key: &[u8]) -> Option<(u64, u64)> {
        let shard = self.shards[self.shard_index(key)].read();
        shard
            .get(key)
            .map(|flow| (flow.packet_count, flow.byte_count))
    }

    /// Evaluates total-metric rules against a fresh snapshot. Returns one
    /// HTML block per triggered rule, joined by separators.
    pub fn alert_message(&self, rules: &[AlerterRule]) -> String {
        let (total_packets, total_bytes, flow_count) = self.snapshot().totals();

        let mut triggered = Vec::new();
        for rule in rules {
            if rule.task_name != self.name {
                continue;
            }

            let (value, unit) = match rule.metric.as_str() {
                "total_packets" => (total_packets as f64, "packets"),
                "total_bytes" => (total_bytes as f64, "bytes"),
                "total_flows" => (flow_count as f64, "flows"),
                _ => {
                    debug!(task = %self.name, metric = %rule.metric, "metric not applicable");
                    continue;
                }
            };

            if check(value, rule.threshold, &rule.operator) {
                let mut msg = String::new();
                let _ = write!(
                    msg,
                    "<h3>Alert: {}</h3>\
                     <ul>\
                     <li><b>Task:</b> <code>{}</code></li>\
                     <li><b>Metric:</b> <code>{}</code></li>\
                     <li><b>Condition:</b> <code>{} {:.2}</code></li>\
                     <li><b>Observed Value:</b> <code>{:.0} {}</code></li>\
                     </ul>",
                    rule.name, rule.task_name, rule.metric, rule.operator, rule.threshold, value, unit,
                );
                triggered.push(msg);
            }
        }

        triggered.join("<br><hr><br>")
    }
}
