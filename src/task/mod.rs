pub mod exact;
pub mod sketch;

pub use exact::{ExactSnapshot, ExactTask, Flow};
pub use sketch::SketchTask;

use tracing::warn;

use crate::codec::{Field, FieldCodec};
use crate::config::AlerterRule;
use crate::model::PacketInfo;
use crate::sketch::HeavyRecord;

/// Tagged snapshot payload handed to writers and the alerter. A writer
/// matches on the arm it understands; a mismatch is a typed error, never a
/// crash.
#[derive(Debug, Clone)]
pub enum SnapshotPayload {
    Exact(ExactSnapshot),
    Heavy(HeavyRecord),
}

impl SnapshotPayload {
    /// Name of the payload variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Exact(_) => "exact",
            Self::Heavy(_) => "heavy",
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Exact(s) => s.is_empty(),
            Self::Heavy(r) => r.is_empty(),
        }
    }
}

/// Describes how to render a task's flow keys: the ordered key fields and
/// the codec that decodes an encoded key. Travels alongside the snapshot
/// payload so writers never reach back into the task.
#[derive(Clone)]
pub struct FieldDescriptor {
    codec: FieldCodec,
}

impl FieldDescriptor {
    pub fn new(codec: FieldCodec) -> Self {
        Self { codec }
    }

    pub fn fields(&self) -> &[Field] {
        self.codec.fields()
    }

    /// Printable space-joined form of an encoded key.
    pub fn decode(&self, flow: &[u8]) -> String {
        self.codec.decode(flow)
    }

    /// Per-field printable values of an encoded key, in field order.
    pub fn decode_parts(&self, flow: &[u8]) -> Vec<String> {
        self.codec.decode_parts(flow)
    }
}

/// An aggregation task. `process` is called from every worker concurrently;
/// `snapshot` and `reset` run on independent timers and must be safe against
/// in-flight processing.
#[derive(Debug)]
pub enum Task {
    Exact(ExactTask),
    Sketch(SketchTask),
}

impl Task {
    pub fn name(&self) -> &str {
        match self {
            Self::Exact(t) => t.name(),
            Self::Sketch(t) => t.name(),
        }
    }

    pub fn process(&self, packet: &PacketInfo) {
        match self {
            Self::Exact(t) => t.process(packet),
            Self::Sketch(t) => t.process(packet),
        }
    }

    /// Point-in-time deep copy of the task's aggregate state. Does not
    /// reset.
    pub fn snapshot(&self) -> SnapshotPayload {
        match self {
            Self::Exact(t) => SnapshotPayload::Exact(t.snapshot()),
            Self::Sketch(t) => SnapshotPayload::Heavy(t.snapshot()),
        }
    }

    /// Returns the task to an empty state at a measurement window boundary.
    pub fn reset(&self) {
        match self {
            Self::Exact(t) => t.reset(),
            Self::Sketch(t) => t.reset(),
        }
    }

    /// Evaluates the rules that target this task against a fresh snapshot
    /// and returns the triggered alert blocks as HTML, or an empty string.
    pub fn alert_message(&self, rules: &[AlerterRule]) -> String {
        match self {
            Self::Exact(t) => t.alert_message(rules),
            Self::Sketch(t) => t.alert_message(rules),
        }
    }

    pub fn field_descriptor(&self) -> FieldDescriptor {
        match self {
            Self::Exact(t) => t.field_descriptor(),
            Self::Sketch(t) => t.field_descriptor(),
        }
    }
}

/// Compares an observed value against a rule threshold. Unknown operators
/// log a warning and never fire.
pub(crate) fn check(value: f64, threshold: f64, operator: &str) -> bool {
    match operator {
        ">" => value > threshold,
        "<" => value < threshold,
        "=" => value == threshold,
        ">=" => value >= threshold,
        "<=" => value <= threshold,
        _ => {
            warn!(operator, "unknown operator in alerter rule");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_operators() {
        assert!(check(10.0, 5.0, ">"));
        assert!(!check(5.0, 5.0, ">"));
        assert!(check(5.0, 5.0, ">="));
        assert!(check(3.0, 5.0, "<"));
        assert!(check(5.0, 5.0, "<="));
        assert!(check(5.0, 5.0, "="));
        assert!(!check(5.0, 6.0, "="));
    }

    #[test]
    fn test_check_unknown_operator_never_fires() {
        assert!(!check(10.0, 5.0, "!="));
        assert!(!check(10.0, 5.0, ""));
    }
}
