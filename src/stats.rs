use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free per-protocol packet counters.
///
/// `snapshot()` atomically reads and resets all counters, making it suitable
/// for periodic reporting without contention on the packet path.
pub struct PacketStats {
    counts: [AtomicU64; 256],
}

impl PacketStats {
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Increment the counter for the given IP protocol number.
    pub fn record(&self, protocol: u8) {
        self.counts[protocol as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Atomically read and reset all counters, returning only non-zero
    /// entries as (protocol, count).
    pub fn snapshot(&self) -> Vec<(u8, u64)> {
        let mut result = Vec::new();
        for (i, counter) in self.counts.iter().enumerate() {
            let v = counter.swap(0, Ordering::Relaxed);
            if v > 0 {
                result.push((i as u8, v));
            }
        }
        result
    }
}

impl Default for PacketStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Well-known IP protocol names, numeric otherwise.
pub fn protocol_name(protocol: u8) -> String {
    match protocol {
        1 => "icmp".to_string(),
        6 => "tcp".to_string(),
        17 => "udp".to_string(),
        58 => "icmpv6".to_string(),
        other => other.to_string(),
    }
}
