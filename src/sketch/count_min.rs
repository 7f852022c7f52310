use std::collections::HashMap;

use parking_lot::Mutex;
use rand::Rng;

use crate::hash::murmur3_32;

use super::{sort_heavy, HeavyEntry, HeavyRecord};

const DEFAULT_WIDTH: u32 = 1 << 20;
const DEFAULT_DEPTH: u32 = 3;
const DEFAULT_SIZE_THRESHOLD: u32 = 512 * 1024;
const DEFAULT_COUNT_THRESHOLD: u32 = 512;

/// One majority-vote slot: a flow fingerprint and its counter. The
/// fingerprint is only meaningful while the counter is non-zero.
#[derive(Debug, Clone)]
struct Slot {
    fp: Vec<u8>,
    value: u32,
}

impl Slot {
    fn new(fp_len: usize) -> Self {
        Self {
            fp: vec![0u8; fp_len],
            value: 0,
        }
    }

    fn claim(&mut self, flow: &[u8], value: u32) {
        self.fp.copy_from_slice(flow);
        self.value = value;
    }
}

#[derive(Debug)]
struct Bucket {
    count: Slot,
    size: Slot,
}

/// Count-Min variant where each bucket keeps majority-vote (fingerprint,
/// counter) pairs for packet count and byte size independently. Estimates
/// are biased toward large flows by construction.
///
/// Fingerprints exceed a machine word, so each bucket is guarded by its own
/// lock; an update appears atomic and readers never observe a fingerprint
/// paired with another flow's counter.
#[derive(Debug)]
pub struct CountMinSketch {
    width: u32,
    depth: u32,
    size_threshold: u32,
    count_threshold: u32,
    seeds: Vec<u32>,
    table: Vec<Vec<Mutex<Bucket>>>,
}

impl CountMinSketch {
    /// Builds a sketch of `width` x `depth` buckets with fingerprints of
    /// `fp_len` bytes. Zero parameters fall back to defaults.
    pub fn new(
        width: u32,
        depth: u32,
        size_threshold: u32,
        count_threshold: u32,
        fp_len: usize,
    ) -> Self {
        let width = if width == 0 { DEFAULT_WIDTH } else { width };
        let depth = if depth == 0 { DEFAULT_DEPTH } else { depth };
        let size_threshold = if size_threshold == 0 {
            DEFAULT_SIZE_THRESHOLD
        } else {
            size_threshold
        };
        let count_threshold = if count_threshold == 0 {
            DEFAULT_COUNT_THRESHOLD
        } else {
            count_threshold
        };

        let mut rng = rand::thread_rng();
        let seeds: Vec<u32> = (0..depth).map(|_| rng.gen()).collect();

        let table = (0..depth)
            .map(|_| {
                (0..width)
                    .map(|_| {
                        Mutex::new(Bucket {
                            count: Slot::new(fp_len),
                            size: Slot::new(fp_len),
                        })
                    })
                    .collect()
            })
            .collect();

        Self {
            width,
            depth,
            size_threshold,
            count_threshold,
            seeds,
            table,
        }
    }

    pub fn count_threshold(&self) -> u32 {
        self.count_threshold
    }

    pub fn size_threshold(&self) -> u32 {
        self.size_threshold
    }

    /// Records one packet of `length` bytes for `flow` in every row.
    pub fn insert(&self, flow: &[u8], length: u32) {
        for i in 0..self.depth as usize {
            let j = (murmur3_32(flow, self.seeds[i]) % self.width) as usize;
            let mut bucket = self.table[i][j].lock();

            // Size slot: swap-on-larger variant.
            let size = &mut bucket.size;
            if size.value == 0 {
                size.claim(flow, length);
            } else if size.fp == flow {
                size.value = size.value.saturating_add(length);
            } else if length > size.value {
                size.claim(flow, length);
            } else {
                size.value = size.value.saturating_sub(length);
            }

            // Count slot: classic majority vote.
            let count = &mut bucket.count;
            if count.value == 0 {
                count.claim(flow, 1);
            } else if count.fp == flow {
                count.value = count.value.saturating_add(1);
            } else {
                count.value -= 1;
                if count.value == 0 {
                    count.claim(flow, 1);
                }
            }
        }
    }

    /// Estimates `flow` as `(packet_count << 32) | byte_size`, taking the
    /// maximum over rows whose slot fingerprint matches.
    pub fn query(&self, flow: &[u8]) -> u64 {
        let mut ct = 0u32;
        let mut sz = 0u32;

        for i in 0..self.depth as usize {
            let j = (murmur3_32(flow, self.seeds[i]) % self.width) as usize;
            let bucket = self.table[i][j].lock();
            if bucket.count.value > 0 && bucket.count.fp == flow {
                ct = ct.max(bucket.count.value);
            }
            if bucket.size.value > 0 && bucket.size.fp == flow {
                sz = sz.max(bucket.size.value);
            }
        }

        (u64::from(ct) << 32) | u64::from(sz)
    }

    /// Scans all buckets, taking the per-fingerprint maximum on each axis,
    /// and returns the flows meeting their thresholds sorted descending.
    pub fn heavy_hitters(&self) -> HeavyRecord {
        let mut count_map: HashMap<Vec<u8>, u32> = HashMap::new();
        let mut size_map: HashMap<Vec<u8>, u32> = HashMap::new();

        for row in &self.table {
            for cell in row {
                let bucket = cell.lock();
                if bucket.count.value > 0 {
                    let entry = count_map.entry(bucket.count.fp.clone()).or_insert(0);
                    *entry = (*entry).max(bucket.count.value);
                }
                if bucket.size.value > 0 {
                    let entry = size_map.entry(bucket.size.fp.clone()).or_insert(0);
                    *entry = (*entry).max(bucket.size.value);
                }
            }
        }

        let mut count: Vec<HeavyEntry> = count_map
            .into_iter()
            .filter(|&(_, v)| v >= self.count_threshold)
            .map(|(flow, value)| HeavyEntry { flow, value })
            .collect();
        let mut size: Vec<HeavyEntry> = size_map
            .into_iter()
            .filter(|&(_, v)| v >= self.size_threshold)
            .map(|(flow, value)| HeavyEntry { flow, value })
            .collect();

        sort_heavy(&mut count);
        sort_heavy(&mut size);

        HeavyRecord {
            count,
            size,
            is_spread: false,
        }
    }

    /// Clears every bucket for the next measurement window.
    pub fn reset(&self) {
        for row in &self.table {
            for cell in row {
                let mut bucket = cell.lock();
                bucket.count.value = 0;
                bucket.count.fp.fill(0);
                bucket.size.value = 0;
                bucket.size.fp.fill(0);
            }
        }
    }
}
