use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::Rng;

use crate::codec::MAX_KEY_LEN;
use crate::hash::murmur3_32;

use super::{sort_heavy, HeavyEntry, HeavyRecord};

const DEFAULT_WIDTH: u32 = 1 << 20;
const DEFAULT_DEPTH: u32 = 3;
const DEFAULT_THRESHOLD: u32 = 4096;
const DEFAULT_M: u32 = 128;
const DEFAULT_REGISTER_BITS: u32 = 5;
const DEFAULT_BASE: f64 = 0.5;
const DEFAULT_B: f64 = 1.08;

/// Virtual HyperLogLog sampler shared by one sketch cell.
///
/// `p` tracks the probability that the next element is new to the cell. It is
/// a diagnostic estimator kept as an f64 bit-pattern in an atomic and updated
/// by CAS loop; it is not load-bearing for correctness.
#[derive(Debug)]
pub struct GeneralHll {
    m: u32,
    max_value: u32,
    base: f64,
    registers: Vec<AtomicU32>,
    seeds: [u32; 2],
    p_bits: AtomicU64,
}

impl GeneralHll {
    fn new(m: u32, size: u32, base: f64, rng: &mut impl Rng) -> Self {
        Self {
            m,
            max_value: (1 << size) - 1,
            base,
            registers: (0..m).map(|_| AtomicU32::new(0)).collect(),
            seeds: [rng.gen(), rng.gen()],
            p_bits: AtomicU64::new(1.0f64.to_bits()),
        }
    }

    /// Geometric rank of an element: leading zeros of its hash plus one,
    /// capped at the register maximum.
    fn geometric_hash(&self, element: &[u8]) -> u32 {
        let hash = murmur3_32(element, self.seeds[0]);
        (hash.leading_zeros() + 1).min(self.max_value)
    }

    fn add_p(&self, delta: f64) {
        loop {
            let old_bits = self.p_bits.load(Ordering::Relaxed);
            let new_bits = (f64::from_bits(old_bits) + delta).to_bits();
            if self
                .p_bits
                .compare_exchange_weak(old_bits, new_bits, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Raises the element's register if its rank exceeds the stored value.
    /// Returns the probability accumulator as it stood before this update,
    /// or `None` when the register did not change.
    pub fn encode(&self, element: &[u8]) -> Option<f64> {
        let rank = self.geometric_hash(element);
        let idx = (murmur3_32(element, self.seeds[1]) % self.m) as usize;
        let register = &self.registers[idx];

        let mut old = register.load(Ordering::Relaxed);
        loop {
            if rank <= old {
                return None;
            }
            match register.compare_exchange_weak(old, rank, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(current) => old = current,
            }
        }

        let prev = f64::from_bits(self.p_bits.load(Ordering::Relaxed));
        self.add_p(-self.base.powi(old as i32) / f64::from(self.m));
        if rank < self.max_value {
            self.add_p(self.base.powi(rank as i32) / f64::from(self.m));
        }
        Some(prev)
    }

    fn reset(&self) {
        for register in &self.registers {
            register.store(0, Ordering::Relaxed);
        }
        self.p_bits.store(1.0f64.to_bits(), Ordering::Relaxed);
    }
}

/// Replacement slot: candidate flow fingerprint and its spread counter,
/// subject to probabilistic substitution. The fingerprint is only meaningful
/// while the counter is non-zero.
#[derive(Debug)]
struct ReplacementSlot {
    fp: Vec<u8>,
    value: u32,
}

#[derive(Debug)]
struct Cell {
    hll: GeneralHll,
    slot: Mutex<ReplacementSlot>,
}

/// Per-flow cardinality estimator with super-spreader extraction. Each cell
/// combines a virtual HLL over the merged (flow, element) bytes with a
/// majority-vote replacement slot fed by coupon-collector-corrected samples.
///
/// HLL registers and the probability accumulator use CAS; the replacement
/// slot takes the cell lock because the fingerprint exceeds a machine word.
/// The same lock serializes `reset` against in-flight slot updates.
#[derive(Debug)]
pub struct SuperSpreaderSketch {
    width: u32,
    depth: u32,
    threshold: u32,
    b: f64,
    seeds: Vec<u32>,
    rows: Vec<Vec<Cell>>,
}

impl SuperSpreaderSketch {
    /// Builds a sketch of `width` x `depth` cells, each with an `m`-register
    /// HLL of `size`-bit registers. Zero parameters fall back to defaults.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        width: u32,
        depth: u32,
        threshold: u32,
        m: u32,
        size: u32,
        base: f64,
        b: f64,
        fp_len: usize,
    ) -> Self {
        let width = if width == 0 { DEFAULT_WIDTH } else { width };
        let depth = if depth == 0 { DEFAULT_DEPTH } else { depth };
        let threshold = if threshold == 0 {
            DEFAULT_THRESHOLD
        } else {
            threshold
        };
        let m = if m == 0 { DEFAULT_M } else { m };
        let size = if size == 0 { DEFAULT_REGISTER_BITS } else { size };
        let base = if base == 0.0 { DEFAULT_BASE } else { base };
        let b = if b == 0.0 { DEFAULT_B } else { b };

        let mut rng = rand::thread_rng();
        let seeds: Vec<u32> = (0..depth).map(|_| rng.gen()).collect();

        let mut rows = Vec::with_capacity(depth as usize);
        for _ in 0..depth {
            let mut row = Vec::with_capacity(width as usize);
            for _ in 0..width {
                row.push(Cell {
                    hll: GeneralHll::new(m, size, base, &mut rng),
                    slot: Mutex::new(ReplacementSlot {
                        fp: vec![0u8; fp_len],
                        value: 0,
                    }),
                });
            }
            rows.push(row);
        }

        Self {
            width,
            depth,
            threshold,
            b,
            seeds,
            rows,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Records that `flow` touched `elem`. Repeated (flow, elem) pairs are
    /// absorbed by the HLL and do not inflate the spread.
    pub fn insert(&self, flow: &[u8], elem: &[u8]) {
        let mut merged = [0u8; 2 * MAX_KEY_LEN];
        merged[..flow.len()].copy_from_slice(flow);
        merged[flow.len()..flow.len() + elem.len()].copy_from_slice(elem);
        let merged = &merged[..flow.len() + elem.len()];

        let mut rng = rand::thread_rng();

        for i in 0..self.depth as usize {
            let j = (murmur3_32(flow, self.seeds[i]) % self.width) as usize;
            let cell = &self.rows[i][j];

            let Some(temp_p) = cell.hll.encode(merged) else {
                continue;
            };
            if temp_p <= 0.0 {
                continue;
            }

            // Coupon-collector correction: a raise observed at probability p
            // stands for ceil(1/p) elements, admitted so the expectation
            // stays 1/p.
            let inv = 1.0 / temp_p;
            let k = inv.ceil();
            if rng.gen::<f64>() >= inv / k {
                continue;
            }

            let mut slot = cell.slot.lock();
            for _ in 0..k as u32 {
                if slot.value == 0 {
                    slot.fp.copy_from_slice(flow);
                    slot.value = 1;
                } else if slot.fp == flow {
                    slot.value += 1;
                } else if rng.gen::<f64>() < self.b.powi(-(slot.value as i32)) {
                    slot.value -= 1;
                }
            }
        }
    }

    /// Spread estimate for `flow`: the maximum matching slot counter across
    /// rows, lower-bounded by 1.
    pub fn query(&self, flow: &[u8]) -> u64 {
        let mut estimate = 0u32;
        for i in 0..self.depth as usize {
            let j = (murmur3_32(flow, self.seeds[i]) % self.width) as usize;
            let slot = self.rows[i][j].slot.lock();
            if slot.value > 0 && slot.fp == flow {
                estimate = estimate.max(slot.value);
            }
        }
        u64::from(estimate.max(1))
    }

    /// Enumerates every stored fingerprint, re-queries each, and returns the
    /// flows whose spread meets the threshold, sorted descending.
    pub fn heavy_hitters(&self) -> HeavyRecord {
        let mut flows: HashSet<Vec<u8>> = HashSet::new();
        for row in &self.rows {
            for cell in row {
                let slot = cell.slot.lock();
                if slot.value > 0 {
                    flows.insert(slot.fp.clone());
                }
            }
        }

        let mut count: Vec<HeavyEntry> = flows
            .into_iter()
            .filter_map(|flow| {
                let estimate = self.query(&flow) as u32;
                (estimate >= self.threshold).then_some(HeavyEntry {
                    flow,
                    value: estimate,
                })
            })
            .collect();
        sort_heavy(&mut count);

        HeavyRecord {
            count,
            size: Vec::new(),
            is_spread: true,
        }
    }

    /// Zeroes every register and replacement slot. Each cell is cleared
    /// under its slot lock so a concurrent insert cannot interleave with the
    /// wipe of that cell.
    pub fn reset(&self) {
        for row in &self.rows {
            for cell in row {
                let mut slot = cell.slot.lock();
                cell.hll.reset();
                slot.value = 0;
                slot.fp.fill(0);
            }
        }
    }
}
