//! Dense HyperLogLog sketch backing APPROX_COUNT_DISTINCT.

use ahash::RandomState;
use tern_codec::{encode_key, Value};
use tern_error::{Result, TernError};

/// log2 of the register count.
const PRECISION: u32 = 11;
const REGISTERS: usize = 1 << PRECISION;

/// Keys must hash identically on every node that touches a sketch, so the
/// hasher is seeded with fixed constants.
const SKETCH_RANDOM_STATE: RandomState = RandomState::with_seeds(
    0x7465_726e_5f68_6c6c,
    0x9e37_79b9_7f4a_7c15,
    0x2545_f491_4f6c_dd1d,
    0x8f86_3ab2_46b1_19d3,
);

/// A fixed-precision cardinality sketch.
///
/// Sketches from different peers union losslessly (register-wise max), which
/// is what makes APPROX_COUNT_DISTINCT splittable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sketch {
    registers: Vec<u8>,
}

impl Default for Sketch {
    fn default() -> Self {
        Sketch {
            registers: vec![0; REGISTERS],
        }
    }
}

impl Sketch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, v: &Value) {
        let hash = SKETCH_RANDOM_STATE.hash_one(encode_key(std::slice::from_ref(v)));
        let idx = (hash >> (64 - PRECISION)) as usize;
        let rest = hash << PRECISION;
        // Rank of the first set bit in the remaining 64-p bits, 1-based.
        let rank = (rest.leading_zeros() + 1).min(64 - PRECISION + 1) as u8;
        if rank > self.registers[idx] {
            self.registers[idx] = rank;
        }
    }

    pub fn merge(&mut self, other: &Sketch) {
        for (a, b) in self.registers.iter_mut().zip(other.registers.iter()) {
            if *b > *a {
                *a = *b;
            }
        }
    }

    /// Estimated cardinality, with the usual linear-counting correction for
    /// small ranges.
    pub fn estimate(&self) -> u64 {
        let m = REGISTERS as f64;
        let alpha = 0.7213 / (1.0 + 1.079 / m);
        let mut sum = 0.0;
        let mut zeros = 0usize;
        for &r in &self.registers {
            sum += 2f64.powi(-i32::from(r));
            if r == 0 {
                zeros += 1;
            }
        }
        let raw = alpha * m * m / sum;
        let corrected = if raw <= 2.5 * m && zeros > 0 {
            m * (m / zeros as f64).ln()
        } else {
            raw
        };
        corrected.round() as u64
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.registers.clone()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Sketch> {
        if bytes.len() != REGISTERS {
            return Err(TernError::new(format!(
                "bad sketch size: {} registers",
                bytes.len()
            )));
        }
        Ok(Sketch {
            registers: bytes.to_vec(),
        })
    }
}
