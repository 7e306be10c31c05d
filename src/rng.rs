//! Single process-wide deterministic RNG (spec §3, §5).
//!
//! Every stochastic decision in the simulator — the mutation coin-flip and
//! the mutated bit index — draws from this one generator in a fixed order,
//! so that identical seed + identical injection/event sequence replays
//! bit-for-bit. The generator's full internal state is snapshot-able via
//! `serde`, the same way the teacher's `Transcript` is a single
//! deterministic, replayable state machine shared by the prover and
//! verifier (see `transcript.rs`).

use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Wraps a `ChaCha8Rng` so the rest of the crate never reaches for
/// `rand::thread_rng()` and accidentally breaks reproducibility.
#[derive(Clone, Serialize, Deserialize)]
pub struct DeterministicRng {
    inner: ChaCha8Rng,
}

impl DeterministicRng {
    pub fn from_seed(seed: u64) -> Self { DeterministicRng { inner: ChaCha8Rng::seed_from_u64(seed) } }

    /// Coin-flip used for the COPY mutation decision (spec §4.2).
    pub fn roll_mutation(&mut self, mutation_rate: f64) -> bool { self.inner.gen_bool(mutation_rate.clamp(0.0, 1.0)) }

    /// Uniform bit index in `0..32`, used to XOR a single bit on mutation.
    pub fn bit_index(&mut self) -> u32 { self.inner.gen_range(0..32) }

    /// Opaque state blob for checkpointing. Must be captured *before* any
    /// subsequent RNG consumption in the same cycle (spec §5, §6).
    pub fn snapshot(&self) -> RngSnapshot { RngSnapshot { inner: self.inner.clone() } }

    pub fn restore(snapshot: RngSnapshot) -> Self { DeterministicRng { inner: snapshot.inner } }

    #[cfg(test)]
    pub(crate) fn next_u32(&mut self) -> u32 { self.inner.next_u32() }
}

/// Opaque, serializable snapshot of the RNG's internal state.
#[derive(Clone, Serialize, Deserialize)]
pub struct RngSnapshot {
    inner: ChaCha8Rng,
}
