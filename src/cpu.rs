//! Per-organism CPU state.
//!
//! One [`CpuState`] is carried per living organism. `ip` is always relative
//! to the organism's own `start_addr` — this, plus `GETADDR`, is what makes
//! organism code position-independent (spec §4.6, §9): after a
//! defragmentation move, only `start_addr` changes, never `ip`.

use serde::{Deserialize, Serialize};

/// An ALLOCATE that has not yet been committed by a matching SPAWN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAlloc {
    pub addr: usize,
    pub size: usize,
    pub alloc_id: u32,
}

/// Eight general registers, relative IP, and fault/age counters for one
/// organism.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuState {
    pub regs: [i32; 8],
    /// Offset from the organism's `start_addr`. Absolute IP = `start_addr + ip`.
    pub ip: i64,
    /// Mirror of the organism's absolute base; kept in lockstep by the
    /// defragmenter so `ip` never has to change when an organism moves.
    pub start_addr: usize,
    pub errors: u64,
    pub age: u64,
    pub pending_alloc: Option<PendingAlloc>,
}

impl CpuState {
    /// A freshly spawned/injected organism: zeroed registers, `ip = 0`.
    pub fn new(start_addr: usize) -> Self {
        CpuState { regs: [0; 8], ip: 0, start_addr, errors: 0, age: 0, pending_alloc: None }
    }

    /// Absolute instruction pointer, or `None` if it currently lies outside
    /// `[0, soup_len)`.
    pub fn abs_ip(&self, soup_len: usize) -> Option<usize> {
        let abs = self.start_addr as i64 + self.ip;
        if abs < 0 || abs as u64 >= soup_len as u64 { None } else { Some(abs as usize) }
    }

    pub fn reg(&self, r: u8) -> i32 { self.regs[(r & 0x7) as usize] }

    pub fn set_reg(&mut self, r: u8, v: i32) { self.regs[(r & 0x7) as usize] = v; }
}
