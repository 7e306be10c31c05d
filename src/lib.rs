//! Proteus — a Tierra-style artificial-life simulator.
//!
//! Self-replicating organisms execute inside a shared linear memory (the
//! "soup"), competing for space, mutating on self-copy, and being culled
//! by a grim-reaper policy. This crate is the execution engine: the ISA
//! codec, the per-organism virtual CPU, the memory manager, the organism
//! table, the reaper, the defragmenter, and the deterministic scheduler
//! that ties them into one reproducible stream of cycles.
//!
//! The textual assembler, checkpoint format, debug frame recorder and
//! disassembler are boundary adapters built on top of the core; the CLI
//! (`src/bin/proteus.rs`) is the thinnest possible wrapper around them.

pub mod asm;
pub mod checkpoint;
pub mod cpu;
pub mod defrag;
pub mod disasm;
pub mod frame;
pub mod isa;
pub mod mem;
pub mod organism;
pub mod reaper;
pub mod rng;
pub mod scheduler;
pub mod soup;
pub mod vcpu;

pub use checkpoint::{load as load_checkpoint, save as save_checkpoint, CheckpointError};
pub use frame::{Event, Frame};
pub use isa::{decode, encode, Instruction};
pub use scheduler::{Injection, SimConfig, SimError, Simulator, Stats};
