//! Checkpoint format — a byte-exact snapshot of core state (spec §6).
//!
//! The wire format is a hand-rolled, versioned binary framing (magic +
//! version + length-prefixed sections) rather than `serde_json`, so that
//! the soup's run-length encoding and the blake3 integrity digest are
//! under our control; everything *inside* a section is `serde_json` for
//! readability and because these structures are small compared to the
//! soup itself.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    cpu::{CpuState, PendingAlloc},
    frame::non_zero_regions,
    mem::MemoryManager,
    organism::{Organism, OrganismTable},
    reaper::Reaper,
    rng::{DeterministicRng, RngSnapshot},
    scheduler::{SimConfig, Simulator, Stats},
    soup::Soup,
};

pub const MAGIC: u32 = 0x5052_4F54;
pub const VERSION: u32 = 2;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed checkpoint: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("bad magic: expected {MAGIC:#010x}, got {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported checkpoint version {0}, need >= {VERSION}")]
    UnsupportedVersion(u32),
    #[error("integrity digest mismatch: checkpoint payload was altered or truncated")]
    DigestMismatch,
    #[error("organism {id} span [{start}, {end}) overlaps another organism's span")]
    OverlappingSpan { id: u64, start: usize, end: usize },
    #[error("organism {id} span [{start}, {end}) does not fit in a soup of size {soup_size}")]
    SpanOutOfBounds { id: u64, start: usize, end: usize, soup_size: usize },
}

/// Everything serialized into a checkpoint's JSON body; the soup itself
/// is framed separately around this so multi-megabyte soups don't have
/// to round-trip through `serde_json`'s allocator.
#[derive(Serialize, Deserialize)]
struct Body {
    config: SimConfig,
    cycle: u64,
    rng: RngSnapshot,
    soup_size: usize,
    /// Carried explicitly rather than re-derived from the saved organism
    /// ids, since dead organisms (which also consumed an id) aren't
    /// themselves persisted.
    next_organism_id: u64,
    organisms: Vec<OrganismRecord>,
    stats: Stats,
}

#[derive(Serialize, Deserialize)]
struct OrganismRecord {
    id: u64,
    parent_id: Option<u64>,
    birth_cycle: u64,
    start_addr: usize,
    size: usize,
    alloc_id: u32,
    ip: i64,
    errors: u64,
    age: u64,
    regs: [i32; 8],
    pending_alloc: Option<PendingAlloc>,
    name: Option<String>,
}

impl From<&Organism> for OrganismRecord {
    fn from(o: &Organism) -> Self {
        OrganismRecord {
            id: o.id,
            parent_id: o.parent_id,
            birth_cycle: o.birth_cycle,
            start_addr: o.start_addr,
            size: o.size,
            alloc_id: o.alloc_id,
            ip: o.state.ip,
            errors: o.state.errors,
            age: o.state.age,
            regs: o.state.regs,
            pending_alloc: o.state.pending_alloc,
            name: o.name.clone(),
        }
    }
}

/// Serialize `sim`'s current state and write it to `out`.
///
/// Layout: `magic(u32) | version(u32) | body_len(u64) | body(json) |
/// region_count(u64) | [base(u64) len(u64) words(i32*len)]... | digest(32 bytes)`.
/// The blake3 digest covers every byte written before it, so truncation
/// or corruption is caught on load rather than silently misread.
pub fn save(sim: &Simulator, out: &mut impl Write) -> Result<(), CheckpointError> {
    let organisms: Vec<OrganismRecord> = sim.table().iter_alive().map(OrganismRecord::from).collect();
    let body = Body {
        config: sim.config().clone(),
        cycle: sim.cycle(),
        rng: sim.rng().snapshot(),
        soup_size: sim.soup().len(),
        next_organism_id: sim.table().next_id_peek(),
        organisms,
        stats: sim.stats(),
    };
    let body_bytes = serde_json::to_vec(&body)?;

    let mut hasher = blake3::Hasher::new();
    let mut payload = Vec::new();
    payload.extend_from_slice(&MAGIC.to_le_bytes());
    payload.extend_from_slice(&VERSION.to_le_bytes());
    payload.extend_from_slice(&(body_bytes.len() as u64).to_le_bytes());
    payload.extend_from_slice(&body_bytes);

    let regions = non_zero_regions(sim.soup());
    payload.extend_from_slice(&(regions.len() as u64).to_le_bytes());
    for (base, words) in &regions {
        payload.extend_from_slice(&(*base as u64).to_le_bytes());
        payload.extend_from_slice(&(words.len() as u64).to_le_bytes());
        for w in words {
            payload.extend_from_slice(&w.to_le_bytes());
        }
    }

    hasher.update(&payload);
    let digest = hasher.finalize();

    out.write_all(&payload)?;
    out.write_all(digest.as_bytes())?;
    Ok(())
}

/// Parse a checkpoint previously written by [`save`], validating the
/// digest and every invariant in spec §6 before any live state is
/// mutated.
pub fn load(input: &mut impl Read) -> Result<Simulator, CheckpointError> {
    let mut payload = Vec::new();
    input.read_to_end(&mut payload)?;
    if payload.len() < 32 {
        return Err(CheckpointError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "checkpoint too short")));
    }
    let (body_and_regions, digest_bytes) = payload.split_at(payload.len() - 32);
    let expected = blake3::hash(body_and_regions);
    if expected.as_bytes() != digest_bytes {
        return Err(CheckpointError::DigestMismatch);
    }

    let mut cursor = body_and_regions;
    let magic = take_u32(&mut cursor)?;
    if magic != MAGIC {
        return Err(CheckpointError::BadMagic(magic));
    }
    let version = take_u32(&mut cursor)?;
    if version < VERSION {
        return Err(CheckpointError::UnsupportedVersion(version));
    }
    let body_len = take_u64(&mut cursor)? as usize;
    let (body_bytes, mut rest) = cursor.split_at(body_len);
    let body: Body = serde_json::from_slice(body_bytes)?;

    let mut soup = Soup::new(body.soup_size);
    let region_count = take_u64(&mut rest)?;
    for _ in 0..region_count {
        let base = take_u64(&mut rest)? as usize;
        let len = take_u64(&mut rest)? as usize;
        let mut words = Vec::with_capacity(len);
        for _ in 0..len {
            words.push(take_i32(&mut rest)?);
        }
        soup.load_words(base, &words);
    }

    let mut mem = MemoryManager::new(body.soup_size);
    let mut table = OrganismTable::new();
    let mut reaper = Reaper::new();

    for rec in &body.organisms {
        let end = rec.start_addr + rec.size;
        if end > body.soup_size {
            return Err(CheckpointError::SpanOutOfBounds { id: rec.id, start: rec.start_addr, end, soup_size: body.soup_size });
        }
        if (rec.start_addr..end).any(|addr| mem.owner_of(addr).is_some()) {
            return Err(CheckpointError::OverlappingSpan { id: rec.id, start: rec.start_addr, end });
        }
        let alloc_id = mem.mark_used(rec.start_addr, rec.size);
        let mut state = CpuState::new(rec.start_addr);
        state.regs = rec.regs;
        state.ip = rec.ip;
        state.errors = rec.errors;
        state.age = rec.age;
        state.pending_alloc = rec.pending_alloc;
        table.insert(Organism {
            id: rec.id,
            parent_id: rec.parent_id,
            birth_cycle: rec.birth_cycle,
            start_addr: rec.start_addr,
            size: rec.size,
            alloc_id,
            alive: true,
            state,
            name: rec.name.clone(),
        });
        reaper.register(rec.id, rec.birth_cycle);
    }
    // `mark_used` hands out fresh alloc_ids on restore rather than
    // reusing the saved ones; this keeps "alloc_id never reused" an
    // invariant of the *process*, not something a checkpoint can violate.

    while table.next_id_peek() < body.next_organism_id {
        table.reserve_id();
    }

    let rng = DeterministicRng::restore(body.rng);
    Ok(Simulator::from_parts(body.config, soup, mem, table, reaper, rng, body.cycle, body.stats))
}

fn take_u32(buf: &mut &[u8]) -> Result<u32, CheckpointError> {
    if buf.len() < 4 {
        return Err(CheckpointError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated u32")));
    }
    let (head, tail) = buf.split_at(4);
    *buf = tail;
    Ok(u32::from_le_bytes(head.try_into().unwrap()))
}

fn take_u64(buf: &mut &[u8]) -> Result<u64, CheckpointError> {
    if buf.len() < 8 {
        return Err(CheckpointError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated u64")));
    }
    let (head, tail) = buf.split_at(8);
    *buf = tail;
    Ok(u64::from_le_bytes(head.try_into().unwrap()))
}

fn take_i32(buf: &mut &[u8]) -> Result<i32, CheckpointError> {
    if buf.len() < 4 {
        return Err(CheckpointError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated i32")));
    }
    let (head, tail) = buf.split_at(4);
    *buf = tail;
    Ok(i32::from_le_bytes(head.try_into().unwrap()))
}
