//! Debug frame recorder — a read-only view of one cycle (spec §6).
//!
//! A [`Frame`] never drives the simulation; it only describes what
//! happened. The scheduler pushes [`Event`]s into a [`FrameRecorder`]
//! as it executes a cycle, then [`FrameRecorder::finish`] packages them
//! with a soup/organism snapshot into a `Frame` for a CLI `analyze` pass
//! or a debugger to consume.

use serde::{Deserialize, Serialize};

use crate::{organism::OrganismTable, soup::Soup, vcpu::MutationObserver};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Spawn { parent_id: Option<u64>, child_id: u64, addr: usize, size: usize },
    Death { organism_id: u64, cause: DeathCause },
    Mutation { organism_id: u64, src: usize, dst: usize, original: i32, mutated: i32 },
    Instruction { organism_id: u64, opcode: u8 },
    Allocation { organism_id: u64, addr: usize, size: usize },
    AllocationFailed { organism_id: u64, requested: usize },
    Error { organism_id: u64, kind: ErrorKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeathCause {
    Reaped,
    ErrorThreshold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    IpOutOfBounds,
    UnknownOpcode,
    MemOutOfBounds,
}

/// A snapshot of one organism's externally visible state, suitable for
/// display in `analyze` without exposing the live `CpuState` mutably.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganismSnapshot {
    pub id: u64,
    pub parent_id: Option<u64>,
    pub birth_cycle: u64,
    pub start_addr: usize,
    pub size: usize,
    pub ip: i64,
    pub errors: u64,
    pub age: u64,
}

/// One cycle's worth of observable simulation activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub cycle: u64,
    /// Non-zero `(base, words)` runs only — mirrors the checkpoint's
    /// run-length soup encoding so a frame dump and a checkpoint agree
    /// on what "non-zero" means.
    pub regions: Vec<(usize, Vec<i32>)>,
    pub organisms: Vec<OrganismSnapshot>,
    pub events: Vec<Event>,
}

/// Accumulates events during one cycle's execution, emits full
/// `Instruction` events only when `trace_instructions` is set (they are
/// one-per-organism-per-cycle and dominate frame size otherwise).
pub struct FrameRecorder {
    cycle: u64,
    events: Vec<Event>,
    trace_instructions: bool,
}

impl FrameRecorder {
    pub fn new(cycle: u64, trace_instructions: bool) -> Self {
        FrameRecorder { cycle, events: Vec::new(), trace_instructions }
    }

    pub fn push(&mut self, event: Event) { self.events.push(event); }

    pub fn trace_instructions(&self) -> bool { self.trace_instructions }

    pub fn finish(self, soup: &Soup, table: &OrganismTable) -> Frame {
        Frame { cycle: self.cycle, regions: non_zero_regions(soup), organisms: snapshot_organisms(table), events: self.events }
    }
}

impl MutationObserver for FrameRecorder {
    fn on_mutation(&mut self, cycle: u64, organism_id: u64, src: usize, dst: usize, original: i32, mutated: i32) {
        debug_assert_eq!(cycle, self.cycle);
        self.events.push(Event::Mutation { organism_id, src, dst, original, mutated });
    }
}

fn snapshot_organisms(table: &OrganismTable) -> Vec<OrganismSnapshot> {
    table
        .iter_alive()
        .map(|o| OrganismSnapshot {
            id: o.id,
            parent_id: o.parent_id,
            birth_cycle: o.birth_cycle,
            start_addr: o.start_addr,
            size: o.size,
            ip: o.state.ip,
            errors: o.state.errors,
            age: o.state.age,
        })
        .collect()
}

/// Run-length encode the soup's non-zero cells, same convention the
/// checkpoint format uses (spec §6).
pub(crate) fn non_zero_regions(soup: &Soup) -> Vec<(usize, Vec<i32>)> {
    let mut regions = Vec::new();
    let mut run: Option<(usize, Vec<i32>)> = None;
    for (addr, &value) in soup.as_slice().iter().enumerate() {
        if value != 0 {
            match &mut run {
                Some((_base, words)) => words.push(value),
                None => run = Some((addr, vec![value])),
            }
        } else if let Some(finished) = run.take() {
            regions.push(finished);
        }
    }
    if let Some(finished) = run {
        regions.push(finished);
    }
    regions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_zero_regions_splits_on_zero_runs() {
        let mut soup = Soup::new(10);
        soup.write(1, 5);
        soup.write(2, 6);
        soup.write(7, 9);
        let regions = non_zero_regions(&soup);
        assert_eq!(regions, vec![(1, vec![5, 6]), (7, vec![9])]);
    }

    #[test]
    fn empty_soup_has_no_regions() {
        let soup = Soup::new(10);
        assert!(non_zero_regions(&soup).is_empty());
    }

    #[test]
    fn recorder_collects_mutation_events_via_the_observer_trait() {
        let mut recorder = FrameRecorder::new(3, false);
        recorder.on_mutation(3, 7, 1, 2, 0xFF, 0xFE);
        assert_eq!(recorder.events.len(), 1);
        match &recorder.events[0] {
            Event::Mutation { organism_id, src, dst, .. } => {
                assert_eq!(*organism_id, 7);
                assert_eq!(*src, 1);
                assert_eq!(*dst, 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
