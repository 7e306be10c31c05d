//! Scheduler / Simulator — ties every other module into one reproducible
//! stream of cycles (spec §4.7, §5).
//!
//! Single-threaded, cooperative: exactly one organism executes at a time,
//! in ascending-id order, and the only suspension points are the ones the
//! scheduler inserts between instructions (reap, defrag, termination
//! check). This is what makes two runs with identical seed and injection
//! sequence produce bit-identical checkpoints.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::{
    cpu::CpuState,
    defrag::{defragment, should_defragment},
    frame::{DeathCause, Event, Frame, FrameRecorder},
    mem::{AllocId, MemStats, MemoryManager},
    organism::{Organism, OrganismTable},
    reaper::Reaper,
    rng::DeterministicRng,
    soup::Soup,
    vcpu::{self, ExecutionResult, SyscallHandler},
};

#[derive(Debug, Error)]
pub enum SimError {
    #[error("soup_size must be at least 1, got {0}")]
    EmptySoup(usize),
    #[error("injection span [{addr}, {end}) does not fit in a soup of size {soup_size}")]
    InjectionOutOfBounds { addr: usize, end: usize, soup_size: usize },
    #[error("injection genome is empty")]
    EmptyGenome,
}

/// Knobs that must be fixed before the run starts; all of them feed the
/// reproducibility contract in spec §5.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    pub soup_size: usize,
    pub seed: u64,
    pub mutation_rate: f64,
    pub max_organisms: usize,
    /// Fragmentation ratio above which defragmentation is attempted
    /// instead of (or before) reaping, when an ALLOCATE fails.
    pub defrag_threshold: f64,
    /// `None` (the default) means faults alone are never lethal — the
    /// reaper is the sole systemic killer (spec §7, §9 Open Question).
    pub max_errors: Option<u64>,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig { soup_size: 100_000, seed: 0, mutation_rate: 0.0, max_organisms: 64, defrag_threshold: 0.5, max_errors: None }
    }
}

/// Where to inject a genome at simulation start (or via a resume event).
pub struct Injection<'a> {
    pub addr: usize,
    pub genome: &'a [i32],
    pub name: Option<String>,
}

/// End-of-cycle observability counters (spec §4.7).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Stats {
    pub total_spawns: u64,
    pub deaths_error: u64,
    pub deaths_reaper: u64,
    pub mutations: u64,
    pub defrags: u64,
}

pub struct Simulator {
    config: SimConfig,
    soup: Soup,
    mem: MemoryManager,
    table: OrganismTable,
    reaper: Reaper,
    rng: DeterministicRng,
    cycle: u64,
    stats: Stats,
}

impl Simulator {
    pub fn new(config: SimConfig) -> Result<Self, SimError> {
        if config.soup_size == 0 {
            return Err(SimError::EmptySoup(config.soup_size));
        }
        let soup = Soup::new(config.soup_size);
        let mem = MemoryManager::new(config.soup_size);
        let rng = DeterministicRng::from_seed(config.seed);
        Ok(Simulator { config, soup, mem, table: OrganismTable::new(), reaper: Reaper::new(), rng, cycle: 0, stats: Stats::default() })
    }

    /// Reconstruct a simulator from saved checkpoint pieces (used by
    /// `checkpoint::load`). All invariants are assumed already validated
    /// by the caller.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        config: SimConfig,
        soup: Soup,
        mem: MemoryManager,
        table: OrganismTable,
        reaper: Reaper,
        rng: DeterministicRng,
        cycle: u64,
        stats: Stats,
    ) -> Self {
        Simulator { config, soup, mem, table, reaper, rng, cycle, stats }
    }

    pub fn config(&self) -> &SimConfig { &self.config }
    pub fn soup(&self) -> &Soup { &self.soup }
    pub fn mem(&self) -> &MemoryManager { &self.mem }
    pub fn table(&self) -> &OrganismTable { &self.table }
    pub fn reaper(&self) -> &Reaper { &self.reaper }
    pub fn rng(&self) -> &DeterministicRng { &self.rng }
    pub fn cycle(&self) -> u64 { self.cycle }
    pub fn stats(&self) -> Stats { self.stats }
    pub fn population(&self) -> usize { self.table.alive_count() }

    /// Place a genome into the soup and register it as a parentless
    /// organism, birth cycle = current cycle.
    pub fn inject(&mut self, injection: Injection<'_>) -> Result<u64, SimError> {
        if injection.genome.is_empty() {
            return Err(SimError::EmptyGenome);
        }
        let end = injection.addr + injection.genome.len();
        if end > self.soup.len() {
            return Err(SimError::InjectionOutOfBounds { addr: injection.addr, end, soup_size: self.soup.len() });
        }
        self.soup.load_words(injection.addr, injection.genome);
        let alloc_id = self.mem.mark_used(injection.addr, injection.genome.len());
        let id = self.table.reserve_id();
        self.table.insert(Organism {
            id,
            parent_id: None,
            birth_cycle: self.cycle,
            start_addr: injection.addr,
            size: injection.genome.len(),
            alloc_id,
            alive: true,
            state: CpuState::new(injection.addr),
            name: injection.name,
        });
        self.reaper.register(id, self.cycle);
        info!(organism_id = id, addr = injection.addr, size = injection.genome.len(), "injected organism");
        Ok(id)
    }

    /// Run one cycle with no debug recording; the common, hot path.
    pub fn step_cycle(&mut self) { self.step_cycle_inner(None); }

    /// Run one cycle, returning a [`Frame`] describing everything that
    /// happened. `trace_instructions` additionally emits one `Instruction`
    /// event per organism step — expensive, off by default.
    pub fn step_cycle_traced(&mut self, trace_instructions: bool) -> Frame {
        let mut recorder = FrameRecorder::new(self.cycle, trace_instructions);
        self.step_cycle_inner(Some(&mut recorder));
        recorder.finish(&self.soup, &self.table)
    }

    fn step_cycle_inner(&mut self, mut recorder: Option<&mut FrameRecorder>) {
        let ids = self.table.alive_ids_sorted();
        let mut alloc_pressure: Option<usize> = None;

        for id in ids {
            let alive = self.table.get(id).map(|o| o.alive).unwrap_or(false);
            if !alive {
                continue;
            }
            let mut cpu = self.table.get(id).unwrap().state.clone();
            let traced_opcode = recorder
                .as_deref()
                .filter(|r| r.trace_instructions())
                .and_then(|_| cpu.abs_ip(self.soup.len()))
                .and_then(|abs_ip| self.soup.read(abs_ip))
                .map(|word| (word as u32 >> 24) as u8);

            let mut handler = Handler {
                mem: &mut self.mem,
                table: &mut self.table,
                reaper: &mut self.reaper,
                cycle: self.cycle,
                organism_id: id,
                max_organisms: self.config.max_organisms,
                spawns: &mut self.stats.total_spawns,
                alloc_pressure: &mut alloc_pressure,
                local_events: Vec::new(),
            };

            let mut counting = MutationCounter { count: &mut self.stats.mutations, inner: recorder.as_deref_mut() };
            let observer: Option<&mut dyn vcpu::MutationObserver> = Some(&mut counting);
            let result = vcpu::step(&mut cpu, id, &mut self.soup, &mut handler, &mut self.rng, self.config.mutation_rate, self.cycle, observer);
            let local_events = handler.local_events;

            if let Some(rec) = recorder.as_deref_mut() {
                for event in local_events {
                    rec.push(event);
                }
                record_result(rec, id, &result);
                if let Some(opcode) = traced_opcode {
                    rec.push(Event::Instruction { organism_id: id, opcode });
                }
            }

            self.table.get_mut(id).unwrap().state = cpu;

            if let Some(threshold) = self.config.max_errors {
                let errors = self.table.get(id).unwrap().state.errors;
                if errors > threshold {
                    self.kill_by_error(id, recorder.as_deref_mut());
                }
            }
        }

        if let Some(required) = alloc_pressure {
            self.relieve_pressure(required, recorder.as_deref_mut());
        }

        self.cycle += 1;
    }

    fn kill_by_error(&mut self, id: u64, recorder: Option<&mut FrameRecorder>) {
        let org = self.table.get_mut(id).unwrap();
        org.alive = false;
        let (addr, size) = (org.start_addr, org.size);
        let pending = org.state.pending_alloc.take();
        self.mem.free(addr, size);
        if let Some(p) = pending {
            self.mem.free_by_id(p.addr, p.size, p.alloc_id);
        }
        self.reaper.unregister(id);
        self.stats.deaths_error += 1;
        warn!(organism_id = id, "killed: error threshold exceeded");
        if let Some(rec) = recorder {
            rec.push(Event::Death { organism_id: id, cause: DeathCause::ErrorThreshold });
        }
    }

    fn relieve_pressure(&mut self, required: usize, recorder: Option<&mut FrameRecorder>) {
        let stats = self.mem.stats();
        if should_defragment(stats, self.config.defrag_threshold, required) {
            let moved = defragment(&mut self.table, &mut self.mem, &mut self.soup);
            self.stats.defrags += 1;
            debug!(moved, required, "defragmented soup under allocation pressure");
        } else {
            let killed = self.reaper.reap_until_free(required, &mut self.table, &mut self.mem);
            self.stats.deaths_reaper += killed.len() as u64;
            if !killed.is_empty() {
                trace!(killed = killed.len(), required, "reaped to relieve allocation pressure");
            }
            if let Some(rec) = recorder {
                for id in killed {
                    rec.push(Event::Death { organism_id: id, cause: DeathCause::Reaped });
                }
            }
        }
    }

    pub fn mem_stats(&self) -> MemStats { self.mem.stats() }
}

/// Counts every mutation for `Stats` regardless of whether a debug frame
/// is being recorded, then forwards to the recorder (if any) so a traced
/// cycle also gets the event.
struct MutationCounter<'a> {
    count: &'a mut u64,
    inner: Option<&'a mut FrameRecorder>,
}

impl vcpu::MutationObserver for MutationCounter<'_> {
    fn on_mutation(&mut self, cycle: u64, organism_id: u64, src: usize, dst: usize, original: i32, mutated: i32) {
        *self.count += 1;
        if let Some(rec) = self.inner.as_deref_mut() {
            rec.on_mutation(cycle, organism_id, src, dst, original, mutated);
        }
    }
}

/// Bridges the scheduler's owned state to the [`SyscallHandler`] contract
/// `vcpu::step` needs, without requiring `step` to know about the
/// organism table or the reaper (spec §4.3).
struct Handler<'a> {
    mem: &'a mut MemoryManager,
    table: &'a mut OrganismTable,
    reaper: &'a mut Reaper,
    cycle: u64,
    organism_id: u64,
    max_organisms: usize,
    spawns: &'a mut u64,
    alloc_pressure: &'a mut Option<usize>,
    /// Spawn/allocation events, drained into the cycle's [`FrameRecorder`]
    /// (if any) once this handler's borrows of the scheduler's state end.
    local_events: Vec<Event>,
}

impl SyscallHandler for Handler<'_> {
    fn allocate(&mut self, size: usize) -> Option<(usize, AllocId)> {
        match self.mem.allocate(size) {
            Some(ok) => Some(ok),
            None => {
                *self.alloc_pressure = Some(self.alloc_pressure.map_or(size, |r| r.max(size)));
                self.local_events.push(Event::AllocationFailed { organism_id: self.organism_id, requested: size });
                None
            }
        }
    }

    fn free_by_id(&mut self, addr: usize, size: usize, id: AllocId) -> usize { self.mem.free_by_id(addr, size, id) }

    fn spawn(&mut self, parent_id: u64, addr: usize, size: usize, alloc_id: AllocId) -> bool {
        if self.table.alive_count() >= self.max_organisms {
            self.mem.free_by_id(addr, size, alloc_id);
            return false;
        }
        if !self.mem.owned_by(addr, size, alloc_id) {
            self.mem.free_by_id(addr, size, alloc_id);
            return false;
        }
        let id = self.table.reserve_id();
        self.table.insert(Organism {
            id,
            parent_id: Some(parent_id),
            birth_cycle: self.cycle,
            start_addr: addr,
            size,
            alloc_id,
            alive: true,
            state: CpuState::new(addr),
            name: None,
        });
        self.reaper.register(id, self.cycle);
        *self.spawns += 1;
        self.local_events.push(Event::Spawn { parent_id: Some(parent_id), child_id: id, addr, size });
        true
    }
}

fn record_result(recorder: &mut FrameRecorder, organism_id: u64, result: &ExecutionResult) {
    use crate::frame::ErrorKind;
    match result {
        ExecutionResult::ErrIpOutOfBounds => recorder.push(Event::Error { organism_id, kind: ErrorKind::IpOutOfBounds }),
        ExecutionResult::ErrUnknownOpcode => recorder.push(Event::Error { organism_id, kind: ErrorKind::UnknownOpcode }),
        ExecutionResult::ErrMemOutOfBounds => recorder.push(Event::Error { organism_id, kind: ErrorKind::MemOutOfBounds }),
        // AllocationFailed is emitted by the handler itself, which knows the requested size.
        ExecutionResult::AllocFailed
        | ExecutionResult::AllocOk
        | ExecutionResult::SpawnOk
        | ExecutionResult::SpawnFailed
        | ExecutionResult::Ok => {}
    }
}
