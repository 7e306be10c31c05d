//! Single-step virtual CPU (spec §4.2).
//!
//! `step` is a pure function over explicit state: one call consumes at most
//! one instruction. There is no stack-per-organism and no coroutine — this
//! is what makes checkpointing the whole simulation trivial (spec §9).
//! ALLOCATE/SPAWN are the only instructions that reach outside the
//! organism's own state; they do so through [`SyscallHandler`], which the
//! scheduler implements so it can delegate to the memory manager and
//! register new organisms with the table and reaper (spec §2).

use crate::{
    cpu::{CpuState, PendingAlloc},
    isa::{self, Instruction},
    mem::AllocId,
    rng::DeterministicRng,
    soup::Soup,
};

/// Outcome of one `step` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionResult {
    Ok,
    ErrIpOutOfBounds,
    ErrUnknownOpcode,
    ErrMemOutOfBounds,
    AllocOk,
    AllocFailed,
    SpawnOk,
    SpawnFailed,
}

/// Delegate for ALLOCATE/SPAWN. Implemented by the scheduler, which alone
/// has the memory manager, organism table and reaper needed to fulfil
/// these requests (spec §2, §4.3).
pub trait SyscallHandler {
    /// Attempt to allocate `size` cells. Returns the base address and the
    /// fresh `alloc_id` on success.
    fn allocate(&mut self, size: usize) -> Option<(usize, AllocId)>;

    /// Release only the cells in `[addr, addr+size)` still owned by `id`.
    fn free_by_id(&mut self, addr: usize, size: usize, id: AllocId) -> usize;

    /// Materialise a new organism at `[addr, addr+size)` owned by
    /// `alloc_id`, parented by `parent_id`. Returns whether it succeeded;
    /// on either outcome the caller clears its `pending_alloc`.
    fn spawn(&mut self, parent_id: u64, addr: usize, size: usize, alloc_id: AllocId) -> bool;
}

/// Notified of every COPY-induced bit mutation, with enough context to
/// drive a debug frame or a mutation-rate sanity check.
pub trait MutationObserver {
    fn on_mutation(&mut self, cycle: u64, organism_id: u64, src: usize, dst: usize, original: i32, mutated: i32);
}

#[allow(clippy::too_many_arguments)]
pub fn step(
    cpu: &mut CpuState,
    organism_id: u64,
    soup: &mut Soup,
    handler: &mut dyn SyscallHandler,
    rng: &mut DeterministicRng,
    mutation_rate: f64,
    cycle: u64,
    mut observer: Option<&mut dyn MutationObserver>,
) -> ExecutionResult {
    cpu.age += 1;

    let abs_ip = match cpu.abs_ip(soup.len()) {
        Some(addr) => addr,
        None => {
            cpu.errors += 1;
            return ExecutionResult::ErrIpOutOfBounds;
        }
    };

    let word = soup.read(abs_ip).expect("abs_ip already bounds-checked") as u32;
    let instr = match isa::decode(word) {
        Ok(instr) => instr,
        Err(_unknown) => {
            cpu.errors += 1;
            cpu.ip += 1;
            return ExecutionResult::ErrUnknownOpcode;
        }
    };

    use Instruction::*;
    match instr {
        Nop => {
            cpu.ip += 1;
            ExecutionResult::Ok
        }
        Mov { rd, rs } => {
            cpu.set_reg(rd, cpu.reg(rs));
            cpu.ip += 1;
            ExecutionResult::Ok
        }
        Movi { rd, imm } => {
            cpu.set_reg(rd, imm as i32);
            cpu.ip += 1;
            ExecutionResult::Ok
        }
        GetAddr { rd } => {
            cpu.set_reg(rd, cpu.start_addr as i32);
            cpu.ip += 1;
            ExecutionResult::Ok
        }
        Add { ra, rb } => {
            cpu.set_reg(ra, cpu.reg(ra).wrapping_add(cpu.reg(rb)));
            cpu.ip += 1;
            ExecutionResult::Ok
        }
        Sub { ra, rb } => {
            cpu.set_reg(ra, cpu.reg(ra).wrapping_sub(cpu.reg(rb)));
            cpu.ip += 1;
            ExecutionResult::Ok
        }
        Inc { ra } => {
            cpu.set_reg(ra, cpu.reg(ra).wrapping_add(1));
            cpu.ip += 1;
            ExecutionResult::Ok
        }
        Dec { ra } => {
            cpu.set_reg(ra, cpu.reg(ra).wrapping_sub(1));
            cpu.ip += 1;
            ExecutionResult::Ok
        }
        Load { rd, roff } => {
            let result = match resolve_relative(cpu, soup, cpu.reg(roff)) {
                Some(addr) => {
                    cpu.set_reg(rd, soup.read(addr).expect("checked"));
                    ExecutionResult::Ok
                }
                None => {
                    cpu.errors += 1;
                    ExecutionResult::ErrMemOutOfBounds
                }
            };
            cpu.ip += 1;
            result
        }
        Store { roff, rs } => {
            let value = cpu.reg(rs);
            let result = match resolve_relative(cpu, soup, cpu.reg(roff)) {
                Some(addr) => {
                    soup.write(addr, value);
                    ExecutionResult::Ok
                }
                None => {
                    cpu.errors += 1;
                    ExecutionResult::ErrMemOutOfBounds
                }
            };
            cpu.ip += 1;
            result
        }
        Jmp { offset } => {
            cpu.ip += 1;
            cpu.ip += offset as i64;
            ExecutionResult::Ok
        }
        Jmpz { rcond, offset } => {
            cpu.ip += 1;
            if cpu.reg(rcond) == 0 {
                cpu.ip += offset as i64;
            }
            ExecutionResult::Ok
        }
        Jlt { ra, rb, offset } => {
            cpu.ip += 1;
            if cpu.reg(ra) < cpu.reg(rb) {
                cpu.ip += offset as i64;
            }
            ExecutionResult::Ok
        }
        Copy { rs, rd } => {
            let result = exec_copy(cpu, soup, rng, mutation_rate, cycle, organism_id, rs, rd, &mut observer);
            cpu.ip += 1;
            result
        }
        Allocate { rsize, raddr } => {
            let result = exec_allocate(cpu, handler, rsize, raddr);
            cpu.ip += 1;
            result
        }
        Spawn { raddr, rsize } => {
            let result = exec_spawn(cpu, organism_id, soup.len(), handler, raddr, rsize);
            cpu.ip += 1;
            result
        }
        Search { rs, rt, rl, rf } => {
            exec_search(cpu, soup, rs, rt, rl, rf);
            cpu.ip += 1;
            ExecutionResult::Ok
        }
    }
}

/// `LOAD`/`STORE` address a cell *relative* to the organism's own base;
/// the resulting absolute address is checked against the whole soup, not
/// the organism's own span — this is the mechanism that allows an
/// organism to read or write anywhere, enabling parasitism (spec §4.2).
fn resolve_relative(cpu: &CpuState, soup: &Soup, roff: i32) -> Option<usize> {
    let addr = cpu.start_addr as i64 + roff as i64;
    if addr < 0 || addr as u64 >= soup.len() as u64 { None } else { Some(addr as usize) }
}

#[allow(clippy::too_many_arguments)]
#[allow(clippy::too_many_arguments)]
fn exec_copy(
    cpu: &mut CpuState,
    soup: &mut Soup,
    rng: &mut DeterministicRng,
    mutation_rate: f64,
    cycle: u64,
    organism_id: u64,
    rs: u8,
    rd: u8,
    observer: &mut Option<&mut dyn MutationObserver>,
) -> ExecutionResult {
    let src = cpu.reg(rs);
    let dst = cpu.reg(rd);
    if src < 0 || dst < 0 || src as u64 >= soup.len() as u64 || dst as u64 >= soup.len() as u64 {
        cpu.errors += 1;
        return ExecutionResult::ErrMemOutOfBounds;
    }
    let (src, dst) = (src as usize, dst as usize);
    let original = soup.read(src).expect("checked");
    let mutated = if rng.roll_mutation(mutation_rate) {
        let bit = rng.bit_index();
        let value = original ^ (1i32 << bit);
        if let Some(obs) = observer {
            obs.on_mutation(cycle, organism_id, src, dst, original, value);
        }
        value
    } else {
        original
    };
    soup.write(dst, mutated);
    ExecutionResult::Ok
}

fn exec_allocate(cpu: &mut CpuState, handler: &mut dyn SyscallHandler, rsize: u8, raddr: u8) -> ExecutionResult {
    if let Some(prior) = cpu.pending_alloc.take() {
        handler.free_by_id(prior.addr, prior.size, prior.alloc_id);
    }
    let size = cpu.reg(rsize);
    let size = if size <= 0 { 0 } else { size as usize };
    match handler.allocate(size) {
        Some((base, alloc_id)) => {
            cpu.pending_alloc = Some(PendingAlloc { addr: base, size, alloc_id });
            cpu.set_reg(raddr, base as i32);
            ExecutionResult::AllocOk
        }
        None => {
            cpu.set_reg(raddr, -1);
            ExecutionResult::AllocFailed
        }
    }
}

fn exec_spawn(
    cpu: &mut CpuState,
    organism_id: u64,
    soup_len: usize,
    handler: &mut dyn SyscallHandler,
    raddr: u8,
    rsize: u8,
) -> ExecutionResult {
    let pending = cpu.pending_alloc.take();
    let addr = cpu.reg(raddr);
    let size = cpu.reg(rsize);

    let span_ok = addr >= 0 && size > 0 && (addr as u64 + size as u64) <= soup_len as u64;

    let ok = match (span_ok, pending) {
        (true, Some(p)) => handler.spawn(organism_id, addr as usize, size as usize, p.alloc_id),
        _ => false,
    };
    if ok { ExecutionResult::SpawnOk } else { ExecutionResult::SpawnFailed }
}

fn exec_search(cpu: &mut CpuState, soup: &Soup, rs: u8, rt: u8, rl: u8, rf: u8) {
    let start = cpu.reg(rs).max(0) as usize;
    let tmpl_addr = cpu.reg(rt);
    let tmpl_len = cpu.reg(rl);

    let found = (|| {
        if tmpl_len <= 0 {
            return -1;
        }
        let tmpl_len = tmpl_len as usize;
        if tmpl_addr < 0 || tmpl_len > soup.len() {
            return -1;
        }
        let tmpl_addr = tmpl_addr as usize;
        if tmpl_addr + tmpl_len > soup.len() {
            return -1;
        }
        let n = soup.len();
        if tmpl_len > n {
            return -1;
        }
        let limit = n - tmpl_len;
        let haystack = soup.as_slice();
        let template = &haystack[tmpl_addr..tmpl_addr + tmpl_len];
        let mut pos = start;
        while pos <= limit {
            if &haystack[pos..pos + tmpl_len] == template {
                return pos as i32;
            }
            pos += 1;
        }
        -1
    })();

    cpu.set_reg(rf, found);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHandler;
    impl SyscallHandler for NullHandler {
        fn allocate(&mut self, _size: usize) -> Option<(usize, AllocId)> { None }
        fn free_by_id(&mut self, _addr: usize, _size: usize, _id: AllocId) -> usize { 0 }
        fn spawn(&mut self, _parent_id: u64, _addr: usize, _size: usize, _alloc_id: AllocId) -> bool { false }
    }

    fn run_one(cpu: &mut CpuState, soup: &mut Soup, word: i32) -> ExecutionResult {
        soup.write(cpu.abs_ip(soup.len()).unwrap(), word);
        let mut rng = DeterministicRng::from_seed(0);
        step(cpu, 0, soup, &mut NullHandler, &mut rng, 0.0, 0, None)
    }

    #[test]
    fn ip_out_of_bounds_does_not_advance_and_counts_error() {
        let mut soup = Soup::new(4);
        let mut cpu = CpuState::new(10);
        let mut rng = DeterministicRng::from_seed(0);
        let result = step(&mut cpu, 0, &mut soup, &mut NullHandler, &mut rng, 0.0, 0, None);
        assert_eq!(result, ExecutionResult::ErrIpOutOfBounds);
        assert_eq!(cpu.errors, 1);
        assert_eq!(cpu.ip, 0);
        assert_eq!(cpu.age, 1, "age increments even on a bounds fault");
    }

    #[test]
    fn unknown_opcode_still_advances_ip() {
        let mut soup = Soup::new(4);
        let mut cpu = CpuState::new(0);
        let word = (0xFFu32 << 24) as i32;
        let result = run_one(&mut cpu, &mut soup, word);
        assert_eq!(result, ExecutionResult::ErrUnknownOpcode);
        assert_eq!(cpu.errors, 1);
        assert_eq!(cpu.ip, 1);
    }

    #[test]
    fn jmp_minus_one_loops_to_self() {
        let mut soup = Soup::new(4);
        let mut cpu = CpuState::new(0);
        let word = isa::encode(&Instruction::Jmp { offset: -1 }) as i32;
        let result = run_one(&mut cpu, &mut soup, word);
        assert_eq!(result, ExecutionResult::Ok);
        assert_eq!(cpu.ip, 0);
    }

    #[test]
    fn jmp_zero_falls_through() {
        let mut soup = Soup::new(4);
        let mut cpu = CpuState::new(0);
        let word = isa::encode(&Instruction::Jmp { offset: 0 }) as i32;
        let result = run_one(&mut cpu, &mut soup, word);
        assert_eq!(result, ExecutionResult::Ok);
        assert_eq!(cpu.ip, 1);
    }

    #[test]
    fn copy_src_equals_dst_is_a_no_op_without_mutation() {
        let mut soup = Soup::new(8);
        soup.write(5, 99);
        let mut cpu = CpuState::new(0);
        cpu.set_reg(0, 5);
        cpu.set_reg(1, 5);
        let word = isa::encode(&Instruction::Copy { rs: 0, rd: 1 }) as i32;
        let result = run_one(&mut cpu, &mut soup, word);
        assert_eq!(result, ExecutionResult::Ok);
        assert_eq!(soup.read(5), Some(99));
    }

    #[test]
    fn load_store_are_bounds_checked_against_whole_soup_not_own_span() {
        let mut soup = Soup::new(8);
        let mut cpu = CpuState::new(0);
        cpu.set_reg(1, 20); // relative offset far outside the soup
        let word = isa::encode(&Instruction::Load { rd: 0, roff: 1 }) as i32;
        let result = run_one(&mut cpu, &mut soup, word);
        assert_eq!(result, ExecutionResult::ErrMemOutOfBounds);
        assert_eq!(cpu.errors, 1);
        assert_eq!(cpu.ip, 1, "bounds errors still advance ip");
    }

    #[test]
    fn search_with_zero_length_returns_negative_one() {
        let mut soup = Soup::new(8);
        let mut cpu = CpuState::new(0);
        cpu.set_reg(2, 0); // rl = 0
        let word = isa::encode(&Instruction::Search { rs: 0, rt: 1, rl: 2, rf: 3 }) as i32;
        let result = run_one(&mut cpu, &mut soup, word);
        assert_eq!(result, ExecutionResult::Ok);
        assert_eq!(cpu.reg(3), -1);
    }

    #[test]
    fn allocate_size_over_n_fails() {
        struct AlwaysFull;
        impl SyscallHandler for AlwaysFull {
            fn allocate(&mut self, _size: usize) -> Option<(usize, AllocId)> { None }
            fn free_by_id(&mut self, _a: usize, _s: usize, _i: AllocId) -> usize { 0 }
            fn spawn(&mut self, _p: u64, _a: usize, _s: usize, _i: AllocId) -> bool { false }
        }
        let mut soup = Soup::new(8);
        let mut cpu = CpuState::new(0);
        cpu.set_reg(0, 1000);
        let word = isa::encode(&Instruction::Allocate { rsize: 0, raddr: 1 }) as i32;
        soup.write(0, word);
        let mut rng = DeterministicRng::from_seed(0);
        let result = step(&mut cpu, 0, &mut soup, &mut AlwaysFull, &mut rng, 0.0, 0, None);
        assert_eq!(result, ExecutionResult::AllocFailed);
        assert_eq!(cpu.reg(1), -1);
    }
}
