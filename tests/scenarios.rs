//! End-to-end scenarios exercising the whole engine through the public
//! `Simulator` API, one per concrete case spec'd for the system.

use proteus::scheduler::{Injection, SimConfig};
use proteus::Simulator;

/// A minimal Tierra-style self-replicator, 14 words: GETADDR its own base,
/// ALLOCATE a same-sized child span, COPY itself into it cell by cell,
/// SPAWN the child, then loop back to ALLOCATE the next generation.
const ADAM_SRC: &str = "
    GETADDR r0
    MOVI r1, 14
alloc:
    ALLOCATE r1, r2
    MOVI r3, 0
    MOVI r6, 14
loop:
    MOV r4, r0
    ADD r4, r3
    MOV r5, r2
    ADD r5, r3
    COPY r4, r5
    INC r3
    JLT r3, r6, loop
    SPAWN r2, r1
    JMP alloc
";

fn adam_genome() -> Vec<i32> {
    let words = proteus::asm::assemble(ADAM_SRC).expect("ancestor genome must assemble");
    assert_eq!(words.len(), 14);
    words
}

fn mem_conservation_holds(sim: &Simulator) {
    let n = sim.soup().len();
    let owned = (0..n).filter(|&a| sim.mem().owner_of(a).is_some()).count();
    let free = sim.mem_stats().free_cells;
    assert_eq!(owned + free, n, "every cell is either owned or free, never both or neither");
}

fn ownership_spans_are_disjoint_and_self_consistent(sim: &Simulator) {
    let mut seen = vec![false; sim.soup().len()];
    for org in sim.table().iter_alive() {
        for cell in org.span() {
            assert_eq!(sim.mem().owner_of(cell), Some(org.alloc_id), "cell {cell} not owned by its organism's alloc_id");
            assert!(!seen[cell], "cell {cell} claimed by more than one alive organism");
            seen[cell] = true;
        }
    }
}

#[test]
fn ancestor_replicates() {
    let mut sim = Simulator::new(SimConfig {
        soup_size: 1024,
        seed: 42,
        mutation_rate: 0.0,
        max_organisms: 8,
        ..Default::default()
    })
    .unwrap();
    let genome = adam_genome();
    sim.inject(Injection { addr: 0, genome: &genome, name: Some("adam".into()) }).unwrap();

    let mut reached_two_by = None;
    for cycle in 1..=500u64 {
        sim.step_cycle();
        if reached_two_by.is_none() && sim.population() >= 2 {
            reached_two_by = Some(cycle);
        }
    }

    assert!(reached_two_by.is_some_and(|c| c <= 100), "population should reach >= 2 within the first 100 cycles, got {reached_two_by:?}");
    assert_eq!(sim.population(), 8, "population cap should be saturated by cycle 500");
    assert!(sim.stats().deaths_reaper >= 1, "the reaper must have culled at least one organism by cycle 500");

    mem_conservation_holds(&sim);
    ownership_spans_are_disjoint_and_self_consistent(&sim);

    for org in sim.table().iter_alive() {
        let span: Vec<i32> = org.span().map(|a| sim.soup().read(a).unwrap()).collect();
        assert_eq!(span, genome, "organism {} should be a bitwise-identical copy of the ancestor under zero mutation", org.id);
    }
}

#[test]
fn mutation_rate_positive_produces_divergent_offspring() {
    let mut sim = Simulator::new(SimConfig {
        soup_size: 1024,
        seed: 42,
        mutation_rate: 0.5,
        max_organisms: 8,
        ..Default::default()
    })
    .unwrap();
    let genome = adam_genome();
    sim.inject(Injection { addr: 0, genome: &genome, name: Some("adam".into()) }).unwrap();

    let mut copy_ops = 0u64;
    for _ in 0..500 {
        let frame = sim.step_cycle_traced(true);
        copy_ops += frame
            .events
            .iter()
            .filter(|e| matches!(e, proteus::Event::Instruction { opcode, .. } if *opcode == proteus::isa::opcode::COPY))
            .count() as u64;
    }

    let mutations = sim.stats().mutations;
    assert!(mutations >= 1, "with mutation_rate 0.5 at least one COPY should have mutated in 500 cycles");

    let any_diverged = sim.table().iter_alive().any(|org| {
        let span: Vec<i32> = org.span().map(|a| sim.soup().read(a).unwrap()).collect();
        span != genome
    });
    assert!(any_diverged, "at least one surviving genome should differ from the ancestor by cycle 500");

    // mutations ~ Binomial(copy_ops, 0.5); check within a generous 3-sigma band.
    if copy_ops > 0 {
        let p = 0.5f64;
        let expected = copy_ops as f64 * p;
        let sigma = (copy_ops as f64 * p * (1.0 - p)).sqrt();
        let band = 3.0 * sigma.max(1.0);
        assert!(
            (mutations as f64 - expected).abs() <= band,
            "mutations {mutations} too far from expected {expected} (+/- {band}) over {copy_ops} COPY ops"
        );
    }
}

#[test]
fn fragmentation_pressure_triggers_defrag_or_reaping() {
    // A soup too small to hold `max_organisms` bodies plus their pending
    // children at once forces an ALLOCATE failure well before 5000 cycles,
    // which is exactly what drives relieve_pressure's defrag-or-reap choice.
    let mut sim = Simulator::new(SimConfig {
        soup_size: 128,
        seed: 7,
        mutation_rate: 0.0,
        max_organisms: 16,
        defrag_threshold: 0.5,
        ..Default::default()
    })
    .unwrap();
    let genome = adam_genome();
    sim.inject(Injection { addr: 0, genome: &genome, name: Some("adam".into()) }).unwrap();

    for _ in 0..5000 {
        sim.step_cycle();
    }

    let stats = sim.stats();
    assert!(
        stats.defrags > 0 || stats.deaths_reaper > 0,
        "a soup this small relative to max_organisms should have hit allocation pressure at least once"
    );

    mem_conservation_holds(&sim);
    ownership_spans_are_disjoint_and_self_consistent(&sim);
}

#[test]
fn checkpoint_replay_is_deterministic() {
    let make = || {
        let mut sim = Simulator::new(SimConfig {
            soup_size: 2048,
            seed: 12345,
            mutation_rate: 0.3,
            max_organisms: 12,
            ..Default::default()
        })
        .unwrap();
        let genome = adam_genome();
        sim.inject(Injection { addr: 0, genome: &genome, name: Some("adam".into()) }).unwrap();
        sim
    };

    let mut base = make();
    for _ in 0..1000 {
        base.step_cycle();
    }
    let mut checkpoint_bytes = Vec::new();
    proteus::save_checkpoint(&base, &mut checkpoint_bytes).unwrap();

    let run_from_checkpoint = |bytes: &[u8]| {
        let mut sim = proteus::load_checkpoint(&mut &bytes[..]).unwrap();
        for _ in 0..1000 {
            sim.step_cycle();
        }
        let mut out = Vec::new();
        proteus::save_checkpoint(&sim, &mut out).unwrap();
        out
    };

    let first = run_from_checkpoint(&checkpoint_bytes);
    let second = run_from_checkpoint(&checkpoint_bytes);
    assert_eq!(first, second, "replaying the same checkpoint for the same number of cycles must be byte-identical");
}
