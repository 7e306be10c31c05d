//! `proteus` — the command-line front end over the simulation core.
//!
//! Thin by design: every subcommand parses its flags into a `SimConfig`
//! or a handful of primitives, calls straight into `proteus::*`, and
//! prints the result. No subcommand contains simulation logic of its
//! own.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use proteus::scheduler::{Injection, SimConfig};
use proteus::{disasm, frame, Simulator};

#[derive(Parser)]
#[command(name = "proteus", version, about = "A Tierra-style artificial-life simulator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a simulation for a number of cycles, optionally checkpointing.
    Run {
        #[arg(long, default_value_t = 100_000)]
        soup_size: usize,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[arg(long, default_value_t = 0.0)]
        mutation_rate: f64,
        #[arg(long, default_value_t = 64)]
        max_organisms: usize,
        #[arg(long, default_value_t = 0.5)]
        defrag_threshold: f64,
        /// Faults alone are never lethal when omitted.
        #[arg(long)]
        max_errors: Option<u64>,
        /// `addr:path`, repeatable. `path` is assembled if it has a `.s`
        /// or `.asm` extension, otherwise read as whitespace-separated
        /// decimal word literals (e.g. a prior `proteus assemble` output).
        #[arg(long = "inject", value_name = "ADDR:PATH")]
        injections: Vec<String>,
        #[arg(long, default_value_t = 1000)]
        cycles: u64,
        /// Write a checkpoint every N cycles (0 disables periodic checkpoints).
        #[arg(long, default_value_t = 0)]
        checkpoint_every: u64,
        #[arg(long)]
        checkpoint_out: Option<PathBuf>,
        #[arg(long)]
        trace: bool,
    },
    /// Assemble a textual program into genome words.
    Assemble {
        input: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Inspect or compare checkpoint files.
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
    /// Disassemble a region of a checkpoint's soup.
    Analyze {
        checkpoint: PathBuf,
        #[arg(long, default_value_t = 0)]
        addr: usize,
        #[arg(long, default_value_t = 64)]
        len: usize,
    },
    /// Print build and ISA version information.
    Info,
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Summarize a checkpoint: cycle, population, stats.
    Info { checkpoint: PathBuf },
    /// Structural diff between two checkpoints.
    Diff { a: PathBuf, b: PathBuf },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "proteus=info".into()))
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            soup_size,
            seed,
            mutation_rate,
            max_organisms,
            defrag_threshold,
            max_errors,
            injections,
            cycles,
            checkpoint_every,
            checkpoint_out,
            trace,
        } => run(
            soup_size,
            seed,
            mutation_rate,
            max_organisms,
            defrag_threshold,
            max_errors,
            injections,
            cycles,
            checkpoint_every,
            checkpoint_out,
            trace,
        ),
        Command::Assemble { input, output } => assemble_cmd(input, output),
        Command::Checkpoint { action } => match action {
            CheckpointAction::Info { checkpoint } => checkpoint_info(checkpoint),
            CheckpointAction::Diff { a, b } => checkpoint_diff(a, b),
        },
        Command::Analyze { checkpoint, addr, len } => analyze(checkpoint, addr, len),
        Command::Info => {
            println!("proteus {} (ISA v1.2)", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run(
    soup_size: usize,
    seed: u64,
    mutation_rate: f64,
    max_organisms: usize,
    defrag_threshold: f64,
    max_errors: Option<u64>,
    injections: Vec<String>,
    cycles: u64,
    checkpoint_every: u64,
    checkpoint_out: Option<PathBuf>,
    trace: bool,
) -> Result<()> {
    let config = SimConfig { soup_size, seed, mutation_rate, max_organisms, defrag_threshold, max_errors };
    let mut sim = Simulator::new(config).context("constructing simulator")?;

    if injections.is_empty() {
        bail!("at least one --inject <addr:path> is required to seed the soup");
    }
    for spec in &injections {
        let (addr_str, path_str) = spec.split_once(':').with_context(|| format!("malformed --inject {spec:?}, expected ADDR:PATH"))?;
        let addr: usize = addr_str.parse().with_context(|| format!("bad address in --inject {spec:?}"))?;
        let genome = load_genome(PathBuf::from(path_str))?;
        let id = sim.inject(Injection { addr, genome: &genome, name: None }).with_context(|| format!("injecting genome at {addr}"))?;
        info!(id, addr, size = genome.len(), "injected organism");
    }

    for cycle in 0..cycles {
        if trace {
            let frame = sim.step_cycle_traced(true);
            for event in &frame.events {
                trace_event(event);
            }
        } else {
            sim.step_cycle();
        }
        if checkpoint_every > 0 && (cycle + 1) % checkpoint_every == 0 {
            if let Some(path) = &checkpoint_out {
                write_checkpoint(&sim, path)?;
            }
        }
    }

    if let Some(path) = &checkpoint_out {
        write_checkpoint(&sim, path)?;
    }

    let stats = sim.stats();
    println!(
        "cycle={} population={} spawns={} deaths_error={} deaths_reaper={} mutations={} defrags={}",
        sim.cycle(),
        sim.population(),
        stats.total_spawns,
        stats.deaths_error,
        stats.deaths_reaper,
        stats.mutations,
        stats.defrags,
    );
    Ok(())
}

fn trace_event(event: &frame::Event) {
    use frame::Event::*;
    match event {
        Spawn { parent_id, child_id, addr, size } => info!(?parent_id, child_id, addr, size, "spawn"),
        Death { organism_id, cause } => info!(organism_id, ?cause, "death"),
        Mutation { organism_id, src, dst, .. } => info!(organism_id, src, dst, "mutation"),
        Instruction { organism_id, opcode } => info!(organism_id, opcode, "instruction"),
        Allocation { organism_id, addr, size } => info!(organism_id, addr, size, "allocation"),
        AllocationFailed { organism_id, requested } => info!(organism_id, requested, "allocation failed"),
        Error { organism_id, kind } => info!(organism_id, ?kind, "error"),
    }
}

fn load_genome(path: PathBuf) -> Result<Vec<i32>> {
    let text = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    if path.extension().is_some_and(|ext| ext == "s" || ext == "asm") {
        proteus::asm::assemble(&text).with_context(|| format!("assembling {}", path.display()))
    } else {
        text.split_whitespace()
            .map(|tok| tok.parse::<i32>().with_context(|| format!("bad word literal {tok:?} in {}", path.display())))
            .collect()
    }
}

fn write_checkpoint(sim: &Simulator, path: &PathBuf) -> Result<()> {
    let file = fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut out = BufWriter::new(file);
    proteus::save_checkpoint(sim, &mut out).context("writing checkpoint")?;
    out.flush()?;
    Ok(())
}

fn assemble_cmd(input: PathBuf, output: Option<PathBuf>) -> Result<()> {
    let text = fs::read_to_string(&input).with_context(|| format!("reading {}", input.display()))?;
    let words = proteus::asm::assemble(&text).with_context(|| format!("assembling {}", input.display()))?;
    match output {
        Some(path) => {
            let mut file = fs::File::create(&path).with_context(|| format!("creating {}", path.display()))?;
            for word in &words {
                writeln!(file, "{word}")?;
            }
        }
        None => {
            for word in &words {
                println!("{word}");
            }
        }
    }
    Ok(())
}

fn checkpoint_info(path: PathBuf) -> Result<()> {
    let mut file = fs::File::open(&path).with_context(|| format!("opening {}", path.display()))?;
    let sim = proteus::load_checkpoint(&mut file).with_context(|| format!("loading {}", path.display()))?;
    let stats = sim.stats();
    println!("checkpoint: {}", path.display());
    println!("  soup_size     = {}", sim.soup().len());
    println!("  cycle         = {}", sim.cycle());
    println!("  population    = {}", sim.population());
    println!("  total_spawns  = {}", stats.total_spawns);
    println!("  deaths_error  = {}", stats.deaths_error);
    println!("  deaths_reaper = {}", stats.deaths_reaper);
    println!("  mutations     = {}", stats.mutations);
    println!("  defrags       = {}", stats.defrags);
    Ok(())
}

fn checkpoint_diff(a: PathBuf, b: PathBuf) -> Result<()> {
    let mut fa = fs::File::open(&a).with_context(|| format!("opening {}", a.display()))?;
    let mut fb = fs::File::open(&b).with_context(|| format!("opening {}", b.display()))?;
    let sim_a = proteus::load_checkpoint(&mut fa).with_context(|| format!("loading {}", a.display()))?;
    let sim_b = proteus::load_checkpoint(&mut fb).with_context(|| format!("loading {}", b.display()))?;

    let (sa, sb) = (sim_a.stats(), sim_b.stats());
    println!("cycle:         {} -> {}", sim_a.cycle(), sim_b.cycle());
    println!("population:    {} -> {}", sim_a.population(), sim_b.population());
    println!("total_spawns:  {} -> {} ({:+})", sa.total_spawns, sb.total_spawns, sb.total_spawns as i64 - sa.total_spawns as i64);
    println!("deaths_error:  {} -> {} ({:+})", sa.deaths_error, sb.deaths_error, sb.deaths_error as i64 - sa.deaths_error as i64);
    println!("deaths_reaper: {} -> {} ({:+})", sa.deaths_reaper, sb.deaths_reaper, sb.deaths_reaper as i64 - sa.deaths_reaper as i64);
    println!("mutations:     {} -> {} ({:+})", sa.mutations, sb.mutations, sb.mutations as i64 - sa.mutations as i64);
    println!("defrags:       {} -> {} ({:+})", sa.defrags, sb.defrags, sb.defrags as i64 - sa.defrags as i64);

    let ids_a: std::collections::BTreeSet<u64> = sim_a.table().alive_ids_sorted().into_iter().collect();
    let ids_b: std::collections::BTreeSet<u64> = sim_b.table().alive_ids_sorted().into_iter().collect();
    for id in ids_a.difference(&ids_b) {
        println!("  organism {id}: present -> gone");
    }
    for id in ids_b.difference(&ids_a) {
        println!("  organism {id}: new -> present");
    }
    Ok(())
}

fn analyze(path: PathBuf, addr: usize, len: usize) -> Result<()> {
    let mut file = fs::File::open(&path).with_context(|| format!("opening {}", path.display()))?;
    let sim = proteus::load_checkpoint(&mut file).with_context(|| format!("loading {}", path.display()))?;
    let end = (addr + len).min(sim.soup().len());
    if addr >= sim.soup().len() {
        bail!("address {addr} is outside a soup of size {}", sim.soup().len());
    }
    let words: Vec<i32> = (addr..end).map(|a| sim.soup().read(a).unwrap()).collect();
    let owners: Vec<Option<u32>> = (0..sim.soup().len()).map(|a| sim.mem().owner_of(a)).collect();
    let lines = disasm::disassemble(addr, &words, Some(&owners));
    print!("{}", disasm::format_listing(&lines));
    Ok(())
}
