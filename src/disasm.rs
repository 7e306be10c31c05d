//! Disassembler — read-only pretty-printer for `analyze`/`info` and for
//! rendering a [`crate::frame::Frame`] (spec §6).
//!
//! Never feeds back into execution; it only renders. Unknown opcodes
//! fall back to a `.word` line rather than erroring, so a mutated,
//! partially-nonsense genome still disassembles completely.

use std::fmt::Write as _;

use crate::isa::{self, Instruction};
use crate::mem::AllocId;

/// One decoded (or raw) line of a disassembly listing.
pub struct Line {
    pub addr: usize,
    pub raw: u32,
    pub owner: Option<AllocId>,
    pub text: String,
}

/// Disassemble `words` (taken from a soup slice starting at `base`),
/// tagging each line with its owning `alloc_id` if `owners` is given.
pub fn disassemble(base: usize, words: &[i32], owners: Option<&[Option<AllocId>]>) -> Vec<Line> {
    words
        .iter()
        .enumerate()
        .map(|(offset, &word)| {
            let addr = base + offset;
            let raw = word as u32;
            let owner = owners.and_then(|o| o.get(addr).copied().flatten());
            let text = match isa::decode(raw) {
                Ok(instr) => render(&instr),
                Err(_) => format!(".word {raw:#010x}"),
            };
            Line { addr, raw, owner, text }
        })
        .collect()
}

/// Render a single decoded instruction in assembler-compatible syntax.
pub fn render(instr: &Instruction) -> String {
    use Instruction::*;
    match *instr {
        Nop => "NOP".to_string(),
        Mov { rd, rs } => format!("MOV r{rd}, r{rs}"),
        Movi { rd, imm } => format!("MOVI r{rd}, {imm}"),
        GetAddr { rd } => format!("GETADDR r{rd}"),
        Add { ra, rb } => format!("ADD r{ra}, r{rb}"),
        Sub { ra, rb } => format!("SUB r{ra}, r{rb}"),
        Inc { ra } => format!("INC r{ra}"),
        Dec { ra } => format!("DEC r{ra}"),
        Load { rd, roff } => format!("LOAD r{rd}, r{roff}"),
        Store { roff, rs } => format!("STORE r{roff}, r{rs}"),
        Jmp { offset } => format!("JMP {offset}"),
        Jmpz { rcond, offset } => format!("JMPZ r{rcond}, {offset}"),
        Jlt { ra, rb, offset } => format!("JLT r{ra}, r{rb}, {offset}"),
        Copy { rs, rd } => format!("COPY r{rs}, r{rd}"),
        Allocate { rsize, raddr } => format!("ALLOCATE r{rsize}, r{raddr}"),
        Spawn { raddr, rsize } => format!("SPAWN r{raddr}, r{rsize}"),
        Search { rs, rt, rl, rf } => format!("SEARCH r{rs}, r{rt}, r{rl}, r{rf}"),
    }
}

/// Render a full listing as `addr: raw  mnemonic  [owner=id]` lines, the
/// format the `analyze` and `checkpoint info` CLI subcommands print.
pub fn format_listing(lines: &[Line]) -> String {
    let mut out = String::new();
    for line in lines {
        let _ = write!(out, "{:>8}: {:#010x}  {}", line.addr, line.raw, line.text);
        if let Some(id) = line.owner {
            let _ = write!(out, "  [owner={id}]");
        }
        out.push('\n');
    }
    out
}
