//! Two-pass textual assembler — turns ISA-v1.2 mnemonics into genome
//! words (spec §6).
//!
//! Pass one walks the source once, assigning each instruction or `.word`
//! line the next line-relative address and recording label definitions.
//! Pass two re-walks the same lines and encodes each one, resolving any
//! label operand against the addresses pass one collected. Splitting
//! operand lines this way (rather than threading one shared table
//! through a single pass) mirrors the line-oriented parsing the teacher
//! uses for its CSV selector files, adapted here to assembly source
//! instead of comma-separated records.

use thiserror::Error;

use crate::isa::{self, Instruction};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssembleError {
    #[error("line {line}: unknown mnemonic {mnemonic:?}")]
    UnknownMnemonic { line: usize, mnemonic: String },
    #[error("line {line}: {mnemonic} expects {expected} operand(s), got {got}")]
    WrongOperandCount { line: usize, mnemonic: String, expected: usize, got: usize },
    #[error("line {line}: register operand {operand:?} is out of range 0..=7")]
    RegisterOutOfRange { line: usize, operand: String },
    #[error("line {line}: operand {operand:?} is not a valid register or number")]
    BadOperand { line: usize, operand: String },
    #[error("line {line}: immediate {value} does not fit in an unsigned 21-bit field (0..={max})", max = (1u32 << 21) - 1)]
    ImmediateOutOfRange { line: usize, value: i64 },
    #[error("line {line}: jump offset {value} does not fit in a signed 18-bit field (-131072..=131071)")]
    OffsetOutOfRange { line: usize, value: i64 },
    #[error("line {line}: undefined label {label:?}")]
    UnknownLabel { line: usize, label: String },
    #[error("line {line}: label {label:?} is already defined at an earlier line")]
    DuplicateLabel { line: usize, label: String },
    #[error("line {line}: .word operand {operand:?} is not a valid hex or decimal literal")]
    BadWordLiteral { line: usize, operand: String },
}

/// Assemble complete source text into a genome (a flat word array ready
/// for injection into the soup).
pub fn assemble(source: &str) -> Result<Vec<i32>, AssembleError> {
    let lines: Vec<ParsedLine> = strip_and_split(source);

    let mut labels = std::collections::HashMap::new();
    let mut addr = 0usize;
    for pl in &lines {
        if let Some(label) = &pl.label {
            if labels.insert(label.clone(), addr).is_some() {
                return Err(AssembleError::DuplicateLabel { line: pl.line, label: label.clone() });
            }
        }
        if pl.body.is_some() {
            addr += 1;
        }
    }

    let mut words = Vec::with_capacity(addr);
    for pl in &lines {
        let Some(body) = &pl.body else { continue };
        let current_addr = words.len();
        words.push(encode_line(pl.line, body, current_addr, &labels)?);
    }
    Ok(words)
}

struct ParsedLine {
    line: usize,
    label: Option<String>,
    /// `mnemonic` plus raw operand tokens; `None` for comment/blank lines.
    body: Option<(String, Vec<String>)>,
}

fn strip_and_split(source: &str) -> Vec<ParsedLine> {
    let mut out = Vec::new();
    for (idx, raw) in source.lines().enumerate() {
        let line = idx + 1;
        let code = match raw.find(';') {
            Some(pos) => &raw[..pos],
            None => raw,
        };
        let code = code.trim();
        if code.is_empty() {
            out.push(ParsedLine { line, label: None, body: None });
            continue;
        }

        let (label, rest) = match code.split_once(':') {
            Some((lbl, rest)) => (Some(lbl.trim().to_string()), rest.trim()),
            None => (None, code),
        };

        if rest.is_empty() {
            out.push(ParsedLine { line, label, body: None });
            continue;
        }

        let mut tokens = rest.split(|c: char| c.is_whitespace() || c == ',').filter(|t| !t.is_empty());
        let mnemonic = tokens.next().unwrap().to_ascii_uppercase();
        let operands: Vec<String> = tokens.map(|t| t.to_string()).collect();
        out.push(ParsedLine { line, label, body: Some((mnemonic, operands)) });
    }
    out
}

fn encode_line(
    line: usize,
    (mnemonic, operands): &(String, Vec<String>),
    current_addr: usize,
    labels: &std::collections::HashMap<String, usize>,
) -> Result<i32, AssembleError> {
    if mnemonic == ".WORD" {
        expect_operands(line, mnemonic, operands, 1)?;
        return parse_word_literal(line, &operands[0]);
    }

    let reg = |idx: usize| -> Result<u8, AssembleError> { parse_register(line, &operands[idx]) };
    let jump_target = |idx: usize| -> Result<i32, AssembleError> { resolve_offset(line, &operands[idx], current_addr, labels) };

    let instr = match mnemonic.as_str() {
        "NOP" => {
            expect_operands(line, mnemonic, operands, 0)?;
            Instruction::Nop
        }
        "MOV" => {
            expect_operands(line, mnemonic, operands, 2)?;
            Instruction::Mov { rd: reg(0)?, rs: reg(1)? }
        }
        "MOVI" => {
            expect_operands(line, mnemonic, operands, 2)?;
            Instruction::Movi { rd: reg(0)?, imm: parse_imm21(line, &operands[1])? }
        }
        "GETADDR" => {
            expect_operands(line, mnemonic, operands, 1)?;
            Instruction::GetAddr { rd: reg(0)? }
        }
        "ADD" => {
            expect_operands(line, mnemonic, operands, 2)?;
            Instruction::Add { ra: reg(0)?, rb: reg(1)? }
        }
        "SUB" => {
            expect_operands(line, mnemonic, operands, 2)?;
            Instruction::Sub { ra: reg(0)?, rb: reg(1)? }
        }
        "INC" => {
            expect_operands(line, mnemonic, operands, 1)?;
            Instruction::Inc { ra: reg(0)? }
        }
        "DEC" => {
            expect_operands(line, mnemonic, operands, 1)?;
            Instruction::Dec { ra: reg(0)? }
        }
        "LOAD" => {
            expect_operands(line, mnemonic, operands, 2)?;
            Instruction::Load { rd: reg(0)?, roff: reg(1)? }
        }
        "STORE" => {
            expect_operands(line, mnemonic, operands, 2)?;
            Instruction::Store { roff: reg(0)?, rs: reg(1)? }
        }
        "JMP" => {
            expect_operands(line, mnemonic, operands, 1)?;
            Instruction::Jmp { offset: jump_target(0)? }
        }
        "JMPZ" => {
            expect_operands(line, mnemonic, operands, 2)?;
            Instruction::Jmpz { rcond: reg(0)?, offset: jump_target(1)? }
        }
        "JLT" => {
            expect_operands(line, mnemonic, operands, 3)?;
            Instruction::Jlt { ra: reg(0)?, rb: reg(1)?, offset: jump_target(2)? }
        }
        "COPY" => {
            expect_operands(line, mnemonic, operands, 2)?;
            Instruction::Copy { rs: reg(0)?, rd: reg(1)? }
        }
        "ALLOCATE" => {
            expect_operands(line, mnemonic, operands, 2)?;
            Instruction::Allocate { rsize: reg(0)?, raddr: reg(1)? }
        }
        "SPAWN" => {
            expect_operands(line, mnemonic, operands, 2)?;
            Instruction::Spawn { raddr: reg(0)?, rsize: reg(1)? }
        }
        "SEARCH" => {
            expect_operands(line, mnemonic, operands, 4)?;
            Instruction::Search { rs: reg(0)?, rt: reg(1)?, rl: reg(2)?, rf: reg(3)? }
        }
        other => return Err(AssembleError::UnknownMnemonic { line, mnemonic: other.to_string() }),
    };
    Ok(isa::encode(&instr) as i32)
}

fn expect_operands(line: usize, mnemonic: &str, operands: &[String], expected: usize) -> Result<(), AssembleError> {
    if operands.len() != expected {
        return Err(AssembleError::WrongOperandCount { line, mnemonic: mnemonic.to_string(), expected, got: operands.len() });
    }
    Ok(())
}

fn parse_register(line: usize, operand: &str) -> Result<u8, AssembleError> {
    let bad = || AssembleError::BadOperand { line, operand: operand.to_string() };
    let digits = match operand.as_bytes().first() {
        Some(b'r') | Some(b'R') => &operand[1..],
        _ => return Err(bad()),
    };
    let n: u32 = digits.parse().map_err(|_| bad())?;
    if n > 7 {
        return Err(AssembleError::RegisterOutOfRange { line, operand: operand.to_string() });
    }
    Ok(n as u8)
}

fn parse_imm21(line: usize, operand: &str) -> Result<u32, AssembleError> {
    let value = parse_integer(operand).ok_or_else(|| AssembleError::BadOperand { line, operand: operand.to_string() })?;
    if !(0..=((1i64 << 21) - 1)).contains(&value) {
        return Err(AssembleError::ImmediateOutOfRange { line, value });
    }
    Ok(value as u32)
}

fn resolve_offset(
    line: usize,
    operand: &str,
    current_addr: usize,
    labels: &std::collections::HashMap<String, usize>,
) -> Result<i32, AssembleError> {
    let value = match parse_integer(operand) {
        Some(v) => v,
        None => {
            let target = labels.get(operand).ok_or_else(|| AssembleError::UnknownLabel { line, label: operand.to_string() })?;
            *target as i64 - current_addr as i64 - 1
        }
    };
    if !(-131072..=131071).contains(&value) {
        return Err(AssembleError::OffsetOutOfRange { line, value });
    }
    Ok(value as i32)
}

fn parse_word_literal(line: usize, operand: &str) -> Result<i32, AssembleError> {
    if let Some(hex) = operand.strip_prefix("0x").or_else(|| operand.strip_prefix("0X")) {
        return u32::from_str_radix(hex, 16)
            .map(|w| w as i32)
            .map_err(|_| AssembleError::BadWordLiteral { line, operand: operand.to_string() });
    }
    operand.parse::<i64>().ok().filter(|v| *v >= i32::MIN as i64 && *v <= u32::MAX as i64).map(|v| v as i32).ok_or_else(|| {
        AssembleError::BadWordLiteral { line, operand: operand.to_string() }
    })
}

fn parse_integer(operand: &str) -> Option<i64> {
    if let Some(hex) = operand.strip_prefix("0x").or_else(|| operand.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).ok();
    }
    operand.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::decode;

    #[test]
    fn assembles_mov_chain() {
        let src = "MOVI r0, 5\nMOVI r1, 7\nADD r0, r1\n";
        let words = assemble(src).unwrap();
        assert_eq!(words.len(), 3);
        assert_eq!(decode(words[2] as u32).unwrap(), Instruction::Add { ra: 0, rb: 1 });
    }

    #[test]
    fn label_resolves_to_minus_one_for_a_self_loop() {
        let src = "loop: JMP loop\n";
        let words = assemble(src).unwrap();
        assert_eq!(decode(words[0] as u32).unwrap(), Instruction::Jmp { offset: -1 });
    }

    #[test]
    fn forward_label_reference_resolves_correctly() {
        let src = "JMPZ r0, done\nNOP\ndone: NOP\n";
        let words = assemble(src).unwrap();
        // current_addr for the JMPZ line is 0; `done` is at address 2.
        assert_eq!(decode(words[0] as u32).unwrap(), Instruction::Jmpz { rcond: 0, offset: 1 });
    }

    #[test]
    fn word_directive_emits_a_raw_literal() {
        let src = ".word 0xDEADBEEF\n";
        let words = assemble(src).unwrap();
        assert_eq!(words[0] as u32, 0xDEADBEEF);
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let src = "; a comment\n\nNOP ; trailing comment\n";
        let words = assemble(src).unwrap();
        assert_eq!(words.len(), 1);
    }

    #[test]
    fn unknown_mnemonic_is_rejected() {
        let err = assemble("FROB r0, r1\n").unwrap_err();
        assert!(matches!(err, AssembleError::UnknownMnemonic { .. }));
    }

    #[test]
    fn register_out_of_range_is_rejected() {
        let err = assemble("MOV r8, r0\n").unwrap_err();
        assert!(matches!(err, AssembleError::RegisterOutOfRange { .. }));
    }

    #[test]
    fn immediate_out_of_range_is_rejected() {
        let err = assemble("MOVI r0, 2097152\n").unwrap_err();
        assert!(matches!(err, AssembleError::ImmediateOutOfRange { .. }));
    }

    #[test]
    fn duplicate_label_is_rejected() {
        let err = assemble("a: NOP\na: NOP\n").unwrap_err();
        assert!(matches!(err, AssembleError::DuplicateLabel { .. }));
    }

    #[test]
    fn undefined_label_is_rejected() {
        let err = assemble("JMP nowhere\n").unwrap_err();
        assert!(matches!(err, AssembleError::UnknownLabel { .. }));
    }
}
