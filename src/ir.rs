//! The intermediate representation consumed by every backend.
//!
//! A front end (lexer + parser) lowers source text into an ordered sequence
//! of [`Item`]s: either a label definition or an [`Instruction`] over virtual
//! registers `R0..R15`. Operand counts and types are assumed to have been
//! checked by the parser; the backends only re-validate what is
//! target-dependent (register ranges, immediate widths, reachability).

use alloc::string::String;
use alloc::vec::Vec;

/// Line/column of the originating source statement, for diagnostics.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Default)]
pub struct SourceLoc {
    pub line: u32,
    pub column: u32,
}

impl SourceLoc {
    pub fn new(line: u32, column: u32) -> Self {
        SourceLoc { line, column }
    }
}

/// The closed opcode set of the virtual instruction set, plus the
/// architecture-specific extras each backend surfaces (`CPUID`/`RDTSC`/
/// `BSWAP` on x86-64, `WFI`/`DMB` on AArch64, `DJNZ`/`CJNE`/`SETB`/`CLR`/
/// `RETI` on the 8051). Backends reject extras that are not theirs.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub enum Opcode {
    Ldi,
    Mov,
    Load,
    Store,
    Add,
    Sub,
    And,
    Or,
    Xor,
    Not,
    Shl,
    Shr,
    Mul,
    Div,
    Inc,
    Dec,
    Cmp,
    Jmp,
    Jz,
    Jnz,
    Jl,
    Jg,
    Call,
    Ret,
    Push,
    Pop,
    Nop,
    Hlt,
    Int,
    Var,
    Set,
    Get,
    Buffer,
    Lds,
    Loadb,
    Storeb,
    Sys,
    Org,
    // x86-64 extras
    Cpuid,
    Rdtsc,
    Bswap,
    // AArch64 extras
    Wfi,
    Dmb,
    // 8051 extras
    Djnz,
    Cjne,
    Setb,
    Clr,
    Reti,
}

impl Opcode {
    /// The source mnemonic, as diagnostics print it.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Opcode::Ldi => "LDI",
            Opcode::Mov => "MOV",
            Opcode::Load => "LOAD",
            Opcode::Store => "STORE",
            Opcode::Add => "ADD",
            Opcode::Sub => "SUB",
            Opcode::And => "AND",
            Opcode::Or => "OR",
            Opcode::Xor => "XOR",
            Opcode::Not => "NOT",
            Opcode::Shl => "SHL",
            Opcode::Shr => "SHR",
            Opcode::Mul => "MUL",
            Opcode::Div => "DIV",
            Opcode::Inc => "INC",
            Opcode::Dec => "DEC",
            Opcode::Cmp => "CMP",
            Opcode::Jmp => "JMP",
            Opcode::Jz => "JZ",
            Opcode::Jnz => "JNZ",
            Opcode::Jl => "JL",
            Opcode::Jg => "JG",
            Opcode::Call => "CALL",
            Opcode::Ret => "RET",
            Opcode::Push => "PUSH",
            Opcode::Pop => "POP",
            Opcode::Nop => "NOP",
            Opcode::Hlt => "HLT",
            Opcode::Int => "INT",
            Opcode::Var => "VAR",
            Opcode::Set => "SET",
            Opcode::Get => "GET",
            Opcode::Buffer => "BUFFER",
            Opcode::Lds => "LDS",
            Opcode::Loadb => "LOADB",
            Opcode::Storeb => "STOREB",
            Opcode::Sys => "SYS",
            Opcode::Org => "ORG",
            Opcode::Cpuid => "CPUID",
            Opcode::Rdtsc => "RDTSC",
            Opcode::Bswap => "BSWAP",
            Opcode::Wfi => "WFI",
            Opcode::Dmb => "DMB",
            Opcode::Djnz => "DJNZ",
            Opcode::Cjne => "CJNE",
            Opcode::Setb => "SETB",
            Opcode::Clr => "CLR",
            Opcode::Reti => "RETI",
        }
    }
}

/// One operand, tagged the way the parser tags them.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Operand {
    /// Virtual register index, 0..15.
    Reg(u8),
    /// Signed 64-bit immediate.
    Imm(i64),
    /// Reference to a label, variable or buffer by name.
    Label(String),
    /// A string literal (UTF-8-clean bytes, unterminated).
    Str(Vec<u8>),
}

/// A single executable statement.
#[derive(Debug, PartialEq, Clone)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operands: Vec<Operand>,
    pub loc: SourceLoc,
}

impl Instruction {
    pub fn new(opcode: Opcode, operands: Vec<Operand>) -> Self {
        Instruction {
            opcode,
            operands,
            loc: SourceLoc::default(),
        }
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.loc = SourceLoc::new(line, column);
        self
    }

    /// The register index of operand `idx`, if it is a register.
    pub fn reg(&self, idx: usize) -> Option<u8> {
        match self.operands.get(idx) {
            Some(&Operand::Reg(r)) => Some(r),
            _ => None,
        }
    }

    /// The immediate value of operand `idx`, if it is an immediate.
    pub fn imm(&self, idx: usize) -> Option<i64> {
        match self.operands.get(idx) {
            Some(&Operand::Imm(v)) => Some(v),
            _ => None,
        }
    }

    /// The name referenced by operand `idx`, if it is a label reference.
    pub fn name(&self, idx: usize) -> Option<&str> {
        match self.operands.get(idx) {
            Some(Operand::Label(name)) => Some(name),
            _ => None,
        }
    }
}

/// One record of the ordered IR stream.
#[derive(Debug, PartialEq, Clone)]
pub enum Item {
    /// A label definition; contributes no bytes.
    Label { name: String, loc: SourceLoc },
    /// An executable statement or directive.
    Insn(Instruction),
}

impl Item {
    pub fn label(name: impl Into<String>) -> Self {
        Item::Label {
            name: name.into(),
            loc: SourceLoc::default(),
        }
    }

    pub fn insn(opcode: Opcode, operands: Vec<Operand>) -> Self {
        Item::Insn(Instruction::new(opcode, operands))
    }

    pub fn loc(&self) -> SourceLoc {
        match self {
            Item::Label { loc, .. } => *loc,
            Item::Insn(insn) => insn.loc,
        }
    }
}
