//! The AArch64 backend.
//!
//! Every emitted instruction is a single 32-bit little-endian word built by
//! bit-field composition following the A64 encodings: add/sub with the
//! imm12 fast path, logical shifted-register (N set for ORN), MOVZ/MOVK for
//! immediates, MADD with `Ra = XZR` for MUL, SDIV, the UBFM aliases for
//! immediate shifts and LSLV/LSRV for register counts, unsigned-offset
//! LDR/STR, and pre-/post-indexed `[SP, #-16]!` / `[SP], #16` for PUSH/POP.
//!
//! Instruction sizes depend only on immediate magnitudes, and the pass-1
//! size computation reproduces the pass-2 decision exactly. Branches queue
//! [`FixupKind::B`]/[`FixupKind::Bl`] (±128 MiB) or [`FixupKind::BCond`]
//! (±1 MiB) fixups, range-checked per kind in pass 3. Variables, buffers
//! and strings are reached by loading the absolute address with a fixed
//! MOVZ+MOVK pair into scratch X9 (or the destination, for address-of).

use crate::error::{self, Error};
use crate::ir::{Instruction, Item, Opcode, Operand, SourceLoc};
use crate::layout::{
    self, BufTable, CodeBuffer, Cond, DataLayout, Fixup, FixupKind, StrTable, SymbolTable,
    VarTable,
};
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use log::debug;

/// Scratch register for immediates and absolute addresses.
const X9: u8 = 9;
/// Linux syscall-number register.
const X8: u8 = 8;
const XZR: u32 = 31;

fn reg_op(insn: &Instruction, idx: usize) -> error::Result<u8> {
    match insn.operands.get(idx) {
        Some(&Operand::Reg(r)) if r < 8 => Ok(r),
        Some(&Operand::Reg(r)) => Err(Error::BadRegister(
            format!("R{r} is outside the supported R0..R7 range"),
            insn.loc,
        )),
        _ => Err(Error::Malformed(format!(
            "{} expects a register operand",
            insn.opcode.mnemonic()
        ))),
    }
}

fn imm_op(insn: &Instruction, idx: usize) -> error::Result<i64> {
    insn.imm(idx).ok_or_else(|| {
        Error::Malformed(format!(
            "{} expects an immediate operand",
            insn.opcode.mnemonic()
        ))
    })
}

fn name_op(insn: &Instruction, idx: usize) -> error::Result<&str> {
    insn.name(idx).ok_or_else(|| {
        Error::Malformed(format!("{} expects a name operand", insn.opcode.mnemonic()))
    })
}

/// `MOVZ Xd, #imm16, LSL #(hw*16)`
fn movz(rd: u8, imm16: u32, hw: u32) -> u32 {
    0xd280_0000 | (hw << 21) | (imm16 << 5) | rd as u32
}

/// `MOVK Xd, #imm16, LSL #(hw*16)`
fn movk(rd: u8, imm16: u32, hw: u32) -> u32 {
    0xf280_0000 | (hw << 21) | (imm16 << 5) | rd as u32
}

/// Words needed to materialize `imm`: one MOVZ for 16 bits, MOVZ+MOVK for
/// 32. Anything else (including negatives) has no encoding here.
fn imm_load_size(imm: i64, loc: SourceLoc) -> error::Result<usize> {
    if !(0..=0xffff_ffff).contains(&imm) {
        return Err(Error::ImmOutOfRange(imm, loc));
    }
    Ok(if imm <= 0xffff { 4 } else { 8 })
}

/// Register-register data-processing word with `Rn = Rd`.
fn dp2(base: u32, rd: u8, rm: u8) -> u32 {
    base | (rm as u32) << 16 | (rd as u32) << 5 | rd as u32
}

/// Pass-1 size of one instruction; must match emission exactly.
fn insn_size(insn: &Instruction, bufs: &BufTable) -> error::Result<usize> {
    let size = match insn.opcode {
        Opcode::Ldi => imm_load_size(imm_op(insn, 1)?, insn.loc)?,
        Opcode::Mov
        | Opcode::Not
        | Opcode::Load
        | Opcode::Store
        | Opcode::Loadb
        | Opcode::Storeb
        | Opcode::Inc
        | Opcode::Dec
        | Opcode::Jmp
        | Opcode::Jz
        | Opcode::Jnz
        | Opcode::Jl
        | Opcode::Jg
        | Opcode::Call
        | Opcode::Ret
        | Opcode::Push
        | Opcode::Pop
        | Opcode::Nop
        | Opcode::Hlt
        | Opcode::Int
        | Opcode::Wfi
        | Opcode::Dmb => 4,
        Opcode::Shl | Opcode::Shr => 4,
        Opcode::Add | Opcode::Sub | Opcode::Cmp => match insn.operands.get(1) {
            Some(Operand::Reg(_)) => 4,
            _ => {
                let imm = imm_op(insn, 1)?;
                if imm.unsigned_abs() <= 0xfff {
                    4
                } else {
                    4 + imm_load_size(imm, insn.loc)?
                }
            }
        },
        Opcode::And | Opcode::Or | Opcode::Xor | Opcode::Mul | Opcode::Div => {
            match insn.operands.get(1) {
                Some(Operand::Reg(_)) => 4,
                _ => 4 + imm_load_size(imm_op(insn, 1)?, insn.loc)?,
            }
        }
        Opcode::Sys => 8,
        Opcode::Set => 12,
        Opcode::Get => {
            if bufs.contains(name_op(insn, 1)?) {
                8
            } else {
                12
            }
        }
        Opcode::Lds => 8,
        Opcode::Var | Opcode::Buffer | Opcode::Org => 0,
        other => return Err(Error::UnsupportedOpcode(other.mnemonic(), insn.loc)),
    };
    Ok(size)
}

struct Emitter<'a> {
    buf: CodeBuffer,
    fixups: Vec<Fixup>,
    symbols: &'a SymbolTable,
    bufs: &'a BufTable,
    strs: &'a StrTable,
    layout: DataLayout,
}

impl Emitter<'_> {
    fn word(&mut self, word: u32) {
        self.buf.put_u32(word);
    }

    /// MOVZ (+ MOVK) to materialize a checked 32-bit value.
    fn load_imm(&mut self, rd: u8, imm: i64, loc: SourceLoc) -> error::Result<()> {
        if !(0..=0xffff_ffff).contains(&imm) {
            return Err(Error::ImmOutOfRange(imm, loc));
        }
        let imm = imm as u32;
        self.word(movz(rd, imm & 0xffff, 0));
        if imm > 0xffff {
            self.word(movk(rd, imm >> 16, 1));
        }
        Ok(())
    }

    /// Absolute image address, always the full MOVZ+MOVK pair so pass-1
    /// sizes never depend on where the data ends up.
    fn load_addr(&mut self, rd: u8, addr: u64) {
        self.word(movz(rd, (addr & 0xffff) as u32, 0));
        self.word(movk(rd, ((addr >> 16) & 0xffff) as u32, 1));
    }

    /// Branch word placeholder plus its fixup.
    fn branch(&mut self, kind: FixupKind, insn: &Instruction) -> error::Result<()> {
        let label = name_op(insn, 0)?.to_string();
        let patch_offset = self.buf.len();
        self.word(0);
        layout::push_fixup(
            &mut self.fixups,
            Fixup {
                label,
                patch_offset,
                instr_end: patch_offset + 4,
                kind,
                loc: insn.loc,
            },
        )
    }

    /// Add/sub/cmp with the imm12 fast path; the sign of the immediate
    /// picks the direction, bigger values go through X9.
    fn add_sub_imm(
        &mut self,
        pos: u32,
        neg: u32,
        reg_form: u32,
        rn: u8,
        rd_field: u32,
        imm: i64,
        loc: SourceLoc,
    ) -> error::Result<()> {
        if imm.unsigned_abs() <= 0xfff {
            let (base, mag) = if imm >= 0 {
                (pos, imm as u32)
            } else {
                (neg, (-imm) as u32)
            };
            self.word(base | (mag << 10) | (rn as u32) << 5 | rd_field);
        } else {
            self.load_imm(X9, imm, loc)?;
            self.word(reg_form | (X9 as u32) << 16 | (rn as u32) << 5 | rd_field);
        }
        Ok(())
    }

    fn symbol_addr(&self, name: &str, loc: SourceLoc) -> error::Result<u64> {
        self.symbols
            .lookup(name)
            .ok_or_else(|| Error::UndefinedSymbol(name.to_string(), loc))
    }

    fn emit(&mut self, insn: &Instruction) -> error::Result<()> {
        match insn.opcode {
            Opcode::Ldi => {
                let rd = reg_op(insn, 0)?;
                self.load_imm(rd, imm_op(insn, 1)?, insn.loc)?;
            }
            Opcode::Mov => {
                let rd = reg_op(insn, 0)?;
                let rm = reg_op(insn, 1)?;
                // ORR Xd, XZR, Xm
                self.word(0xaa00_0000 | (rm as u32) << 16 | XZR << 5 | rd as u32);
            }
            Opcode::Add => {
                let rd = reg_op(insn, 0)?;
                match insn.operands.get(1) {
                    Some(&Operand::Reg(_)) => {
                        let rm = reg_op(insn, 1)?;
                        self.word(dp2(0x8b00_0000, rd, rm));
                    }
                    _ => self.add_sub_imm(
                        0x9100_0000,
                        0xd100_0000,
                        0x8b00_0000,
                        rd,
                        rd as u32,
                        imm_op(insn, 1)?,
                        insn.loc,
                    )?,
                }
            }
            Opcode::Sub => {
                let rd = reg_op(insn, 0)?;
                match insn.operands.get(1) {
                    Some(&Operand::Reg(_)) => {
                        let rm = reg_op(insn, 1)?;
                        self.word(dp2(0xcb00_0000, rd, rm));
                    }
                    _ => self.add_sub_imm(
                        0xd100_0000,
                        0x9100_0000,
                        0xcb00_0000,
                        rd,
                        rd as u32,
                        imm_op(insn, 1)?,
                        insn.loc,
                    )?,
                }
            }
            Opcode::Cmp => {
                let rn = reg_op(insn, 0)?;
                match insn.operands.get(1) {
                    Some(&Operand::Reg(_)) => {
                        let rm = reg_op(insn, 1)?;
                        // SUBS XZR, Xn, Xm
                        self.word(0xeb00_0000 | (rm as u32) << 16 | (rn as u32) << 5 | XZR);
                    }
                    _ => self.add_sub_imm(
                        0xf100_0000,
                        0xb100_0000,
                        0xeb00_0000,
                        rn,
                        XZR,
                        imm_op(insn, 1)?,
                        insn.loc,
                    )?,
                }
            }
            Opcode::And | Opcode::Or | Opcode::Xor => {
                let base = match insn.opcode {
                    Opcode::And => 0x8a00_0000,
                    Opcode::Or => 0xaa00_0000,
                    _ => 0xca00_0000,
                };
                let rd = reg_op(insn, 0)?;
                match insn.operands.get(1) {
                    Some(&Operand::Reg(_)) => {
                        let rm = reg_op(insn, 1)?;
                        self.word(dp2(base, rd, rm));
                    }
                    _ => {
                        self.load_imm(X9, imm_op(insn, 1)?, insn.loc)?;
                        self.word(dp2(base, rd, X9));
                    }
                }
            }
            Opcode::Not => {
                let rd = reg_op(insn, 0)?;
                // ORN Xd, XZR, Xd
                self.word(0xaa20_0000 | (rd as u32) << 16 | XZR << 5 | rd as u32);
            }
            Opcode::Shl | Opcode::Shr => {
                let left = insn.opcode == Opcode::Shl;
                let rd = reg_op(insn, 0)?;
                match insn.operands.get(1) {
                    Some(&Operand::Reg(_)) => {
                        let rm = reg_op(insn, 1)?;
                        // LSLV / LSRV
                        let base = if left { 0x9ac0_2000 } else { 0x9ac0_2400 };
                        self.word(base | (rm as u32) << 16 | (rd as u32) << 5 | rd as u32);
                    }
                    _ => {
                        let count = imm_op(insn, 1)?;
                        if !(0..64).contains(&count) {
                            return Err(Error::ImmOutOfRange(count, insn.loc));
                        }
                        let count = count as u32;
                        // UBFM aliases: LSL = (immr = -n mod 64, imms = 63-n),
                        // LSR = (immr = n, imms = 63)
                        let (immr, imms) = if left {
                            ((64 - count) % 64, 63 - count)
                        } else {
                            (count, 63)
                        };
                        self.word(
                            0xd340_0000 | immr << 16 | imms << 10 | (rd as u32) << 5 | rd as u32,
                        );
                    }
                }
            }
            Opcode::Mul => {
                let rd = reg_op(insn, 0)?;
                match insn.operands.get(1) {
                    Some(&Operand::Reg(_)) => {
                        let rm = reg_op(insn, 1)?;
                        // MADD Xd, Xd, Xm, XZR
                        self.word(
                            0x9b00_0000
                                | (rm as u32) << 16
                                | XZR << 10
                                | (rd as u32) << 5
                                | rd as u32,
                        );
                    }
                    _ => {
                        self.load_imm(X9, imm_op(insn, 1)?, insn.loc)?;
                        self.word(
                            0x9b00_0000
                                | (X9 as u32) << 16
                                | XZR << 10
                                | (rd as u32) << 5
                                | rd as u32,
                        );
                    }
                }
            }
            Opcode::Div => {
                let rd = reg_op(insn, 0)?;
                match insn.operands.get(1) {
                    Some(&Operand::Reg(_)) => {
                        let rm = reg_op(insn, 1)?;
                        self.word(dp2(0x9ac0_0c00, rd, rm));
                    }
                    _ => {
                        self.load_imm(X9, imm_op(insn, 1)?, insn.loc)?;
                        self.word(dp2(0x9ac0_0c00, rd, X9));
                    }
                }
            }
            Opcode::Inc | Opcode::Dec => {
                let rd = reg_op(insn, 0)?;
                let base = if insn.opcode == Opcode::Inc {
                    0x9100_0000
                } else {
                    0xd100_0000
                };
                self.word(base | 1 << 10 | (rd as u32) << 5 | rd as u32);
            }
            Opcode::Load => {
                let rt = reg_op(insn, 0)?;
                let rn = reg_op(insn, 1)?;
                self.word(0xf940_0000 | (rn as u32) << 5 | rt as u32);
            }
            Opcode::Store => {
                let rn = reg_op(insn, 0)?;
                let rt = reg_op(insn, 1)?;
                self.word(0xf900_0000 | (rn as u32) << 5 | rt as u32);
            }
            Opcode::Loadb => {
                let rt = reg_op(insn, 0)?;
                let rn = reg_op(insn, 1)?;
                self.word(0x3940_0000 | (rn as u32) << 5 | rt as u32);
            }
            Opcode::Storeb => {
                let rn = reg_op(insn, 0)?;
                let rt = reg_op(insn, 1)?;
                self.word(0x3900_0000 | (rn as u32) << 5 | rt as u32);
            }
            Opcode::Jmp => self.branch(FixupKind::B, insn)?,
            Opcode::Call => self.branch(FixupKind::Bl, insn)?,
            Opcode::Jz => self.branch(FixupKind::BCond(Cond::Eq), insn)?,
            Opcode::Jnz => self.branch(FixupKind::BCond(Cond::Ne), insn)?,
            Opcode::Jl => self.branch(FixupKind::BCond(Cond::Lt), insn)?,
            Opcode::Jg => self.branch(FixupKind::BCond(Cond::Gt), insn)?,
            Opcode::Ret | Opcode::Hlt => self.word(0xd65f_03c0), // RET X30
            Opcode::Push => {
                let rt = reg_op(insn, 0)?;
                // STR Xt, [SP, #-16]!
                self.word(0xf81f_0fe0 | rt as u32);
            }
            Opcode::Pop => {
                let rt = reg_op(insn, 0)?;
                // LDR Xt, [SP], #16
                self.word(0xf841_07e0 | rt as u32);
            }
            Opcode::Nop => self.word(0xd503_201f),
            Opcode::Wfi => self.word(0xd503_207f),
            Opcode::Dmb => self.word(0xd503_3fbf), // DMB SY
            Opcode::Int => {
                let imm = imm_op(insn, 0)?;
                if !(0..=0xffff).contains(&imm) {
                    return Err(Error::ImmOutOfRange(imm, insn.loc));
                }
                self.word(0xd400_0001 | (imm as u32) << 5);
            }
            Opcode::Sys => {
                // syscall number travels in R7; the kernel wants it in X8
                self.word(0xaa00_0000 | 7 << 16 | XZR << 5 | X8 as u32);
                self.word(0xd400_0001); // SVC #0
            }
            Opcode::Set => {
                let name = name_op(insn, 0)?;
                let rt = reg_op(insn, 1)?;
                let addr = self.symbol_addr(name, insn.loc)?;
                self.load_addr(X9, addr);
                self.word(0xf900_0000 | (X9 as u32) << 5 | rt as u32);
            }
            Opcode::Get => {
                let rd = reg_op(insn, 0)?;
                let name = name_op(insn, 1)?.to_string();
                let addr = self.symbol_addr(&name, insn.loc)?;
                if self.bufs.contains(&name) {
                    self.load_addr(rd, addr);
                } else {
                    self.load_addr(X9, addr);
                    self.word(0xf940_0000 | (X9 as u32) << 5 | rd as u32);
                }
            }
            Opcode::Lds => {
                let rd = reg_op(insn, 0)?;
                let text = match insn.operands.get(1) {
                    Some(Operand::Str(text)) => text,
                    _ => {
                        return Err(Error::Malformed(String::from(
                            "LDS expects a string literal",
                        )));
                    }
                };
                let offset = self
                    .strs
                    .offset_of(text)
                    .ok_or_else(|| Error::Malformed(String::from("string missing from pass 1")))?;
                self.load_addr(rd, self.layout.str_base + offset);
            }
            Opcode::Var | Opcode::Buffer => {}
            Opcode::Org => {
                let target = imm_op(insn, 0)?;
                self.buf.pad_to(target as usize);
            }
            other => return Err(Error::UnsupportedOpcode(other.mnemonic(), insn.loc)),
        }
        Ok(())
    }

}

/// Lower `ir` to an AArch64 code buffer (raw binary, load address 0).
pub fn generate(ir: &[Item]) -> error::Result<CodeBuffer> {
    let mut symbols = SymbolTable::new();
    let mut vars = VarTable::new();
    let mut bufs = BufTable::new();
    let mut strs = StrTable::new();

    // pass 1: declarations first, so sizing and `GET` dispatch see every
    // variable/buffer/string regardless of where it is declared
    for item in ir {
        if let Item::Insn(insn) = item {
            match insn.opcode {
                Opcode::Var => {
                    vars.declare(name_op(insn, 0)?, insn.imm(1), insn.loc)?;
                }
                Opcode::Buffer => {
                    let size = imm_op(insn, 1)?;
                    if size <= 0 || size > u32::MAX as i64 {
                        return Err(Error::ImmOutOfRange(size, insn.loc));
                    }
                    bufs.declare(name_op(insn, 0)?, size as u32, insn.loc)?;
                }
                Opcode::Lds => {
                    if let Some(Operand::Str(text)) = insn.operands.get(1) {
                        strs.intern(text)?;
                    }
                }
                _ => {}
            }
        }
    }

    // then sizes and label addresses
    let mut pc: u64 = 0;
    for item in ir {
        match item {
            Item::Label { name, loc } => symbols.insert(name, pc, *loc)?,
            Item::Insn(insn) => match insn.opcode {
                Opcode::Org => {
                    let target = imm_op(insn, 0)?;
                    if target < 0 || (target as u64) < pc {
                        return Err(Error::OrgBackwards {
                            from: pc,
                            to: target as u64,
                            loc: insn.loc,
                        });
                    }
                    pc = target as u64;
                }
                Opcode::Var | Opcode::Buffer => {}
                _ => pc += insn_size(insn, &bufs)? as u64,
            },
        }
    }

    let data = DataLayout::compute(pc, &vars, &bufs, &strs, 8);
    data.register_symbols(&mut symbols, &vars, &bufs)?;
    debug!(
        "arm64 pass 1: code {:#x}, vars at {:#x}, buffers at {:#x}, strings at {:#x}",
        data.code_size, data.var_base, data.buf_base, data.str_base
    );

    // pass 2
    let mut emitter = Emitter {
        buf: CodeBuffer::new(),
        fixups: Vec::new(),
        symbols: &symbols,
        bufs: &bufs,
        strs: &strs,
        layout: data,
    };
    for item in ir {
        if let Item::Insn(insn) = item {
            emitter.emit(insn)?;
        }
    }
    debug_assert_eq!(emitter.buf.len() as u64, data.code_size);

    // pass 3 + data image
    let Emitter {
        mut buf, fixups, ..
    } = emitter;
    layout::resolve_fixups(&mut buf, &fixups, &symbols)?;
    layout::append_data(&mut buf, &vars, &bufs, &strs, 8);
    debug!("arm64 image: {} bytes", buf.len());
    Ok(buf)
}
