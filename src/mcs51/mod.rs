//! The Intel 8051 backend.
//!
//! The 8051 is accumulator-centric: there is no register-to-register ALU,
//! so nearly every opcode expands to a short sequence mediated by `A`, and
//! one size function drives both pass 1 and pass 2 so the expansions can
//! never drift apart. Indirect `LOAD`/`STORE` is restricted to `@R0`/`@R1`
//! by the hardware. Variables live in direct internal RAM from `0x08` up
//! (one byte each, buffers contiguous after them); running past `0x80` is
//! fatal. Branches use 8-bit relative offsets and are resolved inline
//! during pass 2 against the pass-1 symbol table; there is no fixup list
//! and no appended data image.
//!
//! `SYS` and `LDS` have no baremetal meaning here and are rejected.

use crate::error::{self, Error};
use crate::ir::{Instruction, Item, Opcode, Operand, SourceLoc};
use crate::layout::{BufTable, CodeBuffer, SymbolTable, VarTable};
use log::debug;

/// First allocatable direct-RAM address (register banks 0 sits below).
const RAM_BASE: u64 = 0x08;
/// First address past the directly addressable internal RAM.
const RAM_LIMIT: u64 = 0x80;
/// The `B` register's direct address; scratch for MUL/DIV and shift loops.
const B_REG: u8 = 0xf0;
/// The 8051 tolerates far fewer distinct buffers than the other targets.
const MAX_BUFFERS_8051: usize = 32;

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

/// Indirect addressing exists only through `@R0` and `@R1`.
fn indirect_op(insn: &Instruction, idx: usize) -> error::Result<u8> {
    let r = reg_op(insn, idx)?;
    if r > 1 {
        return Err(Error::BadRegister(
            format!("indirect addressing requires R0 or R1, not R{r}"),
            insn.loc,
        ));
    }
    Ok(r)
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

/// 8-bit immediate, signed or unsigned view.
fn imm8(value: i64, loc: SourceLoc) -> error::Result<u8> {
    if !(-128..=255).contains(&value) {
        return Err(Error::ImmOutOfRange(value, loc));
    }
    Ok(value as u8)
}

/// Shift count: the registers are 8 bits wide.
fn shift_count(value: i64, loc: SourceLoc) -> error::Result<u8> {
    if !(0..8).contains(&value) {
        return Err(Error::ImmOutOfRange(value, loc));
    }
    Ok(value as u8)
}

fn is_reg(insn: &Instruction, idx: usize) -> bool {
    matches!(insn.operands.get(idx), Some(Operand::Reg(_)))
}

/// The per-opcode size table. Every accumulator-mediated expansion is
/// accounted here; pass 2 emits exactly these many bytes.
fn insn_size(insn: &Instruction) -> error::Result<usize> {
    let size = match insn.opcode {
        Opcode::Ldi => 2,
        Opcode::Mov => 2,
        Opcode::Load | Opcode::Loadb | Opcode::Store | Opcode::Storeb => 2,
        Opcode::Add => {
            if is_reg(insn, 1) {
                3
            } else {
                4
            }
        }
        Opcode::Sub => {
            if is_reg(insn, 1) {
                4
            } else {
                5
            }
        }
        Opcode::And | Opcode::Or | Opcode::Xor => {
            if is_reg(insn, 1) {
                3
            } else {
                4
            }
        }
        Opcode::Not => 3,
        Opcode::Shl | Opcode::Shr => {
            if is_reg(insn, 1) {
                12
            } else {
                2 + 2 * shift_count(imm_op(insn, 1)?, insn.loc)? as usize
            }
        }
        Opcode::Mul | Opcode::Div => {
            if is_reg(insn, 1) {
                5
            } else {
                6
            }
        }
        Opcode::Inc | Opcode::Dec => 1,
        Opcode::Cmp => {
            if is_reg(insn, 1) {
                3
            } else {
                4
            }
        }
        Opcode::Jmp | Opcode::Jz | Opcode::Jnz | Opcode::Jl => 2,
        Opcode::Jg => 6,
        Opcode::Call | Opcode::Int => 3,
        Opcode::Ret | Opcode::Reti => 1,
        Opcode::Push | Opcode::Pop => 2,
        Opcode::Nop => 1,
        Opcode::Hlt => 2,
        Opcode::Var => {
            if insn.imm(1).is_some() {
                3
            } else {
                0
            }
        }
        Opcode::Buffer | Opcode::Org => 0,
        Opcode::Set | Opcode::Get => 2,
        Opcode::Djnz => 2,
        Opcode::Cjne => {
            if is_reg(insn, 1) {
                4
            } else {
                3
            }
        }
        Opcode::Setb | Opcode::Clr => 2,
        other => return Err(Error::UnsupportedOpcode(other.mnemonic(), insn.loc)),
    };
    Ok(size)
}

struct Emitter<'a> {
    buf: CodeBuffer,
    symbols: &'a SymbolTable,
    bufs: &'a BufTable,
}

impl Emitter<'_> {
    fn symbol_addr(&self, name: &str, loc: SourceLoc) -> error::Result<u64> {
        self.symbols
            .lookup(name)
            .ok_or_else(|| Error::UndefinedSymbol(name.into(), loc))
    }

    /// 8-bit relative displacement from `origin` (the end of the branch
    /// instruction) to a label.
    fn rel8(&self, insn: &Instruction, idx: usize, origin: usize) -> error::Result<u8> {
        let name = name_op(insn, idx)?;
        let target = self.symbol_addr(name, insn.loc)? as i64;
        let disp = target - origin as i64;
        if !(-128..=127).contains(&disp) {
            return Err(Error::BranchOutOfRange(name.into(), insn.loc));
        }
        Ok(disp as u8)
    }

    /// 16-bit absolute address for `LCALL`, big-endian as the 8051 wants.
    fn addr16(&mut self, addr: u64, name: &str, loc: SourceLoc) -> error::Result<()> {
        if addr > 0xffff {
            return Err(Error::BranchOutOfRange(name.into(), loc));
        }
        self.buf.put_u8((addr >> 8) as u8);
        self.buf.put_u8(addr as u8);
        Ok(())
    }

    /// `MOV A, Rd; <op>; MOV Rd, A` around an accumulator ALU byte pair.
    fn acc_alu(&mut self, insn: &Instruction, op_reg: u8, op_imm: u8) -> error::Result<()> {
        let dst = reg_op(insn, 0)?;
        self.buf.put_u8(0xe8 + dst); // mov a, rd
        if is_reg(insn, 1) {
            let src = reg_op(insn, 1)?;
            self.buf.put_u8(op_reg + src);
        } else {
            self.buf.put_u8(op_imm);
            let imm = imm8(imm_op(insn, 1)?, insn.loc)?;
            self.buf.put_u8(imm);
        }
        self.buf.put_u8(0xf8 + dst); // mov rd, a
        Ok(())
    }

    /// `MOV B, src; MOV A, Rd; MUL/DIV AB; MOV Rd, A`.
    fn mul_div(&mut self, insn: &Instruction, op: u8) -> error::Result<()> {
        let dst = reg_op(insn, 0)?;
        if is_reg(insn, 1) {
            let src = reg_op(insn, 1)?;
            self.buf.put_bytes(&[0x88 + src, B_REG]); // mov B, rs
        } else {
            let imm = imm8(imm_op(insn, 1)?, insn.loc)?;
            self.buf.put_bytes(&[0x75, B_REG, imm]); // mov B, #imm
        }
        self.buf.put_u8(0xe8 + dst);
        self.buf.put_u8(op);
        self.buf.put_u8(0xf8 + dst);
        Ok(())
    }

    /// Shift by a register count: a `DJNZ B` loop over single-bit
    /// rotate-through-carry steps, with a zero-count guard.
    fn shift_by_reg(&mut self, rotate: u8, dst: u8, src: u8) {
        self.buf.put_bytes(&[0x88 + src, B_REG]); // mov B, rs
        self.buf.put_u8(0xe8 + src); //              mov a, rs
        self.buf.put_bytes(&[0x60, 0x07]); //        jz past the store
        self.buf.put_u8(0xe8 + dst); //              mov a, rd
        self.buf.put_u8(0xc3); //                    clr c
        self.buf.put_u8(rotate); //                  rlc/rrc a
        self.buf.put_bytes(&[0xd5, B_REG, 0xfb]); // djnz B, back two
        self.buf.put_u8(0xf8 + dst); //              mov rd, a
    }

    fn emit(&mut self, insn: &Instruction) -> error::Result<()> {
        match insn.opcode {
            Opcode::Ldi => {
                let dst = reg_op(insn, 0)?;
                let imm = imm8(imm_op(insn, 1)?, insn.loc)?;
                self.buf.put_bytes(&[0x78 + dst, imm]);
            }
            Opcode::Mov => {
                let dst = reg_op(insn, 0)?;
                let src = reg_op(insn, 1)?;
                self.buf.put_bytes(&[0xe8 + src, 0xf8 + dst]);
            }
            Opcode::Load | Opcode::Loadb => {
                let dst = reg_op(insn, 0)?;
                let ptr = indirect_op(insn, 1)?;
                self.buf.put_bytes(&[0xe6 + ptr, 0xf8 + dst]); // mov a, @ri; mov rd, a
            }
            Opcode::Store | Opcode::Storeb => {
                let ptr = indirect_op(insn, 0)?;
                let src = reg_op(insn, 1)?;
                self.buf.put_bytes(&[0xe8 + src, 0xf6 + ptr]); // mov a, rs; mov @ri, a
            }
            Opcode::Add => self.acc_alu(insn, 0x28, 0x24)?,
            Opcode::Sub => {
                self.buf.put_u8(0xc3); // clr c, SUBB consumes the borrow
                self.acc_alu(insn, 0x98, 0x94)?;
            }
            Opcode::And => self.acc_alu(insn, 0x58, 0x54)?,
            Opcode::Or => self.acc_alu(insn, 0x48, 0x44)?,
            Opcode::Xor => self.acc_alu(insn, 0x68, 0x64)?,
            Opcode::Not => {
                let dst = reg_op(insn, 0)?;
                self.buf.put_bytes(&[0xe8 + dst, 0xf4, 0xf8 + dst]); // cpl a
            }
            Opcode::Shl | Opcode::Shr => {
                let rotate = if insn.opcode == Opcode::Shl { 0x33 } else { 0x13 };
                let dst = reg_op(insn, 0)?;
                if is_reg(insn, 1) {
                    let src = reg_op(insn, 1)?;
                    self.shift_by_reg(rotate, dst, src);
                } else {
                    let count = shift_count(imm_op(insn, 1)?, insn.loc)?;
                    self.buf.put_u8(0xe8 + dst);
                    for _ in 0..count {
                        self.buf.put_bytes(&[0xc3, rotate]); // clr c; rlc/rrc a
                    }
                    self.buf.put_u8(0xf8 + dst);
                }
            }
            Opcode::Mul => self.mul_div(insn, 0xa4)?,
            Opcode::Div => self.mul_div(insn, 0x84)?,
            Opcode::Inc => {
                let dst = reg_op(insn, 0)?;
                self.buf.put_u8(0x08 + dst);
            }
            Opcode::Dec => {
                let dst = reg_op(insn, 0)?;
                self.buf.put_u8(0x18 + dst);
            }
            Opcode::Cmp => {
                // A = Rd - Rs with borrow in C, so JZ/JNZ test equality and
                // JC (JL) tests below
                self.buf.put_u8(0xc3);
                let dst = reg_op(insn, 0)?;
                self.buf.put_u8(0xe8 + dst);
                if is_reg(insn, 1) {
                    let src = reg_op(insn, 1)?;
                    self.buf.put_u8(0x98 + src); // subb a, rs
                } else {
                    let imm = imm8(imm_op(insn, 1)?, insn.loc)?;
                    self.buf.put_bytes(&[0x94, imm]); // subb a, #imm
                }
            }
            Opcode::Jmp => {
                let rel = self.rel8(insn, 0, self.buf.len() + 2)?;
                self.buf.put_bytes(&[0x80, rel]); // sjmp
            }
            Opcode::Jz => {
                let rel = self.rel8(insn, 0, self.buf.len() + 2)?;
                self.buf.put_bytes(&[0x60, rel]);
            }
            Opcode::Jnz => {
                let rel = self.rel8(insn, 0, self.buf.len() + 2)?;
                self.buf.put_bytes(&[0x70, rel]);
            }
            Opcode::Jl => {
                let rel = self.rel8(insn, 0, self.buf.len() + 2)?;
                self.buf.put_bytes(&[0x40, rel]); // jc
            }
            Opcode::Jg => {
                // above means neither below (C) nor equal (A == 0)
                self.buf.put_bytes(&[0x40, 0x04]); // jc +4
                self.buf.put_bytes(&[0x60, 0x02]); // jz +2
                let rel = self.rel8(insn, 0, self.buf.len() + 2)?;
                self.buf.put_bytes(&[0x80, rel]); // sjmp target
            }
            Opcode::Call => {
                let name = name_op(insn, 0)?;
                let addr = self.symbol_addr(name, insn.loc)?;
                self.buf.put_u8(0x12); // lcall
                self.addr16(addr, name, insn.loc)?;
            }
            Opcode::Ret => self.buf.put_u8(0x22),
            Opcode::Reti => self.buf.put_u8(0x32),
            Opcode::Push => {
                let src = reg_op(insn, 0)?;
                self.buf.put_bytes(&[0xc0, src]); // push direct
            }
            Opcode::Pop => {
                let dst = reg_op(insn, 0)?;
                self.buf.put_bytes(&[0xd0, dst]); // pop direct
            }
            Opcode::Nop => self.buf.put_u8(0x00),
            Opcode::Hlt => self.buf.put_bytes(&[0x80, 0xfe]), // sjmp $
            Opcode::Int => {
                // vector table: each slot is 8 bytes, entry 0 at 0x0003
                let n = imm_op(insn, 0)?;
                if !(0..=31).contains(&n) {
                    return Err(Error::ImmOutOfRange(n, insn.loc));
                }
                let vector = (n as u64) * 8 + 3;
                self.buf.put_u8(0x12);
                self.addr16(vector, "interrupt vector", insn.loc)?;
            }
            Opcode::Var => {
                // only an initializer emits code: mov direct, #imm
                if let Some(init) = insn.imm(1) {
                    let name = name_op(insn, 0)?;
                    let addr = self.symbol_addr(name, insn.loc)?;
                    let init = imm8(init, insn.loc)?;
                    self.buf.put_bytes(&[0x75, addr as u8, init]);
                }
            }
            Opcode::Buffer => {}
            Opcode::Set => {
                let name = name_op(insn, 0)?;
                let addr = self.symbol_addr(name, insn.loc)?;
                let src = reg_op(insn, 1)?;
                self.buf.put_bytes(&[0x88 + src, addr as u8]); // mov direct, rn
            }
            Opcode::Get => {
                let dst = reg_op(insn, 0)?;
                let name = name_op(insn, 1)?;
                let addr = self.symbol_addr(name, insn.loc)?;
                if self.bufs.contains(name) {
                    self.buf.put_bytes(&[0x78 + dst, addr as u8]); // mov rn, #addr
                } else {
                    self.buf.put_bytes(&[0xa8 + dst, addr as u8]); // mov rn, direct
                }
            }
            Opcode::Djnz => {
                let dst = reg_op(insn, 0)?;
                let rel = self.rel8(insn, 1, self.buf.len() + 2)?;
                self.buf.put_bytes(&[0xd8 + dst, rel]);
            }
            Opcode::Cjne => {
                let dst = reg_op(insn, 0)?;
                if is_reg(insn, 1) {
                    // no register-register form exists; compare A against
                    // the source's direct bank-0 address
                    let src = reg_op(insn, 1)?;
                    self.buf.put_u8(0xe8 + dst); // mov a, rd
                    let rel = self.rel8(insn, 2, self.buf.len() + 3)?;
                    self.buf.put_bytes(&[0xb5, src, rel]); // cjne a, direct, rel
                } else {
                    let imm = imm8(imm_op(insn, 1)?, insn.loc)?;
                    let rel = self.rel8(insn, 2, self.buf.len() + 3)?;
                    self.buf.put_bytes(&[0xb8 + dst, imm, rel]);
                }
            }
            Opcode::Setb => {
                let bit = imm8(imm_op(insn, 0)?, insn.loc)?;
                self.buf.put_bytes(&[0xd2, bit]);
            }
            Opcode::Clr => {
                let bit = imm8(imm_op(insn, 0)?, insn.loc)?;
                self.buf.put_bytes(&[0xc2, bit]);
            }
            Opcode::Org => {
                let target = imm_op(insn, 0)?;
                self.buf.pad_to(target as usize);
            }
            other => return Err(Error::UnsupportedOpcode(other.mnemonic(), insn.loc)),
        }
        Ok(())
    }
}

/// Lower `ir` to an 8051 code image (pure code; variables and buffers live
/// in internal RAM, not in the file).
pub fn generate(ir: &[Item]) -> error::Result<CodeBuffer> {
    let mut symbols = SymbolTable::new();
    let mut vars = VarTable::new();
    let mut bufs = BufTable::new();

    // pass 1: declarations first
    for item in ir {
        if let Item::Insn(insn) = item {
            match insn.opcode {
                Opcode::Var => {
                    vars.declare(name_op(insn, 0)?, insn.imm(1), insn.loc)?;
                }
                Opcode::Buffer => {
                    let size = imm_op(insn, 1)?;
                    if size <= 0 || size as u64 > RAM_LIMIT - RAM_BASE {
                        return Err(Error::ImmOutOfRange(size, insn.loc));
                    }
                    if bufs.len() == MAX_BUFFERS_8051 {
                        return Err(Error::TableFull("buffers"));
                    }
                    bufs.declare(name_op(insn, 0)?, size as u32, insn.loc)?;
                }
                _ => {}
            }
        }
    }

    // direct-RAM allocation: one byte per variable from 0x08, buffers after
    let mut ram = RAM_BASE;
    for var in vars.iter() {
        if ram >= RAM_LIMIT {
            return Err(Error::RamExhausted(var.loc));
        }
        symbols.insert(&var.name, ram, var.loc)?;
        ram += 1;
    }
    for buf in bufs.iter() {
        if ram + buf.size as u64 > RAM_LIMIT {
            return Err(Error::RamExhausted(buf.loc));
        }
        symbols.insert(&buf.name, ram, buf.loc)?;
        ram += buf.size as u64;
    }
    debug!("8051 RAM: {} of {} bytes used", ram - RAM_BASE, RAM_LIMIT - RAM_BASE);

    // sizes and label addresses
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
                _ => pc += insn_size(insn)? as u64,
            },
        }
    }

    // pass 2: emission with inline branch resolution
    let mut emitter = Emitter {
        buf: CodeBuffer::new(),
        symbols: &symbols,
        bufs: &bufs,
    };
    for item in ir {
        if let Item::Insn(insn) = item {
            let before = emitter.buf.len();
            emitter.emit(insn)?;
            if insn.opcode != Opcode::Org {
                debug_assert_eq!(
                    emitter.buf.len() - before,
                    insn_size(insn)?,
                    "size table disagrees with emission for {}",
                    insn.opcode.mnemonic()
                );
            }
        }
    }
    debug_assert_eq!(emitter.buf.len() as u64, pc);
    debug!("8051 image: {} bytes", emitter.buf.len());
    Ok(emitter.buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Item, Opcode, Operand};

    fn insn(opcode: Opcode, operands: Vec<Operand>) -> Item {
        Item::insn(opcode, operands)
    }

    #[test]
    fn ldi_hlt_bytes() {
        let ir = [
            insn(Opcode::Ldi, vec![Operand::Reg(0), Operand::Imm(0x55)]),
            insn(Opcode::Hlt, vec![]),
        ];
        let buf = generate(&ir).unwrap();
        assert_eq!(buf.bytes, [0x78, 0x55, 0x80, 0xfe]);
    }

    #[test]
    fn mov_goes_through_the_accumulator() {
        let ir = [insn(Opcode::Mov, vec![Operand::Reg(3), Operand::Reg(5)])];
        let buf = generate(&ir).unwrap();
        assert_eq!(buf.bytes, [0xed, 0xfb]); // mov a, r5; mov r3, a
    }

    #[test]
    fn indirect_requires_r0_or_r1() {
        let ok = [insn(Opcode::Load, vec![Operand::Reg(2), Operand::Reg(1)])];
        assert_eq!(generate(&ok).unwrap().bytes, [0xe7, 0xfa]);
        let bad = [insn(Opcode::Load, vec![Operand::Reg(2), Operand::Reg(3)])];
        assert!(matches!(generate(&bad), Err(Error::BadRegister(..))));
    }

    #[test]
    fn add_register_and_immediate() {
        let reg = [insn(Opcode::Add, vec![Operand::Reg(0), Operand::Reg(1)])];
        assert_eq!(generate(&reg).unwrap().bytes, [0xe8, 0x29, 0xf8]);
        let imm = [insn(Opcode::Add, vec![Operand::Reg(0), Operand::Imm(5)])];
        assert_eq!(generate(&imm).unwrap().bytes, [0xe8, 0x24, 0x05, 0xf8]);
    }

    #[test]
    fn jg_is_the_six_byte_polyfill() {
        let ir = [
            Item::label("top"),
            insn(Opcode::Cmp, vec![Operand::Reg(0), Operand::Reg(1)]),
            insn(Opcode::Jg, vec![Operand::Label("top".into())]),
        ];
        let buf = generate(&ir).unwrap();
        // cmp is clr c; mov a, r0; subb a, r1
        assert_eq!(&buf.bytes[..3], [0xc3, 0xe8, 0x99]);
        // jc +4; jz +2; sjmp top (rel = 0 - 9 = -9)
        assert_eq!(&buf.bytes[3..], [0x40, 0x04, 0x60, 0x02, 0x80, 0xf7]);
    }

    #[test]
    fn branch_out_of_range_is_fatal() {
        let mut ir = vec![insn(Opcode::Jmp, vec![Operand::Label("far".into())])];
        for _ in 0..200 {
            ir.push(insn(Opcode::Nop, vec![]));
        }
        ir.push(Item::label("far"));
        ir.push(insn(Opcode::Ret, vec![]));
        assert!(matches!(generate(&ir), Err(Error::BranchOutOfRange(..))));
    }

    #[test]
    fn variables_allocate_from_0x08() {
        let ir = [
            insn(
                Opcode::Var,
                vec![Operand::Label("a".into()), Operand::Imm(3)],
            ),
            insn(Opcode::Var, vec![Operand::Label("b".into())]),
            insn(
                Opcode::Buffer,
                vec![Operand::Label("buf".into()), Operand::Imm(4)],
            ),
            insn(
                Opcode::Set,
                vec![Operand::Label("b".into()), Operand::Reg(2)],
            ),
            insn(
                Opcode::Get,
                vec![Operand::Reg(4), Operand::Label("a".into())],
            ),
            insn(
                Opcode::Get,
                vec![Operand::Reg(5), Operand::Label("buf".into())],
            ),
        ];
        let buf = generate(&ir).unwrap();
        assert_eq!(
            buf.bytes,
            [
                0x75, 0x08, 0x03, // mov 0x08, #3 (a's initializer)
                0x8a, 0x09, //       mov 0x09, r2 (set b)
                0xac, 0x08, //       mov r4, 0x08 (get a: value)
                0x7d, 0x0a, //       mov r5, #0x0a (get buf: address)
            ]
        );
    }

    #[test]
    fn ram_exhaustion_is_fatal() {
        let mut ir = Vec::new();
        for i in 0..120 {
            ir.push(insn(Opcode::Var, vec![Operand::Label(format!("v{i}"))]));
        }
        ir.push(insn(
            Opcode::Buffer,
            vec![Operand::Label("big".into()), Operand::Imm(1)],
        ));
        assert!(matches!(generate(&ir), Err(Error::RamExhausted(..))));
    }

    #[test]
    fn interrupt_calls_through_the_vector_table() {
        let ir = [insn(Opcode::Int, vec![Operand::Imm(2)])];
        let buf = generate(&ir).unwrap();
        assert_eq!(buf.bytes, [0x12, 0x00, 0x13]); // lcall 0x0013
    }

    #[test]
    fn djnz_and_cjne_polyfills() {
        let ir = [
            Item::label("loop"),
            insn(
                Opcode::Djnz,
                vec![Operand::Reg(2), Operand::Label("loop".into())],
            ),
            insn(
                Opcode::Cjne,
                vec![
                    Operand::Reg(3),
                    Operand::Reg(4),
                    Operand::Label("loop".into()),
                ],
            ),
            insn(
                Opcode::Cjne,
                vec![
                    Operand::Reg(3),
                    Operand::Imm(9),
                    Operand::Label("loop".into()),
                ],
            ),
        ];
        let buf = generate(&ir).unwrap();
        assert_eq!(
            buf.bytes,
            [
                0xda, 0xfe, //             djnz r2, loop
                0xeb, 0xb5, 0x04, 0xfa, // mov a, r3; cjne a, 0x04, loop
                0xbb, 0x09, 0xf7, //       cjne r3, #9, loop
            ]
        );
    }

    #[test]
    fn remaining_alu_expansions() {
        let sub = [insn(Opcode::Sub, vec![Operand::Reg(0), Operand::Reg(1)])];
        assert_eq!(generate(&sub).unwrap().bytes, [0xc3, 0xe8, 0x99, 0xf8]);
        let and = [insn(Opcode::And, vec![Operand::Reg(2), Operand::Imm(0x0f)])];
        assert_eq!(generate(&and).unwrap().bytes, [0xea, 0x54, 0x0f, 0xfa]);
        let or = [insn(Opcode::Or, vec![Operand::Reg(3), Operand::Reg(4)])];
        assert_eq!(generate(&or).unwrap().bytes, [0xeb, 0x4c, 0xfb]);
        let xor = [insn(Opcode::Xor, vec![Operand::Reg(5), Operand::Reg(6)])];
        assert_eq!(generate(&xor).unwrap().bytes, [0xed, 0x6e, 0xfd]);
        let not = [insn(Opcode::Not, vec![Operand::Reg(7)])];
        assert_eq!(generate(&not).unwrap().bytes, [0xef, 0xf4, 0xff]);
    }

    #[test]
    fn shift_sizes_track_the_count() {
        for count in 0..8i64 {
            let ir = [insn(Opcode::Shl, vec![Operand::Reg(0), Operand::Imm(count)])];
            let buf = generate(&ir).unwrap();
            assert_eq!(buf.len(), 2 + 2 * count as usize);
        }
        let too_far = [insn(Opcode::Shr, vec![Operand::Reg(0), Operand::Imm(8)])];
        assert!(matches!(generate(&too_far), Err(Error::ImmOutOfRange(..))));
    }

    #[test]
    fn shift_by_register_is_a_djnz_loop() {
        let ir = [insn(Opcode::Shl, vec![Operand::Reg(3), Operand::Reg(2)])];
        let buf = generate(&ir).unwrap();
        assert_eq!(
            buf.bytes,
            [
                0x8a, 0xf0, //       mov B, r2
                0xea, //             mov a, r2
                0x60, 0x07, //       jz done
                0xeb, //             mov a, r3
                0xc3, //             clr c
                0x33, //             rlc a
                0xd5, 0xf0, 0xfb, // djnz B, back
                0xfb, //             mov r3, a
            ]
        );
    }

    #[test]
    fn mul_div_use_the_b_register() {
        let mul = [insn(Opcode::Mul, vec![Operand::Reg(0), Operand::Reg(1)])];
        assert_eq!(
            generate(&mul).unwrap().bytes,
            [0x89, 0xf0, 0xe8, 0xa4, 0xf8]
        );
        let div = [insn(Opcode::Div, vec![Operand::Reg(0), Operand::Imm(10)])];
        assert_eq!(
            generate(&div).unwrap().bytes,
            [0x75, 0xf0, 0x0a, 0xe8, 0x84, 0xf8]
        );
    }

    #[test]
    fn stack_uses_direct_bank0_addresses() {
        let ir = [
            insn(Opcode::Push, vec![Operand::Reg(6)]),
            insn(Opcode::Pop, vec![Operand::Reg(7)]),
        ];
        assert_eq!(generate(&ir).unwrap().bytes, [0xc0, 0x06, 0xd0, 0x07]);
    }

    #[test]
    fn compare_below_uses_the_carry() {
        let ir = [
            Item::label("less"),
            insn(Opcode::Cmp, vec![Operand::Reg(0), Operand::Imm(5)]),
            insn(Opcode::Jl, vec![Operand::Label("less".into())]),
        ];
        let buf = generate(&ir).unwrap();
        // clr c; mov a, r0; subb a, #5; jc less
        assert_eq!(buf.bytes, [0xc3, 0xe8, 0x94, 0x05, 0x40, 0xfa]);
    }

    #[test]
    fn org_backwards_is_fatal() {
        let ir = [
            insn(Opcode::Org, vec![Operand::Imm(0x10)]),
            insn(Opcode::Nop, vec![]),
            insn(Opcode::Org, vec![Operand::Imm(0x08)]),
        ];
        assert!(matches!(generate(&ir), Err(Error::OrgBackwards { .. })));
    }

    #[test]
    fn sys_and_lds_are_rejected() {
        let sys = [insn(Opcode::Sys, vec![])];
        assert!(matches!(generate(&sys), Err(Error::UnsupportedOpcode(..))));
        let lds = [insn(
            Opcode::Lds,
            vec![Operand::Reg(0), Operand::Str(b"hi".to_vec())],
        )];
        assert!(matches!(generate(&lds), Err(Error::UnsupportedOpcode(..))));
    }
}
