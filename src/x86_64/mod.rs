//! The x86-64 backend.
//!
//! Everything runs through the `REX.W`-prefixed 64-bit integer path:
//! register pairs encode in three bytes (`REX.W` + opcode + ModR/M),
//! `MOV r64, imm32` sign-extends in seven, and memory operands carry the two
//! classic special cases (RSP needs a SIB byte, RBP needs `mod=01 disp8=0`).
//! Variables are addressed RIP-relatively; every branch and variable access
//! queues a [`FixupKind::Rel32`] resolved in pass 3.
//!
//! With [`Os::Win32`], `SYS` and `HLT` become calls into the runtime block
//! appended after the data image (see [`win32`]), and the buffer's
//! `iat_offset`/`iat_count` are set for the PE emitter.

use crate::Os;
use crate::error::{self, Error};
use crate::ir::{Instruction, Item, Opcode, Operand, SourceLoc};
use crate::layout::{
    self, BufTable, CodeBuffer, DataLayout, Fixup, FixupKind, StrTable, SymbolTable, VarTable,
};
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use log::debug;

pub mod win32;

/// R0..R7 in encoding order: RAX, RCX, RDX, RBX, RSP, RBP, RSI, RDI.
const RCX: u8 = 1;
const RSP: u8 = 4;
const RBP: u8 = 5;
/// Scratch register for immediate operands; outside the mapped set.
const R10: u8 = 2; // low 3 bits, selected via REX.B/REX.R

const REX_W: u8 = 0x48;
const REX_WB: u8 = 0x49;
const REX_WR: u8 = 0x4c;

fn modrm(md: u8, reg: u8, rm: u8) -> u8 {
    (md << 6) | ((reg & 7) << 3) | (rm & 7)
}

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

fn imm32(value: i64, loc: SourceLoc) -> error::Result<u32> {
    if value < i32::MIN as i64 || value > i32::MAX as i64 {
        return Err(Error::ImmOutOfRange(value, loc));
    }
    Ok(value as i32 as u32)
}

/// Extra byte for `[RSP]` (SIB) and `[RBP]` (`disp8=0`) bases.
fn mem_extra(base: u8) -> usize {
    if base == RSP || base == RBP { 1 } else { 0 }
}

/// Pass-1 size of one instruction. Must agree exactly with what
/// [`Emitter::emit`] produces; pass 2 asserts this per instruction.
fn insn_size(insn: &Instruction, win32: bool) -> error::Result<usize> {
    let size = match insn.opcode {
        Opcode::Ldi => 7,
        Opcode::Mov => 3,
        Opcode::Load => 3 + mem_extra(reg_op(insn, 1)?),
        Opcode::Store => 3 + mem_extra(reg_op(insn, 0)?),
        Opcode::Loadb => 4 + mem_extra(reg_op(insn, 1)?),
        Opcode::Storeb => 3 + mem_extra(reg_op(insn, 0)?),
        Opcode::Add | Opcode::Sub | Opcode::And | Opcode::Or | Opcode::Xor | Opcode::Cmp => {
            match insn.operands.get(1) {
                Some(Operand::Reg(_)) => 3,
                _ => 10,
            }
        }
        Opcode::Not => 3,
        Opcode::Shl | Opcode::Shr => match insn.operands.get(1) {
            Some(Operand::Reg(_)) => 13,
            _ => 4,
        },
        Opcode::Mul => match insn.operands.get(1) {
            Some(Operand::Reg(_)) => 4,
            _ => 7,
        },
        Opcode::Div => match insn.operands.get(1) {
            Some(Operand::Reg(_)) => 13,
            _ => 20,
        },
        Opcode::Inc | Opcode::Dec => 3,
        Opcode::Jmp | Opcode::Call => 5,
        Opcode::Jz | Opcode::Jnz | Opcode::Jl | Opcode::Jg => 6,
        Opcode::Ret => 1,
        Opcode::Push | Opcode::Pop | Opcode::Nop => 1,
        Opcode::Hlt => {
            if win32 {
                5
            } else {
                1
            }
        }
        Opcode::Int => 2,
        Opcode::Sys => {
            if win32 {
                5
            } else {
                2
            }
        }
        Opcode::Cpuid | Opcode::Rdtsc => 2,
        Opcode::Bswap => 3,
        Opcode::Set | Opcode::Get | Opcode::Lds => 7,
        Opcode::Var | Opcode::Buffer => 0,
        Opcode::Org => 0,
        other => {
            return Err(Error::UnsupportedOpcode(other.mnemonic(), insn.loc));
        }
    };
    Ok(size)
}

struct Emitter<'a> {
    buf: CodeBuffer,
    fixups: Vec<Fixup>,
    bufs: &'a BufTable,
    strs: &'a StrTable,
    layout: DataLayout,
    win32: bool,
    /// Start of the win32 runtime block; meaningless otherwise.
    runtime_base: u64,
}

impl Emitter<'_> {
    fn mem_modrm(&mut self, reg: u8, base: u8) {
        if base == RSP {
            self.buf.put_u8(modrm(0, reg, RSP));
            self.buf.put_u8(0x24);
        } else if base == RBP {
            self.buf.put_u8(modrm(1, reg, RBP));
            self.buf.put_u8(0);
        } else {
            self.buf.put_u8(modrm(0, reg, base));
        }
    }

    /// `MOV R10, imm32`: the scratch load every ALU immediate form starts
    /// with.
    fn load_scratch(&mut self, value: i64, loc: SourceLoc) -> error::Result<()> {
        self.buf.put_u8(REX_WB);
        self.buf.put_u8(0xc7);
        self.buf.put_u8(modrm(3, 0, R10));
        let imm = imm32(value, loc)?;
        self.buf.put_u32(imm);
        Ok(())
    }

    /// Emit a branch opcode plus a rel32 placeholder and queue its fixup.
    fn branch(&mut self, opcode: &[u8], insn: &Instruction) -> error::Result<()> {
        let label = name_op(insn, 0)?.to_string();
        self.buf.put_bytes(opcode);
        let patch_offset = self.buf.len();
        self.buf.put_u32(0);
        layout::push_fixup(
            &mut self.fixups,
            Fixup {
                label,
                patch_offset,
                instr_end: patch_offset + 4,
                kind: FixupKind::Rel32,
                loc: insn.loc,
            },
        )
    }

    /// RIP-relative displacement placeholder for a named variable/buffer.
    fn rip_ref(&mut self, name: &str, loc: SourceLoc) -> error::Result<()> {
        let patch_offset = self.buf.len();
        self.buf.put_u32(0);
        layout::push_fixup(
            &mut self.fixups,
            Fixup {
                label: name.to_string(),
                patch_offset,
                instr_end: patch_offset + 4,
                kind: FixupKind::Rel32,
                loc,
            },
        )
    }

    /// `CALL` with a displacement to a known absolute offset (the win32
    /// dispatchers); nothing to defer.
    fn call_fixed(&mut self, target: u64, what: &str, loc: SourceLoc) -> error::Result<()> {
        self.buf.put_u8(0xe8);
        let end = self.buf.len() as i64 + 4;
        let disp = i32::try_from(target as i64 - end)
            .map_err(|_| Error::BranchOutOfRange(String::from(what), loc))?;
        self.buf.put_u32(disp as u32);
        Ok(())
    }

    fn alu(&mut self, op_rr: u8, insn: &Instruction) -> error::Result<()> {
        let dst = reg_op(insn, 0)?;
        match insn.operands.get(1) {
            Some(&Operand::Reg(_)) => {
                let src = reg_op(insn, 1)?;
                self.buf.put_bytes(&[REX_W, op_rr, modrm(3, src, dst)]);
            }
            _ => {
                let imm = imm_op(insn, 1)?;
                self.load_scratch(imm, insn.loc)?;
                self.buf.put_bytes(&[REX_WR, op_rr, modrm(3, R10, dst)]);
            }
        }
        Ok(())
    }

    /// Shift by a register value: route the count through CL, preserving
    /// RCX in R10, NOP-padded to a fixed 13 bytes so pass-1 sizes hold.
    fn shift_by_reg(&mut self, ext: u8, dst: u8, src: u8) {
        let start = self.buf.len();
        if src == RCX && dst != RCX {
            self.buf.put_bytes(&[REX_W, 0xd3, modrm(3, ext, dst)]);
        } else if dst == RCX {
            self.buf.put_bytes(&[REX_WB, 0x89, modrm(3, RCX, R10)]); // mov r10, rcx
            self.buf.put_bytes(&[REX_W, 0x89, modrm(3, src, RCX)]); //  mov rcx, src
            self.buf.put_bytes(&[REX_WB, 0xd3, modrm(3, ext, R10)]); // shift r10, cl
            self.buf.put_bytes(&[REX_WR, 0x89, modrm(3, R10, RCX)]); // mov rcx, r10
        } else {
            self.buf.put_bytes(&[REX_WB, 0x89, modrm(3, RCX, R10)]);
            self.buf.put_bytes(&[REX_W, 0x89, modrm(3, src, RCX)]);
            self.buf.put_bytes(&[REX_W, 0xd3, modrm(3, ext, dst)]);
            self.buf.put_bytes(&[REX_WR, 0x89, modrm(3, R10, RCX)]);
        }
        while self.buf.len() - start < 13 {
            self.buf.put_u8(0x90);
        }
    }

    fn emit(&mut self, insn: &Instruction) -> error::Result<()> {
        match insn.opcode {
            Opcode::Ldi => {
                let dst = reg_op(insn, 0)?;
                let imm = imm32(imm_op(insn, 1)?, insn.loc)?;
                self.buf.put_bytes(&[REX_W, 0xc7, modrm(3, 0, dst)]);
                self.buf.put_u32(imm);
            }
            Opcode::Mov => {
                let dst = reg_op(insn, 0)?;
                let src = reg_op(insn, 1)?;
                self.buf.put_bytes(&[REX_W, 0x89, modrm(3, src, dst)]);
            }
            Opcode::Load => {
                let dst = reg_op(insn, 0)?;
                let base = reg_op(insn, 1)?;
                self.buf.put_bytes(&[REX_W, 0x8b]);
                self.mem_modrm(dst, base);
            }
            Opcode::Store => {
                let base = reg_op(insn, 0)?;
                let src = reg_op(insn, 1)?;
                self.buf.put_bytes(&[REX_W, 0x89]);
                self.mem_modrm(src, base);
            }
            Opcode::Loadb => {
                let dst = reg_op(insn, 0)?;
                let base = reg_op(insn, 1)?;
                self.buf.put_bytes(&[REX_W, 0x0f, 0xb6]);
                self.mem_modrm(dst, base);
            }
            Opcode::Storeb => {
                let base = reg_op(insn, 0)?;
                let src = reg_op(insn, 1)?;
                self.buf.put_bytes(&[REX_W, 0x88]);
                self.mem_modrm(src, base);
            }
            Opcode::Add => self.alu(0x01, insn)?,
            Opcode::Sub => self.alu(0x29, insn)?,
            Opcode::And => self.alu(0x21, insn)?,
            Opcode::Or => self.alu(0x09, insn)?,
            Opcode::Xor => self.alu(0x31, insn)?,
            Opcode::Cmp => self.alu(0x39, insn)?,
            Opcode::Not => {
                let dst = reg_op(insn, 0)?;
                self.buf.put_bytes(&[REX_W, 0xf7, modrm(3, 2, dst)]);
            }
            Opcode::Shl | Opcode::Shr => {
                let ext = if insn.opcode == Opcode::Shl { 4 } else { 5 };
                let dst = reg_op(insn, 0)?;
                match insn.operands.get(1) {
                    Some(&Operand::Reg(_)) => {
                        let src = reg_op(insn, 1)?;
                        self.shift_by_reg(ext, dst, src);
                    }
                    _ => {
                        let count = imm_op(insn, 1)?;
                        if !(0..64).contains(&count) {
                            return Err(Error::ImmOutOfRange(count, insn.loc));
                        }
                        self.buf
                            .put_bytes(&[REX_W, 0xc1, modrm(3, ext, dst), count as u8]);
                    }
                }
            }
            Opcode::Mul => {
                let dst = reg_op(insn, 0)?;
                match insn.operands.get(1) {
                    Some(&Operand::Reg(_)) => {
                        let src = reg_op(insn, 1)?;
                        self.buf.put_bytes(&[REX_W, 0x0f, 0xaf, modrm(3, dst, src)]);
                    }
                    _ => {
                        let imm = imm32(imm_op(insn, 1)?, insn.loc)?;
                        self.buf.put_bytes(&[REX_W, 0x69, modrm(3, dst, dst)]);
                        self.buf.put_u32(imm);
                    }
                }
            }
            Opcode::Div => {
                let dst = reg_op(insn, 0)?;
                self.buf.put_u8(0x52); // push rdx
                match insn.operands.get(1) {
                    Some(&Operand::Reg(_)) => {
                        let src = reg_op(insn, 1)?;
                        self.buf.put_bytes(&[REX_W, 0x89, modrm(3, dst, 0)]); // mov rax, dst
                        self.buf.put_bytes(&[REX_W, 0x99]); //                   cqo
                        self.buf.put_bytes(&[REX_W, 0xf7, modrm(3, 7, src)]); // idiv src
                    }
                    _ => {
                        let imm = imm_op(insn, 1)?;
                        self.load_scratch(imm, insn.loc)?;
                        self.buf.put_bytes(&[REX_W, 0x89, modrm(3, dst, 0)]);
                        self.buf.put_bytes(&[REX_W, 0x99]);
                        self.buf.put_bytes(&[REX_WB, 0xf7, modrm(3, 7, R10)]);
                    }
                }
                self.buf.put_bytes(&[REX_W, 0x89, modrm(3, 0, dst)]); // mov dst, rax
                self.buf.put_u8(0x5a); //                                pop rdx
            }
            Opcode::Inc => {
                let dst = reg_op(insn, 0)?;
                self.buf.put_bytes(&[REX_W, 0xff, modrm(3, 0, dst)]);
            }
            Opcode::Dec => {
                let dst = reg_op(insn, 0)?;
                self.buf.put_bytes(&[REX_W, 0xff, modrm(3, 1, dst)]);
            }
            Opcode::Jmp => self.branch(&[0xe9], insn)?,
            Opcode::Jz => self.branch(&[0x0f, 0x84], insn)?,
            Opcode::Jnz => self.branch(&[0x0f, 0x85], insn)?,
            Opcode::Jl => self.branch(&[0x0f, 0x8c], insn)?,
            Opcode::Jg => self.branch(&[0x0f, 0x8f], insn)?,
            Opcode::Call => self.branch(&[0xe8], insn)?,
            Opcode::Ret => self.buf.put_u8(0xc3),
            Opcode::Push => {
                let src = reg_op(insn, 0)?;
                self.buf.put_u8(0x50 + src);
            }
            Opcode::Pop => {
                let dst = reg_op(insn, 0)?;
                self.buf.put_u8(0x58 + dst);
            }
            Opcode::Nop => self.buf.put_u8(0x90),
            Opcode::Hlt => {
                if self.win32 {
                    let target = self.runtime_base + win32::EXIT_DISPATCH as u64;
                    self.call_fixed(target, "exit dispatcher", insn.loc)?;
                } else {
                    self.buf.put_u8(0xc3);
                }
            }
            Opcode::Int => {
                let vector = imm_op(insn, 0)?;
                if !(0..=255).contains(&vector) {
                    return Err(Error::ImmOutOfRange(vector, insn.loc));
                }
                self.buf.put_bytes(&[0xcd, vector as u8]);
            }
            Opcode::Sys => {
                if self.win32 {
                    let target = self.runtime_base + win32::SYS_ENTRY as u64;
                    self.call_fixed(target, "syscall dispatcher", insn.loc)?;
                } else {
                    self.buf.put_bytes(&[0x0f, 0x05]);
                }
            }
            Opcode::Cpuid => self.buf.put_bytes(&[0x0f, 0xa2]),
            Opcode::Rdtsc => self.buf.put_bytes(&[0x0f, 0x31]),
            Opcode::Bswap => {
                let dst = reg_op(insn, 0)?;
                self.buf.put_bytes(&[REX_W, 0x0f, 0xc8 + dst]);
            }
            Opcode::Set => {
                let name = name_op(insn, 0)?.to_string();
                let src = reg_op(insn, 1)?;
                self.buf.put_bytes(&[REX_W, 0x89, modrm(0, src, 5)]);
                self.rip_ref(&name, insn.loc)?;
            }
            Opcode::Get => {
                let dst = reg_op(insn, 0)?;
                let name = name_op(insn, 1)?.to_string();
                // address of a buffer, value of a variable
                let opcode = if self.bufs.contains(&name) { 0x8d } else { 0x8b };
                self.buf.put_bytes(&[REX_W, opcode, modrm(0, dst, 5)]);
                self.rip_ref(&name, insn.loc)?;
            }
            Opcode::Lds => {
                let dst = reg_op(insn, 0)?;
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
                let addr = self.layout.str_base + offset;
                self.buf.put_bytes(&[REX_W, 0x8d, modrm(0, dst, 5)]);
                let end = self.buf.len() as i64 + 4;
                let disp = imm32(addr as i64 - end, insn.loc)?;
                self.buf.put_u32(disp);
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

/// Lower `ir` to an x86-64 code buffer: pass 1 (layout), pass 2 (emission),
/// pass 3 (fixups), then the data image and, under Win32, the runtime block.
pub fn generate(ir: &[Item], os: Os) -> error::Result<CodeBuffer> {
    let win32 = os == Os::Win32;
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
                _ => pc += insn_size(insn, win32)? as u64,
            },
        }
    }

    let data = DataLayout::compute(pc, &vars, &bufs, &strs, 8);
    data.register_symbols(&mut symbols, &vars, &bufs)?;
    debug!(
        "x86-64 pass 1: code {:#x}, vars at {:#x}, buffers at {:#x}, strings at {:#x}",
        data.code_size, data.var_base, data.buf_base, data.str_base
    );

    // pass 2: emission
    let mut emitter = Emitter {
        buf: CodeBuffer::new(),
        fixups: Vec::new(),
        bufs: &bufs,
        strs: &strs,
        layout: data,
        win32,
        runtime_base: data.end,
    };
    for item in ir {
        if let Item::Insn(insn) = item {
            let before = emitter.buf.len();
            emitter.emit(insn)?;
            if insn.opcode != Opcode::Org {
                debug_assert_eq!(
                    emitter.buf.len() - before,
                    insn_size(insn, win32)?,
                    "pass-1 size disagrees with emission for {}",
                    insn.opcode.mnemonic()
                );
            }
        }
    }
    debug_assert_eq!(emitter.buf.len() as u64, data.code_size);

    // pass 3: patch fixups
    let Emitter {
        mut buf, fixups, ..
    } = emitter;
    layout::resolve_fixups(&mut buf, &fixups, &symbols)?;

    // data image, then the win32 runtime
    layout::append_data(&mut buf, &vars, &bufs, &strs, 8);
    if win32 {
        buf.put_bytes(&win32::runtime_block());
        buf.iat_offset = data.end as usize + win32::IAT;
        buf.iat_count = win32::IAT_SLOTS;
    }
    debug!("x86-64 image: {} bytes", buf.len());
    Ok(buf)
}
