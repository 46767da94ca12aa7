//! The IA-32 (x86-32) backend.
//!
//! The x86-64 encodings minus the REX prefixes: `MOV r32, imm32` is
//! `B8+rd id`, `INC`/`DEC` regain their single-byte `40+rd`/`48+rd` forms,
//! division sign-extends with `CDQ`, and all pointers and immediates are
//! 32 bits. Variable access uses absolute `[disp32]` addressing
//! ([`FixupKind::Abs32`]: the displacement is the target address itself,
//! not PC-relative), and `SYS` is `INT 0x80`.

use crate::error::{self, Error};
use crate::ir::{Instruction, Item, Opcode, Operand, SourceLoc};
use crate::layout::{
    self, BufTable, CodeBuffer, DataLayout, Fixup, FixupKind, StrTable, SymbolTable, VarTable,
};
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use log::debug;

/// R0..R7 in encoding order: EAX, ECX, EDX, EBX, ESP, EBP, ESI, EDI.
const ECX: u8 = 1;
const ESP: u8 = 4;
const EBP: u8 = 5;

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

/// 32-bit literal immediate: signed or unsigned, as long as it fits a
/// doubleword.
fn imm32(value: i64, loc: SourceLoc) -> error::Result<u32> {
    if value < i32::MIN as i64 || value > u32::MAX as i64 {
        return Err(Error::ImmOutOfRange(value, loc));
    }
    Ok(value as u32)
}

fn mem_extra(base: u8) -> usize {
    if base == ESP || base == EBP { 1 } else { 0 }
}

/// Pass-1 size of one instruction; pass 2 asserts agreement. `GET` needs
/// the buffer table because a buffer address (`B8+rd imm32`, 5 bytes) and a
/// variable load (`8B /r disp32`, 6 bytes) differ in length.
fn insn_size(insn: &Instruction, bufs: &BufTable) -> error::Result<usize> {
    let size = match insn.opcode {
        Opcode::Ldi => 5,
        Opcode::Mov => 2,
        Opcode::Load => 2 + mem_extra(reg_op(insn, 1)?),
        Opcode::Store => 2 + mem_extra(reg_op(insn, 0)?),
        Opcode::Loadb => 3 + mem_extra(reg_op(insn, 1)?),
        Opcode::Storeb => 2 + mem_extra(reg_op(insn, 0)?),
        Opcode::Add | Opcode::Sub | Opcode::And | Opcode::Or | Opcode::Xor | Opcode::Cmp => {
            match insn.operands.get(1) {
                Some(Operand::Reg(_)) => 2,
                _ => 6,
            }
        }
        Opcode::Not => 2,
        Opcode::Shl | Opcode::Shr => match insn.operands.get(1) {
            Some(Operand::Reg(_)) => 9,
            _ => 3,
        },
        Opcode::Mul => match insn.operands.get(1) {
            Some(Operand::Reg(_)) => 3,
            _ => 6,
        },
        Opcode::Div => match insn.operands.get(1) {
            Some(Operand::Reg(_)) => 9,
            _ => 18,
        },
        Opcode::Inc | Opcode::Dec => 1,
        Opcode::Jmp | Opcode::Call => 5,
        Opcode::Jz | Opcode::Jnz | Opcode::Jl | Opcode::Jg => 6,
        Opcode::Ret | Opcode::Hlt => 1,
        Opcode::Push | Opcode::Pop | Opcode::Nop => 1,
        Opcode::Int | Opcode::Sys => 2,
        Opcode::Set => 6,
        Opcode::Get => {
            if bufs.contains(name_op(insn, 1)?) {
                5
            } else {
                6
            }
        }
        Opcode::Lds => 5,
        Opcode::Var | Opcode::Buffer | Opcode::Org => 0,
        other => return Err(Error::UnsupportedOpcode(other.mnemonic(), insn.loc)),
    };
    Ok(size)
}

struct Emitter<'a> {
    buf: CodeBuffer,
    fixups: Vec<Fixup>,
    bufs: &'a BufTable,
    strs: &'a StrTable,
    layout: DataLayout,
}

impl Emitter<'_> {
    fn mem_modrm(&mut self, reg: u8, base: u8) {
        if base == ESP {
            self.buf.put_u8(modrm(0, reg, ESP));
            self.buf.put_u8(0x24);
        } else if base == EBP {
            self.buf.put_u8(modrm(1, reg, EBP));
            self.buf.put_u8(0);
        } else {
            self.buf.put_u8(modrm(0, reg, base));
        }
    }

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

    /// Absolute 32-bit address placeholder for a named variable/buffer.
    fn abs_ref(&mut self, name: &str, loc: SourceLoc) -> error::Result<()> {
        let patch_offset = self.buf.len();
        self.buf.put_u32(0);
        layout::push_fixup(
            &mut self.fixups,
            Fixup {
                label: name.to_string(),
                patch_offset,
                instr_end: 0,
                kind: FixupKind::Abs32,
                loc,
            },
        )
    }

    fn alu(&mut self, op_rr: u8, ext: u8, insn: &Instruction) -> error::Result<()> {
        let dst = reg_op(insn, 0)?;
        match insn.operands.get(1) {
            Some(&Operand::Reg(_)) => {
                let src = reg_op(insn, 1)?;
                self.buf.put_bytes(&[op_rr, modrm(3, src, dst)]);
            }
            _ => {
                let imm = imm32(imm_op(insn, 1)?, insn.loc)?;
                self.buf.put_bytes(&[0x81, modrm(3, ext, dst)]);
                self.buf.put_u32(imm);
            }
        }
        Ok(())
    }

    /// Shift by a register value, NOP-padded to a fixed 9 bytes. When the
    /// destination is ECX itself the value round-trips through the stack
    /// (`shl dword [esp], cl`).
    fn shift_by_reg(&mut self, ext: u8, dst: u8, src: u8) {
        let start = self.buf.len();
        if src == ECX && dst != ECX {
            self.buf.put_bytes(&[0xd3, modrm(3, ext, dst)]);
        } else if dst == ECX {
            self.buf.put_u8(0x50 + ECX); //                  push ecx
            self.buf.put_bytes(&[0x89, modrm(3, src, ECX)]); // mov ecx, src
            self.buf.put_bytes(&[0xd3, modrm(0, ext, 4), 0x24]); // shift [esp], cl
            self.buf.put_u8(0x58 + ECX); //                  pop ecx
        } else {
            self.buf.put_u8(0x50 + ECX);
            self.buf.put_bytes(&[0x89, modrm(3, src, ECX)]);
            self.buf.put_bytes(&[0xd3, modrm(3, ext, dst)]);
            self.buf.put_u8(0x58 + ECX);
        }
        while self.buf.len() - start < 9 {
            self.buf.put_u8(0x90);
        }
    }

    fn emit(&mut self, insn: &Instruction) -> error::Result<()> {
        match insn.opcode {
            Opcode::Ldi => {
                let dst = reg_op(insn, 0)?;
                let imm = imm32(imm_op(insn, 1)?, insn.loc)?;
                self.buf.put_u8(0xb8 + dst);
                self.buf.put_u32(imm);
            }
            Opcode::Mov => {
                let dst = reg_op(insn, 0)?;
                let src = reg_op(insn, 1)?;
                self.buf.put_bytes(&[0x89, modrm(3, src, dst)]);
            }
            Opcode::Load => {
                let dst = reg_op(insn, 0)?;
                let base = reg_op(insn, 1)?;
                self.buf.put_u8(0x8b);
                self.mem_modrm(dst, base);
            }
            Opcode::Store => {
                let base = reg_op(insn, 0)?;
                let src = reg_op(insn, 1)?;
                self.buf.put_u8(0x89);
                self.mem_modrm(src, base);
            }
            Opcode::Loadb => {
                let dst = reg_op(insn, 0)?;
                let base = reg_op(insn, 1)?;
                self.buf.put_bytes(&[0x0f, 0xb6]);
                self.mem_modrm(dst, base);
            }
            Opcode::Storeb => {
                let base = reg_op(insn, 0)?;
                let src = reg_op(insn, 1)?;
                self.buf.put_u8(0x88);
                self.mem_modrm(src, base);
            }
            Opcode::Add => self.alu(0x01, 0, insn)?,
            Opcode::Sub => self.alu(0x29, 5, insn)?,
            Opcode::And => self.alu(0x21, 4, insn)?,
            Opcode::Or => self.alu(0x09, 1, insn)?,
            Opcode::Xor => self.alu(0x31, 6, insn)?,
            Opcode::Cmp => self.alu(0x39, 7, insn)?,
            Opcode::Not => {
                let dst = reg_op(insn, 0)?;
                self.buf.put_bytes(&[0xf7, modrm(3, 2, dst)]);
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
                        if !(0..32).contains(&count) {
                            return Err(Error::ImmOutOfRange(count, insn.loc));
                        }
                        self.buf.put_bytes(&[0xc1, modrm(3, ext, dst), count as u8]);
                    }
                }
            }
            Opcode::Mul => {
                let dst = reg_op(insn, 0)?;
                match insn.operands.get(1) {
                    Some(&Operand::Reg(_)) => {
                        let src = reg_op(insn, 1)?;
                        self.buf.put_bytes(&[0x0f, 0xaf, modrm(3, dst, src)]);
                    }
                    _ => {
                        let imm = imm32(imm_op(insn, 1)?, insn.loc)?;
                        self.buf.put_bytes(&[0x69, modrm(3, dst, dst)]);
                        self.buf.put_u32(imm);
                    }
                }
            }
            Opcode::Div => {
                let dst = reg_op(insn, 0)?;
                self.buf.put_u8(0x52); // push edx
                self.buf.put_bytes(&[0x89, modrm(3, dst, 0)]); // mov eax, dst
                self.buf.put_u8(0x99); //                         cdq
                match insn.operands.get(1) {
                    Some(&Operand::Reg(_)) => {
                        let src = reg_op(insn, 1)?;
                        self.buf.put_bytes(&[0xf7, modrm(3, 7, src)]); // idiv src
                    }
                    _ => {
                        let imm = imm32(imm_op(insn, 1)?, insn.loc)?;
                        self.buf.put_u8(0x68); //                  push imm32
                        self.buf.put_u32(imm);
                        self.buf.put_bytes(&[0xf7, modrm(0, 7, 4), 0x24]); // idiv [esp]
                        self.buf.put_bytes(&[0x83, 0xc4, 0x04]); //  add esp, 4
                    }
                }
                self.buf.put_bytes(&[0x89, modrm(3, 0, dst)]); // mov dst, eax
                self.buf.put_u8(0x5a); //                         pop edx
            }
            Opcode::Inc => {
                let dst = reg_op(insn, 0)?;
                self.buf.put_u8(0x40 + dst);
            }
            Opcode::Dec => {
                let dst = reg_op(insn, 0)?;
                self.buf.put_u8(0x48 + dst);
            }
            Opcode::Jmp => self.branch(&[0xe9], insn)?,
            Opcode::Jz => self.branch(&[0x0f, 0x84], insn)?,
            Opcode::Jnz => self.branch(&[0x0f, 0x85], insn)?,
            Opcode::Jl => self.branch(&[0x0f, 0x8c], insn)?,
            Opcode::Jg => self.branch(&[0x0f, 0x8f], insn)?,
            Opcode::Call => self.branch(&[0xe8], insn)?,
            Opcode::Ret | Opcode::Hlt => self.buf.put_u8(0xc3),
            Opcode::Push => {
                let src = reg_op(insn, 0)?;
                self.buf.put_u8(0x50 + src);
            }
            Opcode::Pop => {
                let dst = reg_op(insn, 0)?;
                self.buf.put_u8(0x58 + dst);
            }
            Opcode::Nop => self.buf.put_u8(0x90),
            Opcode::Int => {
                let vector = imm_op(insn, 0)?;
                if !(0..=255).contains(&vector) {
                    return Err(Error::ImmOutOfRange(vector, insn.loc));
                }
                self.buf.put_bytes(&[0xcd, vector as u8]);
            }
            Opcode::Sys => self.buf.put_bytes(&[0xcd, 0x80]),
            Opcode::Set => {
                let name = name_op(insn, 0)?.to_string();
                let src = reg_op(insn, 1)?;
                self.buf.put_bytes(&[0x89, modrm(0, src, 5)]);
                self.abs_ref(&name, insn.loc)?;
            }
            Opcode::Get => {
                let dst = reg_op(insn, 0)?;
                let name = name_op(insn, 1)?.to_string();
                if self.bufs.contains(&name) {
                    // address of the buffer as a literal
                    self.buf.put_u8(0xb8 + dst);
                    self.abs_ref(&name, insn.loc)?;
                } else {
                    self.buf.put_bytes(&[0x8b, modrm(0, dst, 5)]);
                    self.abs_ref(&name, insn.loc)?;
                }
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
                self.buf.put_u8(0xb8 + dst);
                self.buf.put_u32(imm32(addr as i64, insn.loc)?);
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

/// Lower `ir` to an IA-32 code buffer (raw binary, load address 0).
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

    let data = DataLayout::compute(pc, &vars, &bufs, &strs, 4);
    data.register_symbols(&mut symbols, &vars, &bufs)?;
    debug!(
        "x86-32 pass 1: code {:#x}, vars at {:#x}, buffers at {:#x}, strings at {:#x}",
        data.code_size, data.var_base, data.buf_base, data.str_base
    );

    // pass 2
    let mut emitter = Emitter {
        buf: CodeBuffer::new(),
        fixups: Vec::new(),
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
    layout::append_data(&mut buf, &vars, &bufs, &strs, 4);
    debug!("x86-32 image: {} bytes", buf.len());
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Item, Opcode, Operand};

    fn insn(opcode: Opcode, operands: Vec<Operand>) -> Item {
        Item::insn(opcode, operands)
    }

    #[test]
    fn ldi_is_five_bytes() {
        let ir = [
            insn(Opcode::Ldi, vec![Operand::Reg(0), Operand::Imm(42)]),
            insn(Opcode::Hlt, vec![]),
        ];
        let buf = generate(&ir).unwrap();
        assert_eq!(buf.bytes, [0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3]);
    }

    #[test]
    fn inc_dec_are_single_byte() {
        let ir = [
            insn(Opcode::Inc, vec![Operand::Reg(0)]),
            insn(Opcode::Dec, vec![Operand::Reg(3)]),
        ];
        let buf = generate(&ir).unwrap();
        assert_eq!(buf.bytes, [0x40, 0x4b]);
    }

    #[test]
    fn sys_is_int_80() {
        let ir = [insn(Opcode::Sys, vec![])];
        assert_eq!(generate(&ir).unwrap().bytes, [0xcd, 0x80]);
    }

    #[test]
    fn shift_by_register_pads_to_nine() {
        for (dst, src) in [(0u8, 3u8), (1, 3), (0, 1), (1, 1)] {
            let ir = [insn(Opcode::Shl, vec![Operand::Reg(dst), Operand::Reg(src)])];
            let buf = generate(&ir).unwrap();
            assert_eq!(buf.len(), 9, "dst={dst} src={src}");
        }
    }

    #[test]
    fn division_block_sizes() {
        let reg = [insn(Opcode::Div, vec![Operand::Reg(0), Operand::Reg(3)])];
        assert_eq!(generate(&reg).unwrap().len(), 9);
        let imm = [insn(Opcode::Div, vec![Operand::Reg(0), Operand::Imm(3)])];
        assert_eq!(generate(&imm).unwrap().len(), 18);
    }

    #[test]
    fn variable_access_is_absolute() {
        let ir = [
            insn(
                Opcode::Var,
                vec![Operand::Label("state".into()), Operand::Imm(7)],
            ),
            insn(
                Opcode::Set,
                vec![Operand::Label("state".into()), Operand::Reg(1)],
            ),
            insn(Opcode::Hlt, vec![]),
        ];
        let buf = generate(&ir).unwrap();
        // mov [disp32], ecx with the raw address (code is 6 + 1 bytes)
        assert_eq!(&buf.bytes[..2], [0x89, 0x0d]);
        assert_eq!(u32::from_le_bytes(buf.bytes[2..6].try_into().unwrap()), 7);
        // 4-byte slot with the initializer
        assert_eq!(&buf.bytes[7..11], 7u32.to_le_bytes());
    }

    #[test]
    fn memory_forms_handle_esp_and_ebp() {
        let ir = [
            insn(Opcode::Load, vec![Operand::Reg(0), Operand::Reg(4)]),
            insn(Opcode::Store, vec![Operand::Reg(5), Operand::Reg(1)]),
            insn(Opcode::Loadb, vec![Operand::Reg(0), Operand::Reg(3)]),
            insn(Opcode::Storeb, vec![Operand::Reg(3), Operand::Reg(1)]),
        ];
        let buf = generate(&ir).unwrap();
        assert_eq!(
            buf.bytes,
            [
                0x8b, 0x04, 0x24, // mov eax, [esp]
                0x89, 0x4d, 0x00, // mov [ebp+0], ecx
                0x0f, 0xb6, 0x03, // movzx eax, byte [ebx]
                0x88, 0x0b, //       mov byte [ebx], cl
            ]
        );
    }

    #[test]
    fn multiply_forms() {
        let reg = [insn(Opcode::Mul, vec![Operand::Reg(0), Operand::Reg(2)])];
        assert_eq!(generate(&reg).unwrap().bytes, [0x0f, 0xaf, 0xc2]);
        let imm = [insn(Opcode::Mul, vec![Operand::Reg(1), Operand::Imm(7)])];
        assert_eq!(
            generate(&imm).unwrap().bytes,
            [0x69, 0xc9, 0x07, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn alu_immediates_use_the_native_form() {
        let ir = [
            insn(Opcode::Add, vec![Operand::Reg(3), Operand::Imm(1000)]),
            insn(Opcode::Cmp, vec![Operand::Reg(0), Operand::Imm(-1)]),
        ];
        let buf = generate(&ir).unwrap();
        assert_eq!(
            buf.bytes,
            [
                0x81, 0xc3, 0xe8, 0x03, 0x00, 0x00, // add ebx, 1000
                0x81, 0xf8, 0xff, 0xff, 0xff, 0xff, // cmp eax, -1
            ]
        );
    }

    #[test]
    fn x86_64_extras_are_rejected() {
        for opcode in [Opcode::Cpuid, Opcode::Rdtsc] {
            let ir = [insn(opcode, vec![])];
            assert!(matches!(
                generate(&ir),
                Err(Error::UnsupportedOpcode(..))
            ));
        }
        let ir = [insn(Opcode::Bswap, vec![Operand::Reg(0)])];
        assert!(matches!(generate(&ir), Err(Error::UnsupportedOpcode(..))));
    }
}
