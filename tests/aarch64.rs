use anvil::ir::{Item, Opcode, Operand};
use anvil::{assemble, Os, Target};

fn insn(opcode: Opcode, operands: Vec<Operand>) -> Item {
    Item::insn(opcode, operands)
}

/// The golden 12 bytes for `LDI R0, #7; MOV R1, R0; RET`.
const MOV_RET: [u8; 12] = [
    0xe0, 0x00, 0x80, 0xd2, // movz x0, #7
    0xe1, 0x03, 0x00, 0xaa, // orr x1, xzr, x0
    0xc0, 0x03, 0x5f, 0xd6, // ret x30
];

#[test]
fn mov_ret_matches_golden_bytes() {
    let ir = [
        insn(Opcode::Ldi, vec![Operand::Reg(0), Operand::Imm(7)]),
        insn(Opcode::Mov, vec![Operand::Reg(1), Operand::Reg(0)]),
        insn(Opcode::Ret, vec![]),
    ];
    let code = assemble(&ir, Target::Aarch64, Os::Linux).unwrap();
    assert_eq!(code, MOV_RET);
}

#[test]
fn every_instruction_is_a_word_multiple() {
    let ir = [
        insn(Opcode::Ldi, vec![Operand::Reg(0), Operand::Imm(0x12345)]),
        insn(Opcode::Add, vec![Operand::Reg(0), Operand::Imm(2048)]),
        insn(Opcode::Mul, vec![Operand::Reg(0), Operand::Imm(3)]),
        insn(Opcode::Shl, vec![Operand::Reg(0), Operand::Imm(4)]),
        insn(Opcode::Push, vec![Operand::Reg(0)]),
        insn(Opcode::Pop, vec![Operand::Reg(1)]),
        insn(Opcode::Sys, vec![]),
        insn(Opcode::Ret, vec![]),
    ];
    let code = assemble(&ir, Target::Aarch64, Os::Linux).unwrap();
    assert_eq!(code.len() % 4, 0);
}

#[test]
fn forward_and_backward_branches() {
    let ir = [
        Item::label("start"),
        insn(Opcode::Cmp, vec![Operand::Reg(0), Operand::Imm(0)]),
        insn(Opcode::Jz, vec![Operand::Label("end".into())]),
        insn(Opcode::Dec, vec![Operand::Reg(0)]),
        insn(Opcode::Jmp, vec![Operand::Label("start".into())]),
        Item::label("end"),
        insn(Opcode::Ret, vec![]),
    ];
    let code = assemble(&ir, Target::Aarch64, Os::Linux).unwrap();
    // b.eq at word 1 jumps forward three words to `end`
    let w1 = u32::from_le_bytes(code[4..8].try_into().unwrap());
    assert_eq!(w1, 0x5400_0000 | (3 << 5)); // imm19 = 3, cond = EQ
    // b at word 3 jumps back three words
    let w3 = u32::from_le_bytes(code[12..16].try_into().unwrap());
    assert_eq!(w3, 0x1400_0000 | ((-3i32 as u32) & 0x03ff_ffff));
}

#[test]
fn wfi_dmb_are_arm_only() {
    for opcode in [Opcode::Wfi, Opcode::Dmb] {
        let ir = [insn(opcode, vec![])];
        assert!(assemble(&ir, Target::Aarch64, Os::Linux).is_ok());
        assert!(assemble(&ir, Target::X86_64, Os::Linux).is_err());
        assert!(assemble(&ir, Target::X86, Os::None).is_err());
        assert!(assemble(&ir, Target::Mcs51, Os::None).is_err());
    }
}

#[test]
fn data_image_is_appended() {
    let ir = [
        insn(
            Opcode::Var,
            vec![Operand::Label("state".into()), Operand::Imm(0x1122)],
        ),
        insn(
            Opcode::Set,
            vec![Operand::Label("state".into()), Operand::Reg(0)],
        ),
        insn(Opcode::Ret, vec![]),
    ];
    let code = assemble(&ir, Target::Aarch64, Os::Linux).unwrap();
    // set (12) + ret (4), then the 8-byte slot
    assert_eq!(code.len(), 16 + 8);
    assert_eq!(&code[16..24], &0x1122u64.to_le_bytes());
}
