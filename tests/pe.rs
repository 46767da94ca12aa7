use anvil::ir::{Item, Opcode, Operand};
use anvil::layout::CodeBuffer;
use anvil::pe::emit_exe;
use anvil::x86_64::{self, win32};
use anvil::{assemble, Os, Target};

fn insn(opcode: Opcode, operands: Vec<Operand>) -> Item {
    Item::insn(opcode, operands)
}

#[test]
fn minimal_image_without_imports() {
    let code = CodeBuffer {
        bytes: vec![0x90; 16],
        iat_offset: 0,
        iat_count: 0,
    };
    let image = emit_exe(&code).unwrap();
    assert_eq!(image.len(), 1024);
    assert_eq!(&image[..2], b"MZ");
    assert_eq!(&image[0x40..0x44], b"PE\0\0");
    assert_eq!(
        u16::from_le_bytes(image[0x44..0x46].try_into().unwrap()),
        0x8664
    );
    // one section, SizeOfOptionalHeader = 112
    assert_eq!(u16::from_le_bytes(image[0x46..0x48].try_into().unwrap()), 1);
    assert_eq!(
        u16::from_le_bytes(image[0x54..0x56].try_into().unwrap()),
        112
    );
    // SizeOfImage is section-aligned
    let size_of_image = u32::from_le_bytes(image[0x90..0x94].try_into().unwrap());
    assert_eq!(size_of_image % 0x1000, 0);
    // code padded to the file alignment
    assert_eq!(&image[0x200..0x210], &[0x90; 16]);
    assert!(image[0x210..].iter().all(|&b| b == 0));
}

#[test]
fn win32_program_end_to_end() {
    let ir = [
        insn(Opcode::Ldi, vec![Operand::Reg(0), Operand::Imm(1)]),
        insn(
            Opcode::Lds,
            vec![Operand::Reg(6), Operand::Str(b"hello".to_vec())],
        ),
        insn(Opcode::Ldi, vec![Operand::Reg(2), Operand::Imm(5)]),
        insn(Opcode::Sys, vec![]),
        insn(Opcode::Hlt, vec![]),
    ];
    let image = assemble(&ir, Target::X86_64, Os::Win32).unwrap();

    assert_eq!(&image[..2], b"MZ");
    assert_eq!(&image[0x40..0x44], b"PE\0\0");
    // two sections and all sixteen data directories
    assert_eq!(u16::from_le_bytes(image[0x46..0x48].try_into().unwrap()), 2);
    assert_eq!(
        u16::from_le_bytes(image[0x54..0x56].try_into().unwrap()),
        240
    );
    let num_dirs = u32::from_le_bytes(image[0xc4..0xc8].try_into().unwrap());
    assert_eq!(num_dirs, 16);

    // the buffer layout win32 mode produced
    let buf = x86_64::generate(&ir, Os::Win32).unwrap();
    assert!(buf.iat_offset > 0);
    assert_eq!(buf.iat_count, 5);

    // directory 1: import table in .idata; directory 12: the IAT in .text
    let import_dir = u32::from_le_bytes(image[0xd0..0xd4].try_into().unwrap());
    let import_size = u32::from_le_bytes(image[0xd4..0xd8].try_into().unwrap());
    assert_eq!(import_size, 40);
    let iat_dir = u32::from_le_bytes(image[0x128..0x12c].try_into().unwrap());
    assert_eq!(iat_dir as usize, 0x1000 + buf.iat_offset);

    // .text is read/write/execute so the loader can patch the IAT
    let text_chars = u32::from_le_bytes(image[0x148 + 36..0x148 + 40].try_into().unwrap());
    assert_eq!(text_chars, 0xe000_0020);

    // on-disk IAT equals the import lookup table
    let idata_raw = {
        let ptr = u32::from_le_bytes(image[0x170 + 20..0x170 + 24].try_into().unwrap());
        ptr as usize
    };
    let iat_file_offset = 0x200 + buf.iat_offset;
    for slot in 0..3 {
        let iat_entry = u64::from_le_bytes(
            image[iat_file_offset + slot * 8..iat_file_offset + slot * 8 + 8]
                .try_into()
                .unwrap(),
        );
        let ilt_entry = u64::from_le_bytes(
            image[idata_raw + 40 + slot * 8..idata_raw + 40 + slot * 8 + 8]
                .try_into()
                .unwrap(),
        );
        assert_eq!(iat_entry, ilt_entry);
        assert_eq!(iat_entry as u32, import_dir + [72, 88, 100][slot] as u32);
    }

    // the import names are where the lookup entries say
    assert_eq!(&image[idata_raw + 74..idata_raw + 86], b"GetStdHandle");
    assert_eq!(&image[idata_raw + 114..idata_raw + 126], b"kernel32.dll");

    // the runtime block (and with it the IAT) sits inside .text on disk
    assert_eq!(
        &image[0x200 + buf.len() - win32::BLOCK_SIZE..0x200 + buf.len() - win32::BLOCK_SIZE + 4],
        &[0x48, 0x83, 0xf8, 0x00]
    );
}

#[test]
fn write_exe_hits_the_sink() {
    let code = CodeBuffer {
        bytes: vec![0xc3],
        iat_offset: 0,
        iat_count: 0,
    };
    let mut sink = Vec::new();
    anvil::pe::write_exe(&code, &mut sink).unwrap();
    assert_eq!(sink, emit_exe(&code).unwrap());
}
