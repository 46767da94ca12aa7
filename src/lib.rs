//! # anvil
//!
//! An impish little retargetable assembler.
//!
//! `anvil` takes an ordered stream of [`ir::Item`]s (one architecture-neutral
//! virtual instruction set over registers `R0..R15`) and lowers it to native
//! machine code for one of four targets:
//!
//! * **x86-64**, optionally wrapped in a PE32+ executable for Windows,
//! * **IA-32** (x86-32),
//! * **AArch64**,
//! * **Intel 8051**.
//!
//! Every backend runs the same two-pass-plus-patching pipeline: pass 1 sizes
//! each instruction and lays out labels, variables, buffers and string
//! literals; pass 2 emits bytes and queues fixups for references that need
//! later resolution; pass 3 patches the fixups with range checking. The data
//! image (variables, zero-filled buffers, strings) is appended to the code,
//! and on x86-64/Win32 a fixed runtime block translates the Unix-flavored
//! `SYS`/`HLT` convention to `WriteFile`/`ReadFile`/`ExitProcess`.
//!
//! ```rust
//! use anvil::ir::{Item, Opcode, Operand};
//! use anvil::{Os, Target, assemble};
//!
//! let ir = [
//!     Item::insn(Opcode::Ldi, vec![Operand::Reg(0), Operand::Imm(42)]),
//!     Item::insn(Opcode::Hlt, vec![]),
//! ];
//! let code = assemble(&ir, Target::X86_64, Os::Linux).unwrap();
//! assert_eq!(code, [0x48, 0xc7, 0xc0, 0x2a, 0x00, 0x00, 0x00, 0xc3]);
//! ```
//!
//! # Feature flags
//!
//! Each backend sits behind a cargo feature (`x86_64`, `x86`, `aarch64`,
//! `mcs51`), with `pe` adding the PE32+ container emitter on top of
//! `x86_64`; `default` enables all of them. The crate is `no_std` + `alloc`
//! capable; disabling `std` drops file writing and `std::error::Error`.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "alloc")]
#[macro_use]
extern crate alloc;

#[cfg(feature = "alloc")]
pub mod error;
#[cfg(feature = "alloc")]
pub mod ir;
#[cfg(feature = "alloc")]
pub mod layout;

#[cfg(feature = "aarch64")]
pub mod aarch64;
#[cfg(feature = "mcs51")]
pub mod mcs51;
#[cfg(feature = "pe")]
pub mod pe;
#[cfg(feature = "x86")]
pub mod x86;
#[cfg(feature = "x86_64")]
pub mod x86_64;

/// The concrete machine to emit for.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub enum Target {
    X86_64,
    /// IA-32.
    X86,
    Aarch64,
    /// Intel 8051 (baremetal).
    Mcs51,
}

impl Target {
    /// The triple-ish name a driver prints, e.g. in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Target::X86_64 => "x86-64",
            Target::X86 => "x86-32",
            Target::Aarch64 => "arm64",
            Target::Mcs51 => "8051",
        }
    }
}

/// Operating-system flavor. `Linux` and `None` share encodings everywhere;
/// `Win32` reroutes x86-64 `SYS`/`HLT` through the appended runtime block
/// and is what the PE emitter expects.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash, Default)]
pub enum Os {
    #[default]
    None,
    Linux,
    Win32,
}

/// One-call convenience: run the right backend and, for `Win32`, wrap the
/// result in a PE32+ image. Raw targets return the code buffer bytes
/// verbatim.
#[cfg(feature = "alloc")]
pub fn assemble(
    ir: &[ir::Item],
    target: Target,
    os: Os,
) -> error::Result<alloc::vec::Vec<u8>> {
    if os == Os::Win32 && target != Target::X86_64 {
        return Err(error::Error::Malformed(alloc::format!(
            "win32 output is only supported on x86-64, not {}",
            target.name()
        )));
    }
    match target {
        #[cfg(feature = "x86_64")]
        Target::X86_64 => {
            let code = x86_64::generate(ir, os)?;
            #[cfg(feature = "pe")]
            if os == Os::Win32 {
                return pe::writer::emit_exe(&code);
            }
            Ok(code.into_bytes())
        }
        #[cfg(feature = "x86")]
        Target::X86 => Ok(x86::generate(ir)?.into_bytes()),
        #[cfg(feature = "aarch64")]
        Target::Aarch64 => Ok(aarch64::generate(ir)?.into_bytes()),
        #[cfg(feature = "mcs51")]
        Target::Mcs51 => Ok(mcs51::generate(ir)?.into_bytes()),
        #[allow(unreachable_patterns, reason = "arms vanish with their features")]
        other => Err(error::Error::Malformed(alloc::format!(
            "support for {} was not compiled in",
            other.name()
        ))),
    }
}
