//! A minimal PE32+ emitter.
//!
//! Wraps an x86-64 code buffer in a Windows executable image: DOS header,
//! COFF and optional headers, section tables, and, when the buffer carries
//! an Import Address Table (`iat_offset != 0`), a generated `.idata`
//! section whose Import Lookup Table names the `kernel32.dll` functions the
//! appended runtime block calls through. All multi-byte fields are written
//! little-endian via `scroll`.

pub mod data_directories;
pub mod header;
pub mod import;
pub mod optional_header;
pub mod section_table;
pub mod writer;

pub use writer::emit_exe;
#[cfg(feature = "std")]
pub use writer::write_exe;
