//! Write-side import machinery: the fixed `.idata` block naming the
//! `kernel32.dll` functions the Win32 runtime block calls.
//!
//! The block layout is constant: two Import Directory Table entries
//! (kernel32 + terminator), a four-entry Import Lookup Table, the by-name
//! hint/name entries (even-aligned), and the DLL name:
//!
//! | offset | bytes | contents |
//! |---|---|---|
//! | 0 | 40 | IDT: kernel32 entry + null entry |
//! | 40 | 32 | ILT: GetStdHandle, WriteFile, ExitProcess, null |
//! | 72 | 42 | hint/name entries |
//! | 114 | 13 | `"kernel32.dll\0"` |

use crate::error;
use scroll::{Pwrite, SizeWith};

#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pwrite, SizeWith)]
pub struct ImportDirectoryEntry {
    pub import_lookup_table_rva: u32,
    pub time_date_stamp: u32,
    pub forwarder_chain: u32,
    pub name_rva: u32,
    pub import_address_table_rva: u32,
}

pub const SIZEOF_IMPORT_DIRECTORY_ENTRY: usize = 20;

/// The imported functions, in IAT slot order.
pub const IMPORTS: [&str; 3] = ["GetStdHandle", "WriteFile", "ExitProcess"];

/// Total size of the `.idata` block.
pub const SIZEOF_IDATA: usize = 127;
/// Size of the Import Directory Table (both entries).
pub const SIZEOF_IDT: usize = 2 * SIZEOF_IMPORT_DIRECTORY_ENTRY;
/// Offset of the Import Lookup Table within the block.
pub const ILT_OFFSET: usize = 40;
/// Offsets of the hint/name entries, each even-aligned.
pub const HINT_NAME_OFFSETS: [usize; 3] = [72, 88, 100];
/// Offset of the DLL name string.
pub const DLL_NAME_OFFSET: usize = 114;

/// The Import Lookup Table values (hint/name RVAs, null-terminated) for a
/// block based at `idata_rva`. The on-disk IAT is pre-filled with exactly
/// these; the loader replaces them with resolved addresses.
pub fn lookup_entries(idata_rva: u32) -> [u64; 4] {
    [
        (idata_rva as u64) + HINT_NAME_OFFSETS[0] as u64,
        (idata_rva as u64) + HINT_NAME_OFFSETS[1] as u64,
        (idata_rva as u64) + HINT_NAME_OFFSETS[2] as u64,
        0,
    ]
}

/// Serialize the block for a `.idata` section at `idata_rva`, pointing the
/// directory entry's IAT field at `iat_rva` (inside `.text`).
pub fn build(idata_rva: u32, iat_rva: u32) -> error::Result<[u8; SIZEOF_IDATA]> {
    let mut block = [0u8; SIZEOF_IDATA];
    let entry = ImportDirectoryEntry {
        import_lookup_table_rva: idata_rva + ILT_OFFSET as u32,
        time_date_stamp: 0,
        forwarder_chain: 0,
        name_rva: idata_rva + DLL_NAME_OFFSET as u32,
        import_address_table_rva: iat_rva,
    };
    block.pwrite_with(entry, 0, scroll::LE)?;
    // the null directory entry is already zero

    let mut offset = ILT_OFFSET;
    for value in lookup_entries(idata_rva) {
        block.gwrite_with(value, &mut offset, scroll::LE)?;
    }

    for (name, hint_offset) in IMPORTS.iter().zip(HINT_NAME_OFFSETS) {
        // 2-byte hint of zero, then the NUL-terminated name
        block[hint_offset + 2..hint_offset + 2 + name.len()].copy_from_slice(name.as_bytes());
    }
    block[DLL_NAME_OFFSET..DLL_NAME_OFFSET + 12].copy_from_slice(b"kernel32.dll");
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_is_127_bytes_with_fixed_offsets() {
        let rva = 0x3000;
        let block = build(rva, 0x1100).unwrap();
        assert_eq!(block.len(), SIZEOF_IDATA);
        // IDT entry 0
        assert_eq!(
            u32::from_le_bytes(block[0..4].try_into().unwrap()),
            rva + ILT_OFFSET as u32
        );
        assert_eq!(
            u32::from_le_bytes(block[12..16].try_into().unwrap()),
            rva + DLL_NAME_OFFSET as u32
        );
        assert_eq!(u32::from_le_bytes(block[16..20].try_into().unwrap()), 0x1100);
        // null IDT entry
        assert!(block[20..40].iter().all(|&b| b == 0));
        // ILT terminator
        assert!(block[64..72].iter().all(|&b| b == 0));
        // hint/name entries
        assert_eq!(&block[74..86], b"GetStdHandle");
        assert_eq!(&block[90..99], b"WriteFile");
        assert_eq!(&block[102..113], b"ExitProcess");
        assert_eq!(&block[114..126], b"kernel32.dll");
        assert_eq!(block[126], 0);
    }
}
