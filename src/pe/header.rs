//! The DOS and COFF headers, write-side only.

use scroll::{Pwrite, SizeWith};

/// `IMAGE_DOS_HEADER`. Only two fields matter to a modern loader: the `MZ`
/// signature and `pe_pointer` (`e_lfanew`). No DOS stub program follows;
/// the PE signature sits directly at `0x40`.
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Pwrite)]
pub struct DosHeader {
    /// `e_magic`: "MZ" read little-endian.
    pub signature: u16,
    /// e_cblp
    pub bytes_on_last_page: u16,
    /// e_cp
    pub pages_in_file: u16,
    /// e_crlc
    pub relocations: u16,
    /// e_cparhdr
    pub size_of_header_in_paragraphs: u16,
    /// e_minalloc
    pub minimum_extra_paragraphs_needed: u16,
    /// e_maxalloc
    pub maximum_extra_paragraphs_needed: u16,
    /// e_ss
    pub initial_relative_ss: u16,
    /// e_sp
    pub initial_sp: u16,
    /// e_csum
    pub checksum: u16,
    /// e_ip
    pub initial_ip: u16,
    /// e_cs
    pub initial_relative_cs: u16,
    /// e_lfarlc
    pub file_address_of_relocation_table: u16,
    /// e_ovno
    pub overlay_number: u16,
    /// e_res[4]
    pub reserved: [u16; 4],
    /// e_oemid
    pub oem_id: u16,
    /// e_oeminfo
    pub oem_info: u16,
    /// e_res2[10]
    pub reserved2: [u16; 10],
    /// `e_lfanew`: file offset of the PE signature, always at `0x3c`.
    pub pe_pointer: u32,
}

#[doc(alias("IMAGE_DOS_SIGNATURE"))]
pub const DOS_MAGIC: u16 = 0x5a4d;
pub const SIZEOF_DOS_HEADER: usize = 0x40;
pub const PE_POINTER_OFFSET: u32 = 0x3c;

impl Default for DosHeader {
    fn default() -> Self {
        DosHeader {
            signature: DOS_MAGIC,
            bytes_on_last_page: 0,
            pages_in_file: 0,
            relocations: 0,
            size_of_header_in_paragraphs: 0,
            minimum_extra_paragraphs_needed: 0,
            maximum_extra_paragraphs_needed: 0,
            initial_relative_ss: 0,
            initial_sp: 0,
            checksum: 0,
            initial_ip: 0,
            initial_relative_cs: 0,
            file_address_of_relocation_table: 0,
            overlay_number: 0,
            reserved: [0; 4],
            oem_id: 0,
            oem_info: 0,
            reserved2: [0; 10],
            pe_pointer: SIZEOF_DOS_HEADER as u32,
        }
    }
}

/// COFF Header
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pwrite, SizeWith)]
pub struct CoffHeader {
    /// The machine type
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbol_table: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

pub const SIZEOF_COFF_HEADER: usize = 20;
/// PE\0\0, little endian
pub const PE_MAGIC: u32 = 0x0000_4550;
pub const SIZEOF_PE_MAGIC: usize = 4;
/// x64
pub const COFF_MACHINE_X86_64: u16 = 0x8664;
/// The file is runnable.
pub const IMAGE_FILE_EXECUTABLE_IMAGE: u16 = 0x0002;
/// Addresses above 2 GiB are fine.
pub const IMAGE_FILE_LARGE_ADDRESS_AWARE: u16 = 0x0020;

#[cfg(test)]
mod tests {
    use super::*;
    use scroll::Pwrite;

    #[test]
    fn dos_header_is_64_bytes_of_le() {
        let mut bytes = [0u8; SIZEOF_DOS_HEADER];
        let written = bytes
            .pwrite_with(DosHeader::default(), 0, scroll::LE)
            .unwrap();
        assert_eq!(written, SIZEOF_DOS_HEADER);
        assert_eq!(&bytes[..2], b"MZ");
        assert_eq!(
            u32::from_le_bytes(bytes[PE_POINTER_OFFSET as usize..].try_into().unwrap()),
            0x40
        );
    }

    #[test]
    fn coff_header_is_20_bytes() {
        let mut bytes = [0u8; SIZEOF_COFF_HEADER];
        let coff = CoffHeader {
            machine: COFF_MACHINE_X86_64,
            number_of_sections: 1,
            size_of_optional_header: 112,
            characteristics: IMAGE_FILE_EXECUTABLE_IMAGE | IMAGE_FILE_LARGE_ADDRESS_AWARE,
            ..Default::default()
        };
        let written = bytes.pwrite_with(coff, 0, scroll::LE).unwrap();
        assert_eq!(written, SIZEOF_COFF_HEADER);
        assert_eq!(u16::from_le_bytes(bytes[..2].try_into().unwrap()), 0x8664);
    }
}
