//! The PE32+ image writer: computes the final layout up front, allocates
//! the file-sized buffer, then serializes headers and section contents into
//! place.

use crate::error::{self, Error};
use crate::layout::CodeBuffer;
use crate::pe::data_directories::{
    DataDirectory, IMPORT_ADDRESS_TABLE, IMPORT_TABLE, NUM_DATA_DIRECTORIES,
};
use crate::pe::header::{
    CoffHeader, DosHeader, COFF_MACHINE_X86_64, IMAGE_FILE_EXECUTABLE_IMAGE,
    IMAGE_FILE_LARGE_ADDRESS_AWARE, PE_MAGIC,
};
use crate::pe::import;
use crate::pe::optional_header::{
    StandardFields64, WindowsFields64, MAGIC_64, SIZEOF_OPTIONAL_HEADER_BARE,
    SIZEOF_OPTIONAL_HEADER_FULL,
};
use crate::pe::section_table::{
    SectionTable, IMAGE_SCN_CNT_CODE, IMAGE_SCN_CNT_INITIALIZED_DATA, IMAGE_SCN_MEM_EXECUTE,
    IMAGE_SCN_MEM_READ, IMAGE_SCN_MEM_WRITE,
};
use alloc::string::String;
use alloc::vec::Vec;
use log::debug;
use scroll::Pwrite;

const SECTION_ALIGNMENT: u32 = 0x1000;
const FILE_ALIGNMENT: u32 = 0x200;
/// RVA of `.text` and the entry point.
const TEXT_RVA: u32 = 0x1000;
const SIZEOF_HEADERS: u32 = 0x200;

fn align_to(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) / alignment * alignment
}

/// Wrap an x86-64 code buffer in a PE32+ console executable.
///
/// With `iat_offset == 0` the image is a single `.text` section and carries
/// no data directories. With an IAT present, a second `.idata` section is
/// generated, directories 1 and 12 point at the Import Directory Table and
/// the in-`.text` IAT, `.text` becomes writable so the loader can patch the
/// IAT, and the on-disk IAT is pre-filled with the Import Lookup Table
/// entries.
pub fn emit_exe(code: &CodeBuffer) -> error::Result<Vec<u8>> {
    if code.is_empty() {
        return Err(Error::Malformed(String::from("empty code buffer")));
    }
    let code_len = code.len() as u32;
    let text_raw_size = align_to(code_len, FILE_ALIGNMENT);
    let has_imports = code.iat_offset != 0;
    let idata_rva = TEXT_RVA + align_to(code_len, SECTION_ALIGNMENT);
    let idata_raw_offset = SIZEOF_HEADERS + text_raw_size;

    let file_size = if has_imports {
        SIZEOF_HEADERS + text_raw_size + FILE_ALIGNMENT
    } else {
        SIZEOF_HEADERS + text_raw_size
    };
    let mut image = vec![0u8; file_size as usize];
    debug!(
        "pe: {} bytes of code, imports: {}, file size {:#x}",
        code_len, has_imports, file_size
    );

    let offset = &mut 0usize;
    image.gwrite_with(DosHeader::default(), offset, scroll::LE)?;
    image.gwrite_with(PE_MAGIC, offset, scroll::LE)?;
    image.gwrite_with(
        CoffHeader {
            machine: COFF_MACHINE_X86_64,
            number_of_sections: if has_imports { 2 } else { 1 },
            time_date_stamp: 0,
            pointer_to_symbol_table: 0,
            number_of_symbol_table: 0,
            size_of_optional_header: if has_imports {
                SIZEOF_OPTIONAL_HEADER_FULL as u16
            } else {
                SIZEOF_OPTIONAL_HEADER_BARE as u16
            },
            characteristics: IMAGE_FILE_EXECUTABLE_IMAGE | IMAGE_FILE_LARGE_ADDRESS_AWARE,
        },
        offset,
        scroll::LE,
    )?;
    image.gwrite_with(
        StandardFields64 {
            magic: MAGIC_64,
            major_linker_version: 0,
            minor_linker_version: 0,
            size_of_code: text_raw_size,
            size_of_initialized_data: if has_imports { FILE_ALIGNMENT } else { 0 },
            size_of_uninitialized_data: 0,
            address_of_entry_point: TEXT_RVA,
            base_of_code: TEXT_RVA,
        },
        offset,
        scroll::LE,
    )?;
    image.gwrite_with(
        WindowsFields64 {
            size_of_image: if has_imports {
                idata_rva + SECTION_ALIGNMENT
            } else {
                TEXT_RVA + align_to(code_len, SECTION_ALIGNMENT)
            },
            number_of_rva_and_sizes: if has_imports {
                NUM_DATA_DIRECTORIES as u32
            } else {
                0
            },
            ..Default::default()
        },
        offset,
        scroll::LE,
    )?;

    if has_imports {
        let mut directories = [DataDirectory::default(); NUM_DATA_DIRECTORIES];
        directories[IMPORT_TABLE] = DataDirectory {
            virtual_address: idata_rva,
            size: import::SIZEOF_IDT as u32,
        };
        directories[IMPORT_ADDRESS_TABLE] = DataDirectory {
            virtual_address: TEXT_RVA + code.iat_offset as u32,
            size: (code.iat_count * 8) as u32,
        };
        for directory in directories {
            image.gwrite_with(directory, offset, scroll::LE)?;
        }
    }

    let mut text = SectionTable::with_name(".text")?;
    text.virtual_size = code_len;
    text.virtual_address = TEXT_RVA;
    text.size_of_raw_data = text_raw_size;
    text.pointer_to_raw_data = SIZEOF_HEADERS;
    text.characteristics = IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ;
    if has_imports {
        // loader patches the IAT in place
        text.characteristics |= IMAGE_SCN_MEM_WRITE;
    }
    image.gwrite_with(text, offset, scroll::LE)?;

    if has_imports {
        let mut idata = SectionTable::with_name(".idata")?;
        idata.virtual_size = import::SIZEOF_IDATA as u32;
        idata.virtual_address = idata_rva;
        idata.size_of_raw_data = FILE_ALIGNMENT;
        idata.pointer_to_raw_data = idata_raw_offset;
        idata.characteristics =
            IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE;
        image.gwrite_with(idata, offset, scroll::LE)?;
    }
    debug_assert!(*offset <= SIZEOF_HEADERS as usize);

    image.pwrite(&code.bytes[..], SIZEOF_HEADERS as usize)?;
    if has_imports {
        let mut iat = SIZEOF_HEADERS as usize + code.iat_offset;
        for value in import::lookup_entries(idata_rva) {
            image.gwrite_with(value, &mut iat, scroll::LE)?;
        }
        let block = import::build(idata_rva, TEXT_RVA + code.iat_offset as u32)?;
        image.pwrite(&block[..], idata_raw_offset as usize)?;
    }
    Ok(image)
}

/// Emit the image and write it out in one call.
#[cfg(feature = "std")]
pub fn write_exe<W: std::io::Write>(code: &CodeBuffer, writer: &mut W) -> error::Result<()> {
    let image = emit_exe(code)?;
    writer.write_all(&image)?;
    Ok(())
}
