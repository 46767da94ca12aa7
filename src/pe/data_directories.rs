//! The optional header's data directories.

use scroll::{Pwrite, SizeWith};

#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pwrite, SizeWith)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

pub const SIZEOF_DATA_DIRECTORY: usize = 8;
pub const NUM_DATA_DIRECTORIES: usize = 16;

/// Directory index of the Import Directory Table.
pub const IMPORT_TABLE: usize = 1;
/// Directory index of the Import Address Table.
pub const IMPORT_ADDRESS_TABLE: usize = 12;
