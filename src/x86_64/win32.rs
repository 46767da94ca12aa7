//! The Win32 runtime block appended after the data image when targeting
//! Windows: a syscall dispatcher pair that translates the Unix-flavored
//! `SYS` convention (`RAX` = 0 read / 1 write, `RSI` = buffer, `RDX` =
//! count) into `ReadFile`/`WriteFile`, an exit dispatcher, scratch storage
//! for the lazily fetched console handles, and the Import Address Table
//! the PE loader patches at process start.
//!
//! The block is position-independent relative to itself: every internal
//! `RIP`-relative displacement is a constant derived from the offsets below,
//! so the whole thing is a fixed byte image. Each dispatcher is NOP-padded
//! to exactly [`DISPATCH_SIZE`] bytes to keep those constants stable.

/// Offset of the `SYS` entry point (the number check) within the block.
pub const SYS_ENTRY: usize = 0;
/// Offset of the write dispatcher.
pub const WRITE_DISPATCH: usize = 6;
/// Offset of the read dispatcher.
pub const READ_DISPATCH: usize = 90;
/// Offset of the `HLT` (exit) dispatcher.
pub const EXIT_DISPATCH: usize = 174;
/// Offset of the four 8-byte scratch slots: stdout handle, stdin handle,
/// bytes-written, bytes-read.
pub const SCRATCH: usize = 190;
/// Offset of the Import Address Table within the block.
pub const IAT: usize = 222;
/// IAT slots: GetStdHandle, WriteFile, ReadFile, ExitProcess, null.
pub const IAT_SLOTS: usize = 5;
/// Size of each NOP-padded dispatcher body.
pub const DISPATCH_SIZE: usize = 84;
/// Total size of the runtime block.
pub const BLOCK_SIZE: usize = 262;

/// `cmp rax, 0; je read_dispatch`; the write dispatcher falls through.
const ENTRY: [u8; 6] = [0x48, 0x83, 0xf8, 0x00, 0x74, 0x54];

/// `WriteFile(stdout, rsi, rdx, &written, 0)`, fetching and caching the
/// stdout handle via `GetStdHandle(-11)` on first use.
const WRITE: [u8; DISPATCH_SIZE] = [
    0x48, 0x8b, 0x05, 0xb1, 0x00, 0x00, 0x00, // mov rax, [rip+177]  ; stdout handle
    0x48, 0x85, 0xc0, //                         test rax, rax
    0x75, 0x1a, //                               jnz .have_handle
    0xb9, 0xf5, 0xff, 0xff, 0xff, //             mov ecx, -11        ; STD_OUTPUT_HANDLE
    0x48, 0x83, 0xec, 0x28, //                   sub rsp, 40
    0xff, 0x15, 0xbd, 0x00, 0x00, 0x00, //      call [rip+189]      ; IAT.GetStdHandle
    0x48, 0x83, 0xc4, 0x28, //                   add rsp, 40
    0x48, 0x89, 0x05, 0x92, 0x00, 0x00, 0x00, // mov [rip+146], rax  ; cache it
    0x48, 0x89, 0xc1, //                         mov rcx, rax        ; hFile
    0x49, 0x89, 0xd0, //                         mov r8, rdx         ; nNumberOfBytesToWrite
    0x48, 0x89, 0xf2, //                         mov rdx, rsi        ; lpBuffer
    0x4c, 0x8d, 0x0d, 0x92, 0x00, 0x00, 0x00, // lea r9, [rip+146]   ; lpNumberOfBytesWritten
    0x48, 0x83, 0xec, 0x38, //                   sub rsp, 56
    0x48, 0xc7, 0x44, 0x24, 0x20, 0x00, 0x00, 0x00, 0x00, // mov qword [rsp+32], 0
    0xff, 0x15, 0x97, 0x00, 0x00, 0x00, //      call [rip+151]      ; IAT.WriteFile
    0x48, 0x83, 0xc4, 0x38, //                   add rsp, 56
    0xc3, //                                     ret
    0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
];

/// `ReadFile(stdin, rsi, rdx, &read, 0)` with `GetStdHandle(-10)`.
const READ: [u8; DISPATCH_SIZE] = [
    0x48, 0x8b, 0x05, 0x65, 0x00, 0x00, 0x00, // mov rax, [rip+101]  ; stdin handle
    0x48, 0x85, 0xc0, //                         test rax, rax
    0x75, 0x1a, //                               jnz .have_handle
    0xb9, 0xf6, 0xff, 0xff, 0xff, //             mov ecx, -10        ; STD_INPUT_HANDLE
    0x48, 0x83, 0xec, 0x28, //                   sub rsp, 40
    0xff, 0x15, 0x69, 0x00, 0x00, 0x00, //      call [rip+105]      ; IAT.GetStdHandle
    0x48, 0x83, 0xc4, 0x28, //                   add rsp, 40
    0x48, 0x89, 0x05, 0x46, 0x00, 0x00, 0x00, // mov [rip+70], rax   ; cache it
    0x48, 0x89, 0xc1, //                         mov rcx, rax
    0x49, 0x89, 0xd0, //                         mov r8, rdx
    0x48, 0x89, 0xf2, //                         mov rdx, rsi
    0x4c, 0x8d, 0x0d, 0x46, 0x00, 0x00, 0x00, // lea r9, [rip+70]    ; lpNumberOfBytesRead
    0x48, 0x83, 0xec, 0x38, //                   sub rsp, 56
    0x48, 0xc7, 0x44, 0x24, 0x20, 0x00, 0x00, 0x00, 0x00, // mov qword [rsp+32], 0
    0xff, 0x15, 0x4b, 0x00, 0x00, 0x00, //      call [rip+75]       ; IAT.ReadFile
    0x48, 0x83, 0xc4, 0x38, //                   add rsp, 56
    0xc3, //                                     ret
    0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
];

/// `ExitProcess(0)` with a 16-byte-aligned stack.
const EXIT: [u8; 16] = [
    0x31, 0xc9, //                               xor ecx, ecx
    0x48, 0x83, 0xec, 0x38, //                   sub rsp, 56
    0x48, 0x83, 0xe4, 0xf0, //                   and rsp, -16
    0xff, 0x15, 0x38, 0x00, 0x00, 0x00, //      call [rip+56]       ; IAT.ExitProcess
];

/// The full runtime block. Scratch slots and IAT start out zeroed; the PE
/// emitter pre-fills the IAT on disk and the loader overwrites it at start.
pub fn runtime_block() -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    block[SYS_ENTRY..SYS_ENTRY + ENTRY.len()].copy_from_slice(&ENTRY);
    block[WRITE_DISPATCH..WRITE_DISPATCH + DISPATCH_SIZE].copy_from_slice(&WRITE);
    block[READ_DISPATCH..READ_DISPATCH + DISPATCH_SIZE].copy_from_slice(&READ);
    block[EXIT_DISPATCH..EXIT_DISPATCH + EXIT.len()].copy_from_slice(&EXIT);
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_layout_is_fixed() {
        assert_eq!(WRITE_DISPATCH, SYS_ENTRY + ENTRY.len());
        assert_eq!(READ_DISPATCH, WRITE_DISPATCH + DISPATCH_SIZE);
        assert_eq!(EXIT_DISPATCH, READ_DISPATCH + DISPATCH_SIZE);
        assert_eq!(SCRATCH, EXIT_DISPATCH + EXIT.len());
        assert_eq!(IAT, SCRATCH + 4 * 8);
        assert_eq!(BLOCK_SIZE, IAT + IAT_SLOTS * 8);
        assert_eq!(runtime_block().len(), 262);
    }

    #[test]
    fn entry_check_skips_to_read_dispatcher() {
        // je is at block offset 4 and two bytes long; its rel8 must land on
        // the read dispatcher.
        let rel = ENTRY[5] as usize;
        assert_eq!(6 + rel, READ_DISPATCH);
    }

    #[test]
    fn dispatcher_displacements_hit_their_slots() {
        // write: first insn loads the cached stdout handle
        let disp = u32::from_le_bytes(WRITE[3..7].try_into().unwrap()) as usize;
        assert_eq!(WRITE_DISPATCH + 7 + disp, SCRATCH);
        // write: GetStdHandle call targets IAT slot 0
        let disp = u32::from_le_bytes(WRITE[23..27].try_into().unwrap()) as usize;
        assert_eq!(WRITE_DISPATCH + 27 + disp, IAT);
        // write: WriteFile call targets IAT slot 1
        let disp = u32::from_le_bytes(WRITE[69..73].try_into().unwrap()) as usize;
        assert_eq!(WRITE_DISPATCH + 73 + disp, IAT + 8);
        // read: ReadFile call targets IAT slot 2
        let disp = u32::from_le_bytes(READ[69..73].try_into().unwrap()) as usize;
        assert_eq!(READ_DISPATCH + 73 + disp, IAT + 16);
        // read: stdin handle slot
        let disp = u32::from_le_bytes(READ[3..7].try_into().unwrap()) as usize;
        assert_eq!(READ_DISPATCH + 7 + disp, SCRATCH + 8);
        // exit: ExitProcess call targets IAT slot 3
        let disp = u32::from_le_bytes(EXIT[12..16].try_into().unwrap()) as usize;
        assert_eq!(EXIT_DISPATCH + 16 + disp, IAT + 24);
    }
}
