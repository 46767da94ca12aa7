//! A custom error and result type used across every backend and the PE
//! emitter. Code-generation failures carry the source location of the
//! offending statement so a driver can render `"<backend> Error / Line L,
//! Column C: <message>"` and exit nonzero.

use crate::ir::SourceLoc;
use alloc::string::String;
use core::fmt;
use core::result;
#[cfg(feature = "std")]
use std::{error, io};

#[derive(Debug)]
pub enum Error {
    /// The opcode exists in the virtual instruction set but has no encoding
    /// on the selected target.
    UnsupportedOpcode(&'static str, SourceLoc),
    /// Register index outside what the target (or this particular encoding)
    /// accepts.
    BadRegister(String, SourceLoc),
    /// Immediate does not fit the encodable range for this target.
    ImmOutOfRange(i64, SourceLoc),
    /// A label, variable or buffer name that never got defined.
    UndefinedSymbol(String, SourceLoc),
    /// A branch whose resolved displacement exceeds the encoding's reach.
    BranchOutOfRange(String, SourceLoc),
    /// The same label/variable/buffer name defined twice.
    DuplicateSymbol(String, SourceLoc),
    /// One of the fixed-capacity tables (symbols, fixups, vars, buffers,
    /// strings) overflowed.
    TableFull(&'static str),
    /// `ORG` tried to move the program counter backwards.
    OrgBackwards { from: u64, to: u64, loc: SourceLoc },
    /// The 8051's 120 bytes of allocatable internal RAM ran out.
    RamExhausted(SourceLoc),
    /// Anything else that makes the input unprocessable.
    Malformed(String),
    Scroll(scroll::Error),
    #[cfg(feature = "std")]
    IO(io::Error),
}

#[cfg(feature = "std")]
impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Scroll(err) => Some(err),
            Error::IO(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(feature = "std")]
impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IO(err)
    }
}

impl From<scroll::Error> for Error {
    fn from(err: scroll::Error) -> Error {
        Error::Scroll(err)
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "Line {}, Column {}", self.line, self.column)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnsupportedOpcode(op, loc) => {
                write!(fmt, "{loc}: opcode {op} is not supported on this target")
            }
            Error::BadRegister(msg, loc) => write!(fmt, "{loc}: {msg}"),
            Error::ImmOutOfRange(imm, loc) => {
                write!(fmt, "{loc}: immediate {imm} out of range")
            }
            Error::UndefinedSymbol(name, loc) => {
                write!(fmt, "{loc}: undefined symbol `{name}`")
            }
            Error::BranchOutOfRange(name, loc) => {
                write!(fmt, "{loc}: branch to `{name}` out of range")
            }
            Error::DuplicateSymbol(name, loc) => {
                write!(fmt, "{loc}: duplicate symbol `{name}`")
            }
            Error::TableFull(what) => write!(fmt, "too many {what}"),
            Error::OrgBackwards { from, to, loc } => {
                write!(fmt, "{loc}: ORG moves backwards ({from:#x} -> {to:#x})")
            }
            Error::RamExhausted(loc) => write!(fmt, "{loc}: internal RAM exhausted"),
            Error::Malformed(msg) => write!(fmt, "malformed input: {msg}"),
            Error::Scroll(err) => write!(fmt, "{err}"),
            #[cfg(feature = "std")]
            Error::IO(err) => write!(fmt, "{err}"),
        }
    }
}

pub type Result<T> = result::Result<T, Error>;
