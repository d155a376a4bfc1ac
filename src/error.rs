//! Error types used throughout the crate.
//!
//! Enumerating operations report two kinds of failure side by side: a hard
//! error aborts the operation and comes back through [`Result`]; soft errors
//! are collected into a `Vec<Error>` and handed back next to the partial
//! result, so one unreadable region or undecodable byte never discards
//! everything else that was found.

use thiserror::Error;

use crate::types::Addr;

/// Unified error type for all ropfp operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The bytes do not begin a recognised instruction.
    #[error("unrecognised opcode")]
    InvalidOpcode,

    /// The instruction needs more bytes than the slice holds.
    #[error("truncated instruction")]
    TruncatedInstruction,

    /// The underlying disassembler aborted; caught at the decoder boundary
    /// instead of unwinding through the crate.
    #[error("disassembler fault: {0}")]
    DecoderFault(String),

    /// Decoding failed at a known address. Soft-error wrapper used by the
    /// linear disassembly listing.
    #[error("decode failed at {addr}: {reason}")]
    DecodeAt { addr: Addr, reason: String },

    /// A ptrace system call failed.
    #[error("ptrace error: {0}")]
    Ptrace(#[from] nix::errno::Errno),

    /// Process inspection error (attach, maps, memory copy, detach).
    #[error("process {pid}: {reason}")]
    Process { pid: i32, reason: String },

    /// Object-file parsing error (malformed ELF, unreadable section).
    #[error("object file error: {0}")]
    Object(String),

    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// General-purpose error with a descriptive message.
    #[error("{0}")]
    Other(String),
}

/// Convenience alias for `std::result::Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
