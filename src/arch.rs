//! Architecture backends for instruction decoding.
//!
//! One instruction at a time: a backend consumes the shortest prefix of a
//! byte slice that forms a complete instruction and reports whether that
//! instruction is a legal gadget ending (control-flow-terminating). x86 in
//! 64-bit and 32-bit modes are implemented with iced-x86; further
//! architectures plug in behind [`Isa`].

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;

use iced_x86::{
    Decoder, DecoderError, DecoderOptions, FlowControl, Formatter, Instruction as IcedInstruction,
    IntelFormatter,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{Addr, Gadget, Instruction};

/// A decoded instruction plus its terminator classification.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub instruction: Instruction,
    /// True for returns, indirect jumps, and indirect calls. Direct
    /// branches to immediate targets are not terminators.
    pub terminating: bool,
}

/// An instruction-set backend.
///
/// `decode_one` must consume at least one byte on success and must never
/// unwind: low-level disassembler aborts are converted to
/// [`Error::DecoderFault`] so a failure at offset k cannot take down the
/// scan at offset k+1.
pub trait Isa: Sync {
    fn name(&self) -> &'static str;

    /// Longest possible encoding, in bytes.
    fn max_instruction_len(&self) -> usize;

    /// Required start-offset alignment; 1 for variable-length encodings.
    fn alignment(&self) -> usize;

    fn decode_one(&self, bytes: &[u8]) -> Result<Decoded>;
}

/// Registered architectures, selectable by name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    #[default]
    Amd64,
    X86,
}

impl Arch {
    pub fn isa(self) -> &'static dyn Isa {
        match self {
            Arch::Amd64 => &AMD64,
            Arch::X86 => &X86_32,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::Amd64 => f.write_str("amd64"),
            Arch::X86 => f.write_str("x86"),
        }
    }
}

impl FromStr for Arch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "amd64" | "x86_64" | "x86-64" => Ok(Arch::Amd64),
            "x86" | "i386" => Ok(Arch::X86),
            other => Err(Error::Other(format!("unknown architecture: '{}'", other))),
        }
    }
}

static AMD64: X86Decoder = X86Decoder { bitness: 64, name: "amd64" };
static X86_32: X86Decoder = X86Decoder { bitness: 32, name: "x86" };

/// x86 decoder backed by iced-x86, parameterised on operating mode.
pub struct X86Decoder {
    bitness: u32,
    name: &'static str,
}

impl Isa for X86Decoder {
    fn name(&self) -> &'static str {
        self.name
    }

    fn max_instruction_len(&self) -> usize {
        15
    }

    fn alignment(&self) -> usize {
        1
    }

    fn decode_one(&self, bytes: &[u8]) -> Result<Decoded> {
        if bytes.is_empty() {
            return Err(Error::TruncatedInstruction);
        }

        let decoded = panic::catch_unwind(AssertUnwindSafe(|| self.decode_inner(bytes)));
        match decoded {
            Ok(result) => result,
            Err(cause) => {
                let reason = cause
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| cause.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(Error::DecoderFault(reason))
            }
        }
    }
}

impl X86Decoder {
    fn decode_inner(&self, bytes: &[u8]) -> Result<Decoded> {
        let mut decoder = Decoder::new(self.bitness, bytes, DecoderOptions::NONE);
        let mut insn = IcedInstruction::default();
        decoder.decode_out(&mut insn);

        if insn.is_invalid() {
            return Err(match decoder.last_error() {
                DecoderError::NoMoreBytes => Error::TruncatedInstruction,
                _ => Error::InvalidOpcode,
            });
        }

        let mut formatter = IntelFormatter::new();
        formatter.options_mut().set_uppercase_all(true);
        formatter.options_mut().set_space_after_operand_separator(true);
        let mut text = String::new();
        formatter.format(&insn, &mut text);

        let terminating = matches!(
            insn.flow_control(),
            FlowControl::Return | FlowControl::IndirectBranch | FlowControl::IndirectCall
        );

        Ok(Decoded {
            instruction: Instruction { octets: bytes[..insn.len()].to_vec(), disasm: text },
            terminating,
        })
    }
}

/// Decode a gadget starting at the front of `bytes`.
///
/// Invokes the instruction decoder repeatedly until the slice is exhausted
/// or the appended instruction is control-flow-terminating. Any decode
/// error aborts the gadget.
pub fn decode_gadget(isa: &dyn Isa, bytes: &[u8], address: Addr) -> Result<Gadget> {
    let mut instructions = Vec::new();
    let mut rest = bytes;

    while !rest.is_empty() {
        let d = isa.decode_one(rest)?;
        let consumed = d.instruction.len();
        let terminating = d.terminating;
        instructions.push(d.instruction);
        if terminating {
            break;
        }
        rest = &rest[consumed..];
    }

    Ok(Gadget { address, instructions })
}
