use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Address of a byte in an inspected image.
///
/// Either a virtual address recorded in an object file or a runtime address
/// in a live process's address space. Addresses from the two sources are
/// never mixed inside a single fingerprint. Serialises as a `0x`-prefixed
/// hex string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Addr(pub u64);

impl Addr {
    pub fn addr(self) -> u64 {
        self.0
    }

    /// Difference `self - earlier`, wrapping modulo 2^64 so negative
    /// displacements stay representable.
    pub fn wrapping_offset_from(self, earlier: Addr) -> u64 {
        self.0.wrapping_sub(earlier.0)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::LowerHex for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl std::ops::Add<u64> for Addr {
    type Output = Addr;
    fn add(self, rhs: u64) -> Self::Output {
        Addr(self.0.wrapping_add(rhs))
    }
}

impl Serialize for Addr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{:x}", self.0))
    }
}

impl<'de> Deserialize<'de> for Addr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AddrVisitor;

        impl<'de> Visitor<'de> for AddrVisitor {
            type Value = Addr;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a hex address string like \"0x1000\"")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Addr, E> {
                let digits = v.strip_prefix("0x").unwrap_or(v);
                u64::from_str_radix(digits, 16)
                    .map(Addr)
                    .map_err(|_| E::custom(format!("invalid address: '{}'", v)))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Addr, E> {
                Ok(Addr(v))
            }
        }

        deserializer.deserialize_any(AddrVisitor)
    }
}

/// Address-independent identity of a gadget.
///
/// Derived from the decoded instruction text only, so two gadgets at
/// different addresses with the same instruction sequence share one Sig.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sig(pub String);

impl fmt::Display for Sig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Sig {
    fn from(s: &str) -> Self {
        Sig(s.to_string())
    }
}

/// One decoded instruction: the exact bytes consumed and their disassembly.
///
/// `octets` are an owned copy, never a borrow into a region buffer, so
/// instructions outlive the enumeration pass that produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub octets: Vec<u8>,
    pub disasm: String,
}

impl Instruction {
    pub fn len(&self) -> usize {
        self.octets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.octets.is_empty()
    }
}

/// A discovered ROP gadget: a non-empty instruction sequence whose final
/// instruction transfers control (return, indirect jump, indirect call).
#[derive(Debug, Clone)]
pub struct Gadget {
    /// Address of the gadget's first byte.
    pub address: Addr,
    pub instructions: Vec<Instruction>,
}

impl Gadget {
    /// Joined disassembly of all instructions, e.g. `"POP RAX; RET"`.
    pub fn signature(&self) -> Sig {
        let text: Vec<&str> = self.instructions.iter().map(|i| i.disasm.as_str()).collect();
        Sig(text.join("; "))
    }

    /// Concatenated raw bytes of the whole gadget.
    pub fn octets(&self) -> Vec<u8> {
        self.instructions.iter().flat_map(|i| i.octets.iter().copied()).collect()
    }

    /// Total byte length from the first byte to one past the terminator.
    pub fn byte_len(&self) -> usize {
        self.instructions.iter().map(|i| i.octets.len()).sum()
    }
}
