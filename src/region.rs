//! Executable memory regions and the source interface that yields them.
//!
//! A region source walks one image (an object file on disk, a live
//! process's address space, or a caller-supplied buffer set) and yields
//! disjoint regions in strictly ascending address order, each with an owned
//! copy of its bytes.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::Addr;

/// Region access bits as reported by the owning source.
///
/// `free` marks an unmapped placeholder range; sources that do not yield
/// placeholders never set it. Serialises as a fixed-width mask string,
/// e.g. `"r-x-"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub free: bool,
}

impl Permissions {
    pub const fn readable_executable() -> Self {
        Permissions { read: true, write: false, execute: true, free: false }
    }

    /// True when every bit set in `mask` is also set here.
    pub fn satisfies(self, mask: Permissions) -> bool {
        (!mask.read || self.read)
            && (!mask.write || self.write)
            && (!mask.execute || self.execute)
            && (!mask.free || self.free)
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}{}",
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            if self.execute { 'x' } else { '-' },
            if self.free { 'f' } else { '-' },
        )
    }
}

impl FromStr for Permissions {
    type Err = Error;

    /// Accepts any combination of `r`, `w`, `x`, `f` with `-` padding, in
    /// any order and case, e.g. `"rx"`, `"r-x-"`, `"RWX"`.
    fn from_str(s: &str) -> Result<Self> {
        let mut perms = Permissions::default();
        for c in s.chars() {
            match c.to_ascii_lowercase() {
                'r' => perms.read = true,
                'w' => perms.write = true,
                'x' => perms.execute = true,
                'f' => perms.free = true,
                '-' => {}
                other => {
                    return Err(Error::Other(format!("invalid access flag: '{}'", other)));
                }
            }
        }
        Ok(perms)
    }
}

impl Serialize for Permissions {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Permissions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct PermVisitor;

        impl<'de> Visitor<'de> for PermVisitor {
            type Value = Permissions;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an access mask string like \"r-x-\"")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Permissions, E> {
                v.parse().map_err(|e: Error| E::custom(e.to_string()))
            }
        }

        deserializer.deserialize_str(PermVisitor)
    }
}

/// A contiguous byte span of an inspected image.
///
/// `kind` is a short stable name for the originating section or mapping:
/// the ELF section name, the backing path from the maps file, or a
/// synthesised `anon@0x<base>` identifier for anonymous mappings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    #[serde(rename = "Address")]
    pub address: Addr,
    #[serde(rename = "Size")]
    pub size: u64,
    #[serde(rename = "Kind")]
    pub kind: String,
    #[serde(rename = "Permissions")]
    pub permissions: Permissions,
}

/// A region together with an owned copy of its bytes.
#[derive(Debug, Clone)]
pub struct RegionData {
    pub region: MemoryRegion,
    pub bytes: Vec<u8>,
}

/// Yields successive executable regions of one image.
///
/// `next_region` returns `Ok(None)` on exhaustion; per-region failures that
/// do not prevent continuing are pushed onto `soft` and the traversal moves
/// on. `close` releases any held resources (debugger attachment, open
/// files) and reports release failures as soft errors.
pub trait RegionSource {
    fn next_region(&mut self, soft: &mut Vec<Error>) -> Result<Option<RegionData>>;

    fn close(&mut self) -> Vec<Error> {
        Vec::new()
    }
}

/// Region source over caller-supplied `(region, bytes)` pairs.
///
/// The in-memory analogue of the file and process sources, used to
/// fingerprint raw buffers.
pub struct BufferRegions {
    entries: std::vec::IntoIter<RegionData>,
}

impl BufferRegions {
    pub fn new(mut entries: Vec<RegionData>) -> Self {
        entries.sort_by_key(|e| e.region.address);
        BufferRegions { entries: entries.into_iter() }
    }

    /// Single anonymous executable buffer at `address`.
    pub fn from_bytes(address: Addr, kind: &str, bytes: Vec<u8>) -> Self {
        let region = MemoryRegion {
            address,
            size: bytes.len() as u64,
            kind: kind.to_string(),
            permissions: Permissions::readable_executable(),
        };
        BufferRegions::new(vec![RegionData { region, bytes }])
    }
}

impl RegionSource for BufferRegions {
    fn next_region(&mut self, _soft: &mut Vec<Error>) -> Result<Option<RegionData>> {
        Ok(self.entries.next())
    }
}
