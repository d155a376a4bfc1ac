//! ELF object-file region source.
//!
//! Memory-maps the binary, walks its section table, and yields every
//! section whose flags mark it as executable code (`SHF_EXECINSTR`), in
//! ascending address order. Section bytes are copied out at load time so
//! the file handle and mapping are released before enumeration begins.

use std::collections::HashSet;
use std::path::Path;

use memmap2::Mmap;
use object::{Object, ObjectSection, SectionFlags};

use crate::error::{Error, Result};
use crate::region::{MemoryRegion, Permissions, RegionData, RegionSource};
use crate::types::Addr;

/// Executable sections of an on-disk ELF binary.
pub struct FileRegions {
    entries: std::vec::IntoIter<RegionData>,
}

impl FileRegions {
    /// Parse `path` and collect its executable sections.
    ///
    /// Fails hard on unreadable files and malformed ELF headers; a section
    /// whose bytes cannot be read is skipped and reported in the returned
    /// soft-error list.
    pub fn open(path: &Path) -> Result<(Self, Vec<Error>)> {
        let file = std::fs::File::open(path)
            .map_err(|e| Error::Object(format!("open '{}': {}", path.display(), e)))?;
        let mmap = unsafe { Mmap::map(&file) }
            .map_err(|e| Error::Object(format!("mmap '{}': {}", path.display(), e)))?;
        let obj = object::File::parse(&*mmap)
            .map_err(|e| Error::Object(format!("parse '{}': {}", path.display(), e)))?;

        let mut soft = Vec::new();
        let mut entries = Vec::new();
        let mut seen_kinds: HashSet<String> = HashSet::new();

        for section in obj.sections() {
            let flags = match section.flags() {
                SectionFlags::Elf { sh_flags } => sh_flags,
                _ => continue,
            };
            if flags & u64::from(object::elf::SHF_EXECINSTR) == 0 {
                continue;
            }

            let address = Addr(section.address());
            let name = match section.name() {
                Ok(n) if !n.is_empty() => n.to_string(),
                _ => format!("section@0x{:x}", address.addr()),
            };
            // Section names are unique in well-formed binaries; fall back
            // to an address suffix so each kind occurs at most once.
            let kind = if seen_kinds.contains(&name) {
                format!("{}@0x{:x}", name, address.addr())
            } else {
                name
            };
            seen_kinds.insert(kind.clone());

            let bytes = match section.data() {
                Ok(data) => data.to_vec(),
                Err(e) => {
                    soft.push(Error::Object(format!("section '{}': {}", kind, e)));
                    continue;
                }
            };

            let writable = flags & u64::from(object::elf::SHF_WRITE) != 0;
            entries.push(RegionData {
                region: MemoryRegion {
                    address,
                    size: bytes.len() as u64,
                    kind,
                    permissions: Permissions {
                        read: true,
                        write: writable,
                        execute: true,
                        free: false,
                    },
                },
                bytes,
            });
        }

        entries.sort_by_key(|e| e.region.address);
        log::debug!(
            "loaded {} executable sections from '{}'",
            entries.len(),
            path.display()
        );

        Ok((FileRegions { entries: entries.into_iter() }, soft))
    }
}

impl RegionSource for FileRegions {
    fn next_region(&mut self, _soft: &mut Vec<Error>) -> Result<Option<RegionData>> {
        Ok(self.entries.next())
    }
}
