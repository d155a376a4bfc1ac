//! Linux procfs parsing for process inspection.
//!
//! Provides `/proc/<pid>/maps` parsing into [`MemoryRegion`] values and
//! enumeration of the running PIDs under `/proc`.

use nix::unistd::Pid;

use crate::error::Result;
use crate::region::{MemoryRegion, Permissions};
use crate::types::Addr;

/// Read and parse `/proc/<pid>/maps`.
pub fn read_memory_maps(pid: Pid) -> Result<Vec<MemoryRegion>> {
    let content = std::fs::read_to_string(format!("/proc/{}/maps", pid))?;
    Ok(parse_maps(&content))
}

/// Parse the contents of a maps file.
///
/// Separated from `read_memory_maps` for testability. Anonymous mappings
/// get a synthesised `anon@0x<base>` kind so kinds stay unique; named
/// mappings use the backing path (or bracket tag like `[vdso]`).
pub fn parse_maps(content: &str) -> Vec<MemoryRegion> {
    content.lines().filter_map(parse_map_line).collect()
}

fn parse_map_line(line: &str) -> Option<MemoryRegion> {
    // Format: 7f8a1000-7f8a2000 r-xp 00000000 08:01 12345  /lib/libc.so.6
    let mut parts = line.splitn(6, char::is_whitespace);

    let addr_range = parts.next()?;
    let perms_str = parts.next()?;
    let _offset = parts.next()?;
    let _dev = parts.next()?;
    let _inode = parts.next()?;
    let pathname = parts.next().unwrap_or("").trim();

    let (start_str, end_str) = addr_range.split_once('-')?;
    let start = u64::from_str_radix(start_str, 16).ok()?;
    let end = u64::from_str_radix(end_str, 16).ok()?;

    let perms = perms_str.as_bytes();
    if perms.len() < 3 {
        return None;
    }

    let kind = if pathname.is_empty() {
        format!("anon@0x{:x}", start)
    } else {
        pathname.to_string()
    };

    Some(MemoryRegion {
        address: Addr(start),
        size: end.saturating_sub(start),
        kind,
        permissions: Permissions {
            read: perms[0] == b'r',
            write: perms[1] == b'w',
            execute: perms[2] == b'x',
            free: false,
        },
    })
}

/// Numeric entries of `/proc`: every PID currently visible to the caller.
pub fn all_pids() -> Result<Vec<i32>> {
    let mut pids = Vec::new();
    for entry in std::fs::read_dir("/proc")? {
        let entry = entry?;
        if let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<i32>().ok()) {
            pids.push(pid);
        }
    }
    pids.sort_unstable();
    Ok(pids)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_MAPS: &str = "\
564756400000-564756401000 r--p 00000000 08:01 1234567  /usr/bin/hello
564756401000-564756402000 r-xp 00001000 08:01 1234567  /usr/bin/hello
564756404000-564756405000 rw-p 00003000 08:01 1234567  /usr/bin/hello
7f8a12000000-7f8a12022000 r--p 00000000 08:01 2345678  /usr/lib/x86_64-linux-gnu/libc.so.6
7f8a12022000-7f8a121b7000 r-xp 00022000 08:01 2345678  /usr/lib/x86_64-linux-gnu/libc.so.6
7f8a12300000-7f8a12301000 r-xp 00000000 00:00 0
7ffd5e371000-7ffd5e392000 rw-p 00000000 00:00 0        [stack]
7ffd5e3f6000-7ffd5e3f8000 r-xp 00000000 00:00 0        [vdso]";

    #[test]
    fn parse_maps_basic() {
        let regions = parse_maps(SAMPLE_MAPS);
        assert_eq!(regions.len(), 8);
    }

    #[test]
    fn parse_maps_addresses_and_sizes() {
        let regions = parse_maps(SAMPLE_MAPS);
        assert_eq!(regions[0].address, Addr(0x564756400000));
        assert_eq!(regions[0].size, 0x1000);
        assert_eq!(regions[4].size, 0x121b7000 - 0x12022000);
    }

    #[test]
    fn parse_maps_permissions() {
        let regions = parse_maps(SAMPLE_MAPS);
        // r--p
        assert!(regions[0].permissions.read);
        assert!(!regions[0].permissions.write);
        assert!(!regions[0].permissions.execute);
        // r-xp
        assert!(regions[1].permissions.execute);
        // rw-p
        assert!(regions[2].permissions.write);
        assert!(!regions[2].permissions.execute);
    }

    #[test]
    fn parse_maps_kinds() {
        let regions = parse_maps(SAMPLE_MAPS);
        assert_eq!(regions[0].kind, "/usr/bin/hello");
        assert_eq!(regions[6].kind, "[stack]");
        assert_eq!(regions[7].kind, "[vdso]");
    }

    #[test]
    fn anonymous_mapping_gets_synthesised_kind() {
        let regions = parse_maps(SAMPLE_MAPS);
        assert_eq!(regions[5].kind, "anon@0x7f8a12300000");
    }

    #[test]
    fn garbage_lines_are_skipped() {
        let regions = parse_maps("not a maps line\n\n564756400000 r-xp\n");
        assert!(regions.is_empty());
    }

    #[test]
    fn regions_ascend_in_maps_order() {
        let regions = parse_maps(SAMPLE_MAPS);
        for pair in regions.windows(2) {
            assert!(pair[0].address < pair[1].address);
        }
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn read_own_maps() {
        let regions = read_memory_maps(nix::unistd::getpid()).unwrap();
        assert!(!regions.is_empty());
        assert!(regions.iter().any(|r| r.permissions.execute));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn all_pids_contains_self() {
        let pids = all_pids().unwrap();
        assert!(pids.contains(&nix::unistd::getpid().as_raw()));
    }
}
