//! Live-process region source.
//!
//! Enumerates a target process's mapped regions from procfs and copies
//! their bytes with `process_vm_readv`. Reading a foreign process requires
//! a ptrace attachment, held as a scoped guard so the target is detached on
//! every exit path; reading the current process needs no attachment.

use std::io::IoSliceMut;

use nix::sys::ptrace;
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::procfs;
use crate::region::{MemoryRegion, Permissions, RegionData, RegionSource};
use crate::types::Addr;

/// Scoped ptrace attachment to a foreign process.
///
/// Detaches when dropped, so hard errors, cancellation, and panics all
/// release the target. The happy path should call [`PtraceGuard::detach`]
/// instead, which reports the detach failure rather than just logging it;
/// data collected under the attachment is still valid either way.
pub struct PtraceGuard {
    pid: Pid,
    attached: bool,
}

impl PtraceGuard {
    /// Attach to `pid` and wait for it to stop.
    pub fn attach(pid: Pid) -> Result<Self> {
        ptrace::attach(pid).map_err(|e| Error::Process {
            pid: pid.as_raw(),
            reason: format!("ptrace attach: {}", e),
        })?;
        let guard = PtraceGuard { pid, attached: true };
        // A wait failure propagates as a hard error; the guard's drop still
        // detaches on that path.
        waitpid(pid, None).map_err(|e| Error::Process {
            pid: pid.as_raw(),
            reason: format!("wait after attach: {}", e),
        })?;
        Ok(guard)
    }

    /// Detach explicitly, surfacing the failure to the caller.
    pub fn detach(mut self) -> Result<()> {
        self.attached = false;
        ptrace::detach(self.pid, None).map_err(|e| Error::Process {
            pid: self.pid.as_raw(),
            reason: format!("ptrace detach: {}", e),
        })
    }
}

impl Drop for PtraceGuard {
    fn drop(&mut self) {
        if self.attached {
            if let Err(e) = ptrace::detach(self.pid, None) {
                log::warn!("failed to detach from pid {}: {}", self.pid, e);
            }
        }
    }
}

/// Copy `len` bytes from `addr` in `pid`'s address space.
///
/// The caller must either be inspecting itself or hold a ptrace-equivalent
/// permission on the target (e.g. via [`PtraceGuard`]).
pub fn read_process_memory(pid: Pid, addr: Addr, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let mut filled = 0;

    while filled < len {
        let n = {
            let mut local = [IoSliceMut::new(&mut buf[filled..])];
            let remote = [RemoteIoVec { base: (addr.addr() as usize) + filled, len: len - filled }];
            process_vm_readv(pid, &mut local, &remote).map_err(|e| Error::Process {
                pid: pid.as_raw(),
                reason: format!("read {} bytes at {}: {}", len, addr, e),
            })?
        };
        if n == 0 {
            return Err(Error::Process {
                pid: pid.as_raw(),
                reason: format!("short read at {}: {} of {} bytes", addr, filled, len),
            });
        }
        filled += n;
    }

    Ok(buf)
}

/// Mapped regions of a live process matching a permission mask.
pub struct ProcessRegions {
    pid: Pid,
    guard: Option<PtraceGuard>,
    entries: std::vec::IntoIter<MemoryRegion>,
}

impl ProcessRegions {
    /// Enumerate `pid`'s regions matching `mask`, attaching first when the
    /// target is not the current process.
    pub fn open(pid: i32, mask: Permissions) -> Result<Self> {
        let pid = Pid::from_raw(pid);
        let guard = if pid == nix::unistd::getpid() {
            None
        } else {
            log::debug!("attaching to pid {} to read its memory", pid);
            Some(PtraceGuard::attach(pid)?)
        };

        let regions: Vec<MemoryRegion> = procfs::read_memory_maps(pid)?
            .into_iter()
            .filter(|r| r.permissions.satisfies(mask))
            .collect();

        Ok(ProcessRegions { pid, guard, entries: regions.into_iter() })
    }
}

impl RegionSource for ProcessRegions {
    fn next_region(&mut self, soft: &mut Vec<Error>) -> Result<Option<RegionData>> {
        for region in self.entries.by_ref() {
            match read_process_memory(self.pid, region.address, region.size as usize) {
                Ok(bytes) => {
                    log::debug!(
                        "pid {}: region {} ({} bytes) at {}",
                        self.pid,
                        region.kind,
                        region.size,
                        region.address
                    );
                    return Ok(Some(RegionData { region, bytes }));
                }
                Err(e) => {
                    // One unreadable region never aborts the traversal.
                    soft.push(e);
                }
            }
        }
        Ok(None)
    }

    fn close(&mut self) -> Vec<Error> {
        match self.guard.take() {
            Some(guard) => match guard.detach() {
                Ok(()) => Vec::new(),
                Err(e) => {
                    log::warn!("{}", e);
                    vec![e]
                }
            },
            None => Vec::new(),
        }
    }
}

/// List a process's memory regions filtered by an access mask.
///
/// Enumeration only; no attachment and no byte copies.
pub fn memory_regions(pid: i32, mask: Permissions) -> Result<Vec<MemoryRegion>> {
    let regions = procfs::read_memory_maps(Pid::from_raw(pid))?;
    Ok(regions.into_iter().filter(|r| r.permissions.satisfies(mask)).collect())
}
