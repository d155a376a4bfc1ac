//! Linear disassembly listings over executable regions.
//!
//! Decodes every executable region of a file or process front to back,
//! producing one record per instruction. A byte that refuses to decode
//! becomes a soft error and decoding resynchronises at the next offset, so
//! one bad byte never hides the rest of a region.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::arch::{Arch, Isa};
use crate::elf::FileRegions;
use crate::error::{Error, Result};
use crate::process::ProcessRegions;
use crate::region::{Permissions, RegionSource};
use crate::search::hex;
use crate::types::Addr;

/// One decoded instruction at a concrete address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionInstance {
    #[serde(rename = "Address")]
    pub address: Addr,
    #[serde(rename = "Octets")]
    pub octets: String,
    #[serde(rename = "DisAsm")]
    pub disasm: String,
}

/// Disassemble one region's bytes, keeping instructions whose address
/// falls in `[start, end]`.
pub fn disassemble_region(
    isa: &dyn Isa,
    bytes: &[u8],
    base: Addr,
    start: Addr,
    end: Addr,
    soft: &mut Vec<Error>,
) -> Vec<InstructionInstance> {
    let mut instructions = Vec::new();
    let mut off = 0;

    while off < bytes.len() {
        let addr = base + off as u64;
        match isa.decode_one(&bytes[off..]) {
            Ok(d) => {
                let len = d.instruction.len();
                if addr >= start && addr <= end {
                    instructions.push(InstructionInstance {
                        address: addr,
                        octets: hex(&d.instruction.octets),
                        disasm: d.instruction.disasm,
                    });
                }
                off += len;
            }
            Err(e) => {
                soft.push(Error::DecodeAt { addr, reason: e.to_string() });
                off += isa.alignment().max(1);
            }
        }
    }

    instructions
}

/// Disassemble every executable section of an ELF binary.
pub fn disassemble_file(
    path: &Path,
    arch: Arch,
    start: Addr,
    end: Addr,
) -> Result<(Vec<InstructionInstance>, Vec<Error>)> {
    let (mut source, mut soft) = FileRegions::open(path)?;
    let instructions = drain_source(&mut source, arch, start, end, &mut soft)?;
    Ok((instructions, soft))
}

/// Disassemble every executable mapping of a live process.
pub fn disassemble_process(
    pid: i32,
    arch: Arch,
    start: Addr,
    end: Addr,
) -> Result<(Vec<InstructionInstance>, Vec<Error>)> {
    let mut source = ProcessRegions::open(pid, Permissions::readable_executable())?;
    let mut soft = Vec::new();
    let instructions = drain_source(&mut source, arch, start, end, &mut soft)?;
    Ok((instructions, soft))
}

fn drain_source(
    source: &mut dyn RegionSource,
    arch: Arch,
    start: Addr,
    end: Addr,
    soft: &mut Vec<Error>,
) -> Result<Vec<InstructionInstance>> {
    let isa = arch.isa();
    let mut instructions = Vec::new();
    while let Some(data) = source.next_region(soft)? {
        instructions.extend(disassemble_region(
            isa,
            &data.bytes,
            data.region.address,
            start,
            end,
            soft,
        ));
    }
    soft.extend(source.close());
    Ok(instructions)
}
