//! Search coordination: drive a region source through the gadget
//! extractor and hand every find to a consumer.
//!
//! The two stock consumers are the [`FingerprintBuilder`] and a record
//! collector for streaming gadget listings; anything implementing
//! [`GadgetSink`] composes the same way.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::arch::Arch;
use crate::elf::FileRegions;
use crate::error::{Error, Result};
use crate::extract::{gadgets_in_region, ExtractLimits};
use crate::fingerprint::{Fingerprint, FingerprintBuilder};
use crate::process::ProcessRegions;
use crate::region::{MemoryRegion, Permissions, RegionSource};
use crate::types::{Addr, Gadget, Sig};

/// Upper address bound used when none is requested.
pub const DEFAULT_END: u64 = 0x7fff_ffff_ffff_ffff;

/// What to inspect: a live process or an object file on disk.
#[derive(Debug, Clone)]
pub enum SearchTarget {
    Pid(i32),
    File(PathBuf),
}

/// Everything needed to run one gadget search.
#[derive(Debug, Clone)]
pub struct GadgetSearchSpec {
    pub target: SearchTarget,
    /// Maximum gadget length in instructions. Gadgets longer than 2
    /// instructions must be requested explicitly.
    pub max_instructions: usize,
    /// Lower address bound, inclusive; gadgets below it are skipped.
    pub start: Addr,
    /// Upper address bound, inclusive; gadgets above it are skipped.
    pub end: Addr,
    /// Rebasing offset added to addresses in serialised gadget records
    /// only; fingerprints always hold absolute addresses.
    pub base: u64,
    pub arch: Arch,
}

impl GadgetSearchSpec {
    pub fn for_file(path: impl Into<PathBuf>) -> Self {
        GadgetSearchSpec {
            target: SearchTarget::File(path.into()),
            max_instructions: 2,
            start: Addr(0),
            end: Addr(DEFAULT_END),
            base: 0,
            arch: Arch::default(),
        }
    }

    pub fn for_pid(pid: i32) -> Self {
        GadgetSearchSpec { target: SearchTarget::Pid(pid), ..GadgetSearchSpec::for_file("") }
    }
}

/// Cooperative cancellation flag, checked between regions: cancelling
/// mid-region lets that region finish, then stops the traversal.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Consumer of search events. `enter_region` fires once per region before
/// any of its gadgets; `emit` fires per gadget in ascending address order.
pub trait GadgetSink {
    fn enter_region(&mut self, region: &MemoryRegion);
    fn emit(&mut self, gadget: Gadget);
}

/// The driving parameters of a search, independent of its target.
#[derive(Debug, Clone)]
pub struct GadgetSearch {
    pub arch: Arch,
    pub limits: ExtractLimits,
    pub start: Addr,
    pub end: Addr,
}

impl Default for GadgetSearch {
    fn default() -> Self {
        GadgetSearch {
            arch: Arch::default(),
            limits: ExtractLimits::default(),
            start: Addr(0),
            end: Addr(DEFAULT_END),
        }
    }
}

impl From<&GadgetSearchSpec> for GadgetSearch {
    fn from(spec: &GadgetSearchSpec) -> Self {
        GadgetSearch {
            arch: spec.arch,
            limits: ExtractLimits::with_max(spec.max_instructions),
            start: spec.start,
            end: spec.end,
        }
    }
}

impl GadgetSearch {
    /// Drain `source`, extracting gadgets per region and feeding `sink`.
    ///
    /// Returns accumulated soft errors; a hard error from the source aborts
    /// with no partial result (held attachments are still released by the
    /// source's drop).
    pub fn run(
        &self,
        source: &mut dyn RegionSource,
        cancel: Option<&CancelToken>,
        sink: &mut dyn GadgetSink,
    ) -> Result<Vec<Error>> {
        let isa = self.arch.isa();
        let mut soft = Vec::new();

        loop {
            if cancel.is_some_and(|c| c.is_cancelled()) {
                log::debug!("gadget search cancelled between regions");
                break;
            }
            let Some(data) = source.next_region(&mut soft)? else {
                break;
            };
            sink.enter_region(&data.region);
            for gadget in
                gadgets_in_region(isa, &data.bytes, data.region.address, &self.limits, &mut soft)
            {
                if gadget.address < self.start || gadget.address > self.end {
                    continue;
                }
                sink.emit(gadget);
            }
        }

        soft.extend(source.close());
        Ok(soft)
    }

    /// Fingerprint everything `source` yields.
    pub fn fingerprint(
        &self,
        source: &mut dyn RegionSource,
        cancel: Option<&CancelToken>,
    ) -> Result<(Fingerprint, Vec<Error>)> {
        let mut builder = FingerprintBuilder::new();
        let soft = self.run(source, cancel, &mut builder)?;
        Ok((builder.finish(), soft))
    }
}

fn open_target(spec: &GadgetSearchSpec) -> Result<(Box<dyn RegionSource>, Vec<Error>)> {
    match &spec.target {
        SearchTarget::File(path) => {
            let (source, soft) = FileRegions::open(path)?;
            Ok((Box::new(source), soft))
        }
        SearchTarget::Pid(pid) => {
            let source = ProcessRegions::open(*pid, Permissions::readable_executable())?;
            Ok((Box::new(source), Vec::new()))
        }
    }
}

/// Resolve the spec's target and drive the search over it.
pub fn operate_on_gadgets(
    spec: &GadgetSearchSpec,
    cancel: Option<&CancelToken>,
    sink: &mut dyn GadgetSink,
) -> Result<Vec<Error>> {
    let (mut source, mut soft) = open_target(spec)?;
    soft.extend(GadgetSearch::from(spec).run(source.as_mut(), cancel, sink)?);
    Ok(soft)
}

/// Build a fingerprint of the spec's target.
pub fn fingerprint(spec: &GadgetSearchSpec) -> Result<(Fingerprint, Vec<Error>)> {
    let mut builder = FingerprintBuilder::new();
    let soft = operate_on_gadgets(spec, None, &mut builder)?;
    Ok((builder.finish(), soft))
}

/// List every gadget of the spec's target as serialisable records, with
/// the spec's `base` applied to the reported addresses.
pub fn find_gadgets(spec: &GadgetSearchSpec) -> Result<(Vec<GadgetRecord>, Vec<Error>)> {
    let mut collector = GadgetCollector::new(spec.base);
    let soft = operate_on_gadgets(spec, None, &mut collector)?;
    Ok((collector.records, soft))
}

/// One instruction of a serialised gadget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionRecord {
    #[serde(rename = "Octets")]
    pub octets: String,
    #[serde(rename = "DisAsm")]
    pub disasm: String,
}

/// A serialisable gadget instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GadgetRecord {
    #[serde(rename = "Address")]
    pub address: Addr,
    #[serde(rename = "Signature")]
    pub signature: Sig,
    #[serde(rename = "Instructions")]
    pub instructions: Vec<InstructionRecord>,
}

impl GadgetRecord {
    fn new(gadget: &Gadget, base: u64) -> Self {
        GadgetRecord {
            address: gadget.address + base,
            signature: gadget.signature(),
            instructions: gadget
                .instructions
                .iter()
                .map(|i| InstructionRecord { octets: hex(&i.octets), disasm: i.disasm.clone() })
                .collect(),
        }
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Sink that collects gadget records, rebasing addresses by `base`.
pub struct GadgetCollector {
    base: u64,
    pub records: Vec<GadgetRecord>,
}

impl GadgetCollector {
    pub fn new(base: u64) -> Self {
        GadgetCollector { base, records: Vec::new() }
    }
}

impl GadgetSink for GadgetCollector {
    fn enter_region(&mut self, _region: &MemoryRegion) {}

    fn emit(&mut self, gadget: Gadget) {
        self.records.push(GadgetRecord::new(&gadget, self.base));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::compare;
    use crate::region::BufferRegions;

    const POP_RET: &[u8] = &[0x58, 0xc3, 0x5f, 0xc3];

    fn buffer(addr: u64, kind: &str) -> BufferRegions {
        BufferRegions::from_bytes(Addr(addr), kind, POP_RET.to_vec())
    }

    // Default limits (min 2, max 2) keep each signature at one address in
    // the POP_RET buffer: "POP RAX; RET" at +0 and "POP RDI; RET" at +2.
    fn search() -> GadgetSearch {
        GadgetSearch::default()
    }

    #[test]
    fn fingerprinting_a_buffer_twice_is_identity() {
        let (fp1, soft1) = search().fingerprint(&mut buffer(0x1000, "buffer"), None).unwrap();
        let (fp2, soft2) = search().fingerprint(&mut buffer(0x1000, "buffer"), None).unwrap();
        assert!(soft1.is_empty() && soft2.is_empty());

        let cmp = compare(&fp1, &fp2);
        assert!(cmp.added_regions.is_empty());
        assert!(cmp.removed_regions.is_empty());
        let shared = &cmp.shared_region_comparisons[0];
        assert_eq!(shared.displacement, 0);
        assert!(!shared.gadget_displacements.is_empty());
        for offsets in shared.gadget_displacements.values() {
            assert_eq!(offsets, &vec![0]);
        }
    }

    #[test]
    fn shifted_buffer_displaces_every_gadget() {
        let (old, _) = search().fingerprint(&mut buffer(0x1000, "buffer"), None).unwrap();
        let (new, _) = search().fingerprint(&mut buffer(0x2000, "buffer"), None).unwrap();

        let cmp = compare(&old, &new);
        assert_eq!(cmp.shared_region_comparisons.len(), 1);
        let shared = &cmp.shared_region_comparisons[0];
        assert_eq!(shared.displacement, 0x1000);
        assert!(shared.added_gadgets.is_empty());
        for offsets in shared.gadget_displacements.values() {
            assert_eq!(offsets, &vec![0x1000]);
        }
    }

    #[test]
    fn address_window_filters_gadgets() {
        let mut collector = GadgetCollector::new(0);
        let spec_window = GadgetSearch { start: Addr(0x1002), end: Addr(0x1003), ..search() };
        spec_window.run(&mut buffer(0x1000, "buffer"), None, &mut collector).unwrap();

        let addrs: Vec<Addr> = collector.records.iter().map(|r| r.address).collect();
        assert_eq!(addrs, vec![Addr(0x1002)]);
    }

    #[test]
    fn base_rebases_records_but_not_fingerprints() {
        let mut collector = GadgetCollector::new(0x10_0000);
        search().run(&mut buffer(0x1000, "buffer"), None, &mut collector).unwrap();
        assert!(collector.records.iter().all(|r| r.address >= Addr(0x10_1000)));

        // The fingerprint of the same buffer keeps absolute addresses.
        let (fp, _) = search().fingerprint(&mut buffer(0x1000, "buffer"), None).unwrap();
        let region = &fp.regions()["buffer"];
        assert!(region.gadgets.values().flatten().all(|a| a.addr() < 0x2000));
    }

    #[test]
    fn cancelled_before_start_yields_nothing() {
        let token = CancelToken::new();
        token.cancel();
        let mut collector = GadgetCollector::new(0);
        let soft = search().run(&mut buffer(0x1000, "buffer"), Some(&token), &mut collector).unwrap();
        assert!(collector.records.is_empty());
        assert!(soft.is_empty());
    }

    #[test]
    fn cancellation_mid_region_completes_that_region() {
        struct CancelOnFirstGadget {
            token: CancelToken,
            inner: GadgetCollector,
            regions_seen: usize,
        }
        impl GadgetSink for CancelOnFirstGadget {
            fn enter_region(&mut self, region: &MemoryRegion) {
                self.regions_seen += 1;
                self.inner.enter_region(region);
            }
            fn emit(&mut self, gadget: Gadget) {
                self.token.cancel();
                self.inner.emit(gadget);
            }
        }

        let entry = |addr: u64, kind: &str| crate::region::RegionData {
            region: MemoryRegion {
                address: Addr(addr),
                size: POP_RET.len() as u64,
                kind: kind.to_string(),
                permissions: crate::region::Permissions::readable_executable(),
            },
            bytes: POP_RET.to_vec(),
        };
        let mut source = BufferRegions::new(vec![entry(0x1000, "first"), entry(0x2000, "second")]);
        let token = CancelToken::new();
        let mut sink = CancelOnFirstGadget {
            token: token.clone(),
            inner: GadgetCollector::new(0),
            regions_seen: 0,
        };

        search().run(&mut source, Some(&token), &mut sink).unwrap();
        // The first region finished (both of its gadgets emitted); the
        // second was never entered.
        assert_eq!(sink.regions_seen, 1);
        assert_eq!(sink.inner.records.len(), 2);
    }

    #[test]
    fn gadget_record_serialisation() {
        let mut collector = GadgetCollector::new(0);
        search().run(&mut buffer(0x2000, "buffer"), None, &mut collector).unwrap();

        let first = &collector.records[0];
        assert_eq!(first.signature, Sig::from("POP RAX; RET"));
        let json = serde_json::to_value(first).unwrap();
        assert_eq!(json["Address"], "0x2000");
        assert_eq!(json["Signature"], "POP RAX; RET");
        assert_eq!(json["Instructions"][0]["Octets"], "58");
        assert_eq!(json["Instructions"][0]["DisAsm"], "POP RAX");
        assert_eq!(json["Instructions"][1]["Octets"], "c3");
    }

    #[test]
    fn spec_defaults() {
        let spec = GadgetSearchSpec::for_pid(1);
        assert_eq!(spec.max_instructions, 2);
        assert_eq!(spec.start, Addr(0));
        assert_eq!(spec.end, Addr(DEFAULT_END));
        assert_eq!(spec.base, 0);
        assert_eq!(spec.arch, Arch::Amd64);
    }
}
