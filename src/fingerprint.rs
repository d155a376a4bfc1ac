//! Gadget fingerprints and fingerprint comparison.
//!
//! A fingerprint indexes every discovered gadget by region kind and by
//! signature, keeping each instance's address. Comparing the fingerprints
//! of an image before and after transformation quantifies how far the
//! gadget landscape moved, the ground truth for validating binary
//! diversification.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::region::MemoryRegion;
use crate::search::GadgetSink;
use crate::types::{Addr, Gadget, Sig};

/// One region's gadgets, keyed by signature, addresses in discovery order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintRegion {
    #[serde(rename = "Region")]
    pub region: MemoryRegion,
    #[serde(rename = "Gadgets")]
    pub gadgets: BTreeMap<Sig, Vec<Addr>>,
}

/// All gadgets of one image, keyed by region kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub BTreeMap<String, FingerprintRegion>);

impl Fingerprint {
    pub fn regions(&self) -> &BTreeMap<String, FingerprintRegion> {
        &self.0
    }

    /// Total number of gadget instances across all regions.
    pub fn gadget_count(&self) -> usize {
        self.0.values().flat_map(|r| r.gadgets.values()).map(Vec::len).sum()
    }
}

/// Sink that accumulates emitted gadgets into a [`Fingerprint`].
///
/// If the enumerator yields two regions with the same kind, their gadgets
/// merge into the first-seen region's entry; merging is deterministic
/// because emission follows region-source order.
#[derive(Default)]
pub struct FingerprintBuilder {
    current: Option<MemoryRegion>,
    regions: BTreeMap<String, FingerprintRegion>,
}

impl FingerprintBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(self.regions)
    }
}

impl GadgetSink for FingerprintBuilder {
    fn enter_region(&mut self, region: &MemoryRegion) {
        self.current = Some(region.clone());
    }

    fn emit(&mut self, gadget: Gadget) {
        let Some(region) = &self.current else {
            return;
        };
        let entry = self
            .regions
            .entry(region.kind.clone())
            .or_insert_with(|| FingerprintRegion { region: region.clone(), gadgets: BTreeMap::new() });
        entry.gadgets.entry(gadget.signature()).or_default().push(gadget.address);
    }
}

/// Result of comparing two fingerprints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FingerprintComparison {
    #[serde(rename = "AddedRegions")]
    pub added_regions: Vec<MemoryRegion>,
    #[serde(rename = "RemovedRegions")]
    pub removed_regions: Vec<MemoryRegion>,
    #[serde(rename = "SharedRegionComparisons")]
    pub shared_region_comparisons: Vec<RegionComparison>,
}

/// Comparison of one region kind present in both fingerprints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionComparison {
    /// The old side's region metadata.
    #[serde(rename = "Region")]
    pub region: MemoryRegion,
    /// `new.address - old.address`, wrapping modulo 2^64.
    #[serde(rename = "Displacement")]
    pub displacement: u64,
    /// For every old gadget address, the wrapping offsets to every new
    /// address sharing its signature. Signatures gone from `new` leave an
    /// empty vector.
    #[serde(rename = "GadgetDisplacements")]
    pub gadget_displacements: BTreeMap<Addr, Vec<u64>>,
    /// Signatures present only in `new`, with their full address lists.
    #[serde(rename = "AddedGadgets")]
    pub added_gadgets: BTreeMap<Sig, Vec<Addr>>,
    /// Signatures present only in `old`. Populated on request; absent from
    /// output otherwise so the default shape stays unchanged.
    #[serde(rename = "RemovedGadgets", skip_serializing_if = "Option::is_none", default)]
    pub removed_gadgets: Option<BTreeMap<Sig, Vec<Addr>>>,
}

/// Knobs for [`compare_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CompareOptions {
    /// Also report signatures that vanished from a shared region.
    pub report_removed_gadgets: bool,
}

/// Compare two fingerprints with default options.
pub fn compare(old: &Fingerprint, new: &Fingerprint) -> FingerprintComparison {
    compare_with(old, new, CompareOptions::default())
}

/// Compare two fingerprints.
///
/// Region identity is strictly by kind; no cross-region matching is
/// attempted. Inputs are left untouched.
pub fn compare_with(
    old: &Fingerprint,
    new: &Fingerprint,
    opts: CompareOptions,
) -> FingerprintComparison {
    let mut result = FingerprintComparison::default();

    for (kind, old_region) in &old.0 {
        match new.0.get(kind) {
            Some(new_region) => {
                result
                    .shared_region_comparisons
                    .push(compare_regions(old_region, new_region, opts));
            }
            None => result.removed_regions.push(old_region.region.clone()),
        }
    }
    for (kind, new_region) in &new.0 {
        if !old.0.contains_key(kind) {
            result.added_regions.push(new_region.region.clone());
        }
    }

    result
}

fn compare_regions(
    old: &FingerprintRegion,
    new: &FingerprintRegion,
    opts: CompareOptions,
) -> RegionComparison {
    let mut gadget_displacements = BTreeMap::new();
    for (sig, old_addresses) in &old.gadgets {
        let new_addresses = new.gadgets.get(sig).map(Vec::as_slice).unwrap_or(&[]);
        for &a in old_addresses {
            let offsets: Vec<u64> =
                new_addresses.iter().map(|&b| b.wrapping_offset_from(a)).collect();
            gadget_displacements.insert(a, offsets);
        }
    }

    let added_gadgets: BTreeMap<Sig, Vec<Addr>> = new
        .gadgets
        .iter()
        .filter(|(sig, _)| !old.gadgets.contains_key(*sig))
        .map(|(sig, addrs)| (sig.clone(), addrs.clone()))
        .collect();

    let removed_gadgets = opts.report_removed_gadgets.then(|| {
        old.gadgets
            .iter()
            .filter(|(sig, _)| !new.gadgets.contains_key(*sig))
            .map(|(sig, addrs)| (sig.clone(), addrs.clone()))
            .collect()
    });

    RegionComparison {
        region: old.region.clone(),
        displacement: new.region.address.wrapping_offset_from(old.region.address),
        gadget_displacements,
        added_gadgets,
        removed_gadgets,
    }
}
