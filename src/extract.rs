//! Gadget extraction from a contiguous executable byte region.
//!
//! Every byte offset that begins a control-flow-terminating instruction is
//! a potential gadget ending. For each such terminator the extractor walks
//! backwards through a byte window and keeps every start offset whose
//! linear decode lands exactly on the terminator. On variable-length ISAs
//! this deliberately includes instruction streams the compiler never
//! intended, because an attacker can enter code at any byte.

use crate::arch::{Decoded, Isa};
use crate::error::{Error, Result};
use crate::types::{Addr, Gadget};

/// Bounds on the gadget enumeration.
#[derive(Debug, Clone, Copy)]
pub struct ExtractLimits {
    /// Smallest gadget to report, in instructions (terminator included).
    pub min_instructions: usize,
    /// Largest gadget to report, in instructions.
    pub max_instructions: usize,
    /// Cap on gadgets contributed per terminator, shortest first. The only
    /// defence against quadratic blow-up near dense return sites.
    pub max_per_terminator: usize,
}

impl Default for ExtractLimits {
    fn default() -> Self {
        ExtractLimits { min_instructions: 2, max_instructions: 2, max_per_terminator: 100 }
    }
}

impl ExtractLimits {
    /// Default bounds with the given maximum length.
    pub fn with_max(max_instructions: usize) -> Self {
        ExtractLimits { max_instructions: max_instructions.max(1), ..Default::default() }
    }
}

/// Enumerate all gadgets in `bytes`, whose first byte lives at `base`.
///
/// Gadgets come back sorted by ascending start address, ties broken by
/// ascending instruction count. Decoder faults are reported through `soft`;
/// ordinary decode failures during the scan are expected and silent.
pub fn gadgets_in_region(
    isa: &dyn Isa,
    bytes: &[u8],
    base: Addr,
    limits: &ExtractLimits,
    soft: &mut Vec<Error>,
) -> Vec<Gadget> {
    let mut found = Vec::new();
    if bytes.is_empty() || limits.max_instructions == 0 || limits.max_per_terminator == 0 {
        return found;
    }

    let step = isa.alignment().max(1);
    let window = limits.max_instructions.saturating_mul(isa.max_instruction_len());

    let mut t = 0;
    while t < bytes.len() {
        match terminator_at(isa, &bytes[t..]) {
            Ok(Some(term)) => {
                collect_for_terminator(isa, bytes, t, &term, base, limits, step, window, &mut found);
            }
            Ok(None) => {}
            Err(fault) => soft.push(Error::DecodeAt {
                addr: base + t as u64,
                reason: fault.to_string(),
            }),
        }
        t += step;
    }

    found.sort_by(|a, b| {
        a.address.cmp(&b.address).then(a.instructions.len().cmp(&b.instructions.len()))
    });
    found
}

/// Decode at the front of `bytes`; `Some` iff it yields a terminator that
/// fits entirely within the slice. Unrecognised or truncated bytes are a
/// normal non-answer; only decoder faults propagate.
fn terminator_at(isa: &dyn Isa, bytes: &[u8]) -> Result<Option<Decoded>> {
    match isa.decode_one(bytes) {
        Ok(d) if d.terminating => Ok(Some(d)),
        Ok(_) => Ok(None),
        Err(Error::DecoderFault(reason)) => Err(Error::DecoderFault(reason)),
        Err(_) => Ok(None),
    }
}

#[allow(clippy::too_many_arguments)]
fn collect_for_terminator(
    isa: &dyn Isa,
    bytes: &[u8],
    t: usize,
    term: &Decoded,
    base: Addr,
    limits: &ExtractLimits,
    step: usize,
    window: usize,
    found: &mut Vec<Gadget>,
) {
    let lo = t.saturating_sub(window);
    let mut emitted = 0;
    let mut s = t;

    // Walk s downward so shorter gadgets win the per-terminator cap.
    loop {
        if let Some(gadget) = decode_exact(isa, bytes, s, t, term, base, limits) {
            found.push(gadget);
            emitted += 1;
            if emitted >= limits.max_per_terminator {
                break;
            }
        }
        if s < lo + step {
            break;
        }
        s -= step;
    }
}

/// A candidate start `s` produces a gadget iff a linear decode from `s`
/// reaches offset `t` exactly, no instruction before `t` transfers control,
/// and the total count (terminator included) lies within the limits.
fn decode_exact(
    isa: &dyn Isa,
    bytes: &[u8],
    s: usize,
    t: usize,
    term: &Decoded,
    base: Addr,
    limits: &ExtractLimits,
) -> Option<Gadget> {
    let mut instructions = Vec::new();
    let mut off = s;

    while off < t {
        let d = isa.decode_one(&bytes[off..]).ok()?;
        if d.terminating {
            return None;
        }
        off += d.instruction.len();
        instructions.push(d.instruction);
        if instructions.len() >= limits.max_instructions {
            // No room left for the terminator.
            return None;
        }
    }
    if off != t {
        return None;
    }

    instructions.push(term.instruction.clone());
    if instructions.len() < limits.min_instructions {
        return None;
    }

    Some(Gadget { address: base + s as u64, instructions })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Arch;

    fn extract(bytes: &[u8], base: u64, limits: ExtractLimits) -> (Vec<Gadget>, Vec<Error>) {
        let mut soft = Vec::new();
        let gadgets = gadgets_in_region(Arch::Amd64.isa(), bytes, Addr(base), &limits, &mut soft);
        (gadgets, soft)
    }

    fn loose(max: usize) -> ExtractLimits {
        ExtractLimits { min_instructions: 1, max_instructions: max, max_per_terminator: 100 }
    }

    fn sigs(gadgets: &[Gadget]) -> Vec<String> {
        gadgets.iter().map(|g| g.signature().0).collect()
    }

    #[test]
    fn bare_return() {
        let (gadgets, soft) = extract(&[0xc3], 0x1000, loose(2));
        assert!(soft.is_empty());
        assert_eq!(gadgets.len(), 1);
        assert_eq!(gadgets[0].address, Addr(0x1000));
        assert_eq!(gadgets[0].instructions.len(), 1);
        assert_eq!(gadgets[0].signature().0, "RET");
    }

    #[test]
    fn two_instruction_rop() {
        // pop rax; ret
        let (gadgets, _) = extract(&[0x58, 0xc3], 0x2000, loose(2));
        assert_eq!(
            gadgets
                .iter()
                .map(|g| (g.address, g.signature().0.clone()))
                .collect::<Vec<_>>(),
            vec![
                (Addr(0x2000), "POP RAX; RET".to_string()),
                (Addr(0x2001), "RET".to_string()),
            ]
        );
    }

    #[test]
    fn indirect_jump_is_recognised() {
        // jmp rax
        let (gadgets, _) = extract(&[0xff, 0xe0], 0x3000, loose(2));
        assert_eq!(gadgets.len(), 1);
        assert_eq!(gadgets[0].address, Addr(0x3000));
        assert_eq!(gadgets[0].signature().0, "JMP RAX");
    }

    #[test]
    fn no_terminator_no_gadgets_no_errors() {
        let (gadgets, soft) = extract(&[0x90, 0x90, 0x90, 0x90], 0x4000, loose(4));
        assert!(gadgets.is_empty());
        assert!(soft.is_empty());
    }

    #[test]
    fn empty_region() {
        let (gadgets, soft) = extract(&[], 0, loose(2));
        assert!(gadgets.is_empty());
        assert!(soft.is_empty());
    }

    #[test]
    fn default_minimum_excludes_lone_terminators() {
        let (gadgets, _) = extract(&[0xc3], 0x1000, ExtractLimits::default());
        assert!(gadgets.is_empty());

        let (gadgets, _) = extract(&[0x58, 0xc3], 0x1000, ExtractLimits::default());
        assert_eq!(sigs(&gadgets), vec!["POP RAX; RET"]);
    }

    #[test]
    fn per_terminator_cap_keeps_shortest() {
        // pop rax x7; ret
        let bytes = [0x58, 0x58, 0x58, 0x58, 0x58, 0x58, 0x58, 0xc3];
        let limits =
            ExtractLimits { min_instructions: 1, max_instructions: 8, max_per_terminator: 3 };
        let (gadgets, _) = extract(&bytes, 0x5000, limits);
        assert_eq!(gadgets.len(), 3);
        // Shortest candidates have the largest start offsets.
        let addrs: Vec<Addr> = gadgets.iter().map(|g| g.address).collect();
        assert_eq!(addrs, vec![Addr(0x5005), Addr(0x5006), Addr(0x5007)]);
    }

    #[test]
    fn intermediate_terminator_rejects_candidate() {
        // ret; ret — no RET; RET gadget, because only the final instruction
        // may transfer control.
        let (gadgets, _) = extract(&[0xc3, 0xc3], 0x6000, loose(2));
        assert_eq!(
            gadgets.iter().map(|g| g.address).collect::<Vec<_>>(),
            vec![Addr(0x6000), Addr(0x6001)]
        );
        assert!(gadgets.iter().all(|g| g.instructions.len() == 1));
    }

    #[test]
    fn overlapping_terminators_each_get_their_own_set() {
        // pop rax; ret; pop rdi; ret
        let (gadgets, _) = extract(&[0x58, 0xc3, 0x5f, 0xc3], 0x7000, loose(3));
        assert_eq!(
            gadgets
                .iter()
                .map(|g| (g.address, g.signature().0.clone()))
                .collect::<Vec<_>>(),
            vec![
                (Addr(0x7000), "POP RAX; RET".to_string()),
                (Addr(0x7001), "RET".to_string()),
                (Addr(0x7002), "POP RDI; RET".to_string()),
                (Addr(0x7003), "RET".to_string()),
            ]
        );
    }

    #[test]
    fn unintended_instruction_boundaries_are_discovered() {
        // mov eax, 1; ret — entering mid-immediate yields extra gadgets.
        let bytes = [0xb8, 0x01, 0x00, 0x00, 0x00, 0xc3];
        let (gadgets, _) = extract(&bytes, 0x8000, loose(5));
        let sigs = sigs(&gadgets);
        assert!(sigs.contains(&"MOV EAX, 1; RET".to_string()));
        assert!(sigs.contains(&"RET".to_string()));
        // Offsets 1 and 3 decode as ADD variants converging on the RET.
        assert!(gadgets.len() > 2);
    }

    #[test]
    fn truncated_tail_is_not_a_terminator() {
        // A trailing 0xFF would need a ModRM byte that is past region end.
        let (gadgets, soft) = extract(&[0xc3, 0xff], 0x9000, loose(2));
        assert_eq!(gadgets.len(), 1);
        assert_eq!(gadgets[0].address, Addr(0x9000));
        assert!(soft.is_empty());
    }

    #[test]
    fn emission_order_is_ascending_address_then_length() {
        let bytes = [0x58, 0xc3, 0x5f, 0xc3];
        let (gadgets, _) = extract(&bytes, 0xa000, loose(3));
        for pair in gadgets.windows(2) {
            let key_a = (pair[0].address, pair[0].instructions.len());
            let key_b = (pair[1].address, pair[1].instructions.len());
            assert!(key_a <= key_b);
        }
    }

    #[test]
    fn max_instructions_bounds_gadget_length() {
        // pop rsi; pop rdi; ret with a cap of 2 instructions.
        let (gadgets, _) = extract(&[0x5e, 0x5f, 0xc3], 0xb000, loose(2));
        assert!(gadgets.iter().all(|g| g.instructions.len() <= 2));
        assert!(!sigs(&gadgets).contains(&"POP RSI; POP RDI; RET".to_string()));
    }
}
