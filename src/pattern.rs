//! Instruction-sequence matching for linker stubs and signal trampolines.
//!
//! A pattern is a short list of `(data, mask)` words; an instruction
//! matches when `insn & mask == data`. Matching is speculative: callers
//! probe arbitrary addresses, so unreadable memory is simply "no match".

use crate::target::TargetAccess;

/// One masked instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsnPattern {
    pub data: u32,
    pub mask: u32,
}

impl InsnPattern {
    pub const fn new(data: u32, mask: u32) -> Self {
        InsnPattern { data, mask }
    }

    pub fn matches(&self, insn: u32) -> bool {
        insn & self.mask == self.data
    }
}

const fn p(data: u32, mask: u32) -> InsnPattern {
    InsnPattern::new(data, mask)
}

/// `ldil L'X,r1; be,n R'X(sr4,r1)`
pub const LONG_BRANCH_STUB: [InsnPattern; 2] = [
    p(0x2020_0000, 0xffe0_0000),
    p(0xe020_2002, 0xffe0_2002),
];

/// `b,l .+8,r1; addil L'X - ($PIC_pcrel$0 - 4),r1; be,n R'X(sr4,r1)`
pub const LONG_BRANCH_PIC_STUB: [InsnPattern; 3] = [
    p(0xe820_0000, 0xffe0_0000),
    p(0x2820_0000, 0xffe0_0000),
    p(0xe020_2002, 0xffe0_2002),
];

/// `addil L'X,dp,r1; ldw R'X(r1),r21; bv r0(r21); ldw R'X+4(r1),r19`
pub const IMPORT_STUB: [InsnPattern; 4] = [
    p(0x2b60_0000, 0xffe0_0000),
    p(0x4835_0000, 0xffff_b000),
    p(0xeaa0_c000, 0xffff_ffff),
    p(0x4833_0000, 0xffff_b000),
];

/// Like [`IMPORT_STUB`] but relative to r19 instead of dp.
pub const IMPORT_PIC_STUB: [InsnPattern; 4] = [
    p(0x2a60_0000, 0xffe0_0000),
    p(0x4835_0000, 0xffff_b000),
    p(0xeaa0_c000, 0xffff_ffff),
    p(0x4833_0000, 0xffff_b000),
];

/// `bv r0(r20); ldw 0(r20),r21` at the head of an unresolved PLT.
pub const PLT_STUB: [InsnPattern; 2] = [
    p(0xea9f_1fdd, 0xffff_ffff),
    p(0xd680_1c1e, 0xffff_ffff),
];

/// Linux rt_sigreturn trampoline:
/// `ldi 0|1,r25; ldi __NR_rt_sigreturn,r20; be,l 0x100(sr2,r0),sr0,r31; nop`
pub const SIGTRAMP: [InsnPattern; 4] = [
    p(0x3419_0000, 0xffff_fffd),
    p(0x3414_015a, 0xffff_ffff),
    p(0xe400_8200, 0xffff_ffff),
    p(0x0800_0240, 0xffff_ffff),
];

/// Read `N` instruction words at `addr` and match them against `pattern`.
///
/// Returns the captured words on a full match.
pub fn match_insns<const N: usize>(
    target: &dyn TargetAccess,
    addr: u64,
    pattern: &[InsnPattern; N],
) -> Option<[u32; N]> {
    let mut insns = [0u32; N];
    for (i, (slot, pat)) in insns.iter_mut().zip(pattern).enumerate() {
        let insn = target.read_u32(addr.wrapping_add(4 * i as u64)).ok()?;
        if !pat.matches(insn) {
            return None;
        }
        *slot = insn;
    }
    Some(insns)
}

/// Like [`match_insns`], but `addr` may point at any instruction of the
/// sequence, not only the first.
pub fn match_insns_relaxed<const N: usize>(
    target: &dyn TargetAccess,
    addr: u64,
    pattern: &[InsnPattern; N],
) -> Option<[u32; N]> {
    (0..N as u64).find_map(|offset| match_insns(target, addr.wrapping_sub(offset * 4), pattern))
}

/// Match `pattern` against words already in hand.
pub fn match_words(words: &[u32], pattern: &[InsnPattern]) -> bool {
    words.len() >= pattern.len() && words.iter().zip(pattern).all(|(&w, pat)| pat.matches(w))
}

/// Named stub shapes, for scanning code that has no stub descriptors.
pub const STUB_PATTERNS: &[(&str, &[InsnPattern])] = &[
    ("long_branch", &LONG_BRANCH_STUB),
    ("long_branch_pic", &LONG_BRANCH_PIC_STUB),
    ("import", &IMPORT_STUB),
    ("import_pic", &IMPORT_PIC_STUB),
    ("plt", &PLT_STUB),
];

/// A stub shape found while scanning a code buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubMatch {
    pub address: u64,
    pub kind: &'static str,
}

/// Scan big-endian code loaded at `base` for the known stub shapes.
pub fn scan_stubs(code: &[u8], base: u64) -> Vec<StubMatch> {
    let words: Vec<u32> = code
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let mut matches = Vec::new();
    for i in 0..words.len() {
        for &(kind, pattern) in STUB_PATTERNS {
            if match_words(&words[i..], pattern) {
                matches.push(StubMatch { address: base + 4 * i as u64, kind });
            }
        }
    }
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockTarget;

    const IMPORT: [u32; 4] = [0x2b60_0800, 0x4835_0010, 0xeaa0_c000, 0x4833_0018];

    #[test]
    fn exact_match_captures_words() {
        let mut target = MockTarget::new();
        target.poke_insns(0x1000, &IMPORT);
        assert_eq!(match_insns(&target, 0x1000, &IMPORT_STUB), Some(IMPORT));
        assert!(match_insns(&target, 0x1000, &IMPORT_PIC_STUB).is_none());
        assert!(match_insns(&target, 0x1004, &IMPORT_STUB).is_none());
    }

    #[test]
    fn unreadable_memory_is_no_match() {
        let mut target = MockTarget::new();
        target.poke_insns(0x1000, &IMPORT[..2]);
        assert!(match_insns(&target, 0x1000, &IMPORT_STUB).is_none());
        assert!(match_insns(&target, 0xdead_0000, &SIGTRAMP).is_none());
    }

    #[test]
    fn relaxed_match_from_middle() {
        let mut target = MockTarget::new();
        target.poke_insns(0x1000, &IMPORT);
        for pc in [0x1000, 0x1004, 0x1008, 0x100c] {
            assert_eq!(match_insns_relaxed(&target, pc, &IMPORT_STUB), Some(IMPORT), "pc 0x{:x}", pc);
        }
        assert!(match_insns_relaxed(&target, 0x1010, &IMPORT_STUB).is_none());
    }

    #[test]
    fn sigtramp_accepts_both_ldi_forms() {
        let mut target = MockTarget::new();
        target.poke_insns(0x2000, &[0x3419_0000, 0x3414_015a, 0xe400_8200, 0x0800_0240]);
        target.poke_insns(0x3000, &[0x3419_0002, 0x3414_015a, 0xe400_8200, 0x0800_0240]);
        assert!(match_insns(&target, 0x2000, &SIGTRAMP).is_some());
        assert!(match_insns(&target, 0x3000, &SIGTRAMP).is_some());
    }

    #[test]
    fn scan_finds_stubs_in_code() {
        let mut code = Vec::new();
        for w in [0x0800_0240u32, 0x2020_0000, 0xe020_2002, 0x0800_0240] {
            code.extend_from_slice(&w.to_be_bytes());
        }
        for w in IMPORT {
            code.extend_from_slice(&w.to_be_bytes());
        }
        let found = scan_stubs(&code, 0x4000);
        assert_eq!(
            found,
            vec![
                StubMatch { address: 0x4004, kind: "long_branch" },
                StubMatch { address: 0x4010, kind: "import" },
            ]
        );
    }
}
