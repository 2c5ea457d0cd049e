//! Linker stubs and dynamic-call trampolines.
//!
//! Calls between load modules go through small linker-generated stubs
//! (import, export, long-branch, parameter-relocation) and through the
//! millicode helpers `$$dyncall` and `_sr4export`. The queries here
//! decide whether a PC is inside one of them and, if so, where control
//! will end up.

use log::{debug, warn};

use crate::bitfield::{extract_14, extract_17, extract_21};
use crate::pattern::{
    match_insns, match_insns_relaxed, IMPORT_PIC_STUB, IMPORT_STUB, LONG_BRANCH_PIC_STUB, LONG_BRANCH_STUB,
    PLT_STUB,
};
use crate::registers::{RegisterSet, DP, R19, R22, SP};
use crate::symbols::SymbolType;
use crate::target::{Abi, Os, Session, TargetAccess, UnwindHit};
use crate::unwind_table::StubType;

/// Indirect-call helper; the target (or a procedure label) is in r22.
pub const DYNCALL: &str = "$$dyncall";
/// Like `$$dyncall`, but r22 always holds a procedure label.
pub const DYNCALL_EXTERNAL: &str = "$$dyncall_external";
/// Space-switching export helper; the target is in r22.
pub const SR4EXPORT: &str = "_sr4export";
/// Name the HP linker gives its stub symbols.
pub const STUB_SYMBOL: &str = ".stub";

const PLT_SECTION: &str = ".plt";

/// `ldw -8(sp),rp`
const LDW_RP_MINUS_8: u32 = 0x4bc2_3ff1;
/// `be,n 0(sr0,rp)`
const BE_N_RP: u32 = 0xe040_0002;
/// `be 0(sr0,r21)` / `be,n 0(sr0,r21)`
const BE_R21: [u32; 2] = [0xe2a0_0000, 0xe2a0_0002];
/// `bve (r21)` / `bve,n (r21)`, PA 2.0 only.
const BVE_R21: [u32; 2] = [0xeaa0_d000, 0xeaa0_d002];

/// How a disagreement between a descriptor and the symbol table about
/// whether some code is a stub was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubResolution {
    /// Real code with the same name exists elsewhere, so this is an
    /// export stub that lost its stub type.
    DescriptorIsExport,
    /// Nothing else carries the name, so the symbol is ordinary code.
    SymbolIsText,
}

/// The descriptor says "not a stub" but the symbol says "trampoline".
///
/// Returned once per location; the resolution is then recorded in the
/// session and later queries see the corrected view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmbiguousStub {
    pub symbol: String,
    pub address: u64,
    pub resolution: StubResolution,
}

/// Which way a parameter-relocation or export stub is being traversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StubPath {
    Call,
    Return,
}

impl Session {
    fn is_helper(&self, pc: u64, name: &str) -> bool {
        self.helper_address(name) == Some(pc)
    }

    /// `pc` lies inside the region covered by `$$dyncall`'s descriptor.
    pub fn in_dyncall(&self, pc: u64) -> bool {
        self.helper_address(DYNCALL)
            .and_then(|addr| self.find_unwind_entry(addr))
            .is_some_and(|desc| desc.region_start <= pc && pc <= desc.region_end)
    }

    fn mask_address(&self, addr: u64) -> u64 {
        match self.config().abi {
            Abi::Pa32 => addr & 0xffff_ffff,
            Abi::Pa64 => addr,
        }
    }

    /// Scan a parameter-relocation or export stub forward from `pc` for
    /// the branch that tells which leg we are on.
    fn stub_path(&self, target: &dyn TargetAccess, pc: u64, region_end: u64) -> Option<StubPath> {
        let mut addr = pc;
        while addr <= region_end {
            let Ok(insn) = target.read_u32(addr) else {
                debug!("stub scan: cannot read 0x{:x}", addr);
                return None;
            };
            // bl: the call leg. bv or be: the return leg.
            if insn & 0xfc00_e000 == 0xe800_0000 {
                return Some(StubPath::Call);
            }
            if insn & 0xfc00_e001 == 0xe800_c000 || insn & 0xfc00_0000 == 0xe000_0000 {
                return Some(StubPath::Return);
            }
            addr += 4;
        }
        warn!("Unable to find branch in parameter relocation stub.");
        None
    }

    /// The 64-bit runtime has no stub descriptors: a stub is a
    /// `ldd`/`bve,l`/`ldd` triple outside the section of the symbol
    /// preceding it.
    fn in_pa64_stub(&self, target: &dyn TargetAccess, pc: u64) -> bool {
        let Some(hit) = self.lookup_symbol_by_pc(pc) else {
            return false;
        };
        let in_own_section = hit
            .symbol
            .section
            .as_deref()
            .and_then(|name| self.object(hit.object)?.section(name))
            .is_some_and(|sec| sec.contains(pc));
        if in_own_section {
            return false;
        }

        let read = |addr: u64| target.read_u32(addr).ok();
        let is_ldd_r27 = |insn: u32| insn & 0xffff_c00e == 0x5361_0000;
        let is_bve_l = |insn: u32| insn == 0xe820_d000;
        let is_ldd_dp = |insn: u32| insn & 0xffff_c00e == 0x537b_0000;

        let Some(insn) = read(pc) else {
            return false;
        };
        let start = if is_ldd_r27(insn) {
            pc
        } else if is_bve_l(insn) {
            pc.wrapping_sub(4)
        } else if is_ldd_dp(insn) {
            pc.wrapping_sub(8)
        } else {
            return false;
        };

        read(start).is_some_and(is_ldd_r27)
            && read(start + 4).is_some_and(is_bve_l)
            && read(start + 8).is_some_and(is_ldd_dp)
    }

    /// Whether `pc` is on the way into a shared-library call: a stub's
    /// call leg or one of the indirect-call helpers.
    pub fn in_solib_call_trampoline(&self, target: &dyn TargetAccess, pc: u64) -> bool {
        if self.is_helper(pc, DYNCALL) || self.is_helper(pc, SR4EXPORT) {
            return true;
        }
        if self.in_section(pc, PLT_SECTION) || self.in_dyncall(pc) {
            return true;
        }
        if self
            .lookup_symbol_by_pc(pc)
            .is_some_and(|hit| hit.symbol.name == STUB_SYMBOL)
        {
            return true;
        }
        if self.config().abi == Abi::Pa64 && self.config().os == Os::Hpux {
            return self.in_pa64_stub(target, pc);
        }

        let Some(desc) = self.find_unwind_entry(pc) else {
            // GNU linkers emit stubs without unwind information.
            return match_insns_relaxed(target, pc, &IMPORT_STUB).is_some()
                || match_insns_relaxed(target, pc, &IMPORT_PIC_STUB).is_some()
                || match_insns_relaxed(target, pc, &LONG_BRANCH_STUB).is_some()
                || match_insns_relaxed(target, pc, &LONG_BRANCH_PIC_STUB).is_some();
        };

        match desc.stub_type {
            StubType::None => false,
            // Import stubs run the same code on both legs.
            StubType::LongBranch | StubType::Import => true,
            StubType::ParameterRelocation | StubType::Export => {
                self.stub_path(target, pc, desc.region_end) == Some(StubPath::Call)
            }
            _ => false,
        }
    }

    /// Whether `pc` is on the way back from a shared-library call.
    pub fn in_solib_return_trampoline(&self, target: &dyn TargetAccess, pc: u64) -> bool {
        let Some(desc) = self.find_unwind_entry(pc) else {
            return false;
        };
        match desc.stub_type {
            StubType::None | StubType::LongBranch => false,
            StubType::Import => true,
            StubType::ParameterRelocation | StubType::Export => {
                self.stub_path(target, pc, desc.region_end) == Some(StubPath::Return)
            }
            _ => false,
        }
    }

    /// Where control goes from the trampoline at `pc`, reading the
    /// needed registers from the target.
    pub fn skip_trampoline_code(&self, target: &dyn TargetAccess, pc: u64) -> Option<u64> {
        let regs = RegisterSet::read(target, &[R19, R22, DP, SP]);
        self.skip_trampoline_code_in_frame(target, &regs, pc)
    }

    /// Like [`Session::skip_trampoline_code`], with register values taken
    /// from `regs` (the registers of the frame executing the stub).
    pub fn skip_trampoline_code_in_frame(&self, target: &dyn TargetAccess, regs: &RegisterSet, pc: u64) -> Option<u64> {
        match self.config().os {
            Os::Hpux => self.skip_hpux_trampoline(target, regs, pc),
            Os::Linux => self.skip_elf_trampoline(target, regs, pc),
        }
    }

    fn read_pointer(&self, target: &dyn TargetAccess, addr: u64) -> Option<u64> {
        target.read_word(addr, self.convention().word_size()).ok()
    }

    /// Decode an import stub at `pc` into the address of its linkage
    /// table slot.
    fn import_stub_slot(&self, target: &dyn TargetAccess, regs: &RegisterSet, pc: u64) -> Option<u64> {
        let (insns, base_reg) = if let Some(insns) = match_insns(target, pc, &IMPORT_STUB) {
            (insns, DP)
        } else {
            (match_insns(target, pc, &IMPORT_PIC_STUB)?, R19)
        };
        let offset = i64::from(extract_21(insns[0])) + i64::from(extract_14(insns[1]));
        let base = regs.get(base_reg)?;
        Some(self.mask_address(base.wrapping_add_signed(offset)))
    }

    /// Follow a `.plt` slot. An unresolved slot points back at the PLT
    /// stub, whose second word pair holds the fixup routine.
    fn resolve_plt_slot(&self, target: &dyn TargetAccess, pc: u64) -> Option<u64> {
        if !self.in_section(pc, PLT_SECTION) {
            return Some(pc);
        }
        let pc = self.read_pointer(target, pc)?;
        if !self.in_section(pc, PLT_SECTION) {
            return Some(pc);
        }
        if match_insns(target, pc, &PLT_STUB).is_none() {
            warn!("Cannot resolve PLT stub at 0x{:x}.", pc);
            return None;
        }
        self.read_pointer(target, pc + 8)
    }

    fn skip_elf_trampoline(&self, target: &dyn TargetAccess, regs: &RegisterSet, pc: u64) -> Option<u64> {
        if self.in_dyncall(pc) {
            let pc = regs.get(R22)?;
            // Procedure labels have bit 30 set.
            if pc & 0x2 != 0 {
                return self.read_pointer(target, pc & !0x3);
            }
            return Some(pc);
        }
        let pc = self.import_stub_slot(target, regs, pc).unwrap_or(pc);
        self.resolve_plt_slot(target, pc)
    }

    /// First-time reconciliation of a descriptor without a stub type and
    /// the minimal symbol at `pc`.
    ///
    /// `Ok(false)`: not a stub. `Err`: the two disagreed and this call
    /// settled it.
    fn reconcile_stub_type(&self, hit: &UnwindHit, pc: u64) -> Result<bool, AmbiguousStub> {
        let Some(msym) = self.lookup_symbol_by_pc(pc) else {
            return Ok(false);
        };
        if msym.symbol.kind != SymbolType::SolibTrampoline {
            return Ok(false);
        }

        let real_code = self.symbols_named(&msym.symbol.name, SymbolType::Text);
        let resolution = if real_code.is_empty() {
            self.override_symbol_type(&msym.symbol, SymbolType::Text);
            StubResolution::SymbolIsText
        } else {
            self.override_stub_type(hit.key, StubType::Export);
            StubResolution::DescriptorIsExport
        };
        let address = msym.symbol.address();
        Err(AmbiguousStub {
            symbol: msym.symbol.name,
            address,
            resolution,
        })
    }

    fn skip_hpux_trampoline(&self, target: &dyn TargetAccess, regs: &RegisterSet, pc: u64) -> Option<u64> {
        let orig_pc = pc;
        let mut pc = pc;

        if self.is_helper(pc, DYNCALL) {
            pc = regs.get(R22)?;
            // Bit 30 marks a procedure label rather than a code address.
            if pc & 0x2 != 0 {
                pc = self.read_pointer(target, pc & !0x3)?;
            }
        }
        if self.is_helper(pc, DYNCALL_EXTERNAL) {
            pc = regs.get(R22)?;
            pc = self.read_pointer(target, pc & !0x3)?;
        } else if self.is_helper(pc, SR4EXPORT) {
            pc = regs.get(R22)?;
        }

        let fallback = if pc == orig_pc { None } else { Some(pc & !0x3) };

        if let Some(slot) = self.import_stub_slot(target, regs, pc) {
            return self.resolve_plt_slot(target, slot);
        }

        let mut hit = self.lookup_unwind(pc)?;

        if hit.descriptor.stub_type == StubType::None {
            match self.reconcile_stub_type(&hit, pc) {
                Ok(_) => return fallback,
                Err(ambiguous) => {
                    debug!(
                        "stub type of {} at 0x{:x} disagrees with its descriptor: {:?}",
                        ambiguous.symbol, ambiguous.address, ambiguous.resolution
                    );
                    if ambiguous.resolution == StubResolution::SymbolIsText {
                        return fallback;
                    }
                    hit.descriptor.stub_type = StubType::Export;
                }
            }
        }

        self.walk_stub(target, regs, &hit, pc, fallback)
    }

    /// Walk the stub covered by `hit` from `pc` to the branch that leaves it.
    fn walk_stub(
        &self,
        target: &dyn TargetAccess,
        regs: &RegisterSet,
        hit: &UnwindHit,
        pc: u64,
        fallback: Option<u64>,
    ) -> Option<u64> {
        let is_pa_2 = self.config().is_pa_2 || self.config().abi == Abi::Pa64;
        let mut prev = 0u32;
        let mut loc = pc;

        loop {
            if self.lookup_unwind(loc).map(|h| h.key) != Some(hit.key) {
                warn!("Unable to find branch in linker stub");
                return fallback;
            }
            let Ok(cur) = target.read_u32(loc) else {
                warn!("cannot read linker stub at 0x{:x}", loc);
                return fallback;
            };

            // ldil L'X,r1 ; be R'X(sr4,r1)
            if cur & 0xffe0_e000 == 0xe020_2000 {
                if prev & 0xffe0_0000 == 0x2020_0000 {
                    let dest = i64::from(extract_21(prev)) + i64::from(extract_17(cur));
                    return Some(self.mask_address(dest as u64) & !0x3);
                }
                warn!("Unable to find ldil X,%r1 before ble Y(%sr4,%r1).");
                return fallback;
            }

            // Import stub to export stub: the destination may still be the
            // lazy binder, so ask the symbol table instead.
            if BE_R21.contains(&cur) || (is_pa_2 && BVE_R21.contains(&cur)) {
                let Some(stub) = self.lookup_symbol_by_pc(loc) else {
                    warn!("Unable to find symbol for 0x{:x}", loc);
                    return fallback;
                };
                let Some(lib) = self.lookup_symbol(&stub.symbol.name) else {
                    warn!("Unable to find library symbol for {}.", stub.symbol.name);
                    return fallback;
                };
                return Some(lib.symbol.address());
            }

            // bl X,rp / bl X,r0 / b,l X,r2
            let branch = cur & 0xffe0_e000;
            if branch == 0xe840_0000 || branch == 0xe800_0000 || branch == 0xe800_a000 {
                let dest = loc.wrapping_add_signed(i64::from(extract_17(cur)) + 8);
                return Some(self.mask_address(dest) & !0x3);
            }

            // bv (rp), returning to the caller; needs the stub's own SP.
            if cur & 0xffe0_f000 == 0xe840_c000 {
                if prev == LDW_RP_MINUS_8 {
                    let sp = regs.get(SP)?;
                    return target.read_u32(sp.wrapping_sub(8)).ok().map(|v| u64::from(v) & !0x3);
                }
                warn!("Unable to find restore of %rp before bv (%rp).");
                return fallback;
            }

            // bve,n (rp) on PA 2.0, or be,n 0(sr0,rp): the return
            // address was spilled to sp-24.
            if (is_pa_2 && cur & 0xffe0_f000 == 0xe840_d000) || cur == BE_N_RP {
                let sp = regs.get(SP)?;
                return self.read_pointer(target, sp.wrapping_sub(24)).map(|v| v & !0x3);
            }

            prev = cur;
            loc += 4;
        }
    }
}
