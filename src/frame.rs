//! Frame recovery.
//!
//! Each frame is recognised by one of five unwinders, tried in order:
//! an active inferior call's dummy frame, the Linux signal trampoline,
//! linker stubs, code covered by an unwind descriptor, and finally a
//! symbol-based fallback. An unwinder produces a [`FrameCache`]: the
//! frame base (the SP at function entry) and where the caller's
//! registers were saved. [`Session::backtrace`] chains them.

use std::cell::OnceCell;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use log::{debug, trace, warn};

use crate::abi::CallingConvention;
use crate::bitfield::{extract_14, low_sign_extend};
use crate::error::Result;
use crate::prologue::{
    callee_fr_mask, callee_gr_mask, inst_saves_fr, inst_saves_gr, is_branch, is_sp_save, rp_save_offset,
    skip_prologue_hard_way, std_ma_displacement, SpAdjustTracker, COPY_R3_R1, STW_RP_24,
};
use crate::registers::{RegisterSet, FP, FP0, IPSW, PCOQ_HEAD, PCOQ_TAIL, R1, R31, RP, SP};
use crate::target::{ActiveDummy, Abi, Os, Session, TargetAccess};
use crate::types::{FrameId, FrameKind, VirtAddr};
use crate::unwind_table::{StubType, UnwindDescriptor};

/// Where a caller's register value can be recovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavedRegister {
    /// Saved in target memory at this address.
    Addr(u64),
    /// Known outright, e.g. the caller's SP.
    Value(u64),
    /// Still live, unchanged, in another register of this frame.
    SameAs(usize),
}

/// Saved-register map of one frame. Registers that are absent were not
/// saved: the caller sees the same value as this frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameSavedRegisters {
    slots: BTreeMap<usize, SavedRegister>,
}

impl FrameSavedRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, regnum: usize) -> Option<SavedRegister> {
        self.slots.get(&regnum).copied()
    }

    pub fn set(&mut self, regnum: usize, slot: SavedRegister) {
        self.slots.insert(regnum, slot);
    }

    pub fn remove(&mut self, regnum: usize) {
        self.slots.remove(&regnum);
    }

    pub fn is_addr(&self, regnum: usize) -> bool {
        matches!(self.get(regnum), Some(SavedRegister::Addr(_)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, SavedRegister)> + '_ {
        self.slots.iter().map(|(&r, &s)| (r, s))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Turn base-relative memory slots into absolute addresses.
    fn rebase(&mut self, base: u64) {
        for slot in self.slots.values_mut() {
            if let SavedRegister::Addr(offset) = slot {
                *offset = base.wrapping_add(*offset);
            }
        }
    }
}

/// What an unwinder learned about one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameCache {
    /// Value of SP on entry to the function.
    pub base: u64,
    pub id: FrameId,
    pub saved: FrameSavedRegisters,
    /// The descriptor forbids unwinding past this frame.
    pub cannot_unwind: bool,
}

impl FrameCache {
    fn new(base: u64, code_addr: u64) -> Self {
        FrameCache {
            base,
            id: FrameId { stack_addr: VirtAddr(base), code_addr: VirtAddr(code_addr) },
            saved: FrameSavedRegisters::new(),
            cannot_unwind: false,
        }
    }

    /// Registers of the caller, given this frame's registers.
    ///
    /// Slots that cannot be read leave the register unknown. The PC tail
    /// follows the head unless it was saved separately.
    pub fn caller_registers(&self, target: &dyn TargetAccess, callee: &RegisterSet, word_size: usize) -> RegisterSet {
        let mut caller = callee.clone();
        for (regnum, slot) in self.saved.iter() {
            let value = match slot {
                SavedRegister::Addr(addr) => match target.read_word(addr, word_size) {
                    Ok(v) => Some(v),
                    Err(e) => {
                        debug!("register {} unreadable at 0x{:x}: {}", regnum, addr, e);
                        None
                    }
                },
                SavedRegister::Value(v) => Some(v),
                SavedRegister::SameAs(other) => callee.get(other),
            };
            match value {
                Some(v) => caller.set(regnum, v),
                None => caller.remove(regnum),
            }
        }
        if self.saved.get(PCOQ_TAIL).is_none() {
            match caller.get(PCOQ_HEAD) {
                Some(head) => caller.set(PCOQ_TAIL, head.wrapping_add(4)),
                None => caller.remove(PCOQ_TAIL),
            }
        }
        caller
    }
}

/// One frame of a backtrace.
#[derive(Debug, Clone)]
pub struct Frame {
    /// 0 for the innermost frame.
    pub level: usize,
    pub pc: u64,
    pub kind: FrameKind,
    pub registers: RegisterSet,
    cache: OnceCell<FrameCache>,
}

impl Frame {
    /// Recognise the frame whose registers are `registers`.
    pub fn new(session: &Session, target: &dyn TargetAccess, level: usize, registers: RegisterSet) -> Self {
        let kind = session.sniff_frame(target, &registers);
        Frame {
            level,
            pc: registers.pc().unwrap_or(0),
            kind,
            registers,
            cache: OnceCell::new(),
        }
    }

    /// The frame's unwind information, computed on first use.
    pub fn cache(&self, session: &Session, target: &dyn TargetAccess) -> Result<&FrameCache> {
        if let Some(cache) = self.cache.get() {
            return Ok(cache);
        }
        let cache = session.frame_cache_for(self.kind, target, &self.registers)?;
        Ok(self.cache.get_or_init(|| cache))
    }

    pub fn cached(&self) -> Option<&FrameCache> {
        self.cache.get()
    }

    pub fn id(&self, session: &Session, target: &dyn TargetAccess) -> Result<FrameId> {
        self.cache(session, target).map(|c| c.id)
    }

    pub fn caller_registers(&self, session: &Session, target: &dyn TargetAccess) -> Result<RegisterSet> {
        let word_size = session.convention().word_size();
        let cache = self.cache(session, target)?;
        Ok(cache.caller_registers(target, &self.registers, word_size))
    }

    /// Name of the symbol covering the PC.
    pub fn function(&self, session: &Session) -> Option<String> {
        session.lookup_symbol_by_pc(self.pc).map(|hit| hit.symbol.name)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:<2} 0x{:08x} [{}]", self.level, self.pc, self.kind)?;
        if let Some(cache) = self.cached() {
            write!(f, " base 0x{:08x}", cache.base)?;
        }
        Ok(())
    }
}

/// What a scan of the prologue found, with memory slots still relative
/// to the frame base.
#[derive(Debug, Default)]
struct PrologueScan {
    saved: FrameSavedRegisters,
    frame_size: i64,
    sp_saved: bool,
    fp_in_r1: bool,
}

/// Walk `[start, end)` looking for the stack adjustments and register
/// saves `desc` announces. Stops once everything is found, or one
/// instruction after the first branch.
fn scan_prologue(
    target: &dyn TargetAccess,
    convention: &dyn CallingConvention,
    desc: &UnwindDescriptor,
    start: u64,
    end: u64,
) -> Result<PrologueScan> {
    let frame_total = desc.frame_size() as i64;
    let split_fp = convention.word_size() == 4;
    let mut gr_mask = callee_gr_mask(desc);
    let mut fr_mask = callee_fr_mask(desc);
    let mut looking_for_sp = desc.saves_sp;
    let mut looking_for_rp = desc.saves_rp;
    let mut tracker = SpAdjustTracker::new();
    let mut fp_loc: i64 = -1;
    let mut final_iteration = false;
    let mut scan = PrologueScan::default();

    let mut pc = start;
    while (gr_mask != 0 || fr_mask != 0 || looking_for_sp || looking_for_rp || scan.frame_size < frame_total)
        && pc < end
    {
        let inst = target.read_u32(pc).map_err(|_| crate::error::Error::Instruction(pc))?;
        scan.frame_size += i64::from(tracker.adjust(inst));

        let rp_slot = rp_save_offset(inst).or((inst == STW_RP_24).then_some(-24));
        if let Some(offset) = rp_slot {
            looking_for_rp = false;
            scan.saved.set(RP, SavedRegister::Addr(offset as u64));
        }

        // The old frame pointer goes into the first word of the new frame.
        if is_sp_save(inst) {
            looking_for_sp = false;
            scan.sp_saved = true;
            scan.saved.set(FP, SavedRegister::Addr(0));
        } else if inst == COPY_R3_R1 {
            scan.fp_in_r1 = true;
        }

        let reg = inst_saves_gr(inst);
        if (3..=18).contains(&reg) && !(desc.saves_sp && reg as usize == FP) {
            gr_mask &= !(1u64 << reg);
            let post_modify = (inst >> 26 == 0x1b && extract_14(inst) >= 0) || inst & 0xfc00_000c == 0x7000_0008;
            let offset = if post_modify {
                0
            } else {
                let disp = match inst >> 26 {
                    0x1c => i64::from(std_ma_displacement(inst)),
                    0x03 => i64::from(low_sign_extend(inst & 0x1f, 5)),
                    _ => i64::from(extract_14(inst)),
                };
                if desc.saves_sp {
                    disp
                } else {
                    disp + frame_total
                }
            };
            scan.saved.set(reg as usize, SavedRegister::Addr(offset as u64));
        }

        // GNU code points r1 at the FP save area; HP code stores at sp.
        if inst & 0xffff_c000 == 0x3461_0000 || inst & 0xffff_c000 == 0x37c1_0000 {
            fp_loc = i64::from(extract_14(inst));
        }

        let reg = inst_saves_fr(inst);
        if (12..=21).contains(&reg) {
            fr_mask &= !(1u64 << reg);
            let offset = if fp_loc == -1 {
                fp_loc = 8;
                0
            } else {
                let at = fp_loc;
                fp_loc += 8;
                at
            };
            let regnum = convention.fp_regnum(reg);
            scan.saved.set(regnum, SavedRegister::Addr(offset as u64));
            if split_fp {
                scan.saved.set(regnum + 1, SavedRegister::Addr((offset + 4) as u64));
            }
        }

        if final_iteration {
            break;
        }
        if is_branch(inst) {
            final_iteration = true;
        }
        pc += 4;
    }
    Ok(scan)
}

impl Session {
    /// Registers worth snapshotting for unwinding.
    pub fn frame_registers(&self) -> Vec<usize> {
        let fp_count = match self.config().abi {
            Abi::Pa32 => 64,
            Abi::Pa64 => 32,
        };
        (R1..=IPSW).chain(FP0..FP0 + fp_count).collect()
    }

    fn active_dummy(&self, regs: &RegisterSet) -> Option<ActiveDummy> {
        let (pc, sp) = (regs.pc()?, regs.sp()?);
        let id = FrameId { stack_addr: VirtAddr(sp), code_addr: VirtAddr(pc) };
        self.dummies.borrow().iter().rev().find(|d| d.id == id).cloned()
    }

    /// Decide which unwinder handles the frame with registers `regs`.
    pub fn sniff_frame(&self, target: &dyn TargetAccess, regs: &RegisterSet) -> FrameKind {
        let pc = regs.pc().unwrap_or(0);
        if self.active_dummy(regs).is_some() {
            FrameKind::CallDummy
        } else if self.config().os == Os::Linux && self.find_sigcontext(target, pc).is_some() {
            FrameKind::SignalTrampoline
        } else if pc == 0 || self.in_solib_call_trampoline(target, pc) || self.in_solib_return_trampoline(target, pc) {
            FrameKind::Stub
        } else if self.find_unwind_entry(pc).is_some() {
            FrameKind::Normal
        } else {
            FrameKind::Fallback
        }
    }

    pub fn frame_cache_for(&self, kind: FrameKind, target: &dyn TargetAccess, regs: &RegisterSet) -> Result<FrameCache> {
        match kind {
            FrameKind::Normal => self.frame_cache(target, regs),
            FrameKind::Stub => self.stub_frame_cache(regs),
            FrameKind::Fallback => self.fallback_frame_cache(target, regs),
            FrameKind::SignalTrampoline => self.sigtramp_frame_cache(target, regs),
            FrameKind::CallDummy => self.dummy_frame_cache(regs),
        }
    }

    /// Frame base and saved registers of a frame in code covered by an
    /// unwind descriptor.
    ///
    /// Without a descriptor the result is an empty map with the base at
    /// the current SP.
    pub fn frame_cache(&self, target: &dyn TargetAccess, regs: &RegisterSet) -> Result<FrameCache> {
        let pc = VirtAddr(regs.require(PCOQ_HEAD)?).strip_privilege().addr();
        let sp = regs.require(SP)?;
        let Some(desc) = self.find_unwind_entry(pc) else {
            return Ok(FrameCache::new(sp, pc));
        };
        let convention = self.convention();

        let start_pc = if desc.region_description & 0x2 == 0 {
            desc.region_start
        } else {
            self.function_start(pc).unwrap_or(desc.region_start)
        };
        let start_desc = self.find_unwind_entry(start_pc);
        let prologue_end = skip_prologue_hard_way(target, convention, start_desc.as_ref(), start_pc, false);
        let end_pc = if prologue_end != 0 && pc > prologue_end { prologue_end } else { pc };

        let mut scan = scan_prologue(target, convention, &desc, start_pc, end_pc)?;

        let mut fp = regs.get(FP).unwrap_or(0);
        if desc.pseudo_sp_set {
            fp = fp.wrapping_sub(desc.frame_size());
        }
        let base = if pc >= prologue_end && (desc.saves_sp || desc.pseudo_sp_set) && fp != 0 {
            trace!("frame at 0x{:x}: base 0x{:x} from frame pointer", pc, fp);
            fp
        } else if desc.saves_sp && scan.sp_saved {
            let saved = target.read_word(sp, convention.word_size())?;
            trace!("frame at 0x{:x}: base 0x{:x} saved at sp", pc, saved);
            saved
        } else {
            let base = sp.wrapping_sub(scan.frame_size as u64);
            trace!("frame at 0x{:x}: base 0x{:x} from {} bytes of adjustment", pc, base, scan.frame_size);
            base
        };

        scan.saved.rebase(base);
        scan.saved.set(SP, SavedRegister::Value(base));

        let return_reg = if desc.is_millicode { R31 } else { RP };
        match scan.saved.get(return_reg) {
            Some(slot @ SavedRegister::Addr(_)) => scan.saved.set(PCOQ_HEAD, slot),
            _ => {
                if let Some(value) = regs.get(return_reg) {
                    scan.saved.set(PCOQ_HEAD, SavedRegister::Value(value));
                }
            }
        }

        // The frame pointer was moved to r1 but never stored.
        if desc.saves_sp && !scan.saved.is_addr(FP) && scan.fp_in_r1 {
            if let Some(r1) = regs.get(R1).filter(|&v| v != 0) {
                scan.saved.set(FP, SavedRegister::Value(r1));
            }
        }

        let mut cache = FrameCache::new(base, start_pc);
        cache.saved = scan.saved;
        cache.cannot_unwind = desc.cannot_unwind;
        Ok(cache)
    }

    /// Linker stubs keep no frame. The caller's PC is still in RP,
    /// except that HP-UX export stubs park it at `SP - 24`.
    pub fn stub_frame_cache(&self, regs: &RegisterSet) -> Result<FrameCache> {
        let pc = VirtAddr(regs.require(PCOQ_HEAD)?).strip_privilege().addr();
        let base = regs.require(SP)?;
        let mut cache = FrameCache::new(base, self.function_start(pc).unwrap_or(pc));

        let export = self.config().os == Os::Hpux
            && self
                .lookup_unwind(pc)
                .is_some_and(|hit| hit.descriptor.stub_type == StubType::Export);
        let pc_slot = if export {
            SavedRegister::Addr(base.wrapping_sub(24))
        } else {
            SavedRegister::SameAs(RP)
        };
        cache.saved.set(PCOQ_HEAD, pc_slot);
        Ok(cache)
    }

    /// Frame without a descriptor: replay SP adjustments and RP saves
    /// from the start of the enclosing symbol up to the PC.
    pub fn fallback_frame_cache(&self, target: &dyn TargetAccess, regs: &RegisterSet) -> Result<FrameCache> {
        let pc = VirtAddr(regs.require(PCOQ_HEAD)?).strip_privilege().addr();
        let sp = regs.require(SP)?;
        let start = self.function_start(pc);

        let mut tracker = SpAdjustTracker::new();
        let mut frame_size = 0i64;
        let mut rp_offset = None;
        if let Some(start) = start {
            for addr in (start..pc).step_by(4) {
                let Ok(inst) = target.read_u32(addr) else {
                    break;
                };
                frame_size += i64::from(tracker.adjust(inst));
                if let Some(offset) = rp_save_offset(inst) {
                    rp_offset = Some(offset);
                }
            }
        }

        let base = sp.wrapping_sub(frame_size as u64);
        let mut cache = FrameCache::new(base, start.unwrap_or(pc));
        cache.saved.set(SP, SavedRegister::Value(base));
        match rp_offset {
            Some(offset) => {
                let slot = SavedRegister::Addr(base.wrapping_add(offset as u64));
                cache.saved.set(RP, slot);
                cache.saved.set(PCOQ_HEAD, slot);
            }
            None => {
                if let Some(rp) = regs.get(RP) {
                    cache.saved.set(PCOQ_HEAD, SavedRegister::Value(rp));
                }
            }
        }
        Ok(cache)
    }

    fn dummy_frame_cache(&self, regs: &RegisterSet) -> Result<FrameCache> {
        let sp = regs.require(SP)?;
        let dummy = self.active_dummy(regs);
        let mut cache = FrameCache::new(sp, regs.pc().unwrap_or(0));
        if let Some(dummy) = dummy {
            cache.id = dummy.id;
            for (regnum, value) in dummy.saved.iter() {
                cache.saved.set(regnum, SavedRegister::Value(value));
            }
        }
        Ok(cache)
    }

    /// Walk the stack of the stopped thread.
    pub fn backtrace(&self, target: &dyn TargetAccess) -> Result<Vec<Frame>> {
        let regs = RegisterSet::read(target, &self.frame_registers());
        self.backtrace_from(target, regs)
    }

    /// Walk the stack starting from an explicit register snapshot.
    ///
    /// The walk ends at a caller PC of 0, a frame that repeats an earlier
    /// frame's id, a descriptor marked `cannot_unwind`, or the configured
    /// depth limit. Failing to unwind the innermost frame is an error;
    /// failing further out just ends the walk.
    pub fn backtrace_from(&self, target: &dyn TargetAccess, registers: RegisterSet) -> Result<Vec<Frame>> {
        let word_size = self.convention().word_size();
        let mut frames: Vec<Frame> = Vec::new();
        let mut seen = HashSet::new();
        let mut regs = registers;

        for level in 0..self.config().max_backtrace_depth {
            let frame = Frame::new(self, target, level, regs);
            let cache = match frame.cache(self, target) {
                Ok(cache) => cache,
                Err(e) if level == 0 => return Err(e),
                Err(e) => {
                    warn!("backtrace stopped at frame {} (pc 0x{:x}): {}", level, frame.pc, e);
                    break;
                }
            };
            if !seen.insert(cache.id) {
                debug!("frame {} repeats id {:?}, stopping", level, cache.id);
                break;
            }
            let stop = cache.cannot_unwind;
            let caller = cache.caller_registers(target, &frame.registers, word_size);
            trace!("{}", frame);
            frames.push(frame);

            if stop {
                debug!("frame {} cannot be unwound", level);
                break;
            }
            match caller.pc() {
                Some(0) | None => break,
                Some(_) => regs = caller,
            }
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitfield::deposit_21;
    use crate::target::TargetConfig;
    use crate::testutil::{flags, stub_record, unwind_record, MockObject, MockTarget};

    const NOP: u32 = 0x0800_0240;
    const LDO_80_SP: u32 = 0x37de_00a0;
    const STW_RP_20: u32 = 0x6bc2_3fd9;

    fn session(os: Os, objects: Vec<MockObject>) -> Session {
        let mut s = Session::new(TargetConfig { os, ..TargetConfig::default() });
        for o in objects {
            s.add_object(Box::new(o));
        }
        s
    }

    fn with_unwind(records: &[[u8; 16]]) -> MockObject {
        MockObject::som("a.out").with_section("$UNWIND_START$", 0, records.concat())
    }

    fn regs(pairs: &[(usize, u64)]) -> RegisterSet {
        pairs.iter().copied().collect()
    }

    fn gr_slots(cache: &FrameCache) -> Vec<(usize, SavedRegister)> {
        cache.saved.iter().filter(|(r, _)| (3..=18).contains(r)).collect()
    }

    #[test]
    fn frame_size_and_return_pointer_slot() {
        let exe = with_unwind(&[unwind_record(0x1000, 0x10fc, flags::SAVES_RP, 10)]);
        let s = session(Os::Hpux, vec![exe]);
        let mut target = MockTarget::new();
        target.poke_insns(0x1000, &[STW_RP_20, LDO_80_SP, NOP, NOP]);

        let cache = s.frame_cache(&target, &regs(&[(PCOQ_HEAD, 0x1008), (SP, 0x1000), (RP, 0x4444)])).unwrap();
        assert_eq!(cache.base, 0xfb0);
        assert_eq!(cache.saved.get(RP), Some(SavedRegister::Addr(0xf9c)));
        assert_eq!(cache.saved.get(PCOQ_HEAD), Some(SavedRegister::Addr(0xf9c)));
        assert_eq!(cache.saved.get(SP), Some(SavedRegister::Value(0xfb0)));
        assert_eq!(cache.id, FrameId { stack_addr: VirtAddr(0xfb0), code_addr: VirtAddr(0x1000) });
    }

    #[test]
    fn large_frame_allocated_with_addil_and_ldo() {
        // 0x4010 bytes does not fit an ldo displacement.
        let exe = with_unwind(&[unwind_record(0x1000, 0x10fc, flags::SAVES_RP, 0x802)]);
        let s = session(Os::Hpux, vec![exe]);
        let mut target = MockTarget::new();
        let addil = deposit_21(0x4000 >> 11, 0x2bc0_0000); // addil L'0x4000,sp
        target.poke_insns(0x1000, &[STW_RP_20, addil, 0x343e_0020, NOP, NOP]); // ldo R'0x4010(r1),sp

        // Between the two halves nothing has been allocated yet.
        let cache = s.frame_cache(&target, &regs(&[(PCOQ_HEAD, 0x1008), (SP, 0x10_0000)])).unwrap();
        assert_eq!(cache.base, 0x10_0000);

        let cache = s.frame_cache(&target, &regs(&[(PCOQ_HEAD, 0x1010), (SP, 0x10_4010)])).unwrap();
        assert_eq!(cache.base, 0x10_0000);
        assert_eq!(cache.saved.get(RP), Some(SavedRegister::Addr(0x10_0000 - 20)));
        assert_eq!(cache.saved.get(SP), Some(SavedRegister::Value(0x10_0000)));
    }

    #[test]
    fn only_observed_saves_are_recorded() {
        // Descriptor promises r3..r5; the code stores r3 and r4 before the call.
        let exe = with_unwind(&[unwind_record(0x1000, 0x10fc, flags::entry_gr(3), 8)]);
        let s = session(Os::Hpux, vec![exe]);
        let mut target = MockTarget::new();
        target.poke_insns(
            0x1000,
            &[
                0x37de_0080, // ldo 64(sp),sp
                0x6bc3_3f89, // stw r3,-60(sp)
                0x6bc4_3f91, // stw r4,-56(sp)
                0xe840_0000, // bl
                NOP,
                NOP,
            ],
        );

        let cache = s.frame_cache(&target, &regs(&[(PCOQ_HEAD, 0x1020), (SP, 0x2000)])).unwrap();
        assert_eq!(cache.base, 0x1fc0);
        assert_eq!(
            gr_slots(&cache),
            vec![(3, SavedRegister::Addr(0x1fc4)), (4, SavedRegister::Addr(0x1fc8))]
        );
    }

    fn frame_pointer_function(target: &mut MockTarget) {
        target.poke_insns(
            0x1000,
            &[
                STW_RP_20,
                COPY_R3_R1,
                0x081e_0243, // copy sp,r3
                0x6fc1_0080, // stw,ma r1,64(sp)
                0x6864_0010, // stw r4,8(r3)
                NOP,
                NOP,
            ],
        );
    }

    #[test]
    fn frame_pointer_is_the_base_after_the_prologue() {
        let w2 = flags::SAVES_RP | flags::SAVES_SP | flags::entry_gr(2);
        let s = session(Os::Hpux, vec![with_unwind(&[unwind_record(0x1000, 0x10fc, w2, 8)])]);
        let mut target = MockTarget::new();
        frame_pointer_function(&mut target);

        let cache = s
            .frame_cache(&target, &regs(&[(PCOQ_HEAD, 0x1040), (SP, 0x3040), (FP, 0x3000)]))
            .unwrap();
        assert_eq!(cache.base, 0x3000);
        assert_eq!(cache.saved.get(FP), Some(SavedRegister::Addr(0x3000)));
        assert_eq!(cache.saved.get(4), Some(SavedRegister::Addr(0x3008)));
        assert_eq!(cache.saved.get(RP), Some(SavedRegister::Addr(0x2fec)));
    }

    #[test]
    fn inside_the_prologue_the_saved_sp_is_used() {
        let w2 = flags::SAVES_RP | flags::SAVES_SP | flags::entry_gr(2);
        let s = session(Os::Hpux, vec![with_unwind(&[unwind_record(0x1000, 0x10fc, w2, 8)])]);
        let mut target = MockTarget::new();
        frame_pointer_function(&mut target);
        target.poke_u32(0x3040, 0x3000);

        let cache = s
            .frame_cache(&target, &regs(&[(PCOQ_HEAD, 0x1010), (SP, 0x3040), (FP, 0x3000)]))
            .unwrap();
        assert_eq!(cache.base, 0x3000);
        // The r4 store at 0x1010 has not executed yet.
        assert_eq!(cache.saved.get(4), None);
    }

    #[test]
    fn millicode_returns_through_r31() {
        let exe = with_unwind(&[unwind_record(0x1000, 0x10fc, flags::MILLICODE, 0)]);
        let s = session(Os::Hpux, vec![exe]);
        let mut target = MockTarget::new();
        target.poke_insns(0x1000, &[NOP, NOP]);

        let cache = s
            .frame_cache(&target, &regs(&[(PCOQ_HEAD, 0x1004), (SP, 0x2000), (R31, 0x5003), (RP, 0x6000)]))
            .unwrap();
        assert_eq!(cache.saved.get(PCOQ_HEAD), Some(SavedRegister::Value(0x5003)));
        assert_eq!(cache.base, 0x2000);
    }

    #[test]
    fn no_descriptor_gives_empty_cache() {
        let s = session(Os::Hpux, vec![]);
        let cache = s.frame_cache(&MockTarget::new(), &regs(&[(PCOQ_HEAD, 0x1004), (SP, 0x2000)])).unwrap();
        assert_eq!(cache.base, 0x2000);
        assert!(cache.saved.is_empty());
    }

    #[test]
    fn export_stub_frame_on_hpux() {
        let exe = MockObject::som("a.out").with_section("$UNWIND_END$", 0, stub_record(0x1200, 10, 4).to_vec());
        let hpux = session(Os::Hpux, vec![exe.clone()]);
        let r = regs(&[(PCOQ_HEAD, 0x1208), (SP, 0x4000), (RP, 0x7000)]);

        let cache = hpux.stub_frame_cache(&r).unwrap();
        assert_eq!(cache.base, 0x4000);
        assert_eq!(cache.saved.get(PCOQ_HEAD), Some(SavedRegister::Addr(0x3fe8)));

        let linux = session(Os::Linux, vec![exe]);
        let cache = linux.stub_frame_cache(&r).unwrap();
        assert_eq!(cache.saved.get(PCOQ_HEAD), Some(SavedRegister::SameAs(RP)));
        let caller = cache.caller_registers(&MockTarget::new(), &r, 4);
        assert_eq!(caller.get(PCOQ_HEAD), Some(0x7000));
        assert_eq!(caller.get(PCOQ_TAIL), Some(0x7004));
    }

    #[test]
    fn fallback_replays_from_symbol_start() {
        let exe = MockObject::som("a.out")
            .with_symbol("leaf", 0x1000, crate::symbols::SymbolType::Text)
            .with_range(0x1000, 0x2000);
        let s = session(Os::Hpux, vec![exe]);
        let mut target = MockTarget::new();
        target.poke_insns(0x1000, &[STW_RP_20, LDO_80_SP, NOP, NOP]);

        let r = regs(&[(PCOQ_HEAD, 0x100c), (SP, 0x5050), (RP, 0x1)]);
        assert_eq!(s.sniff_frame(&target, &r), FrameKind::Fallback);
        let cache = s.fallback_frame_cache(&target, &r).unwrap();
        assert_eq!(cache.base, 0x5000);
        assert_eq!(cache.saved.get(PCOQ_HEAD), Some(SavedRegister::Addr(0x4fec)));

        // Before the RP store executes, the return address is still live.
        let r = regs(&[(PCOQ_HEAD, 0x1000), (SP, 0x5000), (RP, 0x9000)]);
        let cache = s.fallback_frame_cache(&target, &r).unwrap();
        assert_eq!(cache.base, 0x5000);
        assert_eq!(cache.saved.get(PCOQ_HEAD), Some(SavedRegister::Value(0x9000)));
    }

    #[test]
    fn backtrace_through_two_frames() {
        // inner at 0x1000 (frame of 80, saves rp); outer at 0x2000, no saves.
        let exe = with_unwind(&[
            unwind_record(0x1000, 0x10fc, flags::SAVES_RP, 10),
            unwind_record(0x2000, 0x20fc, flags::CANNOT_UNWIND, 0),
        ]);
        let s = session(Os::Hpux, vec![exe]);
        let mut target = MockTarget::new();
        target.poke_insns(0x1000, &[STW_RP_20, LDO_80_SP, NOP, NOP]);
        target.poke_insns(0x2000, &[NOP, NOP, NOP, NOP]);
        // Saved return address of inner: 0x200b, privilege bits set.
        target.poke_u32(0x0f9c, 0x200b);

        let frames = s
            .backtrace_from(&target, regs(&[(PCOQ_HEAD, 0x1008), (SP, 0x1000), (RP, 0x200b)]))
            .unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].kind, FrameKind::Normal);
        assert_eq!(frames[1].pc, 0x2008);
        assert_eq!(frames[1].registers.sp(), Some(0xfb0));
        assert_eq!(frames[1].registers.get(PCOQ_TAIL), Some(0x200f));
        assert!(frames[1].cached().unwrap().cannot_unwind);
    }

    #[test]
    fn backtrace_stops_at_repeated_frame_and_zero_pc() {
        let exe = with_unwind(&[unwind_record(0x1000, 0x10fc, 0, 0)]);
        let s = session(Os::Hpux, vec![exe]);
        let mut target = MockTarget::new();
        target.poke_insns(0x1000, &[NOP, NOP, NOP]);

        // RP points back into the same function with the same SP.
        let frames = s
            .backtrace_from(&target, regs(&[(PCOQ_HEAD, 0x1004), (SP, 0x3000), (RP, 0x1004)]))
            .unwrap();
        assert_eq!(frames.len(), 1);

        let frames = s
            .backtrace_from(&target, regs(&[(PCOQ_HEAD, 0x1004), (SP, 0x3000), (RP, 0)]))
            .unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn backtrace_respects_depth_limit() {
        let mut s = Session::new(TargetConfig { max_backtrace_depth: 1, ..TargetConfig::default() });
        s.add_object(Box::new(with_unwind(&[unwind_record(0x1000, 0x10fc, 0, 0)])));
        let mut target = MockTarget::new();
        target.poke_insns(0x1000, &[NOP, NOP, NOP]);
        let frames = s
            .backtrace_from(&target, regs(&[(PCOQ_HEAD, 0x1004), (SP, 0x3000), (RP, 0x1008)]))
            .unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn innermost_frame_without_pc_is_an_error() {
        let s = session(Os::Hpux, vec![]);
        assert!(s.backtrace_from(&MockTarget::new(), regs(&[(SP, 0x3000)])).is_err());
    }

    #[test]
    fn dummy_frame_restores_snapshot() {
        let s = session(Os::Hpux, vec![]);
        let snapshot = regs(&[(PCOQ_HEAD, 0x4000), (SP, 0x8000), (RP, 0x4100), (FP, 0x7000)]);
        s.dummies.borrow_mut().push(ActiveDummy {
            id: FrameId { stack_addr: VirtAddr(0x8100), code_addr: VirtAddr(0x3ffc) },
            saved: snapshot.clone(),
        });

        let at_breakpoint = regs(&[(PCOQ_HEAD, 0x3ffc), (SP, 0x8100)]);
        assert_eq!(s.sniff_frame(&MockTarget::new(), &at_breakpoint), FrameKind::CallDummy);
        let frame = Frame::new(&s, &MockTarget::new(), 0, at_breakpoint);
        let caller = frame.caller_registers(&s, &MockTarget::new()).unwrap();
        assert_eq!(caller.get(FP), Some(0x7000));
        assert_eq!(caller.pc(), Some(0x4000));
        assert_eq!(frame.id(&s, &MockTarget::new()).unwrap().code_addr, VirtAddr(0x3ffc));
    }

    #[test]
    fn floating_point_saves_in_hp_layout() {
        // fstd,ma fr12,8(sp) then fstd,ma fr13,8(sp) under an HP-style prologue.
        let fstd = |r: u32| 0x2fd1_1220 | r;
        let exe = with_unwind(&[unwind_record(0x1000, 0x10fc, flags::entry_fr(2), 2)]);
        let s = session(Os::Hpux, vec![exe]);
        let mut target = MockTarget::new();
        target.poke_insns(0x1000, &[fstd(12), fstd(13), NOP, NOP]);

        let cache = s.frame_cache(&target, &regs(&[(PCOQ_HEAD, 0x1008), (SP, 0x2010)])).unwrap();
        let fr12 = s.convention().fp_regnum(12);
        let fr13 = s.convention().fp_regnum(13);
        assert_eq!(cache.saved.get(fr12), Some(SavedRegister::Addr(cache.base)));
        assert_eq!(cache.saved.get(fr12 + 1), Some(SavedRegister::Addr(cache.base + 4)));
        assert_eq!(cache.saved.get(fr13), Some(SavedRegister::Addr(cache.base + 8)));
    }
}
