//! Prologue instruction analysis.
//!
//! Recognizes the handful of instruction forms HP and GNU compilers use
//! to allocate a frame and spill callee-saved registers, and uses them to
//! find where a function's prologue ends.

use log::trace;

use crate::abi::CallingConvention;
use crate::bitfield::{extract_14, extract_21, extract_5R_store, extract_5_load, extract_5r_store};
use crate::registers::FP;
use crate::target::{Session, TargetAccess};
use crate::unwind_table::UnwindDescriptor;

/// Upper bound on prologue scans. The second pass masks out register
/// saves the descriptor promised but the first pass never found.
pub const MAX_PROLOGUE_PASSES: usize = 2;

/// `stw rp,-20(sp)`
pub const STW_RP_20: u32 = 0x6bc2_3fd9;
/// `stw rp,-24(sp)`
pub const STW_RP_24: u32 = 0x6bc2_7fd1;
/// `std rp,-16(sp)`, both encodings.
pub const STD_RP_16: [u32; 2] = [0x0fc2_12c1, 0x73c2_3fe1];
/// `copy r3,r1`
pub const COPY_R3_R1: u32 = 0x0803_0241;

/// Stack adjustment made by one prologue instruction.
///
/// `addil L'X,sp` followed by `ldo R'X(r1),sp` splits a large adjustment
/// over two instructions; the high part is carried here between calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpAdjustTracker {
    high21: i32,
}

impl SpAdjustTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn adjust(&mut self, inst: u32) -> i32 {
        // ldo X(sp),sp
        if inst & 0xffff_c000 == 0x37de_0000 {
            return extract_14(inst);
        }
        // stwm X,D(sp)
        if inst & 0xffe0_0000 == 0x6fc0_0000 {
            return extract_14(inst);
        }
        // std,ma X,D(sp)
        if inst & 0xffe0_0008 == 0x73c0_0008 {
            return std_ma_displacement(inst);
        }
        // addil high21,sp
        if inst & 0xffe0_0000 == 0x2bc0_0000 {
            self.high21 = extract_21(inst);
            return 0;
        }
        // ldo low11(r1),sp
        if inst & 0xffff_0000 == 0x343e_0000 {
            return self.high21.wrapping_add(extract_14(inst));
        }
        // fstws, as emitted by the HP compilers
        if inst & 0xffff_ffe0 == 0x2fd0_1220 {
            return extract_5_load(inst);
        }
        0
    }
}

/// Displacement of the doubleword `std`/`std,ma` format, in bytes.
pub fn std_ma_displacement(inst: u32) -> i32 {
    let sign = if inst & 1 != 0 { -1i32 << 13 } else { 0 };
    sign | ((((inst >> 4) & 0x3ff) << 3) as i32)
}

/// General register stored by `inst`, or 0 when it is not a store.
pub fn inst_saves_gr(inst: u32) -> u32 {
    let op = inst >> 26;
    let ext4 = (inst >> 6) & 0xf;
    match op {
        // stw, stwm, stw,ma
        0x1a | 0x1b | 0x1f => extract_5R_store(inst),
        // std
        0x1c => extract_5R_store(inst),
        0x03 if ext4 == 0xb => extract_5R_store(inst),
        // sth, stb
        0x19 | 0x18 => extract_5R_store(inst),
        0x03 if ext4 == 0x8 || ext4 == 0x9 => extract_5R_store(inst),
        _ => 0,
    }
}

/// Floating-point register stored by `inst`, or 0 when it is not a store.
pub fn inst_saves_fr(inst: u32) -> u32 {
    // fstd
    if inst & 0xfc00_dfc0 == 0x2c00_1200 {
        return extract_5r_store(inst);
    }
    if inst & 0xfc00_0002 == 0x7000_0002 {
        return extract_5R_store(inst);
    }
    // fstw
    if inst & 0xfc00_df80 == 0x2400_1200 {
        return extract_5r_store(inst);
    }
    if inst & 0xfc00_0002 == 0x7c00_0000 {
        return extract_5R_store(inst);
    }
    0
}

pub fn is_branch(inst: u32) -> bool {
    matches!(
        inst >> 26,
        0x20..=0x23 | 0x27..=0x2b | 0x2f..=0x33 | 0x38..=0x3b
    )
}

/// `stw,ma r1,N(sp)` or `std,ma r1,N(sp)`: the old frame pointer (moved
/// to r1) saved while allocating the frame.
pub fn is_sp_save(inst: u32) -> bool {
    inst & 0xffff_c000 == 0x6fc1_0000 || inst & 0xffff_c00c == 0x73c1_0008
}

/// Offset from the entry SP of a standard return-pointer save.
pub fn rp_save_offset(inst: u32) -> Option<i64> {
    match inst {
        STW_RP_20 => Some(-20),
        i if STD_RP_16.contains(&i) => Some(-16),
        _ => None,
    }
}

/// Loads relative to the argument pointer (`ldo X(r29),rN`, `copy r29,rN`).
fn loads_from_arg_pointer(inst: u32) -> bool {
    inst & 0xffe0_0000 == 0x37a0_0000 || inst & 0xffff_ffe0 == 0x081d_0240
}

fn reg_bit(reg: u32) -> u64 {
    1u64 << reg
}

/// Callee-saved general registers the descriptor promises, as a bitmask.
/// r3 is left out when it is saved as the frame pointer instead.
pub fn callee_gr_mask(desc: &UnwindDescriptor) -> u64 {
    (3..3 + u32::from(desc.entry_gr))
        .filter(|&r| !(desc.saves_sp && r as usize == FP))
        .fold(0, |mask, r| mask | reg_bit(r))
}

/// Callee-saved floating-point registers (from fr12) the descriptor
/// promises, as a bitmask.
pub fn callee_fr_mask(desc: &UnwindDescriptor) -> u64 {
    (12..12 + u32::from(desc.entry_fr)).fold(0, |mask, r| mask | reg_bit(r))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Look for everything the descriptor describes.
    Full,
    /// Ignore the saves the full pass never found.
    Masked,
}

enum PassEnd {
    /// Memory ran out; this is the answer.
    Final(u64),
    Tentative { end: u64, unsaved_gr: u64, unsaved_fr: u64 },
}

/// Walk the prologue of the function starting at `pc` using only the
/// instructions and the descriptor, and return the first address past it.
///
/// Returns `pc` unchanged when it is not the start of the descriptor's
/// region. With `stop_before_branch`, the scan never moves past a branch
/// (a prologue instruction may sit in its delay slot).
pub fn skip_prologue_hard_way(
    target: &dyn TargetAccess,
    convention: &dyn CallingConvention,
    desc: Option<&UnwindDescriptor>,
    pc: u64,
    stop_before_branch: bool,
) -> u64 {
    let Some(desc) = desc else {
        return pc;
    };
    if pc & !0x3 != desc.region_start {
        return pc;
    }

    let mut phase = Phase::Full;
    let mut masked = (0u64, 0u64);
    let mut end = pc;
    for _ in 0..MAX_PROLOGUE_PASSES {
        match prologue_pass(target, convention, desc, pc, stop_before_branch, masked) {
            PassEnd::Final(at) => return at,
            PassEnd::Tentative { end: at, unsaved_gr, unsaved_fr } => {
                end = at;
                let retry = unsaved_gr != 0 || (unsaved_fr != 0 && phase == Phase::Full);
                if !retry || phase == Phase::Masked {
                    break;
                }
                trace!(
                    "prologue at 0x{:x}: saves never seen (gr {:#x}, fr {:#x}), rescanning",
                    pc, unsaved_gr, unsaved_fr
                );
                masked = (unsaved_gr, unsaved_fr);
                phase = Phase::Masked;
            }
        }
    }
    end
}

fn prologue_pass(
    target: &dyn TargetAccess,
    convention: &dyn CallingConvention,
    desc: &UnwindDescriptor,
    start: u64,
    stop_before_branch: bool,
    (masked_gr, masked_fr): (u64, u64),
) -> PassEnd {
    let read = |addr: u64| target.read_u32(addr).ok();
    let gr_args = convention.arg_gr_range();
    let fr_args = convention.arg_fr_range();

    let mut pc = start;
    let mut stack_remaining = desc.frame_size() as i64;
    let mut save_rp = desc.saves_rp;
    let mut save_sp = desc.saves_sp;
    let mut save_gr = callee_gr_mask(desc) & !masked_gr;
    let mut save_fr = callee_fr_mask(desc) & !masked_fr;
    // HP compilers set this even when nothing was stored.
    let mut args_stored = true;
    let mut sp_tracker = SpAdjustTracker::new();
    let mut final_iteration = false;

    while save_gr != 0 || save_fr != 0 || save_rp || save_sp || stack_remaining > 0 || args_stored {
        let before = (save_gr, save_fr, save_rp, save_sp, stack_remaining);

        let Some(inst) = read(pc) else {
            return PassEnd::Final(pc);
        };

        stack_remaining -= i64::from(sp_tracker.adjust(inst));
        if rp_save_offset(inst).is_some() {
            save_rp = false;
        }
        if is_sp_save(inst) {
            save_sp = false;
        }

        if loads_from_arg_pointer(inst) {
            pc += 4;
            continue;
        }

        let mut reg = inst_saves_gr(inst);
        save_gr &= !reg_bit(reg);

        // Argument spills: skip the whole run of them.
        if gr_args.contains(&reg) {
            while gr_args.contains(&reg) {
                pc += 4;
                let Some(next) = read(pc) else {
                    return PassEnd::Final(pc);
                };
                reg = inst_saves_gr(next);
            }
            args_stored = false;
            continue;
        }

        reg = inst_saves_fr(inst);
        save_fr &= !reg_bit(reg);

        let Some(next_inst) = read(pc + 4) else {
            return PassEnd::Final(pc);
        };

        // An ldo computing the address for the FP argument store that
        // follows it.
        if inst & 0xfc00_0000 == 0x3400_0000 && fr_args.contains(&inst_saves_fr(next_inst)) {
            reg = inst_saves_fr(next_inst);
            pc = pc.wrapping_sub(4);
        }

        if fr_args.contains(&reg) {
            while fr_args.contains(&reg) {
                pc = pc.wrapping_add(8);
                let Some(ldo) = read(pc) else {
                    return PassEnd::Final(pc);
                };
                if ldo & 0xfc00_0000 != 0x3400_0000 {
                    break;
                }
                let Some(store) = read(pc + 4) else {
                    return PassEnd::Final(pc);
                };
                reg = inst_saves_fr(store);
            }
            args_stored = false;
            continue;
        }

        if is_branch(inst) && stop_before_branch {
            break;
        }

        // args_stored was set without any argument stores: everything
        // else is accounted for and this instruction changed nothing.
        let all_found = save_gr == 0 && save_fr == 0 && !save_rp && !save_sp && stack_remaining <= 0;
        if args_stored && all_found && before == (save_gr, save_fr, save_rp, save_sp, stack_remaining) {
            break;
        }

        pc += 4;

        if final_iteration {
            break;
        }
        if is_branch(inst) {
            final_iteration = true;
        }
    }

    PassEnd::Tentative { end: pc, unsaved_gr: save_gr, unsaved_fr: save_fr }
}

impl Session {
    /// First address past the prologue of the function containing `pc`.
    ///
    /// Line information wins when the object has it (never moving
    /// backwards from `pc`); otherwise the prologue is decoded.
    pub fn skip_prologue(&self, target: &dyn TargetAccess, pc: u64) -> u64 {
        let func_start = self.function_start(pc).unwrap_or(pc);
        let from_lines = self
            .object_for_pc(func_start)
            .and_then(|i| self.object(i))
            .and_then(|obj| obj.prologue_end(func_start));
        if let Some(end) = from_lines {
            return end.max(pc);
        }
        let desc = self.find_unwind_entry(pc);
        skip_prologue_hard_way(target, self.convention(), desc.as_ref(), pc, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{Pa32, Pa64};
    use crate::bitfield::deposit_21;
    use crate::testutil::MockTarget;

    const NOP: u32 = 0x0800_0240;
    const BL: u32 = 0xe840_0000;

    fn desc(start: u64, f: impl FnOnce(&mut UnwindDescriptor)) -> UnwindDescriptor {
        let mut d = UnwindDescriptor { region_start: start, region_end: start + 0xfc, ..Default::default() };
        f(&mut d);
        d
    }

    #[test]
    fn sp_adjust_forms() {
        let mut t = SpAdjustTracker::new();
        assert_eq!(t.adjust(0x37de_0080), 64); // ldo 64(sp),sp
        assert_eq!(t.adjust(0x37de_3f81), -64); // ldo -64(sp),sp
        assert_eq!(t.adjust(0x6fc1_0080), 64); // stwm r1,64(sp)
        assert_eq!(t.adjust(0x73c1_0108), 128); // std,ma r1,128(sp)
        assert_eq!(t.adjust(NOP), 0);
        assert_eq!(t.adjust(0x2fd0_1220), 8); // fstws, im5 field 0x10
    }

    #[test]
    fn addil_ldo_pair_carries_high_part() {
        let mut t = SpAdjustTracker::new();
        // addil L'0x4000,sp ; ldo R'0x4000+0x10(r1),sp
        let addil = deposit_21(0x4000 >> 11, 0x2bc0_0000);
        assert_eq!(t.adjust(addil), 0);
        assert_eq!(extract_21(addil), 0x4000);
        assert_eq!(t.adjust(0x343e_0020), 0x4010);
        // The high part persists until replaced.
        assert_eq!(t.adjust(0x343e_0000), 0x4000);
    }

    #[test]
    fn register_save_detection() {
        assert_eq!(inst_saves_gr(0x6864_0010), 4); // stw r4,8(r3)
        assert_eq!(inst_saves_gr(STW_RP_20), 2);
        assert_eq!(inst_saves_gr(0x6fc1_0080), 1); // stwm r1,64(sp)
        assert_eq!(inst_saves_gr(0x73c5_0010), 5); // std r5
        assert_eq!(inst_saves_gr(NOP), 0);
        // fstd fr12,0(r1): opcode 0x0b with the store bits
        assert_eq!(inst_saves_fr(0x2c20_120c), 12);
        assert_eq!(inst_saves_fr(0x7c2e_0000), 14);
        assert_eq!(inst_saves_fr(STW_RP_20), 0);
    }

    #[test]
    fn branch_opcodes() {
        assert!(is_branch(BL));
        assert!(is_branch(0xe840_c000)); // bv r0(rp)
        assert!(is_branch(0x8000_0000)); // combt
        assert!(!is_branch(NOP));
        assert!(!is_branch(STW_RP_20));
    }

    #[test]
    fn gr_mask_skips_frame_pointer() {
        let d = desc(0x1000, |d| {
            d.entry_gr = 3;
            d.saves_sp = true;
        });
        assert_eq!(callee_gr_mask(&d), (1 << 4) | (1 << 5));
        let d = desc(0x1000, |d| d.entry_gr = 2);
        assert_eq!(callee_gr_mask(&d), (1 << 3) | (1 << 4));
        let d = desc(0x1000, |d| d.entry_fr = 2);
        assert_eq!(callee_fr_mask(&d), (1 << 12) | (1 << 13));
    }

    fn gcc_frame_pointer_prologue(target: &mut MockTarget, at: u64) {
        target.poke_insns(
            at,
            &[
                STW_RP_20,
                COPY_R3_R1,
                0x081e_0243, // copy sp,r3
                0x6fc1_0080, // stw,ma r1,64(sp)
                0x6864_0010, // stw r4,8(r3)
                NOP,
                BL,
                NOP,
            ],
        );
    }

    #[test]
    fn skips_frame_pointer_prologue() {
        let mut target = MockTarget::new();
        gcc_frame_pointer_prologue(&mut target, 0x1000);
        let d = desc(0x1000, |d| {
            d.saves_rp = true;
            d.saves_sp = true;
            d.entry_gr = 2;
            d.total_frame_size = 8;
        });
        assert_eq!(skip_prologue_hard_way(&target, &Pa32, Some(&d), 0x1000, true), 0x1014);
    }

    #[test]
    fn overclaimed_saves_are_masked_on_retry() {
        let mut target = MockTarget::new();
        gcc_frame_pointer_prologue(&mut target, 0x1000);
        // r5 is promised but never stored.
        let d = desc(0x1000, |d| {
            d.saves_rp = true;
            d.saves_sp = true;
            d.entry_gr = 3;
            d.total_frame_size = 8;
        });
        assert_eq!(skip_prologue_hard_way(&target, &Pa32, Some(&d), 0x1000, true), 0x1014);
    }

    #[test]
    fn argument_spills_end_the_prologue() {
        let mut target = MockTarget::new();
        target.poke_insns(
            0x2000,
            &[
                STW_RP_20,
                0x37de_0080, // ldo 64(sp),sp
                0x6bda_3fb9, // stw r26,-36(sp)
                0x6bd9_3fb1, // stw r25,-40(sp)
                NOP,
                NOP,
            ],
        );
        let d = desc(0x2000, |d| {
            d.saves_rp = true;
            d.total_frame_size = 8;
        });
        assert_eq!(skip_prologue_hard_way(&target, &Pa32, Some(&d), 0x2000, true), 0x2010);
    }

    #[test]
    fn wide_abi_treats_r19_as_argument() {
        let mut target = MockTarget::new();
        // std r19,-64(sp) is an argument spill only in the 64-bit ABI.
        let std_r19 = 0x7000_0000 | (30 << 21) | (19 << 16);
        target.poke_insns(0x3000, &[STW_RP_20, std_r19, NOP, NOP]);
        let d = desc(0x3000, |d| d.saves_rp = true);
        assert_eq!(skip_prologue_hard_way(&target, &Pa64, Some(&d), 0x3000, true), 0x3008);
        // In the 32-bit ABI it is an ordinary store: nothing is left to find,
        // so the bogus args_stored flag stops the scan at the store.
        assert_eq!(skip_prologue_hard_way(&target, &Pa32, Some(&d), 0x3000, true), 0x3004);
    }

    #[test]
    fn mid_function_pc_is_returned_unchanged() {
        let target = MockTarget::new();
        let d = desc(0x1000, |_| {});
        assert_eq!(skip_prologue_hard_way(&target, &Pa32, Some(&d), 0x1010, true), 0x1010);
        assert_eq!(skip_prologue_hard_way(&target, &Pa32, None, 0x1000, true), 0x1000);
    }

    #[test]
    fn unreadable_code_stops_scan() {
        let mut target = MockTarget::new();
        target.poke_insns(0x1000, &[STW_RP_20]);
        let d = desc(0x1000, |d| {
            d.saves_rp = true;
            d.total_frame_size = 8;
        });
        assert_eq!(skip_prologue_hard_way(&target, &Pa32, Some(&d), 0x1000, true), 0x1000);
    }

    #[test]
    fn session_prefers_line_information() {
        use crate::target::TargetConfig;
        use crate::testutil::{flags, unwind_record, MockObject};

        let record = unwind_record(0x2000, 0x20fc, flags::SAVES_RP, 8).to_vec();
        let mut target = MockTarget::new();
        target.poke_insns(0x2000, &[STW_RP_20, 0x37de_0080, 0x6bda_3fb9, 0x6bd9_3fb1, NOP, NOP]);

        let with_lines = MockObject::som("a.out")
            .with_section("$UNWIND_START$", 0, record.clone())
            .with_prologue_end(0x2000, 0x2008)
            .with_range(0x1000, 0x3000);
        let mut s = Session::new(TargetConfig::default());
        s.add_object(Box::new(with_lines));
        assert_eq!(s.skip_prologue(&target, 0x2000), 0x2008);
        assert_eq!(s.skip_prologue(&target, 0x200c), 0x200c);

        let stripped = MockObject::som("a.out")
            .with_section("$UNWIND_START$", 0, record)
            .with_range(0x1000, 0x3000);
        let mut s = Session::new(TargetConfig::default());
        s.add_object(Box::new(stripped));
        assert_eq!(s.skip_prologue(&target, 0x2000), 0x2010);
    }
}
