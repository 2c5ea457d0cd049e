//! Linux signal frames.
//!
//! The kernel builds an `rt_sigframe` on the user stack, with the
//! rt_sigreturn trampoline at its start. Depending on the kernel version
//! the trampoline sits 0, 16 or 20 bytes into the 64-byte-aligned frame;
//! the `sigcontext` follows a `siginfo` (128 bytes) and the `ucontext`
//! header (24 bytes).

use log::trace;

use crate::error::Result;
use crate::frame::{FrameCache, SavedRegister};
use crate::pattern::{match_insns, SIGTRAMP};
use crate::registers::{RegisterSet, FP0, IPSW, PCOQ_HEAD, PCOQ_TAIL, PCSQ_HEAD, PCSQ_TAIL, SAR, SP};
use crate::target::{Session, TargetAccess};
use crate::types::{align_down, FrameId, VirtAddr};

/// Trampoline offsets within the frame, and the matching `rt_sigframe`
/// offsets.
const TRAMPOLINE_OFFSETS: [(u64, u64); 3] = [(0, 16), (16, 40), (20, 40)];

const SIGINFO_SIZE: u64 = 128;
const UCONTEXT_MCONTEXT: u64 = 24;

impl Session {
    /// Address of the `sigcontext` saved for the signal handler whose
    /// trampoline contains `pc`, if `pc` is in one.
    ///
    /// An alternate signal stack defeats the alignment guess; then the
    /// trampoline must start exactly at `pc` and the newest layout is
    /// assumed.
    pub fn find_sigcontext(&self, target: &dyn TargetAccess, pc: u64) -> Option<u64> {
        let aligned = align_down(pc, 64);
        let found = TRAMPOLINE_OFFSETS
            .iter()
            .find(|(pc_off, _)| match_insns(target, aligned + pc_off, &SIGTRAMP).is_some())
            .map(|&(_, frame_off)| (aligned, frame_off));

        let (sp, frame_off) = match found {
            Some(hit) => hit,
            None => {
                match_insns(target, pc, &SIGTRAMP)?;
                let (pc_off, frame_off) = TRAMPOLINE_OFFSETS[2];
                (pc.wrapping_sub(pc_off), frame_off)
            }
        };
        Some(sp + frame_off + SIGINFO_SIZE + UCONTEXT_MCONTEXT)
    }

    /// Saved registers of a frame interrupted by a signal, read from the
    /// `sigcontext` the kernel stored.
    ///
    /// Layout: flags, `gr[32]` (gr0 holds the PSW), padding, `fr[32]` as
    /// doubles, `iasq[2]`, `iaoq[2]`, `sar`. fr0..fr3 are not restored.
    pub fn sigtramp_frame_cache(&self, target: &dyn TargetAccess, regs: &RegisterSet) -> Result<FrameCache> {
        let pc = VirtAddr(regs.require(PCOQ_HEAD)?).strip_privilege().addr();
        let base = regs.require(SP)?;
        let mut cache = FrameCache {
            base,
            id: FrameId { stack_addr: VirtAddr(base), code_addr: VirtAddr(pc) },
            saved: Default::default(),
            cannot_unwind: false,
        };
        let Some(sc) = self.find_sigcontext(target, pc) else {
            return Ok(cache);
        };
        trace!("sigcontext for trampoline at 0x{:x} is at 0x{:x}", pc, sc);

        let mut addr = sc + 4;
        cache.saved.set(IPSW, SavedRegister::Addr(addr));
        addr += 4;
        for gr in 1..32 {
            cache.saved.set(gr, SavedRegister::Addr(addr));
            addr += 4;
        }
        // pad to a doubleword, then skip fr0..fr3
        addr += 4 + 8 * 4;
        for fr in 4..32 {
            cache.saved.set(FP0 + 2 * fr, SavedRegister::Addr(addr));
            cache.saved.set(FP0 + 2 * fr + 1, SavedRegister::Addr(addr + 4));
            addr += 8;
        }
        for regnum in [PCSQ_HEAD, PCSQ_TAIL, PCOQ_HEAD, PCOQ_TAIL, SAR] {
            cache.saved.set(regnum, SavedRegister::Addr(addr));
            addr += 4;
        }
        Ok(cache)
    }
}
