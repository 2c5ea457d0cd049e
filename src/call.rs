//! Inferior function calls.
//!
//! A call is set up so that the callee returns to a breakpoint at the
//! interrupted PC minus 4. That address is distinct from every real
//! return address, so the dummy frame never shares an id with the frame
//! it interrupted.
//!
//! Calls into shared libraries must switch space registers on the way
//! in and out, so they go through a helper in the program:
//! `__gcc_plt_call` (given an import stub in r22) or the HP compilers'
//! `__d_plt_call` (given a procedure label). Calls within the program
//! go through `$$dyncall`.

use log::{debug, warn};

use crate::abi::{Argument, ArgumentLayout, TypeCode};
use crate::bitfield::deposit_address;
use crate::error::{Error, Result};
use crate::registers::{RegisterSet, PCOQ_HEAD, PCOQ_TAIL, R22, RP, SP};
use crate::stub::DYNCALL;
use crate::symbols::SymbolType;
use crate::target::{Abi, ActiveDummy, Session, TargetAccess};
use crate::types::{align_up, FrameId, VirtAddr};
use crate::unwind_table::StubType;

pub const GCC_PLT_CALL: &str = "__gcc_plt_call";
pub const D_PLT_CALL: &str = "__d_plt_call";

/// `ldil L'target,r22; ldo R'target(r22),r22` followed by an
/// interspace branch through r22.
const SPACE_SWITCH_STUB: [u32; 6] = [
    0x22c0_0000, // ldil 0,r22
    0x36d6_0000, // ldo 0(r22),r22
    0x02c0_10a1, // ldsid (r22),r1
    0x0001_1820, // mtsp r1,sr0
    0xe2c0_0002, // be,n 0(sr0,r22)
    0x0800_0240, // nop
];

/// How control reaches the called function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrampolineChoice {
    /// `__gcc_plt_call` with an import stub (found or synthesized) in r22.
    GccPltCall,
    /// `__d_plt_call` with a procedure label in r22.
    HpPltCall,
    /// `$$dyncall` with the function address in r22.
    DirectDyncall,
}

/// Everything needed to start an inferior call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallDummyPlan {
    /// SP for the call; also the stack half of the dummy frame's id.
    pub stack_pointer: u64,
    /// Code address of the callee, after procedure-label unpacking.
    pub target_function_address: u64,
    pub trampoline: TrampolineChoice,
    pub argument_layout: ArgumentLayout,
    pub return_breakpoint_address: u64,
    /// Where execution starts: the trampoline helper.
    pub real_pc: u64,
    pub global_pointer: Option<u64>,
    /// Trampoline code or procedure label placed below the arguments.
    pub stack_writes: Vec<(u64, Vec<u8>)>,
    /// Final register values, in the order they are written.
    pub register_writes: Vec<(usize, u64)>,
}

impl CallDummyPlan {
    /// Id of the dummy frame, as seen when the callee returns to the
    /// breakpoint.
    pub fn dummy_id(&self) -> FrameId {
        FrameId {
            stack_addr: VirtAddr(self.stack_pointer),
            code_addr: VirtAddr(self.return_breakpoint_address),
        }
    }

    pub fn memory_writes(&self) -> impl Iterator<Item = &(u64, Vec<u8>)> {
        self.stack_writes.iter().chain(&self.argument_layout.memory_writes)
    }

    /// Value the plan leaves in `regnum`, if it writes one.
    pub fn register(&self, regnum: usize) -> Option<u64> {
        self.register_writes
            .iter()
            .rev()
            .find(|(r, _)| *r == regnum)
            .map(|&(_, v)| v)
    }
}

fn words_to_bytes(words: &[u64], size: usize) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()[8 - size..].to_vec()).collect()
}

impl Session {
    /// An import stub for the function at `fun`: a trampoline symbol of
    /// the same name, elsewhere, whose descriptor says Import (preferred)
    /// or ImportShlib.
    pub fn find_import_stub(&self, fun: u64) -> Option<u64> {
        let name = self.lookup_symbol_by_pc(fun)?.symbol.name;
        let mut shlib_stub = None;
        for hit in self.symbols_named(&name, SymbolType::SolibTrampoline) {
            let addr = hit.symbol.address();
            if addr == fun {
                continue;
            }
            match self.lookup_unwind(addr).map(|h| h.descriptor.stub_type) {
                Some(StubType::Import) => return Some(addr),
                Some(StubType::ImportShlib) => {
                    shlib_stub.get_or_insert(addr);
                }
                _ => {}
            }
        }
        shlib_stub
    }

    fn in_shared_library(&self, addr: u64) -> bool {
        self.object_for_pc(addr)
            .and_then(|i| self.object(i))
            .is_some_and(|o| o.is_shared_library())
    }

    /// Plan a call of `function` from the frame with registers `regs`,
    /// without touching the target.
    ///
    /// In the 32-bit runtime a `function` with bit 1 set is a procedure
    /// label: the code address and global pointer are read through it.
    pub fn prepare_call(
        &self,
        target: &dyn TargetAccess,
        regs: &RegisterSet,
        function: u64,
        args: &[Argument],
        struct_return: Option<u64>,
    ) -> Result<CallDummyPlan> {
        let convention = self.convention();
        let word = convention.word_size();
        let align = convention.frame_align();

        let pc = VirtAddr(regs.require(PCOQ_HEAD)?).strip_privilege().addr();
        let return_bp = pc.wrapping_sub(4);
        let mut sp = align_up(regs.require(SP)?, align);

        let mut fun = function;
        let mut gp = None;
        if self.config().abi == Abi::Pa32 && fun & 0x2 != 0 {
            let label = fun & !0x3;
            gp = Some(target.read_word(label + 4, 4)?);
            fun = target.read_word(label, 4)?;
            debug!("procedure label 0x{:x} -> 0x{:x} (gp 0x{:x})", label, fun, gp.unwrap_or(0));
        }
        let gp = gp.or_else(|| self.global_pointer_for(fun));

        let mut stack_writes = Vec::new();
        let mut registers = Vec::new();

        let (trampoline, real_pc) = if !self.in_shared_library(fun) {
            let dyncall = self
                .helper_address(DYNCALL)
                .ok_or(Error::MissingTrampoline(DYNCALL))?;
            registers.push((R22, fun));
            (TrampolineChoice::DirectDyncall, dyncall)
        } else if let Some(helper) = self.helper_address(GCC_PLT_CALL) {
            match self.find_import_stub(fun) {
                Some(stub) => registers.push((R22, stub)),
                None => {
                    warn!("no import stub for 0x{:x}, writing one to the stack", fun);
                    // ldil/ldo reach only the low 4 GiB.
                    let addr32 = u32::try_from(fun).map_err(|_| Error::StubOutOfRange(fun))?;
                    let mut code = SPACE_SWITCH_STUB;
                    let (ldil, ldo) = deposit_address(addr32, code[0], code[1]);
                    code[0] = ldil;
                    code[1] = ldo;
                    let bytes: Vec<u8> = code.iter().flat_map(|w| w.to_be_bytes()).collect();
                    let len = bytes.len() as u64;
                    stack_writes.push((sp, bytes));
                    registers.push((R22, sp));
                    sp += align_up(len, align);
                }
            }
            (TrampolineChoice::GccPltCall, helper)
        } else if let Some(helper) = self.helper_address(D_PLT_CALL) {
            let label = words_to_bytes(&[fun, gp.unwrap_or(0)], word);
            let len = label.len() as u64;
            stack_writes.push((sp, label));
            registers.push((R22, sp | 0x2));
            sp += align_up(len, align);
            (TrampolineChoice::HpPltCall, helper)
        } else {
            return Err(Error::MissingTrampoline("__gcc_plt_call or __d_plt_call"));
        };

        let layout = convention.layout_arguments(sp, args, struct_return);

        let mut register_writes = layout.register_writes.clone();
        register_writes.extend(registers);
        if let Some(gp) = gp {
            register_writes.push((convention.gp_regnum(), gp));
        }
        register_writes.extend([
            (RP, return_bp),
            (SP, layout.sp),
            (PCOQ_HEAD, real_pc),
            (PCOQ_TAIL, real_pc + 4),
        ]);

        Ok(CallDummyPlan {
            stack_pointer: layout.sp,
            target_function_address: fun,
            trampoline,
            argument_layout: layout,
            return_breakpoint_address: return_bp,
            real_pc,
            global_pointer: gp,
            stack_writes,
            register_writes,
        })
    }

    /// Set up a call of `function` in the stopped thread and remember
    /// the interrupted registers, so the dummy frame can be unwound and
    /// later popped.
    pub fn push_dummy_call(
        &self,
        target: &mut dyn TargetAccess,
        function: u64,
        args: &[Argument],
        struct_return: Option<u64>,
    ) -> Result<CallDummyPlan> {
        let saved = RegisterSet::read(&*target, &self.frame_registers());
        let plan = self.prepare_call(&*target, &saved, function, args, struct_return)?;

        for (addr, data) in plan.memory_writes() {
            target.write_memory(*addr, data)?;
        }
        for &(regnum, value) in &plan.register_writes {
            target.write_register(regnum, value)?;
        }
        debug!(
            "calling 0x{:x} via {:?} at 0x{:x}, sp 0x{:x}, return to 0x{:x}",
            plan.target_function_address, plan.trampoline, plan.real_pc, plan.stack_pointer,
            plan.return_breakpoint_address
        );
        self.dummies.borrow_mut().push(ActiveDummy { id: plan.dummy_id(), saved });
        Ok(plan)
    }

    /// Return value of a finished call, read from the registers, or
    /// `None` when it was returned in memory.
    pub fn call_return_value(&self, target: &dyn TargetAccess, code: TypeCode, length: usize) -> Result<Option<Vec<u8>>> {
        let regs = RegisterSet::read(target, &self.frame_registers());
        self.convention().extract_return_value(&regs, code, length)
    }

    /// Discard the innermost dummy frame, restoring the registers it
    /// interrupted.
    pub fn pop_dummy(&self, target: &mut dyn TargetAccess) -> Result<Option<RegisterSet>> {
        let Some(dummy) = self.dummies.borrow_mut().pop() else {
            return Ok(None);
        };
        for (regnum, value) in dummy.saved.iter() {
            target.write_register(regnum, value)?;
        }
        Ok(Some(dummy.saved))
    }

    pub fn active_calls(&self) -> usize {
        self.dummies.borrow().len()
    }
}
