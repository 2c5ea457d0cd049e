//! PA-RISC register numbering and register snapshots.
//!
//! Uses a table-driven design: one table names the general and control
//! registers, floating-point numbering depends on the ABI (the 32-bit
//! register file exposes each FP register as two 32-bit halves, the
//! 64-bit one as a single 64-bit register).

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::target::TargetAccess;
use crate::types::VirtAddr;

/// The r0 slot holds the HP-UX "flags" pseudo-register.
pub const FLAGS: usize = 0;
pub const R1: usize = 1;
/// Return pointer.
pub const RP: usize = 2;
/// Frame pointer (r3) when a function keeps one.
pub const FP: usize = 3;
pub const R19: usize = 19;
pub const R21: usize = 21;
pub const R22: usize = 22;
pub const ARG3: usize = 23;
pub const ARG0: usize = 26;
/// Global data pointer.
pub const DP: usize = 27;
pub const RET0: usize = 28;
pub const RET1: usize = 29;
pub const SP: usize = 30;
/// Millicode return register.
pub const R31: usize = 31;
pub const SAR: usize = 32;
pub const PCOQ_HEAD: usize = 33;
pub const PCSQ_HEAD: usize = 34;
pub const PCOQ_TAIL: usize = 35;
pub const PCSQ_TAIL: usize = 36;
pub const EIEM: usize = 37;
pub const IIR: usize = 38;
pub const ISR: usize = 39;
pub const IOR: usize = 40;
pub const IPSW: usize = 41;
pub const SR4: usize = 43;
/// First floating-point register (fr0, the status register).
pub const FP0: usize = 64;

/// Register type classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterType {
    GeneralPurpose,
    InstructionQueue,
    Space,
    Control,
    FloatingPoint,
}

/// Metadata for a single register.
#[derive(Debug, Clone, Copy)]
pub struct RegisterInfo {
    pub name: &'static str,
    pub regnum: usize,
    pub reg_type: RegisterType,
}

macro_rules! gr {
    ($name:expr, $num:expr) => {
        RegisterInfo { name: $name, regnum: $num, reg_type: RegisterType::GeneralPurpose }
    };
}

/// General and control registers shared by both ABIs.
pub const REGISTERS: &[RegisterInfo] = &[
    gr!("flags", 0),  gr!("r1", 1),    gr!("rp", 2),    gr!("r3", 3),
    gr!("r4", 4),     gr!("r5", 5),    gr!("r6", 6),    gr!("r7", 7),
    gr!("r8", 8),     gr!("r9", 9),    gr!("r10", 10),  gr!("r11", 11),
    gr!("r12", 12),   gr!("r13", 13),  gr!("r14", 14),  gr!("r15", 15),
    gr!("r16", 16),   gr!("r17", 17),  gr!("r18", 18),  gr!("r19", 19),
    gr!("r20", 20),   gr!("r21", 21),  gr!("r22", 22),  gr!("r23", 23),
    gr!("r24", 24),   gr!("r25", 25),  gr!("r26", 26),  gr!("dp", 27),
    gr!("ret0", 28),  gr!("ret1", 29), gr!("sp", 30),   gr!("r31", 31),
    RegisterInfo { name: "sar",    regnum: SAR,       reg_type: RegisterType::Control },
    RegisterInfo { name: "pcoqh",  regnum: PCOQ_HEAD, reg_type: RegisterType::InstructionQueue },
    RegisterInfo { name: "pcsqh",  regnum: PCSQ_HEAD, reg_type: RegisterType::InstructionQueue },
    RegisterInfo { name: "pcoqt",  regnum: PCOQ_TAIL, reg_type: RegisterType::InstructionQueue },
    RegisterInfo { name: "pcsqt",  regnum: PCSQ_TAIL, reg_type: RegisterType::InstructionQueue },
    RegisterInfo { name: "eiem",   regnum: EIEM,      reg_type: RegisterType::Control },
    RegisterInfo { name: "iir",    regnum: IIR,       reg_type: RegisterType::Control },
    RegisterInfo { name: "isr",    regnum: ISR,       reg_type: RegisterType::Control },
    RegisterInfo { name: "ior",    regnum: IOR,       reg_type: RegisterType::Control },
    RegisterInfo { name: "ipsw",   regnum: IPSW,      reg_type: RegisterType::Control },
    RegisterInfo { name: "sr4",    regnum: SR4,       reg_type: RegisterType::Space },
    RegisterInfo { name: "sr0",    regnum: 44,        reg_type: RegisterType::Space },
    RegisterInfo { name: "sr1",    regnum: 45,        reg_type: RegisterType::Space },
    RegisterInfo { name: "sr2",    regnum: 46,        reg_type: RegisterType::Space },
    RegisterInfo { name: "sr3",    regnum: 47,        reg_type: RegisterType::Space },
    RegisterInfo { name: "sr5",    regnum: 48,        reg_type: RegisterType::Space },
    RegisterInfo { name: "sr6",    regnum: 49,        reg_type: RegisterType::Space },
    RegisterInfo { name: "sr7",    regnum: 50,        reg_type: RegisterType::Space },
];

/// Look up a register's metadata by number.
pub fn info(regnum: usize) -> Option<&'static RegisterInfo> {
    REGISTERS.iter().find(|r| r.regnum == regnum)
}

/// Look up a register number by name (`"rp"`, `"r30"`, `"sp"`, ...).
pub fn by_name(name: &str) -> Option<usize> {
    if let Some(info) = REGISTERS.iter().find(|r| r.name == name) {
        return Some(info.regnum);
    }
    let num = name.strip_prefix('r')?.parse::<usize>().ok()?;
    (num < 32).then_some(num)
}

/// Values of a frame's registers, keyed by register number.
///
/// Registers missing from the set are unknown in this frame (not read,
/// or not recoverable after unwinding).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterSet {
    values: BTreeMap<usize, u64>,
}

impl RegisterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the given registers from a stopped thread.
    ///
    /// Registers the target refuses to read are left out.
    pub fn read<T: TargetAccess + ?Sized>(target: &T, regnums: &[usize]) -> Self {
        let mut set = RegisterSet::new();
        for &regnum in regnums {
            if let Ok(value) = target.read_register(regnum) {
                set.values.insert(regnum, value);
            }
        }
        set
    }

    pub fn get(&self, regnum: usize) -> Option<u64> {
        self.values.get(&regnum).copied()
    }

    /// Like [`get`](Self::get), but a missing register is an error.
    pub fn require(&self, regnum: usize) -> Result<u64> {
        self.get(regnum).ok_or_else(|| {
            let name = info(regnum).map(|i| i.name.to_string());
            Error::Register(format!(
                "{} not available in this frame",
                name.unwrap_or_else(|| format!("register {}", regnum))
            ))
        })
    }

    pub fn set(&mut self, regnum: usize, value: u64) {
        self.values.insert(regnum, value);
    }

    pub fn remove(&mut self, regnum: usize) {
        self.values.remove(&regnum);
    }

    /// Program counter (front of the instruction offset queue), with the
    /// privilege bits cleared.
    pub fn pc(&self) -> Option<u64> {
        self.get(PCOQ_HEAD).map(|pc| VirtAddr(pc).strip_privilege().addr())
    }

    pub fn sp(&self) -> Option<u64> {
        self.get(SP)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.values.iter().map(|(&r, &v)| (r, v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(usize, u64)> for RegisterSet {
    fn from_iter<I: IntoIterator<Item = (usize, u64)>>(iter: I) -> Self {
        RegisterSet { values: iter.into_iter().collect() }
    }
}
