use std::fmt;

/// Virtual address in the traced process.
///
/// PA-RISC code and data live in separate spaces; this is the offset part
/// only, which is all the unwinder ever needs to compare or dereference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtAddr(pub u64);

impl VirtAddr {
    pub fn addr(self) -> u64 {
        self.0
    }

    /// Clear the privilege-level bits PA-RISC keeps in the low two bits
    /// of code addresses.
    pub fn strip_privilege(self) -> VirtAddr {
        VirtAddr(self.0 & !0x3)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl std::ops::Add<u64> for VirtAddr {
    type Output = VirtAddr;
    fn add(self, rhs: u64) -> Self::Output {
        VirtAddr(self.0.wrapping_add(rhs))
    }
}

impl std::ops::Sub<u64> for VirtAddr {
    type Output = VirtAddr;
    fn sub(self, rhs: u64) -> Self::Output {
        VirtAddr(self.0.wrapping_sub(rhs))
    }
}

/// How a frame was recognised, which decides how its caller is recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Ordinary code covered by an unwind descriptor.
    Normal,
    /// Linker stub, PLT entry or `$$dyncall`.
    Stub,
    /// No descriptor; recovered by scanning from the symbol start.
    Fallback,
    /// Kernel rt_sigreturn trampoline.
    SignalTrampoline,
    /// Synthetic frame pushed for an inferior function call.
    CallDummy,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameKind::Normal => "normal",
            FrameKind::Stub => "stub",
            FrameKind::Fallback => "fallback",
            FrameKind::SignalTrampoline => "sigtramp",
            FrameKind::CallDummy => "dummy",
        };
        f.write_str(name)
    }
}

/// Identity of a frame: the stack address at function entry plus the
/// function's entry point. Two frames with equal ids are the same frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId {
    pub stack_addr: VirtAddr,
    pub code_addr: VirtAddr,
}

pub fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

pub fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}
