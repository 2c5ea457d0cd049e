//! PA-RISC calling conventions.
//!
//! The 32-bit (SOM and ELF32) and 64-bit (ELF64) runtimes disagree on
//! almost everything that matters to a debugger: pointer width, how the
//! floating-point registers are numbered, which registers carry
//! arguments, and how a call's argument area is laid out. Each runtime is
//! a [`CallingConvention`]; the session picks one from the target
//! configuration and everything else asks it.

use std::ops::RangeInclusive;

use crate::error::Result;
use crate::registers::{RegisterSet, FP0, RET0, RET1};
use crate::target::Abi;
use crate::types::align_up;

/// Broad classification of a value's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCode {
    /// Integers and enumerations.
    Int { signed: bool },
    Pointer,
    Float,
    /// Structures, unions and arrays.
    Aggregate,
}

impl TypeCode {
    fn is_integral(self) -> bool {
        matches!(self, TypeCode::Int { .. } | TypeCode::Pointer)
    }
}

/// An argument for an inferior call: its type and target-order bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    pub code: TypeCode,
    pub bytes: Vec<u8>,
}

impl Argument {
    pub fn new(code: TypeCode, bytes: Vec<u8>) -> Self {
        Argument { code, bytes }
    }

    /// An integer of `size` bytes.
    pub fn int(value: i64, size: usize, signed: bool) -> Self {
        let be = value.to_be_bytes();
        Argument::new(TypeCode::Int { signed }, be[8 - size..].to_vec())
    }

    pub fn pointer(addr: u64, size: usize) -> Self {
        Argument::new(TypeCode::Pointer, addr.to_be_bytes()[8 - size..].to_vec())
    }

    pub fn float(value: f32) -> Self {
        Argument::new(TypeCode::Float, value.to_be_bytes().to_vec())
    }

    pub fn double(value: f64) -> Self {
        Argument::new(TypeCode::Float, value.to_be_bytes().to_vec())
    }

    pub fn aggregate(bytes: &[u8]) -> Self {
        Argument::new(TypeCode::Aggregate, bytes.to_vec())
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The integer value, sign- or zero-extended to 64 bits.
    fn extended(&self) -> u64 {
        let raw = self.bytes.iter().take(8).fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
        let bits = 8 * self.bytes.len().min(8) as u32;
        match self.code {
            TypeCode::Int { signed: true } if bits > 0 && bits < 64 => {
                let shift = 64 - bits;
                (((raw << shift) as i64) >> shift) as u64
            }
            _ => raw,
        }
    }
}

/// Where one argument landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgumentSlot {
    /// Offset of the stack slot from the final stack pointer.
    pub offset: i64,
    pub length: usize,
    /// General register that also carries (the start of) the argument.
    pub register: Option<usize>,
}

/// The complete effect of laying out a call's arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgumentLayout {
    /// Stack pointer for the call.
    pub sp: u64,
    pub slots: Vec<ArgumentSlot>,
    pub memory_writes: Vec<(u64, Vec<u8>)>,
    pub register_writes: Vec<(usize, u64)>,
}

impl ArgumentLayout {
    fn write_memory(&mut self, addr: u64, data: &[u8]) {
        self.memory_writes.push((addr, data.to_vec()));
    }

    fn write_register(&mut self, regnum: usize, value: u64) {
        self.register_writes.push((regnum, value));
    }

    /// Final value written to `regnum`, if any.
    pub fn register(&self, regnum: usize) -> Option<u64> {
        self.register_writes
            .iter()
            .rev()
            .find(|(r, _)| *r == regnum)
            .map(|&(_, v)| v)
    }
}

/// Where a function's return value is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnLocation {
    /// Packed into consecutive register images starting at `regnum`,
    /// beginning `offset` bytes into the first image.
    Registers { regnum: usize, offset: usize },
    /// In memory at the address the caller passed in r28.
    Memory,
}

fn be_word(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

pub trait CallingConvention {
    fn name(&self) -> &'static str;

    /// Bytes in a general register and a pointer.
    fn word_size(&self) -> usize;

    /// Register number of floating-point register `n` (its left half in
    /// the 32-bit numbering).
    fn fp_regnum(&self, n: u32) -> usize;

    /// General registers that carry arguments.
    fn arg_gr_range(&self) -> RangeInclusive<u32>;

    /// Floating-point registers that carry arguments.
    fn arg_fr_range(&self) -> RangeInclusive<u32>;

    /// Alignment of a newly pushed frame.
    fn frame_align(&self) -> u64;

    /// Register holding the callee's global data pointer.
    fn gp_regnum(&self) -> usize;

    /// Lay out `args` for a call made with the stack pointer at `sp`.
    fn layout_arguments(&self, sp: u64, args: &[Argument], struct_return: Option<u64>) -> ArgumentLayout;

    fn return_value_location(&self, code: TypeCode, length: usize) -> ReturnLocation;

    /// Read a returned value out of the registers after a call.
    fn extract_return_value(&self, regs: &RegisterSet, code: TypeCode, length: usize) -> Result<Option<Vec<u8>>> {
        let ReturnLocation::Registers { regnum, offset } = self.return_value_location(code, length) else {
            return Ok(None);
        };
        let word = self.word_size();
        let mut image = Vec::with_capacity(offset + length + word);
        let mut reg = regnum;
        while image.len() < offset + length {
            let value = regs.require(reg)?;
            image.extend_from_slice(&value.to_be_bytes()[8 - word..]);
            reg += 1;
        }
        Ok(Some(image[offset..offset + length].to_vec()))
    }
}

pub fn convention_for(abi: Abi) -> Box<dyn CallingConvention> {
    match abi {
        Abi::Pa32 => Box::new(Pa32),
        Abi::Pa64 => Box::new(Pa64),
    }
}

/// The 32-bit runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pa32;

/// fr4, left half, in the 32-bit numbering.
const PA32_FR4: usize = FP0 + 8;
/// fr5 as a double.
const PA32_FR5: usize = FP0 + 10;

impl Pa32 {
    /// Value and length of one argument's stack slot.
    fn param_value(arg: &Argument) -> ([u8; 8], usize, bool) {
        let mut val = [0u8; 8];
        let len = arg.len();
        let param_len = align_up(len as u64, 4) as usize;
        let mut small_struct = false;
        match arg.code {
            TypeCode::Int { .. } => {
                let widened = arg.extended().to_be_bytes();
                val[..param_len].copy_from_slice(&widened[8 - param_len..]);
            }
            TypeCode::Float => val[..len].copy_from_slice(&arg.bytes),
            TypeCode::Pointer | TypeCode::Aggregate => {
                // Right-aligned in the slot.
                val[param_len - len..param_len].copy_from_slice(&arg.bytes);
                // 5..7 byte structs use a register pair without the
                // 8-byte alignment of true doublewords.
                small_struct = (5..8).contains(&len);
            }
        }
        (val, param_len, small_struct)
    }
}

impl CallingConvention for Pa32 {
    fn name(&self) -> &'static str {
        "pa32"
    }

    fn word_size(&self) -> usize {
        4
    }

    fn fp_regnum(&self, n: u32) -> usize {
        FP0 + 2 * n as usize
    }

    fn arg_gr_range(&self) -> RangeInclusive<u32> {
        23..=26
    }

    fn arg_fr_range(&self) -> RangeInclusive<u32> {
        4..=7
    }

    fn frame_align(&self) -> u64 {
        64
    }

    fn gp_regnum(&self) -> usize {
        19
    }

    fn layout_arguments(&self, sp: u64, args: &[Argument], struct_return: Option<u64>) -> ArgumentLayout {
        // The first pass sizes the struct and parameter areas, the second
        // writes into them.
        let mut struct_end = 0u64;
        let mut param_end = 0u64;
        let mut layout = ArgumentLayout::default();

        for write_pass in [false, true] {
            let mut struct_ptr = 0u64;
            // The first slot ends up at sp-36.
            let mut param_ptr = 32u64;

            for arg in args {
                let (param_val, param_len, small_struct) = if arg.len() > 8 {
                    // Passed by reference through the struct area.
                    struct_ptr += align_up(arg.len() as u64, 8);
                    let copy = struct_end.wrapping_sub(struct_ptr);
                    if write_pass {
                        layout.write_memory(copy, &arg.bytes);
                    }
                    let mut val = [0u8; 8];
                    val[..4].copy_from_slice(&(copy as u32).to_be_bytes());
                    (val, 4, false)
                } else {
                    Self::param_value(arg)
                };

                param_ptr += param_len as u64;
                if param_len == 8 && !small_struct {
                    param_ptr = align_up(param_ptr, 8);
                }

                if !write_pass {
                    continue;
                }

                let slot_addr = param_end.wrapping_sub(param_ptr);
                layout.write_memory(slot_addr, &param_val[..param_len]);

                // Callees without a prototype may expect either register
                // class, so both get a copy.
                let mut register = None;
                if param_ptr <= 48 {
                    let index = (param_ptr - 36) as usize / 4;
                    let grreg = 26 - index;
                    let fp_lreg = PA32_FR4 + index * 2;
                    let hi = be_word(&param_val[..4]);
                    layout.write_register(grreg, hi);
                    layout.write_register(fp_lreg, hi);
                    if param_len > 4 {
                        let lo = be_word(&param_val[4..8]);
                        let fpreg = PA32_FR5 + (param_ptr as usize).saturating_sub(40) / 8 * 4;
                        layout.write_register(grreg + 1, lo);
                        layout.write_register(fpreg, hi);
                        layout.write_register(fpreg + 1, lo);
                    }
                    register = Some(grreg);
                }
                layout.slots.push(ArgumentSlot {
                    offset: -(param_ptr as i64),
                    length: param_len,
                    register,
                });
            }

            if !write_pass {
                struct_end = sp + align_up(struct_ptr, 64);
                param_end = struct_end + align_up(param_ptr, 64);
            }
        }

        if let Some(addr) = struct_return {
            layout.write_register(RET0, addr);
        }
        layout.sp = param_end;
        layout
    }

    fn return_value_location(&self, code: TypeCode, length: usize) -> ReturnLocation {
        if length > 8 {
            return ReturnLocation::Memory;
        }
        let regnum = if code == TypeCode::Float { PA32_FR4 } else { RET0 };
        // Right-justified: a partial word sits at the end of the first
        // register.
        let offset = (4 - length % 4) % 4;
        ReturnLocation::Registers { regnum, offset }
    }
}

/// The 64-bit runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pa64;

const PA64_ARG_REGS: usize = 8;

impl Pa64 {
    fn fr4(&self) -> usize {
        self.fp_regnum(4)
    }

    /// Register image holding `data` at byte `at` of an 8-byte register.
    fn register_image(at: usize, data: &[u8]) -> u64 {
        let mut image = [0u8; 8];
        image[at..at + data.len()].copy_from_slice(data);
        u64::from_be_bytes(image)
    }
}

impl CallingConvention for Pa64 {
    fn name(&self) -> &'static str {
        "pa64"
    }

    fn word_size(&self) -> usize {
        8
    }

    fn fp_regnum(&self, n: u32) -> usize {
        FP0 + n as usize
    }

    fn arg_gr_range(&self) -> RangeInclusive<u32> {
        19..=26
    }

    fn arg_fr_range(&self) -> RangeInclusive<u32> {
        4..=11
    }

    fn frame_align(&self) -> u64 {
        16
    }

    fn gp_regnum(&self) -> usize {
        27
    }

    fn layout_arguments(&self, sp: u64, args: &[Argument], struct_return: Option<u64>) -> ArgumentLayout {
        let mut layout = ArgumentLayout::default();
        let mut sp = align_up(sp, 16);

        // Aggregates over 16 bytes go by reference; copy them out first.
        let mut passed: Vec<Argument> = Vec::with_capacity(args.len());
        for arg in args {
            if arg.code == TypeCode::Aggregate && arg.len() > 16 {
                layout.write_memory(sp, &arg.bytes);
                passed.push(Argument::pointer(sp, 8));
                sp += align_up(arg.len() as u64, 16);
            } else {
                passed.push(arg.clone());
            }
        }

        let mut offset = 0u64;
        for arg in &passed {
            offset = align_up(offset, 8);

            let mut value = arg.bytes.clone();
            match arg.code {
                code if code.is_integral() => {
                    if value.len() < 8 {
                        value = arg.extended().to_be_bytes().to_vec();
                    }
                }
                TypeCode::Float if value.len() > 8 => offset = align_up(offset, 16),
                TypeCode::Float => {
                    // Singles sit in the right half of their slot.
                    if value.len() == 4 {
                        offset += 4;
                    }
                    let fr = 4 + offset / 8;
                    if fr < 4 + PA64_ARG_REGS as u64 {
                        let at = (offset % 8) as usize;
                        layout.write_register(self.fp_regnum(fr as u32), Self::register_image(at, &value));
                    }
                }
                _ => {
                    if value.len() > 8 {
                        offset = align_up(offset, 16);
                    }
                }
            }

            let start = offset;
            layout.write_memory(sp + offset, &value);

            let first_reg = 26i64 - (offset / 8) as i64;
            let mut regnum = first_reg;
            let mut rest: &[u8] = &value;
            while regnum > 26 - PA64_ARG_REGS as i64 && !rest.is_empty() {
                let at = (offset % 8) as usize;
                let n = rest.len().min(8 - at);
                layout.write_register(regnum as usize, Self::register_image(at, &rest[..n]));
                offset += n as u64;
                rest = &rest[n..];
                regnum -= 1;
            }
            offset += rest.len() as u64;

            layout.slots.push(ArgumentSlot {
                offset: start as i64,
                length: value.len(),
                register: (first_reg > 26 - PA64_ARG_REGS as i64).then_some(first_reg as usize),
            });
        }

        // Argument pointer.
        layout.write_register(RET1, sp + 64);

        // Parameter area (at least 64 bytes), scratch, frame marker.
        let base = sp;
        sp += align_up(offset, 16).max(64);
        sp += 32;
        sp += 16;
        for slot in &mut layout.slots {
            slot.offset -= (sp - base) as i64;
        }

        if let Some(addr) = struct_return {
            layout.write_register(RET0, addr);
        }
        layout.sp = sp;
        layout
    }

    fn return_value_location(&self, code: TypeCode, length: usize) -> ReturnLocation {
        if length > 16 {
            return ReturnLocation::Memory;
        }
        match code {
            c if c.is_integral() && length <= 8 => ReturnLocation::Registers { regnum: RET0, offset: 8 - length },
            TypeCode::Float if length > 8 => ReturnLocation::Registers { regnum: RET0, offset: 0 },
            TypeCode::Float => ReturnLocation::Registers { regnum: self.fr4(), offset: 8 - length },
            // Aggregates are left-justified.
            _ => ReturnLocation::Registers { regnum: RET0, offset: 0 },
        }
    }
}
