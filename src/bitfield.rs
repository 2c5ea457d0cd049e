//! Immediate-field extraction for PA-RISC instruction words.
//!
//! PA-RISC numbers instruction bits from the most significant end
//! (bit 0 is the MSB) and scatters the bits of long immediates across the
//! word. The extractors below undo that permutation and apply the sign
//! rules of each format; the `deposit_*` functions are their inverses and
//! are used to patch immediates into synthesized code.

const MASK_5: u32 = 0x1f;
const MASK_11: u32 = 0x7ff;
const MASK_14: u32 = 0x3fff;
const MASK_21: u32 = 0x1f_ffff;

/// The immediate encodings understood by [`extract_immediate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImmediateField {
    /// 5-bit low-sign immediate of short loads (`ldw,s`/`fstws`).
    Im5,
    /// 14-bit low-sign displacement of `ldo`/`ldw`/`stw`.
    Im14,
    /// 17-bit branch displacement, returned in bytes.
    Im17,
    /// 21-bit `ldil`/`addil` immediate, returned shifted into place.
    Im21,
}

impl ImmediateField {
    pub fn width(self) -> u32 {
        match self {
            ImmediateField::Im5 => 5,
            ImmediateField::Im14 => 14,
            ImmediateField::Im17 => 17,
            ImmediateField::Im21 => 21,
        }
    }
}

/// Extract bits `from..=to` of `word`, MSB-first numbering.
pub fn get_field(word: u32, from: u32, to: u32) -> u32 {
    debug_assert!(from <= to && to < 32);
    let width = to - from + 1;
    let mask = if width == 32 { u32::MAX } else { (1u32 << width) - 1 };
    (word >> (31 - to)) & mask
}

/// Sign-extend the low `bits` bits of `value`; bit `bits - 1` is the sign.
pub fn sign_extend(value: u32, bits: u32) -> i32 {
    debug_assert!(bits > 0 && bits <= 32);
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

/// Sign-extend a field whose sign bit is stored in bit 0 (the LSB),
/// with the magnitude in the remaining `bits - 1` bits above it.
pub fn low_sign_extend(value: u32, bits: u32) -> i32 {
    debug_assert!(bits > 1 && bits <= 32);
    let magnitude = (value >> 1) & ((1u32 << (bits - 1)) - 1);
    if value & 1 != 0 {
        (magnitude as i32) | (-1i32 << (bits - 1))
    } else {
        magnitude as i32
    }
}

/// Immediate of a short-displacement load (`ldw,s`, `fstws`).
pub fn extract_5_load(word: u32) -> i32 {
    low_sign_extend((word >> 16) & MASK_5, 5)
}

/// Register field in the low five bits (`t` of `fstd`/`fstw`).
pub fn extract_5r_store(word: u32) -> u32 {
    word & MASK_5
}

/// Register field at bits 11..15 (`r` of `stw`/`std`).
#[allow(non_snake_case)]
pub fn extract_5R_store(word: u32) -> u32 {
    (word >> 16) & MASK_5
}

/// 14-bit displacement with the sign in the low bit.
pub fn extract_14(word: u32) -> i32 {
    low_sign_extend(word & MASK_14, 14)
}

/// 21-bit `L%` immediate; the result is already shifted left by 11.
pub fn extract_21(word: u32) -> i32 {
    let word = (word & MASK_21) << 11;
    let mut val = get_field(word, 20, 20);
    val <<= 11;
    val |= get_field(word, 9, 19);
    val <<= 2;
    val |= get_field(word, 5, 6);
    val <<= 5;
    val |= get_field(word, 0, 4);
    val <<= 2;
    val |= get_field(word, 7, 8);
    sign_extend(val, 21).wrapping_shl(11)
}

/// 17-bit branch displacement in bytes (the word displacement times 4).
pub fn extract_17(word: u32) -> i32 {
    let val = get_field(word, 19, 28)
        | get_field(word, 29, 29) << 10
        | get_field(word, 11, 15) << 11
        | (word & 0x1) << 16;
    sign_extend(val, 17) << 2
}

pub fn extract_immediate(word: u32, field: ImmediateField) -> i32 {
    match field {
        ImmediateField::Im5 => extract_5_load(word),
        ImmediateField::Im14 => extract_14(word),
        ImmediateField::Im17 => extract_17(word),
        ImmediateField::Im21 => extract_21(word),
    }
}

/// Insert a 14-bit low-sign displacement into `word`.
pub fn deposit_14(opnd: i32, word: u32) -> u32 {
    let sign = u32::from(opnd < 0);
    word | (((opnd as u32) << 1) & MASK_14) | sign
}

/// Insert the 21-bit value `opnd` (an address shifted right by 11) into
/// the `ldil`/`addil` immediate of `word`.
pub fn deposit_21(opnd: u32, word: u32) -> u32 {
    let mut val = get_field(opnd, 11 + 14, 11 + 18);
    val <<= 2;
    val |= get_field(opnd, 11 + 12, 11 + 13);
    val <<= 2;
    val |= get_field(opnd, 11 + 19, 11 + 20);
    val <<= 11;
    val |= get_field(opnd, 11 + 1, 11 + 11);
    val <<= 1;
    val |= get_field(opnd, 11, 11);
    word | val
}

/// Insert a 17-bit word displacement into a branch instruction.
pub fn deposit_17(opnd: u32, word: u32) -> u32 {
    word | get_field(opnd, 15, 15)
        | get_field(opnd, 16, 20) << 16
        | get_field(opnd, 21, 21) << 2
        | get_field(opnd, 22, 31) << 3
}

/// Patch `ldil L'addr` into `ldil_word` and `ldo R'addr` into `ldo_word`.
pub fn deposit_address(addr: u32, ldil_word: u32, ldo_word: u32) -> (u32, u32) {
    (
        deposit_21(addr >> 11, ldil_word),
        deposit_14((addr & MASK_11) as i32, ldo_word),
    )
}
