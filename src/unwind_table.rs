//! Unwind descriptor tables.
//!
//! Each object file carries one table, decoded from the HP unwind
//! sections:
//! - `$UNWIND_START$` (SOM) and `.PARISC.unwind` (ELF) hold 16-byte
//!   records: region start, region end, and two flag words.
//! - `$UNWIND_END$` (SOM) holds 8-byte linker stub records: start
//!   address, stub type, padding, and a length in instructions.
//!
//! Everything is big-endian. The table is sorted by region start and
//! answers "which descriptor covers this PC" with a one-entry MRU cache
//! in front of a binary search.

use std::cell::Cell;
use std::fmt;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::target::ObjectFile;

pub const UNWIND_ENTRY_SIZE: usize = 16;
pub const STUB_UNWIND_ENTRY_SIZE: usize = 8;

/// Sections holding full 16-byte descriptors.
pub const UNWIND_SECTIONS: &[&str] = &["$UNWIND_START$", ".PARISC.unwind"];
/// Section holding compact linker stub records.
pub const STUB_UNWIND_SECTION: &str = "$UNWIND_END$";

/// Kind of linker-generated stub a descriptor covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StubType {
    /// Ordinary code, not a stub.
    #[default]
    None,
    LongBranch,
    ParameterRelocation,
    Export,
    Import,
    ImportShlib,
    Unknown(u8),
}

impl StubType {
    pub fn from_raw(raw: u8) -> StubType {
        match raw {
            0 => StubType::None,
            1 => StubType::LongBranch,
            2 => StubType::ParameterRelocation,
            10 => StubType::Export,
            11 => StubType::Import,
            12 => StubType::ImportShlib,
            n => StubType::Unknown(n),
        }
    }

    pub fn is_stub(self) -> bool {
        self != StubType::None
    }
}

impl fmt::Display for StubType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StubType::None => f.write_str("NONE"),
            StubType::LongBranch => f.write_str("LONG_BRANCH"),
            StubType::ParameterRelocation => f.write_str("PARAMETER_RELOCATION"),
            StubType::Export => f.write_str("EXPORT"),
            StubType::Import => f.write_str("IMPORT"),
            StubType::ImportShlib => f.write_str("IMPORT_SHLIB"),
            StubType::Unknown(n) => write!(f, "UNKNOWN({})", n),
        }
    }
}

/// Interrupt marker carried in the second flag word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterruptMarker {
    #[default]
    None,
    Hpux,
    Mpe,
}

/// One code region (function, millicode routine or linker stub) and what
/// its prologue does to the stack and the callee-saved registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnwindDescriptor {
    pub region_start: u64,
    /// Inclusive.
    pub region_end: u64,

    pub cannot_unwind: bool,
    pub is_millicode: bool,
    pub millicode_save_sr0: bool,
    pub region_description: u8,
    pub entry_sr: bool,
    /// Floating-point callee saves, starting at fr12.
    pub entry_fr: u8,
    /// General callee saves, starting at r3.
    pub entry_gr: u8,
    pub args_stored: bool,
    pub variable_frame: bool,
    pub separate_package_body: bool,
    pub has_frame_extension_for_millicode: bool,
    pub has_stack_overflow_check: bool,
    pub has_two_instruction_sp_increment: bool,
    pub ada_region: bool,
    pub cxx_info: bool,
    pub cxx_try_catch: bool,
    pub sched_entry_seq: bool,
    pub saves_sp: bool,
    pub saves_rp: bool,
    pub save_mrp_in_frame: bool,
    pub extn_ptr_defined: bool,
    pub cleanup_defined: bool,

    pub interrupt_marker: InterruptMarker,
    pub large_frame: bool,
    pub pseudo_sp_set: bool,
    /// Frame size in 8-byte units.
    pub total_frame_size: u32,

    pub stub_type: StubType,
}

fn bit(word: u32, n: u32) -> bool {
    (word >> n) & 1 != 0
}

impl UnwindDescriptor {
    /// Decode a 16-byte record, adding `bias` to both region bounds.
    pub fn from_record(record: &[u8; UNWIND_ENTRY_SIZE], bias: u64) -> UnwindDescriptor {
        let word = |i: usize| {
            u32::from_be_bytes([record[i], record[i + 1], record[i + 2], record[i + 3]])
        };
        let start = word(0);
        let end = word(4);
        let w2 = word(8);
        let w3 = word(12);

        let interrupt_marker = if bit(w3, 31) {
            InterruptMarker::Mpe
        } else if bit(w3, 30) {
            InterruptMarker::Hpux
        } else {
            InterruptMarker::None
        };

        UnwindDescriptor {
            region_start: u64::from(start).wrapping_add(bias),
            region_end: u64::from(end).wrapping_add(bias),
            cannot_unwind: bit(w2, 31),
            is_millicode: bit(w2, 30),
            millicode_save_sr0: bit(w2, 29),
            region_description: ((w2 >> 27) & 0x3) as u8,
            entry_sr: bit(w2, 25),
            entry_fr: ((w2 >> 21) & 0xf) as u8,
            entry_gr: ((w2 >> 16) & 0x1f) as u8,
            args_stored: bit(w2, 15),
            variable_frame: bit(w2, 14),
            separate_package_body: bit(w2, 13),
            has_frame_extension_for_millicode: bit(w2, 12),
            has_stack_overflow_check: bit(w2, 11),
            has_two_instruction_sp_increment: bit(w2, 10),
            ada_region: bit(w2, 9),
            cxx_info: bit(w2, 8),
            cxx_try_catch: bit(w2, 7),
            sched_entry_seq: bit(w2, 6),
            saves_sp: bit(w2, 4),
            saves_rp: bit(w2, 3),
            save_mrp_in_frame: bit(w2, 2),
            extn_ptr_defined: bit(w2, 1),
            cleanup_defined: bit(w2, 0),
            interrupt_marker,
            large_frame: bit(w3, 29),
            pseudo_sp_set: bit(w3, 28),
            total_frame_size: w3 & 0x07ff_ffff,
            stub_type: StubType::None,
        }
    }

    /// Decode an 8-byte linker stub record. Returns `None` for a record
    /// with a zero instruction count, which describes no code at all.
    pub fn from_stub_record(record: &[u8; STUB_UNWIND_ENTRY_SIZE], bias: u64) -> Option<Self> {
        let start = u32::from_be_bytes([record[0], record[1], record[2], record[3]]);
        let count = u16::from_be_bytes([record[6], record[7]]);
        if count == 0 {
            return None;
        }
        let region_start = u64::from(start).wrapping_add(bias);
        Some(UnwindDescriptor {
            region_start,
            region_end: region_start + 4 * (u64::from(count) - 1),
            stub_type: StubType::from_raw(record[4]),
            ..Default::default()
        })
    }

    pub fn contains(&self, pc: u64) -> bool {
        self.region_start <= pc && pc <= self.region_end
    }

    /// Frame size in bytes.
    pub fn frame_size(&self) -> u64 {
        u64::from(self.total_frame_size) << 3
    }

    pub fn flag_names(&self) -> Vec<&'static str> {
        let flags = [
            (self.cannot_unwind, "Cannot_unwind"),
            (self.is_millicode, "Millicode"),
            (self.millicode_save_sr0, "Millicode_save_sr0"),
            (self.entry_sr, "Entry_SR"),
            (self.args_stored, "Args_stored"),
            (self.variable_frame, "Variable_Frame"),
            (self.separate_package_body, "Separate_Package_Body"),
            (self.has_frame_extension_for_millicode, "Frame_Extension_Millicode"),
            (self.has_stack_overflow_check, "Stack_Overflow_Check"),
            (self.has_two_instruction_sp_increment, "Two_Instruction_SP_Increment"),
            (self.ada_region, "Ada_Region"),
            (self.cxx_info, "cxx_info"),
            (self.cxx_try_catch, "cxx_try_catch"),
            (self.sched_entry_seq, "sched_entry_seq"),
            (self.saves_sp, "Save_SP"),
            (self.saves_rp, "Save_RP"),
            (self.save_mrp_in_frame, "Save_MRP_in_frame"),
            (self.extn_ptr_defined, "extn_ptr_defined"),
            (self.cleanup_defined, "Cleanup_defined"),
            (self.interrupt_marker == InterruptMarker::Mpe, "MPE_XL_interrupt_marker"),
            (self.interrupt_marker == InterruptMarker::Hpux, "HP_UX_interrupt_marker"),
            (self.large_frame, "Large_frame"),
            (self.pseudo_sp_set, "Pseudo_SP_Set"),
        ];
        flags.iter().filter(|(set, _)| *set).map(|(_, name)| *name).collect()
    }
}

impl fmt::Display for UnwindDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\tregion_start = 0x{:x}", self.region_start)?;
        writeln!(f, "\tregion_end = 0x{:x}", self.region_end)?;
        writeln!(f, "\tflags = {}", self.flag_names().join(" "))?;
        writeln!(f, "\tRegion_description = 0x{:x}", self.region_description)?;
        writeln!(f, "\tEntry_FR = 0x{:x}", self.entry_fr)?;
        writeln!(f, "\tEntry_GR = 0x{:x}", self.entry_gr)?;
        write!(f, "\tTotal_frame_size = 0x{:x}", self.total_frame_size)?;
        if self.stub_type.is_stub() {
            write!(f, "\n\tstub type = {}", self.stub_type)?;
        }
        Ok(())
    }
}

/// Decode a section of 16-byte records.
pub fn parse_unwind_entries(section: &str, data: &[u8], bias: u64) -> Result<Vec<UnwindDescriptor>> {
    if data.len() % UNWIND_ENTRY_SIZE != 0 {
        warn!(
            "{}: ignoring {} trailing bytes",
            section,
            data.len() % UNWIND_ENTRY_SIZE
        );
    }
    let mut entries = Vec::with_capacity(data.len() / UNWIND_ENTRY_SIZE);
    for chunk in data.chunks_exact(UNWIND_ENTRY_SIZE) {
        let mut record = [0u8; UNWIND_ENTRY_SIZE];
        record.copy_from_slice(chunk);
        let entry = UnwindDescriptor::from_record(&record, bias);
        if entry.region_end < entry.region_start {
            return Err(Error::UnwindSection {
                section: section.to_string(),
                reason: format!(
                    "region 0x{:x}..0x{:x} ends before it starts",
                    entry.region_start, entry.region_end
                ),
            });
        }
        entries.push(entry);
    }
    Ok(entries)
}

/// Decode a section of 8-byte stub records.
pub fn parse_stub_entries(data: &[u8], bias: u64) -> Vec<UnwindDescriptor> {
    if data.len() % STUB_UNWIND_ENTRY_SIZE != 0 {
        warn!(
            "{}: ignoring {} trailing bytes",
            STUB_UNWIND_SECTION,
            data.len() % STUB_UNWIND_ENTRY_SIZE
        );
    }
    data.chunks_exact(STUB_UNWIND_ENTRY_SIZE)
        .filter_map(|chunk| {
            let mut record = [0u8; STUB_UNWIND_ENTRY_SIZE];
            record.copy_from_slice(chunk);
            let entry = UnwindDescriptor::from_stub_record(&record, bias);
            if entry.is_none() {
                warn!("{}: skipping empty stub record", STUB_UNWIND_SECTION);
            }
            entry
        })
        .collect()
}

/// Sorted descriptors of one object file.
#[derive(Debug, Default)]
pub struct UnwindTable {
    entries: Vec<UnwindDescriptor>,
    /// Index of the last hit; always in bounds of `entries`.
    cache: Cell<Option<usize>>,
}

impl UnwindTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a table from already-decoded descriptors.
    ///
    /// The sort is stable, so descriptors sharing a start address keep
    /// their input order.
    pub fn from_descriptors(mut entries: Vec<UnwindDescriptor>) -> Self {
        entries.sort_by_key(|e| e.region_start);
        UnwindTable { entries, cache: Cell::new(None) }
    }

    /// Read every unwind section of `obj`.
    ///
    /// ELF unwind entries are segment-relative. A shared library passes
    /// its load offset; the main program's entries are relative to its
    /// lowest read-only allocated section.
    pub fn build(obj: &dyn ObjectFile) -> Result<Self> {
        let text_offset = obj.text_offset();
        let bias = if obj.is_elf() && text_offset == 0 {
            obj.lowest_readonly_address().unwrap_or(0)
        } else {
            text_offset
        };

        let mut entries = Vec::new();
        for name in UNWIND_SECTIONS {
            if let Some(section) = obj.section(name) {
                entries.extend(parse_unwind_entries(name, section.data, bias)?);
            }
        }
        let normal = entries.len();
        if let Some(section) = obj.section(STUB_UNWIND_SECTION) {
            entries.extend(parse_stub_entries(section.data, text_offset));
        }

        debug!(
            "{}: {} unwind entries, {} stub entries, bias 0x{:x}",
            obj.name(),
            normal,
            entries.len() - normal,
            bias
        );
        Ok(Self::from_descriptors(entries))
    }

    /// Find the descriptor covering `pc`.
    pub fn find(&self, pc: u64) -> Option<&UnwindDescriptor> {
        self.find_index(pc).map(|i| &self.entries[i])
    }

    pub fn find_index(&self, pc: u64) -> Option<usize> {
        if pc == 0 {
            return None;
        }
        if let Some(i) = self.cache.get() {
            if self.entries[i].contains(pc) {
                return Some(i);
            }
        }

        let mut lo = 0usize;
        let mut hi = self.entries.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let entry = &self.entries[mid];
            if entry.contains(pc) {
                self.cache.set(Some(mid));
                return Some(mid);
            }
            if pc < entry.region_start {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        None
    }

    pub fn get(&self, index: usize) -> Option<&UnwindDescriptor> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> &[UnwindDescriptor] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &UnwindDescriptor> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn cached_index(&self) -> Option<usize> {
        self.cache.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{stub_record, unwind_record, MockObject};

    #[test]
    fn decode_flag_words() {
        let w2 = (1 << 31) | (1 << 30) | (0b10 << 27) | (3 << 21) | (5 << 16) | (1 << 15) | (1 << 4) | (1 << 3);
        let w3 = (1 << 30) | (1 << 29) | 10;
        let d = UnwindDescriptor::from_record(&unwind_record(0x1000, 0x10ff, w2, w3), 0);
        assert!(d.cannot_unwind);
        assert!(d.is_millicode);
        assert!(!d.millicode_save_sr0);
        assert_eq!(d.region_description, 2);
        assert_eq!(d.entry_fr, 3);
        assert_eq!(d.entry_gr, 5);
        assert!(d.args_stored);
        assert!(d.saves_sp);
        assert!(d.saves_rp);
        assert_eq!(d.interrupt_marker, InterruptMarker::Hpux);
        assert!(d.large_frame);
        assert_eq!(d.total_frame_size, 10);
        assert_eq!(d.frame_size(), 80);
        assert_eq!(d.stub_type, StubType::None);
    }

    #[test]
    fn decode_stub_record() {
        let rec = [0x00, 0x00, 0x20, 0x00, 11, 0, 0x00, 0x04];
        let d = UnwindDescriptor::from_stub_record(&rec, 0x100).unwrap();
        assert_eq!(d.region_start, 0x2100);
        assert_eq!(d.region_end, 0x2100 + 12);
        assert_eq!(d.stub_type, StubType::Import);

        let empty = [0, 0, 0x20, 0, 1, 0, 0, 0];
        assert!(UnwindDescriptor::from_stub_record(&empty, 0).is_none());
    }

    #[test]
    fn stub_type_codes() {
        assert_eq!(StubType::from_raw(1), StubType::LongBranch);
        assert_eq!(StubType::from_raw(2), StubType::ParameterRelocation);
        assert_eq!(StubType::from_raw(10), StubType::Export);
        assert_eq!(StubType::from_raw(12), StubType::ImportShlib);
        assert_eq!(StubType::from_raw(7), StubType::Unknown(7));
    }

    #[test]
    fn find_covers_every_region_address() {
        let regions = [(0x1000u32, 0x10fcu32), (0x1100, 0x1100), (0x2000, 0x2ffc)];
        let mut data = Vec::new();
        for (start, end) in regions {
            data.extend_from_slice(&unwind_record(start, end, 0, 0));
        }
        let obj = MockObject::som("a.out").with_section("$UNWIND_START$", 0, data);
        let table = UnwindTable::build(&obj).unwrap();
        assert_eq!(table.len(), 3);

        for (start, end) in regions {
            for pc in (u64::from(start)..=u64::from(end)).step_by(4) {
                let d = table.find(pc).unwrap();
                assert_eq!(d.region_start, u64::from(start));
                assert_eq!(d.region_end, u64::from(end));
            }
        }
        for pc in [0x0ffc, 0x1104, 0x1ffc, 0x3000, 0xffff_fffc] {
            assert!(table.find(pc).is_none(), "pc 0x{:x}", pc);
        }
        assert!(table.find(0).is_none());
    }

    #[test]
    fn find_zero_is_never_code() {
        let table = UnwindTable::from_descriptors(vec![UnwindDescriptor {
            region_start: 0,
            region_end: 0x100,
            ..Default::default()
        }]);
        assert!(table.find(0).is_none());
        assert!(table.find(4).is_some());
    }

    #[test]
    fn cache_tracks_last_hit() {
        let table = UnwindTable::from_descriptors(vec![
            UnwindDescriptor { region_start: 0x100, region_end: 0x1fc, ..Default::default() },
            UnwindDescriptor { region_start: 0x200, region_end: 0x2fc, ..Default::default() },
        ]);
        assert_eq!(table.cached_index(), None);
        table.find(0x204);
        assert_eq!(table.cached_index(), Some(1));
        // A miss leaves the cache alone.
        assert!(table.find(0x400).is_none());
        assert_eq!(table.cached_index(), Some(1));
        assert_eq!(table.find(0x104).unwrap().region_start, 0x100);
        assert_eq!(table.cached_index(), Some(0));
    }

    #[test]
    fn stable_sort_keeps_file_order() {
        let a = UnwindDescriptor { region_start: 0x100, region_end: 0x1fc, entry_gr: 1, ..Default::default() };
        let b = UnwindDescriptor { region_start: 0x100, region_end: 0x1fc, entry_gr: 2, ..Default::default() };
        let c = UnwindDescriptor { region_start: 0x000, region_end: 0x0fc, ..Default::default() };
        let table = UnwindTable::from_descriptors(vec![a, b, c]);
        assert_eq!(table.entries()[0].region_start, 0);
        assert_eq!(table.entries()[1].entry_gr, 1);
        assert_eq!(table.entries()[2].entry_gr, 2);
    }

    #[test]
    fn elf_entries_are_segment_relative() {
        let data = unwind_record(0x100, 0x1fc, 0, 0).to_vec();
        let obj = MockObject::elf("prog")
            .with_readonly_section(".text", 0x1_0000, vec![0; 0x400])
            .with_section(".PARISC.unwind", 0, data.clone());
        let table = UnwindTable::build(&obj).unwrap();
        assert_eq!(table.entries()[0].region_start, 0x1_0100);

        // A shared library's own offset wins over the section scan.
        let lib = MockObject::elf("libc.so")
            .with_text_offset(0x4000_0000)
            .with_readonly_section(".text", 0x1_0000, vec![0; 0x400])
            .with_section(".PARISC.unwind", 0, data);
        let table = UnwindTable::build(&lib).unwrap();
        assert_eq!(table.entries()[0].region_start, 0x4000_0100);
    }

    #[test]
    fn stub_section_merges_into_table() {
        let obj = MockObject::som("a.out")
            .with_section("$UNWIND_START$", 0, unwind_record(0x1000, 0x10fc, 0, 0).to_vec())
            .with_section("$UNWIND_END$", 0, stub_record(0x0800, 1, 2).to_vec());
        let table = UnwindTable::build(&obj).unwrap();
        assert_eq!(table.len(), 2);
        let stub = table.find(0x804).unwrap();
        assert_eq!(stub.stub_type, StubType::LongBranch);
        assert_eq!(stub.region_end, 0x804);
    }

    #[test]
    fn missing_sections_give_empty_table() {
        let table = UnwindTable::build(&MockObject::som("stripped")).unwrap();
        assert!(table.is_empty());
        assert!(table.find(0x1000).is_none());
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let mut data = unwind_record(0x1000, 0x1004, 0, 0).to_vec();
        data.extend_from_slice(&[0xaa; 5]);
        let entries = parse_unwind_entries(".PARISC.unwind", &data, 0).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn inverted_region_is_malformed() {
        let data = unwind_record(0x2000, 0x1000, 0, 0);
        let err = parse_unwind_entries("$UNWIND_START$", &data, 0).unwrap_err();
        assert!(matches!(err, Error::UnwindSection { .. }));
    }

    #[test]
    fn display_lists_flags() {
        let d = UnwindDescriptor {
            region_start: 0x1000,
            region_end: 0x1040,
            saves_rp: true,
            total_frame_size: 8,
            stub_type: StubType::Export,
            ..Default::default()
        };
        let text = d.to_string();
        assert!(text.contains("region_start = 0x1000"));
        assert!(text.contains("flags = Save_RP"));
        assert!(text.contains("Total_frame_size = 0x8"));
        assert!(text.contains("stub type = EXPORT"));
    }
}
