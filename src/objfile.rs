//! ELF object files on disk.
//!
//! Memory-maps the file and implements [`ObjectFile`] over it: sections
//! (with their contents served straight from the mapping), minimal
//! symbols, and prologue ends taken from the DWARF line table.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use gimli::{EndianSlice, RunTimeEndian};
use log::{debug, warn};
use memmap2::Mmap;
use object::{Object, ObjectKind, ObjectSection, ObjectSymbol, SectionFlags, SymbolKind};

use crate::error::{Error, Result};
use crate::registers::RegisterSet;
use crate::symbols::{self, MinimalSymbol, SymbolType};
use crate::target::{ObjectFile, Section, Session, TargetAccess};

/// Symbol naming the global data pointer in PA-RISC ELF images.
pub const GLOBAL_POINTER_SYMBOL: &str = "$global$";

#[derive(Debug, Clone)]
struct SectionInfo {
    name: String,
    /// Run-time address (load offset applied).
    address: u64,
    size: u64,
    file_range: Option<(u64, u64)>,
    alloc: bool,
    writable: bool,
}

/// Line-table rows of one sequence: (address, line), ending with the
/// end-of-sequence address and line 0.
type LineSequence = Vec<(u64, u64)>;

struct Parsed {
    sections: Vec<SectionInfo>,
    symbols: Vec<MinimalSymbol>,
    lines: Vec<LineSequence>,
    shared: bool,
}

/// An ELF program or shared library.
pub struct ElfObject {
    name: String,
    mmap: Mmap,
    load_offset: u64,
    sections: Vec<SectionInfo>,
    symbols: Vec<MinimalSymbol>,
    lines: Vec<LineSequence>,
    shared: bool,
}

impl ElfObject {
    /// Map and parse the object at `path`, loaded at its link-time
    /// addresses.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_at(path, 0)
    }

    /// Map and parse the object at `path`, relocated by `load_offset`.
    pub fn load_at(path: &Path, load_offset: u64) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file) }?;
        let parsed = parse(&mmap, load_offset)
            .map_err(|e| Error::Object(format!("{}: {}", path.display(), e)))?;
        debug!(
            "{}: {} sections, {} symbols, {} line sequences",
            path.display(),
            parsed.sections.len(),
            parsed.symbols.len(),
            parsed.lines.len()
        );
        Ok(ElfObject {
            name: path.display().to_string(),
            mmap,
            load_offset,
            sections: parsed.sections,
            symbols: parsed.symbols,
            lines: parsed.lines,
            shared: parsed.shared,
        })
    }

    fn view<'a>(&'a self, info: &'a SectionInfo) -> Section<'a> {
        let data = info
            .file_range
            .and_then(|(start, len)| self.mmap.get(start as usize..(start + len) as usize))
            .unwrap_or(&[]);
        Section { name: &info.name, address: info.address, size: info.size, data }
    }
}

fn parse(data: &[u8], load_offset: u64) -> std::result::Result<Parsed, object::Error> {
    let obj = object::File::parse(data)?;

    let mut sections = Vec::new();
    for section in obj.sections() {
        let (alloc, writable) = match section.flags() {
            SectionFlags::Elf { sh_flags } => (
                sh_flags & u64::from(object::elf::SHF_ALLOC) != 0,
                sh_flags & u64::from(object::elf::SHF_WRITE) != 0,
            ),
            _ => (section.address() != 0, false),
        };
        let address = if section.address() != 0 { section.address() + load_offset } else { 0 };
        sections.push(SectionInfo {
            name: section.name().unwrap_or("").to_string(),
            address,
            size: section.size(),
            file_range: section.file_range(),
            alloc,
            writable,
        });
    }

    let mut syms = Vec::new();
    for sym in obj.symbols().chain(obj.dynamic_symbols()) {
        let Ok(name) = sym.name() else { continue };
        if name.is_empty() || sym.address() == 0 {
            continue;
        }
        let kind = match sym.kind() {
            SymbolKind::Text => SymbolType::Text,
            SymbolKind::Data => SymbolType::Data,
            _ => SymbolType::Other,
        };
        let section = sym
            .section_index()
            .and_then(|i| obj.section_by_index(i).ok())
            .and_then(|s| s.name().ok().map(str::to_string));
        let mut minimal = MinimalSymbol::new(name, sym.address() + load_offset, kind).with_size(sym.size());
        minimal.section = section;
        syms.push(minimal);
    }
    symbols::sort_symbols(&mut syms);
    syms.dedup_by(|a, b| a.name == b.name && a.addr == b.addr);

    let lines = line_sequences(&obj).unwrap_or_else(|e| {
        warn!("ignoring unreadable line table: {}", e);
        Vec::new()
    });

    let shared = obj.kind() == ObjectKind::Dynamic && obj.section_by_name(".interp").is_none();
    Ok(Parsed { sections, symbols: syms, lines, shared })
}

/// Every line-table sequence of every unit, at link-time addresses.
fn line_sequences(obj: &object::File<'_>) -> std::result::Result<Vec<LineSequence>, gimli::Error> {
    let endian = if obj.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };
    let dwarf = gimli::Dwarf::load(|id| -> std::result::Result<_, gimli::Error> {
        let data = obj
            .section_by_name(id.name())
            .and_then(|s| s.data().ok())
            .unwrap_or(&[]);
        Ok(EndianSlice::new(data, endian))
    })?;

    let mut sequences = Vec::new();
    let mut units = dwarf.units();
    while let Some(header) = units.next()? {
        let unit = dwarf.unit(header)?;
        let Some(program) = unit.line_program.clone() else {
            continue;
        };
        let mut rows = program.rows();
        let mut current = Vec::new();
        while let Some((_, row)) = rows.next_row()? {
            if row.end_sequence() {
                current.push((row.address(), 0));
                sequences.push(std::mem::take(&mut current));
            } else {
                current.push((row.address(), row.line().map_or(0, |l| l.get())));
            }
        }
    }
    Ok(sequences)
}

/// End of the first source line of the function at `func_start`: the
/// first later row that starts a different line.
fn first_line_end(lines: &[LineSequence], func_start: u64) -> Option<u64> {
    lines.iter().find_map(|seq| {
        let i = seq.iter().position(|&(addr, _)| addr == func_start)?;
        let line = seq[i].1;
        seq[i + 1..]
            .iter()
            .find(|&&(addr, l)| addr > func_start && l != line)
            .map(|&(addr, _)| addr)
    })
}

impl ObjectFile for ElfObject {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_elf(&self) -> bool {
        true
    }

    fn section(&self, name: &str) -> Option<Section<'_>> {
        self.sections.iter().find(|s| s.name == name).map(|s| self.view(s))
    }

    fn section_at(&self, addr: u64) -> Option<Section<'_>> {
        self.sections
            .iter()
            .filter(|s| s.alloc && s.address != 0)
            .map(|s| self.view(s))
            .find(|s| s.contains(addr))
    }

    fn text_offset(&self) -> u64 {
        self.load_offset
    }

    fn lowest_readonly_address(&self) -> Option<u64> {
        self.sections
            .iter()
            .filter(|s| s.alloc && !s.writable && s.address != 0)
            .map(|s| s.address)
            .min()
    }

    fn minimal_symbols(&self) -> &[MinimalSymbol] {
        &self.symbols
    }

    fn prologue_end(&self, func_start: u64) -> Option<u64> {
        let link_addr = func_start.checked_sub(self.load_offset)?;
        first_line_end(&self.lines, link_addr).map(|end| end + self.load_offset)
    }

    fn global_pointer(&self) -> Option<u64> {
        symbols::lookup_by_name(&self.symbols, GLOBAL_POINTER_SYMBOL)
            .map(|s| s.address())
            .or_else(|| self.section(".got").map(|s| s.address))
    }

    fn contains(&self, addr: u64) -> bool {
        self.sections
            .iter()
            .filter(|s| s.alloc && s.address != 0)
            .any(|s| s.address <= addr && addr < s.address + s.size)
    }

    fn is_shared_library(&self) -> bool {
        self.shared
    }
}

/// A target with no live process: memory comes from the section
/// contents of the session's objects, registers from a caller-supplied
/// set. Writes land in an overlay and never reach the files.
pub struct StaticImage<'a> {
    session: &'a Session,
    registers: RegisterSet,
    overlay: HashMap<u64, u8>,
}

impl<'a> StaticImage<'a> {
    pub fn new(session: &'a Session, registers: RegisterSet) -> Self {
        StaticImage { session, registers, overlay: HashMap::new() }
    }

    pub fn registers(&self) -> &RegisterSet {
        &self.registers
    }

    fn file_byte(&self, addr: u64) -> Option<u8> {
        self.session.objects().find_map(|obj| {
            let section = obj.section_at(addr)?;
            section.data.get((addr - section.address) as usize).copied()
        })
    }
}

impl TargetAccess for StaticImage<'_> {
    fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        (0..len as u64)
            .map(|i| {
                let at = addr.wrapping_add(i);
                self.overlay
                    .get(&at)
                    .copied()
                    .or_else(|| self.file_byte(at))
                    .ok_or(Error::Memory { addr, len })
            })
            .collect()
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        for (i, &b) in data.iter().enumerate() {
            self.overlay.insert(addr.wrapping_add(i as u64), b);
        }
        Ok(())
    }

    fn read_register(&self, regnum: usize) -> Result<u64> {
        self.registers.require(regnum)
    }

    fn write_register(&mut self, regnum: usize, value: u64) -> Result<()> {
        self.registers.set(regnum, value);
        Ok(())
    }
}
