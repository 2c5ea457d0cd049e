//! In-memory target and object file for unit tests.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::symbols::{self, MinimalSymbol, SymbolType};
use crate::target::{ObjectFile, Section, TargetAccess};

/// Sparse byte-addressed memory plus a register file.
#[derive(Debug, Default, Clone)]
pub struct MockTarget {
    memory: HashMap<u64, u8>,
    registers: HashMap<usize, u64>,
}

impl MockTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_register(&mut self, regnum: usize, value: u64) {
        self.registers.insert(regnum, value);
    }

    pub fn register(&self, regnum: usize) -> Option<u64> {
        self.registers.get(&regnum).copied()
    }

    pub fn poke(&mut self, addr: u64, data: &[u8]) {
        for (i, &b) in data.iter().enumerate() {
            self.memory.insert(addr + i as u64, b);
        }
    }

    pub fn poke_u32(&mut self, addr: u64, value: u32) {
        self.poke(addr, &value.to_be_bytes());
    }

    /// Store consecutive instruction words starting at `addr`.
    pub fn poke_insns(&mut self, addr: u64, insns: &[u32]) {
        for (i, &insn) in insns.iter().enumerate() {
            self.poke_u32(addr + 4 * i as u64, insn);
        }
    }

    pub fn peek_u32(&self, addr: u64) -> Option<u32> {
        let mut word = [0u8; 4];
        for (i, b) in word.iter_mut().enumerate() {
            *b = *self.memory.get(&(addr + i as u64))?;
        }
        Some(u32::from_be_bytes(word))
    }
}

impl TargetAccess for MockTarget {
    fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        (0..len as u64)
            .map(|i| {
                self.memory
                    .get(&addr.wrapping_add(i))
                    .copied()
                    .ok_or(Error::Memory { addr, len })
            })
            .collect()
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.poke(addr, data);
        Ok(())
    }

    fn read_register(&self, regnum: usize) -> Result<u64> {
        self.register(regnum)
            .ok_or_else(|| Error::Register(format!("register {} not set", regnum)))
    }

    fn write_register(&mut self, regnum: usize, value: u64) -> Result<()> {
        self.set_register(regnum, value);
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct MockSection {
    name: String,
    address: u64,
    size: u64,
    data: Vec<u8>,
    readonly: bool,
}

/// Object file assembled from sections and symbols in a test.
#[derive(Debug, Clone)]
pub struct MockObject {
    name: String,
    elf: bool,
    shared: bool,
    text_offset: u64,
    range: Option<(u64, u64)>,
    sections: Vec<MockSection>,
    symbols: Vec<MinimalSymbol>,
    prologue_ends: HashMap<u64, u64>,
    global_pointer: Option<u64>,
}

impl MockObject {
    fn new(name: &str, elf: bool) -> Self {
        MockObject {
            name: name.to_string(),
            elf,
            shared: false,
            text_offset: 0,
            range: None,
            sections: Vec::new(),
            symbols: Vec::new(),
            prologue_ends: HashMap::new(),
            global_pointer: None,
        }
    }

    pub fn som(name: &str) -> Self {
        Self::new(name, false)
    }

    pub fn elf(name: &str) -> Self {
        Self::new(name, true)
    }

    pub fn with_section(mut self, name: &str, address: u64, data: Vec<u8>) -> Self {
        self.sections.push(MockSection {
            name: name.to_string(),
            address,
            size: data.len() as u64,
            data,
            readonly: false,
        });
        self
    }

    pub fn with_readonly_section(mut self, name: &str, address: u64, data: Vec<u8>) -> Self {
        self = self.with_section(name, address, data);
        if let Some(last) = self.sections.last_mut() {
            last.readonly = true;
        }
        self
    }

    pub fn with_text_offset(mut self, offset: u64) -> Self {
        self.text_offset = offset;
        self
    }

    pub fn with_symbol(mut self, name: &str, addr: u64, kind: SymbolType) -> Self {
        self.symbols.push(MinimalSymbol::new(name, addr, kind));
        symbols::sort_symbols(&mut self.symbols);
        self
    }

    pub fn with_symbol_in(mut self, name: &str, addr: u64, kind: SymbolType, section: &str) -> Self {
        self.symbols.push(MinimalSymbol::new(name, addr, kind).in_section(section));
        symbols::sort_symbols(&mut self.symbols);
        self
    }

    pub fn with_prologue_end(mut self, func_start: u64, end: u64) -> Self {
        self.prologue_ends.insert(func_start, end);
        self
    }

    pub fn with_global_pointer(mut self, gp: u64) -> Self {
        self.global_pointer = Some(gp);
        self
    }

    /// Mark the object as a shared library mapped at `[start, end)`.
    pub fn shared_library(mut self, start: u64, end: u64) -> Self {
        self.shared = true;
        self.range = Some((start, end));
        self
    }

    pub fn with_range(mut self, start: u64, end: u64) -> Self {
        self.range = Some((start, end));
        self
    }

    fn as_section(s: &MockSection) -> Section<'_> {
        Section { name: &s.name, address: s.address, size: s.size, data: &s.data }
    }
}

impl ObjectFile for MockObject {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_elf(&self) -> bool {
        self.elf
    }

    fn section(&self, name: &str) -> Option<Section<'_>> {
        self.sections.iter().find(|s| s.name == name).map(Self::as_section)
    }

    fn section_at(&self, addr: u64) -> Option<Section<'_>> {
        self.sections
            .iter()
            .map(Self::as_section)
            .find(|s| s.address != 0 && s.contains(addr))
    }

    fn text_offset(&self) -> u64 {
        self.text_offset
    }

    fn lowest_readonly_address(&self) -> Option<u64> {
        self.sections.iter().filter(|s| s.readonly).map(|s| s.address).min()
    }

    fn minimal_symbols(&self) -> &[MinimalSymbol] {
        &self.symbols
    }

    fn prologue_end(&self, func_start: u64) -> Option<u64> {
        self.prologue_ends.get(&func_start).copied()
    }

    fn global_pointer(&self) -> Option<u64> {
        self.global_pointer
    }

    fn contains(&self, addr: u64) -> bool {
        match self.range {
            Some((start, end)) => start <= addr && addr < end,
            None => self.section_at(addr).is_some(),
        }
    }

    fn is_shared_library(&self) -> bool {
        self.shared
    }
}

/// Encode a 16-byte unwind record.
pub fn unwind_record(start: u32, end: u32, w2: u32, w3: u32) -> [u8; 16] {
    let mut rec = [0u8; 16];
    rec[0..4].copy_from_slice(&start.to_be_bytes());
    rec[4..8].copy_from_slice(&end.to_be_bytes());
    rec[8..12].copy_from_slice(&w2.to_be_bytes());
    rec[12..16].copy_from_slice(&w3.to_be_bytes());
    rec
}

/// Encode an 8-byte stub record covering `count` instructions.
pub fn stub_record(start: u32, stub_type: u8, count: u16) -> [u8; 8] {
    let mut rec = [0u8; 8];
    rec[0..4].copy_from_slice(&start.to_be_bytes());
    rec[4] = stub_type;
    rec[6..8].copy_from_slice(&count.to_be_bytes());
    rec
}

/// Flag-word bits for building records in tests.
pub mod flags {
    pub const SAVES_SP: u32 = 1 << 4;
    pub const SAVES_RP: u32 = 1 << 3;
    pub const MILLICODE: u32 = 1 << 30;
    pub const CANNOT_UNWIND: u32 = 1 << 31;

    pub fn entry_gr(n: u32) -> u32 {
        (n & 0x1f) << 16
    }

    pub fn entry_fr(n: u32) -> u32 {
        (n & 0xf) << 21
    }
}
