//! Target capabilities and the unwinding session.
//!
//! The traced process is reached only through [`TargetAccess`] (memory and
//! registers of one stopped thread) and the loaded modules only through
//! [`ObjectFile`]. [`Session`] owns everything that is computed from them
//! and cached between queries: lazily built unwind tables, memoized helper
//! symbol addresses, stub-type corrections, and the inferior calls that
//! are currently in flight.

use std::cell::{OnceCell, RefCell};
use std::collections::HashMap;

use log::{debug, warn};

use crate::abi::{self, CallingConvention};
use crate::error::{Error, Result};
use crate::registers::RegisterSet;
use crate::symbols::{self, MinimalSymbol, SymbolType};
use crate::types::FrameId;
use crate::unwind_table::{StubType, UnwindDescriptor, UnwindTable};

/// Memory and register access to one stopped thread of the inferior.
///
/// All multi-byte values are big-endian.
pub trait TargetAccess {
    fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>>;
    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<()>;
    fn read_register(&self, regnum: usize) -> Result<u64>;
    fn write_register(&mut self, regnum: usize, value: u64) -> Result<()>;

    fn read_u32(&self, addr: u64) -> Result<u32> {
        let bytes = self.read_memory(addr, 4)?;
        let word: [u8; 4] = bytes
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or(Error::Memory { addr, len: 4 })?;
        Ok(u32::from_be_bytes(word))
    }

    /// Read an unsigned big-endian integer of `size` bytes (1..=8).
    fn read_word(&self, addr: u64, size: usize) -> Result<u64> {
        let bytes = self.read_memory(addr, size)?;
        if bytes.len() < size || size > 8 {
            return Err(Error::Memory { addr, len: size });
        }
        Ok(bytes[..size].iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
    }

    /// Write the low `size` bytes of `value`, big-endian.
    fn write_word(&mut self, addr: u64, size: usize, value: u64) -> Result<()> {
        let bytes = value.to_be_bytes();
        self.write_memory(addr, &bytes[8 - size..])
    }
}

/// A section of an object file, as mapped at run time.
#[derive(Debug, Clone, Copy)]
pub struct Section<'a> {
    pub name: &'a str,
    pub address: u64,
    pub size: u64,
    /// File contents; empty for sections without file data (`.bss`).
    pub data: &'a [u8],
}

impl Section<'_> {
    pub fn contains(&self, addr: u64) -> bool {
        self.address <= addr && addr < self.address + self.size
    }
}

/// The loader's view of one object file (program or shared library).
pub trait ObjectFile {
    fn name(&self) -> &str;
    fn is_elf(&self) -> bool;
    fn section(&self, name: &str) -> Option<Section<'_>>;
    /// The section covering `addr`, if any.
    fn section_at(&self, addr: u64) -> Option<Section<'_>>;
    /// Load offset of the object's text (non-zero for shared libraries).
    fn text_offset(&self) -> u64;
    /// Lowest address of the allocated, loaded, read-only sections.
    fn lowest_readonly_address(&self) -> Option<u64>;
    /// Minimal symbols, sorted by address.
    fn minimal_symbols(&self) -> &[MinimalSymbol];
    /// First address past the prologue of the function at `func_start`,
    /// from the line table.
    fn prologue_end(&self, func_start: u64) -> Option<u64>;
    /// Value of the global data pointer for code in this object.
    fn global_pointer(&self) -> Option<u64>;
    fn contains(&self, addr: u64) -> bool;
    fn is_shared_library(&self) -> bool;
}

/// Pointer width and calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abi {
    Pa32,
    Pa64,
}

/// Operating system conventions for stubs and signal frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    Hpux,
    Linux,
}

#[derive(Debug, Clone, Copy)]
pub struct TargetConfig {
    pub abi: Abi,
    pub os: Os,
    /// PA 2.0 processor; enables the `bve` stub exit forms.
    pub is_pa_2: bool,
    pub max_backtrace_depth: usize,
}

impl Default for TargetConfig {
    fn default() -> Self {
        TargetConfig {
            abi: Abi::Pa32,
            os: Os::Hpux,
            is_pa_2: true,
            max_backtrace_depth: 256,
        }
    }
}

/// Identity of a descriptor: owning object and region start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorKey {
    pub object: usize,
    pub region_start: u64,
}

/// A descriptor found by [`Session::lookup_unwind`], with any stub-type
/// correction already applied.
#[derive(Debug, Clone, Copy)]
pub struct UnwindHit {
    pub key: DescriptorKey,
    pub descriptor: UnwindDescriptor,
}

/// A minimal symbol together with the object it came from, with any
/// symbol-type correction already applied.
#[derive(Debug, Clone)]
pub struct SymbolHit {
    pub object: usize,
    pub symbol: MinimalSymbol,
}

/// An inferior call whose dummy frame is on the stack.
#[derive(Debug, Clone)]
pub(crate) struct ActiveDummy {
    pub id: FrameId,
    /// Registers of the interrupted frame, taken before the call.
    pub saved: RegisterSet,
}

pub struct Session {
    config: TargetConfig,
    convention: Box<dyn CallingConvention>,
    objects: Vec<Box<dyn ObjectFile>>,
    tables: Vec<OnceCell<UnwindTable>>,
    helper_addrs: RefCell<HashMap<String, Option<u64>>>,
    stub_overrides: RefCell<HashMap<DescriptorKey, StubType>>,
    symbol_overrides: RefCell<HashMap<(String, u64), SymbolType>>,
    pub(crate) dummies: RefCell<Vec<ActiveDummy>>,
}

impl Session {
    pub fn new(config: TargetConfig) -> Self {
        Session {
            convention: abi::convention_for(config.abi),
            config,
            objects: Vec::new(),
            tables: Vec::new(),
            helper_addrs: RefCell::new(HashMap::new()),
            stub_overrides: RefCell::new(HashMap::new()),
            symbol_overrides: RefCell::new(HashMap::new()),
            dummies: RefCell::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    pub fn convention(&self) -> &dyn CallingConvention {
        self.convention.as_ref()
    }

    // ── Object files ───────────────────────────────────────────────

    /// Register a loaded object. Its unwind table is built on first use.
    pub fn add_object(&mut self, object: Box<dyn ObjectFile>) -> usize {
        debug!("adding object {}", object.name());
        self.objects.push(object);
        self.tables.push(OnceCell::new());
        self.helper_addrs.borrow_mut().clear();
        self.objects.len() - 1
    }

    pub fn objects(&self) -> impl Iterator<Item = &dyn ObjectFile> {
        self.objects.iter().map(|o| o.as_ref())
    }

    pub fn object(&self, index: usize) -> Option<&dyn ObjectFile> {
        self.objects.get(index).map(|o| o.as_ref())
    }

    /// Index of the object whose mapping covers `addr`.
    pub fn object_for_pc(&self, addr: u64) -> Option<usize> {
        self.objects.iter().position(|o| o.contains(addr))
    }

    /// Name of the section covering `addr`, searching every object.
    pub fn section_name_at(&self, addr: u64) -> Option<String> {
        self.objects
            .iter()
            .find_map(|o| o.section_at(addr).map(|s| s.name.to_string()))
    }

    pub fn in_section(&self, addr: u64, name: &str) -> bool {
        self.objects
            .iter()
            .any(|o| o.section_at(addr).is_some_and(|s| s.name == name))
    }

    // ── Unwind tables ──────────────────────────────────────────────

    /// The unwind table of object `index`, built on first access.
    ///
    /// A malformed section is logged and treated as absent.
    pub fn unwind_table(&self, index: usize) -> Option<&UnwindTable> {
        let object = self.objects.get(index)?;
        let cell = self.tables.get(index)?;
        Some(cell.get_or_init(|| {
            UnwindTable::build(object.as_ref()).unwrap_or_else(|e| {
                warn!("{}: {}", object.name(), e);
                UnwindTable::empty()
            })
        }))
    }

    /// Find the descriptor covering `pc` in any object, in load order.
    pub fn lookup_unwind(&self, pc: u64) -> Option<UnwindHit> {
        if pc == 0 {
            return None;
        }
        (0..self.objects.len()).find_map(|object| {
            let mut descriptor = *self.unwind_table(object)?.find(pc)?;
            let key = DescriptorKey { object, region_start: descriptor.region_start };
            if let Some(&stub_type) = self.stub_overrides.borrow().get(&key) {
                descriptor.stub_type = stub_type;
            }
            Some(UnwindHit { key, descriptor })
        })
    }

    pub fn find_unwind_entry(&self, pc: u64) -> Option<UnwindDescriptor> {
        self.lookup_unwind(pc).map(|hit| hit.descriptor)
    }

    pub(crate) fn override_stub_type(&self, key: DescriptorKey, stub_type: StubType) {
        self.stub_overrides.borrow_mut().insert(key, stub_type);
    }

    // ── Minimal symbols ────────────────────────────────────────────

    fn effective(&self, object: usize, sym: &MinimalSymbol) -> SymbolHit {
        let mut symbol = sym.clone();
        let key = (sym.name.clone(), sym.address());
        if let Some(&kind) = self.symbol_overrides.borrow().get(&key) {
            symbol.kind = kind;
        }
        SymbolHit { object, symbol }
    }

    /// The code symbol at or before `pc`, closest across all objects.
    pub fn lookup_symbol_by_pc(&self, pc: u64) -> Option<SymbolHit> {
        self.objects
            .iter()
            .enumerate()
            .filter_map(|(i, o)| symbols::lookup_by_pc(o.minimal_symbols(), pc).map(|s| (i, s)))
            .max_by_key(|(_, s)| s.address())
            .map(|(i, s)| self.effective(i, s))
    }

    /// Look a symbol up by name in all objects. Real code wins over a
    /// trampoline with the same name.
    pub fn lookup_symbol(&self, name: &str) -> Option<SymbolHit> {
        let mut fallback = None;
        for (i, object) in self.objects.iter().enumerate() {
            for sym in object.minimal_symbols().iter().filter(|s| s.name == name) {
                let hit = self.effective(i, sym);
                if hit.symbol.kind != SymbolType::SolibTrampoline {
                    return Some(hit);
                }
                fallback.get_or_insert(hit);
            }
        }
        fallback
    }

    /// Every symbol named `name` with the given (effective) type.
    pub fn symbols_named(&self, name: &str, kind: SymbolType) -> Vec<SymbolHit> {
        self.objects
            .iter()
            .enumerate()
            .flat_map(|(i, o)| {
                o.minimal_symbols()
                    .iter()
                    .filter(|s| s.name == name)
                    .map(move |s| (i, s))
            })
            .map(|(i, s)| self.effective(i, s))
            .filter(|hit| hit.symbol.kind == kind)
            .collect()
    }

    pub(crate) fn override_symbol_type(&self, sym: &MinimalSymbol, kind: SymbolType) {
        self.symbol_overrides
            .borrow_mut()
            .insert((sym.name.clone(), sym.address()), kind);
    }

    /// Address of a well-known helper symbol, memoized per session.
    pub fn helper_address(&self, name: &str) -> Option<u64> {
        if let Some(&addr) = self.helper_addrs.borrow().get(name) {
            return addr;
        }
        let addr = self.lookup_symbol(name).map(|hit| hit.symbol.address());
        self.helper_addrs.borrow_mut().insert(name.to_string(), addr);
        addr
    }

    /// Start of the function containing `pc`: the covering descriptor's
    /// region start when the region includes the entry point, else the
    /// preceding symbol.
    pub fn function_start(&self, pc: u64) -> Option<u64> {
        if let Some(hit) = self.lookup_unwind(pc) {
            if hit.descriptor.region_description & 0x2 == 0 {
                return Some(hit.descriptor.region_start);
            }
        }
        self.lookup_symbol_by_pc(pc).map(|hit| hit.symbol.address())
    }

    /// Global pointer for code at `pc`, from the object that maps it.
    pub fn global_pointer_for(&self, pc: u64) -> Option<u64> {
        self.object_for_pc(pc)
            .and_then(|i| self.objects[i].global_pointer())
    }
}
