//! Minimal symbols: name, address and type only.
//!
//! The stub classifier and the call-dummy builder never need debug
//! information, only the linker-level view of which names live where and
//! whether an entry is real code or a shared-library trampoline.

use crate::types::VirtAddr;

/// Classification of a minimal symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolType {
    /// Ordinary code.
    Text,
    /// Import/export stub the linker emitted for a shared-library call.
    SolibTrampoline,
    Data,
    Other,
}

impl SymbolType {
    pub fn is_code(self) -> bool {
        matches!(self, SymbolType::Text | SymbolType::SolibTrampoline)
    }
}

/// A linker-level symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinimalSymbol {
    pub name: String,
    pub addr: VirtAddr,
    /// Size in bytes (0 if unknown).
    pub size: u64,
    pub kind: SymbolType,
    /// Name of the section the symbol is defined in, when known.
    pub section: Option<String>,
}

impl MinimalSymbol {
    pub fn new(name: &str, addr: u64, kind: SymbolType) -> Self {
        MinimalSymbol {
            name: name.to_string(),
            addr: VirtAddr(addr),
            size: 0,
            kind,
            section: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn in_section(mut self, section: &str) -> Self {
        self.section = Some(section.to_string());
        self
    }

    pub fn address(&self) -> u64 {
        self.addr.addr()
    }
}

/// The code symbol at or before `pc`: the closest preceding code symbol,
/// with `Text` preferred over a trampoline at the same address.
///
/// `symbols` must be sorted by address.
pub fn lookup_by_pc(symbols: &[MinimalSymbol], pc: u64) -> Option<&MinimalSymbol> {
    let end = symbols.partition_point(|s| s.address() <= pc);
    let best = symbols[..end].iter().rev().find(|s| s.kind.is_code())?;
    let same_addr = symbols[..end]
        .iter()
        .rev()
        .take_while(|s| s.address() >= best.address())
        .filter(|s| s.address() == best.address());
    let mut chosen = best;
    for sym in same_addr {
        if sym.kind == SymbolType::Text {
            chosen = sym;
            break;
        }
    }
    Some(chosen)
}

/// Look a symbol up by name: real code and data first, trampolines last.
pub fn lookup_by_name<'a>(symbols: &'a [MinimalSymbol], name: &str) -> Option<&'a MinimalSymbol> {
    let mut trampoline = None;
    for sym in symbols.iter().filter(|s| s.name == name) {
        if sym.kind == SymbolType::SolibTrampoline {
            trampoline.get_or_insert(sym);
        } else {
            return Some(sym);
        }
    }
    trampoline
}

/// Sort symbols by address, keeping input order among equal addresses.
pub fn sort_symbols(symbols: &mut [MinimalSymbol]) {
    symbols.sort_by_key(|s| s.addr);
}
