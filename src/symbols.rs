//! Symbol resolution from ELF symbol tables.

use std::ops::Deref;

use object::{Object, ObjectSymbol, SymbolKind};

use crate::frame::{Frame, ModuleRef, Symbol};
use crate::module::{Module, ModuleMap};

#[derive(Clone, Debug, PartialEq, Eq)]
struct SymbolEntry {
    start: u64,
    size: u64,
    name: String,
}

/// The function symbols of one module, sorted by start address (SVMA).
#[derive(Clone, Debug, Default)]
pub struct SymbolTable {
    entries: Vec<SymbolEntry>,
}

impl SymbolTable {
    /// Read `.symtab`, or `.dynsym` if the binary has been stripped.
    pub fn from_object<'data>(file: &object::File<'data>) -> Self {
        let mut table = Self::from_symbols(file.symbols());
        if table.is_empty() {
            table = Self::from_symbols(file.dynamic_symbols());
        }
        table
    }

    fn from_symbols<'data, 'file>(
        symbols: impl Iterator<Item = object::Symbol<'data, 'file>>,
    ) -> Self
    where
        'data: 'file,
    {
        Self::new(
            symbols
                .filter(|s| s.kind() == SymbolKind::Text && s.is_definition() && s.address() != 0)
                .filter_map(|s| Some((s.address(), s.size(), s.name().ok()?.to_string()))),
        )
    }

    /// Build a table from `(start, size, name)` triples. Names are demangled.
    pub fn new(symbols: impl IntoIterator<Item = (u64, u64, String)>) -> Self {
        let mut entries: Vec<SymbolEntry> = symbols
            .into_iter()
            .map(|(start, size, name)| SymbolEntry {
                start,
                size,
                name: format!("{:#}", rustc_demangle::demangle(&name)),
            })
            .collect();
        // Aliases share a start address; keep the one with the largest size.
        entries.sort_by(|a, b| a.start.cmp(&b.start).then(b.size.cmp(&a.size)));
        entries.dedup_by_key(|e| e.start);
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the symbol covering `svma`. Returns its name and start address.
    pub fn lookup(&self, svma: u64) -> Option<(&str, u64)> {
        let index = match self.entries.binary_search_by_key(&svma, |e| e.start) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        let entry = &self.entries[index];
        if entry.size != 0 && svma - entry.start >= entry.size {
            return None;
        }
        Some((&entry.name, entry.start))
    }
}

impl<D: Deref<Target = [u8]>> Module<D> {
    /// Resolve the symbol covering `svma`. The offset is relative to the symbol start.
    pub fn resolve_symbol(&self, svma: u64) -> Option<Symbol> {
        let (name, start) = self.symbols().lookup(svma)?;
        Some(Symbol {
            name: name.to_string(),
            offset: svma - start,
        })
    }
}

/// Attach module and symbol information to `frames`. Frames outside any known module
/// keep `None` for both.
pub fn symbolicate<D: Deref<Target = [u8]>>(frames: &mut [Frame], modules: &ModuleMap<D>) {
    for frame in frames {
        let lookup_address = frame.frame_address().address_for_lookup();
        let Some(module) = modules.find(lookup_address) else {
            continue;
        };
        frame.set_module(Some(ModuleRef {
            path: module.path().to_string(),
            base: module.bias(),
        }));
        let lookup_svma = module.svma_for_avma(lookup_address);
        let symbol = module.symbols().lookup(lookup_svma).map(|(name, start)| Symbol {
            name: name.to_string(),
            offset: module.svma_for_avma(frame.address()).wrapping_sub(start),
        });
        frame.set_symbol(symbol);
    }
}
