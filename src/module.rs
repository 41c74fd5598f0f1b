use std::fmt::Debug;
use std::ops::{Deref, Range};
use std::sync::OnceLock;

use object::{CompressionFormat, Object, ObjectSection};

use crate::dwarf::DwarfCfiIndex;
use crate::error::ModuleError;
use crate::symbols::SymbolTable;

/// The location of one section, both in the module's address space (SVMA) and in the
/// file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SectionInfo {
    pub svma: u64,
    pub file_range: Range<usize>,
}

/// The sections which matter for unwinding. `text_svma` and `got_svma` are needed to
/// resolve relative pointer encodings in `.eh_frame`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModuleSections {
    pub text_svma: Option<u64>,
    pub got_svma: Option<u64>,
    pub eh_frame: Option<SectionInfo>,
    pub eh_frame_hdr: Option<SectionInfo>,
    pub debug_frame: Option<SectionInfo>,
}

impl ModuleSections {
    fn from_object<'data>(file: &object::File<'data>) -> Self {
        let section_info = |name: &str| -> Option<SectionInfo> {
            let section = file.section_by_name(name)?;
            let compressed = section.compressed_file_range().ok()?;
            if compressed.format != CompressionFormat::None {
                log::debug!("Ignoring compressed section {name}");
                return None;
            }
            let start = usize::try_from(compressed.offset).ok()?;
            let len = usize::try_from(compressed.compressed_size).ok()?;
            Some(SectionInfo {
                svma: section.address(),
                file_range: start..start.checked_add(len)?,
            })
        };
        ModuleSections {
            text_svma: file.section_by_name(".text").map(|s| s.address()),
            got_svma: file.section_by_name(".got").map(|s| s.address()),
            eh_frame: section_info(".eh_frame"),
            eh_frame_hdr: section_info(".eh_frame_hdr"),
            debug_frame: section_info(".debug_frame"),
        }
    }
}

/// A loaded binary: the main executable or a shared library.
///
/// Addresses in the running process (AVMAs) and addresses in the binary's own address
/// space (SVMAs) differ by `bias`: avma = svma + bias.
pub struct Module<D: Deref<Target = [u8]>> {
    path: String,
    avma_range: Range<u64>,
    bias: u64,
    data: D,
    sections: ModuleSections,
    eh_frame_index: Option<Result<DwarfCfiIndex, gimli::Error>>,
    debug_frame_index: Option<Result<DwarfCfiIndex, gimli::Error>>,
    symbols: OnceLock<SymbolTable>,
}

impl<D: Deref<Target = [u8]>> Debug for Module<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("path", &self.path)
            .field("avma_range", &self.avma_range)
            .field("bias", &self.bias)
            .finish()
    }
}

impl<D: Deref<Target = [u8]>> Module<D> {
    /// Create a module from the contents of an ELF file.
    pub fn from_elf(
        path: String,
        avma_range: Range<u64>,
        bias: u64,
        data: D,
    ) -> Result<Self, ModuleError> {
        let sections = {
            let file = object::File::parse(&*data).map_err(|source| ModuleError::Object {
                path: path.clone().into(),
                source,
            })?;
            ModuleSections::from_object(&file)
        };
        Ok(Self::from_sections(path, avma_range, bias, data, sections))
    }

    /// Create a module whose section locations are already known.
    pub fn from_sections(
        path: String,
        avma_range: Range<u64>,
        bias: u64,
        data: D,
        sections: ModuleSections,
    ) -> Self {
        let mut module = Self {
            path,
            avma_range,
            bias,
            data,
            sections,
            eh_frame_index: None,
            debug_frame_index: None,
            symbols: OnceLock::new(),
        };
        // With .eh_frame_hdr, the lookup table is already part of the binary.
        if module.sections.eh_frame_hdr.is_none() {
            if let Some(eh_frame_data) = module.eh_frame_data() {
                let index = DwarfCfiIndex::try_new_eh_frame(eh_frame_data, &module.sections);
                if let Err(e) = &index {
                    log::warn!("Could not index .eh_frame of {}: {e}", module.path);
                }
                module.eh_frame_index = Some(index);
            }
        }
        if let Some(debug_frame_data) = module.debug_frame_data() {
            let index = DwarfCfiIndex::try_new_debug_frame(debug_frame_data, &module.sections);
            if let Err(e) = &index {
                log::warn!("Could not index .debug_frame of {}: {e}", module.path);
            }
            module.debug_frame_index = Some(index);
        }
        module
    }

    /// Attach a symbol table, replacing the one that would be read from the module's data.
    pub fn with_symbols(self, symbols: SymbolTable) -> Self {
        Self {
            symbols: OnceLock::from(symbols),
            ..self
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn avma_range(&self) -> Range<u64> {
        self.avma_range.clone()
    }

    /// The address at which the module is mapped, which is the AVMA of file offset 0.
    pub fn base_address(&self) -> u64 {
        self.avma_range.start
    }

    pub fn bias(&self) -> u64 {
        self.bias
    }

    pub fn svma_for_avma(&self, avma: u64) -> u64 {
        avma.wrapping_sub(self.bias)
    }

    pub fn avma_for_svma(&self, svma: u64) -> u64 {
        svma.wrapping_add(self.bias)
    }

    pub fn sections(&self) -> &ModuleSections {
        &self.sections
    }

    fn section_data(&self, section: &Option<SectionInfo>) -> Option<&[u8]> {
        let section = section.as_ref()?;
        self.data.get(section.file_range.clone())
    }

    pub fn eh_frame_data(&self) -> Option<&[u8]> {
        self.section_data(&self.sections.eh_frame)
    }

    pub fn eh_frame_hdr_data(&self) -> Option<&[u8]> {
        self.section_data(&self.sections.eh_frame_hdr)
    }

    pub fn debug_frame_data(&self) -> Option<&[u8]> {
        self.section_data(&self.sections.debug_frame)
    }

    pub fn eh_frame_index(&self) -> Option<&Result<DwarfCfiIndex, gimli::Error>> {
        self.eh_frame_index.as_ref()
    }

    pub fn debug_frame_index(&self) -> Option<&Result<DwarfCfiIndex, gimli::Error>> {
        self.debug_frame_index.as_ref()
    }

    /// Whether the module carries any call frame information at all.
    pub fn has_cfi(&self) -> bool {
        self.sections.eh_frame.is_some() || self.sections.debug_frame.is_some()
    }

    /// The module's symbol table, parsed on first use.
    pub fn symbols(&self) -> &SymbolTable {
        self.symbols
            .get_or_init(|| match object::File::parse(&*self.data) {
                Ok(file) => SymbolTable::from_object(&file),
                Err(e) => {
                    log::debug!("No symbols for {}: {e}", self.path);
                    SymbolTable::default()
                }
            })
    }
}

/// The modules of one process, sorted by start address.
pub struct ModuleMap<D: Deref<Target = [u8]>> {
    /// sorted by avma_range.start
    modules: Vec<Module<D>>,
    /// Bumped on every change, to invalidate cached unwind rules.
    generation: u16,
}

impl<D: Deref<Target = [u8]>> Default for ModuleMap<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Deref<Target = [u8]>> Debug for ModuleMap<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(&self.modules).finish()
    }
}

impl<D: Deref<Target = [u8]>> ModuleMap<D> {
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
            generation: 0,
        }
    }

    pub fn add_module(&mut self, module: Module<D>) {
        let insertion_index = match self
            .modules
            .binary_search_by_key(&module.avma_range.start, |module| module.avma_range.start)
        {
            Ok(i) => {
                log::warn!(
                    "Now we have two modules at the same start address 0x{:x}. This can't be good.",
                    module.avma_range.start
                );
                i
            }
            Err(i) => i,
        };
        self.modules.insert(insertion_index, module);
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn remove_module(&mut self, module_avma_range_start: u64) {
        if let Ok(index) = self
            .modules
            .binary_search_by_key(&module_avma_range_start, |module| {
                module.avma_range.start
            })
        {
            self.modules.remove(index);
            self.generation = self.generation.wrapping_add(1);
        };
    }

    pub fn generation(&self) -> u16 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Module<D>> {
        self.modules.iter()
    }

    /// The module whose mapping contains `avma`.
    pub fn find(&self, avma: u64) -> Option<&Module<D>> {
        let module_index = match self
            .modules
            .binary_search_by_key(&avma, |m| m.avma_range.start)
        {
            Ok(i) => i,
            Err(insertion_index) => {
                if insertion_index == 0 {
                    // avma is before first known module
                    return None;
                }
                let i = insertion_index - 1;
                if self.modules[i].avma_range.end <= avma {
                    // avma is after this module
                    return None;
                }
                i
            }
        };
        Some(&self.modules[module_index])
    }
}
