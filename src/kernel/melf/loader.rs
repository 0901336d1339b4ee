//! Relocating loader
//!
//! Works in place on an image already written into a code allocation:
//! parse the section table, patch every relocation site, flush, register
//! the module header with the function table and only then mark the
//! allocation executable.
//!
//! Direct-function relocations bake a provider's entry address into the
//! code. The providers used that way are recorded on the new module's table
//! entry so they cannot be removed underneath it.

use super::{
    IMAGE_HEADER_SIZE, ImageHeader, LoadError, LoadResult, RELOCATION_SIZE, Relocation,
    RelocationKind, SECTION_SIZE, SHT_PROGBITS, SHT_RELA, SHT_SYMTAB, SYMBOL_SIZE, Section,
    Symbol,
};
use crate::kernel::codemem::{CodeHandle, Codemem};
use crate::kernel::fntable::{FunctionTable, ModuleEntry};
use crate::kernel::{KERNEL_PID, ModuleId};
use crate::platform::FlashDevice;

/// A successfully loaded module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedModule {
    pub pid: ModuleId,
    pub handle: CodeHandle,
    /// Flash byte address of the module header
    pub header_addr: u32,
    /// Flash byte address of the code section
    pub code_addr: u32,
    /// Relocation records applied
    pub relocations: usize,
    /// Provided plus subscribed function control blocks
    pub function_count: usize,
}

/// Relocate, register and activate the image held by `handle`
///
/// On any error the allocation is freed and nothing is registered.
pub fn load<F: FlashDevice>(
    codemem: &mut Codemem<F>,
    fntable: &mut FunctionTable,
    handle: CodeHandle,
) -> LoadResult<LoadedModule> {
    let result = load_in_place(codemem, fntable, handle);
    if result.is_err() && codemem.is_live(handle) {
        // Freeing a live handle cannot fail
        let _ = codemem.free(handle);
    }
    result
}

fn load_in_place<F: FlashDevice>(
    codemem: &mut Codemem<F>,
    fntable: &mut FunctionTable,
    handle: CodeHandle,
) -> LoadResult<LoadedModule> {
    let image = Image::parse(codemem, handle)?;

    let count = image.relocation_count();
    let mut direct = Vec::new();
    for index in 0..count {
        if let Some(provider) = image.apply(codemem, fntable, index)? {
            direct.push(provider);
        }
    }

    let header_offset = image.header_offset(codemem)?;
    codemem.flush(handle, KERNEL_PID)?;
    let pid = fntable.register_module(codemem, handle, header_offset)?;
    fntable.bind_direct(pid, &direct)?;
    let function_count = fntable.module(pid).map_or(0, ModuleEntry::function_count);
    if let Err(e) = codemem.mark_executable(handle) {
        let _ = fntable.remove_all(pid);
        return Err(e.into());
    }

    Ok(LoadedModule {
        pid,
        handle,
        header_addr: image.start + header_offset as u32,
        code_addr: image.code_base(),
        relocations: count as usize,
        function_count,
    })
}

/// Parsed section layout of an image
struct Image {
    handle: CodeHandle,
    /// Flash address of the allocation
    start: u32,
    header: ImageHeader,
    /// PROGBITS sections; the only ones symbols may point into
    progbits: Vec<Section>,
    code: Section,
    symtab: Section,
    rela: Option<Section>,
}

impl Image {
    fn parse<F: FlashDevice>(codemem: &mut Codemem<F>, handle: CodeHandle) -> LoadResult<Self> {
        let alloc = codemem.info(handle)?;
        let size = alloc.size as usize;
        if size < IMAGE_HEADER_SIZE {
            return Err(LoadError::Malformed {
                reason: "image shorter than its header",
            });
        }

        let header = ImageHeader::decode(read_record(codemem, handle, 0)?);
        let table_end = IMAGE_HEADER_SIZE + header.section_count as usize * SECTION_SIZE;
        if header.section_count == 0 || table_end > size {
            return Err(LoadError::Malformed {
                reason: "section table runs past the image",
            });
        }

        let mut sections = Vec::with_capacity(header.section_count as usize);
        for i in 0..header.section_count as usize {
            let offset = IMAGE_HEADER_SIZE + i * SECTION_SIZE;
            let section = Section::decode(read_record(codemem, handle, offset)?);
            if section.end() > size {
                return Err(LoadError::Malformed {
                    reason: "section runs past the image",
                });
            }
            sections.push(section);
        }

        // The RELA section names its code and symbol sections; without one
        // take the first of each kind.
        let rela = sections.iter().find(|s| s.kind == SHT_RELA).copied();
        let find = |kind: u16, id: Option<u16>| {
            sections
                .iter()
                .find(|s| s.kind == kind && id.is_none_or(|id| s.id == id))
                .copied()
        };
        let code = find(SHT_PROGBITS, rela.map(|r| r.info))
            .ok_or(LoadError::MissingSection { kind: "code" })?;
        let symtab = find(SHT_SYMTAB, rela.map(|r| r.link)).ok_or(LoadError::MissingSection {
            kind: "symbol table",
        })?;

        if code.offset % 2 != 0 {
            return Err(LoadError::Malformed {
                reason: "code section not word aligned",
            });
        }
        if symtab.size as usize % SYMBOL_SIZE != 0 {
            return Err(LoadError::Malformed {
                reason: "symbol table size is not a whole number of entries",
            });
        }
        if rela.is_some_and(|r| r.size as usize % RELOCATION_SIZE != 0) {
            return Err(LoadError::Malformed {
                reason: "relocation section size is not a whole number of entries",
            });
        }

        let progbits = sections
            .iter()
            .filter(|s| s.kind == SHT_PROGBITS)
            .copied()
            .collect();

        Ok(Self {
            handle,
            start: alloc.start_addr,
            header,
            progbits,
            code,
            symtab,
            rela,
        })
    }

    fn code_base(&self) -> u32 {
        self.start + u32::from(self.code.offset)
    }

    fn symbol_count(&self) -> u16 {
        (self.symtab.size as usize / SYMBOL_SIZE) as u16
    }

    fn relocation_count(&self) -> u16 {
        self.rela
            .map_or(0, |r| (r.size as usize / RELOCATION_SIZE) as u16)
    }

    fn section(&self, id: u16) -> Option<&Section> {
        self.progbits.iter().find(|s| s.id == id)
    }

    fn symbol<F: FlashDevice>(&self, codemem: &mut Codemem<F>, index: u16) -> LoadResult<Symbol> {
        let count = self.symbol_count();
        if index >= count {
            return Err(LoadError::SymbolOutOfRange { index, count });
        }
        let offset = self.symtab.offset as usize + index as usize * SYMBOL_SIZE;
        Ok(Symbol::decode(read_record(codemem, self.handle, offset)?))
    }

    /// Byte offset within the allocation of a local symbol
    fn local_offset(&self, index: u16, symbol: &Symbol) -> LoadResult<u32> {
        let foreign = LoadError::ForeignSymbol {
            index,
            section_id: symbol.section_id,
        };
        if symbol.is_direct_function() {
            return Err(foreign);
        }
        let section = self.section(symbol.section_id).ok_or(foreign)?;
        if symbol.value > section.size {
            return Err(LoadError::Malformed {
                reason: "symbol lies outside its section",
            });
        }
        Ok(u32::from(section.offset) + u32::from(symbol.value))
    }

    /// Absolute address a relocation against `index` resolves to, and the
    /// provider it lands in for direct functions
    fn target<F: FlashDevice>(
        &self,
        codemem: &mut Codemem<F>,
        fntable: &FunctionTable,
        index: u16,
        addend: i16,
    ) -> LoadResult<(u32, Option<ModuleId>)> {
        let symbol = self.symbol(codemem, index)?;
        let mut provider = None;
        let base = if symbol.is_direct_function() {
            let unresolved = LoadError::UnresolvedFunction {
                pid: symbol.section_id,
                fid: symbol.value,
            };
            let pid = ModuleId::try_from(symbol.section_id).map_err(|_| unresolved.clone())?;
            let fid = u8::try_from(symbol.value).map_err(|_| unresolved.clone())?;
            provider = Some(pid);
            fntable.lookup(pid, fid).ok_or(unresolved)?
        } else {
            self.start + self.local_offset(index, &symbol)?
        };

        let target =
            u32::try_from(i64::from(base) + i64::from(addend)).map_err(|_| LoadError::Malformed {
                reason: "relocation target below address zero",
            })?;
        Ok((target, provider))
    }

    /// Apply relocation record `index`; returns the provider of a direct call
    fn apply<F: FlashDevice>(
        &self,
        codemem: &mut Codemem<F>,
        fntable: &FunctionTable,
        index: u16,
    ) -> LoadResult<Option<ModuleId>> {
        let Some(rela) = self.rela else {
            return Ok(None);
        };
        let at = rela.offset as usize + index as usize * RELOCATION_SIZE;
        let record = Relocation::decode(read_record(codemem, self.handle, at)?);

        let kind = RelocationKind::from_u8(record.kind).ok_or(LoadError::UnknownRelocation {
            index,
            code: record.kind,
        })?;
        let width = kind.width();
        if record.offset as usize + width > self.code.size as usize {
            return Err(LoadError::SiteOutOfRange {
                offset: record.offset,
                width,
            });
        }

        let (target, provider) = self.target(codemem, fntable, record.symbol, record.addend)?;

        let site = self.code.offset as usize + record.offset as usize;
        let mut insn = [0u8; 4];
        codemem.read(self.handle, KERNEL_PID, &mut insn[..width], site)?;
        let pc = self.code_base() + u32::from(record.offset);
        let patched = kind
            .patch(target, pc, insn)
            .map_err(|error| LoadError::Patch {
                offset: record.offset,
                kind,
                error,
            })?;
        codemem.write(self.handle, KERNEL_PID, &patched[..width], site)?;
        Ok(provider)
    }

    /// Byte offset within the allocation of the module header
    fn header_offset<F: FlashDevice>(&self, codemem: &mut Codemem<F>) -> LoadResult<usize> {
        let index = self.header.header_symbol;
        let symbol = self.symbol(codemem, index)?;
        Ok(self.local_offset(index, &symbol)? as usize)
    }
}

fn read_record<F: FlashDevice, const N: usize>(
    codemem: &mut Codemem<F>,
    handle: CodeHandle,
    offset: usize,
) -> LoadResult<[u8; N]> {
    let mut buf = [0u8; N];
    codemem.read(handle, KERNEL_PID, &mut buf, offset)?;
    Ok(buf)
}
