//! Image encoder
//!
//! Produces images with one code section, one symbol table and one
//! relocation section. Host tools and tests use it; the node itself only
//! ever decodes.

use super::{
    IMAGE_HEADER_SIZE, ImageHeader, LoadError, LoadResult, Relocation, RelocationKind,
    SECTION_SIZE, SHT_PROGBITS, SHT_RELA, SHT_SYMTAB, STB_GLOBAL, STB_LOCAL, STT_DFUNC, STT_FUNC,
    STT_OBJECT, Section, Symbol,
};
use crate::kernel::ModuleId;
use crate::kernel::fntable::{FunctionId, ModuleHeader, header};

pub const CODE_SECTION_ID: u16 = 1;
pub const SYMTAB_SECTION_ID: u16 = 2;
pub const RELA_SECTION_ID: u16 = 3;

/// Builder for a relocatable module image
#[derive(Debug, Clone, Default)]
pub struct ImageBuilder {
    code: Vec<u8>,
    symbols: Vec<Symbol>,
    relocations: Vec<Relocation>,
    header_symbol: u16,
}

impl ImageBuilder {
    /// Start from raw code section bytes
    pub fn new(code: Vec<u8>) -> Self {
        Self {
            code,
            ..Self::default()
        }
    }

    /// Code section holding `module` followed by `body`
    ///
    /// The `handler` and provided `ptr` fields of `module` are taken as byte
    /// offsets into the code section. They are encoded as zero and resolved
    /// by `R_AVR_16_PM` relocations at load time, the way a compiler leaves
    /// function pointers in initialized data.
    pub fn for_module(module: &ModuleHeader, body: &[u8]) -> Self {
        let mut blank = module.clone();
        blank.handler = 0;
        for rec in &mut blank.provided {
            rec.ptr = 0;
        }
        let mut code = blank.encode();
        code.extend_from_slice(body);

        let mut builder = Self::new(code);
        let header_sym = builder.local(0, STT_OBJECT);
        builder.header_symbol(header_sym);

        let handler = builder.function(module.handler);
        builder.relocate(
            header::HANDLER_OFFSET as u16,
            handler,
            0,
            RelocationKind::Abs16Pm,
        );
        let first_provided = module.subscribed.len();
        for (i, rec) in module.provided.iter().enumerate() {
            let sym = builder.function(rec.ptr);
            let site = header::fcb_ptr_offset(first_provided + i) as u16;
            builder.relocate(site, sym, 0, RelocationKind::Abs16Pm);
        }
        builder
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Add any symbol, returning its index
    pub fn symbol(&mut self, symbol: Symbol) -> u16 {
        self.symbols.push(symbol);
        (self.symbols.len() - 1) as u16
    }

    /// Global function at `offset` in the code section
    pub fn function(&mut self, offset: u16) -> u16 {
        self.symbol(Symbol::new(offset, STB_GLOBAL, STT_FUNC, CODE_SECTION_ID))
    }

    /// Local symbol at `offset` in the code section
    pub fn local(&mut self, offset: u16, sym_type: u8) -> u16 {
        self.symbol(Symbol::new(offset, STB_LOCAL, sym_type, CODE_SECTION_ID))
    }

    /// Function `fid` of module `pid`, resolved through the function table
    pub fn direct_function(&mut self, pid: ModuleId, fid: FunctionId) -> u16 {
        self.symbol(Symbol::new(
            u16::from(fid),
            STB_GLOBAL,
            STT_DFUNC,
            u16::from(pid),
        ))
    }

    /// Patch `offset` in the code section to refer to `symbol + addend`
    pub fn relocate(
        &mut self,
        offset: u16,
        symbol: u16,
        addend: i16,
        kind: RelocationKind,
    ) -> &mut Self {
        self.relocation(Relocation {
            offset,
            symbol,
            addend,
            kind: kind.code(),
        })
    }

    /// Add a raw record, including ones the loader will reject
    pub fn relocation(&mut self, relocation: Relocation) -> &mut Self {
        self.relocations.push(relocation);
        self
    }

    /// Symbol marking the module header
    pub fn header_symbol(&mut self, index: u16) -> &mut Self {
        self.header_symbol = index;
        self
    }

    /// Offset of the code section within built images
    pub fn code_offset() -> usize {
        IMAGE_HEADER_SIZE + 3 * SECTION_SIZE
    }

    /// Encode the image; every offset and size must fit a `u16`
    pub fn build(&self) -> LoadResult<Vec<u8>> {
        let field = |value: usize| {
            u16::try_from(value).map_err(|_| LoadError::Malformed {
                reason: "image larger than 64 KiB",
            })
        };
        let code_offset = Self::code_offset();
        let symtab_offset = code_offset + self.code.len();
        let symtab_size = self.symbols.len() * super::SYMBOL_SIZE;
        let rela_offset = symtab_offset + symtab_size;
        let rela_size = self.relocations.len() * super::RELOCATION_SIZE;
        field(rela_offset + rela_size)?;

        let sections = [
            Section {
                id: CODE_SECTION_ID,
                kind: SHT_PROGBITS,
                offset: field(code_offset)?,
                size: field(self.code.len())?,
                link: 0,
                info: 0,
            },
            Section {
                id: SYMTAB_SECTION_ID,
                kind: SHT_SYMTAB,
                offset: field(symtab_offset)?,
                size: field(symtab_size)?,
                link: 0,
                info: 0,
            },
            Section {
                id: RELA_SECTION_ID,
                kind: SHT_RELA,
                offset: field(rela_offset)?,
                size: field(rela_size)?,
                link: SYMTAB_SECTION_ID,
                info: CODE_SECTION_ID,
            },
        ];

        let mut out = Vec::with_capacity(rela_offset + rela_size);
        let header = ImageHeader {
            section_count: sections.len() as u16,
            header_symbol: self.header_symbol,
        };
        out.extend_from_slice(&header.encode());
        for section in &sections {
            out.extend_from_slice(&section.encode());
        }
        out.extend_from_slice(&self.code);
        for symbol in &self.symbols {
            out.extend_from_slice(&symbol.encode());
        }
        for relocation in &self.relocations {
            out.extend_from_slice(&relocation.encode());
        }
        Ok(out)
    }
}
