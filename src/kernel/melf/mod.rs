//! Mini relocatable object format
//!
//! A module image is one contiguous blob, written into a code allocation
//! before loading:
//!
//! ```text
//! +0   header         section_count u16, header_symbol u16
//! +4   section table  section_count x 12 bytes
//! ...  section bodies at the offsets the table gives
//! ```
//!
//! Every record field is big-endian on the wire. The code section holds the
//! module's machine code and its module header; addresses inside it stay
//! relative to the section start until the loader patches them.
//!
//! Design:
//! - Records are `bytemuck` Pod structs over byte arrays, so decoding is a
//!   copy plus `from_be_bytes` and there is no alignment to worry about
//! - The loader never stages the image in RAM; it reads records one at a
//!   time through the code memory manager
//! - Symbols address the image's own sections only, except direct-function
//!   symbols which name a `(pid, fid)` in the function table

mod builder;
mod error;
mod loader;
pub mod reloc;

pub use builder::ImageBuilder;
pub use error::{LoadError, LoadResult};
pub use loader::{LoadedModule, load};
pub use reloc::{PatchError, RelocationKind};

use bytemuck::{Pod, Zeroable};

// ============================================================================
// Constants
// ============================================================================

/// Section types
pub const SHT_PROGBITS: u16 = 1;
pub const SHT_SYMTAB: u16 = 2;
pub const SHT_RELA: u16 = 4;

/// Symbol types
pub const STT_NOTYPE: u8 = 0;
pub const STT_OBJECT: u8 = 1;
pub const STT_FUNC: u8 = 2;
/// Function provided by another module: `section_id` is its pid, `value`
/// its function id
pub const STT_DFUNC: u8 = 13;

/// Symbol bindings
pub const STB_LOCAL: u8 = 0;
pub const STB_GLOBAL: u8 = 1;

pub const IMAGE_HEADER_SIZE: usize = 4;
pub const SECTION_SIZE: usize = 12;
pub const SYMBOL_SIZE: usize = 5;
pub const RELOCATION_SIZE: usize = 7;

// ============================================================================
// Raw records
// ============================================================================

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RawImageHeader {
    section_count: [u8; 2],
    header_symbol: [u8; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RawSection {
    id: [u8; 2],
    kind: [u8; 2],
    offset: [u8; 2],
    size: [u8; 2],
    link: [u8; 2],
    info: [u8; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RawSymbol {
    value: [u8; 2],
    info: u8,
    section_id: [u8; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RawRelocation {
    offset: [u8; 2],
    symbol: [u8; 2],
    addend: [u8; 2],
    kind: u8,
}

// ============================================================================
// Decoded records
// ============================================================================

/// Image header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub section_count: u16,
    /// Symbol whose address is the module header
    pub header_symbol: u16,
}

impl ImageHeader {
    pub fn decode(bytes: [u8; IMAGE_HEADER_SIZE]) -> Self {
        let raw: RawImageHeader = bytemuck::cast(bytes);
        Self {
            section_count: u16::from_be_bytes(raw.section_count),
            header_symbol: u16::from_be_bytes(raw.header_symbol),
        }
    }

    pub fn encode(&self) -> [u8; IMAGE_HEADER_SIZE] {
        bytemuck::cast(RawImageHeader {
            section_count: self.section_count.to_be_bytes(),
            header_symbol: self.header_symbol.to_be_bytes(),
        })
    }
}

/// Section table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    pub id: u16,
    pub kind: u16,
    /// Byte offset from the start of the image
    pub offset: u16,
    pub size: u16,
    /// RELA: symbol table section id
    pub link: u16,
    /// RELA: section the records patch
    pub info: u16,
}

impl Section {
    pub fn decode(bytes: [u8; SECTION_SIZE]) -> Self {
        let raw: RawSection = bytemuck::cast(bytes);
        Self {
            id: u16::from_be_bytes(raw.id),
            kind: u16::from_be_bytes(raw.kind),
            offset: u16::from_be_bytes(raw.offset),
            size: u16::from_be_bytes(raw.size),
            link: u16::from_be_bytes(raw.link),
            info: u16::from_be_bytes(raw.info),
        }
    }

    pub fn encode(&self) -> [u8; SECTION_SIZE] {
        bytemuck::cast(RawSection {
            id: self.id.to_be_bytes(),
            kind: self.kind.to_be_bytes(),
            offset: self.offset.to_be_bytes(),
            size: self.size.to_be_bytes(),
            link: self.link.to_be_bytes(),
            info: self.info.to_be_bytes(),
        })
    }

    /// One past the last byte
    pub fn end(&self) -> usize {
        self.offset as usize + self.size as usize
    }
}

/// Symbol table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    pub value: u16,
    /// `binding << 4 | type`
    pub info: u8,
    pub section_id: u16,
}

impl Symbol {
    pub fn new(value: u16, binding: u8, sym_type: u8, section_id: u16) -> Self {
        Self {
            value,
            info: (binding << 4) | (sym_type & 0x0F),
            section_id,
        }
    }

    pub fn sym_type(&self) -> u8 {
        self.info & 0x0F
    }

    pub fn binding(&self) -> u8 {
        self.info >> 4
    }

    pub fn is_direct_function(&self) -> bool {
        self.sym_type() == STT_DFUNC
    }

    pub fn decode(bytes: [u8; SYMBOL_SIZE]) -> Self {
        let raw: RawSymbol = bytemuck::cast(bytes);
        Self {
            value: u16::from_be_bytes(raw.value),
            info: raw.info,
            section_id: u16::from_be_bytes(raw.section_id),
        }
    }

    pub fn encode(&self) -> [u8; SYMBOL_SIZE] {
        bytemuck::cast(RawSymbol {
            value: self.value.to_be_bytes(),
            info: self.info,
            section_id: self.section_id.to_be_bytes(),
        })
    }
}

/// Relocation record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// Patch site, relative to the code section
    pub offset: u16,
    pub symbol: u16,
    pub addend: i16,
    /// Raw type code, see [`RelocationKind`]
    pub kind: u8,
}

impl Relocation {
    pub fn decode(bytes: [u8; RELOCATION_SIZE]) -> Self {
        let raw: RawRelocation = bytemuck::cast(bytes);
        Self {
            offset: u16::from_be_bytes(raw.offset),
            symbol: u16::from_be_bytes(raw.symbol),
            addend: i16::from_be_bytes(raw.addend),
            kind: raw.kind,
        }
    }

    pub fn encode(&self) -> [u8; RELOCATION_SIZE] {
        bytemuck::cast(RawRelocation {
            offset: self.offset.to_be_bytes(),
            symbol: self.symbol.to_be_bytes(),
            addend: self.addend.to_be_bytes(),
            kind: self.kind,
        })
    }
}
