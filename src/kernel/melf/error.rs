//! Error types for the module loader

use super::reloc::{PatchError, RelocationKind};
use crate::kernel::ModuleId;
use crate::kernel::codemem::CodememError;
use crate::kernel::fntable::FntableError;
use std::fmt;

/// Result type for loader operations
pub type LoadResult<T> = Result<T, LoadError>;

/// Reasons a module image is rejected
///
/// Every variant aborts the load; the image's allocation has been freed by
/// the time the caller sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// Records are truncated or point outside the image
    Malformed { reason: &'static str },

    /// A required section is absent
    MissingSection { kind: &'static str },

    /// Relocation type this loader does not implement
    UnknownRelocation { index: u16, code: u8 },

    /// Relocation or header names a symbol past the end of the table
    SymbolOutOfRange { index: u16, count: u16 },

    /// Symbol lives in a section the image does not own
    ForeignSymbol { index: u16, section_id: u16 },

    /// Direct-function symbol whose provider is not loaded
    UnresolvedFunction { pid: u16, fid: u16 },

    /// Patch site lies outside the code section
    SiteOutOfRange { offset: u16, width: usize },

    /// Target does not fit the instruction
    Patch {
        offset: u16,
        kind: RelocationKind,
        error: PatchError,
    },

    /// Module ID already in use
    Duplicate { pid: ModuleId },

    /// Code memory refused an access
    Codemem(CodememError),

    /// Header could not be registered
    Register(FntableError),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed { reason } => write!(f, "malformed image: {}", reason),
            Self::MissingSection { kind } => write!(f, "image has no {} section", kind),
            Self::UnknownRelocation { index, code } => {
                write!(f, "relocation {}: unknown type {}", index, code)
            }
            Self::SymbolOutOfRange { index, count } => {
                write!(f, "symbol {} out of range ({} symbols)", index, count)
            }
            Self::ForeignSymbol { index, section_id } => {
                write!(f, "symbol {} refers to foreign section {}", index, section_id)
            }
            Self::UnresolvedFunction { pid, fid } => {
                write!(f, "direct function {}:{} is not loaded", pid, fid)
            }
            Self::SiteOutOfRange { offset, width } => {
                write!(f, "patch site {:#06x}+{} outside code", offset, width)
            }
            Self::Patch {
                offset,
                kind,
                error,
            } => write!(f, "{} at {:#06x}: {}", kind, offset, error),
            Self::Duplicate { pid } => write!(f, "module {} is already loaded", pid),
            Self::Codemem(e) => write!(f, "code memory: {}", e),
            Self::Register(e) => write!(f, "register: {}", e),
        }
    }
}

impl std::error::Error for LoadError {}

impl From<CodememError> for LoadError {
    fn from(e: CodememError) -> Self {
        Self::Codemem(e)
    }
}

impl From<FntableError> for LoadError {
    fn from(e: FntableError) -> Self {
        match e {
            FntableError::AlreadyRegistered(pid) => Self::Duplicate { pid },
            FntableError::Codemem(e) => Self::Codemem(e),
            other => Self::Register(other),
        }
    }
}
