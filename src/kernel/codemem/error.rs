//! Code memory errors

use crate::platform::PlatformError;
use std::fmt;

/// Result type for code memory operations
pub type CodememResult<T> = Result<T, CodememError>;

/// Errors returned by the code memory manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodememError {
    /// No run of free pages is large enough
    NoSpace { requested: u16 },
    /// Every allocation table entry is in use
    TableFull,
    /// Handle is malformed, freed, or from a reused slot
    StaleHandle { handle: u16 },
    /// Access beyond the end of the allocation
    OutOfBounds { offset: usize, len: usize, size: u16 },
    /// Zero-sized or oversized request
    InvalidSize,
    /// `mark_executable` on a non-executable allocation
    NotExecutable,
    /// Allocation still has unflushed bytes in the write cache
    Unflushed,
    /// Flash device geometry does not match the configuration
    Geometry(&'static str),
    /// Underlying flash operation failed
    Flash(PlatformError),
}

impl CodememError {
    /// Exhaustion errors go away if the caller backs off and retries
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NoSpace { .. } | Self::TableFull)
    }
}

impl fmt::Display for CodememError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSpace { requested } => {
                write!(f, "no free flash run for {} bytes", requested)
            }
            Self::TableFull => write!(f, "allocation table full"),
            Self::StaleHandle { handle } => write!(f, "stale code handle {:#06x}", handle),
            Self::OutOfBounds { offset, len, size } => write!(
                f,
                "access {}+{} beyond allocation of {} bytes",
                offset, len, size
            ),
            Self::InvalidSize => write!(f, "invalid allocation size"),
            Self::NotExecutable => write!(f, "allocation is not of executable kind"),
            Self::Unflushed => write!(f, "allocation has unflushed writes"),
            Self::Geometry(reason) => write!(f, "flash geometry mismatch: {}", reason),
            Self::Flash(e) => write!(f, "flash error: {}", e),
        }
    }
}

impl std::error::Error for CodememError {}

impl From<PlatformError> for CodememError {
    fn from(e: PlatformError) -> Self {
        Self::Flash(e)
    }
}
