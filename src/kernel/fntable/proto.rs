//! Function prototypes and error stubs
//!
//! A prototype is four bytes: return type, first two argument types, and
//! the argument count as an ASCII digit, e.g. `b"sCv1"` is
//! `int16_t f(uint8_t)`.

use std::fmt;

/// Errno-style code every stub returns
pub const STUB_ERROR: i32 = -22;

/// One type letter of a prototype
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoType {
    Void,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Pointer,
}

impl ProtoType {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            b'v' => Self::Void,
            b'c' => Self::Int8,
            b'C' => Self::UInt8,
            b's' => Self::Int16,
            b'S' => Self::UInt16,
            b'l' => Self::Int32,
            b'L' => Self::UInt32,
            b'y' | b'*' => Self::Pointer,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Void => b'v',
            Self::Int8 => b'c',
            Self::UInt8 => b'C',
            Self::Int16 => b's',
            Self::UInt16 => b'S',
            Self::Int32 => b'l',
            Self::UInt32 => b'L',
            Self::Pointer => b'y',
        }
    }
}

/// Compact calling-convention signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Proto(pub [u8; 4]);

impl Proto {
    pub fn new(ret: ProtoType, arg0: ProtoType, arg1: ProtoType, argc: u8) -> Self {
        Self([ret.code(), arg0.code(), arg1.code(), b'0' + argc.min(9)])
    }

    /// Check every letter; returns the return type
    pub fn validate(&self) -> Option<ProtoType> {
        let ret = ProtoType::from_code(self.0[0])?;
        ProtoType::from_code(self.0[1])?;
        ProtoType::from_code(self.0[2])?;
        self.0[3].is_ascii_digit().then_some(ret)
    }

    pub fn return_type(&self) -> Option<ProtoType> {
        ProtoType::from_code(self.0[0])
    }

    pub fn arg_count(&self) -> u8 {
        self.0[3].wrapping_sub(b'0')
    }

    /// Stub used while a subscription with this prototype is unresolved
    pub fn stub(&self) -> StubKind {
        match self.return_type() {
            Some(ProtoType::Void) | None => StubKind::Void,
            Some(ProtoType::Int8 | ProtoType::UInt8) => StubKind::Ret8,
            Some(ProtoType::Int16 | ProtoType::UInt16) => StubKind::Ret16,
            Some(ProtoType::Int32 | ProtoType::UInt32) => StubKind::Ret32,
            Some(ProtoType::Pointer) => StubKind::RetPointer,
        }
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Typed error stub, one per return width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubKind {
    Void,
    Ret8,
    Ret16,
    Ret32,
    RetPointer,
}

impl StubKind {
    /// Raw return register contents of a stub call, `None` for void
    ///
    /// Integer stubs return [`STUB_ERROR`] truncated to their width,
    /// pointer stubs return null.
    pub fn error_return(self) -> Option<u32> {
        let err = STUB_ERROR as u32;
        match self {
            Self::Void => None,
            Self::Ret8 => Some(err & 0xFF),
            Self::Ret16 => Some(err & 0xFFFF),
            Self::Ret32 => Some(err),
            Self::RetPointer => Some(0),
        }
    }
}

/// Where a call through a function control block goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    /// Flash byte address of the provider's entry point
    Entry(u32),
    /// Not linked; calls fail with the stub's error
    Stub(StubKind),
}

impl CallTarget {
    pub fn is_linked(&self) -> bool {
        matches!(self, Self::Entry(_))
    }
}
