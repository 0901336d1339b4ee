//! Platform Abstraction Layer
//!
//! The code-management core never touches hardware directly. Flash and the
//! radio are collaborators reached through the traits below, so the same
//! kernel runs against real drivers on a node and against the simulated
//! devices in [`sim`] on a host.
//!
//! - Flash: page erase, program, read (slow operations are surfaced to the
//!   kernel as split-phase completions, see `kernel::events`)
//! - Radio: best-effort link-layer send to a neighbour address

pub mod sim;

/// Result type for platform operations
pub type PlatformResult<T> = Result<T, PlatformError>;

/// Link-layer address of a node
pub type NodeAddr = u16;

/// Broadcast address on the link layer
pub const BROADCAST_ADDR: NodeAddr = 0xFFFF;

/// Platform-specific errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    /// Address range lies outside the device
    OutOfRange { addr: u32, len: usize },
    /// Program attempted on a page that was not erased
    NotErased { addr: u32 },
    /// Radio could not queue the frame
    SendFailed(String),
}

impl std::fmt::Display for PlatformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlatformError::OutOfRange { addr, len } => {
                write!(f, "flash range {:#x}+{} out of range", addr, len)
            }
            PlatformError::NotErased { addr } => {
                write!(f, "flash at {:#x} not erased before program", addr)
            }
            PlatformError::SendFailed(s) => write!(f, "send failed: {}", s),
        }
    }
}

impl std::error::Error for PlatformError {}

/// Raw flash primitives
///
/// Addresses are absolute device byte addresses. `erase_page` sets a whole
/// page to `0xFF`; `program` may only clear bits, so callers erase first.
pub trait FlashDevice {
    /// Device page size in bytes
    fn page_size(&self) -> usize;

    /// First byte address covered by the device
    fn base_addr(&self) -> u32;

    /// Total device size in bytes
    fn size(&self) -> usize;

    /// Erase the page starting at `addr`
    fn erase_page(&mut self, addr: u32) -> PlatformResult<()>;

    /// Program `data` at `addr`
    fn program(&mut self, addr: u32, data: &[u8]) -> PlatformResult<()>;

    /// Read `buf.len()` bytes at `addr`
    fn read(&self, addr: u32, buf: &mut [u8]) -> PlatformResult<()>;
}

/// Link-layer send
pub trait Radio {
    /// Address of this node
    fn local_addr(&self) -> NodeAddr;

    /// Queue a frame for `dest`. Delivery is not guaranteed.
    fn send(&mut self, dest: NodeAddr, frame: Vec<u8>) -> PlatformResult<()>;
}
