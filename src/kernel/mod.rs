//! The kernel - dynamic code management for a sensor node
//!
//! Four layers, leaves first:
//! - `codemem`: flash pages, allocation handles, the single-page write cache
//! - `fntable`: typed indirect call table joining modules
//! - `melf`: relocatable image format and the in-place loader
//! - `fetcher`: bitmap-tracked fragment transfer over the radio
//!
//! [`Node`] owns one of each and runs the cooperative message loop.

pub mod codemem;
pub mod config;
pub mod events;
pub mod fetcher;
pub mod fntable;
pub mod melf;
pub mod node;
pub mod timer;
pub mod trace;

pub use codemem::{CodeHandle, CodeKind, Codemem, CodememError, IoStatus};
pub use config::{Backoff, Config, ConfigError};
pub use events::{Message, Notification};
pub use fetcher::{FetchError, FetchOutcome, ModuleKey};
pub use fntable::{CallTarget, FunctionTable};
pub use melf::{ImageBuilder, LoadError, LoadedModule};
pub use node::{Node, NodeError, NodeResult};
pub use trace::{NodeStats, TraceCategory, Tracer};

/// Module (process) identifier
pub type ModuleId = u8;

/// The kernel's own identity as a requester
pub const KERNEL_PID: ModuleId = 0;
