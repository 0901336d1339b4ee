//! Function Table / Linker
//!
//! Joins modules through indirect calls. Each module declares the functions
//! it provides and the functions it subscribes to; calls go through a
//! function control block (FCB) that holds either the provider's entry
//! address or a typed error stub.
//!
//! Design principles:
//! - Table state lives in RAM, keyed by module ID; flash is only read to
//!   pick up a module's header when it registers
//! - A subscriber never holds a dangling address: removing a provider turns
//!   every subscription to it back into a stub immediately
//! - Linking is re-run after any module load, removal or restart, so a
//!   provider that comes back is picked up without touching the subscriber
//! - A prototype mismatch is not an error, the subscription stays stubbed
//! - Direct calls patched in at load time cannot be stubbed, so a provider
//!   with direct callers cannot be removed until they are

pub mod header;
pub mod proto;

pub use header::{FcbRecord, ModuleHeader};
pub use proto::{CallTarget, Proto, ProtoType, StubKind};

use super::codemem::{CodeHandle, Codemem, CodememError};
use super::{KERNEL_PID, ModuleId};
use crate::platform::FlashDevice;
use std::collections::BTreeMap;
use std::fmt;

/// Function identifier, unique within a provider
pub type FunctionId = u8;

/// Result type for function table operations
pub type FntableResult<T> = Result<T, FntableError>;

/// Function table errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FntableError {
    /// No module with this ID is registered
    NoSuchModule(ModuleId),
    /// A module with this ID is already registered
    AlreadyRegistered(ModuleId),
    /// Subscription slot does not exist
    BadIndex { pid: ModuleId, index: usize },
    /// Header in flash is malformed
    BadHeader(&'static str),
    /// Prototype contains an unknown type letter
    BadProto([u8; 4]),
    /// Other modules hold direct calls into this one
    InUse { pid: ModuleId, dependent: ModuleId },
    /// Reading the header failed
    Codemem(CodememError),
}

impl fmt::Display for FntableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSuchModule(pid) => write!(f, "module {} not registered", pid),
            Self::AlreadyRegistered(pid) => write!(f, "module {} already registered", pid),
            Self::BadIndex { pid, index } => {
                write!(f, "module {} has no subscription slot {}", pid, index)
            }
            Self::BadHeader(reason) => write!(f, "bad module header: {}", reason),
            Self::BadProto(p) => write!(f, "bad prototype {:?}", String::from_utf8_lossy(p)),
            Self::InUse { pid, dependent } => {
                write!(f, "module {} is called directly by module {}", pid, dependent)
            }
            Self::Codemem(e) => write!(f, "reading module header: {}", e),
        }
    }
}

impl std::error::Error for FntableError {}

impl From<CodememError> for FntableError {
    fn from(e: CodememError) -> Self {
        Self::Codemem(e)
    }
}

/// Function control block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionControlBlock {
    pub ptr: CallTarget,
    pub proto: Proto,
    /// Provider module
    pub pid: ModuleId,
    pub fid: FunctionId,
}

/// A registered module
#[derive(Debug, Clone)]
pub struct ModuleEntry {
    pub pid: ModuleId,
    /// Allocation holding the module's code
    pub handle: CodeHandle,
    /// Flash byte address of the header
    pub header_addr: u32,
    /// Flash byte address of the message handler
    pub handler_addr: u32,
    pub provided: Vec<FunctionControlBlock>,
    pub subscribed: Vec<FunctionControlBlock>,
    /// Providers whose entry points were patched into this module's code
    pub direct: Vec<ModuleId>,
}

impl ModuleEntry {
    /// Provided plus subscribed function control blocks
    pub fn function_count(&self) -> usize {
        self.provided.len() + self.subscribed.len()
    }
}

/// Outcome of a linking pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkReport {
    /// Subscriptions now pointing at a provider
    pub resolved: usize,
    /// Subscriptions left on a stub
    pub stubbed: usize,
    /// Stubbed because the provider's prototype differs
    pub mismatched: usize,
}

impl LinkReport {
    fn merge(&mut self, other: LinkReport) {
        self.resolved += other.resolved;
        self.stubbed += other.stubbed;
        self.mismatched += other.mismatched;
    }
}

/// The function table
#[derive(Debug, Default)]
pub struct FunctionTable {
    modules: BTreeMap<ModuleId, ModuleEntry>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the module whose header is at `header_offset` in `handle`
    ///
    /// Subscriptions start stubbed; run [`link_subscribed_functions`]
    /// (or [`relink_all`]) afterwards.
    ///
    /// [`link_subscribed_functions`]: Self::link_subscribed_functions
    /// [`relink_all`]: Self::relink_all
    pub fn register_module<F: FlashDevice>(
        &mut self,
        codemem: &mut Codemem<F>,
        handle: CodeHandle,
        header_offset: usize,
    ) -> FntableResult<ModuleId> {
        let mut fixed = [0u8; ModuleHeader::FIXED_SIZE];
        codemem.read(handle, KERNEL_PID, &mut fixed, header_offset)?;

        let len = ModuleHeader::FIXED_SIZE + ModuleHeader::block_count(&fixed) * header::FCB_SIZE;
        let mut bytes = vec![0u8; len];
        codemem.read(handle, KERNEL_PID, &mut bytes, header_offset)?;
        let header = ModuleHeader::decode(&bytes)?;

        if self.modules.contains_key(&header.pid) {
            return Err(FntableError::AlreadyRegistered(header.pid));
        }

        let header_addr = codemem.start_addr(handle)? + header_offset as u32;
        let entry = ModuleEntry {
            pid: header.pid,
            handle,
            header_addr,
            handler_addr: u32::from(header.handler) << 1,
            provided: header
                .provided
                .iter()
                .map(|rec| FunctionControlBlock {
                    ptr: CallTarget::Entry(u32::from(rec.ptr) << 1),
                    proto: rec.proto,
                    pid: header.pid,
                    fid: rec.fid,
                })
                .collect(),
            subscribed: header
                .subscribed
                .iter()
                .map(|rec| FunctionControlBlock {
                    ptr: CallTarget::Stub(rec.proto.stub()),
                    proto: rec.proto,
                    pid: rec.pid,
                    fid: rec.fid,
                })
                .collect(),
            direct: Vec::new(),
        };

        let pid = header.pid;
        self.modules.insert(pid, entry);
        Ok(pid)
    }

    /// Point subscription slot `table_index` of `subscriber` at
    /// `(provider, fid)` and try to resolve it right away
    pub fn subscribe(
        &mut self,
        subscriber: ModuleId,
        provider: ModuleId,
        fid: FunctionId,
        table_index: usize,
    ) -> FntableResult<CallTarget> {
        let proto = {
            let slot = self
                .modules
                .get_mut(&subscriber)
                .ok_or(FntableError::NoSuchModule(subscriber))?
                .subscribed
                .get_mut(table_index)
                .ok_or(FntableError::BadIndex {
                    pid: subscriber,
                    index: table_index,
                })?;
            slot.pid = provider;
            slot.fid = fid;
            slot.proto
        };

        let (target, _) = self.resolve(provider, fid, &proto);
        if let Some(slot) = self
            .modules
            .get_mut(&subscriber)
            .and_then(|m| m.subscribed.get_mut(table_index))
        {
            slot.ptr = target;
        }
        Ok(target)
    }

    /// Resolve every subscription of `pid` against the live providers
    pub fn link_subscribed_functions(&mut self, pid: ModuleId) -> FntableResult<LinkReport> {
        let wanted: Vec<(ModuleId, FunctionId, Proto)> = self
            .modules
            .get(&pid)
            .ok_or(FntableError::NoSuchModule(pid))?
            .subscribed
            .iter()
            .map(|s| (s.pid, s.fid, s.proto))
            .collect();

        let mut report = LinkReport::default();
        let mut targets = Vec::with_capacity(wanted.len());
        for (provider, fid, proto) in wanted {
            let (target, mismatch) = self.resolve(provider, fid, &proto);
            if target.is_linked() {
                report.resolved += 1;
            } else {
                report.stubbed += 1;
            }
            if mismatch {
                report.mismatched += 1;
            }
            targets.push(target);
        }

        if let Some(entry) = self.modules.get_mut(&pid) {
            for (slot, target) in entry.subscribed.iter_mut().zip(targets) {
                slot.ptr = target;
            }
        }
        Ok(report)
    }

    /// Link every registered module
    pub fn relink_all(&mut self) -> LinkReport {
        let pids: Vec<ModuleId> = self.modules.keys().copied().collect();
        let mut report = LinkReport::default();
        for pid in pids {
            if let Ok(r) = self.link_subscribed_functions(pid) {
                report.merge(r);
            }
        }
        report
    }

    /// Record the providers `pid` calls directly
    pub fn bind_direct(&mut self, pid: ModuleId, providers: &[ModuleId]) -> FntableResult<()> {
        let entry = self
            .modules
            .get_mut(&pid)
            .ok_or(FntableError::NoSuchModule(pid))?;
        entry.direct = providers.to_vec();
        entry.direct.sort_unstable();
        entry.direct.dedup();
        Ok(())
    }

    /// Modules holding direct calls into `pid`
    pub fn dependents(&self, pid: ModuleId) -> Vec<ModuleId> {
        self.modules
            .values()
            .filter(|m| m.pid != pid && m.direct.contains(&pid))
            .map(|m| m.pid)
            .collect()
    }

    /// Drop a module and stub every subscription that pointed into it
    ///
    /// Refused with `InUse` while another module calls into it directly.
    pub fn remove_all(&mut self, pid: ModuleId) -> FntableResult<ModuleEntry> {
        if let Some(&dependent) = self.dependents(pid).first() {
            return Err(FntableError::InUse { pid, dependent });
        }
        self.suspend(pid)
    }

    /// Take a module out of the table while its code stays in place
    ///
    /// Used for micro-reboots: direct callers keep valid addresses because
    /// nothing is freed, so no dependency check is made.
    pub fn suspend(&mut self, pid: ModuleId) -> FntableResult<ModuleEntry> {
        let removed = self
            .modules
            .remove(&pid)
            .ok_or(FntableError::NoSuchModule(pid))?;

        for entry in self.modules.values_mut() {
            for slot in entry.subscribed.iter_mut().filter(|s| s.pid == pid) {
                slot.ptr = CallTarget::Stub(slot.proto.stub());
            }
        }
        Ok(removed)
    }

    /// Entry address of a provided function
    pub fn lookup(&self, provider: ModuleId, fid: FunctionId) -> Option<u32> {
        self.modules
            .get(&provider)?
            .provided
            .iter()
            .find(|f| f.fid == fid)
            .and_then(|f| match f.ptr {
                CallTarget::Entry(addr) => Some(addr),
                CallTarget::Stub(_) => None,
            })
    }

    /// Where a call through subscription slot `table_index` of `pid` goes
    pub fn call_target(&self, pid: ModuleId, table_index: usize) -> FntableResult<CallTarget> {
        let entry = self
            .modules
            .get(&pid)
            .ok_or(FntableError::NoSuchModule(pid))?;
        entry
            .subscribed
            .get(table_index)
            .map(|s| s.ptr)
            .ok_or(FntableError::BadIndex {
                pid,
                index: table_index,
            })
    }

    pub fn module(&self, pid: ModuleId) -> Option<&ModuleEntry> {
        self.modules.get(&pid)
    }

    pub fn is_registered(&self, pid: ModuleId) -> bool {
        self.modules.contains_key(&pid)
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    pub fn pids(&self) -> Vec<ModuleId> {
        self.modules.keys().copied().collect()
    }

    /// Target for a subscription with `proto`; the flag reports a mismatch
    fn resolve(&self, provider: ModuleId, fid: FunctionId, proto: &Proto) -> (CallTarget, bool) {
        let stub = CallTarget::Stub(proto.stub());
        let Some(found) = self
            .modules
            .get(&provider)
            .and_then(|m| m.provided.iter().find(|f| f.fid == fid))
        else {
            return (stub, false);
        };
        if found.proto != *proto {
            return (stub, true);
        }
        (found.ptr, false)
    }
}
