//! The node: one owner for every table, one dispatcher for every event
//!
//! Design:
//! - All state (allocation table, function table, fetch slots) lives in one
//!   `Node`, so there is no global mutable state and no locking
//! - Split-phase completions, inbound frames and watchdog expiries become
//!   [`Message`]s and are dispatched one at a time, each to completion
//! - Time only moves through [`Node::advance`], so runs are reproducible
//! - Anything meant for a module is queued as a [`Notification`] addressed
//!   to the module that started the operation

use super::codemem::{CodeHandle, CodeKind, Codemem, CodememError};
use super::config::{Config, ConfigError};
use super::events::{Message, MessageQueue, Notification};
use super::fetcher::{FetchContext, FetchError, FetchOutcome, Fetcher, ModuleKey};
use super::fntable::{CallTarget, FntableError, FunctionId, FunctionTable, LinkReport};
use super::melf::{self, LoadError, LoadedModule};
use super::trace::{NodeStats, TraceCategory, TraceEvent, Tracer};
use super::{KERNEL_PID, ModuleId};
use crate::platform::{FlashDevice, NodeAddr, Radio};
use std::fmt;

/// Result type for node operations
pub type NodeResult<T> = Result<T, NodeError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    Config(ConfigError),
    Codemem(CodememError),
    Fntable(FntableError),
    Load(LoadError),
    Fetch(FetchError),
}

impl NodeError {
    /// Back-pressure the caller can retry after
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Codemem(e) => e.is_recoverable(),
            Self::Fetch(e) => e.is_recoverable(),
            _ => false,
        }
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "config: {}", e),
            Self::Codemem(e) => write!(f, "code memory: {}", e),
            Self::Fntable(e) => write!(f, "function table: {}", e),
            Self::Load(e) => write!(f, "load: {}", e),
            Self::Fetch(e) => write!(f, "fetch: {}", e),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<ConfigError> for NodeError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<CodememError> for NodeError {
    fn from(e: CodememError) -> Self {
        Self::Codemem(e)
    }
}

impl From<FntableError> for NodeError {
    fn from(e: FntableError) -> Self {
        Self::Fntable(e)
    }
}

impl From<LoadError> for NodeError {
    fn from(e: LoadError) -> Self {
        Self::Load(e)
    }
}

impl From<FetchError> for NodeError {
    fn from(e: FetchError) -> Self {
        Self::Fetch(e)
    }
}

/// A sensor node's code-management core
pub struct Node<F: FlashDevice, R: Radio> {
    config: Config,
    codemem: Codemem<F>,
    fntable: FunctionTable,
    fetcher: Fetcher,
    queue: MessageQueue,
    radio: R,
    tracer: Tracer,
    /// Milliseconds since boot
    now: u64,
    notifications: Vec<(ModuleId, Notification)>,
}

impl<F: FlashDevice, R: Radio> Node<F, R> {
    pub fn new(config: Config, flash: F, radio: R) -> NodeResult<Self> {
        config.validate()?;
        let codemem = Codemem::new(flash, &config)?;
        let fetcher = Fetcher::new(&config)?;

        let mut tracer = Tracer::new();
        if config.trace {
            tracer.enable();
        }
        tracer.set_echo(config.echo);
        tracer.trace_detail(
            0,
            TraceCategory::Scheduler,
            "boot",
            format_args!(
                "addr={} code={:#x}+{}",
                radio.local_addr(),
                config.flash_base,
                config.code_region_size()
            ),
        );

        Ok(Self {
            fetcher,
            config,
            codemem,
            fntable: FunctionTable::new(),
            queue: MessageQueue::new(),
            radio,
            tracer,
            now: 0,
            notifications: Vec::new(),
        })
    }

    // ========================================================================
    // Module management
    // ========================================================================

    /// Write a module image into code memory and load it
    ///
    /// The outcome is also posted to `requester` as a notification.
    pub fn install(&mut self, image: &[u8], requester: ModuleId) -> NodeResult<LoadedModule> {
        let handle = self.store(image, CodeKind::Executable)?;
        let result = self.load(handle, requester);
        self.run();
        result.map_err(NodeError::from)
    }

    /// Keep a pristine copy of `image` and offer it to neighbours as `key`
    pub fn publish(&mut self, key: ModuleKey, image: &[u8]) -> NodeResult<CodeHandle> {
        let handle = self.store(image, CodeKind::ReadOnly)?;
        if let Err(e) = self.fetcher.serve(&self.codemem, key, handle) {
            self.free(handle);
            return Err(e.into());
        }
        self.tracer.trace_detail(
            self.now,
            TraceCategory::Fetcher,
            "publish",
            format_args!("key={:#06x} size={} {}", key, image.len(), handle),
        );
        Ok(handle)
    }

    /// Offer an existing allocation to neighbours as `key`
    pub fn serve(&mut self, key: ModuleKey, handle: CodeHandle) -> NodeResult<()> {
        self.fetcher.serve(&self.codemem, key, handle)?;
        Ok(())
    }

    /// Stop offering `key`
    pub fn unserve(&mut self, key: ModuleKey) -> bool {
        self.fetcher.unserve(key)
    }

    /// Start fetching module `key` from `source`
    ///
    /// `requester` receives `FetchDone` and then `ModuleLoaded` or
    /// `LoadFailed`.
    pub fn fetch(
        &mut self,
        requester: ModuleId,
        key: ModuleKey,
        size: u16,
        source: NodeAddr,
    ) -> NodeResult<()> {
        self.with_fetcher(|fetcher, cx| fetcher.request(cx, requester, key, size, source))?;
        Ok(())
    }

    pub fn cancel_fetch(&mut self, key: ModuleKey) -> NodeResult<()> {
        self.with_fetcher(|fetcher, cx| fetcher.cancel(cx, key))?;
        self.run();
        Ok(())
    }

    /// Unload a module: stub every subscription into it and free its code
    ///
    /// Refused while another module holds direct calls into it; remove
    /// those first.
    pub fn remove_module(&mut self, pid: ModuleId) -> NodeResult<()> {
        let entry = match self.fntable.remove_all(pid) {
            Ok(entry) => entry,
            Err(e) => {
                self.tracer
                    .warn(self.now, TraceCategory::Fntable, format_args!("remove {}: {}", pid, e));
                return Err(e.into());
            }
        };
        self.free(entry.handle);
        self.tracer
            .trace(TraceEvent::instant(self.now, TraceCategory::Fntable, "remove").with_pid(pid));
        self.relink();
        Ok(())
    }

    /// Micro-reboot: re-register a module from its code already in flash
    ///
    /// Subscribers see stubs while it is down and are relinked afterwards.
    pub fn restart_module(&mut self, pid: ModuleId) -> NodeResult<()> {
        let entry = self.fntable.suspend(pid)?;
        let start = self.codemem.start_addr(entry.handle)?;
        let header_offset = (entry.header_addr - start) as usize;

        if let Err(e) = self
            .fntable
            .register_module(&mut self.codemem, entry.handle, header_offset)
        {
            self.tracer.warn(
                self.now,
                TraceCategory::Fntable,
                format_args!("module {} did not come back: {}", pid, e),
            );
            // Direct callers still jump into this code
            if self.fntable.dependents(pid).is_empty() {
                self.free(entry.handle);
            }
            self.relink();
            return Err(e.into());
        }
        self.fntable.bind_direct(pid, &entry.direct)?;

        self.tracer
            .trace(TraceEvent::instant(self.now, TraceCategory::Fntable, "restart").with_pid(pid));
        self.relink();
        Ok(())
    }

    /// Bind subscription slot `table_index` of `subscriber` to `(provider, fid)`
    pub fn subscribe(
        &mut self,
        subscriber: ModuleId,
        provider: ModuleId,
        fid: FunctionId,
        table_index: usize,
    ) -> NodeResult<CallTarget> {
        let target = self
            .fntable
            .subscribe(subscriber, provider, fid, table_index)?;
        self.tracer.trace(
            TraceEvent::with_detail(
                self.now,
                TraceCategory::Fntable,
                "subscribe",
                format!("slot {} -> {}:{} {:?}", table_index, provider, fid, target),
            )
            .with_pid(subscriber),
        );
        Ok(target)
    }

    /// Relink every module against the current providers
    pub fn link_all(&mut self) -> LinkReport {
        self.relink()
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    /// Queue a frame received from a neighbour
    pub fn deliver(&mut self, frame: Vec<u8>, from: NodeAddr) {
        self.queue.post(Message::Packet { from, frame });
    }

    /// Move the clock forward, firing watchdogs at their own deadlines and
    /// dispatching everything they cause
    pub fn advance(&mut self, ms: u64) {
        let target = self.now.saturating_add(ms);
        while let Some(wait) = self.fetcher.time_until_next(self.now) {
            if self.now + wait > target {
                break;
            }
            self.now += wait;
            self.fire_timers();
            self.run();
        }
        self.now = target;
        self.fire_timers();
        self.run();
    }

    /// Dispatch until the queue is empty. Returns the number of messages.
    pub fn run(&mut self) -> usize {
        let mut dispatched = 0;
        loop {
            self.collect();
            let Some(msg) = self.queue.pop() else {
                break;
            };
            self.dispatch(msg);
            dispatched += 1;
        }
        dispatched
    }

    /// Notifications produced since the last call, oldest first
    pub fn take_notifications(&mut self) -> Vec<(ModuleId, Notification)> {
        std::mem::take(&mut self.notifications)
    }

    /// Cancel fetches and write back the cache
    pub fn shutdown(&mut self) -> NodeResult<()> {
        self.with_fetcher(|fetcher, cx| fetcher.cancel_all(cx));
        self.run();
        let flushed = self.codemem.flush_all()?;
        self.tracer.trace_detail(
            self.now,
            TraceCategory::Scheduler,
            "shutdown",
            format_args!("cache flushed={}", flushed),
        );
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn addr(&self) -> NodeAddr {
        self.radio.local_addr()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn codemem(&self) -> &Codemem<F> {
        &self.codemem
    }

    /// Direct code memory access for modules; run the node afterwards so
    /// split-phase completions are delivered
    pub fn codemem_mut(&mut self) -> &mut Codemem<F> {
        &mut self.codemem
    }

    pub fn fntable(&self) -> &FunctionTable {
        &self.fntable
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn tracer_mut(&mut self) -> &mut Tracer {
        &mut self.tracer
    }

    pub fn stats(&self) -> &NodeStats {
        &self.tracer.stats
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn with_fetcher<T>(
        &mut self,
        f: impl FnOnce(&mut Fetcher, &mut FetchContext<'_, F, R>) -> T,
    ) -> T {
        let mut cx = FetchContext {
            codemem: &mut self.codemem,
            radio: &mut self.radio,
            tracer: &mut self.tracer,
            now: self.now,
        };
        f(&mut self.fetcher, &mut cx)
    }

    /// Allocate and fill an allocation, flushing it to flash
    fn store(&mut self, image: &[u8], kind: CodeKind) -> NodeResult<CodeHandle> {
        let size = u16::try_from(image.len()).map_err(|_| CodememError::InvalidSize)?;
        let handle = match self.codemem.allocate(size, kind) {
            Ok(h) => h,
            Err(e) => {
                self.tracer.stats.allocation_failures += 1;
                self.tracer
                    .warn(self.now, TraceCategory::Codemem, format_args!("allocate {}: {}", size, e));
                return Err(e.into());
            }
        };
        self.tracer.stats.allocations += 1;
        self.tracer.trace_detail(
            self.now,
            TraceCategory::Codemem,
            "allocate",
            format_args!("{} bytes -> {}", size, handle),
        );

        let written = self
            .codemem
            .write(handle, KERNEL_PID, image, 0)
            .and_then(|_| self.codemem.flush(handle, KERNEL_PID));
        if let Err(e) = written {
            self.free(handle);
            return Err(e.into());
        }
        Ok(handle)
    }

    fn free(&mut self, handle: CodeHandle) {
        if self.codemem.free(handle).is_ok() {
            self.tracer.stats.frees += 1;
            self.tracer.trace_detail(
                self.now,
                TraceCategory::Codemem,
                "free",
                handle,
            );
        }
    }

    /// Run the loader on `handle`, notifying `requester` either way
    fn load(&mut self, handle: CodeHandle, requester: ModuleId) -> Result<LoadedModule, LoadError> {
        let was_live = self.codemem.is_live(handle);
        match melf::load(&mut self.codemem, &mut self.fntable, handle) {
            Ok(module) => {
                self.tracer.stats.modules_loaded += 1;
                self.tracer.trace(
                    TraceEvent::with_detail(
                        self.now,
                        TraceCategory::Loader,
                        "loaded",
                        format!(
                            "header={:#x} relocations={} functions={}",
                            module.header_addr, module.relocations, module.function_count
                        ),
                    )
                    .with_pid(module.pid),
                );
                self.relink();
                self.notify(
                    requester,
                    Notification::ModuleLoaded {
                        pid: module.pid,
                        header_addr: module.header_addr,
                        function_count: module.function_count,
                    },
                );
                Ok(module)
            }
            Err(error) => {
                self.tracer.stats.load_failures += 1;
                if was_live && !self.codemem.is_live(handle) {
                    self.tracer.stats.frees += 1;
                }
                self.tracer.warn(
                    self.now,
                    TraceCategory::Loader,
                    format_args!("rejected {}: {}", handle, error),
                );
                self.notify(
                    requester,
                    Notification::LoadFailed {
                        error: error.clone(),
                    },
                );
                Err(error)
            }
        }
    }

    fn relink(&mut self) -> LinkReport {
        let report = self.fntable.relink_all();
        self.tracer.stats.links_resolved += report.resolved as u64;
        self.tracer.stats.links_stubbed += report.stubbed as u64;
        if report.mismatched > 0 {
            self.tracer.warn(
                self.now,
                TraceCategory::Fntable,
                format_args!("{} subscriptions stubbed on prototype mismatch", report.mismatched),
            );
        }
        self.tracer.trace_detail(
            self.now,
            TraceCategory::Fntable,
            "relink",
            format_args!("resolved={} stubbed={}", report.resolved, report.stubbed),
        );
        report
    }

    fn fire_timers(&mut self) {
        for key in self.fetcher.tick(self.now) {
            self.queue.post(Message::FetchTimeout { key });
        }
    }

    /// Turn pending completions and fetch outcomes into messages
    fn collect(&mut self) {
        for done in self.codemem.take_completions() {
            self.queue.post(Message::FlashDone {
                handle: done.handle,
                requester: done.requester,
            });
        }
        for event in self.fetcher.take_events() {
            if event.outcome == FetchOutcome::Committed {
                self.queue.post(Message::FetchComplete {
                    key: event.key,
                    handle: event.handle,
                    requester: event.requester,
                });
            } else {
                self.notify(
                    event.requester,
                    Notification::FetchDone {
                        key: event.key,
                        outcome: event.outcome,
                    },
                );
            }
        }
    }

    fn dispatch(&mut self, msg: Message) {
        match msg {
            Message::FlashDone { handle, requester } => {
                if !self.codemem.is_live(handle) {
                    // Freed while the cycle was in flight
                    self.tracer.stats.stale_completions += 1;
                    self.tracer
                        .trace_detail(self.now, TraceCategory::Flash, "stale", handle);
                    return;
                }
                self.tracer.stats.flash_completions += 1;
                if requester != KERNEL_PID {
                    self.notify(requester, Notification::FlashDone { handle });
                }
            }
            Message::Packet { from, frame } => {
                let result =
                    self.with_fetcher(|fetcher, cx| fetcher.handle_packet(cx, from, &frame));
                if let Err(e) = result {
                    self.tracer.stats.packets_dropped += 1;
                    self.tracer
                        .warn(self.now, TraceCategory::Radio, format_args!("from {}: {}", from, e));
                }
            }
            Message::FetchTimeout { key } => {
                self.with_fetcher(|fetcher, cx| fetcher.on_timeout(cx, key));
            }
            Message::FetchComplete {
                key,
                handle,
                requester,
            } => {
                self.notify(
                    requester,
                    Notification::FetchDone {
                        key,
                        outcome: FetchOutcome::Committed,
                    },
                );
                let _ = self.load(handle, requester);
            }
        }
    }

    fn notify(&mut self, to: ModuleId, notification: Notification) {
        self.notifications.push((to, notification));
    }
}
