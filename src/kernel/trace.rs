//! Instrumentation and Tracing
//!
//! Every subsystem of the code-management core reports what it does here.
//!
//! Design:
//! - Lightweight event tracing with node-clock timestamps
//! - Counters for allocations, loads, links and fetch outcomes
//! - Ring buffer for recent events (bounded memory)
//! - Optional echo of each event to the console log

use super::ModuleId;
use std::collections::VecDeque;

/// Maximum number of events to keep in the trace buffer
const TRACE_BUFFER_SIZE: usize = 512;

/// Trace event categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceCategory {
    /// Code memory allocation and I/O
    Codemem,
    /// Split-phase flash completions
    Flash,
    /// Function table linking
    Fntable,
    /// Module relocation
    Loader,
    /// Over-the-air fetch
    Fetcher,
    /// Packets in and out
    Radio,
    /// Message dispatch
    Scheduler,
}

impl std::fmt::Display for TraceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceCategory::Codemem => write!(f, "CODEMEM"),
            TraceCategory::Flash => write!(f, "FLASH"),
            TraceCategory::Fntable => write!(f, "FNTABLE"),
            TraceCategory::Loader => write!(f, "LOADER"),
            TraceCategory::Fetcher => write!(f, "FETCHER"),
            TraceCategory::Radio => write!(f, "RADIO"),
            TraceCategory::Scheduler => write!(f, "SCHED"),
        }
    }
}

/// A single trace event
#[derive(Debug, Clone)]
pub struct TraceEvent {
    /// Node clock in milliseconds
    pub timestamp: u64,
    /// Event category
    pub category: TraceCategory,
    /// Event name/type
    pub name: String,
    /// Optional details
    pub detail: Option<String>,
    /// Module the event concerns (if any)
    pub pid: Option<ModuleId>,
}

impl TraceEvent {
    /// Create a new instant event
    pub fn instant(timestamp: u64, category: TraceCategory, name: impl Into<String>) -> Self {
        Self {
            timestamp,
            category,
            name: name.into(),
            detail: None,
            pid: None,
        }
    }

    /// Create an event with details
    pub fn with_detail(
        timestamp: u64,
        category: TraceCategory,
        name: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            category,
            name: name.into(),
            detail: Some(detail.into()),
            pid: None,
        }
    }

    /// Attach the module ID
    pub fn with_pid(mut self, pid: ModuleId) -> Self {
        self.pid = Some(pid);
        self
    }
}

impl std::fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:>8}] {} {}", self.timestamp, self.category, self.name)?;
        if let Some(pid) = self.pid {
            write!(f, " pid={}", pid)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, ": {}", detail)?;
        }
        Ok(())
    }
}

/// Node-wide counters
#[derive(Debug, Clone, Default)]
pub struct NodeStats {
    pub allocations: u64,
    pub allocation_failures: u64,
    pub frees: u64,
    pub flash_completions: u64,
    /// Completions dropped because their handle had been freed
    pub stale_completions: u64,
    pub modules_loaded: u64,
    pub load_failures: u64,
    pub links_resolved: u64,
    pub links_stubbed: u64,
    pub fetches_started: u64,
    pub fetches_committed: u64,
    pub fetches_failed: u64,
    pub fetches_cancelled: u64,
    pub retries: u64,
    pub fragments_received: u64,
    pub fragments_served: u64,
    pub packets_sent: u64,
    pub packets_dropped: u64,
}

/// The node tracer
#[derive(Debug)]
pub struct Tracer {
    /// Whether events are recorded
    enabled: bool,
    /// Also print every recorded event
    echo: bool,
    /// Category filter (None = all)
    filter: Option<Vec<TraceCategory>>,
    /// Ring buffer of recent events
    events: VecDeque<TraceEvent>,
    /// Counters are kept even while event recording is off
    pub stats: NodeStats,
}

impl Tracer {
    pub fn new() -> Self {
        Self {
            enabled: false,
            echo: false,
            filter: None,
            events: VecDeque::with_capacity(TRACE_BUFFER_SIZE),
            stats: NodeStats::default(),
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Print events to the console as they are recorded
    pub fn set_echo(&mut self, echo: bool) {
        self.echo = echo;
    }

    /// Set category filter (None = trace all)
    pub fn set_filter(&mut self, categories: Option<Vec<TraceCategory>>) {
        self.filter = categories;
    }

    fn should_trace(&self, category: TraceCategory) -> bool {
        if !self.enabled {
            return false;
        }
        match &self.filter {
            None => true,
            Some(cats) => cats.contains(&category),
        }
    }

    /// Record a trace event
    pub fn trace(&mut self, event: TraceEvent) {
        if !self.should_trace(event.category) {
            return;
        }

        if self.echo {
            crate::console_log!("{}", event);
        }

        if self.events.len() >= TRACE_BUFFER_SIZE {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn trace_instant(&mut self, timestamp: u64, category: TraceCategory, name: &str) {
        if self.should_trace(category) {
            self.trace(TraceEvent::instant(timestamp, category, name));
        }
    }

    pub fn trace_detail(
        &mut self,
        timestamp: u64,
        category: TraceCategory,
        name: &str,
        detail: impl std::fmt::Display,
    ) {
        if self.should_trace(category) {
            self.trace(TraceEvent::with_detail(
                timestamp,
                category,
                name,
                detail.to_string(),
            ));
        }
    }

    /// Record a problem. Always printed, recorded when tracing is on.
    pub fn warn(&mut self, timestamp: u64, category: TraceCategory, detail: impl std::fmt::Display) {
        let event = TraceEvent::with_detail(timestamp, category, "warning", detail.to_string());
        // trace() prints it already when echoing
        if !(self.echo && self.should_trace(category)) {
            crate::console_log!("{}", event);
        }
        self.trace(event);
    }

    pub fn events(&self) -> &VecDeque<TraceEvent> {
        &self.events
    }

    pub fn events_by_category(&self, category: TraceCategory) -> Vec<&TraceEvent> {
        self.events
            .iter()
            .filter(|e| e.category == category)
            .collect()
    }

    pub fn events_by_pid(&self, pid: ModuleId) -> Vec<&TraceEvent> {
        self.events.iter().filter(|e| e.pid == Some(pid)).collect()
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    /// Reset events and counters
    pub fn reset(&mut self) {
        self.clear_events();
        self.stats = NodeStats::default();
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Node Statistics ===")?;
        writeln!(f, "--- Code memory ---")?;
        writeln!(
            f,
            "Allocations: {} ({} refused)",
            self.allocations, self.allocation_failures
        )?;
        writeln!(f, "Frees: {}", self.frees)?;
        writeln!(
            f,
            "Flash completions: {} ({} stale)",
            self.flash_completions, self.stale_completions
        )?;
        writeln!(f, "--- Modules ---")?;
        writeln!(f, "Loaded: {}", self.modules_loaded)?;
        writeln!(f, "Load failures: {}", self.load_failures)?;
        writeln!(
            f,
            "Links: {} resolved, {} stubbed",
            self.links_resolved, self.links_stubbed
        )?;
        writeln!(f, "--- Fetcher ---")?;
        writeln!(
            f,
            "Fetches: {} started, {} committed, {} failed, {} cancelled",
            self.fetches_started,
            self.fetches_committed,
            self.fetches_failed,
            self.fetches_cancelled
        )?;
        writeln!(f, "Retries: {}", self.retries)?;
        writeln!(
            f,
            "Fragments: {} received, {} served",
            self.fragments_received, self.fragments_served
        )?;
        writeln!(
            f,
            "Packets: {} sent, {} dropped",
            self.packets_sent, self.packets_dropped
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracer_disabled_by_default() {
        let mut tracer = Tracer::new();
        assert!(!tracer.is_enabled());

        tracer.trace_instant(100, TraceCategory::Codemem, "alloc");
        assert_eq!(tracer.events().len(), 0);
    }

    #[test]
    fn test_trace_event_display() {
        let event =
            TraceEvent::with_detail(42, TraceCategory::Loader, "load", "header at 0x1100").with_pid(7);
        assert_eq!(
            event.to_string(),
            "[      42] LOADER load pid=7: header at 0x1100"
        );
    }

    #[test]
    fn test_tracer_filter() {
        let mut tracer = Tracer::new();
        tracer.enable();
        tracer.set_filter(Some(vec![TraceCategory::Fetcher]));

        tracer.trace_instant(1, TraceCategory::Fetcher, "request");
        tracer.trace_instant(2, TraceCategory::Codemem, "alloc");
        tracer.trace_instant(3, TraceCategory::Fetcher, "retry");

        assert_eq!(tracer.events().len(), 2);
        assert_eq!(tracer.events_by_category(TraceCategory::Codemem).len(), 0);
    }

    #[test]
    fn test_tracer_ring_buffer() {
        let mut tracer = Tracer::new();
        tracer.enable();

        for i in 0..TRACE_BUFFER_SIZE + 10 {
            tracer.trace_instant(i as u64, TraceCategory::Radio, "tx");
        }

        assert_eq!(tracer.events().len(), TRACE_BUFFER_SIZE);
        assert_eq!(tracer.events().front().unwrap().timestamp, 10);
    }

    #[test]
    fn test_echo_still_records() {
        let mut tracer = Tracer::new();
        tracer.enable();
        tracer.set_echo(true);

        tracer.trace_instant(1, TraceCategory::Flash, "program");
        tracer.warn(2, TraceCategory::Flash, "erase failed");
        assert_eq!(tracer.events().len(), 2);
        assert_eq!(tracer.events()[1].name, "warning");
    }

    #[test]
    fn test_events_by_pid() {
        let mut tracer = Tracer::new();
        tracer.enable();

        tracer.trace(TraceEvent::instant(1, TraceCategory::Fntable, "link").with_pid(1));
        tracer.trace(TraceEvent::instant(2, TraceCategory::Fntable, "link").with_pid(2));
        tracer.trace(TraceEvent::instant(3, TraceCategory::Loader, "load").with_pid(1));

        assert_eq!(tracer.events_by_pid(1).len(), 2);
    }

    #[test]
    fn test_stats_survive_disable_and_reset_clears() {
        let mut tracer = Tracer::new();
        tracer.stats.allocations = 3;
        tracer.stats.retries = 2;
        assert!(tracer.stats.to_string().contains("Retries: 2"));

        tracer.enable();
        tracer.warn(5, TraceCategory::Fetcher, "source unreachable");
        assert_eq!(tracer.events().len(), 1);

        tracer.disable();
        tracer.stats.retries += 1;
        tracer.trace_instant(6, TraceCategory::Fetcher, "retry");
        assert_eq!(tracer.events().len(), 1);
        assert_eq!(tracer.stats.retries, 3);

        tracer.reset();
        assert_eq!(tracer.events().len(), 0);
        assert_eq!(tracer.stats.allocations, 0);
    }
}
