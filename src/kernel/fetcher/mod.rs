//! Module fetcher
//!
//! Pulls a module image from a neighbour in fixed-size fragments and writes
//! each one straight into a code allocation. A bitmap records which
//! fragments are still missing; when the watchdog fires, only those are
//! asked for again, so retransmission cost follows the loss rate rather
//! than the image size.
//!
//! ```text
//! RequestSent ──fragment──▶ Receiving ──all clear──▶ Committed
//!      │                        │
//!      └──── retries exceeded ──┴──▶ Failed       cancel ──▶ Cancelled
//! ```
//!
//! The same protocol runs in reverse on the serving side: a node answers a
//! request for a key it serves (or is itself fetching) with one fragment
//! per requested bit.
//!
//! Terminal transitions are queued as [`FetchEvent`]s for the node; a
//! committed fetch hands its allocation over to the loader.

pub mod bitmap;
pub mod packet;

pub use bitmap::{FragmentBitmap, MAX_FRAGMENTS};
pub use packet::{FetchRequest, Fragment, Packet};

use super::codemem::{CodeHandle, CodeKind, Codemem, CodememError};
use super::config::{Config, ConfigError};
use super::timer::{TimerId, TimerQueue};
use super::trace::{TraceCategory, TraceEvent, Tracer};
use super::{KERNEL_PID, ModuleId};
use crate::platform::{FlashDevice, NodeAddr, Radio};
use slab::Slab;
use std::collections::VecDeque;
use std::fmt;

/// Network-wide name of a module image
pub type ModuleKey = u16;

/// Result type for fetcher operations
pub type FetchResult<T> = Result<T, FetchError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Every fetch slot is busy
    NoFetchSlot,
    /// A fetch for this key is already running
    AlreadyFetching { key: ModuleKey },
    /// This key is already being served
    AlreadyServed { key: ModuleKey },
    /// Zero size, or more fragments than a request bitmap can name
    InvalidSize { size: u16 },
    /// No fetch with this key
    NoSuchFetch { key: ModuleKey },
    /// Frame could not be decoded or does not fit the fetch
    BadPacket(&'static str),
    /// Code memory refused the allocation or a write
    Codemem(CodememError),
    /// Fetch parameters are unusable
    Config(ConfigError),
}

impl FetchError {
    /// Exhaustion errors go away if the caller backs off and retries
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::NoFetchSlot => true,
            Self::Codemem(e) => e.is_recoverable(),
            _ => false,
        }
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoFetchSlot => write!(f, "no free fetch slot"),
            Self::AlreadyFetching { key } => write!(f, "module {:#06x} already being fetched", key),
            Self::AlreadyServed { key } => write!(f, "module {:#06x} already served", key),
            Self::InvalidSize { size } => write!(f, "cannot fetch a {}-byte image", size),
            Self::NoSuchFetch { key } => write!(f, "no fetch for module {:#06x}", key),
            Self::BadPacket(reason) => write!(f, "bad packet: {}", reason),
            Self::Codemem(e) => write!(f, "code memory: {}", e),
            Self::Config(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for FetchError {}

impl From<CodememError> for FetchError {
    fn from(e: CodememError) -> Self {
        Self::Codemem(e)
    }
}

impl From<ConfigError> for FetchError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

/// Non-terminal phases; a fetch is dropped when it leaves them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPhase {
    /// Request sent, nothing received yet
    RequestSent,
    /// At least one fragment arrived
    Receiving,
}

/// How a fetch ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Every fragment arrived; the image went to the loader
    Committed,
    /// Retry ceiling exceeded; the allocation was freed
    Failed,
    /// Cancelled before completion; the allocation was freed
    Cancelled,
}

impl fmt::Display for FetchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Committed => write!(f, "committed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A fetch that reached a terminal phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchEvent {
    pub key: ModuleKey,
    pub requester: ModuleId,
    /// Valid only for [`FetchOutcome::Committed`]
    pub handle: CodeHandle,
    pub outcome: FetchOutcome,
}

/// One in-flight fetch
#[derive(Debug, Clone)]
pub struct FetchState {
    pub key: ModuleKey,
    pub source: NodeAddr,
    pub requester: ModuleId,
    pub handle: CodeHandle,
    /// Image size in bytes
    pub size: u16,
    pub phase: FetchPhase,
    pub retry_count: u8,
    pub bitmap: FragmentBitmap,
    /// Fragments named again by retransmitted requests
    pub rerequested: usize,
    timer: Option<TimerId>,
}

/// A local allocation offered to neighbours
#[derive(Debug, Clone, Copy)]
struct Served {
    key: ModuleKey,
    handle: CodeHandle,
    size: u16,
}

/// What a fetcher operation may touch besides its own tables
pub struct FetchContext<'a, F: FlashDevice, R: Radio> {
    pub codemem: &'a mut Codemem<F>,
    pub radio: &'a mut R,
    pub tracer: &'a mut Tracer,
    pub now: u64,
}

/// The fetcher
pub struct Fetcher {
    config: Config,
    fetches: Slab<FetchState>,
    served: Slab<Served>,
    watchdog: TimerQueue<ModuleKey>,
    events: VecDeque<FetchEvent>,
}

impl Fetcher {
    pub fn new(config: &Config) -> FetchResult<Self> {
        config.validate()?;
        Ok(Self {
            config: config.clone(),
            fetches: Slab::with_capacity(config.max_fetches),
            served: Slab::new(),
            watchdog: TimerQueue::new(),
            events: VecDeque::new(),
        })
    }

    // ========================================================================
    // Requesting side
    // ========================================================================

    /// Start fetching `size` bytes of module `key` from `source`
    pub fn request<F: FlashDevice, R: Radio>(
        &mut self,
        cx: &mut FetchContext<'_, F, R>,
        requester: ModuleId,
        key: ModuleKey,
        size: u16,
        source: NodeAddr,
    ) -> FetchResult<()> {
        if self.find(key).is_some() {
            return Err(FetchError::AlreadyFetching { key });
        }
        let fragments = (size as usize).div_ceil(self.config.fragment_size);
        if size == 0 || fragments > MAX_FRAGMENTS {
            return Err(FetchError::InvalidSize { size });
        }
        if self.fetches.len() >= self.config.max_fetches {
            return Err(FetchError::NoFetchSlot);
        }

        let handle = match cx.codemem.allocate(size, CodeKind::Executable) {
            Ok(h) => h,
            Err(e) => {
                cx.tracer.stats.allocation_failures += 1;
                return Err(e.into());
            }
        };
        cx.tracer.stats.allocations += 1;

        let idx = self.fetches.insert(FetchState {
            key,
            source,
            requester,
            handle,
            size,
            phase: FetchPhase::RequestSent,
            retry_count: 0,
            bitmap: FragmentBitmap::all_missing(fragments),
            rerequested: 0,
            timer: None,
        });

        cx.tracer.stats.fetches_started += 1;
        cx.tracer.trace(
            TraceEvent::with_detail(
                cx.now,
                TraceCategory::Fetcher,
                "request",
                format!(
                    "key={:#06x} size={} fragments={} source={}",
                    key, size, fragments, source
                ),
            )
            .with_pid(requester),
        );

        self.send_request(cx, idx);
        self.arm(cx.now, idx);
        Ok(())
    }

    /// Abandon a fetch before it commits
    pub fn cancel<F: FlashDevice, R: Radio>(
        &mut self,
        cx: &mut FetchContext<'_, F, R>,
        key: ModuleKey,
    ) -> FetchResult<()> {
        let idx = self.find(key).ok_or(FetchError::NoSuchFetch { key })?;
        self.finish(cx, idx, FetchOutcome::Cancelled);
        Ok(())
    }

    /// Cancel everything in flight
    pub fn cancel_all<F: FlashDevice, R: Radio>(&mut self, cx: &mut FetchContext<'_, F, R>) {
        let live: Vec<usize> = self.fetches.iter().map(|(idx, _)| idx).collect();
        for idx in live {
            self.finish(cx, idx, FetchOutcome::Cancelled);
        }
    }

    /// Watchdog expiry for `key`
    pub fn on_timeout<F: FlashDevice, R: Radio>(
        &mut self,
        cx: &mut FetchContext<'_, F, R>,
        key: ModuleKey,
    ) {
        let Some(idx) = self.find(key) else {
            // Finished between expiry and dispatch
            return;
        };
        let state = &mut self.fetches[idx];
        state.timer = None;
        state.retry_count = state.retry_count.saturating_add(1);

        if state.retry_count > self.config.max_retries {
            cx.tracer.warn(
                cx.now,
                TraceCategory::Fetcher,
                format_args!(
                    "module {:#06x}: {} fragments still missing after {} retries",
                    key,
                    state.bitmap.missing_count(),
                    self.config.max_retries
                ),
            );
            self.finish(cx, idx, FetchOutcome::Failed);
            return;
        }

        let missing = state.bitmap.missing_count();
        state.rerequested += missing;
        let retry = state.retry_count;
        cx.tracer.stats.retries += 1;
        cx.tracer.trace_detail(
            cx.now,
            TraceCategory::Fetcher,
            "retry",
            format_args!("key={:#06x} attempt={} missing={}", key, retry, missing),
        );

        self.send_request(cx, idx);
        self.arm(cx.now, idx);
    }

    // ========================================================================
    // Serving side
    // ========================================================================

    /// Offer the image in `handle` to neighbours as `key`
    pub fn serve<F: FlashDevice>(
        &mut self,
        codemem: &Codemem<F>,
        key: ModuleKey,
        handle: CodeHandle,
    ) -> FetchResult<()> {
        if self.served.iter().any(|(_, s)| s.key == key) {
            return Err(FetchError::AlreadyServed { key });
        }
        let size = codemem.info(handle)?.size;
        self.served.insert(Served { key, handle, size });
        Ok(())
    }

    /// Stop serving `key`
    pub fn unserve(&mut self, key: ModuleKey) -> bool {
        match self.served.iter().find(|(_, s)| s.key == key) {
            Some((idx, _)) => {
                self.served.remove(idx);
                true
            }
            None => false,
        }
    }

    // ========================================================================
    // Packets and timers
    // ========================================================================

    /// Handle a fetch protocol frame received from `from`
    pub fn handle_packet<F: FlashDevice, R: Radio>(
        &mut self,
        cx: &mut FetchContext<'_, F, R>,
        from: NodeAddr,
        frame: &[u8],
    ) -> FetchResult<()> {
        match Packet::decode(frame)? {
            Packet::Request(req) => self.answer(cx, from, &req),
            Packet::Fragment(frag) => self.receive(cx, frag),
        }
    }

    /// Expired watchdogs, as keys to pass back to [`on_timeout`](Self::on_timeout)
    pub fn tick(&mut self, now: u64) -> Vec<ModuleKey> {
        let expired = self.watchdog.tick(now);
        expired
            .into_iter()
            .filter(|&(id, key)| {
                self.find(key)
                    .is_some_and(|idx| self.fetches[idx].timer == Some(id))
            })
            .map(|(_, key)| key)
            .collect()
    }

    /// Milliseconds until the next watchdog deadline
    pub fn time_until_next(&self, now: u64) -> Option<u64> {
        self.watchdog.time_until_next(now)
    }

    /// Terminal transitions since the last call, oldest first
    pub fn take_events(&mut self) -> Vec<FetchEvent> {
        self.events.drain(..).collect()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn state(&self, key: ModuleKey) -> Option<&FetchState> {
        self.find(key).map(|idx| &self.fetches[idx])
    }

    pub fn is_fetching(&self, key: ModuleKey) -> bool {
        self.find(key).is_some()
    }

    pub fn is_serving(&self, key: ModuleKey) -> bool {
        self.served.iter().any(|(_, s)| s.key == key)
    }

    pub fn active_count(&self) -> usize {
        self.fetches.len()
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn find(&self, key: ModuleKey) -> Option<usize> {
        self.fetches
            .iter()
            .find(|(_, s)| s.key == key)
            .map(|(idx, _)| idx)
    }

    /// (Re)start the watchdog with the interval for the current retry count
    fn arm(&mut self, now: u64, idx: usize) {
        let state = &mut self.fetches[idx];
        if let Some(old) = state.timer.take() {
            self.watchdog.cancel(old);
        }
        let delay = self.config.retry_interval(state.retry_count);
        state.timer = Some(self.watchdog.schedule(delay, now, state.key));
    }

    fn send_request<F: FlashDevice, R: Radio>(&self, cx: &mut FetchContext<'_, F, R>, idx: usize) {
        let state = &self.fetches[idx];
        let packet = Packet::Request(FetchRequest {
            key: state.key,
            bitmap: state.bitmap.as_bytes().to_vec(),
        });
        send(cx, state.source, &packet);
    }

    fn receive<F: FlashDevice, R: Radio>(
        &mut self,
        cx: &mut FetchContext<'_, F, R>,
        frag: Fragment,
    ) -> FetchResult<()> {
        let Some(idx) = self.find(frag.key) else {
            // Overheard, or for a fetch that already ended
            return Ok(());
        };
        let state = &self.fetches[idx];
        let index = frag.index as usize;
        if index >= state.bitmap.len() {
            return Err(FetchError::BadPacket("fragment index out of range"));
        }
        if !state.bitmap.is_missing(index) {
            cx.tracer.trace_detail(
                cx.now,
                TraceCategory::Fetcher,
                "duplicate",
                format_args!("key={:#06x} fragment={}", frag.key, index),
            );
            return Ok(());
        }

        let fs = self.config.fragment_size;
        let offset = index * fs;
        let len = fs.min(state.size as usize - offset);
        if frag.payload.len() < len {
            return Err(FetchError::BadPacket("short fragment"));
        }
        if let Err(e) = cx
            .codemem
            .write(state.handle, KERNEL_PID, &frag.payload[..len], offset)
        {
            cx.tracer.warn(
                cx.now,
                TraceCategory::Fetcher,
                format_args!("module {:#06x}: writing fragment {}: {}", frag.key, index, e),
            );
            self.finish(cx, idx, FetchOutcome::Failed);
            return Err(e.into());
        }

        let state = &mut self.fetches[idx];
        state.bitmap.clear(index);
        state.phase = FetchPhase::Receiving;
        cx.tracer.stats.fragments_received += 1;

        if state.bitmap.is_complete() {
            self.finish(cx, idx, FetchOutcome::Committed);
        } else {
            self.arm(cx.now, idx);
        }
        Ok(())
    }

    /// Send the requested fragments this node holds
    fn answer<F: FlashDevice, R: Radio>(
        &mut self,
        cx: &mut FetchContext<'_, F, R>,
        from: NodeAddr,
        req: &FetchRequest,
    ) -> FetchResult<()> {
        let served = self
            .served
            .iter()
            .find(|(_, s)| s.key == req.key)
            .map(|(idx, s)| (idx, *s));
        let (handle, size, partial) =
            if let Some((idx, s)) = served {
                if !cx.codemem.is_live(s.handle) {
                    cx.tracer.warn(
                        cx.now,
                        TraceCategory::Fetcher,
                        format_args!("served module {:#06x} was freed; withdrawing", s.key),
                    );
                    self.served.remove(idx);
                    return Ok(());
                }
                (s.handle, s.size, None)
            } else if let Some(idx) = self.find(req.key) {
                let s = &self.fetches[idx];
                (s.handle, s.size, Some(s.bitmap.clone()))
            } else {
                return Ok(());
            };

        let fs = self.config.fragment_size;
        let wanted = FragmentBitmap::from_bytes(&req.bitmap, (size as usize).div_ceil(fs));
        let mut served = 0usize;
        for index in wanted.missing() {
            if partial.as_ref().is_some_and(|b| b.is_missing(index)) {
                continue;
            }
            let offset = index * fs;
            let len = fs.min(size as usize - offset);
            let mut payload = vec![0u8; fs];
            cx.codemem
                .read(handle, KERNEL_PID, &mut payload[..len], offset)?;
            let packet = Packet::Fragment(Fragment {
                index: index as u16,
                key: req.key,
                payload,
            });
            send(cx, from, &packet);
            served += 1;
        }

        cx.tracer.stats.fragments_served += served as u64;
        cx.tracer.trace_detail(
            cx.now,
            TraceCategory::Fetcher,
            "serve",
            format_args!("key={:#06x} to={} fragments={}", req.key, from, served),
        );
        Ok(())
    }

    /// Drop fetch `idx`, releasing its allocation unless it committed
    fn finish<F: FlashDevice, R: Radio>(
        &mut self,
        cx: &mut FetchContext<'_, F, R>,
        idx: usize,
        outcome: FetchOutcome,
    ) {
        let state = self.fetches.remove(idx);
        if let Some(timer) = state.timer {
            self.watchdog.cancel(timer);
        }

        match outcome {
            FetchOutcome::Committed => cx.tracer.stats.fetches_committed += 1,
            FetchOutcome::Failed => cx.tracer.stats.fetches_failed += 1,
            FetchOutcome::Cancelled => cx.tracer.stats.fetches_cancelled += 1,
        }
        if outcome != FetchOutcome::Committed && cx.codemem.free(state.handle).is_ok() {
            cx.tracer.stats.frees += 1;
        }

        cx.tracer.trace(
            TraceEvent::with_detail(
                cx.now,
                TraceCategory::Fetcher,
                "done",
                format!(
                    "key={:#06x} {} retries={} rerequested={}",
                    state.key, outcome, state.retry_count, state.rerequested
                ),
            )
            .with_pid(state.requester),
        );

        self.events.push_back(FetchEvent {
            key: state.key,
            requester: state.requester,
            handle: state.handle,
            outcome,
        });
    }
}

fn send<F: FlashDevice, R: Radio>(cx: &mut FetchContext<'_, F, R>, dest: NodeAddr, packet: &Packet) {
    let result = packet
        .encode()
        .map_err(|e| e.to_string())
        .and_then(|frame| cx.radio.send(dest, frame).map_err(|e| e.to_string()));
    match result {
        Ok(()) => cx.tracer.stats.packets_sent += 1,
        Err(e) => {
            // The watchdog recovers from lost requests and fragments alike
            cx.tracer.stats.packets_dropped += 1;
            cx.tracer
                .warn(cx.now, TraceCategory::Radio, format_args!("to {}: {}", dest, e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::config::Backoff;
    use crate::platform::sim::{SimFlash, SimRadio};

    const REQ: ModuleId = 7;
    const SOURCE: NodeAddr = 2;

    struct Harness {
        codemem: Codemem<SimFlash>,
        radio: SimRadio,
        tracer: Tracer,
        now: u64,
        fetcher: Fetcher,
    }

    impl Harness {
        fn new(config: Config) -> Self {
            let flash = SimFlash::new(config.flash_base, config.page_size, config.page_count);
            Self {
                codemem: Codemem::new(flash, &config).unwrap(),
                radio: SimRadio::new(1),
                tracer: Tracer::new(),
                now: 0,
                fetcher: Fetcher::new(&config).unwrap(),
            }
        }

        fn run<T>(
            &mut self,
            f: impl FnOnce(&mut Fetcher, &mut FetchContext<'_, SimFlash, SimRadio>) -> T,
        ) -> T {
            let mut cx = FetchContext {
                codemem: &mut self.codemem,
                radio: &mut self.radio,
                tracer: &mut self.tracer,
                now: self.now,
            };
            f(&mut self.fetcher, &mut cx)
        }

        fn request(&mut self, key: ModuleKey, size: u16) -> FetchResult<()> {
            self.run(|f, cx| f.request(cx, REQ, key, size, SOURCE))
        }

        fn deliver(&mut self, packet: Packet) -> FetchResult<()> {
            let frame = packet.encode().unwrap();
            self.run(|f, cx| f.handle_packet(cx, SOURCE, &frame))
        }

        fn fragment(&mut self, key: ModuleKey, index: u16, fill: u8) -> FetchResult<()> {
            self.deliver(Packet::Fragment(Fragment {
                index,
                key,
                payload: vec![fill; 8],
            }))
        }

        /// Advance the clock and fire due watchdogs
        fn advance(&mut self, ms: u64) {
            self.now += ms;
            let now = self.now;
            for key in self.fetcher.tick(now) {
                self.run(|f, cx| f.on_timeout(cx, key));
            }
        }

        fn sent(&mut self) -> Vec<Packet> {
            self.radio
                .drain()
                .into_iter()
                .map(|(_, frame)| Packet::decode(&frame).unwrap())
                .collect()
        }
    }

    fn config() -> Config {
        Config {
            flash_base: 0,
            page_size: 64,
            page_count: 16,
            fragment_size: 8,
            max_fetches: 2,
            max_retries: 2,
            retry_interval_ms: 100,
            ..Config::default()
        }
    }

    #[test]
    fn test_new_rejects_unusable_config() {
        let config = Config {
            fragment_size: 0,
            ..Config::default()
        };
        assert_eq!(
            Fetcher::new(&config).err().map(|e| e.to_string()),
            Some("invalid config: fragment_size must be 1..=255".to_string())
        );
        assert!(matches!(
            Fetcher::new(&Config {
                max_fetches: 0,
                ..Config::default()
            }),
            Err(FetchError::Config(ConfigError::Invalid(_)))
        ));
    }

    #[test]
    fn test_request_sends_full_bitmap() {
        let mut h = Harness::new(config());
        h.request(0x10, 20).unwrap();

        let state = h.fetcher.state(0x10).unwrap();
        assert_eq!(state.phase, FetchPhase::RequestSent);
        assert_eq!(state.bitmap.missing_count(), 3);
        assert_eq!(h.codemem.allocation_count(), 1);

        assert_eq!(
            h.sent(),
            vec![Packet::Request(FetchRequest {
                key: 0x10,
                bitmap: vec![0b111],
            })]
        );
        assert_eq!(h.fetcher.time_until_next(0), Some(100));
    }

    #[test]
    fn test_fragments_commit() {
        let mut h = Harness::new(config());
        h.request(0x10, 20).unwrap();

        h.fragment(0x10, 2, 0xCC).unwrap();
        assert_eq!(h.fetcher.state(0x10).unwrap().phase, FetchPhase::Receiving);
        h.fragment(0x10, 0, 0xAA).unwrap();
        // Duplicate is ignored
        h.fragment(0x10, 0, 0x00).unwrap();
        h.fragment(0x10, 1, 0xBB).unwrap();

        let events = h.fetcher.take_events();
        assert_eq!(events.len(), 1);
        let done = events[0];
        assert_eq!(done.outcome, FetchOutcome::Committed);
        assert_eq!(done.requester, REQ);
        assert!(!h.fetcher.is_fetching(0x10));
        assert_eq!(h.fetcher.time_until_next(h.now), None);

        let mut image = [0u8; 20];
        h.codemem.read(done.handle, REQ, &mut image, 0).unwrap();
        assert_eq!(&image[..8], &[0xAA; 8]);
        assert_eq!(&image[8..16], &[0xBB; 8]);
        assert_eq!(&image[16..], &[0xCC; 4]);
        assert_eq!(h.tracer.stats.fragments_received, 3);
    }

    #[test]
    fn test_fragment_rearms_watchdog() {
        let mut h = Harness::new(config());
        h.request(0x10, 20).unwrap();
        h.advance(90);
        h.fragment(0x10, 0, 1).unwrap();
        // Deadline moved to 90 + 100
        h.advance(20);
        assert_eq!(h.fetcher.state(0x10).unwrap().retry_count, 0);
        assert_eq!(h.fetcher.time_until_next(h.now), Some(80));
    }

    #[test]
    fn test_timeout_requests_only_missing() {
        let mut h = Harness::new(config());
        h.request(0x10, 20).unwrap();
        h.fragment(0x10, 1, 1).unwrap();
        h.sent();

        h.advance(100);
        let state = h.fetcher.state(0x10).unwrap();
        assert_eq!(state.retry_count, 1);
        assert_eq!(state.rerequested, 2);
        assert_eq!(
            h.sent(),
            vec![Packet::Request(FetchRequest {
                key: 0x10,
                bitmap: vec![0b101],
            })]
        );
        assert_eq!(h.tracer.stats.retries, 1);
    }

    #[test]
    fn test_retry_ceiling_fails_and_frees() {
        let mut h = Harness::new(config());
        h.request(0x10, 20).unwrap();
        let handle = h.fetcher.state(0x10).unwrap().handle;

        h.advance(100);
        h.advance(100);
        assert!(h.fetcher.is_fetching(0x10));
        h.advance(100);
        assert!(!h.fetcher.is_fetching(0x10));

        let events = h.fetcher.take_events();
        assert_eq!(events[0].outcome, FetchOutcome::Failed);
        assert!(!h.codemem.is_live(handle));
        assert_eq!(h.codemem.allocation_count(), 0);
        assert_eq!(h.tracer.stats.fetches_failed, 1);
        // Initial request plus two retries
        assert_eq!(h.sent().len(), 3);

        // Late fragments are dropped quietly
        h.fragment(0x10, 0, 1).unwrap();
        assert!(h.fetcher.take_events().is_empty());
    }

    #[test]
    fn test_exponential_backoff() {
        let mut h = Harness::new(Config {
            backoff: Backoff::Exponential,
            max_retries: 5,
            ..config()
        });
        h.request(0x10, 20).unwrap();
        h.advance(100);
        assert_eq!(h.fetcher.time_until_next(h.now), Some(200));
        h.advance(200);
        assert_eq!(h.fetcher.time_until_next(h.now), Some(400));
    }

    #[test]
    fn test_slot_and_size_limits() {
        let mut h = Harness::new(config());
        h.request(1, 8).unwrap();
        assert_eq!(h.request(1, 8), Err(FetchError::AlreadyFetching { key: 1 }));
        h.request(2, 8).unwrap();

        let err = h.request(3, 8).unwrap_err();
        assert_eq!(err, FetchError::NoFetchSlot);
        assert!(err.is_recoverable());

        assert_eq!(h.request(4, 0), Err(FetchError::InvalidSize { size: 0 }));
    }

    #[test]
    fn test_no_space_is_recoverable() {
        let mut h = Harness::new(config());
        let err = h.request(1, 2048).unwrap_err();
        assert!(matches!(err, FetchError::Codemem(CodememError::NoSpace { .. })));
        assert!(err.is_recoverable());
        assert_eq!(h.fetcher.active_count(), 0);
    }

    #[test]
    fn test_cancel_frees_and_stops_timer() {
        let mut h = Harness::new(config());
        h.request(0x10, 20).unwrap();
        let handle = h.fetcher.state(0x10).unwrap().handle;

        h.run(|f, cx| f.cancel(cx, 0x10)).unwrap();
        assert!(!h.codemem.is_live(handle));
        assert_eq!(h.fetcher.time_until_next(0), None);
        assert_eq!(
            h.fetcher.take_events()[0].outcome,
            FetchOutcome::Cancelled
        );
        assert_eq!(
            h.run(|f, cx| f.cancel(cx, 0x10)),
            Err(FetchError::NoSuchFetch { key: 0x10 })
        );
    }

    #[test]
    fn test_bad_fragments() {
        let mut h = Harness::new(config());
        h.request(0x10, 20).unwrap();
        assert_eq!(
            h.fragment(0x10, 3, 0),
            Err(FetchError::BadPacket("fragment index out of range"))
        );
        assert_eq!(
            h.deliver(Packet::Fragment(Fragment {
                index: 2,
                key: 0x10,
                payload: vec![0; 3],
            })),
            Err(FetchError::BadPacket("short fragment"))
        );
        // Last fragment only needs its 4 real bytes
        h.deliver(Packet::Fragment(Fragment {
            index: 2,
            key: 0x10,
            payload: vec![0; 4],
        }))
        .unwrap();
        assert_eq!(h.fetcher.state(0x10).unwrap().bitmap.missing_count(), 2);
    }

    #[test]
    fn test_serve_answers_requested_bits() {
        let mut h = Harness::new(config());
        let handle = h.codemem.allocate(20, CodeKind::Executable).unwrap();
        let image: Vec<u8> = (0..20).collect();
        h.codemem.write(handle, REQ, &image, 0).unwrap();
        h.fetcher.serve(&h.codemem, 0x20, handle).unwrap();
        assert!(h.fetcher.is_serving(0x20));
        assert_eq!(
            h.fetcher.serve(&h.codemem, 0x20, handle),
            Err(FetchError::AlreadyServed { key: 0x20 })
        );

        h.deliver(Packet::Request(FetchRequest {
            key: 0x20,
            bitmap: vec![0b101],
        }))
        .unwrap();
        let sent = h.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[0],
            Packet::Fragment(Fragment {
                index: 0,
                key: 0x20,
                payload: (0..8).collect(),
            })
        );
        // Final fragment zero-padded
        assert_eq!(
            sent[1],
            Packet::Fragment(Fragment {
                index: 2,
                key: 0x20,
                payload: vec![16, 17, 18, 19, 0, 0, 0, 0],
            })
        );
        assert_eq!(h.tracer.stats.fragments_served, 2);

        // Unknown keys are ignored
        h.deliver(Packet::Request(FetchRequest {
            key: 0x21,
            bitmap: vec![0xFF],
        }))
        .unwrap();
        assert!(h.sent().is_empty());

        assert!(h.fetcher.unserve(0x20));
        assert!(!h.fetcher.unserve(0x20));
    }

    #[test]
    fn test_partial_fetch_serves_received_fragments() {
        let mut h = Harness::new(config());
        h.request(0x10, 20).unwrap();
        h.fragment(0x10, 1, 0x55).unwrap();
        h.sent();

        h.deliver(Packet::Request(FetchRequest {
            key: 0x10,
            bitmap: vec![0b111],
        }))
        .unwrap();
        let sent = h.sent();
        assert_eq!(
            sent,
            vec![Packet::Fragment(Fragment {
                index: 1,
                key: 0x10,
                payload: vec![0x55; 8],
            })]
        );
    }

    #[test]
    fn test_freed_served_module_is_withdrawn() {
        let mut h = Harness::new(config());
        let handle = h.codemem.allocate(8, CodeKind::Executable).unwrap();
        h.fetcher.serve(&h.codemem, 0x30, handle).unwrap();
        h.codemem.free(handle).unwrap();

        h.deliver(Packet::Request(FetchRequest {
            key: 0x30,
            bitmap: vec![1],
        }))
        .unwrap();
        assert!(h.sent().is_empty());
        assert!(!h.fetcher.is_serving(0x30));
    }
}
