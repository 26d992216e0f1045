//! # Paced Link
//!
//! The engine for one link. Owns the TX and RX queues, the timing model,
//! the pacing state machine and the send slot, and exposes the three entry
//! points the outside world drives:
//!
//! - **producer**: [`PacedLink::write`], gated by [`PacedLink::is_ready`]
//! - **tick context**: [`PacedLink::tick`], from a pump loop or timer
//! - **completion context**: [`PacedLink::on_completion`], from the transport
//!
//! All TX-side state lives behind one mutex and every entry point is a
//! single short critical section. The transport is never called with the
//! lock held, so a transport may report a completion from inside `send`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use quanta::Clock;
use tracing::{debug, info, warn};

use crate::config::PacerConfig;
use crate::cycle::{CycleAction, FailureDisposition, SendCycle};
use crate::line::LineReader;
use crate::pacing::{Pacer, PacingEvent};
use crate::queue::ByteQueue;
use crate::stats::{PacerTelemetry, RxStats, TxStats};
use crate::status::{CompletionStatus, StatusClassifier};
use crate::timing::{LinkTiming, TransportParameters};

// ─── Transport Seam ─────────────────────────────────────────────────────────

/// The notification channel the engine paces.
pub trait Transport: Send + Sync {
    /// Non-blocking handoff of one chunk. `true` means the transport took it
    /// and will report exactly one completion later.
    fn send(&self, chunk: &[u8]) -> bool;

    /// Ask the link owner to tear the connection down.
    fn request_disconnect(&self);
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, chunk: &[u8]) -> bool {
        (**self).send(chunk)
    }

    fn request_disconnect(&self) {
        (**self).request_disconnect()
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&self, chunk: &[u8]) -> bool {
        (**self).send(chunk)
    }

    fn request_disconnect(&self) {
        (**self).request_disconnect()
    }
}

// ─── Outcomes ───────────────────────────────────────────────────────────────

/// What one call to [`PacedLink::tick`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    LinkDown,
    /// Nothing queued.
    Idle,
    /// Interval not elapsed or a send is outstanding.
    Waiting,
    Sent { len: usize, retransmit: bool },
    /// The transport refused the chunk; it stays staged.
    Rejected { len: usize },
    /// A staged chunk no longer fit after renegotiation.
    DroppedOversize { len: usize },
    /// The outstanding send never completed; treated as congestion.
    TimedOut,
}

/// What one completion did to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionOutcome {
    pub code: i32,
    pub status: CompletionStatus,
    pub event: PacingEvent,
    /// A send was outstanding when the completion arrived.
    pub matched: bool,
}

// ─── Engine State ───────────────────────────────────────────────────────────

struct TxSide {
    queue: ByteQueue,
    cycle: SendCycle,
    pacer: Pacer,
    timing: LinkTiming,
    stats: TxStats,
}

impl TxSide {
    /// Backlog has reached the low-water mark, the load condition for
    /// relaxing the last-known-good interval.
    fn reached_low_water(&self) -> bool {
        self.queue.len() >= self.timing.watermarks().low
    }

    /// Clear the send slot, consuming a chunk that was already acknowledged.
    fn reset_cycle(&mut self) {
        let TxSide { queue, cycle, stats, .. } = self;
        if cycle.reset(queue) > 0 {
            stats.chunks_acknowledged += 1;
        }
    }

    /// Ready again once the slot is empty and the backlog is at or below
    /// the low-water mark.
    fn drained_to_low(&self) -> bool {
        self.cycle.staged().is_none() && self.queue.len() <= self.timing.watermarks().low
    }
}

struct RxSide {
    queue: ByteQueue,
    stats: RxStats,
}

/// Adaptive pacing engine for one notification link.
pub struct PacedLink<T: Transport> {
    transport: T,
    classifier: Box<dyn StatusClassifier>,
    clock: Clock,
    tx: Mutex<TxSide>,
    rx: Mutex<RxSide>,
    ready: AtomicBool,
    link_up: AtomicBool,
}

impl<T: Transport> PacedLink<T> {
    /// Create an engine with the system clock.
    ///
    /// # Panics
    ///
    /// Panics if a queue capacity in `config` is not a power of two.
    /// [`PacerConfig::from_toml_str`] rejects such configs up front.
    pub fn new(transport: T, config: &PacerConfig) -> Self {
        Self::with_clock(transport, config, Clock::new())
    }

    /// Create an engine on an explicit clock (tests use `Clock::mock()`).
    pub fn with_clock(transport: T, config: &PacerConfig, clock: Clock) -> Self {
        let timing = LinkTiming::new(TransportParameters::default(), config.queue.tx_capacity);
        let mut pacer = Pacer::new(
            config.pacing.clone(),
            config.chunk.clone(),
            timing.min_interval_us(),
        );
        pacer.park();

        PacedLink {
            transport,
            classifier: Box::new(config.status.clone()),
            clock,
            tx: Mutex::new(TxSide {
                queue: ByteQueue::new(config.queue.tx_capacity),
                cycle: SendCycle::new(config.cycle.completion_timeout),
                pacer,
                timing,
                stats: TxStats::new(),
            }),
            rx: Mutex::new(RxSide {
                queue: ByteQueue::new(config.queue.rx_capacity),
                stats: RxStats::new(),
            }),
            ready: AtomicBool::new(true),
            link_up: AtomicBool::new(false),
        }
    }

    /// Replace the completion-code classifier.
    pub fn with_classifier(mut self, classifier: impl StatusClassifier + 'static) -> Self {
        self.classifier = Box::new(classifier);
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn lock_tx(&self) -> MutexGuard<'_, TxSide> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_rx(&self) -> MutexGuard<'_, RxSide> {
        self.rx.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    /// Link established (and subscribed) with `params`.
    pub fn on_link_up(&self, params: TransportParameters) {
        let mut tx = self.lock_tx();
        tx.timing.update(params);
        let floor = tx.timing.min_interval_us();
        tx.pacer.reset_to_floor(floor);
        tx.reset_cycle();
        self.ready.store(tx.drained_to_low(), Ordering::Release);
        self.link_up.store(true, Ordering::Release);
        info!(
            mtu = params.mtu,
            mode = params.mode.as_str(),
            chunk = tx.timing.chunk_size(),
            floor_us = floor,
            "link up"
        );
    }

    /// Renegotiation: MTU, data length, PHY, mode or encryption changed.
    ///
    /// Always a full pacing reset while the link is up, even when `params`
    /// equal the current ones, so the final state does not depend on how
    /// this interleaves with completions.
    pub fn update_parameters(&self, params: TransportParameters) {
        let mut tx = self.lock_tx();
        tx.timing.update(params);
        let floor = tx.timing.min_interval_us();
        if self.is_link_up() {
            tx.pacer.reset_to_floor(floor);
        } else {
            tx.pacer.set_floor(floor);
        }
        tx.cycle.on_renegotiate();
        if tx.drained_to_low() {
            self.ready.store(true, Ordering::Release);
        }
        info!(
            mtu = params.mtu,
            octets = params.fragment_octets,
            fragment_us = params.fragment_time_us,
            mode = params.mode.as_str(),
            encrypted = params.encrypted,
            chunk = tx.timing.chunk_size(),
            floor_us = floor,
            "link parameters updated"
        );
    }

    /// Link lost. Queued TX data is kept for the next connection; pacing
    /// parks at the ceiling and must be re-earned.
    pub fn on_link_down(&self) {
        let mut tx = self.lock_tx();
        self.link_up.store(false, Ordering::Release);
        tx.reset_cycle();
        tx.timing.update(TransportParameters::default());
        let floor = tx.timing.min_interval_us();
        tx.pacer.set_floor(floor);
        tx.pacer.park();
        self.ready.store(tx.drained_to_low(), Ordering::Release);
        info!(queued = tx.queue.len(), "link down");
    }

    pub fn is_link_up(&self) -> bool {
        self.link_up.load(Ordering::Acquire)
    }

    // ─── Producer ───────────────────────────────────────────────────────

    /// Enqueue bytes for transmission. All or nothing: returns 0 when the
    /// data does not fit. Never blocks.
    pub fn write(&self, data: &[u8]) -> usize {
        let mut tx = self.lock_tx();
        let stored = tx.queue.push(data, false);
        tx.stats.bytes_written += stored as u64;
        if tx.queue.len() >= tx.timing.watermarks().high {
            self.ready.store(false, Ordering::Release);
        }
        stored
    }

    /// Whether producers should write more.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Bytes waiting in the TX queue, including the staged chunk.
    pub fn queued(&self) -> usize {
        self.lock_tx().queue.len()
    }

    /// Free space in the TX queue.
    pub fn writable(&self) -> usize {
        self.lock_tx().queue.free()
    }

    /// Nothing queued and nothing staged.
    pub fn is_drained(&self) -> bool {
        let tx = self.lock_tx();
        tx.queue.is_empty() && tx.cycle.staged().is_none()
    }

    // ─── Tick ───────────────────────────────────────────────────────────

    /// Advance the send cycle by one step. Never blocks.
    pub fn tick(&self) -> TickOutcome {
        if !self.is_link_up() {
            return TickOutcome::LinkDown;
        }

        let (data, generation, retransmit) = {
            let mut tx = self.lock_tx();
            let now = self.clock.now();
            let interval = tx.pacer.send_interval();
            let chunk_size = usize::from(tx.timing.chunk_size());
            let TxSide { queue, cycle, .. } = &mut *tx;
            let step = cycle.prepare(queue, chunk_size, interval, now);

            if step.consumed > 0 {
                tx.stats.chunks_acknowledged += 1;
                if tx.drained_to_low() {
                    self.ready.store(true, Ordering::Release);
                }
            }
            if step.staged {
                self.ready.store(false, Ordering::Release);
            }

            match step.action {
                CycleAction::Idle => return TickOutcome::Idle,
                CycleAction::Wait => return TickOutcome::Waiting,
                CycleAction::TimedOut => {
                    let above_low = tx.reached_low_water();
                    let event = tx.pacer.on_congestion(now, above_low);
                    tx.cycle.on_timeout();
                    tx.stats.completion_timeouts += 1;
                    tx.stats.congestion_events += 1;
                    tx.stats.record(&event);
                    warn!(
                        interval_us = tx.pacer.state().send_interval_us,
                        "completion timed out, treating as congestion"
                    );
                    return TickOutcome::TimedOut;
                }
                CycleAction::DroppedOversize { len } => {
                    if tx.drained_to_low() {
                        self.ready.store(true, Ordering::Release);
                    }
                    return TickOutcome::DroppedOversize { len };
                }
                CycleAction::Send {
                    data,
                    generation,
                    retransmit,
                } => (data, generation, retransmit),
            }
        };

        let len = data.len();
        let accepted = self.transport.send(&data);

        let mut tx = self.lock_tx();
        if accepted {
            tx.stats.chunks_sent += 1;
            tx.stats.bytes_sent += len as u64;
            if retransmit {
                tx.stats.retransmissions += 1;
            }
            debug!(len, retransmit, "chunk sent");
            TickOutcome::Sent { len, retransmit }
        } else {
            tx.cycle.on_rejected(generation);
            tx.stats.sends_rejected += 1;
            debug!(len, "transport refused chunk");
            TickOutcome::Rejected { len }
        }
    }

    /// Drain the TX queue synchronously: tick with 1 ms sleeps until it is
    /// empty, the link drops, or `timeout` passes. Returns whether it drained.
    pub fn flush_blocking(&self, timeout: Duration) -> bool {
        let deadline = quanta::Instant::now() + timeout;
        loop {
            self.tick();
            if self.is_drained() {
                return true;
            }
            if !self.is_link_up() || quanta::Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    // ─── Completion ─────────────────────────────────────────────────────

    /// Report the outcome of an earlier accepted send. Never blocks on the
    /// transport.
    pub fn on_completion(&self, code: i32) -> CompletionOutcome {
        let status = self.classifier.classify(code);
        let outcome = {
            let mut tx = self.lock_tx();
            self.apply_completion(&mut tx, code, status)
        };

        if outcome.event == PacingEvent::DisconnectRequested {
            self.transport.request_disconnect();
        }
        outcome
    }

    fn apply_completion(&self, tx: &mut TxSide, code: i32, status: CompletionStatus) -> CompletionOutcome {
        let mut outcome = CompletionOutcome {
            code,
            status,
            event: PacingEvent::None,
            matched: false,
        };

        // Completions arrive in send order, so the oldest owed one belongs
        // to a send the watchdog already gave up on.
        if status != CompletionStatus::Disconnected && tx.cycle.take_overdue() {
            tx.stats.late_completions += 1;
            debug!(code, status = status.as_str(), "late completion for timed-out send");
            return outcome;
        }

        let matched = tx.cycle.in_flight();
        outcome.matched = matched;
        if !matched && status != CompletionStatus::Disconnected {
            tx.stats.spurious_completions += 1;
            debug!(code, status = status.as_str(), "completion with nothing in flight");
            return outcome;
        }

        let now = self.clock.now();
        let above_low = tx.reached_low_water();
        let TxSide { pacer, timing, .. } = &mut *tx;
        let event = pacer.apply(status, timing, now, above_low);
        tx.stats.record(&event);
        outcome.event = event;

        match status {
            CompletionStatus::Success => {
                tx.cycle.acknowledge();
            }
            CompletionStatus::SizeMismatch | CompletionStatus::MalformedPayload => {
                if let PacingEvent::ChunkReduced { .. } = event {
                    if status == CompletionStatus::SizeMismatch {
                        tx.stats.size_reductions += 1;
                    } else {
                        tx.stats.malformed_reductions += 1;
                    }
                }
                if event.discards_staged() {
                    tx.cycle.discard();
                }
            }
            CompletionStatus::Congestion => {
                tx.stats.congestion_events += 1;
                if tx.cycle.fail() == FailureDisposition::Discarded {
                    debug!("stale chunk failed, re-staging");
                }
            }
            CompletionStatus::Unclassified => {
                warn!(code, name = self.classifier.code_name(code), "unclassified completion");
                tx.cycle.fail();
            }
            CompletionStatus::Disconnected => {
                tx.reset_cycle();
            }
        }

        if tx.drained_to_low() {
            self.ready.store(true, Ordering::Release);
        }
        outcome
    }

    // ─── RX ─────────────────────────────────────────────────────────────

    /// Inbound data from the transport. Never blocks: when the consumer
    /// falls behind the oldest bytes are overwritten and counted as drops.
    pub fn on_receive(&self, data: &[u8]) -> usize {
        let mut rx = self.lock_rx();
        let before = rx.queue.len();
        let stored = rx.queue.push(data, true);
        let dropped = (before + data.len()).saturating_sub(rx.queue.len());
        rx.stats.bytes_received += data.len() as u64;
        if dropped > 0 {
            rx.stats.bytes_dropped += dropped as u64;
            debug!(dropped, "rx overflow");
        }
        stored
    }

    /// Bytes waiting to be read.
    pub fn available(&self) -> usize {
        self.lock_rx().queue.len()
    }

    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut rx = self.lock_rx();
        let n = rx.queue.pop(buf);
        rx.stats.bytes_read += n as u64;
        n
    }

    pub fn peek_byte(&self) -> Option<u8> {
        self.lock_rx().queue.peek_byte()
    }

    /// Next complete line from the RX queue, if one is buffered.
    pub fn read_line(&self, reader: &mut LineReader) -> Option<String> {
        let mut rx = self.lock_rx();
        let before = rx.queue.len();
        let line = reader.next_line(&mut rx.queue);
        let read = before - rx.queue.len();
        rx.stats.bytes_read += read as u64;
        line
    }

    // ─── Telemetry ──────────────────────────────────────────────────────

    pub fn telemetry(&self) -> PacerTelemetry {
        let (rx_available, rx_stats) = {
            let rx = self.lock_rx();
            (rx.queue.len(), rx.stats.clone())
        };
        let tx = self.lock_tx();
        let state = tx.pacer.state();
        let params = tx.timing.params();
        let watermarks = tx.timing.watermarks();
        PacerTelemetry {
            link_up: self.is_link_up(),
            mode: params.mode,
            mtu: params.mtu,
            chunk_size: tx.timing.chunk_size(),
            send_interval_us: state.send_interval_us,
            min_send_interval_us: state.min_send_interval_us,
            lkg_interval_us: state.lkg_interval_us,
            phase: state.phase(),
            probing: state.probing,
            recently_backed_off: state.recently_backed_off,
            producer_ready: self.is_ready(),
            tx_queued: tx.queue.len(),
            tx_capacity: tx.queue.capacity(),
            low_water: watermarks.low,
            high_water: watermarks.high,
            staged_len: tx.cycle.staged_len(),
            in_flight: tx.cycle.in_flight(),
            rx_available,
            tx: tx.stats.clone(),
            rx: rx_stats,
        }
    }
}
