//! # Integration tests: producer → PacedLink → simulated transport
//!
//! The transport is a scripted fake: every accepted send is recorded and the
//! test decides which completion code comes back. Time is a mocked quanta
//! clock, so pacing intervals are exact.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nus_pacer::pacing::{PacingEvent, PacingPhase};
use nus_pacer::status::nimble;
use nus_pacer::{LinkMode, PacedLink, PacerConfig, Phy, TickOutcome, Transport, TransportParameters};
use quanta::{Clock, Mock};

// ─── Helpers ────────────────────────────────────────────────────────────────

/// `RUST_LOG=nus_pacer=debug cargo test` shows the pacing decisions.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct SimTransport {
    sent: Mutex<VecDeque<Vec<u8>>>,
    delivered: Mutex<Vec<u8>>,
    disconnects: AtomicUsize,
}

impl Transport for SimTransport {
    fn send(&self, chunk: &[u8]) -> bool {
        self.sent.lock().unwrap().push_back(chunk.to_vec());
        true
    }

    fn request_disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }
}

struct Harness {
    link: PacedLink<Arc<SimTransport>>,
    transport: Arc<SimTransport>,
    mock: Arc<Mock>,
}

impl Harness {
    fn new(config: &PacerConfig) -> Self {
        init_tracing();
        let (clock, mock) = Clock::mock();
        mock.increment(Duration::from_secs(10));
        let transport = Arc::new(SimTransport::default());
        let link = PacedLink::with_clock(transport.clone(), config, clock);
        Harness { link, transport, mock }
    }

    fn advance_us(&self, us: u64) {
        self.mock.increment(Duration::from_micros(us));
    }

    /// Tick once after a full interval and complete the send with `code`.
    /// Returns whether a chunk went out.
    fn step(&self, code: i32) -> bool {
        self.advance_us(self.link.telemetry().send_interval_us);
        match self.link.tick() {
            TickOutcome::Sent { .. } => {
                let chunk = self.transport.sent.lock().unwrap().pop_back().unwrap();
                if code == nimble::OK {
                    self.transport.delivered.lock().unwrap().extend_from_slice(&chunk);
                }
                self.link.on_completion(code);
                true
            }
            _ => false,
        }
    }

    /// Like [`Harness::step`], topping the queue up first so the link never
    /// runs dry mid-scenario.
    fn step_loaded(&self, code: i32) -> bool {
        if self.link.queued() < 1024 {
            self.link.write(&pattern(2048));
        }
        self.step(code)
    }

    fn drain(&self, code: i32, max_steps: usize) {
        for _ in 0..max_steps {
            if self.link.is_drained() {
                return;
            }
            self.step(code);
        }
    }
}

fn balanced() -> TransportParameters {
    TransportParameters::default()
        .with_mtu(183)
        .with_fragment(244, Phy::TwoM.fragment_time_us())
        .with_mode(LinkMode::Balanced)
}

fn pattern(n: usize) -> Vec<u8> {
    (0..n).map(|i| (i * 7 % 256) as u8).collect()
}

// ─── Delivery ───────────────────────────────────────────────────────────────

#[test]
fn clean_link_delivers_everything_in_order() {
    let h = Harness::new(&PacerConfig::default());
    h.link.on_link_up(balanced());
    let data = pattern(3000);
    assert_eq!(h.link.write(&data), 3000);

    h.drain(nimble::OK, 100);
    assert!(h.link.is_drained());
    assert_eq!(*h.transport.delivered.lock().unwrap(), data);

    let t = h.link.telemetry();
    assert_eq!(t.tx.bytes_written, 3000);
    assert_eq!(t.tx.chunks_acknowledged, 17);
    assert!(t.producer_ready);
}

#[test]
fn congestion_loses_no_data() {
    let h = Harness::new(&PacerConfig::default());
    h.link.on_link_up(balanced());
    let data = pattern(1000);
    h.link.write(&data);

    for i in 0..200 {
        if h.link.is_drained() {
            break;
        }
        let code = if i % 3 == 0 { nimble::ENOMEM } else { nimble::OK };
        h.step(code);
    }
    assert!(h.link.is_drained());
    assert_eq!(*h.transport.delivered.lock().unwrap(), data);
    assert!(h.link.telemetry().tx.retransmissions > 0);
}

// ─── Pacing ─────────────────────────────────────────────────────────────────

#[test]
fn relaxed_interval_is_reclaimed_by_probing() {
    let h = Harness::new(&PacerConfig::default());
    h.link.on_link_up(balanced());

    // Sustained congestion under load relaxes the last-known-good interval
    for _ in 0..3 {
        h.step_loaded(nimble::EBUSY);
    }
    let relaxed = h.link.telemetry().lkg_interval_us;
    assert_eq!(relaxed, (1145u64 * 103).div_ceil(100));

    // Cooldown, then a clean streak triggers a probe below it
    for _ in 0..64 {
        h.step_loaded(nimble::OK);
    }
    assert_eq!(h.link.telemetry().phase, PacingPhase::Idle);
    for _ in 0..64 {
        h.step_loaded(nimble::OK);
    }
    let t = h.link.telemetry();
    assert!(t.probing);
    assert!(t.send_interval_us < relaxed);
    assert!(t.send_interval_us >= t.min_send_interval_us);
    assert_eq!(t.tx.probes_started, 1);
}

#[test]
fn disconnect_completion_mid_probe_parks_at_ceiling() {
    let h = Harness::new(&PacerConfig::default());
    h.link.on_link_up(balanced());
    for _ in 0..3 {
        h.step_loaded(nimble::ETIMEOUT);
    }
    for _ in 0..64 {
        h.step_loaded(nimble::OK);
    }
    for _ in 0..64 {
        h.step_loaded(nimble::OK);
    }
    assert!(h.link.telemetry().probing);

    h.step_loaded(nimble::ENOTCONN);
    let t = h.link.telemetry();
    assert_eq!(t.send_interval_us, 1_000_000);
    assert_eq!(t.lkg_interval_us, 1_000_000);
    assert!(!t.probing);
    assert!(!t.recently_backed_off);
}

// ─── Renegotiation ──────────────────────────────────────────────────────────

#[test]
fn parameter_update_resets_pacing_to_new_floor() {
    let h = Harness::new(&PacerConfig::default());
    h.link.on_link_up(balanced());
    h.link.write(&pattern(2000));
    for _ in 0..3 {
        h.step(nimble::ENOMEM);
    }
    assert!(h.link.telemetry().recently_backed_off);

    h.link.update_parameters(balanced().with_phy(Phy::CodedS8));
    let t = h.link.telemetry();
    assert_eq!(t.min_send_interval_us, (16960u64 * 108).div_ceil(100));
    assert_eq!(t.send_interval_us, t.min_send_interval_us);
    assert_eq!(t.lkg_interval_us, t.min_send_interval_us);
    assert_eq!(t.phase, PacingPhase::Idle);
}

#[test]
fn mtu_shrink_while_idle_recuts_chunks() {
    let h = Harness::new(&PacerConfig::default());
    h.link.on_link_up(balanced());
    h.link.write(&pattern(500));
    h.link.update_parameters(balanced().with_mtu(23));
    assert!(h.step(nimble::OK));
    assert_eq!(h.transport.delivered.lock().unwrap().len(), 20);
}

#[test]
fn size_mismatch_escalates_to_disconnect_request() {
    let h = Harness::new(&PacerConfig::default());
    h.link.on_link_up(balanced());
    h.link.write(&pattern(500));

    let mut events = Vec::new();
    for _ in 0..10 {
        h.advance_us(10_000);
        if let TickOutcome::Sent { .. } = h.link.tick() {
            events.push(h.link.on_completion(nimble::EMSGSIZE).event);
        }
        if h.transport.disconnects.load(Ordering::Relaxed) > 0 {
            break;
        }
    }
    assert_eq!(
        events,
        [
            PacingEvent::ChunkReduced { from: 180, to: 90 },
            PacingEvent::ChunkReduced { from: 90, to: 45 },
            PacingEvent::ChunkReduced { from: 45, to: 22 },
            PacingEvent::ChunkForcedMinimum { from: 22 },
            PacingEvent::DisconnectRequested,
        ]
    );
    // Nothing was lost
    assert_eq!(h.link.queued(), 500);
}

// ─── Lifecycle ──────────────────────────────────────────────────────────────

#[test]
fn reconnect_resumes_queued_data() {
    let h = Harness::new(&PacerConfig::default());
    h.link.on_link_up(balanced());
    let data = pattern(600);
    h.link.write(&data);
    h.step(nimble::OK);
    // In flight when the link drops: the chunk is re-sent after reconnect
    h.advance_us(2000);
    h.link.tick();
    h.transport.sent.lock().unwrap().clear();
    h.link.on_link_down();
    assert_eq!(h.link.tick(), TickOutcome::LinkDown);

    h.link.on_link_up(balanced());
    h.drain(nimble::OK, 50);
    assert_eq!(*h.transport.delivered.lock().unwrap(), data);
}

#[test]
fn custom_status_table_from_config() {
    let config = PacerConfig::from_toml_str(
        r#"
        [status]
        success = [0]
        congestion = [42]
        "#,
    )
    .unwrap();
    let h = Harness::new(&config);
    h.link.on_link_up(balanced());
    h.link.write(b"hello");
    h.step(42);
    assert!(h.link.telemetry().recently_backed_off);
    // EDONE is no longer a success code
    h.advance_us(2000);
    h.link.tick();
    let outcome = h.link.on_completion(nimble::EDONE);
    assert_eq!(outcome.status, nus_pacer::CompletionStatus::Unclassified);
}
