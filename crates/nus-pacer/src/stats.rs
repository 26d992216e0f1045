//! # Pacer Statistics
//!
//! Counters and point-in-time snapshots for one paced link. Observability
//! only: nothing in the engine reads these back. All types serialize to JSON
//! for host-side dashboards.

use serde::Serialize;

use crate::pacing::{PacingEvent, PacingPhase};
use crate::timing::LinkMode;

// ─── TX Stats ───────────────────────────────────────────────────────────────

/// Outbound counters, accumulated over the lifetime of the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TxStats {
    /// Bytes accepted from producers.
    pub bytes_written: u64,
    /// Bytes handed to the transport, retransmissions included.
    pub bytes_sent: u64,
    /// Send calls the transport accepted.
    pub chunks_sent: u64,
    /// Chunks confirmed and consumed from the queue.
    pub chunks_acknowledged: u64,
    /// Send calls the transport refused synchronously.
    pub sends_rejected: u64,
    /// Staged chunks re-sent after a failed completion.
    pub retransmissions: u64,
    pub probes_started: u64,
    pub probes_accepted: u64,
    pub probes_abandoned: u64,
    pub escalations: u64,
    pub congestion_events: u64,
    pub size_reductions: u64,
    pub malformed_reductions: u64,
    pub disconnect_requests: u64,
    pub completion_timeouts: u64,
    /// Completions that arrived with nothing in flight.
    pub spurious_completions: u64,
    /// Completions for sends the watchdog had already timed out.
    pub late_completions: u64,
}

impl TxStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one pacing transition into the counters.
    pub fn record(&mut self, event: &PacingEvent) {
        match event {
            PacingEvent::ProbeStarted { .. } => self.probes_started += 1,
            PacingEvent::ProbeAccepted { .. } => self.probes_accepted += 1,
            PacingEvent::ProbeAbandoned { .. } => self.probes_abandoned += 1,
            PacingEvent::Escalated { .. } => self.escalations += 1,
            PacingEvent::ChunkForcedMinimum { .. } => self.size_reductions += 1,
            PacingEvent::DisconnectRequested => self.disconnect_requests += 1,
            PacingEvent::None
            | PacingEvent::CooldownCleared
            | PacingEvent::BackedOff { .. }
            | PacingEvent::LinkLost { .. }
            | PacingEvent::ChunkReduced { .. }
            | PacingEvent::ChunkUnchanged => {}
        }
    }

    /// Fraction of accepted sends that were later acknowledged.
    pub fn ack_ratio(&self) -> f64 {
        if self.chunks_sent == 0 {
            0.0
        } else {
            self.chunks_acknowledged as f64 / self.chunks_sent as f64
        }
    }
}

// ─── RX Stats ───────────────────────────────────────────────────────────────

/// Inbound counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RxStats {
    pub bytes_received: u64,
    /// Bytes evicted or truncated because the consumer fell behind.
    pub bytes_dropped: u64,
    pub bytes_read: u64,
}

impl RxStats {
    pub fn new() -> Self {
        Self::default()
    }
}

// ─── Telemetry Snapshot ─────────────────────────────────────────────────────

/// Read-only view of the engine at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct PacerTelemetry {
    pub link_up: bool,
    pub mode: LinkMode,
    pub mtu: u16,
    pub chunk_size: u16,
    pub send_interval_us: u64,
    pub min_send_interval_us: u64,
    pub lkg_interval_us: u64,
    pub phase: PacingPhase,
    pub probing: bool,
    pub recently_backed_off: bool,
    pub producer_ready: bool,
    pub tx_queued: usize,
    pub tx_capacity: usize,
    pub low_water: usize,
    pub high_water: usize,
    pub staged_len: usize,
    pub in_flight: bool,
    pub rx_available: usize,
    pub tx: TxStats,
    pub rx: RxStats,
}

impl PacerTelemetry {
    /// TX queue fill level, 0.0 – 1.0.
    pub fn tx_fill(&self) -> f64 {
        if self.tx_capacity == 0 {
            0.0
        } else {
            self.tx_queued as f64 / self.tx_capacity as f64
        }
    }

    /// Effective payload rate at the current interval (bytes/s).
    pub fn pacing_rate_bps(&self) -> f64 {
        if self.send_interval_us == 0 {
            0.0
        } else {
            f64::from(self.chunk_size) * 1_000_000.0 / self.send_interval_us as f64
        }
    }
}
