//! # Pacing State Machine
//!
//! Decides how long to wait between chunks. Two floors are tracked: the hard
//! minimum from the timing model, and the last-known-good (LKG) interval that
//! has been observed to work. The active interval sits on the LKG except
//! while probing below it.
//!
//! ```text
//!            64 clean sends              48 clean sends
//!   ┌──────┐ ───────────────▶ ┌─────────┐ ─────────────▶ LKG := interval
//!   │ IDLE │                  │ PROBING │                 back to IDLE
//!   └──────┘ ◀─────────────── └─────────┘
//!      │       congestion:          │
//!      │       revert to LKG        │
//!      │                            │
//!      │ congestion (any)           │
//!      ▼                            ▼
//!   ┌──────────┐  64 clean sends  ┌──────┐
//!   │ COOLDOWN │ ───────────────▶ │ IDLE │
//!   └──────────┘                  └──────┘
//!
//!   3 congestion failures at LKG (≥1 s apart, queue above low water)
//!     → LKG × 1.03, clamped to [floor, ceiling]
//! ```
//!
//! Chunk sizing reacts to payload complaints from the transport: a size
//! mismatch halves the chunk, a malformed payload shrinks it by ~10%.
//! Both discard the staged chunk so it is re-cut at the new size.

use quanta::Instant;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::status::CompletionStatus;
use crate::timing::{LinkTiming, MIN_CHUNK_SIZE};

// ─── Configuration ──────────────────────────────────────────────────────────

/// Thresholds and step sizes for the pacing state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacingConfig {
    /// Clean sends at steady state before probing a shorter interval.
    pub probe_after_successes: u16,
    /// Clean sends while probing before the probe is accepted.
    pub probe_confirm_successes: u16,
    /// Smallest probe step (µs).
    pub probe_step_floor_us: u64,
    /// Probe step as a percentage of the current interval.
    pub probe_step_pct: u64,
    /// Clean sends needed to leave the post-backoff cooldown.
    pub cooldown_successes: u16,
    /// Congestion failures at the LKG before the LKG is relaxed.
    pub lkg_escalate_after_fails: u8,
    pub lkg_escalate_num: u64,
    pub lkg_escalate_den: u64,
    /// Minimum spacing between two LKG relaxations.
    pub escalate_cooldown: Duration,
    /// Absolute interval ceiling (µs).
    pub max_interval_us: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        PacingConfig {
            probe_after_successes: 64,
            probe_confirm_successes: 48,
            probe_step_floor_us: 10,
            probe_step_pct: 2,
            cooldown_successes: 64,
            lkg_escalate_after_fails: 3,
            lkg_escalate_num: 103,
            lkg_escalate_den: 100,
            escalate_cooldown: Duration::from_secs(1),
            max_interval_us: 1_000_000,
        }
    }
}

/// Retry budgets for chunk-size reductions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkConfig {
    /// Halvings on size mismatch before forcing the minimum chunk.
    pub size_retry_max: u8,
    /// ~10% reductions on malformed payloads.
    pub malformed_retry_max: u8,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        ChunkConfig {
            size_retry_max: 3,
            malformed_retry_max: 8,
        }
    }
}

// ─── State ──────────────────────────────────────────────────────────────────

/// Coarse phase, derived from [`PacingState`] flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PacingPhase {
    Idle,
    ProbingFaster,
    Cooldown,
}

/// Pacing variables for one link. Mutated only by [`Pacer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PacingState {
    pub send_interval_us: u64,
    pub min_send_interval_us: u64,
    pub lkg_interval_us: u64,
    pub probing: bool,
    pub probe_successes: u16,
    pub probe_failures: u16,
    pub lkg_fail_streak: u8,
    pub recently_backed_off: bool,
    pub cooldown_successes: u16,
    pub success_streak: u16,
    #[serde(skip)]
    pub last_escalation: Option<Instant>,
}

impl PacingState {
    fn at(interval_us: u64, floor_us: u64) -> Self {
        PacingState {
            send_interval_us: interval_us,
            min_send_interval_us: floor_us,
            lkg_interval_us: interval_us,
            probing: false,
            probe_successes: 0,
            probe_failures: 0,
            lkg_fail_streak: 0,
            recently_backed_off: false,
            cooldown_successes: 0,
            success_streak: 0,
            last_escalation: None,
        }
    }

    pub fn phase(&self) -> PacingPhase {
        if self.probing {
            PacingPhase::ProbingFaster
        } else if self.recently_backed_off {
            PacingPhase::Cooldown
        } else {
            PacingPhase::Idle
        }
    }
}

// ─── Events ─────────────────────────────────────────────────────────────────

/// Observable result of one transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingEvent {
    None,
    CooldownCleared,
    ProbeStarted { from_us: u64, to_us: u64 },
    ProbeAccepted { interval_us: u64 },
    ProbeAbandoned { reverted_to_us: u64 },
    BackedOff { fail_streak: u8 },
    Escalated { lkg_us: u64 },
    LinkLost { interval_us: u64 },
    ChunkReduced { from: u16, to: u16 },
    ChunkForcedMinimum { from: u16 },
    /// Malformed-payload retries exhausted; chunk left as is.
    ChunkUnchanged,
    /// Size mismatch persists at the minimum chunk; the link should drop.
    DisconnectRequested,
}

impl PacingEvent {
    /// Whether the staged chunk must be thrown away and re-cut.
    pub fn discards_staged(&self) -> bool {
        matches!(
            self,
            PacingEvent::ChunkReduced { .. }
                | PacingEvent::ChunkForcedMinimum { .. }
                | PacingEvent::ChunkUnchanged
                | PacingEvent::DisconnectRequested
        )
    }
}

// ─── Pacer ──────────────────────────────────────────────────────────────────

/// Probe / cooldown / escalate / backoff controller for one link.
pub struct Pacer {
    config: PacingConfig,
    chunk_config: ChunkConfig,
    state: PacingState,
    size_retries: u8,
    forced_minimum: bool,
    malformed_retries: u8,
}

impl Pacer {
    /// Start at the floor with all counters clear.
    pub fn new(config: PacingConfig, chunk_config: ChunkConfig, floor_us: u64) -> Self {
        Pacer {
            config,
            chunk_config,
            state: PacingState::at(floor_us, floor_us),
            size_retries: 0,
            forced_minimum: false,
            malformed_retries: 0,
        }
    }

    pub fn state(&self) -> &PacingState {
        &self.state
    }

    pub fn config(&self) -> &PacingConfig {
        &self.config
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_micros(self.state.send_interval_us)
    }

    pub fn is_probing(&self) -> bool {
        self.state.probing
    }

    /// The interval ceiling, never below the current floor.
    pub fn ceiling_us(&self) -> u64 {
        self.config.max_interval_us.max(self.state.min_send_interval_us)
    }

    // ─── Resets ─────────────────────────────────────────────────────────

    /// New link parameters or link-up: everything back to the floor.
    pub fn reset_to_floor(&mut self, floor_us: u64) {
        let last_escalation = self.state.last_escalation;
        self.state = PacingState::at(floor_us, floor_us);
        self.state.last_escalation = last_escalation;
        self.size_retries = 0;
        self.forced_minimum = false;
        self.malformed_retries = 0;
    }

    /// Link-down: park at the ceiling and forget escalation history.
    pub fn park(&mut self) {
        let floor = self.state.min_send_interval_us;
        let ceiling = self.ceiling_us();
        self.state = PacingState::at(ceiling, floor);
        self.size_retries = 0;
        self.forced_minimum = false;
        self.malformed_retries = 0;
    }

    /// Start from a specific interval, clamped to `[floor, ceiling]`.
    pub fn set_interval(&mut self, interval_us: u64) {
        let floor = self.state.min_send_interval_us;
        let interval = interval_us.clamp(floor, self.ceiling_us());
        let last_escalation = self.state.last_escalation;
        self.state = PacingState::at(interval, floor);
        self.state.last_escalation = last_escalation;
    }

    /// Move the hard floor, keeping both intervals at or above it.
    pub fn set_floor(&mut self, floor_us: u64) {
        let s = &mut self.state;
        s.min_send_interval_us = floor_us;
        s.send_interval_us = s.send_interval_us.max(floor_us);
        s.lkg_interval_us = s.lkg_interval_us.max(floor_us);
        if s.probing && s.send_interval_us >= s.lkg_interval_us {
            s.probing = false;
            s.probe_successes = 0;
            s.send_interval_us = s.lkg_interval_us;
        }
    }

    // ─── Completion Dispatch ────────────────────────────────────────────

    /// Apply one classified completion.
    ///
    /// `above_low_water` reports whether the TX queue holds more than the
    /// low-water mark; LKG escalation only happens under real load.
    pub fn apply(
        &mut self,
        status: CompletionStatus,
        timing: &mut LinkTiming,
        now: Instant,
        above_low_water: bool,
    ) -> PacingEvent {
        match status {
            CompletionStatus::Success => self.on_success(),
            CompletionStatus::SizeMismatch => self.on_size_mismatch(timing),
            CompletionStatus::MalformedPayload => self.on_malformed(timing),
            CompletionStatus::Congestion => self.on_congestion(now, above_low_water),
            CompletionStatus::Disconnected => self.on_disconnected(),
            CompletionStatus::Unclassified => self.on_unclassified(),
        }
    }

    pub fn on_success(&mut self) -> PacingEvent {
        self.size_retries = 0;
        self.forced_minimum = false;
        let cfg = &self.config;
        let s = &mut self.state;

        if s.recently_backed_off {
            s.cooldown_successes += 1;
            if s.cooldown_successes >= cfg.cooldown_successes {
                s.recently_backed_off = false;
                s.cooldown_successes = 0;
                s.success_streak = 0;
                s.lkg_fail_streak = 0;
                debug!(interval_us = s.send_interval_us, "cooldown complete");
                return PacingEvent::CooldownCleared;
            }
            return PacingEvent::None;
        }

        if s.probing {
            s.probe_successes += 1;
            if s.probe_successes >= cfg.probe_confirm_successes {
                s.lkg_interval_us = s.send_interval_us;
                s.probing = false;
                s.probe_successes = 0;
                s.probe_failures = 0;
                s.lkg_fail_streak = 0;
                s.success_streak = 0;
                info!(lkg_us = s.lkg_interval_us, "probe accepted");
                return PacingEvent::ProbeAccepted {
                    interval_us: s.lkg_interval_us,
                };
            }
            return PacingEvent::None;
        }

        s.lkg_fail_streak = 0;
        s.success_streak += 1;
        if s.success_streak < cfg.probe_after_successes {
            return PacingEvent::None;
        }

        s.success_streak = 0;
        s.lkg_interval_us = s.send_interval_us;
        let step = scale(s.send_interval_us, cfg.probe_step_pct, 100, false).max(cfg.probe_step_floor_us);
        let candidate = s
            .send_interval_us
            .saturating_sub(step)
            .max(s.min_send_interval_us);
        if candidate >= s.send_interval_us {
            return PacingEvent::None;
        }

        let from_us = s.send_interval_us;
        s.send_interval_us = candidate;
        s.probing = true;
        s.probe_successes = 0;
        s.probe_failures = 0;
        info!(from_us, to_us = candidate, "starting probe");
        PacingEvent::ProbeStarted {
            from_us,
            to_us: candidate,
        }
    }

    pub fn on_congestion(&mut self, now: Instant, above_low_water: bool) -> PacingEvent {
        let ceiling = self.ceiling_us();
        let cfg = &self.config;
        let s = &mut self.state;

        s.success_streak = 0;
        s.recently_backed_off = true;
        s.cooldown_successes = 0;

        if s.probing {
            s.probing = false;
            s.probe_successes = 0;
            s.probe_failures = s.probe_failures.saturating_add(1);
            s.send_interval_us = s.lkg_interval_us;
            s.lkg_fail_streak = 0;
            info!(lkg_us = s.lkg_interval_us, "probe failed, reverting");
            return PacingEvent::ProbeAbandoned {
                reverted_to_us: s.lkg_interval_us,
            };
        }

        s.lkg_fail_streak = s.lkg_fail_streak.saturating_add(1);
        let cooled = s
            .last_escalation
            .is_none_or(|at| now.saturating_duration_since(at) >= cfg.escalate_cooldown);
        if s.lkg_fail_streak < cfg.lkg_escalate_after_fails || !cooled || !above_low_water {
            return PacingEvent::BackedOff {
                fail_streak: s.lkg_fail_streak,
            };
        }

        s.last_escalation = Some(now);
        s.lkg_fail_streak = 0;
        let next = scale(s.lkg_interval_us, cfg.lkg_escalate_num, cfg.lkg_escalate_den, true)
            .clamp(s.min_send_interval_us, ceiling);
        s.lkg_interval_us = next;
        s.send_interval_us = next;
        info!(lkg_us = next, "escalating last-known-good interval");
        PacingEvent::Escalated { lkg_us: next }
    }

    pub fn on_disconnected(&mut self) -> PacingEvent {
        let ceiling = self.ceiling_us();
        let s = &mut self.state;
        s.success_streak = 0;
        s.recently_backed_off = false;
        s.cooldown_successes = 0;
        s.probing = false;
        s.probe_successes = 0;
        s.probe_failures = 0;
        s.lkg_fail_streak = 0;
        s.send_interval_us = ceiling;
        s.lkg_interval_us = ceiling;
        warn!(interval_us = ceiling, "link closed, pacing parked at ceiling");
        PacingEvent::LinkLost {
            interval_us: ceiling,
        }
    }

    pub fn on_unclassified(&mut self) -> PacingEvent {
        let s = &mut self.state;
        if !s.probing {
            return PacingEvent::None;
        }
        s.probing = false;
        s.probe_successes = 0;
        s.send_interval_us = s.lkg_interval_us;
        info!(lkg_us = s.lkg_interval_us, "unclassified completion while probing, reverting");
        PacingEvent::ProbeAbandoned {
            reverted_to_us: s.lkg_interval_us,
        }
    }

    // ─── Chunk Sizing ───────────────────────────────────────────────────

    pub fn on_size_mismatch(&mut self, timing: &mut LinkTiming) -> PacingEvent {
        let current = timing.chunk_size();

        let event = if self.size_retries < self.chunk_config.size_retry_max {
            self.size_retries += 1;
            let to = (current / 2).max(MIN_CHUNK_SIZE);
            info!(
                from = current,
                to,
                retry = self.size_retries,
                max = self.chunk_config.size_retry_max,
                "size mismatch, halving chunk"
            );
            PacingEvent::ChunkReduced { from: current, to }
        } else if current > MIN_CHUNK_SIZE && !self.forced_minimum {
            self.forced_minimum = true;
            warn!(from = current, to = MIN_CHUNK_SIZE, "size mismatch persists, forcing minimum chunk");
            PacingEvent::ChunkForcedMinimum { from: current }
        } else {
            warn!(chunk = current, "size mismatch at minimum chunk, requesting disconnect");
            self.size_retries = 0;
            self.forced_minimum = false;
            return PacingEvent::DisconnectRequested;
        };

        let to = match event {
            PacingEvent::ChunkReduced { to, .. } => to,
            _ => MIN_CHUNK_SIZE,
        };
        timing.set_chunk_size(to);
        self.set_floor(timing.min_interval_us());
        event
    }

    pub fn on_malformed(&mut self, timing: &mut LinkTiming) -> PacingEvent {
        let current = timing.chunk_size();
        if self.malformed_retries >= self.chunk_config.malformed_retry_max {
            warn!(chunk = current, "malformed payload persists");
            return PacingEvent::ChunkUnchanged;
        }

        let to = (current * 9 / 10).max(MIN_CHUNK_SIZE);
        if to >= current {
            return PacingEvent::ChunkUnchanged;
        }
        self.malformed_retries += 1;
        timing.set_chunk_size(to);
        self.set_floor(timing.min_interval_us());
        info!(
            from = current,
            to,
            retry = self.malformed_retries,
            max = self.chunk_config.malformed_retry_max,
            "malformed payload, shrinking chunk"
        );
        PacingEvent::ChunkReduced { from: current, to }
    }
}

/// `value * num / den` in 128-bit, saturating at `u64::MAX`.
fn scale(value: u64, num: u64, den: u64, round_up: bool) -> u64 {
    let product = u128::from(value) * u128::from(num);
    let den = u128::from(den.max(1));
    let q = if round_up { product.div_ceil(den) } else { product / den };
    u64::try_from(q).unwrap_or(u64::MAX)
}
