//! # Link Timing Model
//!
//! Pure functions from negotiated link parameters to the three numbers the
//! pacer needs: how big a chunk may be, how often one may be sent, and how
//! much buffered data counts as "low".
//!
//! A notification travels as one L2CAP SDU (4-byte header) carrying one ATT
//! PDU (3-byte header). The SDU is split into link-layer fragments of
//! `fragment_octets` bytes, each costing `fragment_time_us` of air time and,
//! on an encrypted link, a 4-byte MIC.
//!
//! ```text
//!   chunk  = min(mtu - 3, n_frag × (octets - mic) - 7), floored at 20
//!   floor  = ceil((chunk + 7) / (octets - mic)) × fragment_time × guard
//!   low    = clamp(2 × chunk, chunk, capacity / 4)
//! ```

use serde::Serialize;

// ─── Protocol Constants ─────────────────────────────────────────────────────

/// ATT notification header.
pub const ATT_HEADER_BYTES: u16 = 3;
/// L2CAP basic header.
pub const L2CAP_HEADER_BYTES: u16 = 4;
/// Headers carried once per chunk.
pub const FIXED_OVERHEAD_BYTES: u16 = ATT_HEADER_BYTES + L2CAP_HEADER_BYTES;
/// Message integrity check appended to every encrypted fragment.
pub const MIC_BYTES: u16 = 4;
/// Smallest chunk worth sending (default-MTU ATT payload).
pub const MIN_CHUNK_SIZE: u16 = 20;

pub const MIN_MTU: u16 = 23;
pub const DEFAULT_MTU: u16 = 247;
pub const MAX_MTU: u16 = 517;

pub const LL_MIN_OCTETS: u16 = 27;
pub const LL_CONS_OCTETS: u16 = 244;
pub const LL_MAX_OCTETS: u16 = 251;

// ─── Link Mode ──────────────────────────────────────────────────────────────

/// Operating profile negotiated for the connection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMode {
    /// Shortest connection interval, tightest pacing guard.
    #[default]
    Fast,
    Balanced,
    LowPower,
    LongRange,
}

impl LinkMode {
    /// Safety margin applied to the air-time floor, in percent.
    pub fn guard_pct(self) -> u64 {
        match self {
            LinkMode::Fast => 103,
            LinkMode::Balanced => 108,
            LinkMode::LowPower => 112,
            LinkMode::LongRange => 115,
        }
    }

    /// How many link fragments one chunk may span.
    pub fn max_fragments_per_chunk(self) -> u16 {
        match self {
            LinkMode::Fast => 2,
            _ => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LinkMode::Fast => "fast",
            LinkMode::Balanced => "balanced",
            LinkMode::LowPower => "low_power",
            LinkMode::LongRange => "long_range",
        }
    }
}

// ─── PHY ────────────────────────────────────────────────────────────────────

/// Physical layer coding in use on the link.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Phy {
    #[default]
    OneM,
    TwoM,
    /// Coded PHY, S=2.
    CodedS2,
    /// Coded PHY, S=8.
    CodedS8,
}

impl Phy {
    /// Air time of one maximum-size link fragment (µs).
    pub fn fragment_time_us(self) -> u32 {
        match self {
            Phy::OneM => 2120,
            Phy::TwoM => 1060,
            Phy::CodedS2 => 4240,
            Phy::CodedS8 => 16960,
        }
    }
}

// ─── Transport Parameters ───────────────────────────────────────────────────

/// Per-connection values negotiated by the link. Replaced wholesale on every
/// renegotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransportParameters {
    /// Negotiated ATT MTU.
    pub mtu: u16,
    /// Link-layer fragment payload size (octets).
    pub fragment_octets: u16,
    /// Air time per fragment (µs).
    pub fragment_time_us: u32,
    pub mode: LinkMode,
    pub encrypted: bool,
}

impl Default for TransportParameters {
    /// Conservative values assumed while no link is negotiated.
    fn default() -> Self {
        TransportParameters {
            mtu: MIN_MTU,
            fragment_octets: LL_MAX_OCTETS,
            fragment_time_us: Phy::OneM.fragment_time_us(),
            mode: LinkMode::Fast,
            encrypted: false,
        }
    }
}

impl TransportParameters {
    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu.clamp(MIN_MTU, MAX_MTU);
        self
    }

    /// Apply a data-length update.
    pub fn with_fragment(mut self, octets: u16, time_us: u32) -> Self {
        self.fragment_octets = octets.clamp(LL_MIN_OCTETS, LL_MAX_OCTETS);
        self.fragment_time_us = time_us;
        self
    }

    /// Apply a PHY update; only the fragment air time changes.
    pub fn with_phy(mut self, phy: Phy) -> Self {
        self.fragment_time_us = phy.fragment_time_us();
        self
    }

    pub fn with_mode(mut self, mode: LinkMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_encryption(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    /// Largest ATT notification value.
    pub fn payload_ceiling(&self) -> u16 {
        self.mtu.saturating_sub(ATT_HEADER_BYTES)
    }

    /// Usable bytes per link fragment after encryption overhead.
    pub fn fragment_capacity(&self) -> u16 {
        let mic = if self.encrypted { MIC_BYTES } else { 0 };
        self.fragment_octets.saturating_sub(mic)
    }
}

// ─── Pure Computations ──────────────────────────────────────────────────────

/// Largest chunk that fits both the ATT payload and the fragment budget the
/// mode allows.
pub fn compute_chunk_size(params: &TransportParameters) -> u16 {
    let fragments = u32::from(params.mode.max_fragments_per_chunk());
    let fragment_budget = (fragments * u32::from(params.fragment_capacity()))
        .saturating_sub(u32::from(FIXED_OVERHEAD_BYTES));
    let limit = fragment_budget.min(u32::from(params.payload_ceiling()));
    (limit as u16).max(MIN_CHUNK_SIZE)
}

/// Minimum spacing between sends for a chunk of `chunk_size` bytes (µs).
///
/// Rounded up so the guard never undershoots.
pub fn compute_min_interval_us(chunk_size: u16, params: &TransportParameters) -> u64 {
    let sdu = u64::from(chunk_size) + u64::from(FIXED_OVERHEAD_BYTES);
    let per_fragment = u64::from(params.fragment_capacity()).max(1);
    let fragments = sdu.div_ceil(per_fragment);
    (fragments * u64::from(params.fragment_time_us) * params.mode.guard_pct()).div_ceil(100)
}

/// Two chunks of buffered data, capped at a quarter of the queue, never
/// below one chunk.
pub fn compute_low_water_mark(chunk_size: u16, capacity: usize) -> usize {
    let chunk = usize::from(chunk_size);
    (2 * chunk).min(capacity / 4).max(chunk)
}

/// Occupancy at which producers are asked to pause.
pub fn compute_high_water_mark(capacity: usize) -> usize {
    capacity * 3 / 4
}

// ─── Link Timing ────────────────────────────────────────────────────────────

/// Producer admission thresholds (bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Watermarks {
    pub low: usize,
    pub high: usize,
}

/// Current parameters plus everything derived from them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTiming {
    params: TransportParameters,
    capacity: usize,
    chunk_size: u16,
    min_interval_us: u64,
    watermarks: Watermarks,
}

impl LinkTiming {
    /// Derive timing for `params` with a TX queue of `capacity` bytes.
    pub fn new(params: TransportParameters, capacity: usize) -> Self {
        let chunk_size = compute_chunk_size(&params);
        LinkTiming {
            params,
            capacity,
            chunk_size,
            min_interval_us: compute_min_interval_us(chunk_size, &params),
            watermarks: Watermarks {
                low: compute_low_water_mark(chunk_size, capacity),
                high: compute_high_water_mark(capacity),
            },
        }
    }

    /// Replace the parameters and recompute everything.
    pub fn update(&mut self, params: TransportParameters) {
        *self = Self::new(params, self.capacity);
    }

    /// Override the chunk size (after a size complaint from the transport)
    /// and recompute the interval floor and low-water mark for it.
    pub fn set_chunk_size(&mut self, chunk_size: u16) {
        self.chunk_size = chunk_size.max(MIN_CHUNK_SIZE);
        self.min_interval_us = compute_min_interval_us(self.chunk_size, &self.params);
        self.watermarks.low = compute_low_water_mark(self.chunk_size, self.capacity);
    }

    pub fn params(&self) -> &TransportParameters {
        &self.params
    }

    pub fn chunk_size(&self) -> u16 {
        self.chunk_size
    }

    pub fn min_interval_us(&self) -> u64 {
        self.min_interval_us
    }

    pub fn watermarks(&self) -> Watermarks {
        self.watermarks
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
