//! # nus-pacer
//!
//! Adaptive transmission pacing for notification-style wireless links (BLE
//! UART over GATT notifications).
//!
//! The link's usable payload and per-send air time change every time MTU,
//! data length or PHY are renegotiated, and the outcome of each send arrives
//! later on a different context. The engine paces one chunk at a time,
//! probes for a shorter interval after long clean streaks, backs off to a
//! last-known-good interval on congestion, and keeps the producer queue
//! coherent with the one chunk that may be in flight.
//!
//! ## Crate structure
//!
//! - [`queue`]: Power-of-two circular byte buffer (TX and RX)
//! - [`timing`]: Chunk size, interval floor and watermarks from link parameters
//! - [`pacing`]: Probe / cooldown / escalate / backoff state machine
//! - [`status`]: Completion-code classification
//! - [`cycle`]: Single-slot staging between queue and transport
//! - [`link`]: The lock-guarded engine tying it together
//! - [`runtime`]: Owned pump thread
//! - [`config`]: TOML configuration
//! - [`stats`]: Counters and telemetry snapshots
//! - [`line`]: RX line reader

pub mod config;
pub mod cycle;
pub mod line;
pub mod link;
pub mod pacing;
pub mod queue;
pub mod runtime;
pub mod stats;
pub mod status;
pub mod timing;

pub use config::PacerConfig;
pub use link::{CompletionOutcome, PacedLink, TickOutcome, Transport};
pub use runtime::{PumpRuntime, PumpWaker, WriteError};
pub use status::{CodeTable, CompletionStatus, StatusClassifier};
pub use timing::{LinkMode, Phy, TransportParameters};
