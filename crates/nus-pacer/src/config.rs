//! # Configuration
//!
//! TOML-facing `*Input` structs with every field optional, resolved into the
//! validated [`PacerConfig`] the engine runs on. Omitted keys take defaults.
//!
//! ```toml
//! [queue]
//! tx_capacity = 8192
//!
//! [pacing]
//! probe_after_successes = 32
//! escalate_cooldown_ms = 500
//!
//! [status]
//! congestion = [6, 12, 13, 15, 20]
//! ```

use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;

use crate::pacing::{ChunkConfig, PacingConfig};
use crate::status::{CodeTable, CompletionStatus};

// ─── Inputs ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PacerConfigInput {
    pub queue: QueueConfigInput,
    pub pacing: PacingConfigInput,
    pub chunk: ChunkConfigInput,
    pub cycle: CycleConfigInput,
    pub runtime: RuntimeConfigInput,
    pub status: StatusConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfigInput {
    pub tx_capacity: Option<usize>,
    pub rx_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PacingConfigInput {
    pub probe_after_successes: Option<u16>,
    pub probe_confirm_successes: Option<u16>,
    pub probe_step_floor_us: Option<u64>,
    pub probe_step_pct: Option<u64>,
    pub cooldown_successes: Option<u16>,
    pub lkg_escalate_after_fails: Option<u8>,
    pub lkg_escalate_num: Option<u64>,
    pub lkg_escalate_den: Option<u64>,
    pub escalate_cooldown_ms: Option<u64>,
    pub max_interval_us: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChunkConfigInput {
    pub size_retry_max: Option<u8>,
    pub malformed_retry_max: Option<u8>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CycleConfigInput {
    pub completion_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfigInput {
    pub tick_period_us: Option<u64>,
    pub thread_name: Option<String>,
}

/// Per-category completion code lists. A listed category replaces the
/// NimBLE default for that category; unlisted ones keep it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatusConfigInput {
    pub success: Option<Vec<i32>>,
    pub size_mismatch: Option<Vec<i32>>,
    pub malformed_payload: Option<Vec<i32>>,
    pub congestion: Option<Vec<i32>>,
    pub disconnected: Option<Vec<i32>>,
}

// ─── Resolved ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub tx_capacity: usize,
    pub rx_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            tx_capacity: 4096,
            rx_capacity: 4096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleConfig {
    /// How long a send may stay outstanding before it counts as congestion.
    pub completion_timeout: Duration,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            completion_timeout: Duration::from_millis(2000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Longest the pump sleeps between ticks when nobody wakes it.
    pub tick_period: Duration,
    pub thread_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_micros(500),
            thread_name: "nus-pump".into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PacerConfig {
    pub queue: QueueConfig,
    pub pacing: PacingConfig,
    pub chunk: ChunkConfig,
    pub cycle: CycleConfig,
    pub runtime: RuntimeConfig,
    pub status: CodeTable,
}

impl PacerConfigInput {
    pub fn resolve(self) -> anyhow::Result<PacerConfig> {
        let queue = QueueConfig {
            tx_capacity: self.queue.tx_capacity.unwrap_or(QueueConfig::default().tx_capacity),
            rx_capacity: self.queue.rx_capacity.unwrap_or(QueueConfig::default().rx_capacity),
        };
        for (key, capacity) in [
            ("queue.tx_capacity", queue.tx_capacity),
            ("queue.rx_capacity", queue.rx_capacity),
        ] {
            if !capacity.is_power_of_two() {
                bail!("{key} must be a non-zero power of two, got {capacity}");
            }
        }

        let d = PacingConfig::default();
        let p = self.pacing;
        let pacing = PacingConfig {
            probe_after_successes: p.probe_after_successes.unwrap_or(d.probe_after_successes),
            probe_confirm_successes: p.probe_confirm_successes.unwrap_or(d.probe_confirm_successes),
            probe_step_floor_us: p.probe_step_floor_us.unwrap_or(d.probe_step_floor_us),
            probe_step_pct: p.probe_step_pct.unwrap_or(d.probe_step_pct),
            cooldown_successes: p.cooldown_successes.unwrap_or(d.cooldown_successes),
            lkg_escalate_after_fails: p.lkg_escalate_after_fails.unwrap_or(d.lkg_escalate_after_fails),
            lkg_escalate_num: p.lkg_escalate_num.unwrap_or(d.lkg_escalate_num),
            lkg_escalate_den: p.lkg_escalate_den.unwrap_or(d.lkg_escalate_den),
            escalate_cooldown: p
                .escalate_cooldown_ms
                .map(Duration::from_millis)
                .unwrap_or(d.escalate_cooldown),
            max_interval_us: p.max_interval_us.unwrap_or(d.max_interval_us),
        };
        validate_pacing(&pacing)?;

        let d = ChunkConfig::default();
        let chunk = ChunkConfig {
            size_retry_max: self.chunk.size_retry_max.unwrap_or(d.size_retry_max),
            malformed_retry_max: self.chunk.malformed_retry_max.unwrap_or(d.malformed_retry_max),
        };

        let cycle = CycleConfig {
            completion_timeout: self
                .cycle
                .completion_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(CycleConfig::default().completion_timeout),
        };
        if cycle.completion_timeout.is_zero() {
            bail!("cycle.completion_timeout_ms must be non-zero");
        }

        let runtime = RuntimeConfig {
            tick_period: self
                .runtime
                .tick_period_us
                .map(Duration::from_micros)
                .unwrap_or(RuntimeConfig::default().tick_period),
            thread_name: self
                .runtime
                .thread_name
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| RuntimeConfig::default().thread_name),
        };
        if runtime.tick_period.is_zero() {
            bail!("runtime.tick_period_us must be non-zero");
        }

        let s = self.status;
        let mut status = CodeTable::nimble();
        for (category, codes) in [
            (CompletionStatus::Success, s.success),
            (CompletionStatus::SizeMismatch, s.size_mismatch),
            (CompletionStatus::MalformedPayload, s.malformed_payload),
            (CompletionStatus::Congestion, s.congestion),
            (CompletionStatus::Disconnected, s.disconnected),
        ] {
            if let Some(codes) = codes {
                status.set(category, &codes);
            }
        }

        Ok(PacerConfig {
            queue,
            pacing,
            chunk,
            cycle,
            runtime,
            status,
        })
    }
}

/// Upper bound for `pacing.max_interval_us` (one minute).
const MAX_INTERVAL_US: u64 = 60_000_000;
const MAX_ESCALATE_NUM: u64 = 1_000;

fn validate_pacing(p: &PacingConfig) -> anyhow::Result<()> {
    for (key, value) in [
        ("pacing.probe_after_successes", p.probe_after_successes),
        ("pacing.probe_confirm_successes", p.probe_confirm_successes),
        ("pacing.cooldown_successes", p.cooldown_successes),
        ("pacing.lkg_escalate_after_fails", u16::from(p.lkg_escalate_after_fails)),
    ] {
        if value == 0 {
            bail!("{key} must be non-zero");
        }
    }
    if p.probe_step_pct >= 100 {
        bail!("pacing.probe_step_pct must be below 100, got {}", p.probe_step_pct);
    }
    if p.lkg_escalate_den == 0 || p.lkg_escalate_num <= p.lkg_escalate_den {
        bail!(
            "pacing.lkg_escalate_num/den must relax the interval, got {}/{}",
            p.lkg_escalate_num,
            p.lkg_escalate_den
        );
    }
    if p.lkg_escalate_num > MAX_ESCALATE_NUM {
        bail!(
            "pacing.lkg_escalate_num must be at most {MAX_ESCALATE_NUM}, got {}",
            p.lkg_escalate_num
        );
    }
    if p.max_interval_us == 0 || p.max_interval_us > MAX_INTERVAL_US {
        bail!(
            "pacing.max_interval_us must be in 1..={MAX_INTERVAL_US}, got {}",
            p.max_interval_us
        );
    }
    Ok(())
}

impl PacerConfig {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        if input.trim().is_empty() {
            return Ok(PacerConfig::default());
        }
        let parsed: PacerConfigInput = toml::from_str(input).context("invalid pacer config TOML")?;
        parsed.resolve()
    }

    pub fn from_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("loading config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{nimble, StatusClassifier};

    #[test]
    fn empty_input_gives_defaults() {
        let config = PacerConfig::from_toml_str("").unwrap();
        assert_eq!(config.queue, QueueConfig::default());
        assert_eq!(config.pacing, PacingConfig::default());
        assert_eq!(config.chunk, ChunkConfig::default());
        assert_eq!(config.cycle.completion_timeout, Duration::from_secs(2));
        assert_eq!(config.runtime.tick_period, Duration::from_micros(500));
        assert_eq!(config.status.classify(nimble::ENOMEM), CompletionStatus::Congestion);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = PacerConfig::from_toml_str(
            r#"
            [queue]
            tx_capacity = 8192

            [pacing]
            probe_after_successes = 32
            escalate_cooldown_ms = 250

            [runtime]
            thread_name = "  uart-pump  "
            "#,
        )
        .unwrap();
        assert_eq!(config.queue.tx_capacity, 8192);
        assert_eq!(config.queue.rx_capacity, 4096);
        assert_eq!(config.pacing.probe_after_successes, 32);
        assert_eq!(config.pacing.probe_confirm_successes, 48);
        assert_eq!(config.pacing.escalate_cooldown, Duration::from_millis(250));
        assert_eq!(config.runtime.thread_name, "uart-pump");
    }

    #[test]
    fn status_override_replaces_one_category() {
        let config = PacerConfig::from_toml_str(
            r#"
            [status]
            congestion = [99]
            "#,
        )
        .unwrap();
        assert_eq!(config.status.classify(99), CompletionStatus::Congestion);
        assert_eq!(config.status.classify(nimble::ENOMEM), CompletionStatus::Unclassified);
        assert_eq!(config.status.classify(nimble::EMSGSIZE), CompletionStatus::SizeMismatch);
    }

    #[test]
    fn rejects_bad_capacity() {
        let err = PacerConfig::from_toml_str("[queue]\nrx_capacity = 1000\n").unwrap_err();
        assert!(err.to_string().contains("queue.rx_capacity"));
        assert!(PacerConfig::from_toml_str("[queue]\ntx_capacity = 0\n").is_err());
    }

    #[test]
    fn rejects_non_relaxing_escalation() {
        let err = PacerConfig::from_toml_str("[pacing]\nlkg_escalate_num = 100\n").unwrap_err();
        assert!(err.to_string().contains("lkg_escalate"));
    }

    #[test]
    fn rejects_interval_ceiling_out_of_range() {
        let err = PacerConfig::from_toml_str("[pacing]\nmax_interval_us = 18446744073709551615\n").unwrap_err();
        assert!(err.to_string().contains("pacing.max_interval_us"));
        assert!(PacerConfig::from_toml_str("[pacing]\nmax_interval_us = 60000001\n").is_err());
        assert!(PacerConfig::from_toml_str("[pacing]\nmax_interval_us = 60000000\n").is_ok());

        let err = PacerConfig::from_toml_str("[pacing]\nlkg_escalate_num = 100000\n").unwrap_err();
        assert!(err.to_string().contains("at most 1000"));
    }

    #[test]
    fn rejects_zero_thresholds() {
        assert!(PacerConfig::from_toml_str("[pacing]\nprobe_confirm_successes = 0\n").is_err());
        assert!(PacerConfig::from_toml_str("[runtime]\ntick_period_us = 0\n").is_err());
        assert!(PacerConfig::from_toml_str("[cycle]\ncompletion_timeout_ms = 0\n").is_err());
    }

    #[test]
    fn rejects_unknown_keys_and_bad_toml() {
        assert!(PacerConfig::from_toml_str("[pacing]\nprobe_aftr = 3\n").is_err());
        let err = PacerConfig::from_toml_str("[pacing\n").unwrap_err();
        assert!(err.to_string().contains("invalid pacer config TOML"));
    }
}
