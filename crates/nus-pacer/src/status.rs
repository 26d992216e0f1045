//! # Completion Status Classification
//!
//! The transport reports each finished send with an opaque integer. The
//! pacer only understands six outcomes; a [`StatusClassifier`] maps one to
//! the other so transport-specific codes never reach the state machine.
//!
//! The mapping is total: anything not listed is `Unclassified`.

use serde::Serialize;

// ─── Completion Status ──────────────────────────────────────────────────────

/// What a completion code means for pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Success,
    /// Payload too large for the current link fragmentation.
    SizeMismatch,
    /// Stack rejected the payload as malformed.
    MalformedPayload,
    /// Buffers exhausted, busy, or timed out.
    Congestion,
    /// Link gone or stream ended.
    Disconnected,
    Unclassified,
}

impl CompletionStatus {
    /// Categories in match priority order. A code listed under two
    /// categories resolves to the earlier one.
    pub const PRIORITY: [CompletionStatus; 5] = [
        CompletionStatus::Success,
        CompletionStatus::SizeMismatch,
        CompletionStatus::MalformedPayload,
        CompletionStatus::Congestion,
        CompletionStatus::Disconnected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionStatus::Success => "success",
            CompletionStatus::SizeMismatch => "size_mismatch",
            CompletionStatus::MalformedPayload => "malformed_payload",
            CompletionStatus::Congestion => "congestion",
            CompletionStatus::Disconnected => "disconnected",
            CompletionStatus::Unclassified => "unclassified",
        }
    }

    fn slot(self) -> Option<usize> {
        Self::PRIORITY.iter().position(|s| *s == self)
    }
}

// ─── Classifier Trait ───────────────────────────────────────────────────────

/// Maps a transport's completion codes onto [`CompletionStatus`].
pub trait StatusClassifier: Send + Sync {
    fn classify(&self, code: i32) -> CompletionStatus;

    /// Human-readable code name for logs.
    fn code_name(&self, _code: i32) -> &'static str {
        "unknown"
    }
}

// ─── Code Table ─────────────────────────────────────────────────────────────

/// Table-driven classifier: one code list per category.
#[derive(Clone)]
pub struct CodeTable {
    codes: [Vec<i32>; 5],
    names: fn(i32) -> &'static str,
}

impl CodeTable {
    /// A table that classifies everything as `Unclassified`.
    pub fn empty() -> Self {
        CodeTable {
            codes: Default::default(),
            names: |_| "unknown",
        }
    }

    /// NimBLE host (`BLE_HS_E*`) notification status codes.
    pub fn nimble() -> Self {
        use nimble::*;
        let mut table = CodeTable::empty()
            .with(CompletionStatus::Success, &[OK, EDONE])
            .with(CompletionStatus::SizeMismatch, &[EMSGSIZE])
            .with(CompletionStatus::MalformedPayload, &[EAPP, EBADDATA])
            .with(
                CompletionStatus::Congestion,
                &[ENOMEM, ECONTROLLER, ETIMEOUT, EBUSY, ENOMEM_EVT],
            )
            .with(CompletionStatus::Disconnected, &[ENOTCONN, EOS]);
        table.names = nimble::code_name;
        table
    }

    /// Replace the code list for `status`. `Unclassified` is the fallback
    /// and cannot be assigned codes; such calls are ignored.
    pub fn with(mut self, status: CompletionStatus, codes: &[i32]) -> Self {
        self.set(status, codes);
        self
    }

    pub fn set(&mut self, status: CompletionStatus, codes: &[i32]) {
        if let Some(slot) = status.slot() {
            self.codes[slot] = codes.to_vec();
        }
    }

    pub fn codes(&self, status: CompletionStatus) -> &[i32] {
        status.slot().map(|slot| self.codes[slot].as_slice()).unwrap_or(&[])
    }
}

impl Default for CodeTable {
    fn default() -> Self {
        Self::nimble()
    }
}

impl std::fmt::Debug for CodeTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for status in CompletionStatus::PRIORITY {
            map.entry(&status.as_str(), &self.codes(status));
        }
        map.finish()
    }
}

impl StatusClassifier for CodeTable {
    fn classify(&self, code: i32) -> CompletionStatus {
        CompletionStatus::PRIORITY
            .into_iter()
            .zip(self.codes.iter())
            .find(|(_, codes)| codes.contains(&code))
            .map(|(status, _)| status)
            .unwrap_or(CompletionStatus::Unclassified)
    }

    fn code_name(&self, code: i32) -> &'static str {
        (self.names)(code)
    }
}

// ─── NimBLE Host Codes ──────────────────────────────────────────────────────

/// `BLE_HS_E*` return codes as reported by NimBLE notify completions.
pub mod nimble {
    pub const OK: i32 = 0;
    pub const EAGAIN: i32 = 1;
    pub const EALREADY: i32 = 2;
    pub const EINVAL: i32 = 3;
    pub const EMSGSIZE: i32 = 4;
    pub const ENOENT: i32 = 5;
    pub const ENOMEM: i32 = 6;
    pub const ENOTCONN: i32 = 7;
    pub const ENOTSUP: i32 = 8;
    pub const EAPP: i32 = 9;
    pub const EBADDATA: i32 = 10;
    pub const EOS: i32 = 11;
    pub const ECONTROLLER: i32 = 12;
    pub const ETIMEOUT: i32 = 13;
    pub const EDONE: i32 = 14;
    pub const EBUSY: i32 = 15;
    pub const EREJECT: i32 = 16;
    pub const EUNKNOWN: i32 = 17;
    pub const ENOMEM_EVT: i32 = 20;

    pub fn code_name(code: i32) -> &'static str {
        match code {
            OK => "OK",
            EAGAIN => "EAGAIN",
            EALREADY => "EALREADY",
            EINVAL => "EINVAL",
            EMSGSIZE => "EMSGSIZE",
            ENOENT => "ENOENT",
            ENOMEM => "ENOMEM",
            ENOTCONN => "ENOTCONN",
            ENOTSUP => "ENOTSUP",
            EAPP => "EAPP",
            EBADDATA => "EBADDATA",
            EOS => "EOS",
            ECONTROLLER => "ECONTROLLER",
            ETIMEOUT => "ETIMEOUT",
            EDONE => "EDONE",
            EBUSY => "EBUSY",
            EREJECT => "EREJECT",
            EUNKNOWN => "EUNKNOWN",
            ENOMEM_EVT => "ENOMEM_EVT",
            _ => "unknown",
        }
    }
}
