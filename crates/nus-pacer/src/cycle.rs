//! # Send Cycle
//!
//! Single-slot pipeline between the TX queue and the transport. At most one
//! chunk is staged, and at most one send is outstanding. The chunk's bytes
//! stay in the queue until the transport confirms delivery, so a failed send
//! can be retried from the same snapshot without data loss.
//!
//! ```text
//!   queue ──peek──▶ staged ──send──▶ in flight ──success──▶ acknowledged
//!                     ▲                  │                       │
//!                     └──── failure ─────┘        tick: consume ◀┘
//! ```
//!
//! [`SendCycle::prepare`] runs the tick steps under the engine's lock and
//! returns the bytes to send; the send itself happens after the lock is
//! released.

use bytes::Bytes;
use quanta::Instant;
use std::time::Duration;
use tracing::debug;

use crate::queue::ByteQueue;

// ─── Staged Chunk ───────────────────────────────────────────────────────────

/// The one chunk that may be in flight.
#[derive(Debug, Clone)]
pub struct StagedChunk {
    data: Bytes,
    acknowledged: bool,
    in_flight: bool,
    /// Link parameters changed while this chunk was in flight.
    stale: bool,
    sent_at: Option<Instant>,
    attempts: u32,
    generation: u64,
}

impl StagedChunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

// ─── Cycle Steps ────────────────────────────────────────────────────────────

/// What the caller should do after [`SendCycle::prepare`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleAction {
    /// Queue empty, nothing staged.
    Idle,
    /// Interval not elapsed, or a send is still outstanding.
    Wait,
    /// The outstanding send exceeded the completion timeout.
    TimedOut,
    /// Staged chunk no longer fits the chunk size and was dropped.
    DroppedOversize { len: usize },
    /// Hand these bytes to the transport.
    Send {
        data: Bytes,
        generation: u64,
        retransmit: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleStep {
    /// Bytes consumed from the queue for an acknowledged chunk.
    pub consumed: usize,
    /// A fresh chunk was staged this tick.
    pub staged: bool,
    pub action: CycleAction,
}

/// How a failed completion left the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Chunk kept for retransmission.
    Retained,
    /// Chunk discarded; the next tick re-stages from the queue.
    Discarded,
    /// Nothing was in flight.
    Ignored,
}

// ─── Send Cycle ─────────────────────────────────────────────────────────────

pub struct SendCycle {
    staged: Option<StagedChunk>,
    last_send: Option<Instant>,
    completion_timeout: Duration,
    next_generation: u64,
    /// Timed-out sends whose completion has not arrived yet.
    overdue: u32,
}

impl SendCycle {
    pub fn new(completion_timeout: Duration) -> Self {
        SendCycle {
            staged: None,
            last_send: None,
            completion_timeout,
            next_generation: 0,
            overdue: 0,
        }
    }

    pub fn staged(&self) -> Option<&StagedChunk> {
        self.staged.as_ref()
    }

    pub fn staged_len(&self) -> usize {
        self.staged.as_ref().map_or(0, StagedChunk::len)
    }

    pub fn in_flight(&self) -> bool {
        self.staged.as_ref().is_some_and(|s| s.in_flight)
    }

    /// Run one tick against `queue`.
    ///
    /// `interval` is the current pacing interval; `chunk_size` the current
    /// maximum chunk.
    pub fn prepare(
        &mut self,
        queue: &mut ByteQueue,
        chunk_size: usize,
        interval: Duration,
        now: Instant,
    ) -> CycleStep {
        let mut step = CycleStep {
            consumed: 0,
            staged: false,
            action: CycleAction::Wait,
        };

        if self.staged.as_ref().is_some_and(|s| s.acknowledged) {
            step.consumed = self.staged.take().map_or(0, |s| queue.consume(s.len()));
        }

        if let Some(chunk) = &self.staged {
            if chunk.in_flight {
                let timed_out = chunk
                    .sent_at
                    .is_some_and(|at| now.saturating_duration_since(at) >= self.completion_timeout);
                if timed_out {
                    step.action = CycleAction::TimedOut;
                }
                return step;
            }
        }

        let due = self
            .last_send
            .is_none_or(|at| now.saturating_duration_since(at) >= interval);
        if !due {
            return step;
        }

        if self.staged.is_none() {
            if queue.is_empty() {
                step.action = CycleAction::Idle;
                return step;
            }
            self.staged = Some(StagedChunk {
                data: queue.peek_bytes(chunk_size),
                acknowledged: false,
                in_flight: false,
                stale: false,
                sent_at: None,
                attempts: 0,
                generation: 0,
            });
            step.staged = true;
        }

        let Some(chunk) = self.staged.as_mut() else {
            return step;
        };
        if chunk.len() > chunk_size {
            let len = chunk.len();
            self.staged = None;
            debug!(len, chunk_size, "staged chunk exceeds chunk size, dropping");
            step.action = CycleAction::DroppedOversize { len };
            return step;
        }

        self.next_generation += 1;
        chunk.generation = self.next_generation;
        chunk.in_flight = true;
        chunk.sent_at = Some(now);
        chunk.attempts += 1;
        self.last_send = Some(now);
        step.action = CycleAction::Send {
            data: chunk.data.clone(),
            generation: chunk.generation,
            retransmit: chunk.attempts > 1,
        };
        step
    }

    /// The transport refused send `generation` synchronously; keep the
    /// chunk for the next eligible tick.
    pub fn on_rejected(&mut self, generation: u64) {
        if let Some(chunk) = self.staged.as_mut() {
            if chunk.generation == generation && chunk.in_flight {
                chunk.in_flight = false;
                chunk.sent_at = None;
            }
        }
    }

    /// Successful completion. The next tick consumes the bytes. Returns
    /// false when nothing was in flight.
    pub fn acknowledge(&mut self) -> bool {
        match self.staged.as_mut() {
            Some(chunk) if chunk.in_flight => {
                chunk.in_flight = false;
                chunk.acknowledged = true;
                true
            }
            _ => false,
        }
    }

    /// Congestion, timeout or unclassified completion.
    pub fn fail(&mut self) -> FailureDisposition {
        match self.staged.as_mut() {
            Some(chunk) if chunk.in_flight => {
                chunk.in_flight = false;
                chunk.sent_at = None;
                if chunk.stale {
                    self.staged = None;
                    FailureDisposition::Discarded
                } else {
                    FailureDisposition::Retained
                }
            }
            _ => FailureDisposition::Ignored,
        }
    }

    /// The watchdog gave up on the outstanding send. Its completion is still
    /// owed by the transport and must not be credited to a later send.
    pub fn on_timeout(&mut self) -> FailureDisposition {
        let disposition = self.fail();
        if disposition != FailureDisposition::Ignored {
            self.overdue += 1;
        }
        disposition
    }

    /// Absorb one completion owed to a timed-out send. Returns false when
    /// no such completion is outstanding.
    pub fn take_overdue(&mut self) -> bool {
        if self.overdue == 0 {
            return false;
        }
        self.overdue -= 1;
        true
    }

    pub fn overdue(&self) -> u32 {
        self.overdue
    }

    /// Drop the staged chunk so it is re-cut at the current size.
    pub fn discard(&mut self) {
        self.staged = None;
    }

    /// Link parameters changed. A chunk already on the air is marked stale;
    /// anything else is discarded.
    pub fn on_renegotiate(&mut self) {
        match self.staged.as_mut() {
            Some(chunk) if chunk.in_flight => chunk.stale = true,
            Some(chunk) if chunk.acknowledged => {}
            _ => self.staged = None,
        }
    }

    /// Link gone: forget the slot, the send timestamp and any overdue
    /// completions. An acknowledged chunk is consumed first so it is not
    /// sent again. Returns the bytes consumed.
    pub fn reset(&mut self, queue: &mut ByteQueue) -> usize {
        let consumed = match self.staged.take() {
            Some(chunk) if chunk.acknowledged => queue.consume(chunk.len()),
            _ => 0,
        };
        self.last_send = None;
        self.overdue = 0;
        consumed
    }
}
