//! # Pump Runtime
//!
//! Owned background thread that keeps a [`PacedLink`] ticking. The thread
//! sleeps on a wake channel with a `tick_period` timeout, so producers and
//! the completion context can nudge it instead of waiting out the period.
//!
//! Dropping the runtime stops and joins the thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use quanta::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::link::{PacedLink, TickOutcome, Transport};

/// Why [`PumpRuntime::try_write`] refused data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WriteError {
    /// Producer gate closed; retry after the queue drains to low water.
    #[error("producer not ready")]
    NotReady,
    /// Not enough free space for the whole write.
    #[error("tx queue full")]
    Full,
    #[error("link down")]
    LinkDown,
    /// The pump has been shut down.
    #[error("pump stopped")]
    Stopped,
}

enum Wake {
    Tick,
    Shutdown,
}

/// Clonable handle that wakes the pump, e.g. from a completion callback.
#[derive(Clone)]
pub struct PumpWaker {
    tx: Sender<Wake>,
}

impl PumpWaker {
    pub fn wake(&self) {
        send_wake(&self.tx, Wake::Tick);
    }
}

fn send_wake(tx: &Sender<Wake>, wake: Wake) {
    // A pending wake already covers this one.
    if let Err(TrySendError::Disconnected(_)) = tx.try_send(wake) {
        debug!("pump gone, wake ignored");
    }
}

/// Background ticker for one [`PacedLink`].
pub struct PumpRuntime<T: Transport + 'static> {
    link: Arc<PacedLink<T>>,
    wake_tx: Sender<Wake>,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl<T: Transport + 'static> PumpRuntime<T> {
    /// Start pumping `link` on a named thread.
    pub fn spawn(link: Arc<PacedLink<T>>, config: &RuntimeConfig) -> anyhow::Result<Self> {
        let (wake_tx, wake_rx) = bounded(1);
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker_link = link.clone();
        let worker_shutdown = shutdown.clone();
        let tick_period = config.tick_period;

        let handle = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || pump_worker(worker_link, wake_rx, tick_period, worker_shutdown))
            .with_context(|| format!("failed to spawn pump thread {:?}", config.thread_name))?;

        info!(thread = %config.thread_name, tick_us = tick_period.as_micros() as u64, "pump started");
        Ok(Self {
            link,
            wake_tx,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn link(&self) -> &Arc<PacedLink<T>> {
        &self.link
    }

    pub fn waker(&self) -> PumpWaker {
        PumpWaker {
            tx: self.wake_tx.clone(),
        }
    }

    pub fn wake(&self) {
        send_wake(&self.wake_tx, Wake::Tick);
    }

    /// Enqueue `data` if the producer gate is open, then wake the pump.
    pub fn try_write(&self, data: &[u8]) -> Result<usize, WriteError> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(WriteError::Stopped);
        }
        if !self.link.is_link_up() {
            return Err(WriteError::LinkDown);
        }
        if data.is_empty() {
            return Ok(0);
        }
        if !self.link.is_ready() {
            return Err(WriteError::NotReady);
        }
        match self.link.write(data) {
            0 => Err(WriteError::Full),
            n => {
                self.wake();
                Ok(n)
            }
        }
    }

    /// Wait until everything queued has been sent and acknowledged, the link
    /// drops, or `timeout` passes. Returns whether the queue drained.
    pub fn flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.link.is_drained() {
                return true;
            }
            if !self.link.is_link_up() || Instant::now() >= deadline {
                return false;
            }
            self.wake();
            thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop and join the pump thread. Idempotent.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        // A queued Tick also wakes the worker, which then sees the flag.
        send_wake(&self.wake_tx, Wake::Shutdown);
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(()) => info!("pump stopped"),
                Err(_) => warn!("pump thread panicked"),
            }
        }
    }
}

impl<T: Transport + 'static> Drop for PumpRuntime<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn pump_worker<T: Transport>(
    link: Arc<PacedLink<T>>,
    wake_rx: Receiver<Wake>,
    tick_period: Duration,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        // Keep sending back to back while chunks are due.
        let wait = match link.tick() {
            TickOutcome::Sent { .. } | TickOutcome::DroppedOversize { .. } => Duration::ZERO,
            _ => tick_period,
        };
        if wait.is_zero() {
            continue;
        }
        match wake_rx.recv_timeout(wait) {
            Ok(Wake::Tick) | Err(RecvTimeoutError::Timeout) => {}
            Ok(Wake::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PacerConfig;
    use crate::status::nimble;
    use crate::timing::TransportParameters;
    use std::sync::Mutex;

    /// Completes every send synchronously from inside `send`.
    struct Loopback {
        link: Mutex<Option<std::sync::Weak<PacedLink<Arc<Loopback>>>>>,
        received: Mutex<Vec<u8>>,
    }

    impl Transport for Loopback {
        fn send(&self, chunk: &[u8]) -> bool {
            self.received.lock().unwrap().extend_from_slice(chunk);
            if let Some(link) = self.link.lock().unwrap().as_ref().and_then(|w| w.upgrade()) {
                link.on_completion(nimble::OK);
            }
            true
        }

        fn request_disconnect(&self) {}
    }

    fn loopback_link() -> (Arc<PacedLink<Arc<Loopback>>>, Arc<Loopback>) {
        let transport = Arc::new(Loopback {
            link: Mutex::new(None),
            received: Mutex::new(Vec::new()),
        });
        let link = Arc::new(PacedLink::new(transport.clone(), &PacerConfig::default()));
        *transport.link.lock().unwrap() = Some(Arc::downgrade(&link));
        (link, transport)
    }

    fn fast_params() -> TransportParameters {
        TransportParameters::default().with_mtu(247)
    }

    #[test]
    fn pumps_and_flushes_with_synchronous_completions() {
        let (link, transport) = loopback_link();
        link.on_link_up(fast_params());
        let pump = PumpRuntime::spawn(link.clone(), &RuntimeConfig::default()).unwrap();

        let payload: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        assert_eq!(pump.try_write(&payload), Ok(1000));
        assert!(pump.flush(Duration::from_secs(5)));
        assert_eq!(*transport.received.lock().unwrap(), payload);
    }

    #[test]
    fn write_refused_while_link_down() {
        let (link, _) = loopback_link();
        let pump = PumpRuntime::spawn(link, &RuntimeConfig::default()).unwrap();
        assert_eq!(pump.try_write(b"x"), Err(WriteError::LinkDown));
        // Nothing queued, so there is nothing to wait for
        assert!(pump.flush(Duration::from_millis(10)));
    }

    #[test]
    fn full_queue_reports_full() {
        let (link, _) = loopback_link();
        link.on_link_up(fast_params());
        let pump = PumpRuntime::spawn(link, &RuntimeConfig::default()).unwrap();
        assert_eq!(pump.try_write(&[0u8; 8192]), Err(WriteError::Full));
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (link, _) = loopback_link();
        let mut pump = PumpRuntime::spawn(link, &RuntimeConfig::default()).unwrap();
        assert!(pump.is_running());
        pump.shutdown();
        pump.shutdown();
        assert!(!pump.is_running());
        assert_eq!(pump.try_write(b"late"), Err(WriteError::Stopped));
    }

    struct Exploding;

    impl Transport for Exploding {
        fn send(&self, _chunk: &[u8]) -> bool {
            panic!("transport failure");
        }

        fn request_disconnect(&self) {}
    }

    #[test]
    fn shutdown_survives_panicked_worker() {
        let link = Arc::new(PacedLink::new(Exploding, &PacerConfig::default()));
        link.on_link_up(fast_params());
        link.write(b"boom");
        let mut pump = PumpRuntime::spawn(link, &RuntimeConfig::default()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while pump.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!pump.is_running());
        pump.shutdown();
        pump.shutdown();
    }

    #[test]
    fn write_errors_display() {
        assert_eq!(WriteError::NotReady.to_string(), "producer not ready");
        assert_eq!(WriteError::Full.to_string(), "tx queue full");
        let err: Box<dyn std::error::Error> = Box::new(WriteError::Stopped);
        assert_eq!(err.to_string(), "pump stopped");
    }

    #[test]
    fn waker_survives_shutdown() {
        let (link, _) = loopback_link();
        let mut pump = PumpRuntime::spawn(link, &RuntimeConfig::default()).unwrap();
        let waker = pump.waker();
        waker.wake();
        pump.shutdown();
        waker.wake();
    }
}
