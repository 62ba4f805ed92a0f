//! Periodic background refresh of the cached stage state.
//!
//! The refresher and the foreground users of the serial port coordinate
//! through a [RefreshGate]. Foreground work takes a [PauseGuard]; while any
//! guard is alive, ticks are skipped.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use tracing as log;

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshStats {
    /// ticks that ran a refresh
    pub ticks: u64,
    /// ticks skipped because the refresher was paused
    pub skipped: u64,
    pub pauses: u64,
    pub resumes: u64,
}

#[derive(Default)]
pub struct RefreshGate {
    depth: AtomicUsize,
    /// Held for the duration of a refresh, by the refresher or by the motion
    /// poll.
    state: tokio::sync::Mutex<()>,
    ticks: AtomicU64,
    skipped: AtomicU64,
    pauses: AtomicU64,
    resumes: AtomicU64,
}

impl RefreshGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_paused(&self) -> bool {
        self.depth.load(Ordering::SeqCst) > 0
    }

    /// Suspend refreshing until the returned guard is dropped.
    ///
    /// Pauses nest. Returns once a refresh that is already running has
    /// finished.
    pub async fn pause(self: &Arc<Self>) -> PauseGuard {
        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        self.pauses.fetch_add(1, Ordering::SeqCst);
        log::trace!("refresh paused (depth {depth})");
        let guard = PauseGuard { gate: self.clone() };
        drop(self.state.lock().await);
        guard
    }

    /// Exclusive access to the cached state refresh.
    pub async fn lock_state(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.state.lock().await
    }

    pub fn stats(&self) -> RefreshStats {
        RefreshStats {
            ticks: self.ticks.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            pauses: self.pauses.load(Ordering::SeqCst),
            resumes: self.resumes.load(Ordering::SeqCst),
        }
    }
}

/// Resumes refreshing when dropped.
#[must_use = "refreshing resumes as soon as the guard is dropped"]
pub struct PauseGuard {
    gate: Arc<RefreshGate>,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        let depth = self.gate.depth.fetch_sub(1, Ordering::SeqCst) - 1;
        self.gate.resumes.fetch_add(1, Ordering::SeqCst);
        log::trace!("refresh resumed (depth {depth})");
    }
}

/// Background task calling `refresh` once per interval.
pub struct Refresher {
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Refresher {
    /// Must be called from within a tokio runtime.
    pub fn spawn<F, Fut>(gate: Arc<RefreshGate>, period: Duration, refresh: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(gate, period, refresh, shutdown.clone()));
        Self {
            shutdown,
            task: Some(task),
        }
    }

    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("refresh task failed: {e}");
            }
        }
    }
}

impl Drop for Refresher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run<F, Fut>(
    gate: Arc<RefreshGate>,
    period: Duration,
    refresh: F,
    shutdown: CancellationToken,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let _state = gate.state.lock().await;
        if gate.is_paused() {
            gate.skipped.fetch_add(1, Ordering::SeqCst);
            continue;
        }
        let fut = refresh();
        fut.await;
        gate.ticks.fetch_add(1, Ordering::SeqCst);
    }
    log::debug!("refresher stopped");
}
