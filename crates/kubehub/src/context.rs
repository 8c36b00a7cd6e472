//! Shared run context: one cancellation point for the hard deadline, the idle
//! window and external cancellation. Whichever fires first is recorded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use census_core::StopReason;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Default idle-inactivity window.
pub const DEFAULT_IDLE_WINDOW: Duration = Duration::from_secs(180);

#[derive(Debug, Clone)]
pub struct RunContext {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    token: CancellationToken,
    started: Instant,
    deadline: Option<Instant>,
    idle_window: Duration,
    /// Milliseconds since `started` of the last progress event.
    last_progress_ms: AtomicU64,
    reason: OnceLock<StopReason>,
}

impl RunContext {
    /// `hard_deadline` bounds the whole run; `None` means unbounded.
    pub fn new(hard_deadline: Option<Duration>, idle_window: Duration) -> Self {
        let started = Instant::now();
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                started,
                deadline: hard_deadline.map(|d| started + d),
                idle_window,
                last_progress_ms: AtomicU64::new(0),
                reason: OnceLock::new(),
            }),
        }
    }

    /// Stop the run. Only the first reason is kept.
    pub fn cancel(&self, reason: StopReason) {
        let _ = self.inner.reason.set(reason);
        self.inner.token.cancel();
    }

    /// Record progress; restarts the idle window.
    pub fn touch(&self) {
        let ms = self.inner.started.elapsed().as_millis() as u64;
        self.inner.last_progress_ms.fetch_max(ms, Ordering::Relaxed);
    }

    pub fn idle_window(&self) -> Duration {
        self.inner.idle_window
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.started.elapsed()
    }

    fn idle_deadline(&self) -> Instant {
        let last = Duration::from_millis(self.inner.last_progress_ms.load(Ordering::Relaxed));
        self.inner.started + last + self.inner.idle_window
    }

    /// Non-blocking check. Expired deadlines are latched as the stop reason.
    pub fn stop_reason(&self) -> Option<StopReason> {
        if let Some(reason) = self.inner.reason.get() {
            return Some(*reason);
        }
        if self.inner.token.is_cancelled() {
            return Some(*self.inner.reason.get_or_init(|| StopReason::Cancelled));
        }
        let now = Instant::now();
        if self.inner.deadline.is_some_and(|d| now >= d) {
            self.cancel(StopReason::HardDeadline);
        } else if now >= self.idle_deadline() {
            self.cancel(StopReason::idle(self.inner.idle_window));
        }
        self.inner.reason.get().copied()
    }

    /// Resolves once any bound fires.
    pub async fn done(&self) -> StopReason {
        loop {
            if let Some(reason) = self.stop_reason() {
                return reason;
            }
            let idle_at = self.idle_deadline();
            let deadline = self.inner.deadline;
            tokio::select! {
                _ = self.inner.token.cancelled() => {}
                _ = sleep_until(idle_at) => {}
                _ = async {
                    match deadline {
                        Some(d) => sleep_until(d).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {}
            }
        }
    }
}
