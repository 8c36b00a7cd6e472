//! Client-side token bucket applied to every request a cluster issues.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refreshed: Instant,
}

/// Allows `burst` requests at once and `qps` per second sustained.
/// Waiters are served in arrival order.
#[derive(Debug)]
pub struct Throttle {
    qps: f64,
    burst: f64,
    bucket: Option<Mutex<Bucket>>,
}

impl Throttle {
    /// `qps <= 0` disables throttling.
    pub fn new(qps: f32, burst: u32) -> Self {
        if qps <= 0.0 {
            return Self::unlimited();
        }
        let burst = f64::from(burst.max(1));
        Self {
            qps: f64::from(qps),
            burst,
            bucket: Some(Mutex::new(Bucket { tokens: burst, refreshed: Instant::now() })),
        }
    }

    pub fn unlimited() -> Self {
        Self { qps: 0.0, burst: 0.0, bucket: None }
    }

    pub fn is_limited(&self) -> bool {
        self.bucket.is_some()
    }

    /// Wait for one token.
    pub async fn acquire(&self) {
        let Some(bucket) = &self.bucket else { return };
        // Held across the sleep so later callers queue behind this one.
        let mut b = bucket.lock().await;
        let now = Instant::now();
        let refill = now.duration_since(b.refreshed).as_secs_f64() * self.qps;
        b.tokens = (b.tokens + refill).min(self.burst);
        b.refreshed = now;
        if b.tokens < 1.0 {
            let wait = Duration::from_secs_f64((1.0 - b.tokens) / self.qps);
            tokio::time::sleep(wait).await;
            b.tokens = 1.0;
            b.refreshed = Instant::now();
        }
        b.tokens -= 1.0;
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::unlimited()
    }
}
