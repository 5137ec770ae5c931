// src/notify/throttle.rs
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Minimum spacing between sends on one channel.
/// - First send always passes.
/// - Later sends wait until `spacing` has elapsed since the previous one.
/// - `per_minute == 0` disables the gate.
#[derive(Debug)]
pub struct Throttle {
    spacing: Duration,
    last_send: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn unlimited() -> Self {
        Self {
            spacing: Duration::ZERO,
            last_send: Mutex::new(None),
        }
    }

    pub fn per_minute(per_minute: u32) -> Self {
        let spacing = if per_minute == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(60) / per_minute
        };
        Self {
            spacing,
            last_send: Mutex::new(None),
        }
    }

    pub fn spacing(&self) -> Duration {
        self.spacing
    }

    /// How long a send at `now` would have to wait. Does NOT reserve a slot.
    #[cfg(test)]
    async fn wait_time(&self, now: Instant) -> Duration {
        match *self.last_send.lock().await {
            None => Duration::ZERO,
            Some(last) => (last + self.spacing).saturating_duration_since(now),
        }
    }

    /// Waits for a free slot and claims it.
    pub async fn acquire(&self) {
        if self.spacing.is_zero() {
            return;
        }
        let mut last = self.last_send.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.spacing;
            if ready_at > Instant::now() {
                tracing::debug!(target: "notify", wait_ms = (ready_at - Instant::now()).as_millis() as u64, "throttled");
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_send_passes_then_spacing_applies() {
        let t = Throttle::per_minute(2);
        assert_eq!(t.spacing(), Duration::from_secs(30));
        let start = Instant::now();
        t.acquire().await;
        assert_eq!(t.wait_time(Instant::now()).await, Duration::from_secs(30));
        t.acquire().await;
        assert!(Instant::now() - start >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn unlimited_never_waits() {
        let t = Throttle::per_minute(0);
        t.acquire().await;
        t.acquire().await;
        assert_eq!(t.wait_time(Instant::now()).await, Duration::ZERO);
    }
}
