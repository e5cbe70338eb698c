use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Snapshot of the limiter window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitStats {
	pub current_count: u32,
	/// Seconds since the current window opened.
	pub window_elapsed: f64,
	pub limit: u32,
}

struct Window {
	count: u32,
	started: Instant,
}

/// Fixed-window rate limiter shared by all outbound requests.
///
/// `acquire` returns immediately while the window has budget and otherwise
/// suspends the caller until the window rolls over. Timing is based on the
/// monotonic clock; concurrent callers are serialised on the internal lock.
pub struct RateLimiter {
	limit: u32,
	window: Duration,
	state: Mutex<Window>,
}

impl RateLimiter {
	pub fn new(limit: u32, window: Duration) -> Self {
		Self {
			limit,
			window,
			state: Mutex::new(Window {
				count: 0,
				started: Instant::now(),
			}),
		}
	}

	/// The default budget: 100 calls per 60 seconds.
	pub fn with_defaults() -> Self {
		Self::new(100, Duration::from_secs(60))
	}

	/// Take one slot from the current window, waiting for the next window
	/// when the budget is spent.
	pub async fn acquire(&self) {
		loop {
			let wake_at = {
				let mut w = self.state.lock().await;
				let now = Instant::now();
				if now.duration_since(w.started) >= self.window {
					w.started = now;
					w.count = 0;
				}
				if w.count < self.limit {
					w.count += 1;
					return;
				}
				w.started + self.window
			};
			tokio::time::sleep_until(wake_at).await;
		}
	}

	pub async fn stats(&self) -> RateLimitStats {
		let w = self.state.lock().await;
		RateLimitStats {
			current_count: w.count,
			window_elapsed: w.started.elapsed().as_secs_f64(),
			limit: self.limit,
		}
	}
}
