use std::fmt;
use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
	Closed,
	Open,
	HalfOpen,
}

/// Outcome of a guarded call.
#[derive(Debug, Error)]
pub enum BreakerError<E: fmt::Display + fmt::Debug> {
	/// The breaker is open; the inner operation was not attempted.
	#[error("circuit breaker is open")]
	Open,

	/// The inner operation ran and failed; the failure was recorded.
	#[error("{0}")]
	Service(E),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerStats {
	pub state: CircuitState,
	pub consecutive_failures: u32,
	/// Times the breaker has opened over its lifetime.
	pub opened_total: u64,
}

enum State {
	Closed,
	Open { opened_at: Instant },
	HalfOpen { probes_in_flight: u32 },
}

struct Inner {
	state: State,
	consecutive_failures: u32,
	opened_total: u64,
}

impl Inner {
	fn open(&mut self) {
		self.state = State::Open {
			opened_at: Instant::now(),
		};
		self.opened_total += 1;
	}
}

/// Circuit breaker gating all HTTP attempts.
///
/// Closed counts consecutive failures and opens at the threshold. Open
/// short-circuits every call until `recovery_timeout` has elapsed, then
/// admits up to `half_open_max_calls` probes; the first probe success
/// closes the circuit, any probe failure re-opens it.
pub struct CircuitBreaker {
	failure_threshold: u32,
	recovery_timeout: Duration,
	half_open_max_calls: u32,
	inner: Mutex<Inner>,
}

impl CircuitBreaker {
	pub fn new(failure_threshold: u32, recovery_timeout: Duration, half_open_max_calls: u32) -> Self {
		Self {
			failure_threshold,
			recovery_timeout,
			half_open_max_calls: half_open_max_calls.max(1),
			inner: Mutex::new(Inner {
				state: State::Closed,
				consecutive_failures: 0,
				opened_total: 0,
			}),
		}
	}

	/// Defaults: 5 consecutive failures to open, 60 s recovery, 1 probe.
	pub fn with_defaults() -> Self {
		Self::new(5, Duration::from_secs(60), 1)
	}

	/// Run `fut` under the breaker. While open, the future is dropped
	/// unpolled and `BreakerError::Open` is returned synchronously.
	pub async fn call<T, E, Fut>(&self, fut: Fut) -> Result<T, BreakerError<E>>
	where
		E: fmt::Display + fmt::Debug,
		Fut: Future<Output = Result<T, E>>,
	{
		{
			let mut inner = self.inner.lock().await;
			match inner.state {
				State::Closed => {}
				State::Open { opened_at } => {
					if opened_at.elapsed() >= self.recovery_timeout {
						debug!("circuit breaker half-open after {:?}", self.recovery_timeout);
						inner.state = State::HalfOpen {
							probes_in_flight: 1,
						};
					} else {
						return Err(BreakerError::Open);
					}
				}
				State::HalfOpen {
					ref mut probes_in_flight,
				} => {
					if *probes_in_flight >= self.half_open_max_calls {
						return Err(BreakerError::Open);
					}
					*probes_in_flight += 1;
				}
			}
		}

		let result = fut.await;

		let mut inner = self.inner.lock().await;
		match result {
			Ok(value) => {
				match inner.state {
					State::HalfOpen { .. } => {
						debug!("circuit breaker closed after successful probe");
						inner.state = State::Closed;
						inner.consecutive_failures = 0;
					}
					State::Closed => inner.consecutive_failures = 0,
					// A stale probe result after the circuit re-opened.
					State::Open { .. } => {}
				}
				Ok(value)
			}
			Err(e) => {
				inner.consecutive_failures += 1;
				match inner.state {
					State::Closed => {
						if inner.consecutive_failures >= self.failure_threshold {
							warn!(
								"circuit breaker opening after {} consecutive failures",
								inner.consecutive_failures
							);
							inner.open();
						}
					}
					State::HalfOpen { .. } => {
						warn!("circuit breaker re-opening after failed probe");
						inner.open();
					}
					State::Open { .. } => {}
				}
				Err(BreakerError::Service(e))
			}
		}
	}

	pub async fn state(&self) -> CircuitState {
		match self.inner.lock().await.state {
			State::Closed => CircuitState::Closed,
			State::Open { .. } => CircuitState::Open,
			State::HalfOpen { .. } => CircuitState::HalfOpen,
		}
	}

	pub async fn stats(&self) -> BreakerStats {
		let inner = self.inner.lock().await;
		BreakerStats {
			state: match inner.state {
				State::Closed => CircuitState::Closed,
				State::Open { .. } => CircuitState::Open,
				State::HalfOpen { .. } => CircuitState::HalfOpen,
			},
			consecutive_failures: inner.consecutive_failures,
			opened_total: inner.opened_total,
		}
	}
}
