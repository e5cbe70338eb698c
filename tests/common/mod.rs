#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use guard_agent::breaker::CircuitState;
use guard_agent::model::{
	AgentStatus, DynamicRules, EventType, SecurityEvent, SecurityMetric,
};
use guard_agent::transport::{TelemetryTransport, TransportError};

/// Transport double: records everything delivered, replays scripted
/// failures for event sends, and lets tests force the breaker-open view.
#[derive(Default)]
pub struct FakeTransport {
	pub delivered_events: Mutex<Vec<SecurityEvent>>,
	pub delivered_metrics: Mutex<Vec<SecurityMetric>>,
	pub statuses: Mutex<Vec<AgentStatus>>,
	pub event_failures: Mutex<VecDeque<TransportError>>,
	pub rules: Mutex<Option<DynamicRules>>,
	pub circuit_open: AtomicBool,
}

impl FakeTransport {
	pub fn push_event_failure(&self, err: TransportError) {
		self.event_failures.lock().unwrap().push_back(err);
	}

	pub fn delivered_reasons(&self) -> Vec<String> {
		self.delivered_events
			.lock()
			.unwrap()
			.iter()
			.map(|e| e.reason.clone())
			.collect()
	}
}

#[async_trait]
impl TelemetryTransport for FakeTransport {
	async fn send_events(&self, events: &[SecurityEvent]) -> Result<(), TransportError> {
		if let Some(err) = self.event_failures.lock().unwrap().pop_front() {
			return Err(err);
		}
		self.delivered_events
			.lock()
			.unwrap()
			.extend_from_slice(events);
		Ok(())
	}

	async fn send_metrics(&self, metrics: &[SecurityMetric]) -> Result<(), TransportError> {
		self.delivered_metrics
			.lock()
			.unwrap()
			.extend_from_slice(metrics);
		Ok(())
	}

	async fn send_status(&self, status: &AgentStatus) -> Result<(), TransportError> {
		self.statuses.lock().unwrap().push(status.clone());
		Ok(())
	}

	async fn fetch_dynamic_rules(&self) -> Result<Option<DynamicRules>, TransportError> {
		Ok(self.rules.lock().unwrap().clone())
	}

	async fn test_connection(&self) -> bool {
		true
	}

	async fn circuit_state(&self) -> CircuitState {
		if self.circuit_open.load(Ordering::Relaxed) {
			CircuitState::Open
		} else {
			CircuitState::Closed
		}
	}
}

pub fn event(tag: &str) -> SecurityEvent {
	SecurityEvent::new(EventType::SuspiciousRequest, "10.0.0.1", "logged", tag)
}
