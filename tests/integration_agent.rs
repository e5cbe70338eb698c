mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{FakeTransport, event};
use guard_agent::model::{MetricType, SecurityMetric};
use guard_agent::{AgentConfig, AgentHandler, HealthStatus, TransportError};

fn config(key: &str) -> AgentConfig {
	let mut c = AgentConfig::new(key, "proj");
	c.flush_interval = 0.05;
	c.rule_poll_interval = 3600.0;
	c.retry_attempts = 0;
	c
}

/// A steady producer against a healthy service: every event arrives at the
/// remote exactly once, in insertion order, possibly merged into batches.
#[tokio::test]
async fn events_arrive_exactly_once_in_order() {
	let mut c = config("it-order");
	c.buffer_size = 10;
	let handler = AgentHandler::detached(c).unwrap();
	let transport = Arc::new(FakeTransport::default());
	handler
		.clone()
		.start_with_transport(transport.clone())
		.await
		.unwrap();

	for tag in ["e1", "e2", "e3", "e4", "e5"] {
		assert!(handler.send_event(event(tag)).await);
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
	tokio::time::sleep(Duration::from_millis(200)).await;

	assert_eq!(
		transport.delivered_reasons(),
		vec!["e1", "e2", "e3", "e4", "e5"]
	);
	let stats = handler.get_stats().await;
	assert_eq!(stats["buffer"]["dropped_events"], 0);
	handler.stop().await;
}

/// The service fails once, then recovers: the batch is retried on the next
/// flush and nothing is duplicated or reordered.
#[tokio::test]
async fn transient_failure_still_delivers_exactly_once() {
	let handler = AgentHandler::detached(config("it-transient")).unwrap();
	let transport = Arc::new(FakeTransport::default());
	transport.push_event_failure(TransportError::Retriable {
		attempts: 1,
		reason: "HTTP status 500".to_string(),
	});
	handler
		.clone()
		.start_with_transport(transport.clone())
		.await
		.unwrap();

	for tag in ["e1", "e2", "e3", "e4", "e5"] {
		handler.send_event(event(tag)).await;
	}
	tokio::time::sleep(Duration::from_millis(300)).await;

	assert_eq!(
		transport.delivered_reasons(),
		vec!["e1", "e2", "e3", "e4", "e5"]
	);
	let status = handler.get_status().await;
	assert!(status.errors >= 1);
	assert_eq!(status.events_sent, 5);
	handler.stop().await;
}

/// A longer outage: several flush cycles fail and requeue before the
/// service comes back. The buffer absorbs the backlog and the final
/// delivery is still exactly-once, in order.
#[tokio::test]
async fn outage_backlog_is_delivered_once_after_recovery() {
	let handler = AgentHandler::detached(config("it-outage")).unwrap();
	let transport = Arc::new(FakeTransport::default());
	for _ in 0..3 {
		transport.push_event_failure(TransportError::Retriable {
			attempts: 1,
			reason: "connection refused".to_string(),
		});
	}
	handler
		.clone()
		.start_with_transport(transport.clone())
		.await
		.unwrap();

	for tag in ["e1", "e2", "e3", "e4", "e5"] {
		handler.send_event(event(tag)).await;
	}
	tokio::time::sleep(Duration::from_millis(600)).await;

	assert_eq!(
		transport.delivered_reasons(),
		vec!["e1", "e2", "e3", "e4", "e5"]
	);
	let status = handler.get_status().await;
	assert!(status.errors >= 3);
	assert_eq!(status.events_sent, 5);
	assert_eq!(status.status, HealthStatus::Healthy);
	handler.stop().await;
}

/// Sensitive metadata never reaches the transport in the clear.
#[tokio::test]
async fn sensitive_metadata_is_redacted_end_to_end() {
	let handler = AgentHandler::detached(config("it-redact")).unwrap();
	let transport = Arc::new(FakeTransport::default());
	handler
		.clone()
		.start_with_transport(transport.clone())
		.await
		.unwrap();

	let mut e = event("login");
	e.metadata = HashMap::from([
		("Authorization".to_string(), "Bearer topsecret".to_string()),
		("cookie".to_string(), "sid=42".to_string()),
		("path".to_string(), "/admin".to_string()),
	]);
	handler.send_event(e).await;
	handler.stop().await;

	let delivered = transport.delivered_events.lock().unwrap().clone();
	assert_eq!(delivered.len(), 1);
	assert_eq!(delivered[0].metadata["Authorization"], "[REDACTED]");
	assert_eq!(delivered[0].metadata["cookie"], "[REDACTED]");
	assert_eq!(delivered[0].metadata["path"], "/admin");
}

/// Metrics travel alongside events without ordering between the streams.
#[tokio::test]
async fn metrics_are_delivered_too() {
	let handler = AgentHandler::detached(config("it-metrics")).unwrap();
	let transport = Arc::new(FakeTransport::default());
	handler
		.clone()
		.start_with_transport(transport.clone())
		.await
		.unwrap();

	handler
		.send_metric(SecurityMetric::new(MetricType::ResponseTime, 12.5))
		.await;
	handler
		.send_metric(SecurityMetric::new(MetricType::RequestCount, 100.0))
		.await;
	handler.stop().await;

	let delivered = transport.delivered_metrics.lock().unwrap().clone();
	assert_eq!(delivered.len(), 2);
	assert_eq!(handler.get_status().await.metrics_sent, 2);
}

/// Sustained delivery failures degrade the reported status; recovery
/// restores it.
#[tokio::test]
async fn delivery_failures_degrade_and_recover_status() {
	let mut c = config("it-degraded");
	c.flush_interval = 0.1;
	let handler = AgentHandler::detached(c).unwrap();
	let transport = Arc::new(FakeTransport::default());
	for _ in 0..2 {
		transport.push_event_failure(TransportError::Retriable {
			attempts: 1,
			reason: "HTTP status 503".to_string(),
		});
	}
	handler
		.clone()
		.start_with_transport(transport.clone())
		.await
		.unwrap();

	handler.send_event(event("e1")).await;
	tokio::time::sleep(Duration::from_millis(250)).await;
	let status = handler.get_status().await;
	assert_eq!(status.status, HealthStatus::Degraded);
	assert!(status.errors >= 1);
	assert!(status.last_error.is_some());

	tokio::time::sleep(Duration::from_millis(400)).await;
	let status = handler.get_status().await;
	assert_eq!(status.status, HealthStatus::Healthy);
	assert_eq!(transport.delivered_reasons(), vec!["e1"]);
	handler.stop().await;
}

/// An open circuit shows up as `error` while the agent keeps accepting
/// producer traffic.
#[tokio::test]
async fn open_circuit_reports_error_status() {
	let mut c = config("it-circuit");
	c.flush_interval = 60.0;
	let handler = AgentHandler::detached(c).unwrap();
	let transport = Arc::new(FakeTransport::default());
	transport.circuit_open.store(true, Ordering::Relaxed);
	handler
		.clone()
		.start_with_transport(transport.clone())
		.await
		.unwrap();

	assert!(handler.send_event(event("e1")).await);
	assert_eq!(handler.get_status().await.status, HealthStatus::Error);
	handler.stop().await;
}

/// The heartbeat task pushes status snapshots on its own cadence.
#[tokio::test]
async fn heartbeat_pushes_status_snapshots() {
	let handler = AgentHandler::detached(config("it-heartbeat")).unwrap();
	let transport = Arc::new(FakeTransport::default());
	handler
		.clone()
		.start_with_transport(transport.clone())
		.await
		.unwrap();

	tokio::time::sleep(Duration::from_millis(300)).await;
	handler.stop().await;

	let statuses = transport.statuses.lock().unwrap().clone();
	assert!(!statuses.is_empty());
	assert_eq!(statuses[0].version, env!("CARGO_PKG_VERSION"));
}
