use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use serde_json::json;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::breaker::CircuitState;
use crate::buffer::EventBuffer;
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::model::{AgentStatus, DynamicRules, HealthStatus, SecurityEvent, SecurityMetric};
use crate::store::{self, OverflowStore};
use crate::transport::{HttpTransport, TelemetryTransport, TransportError};
use crate::util::current_timestamp;

type RegistryKey = (String, String, String);

/// One handler per `(api_key, project_id, endpoint)` identity, process-wide.
static REGISTRY: Lazy<std::sync::Mutex<HashMap<RegistryKey, Arc<AgentHandler>>>> =
	Lazy::new(|| std::sync::Mutex::new(HashMap::new()));

/// Singleton factory. Constructing again with the same identity and an
/// equal configuration returns the existing handler; a differing
/// configuration under the same identity is rejected with `ConfigConflict`.
pub fn agent(config: AgentConfig) -> Result<Arc<AgentHandler>, AgentError> {
	config.validate()?;
	let key = config.registry_key();
	let mut registry = REGISTRY.lock().expect("agent registry lock poisoned");
	if let Some(existing) = registry.get(&key) {
		if existing.config == config {
			return Ok(Arc::clone(existing));
		}
		return Err(AgentError::ConfigConflict);
	}
	let handler = Arc::new(AgentHandler::from_config(config));
	registry.insert(key, Arc::clone(&handler));
	Ok(handler)
}

/// Test hook: forget every registered handler. Running handlers are not
/// stopped; callers owning an `Arc` keep a working instance.
pub fn reset_registry() {
	REGISTRY
		.lock()
		.expect("agent registry lock poisoned")
		.clear();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
	Stopped,
	Starting,
	Running,
	Stopping,
}

impl Lifecycle {
	fn as_str(&self) -> &'static str {
		match self {
			Lifecycle::Stopped => "stopped",
			Lifecycle::Starting => "starting",
			Lifecycle::Running => "running",
			Lifecycle::Stopping => "stopping",
		}
	}
}

#[derive(Default)]
struct Counters {
	events_received: AtomicU64,
	metrics_received: AtomicU64,
	events_sent: AtomicU64,
	metrics_sent: AtomicU64,
	errors: AtomicU64,
	consecutive_failures: AtomicU64,
	dropped_encrypted: AtomicU64,
	dropped_permanent: AtomicU64,
	rule_errors: AtomicU64,
}

struct Inner {
	state: Lifecycle,
	transport: Option<Arc<dyn TelemetryTransport>>,
	shutdown: Option<watch::Sender<bool>>,
	tasks: Vec<JoinHandle<()>>,
	started_ts: Option<f64>,
}

/// Orchestrator tying the buffer and the transport together: lifecycle,
/// the background flush / heartbeat / rule-poll tasks, producer fan-in,
/// and status accounting. Owned as `Arc` by the host; ownership flows
/// handler -> buffer -> store capability, with no back references.
pub struct AgentHandler {
	config: AgentConfig,
	buffer: Arc<EventBuffer>,
	store: RwLock<Option<Arc<dyn OverflowStore>>>,
	inner: RwLock<Inner>,
	counters: Counters,
	last_error: std::sync::Mutex<Option<String>>,
	rules_tx: watch::Sender<Option<DynamicRules>>,
	hostname: String,
}

impl AgentHandler {
	fn from_config(config: AgentConfig) -> Self {
		let sensitive = config
			.sensitive_headers
			.iter()
			.map(|h| h.to_lowercase())
			.collect();
		let buffer = Arc::new(EventBuffer::new(config.buffer_size, sensitive, config.max_payload_size));
		let (rules_tx, _) = watch::channel(None);
		let hostname = hostname::get()
			.ok()
			.and_then(|h| h.into_string().ok())
			.unwrap_or_else(|| "unknown".to_string());

		Self {
			config,
			buffer,
			store: RwLock::new(None),
			inner: RwLock::new(Inner {
				state: Lifecycle::Stopped,
				transport: None,
				shutdown: None,
				tasks: Vec::new(),
				started_ts: None,
			}),
			counters: Counters::default(),
			last_error: std::sync::Mutex::new(None),
			rules_tx,
			hostname,
		}
	}

	/// Construct without touching the singleton registry. Meant for tests
	/// and embeddings that manage handler identity themselves.
	pub fn detached(config: AgentConfig) -> Result<Arc<Self>, AgentError> {
		config.validate()?;
		Ok(Arc::new(Self::from_config(config)))
	}

	pub fn config(&self) -> &AgentConfig {
		&self.config
	}

	/// Idempotent. Builds the HTTP transport (which runs the encryption
	/// round-trip probe), recovers spilled items, and spawns the
	/// background tasks. Fails only with `Config` or `EncryptionInit`.
	pub async fn start(self: Arc<Self>) -> Result<(), AgentError> {
		{
			let mut inner = self.inner.write().await;
			match inner.state {
				Lifecycle::Running | Lifecycle::Starting => return Ok(()),
				Lifecycle::Stopping => {
					warn!("start requested while stopping; ignoring");
					return Ok(());
				}
				Lifecycle::Stopped => inner.state = Lifecycle::Starting,
			}
		}

		let transport: Arc<dyn TelemetryTransport> = match HttpTransport::new(&self.config) {
			Ok(t) => Arc::new(t),
			Err(e) => {
				self.inner.write().await.state = Lifecycle::Stopped;
				return Err(e);
			}
		};
		self.finish_start(transport).await
	}

	/// Start with an injected transport capability; the substitution seam
	/// tests use. Otherwise identical to `start`.
	pub async fn start_with_transport(
		self: Arc<Self>,
		transport: Arc<dyn TelemetryTransport>,
	) -> Result<(), AgentError> {
		{
			let mut inner = self.inner.write().await;
			match inner.state {
				Lifecycle::Running | Lifecycle::Starting => return Ok(()),
				Lifecycle::Stopping => return Ok(()),
				Lifecycle::Stopped => inner.state = Lifecycle::Starting,
			}
		}
		self.finish_start(transport).await
	}

	async fn finish_start(
		self: Arc<Self>,
		transport: Arc<dyn TelemetryTransport>,
	) -> Result<(), AgentError> {
		if let Some(s) = self.store.read().await.clone() {
			self.buffer.attach_store(s).await;
		}
		let recovered = self.buffer.recover().await;
		if recovered > 0 {
			info!("recovered {} buffered items from the overflow store", recovered);
		}
		self.prime_rules_cache().await;

		if !transport.test_connection().await {
			warn!("management service health check failed; buffering until it recovers");
		}

		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		{
			let mut inner = self.inner.write().await;
			inner.transport = Some(Arc::clone(&transport));
			inner.shutdown = Some(shutdown_tx);
			inner.started_ts = Some(current_timestamp());
			inner.state = Lifecycle::Running;
		}

		let tasks = vec![
			tokio::spawn(Arc::clone(&self).flusher_loop(
				Arc::clone(&transport),
				shutdown_rx.clone(),
			)),
			tokio::spawn(Arc::clone(&self).heartbeat_loop(
				Arc::clone(&transport),
				shutdown_rx.clone(),
			)),
			tokio::spawn(Arc::clone(&self).rule_poll_loop(Arc::clone(&transport), shutdown_rx)),
		];

		let mut inner = self.inner.write().await;
		if inner.state == Lifecycle::Running {
			inner.tasks = tasks;
			info!("agent started for project {}", self.config.project_id);
		} else {
			// Raced with stop; tear the tasks back down.
			for task in tasks {
				task.abort();
			}
		}
		Ok(())
	}

	/// Idempotent and infallible. Signals the background tasks, attempts a
	/// final flush bounded by `max(flush_interval, 5 s)`, then releases
	/// the transport.
	pub async fn stop(&self) {
		let (tasks, transport) = {
			let mut inner = self.inner.write().await;
			match inner.state {
				Lifecycle::Stopped | Lifecycle::Stopping => return,
				Lifecycle::Starting | Lifecycle::Running => {}
			}
			inner.state = Lifecycle::Stopping;
			if let Some(tx) = inner.shutdown.take() {
				let _ = tx.send(true);
			}
			(std::mem::take(&mut inner.tasks), inner.transport.take())
		};

		if let Some(transport) = &transport {
			let deadline = self.config.flush_period().max(Duration::from_secs(5));
			if tokio::time::timeout(deadline, self.flush_once(transport))
				.await
				.is_err()
			{
				warn!("final flush did not finish within {:?}; items remain buffered", deadline);
			}
		}

		// Let a task finish an in-flight delivery before cutting it off;
		// an abort mid-send would lose the swapped-out batch.
		for mut task in tasks {
			if tokio::time::timeout(Duration::from_secs(1), &mut task)
				.await
				.is_err()
			{
				task.abort();
			}
		}

		let mut inner = self.inner.write().await;
		inner.started_ts = None;
		inner.state = Lifecycle::Stopped;
		info!("agent stopped for project {}", self.config.project_id);
	}

	/// Queue an event. Returns false when events are disabled or the
	/// handler is not running; never fails once started.
	pub async fn send_event(&self, event: SecurityEvent) -> bool {
		if !self.config.enable_events || !self.is_running().await {
			return false;
		}
		self.counters.events_received.fetch_add(1, Ordering::Relaxed);
		self.buffer.add_event(event).await;
		true
	}

	pub async fn send_metric(&self, metric: SecurityMetric) -> bool {
		if !self.config.enable_metrics || !self.is_running().await {
			return false;
		}
		self.counters
			.metrics_received
			.fetch_add(1, Ordering::Relaxed);
		self.buffer.add_metric(metric).await;
		true
	}

	/// Attach a durable store. Permitted before or after start; attaching
	/// to a running, previously memory-only handler triggers an immediate
	/// recovery pass.
	pub async fn initialize_store(&self, store: Arc<dyn OverflowStore>) {
		let had_store = self.buffer.has_store().await;
		*self.store.write().await = Some(Arc::clone(&store));
		self.buffer.attach_store(store).await;
		if !had_store && self.is_running().await {
			let recovered = self.buffer.recover().await;
			if recovered > 0 {
				info!("recovered {} buffered items after store attachment", recovered);
			}
		}
	}

	/// Last dynamic rule document seen, if any.
	pub fn get_dynamic_rules(&self) -> Option<DynamicRules> {
		self.rules_tx.borrow().clone()
	}

	/// Subscribe to rule updates. The receiver yields whenever a document
	/// with a new version arrives.
	pub fn subscribe_rules(&self) -> watch::Receiver<Option<DynamicRules>> {
		self.rules_tx.subscribe()
	}

	pub async fn get_status(&self) -> AgentStatus {
		let (state, started_ts, transport) = {
			let inner = self.inner.read().await;
			(inner.state, inner.started_ts, inner.transport.clone())
		};
		let buffer = self.buffer.stats().await;
		let circuit_open = match &transport {
			Some(t) => t.circuit_state().await == CircuitState::Open,
			None => false,
		};

		let status = if state != Lifecycle::Running {
			HealthStatus::Stopped
		} else if circuit_open {
			HealthStatus::Error
		} else if self.counters.consecutive_failures.load(Ordering::Relaxed) > 0 {
			HealthStatus::Degraded
		} else {
			HealthStatus::Healthy
		};

		AgentStatus {
			status,
			uptime_seconds: started_ts
				.map(|t| (current_timestamp() - t).max(0.0))
				.unwrap_or(0.0),
			events_sent: self.counters.events_sent.load(Ordering::Relaxed),
			metrics_sent: self.counters.metrics_sent.load(Ordering::Relaxed),
			errors: self.counters.errors.load(Ordering::Relaxed),
			buffer_size: buffer.events_len + buffer.metrics_len,
			last_flush_ts: buffer.last_flush_ts,
			last_error: self.last_error.lock().ok().and_then(|g| g.clone()),
			version: env!("CARGO_PKG_VERSION").to_string(),
			hostname: self.hostname.clone(),
		}
	}

	/// Debug aggregate across config, counters, buffer, and transport.
	pub async fn get_stats(&self) -> serde_json::Value {
		let (state, transport) = {
			let inner = self.inner.read().await;
			(inner.state, inner.transport.clone())
		};
		let buffer = self.buffer.stats().await;
		let transport_stats = transport
			.map(|t| t.stats_snapshot())
			.unwrap_or_default();

		json!({
			"project_id": self.config.project_id,
			"endpoint": self.config.endpoint,
			"state": state.as_str(),
			"counters": {
				"events_received": self.counters.events_received.load(Ordering::Relaxed),
				"metrics_received": self.counters.metrics_received.load(Ordering::Relaxed),
				"events_sent": self.counters.events_sent.load(Ordering::Relaxed),
				"metrics_sent": self.counters.metrics_sent.load(Ordering::Relaxed),
				"errors": self.counters.errors.load(Ordering::Relaxed),
				"dropped_encrypted": self.counters.dropped_encrypted.load(Ordering::Relaxed),
				"dropped_permanent": self.counters.dropped_permanent.load(Ordering::Relaxed),
				"rule_errors": self.counters.rule_errors.load(Ordering::Relaxed),
			},
			"buffer": buffer,
			"transport": transport_stats,
		})
	}

	async fn is_running(&self) -> bool {
		self.inner.read().await.state == Lifecycle::Running
	}

	fn record_delivery_error(&self, e: &TransportError) {
		self.counters.errors.fetch_add(1, Ordering::Relaxed);
		self.counters
			.consecutive_failures
			.fetch_add(1, Ordering::Relaxed);
		if let Ok(mut g) = self.last_error.lock() {
			*g = Some(e.to_string());
		}
	}

	/// Drain the buffer and deliver both batches concurrently. Failed
	/// batches are re-buffered unless the failure is permanent; encryption
	/// failures drop the batch outright.
	async fn flush_once(&self, transport: &Arc<dyn TelemetryTransport>) {
		let (events, metrics) = self.buffer.flush().await;
		if events.is_empty() && metrics.is_empty() {
			return;
		}
		let n_events = events.len() as u64;
		let n_metrics = metrics.len() as u64;
		debug!("flushing {} events, {} metrics", n_events, n_metrics);

		let (event_result, metric_result) = tokio::join!(
			async {
				if events.is_empty() {
					Ok(())
				} else {
					transport.send_events(&events).await
				}
			},
			async {
				if metrics.is_empty() {
					Ok(())
				} else {
					transport.send_metrics(&metrics).await
				}
			},
		);

		let mut failed = false;
		let mut requeue_events = Vec::new();
		let mut requeue_metrics = Vec::new();

		match event_result {
			Ok(()) => {
				self.counters.events_sent.fetch_add(n_events, Ordering::Relaxed);
			}
			Err(e) => {
				failed = true;
				self.record_delivery_error(&e);
				match e {
					TransportError::Encryption(_) => {
						warn!("dropping {} events after encryption failure", n_events);
						self.counters
							.dropped_encrypted
							.fetch_add(n_events, Ordering::Relaxed);
					}
					TransportError::Permanent { status: 413 } => {
						// Payload too large: retry with the newer half.
						let mut dropped = events;
						let keep = dropped.split_off(dropped.len() / 2);
						self.counters
							.dropped_permanent
							.fetch_add(dropped.len() as u64, Ordering::Relaxed);
						requeue_events = keep;
					}
					TransportError::Permanent { status } => {
						warn!("dropping {} events after permanent failure (status {})", n_events, status);
						self.counters
							.dropped_permanent
							.fetch_add(n_events, Ordering::Relaxed);
					}
					TransportError::Retriable { .. } | TransportError::CircuitOpen => {
						requeue_events = events;
					}
				}
			}
		}

		match metric_result {
			Ok(()) => {
				self.counters
					.metrics_sent
					.fetch_add(n_metrics, Ordering::Relaxed);
			}
			Err(e) => {
				failed = true;
				self.record_delivery_error(&e);
				match e {
					TransportError::Encryption(_) => {
						warn!("dropping {} metrics after encryption failure", n_metrics);
						self.counters
							.dropped_encrypted
							.fetch_add(n_metrics, Ordering::Relaxed);
					}
					TransportError::Permanent { status: 413 } => {
						let mut dropped = metrics;
						let keep = dropped.split_off(dropped.len() / 2);
						self.counters
							.dropped_permanent
							.fetch_add(dropped.len() as u64, Ordering::Relaxed);
						requeue_metrics = keep;
					}
					TransportError::Permanent { status } => {
						warn!("dropping {} metrics after permanent failure (status {})", n_metrics, status);
						self.counters
							.dropped_permanent
							.fetch_add(n_metrics, Ordering::Relaxed);
					}
					TransportError::Retriable { .. } | TransportError::CircuitOpen => {
						requeue_metrics = metrics;
					}
				}
			}
		}

		if !failed {
			self.counters.consecutive_failures.store(0, Ordering::Relaxed);
		}
		if !requeue_events.is_empty() || !requeue_metrics.is_empty() {
			self.buffer.requeue(requeue_events, requeue_metrics).await;
		}
	}

	async fn flusher_loop(
		self: Arc<Self>,
		transport: Arc<dyn TelemetryTransport>,
		mut shutdown: watch::Receiver<bool>,
	) {
		let period = self.config.flush_period();
		loop {
			tokio::select! {
				_ = tokio::time::sleep(period) => {}
				_ = self.buffer.flush_signal().notified() => {
					debug!("high-water signal; flushing early");
				}
				_ = shutdown.changed() => break,
			}
			self.flush_once(&transport).await;
		}
	}

	async fn heartbeat_loop(
		self: Arc<Self>,
		transport: Arc<dyn TelemetryTransport>,
		mut shutdown: watch::Receiver<bool>,
	) {
		let mut tick = interval(self.config.flush_period() * 2);
		loop {
			tokio::select! {
				_ = tick.tick() => {}
				_ = shutdown.changed() => break,
			}
			let status = self.get_status().await;
			if let Err(e) = transport.send_status(&status).await {
				debug!("status heartbeat failed: {}", e);
			}
			if let Some(s) = self.store.read().await.clone() {
				if let Ok(json) = serde_json::to_string(&status) {
					if let Err(e) = s.set(store::STATUS_KEY, &json, Some(store::STATUS_TTL)).await {
						debug!("failed to persist status snapshot: {}", e);
					}
				}
			}
		}
	}

	async fn rule_poll_loop(
		self: Arc<Self>,
		transport: Arc<dyn TelemetryTransport>,
		mut shutdown: watch::Receiver<bool>,
	) {
		let mut tick = interval(self.config.rule_poll_period());
		loop {
			tokio::select! {
				_ = tick.tick() => {}
				_ = shutdown.changed() => break,
			}
			match transport.fetch_dynamic_rules().await {
				Ok(Some(rules)) => self.apply_rules(rules).await,
				Ok(None) => {}
				Err(e) => {
					self.counters.rule_errors.fetch_add(1, Ordering::Relaxed);
					debug!("rule poll failed: {}", e);
				}
			}
		}
	}

	async fn apply_rules(&self, rules: DynamicRules) {
		let changed = self
			.rules_tx
			.borrow()
			.as_ref()
			.map(|current| current.version != rules.version)
			.unwrap_or(true);
		if !changed {
			return;
		}
		info!("dynamic rules updated to version {}", rules.version);
		if let Some(s) = self.store.read().await.clone() {
			if let Ok(json) = serde_json::to_string(&rules) {
				if let Err(e) = s.set(store::RULES_KEY, &json, None).await {
					debug!("failed to cache rules document: {}", e);
				}
			}
		}
		self.rules_tx.send_replace(Some(rules));
	}

	/// Load the last cached rule document so subscribers see the
	/// last-known policy immediately after a restart.
	async fn prime_rules_cache(&self) {
		let Some(s) = self.store.read().await.clone() else {
			return;
		};
		match s.get(store::RULES_KEY).await {
			Ok(Some(json)) => match serde_json::from_str::<DynamicRules>(&json) {
				Ok(rules) => {
					debug!("primed rules cache at version {}", rules.version);
					self.rules_tx.send_replace(Some(rules));
				}
				Err(e) => debug!("ignoring unreadable cached rules: {}", e),
			},
			Ok(None) => {}
			Err(e) => debug!("failed to read cached rules: {}", e),
		}
	}
}
