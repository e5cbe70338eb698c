use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use rand::Rng;
use reqwest::Method;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, ETAG, HeaderMap, HeaderValue, IF_NONE_MATCH};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::breaker::{BreakerError, CircuitBreaker, CircuitState};
use crate::config::AgentConfig;
use crate::crypto::{CryptoError, PayloadEncryptor};
use crate::error::AgentError;
use crate::model::{AgentStatus, DynamicRules, SecurityEvent, SecurityMetric};
use crate::rate_limit::RateLimiter;
use crate::util::current_timestamp;

/// Backoff sleeps never exceed this, whatever the attempt count.
const MAX_BACKOFF: f64 = 30.0;

/// Delivery failure as seen by the flusher. The distinction matters:
/// encryption failures must never be re-buffered, permanent failures are
/// dropped (413 aside), everything else is retried on the next flush.
#[derive(Debug, Error)]
pub enum TransportError {
	/// The batch could not be serialised or encrypted; retrying is useless.
	#[error("payload encryption failed: {0}")]
	Encryption(#[from] CryptoError),

	/// Network errors, timeouts, 408/429/5xx — retries exhausted.
	#[error("request failed after {attempts} attempts: {reason}")]
	Retriable { attempts: u32, reason: String },

	/// A 4xx other than 408/429; no further attempts were made.
	#[error("permanent HTTP failure: status {status}")]
	Permanent { status: u16 },

	/// The breaker short-circuited the call; no HTTP was attempted.
	#[error("circuit breaker is open")]
	CircuitOpen,
}

impl TransportError {
	pub fn status(&self) -> Option<u16> {
		match self {
			TransportError::Permanent { status } => Some(*status),
			_ => None,
		}
	}
}

/// Outcome of a single HTTP attempt, before retry classification.
#[derive(Debug, Clone, Error)]
pub enum AttemptError {
	#[error("network error: {0}")]
	Network(String),

	#[error("request timed out")]
	Timeout,

	#[error("HTTP status {0}")]
	Status(u16),
}

fn status_retriable(status: u16) -> bool {
	status == 408 || status == 429 || status >= 500
}

impl AttemptError {
	fn retriable(&self) -> bool {
		match self {
			AttemptError::Network(_) | AttemptError::Timeout => true,
			AttemptError::Status(status) => status_retriable(*status),
		}
	}
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
	pub method: Method,
	pub url: String,
	pub body: Option<String>,
	pub if_none_match: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
	pub status: u16,
	pub body: String,
	pub etag: Option<String>,
}

/// Seam between the resilience machinery and the actual HTTP client.
/// Tests script responses through an in-memory implementation.
#[async_trait]
pub trait HttpExec: Send + Sync {
	async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, AttemptError>;
}

/// Production executor backed by a shared `reqwest` client with the
/// per-attempt timeout and identifying headers baked in.
pub struct ReqwestExec {
	client: reqwest::Client,
}

impl ReqwestExec {
	pub fn new(config: &AgentConfig) -> Result<Self, AgentError> {
		let mut headers = HeaderMap::new();
		let bearer = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
			.map_err(|e| AgentError::Config(format!("api_key is not header-safe: {}", e)))?;
		headers.insert(AUTHORIZATION, bearer);
		let project = HeaderValue::from_str(&config.project_id)
			.map_err(|e| AgentError::Config(format!("project_id is not header-safe: {}", e)))?;
		headers.insert("X-Project-Id", project);
		headers.insert(
			"X-Agent-Version",
			HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
		);

		let client = reqwest::Client::builder()
			.timeout(config.attempt_timeout())
			.default_headers(headers)
			.user_agent(format!("fastapi-guard-agent/{}", env!("CARGO_PKG_VERSION")))
			.build()
			.map_err(|e| AgentError::Config(format!("failed to build HTTP client: {}", e)))?;

		Ok(Self { client })
	}
}

#[async_trait]
impl HttpExec for ReqwestExec {
	async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, AttemptError> {
		let ApiRequest {
			method,
			url,
			body,
			if_none_match,
		} = request;

		let mut builder = self.client.request(method, url.as_str());
		if let Some(etag) = if_none_match {
			builder = builder.header(IF_NONE_MATCH, etag);
		}
		if let Some(body) = body {
			builder = builder
				.header(CONTENT_TYPE, "application/json")
				.body(body);
		}

		let response = builder.send().await.map_err(|e| {
			if e.is_timeout() {
				AttemptError::Timeout
			} else {
				AttemptError::Network(e.to_string())
			}
		})?;

		let status = response.status().as_u16();
		let etag = response
			.headers()
			.get(ETAG)
			.and_then(|v| v.to_str().ok())
			.map(String::from);
		let body = response.text().await.unwrap_or_default();

		Ok(ApiResponse { status, body, etag })
	}
}

/// Outbound request accounting.
#[derive(Default)]
pub struct TransportStats {
	pub requests_sent: AtomicU64,
	pub requests_failed: AtomicU64,
	pub bytes_sent: AtomicU64,
	last_success_ts: std::sync::Mutex<Option<f64>>,
	last_error: std::sync::Mutex<Option<String>>,
}

impl TransportStats {
	fn record_success(&self, bytes: u64) {
		self.requests_sent.fetch_add(1, Ordering::Relaxed);
		self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
		if let Ok(mut ts) = self.last_success_ts.lock() {
			*ts = Some(current_timestamp());
		}
	}

	fn record_failure(&self, reason: &str) {
		self.requests_failed.fetch_add(1, Ordering::Relaxed);
		if let Ok(mut e) = self.last_error.lock() {
			*e = Some(reason.to_string());
		}
	}

	pub fn snapshot(&self) -> TransportStatsSnapshot {
		TransportStatsSnapshot {
			requests_sent: self.requests_sent.load(Ordering::Relaxed),
			requests_failed: self.requests_failed.load(Ordering::Relaxed),
			bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
			last_success_ts: self.last_success_ts.lock().ok().and_then(|v| *v),
			last_error: self.last_error.lock().ok().and_then(|v| v.clone()),
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransportStatsSnapshot {
	pub requests_sent: u64,
	pub requests_failed: u64,
	pub bytes_sent: u64,
	pub last_success_ts: Option<f64>,
	pub last_error: Option<String>,
}

/// Capability the handler depends on for delivery. Substituted with
/// in-memory fakes in tests.
#[async_trait]
pub trait TelemetryTransport: Send + Sync {
	async fn send_events(&self, events: &[SecurityEvent]) -> Result<(), TransportError>;
	async fn send_metrics(&self, metrics: &[SecurityMetric]) -> Result<(), TransportError>;
	async fn send_status(&self, status: &AgentStatus) -> Result<(), TransportError>;
	async fn fetch_dynamic_rules(&self) -> Result<Option<DynamicRules>, TransportError>;
	async fn test_connection(&self) -> bool;

	/// Breaker observation used for status derivation.
	async fn circuit_state(&self) -> CircuitState {
		CircuitState::Closed
	}

	fn stats_snapshot(&self) -> TransportStatsSnapshot {
		TransportStatsSnapshot::default()
	}
}

/// HTTP transport to the management service. Every call takes one rate
/// limiter slot, then runs breaker-guarded attempts with jittered
/// exponential backoff; encrypted endpoints wrap the body via the payload
/// encryptor first.
pub struct HttpTransport {
	base_url: String,
	project_id: String,
	retry_attempts: u32,
	backoff_factor: f64,
	exec: Arc<dyn HttpExec>,
	limiter: RateLimiter,
	breaker: CircuitBreaker,
	encryptor: PayloadEncryptor,
	stats: TransportStats,
	rules_etag: Mutex<Option<String>>,
}

/// Sleep after failed attempt `k` (1-based):
/// `min(factor * 2^(k-1) * (1 + U[0, 0.3]), 30 s)`.
fn backoff_delay(factor: f64, failed_attempt: u32) -> Duration {
	let base = factor * 2f64.powi(failed_attempt.saturating_sub(1).min(16) as i32);
	let jitter: f64 = rand::thread_rng().gen_range(0.0..0.3);
	Duration::from_secs_f64((base * (1.0 + jitter)).clamp(0.0, MAX_BACKOFF))
}

impl HttpTransport {
	pub fn new(config: &AgentConfig) -> Result<Self, AgentError> {
		let exec = Arc::new(ReqwestExec::new(config)?);
		Self::with_exec(config, exec)
	}

	/// Build with an injected executor. The encryption round-trip probe
	/// runs here in either construction path; a failing probe aborts start.
	pub fn with_exec(config: &AgentConfig, exec: Arc<dyn HttpExec>) -> Result<Self, AgentError> {
		let encryptor = PayloadEncryptor::new(&config.api_key, &config.project_id)
			.map_err(AgentError::EncryptionInit)?;
		encryptor
			.verify_round_trip()
			.map_err(AgentError::EncryptionInit)?;

		Ok(Self {
			base_url: config.base_url(),
			project_id: config.project_id.clone(),
			retry_attempts: config.retry_attempts,
			backoff_factor: config.backoff_factor,
			exec,
			limiter: RateLimiter::new(
				config.rate_limit,
				Duration::from_secs_f64(config.rate_window),
			),
			breaker: CircuitBreaker::with_defaults(),
			encryptor,
			stats: TransportStats::default(),
			rules_etag: Mutex::new(None),
		})
	}

	fn url(&self, path: &str) -> String {
		format!("{}{}", self.base_url, path)
	}

	async fn attempt(&self, request: ApiRequest) -> Result<ApiResponse, AttemptError> {
		let response = self.exec.execute(request).await?;
		match response.status {
			200..=299 | 304 => Ok(response),
			status => Err(AttemptError::Status(status)),
		}
	}

	async fn request_with_retry(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
		self.limiter.acquire().await;

		// Retries apply to non-GET operations only; rule fetches get a
		// single attempt and rely on the next poll instead.
		let max_attempts = if request.method == Method::GET {
			1
		} else {
			self.retry_attempts + 1
		};
		let body_bytes = request.body.as_ref().map(|b| b.len() as u64).unwrap_or(0);

		let mut attempt = 0u32;
		loop {
			attempt += 1;
			match self.breaker.call(self.attempt(request.clone())).await {
				Ok(response) => {
					self.stats.record_success(body_bytes);
					return Ok(response);
				}
				Err(BreakerError::Open) => {
					self.stats.record_failure("circuit breaker open");
					return Err(TransportError::CircuitOpen);
				}
				Err(BreakerError::Service(AttemptError::Status(status)))
					if !status_retriable(status) =>
				{
					self.stats.record_failure(&format!("HTTP status {}", status));
					return Err(TransportError::Permanent { status });
				}
				Err(BreakerError::Service(e)) => {
					if attempt >= max_attempts {
						self.stats.record_failure(&e.to_string());
						return Err(TransportError::Retriable {
							attempts: attempt,
							reason: e.to_string(),
						});
					}
					let delay = backoff_delay(self.backoff_factor, attempt);
					debug!(
						"attempt {}/{} against {} failed ({}); retrying in {:?}",
						attempt, max_attempts, request.url, e, delay
					);
					tokio::time::sleep(delay).await;
				}
			}
		}
	}

	/// Envelope for the encrypted endpoints:
	/// `{project_id, encrypted: true, payload: b64url(nonce||ct||tag)}`.
	fn encrypted_body<T: Serialize>(&self, plaintext: &T) -> Result<String, TransportError> {
		let payload = self.encryptor.encrypt_json(plaintext)?;
		Ok(json!({
			"project_id": self.project_id,
			"encrypted": true,
			"payload": payload,
		})
		.to_string())
	}
}

#[async_trait]
impl TelemetryTransport for HttpTransport {
	async fn send_events(&self, events: &[SecurityEvent]) -> Result<(), TransportError> {
		if events.is_empty() {
			return Ok(());
		}
		let body = self.encrypted_body(&json!({ "events": events }))?;
		let request = ApiRequest {
			method: Method::POST,
			url: self.url("/api/v1/events/encrypted"),
			body: Some(body),
			if_none_match: None,
		};
		self.request_with_retry(request).await.map(|_| ())
	}

	async fn send_metrics(&self, metrics: &[SecurityMetric]) -> Result<(), TransportError> {
		if metrics.is_empty() {
			return Ok(());
		}
		let body = self.encrypted_body(&json!({ "metrics": metrics }))?;
		let request = ApiRequest {
			method: Method::POST,
			url: self.url("/api/v1/metrics/encrypted"),
			body: Some(body),
			if_none_match: None,
		};
		self.request_with_retry(request).await.map(|_| ())
	}

	async fn send_status(&self, status: &AgentStatus) -> Result<(), TransportError> {
		let body = serde_json::to_string(status)
			.map_err(|e| TransportError::Encryption(CryptoError::Serialize(e)))?;
		let request = ApiRequest {
			method: Method::POST,
			url: self.url("/api/v1/agents/status"),
			body: Some(body),
			if_none_match: None,
		};
		self.request_with_retry(request).await.map(|_| ())
	}

	async fn fetch_dynamic_rules(&self) -> Result<Option<DynamicRules>, TransportError> {
		let etag = self.rules_etag.lock().await.clone();
		let request = ApiRequest {
			method: Method::GET,
			url: format!("{}/api/v1/projects/{}/rules", self.base_url, self.project_id),
			body: None,
			if_none_match: etag,
		};
		let response = self.request_with_retry(request).await?;
		if response.status == 304 {
			return Ok(None);
		}
		let mut rules: DynamicRules = serde_json::from_str(&response.body).map_err(|e| {
			TransportError::Retriable {
				attempts: 1,
				reason: format!("invalid rules document: {}", e),
			}
		})?;
		if rules.etag.is_none() {
			rules.etag = response.etag;
		}
		*self.rules_etag.lock().await = rules.etag.clone();
		Ok(Some(rules))
	}

	async fn test_connection(&self) -> bool {
		self.limiter.acquire().await;
		let request = ApiRequest {
			method: Method::GET,
			url: self.url("/api/v1/health"),
			body: None,
			if_none_match: None,
		};
		self.attempt(request).await.is_ok()
	}

	async fn circuit_state(&self) -> CircuitState {
		self.breaker.state().await
	}

	fn stats_snapshot(&self) -> TransportStatsSnapshot {
		self.stats.snapshot()
	}
}
