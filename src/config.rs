use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use url::Url;

use crate::error::AgentError;

/// Default management service endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://api.fastapi-guard.com";

/// Agent configuration, frozen after construction.
///
/// Values are loaded from (in order): defaults, an optional `guard` config
/// file, and environment variables prefixed with `GUARD_` (e.g.
/// `GUARD_API_KEY`). Hosts that embed the agent usually build it directly
/// with [`AgentConfig::new`] instead.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentConfig {
	/// Bearer credential for the management service. Required.
	pub api_key: String,
	/// Project the telemetry belongs to. Required.
	pub project_id: String,
	pub endpoint: String,
	/// In-memory capacity of each buffer queue.
	pub buffer_size: usize,
	/// Seconds between timed flushes.
	pub flush_interval: f64,
	pub enable_events: bool,
	pub enable_metrics: bool,
	/// Retries after the first attempt; total attempts is `retry_attempts + 1`.
	pub retry_attempts: u32,
	/// Base of the exponential backoff, in seconds.
	pub backoff_factor: f64,
	/// Per-attempt HTTP timeout, seconds.
	pub timeout: f64,
	/// Lowercase header names whose metadata values are redacted on enqueue.
	pub sensitive_headers: HashSet<String>,
	/// Byte budget for clamping oversized string fields.
	pub max_payload_size: usize,
	/// Seconds between dynamic-rule polls.
	pub rule_poll_interval: f64,
	/// Outbound request budget per rate window.
	pub rate_limit: u32,
	/// Rate window length, seconds.
	pub rate_window: f64,
}

fn default_sensitive_headers() -> HashSet<String> {
	["authorization", "cookie", "x-api-key"]
		.iter()
		.map(|s| s.to_string())
		.collect()
}

impl AgentConfig {
	/// Configuration with the given credentials and every other option at
	/// its default.
	pub fn new(api_key: impl Into<String>, project_id: impl Into<String>) -> Self {
		Self {
			api_key: api_key.into(),
			project_id: project_id.into(),
			endpoint: DEFAULT_ENDPOINT.to_string(),
			buffer_size: 100,
			flush_interval: 30.0,
			enable_events: true,
			enable_metrics: true,
			retry_attempts: 3,
			backoff_factor: 1.0,
			timeout: 30.0,
			sensitive_headers: default_sensitive_headers(),
			max_payload_size: 1024,
			rule_poll_interval: 300.0,
			rate_limit: 100,
			rate_window: 60.0,
		}
	}

	pub fn validate(&self) -> Result<(), AgentError> {
		if self.api_key.is_empty() {
			return Err(AgentError::Config("api_key must not be empty".into()));
		}
		if self.project_id.is_empty() {
			return Err(AgentError::Config("project_id must not be empty".into()));
		}
		let url = Url::parse(&self.endpoint)
			.map_err(|e| AgentError::Config(format!("endpoint is not a valid URL: {}", e)))?;
		if url.scheme() != "http" && url.scheme() != "https" {
			return Err(AgentError::Config(format!(
				"endpoint scheme must be http or https, got {}",
				url.scheme()
			)));
		}
		if self.buffer_size == 0 {
			return Err(AgentError::Config("buffer_size must be at least 1".into()));
		}
		if self.flush_interval <= 0.0 {
			return Err(AgentError::Config("flush_interval must be positive".into()));
		}
		if self.timeout <= 0.0 {
			return Err(AgentError::Config("timeout must be positive".into()));
		}
		if self.backoff_factor < 0.0 {
			return Err(AgentError::Config("backoff_factor must not be negative".into()));
		}
		if self.rate_limit == 0 || self.rate_window <= 0.0 {
			return Err(AgentError::Config(
				"rate_limit and rate_window must be positive".into(),
			));
		}
		Ok(())
	}

	/// Identity under which handler instances are registered.
	pub(crate) fn registry_key(&self) -> (String, String, String) {
		(
			self.api_key.clone(),
			self.project_id.clone(),
			self.endpoint.clone(),
		)
	}

	pub fn flush_period(&self) -> Duration {
		Duration::from_secs_f64(self.flush_interval)
	}

	pub fn attempt_timeout(&self) -> Duration {
		Duration::from_secs_f64(self.timeout)
	}

	pub fn rule_poll_period(&self) -> Duration {
		Duration::from_secs_f64(self.rule_poll_interval)
	}

	/// Endpoint with any trailing slash removed, ready for path joining.
	pub fn base_url(&self) -> String {
		self.endpoint.trim_end_matches('/').to_string()
	}
}

/// Partial configuration used to overlay file/environment values on top of
/// the defaults.
#[derive(Debug, Deserialize)]
struct PartialConfig {
	api_key: Option<String>,
	project_id: Option<String>,
	endpoint: Option<String>,
	buffer_size: Option<usize>,
	flush_interval: Option<f64>,
	enable_events: Option<bool>,
	enable_metrics: Option<bool>,
	retry_attempts: Option<u32>,
	backoff_factor: Option<f64>,
	timeout: Option<f64>,
	sensitive_headers: Option<Vec<String>>,
	max_payload_size: Option<usize>,
	rule_poll_interval: Option<f64>,
	rate_limit: Option<u32>,
	rate_window: Option<f64>,
}

/// Load configuration from an optional `guard` config file and `GUARD_*`
/// environment variables. The result is validated before being returned.
pub fn load() -> Result<AgentConfig> {
	let builder = config::Config::builder()
		.add_source(config::File::with_name("guard").required(false))
		// Double-underscore separator so names like `GUARD_API_KEY` map to
		// `api_key` instead of nested `api.key`.
		.add_source(config::Environment::with_prefix("GUARD").separator("__"));

	let cfg = builder.build()?;
	let partial: PartialConfig = cfg.try_deserialize()?;

	let mut c = AgentConfig::new(
		partial.api_key.unwrap_or_default(),
		partial.project_id.unwrap_or_default(),
	);
	if let Some(endpoint) = partial.endpoint {
		c.endpoint = endpoint;
	}
	if let Some(n) = partial.buffer_size {
		c.buffer_size = n;
	}
	if let Some(secs) = partial.flush_interval {
		c.flush_interval = secs;
	}
	if let Some(b) = partial.enable_events {
		c.enable_events = b;
	}
	if let Some(b) = partial.enable_metrics {
		c.enable_metrics = b;
	}
	if let Some(n) = partial.retry_attempts {
		c.retry_attempts = n;
	}
	if let Some(f) = partial.backoff_factor {
		c.backoff_factor = f;
	}
	if let Some(secs) = partial.timeout {
		c.timeout = secs;
	}
	if let Some(headers) = partial.sensitive_headers {
		c.sensitive_headers = headers.into_iter().map(|h| h.to_lowercase()).collect();
	}
	if let Some(n) = partial.max_payload_size {
		c.max_payload_size = n;
	}
	if let Some(secs) = partial.rule_poll_interval {
		c.rule_poll_interval = secs;
	}
	if let Some(n) = partial.rate_limit {
		c.rate_limit = n;
	}
	if let Some(secs) = partial.rate_window {
		c.rate_window = secs;
	}

	// Explicitly prefer direct environment variables when present; some
	// environments set them in ways the `config` crate doesn't map.
	if let Ok(v) = std::env::var("GUARD_API_KEY") {
		if !v.is_empty() {
			c.api_key = v;
		}
	}
	if let Ok(v) = std::env::var("GUARD_PROJECT_ID") {
		if !v.is_empty() {
			c.project_id = v;
		}
	}
	if let Ok(v) = std::env::var("GUARD_ENDPOINT") {
		if !v.is_empty() {
			c.endpoint = v;
		}
	}

	c.validate().map_err(|e| anyhow::anyhow!(e.to_string()))?;
	Ok(c)
}
