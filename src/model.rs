use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::util::current_timestamp;

/// Kind of security event reported by the host middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
	IpBanned,
	RateLimited,
	SuspiciousRequest,
	CloudBlocked,
	CountryBlocked,
	PenetrationAttempt,
	BehavioralViolation,
	UserAgentBlocked,
	CustomRuleTriggered,
	PathExcluded,
	DynamicRuleUpdated,
	ErrorResponse,
	LoginAttempt,
	SuspiciousActivity,
}

/// Kind of performance metric reported by the host middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
	RequestCount,
	ResponseTime,
	ErrorRate,
	BandwidthUsage,
	ThreatLevel,
	BlockRate,
	CacheHitRate,
}

/// A single security event observed at request time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
	/// Seconds since epoch, float.
	pub timestamp: f64,
	pub event_type: EventType,
	pub ip_address: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub country: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub user_agent: Option<String>,
	/// What the middleware did about it (e.g. "blocked", "logged").
	pub action_taken: String,
	pub reason: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub endpoint: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub method: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub status_code: Option<u16>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub response_time: Option<f64>,
	/// Free-form context; sensitive header entries are redacted on enqueue.
	#[serde(default)]
	pub metadata: HashMap<String, String>,
}

impl SecurityEvent {
	/// Event stamped with the current wall clock; optional fields empty.
	pub fn new(
		event_type: EventType,
		ip_address: impl Into<String>,
		action_taken: impl Into<String>,
		reason: impl Into<String>,
	) -> Self {
		Self {
			timestamp: current_timestamp(),
			event_type,
			ip_address: ip_address.into(),
			country: None,
			user_agent: None,
			action_taken: action_taken.into(),
			reason: reason.into(),
			endpoint: None,
			method: None,
			status_code: None,
			response_time: None,
			metadata: HashMap::new(),
		}
	}
}

/// A single performance metric sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityMetric {
	/// Seconds since epoch, float.
	pub timestamp: f64,
	pub metric_type: MetricType,
	pub value: f64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub endpoint: Option<String>,
	#[serde(default)]
	pub tags: HashMap<String, String>,
}

impl SecurityMetric {
	pub fn new(metric_type: MetricType, value: f64) -> Self {
		Self {
			timestamp: current_timestamp(),
			metric_type,
			value,
			endpoint: None,
			tags: HashMap::new(),
		}
	}
}

/// Snapshot of the buffer contents taken at flush time; the unit of
/// transport. A batch is either fully delivered (2xx) or fully retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
	pub events: Vec<SecurityEvent>,
	pub metrics: Vec<SecurityMetric>,
	#[serde(with = "iso8601_seconds")]
	pub batch_timestamp: DateTime<Utc>,
	pub project_id: String,
}

impl EventBatch {
	pub fn new(
		events: Vec<SecurityEvent>,
		metrics: Vec<SecurityMetric>,
		project_id: impl Into<String>,
	) -> Self {
		Self {
			events,
			metrics,
			batch_timestamp: Utc::now(),
			project_id: project_id.into(),
		}
	}

	pub fn is_empty(&self) -> bool {
		self.events.is_empty() && self.metrics.is_empty()
	}
}

/// ISO-8601 with seconds precision, UTC. The batch timestamp is part of the
/// encrypted plaintext, so its formatting must be stable.
mod iso8601_seconds {
	use chrono::{DateTime, SecondsFormat, Utc};
	use serde::{self, Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Secs, true))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
		let raw = String::deserialize(d)?;
		DateTime::parse_from_rfc3339(&raw)
			.map(|dt| dt.with_timezone(&Utc))
			.map_err(serde::de::Error::custom)
	}
}

/// Per-endpoint rate limit override inside a dynamic rule document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRule {
	pub requests: u32,
	pub window_seconds: u64,
}

/// Dynamic security policy pulled from the management service. The host
/// applies it without restart; `version` decides whether a fetched
/// document supersedes the cached one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicRules {
	#[serde(default)]
	pub ip_blacklist: HashSet<String>,
	#[serde(default)]
	pub ip_whitelist: HashSet<String>,
	#[serde(default)]
	pub blocked_countries: HashSet<String>,
	#[serde(default)]
	pub allowed_countries: HashSet<String>,
	/// Endpoint path -> override limit.
	#[serde(default)]
	pub endpoint_rules: HashMap<String, EndpointRule>,
	/// Requests per window across all endpoints, when set.
	#[serde(default)]
	pub global_rate_limit: Option<u32>,
	/// Lock everything down except whitelisted IPs.
	#[serde(default)]
	pub emergency_mode: bool,
	#[serde(default)]
	pub enable_penetration_detection: bool,
	#[serde(default)]
	pub version: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub etag: Option<String>,
	/// Seconds this document stays fresh.
	#[serde(default = "default_rules_ttl")]
	pub ttl: u64,
}

fn default_rules_ttl() -> u64 {
	300
}

impl DynamicRules {
	/// Whitelist always wins over blacklist and emergency mode.
	pub fn is_ip_blocked(&self, ip: &str) -> bool {
		if self.ip_whitelist.contains(ip) {
			return false;
		}
		self.emergency_mode || self.ip_blacklist.contains(ip)
	}

	pub fn is_country_blocked(&self, country: &str) -> bool {
		if !self.allowed_countries.is_empty() {
			return !self.allowed_countries.contains(country);
		}
		self.blocked_countries.contains(country)
	}

	/// Override limit for an endpoint path, if the document carries one.
	pub fn endpoint_limit(&self, endpoint: &str) -> Option<&EndpointRule> {
		self.endpoint_rules.get(endpoint)
	}
}

/// Coarse agent health reported in status heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
	Healthy,
	Degraded,
	Error,
	Stopped,
}

/// Point-in-time agent status pushed to `/api/v1/agents/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
	pub status: HealthStatus,
	pub uptime_seconds: f64,
	pub events_sent: u64,
	pub metrics_sent: u64,
	pub errors: u64,
	/// Items currently buffered in memory (events + metrics).
	pub buffer_size: usize,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_flush_ts: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_error: Option<String>,
	pub version: String,
	pub hostname: String,
}
