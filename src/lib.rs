//! Telemetry and control-plane agent for security middleware.
//!
//! The agent collects security events and performance metrics produced at
//! request time, buffers them in memory (optionally spilling overflow to a
//! durable key/value store), encrypts each batch with AES-256-GCM, and
//! delivers it to a remote management service with retries, a circuit
//! breaker, and client-side rate limiting. It also polls a dynamic rule
//! document so the host can update its security policy without restart,
//! and pushes periodic status heartbeats.
//!
//! ```no_run
//! use guard_agent::{AgentConfig, EventType, SecurityEvent, agent};
//!
//! # async fn demo() -> Result<(), guard_agent::AgentError> {
//! let config = AgentConfig::new("api-key", "project-id");
//! let handler = agent(config)?;
//! handler.clone().start().await?;
//!
//! handler
//! 	.send_event(SecurityEvent::new(
//! 		EventType::IpBanned,
//! 		"203.0.113.7",
//! 		"blocked",
//! 		"listed in ip_blacklist",
//! 	))
//! 	.await;
//!
//! handler.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod buffer;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handler;
pub mod logging;
pub mod model;
pub mod rate_limit;
pub mod store;
pub mod transport;
pub mod util;

pub use config::AgentConfig;
pub use error::AgentError;
pub use handler::{AgentHandler, agent, reset_registry};
pub use logging::init_logging;
pub use model::{
	AgentStatus, DynamicRules, EventBatch, EventType, HealthStatus, MetricType, SecurityEvent,
	SecurityMetric,
};
pub use store::{MemoryStore, OverflowStore};
pub use transport::{HttpTransport, TelemetryTransport, TransportError};
