use thiserror::Error;

use crate::crypto::CryptoError;

/// Errors surfaced to the embedding host from the factory and `start`.
///
/// Everything past a successful `start` is absorbed into counters and
/// status: producer-facing calls never return an error, and delivery,
/// store, and rule-poll failures live in `transport::TransportError` and
/// `store::StoreError` internally.
#[derive(Debug, Error)]
pub enum AgentError {
	/// Invalid or missing required configuration option.
	#[error("invalid configuration: {0}")]
	Config(String),

	/// An agent with the same `(api_key, project_id, endpoint)` identity
	/// already exists but was constructed with a different configuration.
	#[error("agent already registered with a different configuration")]
	ConfigConflict,

	/// Key derivation or the encrypt/decrypt self-check failed during
	/// transport initialisation.
	#[error("encryption self-check failed: {0}")]
	EncryptionInit(#[source] CryptoError),
}
