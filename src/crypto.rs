use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// 96-bit nonce, drawn fresh from the CSPRNG per message.
const NONCE_LEN: usize = 12;
/// 128-bit GCM authentication tag, appended to the ciphertext.
const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
	#[error("payload serialisation failed: {0}")]
	Serialize(#[from] serde_json::Error),

	#[error("encryption failed")]
	Encrypt,

	#[error("ciphertext rejected (wrong key or tampered data)")]
	Decrypt,

	#[error("encrypted frame is malformed")]
	Malformed,

	#[error("derived key has invalid length")]
	KeyLength,
}

/// SHA-256 over `api_key:project_id`; the symmetric key for this project.
pub fn derive_key(api_key: &str, project_id: &str) -> [u8; 32] {
	Sha256::digest(format!("{}:{}", api_key, project_id).as_bytes()).into()
}

/// AES-256-GCM encryptor for outbound batches.
///
/// Wire framing is base64-url (unpadded) over `nonce || ciphertext || tag`;
/// the framed string travels as the `payload` field of the request body.
pub struct PayloadEncryptor {
	cipher: Aes256Gcm,
}

impl PayloadEncryptor {
	pub fn new(api_key: &str, project_id: &str) -> Result<Self, CryptoError> {
		let key = derive_key(api_key, project_id);
		let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::KeyLength)?;
		Ok(Self { cipher })
	}

	pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
		let mut nonce_bytes = [0u8; NONCE_LEN];
		rand::thread_rng().fill_bytes(&mut nonce_bytes);
		let nonce = Nonce::from_slice(&nonce_bytes);

		let ciphertext = self
			.cipher
			.encrypt(nonce, plaintext)
			.map_err(|_| CryptoError::Encrypt)?;

		let mut framed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
		framed.extend_from_slice(&nonce_bytes);
		framed.extend_from_slice(&ciphertext);
		Ok(URL_SAFE_NO_PAD.encode(framed))
	}

	pub fn decrypt(&self, framed: &str) -> Result<Vec<u8>, CryptoError> {
		let packed = URL_SAFE_NO_PAD
			.decode(framed)
			.map_err(|_| CryptoError::Malformed)?;
		if packed.len() < NONCE_LEN + TAG_LEN {
			return Err(CryptoError::Malformed);
		}
		let (nonce_bytes, ciphertext) = packed.split_at(NONCE_LEN);
		let nonce = Nonce::from_slice(nonce_bytes);
		self.cipher
			.decrypt(nonce, ciphertext)
			.map_err(|_| CryptoError::Decrypt)
	}

	/// Serialise `value` to JSON and encrypt the bytes.
	pub fn encrypt_json<T: Serialize>(&self, value: &T) -> Result<String, CryptoError> {
		let plaintext = serde_json::to_vec(value)?;
		self.encrypt(&plaintext)
	}

	/// Encrypt-then-decrypt a one-byte probe. Run once at transport init;
	/// failure aborts agent start.
	pub fn verify_round_trip(&self) -> Result<(), CryptoError> {
		let framed = self.encrypt(&[0x01])?;
		match self.decrypt(&framed)?.as_slice() {
			[0x01] => Ok(()),
			_ => Err(CryptoError::Decrypt),
		}
	}
}
