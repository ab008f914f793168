//! Credential sealing: authenticated encryption for values at rest.
//!
//! Blob layout: version byte (0x01) || 12-byte nonce || ciphertext || 16-byte
//! tag. Keys are exactly 32 bytes (AES-256-GCM).

use aws_lc_rs::aead::{AES_256_GCM, Aad, Nonce, RandomizedNonceKey};
use secrecy::SecretString;

const VERSION: u8 = 0x01;
const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("invalid key length: expected 32 bytes, got {0}")]
	InvalidKeyLength(usize),
	#[error("invalid key")]
	InvalidKey,
	#[error("encryption failed")]
	EncryptionFailed,
	#[error("decryption failed")]
	DecryptionFailed,
	#[error("invalid ciphertext format")]
	InvalidFormat,
	#[error("unsupported ciphertext version: {0}")]
	UnsupportedVersion(u8),
}

/// Seals and opens credential values with a single master key.
pub struct Sealer {
	key: RandomizedNonceKey,
}

impl std::fmt::Debug for Sealer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		// Never expose key material, even in debug output.
		f.debug_struct("Sealer").finish_non_exhaustive()
	}
}

impl Sealer {
	/// Create from a 32-byte key.
	pub fn new(key: &[u8]) -> Result<Self, Error> {
		if key.len() != 32 {
			return Err(Error::InvalidKeyLength(key.len()));
		}
		let key = RandomizedNonceKey::new(&AES_256_GCM, key).map_err(|_| Error::InvalidKey)?;
		Ok(Self { key })
	}

	/// Create from a 64-character hex key, the form carried in configuration.
	pub fn from_hex(key: &str) -> Result<Self, Error> {
		let bytes = hex::decode(key).map_err(|_| Error::InvalidKey)?;
		Self::new(&bytes)
	}

	pub fn seal(&self, plaintext: &str) -> Result<Vec<u8>, Error> {
		let mut in_out: Vec<u8> = plaintext.as_bytes().to_vec();
		// Seal generates a fresh random nonce per entry.
		let nonce = self
			.key
			.seal_in_place_append_tag(Aad::empty(), &mut in_out)
			.map_err(|_| Error::EncryptionFailed)?;

		let mut blob = Vec::with_capacity(1 + NONCE_LEN + in_out.len());
		blob.push(VERSION);
		blob.extend_from_slice(nonce.as_ref());
		blob.extend_from_slice(&in_out);
		Ok(blob)
	}

	/// Open a sealed blob. The plaintext is returned wrapped so it is zeroed
	/// on drop.
	pub fn open(&self, blob: &[u8]) -> Result<SecretString, Error> {
		let (&version, rest) = blob.split_first().ok_or(Error::InvalidFormat)?;
		if version != VERSION {
			return Err(Error::UnsupportedVersion(version));
		}
		if rest.len() < NONCE_LEN + AES_256_GCM.tag_len() {
			return Err(Error::InvalidFormat);
		}
		let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);
		let nonce = Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| Error::InvalidFormat)?;
		let mut in_out = ciphertext.to_vec();
		let plaintext = self
			.key
			.open_in_place(nonce, Aad::empty(), &mut in_out)
			.map_err(|_| Error::DecryptionFailed)?;
		let s = std::str::from_utf8(plaintext).map_err(|_| Error::DecryptionFailed)?;
		Ok(SecretString::from(s.to_string()))
	}
}

#[cfg(test)]
#[path = "crypto_tests.rs"]
mod tests;
