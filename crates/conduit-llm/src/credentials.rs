//! Credential encryption-at-rest codec.
//!
//! Interface contract, not a cryptographic design target: key material is
//! derived deterministically from a process-wide secret, and the fixed
//! `enc:v1:` marker lets plaintext and encrypted values coexist during
//! migration: a value without the marker is returned unchanged.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};

use conduit_types::ConduitError;

/// Format marker identifying an encrypted value.
pub const ENCRYPTION_MARKER: &str = "enc:v1:";

pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(ENCRYPTION_MARKER)
}

/// Encrypt `plain` under the process-wide `secret`.
pub fn encrypt_credential(plain: &str, secret: &str) -> String {
    let bytes = xor_keystream(plain.as_bytes(), secret);
    format!("{ENCRYPTION_MARKER}{}", BASE64.encode(bytes))
}

/// Decrypt-on-read accessor. Plaintext values (no marker) pass through
/// unchanged so stores can be migrated in place.
pub fn decrypt_credential(stored: &str, secret: &str) -> conduit_types::Result<String> {
    let Some(armored) = stored.strip_prefix(ENCRYPTION_MARKER) else {
        return Ok(stored.to_string());
    };
    let bytes = BASE64
        .decode(armored)
        .map_err(|e| ConduitError::Other(format!("malformed encrypted credential: {e}")))?;
    let plain = xor_keystream(&bytes, secret);
    String::from_utf8(plain)
        .map_err(|e| ConduitError::Other(format!("credential decrypts to invalid UTF-8: {e}")))
}

// SHA-256 counter-mode keystream over the derived key. Symmetric, so the
// same walk encrypts and decrypts.
fn xor_keystream(data: &[u8], secret: &str) -> Vec<u8> {
    let key = Sha256::digest(secret.as_bytes());
    let mut out = Vec::with_capacity(data.len());
    for (block_index, block) in data.chunks(32).enumerate() {
        let mut hasher = Sha256::new();
        hasher.update(key);
        hasher.update((block_index as u64).to_be_bytes());
        let pad = hasher.finalize();
        for (byte, pad_byte) in block.iter().zip(pad.iter()) {
            out.push(byte ^ pad_byte);
        }
    }
    out
}
