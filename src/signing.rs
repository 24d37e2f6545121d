//! Mediator identity and entry signing.
//!
//! Every entry submitted to the ledger carries a detached ed25519 signature
//! over its canonical JSON bytes. An unusable private key is a startup
//! failure, not a runtime one.

use crate::config::IdentityConfig;
use crate::error::{MediatorError, MediatorResult};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};

/// Signing identity of this mediator.
pub struct MediatorIdentity {
    signing_key: SigningKey,
    public_hex: String,
}

impl MediatorIdentity {
    /// Build from hex-encoded key material. The public key, when configured,
    /// must match the one derived from the private key.
    pub fn from_config(config: &IdentityConfig) -> MediatorResult<Self> {
        let secret = hex::decode(config.private_key.trim())
            .map_err(|e| MediatorError::Signing(format!("private key is not hex: {e}")))?;
        let secret: [u8; 32] = secret
            .try_into()
            .map_err(|_| MediatorError::Signing("private key must be 32 bytes".to_string()))?;
        let signing_key = SigningKey::from_bytes(&secret);
        let public_hex = hex::encode(signing_key.verifying_key().to_bytes());

        if !config.public_key.trim().is_empty()
            && config.public_key.trim().to_ascii_lowercase() != public_hex
        {
            return Err(MediatorError::Signing(
                "configured public key does not match the private key".to_string(),
            ));
        }

        Ok(Self {
            signing_key,
            public_hex,
        })
    }

    /// Hex-encoded public key, used as the mediator id on the ledger.
    pub fn mediator_id(&self) -> &str {
        &self.public_hex
    }

    /// Detached hex signature over the canonical JSON bytes of `value`.
    pub fn sign_json(&self, value: &serde_json::Value) -> MediatorResult<String> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| MediatorError::Internal(format!("canonicalising entry: {e}")))?;
        Ok(hex::encode(self.signing_key.sign(&bytes).to_bytes()))
    }
}

/// Verify a detached hex signature; used by tests and by challenge review.
pub fn verify_json(
    public_key_hex: &str,
    value: &serde_json::Value,
    signature_hex: &str,
) -> MediatorResult<bool> {
    let key_bytes = hex::decode(public_key_hex)
        .map_err(|e| MediatorError::Signing(format!("public key is not hex: {e}")))?;
    let key_bytes: [u8; 32] = key_bytes
        .try_into()
        .map_err(|_| MediatorError::Signing("public key must be 32 bytes".to_string()))?;
    let key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| MediatorError::Signing(format!("invalid public key: {e}")))?;

    let sig_bytes = hex::decode(signature_hex)
        .map_err(|e| MediatorError::Signing(format!("signature is not hex: {e}")))?;
    let sig_bytes: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| MediatorError::Signing("signature must be 64 bytes".to_string()))?;
    let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);

    let bytes = serde_json::to_vec(value)
        .map_err(|e| MediatorError::Internal(format!("canonicalising entry: {e}")))?;
    Ok(key.verify(&bytes, &signature).is_ok())
}
