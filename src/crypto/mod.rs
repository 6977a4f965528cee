//! Cryptographic operations for the Pulse ledger.
//! Uses secp256k1 ECDSA for signing and verification, SHA-256 for content hashing.

use k256::{
    ecdsa::{
        signature::{Signer, Verifier},
        Signature, SigningKey, VerifyingKey,
    },
    SecretKey,
};
use rand::rngs::OsRng;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Hex decode error: {0}")]
    HexError(#[from] hex::FromHexError),
}

/// A keypair for device/user identity
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Keypair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut OsRng);
        let verifying_key = *signing_key.verifying_key();
        Self { signing_key, verifying_key }
    }

    /// Create keypair from private key hex
    pub fn from_private_key_hex(hex_key: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hex_key)?;
        let secret_key = SecretKey::from_slice(&bytes)
            .map_err(|_| CryptoError::InvalidPrivateKey)?;
        let signing_key = SigningKey::from(secret_key);
        let verifying_key = *signing_key.verifying_key();
        Ok(Self { signing_key, verifying_key })
    }

    /// Get private key as hex string
    pub fn private_key_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// Get public key as hex string (SEC1 compressed). This is the ledger identity.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key.to_sec1_bytes())
    }

    /// Sign data and return hex-encoded signature
    pub fn sign(&self, data: &[u8]) -> String {
        let signature: Signature = self.signing_key.sign(data);
        hex::encode(signature.to_bytes())
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// Verify a signature, reporting why a malformed input was refused.
///
/// `Ok(false)` means the inputs decoded but the signature does not match.
pub fn try_verify_signature(
    public_key_hex: &str,
    data: &[u8],
    signature_hex: &str,
) -> Result<bool, CryptoError> {
    let pubkey_bytes = hex::decode(public_key_hex)?;
    let verifying_key = VerifyingKey::from_sec1_bytes(&pubkey_bytes)
        .map_err(|_| CryptoError::InvalidPublicKey)?;

    let sig_bytes = hex::decode(signature_hex)?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|_| CryptoError::InvalidSignature)?;

    Ok(verifying_key.verify(data, &signature).is_ok())
}

/// Verify a signature against a public key. Any malformed input is `false`.
pub fn verify_signature(public_key_hex: &str, data: &[u8], signature_hex: &str) -> bool {
    try_verify_signature(public_key_hex, data, signature_hex).unwrap_or(false)
}

/// Canonical encoding shared by signing and hashing: compact JSON with
/// object keys in lexicographic order.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    value.to_string().into_bytes()
}

/// Hash data with SHA-256 and return hex string
pub fn content_hash(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    hex::encode(hash)
}
