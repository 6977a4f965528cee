//! Core data types for the Pulse ledger.
//!
//! Every record that is signed or hashed goes through [`crate::crypto::canonical_bytes`],
//! so signing, verification and block hashing all see the same byte encoding.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

use crate::crypto::{canonical_bytes, content_hash};

/// Sentinel `previous_hash` carried by the genesis block.
pub const GENESIS_PREVIOUS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Genesis is pinned to the epoch so every node derives the same genesis hash.
pub const GENESIS_TIMESTAMP: u64 = 0;

/// Motion vector from device accelerometer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Motion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Motion {
    pub fn magnitude(&self) -> f64 {
        (self.x.powi(2) + self.y.powi(2) + self.z.powi(2)).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Coefficients of the liveness weight `W_i = α·HR + β·||M|| + γ·continuity`.
///
/// No constraint is placed on their sum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightParams {
    /// Heart rate weight
    pub alpha: f64,
    /// Motion weight
    pub beta: f64,
    /// Continuity weight
    pub gamma: f64,
}

impl Default for WeightParams {
    fn default() -> Self {
        Self { alpha: 0.4, beta: 0.4, gamma: 0.2 }
    }
}

/// Resting heart rate the HR term is normalized against.
pub const RESTING_HEART_RATE: f64 = 70.0;
/// Motion magnitude that counts as one unit of activity.
pub const MOTION_SCALE: f64 = 0.5;
/// Cap on the normalized motion term so a single burst cannot dominate.
pub const MOTION_CAP: f64 = 2.0;

/// A heartbeat packet from a device - the atomic unit of Proof-of-Life
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
    /// Heart rate in BPM
    pub heart_rate: u16,
    /// Motion vector from accelerometer
    pub motion: Motion,
    /// Body temperature in Celsius
    pub temperature: f32,
    /// Device/user public key (hex-encoded)
    pub device_pubkey: String,
    /// ECDSA signature of the packet (hex-encoded)
    #[serde(default)]
    pub signature: String,
}

impl Heartbeat {
    /// Calculate weighted contribution for a given continuity factor.
    pub fn weight_with_continuity(&self, params: &WeightParams, continuity: f64) -> f64 {
        let hr_norm = self.heart_rate as f64 / RESTING_HEART_RATE;
        let motion_norm = (self.motion.magnitude() / MOTION_SCALE).min(MOTION_CAP);

        params.alpha * hr_norm + params.beta * motion_norm + params.gamma * continuity
    }

    /// Canonical bytes covered by the signature (everything but `signature`).
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut map = BTreeMap::new();
        map.insert("device_pubkey", json!(self.device_pubkey));
        map.insert("heart_rate", json!(self.heart_rate));
        map.insert("motion", json!(self.motion));
        map.insert("temperature", json!(self.temperature));
        map.insert("timestamp", json!(self.timestamp));
        canonical_bytes(&json!(map))
    }
}

/// A pulse-backed transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique transaction ID
    pub tx_id: String,
    /// Sender's public key
    pub sender_pubkey: String,
    /// Recipient's public key
    pub recipient_pubkey: String,
    /// Amount of PULSE tokens
    pub amount: f64,
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
    /// Reference to sender's heartbeat signature (proves life)
    pub heartbeat_signature: String,
    /// Transaction signature
    #[serde(default)]
    pub signature: String,
}

impl Transaction {
    /// Canonical bytes covered by the signature (everything but `signature`).
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut map = BTreeMap::new();
        map.insert("amount", json!(self.amount));
        map.insert("heartbeat_signature", json!(self.heartbeat_signature));
        map.insert("recipient_pubkey", json!(self.recipient_pubkey));
        map.insert("sender_pubkey", json!(self.sender_pubkey));
        map.insert("timestamp", json!(self.timestamp));
        map.insert("tx_id", json!(self.tx_id));
        canonical_bytes(&json!(map))
    }
}

/// A block in the Pulse chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulseBlock {
    /// Block index (height)
    pub index: u64,
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
    /// Hash of the previous block
    pub previous_hash: String,
    /// Verified heartbeats in this block
    pub heartbeats: Vec<Heartbeat>,
    /// Transactions in this block
    pub transactions: Vec<Transaction>,
    /// Number of live participants
    pub n_live: usize,
    /// Total weighted contribution
    pub total_weight: f64,
    /// Network security metric (S = Σ W_i)
    pub security: f64,
    /// Block hash
    #[serde(default)]
    pub block_hash: String,
}

impl PulseBlock {
    /// The genesis block: index 0, sentinel parent, no participants.
    pub fn genesis() -> Self {
        let mut block = PulseBlock {
            index: 0,
            timestamp: GENESIS_TIMESTAMP,
            previous_hash: GENESIS_PREVIOUS_HASH.to_string(),
            heartbeats: vec![],
            transactions: vec![],
            n_live: 0,
            total_weight: 0.0,
            security: 0.0,
            block_hash: String::new(),
        };
        block.block_hash = block.compute_hash();
        block
    }

    /// Compute the block hash over every field except `block_hash`.
    pub fn compute_hash(&self) -> String {
        let data = json!({
            "index": self.index,
            "timestamp": self.timestamp,
            "previous_hash": self.previous_hash,
            "heartbeats": self.heartbeats,
            "transactions": self.transactions,
            "n_live": self.n_live,
            "total_weight": self.total_weight,
            "security": self.security,
        });

        content_hash(&canonical_bytes(&data))
    }

    /// True when `block_hash` matches the recomputed content hash.
    pub fn has_valid_hash(&self) -> bool {
        self.block_hash == self.compute_hash()
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0
    }

    /// Calculate fork probability P_fork = e^(-k * S).
    /// Informational only.
    pub fn fork_probability(&self, k: f64) -> f64 {
        (-k * self.security).exp()
    }
}

/// Read-only view of ledger state for a host process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkStats {
    pub chain_length: u64,
    pub total_minted: f64,
    pub blocks_created: u64,
    pub active_accounts: usize,
    pub total_security: f64,
    pub cumulative_weight: f64,
    pub current_block_reward: f64,
    pub heartbeat_pool_size: usize,
    pub pending_transactions: usize,
    pub balances: BTreeMap<String, f64>,
}

/// Account balance and state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Account {
    pub pubkey: String,
    pub balance: f64,
    pub last_heartbeat: u64,
    pub total_earned: f64,
    pub blocks_participated: u64,
}

impl Account {
    pub fn new(pubkey: impl Into<String>) -> Self {
        Self { pubkey: pubkey.into(), ..Default::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_heartbeat() -> Heartbeat {
        Heartbeat {
            timestamp: 1_700_000_000_000,
            heart_rate: 70,
            motion: Motion::default(),
            temperature: 36.5,
            device_pubkey: "02ab".to_string(),
            signature: "sig".to_string(),
        }
    }

    #[test]
    fn test_resting_weight() {
        let hb = sample_heartbeat();
        let w = hb.weight_with_continuity(&WeightParams::default(), 1.0);
        assert!((w - 0.6).abs() < 1e-12, "expected 0.6, got {}", w);
    }

    #[test]
    fn test_motion_term_is_capped() {
        let mut hb = sample_heartbeat();
        hb.motion = Motion { x: 10.0, y: 0.0, z: 0.0 };
        let params = WeightParams { alpha: 0.0, beta: 1.0, gamma: 0.0 };
        assert_eq!(hb.weight_with_continuity(&params, 1.0), MOTION_CAP);
    }

    #[test]
    fn test_signable_bytes_exclude_signature() {
        let mut hb = sample_heartbeat();
        let before = hb.signable_bytes();
        hb.signature = "different".to_string();
        assert_eq!(before, hb.signable_bytes());

        let text = String::from_utf8(before).unwrap();
        assert!(text.starts_with("{\"device_pubkey\""), "keys must be sorted: {}", text);
        assert!(!text.contains("signature"));
    }

    #[test]
    fn test_genesis_shape() {
        let genesis = PulseBlock::genesis();
        assert_eq!(genesis.index, 0);
        assert_eq!(genesis.previous_hash, GENESIS_PREVIOUS_HASH);
        assert!(genesis.heartbeats.is_empty());
        assert!(genesis.transactions.is_empty());
        assert_eq!(genesis.n_live, 0);
        assert_eq!(genesis.total_weight, 0.0);
        assert_eq!(genesis.security, 0.0);
        assert!(genesis.has_valid_hash());
        assert_eq!(genesis, PulseBlock::genesis());
    }

    #[test]
    fn test_fork_probability_decreases_with_security() {
        let mut block = PulseBlock::genesis();
        assert_eq!(block.fork_probability(0.5), 1.0);
        block.security = 1.0;
        let weak = block.fork_probability(0.5);
        block.security = 10.0;
        assert!(block.fork_probability(0.5) < weak);
    }

    #[test]
    fn test_hash_covers_security() {
        let mut block = PulseBlock::genesis();
        block.security = 1.0;
        assert!(!block.has_valid_hash());
    }

    #[test]
    fn test_block_hash_survives_serde() {
        let mut block = PulseBlock::genesis();
        block.index = 1;
        block.previous_hash = PulseBlock::genesis().block_hash;
        block.heartbeats.push(sample_heartbeat());
        block.n_live = 1;
        block.total_weight = 0.6;
        block.security = 0.6;
        block.block_hash = block.compute_hash();

        let encoded = serde_json::to_string(&block).unwrap();
        let decoded: PulseBlock = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.block_hash, block.block_hash);
        assert!(decoded.has_valid_hash());
    }
}
