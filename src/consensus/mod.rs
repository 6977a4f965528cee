//! Proof-of-Life consensus engine for the Pulse ledger.
//!
//! [`ProofOfLife`] owns the participant pool, the liveness model and the
//! ledger, and runs the collection-round state machine:
//! heartbeats and transactions are admitted into the pool, [`ProofOfLife::assemble`]
//! previews a block once enough identities are live, and
//! [`ProofOfLife::commit`] appends it, pays rewards, settles transfers and
//! clears the pool.

pub mod assembler;
pub mod biometrics;
pub mod ledger;
pub mod liveness;
pub mod pool;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::crypto::verify_signature;
use crate::storage::{Storage, StorageError};
use crate::types::{Account, Heartbeat, NetworkStats, PulseBlock, Transaction, WeightParams};
use biometrics::BiometricScreen;
use ledger::{ChainError, CommitReceipt, Ledger};
use liveness::{short_key, ContinuityConfig, LivenessModel};
use pool::{ParticipantPool, ReplayGuard};

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("Invalid heartbeat signature")]
    InvalidHeartbeatSignature,
    #[error("Stale heartbeat (too old)")]
    StaleHeartbeat,
    #[error("Invalid heart rate: {0}")]
    InvalidHeartRate(u16),
    #[error("Non-finite sensor reading")]
    MalformedReading,
    #[error("Duplicate heartbeat")]
    DuplicateHeartbeat,
    #[error("Heartbeat at {received} predates last admitted at {latest}")]
    OutdatedHeartbeat { latest: u64, received: u64 },
    #[error("Biometric validation failed: {0}")]
    BiometricValidationFailed(String),
    #[error("Invalid transaction signature")]
    InvalidTransactionSignature,
    #[error("Invalid transaction amount: {0}")]
    InvalidAmount(f64),
    #[error("Duplicate transaction: {0}")]
    DuplicateTransaction(String),
    #[error("Insufficient balance: {available} available, {requested} requested")]
    InsufficientBalance { available: f64, requested: f64 },
    #[error("Sender not pulsing")]
    SenderNotPulsing,
    #[error("Chain invariant violated: {0}")]
    InvariantViolation(#[from] ChainError),
    #[error("Engine halted after invariant violation: {0}")]
    Halted(ChainError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConsensusError {
    /// Admission rejections are reported to the submitter; the node carries on.
    pub fn is_rejection(&self) -> bool {
        !matches!(
            self,
            ConsensusError::InvariantViolation(_)
                | ConsensusError::Halted(_)
                | ConsensusError::Storage(_)
                | ConsensusError::InvalidConfig(_)
        )
    }
}

/// Configuration for the consensus engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Minimum number of live participants to create a block
    pub n_threshold: usize,
    /// Block interval in milliseconds (used by the round trigger)
    pub block_interval_ms: u64,
    /// Base reward per block (before halving)
    pub reward_per_block: f64,
    /// Reward halves every N blocks; 0 disables halving
    pub halving_interval: u64,
    /// Minimum reward per block (floor)
    pub min_reward_per_block: f64,
    /// Maximum heartbeat age in milliseconds
    pub max_heartbeat_age_ms: u64,
    /// Lowest admissible heart rate (inclusive)
    pub min_heart_rate: u16,
    /// Highest admissible heart rate (inclusive)
    pub max_heart_rate: u16,
    /// Fork probability constant (k)
    pub fork_constant: f64,
    /// Weight coefficients α, β, γ
    pub weights: WeightParams,
    /// Continuity strategy
    pub continuity: ContinuityConfig,
    /// Screen heartbeat streams for physiologically implausible patterns
    pub biometric_screening: bool,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            n_threshold: 1,
            block_interval_ms: 5000,
            reward_per_block: 100.0,
            // Halving every 210,000 blocks (~12 days at 5s intervals)
            halving_interval: 210_000,
            min_reward_per_block: 0.01,
            max_heartbeat_age_ms: 30_000,
            min_heart_rate: 30,
            max_heart_rate: 220,
            fork_constant: 0.5,
            weights: WeightParams::default(),
            continuity: ContinuityConfig::default(),
            biometric_screening: false,
        }
    }
}

impl ConsensusConfig {
    /// Block reward at a given height, applying halvings.
    /// R(h) = reward_per_block / 2^(h / halving_interval), floored at min_reward_per_block.
    pub fn reward_at_height(&self, block_height: u64) -> f64 {
        if self.halving_interval == 0 {
            return self.reward_per_block;
        }
        let halvings = block_height / self.halving_interval;
        // After 64 halvings the reward is effectively 0
        if halvings >= 64 {
            return self.min_reward_per_block;
        }
        let reward = self.reward_per_block / (2u64.pow(halvings as u32) as f64);
        reward.max(self.min_reward_per_block)
    }

    /// Reject parameters that could mint negative rewards or never admit a
    /// heartbeat.
    pub fn validate(&self) -> Result<(), ConsensusError> {
        let WeightParams { alpha, beta, gamma } = self.weights;
        if [alpha, beta, gamma].iter().any(|c| !c.is_finite() || *c < 0.0) {
            return Err(ConsensusError::InvalidConfig(format!(
                "weight coefficients must be finite and non-negative, got α={} β={} γ={}",
                alpha, beta, gamma
            )));
        }
        if let ContinuityConfig::Fixed { value } = self.continuity {
            if !value.is_finite() || value < 0.0 {
                return Err(ConsensusError::InvalidConfig(format!(
                    "fixed continuity must be finite and non-negative, got {}", value
                )));
            }
        }
        if !self.reward_per_block.is_finite() || self.reward_per_block < 0.0
            || !self.min_reward_per_block.is_finite() || self.min_reward_per_block < 0.0
        {
            return Err(ConsensusError::InvalidConfig("block rewards must be finite and non-negative".into()));
        }
        if self.min_heart_rate > self.max_heart_rate {
            return Err(ConsensusError::InvalidConfig(format!(
                "heart rate range {}..={} is empty", self.min_heart_rate, self.max_heart_rate
            )));
        }
        Ok(())
    }
}

/// The Proof-of-Life consensus engine
pub struct ProofOfLife {
    config: ConsensusConfig,
    ledger: Ledger,
    pool: ParticipantPool,
    liveness: LivenessModel,
    biometrics: BiometricScreen,
    /// Last admitted heartbeat per identity; survives pool clears
    replay: ReplayGuard,
    /// Set once an invariant violation is detected; blocks further commits
    halted: Option<ChainError>,
    /// Persistent storage (optional; None means in-memory only)
    storage: Option<Arc<Storage>>,
}

impl ProofOfLife {
    /// Create a new consensus engine with genesis block (in-memory only)
    pub fn new(config: ConsensusConfig) -> Self {
        let ledger = Ledger::new();
        info!("🌱 Genesis block: {}...", short_key(&ledger.tip().block_hash));
        Self::from_parts(config, ledger, None)
    }

    /// Create a new consensus engine with persistent storage.
    /// Loads and verifies an existing chain if present, otherwise creates genesis.
    pub fn with_storage(config: ConsensusConfig, storage: Arc<Storage>) -> Result<Self, ConsensusError> {
        config.validate()?;
        let stored_blocks = storage.load_all_blocks()?;

        if stored_blocks.is_empty() {
            let ledger = Ledger::new();
            info!("🌱 Genesis block: {}...", short_key(&ledger.tip().block_hash));
            storage.save_block(ledger.tip())?;
            storage.flush()?;
            return Ok(Self::from_parts(config, ledger, Some(storage)));
        }

        let stored_accounts = storage.load_all_accounts()?;
        let ledger = Ledger::restore(stored_blocks, stored_accounts)?;

        info!("💾 Loaded chain from storage:");
        info!("   Chain height: {}", ledger.height());
        info!("   Accounts: {}", ledger.accounts().len());
        info!("   Total minted: {:.4} PULSE", ledger.total_minted());
        info!("   Cumulative weight: {:.4}", ledger.cumulative_weight());

        Ok(Self::from_parts(config, ledger, Some(storage)))
    }

    fn from_parts(config: ConsensusConfig, ledger: Ledger, storage: Option<Arc<Storage>>) -> Self {
        let liveness = LivenessModel::from_config(&config);
        Self {
            config,
            ledger,
            pool: ParticipantPool::new(),
            liveness,
            biometrics: BiometricScreen::new(),
            replay: ReplayGuard::new(),
            halted: None,
            storage,
        }
    }

    /// Swap the continuity strategy (e.g. for a custom gap tracker).
    pub fn with_liveness_model(mut self, liveness: LivenessModel) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Admission predicate for a heartbeat at time `now_ms`. No side effects.
    pub fn verify_heartbeat(&self, hb: &Heartbeat, now_ms: u64) -> Result<(), ConsensusError> {
        liveness::verify_heartbeat(hb, now_ms, &self.config)?;

        self.replay.check(hb)?;

        if self.config.biometric_screening {
            let result = self.biometrics.assess(hb);
            if !result.is_valid {
                let reason = result.reason.unwrap_or_else(|| "Unknown".to_string());
                return Err(ConsensusError::BiometricValidationFailed(reason));
            }
        }

        Ok(())
    }

    /// Verify and add a heartbeat to the pool
    pub fn receive_heartbeat(&mut self, hb: Heartbeat) -> Result<(), ConsensusError> {
        self.receive_heartbeat_at(hb, current_time_ms())
    }

    /// [`receive_heartbeat`](Self::receive_heartbeat) against an explicit clock.
    pub fn receive_heartbeat_at(&mut self, hb: Heartbeat, now_ms: u64) -> Result<(), ConsensusError> {
        if let Err(e) = self.verify_heartbeat(&hb, now_ms) {
            warn!("❌ Heartbeat from {}... rejected: {}", short_key(&hb.device_pubkey), e);
            return Err(e);
        }

        self.replay.record(&hb);
        self.liveness.observe(&hb);
        if self.config.biometric_screening {
            self.biometrics.record(&hb);
        }

        debug!("✅ Heartbeat verified: {}... HR={} W={:.3}",
            short_key(&hb.device_pubkey), hb.heart_rate, self.liveness.weight(&hb));

        if self.pool.insert_heartbeat(hb).is_some() {
            debug!("   superseded previous heartbeat");
        }

        Ok(())
    }

    /// Verify and add a transaction to the pending set
    pub fn receive_transaction(&mut self, tx: Transaction) -> Result<(), ConsensusError> {
        if !verify_signature(&tx.sender_pubkey, &tx.signable_bytes(), &tx.signature) {
            warn!("❌ Invalid transaction signature from {}...", short_key(&tx.sender_pubkey));
            return Err(ConsensusError::InvalidTransactionSignature);
        }

        let summary = format!("{}... → {}... ({} PULSE)",
            short_key(&tx.sender_pubkey), short_key(&tx.recipient_pubkey), tx.amount);
        let balance = self.ledger.balance(&tx.sender_pubkey);
        let ledger = &self.ledger;

        match self.pool.admit_transaction(tx, balance, |id| ledger.is_committed(id)) {
            Ok(()) => {
                debug!("📨 Transaction queued: {}", summary);
                Ok(())
            }
            Err(e) => {
                warn!("❌ Transaction rejected {}: {}", summary, e);
                Err(e)
            }
        }
    }

    /// Preview the next block from the current pool.
    ///
    /// `None` means fewer than `n_threshold` identities are live; try again
    /// after more heartbeats arrive.
    pub fn assemble(&self) -> Option<PulseBlock> {
        self.assemble_at(current_time_ms())
    }

    pub fn assemble_at(&self, now_ms: u64) -> Option<PulseBlock> {
        let block = assembler::assemble(
            &self.pool,
            &self.ledger,
            &self.liveness,
            self.config.n_threshold,
            now_ms,
        );

        if block.is_none() {
            debug!("⏳ Waiting for heartbeats: {}/{}",
                self.pool.heartbeat_count(), self.config.n_threshold);
        }
        block
    }

    /// Append `block`, distribute rewards, settle transactions and clear
    /// the pools.
    ///
    /// Any invariant violation halts the engine: this and every later commit
    /// fail until the node is rebuilt from a verified chain.
    pub fn commit(&mut self, block: PulseBlock) -> Result<CommitReceipt, ConsensusError> {
        if let Some(reason) = &self.halted {
            return Err(ConsensusError::Halted(reason.clone()));
        }

        let block_reward = self.config.reward_at_height(block.index);
        let summary = block.clone();

        // Signatures were checked at admission, so the block must be the pool.
        let checked = if self.pool.matches(&block) {
            self.ledger.commit(block, &self.liveness, block_reward)
        } else {
            Err(ChainError::UnadmittedContent { index: block.index })
        };

        let receipt = match checked {
            Ok(receipt) => receipt,
            Err(e) => {
                error!("🛑 Refusing block #{}: {}. Halting commits.", summary.index, e);
                self.halted = Some(e.clone());
                return Err(ConsensusError::InvariantViolation(e));
            }
        };

        info!("💓 PULSE BLOCK #{}", summary.index);
        info!("   Hash: {}...", short_key(&summary.block_hash));
        info!("   Live participants: {}", summary.n_live);
        info!("   Total weight: {:.4}", summary.total_weight);
        info!("   Security (S): {:.4}", summary.security);
        info!("   Fork probability: {:.6}", summary.fork_probability(self.config.fork_constant));
        info!("   Block reward: {:.4} PULSE", block_reward);
        for (pubkey, reward) in &receipt.rewards {
            info!("   💰 {}... earned {:.4} PULSE", short_key(pubkey), reward);
        }
        for tx in &summary.transactions {
            info!("   📤 TX: {}... → {}... ({} PULSE)",
                short_key(&tx.sender_pubkey), short_key(&tx.recipient_pubkey), tx.amount);
        }

        self.persist_block(&summary, &receipt.touched);
        self.pool.clear();

        Ok(receipt)
    }

    /// Run one round: assemble and, if the threshold is met, commit.
    pub fn try_create_block(&mut self) -> Result<Option<PulseBlock>, ConsensusError> {
        let Some(block) = self.assemble() else {
            return Ok(None);
        };
        self.commit(block.clone())?;
        Ok(Some(block))
    }

    /// Persist a block and its affected accounts. The in-memory chain is
    /// authoritative, so failures are logged only.
    fn persist_block(&self, block: &PulseBlock, touched: &[String]) {
        let Some(storage) = &self.storage else {
            return;
        };

        let accounts: Vec<&Account> = touched.iter().filter_map(|k| self.ledger.account(k)).collect();
        if let Err(e) = storage.save_commit(block, accounts) {
            error!("❌ Failed to persist block #{}: {}", block.index, e);
            return;
        }
        if let Err(e) = storage.flush() {
            error!("❌ Failed to flush storage: {}", e);
        } else {
            debug!("💾 Block #{} persisted to disk", block.index);
        }
    }

    /// Get current chain height
    pub fn chain_height(&self) -> u64 {
        self.ledger.height()
    }

    pub fn latest_block(&self) -> &PulseBlock {
        self.ledger.tip()
    }

    pub fn blocks(&self) -> &[PulseBlock] {
        self.ledger.blocks()
    }

    pub fn get_block_by_index(&self, index: u64) -> Option<&PulseBlock> {
        self.ledger.block(index)
    }

    pub fn get_balance(&self, pubkey: &str) -> f64 {
        self.ledger.balance(pubkey)
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn heartbeat_pool_size(&self) -> usize {
        self.pool.heartbeat_count()
    }

    pub fn pending_transactions(&self) -> &[Transaction] {
        self.pool.pending()
    }

    /// Check if a pubkey is currently pulsing
    pub fn is_pulsing(&self, pubkey: &str) -> bool {
        self.pool.is_pulsing(pubkey)
    }

    pub fn halted(&self) -> Option<&ChainError> {
        self.halted.as_ref()
    }

    /// Get network stats
    pub fn get_stats(&self) -> NetworkStats {
        let height = self.chain_height();
        NetworkStats {
            chain_length: self.ledger.len() as u64,
            total_minted: self.ledger.total_minted(),
            blocks_created: self.ledger.blocks_created(),
            active_accounts: self.ledger.accounts().len(),
            total_security: self.ledger.blocks().iter().map(|b| b.security).sum(),
            cumulative_weight: self.ledger.cumulative_weight(),
            current_block_reward: self.config.reward_at_height(height + 1),
            heartbeat_pool_size: self.pool.heartbeat_count(),
            pending_transactions: self.pool.pending().len(),
            balances: self
                .ledger
                .accounts()
                .iter()
                .map(|(k, a)| (k.clone(), a.balance))
                .collect(),
        }
    }

    /// Forget continuity, replay and screening history for identities that
    /// have not pulsed within twice the heartbeat age limit.
    pub fn cleanup_stale_history(&mut self) {
        self.cleanup_stale_history_at(current_time_ms());
    }

    pub fn cleanup_stale_history_at(&mut self, now_ms: u64) {
        let max_idle_ms = self.config.max_heartbeat_age_ms.saturating_mul(2);
        self.liveness.prune(now_ms, max_idle_ms);
        self.replay.prune(now_ms, max_idle_ms);
        self.biometrics.prune(now_ms, max_idle_ms);
    }
}

/// Get current time in milliseconds
pub fn current_time_ms() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}
