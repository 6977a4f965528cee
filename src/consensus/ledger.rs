//! Chain and account state, and the committer that advances them.
//!
//! `Ledger::commit` is the only place balances and the chain change. It
//! checks a block completely against the current tip before touching
//! anything, so a rejected block leaves the ledger exactly as it was.

use std::collections::{HashMap, HashSet};
use thiserror::Error;

use super::liveness::LivenessModel;
use crate::types::{Account, PulseBlock, GENESIS_PREVIOUS_HASH};

/// Relative tolerance for recomputed weight totals.
pub const WEIGHT_TOLERANCE: f64 = 1e-9;

/// Broken chain or ledger invariant. Fatal for the node.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChainError {
    #[error("Malformed genesis block")]
    BadGenesis,
    #[error("Block index {found} does not extend chain of length {expected}")]
    IndexMismatch { expected: u64, found: u64 },
    #[error("Block #{index} previous_hash does not match parent hash")]
    PreviousHashMismatch { index: u64 },
    #[error("Block #{index} hash does not match its contents")]
    HashMismatch { index: u64 },
    #[error("Block #{index} reports {reported} live participants but carries {actual}")]
    ParticipantCountMismatch { index: u64, reported: usize, actual: usize },
    #[error("Block #{index} carries more than one heartbeat for {pubkey}")]
    DuplicateParticipant { index: u64, pubkey: String },
    #[error("Block #{index} carries content that was never admitted to the pool")]
    UnadmittedContent { index: u64 },
    #[error("Block #{index} gives {pubkey} negative or non-finite weight {weight}")]
    NegativeWeight { index: u64, pubkey: String, weight: f64 },
    #[error("Block #{index} weight {reported} disagrees with recomputed {recomputed}")]
    WeightMismatch { index: u64, reported: f64, recomputed: f64 },
    #[error("Transaction {tx_id} settles without a live sender heartbeat")]
    SenderNotLive { tx_id: String },
    #[error("Transaction {tx_id} has invalid amount {amount}")]
    InvalidAmount { tx_id: String, amount: f64 },
    #[error("Transaction {tx_id} is already on chain")]
    DuplicateTransaction { tx_id: String },
    #[error("Settling {tx_id} would leave {pubkey} with balance {balance}")]
    NegativeBalance { tx_id: String, pubkey: String, balance: f64 },
}

/// What a commit changed
#[derive(Debug, Clone, Default)]
pub struct CommitReceipt {
    pub index: u64,
    pub block_reward: f64,
    /// Per-identity reward credited, in block heartbeat order
    pub rewards: Vec<(String, f64)>,
    pub minted: f64,
    pub settled: usize,
    /// Accounts whose state changed
    pub touched: Vec<String>,
}

/// Append-only chain plus identity → account mapping
#[derive(Debug, Clone)]
pub struct Ledger {
    chain: Vec<PulseBlock>,
    accounts: HashMap<String, Account>,
    committed_tx_ids: HashSet<String>,
    total_minted: f64,
    blocks_created: u64,
    cumulative_weight: f64,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    /// A ledger holding only the genesis block.
    pub fn new() -> Self {
        Self {
            chain: vec![PulseBlock::genesis()],
            accounts: HashMap::new(),
            committed_tx_ids: HashSet::new(),
            total_minted: 0.0,
            blocks_created: 0,
            cumulative_weight: 0.0,
        }
    }

    /// Rebuild from a stored chain and account table. The chain is verified
    /// first; counters are derived from it.
    pub fn restore(
        chain: Vec<PulseBlock>,
        accounts: impl IntoIterator<Item = Account>,
    ) -> Result<Self, ChainError> {
        verify_chain(&chain)?;

        let accounts: HashMap<String, Account> = accounts
            .into_iter()
            .map(|a| (a.pubkey.clone(), a))
            .collect();
        let committed_tx_ids = chain
            .iter()
            .flat_map(|b| b.transactions.iter().map(|tx| tx.tx_id.clone()))
            .collect();
        let total_minted = accounts.values().map(|a| a.total_earned).sum();
        let cumulative_weight = chain.iter().map(|b| b.security).sum();
        let blocks_created = chain.len().saturating_sub(1) as u64;

        Ok(Self {
            chain,
            accounts,
            committed_tx_ids,
            total_minted,
            blocks_created,
            cumulative_weight,
        })
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Index of the latest block.
    pub fn height(&self) -> u64 {
        self.tip().index
    }

    pub fn tip(&self) -> &PulseBlock {
        // The chain always holds at least genesis.
        &self.chain[self.chain.len() - 1]
    }

    pub fn blocks(&self) -> &[PulseBlock] {
        &self.chain
    }

    pub fn block(&self, index: u64) -> Option<&PulseBlock> {
        self.chain.get(usize::try_from(index).ok()?)
    }

    pub fn balance(&self, pubkey: &str) -> f64 {
        self.accounts.get(pubkey).map(|a| a.balance).unwrap_or(0.0)
    }

    pub fn account(&self, pubkey: &str) -> Option<&Account> {
        self.accounts.get(pubkey)
    }

    pub fn accounts(&self) -> &HashMap<String, Account> {
        &self.accounts
    }

    pub fn is_committed(&self, tx_id: &str) -> bool {
        self.committed_tx_ids.contains(tx_id)
    }

    pub fn total_minted(&self) -> f64 {
        self.total_minted
    }

    pub fn blocks_created(&self) -> u64 {
        self.blocks_created
    }

    /// Sum of all block security values
    pub fn cumulative_weight(&self) -> f64 {
        self.cumulative_weight
    }

    /// Append `block`, pay `block_reward` out by weight share and settle its
    /// transactions in order.
    pub fn commit(
        &mut self,
        block: PulseBlock,
        liveness: &LivenessModel,
        block_reward: f64,
    ) -> Result<CommitReceipt, ChainError> {
        self.check_extends_tip(&block)?;

        let index = block.index;
        let mut seen = HashSet::new();
        for hb in &block.heartbeats {
            if !seen.insert(hb.device_pubkey.as_str()) {
                return Err(ChainError::DuplicateParticipant {
                    index,
                    pubkey: hb.device_pubkey.clone(),
                });
            }
        }

        let weights: Vec<f64> = block.heartbeats.iter().map(|hb| liveness.weight(hb)).collect();
        if let Some((hb, &weight)) = block
            .heartbeats
            .iter()
            .zip(&weights)
            .find(|(_, w)| !w.is_finite() || **w < 0.0)
        {
            return Err(ChainError::NegativeWeight {
                index,
                pubkey: hb.device_pubkey.clone(),
                weight,
            });
        }
        let recomputed: f64 = weights.iter().sum();
        let scale = block.total_weight.abs().max(1.0);
        if (recomputed - block.total_weight).abs() > WEIGHT_TOLERANCE * scale
            || (block.security - block.total_weight).abs() > WEIGHT_TOLERANCE * scale
        {
            return Err(ChainError::WeightMismatch {
                index,
                reported: block.total_weight,
                recomputed,
            });
        }

        let mut working: HashMap<String, Account> = HashMap::new();
        let mut receipt = CommitReceipt { index, block_reward, ..Default::default() };

        if block.total_weight > 0.0 {
            for (hb, w_i) in block.heartbeats.iter().zip(&weights) {
                let reward = (w_i / block.total_weight) * block_reward;
                let account = self.working_account(&mut working, &hb.device_pubkey);
                account.balance += reward;
                account.total_earned += reward;
                account.last_heartbeat = account.last_heartbeat.max(hb.timestamp);
                account.blocks_participated += 1;

                receipt.minted += reward;
                receipt.rewards.push((hb.device_pubkey.clone(), reward));
            }
        }

        let mut block_tx_ids = HashSet::new();
        for tx in &block.transactions {
            if !tx.amount.is_finite() || tx.amount < 0.0 {
                return Err(ChainError::InvalidAmount { tx_id: tx.tx_id.clone(), amount: tx.amount });
            }
            if self.committed_tx_ids.contains(&tx.tx_id) || !block_tx_ids.insert(tx.tx_id.as_str()) {
                return Err(ChainError::DuplicateTransaction { tx_id: tx.tx_id.clone() });
            }
            if !seen.contains(tx.sender_pubkey.as_str()) {
                return Err(ChainError::SenderNotLive { tx_id: tx.tx_id.clone() });
            }

            let sender = self.working_account(&mut working, &tx.sender_pubkey);
            sender.balance -= tx.amount;
            if sender.balance < 0.0 {
                return Err(ChainError::NegativeBalance {
                    tx_id: tx.tx_id.clone(),
                    pubkey: tx.sender_pubkey.clone(),
                    balance: sender.balance,
                });
            }

            let recipient = self.working_account(&mut working, &tx.recipient_pubkey);
            recipient.balance += tx.amount;
            receipt.settled += 1;
        }

        // Every check passed; apply.
        receipt.touched = working.keys().cloned().collect();
        receipt.touched.sort();
        self.accounts.extend(working);
        self.committed_tx_ids
            .extend(block.transactions.iter().map(|tx| tx.tx_id.clone()));
        self.total_minted += receipt.minted;
        self.cumulative_weight += block.security;
        self.blocks_created += 1;
        self.chain.push(block);

        Ok(receipt)
    }

    fn check_extends_tip(&self, block: &PulseBlock) -> Result<(), ChainError> {
        let expected = self.chain.len() as u64;
        if block.index != expected {
            return Err(ChainError::IndexMismatch { expected, found: block.index });
        }
        if block.previous_hash != self.tip().block_hash {
            return Err(ChainError::PreviousHashMismatch { index: block.index });
        }
        check_contents(block)
    }

    fn working_account<'a>(
        &self,
        working: &'a mut HashMap<String, Account>,
        pubkey: &str,
    ) -> &'a mut Account {
        working.entry(pubkey.to_string()).or_insert_with(|| {
            self.accounts
                .get(pubkey)
                .cloned()
                .unwrap_or_else(|| Account::new(pubkey))
        })
    }
}

fn check_contents(block: &PulseBlock) -> Result<(), ChainError> {
    if !block.has_valid_hash() {
        return Err(ChainError::HashMismatch { index: block.index });
    }
    if block.n_live != block.heartbeats.len() {
        return Err(ChainError::ParticipantCountMismatch {
            index: block.index,
            reported: block.n_live,
            actual: block.heartbeats.len(),
        });
    }
    Ok(())
}

/// Check genesis shape, index continuity, parent links and every block hash.
pub fn verify_chain(chain: &[PulseBlock]) -> Result<(), ChainError> {
    let genesis = chain.first().ok_or(ChainError::BadGenesis)?;
    let genesis_ok = genesis.index == 0
        && genesis.previous_hash == GENESIS_PREVIOUS_HASH
        && genesis.heartbeats.is_empty()
        && genesis.transactions.is_empty()
        && genesis.n_live == 0
        && genesis.total_weight == 0.0
        && genesis.security == 0.0
        && genesis.has_valid_hash();
    if !genesis_ok {
        return Err(ChainError::BadGenesis);
    }

    for (position, pair) in chain.windows(2).enumerate() {
        let (parent, block) = (&pair[0], &pair[1]);
        let expected = position as u64 + 1;
        if block.index != expected {
            return Err(ChainError::IndexMismatch { expected, found: block.index });
        }
        if block.previous_hash != parent.block_hash {
            return Err(ChainError::PreviousHashMismatch { index: block.index });
        }
        check_contents(block)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::assembler::assemble;
    use crate::consensus::liveness::FixedContinuity;
    use crate::consensus::pool::ParticipantPool;
    use crate::types::{Heartbeat, Motion, Transaction, WeightParams};

    fn heartbeat(pubkey: &str, heart_rate: u16) -> Heartbeat {
        Heartbeat {
            timestamp: 1_000,
            heart_rate,
            motion: Motion { x: 0.1, y: 0.2, z: 0.0 },
            temperature: 36.5,
            device_pubkey: pubkey.to_string(),
            signature: String::new(),
        }
    }

    fn transfer(tx_id: &str, from: &str, to: &str, amount: f64) -> Transaction {
        Transaction {
            tx_id: tx_id.to_string(),
            sender_pubkey: from.to_string(),
            recipient_pubkey: to.to_string(),
            amount,
            timestamp: 1_000,
            heartbeat_signature: String::new(),
            signature: String::new(),
        }
    }

    fn block_for(ledger: &Ledger, pool: &ParticipantPool) -> PulseBlock {
        assemble(pool, ledger, &LivenessModel::default(), 1, 2_000).unwrap()
    }

    fn rehash(mut block: PulseBlock) -> PulseBlock {
        block.block_hash = block.compute_hash();
        block
    }

    #[test]
    fn test_rewards_sum_to_block_reward() {
        let mut ledger = Ledger::new();
        let mut pool = ParticipantPool::new();
        for (key, hr) in [("a", 61), ("b", 97), ("c", 143)] {
            pool.insert_heartbeat(heartbeat(key, hr));
        }

        let block = block_for(&ledger, &pool);
        let receipt = ledger.commit(block, &LivenessModel::default(), 100.0).unwrap();

        let credited: f64 = receipt.rewards.iter().map(|(_, r)| r).sum();
        assert!((credited - 100.0).abs() <= 1e-9 * 100.0);
        assert!((ledger.total_minted() - 100.0).abs() <= 1e-9 * 100.0);
        assert_eq!(ledger.blocks_created(), 1);
        assert!(ledger.balance("c") > ledger.balance("a"));
    }

    #[test]
    fn test_settlement_in_block_order() {
        let mut ledger = Ledger::new();
        let liveness = LivenessModel::default();
        let mut pool = ParticipantPool::new();
        pool.insert_heartbeat(heartbeat("a", 70));
        ledger.commit(block_for(&ledger, &pool), &liveness, 50.0).unwrap();
        assert_eq!(ledger.balance("a"), 50.0);

        let mut block = block_for(&ledger, &pool);
        block.transactions = vec![transfer("t1", "a", "b", 10.0), transfer("t2", "a", "b", 5.0)];
        let block = rehash(block);
        ledger.commit(block, &liveness, 0.0).unwrap();

        assert_eq!(ledger.balance("a"), 35.0);
        assert_eq!(ledger.balance("b"), 15.0);
        assert!(ledger.is_committed("t1"));
        assert!(verify_chain(ledger.blocks()).is_ok());
    }

    #[test]
    fn test_stale_block_rejected_without_mutation() {
        let mut ledger = Ledger::new();
        let liveness = LivenessModel::default();
        let mut pool = ParticipantPool::new();
        pool.insert_heartbeat(heartbeat("a", 70));

        let first = block_for(&ledger, &pool);
        let stale = first.clone();
        ledger.commit(first, &liveness, 100.0).unwrap();

        let err = ledger.commit(stale, &liveness, 100.0).unwrap_err();
        assert_eq!(err, ChainError::IndexMismatch { expected: 2, found: 1 });
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.balance("a"), 100.0);
    }

    #[test]
    fn test_tampered_hash_rejected() {
        let mut ledger = Ledger::new();
        let mut pool = ParticipantPool::new();
        pool.insert_heartbeat(heartbeat("a", 70));

        let mut block = block_for(&ledger, &pool);
        block.timestamp += 1;
        assert_eq!(
            ledger.commit(block, &LivenessModel::default(), 100.0).unwrap_err(),
            ChainError::HashMismatch { index: 1 }
        );
    }

    #[test]
    fn test_wrong_parent_rejected() {
        let mut ledger = Ledger::new();
        let mut pool = ParticipantPool::new();
        pool.insert_heartbeat(heartbeat("a", 70));

        let mut block = block_for(&ledger, &pool);
        block.previous_hash = "ff".repeat(32);
        let block = rehash(block);
        assert_eq!(
            ledger.commit(block, &LivenessModel::default(), 100.0).unwrap_err(),
            ChainError::PreviousHashMismatch { index: 1 }
        );
    }

    #[test]
    fn test_inflated_weight_rejected() {
        let mut ledger = Ledger::new();
        let mut pool = ParticipantPool::new();
        pool.insert_heartbeat(heartbeat("a", 70));

        let mut block = block_for(&ledger, &pool);
        block.total_weight *= 2.0;
        block.security = block.total_weight;
        let block = rehash(block);
        assert!(matches!(
            ledger.commit(block, &LivenessModel::default(), 100.0),
            Err(ChainError::WeightMismatch { index: 1, .. })
        ));
    }

    #[test]
    fn test_overdraft_rejected_atomically() {
        let mut ledger = Ledger::new();
        let liveness = LivenessModel::default();
        let mut pool = ParticipantPool::new();
        pool.insert_heartbeat(heartbeat("a", 70));
        ledger.commit(block_for(&ledger, &pool), &liveness, 10.0).unwrap();

        let mut block = block_for(&ledger, &pool);
        block.transactions = vec![transfer("t1", "a", "b", 8.0), transfer("t2", "a", "b", 8.0)];
        let block = rehash(block);

        assert!(matches!(
            ledger.commit(block, &liveness, 0.0),
            Err(ChainError::NegativeBalance { .. })
        ));
        assert_eq!(ledger.balance("a"), 10.0);
        assert_eq!(ledger.balance("b"), 0.0);
        assert!(!ledger.is_committed("t1"));
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_negative_weight_rejected() {
        let mut ledger = Ledger::new();
        let mut pool = ParticipantPool::new();
        pool.insert_heartbeat(heartbeat("a", 70));
        pool.insert_heartbeat(heartbeat("b", 180));

        let liveness = LivenessModel::new(
            WeightParams { alpha: -1.0, beta: 0.0, gamma: 2.0 },
            Box::new(FixedContinuity(1.0)),
        );
        let block = assemble(&pool, &ledger, &liveness, 1, 2_000).unwrap();
        assert!(matches!(
            ledger.commit(block, &liveness, 100.0),
            Err(ChainError::NegativeWeight { index: 1, ref pubkey, .. }) if pubkey == "b"
        ));
        assert!(ledger.accounts().is_empty());
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_rounding_overdraft_rejected() {
        let mut ledger = Ledger::new();
        let liveness = LivenessModel::default();
        let mut pool = ParticipantPool::new();
        pool.insert_heartbeat(heartbeat("a", 70));
        ledger.commit(block_for(&ledger, &pool), &liveness, 0.3).unwrap();

        // Just under zero after settlement; nothing is rounded back up.
        let mut block = block_for(&ledger, &pool);
        block.transactions = vec![transfer("t1", "a", "b", 0.1), transfer("t2", "a", "b", 0.2)];
        let block = rehash(block);
        assert!(matches!(
            ledger.commit(block, &liveness, 0.0),
            Err(ChainError::NegativeBalance { .. })
        ));
        assert_eq!(ledger.balance("b"), 0.0);
    }

    #[test]
    fn test_settlement_requires_live_sender() {
        let mut ledger = Ledger::new();
        let mut pool = ParticipantPool::new();
        pool.insert_heartbeat(heartbeat("a", 70));

        let mut block = block_for(&ledger, &pool);
        block.transactions = vec![transfer("t1", "z", "b", 0.0)];
        let block = rehash(block);
        assert!(matches!(
            ledger.commit(block, &LivenessModel::default(), 100.0),
            Err(ChainError::SenderNotLive { .. })
        ));
    }

    #[test]
    fn test_verify_chain_detects_broken_link() {
        let mut ledger = Ledger::new();
        let liveness = LivenessModel::default();
        let mut pool = ParticipantPool::new();
        pool.insert_heartbeat(heartbeat("a", 70));
        for _ in 0..3 {
            ledger.commit(block_for(&ledger, &pool), &liveness, 100.0).unwrap();
        }
        assert!(verify_chain(ledger.blocks()).is_ok());

        let mut blocks = ledger.blocks().to_vec();
        blocks[2].heartbeats.clear();
        blocks[2].n_live = 0;
        blocks[2] = rehash(blocks[2].clone());
        assert_eq!(
            verify_chain(&blocks).unwrap_err(),
            ChainError::PreviousHashMismatch { index: 3 }
        );

        assert_eq!(verify_chain(&[]).unwrap_err(), ChainError::BadGenesis);
    }

    #[test]
    fn test_restore_derives_counters() {
        let mut ledger = Ledger::new();
        let liveness = LivenessModel::default();
        let mut pool = ParticipantPool::new();
        pool.insert_heartbeat(heartbeat("a", 70));
        ledger.commit(block_for(&ledger, &pool), &liveness, 100.0).unwrap();

        let restored = Ledger::restore(
            ledger.blocks().to_vec(),
            ledger.accounts().values().cloned(),
        )
        .unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.blocks_created(), 1);
        assert_eq!(restored.total_minted(), ledger.total_minted());
        assert_eq!(restored.cumulative_weight(), ledger.cumulative_weight());
        assert_eq!(restored.balance("a"), 100.0);
    }
}
