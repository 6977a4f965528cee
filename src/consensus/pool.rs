//! Participant pool: the live heartbeat set and the pending-transaction set
//! for the current collection round, plus the replay guard that outlives it.

use std::collections::{BTreeMap, HashMap, HashSet};

use super::ConsensusError;
use crate::types::{Heartbeat, PulseBlock, Transaction};

/// Collection-round pools.
///
/// Holds at most one heartbeat per identity, ordered by identity so block
/// snapshots are reproducible. Pending transactions keep arrival order and
/// are unique by `tx_id`. Each admitted amount is deducted from its sender's
/// spendable balance until the round is committed.
#[derive(Debug, Default)]
pub struct ParticipantPool {
    heartbeats: BTreeMap<String, Heartbeat>,
    pending: Vec<Transaction>,
    pending_ids: HashSet<String>,
    /// Committed balance minus admitted amounts, deducted in arrival order
    /// so it matches settlement step for step.
    spendable: HashMap<String, f64>,
}

impl ParticipantPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a verified heartbeat, returning the one it superseded.
    pub fn insert_heartbeat(&mut self, hb: Heartbeat) -> Option<Heartbeat> {
        self.heartbeats.insert(hb.device_pubkey.clone(), hb)
    }

    /// The heartbeat currently pooled for `pubkey`.
    pub fn heartbeat(&self, pubkey: &str) -> Option<&Heartbeat> {
        self.heartbeats.get(pubkey)
    }

    pub fn is_pulsing(&self, pubkey: &str) -> bool {
        self.heartbeats.contains_key(pubkey)
    }

    pub fn heartbeat_count(&self) -> usize {
        self.heartbeats.len()
    }

    pub fn heartbeats(&self) -> impl Iterator<Item = &Heartbeat> {
        self.heartbeats.values()
    }

    pub fn pending(&self) -> &[Transaction] {
        &self.pending
    }

    pub fn contains_transaction(&self, tx_id: &str) -> bool {
        self.pending_ids.contains(tx_id)
    }

    /// What `pubkey` may still send this round, given its committed balance.
    pub fn available(&self, pubkey: &str, committed_balance: f64) -> f64 {
        self.spendable.get(pubkey).copied().unwrap_or(committed_balance)
    }

    /// True when `block` carries exactly this round's heartbeats and pending
    /// transactions, in pool order.
    pub fn matches(&self, block: &PulseBlock) -> bool {
        block.heartbeats.iter().eq(self.heartbeats()) && block.transactions == self.pending
    }

    /// Stateful part of transaction admission. The signature must already be
    /// verified.
    ///
    /// `committed_balance` is the sender's balance on chain; `is_committed`
    /// reports whether a transaction id is already on chain.
    pub fn admit_transaction(
        &mut self,
        tx: Transaction,
        committed_balance: f64,
        is_committed: impl Fn(&str) -> bool,
    ) -> Result<(), ConsensusError> {
        if !tx.amount.is_finite() || tx.amount < 0.0 {
            return Err(ConsensusError::InvalidAmount(tx.amount));
        }

        if self.pending_ids.contains(&tx.tx_id) || is_committed(&tx.tx_id) {
            return Err(ConsensusError::DuplicateTransaction(tx.tx_id));
        }

        let available = self.available(&tx.sender_pubkey, committed_balance);
        if available < tx.amount {
            return Err(ConsensusError::InsufficientBalance {
                available: available.max(0.0),
                requested: tx.amount,
            });
        }

        if !self.is_pulsing(&tx.sender_pubkey) {
            return Err(ConsensusError::SenderNotPulsing);
        }

        self.spendable.insert(tx.sender_pubkey.clone(), available - tx.amount);
        self.pending_ids.insert(tx.tx_id.clone());
        self.pending.push(tx);
        Ok(())
    }

    /// Start the next collection round from empty.
    pub fn clear(&mut self) {
        self.heartbeats.clear();
        self.pending.clear();
        self.pending_ids.clear();
        self.spendable.clear();
    }
}

/// Last heartbeat admitted per identity, kept across rounds.
///
/// A heartbeat is refused if it repeats that one or is older than it, so a
/// captured packet cannot be replayed into later blocks while still fresh.
#[derive(Debug, Default)]
pub struct ReplayGuard {
    last: HashMap<String, (u64, String)>,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, hb: &Heartbeat) -> Result<(), ConsensusError> {
        match self.last.get(&hb.device_pubkey) {
            Some((_, signature)) if *signature == hb.signature => {
                Err(ConsensusError::DuplicateHeartbeat)
            }
            Some((timestamp, _)) if hb.timestamp < *timestamp => {
                Err(ConsensusError::OutdatedHeartbeat { latest: *timestamp, received: hb.timestamp })
            }
            _ => Ok(()),
        }
    }

    pub fn record(&mut self, hb: &Heartbeat) {
        self.last
            .insert(hb.device_pubkey.clone(), (hb.timestamp, hb.signature.clone()));
    }

    /// Forget identities idle for more than `max_idle_ms`. Must exceed the
    /// heartbeat age limit, or a forgotten heartbeat could be replayed.
    pub fn prune(&mut self, now_ms: u64, max_idle_ms: u64) {
        self.last
            .retain(|_, (timestamp, _)| now_ms.saturating_sub(*timestamp) <= max_idle_ms);
    }

    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}
