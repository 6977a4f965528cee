//! Shared handle over the consensus engine for host processes.
//!
//! The engine is a single-writer state machine. [`NodeHandle`] guards it with
//! one `RwLock`: admissions and rounds take the write lock, queries take the
//! read lock, and a round holds the write lock from assembly through commit
//! so no admission can change the pool in between.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::consensus::{ConsensusError, ProofOfLife};
use crate::types::{Heartbeat, NetworkStats, PulseBlock, Transaction};

/// Shared engine state
pub type AppState = Arc<RwLock<ProofOfLife>>;

/// Cloneable handle to a running engine
#[derive(Clone)]
pub struct NodeHandle {
    state: AppState,
}

impl NodeHandle {
    pub fn new(pol: ProofOfLife) -> Self {
        Self { state: Arc::new(RwLock::new(pol)) }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Submit a captured heartbeat
    pub async fn submit_heartbeat(&self, hb: Heartbeat) -> Result<(), ConsensusError> {
        self.state.write().await.receive_heartbeat(hb)
    }

    /// Submit a signed transaction
    pub async fn submit_transaction(&self, tx: Transaction) -> Result<(), ConsensusError> {
        self.state.write().await.receive_transaction(tx)
    }

    /// Assemble and commit under one lock acquisition.
    pub async fn run_round(&self) -> Result<Option<PulseBlock>, ConsensusError> {
        let mut pol = self.state.write().await;
        pol.try_create_block()
    }

    /// Read-only snapshot of chain length, minted supply and balances
    pub async fn snapshot(&self) -> NetworkStats {
        self.state.read().await.get_stats()
    }

    pub async fn balance(&self, pubkey: &str) -> f64 {
        self.state.read().await.get_balance(pubkey)
    }

    pub async fn latest_block(&self) -> PulseBlock {
        self.state.read().await.latest_block().clone()
    }

    /// Run a round every `interval` until `shutdown` flips to true or the
    /// engine halts on an invariant violation.
    pub fn spawn_block_producer(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Block producer stopping");
                            return;
                        }
                        continue;
                    }
                }

                match node.run_round().await {
                    Ok(Some(block)) => debug!("Round committed block #{}", block.index),
                    Ok(None) => {}
                    Err(e) => {
                        error!("Block producer stopped: {}", e);
                        return;
                    }
                }

                // Housekeeping between rounds
                node.state.write().await.cleanup_stale_history();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{current_time_ms, ConsensusConfig};
    use crate::crypto::Keypair;
    use crate::types::Motion;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio_test::{assert_err, assert_ok};

    fn next_timestamp() -> u64 {
        static OFFSET: AtomicU64 = AtomicU64::new(0);
        current_time_ms() + OFFSET.fetch_add(1, Ordering::Relaxed)
    }

    fn heartbeat(kp: &Keypair) -> Heartbeat {
        let mut hb = Heartbeat {
            timestamp: next_timestamp(),
            heart_rate: 70,
            motion: Motion::default(),
            temperature: 36.5,
            device_pubkey: kp.public_key_hex(),
            signature: String::new(),
        };
        hb.signature = kp.sign(&hb.signable_bytes());
        hb
    }

    #[tokio::test]
    async fn test_round_through_handle() {
        let node = NodeHandle::new(ProofOfLife::new(ConsensusConfig::default()));
        let kp = Keypair::generate();

        assert!(node.run_round().await.unwrap().is_none());
        assert_ok!(node.submit_heartbeat(heartbeat(&kp)).await);

        let block = node.run_round().await.unwrap().unwrap();
        assert_eq!(block.index, 1);
        assert_eq!(node.latest_block().await, block);
        assert_eq!(node.balance(&kp.public_key_hex()).await, 100.0);

        let stats = node.snapshot().await;
        assert_eq!(stats.chain_length, 2);
        assert_eq!(stats.heartbeat_pool_size, 0);
        assert_eq!(stats.balances.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_submissions_keep_one_heartbeat_per_identity() {
        let node = NodeHandle::new(ProofOfLife::new(ConsensusConfig::default()));
        let devices: Vec<Keypair> = (0..4).map(|_| Keypair::generate()).collect();

        let mut tasks = Vec::new();
        for kp in devices.iter().cloned() {
            // Same capture time, so arrival order does not matter
            let timestamp = next_timestamp();
            for round in 0..3u16 {
                let node = node.clone();
                let kp = kp.clone();
                tasks.push(tokio::spawn(async move {
                    let mut hb = heartbeat(&kp);
                    hb.timestamp = timestamp;
                    hb.heart_rate += round;
                    hb.signature = kp.sign(&hb.signable_bytes());
                    node.submit_heartbeat(hb).await
                }));
            }
        }
        for task in tasks {
            assert_ok!(task.await.unwrap());
        }

        assert_eq!(node.snapshot().await.heartbeat_pool_size, devices.len());
    }

    #[tokio::test]
    async fn test_unsigned_transaction_rejected() {
        let node = NodeHandle::new(ProofOfLife::new(ConsensusConfig::default()));
        let tx = Transaction {
            tx_id: "tx".to_string(),
            sender_pubkey: "nobody".to_string(),
            recipient_pubkey: "someone".to_string(),
            amount: 1.0,
            timestamp: current_time_ms(),
            heartbeat_signature: String::new(),
            signature: String::new(),
        };
        assert_err!(node.submit_transaction(tx).await);
    }

    #[tokio::test]
    async fn test_block_producer_commits_and_stops() {
        let node = NodeHandle::new(ProofOfLife::new(ConsensusConfig::default()));
        let kp = Keypair::generate();
        node.submit_heartbeat(heartbeat(&kp)).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let producer = node.spawn_block_producer(Duration::from_millis(10), rx);

        let mut committed = false;
        for _ in 0..100 {
            if node.snapshot().await.chain_length > 1 {
                committed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(committed);

        tx.send(true).unwrap();
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn test_screening_keeps_history_while_producer_runs() {
        let config = ConsensusConfig { biometric_screening: true, ..Default::default() };
        let node = NodeHandle::new(ProofOfLife::new(config));
        let kp = Keypair::generate();

        let (tx, rx) = watch::channel(false);
        let producer = node.spawn_block_producer(Duration::from_millis(2), rx);

        // Identical vitals every time: flagged once enough history exists,
        // even though blocks keep clearing the pool in between.
        let mut rejected = 0;
        for _ in 0..40 {
            match node.submit_heartbeat(heartbeat(&kp)).await {
                Err(ConsensusError::BiometricValidationFailed(_)) => rejected += 1,
                other => assert_ok!(other),
            }
            tokio::time::sleep(Duration::from_millis(3)).await;
        }

        tx.send(true).unwrap();
        producer.await.unwrap();
        assert!(rejected >= 30, "only {} of 40 rejected", rejected);
        assert!(node.snapshot().await.chain_length <= 11);
    }
}
