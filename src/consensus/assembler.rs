//! Block assembly: turns the current pool into a candidate block.
//!
//! Assembly is a preview. It reads the pool and the chain tip and never
//! mutates either; only [`Ledger::commit`](super::ledger::Ledger::commit)
//! changes state.

use super::ledger::Ledger;
use super::liveness::LivenessModel;
use super::pool::ParticipantPool;
use crate::types::{Heartbeat, PulseBlock};

/// Sum of liveness weights over a heartbeat set.
pub fn aggregate_weight<'a>(
    heartbeats: impl IntoIterator<Item = &'a Heartbeat>,
    liveness: &LivenessModel,
) -> f64 {
    heartbeats.into_iter().map(|hb| liveness.weight(hb)).sum()
}

/// Build the next block from the pool, or `None` while fewer than
/// `n_threshold` identities are live.
pub fn assemble(
    pool: &ParticipantPool,
    ledger: &Ledger,
    liveness: &LivenessModel,
    n_threshold: usize,
    now_ms: u64,
) -> Option<PulseBlock> {
    let n_live = pool.heartbeat_count();
    if n_live < n_threshold {
        return None;
    }

    let total_weight = aggregate_weight(pool.heartbeats(), liveness);
    let security = total_weight;

    let tip = ledger.tip();
    let mut block = PulseBlock {
        index: ledger.len() as u64,
        timestamp: now_ms.max(tip.timestamp),
        previous_hash: tip.block_hash.clone(),
        heartbeats: pool.heartbeats().cloned().collect(),
        transactions: pool.pending().to_vec(),
        n_live,
        total_weight,
        security,
        block_hash: String::new(),
    };
    block.block_hash = block.compute_hash();

    Some(block)
}
