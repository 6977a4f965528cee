//! Pulse Ledger Library
//!
//! The core of a Proof-of-Life ledger: identities prove they are alive by
//! submitting signed heartbeats, blocks are assembled once enough identities
//! are live, and each block's reward is split in proportion to liveness weight.
//!
//! ## Modules
//!
//! - `types` - Core data structures (Heartbeat, Transaction, Block, Account)
//! - `crypto` - ECDSA signing/verification and content hashing
//! - `consensus` - Admission, assembly, commit and the ledger state machine
//! - `storage` - Persistent chain storage
//! - `node` - Lock-guarded shared handle and round trigger for host processes

pub mod types;
pub mod crypto;
pub mod consensus;
pub mod storage;
pub mod node;

pub use types::*;
pub use crypto::Keypair;
pub use consensus::{current_time_ms, ConsensusConfig, ConsensusError, ProofOfLife};
pub use consensus::ledger::{verify_chain, ChainError, CommitReceipt};
pub use node::NodeHandle;
