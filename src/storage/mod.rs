//! Block and account store for the Pulse chain using the sled embedded database.
//!
//! Blocks are stored as their serde JSON form keyed by big-endian index, so a
//! full scan returns them in chain order and each one re-hashes to its
//! `block_hash`.

use sled::transaction::{ConflictableTransactionResult, TransactionError};
use sled::{Db, Transactional, Tree};
use std::path::Path;
use thiserror::Error;
use tracing::info;

use crate::types::{Account, PulseBlock};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Block not found: {0}")]
    BlockNotFound(u64),
}

/// Persistent storage for the Pulse chain
pub struct Storage {
    db: Db,
    blocks: Tree,
    accounts: Tree,
    metadata: Tree,
}

impl Storage {
    /// Open or create storage at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let blocks = db.open_tree("blocks")?;
        let accounts = db.open_tree("accounts")?;
        let metadata = db.open_tree("metadata")?;

        info!("💾 Storage opened ({} blocks)", blocks.len());

        Ok(Self { db, blocks, accounts, metadata })
    }

    /// Save a block and advance the stored chain height
    pub fn save_block(&self, block: &PulseBlock) -> Result<(), StorageError> {
        self.save_commit(block, std::iter::empty())
    }

    /// Save a block, the accounts it changed and the new chain height in one
    /// transaction, so a crash never leaves balances out of step with blocks.
    pub fn save_commit<'a>(
        &self,
        block: &PulseBlock,
        accounts: impl IntoIterator<Item = &'a Account>,
    ) -> Result<(), StorageError> {
        let key = block.index.to_be_bytes();
        let value = serde_json::to_vec(block)?;
        let encoded = accounts
            .into_iter()
            .map(|a| -> Result<(String, Vec<u8>), StorageError> {
                Ok((a.pubkey.clone(), serde_json::to_vec(a)?))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let result = (&self.blocks, &self.accounts, &self.metadata).transaction(
            |(blocks, accounts, metadata)| -> ConflictableTransactionResult<(), StorageError> {
                blocks.insert(&key[..], value.as_slice())?;
                for (pubkey, account) in &encoded {
                    accounts.insert(pubkey.as_bytes(), account.as_slice())?;
                }
                metadata.insert("chain_height", &key[..])?;
                Ok(())
            },
        );

        match result {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(StorageError::Database(e)),
        }
    }

    /// Load a block by index
    pub fn load_block(&self, index: u64) -> Result<PulseBlock, StorageError> {
        let value = self.blocks.get(index.to_be_bytes())?
            .ok_or(StorageError::BlockNotFound(index))?;
        Ok(serde_json::from_slice(&value)?)
    }

    /// Load all blocks in index order
    pub fn load_all_blocks(&self) -> Result<Vec<PulseBlock>, StorageError> {
        self.blocks
            .iter()
            .map(|entry| -> Result<PulseBlock, StorageError> {
                let (_, value) = entry?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }

    /// Stored chain height, 0 when nothing has been saved
    pub fn chain_height(&self) -> Result<u64, StorageError> {
        match self.metadata.get("chain_height")? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes.as_ref().try_into().unwrap_or([0; 8]);
                Ok(u64::from_be_bytes(arr))
            }
            None => Ok(0),
        }
    }

    /// Load account state
    pub fn load_account(&self, pubkey: &str) -> Result<Option<Account>, StorageError> {
        match self.accounts.get(pubkey.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Load all accounts
    pub fn load_all_accounts(&self) -> Result<Vec<Account>, StorageError> {
        self.accounts
            .iter()
            .map(|entry| -> Result<Account, StorageError> {
                let (_, value) = entry?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
