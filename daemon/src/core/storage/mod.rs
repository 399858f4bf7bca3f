mod sled_storage;

pub use sled_storage::SledStorage;

use async_trait::async_trait;

use atoll_common::{
    account::Account,
    block::Block,
    crypto::{Address, Hash},
};

use crate::core::error::BlockchainError;

// Key namespaces inside the single KV tree. Every persisted value lives
// under exactly one of these prefixes; the layout is part of the node's
// on-disk contract.
pub mod keys {
    use atoll_common::crypto::{Address, Hash};

    pub const TIP: &[u8] = b"chain:tip";
    pub const FINALIZED: &[u8] = b"bft:finalized";
    pub const PREVOTED: &[u8] = b"bft:prevoted";

    const BLOCK_ID: &[u8] = b"blocks:id:";
    const BLOCK_HEIGHT: &[u8] = b"blocks:height:";
    const ACCOUNT: &[u8] = b"accounts:";
    const CHAIN_STATE: &[u8] = b"chain:state:";
    const BFT_RECORD: &[u8] = b"bft:record:";
    const TEMP: &[u8] = b"temp:";
    const JOURNAL: &[u8] = b"journal:";
    const USED_HASHES: &[u8] = b"forger:used_hashes:";

    fn concat(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(prefix.len() + suffix.len());
        key.extend_from_slice(prefix);
        key.extend_from_slice(suffix);
        key
    }

    pub fn block_by_id(id: &Hash) -> Vec<u8> {
        concat(BLOCK_ID, id.as_bytes())
    }

    pub fn block_by_height(height: u64) -> Vec<u8> {
        concat(BLOCK_HEIGHT, &height.to_be_bytes())
    }

    pub fn account(address: &Address) -> Vec<u8> {
        concat(ACCOUNT, address.as_bytes())
    }

    pub fn chain_state(key: &[u8]) -> Vec<u8> {
        concat(CHAIN_STATE, key)
    }

    pub fn bft_record(validator: &Address) -> Vec<u8> {
        concat(BFT_RECORD, validator.as_bytes())
    }

    pub fn bft_record_prefix() -> &'static [u8] {
        BFT_RECORD
    }

    pub fn temp_block(id: &Hash) -> Vec<u8> {
        concat(TEMP, id.as_bytes())
    }

    pub fn temp_prefix() -> &'static [u8] {
        TEMP
    }

    pub fn journal(id: &Hash) -> Vec<u8> {
        concat(JOURNAL, id.as_bytes())
    }

    pub fn used_hashes(address: &Address) -> Vec<u8> {
        concat(USED_HASHES, address.as_bytes())
    }

    pub fn is_block_key(key: &[u8]) -> bool {
        key.starts_with(BLOCK_ID)
    }
}

// One logical write: applied atomically or not at all.
// The processor packs block bytes, touched accounts, module state, BFT
// state, the undo journal delta and the tip pointer into a single batch.
#[derive(Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put(key, value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete(key));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

#[async_trait]
pub trait BlockProvider {
    async fn has_block(&self, id: &Hash) -> Result<bool, BlockchainError>;

    async fn get_block_by_id(&self, id: &Hash) -> Result<Option<Block>, BlockchainError>;

    async fn get_block_id_at_height(&self, height: u64) -> Result<Option<Hash>, BlockchainError>;

    async fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, BlockchainError> {
        match self.get_block_id_at_height(height).await? {
            Some(id) => self.get_block_by_id(&id).await,
            None => Ok(None),
        }
    }

    // Id of the last applied block, None on a fresh store
    async fn get_tip(&self) -> Result<Option<Hash>, BlockchainError>;
}

#[async_trait]
pub trait AccountProvider {
    async fn get_account(&self, address: &Address) -> Result<Option<Account>, BlockchainError>;
}

#[async_trait]
pub trait ChainStateProvider {
    async fn get_chain_state(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BlockchainError>;
}

#[async_trait]
pub trait BftProvider {
    async fn get_bft_record(&self, validator: &Address)
        -> Result<Option<Vec<u8>>, BlockchainError>;

    // All persisted validator records, keyed by address
    async fn get_all_bft_records(&self) -> Result<Vec<(Address, Vec<u8>)>, BlockchainError>;

    async fn get_finalized_height(&self) -> Result<u64, BlockchainError>;

    async fn get_prevoted_height(&self) -> Result<u64, BlockchainError>;
}

#[async_trait]
pub trait TempBlockProvider {
    // Superseded blocks waiting in the temp region, ascending by height
    async fn get_temp_blocks(&self) -> Result<Vec<Block>, BlockchainError>;

    async fn temp_block_count(&self) -> Result<usize, BlockchainError>;
}

#[async_trait]
pub trait JournalProvider {
    async fn get_journal(&self, id: &Hash) -> Result<Option<Vec<u8>>, BlockchainError>;
}

#[async_trait]
pub trait OnionProvider {
    async fn get_used_onion_index(
        &self,
        address: &Address,
    ) -> Result<Option<u64>, BlockchainError>;

    // Persisted on its own, strictly before the forged header is signed
    async fn set_used_onion_index(
        &self,
        address: &Address,
        index: u64,
    ) -> Result<(), BlockchainError>;
}

#[async_trait]
pub trait Storage:
    BlockProvider
    + AccountProvider
    + ChainStateProvider
    + BftProvider
    + TempBlockProvider
    + JournalProvider
    + OnionProvider
    + Send
    + Sync
    + 'static
{
    // Apply one logical write atomically
    async fn commit(&mut self, batch: WriteBatch) -> Result<(), BlockchainError>;

    // Flush to disk; called before the store is closed at shutdown
    async fn flush(&self) -> Result<(), BlockchainError>;
}
