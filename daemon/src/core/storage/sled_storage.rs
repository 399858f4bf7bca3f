use std::{num::NonZeroUsize, path::Path, sync::Arc};

use async_trait::async_trait;
use log::{debug, trace};
use lru::LruCache;
use tokio::sync::Mutex;

use atoll_common::{
    account::Account,
    block::Block,
    crypto::{Address, Hash, ADDRESS_SIZE, HASH_SIZE},
    serializer::Serializer,
};

use crate::{config::BLOCK_CACHE_SIZE, core::error::BlockchainError};

use super::{keys, BatchOp, Storage, WriteBatch};
use super::{
    AccountProvider, BftProvider, BlockProvider, ChainStateProvider, JournalProvider,
    OnionProvider, TempBlockProvider,
};

// Sled-backed storage: one tree, prefixed keys, atomic batches.
// Reads go through a small LRU cache of decoded blocks since sync and
// the transport re-read recent blocks constantly.
pub struct SledStorage {
    db: sled::Db,
    block_cache: Mutex<LruCache<Hash, Arc<Block>>>,
}

impl SledStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, BlockchainError> {
        debug!("opening sled storage at {}", path.as_ref().display());
        let db = sled::open(path)?;
        Ok(Self::from_db(db))
    }

    // In-memory store used by the test suites
    pub fn temporary() -> Result<Self, BlockchainError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self::from_db(db))
    }

    fn from_db(db: sled::Db) -> Self {
        let capacity = NonZeroUsize::new(BLOCK_CACHE_SIZE).expect("cache size must be non-zero");
        Self {
            db,
            block_cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BlockchainError> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }
}

#[async_trait]
impl BlockProvider for SledStorage {
    async fn has_block(&self, id: &Hash) -> Result<bool, BlockchainError> {
        if self.block_cache.lock().await.contains(id) {
            return Ok(true);
        }
        Ok(self.db.contains_key(keys::block_by_id(id))?)
    }

    async fn get_block_by_id(&self, id: &Hash) -> Result<Option<Block>, BlockchainError> {
        if let Some(block) = self.block_cache.lock().await.get(id) {
            trace!("block cache hit for {}", id);
            return Ok(Some((**block).clone()));
        }

        let Some(bytes) = self.get_raw(&keys::block_by_id(id))? else {
            return Ok(None);
        };

        let block = Block::from_bytes(&bytes)?;
        self.block_cache
            .lock()
            .await
            .put(id.clone(), Arc::new(block.clone()));
        Ok(Some(block))
    }

    async fn get_block_id_at_height(&self, height: u64) -> Result<Option<Hash>, BlockchainError> {
        let Some(bytes) = self.get_raw(&keys::block_by_height(height))? else {
            return Ok(None);
        };

        Ok(Some(Hash::from_bytes(&bytes)?))
    }

    async fn get_tip(&self) -> Result<Option<Hash>, BlockchainError> {
        let Some(bytes) = self.get_raw(keys::TIP)? else {
            return Ok(None);
        };

        Ok(Some(Hash::from_bytes(&bytes)?))
    }
}

#[async_trait]
impl AccountProvider for SledStorage {
    async fn get_account(&self, address: &Address) -> Result<Option<Account>, BlockchainError> {
        let Some(bytes) = self.get_raw(&keys::account(address))? else {
            return Ok(None);
        };

        Ok(Some(Account::from_bytes(&bytes)?))
    }
}

#[async_trait]
impl ChainStateProvider for SledStorage {
    async fn get_chain_state(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BlockchainError> {
        self.get_raw(&keys::chain_state(key))
    }
}

#[async_trait]
impl BftProvider for SledStorage {
    async fn get_bft_record(
        &self,
        validator: &Address,
    ) -> Result<Option<Vec<u8>>, BlockchainError> {
        self.get_raw(&keys::bft_record(validator))
    }

    async fn get_all_bft_records(&self) -> Result<Vec<(Address, Vec<u8>)>, BlockchainError> {
        let prefix = keys::bft_record_prefix();
        let mut records = Vec::new();
        for entry in self.db.scan_prefix(prefix) {
            let (key, value) = entry?;
            let suffix = &key[prefix.len()..];
            if suffix.len() != ADDRESS_SIZE {
                continue;
            }

            let address = Address::new(suffix.try_into().expect("checked length"));
            records.push((address, value.to_vec()));
        }

        Ok(records)
    }

    async fn get_finalized_height(&self) -> Result<u64, BlockchainError> {
        match self.get_raw(keys::FINALIZED)? {
            Some(bytes) => Ok(u64::from_bytes(&bytes)?),
            None => Ok(0),
        }
    }

    async fn get_prevoted_height(&self) -> Result<u64, BlockchainError> {
        match self.get_raw(keys::PREVOTED)? {
            Some(bytes) => Ok(u64::from_bytes(&bytes)?),
            None => Ok(0),
        }
    }
}

#[async_trait]
impl TempBlockProvider for SledStorage {
    async fn get_temp_blocks(&self) -> Result<Vec<Block>, BlockchainError> {
        let mut blocks = Vec::new();
        for entry in self.db.scan_prefix(keys::temp_prefix()) {
            let (_, value) = entry?;
            blocks.push(Block::from_bytes(&value)?);
        }

        blocks.sort_by_key(|b| b.get_header().height);
        Ok(blocks)
    }

    async fn temp_block_count(&self) -> Result<usize, BlockchainError> {
        Ok(self.db.scan_prefix(keys::temp_prefix()).count())
    }
}

#[async_trait]
impl JournalProvider for SledStorage {
    async fn get_journal(&self, id: &Hash) -> Result<Option<Vec<u8>>, BlockchainError> {
        self.get_raw(&keys::journal(id))
    }
}

#[async_trait]
impl OnionProvider for SledStorage {
    async fn get_used_onion_index(
        &self,
        address: &Address,
    ) -> Result<Option<u64>, BlockchainError> {
        match self.get_raw(&keys::used_hashes(address))? {
            Some(bytes) => Ok(Some(u64::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set_used_onion_index(
        &self,
        address: &Address,
        index: u64,
    ) -> Result<(), BlockchainError> {
        self.db
            .insert(keys::used_hashes(address), index.to_bytes())?;
        // The used index must hit disk before the header is signed
        self.db.flush_async().await?;
        Ok(())
    }
}

#[async_trait]
impl Storage for SledStorage {
    async fn commit(&mut self, batch: WriteBatch) -> Result<(), BlockchainError> {
        let mut sled_batch = sled::Batch::default();
        let mut evicted_blocks: Vec<Hash> = Vec::new();

        for op in batch.into_ops() {
            match op {
                BatchOp::Put(key, value) => sled_batch.insert(key, value),
                BatchOp::Delete(key) => {
                    if keys::is_block_key(&key) {
                        let suffix = &key[key.len() - HASH_SIZE..];
                        evicted_blocks.push(Hash::new(suffix.try_into().expect("block key size")));
                    }
                    sled_batch.remove(key);
                }
            }
        }

        self.db.apply_batch(sled_batch)?;

        if !evicted_blocks.is_empty() {
            let mut cache = self.block_cache.lock().await;
            for id in evicted_blocks {
                cache.pop(&id);
            }
        }

        Ok(())
    }

    async fn flush(&self) -> Result<(), BlockchainError> {
        self.db.flush_async().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tip_roundtrip() {
        let mut storage = SledStorage::temporary().unwrap();
        assert!(storage.get_tip().await.unwrap().is_none());

        let id = atoll_common::crypto::hash(b"tip");
        let mut batch = WriteBatch::new();
        batch.put(keys::TIP.to_vec(), id.as_bytes().to_vec());
        storage.commit(batch).await.unwrap();

        assert_eq!(storage.get_tip().await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn test_batch_is_atomic_per_commit() {
        let mut storage = SledStorage::temporary().unwrap();
        let address = Address::new([1u8; 20]);
        let account = Account::with_balance(address, 77);

        let mut batch = WriteBatch::new();
        batch.put(keys::account(&address), account.to_bytes());
        batch.put(keys::FINALIZED.to_vec(), 5u64.to_bytes());
        storage.commit(batch).await.unwrap();

        assert_eq!(
            storage.get_account(&address).await.unwrap(),
            Some(account)
        );
        assert_eq!(storage.get_finalized_height().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_used_onion_index_persists() {
        let storage = SledStorage::temporary().unwrap();
        let address = Address::new([2u8; 20]);
        assert!(storage
            .get_used_onion_index(&address)
            .await
            .unwrap()
            .is_none());

        storage.set_used_onion_index(&address, 12).await.unwrap();
        assert_eq!(
            storage.get_used_onion_index(&address).await.unwrap(),
            Some(12)
        );
    }
}
