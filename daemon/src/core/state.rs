use std::collections::HashMap;

use log::trace;

use atoll_common::{
    account::Account,
    crypto::Address,
    serializer::{Reader, ReaderError, Serializer, Writer},
};

use crate::core::{
    error::BlockchainError,
    storage::{keys, AccountProvider, ChainStateProvider, Storage, WriteBatch},
};

// One reversible KV mutation: `previous` is the raw value the key held
// before the block was applied, None if the key did not exist.
pub struct UndoEntry {
    pub key: Vec<u8>,
    pub previous: Option<Vec<u8>>,
}

impl Serializer for UndoEntry {
    fn write(&self, writer: &mut Writer) {
        writer.write_var_bytes(&self.key);
        self.previous.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let key = reader.read_var_bytes()?;
        let previous = Option::read(reader)?;
        Ok(Self { key, previous })
    }
}

// Inverse operations sufficient to restore accounts and module state on
// deleteLastBlock. Keyed by block id in storage; deleted once the block
// is finalized.
#[derive(Default)]
pub struct UndoJournal {
    pub entries: Vec<UndoEntry>,
}

impl UndoJournal {
    pub fn record(&mut self, key: Vec<u8>, previous: Option<Vec<u8>>) {
        self.entries.push(UndoEntry { key, previous });
    }

    // Queue the restores into a batch
    pub fn restore_into(&self, batch: &mut WriteBatch) {
        for entry in &self.entries {
            match &entry.previous {
                Some(value) => batch.put(entry.key.clone(), value.clone()),
                None => batch.delete(entry.key.clone()),
            }
        }
    }
}

impl Serializer for UndoJournal {
    fn write(&self, writer: &mut Writer) {
        self.entries.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let entries = Vec::read(reader)?;
        Ok(Self { entries })
    }
}

struct AccountEntry {
    // Encoded value before this block, None for fresh accounts
    previous: Option<Vec<u8>>,
    current: Account,
    dirty: bool,
}

struct ChainStateEntry {
    previous: Option<Vec<u8>>,
    current: Option<Vec<u8>>,
    dirty: bool,
}

// Copy-on-write snapshot of the accounts and module state touched while
// verifying and applying one block. Reads fall through to storage once
// and are cached; nothing hits the KV store until `finish` packs the
// write set and the undo journal into the caller's batch.
pub struct StateStore<'a, S: Storage> {
    storage: &'a S,
    accounts: HashMap<Address, AccountEntry>,
    chain_state: HashMap<Vec<u8>, ChainStateEntry>,
}

impl<'a, S: Storage> StateStore<'a, S> {
    pub fn new(storage: &'a S) -> Self {
        Self {
            storage,
            accounts: HashMap::new(),
            chain_state: HashMap::new(),
        }
    }

    async fn load_account(&mut self, address: &Address) -> Result<(), BlockchainError> {
        if self.accounts.contains_key(address) {
            return Ok(());
        }

        let stored = self.storage.get_account(address).await?;
        let entry = match stored {
            Some(account) => AccountEntry {
                previous: Some(account.to_bytes()),
                current: account,
                dirty: false,
            },
            None => AccountEntry {
                previous: None,
                current: Account::new(*address),
                dirty: false,
            },
        };

        self.accounts.insert(*address, entry);
        Ok(())
    }

    // Read view of an account; a default account if it was never stored
    pub async fn get_account(&mut self, address: &Address) -> Result<&Account, BlockchainError> {
        self.load_account(address).await?;
        Ok(&self.accounts.get(address).expect("loaded above").current)
    }

    pub async fn get_account_mut(
        &mut self,
        address: &Address,
    ) -> Result<&mut Account, BlockchainError> {
        self.load_account(address).await?;
        let entry = self.accounts.get_mut(address).expect("loaded above");
        entry.dirty = true;
        Ok(&mut entry.current)
    }

    pub async fn credit(&mut self, address: &Address, amount: u64) -> Result<(), BlockchainError> {
        let account = self.get_account_mut(address).await?;
        account.balance = account.balance.saturating_add(amount);
        Ok(())
    }

    pub async fn debit(&mut self, address: &Address, amount: u64) -> Result<(), BlockchainError> {
        let account = self.get_account_mut(address).await?;
        if account.balance < amount {
            return Err(BlockchainError::InsufficientBalance {
                address: *address,
                need: amount,
                have: account.balance,
            });
        }

        account.balance -= amount;
        Ok(())
    }

    async fn load_chain_state(&mut self, key: &[u8]) -> Result<(), BlockchainError> {
        if self.chain_state.contains_key(key) {
            return Ok(());
        }

        let stored = self.storage.get_chain_state(key).await?;
        self.chain_state.insert(
            key.to_vec(),
            ChainStateEntry {
                previous: stored.clone(),
                current: stored,
                dirty: false,
            },
        );
        Ok(())
    }

    pub async fn get_chain_state(
        &mut self,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, BlockchainError> {
        self.load_chain_state(key).await?;
        Ok(self
            .chain_state
            .get(key)
            .expect("loaded above")
            .current
            .clone())
    }

    pub async fn set_chain_state(
        &mut self,
        key: &[u8],
        value: Vec<u8>,
    ) -> Result<(), BlockchainError> {
        self.load_chain_state(key).await?;
        let entry = self.chain_state.get_mut(key).expect("loaded above");
        entry.current = Some(value);
        entry.dirty = true;
        Ok(())
    }

    // Pack every dirty entry into the block's batch and journal
    pub fn finish(self, batch: &mut WriteBatch, journal: &mut UndoJournal) {
        for (address, entry) in self.accounts {
            if !entry.dirty {
                continue;
            }

            let key = keys::account(&address);
            let encoded = entry.current.to_bytes();
            if entry.previous.as_deref() == Some(encoded.as_slice()) {
                continue;
            }

            trace!("state store writes account {}", address);
            journal.record(key.clone(), entry.previous);
            batch.put(key, encoded);
        }

        for (state_key, entry) in self.chain_state {
            if !entry.dirty || entry.previous == entry.current {
                continue;
            }

            let key = keys::chain_state(&state_key);
            journal.record(key.clone(), entry.previous);
            match entry.current {
                Some(value) => batch.put(key, value),
                None => batch.delete(key),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::SledStorage;

    #[tokio::test]
    async fn test_reads_are_cached_and_clean_entries_skipped() {
        let storage = SledStorage::temporary().unwrap();
        let address = Address::new([1u8; 20]);

        let mut state = StateStore::new(&storage);
        let account = state.get_account(&address).await.unwrap();
        assert_eq!(account.balance, 0);

        let mut batch = WriteBatch::new();
        let mut journal = UndoJournal::default();
        state.finish(&mut batch, &mut journal);

        // untouched accounts produce no writes
        assert!(batch.is_empty());
        assert!(journal.entries.is_empty());
    }

    #[tokio::test]
    async fn test_apply_then_restore_is_identity() {
        let mut storage = SledStorage::temporary().unwrap();
        let address = Address::new([3u8; 20]);

        // seed an account
        let mut seed = WriteBatch::new();
        seed.put(
            keys::account(&address),
            Account::with_balance(address, 100).to_bytes(),
        );
        storage.commit(seed).await.unwrap();

        // mutate through a state store
        let mut batch = WriteBatch::new();
        let mut journal = UndoJournal::default();
        {
            let mut state = StateStore::new(&storage);
            state.debit(&address, 40).await.unwrap();
            state.credit(&Address::new([4u8; 20]), 40).await.unwrap();
            state.finish(&mut batch, &mut journal);
        }
        storage.commit(batch).await.unwrap();

        assert_eq!(
            storage.get_account(&address).await.unwrap().unwrap().balance,
            60
        );

        // journal roundtrips through its encoding, then restores
        let journal = UndoJournal::from_bytes(&journal.to_bytes()).unwrap();
        let mut restore = WriteBatch::new();
        journal.restore_into(&mut restore);
        storage.commit(restore).await.unwrap();

        assert_eq!(
            storage.get_account(&address).await.unwrap().unwrap().balance,
            100
        );
        // the fresh recipient account is gone again
        assert!(storage
            .get_account(&Address::new([4u8; 20]))
            .await
            .unwrap()
            .is_none());
    }
}
