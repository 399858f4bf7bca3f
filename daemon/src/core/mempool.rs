use std::{
    cmp::Reverse,
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use indexmap::IndexMap;
use log::{debug, trace};
use thiserror::Error;

use atoll_common::{
    account::Account,
    crypto::{Address, Hash},
    serializer::Serializer,
    time::TimestampSeconds,
    transaction::Transaction,
};

use crate::{
    config::{
        MEMPOOL_EXPIRY_SECONDS, MEMPOOL_MAX_PER_SENDER, MEMPOOL_MAX_SIZE, REPLACE_FACTOR_DEN,
        REPLACE_FACTOR_NUM,
    },
    core::tx_selector::{TxSelector, TxSelectorEntry},
    events::RemovalReason,
};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Transaction {0} already in pool")]
    AlreadyInPool(Hash),

    #[error("Nonce {got} below account nonce {expected}")]
    NonceTooLow { got: u64, expected: u64 },

    #[error("Nonce {got} would leave a gap, expected {expected}")]
    NonceGap { got: u64, expected: u64 },

    #[error("Sender has {0} pending transactions, limit reached")]
    SenderLimitReached(usize),

    #[error("Replacement fee {offered} below required {required}")]
    ReplacementUnderpriced { required: u64, offered: u64 },

    #[error("Pool is full and fee per byte {offered} does not beat the floor {floor}")]
    PoolFull { floor: u64, offered: u64 },
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_size: usize,
    pub max_per_sender: usize,
    pub replace_factor_num: u64,
    pub replace_factor_den: u64,
    pub expiry_seconds: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: MEMPOOL_MAX_SIZE,
            max_per_sender: MEMPOOL_MAX_PER_SENDER,
            replace_factor_num: REPLACE_FACTOR_NUM,
            replace_factor_den: REPLACE_FACTOR_DEN,
            expiry_seconds: MEMPOOL_EXPIRY_SECONDS,
        }
    }
}

struct PoolEntry {
    tx: Arc<Transaction>,
    sender: Address,
    size: usize,
    fee_per_byte: u64,
    arrival_seq: u64,
    arrival_time: TimestampSeconds,
}

impl PoolEntry {
    // Eviction order: lowest fee per byte first, then youngest arrival,
    // then lowest id. The reverse of selection priority.
    fn priority_key(&self, hash: &Hash) -> (u64, Reverse<u64>, Hash) {
        (self.fee_per_byte, Reverse(self.arrival_seq), hash.clone())
    }
}

// Unconfirmed transactions indexed for admission, selection and expiry.
// Per sender, nonces form a gap-free ascending run starting at the
// on-chain nonce; every operation preserves that invariant.
pub struct Mempool {
    config: PoolConfig,
    txs: HashMap<Hash, PoolEntry>,
    // sender -> nonce -> id, in ascending nonce order
    by_sender: HashMap<Address, IndexMap<u64, Hash>>,
    // eviction order, first() is the next victim
    priority: BTreeSet<(u64, Reverse<u64>, Hash)>,
    next_arrival_seq: u64,
}

impl Mempool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            txs: HashMap::new(),
            by_sender: HashMap::new(),
            priority: BTreeSet::new(),
            next_arrival_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn contains(&self, id: &Hash) -> bool {
        self.txs.contains_key(id)
    }

    pub fn get(&self, id: &Hash) -> Option<&Arc<Transaction>> {
        self.txs.get(id).map(|entry| &entry.tx)
    }

    // Pending run of a sender in nonce order, used to build the
    // verification context for a candidate transaction
    pub fn pending_for_sender(&self, sender: &Address) -> Vec<Arc<Transaction>> {
        self.by_sender
            .get(sender)
            .map(|queue| {
                queue
                    .values()
                    .filter_map(|id| self.txs.get(id).map(|e| e.tx.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    // Admission steps: dedup, nonce floor, per-sender run with fee-bump
    // replacement, global bound with lowest-fee eviction. Static and
    // semantic validation already happened upstream. Returns the set of
    // transactions that had to leave the pool to make room.
    pub fn admit(
        &mut self,
        tx: Arc<Transaction>,
        account: &Account,
        now: TimestampSeconds,
    ) -> Result<Vec<(Hash, RemovalReason)>, PoolError> {
        let id = tx.id();
        if self.txs.contains_key(&id) {
            return Err(PoolError::AlreadyInPool(id));
        }

        let sender = tx.get_sender().to_address();
        let nonce = tx.get_nonce();
        if nonce < account.nonce {
            return Err(PoolError::NonceTooLow {
                got: nonce,
                expected: account.nonce,
            });
        }

        let mut removed = Vec::new();

        // Same-nonce fee-bump replacement
        let existing = self
            .by_sender
            .get(&sender)
            .and_then(|queue| queue.get(&nonce))
            .cloned();
        if let Some(old_id) = existing {
            let old_fee = self.txs.get(&old_id).map(|e| e.tx.get_fee()).unwrap_or(0);
            let required = old_fee
                .saturating_mul(self.config.replace_factor_num)
                .div_ceil(self.config.replace_factor_den);
            if tx.get_fee() < required {
                return Err(PoolError::ReplacementUnderpriced {
                    required,
                    offered: tx.get_fee(),
                });
            }

            debug!("replacing pool transaction {} with {}", old_id, id);
            self.remove_entry(&old_id);
            removed.push((old_id, RemovalReason::Replaced));
        } else {
            let queue_len = self.by_sender.get(&sender).map(|q| q.len()).unwrap_or(0);
            let expected = account.nonce + queue_len as u64;
            if nonce != expected {
                return Err(PoolError::NonceGap {
                    got: nonce,
                    expected,
                });
            }

            if queue_len >= self.config.max_per_sender {
                return Err(PoolError::SenderLimitReached(queue_len));
            }
        }

        // Global bound: the newcomer must beat the cheapest resident
        let fee_per_byte = tx.fee_per_byte();
        if self.txs.len() >= self.config.max_size {
            let victim = match self.priority.first() {
                Some((floor, _, victim_id)) => {
                    if fee_per_byte <= *floor {
                        return Err(PoolError::PoolFull {
                            floor: *floor,
                            offered: fee_per_byte,
                        });
                    }
                    victim_id.clone()
                }
                None => unreachable!("non-empty pool has a priority entry"),
            };

            removed.extend(self.remove_with_descendants(&victim, RemovalReason::Evicted));

            // the eviction may have cut into our own sender's run
            let queue_len = self.by_sender.get(&sender).map(|q| q.len()).unwrap_or(0);
            let expected = account.nonce + queue_len as u64;
            if nonce > expected {
                return Err(PoolError::NonceGap {
                    got: nonce,
                    expected,
                });
            }
        }

        let entry = PoolEntry {
            sender,
            size: tx.size(),
            fee_per_byte,
            arrival_seq: self.next_arrival_seq,
            arrival_time: now,
            tx,
        };
        self.next_arrival_seq += 1;

        self.priority.insert(entry.priority_key(&id));
        let queue = self.by_sender.entry(sender).or_default();
        queue.insert(nonce, id.clone());
        queue.sort_keys();
        self.txs.insert(id.clone(), entry);

        trace!("admitted transaction {} ({} in pool)", id, self.txs.len());
        Ok(removed)
    }

    // Select transactions up to the payload budget, senders ordered by
    // head fee per byte, nonce order inside a sender, gap-free.
    pub fn select(&self, max_bytes: usize) -> Vec<(Hash, Arc<Transaction>)> {
        let groups = self.by_sender.values().map(|queue| {
            queue
                .values()
                .filter_map(|id| {
                    self.txs.get(id).map(|entry| TxSelectorEntry {
                        hash: id.clone(),
                        tx: entry.tx.clone(),
                        size: entry.size,
                        fee_per_byte: entry.fee_per_byte,
                        arrival_seq: entry.arrival_seq,
                    })
                })
                .collect::<Vec<_>>()
        });

        let mut selector = TxSelector::grouped(groups);
        let mut selected = Vec::new();
        let mut used = 0usize;
        // senders whose run was cut by the budget, their later nonces
        // would be gapped
        let mut blocked: std::collections::HashSet<Address> = std::collections::HashSet::new();

        while let Some(entry) = selector.next() {
            let sender = entry.tx.get_sender().to_address();
            if blocked.contains(&sender) {
                continue;
            }

            if used + entry.size > max_bytes {
                blocked.insert(sender);
                continue;
            }

            used += entry.size;
            selected.push((entry.hash, entry.tx));
        }

        selected
    }

    // Remove everything invalidated by an applied block: the included
    // ids, and for every touched sender all pending nonces below the new
    // on-chain nonce.
    pub fn on_block_applied(
        &mut self,
        included: &[Hash],
        senders: &[(Address, u64)],
    ) -> Vec<(Hash, RemovalReason)> {
        let mut removed = Vec::new();
        for id in included {
            if self.remove_entry(id) {
                removed.push((id.clone(), RemovalReason::Included));
            }
        }

        for (sender, new_nonce) in senders {
            let Some(queue) = self.by_sender.get(sender) else {
                continue;
            };

            let stale: Vec<Hash> = queue
                .iter()
                .filter(|(nonce, _)| **nonce < *new_nonce)
                .map(|(_, id)| id.clone())
                .collect();
            for id in stale {
                if self.remove_entry(&id) {
                    removed.push((id, RemovalReason::Conflict));
                }
            }

            // anything left must continue the run exactly at the account
            // nonce, otherwise it can never be selected
            if let Some(queue) = self.by_sender.get(sender) {
                if let Some((front, _)) = queue.first() {
                    if *front != *new_nonce {
                        let orphaned: Vec<Hash> = queue.values().cloned().collect();
                        for id in orphaned {
                            if self.remove_entry(&id) {
                                removed.push((id, RemovalReason::Conflict));
                            }
                        }
                    }
                }
            }
        }

        removed
    }

    // Periodic sweep: drop transactions past the expiry interval, plus
    // the now-gapped rest of their sender runs
    pub fn expire(&mut self, now: TimestampSeconds) -> Vec<(Hash, RemovalReason)> {
        let expired: Vec<Hash> = self
            .txs
            .iter()
            .filter(|(_, entry)| now.saturating_sub(entry.arrival_time) > self.config.expiry_seconds)
            .map(|(id, _)| id.clone())
            .collect();

        let mut removed = Vec::new();
        for id in expired {
            if self.txs.contains_key(&id) {
                removed.extend(self.remove_with_descendants(&id, RemovalReason::Expired));
            }
        }

        if !removed.is_empty() {
            debug!("expired {} transactions from the pool", removed.len());
        }
        removed
    }

    // Remove one transaction and every higher nonce of the same sender
    // (they would be gapped without it)
    fn remove_with_descendants(
        &mut self,
        id: &Hash,
        reason: RemovalReason,
    ) -> Vec<(Hash, RemovalReason)> {
        let Some(entry) = self.txs.get(id) else {
            return Vec::new();
        };

        let sender = entry.sender;
        let nonce = entry.tx.get_nonce();
        let descendants: Vec<Hash> = self
            .by_sender
            .get(&sender)
            .map(|queue| {
                queue
                    .iter()
                    .filter(|(n, _)| **n > nonce)
                    .map(|(_, id)| id.clone())
                    .collect()
            })
            .unwrap_or_default();

        let mut removed = Vec::new();
        if self.remove_entry(id) {
            removed.push((id.clone(), reason));
        }
        for descendant in descendants {
            if self.remove_entry(&descendant) {
                removed.push((descendant, RemovalReason::Conflict));
            }
        }

        removed
    }

    fn remove_entry(&mut self, id: &Hash) -> bool {
        let Some(entry) = self.txs.remove(id) else {
            return false;
        };

        self.priority.remove(&entry.priority_key(id));
        if let Some(queue) = self.by_sender.get_mut(&entry.sender) {
            queue.shift_remove(&entry.tx.get_nonce());
            if queue.is_empty() {
                self.by_sender.remove(&entry.sender);
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atoll_common::{
        crypto::KeyPair,
        transaction::TransactionAsset,
    };

    fn account_for(keypair: &KeyPair, nonce: u64) -> Account {
        let mut account = Account::with_balance(keypair.get_address(), u64::MAX / 2);
        account.nonce = nonce;
        account
    }

    fn transfer(keypair: &KeyPair, nonce: u64, fee: u64) -> Arc<Transaction> {
        Arc::new(Transaction::create(
            keypair,
            nonce,
            fee,
            TransactionAsset::Transfer {
                recipient: Address::new([9u8; 20]),
                amount: 1,
                data: Vec::new(),
            },
        ))
    }

    fn small_pool(max_size: usize, max_per_sender: usize) -> Mempool {
        Mempool::new(PoolConfig {
            max_size,
            max_per_sender,
            ..PoolConfig::default()
        })
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut pool = small_pool(10, 5);
        let keypair = KeyPair::generate();
        let account = account_for(&keypair, 0);
        let tx = transfer(&keypair, 0, 50_000);

        pool.admit(tx.clone(), &account, 0).unwrap();
        assert!(matches!(
            pool.admit(tx, &account, 0),
            Err(PoolError::AlreadyInPool(_))
        ));
    }

    #[test]
    fn test_nonce_gap_rejected() {
        let mut pool = small_pool(10, 5);
        let keypair = KeyPair::generate();
        let account = account_for(&keypair, 7);

        assert!(matches!(
            pool.admit(transfer(&keypair, 6, 1_000), &account, 0),
            Err(PoolError::NonceTooLow { expected: 7, .. })
        ));
        assert!(matches!(
            pool.admit(transfer(&keypair, 9, 1_000), &account, 0),
            Err(PoolError::NonceGap { expected: 7, .. })
        ));

        pool.admit(transfer(&keypair, 7, 1_000), &account, 0).unwrap();
        pool.admit(transfer(&keypair, 8, 1_000), &account, 0).unwrap();
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_replacement_requires_fee_bump() {
        let mut pool = small_pool(10, 5);
        let keypair = KeyPair::generate();
        let account = account_for(&keypair, 7);

        let original = transfer(&keypair, 7, 100);
        pool.admit(original.clone(), &account, 0).unwrap();

        // 105 < ceil(100 * 1.1) = 110: rejected
        assert!(matches!(
            pool.admit(transfer(&keypair, 7, 105), &account, 0),
            Err(PoolError::ReplacementUnderpriced { required: 110, .. })
        ));

        // 120 >= 110: accepted, the original leaves as Replaced
        let removed = pool
            .admit(transfer(&keypair, 7, 120), &account, 0)
            .unwrap();
        assert_eq!(removed, vec![(original.id(), RemovalReason::Replaced)]);
        assert_eq!(pool.len(), 1);
        assert!(!pool.contains(&original.id()));
    }

    #[test]
    fn test_per_sender_limit() {
        let mut pool = small_pool(100, 2);
        let keypair = KeyPair::generate();
        let account = account_for(&keypair, 0);

        pool.admit(transfer(&keypair, 0, 1_000), &account, 0).unwrap();
        pool.admit(transfer(&keypair, 1, 1_000), &account, 0).unwrap();
        assert!(matches!(
            pool.admit(transfer(&keypair, 2, 1_000), &account, 0),
            Err(PoolError::SenderLimitReached(2))
        ));
    }

    #[test]
    fn test_full_pool_evicts_lowest_fee_per_byte() {
        let mut pool = small_pool(2, 5);
        let cheap = KeyPair::generate();
        let pricey = KeyPair::generate();
        let newcomer = KeyPair::generate();

        let cheap_tx = transfer(&cheap, 0, 200);
        pool.admit(cheap_tx.clone(), &account_for(&cheap, 0), 0)
            .unwrap();
        pool.admit(transfer(&pricey, 0, 900_000), &account_for(&pricey, 0), 0)
            .unwrap();

        // does not beat the floor: rejected
        assert!(matches!(
            pool.admit(transfer(&newcomer, 0, 100), &account_for(&newcomer, 0), 0),
            Err(PoolError::PoolFull { .. })
        ));

        // beats the floor: cheapest resident evicted
        let removed = pool
            .admit(
                transfer(&newcomer, 0, 500_000),
                &account_for(&newcomer, 0),
                0,
            )
            .unwrap();
        assert_eq!(removed, vec![(cheap_tx.id(), RemovalReason::Evicted)]);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_eviction_cascades_to_descendants() {
        let mut pool = small_pool(3, 5);
        let victim = KeyPair::generate();
        let other = KeyPair::generate();

        // victim run: nonce 0 cheap, nonce 1 expensive
        let run_head = transfer(&victim, 0, 100);
        let run_tail = transfer(&victim, 1, 800_000);
        pool.admit(run_head.clone(), &account_for(&victim, 0), 0)
            .unwrap();
        pool.admit(run_tail.clone(), &account_for(&victim, 0), 0)
            .unwrap();
        pool.admit(transfer(&other, 0, 700_000), &account_for(&other, 0), 0)
            .unwrap();

        let removed = pool
            .admit(transfer(&other, 1, 600_000), &account_for(&other, 0), 0)
            .unwrap();

        // head evicted, tail cascades since it would be gapped
        assert_eq!(
            removed,
            vec![
                (run_head.id(), RemovalReason::Evicted),
                (run_tail.id(), RemovalReason::Conflict),
            ]
        );
    }

    #[test]
    fn test_on_block_applied_prunes_included_and_stale() {
        let mut pool = small_pool(10, 5);
        let keypair = KeyPair::generate();
        let account = account_for(&keypair, 0);

        let first = transfer(&keypair, 0, 1_000);
        let second = transfer(&keypair, 1, 1_000);
        pool.admit(first.clone(), &account, 0).unwrap();
        pool.admit(second.clone(), &account, 0).unwrap();

        // block included `first`; sender nonce advanced to 1
        let removed =
            pool.on_block_applied(&[first.id()], &[(keypair.get_address(), 1)]);
        assert_eq!(removed, vec![(first.id(), RemovalReason::Included)]);
        assert!(pool.contains(&second.id()));

        // a competing tx with nonce 1 was included elsewhere: second is stale
        let removed = pool.on_block_applied(&[], &[(keypair.get_address(), 2)]);
        assert_eq!(removed, vec![(second.id(), RemovalReason::Conflict)]);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_expiry_sweep() {
        let mut pool = Mempool::new(PoolConfig {
            expiry_seconds: 100,
            ..PoolConfig::default()
        });
        let keypair = KeyPair::generate();
        let account = account_for(&keypair, 0);

        let old = transfer(&keypair, 0, 1_000);
        pool.admit(old.clone(), &account, 1_000).unwrap();
        let fresh = transfer(&keypair, 1, 1_000);
        pool.admit(fresh.clone(), &account, 1_090).unwrap();

        // old expired; fresh cascades because its run lost nonce 0
        let removed = pool.expire(1_150);
        assert_eq!(
            removed,
            vec![
                (old.id(), RemovalReason::Expired),
                (fresh.id(), RemovalReason::Conflict),
            ]
        );
        assert!(pool.is_empty());
    }

    #[test]
    fn test_selection_is_gap_free_and_fee_ordered() {
        let mut pool = small_pool(10, 5);
        let a = KeyPair::generate();
        let b = KeyPair::generate();

        pool.admit(transfer(&a, 0, 100_000), &account_for(&a, 0), 0)
            .unwrap();
        pool.admit(transfer(&a, 1, 900_000), &account_for(&a, 0), 0)
            .unwrap();
        pool.admit(transfer(&b, 0, 500_000), &account_for(&b, 0), 0)
            .unwrap();

        let selected = pool.select(usize::MAX);
        let nonces: Vec<(Address, u64)> = selected
            .iter()
            .map(|(_, tx)| (tx.get_sender().to_address(), tx.get_nonce()))
            .collect();

        // b's single tx outbids a's head; a's run stays in nonce order
        assert_eq!(nonces[0], (b.get_address(), 0));
        assert_eq!(nonces[1], (a.get_address(), 0));
        assert_eq!(nonces[2], (a.get_address(), 1));
    }
}
