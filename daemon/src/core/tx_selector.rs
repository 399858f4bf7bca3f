use std::{
    cmp::Ordering,
    collections::{hash_map::Entry, BinaryHeap, HashMap, VecDeque},
    sync::Arc,
};

use atoll_common::{
    crypto::{Address, Hash},
    transaction::Transaction,
};

// One pool transaction as the selector sees it
pub struct TxSelectorEntry {
    pub hash: Hash,
    pub tx: Arc<Transaction>,
    // Size in bytes of the TX
    pub size: usize,
    pub fee_per_byte: u64,
    // Logical admission order, used as a deterministic tiebreak
    pub arrival_seq: u64,
}

impl PartialEq for TxSelectorEntry {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for TxSelectorEntry {}

// Deterministic priority: higher fee per byte first, then earlier
// arrival, then lower id. Every node selecting from the same pool state
// produces the same order.
fn compare_tx_priority(a: &TxSelectorEntry, b: &TxSelectorEntry) -> Ordering {
    a.fee_per_byte
        .cmp(&b.fee_per_byte)
        .then_with(|| b.arrival_seq.cmp(&a.arrival_seq))
        .then_with(|| b.hash.cmp(&a.hash))
}

// Transactions of a single sender, ascending by nonce. The group's
// priority is its head entry: within a sender, nonce order is mandatory.
#[derive(PartialEq, Eq)]
struct Transactions(VecDeque<TxSelectorEntry>);

impl PartialOrd for Transactions {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Transactions {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0.front(), other.0.front()) {
            (Some(a), Some(b)) => compare_tx_priority(a, b),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        }
    }
}

// Selects transactions for a block: sub groups per sender ordered by
// nonce, joined in a queue ordered by the head fee per byte.
pub struct TxSelector {
    queue: BinaryHeap<Transactions>,
}

impl TxSelector {
    // Create a TxSelector from a list of per-sender groups
    pub fn grouped<I>(groups: I) -> Self
    where
        I: Iterator<Item = Vec<TxSelectorEntry>>,
    {
        let mut queue = BinaryHeap::new();
        queue.extend(groups.map(|v| Transactions(VecDeque::from(v))));

        Self { queue }
    }

    // Create a TxSelector from a flat list of entries
    pub fn new<I>(iter: I) -> Self
    where
        I: Iterator<Item = TxSelectorEntry>,
    {
        let mut groups: HashMap<Address, Vec<TxSelectorEntry>> = HashMap::new();

        for entry in iter {
            let sender = entry.tx.get_sender().to_address();
            match groups.entry(sender) {
                Entry::Occupied(mut e) => {
                    e.get_mut().push(entry);
                }
                Entry::Vacant(e) => {
                    e.insert(vec![entry]);
                }
            }
        }

        // Order each group by nonces and push it to the queue
        let iter = groups.into_values().map(|mut v| {
            v.sort_by(|a, b| a.tx.get_nonce().cmp(&b.tx.get_nonce()));
            v
        });
        Self::grouped(iter)
    }

    // Get the next entry with the highest priority
    pub fn next(&mut self) -> Option<TxSelectorEntry> {
        // get the group with the highest priority head
        let mut group = self.queue.pop()?;
        let entry = group.0.pop_front()?;

        // if its not empty, push it back to the queue
        if !group.0.is_empty() {
            self.queue.push(group);
        }

        Some(entry)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
