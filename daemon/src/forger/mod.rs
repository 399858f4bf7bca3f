mod hash_onion;

pub use hash_onion::{verify_reveal, HashOnion};

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use log::{debug, info, trace, warn};
use thiserror::Error;
use tokio::{
    sync::Mutex,
    time::{interval, Duration},
};

use atoll_common::{
    block::BlockAsset,
    config::{DelegateConfig, ForgingConfig},
    crypto::{cipher, cipher::CipherError, Address, CryptoError, Hash, Hashable, KeyPair, HASH_SIZE},
    time::get_current_time_in_seconds,
};

use crate::{
    config::FORGE_INTERVAL_MILLIS,
    core::{
        blockchain::{BlockOrigin, Blockchain},
        error::BlockchainError,
        storage::Storage,
    },
};

#[derive(Debug, Error)]
pub enum ForgerError {
    #[error("Invalid forging configuration: {0}")]
    InvalidConfig(String),

    #[error("No forging configuration for delegate {0}")]
    UnknownDelegate(Address),

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("Decrypted key does not belong to delegate {0}")]
    KeyMismatch(Address),

    #[error("Invalid hex in forging configuration for {0}")]
    InvalidHex(Address),

    #[error("Hash onion exhausted for delegate {0}")]
    OnionExhausted(Address),

    #[error("Hash onion layer for round {round} at or below the used index {used}")]
    OnionReused { round: u64, used: u64 },

    #[error(transparent)]
    Chain(#[from] BlockchainError),
}

// Key material of an unlocked delegate; lives only in this heap region
// and is zeroized when forging is disabled
struct UnlockedDelegate {
    keypair: KeyPair,
    onion: HashOnion,
}

// Produces blocks during slots assigned to locally unlocked delegates.
// One cooperative tick per FORGE_INTERVAL_MILLIS; every skip condition
// short-circuits before any key is touched.
pub struct Forger<S: Storage> {
    blockchain: Arc<Blockchain<S>>,
    config: ForgingConfig,
    sync_active: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    keys: Mutex<HashMap<Address, UnlockedDelegate>>,
    last_forged_slot: AtomicU64,
}

impl<S: Storage> Forger<S> {
    pub fn new(
        blockchain: Arc<Blockchain<S>>,
        config: ForgingConfig,
        sync_active: Arc<AtomicBool>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, ForgerError> {
        // hard boot invariant: waiting longer than a slot would mean
        // never forging at all
        let block_time = blockchain.get_config().block_time;
        if config.wait_threshold >= block_time {
            return Err(ForgerError::InvalidConfig(format!(
                "wait_threshold {} must be below block_time {}",
                config.wait_threshold, block_time
            )));
        }

        Ok(Self {
            blockchain,
            config,
            sync_active,
            shutdown,
            keys: Mutex::new(HashMap::new()),
            last_forged_slot: AtomicU64::new(u64::MAX),
        })
    }

    fn delegate_config(&self, address: &Address) -> Result<&DelegateConfig, ForgerError> {
        self.config
            .delegates
            .iter()
            .find(|d| d.address == *address)
            .ok_or(ForgerError::UnknownDelegate(*address))
    }

    // Decrypt and hold (or wipe) a delegate's key material.
    // Returns the resulting forging flag.
    pub async fn update_forging_status(
        &self,
        address: Address,
        password: &str,
        forging: bool,
    ) -> Result<bool, ForgerError> {
        if !forging {
            if self.keys.lock().await.remove(&address).is_some() {
                info!("forging disabled for {}", address);
            }
            return Ok(false);
        }

        let delegate = self.delegate_config(&address)?;
        let passphrase_blob = hex::decode(&delegate.encrypted_passphrase)
            .map_err(|_| ForgerError::InvalidHex(address))?;
        let secret = cipher::decrypt(password, &passphrase_blob)?;
        let keypair = KeyPair::from_slice(&secret)?;
        if keypair.get_address() != address {
            return Err(ForgerError::KeyMismatch(address));
        }

        let seed_blob = hex::decode(&delegate.hash_onion.encrypted_seed)
            .map_err(|_| ForgerError::InvalidHex(address))?;
        let seed_bytes = cipher::decrypt(password, &seed_blob)?;
        let seed: [u8; HASH_SIZE] = seed_bytes
            .as_slice()
            .try_into()
            .map_err(|_| ForgerError::InvalidHex(address))?;
        let onion = HashOnion::new(seed, delegate.hash_onion.count);

        self.keys
            .lock()
            .await
            .insert(address, UnlockedDelegate { keypair, onion });
        info!("forging enabled for {}", address);
        Ok(true)
    }

    // Unlock every configured delegate with one password; boot helper
    // for forging.force / default_password setups
    pub async fn enable_all(&self, password: &str) {
        let addresses: Vec<Address> = self.config.delegates.iter().map(|d| d.address).collect();
        for address in addresses {
            if let Err(err) = self.update_forging_status(address, password, true).await {
                warn!("could not enable forging for {}: {}", address, err);
            }
        }
    }

    pub async fn is_forging(&self, address: &Address) -> bool {
        self.keys.lock().await.contains_key(address)
    }

    pub async fn forging_statuses(&self) -> Vec<(Address, bool)> {
        let keys = self.keys.lock().await;
        self.config
            .delegates
            .iter()
            .map(|d| (d.address, keys.contains_key(&d.address)))
            .collect()
    }

    // The scheduling loop; returns at shutdown
    pub async fn run(&self) {
        let mut ticker = interval(Duration::from_millis(FORGE_INTERVAL_MILLIS));
        loop {
            ticker.tick().await;
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            match self.forge_once().await {
                Ok(Some(id)) => debug!("forged block {}", id),
                Ok(None) => {}
                Err(err) => warn!("forge tick failed: {}", err),
            }
        }
    }

    // One tick: if a locally unlocked delegate owns the current slot and
    // the policy gates pass, build, sign and process a block.
    pub async fn forge_once(&self) -> Result<Option<Hash>, ForgerError> {
        if self.sync_active.load(Ordering::SeqCst) {
            trace!("synchronizer active, skipping forge tick");
            return Ok(None);
        }

        let slots = *self.blockchain.get_slots();
        let now = get_current_time_in_seconds();
        let slot = slots.slot_for_timestamp(now);
        if self.last_forged_slot.load(Ordering::SeqCst) == slot {
            return Ok(None);
        }

        let validators = self.blockchain.get_validators().await;
        if validators.is_empty() {
            return Ok(None);
        }

        let forger_address = validators[slots.forger_index(slot) % validators.len()];
        let keys = self.keys.lock().await;
        if !keys.contains_key(&forger_address) {
            return Ok(None);
        }

        // wait for transactions early in the slot unless forced
        let into_slot = now.saturating_sub(slots.slot_start(slot));
        if !self.config.force
            && into_slot < self.config.wait_threshold
            && self.blockchain.mempool_len().await == 0
        {
            trace!("waiting for transactions, {}s into slot {}", into_slot, slot);
            return Ok(None);
        }

        let height = self.blockchain.get_height().await + 1;
        let round = slots.round_for_height(height);

        // the onion layer for this round must never have been consumed,
        // not even by a previous run of this process
        let used = self
            .blockchain
            .get_used_onion_index(&forger_address)
            .await?;
        if let Some(used) = used {
            if round <= used {
                drop(keys);
                self.disable_after_key_error(&forger_address).await;
                return Err(ForgerError::OnionReused { round, used });
            }
        }

        let delegate = keys
            .get(&forger_address)
            .expect("checked above");
        let Some(reveal) = delegate.onion.reveal_for_round(round) else {
            drop(keys);
            self.disable_after_key_error(&forger_address).await;
            return Err(ForgerError::OnionExhausted(forger_address));
        };

        // record the consumed layer before any signature exists
        self.blockchain
            .set_used_onion_index(&forger_address, round)
            .await?;

        let asset = BlockAsset::new(
            self.blockchain.get_last_forged_height(&forger_address).await,
            self.blockchain.get_prevoted_height().await,
            reveal,
        );

        let template = self
            .blockchain
            .create_block_template(delegate.keypair.get_public_key().clone(), now, asset)
            .await?;

        let (header, txs) = template.split();
        let mut header = header.into_owned();
        header.sign(&delegate.keypair);
        let block = atoll_common::block::Block::new(
            atoll_common::immutable::Immutable::Owned(header),
            txs,
        );
        drop(keys);

        let id = block.hash();
        self.last_forged_slot.store(slot, Ordering::SeqCst);
        self.blockchain.process(block, BlockOrigin::Local).await?;
        info!("forged and applied block {} at height {}", id, height);
        Ok(Some(id))
    }

    // KeyError semantics: the delegate stops forging, the node keeps going
    async fn disable_after_key_error(&self, address: &Address) {
        warn!("disabling forging for {} after key error", address);
        self.keys.lock().await.remove(address);
    }
}
