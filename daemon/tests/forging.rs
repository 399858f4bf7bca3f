// Forger scenarios: slot-gated production, refusal while the
// synchronizer is active, and the hash onion refusing re-used layers
// across process restarts.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use atoll_common::{
    config::{
        DelegateConfig, ForgingConfig, GenesisConfig, GenesisDelegate, HashOnionConfig,
        RewardSchedule,
    },
    crypto::{cipher, KeyPair},
    time::get_current_time_in_seconds,
};
use atoll_daemon::{
    core::{blockchain::Blockchain, storage::SledStorage},
    events::EventBus,
    forger::{Forger, ForgerError},
};

const PASSWORD: &str = "correct horse battery staple";

// Slots ten minutes wide so a test never straddles a boundary
const BLOCK_TIME: u64 = 600;

fn delegate_keys() -> Vec<KeyPair> {
    (0..3)
        .map(|i| KeyPair::from_secret_bytes([i as u8 + 50; 32]))
        .collect()
}

fn genesis_config(keys: &[KeyPair]) -> GenesisConfig {
    GenesisConfig {
        block_time: BLOCK_TIME,
        bft_threshold: 3,
        active_delegates: keys.len() as u32,
        max_payload_length: 15 * 1024,
        min_fee_per_byte: 0,
        base_fees: Vec::new(),
        rewards: RewardSchedule {
            milestones: Vec::new(),
            offset: 0,
            distance: 0,
        },
        genesis_timestamp: get_current_time_in_seconds() - 100 * BLOCK_TIME,
        initial_accounts: Vec::new(),
        initial_delegates: keys
            .iter()
            .enumerate()
            .map(|(i, k)| GenesisDelegate {
                username: format!("genesis_{}", i),
                public_key: k.get_public_key().clone(),
            })
            .collect(),
    }
}

fn forging_config(keys: &[KeyPair], wait_threshold: u64) -> ForgingConfig {
    ForgingConfig {
        wait_threshold,
        force: true,
        default_password: Some(PASSWORD.to_string()),
        delegates: keys
            .iter()
            .map(|k| DelegateConfig {
                address: k.get_address(),
                encrypted_passphrase: hex::encode(
                    cipher::encrypt(PASSWORD, k.secret_bytes()).unwrap(),
                ),
                hash_onion: HashOnionConfig {
                    count: 1_000,
                    encrypted_seed: hex::encode(
                        cipher::encrypt(PASSWORD, &[7u8; 32]).unwrap(),
                    ),
                },
            })
            .collect(),
    }
}

async fn new_chain(keys: &[KeyPair]) -> Arc<Blockchain<SledStorage>> {
    let storage = SledStorage::temporary().unwrap();
    Blockchain::new(storage, genesis_config(keys), EventBus::new())
        .await
        .unwrap()
}

fn new_forger(
    chain: &Arc<Blockchain<SledStorage>>,
    keys: &[KeyPair],
    sync_active: Arc<AtomicBool>,
) -> Forger<SledStorage> {
    Forger::new(
        chain.clone(),
        forging_config(keys, 2),
        sync_active,
        Arc::new(AtomicBool::new(false)),
    )
    .unwrap()
}

#[tokio::test]
async fn test_wait_threshold_must_fit_in_slot() {
    let keys = delegate_keys();
    let chain = new_chain(&keys).await;
    let result = Forger::new(
        chain,
        forging_config(&keys, BLOCK_TIME),
        Arc::new(AtomicBool::new(false)),
        Arc::new(AtomicBool::new(false)),
    );
    assert!(matches!(result, Err(ForgerError::InvalidConfig(_))));
}

#[tokio::test]
async fn test_unlock_requires_the_right_password() {
    let keys = delegate_keys();
    let chain = new_chain(&keys).await;
    let forger = new_forger(&chain, &keys, Arc::new(AtomicBool::new(false)));
    let address = keys[0].get_address();

    assert!(matches!(
        forger.update_forging_status(address, "wrong", true).await,
        Err(ForgerError::Cipher(_))
    ));
    assert!(!forger.is_forging(&address).await);

    assert!(forger
        .update_forging_status(address, PASSWORD, true)
        .await
        .unwrap());
    assert!(forger.is_forging(&address).await);

    // disabling wipes the key material
    assert!(!forger
        .update_forging_status(address, PASSWORD, false)
        .await
        .unwrap());
    assert!(!forger.is_forging(&address).await);
}

#[tokio::test]
async fn test_unknown_delegate_rejected() {
    let keys = delegate_keys();
    let chain = new_chain(&keys).await;
    let forger = new_forger(&chain, &keys, Arc::new(AtomicBool::new(false)));

    let stranger = KeyPair::from_secret_bytes([99u8; 32]);
    assert!(matches!(
        forger
            .update_forging_status(stranger.get_address(), PASSWORD, true)
            .await,
        Err(ForgerError::UnknownDelegate(_))
    ));
}

#[tokio::test]
async fn test_forge_tick_is_noop_while_syncing() {
    let keys = delegate_keys();
    let chain = new_chain(&keys).await;
    let sync_active = Arc::new(AtomicBool::new(false));
    let forger = new_forger(&chain, &keys, sync_active.clone());
    forger.enable_all(PASSWORD).await;

    // even inside the local delegate's slot, a tick under sync does nothing
    sync_active.store(true, Ordering::SeqCst);
    assert!(forger.forge_once().await.unwrap().is_none());
    assert_eq!(chain.get_height().await, 0);

    // released: the same tick forges
    sync_active.store(false, Ordering::SeqCst);
    let forged = forger.forge_once().await.unwrap();
    assert!(forged.is_some());
    assert_eq!(chain.get_height().await, 1);
}

#[tokio::test]
async fn test_onion_layer_never_reused_across_restarts() {
    let keys = delegate_keys();
    let chain = new_chain(&keys).await;

    let forger = new_forger(&chain, &keys, Arc::new(AtomicBool::new(false)));
    forger.enable_all(PASSWORD).await;
    forger.forge_once().await.unwrap().expect("first forge");
    assert_eq!(chain.get_height().await, 1);

    // the consumed layer index was persisted before signing
    let tip = chain.get_tip_header().await;
    let generator = tip.generator_public_key.to_address();
    let used = chain.get_used_onion_index(&generator).await.unwrap();
    assert_eq!(used, Some(1));

    // a fresh forger over the same storage simulates a restart; height 2
    // still falls in round 1, so forging again would re-reveal layer 1
    drop(forger);
    let restarted = new_forger(&chain, &keys, Arc::new(AtomicBool::new(false)));
    restarted.enable_all(PASSWORD).await;

    let result = restarted.forge_once().await;
    assert!(matches!(
        result,
        Err(ForgerError::OnionReused { round: 1, used: 1 })
    ));

    // the delegate was taken out of forging, the node keeps running
    assert!(!restarted.is_forging(&generator).await);
    assert_eq!(chain.get_height().await, 1);
}
