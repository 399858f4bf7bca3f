// End-to-end scenarios over the public node API: forging, fork
// handling, finality and synchronization against a scripted peer chain.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use tokio::sync::Mutex;

use atoll_common::{
    account::Account,
    block::{Block, BlockAsset},
    config::{GenesisAccount, GenesisConfig, GenesisDelegate, RewardSchedule, COIN_VALUE},
    crypto::{Address, Hash, Hashable, KeyPair},
    immutable::Immutable,
    time::get_current_time_in_seconds,
    transaction::{Transaction, TransactionAsset},
};
use atoll_daemon::{
    core::{
        blockchain::{BlockOrigin, Blockchain},
        error::{BlockchainError, ForkError},
        storage::SledStorage,
    },
    events::{Event, EventBus},
    p2p::{CommonBlock, P2pError, PeerId, PeerInfo, PeerNetwork, Transport},
    sync::Synchronizer,
};

fn delegate_keys(count: usize) -> Vec<KeyPair> {
    (0..count)
        .map(|i| KeyPair::from_secret_bytes([i as u8 + 1; 32]))
        .collect()
}

fn test_genesis(
    keys: &[KeyPair],
    bft_threshold: u32,
    block_time: u64,
    funded: Vec<(Address, u64)>,
) -> GenesisConfig {
    GenesisConfig {
        block_time,
        bft_threshold,
        active_delegates: keys.len() as u32,
        max_payload_length: 15 * 1024,
        min_fee_per_byte: 0,
        base_fees: Vec::new(),
        rewards: RewardSchedule {
            milestones: Vec::new(),
            offset: 0,
            distance: 0,
        },
        // far enough in the past for thousands of slots
        genesis_timestamp: get_current_time_in_seconds() - 100_000 * block_time,
        initial_accounts: funded
            .into_iter()
            .map(|(address, balance)| GenesisAccount { address, balance })
            .collect(),
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

async fn new_chain(config: GenesisConfig) -> Arc<Blockchain<SledStorage>> {
    let storage = SledStorage::temporary().unwrap();
    Blockchain::new(storage, config, EventBus::new())
        .await
        .unwrap()
}

// Build and sign the next block. `slot_shift` must be a multiple of the
// delegate count so the slot-to-forger mapping stays aligned with the
// height; two shifts produce two distinct sibling chains.
async fn forge_next(
    chain: &Arc<Blockchain<SledStorage>>,
    keys: &[KeyPair],
    slot_shift: u64,
    seed_byte: u8,
) -> Block {
    let tip = chain.get_tip_header().await;
    let height = tip.height + 1;
    let slots = *chain.get_slots();
    let slot = height + slot_shift;
    let timestamp = slots.slot_start(slot);

    let validators = chain.get_validators().await;
    let expected = validators[slots.forger_index(slot)];
    let keypair = keys
        .iter()
        .find(|k| k.get_address() == expected)
        .expect("test controls every delegate");

    let asset = BlockAsset::new(
        chain.get_last_forged_height(&expected).await,
        chain.get_prevoted_height().await,
        [seed_byte; 32],
    );
    let template = chain
        .create_block_template(keypair.get_public_key().clone(), timestamp, asset)
        .await
        .unwrap();

    let (header, txs) = template.split();
    let mut header = header.into_owned();
    header.sign(keypair);
    Block::new(Immutable::Owned(header), txs)
}

async fn forge_and_apply(
    chain: &Arc<Blockchain<SledStorage>>,
    keys: &[KeyPair],
    count: u64,
) {
    for _ in 0..count {
        let block = forge_next(chain, keys, 0, 0).await;
        chain.process(block, BlockOrigin::Local).await.unwrap();
    }
}

// Scripted peer network: serves another node's chain and records the
// penalties the transport applies.
struct MockNetwork {
    remote: Arc<Blockchain<SledStorage>>,
    penalties: Mutex<Vec<(PeerId, u32)>>,
}

impl MockNetwork {
    fn new(remote: Arc<Blockchain<SledStorage>>) -> Self {
        Self {
            remote,
            penalties: Mutex::new(Vec::new()),
        }
    }

    async fn recorded_penalties(&self) -> Vec<(PeerId, u32)> {
        self.penalties.lock().await.clone()
    }
}

#[async_trait]
impl PeerNetwork for MockNetwork {
    async fn get_connected_peers(&self) -> Vec<PeerInfo> {
        let height = self.remote.get_height().await;
        let prevoted = self.remote.get_prevoted_height().await;
        let tip_id = self.remote.get_tip_id().await;
        (1..=3)
            .map(|peer_id| PeerInfo {
                peer_id,
                height,
                max_height_prevoted: prevoted,
                tip_id: tip_id.clone(),
                network_version: "1.0".into(),
            })
            .collect()
    }

    async fn request_blocks_from_id(
        &self,
        _peer: PeerId,
        from: &Hash,
    ) -> Result<Vec<Block>, P2pError> {
        self.remote
            .get_blocks_from(from, 34)
            .await
            .map_err(|_| P2pError::MalformedResponse(0))
    }

    async fn request_highest_common_block(
        &self,
        _peer: PeerId,
        ids: &[Hash],
    ) -> Result<Option<CommonBlock>, P2pError> {
        let common = self
            .remote
            .find_highest_common_block(ids)
            .await
            .map_err(|_| P2pError::MalformedResponse(0))?;
        Ok(common.map(|(id, height)| CommonBlock { id, height }))
    }

    async fn request_transactions(
        &self,
        _peer: PeerId,
        _ids: &[Hash],
    ) -> Result<Vec<Transaction>, P2pError> {
        Ok(Vec::new())
    }

    async fn broadcast_block(&self, _block: &Block) {}

    async fn announce_transactions(&self, _ids: &[Hash]) {}

    async fn apply_penalty(&self, peer: PeerId, points: u32) {
        self.penalties.lock().await.push((peer, points));
    }
}

#[tokio::test]
async fn test_happy_path_three_blocks() {
    let keys = delegate_keys(3);
    // threshold equal to the delegate count: three blocks are not enough
    // to finalize anything
    let chain = new_chain(test_genesis(&keys, 3, 10, Vec::new())).await;
    let mut events = chain.get_events().subscribe();

    forge_and_apply(&chain, &keys, 3).await;

    assert_eq!(chain.get_height().await, 3);
    assert_eq!(chain.get_finalized_height().await, 0);
    assert_eq!(chain.mempool_len().await, 0);

    // observers see NewBlock 1, 2, 3 in order
    let mut new_block_heights = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let Event::NewBlock { block, .. } = event {
            new_block_heights.push(block.get_header().height);
        }
    }
    assert_eq!(new_block_heights, vec![1, 2, 3]);

    // heights form a contiguous ascending run
    for height in 0..=3 {
        assert!(chain.get_block_by_height(height).await.unwrap().is_some());
    }
}

#[tokio::test]
async fn test_transfer_apply_then_delete_is_identity() {
    let keys = delegate_keys(3);
    let sender = KeyPair::from_secret_bytes([200u8; 32]);
    let funded = vec![(sender.get_address(), 1_000 * COIN_VALUE)];
    let chain = new_chain(test_genesis(&keys, 3, 10, funded)).await;

    let recipient = Address::new([77u8; 20]);
    let tx = Transaction::create(
        &sender,
        0,
        10_000,
        TransactionAsset::Transfer {
            recipient,
            amount: 5 * COIN_VALUE,
            data: Vec::new(),
        },
    );
    let tx_id = tx.id();
    chain.add_transaction(tx).await.unwrap();
    assert_eq!(chain.mempool_len().await, 1);

    // the forged block picks the transaction up
    forge_and_apply(&chain, &keys, 1).await;
    assert_eq!(chain.mempool_len().await, 0);

    let sender_account = chain.get_account(&sender.get_address()).await.unwrap().unwrap();
    assert_eq!(sender_account.nonce, 1);
    assert_eq!(sender_account.balance, 1_000 * COIN_VALUE - 5 * COIN_VALUE - 10_000);
    let recipient_account = chain.get_account(&recipient).await.unwrap().unwrap();
    assert_eq!(recipient_account.balance, 5 * COIN_VALUE);

    // deleting the block restores the pre-block state exactly
    chain.delete_last_block().await.unwrap();
    assert_eq!(chain.get_height().await, 0);

    let sender_account = chain.get_account(&sender.get_address()).await.unwrap().unwrap();
    assert_eq!(sender_account.nonce, 0);
    assert_eq!(sender_account.balance, 1_000 * COIN_VALUE);
    assert!(chain.get_account(&recipient).await.unwrap().is_none());

    // and the transaction is back in the pool
    assert!(chain.mempool_contains(&tx_id).await);
}

#[tokio::test]
async fn test_same_height_fork_discard_and_replace() {
    let keys = delegate_keys(3);
    let chain = new_chain(test_genesis(&keys, 3, 10, Vec::new())).await;

    forge_and_apply(&chain, &keys, 4).await;

    // two siblings for height 5 from the same delegate and slot; the
    // challenger declares a higher prevote and wins the tiebreak
    let local = forge_next(&chain, &keys, 0, 1).await;
    let mut challenger_header = local.get_header().clone();
    challenger_header.asset.max_height_prevoted += 1;
    let generator = challenger_header.generator_public_key.clone();
    let keypair = keys
        .iter()
        .find(|k| k.get_public_key() == &generator)
        .unwrap();
    challenger_header.sign(keypair);
    let challenger = Block::new(Immutable::Owned(challenger_header), Vec::new());
    let challenger_id = challenger.hash();

    chain.process(local.clone(), BlockOrigin::Local).await.unwrap();
    let local_id = local.hash();
    assert_eq!(chain.get_tip_id().await, local_id);

    let mut events = chain.get_events().subscribe();
    chain
        .process(challenger, BlockOrigin::Peer(9))
        .await
        .unwrap();

    assert_eq!(chain.get_height().await, 5);
    assert_eq!(chain.get_tip_id().await, challenger_id);

    // DeleteBlock for the loser, then NewBlock for the winner
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            Event::DeleteBlock { id, .. } => seen.push(("delete", id)),
            Event::NewBlock { id, .. } => seen.push(("new", id)),
            _ => {}
        }
    }
    assert_eq!(seen, vec![("delete", local_id), ("new", challenger_id)]);
}

#[tokio::test]
async fn test_losing_same_height_candidate_is_stale() {
    let keys = delegate_keys(3);
    let chain = new_chain(test_genesis(&keys, 3, 10, Vec::new())).await;

    forge_and_apply(&chain, &keys, 2).await;

    let winner = forge_next(&chain, &keys, 0, 1).await;
    let mut loser_header = winner.get_header().clone();
    // same declared prevote, the id decides; craft the loser by seed
    loser_header.asset.seed_reveal = [9u8; 32];
    let keypair = keys
        .iter()
        .find(|k| k.get_public_key() == &loser_header.generator_public_key)
        .unwrap();
    loser_header.sign(keypair);
    let loser = Block::new(Immutable::Owned(loser_header), Vec::new());

    // order the two so the stored one wins the tiebreak
    let (first, second) = if winner.hash() < loser.hash() {
        (winner, loser)
    } else {
        (loser, winner)
    };

    chain.process(first.clone(), BlockOrigin::Local).await.unwrap();
    let result = chain.process(second, BlockOrigin::Peer(4)).await;
    assert!(matches!(result, Err(BlockchainError::StaleBlock { .. })));
    assert_eq!(chain.get_tip_id().await, first.hash());
}

#[tokio::test]
async fn test_deep_fork_below_finality_penalized() {
    let keys = delegate_keys(3);
    let chain = new_chain(test_genesis(&keys, 2, 10, Vec::new())).await;

    forge_and_apply(&chain, &keys, 10).await;
    let finalized = chain.get_finalized_height().await;
    assert!(finalized >= 7, "finality should have advanced, got {}", finalized);

    // a syntactically valid block below the finalized line
    let slots = *chain.get_slots();
    let validators = chain.get_validators().await;
    let height = finalized - 1;
    let expected = validators[slots.forger_index(height)];
    let keypair = keys.iter().find(|k| k.get_address() == expected).unwrap();
    let asset = BlockAsset::new(height - 1, 0, [8u8; 32]);
    let mut header = atoll_common::block::BlockHeader::new(
        atoll_common::block::BLOCK_VERSION,
        height,
        slots.slot_start(height) as u32,
        atoll_common::crypto::hash(b"some other chain"),
        keypair.get_public_key().clone(),
        Hash::zero(),
        asset,
    );
    header.sign(keypair);
    let fork_block = Block::new(Immutable::Owned(header), Vec::new());

    let tip_before = chain.get_tip_id().await;

    // through the transport: the peer is penalized with 100
    let remote = new_chain(test_genesis(&keys, 2, 10, Vec::new())).await;
    let network = Arc::new(MockNetwork::new(remote));
    let transport = Transport::new(
        chain.clone(),
        network.clone(),
        Arc::new(AtomicBool::new(false)),
    );
    transport.handle_post_block(42, fork_block.clone()).await;

    assert_eq!(network.recorded_penalties().await, vec![(42, 100)]);
    assert_eq!(chain.get_tip_id().await, tip_before);
    assert_eq!(chain.get_finalized_height().await, finalized);

    // the raw processor error is the irrecoverable fork
    let result = chain.process(fork_block, BlockOrigin::Peer(42)).await;
    assert!(matches!(
        result,
        Err(BlockchainError::Fork(ForkError::Irrecoverable { .. }))
    ));
}

#[tokio::test]
async fn test_block_sync_catch_up() {
    let keys = delegate_keys(3);
    let config = test_genesis(&keys, 2, 10, Vec::new());

    let local = new_chain(config.clone()).await;
    let remote = new_chain(config).await;

    // shared prefix up to height 99
    for _ in 0..99 {
        let block = forge_next(&local, &keys, 0, 0).await;
        remote
            .process(block.clone(), BlockOrigin::Peer(1))
            .await
            .unwrap();
        local.process(block, BlockOrigin::Local).await.unwrap();
    }
    assert_eq!(local.get_tip_id().await, remote.get_tip_id().await);

    // the chains diverge at height 100: different slots, different blocks
    let local_fork = forge_next(&local, &keys, 0, 1).await;
    local.process(local_fork, BlockOrigin::Local).await.unwrap();
    for _ in 0..101 {
        let block = forge_next(&remote, &keys, 3, 2).await;
        remote.process(block, BlockOrigin::Local).await.unwrap();
    }
    assert_eq!(local.get_height().await, 100);
    assert_eq!(remote.get_height().await, 200);

    let finalized_before = local.get_finalized_height().await;

    // the remote tip block triggers synchronization
    let trigger = remote
        .get_block_by_height(200)
        .await
        .unwrap()
        .expect("remote tip exists");

    let network = Arc::new(MockNetwork::new(remote.clone()));
    let sync_active = Arc::new(AtomicBool::new(false));
    let synchronizer = Synchronizer::new(
        local.clone(),
        network.clone(),
        sync_active.clone(),
        Arc::new(AtomicBool::new(false)),
    );

    synchronizer.handle_sync_required(&trigger, 1).await;

    assert_eq!(local.get_height().await, 200);
    assert_eq!(local.get_tip_id().await, remote.get_tip_id().await);
    // finality only ever moved forward
    assert!(local.get_finalized_height().await >= finalized_before);
    assert!(!sync_active.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_sync_refuses_to_cross_finalized_line() {
    let keys = delegate_keys(3);
    let config = test_genesis(&keys, 2, 10, Vec::new());

    let local = new_chain(config.clone()).await;
    let remote = new_chain(config).await;

    // short shared prefix, then a long divergence: the common block ends
    // up far below the local finalized height
    for _ in 0..3 {
        let block = forge_next(&local, &keys, 0, 0).await;
        remote
            .process(block.clone(), BlockOrigin::Peer(1))
            .await
            .unwrap();
        local.process(block, BlockOrigin::Local).await.unwrap();
    }

    for _ in 0..50 {
        let block = forge_next(&local, &keys, 0, 1).await;
        local.process(block, BlockOrigin::Local).await.unwrap();
    }
    for _ in 0..60 {
        let block = forge_next(&remote, &keys, 3, 2).await;
        remote.process(block, BlockOrigin::Local).await.unwrap();
    }

    let finalized = local.get_finalized_height().await;
    assert!(finalized > 3);
    let height_before = local.get_height().await;

    let trigger = remote.get_block_by_height(63).await.unwrap().unwrap();
    let network = Arc::new(MockNetwork::new(remote.clone()));
    let synchronizer = Synchronizer::new(
        local.clone(),
        network.clone(),
        Arc::new(AtomicBool::new(false)),
        Arc::new(AtomicBool::new(false)),
    );

    synchronizer.handle_sync_required(&trigger, 1).await;

    // the sync aborted without touching finalized history and the peer
    // was penalized for the irrecoverable fork
    assert_eq!(local.get_finalized_height().await, finalized);
    assert!(local.get_height().await >= finalized);
    assert!(local.get_height().await <= height_before);
    assert!(network
        .recorded_penalties()
        .await
        .iter()
        .any(|(peer, points)| *peer == 1 && *points == 100));
}

#[tokio::test]
async fn test_vote_changes_validator_ranking() {
    let keys = delegate_keys(3);
    let voter = KeyPair::from_secret_bytes([210u8; 32]);
    let funded = vec![(voter.get_address(), 10_000 * COIN_VALUE)];
    let chain = new_chain(test_genesis(&keys, 3, 10, funded)).await;

    // vote the last-ranked delegate to the top
    let validators_before = chain.get_validators().await;
    let favourite = *validators_before.last().unwrap();
    let tx = Transaction::create(
        &voter,
        0,
        10_000,
        TransactionAsset::VoteDelegate {
            votes: vec![atoll_common::transaction::Vote {
                delegate: favourite,
                amount: 100 * COIN_VALUE as i64,
            }],
        },
    );
    chain.add_transaction(tx).await.unwrap();

    // one full round so the set rotates
    forge_and_apply(&chain, &keys, 3).await;

    let validators_after = chain.get_validators().await;
    assert_eq!(validators_after.first(), Some(&favourite));

    let voter_account = chain.get_account(&voter.get_address()).await.unwrap().unwrap();
    assert_eq!(voter_account.locked_amount(), 100 * COIN_VALUE);

    let delegate_account = chain.get_account(&favourite).await.unwrap().unwrap();
    assert_eq!(
        delegate_account.delegate.unwrap().total_votes_received,
        100 * COIN_VALUE
    );
}

#[tokio::test]
async fn test_genesis_mismatch_on_reopen() {
    let keys = delegate_keys(3);
    let dir = tempdir::TempDir::new("atoll-genesis").unwrap();

    let config_a = test_genesis(&keys, 3, 10, Vec::new());
    {
        let storage = SledStorage::open(dir.path()).unwrap();
        let chain = Blockchain::new(storage, config_a.clone(), EventBus::new())
            .await
            .unwrap();
        chain.flush().await.unwrap();
    }

    // a different genesis timestamp yields a different genesis id
    let mut config_b = config_a;
    config_b.genesis_timestamp += 10;
    let storage = SledStorage::open(dir.path()).unwrap();
    let result = Blockchain::new(storage, config_b, EventBus::new()).await;
    assert!(matches!(
        result,
        Err(BlockchainError::GenesisMismatch { .. })
    ));
}

#[tokio::test]
async fn test_account_state_is_fold_of_payloads() {
    // the same payload sequence applied on two nodes yields identical
    // account state
    let keys = delegate_keys(3);
    let sender = KeyPair::from_secret_bytes([220u8; 32]);
    let funded = vec![(sender.get_address(), 100 * COIN_VALUE)];
    let config = test_genesis(&keys, 3, 10, funded);

    let a = new_chain(config.clone()).await;
    let b = new_chain(config).await;

    for nonce in 0..3u64 {
        let tx = Transaction::create(
            &sender,
            nonce,
            1_000,
            TransactionAsset::Transfer {
                recipient: Address::new([90u8; 20]),
                amount: COIN_VALUE,
                data: Vec::new(),
            },
        );
        a.add_transaction(tx).await.unwrap();
        let block = forge_next(&a, &keys, 0, 0).await;
        b.process(block.clone(), BlockOrigin::Peer(1)).await.unwrap();
        a.process(block, BlockOrigin::Local).await.unwrap();
    }

    let on_a: Account = a.get_account(&sender.get_address()).await.unwrap().unwrap();
    let on_b: Account = b.get_account(&sender.get_address()).await.unwrap().unwrap();
    assert_eq!(on_a, on_b);
    assert_eq!(on_a.nonce, 3);
    assert_eq!(a.get_tip_id().await, b.get_tip_id().await);
}
