use std::sync::Arc;

use log::{debug, error, info, trace, warn};
use tokio::sync::RwLock;

use atoll_common::{
    account::{Account, Delegate},
    block::{compute_transaction_root, Block, BlockAsset, BlockHeader, BLOCK_VERSION},
    config::GenesisConfig,
    crypto::{Address, Hash, Hashable, PublicKey},
    immutable::Immutable,
    serializer::Serializer,
    time::get_current_time_in_seconds,
    transaction::Transaction,
};

use crate::{
    config::TEMP_REGION_CAPACITY,
    core::{
        bft::{FinalityManager, ValidatorRecord},
        error::{BlockchainError, ForkError},
        mempool::{Mempool, PoolConfig},
        modules::{BlockContext, DposModule, ModuleRegistry, TransactionContext},
        slots::Slots,
        state::{StateStore, UndoJournal},
        storage::{
            keys, AccountProvider, BftProvider, BlockProvider, ChainStateProvider,
            JournalProvider, OnionProvider, Storage, TempBlockProvider, WriteBatch,
        },
    },
    events::{Event, EventBus},
    p2p::PeerId,
};

// Where a block came from; decides penalties and rebroadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOrigin {
    Local,
    Peer(PeerId),
    // Applied by the synchronizer, never rebroadcast
    Sync,
}

// Outcome of the fork choice rule for a received block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForkChoice {
    // Extends the tip, apply it
    Append,
    // Same height, same parent, wins the tiebreak
    DiscardAndReplace,
    // One block ahead on a different parent, small reorganization
    SyncFastSwitch,
    // Far ahead, catch up
    SyncBlockSync,
    // Contradicts a finalized block
    Irrecoverable,
    // Stale or duplicate
    Stale,
}

struct TipState {
    id: Hash,
    header: Arc<BlockHeader>,
}

// What a module contributes to the node schema
#[derive(Debug, Clone)]
pub struct ModuleSchema {
    pub id: u32,
    pub name: &'static str,
    pub account_schema: &'static [&'static str],
    pub transaction_assets: &'static [u32],
}

// Deterministic tiebreak between two same-height candidates: higher
// maxHeightPrevoted wins, then the lower id. Antisymmetric and total.
pub fn tiebreak_wins(candidate: &BlockHeader, current: &BlockHeader) -> bool {
    let candidate_prevoted = candidate.asset.max_height_prevoted;
    let current_prevoted = current.asset.max_height_prevoted;
    if candidate_prevoted != current_prevoted {
        return candidate_prevoted > current_prevoted;
    }

    candidate.id() < current.id()
}

// Build the deterministic genesis block for a configuration
pub fn genesis_block(config: &GenesisConfig) -> Block {
    let header = BlockHeader::new(
        BLOCK_VERSION,
        0,
        config.genesis_timestamp as u32,
        Hash::zero(),
        PublicKey::zero(),
        Hash::zero(),
        BlockAsset::new(0, 0, [0u8; 32]),
    );
    Block::genesis(header)
}

// The serialized gate through which every block must pass. Owns the
// chain state machine: exactly one block apply is in flight at any time,
// enforced by the storage write lock.
pub struct Blockchain<S: Storage> {
    storage: RwLock<S>,
    mempool: RwLock<Mempool>,
    bft: RwLock<FinalityManager>,
    modules: ModuleRegistry<S>,
    config: GenesisConfig,
    slots: Slots,
    events: EventBus,
    tip: RwLock<TipState>,
    validators: RwLock<Arc<Vec<Address>>>,
    genesis_id: Hash,
}

impl<S: Storage> Blockchain<S> {
    // Open the chain over a storage backend. A fresh store is seeded with
    // the genesis block and accounts; an existing store must carry the
    // same genesis or init fails with GenesisMismatch. Blocks parked in
    // the temp region are replayed afterwards.
    pub async fn new(
        storage: S,
        config: GenesisConfig,
        events: EventBus,
    ) -> Result<Arc<Self>, BlockchainError> {
        let genesis = genesis_block(&config);
        let genesis_id = genesis.hash();

        let mut storage = storage;
        match storage.get_tip().await? {
            None => {
                info!("empty chain, writing genesis block {}", genesis_id);
                Self::persist_genesis(&mut storage, &config, &genesis, &genesis_id).await?;
            }
            Some(_) => {
                let stored = storage
                    .get_block_id_at_height(0)
                    .await?
                    .ok_or(BlockchainError::NotInitialized)?;
                if stored != genesis_id {
                    return Err(BlockchainError::GenesisMismatch {
                        stored,
                        supplied: genesis_id,
                    });
                }
            }
        }

        let tip_id = storage.get_tip().await?.ok_or(BlockchainError::NotInitialized)?;
        let tip_block = storage
            .get_block_by_id(&tip_id)
            .await?
            .ok_or_else(|| BlockchainError::BlockNotFound(tip_id.clone()))?;
        info!(
            "chain loaded at height {} (tip {})",
            tip_block.get_header().height, tip_id
        );

        let bft = FinalityManager::load(&storage, config.bft_threshold).await?;
        let validators = match storage
            .get_chain_state(DposModule::validators_state_key())
            .await?
        {
            Some(bytes) => Arc::new(Vec::from_bytes(&bytes)?),
            None => Arc::new(Vec::new()),
        };

        let slots = Slots::new(
            config.genesis_timestamp,
            config.block_time,
            config.round_length(),
        );

        let chain = Arc::new(Self {
            storage: RwLock::new(storage),
            mempool: RwLock::new(Mempool::new(PoolConfig::default())),
            bft: RwLock::new(bft),
            modules: ModuleRegistry::standard(),
            config,
            slots,
            events,
            tip: RwLock::new(TipState {
                id: tip_id,
                header: tip_block.to_header(),
            }),
            validators: RwLock::new(validators),
            genesis_id,
        });

        chain.replay_temp_blocks().await?;
        Ok(chain)
    }

    async fn persist_genesis(
        storage: &mut S,
        config: &GenesisConfig,
        genesis: &Block,
        genesis_id: &Hash,
    ) -> Result<(), BlockchainError> {
        let mut batch = WriteBatch::new();
        batch.put(keys::block_by_id(genesis_id), genesis.to_bytes());
        batch.put(keys::block_by_height(0), genesis_id.as_bytes().to_vec());
        batch.put(keys::TIP.to_vec(), genesis_id.as_bytes().to_vec());
        batch.put(keys::FINALIZED.to_vec(), 0u64.to_bytes());
        batch.put(keys::PREVOTED.to_vec(), 0u64.to_bytes());

        // Delegate accounts, the registry and the initial validator set
        let mut delegate_addresses = Vec::with_capacity(config.initial_delegates.len());
        for delegate in &config.initial_delegates {
            let address = delegate.public_key.to_address();
            let mut account = Account::new(address);
            account.delegate = Some(Delegate {
                username: delegate.username.clone(),
                total_votes_received: 0,
            });
            batch.put(keys::account(&address), account.to_bytes());

            let mut username_key = b"dpos:username:".to_vec();
            username_key.extend_from_slice(delegate.username.as_bytes());
            batch.put(
                keys::chain_state(&username_key),
                address.as_bytes().to_vec(),
            );
            delegate_addresses.push(address);
        }

        batch.put(
            keys::chain_state(DposModule::delegates_state_key()),
            delegate_addresses.to_bytes(),
        );
        batch.put(
            keys::chain_state(DposModule::validators_state_key()),
            delegate_addresses.to_bytes(),
        );

        // Funded genesis accounts; an address that is also a delegate
        // keeps its delegate record
        for funded in &config.initial_accounts {
            let index = delegate_addresses.iter().position(|a| *a == funded.address);
            let mut account = Account::with_balance(funded.address, funded.balance);
            if let Some(index) = index {
                account.delegate = Some(Delegate {
                    username: config.initial_delegates[index].username.clone(),
                    total_votes_received: 0,
                });
            }
            batch.put(keys::account(&funded.address), account.to_bytes());
        }

        storage.commit(batch).await
    }

    pub fn get_config(&self) -> &GenesisConfig {
        &self.config
    }

    pub fn get_slots(&self) -> &Slots {
        &self.slots
    }

    pub fn get_events(&self) -> &EventBus {
        &self.events
    }

    pub fn get_genesis_id(&self) -> &Hash {
        &self.genesis_id
    }

    pub async fn get_tip_id(&self) -> Hash {
        self.tip.read().await.id.clone()
    }

    pub async fn get_tip_header(&self) -> Arc<BlockHeader> {
        self.tip.read().await.header.clone()
    }

    pub async fn get_height(&self) -> u64 {
        self.tip.read().await.header.height
    }

    pub async fn get_finalized_height(&self) -> u64 {
        self.bft.read().await.get_finalized_height()
    }

    pub async fn get_prevoted_height(&self) -> u64 {
        self.bft.read().await.get_prevoted_height()
    }

    pub async fn get_validators(&self) -> Arc<Vec<Address>> {
        self.validators.read().await.clone()
    }

    // Composed schema of the registered modules, for the operator surface
    pub fn get_module_schemas(&self) -> Vec<ModuleSchema> {
        self.modules
            .iter()
            .map(|module| ModuleSchema {
                id: module.id(),
                name: module.name(),
                account_schema: module.account_schema(),
                transaction_assets: module.transaction_assets(),
            })
            .collect()
    }

    // Previously-forged height this delegate must declare in its next
    // header, from the BFT ledger
    pub async fn get_last_forged_height(&self, validator: &Address) -> u64 {
        self.bft
            .read()
            .await
            .get_record(validator)
            .map(|r| r.last_forged_height)
            .unwrap_or(0)
    }

    pub async fn get_block_by_id(&self, id: &Hash) -> Result<Option<Block>, BlockchainError> {
        self.storage.read().await.get_block_by_id(id).await
    }

    pub async fn get_block_by_height(
        &self,
        height: u64,
    ) -> Result<Option<Block>, BlockchainError> {
        self.storage.read().await.get_block_by_height(height).await
    }

    pub async fn get_block_id_at_height(
        &self,
        height: u64,
    ) -> Result<Option<Hash>, BlockchainError> {
        self.storage.read().await.get_block_id_at_height(height).await
    }

    pub async fn get_account(&self, address: &Address) -> Result<Option<Account>, BlockchainError> {
        self.storage.read().await.get_account(address).await
    }

    pub async fn get_used_onion_index(
        &self,
        address: &Address,
    ) -> Result<Option<u64>, BlockchainError> {
        self.storage.read().await.get_used_onion_index(address).await
    }

    pub async fn set_used_onion_index(
        &self,
        address: &Address,
        index: u64,
    ) -> Result<(), BlockchainError> {
        self.storage
            .read()
            .await
            .set_used_onion_index(address, index)
            .await
    }

    // Flush the KV store; the last step of an orderly shutdown
    pub async fn flush(&self) -> Result<(), BlockchainError> {
        self.storage.read().await.flush().await
    }

    pub async fn mempool_len(&self) -> usize {
        self.mempool.read().await.len()
    }

    pub async fn get_pooled_transactions(&self, ids: &[Hash]) -> Vec<Arc<Transaction>> {
        let mempool = self.mempool.read().await;
        ids.iter().filter_map(|id| mempool.get(id).cloned()).collect()
    }

    pub async fn mempool_contains(&self, id: &Hash) -> bool {
        self.mempool.read().await.contains(id)
    }

    // Serve up to `max` blocks following the given block on the main chain
    pub async fn get_blocks_from(
        &self,
        from: &Hash,
        max: u64,
    ) -> Result<Vec<Block>, BlockchainError> {
        let storage = self.storage.read().await;
        let parent = storage
            .get_block_by_id(from)
            .await?
            .ok_or_else(|| BlockchainError::BlockNotFound(from.clone()))?;

        let start = parent.get_header().height + 1;
        let mut blocks = Vec::new();
        for height in start..start + max {
            match storage.get_block_by_height(height).await? {
                Some(block) => blocks.push(block),
                None => break,
            }
        }

        Ok(blocks)
    }

    // Highest id among `ids` that sits on our main chain
    pub async fn find_highest_common_block(
        &self,
        ids: &[Hash],
    ) -> Result<Option<(Hash, u64)>, BlockchainError> {
        let storage = self.storage.read().await;
        let mut best: Option<(Hash, u64)> = None;
        for id in ids {
            let Some(block) = storage.get_block_by_id(id).await? else {
                continue;
            };

            let height = block.get_header().height;
            // must be on the canonical chain, not a temp leftover
            match storage.get_block_id_at_height(height).await? {
                Some(stored) if stored == *id => {}
                _ => continue,
            }

            if best.as_ref().map(|(_, h)| height > *h).unwrap_or(true) {
                best = Some((id.clone(), height));
            }
        }

        Ok(best)
    }

    // Full pipeline: validate -> fork choice -> verify -> apply
    pub async fn process(&self, block: Block, origin: BlockOrigin) -> Result<(), BlockchainError> {
        let id = block.hash();
        if log::log_enabled!(log::Level::Debug) {
            debug!("processing block {} at height {} ({:?})", id, block.get_header().height, origin);
        }

        self.validate_block(&block, &id).await?;

        let mut storage = self.storage.write().await;
        let choice = self.fork_choice(&block).await;
        trace!("fork choice for {}: {:?}", id, choice);

        match choice {
            ForkChoice::Append => {
                self.verify_and_apply(&mut storage, block, id, origin).await
            }
            ForkChoice::DiscardAndReplace => {
                let replaced = self
                    .delete_last_block_internal(&mut storage, true)
                    .await?;
                let replaced_id = replaced.hash();
                info!(
                    "replacing block {} with {} at height {}",
                    replaced_id,
                    id,
                    block.get_header().height
                );

                match self.verify_and_apply(&mut storage, block, id, origin).await {
                    Ok(()) => {
                        drop(storage);
                        // hand back whatever the replacement did not include
                        self.readmit_transactions(replaced.get_transactions()).await;
                        Ok(())
                    }
                    Err(err) => {
                        // put the old tip back, the journal made the
                        // deletion reversible
                        warn!(
                            "failed to apply replacement block, restoring {}: {}",
                            replaced_id, err
                        );
                        let restore_id = replaced.hash();
                        if let Err(restore_err) = self
                            .verify_and_apply(&mut storage, replaced, restore_id, BlockOrigin::Sync)
                            .await
                        {
                            error!("could not restore replaced block: {}", restore_err);
                        }
                        Err(err)
                    }
                }
            }
            ForkChoice::SyncFastSwitch | ForkChoice::SyncBlockSync => {
                drop(storage);
                if let BlockOrigin::Peer(peer_id) = origin {
                    self.events.emit(Event::SyncRequired {
                        block: Arc::new(block),
                        peer_id,
                    });
                }
                Ok(())
            }
            ForkChoice::Irrecoverable => {
                let finalized = self.get_finalized_height().await;
                Err(ForkError::Irrecoverable {
                    height: block.get_header().height,
                    finalized,
                }
                .into())
            }
            ForkChoice::Stale => {
                let tip_height = self.get_height().await;
                Err(BlockchainError::StaleBlock {
                    id,
                    height: block.get_header().height,
                    tip_height,
                })
            }
        }
    }

    // Sync path: the block was already validated against the peer chain,
    // skip static validation but still verify and apply under the lock
    pub async fn process_validated(&self, block: Block) -> Result<(), BlockchainError> {
        let id = block.hash();
        let mut storage = self.storage.write().await;

        let tip = self.tip.read().await;
        let header = block.get_header();
        if header.previous_block_id != tip.id || header.height != tip.header.height + 1 {
            return Err(BlockchainError::DoesNotExtendTip { id });
        }
        drop(tip);

        self.verify_and_apply(&mut storage, block, id, BlockOrigin::Sync).await
    }

    // Static validation stage: no chain state reads beyond the cached
    // validator set, no writes
    async fn validate_block(&self, block: &Block, id: &Hash) -> Result<(), BlockchainError> {
        let header = block.get_header();
        if header.version != BLOCK_VERSION {
            return Err(BlockchainError::InvalidBlockVersion(header.version));
        }

        if header.height == 0 {
            // a second genesis can only be a duplicate
            return Err(BlockchainError::StaleBlock {
                id: id.clone(),
                height: 0,
                tip_height: self.get_height().await,
            });
        }

        header
            .verify_signature()
            .map_err(|_| BlockchainError::InvalidBlockSignature(id.clone()))?;

        let slot = self.slots.slot_for_timestamp(header.timestamp as u64);
        let current_slot = self.slots.slot_for_timestamp(get_current_time_in_seconds());
        if slot > current_slot {
            return Err(BlockchainError::TimestampInFuture {
                timestamp: header.timestamp,
            });
        }

        let max = self.config.max_payload_length as usize;
        let size = block.payload_size();
        if size > max {
            return Err(BlockchainError::PayloadTooLarge { size, max });
        }

        if !block.verify_transaction_root() {
            return Err(BlockchainError::InvalidTransactionRoot);
        }

        for tx in block.get_transactions() {
            tx.validate()?;
        }

        Ok(())
    }

    // The forger assigned to the block's slot must match its generator.
    // Runs at verify time: it binds to the validator set of the round
    // being extended.
    async fn verify_forging_slot(&self, header: &BlockHeader) -> Result<(), BlockchainError> {
        let validators = self.validators.read().await.clone();
        if validators.is_empty() {
            return Err(BlockchainError::NoValidators);
        }

        let slot = self.slots.slot_for_timestamp(header.timestamp as u64);
        let expected = validators[self.slots.forger_index(slot) % validators.len()];
        if header.generator_public_key.to_address() != expected {
            return Err(BlockchainError::WrongForger { slot });
        }

        Ok(())
    }

    async fn fork_choice(&self, block: &Block) -> ForkChoice {
        let tip = self.tip.read().await;
        let header = block.get_header();
        let tip_header = &tip.header;

        if header.previous_block_id == tip.id && header.height == tip_header.height + 1 {
            return ForkChoice::Append;
        }

        if header.height == tip_header.height
            && header.previous_block_id == tip_header.previous_block_id
            && tiebreak_wins(header, tip_header)
        {
            return ForkChoice::DiscardAndReplace;
        }

        let validators = self.validators.read().await;
        let generator_is_active = validators
            .iter()
            .any(|v| *v == header.generator_public_key.to_address());
        if header.height == tip_header.height + 1
            && header.previous_block_id != tip.id
            && generator_is_active
        {
            return ForkChoice::SyncFastSwitch;
        }

        if header.height > tip_header.height + 1 {
            return ForkChoice::SyncBlockSync;
        }

        let finalized = self.bft.read().await.get_finalized_height();
        if header.height <= finalized {
            return ForkChoice::Irrecoverable;
        }

        ForkChoice::Stale
    }

    // Shared by block verification, block application and the pool's
    // semantic admission check: nonce, fee floor, fee debit and module
    // dispatch for every transaction, in order, against the snapshot.
    // Aborts on the first failure; returns the fee total.
    async fn execute_transactions<'b>(
        &self,
        state: &mut StateStore<'b, S>,
        txs: &[Arc<Transaction>],
        block_height: u64,
    ) -> Result<u64, BlockchainError> {
        let mut total_fees: u64 = 0;
        for tx in txs {
            let sender = tx.get_sender().to_address();
            let account = state.get_account(&sender).await?;
            if tx.get_nonce() != account.nonce {
                return Err(BlockchainError::InvalidNonce {
                    address: sender,
                    expected: account.nonce,
                    got: tx.get_nonce(),
                });
            }

            let min_fee = tx.min_fee(&self.config);
            if tx.get_fee() < min_fee {
                return Err(BlockchainError::FeeTooLow {
                    id: tx.id(),
                    fee: tx.get_fee(),
                    min_fee,
                });
            }

            state.debit(&sender, tx.get_fee()).await?;
            state.get_account_mut(&sender).await?.nonce += 1;

            let module = self.modules.get(tx.get_module_id())?;
            let mut ctx = TransactionContext {
                state: &mut *state,
                sender,
                block_height,
                config: &self.config,
            };
            module.verify(&mut ctx, tx).await?;
            module.apply(&mut ctx, tx).await?;

            total_fees = total_fees.saturating_add(tx.get_fee());
        }

        Ok(total_fees)
    }

    // Pure check used by the pool: runs the full pipeline against a
    // throwaway snapshot, persists nothing
    pub async fn verify_transactions(
        &self,
        txs: &[Arc<Transaction>],
    ) -> Result<(), BlockchainError> {
        let storage = self.storage.read().await;
        let height = self.get_height().await + 1;
        let mut state = StateStore::new(&*storage);
        self.execute_transactions(&mut state, txs, height).await?;
        Ok(())
    }

    // Verify + apply stage under the single-writer lock: execute the
    // payload on a snapshot, credit the generator, run module hooks,
    // fold in the BFT update and commit everything as one batch.
    async fn verify_and_apply(
        &self,
        storage: &mut S,
        block: Block,
        id: Hash,
        origin: BlockOrigin,
    ) -> Result<(), BlockchainError> {
        let height = block.get_header().height;
        self.verify_forging_slot(block.get_header()).await?;
        self.bft.read().await.verify_header(block.get_header())?;

        let mut state = StateStore::new(&*storage);
        let total_fees = self
            .execute_transactions(&mut state, block.get_transactions(), height)
            .await?;

        // block reward and fees go to the generator
        let generator = block.get_header().generator_public_key.to_address();
        let reward = self.config.rewards.reward_at_height(height);
        state
            .credit(&generator, total_fees.saturating_add(reward))
            .await?;

        // per-module end-of-block hook
        let mut block_ctx = BlockContext {
            state: &mut state,
            block_height: height,
            config: &self.config,
            events: &self.events,
            new_validators: None,
        };
        for module in self.modules.iter() {
            module.after_block_apply(&mut block_ctx).await?;
        }
        let new_validators = block_ctx.new_validators;

        // BFT bookkeeping for this header
        let validators = self.validators.read().await.clone();
        let mut bft = self.bft.write().await;
        let old_finalized = bft.get_finalized_height();
        let update = bft.apply_header(block.get_header(), validators.as_slice())?;
        if let Some(new_finalized) = update.new_finalized {
            if new_finalized < old_finalized {
                // never expected to fire; kept as a tripwire because this
                // is the one regression we can not recover from
                return Err(BlockchainError::FinalityRegression {
                    from: old_finalized,
                    to: new_finalized,
                });
            }
        }

        // assemble the atomic batch
        let mut batch = WriteBatch::new();
        let mut journal = UndoJournal::default();
        state.finish(&mut batch, &mut journal);

        journal.record(
            keys::bft_record(&update.validator),
            update.previous_record.clone(),
        );
        batch.put(
            keys::bft_record(&update.validator),
            update.new_record.to_bytes(),
        );
        journal.record(keys::PREVOTED.to_vec(), Some(update.previous_prevoted.to_bytes()));
        batch.put(keys::PREVOTED.to_vec(), update.new_prevoted.to_bytes());
        if let Some(finalized) = update.new_finalized {
            // intentionally not journaled: finality never regresses
            batch.put(keys::FINALIZED.to_vec(), finalized.to_bytes());
        }

        batch.put(keys::block_by_id(&id), block.to_bytes());
        batch.put(keys::block_by_height(height), id.as_bytes().to_vec());
        batch.put(keys::TIP.to_vec(), id.as_bytes().to_vec());
        batch.put(keys::journal(&id), journal.to_bytes());

        // a failed commit must leave the in-memory ledger in the
        // pre-block state as well
        if let Err(err) = self
            .finalize_commit(storage, batch, old_finalized, update.new_finalized)
            .await
        {
            let previous = update
                .previous_record
                .as_deref()
                .and_then(|bytes| ValidatorRecord::from_bytes(bytes).ok());
            bft.revert_header(block.get_header(), previous, validators.as_slice());
            return Err(err);
        }
        drop(bft);

        // refresh caches
        {
            let mut tip = self.tip.write().await;
            tip.id = id.clone();
            tip.header = Arc::new(block.get_header().clone());
        }
        if let Some(validators) = new_validators {
            *self.validators.write().await = validators;
        }

        // prune the pool of everything this block settled
        let included: Vec<Hash> = block.get_transactions().iter().map(|tx| tx.id()).collect();
        let mut senders: Vec<(Address, u64)> = Vec::new();
        for tx in block.get_transactions() {
            let sender = tx.get_sender().to_address();
            let next = tx.get_nonce() + 1;
            match senders.iter_mut().find(|(a, _)| *a == sender) {
                Some(entry) => entry.1 = entry.1.max(next),
                None => senders.push((sender, next)),
            }
        }
        let removed = self
            .mempool
            .write()
            .await
            .on_block_applied(&included, &senders);
        for (tx_id, reason) in removed {
            self.events.emit(Event::TransactionRemoved { id: tx_id, reason });
        }

        // events, in application order
        let block = Arc::new(block);
        self.events.emit(Event::NewBlock {
            block: block.clone(),
            id: id.clone(),
        });
        if let Some(finalized) = update.new_finalized {
            self.events.emit(Event::BlockFinalized { height: finalized });
        }
        if origin == BlockOrigin::Local {
            self.events.emit(Event::BroadcastBlock { block });
        }

        info!("applied block {} at height {}", id, height);
        Ok(())
    }

    // Journal pruning for newly finalized blocks, temp region upkeep and
    // the atomic commit itself; everything in here may fail without
    // having touched persisted state
    async fn finalize_commit(
        &self,
        storage: &mut S,
        mut batch: WriteBatch,
        old_finalized: u64,
        new_finalized: Option<u64>,
    ) -> Result<(), BlockchainError> {
        if let Some(finalized) = new_finalized {
            // journals of finalized blocks are no longer needed
            for h in old_finalized + 1..=finalized {
                if let Some(final_id) = storage.get_block_id_at_height(h).await? {
                    batch.delete(keys::journal(&final_id));
                }
            }
        }

        let finalized = new_finalized.unwrap_or(old_finalized);
        self.prune_temp_region(storage, &mut batch, finalized).await?;
        storage.commit(batch).await
    }

    // Revert the tip: restore every journaled key, drop the block and
    // repoint the tip at its parent. Optionally parks the block in the
    // temp region for sync to resume from.
    async fn delete_last_block_internal(
        &self,
        storage: &mut S,
        to_temp: bool,
    ) -> Result<Block, BlockchainError> {
        let (tip_id, tip_height) = {
            let tip = self.tip.read().await;
            (tip.id.clone(), tip.header.height)
        };

        if tip_height == 0 {
            return Err(BlockchainError::CannotDeleteGenesis);
        }

        let finalized = self.bft.read().await.get_finalized_height();
        if tip_height <= finalized {
            return Err(BlockchainError::CannotDeleteFinalized(tip_height));
        }

        let block = storage
            .get_block_by_id(&tip_id)
            .await?
            .ok_or_else(|| BlockchainError::BlockNotFound(tip_id.clone()))?;
        let journal_bytes = storage
            .get_journal(&tip_id)
            .await?
            .ok_or_else(|| BlockchainError::JournalMissing(tip_id.clone()))?;
        let journal = UndoJournal::from_bytes(&journal_bytes).map_err(|err| {
            // a corrupt journal means we cannot keep consistency promises
            error!("undo journal for {} is corrupt: {}", tip_id, err);
            BlockchainError::from(err)
        })?;

        let parent_id = block.get_header().previous_block_id.clone();
        let parent = storage
            .get_block_by_id(&parent_id)
            .await?
            .ok_or_else(|| BlockchainError::BlockNotFound(parent_id.clone()))?;

        let mut batch = WriteBatch::new();
        journal.restore_into(&mut batch);
        batch.delete(keys::journal(&tip_id));
        batch.delete(keys::block_by_id(&tip_id));
        batch.delete(keys::block_by_height(tip_height));
        batch.put(keys::TIP.to_vec(), parent_id.as_bytes().to_vec());
        if to_temp {
            batch.put(keys::temp_block(&tip_id), block.to_bytes());
        }
        self.prune_temp_region(storage, &mut batch, finalized).await?;

        storage.commit(batch).await?;

        {
            let mut tip = self.tip.write().await;
            tip.id = parent_id.clone();
            tip.header = parent.to_header();
        }

        // realign the in-memory BFT mirror with the restored records
        let validator = block.get_header().generator_public_key.to_address();
        let restored = match storage.get_bft_record(&validator).await? {
            Some(bytes) => Some(crate::core::bft::ValidatorRecord::from_bytes(&bytes)?),
            None => None,
        };
        {
            let validators = self.validators.read().await.clone();
            self.bft
                .write()
                .await
                .revert_header(block.get_header(), restored, validators.as_slice());
        }

        // the validator set may have been rotated by this block
        if let Some(bytes) = storage
            .get_chain_state(DposModule::validators_state_key())
            .await?
        {
            *self.validators.write().await = Arc::new(Vec::from_bytes(&bytes)?);
        }

        let block = Arc::new(block);
        self.events.emit(Event::DeleteBlock {
            block: block.clone(),
            id: tip_id.clone(),
        });

        info!("deleted block {} at height {}", tip_id, tip_height);
        Ok(Arc::try_unwrap(block).unwrap_or_else(|arc| (*arc).clone()))
    }

    // Revert the tip and hand its transactions back to the pool.
    // Re-admissions that fail now are silently dropped.
    pub async fn delete_last_block(&self) -> Result<(), BlockchainError> {
        let mut storage = self.storage.write().await;
        let block = self.delete_last_block_internal(&mut storage, false).await?;
        drop(storage);

        self.readmit_transactions(block.get_transactions()).await;
        Ok(())
    }

    // Same but parks the reverted block in the temp region; used by sync
    pub async fn delete_last_block_to_temp(&self) -> Result<(), BlockchainError> {
        let mut storage = self.storage.write().await;
        let block = self.delete_last_block_internal(&mut storage, true).await?;
        drop(storage);

        self.readmit_transactions(block.get_transactions()).await;
        Ok(())
    }

    async fn readmit_transactions(&self, txs: &[Arc<Transaction>]) {
        let now = get_current_time_in_seconds();
        for tx in txs {
            let sender = tx.get_sender().to_address();
            let account = match self.storage.read().await.get_account(&sender).await {
                Ok(Some(account)) => account,
                Ok(None) => Account::new(sender),
                Err(err) => {
                    warn!("failed to load account for re-admission: {}", err);
                    continue;
                }
            };

            let mut mempool = self.mempool.write().await;
            if mempool.contains(&tx.id()) {
                continue;
            }

            if let Err(err) = mempool.admit(tx.clone(), &account, now) {
                trace!("dropping reverted transaction {}: {}", tx.id(), err);
            }
        }
    }

    // Keep the temp region bounded and free of finalized leftovers
    async fn prune_temp_region(
        &self,
        storage: &S,
        batch: &mut WriteBatch,
        finalized: u64,
    ) -> Result<(), BlockchainError> {
        let temp_blocks = storage.get_temp_blocks().await?;
        let mut live = 0usize;
        for block in &temp_blocks {
            if block.get_header().height <= finalized {
                batch.delete(keys::temp_block(&block.hash()));
            } else {
                live += 1;
            }
        }

        // oldest entries go first when over capacity
        if live > TEMP_REGION_CAPACITY {
            let mut excess = live - TEMP_REGION_CAPACITY;
            for block in &temp_blocks {
                if excess == 0 {
                    break;
                }
                if block.get_header().height > finalized {
                    batch.delete(keys::temp_block(&block.hash()));
                    excess -= 1;
                }
            }
        }

        Ok(())
    }

    // Replay blocks parked in the temp region that still extend the tip;
    // runs once at boot
    async fn replay_temp_blocks(self: &Arc<Self>) -> Result<(), BlockchainError> {
        let temp_blocks = {
            let storage = self.storage.read().await;
            storage.get_temp_blocks().await?
        };
        if temp_blocks.is_empty() {
            return Ok(());
        }

        debug!("replaying {} blocks from the temp region", temp_blocks.len());
        for block in temp_blocks {
            let id = block.hash();
            let tip = self.tip.read().await;
            let extends = block.get_header().previous_block_id == tip.id
                && block.get_header().height == tip.header.height + 1;
            drop(tip);

            if !extends {
                continue;
            }

            match self.process_validated(block).await {
                Ok(()) => {
                    let mut storage = self.storage.write().await;
                    let mut batch = WriteBatch::new();
                    batch.delete(keys::temp_block(&id));
                    storage.commit(batch).await?;
                }
                Err(err) => {
                    warn!("temp region replay stopped at {}: {}", id, err);
                    break;
                }
            }
        }

        Ok(())
    }

    // Admission pipeline for an unconfirmed transaction: static
    // validation, semantic dry-run against the sender's pending run,
    // then the pool's bound checks
    pub async fn add_transaction(&self, tx: Transaction) -> Result<(), BlockchainError> {
        tx.validate()?;
        let tx = Arc::new(tx);
        let id = tx.id();
        let sender = tx.get_sender().to_address();

        if self.mempool.read().await.contains(&id) {
            trace!("transaction {} already pooled", id);
            return Ok(());
        }

        // simulate the sender's pending run with the candidate in place
        let mut run = self.mempool.read().await.pending_for_sender(&sender);
        match run.iter().position(|t| t.get_nonce() == tx.get_nonce()) {
            Some(index) => run[index] = tx.clone(),
            None => run.push(tx.clone()),
        }
        self.verify_transactions(&run).await?;

        let account = self
            .storage
            .read()
            .await
            .get_account(&sender)
            .await?
            .unwrap_or_else(|| Account::new(sender));

        let removed = self
            .mempool
            .write()
            .await
            .admit(tx, &account, get_current_time_in_seconds())
            .map_err(|err| {
                debug!("pool rejected transaction {}: {}", id, err);
                BlockchainError::PoolRejected(err)
            })?;

        for (tx_id, reason) in removed {
            self.events.emit(Event::TransactionRemoved { id: tx_id, reason });
        }

        Ok(())
    }

    // Sweep expired transactions; driven by a timer task
    pub async fn expire_pool_transactions(&self) {
        let removed = self
            .mempool
            .write()
            .await
            .expire(get_current_time_in_seconds());
        for (tx_id, reason) in removed {
            self.events.emit(Event::TransactionRemoved { id: tx_id, reason });
        }
    }

    // Build an unsigned block for the forger: next height on the tip,
    // payload selected from the pool under the byte budget
    pub async fn create_block_template(
        &self,
        generator: PublicKey,
        timestamp: u64,
        asset: BlockAsset,
    ) -> Result<Block, BlockchainError> {
        let tip = self.tip.read().await;
        let selected = self
            .mempool
            .read()
            .await
            .select(self.config.max_payload_length as usize);

        let txs: Vec<Arc<Transaction>> = selected.into_iter().map(|(_, tx)| tx).collect();
        let root = compute_transaction_root(txs.iter().map(|tx| tx.id()));

        let header = BlockHeader::new(
            BLOCK_VERSION,
            tip.header.height + 1,
            timestamp as u32,
            tip.id.clone(),
            generator,
            root,
            asset,
        );

        Ok(Block::new(Immutable::Owned(header), txs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atoll_common::crypto::hash;
    use proptest::prelude::*;

    fn header_with(prevoted: u64, seed: u8) -> BlockHeader {
        BlockHeader::new(
            BLOCK_VERSION,
            5,
            50,
            Hash::zero(),
            PublicKey::zero(),
            hash(&[seed]),
            BlockAsset::new(0, prevoted, [seed; 32]),
        )
    }

    #[test]
    fn test_tiebreak_prefers_higher_prevote() {
        let a = header_with(10, 1);
        let b = header_with(4, 2);
        assert!(tiebreak_wins(&a, &b));
        assert!(!tiebreak_wins(&b, &a));
    }

    proptest! {
        // antisymmetric and total: exactly one candidate wins unless they
        // are the same block
        #[test]
        fn prop_tiebreak_antisymmetric(pa in 0u64..20, pb in 0u64..20, sa: u8, sb: u8) {
            let a = header_with(pa, sa);
            let b = header_with(pb, sb);
            if a.id() != b.id() {
                prop_assert_ne!(tiebreak_wins(&a, &b), tiebreak_wins(&b, &a));
            }
        }
    }

    #[test]
    fn test_genesis_block_is_deterministic() {
        let config = GenesisConfig {
            block_time: 10,
            bft_threshold: 68,
            active_delegates: 101,
            max_payload_length: 15 * 1024,
            min_fee_per_byte: 1000,
            base_fees: Vec::new(),
            rewards: atoll_common::config::RewardSchedule {
                milestones: vec![500_000_000],
                offset: 1,
                distance: 3_000_000,
            },
            genesis_timestamp: 1_600_000_000,
            initial_accounts: Vec::new(),
            initial_delegates: Vec::new(),
        };

        assert_eq!(genesis_block(&config).hash(), genesis_block(&config).hash());
    }
}
