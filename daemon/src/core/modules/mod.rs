mod dpos;
mod token;

pub use dpos::DposModule;
pub use token::TokenModule;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use atoll_common::{
    config::GenesisConfig,
    crypto::Address,
    transaction::Transaction,
};

use crate::{
    core::{error::BlockchainError, state::StateStore, storage::Storage},
    events::EventBus,
};

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("Unknown module id {0}")]
    UnknownModule(u32),

    #[error("Unknown asset id {asset_id} for module {module_id}")]
    UnknownAsset { module_id: u32, asset_id: u32 },

    #[error("Account {0} is already a registered delegate")]
    AlreadyDelegate(Address),

    #[error("Username {0} is already taken")]
    UsernameTaken(String),

    #[error("Account {0} is not a registered delegate")]
    NotDelegate(Address),

    #[error("Downvote exceeds the voted amount for delegate {0}")]
    VoteUnderflow(Address),

    #[error("Insufficient funds for {address}: need {need}, have {have}")]
    InsufficientFunds {
        address: Address,
        need: u64,
        have: u64,
    },

    #[error(transparent)]
    Chain(Box<BlockchainError>),
}

impl From<BlockchainError> for ModuleError {
    fn from(error: BlockchainError) -> Self {
        ModuleError::Chain(Box::new(error))
    }
}

// Per-transaction view handed to a module: the snapshot of touched state
// plus the resolved sender address.
pub struct TransactionContext<'a, 'b, S: Storage> {
    pub state: &'a mut StateStore<'b, S>,
    pub sender: Address,
    pub block_height: u64,
    pub config: &'a GenesisConfig,
}

// Per-block view handed to after_block_apply. Modules publish through the
// bus handle and never hold the processor.
pub struct BlockContext<'a, 'b, S: Storage> {
    pub state: &'a mut StateStore<'b, S>,
    pub block_height: u64,
    pub config: &'a GenesisConfig,
    pub events: &'a EventBus,
    // Set by the dpos module on round boundaries so the processor can
    // refresh its cached set without re-reading chain state
    pub new_validators: Option<Arc<Vec<Address>>>,
}

// A custom application module. The set is fixed at boot; dispatch is a
// `(module_id, asset_id)` table lookup, never runtime registration.
#[async_trait]
pub trait Module<S: Storage>: Send + Sync {
    fn id(&self) -> u32;

    fn name(&self) -> &'static str;

    // Account fields this module owns; composed into the node schema
    // surfaced to operators
    fn account_schema(&self) -> &'static [&'static str];

    // Asset ids this module handles
    fn transaction_assets(&self) -> &'static [u32];

    // State-dependent preconditions, must not mutate the snapshot
    async fn verify(
        &self,
        ctx: &mut TransactionContext<'_, '_, S>,
        tx: &Transaction,
    ) -> Result<(), ModuleError>;

    // Mutate the snapshot according to the asset
    async fn apply(
        &self,
        ctx: &mut TransactionContext<'_, '_, S>,
        tx: &Transaction,
    ) -> Result<(), ModuleError>;

    // Runs once per applied block, after the payload
    async fn after_block_apply(
        &self,
        _ctx: &mut BlockContext<'_, '_, S>,
    ) -> Result<(), ModuleError> {
        Ok(())
    }
}

pub struct ModuleRegistry<S: Storage> {
    modules: Vec<Arc<dyn Module<S>>>,
    by_id: HashMap<u32, usize>,
}

impl<S: Storage> ModuleRegistry<S> {
    // The standard module set: token transfers plus dpos
    pub fn standard() -> Self {
        Self::with_modules(vec![Arc::new(TokenModule), Arc::new(DposModule)])
    }

    pub fn with_modules(modules: Vec<Arc<dyn Module<S>>>) -> Self {
        let by_id = modules
            .iter()
            .enumerate()
            .map(|(index, module)| (module.id(), index))
            .collect();
        Self { modules, by_id }
    }

    pub fn get(&self, module_id: u32) -> Result<&Arc<dyn Module<S>>, ModuleError> {
        self.by_id
            .get(&module_id)
            .map(|index| &self.modules[*index])
            .ok_or(ModuleError::UnknownModule(module_id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Module<S>>> {
        self.modules.iter()
    }
}
