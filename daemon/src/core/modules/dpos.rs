use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};

use atoll_common::{
    account::{Delegate, SentVote},
    config::{DPOS_ASSET_REGISTER_DELEGATE, DPOS_ASSET_VOTE_DELEGATE, DPOS_MODULE_ID},
    crypto::Address,
    serializer::Serializer,
    transaction::{Transaction, TransactionAsset, Vote},
};

use crate::{
    core::{error::BlockchainError, state::StateStore, storage::Storage},
    events::Event,
};

use super::{BlockContext, Module, ModuleError, TransactionContext};

// Chain-state keys owned by this module
const DELEGATES_KEY: &[u8] = b"dpos:delegates";
const VALIDATORS_KEY: &[u8] = b"dpos:validators";

fn username_key(username: &str) -> Vec<u8> {
    let mut key = b"dpos:username:".to_vec();
    key.extend_from_slice(username.as_bytes());
    key
}

// Delegate registration, vote accounting and the round-boundary
// validator set rotation.
pub struct DposModule;

impl DposModule {
    // Current active set as stored by the last rotation (or genesis)
    pub async fn read_validators<S: Storage>(
        state: &mut StateStore<'_, S>,
    ) -> Result<Vec<Address>, ModuleError> {
        match state.get_chain_state(VALIDATORS_KEY).await? {
            Some(bytes) => Ok(Vec::from_bytes(&bytes).map_err(BlockchainError::from)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn validators_state_key() -> &'static [u8] {
        VALIDATORS_KEY
    }

    pub fn delegates_state_key() -> &'static [u8] {
        DELEGATES_KEY
    }

    async fn read_delegates<S: Storage>(
        state: &mut StateStore<'_, S>,
    ) -> Result<Vec<Address>, ModuleError> {
        match state.get_chain_state(DELEGATES_KEY).await? {
            Some(bytes) => Ok(Vec::from_bytes(&bytes).map_err(BlockchainError::from)?),
            None => Ok(Vec::new()),
        }
    }

    async fn verify_votes<S: Storage>(
        ctx: &mut TransactionContext<'_, '_, S>,
        votes: &[Vote],
    ) -> Result<(), ModuleError> {
        let mut locked_total: u64 = 0;
        for vote in votes {
            let target = ctx.state.get_account(&vote.delegate).await?;
            if !target.is_delegate() {
                return Err(ModuleError::NotDelegate(vote.delegate));
            }

            if vote.amount > 0 {
                locked_total = locked_total.saturating_add(vote.amount as u64);
            } else {
                let unvote = vote.amount.unsigned_abs();
                let sender = ctx.state.get_account(&ctx.sender).await?;
                let voted = sender
                    .votes
                    .iter()
                    .find(|v| v.delegate == vote.delegate)
                    .map(|v| v.amount)
                    .unwrap_or(0);
                if voted < unvote {
                    return Err(ModuleError::VoteUnderflow(vote.delegate));
                }
            }
        }

        let sender = ctx.state.get_account(&ctx.sender).await?;
        if sender.balance < locked_total {
            return Err(ModuleError::InsufficientFunds {
                address: ctx.sender,
                need: locked_total,
                have: sender.balance,
            });
        }

        Ok(())
    }

    async fn apply_votes<S: Storage>(
        ctx: &mut TransactionContext<'_, '_, S>,
        votes: &[Vote],
    ) -> Result<(), ModuleError> {
        for vote in votes {
            if vote.amount > 0 {
                let amount = vote.amount as u64;
                ctx.state.debit(&ctx.sender, amount).await?;

                let sender = ctx.state.get_account_mut(&ctx.sender).await?;
                match sender.votes.iter_mut().find(|v| v.delegate == vote.delegate) {
                    Some(entry) => entry.amount += amount,
                    None => sender.votes.push(SentVote {
                        delegate: vote.delegate,
                        amount,
                    }),
                }

                let target = ctx.state.get_account_mut(&vote.delegate).await?;
                let delegate = target
                    .delegate
                    .as_mut()
                    .ok_or(ModuleError::NotDelegate(vote.delegate))?;
                delegate.total_votes_received += amount;
            } else {
                let amount = vote.amount.unsigned_abs();
                let sender = ctx.state.get_account_mut(&ctx.sender).await?;
                let entry = sender
                    .votes
                    .iter_mut()
                    .find(|v| v.delegate == vote.delegate)
                    .ok_or(ModuleError::VoteUnderflow(vote.delegate))?;
                if entry.amount < amount {
                    return Err(ModuleError::VoteUnderflow(vote.delegate));
                }

                entry.amount -= amount;
                sender.votes.retain(|v| v.amount > 0);

                ctx.state.credit(&ctx.sender, amount).await?;

                let target = ctx.state.get_account_mut(&vote.delegate).await?;
                let delegate = target
                    .delegate
                    .as_mut()
                    .ok_or(ModuleError::NotDelegate(vote.delegate))?;
                delegate.total_votes_received =
                    delegate.total_votes_received.saturating_sub(amount);
            }
        }

        Ok(())
    }

    // Rank all registered delegates and keep the top N. Deterministic:
    // ties break toward the lower address.
    pub async fn compute_validator_set<S: Storage>(
        state: &mut StateStore<'_, S>,
        active_delegates: usize,
    ) -> Result<Vec<Address>, ModuleError> {
        let registered = Self::read_delegates(state).await?;
        let mut ranked: Vec<(u64, Address)> = Vec::with_capacity(registered.len());
        for address in registered {
            let account = state.get_account(&address).await?;
            let votes = account
                .delegate
                .as_ref()
                .map(|d| d.total_votes_received)
                .unwrap_or(0);
            ranked.push((votes, address));
        }

        ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        Ok(ranked
            .into_iter()
            .take(active_delegates)
            .map(|(_, address)| address)
            .collect())
    }
}

#[async_trait]
impl<S: Storage> Module<S> for DposModule {
    fn id(&self) -> u32 {
        DPOS_MODULE_ID
    }

    fn name(&self) -> &'static str {
        "dpos"
    }

    fn account_schema(&self) -> &'static [&'static str] {
        &["delegate", "votes"]
    }

    fn transaction_assets(&self) -> &'static [u32] {
        &[DPOS_ASSET_REGISTER_DELEGATE, DPOS_ASSET_VOTE_DELEGATE]
    }

    async fn verify(
        &self,
        ctx: &mut TransactionContext<'_, '_, S>,
        tx: &Transaction,
    ) -> Result<(), ModuleError> {
        match tx.get_asset() {
            TransactionAsset::RegisterDelegate { username } => {
                let account = ctx.state.get_account(&ctx.sender).await?;
                if account.is_delegate() {
                    return Err(ModuleError::AlreadyDelegate(ctx.sender));
                }

                if ctx
                    .state
                    .get_chain_state(&username_key(username))
                    .await?
                    .is_some()
                {
                    return Err(ModuleError::UsernameTaken(username.clone()));
                }

                Ok(())
            }
            TransactionAsset::VoteDelegate { votes } => Self::verify_votes(ctx, votes).await,
            other => Err(ModuleError::UnknownAsset {
                module_id: other.module_id(),
                asset_id: other.asset_id(),
            }),
        }
    }

    async fn apply(
        &self,
        ctx: &mut TransactionContext<'_, '_, S>,
        tx: &Transaction,
    ) -> Result<(), ModuleError> {
        match tx.get_asset() {
            TransactionAsset::RegisterDelegate { username } => {
                debug!("registering delegate {} as {}", ctx.sender, username);
                let account = ctx.state.get_account_mut(&ctx.sender).await?;
                if account.is_delegate() {
                    return Err(ModuleError::AlreadyDelegate(ctx.sender));
                }

                account.delegate = Some(Delegate {
                    username: username.clone(),
                    total_votes_received: 0,
                });

                let mut registered = Self::read_delegates(ctx.state).await?;
                registered.push(ctx.sender);
                ctx.state
                    .set_chain_state(DELEGATES_KEY, registered.to_bytes())
                    .await?;
                ctx.state
                    .set_chain_state(&username_key(username), ctx.sender.as_bytes().to_vec())
                    .await?;
                Ok(())
            }
            TransactionAsset::VoteDelegate { votes } => Self::apply_votes(ctx, votes).await,
            other => Err(ModuleError::UnknownAsset {
                module_id: other.module_id(),
                asset_id: other.asset_id(),
            }),
        }
    }

    async fn after_block_apply(
        &self,
        ctx: &mut BlockContext<'_, '_, S>,
    ) -> Result<(), ModuleError> {
        let round_length = ctx.config.round_length();
        if ctx.block_height == 0 || ctx.block_height % round_length != 0 {
            return Ok(());
        }

        let validators =
            Self::compute_validator_set(ctx.state, ctx.config.active_delegates as usize).await?;
        ctx.state
            .set_chain_state(VALIDATORS_KEY, validators.to_bytes())
            .await?;

        let round = ctx.block_height / round_length + 1;
        info!(
            "round {} starts with {} active delegates",
            round,
            validators.len()
        );

        let validators = Arc::new(validators);
        ctx.events.emit(Event::ValidatorsChanged {
            round,
            validators: validators.clone(),
        });
        ctx.new_validators = Some(validators);
        Ok(())
    }
}
