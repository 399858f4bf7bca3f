use async_trait::async_trait;
use log::trace;

use atoll_common::{
    config::{TOKEN_ASSET_TRANSFER, TOKEN_MODULE_ID},
    transaction::{Transaction, TransactionAsset},
};

use crate::core::storage::Storage;

use super::{Module, ModuleError, TransactionContext};

// Balance transfers. Fees and nonces are handled generically by the
// processor; this module owns only the transfer semantics.
pub struct TokenModule;

#[async_trait]
impl<S: Storage> Module<S> for TokenModule {
    fn id(&self) -> u32 {
        TOKEN_MODULE_ID
    }

    fn name(&self) -> &'static str {
        "token"
    }

    fn account_schema(&self) -> &'static [&'static str] {
        &["balance", "nonce"]
    }

    fn transaction_assets(&self) -> &'static [u32] {
        &[TOKEN_ASSET_TRANSFER]
    }

    async fn verify(
        &self,
        ctx: &mut TransactionContext<'_, '_, S>,
        tx: &Transaction,
    ) -> Result<(), ModuleError> {
        match tx.get_asset() {
            TransactionAsset::Transfer { amount, .. } => {
                // Fee debits already happened for this tx, balance only
                // has to cover the amount here
                let account = ctx.state.get_account(&ctx.sender).await?;
                if account.balance < *amount {
                    return Err(ModuleError::InsufficientFunds {
                        address: ctx.sender,
                        need: *amount,
                        have: account.balance,
                    });
                }
                Ok(())
            }
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
            TransactionAsset::Transfer {
                recipient, amount, ..
            } => {
                trace!(
                    "transfer {} from {} to {}",
                    amount,
                    ctx.sender,
                    recipient
                );
                ctx.state.debit(&ctx.sender, *amount).await?;
                ctx.state.credit(recipient, *amount).await?;
                Ok(())
            }
            other => Err(ModuleError::UnknownAsset {
                module_id: other.module_id(),
                asset_id: other.asset_id(),
            }),
        }
    }
}
