use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use log::debug;
use serde_json::{json, Value};
use thiserror::Error;

use atoll_common::{
    api::{
        AccountView, BlockView, ForgingStatus, ModuleSchemaView, NodeInfo, PeerView,
        PostTransactionParams, PostTransactionResponse, TransactionView,
        UpdateForgingStatusParams, ValidatorInfo,
    },
    block::Block,
    crypto::{Address, Hash, Hashable},
    serializer::Serializer,
    transaction::Transaction,
};

use crate::{
    core::{blockchain::Blockchain, error::BlockchainError, storage::Storage},
    forger::{Forger, ForgerError},
    p2p::PeerNetwork,
};

pub const NODE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Not found")]
    NotFound,

    #[error(transparent)]
    Chain(#[from] BlockchainError),

    #[error(transparent)]
    Forger(#[from] ForgerError),
}

// Operator RPC surface over the node handle. Transport-agnostic: the
// binary decides how requests reach `handle_request`; consensus types
// are rendered through the hex views in atoll_common::api.
pub struct ApiHandler<S: Storage> {
    blockchain: Arc<Blockchain<S>>,
    forger: Option<Arc<Forger<S>>>,
    network: Arc<dyn PeerNetwork>,
    network_version: String,
    sync_active: Arc<AtomicBool>,
}

impl<S: Storage> ApiHandler<S> {
    pub fn new(
        blockchain: Arc<Blockchain<S>>,
        forger: Option<Arc<Forger<S>>>,
        network: Arc<dyn PeerNetwork>,
        network_version: String,
        sync_active: Arc<AtomicBool>,
    ) -> Self {
        Self {
            blockchain,
            forger,
            network,
            network_version,
            sync_active,
        }
    }

    pub async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        debug!("rpc request: {}", method);
        match method {
            "get_node_info" => Ok(json!(self.get_node_info().await?)),
            "get_validators" => Ok(json!(self.get_validators().await?)),
            "update_forging_status" => {
                let params: UpdateForgingStatusParams = parse_params(params)?;
                Ok(json!(self.update_forging_status(params).await?))
            }
            "get_account" => {
                let address = parse_address(&params)?;
                Ok(json!(self.get_account(&address).await?))
            }
            "get_block_by_id" => {
                let id = parse_hash(&params)?;
                Ok(json!(self.get_block_by_id(&id).await?))
            }
            "get_block_by_height" => {
                let height = params
                    .get("height")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| RpcError::InvalidParams("height".into()))?;
                Ok(json!(self.get_block_by_height(height).await?))
            }
            "get_last_block" => Ok(json!(self.get_last_block().await?)),
            "get_transaction_by_id" => {
                let id = parse_hash(&params)?;
                Ok(json!(self.get_transaction_by_id(&id).await?))
            }
            "post_transaction" => {
                let params: PostTransactionParams = parse_params(params)?;
                Ok(json!(self.post_transaction(params).await?))
            }
            "get_connected_peers" => Ok(json!(self.get_connected_peers().await)),
            "get_schema" => Ok(json!(self.get_schema())),
            other => Err(RpcError::MethodNotFound(other.to_string())),
        }
    }

    pub async fn get_node_info(&self) -> Result<NodeInfo, RpcError> {
        Ok(NodeInfo {
            version: NODE_VERSION.to_string(),
            network_version: self.network_version.clone(),
            height: self.blockchain.get_height().await,
            finalized_height: self.blockchain.get_finalized_height().await,
            last_block_id: self.blockchain.get_tip_id().await,
            syncing: self.sync_active.load(Ordering::SeqCst),
            unconfirmed_tx_count: self.blockchain.mempool_len().await,
        })
    }

    pub async fn get_validators(&self) -> Result<Vec<ValidatorInfo>, RpcError> {
        let validators = self.blockchain.get_validators().await;
        let mut infos = Vec::with_capacity(validators.len());
        for (rank, address) in validators.iter().enumerate() {
            let account = self.blockchain.get_account(address).await?;
            let (username, total_votes_received) = account
                .and_then(|a| a.delegate)
                .map(|d| (d.username, d.total_votes_received))
                .unwrap_or_default();
            infos.push(ValidatorInfo {
                address: *address,
                username,
                total_votes_received,
                rank,
            });
        }

        Ok(infos)
    }

    pub async fn update_forging_status(
        &self,
        params: UpdateForgingStatusParams,
    ) -> Result<ForgingStatus, RpcError> {
        let forger = self
            .forger
            .as_ref()
            .ok_or_else(|| RpcError::InvalidParams("forging is not configured".into()))?;

        let forging = forger
            .update_forging_status(params.address, &params.password, params.forging)
            .await?;
        Ok(ForgingStatus {
            address: params.address,
            forging,
        })
    }

    pub async fn get_account(&self, address: &Address) -> Result<AccountView, RpcError> {
        let account = self
            .blockchain
            .get_account(address)
            .await?
            .ok_or(RpcError::NotFound)?;

        Ok(AccountView {
            address: account.address,
            balance: account.balance,
            nonce: account.nonce,
            delegate: account.delegate.as_ref().map(|d| d.username.clone()),
            total_votes_received: account
                .delegate
                .map(|d| d.total_votes_received)
                .unwrap_or(0),
        })
    }

    pub async fn get_block_by_id(&self, id: &Hash) -> Result<BlockView, RpcError> {
        let block = self
            .blockchain
            .get_block_by_id(id)
            .await?
            .ok_or(RpcError::NotFound)?;
        Ok(block_view(&block))
    }

    pub async fn get_block_by_height(&self, height: u64) -> Result<BlockView, RpcError> {
        let block = self
            .blockchain
            .get_block_by_height(height)
            .await?
            .ok_or(RpcError::NotFound)?;
        Ok(block_view(&block))
    }

    pub async fn get_last_block(&self) -> Result<BlockView, RpcError> {
        let id = self.blockchain.get_tip_id().await;
        self.get_block_by_id(&id).await
    }

    // Unconfirmed transactions only; settled ones live in their blocks
    pub async fn get_transaction_by_id(&self, id: &Hash) -> Result<TransactionView, RpcError> {
        let pooled = self.blockchain.get_pooled_transactions(&[id.clone()]).await;
        let tx = pooled.first().ok_or(RpcError::NotFound)?;
        Ok(transaction_view(tx))
    }

    pub async fn post_transaction(
        &self,
        params: PostTransactionParams,
    ) -> Result<PostTransactionResponse, RpcError> {
        let bytes = hex::decode(&params.transaction)
            .map_err(|_| RpcError::InvalidParams("transaction hex".into()))?;
        let tx =
            Transaction::from_bytes(&bytes).map_err(BlockchainError::from)?;
        let id = tx.id();

        self.blockchain.add_transaction(tx).await?;
        self.network.announce_transactions(&[id.clone()]).await;
        Ok(PostTransactionResponse { transaction_id: id })
    }

    // The module table composed at boot
    pub fn get_schema(&self) -> Vec<ModuleSchemaView> {
        self.blockchain
            .get_module_schemas()
            .into_iter()
            .map(|schema| ModuleSchemaView {
                module_id: schema.id,
                name: schema.name.to_string(),
                account_schema: schema.account_schema.iter().map(|f| f.to_string()).collect(),
                transaction_assets: schema.transaction_assets.to_vec(),
            })
            .collect()
    }

    pub async fn get_connected_peers(&self) -> Vec<PeerView> {
        self.network
            .get_connected_peers()
            .await
            .into_iter()
            .map(|peer| PeerView {
                peer_id: peer.peer_id.to_string(),
                height: peer.height,
                network_version: peer.network_version,
            })
            .collect()
    }
}

fn block_view(block: &Block) -> BlockView {
    let header = block.get_header();
    BlockView {
        id: block.hash(),
        height: header.height,
        timestamp: header.timestamp as u64,
        previous_block_id: header.previous_block_id.clone(),
        generator_public_key: header.generator_public_key.clone(),
        transaction_count: block.get_txs_count(),
        max_height_prevoted: header.asset.max_height_prevoted,
    }
}

fn transaction_view(tx: &Transaction) -> TransactionView {
    TransactionView {
        id: tx.id(),
        module_id: tx.get_module_id(),
        asset_id: tx.get_asset_id(),
        nonce: tx.get_nonce(),
        fee: tx.get_fee(),
        sender_public_key: tx.get_sender().clone(),
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(|err| RpcError::InvalidParams(err.to_string()))
}

fn parse_address(params: &Value) -> Result<Address, RpcError> {
    params
        .get("address")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| RpcError::InvalidParams("address".into()))
}

fn parse_hash(params: &Value) -> Result<Hash, RpcError> {
    params
        .get("id")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| RpcError::InvalidParams("id".into()))
}
