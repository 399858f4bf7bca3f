// Operator-surface DTOs.
//
// Consensus types stay raw bytes internally; these views render ids and
// keys as hex strings for the RPC layer and tooling. They are not part
// of the consensus contract and may gain fields freely.

use serde::{Deserialize, Serialize};

use crate::{
    crypto::{Address, Hash, PublicKey},
    time::TimestampSeconds,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub version: String,
    pub network_version: String,
    pub height: u64,
    pub finalized_height: u64,
    pub last_block_id: Hash,
    pub syncing: bool,
    pub unconfirmed_tx_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorInfo {
    pub address: Address,
    pub username: String,
    pub total_votes_received: u64,
    // Slot index inside the current round
    pub rank: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateForgingStatusParams {
    pub address: Address,
    pub password: String,
    pub forging: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgingStatus {
    pub address: Address,
    pub forging: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountView {
    pub address: Address,
    pub balance: u64,
    pub nonce: u64,
    pub delegate: Option<String>,
    pub total_votes_received: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockView {
    pub id: Hash,
    pub height: u64,
    pub timestamp: TimestampSeconds,
    pub previous_block_id: Hash,
    pub generator_public_key: PublicKey,
    pub transaction_count: usize,
    pub max_height_prevoted: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionView {
    pub id: Hash,
    pub module_id: u32,
    pub asset_id: u32,
    pub nonce: u64,
    pub fee: u64,
    pub sender_public_key: PublicKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostTransactionParams {
    // Hex of the canonical transaction encoding
    pub transaction: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostTransactionResponse {
    pub transaction_id: Hash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerView {
    pub peer_id: String,
    pub height: u64,
    pub network_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleSchemaView {
    pub module_id: u32,
    pub name: String,
    pub account_schema: Vec<String>,
    pub transaction_assets: Vec<u32>,
}
