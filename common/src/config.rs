use serde::{Deserialize, Serialize};

use crate::{
    crypto::{Address, PublicKey},
    time::TimestampSeconds,
};

// In case of potential forks, have a unique network id to not connect to other compatible chains
pub const NETWORK_ID_SIZE: usize = 16;
pub const NETWORK_ID: [u8; NETWORK_ID_SIZE] = [
    0x61, 0x74, 0x6f, 0x6c, 0x6c, 0x20, 0x6d, 0x61, 0x69, 0x6e, 0x6e, 0x65, 0x74, 0x20, 0x76, 0x31,
];

// 1 ATL = 10^8 base units
pub const COIN_VALUE: u64 = 100_000_000;

// Default slot width in seconds
pub const DEFAULT_BLOCK_TIME: TimestampSeconds = 10;

// Default number of active delegates per round
pub const DEFAULT_ACTIVE_DELEGATES: u32 = 101;

// Default prevote supermajority (> 2/3 of 101)
pub const DEFAULT_BFT_THRESHOLD: u32 = 68;

// Default block payload byte cap
pub const DEFAULT_MAX_PAYLOAD_LENGTH: u32 = 15 * 1024;

// Default fee floor per encoded transaction byte
pub const DEFAULT_MIN_FEE_PER_BYTE: u64 = 1_000;

// Module / asset identifiers of the built-in modules
pub const TOKEN_MODULE_ID: u32 = 2;
pub const TOKEN_ASSET_TRANSFER: u32 = 0;
pub const DPOS_MODULE_ID: u32 = 5;
pub const DPOS_ASSET_REGISTER_DELEGATE: u32 = 0;
pub const DPOS_ASSET_VOTE_DELEGATE: u32 = 1;

// Extra flat fee for registering a delegate name
pub const DEFAULT_DELEGATE_REGISTRATION_FEE: u64 = 10 * COIN_VALUE;

// Vote amounts must be multiples of this granularity
pub const VOTE_AMOUNT_STEP: u64 = 10 * COIN_VALUE;

// Max number of votes carried by a single vote transaction
pub const MAX_VOTES_PER_TRANSACTION: usize = 20;

// Max bytes of attached transfer data (memo)
pub const MAX_TRANSFER_DATA_SIZE: usize = 64;

// Delegate username constraints
pub const MAX_USERNAME_LENGTH: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseFee {
    pub module_id: u32,
    pub asset_id: u32,
    pub base_fee: u64,
}

// Per-block reward schedule: `milestones[i]` applies from
// `offset + i * distance` onward, the last milestone applies forever.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardSchedule {
    pub milestones: Vec<u64>,
    pub offset: u64,
    pub distance: u64,
}

impl RewardSchedule {
    pub fn reward_at_height(&self, height: u64) -> u64 {
        if height < self.offset || self.milestones.is_empty() || self.distance == 0 {
            return 0;
        }

        let index = ((height - self.offset) / self.distance) as usize;
        let index = index.min(self.milestones.len() - 1);
        self.milestones[index]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisAccount {
    pub address: Address,
    pub balance: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisDelegate {
    pub username: String,
    pub public_key: PublicKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisConfig {
    #[serde(default = "default_block_time")]
    pub block_time: TimestampSeconds,
    #[serde(default = "default_bft_threshold")]
    pub bft_threshold: u32,
    #[serde(default = "default_active_delegates")]
    pub active_delegates: u32,
    #[serde(default = "default_max_payload_length")]
    pub max_payload_length: u32,
    #[serde(default = "default_min_fee_per_byte")]
    pub min_fee_per_byte: u64,
    #[serde(default)]
    pub base_fees: Vec<BaseFee>,
    pub rewards: RewardSchedule,
    // Unix timestamp of the genesis block, slot 0 starts here
    pub genesis_timestamp: TimestampSeconds,
    #[serde(default)]
    pub initial_accounts: Vec<GenesisAccount>,
    pub initial_delegates: Vec<GenesisDelegate>,
}

impl GenesisConfig {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn base_fee(&self, module_id: u32, asset_id: u32) -> u64 {
        self.base_fees
            .iter()
            .find(|f| f.module_id == module_id && f.asset_id == asset_id)
            .map(|f| f.base_fee)
            .unwrap_or(0)
    }

    // Full round of slots covering one validator set rotation
    pub fn round_length(&self) -> u64 {
        self.active_delegates as u64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashOnionConfig {
    // Number of layers in the precomputed chain
    pub count: u64,
    // Encrypted 32-byte seed (hex of nonce + ciphertext)
    pub encrypted_seed: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegateConfig {
    pub address: Address,
    // Encrypted secret key (hex of nonce + ciphertext)
    pub encrypted_passphrase: String,
    pub hash_onion: HashOnionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgingConfig {
    // Seconds into the slot to wait for more transactions before forging
    #[serde(default = "default_wait_threshold")]
    pub wait_threshold: TimestampSeconds,
    // Test override: forge even when the pool is empty
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub default_password: Option<String>,
    #[serde(default)]
    pub delegates: Vec<DelegateConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub network_version: String,
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    #[serde(default)]
    pub seed_peers: Vec<String>,
}

fn default_block_time() -> TimestampSeconds {
    DEFAULT_BLOCK_TIME
}

fn default_bft_threshold() -> u32 {
    DEFAULT_BFT_THRESHOLD
}

fn default_active_delegates() -> u32 {
    DEFAULT_ACTIVE_DELEGATES
}

fn default_max_payload_length() -> u32 {
    DEFAULT_MAX_PAYLOAD_LENGTH
}

fn default_min_fee_per_byte() -> u64 {
    DEFAULT_MIN_FEE_PER_BYTE
}

fn default_wait_threshold() -> TimestampSeconds {
    2
}

fn default_max_peers() -> usize {
    32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reward_schedule() {
        let schedule = RewardSchedule {
            milestones: vec![500, 400, 300],
            offset: 10,
            distance: 100,
        };

        assert_eq!(schedule.reward_at_height(0), 0);
        assert_eq!(schedule.reward_at_height(9), 0);
        assert_eq!(schedule.reward_at_height(10), 500);
        assert_eq!(schedule.reward_at_height(109), 500);
        assert_eq!(schedule.reward_at_height(110), 400);
        assert_eq!(schedule.reward_at_height(210), 300);
        // last milestone applies forever
        assert_eq!(schedule.reward_at_height(1_000_000), 300);
    }
}
