use clap::Parser;

use atoll_common::time::TimestampMillis;

// Millis per second, it is used to prevent having random 1000 values anywhere
pub const MILLIS_PER_SECOND: u64 = 1000;

// Forger tick interval. Short enough that a slot is never missed by a
// whole tick, long enough to stay cheap when idle.
pub const FORGE_INTERVAL_MILLIS: TimestampMillis = 1000;

// Blocks per chunk requested during block synchronization.
// Part of the peer protocol: getBlocksFromId never returns more.
pub const SYNC_CHUNK_SIZE: u64 = 34;

// Retries per sync chunk before the mechanism aborts
pub const SYNC_MAX_RETRIES: usize = 3;

// Base backoff between chunk retries
pub const SYNC_RETRY_BACKOFF_MILLIS: TimestampMillis = 500;

// Minimum number of peers that must agree on the same tip before the
// block synchronization mechanism trusts a reference peer
pub const SYNC_MIN_PEERS: usize = 3;

// Bounded number of superseded blocks kept in the temp region
pub const TEMP_REGION_CAPACITY: usize = 256;

// Transaction pool bounds
pub const MEMPOOL_MAX_SIZE: usize = 4096;
pub const MEMPOOL_MAX_PER_SENDER: usize = 64;

// An existing pool transaction is only replaced by a same-nonce
// transaction paying at least fee * REPLACE_FACTOR_NUM / REPLACE_FACTOR_DEN
pub const REPLACE_FACTOR_NUM: u64 = 11;
pub const REPLACE_FACTOR_DEN: u64 = 10;

// Unconfirmed transactions older than this are swept out of the pool
pub const MEMPOOL_EXPIRY_SECONDS: u64 = 3 * 60 * 60;

// Period of the expiry sweep task
pub const MEMPOOL_SWEEP_INTERVAL_MILLIS: TimestampMillis = 30_000;

// Cached decoded blocks in the storage layer
pub const BLOCK_CACHE_SIZE: usize = 1024;

// Peer penalties, peers reaching 100 are disconnected by the network layer
pub const PENALTY_MALFORMED: u32 = 100;
pub const PENALTY_INVALID_BLOCK: u32 = 100;
pub const PENALTY_IRRECOVERABLE_FORK: u32 = 100;
pub const PENALTY_STALE_BLOCK: u32 = 10;

// Transaction announcement rate limiting, per peer
pub const ANNOUNCE_RATE_WINDOW_SECONDS: u64 = 10;
pub const ANNOUNCE_RATE_LIMIT: usize = 500;

// Default locations
pub const DEFAULT_DATA_DIR: &str = "atoll-data";
pub const DEFAULT_GENESIS_FILE: &str = "genesis.json";

#[derive(Parser, Debug, Clone)]
#[command(name = "atoll_daemon", about = "Atoll Network blockchain daemon", version)]
pub struct NodeConfig {
    /// Directory holding the key-value store
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: String,

    /// Path to the genesis configuration (JSON)
    #[arg(long, default_value = DEFAULT_GENESIS_FILE)]
    pub genesis_config: String,

    /// Path to the forging configuration (JSON); forging is disabled without it
    #[arg(long)]
    pub forging_config: Option<String>,

    /// Path to the network configuration (JSON)
    #[arg(long)]
    pub network_config: Option<String>,

    /// Enable forging at boot for all configured delegates using the default password
    #[arg(long, default_value_t = false)]
    pub force_forging: bool,

    /// Log level filter (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
