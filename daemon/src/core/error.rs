use thiserror::Error;

use atoll_common::{
    crypto::{Address, CryptoError, Hash},
    serializer::ReaderError,
    transaction::TransactionError,
};

use crate::core::{mempool::PoolError, modules::ModuleError};

#[derive(Debug, Error)]
pub enum ForkError {
    // The chain can converge again through a sync mechanism
    #[error("Recoverable fork detected at height {height}")]
    Recoverable { height: u64 },

    // The peer chain contradicts a finalized block
    #[error("Irrecoverable fork: received height {height} at or below finalized height {finalized}")]
    Irrecoverable { height: u64, finalized: u64 },
}

#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Malformed payload: {0}")]
    Schema(#[from] ReaderError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error(transparent)]
    Fork(#[from] ForkError),

    #[error("Pool rejected transaction: {0}")]
    PoolRejected(#[from] PoolError),

    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("Genesis block mismatch: stored {stored}, supplied {supplied}")]
    GenesisMismatch { stored: Hash, supplied: Hash },

    #[error("Block {0} not found")]
    BlockNotFound(Hash),

    #[error("No block stored at height {0}")]
    HeightNotFound(u64),

    #[error("Account {0} not found")]
    AccountNotFound(Address),

    #[error("Chain has no tip, storage not initialized")]
    NotInitialized,

    #[error("Invalid block version {0}")]
    InvalidBlockVersion(u32),

    #[error("Invalid block signature for block {0}")]
    InvalidBlockSignature(Hash),

    #[error("Block timestamp {timestamp} is ahead of the current slot")]
    TimestampInFuture { timestamp: u32 },

    #[error("Block generator is not the delegate assigned to slot {slot}")]
    WrongForger { slot: u64 },

    #[error("Block payload size {size} exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Transaction root does not match payload")]
    InvalidTransactionRoot,

    #[error("Stale block {id} at height {height}, chain is at {tip_height}")]
    StaleBlock {
        id: Hash,
        height: u64,
        tip_height: u64,
    },

    #[error("Block {0} is already the chain tip")]
    AlreadyInChain(Hash),

    #[error("Block {id} does not extend the current tip")]
    DoesNotExtendTip { id: Hash },

    #[error("Invalid nonce for {address}: expected {expected}, got {got}")]
    InvalidNonce {
        address: Address,
        expected: u64,
        got: u64,
    },

    #[error("Fee {fee} below minimum {min_fee} for transaction {id}")]
    FeeTooLow { id: Hash, fee: u64, min_fee: u64 },

    #[error("Insufficient balance for {address}: need {need}, have {have}")]
    InsufficientBalance {
        address: Address,
        need: u64,
        have: u64,
    },

    #[error("BFT contradiction: declared previously forged height {declared} not below block height {height}")]
    BftContradiction { declared: u64, height: u64 },

    #[error("BFT monotonicity violation: declared previously forged height {declared} below recorded {recorded}")]
    BftMonotonicity { declared: u64, recorded: u64 },

    // Process-fatal: finality must never move backwards
    #[error("Finality regression from {from} to {to}")]
    FinalityRegression { from: u64, to: u64 },

    #[error("Cannot delete the genesis block")]
    CannotDeleteGenesis,

    #[error("Cannot delete finalized block at height {0}")]
    CannotDeleteFinalized(u64),

    #[error("Undo journal missing for block {0}")]
    JournalMissing(Hash),

    #[error("No validator set available")]
    NoValidators,
}
