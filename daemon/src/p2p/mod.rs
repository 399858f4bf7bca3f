mod packet;

pub use packet::{CommonBlock, Packet};

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use log::{debug, trace, warn};
use thiserror::Error;
use tokio::sync::Mutex;

use atoll_common::{
    block::Block,
    crypto::{Hash, Hashable},
    serializer::Serializer,
    time::get_current_time_in_seconds,
    transaction::Transaction,
};

use crate::{
    config::{
        ANNOUNCE_RATE_LIMIT, ANNOUNCE_RATE_WINDOW_SECONDS, PENALTY_INVALID_BLOCK,
        PENALTY_MALFORMED, PENALTY_STALE_BLOCK, SYNC_CHUNK_SIZE,
    },
    core::{
        blockchain::{BlockOrigin, Blockchain},
        error::{BlockchainError, ForkError},
        storage::Storage,
    },
};

pub type PeerId = u64;

// What the peer layer knows about a connected peer, refreshed by its
// periodic status messages
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub height: u64,
    pub max_height_prevoted: u64,
    pub tip_id: Hash,
    pub network_version: String,
}

#[derive(Debug, Error)]
pub enum P2pError {
    #[error("Request to peer {0} timed out")]
    Timeout(PeerId),

    #[error("Peer {0} is not connected")]
    PeerNotConnected(PeerId),

    #[error("Peer {0} returned a malformed response")]
    MalformedResponse(PeerId),

    #[error("Chain response size {got} exceeds the requested maximum {max}")]
    InvalidChainResponseSize { got: usize, max: usize },
}

// Contract with the external peer-to-peer layer: ordered byte messages
// keyed by peer id, request/response RPCs and penalties. Peer scoring
// and connection management live on the other side of this trait.
#[async_trait]
pub trait PeerNetwork: Send + Sync + 'static {
    async fn get_connected_peers(&self) -> Vec<PeerInfo>;

    // Up to SYNC_CHUNK_SIZE blocks following `from` on the peer's chain
    async fn request_blocks_from_id(
        &self,
        peer: PeerId,
        from: &Hash,
    ) -> Result<Vec<Block>, P2pError>;

    // The highest of `ids` the peer has on its main chain
    async fn request_highest_common_block(
        &self,
        peer: PeerId,
        ids: &[Hash],
    ) -> Result<Option<CommonBlock>, P2pError>;

    async fn request_transactions(
        &self,
        peer: PeerId,
        ids: &[Hash],
    ) -> Result<Vec<Transaction>, P2pError>;

    async fn broadcast_block(&self, block: &Block);

    async fn announce_transactions(&self, ids: &[Hash]);

    // Penalties accumulate on the peer's score; 100 disconnects it
    async fn apply_penalty(&self, peer: PeerId, points: u32);
}

// Standalone operation: no peers, broadcasts vanish. Used when the node
// runs without a network backend and by parts of the test suite.
pub struct OfflineNetwork;

#[async_trait]
impl PeerNetwork for OfflineNetwork {
    async fn get_connected_peers(&self) -> Vec<PeerInfo> {
        Vec::new()
    }

    async fn request_blocks_from_id(
        &self,
        peer: PeerId,
        _from: &Hash,
    ) -> Result<Vec<Block>, P2pError> {
        Err(P2pError::PeerNotConnected(peer))
    }

    async fn request_highest_common_block(
        &self,
        peer: PeerId,
        _ids: &[Hash],
    ) -> Result<Option<CommonBlock>, P2pError> {
        Err(P2pError::PeerNotConnected(peer))
    }

    async fn request_transactions(
        &self,
        peer: PeerId,
        _ids: &[Hash],
    ) -> Result<Vec<Transaction>, P2pError> {
        Err(P2pError::PeerNotConnected(peer))
    }

    async fn broadcast_block(&self, _block: &Block) {}

    async fn announce_transactions(&self, _ids: &[Hash]) {}

    async fn apply_penalty(&self, _peer: PeerId, _points: u32) {}
}

struct AnnounceWindow {
    window_start: u64,
    count: usize,
}

// Thin adapter between the peer network and the processor/pool: decodes
// inbound packets, applies penalties, serves the three peer RPCs and
// pushes outbound broadcasts.
pub struct Transport<S: Storage> {
    blockchain: Arc<Blockchain<S>>,
    network: Arc<dyn PeerNetwork>,
    // Held by the synchronizer; inbound blocks are dropped while it runs
    sync_active: Arc<AtomicBool>,
    announce_windows: Mutex<HashMap<PeerId, AnnounceWindow>>,
}

impl<S: Storage> Transport<S> {
    pub fn new(
        blockchain: Arc<Blockchain<S>>,
        network: Arc<dyn PeerNetwork>,
        sync_active: Arc<AtomicBool>,
    ) -> Self {
        Self {
            blockchain,
            network,
            sync_active,
            announce_windows: Mutex::new(HashMap::new()),
        }
    }

    // Entry point for every inbound message. Returns the encoded
    // response for request packets, None otherwise. Never fails the
    // process: errors translate to drops and penalties.
    pub async fn handle_message(&self, peer: PeerId, bytes: &[u8]) -> Option<Vec<u8>> {
        let packet = match Packet::from_bytes(bytes) {
            Ok(packet) => packet,
            Err(err) => {
                debug!("malformed packet from peer {}: {}", peer, err);
                self.network.apply_penalty(peer, PENALTY_MALFORMED).await;
                return None;
            }
        };

        match packet {
            Packet::PostBlock(block) => {
                self.handle_post_block(peer, block).await;
                None
            }
            Packet::PostTransaction(tx) => {
                self.handle_post_transaction(peer, tx).await;
                None
            }
            Packet::TransactionsAnnouncement(ids) => {
                self.handle_transactions_announcement(peer, ids).await;
                None
            }
            Packet::BlocksFromIdRequest { block_id } => {
                let blocks = self.handle_get_blocks_from_id(&block_id).await;
                Some(Packet::BlocksFromIdResponse(blocks).to_bytes())
            }
            Packet::CommonBlockRequest(ids) => {
                let common = self.handle_get_highest_common_block(&ids).await;
                Some(Packet::CommonBlockResponse(common).to_bytes())
            }
            Packet::TransactionsRequest(ids) => {
                let txs = self.handle_get_transactions(&ids).await;
                Some(Packet::TransactionsResponse(txs).to_bytes())
            }
            // responses arrive through the request futures of the
            // network layer, not here
            Packet::BlocksFromIdResponse(_)
            | Packet::CommonBlockResponse(_)
            | Packet::TransactionsResponse(_) => {
                self.network.apply_penalty(peer, PENALTY_MALFORMED).await;
                None
            }
        }
    }

    pub async fn handle_post_block(&self, peer: PeerId, block: Block) {
        if self.sync_active.load(Ordering::SeqCst) {
            trace!("sync active, dropping block from peer {}", peer);
            return;
        }

        match self
            .blockchain
            .process(block, BlockOrigin::Peer(peer))
            .await
        {
            Ok(()) => {}
            Err(BlockchainError::StaleBlock { id, .. }) => {
                trace!("stale block {} from peer {}", id, peer);
                self.network.apply_penalty(peer, PENALTY_STALE_BLOCK).await;
            }
            Err(BlockchainError::Fork(ForkError::Irrecoverable { height, finalized })) => {
                warn!(
                    "irrecoverable fork attempt by peer {}: height {} vs finalized {}",
                    peer, height, finalized
                );
                self.network
                    .apply_penalty(peer, crate::config::PENALTY_IRRECOVERABLE_FORK)
                    .await;
            }
            Err(BlockchainError::Storage(err)) => {
                // local fault, not the peer's
                warn!("storage error while processing peer block: {}", err);
            }
            Err(err) => {
                debug!("invalid block from peer {}: {}", peer, err);
                self.network.apply_penalty(peer, PENALTY_INVALID_BLOCK).await;
            }
        }
    }

    pub async fn handle_post_transaction(&self, peer: PeerId, tx: Transaction) {
        let id = tx.id();
        match self.blockchain.add_transaction(tx).await {
            Ok(()) => {
                // relay to the rest of the network by announcement
                self.network.announce_transactions(&[id]).await;
            }
            Err(BlockchainError::PoolRejected(err)) => {
                trace!("pool rejected transaction from peer {}: {}", peer, err);
            }
            Err(BlockchainError::Storage(err)) => {
                warn!("storage error while admitting transaction: {}", err);
            }
            Err(err) => {
                debug!("invalid transaction from peer {}: {}", peer, err);
                self.network.apply_penalty(peer, PENALTY_MALFORMED).await;
            }
        }
    }

    pub async fn handle_transactions_announcement(&self, peer: PeerId, ids: Vec<Hash>) {
        if !self.within_announce_rate(peer, ids.len()).await {
            debug!("announcement rate exceeded by peer {}, dropping", peer);
            return;
        }

        let mut unknown = Vec::new();
        for id in ids {
            if !self.blockchain.mempool_contains(&id).await {
                unknown.push(id);
            }
        }
        if unknown.is_empty() {
            return;
        }

        match self.network.request_transactions(peer, &unknown).await {
            Ok(txs) => {
                for tx in txs {
                    if let Err(err) = self.blockchain.add_transaction(tx).await {
                        trace!("announced transaction rejected: {}", err);
                    }
                }
            }
            Err(err) => {
                debug!("failed to fetch announced transactions from {}: {}", peer, err);
            }
        }
    }

    // getBlocksFromId: up to SYNC_CHUNK_SIZE blocks following the given id
    pub async fn handle_get_blocks_from_id(&self, block_id: &Hash) -> Vec<Block> {
        match self.blockchain.get_blocks_from(block_id, SYNC_CHUNK_SIZE).await {
            Ok(blocks) => blocks,
            Err(BlockchainError::BlockNotFound(_)) => Vec::new(),
            Err(err) => {
                warn!("failed to serve blocks from {}: {}", block_id, err);
                Vec::new()
            }
        }
    }

    pub async fn handle_get_highest_common_block(&self, ids: &[Hash]) -> Option<CommonBlock> {
        match self.blockchain.find_highest_common_block(ids).await {
            Ok(Some((id, height))) => Some(CommonBlock { id, height }),
            Ok(None) => None,
            Err(err) => {
                warn!("failed to compute highest common block: {}", err);
                None
            }
        }
    }

    pub async fn handle_get_transactions(&self, ids: &[Hash]) -> Vec<Transaction> {
        self.blockchain
            .get_pooled_transactions(ids)
            .await
            .into_iter()
            .map(|tx| (*tx).clone())
            .collect()
    }

    // Outbound side: forward broadcast events to the network layer.
    // Runs until the event bus closes.
    pub async fn run_broadcast_loop(&self) {
        let mut events = self.blockchain.get_events().subscribe();
        loop {
            match events.recv().await {
                Ok(crate::events::Event::BroadcastBlock { block }) => {
                    debug!("broadcasting block {}", block.hash());
                    self.network.broadcast_block(&block).await;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("broadcast loop lagged, skipped {} events", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn within_announce_rate(&self, peer: PeerId, count: usize) -> bool {
        let now = get_current_time_in_seconds();
        let mut windows = self.announce_windows.lock().await;
        let window = windows.entry(peer).or_insert(AnnounceWindow {
            window_start: now,
            count: 0,
        });

        if now.saturating_sub(window.window_start) > ANNOUNCE_RATE_WINDOW_SECONDS {
            window.window_start = now;
            window.count = 0;
        }

        window.count += count;
        window.count <= ANNOUNCE_RATE_LIMIT
    }
}
