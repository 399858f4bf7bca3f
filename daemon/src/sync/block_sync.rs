use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::time::{sleep, Duration};

use atoll_common::{block::Block, crypto::Hashable};

use crate::{
    config::{SYNC_MAX_RETRIES, SYNC_MIN_PEERS, SYNC_RETRY_BACKOFF_MILLIS},
    core::{blockchain::Blockchain, storage::Storage},
    p2p::{PeerId, PeerInfo, PeerNetwork},
};

use super::{build_block_id_sample, revert_to_height, validate_chunk, SyncError, SyncMechanism};

// Catches up when the local tip is far behind the network: pick a
// reference peer agreeing with the majority, find the highest common
// block, revert to it and pull the missing chain in chunks.
pub struct BlockSyncMechanism<S: Storage> {
    blockchain: Arc<Blockchain<S>>,
    network: Arc<dyn PeerNetwork>,
    shutdown: Arc<AtomicBool>,
}

impl<S: Storage> BlockSyncMechanism<S> {
    pub fn new(
        blockchain: Arc<Blockchain<S>>,
        network: Arc<dyn PeerNetwork>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            blockchain,
            network,
            shutdown,
        }
    }

    // The reference peer: among peers whose prevote report reaches the
    // sample median, the largest group sharing one tip id must have at
    // least SYNC_MIN_PEERS members; the tallest member wins.
    fn select_reference_peer(mut peers: Vec<PeerInfo>) -> Result<PeerInfo, SyncError> {
        if peers.len() < SYNC_MIN_PEERS {
            return Err(SyncError::NotEnoughPeers(peers.len()));
        }

        let mut prevotes: Vec<u64> = peers.iter().map(|p| p.max_height_prevoted).collect();
        prevotes.sort_unstable();
        let median = prevotes[prevotes.len() / 2];

        peers.retain(|p| p.max_height_prevoted >= median);

        // group by tip id, deterministically
        peers.sort_by(|a, b| {
            a.tip_id
                .cmp(&b.tip_id)
                .then_with(|| b.height.cmp(&a.height))
        });

        let mut best: Option<(usize, PeerInfo)> = None;
        let mut index = 0;
        while index < peers.len() {
            let group_tip = peers[index].tip_id.clone();
            let group_start = index;
            while index < peers.len() && peers[index].tip_id == group_tip {
                index += 1;
            }

            let group_size = index - group_start;
            let leader = peers[group_start].clone();
            if best
                .as_ref()
                .map(|(size, _)| group_size > *size)
                .unwrap_or(true)
            {
                best = Some((group_size, leader));
            }
        }

        match best {
            Some((size, leader)) if size >= SYNC_MIN_PEERS => Ok(leader),
            Some((size, _)) => Err(SyncError::NotEnoughPeers(size)),
            None => Err(SyncError::NotEnoughPeers(0)),
        }
    }

    async fn fetch_chunk(&self, peer: PeerId) -> Result<Vec<Block>, SyncError> {
        let mut attempt = 0;
        loop {
            let from = self.blockchain.get_tip_id().await;
            match self.network.request_blocks_from_id(peer, &from).await {
                Ok(blocks) => return Ok(blocks),
                Err(err) => {
                    attempt += 1;
                    if attempt >= SYNC_MAX_RETRIES {
                        warn!("chunk request failed {} times: {}", attempt, err);
                        return Err(SyncError::RetriesExhausted(peer));
                    }

                    debug!("chunk request failed, retrying: {}", err);
                    sleep(Duration::from_millis(
                        SYNC_RETRY_BACKOFF_MILLIS * attempt as u64,
                    ))
                    .await;
                }
            }
        }
    }
}

#[async_trait]
impl<S: Storage> SyncMechanism<S> for BlockSyncMechanism<S> {
    fn name(&self) -> &'static str {
        "block synchronization"
    }

    async fn is_valid_for(&self, block: &Block, _peer: PeerId) -> Result<bool, SyncError> {
        // far ahead of the tip: the fast switch cannot bridge this
        let tip_height = self.blockchain.get_height().await;
        Ok(block.get_header().height > tip_height + 1)
    }

    async fn run(&self, block: &Block, peer: PeerId) -> Result<(), SyncError> {
        let peers = self.network.get_connected_peers().await;
        let reference = Self::select_reference_peer(peers)?;
        info!(
            "syncing against peer {} at height {} (received block {} from peer {})",
            reference.peer_id,
            reference.height,
            block.hash(),
            peer
        );

        // locate the highest common block with the reference peer
        let sample = build_block_id_sample(&self.blockchain).await?;
        let common = self
            .network
            .request_highest_common_block(reference.peer_id, &sample)
            .await?
            .ok_or(SyncError::NoCommonBlock(reference.peer_id))?;
        debug!("highest common block at height {}", common.height);

        revert_to_height(&self.blockchain, common.height, reference.peer_id).await?;

        // pull forward in chunks until the reference tip is reached
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Err(SyncError::Cancelled);
            }

            let tip_height = self.blockchain.get_height().await;
            if tip_height >= reference.height {
                break;
            }

            let chunk = self.fetch_chunk(reference.peer_id).await?;
            if chunk.is_empty() {
                debug!("reference peer has no more blocks at height {}", tip_height);
                break;
            }

            validate_chunk(
                &chunk,
                self.blockchain.get_tip_id().await,
                tip_height,
                reference.peer_id,
            )?;

            for block in chunk {
                self.blockchain.process_validated(block).await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atoll_common::crypto::hash;

    fn peer(id: PeerId, height: u64, prevoted: u64, tip: &[u8]) -> PeerInfo {
        PeerInfo {
            peer_id: id,
            height,
            max_height_prevoted: prevoted,
            tip_id: hash(tip),
            network_version: "1.0".into(),
        }
    }

    #[test]
    fn test_reference_selection_requires_quorum() {
        // three peers, three different tips: no group reaches quorum
        let peers = vec![
            peer(1, 100, 90, b"a"),
            peer(2, 100, 90, b"b"),
            peer(3, 100, 90, b"c"),
        ];
        assert!(matches!(
            BlockSyncMechanism::<crate::core::storage::SledStorage>::select_reference_peer(peers),
            Err(SyncError::NotEnoughPeers(1))
        ));
    }

    #[test]
    fn test_reference_selection_majority_tip() {
        let peers = vec![
            peer(1, 200, 190, b"major"),
            peer(2, 201, 191, b"major"),
            peer(3, 199, 190, b"major"),
            peer(4, 300, 10, b"minor"),
        ];
        let reference =
            BlockSyncMechanism::<crate::core::storage::SledStorage>::select_reference_peer(peers)
                .unwrap();
        assert_eq!(reference.tip_id, hash(b"major"));
        // tallest member of the winning group
        assert_eq!(reference.peer_id, 2);
    }

    #[test]
    fn test_reference_selection_too_few_peers() {
        let peers = vec![peer(1, 100, 90, b"a")];
        assert!(matches!(
            BlockSyncMechanism::<crate::core::storage::SledStorage>::select_reference_peer(peers),
            Err(SyncError::NotEnoughPeers(1))
        ));
    }
}
