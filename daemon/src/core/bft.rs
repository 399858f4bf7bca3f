use std::collections::HashMap;

use log::{debug, info, trace};

use atoll_common::{
    block::BlockHeader,
    crypto::Address,
    serializer::{Reader, ReaderError, Serializer, Writer},
};

use crate::core::{error::BlockchainError, storage::{BftProvider, Storage}};

// Per-validator vote state extracted from recent block headers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatorRecord {
    // Height this validator asserts as prevoted
    pub max_height_prevoted: u64,
    // Largest previously-forged height the validator has declared
    pub max_height_previously_forged: u64,
    // Height of the last block we have seen from this validator,
    // the value it must declare in its next header
    pub last_forged_height: u64,
}

impl Serializer for ValidatorRecord {
    fn write(&self, writer: &mut Writer) {
        writer.write_varuint(self.max_height_prevoted);
        writer.write_varuint(self.max_height_previously_forged);
        writer.write_varuint(self.last_forged_height);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let max_height_prevoted = reader.read_varuint()?;
        let max_height_previously_forged = reader.read_varuint()?;
        let last_forged_height = reader.read_varuint()?;
        Ok(Self {
            max_height_prevoted,
            max_height_previously_forged,
            last_forged_height,
        })
    }
}

// Everything the processor must persist and journal after one header
// moved the finality state.
pub struct BftUpdate {
    pub validator: Address,
    // Encoded record before this block, None if the validator was unknown
    pub previous_record: Option<Vec<u8>>,
    pub new_record: ValidatorRecord,
    pub previous_prevoted: u64,
    pub new_prevoted: u64,
    // Set when the finalized height advanced
    pub new_finalized: Option<u64>,
}

// Tracks prevotes implied by block headers and derives the finalized
// height. Pure function of the stored headers and the validator set;
// persisted state is re-loaded at boot.
pub struct FinalityManager {
    threshold: u32,
    ledger: HashMap<Address, ValidatorRecord>,
    pre_voted_confirmed_height: u64,
    finalized_height: u64,
}

impl FinalityManager {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            ledger: HashMap::new(),
            pre_voted_confirmed_height: 0,
            finalized_height: 0,
        }
    }

    pub async fn load<S: Storage>(storage: &S, threshold: u32) -> Result<Self, BlockchainError> {
        let mut manager = Self::new(threshold);
        for (address, bytes) in storage.get_all_bft_records().await? {
            manager
                .ledger
                .insert(address, ValidatorRecord::from_bytes(&bytes)?);
        }

        manager.pre_voted_confirmed_height = storage.get_prevoted_height().await?;
        manager.finalized_height = storage.get_finalized_height().await?;
        debug!(
            "loaded finality state: {} validator records, prevoted {}, finalized {}",
            manager.ledger.len(),
            manager.pre_voted_confirmed_height,
            manager.finalized_height
        );
        Ok(manager)
    }

    pub fn get_finalized_height(&self) -> u64 {
        self.finalized_height
    }

    pub fn get_prevoted_height(&self) -> u64 {
        self.pre_voted_confirmed_height
    }

    pub fn get_record(&self, validator: &Address) -> Option<&ValidatorRecord> {
        self.ledger.get(validator)
    }

    // Header admission rules: a declared previously-forged height must be
    // below the block height and must never move backwards.
    pub fn verify_header(&self, header: &BlockHeader) -> Result<(), BlockchainError> {
        let declared = header.asset.max_height_previously_forged;
        if declared >= header.height {
            return Err(BlockchainError::BftContradiction {
                declared,
                height: header.height,
            });
        }

        let validator = header.generator_public_key.to_address();
        if let Some(record) = self.ledger.get(&validator) {
            if declared < record.max_height_previously_forged {
                return Err(BlockchainError::BftMonotonicity {
                    declared,
                    recorded: record.max_height_previously_forged,
                });
            }
        }

        Ok(())
    }

    // Record the header's implied votes and re-derive both heights.
    // `validators` is the active set for the block's round.
    pub fn apply_header(
        &mut self,
        header: &BlockHeader,
        validators: &[Address],
    ) -> Result<BftUpdate, BlockchainError> {
        self.verify_header(header)?;

        let validator = header.generator_public_key.to_address();
        let previous_record = self.ledger.get(&validator).map(|r| r.to_bytes());

        // forging a block is itself a prevote for its height: the
        // generator has seen and accepted everything below it
        let new_record = ValidatorRecord {
            max_height_prevoted: header.asset.max_height_prevoted.max(header.height),
            max_height_previously_forged: header.asset.max_height_previously_forged,
            last_forged_height: header.height,
        };
        self.ledger.insert(validator, new_record.clone());

        let previous_prevoted = self.pre_voted_confirmed_height;
        self.pre_voted_confirmed_height = self.derive_prevoted_height(validators);

        // Largest h with h + threshold <= tip and prevoted confirmation >= h
        let candidate = self
            .pre_voted_confirmed_height
            .min(header.height.saturating_sub(self.threshold as u64));

        let new_finalized = if candidate > self.finalized_height {
            info!(
                "finalized height advances {} -> {}",
                self.finalized_height, candidate
            );
            self.finalized_height = candidate;
            Some(candidate)
        } else {
            None
        };

        Ok(BftUpdate {
            validator,
            previous_record,
            new_record,
            previous_prevoted,
            new_prevoted: self.pre_voted_confirmed_height,
            new_finalized,
        })
    }

    // Undo the ledger effect of a reverted header. The persisted record
    // was already restored through the undo journal; this realigns the
    // in-memory mirror. The finalized height is untouched, reverting a
    // finalized block is forbidden upstream.
    pub fn revert_header(
        &mut self,
        header: &BlockHeader,
        previous: Option<ValidatorRecord>,
        validators: &[Address],
    ) {
        let validator = header.generator_public_key.to_address();
        match previous {
            Some(record) => {
                self.ledger.insert(validator, record);
            }
            None => {
                self.ledger.remove(&validator);
            }
        }

        self.pre_voted_confirmed_height = self.derive_prevoted_height(validators);
        trace!(
            "reverted bft record of {}, prevoted height now {}",
            validator,
            self.pre_voted_confirmed_height
        );
    }

    // Largest h such that at least `threshold` active validators have
    // max_height_prevoted >= h
    fn derive_prevoted_height(&self, validators: &[Address]) -> u64 {
        let threshold = self.threshold as usize;
        if threshold == 0 || validators.is_empty() {
            return 0;
        }

        let mut prevotes: Vec<u64> = validators
            .iter()
            .map(|v| {
                self.ledger
                    .get(v)
                    .map(|r| r.max_height_prevoted)
                    .unwrap_or(0)
            })
            .collect();

        if prevotes.len() < threshold {
            return 0;
        }

        prevotes.sort_unstable_by(|a, b| b.cmp(a));
        prevotes[threshold - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atoll_common::{
        block::{BlockAsset, BLOCK_VERSION},
        crypto::{Hash, KeyPair, HASH_SIZE},
    };

    fn header_for(keypair: &KeyPair, height: u64, prevoted: u64, previously_forged: u64) -> BlockHeader {
        BlockHeader::new(
            BLOCK_VERSION,
            height,
            (height * 10) as u32,
            Hash::zero(),
            keypair.get_public_key().clone(),
            Hash::zero(),
            BlockAsset::new(previously_forged, prevoted, [0u8; HASH_SIZE]),
        )
    }

    fn validator_set(keypairs: &[KeyPair]) -> Vec<Address> {
        keypairs.iter().map(|k| k.get_address()).collect()
    }

    #[test]
    fn test_contradiction_rejected() {
        let manager = FinalityManager::new(2);
        let keypair = KeyPair::generate();
        // declares having already forged at its own height
        let header = header_for(&keypair, 5, 0, 5);
        assert!(matches!(
            manager.verify_header(&header),
            Err(BlockchainError::BftContradiction { .. })
        ));
    }

    #[test]
    fn test_monotonicity_rejected() {
        let mut manager = FinalityManager::new(2);
        let keypairs: Vec<KeyPair> = (0..3).map(|_| KeyPair::generate()).collect();
        let validators = validator_set(&keypairs);

        manager
            .apply_header(&header_for(&keypairs[0], 10, 0, 8), &validators)
            .unwrap();
        // next declaration moves backwards
        let header = header_for(&keypairs[0], 12, 0, 7);
        assert!(matches!(
            manager.verify_header(&header),
            Err(BlockchainError::BftMonotonicity { .. })
        ));
    }

    #[test]
    fn test_prevoted_height_needs_threshold() {
        let mut manager = FinalityManager::new(2);
        let keypairs: Vec<KeyPair> = (0..3).map(|_| KeyPair::generate()).collect();
        let validators = validator_set(&keypairs);

        let update = manager
            .apply_header(&header_for(&keypairs[0], 1, 5, 0), &validators)
            .unwrap();
        // only one validator prevoted >= 5
        assert_eq!(update.new_prevoted, 0);

        let update = manager
            .apply_header(&header_for(&keypairs[1], 2, 5, 0), &validators)
            .unwrap();
        assert_eq!(update.new_prevoted, 5);
    }

    #[test]
    fn test_finality_advances_and_is_monotone() {
        let mut manager = FinalityManager::new(2);
        let keypairs: Vec<KeyPair> = (0..3).map(|_| KeyPair::generate()).collect();
        let validators = validator_set(&keypairs);

        // one prevote is below the threshold, nothing finalizes
        let update = manager
            .apply_header(&header_for(&keypairs[0], 5, 4, 3), &validators)
            .unwrap();
        assert_eq!(update.new_finalized, None);

        // second prevote reaches the threshold:
        // finalized = min(prevoted 5, tip 6 - threshold 2) = 4
        let update = manager
            .apply_header(&header_for(&keypairs[1], 6, 4, 0), &validators)
            .unwrap();
        assert_eq!(update.new_finalized, Some(4));
        assert_eq!(manager.get_finalized_height(), 4);

        // the next block moves finality forward, never backwards
        let update = manager
            .apply_header(&header_for(&keypairs[2], 7, 4, 0), &validators)
            .unwrap();
        assert_eq!(update.new_finalized, Some(5));
        assert_eq!(manager.get_finalized_height(), 5);
    }

    #[test]
    fn test_revert_restores_prevoted_height() {
        let mut manager = FinalityManager::new(2);
        let keypairs: Vec<KeyPair> = (0..3).map(|_| KeyPair::generate()).collect();
        let validators = validator_set(&keypairs);

        manager
            .apply_header(&header_for(&keypairs[0], 1, 5, 0), &validators)
            .unwrap();
        let header = header_for(&keypairs[1], 2, 5, 0);
        let update = manager.apply_header(&header, &validators).unwrap();
        assert_eq!(update.new_prevoted, 5);

        let previous = update
            .previous_record
            .map(|bytes| ValidatorRecord::from_bytes(&bytes).unwrap());
        manager.revert_header(&header, previous, &validators);
        assert_eq!(manager.get_prevoted_height(), 0);
    }
}
