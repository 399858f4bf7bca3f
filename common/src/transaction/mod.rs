mod asset;

pub use asset::{TransactionAsset, Vote};

use std::fmt::{Display, Error as FmtError, Formatter};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    config::{
        GenesisConfig, MAX_TRANSFER_DATA_SIZE, MAX_USERNAME_LENGTH, MAX_VOTES_PER_TRANSACTION,
        VOTE_AMOUNT_STEP,
    },
    crypto::{CryptoError, Hash, Hashable, KeyPair, PublicKey, Signature},
    serializer::{Reader, ReaderError, Serializer, Writer},
};

#[derive(Debug, Error, Clone)]
pub enum TransactionError {
    #[error("Transaction carries no signature")]
    MissingSignature,

    #[error("Invalid signature: {0}")]
    InvalidSignature(#[from] CryptoError),

    #[error("Transfer amount must be positive")]
    ZeroAmount,

    #[error("Transfer data exceeds {MAX_TRANSFER_DATA_SIZE} bytes")]
    DataTooLarge,

    #[error("Invalid delegate username")]
    InvalidUsername,

    #[error("Invalid vote set")]
    InvalidVotes,

    #[error("Fee {fee} below minimum {min_fee}")]
    FeeTooLow { fee: u64, min_fee: u64 },
}

// Transaction to be sent over the network
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Transaction {
    // Source of the transaction
    sender_public_key: PublicKey,
    /// nonce must be equal to the one on chain account
    /// used to prevent replay attacks and have ordered transactions
    nonce: u64,
    /// Fees in base units, paid to the forger
    fee: u64,
    /// Module payload of the transaction
    asset: TransactionAsset,
    /// Signatures of the sender key
    signatures: Vec<Signature>,
}

impl Transaction {
    pub fn new(
        sender_public_key: PublicKey,
        nonce: u64,
        fee: u64,
        asset: TransactionAsset,
        signatures: Vec<Signature>,
    ) -> Self {
        Self {
            sender_public_key,
            nonce,
            fee,
            asset,
            signatures,
        }
    }

    // Build and sign in one step
    pub fn create(keypair: &KeyPair, nonce: u64, fee: u64, asset: TransactionAsset) -> Self {
        let mut tx = Self::new(
            keypair.get_public_key().clone(),
            nonce,
            fee,
            asset,
            Vec::new(),
        );
        let signature = keypair.sign(&tx.unsigned_bytes());
        tx.signatures.push(signature);
        tx
    }

    pub fn get_module_id(&self) -> u32 {
        self.asset.module_id()
    }

    pub fn get_asset_id(&self) -> u32 {
        self.asset.asset_id()
    }

    pub fn get_nonce(&self) -> u64 {
        self.nonce
    }

    pub fn get_fee(&self) -> u64 {
        self.fee
    }

    pub fn get_sender(&self) -> &PublicKey {
        &self.sender_public_key
    }

    pub fn get_asset(&self) -> &TransactionAsset {
        &self.asset
    }

    pub fn get_signatures(&self) -> &Vec<Signature> {
        &self.signatures
    }

    // Deterministic id over the signed encoding
    pub fn id(&self) -> Hash {
        self.hash()
    }

    // Everything but the signatures, the message the sender signs
    pub fn unsigned_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        self.write_unsigned(&mut writer);
        writer.bytes()
    }

    fn write_unsigned(&self, writer: &mut Writer) {
        writer.write_varuint(self.asset.module_id() as u64);
        writer.write_varuint(self.asset.asset_id() as u64);
        writer.write_varuint(self.nonce);
        writer.write_varuint(self.fee);
        self.sender_public_key.write(writer);
        self.asset.write_payload(writer);
    }

    pub fn fee_per_byte(&self) -> u64 {
        let size = self.size() as u64;
        if size == 0 {
            return 0;
        }
        self.fee / size
    }

    // minFee = minFeePerByte * size + baseFee(moduleID, assetID)
    pub fn min_fee(&self, config: &GenesisConfig) -> u64 {
        let size = self.size() as u64;
        config
            .min_fee_per_byte
            .saturating_mul(size)
            .saturating_add(config.base_fee(self.get_module_id(), self.get_asset_id()))
    }

    // Static validation: shape of the payload and signature under the
    // sender key. No chain state involved.
    pub fn validate(&self) -> Result<(), TransactionError> {
        match &self.asset {
            TransactionAsset::Transfer { amount, data, .. } => {
                if *amount == 0 {
                    return Err(TransactionError::ZeroAmount);
                }
                if data.len() > MAX_TRANSFER_DATA_SIZE {
                    return Err(TransactionError::DataTooLarge);
                }
            }
            TransactionAsset::RegisterDelegate { username } => {
                if username.is_empty()
                    || username.len() > MAX_USERNAME_LENGTH
                    || !username
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "!@$&_.".contains(c))
                {
                    return Err(TransactionError::InvalidUsername);
                }
            }
            TransactionAsset::VoteDelegate { votes } => {
                if votes.is_empty() || votes.len() > MAX_VOTES_PER_TRANSACTION {
                    return Err(TransactionError::InvalidVotes);
                }
                for vote in votes {
                    if vote.amount == 0
                        || vote.amount.unsigned_abs() % VOTE_AMOUNT_STEP != 0
                    {
                        return Err(TransactionError::InvalidVotes);
                    }
                }
            }
        }

        self.verify_signatures()
    }

    pub fn verify_signatures(&self) -> Result<(), TransactionError> {
        if self.signatures.is_empty() {
            return Err(TransactionError::MissingSignature);
        }

        let message = self.unsigned_bytes();
        for signature in &self.signatures {
            self.sender_public_key.verify_signature(&message, signature)?;
        }

        Ok(())
    }
}

impl Serializer for Transaction {
    fn write(&self, writer: &mut Writer) {
        self.write_unsigned(writer);
        self.signatures.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let module_id = reader.read_varuint()?;
        let asset_id = reader.read_varuint()?;
        if module_id > u32::MAX as u64 || asset_id > u32::MAX as u64 {
            return Err(ReaderError::InvalidValue);
        }

        let nonce = reader.read_varuint()?;
        let fee = reader.read_varuint()?;
        let sender_public_key = PublicKey::read(reader)?;
        let asset = TransactionAsset::read_payload(module_id as u32, asset_id as u32, reader)?;
        let signatures = Vec::read(reader)?;

        Ok(Self {
            sender_public_key,
            nonce,
            fee,
            asset,
            signatures,
        })
    }
}

impl Hashable for Transaction {}

impl Display for Transaction {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(
            f,
            "Transaction[module: {}, asset: {}, nonce: {}, fee: {}, sender: {}]",
            self.get_module_id(),
            self.get_asset_id(),
            self.nonce,
            self.fee,
            self.sender_public_key
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Address;

    fn transfer(keypair: &KeyPair, nonce: u64, fee: u64) -> Transaction {
        Transaction::create(
            keypair,
            nonce,
            fee,
            TransactionAsset::Transfer {
                recipient: Address::new([2u8; 20]),
                amount: 1_000,
                data: Vec::new(),
            },
        )
    }

    #[test]
    fn test_roundtrip_preserves_id() {
        let keypair = KeyPair::generate();
        let tx = transfer(&keypair, 3, 50_000);
        let decoded = Transaction::from_bytes(&tx.to_bytes()).unwrap();
        assert_eq!(decoded.id(), tx.id());
        assert_eq!(decoded.get_nonce(), 3);
        decoded.validate().unwrap();
    }

    #[test]
    fn test_tampered_fee_breaks_signature() {
        let keypair = KeyPair::generate();
        let tx = transfer(&keypair, 0, 50_000);
        let mut tampered = Transaction::new(
            tx.get_sender().clone(),
            tx.get_nonce(),
            tx.get_fee() + 1,
            tx.get_asset().clone(),
            tx.get_signatures().clone(),
        );
        assert!(tampered.validate().is_err());
        // restore the fee and the signature verifies again
        tampered.fee = tx.get_fee();
        tampered.validate().unwrap();
    }

    #[test]
    fn test_vote_amount_granularity() {
        let keypair = KeyPair::generate();
        let tx = Transaction::create(
            &keypair,
            0,
            50_000,
            TransactionAsset::VoteDelegate {
                votes: vec![Vote {
                    delegate: Address::new([3u8; 20]),
                    amount: 15,
                }],
            },
        );
        assert!(matches!(
            tx.validate(),
            Err(TransactionError::InvalidVotes)
        ));
    }

    #[test]
    fn test_unsigned_tx_rejected() {
        let keypair = KeyPair::generate();
        let tx = Transaction::new(
            keypair.get_public_key().clone(),
            0,
            10,
            TransactionAsset::Transfer {
                recipient: Address::new([2u8; 20]),
                amount: 5,
                data: Vec::new(),
            },
            Vec::new(),
        );
        assert!(matches!(
            tx.validate(),
            Err(TransactionError::MissingSignature)
        ));
    }
}
