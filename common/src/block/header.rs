use std::fmt::{Display, Error as FmtError, Formatter};

use serde::{Deserialize, Serialize};

use crate::{
    crypto::{hash, CryptoError, Hash, Hashable, KeyPair, PublicKey, Signature, HASH_SIZE},
    serializer::{Reader, ReaderError, Serializer, Writer},
};

// Current header version
pub const BLOCK_VERSION: u32 = 2;

// Serialize a 32-byte reveal in a hexadecimal string
pub fn serialize_seed_reveal<S: serde::Serializer>(
    seed_reveal: &[u8; HASH_SIZE],
    s: S,
) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(seed_reveal))
}

// Deserialize the reveal from a hexadecimal string
pub fn deserialize_seed_reveal<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> Result<[u8; HASH_SIZE], D::Error> {
    let hex = String::deserialize(deserializer)?;
    let decoded = hex::decode(hex).map_err(serde::de::Error::custom)?;

    // Validate length before copy_from_slice, a malformed reveal must not crash the node
    if decoded.len() != HASH_SIZE {
        return Err(serde::de::Error::custom(format!(
            "Invalid seed reveal length: expected {} bytes, got {}",
            HASH_SIZE,
            decoded.len()
        )));
    }

    let mut seed_reveal = [0u8; HASH_SIZE];
    seed_reveal.copy_from_slice(&decoded);
    Ok(seed_reveal)
}

// BFT vote material and the hash onion reveal carried by every header.
//
// `max_height_previously_forged` is the generator's declaration of the
// highest block it ever forged before this one; `max_height_prevoted` is
// its implicit prevote. Both feed the finality manager.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BlockAsset {
    pub max_height_previously_forged: u64,
    pub max_height_prevoted: u64,
    #[serde(serialize_with = "serialize_seed_reveal")]
    #[serde(deserialize_with = "deserialize_seed_reveal")]
    pub seed_reveal: [u8; HASH_SIZE],
}

impl BlockAsset {
    pub fn new(
        max_height_previously_forged: u64,
        max_height_prevoted: u64,
        seed_reveal: [u8; HASH_SIZE],
    ) -> Self {
        Self {
            max_height_previously_forged,
            max_height_prevoted,
            seed_reveal,
        }
    }
}

impl Serializer for BlockAsset {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(self.max_height_previously_forged);
        writer.write_u64(self.max_height_prevoted);
        writer.write_bytes(&self.seed_reveal);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let max_height_previously_forged = reader.read_u64()?;
        let max_height_prevoted = reader.read_u64()?;
        let seed_reveal = reader.read_bytes(HASH_SIZE)?.try_into().unwrap();
        Ok(Self {
            max_height_previously_forged,
            max_height_prevoted,
            seed_reveal,
        })
    }

    fn size(&self) -> usize {
        8 + 8 + HASH_SIZE
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BlockHeader {
    pub version: u32,
    pub height: u64,
    // Seconds, slot-aligned. u32 on the wire as part of the consensus contract.
    pub timestamp: u32,
    // Zero hash for the genesis block
    pub previous_block_id: Hash,
    pub generator_public_key: PublicKey,
    // Merkle root over the payload transaction ids
    pub transaction_root: Hash,
    pub asset: BlockAsset,
    pub signature: Signature,
}

impl BlockHeader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        version: u32,
        height: u64,
        timestamp: u32,
        previous_block_id: Hash,
        generator_public_key: PublicKey,
        transaction_root: Hash,
        asset: BlockAsset,
    ) -> Self {
        Self {
            version,
            height,
            timestamp,
            previous_block_id,
            generator_public_key,
            transaction_root,
            asset,
            signature: Signature::zero(),
        }
    }

    pub fn get_height(&self) -> u64 {
        self.height
    }

    pub fn get_timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn get_previous_block_id(&self) -> &Hash {
        &self.previous_block_id
    }

    pub fn get_generator(&self) -> &PublicKey {
        &self.generator_public_key
    }

    // Everything but the signature, the message a generator signs
    pub fn unsigned_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(self.size());
        self.write_unsigned(&mut writer);
        writer.bytes()
    }

    fn write_unsigned(&self, writer: &mut Writer) {
        writer.write_u32(self.version);
        writer.write_u64(self.height);
        writer.write_u32(self.timestamp);
        writer.write_hash(&self.previous_block_id);
        self.generator_public_key.write(writer);
        writer.write_hash(&self.transaction_root);
        self.asset.write(writer);
    }

    pub fn sign(&mut self, keypair: &KeyPair) {
        self.signature = keypair.sign(&self.unsigned_bytes());
    }

    pub fn verify_signature(&self) -> Result<(), CryptoError> {
        self.generator_public_key
            .verify_signature(&self.unsigned_bytes(), &self.signature)
    }

    // The block id: hash of the full encoded header, signature included
    pub fn id(&self) -> Hash {
        hash(&self.to_bytes())
    }
}

impl Serializer for BlockHeader {
    fn write(&self, writer: &mut Writer) {
        self.write_unsigned(writer);
        self.signature.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let version = reader.read_u32()?;
        let height = reader.read_u64()?;
        let timestamp = reader.read_u32()?;
        let previous_block_id = reader.read_hash()?;
        let generator_public_key = PublicKey::read(reader)?;
        let transaction_root = reader.read_hash()?;
        let asset = BlockAsset::read(reader)?;
        let signature = Signature::read(reader)?;

        Ok(Self {
            version,
            height,
            timestamp,
            previous_block_id,
            generator_public_key,
            transaction_root,
            asset,
            signature,
        })
    }

    fn size(&self) -> usize {
        4 + 8
            + 4
            + self.previous_block_id.size()
            + self.generator_public_key.size()
            + self.transaction_root.size()
            + self.asset.size()
            + self.signature.size()
    }
}

impl Hashable for BlockHeader {}

impl Display for BlockHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(
            f,
            "BlockHeader[height: {}, timestamp: {}, previous: {}, generator: {}]",
            self.height, self.timestamp, self.previous_block_id, self.generator_public_key
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn dummy_header() -> BlockHeader {
        BlockHeader::new(
            BLOCK_VERSION,
            7,
            70,
            Hash::zero(),
            PublicKey::zero(),
            Hash::zero(),
            BlockAsset::new(3, 5, [9u8; HASH_SIZE]),
        )
    }

    #[test]
    fn test_header_roundtrip() {
        let header = dummy_header();
        let decoded = BlockHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(decoded.height, 7);
        assert_eq!(decoded.asset, header.asset);
        assert_eq!(decoded.id(), header.id());
    }

    #[test]
    fn test_signature_covers_asset() {
        let keypair = KeyPair::generate();
        let mut header = dummy_header();
        header.generator_public_key = keypair.get_public_key().clone();
        header.sign(&keypair);
        header.verify_signature().unwrap();

        // Tampering with the prevote must invalidate the signature
        header.asset.max_height_prevoted += 1;
        assert!(header.verify_signature().is_err());
    }

    #[test]
    fn test_id_changes_with_signature() {
        let keypair = KeyPair::generate();
        let mut header = dummy_header();
        let unsigned_id = header.id();
        header.generator_public_key = keypair.get_public_key().clone();
        header.sign(&keypair);
        assert_ne!(unsigned_id, header.id());
    }
}
