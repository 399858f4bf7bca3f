use std::{
    fmt::{Display, Error as FmtError, Formatter},
    ops::Deref,
    sync::Arc,
};

use crate::{
    crypto::{Hash, Hashable},
    immutable::Immutable,
    serializer::{Reader, ReaderError, Serializer, Writer},
    transaction::Transaction,
};

use super::{compute_transaction_root, BlockHeader};

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
pub struct Block {
    #[serde(flatten)]
    header: Immutable<BlockHeader>,
    transactions: Vec<Arc<Transaction>>,
}

impl Block {
    pub fn new(header: Immutable<BlockHeader>, transactions: Vec<Arc<Transaction>>) -> Self {
        Block {
            header,
            transactions,
        }
    }

    pub fn genesis(header: BlockHeader) -> Self {
        Block::new(Immutable::Owned(header), Vec::new())
    }

    pub fn to_header(self) -> Arc<BlockHeader> {
        self.header.into_arc()
    }

    pub fn get_header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn get_txs_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn get_transactions(&self) -> &Vec<Arc<Transaction>> {
        &self.transactions
    }

    pub fn split(self) -> (Immutable<BlockHeader>, Vec<Arc<Transaction>>) {
        (self.header, self.transactions)
    }

    // Total encoded size of the payload, checked against max_payload_length
    pub fn payload_size(&self) -> usize {
        self.transactions.iter().map(|tx| tx.size()).sum()
    }

    // Recompute the merkle root from the payload and compare against the header
    pub fn verify_transaction_root(&self) -> bool {
        let root = compute_transaction_root(self.transactions.iter().map(|tx| tx.id()));
        root == self.header.transaction_root
    }
}

impl Serializer for Block {
    fn write(&self, writer: &mut Writer) {
        self.header.write(writer);
        writer.write_varuint(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.write(writer);
        }
    }

    fn read(reader: &mut Reader) -> Result<Block, ReaderError> {
        let header = BlockHeader::read(reader)?;
        let count = reader.read_varuint()?;
        if count > reader.remaining() as u64 {
            return Err(ReaderError::InvalidSize);
        }

        let mut txs = Vec::with_capacity(count as usize);
        for _ in 0..count {
            txs.push(Arc::new(Transaction::read(reader)?));
        }

        Ok(Block::new(Immutable::Owned(header), txs))
    }

    fn size(&self) -> usize {
        let count = self.transactions.len() as u64;
        let mut writer = Writer::new();
        writer.write_varuint(count);

        self.header.size() + writer.total_write() + self.payload_size()
    }
}

impl Hashable for Block {
    fn hash(&self) -> Hash {
        self.header.hash()
    }
}

impl Deref for Block {
    type Target = BlockHeader;

    fn deref(&self) -> &Self::Target {
        self.get_header()
    }
}

impl Display for Block {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(
            f,
            "Block[height: {}, timestamp: {}, previous: {}, txs: {}]",
            self.height,
            self.timestamp,
            self.previous_block_id,
            self.transactions.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        block::{BlockAsset, BLOCK_VERSION},
        crypto::{Hash, PublicKey, HASH_SIZE},
    };

    #[test]
    fn test_empty_block_roundtrip() {
        let header = BlockHeader::new(
            BLOCK_VERSION,
            1,
            10,
            Hash::zero(),
            PublicKey::zero(),
            Hash::zero(),
            BlockAsset::new(0, 0, [0u8; HASH_SIZE]),
        );
        let block = Block::genesis(header);
        let decoded = Block::from_bytes(&block.to_bytes()).unwrap();
        assert_eq!(decoded.get_txs_count(), 0);
        assert_eq!(decoded.hash(), block.hash());
        assert!(decoded.verify_transaction_root());
    }
}
