use atoll_common::{
    block::Block,
    crypto::Hash,
    serializer::{Reader, ReaderError, Serializer, Writer},
    transaction::Transaction,
};

// Wire messages between nodes. Every payload is the codec-encoded
// message, ids are raw 32-byte hashes. Tags are part of the protocol.
const TAG_POST_BLOCK: u8 = 0;
const TAG_POST_TRANSACTION: u8 = 1;
const TAG_TRANSACTIONS_ANNOUNCEMENT: u8 = 2;
const TAG_BLOCKS_FROM_ID_REQUEST: u8 = 3;
const TAG_BLOCKS_FROM_ID_RESPONSE: u8 = 4;
const TAG_COMMON_BLOCK_REQUEST: u8 = 5;
const TAG_COMMON_BLOCK_RESPONSE: u8 = 6;
const TAG_TRANSACTIONS_REQUEST: u8 = 7;
const TAG_TRANSACTIONS_RESPONSE: u8 = 8;

// A block another peer claims to have, identified on our chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommonBlock {
    pub id: Hash,
    pub height: u64,
}

impl Serializer for CommonBlock {
    fn write(&self, writer: &mut Writer) {
        self.id.write(writer);
        writer.write_varuint(self.height);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let id = Hash::read(reader)?;
        let height = reader.read_varuint()?;
        Ok(Self { id, height })
    }
}

#[derive(Debug, Clone)]
pub enum Packet {
    PostBlock(Block),
    PostTransaction(Transaction),
    // Batched id announcement; receivers fetch unknown transactions
    TransactionsAnnouncement(Vec<Hash>),
    BlocksFromIdRequest {
        block_id: Hash,
    },
    BlocksFromIdResponse(Vec<Block>),
    // The requester's chain sampled as block ids, newest first
    CommonBlockRequest(Vec<Hash>),
    CommonBlockResponse(Option<CommonBlock>),
    TransactionsRequest(Vec<Hash>),
    TransactionsResponse(Vec<Transaction>),
}

impl Serializer for Packet {
    fn write(&self, writer: &mut Writer) {
        match self {
            Packet::PostBlock(block) => {
                writer.write_u8(TAG_POST_BLOCK);
                block.write(writer);
            }
            Packet::PostTransaction(tx) => {
                writer.write_u8(TAG_POST_TRANSACTION);
                tx.write(writer);
            }
            Packet::TransactionsAnnouncement(ids) => {
                writer.write_u8(TAG_TRANSACTIONS_ANNOUNCEMENT);
                ids.write(writer);
            }
            Packet::BlocksFromIdRequest { block_id } => {
                writer.write_u8(TAG_BLOCKS_FROM_ID_REQUEST);
                block_id.write(writer);
            }
            Packet::BlocksFromIdResponse(blocks) => {
                writer.write_u8(TAG_BLOCKS_FROM_ID_RESPONSE);
                blocks.write(writer);
            }
            Packet::CommonBlockRequest(ids) => {
                writer.write_u8(TAG_COMMON_BLOCK_REQUEST);
                ids.write(writer);
            }
            Packet::CommonBlockResponse(common) => {
                writer.write_u8(TAG_COMMON_BLOCK_RESPONSE);
                common.write(writer);
            }
            Packet::TransactionsRequest(ids) => {
                writer.write_u8(TAG_TRANSACTIONS_REQUEST);
                ids.write(writer);
            }
            Packet::TransactionsResponse(txs) => {
                writer.write_u8(TAG_TRANSACTIONS_RESPONSE);
                txs.write(writer);
            }
        }
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        match reader.read_u8()? {
            TAG_POST_BLOCK => Ok(Packet::PostBlock(Block::read(reader)?)),
            TAG_POST_TRANSACTION => Ok(Packet::PostTransaction(Transaction::read(reader)?)),
            TAG_TRANSACTIONS_ANNOUNCEMENT => {
                Ok(Packet::TransactionsAnnouncement(Vec::read(reader)?))
            }
            TAG_BLOCKS_FROM_ID_REQUEST => Ok(Packet::BlocksFromIdRequest {
                block_id: Hash::read(reader)?,
            }),
            TAG_BLOCKS_FROM_ID_RESPONSE => Ok(Packet::BlocksFromIdResponse(Vec::read(reader)?)),
            TAG_COMMON_BLOCK_REQUEST => Ok(Packet::CommonBlockRequest(Vec::read(reader)?)),
            TAG_COMMON_BLOCK_RESPONSE => Ok(Packet::CommonBlockResponse(Option::read(reader)?)),
            TAG_TRANSACTIONS_REQUEST => Ok(Packet::TransactionsRequest(Vec::read(reader)?)),
            TAG_TRANSACTIONS_RESPONSE => Ok(Packet::TransactionsResponse(Vec::read(reader)?)),
            _ => Err(ReaderError::InvalidValue),
        }
    }
}
