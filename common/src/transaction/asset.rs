use serde::{Deserialize, Serialize};

use crate::{
    config::{
        DPOS_ASSET_REGISTER_DELEGATE, DPOS_ASSET_VOTE_DELEGATE, DPOS_MODULE_ID,
        TOKEN_ASSET_TRANSFER, TOKEN_MODULE_ID,
    },
    crypto::Address,
    serializer::{Reader, ReaderError, Serializer, Writer},
};

// A single vote delta: positive locks tokens behind a delegate,
// negative unlocks previously voted tokens.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Vote {
    pub delegate: Address,
    pub amount: i64,
}

impl Serializer for Vote {
    fn write(&self, writer: &mut Writer) {
        self.delegate.write(writer);
        writer.write_u64(self.amount as u64);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let delegate = Address::read(reader)?;
        let amount = reader.read_u64()? as i64;
        Ok(Self { delegate, amount })
    }

    fn size(&self) -> usize {
        self.delegate.size() + 8
    }
}

// Closed sum of every asset the chain understands, tagged on the wire by
// `(module_id, asset_id)`. The module set is fixed at boot; adding a
// variant here is a consensus change.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "snake_case")]
pub enum TransactionAsset {
    Transfer {
        recipient: Address,
        amount: u64,
        data: Vec<u8>,
    },
    RegisterDelegate {
        username: String,
    },
    VoteDelegate {
        votes: Vec<Vote>,
    },
}

impl TransactionAsset {
    pub fn module_id(&self) -> u32 {
        match self {
            TransactionAsset::Transfer { .. } => TOKEN_MODULE_ID,
            TransactionAsset::RegisterDelegate { .. } | TransactionAsset::VoteDelegate { .. } => {
                DPOS_MODULE_ID
            }
        }
    }

    pub fn asset_id(&self) -> u32 {
        match self {
            TransactionAsset::Transfer { .. } => TOKEN_ASSET_TRANSFER,
            TransactionAsset::RegisterDelegate { .. } => DPOS_ASSET_REGISTER_DELEGATE,
            TransactionAsset::VoteDelegate { .. } => DPOS_ASSET_VOTE_DELEGATE,
        }
    }

    pub fn write_payload(&self, writer: &mut Writer) {
        match self {
            TransactionAsset::Transfer {
                recipient,
                amount,
                data,
            } => {
                recipient.write(writer);
                writer.write_varuint(*amount);
                writer.write_var_bytes(data);
            }
            TransactionAsset::RegisterDelegate { username } => {
                writer.write_string(username);
            }
            TransactionAsset::VoteDelegate { votes } => {
                votes.write(writer);
            }
        }
    }

    // Dispatch on the ids read ahead of the payload
    pub fn read_payload(
        module_id: u32,
        asset_id: u32,
        reader: &mut Reader,
    ) -> Result<Self, ReaderError> {
        match (module_id, asset_id) {
            (TOKEN_MODULE_ID, TOKEN_ASSET_TRANSFER) => {
                let recipient = Address::read(reader)?;
                let amount = reader.read_varuint()?;
                let data = reader.read_var_bytes()?;
                Ok(TransactionAsset::Transfer {
                    recipient,
                    amount,
                    data,
                })
            }
            (DPOS_MODULE_ID, DPOS_ASSET_REGISTER_DELEGATE) => {
                let username = reader.read_string()?;
                Ok(TransactionAsset::RegisterDelegate { username })
            }
            (DPOS_MODULE_ID, DPOS_ASSET_VOTE_DELEGATE) => {
                let votes = Vec::read(reader)?;
                Ok(TransactionAsset::VoteDelegate { votes })
            }
            _ => Err(ReaderError::InvalidValue),
        }
    }
}
