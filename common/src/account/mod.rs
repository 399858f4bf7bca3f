use serde::{Deserialize, Serialize};

use crate::{
    crypto::Address,
    serializer::{Reader, ReaderError, Serializer, Writer},
};

// Registered delegate metadata attached to an account
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Delegate {
    pub username: String,
    // Sum of all locked vote amounts pointing at this delegate
    pub total_votes_received: u64,
}

impl Serializer for Delegate {
    fn write(&self, writer: &mut Writer) {
        writer.write_string(&self.username);
        writer.write_varuint(self.total_votes_received);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let username = reader.read_string()?;
        let total_votes_received = reader.read_varuint()?;
        Ok(Self {
            username,
            total_votes_received,
        })
    }
}

// A vote this account has cast, tokens stay locked while the vote stands
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SentVote {
    pub delegate: Address,
    pub amount: u64,
}

impl Serializer for SentVote {
    fn write(&self, writer: &mut Writer) {
        self.delegate.write(writer);
        writer.write_varuint(self.amount);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let delegate = Address::read(reader)?;
        let amount = reader.read_varuint()?;
        Ok(Self { delegate, amount })
    }
}

// Materialized account state: the deterministic fold of every applied
// payload over genesis. Balance excludes tokens locked behind votes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub address: Address,
    pub balance: u64,
    pub nonce: u64,
    pub delegate: Option<Delegate>,
    pub votes: Vec<SentVote>,
}

impl Account {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            balance: 0,
            nonce: 0,
            delegate: None,
            votes: Vec::new(),
        }
    }

    pub fn with_balance(address: Address, balance: u64) -> Self {
        let mut account = Self::new(address);
        account.balance = balance;
        account
    }

    pub fn is_delegate(&self) -> bool {
        self.delegate.is_some()
    }

    // Amount locked behind outgoing votes
    pub fn locked_amount(&self) -> u64 {
        self.votes.iter().map(|v| v.amount).sum()
    }
}

impl Serializer for Account {
    fn write(&self, writer: &mut Writer) {
        self.address.write(writer);
        writer.write_varuint(self.balance);
        writer.write_varuint(self.nonce);
        self.delegate.write(writer);
        self.votes.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let address = Address::read(reader)?;
        let balance = reader.read_varuint()?;
        let nonce = reader.read_varuint()?;
        let delegate = Option::read(reader)?;
        let votes = Vec::read(reader)?;

        Ok(Self {
            address,
            balance,
            nonce,
            delegate,
            votes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_roundtrip() {
        let mut account = Account::with_balance(Address::new([1u8; 20]), 42);
        account.nonce = 9;
        account.delegate = Some(Delegate {
            username: "genesis_1".into(),
            total_votes_received: 1_000,
        });
        account.votes.push(SentVote {
            delegate: Address::new([2u8; 20]),
            amount: 500,
        });

        let decoded = Account::from_bytes(&account.to_bytes()).unwrap();
        assert_eq!(decoded, account);
        assert_eq!(decoded.locked_amount(), 500);
    }
}
