use std::{
    fmt::{Display, Error, Formatter},
    str::FromStr,
};

use serde::de::Error as SerdeError;
use serde::{Deserialize, Serialize};

use crate::serializer::{Reader, ReaderError, Serializer, Writer};

use super::hash;

pub const ADDRESS_SIZE: usize = 20;

// Account address: the first 20 bytes of blake3(public key).
// Shorter than the public key on purpose, it is the primary key of the
// account store and appears in every vote payload.
#[derive(Eq, PartialEq, PartialOrd, Ord, Clone, Copy, Debug, Hash)]
pub struct Address([u8; ADDRESS_SIZE]);

impl Address {
    pub const fn new(bytes: [u8; ADDRESS_SIZE]) -> Self {
        Address(bytes)
    }

    pub const fn zero() -> Self {
        Address::new([0; ADDRESS_SIZE])
    }

    pub fn from_public_key_bytes(public_key: &[u8]) -> Self {
        let digest = hash(public_key);
        let mut bytes = [0u8; ADDRESS_SIZE];
        bytes.copy_from_slice(&digest.as_bytes()[..ADDRESS_SIZE]);
        Address(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for Address {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| "Invalid hex string")?;
        let bytes: [u8; ADDRESS_SIZE] = bytes.try_into().map_err(|_| "Invalid address")?;
        Ok(Address::new(bytes))
    }
}

impl Serializer for Address {
    fn write(&self, writer: &mut Writer) {
        writer.write_address(self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_address()
    }

    fn size(&self) -> usize {
        ADDRESS_SIZE
    }
}

impl AsRef<[u8]> for Address {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'a> Deserialize<'a> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'a>,
    {
        let hex = String::deserialize(deserializer)?;
        hex.parse().map_err(SerdeError::custom)
    }
}
