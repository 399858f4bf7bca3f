use std::fmt::{Display, Error as FmtError, Formatter};

use ed25519_dalek::{
    Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH,
    SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use serde::de::Error as SerdeError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::serializer::{Reader, ReaderError, Serializer, Writer};

use super::Address;

pub const PUBLIC_KEY_SIZE: usize = 32;
pub const SECRET_KEY_SIZE: usize = SECRET_KEY_LENGTH;
pub const SIGNATURE_SIZE: usize = SIGNATURE_LENGTH;

#[derive(Debug, Error, Clone)]
pub enum CryptoError {
    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Invalid secret key length: expected {SECRET_KEY_SIZE}, got {0}")]
    InvalidSecretKeyLength(usize),

    #[error("Signature verification failed")]
    VerificationFailed,

    #[error("Invalid hex string: {0}")]
    HexError(String),
}

// Ed25519 public key of a delegate or transaction sender
#[derive(Eq, PartialEq, PartialOrd, Ord, Clone, Debug, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    pub const fn new(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        PublicKey(bytes)
    }

    pub const fn zero() -> Self {
        PublicKey::new([0; PUBLIC_KEY_SIZE])
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; PUBLIC_KEY_SIZE] =
            slice.try_into().map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(PublicKey(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    // Derive the 20-byte account address of this key
    pub fn to_address(&self) -> Address {
        Address::from_public_key_bytes(&self.0)
    }

    pub fn verify_signature(&self, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        let key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)?;
        let signature = DalekSignature::from_bytes(&signature.0);
        key.verify(message, &signature)
            .map_err(|_| CryptoError::VerificationFailed)
    }
}

impl Serializer for PublicKey {
    fn write(&self, writer: &mut Writer) {
        writer.write_bytes(&self.0);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let bytes = reader.read_bytes(PUBLIC_KEY_SIZE)?;
        Ok(PublicKey(bytes.try_into().unwrap()))
    }

    fn size(&self) -> usize {
        PUBLIC_KEY_SIZE
    }
}

impl Display for PublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'a> Deserialize<'a> for PublicKey {
    fn deserialize<D: serde::Deserializer<'a>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        let bytes = hex::decode(hex).map_err(SerdeError::custom)?;
        PublicKey::from_slice(&bytes).map_err(SerdeError::custom)
    }
}

// Ed25519 signature over the canonical encoding of a header or transaction
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct Signature([u8; SIGNATURE_SIZE]);

impl Signature {
    pub const fn new(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Signature(bytes)
    }

    pub const fn zero() -> Self {
        Signature::new([0; SIGNATURE_SIZE])
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Serializer for Signature {
    fn write(&self, writer: &mut Writer) {
        writer.write_bytes(&self.0);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let bytes = reader.read_bytes(SIGNATURE_SIZE)?;
        Ok(Signature(bytes.try_into().unwrap()))
    }

    fn size(&self) -> usize {
        SIGNATURE_SIZE
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'a> Deserialize<'a> for Signature {
    fn deserialize<D: serde::Deserializer<'a>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        let bytes = hex::decode(hex).map_err(SerdeError::custom)?;
        let bytes: [u8; SIGNATURE_SIZE] = bytes
            .try_into()
            .map_err(|_| SerdeError::custom("Invalid signature length"))?;
        Ok(Signature(bytes))
    }
}

// Signing keypair held in RAM while a delegate has forging enabled.
// The secret half is zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyPair {
    secret: [u8; SECRET_KEY_SIZE],
    #[zeroize(skip)]
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(signing)
    }

    pub fn from_secret_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        let signing = SigningKey::from_bytes(&bytes);
        Self::from_signing_key(signing)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; SECRET_KEY_SIZE] = slice
            .try_into()
            .map_err(|_| CryptoError::InvalidSecretKeyLength(slice.len()))?;
        Ok(Self::from_secret_bytes(bytes))
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let public = PublicKey::new(signing.verifying_key().to_bytes());
        Self {
            secret: signing.to_bytes(),
            public,
        }
    }

    pub fn get_public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn get_address(&self) -> Address {
        self.public.to_address()
    }

    pub fn secret_bytes(&self) -> &[u8; SECRET_KEY_SIZE] {
        &self.secret
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        let signing = SigningKey::from_bytes(&self.secret);
        Signature(signing.sign(message).to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keypair = KeyPair::generate();
        let signature = keypair.sign(b"forge at slot 42");

        keypair
            .get_public_key()
            .verify_signature(b"forge at slot 42", &signature)
            .unwrap();

        assert!(keypair
            .get_public_key()
            .verify_signature(b"forge at slot 43", &signature)
            .is_err());
    }

    #[test]
    fn test_address_derivation_is_stable() {
        let keypair = KeyPair::from_secret_bytes([7u8; SECRET_KEY_SIZE]);
        assert_eq!(keypair.get_address(), keypair.get_public_key().to_address());
    }
}
