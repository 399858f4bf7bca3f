mod address;
mod hash;
mod keypair;

pub mod cipher;

pub use address::{Address, ADDRESS_SIZE};
pub use hash::{hash, Hash, Hashable, HASH_SIZE};
pub use keypair::{
    CryptoError, KeyPair, PublicKey, Signature, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE, SIGNATURE_SIZE,
};
