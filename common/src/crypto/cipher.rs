use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;

use super::hash;

const NONCE_SIZE: usize = 12;

#[derive(Debug, Error, Clone)]
pub enum CipherError {
    #[error("Ciphertext too short")]
    TooShort,

    #[error("Decryption failed, wrong password or corrupted data")]
    DecryptionFailed,

    #[error("Encryption failed")]
    EncryptionFailed,
}

// Password-based encryption for delegate secrets at rest
// (passphrases and hash onion seeds in the forging config).
//
// Layout: 12-byte random nonce followed by the ChaCha20-Poly1305
// ciphertext. The key is blake3(password), so the same password always
// opens the same blob but the nonce keeps ciphertexts distinct.
pub fn encrypt(password: &str, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
    let key = hash(password.as_bytes());
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CipherError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn decrypt(password: &str, data: &[u8]) -> Result<Vec<u8>, CipherError> {
    if data.len() < NONCE_SIZE {
        return Err(CipherError::TooShort);
    }

    let key = hash(password.as_bytes());
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);

    cipher
        .decrypt(nonce, &data[NONCE_SIZE..])
        .map_err(|_| CipherError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let encrypted = encrypt("hunter2", b"delegate passphrase").unwrap();
        let decrypted = decrypt("hunter2", &encrypted).unwrap();
        assert_eq!(decrypted, b"delegate passphrase");
    }

    #[test]
    fn test_wrong_password_fails() {
        let encrypted = encrypt("hunter2", b"delegate passphrase").unwrap();
        assert!(matches!(
            decrypt("hunter3", &encrypted),
            Err(CipherError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_truncated_input() {
        assert!(matches!(decrypt("x", &[0u8; 4]), Err(CipherError::TooShort)));
    }
}
