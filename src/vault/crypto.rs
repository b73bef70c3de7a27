use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

/// AES-GCM standard nonce size in bytes.
pub const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("master key must be 64 hex chars (32 bytes), got {0} chars")]
    KeyLength(usize),

    #[error("master key is not valid hex: {0}")]
    KeyEncoding(#[from] hex::FromHexError),

    #[error("token encryption failed")]
    Encryption,

    #[error("token decryption failed: {0}")]
    Decryption(&'static str),
}

/// Ciphertext of a plaintext token plus the nonce it was sealed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedToken {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
}

/// One-way digest used as the lookup key for a token.
///
/// SHA-256, lowercase hex. Never used for display.
pub fn hash_token(plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    hex::encode(hasher.finalize())
}

/// Reversible AES-256-GCM encryption of plaintext tokens.
///
/// The key is loaded once from process configuration and wiped on drop.
pub struct TokenCrypto {
    key: Zeroizing<[u8; 32]>,
}

impl TokenCrypto {
    pub fn new(master_key_hex: &str) -> Result<Self, CryptoError> {
        let key = parse_master_key(master_key_hex)?;
        Ok(Self { key })
    }

    /// Seals `plaintext` under a fresh random nonce. Two calls with the same
    /// input never produce the same pair.
    pub fn encrypt(&self, plaintext: &str) -> Result<SealedToken, CryptoError> {
        let cipher = self.cipher()?;
        let nonce_bytes = generate_nonce();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| CryptoError::Encryption)?;

        Ok(SealedToken {
            ciphertext,
            nonce: nonce_bytes.to_vec(),
        })
    }

    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8]) -> Result<String, CryptoError> {
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::Decryption("nonce has the wrong length"));
        }
        let cipher = self.cipher()?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| CryptoError::Decryption("authentication tag mismatch"))?,
        );

        std::str::from_utf8(&plaintext)
            .map(str::to_owned)
            .map_err(|_| CryptoError::Decryption("plaintext is not valid UTF-8"))
    }

    fn cipher(&self) -> Result<Aes256Gcm, CryptoError> {
        Aes256Gcm::new_from_slice(&self.key[..]).map_err(|_| CryptoError::KeyLength(self.key.len() * 2))
    }
}

/// Random key in the hex form `TokenCrypto::new` accepts. Only for
/// throwaway setups: ciphertexts sealed with it die with the process.
pub fn generate_master_key() -> String {
    let mut key = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(&mut key[..]);
    hex::encode(&key[..])
}

fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn parse_master_key(hex: &str) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    if hex.len() != 64 {
        return Err(CryptoError::KeyLength(hex.len()));
    }
    let bytes = Zeroizing::new(hex::decode(hex)?);
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&bytes);
    Ok(key)
}
