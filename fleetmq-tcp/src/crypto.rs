//! AES-256-CBC with PKCS#7 padding for secure endpoints.
//!
//! A [`CryptoContext`] holds one key/iv pair for the lifetime of a
//! connection and re-initializes the cipher from scratch on every
//! call rather than chaining state across messages — this mirrors
//! the peer side, which does the same, so the two stay in lockstep.
//! Neither side ever rotates the key mid-connection.

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;

use crate::{Error, Result};

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;

type Encryptor = cbc::Encryptor<Aes256>;
type Decryptor = cbc::Decryptor<Aes256>;

#[derive(Clone)]
pub struct CryptoContext {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl CryptoContext {
    pub fn new(key: [u8; KEY_LEN], iv: [u8; IV_LEN]) -> Self {
        Self { key, iv }
    }

    /// Generates a fresh random key/iv pair, one per server socket.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        rand::thread_rng().fill_bytes(&mut iv);
        Self { key, iv }
    }

    pub fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }

    pub fn from_slices(key: &[u8], iv: &[u8]) -> Result<Self> {
        if key.len() != KEY_LEN || iv.len() != IV_LEN {
            return Err(Error::BadKeyMaterial);
        }
        let mut key_arr = [0u8; KEY_LEN];
        let mut iv_arr = [0u8; IV_LEN];
        key_arr.copy_from_slice(key);
        iv_arr.copy_from_slice(iv);
        Ok(Self::new(key_arr, iv_arr))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let key = GenericArray::from_slice(&self.key);
        let iv = GenericArray::from_slice(&self.iv);
        Encryptor::new(key, iv).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let key = GenericArray::from_slice(&self.key);
        let iv = GenericArray::from_slice(&self.iv);
        Decryptor::new(key, iv)
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| Error::Decrypt)
    }
}
