//! Sector decryption using AES-128-CBC

use aes::Aes128;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cbc::{Decryptor, Encryptor};

type Aes128CbcDec = Decryptor<Aes128>;
type Aes128CbcEnc = Encryptor<Aes128>;

/// Block size for AES-128
const BLOCK_SIZE: usize = 16;

/// A 16-byte AES disc key
pub type DiscKey = [u8; 16];

/// Decrypt a buffer in place using AES-128-CBC.
///
/// The IV is supplied per call; decryption chains across blocks within the
/// buffer and carries no state between calls, so the same (key, ciphertext,
/// iv) always yields the same plaintext. The trailing partial block, if any,
/// is left untouched.
pub fn decrypt_buffer(data: &mut [u8], key: &DiscKey, iv: &[u8; 16]) {
    let mut decryptor = Aes128CbcDec::new(key.into(), iv.into());

    let block_count = data.len() / BLOCK_SIZE;
    for i in 0..block_count {
        let start = i * BLOCK_SIZE;
        let block = &mut data[start..start + BLOCK_SIZE];
        decryptor.decrypt_block_mut(block.into());
    }
}

/// Encrypt a buffer in place using AES-128-CBC.
///
/// Needed by the IRD disc-key derivation, which runs the stored key material
/// through the forward cipher.
pub fn encrypt_buffer(data: &mut [u8], key: &DiscKey, iv: &[u8; 16]) {
    let mut encryptor = Aes128CbcEnc::new(key.into(), iv.into());

    let block_count = data.len() / BLOCK_SIZE;
    for i in 0..block_count {
        let start = i * BLOCK_SIZE;
        let block = &mut data[start..start + BLOCK_SIZE];
        encryptor.encrypt_block_mut(block.into());
    }
}
