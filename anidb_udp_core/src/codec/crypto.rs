//! PKCS#5-padded ECB block cipher
//!
//! The protocol enciphers whole datagrams with AES-128 in ECB mode once
//! the ENCRYPT handshake has negotiated a key. The key is the MD5 digest
//! of the user's API key concatenated with the server-issued salt.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use md5::{Digest, Md5};

use crate::error::{ProtocolError, Result};

/// AES block size in bytes
pub(crate) const BLOCK_SIZE: usize = 16;

/// Derive the session cipher from the API key and the ENCRYPT salt.
pub(crate) fn derive_key(api_key: &str, salt: &str) -> Aes128 {
    let mut hasher = Md5::new();
    hasher.update(api_key.as_bytes());
    hasher.update(salt.as_bytes());
    let digest = hasher.finalize();
    Aes128::new(GenericArray::from_slice(&digest))
}

/// Encrypt a datagram in place.
///
/// The plaintext is PKCS#5-padded to a block boundary. At least one pad
/// byte is always appended; input already on a boundary gains a full
/// block of pad bytes.
pub(crate) fn encrypt(cipher: &Aes128, mut data: Vec<u8>) -> Vec<u8> {
    let gap = BLOCK_SIZE - (data.len() % BLOCK_SIZE);
    data.extend(std::iter::repeat(gap as u8).take(gap));
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    data
}

/// Decrypt a datagram and strip the PKCS#5 padding.
///
/// The ciphertext length must be a nonzero multiple of the block size,
/// and the pad byte must be in range; anything else is a framing error.
pub(crate) fn decrypt(cipher: &Aes128, data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
        return Err(ProtocolError::framing(format!(
            "ciphertext length {} is not a multiple of the block size",
            data.len()
        )));
    }
    let mut out = data.to_vec();
    for block in out.chunks_exact_mut(BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }
    let pad = usize::from(out[out.len() - 1]);
    if pad == 0 || pad > BLOCK_SIZE {
        return Err(ProtocolError::framing(format!("invalid pad byte {pad}")));
    }
    out.truncate(out.len() - pad);
    Ok(out)
}
