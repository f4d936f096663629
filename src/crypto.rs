//! Tuya encryption, hashing and digest helpers.
//! AES-128-ECB for the local protocol (v3.1, v3.3) and the OpenPulsar payloads,
//! MD5 for the v3.1 signature and the Pulsar password, SHA-256/HMAC for OpenAPI signing.

use crate::error::{Result, TuyaError};
use aes::Aes128;
use base64::{Engine as _, engine::general_purpose};
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit};
use ecb::{Decryptor, Encryptor};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha2::Sha256;

const BLOCK: usize = 16;

/// TuyaCipher provides AES-128-ECB encryption and decryption.
#[derive(Clone)]
pub struct TuyaCipher {
    /// 16-byte encryption key
    key: [u8; 16],
}

impl TuyaCipher {
    /// Create a new TuyaCipher with a 16-byte key.
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != BLOCK {
            return Err(TuyaError::EncryptionFailed);
        }
        let mut k = [0u8; 16];
        k.copy_from_slice(key);
        Ok(Self { key: k })
    }

    /// Encrypt data.
    /// * `use_base64`: If true, encode the result in Base64.
    /// * `padding`: If true, applies PKCS7 padding; otherwise the input must be block aligned.
    pub fn encrypt(&self, data: &[u8], use_base64: bool, padding: bool) -> Result<Vec<u8>> {
        let mut encryptor = Encryptor::<Aes128>::new(&self.key.into());

        let mut ciphertext = if padding {
            // Manual PKCS7 padding
            let padding_len = BLOCK - data.len() % BLOCK;
            let mut p = Vec::with_capacity(data.len() + padding_len);
            p.extend_from_slice(data);
            p.resize(data.len() + padding_len, padding_len as u8);
            p
        } else {
            if !data.len().is_multiple_of(BLOCK) {
                return Err(TuyaError::EncryptionFailed);
            }
            data.to_vec()
        };

        for chunk in ciphertext.chunks_mut(BLOCK) {
            let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
            encryptor.encrypt_block_mut(block);
        }

        if use_base64 {
            Ok(general_purpose::STANDARD.encode(&ciphertext).into_bytes())
        } else {
            Ok(ciphertext)
        }
    }

    /// Decrypt data and strip PKCS7 padding.
    /// * `use_base64`: If true, the input data is expected to be Base64 encoded.
    pub fn decrypt(&self, data: &[u8], use_base64: bool) -> Result<Vec<u8>> {
        let mut plaintext = if use_base64 {
            general_purpose::STANDARD
                .decode(data)
                .map_err(|_| TuyaError::DecryptionFailed)?
        } else {
            data.to_vec()
        };

        if plaintext.is_empty() || !plaintext.len().is_multiple_of(BLOCK) {
            return Err(TuyaError::DecryptionFailed);
        }

        let mut decryptor = Decryptor::<Aes128>::new(&self.key.into());
        for chunk in plaintext.chunks_mut(BLOCK) {
            let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
            decryptor.decrypt_block_mut(block);
        }

        // Manual PKCS7 unpadding
        let pad_len = plaintext[plaintext.len() - 1] as usize;
        if pad_len == 0 || pad_len > BLOCK || pad_len > plaintext.len() {
            return Err(TuyaError::DecryptionFailed);
        }
        if plaintext[plaintext.len() - pad_len..]
            .iter()
            .any(|&b| b as usize != pad_len)
        {
            return Err(TuyaError::DecryptionFailed);
        }
        plaintext.truncate(plaintext.len() - pad_len);
        Ok(plaintext)
    }
}

/// Lowercase hex MD5 digest.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Lowercase hex SHA-256 digest.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Uppercase hex HMAC-SHA256 of `msg` keyed with `key`.
pub fn hmac_sha256_upper_hex(key: &[u8], msg: &[u8]) -> Result<String> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .map_err(|e| TuyaError::Encoding(e.to_string()))?;
    mac.update(msg);
    Ok(hex::encode_upper(mac.finalize().into_bytes()))
}
