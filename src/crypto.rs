/*!
 * Client-side encryption of stage objects
 *
 * Every object gets its own random file key and IV. The payload is encrypted
 * with AES-CBC (PKCS#7 padding) under the file key, and the file key itself is
 * wrapped with the stage master key in AES-ECB. The wrapped key, the IV and a
 * material descriptor travel with the object as [`EncryptionMetadata`].
 */

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use aes::{Aes128, Aes192, Aes256};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use secrecy::ExposeSecret;
use std::fmt;
use thiserror::Error;

use crate::config::EncryptionConfig;
use crate::metadata::{EncryptionMetadata, MaterialDescriptor};

const BLOCK_SIZE: usize = 16;

/// Errors raised while encrypting or decrypting a payload
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("unsupported key size {0} bits")]
    UnsupportedKeySize(u32),

    #[error("key size mismatch: object uses {object} bits, client is configured for {configured}")]
    KeySizeMismatch { object: u32, configured: u32 },

    #[error("invalid {field} encoding: {source}")]
    Encoding {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },

    #[error("invalid {0} length")]
    InvalidLength(&'static str),

    #[error("decryption failed: bad padding (wrong master key or corrupted object)")]
    BadPadding,

    #[error("object is not encrypted")]
    MissingMetadata,
}

/// Master key and descriptor fields of one stage
#[derive(Clone)]
pub struct EncryptionMaterial {
    master_key: Vec<u8>,
    key_size: u32,
    query_id: Option<String>,
    smk_id: Option<u64>,
}

impl fmt::Debug for EncryptionMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionMaterial")
            .field("master_key", &"[REDACTED]")
            .field("key_size", &self.key_size)
            .field("query_id", &self.query_id)
            .field("smk_id", &self.smk_id)
            .finish()
    }
}

impl EncryptionMaterial {
    pub fn new(master_key: Vec<u8>, key_size: u32) -> Result<Self, CryptoError> {
        if !matches!(key_size, 128 | 192 | 256) {
            return Err(CryptoError::UnsupportedKeySize(key_size));
        }
        if master_key.len() * 8 != key_size as usize {
            return Err(CryptoError::InvalidLength("master key"));
        }
        Ok(Self {
            master_key,
            key_size,
            query_id: None,
            smk_id: None,
        })
    }

    pub fn from_config(config: &EncryptionConfig) -> Result<Self, CryptoError> {
        let master_key = BASE64
            .decode(config.master_key.expose_secret().trim())
            .map_err(|source| CryptoError::Encoding {
                field: "master key",
                source,
            })?;
        let mut material = Self::new(master_key, config.key_size)?;
        material.query_id = config.query_id.clone();
        material.smk_id = config.smk_id;
        Ok(material)
    }

    pub fn key_size(&self) -> u32 {
        self.key_size
    }

    fn descriptor(&self) -> MaterialDescriptor {
        MaterialDescriptor {
            query_id: self.query_id.clone(),
            smk_id: self.smk_id,
            key_size: self.key_size,
        }
    }
}

/// Encrypt a payload under a fresh file key
pub fn encrypt(
    material: &EncryptionMaterial,
    plaintext: &[u8],
) -> Result<(Vec<u8>, EncryptionMetadata), CryptoError> {
    let mut rng = rand::rng();
    let mut file_key = vec![0u8; material.key_size as usize / 8];
    rng.fill_bytes(&mut file_key);
    let mut iv = [0u8; BLOCK_SIZE];
    rng.fill_bytes(&mut iv);

    let ciphertext = cbc_encrypt(&file_key, &iv, plaintext)?;
    let wrapped = ecb_wrap(&material.master_key, &file_key)?;

    let metadata = EncryptionMetadata {
        key: BASE64.encode(wrapped),
        iv: BASE64.encode(iv),
        material: material.descriptor(),
    };
    Ok((ciphertext, metadata))
}

/// Decrypt a payload using the metadata stored with the object
pub fn decrypt(
    material: &EncryptionMaterial,
    metadata: &EncryptionMetadata,
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if metadata.key_size() != material.key_size {
        return Err(CryptoError::KeySizeMismatch {
            object: metadata.key_size(),
            configured: material.key_size,
        });
    }

    let wrapped = BASE64
        .decode(&metadata.key)
        .map_err(|source| CryptoError::Encoding {
            field: "file key",
            source,
        })?;
    let iv = BASE64
        .decode(&metadata.iv)
        .map_err(|source| CryptoError::Encoding { field: "IV", source })?;
    if iv.len() != BLOCK_SIZE {
        return Err(CryptoError::InvalidLength("IV"));
    }

    let file_key = ecb_unwrap(&material.master_key, &wrapped)?;
    if file_key.len() * 8 != material.key_size as usize {
        return Err(CryptoError::InvalidLength("file key"));
    }
    cbc_decrypt(&file_key, &iv, ciphertext)
}

fn cbc_encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let invalid = |_| CryptoError::InvalidLength("file key");
    let ciphertext = match key.len() {
        16 => cbc::Encryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(invalid)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        24 => cbc::Encryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(invalid)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        32 => cbc::Encryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(invalid)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        _ => return Err(CryptoError::InvalidLength("file key")),
    };
    Ok(ciphertext)
}

fn cbc_decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let invalid = |_| CryptoError::InvalidLength("file key");
    let plaintext = match key.len() {
        16 => cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(invalid)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        24 => cbc::Decryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(invalid)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        32 => cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(invalid)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        _ => return Err(CryptoError::InvalidLength("file key")),
    };
    plaintext.map_err(|_| CryptoError::BadPadding)
}

/// AES-ECB with PKCS#7 padding, applied to the file key
fn ecb_wrap(master_key: &[u8], file_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let padding = BLOCK_SIZE - (file_key.len() % BLOCK_SIZE);
    let mut data = file_key.to_vec();
    data.resize(data.len() + padding, padding as u8);

    let invalid = |_| CryptoError::InvalidLength("master key");
    match master_key.len() {
        16 => {
            let cipher = Aes128::new_from_slice(master_key).map_err(invalid)?;
            for chunk in data.chunks_mut(BLOCK_SIZE) {
                cipher.encrypt_block(aes::Block::from_mut_slice(chunk));
            }
        }
        24 => {
            let cipher = Aes192::new_from_slice(master_key).map_err(invalid)?;
            for chunk in data.chunks_mut(BLOCK_SIZE) {
                cipher.encrypt_block(aes::Block::from_mut_slice(chunk));
            }
        }
        32 => {
            let cipher = Aes256::new_from_slice(master_key).map_err(invalid)?;
            for chunk in data.chunks_mut(BLOCK_SIZE) {
                cipher.encrypt_block(aes::Block::from_mut_slice(chunk));
            }
        }
        _ => return Err(CryptoError::InvalidLength("master key")),
    }
    Ok(data)
}

fn ecb_unwrap(master_key: &[u8], wrapped: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if wrapped.is_empty() || wrapped.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidLength("wrapped file key"));
    }
    let mut data = wrapped.to_vec();

    let invalid = |_| CryptoError::InvalidLength("master key");
    match master_key.len() {
        16 => {
            let cipher = Aes128::new_from_slice(master_key).map_err(invalid)?;
            for chunk in data.chunks_mut(BLOCK_SIZE) {
                cipher.decrypt_block(aes::Block::from_mut_slice(chunk));
            }
        }
        24 => {
            let cipher = Aes192::new_from_slice(master_key).map_err(invalid)?;
            for chunk in data.chunks_mut(BLOCK_SIZE) {
                cipher.decrypt_block(aes::Block::from_mut_slice(chunk));
            }
        }
        32 => {
            let cipher = Aes256::new_from_slice(master_key).map_err(invalid)?;
            for chunk in data.chunks_mut(BLOCK_SIZE) {
                cipher.decrypt_block(aes::Block::from_mut_slice(chunk));
            }
        }
        _ => return Err(CryptoError::InvalidLength("master key")),
    }

    let padding = data[data.len() - 1] as usize;
    if padding == 0
        || padding > BLOCK_SIZE
        || !data[data.len() - padding..].iter().all(|&b| b as usize == padding)
    {
        return Err(CryptoError::BadPadding);
    }
    data.truncate(data.len() - padding);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn material(bits: u32) -> EncryptionMaterial {
        EncryptionMaterial::new(vec![0x5a; bits as usize / 8], bits).unwrap()
    }

    #[test]
    fn test_round_trip_all_key_sizes() {
        let plaintext = b"id,name\n1,alpha\n2,beta\n".repeat(100);
        for bits in [128, 192, 256] {
            let material = material(bits);
            let (ciphertext, meta) = encrypt(&material, &plaintext).unwrap();
            assert_ne!(ciphertext, plaintext);
            assert_eq!(ciphertext.len() % BLOCK_SIZE, 0);
            assert_eq!(meta.key_size(), bits);
            let decrypted = decrypt(&material, &meta, &ciphertext).unwrap();
            assert_eq!(decrypted, plaintext);
        }
    }

    #[test]
    fn test_empty_payload() {
        let material = material(128);
        let (ciphertext, meta) = encrypt(&material, b"").unwrap();
        // A full padding block
        assert_eq!(ciphertext.len(), BLOCK_SIZE);
        assert!(decrypt(&material, &meta, &ciphertext).unwrap().is_empty());
    }

    #[test]
    fn test_fresh_key_and_iv_per_object() {
        let material = material(256);
        let (c1, m1) = encrypt(&material, b"same bytes").unwrap();
        let (c2, m2) = encrypt(&material, b"same bytes").unwrap();
        assert_ne!(m1.key, m2.key);
        assert_ne!(m1.iv, m2.iv);
        assert_ne!(c1, c2);
    }

    #[test]
    fn test_wrapped_key_is_padded() {
        let material = material(128);
        let (_, meta) = encrypt(&material, b"x").unwrap();
        let wrapped = BASE64.decode(&meta.key).unwrap();
        assert_eq!(wrapped.len(), 32);
    }

    #[test]
    fn test_wrong_master_key_fails() {
        let (ciphertext, meta) = encrypt(&material(128), b"secret rows").unwrap();
        let other = EncryptionMaterial::new(vec![0x11; 16], 128).unwrap();
        assert!(decrypt(&other, &meta, &ciphertext).is_err());
    }

    #[test]
    fn test_key_size_mismatch() {
        let (ciphertext, meta) = encrypt(&material(128), b"rows").unwrap();
        let err = decrypt(&material(256), &meta, &ciphertext).unwrap_err();
        assert!(matches!(
            err,
            CryptoError::KeySizeMismatch {
                object: 128,
                configured: 256
            }
        ));
    }

    #[test]
    fn test_rejects_bad_key_sizes() {
        assert!(matches!(
            EncryptionMaterial::new(vec![0; 8], 64),
            Err(CryptoError::UnsupportedKeySize(64))
        ));
        assert!(EncryptionMaterial::new(vec![0; 16], 256).is_err());
    }

    #[test]
    fn test_material_from_config() {
        let mut config = EncryptionConfig::new(&[9u8; 24]);
        config.query_id = Some("q-1".to_string());
        config.smk_id = Some(7);
        let material = EncryptionMaterial::from_config(&config).unwrap();
        assert_eq!(material.key_size(), 192);

        let (_, meta) = encrypt(&material, b"abc").unwrap();
        assert_eq!(meta.material.query_id.as_deref(), Some("q-1"));
        assert_eq!(meta.material.smk_id, Some(7));
        assert!(!format!("{:?}", material).contains("9, 9"));
    }
}
