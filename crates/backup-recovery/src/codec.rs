//! Payload serialization, compression and encryption
//!
//! A backup payload goes through three reversible stages:
//! - bundle serialization of all captured components (bincode)
//! - compression, identified by an algorithm tag (`zstd` or `none`)
//! - optional authenticated encryption (`aes-256-gcm`)
//!
//! Tags are stored in record metadata so payloads written under an older
//! configuration stay readable.

use crate::error::{BackupRecoveryError, BackupRecoveryResult};
use crate::provider::ComponentPayload;
use crate::types::{BackupId, BackupType};
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// zstd compression tag
pub const ZSTD: &str = "zstd";
/// Uncompressed payload tag
pub const COMPRESSION_NONE: &str = "none";
/// AES-256-GCM encryption tag
pub const AES_256_GCM: &str = "aes-256-gcm";

const BUNDLE_FORMAT_VERSION: u32 = 1;
const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

/// All component payloads of one backup, serialized as a single blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadBundle {
    /// Bundle layout version
    pub format_version: u32,
    /// Backup type the bundle was captured for
    pub backup_type: BackupType,
    /// Captured components in capture order
    pub components: Vec<ComponentPayload>,
}

impl PayloadBundle {
    /// Bundle at the current format version
    pub fn new(backup_type: BackupType, components: Vec<ComponentPayload>) -> Self {
        Self {
            format_version: BUNDLE_FORMAT_VERSION,
            backup_type,
            components,
        }
    }

    /// Serialize with bincode
    pub fn to_bytes(&self) -> BackupRecoveryResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize, rejecting unknown format versions
    pub fn from_bytes(bytes: &[u8]) -> BackupRecoveryResult<Self> {
        let bundle: Self = bincode::deserialize(bytes)?;
        if bundle.format_version != BUNDLE_FORMAT_VERSION {
            return Err(BackupRecoveryError::Codec {
                details: format!("unsupported bundle format {}", bundle.format_version),
            });
        }
        Ok(bundle)
    }

    /// Sum of declared component sizes
    pub fn declared_size(&self) -> u64 {
        self.components.iter().map(|c| c.size_bytes).sum()
    }

    /// Payload captured for `name`
    pub fn component(&self, name: &str) -> Option<&ComponentPayload> {
        self.components.iter().find(|c| c.component == name)
    }
}

/// Reversible compression transform
pub trait Compressor: Send + Sync {
    /// Algorithm name recorded in metadata
    fn algorithm(&self) -> &'static str;
    /// Compress `data`
    fn compress(&self, data: &[u8]) -> BackupRecoveryResult<Vec<u8>>;
    /// Reverse `compress`
    fn decompress(&self, data: &[u8]) -> BackupRecoveryResult<Vec<u8>>;
}

/// Authenticated encryption transform
pub trait Cipher: Send + Sync {
    /// Algorithm name recorded in metadata
    fn algorithm(&self) -> &'static str;
    /// Encrypt `plaintext`, binding `aad`
    fn encrypt(&self, aad: &[u8], plaintext: &[u8]) -> BackupRecoveryResult<Vec<u8>>;
    /// Decrypt and authenticate `ciphertext` against `aad`
    fn decrypt(&self, aad: &[u8], ciphertext: &[u8]) -> BackupRecoveryResult<Vec<u8>>;
}

/// Pass-through compressor
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompression;

impl Compressor for NoCompression {
    fn algorithm(&self) -> &'static str {
        COMPRESSION_NONE
    }

    fn compress(&self, data: &[u8]) -> BackupRecoveryResult<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> BackupRecoveryResult<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// zstd at a fixed level
#[derive(Debug, Clone, Copy)]
pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    /// Compressor at the given zstd level
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Default for ZstdCompressor {
    fn default() -> Self {
        Self::new(zstd::DEFAULT_COMPRESSION_LEVEL)
    }
}

impl Compressor for ZstdCompressor {
    fn algorithm(&self) -> &'static str {
        ZSTD
    }

    fn compress(&self, data: &[u8]) -> BackupRecoveryResult<Vec<u8>> {
        zstd::stream::encode_all(data, self.level).map_err(|e| BackupRecoveryError::Codec {
            details: format!("zstd compression failed: {e}"),
        })
    }

    fn decompress(&self, data: &[u8]) -> BackupRecoveryResult<Vec<u8>> {
        zstd::stream::decode_all(data).map_err(|e| BackupRecoveryError::Codec {
            details: format!("zstd decompression failed: {e}"),
        })
    }
}

/// 256-bit symmetric key
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    /// Key from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Random key from the thread RNG
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse a 64-character hex string
    pub fn from_hex(encoded: &str) -> BackupRecoveryResult<Self> {
        let decoded = hex::decode(encoded).map_err(|e| BackupRecoveryError::Configuration {
            message: format!("invalid encryption key: {e}"),
        })?;
        let bytes: [u8; KEY_SIZE] =
            decoded
                .try_into()
                .map_err(|_| BackupRecoveryError::Configuration {
                    message: format!("encryption key must be {KEY_SIZE} bytes"),
                })?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// AES-256-GCM with a random nonce prepended to each ciphertext
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    /// Cipher keyed with `key`
    pub fn new(key: &EncryptionKey) -> BackupRecoveryResult<Self> {
        let cipher =
            Aes256Gcm::new_from_slice(&key.0).map_err(|e| BackupRecoveryError::Configuration {
                message: format!("invalid AES-256-GCM key: {e}"),
            })?;
        Ok(Self { cipher })
    }
}

impl Cipher for AesGcmCipher {
    fn algorithm(&self) -> &'static str {
        AES_256_GCM
    }

    fn encrypt(&self, aad: &[u8], plaintext: &[u8]) -> BackupRecoveryResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| BackupRecoveryError::Codec {
                details: "encryption failed".to_string(),
            })?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, aad: &[u8], ciphertext: &[u8]) -> BackupRecoveryResult<Vec<u8>> {
        if ciphertext.len() < NONCE_SIZE {
            return Err(BackupRecoveryError::Codec {
                details: "ciphertext shorter than nonce".to_string(),
            });
        }
        let (nonce_bytes, body) = ciphertext.split_at(NONCE_SIZE);

        self.cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload { msg: body, aad },
            )
            .map_err(|_| BackupRecoveryError::Codec {
                details: "decryption failed: payload or key mismatch".to_string(),
            })
    }
}

/// Transform stack used for new backups, able to read older tags back
#[derive(Clone)]
pub struct PayloadCodec {
    compressor: Arc<dyn Compressor>,
    cipher: Option<Arc<dyn Cipher>>,
    encrypt_new: bool,
}

impl PayloadCodec {
    /// Codec from explicit transforms
    pub fn new(
        compressor: Arc<dyn Compressor>,
        cipher: Option<Arc<dyn Cipher>>,
        encrypt_new: bool,
    ) -> Self {
        let encrypt_new = encrypt_new && cipher.is_some();
        Self {
            compressor,
            cipher,
            encrypt_new,
        }
    }

    /// Build from the configured level and encryption flag. A random key is
    /// generated when encryption is enabled and no key is supplied.
    pub fn from_settings(
        compression_level: i32,
        encryption_enabled: bool,
        key: Option<EncryptionKey>,
    ) -> BackupRecoveryResult<Self> {
        let compressor: Arc<dyn Compressor> = if compression_level == 0 {
            Arc::new(NoCompression)
        } else {
            Arc::new(ZstdCompressor::new(compression_level))
        };

        let key = match key {
            Some(key) => Some(key),
            None if encryption_enabled => Some(EncryptionKey::generate()),
            None => None,
        };
        let cipher = match key {
            Some(key) => Some(Arc::new(AesGcmCipher::new(&key)?) as Arc<dyn Cipher>),
            None => None,
        };

        Ok(Self::new(compressor, cipher, encryption_enabled))
    }

    /// Algorithm name of the active compressor
    pub fn compression_algorithm(&self) -> &'static str {
        self.compressor.algorithm()
    }

    /// Algorithm applied to new payloads, `None` when they are stored in clear
    pub fn encryption_algorithm(&self) -> Option<&'static str> {
        if self.encrypt_new {
            self.cipher.as_ref().map(|c| c.algorithm())
        } else {
            None
        }
    }

    /// Whether payloads sealed with `algorithm` can be opened
    pub fn can_open(&self, algorithm: &str) -> bool {
        self.cipher
            .as_ref()
            .is_some_and(|cipher| cipher.algorithm() == algorithm)
    }

    /// Compress serialized bundle bytes
    pub fn compress(&self, data: &[u8]) -> BackupRecoveryResult<Vec<u8>> {
        self.compressor.compress(data)
    }

    /// Undo compression declared by `algorithm`
    pub fn decompress(&self, algorithm: &str, data: &[u8]) -> BackupRecoveryResult<Vec<u8>> {
        match algorithm {
            COMPRESSION_NONE => Ok(data.to_vec()),
            tag if tag == self.compressor.algorithm() => self.compressor.decompress(data),
            ZSTD => ZstdCompressor::default().decompress(data),
            other => Err(BackupRecoveryError::Codec {
                details: format!("unsupported compression algorithm: {other}"),
            }),
        }
    }

    /// Encrypt for storage when encryption is enabled; the backup id is bound
    /// as associated data
    pub fn seal(&self, backup_id: &BackupId, data: Vec<u8>) -> BackupRecoveryResult<Vec<u8>> {
        match (&self.cipher, self.encrypt_new) {
            (Some(cipher), true) => cipher.encrypt(backup_id.as_str().as_bytes(), &data),
            _ => Ok(data),
        }
    }

    /// Reverse [`seal`](Self::seal) for a payload stored under `algorithm`
    pub fn open(
        &self,
        backup_id: &BackupId,
        algorithm: Option<&str>,
        stored: &[u8],
    ) -> BackupRecoveryResult<Vec<u8>> {
        let Some(algorithm) = algorithm else {
            return Ok(stored.to_vec());
        };
        match &self.cipher {
            Some(cipher) if cipher.algorithm() == algorithm => {
                cipher.decrypt(backup_id.as_str().as_bytes(), stored)
            }
            _ => Err(BackupRecoveryError::Codec {
                details: format!("no key available for {algorithm}"),
            }),
        }
    }
}

impl std::fmt::Debug for PayloadCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCodec")
            .field("compression", &self.compression_algorithm())
            .field("encryption", &self.encryption_algorithm())
            .finish()
    }
}
