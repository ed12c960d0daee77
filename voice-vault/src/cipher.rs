//! AES-CFB8 file encryption
//!
//! Artifact layout is `IV (16 bytes) || ciphertext`, optionally followed by a
//! 32-byte HMAC-SHA256 tag over `IV || ciphertext` when authentication is on.

use crate::atomic::write_atomic;
use crate::kdf::KeyLength;
use aes::{Aes128, Aes256};
use cfb8::cipher::{AsyncStreamCipher, KeyIvInit};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// AES block size; also the IV length
pub const IV_SIZE: usize = 16;

/// HMAC-SHA256 tag length
pub const TAG_SIZE: usize = 32;

const MAC_KEY_INFO: &[u8] = b"voice-vault/artifact-mac/v1";

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("Invalid key length: expected {expected} bytes, got {actual}")]
    KeyLength { expected: usize, actual: usize },

    #[error("Artifact too short: {len} bytes (minimum {min})")]
    ArtifactTooShort { len: usize, min: usize },

    #[error("Artifact failed integrity check (tampered or wrong key)")]
    Integrity,

    #[error("Unsupported cipher: {0}")]
    UnsupportedCipher(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Supported ciphers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CipherKind {
    Aes128Cfb8,
    Aes256Cfb8,
}

impl CipherKind {
    pub fn key_len(&self) -> usize {
        self.key_length().bytes()
    }

    /// Key length the KDF must produce for this cipher
    pub fn key_length(&self) -> KeyLength {
        match self {
            CipherKind::Aes128Cfb8 => KeyLength::Bits128,
            CipherKind::Aes256Cfb8 => KeyLength::Bits256,
        }
    }
}

impl FromStr for CipherKind {
    type Err = CipherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aes128" | "aes-128" | "aes128_cfb8" => Ok(CipherKind::Aes128Cfb8),
            "aes256" | "aes-256" | "aes256_cfb8" => Ok(CipherKind::Aes256Cfb8),
            other => Err(CipherError::UnsupportedCipher(other.to_string())),
        }
    }
}

/// Cipher configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CipherConfig {
    pub kind: CipherKind,

    /// Append and verify an HMAC-SHA256 tag
    pub authenticate: bool,
}

impl Default for CipherConfig {
    fn default() -> Self {
        Self {
            kind: CipherKind::Aes128Cfb8,
            authenticate: false,
        }
    }
}

/// IV plus ciphertext (plus optional tag)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedArtifact {
    iv: [u8; IV_SIZE],
    ciphertext: Vec<u8>,
    tag: Option<[u8; TAG_SIZE]>,
}

impl EncryptedArtifact {
    pub fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn tag(&self) -> Option<&[u8; TAG_SIZE]> {
        self.tag.as_ref()
    }

    /// Serialized length in bytes
    pub fn len(&self) -> usize {
        IV_SIZE + self.ciphertext.len() + self.tag.map_or(0, |_| TAG_SIZE)
    }

    pub fn is_empty(&self) -> bool {
        self.ciphertext.is_empty()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.len());
        bytes.extend_from_slice(&self.iv);
        bytes.extend_from_slice(&self.ciphertext);
        if let Some(tag) = &self.tag {
            bytes.extend_from_slice(tag);
        }
        bytes
    }
}

/// Encrypts and decrypts byte payloads and files
#[derive(Debug, Clone)]
pub struct CipherEngine {
    config: CipherConfig,
}

impl CipherEngine {
    pub fn new(config: CipherConfig) -> Self {
        Self { config }
    }

    /// Encrypt under a fresh random IV
    pub fn encrypt(&self, plaintext: &[u8], key: &[u8]) -> Result<EncryptedArtifact, CipherError> {
        let mut iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut iv);
        self.encrypt_with_iv(plaintext, key, iv)
    }

    fn encrypt_with_iv(
        &self,
        plaintext: &[u8],
        key: &[u8],
        iv: [u8; IV_SIZE],
    ) -> Result<EncryptedArtifact, CipherError> {
        self.check_key(key)?;

        let mut ciphertext = plaintext.to_vec();
        self.apply(key, &iv, &mut ciphertext, Direction::Encrypt)?;

        let tag = if self.config.authenticate {
            Some(self.tag(key, &iv, &ciphertext)?)
        } else {
            None
        };

        debug!(
            "Encrypted {} bytes with {:?} (authenticated: {})",
            plaintext.len(),
            self.config.kind,
            tag.is_some()
        );

        Ok(EncryptedArtifact {
            iv,
            ciphertext,
            tag,
        })
    }

    /// Decrypt an artifact; verifies the tag first when authentication is on
    pub fn decrypt(&self, artifact: &EncryptedArtifact, key: &[u8]) -> Result<Vec<u8>, CipherError> {
        self.check_key(key)?;

        if self.config.authenticate {
            let tag = artifact.tag.ok_or(CipherError::Integrity)?;
            let mut mac = self.mac(key)?;
            mac.update(&artifact.iv);
            mac.update(&artifact.ciphertext);
            mac.verify_slice(&tag).map_err(|_| CipherError::Integrity)?;
        }

        let mut plaintext = artifact.ciphertext.clone();
        self.apply(key, &artifact.iv, &mut plaintext, Direction::Decrypt)?;

        debug!("Decrypted {} bytes", plaintext.len());
        Ok(plaintext)
    }

    /// Split serialized artifact bytes according to this engine's layout
    pub fn parse_artifact(&self, bytes: &[u8]) -> Result<EncryptedArtifact, CipherError> {
        let min = IV_SIZE + if self.config.authenticate { TAG_SIZE } else { 0 };
        if bytes.len() < min {
            return Err(CipherError::ArtifactTooShort {
                len: bytes.len(),
                min,
            });
        }

        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&bytes[..IV_SIZE]);

        let (ciphertext, tag) = if self.config.authenticate {
            let split = bytes.len() - TAG_SIZE;
            let mut tag = [0u8; TAG_SIZE];
            tag.copy_from_slice(&bytes[split..]);
            (bytes[IV_SIZE..split].to_vec(), Some(tag))
        } else {
            (bytes[IV_SIZE..].to_vec(), None)
        };

        Ok(EncryptedArtifact {
            iv,
            ciphertext,
            tag,
        })
    }

    /// Encrypt `input` into `output` atomically; returns the artifact size
    pub fn encrypt_file(
        &self,
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
        key: &[u8],
    ) -> Result<usize, CipherError> {
        let input = input.as_ref();
        let output = output.as_ref();

        let plaintext = Zeroizing::new(fs::read(input)?);
        let artifact = self.encrypt(&plaintext, key)?;
        write_atomic(output, &artifact.to_bytes())?;

        info!(
            "Encrypted {} -> {} ({} bytes)",
            input.display(),
            output.display(),
            artifact.len()
        );

        Ok(artifact.len())
    }

    /// Decrypt `artifact_path` into `output` atomically; returns the plaintext size
    ///
    /// The artifact itself is never modified.
    pub fn decrypt_file(
        &self,
        artifact_path: impl AsRef<Path>,
        output: impl AsRef<Path>,
        key: &[u8],
    ) -> Result<usize, CipherError> {
        let artifact_path = artifact_path.as_ref();
        let output = output.as_ref();

        let artifact = self.parse_artifact(&fs::read(artifact_path)?)?;
        let plaintext = Zeroizing::new(self.decrypt(&artifact, key)?);
        write_atomic(output, &plaintext)?;

        info!(
            "Decrypted {} -> {} ({} bytes)",
            artifact_path.display(),
            output.display(),
            plaintext.len()
        );

        Ok(plaintext.len())
    }

    pub fn config(&self) -> &CipherConfig {
        &self.config
    }

    fn check_key(&self, key: &[u8]) -> Result<(), CipherError> {
        let expected = self.config.kind.key_len();
        if key.len() != expected {
            return Err(CipherError::KeyLength {
                expected,
                actual: key.len(),
            });
        }
        Ok(())
    }

    fn apply(
        &self,
        key: &[u8],
        iv: &[u8; IV_SIZE],
        buf: &mut [u8],
        direction: Direction,
    ) -> Result<(), CipherError> {
        match self.config.kind {
            CipherKind::Aes128Cfb8 => run::<Aes128>(key, iv, buf, direction),
            CipherKind::Aes256Cfb8 => run::<Aes256>(key, iv, buf, direction),
        }
    }

    fn mac(&self, key: &[u8]) -> Result<HmacSha256, CipherError> {
        let mut mac_key = Zeroizing::new([0u8; 32]);
        Hkdf::<Sha256>::new(None, key)
            .expand(MAC_KEY_INFO, &mut mac_key[..])
            .map_err(|e| CipherError::Crypto(e.to_string()))?;

        HmacSha256::new_from_slice(&mac_key[..]).map_err(|e| CipherError::Crypto(e.to_string()))
    }

    fn tag(&self, key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<[u8; TAG_SIZE], CipherError> {
        let mut mac = self.mac(key)?;
        mac.update(iv);
        mac.update(ciphertext);

        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&mac.finalize().into_bytes());
        Ok(tag)
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Encrypt,
    Decrypt,
}

fn run<C>(key: &[u8], iv: &[u8], buf: &mut [u8], direction: Direction) -> Result<(), CipherError>
where
    C: aes::cipher::BlockEncryptMut + aes::cipher::BlockCipher + aes::cipher::KeyInit,
{
    match direction {
        Direction::Encrypt => cfb8::Encryptor::<C>::new_from_slices(key, iv)
            .map_err(|e| CipherError::Crypto(e.to_string()))?
            .encrypt(buf),
        Direction::Decrypt => cfb8::Decryptor::<C>::new_from_slices(key, iv)
            .map_err(|e| CipherError::Crypto(e.to_string()))?
            .decrypt(buf),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use test_case::test_case;

    fn engine(kind: CipherKind, authenticate: bool) -> CipherEngine {
        CipherEngine::new(CipherConfig { kind, authenticate })
    }

    fn key_for(kind: CipherKind, byte: u8) -> Vec<u8> {
        vec![byte; kind.key_len()]
    }

    #[test_case(CipherKind::Aes128Cfb8, false ; "aes128 plain")]
    #[test_case(CipherKind::Aes128Cfb8, true ; "aes128 authenticated")]
    #[test_case(CipherKind::Aes256Cfb8, false ; "aes256 plain")]
    #[test_case(CipherKind::Aes256Cfb8, true ; "aes256 authenticated")]
    fn test_roundtrip(kind: CipherKind, authenticate: bool) {
        let engine = engine(kind, authenticate);
        let key = key_for(kind, 7);

        for payload in [&b""[..], b"x", b"not block aligned payload, 37 bytes"] {
            let artifact = engine.encrypt(payload, &key).unwrap();
            let parsed = engine.parse_artifact(&artifact.to_bytes()).unwrap();
            assert_eq!(engine.decrypt(&parsed, &key).unwrap(), payload);
        }
    }

    #[test]
    fn test_known_answer_cfb8_aes128() {
        // NIST SP 800-38A F.3.7
        let key = hex::decode("2b7e151628aed2a6abf7158809cf4f3c").unwrap();
        let iv: [u8; IV_SIZE] = hex::decode("000102030405060708090a0b0c0d0e0f")
            .unwrap()
            .try_into()
            .unwrap();
        let plaintext = hex::decode("6bc1bee22e409f96e93d7e117393172aae2d").unwrap();

        let artifact = engine(CipherKind::Aes128Cfb8, false)
            .encrypt_with_iv(&plaintext, &key, iv)
            .unwrap();

        assert_eq!(
            hex::encode(artifact.ciphertext()),
            "3b79424c9c0dd436bace9e0ed4586a4f32b9"
        );
    }

    #[test]
    fn test_artifact_layout() {
        let plain = engine(CipherKind::Aes128Cfb8, false);
        let authed = engine(CipherKind::Aes128Cfb8, true);
        let key = key_for(CipherKind::Aes128Cfb8, 1);

        let a = plain.encrypt(&[0u8; 100], &key).unwrap();
        assert_eq!(a.to_bytes().len(), IV_SIZE + 100);
        assert!(a.tag().is_none());

        let b = authed.encrypt(&[0u8; 100], &key).unwrap();
        assert_eq!(b.to_bytes().len(), IV_SIZE + 100 + TAG_SIZE);
    }

    #[test]
    fn test_fresh_iv_per_encryption() {
        let engine = engine(CipherKind::Aes128Cfb8, false);
        let key = key_for(CipherKind::Aes128Cfb8, 1);

        let a = engine.encrypt(b"same payload", &key).unwrap();
        let b = engine.encrypt(b"same payload", &key).unwrap();

        assert_ne!(a.iv(), b.iv());
        assert_ne!(a.ciphertext(), b.ciphertext());
    }

    #[test]
    fn test_wrong_key_does_not_recover_plaintext() {
        let engine = engine(CipherKind::Aes128Cfb8, false);
        let payload = b"attack at dawn, bring snacks".to_vec();

        let artifact = engine
            .encrypt(&payload, &key_for(CipherKind::Aes128Cfb8, 1))
            .unwrap();
        let garbage = engine
            .decrypt(&artifact, &key_for(CipherKind::Aes128Cfb8, 2))
            .unwrap();

        assert_ne!(garbage, payload);
    }

    #[test]
    fn test_wrong_key_fails_integrity_when_authenticated() {
        let engine = engine(CipherKind::Aes256Cfb8, true);
        let artifact = engine
            .encrypt(b"payload", &key_for(CipherKind::Aes256Cfb8, 1))
            .unwrap();

        assert!(matches!(
            engine.decrypt(&artifact, &key_for(CipherKind::Aes256Cfb8, 2)),
            Err(CipherError::Integrity)
        ));
    }

    #[test]
    fn test_tampering_detected() {
        let engine = engine(CipherKind::Aes128Cfb8, true);
        let key = key_for(CipherKind::Aes128Cfb8, 3);

        let mut bytes = engine.encrypt(b"payload", &key).unwrap().to_bytes();
        bytes[IV_SIZE] ^= 0x01;

        let parsed = engine.parse_artifact(&bytes).unwrap();
        assert!(matches!(
            engine.decrypt(&parsed, &key),
            Err(CipherError::Integrity)
        ));
    }

    #[test_case(CipherKind::Aes128Cfb8, 32 ; "aes128 given 32")]
    #[test_case(CipherKind::Aes256Cfb8, 16 ; "aes256 given 16")]
    fn test_key_length_mismatch(kind: CipherKind, given: usize) {
        let engine = engine(kind, false);

        match engine.encrypt(b"data", &vec![0u8; given]) {
            Err(CipherError::KeyLength { expected, actual }) => {
                assert_eq!(expected, kind.key_len());
                assert_eq!(actual, given);
            }
            other => panic!("expected KeyLength error, got {:?}", other),
        }
    }

    #[test]
    fn test_artifact_too_short() {
        let engine = engine(CipherKind::Aes128Cfb8, true);
        assert!(matches!(
            engine.parse_artifact(&[0u8; 20]),
            Err(CipherError::ArtifactTooShort { len: 20, min: 48 })
        ));
    }

    #[test]
    fn test_file_roundtrip_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let engine = engine(CipherKind::Aes128Cfb8, false);
        let key = key_for(CipherKind::Aes128Cfb8, 9);

        let input = dir.path().join("notes.txt");
        let artifact = dir.path().join("notes.txt.enc");
        let output = dir.path().join("notes.txt.dec");
        fs::write(&input, b"file contents").unwrap();

        let written = engine.encrypt_file(&input, &artifact, &key).unwrap();
        assert_eq!(written, IV_SIZE + 13);

        engine.decrypt_file(&artifact, &output, &key).unwrap();
        assert_eq!(fs::read(&output).unwrap(), b"file contents");
        assert!(artifact.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 3);
    }

    #[test]
    fn test_failed_encrypt_writes_nothing() {
        let dir = tempdir().unwrap();
        let engine = engine(CipherKind::Aes128Cfb8, false);

        let input = dir.path().join("in.bin");
        let output = dir.path().join("in.bin.enc");
        fs::write(&input, b"data").unwrap();

        assert!(engine.encrypt_file(&input, &output, &[0u8; 5]).is_err());
        assert!(!output.exists());
    }

    #[test]
    fn test_cipher_kind_from_str() {
        assert_eq!("aes128".parse::<CipherKind>().unwrap(), CipherKind::Aes128Cfb8);
        assert_eq!("AES-256".parse::<CipherKind>().unwrap(), CipherKind::Aes256Cfb8);
        assert!("des".parse::<CipherKind>().is_err());
    }
}
