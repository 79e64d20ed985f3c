//! Framed AES-256-GCM stream layer.
//!
//! The stream is a sequence of sealed frames:
//!
//! ```text
//! [u32 BE header: bit 31 = final, bits 0..31 = sealed length][ciphertext + tag]
//! ```
//!
//! The nonce of frame `n` is the 12-byte IV with `n` XOR-ed into its last
//! four bytes; the final flag is authenticated as associated data, so a
//! stream cut at a frame boundary still fails to read.
//!
//! Every stream gets its own frame key. In password mode the frames are
//! preceded by a random 16-byte stream salt mixed into the Argon2 key; in
//! public-key mode by the writer's 32-byte ephemeral X25519 public key. The IV
//! is shared by all archives of a backup instance, so the key must not be.

use super::Sink;
use crate::config::{EncryptionConfig, EncryptionMode};
use crate::utils::errors::{EngineError, Result};
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

pub const IV_LEN: usize = 12;
const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;
/// Maximum plaintext bytes per frame
const FRAME_LEN: usize = 64 * 1024;
const FINAL_FLAG: u32 = 0x8000_0000;
const STREAM_SALT_LEN: usize = 16;
const KEY_CONTEXT: &str = "appvault-engine 2024-06 archive stream key";
const PASSWORD_CONTEXT: &str = "appvault-engine 2024-06 password stream key";

/// How an archive was encrypted; recorded in the backup properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherType {
    #[serde(rename = "aes-256-gcm/argon2id")]
    Password,
    #[serde(rename = "aes-256-gcm/x25519")]
    PublicKey,
}

/// Secret input for the stream key.
#[derive(Clone)]
pub enum KeyMaterial {
    Password { password: String, salt: Vec<u8> },
    /// Encrypt-only: the recipient's public key
    Recipient { public: [u8; KEY_LEN] },
    /// Decrypt-only: our secret key
    Secret { secret: [u8; KEY_LEN] },
}

impl KeyMaterial {
    /// Keys for writing new archives, `None` when encryption is off.
    pub fn for_backup(config: &EncryptionConfig) -> Result<Option<Self>> {
        match config.mode {
            EncryptionMode::None => Ok(None),
            EncryptionMode::Password => password_material(config).map(Some),
            EncryptionMode::PublicKey => {
                if config.public_key.is_empty() {
                    return Err(EngineError::CryptoSetup("public key is empty".to_string()));
                }
                Ok(Some(KeyMaterial::Recipient {
                    public: decode_key(&config.public_key, "public key")?,
                }))
            }
        }
    }

    /// Keys for reading an archive written with `recorded` (or, when the
    /// record has none, with whatever the configuration says).
    pub fn for_restore(config: &EncryptionConfig, recorded: Option<CipherType>) -> Result<Self> {
        let cipher = match (recorded, config.mode) {
            (Some(cipher), _) => cipher,
            (None, EncryptionMode::PublicKey) => CipherType::PublicKey,
            (None, _) => CipherType::Password,
        };
        match cipher {
            CipherType::Password => password_material(config),
            CipherType::PublicKey => {
                if config.secret_key.is_empty() {
                    return Err(EngineError::CryptoSetup("secret key is empty".to_string()));
                }
                Ok(KeyMaterial::Secret {
                    secret: decode_key(&config.secret_key, "secret key")?,
                })
            }
        }
    }

    pub fn cipher_type(&self) -> CipherType {
        match self {
            KeyMaterial::Password { .. } => CipherType::Password,
            KeyMaterial::Recipient { .. } | KeyMaterial::Secret { .. } => CipherType::PublicKey,
        }
    }
}

fn password_material(config: &EncryptionConfig) -> Result<KeyMaterial> {
    if config.password.is_empty() {
        return Err(EngineError::CryptoSetup("Password is empty".to_string()));
    }
    if config.salt.len() < 8 {
        return Err(EngineError::CryptoSetup(
            "salt must be at least 8 bytes".to_string(),
        ));
    }
    Ok(KeyMaterial::Password {
        password: config.password.clone(),
        salt: config.salt.as_bytes().to_vec(),
    })
}

fn decode_key(hex_key: &str, what: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| EngineError::CryptoSetup(format!("{} is not hex: {}", what, e)))?;
    bytes
        .try_into()
        .map_err(|_| EngineError::CryptoSetup(format!("{} must be {} bytes", what, KEY_LEN)))
}

/// Fresh random IV for one backup instance.
pub fn generate_iv() -> Vec<u8> {
    let mut iv = vec![0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// New X25519 key pair as `(secret, public)`.
pub fn generate_keypair() -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret.to_bytes(), public.to_bytes())
}

fn iv_array(iv: &[u8]) -> Result<[u8; IV_LEN]> {
    iv.try_into()
        .map_err(|_| EngineError::CryptoSetup(format!("IV must be {} bytes", IV_LEN)))
}

fn password_key(password: &str, salt: &[u8]) -> Result<[u8; KEY_LEN]> {
    let mut key = [0u8; KEY_LEN];
    Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| EngineError::CryptoSetup(format!("key derivation failed: {}", e)))?;
    Ok(key)
}

fn stream_password_key(base: &[u8; KEY_LEN], stream_salt: &[u8; STREAM_SALT_LEN]) -> [u8; KEY_LEN] {
    let mut material = Vec::with_capacity(KEY_LEN + STREAM_SALT_LEN);
    material.extend_from_slice(base);
    material.extend_from_slice(stream_salt);
    blake3::derive_key(PASSWORD_CONTEXT, &material)
}

fn exchange_key(shared: &[u8; 32], ephemeral: &[u8; 32], recipient: &[u8; 32]) -> [u8; KEY_LEN] {
    let mut material = Vec::with_capacity(96);
    material.extend_from_slice(shared);
    material.extend_from_slice(ephemeral);
    material.extend_from_slice(recipient);
    blake3::derive_key(KEY_CONTEXT, &material)
}

fn frame_nonce(iv: &[u8; IV_LEN], counter: u32) -> [u8; IV_LEN] {
    let mut nonce = *iv;
    for (i, b) in counter.to_be_bytes().iter().enumerate() {
        nonce[IV_LEN - 4 + i] ^= b;
    }
    nonce
}

fn new_cipher(key: &[u8; KEY_LEN]) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key)
        .map_err(|_| EngineError::CryptoSetup("invalid key length".to_string()))
}

pub struct CipherWriter {
    inner: Box<dyn Sink>,
    cipher: Aes256Gcm,
    iv: [u8; IV_LEN],
    counter: u32,
    buffer: Vec<u8>,
}

impl CipherWriter {
    pub fn new(mut inner: Box<dyn Sink>, keys: &KeyMaterial, iv: &[u8]) -> Result<Self> {
        let iv = iv_array(iv)?;
        let key = match keys {
            KeyMaterial::Password { password, salt } => {
                let mut stream_salt = [0u8; STREAM_SALT_LEN];
                OsRng.fill_bytes(&mut stream_salt);
                inner.write_all(&stream_salt)?;
                stream_password_key(&password_key(password, salt)?, &stream_salt)
            }
            KeyMaterial::Recipient { public } => {
                let recipient = PublicKey::from(*public);
                let ephemeral = EphemeralSecret::random_from_rng(OsRng);
                let ephemeral_public = PublicKey::from(&ephemeral);
                let shared = ephemeral.diffie_hellman(&recipient);
                inner.write_all(ephemeral_public.as_bytes())?;
                exchange_key(shared.as_bytes(), ephemeral_public.as_bytes(), recipient.as_bytes())
            }
            KeyMaterial::Secret { .. } => {
                return Err(EngineError::CryptoSetup(
                    "a public key is required to encrypt".to_string(),
                ))
            }
        };

        Ok(Self {
            inner,
            cipher: new_cipher(&key)?,
            iv,
            counter: 0,
            buffer: Vec::with_capacity(FRAME_LEN + 1),
        })
    }

    fn seal(&mut self, len: usize, last: bool) -> io::Result<()> {
        let plain: Vec<u8> = self.buffer.drain(..len).collect();
        let nonce = frame_nonce(&self.iv, self.counter);
        let aad = [last as u8];
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: &plain, aad: &aad })
            .map_err(|_| io::Error::other("frame encryption failed"))?;

        let mut header = sealed.len() as u32;
        if last {
            header |= FINAL_FLAG;
        }
        self.inner.write_all(&header.to_be_bytes())?;
        self.inner.write_all(&sealed)?;
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| io::Error::other("frame counter exhausted"))?;
        Ok(())
    }
}

impl Write for CipherWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        // keep at least one byte back so the last data lands in the final frame
        while self.buffer.len() > FRAME_LEN {
            self.seal(FRAME_LEN, false)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Sink for CipherWriter {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        let len = self.buffer.len();
        self.seal(len, true)?;
        self.inner.finish()
    }
}

pub struct CipherReader {
    inner: Box<dyn Read + Send>,
    cipher: Aes256Gcm,
    iv: [u8; IV_LEN],
    counter: u32,
    plain: Vec<u8>,
    pos: usize,
    done: bool,
}

impl CipherReader {
    pub fn new(mut inner: Box<dyn Read + Send>, keys: &KeyMaterial, iv: &[u8]) -> Result<Self> {
        let iv = iv_array(iv)?;
        let key = match keys {
            KeyMaterial::Password { password, salt } => {
                let mut stream_salt = [0u8; STREAM_SALT_LEN];
                inner.read_exact(&mut stream_salt)?;
                stream_password_key(&password_key(password, salt)?, &stream_salt)
            }
            KeyMaterial::Secret { secret } => {
                let secret = StaticSecret::from(*secret);
                let recipient = PublicKey::from(&secret);
                let mut ephemeral = [0u8; 32];
                inner.read_exact(&mut ephemeral)?;
                let shared = secret.diffie_hellman(&PublicKey::from(ephemeral));
                exchange_key(shared.as_bytes(), &ephemeral, recipient.as_bytes())
            }
            KeyMaterial::Recipient { .. } => {
                return Err(EngineError::CryptoSetup(
                    "the secret key is required to decrypt".to_string(),
                ))
            }
        };

        Ok(Self {
            inner,
            cipher: new_cipher(&key)?,
            iv,
            counter: 0,
            plain: Vec::new(),
            pos: 0,
            done: false,
        })
    }

    fn read_frame_bytes(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.inner.read_exact(buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "encrypted stream ended before its final frame",
                )
            } else {
                e
            }
        })
    }

    fn next_frame(&mut self) -> io::Result<()> {
        let mut header = [0u8; 4];
        self.read_frame_bytes(&mut header)?;
        let header = u32::from_be_bytes(header);
        let last = header & FINAL_FLAG != 0;
        let len = (header & !FINAL_FLAG) as usize;
        if !(TAG_LEN..=FRAME_LEN + TAG_LEN).contains(&len) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "corrupt encrypted frame header",
            ));
        }

        let mut sealed = vec![0u8; len];
        self.read_frame_bytes(&mut sealed)?;
        let nonce = frame_nonce(&self.iv, self.counter);
        let aad = [last as u8];
        self.plain = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: &sealed, aad: &aad })
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    "encrypted frame failed authentication (wrong key or corrupt archive)",
                )
            })?;
        self.pos = 0;
        self.done = last;
        self.counter = self.counter.wrapping_add(1);
        Ok(())
    }
}

impl Read for CipherReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.plain.len() {
                let n = buf.len().min(self.plain.len() - self.pos);
                buf[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.done || buf.is_empty() {
                return Ok(0);
            }
            self.next_frame()?;
        }
    }
}
