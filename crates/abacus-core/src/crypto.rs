//! Per-datagram authenticated encryption for peer traffic.
//!
//! Every node shares one symmetric key and one base IV, read from files
//! at startup and fixed for the life of the process. Each datagram is
//! sealed on its own:
//!
//! ```text
//!   [counter: u64 BE][ciphertext ‖ 16-byte tag]
//!   nonce = iv XOR (0x00000000 ‖ counter BE)
//! ```
//!
//! The counter starts at a random value per process and increments per
//! datagram, so two nodes sharing the key do not walk the same nonces.
//! Key material is held in `Zeroizing` buffers and wiped when dropped.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use aes_gcm::aead::{Aead as _, KeyInit as _, Nonce};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

/// Nonce / IV length for every supported cipher.
pub const IV_LEN: usize = 12;

/// Authentication tag length for every supported cipher.
pub const TAG_LEN: usize = 16;

/// Counter prefix length.
pub const COUNTER_LEN: usize = 8;

/// Bytes a sealed datagram adds on top of its plaintext.
pub const SEAL_OVERHEAD: usize = COUNTER_LEN + TAG_LEN;

// ── Cipher names ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    ChaCha20Poly1305,
    Aes256Gcm,
    Aes128Gcm,
}

impl CipherKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::ChaCha20Poly1305 => "chacha20-poly1305",
            Self::Aes256Gcm => "aes-256-gcm",
            Self::Aes128Gcm => "aes-128-gcm",
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            Self::ChaCha20Poly1305 | Self::Aes256Gcm => 32,
            Self::Aes128Gcm => 16,
        }
    }
}

impl FromStr for CipherKind {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chacha20-poly1305" => Ok(Self::ChaCha20Poly1305),
            "aes-256-gcm" => Ok(Self::Aes256Gcm),
            "aes-128-gcm" => Ok(Self::Aes128Gcm),
            _ => Err(CryptoError::UnknownCipher(s.to_string())),
        }
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Cipher ────────────────────────────────────────────────────────────────────

enum Engine {
    ChaCha(ChaCha20Poly1305),
    Aes256(Aes256Gcm),
    Aes128(Aes128Gcm),
}

/// Seals and opens individual datagrams. Shared by the send path and the
/// receiver task; sealing only touches an atomic counter.
pub struct DatagramCipher {
    kind: CipherKind,
    engine: Engine,
    iv: Zeroizing<[u8; IV_LEN]>,
    counter: AtomicU64,
}

impl DatagramCipher {
    /// Load key and IV from files. Only the first `key_len` bytes of the
    /// key file and the first 12 bytes of the IV file are used.
    pub fn load(kind: CipherKind, key_path: &Path, iv_path: &Path) -> Result<Self, CryptoError> {
        let key = read_secret(key_path)?;
        if key.len() < kind.key_len() {
            return Err(CryptoError::ShortKey {
                path: key_path.to_path_buf(),
                need: kind.key_len(),
                got: key.len(),
            });
        }
        let iv = read_secret(iv_path)?;
        if iv.len() < IV_LEN {
            return Err(CryptoError::ShortIv {
                path: iv_path.to_path_buf(),
                got: iv.len(),
            });
        }
        Self::from_parts(kind, &key, &iv)
    }

    /// Build from raw key and IV bytes. Excess bytes are ignored.
    pub fn from_parts(kind: CipherKind, key: &[u8], iv: &[u8]) -> Result<Self, CryptoError> {
        let key_len = kind.key_len();
        if key.len() < key_len {
            return Err(CryptoError::ShortKey {
                path: PathBuf::new(),
                need: key_len,
                got: key.len(),
            });
        }
        if iv.len() < IV_LEN {
            return Err(CryptoError::ShortIv {
                path: PathBuf::new(),
                got: iv.len(),
            });
        }

        let key = &key[..key_len];
        let engine = match kind {
            CipherKind::ChaCha20Poly1305 => {
                Engine::ChaCha(ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::KeyInit)?)
            }
            CipherKind::Aes256Gcm => {
                Engine::Aes256(Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::KeyInit)?)
            }
            CipherKind::Aes128Gcm => {
                Engine::Aes128(Aes128Gcm::new_from_slice(key).map_err(|_| CryptoError::KeyInit)?)
            }
        };

        let mut base = Zeroizing::new([0u8; IV_LEN]);
        base.copy_from_slice(&iv[..IV_LEN]);

        Ok(Self {
            kind,
            engine,
            iv: base,
            counter: AtomicU64::new(rand::thread_rng().next_u64()),
        })
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Encrypt one plaintext frame into a self-contained datagram.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let nonce = self.nonce(counter);

        let ciphertext = match &self.engine {
            Engine::ChaCha(c) => c.encrypt(chacha20poly1305::Nonce::from_slice(&nonce), plaintext),
            Engine::Aes256(c) => c.encrypt(Nonce::<Aes256Gcm>::from_slice(&nonce), plaintext),
            Engine::Aes128(c) => c.encrypt(Nonce::<Aes128Gcm>::from_slice(&nonce), plaintext),
        }
        .map_err(|_| CryptoError::Seal)?;

        let mut out = Vec::with_capacity(COUNTER_LEN + ciphertext.len());
        out.extend_from_slice(&counter.to_be_bytes());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Authenticate and decrypt one datagram.
    pub fn open(&self, datagram: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if datagram.len() < SEAL_OVERHEAD {
            return Err(CryptoError::TooShort(datagram.len()));
        }
        let mut prefix = [0u8; COUNTER_LEN];
        prefix.copy_from_slice(&datagram[..COUNTER_LEN]);
        let nonce = self.nonce(u64::from_be_bytes(prefix));
        let body = &datagram[COUNTER_LEN..];

        match &self.engine {
            Engine::ChaCha(c) => c.decrypt(chacha20poly1305::Nonce::from_slice(&nonce), body),
            Engine::Aes256(c) => c.decrypt(Nonce::<Aes256Gcm>::from_slice(&nonce), body),
            Engine::Aes128(c) => c.decrypt(Nonce::<Aes128Gcm>::from_slice(&nonce), body),
        }
        .map_err(|_| CryptoError::Open)
    }

    fn nonce(&self, counter: u64) -> [u8; IV_LEN] {
        let mut nonce = *self.iv;
        for (n, c) in nonce[IV_LEN - COUNTER_LEN..]
            .iter_mut()
            .zip(counter.to_be_bytes())
        {
            *n ^= c;
        }
        nonce
    }
}

impl fmt::Debug for DatagramCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramCipher")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

fn read_secret(path: &Path) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    std::fs::read(path)
        .map(Zeroizing::new)
        .map_err(|e| CryptoError::ReadFailed(path.to_path_buf(), e))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("unknown cipher {0:?} (expected chacha20-poly1305, aes-256-gcm or aes-128-gcm)")]
    UnknownCipher(String),

    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),

    #[error("key {path:?} holds {got} bytes, cipher needs {need}")]
    ShortKey { path: PathBuf, need: usize, got: usize },

    #[error("iv {path:?} holds {got} bytes, need {}", IV_LEN)]
    ShortIv { path: PathBuf, got: usize },

    #[error("cipher rejected the key")]
    KeyInit,

    #[error("encryption failed")]
    Seal,

    #[error("datagram failed authentication")]
    Open,

    #[error("datagram of {0} bytes is shorter than the {}-byte seal overhead", SEAL_OVERHEAD)]
    TooShort(usize),
}
