//! Digest: an algorithm-prefixed content hash (`sha256:ab12...`).
//!
//! Digests are the only address a blob has. They are always computed from
//! the bytes being stored; a digest handed to us by a caller is treated as
//! a claim to be checked, never as the truth.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256, Sha512};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur when parsing a digest string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DigestError {
    #[error("digest is missing the '<algorithm>:' prefix: {0}")]
    MissingAlgorithm(String),

    #[error("unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("invalid {algorithm} digest length: expected {expected} hex chars, got {actual}")]
    InvalidLength {
        algorithm: Algorithm,
        expected: usize,
        actual: usize,
    },

    #[error("invalid hex character in digest (must be lowercase hex)")]
    InvalidHex,
}

/// Hash algorithms a layout can address blobs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    #[default]
    Sha256,
    Sha512,
    Blake3,
}

impl Algorithm {
    /// Name used in digest strings and as the `blobs/` subdirectory.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
            Algorithm::Blake3 => "blake3",
        }
    }

    /// Length of the hex-encoded hash.
    pub fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 | Algorithm::Blake3 => 64,
            Algorithm::Sha512 => 128,
        }
    }

    /// Hash data in one shot.
    pub fn digest(&self, data: &[u8]) -> Digest {
        let mut digester = self.digester();
        digester.update(data);
        digester.finish()
    }

    /// Start an incremental hash.
    pub fn digester(&self) -> Digester {
        let state = match self {
            Algorithm::Sha256 => DigesterState::Sha256(Sha256::new()),
            Algorithm::Sha512 => DigesterState::Sha512(Sha512::new()),
            Algorithm::Blake3 => DigesterState::Blake3(Box::new(blake3::Hasher::new())),
        };
        Digester { state, bytes: 0 }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            "blake3" => Ok(Algorithm::Blake3),
            other => Err(DigestError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// A content digest: algorithm plus lowercase hex hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// Hash data with sha256, the layout default.
    pub fn from_data(data: &[u8]) -> Self {
        Algorithm::Sha256.digest(data)
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The hex component, used as the blob filename.
    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (alg, hex) = s
            .split_once(':')
            .ok_or_else(|| DigestError::MissingAlgorithm(s.to_string()))?;
        let algorithm: Algorithm = alg.parse()?;

        if hex.len() != algorithm.hex_len() {
            return Err(DigestError::InvalidLength {
                algorithm,
                expected: algorithm.hex_len(),
                actual: hex.len(),
            });
        }
        if !hex.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
            return Err(DigestError::InvalidHex);
        }

        Ok(Self {
            algorithm,
            hex: hex.to_string(),
        })
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

enum DigesterState {
    Sha256(Sha256),
    Sha512(Sha512),
    Blake3(Box<blake3::Hasher>),
}

/// Incremental hasher used while streaming a blob to disk.
pub struct Digester {
    state: DigesterState,
    bytes: u64,
}

impl Digester {
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            DigesterState::Sha256(h) => h.update(data),
            DigesterState::Sha512(h) => h.update(data),
            DigesterState::Blake3(h) => {
                h.update(data);
            }
        }
        self.bytes += data.len() as u64;
    }

    /// Number of bytes hashed so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finish(self) -> Digest {
        let (algorithm, hex) = match self.state {
            DigesterState::Sha256(h) => (Algorithm::Sha256, hex::encode(h.finalize())),
            DigesterState::Sha512(h) => (Algorithm::Sha512, hex::encode(h.finalize())),
            DigesterState::Blake3(h) => (Algorithm::Blake3, h.finalize().to_hex().to_string()),
        };
        Digest { algorithm, hex }
    }
}

impl fmt::Debug for Digester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Digester").field("bytes", &self.bytes).finish()
    }
}
