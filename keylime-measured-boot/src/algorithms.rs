// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Keylime Authors
use crate::digest::Digest;
use openssl::hash::{hash, MessageDigest};
use serde_derive::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;
use thiserror::Error;

// TPM Algorithm Identifiers (TPM_ALG_ID)
pub const TPM_ALG_SHA1: u16 = 0x0004;
pub const TPM_ALG_SHA256: u16 = 0x000B;
pub const TPM_ALG_SHA384: u16 = 0x000C;
pub const TPM_ALG_SHA512: u16 = 0x000D;

// This error needs to be public because we implement TryFrom for public types
#[derive(Error, Debug)]
pub enum AlgorithmError {
    #[error("Hashing Algorithm {0} not supported")]
    UnsupportedHashingAlgorithm(String),

    #[error("Hashing Algorithm ID {0:#06x} not supported")]
    UnsupportedAlgorithmId(u16),
}

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    /// All algorithms a PCR bank can be allocated for.
    pub const ALL: [HashAlgorithm; 4] = [
        HashAlgorithm::Sha1,
        HashAlgorithm::Sha256,
        HashAlgorithm::Sha384,
        HashAlgorithm::Sha512,
    ];

    /// Size in bytes of the digests produced by this algorithm.
    pub fn digest_size(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// The TCG algorithm identifier, as found in TPM event logs.
    pub fn tpm_alg_id(self) -> u16 {
        match self {
            HashAlgorithm::Sha1 => TPM_ALG_SHA1,
            HashAlgorithm::Sha256 => TPM_ALG_SHA256,
            HashAlgorithm::Sha384 => TPM_ALG_SHA384,
            HashAlgorithm::Sha512 => TPM_ALG_SHA512,
        }
    }

    /// Hashes `data` with this algorithm.
    pub fn hash(self, data: &[u8]) -> Result<Digest, openssl::error::ErrorStack> {
        let value = hash(self.into(), data)?;
        Ok(Digest::from(value.as_ref()))
    }

    /// Hashes the concatenation of `parts` without building it in memory.
    pub fn hash_parts(
        self,
        parts: &[&[u8]],
    ) -> Result<Digest, openssl::error::ErrorStack> {
        let mut hasher = openssl::hash::Hasher::new(self.into())?;
        for part in parts {
            hasher.update(part)?;
        }
        Ok(Digest::from(hasher.finish()?.as_ref()))
    }
}

impl TryFrom<&str> for HashAlgorithm {
    type Error = AlgorithmError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "sha1" => Ok(HashAlgorithm::Sha1),
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha384" => Ok(HashAlgorithm::Sha384),
            "sha512" => Ok(HashAlgorithm::Sha512),
            _ => {
                Err(AlgorithmError::UnsupportedHashingAlgorithm(value.into()))
            }
        }
    }
}

impl TryFrom<u16> for HashAlgorithm {
    type Error = AlgorithmError;

    fn try_from(alg_id: u16) -> Result<Self, Self::Error> {
        match alg_id {
            TPM_ALG_SHA1 => Ok(HashAlgorithm::Sha1),
            TPM_ALG_SHA256 => Ok(HashAlgorithm::Sha256),
            TPM_ALG_SHA384 => Ok(HashAlgorithm::Sha384),
            TPM_ALG_SHA512 => Ok(HashAlgorithm::Sha512),
            _ => Err(AlgorithmError::UnsupportedAlgorithmId(alg_id)),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let value = match self {
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        };
        write!(f, "{value}")
    }
}

impl From<HashAlgorithm> for MessageDigest {
    fn from(hash_algorithm: HashAlgorithm) -> Self {
        match hash_algorithm {
            HashAlgorithm::Sha1 => MessageDigest::sha1(),
            HashAlgorithm::Sha256 => MessageDigest::sha256(),
            HashAlgorithm::Sha384 => MessageDigest::sha384(),
            HashAlgorithm::Sha512 => MessageDigest::sha512(),
        }
    }
}
