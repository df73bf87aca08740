// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Keylime Authors
use crate::algorithms::HashAlgorithm;
use crate::error::{Error, Result};
use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// Wrapper around a hash value.
///
/// Digests are produced by [`HashAlgorithm::hash`]. The `From` conversions
/// exist for values taken from an externally captured event log, whose
/// length is validated against the algorithm where it matters.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(Vec<u8>);

impl Digest {
    /// Creates a new `Digest` checking that `value` has the size of
    /// `algorithm`.
    pub fn new(algorithm: HashAlgorithm, value: &[u8]) -> Result<Self> {
        let digest = Self(value.to_vec());
        digest.check_size(algorithm)?;
        Ok(digest)
    }

    /// Returns an all-zero digest, the reset value of a PCR.
    pub fn zero(algorithm: HashAlgorithm) -> Self {
        Self(vec![0x00u8; algorithm.digest_size()])
    }

    /// Parses a hex encoded digest.
    pub fn from_hex(value: &str) -> Result<Self> {
        Ok(Self(hex::decode(value)?))
    }

    /// Retrieves the value held in this `Digest`.
    pub fn value(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn check_size(&self, algorithm: HashAlgorithm) -> Result<()> {
        if self.0.len() != algorithm.digest_size() {
            return Err(Error::DigestLength {
                algorithm,
                expected: algorithm.digest_size(),
                actual: self.0.len(),
            });
        }
        Ok(())
    }
}

impl From<&[u8]> for Digest {
    fn from(value: &[u8]) -> Self {
        Self(value.to_vec())
    }
}

impl From<Vec<u8>> for Digest {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Digest({})", hex::encode(&self.0))
    }
}
