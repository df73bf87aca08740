// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Keylime Authors

//! Forensic search of the firmware image data behind an unexplained digest.
//!
//! The image is scanned at a fixed offset step for regions of a set of
//! candidate lengths whose hash is the digest. When the region found is
//! itself digest sized, it is likely a hash of some other data, and a
//! second search looks for that data.

use crate::algorithms::HashAlgorithm;
use crate::cancel::CancelToken;
use crate::digest::Digest;
use crate::error::{Error, Result};
use log::*;
use serde_derive::Serialize;
use std::fmt;

/// Location of the data producing a digest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DigestSource {
    pub offset: usize,
    pub length: usize,
    /// Set when the region is itself the digest of another region.
    pub nested: Option<Box<DigestSource>>,
}

impl fmt::Display for DigestSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "image range {:#x}..{:#x}",
            self.offset,
            self.offset + self.length
        )?;
        if let Some(nested) = &self.nested {
            write!(f, ", hash of {nested}")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct DigestSourceFinder<'a> {
    image: &'a [u8],
    algorithm: HashAlgorithm,
    alignment: usize,
    lengths: Vec<usize>,
    cancel: CancelToken,
}

impl<'a> DigestSourceFinder<'a> {
    /// Creates a finder over `image`, trying offsets multiple of
    /// `alignment`. The digest size is always a candidate length.
    pub fn new(
        image: &'a [u8],
        algorithm: HashAlgorithm,
        alignment: usize,
    ) -> Self {
        Self {
            image,
            algorithm,
            alignment: alignment.max(1),
            lengths: vec![algorithm.digest_size()],
            cancel: CancelToken::new(),
        }
    }

    /// Adds candidate region lengths.
    pub fn lengths(mut self, lengths: impl IntoIterator<Item = usize>) -> Self {
        self.lengths.extend(lengths);
        self.lengths
            .retain(|&length| length > 0 && length <= self.image.len());
        self.lengths.sort_unstable();
        self.lengths.dedup();
        self
    }

    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Looks for the image region hashing to `digest`.
    pub fn find(&self, digest: &Digest) -> Result<Option<DigestSource>> {
        digest.check_size(self.algorithm)?;
        let Some(mut source) = self.scan(digest)? else {
            return Ok(None);
        };

        if source.length == self.algorithm.digest_size() {
            let region =
                Digest::from(&self.image[source.offset..][..source.length]);
            if let Some(nested) = self.scan(&region)? {
                debug!(
                    "Digest source {:#x} is the hash of {nested}",
                    source.offset
                );
                source.nested = Some(Box::new(nested));
            }
        }
        info!("Found source of digest {digest}: {source}");
        Ok(Some(source))
    }

    fn scan(&self, digest: &Digest) -> Result<Option<DigestSource>> {
        for &length in &self.lengths {
            let Some(last) = self.image.len().checked_sub(length) else {
                continue;
            };
            for offset in (0..=last).step_by(self.alignment) {
                if self.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let region = &self.image[offset..offset + length];
                if self.algorithm.hash(region)? == *digest {
                    return Ok(Some(DigestSource {
                        offset,
                        length,
                        nested: None,
                    }));
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALG: HashAlgorithm = HashAlgorithm::Sha1;

    fn image() -> Vec<u8> {
        (0..=255u8).cycle().take(1024).collect()
    }

    #[test]
    fn test_find_region() {
        let image = image();
        let digest = ALG.hash(&image[64..64 + 48]).unwrap(); //#[allow_ci]
        let source = DigestSourceFinder::new(&image, ALG, 16)
            .lengths([48, 100])
            .find(&digest)
            .unwrap() //#[allow_ci]
            .unwrap(); //#[allow_ci]
        assert_eq!(source.offset, 64);
        assert_eq!(source.length, 48);
        assert!(source.nested.is_none());
    }

    #[test]
    fn test_unaligned_region_is_not_found() {
        let image = image();
        let digest = ALG.hash(&image[65..65 + 48]).unwrap(); //#[allow_ci]
        let found = DigestSourceFinder::new(&image, ALG, 16)
            .lengths([48])
            .find(&digest)
            .unwrap(); //#[allow_ci]
        assert!(found.is_none());

        let found = DigestSourceFinder::new(&image, ALG, 1)
            .lengths([48])
            .find(&digest)
            .unwrap(); //#[allow_ci]
        assert_eq!(found.map(|s| s.offset), Some(65));
    }

    #[test]
    fn test_nested_source() {
        let mut image = image();
        let inner = ALG.hash(&image[512..512 + 32]).unwrap(); //#[allow_ci]
        image[128..128 + 20].copy_from_slice(inner.value());
        let outer = ALG.hash(inner.value()).unwrap(); //#[allow_ci]

        let source = DigestSourceFinder::new(&image, ALG, 16)
            .lengths([32])
            .find(&outer)
            .unwrap() //#[allow_ci]
            .unwrap(); //#[allow_ci]
        assert_eq!(source.offset, 128);
        assert_eq!(source.length, 20);
        let nested = source.nested.unwrap(); //#[allow_ci]
        assert_eq!((nested.offset, nested.length), (512, 32));
        assert_eq!(
            DigestSource {
                offset: 128,
                length: 20,
                nested: Some(nested),
            }
            .to_string(),
            "image range 0x80..0x94, hash of image range 0x200..0x220"
        );
    }

    #[test]
    fn test_lengths_larger_than_image_are_skipped() {
        let image = vec![0u8; 8];
        let digest = ALG.hash(b"nothing").unwrap(); //#[allow_ci]
        let found = DigestSourceFinder::new(&image, ALG, 1)
            .lengths([4096])
            .find(&digest)
            .unwrap(); //#[allow_ci]
        assert!(found.is_none());
    }

    #[test]
    fn test_cancelled() {
        let image = image();
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = DigestSourceFinder::new(&image, ALG, 16)
            .cancel_token(cancel)
            .find(&ALG.hash(b"x").unwrap()); //#[allow_ci]
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
