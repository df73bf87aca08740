// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Keylime Authors
use crate::algorithms::HashAlgorithm;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Keylime algorithm error: {0}")]
    Algorithm(#[from] crate::algorithms::AlgorithmError),
    #[error("Virtual TPM error: {0}")]
    Tpm(#[from] crate::vtpm::TpmError),
    #[error("Configuration error: {0}")]
    Settings(#[from] crate::settings::SettingsError),
    #[error("OpenSSL error: {0}")]
    OpenSSL(#[from] openssl::error::ErrorStack),
    #[error("from hex error: {0}")]
    FromHex(#[from] hex::FromHexError),
    #[error("Invalid {algorithm} digest length: expected {expected} bytes, got {actual}")]
    DigestLength {
        algorithm: HashAlgorithm,
        expected: usize,
        actual: usize,
    },
    #[error("Firmware image is required to resolve measurement {0}")]
    MissingFirmwareImage(String),
    #[error("Measured range {offset:#x}+{length:#x} is outside of the firmware image ({image_size:#x} bytes)")]
    OutOfImage {
        offset: u64,
        length: u64,
        image_size: usize,
    },
    #[error("Too many combinations: {0}")]
    TooManyCombinations(String),
    #[error("Search cancelled")]
    Cancelled,
    #[error("{} search worker(s) failed: {}", .0.len(), join_errors(.0))]
    Workers(Vec<Error>),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("{0}")]
    Other(String),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<String>>()
        .join("; ")
}

impl Error {
    /// Merges the errors reported by a set of workers into a single error.
    ///
    /// A single error is returned as is, several are wrapped in
    /// [`Error::Workers`].
    pub fn from_workers(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Error::Workers(errors)),
        }
    }

    /// Returns whether the error only reports a cancelled search, possibly
    /// seen by several workers.
    pub fn is_cancellation(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Workers(errors) => errors.iter().all(Error::is_cancellation),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {

    use super::*;
    use crate::vtpm::TpmError;

    #[test]
    fn test_error_display() {
        let err = Error::Tpm(TpmError::AlreadyInitialized);
        assert_eq!(
            format!("{err}"),
            "Virtual TPM error: TPM is already initialized"
        );
    }

    #[test]
    fn test_error_digest_length() {
        let err = Error::DigestLength {
            algorithm: HashAlgorithm::Sha1,
            expected: 20,
            actual: 32,
        };
        assert_eq!(
            format!("{err}"),
            "Invalid sha1 digest length: expected 20 bytes, got 32"
        );
    }

    #[test]
    fn test_error_from_workers() {
        assert!(Error::from_workers(vec![]).is_none());

        let single = Error::from_workers(vec![Error::Cancelled]);
        assert!(matches!(single, Some(Error::Cancelled)));

        let multi = Error::from_workers(vec![
            Error::Other("first".to_string()),
            Error::Other("second".to_string()),
        ])
        .unwrap(); //#[allow_ci]
        assert_eq!(
            format!("{multi}"),
            "2 search worker(s) failed: first; second"
        );
    }

    #[test]
    fn test_is_cancellation() {
        assert!(Error::Cancelled.is_cancellation());
        assert!(Error::Workers(vec![Error::Cancelled, Error::Cancelled])
            .is_cancellation());
        assert!(!Error::Workers(vec![
            Error::Cancelled,
            Error::Other("failed".to_string())
        ])
        .is_cancellation());
        assert!(!Error::InvalidInput("x".to_string()).is_cancellation());
    }
}
