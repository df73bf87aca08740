// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Keylime Authors

//! Measured data as computed by a boot flow replay.
//!
//! A measurement is the concatenation of data chunks taken from raw bytes,
//! ranges of the firmware image or platform registers. Only the register
//! chunks matter for recovery: a measurement made of one known status
//! register plus other data can be repaired by searching for the register
//! value that reproduces the expected digest.

use crate::algorithms::HashAlgorithm;
use crate::digest::Digest;
use crate::error::{Error, Result};
use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// Size of a platform register value.
pub const REGISTER_SIZE: usize = 8;

assert_eq_size!(u64, [u8; REGISTER_SIZE]);

/// Address of a platform register.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RegisterId(pub u64);

impl RegisterId {
    /// ACM policy status register, in the TXT public space.
    pub const ACM_POLICY_STATUS: RegisterId = RegisterId(0xFED3_0378);

    /// Returns whether the register is a status register whose measured
    /// value can be recovered from a digest.
    pub fn is_status_register(self) -> bool {
        self == Self::ACM_POLICY_STATUS
    }
}

impl fmt::Display for RegisterId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::ACM_POLICY_STATUS => write!(f, "ACM_POLICY_STATUS"),
            RegisterId(address) => write!(f, "register {address:#x}"),
        }
    }
}

/// One contiguous piece of measured data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataChunk {
    Bytes(Vec<u8>),
    /// A range of the firmware image.
    Image { offset: u64, length: u64 },
    /// A register value, measured as 8 little-endian bytes.
    Register { id: RegisterId, value: u64 },
}

impl DataChunk {
    /// Length of the chunk data. Image ranges longer than the address space
    /// saturate at `usize::MAX`.
    pub fn len(&self) -> usize {
        match self {
            DataChunk::Bytes(bytes) => bytes.len(),
            DataChunk::Image { length, .. } => {
                usize::try_from(*length).unwrap_or(usize::MAX)
            }
            DataChunk::Register { .. } => REGISTER_SIZE,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Location of a status register inside the data of a measurement.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StatusRegister {
    pub id: RegisterId,
    pub value: u64,
    /// Offset of the register value in the measured data.
    pub offset: usize,
}

/// Data measured by a single boot flow step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurement {
    pub name: String,
    pub chunks: Vec<DataChunk>,
}

impl Measurement {
    pub fn new(name: impl Into<String>, chunks: Vec<DataChunk>) -> Self {
        Self {
            name: name.into(),
            chunks,
        }
    }

    /// Returns the measured data, resolving image ranges against `image`.
    pub fn data(&self, image: Option<&[u8]>) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        for chunk in &self.chunks {
            match chunk {
                DataChunk::Bytes(bytes) => data.extend_from_slice(bytes),
                DataChunk::Image { offset, length } => {
                    let image = image.ok_or_else(|| {
                        Error::MissingFirmwareImage(self.name.clone())
                    })?;
                    data.extend_from_slice(image_range(
                        image, *offset, *length,
                    )?);
                }
                DataChunk::Register { value, .. } => {
                    data.extend_from_slice(&value.to_le_bytes())
                }
            }
        }
        Ok(data)
    }

    /// Hashes the measured data.
    pub fn digest(
        &self,
        algorithm: HashAlgorithm,
        image: Option<&[u8]>,
    ) -> Result<Digest> {
        Ok(algorithm.hash(&self.data(image)?)?)
    }

    /// Returns the status register of this measurement, if the measurement
    /// contains exactly one register and that register is a known status
    /// register.
    pub fn status_register(&self) -> Option<StatusRegister> {
        let mut found = None;
        let mut offset = 0;
        for chunk in &self.chunks {
            if let DataChunk::Register { id, value } = chunk {
                if found.is_some() {
                    return None;
                }
                found = Some(StatusRegister {
                    id: *id,
                    value: *value,
                    offset,
                });
            }
            offset = offset.saturating_add(chunk.len());
        }
        found.filter(|register| register.id.is_status_register())
    }

    /// Returns a copy of this measurement with every chunk of register `id`
    /// set to `value`.
    pub fn with_register_value(&self, id: RegisterId, value: u64) -> Self {
        let chunks = self
            .chunks
            .iter()
            .map(|chunk| match chunk {
                DataChunk::Register { id: chunk_id, .. } if *chunk_id == id => {
                    DataChunk::Register { id, value }
                }
                other => other.clone(),
            })
            .collect();
        Self {
            name: self.name.clone(),
            chunks,
        }
    }

    /// Lengths of the data pieces of this measurement: every chunk and the
    /// whole data. The total saturates at `usize::MAX`.
    pub fn lengths(&self) -> Vec<usize> {
        let mut lengths: Vec<usize> =
            self.chunks.iter().map(DataChunk::len).collect();
        let total = lengths
            .iter()
            .fold(0usize, |total, &length| total.saturating_add(length));
        lengths.push(total);
        lengths
    }
}

fn image_range(image: &[u8], offset: u64, length: u64) -> Result<&[u8]> {
    let out_of_image = || Error::OutOfImage {
        offset,
        length,
        image_size: image.len(),
    };
    let start = usize::try_from(offset).map_err(|_| out_of_image())?;
    let end = start
        .checked_add(usize::try_from(length).map_err(|_| out_of_image())?)
        .ok_or_else(out_of_image)?;
    image.get(start..end).ok_or_else(out_of_image)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcr0_data(status: u64) -> Measurement {
        Measurement::new(
            "PCR0_DATA",
            vec![
                DataChunk::Register {
                    id: RegisterId::ACM_POLICY_STATUS,
                    value: status,
                },
                DataChunk::Bytes(vec![0xAA; 4]),
                DataChunk::Image {
                    offset: 2,
                    length: 3,
                },
            ],
        )
    }

    #[test]
    fn test_data_resolves_chunks() {
        let image = [0u8, 1, 2, 3, 4, 5];
        let data = pcr0_data(0x0102).data(Some(&image)).unwrap(); //#[allow_ci]
        assert_eq!(
            data,
            vec![0x02, 0x01, 0, 0, 0, 0, 0, 0, 0xAA, 0xAA, 0xAA, 0xAA, 2, 3, 4]
        );
    }

    #[test]
    fn test_data_requires_image() {
        let err = pcr0_data(0).data(None).unwrap_err(); //#[allow_ci]
        assert!(matches!(err, Error::MissingFirmwareImage(name) if name == "PCR0_DATA"));
    }

    #[test]
    fn test_data_out_of_image() {
        let err = pcr0_data(0).data(Some(&[0u8; 4])).unwrap_err(); //#[allow_ci]
        assert!(matches!(err, Error::OutOfImage { .. }));
    }

    #[test]
    fn test_oversized_image_range() {
        let oversized = Measurement::new(
            "oversized",
            vec![
                DataChunk::Bytes(vec![1, 2]),
                DataChunk::Image {
                    offset: 0,
                    length: u64::MAX,
                },
            ],
        );
        assert!(matches!(
            oversized.data(None),
            Err(Error::MissingFirmwareImage(name)) if name == "oversized"
        ));
        assert!(matches!(
            oversized.digest(HashAlgorithm::Sha1, Some(&[0u8; 16])),
            Err(Error::OutOfImage { image_size: 16, .. })
        ));
        assert_eq!(oversized.lengths(), vec![2, usize::MAX, usize::MAX]);
    }

    #[test]
    fn test_status_register() {
        let register = pcr0_data(0x42).status_register().unwrap(); //#[allow_ci]
        assert_eq!(register.id, RegisterId::ACM_POLICY_STATUS);
        assert_eq!(register.value, 0x42);
        assert_eq!(register.offset, 0);

        let shifted = Measurement::new(
            "shifted",
            vec![
                DataChunk::Bytes(vec![1, 2, 3]),
                DataChunk::Register {
                    id: RegisterId::ACM_POLICY_STATUS,
                    value: 7,
                },
            ],
        );
        assert_eq!(shifted.status_register().map(|r| r.offset), Some(3));
    }

    #[test]
    fn test_status_register_rejects_other_layouts() {
        let unknown = Measurement::new(
            "unknown",
            vec![DataChunk::Register {
                id: RegisterId(0x1000),
                value: 0,
            }],
        );
        assert!(unknown.status_register().is_none());

        let two = Measurement::new(
            "two",
            vec![
                DataChunk::Register {
                    id: RegisterId::ACM_POLICY_STATUS,
                    value: 0,
                },
                DataChunk::Register {
                    id: RegisterId::ACM_POLICY_STATUS,
                    value: 1,
                },
            ],
        );
        assert!(two.status_register().is_none());

        let none = Measurement::new("none", vec![DataChunk::Bytes(vec![0])]);
        assert!(none.status_register().is_none());
    }

    #[test]
    fn test_with_register_value() {
        let original = pcr0_data(1);
        let updated =
            original.with_register_value(RegisterId::ACM_POLICY_STATUS, 2);
        assert_eq!(updated.status_register().map(|r| r.value), Some(2));
        assert_eq!(original.status_register().map(|r| r.value), Some(1));
    }

    #[test]
    fn test_lengths() {
        assert_eq!(pcr0_data(0).lengths(), vec![8, 4, 3, 15]);
    }
}
