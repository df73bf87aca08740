// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Keylime Authors

//! A minimal software TPM replaying boot measurements.
//!
//! The virtual TPM only models what measured boot needs: PCR banks for
//! every supported hash algorithm, `Init` with a locality, `Extend`, and
//! event log recording. It is deliberately small because search workers
//! replay candidate command sequences through it millions of times. Each
//! worker owns its own instance.

use crate::algorithms::HashAlgorithm;
use crate::digest::Digest;
use crate::event_log::{EventLogEntry, EventType};
use crate::measurement::Measurement;
use serde_derive::Serialize;
use std::sync::Arc;
use thiserror::Error;

pub type PcrIndex = u32;
pub type Locality = u8;

/// Number of PCRs of each bank.
pub const PCR_COUNT: PcrIndex = 24;

/// Highest locality a TPM can be started from.
pub const MAX_LOCALITY: Locality = 4;

#[derive(Error, Debug)]
pub enum TpmError {
    #[error("TPM is already initialized")]
    AlreadyInitialized,

    #[error("TPM is not initialized")]
    NotInitialized,

    #[error("PCR index {0} is out of range")]
    InvalidPcrIndex(PcrIndex),

    #[error("Invalid locality {0}")]
    InvalidLocality(Locality),

    #[error("Invalid {algorithm} digest length for PCR {pcr_index}: expected {expected} bytes, got {actual}")]
    DigestLength {
        pcr_index: PcrIndex,
        algorithm: HashAlgorithm,
        expected: usize,
        actual: usize,
    },

    #[error("Hashing error: {0}")]
    OpenSSL(#[from] openssl::error::ErrorStack),
}

/// A command sent to the TPM during boot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Init {
        locality: Locality,
    },
    Extend {
        pcr_index: PcrIndex,
        algorithm: HashAlgorithm,
        digest: Digest,
    },
    EventLogAdd {
        pcr_index: PcrIndex,
        algorithm: HashAlgorithm,
        event_type: EventType,
        digest: Digest,
        data: Vec<u8>,
    },
}

impl Command {
    /// Executes the command on `tpm`.
    pub fn apply(
        &self,
        tpm: &mut VirtualTpm,
        cause: Option<&Cause>,
    ) -> Result<(), TpmError> {
        match self {
            Command::Init { locality } => tpm.init(*locality, cause),
            Command::Extend {
                pcr_index,
                algorithm,
                digest,
            } => tpm.extend(*pcr_index, *algorithm, digest, cause),
            Command::EventLogAdd {
                pcr_index,
                algorithm,
                event_type,
                digest,
                data,
            } => {
                tpm.event_log_add(
                    *pcr_index,
                    *algorithm,
                    *event_type,
                    digest,
                    data,
                    cause,
                );
                Ok(())
            }
        }
    }

    /// Returns the PCR and bank the command refers to, if any.
    pub fn pcr(&self) -> Option<(PcrIndex, HashAlgorithm)> {
        match self {
            Command::Init { .. } => None,
            Command::Extend {
                pcr_index,
                algorithm,
                ..
            }
            | Command::EventLogAdd {
                pcr_index,
                algorithm,
                ..
            } => Some((*pcr_index, *algorithm)),
        }
    }
}

/// What caused a command: the boot flow action and, when the action
/// measured something, the measurement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cause {
    pub action: String,
    pub measurement: Option<Arc<Measurement>>,
}

impl Cause {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            measurement: None,
        }
    }

    pub fn with_measurement(mut self, measurement: Arc<Measurement>) -> Self {
        self.measurement = Some(measurement);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandLogEntry {
    pub command: Command,
    pub cause: Option<Cause>,
}

/// PCR values of all banks, `None` until `Init`.
#[derive(Clone, Debug)]
struct PcrBanks {
    // One contiguous buffer per algorithm, PCR i at i * digest_size.
    banks: Vec<(HashAlgorithm, Vec<u8>)>,
}

impl PcrBanks {
    fn new(locality: Locality) -> Self {
        let banks = HashAlgorithm::ALL
            .iter()
            .map(|&algorithm| {
                let size = algorithm.digest_size();
                let mut bank = vec![0u8; size * PCR_COUNT as usize];
                // The last byte of PCR 0 holds the startup locality.
                bank[size - 1] = locality;
                (algorithm, bank)
            })
            .collect();
        Self { banks }
    }

    /// Zeroes every bank and seeds PCR 0 with `locality` again.
    fn restart(&mut self, locality: Locality) {
        for (algorithm, bank) in &mut self.banks {
            bank.fill(0);
            bank[algorithm.digest_size() - 1] = locality;
        }
    }

    fn pcr_mut(
        &mut self,
        pcr_index: PcrIndex,
        algorithm: HashAlgorithm,
    ) -> Option<&mut [u8]> {
        let size = algorithm.digest_size();
        let start = pcr_index as usize * size;
        self.banks
            .iter_mut()
            .find(|(alg, _)| *alg == algorithm)
            .and_then(|(_, bank)| bank.get_mut(start..start + size))
    }

    fn pcr(&self, pcr_index: PcrIndex, algorithm: HashAlgorithm) -> Option<&[u8]> {
        let size = algorithm.digest_size();
        let start = pcr_index as usize * size;
        self.banks
            .iter()
            .find(|(alg, _)| *alg == algorithm)
            .and_then(|(_, bank)| bank.get(start..start + size))
    }
}

/// The virtual TPM state machine: uninitialized until `init`, back to
/// uninitialized only through `reset`.
#[derive(Clone, Debug)]
pub struct VirtualTpm {
    pcrs: Option<PcrBanks>,
    // Banks released by `reset`, reused by the next `init`.
    spare: Option<PcrBanks>,
    command_log: Vec<CommandLogEntry>,
    event_log: Vec<EventLogEntry>,
    log_commands: bool,
}

// Search workers move their own instance to their thread.
assert_impl_all!(VirtualTpm: Send, Clone);

impl Default for VirtualTpm {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualTpm {
    /// Creates an uninitialized TPM recording every command.
    pub fn new() -> Self {
        Self {
            pcrs: None,
            spare: None,
            command_log: Vec::new(),
            event_log: Vec::new(),
            log_commands: true,
        }
    }

    /// Creates an uninitialized TPM that keeps neither a command log nor an
    /// event log, for replays where only the PCR values matter.
    pub fn without_logs() -> Self {
        Self {
            log_commands: false,
            ..Self::new()
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.pcrs.is_some()
    }

    /// Drops all state, going back to uninitialized.
    pub fn reset(&mut self) {
        if let Some(pcrs) = self.pcrs.take() {
            self.spare = Some(pcrs);
        }
        self.command_log.clear();
        self.event_log.clear();
    }

    fn record(&mut self, command: Command, cause: Option<&Cause>) {
        if self.log_commands {
            self.command_log.push(CommandLogEntry {
                command,
                cause: cause.cloned(),
            });
        }
    }

    /// Starts the TPM from `locality`.
    pub fn init(
        &mut self,
        locality: Locality,
        cause: Option<&Cause>,
    ) -> Result<(), TpmError> {
        if self.pcrs.is_some() {
            return Err(TpmError::AlreadyInitialized);
        }
        if locality > MAX_LOCALITY {
            return Err(TpmError::InvalidLocality(locality));
        }
        let pcrs = match self.spare.take() {
            Some(mut pcrs) => {
                pcrs.restart(locality);
                pcrs
            }
            None => PcrBanks::new(locality),
        };
        self.pcrs = Some(pcrs);
        self.record(Command::Init { locality }, cause);
        Ok(())
    }

    /// Extends PCR `pcr_index` of the `algorithm` bank:
    /// `new = H(old || digest)`.
    pub fn extend(
        &mut self,
        pcr_index: PcrIndex,
        algorithm: HashAlgorithm,
        digest: &Digest,
        cause: Option<&Cause>,
    ) -> Result<(), TpmError> {
        let pcrs = self.pcrs.as_mut().ok_or(TpmError::NotInitialized)?;
        if pcr_index >= PCR_COUNT {
            return Err(TpmError::InvalidPcrIndex(pcr_index));
        }
        if digest.len() != algorithm.digest_size() {
            return Err(TpmError::DigestLength {
                pcr_index,
                algorithm,
                expected: algorithm.digest_size(),
                actual: digest.len(),
            });
        }
        let pcr = pcrs
            .pcr_mut(pcr_index, algorithm)
            .ok_or(TpmError::InvalidPcrIndex(pcr_index))?;
        let extended = algorithm.hash_parts(&[&*pcr, digest.value()])?;
        pcr.copy_from_slice(extended.value());

        if self.log_commands {
            self.record(
                Command::Extend {
                    pcr_index,
                    algorithm,
                    digest: digest.clone(),
                },
                cause,
            );
        }
        Ok(())
    }

    /// Records an event. PCR values are not modified.
    pub fn event_log_add(
        &mut self,
        pcr_index: PcrIndex,
        algorithm: HashAlgorithm,
        event_type: EventType,
        digest: &Digest,
        data: &[u8],
        cause: Option<&Cause>,
    ) {
        if !self.log_commands {
            return;
        }
        self.event_log.push(EventLogEntry {
            pcr_index,
            event_type,
            algorithm,
            digest: digest.clone(),
            data: Some(data.to_vec()),
        });
        self.record(
            Command::EventLogAdd {
                pcr_index,
                algorithm,
                event_type,
                digest: digest.clone(),
                data: data.to_vec(),
            },
            cause,
        );
    }

    /// Returns the value of a PCR, `None` before `init` or for an unknown
    /// PCR.
    pub fn pcr_value(
        &self,
        pcr_index: PcrIndex,
        algorithm: HashAlgorithm,
    ) -> Option<Digest> {
        self.pcrs
            .as_ref()
            .and_then(|pcrs| pcrs.pcr(pcr_index, algorithm))
            .map(Digest::from)
    }

    /// Compares a PCR value without copying it.
    pub fn pcr_equals(
        &self,
        pcr_index: PcrIndex,
        algorithm: HashAlgorithm,
        expected: &Digest,
    ) -> bool {
        self.pcrs
            .as_ref()
            .and_then(|pcrs| pcrs.pcr(pcr_index, algorithm))
            .is_some_and(|value| value == expected.value())
    }

    pub fn command_log(&self) -> &[CommandLogEntry] {
        &self.command_log
    }

    pub fn event_log(&self) -> &[EventLogEntry] {
        &self.event_log
    }

    /// Resets the TPM and executes `commands` in order. The sequence is
    /// expected to start with `Init`.
    pub fn replay(&mut self, commands: &[Command]) -> Result<(), TpmError> {
        self.reset();
        for command in commands {
            command.apply(self, None)?;
        }
        Ok(())
    }

    /// Like [`VirtualTpm::replay`], keeping the causes of the entries in the
    /// new command log.
    pub fn replay_log(
        &mut self,
        entries: &[CommandLogEntry],
    ) -> Result<(), TpmError> {
        self.reset();
        for entry in entries {
            entry.command.apply(self, entry.cause.as_ref())?;
        }
        Ok(())
    }
}

/// Returns the `Extend` entries of `log` for one PCR bank, in order.
pub fn extends_for(
    log: &[CommandLogEntry],
    pcr_index: PcrIndex,
    algorithm: HashAlgorithm,
) -> Vec<&CommandLogEntry> {
    log.iter()
        .filter(|entry| {
            matches!(entry.command, Command::Extend { .. })
                && entry.command.pcr() == Some((pcr_index, algorithm))
        })
        .collect()
}
