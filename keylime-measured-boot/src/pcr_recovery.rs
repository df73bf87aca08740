// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Keylime Authors

//! Search for the boot that produced an expected PCR value.
//!
//! The replayed extends of a PCR are tried from each candidate locality,
//! with an increasing number of measurements left out, until the final PCR
//! value is the expected one. When the first measurement kept is a status
//! register measurement, its register value is searched for as well.

use crate::algorithms::HashAlgorithm;
use crate::bruteforce::{apply_bitflips_bools, worker_count, BruteForcer};
use crate::cancel::CancelToken;
use crate::combination::Binomials;
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::register::{RegisterCorrection, RegisterRecovery, RegisterTarget};
use crate::settings::SearchSettings;
use crate::vtpm::{
    extends_for, Cause, Command, CommandLogEntry, Locality, PcrIndex,
    VirtualTpm,
};
use log::*;
use serde_derive::Serialize;
use std::{
    sync::{Arc, Mutex},
    thread,
};

/// An extend left out of the replay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DisabledMeasurement {
    /// Position of the extend among the extends of the PCR.
    pub index: usize,
    pub action: Option<String>,
    pub digest: Digest,
}

/// How the expected PCR value was reproduced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PcrRecoveryResult {
    pub locality: Locality,
    /// Set when the first replayed measurement holds a status register,
    /// with the value that reproduced the PCR.
    pub register: Option<RegisterCorrection>,
    pub disabled: Vec<DisabledMeasurement>,
}

struct Step<'a> {
    digest: &'a Digest,
    cause: Option<&'a Cause>,
    register: Option<RegisterTarget>,
}

struct LocalityState {
    tpm: VirtualTpm,
    accepted: Option<(Vec<bool>, RegisterCorrection)>,
}

struct PcrJob<'a> {
    steps: Vec<Step<'a>>,
    pcr_index: PcrIndex,
    algorithm: HashAlgorithm,
    expected: &'a Digest,
    settings: &'a SearchSettings,
    binomials: Arc<Binomials>,
    recovery: RegisterRecovery,
}

impl PcrJob<'_> {
    /// Replays the enabled steps from `first` on, after `tpm` was
    /// initialized.
    fn extend_from(
        &self,
        tpm: &mut VirtualTpm,
        disabled: &[bool],
        first: usize,
    ) -> Result<()> {
        for (step, _) in self
            .steps
            .iter()
            .zip(disabled)
            .skip(first)
            .filter(|(_, &d)| !d)
        {
            tpm.extend(self.pcr_index, self.algorithm, step.digest, None)?;
        }
        Ok(())
    }

    fn check(
        &self,
        locality: Locality,
        cancel: &CancelToken,
        state: &mut LocalityState,
        disabled: &[bool],
    ) -> Result<bool> {
        let first = disabled.iter().position(|&d| !d);
        let target = first
            .and_then(|first| self.steps[first].register.as_ref().map(|t| (first, t)));

        if let Some((first, target)) = target {
            // The nested recovery runs a single worker, the lock is not
            // contended.
            let scratch = Mutex::new(&mut state.tpm);
            let accept = |digest: &Digest| -> Result<bool> {
                let mut tpm = scratch.lock().map_err(|_| {
                    Error::Other("replay TPM lock poisoned".to_string())
                })?;
                tpm.reset();
                tpm.init(locality, None)?;
                tpm.extend(self.pcr_index, self.algorithm, digest, None)?;
                self.extend_from(&mut **tpm, disabled, first + 1)?;
                Ok(tpm.pcr_equals(self.pcr_index, self.algorithm, self.expected))
            };
            return match self.recovery.recover(target, &accept, cancel)? {
                Some(correction) => {
                    state.accepted = Some((disabled.to_vec(), correction));
                    Ok(true)
                }
                None => Ok(false),
            };
        }

        state.tpm.reset();
        state.tpm.init(locality, None)?;
        self.extend_from(&mut state.tpm, disabled, 0)?;
        Ok(state
            .tpm
            .pcr_equals(self.pcr_index, self.algorithm, self.expected))
    }

    fn search_locality(
        &self,
        locality: Locality,
        max_workers: usize,
        cancel: &CancelToken,
    ) -> Result<Option<PcrRecoveryResult>> {
        let count = self.steps.len();
        let max_disabled = self.settings.max_disabled_measurements.min(count);
        debug!(
            "Replaying {count} extends of PCR {} from locality {locality}, up to {max_disabled} disabled",
            self.pcr_index
        );

        let initial = vec![false; count];
        let outcome = BruteForcer::new(&self.binomials)
            .distance(0, max_disabled)
            .max_workers(max_workers)
            .combination_limit(self.settings.combination_limit)
            .cancel_token(cancel.clone())
            .run(
                &initial,
                1,
                || {
                    Ok(LocalityState {
                        tpm: VirtualTpm::without_logs(),
                        accepted: None,
                    })
                },
                |state, disabled: &[bool]| {
                    self.check(locality, cancel, state, disabled)
                },
                apply_bitflips_bools,
            )?;

        let Some(combination) = outcome.found else {
            return Ok(None);
        };
        let mut disabled = initial;
        apply_bitflips_bools(&mut disabled, &combination);

        let register = outcome
            .states
            .into_iter()
            .filter_map(|state| state.accepted)
            .find(|(mask, _)| *mask == disabled)
            .map(|(_, correction)| correction);

        let disabled = self
            .steps
            .iter()
            .zip(&disabled)
            .enumerate()
            .filter(|(_, (_, &d))| d)
            .map(|(index, (step, _))| DisabledMeasurement {
                index,
                action: step.cause.map(|c| c.action.clone()),
                digest: step.digest.clone(),
            })
            .collect();

        Ok(Some(PcrRecoveryResult {
            locality,
            register,
            disabled,
        }))
    }
}

/// Searches for a locality, a set of left out measurements and possibly a
/// status register value reproducing `expected` in PCR `pcr_index`.
///
/// Returns `Ok(None)` when no combination within the limits of `settings`
/// reproduces the value.
pub fn reproduce_expected_pcr(
    command_log: &[CommandLogEntry],
    pcr_index: PcrIndex,
    algorithm: HashAlgorithm,
    expected: &Digest,
    settings: &SearchSettings,
    image: Option<&[u8]>,
    cancel: &CancelToken,
) -> Result<Option<PcrRecoveryResult>> {
    settings.validate()?;
    expected.check_size(algorithm)?;

    let extends = extends_for(command_log, pcr_index, algorithm);
    let mut steps = Vec::with_capacity(extends.len());
    for (index, entry) in extends.into_iter().enumerate() {
        let Command::Extend { digest, .. } = &entry.command else {
            continue;
        };
        // Only the first replayed measurement can be a register
        // measurement, which is one of the first `max_disabled + 1`.
        let register = match entry.cause.as_ref().and_then(|c| c.measurement.as_ref())
        {
            Some(measurement)
                if index <= settings.max_disabled_measurements =>
            {
                RegisterTarget::from_measurement(measurement, algorithm, image)?
            }
            _ => None,
        };
        steps.push(Step {
            digest,
            cause: entry.cause.as_ref(),
            register,
        });
    }

    let binomials = Arc::new(Binomials::new());
    let job = PcrJob {
        steps,
        pcr_index,
        algorithm,
        expected,
        settings,
        recovery: RegisterRecovery::from_settings(settings, 1, binomials.clone()),
        binomials,
    };

    let localities = &settings.localities;
    let max_workers =
        (worker_count(settings.max_workers) / localities.len()).max(1);
    // Cancelled by the first locality to succeed.
    let siblings = cancel.child();
    let siblings = &siblings;
    let job = &job;

    let results: Vec<Result<Option<PcrRecoveryResult>>> = thread::scope(|scope| {
        let handles: Vec<_> = localities
            .iter()
            .map(|&locality| {
                scope.spawn(move || {
                    let result =
                        job.search_locality(locality, max_workers, siblings);
                    if matches!(result, Ok(Some(_))) {
                        siblings.cancel();
                    }
                    result
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle.join().unwrap_or_else(|_| {
                    Err(Error::Other("locality search panicked".to_string()))
                })
            })
            .collect()
    });

    let mut found = None;
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(Some(result)) => {
                if found.is_none() {
                    found = Some(result);
                }
            }
            Ok(None) => {}
            Err(e) => errors.push(e),
        }
    }

    if let Some(result) = found {
        info!(
            "Reproduced PCR {pcr_index} {algorithm} from locality {} with {} disabled measurement(s)",
            result.locality,
            result.disabled.len()
        );
        return Ok(Some(result));
    }
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    if let Some(error) = Error::from_workers(errors) {
        return Err(error);
    }
    debug!("No explanation found for PCR {pcr_index} {algorithm}");
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{DataChunk, Measurement, RegisterId};

    const ALG: HashAlgorithm = HashAlgorithm::Sha1;

    fn extend(name: &str) -> CommandLogEntry {
        CommandLogEntry {
            command: Command::Extend {
                pcr_index: 0,
                algorithm: ALG,
                digest: ALG.hash(name.as_bytes()).unwrap(), //#[allow_ci]
            },
            cause: Some(Cause::new(name)),
        }
    }

    fn status_measurement(value: u64) -> Measurement {
        Measurement::new(
            "PCR0_DATA",
            vec![
                DataChunk::Register {
                    id: RegisterId::ACM_POLICY_STATUS,
                    value,
                },
                DataChunk::Bytes(b"BootGuard policy".to_vec()),
            ],
        )
    }

    fn status_extend(value: u64) -> CommandLogEntry {
        let measurement = status_measurement(value);
        CommandLogEntry {
            command: Command::Extend {
                pcr_index: 0,
                algorithm: ALG,
                digest: measurement.digest(ALG, None).unwrap(), //#[allow_ci]
            },
            cause: Some(
                Cause::new("measure PCR0_DATA")
                    .with_measurement(Arc::new(measurement)),
            ),
        }
    }

    /// PCR value of a boot from `locality` extending `log` in order.
    fn pcr(locality: Locality, log: &[CommandLogEntry]) -> Digest {
        let mut tpm = VirtualTpm::without_logs();
        tpm.init(locality, None).unwrap(); //#[allow_ci]
        for entry in log {
            entry.command.apply(&mut tpm, None).unwrap(); //#[allow_ci]
        }
        tpm.pcr_value(0, ALG).unwrap() //#[allow_ci]
    }

    fn settings() -> SearchSettings {
        SearchSettings {
            max_workers: 2,
            max_register_distance: 64,
            ..Default::default()
        }
    }

    fn reproduce(
        log: &[CommandLogEntry],
        expected: &Digest,
    ) -> Option<PcrRecoveryResult> {
        reproduce_expected_pcr(
            log,
            0,
            ALG,
            expected,
            &settings(),
            None,
            &CancelToken::new(),
        )
        .unwrap() //#[allow_ci]
    }

    #[test]
    fn test_exact_replay() {
        let log = vec![extend("a"), extend("b"), extend("c")];
        let result = reproduce(&log, &pcr(3, &log)).unwrap(); //#[allow_ci]
        assert_eq!(result.locality, 3);
        assert!(result.disabled.is_empty());
        assert!(result.register.is_none());
    }

    #[test]
    fn test_disabled_measurement() {
        let log = vec![extend("a"), extend("b"), extend("c"), extend("d")];
        let booted = vec![log[0].clone(), log[2].clone(), log[3].clone()];
        let result = reproduce(&log, &pcr(0, &booted)).unwrap(); //#[allow_ci]
        assert_eq!(result.locality, 0);
        assert_eq!(result.disabled.len(), 1);
        assert_eq!(result.disabled[0].index, 1);
        assert_eq!(result.disabled[0].action.as_deref(), Some("b"));
    }

    #[test]
    fn test_other_pcrs_are_ignored() {
        let mut log = vec![extend("a"), extend("b")];
        let expected = pcr(0, &log);
        log.insert(
            1,
            CommandLogEntry {
                command: Command::Extend {
                    pcr_index: 1,
                    algorithm: ALG,
                    digest: ALG.hash(b"other").unwrap(), //#[allow_ci]
                },
                cause: None,
            },
        );
        let result = reproduce(&log, &expected).unwrap(); //#[allow_ci]
        assert!(result.disabled.is_empty());
    }

    #[test]
    fn test_register_is_recovered() {
        let real = 0x0000_0001_0000_0040;
        for measured in [real + 1, real + 28] {
            let log = vec![status_extend(measured), extend("a"), extend("b")];
            let booted = vec![status_extend(real), extend("a"), extend("b")];
            let result = reproduce(&log, &pcr(3, &booted)).unwrap(); //#[allow_ci]
            assert_eq!(result.locality, 3);
            assert!(result.disabled.is_empty());
            let register = result.register.unwrap(); //#[allow_ci]
            assert_eq!(register.original, measured);
            assert_eq!(register.corrected, real);
            assert!(register.is_corrected());
        }
    }

    #[test]
    fn test_register_bitflip_is_recovered() {
        let measured = 0x0000_0001_0000_0040;
        let real = measured ^ (1 << 44);
        let log = vec![status_extend(measured), extend("a")];
        let booted = vec![status_extend(real), extend("a")];
        let settings = SearchSettings {
            enable_combinatorial_register: true,
            max_register_bitflips: 1,
            ..settings()
        };
        let result = reproduce_expected_pcr(
            &log,
            0,
            ALG,
            &pcr(3, &booted),
            &settings,
            None,
            &CancelToken::new(),
        )
        .unwrap() //#[allow_ci]
        .unwrap(); //#[allow_ci]
        assert_eq!(result.locality, 3);
        assert!(result.disabled.is_empty());
        assert_eq!(result.register.map(|r| r.corrected), Some(real));
    }

    #[test]
    fn test_unreachable_value() {
        let log = vec![status_extend(5), extend("a"), extend("b")];
        let expected = ALG.hash(b"unreachable").unwrap(); //#[allow_ci]
        assert!(reproduce(&log, &expected).is_none());
    }

    #[test]
    fn test_digest_length_is_checked() {
        let log = vec![extend("a")];
        let result = reproduce_expected_pcr(
            &log,
            0,
            ALG,
            &Digest::from(vec![0u8; 32]),
            &settings(),
            None,
            &CancelToken::new(),
        );
        assert!(matches!(result, Err(Error::DigestLength { .. })));
    }

    #[test]
    fn test_cancelled() {
        let log = vec![extend("a")];
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = reproduce_expected_pcr(
            &log,
            0,
            ALG,
            &pcr(0, &log),
            &settings(),
            None,
            &cancel,
        );
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
