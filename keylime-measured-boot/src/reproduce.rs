// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Keylime Authors

//! Reproduction of a captured event log from a boot flow replay.
//!
//! The calculated events are aligned with the captured ones, then a single
//! corrupted status register is looked for among the differences, and the
//! remaining differences are reported as issues. Unexplained digests are
//! optionally searched for in the firmware image; that search is advisory
//! and its failures are only logged.

use crate::algorithms::HashAlgorithm;
use crate::alignment::{
    AlignedEntry, Alignment, AlignmentKind, CalculatedEntry, EventLogAligner,
};
use crate::cancel::CancelToken;
use crate::combination::Binomials;
use crate::digest::Digest;
use crate::digest_source::{DigestSource, DigestSourceFinder};
use crate::error::Result;
use crate::event_log::{EventLogEntry, EventType};
use crate::register::{RegisterCorrection, RegisterRecovery, RegisterTarget};
use crate::settings::SearchSettings;
use log::*;
use serde_derive::Serialize;
use std::{fmt, sync::Arc};

/// A discrepancy between the calculated and the captured event logs.
///
/// `index` is the position of the entry in the alignment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum Issue {
    DigestMismatch {
        index: usize,
        event_type: EventType,
        calculated: Digest,
        expected: Digest,
        action: Option<String>,
    },
    EventTypeMismatch {
        index: usize,
        calculated: EventType,
        expected: EventType,
    },
    UnexpectedEntry {
        index: usize,
        event_type: EventType,
        digest: Digest,
    },
    MissingEntry {
        index: usize,
        event_type: EventType,
        digest: Digest,
        action: Option<String>,
    },
    CorruptedRegister {
        index: usize,
        correction: RegisterCorrection,
    },
    DigestSource {
        index: usize,
        digest: Digest,
        source: DigestSource,
    },
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Issue::DigestMismatch {
                index,
                event_type,
                calculated,
                expected,
                action,
            } => {
                write!(
                    f,
                    "Event {index} ({event_type}): calculated digest {calculated} differs from logged digest {expected}"
                )?;
                if let Some(action) = action {
                    write!(f, " (measured by {action})")?;
                }
                Ok(())
            }
            Issue::EventTypeMismatch {
                index,
                calculated,
                expected,
            } => write!(
                f,
                "Event {index}: calculated type {calculated} differs from logged type {expected}"
            ),
            Issue::UnexpectedEntry {
                index,
                event_type,
                digest,
            } => write!(
                f,
                "Event {index} ({event_type}, {digest}) is logged but was not calculated"
            ),
            Issue::MissingEntry {
                index,
                event_type,
                digest,
                action,
            } => {
                write!(
                    f,
                    "Event {index} ({event_type}, {digest}) was calculated but is not logged"
                )?;
                if let Some(action) = action {
                    write!(f, " (measured by {action})")?;
                }
                Ok(())
            }
            Issue::CorruptedRegister { index, correction } => {
                write!(f, "Event {index}: {correction}")
            }
            Issue::DigestSource {
                index,
                digest,
                source,
            } => write!(f, "Event {index}: {digest} is the hash of {source}"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReproduceEventLogResult {
    pub alignment: Alignment,
    /// The status register value that had to be corrected, at most one.
    pub corrected_register: Option<RegisterCorrection>,
    pub issues: Vec<Issue>,
    /// Every entry matches once the register correction is applied.
    pub succeeded: bool,
}

/// Reproduces captured event logs from calculated ones.
#[derive(Debug)]
pub struct EventLogReproducer<'a> {
    settings: &'a SearchSettings,
    image: Option<&'a [u8]>,
    binomials: Arc<Binomials>,
    cancel: CancelToken,
}

impl<'a> EventLogReproducer<'a> {
    pub fn new(settings: &'a SearchSettings) -> Self {
        Self {
            settings,
            image: None,
            binomials: Arc::new(Binomials::new()),
            cancel: CancelToken::new(),
        }
    }

    /// Sets the firmware image the measurements were taken from.
    pub fn image(mut self, image: &'a [u8]) -> Self {
        self.image = Some(image);
        self
    }

    /// Shares a binomial table with other searches.
    pub fn binomials(mut self, binomials: Arc<Binomials>) -> Self {
        self.binomials = binomials;
        self
    }

    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn reproduce(
        &self,
        calculated: &[CalculatedEntry],
        expected: &[EventLogEntry],
        algorithm: HashAlgorithm,
    ) -> Result<ReproduceEventLogResult> {
        self.settings.validate()?;

        let mut alignment = EventLogAligner::new(self.settings, &self.binomials)
            .cancel_token(self.cancel.clone())
            .align(calculated, expected, algorithm)?;

        let correction = if alignment.is_perfect() {
            None
        } else {
            self.correct_register(&mut alignment, algorithm)?
        };

        let mut issues = Vec::new();
        if let Some((index, correction)) = correction {
            issues.push(Issue::CorruptedRegister { index, correction });
        }
        issues.extend(Self::differences(&alignment));
        if self.settings.digest_source_search {
            if let Some(image) = self.image {
                issues.extend(self.locate_digests(
                    &alignment, calculated, expected, algorithm, image,
                ));
            }
        }

        let succeeded = alignment.is_perfect();
        if succeeded {
            info!(
                "Reproduced {} {algorithm} events",
                alignment.entries.len()
            );
        } else {
            info!(
                "Event log reproduction found {} issue(s) in {} {algorithm} events",
                issues.len(),
                alignment.entries.len()
            );
        }

        Ok(ReproduceEventLogResult {
            alignment,
            corrected_register: correction.map(|(_, correction)| correction),
            issues,
            succeeded,
        })
    }

    fn register_target(
        &self,
        entry: &CalculatedEntry,
        algorithm: HashAlgorithm,
    ) -> Result<Option<RegisterTarget>> {
        match entry.measurement() {
            Some(measurement) => {
                RegisterTarget::from_measurement(measurement, algorithm, self.image)
            }
            None => Ok(None),
        }
    }

    /// Looks for a status register value explaining one difference of the
    /// alignment. On success the alignment is updated and the position of
    /// the corrected entry returned.
    fn correct_register(
        &self,
        alignment: &mut Alignment,
        algorithm: HashAlgorithm,
    ) -> Result<Option<(usize, RegisterCorrection)>> {
        let recovery = RegisterRecovery::from_settings(
            self.settings,
            self.settings.max_workers,
            self.binomials.clone(),
        );

        for index in 0..alignment.entries.len() {
            let entry = &alignment.entries[index];
            match (entry.kind, &entry.calculated, &entry.expected) {
                (AlignmentKind::Mismatch, Some(calculated), Some(expected))
                    if calculated.digest != expected.digest =>
                {
                    let (mut corrected, expected) =
                        (calculated.clone(), expected.clone());
                    let Some(target) =
                        self.register_target(&corrected, algorithm)?
                    else {
                        continue;
                    };
                    let wanted = &expected.digest;
                    let Some(correction) = recovery.recover(
                        &target,
                        &|d| Ok(d == wanted),
                        &self.cancel,
                    )?
                    else {
                        continue;
                    };
                    corrected.digest = expected.digest.clone();
                    alignment.entries[index] =
                        AlignedEntry::pair(&corrected, &expected);
                    alignment.refresh_distance();
                    return Ok(Some((index, correction)));
                }
                (AlignmentKind::Unexpected, _, Some(expected)) => {
                    let expected = expected.clone();
                    if let Some(merged) = self.merge_missing(
                        alignment, index, expected, algorithm, &recovery,
                    )? {
                        return Ok(Some(merged));
                    }
                }
                _ => {}
            }
        }
        Ok(None)
    }

    /// Tries to explain the unexpected entry at `index` as one of the
    /// missing entries, closest first, measured with a corrupted register.
    fn merge_missing(
        &self,
        alignment: &mut Alignment,
        index: usize,
        expected: EventLogEntry,
        algorithm: HashAlgorithm,
        recovery: &RegisterRecovery,
    ) -> Result<Option<(usize, RegisterCorrection)>> {
        let mut missing: Vec<usize> = alignment
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.kind == AlignmentKind::Missing)
            .map(|(i, _)| i)
            .collect();
        missing.sort_by_key(|&i| i.abs_diff(index));

        for position in missing {
            let Some(calculated) = alignment.entries[position].calculated.clone()
            else {
                continue;
            };
            let Some(target) = self.register_target(&calculated, algorithm)?
            else {
                continue;
            };
            let wanted = &expected.digest;
            let Some(correction) =
                recovery.recover(&target, &|d| Ok(d == wanted), &self.cancel)?
            else {
                continue;
            };

            let mut corrected = calculated;
            corrected.digest = expected.digest.clone();
            alignment.entries[position] = AlignedEntry::pair(&corrected, &expected);
            let _ = alignment.entries.remove(index);
            alignment.refresh_distance();
            let merged = if position > index {
                position - 1
            } else {
                position
            };
            return Ok(Some((merged, correction)));
        }
        Ok(None)
    }

    fn differences(alignment: &Alignment) -> Vec<Issue> {
        alignment
            .entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| {
                match (entry.kind, &entry.calculated, &entry.expected) {
                    (AlignmentKind::Mismatch, Some(c), Some(e))
                        if c.digest != e.digest =>
                    {
                        Some(Issue::DigestMismatch {
                            index,
                            event_type: e.event_type,
                            calculated: c.digest.clone(),
                            expected: e.digest.clone(),
                            action: c.action().map(str::to_string),
                        })
                    }
                    (AlignmentKind::Mismatch, Some(c), Some(e)) => {
                        Some(Issue::EventTypeMismatch {
                            index,
                            calculated: c.event_type,
                            expected: e.event_type,
                        })
                    }
                    (AlignmentKind::Unexpected, _, Some(e)) => {
                        Some(Issue::UnexpectedEntry {
                            index,
                            event_type: e.event_type,
                            digest: e.digest.clone(),
                        })
                    }
                    (AlignmentKind::Missing, Some(c), _) => {
                        Some(Issue::MissingEntry {
                            index,
                            event_type: c.event_type,
                            digest: c.digest.clone(),
                            action: c.action().map(str::to_string),
                        })
                    }
                    _ => None,
                }
            })
            .collect()
    }

    /// Searches the firmware image for the data behind the captured digests
    /// that were not calculated.
    fn locate_digests(
        &self,
        alignment: &Alignment,
        calculated: &[CalculatedEntry],
        expected: &[EventLogEntry],
        algorithm: HashAlgorithm,
        image: &[u8],
    ) -> Vec<Issue> {
        let lengths = calculated
            .iter()
            .filter_map(CalculatedEntry::measurement)
            .flat_map(|m| m.lengths())
            .chain(
                expected
                    .iter()
                    .filter_map(|e| e.data.as_ref().map(Vec::len)),
            );
        let finder =
            DigestSourceFinder::new(image, algorithm, self.settings.digest_source_alignment)
                .lengths(lengths)
                .cancel_token(self.cancel.clone());

        let mut issues = Vec::new();
        for (index, entry) in alignment.entries.iter().enumerate() {
            let unexplained = match (entry.kind, &entry.calculated, &entry.expected) {
                (AlignmentKind::Mismatch, Some(c), Some(e)) if c.digest != e.digest => {
                    &e.digest
                }
                (AlignmentKind::Unexpected, _, Some(e)) => &e.digest,
                _ => continue,
            };
            match finder.find(unexplained) {
                Ok(Some(source)) => issues.push(Issue::DigestSource {
                    index,
                    digest: unexplained.clone(),
                    source,
                }),
                Ok(None) => {
                    debug!("No firmware image data hashes to {unexplained}")
                }
                Err(e) => {
                    warn!("Digest source search for event {index} failed: {e}");
                    if e.is_cancellation() {
                        break;
                    }
                }
            }
        }
        issues
    }
}

/// Aligns `calculated` with `expected`, corrects at most one status
/// register and reports the remaining differences. See
/// [`EventLogReproducer`].
pub fn reproduce_event_log(
    calculated: &[CalculatedEntry],
    expected: &[EventLogEntry],
    algorithm: HashAlgorithm,
    settings: &SearchSettings,
    image: Option<&[u8]>,
    cancel: &CancelToken,
) -> Result<ReproduceEventLogResult> {
    let mut reproducer =
        EventLogReproducer::new(settings).cancel_token(cancel.clone());
    if let Some(image) = image {
        reproducer = reproducer.image(image);
    }
    reproducer.reproduce(calculated, expected, algorithm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{DataChunk, Measurement, RegisterId};
    use crate::vtpm::Cause;

    const ALG: HashAlgorithm = HashAlgorithm::Sha256;

    fn digest(data: &[u8]) -> Digest {
        ALG.hash(data).unwrap() //#[allow_ci]
    }

    fn calc(name: &str) -> CalculatedEntry {
        CalculatedEntry {
            event_type: EventType::POST_CODE,
            digest: digest(name.as_bytes()),
            data: name.as_bytes().to_vec(),
            cause: Some(Cause::new(name)),
        }
    }

    fn logged(digest: Digest) -> EventLogEntry {
        EventLogEntry {
            pcr_index: 0,
            event_type: EventType::POST_CODE,
            algorithm: ALG,
            digest,
            data: None,
        }
    }

    fn status_measurement(value: u64) -> Measurement {
        Measurement::new(
            "ACM policy status",
            vec![
                DataChunk::Register {
                    id: RegisterId::ACM_POLICY_STATUS,
                    value,
                },
                DataChunk::Bytes(vec![0x5a; 12]),
            ],
        )
    }

    fn status_entry(value: u64) -> CalculatedEntry {
        let measurement = status_measurement(value);
        CalculatedEntry {
            event_type: EventType::S_CRTM_CONTENTS,
            digest: measurement.digest(ALG, None).unwrap(), //#[allow_ci]
            data: vec![],
            cause: Some(
                Cause::new("measure policy status")
                    .with_measurement(Arc::new(measurement)),
            ),
        }
    }

    fn status_logged(value: u64) -> EventLogEntry {
        EventLogEntry {
            event_type: EventType::S_CRTM_CONTENTS,
            ..logged(status_measurement(value).digest(ALG, None).unwrap()) //#[allow_ci]
        }
    }

    fn settings() -> SearchSettings {
        SearchSettings {
            max_workers: 2,
            max_register_distance: 64,
            ..Default::default()
        }
    }

    #[test]
    fn test_identical_logs_succeed() {
        let calculated = vec![calc("a"), calc("b")];
        let expected = vec![logged(digest(b"a")), logged(digest(b"b"))];
        let result = reproduce_event_log(
            &calculated,
            &expected,
            ALG,
            &settings(),
            None,
            &CancelToken::new(),
        )
        .unwrap(); //#[allow_ci]
        assert!(result.succeeded);
        assert!(result.issues.is_empty());
        assert!(result.corrected_register.is_none());
    }

    #[test]
    fn test_mismatched_register_is_corrected() {
        let measured = 0x8000_0000_0000_1234;
        let calculated = vec![status_entry(measured), calc("a")];
        let expected = vec![status_logged(measured - 28), logged(digest(b"a"))];
        let result = reproduce_event_log(
            &calculated,
            &expected,
            ALG,
            &settings(),
            None,
            &CancelToken::new(),
        )
        .unwrap(); //#[allow_ci]
        assert!(result.succeeded);
        let correction = result.corrected_register.unwrap(); //#[allow_ci]
        assert_eq!(correction.original, measured);
        assert_eq!(correction.corrected, measured - 28);
        assert_eq!(result.alignment.distance, 0);
        assert_eq!(
            result.issues,
            vec![Issue::CorruptedRegister {
                index: 0,
                correction
            }]
        );
    }

    #[test]
    fn test_unexpected_entry_is_merged() {
        let measured = 0x10;
        let calculated = vec![calc("a"), status_entry(measured), calc("b")];
        let expected = vec![
            logged(digest(b"a")),
            logged(digest(b"b")),
            status_logged(measured + 3),
        ];
        let result = reproduce_event_log(
            &calculated,
            &expected,
            ALG,
            &settings(),
            None,
            &CancelToken::new(),
        )
        .unwrap(); //#[allow_ci]
        let correction = result.corrected_register.unwrap(); //#[allow_ci]
        assert_eq!(correction.corrected, measured + 3);
        // The status event was logged last, it is matched there.
        assert!(result.succeeded);
        assert_eq!(result.alignment.entries.len(), 3);
        assert_eq!(
            result.alignment.entries[1]
                .calculated
                .as_ref()
                .map(|c| c.event_type),
            Some(EventType::S_CRTM_CONTENTS)
        );
        assert_eq!(
            result.issues,
            vec![Issue::CorruptedRegister {
                index: 1,
                correction
            }]
        );
    }

    #[test]
    fn test_unexplained_differences_are_issues() {
        let calculated = vec![calc("a"), calc("b"), calc("c")];
        let expected = vec![
            logged(digest(b"a")),
            logged(digest(b"x")),
            logged(digest(b"c")),
            logged(digest(b"d")),
        ];
        let result = reproduce_event_log(
            &calculated,
            &expected,
            ALG,
            &settings(),
            None,
            &CancelToken::new(),
        )
        .unwrap(); //#[allow_ci]
        assert!(!result.succeeded);
        assert!(result.corrected_register.is_none());
        assert_eq!(result.issues.len(), 2);
        assert!(matches!(
            &result.issues[0],
            Issue::DigestMismatch { index: 1, action: Some(action), .. } if action == "b"
        ));
        assert!(matches!(result.issues[1], Issue::UnexpectedEntry { index: 3, .. }));
    }

    #[test]
    fn test_missing_entry_is_reported() {
        let calculated = vec![calc("a"), calc("b"), calc("c")];
        let expected = vec![logged(digest(b"a")), logged(digest(b"c"))];
        let result = reproduce_event_log(
            &calculated,
            &expected,
            ALG,
            &settings(),
            None,
            &CancelToken::new(),
        )
        .unwrap(); //#[allow_ci]
        assert!(!result.succeeded);
        assert!(result.corrected_register.is_none());
        assert_eq!(result.alignment.count(AlignmentKind::Missing), 1);
        assert_eq!(
            result.issues,
            vec![Issue::MissingEntry {
                index: 1,
                event_type: EventType::POST_CODE,
                digest: digest(b"b"),
                action: Some("b".to_string()),
            }]
        );
    }

    #[test]
    fn test_register_bitflip_is_corrected() {
        let measured = 0x0000_0000_8000_01a4;
        let flipped = measured ^ (1 << 50);
        let calculated = vec![status_entry(measured), calc("a")];
        let expected = vec![status_logged(flipped), logged(digest(b"a"))];
        let settings = SearchSettings {
            enable_combinatorial_register: true,
            max_register_bitflips: 2,
            ..settings()
        };

        // Out of reach of the linear search alone.
        let linear_only = reproduce_event_log(
            &calculated,
            &expected,
            ALG,
            &SearchSettings {
                enable_combinatorial_register: false,
                ..settings.clone()
            },
            None,
            &CancelToken::new(),
        )
        .unwrap(); //#[allow_ci]
        assert!(!linear_only.succeeded);

        let result = reproduce_event_log(
            &calculated,
            &expected,
            ALG,
            &settings,
            None,
            &CancelToken::new(),
        )
        .unwrap(); //#[allow_ci]
        assert!(result.succeeded);
        let correction = result.corrected_register.unwrap(); //#[allow_ci]
        assert_eq!(correction.original, measured);
        assert_eq!(correction.corrected, flipped);
    }

    #[test]
    fn test_digest_sources_are_located() {
        let image: Vec<u8> = (0..=255u8).cycle().take(512).collect();
        let calculated = vec![calc("a")];
        let expected = vec![logged(digest(&image[32..32 + 32]))];
        let result = reproduce_event_log(
            &calculated,
            &expected,
            ALG,
            &settings(),
            Some(&image),
            &CancelToken::new(),
        )
        .unwrap(); //#[allow_ci]
        assert!(!result.succeeded);
        assert!(result.issues.iter().any(|issue| matches!(
            issue,
            Issue::DigestSource { index: 0, source, .. } if source.offset == 32
        )));
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let settings = SearchSettings {
            localities: vec![],
            ..Default::default()
        };
        let result = reproduce_event_log(
            &[],
            &[],
            ALG,
            &settings,
            None,
            &CancelToken::new(),
        );
        assert!(matches!(result, Err(crate::error::Error::Settings(_))));
    }

    #[test]
    fn test_issue_serialization() {
        let issue = Issue::UnexpectedEntry {
            index: 1,
            event_type: EventType::SEPARATOR,
            digest: Digest::from(vec![0xab, 0xcd]),
        };
        let value = serde_json::to_value(&issue).unwrap(); //#[allow_ci]
        assert_eq!(
            value,
            serde_json::json!({
                "issue": "unexpected_entry",
                "index": 1,
                "event_type": 4,
                "digest": [0xab, 0xcd],
            })
        );
    }

    #[test]
    fn test_issue_display() {
        let issue = Issue::EventTypeMismatch {
            index: 2,
            calculated: EventType::POST_CODE,
            expected: EventType::SEPARATOR,
        };
        assert_eq!(
            issue.to_string(),
            "Event 2: calculated type EV_POST_CODE differs from logged type EV_SEPARATOR"
        );
    }
}
