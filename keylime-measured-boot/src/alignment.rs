// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Keylime Authors

//! Alignment of a calculated event log with a captured one.
//!
//! Both logs are sequences of (event type, digest) entries for one PCR and
//! one hash algorithm. Entries can be disabled on either side: a disabled
//! calculated entry was expected but never logged, a disabled captured entry
//! was logged without a known cause. The alignment is the choice of disabled
//! entries minimizing the distance between the remaining entries, compared
//! position by position.
//!
//! Distance weights, with `N = 2^32`:
//!
//! * disabled entry: `N`
//! * digest mismatch: `2N - 1`
//! * event type mismatch with equal digests: `2`
//!
//! A digest mismatch is slightly cheaper than disabling the two entries
//! involved, so entries are only disabled when that removes more than one
//! mismatch. Logs are limited to [`MAX_ALIGNED_ENTRIES`] entries per side,
//! which keeps the worst distance below `2^54`.

use crate::algorithms::HashAlgorithm;
use crate::bruteforce::{apply_bitflips_bools, BruteForcer};
use crate::cancel::CancelToken;
use crate::combination::Binomials;
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::event_log::{EventLogEntry, EventType};
use crate::measurement::Measurement;
use crate::settings::SearchSettings;
use crate::vtpm::{Cause, Command, CommandLogEntry, PcrIndex};
use log::*;
use serde_derive::Serialize;
use std::sync::Arc;

pub const SENTINEL: u64 = 1 << 32;
pub const DISABLED_COST: u64 = SENTINEL;
pub const DIGEST_MISMATCH_COST: u64 = 2 * SENTINEL - 1;
pub const TYPE_MISMATCH_COST: u64 = 2;

/// Maximum number of entries of each aligned log.
pub const MAX_ALIGNED_ENTRIES: usize = 1 << 20;

/// An event recorded by a boot flow replay, with the action that caused it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CalculatedEntry {
    pub event_type: EventType,
    pub digest: Digest,
    pub data: Vec<u8>,
    pub cause: Option<Cause>,
}

impl CalculatedEntry {
    /// The measurement behind the event, if the cause carries one.
    pub fn measurement(&self) -> Option<&Arc<Measurement>> {
        self.cause.as_ref().and_then(|c| c.measurement.as_ref())
    }

    pub fn action(&self) -> Option<&str> {
        self.cause.as_ref().map(|c| c.action.as_str())
    }
}

/// Extracts the events recorded for one PCR bank from a replay command
/// log.
pub fn calculated_entries(
    log: &[CommandLogEntry],
    pcr_index: PcrIndex,
    algorithm: HashAlgorithm,
) -> Vec<CalculatedEntry> {
    log.iter()
        .filter_map(|entry| match &entry.command {
            Command::EventLogAdd {
                pcr_index: index,
                algorithm: alg,
                event_type,
                digest,
                data,
            } if *index == pcr_index && *alg == algorithm => {
                Some(CalculatedEntry {
                    event_type: *event_type,
                    digest: digest.clone(),
                    data: data.clone(),
                    cause: entry.cause.clone(),
                })
            }
            _ => None,
        })
        .collect()
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentKind {
    /// Same digest and event type on both sides.
    Match,
    /// Both sides have an entry at this position, but they differ.
    Mismatch,
    /// Entry of the captured log without calculated counterpart.
    Unexpected,
    /// Calculated entry absent from the captured log.
    Missing,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlignedEntry {
    pub kind: AlignmentKind,
    pub calculated: Option<CalculatedEntry>,
    pub expected: Option<EventLogEntry>,
}

impl AlignedEntry {
    pub(crate) fn pair(calculated: &CalculatedEntry, expected: &EventLogEntry) -> Self {
        let kind = if calculated.digest == expected.digest
            && calculated.event_type == expected.event_type
        {
            AlignmentKind::Match
        } else {
            AlignmentKind::Mismatch
        };
        Self {
            kind,
            calculated: Some(calculated.clone()),
            expected: Some(expected.clone()),
        }
    }

    /// Contribution of the entry to the alignment distance.
    pub fn cost(&self) -> u64 {
        match (self.kind, &self.calculated, &self.expected) {
            (AlignmentKind::Match, _, _) => 0,
            (AlignmentKind::Unexpected | AlignmentKind::Missing, _, _) => {
                DISABLED_COST
            }
            (AlignmentKind::Mismatch, Some(c), Some(e)) if c.digest == e.digest => {
                TYPE_MISMATCH_COST
            }
            (AlignmentKind::Mismatch, _, _) => DIGEST_MISMATCH_COST,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Alignment {
    pub entries: Vec<AlignedEntry>,
    pub distance: u64,
}

impl Alignment {
    /// Returns whether every entry is a match.
    pub fn is_perfect(&self) -> bool {
        self.entries
            .iter()
            .all(|entry| entry.kind == AlignmentKind::Match)
    }

    pub fn count(&self, kind: AlignmentKind) -> usize {
        self.entries.iter().filter(|e| e.kind == kind).count()
    }

    /// Recomputes the distance after entries were modified.
    pub(crate) fn refresh_distance(&mut self) {
        self.distance = self.entries.iter().map(AlignedEntry::cost).sum();
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Score {
    distance: u64,
    /// Number of enabled pairs that differ.
    mismatches: usize,
    digest_mismatches: usize,
}

/// Scores a choice of disabled entries, `None` when the numbers of enabled
/// entries differ.
fn score(
    calculated: &[CalculatedEntry],
    expected: &[EventLogEntry],
    calculated_disabled: &[bool],
    expected_disabled: &[bool],
) -> Option<Score> {
    let calculated_off = calculated_disabled.iter().filter(|&&d| d).count();
    let expected_off = expected_disabled.iter().filter(|&&d| d).count();
    if calculated.len() - calculated_off != expected.len() - expected_off {
        return None;
    }

    let mut result = Score {
        distance: (calculated_off + expected_off) as u64 * DISABLED_COST,
        mismatches: 0,
        digest_mismatches: 0,
    };
    let enabled_calculated = calculated
        .iter()
        .zip(calculated_disabled)
        .filter(|(_, &d)| !d)
        .map(|(entry, _)| entry);
    let enabled_expected = expected
        .iter()
        .zip(expected_disabled)
        .filter(|(_, &d)| !d)
        .map(|(entry, _)| entry);
    for (c, e) in enabled_calculated.zip(enabled_expected) {
        if c.digest != e.digest {
            result.distance += DIGEST_MISMATCH_COST;
            result.mismatches += 1;
            result.digest_mismatches += 1;
        } else if c.event_type != e.event_type {
            result.distance += TYPE_MISMATCH_COST;
            result.mismatches += 1;
        }
    }
    Some(result)
}

/// Best choice of disabled entries seen by a search worker.
#[derive(Clone, Debug)]
struct Candidate {
    score: Score,
    calculated_disabled: Vec<bool>,
    expected_disabled: Vec<bool>,
}

impl Candidate {
    fn keep_best(best: &mut Option<Candidate>, candidate: Candidate) {
        if best
            .as_ref()
            .map_or(true, |b| candidate.score.distance < b.score.distance)
        {
            *best = Some(candidate);
        }
    }
}

/// Finds the alignment of two logs with the smallest distance.
#[derive(Debug)]
pub struct EventLogAligner<'a> {
    settings: &'a SearchSettings,
    binomials: &'a Binomials,
    cancel: CancelToken,
}

impl<'a> EventLogAligner<'a> {
    pub fn new(settings: &'a SearchSettings, binomials: &'a Binomials) -> Self {
        Self {
            settings,
            binomials,
            cancel: CancelToken::new(),
        }
    }

    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn check_input(
        calculated: &[CalculatedEntry],
        expected: &[EventLogEntry],
        algorithm: HashAlgorithm,
    ) -> Result<()> {
        for len in [calculated.len(), expected.len()] {
            if len > MAX_ALIGNED_ENTRIES {
                return Err(Error::InvalidInput(format!(
                    "cannot align {len} events, the limit is {MAX_ALIGNED_ENTRIES}"
                )));
            }
        }
        for entry in calculated {
            entry.digest.check_size(algorithm)?;
        }
        for entry in expected {
            if entry.algorithm != algorithm {
                return Err(Error::InvalidInput(format!(
                    "captured {} event in a {algorithm} alignment",
                    entry.algorithm
                )));
            }
            entry.digest.check_size(algorithm)?;
        }
        Ok(())
    }

    fn bruteforcer(&self, min: usize, max: usize) -> BruteForcer<'_> {
        BruteForcer::new(self.binomials)
            .distance(min, max)
            .max_workers(self.settings.max_workers)
            .combination_limit(self.settings.combination_limit)
            .cancel_token(self.cancel.clone())
    }

    /// Aligns the calculated events with the captured ones, both for the
    /// same PCR bank.
    pub fn align(
        &self,
        calculated: &[CalculatedEntry],
        expected: &[EventLogEntry],
        algorithm: HashAlgorithm,
    ) -> Result<Alignment> {
        Self::check_input(calculated, expected, algorithm)?;

        if calculated.len() == expected.len() {
            let none = vec![false; calculated.len()];
            if let Some(score) = score(calculated, expected, &none, &none) {
                if score.distance == 0 {
                    debug!("Event logs are identical ({} events)", calculated.len());
                    return Ok(zip(calculated, expected, &none, &none, 0));
                }
            }
        }

        let mut best = self.disable_length_difference(calculated, expected)?;
        if best.score.digest_mismatches >= 2 {
            best = self.refine(calculated, expected, best)?;
        }

        debug!(
            "Event log alignment distance {:#x}, {} mismatched pairs",
            best.score.distance, best.score.mismatches
        );
        Ok(zip(
            calculated,
            expected,
            &best.calculated_disabled,
            &best.expected_disabled,
            best.score.distance,
        ))
    }

    /// Disables exactly as many entries of the longer log as needed to make
    /// both logs the same length.
    fn disable_length_difference(
        &self,
        calculated: &[CalculatedEntry],
        expected: &[EventLogEntry],
    ) -> Result<Candidate> {
        let calculated_longer = calculated.len() > expected.len();
        let delta = calculated.len().abs_diff(expected.len());
        let longer = calculated.len().max(expected.len());
        let floor = delta as u64 * DISABLED_COST;
        debug!("Disabling {delta} of {longer} events to align the logs");

        let calculated_none = vec![false; calculated.len()];
        let expected_none = vec![false; expected.len()];
        let masks = |mask: &[bool]| -> (Vec<bool>, Vec<bool>) {
            if calculated_longer {
                (mask.to_vec(), expected_none.clone())
            } else {
                (calculated_none.clone(), mask.to_vec())
            }
        };

        let outcome = self.bruteforcer(delta, delta).run(
            &vec![false; longer],
            1,
            || Ok(None::<Candidate>),
            |best, mask: &[bool]| {
                let (calculated_disabled, expected_disabled) = masks(mask);
                let Some(score) = score(
                    calculated,
                    expected,
                    &calculated_disabled,
                    &expected_disabled,
                ) else {
                    return Ok(false);
                };
                Candidate::keep_best(
                    best,
                    Candidate {
                        score,
                        calculated_disabled,
                        expected_disabled,
                    },
                );
                Ok(score.distance == floor)
            },
            apply_bitflips_bools,
        )?;

        best_of(outcome.states.into_iter().flatten()).ok_or_else(|| {
            Error::Other("event log alignment found no candidate".to_string())
        })
    }

    /// Searches for additional pairs of disabled entries, one in each log,
    /// that lower the distance of `start`.
    fn refine(
        &self,
        calculated: &[CalculatedEntry],
        expected: &[EventLogEntry],
        start: Candidate,
    ) -> Result<Candidate> {
        let extra = self
            .settings
            .max_extra_disabled_events
            .min(start.score.digest_mismatches - 1);
        if extra == 0 {
            return Ok(start);
        }
        debug!(
            "Refining alignment with up to {extra} more disabled event pairs"
        );

        let split = calculated.len();
        let initial: Vec<bool> = start
            .calculated_disabled
            .iter()
            .chain(start.expected_disabled.iter())
            .copied()
            .collect();

        let mut best = start;
        // An odd number of flips always leaves the logs with different
        // lengths.
        for flips in (2..=2 * extra).step_by(2) {
            let bound = best.score.distance;
            let outcome = self.bruteforcer(flips, flips).run(
                &initial,
                1,
                || Ok(None::<Candidate>),
                |candidate, mask: &[bool]| {
                    let (calculated_disabled, expected_disabled) =
                        mask.split_at(split);
                    let Some(score) = score(
                        calculated,
                        expected,
                        calculated_disabled,
                        expected_disabled,
                    ) else {
                        return Ok(false);
                    };
                    if score.distance >= bound {
                        return Ok(false);
                    }
                    Candidate::keep_best(
                        candidate,
                        Candidate {
                            score,
                            calculated_disabled: calculated_disabled.to_vec(),
                            expected_disabled: expected_disabled.to_vec(),
                        },
                    );
                    Ok(score.mismatches == 0)
                },
                apply_bitflips_bools,
            )?;

            if let Some(candidate) = best_of(outcome.states.into_iter().flatten())
            {
                best = candidate;
            }
            if outcome.found.is_some() {
                break;
            }
        }
        Ok(best)
    }
}

fn best_of(candidates: impl Iterator<Item = Candidate>) -> Option<Candidate> {
    candidates.min_by_key(|c| c.score.distance)
}

/// Merges both logs into one sequence, disabled entries being inserted
/// before the next enabled pair: captured first, then calculated.
fn zip(
    calculated: &[CalculatedEntry],
    expected: &[EventLogEntry],
    calculated_disabled: &[bool],
    expected_disabled: &[bool],
    distance: u64,
) -> Alignment {
    let mut entries = Vec::with_capacity(calculated.len().max(expected.len()));
    let unexpected = |entry: &EventLogEntry| AlignedEntry {
        kind: AlignmentKind::Unexpected,
        calculated: None,
        expected: Some(entry.clone()),
    };
    let missing = |entry: &CalculatedEntry| AlignedEntry {
        kind: AlignmentKind::Missing,
        calculated: Some(entry.clone()),
        expected: None,
    };

    let (mut i, mut j) = (0, 0);
    loop {
        while j < expected.len() && expected_disabled[j] {
            entries.push(unexpected(&expected[j]));
            j += 1;
        }
        while i < calculated.len() && calculated_disabled[i] {
            entries.push(missing(&calculated[i]));
            i += 1;
        }
        if i >= calculated.len() || j >= expected.len() {
            break;
        }
        entries.push(AlignedEntry::pair(&calculated[i], &expected[j]));
        i += 1;
        j += 1;
    }
    entries.extend(expected[j..].iter().map(unexpected));
    entries.extend(calculated[i..].iter().map(missing));

    Alignment { entries, distance }
}
