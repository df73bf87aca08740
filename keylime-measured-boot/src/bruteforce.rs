// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Keylime Authors

//! Generic parallel search over bit-flip combinations.
//!
//! The search starts from some initial data and tries every combination of
//! `d` flipped bits, for each distance `d` in a range, until a user
//! provided check accepts the modified data. Each distance round splits the
//! combination ID space in contiguous chunks, one per worker thread. A
//! worker jumps to the start of its chunk by ID and then walks it with
//! [`Combination::next`].
//!
//! When several combinations at the same distance pass the check, the one
//! returned is whichever a worker found first. This is not deterministic
//! across runs.

use crate::cancel::CancelToken;
use crate::combination::{Binomials, Combination, CombinationId};
use crate::error::{Error, Result};
use log::*;
use std::thread;

/// Default ceiling on the number of combinations tried in a single round.
pub const DEFAULT_COMBINATION_LIMIT: u64 = 1 << 40;

/// Result of a search: the accepted combination, if any, and the final
/// state of every worker that ran.
///
/// Workers only write to their own state, so the states can be used to
/// aggregate results (for example the best candidate seen) once the search
/// is over.
#[derive(Debug)]
pub struct Outcome<S> {
    pub found: Option<Combination>,
    pub states: Vec<S>,
}

/// Flips the bits of `data` selected by `combination`.
///
/// Bit `i` is bit `i & 7` of byte `i >> 3`. Applying the same combination
/// twice restores the data.
pub fn apply_bitflips_bytes(data: &mut [u8], combination: &Combination) {
    for &index in combination.indices() {
        data[index >> 3] ^= 1 << (index & 7);
    }
}

/// Toggles the items of `data` selected by `combination`.
pub fn apply_bitflips_bools(data: &mut [bool], combination: &Combination) {
    for &index in combination.indices() {
        data[index] = !data[index];
    }
}

/// Returns the number of worker threads to use for a `max_workers` setting,
/// `0` meaning one per available CPU.
pub fn worker_count(max_workers: usize) -> usize {
    if max_workers > 0 {
        return max_workers;
    }
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Builder for a brute-force search.
#[derive(Debug)]
pub struct BruteForcer<'a> {
    binomials: &'a Binomials,
    min_distance: usize,
    max_distance: usize,
    max_workers: usize,
    combination_limit: u64,
    cancel: CancelToken,
}

struct WorkerReport<S> {
    state: Option<S>,
    found: Option<Combination>,
    error: Option<Error>,
}

impl<'a> BruteForcer<'a> {
    pub fn new(binomials: &'a Binomials) -> Self {
        Self {
            binomials,
            min_distance: 0,
            max_distance: 0,
            max_workers: 0,
            combination_limit: DEFAULT_COMBINATION_LIMIT,
            cancel: CancelToken::new(),
        }
    }

    /// Sets the range of flipped bits to try, both ends included.
    pub fn distance(mut self, min_distance: usize, max_distance: usize) -> Self {
        self.min_distance = min_distance;
        self.max_distance = max_distance;
        self
    }

    /// Caps the number of worker threads, `0` meaning one per CPU.
    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Sets the maximum number of combinations allowed in one round.
    pub fn combination_limit(mut self, limit: u64) -> Self {
        self.combination_limit = limit;
        self
    }

    /// Sets a token that aborts the search when cancelled.
    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs the search.
    ///
    /// * `initial` - the data to flip bits in; each worker works on a copy.
    /// * `item_bit_width` - number of flippable bits per item of `initial`.
    /// * `init` - creates the private state of a worker.
    /// * `check` - returns `true` when the modified data is acceptable.
    /// * `apply` - flips the bits selected by a combination, must be its
    ///   own inverse.
    pub fn run<T, S, I, C, A>(
        &self,
        initial: &[T],
        item_bit_width: usize,
        init: I,
        check: C,
        apply: A,
    ) -> Result<Outcome<S>>
    where
        T: Clone + Send + Sync,
        S: Send,
        I: Fn() -> Result<S> + Sync,
        C: Fn(&mut S, &[T]) -> Result<bool> + Sync,
        A: Fn(&mut [T], &Combination) + Sync,
    {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut states = Vec::new();

        if self.min_distance == 0 {
            let mut state = init()?;
            let accepted = check(&mut state, initial)?;
            states.push(state);
            if accepted {
                return Ok(Outcome {
                    found: Some(Combination::empty()),
                    states,
                });
            }
        }

        let bits = initial.len() * item_bit_width;
        if bits == 0 {
            return Ok(Outcome {
                found: None,
                states,
            });
        }
        let max_value = bits - 1;

        for distance in self.min_distance.max(1)..=self.max_distance {
            let total = Combination::count(distance, max_value, self.binomials)?;
            if total == 0 {
                // More flips than bits, larger distances are empty as well.
                break;
            }
            if total > self.combination_limit {
                return Err(Error::TooManyCombinations(format!(
                    "{total} combinations of {distance} out of {bits} bits exceed the limit of {}",
                    self.combination_limit
                )));
            }

            let found = self.run_round(
                initial, distance, max_value, total, &init, &check, &apply,
                &mut states,
            )?;
            if found.is_some() {
                return Ok(Outcome { found, states });
            }
        }

        Ok(Outcome {
            found: None,
            states,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn run_round<T, S, I, C, A>(
        &self,
        initial: &[T],
        distance: usize,
        max_value: usize,
        total: u64,
        init: &I,
        check: &C,
        apply: &A,
        states: &mut Vec<S>,
    ) -> Result<Option<Combination>>
    where
        T: Clone + Send + Sync,
        S: Send,
        I: Fn() -> Result<S> + Sync,
        C: Fn(&mut S, &[T]) -> Result<bool> + Sync,
        A: Fn(&mut [T], &Combination) + Sync,
    {
        let workers = (worker_count(self.max_workers) as u64).min(total);
        let chunk = total.div_ceil(workers);
        debug!(
            "Brute force round: distance {distance}, {total} combinations, {workers} workers"
        );

        // Stops the workers of this round only, the caller's token is left
        // alone.
        let round = self.cancel.child();
        let round = &round;

        let reports: Vec<WorkerReport<S>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|worker| {
                    let start = worker * chunk;
                    let end = (start + chunk).min(total);
                    scope.spawn(move || {
                        self.run_worker(
                            initial, distance, max_value, start, end, round,
                            init, check, apply,
                        )
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| WorkerReport {
                        state: None,
                        found: None,
                        error: Some(Error::Other(
                            "search worker panicked".to_string(),
                        )),
                    })
                })
                .collect()
        });

        let mut found = None;
        let mut errors = Vec::new();
        for report in reports {
            if let Some(error) = report.error {
                errors.push(error);
            }
            if found.is_none() {
                found = report.found;
            }
            if let Some(state) = report.state {
                states.push(state);
            }
        }

        if let Some(error) = Error::from_workers(errors) {
            return Err(error);
        }
        if found.is_none() && self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(found)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_worker<T, S, I, C, A>(
        &self,
        initial: &[T],
        distance: usize,
        max_value: usize,
        start: CombinationId,
        end: CombinationId,
        round: &CancelToken,
        init: &I,
        check: &C,
        apply: &A,
    ) -> WorkerReport<S>
    where
        T: Clone,
        I: Fn() -> Result<S>,
        C: Fn(&mut S, &[T]) -> Result<bool>,
        A: Fn(&mut [T], &Combination),
    {
        let mut report = WorkerReport {
            state: None,
            found: None,
            error: None,
        };

        let mut state = match init() {
            Ok(state) => state,
            Err(e) => {
                round.cancel();
                report.error = Some(e);
                return report;
            }
        };

        let mut combination =
            match Combination::from_id(distance, max_value, start, self.binomials)
            {
                Ok(combination) => combination,
                Err(e) => {
                    round.cancel();
                    report.error = Some(e);
                    report.state = Some(state);
                    return report;
                }
            };

        let mut data = initial.to_vec();
        let mut id = start;
        while id < end && !round.is_cancelled() {
            apply(&mut data, &combination);
            match check(&mut state, &data) {
                Ok(true) => {
                    round.cancel();
                    report.found = Some(combination);
                    break;
                }
                Ok(false) => {}
                Err(e) => {
                    round.cancel();
                    report.error = Some(e);
                    break;
                }
            }
            apply(&mut data, &combination);

            id += 1;
            if id < end && !combination.next(max_value) {
                break;
            }
        }

        report.state = Some(state);
        report
    }
}

/// Searches for the smallest set of bit flips of `initial` accepted by
/// `check`, see [`BruteForcer::run`].
#[allow(clippy::too_many_arguments)]
pub fn brute_force<T, S, I, C, A>(
    initial: &[T],
    item_bit_width: usize,
    min_distance: usize,
    max_distance: usize,
    init: I,
    check: C,
    apply: A,
    max_workers: usize,
) -> Result<Option<Combination>>
where
    T: Clone + Send + Sync,
    S: Send,
    I: Fn() -> Result<S> + Sync,
    C: Fn(&mut S, &[T]) -> Result<bool> + Sync,
    A: Fn(&mut [T], &Combination) + Sync,
{
    let binomials = Binomials::new();
    BruteForcer::new(&binomials)
        .distance(min_distance, max_distance)
        .max_workers(max_workers)
        .run(initial, item_bit_width, init, check, apply)
        .map(|outcome| outcome.found)
}
