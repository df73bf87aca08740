// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Keylime Authors

//! Recovery of corrupted status register values.
//!
//! Some boot steps measure a platform status register together with other
//! data. When the register read at attestation time differs from the one
//! read at boot, the replayed digest does not match the event log. The
//! strategies here look for a register value, close to the measured one,
//! whose measurement reproduces the expected digest.

use crate::algorithms::HashAlgorithm;
use crate::bruteforce::{apply_bitflips_bytes, worker_count, BruteForcer};
use crate::cancel::CancelToken;
use crate::combination::Binomials;
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::measurement::{Measurement, RegisterId, REGISTER_SIZE};
use crate::settings::SearchSettings;
use log::*;
use serde_derive::Serialize;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
    thread,
};

/// Maximum number of digests kept by a [`DigestCache`].
pub const DIGEST_CACHE_CAPACITY: usize = 1 << 16;

/// Callback deciding whether the digest of a candidate measurement is the
/// expected one.
pub type DigestCheck<'a> = dyn Fn(&Digest) -> Result<bool> + Sync + 'a;

/// Memoizes register value to measurement digest computations.
///
/// The cache is best-effort: concurrent inserts of the same value are
/// harmless, a poisoned lock is treated as a miss and inserts stop once the
/// capacity is reached.
#[derive(Debug, Default)]
pub struct DigestCache {
    entries: RwLock<HashMap<u64, Digest>>,
}

impl DigestCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, value: u64) -> Option<Digest> {
        self.entries.read().ok()?.get(&value).cloned()
    }

    fn insert(&self, value: u64, digest: Digest) {
        if let Ok(mut entries) = self.entries.write() {
            if entries.len() < DIGEST_CACHE_CAPACITY {
                let _ = entries.insert(value, digest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A measurement containing a status register, prepared for repeated
/// hashing with different register values.
#[derive(Clone, Debug)]
pub struct RegisterTarget {
    register: RegisterId,
    original: u64,
    algorithm: HashAlgorithm,
    prefix: Vec<u8>,
    suffix: Vec<u8>,
    cache: Arc<DigestCache>,
}

// Shared by reference between search workers.
assert_impl_all!(RegisterTarget: Send, Sync);

impl RegisterTarget {
    /// Prepares `measurement` for register recovery. Returns `None` when the
    /// measurement does not look like a status register measurement.
    pub fn from_measurement(
        measurement: &Measurement,
        algorithm: HashAlgorithm,
        image: Option<&[u8]>,
    ) -> Result<Option<Self>> {
        let Some(status) = measurement.status_register() else {
            return Ok(None);
        };
        let data = measurement.data(image)?;
        let end = status.offset.checked_add(REGISTER_SIZE);
        let (Some(prefix), Some(suffix)) = (
            data.get(..status.offset),
            end.and_then(|end| data.get(end..)),
        ) else {
            return Err(Error::InvalidInput(format!(
                "register {} of measurement {} is out of its data",
                status.id, measurement.name
            )));
        };

        Ok(Some(Self {
            register: status.id,
            original: status.value,
            algorithm,
            prefix: prefix.to_vec(),
            suffix: suffix.to_vec(),
            cache: Arc::new(DigestCache::new()),
        }))
    }

    pub fn register(&self) -> RegisterId {
        self.register
    }

    /// The register value as measured.
    pub fn original(&self) -> u64 {
        self.original
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Digest of the measurement with the register set to `value`.
    pub fn digest_with(&self, value: u64) -> Result<Digest> {
        Ok(self.algorithm.hash_parts(&[
            self.prefix.as_slice(),
            &value.to_le_bytes()[..],
            self.suffix.as_slice(),
        ])?)
    }

    /// Like [`RegisterTarget::digest_with`], going through the shared cache.
    pub fn cached_digest_with(&self, value: u64) -> Result<Digest> {
        if let Some(digest) = self.cache.get(value) {
            return Ok(digest);
        }
        let digest = self.digest_with(value)?;
        self.cache.insert(value, digest.clone());
        Ok(digest)
    }

    pub fn cache(&self) -> &DigestCache {
        &self.cache
    }
}

/// A register value found by a recovery.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RegisterCorrection {
    pub register: RegisterId,
    /// The value as measured.
    pub original: u64,
    /// The value reproducing the expected digest.
    pub corrected: u64,
}

impl RegisterCorrection {
    pub fn is_corrected(&self) -> bool {
        self.original != self.corrected
    }
}

impl fmt::Display for RegisterCorrection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} was measured as {:#018x} instead of {:#018x}",
            self.register, self.original, self.corrected
        )
    }
}

/// A way of searching register values other than the measured one.
pub trait RegisterStrategy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Looks for a value accepted by `accept`, the measured value excluded.
    fn search(
        &self,
        target: &RegisterTarget,
        accept: &DigestCheck<'_>,
        cancel: &CancelToken,
    ) -> Result<Option<u64>>;
}

/// Scans the values around the measured one, `-1` before `+1`, up to a
/// maximum distance. The range is split in contiguous blocks of distances,
/// one per worker, and the match closest to the measured value wins.
#[derive(Clone, Debug)]
pub struct LinearStrategy {
    pub max_distance: u64,
    pub max_workers: usize,
}

impl LinearStrategy {
    /// Scans the distances `first..=last`. An error stops the sibling
    /// workers through `search`.
    fn scan(
        target: &RegisterTarget,
        accept: &DigestCheck<'_>,
        first: u64,
        last: u64,
        best: &AtomicU64,
        search: &CancelToken,
    ) -> Result<Option<(u64, u64)>> {
        let result = Self::scan_block(target, accept, first, last, best, search);
        if result.is_err() {
            search.cancel();
        }
        result
    }

    fn scan_block(
        target: &RegisterTarget,
        accept: &DigestCheck<'_>,
        first: u64,
        last: u64,
        best: &AtomicU64,
        search: &CancelToken,
    ) -> Result<Option<(u64, u64)>> {
        let original = target.original();
        for distance in first..=last {
            // A closer match was already found by another worker.
            if distance >= best.load(Ordering::Relaxed) || search.is_cancelled()
            {
                break;
            }
            for value in [
                original.wrapping_sub(distance),
                original.wrapping_add(distance),
            ] {
                if accept(&target.cached_digest_with(value)?)? {
                    let _ = best.fetch_min(distance, Ordering::SeqCst);
                    return Ok(Some((distance, value)));
                }
            }
        }
        Ok(None)
    }
}

impl RegisterStrategy for LinearStrategy {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn search(
        &self,
        target: &RegisterTarget,
        accept: &DigestCheck<'_>,
        cancel: &CancelToken,
    ) -> Result<Option<u64>> {
        if self.max_distance == 0 {
            return Ok(None);
        }
        let workers = (worker_count(self.max_workers) as u64).min(self.max_distance);
        let block = self.max_distance.div_ceil(workers);
        let best = AtomicU64::new(u64::MAX);
        let search = cancel.child();

        let results: Vec<Result<Option<(u64, u64)>>> = if workers == 1 {
            vec![Self::scan(
                target,
                accept,
                1,
                self.max_distance,
                &best,
                &search,
            )]
        } else {
            let (best, search) = (&best, &search);
            thread::scope(|scope| {
                let handles: Vec<_> = (0..workers)
                    .map(|worker| {
                        let first = worker * block + 1;
                        let last = ((worker + 1) * block).min(self.max_distance);
                        scope.spawn(move || {
                            Self::scan(target, accept, first, last, best, search)
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| {
                        handle.join().unwrap_or_else(|_| {
                            Err(Error::Other(
                                "register search worker panicked".to_string(),
                            ))
                        })
                    })
                    .collect()
            })
        };

        let mut found: Option<(u64, u64)> = None;
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(Some(candidate)) => match found {
                    Some((distance, _)) if distance <= candidate.0 => {}
                    _ => found = Some(candidate),
                },
                Ok(None) => {}
                Err(e) => errors.push(e),
            }
        }
        if let Some(error) = Error::from_workers(errors) {
            return Err(error);
        }
        if found.is_none() && cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(found.map(|(_, value)| value))
    }
}

/// Flips up to `max_bitflips` bits of the measured value.
#[derive(Debug)]
pub struct CombinatorialStrategy {
    pub max_bitflips: usize,
    pub max_workers: usize,
    pub combination_limit: u64,
    pub binomials: Arc<Binomials>,
}

impl RegisterStrategy for CombinatorialStrategy {
    fn name(&self) -> &'static str {
        "combinatorial"
    }

    fn search(
        &self,
        target: &RegisterTarget,
        accept: &DigestCheck<'_>,
        cancel: &CancelToken,
    ) -> Result<Option<u64>> {
        if self.max_bitflips == 0 {
            return Ok(None);
        }
        let initial = target.original().to_le_bytes();
        let outcome = BruteForcer::new(&self.binomials)
            .distance(1, self.max_bitflips)
            .max_workers(self.max_workers)
            .combination_limit(self.combination_limit)
            .cancel_token(cancel.clone())
            .run(
                &initial,
                8,
                || Ok(()),
                |_, bytes: &[u8]| {
                    accept(&target.cached_digest_with(register_value(bytes)?)?)
                },
                apply_bitflips_bytes,
            )?;

        Ok(outcome.found.map(|combination| {
            let mut bytes = initial;
            apply_bitflips_bytes(&mut bytes, &combination);
            u64::from_le_bytes(bytes)
        }))
    }
}

fn register_value(bytes: &[u8]) -> Result<u64> {
    let bytes: [u8; REGISTER_SIZE] = bytes.try_into().map_err(|_| {
        Error::InvalidInput(format!(
            "register value must be {REGISTER_SIZE} bytes, got {}",
            bytes.len()
        ))
    })?;
    Ok(u64::from_le_bytes(bytes))
}

/// Tries the register strategies in order, returning the first success.
#[derive(Debug)]
pub struct RegisterRecovery {
    strategies: Vec<Box<dyn RegisterStrategy>>,
}

impl RegisterRecovery {
    pub fn new(strategies: Vec<Box<dyn RegisterStrategy>>) -> Self {
        Self { strategies }
    }

    /// Builds the strategies enabled by `settings`: linear always, then
    /// combinatorial when enabled. `max_workers` overrides the setting of
    /// the same name, for recoveries nested in another parallel search.
    pub fn from_settings(
        settings: &SearchSettings,
        max_workers: usize,
        binomials: Arc<Binomials>,
    ) -> Self {
        let mut strategies: Vec<Box<dyn RegisterStrategy>> =
            vec![Box::new(LinearStrategy {
                max_distance: settings.max_register_distance,
                max_workers,
            })];
        if settings.enable_combinatorial_register {
            strategies.push(Box::new(CombinatorialStrategy {
                max_bitflips: settings.max_register_bitflips,
                max_workers,
                combination_limit: settings.combination_limit,
                binomials,
            }));
        }
        Self::new(strategies)
    }

    /// Returns the register value accepted by `accept`, the measured value
    /// first. `None` if no strategy finds one.
    pub fn recover(
        &self,
        target: &RegisterTarget,
        accept: &DigestCheck<'_>,
        cancel: &CancelToken,
    ) -> Result<Option<RegisterCorrection>> {
        let correction = |corrected| RegisterCorrection {
            register: target.register(),
            original: target.original(),
            corrected,
        };

        if accept(&target.cached_digest_with(target.original())?)? {
            return Ok(Some(correction(target.original())));
        }

        for strategy in &self.strategies {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            debug!(
                "Trying {} recovery of {} (measured {:#x})",
                strategy.name(),
                target.register(),
                target.original()
            );
            if let Some(value) = strategy.search(target, accept, cancel)? {
                let found = correction(value);
                info!("{} strategy: {found}", strategy.name());
                return Ok(Some(found));
            }
        }
        Ok(None)
    }
}
