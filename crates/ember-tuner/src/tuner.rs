//! The tune-or-run engine.

use crate::cache::{DeviceFingerprint, TuningCache, TuningRecord};
use ember_common::{Result, TuningConfig, TuningError, TuningPolicy};
use log::{debug, info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Cost of one evaluation together with whatever the evaluation produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement<R> {
    pub cost: Duration,
    pub output: R,
}

impl<R> Measurement<R> {
    pub fn new(cost: Duration, output: R) -> Self {
        Self { cost, output }
    }
}

/// Finite, restartable sequence of candidate configurations.
pub trait CandidateSource<P> {
    /// Candidates in preference order; earlier candidates win ties.
    fn candidates(&self) -> Vec<P>;

    /// Whether `params` can still run on the current device. Persisted
    /// records that fail this check are re-tuned.
    fn admits(&self, _params: &P) -> bool {
        true
    }
}

impl<P: Clone> CandidateSource<P> for Vec<P> {
    fn candidates(&self) -> Vec<P> {
        self.clone()
    }
}

impl<P: Clone> CandidateSource<P> for [P] {
    fn candidates(&self) -> Vec<P> {
        self.to_vec()
    }
}

/// One real, blocking execution under a given configuration.
///
/// An `Err` marks the configuration as unusable. During a tuning pass that
/// only disqualifies the candidate; when running a known configuration it is
/// returned to the caller.
pub trait Evaluator<P> {
    type Output;

    fn evaluate(&mut self, params: &P) -> Result<Measurement<Self::Output>>;
}

impl<P, R, F> Evaluator<P> for F
where
    F: FnMut(&P) -> Result<Measurement<R>>,
{
    type Output = R;

    fn evaluate(&mut self, params: &P) -> Result<Measurement<R>> {
        self(params)
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunerStats {
    /// Calls answered from a stored record.
    pub hits: u64,
    /// Calls with no usable record.
    pub misses: u64,
    /// Records rejected by [`CandidateSource::admits`].
    pub stale: u64,
    /// Completed tuning passes.
    pub tunes: u64,
    /// Total evaluator invocations.
    pub evaluations: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stale: AtomicU64,
    tunes: AtomicU64,
    evaluations: AtomicU64,
}

enum Stored<P> {
    Usable(P),
    Rejected(P),
    Missing,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

// ---------------------------------------------------------------------------
// Tuner
// ---------------------------------------------------------------------------

/// Picks, remembers, and replays the best configuration per problem key.
///
/// Lookups are shared; the first tuning pass for a key is serialized by a
/// per-key gate so concurrent callers wait for and reuse its result. Tuning
/// passes for different keys never measure at the same time.
pub struct Tuner<P> {
    device: DeviceFingerprint,
    config: TuningConfig,
    cache: RwLock<TuningCache<P>>,
    gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    measure: Mutex<()>,
    counters: Counters,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<P> Tuner<P>
where
    P: Clone + fmt::Debug + Serialize + DeserializeOwned,
{
    /// Tuner for `device`, preloaded from `config.cache_path` when set.
    pub fn new(device: DeviceFingerprint, config: TuningConfig) -> Self {
        let cache = match &config.cache_path {
            Some(path) => TuningCache::load(path),
            None => TuningCache::default(),
        };
        if let Some(profile) = cache.profiles.get(&device.name)
            && !profile.matches(&device)
        {
            warn!(
                "Tuning records for '{}' were measured with driver {}; they will be re-tuned",
                device.name, profile.driver_version
            );
        }
        Self {
            device,
            config,
            cache: RwLock::new(cache),
            gates: Mutex::new(HashMap::new()),
            measure: Mutex::new(()),
            counters: Counters::default(),
        }
    }

    pub fn device(&self) -> &DeviceFingerprint {
        &self.device
    }

    pub fn config(&self) -> &TuningConfig {
        &self.config
    }

    pub fn stats(&self) -> TunerStats {
        let c = &self.counters;
        TunerStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            stale: c.stale.load(Ordering::Relaxed),
            tunes: c.tunes.load(Ordering::Relaxed),
            evaluations: c.evaluations.load(Ordering::Relaxed),
        }
    }

    /// Stored record for `key` on this device.
    pub fn lookup(&self, key: &str) -> Option<TuningRecord<P>> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).get(&self.device, key).cloned()
    }

    /// Store `params` as the winner for `key` and persist the cache.
    pub fn record(&self, key: &str, params: P, cost: Duration) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        cache.upsert(&self.device, key, TuningRecord::new(params, cost));
        if let Some(path) = &self.config.cache_path
            && let Err(e) = cache.save(path)
        {
            warn!("Failed to save tuning cache: {}", e);
        }
    }

    /// Drop the record for `key`, returning whether one existed.
    pub fn forget(&self, key: &str) -> bool {
        self.cache.write().unwrap_or_else(PoisonError::into_inner).remove(&self.device, key).is_some()
    }

    /// Write the cache to `config.cache_path`, if configured.
    pub fn flush(&self) -> Result<()> {
        if let Some(path) = &self.config.cache_path {
            self.cache.read().unwrap_or_else(PoisonError::into_inner).save(path)?;
        }
        Ok(())
    }

    /// Run `evaluator` under the best known configuration for `key`,
    /// tuning first if none is known.
    ///
    /// With a usable record the evaluator runs exactly once. Otherwise every
    /// candidate from `source` is measured, failing candidates are skipped,
    /// and the cheapest one (earliest on ties) is stored and its output
    /// returned. Under [`TuningPolicy::Never`] a miss runs `default` once and
    /// stores nothing.
    pub fn tune_or_run<S, E>(
        &self,
        key: &str,
        default: &P,
        source: &S,
        evaluator: &mut E,
    ) -> Result<E::Output>
    where
        S: CandidateSource<P> + ?Sized,
        E: Evaluator<P> + ?Sized,
    {
        let policy = self.config.policy;
        if policy != TuningPolicy::Always {
            match self.stored(key, source) {
                Stored::Usable(params) => {
                    debug!("Tuning cache hit for '{}': {:?}", key, params);
                    bump(&self.counters.hits);
                    return self.run(key, &params, evaluator);
                }
                Stored::Rejected(params) => {
                    warn!(
                        "Stored configuration {:?} for '{}' is no longer valid, re-tuning",
                        params, key
                    );
                    bump(&self.counters.stale);
                }
                Stored::Missing => {}
            }
        }
        bump(&self.counters.misses);

        if policy == TuningPolicy::Never {
            debug!("No tuning record for '{}', running default {:?}", key, default);
            return self.run(key, default, evaluator);
        }

        let gate = self.gate(key);
        let _gate = lock(&gate);
        if policy != TuningPolicy::Always
            && let Stored::Usable(params) = self.stored(key, source)
        {
            debug!("'{}' was tuned by a concurrent caller", key);
            return self.run(key, &params, evaluator);
        }
        let tuned = self.tune(key, source, evaluator);
        // Callers already waiting hold their own handle and re-check the cache.
        lock(&self.gates).remove(key);
        tuned
    }

    /// The stored record for `key` as judged by `source`. Has no side effects.
    fn stored<S>(&self, key: &str, source: &S) -> Stored<P>
    where
        S: CandidateSource<P> + ?Sized,
    {
        match self.lookup(key) {
            Some(record) if source.admits(&record.params) => Stored::Usable(record.params),
            Some(record) => Stored::Rejected(record.params),
            None => Stored::Missing,
        }
    }

    fn gate(&self, key: &str) -> Arc<Mutex<()>> {
        lock(&self.gates).entry(key.to_owned()).or_default().clone()
    }

    #[cfg(test)]
    fn gate_count(&self) -> usize {
        lock(&self.gates).len()
    }

    fn evaluate<E>(&self, params: &P, evaluator: &mut E) -> Result<Measurement<E::Output>>
    where
        E: Evaluator<P> + ?Sized,
    {
        bump(&self.counters.evaluations);
        evaluator.evaluate(params)
    }

    fn run<E>(&self, key: &str, params: &P, evaluator: &mut E) -> Result<E::Output>
    where
        E: Evaluator<P> + ?Sized,
    {
        let measurement = self.evaluate(params, evaluator).inspect_err(|e| {
            warn!("Running '{}' with {:?} failed: {}", key, params, e);
        })?;
        Ok(measurement.output)
    }

    fn tune<S, E>(&self, key: &str, source: &S, evaluator: &mut E) -> Result<E::Output>
    where
        S: CandidateSource<P> + ?Sized,
        E: Evaluator<P> + ?Sized,
    {
        let candidates = source.candidates();
        if candidates.is_empty() {
            return Err(TuningError::EmptyCandidateSet { key: key.to_owned() }.into());
        }

        let _measuring = lock(&self.measure);
        info!(
            "Tuning '{}' on '{}': {} candidates, {} warmup + {} bench iters",
            key,
            self.device.name,
            candidates.len(),
            self.config.warmup_iterations,
            self.config.bench_iterations,
        );

        let attempted = candidates.len();
        let mut best: Option<(P, Duration, E::Output)> = None;
        let mut last_failure = String::new();

        'candidates: for params in candidates {
            for _ in 0..self.config.warmup_iterations {
                if let Err(e) = self.evaluate(&params, evaluator) {
                    warn!("Candidate {:?} for '{}' rejected: {}", params, key, e);
                    last_failure = e.to_string();
                    continue 'candidates;
                }
            }

            let iterations = self.config.bench_iterations.max(1) as usize;
            let mut costs = Vec::with_capacity(iterations);
            let mut output = None;
            for _ in 0..iterations {
                match self.evaluate(&params, evaluator) {
                    Ok(m) => {
                        costs.push(m.cost);
                        output = Some(m.output);
                    }
                    Err(e) => {
                        warn!("Candidate {:?} for '{}' rejected: {}", params, key, e);
                        last_failure = e.to_string();
                        continue 'candidates;
                    }
                }
            }
            let Some(output) = output else { continue };

            costs.sort();
            let median = costs[costs.len() / 2];
            debug!("  {:?} -> median={:?}", params, median);

            if best.as_ref().is_none_or(|(_, cost, _)| median < *cost) {
                best = Some((params, median, output));
            }
        }

        let Some((params, cost, output)) = best else {
            return Err(TuningError::NoViableCandidate {
                key: key.to_owned(),
                attempted,
                last_failure,
            }
            .into());
        };

        info!("Best configuration for '{}': {:?} ({:?})", key, params, cost);
        bump(&self.counters.tunes);
        self.record(key, params, cost);
        Ok(output)
    }
}

impl<P: fmt::Debug> fmt::Debug for Tuner<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tuner")
            .field("device", &self.device)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
