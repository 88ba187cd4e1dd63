//! Empirical selection of launch configurations.
//!
//! [`Tuner::tune_or_run`] measures every candidate a [`CandidateSource`]
//! offers through an [`Evaluator`], keeps the cheapest, and replays it on
//! later calls with the same key. Winners are grouped per device and can be
//! persisted to a JSON file so they survive restarts.

pub mod cache;
pub mod tuner;

pub use cache::{CACHE_VERSION, DeviceFingerprint, DeviceProfile, TuningCache, TuningRecord};
pub use tuner::{CandidateSource, Evaluator, Measurement, Tuner, TunerStats};
