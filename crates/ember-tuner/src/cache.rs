//! Durable storage of tuning results.
//!
//! Results are grouped into one [`DeviceProfile`] per device name. A profile
//! remembers the driver version it was tuned under; records from another
//! driver version are not trusted.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, SystemTime};

/// Identity of the device a tuning result was measured on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceFingerprint {
    pub name: String,
    pub driver_version: String,
}

impl DeviceFingerprint {
    pub fn new(name: impl Into<String>, driver_version: impl Into<String>) -> Self {
        Self { name: name.into(), driver_version: driver_version.into() }
    }
}

/// Winning configuration for one problem key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningRecord<P> {
    pub params: P,
    /// Median cost of the winner, in nanoseconds.
    pub cost_ns: u64,
    pub tuned_at: String,
}

impl<P> TuningRecord<P> {
    pub fn new(params: P, cost: Duration) -> Self {
        Self {
            params,
            cost_ns: u64::try_from(cost.as_nanos()).unwrap_or(u64::MAX),
            tuned_at: epoch_now(),
        }
    }

    pub fn cost(&self) -> Duration {
        Duration::from_nanos(self.cost_ns)
    }
}

/// All records measured on one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceProfile<P> {
    pub device_name: String,
    pub driver_version: String,
    pub records: HashMap<String, TuningRecord<P>>,
    pub created_at: String,
}

impl<P> DeviceProfile<P> {
    pub fn new(device: &DeviceFingerprint) -> Self {
        Self {
            device_name: device.name.clone(),
            driver_version: device.driver_version.clone(),
            records: HashMap::new(),
            created_at: epoch_now(),
        }
    }

    pub fn matches(&self, device: &DeviceFingerprint) -> bool {
        self.device_name == device.name && self.driver_version == device.driver_version
    }
}

fn epoch_now() -> String {
    let d = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();
    format!("epoch:{}", d.as_secs())
}

/// Cache file holding one or more device profiles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningCache<P> {
    /// Schema version for forward-compatibility.
    pub version: String,
    /// Map of device name to profile.
    pub profiles: HashMap<String, DeviceProfile<P>>,
}

pub const CACHE_VERSION: &str = "1.0.0";

impl<P> Default for TuningCache<P> {
    fn default() -> Self {
        Self { version: CACHE_VERSION.to_owned(), profiles: HashMap::new() }
    }
}

impl<P> TuningCache<P>
where
    P: Serialize + for<'de> Deserialize<'de>,
{
    /// Load from a JSON file, returning an empty cache if the file is
    /// missing, unreadable, or from another schema version.
    pub fn load(path: &Path) -> Self {
        let json = match std::fs::read_to_string(path) {
            Ok(json) => json,
            Err(_) => {
                debug!("No tuning cache at {}, starting fresh", path.display());
                return Self::default();
            }
        };
        match serde_json::from_str::<Self>(&json) {
            Ok(cache) if cache.version == CACHE_VERSION => cache,
            Ok(cache) => {
                warn!(
                    "Ignoring tuning cache {} with schema version {}",
                    path.display(),
                    cache.version
                );
                Self::default()
            }
            Err(e) => {
                warn!("Corrupt tuning cache {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Persist to a JSON file, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        info!("Saved tuning cache to {}", path.display());
        Ok(())
    }
}

impl<P> TuningCache<P> {
    /// Profile for `device`, created on first use. A profile tuned under a
    /// different driver version is discarded.
    pub fn profile_mut(&mut self, device: &DeviceFingerprint) -> &mut DeviceProfile<P> {
        let profile = self
            .profiles
            .entry(device.name.clone())
            .or_insert_with(|| DeviceProfile::new(device));
        if !profile.matches(device) {
            warn!(
                "Discarding {} tuning records for '{}' tuned with driver {} (now {})",
                profile.records.len(),
                device.name,
                profile.driver_version,
                device.driver_version
            );
            *profile = DeviceProfile::new(device);
        }
        profile
    }

    /// Record for `key` on `device`, if one was tuned under the same driver.
    pub fn get(&self, device: &DeviceFingerprint, key: &str) -> Option<&TuningRecord<P>> {
        self.profiles.get(&device.name).filter(|p| p.matches(device)).and_then(|p| p.records.get(key))
    }

    pub fn upsert(&mut self, device: &DeviceFingerprint, key: &str, record: TuningRecord<P>) {
        self.profile_mut(device).records.insert(key.to_owned(), record);
    }

    pub fn remove(&mut self, device: &DeviceFingerprint, key: &str) -> Option<TuningRecord<P>> {
        self.profiles.get_mut(&device.name).and_then(|p| p.records.remove(key))
    }
}
