//! Adapter selection and tiered device creation.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use backend::{
    AdapterDescriptor, AdapterEnumError, AdapterKind, CapabilityTier, CreatedDevice,
    DeviceCreateError, DeviceCreateFlags, PlatformBackend, TIER_ATTEMPTS,
};
use smallvec::SmallVec;

/// The adapter pair a device is created from: at most one hardware adapter
/// and at most one software-fallback adapter.
#[derive(Debug, Clone)]
pub struct AdapterSet {
    pub hardware: Option<AdapterDescriptor>,
    pub fallback: Option<AdapterDescriptor>,
}

impl AdapterSet {
    pub fn is_empty(&self) -> bool {
        self.hardware.is_none() && self.fallback.is_none()
    }
}

/// Walks the platform's adapters. The first hardware adapter wins; for the
/// fallback, an output-bearing adapter is preferred over an output-less one
/// since the compositor synchronizes refresh timing against an output.
pub fn select_adapters(backend: &dyn PlatformBackend) -> Result<AdapterSet, AdapterEnumError> {
    let mut hardware = None;
    let mut fallback_with_outputs = None;
    let mut fallback_without_outputs = None;

    for adapter in backend.enumerate_adapters() {
        match adapter.kind() {
            AdapterKind::Hardware => {
                if hardware.is_none() {
                    hardware = Some(adapter);
                }
            }
            AdapterKind::SoftwareFallback => {
                if adapter.output_count > 0 {
                    if fallback_with_outputs.is_none() {
                        fallback_with_outputs = Some(adapter);
                    }
                } else if fallback_without_outputs.is_none() {
                    fallback_without_outputs = Some(adapter);
                }
            }
        }
    }

    let fallback = fallback_with_outputs.or(fallback_without_outputs);
    if hardware.is_none() && fallback.is_none() {
        return Err(AdapterEnumError::NoAdaptersFound);
    }
    Ok(AdapterSet { hardware, fallback })
}

/// Attempts creation across the capability tiers in descending order; the
/// first tier that succeeds wins. Exhaustion reports the last error.
pub fn create_device_from_adapter(
    backend: &dyn PlatformBackend,
    adapter: &AdapterDescriptor,
    flags: DeviceCreateFlags,
) -> Result<CreatedDevice, DeviceCreateError> {
    let mut attempts: SmallVec<[(CapabilityTier, DeviceCreateError); 7]> = SmallVec::new();
    for tier in TIER_ATTEMPTS {
        match backend.create_device(adapter, tier, flags) {
            Ok(created) => {
                log::info!(
                    "created device on {} at {:?}",
                    adapter.name,
                    created.tier
                );
                return Ok(created);
            }
            Err(error) => {
                if !matches!(error, DeviceCreateError::TierUnsupported(_)) {
                    log::warn!(
                        "device creation on {} failed at {tier:?}: {error}",
                        adapter.name
                    );
                }
                attempts.push((tier, error));
            }
        }
    }
    let (_, last) = attempts.last().copied().expect("tier list is non-empty");
    log::warn!(
        "device creation exhausted every tier on {} ({} attempts)",
        adapter.name,
        attempts.len()
    );
    Err(last)
}

#[derive(Debug, Clone, Copy)]
pub struct DriverFailureConfig {
    /// Sliding window the failures must land in.
    pub window: Duration,
    /// Failures inside the window that trip the breaker.
    pub threshold: usize,
}

impl Default for DriverFailureConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            threshold: 5,
        }
    }
}

/// Circuit breaker against a bad driver: repeated low-level driver errors
/// inside a sliding window latch a fallback-only override for the rest of
/// the process. Latching is sticky, not a retry budget.
pub struct DriverFailureTracker {
    config: DriverFailureConfig,
    failures: Mutex<VecDeque<Instant>>,
    forced: AtomicBool,
}

impl DriverFailureTracker {
    pub fn new(config: DriverFailureConfig) -> Self {
        Self {
            config,
            failures: Mutex::new(VecDeque::new()),
            forced: AtomicBool::new(false),
        }
    }

    pub fn record_failure(&self, now: Instant) {
        if self.forced.load(Ordering::Relaxed) {
            return;
        }
        let mut failures = self.failures.lock().expect("failure tracker poisoned");
        failures.push_back(now);
        while let Some(&front) = failures.front() {
            if now.saturating_duration_since(front) > self.config.window {
                failures.pop_front();
            } else {
                break;
            }
        }
        if failures.len() >= self.config.threshold {
            self.forced.store(true, Ordering::Relaxed);
            log::warn!(
                "{} driver failures within {:?}; forcing the software fallback adapter",
                failures.len(),
                self.config.window
            );
        }
    }

    pub fn fallback_forced(&self) -> bool {
        self.forced.load(Ordering::Relaxed)
    }
}

impl Default for DriverFailureTracker {
    fn default() -> Self {
        Self::new(DriverFailureConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backend::{DeviceLost, SoftwareBackend, SoftwareBackendConfig};

    #[test]
    fn selects_hardware_and_fallback() {
        let backend = SoftwareBackend::new();
        let set = select_adapters(&backend).unwrap();
        assert!(set.hardware.is_some());
        assert!(set.fallback.is_some());
    }

    #[test]
    fn fallback_only_topology_selects_no_hardware() {
        let backend = SoftwareBackend::with_config(SoftwareBackendConfig {
            hardware_adapter: false,
            ..SoftwareBackendConfig::default()
        });
        let set = select_adapters(&backend).unwrap();
        assert!(set.hardware.is_none());
        assert!(set.fallback.is_some());
    }

    #[test]
    fn empty_topology_is_fatal() {
        let backend = SoftwareBackend::with_config(SoftwareBackendConfig {
            hardware_adapter: false,
            fallback_adapter: false,
            ..SoftwareBackendConfig::default()
        });
        assert_eq!(
            select_adapters(&backend).unwrap_err(),
            AdapterEnumError::NoAdaptersFound
        );
    }

    #[test]
    fn tier_walk_stops_at_first_success() {
        let backend = SoftwareBackend::new();
        backend.set_hardware_max_tier(CapabilityTier::Tier10_1);
        let set = select_adapters(&backend).unwrap();
        let adapter = set.hardware.unwrap();

        let created =
            create_device_from_adapter(&backend, &adapter, DeviceCreateFlags::default()).unwrap();
        // Tiers above the cap were rejected; the first supported tier wins
        // and lower ones are never tried.
        assert_eq!(created.tier, CapabilityTier::Tier10_1);
        assert_eq!(backend.counters().devices_created(), 1);
    }

    #[test]
    fn exhausted_tiers_report_last_error() {
        let backend = SoftwareBackend::new();
        backend.fail_hardware_creation(true);
        let set = select_adapters(&backend).unwrap();
        let adapter = set.hardware.unwrap();

        let err = create_device_from_adapter(&backend, &adapter, DeviceCreateFlags::default())
            .unwrap_err();
        assert_eq!(err, DeviceCreateError::InternalDriverError);
    }

    #[test]
    fn injected_loss_surfaces_as_device_lost() {
        let backend = SoftwareBackend::new();
        for _ in 0..TIER_ATTEMPTS.len() {
            backend.inject_create_error(DeviceCreateError::DeviceLost(DeviceLost::Removed));
        }
        let set = select_adapters(&backend).unwrap();
        let adapter = set.hardware.unwrap();

        let err = create_device_from_adapter(&backend, &adapter, DeviceCreateFlags::default())
            .unwrap_err();
        assert!(err.is_device_loss());
    }

    #[test]
    fn breaker_trips_inside_window() {
        let tracker = DriverFailureTracker::new(DriverFailureConfig {
            window: Duration::from_secs(10),
            threshold: 3,
        });
        let base = Instant::now();
        tracker.record_failure(base);
        tracker.record_failure(base + Duration::from_secs(1));
        assert!(!tracker.fallback_forced());
        tracker.record_failure(base + Duration::from_secs(2));
        assert!(tracker.fallback_forced());
    }

    #[test]
    fn spread_out_failures_do_not_trip() {
        let tracker = DriverFailureTracker::new(DriverFailureConfig {
            window: Duration::from_secs(10),
            threshold: 3,
        });
        let base = Instant::now();
        tracker.record_failure(base);
        tracker.record_failure(base + Duration::from_secs(20));
        tracker.record_failure(base + Duration::from_secs(40));
        assert!(!tracker.fallback_forced());
    }
}
