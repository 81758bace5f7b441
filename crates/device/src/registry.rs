//! Process-wide weak registration of the shared device instance.

use std::sync::{Arc, Mutex, OnceLock, Weak};

use backend::PlatformBackend;

use crate::instance::{DeviceConfig, DeviceInstance};
use crate::selector::{DriverFailureConfig, DriverFailureTracker};

/// Weak singleton registry. The shared instance is discoverable
/// process-wide without being kept alive; strong references live only in
/// device handles and the lifecycle manager's cache.
///
/// The registry's own lock is the outer half of the two-phase recovery
/// protocol and is never held across an instance-lock acquisition.
pub struct SharedInstanceRegistry {
    slot: Mutex<Weak<DeviceInstance>>,
    driver_failures: DriverFailureTracker,
}

impl SharedInstanceRegistry {
    pub fn new(config: DriverFailureConfig) -> Self {
        Self {
            slot: Mutex::new(Weak::new()),
            driver_failures: DriverFailureTracker::new(config),
        }
    }

    /// The process-global registry. Tests construct their own isolated
    /// registries instead.
    pub fn global() -> &'static Arc<SharedInstanceRegistry> {
        static GLOBAL: OnceLock<Arc<SharedInstanceRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(SharedInstanceRegistry::default()))
    }

    /// Returns the published shared instance, creating and publishing one
    /// when none is alive.
    pub fn acquire(
        self: &Arc<Self>,
        backend: Arc<dyn PlatformBackend>,
        config: DeviceConfig,
    ) -> Arc<DeviceInstance> {
        let mut slot = self.slot.lock().expect("registry lock poisoned");
        if let Some(existing) = slot.upgrade() {
            return existing;
        }
        let instance = DeviceInstance::new_shared(backend, config, Arc::clone(self));
        *slot = Arc::downgrade(&instance);
        instance
    }

    /// Creates a private instance that is never published (the video/media
    /// case).
    pub fn acquire_unique(
        self: &Arc<Self>,
        backend: Arc<dyn PlatformBackend>,
        config: DeviceConfig,
    ) -> Arc<DeviceInstance> {
        DeviceInstance::new_unique(backend, config, Arc::clone(self))
    }

    pub fn current(&self) -> Option<Arc<DeviceInstance>> {
        self.slot.lock().expect("registry lock poisoned").upgrade()
    }

    /// Compare-and-clear: clears the registration only when `instance` is
    /// still the published one. Returns whether this caller won and now
    /// owns the teardown.
    pub(crate) fn clear_if_current(&self, instance: *const DeviceInstance) -> bool {
        let mut slot = self.slot.lock().expect("registry lock poisoned");
        match slot.upgrade() {
            Some(current) if std::ptr::eq(Arc::as_ptr(&current), instance) => {
                *slot = Weak::new();
                true
            }
            _ => false,
        }
    }

    pub fn driver_failures(&self) -> &DriverFailureTracker {
        &self.driver_failures
    }
}

impl Default for SharedInstanceRegistry {
    fn default() -> Self {
        Self::new(DriverFailureConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backend::SoftwareBackend;

    #[test]
    fn shared_acquisition_reuses_published_instance() {
        let registry = Arc::new(SharedInstanceRegistry::default());
        let backend: Arc<dyn PlatformBackend> = Arc::new(SoftwareBackend::new());

        let first = registry.acquire(Arc::clone(&backend), DeviceConfig::default());
        let second = registry.acquire(Arc::clone(&backend), DeviceConfig::default());
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn unique_instances_are_never_published() {
        let registry = Arc::new(SharedInstanceRegistry::default());
        let backend: Arc<dyn PlatformBackend> = Arc::new(SoftwareBackend::new());

        let unique = registry.acquire_unique(Arc::clone(&backend), DeviceConfig::default());
        assert!(!unique.is_shared());
        assert!(registry.current().is_none());

        let shared = registry.acquire(Arc::clone(&backend), DeviceConfig::default());
        assert!(!Arc::ptr_eq(&unique, &shared));
    }

    #[test]
    fn dropping_last_strong_reference_empties_registry() {
        let registry = Arc::new(SharedInstanceRegistry::default());
        let backend: Arc<dyn PlatformBackend> = Arc::new(SoftwareBackend::new());

        let instance = registry.acquire(Arc::clone(&backend), DeviceConfig::default());
        assert!(registry.current().is_some());
        drop(instance);
        assert!(registry.current().is_none());
    }

    #[test]
    fn clear_if_current_resolves_the_race_once() {
        let registry = Arc::new(SharedInstanceRegistry::default());
        let backend: Arc<dyn PlatformBackend> = Arc::new(SoftwareBackend::new());

        let instance = registry.acquire(Arc::clone(&backend), DeviceConfig::default());
        let ptr = Arc::as_ptr(&instance);
        assert!(registry.clear_if_current(ptr));
        assert!(!registry.clear_if_current(ptr));
        assert!(registry.current().is_none());
    }
}
