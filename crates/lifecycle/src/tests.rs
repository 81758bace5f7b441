//! Manager state-machine and cleanup-ordering tests.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use backend::{
    DeviceCreateError, DeviceLost, MonitorId, SoftwareBackend, SoftwareBackendConfig,
    SoftwareCounters,
};
use device::SharedInstanceRegistry;

use crate::{
    CompositionCleanup, CompositionHost, CreationError, DeviceAvailability, DeviceLifecycleManager,
    DeviceManagerConfig,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostEvent {
    Full { defer: bool, devices_live: u64 },
    GraphicsOnly { devices_live: u64 },
}

/// Recording composition host. Captures the live-device count at call time
/// so tests can prove the device was drained before the host was asked to
/// release.
struct MockHost {
    events: Mutex<Vec<HostEvent>>,
    counters: Arc<SoftwareCounters>,
}

impl MockHost {
    fn new(counters: Arc<SoftwareCounters>) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            counters,
        }
    }

    fn events(&self) -> Vec<HostEvent> {
        self.events.lock().expect("mock host poisoned").clone()
    }
}

impl CompositionHost for MockHost {
    fn release_resources(&self, defer_interop_close: bool) {
        self.events.lock().expect("mock host poisoned").push(HostEvent::Full {
            defer: defer_interop_close,
            devices_live: self.counters.devices_live(),
        });
    }

    fn release_graphics_resources(&self) {
        self.events
            .lock()
            .expect("mock host poisoned")
            .push(HostEvent::GraphicsOnly {
                devices_live: self.counters.devices_live(),
            });
    }
}

fn manager_with(backend: &SoftwareBackend) -> (Arc<DeviceLifecycleManager>, Arc<MockHost>) {
    let host = Arc::new(MockHost::new(backend.counters()));
    let registry = Arc::new(SharedInstanceRegistry::default());
    let manager = Arc::new(DeviceLifecycleManager::with_registry(
        Arc::new(backend.clone()),
        registry,
        Arc::clone(&host) as Arc<dyn CompositionHost>,
        DeviceManagerConfig::default(),
    ));
    (manager, host)
}

fn make_ready(manager: &DeviceLifecycleManager) {
    manager.start_resource_creation();
    manager.wait_for_creation().expect("creation succeeds");
    assert_eq!(manager.availability(), DeviceAvailability::Ready);
}

#[test]
fn creation_runs_once_despite_repeated_starts() {
    let backend = SoftwareBackend::new();
    let (manager, _host) = manager_with(&backend);

    manager.start_resource_creation();
    manager.start_resource_creation();
    manager.wait_for_creation().unwrap();
    manager.start_resource_creation();

    assert_eq!(manager.availability(), DeviceAvailability::Ready);
    assert_eq!(backend.counters().devices_created(), 1);
    let instance = manager.cached_instance().expect("cached instance");
    assert!(instance.tier().is_some());
    // The warm-up pass ran on the creation thread.
    assert_eq!(backend.counters().flushes(), 1);
}

#[test]
fn waiters_on_other_threads_observe_completion() {
    let backend = SoftwareBackend::new();
    let (manager, _host) = manager_with(&backend);
    manager.start_resource_creation();

    let mut waiters = Vec::new();
    for _ in 0..2 {
        let manager = Arc::clone(&manager);
        waiters.push(thread::spawn(move || manager.wait_for_creation()));
    }
    for waiter in waiters {
        waiter.join().expect("waiter panicked").unwrap();
    }
    assert!(manager.is_creation_complete());
    assert_eq!(manager.availability(), DeviceAvailability::Ready);
}

#[test]
fn loss_cleanup_drains_before_the_host_releases() {
    let backend = SoftwareBackend::new();
    let (manager, host) = manager_with(&backend);
    make_ready(&manager);
    assert_eq!(backend.counters().devices_live(), 1);

    backend.remove_live_devices(DeviceLost::Removed);
    manager.cleanup_cached_device_resources(
        CompositionCleanup::Full {
            defer_interop_close: true,
        },
        true,
    );

    assert_eq!(manager.availability(), DeviceAvailability::Lost);
    assert!(manager.cached_instance().is_none());
    assert_eq!(
        host.events(),
        vec![HostEvent::Full {
            defer: true,
            devices_live: 0
        }]
    );

    // Only the next creation returns to Ready, on a fresh instance.
    manager.start_resource_creation();
    manager.wait_for_creation().unwrap();
    assert_eq!(manager.availability(), DeviceAvailability::Ready);
    assert_eq!(backend.counters().devices_created(), 2);
}

#[test]
fn graphics_only_cleanup_skips_interop_teardown() {
    let backend = SoftwareBackend::new();
    let (manager, host) = manager_with(&backend);
    make_ready(&manager);

    manager.cleanup_cached_device_resources(CompositionCleanup::GraphicsOnly, false);
    assert_eq!(manager.availability(), DeviceAvailability::Uninitialized);
    assert_eq!(host.events(), vec![HostEvent::GraphicsOnly { devices_live: 0 }]);
}

#[test]
fn cleanup_waits_for_inflight_creation() {
    let backend = SoftwareBackend::new();
    let (manager, host) = manager_with(&backend);

    manager.start_resource_creation();
    // No explicit wait: cleanup joins the creation thread itself.
    manager.cleanup_cached_device_resources(CompositionCleanup::GraphicsOnly, false);

    assert!(manager.is_creation_complete());
    assert!(manager.cached_instance().is_none());
    assert_eq!(host.events().len(), 1);
    assert_eq!(backend.counters().devices_live(), 0);
}

#[test]
fn empty_topology_is_unrecoverable() {
    let backend = SoftwareBackend::with_config(SoftwareBackendConfig {
        hardware_adapter: false,
        fallback_adapter: false,
        ..SoftwareBackendConfig::default()
    });
    let (manager, _host) = manager_with(&backend);

    manager.start_resource_creation();
    assert_eq!(
        manager.wait_for_creation().unwrap_err(),
        CreationError::NoAdapters
    );
    assert_eq!(manager.availability(), DeviceAvailability::Unrecoverable);

    // Unrecoverable is terminal: starts are no-ops.
    manager.start_resource_creation();
    assert_eq!(manager.availability(), DeviceAvailability::Unrecoverable);
}

#[test]
fn device_loss_during_creation_stays_retryable() {
    let backend = SoftwareBackend::new();
    let (manager, _host) = manager_with(&backend);
    // Every tier attempt on both adapters reports a loss.
    for _ in 0..14 {
        backend.inject_create_error(DeviceCreateError::DeviceLost(DeviceLost::Removed));
    }

    manager.start_resource_creation();
    let err = manager.wait_for_creation().unwrap_err();
    assert!(err.is_recoverable());
    assert_eq!(manager.availability(), DeviceAvailability::Lost);

    // The retry succeeds once the injected faults are gone.
    manager.start_resource_creation();
    manager.wait_for_creation().unwrap();
    assert_eq!(manager.availability(), DeviceAvailability::Ready);
}

#[test]
fn exhausted_creation_is_fatal() {
    let backend = SoftwareBackend::new();
    backend.fail_hardware_creation(true);
    backend.fail_fallback_creation(true);
    let (manager, _host) = manager_with(&backend);

    manager.start_resource_creation();
    let err = manager.wait_for_creation().unwrap_err();
    assert!(matches!(err, CreationError::Create(_)));
    assert!(!err.is_recoverable());
    assert_eq!(manager.availability(), DeviceAvailability::Unrecoverable);
}

#[test]
fn per_frame_trim_uses_the_configured_age() {
    let backend = SoftwareBackend::new();
    let (manager, _host) = manager_with(&backend);
    make_ready(&manager);
    let instance = manager.cached_instance().unwrap();
    // The warm-up surface sits in the pool.
    assert_eq!(instance.pooled_surface_count(), 1);

    assert_eq!(manager.trim(Instant::now()), 0);
    let later = Instant::now() + DeviceManagerConfig::default().pool_trim_age
        + Duration::from_secs(1);
    assert_eq!(manager.trim(later), 1);
    assert_eq!(manager.trim(later), 0);
    assert_eq!(instance.pooled_surface_count(), 0);
}

#[test]
fn shared_handles_attach_to_the_cached_instance() {
    let backend = SoftwareBackend::new();
    let (manager, _host) = manager_with(&backend);
    make_ready(&manager);
    let cached = manager.cached_instance().unwrap();

    let shared = manager.acquire_handle(false);
    assert!(Arc::ptr_eq(shared.instance(), &cached));

    let unique = manager.acquire_handle(true);
    assert!(!Arc::ptr_eq(unique.instance(), &cached));
    assert!(!unique.instance().is_shared());
}

#[test]
fn passthrough_queries_use_the_cached_instance() {
    let backend = SoftwareBackend::new();
    let (manager, _host) = manager_with(&backend);
    assert_eq!(manager.texture_memory_usage(), Default::default());
    assert_eq!(manager.is_hdr_output(MonitorId(3)), Ok(false));

    make_ready(&manager);
    backend.set_hdr_monitor(MonitorId(3), true);
    assert_eq!(manager.is_hdr_output(MonitorId(3)), Ok(true));
    // The pooled warm-up surface shows up in the usage totals.
    assert_eq!(manager.texture_memory_usage().pooled_surfaces, 1);
}

#[test]
fn suspend_releases_scratch_resources() {
    let backend = SoftwareBackend::new();
    let registry = Arc::new(SharedInstanceRegistry::default());
    let host = Arc::new(MockHost::new(backend.counters()));
    let manager = DeviceLifecycleManager::with_registry(
        Arc::new(backend.clone()),
        registry,
        Arc::clone(&host) as Arc<dyn CompositionHost>,
        DeviceManagerConfig {
            scratch_release_delay: Duration::ZERO,
            ..DeviceManagerConfig::default()
        },
    );
    make_ready(&manager);

    manager.release_scratch_resources().unwrap();
    let instance = manager.cached_instance().unwrap();
    assert_eq!(instance.pooled_surface_count(), 0);
    assert_eq!(backend.counters().driver_trims(), 1);
    assert_eq!(backend.counters().clear_resources_calls(), 1);
}
