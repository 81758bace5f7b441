//! Device lifecycle orchestration.
//!
//! [`DeviceLifecycleManager`] drives the availability state machine over
//! the shared device: background creation with a warm-up pass, loss
//! detection entry points for the UI/render threads, and cleanup ordering
//! with the composition-tree host.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use backend::{DeviceCreateError, DeviceLost, MonitorId, PlatformBackend, TextureMemoryUsage};
use crossbeam_channel::{Receiver, TryRecvError, bounded};
use device::{
    DeviceConfig, DeviceHandle, DeviceInstance, Ensure2dError, EnsureAdaptersError,
    EnsureDeviceError, SharedInstanceRegistry, SurfaceAllocError,
};

/// Perceived availability of the shared device, per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAvailability {
    Uninitialized,
    Creating,
    Ready,
    /// Lost and cleaned up; the next creation attempt is the only way back
    /// to `Ready`.
    Lost,
    /// Adapter enumeration found nothing at all. Not retried.
    Unrecoverable,
}

/// How much the composition-tree host should release during cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositionCleanup {
    Full { defer_interop_close: bool },
    GraphicsOnly,
}

/// The composition-tree host seam: releases device-derived visuals in the
/// ordering the cleanup caller chooses.
pub trait CompositionHost: Send + Sync {
    fn release_resources(&self, defer_interop_close: bool);
    fn release_graphics_resources(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationError {
    /// Fatal: no adapter of any kind exists.
    NoAdapters,
    /// Recoverable: retried after cleanup.
    DeviceLost(DeviceLost),
    /// Exhausted creation on every tier and adapter. Treated as fatal by
    /// convention; never silently recovered.
    Create(DeviceCreateError),
}

impl CreationError {
    pub fn is_recoverable(self) -> bool {
        matches!(self, CreationError::DeviceLost(_))
    }
}

impl fmt::Display for CreationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreationError::NoAdapters => write!(f, "no graphics adapters found"),
            CreationError::DeviceLost(lost) => write!(f, "{lost}"),
            CreationError::Create(error) => write!(f, "device creation failed: {error}"),
        }
    }
}

impl std::error::Error for CreationError {}

impl From<EnsureDeviceError> for CreationError {
    fn from(error: EnsureDeviceError) -> Self {
        match error {
            EnsureDeviceError::NoAdapters => CreationError::NoAdapters,
            EnsureDeviceError::Create(DeviceCreateError::DeviceLost(lost)) => {
                CreationError::DeviceLost(lost)
            }
            EnsureDeviceError::Create(other) => CreationError::Create(other),
        }
    }
}

impl From<Ensure2dError> for CreationError {
    fn from(error: Ensure2dError) -> Self {
        match error {
            Ensure2dError::DeviceLost(lost) => CreationError::DeviceLost(lost),
            Ensure2dError::Create(other) => CreationError::Create(other),
        }
    }
}

impl From<SurfaceAllocError> for CreationError {
    fn from(error: SurfaceAllocError) -> Self {
        match error {
            SurfaceAllocError::DeviceLost(lost) => CreationError::DeviceLost(lost),
            SurfaceAllocError::Create(other) => CreationError::Create(other),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DeviceManagerConfig {
    pub device: DeviceConfig,
    /// Age past which `trim` evicts pooled surfaces.
    pub pool_trim_age: Duration,
    /// Deferral before the background 2D-resource clear on suspend.
    pub scratch_release_delay: Duration,
}

impl Default for DeviceManagerConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            pool_trim_age: Duration::from_secs(5),
            scratch_release_delay: Duration::from_secs(1),
        }
    }
}

enum CreationState {
    Idle,
    Running {
        thread: JoinHandle<Result<Arc<DeviceInstance>, CreationError>>,
        done: Receiver<()>,
    },
    Finished(Result<(), CreationError>),
}

struct ManagerState {
    availability: DeviceAvailability,
    cached: Option<Arc<DeviceInstance>>,
    creation: CreationState,
}

/// Top-level orchestrator over the shared device's lifecycle.
pub struct DeviceLifecycleManager {
    backend: Arc<dyn PlatformBackend>,
    registry: Arc<SharedInstanceRegistry>,
    composition: Arc<dyn CompositionHost>,
    config: DeviceManagerConfig,
    inner: Mutex<ManagerState>,
}

impl DeviceLifecycleManager {
    pub fn new(
        backend: Arc<dyn PlatformBackend>,
        composition: Arc<dyn CompositionHost>,
        config: DeviceManagerConfig,
    ) -> Self {
        Self::with_registry(
            backend,
            Arc::clone(SharedInstanceRegistry::global()),
            composition,
            config,
        )
    }

    pub fn with_registry(
        backend: Arc<dyn PlatformBackend>,
        registry: Arc<SharedInstanceRegistry>,
        composition: Arc<dyn CompositionHost>,
        config: DeviceManagerConfig,
    ) -> Self {
        Self {
            backend,
            registry,
            composition,
            config,
            inner: Mutex::new(ManagerState {
                availability: DeviceAvailability::Uninitialized,
                cached: None,
                creation: CreationState::Idle,
            }),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, ManagerState> {
        self.inner.lock().expect("manager state lock poisoned")
    }

    pub fn availability(&self) -> DeviceAvailability {
        let mut inner = self.lock_inner();
        self.poll_creation_locked(&mut inner);
        inner.availability
    }

    /// Kicks off background device creation. Idempotent: a running or
    /// already-successful creation makes this a no-op, as does an
    /// unrecoverable enumeration failure. The spawned thread performs
    /// adapter selection, tiered creation, 2D-device creation, and the
    /// warm-up pass.
    pub fn start_resource_creation(&self) {
        let mut inner = self.lock_inner();
        self.poll_creation_locked(&mut inner);
        if matches!(inner.creation, CreationState::Running { .. }) {
            return;
        }
        match inner.availability {
            DeviceAvailability::Uninitialized | DeviceAvailability::Lost => {}
            DeviceAvailability::Ready
            | DeviceAvailability::Creating
            | DeviceAvailability::Unrecoverable => return,
        }

        let backend = Arc::clone(&self.backend);
        let registry = Arc::clone(&self.registry);
        let device_config = self.config.device;
        let (done_tx, done_rx) = bounded(1);
        let thread = thread::Builder::new()
            .name("device-creation".into())
            .spawn(move || {
                let result = create_and_warm(backend, registry, device_config);
                let _ = done_tx.send(());
                result
            })
            .expect("failed to spawn device-creation thread");

        // Recorded under the manager lock before the thread's completion
        // can race it.
        inner.creation = CreationState::Running {
            thread,
            done: done_rx,
        };
        inner.availability = DeviceAvailability::Creating;
    }

    fn poll_creation_locked(&self, inner: &mut ManagerState) {
        let finished = match &inner.creation {
            CreationState::Running { done, .. } => match done.try_recv() {
                Ok(()) => true,
                Err(TryRecvError::Disconnected) => true,
                Err(TryRecvError::Empty) => false,
            },
            _ => return,
        };
        if finished {
            self.finish_creation_locked(inner);
        }
    }

    fn finish_creation_locked(&self, inner: &mut ManagerState) {
        let CreationState::Running { thread, .. } =
            std::mem::replace(&mut inner.creation, CreationState::Idle)
        else {
            return;
        };
        let result = thread.join().expect("device-creation thread panicked");
        match result {
            Ok(instance) => {
                log::info!("background device creation complete");
                inner.cached = Some(instance);
                inner.availability = DeviceAvailability::Ready;
                inner.creation = CreationState::Finished(Ok(()));
            }
            Err(error) => {
                log::warn!("background device creation failed: {error}");
                inner.availability = if error.is_recoverable() {
                    DeviceAvailability::Lost
                } else {
                    DeviceAvailability::Unrecoverable
                };
                inner.creation = CreationState::Finished(Err(error));
            }
        }
    }

    /// True when no creation is in flight.
    pub fn is_creation_complete(&self) -> bool {
        let mut inner = self.lock_inner();
        self.poll_creation_locked(&mut inner);
        !matches!(inner.creation, CreationState::Running { .. })
    }

    /// Blocks until any in-flight creation finishes and returns the most
    /// recent creation's outcome. Bounded only by the driver's own call
    /// latency; there is no cancellation.
    pub fn wait_for_creation(&self) -> Result<(), CreationError> {
        let mut inner = self.lock_inner();
        if matches!(inner.creation, CreationState::Running { .. }) {
            self.finish_creation_locked(&mut inner);
        }
        match &inner.creation {
            CreationState::Finished(result) => *result,
            _ => Ok(()),
        }
    }

    /// Synchronous cleanup on the recovering UI thread: waits for in-flight
    /// creation, records the cached instance lost when `is_lost`, drops the
    /// cached strong reference, then has the composition host release its
    /// device-derived resources. Creation is not restarted here; the caller
    /// issues the next `start_resource_creation` once this returns.
    pub fn cleanup_cached_device_resources(&self, cleanup: CompositionCleanup, is_lost: bool) {
        let mut inner = self.lock_inner();
        if matches!(inner.creation, CreationState::Running { .. }) {
            self.finish_creation_locked(&mut inner);
        }

        let cached = inner.cached.take();
        if is_lost {
            if let Some(instance) = cached.as_ref() {
                instance.record_device_as_lost();
            }
        }
        // The strong reference drops before the composition host is asked
        // to release, so the host observes a fully drained device.
        drop(cached);

        match cleanup {
            CompositionCleanup::Full {
                defer_interop_close,
            } => self.composition.release_resources(defer_interop_close),
            CompositionCleanup::GraphicsOnly => self.composition.release_graphics_resources(),
        }

        inner.availability = if is_lost {
            DeviceAvailability::Lost
        } else {
            DeviceAvailability::Uninitialized
        };
        inner.creation = CreationState::Idle;
    }

    pub fn cached_instance(&self) -> Option<Arc<DeviceInstance>> {
        let mut inner = self.lock_inner();
        self.poll_creation_locked(&mut inner);
        inner.cached.clone()
    }

    /// Hands out a per-thread device handle; `allow_unique` requests a
    /// private, unpublished device (the video/media case).
    pub fn acquire_handle(&self, allow_unique: bool) -> DeviceHandle {
        if allow_unique {
            DeviceHandle::unique(&self.registry, Arc::clone(&self.backend), self.config.device)
        } else {
            DeviceHandle::shared(&self.registry, Arc::clone(&self.backend), self.config.device)
        }
    }

    /// Per-frame pool trim against the configured age cutoff. Returns the
    /// eviction count (at most one).
    pub fn trim(&self, now: Instant) -> usize {
        let inner = self.lock_inner();
        let Some(instance) = inner.cached.as_ref() else {
            return 0;
        };
        match now.checked_sub(self.config.pool_trim_age) {
            Some(cutoff) => instance.trim_pool(cutoff),
            None => 0,
        }
    }

    /// Suspend hook.
    pub fn release_scratch_resources(&self) -> Result<(), DeviceLost> {
        let instance = self.lock_inner().cached.clone();
        match instance {
            Some(instance) => instance.release_scratch_resources(self.config.scratch_release_delay),
            None => Ok(()),
        }
    }

    pub fn texture_memory_usage(&self) -> TextureMemoryUsage {
        self.lock_inner()
            .cached
            .as_ref()
            .map(|instance| instance.texture_memory_usage())
            .unwrap_or_default()
    }

    pub fn is_hdr_output(&self, monitor: MonitorId) -> Result<bool, EnsureAdaptersError> {
        let instance = self.lock_inner().cached.clone();
        match instance {
            Some(instance) => instance.is_hdr_output(monitor),
            None => Ok(false),
        }
    }
}

fn create_and_warm(
    backend: Arc<dyn PlatformBackend>,
    registry: Arc<SharedInstanceRegistry>,
    config: DeviceConfig,
) -> Result<Arc<DeviceInstance>, CreationError> {
    let instance = registry.acquire(backend, config);
    instance.ensure_resources()?;
    instance.ensure_2d_resources()?;
    instance.warm_up()?;
    Ok(instance)
}

#[cfg(test)]
mod tests;
