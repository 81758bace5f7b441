//! The shared device instance and its lock/device-lost protocol.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use backend::{
    AdapterIdentity, AdapterKind, CapabilityTier, Context2d, CreatedDevice, DeviceCreateError,
    DeviceCreateFlags, DeviceLost, MonitorId, Native2dDevice, NativeContext, NativeDevice,
    PixelFormat, PlatformBackend, SolidBrush2d, StagingBuffer, TextureMemoryUsage, fill_bgra8,
};
use slotmap::{SecondaryMap, SlotMap, new_key_type};

use crate::pool::{SurfaceAllocError, SurfacePool};
use crate::registry::SharedInstanceRegistry;
use crate::selector::{self, AdapterSet};

new_key_type! {
    /// Identity of one device handle, used to key its derived 2D resources.
    pub struct DeviceHandleKey;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceConfig {
    pub create_flags: DeviceCreateFlags,
    /// Skip the hardware adapter even when one is present.
    pub force_fallback: bool,
}

/// Properties of the achieved device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstanceFlags {
    pub is_software_fallback: bool,
    /// A hardware adapter exists in the topology, whether or not it was
    /// used.
    pub is_hardware_output: bool,
    /// The achieved tier cannot upload straight into shared surfaces.
    pub uses_intermediate_upload: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureDeviceError {
    /// No adapter of any kind exists. Fatal, not retried.
    NoAdapters,
    Create(DeviceCreateError),
}

impl fmt::Display for EnsureDeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnsureDeviceError::NoAdapters => write!(f, "no graphics adapters found"),
            EnsureDeviceError::Create(error) => write!(f, "device creation failed: {error}"),
        }
    }
}

impl std::error::Error for EnsureDeviceError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureAdaptersError {
    NoAdapters,
    DeviceLost(DeviceLost),
}

impl fmt::Display for EnsureAdaptersError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnsureAdaptersError::NoAdapters => write!(f, "no graphics adapters found"),
            EnsureAdaptersError::DeviceLost(lost) => write!(f, "{lost}"),
        }
    }
}

impl std::error::Error for EnsureAdaptersError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ensure2dError {
    DeviceLost(DeviceLost),
    Create(DeviceCreateError),
}

impl fmt::Display for Ensure2dError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ensure2dError::DeviceLost(lost) => write!(f, "{lost}"),
            Ensure2dError::Create(error) => write!(f, "2d resource creation failed: {error}"),
        }
    }
}

impl std::error::Error for Ensure2dError {}

impl From<DeviceCreateError> for Ensure2dError {
    fn from(error: DeviceCreateError) -> Self {
        match error {
            DeviceCreateError::DeviceLost(lost) => Ensure2dError::DeviceLost(lost),
            other => Ensure2dError::Create(other),
        }
    }
}

struct DeviceResources {
    device: Box<dyn NativeDevice>,
    context: Box<dyn NativeContext>,
    tier: CapabilityTier,
}

struct ThreadResources {
    context: Box<dyn Context2d>,
    brush: Box<dyn SolidBrush2d>,
}

struct DeviceState {
    resources: Option<DeviceResources>,
    device_2d: Option<Box<dyn Native2dDevice>>,
    adapters: Option<AdapterSet>,
    handles: SlotMap<DeviceHandleKey, ()>,
    thread_resources: SecondaryMap<DeviceHandleKey, ThreadResources>,
    pool: SurfacePool,
    flags: InstanceFlags,
    lost_released: bool,
}

/// The process-shared device wrapper.
///
/// One mutex serializes every field except the write-once adapter identity
/// and the self-resetting test override. Callers follow the
/// lock → check → use → unlock discipline through
/// [`DeviceInstance::take_lock_and_check_lost`].
pub struct DeviceInstance {
    backend: Arc<dyn PlatformBackend>,
    registry: Arc<SharedInstanceRegistry>,
    config: DeviceConfig,
    shared: bool,
    adapter_identity: OnceLock<AdapterIdentity>,
    test_force_lost: AtomicBool,
    state: Mutex<DeviceState>,
}

/// Proof the instance mutex is held. Not storable beyond the acquiring
/// scope; every loss-sensitive accessor takes it by reference.
pub struct SharedDeviceGuard<'a> {
    state: MutexGuard<'a, DeviceState>,
    owner: *const DeviceInstance,
}

/// Context access under the dual-lock discipline: the instance mutex is
/// held through the guard borrow, the 2D device's internal lock is held for
/// this wrapper's lifetime and released on drop. Fixed order, instance
/// mutex outer.
pub struct LockedDeviceContext<'a> {
    context: &'a dyn NativeContext,
    lock_2d: Option<&'a dyn Native2dDevice>,
}

impl LockedDeviceContext<'_> {
    pub fn context(&self) -> &dyn NativeContext {
        self.context
    }

    pub fn flush(&self) {
        self.context.flush();
    }
}

impl Drop for LockedDeviceContext<'_> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock_2d {
            lock.leave_lock();
        }
    }
}

enum AdapterRefresh {
    Current,
    DeviceLost(DeviceLost),
    /// The topology changed and a probe creation on the new adapter
    /// succeeded; the live device must be recorded lost.
    StaleDevice,
}

impl DeviceInstance {
    fn new(
        backend: Arc<dyn PlatformBackend>,
        config: DeviceConfig,
        registry: Arc<SharedInstanceRegistry>,
        shared: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            registry,
            config,
            shared,
            adapter_identity: OnceLock::new(),
            test_force_lost: AtomicBool::new(false),
            state: Mutex::new(DeviceState {
                resources: None,
                device_2d: None,
                adapters: None,
                handles: SlotMap::with_key(),
                thread_resources: SecondaryMap::new(),
                pool: SurfacePool::new(),
                flags: InstanceFlags::default(),
                lost_released: false,
            }),
        })
    }

    pub(crate) fn new_shared(
        backend: Arc<dyn PlatformBackend>,
        config: DeviceConfig,
        registry: Arc<SharedInstanceRegistry>,
    ) -> Arc<Self> {
        Self::new(backend, config, registry, true)
    }

    pub(crate) fn new_unique(
        backend: Arc<dyn PlatformBackend>,
        config: DeviceConfig,
        registry: Arc<SharedInstanceRegistry>,
    ) -> Arc<Self> {
        Self::new(backend, config, registry, false)
    }

    fn lock_state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().expect("device state lock poisoned")
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn flags(&self) -> InstanceFlags {
        self.lock_state().flags
    }

    pub fn tier(&self) -> Option<CapabilityTier> {
        self.lock_state().resources.as_ref().map(|r| r.tier)
    }

    /// Write-once; readable from any thread without the lock.
    pub fn adapter_identity(&self) -> Option<AdapterIdentity> {
        self.adapter_identity.get().copied()
    }

    /// The single mandatory gate before any device access: acquires the
    /// mutex and fails when the device is lost. On failure the caller must
    /// stop and drop the guard without touching the device.
    pub fn take_lock_and_check_lost(&self) -> Result<SharedDeviceGuard<'_>, DeviceLost> {
        let state = self.lock_state();
        if let Some(lost) = self.lost_reason_locked(&state) {
            return Err(lost);
        }
        Ok(SharedDeviceGuard {
            state,
            owner: self as *const DeviceInstance,
        })
    }

    fn lost_reason_locked(&self, state: &DeviceState) -> Option<DeviceLost> {
        // The test override resets itself on observation.
        if self.test_force_lost.swap(false, Ordering::Relaxed) {
            return Some(DeviceLost::Removed);
        }
        if state.lost_released {
            return Some(DeviceLost::Removed);
        }
        state
            .resources
            .as_ref()
            .and_then(|r| r.device.removed_reason())
    }

    pub fn is_device_lost(&self) -> bool {
        self.lost_reason_locked(&self.lock_state()).is_some()
    }

    /// Forces the next loss check to report the device removed.
    /// Self-resetting; exists to exercise the recovery path
    /// deterministically.
    pub fn force_device_lost(&self) {
        self.test_force_lost.store(true, Ordering::Relaxed);
    }

    pub fn is_device_lost_test_override(&self) -> bool {
        self.test_force_lost.load(Ordering::Relaxed)
    }

    fn ensure_lock_taken(&self, guard: &SharedDeviceGuard<'_>) {
        assert!(
            std::ptr::eq(guard.owner, self),
            "lock guard belongs to a different device instance"
        );
    }

    /// The native 3D device. Loss was already checked when the guard was
    /// taken; a missing device here is a caller bug.
    pub fn device<'g>(&self, guard: &'g SharedDeviceGuard<'_>) -> &'g dyn NativeDevice {
        self.ensure_lock_taken(guard);
        guard
            .state
            .resources
            .as_ref()
            .expect("device accessed after release")
            .device
            .as_ref()
    }

    pub fn device_2d<'g>(&self, guard: &'g SharedDeviceGuard<'_>) -> &'g dyn Native2dDevice {
        self.ensure_lock_taken(guard);
        guard
            .state
            .device_2d
            .as_deref()
            .expect("2d device accessed before creation or after release")
    }

    pub fn thread_context<'g>(
        &self,
        guard: &'g SharedDeviceGuard<'_>,
        key: DeviceHandleKey,
    ) -> Option<&'g dyn Context2d> {
        self.ensure_lock_taken(guard);
        guard
            .state
            .thread_resources
            .get(key)
            .map(|r| r.context.as_ref())
    }

    pub fn solid_brush<'g>(
        &self,
        guard: &'g SharedDeviceGuard<'_>,
        key: DeviceHandleKey,
    ) -> Option<&'g dyn SolidBrush2d> {
        self.ensure_lock_taken(guard);
        guard
            .state
            .thread_resources
            .get(key)
            .map(|r| r.brush.as_ref())
    }

    /// Enters the 2D device's internal lock (when a 2D device exists) and
    /// hands out the context under both locks.
    pub fn context_locked<'g>(&self, guard: &'g SharedDeviceGuard<'_>) -> LockedDeviceContext<'g> {
        self.ensure_lock_taken(guard);
        let resources = guard
            .state
            .resources
            .as_ref()
            .expect("device context accessed after release");
        let lock_2d = guard.state.device_2d.as_deref();
        if let Some(lock) = lock_2d {
            lock.enter_lock();
        }
        LockedDeviceContext {
            context: resources.context.as_ref(),
            lock_2d,
        }
    }

    fn ensure_adapters_locked(&self, state: &mut DeviceState) -> Result<(), EnsureDeviceError> {
        if state.adapters.is_none() || !self.backend.is_adapter_list_current() {
            let adapters = selector::select_adapters(self.backend.as_ref())
                .map_err(|_| EnsureDeviceError::NoAdapters)?;
            state.adapters = Some(adapters);
        }
        Ok(())
    }

    fn fallback_forced(&self) -> bool {
        self.config.force_fallback || self.registry.driver_failures().fallback_forced()
    }

    fn note_create_failure(&self, error: DeviceCreateError) {
        if error == DeviceCreateError::InternalDriverError {
            self.registry.driver_failures().record_failure(Instant::now());
        }
    }

    /// Idempotent device creation: adapter selection, then tiered creation
    /// on the hardware adapter with fallback to the software adapter. A
    /// lost-and-released instance is never rehydrated; it stays empty and
    /// callers discover the loss through [`DeviceInstance::take_lock_and_check_lost`].
    pub fn ensure_resources(&self) -> Result<(), EnsureDeviceError> {
        let mut state = self.lock_state();
        if state.resources.is_some() || state.lost_released {
            return Ok(());
        }

        let mut last_error = None;
        for _attempt in 0..2 {
            self.ensure_adapters_locked(&mut state)?;
            let adapters = state.adapters.clone().expect("adapters ensured above");

            if !self.fallback_forced() {
                if let Some(hardware) = adapters.hardware.as_ref() {
                    let flags = DeviceCreateFlags {
                        prefer_fallback: false,
                        ..self.config.create_flags
                    };
                    match selector::create_device_from_adapter(
                        self.backend.as_ref(),
                        hardware,
                        flags,
                    ) {
                        Ok(created) => {
                            self.install_device_locked(&mut state, created, &adapters, false);
                            return Ok(());
                        }
                        Err(error) => {
                            self.note_create_failure(error);
                            last_error = Some(error);
                        }
                    }
                }
            }

            if let Some(fallback) = adapters.fallback.as_ref() {
                let flags = DeviceCreateFlags {
                    prefer_fallback: true,
                    ..self.config.create_flags
                };
                match selector::create_device_from_adapter(self.backend.as_ref(), fallback, flags)
                {
                    Ok(created) => {
                        self.install_device_locked(&mut state, created, &adapters, true);
                        return Ok(());
                    }
                    Err(error) => {
                        self.note_create_failure(error);
                        last_error = Some(error);
                    }
                }
            }

            if self.backend.is_adapter_list_current() {
                break;
            }
            // The topology changed mid-creation; retry once against the
            // fresh adapter list.
            state.adapters = None;
        }

        // No error means every adapter was excluded by the fallback
        // override. Adapters exist, so this is a driver-class failure,
        // not an empty topology.
        match last_error {
            Some(error) => Err(EnsureDeviceError::Create(error)),
            None => Err(EnsureDeviceError::Create(DeviceCreateError::InternalDriverError)),
        }
    }

    fn install_device_locked(
        &self,
        state: &mut DeviceState,
        created: CreatedDevice,
        adapters: &AdapterSet,
        is_fallback: bool,
    ) {
        let identity = created.device.adapter_identity();
        let _ = self.adapter_identity.set(identity);
        state.flags = InstanceFlags {
            is_software_fallback: is_fallback,
            is_hardware_output: adapters.hardware.is_some(),
            uses_intermediate_upload: !is_fallback && !created.tier.supports_direct_upload(),
        };
        log::info!(
            "graphics device ready: tier {:?}, fallback {}, adapter {:#x}",
            created.tier,
            is_fallback,
            identity.raw()
        );
        state.resources = Some(DeviceResources {
            device: created.device,
            context: created.context,
            tier: created.tier,
        });
    }

    /// Re-enumerates adapters when the platform reports the list stale. A
    /// topology change under a live device is the stale-device condition
    /// and takes the same recovery path as an explicit loss signal.
    pub fn ensure_adapters_current(&self) -> Result<(), EnsureAdaptersError> {
        let refresh = {
            let mut state = self.lock_state();
            self.refresh_adapters_locked(&mut state)?
        };
        match refresh {
            AdapterRefresh::Current => Ok(()),
            AdapterRefresh::DeviceLost(lost) => Err(EnsureAdaptersError::DeviceLost(lost)),
            AdapterRefresh::StaleDevice => {
                self.record_device_as_lost();
                Err(EnsureAdaptersError::DeviceLost(DeviceLost::Reset))
            }
        }
    }

    fn refresh_adapters_locked(
        &self,
        state: &mut DeviceState,
    ) -> Result<AdapterRefresh, EnsureAdaptersError> {
        if state.adapters.is_some() && self.backend.is_adapter_list_current() {
            return Ok(AdapterRefresh::Current);
        }
        let adapters = selector::select_adapters(self.backend.as_ref())
            .map_err(|_| EnsureAdaptersError::NoAdapters)?;
        state.adapters = Some(adapters.clone());

        let Some(resources) = state.resources.as_ref() else {
            return Ok(AdapterRefresh::Current);
        };
        if let Some(lost) = resources.device.removed_reason() {
            return Ok(AdapterRefresh::DeviceLost(lost));
        }
        if self.shared && !self.is_current_shared_instance() {
            // A replacement instance was already published.
            return Ok(AdapterRefresh::DeviceLost(DeviceLost::Reset));
        }

        let chosen = if self.fallback_forced() {
            adapters.fallback.as_ref()
        } else {
            adapters.hardware.as_ref().or(adapters.fallback.as_ref())
        };
        let Some(chosen) = chosen else {
            return Ok(AdapterRefresh::Current);
        };
        if Some(chosen.identity) == self.adapter_identity() {
            return Ok(AdapterRefresh::Current);
        }

        // The topology now prefers a different adapter. Only a successful
        // probe creation proves the new adapter works; the probe device is
        // discarded and a probe failure keeps the current device in
        // service.
        let flags = DeviceCreateFlags {
            prefer_fallback: chosen.kind() == AdapterKind::SoftwareFallback,
            ..self.config.create_flags
        };
        match selector::create_device_from_adapter(self.backend.as_ref(), chosen, flags) {
            Ok(_probe) => {
                log::info!("adapter topology changed; current device is stale");
                Ok(AdapterRefresh::StaleDevice)
            }
            Err(error) => {
                log::debug!("stale-device probe failed ({error}); keeping current device");
                Ok(AdapterRefresh::Current)
            }
        }
    }

    /// The recovery entry point. Two phases, two locks, never nested: the
    /// registry lock resolves which thread owns the teardown by
    /// compare-and-clearing the published weak registration; only the
    /// winner then takes the instance lock and releases every native
    /// resource. Losers no-op.
    pub fn record_device_as_lost(&self) {
        if !self.shared {
            // No registry entry to race over; the caller owns this
            // instance outright.
            self.release_resources_on_device_lost();
            return;
        }
        if self
            .registry
            .clear_if_current(self as *const DeviceInstance)
        {
            self.release_resources_on_device_lost();
            log::info!("shared graphics device torn down after loss");
        } else {
            log::debug!("device loss already handled elsewhere");
        }
    }

    fn release_resources_on_device_lost(&self) {
        let mut state = self.lock_state();
        state.thread_resources.clear();
        state.device_2d = None;
        state.resources = None;
        state.pool.clear();
        state.lost_released = true;
    }

    pub fn ensure_2d_resources(&self) -> Result<(), Ensure2dError> {
        let mut state = self.lock_state();
        self.ensure_2d_locked(&mut state)
    }

    fn ensure_2d_locked(&self, state: &mut DeviceState) -> Result<(), Ensure2dError> {
        if let Some(lost) = self.lost_reason_locked(state) {
            return Err(Ensure2dError::DeviceLost(lost));
        }
        if state.device_2d.is_some() {
            return Ok(());
        }
        let resources = state
            .resources
            .as_ref()
            .expect("2d resources requested before device creation");
        let device_2d = self.backend.create_2d_device(resources.device.as_ref())?;
        state.device_2d = Some(device_2d);
        Ok(())
    }

    /// Lazily creates the derived 2D context and brush for one handle.
    pub fn ensure_thread_resources(&self, key: DeviceHandleKey) -> Result<(), Ensure2dError> {
        let mut state = self.lock_state();
        self.ensure_2d_locked(&mut state)?;
        if state.thread_resources.contains_key(key) {
            return Ok(());
        }
        assert!(state.handles.contains_key(key), "unknown device handle");
        let device_2d = state.device_2d.as_ref().expect("2d device ensured above");
        let (context, brush) = device_2d.create_thread_context()?;
        state
            .thread_resources
            .insert(key, ThreadResources { context, brush });
        Ok(())
    }

    pub(crate) fn register_handle(&self) -> DeviceHandleKey {
        self.lock_state().handles.insert(())
    }

    pub(crate) fn unregister_handle(&self, key: DeviceHandleKey) {
        let mut state = self.lock_state();
        state.thread_resources.remove(key);
        state.handles.remove(key);
    }

    /// Pool-backed staging allocation. Driver-visible requests are gated on
    /// a loss check; heap requests always succeed.
    pub fn allocate_surface(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        prefer_heap: bool,
    ) -> Result<Box<dyn StagingBuffer>, SurfaceAllocError> {
        let mut state = self.lock_state();
        if !prefer_heap {
            if let Some(lost) = self.lost_reason_locked(&state) {
                return Err(SurfaceAllocError::DeviceLost(lost));
            }
        }
        let state = &mut *state;
        let device = state.resources.as_ref().map(|r| r.device.as_ref());
        state.pool.allocate(width, height, format, prefer_heap, device)
    }

    pub fn release_surface(&self, buffer: Box<dyn StagingBuffer>) {
        self.lock_state().pool.release(buffer, Instant::now());
    }

    /// Evicts at most one pooled surface older than `cutoff`. Called once
    /// per frame.
    pub fn trim_pool(&self, cutoff: Instant) -> usize {
        self.lock_state().pool.trim(cutoff)
    }

    pub fn pooled_surface_count(&self) -> usize {
        self.lock_state().pool.len()
    }

    pub fn texture_memory_usage(&self) -> TextureMemoryUsage {
        let state = self.lock_state();
        let device_usage = state
            .resources
            .as_ref()
            .map(|r| r.device.texture_memory_usage())
            .unwrap_or_default();
        device_usage.combined(state.pool.usage())
    }

    /// One-time startup pass: a staging allocation, an upload fill, and a
    /// context flush, so the first real frame does not pay those costs.
    pub fn warm_up(&self) -> Result<(), SurfaceAllocError> {
        const WARM_UP_EXTENT: u32 = 32;
        let mut buffer =
            self.allocate_surface(WARM_UP_EXTENT, WARM_UP_EXTENT, PixelFormat::Bgra8, false)?;
        fill_bgra8(buffer.bytes_mut(), [0, 0, 0, 0xff]);
        {
            let guard = self
                .take_lock_and_check_lost()
                .map_err(SurfaceAllocError::DeviceLost)?;
            let locked = self.context_locked(&guard);
            locked.flush();
        }
        self.release_surface(buffer);
        Ok(())
    }

    /// Suspend-time release: drops pooled surfaces, trims driver scratch
    /// memory under the dual-lock discipline, and clears cached 2D
    /// resources. For shared instances the 2D clear is deferred to a
    /// short-lived background thread that first re-checks this instance is
    /// still the published one; a zero delay clears inline.
    pub fn release_scratch_resources(self: &Arc<Self>, delay: Duration) -> Result<(), DeviceLost> {
        let (has_device, has_2d) = {
            let mut state = self.lock_state();
            state.pool.clear();
            (state.resources.is_some(), state.device_2d.is_some())
        };

        if has_device {
            let guard = self.take_lock_and_check_lost()?;
            let locked = self.context_locked(&guard);
            self.device(&guard).trim();
            drop(locked);
        }

        if has_2d {
            if !self.shared || delay.is_zero() {
                self.clear_2d_resources(delay);
            } else {
                let instance = Arc::clone(self);
                thread::Builder::new()
                    .name("device-scratch-release".into())
                    .spawn(move || {
                        thread::sleep(delay);
                        // A replacement published meanwhile owns its own
                        // resources; only clear when still current.
                        if instance.is_current_shared_instance() {
                            instance.clear_2d_resources(delay);
                        }
                    })
                    .expect("failed to spawn device-scratch-release thread");
            }
        }
        Ok(())
    }

    fn clear_2d_resources(&self, max_age: Duration) {
        let state = self.lock_state();
        if let Some(device_2d) = state.device_2d.as_ref() {
            device_2d.clear_resources(max_age.as_millis() as u64);
        }
    }

    fn is_current_shared_instance(&self) -> bool {
        self.registry
            .current()
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(&current), self))
    }

    /// Monitor HDR capability, consulted when selecting render formats.
    /// Goes through the adapter staleness check first, so a topology change
    /// surfaces here as a device loss.
    pub fn is_hdr_output(&self, monitor: MonitorId) -> Result<bool, EnsureAdaptersError> {
        self.ensure_adapters_current()?;
        Ok(self.backend.is_hdr_output(monitor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SharedInstanceRegistry;
    use backend::SoftwareBackend;

    fn shared_instance(backend: &SoftwareBackend) -> Arc<DeviceInstance> {
        let registry = Arc::new(SharedInstanceRegistry::default());
        registry.acquire(Arc::new(backend.clone()), DeviceConfig::default())
    }

    #[test]
    fn ensure_resources_is_idempotent() {
        let backend = SoftwareBackend::new();
        let instance = shared_instance(&backend);
        instance.ensure_resources().unwrap();
        instance.ensure_resources().unwrap();
        assert_eq!(backend.counters().devices_created(), 1);
        assert!(instance.tier().is_some());
    }

    #[test]
    fn force_lost_override_self_resets() {
        let backend = SoftwareBackend::new();
        let instance = shared_instance(&backend);
        instance.ensure_resources().unwrap();

        instance.force_device_lost();
        assert!(instance.is_device_lost_test_override());
        assert!(instance.is_device_lost());
        // The observation consumed the override.
        assert!(!instance.is_device_lost_test_override());
        assert!(!instance.is_device_lost());
    }

    #[test]
    fn take_lock_fails_while_override_set() {
        let backend = SoftwareBackend::new();
        let instance = shared_instance(&backend);
        instance.ensure_resources().unwrap();

        instance.force_device_lost();
        assert_eq!(
            instance.take_lock_and_check_lost().err(),
            Some(DeviceLost::Removed)
        );
        assert!(instance.take_lock_and_check_lost().is_ok());
    }

    #[test]
    fn identity_is_write_once_and_lock_free() {
        let backend = SoftwareBackend::new();
        let instance = shared_instance(&backend);
        assert_eq!(instance.adapter_identity(), None);
        instance.ensure_resources().unwrap();
        let identity = instance.adapter_identity().expect("identity published");

        let guard = instance.take_lock_and_check_lost().unwrap();
        // Readable while another accessor holds the state lock.
        assert_eq!(instance.adapter_identity(), Some(identity));
        drop(guard);
    }

    #[test]
    fn lost_instance_is_never_rehydrated() {
        let backend = SoftwareBackend::new();
        let instance = shared_instance(&backend);
        instance.ensure_resources().unwrap();
        instance.record_device_as_lost();

        instance.ensure_resources().unwrap();
        assert!(instance.tier().is_none());
        assert!(instance.is_device_lost());
        assert_eq!(backend.counters().devices_created(), 1);
    }
}
