//! Deterministic software backend.
//!
//! Pure-CPU implementation of the platform seam: the software rasterizer
//! stand-in, and the backend every crate in the workspace tests against.
//! Clones share state, so a test can keep a handle to the backend it handed
//! to the device stack and flip faults while devices are live.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use crate::{
    AdapterDescriptor, AdapterIdentity, AdapterKind, CapabilityTier, Context2d, CreatedDevice,
    DeviceCreateError, DeviceCreateFlags, DeviceLost, MapError, MonitorId, Native2dDevice,
    NativeContext, NativeDevice, PixelFormat, PlatformBackend, SolidBrush2d, StagingBuffer,
    TextureMemoryUsage, FALLBACK_DEVICE_ID, FALLBACK_VENDOR_ID,
};

const REMOVED_NONE: u8 = 0;
const REMOVED_REMOVED: u8 = 1;
const REMOVED_RESET: u8 = 2;

static NEXT_DEBUG_ID: AtomicU64 = AtomicU64::new(1);

fn next_debug_id() -> u64 {
    NEXT_DEBUG_ID.fetch_add(1, Ordering::Relaxed)
}

fn lost_to_flag(lost: DeviceLost) -> u8 {
    match lost {
        DeviceLost::Removed => REMOVED_REMOVED,
        DeviceLost::Reset => REMOVED_RESET,
    }
}

fn flag_to_lost(flag: u8) -> Option<DeviceLost> {
    match flag {
        REMOVED_REMOVED => Some(DeviceLost::Removed),
        REMOVED_RESET => Some(DeviceLost::Reset),
        _ => None,
    }
}

/// Simulated adapter topology.
#[derive(Debug, Clone, Copy)]
pub struct SoftwareBackendConfig {
    /// Expose a simulated hardware adapter.
    pub hardware_adapter: bool,
    /// Expose the software-fallback adapter.
    pub fallback_adapter: bool,
    /// Display outputs on the fallback adapter.
    pub fallback_outputs: u32,
}

impl Default for SoftwareBackendConfig {
    fn default() -> Self {
        Self {
            hardware_adapter: true,
            fallback_adapter: true,
            fallback_outputs: 1,
        }
    }
}

/// Observability counters shared by everything a backend creates.
#[derive(Default)]
pub struct SoftwareCounters {
    devices_created: AtomicU64,
    devices_live: AtomicU64,
    contexts_2d_live: AtomicU64,
    brushes_2d_live: AtomicU64,
    flushes: AtomicU64,
    driver_trims: AtomicU64,
    clear_resources_calls: AtomicU64,
    last_clear_age_ms: AtomicU64,
    lock_2d_enters: AtomicU64,
}

impl SoftwareCounters {
    pub fn devices_created(&self) -> u64 {
        self.devices_created.load(Ordering::Relaxed)
    }

    pub fn devices_live(&self) -> u64 {
        self.devices_live.load(Ordering::Relaxed)
    }

    pub fn contexts_2d_live(&self) -> u64 {
        self.contexts_2d_live.load(Ordering::Relaxed)
    }

    pub fn brushes_2d_live(&self) -> u64 {
        self.brushes_2d_live.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn driver_trims(&self) -> u64 {
        self.driver_trims.load(Ordering::Relaxed)
    }

    pub fn clear_resources_calls(&self) -> u64 {
        self.clear_resources_calls.load(Ordering::Relaxed)
    }

    pub fn last_clear_age_ms(&self) -> u64 {
        self.last_clear_age_ms.load(Ordering::Relaxed)
    }

    pub fn lock_2d_enters(&self) -> u64 {
        self.lock_2d_enters.load(Ordering::Relaxed)
    }
}

struct BackendState {
    adapters: Vec<AdapterDescriptor>,
    list_current: bool,
    hardware_max_tier: CapabilityTier,
    fallback_max_tier: CapabilityTier,
    fail_hardware: bool,
    fail_fallback: bool,
    injected_errors: VecDeque<DeviceCreateError>,
    last_create_flags: Option<DeviceCreateFlags>,
    device_flags: Vec<Weak<AtomicU8>>,
    busy_flags: HashMap<u64, Weak<AtomicBool>>,
    hdr_monitors: HashSet<u64>,
    next_identity: u64,
}

impl BackendState {
    fn build_adapters(&mut self, config: SoftwareBackendConfig) {
        self.adapters.clear();
        if config.hardware_adapter {
            let identity = AdapterIdentity::new(self.next_identity);
            self.next_identity += 1;
            self.adapters.push(AdapterDescriptor {
                vendor_id: 0xabcd,
                device_id: 0x0001,
                name: "Simulated Display Adapter".into(),
                output_count: 1,
                identity,
            });
        }
        if config.fallback_adapter {
            let identity = AdapterIdentity::new(self.next_identity);
            self.next_identity += 1;
            self.adapters.push(AdapterDescriptor {
                vendor_id: FALLBACK_VENDOR_ID,
                device_id: FALLBACK_DEVICE_ID,
                name: "Software Rasterizer".into(),
                output_count: config.fallback_outputs,
                identity,
            });
        }
    }
}

struct Shared {
    state: Mutex<BackendState>,
    counters: Arc<SoftwareCounters>,
}

#[derive(Clone)]
pub struct SoftwareBackend {
    shared: Arc<Shared>,
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self::with_config(SoftwareBackendConfig::default())
    }

    pub fn with_config(config: SoftwareBackendConfig) -> Self {
        let mut state = BackendState {
            adapters: Vec::new(),
            list_current: true,
            hardware_max_tier: CapabilityTier::Tier11_1,
            fallback_max_tier: CapabilityTier::Tier11_1,
            fail_hardware: false,
            fail_fallback: false,
            injected_errors: VecDeque::new(),
            last_create_flags: None,
            device_flags: Vec::new(),
            busy_flags: HashMap::new(),
            hdr_monitors: HashSet::new(),
            next_identity: 1,
        };
        state.build_adapters(config);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                counters: Arc::new(SoftwareCounters::default()),
            }),
        }
    }

    pub fn counters(&self) -> Arc<SoftwareCounters> {
        Arc::clone(&self.shared.counters)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BackendState> {
        self.shared
            .state
            .lock()
            .expect("software backend state poisoned")
    }

    /// Highest tier the simulated hardware adapter will accept.
    pub fn set_hardware_max_tier(&self, tier: CapabilityTier) {
        self.state().hardware_max_tier = tier;
    }

    /// Highest tier the fallback adapter will accept.
    pub fn set_fallback_max_tier(&self, tier: CapabilityTier) {
        self.state().fallback_max_tier = tier;
    }

    /// Every hardware-adapter creation fails with an internal driver error.
    pub fn fail_hardware_creation(&self, fail: bool) {
        self.state().fail_hardware = fail;
    }

    /// Every fallback-adapter creation fails with an internal driver error.
    pub fn fail_fallback_creation(&self, fail: bool) {
        self.state().fail_fallback = fail;
    }

    /// Queues an error returned by the next creation attempt, ahead of the
    /// normal tier/fault logic. Consumed in FIFO order.
    pub fn inject_create_error(&self, error: DeviceCreateError) {
        self.state().injected_errors.push_back(error);
    }

    /// Swaps the adapter topology. All adapters get fresh identities and the
    /// list reads stale until re-enumerated.
    pub fn replace_topology(&self, config: SoftwareBackendConfig) {
        let mut state = self.state();
        state.build_adapters(config);
        state.list_current = false;
    }

    /// Marks the list stale without changing it. Re-enumeration yields the
    /// same adapters.
    pub fn mark_adapter_list_stale(&self) {
        self.state().list_current = false;
    }

    /// Flags every live device this backend has created as lost.
    pub fn remove_live_devices(&self, lost: DeviceLost) {
        let mut state = self.state();
        state.device_flags.retain(|weak| match weak.upgrade() {
            Some(flag) => {
                flag.store(lost_to_flag(lost), Ordering::Relaxed);
                true
            }
            None => false,
        });
    }

    /// Marks a staging buffer as still owned by the GPU, so non-blocking
    /// maps fail with [`MapError::WouldBlock`]. Returns false when the
    /// buffer no longer exists.
    pub fn set_buffer_gpu_busy(&self, buffer_id: u64, busy: bool) -> bool {
        let state = self.state();
        match state.busy_flags.get(&buffer_id).and_then(Weak::upgrade) {
            Some(flag) => {
                flag.store(busy, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Flags of the most recent [`PlatformBackend::create_device`] call,
    /// recorded whether or not the attempt succeeded.
    pub fn last_create_flags(&self) -> Option<DeviceCreateFlags> {
        self.state().last_create_flags
    }

    pub fn set_hdr_monitor(&self, monitor: MonitorId, hdr: bool) {
        let mut state = self.state();
        if hdr {
            state.hdr_monitors.insert(monitor.0);
        } else {
            state.hdr_monitors.remove(&monitor.0);
        }
    }
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformBackend for SoftwareBackend {
    fn enumerate_adapters(&self) -> Vec<AdapterDescriptor> {
        let mut state = self.state();
        state.list_current = true;
        state.adapters.clone()
    }

    fn is_adapter_list_current(&self) -> bool {
        self.state().list_current
    }

    fn create_device(
        &self,
        adapter: &AdapterDescriptor,
        tier: CapabilityTier,
        flags: DeviceCreateFlags,
    ) -> Result<CreatedDevice, DeviceCreateError> {
        let removed = {
            let mut state = self.state();
            state.last_create_flags = Some(flags);
            if let Some(error) = state.injected_errors.pop_front() {
                return Err(error);
            }
            let (fail_all, max_tier) = match adapter.kind() {
                AdapterKind::Hardware => (state.fail_hardware, state.hardware_max_tier),
                AdapterKind::SoftwareFallback => (state.fail_fallback, state.fallback_max_tier),
            };
            if fail_all {
                return Err(DeviceCreateError::InternalDriverError);
            }
            if tier > max_tier {
                return Err(DeviceCreateError::TierUnsupported(tier));
            }
            let removed = Arc::new(AtomicU8::new(REMOVED_NONE));
            state.device_flags.push(Arc::downgrade(&removed));
            removed
        };

        let counters = Arc::clone(&self.shared.counters);
        counters.devices_created.fetch_add(1, Ordering::Relaxed);
        counters.devices_live.fetch_add(1, Ordering::Relaxed);
        let device = SoftwareDevice {
            id: next_debug_id(),
            identity: adapter.identity,
            removed,
            counters: Arc::clone(&counters),
            staging_bytes: Arc::new(AtomicU64::new(0)),
            backend: Arc::downgrade(&self.shared),
        };
        let context = SoftwareContext {
            id: next_debug_id(),
            counters,
        };
        Ok(CreatedDevice {
            device: Box::new(device),
            context: Box::new(context),
            tier,
        })
    }

    fn create_2d_device(
        &self,
        device: &dyn NativeDevice,
    ) -> Result<Box<dyn Native2dDevice>, DeviceCreateError> {
        if let Some(lost) = device.removed_reason() {
            return Err(DeviceCreateError::DeviceLost(lost));
        }
        Ok(Box::new(Software2dDevice {
            lock: RawLock::default(),
            counters: Arc::clone(&self.shared.counters),
        }))
    }

    fn is_hdr_output(&self, monitor: MonitorId) -> bool {
        self.state().hdr_monitors.contains(&monitor.0)
    }
}

struct SoftwareDevice {
    id: u64,
    identity: AdapterIdentity,
    removed: Arc<AtomicU8>,
    counters: Arc<SoftwareCounters>,
    staging_bytes: Arc<AtomicU64>,
    backend: Weak<Shared>,
}

impl NativeDevice for SoftwareDevice {
    fn removed_reason(&self) -> Option<DeviceLost> {
        flag_to_lost(self.removed.load(Ordering::Relaxed))
    }

    fn adapter_identity(&self) -> AdapterIdentity {
        self.identity
    }

    fn create_staging_buffer(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Box<dyn StagingBuffer>, DeviceCreateError> {
        if let Some(lost) = self.removed_reason() {
            return Err(DeviceCreateError::DeviceLost(lost));
        }
        let len = width as usize * height as usize * format.bytes_per_pixel() as usize;
        let gpu_busy = Arc::new(AtomicBool::new(false));
        let id = crate::next_buffer_id();
        if let Some(shared) = self.backend.upgrade() {
            shared
                .state
                .lock()
                .expect("software backend state poisoned")
                .busy_flags
                .insert(id, Arc::downgrade(&gpu_busy));
        }
        self.staging_bytes.fetch_add(len as u64, Ordering::Relaxed);
        Ok(Box::new(SoftwareStagingBuffer {
            width,
            height,
            format,
            bytes: vec![0; len],
            id,
            mapped: false,
            gpu_busy,
            removed: Arc::clone(&self.removed),
            staging_bytes: Arc::clone(&self.staging_bytes),
        }))
    }

    fn texture_memory_usage(&self) -> TextureMemoryUsage {
        TextureMemoryUsage {
            driver_visible_bytes: self.staging_bytes.load(Ordering::Relaxed),
            heap_bytes: 0,
            pooled_surfaces: 0,
        }
    }

    fn trim(&self) {
        self.counters.driver_trims.fetch_add(1, Ordering::Relaxed);
    }

    fn debug_id(&self) -> u64 {
        self.id
    }
}

impl Drop for SoftwareDevice {
    fn drop(&mut self) {
        self.counters.devices_live.fetch_sub(1, Ordering::Relaxed);
    }
}

struct SoftwareContext {
    id: u64,
    counters: Arc<SoftwareCounters>,
}

impl NativeContext for SoftwareContext {
    fn flush(&self) {
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn debug_id(&self) -> u64 {
        self.id
    }
}

/// Driver-visible staging memory with a simulated GPU-ownership flag.
struct SoftwareStagingBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    bytes: Vec<u8>,
    id: u64,
    mapped: bool,
    gpu_busy: Arc<AtomicBool>,
    removed: Arc<AtomicU8>,
    staging_bytes: Arc<AtomicU64>,
}

impl StagingBuffer for SoftwareStagingBuffer {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn format(&self) -> PixelFormat {
        self.format
    }

    fn is_driver_visible(&self) -> bool {
        true
    }

    fn size_in_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn ensure_mapped(&mut self, allow_wait: bool) -> Result<(), MapError> {
        if let Some(lost) = flag_to_lost(self.removed.load(Ordering::Relaxed)) {
            return Err(MapError::DeviceLost(lost));
        }
        if self.gpu_busy.load(Ordering::Relaxed) {
            if !allow_wait {
                return Err(MapError::WouldBlock);
            }
            // Waiting on the simulated GPU always completes.
            self.gpu_busy.store(false, Ordering::Relaxed);
        }
        self.mapped = true;
        Ok(())
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        assert!(self.mapped, "staging buffer accessed before mapping");
        &mut self.bytes
    }

    fn buffer_id(&self) -> u64 {
        self.id
    }
}

impl Drop for SoftwareStagingBuffer {
    fn drop(&mut self) {
        self.staging_bytes
            .fetch_sub(self.bytes.len() as u64, Ordering::Relaxed);
    }
}

/// Manual lock so enter/leave can cross call boundaries the way the 2D
/// API's internal lock does.
#[derive(Default)]
struct RawLock {
    locked: Mutex<bool>,
    unlocked: Condvar,
}

impl RawLock {
    fn enter(&self) {
        let mut locked = self.locked.lock().expect("2d lock poisoned");
        while *locked {
            locked = self.unlocked.wait(locked).expect("2d lock poisoned");
        }
        *locked = true;
    }

    fn leave(&self) {
        let mut locked = self.locked.lock().expect("2d lock poisoned");
        assert!(*locked, "2d lock released while not held");
        *locked = false;
        self.unlocked.notify_one();
    }
}

struct Software2dDevice {
    lock: RawLock,
    counters: Arc<SoftwareCounters>,
}

impl Native2dDevice for Software2dDevice {
    fn create_thread_context(
        &self,
    ) -> Result<(Box<dyn Context2d>, Box<dyn SolidBrush2d>), DeviceCreateError> {
        self.counters.contexts_2d_live.fetch_add(1, Ordering::Relaxed);
        self.counters.brushes_2d_live.fetch_add(1, Ordering::Relaxed);
        Ok((
            Box::new(SoftwareContext2d {
                id: next_debug_id(),
                counters: Arc::clone(&self.counters),
            }),
            Box::new(SoftwareBrush2d {
                id: next_debug_id(),
                counters: Arc::clone(&self.counters),
            }),
        ))
    }

    fn clear_resources(&self, max_age_ms: u64) {
        self.counters
            .clear_resources_calls
            .fetch_add(1, Ordering::Relaxed);
        self.counters
            .last_clear_age_ms
            .store(max_age_ms, Ordering::Relaxed);
    }

    fn enter_lock(&self) {
        self.counters.lock_2d_enters.fetch_add(1, Ordering::Relaxed);
        self.lock.enter();
    }

    fn leave_lock(&self) {
        self.lock.leave();
    }
}

struct SoftwareContext2d {
    id: u64,
    counters: Arc<SoftwareCounters>,
}

impl Context2d for SoftwareContext2d {
    fn debug_id(&self) -> u64 {
        self.id
    }
}

impl Drop for SoftwareContext2d {
    fn drop(&mut self) {
        self.counters.contexts_2d_live.fetch_sub(1, Ordering::Relaxed);
    }
}

struct SoftwareBrush2d {
    id: u64,
    counters: Arc<SoftwareCounters>,
}

impl SolidBrush2d for SoftwareBrush2d {
    fn debug_id(&self) -> u64 {
        self.id
    }
}

impl Drop for SoftwareBrush2d {
    fn drop(&mut self) {
        self.counters.brushes_2d_live.fetch_sub(1, Ordering::Relaxed);
    }
}
