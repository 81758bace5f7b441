//! Platform seam for the graphics-device stack.
//!
//! Everything device-shaped the rest of the workspace touches goes through
//! the traits in this crate: adapter enumeration, native device creation at a
//! negotiated capability tier, the 2D acceleration device with its own
//! internal lock, and CPU-addressable staging buffers. [`SoftwareBackend`] is
//! the in-tree software rasterizer stand-in; it is deterministic and carries
//! fault-injection knobs, so every higher-level crate tests against it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Ranked feature level negotiated at device creation.
///
/// `Ord` follows capability: a higher tier compares greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CapabilityTier {
    Tier9_1,
    Tier9_2,
    Tier9_3,
    Tier10_0,
    Tier10_1,
    Tier11_0,
    Tier11_1,
}

/// Creation attempt order, highest tier first.
pub const TIER_ATTEMPTS: [CapabilityTier; 7] = [
    CapabilityTier::Tier11_1,
    CapabilityTier::Tier11_0,
    CapabilityTier::Tier10_1,
    CapabilityTier::Tier10_0,
    CapabilityTier::Tier9_3,
    CapabilityTier::Tier9_2,
    CapabilityTier::Tier9_1,
];

impl CapabilityTier {
    /// Tiers below 10_0 cannot upload straight into shared surfaces and
    /// need an intermediate upload surface.
    pub const fn supports_direct_upload(self) -> bool {
        matches!(
            self,
            CapabilityTier::Tier10_0
                | CapabilityTier::Tier10_1
                | CapabilityTier::Tier11_0
                | CapabilityTier::Tier11_1
        )
    }
}

/// Staging-surface pixel formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Bgra8,
    Alpha8,
    Rgba16Float,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Bgra8 => 4,
            PixelFormat::Alpha8 => 1,
            PixelFormat::Rgba16Float => 8,
        }
    }
}

/// Vendor/device signature of the software-fallback rasterizer.
pub const FALLBACK_VENDOR_ID: u32 = 0x1414;
pub const FALLBACK_DEVICE_ID: u32 = 0x8c;

/// Write-once adapter identity token (the LUID analog). Comparable across
/// threads without any lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdapterIdentity(u64);

impl AdapterIdentity {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    Hardware,
    SoftwareFallback,
}

/// One enumerated adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterDescriptor {
    pub vendor_id: u32,
    pub device_id: u32,
    pub name: String,
    /// Display outputs attached to this adapter.
    pub output_count: u32,
    pub identity: AdapterIdentity,
}

impl AdapterDescriptor {
    pub fn kind(&self) -> AdapterKind {
        if self.vendor_id == FALLBACK_VENDOR_ID && self.device_id == FALLBACK_DEVICE_ID {
            AdapterKind::SoftwareFallback
        } else {
            AdapterKind::Hardware
        }
    }
}

/// Creation flag combination, set from caller intent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCreateFlags {
    pub prefer_fallback: bool,
    pub video: bool,
    pub debug: bool,
}

/// Opaque monitor handle for the HDR capability query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MonitorId(pub u64);

/// Diagnostics totals reported to the composition layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextureMemoryUsage {
    pub driver_visible_bytes: u64,
    pub heap_bytes: u64,
    pub pooled_surfaces: u32,
}

impl TextureMemoryUsage {
    pub fn combined(self, other: TextureMemoryUsage) -> TextureMemoryUsage {
        TextureMemoryUsage {
            driver_visible_bytes: self.driver_visible_bytes + other.driver_visible_bytes,
            heap_bytes: self.heap_bytes + other.heap_bytes,
            pooled_surfaces: self.pooled_surfaces + other.pooled_surfaces,
        }
    }
}

/// The recoverable device-invalidation condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceLost {
    /// The native device was removed (driver upgrade, TDR, session change).
    Removed,
    /// The device must be re-created but the adapter is still present
    /// (topology change, stale device).
    Reset,
}

impl fmt::Display for DeviceLost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceLost::Removed => write!(f, "graphics device removed"),
            DeviceLost::Reset => write!(f, "graphics device reset"),
        }
    }
}

impl std::error::Error for DeviceLost {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterEnumError {
    /// Neither a hardware nor a software-fallback adapter exists. There is
    /// no lower fallback; this is fatal.
    NoAdaptersFound,
}

impl fmt::Display for AdapterEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterEnumError::NoAdaptersFound => write!(f, "no graphics adapters found"),
        }
    }
}

impl std::error::Error for AdapterEnumError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCreateError {
    /// The adapter does not support the requested tier. Expected during the
    /// descending tier walk.
    TierUnsupported(CapabilityTier),
    OutOfMemory,
    /// Low-level driver failure. Feeds the driver-failure circuit breaker.
    InternalDriverError,
    DeviceLost(DeviceLost),
}

impl DeviceCreateError {
    pub fn is_device_loss(self) -> bool {
        matches!(self, DeviceCreateError::DeviceLost(_))
    }
}

impl fmt::Display for DeviceCreateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceCreateError::TierUnsupported(tier) => {
                write!(f, "capability tier {tier:?} unsupported")
            }
            DeviceCreateError::OutOfMemory => write!(f, "out of memory creating device"),
            DeviceCreateError::InternalDriverError => write!(f, "internal driver error"),
            DeviceCreateError::DeviceLost(lost) => write!(f, "{lost}"),
        }
    }
}

impl std::error::Error for DeviceCreateError {}

impl From<DeviceLost> for DeviceCreateError {
    fn from(lost: DeviceLost) -> Self {
        DeviceCreateError::DeviceLost(lost)
    }
}

/// Failure of a staging-buffer map attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The buffer is still in use by the GPU and a non-blocking map was
    /// requested.
    WouldBlock,
    DeviceLost(DeviceLost),
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::WouldBlock => write!(f, "staging buffer still in use by the GPU"),
            MapError::DeviceLost(lost) => write!(f, "{lost}"),
        }
    }
}

impl std::error::Error for MapError {}

/// Successful device creation: the device, its immediate context, and the
/// tier that was achieved.
pub struct CreatedDevice {
    pub device: Box<dyn NativeDevice>,
    pub context: Box<dyn NativeContext>,
    pub tier: CapabilityTier,
}

impl fmt::Debug for CreatedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreatedDevice")
            .field("tier", &self.tier)
            .finish_non_exhaustive()
    }
}

/// The platform's adapter/device factory.
pub trait PlatformBackend: Send + Sync {
    /// Snapshot of the current adapter topology. Taking a snapshot makes the
    /// list current again.
    fn enumerate_adapters(&self) -> Vec<AdapterDescriptor>;

    /// False once the adapter topology has changed since the last
    /// enumeration.
    fn is_adapter_list_current(&self) -> bool;

    fn create_device(
        &self,
        adapter: &AdapterDescriptor,
        tier: CapabilityTier,
        flags: DeviceCreateFlags,
    ) -> Result<CreatedDevice, DeviceCreateError>;

    /// Creates the 2D acceleration device on top of a native 3D device.
    fn create_2d_device(
        &self,
        device: &dyn NativeDevice,
    ) -> Result<Box<dyn Native2dDevice>, DeviceCreateError>;

    fn is_hdr_output(&self, monitor: MonitorId) -> bool;
}

pub trait NativeDevice: Send {
    /// `Some` once the driver has invalidated this device.
    fn removed_reason(&self) -> Option<DeviceLost>;

    fn adapter_identity(&self) -> AdapterIdentity;

    fn create_staging_buffer(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Box<dyn StagingBuffer>, DeviceCreateError>;

    fn texture_memory_usage(&self) -> TextureMemoryUsage;

    /// Asks the driver to drop internal scratch allocations.
    fn trim(&self);

    /// Stable identity for diagnostics and pointer-equality assertions.
    fn debug_id(&self) -> u64;
}

pub trait NativeContext: Send {
    fn flush(&self);

    fn debug_id(&self) -> u64;
}

/// Per-thread derived 2D resources. Owned by the shared instance, scoped to
/// one handle's identity.
pub trait Context2d: Send {
    fn debug_id(&self) -> u64;
}

pub trait SolidBrush2d: Send {
    fn debug_id(&self) -> u64;
}

pub trait Native2dDevice: Send {
    fn create_thread_context(
        &self,
    ) -> Result<(Box<dyn Context2d>, Box<dyn SolidBrush2d>), DeviceCreateError>;

    /// Drops cached 2D resources older than `max_age_ms`.
    fn clear_resources(&self, max_age_ms: u64);

    /// The 2D API's own internal lock. Always taken after the instance
    /// mutex, never before it.
    fn enter_lock(&self);
    fn leave_lock(&self);
}

/// CPU-addressable upload staging memory, either driver-visible or plain
/// heap.
pub trait StagingBuffer: Send {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn format(&self) -> PixelFormat;
    fn is_driver_visible(&self) -> bool;
    fn size_in_bytes(&self) -> u64;

    /// Maps the buffer for CPU writes. With `allow_wait` false the call must
    /// not stall on the GPU and fails with [`MapError::WouldBlock`] instead.
    fn ensure_mapped(&mut self, allow_wait: bool) -> Result<(), MapError>;

    /// Mapped bytes. Only valid after a successful [`StagingBuffer::ensure_mapped`].
    fn bytes_mut(&mut self) -> &mut [u8];

    /// Process-unique identity, for pool-reuse assertions.
    fn buffer_id(&self) -> u64;
}

impl fmt::Debug for dyn StagingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagingBuffer")
            .field("buffer_id", &self.buffer_id())
            .finish_non_exhaustive()
    }
}

/// Fills a Bgra8 byte buffer with one pixel value. `bytes.len()` must be a
/// multiple of four.
pub fn fill_bgra8(bytes: &mut [u8], pixel: [u8; 4]) {
    let pixels: &mut [[u8; 4]] = bytemuck::cast_slice_mut(bytes);
    pixels.fill(pixel);
}

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique staging-buffer id.
pub fn next_buffer_id() -> u64 {
    NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Plain heap staging memory: CPU-only, always mapped.
pub struct HeapBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    bytes: Vec<u8>,
    id: u64,
}

impl HeapBuffer {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let len = width as usize * height as usize * format.bytes_per_pixel() as usize;
        Self {
            width,
            height,
            format,
            bytes: vec![0; len],
            id: next_buffer_id(),
        }
    }
}

impl StagingBuffer for HeapBuffer {
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
        false
    }

    fn size_in_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn ensure_mapped(&mut self, _allow_wait: bool) -> Result<(), MapError> {
        Ok(())
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    fn buffer_id(&self) -> u64 {
        self.id
    }
}

mod software;

pub use software::{SoftwareBackend, SoftwareBackendConfig, SoftwareCounters};
