//! Per-thread device handle.

use std::sync::Arc;
use std::time::Instant;

use backend::{PixelFormat, PlatformBackend, StagingBuffer};

use crate::instance::{DeviceConfig, DeviceHandleKey, DeviceInstance, Ensure2dError};
use crate::pool::SurfaceAllocError;
use crate::registry::SharedInstanceRegistry;

/// Descriptor of the handle's scratch upload buffer.
#[derive(Debug, Clone, Copy)]
pub struct ScratchBufferInfo {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub last_used: Instant,
}

/// One logical device user, typically one per UI thread. Holds a strong
/// reference to the instance plus the key under which the instance stores
/// this handle's derived 2D context and brush. Dropping the handle removes
/// those entries and releases the strong reference.
pub struct DeviceHandle {
    instance: Arc<DeviceInstance>,
    key: DeviceHandleKey,
    scratch: Option<ScratchBufferInfo>,
}

impl DeviceHandle {
    /// Attaches to (or creates) the published shared instance.
    pub fn shared(
        registry: &Arc<SharedInstanceRegistry>,
        backend: Arc<dyn PlatformBackend>,
        config: DeviceConfig,
    ) -> Self {
        Self::for_instance(registry.acquire(backend, config))
    }

    /// Owns a private, unpublished instance.
    pub fn unique(
        registry: &Arc<SharedInstanceRegistry>,
        backend: Arc<dyn PlatformBackend>,
        config: DeviceConfig,
    ) -> Self {
        Self::for_instance(registry.acquire_unique(backend, config))
    }

    pub fn for_instance(instance: Arc<DeviceInstance>) -> Self {
        let key = instance.register_handle();
        Self {
            instance,
            key,
            scratch: None,
        }
    }

    pub fn instance(&self) -> &Arc<DeviceInstance> {
        &self.instance
    }

    pub fn key(&self) -> DeviceHandleKey {
        self.key
    }

    /// Lazily creates this handle's derived 2D context and brush.
    pub fn ensure_thread_resources(&self) -> Result<(), Ensure2dError> {
        self.instance.ensure_thread_resources(self.key)
    }

    /// Allocates a staging surface through the instance pool and records
    /// it as this handle's scratch upload buffer. The recorded extents
    /// come from the buffer actually handed out, which may be a larger
    /// pooled one.
    pub fn allocate_surface(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
        prefer_heap: bool,
    ) -> Result<Box<dyn StagingBuffer>, SurfaceAllocError> {
        let buffer = self
            .instance
            .allocate_surface(width, height, format, prefer_heap)?;
        self.scratch = Some(ScratchBufferInfo {
            width: buffer.width(),
            height: buffer.height(),
            format: buffer.format(),
            last_used: Instant::now(),
        });
        Ok(buffer)
    }

    /// Descriptor of the most recent scratch allocation, if any.
    pub fn scratch(&self) -> Option<ScratchBufferInfo> {
        self.scratch
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.instance.unregister_handle(self.key);
    }
}
