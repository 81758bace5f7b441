//! Reuse pool for transient CPU-addressable upload surfaces.

use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use backend::{
    DeviceCreateError, DeviceLost, HeapBuffer, MapError, NativeDevice, PixelFormat, StagingBuffer,
    TextureMemoryUsage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceAllocError {
    DeviceLost(DeviceLost),
    Create(DeviceCreateError),
}

impl fmt::Display for SurfaceAllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SurfaceAllocError::DeviceLost(lost) => write!(f, "{lost}"),
            SurfaceAllocError::Create(error) => write!(f, "surface allocation failed: {error}"),
        }
    }
}

impl std::error::Error for SurfaceAllocError {}

impl From<DeviceLost> for SurfaceAllocError {
    fn from(lost: DeviceLost) -> Self {
        SurfaceAllocError::DeviceLost(lost)
    }
}

impl From<DeviceCreateError> for SurfaceAllocError {
    fn from(error: DeviceCreateError) -> Self {
        match error {
            DeviceCreateError::DeviceLost(lost) => SurfaceAllocError::DeviceLost(lost),
            other => SurfaceAllocError::Create(other),
        }
    }
}

struct PoolEntry {
    buffer: Box<dyn StagingBuffer>,
    returned_at: Instant,
}

/// Free list of reusable staging surfaces, kept in return order. Reuse is
/// keyed conservatively: sufficient size, exact format, exact
/// driver-visibility.
pub struct SurfacePool {
    entries: VecDeque<PoolEntry>,
}

impl SurfacePool {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// First-fit scan of the free list; on a miss a fresh buffer is
    /// allocated. Driver-visible reuse candidates take a non-blocking map
    /// and are skipped while the GPU still owns them; the scan continues
    /// past them. A brand-new driver buffer may block on its first map.
    pub fn allocate(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
        prefer_heap: bool,
        device: Option<&dyn NativeDevice>,
    ) -> Result<Box<dyn StagingBuffer>, SurfaceAllocError> {
        let want_driver = !prefer_heap;
        let mut found = None;
        let mut index = 0;
        while index < self.entries.len() {
            let buffer = &mut self.entries[index].buffer;
            let fits = buffer.width() >= width
                && buffer.height() >= height
                && buffer.format() == format
                && buffer.is_driver_visible() == want_driver;
            if !fits {
                index += 1;
                continue;
            }
            if !want_driver {
                found = Some(index);
                break;
            }
            match buffer.ensure_mapped(false) {
                Ok(()) => {
                    found = Some(index);
                    break;
                }
                // Still owned by the GPU; keep scanning.
                Err(MapError::WouldBlock) => index += 1,
                Err(MapError::DeviceLost(lost)) => return Err(SurfaceAllocError::DeviceLost(lost)),
            }
        }

        if let Some(index) = found {
            let entry = self.entries.remove(index).expect("matched index in range");
            return Ok(entry.buffer);
        }

        if prefer_heap {
            return Ok(Box::new(HeapBuffer::new(width, height, format)));
        }
        let device = device.ok_or(SurfaceAllocError::DeviceLost(DeviceLost::Removed))?;
        let mut buffer = device.create_staging_buffer(width, height, format)?;
        buffer.ensure_mapped(true).map_err(|error| match error {
            MapError::DeviceLost(lost) => SurfaceAllocError::DeviceLost(lost),
            MapError::WouldBlock => SurfaceAllocError::Create(DeviceCreateError::InternalDriverError),
        })?;
        Ok(buffer)
    }

    /// Returns a buffer to the free list and timestamps it.
    pub fn release(&mut self, buffer: Box<dyn StagingBuffer>, now: Instant) {
        self.entries.push_back(PoolEntry {
            buffer,
            returned_at: now,
        });
    }

    /// Evicts at most one entry whose return timestamp is older than
    /// `cutoff`. One eviction per call bounds the per-frame cost; repeated
    /// calls drain the pool. Returns the eviction count (0 or 1).
    pub fn trim(&mut self, cutoff: Instant) -> usize {
        let expired = self
            .entries
            .iter()
            .position(|entry| entry.returned_at < cutoff);
        match expired {
            Some(index) => {
                self.entries.remove(index);
                1
            }
            None => 0,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pool-side totals. Driver-visible bytes are reported by the device
    /// that owns them, not here.
    pub fn usage(&self) -> TextureMemoryUsage {
        let mut usage = TextureMemoryUsage {
            pooled_surfaces: self.entries.len() as u32,
            ..TextureMemoryUsage::default()
        };
        for entry in &self.entries {
            if !entry.buffer.is_driver_visible() {
                usage.heap_bytes += entry.buffer.size_in_bytes();
            }
        }
        usage
    }
}

impl Default for SurfacePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backend::{
        CapabilityTier, DeviceCreateFlags, PlatformBackend, SoftwareBackend,
    };
    use std::time::Duration;

    fn test_device(backend: &SoftwareBackend) -> Box<dyn NativeDevice> {
        let adapter = backend.enumerate_adapters().remove(0);
        backend
            .create_device(
                &adapter,
                CapabilityTier::Tier11_1,
                DeviceCreateFlags::default(),
            )
            .expect("device creation")
            .device
    }

    #[test]
    fn heap_allocation_matches_request() {
        let mut pool = SurfacePool::new();
        let buffer = pool
            .allocate(100, 50, PixelFormat::Bgra8, true, None)
            .unwrap();
        assert!(buffer.width() >= 100);
        assert!(buffer.height() >= 50);
        assert_eq!(buffer.format(), PixelFormat::Bgra8);
        assert!(!buffer.is_driver_visible());
    }

    #[test]
    fn released_buffer_is_reused() {
        let backend = SoftwareBackend::new();
        let device = test_device(&backend);
        let mut pool = SurfacePool::new();

        let buffer = pool
            .allocate(100, 100, PixelFormat::Bgra8, false, Some(device.as_ref()))
            .unwrap();
        let id = buffer.buffer_id();
        pool.release(buffer, Instant::now());

        let again = pool
            .allocate(100, 100, PixelFormat::Bgra8, false, Some(device.as_ref()))
            .unwrap();
        assert_eq!(again.buffer_id(), id);
        assert!(pool.is_empty());
    }

    #[test]
    fn smaller_buffer_is_not_reused() {
        let mut pool = SurfacePool::new();
        let small = pool.allocate(50, 50, PixelFormat::Bgra8, true, None).unwrap();
        let small_id = small.buffer_id();
        pool.release(small, Instant::now());

        let large = pool
            .allocate(100, 100, PixelFormat::Bgra8, true, None)
            .unwrap();
        assert_ne!(large.buffer_id(), small_id);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn format_must_match_exactly() {
        let mut pool = SurfacePool::new();
        let bgra = pool.allocate(64, 64, PixelFormat::Bgra8, true, None).unwrap();
        let bgra_id = bgra.buffer_id();
        pool.release(bgra, Instant::now());

        let alpha = pool
            .allocate(64, 64, PixelFormat::Alpha8, true, None)
            .unwrap();
        assert_ne!(alpha.buffer_id(), bgra_id);
    }

    #[test]
    fn visibility_must_match_exactly() {
        let backend = SoftwareBackend::new();
        let device = test_device(&backend);
        let mut pool = SurfacePool::new();

        let driver = pool
            .allocate(64, 64, PixelFormat::Bgra8, false, Some(device.as_ref()))
            .unwrap();
        let driver_id = driver.buffer_id();
        pool.release(driver, Instant::now());

        let heap = pool.allocate(64, 64, PixelFormat::Bgra8, true, None).unwrap();
        assert_ne!(heap.buffer_id(), driver_id);
    }

    #[test]
    fn busy_entry_is_skipped_and_scan_continues() {
        let backend = SoftwareBackend::new();
        let device = test_device(&backend);
        let mut pool = SurfacePool::new();

        let first = pool
            .allocate(64, 64, PixelFormat::Bgra8, false, Some(device.as_ref()))
            .unwrap();
        let second = pool
            .allocate(64, 64, PixelFormat::Bgra8, false, Some(device.as_ref()))
            .unwrap();
        let first_id = first.buffer_id();
        let second_id = second.buffer_id();
        let now = Instant::now();
        pool.release(first, now);
        pool.release(second, now);

        assert!(backend.set_buffer_gpu_busy(first_id, true));
        let reused = pool
            .allocate(64, 64, PixelFormat::Bgra8, false, Some(device.as_ref()))
            .unwrap();
        // The busy entry is skipped, the later idle entry is used.
        assert_eq!(reused.buffer_id(), second_id);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn driver_miss_without_device_is_device_lost() {
        let mut pool = SurfacePool::new();
        let err = pool
            .allocate(64, 64, PixelFormat::Bgra8, false, None)
            .unwrap_err();
        assert_eq!(err, SurfaceAllocError::DeviceLost(DeviceLost::Removed));
    }

    #[test]
    fn trim_removes_at_most_one_entry_per_call() {
        let mut pool = SurfacePool::new();
        let base = Instant::now();
        for _ in 0..3 {
            let buffer = pool.allocate(8, 8, PixelFormat::Bgra8, true, None).unwrap();
            pool.release(buffer, base);
        }

        // Cutoff at the return timestamp: nothing expires.
        assert_eq!(pool.trim(base), 0);
        assert_eq!(pool.len(), 3);

        // Cutoff after every timestamp: exactly one per call.
        let cutoff = base + Duration::from_secs(1);
        assert_eq!(pool.trim(cutoff), 1);
        assert_eq!(pool.trim(cutoff), 1);
        assert_eq!(pool.trim(cutoff), 1);
        assert_eq!(pool.trim(cutoff), 0);
        assert!(pool.is_empty());
    }

    #[test]
    fn usage_counts_heap_bytes_and_surfaces() {
        let mut pool = SurfacePool::new();
        let buffer = pool.allocate(10, 10, PixelFormat::Bgra8, true, None).unwrap();
        pool.release(buffer, Instant::now());

        let usage = pool.usage();
        assert_eq!(usage.pooled_surfaces, 1);
        assert_eq!(usage.heap_bytes, 10 * 10 * 4);
        assert_eq!(usage.driver_visible_bytes, 0);
    }
}
