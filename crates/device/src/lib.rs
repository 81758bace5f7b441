//! Shared graphics-device instance: adapter selection, tiered creation,
//! the lock/device-lost protocol, the staging-surface pool, and per-thread
//! handles.

pub use handle::{DeviceHandle, ScratchBufferInfo};
pub use instance::{
    DeviceConfig, DeviceHandleKey, DeviceInstance, Ensure2dError, EnsureAdaptersError,
    EnsureDeviceError, InstanceFlags, LockedDeviceContext, SharedDeviceGuard,
};
pub use pool::{SurfaceAllocError, SurfacePool};
pub use registry::SharedInstanceRegistry;
pub use selector::{
    AdapterSet, DriverFailureConfig, DriverFailureTracker, create_device_from_adapter,
    select_adapters,
};

mod handle;
mod instance;
mod pool;
mod registry;
mod selector;
