use thiserror::Error;

/// Failures reported by a [`Device`](crate::device::Device).
///
/// These are kept apart from programming errors, which panic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("out of host or device memory")]
    OutOfMemory,
    #[error("device lost")]
    DeviceLost,
    #[error("no memory type matches {0:#x}")]
    MemoryTypeNotFound(u32),
    #[error("vulkan error: {0}")]
    Vulkan(String),
}
