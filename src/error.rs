//! Error types for the renderer core.
//!
//! Every failure here is fatal: acceleration-structure and synchronization
//! state cannot be repaired mid-frame, so callers unwind to process exit.

use ash::vk;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RenderError>;

#[derive(Error, Debug)]
pub enum RenderError {
    /// A create/record/submit call returned an error status
    #[error("{operation} failed: {result:?} ({code})", code = .result.as_raw())]
    ResourceCreation {
        operation: &'static str,
        result: vk::Result,
    },

    /// Host or device memory ran out
    #[error("{operation} ran out of memory: {result:?} ({code})", code = .result.as_raw())]
    MemoryExhaustion {
        operation: &'static str,
        result: vk::Result,
    },

    /// No memory type satisfies both the resource and the requested properties
    #[error("no suitable memory type (type bits {type_bits:#b}, required {required:?})")]
    NoSuitableMemoryType {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },

    /// A fence or acquire wait timed out
    #[error("{operation} timed out")]
    SynchronizationTimeout { operation: &'static str },

    /// The device was lost or returned an unrecoverable status
    #[error("device lost during {operation}: {result:?} ({code})", code = .result.as_raw())]
    DeviceLost {
        operation: &'static str,
        result: vk::Result,
    },

    /// A copy would run past the end of a buffer sized up front
    #[error("buffer too small: need {required} bytes, capacity {capacity}")]
    BufferTooSmall {
        required: vk::DeviceSize,
        capacity: vk::DeviceSize,
    },

    /// A triangle references a vertex outside its own object
    #[error("object {object}: index {index} out of range for {vertex_count} vertices")]
    IndexOutOfRange {
        object: usize,
        index: u32,
        vertex_count: u32,
    },

    /// A mesh cannot form a triangle list: no vertices, no indices, or an
    /// index count that is not a multiple of three
    #[error("object {object}: {vertex_count} vertices and {index_count} indices do not form a triangle list")]
    MalformedMesh {
        object: usize,
        vertex_count: usize,
        index_count: usize,
    },

    /// Geometry upload was given no meshes
    #[error("no meshes to upload")]
    NoGeometry,

    /// Refit was asked to change the instance count of a built structure
    #[error("top-level structure built with {built} instances, refit requested {requested}")]
    TopologyChanged { built: u32, requested: u32 },

    /// No physical device exposes the required ray tracing support
    #[error("no suitable GPU: {0}")]
    NoSuitableDevice(String),

    #[error("failed to load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("window handle unavailable: {0}")]
    WindowHandle(#[from] raw_window_handle::HandleError),

    #[error("shader {path}: {message}")]
    ShaderCompilation { path: String, message: String },
}

impl RenderError {
    /// Classify a raw Vulkan status returned by `operation`.
    pub fn from_vk(operation: &'static str, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY
            | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            | vk::Result::ERROR_TOO_MANY_OBJECTS => Self::MemoryExhaustion { operation, result },
            vk::Result::TIMEOUT | vk::Result::NOT_READY => Self::SynchronizationTimeout { operation },
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost { operation, result },
            _ => Self::ResourceCreation { operation, result },
        }
    }

    pub fn is_fatal_device_state(&self) -> bool {
        matches!(self, Self::DeviceLost { .. } | Self::SynchronizationTimeout { .. })
    }
}

/// Attaches the failing operation name to a `VkResult`.
pub trait VkResultExt<T> {
    fn op(self, operation: &'static str) -> Result<T>;
}

impl<T> VkResultExt<T> for ash::prelude::VkResult<T> {
    fn op(self, operation: &'static str) -> Result<T> {
        self.map_err(|result| RenderError::from_vk(operation, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_vulkan_status_codes() {
        assert!(matches!(
            RenderError::from_vk("vkAllocateMemory", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            RenderError::MemoryExhaustion { operation: "vkAllocateMemory", .. }
        ));
        assert!(matches!(
            RenderError::from_vk("vkWaitForFences", vk::Result::TIMEOUT),
            RenderError::SynchronizationTimeout { operation: "vkWaitForFences" }
        ));
        assert!(matches!(
            RenderError::from_vk("vkQueueSubmit", vk::Result::ERROR_DEVICE_LOST),
            RenderError::DeviceLost { .. }
        ));
        assert!(matches!(
            RenderError::from_vk("vkCreateBuffer", vk::Result::ERROR_INITIALIZATION_FAILED),
            RenderError::ResourceCreation { .. }
        ));
    }

    #[test]
    fn message_names_operation_and_raw_code() {
        let err = RenderError::from_vk("vkCreateAccelerationStructureKHR", vk::Result::ERROR_UNKNOWN);
        let text = err.to_string();
        assert!(text.contains("vkCreateAccelerationStructureKHR"));
        assert!(text.contains(&vk::Result::ERROR_UNKNOWN.as_raw().to_string()));
    }

    #[test]
    fn op_maps_errors_and_passes_values() {
        let ok: ash::prelude::VkResult<u32> = Ok(7);
        assert_eq!(ok.op("noop").unwrap(), 7);

        let err: ash::prelude::VkResult<u32> = Err(vk::Result::ERROR_DEVICE_LOST);
        assert!(err.op("vkQueueSubmit").unwrap_err().is_fatal_device_state());
    }
}
