//! The device seam. Every component talks to the GPU through [`RenderDevice`],
//! held as an `Arc` so owning handles can release themselves on drop.

use crate::error::Result;
use ash::vk;

pub mod vulkan;

#[cfg(test)]
pub mod mock;

pub use vulkan::VulkanDevice;

/// Triangle input for a bottom-level build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TriangleGeometry {
    pub vertex_address: vk::DeviceAddress,
    pub index_address: vk::DeviceAddress,
    pub vertex_stride: vk::DeviceSize,
    /// Highest vertex index the build may touch.
    pub max_vertex: u32,
    pub primitive_count: u32,
}

/// What an acceleration structure is built from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GeometryInput {
    Triangles(TriangleGeometry),
    /// A tightly packed array of `vk::AccelerationStructureInstanceKHR`.
    Instances { data: vk::DeviceAddress, count: u32 },
}

impl GeometryInput {
    pub fn ty(&self) -> vk::AccelerationStructureTypeKHR {
        match self {
            Self::Triangles(_) => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            Self::Instances { .. } => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        }
    }

    pub fn primitive_count(&self) -> u32 {
        match self {
            Self::Triangles(triangles) => triangles.primitive_count,
            Self::Instances { count, .. } => *count,
        }
    }
}

/// Device answer to a build-size query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BuildSizes {
    pub storage: vk::DeviceSize,
    pub build_scratch: vk::DeviceSize,
    pub update_scratch: vk::DeviceSize,
}

#[derive(Clone, Copy, Debug)]
pub struct BuildRequest {
    pub input: GeometryInput,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub mode: vk::BuildAccelerationStructureModeKHR,
    /// Null for a full build; the destination itself for an in-place update.
    pub src: vk::AccelerationStructureKHR,
    pub dst: vk::AccelerationStructureKHR,
    pub scratch_address: vk::DeviceAddress,
}

/// One execution + memory dependency on the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryDependency {
    pub src_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub dst_access: vk::AccessFlags,
}

impl MemoryDependency {
    /// Host-written instance data must be visible to the build.
    pub const HOST_TO_BUILD: Self = Self {
        src_stage: vk::PipelineStageFlags::HOST,
        src_access: vk::AccessFlags::HOST_WRITE,
        dst_stage: vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
        dst_access: vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
    };

    /// An in-place update must not overtake earlier traces that read the structure.
    pub const TRACE_TO_BUILD: Self = Self {
        src_stage: vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        src_access: vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
        dst_stage: vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
        dst_access: vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
    };

    pub const BUILD_TO_TRACE: Self = Self {
        src_stage: vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
        src_access: vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
        dst_stage: vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        dst_access: vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
    };
}

#[derive(Clone, Copy, Debug)]
pub struct Submission {
    pub command_buffer: vk::CommandBuffer,
    pub wait: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
    pub signal: Option<vk::Semaphore>,
    /// May be null.
    pub fence: vk::Fence,
}

/// Raygen, miss, hit and callable regions, in `vkCmdTraceRaysKHR` order.
pub type SbtRegions = [vk::StridedDeviceAddressRegionKHR; 4];

/// Everything a trace dispatch binds.
#[derive(Clone, Copy, Debug)]
pub struct TraceDispatch {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub descriptor_set: vk::DescriptorSet,
    pub regions: SbtRegions,
    pub extent: vk::Extent2D,
    /// Image the tracer writes; blitted to the presentable image afterwards.
    pub storage_image: vk::Image,
}

/// The GPU as the renderer core sees it.
///
/// Methods mirror single Vulkan calls and report the failing call's name in
/// errors. All handles are plain `ash::vk` handles.
pub trait RenderDevice {
    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties;

    fn create_buffer(&self, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Result<vk::Buffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress;

    fn create_image(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> Result<vk::Image>;
    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> Result<vk::ImageView>;
    fn destroy_image(&self, image: vk::Image, view: vk::ImageView);
    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;

    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
        device_address: bool,
    ) -> Result<vk::DeviceMemory>;
    fn free_memory(&self, memory: vk::DeviceMemory);
    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> Result<()>;
    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> Result<()>;
    /// Map, copy, unmap. The memory must be host-visible and coherent.
    fn write_memory(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, bytes: &[u8]) -> Result<()>;

    fn acceleration_structure_build_sizes(
        &self,
        input: &GeometryInput,
        flags: vk::BuildAccelerationStructureFlagsKHR,
    ) -> BuildSizes;
    fn create_acceleration_structure(
        &self,
        ty: vk::AccelerationStructureTypeKHR,
        buffer: vk::Buffer,
        size: vk::DeviceSize,
    ) -> Result<vk::AccelerationStructureKHR>;
    fn destroy_acceleration_structure(&self, structure: vk::AccelerationStructureKHR);
    fn acceleration_structure_address(&self, structure: vk::AccelerationStructureKHR) -> vk::DeviceAddress;

    fn create_command_pool(&self) -> Result<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffers(&self, pool: vk::CommandPool, count: u32) -> Result<Vec<vk::CommandBuffer>>;
    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()>;
    /// Begins a one-time-submit recording.
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()>;

    fn cmd_build_acceleration_structure(&self, command_buffer: vk::CommandBuffer, request: &BuildRequest);
    fn cmd_memory_barrier(&self, command_buffer: vk::CommandBuffer, dependency: MemoryDependency);
    fn cmd_transition_image(
        &self,
        command_buffer: vk::CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    );
    fn cmd_trace_rays(&self, command_buffer: vk::CommandBuffer, dispatch: &TraceDispatch);
    /// Copy the traced image into `target` and leave `target` ready to present.
    fn cmd_blit_to_present(
        &self,
        command_buffer: vk::CommandBuffer,
        source: vk::Image,
        target: vk::Image,
        extent: vk::Extent2D,
    );

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn create_semaphore(&self) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;

    fn queue_submit(&self, submission: &Submission) -> Result<()>;
    fn wait_idle(&self) -> Result<()>;
}
