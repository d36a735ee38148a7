//! Acceleration structures: one owning handle type and one build procedure
//! shared by the bottom and top levels.

pub mod blas;
pub mod tlas;

pub use blas::BottomLevelStructure;
pub use tlas::{Instance, TopLevelStructure};

use crate::commands::OneTimeCommands;
use crate::device::{BuildRequest, BuildSizes, GeometryInput, MemoryDependency, RenderDevice};
use crate::error::Result;
use crate::memory::GpuBuffer;
use ash::vk;
use std::sync::Arc;

/// An acceleration structure and the storage buffer it lives in.
pub struct AccelerationStructure<D: RenderDevice> {
    device: Arc<D>,
    handle: vk::AccelerationStructureKHR,
    address: vk::DeviceAddress,
    ty: vk::AccelerationStructureTypeKHR,
    // Dropped after the structure handle
    storage: GpuBuffer<D>,
}

impl<D: RenderDevice> AccelerationStructure<D> {
    /// Allocate `size` bytes of storage and create a structure in it.
    pub fn new(device: &Arc<D>, ty: vk::AccelerationStructureTypeKHR, size: vk::DeviceSize) -> Result<Self> {
        let storage = GpuBuffer::device_local(
            device,
            size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        )?;
        let handle = device.create_acceleration_structure(ty, storage.handle(), size)?;
        let address = device.acceleration_structure_address(handle);

        Ok(Self {
            device: Arc::clone(device),
            handle,
            address,
            ty,
            storage,
        })
    }

    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.handle
    }

    /// Device address used to reference this structure from instances.
    pub fn address(&self) -> vk::DeviceAddress {
        self.address
    }

    pub fn ty(&self) -> vk::AccelerationStructureTypeKHR {
        self.ty
    }

    pub fn storage_size(&self) -> vk::DeviceSize {
        self.storage.size()
    }
}

impl<D: RenderDevice> Drop for AccelerationStructure<D> {
    fn drop(&mut self) {
        self.device.destroy_acceleration_structure(self.handle);
    }
}

pub(crate) fn scratch_buffer<D: RenderDevice>(device: &Arc<D>, size: vk::DeviceSize) -> Result<GpuBuffer<D>> {
    GpuBuffer::device_local(
        device,
        size,
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
    )
}

pub(crate) struct Built<D: RenderDevice> {
    pub structure: AccelerationStructure<D>,
    pub sizes: BuildSizes,
    pub scratch: GpuBuffer<D>,
}

/// Query sizes, allocate storage, create the structure, allocate scratch,
/// then record one full build and wait for it.
///
/// Scratch covers the update path too when `flags` allows updates, so a
/// caller that keeps it can refit without reallocating.
pub(crate) fn build_structure<D: RenderDevice>(
    device: &Arc<D>,
    commands: &OneTimeCommands<D>,
    input: GeometryInput,
    flags: vk::BuildAccelerationStructureFlagsKHR,
) -> Result<Built<D>> {
    let sizes = device.acceleration_structure_build_sizes(&input, flags);
    log::debug!(
        "{:?} with {} primitives: storage {} bytes, build scratch {}, update scratch {}",
        input.ty(),
        input.primitive_count(),
        sizes.storage,
        sizes.build_scratch,
        sizes.update_scratch
    );

    let structure = AccelerationStructure::new(device, input.ty(), sizes.storage)?;

    let scratch_size = if flags.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE) {
        sizes.build_scratch.max(sizes.update_scratch)
    } else {
        sizes.build_scratch
    };
    let scratch = scratch_buffer(device, scratch_size)?;

    let request = BuildRequest {
        input,
        flags,
        mode: vk::BuildAccelerationStructureModeKHR::BUILD,
        src: vk::AccelerationStructureKHR::null(),
        dst: structure.handle(),
        scratch_address: scratch.address(),
    };
    commands.submit_and_wait(|device, cmd| {
        if let GeometryInput::Instances { .. } = input {
            device.cmd_memory_barrier(cmd, MemoryDependency::HOST_TO_BUILD);
        }
        device.cmd_build_acceleration_structure(cmd, &request);
    })?;

    Ok(Built {
        structure,
        sizes,
        scratch,
    })
}
