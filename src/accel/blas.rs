use super::{build_structure, AccelerationStructure};
use crate::bounds::Aabb;
use crate::commands::OneTimeCommands;
use crate::device::{GeometryInput, RenderDevice, TriangleGeometry};
use crate::error::Result;
use ash::vk;
use std::sync::Arc;

/// Spatial index over one mesh. Built once, never updated.
pub struct BottomLevelStructure<D: RenderDevice> {
    structure: AccelerationStructure<D>,
    geometry: TriangleGeometry,
    bounds: Aabb,
}

impl<D: RenderDevice> BottomLevelStructure<D> {
    /// Build over `geometry` and block until the device has finished.
    /// Scratch memory is released before returning.
    pub fn build(
        device: &Arc<D>,
        commands: &OneTimeCommands<D>,
        geometry: TriangleGeometry,
        bounds: Aabb,
    ) -> Result<Self> {
        let built = build_structure(
            device,
            commands,
            GeometryInput::Triangles(geometry),
            vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
        )?;

        log::info!(
            "Built BLAS: {} triangles, {} bytes at {:#x}",
            geometry.primitive_count,
            built.sizes.storage,
            built.structure.address()
        );

        Ok(Self {
            structure: built.structure,
            geometry,
            bounds,
        })
    }

    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.structure.handle()
    }

    pub fn address(&self) -> vk::DeviceAddress {
        self.structure.address()
    }

    pub fn primitive_count(&self) -> u32 {
        self.geometry.primitive_count
    }

    pub fn storage_size(&self) -> vk::DeviceSize {
        self.structure.storage_size()
    }

    /// Local-space bounds of the source mesh.
    pub fn bounds(&self) -> Aabb {
        self.bounds
    }
}
