use super::{build_structure, scratch_buffer, AccelerationStructure, BottomLevelStructure};
use crate::bounds::Aabb;
use crate::commands::OneTimeCommands;
use crate::device::{BuildRequest, GeometryInput, MemoryDependency, RenderDevice};
use crate::error::{RenderError, Result};
use crate::memory::GpuBuffer;
use ash::vk;
use glam::{Affine3A, Mat4};
use std::mem::size_of;
use std::sync::Arc;

const INSTANCE_SIZE: vk::DeviceSize = size_of::<vk::AccelerationStructureInstanceKHR>() as vk::DeviceSize;

/// One placement of a bottom-level structure in the scene.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Instance {
    pub blas_address: vk::DeviceAddress,
    /// Local bounds of the referenced mesh.
    pub local_bounds: Aabb,
    pub transform: Affine3A,
    /// Visible to shaders as `gl_InstanceCustomIndexEXT`; indexes the object table.
    pub tag: u32,
    pub mask: u8,
}

impl Instance {
    pub fn new<D: RenderDevice>(blas: &BottomLevelStructure<D>, transform: Affine3A, tag: u32) -> Self {
        Self {
            blas_address: blas.address(),
            local_bounds: blas.bounds(),
            transform,
            tag,
            mask: 0xFF,
        }
    }

    pub fn world_bounds(&self) -> Aabb {
        self.local_bounds.transform(&self.transform)
    }

    fn to_vk(self) -> vk::AccelerationStructureInstanceKHR {
        // Row-major 3x4: the first three rows of the matrix
        let rows = Mat4::from(self.transform).transpose().to_cols_array();
        let mut matrix = [0.0; 12];
        matrix.copy_from_slice(&rows[..12]);

        vk::AccelerationStructureInstanceKHR {
            transform: vk::TransformMatrixKHR { matrix },
            instance_custom_index_and_mask: vk::Packed24_8::new(self.tag, self.mask),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                0,
                vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: self.blas_address,
            },
        }
    }
}

fn instance_bytes(instances: &[vk::AccelerationStructureInstanceKHR]) -> &[u8] {
    // SAFETY: the instance struct is plain repr(C) data with no padding
    unsafe { std::slice::from_raw_parts(instances.as_ptr() as *const u8, std::mem::size_of_val(instances)) }
}

/// The scene-wide structure. Built once, then updated in place.
///
/// Storage, the instance array and scratch are allocated at build time and
/// reused by every refit. Only scratch may grow, and only if the device asks
/// for more update scratch than was reserved.
pub struct TopLevelStructure<D: RenderDevice> {
    device: Arc<D>,
    structure: AccelerationStructure<D>,
    instance_buffer: GpuBuffer<D>,
    scratch: GpuBuffer<D>,
    instances: Vec<Instance>,
    bounds: Aabb,
    refits: u64,
}

impl<D: RenderDevice> TopLevelStructure<D> {
    pub const FLAGS: vk::BuildAccelerationStructureFlagsKHR = vk::BuildAccelerationStructureFlagsKHR::from_raw(
        vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE.as_raw()
            | vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE.as_raw(),
    );

    pub fn build(device: &Arc<D>, commands: &OneTimeCommands<D>, instances: &[Instance]) -> Result<Self> {
        let count = instances.len() as u32;
        let instance_buffer = GpuBuffer::host_visible(
            device,
            INSTANCE_SIZE * count.max(1) as vk::DeviceSize,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        )?;
        upload_instances(&instance_buffer, instances)?;

        let input = GeometryInput::Instances {
            data: instance_buffer.address(),
            count,
        };
        let built = build_structure(device, commands, input, Self::FLAGS)?;
        let bounds = scene_bounds(instances);

        log::info!(
            "Built TLAS: {} instances, {} bytes, scene extent {:?}",
            count,
            built.sizes.storage,
            bounds.size()
        );

        Ok(Self {
            device: Arc::clone(device),
            structure: built.structure,
            instance_buffer,
            scratch: built.scratch,
            instances: instances.to_vec(),
            bounds,
            refits: 0,
        })
    }

    /// Update the structure in place with new transforms.
    ///
    /// The instance count is fixed at build time. Blocks until the update
    /// has run, so the next trace submitted on the queue sees it.
    pub fn refit(&mut self, commands: &OneTimeCommands<D>, instances: &[Instance]) -> Result<()> {
        let built = self.instances.len() as u32;
        let requested = instances.len() as u32;
        if built != requested {
            return Err(RenderError::TopologyChanged { built, requested });
        }

        upload_instances(&self.instance_buffer, instances)?;

        let input = GeometryInput::Instances {
            data: self.instance_buffer.address(),
            count: requested,
        };
        let sizes = self.device.acceleration_structure_build_sizes(&input, Self::FLAGS);
        if sizes.update_scratch > self.scratch.size() {
            log::debug!(
                "Growing TLAS scratch from {} to {} bytes",
                self.scratch.size(),
                sizes.update_scratch
            );
            self.scratch = scratch_buffer(&self.device, sizes.update_scratch)?;
        }

        let request = BuildRequest {
            input,
            flags: Self::FLAGS,
            mode: vk::BuildAccelerationStructureModeKHR::UPDATE,
            src: self.structure.handle(),
            dst: self.structure.handle(),
            scratch_address: self.scratch.address(),
        };
        commands.submit_and_wait(|device, cmd| {
            device.cmd_memory_barrier(cmd, MemoryDependency::TRACE_TO_BUILD);
            device.cmd_memory_barrier(cmd, MemoryDependency::HOST_TO_BUILD);
            device.cmd_build_acceleration_structure(cmd, &request);
        })?;

        self.instances.copy_from_slice(instances);
        self.bounds = scene_bounds(instances);
        self.refits += 1;
        log::trace!("TLAS refit #{}", self.refits);
        Ok(())
    }

    /// Refit only if some instance differs from the last upload.
    /// Returns whether GPU work was issued.
    pub fn refit_if_changed(&mut self, commands: &OneTimeCommands<D>, instances: &[Instance]) -> Result<bool> {
        if instances == self.instances.as_slice() {
            return Ok(false);
        }
        self.refit(commands, instances)?;
        Ok(true)
    }

    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.structure.handle()
    }

    pub fn address(&self) -> vk::DeviceAddress {
        self.structure.address()
    }

    pub fn storage_size(&self) -> vk::DeviceSize {
        self.structure.storage_size()
    }

    pub fn scratch_size(&self) -> vk::DeviceSize {
        self.scratch.size()
    }

    pub fn instance_count(&self) -> u32 {
        self.instances.len() as u32
    }

    /// Instances as of the last build or refit.
    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    /// World-space union of every instance's bounds as of the last build or refit.
    pub fn bounds(&self) -> Aabb {
        self.bounds
    }

    pub fn refit_count(&self) -> u64 {
        self.refits
    }
}

fn upload_instances<D: RenderDevice>(buffer: &GpuBuffer<D>, instances: &[Instance]) -> Result<()> {
    let raw: Vec<vk::AccelerationStructureInstanceKHR> = instances.iter().map(|i| i.to_vk()).collect();
    buffer.write_at(0, instance_bytes(&raw))
}

fn scene_bounds(instances: &[Instance]) -> Aabb {
    instances
        .iter()
        .fold(Aabb::empty(), |acc, instance| acc.union(&instance.world_bounds()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{MockDevice, Recorded};
    use crate::geometry::GeometryBuffers;
    use crate::scene::create_cube;
    use glam::Vec3;

    struct Fixture {
        device: Arc<MockDevice>,
        commands: OneTimeCommands<MockDevice>,
        _geometry: GeometryBuffers<MockDevice>,
        blas: BottomLevelStructure<MockDevice>,
    }

    fn fixture() -> Fixture {
        let device = Arc::new(MockDevice::new());
        let commands = OneTimeCommands::new(&device, u64::MAX).unwrap();
        let cube = create_cube();
        let geometry = GeometryBuffers::upload(&device, std::slice::from_ref(&cube)).unwrap();
        let blas =
            BottomLevelStructure::build(&device, &commands, geometry.objects()[0].triangles(), cube.bounds())
                .unwrap();
        Fixture {
            device,
            commands,
            _geometry: geometry,
            blas,
        }
    }

    fn two_instances(blas: &BottomLevelStructure<MockDevice>, z: f32) -> Vec<Instance> {
        vec![
            Instance::new(blas, Affine3A::IDENTITY, 0),
            Instance::new(blas, Affine3A::from_translation(Vec3::new(0.0, 0.0, z)), 1),
        ]
    }

    fn last_build(device: &MockDevice) -> BuildRequest {
        let submissions = device.submissions();
        let commands = &submissions.last().unwrap().commands;
        commands
            .iter()
            .find_map(|c| match c {
                Recorded::Build(request) => Some(*request),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn two_instance_build_then_refit_in_place() {
        let f = fixture();
        let mut tlas = TopLevelStructure::build(&f.device, &f.commands, &two_instances(&f.blas, 5.0)).unwrap();

        assert_eq!(tlas.instance_count(), 2);
        let build = last_build(&f.device);
        assert_eq!(build.mode, vk::BuildAccelerationStructureModeKHR::BUILD);
        assert_eq!(build.input.primitive_count(), 2);
        assert!(build.flags.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE));

        let storage = tlas.storage_size();
        let handle = tlas.handle();
        let structures = f.device.live_structures();
        let buffers = f.device.live_buffers();

        tlas.refit(&f.commands, &two_instances(&f.blas, 6.0)).unwrap();

        let update = last_build(&f.device);
        assert_eq!(update.mode, vk::BuildAccelerationStructureModeKHR::UPDATE);
        assert_eq!(update.src, handle);
        assert_eq!(update.dst, handle);
        assert_eq!(tlas.storage_size(), storage);
        assert_eq!(f.device.live_structures(), structures);
        assert_eq!(f.device.live_buffers(), buffers);
        assert_eq!(tlas.refit_count(), 1);
    }

    #[test]
    fn refit_uploads_new_transform() {
        let f = fixture();
        let mut tlas = TopLevelStructure::build(&f.device, &f.commands, &two_instances(&f.blas, 5.0)).unwrap();
        tlas.refit(&f.commands, &two_instances(&f.blas, 6.0)).unwrap();

        let bytes = f.device.read_buffer(tlas.instance_buffer.handle());
        // Second instance, row 2, column 3: the z translation
        let offset = INSTANCE_SIZE as usize + 11 * 4;
        let z = f32::from_ne_bytes(bytes[offset..offset + 4].try_into().unwrap());
        assert_eq!(z, 6.0);
        // Reference points at the shared BLAS
        let reference = INSTANCE_SIZE as usize + 56;
        let address = u64::from_ne_bytes(bytes[reference..reference + 8].try_into().unwrap());
        assert_eq!(address, f.blas.address());
    }

    #[test]
    fn refit_orders_after_previous_trace() {
        let f = fixture();
        let mut tlas = TopLevelStructure::build(&f.device, &f.commands, &two_instances(&f.blas, 5.0)).unwrap();
        tlas.refit(&f.commands, &two_instances(&f.blas, 6.0)).unwrap();

        let submissions = f.device.submissions();
        let commands = &submissions.last().unwrap().commands;
        assert!(matches!(
            commands.first(),
            Some(Recorded::Barrier(dep)) if *dep == MemoryDependency::TRACE_TO_BUILD
        ));
    }

    #[test]
    fn repeated_refit_does_not_drift() {
        let f = fixture();
        let instances = two_instances(&f.blas, 5.0);
        let mut tlas = TopLevelStructure::build(&f.device, &f.commands, &instances).unwrap();
        let built = tlas.bounds();

        tlas.refit(&f.commands, &instances).unwrap();
        let once = tlas.bounds();
        tlas.refit(&f.commands, &instances).unwrap();
        let twice = tlas.bounds();

        assert_eq!(built, once);
        assert_eq!(once, twice);
        assert_eq!(twice.min, Vec3::splat(-0.5));
        assert_eq!(twice.max, Vec3::new(0.5, 0.5, 5.5));
    }

    #[test]
    fn unchanged_transforms_skip_refit() {
        let f = fixture();
        let instances = two_instances(&f.blas, 5.0);
        let mut tlas = TopLevelStructure::build(&f.device, &f.commands, &instances).unwrap();
        let submitted = f.device.submissions().len();

        assert!(!tlas.refit_if_changed(&f.commands, &instances).unwrap());
        assert_eq!(f.device.submissions().len(), submitted);

        assert!(tlas.refit_if_changed(&f.commands, &two_instances(&f.blas, 6.0)).unwrap());
        assert_eq!(f.device.submissions().len(), submitted + 1);
    }

    #[test]
    fn instance_count_change_is_rejected() {
        let f = fixture();
        let mut tlas = TopLevelStructure::build(&f.device, &f.commands, &two_instances(&f.blas, 5.0)).unwrap();

        let mut three = two_instances(&f.blas, 5.0);
        three.push(Instance::new(&f.blas, Affine3A::IDENTITY, 2));
        let err = tlas.refit(&f.commands, &three).unwrap_err();

        assert!(matches!(err, RenderError::TopologyChanged { built: 2, requested: 3 }));
        assert_eq!(tlas.refit_count(), 0);
    }

    #[test]
    fn scratch_covers_update_without_growth() {
        let f = fixture();
        let mut tlas = TopLevelStructure::build(&f.device, &f.commands, &two_instances(&f.blas, 5.0)).unwrap();
        let scratch = tlas.scratch_size();

        for z in [6.0, 7.0, 8.0] {
            tlas.refit(&f.commands, &two_instances(&f.blas, z)).unwrap();
        }
        assert_eq!(tlas.scratch_size(), scratch);
    }
}
