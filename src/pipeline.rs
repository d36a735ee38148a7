//! Descriptor layout, shader compilation and the ray tracing pipeline.

use crate::device::{SbtRegions, TraceDispatch, VulkanDevice};
use crate::error::{RenderError, Result, VkResultExt};
use crate::sbt::SbtLayout;
use ash::vk;
use std::path::Path;
use std::sync::Arc;

/// Pipeline stages in group order: raygen, miss, shadow miss, closest hit.
const STAGES: [(&str, shaderc::ShaderKind, vk::ShaderStageFlags); 4] = [
    ("raygen.rgen", shaderc::ShaderKind::RayGeneration, vk::ShaderStageFlags::RAYGEN_KHR),
    ("miss.rmiss", shaderc::ShaderKind::Miss, vk::ShaderStageFlags::MISS_KHR),
    ("shadow.rmiss", shaderc::ShaderKind::Miss, vk::ShaderStageFlags::MISS_KHR),
    ("closesthit.rchit", shaderc::ShaderKind::ClosestHit, vk::ShaderStageFlags::CLOSEST_HIT_KHR),
];

pub const HIT_GROUPS: u32 = 1;

/// Resources bound to the single descriptor set.
pub struct Bindings {
    pub tlas: vk::AccelerationStructureKHR,
    pub storage_view: vk::ImageView,
    pub uniform_buffer: vk::Buffer,
    pub object_buffer: vk::Buffer,
}

/// Compile one GLSL ray tracing stage to SPIR-V 1.4.
pub fn compile_shader(path: &Path, kind: shaderc::ShaderKind) -> Result<Vec<u32>> {
    let name = path.display().to_string();
    let fail = |message: String| RenderError::ShaderCompilation {
        path: name.clone(),
        message,
    };

    let source = std::fs::read_to_string(path).map_err(|err| fail(err.to_string()))?;
    let compiler = shaderc::Compiler::new().ok_or_else(|| fail("shaderc unavailable".into()))?;
    let mut options =
        shaderc::CompileOptions::new().ok_or_else(|| fail("shaderc options unavailable".into()))?;
    options.set_target_env(shaderc::TargetEnv::Vulkan, shaderc::EnvVersion::Vulkan1_2 as u32);
    options.set_target_spirv(shaderc::SpirvVersion::V1_4);

    let binary = compiler
        .compile_into_spirv(&source, kind, &name, "main", Some(&options))
        .map_err(|err| fail(err.to_string()))?;
    if binary.get_num_warnings() > 0 {
        log::warn!("{}: {}", name, binary.get_warning_messages());
    }
    log::debug!("Compiled {} ({} words)", name, binary.as_binary().len());
    Ok(binary.as_binary().to_vec())
}

pub struct RayTracingPipeline {
    device: Arc<VulkanDevice>,
    descriptor_pool: vk::DescriptorPool,
    descriptor_set_layout: vk::DescriptorSetLayout,
    /// One per frame slot.
    descriptor_sets: Vec<vk::DescriptorSet>,
    layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
}

impl RayTracingPipeline {
    pub fn new(device: &Arc<VulkanDevice>, shader_dir: &Path, max_recursion: u32, set_count: u32) -> Result<Self> {
        // Handles start out null and are filled in as they are created, so
        // Drop releases exactly what exists if a later step fails.
        let mut this = Self {
            device: Arc::clone(device),
            descriptor_pool: vk::DescriptorPool::null(),
            descriptor_set_layout: vk::DescriptorSetLayout::null(),
            descriptor_sets: Vec::new(),
            layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
        };
        let ctx = &device.device;

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                descriptor_count: set_count,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: set_count,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: set_count,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: set_count,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(set_count)
            .pool_sizes(&pool_sizes);
        this.descriptor_pool = unsafe {
            ctx.create_descriptor_pool(&pool_info, None)
                .op("vkCreateDescriptorPool")?
        };

        let hit_and_gen = vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR;
        let bindings = [
            vk::DescriptorSetLayoutBinding::default()
                .binding(0)
                .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                .descriptor_count(1)
                .stage_flags(hit_and_gen),
            vk::DescriptorSetLayoutBinding::default()
                .binding(1)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::RAYGEN_KHR),
            vk::DescriptorSetLayoutBinding::default()
                .binding(2)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1)
                .stage_flags(hit_and_gen),
            vk::DescriptorSetLayoutBinding::default()
                .binding(3)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::CLOSEST_HIT_KHR),
        ];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        this.descriptor_set_layout = unsafe {
            ctx.create_descriptor_set_layout(&layout_info, None)
                .op("vkCreateDescriptorSetLayout")?
        };

        let set_layouts = vec![this.descriptor_set_layout; set_count as usize];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(this.descriptor_pool)
            .set_layouts(&set_layouts);
        // Freed with the pool
        this.descriptor_sets = unsafe {
            ctx.allocate_descriptor_sets(&alloc_info)
                .op("vkAllocateDescriptorSets")?
        };

        let set_layouts = [this.descriptor_set_layout];
        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        this.layout = unsafe {
            ctx.create_pipeline_layout(&pipeline_layout_info, None)
                .op("vkCreatePipelineLayout")?
        };

        let mut modules = Vec::with_capacity(STAGES.len());
        let created = this.create_pipeline(shader_dir, max_recursion, &mut modules);
        for module in modules {
            unsafe { ctx.destroy_shader_module(module, None) };
        }
        this.pipeline = created?;

        Ok(this)
    }

    fn create_pipeline(
        &self,
        shader_dir: &Path,
        max_recursion: u32,
        modules: &mut Vec<vk::ShaderModule>,
    ) -> Result<vk::Pipeline> {
        let ctx = &self.device.device;

        for (file, kind, _) in STAGES {
            let code = compile_shader(&shader_dir.join(file), kind)?;
            let info = vk::ShaderModuleCreateInfo::default().code(&code);
            modules.push(unsafe { ctx.create_shader_module(&info, None).op("vkCreateShaderModule")? });
        }

        let entry_name = c"main";
        let stages: Vec<vk::PipelineShaderStageCreateInfo> = STAGES
            .iter()
            .zip(modules.iter())
            .map(|((_, _, stage), &module)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(*stage)
                    .module(module)
                    .name(entry_name)
            })
            .collect();

        let general = |shader: u32| vk::RayTracingShaderGroupCreateInfoKHR {
            ty: vk::RayTracingShaderGroupTypeKHR::GENERAL,
            general_shader: shader,
            closest_hit_shader: vk::SHADER_UNUSED_KHR,
            any_hit_shader: vk::SHADER_UNUSED_KHR,
            intersection_shader: vk::SHADER_UNUSED_KHR,
            ..Default::default()
        };
        let groups = [
            general(0),
            general(1),
            general(2),
            vk::RayTracingShaderGroupCreateInfoKHR {
                ty: vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
                general_shader: vk::SHADER_UNUSED_KHR,
                closest_hit_shader: 3,
                any_hit_shader: vk::SHADER_UNUSED_KHR,
                intersection_shader: vk::SHADER_UNUSED_KHR,
                ..Default::default()
            },
        ];

        let device_limit = self.device.rt_properties.max_ray_recursion_depth;
        let recursion = max_recursion.clamp(1, device_limit.max(1));
        if recursion != max_recursion {
            log::warn!(
                "Ray recursion depth {} clamped to device limit {}",
                max_recursion,
                recursion
            );
        }

        let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(recursion)
            .layout(self.layout);
        let pipelines = unsafe {
            self.device
                .rt_pipeline_loader
                .create_ray_tracing_pipelines(
                    vk::DeferredOperationKHR::null(),
                    vk::PipelineCache::null(),
                    &[pipeline_info],
                    None,
                )
                .map_err(|(_, result)| RenderError::from_vk("vkCreateRayTracingPipelinesKHR", result))?
        };

        log::info!(
            "Ray tracing pipeline: {} stages, {} groups, recursion depth {}",
            stages.len(),
            groups.len(),
            recursion
        );
        Ok(pipelines[0])
    }

    /// Point descriptor set `set` at its resources.
    pub fn bind(&self, set: usize, bindings: &Bindings) {
        let descriptor_set = self.descriptor_sets[set];
        let structures = [bindings.tlas];
        let mut tlas_write =
            vk::WriteDescriptorSetAccelerationStructureKHR::default().acceleration_structures(&structures);
        let image_info = [vk::DescriptorImageInfo {
            image_view: bindings.storage_view,
            image_layout: vk::ImageLayout::GENERAL,
            ..Default::default()
        }];
        let uniform_info = [vk::DescriptorBufferInfo {
            buffer: bindings.uniform_buffer,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }];
        let object_info = [vk::DescriptorBufferInfo {
            buffer: bindings.object_buffer,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }];

        let writes = [
            vk::WriteDescriptorSet::default()
                .dst_set(descriptor_set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                .descriptor_count(1)
                .push_next(&mut tlas_write),
            vk::WriteDescriptorSet::default()
                .dst_set(descriptor_set)
                .dst_binding(1)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .image_info(&image_info),
            vk::WriteDescriptorSet::default()
                .dst_set(descriptor_set)
                .dst_binding(2)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&uniform_info),
            vk::WriteDescriptorSet::default()
                .dst_set(descriptor_set)
                .dst_binding(3)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&object_info),
        ];
        unsafe { self.device.device.update_descriptor_sets(&writes, &[]) };
    }

    /// Group handles, tightly packed in group order.
    pub fn shader_group_handles(&self, layout: &SbtLayout) -> Result<Vec<u8>> {
        let count = layout.group_count();
        let size = (self.device.rt_properties.shader_group_handle_size * count) as usize;
        unsafe {
            self.device
                .rt_pipeline_loader
                .get_ray_tracing_shader_group_handles(self.pipeline, 0, count, size)
                .op("vkGetRayTracingShaderGroupHandlesKHR")
        }
    }

    pub fn dispatch(
        &self,
        set: usize,
        regions: SbtRegions,
        extent: vk::Extent2D,
        storage_image: vk::Image,
    ) -> TraceDispatch {
        TraceDispatch {
            pipeline: self.pipeline,
            layout: self.layout,
            descriptor_set: self.descriptor_sets[set],
            regions,
            extent,
            storage_image,
        }
    }
}

impl Drop for RayTracingPipeline {
    fn drop(&mut self) {
        // Null handles are ignored by vkDestroy*
        let ctx = &self.device.device;
        unsafe {
            ctx.destroy_pipeline(self.pipeline, None);
            ctx.destroy_pipeline_layout(self.layout, None);
            ctx.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
            ctx.destroy_descriptor_pool(self.descriptor_pool, None);
        }
    }
}
