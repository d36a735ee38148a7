use super::{
    BuildRequest, BuildSizes, GeometryInput, MemoryDependency, RenderDevice, Submission, TraceDispatch,
};
use crate::error::{RenderError, Result, VkResultExt};
use ash::ext::debug_utils;
use ash::khr::{acceleration_structure, ray_tracing_pipeline, surface, swapchain};
use ash::{vk, Device, Entry, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::{c_void, CStr};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

const REQUIRED_DEVICE_EXTENSIONS: [&CStr; 5] = [
    vk::KHR_SWAPCHAIN_NAME,
    vk::KHR_ACCELERATION_STRUCTURE_NAME,
    vk::KHR_RAY_TRACING_PIPELINE_NAME,
    vk::KHR_DEFERRED_HOST_OPERATIONS_NAME,
    vk::KHR_BUFFER_DEVICE_ADDRESS_NAME,
];

/// Ray tracing limits the pipeline and binding table are laid out against.
#[derive(Clone, Copy, Debug)]
pub struct RayTracingProperties {
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub max_ray_recursion_depth: u32,
}

/// Vulkan instance, surface, device and the KHR loaders the core needs.
pub struct VulkanDevice {
    pub entry: Entry,
    pub instance: Instance,
    debug: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    pub surface_loader: surface::Instance,
    pub surface: vk::SurfaceKHR,
    pub physical_device: vk::PhysicalDevice,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub rt_properties: RayTracingProperties,
    pub device: Device,
    pub queue_family_index: u32,
    pub queue: vk::Queue,

    // Extensions
    pub swapchain_loader: swapchain::Device,
    pub as_loader: acceleration_structure::Device,
    pub rt_pipeline_loader: ray_tracing_pipeline::Device,
}

impl VulkanDevice {
    pub fn new(window: &winit::window::Window, validation: bool) -> Result<Self> {
        let entry = unsafe { Entry::load()? };

        // Instance
        let app_name = c"Dynamic Raytracing";
        let engine_name = c"No Engine";
        let app_info = vk::ApplicationInfo {
            p_application_name: app_name.as_ptr(),
            application_version: 0,
            p_engine_name: engine_name.as_ptr(),
            engine_version: 0,
            api_version: vk::API_VERSION_1_2,
            ..Default::default()
        };

        let display_handle = window.display_handle()?.as_raw();
        let window_handle = window.window_handle()?.as_raw();

        let mut extension_names = ash_window::enumerate_required_extensions(display_handle)
            .op("vkEnumerateInstanceExtensionProperties")?
            .to_vec();

        let validation = validation && validation_layer_available(&entry);
        let layer_names = if validation {
            extension_names.push(vk::EXT_DEBUG_UTILS_NAME.as_ptr());
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            Vec::new()
        };

        let create_info = vk::InstanceCreateInfo {
            p_application_info: &app_info,
            enabled_extension_count: extension_names.len() as u32,
            pp_enabled_extension_names: extension_names.as_ptr(),
            enabled_layer_count: layer_names.len() as u32,
            pp_enabled_layer_names: layer_names.as_ptr(),
            ..Default::default()
        };

        let instance = unsafe { entry.create_instance(&create_info, None).op("vkCreateInstance")? };

        let debug = if validation {
            log::info!("Validation layer enabled");
            let loader = debug_utils::Instance::new(&entry, &instance);
            let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(vulkan_debug_callback));
            let messenger = unsafe {
                loader
                    .create_debug_utils_messenger(&messenger_info, None)
                    .op("vkCreateDebugUtilsMessengerEXT")?
            };
            Some((loader, messenger))
        } else {
            None
        };

        // Surface
        let surface_loader = surface::Instance::new(&entry, &instance);
        let surface = unsafe {
            ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
                .op("vkCreateSurfaceKHR")?
        };

        let pdevices = unsafe { instance.enumerate_physical_devices().op("vkEnumeratePhysicalDevices")? };
        log::info!("Found {} physical device(s)", pdevices.len());
        for (idx, pdevice) in pdevices.iter().enumerate() {
            log_physical_device(&instance, idx, *pdevice);
        }

        let (physical_device, queue_family_index, score) =
            select_physical_device(&instance, &surface_loader, surface, &pdevices)?;

        unsafe {
            let props = instance.get_physical_device_properties(physical_device);
            let device_name = CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy();
            log::info!("Selected GPU: {} (score: {})", device_name, score);
        }

        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let rt_properties = {
            let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
            {
                let mut props2 = vk::PhysicalDeviceProperties2::default().push_next(&mut rt_props);
                unsafe { instance.get_physical_device_properties2(physical_device, &mut props2) };
            }
            RayTracingProperties {
                shader_group_handle_size: rt_props.shader_group_handle_size,
                shader_group_handle_alignment: rt_props.shader_group_handle_alignment,
                shader_group_base_alignment: rt_props.shader_group_base_alignment,
                max_ray_recursion_depth: rt_props.max_ray_recursion_depth,
            }
        };
        log::debug!("Ray tracing properties: {:?}", rt_properties);

        // Device
        let queue_priorities = [1.0];
        let queue_info = vk::DeviceQueueCreateInfo {
            queue_family_index,
            queue_count: 1,
            p_queue_priorities: queue_priorities.as_ptr(),
            ..Default::default()
        };

        let device_extension_names = [
            vk::KHR_SWAPCHAIN_NAME.as_ptr(),
            vk::KHR_ACCELERATION_STRUCTURE_NAME.as_ptr(),
            vk::KHR_RAY_TRACING_PIPELINE_NAME.as_ptr(),
            vk::KHR_DEFERRED_HOST_OPERATIONS_NAME.as_ptr(),
            vk::KHR_SPIRV_1_4_NAME.as_ptr(),
            vk::KHR_SHADER_FLOAT_CONTROLS_NAME.as_ptr(),
            vk::KHR_BUFFER_DEVICE_ADDRESS_NAME.as_ptr(),
        ];

        let mut features12 = vk::PhysicalDeviceVulkan12Features {
            buffer_device_address: vk::TRUE,
            ..Default::default()
        };

        let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR {
            acceleration_structure: vk::TRUE,
            ..Default::default()
        };

        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR {
            ray_tracing_pipeline: vk::TRUE,
            ..Default::default()
        };

        // Chain features
        as_features.p_next = &mut rt_features as *mut _ as *mut _;
        features12.p_next = &mut as_features as *mut _ as *mut _;

        // 64-bit device addresses in the closest-hit shader
        let core_features = vk::PhysicalDeviceFeatures {
            shader_int64: vk::TRUE,
            ..Default::default()
        };

        let device_create_info = vk::DeviceCreateInfo {
            queue_create_info_count: 1,
            p_queue_create_infos: &queue_info,
            p_enabled_features: &core_features,
            enabled_extension_count: device_extension_names.len() as u32,
            pp_enabled_extension_names: device_extension_names.as_ptr(),
            p_next: &mut features12 as *mut _ as *mut _,
            ..Default::default()
        };

        let device = unsafe {
            instance
                .create_device(physical_device, &device_create_info, None)
                .op("vkCreateDevice")?
        };
        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };

        let swapchain_loader = swapchain::Device::new(&instance, &device);
        let as_loader = acceleration_structure::Device::new(&instance, &device);
        let rt_pipeline_loader = ray_tracing_pipeline::Device::new(&instance, &device);

        Ok(Self {
            entry,
            instance,
            debug,
            surface_loader,
            surface,
            physical_device,
            memory_properties,
            rt_properties,
            device,
            queue_family_index,
            queue,
            swapchain_loader,
            as_loader,
            rt_pipeline_loader,
        })
    }
}

fn validation_layer_available(entry: &Entry) -> bool {
    let layers = unsafe { entry.enumerate_instance_layer_properties() }.unwrap_or_default();
    let found = layers.iter().any(|layer| {
        let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
        name == VALIDATION_LAYER
    });
    if !found {
        log::warn!("Validation requested but {:?} is not installed", VALIDATION_LAYER);
    }
    found
}

fn has_extension(available: &[vk::ExtensionProperties], wanted: &CStr) -> bool {
    available.iter().any(|ext| {
        let name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
        name == wanted
    })
}

fn log_physical_device(instance: &Instance, idx: usize, pdevice: vk::PhysicalDevice) {
    unsafe {
        let props = instance.get_physical_device_properties(pdevice);
        let device_name = CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy();

        let device_type = match props.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => "Discrete GPU",
            vk::PhysicalDeviceType::INTEGRATED_GPU => "Integrated GPU",
            vk::PhysicalDeviceType::VIRTUAL_GPU => "Virtual GPU",
            vk::PhysicalDeviceType::CPU => "CPU",
            _ => "Other",
        };

        log::info!(
            "  Device {}: {} ({}) - VRAM: {} MB",
            idx,
            device_name,
            device_type,
            device_local_bytes(instance, pdevice) / (1024 * 1024)
        );

        let available_exts = instance
            .enumerate_device_extension_properties(pdevice)
            .unwrap_or_default();
        log::info!(
            "    Ray Tracing: {}, Acceleration Structure: {}",
            has_extension(&available_exts, vk::KHR_RAY_TRACING_PIPELINE_NAME),
            has_extension(&available_exts, vk::KHR_ACCELERATION_STRUCTURE_NAME)
        );
    }
}

fn device_local_bytes(instance: &Instance, pdevice: vk::PhysicalDevice) -> u64 {
    let mem_props = unsafe { instance.get_physical_device_memory_properties(pdevice) };
    mem_props.memory_heaps[..mem_props.memory_heap_count as usize]
        .iter()
        .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|heap| heap.size)
        .sum()
}

/// Picks the highest scoring device that can present to `surface` and has
/// every required extension. Discrete beats integrated; +1 per GiB of VRAM.
fn select_physical_device(
    instance: &Instance,
    surface_loader: &surface::Instance,
    surface: vk::SurfaceKHR,
    pdevices: &[vk::PhysicalDevice],
) -> Result<(vk::PhysicalDevice, u32, u32)> {
    let mut scored_devices: Vec<(vk::PhysicalDevice, u32, u32)> = Vec::new();

    for pdevice in pdevices.iter() {
        unsafe {
            let props = instance.get_physical_device_properties(*pdevice);
            let queue_families = instance.get_physical_device_queue_family_properties(*pdevice);

            let q_index = queue_families.iter().enumerate().find_map(|(i, q)| {
                let supports_graphics = q
                    .queue_flags
                    .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE);
                let supports_present = surface_loader
                    .get_physical_device_surface_support(*pdevice, i as u32, surface)
                    .unwrap_or(false);

                (supports_graphics && supports_present).then_some(i as u32)
            });

            let Some(queue_idx) = q_index else { continue };

            let available_exts = instance
                .enumerate_device_extension_properties(*pdevice)
                .unwrap_or_default();
            if !REQUIRED_DEVICE_EXTENSIONS
                .iter()
                .all(|required| has_extension(&available_exts, required))
            {
                continue;
            }

            let mut score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 500,
                _ => 100,
            };
            score += (device_local_bytes(instance, *pdevice) / (1024 * 1024 * 1024)) as u32;

            scored_devices.push((*pdevice, queue_idx, score));
        }
    }

    scored_devices.sort_by(|a, b| b.2.cmp(&a.2));
    scored_devices.first().copied().ok_or_else(|| {
        RenderError::NoSuitableDevice(
            "required VK_KHR_ray_tracing_pipeline and VK_KHR_acceleration_structure \
             with a queue that supports graphics, compute and present"
                .into(),
        )
    })
}

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message).to_string_lossy();

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::error!("[{:?}] {}", message_type, message),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::warn!("[{:?}] {}", message_type, message),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => log::info!("[{:?}] {}", message_type, message),
        _ => log::trace!("[{:?}] {}", message_type, message),
    }

    vk::FALSE
}

fn vk_geometry(input: &GeometryInput) -> vk::AccelerationStructureGeometryKHR<'static> {
    match input {
        GeometryInput::Triangles(triangles) => vk::AccelerationStructureGeometryKHR {
            geometry_type: vk::GeometryTypeKHR::TRIANGLES,
            geometry: vk::AccelerationStructureGeometryDataKHR {
                triangles: vk::AccelerationStructureGeometryTrianglesDataKHR {
                    vertex_format: vk::Format::R32G32B32_SFLOAT,
                    vertex_data: vk::DeviceOrHostAddressConstKHR {
                        device_address: triangles.vertex_address,
                    },
                    vertex_stride: triangles.vertex_stride,
                    max_vertex: triangles.max_vertex,
                    index_type: vk::IndexType::UINT32,
                    index_data: vk::DeviceOrHostAddressConstKHR {
                        device_address: triangles.index_address,
                    },
                    ..Default::default()
                },
            },
            flags: vk::GeometryFlagsKHR::OPAQUE,
            ..Default::default()
        },
        GeometryInput::Instances { data, .. } => vk::AccelerationStructureGeometryKHR {
            geometry_type: vk::GeometryTypeKHR::INSTANCES,
            geometry: vk::AccelerationStructureGeometryDataKHR {
                instances: vk::AccelerationStructureGeometryInstancesDataKHR {
                    array_of_pointers: vk::FALSE,
                    data: vk::DeviceOrHostAddressConstKHR { device_address: *data },
                    ..Default::default()
                },
            },
            flags: vk::GeometryFlagsKHR::OPAQUE,
            ..Default::default()
        },
    }
}

impl RenderDevice for VulkanDevice {
    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    fn create_buffer(&self, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Result<vk::Buffer> {
        let create_info = vk::BufferCreateInfo {
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        unsafe { self.device.create_buffer(&create_info, None).op("vkCreateBuffer") }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        let addr_info = vk::BufferDeviceAddressInfo {
            buffer,
            ..Default::default()
        };
        unsafe { self.device.get_buffer_device_address(&addr_info) }
    }

    fn create_image(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> Result<vk::Image> {
        let create_info = vk::ImageCreateInfo {
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        unsafe { self.device.create_image(&create_info, None).op("vkCreateImage") }
    }

    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> Result<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo {
            image,
            view_type: vk::ImageViewType::TYPE_2D,
            format,
            subresource_range: color_subresource(),
            ..Default::default()
        };
        unsafe { self.device.create_image_view(&view_info, None).op("vkCreateImageView") }
    }

    fn destroy_image(&self, image: vk::Image, view: vk::ImageView) {
        unsafe {
            if view != vk::ImageView::null() {
                self.device.destroy_image_view(view, None);
            }
            self.device.destroy_image(image, None);
        }
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        unsafe { self.device.get_image_memory_requirements(image) }
    }

    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
        device_address: bool,
    ) -> Result<vk::DeviceMemory> {
        let mut flags = vk::MemoryAllocateFlagsInfo {
            flags: vk::MemoryAllocateFlags::DEVICE_ADDRESS,
            ..Default::default()
        };
        let mut alloc_info = vk::MemoryAllocateInfo {
            allocation_size: size,
            memory_type_index,
            ..Default::default()
        };
        if device_address {
            alloc_info.p_next = &mut flags as *mut _ as *mut _;
        }
        unsafe { self.device.allocate_memory(&alloc_info, None).op("vkAllocateMemory") }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) };
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> Result<()> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, 0).op("vkBindBufferMemory") }
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> Result<()> {
        unsafe { self.device.bind_image_memory(image, memory, 0).op("vkBindImageMemory") }
    }

    fn write_memory(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        unsafe {
            let ptr = self
                .device
                .map_memory(memory, offset, bytes.len() as u64, vk::MemoryMapFlags::empty())
                .op("vkMapMemory")?;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, bytes.len());
            self.device.unmap_memory(memory);
        }
        Ok(())
    }

    fn acceleration_structure_build_sizes(
        &self,
        input: &GeometryInput,
        flags: vk::BuildAccelerationStructureFlagsKHR,
    ) -> BuildSizes {
        let geometry = vk_geometry(input);
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR {
            ty: input.ty(),
            flags,
            mode: vk::BuildAccelerationStructureModeKHR::BUILD,
            geometry_count: 1,
            p_geometries: &geometry,
            ..Default::default()
        };

        let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.as_loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[input.primitive_count()],
                &mut size_info,
            )
        };

        BuildSizes {
            storage: size_info.acceleration_structure_size,
            build_scratch: size_info.build_scratch_size,
            update_scratch: size_info.update_scratch_size,
        }
    }

    fn create_acceleration_structure(
        &self,
        ty: vk::AccelerationStructureTypeKHR,
        buffer: vk::Buffer,
        size: vk::DeviceSize,
    ) -> Result<vk::AccelerationStructureKHR> {
        let create_info = vk::AccelerationStructureCreateInfoKHR {
            buffer,
            size,
            ty,
            ..Default::default()
        };
        unsafe {
            self.as_loader
                .create_acceleration_structure(&create_info, None)
                .op("vkCreateAccelerationStructureKHR")
        }
    }

    fn destroy_acceleration_structure(&self, structure: vk::AccelerationStructureKHR) {
        unsafe { self.as_loader.destroy_acceleration_structure(structure, None) };
    }

    fn acceleration_structure_address(&self, structure: vk::AccelerationStructureKHR) -> vk::DeviceAddress {
        let info = vk::AccelerationStructureDeviceAddressInfoKHR {
            acceleration_structure: structure,
            ..Default::default()
        };
        unsafe { self.as_loader.get_acceleration_structure_device_address(&info) }
    }

    fn create_command_pool(&self) -> Result<vk::CommandPool> {
        let command_pool_info = vk::CommandPoolCreateInfo {
            queue_family_index: self.queue_family_index,
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            ..Default::default()
        };
        unsafe {
            self.device
                .create_command_pool(&command_pool_info, None)
                .op("vkCreateCommandPool")
        }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffers(&self, pool: vk::CommandPool, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo {
            command_pool: pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: count,
            ..Default::default()
        };
        unsafe {
            self.device
                .allocate_command_buffers(&alloc_info)
                .op("vkAllocateCommandBuffers")
        }
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        unsafe {
            self.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
                .op("vkResetCommandBuffer")
        }
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo {
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        unsafe {
            self.device
                .begin_command_buffer(command_buffer, &begin_info)
                .op("vkBeginCommandBuffer")
        }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device.end_command_buffer(command_buffer).op("vkEndCommandBuffer") }
    }

    fn cmd_build_acceleration_structure(&self, command_buffer: vk::CommandBuffer, request: &BuildRequest) {
        let geometry = vk_geometry(&request.input);
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR {
            ty: request.input.ty(),
            flags: request.flags,
            mode: request.mode,
            src_acceleration_structure: request.src,
            dst_acceleration_structure: request.dst,
            geometry_count: 1,
            p_geometries: &geometry,
            scratch_data: vk::DeviceOrHostAddressKHR {
                device_address: request.scratch_address,
            },
            ..Default::default()
        };

        let build_range = vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count: request.input.primitive_count(),
            primitive_offset: 0,
            first_vertex: 0,
            transform_offset: 0,
        };

        unsafe {
            self.as_loader
                .cmd_build_acceleration_structures(command_buffer, &[build_info], &[&[build_range]])
        };
    }

    fn cmd_memory_barrier(&self, command_buffer: vk::CommandBuffer, dependency: MemoryDependency) {
        let barrier = vk::MemoryBarrier {
            src_access_mask: dependency.src_access,
            dst_access_mask: dependency.dst_access,
            ..Default::default()
        };
        unsafe {
            self.device.cmd_pipeline_barrier(
                command_buffer,
                dependency.src_stage,
                dependency.dst_stage,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            )
        };
    }

    fn cmd_transition_image(
        &self,
        command_buffer: vk::CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        let barrier = vk::ImageMemoryBarrier {
            old_layout,
            new_layout,
            image,
            subresource_range: color_subresource(),
            src_access_mask: vk::AccessFlags::MEMORY_WRITE,
            dst_access_mask: vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            ..Default::default()
        };
        unsafe {
            self.device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            )
        };
    }

    fn cmd_trace_rays(&self, command_buffer: vk::CommandBuffer, dispatch: &TraceDispatch) {
        unsafe {
            self.device.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                dispatch.pipeline,
            );
            self.device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                dispatch.layout,
                0,
                &[dispatch.descriptor_set],
                &[],
            );
            self.rt_pipeline_loader.cmd_trace_rays(
                command_buffer,
                &dispatch.regions[0],
                &dispatch.regions[1],
                &dispatch.regions[2],
                &dispatch.regions[3],
                dispatch.extent.width,
                dispatch.extent.height,
                1,
            );
        }
    }

    fn cmd_blit_to_present(
        &self,
        command_buffer: vk::CommandBuffer,
        source: vk::Image,
        target: vk::Image,
        extent: vk::Extent2D,
    ) {
        let barriers = present_blit_barriers(source, target);

        let far_corner = vk::Offset3D {
            x: extent.width as i32,
            y: extent.height as i32,
            z: 1,
        };
        let layers = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let blit = vk::ImageBlit {
            src_offsets: [vk::Offset3D::default(), far_corner],
            src_subresource: layers,
            dst_offsets: [vk::Offset3D::default(), far_corner],
            dst_subresource: layers,
        };

        unsafe {
            self.device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR | vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &barriers.to_transfer,
            );

            self.device.cmd_blit_image(
                command_buffer,
                source,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                target,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::NEAREST,
            );

            self.device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barriers.to_present],
            );
            self.device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barriers.to_general],
            );
        }
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let fence_info = vk::FenceCreateInfo {
            flags: if signaled {
                vk::FenceCreateFlags::SIGNALED
            } else {
                vk::FenceCreateFlags::empty()
            },
            ..Default::default()
        };
        unsafe { self.device.create_fence(&fence_info, None).op("vkCreateFence") }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        unsafe { self.device.create_semaphore(&semaphore_info, None).op("vkCreateSemaphore") }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns).op("vkWaitForFences") }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.reset_fences(&[fence]).op("vkResetFences") }
    }

    fn queue_submit(&self, submission: &Submission) -> Result<()> {
        let command_buffers = [submission.command_buffer];
        let wait_semaphores: Vec<vk::Semaphore> = submission.wait.iter().map(|w| w.0).collect();
        let wait_stages: Vec<vk::PipelineStageFlags> = submission.wait.iter().map(|w| w.1).collect();
        let signal_semaphores: Vec<vk::Semaphore> = submission.signal.iter().copied().collect();

        let submit_info = vk::SubmitInfo::default()
            .command_buffers(&command_buffers)
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device
                .queue_submit(self.queue, &[submit_info], submission.fence)
                .op("vkQueueSubmit")
        }
    }

    fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle().op("vkDeviceWaitIdle") }
    }
}

/// Layout transitions around the copy of the storage image into a
/// presentable image.
struct PresentBlitBarriers {
    /// Storage to transfer src, presentable image to transfer dst.
    to_transfer: [vk::ImageMemoryBarrier<'static>; 2],
    to_present: vk::ImageMemoryBarrier<'static>,
    /// Storage back to general. The next trace loads the running average
    /// before storing over it, so both accesses wait on the blit.
    to_general: vk::ImageMemoryBarrier<'static>,
}

fn present_blit_barriers(source: vk::Image, target: vk::Image) -> PresentBlitBarriers {
    let subresource = color_subresource();
    PresentBlitBarriers {
        to_transfer: [
            vk::ImageMemoryBarrier {
                old_layout: vk::ImageLayout::GENERAL,
                new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                image: source,
                subresource_range: subresource,
                src_access_mask: vk::AccessFlags::SHADER_WRITE,
                dst_access_mask: vk::AccessFlags::TRANSFER_READ,
                ..Default::default()
            },
            vk::ImageMemoryBarrier {
                old_layout: vk::ImageLayout::UNDEFINED,
                new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                image: target,
                subresource_range: subresource,
                src_access_mask: vk::AccessFlags::empty(),
                dst_access_mask: vk::AccessFlags::TRANSFER_WRITE,
                ..Default::default()
            },
        ],
        to_present: vk::ImageMemoryBarrier {
            old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            image: target,
            subresource_range: subresource,
            src_access_mask: vk::AccessFlags::TRANSFER_WRITE,
            dst_access_mask: vk::AccessFlags::empty(),
            ..Default::default()
        },
        to_general: vk::ImageMemoryBarrier {
            old_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            new_layout: vk::ImageLayout::GENERAL,
            image: source,
            subresource_range: subresource,
            src_access_mask: vk::AccessFlags::TRANSFER_READ,
            dst_access_mask: vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            ..Default::default()
        },
    }
}

fn color_subresource() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::debug!("Destroying Vulkan device");
        unsafe {
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}
