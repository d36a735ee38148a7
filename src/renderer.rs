use crate::accel::{BottomLevelStructure, Instance, TopLevelStructure};
use crate::camera::Camera;
use crate::commands::OneTimeCommands;
use crate::config::RendererConfig;
use crate::device::{RenderDevice, VulkanDevice};
use crate::driver::{CameraView, FrameDriver};
use crate::error::Result;
use crate::frame::FramePipeline;
use crate::geometry::GeometryBuffers;
use crate::memory::{GpuBuffer, GpuImage};
use crate::pipeline::{Bindings, RayTracingPipeline, HIT_GROUPS};
use crate::sbt::{SbtLayout, ShaderBindingTable};
use crate::scene::Scene;
use crate::surface::{PresentationSurface, Swapchain};
use crate::uniforms::UniformPublisher;
use ash::vk;
use glam::Vec3;
use std::sync::Arc;
use std::time::Instant;
use winit::event::ElementState;
use winit::keyboard::KeyCode;
use winit::window::Window;

/// Accumulation target. Storage support for this format is mandatory.
const STORAGE_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;
const LIGHT_POSITION: Vec3 = Vec3::new(5.0, 10.0, 5.0);

type Device = VulkanDevice;

/// Owns every GPU resource and drives one frame per `render` call.
///
/// Fields drop top to bottom, after `Drop::drop` has waited for the device
/// to go idle.
pub struct Renderer {
    driver: FrameDriver<Device>,
    sbt: ShaderBindingTable<Device>,
    pipeline: RayTracingPipeline,
    #[allow(dead_code)] // read through the descriptor sets
    object_buffer: GpuBuffer<Device>,
    blases: Vec<BottomLevelStructure<Device>>,
    geometry: GeometryBuffers<Device>,
    storage_image: GpuImage<Device>,
    swapchain: Swapchain,
    device: Arc<Device>,

    scene: Scene,
    pub camera: Camera,
    started: Instant,
    last_frame: Instant,
}

impl Renderer {
    pub fn new(window: &Window, config: &RendererConfig) -> Result<Self> {
        log::info!("Initializing Vulkan device...");
        let device = Arc::new(VulkanDevice::new(window, config.validation)?);

        let size = window.inner_size();
        let swapchain = Swapchain::new(&device, size.width, size.height)?;
        let extent = swapchain.extent();
        let commands = OneTimeCommands::new(&device, config.fence_timeout_ns)?;

        log::info!("Building scene and acceleration structures...");
        let scene = Scene::new(config.orbit_speed);
        let geometry = GeometryBuffers::upload(&device, &scene.meshes)?;

        let blases = scene
            .meshes
            .iter()
            .zip(geometry.objects())
            .map(|(mesh, object)| BottomLevelStructure::build(&device, &commands, object.triangles(), mesh.bounds()))
            .collect::<Result<Vec<_>>>()?;

        let instances: Vec<Instance> = scene
            .objects
            .iter()
            .zip(scene.transforms(0.0))
            .enumerate()
            .map(|(tag, (object, transform))| Instance::new(&blases[object.mesh_index], transform, tag as u32))
            .collect();
        let tlas = TopLevelStructure::build(&device, &commands, &instances)?;
        let bounds = tlas.bounds();
        log::info!("Scene bounds: {:?} .. {:?}", bounds.min, bounds.max);

        let object_descs = scene.object_descs(geometry.objects());
        let object_buffer = GpuBuffer::host_visible(
            &device,
            std::mem::size_of_val(object_descs.as_slice()) as vk::DeviceSize,
            vk::BufferUsageFlags::STORAGE_BUFFER,
        )?;
        object_buffer.write(&object_descs)?;

        log::info!(
            "Creating storage image ({} MB)...",
            (extent.width as u64 * extent.height as u64 * 16) / (1024 * 1024)
        );
        let storage_image = GpuImage::new(
            &device,
            extent,
            STORAGE_FORMAT,
            vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
        )?;
        commands.submit_and_wait(|device, cmd| {
            device.cmd_transition_image(
                cmd,
                storage_image.handle(),
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::GENERAL,
            )
        })?;

        let slot_count = config.frame_slots(swapchain.image_count());
        let uniforms = UniformPublisher::new(&device, slot_count, LIGHT_POSITION)?;

        log::info!("Creating descriptors and ray tracing pipeline...");
        let pipeline = RayTracingPipeline::new(
            &device,
            &config.shader_dir,
            config.max_ray_recursion,
            slot_count as u32,
        )?;
        for slot in 0..slot_count {
            pipeline.bind(
                slot,
                &Bindings {
                    tlas: tlas.handle(),
                    storage_view: storage_image.view(),
                    uniform_buffer: uniforms.buffer(slot),
                    object_buffer: object_buffer.handle(),
                },
            );
        }

        let props = device.rt_properties;
        let layout = SbtLayout::new(
            props.shader_group_handle_size,
            props.shader_group_handle_alignment,
            props.shader_group_base_alignment,
            HIT_GROUPS,
        );
        let handles = pipeline.shader_group_handles(&layout)?;
        let sbt = ShaderBindingTable::new(&device, layout, &handles)?;

        let frames = FramePipeline::new(&device, slot_count, swapchain.image_count(), config.fence_timeout_ns)?;
        let driver = FrameDriver::new(frames, uniforms, tlas, commands);

        let now = Instant::now();
        Ok(Self {
            driver,
            sbt,
            pipeline,
            object_buffer,
            blases,
            geometry,
            storage_image,
            swapchain,
            device,
            scene,
            camera: Camera::new(),
            started: now,
            last_frame: now,
        })
    }

    pub fn handle_input(&mut self, key: KeyCode, state: ElementState) {
        self.camera.handle_key(key, state == ElementState::Pressed);
    }

    /// Wait for the slot, move the scene, refit, trace, present.
    pub fn render(&mut self) -> Result<()> {
        let now = Instant::now();
        let dt = now.duration_since(self.last_frame).as_secs_f32();
        self.last_frame = now;
        let camera = CameraView {
            moved: self.camera.update(dt),
            position: self.camera.position,
            basis: self.camera.basis(),
        };

        let time = now.duration_since(self.started).as_secs_f32();
        let transforms = self.scene.transforms(time);
        let (pipeline, sbt, storage_image) = (&self.pipeline, &self.sbt, &self.storage_image);
        self.driver.draw(&mut self.swapchain, &transforms, &camera, |slot| {
            pipeline.dispatch(slot, *sbt.regions(), storage_image.extent(), storage_image.handle())
        })?;
        Ok(())
    }

    pub fn frame_number(&self) -> u64 {
        self.driver.frames().frame_number()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!(
            "Shutting down after {} frames ({} refits, {} BLAS, {} bytes of geometry)",
            self.driver.frames().frame_number(),
            self.driver.tlas().refit_count(),
            self.blases.len(),
            self.geometry.vertex_buffer().size() + self.geometry.index_buffer().size()
        );
        if let Err(err) = self.device.wait_idle() {
            log::error!("Device did not go idle before teardown: {}", err);
        }
    }
}
