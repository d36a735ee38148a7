//! Device memory binding and the owning buffer/image handles built on it.

use crate::device::RenderDevice;
use crate::error::{RenderError, Result};
use ash::vk;
use std::sync::Arc;

/// Something that needs backing memory before use.
#[derive(Clone, Copy, Debug)]
pub enum Bindable {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

/// First memory type allowed by `type_bits` whose flags contain `required`.
///
/// No best-fit search: a host-visible request may land on a type that is
/// also device-local if that type comes first.
pub fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32> {
    (0..properties.memory_type_count)
        .find(|&i| {
            (type_bits & (1 << i)) != 0
                && properties.memory_types[i as usize].property_flags.contains(required)
        })
        .ok_or(RenderError::NoSuitableMemoryType { type_bits, required })
}

/// Allocates memory for `object` and binds it before returning.
///
/// On failure nothing allocated here survives; the object itself still
/// belongs to the caller.
pub fn allocate_and_bind<D: RenderDevice>(
    device: &D,
    object: Bindable,
    required: vk::MemoryPropertyFlags,
    device_address: bool,
) -> Result<vk::DeviceMemory> {
    let requirements = match object {
        Bindable::Buffer(buffer) => device.buffer_memory_requirements(buffer),
        Bindable::Image(image) => device.image_memory_requirements(image),
    };
    let type_index = find_memory_type(device.memory_properties(), requirements.memory_type_bits, required)?;

    log::debug!(
        "Allocating {} bytes (alignment: {}, type: {}, props: {:?})",
        requirements.size,
        requirements.alignment,
        type_index,
        required
    );

    let memory = device
        .allocate_memory(requirements.size, type_index, device_address)
        .inspect_err(|_| {
            log::error!(
                "Failed to allocate {} MB of GPU memory (props: {:?})",
                requirements.size / (1024 * 1024),
                required
            )
        })?;

    let bound = match object {
        Bindable::Buffer(buffer) => device.bind_buffer_memory(buffer, memory),
        Bindable::Image(image) => device.bind_image_memory(image, memory),
    };
    if let Err(err) = bound {
        device.free_memory(memory);
        return Err(err);
    }

    Ok(memory)
}

/// A buffer and its memory, released together.
pub struct GpuBuffer<D: RenderDevice> {
    device: Arc<D>,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    address: vk::DeviceAddress,
}

impl<D: RenderDevice> GpuBuffer<D> {
    pub fn new(
        device: &Arc<D>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        required: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let buffer = device.create_buffer(size, usage)?;
        let wants_address = usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS);

        let memory = match allocate_and_bind(device.as_ref(), Bindable::Buffer(buffer), required, wants_address) {
            Ok(memory) => memory,
            Err(err) => {
                device.destroy_buffer(buffer);
                return Err(err);
            }
        };

        let address = if wants_address {
            device.buffer_device_address(buffer)
        } else {
            0
        };

        Ok(Self {
            device: Arc::clone(device),
            buffer,
            memory,
            size,
            address,
        })
    }

    /// Host-visible, coherent buffer.
    pub fn host_visible(device: &Arc<D>, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Result<Self> {
        Self::new(
            device,
            size,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
    }

    pub fn device_local(device: &Arc<D>, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Result<Self> {
        Self::new(device, size, usage, vk::MemoryPropertyFlags::DEVICE_LOCAL)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Zero unless created with `SHADER_DEVICE_ADDRESS`.
    pub fn address(&self) -> vk::DeviceAddress {
        self.address
    }

    pub fn write<T: bytemuck::Pod>(&self, data: &[T]) -> Result<()> {
        self.write_at(0, bytemuck::cast_slice(data))
    }

    /// Copy `bytes` into the buffer starting at `offset`.
    pub fn write_at(&self, offset: vk::DeviceSize, bytes: &[u8]) -> Result<()> {
        let required = offset + bytes.len() as vk::DeviceSize;
        if required > self.size {
            return Err(RenderError::BufferTooSmall {
                required,
                capacity: self.size,
            });
        }
        self.device.write_memory(self.memory, offset, bytes)
    }
}

impl<D: RenderDevice> Drop for GpuBuffer<D> {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.buffer);
        self.device.free_memory(self.memory);
    }
}

/// A device-local 2D image with one view, released together.
pub struct GpuImage<D: RenderDevice> {
    device: Arc<D>,
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    extent: vk::Extent2D,
}

impl<D: RenderDevice> GpuImage<D> {
    pub fn new(
        device: &Arc<D>,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> Result<Self> {
        let image = device.create_image(extent, format, usage)?;

        let memory = match allocate_and_bind(
            device.as_ref(),
            Bindable::Image(image),
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            false,
        ) {
            Ok(memory) => memory,
            Err(err) => {
                log::error!("Failed to back {}x{} image", extent.width, extent.height);
                device.destroy_image(image, vk::ImageView::null());
                return Err(err);
            }
        };

        let view = match device.create_image_view(image, format) {
            Ok(view) => view,
            Err(err) => {
                device.destroy_image(image, vk::ImageView::null());
                device.free_memory(memory);
                return Err(err);
            }
        };

        Ok(Self {
            device: Arc::clone(device),
            image,
            memory,
            view,
            extent,
        })
    }

    pub fn handle(&self) -> vk::Image {
        self.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl<D: RenderDevice> Drop for GpuImage<D> {
    fn drop(&mut self) {
        self.device.destroy_image(self.image, self.view);
        self.device.free_memory(self.memory);
    }
}
