use crate::device::VulkanDevice;
use crate::error::{RenderError, Result, VkResultExt};
use ash::vk;
use std::sync::Arc;

/// Where finished frames go.
pub trait PresentationSurface {
    fn image_count(&self) -> usize;
    fn extent(&self) -> vk::Extent2D;
    fn image(&self, index: u32) -> vk::Image;
    /// Index of the next presentable image. `signal` fires on the GPU once
    /// the image is actually free; the CPU never waits on it.
    fn acquire_next(&mut self, signal: vk::Semaphore, timeout_ns: u64) -> Result<u32>;
    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> Result<()>;
}

/// Fixed-size FIFO swapchain. Anything other than success from acquire or
/// present is fatal, including out-of-date.
pub struct Swapchain {
    device: Arc<VulkanDevice>,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    extent: vk::Extent2D,
}

impl Swapchain {
    pub fn new(device: &Arc<VulkanDevice>, window_width: u32, window_height: u32) -> Result<Self> {
        let capabilities = unsafe {
            device
                .surface_loader
                .get_physical_device_surface_capabilities(device.physical_device, device.surface)
                .op("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?
        };
        let formats = unsafe {
            device
                .surface_loader
                .get_physical_device_surface_formats(device.physical_device, device.surface)
                .op("vkGetPhysicalDeviceSurfaceFormatsKHR")?
        };
        let surface_format = formats
            .iter()
            .copied()
            .find(|f| f.format == vk::Format::B8G8R8A8_UNORM)
            .or_else(|| formats.first().copied())
            .unwrap_or(vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            });

        // Special case: u32::MAX means the window decides
        let extent = if capabilities.current_extent.width == u32::MAX {
            log::info!(
                "Surface extent is undefined, using window size: {}x{}",
                window_width,
                window_height
            );
            vk::Extent2D {
                width: window_width.clamp(
                    capabilities.min_image_extent.width,
                    capabilities.max_image_extent.width,
                ),
                height: window_height.clamp(
                    capabilities.min_image_extent.height,
                    capabilities.max_image_extent.height,
                ),
            }
        } else {
            log::info!(
                "Surface extent: {}x{}",
                capabilities.current_extent.width,
                capabilities.current_extent.height
            );
            capabilities.current_extent
        };

        let mut min_image_count = std::cmp::max(3, capabilities.min_image_count);
        if capabilities.max_image_count > 0 {
            min_image_count = min_image_count.min(capabilities.max_image_count);
        }

        let create_info = vk::SwapchainCreateInfoKHR {
            surface: device.surface,
            min_image_count,
            image_format: surface_format.format,
            image_color_space: surface_format.color_space,
            image_extent: extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            image_sharing_mode: vk::SharingMode::EXCLUSIVE,
            pre_transform: capabilities.current_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode: vk::PresentModeKHR::FIFO,
            clipped: vk::TRUE,
            ..Default::default()
        };
        let swapchain = unsafe {
            device
                .swapchain_loader
                .create_swapchain(&create_info, None)
                .op("vkCreateSwapchainKHR")?
        };
        let images = match unsafe { device.swapchain_loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(result) => {
                unsafe { device.swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(RenderError::from_vk("vkGetSwapchainImagesKHR", result));
            }
        };

        log::info!(
            "Swapchain: {} images, {:?}, {}x{}",
            images.len(),
            surface_format.format,
            extent.width,
            extent.height
        );

        Ok(Self {
            device: Arc::clone(device),
            swapchain,
            images,
            extent,
        })
    }
}

impl PresentationSurface for Swapchain {
    fn image_count(&self) -> usize {
        self.images.len()
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn image(&self, index: u32) -> vk::Image {
        self.images[index as usize]
    }

    fn acquire_next(&mut self, signal: vk::Semaphore, timeout_ns: u64) -> Result<u32> {
        let (index, suboptimal) = unsafe {
            self.device
                .swapchain_loader
                .acquire_next_image(self.swapchain, timeout_ns, signal, vk::Fence::null())
                .op("vkAcquireNextImageKHR")?
        };
        if suboptimal {
            log::debug!("Swapchain image {} is suboptimal", index);
        }
        Ok(index)
    }

    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> Result<()> {
        let wait_semaphores = [wait];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe {
            self.device
                .swapchain_loader
                .queue_present(self.device.queue, &present_info)
                .op("vkQueuePresentKHR")?
        };
        Ok(())
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe { self.device.swapchain_loader.destroy_swapchain(self.swapchain, None) };
    }
}
