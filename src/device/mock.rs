//! In-process stand-ins for the GPU and the swapchain, used by unit tests.

use super::{
    BuildRequest, BuildSizes, GeometryInput, MemoryDependency, RenderDevice, Submission, TraceDispatch,
};
use crate::error::{RenderError, Result};
use crate::surface::PresentationSurface;
use ash::vk::{self, Handle};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// A command as the mock saw it being recorded.
#[derive(Clone, Debug)]
pub enum Recorded {
    Build(BuildRequest),
    Barrier(MemoryDependency),
    Transition {
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    },
    TraceRays { extent: vk::Extent2D },
    Blit { source: vk::Image, target: vk::Image },
}

#[derive(Clone, Debug)]
pub struct SubmitRecord {
    pub submission: Submission,
    pub commands: Vec<Recorded>,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    buffers: HashMap<vk::Buffer, vk::DeviceSize>,
    bound: HashMap<vk::Buffer, vk::DeviceMemory>,
    memories: HashMap<vk::DeviceMemory, (u32, Vec<u8>)>,
    images: HashSet<vk::Image>,
    structures: HashMap<vk::AccelerationStructureKHR, vk::DeviceSize>,
    pools: HashSet<vk::CommandPool>,
    commands: HashMap<vk::CommandBuffer, Vec<Recorded>>,
    fences: HashMap<vk::Fence, bool>,
    semaphores: HashSet<vk::Semaphore>,
    pending: VecDeque<vk::Fence>,
    held: HashSet<vk::Fence>,
    size_queries: Vec<(vk::AccelerationStructureTypeKHR, u32)>,
    submissions: Vec<SubmitRecord>,
}

impl State {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

pub struct MockDevice {
    state: Mutex<State>,
    fence_signaled: Condvar,
    manual_fences: bool,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl MockDevice {
    /// Device-local, host-visible + coherent, and a type with all three.
    pub fn new() -> Self {
        Self::with_memory_types(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::DEVICE_LOCAL
                | vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
        ])
    }

    pub fn with_memory_types(types: &[vk::MemoryPropertyFlags]) -> Self {
        let mut memory_properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            memory_heap_count: 1,
            ..Default::default()
        };
        for (slot, flags) in memory_properties.memory_types.iter_mut().zip(types) {
            slot.property_flags = *flags;
            slot.heap_index = 0;
        }
        memory_properties.memory_heaps[0].size = 1 << 30;

        Self {
            state: Mutex::new(State::default()),
            fence_signaled: Condvar::new(),
            manual_fences: false,
            memory_properties,
        }
    }

    /// Submitted fences stay unsignaled until [`MockDevice::complete_next_submission`].
    pub fn with_manual_fences() -> Self {
        Self {
            manual_fences: true,
            ..Self::new()
        }
    }

    /// Like manual mode, but only for `fences`; every other submission
    /// completes as soon as it is queued.
    pub fn hold_fences(&self, fences: impl IntoIterator<Item = vk::Fence>) {
        self.state.lock().held.extend(fences);
    }

    /// Retire the oldest in-flight submission. Returns false if none is pending.
    pub fn complete_next_submission(&self) -> bool {
        let mut state = self.state.lock();
        let Some(fence) = state.pending.pop_front() else {
            return false;
        };
        state.fences.insert(fence, true);
        self.fence_signaled.notify_all();
        true
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_allocations(&self) -> usize {
        self.state.lock().memories.len()
    }

    pub fn live_images(&self) -> usize {
        self.state.lock().images.len()
    }

    pub fn live_structures(&self) -> usize {
        self.state.lock().structures.len()
    }

    pub fn live_sync_objects(&self) -> usize {
        let state = self.state.lock();
        state.fences.len() + state.semaphores.len()
    }

    pub fn structure_size(&self, structure: vk::AccelerationStructureKHR) -> Option<vk::DeviceSize> {
        self.state.lock().structures.get(&structure).copied()
    }

    /// Every `(type, primitive count)` the size query was asked about, in order.
    pub fn size_queries(&self) -> Vec<(vk::AccelerationStructureTypeKHR, u32)> {
        self.state.lock().size_queries.clone()
    }

    pub fn submissions(&self) -> Vec<SubmitRecord> {
        self.state.lock().submissions.clone()
    }

    /// Host-visible bytes currently backing `buffer`.
    pub fn read_buffer(&self, buffer: vk::Buffer) -> Vec<u8> {
        let state = self.state.lock();
        state
            .bound
            .get(&buffer)
            .and_then(|memory| state.memories.get(memory))
            .map(|(_, bytes)| bytes.clone())
            .unwrap_or_default()
    }

    fn record(&self, command_buffer: vk::CommandBuffer, command: Recorded) {
        self.state
            .lock()
            .commands
            .entry(command_buffer)
            .or_default()
            .push(command);
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderDevice for MockDevice {
    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    fn create_buffer(&self, size: vk::DeviceSize, _usage: vk::BufferUsageFlags) -> Result<vk::Buffer> {
        let mut state = self.state.lock();
        let buffer = vk::Buffer::from_raw(state.handle());
        state.buffers.insert(buffer, size);
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        state.buffers.remove(&buffer);
        state.bound.remove(&buffer);
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let size = self.state.lock().buffers.get(&buffer).copied().unwrap_or(0);
        vk::MemoryRequirements {
            size: size.next_multiple_of(256).max(256),
            alignment: 256,
            memory_type_bits: (1 << self.memory_properties.memory_type_count) - 1,
        }
    }

    fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        buffer.as_raw() << 20
    }

    fn create_image(
        &self,
        _extent: vk::Extent2D,
        _format: vk::Format,
        _usage: vk::ImageUsageFlags,
    ) -> Result<vk::Image> {
        let mut state = self.state.lock();
        let image = vk::Image::from_raw(state.handle());
        state.images.insert(image);
        Ok(image)
    }

    fn create_image_view(&self, _image: vk::Image, _format: vk::Format) -> Result<vk::ImageView> {
        let mut state = self.state.lock();
        Ok(vk::ImageView::from_raw(state.handle()))
    }

    fn destroy_image(&self, image: vk::Image, _view: vk::ImageView) {
        self.state.lock().images.remove(&image);
    }

    fn image_memory_requirements(&self, _image: vk::Image) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size: 4096,
            alignment: 256,
            memory_type_bits: (1 << self.memory_properties.memory_type_count) - 1,
        }
    }

    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
        _device_address: bool,
    ) -> Result<vk::DeviceMemory> {
        let mut state = self.state.lock();
        let memory = vk::DeviceMemory::from_raw(state.handle());
        state
            .memories
            .insert(memory, (memory_type_index, vec![0; size as usize]));
        Ok(memory)
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        self.state.lock().memories.remove(&memory);
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> Result<()> {
        self.state.lock().bound.insert(buffer, memory);
        Ok(())
    }

    fn bind_image_memory(&self, _image: vk::Image, _memory: vk::DeviceMemory) -> Result<()> {
        Ok(())
    }

    fn write_memory(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let map_failed = || RenderError::from_vk("vkMapMemory", vk::Result::ERROR_MEMORY_MAP_FAILED);
        let (type_index, contents) = state.memories.get_mut(&memory).ok_or_else(map_failed)?;
        let flags = self.memory_properties.memory_types[*type_index as usize].property_flags;
        if !flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(map_failed());
        }
        let start = offset as usize;
        let end = start + bytes.len();
        if end > contents.len() {
            return Err(map_failed());
        }
        contents[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn acceleration_structure_build_sizes(
        &self,
        input: &GeometryInput,
        _flags: vk::BuildAccelerationStructureFlagsKHR,
    ) -> BuildSizes {
        let count = input.primitive_count() as u64;
        self.state
            .lock()
            .size_queries
            .push((input.ty(), input.primitive_count()));
        BuildSizes {
            storage: 256 + 128 * count,
            build_scratch: 512 + 64 * count,
            update_scratch: 128 + 32 * count,
        }
    }

    fn create_acceleration_structure(
        &self,
        _ty: vk::AccelerationStructureTypeKHR,
        _buffer: vk::Buffer,
        size: vk::DeviceSize,
    ) -> Result<vk::AccelerationStructureKHR> {
        let mut state = self.state.lock();
        let structure = vk::AccelerationStructureKHR::from_raw(state.handle());
        state.structures.insert(structure, size);
        Ok(structure)
    }

    fn destroy_acceleration_structure(&self, structure: vk::AccelerationStructureKHR) {
        self.state.lock().structures.remove(&structure);
    }

    fn acceleration_structure_address(&self, structure: vk::AccelerationStructureKHR) -> vk::DeviceAddress {
        0xA5_0000_0000 | (structure.as_raw() << 12)
    }

    fn create_command_pool(&self) -> Result<vk::CommandPool> {
        let mut state = self.state.lock();
        let pool = vk::CommandPool::from_raw(state.handle());
        state.pools.insert(pool);
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.state.lock().pools.remove(&pool);
    }

    fn allocate_command_buffers(&self, _pool: vk::CommandPool, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        Ok((0..count)
            .map(|_| vk::CommandBuffer::from_raw(state.handle()))
            .collect())
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        self.state.lock().commands.remove(&command_buffer);
        Ok(())
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        self.state.lock().commands.insert(command_buffer, Vec::new());
        Ok(())
    }

    fn end_command_buffer(&self, _command_buffer: vk::CommandBuffer) -> Result<()> {
        Ok(())
    }

    fn cmd_build_acceleration_structure(&self, command_buffer: vk::CommandBuffer, request: &BuildRequest) {
        self.record(command_buffer, Recorded::Build(*request));
    }

    fn cmd_memory_barrier(&self, command_buffer: vk::CommandBuffer, dependency: MemoryDependency) {
        self.record(command_buffer, Recorded::Barrier(dependency));
    }

    fn cmd_transition_image(
        &self,
        command_buffer: vk::CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        self.record(
            command_buffer,
            Recorded::Transition {
                image,
                old_layout,
                new_layout,
            },
        );
    }

    fn cmd_trace_rays(&self, command_buffer: vk::CommandBuffer, dispatch: &TraceDispatch) {
        self.record(
            command_buffer,
            Recorded::TraceRays {
                extent: dispatch.extent,
            },
        );
    }

    fn cmd_blit_to_present(
        &self,
        command_buffer: vk::CommandBuffer,
        source: vk::Image,
        target: vk::Image,
        _extent: vk::Extent2D,
    ) {
        self.record(command_buffer, Recorded::Blit { source, target });
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let mut state = self.state.lock();
        let fence = vk::Fence::from_raw(state.handle());
        state.fences.insert(fence, signaled);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.state.lock().fences.remove(&fence);
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let mut state = self.state.lock();
        let semaphore = vk::Semaphore::from_raw(state.handle());
        state.semaphores.insert(semaphore);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.lock().semaphores.remove(&semaphore);
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
        let deadline = Instant::now().checked_add(Duration::from_nanos(timeout_ns));
        let mut state = self.state.lock();
        while !state.fences.get(&fence).copied().unwrap_or(false) {
            match deadline {
                Some(deadline) => {
                    if self.fence_signaled.wait_until(&mut state, deadline).timed_out()
                        && !state.fences.get(&fence).copied().unwrap_or(false)
                    {
                        return Err(RenderError::from_vk("vkWaitForFences", vk::Result::TIMEOUT));
                    }
                }
                None => self.fence_signaled.wait(&mut state),
            }
        }
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        self.state.lock().fences.insert(fence, false);
        Ok(())
    }

    fn queue_submit(&self, submission: &Submission) -> Result<()> {
        let mut state = self.state.lock();
        let commands = state
            .commands
            .get(&submission.command_buffer)
            .cloned()
            .unwrap_or_default();
        state.submissions.push(SubmitRecord {
            submission: *submission,
            commands,
        });
        if submission.fence != vk::Fence::null() {
            if self.manual_fences || state.held.contains(&submission.fence) {
                state.pending.push_back(submission.fence);
            } else {
                state.fences.insert(submission.fence, true);
                self.fence_signaled.notify_all();
            }
        }
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        let mut state = self.state.lock();
        while let Some(fence) = state.pending.pop_front() {
            state.fences.insert(fence, true);
        }
        self.fence_signaled.notify_all();
        Ok(())
    }
}

/// Round-robin presentable images.
pub struct MockSurface {
    images: Vec<vk::Image>,
    extent: vk::Extent2D,
    next: u32,
    pub acquired: Vec<(u32, vk::Semaphore)>,
    pub presented: Vec<(u32, vk::Semaphore)>,
}

impl MockSurface {
    pub fn new(image_count: u32) -> Self {
        Self {
            images: (0..image_count)
                .map(|i| vk::Image::from_raw(0xF000 + i as u64))
                .collect(),
            extent: vk::Extent2D {
                width: 64,
                height: 32,
            },
            next: 0,
            acquired: Vec::new(),
            presented: Vec::new(),
        }
    }
}

impl PresentationSurface for MockSurface {
    fn image_count(&self) -> usize {
        self.images.len()
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn image(&self, index: u32) -> vk::Image {
        self.images[index as usize]
    }

    fn acquire_next(&mut self, signal: vk::Semaphore, _timeout_ns: u64) -> Result<u32> {
        let index = self.next;
        self.next = (self.next + 1) % self.images.len() as u32;
        self.acquired.push((index, signal));
        Ok(index)
    }

    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> Result<()> {
        self.presented.push((image_index, wait));
        Ok(())
    }
}
