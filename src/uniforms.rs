use crate::device::RenderDevice;
use crate::error::Result;
use crate::memory::GpuBuffer;
use ash::vk;
use glam::{Vec3, Vec4};
use std::sync::Arc;

/// Per-frame values read by the ray generation and closest-hit stages.
/// Matches the std140 `Uniforms` block in `shaders/`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct UniformState {
    pub camera_position: Vec4,
    pub camera_right: Vec4,
    pub camera_up: Vec4,
    pub camera_forward: Vec4,
    pub light_position: Vec4,
    /// Frames accumulated since the view last changed.
    pub frame_count: u32,
    _pad: [u32; 3],
}

/// Orthonormal camera frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraBasis {
    pub right: Vec3,
    pub up: Vec3,
    pub forward: Vec3,
}

/// Overwrites a host-visible uniform buffer every frame, one buffer per
/// frame slot.
///
/// A slot's buffer is rewritten only after that slot's fence wait, so the GPU
/// has finished reading what the slot published last time around.
pub struct UniformPublisher<D: RenderDevice> {
    buffers: Vec<GpuBuffer<D>>,
    state: UniformState,
}

impl<D: RenderDevice> UniformPublisher<D> {
    pub fn new(device: &Arc<D>, slot_count: usize, light_position: Vec3) -> Result<Self> {
        let buffers = (0..slot_count)
            .map(|_| {
                GpuBuffer::host_visible(
                    device,
                    std::mem::size_of::<UniformState>() as vk::DeviceSize,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let state = UniformState {
            light_position: light_position.extend(1.0),
            ..bytemuck::Zeroable::zeroed()
        };
        Ok(Self { buffers, state })
    }

    /// Write this frame's camera into `slot`'s buffer. `view_changed`
    /// restarts accumulation; otherwise the frame counter advances.
    pub fn publish(&mut self, slot: usize, position: Vec3, basis: CameraBasis, view_changed: bool) -> Result<()> {
        let state = &mut self.state;
        state.camera_position = position.extend(1.0);
        state.camera_right = basis.right.extend(0.0);
        state.camera_up = basis.up.extend(0.0);
        state.camera_forward = basis.forward.extend(0.0);
        state.frame_count = if view_changed {
            0
        } else {
            state.frame_count.wrapping_add(1)
        };

        self.buffers[slot].write(std::slice::from_ref(&self.state))
    }

    pub fn state(&self) -> &UniformState {
        &self.state
    }

    pub fn buffer(&self, slot: usize) -> vk::Buffer {
        self.buffers[slot].handle()
    }

    pub fn slot_count(&self) -> usize {
        self.buffers.len()
    }
}
