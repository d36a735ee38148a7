//! Shader binding table: one host-visible buffer holding a group handle per
//! ray role, laid out in raygen / miss / hit regions.
//!
//! Group order in the pipeline is fixed: raygen, miss, shadow miss, then the
//! hit groups. Shadow rays pick the second miss record via `missIndex = 1`.

use crate::device::{RenderDevice, SbtRegions};
use crate::error::{RenderError, Result};
use crate::memory::GpuBuffer;
use ash::vk;
use std::sync::Arc;

/// What a table record is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RayRole {
    Generation,
    Miss,
    ShadowMiss,
    /// Hit group by index, selected through the instance's record offset.
    ClosestHit(u32),
}

const MISS_RECORDS: u64 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SbtLayout {
    handle_size: u32,
    stride: vk::DeviceSize,
    hit_groups: u32,
    raygen: Region,
    miss: Region,
    hit: Region,
}

/// Round `value` up to a power-of-two `alignment`. Zero alignment is treated as one.
pub fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    let alignment = alignment.max(1);
    (value + alignment - 1) & !(alignment - 1)
}

impl SbtLayout {
    pub fn new(handle_size: u32, handle_alignment: u32, base_alignment: u32, hit_groups: u32) -> Self {
        let base = base_alignment as vk::DeviceSize;
        let stride = align_up(handle_size as vk::DeviceSize, handle_alignment as vk::DeviceSize);

        let raygen = Region {
            offset: 0,
            size: align_up(stride, base),
        };
        let miss = Region {
            offset: raygen.size,
            size: align_up(stride * MISS_RECORDS, base),
        };
        let hit = Region {
            offset: miss.offset + miss.size,
            size: align_up(stride * hit_groups as vk::DeviceSize, base),
        };

        Self {
            handle_size,
            stride,
            hit_groups,
            raygen,
            miss,
            hit,
        }
    }

    pub fn stride(&self) -> vk::DeviceSize {
        self.stride
    }

    pub fn total_size(&self) -> vk::DeviceSize {
        self.hit.offset + self.hit.size
    }

    pub fn group_count(&self) -> u32 {
        1 + MISS_RECORDS as u32 + self.hit_groups
    }

    /// Every role with a record, in pipeline group order.
    pub fn roles(&self) -> impl Iterator<Item = RayRole> {
        [RayRole::Generation, RayRole::Miss, RayRole::ShadowMiss]
            .into_iter()
            .chain((0..self.hit_groups).map(RayRole::ClosestHit))
    }

    /// Index of the pipeline shader group serving `role`.
    pub fn group_index(&self, role: RayRole) -> Option<u32> {
        match role {
            RayRole::Generation => Some(0),
            RayRole::Miss => Some(1),
            RayRole::ShadowMiss => Some(2),
            RayRole::ClosestHit(group) if group < self.hit_groups => Some(3 + group),
            RayRole::ClosestHit(_) => None,
        }
    }

    /// Byte offset of `role`'s record within the table.
    pub fn slot_offset(&self, role: RayRole) -> Option<vk::DeviceSize> {
        match role {
            RayRole::Generation => Some(self.raygen.offset),
            RayRole::Miss => Some(self.miss.offset),
            RayRole::ShadowMiss => Some(self.miss.offset + self.stride),
            RayRole::ClosestHit(group) if group < self.hit_groups => {
                Some(self.hit.offset + group as vk::DeviceSize * self.stride)
            }
            RayRole::ClosestHit(_) => None,
        }
    }

    /// Raygen, miss, hit and (empty) callable regions for a table at `base_address`.
    pub fn regions(&self, base_address: vk::DeviceAddress) -> SbtRegions {
        let region = |r: Region| vk::StridedDeviceAddressRegionKHR {
            device_address: base_address + r.offset,
            stride: self.stride,
            size: r.size,
        };
        [
            // Raygen size must equal its stride
            vk::StridedDeviceAddressRegionKHR {
                device_address: base_address + self.raygen.offset,
                stride: self.stride,
                size: self.stride,
            },
            region(self.miss),
            region(self.hit),
            vk::StridedDeviceAddressRegionKHR::default(),
        ]
    }
}

pub struct ShaderBindingTable<D: RenderDevice> {
    buffer: GpuBuffer<D>,
    regions: SbtRegions,
}

impl<D: RenderDevice> ShaderBindingTable<D> {
    /// Write each group handle from `handles` (tightly packed, in group
    /// order, as returned by the pipeline) into its aligned record.
    pub fn new(device: &Arc<D>, layout: SbtLayout, handles: &[u8]) -> Result<Self> {
        let handle_size = layout.handle_size as usize;
        let required = handle_size * layout.group_count() as usize;
        if handles.len() < required {
            return Err(RenderError::BufferTooSmall {
                required: required as vk::DeviceSize,
                capacity: handles.len() as vk::DeviceSize,
            });
        }

        let mut table = vec![0u8; layout.total_size() as usize];
        for role in layout.roles() {
            let (Some(group), Some(offset)) = (layout.group_index(role), layout.slot_offset(role)) else {
                continue;
            };
            let src = group as usize * handle_size;
            let dst = offset as usize;
            table[dst..dst + handle_size].copy_from_slice(&handles[src..src + handle_size]);
        }

        let buffer = GpuBuffer::host_visible(
            device,
            layout.total_size(),
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        )?;
        buffer.write(&table)?;
        let regions = layout.regions(buffer.address());

        log::info!(
            "Shader binding table: {} groups, stride {}, {} bytes",
            layout.group_count(),
            layout.stride(),
            layout.total_size()
        );

        Ok(Self {
            buffer,
            regions,
        })
    }

    pub fn regions(&self) -> &SbtRegions {
        &self.regions
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer.handle()
    }
}
