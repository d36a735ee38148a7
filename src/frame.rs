//! Per-frame synchronization: a ring of frame slots, each with its own fence,
//! acquire semaphore and command buffer.
//!
//! A frame goes `begin_frame` (wait fence, reset, acquire, start recording),
//! then whatever the caller does against the acquired image, then
//! `end_frame` (submit, present, advance). The fence wait in `begin_frame` is
//! the only backpressure: at most `slot_count` frames are ever in flight, and
//! host-visible data read by the GPU may be rewritten once it returns.

use crate::device::{MemoryDependency, RenderDevice, Submission, TraceDispatch};
use crate::error::Result;
use crate::surface::PresentationSurface;
use ash::vk;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    WaitFence,
    Acquire,
    Record,
    Submitted,
    Presented,
}

pub struct FrameSlot {
    pub fence: vk::Fence,
    pub image_acquired: vk::Semaphore,
    pub command_buffer: vk::CommandBuffer,
    state: SlotState,
}

impl FrameSlot {
    pub fn state(&self) -> SlotState {
        self.state
    }
}

/// A frame between `begin_frame` and `end_frame`.
#[must_use = "a begun frame must be passed to end_frame"]
#[derive(Debug)]
pub struct Frame {
    pub slot: usize,
    pub image_index: u32,
    pub command_buffer: vk::CommandBuffer,
    /// The presentable image acquired for this frame.
    pub target: vk::Image,
}

pub struct FramePipeline<D: RenderDevice> {
    device: Arc<D>,
    pool: vk::CommandPool,
    slots: Vec<FrameSlot>,
    // One per presentable image: a present may still be reading it when the
    // same slot comes around again with a different image.
    render_complete: Vec<vk::Semaphore>,
    current: usize,
    timeout_ns: u64,
    frames: u64,
}

impl<D: RenderDevice> FramePipeline<D> {
    pub fn new(device: &Arc<D>, slot_count: usize, image_count: usize, timeout_ns: u64) -> Result<Self> {
        let pool = device.create_command_pool()?;
        // From here on Drop cleans up whatever was created
        let mut pipeline = Self {
            device: Arc::clone(device),
            pool,
            slots: Vec::with_capacity(slot_count),
            render_complete: Vec::with_capacity(image_count),
            current: 0,
            timeout_ns,
            frames: 0,
        };

        let command_buffers = device.allocate_command_buffers(pool, slot_count as u32)?;
        for command_buffer in command_buffers {
            // Signaled so the first use of each slot does not block
            let fence = device.create_fence(true)?;
            let image_acquired = match device.create_semaphore() {
                Ok(semaphore) => semaphore,
                Err(err) => {
                    device.destroy_fence(fence);
                    return Err(err);
                }
            };
            pipeline.slots.push(FrameSlot {
                fence,
                image_acquired,
                command_buffer,
                state: SlotState::Idle,
            });
        }
        for _ in 0..image_count {
            pipeline.render_complete.push(device.create_semaphore()?);
        }

        log::info!(
            "Frame pipeline: {} slots for {} presentable images",
            slot_count,
            image_count
        );
        Ok(pipeline)
    }

    /// Wait for the current slot's previous submission, then acquire an image
    /// and open the slot's command buffer.
    pub fn begin_frame<S: PresentationSurface>(&mut self, surface: &mut S) -> Result<Frame> {
        let index = self.current;

        self.set_state(index, SlotState::WaitFence);
        let slot = &self.slots[index];
        self.device.wait_for_fence(slot.fence, self.timeout_ns)?;
        self.device.reset_fence(slot.fence)?;

        self.set_state(index, SlotState::Acquire);
        let slot = &self.slots[index];
        let image_index = surface.acquire_next(slot.image_acquired, self.timeout_ns)?;
        let command_buffer = slot.command_buffer;

        self.set_state(index, SlotState::Record);
        self.device.reset_command_buffer(command_buffer)?;
        self.device.begin_command_buffer(command_buffer)?;

        Ok(Frame {
            slot: index,
            image_index,
            command_buffer,
            target: surface.image(image_index),
        })
    }

    /// Record the trace dispatch and the copy into the acquired image.
    ///
    /// Starts with a build-to-trace dependency so the dispatch reads whatever
    /// the most recent structure update wrote.
    pub fn record_trace(&self, frame: &Frame, dispatch: &TraceDispatch) {
        let cmd = frame.command_buffer;
        self.device.cmd_memory_barrier(cmd, MemoryDependency::BUILD_TO_TRACE);
        self.device.cmd_trace_rays(cmd, dispatch);
        self.device
            .cmd_blit_to_present(cmd, dispatch.storage_image, frame.target, dispatch.extent);
    }

    /// Submit the frame, present it, and move to the next slot.
    pub fn end_frame<S: PresentationSurface>(&mut self, surface: &mut S, frame: Frame) -> Result<()> {
        let slot = &self.slots[frame.slot];
        let render_complete = self.render_complete[frame.image_index as usize];

        self.device.end_command_buffer(frame.command_buffer)?;
        self.device.queue_submit(&Submission {
            command_buffer: frame.command_buffer,
            wait: Some((slot.image_acquired, vk::PipelineStageFlags::TRANSFER)),
            signal: Some(render_complete),
            fence: slot.fence,
        })?;
        self.set_state(frame.slot, SlotState::Submitted);

        surface.present(frame.image_index, render_complete)?;
        self.set_state(frame.slot, SlotState::Presented);

        self.set_state(frame.slot, SlotState::Idle);
        self.current = (self.current + 1) % self.slots.len();
        self.frames += 1;
        Ok(())
    }

    fn set_state(&mut self, index: usize, state: SlotState) {
        log::trace!("Frame {} slot {}: {:?}", self.frames, index, state);
        self.slots[index].state = state;
    }

    pub fn current_slot(&self) -> usize {
        self.current
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> &FrameSlot {
        &self.slots[index]
    }

    /// Frames submitted and presented so far.
    pub fn frame_number(&self) -> u64 {
        self.frames
    }
}

impl<D: RenderDevice> Drop for FramePipeline<D> {
    fn drop(&mut self) {
        for slot in &self.slots {
            self.device.destroy_semaphore(slot.image_acquired);
            self.device.destroy_fence(slot.fence);
        }
        for semaphore in &self.render_complete {
            self.device.destroy_semaphore(*semaphore);
        }
        self.device.destroy_command_pool(self.pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{MockDevice, MockSurface, Recorded};
    use crate::error::RenderError;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn dispatch(surface: &MockSurface) -> TraceDispatch {
        TraceDispatch {
            pipeline: vk::Pipeline::null(),
            layout: vk::PipelineLayout::null(),
            descriptor_set: vk::DescriptorSet::null(),
            regions: Default::default(),
            extent: surface.extent(),
            storage_image: vk::Image::null(),
        }
    }

    /// Runs one full frame, returning the slot used and the target image.
    fn run_frame(
        pipeline: &mut FramePipeline<MockDevice>,
        surface: &mut MockSurface,
    ) -> Result<(usize, vk::Image)> {
        let frame = pipeline.begin_frame(surface)?;
        pipeline.record_trace(&frame, &dispatch(surface));
        let seen = (frame.slot, frame.target);
        pipeline.end_frame(surface, frame)?;
        Ok(seen)
    }

    #[test]
    fn frame_index_wraps_over_slots() {
        let device = Arc::new(MockDevice::new());
        let mut surface = MockSurface::new(3);
        let mut pipeline = FramePipeline::new(&device, 3, 3, u64::MAX).unwrap();

        let slots: Vec<usize> = (0..7)
            .map(|_| run_frame(&mut pipeline, &mut surface).unwrap().0)
            .collect();

        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(pipeline.current_slot(), 1);
        assert_eq!(pipeline.frame_number(), 7);
        assert!((0..3).all(|i| pipeline.slot(i).state() == SlotState::Idle));
    }

    #[test]
    fn submit_waits_on_acquire_and_signals_present() {
        let device = Arc::new(MockDevice::new());
        let mut surface = MockSurface::new(2);
        let mut pipeline = FramePipeline::new(&device, 2, 2, u64::MAX).unwrap();

        for _ in 0..2 {
            run_frame(&mut pipeline, &mut surface).unwrap();
        }

        let submissions = device.submissions();
        for (i, record) in submissions.iter().enumerate() {
            let slot = pipeline.slot(i);
            let (acquired_index, acquired_signal) = surface.acquired[i];
            let (presented_index, present_wait) = surface.presented[i];

            assert_eq!(record.submission.fence, slot.fence);
            assert_eq!(record.submission.wait.map(|w| w.0), Some(slot.image_acquired));
            assert_eq!(acquired_signal, slot.image_acquired);
            assert_eq!(presented_index, acquired_index);
            assert_eq!(record.submission.signal, Some(present_wait));
        }
    }

    #[test]
    fn trace_follows_build_barrier_and_precedes_blit() {
        let device = Arc::new(MockDevice::new());
        let mut surface = MockSurface::new(2);
        let mut pipeline = FramePipeline::new(&device, 2, 2, u64::MAX).unwrap();

        let (_, frame_target) = run_frame(&mut pipeline, &mut surface).unwrap();

        let commands = device.submissions()[0].commands.clone();
        assert!(matches!(
            commands.as_slice(),
            [
                Recorded::Barrier(dep),
                Recorded::TraceRays { .. },
                Recorded::Blit { target, .. },
            ] if *dep == MemoryDependency::BUILD_TO_TRACE && *target == frame_target
        ));
    }

    #[test]
    fn third_frame_stalls_until_first_fence_signals() {
        let device = Arc::new(MockDevice::with_manual_fences());
        let mut surface = MockSurface::new(2);
        let mut pipeline = FramePipeline::new(&device, 2, 2, u64::MAX).unwrap();

        let (tx, rx) = mpsc::channel();
        let worker = thread::spawn(move || -> Result<()> {
            for _ in 0..3 {
                let frame = pipeline.begin_frame(&mut surface)?;
                pipeline.end_frame(&mut surface, frame)?;
                tx.send(pipeline.frame_number()).ok();
            }
            Ok(())
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);

        // Slot 0 comes around again, but its first submission is still in flight
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(device.submissions().len(), 2);

        assert!(device.complete_next_submission());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 3);
        worker.join().unwrap().unwrap();
        assert_eq!(device.submissions().len(), 3);
    }

    #[test]
    fn fence_timeout_is_fatal() {
        let device = Arc::new(MockDevice::with_manual_fences());
        let mut surface = MockSurface::new(2);
        let mut pipeline = FramePipeline::new(&device, 2, 2, 1_000_000).unwrap();

        for _ in 0..2 {
            let frame = pipeline.begin_frame(&mut surface).unwrap();
            pipeline.end_frame(&mut surface, frame).unwrap();
        }

        let err = pipeline.begin_frame(&mut surface).unwrap_err();
        assert!(matches!(err, RenderError::SynchronizationTimeout { .. }));
        assert!(err.is_fatal_device_state());
    }

    #[test]
    fn drop_releases_sync_objects() {
        let device = Arc::new(MockDevice::new());
        let pipeline = FramePipeline::new(&device, 3, 3, u64::MAX).unwrap();
        // Fence + acquire per slot, render-complete per image
        assert_eq!(device.live_sync_objects(), 9);

        drop(pipeline);
        assert_eq!(device.live_sync_objects(), 0);
    }
}
