//! One frame end to end: slot wait, scene update, trace, present.

use crate::accel::{Instance, TopLevelStructure};
use crate::commands::OneTimeCommands;
use crate::device::{RenderDevice, TraceDispatch};
use crate::error::{RenderError, Result};
use crate::frame::FramePipeline;
use crate::surface::PresentationSurface;
use crate::uniforms::{CameraBasis, UniformPublisher};
use glam::{Affine3A, Vec3};

/// The camera as of this frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraView {
    pub position: Vec3,
    pub basis: CameraBasis,
    /// Moved or turned since the previous frame.
    pub moved: bool,
}

/// Owns the state that changes every frame and the order it changes in.
///
/// Uniforms are written only after the slot's fence wait, and the TLAS refit
/// has finished on the queue before the frame that traces it is submitted.
pub struct FrameDriver<D: RenderDevice> {
    frames: FramePipeline<D>,
    uniforms: UniformPublisher<D>,
    tlas: TopLevelStructure<D>,
    commands: OneTimeCommands<D>,
    instances: Vec<Instance>,
}

impl<D: RenderDevice> FrameDriver<D> {
    pub fn new(
        frames: FramePipeline<D>,
        uniforms: UniformPublisher<D>,
        tlas: TopLevelStructure<D>,
        commands: OneTimeCommands<D>,
    ) -> Self {
        debug_assert_eq!(uniforms.slot_count(), frames.slot_count());
        let instances = tlas.instances().to_vec();
        Self {
            frames,
            uniforms,
            tlas,
            commands,
            instances,
        }
    }

    /// Render one frame with the instances placed at `transforms`.
    ///
    /// `dispatch` maps the frame slot to the trace to record. Returns whether
    /// any instance moved, i.e. whether the TLAS was refit.
    pub fn draw<S: PresentationSurface>(
        &mut self,
        surface: &mut S,
        transforms: &[Affine3A],
        camera: &CameraView,
        dispatch: impl FnOnce(usize) -> TraceDispatch,
    ) -> Result<bool> {
        if transforms.len() != self.instances.len() {
            return Err(RenderError::TopologyChanged {
                built: self.instances.len() as u32,
                requested: transforms.len() as u32,
            });
        }

        let frame = self.frames.begin_frame(surface)?;

        // This slot's previous frame is done with its uniforms. The refit
        // orders itself after any trace still on the queue.
        for (instance, transform) in self.instances.iter_mut().zip(transforms) {
            instance.transform = *transform;
        }
        let scene_moved = self.tlas.refit_if_changed(&self.commands, &self.instances)?;
        self.uniforms.publish(
            frame.slot,
            camera.position,
            camera.basis,
            camera.moved || scene_moved,
        )?;

        self.frames.record_trace(&frame, &dispatch(frame.slot));
        self.frames.end_frame(surface, frame)?;
        Ok(scene_moved)
    }

    pub fn frames(&self) -> &FramePipeline<D> {
        &self.frames
    }

    pub fn uniforms(&self) -> &UniformPublisher<D> {
        &self.uniforms
    }

    pub fn tlas(&self) -> &TopLevelStructure<D> {
        &self.tlas
    }
}
