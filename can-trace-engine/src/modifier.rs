//! Frame-modification boundary
//!
//! Replay can pass every frame through a modifier supplied by the caller
//! (e.g. a simulation layer overriding parameter bytes). Modifiers are pure,
//! called once per frame and must not block.

use crate::types::Frame;

/// Transforms a frame just before it is transmitted
pub trait FrameModifier: Send + Sync {
    fn modify(&self, frame: Frame) -> Frame;
}

/// Modifier that returns every frame unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl FrameModifier for Passthrough {
    fn modify(&self, frame: Frame) -> Frame {
        frame
    }
}

impl<F> FrameModifier for F
where
    F: Fn(Frame) -> Frame + Send + Sync,
{
    fn modify(&self, frame: Frame) -> Frame {
        self(frame)
    }
}
