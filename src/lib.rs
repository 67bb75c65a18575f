//! Deferred OpenGL command submission.
//!
//! A scene renderer records draw/clear/debug operations and uniform writes
//! into a [`CommandQueue`] over the course of a frame. Nothing touches the
//! GL driver until [`CommandQueue::execute`], which replays the recorded
//! batches in submission order while skipping every state transition that
//! would be redundant. Adjacent draws that share program, viewport and
//! framebuffer (and changed nothing in between) are merged into a single
//! draw call at record time.
//!
//! All GL access is funneled through the [`Driver`] trait; [`GlowDriver`]
//! is the production implementation over a [`glow::Context`].

pub mod attachments;
pub mod buffer;
pub mod driver;
mod execute;
pub mod queue;
pub mod uniforms;

pub use buffer::{DrawVertex, VertexBuffer};
pub use driver::{Driver, GlowDriver};
pub use queue::CommandQueue;
pub use uniforms::{
    ChangedUniform, RoundedRect, SharedUniformState, UNUSED_LOCATION, UniformFormat, UniformState,
};

// --- Public Data Contract ---

bitflags::bitflags! {
    /// Which buffers a recorded clear wipes. An empty mask means "all".
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct ClearMask: u32 {
        const COLOR = 1 << 0;
        const DEPTH = 1 << 1;
        const STENCIL = 1 << 2;
    }
}

/// Viewport dimensions captured per batch so the replay pass can skip
/// redundant `glViewport` calls.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Viewport {
    pub width: u16,
    pub height: u16,
}

impl Viewport {
    #[inline(always)]
    pub const fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }
}

/// Scissor region in surface-local coordinates (top-left origin); the
/// replay pass converts to GL window coordinates using the surface height
/// and scale factor it is handed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScissorRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SamplerFilter {
    Linear,
    Nearest,
}

/// Counters reported by one [`CommandQueue::execute`] pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameMetrics {
    /// Texture attachments applied.
    pub n_binds: u32,
    /// Uniform uploads issued.
    pub n_uniforms: u32,
    /// Framebuffer switches issued.
    pub n_fbos: u32,
}
