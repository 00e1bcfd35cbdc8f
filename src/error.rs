use crate::id::{BaseTextureId, NodeId, TextureId};
use crate::math::Rectangle;
use thiserror::Error;

/// Scene-graph invariant violations. Always returned to the caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SceneError {
    #[error("node {0} does not exist or was destroyed")]
    StaleNode(NodeId),
    #[error("node {child} is not a child of {parent}")]
    NotAChild { parent: NodeId, child: NodeId },
    #[error("index {index} is out of bounds for {len} children")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("child range {begin}..{end} is invalid for {len} children")]
    InvalidRange { begin: usize, end: usize, len: usize },
    #[error("adding {child} under {parent} would create a cycle")]
    Cycle { parent: NodeId, child: NodeId },
    #[error("node {0} cannot be used as a mask; only graphics nodes can")]
    InvalidMask(NodeId),
}

/// Texture resource problems. Under the lenient policy these are logged and
/// absorbed into the texture's `valid` flag instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TextureError {
    #[error("base texture {0} does not exist or was destroyed")]
    StaleBaseTexture(BaseTextureId),
    #[error("texture {0} does not exist or was destroyed")]
    StaleTexture(TextureId),
    #[error("frame {frame:?} exceeds base texture bounds {width}x{height}")]
    FrameOutOfBounds {
        frame: Rectangle,
        width: u32,
        height: u32,
    },
    #[error("no texture frame named {0:?}")]
    UnknownFrame(String),
    #[error("expected {expected} bytes of RGBA8 data, got {actual}")]
    InvalidImageData { expected: usize, actual: usize },
}

/// Driver-level failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GpuError {
    #[error("shader {label:?} failed to compile: {message}")]
    ShaderCompilation { label: String, message: String },
    #[error("the GPU context was lost")]
    ContextLost,
    #[error("no suitable GPU adapter was found")]
    NoAdapter,
    #[error("failed to request a GPU device: {0}")]
    DeviceRequest(String),
    #[error("presentation failed: {0}")]
    Present(String),
    #[error("unknown {kind} handle {handle}")]
    UnknownHandle { kind: &'static str, handle: u32 },
    #[error("texture {0} is sampled while bound as the render target")]
    FeedbackLoop(u32),
    #[error("draw issued without a program")]
    NoProgram,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FilterError {
    #[error("a filter needs at least one pass")]
    NoPasses,
    #[error("filter pass has {0} parameters, at most {max} are supported", max = crate::backend::MAX_SHADER_PARAMS)]
    TooManyParams(usize),
}

/// Anything that can abort a frame.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RenderError {
    #[error(transparent)]
    Scene(#[from] SceneError),
    #[error(transparent)]
    Texture(#[from] TextureError),
    #[error(transparent)]
    Gpu(#[from] GpuError),
    #[error(transparent)]
    Filter(#[from] FilterError),
}
