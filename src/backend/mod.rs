//! The driver surface the renderer draws through.
//!
//! [`GpuBackend`] mirrors a WebGL-class API: buffers, textures, render targets,
//! fixed-function blend/stencil state, programs, uniforms and indexed draws.
//! [`SoftwareBackend`] rasterises on the CPU and records every call;
//! [`WgpuBackend`] drives a real device.

mod raster;
mod wgpu_backend;

pub use raster::{BackendCall, BackendStats, DrawRecord, FragmentInput, SoftwareBackend};
pub use wgpu_backend::WgpuBackend;

use crate::error::GpuError;
use crate::id::ContextId;
use crate::texture::ScaleMode;

/// Upper bound on per-pass shader parameters, packed as eight `vec4<f32>`.
pub const MAX_SHADER_PARAMS: usize = 32;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);
    };
}

handle!(
    /// A texture owned by one backend.
    TextureHandle
);
handle!(BufferHandle);
handle!(ProgramHandle);
handle!(
    /// An offscreen colour + stencil target.
    RenderTargetHandle
);

/// One vertex of every draw: logical position, texture coordinate and a packed
/// premultiplied RGBA8 colour.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SpriteVertex {
    pub position: [f32; 2],
    pub uv: [f32; 2],
    pub color: u32,
}

impl SpriteVertex {
    pub const fn new(position: [f32; 2], uv: [f32; 2], color: u32) -> Self {
        Self {
            position,
            uv,
            color,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Vertex,
    Index,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topology {
    TriangleList,
    TriangleStrip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcAlpha,
    OneMinusSrcAlpha,
    SrcColor,
    OneMinusSrcColor,
    DstColor,
    OneMinusDstColor,
    DstAlpha,
    OneMinusDstAlpha,
}

/// Source and destination factors, applied to colour and alpha alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendFunc {
    pub src: BlendFactor,
    pub dst: BlendFactor,
}

impl BlendFunc {
    pub const fn new(src: BlendFactor, dst: BlendFactor) -> Self {
        Self { src, dst }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareFunction {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

impl CompareFunction {
    /// Evaluates `reference <op> value`, the way stencil comparisons read.
    pub fn passes(self, reference: u8, value: u8) -> bool {
        match self {
            Self::Never => false,
            Self::Less => reference < value,
            Self::Equal => reference == value,
            Self::LessEqual => reference <= value,
            Self::Greater => reference > value,
            Self::NotEqual => reference != value,
            Self::GreaterEqual => reference >= value,
            Self::Always => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StencilOp {
    Keep,
    Zero,
    Replace,
    Invert,
    IncrementClamp,
    DecrementClamp,
}

impl StencilOp {
    pub fn apply(self, value: u8, reference: u8) -> u8 {
        match self {
            Self::Keep => value,
            Self::Zero => 0,
            Self::Replace => reference,
            Self::Invert => !value,
            Self::IncrementClamp => value.saturating_add(1),
            Self::DecrementClamp => value.saturating_sub(1),
        }
    }
}

/// Per-draw uniform block shared by every program.
///
/// `projection` is half the logical size of the bound target and `offset` is
/// added to every position first, so a vertex at `p` lands at clip-space
/// `((p + offset) / projection - 1)` with y flipped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Uniforms {
    pub projection: [f32; 2],
    pub offset: [f32; 2],
    /// Input texture size in pixels followed by its reciprocal.
    pub dimensions: [f32; 4],
    pub params: [f32; MAX_SHADER_PARAMS],
}

impl Default for Uniforms {
    fn default() -> Self {
        Self {
            projection: [1.0, 1.0],
            offset: [0.0, 0.0],
            dimensions: [0.0; 4],
            params: [0.0; MAX_SHADER_PARAMS],
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub(crate) struct UniformBlock {
    pub projection: [f32; 2],
    pub offset: [f32; 2],
    pub dimensions: [f32; 4],
    pub params: [[f32; 4]; MAX_SHADER_PARAMS / 4],
}

impl From<&Uniforms> for UniformBlock {
    fn from(uniforms: &Uniforms) -> Self {
        let mut params = [[0.0; 4]; MAX_SHADER_PARAMS / 4];
        for (index, value) in uniforms.params.iter().enumerate() {
            params[index / 4][index % 4] = *value;
        }
        Self {
            projection: uniforms.projection,
            offset: uniforms.offset,
            dimensions: uniforms.dimensions,
            params,
        }
    }
}

/// CPU fragment stage used by [`SoftwareBackend`]. Returns premultiplied RGBA.
pub type RasterFragment = fn(&FragmentInput<'_>) -> [f32; 4];

/// Everything a backend needs to build a program.
#[derive(Clone, Copy)]
pub struct ProgramSource<'a> {
    pub label: &'a str,
    /// WGSL defining `fs_main`, compiled after the shared prelude.
    pub fragment_wgsl: &'a str,
    pub raster: RasterFragment,
}

impl std::fmt::Debug for ProgramSource<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramSource")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// An abstract WebGL-class graphics context.
///
/// State calls (`set_blend`, `stencil_func`, `use_program`, ...) persist until
/// changed and apply to every later draw. Every method returning `Result`
/// fails with [`GpuError::ContextLost`] while the context is lost.
pub trait GpuBackend {
    fn context_id(&self) -> ContextId;

    fn is_context_lost(&self) -> bool;

    /// Physical size of the default framebuffer.
    fn size(&self) -> (u32, u32);

    fn resize(&mut self, width: u32, height: u32) -> Result<(), GpuError>;

    fn create_buffer(&mut self, kind: BufferKind, size: usize) -> Result<BufferHandle, GpuError>;

    fn write_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: usize,
        data: &[u8],
    ) -> Result<(), GpuError>;

    fn delete_buffer(&mut self, buffer: BufferHandle);

    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        scale_mode: ScaleMode,
    ) -> Result<TextureHandle, GpuError>;

    /// Replaces the texture's pixels (premultiplied RGBA8), resizing it if needed.
    fn upload_texture(
        &mut self,
        texture: TextureHandle,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<(), GpuError>;

    fn delete_texture(&mut self, texture: TextureHandle);

    /// Binds the texture sampled by later draws; `None` binds opaque white.
    fn bind_texture(&mut self, texture: Option<TextureHandle>) -> Result<(), GpuError>;

    fn create_render_target(
        &mut self,
        width: u32,
        height: u32,
    ) -> Result<RenderTargetHandle, GpuError>;

    /// Resizes in place. Contents are undefined afterwards.
    fn resize_render_target(
        &mut self,
        target: RenderTargetHandle,
        width: u32,
        height: u32,
    ) -> Result<(), GpuError>;

    /// The colour texture of a render target, for sampling.
    fn render_target_texture(&self, target: RenderTargetHandle) -> Option<TextureHandle>;

    /// Redirects draws; `None` selects the default framebuffer.
    fn bind_render_target(&mut self, target: Option<RenderTargetHandle>) -> Result<(), GpuError>;

    fn delete_render_target(&mut self, target: RenderTargetHandle);

    fn set_viewport(&mut self, x: u32, y: u32, width: u32, height: u32);

    /// Clears the bound target's colour (premultiplied) and/or stencil.
    fn clear(&mut self, color: Option<[f32; 4]>, stencil: bool) -> Result<(), GpuError>;

    /// `None` disables blending.
    fn set_blend(&mut self, blend: Option<BlendFunc>);

    fn set_color_mask(&mut self, write: bool);

    fn set_stencil_test(&mut self, enabled: bool);

    fn stencil_func(&mut self, func: CompareFunction, reference: u8, mask: u8);

    fn stencil_op(&mut self, fail: StencilOp, pass: StencilOp);

    fn compile_program(&mut self, source: &ProgramSource<'_>) -> Result<ProgramHandle, GpuError>;

    fn delete_program(&mut self, program: ProgramHandle);

    fn use_program(&mut self, program: ProgramHandle) -> Result<(), GpuError>;

    fn set_uniforms(&mut self, uniforms: &Uniforms);

    /// Draws `index_count` `u16` indices starting at `first_index`.
    fn draw_indexed(
        &mut self,
        topology: Topology,
        vertices: BufferHandle,
        indices: BufferHandle,
        first_index: u32,
        index_count: u32,
    ) -> Result<(), GpuError>;

    fn begin_frame(&mut self) -> Result<(), GpuError>;

    /// Finishes the frame; the backend may submit queued work here.
    fn end_frame(&mut self) -> Result<(), GpuError>;

    /// Copies the default framebuffer into `out` as tightly packed RGBA8.
    fn read_pixels(&mut self, out: &mut Vec<u8>) -> Result<(u32, u32), GpuError>;
}

/// Builds the static quad index pattern `[0, 1, 2, 0, 2, 3]` for `quads` quads.
///
/// Stops at [`MAX_BATCH_SIZE`](crate::MAX_BATCH_SIZE) quads, the last one whose
/// vertices fit in `u16`.
pub(crate) fn quad_indices(quads: usize) -> Vec<u16> {
    let quads = quads.min(crate::config::MAX_BATCH_SIZE);
    let mut indices = Vec::with_capacity(quads * 6);
    for base in (0..=u16::MAX - 3).step_by(4).take(quads) {
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    indices
}
