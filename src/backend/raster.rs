//! CPU reference backend.
//!
//! Rasterises triangles with edge functions at pixel centres (top-left fill
//! rule), keeps an 8-bit stencil buffer per target and records every call so
//! tests can assert on exact driver traffic.

use super::{
    BlendFactor, BlendFunc, BufferHandle, BufferKind, CompareFunction, GpuBackend, ProgramHandle,
    ProgramSource, RasterFragment, RenderTargetHandle, SpriteVertex, StencilOp, TextureHandle,
    Topology, Uniforms, MAX_SHADER_PARAMS,
};
use crate::error::GpuError;
use crate::id::ContextId;
use crate::texture::ScaleMode;
use ahash::AHashMap;
use std::num::NonZeroU32;
use wgpu::rwh::{HasDisplayHandle, HasWindowHandle};

const VERTEX_STRIDE: usize = std::mem::size_of::<SpriteVertex>();

/// Inputs to a [`RasterFragment`] for one covered pixel.
pub struct FragmentInput<'a> {
    pub uv: [f32; 2],
    /// Interpolated premultiplied vertex colour.
    pub color: [f32; 4],
    pub uniforms: &'a Uniforms,
    texture: Option<&'a SoftTexture>,
}

impl FragmentInput<'_> {
    /// Samples the bound texture with its own filtering; opaque white when none is bound.
    pub fn sample(&self, u: f32, v: f32) -> [f32; 4] {
        match self.texture {
            Some(texture) => texture.sample(u, v),
            None => [1.0; 4],
        }
    }

    pub fn params(&self) -> &[f32; MAX_SHADER_PARAMS] {
        &self.uniforms.params
    }
}

/// One recorded draw, with the state it ran under.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawRecord {
    pub topology: Topology,
    pub first_index: u32,
    pub index_count: u32,
    pub program: ProgramHandle,
    pub texture: Option<TextureHandle>,
    pub target: Option<RenderTargetHandle>,
    pub blend: Option<BlendFunc>,
    pub color_write: bool,
    pub stencil_test: bool,
}

/// Every driver call a [`SoftwareBackend`] received, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    CreateBuffer {
        buffer: BufferHandle,
        kind: BufferKind,
        size: usize,
    },
    WriteBuffer {
        buffer: BufferHandle,
        offset: usize,
        len: usize,
    },
    DeleteBuffer(BufferHandle),
    CreateTexture(TextureHandle),
    UploadTexture {
        texture: TextureHandle,
        width: u32,
        height: u32,
    },
    DeleteTexture(TextureHandle),
    BindTexture(Option<TextureHandle>),
    CreateRenderTarget {
        target: RenderTargetHandle,
        width: u32,
        height: u32,
    },
    ResizeRenderTarget {
        target: RenderTargetHandle,
        width: u32,
        height: u32,
    },
    BindRenderTarget(Option<RenderTargetHandle>),
    DeleteRenderTarget(RenderTargetHandle),
    Viewport([u32; 4]),
    Clear {
        color: Option<[f32; 4]>,
        stencil: bool,
    },
    SetBlend(Option<BlendFunc>),
    ColorMask(bool),
    StencilTest(bool),
    StencilFunc {
        func: CompareFunction,
        reference: u8,
        mask: u8,
    },
    StencilOp {
        fail: StencilOp,
        pass: StencilOp,
    },
    CompileProgram(ProgramHandle),
    DeleteProgram(ProgramHandle),
    UseProgram(ProgramHandle),
    SetUniforms(Uniforms),
    Draw(DrawRecord),
    BeginFrame,
    EndFrame,
}

/// Running totals since construction or the last [`SoftwareBackend::reset_stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub draw_calls: u32,
    pub texture_uploads: u32,
    pub buffer_writes: u32,
    pub program_compiles: u32,
    pub render_targets_created: u32,
}

#[derive(Debug, Clone)]
struct SoftTexture {
    width: u32,
    height: u32,
    scale_mode: ScaleMode,
    texels: Vec<[f32; 4]>,
}

impl SoftTexture {
    fn new(width: u32, height: u32, scale_mode: ScaleMode) -> Self {
        Self {
            width,
            height,
            scale_mode,
            texels: vec![[0.0; 4]; (width as usize) * (height as usize)],
        }
    }

    fn texel(&self, x: i64, y: i64) -> [f32; 4] {
        let x = x.clamp(0, self.width as i64 - 1) as usize;
        let y = y.clamp(0, self.height as i64 - 1) as usize;
        self.texels[y * self.width as usize + x]
    }

    fn sample(&self, u: f32, v: f32) -> [f32; 4] {
        if self.width == 0 || self.height == 0 || u.is_nan() || v.is_nan() {
            return [0.0; 4];
        }
        let x = u * self.width as f32;
        let y = v * self.height as f32;
        match self.scale_mode {
            ScaleMode::Nearest => self.texel(x.floor() as i64, y.floor() as i64),
            ScaleMode::Linear => {
                let x = x - 0.5;
                let y = y - 0.5;
                let x0 = x.floor();
                let y0 = y.floor();
                let fx = x - x0;
                let fy = y - y0;
                let (x0, y0) = (x0 as i64, y0 as i64);
                let t00 = self.texel(x0, y0);
                let t10 = self.texel(x0 + 1, y0);
                let t01 = self.texel(x0, y0 + 1);
                let t11 = self.texel(x0 + 1, y0 + 1);
                let mut out = [0.0; 4];
                for channel in 0..4 {
                    let top = t00[channel] + (t10[channel] - t00[channel]) * fx;
                    let bottom = t01[channel] + (t11[channel] - t01[channel]) * fx;
                    out[channel] = top + (bottom - top) * fy;
                }
                out
            }
        }
    }
}

#[derive(Debug, Clone)]
struct SoftTarget {
    texture: TextureHandle,
    width: u32,
    height: u32,
    stencil: Vec<u8>,
}

#[derive(Debug, Clone)]
struct SoftBuffer {
    kind: BufferKind,
    bytes: Vec<u8>,
}

#[derive(Clone)]
struct SoftProgram {
    fragment: RasterFragment,
}

impl std::fmt::Debug for SoftProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftProgram").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct FixedState {
    target: Option<RenderTargetHandle>,
    viewport: [u32; 4],
    blend: Option<BlendFunc>,
    color_write: bool,
    stencil_test: bool,
    stencil_func: (CompareFunction, u8, u8),
    stencil_fail: StencilOp,
    stencil_pass: StencilOp,
    program: Option<ProgramHandle>,
    texture: Option<TextureHandle>,
    uniforms: Uniforms,
}

impl FixedState {
    fn new(width: u32, height: u32) -> Self {
        Self {
            target: None,
            viewport: [0, 0, width, height],
            blend: None,
            color_write: true,
            stencil_test: false,
            stencil_func: (CompareFunction::Always, 0, 0xFF),
            stencil_fail: StencilOp::Keep,
            stencil_pass: StencilOp::Keep,
            program: None,
            texture: None,
            uniforms: Uniforms::default(),
        }
    }
}

/// A [`GpuBackend`] that renders into memory.
#[derive(Debug)]
pub struct SoftwareBackend {
    context: ContextId,
    lost: bool,
    next_handle: u32,
    main: SoftTarget,
    targets: AHashMap<RenderTargetHandle, SoftTarget>,
    textures: AHashMap<TextureHandle, SoftTexture>,
    buffers: AHashMap<BufferHandle, SoftBuffer>,
    programs: AHashMap<ProgramHandle, SoftProgram>,
    state: FixedState,
    calls: Vec<BackendCall>,
    stats: BackendStats,
}

impl SoftwareBackend {
    pub fn new(width: u32, height: u32) -> Self {
        let mut backend = Self {
            context: ContextId::next(),
            lost: false,
            next_handle: 1,
            main: SoftTarget {
                texture: TextureHandle(0),
                width,
                height,
                stencil: Vec::new(),
            },
            targets: AHashMap::new(),
            textures: AHashMap::new(),
            buffers: AHashMap::new(),
            programs: AHashMap::new(),
            state: FixedState::new(width, height),
            calls: Vec::new(),
            stats: BackendStats::default(),
        };
        backend.main = backend.new_target(width, height);
        backend
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_handle;
        self.next_handle += 1;
        id
    }

    fn new_target(&mut self, width: u32, height: u32) -> SoftTarget {
        let texture = TextureHandle(self.next_id());
        self.textures
            .insert(texture, SoftTexture::new(width, height, ScaleMode::Linear));
        SoftTarget {
            texture,
            width,
            height,
            stencil: vec![0; (width as usize) * (height as usize)],
        }
    }

    fn live(&self) -> Result<(), GpuError> {
        if self.lost {
            Err(GpuError::ContextLost)
        } else {
            Ok(())
        }
    }

    fn record(&mut self, call: BackendCall) {
        self.calls.push(call);
    }

    pub fn calls(&self) -> &[BackendCall] {
        &self.calls
    }

    pub fn take_calls(&mut self) -> Vec<BackendCall> {
        std::mem::take(&mut self.calls)
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    /// Recorded draws, in submission order.
    pub fn draws(&self) -> impl Iterator<Item = &DrawRecord> {
        self.calls.iter().filter_map(|call| match call {
            BackendCall::Draw(record) => Some(record),
            _ => None,
        })
    }

    pub fn stats(&self) -> BackendStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = BackendStats::default();
    }

    pub fn live_render_targets(&self) -> usize {
        self.targets.len()
    }

    pub fn live_textures(&self) -> usize {
        // The default framebuffer's colour texture is internal.
        self.textures.len().saturating_sub(1 + self.targets.len())
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn stencil_test_enabled(&self) -> bool {
        self.state.stencil_test
    }

    /// The default framebuffer's stencil values, row-major.
    pub fn stencil_snapshot(&self) -> &[u8] {
        &self.main.stencil
    }

    pub fn render_target_stencil(&self, target: RenderTargetHandle) -> Option<&[u8]> {
        self.targets.get(&target).map(|t| t.stencil.as_slice())
    }

    /// Premultiplied RGBA8 of one default-framebuffer pixel.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.main.width || y >= self.main.height {
            return None;
        }
        let texture = self.textures.get(&self.main.texture)?;
        Some(to_rgba8(
            texture.texels[(y * self.main.width + x) as usize],
        ))
    }

    /// Simulates a lost context: every later call fails or is ignored.
    pub fn lose_context(&mut self) {
        tracing::warn!(context = %self.context, "software context lost");
        self.lost = true;
    }

    /// Brings the context back with every resource gone, like a real driver would.
    pub fn restore_context(&mut self) {
        self.lost = false;
        self.targets.clear();
        self.textures.clear();
        self.buffers.clear();
        self.programs.clear();
        let (width, height) = (self.main.width, self.main.height);
        self.main = self.new_target(width, height);
        self.state = FixedState::new(width, height);
        tracing::info!(context = %self.context, "software context restored");
    }

    /// Copies the default framebuffer into a softbuffer surface.
    pub fn present<D, W>(&self, surface: &mut softbuffer::Surface<D, W>) -> Result<(), GpuError>
    where
        D: HasDisplayHandle,
        W: HasWindowHandle,
    {
        let (Some(width), Some(height)) = (
            NonZeroU32::new(self.main.width),
            NonZeroU32::new(self.main.height),
        ) else {
            return Ok(());
        };
        surface
            .resize(width, height)
            .map_err(|error| GpuError::Present(error.to_string()))?;
        let mut buffer = surface
            .buffer_mut()
            .map_err(|error| GpuError::Present(error.to_string()))?;
        if let Some(texture) = self.textures.get(&self.main.texture) {
            for (out, texel) in buffer.iter_mut().zip(&texture.texels) {
                let [r, g, b, _] = to_rgba8(*texel);
                *out = (u32::from(r) << 16) | (u32::from(g) << 8) | u32::from(b);
            }
        }
        buffer
            .present()
            .map_err(|error| GpuError::Present(error.to_string()))
    }

    fn bound_target_texture(&self) -> Option<TextureHandle> {
        match self.state.target {
            None => Some(self.main.texture),
            Some(target) => self.targets.get(&target).map(|t| t.texture),
        }
    }

    fn read_vertices(&self, buffer: BufferHandle) -> Result<Vec<SpriteVertex>, GpuError> {
        let bytes = &self
            .buffers
            .get(&buffer)
            .ok_or(GpuError::UnknownHandle {
                kind: "buffer",
                handle: buffer.0,
            })?
            .bytes;
        Ok(bytes
            .chunks_exact(VERTEX_STRIDE)
            .map(bytemuck::pod_read_unaligned::<SpriteVertex>)
            .collect())
    }

    fn read_indices(
        &self,
        buffer: BufferHandle,
        first: u32,
        count: u32,
    ) -> Result<Vec<u16>, GpuError> {
        let bytes = &self
            .buffers
            .get(&buffer)
            .ok_or(GpuError::UnknownHandle {
                kind: "buffer",
                handle: buffer.0,
            })?
            .bytes;
        let start = first as usize * 2;
        let end = (start + count as usize * 2).min(bytes.len());
        if start >= end {
            return Ok(Vec::new());
        }
        Ok(bytes[start..end]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect())
    }
}

fn to_rgba8(texel: [f32; 4]) -> [u8; 4] {
    texel.map(|channel| (channel.clamp(0.0, 1.0) * 255.0).round() as u8)
}

fn blend_factor(factor: BlendFactor, src: [f32; 4], dst: [f32; 4], channel: usize) -> f32 {
    match factor {
        BlendFactor::Zero => 0.0,
        BlendFactor::One => 1.0,
        BlendFactor::SrcAlpha => src[3],
        BlendFactor::OneMinusSrcAlpha => 1.0 - src[3],
        BlendFactor::SrcColor => src[channel],
        BlendFactor::OneMinusSrcColor => 1.0 - src[channel],
        BlendFactor::DstColor => dst[channel],
        BlendFactor::OneMinusDstColor => 1.0 - dst[channel],
        BlendFactor::DstAlpha => dst[3],
        BlendFactor::OneMinusDstAlpha => 1.0 - dst[3],
    }
}

fn blend(func: Option<BlendFunc>, src: [f32; 4], dst: [f32; 4]) -> [f32; 4] {
    let Some(func) = func else {
        return src.map(|c| c.clamp(0.0, 1.0));
    };
    let mut out = [0.0; 4];
    for channel in 0..4 {
        let value = src[channel] * blend_factor(func.src, src, dst, channel)
            + dst[channel] * blend_factor(func.dst, src, dst, channel);
        out[channel] = value.clamp(0.0, 1.0);
    }
    out
}

#[derive(Clone, Copy)]
struct ScreenVertex {
    x: f32,
    y: f32,
    uv: [f32; 2],
    color: [f32; 4],
}

fn edge(a: &ScreenVertex, b: &ScreenVertex, px: f32, py: f32) -> f32 {
    (b.x - a.x) * (py - a.y) - (b.y - a.y) * (px - a.x)
}

/// Whether pixels exactly on edge `a -> b` belong to the triangle. Antisymmetric,
/// so an edge shared by two triangles is filled exactly once.
fn owns_edge(a: &ScreenVertex, b: &ScreenVertex) -> bool {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    dy > 0.0 || (dy == 0.0 && dx > 0.0)
}

struct Raster<'a> {
    width: u32,
    height: u32,
    texels: &'a mut [[f32; 4]],
    stencil: &'a mut [u8],
    source: Option<&'a SoftTexture>,
    state: &'a FixedState,
    fragment: RasterFragment,
}

impl Raster<'_> {
    fn triangle(&mut self, v0: ScreenVertex, v1: ScreenVertex, v2: ScreenVertex) {
        let (a, mut b, mut c) = (v0, v1, v2);
        let mut area = edge(&a, &b, c.x, c.y);
        if area.is_nan() || area == 0.0 {
            return;
        }
        if area < 0.0 {
            std::mem::swap(&mut b, &mut c);
            area = -area;
        }

        let [vx, vy, vw, vh] = self.state.viewport;
        let clip_x0 = vx.min(self.width) as f32;
        let clip_y0 = vy.min(self.height) as f32;
        let clip_x1 = (vx + vw).min(self.width) as f32;
        let clip_y1 = (vy + vh).min(self.height) as f32;

        let min_x = a.x.min(b.x).min(c.x).floor().max(clip_x0);
        let min_y = a.y.min(b.y).min(c.y).floor().max(clip_y0);
        let max_x = a.x.max(b.x).max(c.x).ceil().min(clip_x1);
        let max_y = a.y.max(b.y).max(c.y).ceil().min(clip_y1);
        if !(min_x < max_x && min_y < max_y) {
            return;
        }

        let owns_bc = owns_edge(&b, &c);
        let owns_ca = owns_edge(&c, &a);
        let owns_ab = owns_edge(&a, &b);

        for y in min_y as u32..max_y as u32 {
            let py = y as f32 + 0.5;
            for x in min_x as u32..max_x as u32 {
                let px = x as f32 + 0.5;
                let w0 = edge(&b, &c, px, py);
                let w1 = edge(&c, &a, px, py);
                let w2 = edge(&a, &b, px, py);
                let inside = (w0 > 0.0 || (w0 == 0.0 && owns_bc))
                    && (w1 > 0.0 || (w1 == 0.0 && owns_ca))
                    && (w2 > 0.0 || (w2 == 0.0 && owns_ab));
                if !inside {
                    continue;
                }
                let (l0, l1, l2) = (w0 / area, w1 / area, w2 / area);
                self.shade(x, y, [l0, l1, l2], [&a, &b, &c]);
            }
        }
    }

    fn shade(&mut self, x: u32, y: u32, weights: [f32; 3], vertices: [&ScreenVertex; 3]) {
        let index = (y * self.width + x) as usize;
        let state = self.state;
        if state.stencil_test {
            let (func, reference, mask) = state.stencil_func;
            let value = self.stencil[index];
            if !func.passes(reference & mask, value & mask) {
                self.stencil[index] = state.stencil_fail.apply(value, reference);
                return;
            }
            self.stencil[index] = state.stencil_pass.apply(value, reference);
        }
        if !state.color_write {
            return;
        }

        let mut uv = [0.0; 2];
        let mut color = [0.0; 4];
        for (weight, vertex) in weights.iter().zip(vertices) {
            uv[0] += weight * vertex.uv[0];
            uv[1] += weight * vertex.uv[1];
            for channel in 0..4 {
                color[channel] += weight * vertex.color[channel];
            }
        }
        let input = FragmentInput {
            uv,
            color,
            uniforms: &state.uniforms,
            texture: self.source,
        };
        let src = (self.fragment)(&input);
        self.texels[index] = blend(state.blend, src, self.texels[index]);
    }
}

impl GpuBackend for SoftwareBackend {
    fn context_id(&self) -> ContextId {
        self.context
    }

    fn is_context_lost(&self) -> bool {
        self.lost
    }

    fn size(&self) -> (u32, u32) {
        (self.main.width, self.main.height)
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<(), GpuError> {
        self.live()?;
        let old = self.main.texture;
        self.textures.remove(&old);
        self.main = self.new_target(width, height);
        if self.state.target.is_none() {
            self.state.viewport = [0, 0, width, height];
        }
        Ok(())
    }

    fn create_buffer(&mut self, kind: BufferKind, size: usize) -> Result<BufferHandle, GpuError> {
        self.live()?;
        let buffer = BufferHandle(self.next_id());
        self.buffers.insert(
            buffer,
            SoftBuffer {
                kind,
                bytes: vec![0; size],
            },
        );
        self.record(BackendCall::CreateBuffer { buffer, kind, size });
        Ok(buffer)
    }

    fn write_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: usize,
        data: &[u8],
    ) -> Result<(), GpuError> {
        self.live()?;
        let target = self
            .buffers
            .get_mut(&buffer)
            .ok_or(GpuError::UnknownHandle {
                kind: "buffer",
                handle: buffer.0,
            })?;
        let end = offset + data.len();
        if target.bytes.len() < end {
            tracing::trace!(?buffer, kind = ?target.kind, end, "growing software buffer");
            target.bytes.resize(end, 0);
        }
        target.bytes[offset..end].copy_from_slice(data);
        self.stats.buffer_writes += 1;
        self.record(BackendCall::WriteBuffer {
            buffer,
            offset,
            len: data.len(),
        });
        Ok(())
    }

    fn delete_buffer(&mut self, buffer: BufferHandle) {
        if self.lost {
            return;
        }
        self.buffers.remove(&buffer);
        self.record(BackendCall::DeleteBuffer(buffer));
    }

    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        scale_mode: ScaleMode,
    ) -> Result<TextureHandle, GpuError> {
        self.live()?;
        let texture = TextureHandle(self.next_id());
        self.textures
            .insert(texture, SoftTexture::new(width, height, scale_mode));
        self.record(BackendCall::CreateTexture(texture));
        Ok(texture)
    }

    fn upload_texture(
        &mut self,
        texture: TextureHandle,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<(), GpuError> {
        self.live()?;
        let target = self
            .textures
            .get_mut(&texture)
            .ok_or(GpuError::UnknownHandle {
                kind: "texture",
                handle: texture.0,
            })?;
        target.width = width;
        target.height = height;
        target.texels = pixels
            .chunks_exact(4)
            .map(|px| [px[0], px[1], px[2], px[3]].map(|c| f32::from(c) / 255.0))
            .collect();
        target
            .texels
            .resize((width as usize) * (height as usize), [0.0; 4]);
        self.stats.texture_uploads += 1;
        self.record(BackendCall::UploadTexture {
            texture,
            width,
            height,
        });
        Ok(())
    }

    fn delete_texture(&mut self, texture: TextureHandle) {
        if self.lost {
            return;
        }
        self.textures.remove(&texture);
        self.record(BackendCall::DeleteTexture(texture));
    }

    fn bind_texture(&mut self, texture: Option<TextureHandle>) -> Result<(), GpuError> {
        self.live()?;
        if let Some(handle) = texture {
            if !self.textures.contains_key(&handle) {
                return Err(GpuError::UnknownHandle {
                    kind: "texture",
                    handle: handle.0,
                });
            }
        }
        self.state.texture = texture;
        self.record(BackendCall::BindTexture(texture));
        Ok(())
    }

    fn create_render_target(
        &mut self,
        width: u32,
        height: u32,
    ) -> Result<RenderTargetHandle, GpuError> {
        self.live()?;
        let target = RenderTargetHandle(self.next_id());
        let soft = self.new_target(width, height);
        self.targets.insert(target, soft);
        self.stats.render_targets_created += 1;
        self.record(BackendCall::CreateRenderTarget {
            target,
            width,
            height,
        });
        Ok(target)
    }

    fn resize_render_target(
        &mut self,
        target: RenderTargetHandle,
        width: u32,
        height: u32,
    ) -> Result<(), GpuError> {
        self.live()?;
        let soft = self
            .targets
            .get_mut(&target)
            .ok_or(GpuError::UnknownHandle {
                kind: "render target",
                handle: target.0,
            })?;
        soft.width = width;
        soft.height = height;
        soft.stencil = vec![0; (width as usize) * (height as usize)];
        let texture = soft.texture;
        if let Some(color) = self.textures.get_mut(&texture) {
            *color = SoftTexture::new(width, height, ScaleMode::Linear);
        }
        self.record(BackendCall::ResizeRenderTarget {
            target,
            width,
            height,
        });
        Ok(())
    }

    fn render_target_texture(&self, target: RenderTargetHandle) -> Option<TextureHandle> {
        self.targets.get(&target).map(|t| t.texture)
    }

    fn bind_render_target(&mut self, target: Option<RenderTargetHandle>) -> Result<(), GpuError> {
        self.live()?;
        if let Some(handle) = target {
            if !self.targets.contains_key(&handle) {
                return Err(GpuError::UnknownHandle {
                    kind: "render target",
                    handle: handle.0,
                });
            }
        }
        self.state.target = target;
        self.record(BackendCall::BindRenderTarget(target));
        Ok(())
    }

    fn delete_render_target(&mut self, target: RenderTargetHandle) {
        if self.lost {
            return;
        }
        if let Some(soft) = self.targets.remove(&target) {
            self.textures.remove(&soft.texture);
        }
        if self.state.target == Some(target) {
            self.state.target = None;
        }
        self.record(BackendCall::DeleteRenderTarget(target));
    }

    fn set_viewport(&mut self, x: u32, y: u32, width: u32, height: u32) {
        if self.lost {
            return;
        }
        self.state.viewport = [x, y, width, height];
        self.record(BackendCall::Viewport([x, y, width, height]));
    }

    fn clear(&mut self, color: Option<[f32; 4]>, stencil: bool) -> Result<(), GpuError> {
        self.live()?;
        let (texture, stencil_buffer) = match self.state.target {
            None => (self.main.texture, &mut self.main.stencil),
            Some(handle) => {
                let soft = self
                    .targets
                    .get_mut(&handle)
                    .ok_or(GpuError::UnknownHandle {
                        kind: "render target",
                        handle: handle.0,
                    })?;
                (soft.texture, &mut soft.stencil)
            }
        };
        if stencil {
            stencil_buffer.fill(0);
        }
        if let Some(color) = color {
            if let Some(target) = self.textures.get_mut(&texture) {
                target.texels.fill(color);
            }
        }
        self.record(BackendCall::Clear { color, stencil });
        Ok(())
    }

    fn set_blend(&mut self, blend: Option<BlendFunc>) {
        if self.lost {
            return;
        }
        self.state.blend = blend;
        self.record(BackendCall::SetBlend(blend));
    }

    fn set_color_mask(&mut self, write: bool) {
        if self.lost {
            return;
        }
        self.state.color_write = write;
        self.record(BackendCall::ColorMask(write));
    }

    fn set_stencil_test(&mut self, enabled: bool) {
        if self.lost {
            return;
        }
        self.state.stencil_test = enabled;
        self.record(BackendCall::StencilTest(enabled));
    }

    fn stencil_func(&mut self, func: CompareFunction, reference: u8, mask: u8) {
        if self.lost {
            return;
        }
        self.state.stencil_func = (func, reference, mask);
        self.record(BackendCall::StencilFunc {
            func,
            reference,
            mask,
        });
    }

    fn stencil_op(&mut self, fail: StencilOp, pass: StencilOp) {
        if self.lost {
            return;
        }
        self.state.stencil_fail = fail;
        self.state.stencil_pass = pass;
        self.record(BackendCall::StencilOp { fail, pass });
    }

    fn compile_program(&mut self, source: &ProgramSource<'_>) -> Result<ProgramHandle, GpuError> {
        self.live()?;
        let program = ProgramHandle(self.next_id());
        self.programs.insert(
            program,
            SoftProgram {
                fragment: source.raster,
            },
        );
        self.stats.program_compiles += 1;
        tracing::debug!(label = source.label, ?program, "compiled software program");
        self.record(BackendCall::CompileProgram(program));
        Ok(program)
    }

    fn delete_program(&mut self, program: ProgramHandle) {
        if self.lost {
            return;
        }
        self.programs.remove(&program);
        if self.state.program == Some(program) {
            self.state.program = None;
        }
        self.record(BackendCall::DeleteProgram(program));
    }

    fn use_program(&mut self, program: ProgramHandle) -> Result<(), GpuError> {
        self.live()?;
        if !self.programs.contains_key(&program) {
            return Err(GpuError::UnknownHandle {
                kind: "program",
                handle: program.0,
            });
        }
        self.state.program = Some(program);
        self.record(BackendCall::UseProgram(program));
        Ok(())
    }

    fn set_uniforms(&mut self, uniforms: &Uniforms) {
        if self.lost {
            return;
        }
        self.state.uniforms = *uniforms;
        self.record(BackendCall::SetUniforms(*uniforms));
    }

    fn draw_indexed(
        &mut self,
        topology: Topology,
        vertices: BufferHandle,
        indices: BufferHandle,
        first_index: u32,
        index_count: u32,
    ) -> Result<(), GpuError> {
        self.live()?;
        let program = self.state.program.ok_or(GpuError::NoProgram)?;
        let fragment = self
            .programs
            .get(&program)
            .ok_or(GpuError::UnknownHandle {
                kind: "program",
                handle: program.0,
            })?
            .fragment;
        let destination = self.bound_target_texture().ok_or(GpuError::UnknownHandle {
            kind: "render target",
            handle: self.state.target.map_or(0, |t| t.0),
        })?;
        if self.state.texture == Some(destination) {
            return Err(GpuError::FeedbackLoop(destination.0));
        }

        let vertex_data = self.read_vertices(vertices)?;
        let index_data = self.read_indices(indices, first_index, index_count)?;

        self.stats.draw_calls += 1;
        self.record(BackendCall::Draw(DrawRecord {
            topology,
            first_index,
            index_count,
            program,
            texture: self.state.texture,
            target: self.state.target,
            blend: self.state.blend,
            color_write: self.state.color_write,
            stencil_test: self.state.stencil_test,
        }));

        let [vx, vy, vw, vh] = self.state.viewport;
        let uniforms = self.state.uniforms;
        let to_screen = |vertex: &SpriteVertex| {
            let [r, g, b, a] = vertex.color.to_le_bytes();
            ScreenVertex {
                x: vx as f32
                    + (vertex.position[0] + uniforms.offset[0]) / (2.0 * uniforms.projection[0])
                        * vw as f32,
                y: vy as f32
                    + (vertex.position[1] + uniforms.offset[1]) / (2.0 * uniforms.projection[1])
                        * vh as f32,
                uv: vertex.uv,
                color: [r, g, b, a].map(|c| f32::from(c) / 255.0),
            }
        };
        let screen: Vec<Option<ScreenVertex>> = index_data
            .iter()
            .map(|index| vertex_data.get(*index as usize).map(to_screen))
            .collect();

        let Some(mut dest) = self.textures.remove(&destination) else {
            return Ok(());
        };
        let (width, height, stencil) = match self.state.target {
            None => (self.main.width, self.main.height, &mut self.main.stencil),
            Some(handle) => match self.targets.get_mut(&handle) {
                Some(soft) => (soft.width, soft.height, &mut soft.stencil),
                None => {
                    self.textures.insert(destination, dest);
                    return Ok(());
                }
            },
        };
        let mut raster = Raster {
            width,
            height,
            texels: &mut dest.texels,
            stencil,
            source: self.state.texture.and_then(|t| self.textures.get(&t)),
            state: &self.state,
            fragment,
        };
        let mut triangle = |a: &Option<ScreenVertex>, b: &Option<ScreenVertex>, c: &Option<ScreenVertex>| {
            if let (Some(a), Some(b), Some(c)) = (a, b, c) {
                raster.triangle(*a, *b, *c);
            }
        };
        match topology {
            Topology::TriangleList => {
                for tri in screen.chunks_exact(3) {
                    triangle(&tri[0], &tri[1], &tri[2]);
                }
            }
            Topology::TriangleStrip => {
                for tri in screen.windows(3) {
                    triangle(&tri[0], &tri[1], &tri[2]);
                }
            }
        }
        self.textures.insert(destination, dest);
        Ok(())
    }

    fn begin_frame(&mut self) -> Result<(), GpuError> {
        self.live()?;
        self.record(BackendCall::BeginFrame);
        Ok(())
    }

    fn end_frame(&mut self) -> Result<(), GpuError> {
        self.live()?;
        self.record(BackendCall::EndFrame);
        Ok(())
    }

    fn read_pixels(&mut self, out: &mut Vec<u8>) -> Result<(u32, u32), GpuError> {
        self.live()?;
        out.clear();
        if let Some(texture) = self.textures.get(&self.main.texture) {
            out.reserve(texture.texels.len() * 4);
            for texel in &texture.texels {
                out.extend_from_slice(&to_rgba8(*texel));
            }
        }
        Ok((self.main.width, self.main.height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::quad_indices;

    fn flat(input: &FragmentInput<'_>) -> [f32; 4] {
        let texel = input.sample(input.uv[0], input.uv[1]);
        [0, 1, 2, 3].map(|i| texel[i] * input.color[i])
    }

    fn setup(width: u32, height: u32) -> (SoftwareBackend, BufferHandle, BufferHandle) {
        let mut backend = SoftwareBackend::new(width, height);
        let program = backend
            .compile_program(&ProgramSource {
                label: "flat",
                fragment_wgsl: "",
                raster: flat,
            })
            .unwrap();
        backend.use_program(program).unwrap();
        backend.set_uniforms(&Uniforms {
            projection: [width as f32 / 2.0, height as f32 / 2.0],
            ..Default::default()
        });
        let vertices = backend.create_buffer(BufferKind::Vertex, 0).unwrap();
        let indices = backend.create_buffer(BufferKind::Index, 0).unwrap();
        backend
            .write_buffer(indices, 0, bytemuck::cast_slice(&quad_indices(4)))
            .unwrap();
        (backend, vertices, indices)
    }

    fn quad(x0: f32, y0: f32, x1: f32, y1: f32, color: u32) -> [SpriteVertex; 4] {
        [
            SpriteVertex::new([x0, y0], [0.0, 0.0], color),
            SpriteVertex::new([x1, y0], [1.0, 0.0], color),
            SpriteVertex::new([x1, y1], [1.0, 1.0], color),
            SpriteVertex::new([x0, y1], [0.0, 1.0], color),
        ]
    }

    const RED: u32 = u32::from_le_bytes([255, 0, 0, 255]);

    #[test]
    fn quad_covers_exactly_its_pixels() {
        let (mut backend, vertices, indices) = setup(8, 8);
        backend
            .write_buffer(vertices, 0, bytemuck::cast_slice(&quad(2.0, 2.0, 5.0, 4.0, RED)))
            .unwrap();
        backend
            .draw_indexed(Topology::TriangleList, vertices, indices, 0, 6)
            .unwrap();

        let mut covered = 0;
        for y in 0..8 {
            for x in 0..8 {
                let inside = (2..5).contains(&x) && (2..4).contains(&y);
                let pixel = backend.pixel(x, y).unwrap();
                assert_eq!(pixel[0] == 255, inside, "pixel ({x}, {y})");
                covered += usize::from(inside);
            }
        }
        assert_eq!(covered, 6);
    }

    #[test]
    fn shared_edges_are_not_filled_twice() {
        let (mut backend, vertices, indices) = setup(4, 4);
        backend.set_stencil_test(true);
        backend.stencil_func(CompareFunction::Always, 0, 0xFF);
        backend.stencil_op(StencilOp::Keep, StencilOp::IncrementClamp);
        backend
            .write_buffer(vertices, 0, bytemuck::cast_slice(&quad(0.0, 0.0, 4.0, 4.0, RED)))
            .unwrap();
        backend
            .draw_indexed(Topology::TriangleList, vertices, indices, 0, 6)
            .unwrap();
        assert!(backend.stencil_snapshot().iter().all(|v| *v == 1));
    }

    #[test]
    fn stencil_equal_clips_colour() {
        let (mut backend, vertices, indices) = setup(4, 4);
        backend.set_stencil_test(true);
        backend.set_color_mask(false);
        backend.stencil_func(CompareFunction::Always, 0, 0xFF);
        backend.stencil_op(StencilOp::Keep, StencilOp::IncrementClamp);
        backend
            .write_buffer(vertices, 0, bytemuck::cast_slice(&quad(0.0, 0.0, 2.0, 4.0, RED)))
            .unwrap();
        backend
            .draw_indexed(Topology::TriangleList, vertices, indices, 0, 6)
            .unwrap();

        backend.set_color_mask(true);
        backend.stencil_func(CompareFunction::Equal, 1, 0xFF);
        backend.stencil_op(StencilOp::Keep, StencilOp::Keep);
        backend
            .write_buffer(vertices, 0, bytemuck::cast_slice(&quad(0.0, 0.0, 4.0, 4.0, RED)))
            .unwrap();
        backend
            .draw_indexed(Topology::TriangleList, vertices, indices, 0, 6)
            .unwrap();

        assert_eq!(backend.pixel(1, 1).unwrap()[0], 255);
        assert_eq!(backend.pixel(3, 1).unwrap()[0], 0);
    }

    #[test]
    fn sampling_the_bound_target_is_rejected() {
        let (mut backend, vertices, indices) = setup(4, 4);
        let target = backend.create_render_target(4, 4).unwrap();
        let texture = backend.render_target_texture(target).unwrap();
        backend.bind_render_target(Some(target)).unwrap();
        backend.bind_texture(Some(texture)).unwrap();
        assert_eq!(
            backend.draw_indexed(Topology::TriangleList, vertices, indices, 0, 6),
            Err(GpuError::FeedbackLoop(texture.0))
        );
    }

    #[test]
    fn lost_context_rejects_and_records_nothing() {
        let (mut backend, vertices, _) = setup(4, 4);
        backend.clear_calls();
        backend.lose_context();
        assert_eq!(
            backend.write_buffer(vertices, 0, &[0; 4]),
            Err(GpuError::ContextLost)
        );
        backend.set_blend(None);
        assert!(backend.calls().is_empty());

        backend.restore_context();
        assert_eq!(backend.live_buffers(), 0);
        assert!(!backend.is_context_lost());
    }

    #[test]
    fn premultiplied_over_blend() {
        let src = [0.5, 0.0, 0.0, 0.5];
        let dst = [0.0, 0.0, 1.0, 1.0];
        let out = blend(
            Some(BlendFunc::new(BlendFactor::One, BlendFactor::OneMinusSrcAlpha)),
            src,
            dst,
        );
        assert_eq!(out, [0.5, 0.0, 0.5, 1.0]);
    }

    #[test]
    fn nearest_sampling_picks_texel() {
        let mut texture = SoftTexture::new(2, 1, ScaleMode::Nearest);
        texture.texels = vec![[1.0, 0.0, 0.0, 1.0], [0.0, 1.0, 0.0, 1.0]];
        assert_eq!(texture.sample(0.25, 0.5), [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(texture.sample(0.75, 0.5), [0.0, 1.0, 0.0, 1.0]);
    }
}
