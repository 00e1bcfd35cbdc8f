use super::blend::BlendMode;
use super::shaders::ShaderRegistry;
use super::types::FrameStats;
use crate::backend::{
    BlendFunc, BufferHandle, GpuBackend, RenderTargetHandle, TextureHandle, Topology, Uniforms,
    MAX_SHADER_PARAMS,
};
use crate::error::GpuError;
use crate::filters::Shader;
use crate::id::{BaseTextureId, ContextId};
use crate::math::Rectangle;
use crate::texture::TextureRegistry;
use std::rc::Rc;

/// Where draws currently land and how logical coordinates map onto it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Viewport {
    pub target: Option<RenderTargetHandle>,
    /// Colour texture of `target`; never sampled while bound.
    pub target_texture: Option<TextureHandle>,
    /// Half the logical size of the drawable region.
    pub projection: [f32; 2],
    pub offset: [f32; 2],
    /// Physical pixels.
    pub size: (u32, u32),
    /// The drawable region in world coordinates.
    pub area: Rectangle,
}

impl Viewport {
    pub(crate) fn new(
        target: Option<RenderTargetHandle>,
        target_texture: Option<TextureHandle>,
        area: Rectangle,
        size: (u32, u32),
    ) -> Self {
        Self {
            target,
            target_texture,
            projection: [area.width / 2.0, area.height / 2.0],
            offset: [-area.x, -area.y],
            size,
            area,
        }
    }
}

/// Draw state the renderer has applied to the backend this frame.
#[derive(Debug)]
pub(crate) struct DrawState {
    pub viewport: Viewport,
    pub program: Option<crate::backend::ProgramHandle>,
    pub blend: Option<BlendFunc>,
    pub uniforms: Option<Uniforms>,
    pub resolution: f32,
}

/// The backend plus everything a frame touches besides the scene itself.
pub(crate) struct RenderContext<'a, B: GpuBackend> {
    pub backend: &'a mut B,
    pub textures: &'a mut TextureRegistry,
    pub shaders: &'a mut ShaderRegistry,
    pub state: DrawState,
    pub stats: FrameStats,
}

impl<'a, B: GpuBackend> RenderContext<'a, B> {
    pub(crate) fn new(
        backend: &'a mut B,
        textures: &'a mut TextureRegistry,
        shaders: &'a mut ShaderRegistry,
        viewport: Viewport,
        resolution: f32,
    ) -> Self {
        Self {
            backend,
            textures,
            shaders,
            state: DrawState {
                viewport,
                program: None,
                blend: None,
                uniforms: None,
                resolution,
            },
            stats: FrameStats::default(),
        }
    }

    pub(crate) fn context_id(&self) -> ContextId {
        self.backend.context_id()
    }

    /// Binds the viewport's target and maps logical coordinates onto it.
    pub(crate) fn bind_viewport(&mut self, viewport: Viewport) -> Result<(), GpuError> {
        self.backend.bind_render_target(viewport.target)?;
        self.backend
            .set_viewport(0, 0, viewport.size.0, viewport.size.1);
        self.state.viewport = viewport;
        Ok(())
    }

    pub(crate) fn use_shader(&mut self, shader: &Rc<Shader>) -> Result<(), GpuError> {
        let program = self.shaders.program(&mut *self.backend, shader)?;
        if self.state.program != Some(program) {
            self.backend.use_program(program)?;
            self.state.program = Some(program);
        }
        Ok(())
    }

    /// Uploads uniforms for the current viewport, skipping the call when nothing changed.
    pub(crate) fn apply_uniforms(&mut self, dimensions: [f32; 4], params: [f32; MAX_SHADER_PARAMS]) {
        let uniforms = Uniforms {
            projection: self.state.viewport.projection,
            offset: self.state.viewport.offset,
            dimensions,
            params,
        };
        if self.state.uniforms != Some(uniforms) {
            self.backend.set_uniforms(&uniforms);
            self.state.uniforms = Some(uniforms);
        }
    }

    pub(crate) fn apply_default_uniforms(&mut self) {
        self.apply_uniforms([0.0; 4], [0.0; MAX_SHADER_PARAMS]);
    }

    pub(crate) fn set_blend(&mut self, blend: Option<BlendFunc>) {
        if self.state.blend != blend {
            self.backend.set_blend(blend);
            self.state.blend = blend;
        }
    }

    pub(crate) fn set_blend_mode(&mut self, mode: BlendMode) {
        self.set_blend(Some(mode.func()));
    }

    /// Resolves a base texture to a bindable handle on this context,
    /// uploading first when the context's copy is missing or dirty.
    ///
    /// `None` means the texture cannot be drawn here yet.
    pub(crate) fn texture_handle(
        &mut self,
        id: BaseTextureId,
    ) -> Result<Option<TextureHandle>, GpuError> {
        let context = self.backend.context_id();
        let Some(base) = self.textures.base_texture_mut(id) else {
            return Ok(None);
        };
        if !base.is_available_on(context) {
            return Ok(None);
        }
        if !base.is_dirty(context) {
            return Ok(base.handle(context));
        }
        let Some(pixels) = base.pixels() else {
            // Render-target pixels already live on their context.
            return Ok(base.handle(context));
        };
        let (width, height) = (base.width(), base.height());
        let handle = match base.handle(context) {
            Some(handle) => handle,
            None => self
                .backend
                .create_texture(width, height, base.scale_mode)?,
        };
        self.backend.upload_texture(handle, width, height, pixels)?;
        base.set_uploaded(context, handle);
        self.stats.texture_uploads += 1;
        tracing::trace!(base = %id, ?handle, "uploaded base texture");
        Ok(Some(handle))
    }

    /// Binds a texture for sampling; `None` binds opaque white.
    ///
    /// Returns false, binding nothing, when the texture is the target being drawn into.
    pub(crate) fn bind_texture(&mut self, texture: Option<TextureHandle>) -> Result<bool, GpuError> {
        if texture.is_some() && texture == self.state.viewport.target_texture {
            tracing::warn!(
                ?texture,
                "skipping draw that samples the texture it renders into"
            );
            return Ok(false);
        }
        self.backend.bind_texture(texture)?;
        Ok(true)
    }

    pub(crate) fn draw(
        &mut self,
        topology: Topology,
        vertices: BufferHandle,
        indices: BufferHandle,
        first_index: u32,
        index_count: u32,
    ) -> Result<(), GpuError> {
        if index_count == 0 {
            return Ok(());
        }
        self.backend
            .draw_indexed(topology, vertices, indices, first_index, index_count)?;
        self.stats.draw_calls += 1;
        Ok(())
    }
}

/// Grows `buffer` to hold at least `required` bytes, doubling to amortise.
pub(crate) fn ensure_buffer<B: GpuBackend + ?Sized>(
    backend: &mut B,
    buffer: &mut Option<(BufferHandle, usize)>,
    kind: crate::backend::BufferKind,
    required: usize,
) -> Result<BufferHandle, GpuError> {
    if let Some((handle, capacity)) = *buffer {
        if capacity >= required {
            return Ok(handle);
        }
        backend.delete_buffer(handle);
    }
    let capacity = required.next_power_of_two().max(256);
    let handle = backend.create_buffer(kind, capacity)?;
    *buffer = Some((handle, capacity));
    Ok(handle)
}
