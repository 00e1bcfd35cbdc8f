use super::blend::BlendMode;
use super::context::RenderContext;
use crate::backend::{quad_indices, BufferHandle, BufferKind, GpuBackend, SpriteVertex, Topology};
use crate::config::MAX_BATCH_SIZE;
use crate::error::GpuError;
use crate::filters::{passthrough_shader, Shader};
use crate::id::BaseTextureId;
use crate::scene::{Node, Sprite};
use std::rc::Rc;

const VERTEX_SIZE: usize = std::mem::size_of::<SpriteVertex>();

#[derive(Debug, Clone)]
struct QueuedSprite {
    base: BaseTextureId,
    /// Placeholder with nothing underneath; never breaks a run.
    skip: bool,
    blend: BlendMode,
    shader: Rc<Shader>,
}

/// One run of consecutive sprites sharing texture, blend mode and shader.
#[derive(Debug, Clone)]
struct Run {
    texture: Option<BaseTextureId>,
    blend: BlendMode,
    shader: Rc<Shader>,
    start: usize,
    len: usize,
}

/// Accumulates sprite quads and draws each maximal run of compatible sprites
/// with one indexed draw.
#[derive(Debug)]
pub(crate) struct SpriteBatch {
    capacity: usize,
    vertices: Vec<SpriteVertex>,
    queue: Vec<QueuedSprite>,
    vertex_buffer: Option<BufferHandle>,
    index_buffer: Option<BufferHandle>,
}

impl SpriteBatch {
    /// `capacity` is clamped to `1..=MAX_BATCH_SIZE`.
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_BATCH_SIZE);
        Self {
            capacity,
            vertices: Vec::with_capacity(capacity * 4),
            queue: Vec::with_capacity(capacity),
            vertex_buffer: None,
            index_buffer: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Creates the vertex buffer and the static quad index buffer.
    pub(crate) fn init<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) -> Result<(), GpuError> {
        let vertices = backend.create_buffer(BufferKind::Vertex, self.capacity * 4 * VERTEX_SIZE)?;
        let index_data = quad_indices(self.capacity);
        let indices = backend.create_buffer(BufferKind::Index, index_data.len() * 2)?;
        backend.write_buffer(indices, 0, bytemuck::cast_slice(&index_data))?;
        self.vertex_buffer = Some(vertices);
        self.index_buffer = Some(indices);
        tracing::debug!(capacity = self.capacity, "sprite batch buffers created");
        Ok(())
    }

    /// The static index buffer; its first six indices describe one quad.
    pub(crate) fn index_buffer(&self) -> Option<BufferHandle> {
        self.index_buffer
    }

    pub(crate) fn destroy<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) {
        for buffer in [self.vertex_buffer.take(), self.index_buffer.take()]
            .into_iter()
            .flatten()
        {
            backend.delete_buffer(buffer);
        }
        self.vertices.clear();
        self.queue.clear();
    }

    /// Drops buffer handles that died with the context, plus anything queued.
    pub(crate) fn forget_buffers(&mut self) {
        self.vertex_buffer = None;
        self.index_buffer = None;
        self.vertices.clear();
        self.queue.clear();
    }

    /// Queues one sprite, flushing first when the batch is full.
    ///
    /// Sprites whose texture is invalid or not loaded are skipped.
    pub(crate) fn render<B: GpuBackend>(
        &mut self,
        ctx: &mut RenderContext<'_, B>,
        node: &Node,
        sprite: &Sprite,
    ) -> Result<(), GpuError> {
        let Some(texture) = ctx.textures.texture(sprite.texture) else {
            tracing::trace!(texture = %sprite.texture, "sprite texture was destroyed");
            return Ok(());
        };
        let base_id = texture.base();
        let Some(base) = ctx.textures.base_texture(base_id) else {
            return Ok(());
        };
        let skip = base.skip_render();
        if !skip && (!texture.is_valid() || !base.is_available_on(ctx.context_id())) {
            return Ok(());
        }
        let (w1, h1, w0, h0) =
            texture.quad_extents(sprite.anchor.x, sprite.anchor.y, base.logical_scale());
        let uvs = texture.uvs().corners();

        if self.queue.len() >= self.capacity {
            self.flush(ctx)?;
        }

        let world = &node.world;
        let color = if skip {
            0
        } else {
            node.tint.pack_premultiplied(node.world_alpha)
        };
        let corners = [(w1, h1), (w0, h1), (w0, h0), (w1, h0)];
        for ((x, y), uv) in corners.into_iter().zip(uvs) {
            let position = [
                world.a * x + world.c * y + world.tx,
                world.b * x + world.d * y + world.ty,
            ];
            self.vertices.push(SpriteVertex::new(position, uv, color));
        }
        self.queue.push(QueuedSprite {
            base: base_id,
            skip: skip && node.children().is_empty(),
            blend: node.blend_mode,
            shader: node.shader.clone().unwrap_or_else(passthrough_shader),
        });
        ctx.stats.sprites += 1;
        Ok(())
    }

    /// Uploads queued quads and draws them, one call per run.
    pub(crate) fn flush<B: GpuBackend>(&mut self, ctx: &mut RenderContext<'_, B>) -> Result<(), GpuError> {
        if self.queue.is_empty() {
            return Ok(());
        }
        let (Some(vertex_buffer), Some(index_buffer)) = (self.vertex_buffer, self.index_buffer)
        else {
            self.queue.clear();
            self.vertices.clear();
            return Ok(());
        };
        ctx.backend
            .write_buffer(vertex_buffer, 0, bytemuck::cast_slice(&self.vertices))?;

        let runs = group_runs(&self.queue);
        self.queue.clear();
        self.vertices.clear();
        ctx.stats.flushes += 1;

        for run in runs {
            Self::draw_run(ctx, &run, vertex_buffer, index_buffer)?;
        }
        Ok(())
    }

    fn draw_run<B: GpuBackend>(
        ctx: &mut RenderContext<'_, B>,
        run: &Run,
        vertex_buffer: BufferHandle,
        index_buffer: BufferHandle,
    ) -> Result<(), GpuError> {
        // A run of placeholders draws nothing.
        let Some(base) = run.texture else {
            return Ok(());
        };
        let Some(handle) = ctx.texture_handle(base)? else {
            return Ok(());
        };
        ctx.use_shader(&run.shader)?;
        ctx.apply_default_uniforms();
        ctx.set_blend_mode(run.blend);
        if !ctx.bind_texture(Some(handle))? {
            return Ok(());
        }
        ctx.draw(
            Topology::TriangleList,
            vertex_buffer,
            index_buffer,
            (run.start * 6) as u32,
            (run.len * 6) as u32,
        )
    }
}

/// Splits the queue wherever texture, blend mode or shader changes.
///
/// A placeholder sprite never changes the run's texture; a run that starts
/// with placeholders adopts the first real texture that follows.
fn group_runs(queue: &[QueuedSprite]) -> Vec<Run> {
    let mut runs: Vec<Run> = Vec::new();
    for (index, sprite) in queue.iter().enumerate() {
        let texture = (!sprite.skip).then_some(sprite.base);
        if let Some(run) = runs.last_mut() {
            let texture_swap = texture.is_some() && run.texture.is_some() && run.texture != texture;
            let blend_swap = run.blend != sprite.blend;
            let shader_swap = run.shader.id() != sprite.shader.id();
            if !texture_swap && !blend_swap && !shader_swap {
                if run.texture.is_none() {
                    run.texture = texture;
                }
                run.len += 1;
                continue;
            }
        }
        runs.push(Run {
            texture,
            blend: sprite.blend,
            shader: sprite.shader.clone(),
            start: index,
            len: 1,
        });
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ArenaKey;

    fn sprite(base: u32, blend: BlendMode) -> QueuedSprite {
        QueuedSprite {
            base: BaseTextureId::from_parts(base, 0),
            skip: false,
            blend,
            shader: passthrough_shader(),
        }
    }

    fn sizes(runs: &[Run]) -> Vec<usize> {
        runs.iter().map(|run| run.len).collect()
    }

    #[test]
    fn texture_changes_split_runs() {
        let queue: Vec<_> = [0, 0, 1, 1, 0]
            .into_iter()
            .map(|base| sprite(base, BlendMode::Normal))
            .collect();
        let runs = group_runs(&queue);
        assert_eq!(sizes(&runs), vec![2, 2, 1]);
        assert_eq!(runs[2].start, 4);
    }

    #[test]
    fn blend_and_shader_changes_split_runs() {
        let mut queue = vec![
            sprite(0, BlendMode::Normal),
            sprite(0, BlendMode::Add),
            sprite(0, BlendMode::Add),
        ];
        let mut custom = sprite(0, BlendMode::Add);
        custom.shader = Rc::new(Shader::custom("tinted", ""));
        queue.push(custom);
        assert_eq!(sizes(&group_runs(&queue)), vec![1, 2, 1]);
    }

    #[test]
    fn capacity_is_clamped_to_u16_addressable_quads() {
        assert_eq!(SpriteBatch::new(20_000).capacity(), MAX_BATCH_SIZE);
        assert_eq!(SpriteBatch::new(0).capacity(), 1);
    }

    #[test]
    fn placeholders_do_not_break_runs() {
        let mut placeholder = sprite(9, BlendMode::Normal);
        placeholder.skip = true;
        let queue = vec![
            placeholder.clone(),
            sprite(0, BlendMode::Normal),
            placeholder,
            sprite(0, BlendMode::Normal),
        ];
        let runs = group_runs(&queue);
        assert_eq!(sizes(&runs), vec![4]);
        assert_eq!(runs[0].texture, Some(BaseTextureId::from_parts(0, 0)));
    }

    #[test]
    fn every_sprite_different_is_one_run_each() {
        let queue: Vec<_> = (0..5).map(|base| sprite(base, BlendMode::Normal)).collect();
        assert_eq!(group_runs(&queue).len(), 5);
    }
}
