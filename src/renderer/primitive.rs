use super::context::{ensure_buffer, RenderContext};
use crate::backend::{BufferHandle, BufferKind, GpuBackend, SpriteVertex, Topology};
use crate::cache::TessellationCache;
use crate::color::Color;
use crate::error::GpuError;
use crate::filters::passthrough_shader;
use crate::math::Point;
use crate::scene::{Graphics, MaskGeometry, Node, Strip};
use lyon::tessellation::FillTessellator;
use std::num::NonZeroUsize;

const TESSELLATION_CACHE_SIZE: usize = 256;
const VERTEX_SIZE: usize = std::mem::size_of::<SpriteVertex>();

/// Index ranges of one uploaded mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MaskDraw {
    /// Fan triangles of every polygon, as a list.
    pub fan: (u32, u32),
    /// Two triangles covering the mask bounds.
    pub quad: (u32, u32),
}

/// Draws everything that is not a batched sprite: `Graphics` fills, strips
/// and mask stencil geometry. Each draw uploads its own vertices.
pub(crate) struct PrimitiveRenderer {
    vertex_buffer: Option<(BufferHandle, usize)>,
    index_buffer: Option<(BufferHandle, usize)>,
    cache: TessellationCache,
    tessellator: FillTessellator,
    vertices: Vec<SpriteVertex>,
    indices: Vec<u16>,
}

impl std::fmt::Debug for PrimitiveRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimitiveRenderer")
            .field("vertex_buffer", &self.vertex_buffer)
            .field("index_buffer", &self.index_buffer)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl PrimitiveRenderer {
    pub(crate) fn new() -> Self {
        Self {
            vertex_buffer: None,
            index_buffer: None,
            cache: TessellationCache::new(
                NonZeroUsize::new(TESSELLATION_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            ),
            tessellator: FillTessellator::new(),
            vertices: Vec::new(),
            indices: Vec::new(),
        }
    }

    pub(crate) fn draw_graphics<B: GpuBackend>(
        &mut self,
        ctx: &mut RenderContext<'_, B>,
        node: &Node,
        graphics: &Graphics,
    ) -> Result<(), GpuError> {
        if graphics.is_empty() {
            return Ok(());
        }
        let key = graphics.geometry_key();
        if self.cache.get(key).is_none() {
            match graphics.tessellate(&mut self.tessellator) {
                Ok(buffers) => self.cache.insert(key, buffers),
                Err(error) => {
                    tracing::warn!(?error, "graphics tessellation failed; not drawing it");
                    return Ok(());
                }
            }
        }
        let Some(tessellation) = self.cache.get(key) else {
            return Ok(());
        };

        let colors: Vec<u32> = graphics
            .fills()
            .iter()
            .map(|fill| tinted(fill.color, node.tint).pack_premultiplied(fill.alpha * node.world_alpha))
            .collect();
        self.vertices.clear();
        self.vertices
            .extend(tessellation.vertices.iter().map(|vertex| {
                let position = node.world.apply(vertex.position);
                let color = colors.get(vertex.fill_index as usize).copied().unwrap_or(0);
                SpriteVertex::new([position.x, position.y], [0.0, 0.0], color)
            }));
        self.indices.clear();
        self.indices.extend_from_slice(&tessellation.indices);

        ctx.use_shader(&passthrough_shader())?;
        ctx.apply_default_uniforms();
        ctx.set_blend_mode(node.blend_mode);
        ctx.bind_texture(None)?;
        let (vertices, indices) = self.upload(ctx)?;
        ctx.draw(
            Topology::TriangleList,
            vertices,
            indices,
            0,
            self.indices.len() as u32,
        )
    }

    pub(crate) fn draw_strip<B: GpuBackend>(
        &mut self,
        ctx: &mut RenderContext<'_, B>,
        node: &Node,
        strip: &Strip,
    ) -> Result<(), GpuError> {
        if strip.vertices.len() < 3 || strip.vertices.len() > u16::MAX as usize {
            return Ok(());
        }
        if strip.uvs.len() != strip.vertices.len() {
            tracing::warn!(
                vertices = strip.vertices.len(),
                uvs = strip.uvs.len(),
                "strip has mismatched uvs; not drawing it"
            );
            return Ok(());
        }
        let Some(texture) = ctx.textures.texture(strip.texture) else {
            return Ok(());
        };
        if !texture.is_valid() {
            return Ok(());
        }
        let base = texture.base();
        let uvs = texture.uvs();
        let Some(handle) = ctx.texture_handle(base)? else {
            return Ok(());
        };

        let color = node.tint.pack_premultiplied(node.world_alpha);
        self.vertices.clear();
        self.vertices
            .extend(strip.vertices.iter().zip(&strip.uvs).map(|(point, [u, v])| {
                let position = node.world.apply(*point);
                let uv = [
                    uvs.x0 + u * (uvs.x1 - uvs.x0),
                    uvs.y0 + v * (uvs.y3 - uvs.y0),
                ];
                SpriteVertex::new([position.x, position.y], uv, color)
            }));
        self.indices.clear();
        self.indices.extend(0..strip.vertices.len() as u16);

        let shader = node.shader.clone().unwrap_or_else(passthrough_shader);
        ctx.use_shader(&shader)?;
        ctx.apply_default_uniforms();
        ctx.set_blend_mode(node.blend_mode);
        if !ctx.bind_texture(Some(handle))? {
            return Ok(());
        }
        let (vertices, indices) = self.upload(ctx)?;
        ctx.draw(
            Topology::TriangleStrip,
            vertices,
            indices,
            0,
            self.indices.len() as u32,
        )
    }

    /// Uploads a mask's fan triangles and bounding quad, binding the plain
    /// untextured program they are stamped with.
    pub(crate) fn upload_mask<B: GpuBackend>(
        &mut self,
        ctx: &mut RenderContext<'_, B>,
        geometry: &MaskGeometry,
    ) -> Result<MaskDraw, GpuError> {
        self.vertices.clear();
        self.indices.clear();
        let white = Color::WHITE.pack_premultiplied(1.0);
        let push = |vertices: &mut Vec<SpriteVertex>, point: Point| {
            vertices.push(SpriteVertex::new([point.x, point.y], [0.0, 0.0], white));
            (vertices.len() - 1) as u16
        };

        for polygon in &geometry.polygons {
            let first = push(&mut self.vertices, polygon[0]);
            let mut previous = push(&mut self.vertices, polygon[1]);
            for point in &polygon[2..] {
                let current = push(&mut self.vertices, *point);
                self.indices.extend_from_slice(&[first, previous, current]);
                previous = current;
            }
        }
        let fan = (0, self.indices.len() as u32);

        let bounds = geometry.bounds;
        let corners = [
            Point::new(bounds.x, bounds.y),
            Point::new(bounds.right(), bounds.y),
            Point::new(bounds.right(), bounds.bottom()),
            Point::new(bounds.x, bounds.bottom()),
        ];
        let [a, b, c, d] = corners.map(|corner| push(&mut self.vertices, corner));
        self.indices.extend_from_slice(&[a, b, c, a, c, d]);
        let quad = (fan.1, 6);

        ctx.use_shader(&passthrough_shader())?;
        ctx.apply_default_uniforms();
        ctx.bind_texture(None)?;
        self.upload(ctx)?;
        Ok(MaskDraw { fan, quad })
    }

    /// Draws a range of the mask uploaded last.
    pub(crate) fn draw_mask_range<B: GpuBackend>(
        &self,
        ctx: &mut RenderContext<'_, B>,
        (first, count): (u32, u32),
    ) -> Result<(), GpuError> {
        let (Some((vertices, _)), Some((indices, _))) = (self.vertex_buffer, self.index_buffer)
        else {
            return Ok(());
        };
        ctx.draw(Topology::TriangleList, vertices, indices, first, count)
    }

    fn upload<B: GpuBackend>(
        &mut self,
        ctx: &mut RenderContext<'_, B>,
    ) -> Result<(BufferHandle, BufferHandle), GpuError> {
        let vertex_bytes: &[u8] = bytemuck::cast_slice(&self.vertices);
        let vertices = ensure_buffer(
            &mut *ctx.backend,
            &mut self.vertex_buffer,
            BufferKind::Vertex,
            self.vertices.len() * VERTEX_SIZE,
        )?;
        ctx.backend.write_buffer(vertices, 0, vertex_bytes)?;

        let indices = ensure_buffer(
            &mut *ctx.backend,
            &mut self.index_buffer,
            BufferKind::Index,
            self.indices.len() * 2,
        )?;
        ctx.backend
            .write_buffer(indices, 0, bytemuck::cast_slice(&self.indices))?;
        Ok((vertices, indices))
    }

    /// Frees this renderer's buffers.
    pub(crate) fn destroy<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) {
        for (buffer, _) in [self.vertex_buffer.take(), self.index_buffer.take()]
            .into_iter()
            .flatten()
        {
            backend.delete_buffer(buffer);
        }
    }

    /// Drops buffer handles that died with the context.
    pub(crate) fn forget_buffers(&mut self) {
        self.vertex_buffer = None;
        self.index_buffer = None;
    }
}

/// Multiplies a fill colour by a node tint, channel by channel.
fn tinted(color: Color, tint: Color) -> Color {
    let [r, g, b, a] = color.0;
    let [tr, tg, tb, _] = tint.0;
    let scale = |c: u8, t: u8| ((c as u16 * t as u16 + 127) / 255) as u8;
    Color([scale(r, tr), scale(g, tg), scale(b, tb), a])
}
