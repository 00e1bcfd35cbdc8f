//! Offscreen filter rendering.
//!
//! Pushing a filter redirects drawing into a pooled target covering the
//! node's bounds. Popping runs every pass over that capture, alternating
//! between two targets so no pass samples what it writes, and composites the
//! last pass into whatever target was active before the push.

use super::context::{ensure_buffer, RenderContext, Viewport};
use super::mask::MaskManager;
use super::stencil::StencilManager;
use crate::backend::{
    BufferHandle, BufferKind, GpuBackend, RenderTargetHandle, SpriteVertex, TextureHandle,
    Topology,
};
use crate::color::Color;
use crate::error::GpuError;
use crate::filters::{Filter, FilterPass};
use crate::math::Rectangle;
use crate::renderer::BlendMode;

/// An offscreen target handed out by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PooledTarget {
    pub target: RenderTargetHandle,
    pub texture: TextureHandle,
    pub width: u32,
    pub height: u32,
}

/// Reuses offscreen targets across filters and frames.
///
/// Targets are handed out regardless of their current size and resized in
/// place, so a steady stream of similar filters settles on a fixed set.
#[derive(Debug)]
pub struct RenderTargetPool {
    idle: Vec<PooledTarget>,
    allocated: usize,
    limit: usize,
}

impl RenderTargetPool {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            idle: Vec::new(),
            allocated: 0,
            limit,
        }
    }

    /// Targets created and not yet freed, idle or in use.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn idle(&self) -> usize {
        self.idle.len()
    }

    pub(crate) fn acquire<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        width: u32,
        height: u32,
    ) -> Result<PooledTarget, GpuError> {
        if let Some(mut pooled) = self.idle.pop() {
            if (pooled.width, pooled.height) != (width, height) {
                backend.resize_render_target(pooled.target, width, height)?;
                pooled.width = width;
                pooled.height = height;
            }
            return Ok(pooled);
        }
        let target = backend.create_render_target(width, height)?;
        let Some(texture) = backend.render_target_texture(target) else {
            backend.delete_render_target(target);
            return Err(GpuError::UnknownHandle {
                kind: "render target",
                handle: target.0,
            });
        };
        self.allocated += 1;
        tracing::debug!(
            allocated = self.allocated,
            width,
            height,
            "filter target pool grew"
        );
        Ok(PooledTarget {
            target,
            texture,
            width,
            height,
        })
    }

    pub(crate) fn release<B: GpuBackend + ?Sized>(&mut self, backend: &mut B, pooled: PooledTarget) {
        if self.idle.len() >= self.limit {
            backend.delete_render_target(pooled.target);
            self.allocated -= 1;
            return;
        }
        self.idle.push(pooled);
    }

    pub(crate) fn destroy<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) {
        for pooled in self.idle.drain(..) {
            backend.delete_render_target(pooled.target);
        }
        self.allocated = 0;
    }

    /// Forgets every target without freeing; they died with the context.
    pub(crate) fn forget(&mut self) {
        self.idle.clear();
        self.allocated = 0;
    }
}

#[derive(Debug)]
struct FilterFrame {
    capture: PooledTarget,
    area: Rectangle,
    filters: Vec<Filter>,
    below: Viewport,
    stencil: StencilManager,
}

/// The filter stack of one renderer.
#[derive(Debug)]
pub(crate) struct FilterManager {
    pool: RenderTargetPool,
    stack: Vec<FilterFrame>,
    quad_buffer: Option<(BufferHandle, usize)>,
}

impl FilterManager {
    pub(crate) fn new(pool_limit: usize) -> Self {
        Self {
            pool: RenderTargetPool::new(pool_limit),
            stack: Vec::new(),
            quad_buffer: None,
        }
    }

    pub(crate) fn pool(&self) -> &RenderTargetPool {
        &self.pool
    }

    pub(crate) fn depth(&self) -> usize {
        self.stack.len()
    }

    /// The region a filtered node renders into, in world coordinates, or
    /// `None` when there is nothing to filter.
    pub(crate) fn filter_area(bounds: Rectangle, padding: f32, viewport: Rectangle) -> Option<Rectangle> {
        if bounds.is_nan() || bounds.is_empty() {
            return None;
        }
        let area = bounds.pad(padding).round_out().intersection(&viewport);
        if area.is_nan() || area.is_empty() {
            return None;
        }
        Some(area)
    }

    /// Starts capturing into an offscreen target covering `area`.
    pub(crate) fn push<B: GpuBackend>(
        &mut self,
        ctx: &mut RenderContext<'_, B>,
        masks: &mut MaskManager,
        area: Rectangle,
        filters: &[Filter],
    ) -> Result<(), GpuError> {
        let resolution = ctx.state.resolution;
        let size = (
            ((area.width * resolution).round() as u32).max(1),
            ((area.height * resolution).round() as u32).max(1),
        );
        let capture = self.pool.acquire(&mut *ctx.backend, size.0, size.1)?;
        let below = ctx.state.viewport;
        let stencil = masks.enter_target(&mut *ctx.backend);

        ctx.bind_viewport(Viewport::new(
            Some(capture.target),
            Some(capture.texture),
            area,
            size,
        ))?;
        ctx.backend.clear(Some([0.0; 4]), true)?;

        tracing::trace!(?area, depth = self.stack.len() + 1, "filter pushed");
        self.stack.push(FilterFrame {
            capture,
            area,
            filters: filters.to_vec(),
            below,
            stencil,
        });
        Ok(())
    }

    /// Runs the top frame's passes and composites the result below it.
    pub(crate) fn pop<B: GpuBackend>(
        &mut self,
        ctx: &mut RenderContext<'_, B>,
        masks: &mut MaskManager,
        quad_indices: BufferHandle,
    ) -> Result<(), GpuError> {
        let Some(frame) = self.stack.pop() else {
            debug_assert!(false, "filter pop without a matching push");
            return Ok(());
        };
        let FilterFrame {
            capture,
            area,
            filters,
            below,
            stencil,
        } = frame;
        let passes: Vec<&FilterPass> = filters.iter().flat_map(|f| f.passes()).collect();

        let spare = if passes.len() > 1 {
            match self.pool.acquire(&mut *ctx.backend, capture.width, capture.height) {
                Ok(target) => Some(target),
                Err(error) => {
                    ctx.bind_viewport(below).ok();
                    masks.leave_target(&mut *ctx.backend, stencil);
                    self.pool.release(&mut *ctx.backend, capture);
                    return Err(error);
                }
            }
        } else {
            None
        };

        let intermediate = self.run_intermediate(ctx, &passes, area, capture, spare, quad_indices);
        let rebound = ctx.bind_viewport(below);
        masks.leave_target(&mut *ctx.backend, stencil);
        let result = intermediate.and_then(|(input, quad)| {
            rebound?;
            let Some(last) = passes.last() else {
                return Ok(());
            };
            ctx.set_blend_mode(BlendMode::Normal);
            self.run_pass(ctx, last, input, quad, quad_indices)
        });

        if let Some(spare) = spare {
            self.pool.release(&mut *ctx.backend, spare);
        }
        self.pool.release(&mut *ctx.backend, capture);
        result?;
        ctx.stats.filters_applied += filters.len() as u32;
        Ok(())
    }

    /// Runs every pass but the last, alternating between `capture` and
    /// `spare`. Returns the target holding the result and the quad buffer.
    fn run_intermediate<B: GpuBackend>(
        &mut self,
        ctx: &mut RenderContext<'_, B>,
        passes: &[&FilterPass],
        area: Rectangle,
        capture: PooledTarget,
        spare: Option<PooledTarget>,
        quad_indices: BufferHandle,
    ) -> Result<(PooledTarget, BufferHandle), GpuError> {
        let quad = self.upload_quad(ctx, area)?;
        let mut input = capture;
        let Some(mut output) = spare else {
            return Ok((input, quad));
        };
        ctx.set_blend(None);
        for pass in passes.iter().take(passes.len().saturating_sub(1)) {
            ctx.bind_viewport(Viewport::new(
                Some(output.target),
                Some(output.texture),
                area,
                (output.width, output.height),
            ))?;
            ctx.backend.clear(Some([0.0; 4]), false)?;
            self.run_pass(ctx, pass, input, quad, quad_indices)?;
            std::mem::swap(&mut input, &mut output);
        }
        Ok((input, quad))
    }

    fn run_pass<B: GpuBackend>(
        &self,
        ctx: &mut RenderContext<'_, B>,
        pass: &FilterPass,
        input: PooledTarget,
        quad: BufferHandle,
        quad_indices: BufferHandle,
    ) -> Result<(), GpuError> {
        ctx.use_shader(pass.shader())?;
        let (w, h) = (input.width as f32, input.height as f32);
        ctx.apply_uniforms([w, h, 1.0 / w, 1.0 / h], pass.params_array());
        if !ctx.bind_texture(Some(input.texture))? {
            return Ok(());
        }
        ctx.draw(Topology::TriangleList, quad, quad_indices, 0, 6)
    }

    fn upload_quad<B: GpuBackend>(
        &mut self,
        ctx: &mut RenderContext<'_, B>,
        area: Rectangle,
    ) -> Result<BufferHandle, GpuError> {
        let white = Color::WHITE.pack_premultiplied(1.0);
        let quad = [
            SpriteVertex::new([area.x, area.y], [0.0, 0.0], white),
            SpriteVertex::new([area.right(), area.y], [1.0, 0.0], white),
            SpriteVertex::new([area.right(), area.bottom()], [1.0, 1.0], white),
            SpriteVertex::new([area.x, area.bottom()], [0.0, 1.0], white),
        ];
        let bytes: &[u8] = bytemuck::cast_slice(&quad);
        let buffer = ensure_buffer(
            &mut *ctx.backend,
            &mut self.quad_buffer,
            BufferKind::Vertex,
            bytes.len(),
        )?;
        ctx.backend.write_buffer(buffer, 0, bytes)?;
        Ok(buffer)
    }

    /// Returns targets still on the stack after an aborted frame.
    pub(crate) fn recover<B: GpuBackend + ?Sized>(&mut self, backend: &mut B, masks: &mut MaskManager) {
        while let Some(frame) = self.stack.pop() {
            tracing::warn!("discarding filter left open by an aborted frame");
            masks.stencil = frame.stencil;
            self.pool.release(backend, frame.capture);
        }
    }

    pub(crate) fn destroy<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) {
        for frame in self.stack.drain(..) {
            backend.delete_render_target(frame.capture.target);
        }
        self.pool.destroy(backend);
        if let Some((buffer, _)) = self.quad_buffer.take() {
            backend.delete_buffer(buffer);
        }
    }

    pub(crate) fn forget(&mut self) {
        self.stack.clear();
        self.pool.forget();
        self.quad_buffer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;

    #[test]
    fn pool_reuses_and_resizes_in_place() {
        let mut backend = SoftwareBackend::new(16, 16);
        let mut pool = RenderTargetPool::new(4);
        let first = pool.acquire(&mut backend, 8, 8).unwrap();
        pool.release(&mut backend, first);
        let second = pool.acquire(&mut backend, 4, 6).unwrap();

        assert_eq!(second.target, first.target);
        assert_eq!((second.width, second.height), (4, 6));
        assert_eq!(pool.allocated(), 1);
        assert_eq!(backend.stats().render_targets_created, 1);
    }

    #[test]
    fn pool_frees_beyond_its_limit() {
        let mut backend = SoftwareBackend::new(16, 16);
        let mut pool = RenderTargetPool::new(1);
        let a = pool.acquire(&mut backend, 2, 2).unwrap();
        let b = pool.acquire(&mut backend, 2, 2).unwrap();
        pool.release(&mut backend, a);
        pool.release(&mut backend, b);
        assert_eq!(pool.allocated(), 1);
        assert_eq!(pool.idle(), 1);
        assert_eq!(backend.live_render_targets(), 1);
    }

    #[test]
    fn area_is_padded_rounded_and_clamped() {
        let viewport = Rectangle::new(0.0, 0.0, 100.0, 100.0);
        let area = FilterManager::filter_area(Rectangle::new(10.2, 90.0, 5.5, 20.0), 2.0, viewport);
        assert_eq!(area, Some(Rectangle::new(8.0, 88.0, 10.0, 12.0)));
    }

    #[test]
    fn degenerate_areas_skip_filtering() {
        let viewport = Rectangle::new(0.0, 0.0, 100.0, 100.0);
        assert_eq!(FilterManager::filter_area(Rectangle::EMPTY, 4.0, viewport), None);
        let nan = Rectangle::new(f32::NAN, 0.0, 1.0, 1.0);
        assert_eq!(FilterManager::filter_area(nan, 0.0, viewport), None);
        let offscreen = Rectangle::new(200.0, 200.0, 10.0, 10.0);
        assert_eq!(FilterManager::filter_area(offscreen, 0.0, viewport), None);
    }
}
