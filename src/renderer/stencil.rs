//! Nested stencil clipping.
//!
//! Every active mask owns one stencil "level". Pixels inside all active masks
//! hold the value of the innermost level; everything else fails the
//! comparison. Convex masks step the value directly. Concave or multi-shape
//! masks first invert the stencil under their fan triangles (odd coverage
//! ends up inverted), then step the inverted pixels over their bounds, which
//! leaves values counting down from `0xFF` instead of up from zero. The
//! `reverse` flag tracks which direction the current level counts in.

use super::context::RenderContext;
use super::primitive::{MaskDraw, PrimitiveRenderer};
use crate::backend::{CompareFunction, GpuBackend, StencilOp};
use crate::error::GpuError;
use crate::id::NodeId;
use crate::scene::MaskGeometry;
use smallvec::SmallVec;

#[derive(Debug, Clone)]
struct StencilEntry {
    mask: NodeId,
    geometry: MaskGeometry,
}

/// The stencil stack of one render target.
#[derive(Debug, Clone)]
pub(crate) struct StencilManager {
    stack: SmallVec<[StencilEntry; 4]>,
    reverse: bool,
    count: u8,
    /// Comparison applied after the last push or pop, so it can be restored.
    func: (CompareFunction, u8),
}

impl Default for StencilManager {
    fn default() -> Self {
        Self {
            stack: SmallVec::new(),
            reverse: true,
            count: 0,
            func: (CompareFunction::Always, 0),
        }
    }
}

impl StencilManager {
    #[cfg(test)]
    pub(crate) fn depth(&self) -> usize {
        self.stack.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    fn set_func<B: GpuBackend>(&mut self, backend: &mut B, func: CompareFunction, reference: u8) {
        backend.stencil_func(func, reference, 0xFF);
        self.func = (func, reference);
    }

    pub(crate) fn push<B: GpuBackend>(
        &mut self,
        ctx: &mut RenderContext<'_, B>,
        primitives: &mut PrimitiveRenderer,
        mask: NodeId,
        geometry: MaskGeometry,
    ) -> Result<bool, GpuError> {
        if self.count == u8::MAX {
            tracing::warn!(%mask, "stencil depth exhausted; mask ignored");
            return Ok(false);
        }
        if self.stack.is_empty() {
            ctx.backend.set_stencil_test(true);
            ctx.backend.clear(None, true)?;
            self.reverse = true;
            self.count = 0;
        }
        let level = self.count;
        let draw = primitives.upload_mask(ctx, &geometry)?;
        ctx.backend.set_color_mask(false);

        if geometry.convex {
            self.stamp_convex(ctx, primitives, draw, level)?;
        } else {
            self.stamp_concave(ctx, primitives, draw, level)?;
        }

        ctx.backend.set_color_mask(true);
        ctx.backend.stencil_op(StencilOp::Keep, StencilOp::Keep);
        self.count += 1;
        self.stack.push(StencilEntry { mask, geometry });
        Ok(true)
    }

    fn stamp_convex<B: GpuBackend>(
        &mut self,
        ctx: &mut RenderContext<'_, B>,
        primitives: &PrimitiveRenderer,
        draw: MaskDraw,
        level: u8,
    ) -> Result<(), GpuError> {
        if !self.reverse {
            self.set_func(ctx.backend, CompareFunction::Equal, 0xFF - level);
            ctx.backend
                .stencil_op(StencilOp::Keep, StencilOp::DecrementClamp);
        } else {
            self.set_func(ctx.backend, CompareFunction::Equal, level);
            ctx.backend
                .stencil_op(StencilOp::Keep, StencilOp::IncrementClamp);
        }
        primitives.draw_mask_range(ctx, draw.fan)?;

        let next = level + 1;
        let reference = if !self.reverse { 0xFF - next } else { next };
        self.set_func(ctx.backend, CompareFunction::Equal, reference);
        Ok(())
    }

    fn stamp_concave<B: GpuBackend>(
        &mut self,
        ctx: &mut RenderContext<'_, B>,
        primitives: &PrimitiveRenderer,
        draw: MaskDraw,
        level: u8,
    ) -> Result<(), GpuError> {
        self.set_func(ctx.backend, CompareFunction::Always, 0);
        ctx.backend.stencil_op(StencilOp::Keep, StencilOp::Invert);
        primitives.draw_mask_range(ctx, draw.fan)?;

        if self.reverse {
            self.set_func(ctx.backend, CompareFunction::Equal, 0xFF - level);
            ctx.backend
                .stencil_op(StencilOp::Keep, StencilOp::DecrementClamp);
        } else {
            self.set_func(ctx.backend, CompareFunction::Equal, level);
            ctx.backend
                .stencil_op(StencilOp::Keep, StencilOp::IncrementClamp);
        }
        primitives.draw_mask_range(ctx, draw.quad)?;

        let next = level + 1;
        let reference = if self.reverse { 0xFF - next } else { next };
        self.set_func(ctx.backend, CompareFunction::Equal, reference);
        self.reverse = !self.reverse;
        Ok(())
    }

    /// Undoes the matching [`push`](Self::push) (one that returned `true`), leaving the stencil values as
    /// they were before it. Disables the test once the stack is empty.
    pub(crate) fn pop<B: GpuBackend>(
        &mut self,
        ctx: &mut RenderContext<'_, B>,
        primitives: &mut PrimitiveRenderer,
        mask: NodeId,
    ) -> Result<(), GpuError> {
        let Some(entry) = self.stack.pop() else {
            debug_assert!(false, "stencil pop without a matching push");
            return Ok(());
        };
        debug_assert_eq!(entry.mask, mask, "masks must be popped in reverse push order");
        self.count -= 1;
        let level = self.count;

        let draw = primitives.upload_mask(ctx, &entry.geometry)?;
        ctx.backend.set_color_mask(false);

        if entry.geometry.convex {
            if !self.reverse {
                self.set_func(ctx.backend, CompareFunction::Equal, 0xFF - (level + 1));
                ctx.backend
                    .stencil_op(StencilOp::Keep, StencilOp::IncrementClamp);
            } else {
                self.set_func(ctx.backend, CompareFunction::Equal, level + 1);
                ctx.backend
                    .stencil_op(StencilOp::Keep, StencilOp::DecrementClamp);
            }
            primitives.draw_mask_range(ctx, draw.fan)?;
        } else {
            self.reverse = !self.reverse;
            if self.reverse {
                self.set_func(ctx.backend, CompareFunction::Equal, 0xFF - (level + 1));
                ctx.backend
                    .stencil_op(StencilOp::Keep, StencilOp::IncrementClamp);
            } else {
                self.set_func(ctx.backend, CompareFunction::Equal, level + 1);
                ctx.backend
                    .stencil_op(StencilOp::Keep, StencilOp::DecrementClamp);
            }
            primitives.draw_mask_range(ctx, draw.quad)?;

            self.set_func(ctx.backend, CompareFunction::Always, 0);
            ctx.backend.stencil_op(StencilOp::Keep, StencilOp::Invert);
            primitives.draw_mask_range(ctx, draw.fan)?;
        }

        let reference = if !self.reverse { 0xFF - level } else { level };
        self.set_func(ctx.backend, CompareFunction::Equal, reference);
        ctx.backend.set_color_mask(true);
        ctx.backend.stencil_op(StencilOp::Keep, StencilOp::Keep);

        if self.stack.is_empty() {
            ctx.backend.set_stencil_test(false);
        }
        Ok(())
    }

    /// Re-applies this stack's test after another stack used the backend.
    pub(crate) fn reapply<B: GpuBackend>(&self, backend: &mut B) {
        if self.stack.is_empty() {
            backend.set_stencil_test(false);
            return;
        }
        backend.set_stencil_test(true);
        backend.stencil_func(self.func.0, self.func.1, 0xFF);
        backend.stencil_op(StencilOp::Keep, StencilOp::Keep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;
    use crate::math::{Matrix, Point};
    use crate::renderer::context::Viewport;
    use crate::renderer::shaders::ShaderRegistry;
    use crate::scene::Graphics;
    use crate::texture::TextureRegistry;
    use crate::{Color, Rectangle};

    const SIZE: u32 = 8;

    struct Harness {
        backend: SoftwareBackend,
        textures: TextureRegistry,
        shaders: ShaderRegistry,
        primitives: PrimitiveRenderer,
    }

    impl Harness {
        fn new() -> Self {
            let backend = SoftwareBackend::new(SIZE, SIZE);
            let shaders = ShaderRegistry::new(backend.context_id());
            Self {
                backend,
                textures: TextureRegistry::default(),
                shaders,
                primitives: PrimitiveRenderer::new(),
            }
        }

        fn run(&mut self, f: impl FnOnce(&mut RenderContext<'_, SoftwareBackend>, &mut PrimitiveRenderer)) {
            let area = Rectangle::new(0.0, 0.0, SIZE as f32, SIZE as f32);
            let mut ctx = RenderContext::new(
                &mut self.backend,
                &mut self.textures,
                &mut self.shaders,
                Viewport::new(None, None, area, (SIZE, SIZE)),
                1.0,
            );
            ctx.bind_viewport(ctx.state.viewport).unwrap();
            f(&mut ctx, &mut self.primitives);
        }
    }

    fn rect_mask(x: f32, y: f32, w: f32, h: f32) -> MaskGeometry {
        let mut graphics = Graphics::new();
        graphics.fill_rect(Rectangle::new(x, y, w, h), Color::WHITE);
        graphics.mask_geometry(&Matrix::IDENTITY)
    }

    fn l_shape(x: f32, y: f32, size: f32) -> MaskGeometry {
        let half = size / 2.0;
        let mut graphics = Graphics::new();
        graphics.fill_polygon(
            vec![
                Point::new(x, y),
                Point::new(x + half, y),
                Point::new(x + half, y + half),
                Point::new(x + size, y + half),
                Point::new(x + size, y + size),
                Point::new(x, y + size),
            ],
            Color::WHITE,
        );
        let geometry = graphics.mask_geometry(&Matrix::IDENTITY);
        assert!(!geometry.convex);
        geometry
    }

    fn id(index: u32) -> NodeId {
        use crate::id::ArenaKey;
        NodeId::from_parts(index, 0)
    }

    #[test]
    fn nested_push_pop_round_trips_to_a_clear_stencil() {
        let mut harness = Harness::new();
        let mut stencil = StencilManager::default();
        harness.run(|ctx, primitives| {
            stencil
                .push(ctx, primitives, id(1), rect_mask(0.0, 0.0, 6.0, 6.0))
                .unwrap();
            stencil
                .push(ctx, primitives, id(2), rect_mask(2.0, 2.0, 6.0, 6.0))
                .unwrap();
            assert_eq!(stencil.depth(), 2);
            stencil.pop(ctx, primitives, id(2)).unwrap();
            stencil.pop(ctx, primitives, id(1)).unwrap();
        });
        assert!(!harness.backend.stencil_test_enabled());
        assert!(harness.backend.stencil_snapshot().iter().all(|v| *v == 0));
    }

    #[test]
    fn mixed_convexity_round_trips() {
        let orders: [[bool; 3]; 4] = [
            [true, false, true],
            [false, true, false],
            [false, false, true],
            [true, true, false],
        ];
        for convexity in orders {
            let mut harness = Harness::new();
            let mut stencil = StencilManager::default();
            harness.run(|ctx, primitives| {
                for (index, convex) in convexity.iter().enumerate() {
                    let geometry = if *convex {
                        rect_mask(index as f32, index as f32, 6.0, 6.0)
                    } else {
                        l_shape(index as f32, 0.0, 7.0)
                    };
                    stencil
                        .push(ctx, primitives, id(index as u32), geometry)
                        .unwrap();
                }
                for index in (0..convexity.len()).rev() {
                    stencil.pop(ctx, primitives, id(index as u32)).unwrap();
                }
            });
            assert!(
                harness.backend.stencil_snapshot().iter().all(|v| *v == 0),
                "stencil not restored for {convexity:?}"
            );
        }
    }

    #[test]
    fn reapply_restores_the_innermost_comparison() {
        let mut harness = Harness::new();
        let mut stencil = StencilManager::default();
        harness.run(|ctx, primitives| {
            stencil
                .push(ctx, primitives, id(1), rect_mask(0.0, 0.0, 4.0, 4.0))
                .unwrap();
        });
        harness.backend.clear_calls();
        stencil.reapply(&mut harness.backend);
        assert!(harness.backend.stencil_test_enabled());
        assert!(harness.backend.calls().contains(&crate::backend::BackendCall::StencilFunc {
            func: CompareFunction::Equal,
            reference: 1,
            mask: 0xFF,
        }));
    }
}
