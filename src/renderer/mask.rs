use super::context::RenderContext;
use super::primitive::PrimitiveRenderer;
use super::stencil::StencilManager;
use crate::backend::GpuBackend;
use crate::error::GpuError;
use crate::id::NodeId;
use crate::scene::{NodeKind, Scene};

/// Turns mask nodes into stencil pushes for the active render target.
#[derive(Debug, Default)]
pub(crate) struct MaskManager {
    pub(crate) stencil: StencilManager,
}

impl MaskManager {
    /// Pushes `mask`'s shape. Returns false when there is nothing to clip
    /// with or the stencil has no levels left, in which case the matching
    /// pop must be skipped.
    pub(crate) fn push_mask<B: GpuBackend>(
        &mut self,
        ctx: &mut RenderContext<'_, B>,
        primitives: &mut PrimitiveRenderer,
        scene: &Scene,
        mask: NodeId,
    ) -> Result<bool, GpuError> {
        let Some(node) = scene.node(mask) else {
            tracing::warn!(%mask, "mask node no longer exists; rendering unmasked");
            return Ok(false);
        };
        let NodeKind::Graphics(graphics) = &node.kind else {
            return Ok(false);
        };
        let geometry = graphics.mask_geometry(&node.world);
        if geometry.is_empty() {
            tracing::trace!(%mask, "empty mask skipped");
            return Ok(false);
        }
        if !self.stencil.push(ctx, primitives, mask, geometry)? {
            return Ok(false);
        }
        ctx.stats.masks_pushed += 1;
        Ok(true)
    }

    pub(crate) fn pop_mask<B: GpuBackend>(
        &mut self,
        ctx: &mut RenderContext<'_, B>,
        primitives: &mut PrimitiveRenderer,
        mask: NodeId,
    ) -> Result<(), GpuError> {
        self.stencil.pop(ctx, primitives, mask)
    }

    /// Swaps in a fresh stencil stack for a new render target.
    pub(crate) fn enter_target<B: GpuBackend>(&mut self, backend: &mut B) -> StencilManager {
        backend.set_stencil_test(false);
        std::mem::take(&mut self.stencil)
    }

    /// Restores the stack saved by [`enter_target`](Self::enter_target).
    pub(crate) fn leave_target<B: GpuBackend>(&mut self, backend: &mut B, saved: StencilManager) {
        debug_assert!(
            self.stencil.is_empty(),
            "masks pushed inside a filter must be popped before it"
        );
        self.stencil = saved;
        self.stencil.reapply(backend);
    }
}
