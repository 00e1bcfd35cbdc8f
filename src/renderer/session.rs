use super::batch::SpriteBatch;
use super::context::RenderContext;
use super::filter::FilterManager;
use super::mask::MaskManager;
use super::primitive::PrimitiveRenderer;
use crate::backend::GpuBackend;
use crate::config::ResourcePolicy;
use crate::error::{GpuError, RenderError, SceneError, TextureError};
use crate::id::{NodeId, TextureId};
use crate::math::Rectangle;
use crate::scene::{Node, NodeKind, Scene};

/// One traversal of a scene into the currently bound target.
///
/// Paint order is depth first: a node draws itself, then its children in
/// order. Masks and filters wrap the node and everything under it.
pub(crate) struct RenderSession<'a, B: GpuBackend> {
    pub(crate) ctx: RenderContext<'a, B>,
    scene: &'a Scene,
    batch: &'a mut SpriteBatch,
    primitives: &'a mut PrimitiveRenderer,
    masks: &'a mut MaskManager,
    filters: &'a mut FilterManager,
    /// Filter areas never extend past this, in world coordinates.
    bounds: Rectangle,
    policy: ResourcePolicy,
}

impl<'a, B: GpuBackend> RenderSession<'a, B> {
    pub(crate) fn new(
        ctx: RenderContext<'a, B>,
        scene: &'a Scene,
        batch: &'a mut SpriteBatch,
        primitives: &'a mut PrimitiveRenderer,
        masks: &'a mut MaskManager,
        filters: &'a mut FilterManager,
        policy: ResourcePolicy,
    ) -> Self {
        let bounds = ctx.state.viewport.area;
        Self {
            ctx,
            scene,
            batch,
            primitives,
            masks,
            filters,
            bounds,
            policy,
        }
    }

    pub(crate) fn render_root(&mut self, root: NodeId) -> Result<(), RenderError> {
        if !self.scene.contains(root) {
            return Err(SceneError::StaleNode(root).into());
        }
        self.render_node(root)?;
        self.batch.flush(&mut self.ctx)?;
        debug_assert_eq!(self.filters.depth(), 0, "unbalanced filter stack");
        debug_assert!(self.masks.stencil.is_empty(), "unbalanced mask stack");
        Ok(())
    }

    fn render_node(&mut self, id: NodeId) -> Result<(), RenderError> {
        let scene = self.scene;
        let Some(node) = scene.node(id) else {
            return Ok(());
        };
        if !node.visible || !(node.world_alpha > 0.0) || node.is_mask() {
            return Ok(());
        }

        let filtered = if node.filters.is_empty() {
            false
        } else {
            let bounds = match node.filter_area {
                Some(area) => area,
                None => scene.bounds(id, self.ctx.textures)?,
            };
            let padding = node.filters[0].padding();
            let Some(area) = FilterManager::filter_area(bounds, padding, self.bounds) else {
                tracing::trace!(node = %id, ?bounds, "nothing to filter; subtree skipped");
                return Ok(());
            };
            self.batch.flush(&mut self.ctx)?;
            self.filters
                .push(&mut self.ctx, self.masks, area, &node.filters)?;
            true
        };

        let mut masked = None;
        if let Some(mask) = node.mask {
            self.batch.flush(&mut self.ctx)?;
            if self
                .masks
                .push_mask(&mut self.ctx, self.primitives, scene, mask)?
            {
                masked = Some(mask);
            }
        }

        if node.renderable {
            self.render_own(node)?;
        }
        for child in &node.children {
            self.render_node(*child)?;
        }

        if let Some(mask) = masked {
            self.batch.flush(&mut self.ctx)?;
            self.masks.pop_mask(&mut self.ctx, self.primitives, mask)?;
        }
        if filtered {
            self.batch.flush(&mut self.ctx)?;
            let quad_indices = self.batch.index_buffer().ok_or(GpuError::UnknownHandle {
                kind: "buffer",
                handle: 0,
            })?;
            self.filters.pop(&mut self.ctx, self.masks, quad_indices)?;
        }
        Ok(())
    }

    fn render_own(&mut self, node: &Node) -> Result<(), RenderError> {
        match &node.kind {
            NodeKind::Container => {}
            NodeKind::Sprite(sprite) => {
                if self.texture_exists(sprite.texture)? {
                    self.batch.render(&mut self.ctx, node, sprite)?;
                }
            }
            NodeKind::Graphics(graphics) => {
                self.batch.flush(&mut self.ctx)?;
                self.primitives
                    .draw_graphics(&mut self.ctx, node, graphics)?;
            }
            NodeKind::Strip(strip) => {
                if !self.texture_exists(strip.texture)? {
                    return Ok(());
                }
                self.batch.flush(&mut self.ctx)?;
                self.primitives.draw_strip(&mut self.ctx, node, strip)?;
            }
        }
        Ok(())
    }

    /// A destroyed texture is an error under the strict policy and skipped otherwise.
    fn texture_exists(&self, texture: TextureId) -> Result<bool, RenderError> {
        if self.ctx.textures.texture(texture).is_some() {
            return Ok(true);
        }
        match self.policy {
            ResourcePolicy::Strict => Err(TextureError::StaleTexture(texture).into()),
            ResourcePolicy::Lenient => {
                tracing::warn!(%texture, "skipping node whose texture was destroyed");
                Ok(false)
            }
        }
    }
}
