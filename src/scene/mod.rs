//! The retained scene graph: node storage, hierarchy edits, transforms and bounds.

mod graphics;
mod node;
mod transform;

pub use graphics::{is_convex, Graphics, GraphicsFill, Shape};
pub(crate) use graphics::{MaskGeometry, TessellatedVertex};
pub use node::{Node, NodeKind, Renderable, Sprite, Strip};
pub use transform::{Transform, Transformable};

use crate::arena::Arena;
use crate::error::SceneError;
use crate::filters::Filter;
use crate::id::{NodeId, TextureId};
use crate::math::{Matrix, Point, Rectangle};
use crate::texture::TextureRegistry;

/// Owns every node. Nodes refer to each other by [`NodeId`].
///
/// ```
/// use tableau::{Scene, Transformable};
///
/// let mut scene = Scene::new();
/// let root = scene.create_container();
/// let child = scene.create_container();
/// scene.add_child(root, child).unwrap();
/// scene.node_mut(child).unwrap().set_position(10.0, 5.0);
///
/// scene.update_transform(root).unwrap();
/// let world = scene.node(child).unwrap().world_transform();
/// assert_eq!((world.tx, world.ty), (10.0, 5.0));
/// ```
#[derive(Debug, Default)]
pub struct Scene {
    nodes: Arena<NodeId, Node>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Creation ─────────────────────────────────────────────────────────────

    pub fn insert(&mut self, node: Node) -> NodeId {
        self.nodes.insert(node)
    }

    pub fn create_container(&mut self) -> NodeId {
        self.insert(Node::new(NodeKind::Container))
    }

    /// A sprite anchored at its top-left corner.
    pub fn create_sprite(&mut self, texture: TextureId) -> NodeId {
        self.insert(Node::new(NodeKind::Sprite(Sprite {
            texture,
            anchor: Point::ZERO,
        })))
    }

    pub fn create_graphics(&mut self, graphics: Graphics) -> NodeId {
        self.insert(Node::new(NodeKind::Graphics(graphics)))
    }

    pub fn create_strip(
        &mut self,
        texture: TextureId,
        vertices: Vec<Point>,
        uvs: Vec<[f32; 2]>,
    ) -> NodeId {
        self.insert(Node::new(NodeKind::Strip(Strip {
            texture,
            vertices,
            uvs,
        })))
    }

    // ── Access ───────────────────────────────────────────────────────────────

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn get(&self, id: NodeId) -> Result<&Node, SceneError> {
        self.nodes.get(id).ok_or(SceneError::StaleNode(id))
    }

    pub fn get_mut(&mut self, id: NodeId) -> Result<&mut Node, SceneError> {
        self.nodes.get_mut(id).ok_or(SceneError::StaleNode(id))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 0
    }

    pub fn parent(&self, id: NodeId) -> Result<Option<NodeId>, SceneError> {
        Ok(self.get(id)?.parent)
    }

    pub fn children(&self, id: NodeId) -> Result<&[NodeId], SceneError> {
        Ok(&self.get(id)?.children)
    }

    // ── Hierarchy ────────────────────────────────────────────────────────────

    /// Appends `child` to `parent`, detaching it from its previous parent first.
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), SceneError> {
        let len = self.get(parent)?.children.len();
        let len = if self.get(child)?.parent == Some(parent) {
            len - 1
        } else {
            len
        };
        self.add_child_at(parent, child, len)
    }

    /// Inserts `child` at `index` (0 paints first), detaching it from its previous parent first.
    ///
    /// `index` may equal the child count. It is checked against the child list
    /// after `child` has been detached.
    pub fn add_child_at(
        &mut self,
        parent: NodeId,
        child: NodeId,
        index: usize,
    ) -> Result<(), SceneError> {
        self.get(child)?;
        self.get(parent)?;
        if parent == child || self.is_ancestor(child, parent) {
            return Err(SceneError::Cycle { parent, child });
        }

        let len_after_detach = {
            let parent_node = self.get(parent)?;
            let already_child = self.get(child)?.parent == Some(parent);
            parent_node.children.len() - usize::from(already_child)
        };
        if index > len_after_detach {
            return Err(SceneError::IndexOutOfBounds {
                index,
                len: len_after_detach,
            });
        }

        self.detach(child)?;
        let parent_node = self.get_mut(parent)?;
        parent_node.children.insert(index, child);
        self.get_mut(child)?.parent = Some(parent);
        Ok(())
    }

    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), SceneError> {
        let index = self.get_child_index(parent, child)?;
        self.remove_child_at(parent, index).map(|_| ())
    }

    pub fn remove_child_at(&mut self, parent: NodeId, index: usize) -> Result<NodeId, SceneError> {
        let parent_node = self.get_mut(parent)?;
        let len = parent_node.children.len();
        if index >= len {
            return Err(SceneError::IndexOutOfBounds { index, len });
        }
        let child = parent_node.children.remove(index);
        if let Some(node) = self.nodes.get_mut(child) {
            node.parent = None;
        }
        Ok(child)
    }

    /// Removes the children in `begin..end` and returns them in paint order.
    pub fn remove_children(
        &mut self,
        parent: NodeId,
        begin: usize,
        end: usize,
    ) -> Result<Vec<NodeId>, SceneError> {
        let parent_node = self.get_mut(parent)?;
        let len = parent_node.children.len();
        if begin > end || end > len {
            return Err(SceneError::InvalidRange { begin, end, len });
        }
        let removed: Vec<NodeId> = parent_node.children.drain(begin..end).collect();
        for child in &removed {
            if let Some(node) = self.nodes.get_mut(*child) {
                node.parent = None;
            }
        }
        Ok(removed)
    }

    pub fn swap_children(
        &mut self,
        parent: NodeId,
        first: NodeId,
        second: NodeId,
    ) -> Result<(), SceneError> {
        if first == second {
            self.get_child_index(parent, first)?;
            return Ok(());
        }
        let first_index = self.get_child_index(parent, first)?;
        let second_index = self.get_child_index(parent, second)?;
        self.get_mut(parent)?
            .children
            .swap(first_index, second_index);
        Ok(())
    }

    pub fn get_child_index(&self, parent: NodeId, child: NodeId) -> Result<usize, SceneError> {
        self.get(parent)?
            .children
            .iter()
            .position(|candidate| *candidate == child)
            .ok_or(SceneError::NotAChild { parent, child })
    }

    /// Moves an existing child to `index`, shifting the others.
    pub fn set_child_index(
        &mut self,
        parent: NodeId,
        child: NodeId,
        index: usize,
    ) -> Result<(), SceneError> {
        let current = self.get_child_index(parent, child)?;
        let parent_node = self.get_mut(parent)?;
        let len = parent_node.children.len();
        if index >= len {
            return Err(SceneError::IndexOutOfBounds { index, len });
        }
        parent_node.children.remove(current);
        parent_node.children.insert(index, child);
        Ok(())
    }

    pub fn child_at(&self, parent: NodeId, index: usize) -> Result<NodeId, SceneError> {
        let children = &self.get(parent)?.children;
        children
            .get(index)
            .copied()
            .ok_or(SceneError::IndexOutOfBounds {
                index,
                len: children.len(),
            })
    }

    /// Destroys `id` and its whole subtree, detaching it from its parent.
    ///
    /// Nodes masked by a destroyed node lose their mask.
    pub fn destroy(&mut self, id: NodeId) -> Result<(), SceneError> {
        self.detach(id)?;
        let mut stack = vec![id];
        let mut destroyed = Vec::new();
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(current) {
                stack.extend(node.children.iter().copied());
                if let Some(mask) = node.mask {
                    if let Some(mask_node) = self.nodes.get_mut(mask) {
                        mask_node.mask_users = mask_node.mask_users.saturating_sub(1);
                    }
                }
                if node.mask_users > 0 {
                    destroyed.push(current);
                }
            }
        }
        if !destroyed.is_empty() {
            for (_, node) in self.nodes.iter_mut() {
                if node.mask.is_some_and(|mask| destroyed.contains(&mask)) {
                    node.mask = None;
                }
            }
        }
        Ok(())
    }

    fn detach(&mut self, child: NodeId) -> Result<(), SceneError> {
        let Some(old_parent) = self.get(child)?.parent else {
            return Ok(());
        };
        if let Some(parent_node) = self.nodes.get_mut(old_parent) {
            parent_node.children.retain(|candidate| *candidate != child);
        }
        self.get_mut(child)?.parent = None;
        Ok(())
    }

    /// True when `ancestor` appears on the parent chain of `node`.
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = self.nodes.get(node).and_then(|n| n.parent);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.nodes.get(id).and_then(|n| n.parent);
        }
        false
    }

    // ── Masks and filters ────────────────────────────────────────────────────

    /// Clips `node` and its subtree to the shapes of the graphics node `mask`.
    ///
    /// A mask that is not attached anywhere is positioned in `node`'s space.
    pub fn set_mask(&mut self, node: NodeId, mask: Option<NodeId>) -> Result<(), SceneError> {
        self.get(node)?;
        if let Some(mask_id) = mask {
            let mask_node = self.get(mask_id)?;
            if !matches!(mask_node.kind, NodeKind::Graphics(_)) || mask_id == node {
                return Err(SceneError::InvalidMask(mask_id));
            }
        }
        let previous = self.get_mut(node)?.mask.take();
        if let Some(previous) = previous {
            if let Some(previous_node) = self.nodes.get_mut(previous) {
                previous_node.mask_users = previous_node.mask_users.saturating_sub(1);
            }
        }
        if let Some(mask_id) = mask {
            self.get_mut(mask_id)?.mask_users += 1;
            self.get_mut(node)?.mask = Some(mask_id);
        }
        Ok(())
    }

    /// Applies `filters` to the node's subtree, in order. An empty list removes filtering.
    pub fn set_filters(&mut self, node: NodeId, filters: Vec<Filter>) -> Result<(), SceneError> {
        self.get_mut(node)?.filters = filters;
        Ok(())
    }

    // ── Transforms ───────────────────────────────────────────────────────────

    /// Recomputes world transforms and alphas for `root`'s subtree, using its
    /// parent's last world transform (or identity for a root).
    pub fn update_transform(&mut self, root: NodeId) -> Result<(), SceneError> {
        let (parent_world, parent_alpha) = match self.get(root)?.parent {
            Some(parent) => {
                let parent = self.get(parent)?;
                (parent.world, parent.world_alpha)
            }
            None => (Matrix::IDENTITY, 1.0),
        };
        self.update_subtree(root, &parent_world, parent_alpha);
        Ok(())
    }

    /// Like [`Self::update_transform`], but composes `root` under `parent` instead
    /// of its real parent.
    pub fn update_transform_with_parent(
        &mut self,
        root: NodeId,
        parent: &Matrix,
    ) -> Result<(), SceneError> {
        self.get(root)?;
        self.update_subtree(root, parent, 1.0);
        Ok(())
    }

    fn update_subtree(&mut self, id: NodeId, parent_world: &Matrix, parent_alpha: f32) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        let world = node.transform.world_matrix(parent_world);
        let world_alpha = node.alpha * parent_alpha;
        node.world = world;
        node.world_alpha = world_alpha;
        node.bounds_cache.set(None);
        let mask = node.mask;
        let child_count = node.children.len();

        if let Some(mask) = mask {
            let detached = self.nodes.get(mask).is_some_and(|m| m.parent.is_none());
            if detached {
                self.update_subtree(mask, &world, 1.0);
            }
        }

        for index in 0..child_count {
            let Some(child) = self.nodes.get(id).and_then(|n| n.children.get(index).copied())
            else {
                break;
            };
            self.update_subtree(child, &world, world_alpha);
        }
    }

    // ── Bounds ───────────────────────────────────────────────────────────────

    /// World-space bounds of the node and its visible descendants, as of the
    /// last transform pass.
    ///
    /// Returns [`Rectangle::EMPTY`] when nothing visible contributes. Descendants
    /// whose bounds are NaN are skipped; a node's own NaN bounds are returned as-is.
    pub fn bounds(&self, id: NodeId, textures: &TextureRegistry) -> Result<Rectangle, SceneError> {
        let node = self.get(id)?;
        if let Some(cached) = node.bounds_cache.get() {
            return Ok(cached);
        }
        let mut bounds = match node.own_bounds(textures) {
            Some(own) if own.is_nan() => {
                node.bounds_cache.set(Some(own));
                return Ok(own);
            }
            Some(own) => own,
            None => Rectangle::EMPTY,
        };
        for child in &node.children {
            let Some(child_node) = self.nodes.get(*child) else {
                continue;
            };
            if !child_node.visible {
                continue;
            }
            let child_bounds = self.bounds(*child, textures)?;
            if child_bounds.is_nan() {
                continue;
            }
            bounds = bounds.union(&child_bounds);
        }
        node.bounds_cache.set(Some(bounds));
        Ok(bounds)
    }

    pub fn to_global(&self, id: NodeId, point: Point) -> Result<Point, SceneError> {
        Ok(self.get(id)?.world.apply(point))
    }

    pub fn to_local(&self, id: NodeId, point: Point) -> Result<Point, SceneError> {
        Ok(self.get(id)?.world.apply_inverse(point))
    }
}
