use super::graphics::Graphics;
use super::transform::{Transform, Transformable};
use crate::color::Color;
use crate::filters::{Filter, Shader};
use crate::id::{NodeId, TextureId};
use crate::math::{Matrix, Point, Rectangle};
use crate::renderer::BlendMode;
use crate::texture::TextureRegistry;
use std::cell::Cell;
use std::rc::Rc;

/// A textured quad positioned by an anchor inside its frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Sprite {
    pub texture: TextureId,
    /// Origin of the sprite within its frame, `(0, 0)` top-left to `(1, 1)` bottom-right.
    pub anchor: Point,
}

/// A textured triangle strip.
#[derive(Debug, Clone, PartialEq)]
pub struct Strip {
    pub texture: TextureId,
    pub vertices: Vec<Point>,
    /// One UV per vertex, normalised to the texture frame.
    pub uvs: Vec<[f32; 2]>,
}

/// What a node draws on its own, before its children.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Draws nothing itself.
    Container,
    Sprite(Sprite),
    Graphics(Graphics),
    Strip(Strip),
}

/// Draw variants that know their own world-space extent.
pub trait Renderable {
    /// Axis-aligned world bounds; NaN when the transform is degenerate.
    fn world_bounds(&self, world: &Matrix, textures: &TextureRegistry) -> Rectangle;
}

impl Renderable for Sprite {
    fn world_bounds(&self, world: &Matrix, textures: &TextureRegistry) -> Rectangle {
        let Some(texture) = textures.texture(self.texture) else {
            return Rectangle::EMPTY;
        };
        let scale = textures
            .base_texture(texture.base())
            .map_or(1.0, |base| base.logical_scale());
        let (mut w1, mut h1, mut w0, mut h0) =
            texture.quad_extents(self.anchor.x, self.anchor.y, scale);
        if world.is_axis_aligned() {
            let (mut a, mut d) = (world.a, world.d);
            if a < 0.0 {
                a = -a;
                let temp = w0;
                w0 = -w1;
                w1 = -temp;
            }
            if d < 0.0 {
                d = -d;
                let temp = h0;
                h0 = -h1;
                h1 = -temp;
            }
            let bounds = Rectangle::from_min_max(
                a * w1 + world.tx,
                d * h1 + world.ty,
                a * w0 + world.tx,
                d * h0 + world.ty,
            );
            if bounds.is_nan() {
                return Rectangle::new(f32::NAN, f32::NAN, f32::NAN, f32::NAN);
            }
            return bounds;
        }
        Rectangle::from_min_max(w1, h1, w0, h0).transformed(world)
    }
}

impl Renderable for Graphics {
    fn world_bounds(&self, world: &Matrix, _textures: &TextureRegistry) -> Rectangle {
        let local = self.local_bounds();
        if local.is_empty() {
            return Rectangle::EMPTY;
        }
        local.transformed(world)
    }
}

impl Renderable for Strip {
    fn world_bounds(&self, world: &Matrix, _textures: &TextureRegistry) -> Rectangle {
        let points: Vec<Point> = self.vertices.iter().map(|p| world.apply(*p)).collect();
        crate::math::bounds_of_points(&points)
    }
}

/// One entry of the scene graph.
///
/// Every node can hold children; children paint after (on top of) their parent,
/// in insertion order.
#[derive(Debug, Clone)]
pub struct Node {
    pub transform: Transform,
    pub alpha: f32,
    pub visible: bool,
    /// When false the node itself is not drawn, but its children still are.
    pub renderable: bool,
    pub tint: Color,
    pub blend_mode: BlendMode,
    /// Replaces the default sprite shader.
    pub shader: Option<Rc<Shader>>,
    /// Overrides the bounds used to size this node's filter target.
    pub filter_area: Option<Rectangle>,
    pub kind: NodeKind,
    pub(crate) mask: Option<NodeId>,
    /// How many nodes use this one as their mask.
    pub(crate) mask_users: u32,
    pub(crate) filters: Vec<Filter>,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) world: Matrix,
    pub(crate) world_alpha: f32,
    pub(crate) bounds_cache: Cell<Option<Rectangle>>,
}

impl Node {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            transform: Transform::default(),
            alpha: 1.0,
            visible: true,
            renderable: true,
            tint: Color::WHITE,
            blend_mode: BlendMode::Normal,
            shader: None,
            filter_area: None,
            kind,
            mask: None,
            mask_users: 0,
            filters: Vec::new(),
            parent: None,
            children: Vec::new(),
            world: Matrix::IDENTITY,
            world_alpha: 1.0,
            bounds_cache: Cell::new(None),
        }
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn mask(&self) -> Option<NodeId> {
        self.mask
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// True while some node uses this one as its mask; masks are never drawn directly.
    pub fn is_mask(&self) -> bool {
        self.mask_users > 0
    }

    pub fn as_sprite(&self) -> Option<&Sprite> {
        match &self.kind {
            NodeKind::Sprite(sprite) => Some(sprite),
            _ => None,
        }
    }

    pub fn as_sprite_mut(&mut self) -> Option<&mut Sprite> {
        match &mut self.kind {
            NodeKind::Sprite(sprite) => Some(sprite),
            _ => None,
        }
    }

    pub fn as_graphics_mut(&mut self) -> Option<&mut Graphics> {
        match &mut self.kind {
            NodeKind::Graphics(graphics) => Some(graphics),
            _ => None,
        }
    }

    /// Bounds of this node's own drawing, excluding children.
    pub(crate) fn own_bounds(&self, textures: &TextureRegistry) -> Option<Rectangle> {
        match &self.kind {
            NodeKind::Container => None,
            NodeKind::Sprite(sprite) => Some(sprite.world_bounds(&self.world, textures)),
            NodeKind::Graphics(graphics) => Some(graphics.world_bounds(&self.world, textures)),
            NodeKind::Strip(strip) => Some(strip.world_bounds(&self.world, textures)),
        }
    }
}

impl Transformable for Node {
    fn transform(&self) -> &Transform {
        &self.transform
    }

    fn transform_mut(&mut self) -> &mut Transform {
        &mut self.transform
    }

    fn world_transform(&self) -> &Matrix {
        &self.world
    }

    fn world_alpha(&self) -> f32 {
        self.world_alpha
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourcePolicy;
    use crate::texture::ImageSource;
    use crate::Trim;

    fn sprite_over(textures: &mut TextureRegistry, width: u32, height: u32) -> Sprite {
        let base = textures.add_base_texture(
            ImageSource::solid(width, height, [255; 4]),
            Default::default(),
        );
        let texture = textures.add_texture(base, None).unwrap();
        Sprite {
            texture,
            anchor: Point::new(0.5, 0.5),
        }
    }

    #[test]
    fn axis_aligned_bounds_handle_negative_scale() {
        let mut textures = TextureRegistry::new(ResourcePolicy::Strict);
        let sprite = sprite_over(&mut textures, 10, 20);
        let world = Matrix::new(-2.0, 0.0, 0.0, 1.0, 100.0, 50.0);
        let bounds = sprite.world_bounds(&world, &textures);
        assert_eq!(bounds, Rectangle::new(90.0, 40.0, 20.0, 20.0));
    }

    #[test]
    fn rotated_bounds_match_transformed_corners() {
        let mut textures = TextureRegistry::new(ResourcePolicy::Strict);
        let sprite = sprite_over(&mut textures, 10, 10);
        let world = Matrix::rotation(std::f32::consts::FRAC_PI_4);
        let bounds = sprite.world_bounds(&world, &textures);
        let half_diagonal = (50.0f32).sqrt();
        assert!((bounds.x + half_diagonal).abs() < 1e-4);
        assert!((bounds.width - 2.0 * half_diagonal).abs() < 1e-4);
    }

    #[test]
    fn trimmed_bounds_use_untrimmed_anchor() {
        let mut textures = TextureRegistry::new(ResourcePolicy::Strict);
        let base =
            textures.add_base_texture(ImageSource::solid(10, 6, [255; 4]), Default::default());
        let texture = textures.add_texture(base, None).unwrap();
        textures
            .set_trim(
                texture,
                Some(Trim {
                    x: 3.0,
                    y: 2.0,
                    width: 20.0,
                    height: 12.0,
                }),
            )
            .unwrap();
        let sprite = Sprite {
            texture,
            anchor: Point::ZERO,
        };
        let bounds = sprite.world_bounds(&Matrix::IDENTITY, &textures);
        assert_eq!(bounds, Rectangle::new(3.0, 2.0, 10.0, 6.0));
    }
}
