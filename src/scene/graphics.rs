//! Filled vector shapes, used both for drawing and as stencil masks.

use crate::color::Color;
use crate::math::{bounds_of_points, Matrix, Point, Rectangle};
use lyon::lyon_tessellation::{
    BuffersBuilder, FillOptions, FillTessellator, FillVertex, FillVertexConstructor,
    TessellationError, VertexBuffers,
};
use lyon::path::Winding;
use std::collections::hash_map::DefaultHasher;
use std::f32::consts::TAU;
use std::hash::{Hash, Hasher};

/// Segments used to flatten circles and ellipses into mask polygons.
const CURVE_SEGMENTS: usize = 40;
/// Segments per rounded corner.
const CORNER_SEGMENTS: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Rectangle(Rectangle),
    RoundedRectangle { rect: Rectangle, radius: f32 },
    Circle { center: Point, radius: f32 },
    Ellipse { center: Point, radius_x: f32, radius_y: f32 },
    /// Closed polygon; may be concave.
    Polygon(Vec<Point>),
}

impl Shape {
    /// Flattens the outline into a closed polygon, without repeating the first point.
    pub fn to_polygon(&self) -> Vec<Point> {
        match self {
            Shape::Rectangle(rect) => vec![
                Point::new(rect.x, rect.y),
                Point::new(rect.right(), rect.y),
                Point::new(rect.right(), rect.bottom()),
                Point::new(rect.x, rect.bottom()),
            ],
            Shape::Circle { center, radius } => ellipse_points(*center, *radius, *radius),
            Shape::Ellipse {
                center,
                radius_x,
                radius_y,
            } => ellipse_points(*center, *radius_x, *radius_y),
            Shape::RoundedRectangle { rect, radius } => rounded_rect_points(rect, *radius),
            Shape::Polygon(points) => points.clone(),
        }
    }

    pub fn local_bounds(&self) -> Rectangle {
        match self {
            Shape::Rectangle(rect) | Shape::RoundedRectangle { rect, .. } => *rect,
            Shape::Circle { center, radius } => Rectangle::new(
                center.x - radius,
                center.y - radius,
                radius * 2.0,
                radius * 2.0,
            ),
            Shape::Ellipse {
                center,
                radius_x,
                radius_y,
            } => Rectangle::new(
                center.x - radius_x,
                center.y - radius_y,
                radius_x * 2.0,
                radius_y * 2.0,
            ),
            Shape::Polygon(points) => bounds_of_points(points),
        }
    }

    fn hash_geometry<H: Hasher>(&self, state: &mut H) {
        fn write<H: Hasher>(state: &mut H, value: f32) {
            value.to_bits().hash(state);
        }
        match self {
            Shape::Rectangle(rect) => {
                0u8.hash(state);
                write(state, rect.x);
                write(state, rect.y);
                write(state, rect.width);
                write(state, rect.height);
            }
            Shape::RoundedRectangle { rect, radius } => {
                1u8.hash(state);
                write(state, rect.x);
                write(state, rect.y);
                write(state, rect.width);
                write(state, rect.height);
                write(state, *radius);
            }
            Shape::Circle { center, radius } => {
                2u8.hash(state);
                write(state, center.x);
                write(state, center.y);
                write(state, *radius);
            }
            Shape::Ellipse {
                center,
                radius_x,
                radius_y,
            } => {
                3u8.hash(state);
                write(state, center.x);
                write(state, center.y);
                write(state, *radius_x);
                write(state, *radius_y);
            }
            Shape::Polygon(points) => {
                4u8.hash(state);
                points.len().hash(state);
                for point in points {
                    write(state, point.x);
                    write(state, point.y);
                }
            }
        }
    }

    fn add_to_path(&self, builder: &mut lyon::path::Builder) {
        match self {
            Shape::Rectangle(rect) => {
                builder.add_rectangle(&to_box(rect), Winding::Positive);
            }
            Shape::RoundedRectangle { rect, radius } => {
                let radii = lyon::path::builder::BorderRadii {
                    top_left: *radius,
                    top_right: *radius,
                    bottom_left: *radius,
                    bottom_right: *radius,
                };
                builder.add_rounded_rectangle(&to_box(rect), &radii, Winding::Positive);
            }
            Shape::Circle { center, radius } => {
                builder.add_circle(lyon::math::point(center.x, center.y), *radius, Winding::Positive);
            }
            Shape::Ellipse {
                center,
                radius_x,
                radius_y,
            } => {
                builder.add_ellipse(
                    lyon::math::point(center.x, center.y),
                    lyon::math::vector(*radius_x, *radius_y),
                    lyon::math::Angle::radians(0.0),
                    Winding::Positive,
                );
            }
            Shape::Polygon(points) => {
                if points.len() < 3 {
                    return;
                }
                let points: Vec<lyon::math::Point> = points
                    .iter()
                    .map(|p| lyon::math::point(p.x, p.y))
                    .collect();
                builder.add_polygon(lyon::path::Polygon {
                    points: &points,
                    closed: true,
                });
            }
        }
    }
}

fn to_box(rect: &Rectangle) -> lyon::math::Box2D {
    lyon::math::Box2D::new(
        lyon::math::point(rect.x, rect.y),
        lyon::math::point(rect.right(), rect.bottom()),
    )
}

fn ellipse_points(center: Point, radius_x: f32, radius_y: f32) -> Vec<Point> {
    (0..CURVE_SEGMENTS)
        .map(|i| {
            let angle = TAU * i as f32 / CURVE_SEGMENTS as f32;
            Point::new(
                center.x + angle.cos() * radius_x,
                center.y + angle.sin() * radius_y,
            )
        })
        .collect()
}

fn rounded_rect_points(rect: &Rectangle, radius: f32) -> Vec<Point> {
    let radius = radius.min(rect.width / 2.0).min(rect.height / 2.0).max(0.0);
    if radius == 0.0 {
        return Shape::Rectangle(*rect).to_polygon();
    }
    // Corner centres, clockwise from top-left, with the start angle of each arc.
    let corners = [
        (rect.x + radius, rect.y + radius, TAU / 2.0),
        (rect.right() - radius, rect.y + radius, TAU * 0.75),
        (rect.right() - radius, rect.bottom() - radius, 0.0),
        (rect.x + radius, rect.bottom() - radius, TAU / 4.0),
    ];
    let mut points = Vec::with_capacity(corners.len() * (CORNER_SEGMENTS + 1));
    for (cx, cy, start) in corners {
        for step in 0..=CORNER_SEGMENTS {
            let angle = start + (TAU / 4.0) * step as f32 / CORNER_SEGMENTS as f32;
            points.push(Point::new(cx + angle.cos() * radius, cy + angle.sin() * radius));
        }
    }
    points
}

/// True when every turn of the closed polygon has the same sign and the
/// turns add up to one full revolution, so self-intersecting outlines such as
/// a pentagram are not convex. Repeated points are ignored.
pub fn is_convex(points: &[Point]) -> bool {
    let n = points.len();
    let edges: Vec<(f32, f32)> = (0..n)
        .map(|i| {
            let (a, b) = (points[i], points[(i + 1) % n]);
            (b.x - a.x, b.y - a.y)
        })
        .filter(|&(x, y)| x != 0.0 || y != 0.0)
        .collect();
    if edges.len() < 3 {
        return false;
    }
    let mut sign = 0.0f32;
    let mut turning = 0.0f32;
    for (i, &(ux, uy)) in edges.iter().enumerate() {
        let (vx, vy) = edges[(i + 1) % edges.len()];
        let cross = ux * vy - uy * vx;
        let dot = ux * vx + uy * vy;
        if cross.abs() <= f32::EPSILON {
            if dot < 0.0 {
                // The outline doubles back on itself.
                return false;
            }
            continue;
        }
        if sign == 0.0 {
            sign = cross.signum();
        } else if cross.signum() != sign {
            return false;
        }
        turning += cross.atan2(dot);
    }
    sign != 0.0 && (turning.abs() - TAU).abs() < 1e-2
}

/// One filled shape with its colour.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphicsFill {
    pub shape: Shape,
    pub color: Color,
    /// Multiplied into the colour's own alpha.
    pub alpha: f32,
}

/// A list of filled shapes.
///
/// ```
/// use tableau::{Color, Graphics, Rectangle};
///
/// let mut graphics = Graphics::new();
/// graphics
///     .fill_rect(Rectangle::new(0.0, 0.0, 10.0, 10.0), Color::WHITE)
///     .fill_circle(20.0, 5.0, 5.0, Color::rgb(255, 0, 0));
/// assert_eq!(graphics.fills().len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Graphics {
    fills: Vec<GraphicsFill>,
}

impl Graphics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fill(&mut self, shape: Shape, color: Color, alpha: f32) -> &mut Self {
        self.fills.push(GraphicsFill {
            shape,
            color,
            alpha,
        });
        self
    }

    pub fn fill_rect(&mut self, rect: Rectangle, color: Color) -> &mut Self {
        self.fill(Shape::Rectangle(rect), color, 1.0)
    }

    pub fn fill_rounded_rect(&mut self, rect: Rectangle, radius: f32, color: Color) -> &mut Self {
        self.fill(Shape::RoundedRectangle { rect, radius }, color, 1.0)
    }

    pub fn fill_circle(&mut self, x: f32, y: f32, radius: f32, color: Color) -> &mut Self {
        self.fill(
            Shape::Circle {
                center: Point::new(x, y),
                radius,
            },
            color,
            1.0,
        )
    }

    pub fn fill_ellipse(
        &mut self,
        x: f32,
        y: f32,
        radius_x: f32,
        radius_y: f32,
        color: Color,
    ) -> &mut Self {
        self.fill(
            Shape::Ellipse {
                center: Point::new(x, y),
                radius_x,
                radius_y,
            },
            color,
            1.0,
        )
    }

    pub fn fill_polygon(&mut self, points: Vec<Point>, color: Color) -> &mut Self {
        self.fill(Shape::Polygon(points), color, 1.0)
    }

    pub fn clear(&mut self) {
        self.fills.clear();
    }

    pub fn fills(&self) -> &[GraphicsFill] {
        &self.fills
    }

    pub fn is_empty(&self) -> bool {
        self.fills.is_empty()
    }

    pub fn local_bounds(&self) -> Rectangle {
        self.fills
            .iter()
            .fold(Rectangle::EMPTY, |acc, fill| acc.union(&fill.shape.local_bounds()))
    }

    /// Hash of the shapes' geometry, ignoring colours. Used as the tessellation cache key.
    pub(crate) fn geometry_key(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.fills.len().hash(&mut hasher);
        for fill in &self.fills {
            fill.shape.hash_geometry(&mut hasher);
        }
        hasher.finish()
    }

    /// Tessellates every fill into local-space triangles; each vertex records its fill index.
    pub(crate) fn tessellate(
        &self,
        tessellator: &mut FillTessellator,
    ) -> Result<VertexBuffers<TessellatedVertex, u16>, TessellationError> {
        let mut buffers: VertexBuffers<TessellatedVertex, u16> = VertexBuffers::new();
        let options = FillOptions::default();
        for (fill_index, fill) in self.fills.iter().enumerate() {
            let mut builder = lyon::path::Path::builder();
            fill.shape.add_to_path(&mut builder);
            let path = builder.build();
            tessellator.tessellate_path(
                &path,
                &options,
                &mut BuffersBuilder::new(&mut buffers, FillIndex(fill_index as u16)),
            )?;
        }
        Ok(buffers)
    }

    /// The stencil geometry of this graphics object in world space.
    pub(crate) fn mask_geometry(&self, world: &Matrix) -> MaskGeometry {
        let polygons: Vec<Vec<Point>> = self
            .fills
            .iter()
            .map(|fill| {
                fill.shape
                    .to_polygon()
                    .into_iter()
                    .map(|point| world.apply(point))
                    .collect::<Vec<Point>>()
            })
            .filter(|polygon| polygon.len() >= 3)
            .collect();
        let convex = polygons.len() == 1 && is_convex(&polygons[0]);
        let all_points: Vec<Point> = polygons.iter().flatten().copied().collect();
        MaskGeometry {
            bounds: bounds_of_points(&all_points),
            polygons,
            convex,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct TessellatedVertex {
    pub position: Point,
    pub fill_index: u16,
}

struct FillIndex(u16);

impl FillVertexConstructor<TessellatedVertex> for FillIndex {
    fn new_vertex(&mut self, vertex: FillVertex) -> TessellatedVertex {
        let position = vertex.position();
        TessellatedVertex {
            position: Point::new(position.x, position.y),
            fill_index: self.0,
        }
    }
}

/// World-space polygons a mask stamps into the stencil buffer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MaskGeometry {
    pub polygons: Vec<Vec<Point>>,
    /// A single convex polygon; stamped directly instead of with the invert trick.
    pub convex: bool,
    pub bounds: Rectangle,
}

impl MaskGeometry {
    pub(crate) fn is_empty(&self) -> bool {
        self.polygons.is_empty() || self.bounds.is_nan()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convexity_of_basic_shapes() {
        let square = Shape::Rectangle(Rectangle::new(0.0, 0.0, 10.0, 10.0)).to_polygon();
        assert!(is_convex(&square));
        let circle = Shape::Circle {
            center: Point::ZERO,
            radius: 5.0,
        }
        .to_polygon();
        assert!(is_convex(&circle));
        let rounded = Shape::RoundedRectangle {
            rect: Rectangle::new(0.0, 0.0, 20.0, 10.0),
            radius: 3.0,
        }
        .to_polygon();
        assert!(is_convex(&rounded));

        let arrow = vec![
            Point::new(0.0, 0.0),
            Point::new(10.0, 5.0),
            Point::new(0.0, 10.0),
            Point::new(3.0, 5.0),
        ];
        assert!(!is_convex(&arrow));

        let repeated = vec![
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(10.0, 10.0),
            Point::new(0.0, 10.0),
            Point::new(0.0, 0.0),
        ];
        assert!(is_convex(&repeated));
    }

    #[test]
    fn pentagram_is_not_convex() {
        // Every other vertex of a regular pentagon: all turns agree but wind twice.
        let star: Vec<Point> = (0..5)
            .map(|i| {
                let angle = (i * 2) as f32 * TAU / 5.0;
                Point::new(10.0 + angle.sin() * 10.0, 10.0 - angle.cos() * 10.0)
            })
            .collect();
        assert!(!is_convex(&star));

        let mut graphics = Graphics::new();
        graphics.fill_polygon(star, Color::WHITE);
        assert!(!graphics.mask_geometry(&Matrix::IDENTITY).convex);
    }

    #[test]
    fn geometry_key_ignores_color() {
        let mut a = Graphics::new();
        a.fill_rect(Rectangle::new(0.0, 0.0, 4.0, 4.0), Color::WHITE);
        let mut b = Graphics::new();
        b.fill_rect(Rectangle::new(0.0, 0.0, 4.0, 4.0), Color::BLACK);
        assert_eq!(a.geometry_key(), b.geometry_key());

        b.fill_rect(Rectangle::new(1.0, 0.0, 4.0, 4.0), Color::BLACK);
        assert_ne!(a.geometry_key(), b.geometry_key());
    }

    #[test]
    fn tessellated_rectangle_has_two_triangles() {
        let mut graphics = Graphics::new();
        graphics.fill_rect(Rectangle::new(0.0, 0.0, 4.0, 4.0), Color::WHITE);
        let buffers = graphics.tessellate(&mut FillTessellator::new()).unwrap();
        assert_eq!(buffers.indices.len(), 6);
        assert!(buffers.vertices.iter().all(|v| v.fill_index == 0));
    }

    #[test]
    fn mask_geometry_is_in_world_space() {
        let mut graphics = Graphics::new();
        graphics.fill_rect(Rectangle::new(0.0, 0.0, 4.0, 4.0), Color::WHITE);
        let geometry = graphics.mask_geometry(&Matrix::translation(10.0, 20.0));
        assert!(geometry.convex);
        assert_eq!(geometry.bounds, Rectangle::new(10.0, 20.0, 4.0, 4.0));
    }

    #[test]
    fn two_shapes_use_the_invert_path() {
        let mut graphics = Graphics::new();
        graphics
            .fill_rect(Rectangle::new(0.0, 0.0, 4.0, 4.0), Color::WHITE)
            .fill_rect(Rectangle::new(8.0, 0.0, 4.0, 4.0), Color::WHITE);
        assert!(!graphics.mask_geometry(&Matrix::IDENTITY).convex);
    }
}
