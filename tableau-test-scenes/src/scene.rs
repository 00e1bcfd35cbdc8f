use std::f32::consts::FRAC_PI_4;

use tableau::{
    AlphaFilter, BlendMode, BlurFilter, Color, ColorMatrixFilter, Graphics, ImageSource, NodeId,
    Point, Rectangle, Scene, TextureId, TextureRegistry, Transformable,
};

use crate::expectations::PixelExpectation;

// ── Grid layout constants ────────────────────────────────────────────────────

const TILE_SIZE: u32 = 40;
const COLUMNS: u32 = 4;
const ROWS: u32 = 4;

pub const CANVAS_WIDTH: u32 = TILE_SIZE * COLUMNS;
pub const CANVAS_HEIGHT: u32 = TILE_SIZE * ROWS;

/// Side of every solid test texture, in texels.
const TEXEL_SIZE: f32 = 4.0;

/// Returns the pixel origin (top-left corner) of tile number `n` (1-based).
fn tile_origin(tile_number: u32) -> (u32, u32) {
    let index = tile_number - 1;
    ((index % COLUMNS) * TILE_SIZE, (index / COLUMNS) * TILE_SIZE)
}

/// The shared scene plus everything needed to render and validate it.
pub struct TestScene {
    pub scene: Scene,
    pub root: NodeId,
    pub textures: TextureRegistry,
    pub expectations: Vec<PixelExpectation>,
}

struct Palette {
    red: TextureId,
    green: TextureId,
    blue: TextureId,
    white: TextureId,
}

impl Palette {
    fn load(textures: &mut TextureRegistry) -> Self {
        let mut solid = |rgba: [u8; 4]| {
            let base = textures.add_base_texture(ImageSource::solid(4, 4, rgba), Default::default());
            textures
                .add_texture(base, None)
                .expect("whole-image frame is always in bounds")
        };
        Self {
            red: solid([255, 0, 0, 255]),
            green: solid([0, 255, 0, 255]),
            blue: solid([0, 0, 255, 255]),
            white: solid([255, 255, 255, 255]),
        }
    }
}

/// Builds the main test scene and the pixel expectations its render must meet.
///
/// Shared between the integration tests (on the software backend), the wgpu
/// smoke test and the PNG demo. The renderer must clear to opaque black.
pub fn build_main_scene() -> TestScene {
    let mut textures = TextureRegistry::default();
    let palette = Palette::load(&mut textures);
    let mut scene = Scene::new();
    let root = scene.create_container();

    let tiles: [fn(&mut Scene, NodeId, &Palette) -> Vec<PixelExpectation>; 16] = [
        tile_01_solid_sprite,
        tile_02_tinted_sprite,
        tile_03_half_alpha_sprite,
        tile_04_nested_alpha,
        tile_05_graphics_rect,
        tile_06_rotated_graphics,
        tile_07_convex_mask,
        tile_08_concave_mask,
        tile_09_nested_masks,
        tile_10_additive_blend,
        tile_11_negative_filter,
        tile_12_group_alpha_filter,
        tile_13_blur_filter,
        tile_14_textured_strip,
        tile_15_filter_and_mask,
        tile_16_hidden_and_unrenderable,
    ];

    let mut expectations = Vec::new();
    for (index, build) in tiles.iter().enumerate() {
        let number = index as u32 + 1;
        let (ox, oy) = tile_origin(number);
        let tile = scene.create_container();
        scene.add_child(root, tile).expect("fresh node");
        node(&mut scene, tile).set_position(ox as f32, oy as f32);
        expectations.extend(
            build(&mut scene, tile, &palette)
                .into_iter()
                .map(|expectation| expectation.offset(ox, oy)),
        );
    }

    TestScene {
        scene,
        root,
        textures,
        expectations,
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn node(scene: &mut Scene, id: NodeId) -> &mut tableau::Node {
    scene.get_mut(id).expect("node created by this scene")
}

fn container(scene: &mut Scene, parent: NodeId) -> NodeId {
    let id = scene.create_container();
    scene.add_child(parent, id).expect("fresh node");
    id
}

/// A square sprite of `size` logical pixels with its top-left at `(x, y)`.
fn sprite(
    scene: &mut Scene,
    parent: NodeId,
    texture: TextureId,
    x: f32,
    y: f32,
    size: f32,
) -> NodeId {
    let id = scene.create_sprite(texture);
    scene.add_child(parent, id).expect("fresh node");
    let sprite = node(scene, id);
    sprite.set_position(x, y);
    sprite.set_scale(size / TEXEL_SIZE, size / TEXEL_SIZE);
    id
}

/// A mask graphic in the masked node's local space.
fn mask(scene: &mut Scene, target: NodeId, graphics: Graphics) -> NodeId {
    let id = scene.create_graphics(graphics);
    scene.set_mask(target, Some(id)).expect("graphics can mask");
    id
}

fn l_shape() -> Graphics {
    let mut graphics = Graphics::new();
    graphics.fill_polygon(
        vec![
            Point::new(4.0, 4.0),
            Point::new(36.0, 4.0),
            Point::new(36.0, 14.0),
            Point::new(14.0, 14.0),
            Point::new(14.0, 36.0),
            Point::new(4.0, 36.0),
        ],
        Color::WHITE,
    );
    graphics
}

// ── Section A: Sprites ───────────────────────────────────────────────────────

fn tile_01_solid_sprite(scene: &mut Scene, tile: NodeId, palette: &Palette) -> Vec<PixelExpectation> {
    sprite(scene, tile, palette.red, 8.0, 8.0, 24.0);
    vec![
        PixelExpectation::opaque(20, 20, 255, 0, 0, "tile01 sprite center"),
        PixelExpectation::opaque(8, 8, 255, 0, 0, "tile01 sprite top-left pixel"),
        PixelExpectation::background(7, 20, "tile01 left of sprite"),
        PixelExpectation::background(32, 32, "tile01 past bottom-right edge"),
    ]
}

fn tile_02_tinted_sprite(scene: &mut Scene, tile: NodeId, palette: &Palette) -> Vec<PixelExpectation> {
    let id = sprite(scene, tile, palette.white, 8.0, 8.0, 24.0);
    node(scene, id).tint = Color::rgb(0, 200, 0);
    vec![
        PixelExpectation::opaque(20, 20, 0, 200, 0, "tile02 tint multiplies texture"),
        PixelExpectation::background(4, 4, "tile02 outside sprite"),
    ]
}

fn tile_03_half_alpha_sprite(scene: &mut Scene, tile: NodeId, palette: &Palette) -> Vec<PixelExpectation> {
    let id = sprite(scene, tile, palette.white, 8.0, 8.0, 24.0);
    node(scene, id).alpha = 0.5;
    vec![PixelExpectation::opaque(20, 20, 128, 128, 128, "tile03 half alpha over black")]
}

fn tile_04_nested_alpha(scene: &mut Scene, tile: NodeId, palette: &Palette) -> Vec<PixelExpectation> {
    let group = container(scene, tile);
    node(scene, group).alpha = 0.5;
    sprite(scene, group, palette.red, 8.0, 8.0, 24.0);
    vec![PixelExpectation::opaque(20, 20, 128, 0, 0, "tile04 parent alpha reaches child")]
}

// ── Section B: Graphics ──────────────────────────────────────────────────────

fn tile_05_graphics_rect(scene: &mut Scene, tile: NodeId, _palette: &Palette) -> Vec<PixelExpectation> {
    let mut graphics = Graphics::new();
    graphics.fill_rect(Rectangle::new(6.0, 10.0, 28.0, 20.0), Color::rgb(0, 0, 255));
    let id = scene.create_graphics(graphics);
    scene.add_child(tile, id).expect("fresh node");
    vec![
        PixelExpectation::opaque(20, 20, 0, 0, 255, "tile05 rect fill"),
        PixelExpectation::background(20, 8, "tile05 above rect"),
    ]
}

fn tile_06_rotated_graphics(scene: &mut Scene, tile: NodeId, _palette: &Palette) -> Vec<PixelExpectation> {
    let mut graphics = Graphics::new();
    graphics.fill_rect(Rectangle::new(-10.0, -10.0, 20.0, 20.0), Color::rgb(255, 255, 0));
    let id = scene.create_graphics(graphics);
    scene.add_child(tile, id).expect("fresh node");
    let diamond = node(scene, id);
    diamond.set_position(20.0, 20.0);
    diamond.set_rotation(FRAC_PI_4);
    vec![
        PixelExpectation::opaque(20, 20, 255, 255, 0, "tile06 diamond center"),
        PixelExpectation::opaque(32, 20, 255, 255, 0, "tile06 rotated corner reaches right"),
        PixelExpectation::background(7, 7, "tile06 unrotated corner is empty"),
    ]
}

// ── Section C: Masks ─────────────────────────────────────────────────────────

fn tile_07_convex_mask(scene: &mut Scene, tile: NodeId, palette: &Palette) -> Vec<PixelExpectation> {
    let group = container(scene, tile);
    sprite(scene, group, palette.red, 4.0, 4.0, 32.0);
    let mut circle = Graphics::new();
    circle.fill_circle(20.0, 20.0, 8.0, Color::WHITE);
    mask(scene, group, circle);
    vec![
        PixelExpectation::opaque(20, 20, 255, 0, 0, "tile07 inside circle"),
        PixelExpectation::background(6, 6, "tile07 clipped by circle"),
    ]
}

fn tile_08_concave_mask(scene: &mut Scene, tile: NodeId, palette: &Palette) -> Vec<PixelExpectation> {
    let group = container(scene, tile);
    sprite(scene, group, palette.green, 4.0, 4.0, 32.0);
    mask(scene, group, l_shape());
    vec![
        PixelExpectation::opaque(8, 8, 0, 255, 0, "tile08 L corner"),
        PixelExpectation::opaque(30, 8, 0, 255, 0, "tile08 L top arm"),
        PixelExpectation::opaque(8, 30, 0, 255, 0, "tile08 L left arm"),
        PixelExpectation::background(30, 30, "tile08 concave notch"),
    ]
}

fn tile_09_nested_masks(scene: &mut Scene, tile: NodeId, palette: &Palette) -> Vec<PixelExpectation> {
    let outer = container(scene, tile);
    let inner = container(scene, outer);
    sprite(scene, inner, palette.white, 4.0, 4.0, 32.0);
    mask(scene, outer, l_shape());
    let mut band = Graphics::new();
    band.fill_rect(Rectangle::new(4.0, 4.0, 32.0, 16.0), Color::WHITE);
    mask(scene, inner, band);
    vec![
        PixelExpectation::opaque(30, 8, 255, 255, 255, "tile09 inside both"),
        PixelExpectation::opaque(8, 17, 255, 255, 255, "tile09 L stem inside band"),
        PixelExpectation::background(30, 17, "tile09 band outside L"),
        PixelExpectation::background(8, 25, "tile09 L outside band"),
    ]
}

// ── Section D: Blending ──────────────────────────────────────────────────────

fn tile_10_additive_blend(scene: &mut Scene, tile: NodeId, palette: &Palette) -> Vec<PixelExpectation> {
    sprite(scene, tile, palette.red, 4.0, 4.0, 20.0);
    let green = sprite(scene, tile, palette.green, 16.0, 16.0, 20.0);
    node(scene, green).blend_mode = BlendMode::Add;
    vec![
        PixelExpectation::opaque(8, 8, 255, 0, 0, "tile10 red only"),
        PixelExpectation::opaque(20, 20, 255, 255, 0, "tile10 red plus green"),
        PixelExpectation::opaque(32, 32, 0, 255, 0, "tile10 green only"),
    ]
}

// ── Section E: Filters ───────────────────────────────────────────────────────

fn tile_11_negative_filter(scene: &mut Scene, tile: NodeId, palette: &Palette) -> Vec<PixelExpectation> {
    let group = container(scene, tile);
    sprite(scene, group, palette.red, 8.0, 8.0, 24.0);
    scene
        .set_filters(group, vec![ColorMatrixFilter::negative().into()])
        .expect("live node");
    vec![
        PixelExpectation::opaque(20, 20, 0, 255, 255, "tile11 negative of red"),
        PixelExpectation::background(4, 4, "tile11 outside filter area"),
    ]
}

fn tile_12_group_alpha_filter(scene: &mut Scene, tile: NodeId, palette: &Palette) -> Vec<PixelExpectation> {
    let group = container(scene, tile);
    sprite(scene, group, palette.red, 4.0, 4.0, 20.0);
    sprite(scene, group, palette.red, 16.0, 16.0, 20.0);
    scene
        .set_filters(group, vec![AlphaFilter::new(0.5).into()])
        .expect("live node");
    vec![
        PixelExpectation::opaque(8, 8, 128, 0, 0, "tile12 single layer"),
        PixelExpectation::opaque(20, 20, 128, 0, 0, "tile12 overlap fades as one layer"),
    ]
}

fn tile_13_blur_filter(scene: &mut Scene, tile: NodeId, palette: &Palette) -> Vec<PixelExpectation> {
    let group = container(scene, tile);
    sprite(scene, group, palette.blue, 8.0, 8.0, 24.0);
    scene
        .set_filters(group, vec![BlurFilter::new(2.0).into()])
        .expect("live node");
    vec![
        PixelExpectation::opaque(20, 20, 0, 0, 255, "tile13 blur keeps flat interior"),
        PixelExpectation::background(1, 1, "tile13 beyond blur padding"),
    ]
}

// ── Section F: Strips and visibility ─────────────────────────────────────────

fn tile_14_textured_strip(scene: &mut Scene, tile: NodeId, palette: &Palette) -> Vec<PixelExpectation> {
    let id = scene.create_strip(
        palette.blue,
        vec![
            Point::new(4.0, 4.0),
            Point::new(36.0, 4.0),
            Point::new(4.0, 36.0),
            Point::new(36.0, 36.0),
        ],
        vec![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0]],
    );
    scene.add_child(tile, id).expect("fresh node");
    vec![
        PixelExpectation::opaque(20, 20, 0, 0, 255, "tile14 strip interior"),
        PixelExpectation::opaque(34, 6, 0, 0, 255, "tile14 upper-right corner"),
        PixelExpectation::opaque(6, 34, 0, 0, 255, "tile14 lower-left corner"),
        PixelExpectation::background(2, 2, "tile14 outside strip"),
    ]
}

fn tile_15_filter_and_mask(scene: &mut Scene, tile: NodeId, palette: &Palette) -> Vec<PixelExpectation> {
    let group = container(scene, tile);
    sprite(scene, group, palette.red, 4.0, 4.0, 32.0);
    let mut circle = Graphics::new();
    circle.fill_circle(20.0, 20.0, 8.0, Color::WHITE);
    mask(scene, group, circle);
    scene
        .set_filters(group, vec![ColorMatrixFilter::negative().into()])
        .expect("live node");
    vec![
        PixelExpectation::opaque(20, 20, 0, 255, 255, "tile15 masked area is filtered"),
        PixelExpectation::background(6, 6, "tile15 masked-out area stays empty"),
    ]
}

fn tile_16_hidden_and_unrenderable(scene: &mut Scene, tile: NodeId, palette: &Palette) -> Vec<PixelExpectation> {
    let mut backdrop = Graphics::new();
    backdrop.fill_rect(Rectangle::new(0.0, 0.0, 40.0, 40.0), Color::rgb(255, 0, 255));
    let parent = scene.create_graphics(backdrop);
    scene.add_child(tile, parent).expect("fresh node");
    node(scene, parent).renderable = false;
    sprite(scene, parent, palette.green, 4.0, 4.0, 16.0);
    let hidden = sprite(scene, parent, palette.white, 24.0, 24.0, 12.0);
    node(scene, hidden).visible = false;
    vec![
        PixelExpectation::opaque(8, 8, 0, 255, 0, "tile16 child of unrenderable node"),
        PixelExpectation::background(30, 30, "tile16 invisible sprite and skipped backdrop"),
    ]
}
