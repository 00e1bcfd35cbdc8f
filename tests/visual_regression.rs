/// Visual regression tests for the software backend.
///
/// These tests render the shared test scenes into a CPU framebuffer, then
/// validate specific pixel locations against expected colors.
///
/// Run with:   cargo test --test visual_regression
use tableau::{
    Color, Graphics, Rectangle, Renderer, RendererOptions, Scene, SoftwareBackend, TextureRegistry,
};
use tableau_test_scenes::{
    build_main_scene, check_pixels, PixelExpectation, CANVAS_HEIGHT, CANVAS_WIDTH,
};

fn software_renderer(width: u32, height: u32) -> Renderer<SoftwareBackend> {
    let options = RendererOptions::new(width, height).with_background(Color::BLACK);
    Renderer::new(SoftwareBackend::new(width, height), options).expect("software renderer")
}

fn assert_pixels(pixels: &[u8], width: u32, height: u32, expectations: &[PixelExpectation]) {
    let failures = check_pixels(pixels, width, height, expectations);
    if !failures.is_empty() {
        panic!(
            "{} pixel expectation(s) failed:\n{}",
            failures.len(),
            failures.join("\n"),
        );
    }
}

/// Main regression test: renders all 16 tiles and validates pixel expectations.
#[test]
fn main_scene_pixel_expectations() {
    let mut renderer = software_renderer(CANVAS_WIDTH, CANVAS_HEIGHT);
    let mut test_scene = build_main_scene();

    renderer
        .render(&mut test_scene.scene, test_scene.root, &mut test_scene.textures)
        .expect("render main scene");

    let mut pixel_buffer = Vec::new();
    let (width, height) = renderer.read_pixels(&mut pixel_buffer).expect("readback");
    assert_eq!((width, height), (CANVAS_WIDTH, CANVAS_HEIGHT));
    assert_pixels(&pixel_buffer, width, height, &test_scene.expectations);
}

/// Every mask and filter in the main scene unwinds completely.
#[test]
fn main_scene_leaves_no_stencil_state_behind() {
    let mut renderer = software_renderer(CANVAS_WIDTH, CANVAS_HEIGHT);
    let mut test_scene = build_main_scene();
    let stats = renderer
        .render(&mut test_scene.scene, test_scene.root, &mut test_scene.textures)
        .expect("render main scene");

    assert_eq!(stats.masks_pushed, 5);
    assert_eq!(stats.filters_applied, 4);
    assert!(!renderer.backend().stencil_test_enabled());
    assert!(renderer.backend().stencil_snapshot().iter().all(|&s| s == 0));
    assert_eq!(renderer.filter_pool().allocated(), renderer.filter_pool().idle());
}

/// Rendering the same scene twice produces identical pixels.
#[test]
fn main_scene_is_stable_across_frames() {
    let mut renderer = software_renderer(CANVAS_WIDTH, CANVAS_HEIGHT);
    let mut test_scene = build_main_scene();

    let mut first = Vec::new();
    renderer
        .render(&mut test_scene.scene, test_scene.root, &mut test_scene.textures)
        .expect("first frame");
    renderer.read_pixels(&mut first).expect("readback");

    let mut second = Vec::new();
    let stats = renderer
        .render(&mut test_scene.scene, test_scene.root, &mut test_scene.textures)
        .expect("second frame");
    renderer.read_pixels(&mut second).expect("readback");

    assert_eq!(stats.texture_uploads, 0, "textures stay resident between frames");
    assert!(first == second, "second frame differs from the first");
}

/// Regression test: an empty root only clears.
#[test]
fn empty_root_clears_to_background() {
    let mut renderer = software_renderer(16, 16);
    let mut textures = TextureRegistry::default();
    let mut scene = Scene::new();
    let root = scene.create_container();

    let stats = renderer
        .render(&mut scene, root, &mut textures)
        .expect("render");
    assert_eq!(stats.draw_calls, 0);

    let mut pixels = Vec::new();
    renderer.read_pixels(&mut pixels).expect("readback");
    assert_pixels(
        &pixels,
        16,
        16,
        &[
            PixelExpectation::background(0, 0, "top-left"),
            PixelExpectation::background(15, 15, "bottom-right"),
        ],
    );
}

/// Regression test: a transparent renderer clears to zero alpha.
#[test]
fn transparent_background_reads_back_as_zero() {
    let options = RendererOptions::new(8, 8).with_transparent(true);
    let mut renderer =
        Renderer::new(SoftwareBackend::new(8, 8), options).expect("software renderer");
    let mut textures = TextureRegistry::default();
    let mut scene = Scene::new();
    let root = scene.create_graphics({
        let mut graphics = Graphics::new();
        graphics.fill(
            tableau::Shape::Rectangle(Rectangle::new(0.0, 0.0, 4.0, 8.0)),
            Color::rgb(255, 0, 0),
            0.5,
        );
        graphics
    });

    renderer
        .render(&mut scene, root, &mut textures)
        .expect("render");
    let mut pixels = Vec::new();
    renderer.read_pixels(&mut pixels).expect("readback");
    assert_pixels(
        &pixels,
        8,
        8,
        &[
            PixelExpectation::new(1, 4, [128, 0, 0, 128], "half-alpha fill stays premultiplied"),
            PixelExpectation::new(6, 4, [0, 0, 0, 0], "untouched pixel is transparent"),
        ],
    );
}

/// Resolution scales logical coordinates onto the physical framebuffer.
#[test]
fn resolution_two_doubles_physical_pixels() {
    let options = RendererOptions::new(8, 8)
        .with_resolution(2.0)
        .with_background(Color::BLACK);
    let mut renderer =
        Renderer::new(SoftwareBackend::new(16, 16), options).expect("software renderer");
    let mut textures = TextureRegistry::default();
    let mut scene = Scene::new();
    let mut graphics = Graphics::new();
    graphics.fill_rect(Rectangle::new(0.0, 0.0, 4.0, 4.0), Color::WHITE);
    let root = scene.create_graphics(graphics);

    renderer
        .render(&mut scene, root, &mut textures)
        .expect("render");
    let mut pixels = Vec::new();
    let (width, height) = renderer.read_pixels(&mut pixels).expect("readback");
    assert_eq!((width, height), (16, 16));
    assert_pixels(
        &pixels,
        width,
        height,
        &[
            PixelExpectation::opaque(7, 7, 255, 255, 255, "inside scaled rect"),
            PixelExpectation::background(8, 8, "just outside scaled rect"),
        ],
    );
}
