//! Renders the shared regression scene and writes it to a PNG.
//!
//! Run with:   cargo run --example scene_to_png -- [output.png] [--gpu]
//!
//! Pixels are read back premultiplied; the scene is opaque so the file is too.
use tableau::{
    init_logging, Color, GpuBackend, LoggingConfig, Renderer, RendererOptions, SoftwareBackend,
    WgpuBackend,
};
use tableau_test_scenes::{build_main_scene, check_pixels, CANVAS_HEIGHT, CANVAS_WIDTH};

fn render<B: GpuBackend>(backend: B) -> (Vec<u8>, u32, u32) {
    let options = RendererOptions::new(CANVAS_WIDTH, CANVAS_HEIGHT).with_background(Color::BLACK);
    let mut renderer = Renderer::new(backend, options).expect("builtin shaders compile");
    let mut test_scene = build_main_scene();
    let stats = renderer
        .render(&mut test_scene.scene, test_scene.root, &mut test_scene.textures)
        .expect("render main scene");
    println!(
        "{} draw calls, {} sprites, {} masks, {} filters",
        stats.draw_calls, stats.sprites, stats.masks_pushed, stats.filters_applied
    );

    let mut pixels = Vec::new();
    let (width, height) = renderer.read_pixels(&mut pixels).expect("readback");
    for failure in check_pixels(&pixels, width, height, &test_scene.expectations) {
        println!("mismatch: {failure}");
    }
    (pixels, width, height)
}

fn main() {
    init_logging(LoggingConfig::default());
    let mut output = String::from("scene.png");
    let mut use_gpu = false;
    for arg in std::env::args().skip(1) {
        if arg == "--gpu" {
            use_gpu = true;
        } else {
            output = arg;
        }
    }

    let (pixels, width, height) = if use_gpu {
        render(WgpuBackend::new_headless(CANVAS_WIDTH, CANVAS_HEIGHT).expect("a wgpu adapter"))
    } else {
        render(SoftwareBackend::new(CANVAS_WIDTH, CANVAS_HEIGHT))
    };

    let image = image::RgbaImage::from_raw(width, height, pixels).expect("tightly packed RGBA8");
    image.save(&output).expect("write png");
    println!("wrote {output} ({width}x{height})");
}
