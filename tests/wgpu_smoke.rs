/// Renders the shared test scene on a real device.
///
/// Skips, rather than fails, on machines without a usable adapter.
///
/// Run with:   cargo test --test wgpu_smoke
use futures::executor::block_on;
use tableau::{Color, GpuBackend, Renderer, RendererOptions, WgpuBackend};
use tableau_test_scenes::{build_main_scene, check_pixels, CANVAS_HEIGHT, CANVAS_WIDTH};

fn headless() -> Option<WgpuBackend> {
    match block_on(WgpuBackend::try_new_headless(CANVAS_WIDTH, CANVAS_HEIGHT)) {
        Ok(backend) => Some(backend),
        Err(error) => {
            eprintln!("skipping wgpu smoke test: {error}");
            None
        }
    }
}

#[test]
fn main_scene_matches_on_gpu() {
    let Some(backend) = headless() else {
        return;
    };
    let options = RendererOptions::new(CANVAS_WIDTH, CANVAS_HEIGHT).with_background(Color::BLACK);
    let mut renderer = Renderer::new(backend, options).expect("builtin shaders compile");
    let mut test_scene = build_main_scene();

    renderer
        .render(&mut test_scene.scene, test_scene.root, &mut test_scene.textures)
        .expect("render main scene");

    let mut pixels = Vec::new();
    let (width, height) = renderer.read_pixels(&mut pixels).expect("readback");
    assert_eq!(pixels.len(), (width * height * 4) as usize);

    let failures = check_pixels(&pixels, width, height, &test_scene.expectations);
    if !failures.is_empty() {
        panic!(
            "{} pixel expectation(s) failed:\n{}",
            failures.len(),
            failures.join("\n"),
        );
    }
}

#[test]
fn invalid_wgsl_is_reported_not_cached() {
    let Some(mut backend) = headless() else {
        return;
    };
    let result = backend.compile_program(&tableau::ProgramSource {
        label: "broken",
        fragment_wgsl: "@fragment fn fs_main() -> @location(0) vec4<f32> { return nope; }",
        raster: |_| [0.0; 4],
    });
    assert!(matches!(
        result,
        Err(tableau::GpuError::ShaderCompilation { .. })
    ));
}

#[test]
fn destroy_returns_a_clean_device() {
    let Some(backend) = headless() else {
        return;
    };
    let options = RendererOptions::new(CANVAS_WIDTH, CANVAS_HEIGHT);
    let mut renderer = Renderer::new(backend, options).expect("builtin shaders compile");
    let mut test_scene = build_main_scene();
    renderer
        .render(&mut test_scene.scene, test_scene.root, &mut test_scene.textures)
        .expect("render main scene");

    let backend = renderer.destroy(&mut test_scene.textures);
    assert!(!backend.is_context_lost());
}
