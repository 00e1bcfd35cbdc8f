//! Frame-level behaviour of `Renderer` on the software backend: batching,
//! filter pooling, mask unwinding, texture residency and context loss.
use std::f32::consts::FRAC_PI_4;

use tableau::{
    AlphaFilter, BaseTextureId, BaseTextureOptions, BlendMode, BlurFilter, Color, GpuBackend,
    Graphics, ImageSource, NodeId, Point, Rectangle, RenderError, Renderer, RendererOptions,
    ResourcePolicy, Scene, SoftwareBackend, TextureError, TextureId, TextureRegistry,
    Transformable, MAX_BATCH_SIZE,
};

fn renderer_with(options: RendererOptions) -> Renderer<SoftwareBackend> {
    let (width, height) = options.physical_size();
    Renderer::new(SoftwareBackend::new(width, height), options).expect("software renderer")
}

fn renderer(width: u32, height: u32) -> Renderer<SoftwareBackend> {
    renderer_with(RendererOptions::new(width, height).with_background(Color::BLACK))
}

fn solid_texture(textures: &mut TextureRegistry, rgba: [u8; 4]) -> (BaseTextureId, TextureId) {
    let base = textures.add_base_texture(ImageSource::solid(4, 4, rgba), Default::default());
    let texture = textures.add_texture(base, None).expect("whole frame");
    (base, texture)
}

fn add_sprite(scene: &mut Scene, parent: NodeId, texture: TextureId, x: f32, y: f32) -> NodeId {
    let sprite = scene.create_sprite(texture);
    scene.add_child(parent, sprite).expect("fresh node");
    scene.get_mut(sprite).expect("live").set_position(x, y);
    sprite
}

/// Index counts of every sprite-batch draw into the main framebuffer, in order.
fn main_target_index_counts(backend: &SoftwareBackend) -> Vec<u32> {
    backend
        .draws()
        .filter(|draw| draw.target.is_none())
        .map(|draw| draw.index_count)
        .collect()
}

#[test]
fn two_textures_and_a_rotation_cost_two_draws() {
    let mut renderer = renderer(32, 32);
    let mut textures = TextureRegistry::default();
    let (_, a) = solid_texture(&mut textures, [255, 0, 0, 255]);
    let (_, b) = solid_texture(&mut textures, [0, 0, 255, 255]);
    let mut scene = Scene::new();
    let root = scene.create_container();
    let first = add_sprite(&mut scene, root, a, 2.0, 2.0);
    let second = add_sprite(&mut scene, root, b, 20.0, 20.0);
    scene.get_mut(second).unwrap().set_rotation(FRAC_PI_4);

    let stats = renderer.render(&mut scene, root, &mut textures).unwrap();
    assert_eq!(stats.draw_calls, 2);
    assert_eq!(stats.sprites, 2);
    for child in [first, second] {
        assert_eq!(scene.node(child).unwrap().world_alpha(), 1.0);
    }
}

#[test]
fn texture_runs_split_into_minimal_draws() {
    let mut renderer = renderer(64, 8);
    let mut textures = TextureRegistry::default();
    let (_, a) = solid_texture(&mut textures, [255, 0, 0, 255]);
    let (_, b) = solid_texture(&mut textures, [0, 255, 0, 255]);
    let mut scene = Scene::new();
    let root = scene.create_container();
    for (index, texture) in [a, a, b, b, a].into_iter().enumerate() {
        add_sprite(&mut scene, root, texture, index as f32 * 8.0, 0.0);
    }

    renderer.backend_mut().clear_calls();
    let stats = renderer.render(&mut scene, root, &mut textures).unwrap();
    assert_eq!(stats.draw_calls, 3);
    assert_eq!(main_target_index_counts(renderer.backend()), vec![12, 12, 6]);
}

#[test]
fn blend_mode_changes_split_batches() {
    let mut renderer = renderer(32, 8);
    let mut textures = TextureRegistry::default();
    let (_, a) = solid_texture(&mut textures, [255, 0, 0, 255]);
    let mut scene = Scene::new();
    let root = scene.create_container();
    add_sprite(&mut scene, root, a, 0.0, 0.0);
    let additive = add_sprite(&mut scene, root, a, 8.0, 0.0);
    add_sprite(&mut scene, root, a, 16.0, 0.0);
    scene.get_mut(additive).unwrap().blend_mode = BlendMode::Add;

    let stats = renderer.render(&mut scene, root, &mut textures).unwrap();
    assert_eq!(stats.draw_calls, 3);
}

#[test]
fn full_batches_flush_implicitly() {
    let mut renderer = renderer_with(RendererOptions::new(64, 64).with_batch_size(4));
    let mut textures = TextureRegistry::default();
    let (_, a) = solid_texture(&mut textures, [255, 255, 255, 255]);
    let mut scene = Scene::new();
    let root = scene.create_container();
    for index in 0..10 {
        add_sprite(&mut scene, root, a, (index % 8) as f32 * 8.0, (index / 8) as f32 * 8.0);
    }

    renderer.backend_mut().clear_calls();
    let stats = renderer.render(&mut scene, root, &mut textures).unwrap();
    assert_eq!(stats.draw_calls, 3);
    assert_eq!(main_target_index_counts(renderer.backend()), vec![24, 24, 12]);
}

#[test]
fn oversized_batches_are_clamped_to_addressable_quads() {
    let mut options = RendererOptions::new(16, 16).with_background(Color::BLACK);
    options.batch_size = 20_000;
    let mut renderer = renderer_with(options);
    let mut textures = TextureRegistry::default();
    let (_, a) = solid_texture(&mut textures, [255, 0, 0, 255]);
    let mut scene = Scene::new();
    let root = scene.create_container();
    for _ in 0..MAX_BATCH_SIZE {
        add_sprite(&mut scene, root, a, 0.0, 0.0);
    }
    add_sprite(&mut scene, root, a, 8.0, 8.0);

    let stats = renderer.render(&mut scene, root, &mut textures).unwrap();
    assert_eq!(stats.sprites as usize, MAX_BATCH_SIZE + 1);
    assert_eq!(stats.draw_calls, 2);
    assert_eq!(renderer.backend().pixel(9, 9), Some([255, 0, 0, 255]));
    assert_eq!(renderer.backend().pixel(6, 6), Some([0, 0, 0, 255]));
}

#[test]
fn repeated_filters_reuse_one_pooled_target() {
    let mut renderer = renderer(64, 16);
    let mut textures = TextureRegistry::default();
    let (_, a) = solid_texture(&mut textures, [255, 0, 0, 255]);
    let mut scene = Scene::new();
    let root = scene.create_container();
    for index in 0..6 {
        let group = scene.create_container();
        scene.add_child(root, group).unwrap();
        add_sprite(&mut scene, group, a, index as f32 * 10.0, 4.0);
        scene
            .set_filters(group, vec![AlphaFilter::new(0.5).into()])
            .unwrap();
    }

    for _ in 0..3 {
        let stats = renderer.render(&mut scene, root, &mut textures).unwrap();
        assert_eq!(stats.filters_applied, 6);
        assert_eq!(renderer.filter_pool().allocated(), 1);
    }
    assert_eq!(renderer.backend().stats().render_targets_created, 1);
}

#[test]
fn multi_pass_filters_never_sample_their_own_target() {
    let mut renderer = renderer(32, 32);
    let mut textures = TextureRegistry::default();
    let (_, a) = solid_texture(&mut textures, [0, 255, 0, 255]);
    let mut scene = Scene::new();
    let root = scene.create_container();
    let group = scene.create_container();
    scene.add_child(root, group).unwrap();
    add_sprite(&mut scene, group, a, 8.0, 8.0);
    scene
        .set_filters(
            group,
            vec![
                BlurFilter::new(2.0).into(),
                AlphaFilter::new(0.75).into(),
            ],
        )
        .unwrap();

    renderer.backend_mut().clear_calls();
    let stats = renderer.render(&mut scene, root, &mut textures).unwrap();
    assert_eq!(stats.filters_applied, 2);

    let backend = renderer.backend();
    let mut offscreen_draws = 0;
    for draw in backend.draws() {
        if let Some(target) = draw.target {
            offscreen_draws += 1;
            let written = backend.render_target_texture(target);
            assert!(written.is_some());
            assert_ne!(draw.texture, written, "pass reads the target it writes");
        }
    }
    // Sprite into the capture, then blur horizontal and blur vertical before the last pass.
    assert_eq!(offscreen_draws, 3);
    assert!(renderer.filter_pool().allocated() <= 2);
}

#[test]
fn nested_mixed_masks_clip_to_their_intersection() {
    let mut renderer = renderer(24, 24);
    let mut textures = TextureRegistry::default();
    let (_, white) = solid_texture(&mut textures, [255, 255, 255, 255]);
    let mut scene = Scene::new();
    let root = scene.create_container();
    let convex_outer = scene.create_container();
    let concave_middle = scene.create_container();
    let convex_inner = scene.create_container();
    scene.add_child(root, convex_outer).unwrap();
    scene.add_child(convex_outer, concave_middle).unwrap();
    scene.add_child(concave_middle, convex_inner).unwrap();
    let sprite = add_sprite(&mut scene, convex_inner, white, 0.0, 0.0);
    scene.get_mut(sprite).unwrap().set_scale(6.0, 6.0);

    let mut outer = Graphics::new();
    outer.fill_rect(Rectangle::new(2.0, 2.0, 20.0, 20.0), Color::WHITE);
    // A "U": the middle column 10..14 above y = 14 is cut out.
    let mut middle = Graphics::new();
    middle.fill_polygon(
        vec![
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(10.0, 14.0),
            Point::new(14.0, 14.0),
            Point::new(14.0, 0.0),
            Point::new(24.0, 0.0),
            Point::new(24.0, 24.0),
            Point::new(0.0, 24.0),
        ],
        Color::WHITE,
    );
    let mut inner = Graphics::new();
    inner.fill_rect(Rectangle::new(0.0, 6.0, 24.0, 12.0), Color::WHITE);
    for (node, graphics) in [
        (convex_outer, outer),
        (concave_middle, middle),
        (convex_inner, inner),
    ] {
        let mask = scene.create_graphics(graphics);
        scene.set_mask(node, Some(mask)).unwrap();
    }

    let stats = renderer.render(&mut scene, root, &mut textures).unwrap();
    assert_eq!(stats.masks_pushed, 3);

    let backend = renderer.backend();
    let lit = |x: u32, y: u32| backend.pixel(x, y) == Some([255, 255, 255, 255]);
    assert!(lit(4, 8), "inside all three masks");
    assert!(lit(12, 16), "below the notch");
    assert!(!lit(12, 8), "inside the concave notch");
    assert!(!lit(4, 4), "above the inner band");
    assert!(!lit(1, 10), "outside the outer rectangle");
    assert!(!lit(4, 20), "below the inner band");

    assert!(!backend.stencil_test_enabled());
    assert!(backend.stencil_snapshot().iter().all(|&value| value == 0));
}

fn polygon(points: &[(f32, f32)]) -> Vec<Point> {
    points.iter().map(|&(x, y)| Point::new(x, y)).collect()
}

/// Even-odd point-in-polygon, matching how masks and fills treat overlaps.
fn inside(points: &[Point], x: f32, y: f32) -> bool {
    let mut odd = false;
    for (i, a) in points.iter().enumerate() {
        let b = points[(i + 1) % points.len()];
        if (a.y > y) != (b.y > y) && x < a.x + (y - a.y) * (b.x - a.x) / (b.y - a.y) {
            odd = !odd;
        }
    }
    odd
}

/// Renders a white 24x24 sprite under one nested container per mask, outermost
/// first, and checks every pixel against the intersection of the masks.
fn assert_masks_clip_exactly(masks: &[Vec<Point>]) {
    let mut renderer = renderer(24, 24);
    let mut textures = TextureRegistry::default();
    let (_, white) = solid_texture(&mut textures, [255, 255, 255, 255]);
    let mut scene = Scene::new();
    let root = scene.create_container();
    let mut parent = root;
    for points in masks {
        let container = scene.create_container();
        scene.add_child(parent, container).unwrap();
        let mut graphics = Graphics::new();
        graphics.fill_polygon(points.clone(), Color::WHITE);
        let mask = scene.create_graphics(graphics);
        scene.set_mask(container, Some(mask)).unwrap();
        parent = container;
    }
    let sprite = add_sprite(&mut scene, parent, white, 0.0, 0.0);
    scene.get_mut(sprite).unwrap().set_scale(6.0, 6.0);

    let stats = renderer.render(&mut scene, root, &mut textures).unwrap();
    assert_eq!(stats.masks_pushed as usize, masks.len());

    let backend = renderer.backend();
    for y in 0..24 {
        for x in 0..24 {
            let (cx, cy) = (x as f32 + 0.5, y as f32 + 0.5);
            let expected = masks.iter().all(|points| inside(points, cx, cy));
            let lit = backend.pixel(x, y) == Some([255, 255, 255, 255]);
            assert_eq!(lit, expected, "pixel ({x}, {y}) with {} masks", masks.len());
        }
    }
    assert!(!backend.stencil_test_enabled());
    assert!(backend.stencil_snapshot().iter().all(|&value| value == 0));
}

#[test]
fn concave_mask_stacks_clip_to_their_intersection() {
    // Notch cut down from the top edge.
    let u = polygon(&[
        (0.0, 0.0),
        (10.0, 0.0),
        (10.0, 14.0),
        (14.0, 14.0),
        (14.0, 0.0),
        (24.0, 0.0),
        (24.0, 24.0),
        (0.0, 24.0),
    ]);
    // Notch cut in from the right edge.
    let c = polygon(&[
        (0.0, 0.0),
        (24.0, 0.0),
        (24.0, 10.0),
        (14.0, 10.0),
        (14.0, 14.0),
        (24.0, 14.0),
        (24.0, 24.0),
        (0.0, 24.0),
    ]);
    // Bottom-left corner removed.
    let l = polygon(&[
        (0.0, 0.0),
        (24.0, 0.0),
        (24.0, 24.0),
        (6.0, 24.0),
        (6.0, 18.0),
        (0.0, 18.0),
    ]);
    let square = polygon(&[(2.0, 2.0), (22.0, 2.0), (22.0, 22.0), (2.0, 22.0)]);
    let band = polygon(&[(0.0, 6.0), (24.0, 6.0), (24.0, 18.0), (0.0, 18.0)]);

    assert_masks_clip_exactly(&[u.clone(), c.clone(), l.clone()]);
    assert_masks_clip_exactly(&[u.clone(), square.clone(), l.clone()]);
    assert_masks_clip_exactly(&[u.clone(), c.clone(), band.clone()]);
    assert_masks_clip_exactly(&[l, u.clone(), c, square.clone()]);
    assert_masks_clip_exactly(&[square, u, band]);
}

#[test]
fn star_masks_clip_to_the_star_not_its_hull() {
    let star: Vec<Point> = (0..5)
        .map(|i| {
            let angle = (i * 2) as f32 * std::f32::consts::TAU / 5.0;
            Point::new(12.0 + angle.sin() * 11.0, 12.0 - angle.cos() * 11.0)
        })
        .collect();
    assert_masks_clip_exactly(&[star]);
}

#[test]
fn masks_beyond_the_stencil_depth_are_ignored() {
    let mut renderer = renderer(16, 16);
    let mut textures = TextureRegistry::default();
    let (_, white) = solid_texture(&mut textures, [255, 255, 255, 255]);
    let mut scene = Scene::new();
    let root = scene.create_container();
    let mut parent = root;
    for _ in 0..257 {
        let container = scene.create_container();
        scene.add_child(parent, container).unwrap();
        let mut square = Graphics::new();
        square.fill_rect(Rectangle::new(2.0, 2.0, 8.0, 8.0), Color::WHITE);
        let mask = scene.create_graphics(square);
        scene.set_mask(container, Some(mask)).unwrap();
        parent = container;
    }
    let sprite = add_sprite(&mut scene, parent, white, 0.0, 0.0);
    scene.get_mut(sprite).unwrap().set_scale(4.0, 4.0);

    let stats = renderer.render(&mut scene, root, &mut textures).unwrap();
    assert_eq!(stats.masks_pushed, u32::from(u8::MAX));

    let backend = renderer.backend();
    assert_eq!(backend.pixel(5, 5), Some([255, 255, 255, 255]));
    assert_eq!(backend.pixel(12, 12), Some([0, 0, 0, 255]));
    assert!(!backend.stencil_test_enabled());
    assert!(backend.stencil_snapshot().iter().all(|&value| value == 0));
}

#[test]
fn high_resolution_textures_draw_at_logical_size() {
    let mut renderer = renderer(16, 16);
    let mut textures = TextureRegistry::default();
    let base = textures.add_base_texture(
        ImageSource::solid(8, 8, [0, 255, 0, 255]),
        BaseTextureOptions {
            resolution: 2.0,
            ..Default::default()
        },
    );
    let texture = textures.add_texture(base, None).unwrap();
    let mut scene = Scene::new();
    let root = scene.create_container();
    let sprite = add_sprite(&mut scene, root, texture, 2.0, 2.0);

    renderer.render(&mut scene, root, &mut textures).unwrap();
    assert_eq!(
        scene.bounds(sprite, &textures).unwrap(),
        Rectangle::new(2.0, 2.0, 4.0, 4.0)
    );
    let backend = renderer.backend();
    assert_eq!(backend.pixel(5, 5), Some([0, 255, 0, 255]));
    assert_eq!(backend.pixel(6, 6), Some([0, 0, 0, 255]));
}

#[test]
fn unloaded_textures_are_skipped() {
    let mut renderer = renderer(16, 16);
    let mut textures = TextureRegistry::new(ResourcePolicy::Strict);
    let pending = textures.add_pending_base_texture(Default::default());
    let texture = textures.add_texture(pending, None).unwrap();
    let mut scene = Scene::new();
    let root = scene.create_container();
    add_sprite(&mut scene, root, texture, 0.0, 0.0);

    let stats = renderer.render(&mut scene, root, &mut textures).unwrap();
    assert_eq!(stats.draw_calls, 0);
    assert_eq!(stats.texture_uploads, 0);

    textures
        .load_base_texture(pending, ImageSource::solid(4, 4, [0, 0, 255, 255]))
        .unwrap();
    let stats = renderer.render(&mut scene, root, &mut textures).unwrap();
    assert_eq!(stats.draw_calls, 1);
    assert_eq!(renderer.backend().pixel(1, 1), Some([0, 0, 255, 255]));
}

#[test]
fn each_renderer_uploads_a_shared_texture_once() {
    let mut textures = TextureRegistry::default();
    let (base, a) = solid_texture(&mut textures, [255, 0, 0, 255]);
    let mut scene = Scene::new();
    let root = scene.create_container();
    add_sprite(&mut scene, root, a, 0.0, 0.0);

    let mut first = renderer(8, 8);
    let mut second = renderer(8, 8);
    assert_ne!(first.context_id(), second.context_id());

    for renderer in [&mut first, &mut second] {
        assert_eq!(renderer.render(&mut scene, root, &mut textures).unwrap().texture_uploads, 1);
        assert_eq!(renderer.render(&mut scene, root, &mut textures).unwrap().texture_uploads, 0);
    }

    textures.dirty(base).unwrap();
    for renderer in [&mut first, &mut second] {
        assert_eq!(renderer.render(&mut scene, root, &mut textures).unwrap().texture_uploads, 1);
    }
}

#[test]
fn out_of_bounds_frames_follow_the_resource_policy() {
    let frame = Rectangle::new(2.0, 2.0, 8.0, 8.0);

    let mut strict = TextureRegistry::new(ResourcePolicy::Strict);
    let base = strict.add_base_texture(ImageSource::solid(4, 4, [255; 4]), Default::default());
    assert!(matches!(
        strict.add_texture(base, Some(frame)),
        Err(TextureError::FrameOutOfBounds { .. })
    ));

    let mut lenient = TextureRegistry::new(ResourcePolicy::Lenient);
    let base = lenient.add_base_texture(ImageSource::solid(4, 4, [255; 4]), Default::default());
    let texture = lenient.add_texture(base, Some(frame)).unwrap();
    assert!(!lenient.texture(texture).unwrap().is_valid());

    let mut renderer = renderer(16, 16);
    let mut scene = Scene::new();
    let root = scene.create_container();
    add_sprite(&mut scene, root, texture, 0.0, 0.0);
    let stats = renderer.render(&mut scene, root, &mut lenient).unwrap();
    assert_eq!(stats.draw_calls, 0);
}

#[test]
fn lost_context_issues_no_backend_calls() {
    let mut renderer = renderer(16, 16);
    let mut textures = TextureRegistry::default();
    let (_, a) = solid_texture(&mut textures, [255, 0, 0, 255]);
    let mut scene = Scene::new();
    let root = scene.create_container();
    let group = scene.create_container();
    scene.add_child(root, group).unwrap();
    add_sprite(&mut scene, group, a, 0.0, 0.0);
    scene
        .set_filters(group, vec![AlphaFilter::new(0.5).into()])
        .unwrap();
    renderer.render(&mut scene, root, &mut textures).unwrap();

    renderer.backend_mut().lose_context();
    renderer.backend_mut().clear_calls();
    for _ in 0..3 {
        renderer.render(&mut scene, root, &mut textures).unwrap();
    }
    assert!(renderer.context_lost());
    assert!(renderer.backend().calls().is_empty());

    renderer.backend_mut().restore_context();
    renderer.handle_context_restored(&mut textures).unwrap();
    let stats = renderer.render(&mut scene, root, &mut textures).unwrap();
    assert_eq!(stats.filters_applied, 1);
    assert_eq!(stats.texture_uploads, 1);
    assert_eq!(renderer.backend().pixel(1, 1), Some([128, 0, 0, 255]));
}

#[test]
fn render_to_texture_applies_the_parent_matrix() {
    let mut renderer = renderer(16, 16);
    let mut textures = TextureRegistry::default();
    let (_, a) = solid_texture(&mut textures, [0, 255, 0, 255]);
    let mut source = Scene::new();
    let source_root = source.create_container();
    add_sprite(&mut source, source_root, a, 0.0, 0.0);

    let render_texture = renderer
        .create_render_texture(&mut textures, 8, 8, 1.0)
        .unwrap();
    renderer
        .render_to_texture(
            &mut source,
            source_root,
            &mut textures,
            &render_texture,
            Some(&tableau::Matrix::translation(4.0, 4.0)),
            true,
        )
        .unwrap();

    let mut display = Scene::new();
    let display_root = display.create_container();
    add_sprite(&mut display, display_root, render_texture.texture(), 0.0, 0.0);
    renderer
        .render(&mut display, display_root, &mut textures)
        .unwrap();

    let backend = renderer.backend();
    assert_eq!(backend.pixel(5, 5), Some([0, 255, 0, 255]));
    assert_eq!(backend.pixel(1, 1), Some([0, 0, 0, 255]), "cleared area is transparent");
    assert_eq!(backend.pixel(12, 12), Some([0, 0, 0, 255]), "outside the render texture");
}

#[test]
fn destroyed_base_textures_are_released_on_the_next_frame() {
    let mut renderer = renderer(8, 8);
    let mut textures = TextureRegistry::default();
    let (base, a) = solid_texture(&mut textures, [255, 0, 0, 255]);
    let mut scene = Scene::new();
    let root = scene.create_container();
    let sprite = add_sprite(&mut scene, root, a, 0.0, 0.0);
    renderer.render(&mut scene, root, &mut textures).unwrap();
    let resident = renderer.backend().live_textures();

    scene.destroy(sprite).unwrap();
    textures.destroy_base_texture(base).unwrap();
    renderer.render(&mut scene, root, &mut textures).unwrap();
    assert_eq!(renderer.backend().live_textures(), resident - 1);
}

#[test]
fn destroyed_sprite_textures_follow_the_renderer_policy() {
    let mut textures = TextureRegistry::default();
    let (_, a) = solid_texture(&mut textures, [255, 0, 0, 255]);
    let mut scene = Scene::new();
    let root = scene.create_container();
    add_sprite(&mut scene, root, a, 0.0, 0.0);
    textures.destroy_texture(a).unwrap();

    let mut strict =
        renderer_with(RendererOptions::new(8, 8).with_resource_policy(ResourcePolicy::Strict));
    let error = strict.render(&mut scene, root, &mut textures).unwrap_err();
    assert_eq!(error, RenderError::Texture(TextureError::StaleTexture(a)));

    let mut lenient =
        renderer_with(RendererOptions::new(8, 8).with_resource_policy(ResourcePolicy::Lenient));
    let stats = lenient.render(&mut scene, root, &mut textures).unwrap();
    assert_eq!(stats.draw_calls, 0);
}
