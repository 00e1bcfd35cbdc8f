use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use tableau::{
    Color, ImageSource, NodeId, Renderer, RendererOptions, Scene, SoftwareBackend, TextureId,
    TextureRegistry, Transformable,
};

const WIDTH: u32 = 256;
const HEIGHT: u32 = 256;

fn solid_textures(textures: &mut TextureRegistry, count: usize) -> Vec<TextureId> {
    (0..count)
        .map(|index| {
            let shade = (index * 40 % 256) as u8;
            let base = textures.add_base_texture(
                ImageSource::solid(4, 4, [shade, 255 - shade, 128, 255]),
                Default::default(),
            );
            textures.add_texture(base, None).unwrap()
        })
        .collect()
}

/// `count` small sprites in a grid, cycling through `palette`.
fn sprite_grid(count: usize, palette: &[TextureId]) -> (Scene, NodeId) {
    let mut scene = Scene::new();
    let root = scene.create_container();
    for index in 0..count {
        let sprite = scene.create_sprite(palette[index % palette.len()]);
        scene.add_child(root, sprite).unwrap();
        let node = scene.get_mut(sprite).unwrap();
        node.set_position((index % 64) as f32 * 4.0, (index / 64 % 64) as f32 * 4.0);
    }
    (scene, root)
}

fn bench_single_texture(c: &mut Criterion) {
    let mut textures = TextureRegistry::default();
    let palette = solid_textures(&mut textures, 1);
    let (mut scene, root) = sprite_grid(2_000, &palette);
    let options = RendererOptions::new(WIDTH, HEIGHT).with_background(Color::BLACK);
    let mut renderer = Renderer::new(SoftwareBackend::new(WIDTH, HEIGHT), options).unwrap();

    c.bench_function("batch_2000_sprites_one_texture", |b| {
        b.iter(|| {
            let stats = renderer.render(&mut scene, root, &mut textures).unwrap();
            black_box(stats.draw_calls);
        })
    });
}

fn bench_texture_switches(c: &mut Criterion) {
    let mut textures = TextureRegistry::default();
    let palette = solid_textures(&mut textures, 8);
    let (mut scene, root) = sprite_grid(2_000, &palette);
    let options = RendererOptions::new(WIDTH, HEIGHT).with_background(Color::BLACK);
    let mut renderer = Renderer::new(SoftwareBackend::new(WIDTH, HEIGHT), options).unwrap();

    c.bench_function("batch_2000_sprites_eight_textures", |b| {
        b.iter(|| {
            let stats = renderer.render(&mut scene, root, &mut textures).unwrap();
            black_box(stats.draw_calls);
        })
    });
}

fn bench_transform_update(c: &mut Criterion) {
    let mut textures = TextureRegistry::default();
    let palette = solid_textures(&mut textures, 1);

    c.bench_function("update_transform_2000_rotated", |b| {
        b.iter_batched(
            || {
                let (mut scene, root) = sprite_grid(2_000, &palette);
                let children = scene.children(root).unwrap().to_vec();
                for (index, child) in children.into_iter().enumerate() {
                    scene.get_mut(child).unwrap().set_rotation(index as f32 * 0.01);
                }
                (scene, root)
            },
            |(mut scene, root)| {
                scene.update_transform(root).unwrap();
                black_box(scene);
            },
            BatchSize::LargeInput,
        )
    });
}

criterion_group!(
    benches,
    bench_single_texture,
    bench_texture_switches,
    bench_transform_update
);
criterion_main!(benches);
