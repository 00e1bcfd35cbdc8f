//! Renders a spinning, masked sprite field on the CPU and presents it through softbuffer.
//!
//! Run with:   cargo run --example window
use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::Instant;

use tableau::{
    init_logging, BlurFilter, Color, Graphics, ImageSource, LoggingConfig, NodeId, Renderer,
    RendererOptions, Scene, SoftwareBackend, TextureRegistry, Transformable,
};
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::window::{Window, WindowId};

const SPRITES: usize = 24;

struct Demo {
    scene: Scene,
    root: NodeId,
    spinner: NodeId,
    textures: TextureRegistry,
}

impl Demo {
    fn new() -> Self {
        let mut textures = TextureRegistry::default();
        let base = textures.add_base_texture(
            ImageSource::solid(16, 16, [255, 160, 40, 255]),
            Default::default(),
        );
        let texture = textures.add_texture(base, None).unwrap();

        let mut scene = Scene::new();
        let root = scene.create_container();
        let spinner = scene.create_container();
        scene.add_child(root, spinner).unwrap();

        for index in 0..SPRITES {
            let angle = index as f32 / SPRITES as f32 * TAU;
            let sprite = scene.create_sprite(texture);
            scene.add_child(spinner, sprite).unwrap();
            let node = scene.get_mut(sprite).unwrap();
            node.set_position(angle.cos() * 120.0 - 8.0, angle.sin() * 120.0 - 8.0);
            node.alpha = 0.4 + 0.6 * (index as f32 / SPRITES as f32);
        }

        let mut circle = Graphics::new();
        circle.fill_circle(0.0, 0.0, 140.0, Color::WHITE);
        let mask = scene.create_graphics(circle);
        scene.set_mask(spinner, Some(mask)).unwrap();
        scene
            .set_filters(spinner, vec![BlurFilter::new(2.0).into()])
            .unwrap();

        Self {
            scene,
            root,
            spinner,
            textures,
        }
    }

    fn update(&mut self, width: u32, height: u32, seconds: f32) {
        let spinner = self.scene.get_mut(self.spinner).unwrap();
        spinner.set_position(width as f32 / 2.0, height as f32 / 2.0);
        spinner.set_rotation(seconds);
    }
}

struct App {
    demo: Demo,
    started_at: Instant,
    window: Option<Arc<Window>>,
    renderer: Option<Renderer<SoftwareBackend>>,
    softbuffer_context: Option<softbuffer::Context<Arc<Window>>>,
    softbuffer_surface: Option<softbuffer::Surface<Arc<Window>, Arc<Window>>>,
    frame_count: u64,
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        let window = Arc::new(
            event_loop
                .create_window(Window::default_attributes().with_title("tableau + softbuffer"))
                .unwrap(),
        );
        let size = window.inner_size();
        let options = RendererOptions::new(size.width.max(1), size.height.max(1))
            .with_background(Color::rgb(24, 24, 32));
        let renderer = Renderer::new(
            SoftwareBackend::new(size.width.max(1), size.height.max(1)),
            options,
        )
        .unwrap();

        let softbuffer_context = softbuffer::Context::new(window.clone()).unwrap();
        let softbuffer_surface =
            softbuffer::Surface::new(&softbuffer_context, window.clone()).unwrap();

        self.window = Some(window);
        self.renderer = Some(renderer);
        self.softbuffer_context = Some(softbuffer_context);
        self.softbuffer_surface = Some(softbuffer_surface);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        let Some(window) = &self.window else { return };
        let Some(renderer) = &mut self.renderer else {
            return;
        };
        let Some(surface) = &mut self.softbuffer_surface else {
            return;
        };
        if window_id != window.id() {
            return;
        }

        match event {
            WindowEvent::CloseRequested => event_loop.exit(),
            WindowEvent::Resized(size) => {
                if size.width > 0 && size.height > 0 {
                    renderer.resize(size.width, size.height).unwrap();
                }
                window.request_redraw();
            }
            WindowEvent::RedrawRequested => {
                let size = window.inner_size();
                if size.width == 0 || size.height == 0 {
                    return;
                }
                self.demo.update(
                    size.width,
                    size.height,
                    self.started_at.elapsed().as_secs_f32(),
                );

                let render_start = Instant::now();
                let stats = renderer
                    .render(&mut self.demo.scene, self.demo.root, &mut self.demo.textures)
                    .unwrap();
                let render_time = render_start.elapsed();
                renderer.backend().present(surface).unwrap();

                self.frame_count += 1;
                if self.frame_count.is_multiple_of(60) {
                    println!(
                        "Frame {}: render {:?}, {} draw calls, {} flushes",
                        self.frame_count, render_time, stats.draw_calls, stats.flushes
                    );
                }
                window.request_redraw();
            }
            _ => {}
        }
    }
}

fn main() {
    init_logging(LoggingConfig::default());
    let event_loop = EventLoop::new().expect("to start an event loop");
    let mut app = App {
        demo: Demo::new(),
        started_at: Instant::now(),
        window: None,
        renderer: None,
        softbuffer_context: None,
        softbuffer_surface: None,
        frame_count: 0,
    };
    event_loop.run_app(&mut app).unwrap();
}
