//! Frame orchestration.
//!
//! A [`Renderer`] owns one backend context plus everything that lives on it:
//! the sprite batch buffers, the filter target pool and the programs it
//! compiled. Scenes and texture registries are passed in per call so several
//! renderers can share them.

mod batch;
mod blend;
mod context;
mod filter;
mod mask;
#[cfg(feature = "render_metrics")]
mod metrics;
mod primitive;
mod session;
mod shaders;
mod stencil;
mod types;

pub use blend::BlendMode;
pub use filter::RenderTargetPool;
#[cfg(feature = "render_metrics")]
pub use metrics::{PhaseTimings, RenderLoopMetrics};
pub use types::{FrameStats, RenderTexture};

use crate::backend::GpuBackend;
use crate::color::Color;
use crate::config::RendererOptions;
use crate::error::{GpuError, RenderError};
use crate::filters::builtin_shaders;
use crate::id::{ContextId, NodeId};
use crate::math::{Matrix, Rectangle};
use crate::scene::Scene;
use crate::texture::TextureRegistry;
use batch::SpriteBatch;
use context::{RenderContext, Viewport};
use filter::FilterManager;
use mask::MaskManager;
use primitive::PrimitiveRenderer;
use session::RenderSession;
use shaders::ShaderRegistry;
#[cfg(feature = "render_metrics")]
use std::time::Instant;

/// Draws scenes through one [`GpuBackend`].
///
/// ```
/// use tableau::{Color, Renderer, RendererOptions, Scene, SoftwareBackend, TextureRegistry};
///
/// let options = RendererOptions::new(32, 32).with_background(Color::WHITE);
/// let mut renderer = Renderer::new(SoftwareBackend::new(32, 32), options).unwrap();
/// let mut textures = TextureRegistry::default();
/// let mut scene = Scene::new();
/// let root = scene.create_container();
///
/// let stats = renderer.render(&mut scene, root, &mut textures).unwrap();
/// assert_eq!(stats.draw_calls, 0);
/// ```
#[derive(Debug)]
pub struct Renderer<B: GpuBackend> {
    backend: B,
    options: RendererOptions,
    batch: SpriteBatch,
    primitives: PrimitiveRenderer,
    masks: MaskManager,
    filters: FilterManager,
    shaders: ShaderRegistry,
    context_lost: bool,
    #[cfg(feature = "render_metrics")]
    last_phase_timings: PhaseTimings,
    #[cfg(feature = "render_metrics")]
    frame_rate: metrics::FrameRateTracker,
}

impl<B: GpuBackend> Renderer<B> {
    /// Takes ownership of `backend`, resizing its framebuffer to the
    /// options' physical size and compiling the built-in programs.
    pub fn new(mut backend: B, options: RendererOptions) -> Result<Self, RenderError> {
        let (width, height) = options.physical_size();
        if backend.size() != (width, height) {
            backend.resize(width, height)?;
        }
        let mut shaders = ShaderRegistry::new(backend.context_id());
        for shader in builtin_shaders() {
            shaders.program(&mut backend, &shader)?;
        }
        let mut batch = SpriteBatch::new(options.batch_size);
        batch.init(&mut backend)?;

        tracing::debug!(
            context = %backend.context_id(),
            width,
            height,
            resolution = options.resolution,
            "renderer created"
        );
        Ok(Self {
            backend,
            batch,
            primitives: PrimitiveRenderer::new(),
            masks: MaskManager::default(),
            filters: FilterManager::new(options.filter_pool_limit),
            shaders,
            options,
            context_lost: false,
            #[cfg(feature = "render_metrics")]
            last_phase_timings: PhaseTimings::default(),
            #[cfg(feature = "render_metrics")]
            frame_rate: metrics::FrameRateTracker::default(),
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn options(&self) -> &RendererOptions {
        &self.options
    }

    pub fn context_id(&self) -> ContextId {
        self.backend.context_id()
    }

    /// Offscreen targets held for filters.
    pub fn filter_pool(&self) -> &RenderTargetPool {
        self.filters.pool()
    }

    /// Resizes the main framebuffer to a new logical size.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), RenderError> {
        self.options.width = width;
        self.options.height = height;
        let (physical_width, physical_height) = self.options.physical_size();
        self.backend.resize(physical_width, physical_height)?;
        Ok(())
    }

    /// Whether rendering is suspended until
    /// [`handle_context_restored`](Self::handle_context_restored) is called.
    pub fn context_lost(&self) -> bool {
        self.context_lost || self.backend.is_context_lost()
    }

    /// Updates `root`'s world transforms and draws its subtree into the main framebuffer.
    ///
    /// While the context is lost this does nothing and reports empty stats.
    pub fn render(
        &mut self,
        scene: &mut Scene,
        root: NodeId,
        textures: &mut TextureRegistry,
    ) -> Result<FrameStats, RenderError> {
        if self.suspended() {
            return Ok(FrameStats::default());
        }
        #[cfg(feature = "render_metrics")]
        let started_at = Instant::now();

        scene.update_transform(root)?;

        #[cfg(feature = "render_metrics")]
        let transformed_at = Instant::now();

        let (width, height) = (self.options.width as f32, self.options.height as f32);
        let viewport = Viewport::new(
            None,
            None,
            Rectangle::new(0.0, 0.0, width, height),
            self.backend.size(),
        );
        let clear = self
            .options
            .clear_before_render
            .then(|| self.options.clear_color());
        let resolution = self.options.resolution;
        let result = self.draw_frame(scene, root, textures, viewport, resolution, clear);
        let stats = self.track_context_loss(result)?;

        #[cfg(feature = "render_metrics")]
        {
            let finished_at = Instant::now();
            self.last_phase_timings = PhaseTimings {
                transform: transformed_at - started_at,
                traversal: finished_at - transformed_at,
                total: finished_at - started_at,
            };
            self.frame_rate.record(started_at, finished_at);
        }
        Ok(stats)
    }

    /// Draws `root`'s subtree into `target`.
    ///
    /// World transforms are recomputed with `parent` in place of the root's
    /// real parent; `None` renders the subtree as if it were a scene root.
    /// `clear` wipes the target to transparent first.
    pub fn render_to_texture(
        &mut self,
        scene: &mut Scene,
        root: NodeId,
        textures: &mut TextureRegistry,
        target: &RenderTexture,
        parent: Option<&Matrix>,
        clear: bool,
    ) -> Result<FrameStats, RenderError> {
        if self.suspended() {
            return Ok(FrameStats::default());
        }
        self.check_owner(target)?;
        scene.update_transform_with_parent(root, parent.unwrap_or(&Matrix::IDENTITY))?;

        let (width, height) = target.size();
        let viewport = Viewport::new(
            Some(target.target),
            self.backend.render_target_texture(target.target),
            Rectangle::new(0.0, 0.0, width as f32, height as f32),
            target.physical_size(),
        );
        let clear = clear.then_some(Color::TRANSPARENT);
        let result = self.draw_frame(scene, root, textures, viewport, target.resolution, clear);
        self.track_context_loss(result)
    }

    fn draw_frame(
        &mut self,
        scene: &Scene,
        root: NodeId,
        textures: &mut TextureRegistry,
        viewport: Viewport,
        resolution: f32,
        clear: Option<Color>,
    ) -> Result<FrameStats, RenderError> {
        self.filters.recover(&mut self.backend, &mut self.masks);
        self.masks = MaskManager::default();
        for handle in textures.drain_released(self.backend.context_id()) {
            self.backend.delete_texture(handle);
        }

        self.backend.begin_frame()?;
        self.backend.set_stencil_test(false);
        self.backend.set_color_mask(true);

        let mut ctx = RenderContext::new(
            &mut self.backend,
            textures,
            &mut self.shaders,
            viewport,
            resolution,
        );
        ctx.bind_viewport(viewport)?;
        ctx.set_blend_mode(BlendMode::Normal);
        if let Some(color) = clear {
            let [r, g, b, a] = color.normalize();
            ctx.backend.clear(Some([r * a, g * a, b * a, a]), true)?;
        }

        let mut session = RenderSession::new(
            ctx,
            scene,
            &mut self.batch,
            &mut self.primitives,
            &mut self.masks,
            &mut self.filters,
            self.options.resource_policy,
        );
        session.render_root(root)?;
        let stats = session.ctx.stats;

        self.backend.end_frame()?;
        self.shaders.prune(&mut self.backend);
        tracing::trace!(?stats, "frame rendered");
        Ok(stats)
    }

    fn suspended(&mut self) -> bool {
        if self.backend.is_context_lost() && !self.context_lost {
            tracing::warn!(context = %self.backend.context_id(), "context lost; rendering suspended");
            self.context_lost = true;
        }
        self.context_lost
    }

    fn track_context_loss<T>(&mut self, result: Result<T, RenderError>) -> Result<T, RenderError> {
        if let Err(RenderError::Gpu(GpuError::ContextLost)) = &result {
            self.suspended();
            self.context_lost = true;
        }
        result
    }

    /// Brings the renderer back after its context was restored.
    ///
    /// Every handle from the lost context is dropped without being freed:
    /// base textures re-upload on next use, programs recompile and the
    /// batch buffers are recreated. Render textures must be restored with
    /// [`restore_render_texture`](Self::restore_render_texture).
    pub fn handle_context_restored(
        &mut self,
        textures: &mut TextureRegistry,
    ) -> Result<(), RenderError> {
        if self.backend.is_context_lost() {
            return Err(GpuError::ContextLost.into());
        }
        let context = self.backend.context_id();
        textures.invalidate_context(context);
        let forgotten = self.shaders.forget_all();
        self.batch.forget_buffers();
        self.primitives.forget_buffers();
        self.filters.forget();
        self.masks = MaskManager::default();

        self.batch.init(&mut self.backend)?;
        for shader in builtin_shaders() {
            self.shaders.program(&mut self.backend, &shader)?;
        }
        self.context_lost = false;
        tracing::info!(
            %context,
            programs = forgotten.len(),
            "renderer restored after context loss"
        );
        Ok(())
    }

    /// Creates an offscreen target of logical size `width`×`height` that sprites can sample.
    pub fn create_render_texture(
        &mut self,
        textures: &mut TextureRegistry,
        width: u32,
        height: u32,
        resolution: f32,
    ) -> Result<RenderTexture, RenderError> {
        let resolution = if resolution.is_finite() && resolution > 0.0 {
            resolution
        } else {
            1.0
        };
        let (physical_width, physical_height) = types::physical_size(width, height, resolution);
        let target = self
            .backend
            .create_render_target(physical_width, physical_height)?;
        let Some(handle) = self.backend.render_target_texture(target) else {
            self.backend.delete_render_target(target);
            return Err(GpuError::UnknownHandle {
                kind: "render target",
                handle: target.0,
            }
            .into());
        };
        let context = self.backend.context_id();
        let base = textures.add_render_target_texture(
            context,
            handle,
            physical_width,
            physical_height,
            resolution,
        );
        let texture = match textures.add_texture(base, None) {
            Ok(texture) => texture,
            Err(error) => {
                textures.destroy_base_texture(base).ok();
                self.backend.delete_render_target(target);
                return Err(error.into());
            }
        };
        tracing::debug!(%context, width, height, resolution, "render texture created");
        Ok(RenderTexture {
            context,
            target,
            base,
            texture,
            width,
            height,
            resolution,
        })
    }

    /// Resizes in place; the previous contents are discarded.
    pub fn resize_render_texture(
        &mut self,
        textures: &mut TextureRegistry,
        render_texture: &mut RenderTexture,
        width: u32,
        height: u32,
    ) -> Result<(), RenderError> {
        self.check_owner(render_texture)?;
        let (physical_width, physical_height) =
            types::physical_size(width, height, render_texture.resolution);
        self.backend
            .resize_render_target(render_texture.target, physical_width, physical_height)?;
        let handle = self
            .backend
            .render_target_texture(render_texture.target)
            .ok_or(GpuError::UnknownHandle {
                kind: "render target",
                handle: render_texture.target.0,
            })?;
        textures.resize_render_target_texture(
            render_texture.base,
            handle,
            physical_width,
            physical_height,
        )?;
        render_texture.width = width;
        render_texture.height = height;
        Ok(())
    }

    /// Recreates a render texture's target after context loss. Contents start transparent.
    pub fn restore_render_texture(
        &mut self,
        textures: &mut TextureRegistry,
        render_texture: &mut RenderTexture,
    ) -> Result<(), RenderError> {
        self.check_owner(render_texture)?;
        let (physical_width, physical_height) = render_texture.physical_size();
        let target = self
            .backend
            .create_render_target(physical_width, physical_height)?;
        let handle = self
            .backend
            .render_target_texture(target)
            .ok_or(GpuError::UnknownHandle {
                kind: "render target",
                handle: target.0,
            })?;
        textures.resize_render_target_texture(
            render_texture.base,
            handle,
            physical_width,
            physical_height,
        )?;
        render_texture.target = target;
        Ok(())
    }

    /// Frees the target and removes its textures from the registry.
    pub fn destroy_render_texture(
        &mut self,
        textures: &mut TextureRegistry,
        render_texture: RenderTexture,
    ) -> Result<(), RenderError> {
        self.check_owner(&render_texture)?;
        textures.destroy_texture(render_texture.texture)?;
        textures.destroy_base_texture(render_texture.base)?;
        self.backend.delete_render_target(render_texture.target);
        Ok(())
    }

    fn check_owner(&self, render_texture: &RenderTexture) -> Result<(), GpuError> {
        if render_texture.context != self.backend.context_id() {
            return Err(GpuError::UnknownHandle {
                kind: "render target",
                handle: render_texture.target.0,
            });
        }
        Ok(())
    }

    /// Copies the main framebuffer into `out` as tightly packed RGBA8,
    /// returning its physical size.
    pub fn read_pixels(&mut self, out: &mut Vec<u8>) -> Result<(u32, u32), RenderError> {
        let size = self.backend.read_pixels(out);
        self.track_context_loss(size.map_err(RenderError::from))
    }

    /// Frees every resource this renderer created and hands the backend back.
    ///
    /// Base textures keep their pixels; their handles for this context are
    /// released and the registry forgets the context.
    pub fn destroy(mut self, textures: &mut TextureRegistry) -> B {
        let context = self.backend.context_id();
        for handle in textures.release_context(context) {
            self.backend.delete_texture(handle);
        }
        for program in self.shaders.forget_all() {
            self.backend.delete_program(program);
        }
        self.batch.destroy(&mut self.backend);
        self.primitives.destroy(&mut self.backend);
        self.filters.destroy(&mut self.backend);
        tracing::debug!(%context, "renderer destroyed");
        self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendCall, SoftwareBackend};
    use crate::texture::ImageSource;

    fn renderer(width: u32, height: u32) -> Renderer<SoftwareBackend> {
        let options = RendererOptions::new(width, height).with_background(Color::BLACK);
        Renderer::new(SoftwareBackend::new(width, height), options).unwrap()
    }

    fn sprite_scene(textures: &mut TextureRegistry) -> (Scene, NodeId) {
        let base = textures.add_base_texture(
            ImageSource::solid(4, 4, [255, 0, 0, 255]),
            Default::default(),
        );
        let texture = textures.add_texture(base, None).unwrap();
        let mut scene = Scene::new();
        let root = scene.create_container();
        let sprite = scene.create_sprite(texture);
        scene.add_child(root, sprite).unwrap();
        (scene, root)
    }

    #[test]
    fn stale_root_is_an_error() {
        let mut renderer = renderer(8, 8);
        let mut textures = TextureRegistry::default();
        let mut scene = Scene::new();
        let root = scene.create_container();
        scene.destroy(root).unwrap();
        assert!(renderer.render(&mut scene, root, &mut textures).is_err());
    }

    #[test]
    fn clears_to_the_background() {
        let mut renderer = renderer(4, 4);
        let mut textures = TextureRegistry::default();
        let mut scene = Scene::new();
        let root = scene.create_container();
        renderer.render(&mut scene, root, &mut textures).unwrap();
        assert_eq!(renderer.backend().pixel(2, 2), Some([0, 0, 0, 255]));
    }

    #[test]
    fn lost_context_suspends_rendering_until_restored() {
        let mut renderer = renderer(8, 8);
        let mut textures = TextureRegistry::default();
        let (mut scene, root) = sprite_scene(&mut textures);
        renderer.render(&mut scene, root, &mut textures).unwrap();

        renderer.backend_mut().lose_context();
        renderer.backend_mut().clear_calls();
        let stats = renderer.render(&mut scene, root, &mut textures).unwrap();
        assert_eq!(stats, FrameStats::default());
        assert!(renderer.context_lost());
        assert!(renderer.backend().calls().is_empty());

        renderer.backend_mut().restore_context();
        renderer.handle_context_restored(&mut textures).unwrap();
        assert!(!renderer.context_lost());
        let stats = renderer.render(&mut scene, root, &mut textures).unwrap();
        assert_eq!(stats.texture_uploads, 1);
        assert_eq!(stats.draw_calls, 1);
        assert_eq!(renderer.backend().pixel(0, 0), Some([255, 0, 0, 255]));
    }

    #[test]
    fn render_texture_can_be_sampled_after_drawing_into_it() {
        let mut renderer = renderer(8, 8);
        let mut textures = TextureRegistry::default();
        let (mut scene, root) = sprite_scene(&mut textures);
        let render_texture = renderer
            .create_render_texture(&mut textures, 4, 4, 1.0)
            .unwrap();
        renderer
            .render_to_texture(&mut scene, root, &mut textures, &render_texture, None, true)
            .unwrap();

        let mut display = Scene::new();
        let display_root = display.create_container();
        let sprite = display.create_sprite(render_texture.texture());
        display.add_child(display_root, sprite).unwrap();
        display.get_mut(sprite).unwrap().transform.position.set(4.0, 4.0);
        renderer
            .render(&mut display, display_root, &mut textures)
            .unwrap();
        assert_eq!(renderer.backend().pixel(5, 5), Some([255, 0, 0, 255]));
        assert_eq!(renderer.backend().pixel(1, 1), Some([0, 0, 0, 255]));

        renderer
            .destroy_render_texture(&mut textures, render_texture)
            .unwrap();
        assert_eq!(renderer.backend().live_render_targets(), 0);
    }

    #[test]
    fn destroy_frees_everything_it_created() {
        let mut renderer = renderer(8, 8);
        let mut textures = TextureRegistry::default();
        let (mut scene, root) = sprite_scene(&mut textures);
        renderer.render(&mut scene, root, &mut textures).unwrap();

        let backend = renderer.destroy(&mut textures);
        assert_eq!(backend.live_textures(), 0);
        assert_eq!(backend.live_buffers(), 0);
        assert_eq!(backend.live_render_targets(), 0);
        assert!(textures.contexts_with_uploads().is_empty());
        assert!(backend
            .calls()
            .iter()
            .any(|call| matches!(call, BackendCall::DeleteProgram(_))));
    }
}
