//! Retained-mode 2D scene-graph renderer.
//!
//! Build a [`Scene`] of sprites, graphics, strips and containers, register
//! images with a [`TextureRegistry`], and draw it with a [`Renderer`] over any
//! [`GpuBackend`]. Nodes can be masked by a graphics node and post-processed
//! through a chain of [`Filter`]s.
//!
//! ```no_run
//! use tableau::{Color, ImageSource, Renderer, RendererOptions, Scene, SoftwareBackend, TextureRegistry};
//!
//! let mut textures = TextureRegistry::default();
//! let base = textures.add_base_texture(ImageSource::solid(4, 4, [255, 0, 0, 255]), Default::default());
//! let texture = textures.add_texture(base, None).unwrap();
//!
//! let mut scene = Scene::new();
//! let root = scene.create_container();
//! let sprite = scene.create_sprite(texture);
//! scene.add_child(root, sprite).unwrap();
//!
//! let options = RendererOptions::new(64, 64).with_background(Color::BLACK);
//! let mut renderer = Renderer::new(SoftwareBackend::new(64, 64), options).unwrap();
//! let stats = renderer.render(&mut scene, root, &mut textures).unwrap();
//! assert_eq!(stats.draw_calls, 1);
//! ```

pub use wgpu;

mod arena;
mod backend;
mod cache;
mod color;
mod config;
mod error;
mod filters;
mod id;
mod math;
mod renderer;
mod scene;
mod texture;

pub use backend::{
    BackendCall, BackendStats, BlendFactor, BlendFunc, BufferHandle, BufferKind, CompareFunction,
    DrawRecord, FragmentInput, GpuBackend, ProgramHandle, ProgramSource, RasterFragment,
    RenderTargetHandle, SoftwareBackend, SpriteVertex, StencilOp, TextureHandle, Topology,
    Uniforms, WgpuBackend, MAX_SHADER_PARAMS,
};
pub use color::Color;
pub use config::{
    init_logging, LoggingConfig, RendererOptions, ResourcePolicy, DEFAULT_BATCH_SIZE,
    DEFAULT_FILTER_POOL_LIMIT, MAX_BATCH_SIZE,
};
pub use error::{FilterError, GpuError, RenderError, SceneError, TextureError};
pub use filters::{AlphaFilter, BlurFilter, ColorMatrixFilter, Filter, FilterPass, Shader};
pub use id::{BaseTextureId, ContextId, NodeId, ShaderId, TextureId};
pub use math::{Matrix, Point, Rectangle};
#[cfg(feature = "render_metrics")]
pub use renderer::{PhaseTimings, RenderLoopMetrics};
pub use renderer::{BlendMode, FrameStats, RenderTargetPool, RenderTexture, Renderer};
pub use scene::{
    is_convex, Graphics, GraphicsFill, Node, NodeKind, Renderable, Scene, Shape, Sprite, Strip,
    Transform, Transformable,
};
pub use texture::{
    BaseTexture, BaseTextureOptions, ImageSource, ScaleMode, Texture, TextureRegistry, TextureUvs,
    Trim,
};
