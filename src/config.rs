use crate::color::Color;
use std::sync::Once;

/// What to do when a texture frame or atlas lookup is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourcePolicy {
    /// Return an error to the caller.
    Strict,
    /// Log a warning, mark the texture invalid and skip drawing it.
    Lenient,
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::Strict
        } else {
            Self::Lenient
        }
    }
}

/// Most quads a single batch can hold; four vertices each must be addressable by `u16` indices.
pub const MAX_BATCH_SIZE: usize = (u16::MAX as usize + 1) / 4;

pub const DEFAULT_BATCH_SIZE: usize = 2000;

pub const DEFAULT_FILTER_POOL_LIMIT: usize = 8;

/// Options for constructing a [`Renderer`](crate::Renderer).
///
/// ```
/// use tableau::{Color, RendererOptions};
///
/// let options = RendererOptions::new(800, 600)
///     .with_resolution(2.0)
///     .with_background(Color::BLACK)
///     .with_batch_size(500);
/// assert_eq!(options.physical_size(), (1600, 1200));
/// ```
#[derive(Debug, Clone)]
pub struct RendererOptions {
    /// Logical width of the main framebuffer.
    pub width: u32,
    /// Logical height of the main framebuffer.
    pub height: u32,
    /// Device pixels per logical pixel.
    pub resolution: f32,
    pub background: Color,
    /// When set, the framebuffer is cleared to transparent instead of `background`.
    pub transparent: bool,
    pub clear_before_render: bool,
    /// Quads per batch before an implicit flush.
    pub batch_size: usize,
    /// Idle offscreen targets kept by the filter pool.
    pub filter_pool_limit: usize,
    pub resource_policy: ResourcePolicy,
}

impl RendererOptions {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            resolution: 1.0,
            background: Color::BLACK,
            transparent: false,
            clear_before_render: true,
            batch_size: DEFAULT_BATCH_SIZE,
            filter_pool_limit: DEFAULT_FILTER_POOL_LIMIT,
            resource_policy: ResourcePolicy::default(),
        }
    }

    pub fn with_resolution(mut self, resolution: f32) -> Self {
        self.resolution = if resolution.is_finite() && resolution > 0.0 {
            resolution
        } else {
            1.0
        };
        self
    }

    pub fn with_background(mut self, background: Color) -> Self {
        self.background = background;
        self
    }

    pub fn with_transparent(mut self, transparent: bool) -> Self {
        self.transparent = transparent;
        self
    }

    pub fn with_clear_before_render(mut self, clear: bool) -> Self {
        self.clear_before_render = clear;
        self
    }

    /// Clamped to `1..=MAX_BATCH_SIZE`.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    pub fn with_filter_pool_limit(mut self, limit: usize) -> Self {
        self.filter_pool_limit = limit;
        self
    }

    pub fn with_resource_policy(mut self, policy: ResourcePolicy) -> Self {
        self.resource_policy = policy;
        self
    }

    pub fn physical_size(&self) -> (u32, u32) {
        (
            (self.width as f32 * self.resolution).round() as u32,
            (self.height as f32 * self.resolution).round() as u32,
        )
    }

    pub(crate) fn clear_color(&self) -> Color {
        if self.transparent {
            Color::TRANSPARENT
        } else {
            self.background
        }
    }
}

/// Logger configuration.
///
/// `env_filter` follows the `env_logger` filter syntax (e.g. "info",
/// "tableau=debug,wgpu=warn"). Without it, `RUST_LOG` is used, then "warn".
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub env_filter: Option<String>,
    pub write_style: env_logger::WriteStyle,
    pub is_test: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            env_filter: None,
            write_style: env_logger::WriteStyle::Auto,
            is_test: false,
        }
    }
}

static INIT_LOGGING: Once = Once::new();

/// Installs `env_logger` as the global logger. Later calls are ignored.
///
/// Library code logs through `tracing`, whose `log` feature forwards
/// events here when no tracing subscriber is installed.
pub fn init_logging(config: LoggingConfig) {
    INIT_LOGGING.call_once(|| {
        let mut builder = env_logger::Builder::new();

        if let Some(filter) = config.env_filter {
            builder.parse_filters(&filter);
        } else if let Ok(filter) = std::env::var("RUST_LOG") {
            builder.parse_filters(&filter);
        } else {
            builder.parse_filters("warn");
        }

        builder.write_style(config.write_style);
        builder.is_test(config.is_test);

        if builder.try_init().is_err() {
            // Someone else already installed a logger.
            return;
        }

        tracing::debug!("logging initialized");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_size_is_clamped() {
        assert_eq!(RendererOptions::new(1, 1).with_batch_size(0).batch_size, 1);
        assert_eq!(
            RendererOptions::new(1, 1).with_batch_size(usize::MAX).batch_size,
            MAX_BATCH_SIZE
        );
    }

    #[test]
    fn invalid_resolution_falls_back_to_one() {
        let options = RendererOptions::new(10, 10).with_resolution(f32::NAN);
        assert_eq!(options.resolution, 1.0);
    }

    #[test]
    fn transparent_clears_to_transparent() {
        let options = RendererOptions::new(10, 10)
            .with_background(Color::WHITE)
            .with_transparent(true);
        assert_eq!(options.clear_color(), Color::TRANSPARENT);
    }
}
