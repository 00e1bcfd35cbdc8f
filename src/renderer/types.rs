use crate::backend::RenderTargetHandle;
use crate::id::{BaseTextureId, ContextId, TextureId};

/// Counters for one call to [`Renderer::render`](super::Renderer::render).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Every indexed draw, including mask stamps and filter passes.
    pub draw_calls: u32,
    /// Sprite batch flushes that had something queued.
    pub flushes: u32,
    /// Sprites queued into the batch.
    pub sprites: u32,
    pub masks_pushed: u32,
    pub filters_applied: u32,
    /// Base texture uploads performed for this renderer's context.
    pub texture_uploads: u32,
}

impl FrameStats {
    pub fn accumulate(&mut self, other: &Self) {
        self.draw_calls += other.draw_calls;
        self.flushes += other.flushes;
        self.sprites += other.sprites;
        self.masks_pushed += other.masks_pushed;
        self.filters_applied += other.filters_applied;
        self.texture_uploads += other.texture_uploads;
    }
}

/// An offscreen target that can be drawn into and then sampled as a texture.
///
/// Belongs to the renderer that created it: its pixels live in that
/// renderer's context only, and other renderers skip sprites that use it.
#[derive(Debug)]
pub struct RenderTexture {
    pub(crate) context: ContextId,
    pub(crate) target: RenderTargetHandle,
    pub(crate) base: BaseTextureId,
    pub(crate) texture: TextureId,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) resolution: f32,
}

impl RenderTexture {
    /// The frame to hand to sprites.
    pub fn texture(&self) -> TextureId {
        self.texture
    }

    pub fn base_texture(&self) -> BaseTextureId {
        self.base
    }

    /// Logical size.
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn resolution(&self) -> f32 {
        self.resolution
    }

    pub(crate) fn physical_size(&self) -> (u32, u32) {
        physical_size(self.width, self.height, self.resolution)
    }
}

pub(crate) fn physical_size(width: u32, height: u32, resolution: f32) -> (u32, u32) {
    (
        ((width as f32 * resolution).round() as u32).max(1),
        ((height as f32 * resolution).round() as u32).max(1),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_accumulate_field_by_field() {
        let mut total = FrameStats::default();
        let frame = FrameStats {
            draw_calls: 3,
            flushes: 2,
            sprites: 10,
            masks_pushed: 1,
            filters_applied: 1,
            texture_uploads: 4,
        };
        total.accumulate(&frame);
        total.accumulate(&frame);
        assert_eq!(total.draw_calls, 6);
        assert_eq!(total.sprites, 20);
        assert_eq!(total.texture_uploads, 8);
    }

    #[test]
    fn physical_size_never_collapses_to_zero() {
        assert_eq!(physical_size(0, 3, 1.0), (1, 3));
        assert_eq!(physical_size(10, 10, 1.5), (15, 15));
    }
}
