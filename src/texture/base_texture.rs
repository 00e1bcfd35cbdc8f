use crate::backend::TextureHandle;
use crate::error::TextureError;
use crate::id::ContextId;
use ahash::AHashMap;

/// Sampling filter used when a texture is scaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ScaleMode {
    #[default]
    Linear,
    Nearest,
}

/// Decoded RGBA8 pixels supplied by an asset loader.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageSource {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl ImageSource {
    /// Wraps straight-alpha RGBA8 pixels, row-major, top row first.
    pub fn from_rgba8(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, TextureError> {
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected {
            return Err(TextureError::InvalidImageData {
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// A single-colour image, mostly useful for tests and placeholders.
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let pixels = rgba
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 4)
            .collect();
        Self {
            width,
            height,
            pixels,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

/// Multiplies colour channels by alpha in place.
pub(crate) fn premultiply_rgba8_inplace(pixels: &mut [u8]) {
    for px in pixels.chunks_exact_mut(4) {
        let a = px[3] as u16;
        if a == 255 {
            continue;
        }
        px[0] = ((px[0] as u16 * a + 127) / 255) as u8;
        px[1] = ((px[1] as u16 * a + 127) / 255) as u8;
        px[2] = ((px[2] as u16 * a + 127) / 255) as u8;
    }
}

/// Where a base texture's pixels live.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TextureData {
    /// Nothing loaded yet.
    Pending,
    /// CPU pixels, premultiplied, uploaded lazily per context.
    Pixels(Vec<u8>),
    /// Pixels only exist on one context, as a render target's colour texture.
    RenderTarget(ContextId),
}

/// The shared backing store for one image source.
///
/// Each GPU context gets its own handle and its own dirty flag, so several
/// renderers can sample the same image without interfering with each other's
/// uploads.
#[derive(Debug)]
pub struct BaseTexture {
    pub(crate) data: TextureData,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub resolution: f32,
    pub scale_mode: ScaleMode,
    /// Textures that never render on their own; see [`BaseTexture::skip_render`].
    pub(crate) skip_render: bool,
    pub(crate) source_key: Option<String>,
    handles: AHashMap<ContextId, TextureHandle>,
    dirty: AHashMap<ContextId, bool>,
}

impl BaseTexture {
    pub(crate) fn new(resolution: f32, scale_mode: ScaleMode) -> Self {
        Self {
            data: TextureData::Pending,
            width: 0,
            height: 0,
            resolution,
            scale_mode,
            skip_render: false,
            source_key: None,
            handles: AHashMap::new(),
            dirty: AHashMap::new(),
        }
    }

    /// Logical units per source pixel; non-positive resolutions count as 1.
    pub fn logical_scale(&self) -> f32 {
        if self.resolution.is_finite() && self.resolution > 0.0 {
            1.0 / self.resolution
        } else {
            1.0
        }
    }

    pub(crate) fn set_source(&mut self, source: ImageSource) {
        let ImageSource {
            width,
            height,
            mut pixels,
        } = source;
        premultiply_rgba8_inplace(&mut pixels);
        self.width = width;
        self.height = height;
        self.data = TextureData::Pixels(pixels);
        self.mark_dirty();
    }

    /// Pixel width, zero until loaded.
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn has_loaded(&self) -> bool {
        !matches!(self.data, TextureData::Pending) && self.width > 0 && self.height > 0
    }

    /// Placeholder textures that should not break sprite batches or draw anything.
    pub fn skip_render(&self) -> bool {
        self.skip_render
    }

    pub fn source_key(&self) -> Option<&str> {
        self.source_key.as_deref()
    }

    pub(crate) fn pixels(&self) -> Option<&[u8]> {
        match &self.data {
            TextureData::Pixels(pixels) => Some(pixels),
            _ => None,
        }
    }

    /// Whether `context` can sample this texture, possibly after an upload.
    pub fn is_available_on(&self, context: ContextId) -> bool {
        match self.data {
            TextureData::Pending => false,
            TextureData::Pixels(_) => self.has_loaded(),
            TextureData::RenderTarget(owner) => owner == context && self.handles.contains_key(&owner),
        }
    }

    /// Marks every context stale so each re-uploads before the next bind.
    pub fn mark_dirty(&mut self) {
        for flag in self.dirty.values_mut() {
            *flag = true;
        }
    }

    /// Contexts that never uploaded this texture count as dirty.
    pub fn is_dirty(&self, context: ContextId) -> bool {
        self.dirty.get(&context).copied().unwrap_or(true)
    }

    pub fn handle(&self, context: ContextId) -> Option<TextureHandle> {
        self.handles.get(&context).copied()
    }

    pub(crate) fn set_uploaded(&mut self, context: ContextId, handle: TextureHandle) {
        self.handles.insert(context, handle);
        self.dirty.insert(context, false);
    }

    /// Forgets a context's handle without freeing it; used after context loss.
    pub(crate) fn forget_context(&mut self, context: ContextId) -> Option<TextureHandle> {
        self.dirty.remove(&context);
        self.handles.remove(&context)
    }

    pub(crate) fn take_handles(&mut self) -> Vec<(ContextId, TextureHandle)> {
        self.dirty.clear();
        self.handles.drain().collect()
    }

    #[cfg(test)]
    pub(crate) fn contexts(&self) -> impl Iterator<Item = ContextId> + '_ {
        self.handles.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_rgba8_validates_length() {
        let err = ImageSource::from_rgba8(2, 2, vec![0; 15]).unwrap_err();
        assert_eq!(
            err,
            TextureError::InvalidImageData {
                expected: 16,
                actual: 15
            }
        );
    }

    #[test]
    fn premultiply_scales_color_by_alpha() {
        let mut pixels = vec![255, 128, 0, 128, 10, 20, 30, 255];
        premultiply_rgba8_inplace(&mut pixels);
        assert_eq!(pixels, vec![128, 64, 0, 128, 10, 20, 30, 255]);
    }

    #[test]
    fn dirty_flags_are_per_context() {
        let mut base = BaseTexture::new(1.0, ScaleMode::Linear);
        base.set_source(ImageSource::solid(2, 2, [255, 0, 0, 255]));
        let a = ContextId(1000);
        let b = ContextId(1001);
        assert!(base.is_dirty(a));

        base.set_uploaded(a, TextureHandle(1));
        assert!(!base.is_dirty(a));
        assert!(base.is_dirty(b));

        base.set_uploaded(b, TextureHandle(7));
        base.mark_dirty();
        assert!(base.is_dirty(a));
        assert!(base.is_dirty(b));
        assert_eq!(base.handle(a), Some(TextureHandle(1)));
    }

    #[test]
    fn pending_texture_is_unavailable() {
        let base = BaseTexture::new(1.0, ScaleMode::Linear);
        assert!(!base.has_loaded());
        assert!(!base.is_available_on(ContextId(0)));
    }
}
