use crate::id::BaseTextureId;
use crate::math::Rectangle;

/// Corner UVs, clockwise from the top-left of the frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TextureUvs {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub x3: f32,
    pub y3: f32,
}

impl TextureUvs {
    pub fn corners(&self) -> [[f32; 2]; 4] {
        [
            [self.x0, self.y0],
            [self.x1, self.y1],
            [self.x2, self.y2],
            [self.x3, self.y3],
        ]
    }
}

/// Placement of a trimmed atlas frame inside its original, untrimmed image.
///
/// `x`/`y` is where the stored pixels start within the original image and
/// `width`/`height` is the original image size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trim {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// A rectangular view into a [`BaseTexture`](crate::BaseTexture).
///
/// Textures are created and updated through the
/// [`TextureRegistry`](crate::TextureRegistry), which keeps the UVs in step with
/// the base texture's dimensions.
#[derive(Debug, Clone)]
pub struct Texture {
    pub(crate) base: BaseTextureId,
    /// Pixels sampled from the base texture.
    pub(crate) crop: Rectangle,
    pub(crate) trim: Option<Trim>,
    /// Frame follows the whole base texture, including when it reloads.
    pub(crate) no_frame: bool,
    pub(crate) uvs: TextureUvs,
    pub(crate) valid: bool,
    pub(crate) name: Option<String>,
}

impl Texture {
    pub(crate) fn new(base: BaseTextureId, crop: Option<Rectangle>) -> Self {
        Self {
            base,
            crop: crop.unwrap_or(Rectangle::EMPTY),
            trim: None,
            no_frame: crop.is_none(),
            uvs: TextureUvs::default(),
            valid: false,
            name: None,
        }
    }

    pub fn base(&self) -> BaseTextureId {
        self.base
    }

    /// The region of the base texture that is sampled.
    pub fn crop(&self) -> Rectangle {
        self.crop
    }

    pub fn trim(&self) -> Option<Trim> {
        self.trim
    }

    /// Displayed width; the untrimmed width for trimmed frames.
    pub fn width(&self) -> f32 {
        self.trim.map(|trim| trim.width).unwrap_or(self.crop.width)
    }

    pub fn height(&self) -> f32 {
        self.trim.map(|trim| trim.height).unwrap_or(self.crop.height)
    }

    /// The untrimmed frame: crop position with the displayed size.
    pub fn frame(&self) -> Rectangle {
        Rectangle::new(self.crop.x, self.crop.y, self.width(), self.height())
    }

    pub fn uvs(&self) -> TextureUvs {
        self.uvs
    }

    /// False until the base texture has loaded and the frame fits inside it.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Recomputes UVs against the base texture's pixel size.
    ///
    /// Zero-sized bases or frames produce all-zero UVs and an invalid texture
    /// instead of dividing by zero.
    pub(crate) fn update_uvs(&mut self, base_width: u32, base_height: u32) {
        if base_width == 0 || base_height == 0 || self.crop.is_empty() {
            self.uvs = TextureUvs::default();
            self.valid = false;
            return;
        }
        let tw = base_width as f32;
        let th = base_height as f32;
        let frame = self.crop;
        let x0 = frame.x / tw;
        let y0 = frame.y / th;
        let x1 = frame.right() / tw;
        let y2 = frame.bottom() / th;
        self.uvs = TextureUvs {
            x0,
            y0,
            x1,
            y1: y0,
            x2: x1,
            y2,
            x3: x0,
            y3: y2,
        };
    }

    /// Local corners `(w1, h1, w0, h0)` of a quad drawn with this texture at
    /// `anchor`, in logical units: pixel extents times `scale`, the base
    /// texture's [`logical_scale`](super::BaseTexture::logical_scale).
    pub(crate) fn quad_extents(
        &self,
        anchor_x: f32,
        anchor_y: f32,
        scale: f32,
    ) -> (f32, f32, f32, f32) {
        let (w1, h1, w0, h0) = match self.trim {
            Some(trim) => {
                let w1 = trim.x - anchor_x * trim.width;
                let h1 = trim.y - anchor_y * trim.height;
                (w1, h1, w1 + self.crop.width, h1 + self.crop.height)
            }
            None => {
                let width = self.crop.width;
                let height = self.crop.height;
                (
                    -anchor_x * width,
                    -anchor_y * height,
                    width * (1.0 - anchor_x),
                    height * (1.0 - anchor_y),
                )
            }
        };
        (w1 * scale, h1 * scale, w0 * scale, h0 * scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ArenaKey;

    fn texture(frame: Rectangle) -> Texture {
        Texture::new(BaseTextureId::from_parts(0, 0), Some(frame))
    }

    #[test]
    fn uvs_divide_frame_edges_by_base_size() {
        let mut t = texture(Rectangle::new(16.0, 32.0, 32.0, 16.0));
        t.update_uvs(64, 128);
        let uvs = t.uvs();
        assert_eq!((uvs.x0, uvs.y0), (0.25, 0.25));
        assert_eq!((uvs.x1, uvs.y1), (0.75, 0.25));
        assert_eq!((uvs.x2, uvs.y2), (0.75, 0.375));
        assert_eq!((uvs.x3, uvs.y3), (0.25, 0.375));
    }

    #[test]
    fn zero_sized_base_gives_zero_uvs() {
        let mut t = texture(Rectangle::new(0.0, 0.0, 4.0, 4.0));
        t.valid = true;
        t.update_uvs(0, 10);
        assert_eq!(t.uvs(), TextureUvs::default());
        assert!(!t.is_valid());
    }

    #[test]
    fn trim_reports_untrimmed_size() {
        let mut t = texture(Rectangle::new(0.0, 0.0, 10.0, 6.0));
        t.trim = Some(Trim {
            x: 3.0,
            y: 2.0,
            width: 20.0,
            height: 12.0,
        });
        assert_eq!(t.width(), 20.0);
        assert_eq!(t.height(), 12.0);
        assert_eq!(t.crop().width, 10.0);

        let (w1, h1, w0, h0) = t.quad_extents(0.5, 0.5, 1.0);
        assert_eq!((w1, h1, w0, h0), (-7.0, -4.0, 3.0, 2.0));
    }

    #[test]
    fn untrimmed_extents_follow_anchor() {
        let t = texture(Rectangle::new(0.0, 0.0, 10.0, 20.0));
        assert_eq!(t.quad_extents(0.0, 0.0, 1.0), (0.0, 0.0, 10.0, 20.0));
        assert_eq!(t.quad_extents(1.0, 0.5, 1.0), (-10.0, -10.0, 0.0, 10.0));
    }

    #[test]
    fn high_resolution_frames_shrink_to_logical_size() {
        let t = texture(Rectangle::new(0.0, 0.0, 10.0, 20.0));
        assert_eq!(t.quad_extents(0.5, 0.0, 0.5), (-2.5, 0.0, 2.5, 10.0));
    }
}
