/// Represents a color in RGBA format.
///
/// Each channel is an 8-bit unsigned integer. Colors are straight (not
/// premultiplied) until they are packed into vertex data.
///
/// # Examples
///
/// ```
/// use tableau::Color;
///
/// let red = Color::rgb(255, 0, 0);
/// assert_eq!(red.normalize(), [1.0, 0.0, 0.0, 1.0]);
///
/// // 0xRRGGBB tints, as used by sprites.
/// let tint = Color::from_hex(0x00ff80);
/// assert_eq!(tint.to_array(), [0, 255, 128, 255]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Color(pub [u8; 4]);

impl Color {
    /// A transparent color.
    pub const TRANSPARENT: Self = Self([0, 0, 0, 0]);
    /// A black color.
    pub const BLACK: Self = Self([0, 0, 0, 255]);
    /// A white color. Also the neutral sprite tint.
    pub const WHITE: Self = Self([255, 255, 255, 255]);

    /// Creates a new color with the specified RGB values and full opacity.
    ///
    /// ```
    /// use tableau::Color;
    ///
    /// let green = Color::rgb(0, 255, 0);
    /// assert_eq!(green, Color([0, 255, 0, 255]));
    /// ```
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self([r, g, b, 255])
    }

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self([r, g, b, a])
    }

    /// Builds an opaque color from a `0xRRGGBB` value.
    pub const fn from_hex(hex: u32) -> Self {
        Self([
            ((hex >> 16) & 0xff) as u8,
            ((hex >> 8) & 0xff) as u8,
            (hex & 0xff) as u8,
            255,
        ])
    }

    /// Normalizes the color values to the range [0.0, 1.0].
    pub fn normalize(&self) -> [f32; 4] {
        [
            self.0[0] as f32 / 255.0,
            self.0[1] as f32 / 255.0,
            self.0[2] as f32 / 255.0,
            self.0[3] as f32 / 255.0,
        ]
    }

    pub fn to_array(&self) -> [u8; 4] {
        self.0
    }

    /// Packs this tint with the given alpha into premultiplied RGBA8, laid out so
    /// that the first byte in memory is red.
    ///
    /// The color's own alpha channel is multiplied in as well.
    ///
    /// ```
    /// use tableau::Color;
    ///
    /// let packed = Color::WHITE.pack_premultiplied(0.5);
    /// assert_eq!(packed.to_le_bytes(), [128, 128, 128, 128]);
    /// ```
    pub fn pack_premultiplied(&self, alpha: f32) -> u32 {
        let alpha = (alpha.clamp(0.0, 1.0) * self.0[3] as f32 / 255.0).clamp(0.0, 1.0);
        let channel = |value: u8| (value as f32 * alpha).round() as u32;
        let a = (alpha * 255.0).round() as u32;
        channel(self.0[0]) | (channel(self.0[1]) << 8) | (channel(self.0[2]) << 16) | (a << 24)
    }
}

impl From<[u8; 4]> for Color {
    fn from(value: [u8; 4]) -> Self {
        Self(value)
    }
}
