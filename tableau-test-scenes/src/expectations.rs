/// A single pixel-color expectation to validate after rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelExpectation {
    pub x: u32,
    pub y: u32,
    /// Premultiplied RGBA, as read back from the renderer.
    pub expected: [u8; 4],
    /// Per-channel tolerance for comparison (default 5).
    pub tolerance: u8,
    /// Human-readable label for failure messages.
    pub label: &'static str,
}

impl PixelExpectation {
    pub fn new(x: u32, y: u32, rgba: [u8; 4], label: &'static str) -> Self {
        Self {
            x,
            y,
            expected: rgba,
            tolerance: 5,
            label,
        }
    }

    pub fn with_tolerance(mut self, tolerance: u8) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Convenience: expect a fully opaque color.
    pub fn opaque(x: u32, y: u32, r: u8, g: u8, b: u8, label: &'static str) -> Self {
        Self::new(x, y, [r, g, b, 255], label)
    }

    /// Convenience: expect the opaque black background.
    pub fn background(x: u32, y: u32, label: &'static str) -> Self {
        Self::opaque(x, y, 0, 0, 0, label)
    }

    /// Same expectation shifted by a tile origin.
    pub fn offset(mut self, dx: u32, dy: u32) -> Self {
        self.x += dx;
        self.y += dy;
        self
    }

    /// Whether `actual` is within tolerance on every channel.
    pub fn matches(&self, actual: [u8; 4]) -> bool {
        actual
            .into_iter()
            .zip(self.expected)
            .all(|(actual, expected)| actual.abs_diff(expected) <= self.tolerance)
    }

    /// Looks the pixel up in tightly packed RGBA8 rows and describes any mismatch.
    pub fn check(&self, pixels: &[u8], width: u32, height: u32) -> Result<(), String> {
        if self.x >= width || self.y >= height {
            return Err(format!(
                "[{}] ({}, {}) lies outside canvas {width}x{height}",
                self.label, self.x, self.y
            ));
        }
        let offset = (self.y as usize * width as usize + self.x as usize) * 4;
        let actual: [u8; 4] = pixels
            .get(offset..offset + 4)
            .and_then(|texel| texel.try_into().ok())
            .ok_or_else(|| {
                format!(
                    "[{}] ({}, {}) is past the end of a {}-byte readback",
                    self.label,
                    self.x,
                    self.y,
                    pixels.len()
                )
            })?;
        if self.matches(actual) {
            Ok(())
        } else {
            Err(format!(
                "[{}] ({}, {}) expected premultiplied {:?} within {} but read {:?}",
                self.label, self.x, self.y, self.expected, self.tolerance, actual
            ))
        }
    }
}

/// Checks every expectation against a `read_pixels` buffer; an empty result means all passed.
pub fn check_pixels(
    pixels: &[u8],
    width: u32,
    height: u32,
    expectations: &[PixelExpectation],
) -> Vec<String> {
    expectations
        .iter()
        .filter_map(|expectation| expectation.check(pixels, width, height).err())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tolerance_applies_per_channel() {
        let pixels = [10, 20, 30, 255];
        let close = PixelExpectation::new(0, 0, [12, 18, 30, 255], "close");
        let far = PixelExpectation::new(0, 0, [20, 20, 30, 255], "far");
        assert!(check_pixels(&pixels, 1, 1, &[close]).is_empty());
        assert_eq!(check_pixels(&pixels, 1, 1, &[far]).len(), 1);
    }

    #[test]
    fn outside_the_canvas_is_a_failure() {
        let failures = check_pixels(&[0; 4], 1, 1, &[PixelExpectation::background(1, 0, "edge")]);
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("outside canvas"));
    }

    #[test]
    fn short_buffers_are_reported() {
        let expectation = PixelExpectation::background(1, 1, "short");
        assert!(expectation.check(&[0; 8], 2, 2).is_err());
        assert!(!expectation.matches([0, 0, 0, 0]));
    }
}
