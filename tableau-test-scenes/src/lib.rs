pub mod expectations;
pub mod scene;

pub use expectations::{check_pixels, PixelExpectation};
pub use scene::{build_main_scene, TestScene, CANVAS_HEIGHT, CANVAS_WIDTH};
