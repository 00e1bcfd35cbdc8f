//! Base textures, texture frames and the registry that owns them.

mod base_texture;
mod registry;
#[allow(clippy::module_inception)]
mod texture;

pub use base_texture::{BaseTexture, ImageSource, ScaleMode};
pub use registry::{BaseTextureOptions, TextureRegistry};
pub use texture::{Texture, TextureUvs, Trim};
