use super::base_texture::{BaseTexture, ImageSource, ScaleMode, TextureData};
use super::texture::{Texture, Trim};
use crate::arena::Arena;
use crate::backend::TextureHandle;
use crate::config::ResourcePolicy;
use crate::error::TextureError;
use crate::id::{BaseTextureId, ContextId, TextureId};
use crate::math::Rectangle;
use ahash::AHashMap;

/// Options for a new base texture.
#[derive(Debug, Clone, Copy)]
pub struct BaseTextureOptions {
    /// Source pixels per logical pixel, e.g. 2.0 for `@2x` assets.
    pub resolution: f32,
    pub scale_mode: ScaleMode,
}

impl Default for BaseTextureOptions {
    fn default() -> Self {
        Self {
            resolution: 1.0,
            scale_mode: ScaleMode::Linear,
        }
    }
}

/// Owns every base texture and texture frame, plus the name and source caches.
///
/// One registry can serve several renderers. Each renderer uploads and binds
/// using its own [`ContextId`]; handles released by [`destroy_base_texture`]
/// are queued per context until that context's renderer frees them.
///
/// [`destroy_base_texture`]: TextureRegistry::destroy_base_texture
#[derive(Debug)]
pub struct TextureRegistry {
    base_textures: Arena<BaseTextureId, BaseTexture>,
    textures: Arena<TextureId, Texture>,
    by_source: AHashMap<String, BaseTextureId>,
    by_name: AHashMap<String, TextureId>,
    pending_release: AHashMap<ContextId, Vec<TextureHandle>>,
    policy: ResourcePolicy,
    empty: TextureId,
}

impl Default for TextureRegistry {
    fn default() -> Self {
        Self::new(ResourcePolicy::default())
    }
}

impl TextureRegistry {
    pub fn new(policy: ResourcePolicy) -> Self {
        let mut base_textures = Arena::new();
        let mut empty_base = BaseTexture::new(1.0, ScaleMode::Linear);
        empty_base.skip_render = true;
        let empty_base_id = base_textures.insert(empty_base);

        let mut textures = Arena::new();
        let empty = textures.insert(Texture::new(empty_base_id, Some(Rectangle::EMPTY)));

        Self {
            base_textures,
            textures,
            by_source: AHashMap::new(),
            by_name: AHashMap::new(),
            pending_release: AHashMap::new(),
            policy,
            empty,
        }
    }

    pub fn policy(&self) -> ResourcePolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: ResourcePolicy) {
        self.policy = policy;
    }

    /// A zero-sized texture that never draws and never breaks a sprite batch.
    pub fn empty_texture(&self) -> TextureId {
        self.empty
    }

    // ── Base textures ────────────────────────────────────────────────────────

    /// Registers a base texture whose pixels arrive later through [`Self::load_base_texture`].
    pub fn add_pending_base_texture(&mut self, options: BaseTextureOptions) -> BaseTextureId {
        self.base_textures
            .insert(BaseTexture::new(options.resolution, options.scale_mode))
    }

    pub fn add_base_texture(
        &mut self,
        source: ImageSource,
        options: BaseTextureOptions,
    ) -> BaseTextureId {
        let mut base = BaseTexture::new(options.resolution, options.scale_mode);
        base.set_source(source);
        self.base_textures.insert(base)
    }

    /// Returns the cached base texture for `key`, creating it from `load` on first use.
    pub fn base_texture_from_source<F>(
        &mut self,
        key: &str,
        options: BaseTextureOptions,
        load: F,
    ) -> Result<BaseTextureId, TextureError>
    where
        F: FnOnce() -> Result<ImageSource, TextureError>,
    {
        if let Some(&id) = self.by_source.get(key) {
            if self.base_textures.contains(id) {
                return Ok(id);
            }
        }
        let source = load()?;
        let id = self.add_base_texture(source, options);
        if let Some(base) = self.base_textures.get_mut(id) {
            base.source_key = Some(key.to_owned());
        }
        self.by_source.insert(key.to_owned(), id);
        Ok(id)
    }

    pub fn base_texture_by_source(&self, key: &str) -> Option<BaseTextureId> {
        self.by_source
            .get(key)
            .copied()
            .filter(|id| self.base_textures.contains(*id))
    }

    /// Supplies pixels for a pending base texture, or replaces existing ones.
    ///
    /// Dependent textures get fresh UVs and every context is marked dirty.
    pub fn load_base_texture(
        &mut self,
        id: BaseTextureId,
        source: ImageSource,
    ) -> Result<(), TextureError> {
        let base = self
            .base_textures
            .get_mut(id)
            .ok_or(TextureError::StaleBaseTexture(id))?;
        base.set_source(source);
        tracing::debug!(
            "base texture {} loaded at {}x{}",
            id,
            base.width,
            base.height
        );
        self.refresh_dependents(id)
    }

    /// Alias of [`Self::load_base_texture`] for already-loaded textures.
    pub fn update_base_texture(
        &mut self,
        id: BaseTextureId,
        source: ImageSource,
    ) -> Result<(), TextureError> {
        self.load_base_texture(id, source)
    }

    /// Forces every context to re-upload before its next bind.
    pub fn dirty(&mut self, id: BaseTextureId) -> Result<(), TextureError> {
        self.base_textures
            .get_mut(id)
            .ok_or(TextureError::StaleBaseTexture(id))?
            .mark_dirty();
        Ok(())
    }

    pub fn base_texture(&self, id: BaseTextureId) -> Option<&BaseTexture> {
        self.base_textures.get(id)
    }

    pub(crate) fn base_texture_mut(&mut self, id: BaseTextureId) -> Option<&mut BaseTexture> {
        self.base_textures.get_mut(id)
    }

    /// Frees the base texture everywhere and evicts it from the source cache.
    ///
    /// Textures that view it become invalid.
    pub fn destroy_base_texture(&mut self, id: BaseTextureId) -> Result<(), TextureError> {
        let mut base = self
            .base_textures
            .remove(id)
            .ok_or(TextureError::StaleBaseTexture(id))?;
        if let Some(key) = base.source_key.take() {
            self.by_source.remove(&key);
        }
        for (context, handle) in base.take_handles() {
            // Render-target colour textures belong to their render target.
            if matches!(base.data, TextureData::RenderTarget(_)) {
                continue;
            }
            self.pending_release.entry(context).or_default().push(handle);
        }
        for (_, texture) in self.textures.iter_mut() {
            if texture.base == id {
                texture.valid = false;
                texture.uvs = Default::default();
            }
        }
        Ok(())
    }

    // ── Textures ─────────────────────────────────────────────────────────────

    /// Adds a texture covering `frame` of `base`, or the whole base when `frame` is `None`.
    pub fn add_texture(
        &mut self,
        base: BaseTextureId,
        frame: Option<Rectangle>,
    ) -> Result<TextureId, TextureError> {
        if !self.base_textures.contains(base) {
            return Err(TextureError::StaleBaseTexture(base));
        }
        let id = self.textures.insert(Texture::new(base, frame));
        if let Err(error) = self.refresh_texture(id) {
            self.textures.remove(id);
            return Err(error);
        }
        Ok(id)
    }

    /// Registers a named atlas frame so it can be found with [`Self::texture_by_name`].
    pub fn add_frame(
        &mut self,
        name: &str,
        base: BaseTextureId,
        frame: Rectangle,
    ) -> Result<TextureId, TextureError> {
        let id = self.add_texture(base, Some(frame))?;
        if let Some(texture) = self.textures.get_mut(id) {
            texture.name = Some(name.to_owned());
        }
        if let Some(previous) = self.by_name.insert(name.to_owned(), id) {
            tracing::debug!("texture frame {:?} replaced {}", name, previous);
        }
        Ok(id)
    }

    /// Looks up a named frame.
    ///
    /// Under the lenient policy a missing name yields the empty texture.
    pub fn texture_by_name(&self, name: &str) -> Result<TextureId, TextureError> {
        match self.by_name.get(name) {
            Some(&id) if self.textures.contains(id) => Ok(id),
            _ => match self.policy {
                ResourcePolicy::Strict => Err(TextureError::UnknownFrame(name.to_owned())),
                ResourcePolicy::Lenient => {
                    tracing::warn!("no texture frame named {:?}; using the empty texture", name);
                    Ok(self.empty)
                }
            },
        }
    }

    pub fn texture(&self, id: TextureId) -> Option<&Texture> {
        self.textures.get(id)
    }

    /// Moves a texture to a new frame of its base texture.
    pub fn set_frame(&mut self, id: TextureId, frame: Rectangle) -> Result<(), TextureError> {
        let texture = self
            .textures
            .get_mut(id)
            .ok_or(TextureError::StaleTexture(id))?;
        texture.crop = frame;
        texture.no_frame = false;
        self.refresh_texture(id)
    }

    /// Sets or clears the trim of an atlas frame. The displayed size becomes the untrimmed size.
    pub fn set_trim(&mut self, id: TextureId, trim: Option<Trim>) -> Result<(), TextureError> {
        let texture = self
            .textures
            .get_mut(id)
            .ok_or(TextureError::StaleTexture(id))?;
        texture.trim = trim;
        self.refresh_texture(id)
    }

    pub fn destroy_texture(&mut self, id: TextureId) -> Result<(), TextureError> {
        if id == self.empty {
            return Ok(());
        }
        let texture = self
            .textures
            .remove(id)
            .ok_or(TextureError::StaleTexture(id))?;
        if let Some(name) = texture.name {
            if self.by_name.get(&name) == Some(&id) {
                self.by_name.remove(&name);
            }
        }
        Ok(())
    }

    pub fn base_texture_count(&self) -> usize {
        self.base_textures.len()
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    // ── Per-context bookkeeping ──────────────────────────────────────────────

    /// Handles freed on behalf of `context` that its renderer still has to delete.
    pub(crate) fn drain_released(&mut self, context: ContextId) -> Vec<TextureHandle> {
        self.pending_release.remove(&context).unwrap_or_default()
    }

    /// Drops every handle for a lost context without freeing; each texture re-uploads on next use.
    ///
    /// Render-target textures become unavailable until their target is recreated.
    pub(crate) fn invalidate_context(&mut self, context: ContextId) {
        self.pending_release.remove(&context);
        for (_, base) in self.base_textures.iter_mut() {
            base.forget_context(context);
        }
    }

    /// Removes and returns every handle owned by `context`, for renderer teardown.
    pub(crate) fn release_context(&mut self, context: ContextId) -> Vec<TextureHandle> {
        let mut handles = self.drain_released(context);
        for (_, base) in self.base_textures.iter_mut() {
            if matches!(base.data, TextureData::RenderTarget(_)) {
                continue;
            }
            if let Some(handle) = base.forget_context(context) {
                handles.push(handle);
            }
        }
        handles
    }

    #[cfg(test)]
    pub(crate) fn contexts_with_uploads(&self) -> Vec<ContextId> {
        let mut contexts: Vec<ContextId> = self
            .base_textures
            .iter()
            .flat_map(|(_, base)| base.contexts())
            .collect();
        contexts.sort_unstable();
        contexts.dedup();
        contexts
    }

    /// Creates a base texture whose pixels live in a render target of `context`.
    pub(crate) fn add_render_target_texture(
        &mut self,
        context: ContextId,
        handle: TextureHandle,
        width: u32,
        height: u32,
        resolution: f32,
    ) -> BaseTextureId {
        let mut base = BaseTexture::new(resolution, ScaleMode::Linear);
        base.data = TextureData::RenderTarget(context);
        base.width = width;
        base.height = height;
        base.set_uploaded(context, handle);
        self.base_textures.insert(base)
    }

    pub(crate) fn resize_render_target_texture(
        &mut self,
        id: BaseTextureId,
        handle: TextureHandle,
        width: u32,
        height: u32,
    ) -> Result<(), TextureError> {
        let base = self
            .base_textures
            .get_mut(id)
            .ok_or(TextureError::StaleBaseTexture(id))?;
        base.width = width;
        base.height = height;
        if let TextureData::RenderTarget(context) = base.data {
            base.set_uploaded(context, handle);
        }
        self.refresh_dependents(id)
    }

    fn refresh_dependents(&mut self, base: BaseTextureId) -> Result<(), TextureError> {
        let dependents: Vec<TextureId> = self
            .textures
            .iter()
            .filter(|(_, texture)| texture.base == base)
            .map(|(id, _)| id)
            .collect();
        let mut first_error = None;
        for id in dependents {
            if let Err(error) = self.refresh_texture(id) {
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Validates the frame against the base texture and recomputes UVs.
    fn refresh_texture(&mut self, id: TextureId) -> Result<(), TextureError> {
        let policy = self.policy;
        let Some(texture) = self.textures.get_mut(id) else {
            return Err(TextureError::StaleTexture(id));
        };
        let Some(base) = self.base_textures.get(texture.base) else {
            texture.valid = false;
            return Err(TextureError::StaleBaseTexture(texture.base));
        };

        if texture.no_frame {
            texture.crop = Rectangle::new(0.0, 0.0, base.width as f32, base.height as f32);
        }

        if !base.has_loaded() {
            texture.valid = false;
            return Ok(());
        }

        let crop = texture.crop;
        let out_of_bounds = crop.x < 0.0
            || crop.y < 0.0
            || crop.right() > base.width as f32
            || crop.bottom() > base.height as f32
            || crop.is_nan();
        if out_of_bounds {
            texture.valid = false;
            texture.uvs = Default::default();
            let error = TextureError::FrameOutOfBounds {
                frame: crop,
                width: base.width,
                height: base.height,
            };
            return match policy {
                ResourcePolicy::Strict => Err(error),
                ResourcePolicy::Lenient => {
                    tracing::warn!("{error}; texture {id} will not render");
                    Ok(())
                }
            };
        }

        texture.valid = true;
        texture.update_uvs(base.width, base.height);
        Ok(())
    }
}
