//! Post-processing filters and the shader objects they run.
//!
//! A [`Shader`] is backend-neutral source plus a per-context program cache, so
//! one shader can be used by several renderers at once. A [`Filter`] is an
//! ordered list of [`FilterPass`]es, each a shader with its own parameters.
//!
//! Every shader's WGSL is compiled after a shared prelude that declares:
//!
//! - `globals`: `projection`, `offset`, `dimensions` (input size in pixels, then
//!   its reciprocal) and `params` (eight `vec4<f32>`),
//! - `param(i: u32) -> f32`, reading one scalar parameter,
//! - `t_source` / `s_source`: the input texture and its sampler,
//! - `VertexOutput` with `uv` and premultiplied `color`.
//!
//! The shader must define `@fragment fn fs_main(in: VertexOutput) -> @location(0) vec4<f32>`.

mod builtin;

pub use builtin::{AlphaFilter, BlurFilter, ColorMatrixFilter};
pub(crate) use builtin::{builtin_shaders, passthrough_fragment, passthrough_shader};

use crate::backend::{GpuBackend, ProgramHandle, ProgramSource, RasterFragment, MAX_SHADER_PARAMS};
use crate::error::{FilterError, GpuError};
use crate::id::{ContextId, ShaderId};
use ahash::AHashMap;
use regex::Regex;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::LazyLock;

static BLOCK_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("valid block comment pattern"));
static LINE_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"//[^\n]*").expect("valid line comment pattern"));
static PARAM_USE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bparam\s*\(|\bglobals\s*\.\s*params\b").expect("valid param pattern")
});

/// Whether WGSL source reads filter parameters, ignoring comments.
pub(crate) fn reads_params(wgsl: &str) -> bool {
    let without_blocks = BLOCK_COMMENT.replace_all(wgsl, "");
    let stripped = LINE_COMMENT.replace_all(&without_blocks, "");
    PARAM_USE.is_match(&stripped)
}

/// Fragment program source plus the programs compiled from it, one per context.
pub struct Shader {
    id: ShaderId,
    label: String,
    fragment_wgsl: String,
    raster: RasterFragment,
    uses_params: bool,
    programs: RefCell<AHashMap<ContextId, ProgramHandle>>,
}

impl fmt::Debug for Shader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shader")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("uses_params", &self.uses_params)
            .finish_non_exhaustive()
    }
}

impl Shader {
    /// A shader with WGSL for GPU backends and a CPU fragment for [`SoftwareBackend`].
    ///
    /// [`SoftwareBackend`]: crate::SoftwareBackend
    pub fn new(label: impl Into<String>, fragment_wgsl: impl Into<String>, raster: RasterFragment) -> Self {
        let fragment_wgsl = fragment_wgsl.into();
        Self {
            id: ShaderId::next(),
            label: label.into(),
            uses_params: reads_params(&fragment_wgsl),
            fragment_wgsl,
            raster,
            programs: RefCell::new(AHashMap::new()),
        }
    }

    /// A WGSL-only shader. CPU backends draw it as a plain textured pass.
    pub fn custom(label: impl Into<String>, fragment_wgsl: impl Into<String>) -> Self {
        Self::new(label, fragment_wgsl, passthrough_fragment)
    }

    pub fn id(&self) -> ShaderId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn fragment_wgsl(&self) -> &str {
        &self.fragment_wgsl
    }

    /// Whether the WGSL reads `param(..)` or `globals.params`.
    pub fn uses_params(&self) -> bool {
        self.uses_params
    }

    /// The program for `backend`'s context, compiling it on first use.
    ///
    /// A compile failure is logged and returned; nothing is cached, so the
    /// shader is never bound in a half-built state.
    pub(crate) fn program<B: GpuBackend + ?Sized>(
        &self,
        backend: &mut B,
    ) -> Result<ProgramHandle, GpuError> {
        let context = backend.context_id();
        if let Some(program) = self.programs.borrow().get(&context) {
            return Ok(*program);
        }
        let program = backend
            .compile_program(&ProgramSource {
                label: &self.label,
                fragment_wgsl: &self.fragment_wgsl,
                raster: self.raster,
            })
            .inspect_err(|error| {
                tracing::error!(shader = %self.label, %error, "shader compilation failed");
            })?;
        self.programs.borrow_mut().insert(context, program);
        Ok(program)
    }

    #[cfg(test)]
    pub(crate) fn is_compiled_for(&self, context: ContextId) -> bool {
        self.programs.borrow().contains_key(&context)
    }

    /// Drops the cached program for `context`, returning it so the caller can free it.
    pub(crate) fn forget_context(&self, context: ContextId) -> Option<ProgramHandle> {
        self.programs.borrow_mut().remove(&context)
    }
}

/// One shader invocation over the filtered region.
#[derive(Debug, Clone)]
pub struct FilterPass {
    pub(crate) shader: Rc<Shader>,
    pub(crate) params: SmallVec<[f32; 8]>,
}

impl FilterPass {
    pub fn new(shader: Rc<Shader>, params: &[f32]) -> Result<Self, FilterError> {
        if params.len() > MAX_SHADER_PARAMS {
            return Err(FilterError::TooManyParams(params.len()));
        }
        if !params.is_empty() && !shader.uses_params() {
            tracing::warn!(
                shader = shader.label(),
                count = params.len(),
                "parameters supplied to a shader that never reads them"
            );
        }
        Ok(Self {
            shader,
            params: SmallVec::from_slice(params),
        })
    }

    pub fn shader(&self) -> &Rc<Shader> {
        &self.shader
    }

    pub fn params(&self) -> &[f32] {
        &self.params
    }

    pub(crate) fn params_array(&self) -> [f32; MAX_SHADER_PARAMS] {
        let mut out = [0.0; MAX_SHADER_PARAMS];
        out[..self.params.len()].copy_from_slice(&self.params);
        out
    }
}

/// An ordered list of passes applied to a node's rendered subtree.
///
/// ```
/// use tableau::{Filter, FilterPass, Shader};
/// use std::rc::Rc;
///
/// let invert = Rc::new(Shader::custom(
///     "invert",
///     "@fragment fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
///         let c = textureSample(t_source, s_source, in.uv);
///         return vec4<f32>(c.a - c.rgb, c.a);
///     }",
/// ));
/// let filter = Filter::new(vec![FilterPass::new(invert, &[]).unwrap()]).unwrap();
/// assert_eq!(filter.passes().len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct Filter {
    passes: SmallVec<[FilterPass; 2]>,
    padding: f32,
}

impl Filter {
    pub fn new(passes: Vec<FilterPass>) -> Result<Self, FilterError> {
        if passes.is_empty() {
            return Err(FilterError::NoPasses);
        }
        Ok(Self {
            passes: SmallVec::from_vec(passes),
            padding: 0.0,
        })
    }

    /// A single-pass filter running custom WGSL.
    pub fn custom(
        label: impl Into<String>,
        fragment_wgsl: impl Into<String>,
        params: &[f32],
    ) -> Result<Self, FilterError> {
        let shader = Rc::new(Shader::custom(label, fragment_wgsl));
        Self::new(vec![FilterPass::new(shader, params)?])
    }

    /// Extra logical pixels around the filtered bounds, for effects that spread.
    pub fn with_padding(mut self, padding: f32) -> Self {
        self.padding = if padding.is_finite() { padding.max(0.0) } else { 0.0 };
        self
    }

    pub fn padding(&self) -> f32 {
        self.padding
    }

    pub fn passes(&self) -> &[FilterPass] {
        &self.passes
    }

    pub fn passes_mut(&mut self) -> &mut [FilterPass] {
        &mut self.passes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;

    #[test]
    fn param_detection_ignores_comments() {
        assert!(reads_params("let x = param(0u);"));
        assert!(reads_params("let v = globals.params[1];"));
        assert!(!reads_params("// param(0u)\nlet x = 1.0;"));
        assert!(!reads_params("/* globals.params\n */ let y = 2.0;"));
        assert!(!reads_params("let parameter = 3.0;"));
    }

    #[test]
    fn too_many_params_are_rejected() {
        let shader = Rc::new(Shader::custom("p", "param(0u)"));
        let params = [0.0; MAX_SHADER_PARAMS + 1];
        assert_eq!(
            FilterPass::new(shader, &params).unwrap_err(),
            FilterError::TooManyParams(MAX_SHADER_PARAMS + 1)
        );
    }

    #[test]
    fn empty_filters_are_rejected() {
        assert_eq!(Filter::new(Vec::new()).unwrap_err(), FilterError::NoPasses);
    }

    #[test]
    fn programs_are_cached_per_context() {
        let shader = Shader::custom("cached", "");
        let mut first = SoftwareBackend::new(4, 4);
        let mut second = SoftwareBackend::new(4, 4);

        let a = shader.program(&mut first).unwrap();
        assert_eq!(shader.program(&mut first).unwrap(), a);
        assert_eq!(first.stats().program_compiles, 1);

        shader.program(&mut second).unwrap();
        assert_eq!(second.stats().program_compiles, 1);
        assert!(shader.is_compiled_for(first.context_id()));

        assert_eq!(shader.forget_context(first.context_id()), Some(a));
        assert!(!shader.is_compiled_for(first.context_id()));
    }

    #[test]
    fn params_array_zero_fills() {
        let shader = Rc::new(Shader::custom("p", "param(0u)"));
        let pass = FilterPass::new(shader, &[1.0, 2.0]).unwrap();
        let array = pass.params_array();
        assert_eq!(&array[..3], &[1.0, 2.0, 0.0]);
    }
}
