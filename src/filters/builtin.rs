use super::{Filter, FilterPass, Shader};
use crate::backend::FragmentInput;
use smallvec::smallvec;
use std::rc::Rc;

const PASSTHROUGH_WGSL: &str = r#"
@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    return textureSample(t_source, s_source, in.uv) * in.color;
}
"#;

const ALPHA_WGSL: &str = r#"
@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    return textureSample(t_source, s_source, in.uv) * in.color * param(0u);
}
"#;

const COLOR_MATRIX_WGSL: &str = r#"
@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let sampled = textureSample(t_source, s_source, in.uv) * in.color;
    var straight = vec3<f32>(0.0);
    if (sampled.a > 0.0) {
        straight = sampled.rgb / sampled.a;
    }
    let c = vec4<f32>(straight, sampled.a);
    let r = dot(c, vec4<f32>(param(0u), param(1u), param(2u), param(3u))) + param(4u);
    let g = dot(c, vec4<f32>(param(5u), param(6u), param(7u), param(8u))) + param(9u);
    let b = dot(c, vec4<f32>(param(10u), param(11u), param(12u), param(13u))) + param(14u);
    let a = clamp(dot(c, vec4<f32>(param(15u), param(16u), param(17u), param(18u))) + param(19u), 0.0, 1.0);
    return vec4<f32>(clamp(vec3<f32>(r, g, b), vec3<f32>(0.0), vec3<f32>(1.0)) * a, a);
}
"#;

const BLUR_WGSL: &str = r#"
@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    var weights = array<f32, 9>(0.05, 0.09, 0.12, 0.15, 0.18, 0.15, 0.12, 0.09, 0.05);
    let direction = vec2<f32>(param(0u), param(1u));
    let stride = direction * globals.dimensions.zw * (param(2u) / 4.0);
    var sum = vec4<f32>(0.0);
    for (var i = 0; i < 9; i = i + 1) {
        sum = sum + textureSample(t_source, s_source, in.uv + stride * f32(i - 4)) * weights[i];
    }
    return sum * in.color;
}
"#;

const BLUR_WEIGHTS: [f32; 9] = [0.05, 0.09, 0.12, 0.15, 0.18, 0.15, 0.12, 0.09, 0.05];

fn modulate(texel: [f32; 4], color: [f32; 4]) -> [f32; 4] {
    [
        texel[0] * color[0],
        texel[1] * color[1],
        texel[2] * color[2],
        texel[3] * color[3],
    ]
}

pub(crate) fn passthrough_fragment(input: &FragmentInput<'_>) -> [f32; 4] {
    modulate(input.sample(input.uv[0], input.uv[1]), input.color)
}

fn alpha_fragment(input: &FragmentInput<'_>) -> [f32; 4] {
    let alpha = input.params()[0];
    passthrough_fragment(input).map(|c| c * alpha)
}

fn color_matrix_fragment(input: &FragmentInput<'_>) -> [f32; 4] {
    let [r, g, b, a] = passthrough_fragment(input);
    let straight = if a > 0.0 {
        [r / a, g / a, b / a, a]
    } else {
        [0.0, 0.0, 0.0, a]
    };
    let m = input.params();
    let row = |i: usize| {
        m[i] * straight[0] + m[i + 1] * straight[1] + m[i + 2] * straight[2] + m[i + 3] * straight[3]
            + m[i + 4]
    };
    let alpha = row(15).clamp(0.0, 1.0);
    [
        row(0).clamp(0.0, 1.0) * alpha,
        row(5).clamp(0.0, 1.0) * alpha,
        row(10).clamp(0.0, 1.0) * alpha,
        alpha,
    ]
}

fn blur_fragment(input: &FragmentInput<'_>) -> [f32; 4] {
    let params = input.params();
    let texel = [input.uniforms.dimensions[2], input.uniforms.dimensions[3]];
    let scale = params[2] / 4.0;
    let step = [params[0] * texel[0] * scale, params[1] * texel[1] * scale];
    let mut sum = [0.0; 4];
    for (tap, weight) in BLUR_WEIGHTS.iter().enumerate() {
        let k = tap as f32 - 4.0;
        let sample = input.sample(input.uv[0] + step[0] * k, input.uv[1] + step[1] * k);
        for channel in 0..4 {
            sum[channel] += sample[channel] * weight;
        }
    }
    modulate(sum, input.color)
}

thread_local! {
    static PASSTHROUGH: Rc<Shader> = Rc::new(Shader::new("passthrough", PASSTHROUGH_WGSL, passthrough_fragment));
    static ALPHA: Rc<Shader> = Rc::new(Shader::new("alpha", ALPHA_WGSL, alpha_fragment));
    static COLOR_MATRIX: Rc<Shader> =
        Rc::new(Shader::new("color_matrix", COLOR_MATRIX_WGSL, color_matrix_fragment));
    static BLUR: Rc<Shader> = Rc::new(Shader::new("blur", BLUR_WGSL, blur_fragment));
}

/// The textured, tinted program sprites and filter copies use by default.
pub(crate) fn passthrough_shader() -> Rc<Shader> {
    PASSTHROUGH.with(Rc::clone)
}

/// Built-in shaders, for context bookkeeping.
pub(crate) fn builtin_shaders() -> [Rc<Shader>; 4] {
    [
        passthrough_shader(),
        ALPHA.with(Rc::clone),
        COLOR_MATRIX.with(Rc::clone),
        BLUR.with(Rc::clone),
    ]
}

/// Multiplies the subtree's opacity as a whole, so overlapping children do not show through each other.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlphaFilter {
    pub alpha: f32,
}

impl AlphaFilter {
    pub fn new(alpha: f32) -> Self {
        Self { alpha }
    }
}

impl From<AlphaFilter> for Filter {
    fn from(filter: AlphaFilter) -> Self {
        let pass = FilterPass {
            shader: ALPHA.with(Rc::clone),
            params: smallvec![filter.alpha.clamp(0.0, 1.0)],
        };
        Filter {
            passes: smallvec![pass],
            padding: 0.0,
        }
    }
}

/// A 4x5 colour matrix applied to straight (unpremultiplied) RGBA, row-major
/// with the constant offset in the fifth column.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorMatrixFilter {
    pub matrix: [f32; 20],
}

impl Default for ColorMatrixFilter {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl ColorMatrixFilter {
    pub const IDENTITY: Self = Self {
        matrix: [
            1.0, 0.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 0.0, 1.0, 0.0,
        ],
    };

    pub fn new(matrix: [f32; 20]) -> Self {
        Self { matrix }
    }

    /// Luminance greyscale.
    pub fn greyscale() -> Self {
        let (r, g, b) = (0.299, 0.587, 0.114);
        Self::new([
            r, g, b, 0.0, 0.0, //
            r, g, b, 0.0, 0.0, //
            r, g, b, 0.0, 0.0, //
            0.0, 0.0, 0.0, 1.0, 0.0,
        ])
    }

    pub fn negative() -> Self {
        Self::new([
            -1.0, 0.0, 0.0, 0.0, 1.0, //
            0.0, -1.0, 0.0, 0.0, 1.0, //
            0.0, 0.0, -1.0, 0.0, 1.0, //
            0.0, 0.0, 0.0, 1.0, 0.0,
        ])
    }

    pub fn brightness(amount: f32) -> Self {
        Self::new([
            amount, 0.0, 0.0, 0.0, 0.0, //
            0.0, amount, 0.0, 0.0, 0.0, //
            0.0, 0.0, amount, 0.0, 0.0, //
            0.0, 0.0, 0.0, 1.0, 0.0,
        ])
    }
}

impl From<ColorMatrixFilter> for Filter {
    fn from(filter: ColorMatrixFilter) -> Self {
        let pass = FilterPass {
            shader: COLOR_MATRIX.with(Rc::clone),
            params: smallvec::SmallVec::from_slice(&filter.matrix),
        };
        Filter {
            passes: smallvec![pass],
            padding: 0.0,
        }
    }
}

/// Separable Gaussian blur: a horizontal pass then a vertical pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlurFilter {
    /// Blur radius in logical pixels; also used as padding.
    pub radius: f32,
}

impl BlurFilter {
    pub fn new(radius: f32) -> Self {
        Self { radius }
    }
}

impl From<BlurFilter> for Filter {
    fn from(filter: BlurFilter) -> Self {
        let radius = if filter.radius.is_finite() {
            filter.radius.max(0.0)
        } else {
            0.0
        };
        let shader = BLUR.with(Rc::clone);
        let horizontal = FilterPass {
            shader: shader.clone(),
            params: smallvec![1.0, 0.0, radius],
        };
        let vertical = FilterPass {
            shader,
            params: smallvec![0.0, 1.0, radius],
        };
        Filter {
            passes: smallvec![horizontal, vertical],
            padding: radius,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blur_has_two_passes_and_pads_by_radius() {
        let filter = Filter::from(BlurFilter::new(6.0));
        assert_eq!(filter.passes().len(), 2);
        assert_eq!(filter.padding(), 6.0);
        assert_eq!(filter.passes()[0].params(), &[1.0, 0.0, 6.0]);
        assert_eq!(filter.passes()[1].params(), &[0.0, 1.0, 6.0]);
    }

    #[test]
    fn builtin_wgsl_reads_params_where_expected() {
        assert!(!passthrough_shader().uses_params());
        assert!(ALPHA.with(|s| s.uses_params()));
        assert!(COLOR_MATRIX.with(|s| s.uses_params()));
        assert!(BLUR.with(|s| s.uses_params()));
    }

    #[test]
    fn blur_weights_sum_to_one() {
        let sum: f32 = BLUR_WEIGHTS.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn shaders_are_shared_within_a_thread() {
        assert_eq!(passthrough_shader().id(), passthrough_shader().id());
        let a = Filter::from(AlphaFilter::new(0.5));
        let b = Filter::from(AlphaFilter::new(0.2));
        assert_eq!(a.passes()[0].shader().id(), b.passes()[0].shader().id());
    }
}
