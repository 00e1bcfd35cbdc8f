use super::{
    BlendFactor, BlendFunc, BufferHandle, BufferKind, CompareFunction, GpuBackend, ProgramHandle,
    ProgramSource, RenderTargetHandle, StencilOp, TextureHandle, Topology, UniformBlock, Uniforms,
};
use crate::error::GpuError;
use crate::id::ContextId;
use crate::texture::ScaleMode;
use ahash::{AHashMap, AHashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const STENCIL_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth24PlusStencil8;
const UNIFORM_BLOCK_SIZE: u64 = std::mem::size_of::<UniformBlock>() as u64;
const INITIAL_UNIFORM_CAPACITY: u64 = 64 * 1024;

const PRELUDE: &str = r#"
struct Globals {
    projection: vec2<f32>,
    offset: vec2<f32>,
    dimensions: vec4<f32>,
    params: array<vec4<f32>, 8>,
};

@group(0) @binding(0) var<uniform> globals: Globals;
@group(1) @binding(0) var t_source: texture_2d<f32>;
@group(1) @binding(1) var s_source: sampler;

fn param(i: u32) -> f32 {
    return globals.params[i / 4u][i % 4u];
}

struct VertexOutput {
    @builtin(position) clip: vec4<f32>,
    @location(0) uv: vec2<f32>,
    @location(1) color: vec4<f32>,
};
"#;

const VERTEX: &str = r#"
struct VertexInput {
    @location(0) position: vec2<f32>,
    @location(1) uv: vec2<f32>,
    @location(2) color: vec4<f32>,
};

@vertex
fn vs_main(input: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    let p = input.position + globals.offset;
    out.clip = vec4<f32>(p.x / globals.projection.x - 1.0, 1.0 - p.y / globals.projection.y, 0.0, 1.0);
    out.uv = input.uv;
    out.color = input.color;
    return out;
}
"#;

struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
    scale_mode: ScaleMode,
}

struct GpuTarget {
    color: TextureHandle,
    stencil_view: wgpu::TextureView,
}

struct GpuBuffer {
    buffer: wgpu::Buffer,
    kind: BufferKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct StencilKey {
    compare: CompareFunction,
    read_mask: u8,
    fail: StencilOp,
    pass: StencilOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PipelineKey {
    program: ProgramHandle,
    blend: Option<BlendFunc>,
    color_write: bool,
    stencil: Option<StencilKey>,
    topology: Topology,
}

struct DrawCommand {
    pipeline: PipelineKey,
    vertices: BufferHandle,
    indices: BufferHandle,
    first_index: u32,
    index_count: u32,
    uniform_offset: u32,
    texture: Option<TextureHandle>,
    stencil_reference: u8,
    viewport: [u32; 4],
}

/// Draws into one target, in order, plus how the pass starts.
struct PassCommands {
    target: Option<RenderTargetHandle>,
    clear_color: Option<[f32; 4]>,
    clear_stencil: bool,
    draws: Vec<DrawCommand>,
}

#[derive(Debug, Clone, Copy)]
struct FixedState {
    target: Option<RenderTargetHandle>,
    viewport: [u32; 4],
    blend: Option<BlendFunc>,
    color_write: bool,
    stencil_test: bool,
    stencil_func: (CompareFunction, u8, u8),
    stencil_op: (StencilOp, StencilOp),
    program: Option<ProgramHandle>,
    texture: Option<TextureHandle>,
    uniforms: Uniforms,
}

impl FixedState {
    fn new(width: u32, height: u32) -> Self {
        Self {
            target: None,
            viewport: [0, 0, width, height],
            blend: None,
            color_write: true,
            stencil_test: false,
            stencil_func: (CompareFunction::Always, 0, 0xFF),
            stencil_op: (StencilOp::Keep, StencilOp::Keep),
            program: None,
            texture: None,
            uniforms: Uniforms::default(),
        }
    }
}

/// A [`GpuBackend`] on a `wgpu` device.
///
/// The default framebuffer is an offscreen RGBA8 texture with a stencil
/// attachment; read it back with [`GpuBackend::read_pixels`]. Draws are
/// recorded and encoded at [`GpuBackend::end_frame`], or earlier when a
/// buffer or texture they use is about to be rewritten or freed.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    context: ContextId,
    lost: Arc<AtomicBool>,
    next_handle: u32,
    width: u32,
    height: u32,
    main_color: GpuTexture,
    main_stencil_view: wgpu::TextureView,

    textures: AHashMap<TextureHandle, GpuTexture>,
    targets: AHashMap<RenderTargetHandle, GpuTarget>,
    buffers: AHashMap<BufferHandle, GpuBuffer>,
    programs: AHashMap<ProgramHandle, wgpu::ShaderModule>,
    pipelines: AHashMap<PipelineKey, wgpu::RenderPipeline>,
    texture_bind_groups: AHashMap<TextureHandle, wgpu::BindGroup>,

    uniform_layout: wgpu::BindGroupLayout,
    texture_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    linear_sampler: wgpu::Sampler,
    nearest_sampler: wgpu::Sampler,
    white_bind_group: wgpu::BindGroup,

    uniform_buffer: wgpu::Buffer,
    uniform_bind_group: wgpu::BindGroup,
    uniform_alignment: u64,
    uniform_staging: Vec<u8>,
    last_uniform: Option<(Uniforms, u32)>,

    state: FixedState,
    passes: Vec<PassCommands>,
    pending_buffers: AHashSet<BufferHandle>,
    pending_textures: AHashSet<TextureHandle>,
}

impl std::fmt::Debug for WgpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuBackend")
            .field("context", &self.context)
            .field("size", &(self.width, self.height))
            .field("textures", &self.textures.len())
            .field("targets", &self.targets.len())
            .field("buffers", &self.buffers.len())
            .field("programs", &self.programs.len())
            .field("pipelines", &self.pipelines.len())
            .field("pending_passes", &self.passes.len())
            .finish_non_exhaustive()
    }
}

impl WgpuBackend {
    /// Requests an adapter and device with no surface.
    pub async fn try_new_headless(width: u32, height: u32) -> Result<Self, GpuError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|_| GpuError::NoAdapter)?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("tableau-device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: Default::default(),
                trace: Default::default(),
            })
            .await
            .map_err(|error| GpuError::DeviceRequest(error.to_string()))?;

        tracing::info!(adapter = ?adapter.get_info().name, "wgpu device created");
        Ok(Self::from_device(device, queue, width, height))
    }

    /// Blocking form of [`try_new_headless`](Self::try_new_headless).
    pub fn new_headless(width: u32, height: u32) -> Result<Self, GpuError> {
        pollster::block_on(Self::try_new_headless(width, height))
    }

    /// Wraps an existing device.
    pub fn from_device(device: wgpu::Device, queue: wgpu::Queue, width: u32, height: u32) -> Self {
        let context = ContextId::next();
        let lost = Arc::new(AtomicBool::new(false));
        {
            let lost = lost.clone();
            device.set_device_lost_callback(move |reason, message| {
                tracing::warn!(?reason, %message, "wgpu device lost");
                lost.store(true, Ordering::SeqCst);
            });
        }
        device.on_uncaptured_error(Box::new(|error| {
            tracing::error!(%error, "uncaptured wgpu error");
        }));

        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("tableau-uniforms"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: wgpu::BufferSize::new(UNIFORM_BLOCK_SIZE),
                },
                count: None,
            }],
        });
        let texture_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("tableau-texture"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("tableau-pipeline-layout"),
            bind_group_layouts: &[&uniform_layout, &texture_layout],
            push_constant_ranges: &[],
        });

        let sampler = |filter: wgpu::FilterMode, label: &str| {
            device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some(label),
                address_mode_u: wgpu::AddressMode::ClampToEdge,
                address_mode_v: wgpu::AddressMode::ClampToEdge,
                address_mode_w: wgpu::AddressMode::ClampToEdge,
                mag_filter: filter,
                min_filter: filter,
                mipmap_filter: wgpu::FilterMode::Nearest,
                ..Default::default()
            })
        };
        let linear_sampler = sampler(wgpu::FilterMode::Linear, "tableau-linear");
        let nearest_sampler = sampler(wgpu::FilterMode::Nearest, "tableau-nearest");

        let white = create_color_texture(&device, 1, 1, ScaleMode::Nearest, "tableau-white");
        write_pixels(&queue, &white, &[255, 255, 255, 255]);
        let white_bind_group = texture_bind_group(&device, &texture_layout, &white, &nearest_sampler);

        let uniform_alignment = u64::from(device.limits().min_uniform_buffer_offset_alignment);
        let (uniform_buffer, uniform_bind_group) =
            create_uniform_buffer(&device, &uniform_layout, INITIAL_UNIFORM_CAPACITY);

        let main_color = create_color_texture(&device, width, height, ScaleMode::Linear, "tableau-main");
        let main_stencil_view = create_stencil_view(&device, width, height);

        Self {
            device,
            queue,
            context,
            lost,
            next_handle: 1,
            width,
            height,
            main_color,
            main_stencil_view,
            textures: AHashMap::new(),
            targets: AHashMap::new(),
            buffers: AHashMap::new(),
            programs: AHashMap::new(),
            pipelines: AHashMap::new(),
            texture_bind_groups: AHashMap::new(),
            uniform_layout,
            texture_layout,
            pipeline_layout,
            linear_sampler,
            nearest_sampler,
            white_bind_group,
            uniform_buffer,
            uniform_bind_group,
            uniform_alignment,
            uniform_staging: Vec::new(),
            last_uniform: None,
            state: FixedState::new(width, height),
            passes: Vec::new(),
            pending_buffers: AHashSet::new(),
            pending_textures: AHashSet::new(),
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// The default framebuffer's colour texture.
    pub fn main_texture(&self) -> &wgpu::Texture {
        &self.main_color.texture
    }

    fn live(&self) -> Result<(), GpuError> {
        if self.lost.load(Ordering::SeqCst) {
            Err(GpuError::ContextLost)
        } else {
            Ok(())
        }
    }

    fn allocate(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn target_texture(&self, target: Option<RenderTargetHandle>) -> Option<TextureHandle> {
        target.and_then(|target| self.targets.get(&target).map(|t| t.color))
    }

    /// The pass draws and clears currently go to, opened on first use.
    fn current_pass(&mut self) -> &mut PassCommands {
        let target = self.state.target;
        let reusable = self.passes.last().is_some_and(|pass| pass.target == target);
        if !reusable {
            self.passes.push(PassCommands {
                target,
                clear_color: None,
                clear_stencil: false,
                draws: Vec::new(),
            });
        }
        let index = self.passes.len() - 1;
        &mut self.passes[index]
    }

    fn submit_if_buffer_pending(&mut self, buffer: BufferHandle) {
        if self.pending_buffers.contains(&buffer) {
            self.submit();
        }
    }

    fn submit_if_texture_pending(&mut self, texture: TextureHandle) {
        if self.pending_textures.contains(&texture) {
            self.submit();
        }
    }

    /// Copies the uniform blocks recorded so far into a slot of the uniform buffer.
    fn push_uniforms(&mut self) -> u32 {
        if let Some((uniforms, offset)) = self.last_uniform {
            if uniforms == self.state.uniforms {
                return offset;
            }
        }
        let aligned = align_to(self.uniform_staging.len() as u64, self.uniform_alignment) as usize;
        self.uniform_staging.resize(aligned, 0);
        let block = UniformBlock::from(&self.state.uniforms);
        self.uniform_staging
            .extend_from_slice(bytemuck::bytes_of(&block));
        let offset = aligned as u32;
        self.last_uniform = Some((self.state.uniforms, offset));
        offset
    }

    fn ensure_pipeline(&mut self, key: PipelineKey) -> Result<(), GpuError> {
        if self.pipelines.contains_key(&key) {
            return Ok(());
        }
        let module = self.programs.get(&key.program).ok_or(GpuError::UnknownHandle {
            kind: "program",
            handle: key.program.0,
        })?;
        let stencil = match key.stencil {
            Some(stencil) => {
                let face = wgpu::StencilFaceState {
                    compare: compare_function(stencil.compare),
                    fail_op: stencil_operation(stencil.fail),
                    depth_fail_op: stencil_operation(stencil.pass),
                    pass_op: stencil_operation(stencil.pass),
                };
                wgpu::StencilState {
                    front: face,
                    back: face,
                    read_mask: u32::from(stencil.read_mask),
                    write_mask: 0xFF,
                }
            }
            None => wgpu::StencilState {
                front: wgpu::StencilFaceState::IGNORE,
                back: wgpu::StencilFaceState::IGNORE,
                read_mask: 0,
                write_mask: 0,
            },
        };
        let (topology, strip_index_format) = match key.topology {
            Topology::TriangleList => (wgpu::PrimitiveTopology::TriangleList, None),
            Topology::TriangleStrip => (
                wgpu::PrimitiveTopology::TriangleStrip,
                Some(wgpu::IndexFormat::Uint16),
            ),
        };

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = self
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("tableau-pipeline"),
                layout: Some(&self.pipeline_layout),
                vertex: wgpu::VertexState {
                    module,
                    entry_point: Some("vs_main"),
                    compilation_options: Default::default(),
                    buffers: &[wgpu::VertexBufferLayout {
                        array_stride: std::mem::size_of::<super::SpriteVertex>() as wgpu::BufferAddress,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &wgpu::vertex_attr_array![
                            0 => Float32x2,
                            1 => Float32x2,
                            2 => Unorm8x4
                        ],
                    }],
                },
                fragment: Some(wgpu::FragmentState {
                    module,
                    entry_point: Some("fs_main"),
                    compilation_options: Default::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: COLOR_FORMAT,
                        blend: key.blend.map(blend_state),
                        write_mask: if key.color_write {
                            wgpu::ColorWrites::ALL
                        } else {
                            wgpu::ColorWrites::empty()
                        },
                    })],
                }),
                primitive: wgpu::PrimitiveState {
                    topology,
                    strip_index_format,
                    cull_mode: None,
                    ..Default::default()
                },
                depth_stencil: Some(wgpu::DepthStencilState {
                    format: STENCIL_FORMAT,
                    depth_write_enabled: false,
                    depth_compare: wgpu::CompareFunction::Always,
                    stencil,
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(GpuError::ShaderCompilation {
                label: format!("pipeline for program {}", key.program.0),
                message: error.to_string(),
            });
        }
        tracing::debug!(?key, total = self.pipelines.len() + 1, "render pipeline created");
        self.pipelines.insert(key, pipeline);
        Ok(())
    }

    fn ensure_texture_bind_group(&mut self, texture: TextureHandle) -> Result<(), GpuError> {
        if self.texture_bind_groups.contains_key(&texture) {
            return Ok(());
        }
        let gpu = self.textures.get(&texture).ok_or(GpuError::UnknownHandle {
            kind: "texture",
            handle: texture.0,
        })?;
        let sampler = match gpu.scale_mode {
            ScaleMode::Linear => &self.linear_sampler,
            ScaleMode::Nearest => &self.nearest_sampler,
        };
        let bind_group = texture_bind_group(&self.device, &self.texture_layout, gpu, sampler);
        self.texture_bind_groups.insert(texture, bind_group);
        Ok(())
    }

    /// Encodes and submits everything recorded so far.
    fn submit(&mut self) {
        let passes = std::mem::take(&mut self.passes);
        self.pending_buffers.clear();
        self.pending_textures.clear();
        self.last_uniform = None;
        if passes.is_empty() {
            self.uniform_staging.clear();
            return;
        }

        let required = self.uniform_staging.len() as u64;
        if required > self.uniform_buffer.size() {
            let capacity = required.next_power_of_two();
            let (buffer, bind_group) =
                create_uniform_buffer(&self.device, &self.uniform_layout, capacity);
            self.uniform_buffer = buffer;
            self.uniform_bind_group = bind_group;
            tracing::debug!(capacity, "uniform buffer grew");
        }
        if !self.uniform_staging.is_empty() {
            let padded = align_to(required, wgpu::COPY_BUFFER_ALIGNMENT) as usize;
            self.uniform_staging.resize(padded, 0);
            self.queue
                .write_buffer(&self.uniform_buffer, 0, &self.uniform_staging);
        }
        self.uniform_staging.clear();

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("tableau-frame"),
            });
        for pass in &passes {
            let (color_view, stencil_view) = match pass.target {
                None => (&self.main_color.view, &self.main_stencil_view),
                Some(target) => {
                    let Some(gpu) = self.targets.get(&target) else {
                        tracing::warn!(?target, "dropping pass for a deleted render target");
                        continue;
                    };
                    let Some(color) = self.textures.get(&gpu.color) else {
                        continue;
                    };
                    (&color.view, &gpu.stencil_view)
                }
            };
            let load = match pass.clear_color {
                Some([r, g, b, a]) => wgpu::LoadOp::Clear(wgpu::Color {
                    r: f64::from(r),
                    g: f64::from(g),
                    b: f64::from(b),
                    a: f64::from(a),
                }),
                None => wgpu::LoadOp::Load,
            };
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("tableau-pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: color_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: stencil_view,
                    depth_ops: None,
                    stencil_ops: Some(wgpu::Operations {
                        load: if pass.clear_stencil {
                            wgpu::LoadOp::Clear(0)
                        } else {
                            wgpu::LoadOp::Load
                        },
                        store: wgpu::StoreOp::Store,
                    }),
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            for draw in &pass.draws {
                let (Some(pipeline), Some(vertices), Some(indices)) = (
                    self.pipelines.get(&draw.pipeline),
                    self.buffers.get(&draw.vertices),
                    self.buffers.get(&draw.indices),
                ) else {
                    continue;
                };
                let texture_group = match draw.texture {
                    Some(texture) => match self.texture_bind_groups.get(&texture) {
                        Some(group) => group,
                        None => continue,
                    },
                    None => &self.white_bind_group,
                };
                let [x, y, width, height] = draw.viewport;
                render_pass.set_pipeline(pipeline);
                render_pass.set_bind_group(0, &self.uniform_bind_group, &[draw.uniform_offset]);
                render_pass.set_bind_group(1, texture_group, &[]);
                render_pass.set_vertex_buffer(0, vertices.buffer.slice(..));
                render_pass.set_index_buffer(indices.buffer.slice(..), wgpu::IndexFormat::Uint16);
                render_pass.set_viewport(x as f32, y as f32, width as f32, height as f32, 0.0, 1.0);
                render_pass.set_stencil_reference(u32::from(draw.stencil_reference));
                render_pass.draw_indexed(
                    draw.first_index..draw.first_index + draw.index_count,
                    0,
                    0..1,
                );
            }
        }
        self.queue.submit(std::iter::once(encoder.finish()));
    }

    fn delete_texture_now(&mut self, texture: TextureHandle) {
        self.texture_bind_groups.remove(&texture);
        if let Some(gpu) = self.textures.remove(&texture) {
            gpu.texture.destroy();
        }
    }
}

impl GpuBackend for WgpuBackend {
    fn context_id(&self) -> ContextId {
        self.context
    }

    fn is_context_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<(), GpuError> {
        self.live()?;
        self.submit();
        self.main_color = create_color_texture(&self.device, width, height, ScaleMode::Linear, "tableau-main");
        self.main_stencil_view = create_stencil_view(&self.device, width, height);
        self.width = width;
        self.height = height;
        if self.state.target.is_none() {
            self.state.viewport = [0, 0, width, height];
        }
        Ok(())
    }

    fn create_buffer(&mut self, kind: BufferKind, size: usize) -> Result<BufferHandle, GpuError> {
        self.live()?;
        let usage = match kind {
            BufferKind::Vertex => wgpu::BufferUsages::VERTEX,
            BufferKind::Index => wgpu::BufferUsages::INDEX,
        } | wgpu::BufferUsages::COPY_DST;
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(match kind {
                BufferKind::Vertex => "tableau-vertices",
                BufferKind::Index => "tableau-indices",
            }),
            size: align_to(size.max(4) as u64, wgpu::COPY_BUFFER_ALIGNMENT),
            usage,
            mapped_at_creation: false,
        });
        let handle = BufferHandle(self.allocate());
        self.buffers.insert(handle, GpuBuffer { buffer, kind });
        Ok(handle)
    }

    fn write_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: usize,
        data: &[u8],
    ) -> Result<(), GpuError> {
        self.live()?;
        self.submit_if_buffer_pending(buffer);
        let gpu = self.buffers.get(&buffer).ok_or(GpuError::UnknownHandle {
            kind: "buffer",
            handle: buffer.0,
        })?;
        if (offset + data.len()) as u64 > gpu.buffer.size() {
            tracing::warn!(?buffer, kind = ?gpu.kind, len = data.len(), "buffer write out of range");
            return Err(GpuError::UnknownHandle {
                kind: "buffer range",
                handle: buffer.0,
            });
        }
        if data.len() % wgpu::COPY_BUFFER_ALIGNMENT as usize == 0 {
            self.queue.write_buffer(&gpu.buffer, offset as u64, data);
        } else {
            let mut padded = data.to_vec();
            padded.resize(align_to(data.len() as u64, wgpu::COPY_BUFFER_ALIGNMENT) as usize, 0);
            self.queue.write_buffer(&gpu.buffer, offset as u64, &padded);
        }
        Ok(())
    }

    fn delete_buffer(&mut self, buffer: BufferHandle) {
        self.submit_if_buffer_pending(buffer);
        if let Some(gpu) = self.buffers.remove(&buffer) {
            gpu.buffer.destroy();
        }
    }

    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        scale_mode: ScaleMode,
    ) -> Result<TextureHandle, GpuError> {
        self.live()?;
        let texture = create_color_texture(&self.device, width, height, scale_mode, "tableau-texture");
        let handle = TextureHandle(self.allocate());
        self.textures.insert(handle, texture);
        Ok(handle)
    }

    fn upload_texture(
        &mut self,
        texture: TextureHandle,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<(), GpuError> {
        self.live()?;
        self.submit_if_texture_pending(texture);
        let gpu = self.textures.get_mut(&texture).ok_or(GpuError::UnknownHandle {
            kind: "texture",
            handle: texture.0,
        })?;
        if gpu.width != width.max(1) || gpu.height != height.max(1) {
            let scale_mode = gpu.scale_mode;
            *gpu = create_color_texture(&self.device, width, height, scale_mode, "tableau-texture");
            self.texture_bind_groups.remove(&texture);
        }
        if width > 0 && height > 0 {
            write_pixels(&self.queue, gpu, pixels);
        }
        Ok(())
    }

    fn delete_texture(&mut self, texture: TextureHandle) {
        self.submit_if_texture_pending(texture);
        self.delete_texture_now(texture);
    }

    fn bind_texture(&mut self, texture: Option<TextureHandle>) -> Result<(), GpuError> {
        self.live()?;
        if let Some(texture) = texture {
            if !self.textures.contains_key(&texture) {
                return Err(GpuError::UnknownHandle {
                    kind: "texture",
                    handle: texture.0,
                });
            }
        }
        self.state.texture = texture;
        Ok(())
    }

    fn create_render_target(
        &mut self,
        width: u32,
        height: u32,
    ) -> Result<RenderTargetHandle, GpuError> {
        self.live()?;
        let color = self.create_texture(width, height, ScaleMode::Linear)?;
        let target = RenderTargetHandle(self.allocate());
        self.targets.insert(
            target,
            GpuTarget {
                color,
                stencil_view: create_stencil_view(&self.device, width, height),
            },
        );
        Ok(target)
    }

    fn resize_render_target(
        &mut self,
        target: RenderTargetHandle,
        width: u32,
        height: u32,
    ) -> Result<(), GpuError> {
        self.live()?;
        let color = self.target_texture(Some(target)).ok_or(GpuError::UnknownHandle {
            kind: "render target",
            handle: target.0,
        })?;
        self.submit_if_texture_pending(color);
        if let Some(gpu) = self.textures.get_mut(&color) {
            if gpu.width == width.max(1) && gpu.height == height.max(1) {
                return Ok(());
            }
            *gpu = create_color_texture(&self.device, width, height, ScaleMode::Linear, "tableau-texture");
        }
        self.texture_bind_groups.remove(&color);
        if let Some(gpu) = self.targets.get_mut(&target) {
            gpu.stencil_view = create_stencil_view(&self.device, width, height);
        }
        Ok(())
    }

    fn render_target_texture(&self, target: RenderTargetHandle) -> Option<TextureHandle> {
        self.target_texture(Some(target))
    }

    fn bind_render_target(&mut self, target: Option<RenderTargetHandle>) -> Result<(), GpuError> {
        self.live()?;
        if let Some(handle) = target {
            if !self.targets.contains_key(&handle) {
                return Err(GpuError::UnknownHandle {
                    kind: "render target",
                    handle: handle.0,
                });
            }
        }
        self.state.target = target;
        Ok(())
    }

    fn delete_render_target(&mut self, target: RenderTargetHandle) {
        let Some(color) = self.target_texture(Some(target)) else {
            return;
        };
        self.submit_if_texture_pending(color);
        self.targets.remove(&target);
        self.delete_texture_now(color);
        if self.state.target == Some(target) {
            self.state.target = None;
        }
    }

    fn set_viewport(&mut self, x: u32, y: u32, width: u32, height: u32) {
        self.state.viewport = [x, y, width, height];
    }

    fn clear(&mut self, color: Option<[f32; 4]>, stencil: bool) -> Result<(), GpuError> {
        self.live()?;
        if self.current_pass().draws.is_empty() {
            let pass = self.current_pass();
            if color.is_some() {
                pass.clear_color = color;
            }
            pass.clear_stencil |= stencil;
            return Ok(());
        }
        let target = self.state.target;
        self.passes.push(PassCommands {
            target,
            clear_color: color,
            clear_stencil: stencil,
            draws: Vec::new(),
        });
        Ok(())
    }

    fn set_blend(&mut self, blend: Option<BlendFunc>) {
        self.state.blend = blend;
    }

    fn set_color_mask(&mut self, write: bool) {
        self.state.color_write = write;
    }

    fn set_stencil_test(&mut self, enabled: bool) {
        self.state.stencil_test = enabled;
    }

    fn stencil_func(&mut self, func: CompareFunction, reference: u8, mask: u8) {
        self.state.stencil_func = (func, reference, mask);
    }

    fn stencil_op(&mut self, fail: StencilOp, pass: StencilOp) {
        self.state.stencil_op = (fail, pass);
    }

    fn compile_program(&mut self, source: &ProgramSource<'_>) -> Result<ProgramHandle, GpuError> {
        self.live()?;
        let wgsl = format!("{PRELUDE}\n{VERTEX}\n{}", source.fragment_wgsl);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(source.label),
                source: wgpu::ShaderSource::Wgsl(wgsl.into()),
            });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            let message = error.to_string();
            tracing::warn!(label = source.label, %message, "shader failed to compile");
            return Err(GpuError::ShaderCompilation {
                label: source.label.to_owned(),
                message,
            });
        }
        let handle = ProgramHandle(self.allocate());
        self.programs.insert(handle, module);
        tracing::debug!(label = source.label, ?handle, "program compiled");
        Ok(handle)
    }

    fn delete_program(&mut self, program: ProgramHandle) {
        self.programs.remove(&program);
        self.pipelines.retain(|key, _| key.program != program);
        if self.state.program == Some(program) {
            self.state.program = None;
        }
    }

    fn use_program(&mut self, program: ProgramHandle) -> Result<(), GpuError> {
        self.live()?;
        if !self.programs.contains_key(&program) {
            return Err(GpuError::UnknownHandle {
                kind: "program",
                handle: program.0,
            });
        }
        self.state.program = Some(program);
        Ok(())
    }

    fn set_uniforms(&mut self, uniforms: &Uniforms) {
        self.state.uniforms = *uniforms;
    }

    fn draw_indexed(
        &mut self,
        topology: Topology,
        vertices: BufferHandle,
        indices: BufferHandle,
        first_index: u32,
        index_count: u32,
    ) -> Result<(), GpuError> {
        self.live()?;
        let program = self.state.program.ok_or(GpuError::NoProgram)?;
        if let Some(texture) = self.state.texture {
            if Some(texture) == self.target_texture(self.state.target) {
                return Err(GpuError::FeedbackLoop(texture.0));
            }
            self.ensure_texture_bind_group(texture)?;
        }
        for buffer in [vertices, indices] {
            if !self.buffers.contains_key(&buffer) {
                return Err(GpuError::UnknownHandle {
                    kind: "buffer",
                    handle: buffer.0,
                });
            }
        }
        let (compare, stencil_reference, read_mask) = self.state.stencil_func;
        let (fail, pass) = self.state.stencil_op;
        let key = PipelineKey {
            program,
            blend: self.state.blend,
            color_write: self.state.color_write,
            stencil: self.state.stencil_test.then_some(StencilKey {
                compare,
                read_mask,
                fail,
                pass,
            }),
            topology,
        };
        self.ensure_pipeline(key)?;

        let uniform_offset = self.push_uniforms();
        let texture = self.state.texture;
        let viewport = self.state.viewport;
        self.current_pass().draws.push(DrawCommand {
            pipeline: key,
            vertices,
            indices,
            first_index,
            index_count,
            uniform_offset,
            texture,
            stencil_reference,
            viewport,
        });
        self.pending_buffers.insert(vertices);
        self.pending_buffers.insert(indices);
        if let Some(texture) = texture {
            self.pending_textures.insert(texture);
        }
        if let Some(color) = self.target_texture(self.state.target) {
            self.pending_textures.insert(color);
        }
        Ok(())
    }

    fn begin_frame(&mut self) -> Result<(), GpuError> {
        self.live()
    }

    fn end_frame(&mut self) -> Result<(), GpuError> {
        self.live()?;
        self.submit();
        Ok(())
    }

    fn read_pixels(&mut self, out: &mut Vec<u8>) -> Result<(u32, u32), GpuError> {
        self.live()?;
        self.submit();
        let (width, height) = (self.width.max(1), self.height.max(1));
        let unpadded_bytes_per_row = width * 4;
        let padded_bytes_per_row = align_to(
            u64::from(unpadded_bytes_per_row),
            u64::from(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT),
        ) as u32;
        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("tableau-readback"),
            size: u64::from(padded_bytes_per_row) * u64::from(height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("tableau-readback"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &self.main_color.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bytes_per_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = readback.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            if sender.send(result).is_err() {
                tracing::warn!("readback receiver dropped before mapping finished");
            }
        });
        let _ = self.device.poll(wgpu::MaintainBase::Wait);
        match receiver.recv() {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::warn!(%error, "failed to map readback buffer");
                return Err(GpuError::ContextLost);
            }
            Err(error) => {
                tracing::warn!(%error, "readback mapping never completed");
                return Err(GpuError::ContextLost);
            }
        }

        out.clear();
        out.reserve((unpadded_bytes_per_row * height) as usize);
        {
            let mapped = slice.get_mapped_range();
            for row in mapped.chunks(padded_bytes_per_row as usize) {
                out.extend_from_slice(&row[..unpadded_bytes_per_row as usize]);
            }
        }
        readback.unmap();
        Ok((width, height))
    }
}

fn align_to(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

fn create_color_texture(
    device: &wgpu::Device,
    width: u32,
    height: u32,
    scale_mode: ScaleMode,
    label: &str,
) -> GpuTexture {
    let (width, height) = (width.max(1), height.max(1));
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: COLOR_FORMAT,
        usage: wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::RENDER_ATTACHMENT
            | wgpu::TextureUsages::COPY_DST
            | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    GpuTexture {
        texture,
        view,
        width,
        height,
        scale_mode,
    }
}

fn create_stencil_view(device: &wgpu::Device, width: u32, height: u32) -> wgpu::TextureView {
    device
        .create_texture(&wgpu::TextureDescriptor {
            label: Some("tableau-stencil"),
            size: wgpu::Extent3d {
                width: width.max(1),
                height: height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: STENCIL_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        })
        .create_view(&wgpu::TextureViewDescriptor::default())
}

fn write_pixels(queue: &wgpu::Queue, texture: &GpuTexture, pixels: &[u8]) {
    let expected = (texture.width * texture.height * 4) as usize;
    if pixels.len() < expected {
        tracing::warn!(expected, actual = pixels.len(), "texture upload is too short");
        return;
    }
    queue.write_texture(
        wgpu::TexelCopyTextureInfo {
            texture: &texture.texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        &pixels[..expected],
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(texture.width * 4),
            rows_per_image: Some(texture.height),
        },
        wgpu::Extent3d {
            width: texture.width,
            height: texture.height,
            depth_or_array_layers: 1,
        },
    );
}

fn texture_bind_group(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    texture: &GpuTexture,
    sampler: &wgpu::Sampler,
) -> wgpu::BindGroup {
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("tableau-texture"),
        layout,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::TextureView(&texture.view),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: wgpu::BindingResource::Sampler(sampler),
            },
        ],
    })
}

fn create_uniform_buffer(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    capacity: u64,
) -> (wgpu::Buffer, wgpu::BindGroup) {
    let buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("tableau-uniforms"),
        size: capacity,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("tableau-uniforms"),
        layout,
        entries: &[wgpu::BindGroupEntry {
            binding: 0,
            resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                buffer: &buffer,
                offset: 0,
                size: wgpu::BufferSize::new(UNIFORM_BLOCK_SIZE),
            }),
        }],
    });
    (buffer, bind_group)
}

fn blend_state(func: BlendFunc) -> wgpu::BlendState {
    let component = wgpu::BlendComponent {
        src_factor: blend_factor(func.src),
        dst_factor: blend_factor(func.dst),
        operation: wgpu::BlendOperation::Add,
    };
    wgpu::BlendState {
        color: component,
        alpha: component,
    }
}

fn blend_factor(factor: BlendFactor) -> wgpu::BlendFactor {
    match factor {
        BlendFactor::Zero => wgpu::BlendFactor::Zero,
        BlendFactor::One => wgpu::BlendFactor::One,
        BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
        BlendFactor::OneMinusSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
        BlendFactor::SrcColor => wgpu::BlendFactor::Src,
        BlendFactor::OneMinusSrcColor => wgpu::BlendFactor::OneMinusSrc,
        BlendFactor::DstColor => wgpu::BlendFactor::Dst,
        BlendFactor::OneMinusDstColor => wgpu::BlendFactor::OneMinusDst,
        BlendFactor::DstAlpha => wgpu::BlendFactor::DstAlpha,
        BlendFactor::OneMinusDstAlpha => wgpu::BlendFactor::OneMinusDstAlpha,
    }
}

fn compare_function(func: CompareFunction) -> wgpu::CompareFunction {
    match func {
        CompareFunction::Never => wgpu::CompareFunction::Never,
        CompareFunction::Less => wgpu::CompareFunction::Less,
        CompareFunction::Equal => wgpu::CompareFunction::Equal,
        CompareFunction::LessEqual => wgpu::CompareFunction::LessEqual,
        CompareFunction::Greater => wgpu::CompareFunction::Greater,
        CompareFunction::NotEqual => wgpu::CompareFunction::NotEqual,
        CompareFunction::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
        CompareFunction::Always => wgpu::CompareFunction::Always,
    }
}

fn stencil_operation(op: StencilOp) -> wgpu::StencilOperation {
    match op {
        StencilOp::Keep => wgpu::StencilOperation::Keep,
        StencilOp::Zero => wgpu::StencilOperation::Zero,
        StencilOp::Replace => wgpu::StencilOperation::Replace,
        StencilOp::Invert => wgpu::StencilOperation::Invert,
        StencilOp::IncrementClamp => wgpu::StencilOperation::IncrementClamp,
        StencilOp::DecrementClamp => wgpu::StencilOperation::DecrementClamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_offsets_respect_alignment() {
        assert_eq!(align_to(0, 256), 0);
        assert_eq!(align_to(160, 256), 256);
        assert_eq!(align_to(257, 256), 512);
    }

    #[test]
    fn premultiplied_normal_blend_maps_to_one_minus_src_alpha() {
        let state = blend_state(BlendFunc::new(BlendFactor::One, BlendFactor::OneMinusSrcAlpha));
        assert_eq!(state, wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING);
    }
}
