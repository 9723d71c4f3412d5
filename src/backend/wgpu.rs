//! [`Graphics`] on top of wgpu.
//!
//! `WgpuGraphics` emulates the classic bind-then-draw state model over
//! wgpu's explicit one: framebuffers are lists of attachments resolved into a
//! render pass at draw time, and programs carry their own uniform buffers and
//! a pipeline per combination of target formats. Every clear, draw and copy
//! is encoded and submitted on its own, so all calls complete in order on a
//! single command stream.
//!
//! Fragment programs are WGSL. A fullscreen-triangle vertex stage is
//! prepended to the sources; it hands the fragment stage a `QuadOutput`:
//!
//! ```wgsl
//! @group(0) @binding(0) var scene: texture_2d<f32>;
//! @group(0) @binding(1) var scene_sampler: sampler;
//! @group(0) @binding(2) var<uniform> gain: f32;
//!
//! @fragment
//! fn fs(in: QuadOutput) -> @location(0) vec4f {
//!     return textureSample(scene, scene_sampler, in.uv) * gain;
//! }
//! ```
//!
//! Depth buffers must be declared `texture_depth_2d`; they are always
//! sampled with nearest filtering. `ClampToBorder` and `Clamp` wrap modes
//! sample as `ClampToEdge`.

use std::collections::HashMap;
use std::sync::mpsc::{self, TryRecvError};

use slotmap::SlotMap;

use crate::backend::wgsl::{self, Reflection};
use crate::error::{FxError, Result};
use crate::gpu::GpuContext;
use crate::graphics::{
    AttachmentPoint, Attachments, FramebufferId, FramebufferStatus, Graphics, Image, Limits,
    ProgramId, RenderbufferId, TextureId,
};
use crate::program::UniformValue;
use crate::texture::{
    Filter, RenderbufferDesc, RenderbufferFormat, Sampling, TexelFormat, TextureDesc, Wrap,
};
use crate::viewport::ViewportRect;

const QUAD_VERTEX: &str = r#"
struct QuadOutput {
    @builtin(position) position: vec4f,
    @location(0) uv: vec2f,
}

@vertex
fn vs(@builtin(vertex_index) vertex_index: u32) -> QuadOutput {
    let corner = vec2f(f32((vertex_index << 1u) & 2u), f32(vertex_index & 2u));
    var out: QuadOutput;
    out.position = vec4f(corner * 2.0 - 1.0, 0.5, 1.0);
    out.uv = vec2f(corner.x, 1.0 - corner.y);
    return out;
}
"#;

const BLIT_FRAGMENT: &str = r#"
@group(0) @binding(0) var source: texture_2d<f32>;
@group(0) @binding(1) var source_sampler: sampler;

@fragment
fn fs(in: QuadOutput) -> @location(0) vec4f {
    return textureSample(source, source_sampler, in.uv);
}
"#;

const TEXTURE_USAGE: wgpu::TextureUsages = wgpu::TextureUsages::TEXTURE_BINDING
    .union(wgpu::TextureUsages::RENDER_ATTACHMENT)
    .union(wgpu::TextureUsages::COPY_SRC)
    .union(wgpu::TextureUsages::COPY_DST);

fn texture_format(format: TexelFormat) -> wgpu::TextureFormat {
    match format {
        TexelFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
        TexelFormat::RgbaFloat => wgpu::TextureFormat::Rgba16Float,
        TexelFormat::Luminance8 => wgpu::TextureFormat::R8Unorm,
        TexelFormat::LuminanceFloat => wgpu::TextureFormat::R16Float,
        TexelFormat::Depth => wgpu::TextureFormat::Depth32Float,
        TexelFormat::DepthStencil => wgpu::TextureFormat::Depth24PlusStencil8,
    }
}

fn renderbuffer_format(format: RenderbufferFormat) -> wgpu::TextureFormat {
    match format {
        RenderbufferFormat::Rgb | RenderbufferFormat::Rgba => wgpu::TextureFormat::Rgba8Unorm,
        RenderbufferFormat::Depth => wgpu::TextureFormat::Depth32Float,
        RenderbufferFormat::Stencil => wgpu::TextureFormat::Stencil8,
    }
}

fn address_mode(wrap: Wrap) -> wgpu::AddressMode {
    match wrap {
        Wrap::Clamp | Wrap::ClampToEdge | Wrap::ClampToBorder => wgpu::AddressMode::ClampToEdge,
        Wrap::Repeat => wgpu::AddressMode::Repeat,
        Wrap::MirroredRepeat => wgpu::AddressMode::MirrorRepeat,
    }
}

fn filter_mode(filter: Filter) -> wgpu::FilterMode {
    match filter {
        Filter::Nearest => wgpu::FilterMode::Nearest,
        Filter::Linear => wgpu::FilterMode::Linear,
    }
}

fn extent(width: u32, height: u32) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width,
        height,
        depth_or_array_layers: 1,
    }
}

fn unorm8(byte: u8) -> f32 {
    byte as f32 / 255.0
}

fn to_unorm8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

struct GpuTexture {
    desc: TextureDesc,
    texture: wgpu::Texture,
    /// Full view, used as a render attachment.
    view: wgpu::TextureView,
    /// Depth-only view for depth+stencil formats, otherwise the full view.
    sample_view: wgpu::TextureView,
}

struct GpuRenderbuffer {
    desc: RenderbufferDesc,
    view: wgpu::TextureView,
    format: wgpu::TextureFormat,
}

struct GpuFramebuffer {
    label: String,
    colors: Vec<Option<Image>>,
    depth: Option<Image>,
    stencil: Option<Image>,
    draw_targets: Vec<Option<u32>>,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    colors: Vec<Option<wgpu::TextureFormat>>,
    depth: Option<wgpu::TextureFormat>,
}

struct GpuProgram {
    label: String,
    module: wgpu::ShaderModule,
    reflection: Reflection,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    /// Parallel to `reflection.uniforms`.
    uniform_buffers: Vec<wgpu::Buffer>,
    /// Texture unit per `reflection.textures` entry.
    units: Vec<Option<u32>>,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
}

enum Screen {
    Window {
        frame: Option<(wgpu::SurfaceTexture, wgpu::TextureView)>,
    },
    Headless {
        texture: wgpu::Texture,
        view: wgpu::TextureView,
    },
}

#[derive(Clone, Debug, PartialEq)]
struct AmbientState {
    framebuffer: Option<FramebufferId>,
    program: Option<ProgramId>,
    units: Vec<Option<TextureId>>,
    viewport: ViewportRect,
}

type Target = (wgpu::TextureView, wgpu::TextureFormat);

struct Targets {
    colors: Vec<Option<Target>>,
    depth: Option<Target>,
    width: u32,
    height: u32,
}

/// GPU implementation of [`Graphics`].
pub struct WgpuGraphics {
    gpu: GpuContext,
    limits: Limits,
    textures: SlotMap<TextureId, GpuTexture>,
    renderbuffers: SlotMap<RenderbufferId, GpuRenderbuffer>,
    framebuffers: SlotMap<FramebufferId, GpuFramebuffer>,
    programs: SlotMap<ProgramId, GpuProgram>,
    samplers: HashMap<Sampling, wgpu::Sampler>,
    blit: ProgramId,
    screen: Screen,
    state: AmbientState,
    stack: Vec<AmbientState>,
}

impl WgpuGraphics {
    pub fn new(gpu: GpuContext) -> Result<Self> {
        let device_limits = gpu.device.limits();
        let limits = Limits {
            max_color_attachments: device_limits.max_color_attachments,
            max_texture_bindings: device_limits
                .max_sampled_textures_per_shader_stage
                .min(device_limits.max_samplers_per_shader_stage),
        };
        let screen = match gpu.surface {
            Some(_) => Screen::Window { frame: None },
            None => Self::headless_screen(&gpu),
        };
        let viewport = ViewportRect::sized(gpu.width(), gpu.height());

        let mut gfx = Self {
            gpu,
            limits,
            textures: SlotMap::with_key(),
            renderbuffers: SlotMap::with_key(),
            framebuffers: SlotMap::with_key(),
            programs: SlotMap::with_key(),
            samplers: HashMap::new(),
            blit: ProgramId::default(),
            screen,
            state: AmbientState {
                framebuffer: None,
                program: None,
                units: vec![None; limits.max_texture_bindings as usize],
                viewport,
            },
            stack: Vec::new(),
        };
        gfx.blit = gfx.create_program("blit", &[BLIT_FRAGMENT])?;
        gfx.set_uniform(gfx.blit, "source", &UniformValue::Sampler(0))?;
        log::debug!(
            "wgpu graphics ready: {} color attachments, {} texture bindings",
            limits.max_color_attachments,
            limits.max_texture_bindings
        );
        Ok(gfx)
    }

    fn headless_screen(gpu: &GpuContext) -> Screen {
        let texture = gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Headless Screen"),
            size: extent(gpu.width(), gpu.height()),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: gpu.config.format,
            usage: TEXTURE_USAGE,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Screen::Headless { texture, view }
    }

    pub fn gpu(&self) -> &GpuContext {
        &self.gpu
    }

    pub fn screen_size(&self) -> (u32, u32) {
        (self.gpu.width(), self.gpu.height())
    }

    /// Resizes the window surface or the headless screen texture.
    pub fn resize_screen(&mut self, width: u32, height: u32) {
        self.gpu.resize(width, height);
        if let Screen::Headless { .. } = self.screen {
            self.screen = Self::headless_screen(&self.gpu);
        }
    }

    /// Acquires the next window frame. No-op when headless.
    pub fn begin_frame(&mut self) -> Result<()> {
        let Some(surface) = &self.gpu.surface else {
            return Ok(());
        };
        let frame = match surface.get_current_texture() {
            Ok(frame) => frame,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                surface.configure(&self.gpu.device, &self.gpu.config);
                surface
                    .get_current_texture()
                    .map_err(|e| FxError::creation(format!("failed to acquire frame: {e}")))?
            }
            Err(e) => return Err(FxError::creation(format!("failed to acquire frame: {e}"))),
        };
        let view = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        self.screen = Screen::Window {
            frame: Some((frame, view)),
        };
        Ok(())
    }

    /// Presents the frame acquired by [`begin_frame`](Self::begin_frame).
    pub fn present(&mut self) {
        if let Screen::Window { frame } = &mut self.screen {
            if let Some((frame, _)) = frame.take() {
                frame.present();
            }
        }
    }

    /// Reads the headless screen back.
    pub fn read_screen(&mut self) -> Result<Vec<[f32; 4]>> {
        let Screen::Headless { texture, .. } = &self.screen else {
            return Err(FxError::config("only a headless screen can be read back"));
        };
        let texture = texture.clone();
        let (width, height) = self.screen_size();
        let bytes = self.read_back(&texture, wgpu::TextureAspect::All, 4, width, height)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|p| [unorm8(p[0]), unorm8(p[1]), unorm8(p[2]), unorm8(p[3])])
            .collect())
    }

    fn texture(&self, id: TextureId) -> Result<&GpuTexture> {
        self.textures
            .get(id)
            .ok_or(FxError::UnknownHandle { kind: "texture" })
    }

    fn framebuffer(&self, id: FramebufferId) -> Result<&GpuFramebuffer> {
        self.framebuffers
            .get(id)
            .ok_or(FxError::UnknownHandle { kind: "framebuffer" })
    }

    fn framebuffer_mut(&mut self, id: FramebufferId) -> Result<&mut GpuFramebuffer> {
        self.framebuffers
            .get_mut(id)
            .ok_or(FxError::UnknownHandle { kind: "framebuffer" })
    }

    fn program(&self, id: ProgramId) -> Result<&GpuProgram> {
        self.programs
            .get(id)
            .ok_or(FxError::UnknownHandle { kind: "program" })
    }

    fn allocate(&self, desc: &TextureDesc) -> Result<GpuTexture> {
        if desc.width == 0 || desc.height == 0 {
            return Err(FxError::config(format!(
                "texture '{}' cannot be {}x{}",
                desc.label, desc.width, desc.height
            )));
        }
        let format = texture_format(desc.format);
        let texture = self.gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&desc.label),
            size: extent(desc.width, desc.height),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: TEXTURE_USAGE,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let sample_view = if desc.format == TexelFormat::DepthStencil {
            texture.create_view(&wgpu::TextureViewDescriptor {
                aspect: wgpu::TextureAspect::DepthOnly,
                ..Default::default()
            })
        } else {
            view.clone()
        };
        Ok(GpuTexture {
            desc: desc.clone(),
            texture,
            view,
            sample_view,
        })
    }

    fn allocate_renderbuffer(&self, desc: &RenderbufferDesc) -> Result<GpuRenderbuffer> {
        if desc.width == 0 || desc.height == 0 {
            return Err(FxError::config(format!(
                "renderbuffer '{}' cannot be {}x{}",
                desc.label, desc.width, desc.height
            )));
        }
        let format = renderbuffer_format(desc.format);
        let texture = self.gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&desc.label),
            size: extent(desc.width, desc.height),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        Ok(GpuRenderbuffer {
            desc: desc.clone(),
            view: texture.create_view(&wgpu::TextureViewDescriptor::default()),
            format,
        })
    }

    fn sampler(&mut self, sampling: Sampling) -> wgpu::Sampler {
        let device = &self.gpu.device;
        self.samplers
            .entry(sampling)
            .or_insert_with(|| {
                device.create_sampler(&wgpu::SamplerDescriptor {
                    label: Some("Hoplite FX Sampler"),
                    address_mode_u: address_mode(sampling.wrap_s),
                    address_mode_v: address_mode(sampling.wrap_t),
                    address_mode_w: wgpu::AddressMode::ClampToEdge,
                    mag_filter: filter_mode(sampling.mag_filter),
                    min_filter: filter_mode(sampling.min_filter),
                    mipmap_filter: wgpu::FilterMode::Nearest,
                    ..Default::default()
                })
            })
            .clone()
    }

    fn image_target(&self, image: Image) -> Result<Target> {
        match image {
            Image::Texture(id) => {
                let texture = self.texture(id)?;
                Ok((texture.view.clone(), texture.texture.format()))
            }
            Image::Renderbuffer(id) => {
                let rb = self
                    .renderbuffers
                    .get(id)
                    .ok_or(FxError::UnknownHandle {
                        kind: "renderbuffer",
                    })?;
                Ok((rb.view.clone(), rb.format))
            }
        }
    }

    fn resolve_targets(&self) -> Result<Targets> {
        let Some(id) = self.state.framebuffer else {
            let view = match &self.screen {
                Screen::Window { frame: Some((_, view)) } => view.clone(),
                Screen::Window { frame: None } => {
                    return Err(FxError::usage(
                        "begin_frame must be called before drawing to the window",
                    ));
                }
                Screen::Headless { view, .. } => view.clone(),
            };
            return Ok(Targets {
                colors: vec![Some((view, self.gpu.config.format))],
                depth: None,
                width: self.gpu.width(),
                height: self.gpu.height(),
            });
        };

        let status = self.framebuffer_status(id)?;
        let fb = self.framebuffer(id)?;
        if !status.is_complete() {
            return Err(FxError::config(format!(
                "framebuffer '{}' is incomplete: {}",
                fb.label, status
            )));
        }
        let depth_image = fb.depth.or(fb.stencil);
        let first = fb
            .colors
            .iter()
            .flatten()
            .chain(depth_image.iter())
            .next()
            .copied()
            .ok_or_else(|| FxError::config(format!("framebuffer '{}' is empty", fb.label)))?;
        let (_, width, height) = self.image_info(first)?;

        let mut colors = Vec::with_capacity(fb.draw_targets.len());
        for target in &fb.draw_targets {
            let image = target.and_then(|slot| fb.colors.get(slot as usize).copied().flatten());
            colors.push(image.map(|i| self.image_target(i)).transpose()?);
        }
        Ok(Targets {
            colors,
            depth: depth_image.map(|i| self.image_target(i)).transpose()?,
            width,
            height,
        })
    }

    /// Records the pipeline for `key` on `program` if it is not cached yet.
    fn ensure_pipeline(&mut self, program: ProgramId, key: &PipelineKey) -> Result<()> {
        let device = &self.gpu.device;
        let program = self
            .programs
            .get_mut(program)
            .ok_or(FxError::UnknownHandle { kind: "program" })?;
        if program.pipelines.contains_key(key) {
            return Ok(());
        }

        let targets: Vec<Option<wgpu::ColorTargetState>> = key
            .colors
            .iter()
            .enumerate()
            .map(|(location, format)| {
                format.map(|format| wgpu::ColorTargetState {
                    format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: if program.reflection.outputs.contains(&(location as u32)) {
                        wgpu::ColorWrites::ALL
                    } else {
                        wgpu::ColorWrites::empty()
                    },
                })
            })
            .collect();
        let depth_stencil = key.depth.map(|format| wgpu::DepthStencilState {
            format,
            depth_write_enabled: format.has_depth_aspect(),
            depth_compare: wgpu::CompareFunction::Always,
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        });

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(&program.label),
            layout: Some(&program.pipeline_layout),
            vertex: wgpu::VertexState {
                module: &program.module,
                entry_point: Some("vs"),
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &program.module,
                entry_point: Some("fs"),
                targets: &targets,
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                ..Default::default()
            },
            depth_stencil,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(FxError::config(format!(
                "program '{}' cannot draw into this framebuffer: {}",
                program.label, err
            )));
        }
        program.pipelines.insert(key.clone(), pipeline);
        Ok(())
    }

    fn bind_group(&mut self, program: ProgramId) -> Result<wgpu::BindGroup> {
        let mut textures = Vec::new();
        {
            let gpu_program = self.program(program)?;
            for (decl, unit) in gpu_program.reflection.textures.iter().zip(&gpu_program.units) {
                let texture = unit
                    .and_then(|u| self.state.units.get(u as usize).copied().flatten())
                    .ok_or_else(|| {
                        FxError::config(format!(
                            "program '{}': no texture bound for sampler '{}'",
                            gpu_program.label, decl.name
                        ))
                    })?;
                let texture = self.texture(texture)?;
                if decl.depth == texture.desc.format.is_color() {
                    return Err(FxError::config(format!(
                        "program '{}': sampler '{}' expects a {} texture",
                        gpu_program.label,
                        decl.name,
                        if decl.depth { "depth" } else { "color" }
                    )));
                }
                let sampling = if decl.depth {
                    texture.desc.sampling.with_filter(Filter::Nearest, Filter::Nearest)
                } else {
                    texture.desc.sampling
                };
                textures.push((texture.sample_view.clone(), sampling));
            }
        }
        let samplers: Vec<wgpu::Sampler> = textures
            .iter()
            .map(|(_, sampling)| self.sampler(*sampling))
            .collect();

        let gpu_program = self.program(program)?;
        let mut entries = Vec::new();
        for (decl, buffer) in gpu_program
            .reflection
            .uniforms
            .iter()
            .zip(&gpu_program.uniform_buffers)
        {
            entries.push(wgpu::BindGroupEntry {
                binding: decl.binding,
                resource: buffer.as_entire_binding(),
            });
        }
        for ((decl, (view, _)), sampler) in gpu_program
            .reflection
            .textures
            .iter()
            .zip(&textures)
            .zip(&samplers)
        {
            entries.push(wgpu::BindGroupEntry {
                binding: decl.binding,
                resource: wgpu::BindingResource::TextureView(view),
            });
            if let Some(binding) = decl.sampler {
                entries.push(wgpu::BindGroupEntry {
                    binding,
                    resource: wgpu::BindingResource::Sampler(sampler),
                });
            }
        }
        Ok(self
            .gpu
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(&gpu_program.label),
                layout: &gpu_program.bind_group_layout,
                entries: &entries,
            }))
    }

    fn depth_attachment(
        target: &Target,
        load: impl Fn() -> (wgpu::LoadOp<f32>, wgpu::LoadOp<u32>),
    ) -> wgpu::RenderPassDepthStencilAttachment<'_> {
        let (view, format) = target;
        let (depth_load, stencil_load) = load();
        wgpu::RenderPassDepthStencilAttachment {
            view,
            depth_ops: format.has_depth_aspect().then_some(wgpu::Operations {
                load: depth_load,
                store: wgpu::StoreOp::Store,
            }),
            stencil_ops: format.has_stencil_aspect().then_some(wgpu::Operations {
                load: stencil_load,
                store: wgpu::StoreOp::Store,
            }),
        }
    }

    fn submit(&self, encoder: wgpu::CommandEncoder) {
        self.gpu.queue.submit(Some(encoder.finish()));
    }

    fn encoder(&self, label: &str) -> wgpu::CommandEncoder {
        self.gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }

    /// Copies one mip level of `texture` into host memory, rows unpadded.
    fn read_back(
        &self,
        texture: &wgpu::Texture,
        aspect: wgpu::TextureAspect,
        bytes_per_texel: u32,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>> {
        let row = width * bytes_per_texel;
        let padded = row.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let buffer = self.gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Hoplite FX Read-back"),
            size: padded as u64 * height as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self.encoder("Read-back");
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            extent(width, height),
        );
        self.submit(encoder);

        let slice = buffer.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let mapped = loop {
            self.gpu
                .device
                .poll(wgpu::PollType::Poll)
                .map_err(|e| FxError::creation(format!("device poll failed: {e}")))?;
            match rx.try_recv() {
                Ok(result) => break result,
                Err(TryRecvError::Empty) => std::thread::yield_now(),
                Err(TryRecvError::Disconnected) => {
                    return Err(FxError::creation("read-back mapping was dropped"));
                }
            }
        };
        mapped.map_err(|e| FxError::creation(format!("read-back mapping failed: {e}")))?;

        let data = slice.get_mapped_range();
        let mut bytes = Vec::with_capacity((row * height) as usize);
        for line in data.chunks(padded as usize) {
            bytes.extend_from_slice(&line[..row as usize]);
        }
        drop(data);
        buffer.unmap();
        Ok(bytes)
    }
}

impl Graphics for WgpuGraphics {
    fn limits(&self) -> Limits {
        self.limits
    }

    // ------------------------------------------------------------------
    // Textures
    // ------------------------------------------------------------------

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId> {
        log::trace!(
            "Creating texture '{}' {}x{} {:?}",
            desc.label,
            desc.width,
            desc.height,
            desc.format
        );
        let texture = self.allocate(desc)?;
        Ok(self.textures.insert(texture))
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        if let Some(texture) = self.textures.remove(texture) {
            texture.texture.destroy();
        }
    }

    fn texture_desc(&self, texture: TextureId) -> Result<TextureDesc> {
        Ok(self.texture(texture)?.desc.clone())
    }

    fn resize_texture(&mut self, texture: TextureId, width: u32, height: u32) -> Result<()> {
        let mut desc = self.texture(texture)?.desc.clone();
        if (desc.width, desc.height) == (width, height) {
            return Ok(());
        }
        desc.width = width;
        desc.height = height;
        let replacement = self.allocate(&desc)?;
        if let Some(old) = self.textures.get_mut(texture) {
            std::mem::replace(old, replacement).texture.destroy();
        }
        Ok(())
    }

    fn set_sampling(&mut self, texture: TextureId, sampling: Sampling) -> Result<()> {
        self.textures
            .get_mut(texture)
            .ok_or(FxError::UnknownHandle { kind: "texture" })?
            .desc
            .sampling = sampling;
        Ok(())
    }

    fn copy_texture(&mut self, src: TextureId, dst: TextureId) -> Result<()> {
        if src == dst {
            return Ok(());
        }
        let source = self.texture(src)?;
        if source.desc.format == TexelFormat::DepthStencil {
            return Err(FxError::config(format!(
                "texture '{}': depth+stencil textures cannot be copied",
                source.desc.label
            )));
        }
        let src_desc = source.desc.clone();
        let src_texture = source.texture.clone();

        let mut dst_desc = self.texture(dst)?.desc.clone();
        let reallocate = (dst_desc.width, dst_desc.height, dst_desc.format)
            != (src_desc.width, src_desc.height, src_desc.format);
        dst_desc = TextureDesc {
            label: dst_desc.label,
            ..src_desc.clone()
        };
        if reallocate {
            let replacement = self.allocate(&dst_desc)?;
            if let Some(old) = self.textures.get_mut(dst) {
                std::mem::replace(old, replacement).texture.destroy();
            }
        }
        let target = self
            .textures
            .get_mut(dst)
            .ok_or(FxError::UnknownHandle { kind: "texture" })?;
        target.desc = dst_desc;
        let dst_texture = target.texture.clone();

        let mut encoder = self.encoder("Copy");
        encoder.copy_texture_to_texture(
            src_texture.as_image_copy(),
            dst_texture.as_image_copy(),
            extent(src_desc.width, src_desc.height),
        );
        self.submit(encoder);
        Ok(())
    }

    fn write_texels(&mut self, texture: TextureId, texels: &[[f32; 4]]) -> Result<()> {
        let target = self.texture(texture)?;
        let desc = &target.desc;
        if texels.len() != desc.texel_count() {
            return Err(FxError::config(format!(
                "texture '{}' has {} texels, {} given",
                desc.label,
                desc.texel_count(),
                texels.len()
            )));
        }
        let (bytes, bytes_per_texel): (Vec<u8>, u32) = match desc.format {
            TexelFormat::Rgba8 => (texels.iter().flat_map(|t| t.map(to_unorm8)).collect(), 4),
            TexelFormat::RgbaFloat => (
                texels
                    .iter()
                    .flat_map(|t| t.iter().flat_map(|c| half::f16::from_f32(*c).to_le_bytes()))
                    .collect(),
                8,
            ),
            TexelFormat::Luminance8 => (texels.iter().map(|t| to_unorm8(t[0])).collect(), 1),
            TexelFormat::LuminanceFloat => (
                texels
                    .iter()
                    .flat_map(|t| half::f16::from_f32(t[0]).to_le_bytes())
                    .collect(),
                2,
            ),
            TexelFormat::Depth | TexelFormat::DepthStencil => {
                return Err(FxError::config(format!(
                    "texture '{}': depth textures cannot be written from the host",
                    desc.label
                )));
            }
        };
        self.gpu.queue.write_texture(
            target.texture.as_image_copy(),
            &bytes,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(desc.width * bytes_per_texel),
                rows_per_image: Some(desc.height),
            },
            extent(desc.width, desc.height),
        );
        self.gpu.queue.submit(None);
        Ok(())
    }

    fn read_texels(&mut self, texture: TextureId) -> Result<Vec<[f32; 4]>> {
        let source = self.texture(texture)?;
        let desc = source.desc.clone();
        let gpu_texture = source.texture.clone();
        let (aspect, bytes_per_texel) = match desc.format {
            TexelFormat::Rgba8 => (wgpu::TextureAspect::All, 4),
            TexelFormat::RgbaFloat => (wgpu::TextureAspect::All, 8),
            TexelFormat::Luminance8 => (wgpu::TextureAspect::All, 1),
            TexelFormat::LuminanceFloat => (wgpu::TextureAspect::All, 2),
            TexelFormat::Depth => (wgpu::TextureAspect::DepthOnly, 4),
            TexelFormat::DepthStencil => {
                return Err(FxError::config(format!(
                    "texture '{}': depth+stencil textures cannot be read back",
                    desc.label
                )));
            }
        };
        let bytes = self.read_back(&gpu_texture, aspect, bytes_per_texel, desc.width, desc.height)?;
        let f16_at = |b: &[u8]| half::f16::from_le_bytes([b[0], b[1]]).to_f32();
        Ok(match desc.format {
            TexelFormat::Rgba8 => bytes
                .chunks_exact(4)
                .map(|p| [unorm8(p[0]), unorm8(p[1]), unorm8(p[2]), unorm8(p[3])])
                .collect(),
            TexelFormat::RgbaFloat => bytes
                .chunks_exact(8)
                .map(|p| {
                    [
                        f16_at(&p[0..2]),
                        f16_at(&p[2..4]),
                        f16_at(&p[4..6]),
                        f16_at(&p[6..8]),
                    ]
                })
                .collect(),
            TexelFormat::Luminance8 => bytes
                .iter()
                .map(|l| {
                    let l = unorm8(*l);
                    [l, l, l, 1.0]
                })
                .collect(),
            TexelFormat::LuminanceFloat => bytes
                .chunks_exact(2)
                .map(|p| {
                    let l = f16_at(p);
                    [l, l, l, 1.0]
                })
                .collect(),
            TexelFormat::Depth | TexelFormat::DepthStencil => bytes
                .chunks_exact(4)
                .map(|p| {
                    let d = f32::from_le_bytes([p[0], p[1], p[2], p[3]]);
                    [d, d, d, 1.0]
                })
                .collect(),
        })
    }

    // ------------------------------------------------------------------
    // Renderbuffers
    // ------------------------------------------------------------------

    fn create_renderbuffer(&mut self, desc: &RenderbufferDesc) -> Result<RenderbufferId> {
        let renderbuffer = self.allocate_renderbuffer(desc)?;
        Ok(self.renderbuffers.insert(renderbuffer))
    }

    fn destroy_renderbuffer(&mut self, renderbuffer: RenderbufferId) {
        self.renderbuffers.remove(renderbuffer);
    }

    fn renderbuffer_desc(&self, renderbuffer: RenderbufferId) -> Result<RenderbufferDesc> {
        self.renderbuffers
            .get(renderbuffer)
            .map(|rb| rb.desc.clone())
            .ok_or(FxError::UnknownHandle {
                kind: "renderbuffer",
            })
    }

    fn resize_renderbuffer(
        &mut self,
        renderbuffer: RenderbufferId,
        width: u32,
        height: u32,
    ) -> Result<()> {
        let mut desc = self.renderbuffer_desc(renderbuffer)?;
        desc.width = width;
        desc.height = height;
        let replacement = self.allocate_renderbuffer(&desc)?;
        if let Some(old) = self.renderbuffers.get_mut(renderbuffer) {
            *old = replacement;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Framebuffers
    // ------------------------------------------------------------------

    fn create_framebuffer(&mut self, label: &str) -> Result<FramebufferId> {
        Ok(self.framebuffers.insert(GpuFramebuffer {
            label: label.to_owned(),
            colors: vec![None; self.limits.max_color_attachments as usize],
            depth: None,
            stencil: None,
            draw_targets: vec![Some(0)],
        }))
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferId) {
        self.framebuffers.remove(framebuffer);
        if self.state.framebuffer == Some(framebuffer) {
            self.state.framebuffer = None;
        }
    }

    fn attach(
        &mut self,
        framebuffer: FramebufferId,
        point: AttachmentPoint,
        image: Option<Image>,
    ) -> Result<()> {
        if let Some(image) = image {
            self.image_info(image)?;
        }
        let fb = self.framebuffer_mut(framebuffer)?;
        match point {
            AttachmentPoint::Color(slot) => {
                let label = fb.label.clone();
                let entry = fb.colors.get_mut(slot as usize).ok_or_else(|| {
                    FxError::config(format!(
                        "framebuffer '{}' has no color attachment point {}",
                        label, slot
                    ))
                })?;
                *entry = image;
            }
            AttachmentPoint::Depth => fb.depth = image,
            AttachmentPoint::Stencil => fb.stencil = image,
        }
        Ok(())
    }

    fn attachment(
        &self,
        framebuffer: FramebufferId,
        point: AttachmentPoint,
    ) -> Result<Option<Image>> {
        let fb = self.framebuffer(framebuffer)?;
        Ok(match point {
            AttachmentPoint::Color(slot) => fb.colors.get(slot as usize).copied().flatten(),
            AttachmentPoint::Depth => fb.depth,
            AttachmentPoint::Stencil => fb.stencil,
        })
    }

    fn set_draw_targets(
        &mut self,
        framebuffer: FramebufferId,
        targets: &[Option<u32>],
    ) -> Result<()> {
        self.framebuffer_mut(framebuffer)?.draw_targets = targets.to_vec();
        Ok(())
    }

    fn framebuffer_status(&self, framebuffer: FramebufferId) -> Result<FramebufferStatus> {
        let fb = self.framebuffer(framebuffer)?;
        let status = Attachments {
            colors: &fb.colors,
            depth: fb.depth,
            stencil: fb.stencil,
            draw_targets: &fb.draw_targets,
        }
        .status(self);
        // One render pass has a single depth-stencil attachment.
        Ok(match (fb.depth, fb.stencil) {
            (Some(depth), Some(stencil)) if status.is_complete() && depth != stencil => {
                FramebufferStatus::Unsupported
            }
            _ => status,
        })
    }

    fn bound_framebuffer(&self) -> Option<FramebufferId> {
        self.state.framebuffer
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferId>) -> Result<()> {
        if let Some(id) = framebuffer {
            self.framebuffer(id)?;
        }
        self.state.framebuffer = framebuffer;
        Ok(())
    }

    fn clear(&mut self, color: [f32; 4], depth: f32) -> Result<()> {
        let targets = self.resolve_targets()?;
        let clear_color = wgpu::Color {
            r: color[0] as f64,
            g: color[1] as f64,
            b: color[2] as f64,
            a: color[3] as f64,
        };
        let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = targets
            .colors
            .iter()
            .map(|target| {
                target.as_ref().map(|(view, _)| wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(clear_color),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })
            })
            .collect();

        let mut encoder = self.encoder("Clear");
        encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Clear"),
            color_attachments: &color_attachments,
            depth_stencil_attachment: targets.depth.as_ref().map(|target| {
                Self::depth_attachment(target, || {
                    (wgpu::LoadOp::Clear(depth), wgpu::LoadOp::Clear(0))
                })
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        self.submit(encoder);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Programs
    // ------------------------------------------------------------------

    fn create_program(&mut self, label: &str, sources: &[&str]) -> Result<ProgramId> {
        if sources.is_empty() {
            return Err(FxError::creation(format!(
                "program '{}' has no sources",
                label
            )));
        }
        let fragment = sources.join("\n");
        let reflection = wgsl::reflect(&fragment)?;
        let device = &self.gpu.device;

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(format!("{QUAD_VERTEX}\n{fragment}").into()),
        });
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(FxError::creation(format!(
                "program '{}' failed to compile: {}",
                label, err
            )));
        }

        let mut entries = Vec::new();
        for uniform in &reflection.uniforms {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: uniform.binding,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            });
        }
        for texture in &reflection.textures {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: texture.binding,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: if texture.depth {
                        wgpu::TextureSampleType::Depth
                    } else {
                        wgpu::TextureSampleType::Float { filterable: true }
                    },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            });
            if let Some(binding) = texture.sampler {
                entries.push(wgpu::BindGroupLayoutEntry {
                    binding,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(if texture.depth {
                        wgpu::SamplerBindingType::NonFiltering
                    } else {
                        wgpu::SamplerBindingType::Filtering
                    }),
                    count: None,
                });
            }
        }
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(label),
            entries: &entries,
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(label),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let uniform_buffers = reflection
            .uniforms
            .iter()
            .map(|uniform| {
                device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(&uniform.name),
                    size: uniform.buffer_size(),
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                })
            })
            .collect();

        log::debug!(
            "Compiled WGSL program '{}': {} uniform(s), {} texture(s)",
            label,
            reflection.uniforms.len(),
            reflection.textures.len()
        );
        let units = vec![None; reflection.textures.len()];
        Ok(self.programs.insert(GpuProgram {
            label: label.to_owned(),
            module,
            reflection,
            bind_group_layout,
            pipeline_layout,
            uniform_buffers,
            units,
            pipelines: HashMap::new(),
        }))
    }

    fn destroy_program(&mut self, program: ProgramId) {
        self.programs.remove(program);
        if self.state.program == Some(program) {
            self.state.program = None;
        }
    }

    fn set_uniform(
        &mut self,
        program: ProgramId,
        name: &str,
        value: &UniformValue,
    ) -> Result<bool> {
        let gpu_program = self
            .programs
            .get_mut(program)
            .ok_or(FxError::UnknownHandle { kind: "program" })?;
        if let UniformValue::Sampler(unit) = value {
            return Ok(match gpu_program.reflection.texture_index(name) {
                Some(index) => {
                    gpu_program.units[index] = Some(*unit);
                    true
                }
                None => false,
            });
        }
        let Some(index) = gpu_program.reflection.uniform_index(name) else {
            return Ok(false);
        };
        let bytes = gpu_program.reflection.uniforms[index].pack(value)?;
        self.gpu
            .queue
            .write_buffer(&gpu_program.uniform_buffers[index], 0, &bytes);
        Ok(true)
    }

    fn active_program(&self) -> Option<ProgramId> {
        self.state.program
    }

    fn use_program(&mut self, program: Option<ProgramId>) -> Result<()> {
        if let Some(id) = program {
            self.program(id)?;
        }
        self.state.program = program;
        Ok(())
    }

    fn bind_texture_unit(&mut self, unit: u32, texture: Option<TextureId>) -> Result<()> {
        if let Some(id) = texture {
            self.texture(id)?;
        }
        let slot = self.state.units.get_mut(unit as usize).ok_or_else(|| {
            FxError::config(format!("texture unit {} exceeds the platform limit", unit))
        })?;
        *slot = texture;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Ambient state and drawing
    // ------------------------------------------------------------------

    fn viewport(&self) -> ViewportRect {
        self.state.viewport
    }

    fn set_viewport(&mut self, rect: ViewportRect) {
        self.state.viewport = rect;
    }

    fn push_state(&mut self) {
        self.stack.push(self.state.clone());
    }

    fn pop_state(&mut self) -> Result<()> {
        self.state = self
            .stack
            .pop()
            .ok_or_else(|| FxError::usage("pop_state without matching push_state"))?;
        Ok(())
    }

    fn draw_quad(&mut self) -> Result<()> {
        let targets = self.resolve_targets()?;
        let viewport = self.state.viewport;
        let x0 = viewport.x.max(0) as u32;
        let y0 = viewport.y.max(0) as u32;
        let x1 = (viewport.x as i64 + viewport.width as i64).clamp(0, targets.width as i64) as u32;
        let y1 = (viewport.y as i64 + viewport.height as i64).clamp(0, targets.height as i64) as u32;
        if x1 <= x0 || y1 <= y0 {
            return Ok(());
        }

        let program = self.state.program.unwrap_or(self.blit);
        let key = PipelineKey {
            colors: targets
                .colors
                .iter()
                .map(|t| t.as_ref().map(|(_, format)| *format))
                .collect(),
            depth: targets.depth.as_ref().map(|(_, format)| *format),
        };
        self.ensure_pipeline(program, &key)?;
        let bind_group = self.bind_group(program)?;
        let pipeline = self
            .program(program)?
            .pipelines
            .get(&key)
            .cloned()
            .ok_or(FxError::UnknownHandle { kind: "pipeline" })?;

        let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = targets
            .colors
            .iter()
            .map(|target| {
                target.as_ref().map(|(view, _)| wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })
            })
            .collect();

        let mut encoder = self.encoder("Draw");
        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Draw"),
                color_attachments: &color_attachments,
                depth_stencil_attachment: targets.depth.as_ref().map(|target| {
                    Self::depth_attachment(target, || (wgpu::LoadOp::Load, wgpu::LoadOp::Load))
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            render_pass.set_viewport(
                x0 as f32,
                y0 as f32,
                (x1 - x0) as f32,
                (y1 - y0) as f32,
                0.0,
                1.0,
            );
            render_pass.set_pipeline(&pipeline);
            render_pass.set_bind_group(0, &bind_group, &[]);
            render_pass.draw(0..3, 0..1);
        }
        self.submit(encoder);
        Ok(())
    }
}
