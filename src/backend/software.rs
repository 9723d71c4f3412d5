//! CPU rasterizer implementing [`Graphics`].
//!
//! `SoftwareGraphics` keeps every texel as an `[f32; 4]` in host memory and
//! runs fragment programs as Rust closures ("kernels"). It follows the same
//! state model as the GPU backend: a bound framebuffer, an active program,
//! texture units and a viewport, saved and restored with
//! [`push_state`](Graphics::push_state) / [`pop_state`](Graphics::pop_state).
//!
//! Kernels are registered under the source string that selects them. When a
//! program is created, exactly one of its sources must name a registered
//! kernel; the remaining sources are accepted as shared library code.
//!
//! ```
//! use hoplite_fx::{Graphics, SoftwareGraphics};
//!
//! let mut gfx = SoftwareGraphics::new(2, 2);
//! gfx.register_kernel("invert", &["source"], |frag, out| {
//!     let c = frag.sample("source");
//!     out.set_color(0, [1.0 - c[0], 1.0 - c[1], 1.0 - c[2], c[3]]);
//! });
//! let program = gfx.create_program("invert", &["invert"]).unwrap();
//! # let _ = program;
//! ```
//!
//! Storage mimics the precision of each format: 8-bit formats are quantized
//! to 1/255, luminance formats replicate into RGB with alpha 1, and depth is
//! clamped to [0, 1] and replicated the same way.

use std::collections::HashMap;
use std::rc::Rc;

use slotmap::SlotMap;

use crate::error::{FxError, Result};
use crate::graphics::{
    AttachmentPoint, Attachments, FramebufferId, FramebufferStatus, Graphics, Image, Limits,
    ProgramId, RenderbufferId, TextureId,
};
use crate::program::UniformValue;
use crate::texture::{
    Filter, RenderbufferDesc, RenderbufferFormat, Sampling, TexelFormat, TextureDesc, Wrap,
};
use crate::viewport::ViewportRect;

/// Depth written by a fragment that does not set one: a quad at z = 0.
const DEFAULT_FRAGMENT_DEPTH: f32 = 0.5;

type Shader = dyn Fn(&Fragment<'_>, &mut FragmentOutput);

struct Kernel {
    uniforms: Vec<String>,
    shade: Box<Shader>,
}

struct SoftProgram {
    label: String,
    kernel: Rc<Kernel>,
    values: HashMap<String, UniformValue>,
}

struct SoftTexture {
    desc: TextureDesc,
    texels: Vec<[f32; 4]>,
}

struct SoftRenderbuffer {
    desc: RenderbufferDesc,
    texels: Vec<[f32; 4]>,
}

struct SoftFramebuffer {
    label: String,
    colors: Vec<Option<Image>>,
    depth: Option<Image>,
    stencil: Option<Image>,
    draw_targets: Vec<Option<u32>>,
}

struct Screen {
    width: u32,
    height: u32,
    color: Vec<[f32; 4]>,
    depth: Vec<f32>,
}

#[derive(Clone, Debug, PartialEq)]
struct AmbientState {
    framebuffer: Option<FramebufferId>,
    program: Option<ProgramId>,
    units: Vec<Option<TextureId>>,
    viewport: ViewportRect,
}

#[derive(Clone, Copy)]
enum Dest {
    ScreenColor,
    ScreenDepth,
    Image(Image),
}

struct Targets {
    colors: Vec<Option<Dest>>,
    depth: Option<Dest>,
    width: u32,
    height: u32,
}

/// What a kernel sees for one pixel.
pub struct Fragment<'a> {
    x: u32,
    y: u32,
    uv: [f32; 2],
    values: Option<&'a HashMap<String, UniformValue>>,
    units: &'a [Option<TextureId>],
    textures: &'a SlotMap<TextureId, SoftTexture>,
}

impl Fragment<'_> {
    /// Pixel coordinates in the destination.
    pub fn position(&self) -> (u32, u32) {
        (self.x, self.y)
    }

    /// Normalized coordinates across the viewport, sampled at pixel centers.
    pub fn uv(&self) -> [f32; 2] {
        self.uv
    }

    pub fn uniform(&self, name: &str) -> Option<&UniformValue> {
        self.values.and_then(|v| v.get(name))
    }

    /// First component of a numeric uniform, 0.0 if unset.
    pub fn float(&self, name: &str) -> f32 {
        self.uniform(name).and_then(UniformValue::as_f32).unwrap_or(0.0)
    }

    /// Samples the texture bound to sampler uniform `name` at this fragment's uv.
    pub fn sample(&self, name: &str) -> [f32; 4] {
        self.sample_at(name, self.uv)
    }

    /// Samples the texture bound to sampler uniform `name` at `uv`.
    /// Unbound samplers read as transparent black.
    pub fn sample_at(&self, name: &str, uv: [f32; 2]) -> [f32; 4] {
        let Some(UniformValue::Sampler(unit)) = self.uniform(name) else {
            return [0.0; 4];
        };
        self.sample_unit(*unit, uv)
    }

    fn sample_unit(&self, unit: u32, uv: [f32; 2]) -> [f32; 4] {
        self.units
            .get(unit as usize)
            .copied()
            .flatten()
            .and_then(|id| self.textures.get(id))
            .map(|texture| sample_texture(texture, uv))
            .unwrap_or([0.0; 4])
    }
}

/// What a kernel writes for one pixel.
pub struct FragmentOutput {
    colors: Vec<Option<[f32; 4]>>,
    depth: Option<f32>,
}

impl FragmentOutput {
    fn new(locations: usize) -> Self {
        Self {
            colors: vec![None; locations.max(1)],
            depth: None,
        }
    }

    /// Writes output location `location`. Locations past the selected draw
    /// targets are discarded.
    pub fn set_color(&mut self, location: usize, color: [f32; 4]) {
        if let Some(slot) = self.colors.get_mut(location) {
            *slot = Some(color);
        }
    }

    pub fn set_depth(&mut self, depth: f32) {
        self.depth = Some(depth);
    }
}

fn unorm8(c: f32) -> f32 {
    (c.clamp(0.0, 1.0) * 255.0).round() / 255.0
}

fn encode_texel(format: TexelFormat, v: [f32; 4]) -> [f32; 4] {
    match format {
        TexelFormat::Rgba8 => v.map(unorm8),
        TexelFormat::RgbaFloat => v,
        TexelFormat::Luminance8 => {
            let l = unorm8(v[0]);
            [l, l, l, 1.0]
        }
        TexelFormat::LuminanceFloat => [v[0], v[0], v[0], 1.0],
        TexelFormat::Depth | TexelFormat::DepthStencil => {
            let d = v[0].clamp(0.0, 1.0);
            [d, d, d, 1.0]
        }
    }
}

fn encode_renderbuffer(format: RenderbufferFormat, v: [f32; 4]) -> [f32; 4] {
    match format {
        RenderbufferFormat::Rgb => [unorm8(v[0]), unorm8(v[1]), unorm8(v[2]), 1.0],
        RenderbufferFormat::Rgba => v.map(unorm8),
        RenderbufferFormat::Depth => {
            let d = v[0].clamp(0.0, 1.0);
            [d, d, d, 1.0]
        }
        RenderbufferFormat::Stencil => [v[0], 0.0, 0.0, 1.0],
    }
}

fn wrap_coord(i: i64, n: u32, mode: Wrap) -> Option<usize> {
    let n = n as i64;
    let i = match mode {
        Wrap::Clamp | Wrap::ClampToEdge => i.clamp(0, n - 1),
        Wrap::ClampToBorder => {
            if !(0..n).contains(&i) {
                return None;
            }
            i
        }
        Wrap::Repeat => i.rem_euclid(n),
        Wrap::MirroredRepeat => {
            let m = i.rem_euclid(2 * n);
            if m < n { m } else { 2 * n - 1 - m }
        }
    };
    Some(i as usize)
}

fn texel_at(texture: &SoftTexture, x: i64, y: i64) -> [f32; 4] {
    let Sampling { wrap_s, wrap_t, .. } = texture.desc.sampling;
    match (
        wrap_coord(x, texture.desc.width, wrap_s),
        wrap_coord(y, texture.desc.height, wrap_t),
    ) {
        (Some(x), Some(y)) => texture.texels[y * texture.desc.width as usize + x],
        _ => [0.0; 4],
    }
}

// No derivatives on the CPU path, so the magnification filter decides.
fn sample_texture(texture: &SoftTexture, uv: [f32; 2]) -> [f32; 4] {
    let (w, h) = (texture.desc.width, texture.desc.height);
    if w == 0 || h == 0 {
        return [0.0; 4];
    }
    let fx = uv[0] * w as f32;
    let fy = uv[1] * h as f32;
    match texture.desc.sampling.mag_filter {
        Filter::Nearest => texel_at(texture, fx.floor() as i64, fy.floor() as i64),
        Filter::Linear => {
            let (sx, sy) = (fx - 0.5, fy - 0.5);
            let (x0, y0) = (sx.floor(), sy.floor());
            let (tx, ty) = (sx - x0, sy - y0);
            let (x0, y0) = (x0 as i64, y0 as i64);
            let a = texel_at(texture, x0, y0);
            let b = texel_at(texture, x0 + 1, y0);
            let c = texel_at(texture, x0, y0 + 1);
            let d = texel_at(texture, x0 + 1, y0 + 1);
            std::array::from_fn(|i| {
                let top = a[i] + (b[i] - a[i]) * tx;
                let bottom = c[i] + (d[i] - c[i]) * tx;
                top + (bottom - top) * ty
            })
        }
    }
}

/// Deterministic CPU implementation of the graphics capability interface.
pub struct SoftwareGraphics {
    limits: Limits,
    textures: SlotMap<TextureId, SoftTexture>,
    renderbuffers: SlotMap<RenderbufferId, SoftRenderbuffer>,
    framebuffers: SlotMap<FramebufferId, SoftFramebuffer>,
    programs: SlotMap<ProgramId, SoftProgram>,
    kernels: HashMap<String, Rc<Kernel>>,
    screen: Screen,
    state: AmbientState,
    stack: Vec<AmbientState>,
    draw_count: usize,
}

impl SoftwareGraphics {
    /// Creates a backend whose screen is `width` x `height` pixels.
    pub fn new(width: u32, height: u32) -> Self {
        let limits = Limits::default();
        Self {
            limits,
            textures: SlotMap::with_key(),
            renderbuffers: SlotMap::with_key(),
            framebuffers: SlotMap::with_key(),
            programs: SlotMap::with_key(),
            kernels: HashMap::new(),
            screen: Screen {
                width,
                height,
                color: vec![[0.0; 4]; width as usize * height as usize],
                depth: vec![1.0; width as usize * height as usize],
            },
            state: AmbientState {
                framebuffer: None,
                program: None,
                units: vec![None; limits.max_texture_bindings as usize],
                viewport: ViewportRect::sized(width, height),
            },
            stack: Vec::new(),
            draw_count: 0,
        }
    }

    /// Overrides the reported platform limits.
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self.state.units = vec![None; limits.max_texture_bindings as usize];
        self
    }

    /// Registers a kernel selected by the program source `source`.
    ///
    /// `uniforms` lists every uniform and sampler name the kernel declares;
    /// setting any other name reports a miss.
    pub fn register_kernel<F>(&mut self, source: &str, uniforms: &[&str], shade: F)
    where
        F: Fn(&Fragment<'_>, &mut FragmentOutput) + 'static,
    {
        self.kernels.insert(
            source.to_owned(),
            Rc::new(Kernel {
                uniforms: uniforms.iter().map(|u| (*u).to_owned()).collect(),
                shade: Box::new(shade),
            }),
        );
    }

    pub fn screen_size(&self) -> (u32, u32) {
        (self.screen.width, self.screen.height)
    }

    /// Current screen content, row-major.
    pub fn read_screen(&self) -> &[[f32; 4]] {
        &self.screen.color
    }

    /// Reallocates the screen. Content is cleared.
    pub fn resize_screen(&mut self, width: u32, height: u32) {
        let n = width as usize * height as usize;
        self.screen = Screen {
            width,
            height,
            color: vec![[0.0; 4]; n],
            depth: vec![1.0; n],
        };
    }

    /// Number of quads drawn since creation.
    pub fn draw_count(&self) -> usize {
        self.draw_count
    }

    /// Depth of the saved-state stack.
    pub fn state_depth(&self) -> usize {
        self.stack.len()
    }

    /// Texture currently bound to `unit`.
    pub fn texture_unit(&self, unit: u32) -> Option<TextureId> {
        self.state.units.get(unit as usize).copied().flatten()
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    fn texture(&self, id: TextureId) -> Result<&SoftTexture> {
        self.textures
            .get(id)
            .ok_or(FxError::UnknownHandle { kind: "texture" })
    }

    fn texture_mut(&mut self, id: TextureId) -> Result<&mut SoftTexture> {
        self.textures
            .get_mut(id)
            .ok_or(FxError::UnknownHandle { kind: "texture" })
    }

    fn framebuffer(&self, id: FramebufferId) -> Result<&SoftFramebuffer> {
        self.framebuffers
            .get(id)
            .ok_or(FxError::UnknownHandle { kind: "framebuffer" })
    }

    fn framebuffer_mut(&mut self, id: FramebufferId) -> Result<&mut SoftFramebuffer> {
        self.framebuffers
            .get_mut(id)
            .ok_or(FxError::UnknownHandle { kind: "framebuffer" })
    }

    fn resolve_targets(&self) -> Result<Targets> {
        let Some(id) = self.state.framebuffer else {
            return Ok(Targets {
                colors: vec![Some(Dest::ScreenColor)],
                depth: Some(Dest::ScreenDepth),
                width: self.screen.width,
                height: self.screen.height,
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
        let first = fb
            .colors
            .iter()
            .flatten()
            .chain(fb.depth.iter())
            .chain(fb.stencil.iter())
            .next()
            .copied()
            .ok_or_else(|| FxError::config(format!("framebuffer '{}' is empty", fb.label)))?;
        let (_, width, height) = self.image_info(first)?;
        Ok(Targets {
            colors: fb
                .draw_targets
                .iter()
                .map(|t| {
                    t.and_then(|slot| fb.colors.get(slot as usize).copied().flatten())
                        .map(Dest::Image)
                })
                .collect(),
            depth: fb.depth.map(Dest::Image),
            width,
            height,
        })
    }

    fn write_dest(&mut self, dest: Dest, index: usize, value: [f32; 4]) -> Result<()> {
        match dest {
            Dest::ScreenColor => self.screen.color[index] = value.map(unorm8),
            Dest::ScreenDepth => self.screen.depth[index] = value[0].clamp(0.0, 1.0),
            Dest::Image(Image::Texture(id)) => {
                let texture = self.texture_mut(id)?;
                texture.texels[index] = encode_texel(texture.desc.format, value);
            }
            Dest::Image(Image::Renderbuffer(id)) => {
                let rb = self
                    .renderbuffers
                    .get_mut(id)
                    .ok_or(FxError::UnknownHandle {
                        kind: "renderbuffer",
                    })?;
                rb.texels[index] = encode_renderbuffer(rb.desc.format, value);
            }
        }
        Ok(())
    }
}

impl Graphics for SoftwareGraphics {
    fn limits(&self) -> Limits {
        self.limits
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId> {
        let texels = vec![[0.0; 4]; desc.texel_count()];
        log::trace!(
            "Creating texture '{}' {}x{} {:?}",
            desc.label,
            desc.width,
            desc.height,
            desc.format
        );
        Ok(self.textures.insert(SoftTexture {
            desc: desc.clone(),
            texels,
        }))
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        self.textures.remove(texture);
    }

    fn texture_desc(&self, texture: TextureId) -> Result<TextureDesc> {
        Ok(self.texture(texture)?.desc.clone())
    }

    fn resize_texture(&mut self, texture: TextureId, width: u32, height: u32) -> Result<()> {
        let texture = self.texture_mut(texture)?;
        texture.desc.width = width;
        texture.desc.height = height;
        texture.texels = vec![[0.0; 4]; texture.desc.texel_count()];
        Ok(())
    }

    fn set_sampling(&mut self, texture: TextureId, sampling: Sampling) -> Result<()> {
        self.texture_mut(texture)?.desc.sampling = sampling;
        Ok(())
    }

    fn copy_texture(&mut self, src: TextureId, dst: TextureId) -> Result<()> {
        if src == dst {
            return Ok(());
        }
        let source = self.texture(src)?;
        let (mut desc, texels) = (source.desc.clone(), source.texels.clone());
        let target = self.texture_mut(dst)?;
        desc.label = std::mem::take(&mut target.desc.label);
        target.desc = desc;
        target.texels = texels;
        Ok(())
    }

    fn write_texels(&mut self, texture: TextureId, texels: &[[f32; 4]]) -> Result<()> {
        let texture = self.texture_mut(texture)?;
        if texels.len() != texture.texels.len() {
            return Err(FxError::config(format!(
                "texture '{}' holds {} texels, got {}",
                texture.desc.label,
                texture.texels.len(),
                texels.len()
            )));
        }
        let format = texture.desc.format;
        for (dst, src) in texture.texels.iter_mut().zip(texels) {
            *dst = encode_texel(format, *src);
        }
        Ok(())
    }

    fn read_texels(&mut self, texture: TextureId) -> Result<Vec<[f32; 4]>> {
        Ok(self.texture(texture)?.texels.clone())
    }

    fn create_renderbuffer(&mut self, desc: &RenderbufferDesc) -> Result<RenderbufferId> {
        let texels = vec![[0.0; 4]; desc.width as usize * desc.height as usize];
        Ok(self.renderbuffers.insert(SoftRenderbuffer {
            desc: desc.clone(),
            texels,
        }))
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
        let rb = self
            .renderbuffers
            .get_mut(renderbuffer)
            .ok_or(FxError::UnknownHandle {
                kind: "renderbuffer",
            })?;
        rb.desc.width = width;
        rb.desc.height = height;
        rb.texels = vec![[0.0; 4]; width as usize * height as usize];
        Ok(())
    }

    fn create_framebuffer(&mut self, label: &str) -> Result<FramebufferId> {
        Ok(self.framebuffers.insert(SoftFramebuffer {
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
        Ok(Attachments {
            colors: &fb.colors,
            depth: fb.depth,
            stencil: fb.stencil,
            draw_targets: &fb.draw_targets,
        }
        .status(self))
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
        let n = targets.width as usize * targets.height as usize;
        for dest in targets.colors.iter().flatten() {
            for i in 0..n {
                self.write_dest(*dest, i, color)?;
            }
        }
        if let Some(dest) = targets.depth {
            for i in 0..n {
                self.write_dest(dest, i, [depth; 4])?;
            }
        }
        Ok(())
    }

    fn create_program(&mut self, label: &str, sources: &[&str]) -> Result<ProgramId> {
        let mut entry = sources.iter().filter_map(|s| self.kernels.get(*s));
        let kernel = match (entry.next(), entry.next()) {
            (Some(kernel), None) => Rc::clone(kernel),
            (None, _) => {
                return Err(FxError::creation(format!(
                    "program '{}': no registered kernel among {} source(s)",
                    label,
                    sources.len()
                )));
            }
            (Some(_), Some(_)) => {
                return Err(FxError::creation(format!(
                    "program '{}': more than one source defines an entry point",
                    label
                )));
            }
        };
        Ok(self.programs.insert(SoftProgram {
            label: label.to_owned(),
            kernel,
            values: HashMap::new(),
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
        let program = self
            .programs
            .get_mut(program)
            .ok_or(FxError::UnknownHandle { kind: "program" })?;
        if !program.kernel.uniforms.iter().any(|u| u == name) {
            log::trace!("Program '{}' has no uniform '{}'", program.label, name);
            return Ok(false);
        }
        program.values.insert(name.to_owned(), value.clone());
        Ok(true)
    }

    fn active_program(&self) -> Option<ProgramId> {
        self.state.program
    }

    fn use_program(&mut self, program: Option<ProgramId>) -> Result<()> {
        if let Some(id) = program
            && !self.programs.contains_key(id)
        {
            return Err(FxError::UnknownHandle { kind: "program" });
        }
        self.state.program = program;
        Ok(())
    }

    fn bind_texture_unit(&mut self, unit: u32, texture: Option<TextureId>) -> Result<()> {
        let max = self.limits.max_texture_bindings;
        let slot = self.state.units.get_mut(unit as usize).ok_or_else(|| {
            FxError::config(format!("texture unit {} out of range (max {})", unit, max))
        })?;
        *slot = texture;
        Ok(())
    }

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
        let program = match self.state.program {
            Some(id) => Some(
                self.programs
                    .get(id)
                    .ok_or(FxError::UnknownHandle { kind: "program" })?,
            ),
            None => None,
        };

        let mut writes = Vec::new();
        for y in 0..targets.height {
            for x in 0..targets.width {
                if !viewport.contains(x as i32, y as i32) {
                    continue;
                }
                let uv = [
                    ((x as i32 - viewport.x) as f32 + 0.5) / viewport.width as f32,
                    ((y as i32 - viewport.y) as f32 + 0.5) / viewport.height as f32,
                ];
                let fragment = Fragment {
                    x,
                    y,
                    uv,
                    values: program.map(|p| &p.values),
                    units: &self.state.units,
                    textures: &self.textures,
                };
                let mut out = FragmentOutput::new(targets.colors.len());
                match program {
                    Some(p) => (p.kernel.shade)(&fragment, &mut out),
                    None => {
                        let color = match self.texture_unit(0) {
                            Some(_) => fragment.sample_unit(0, uv),
                            None => [1.0; 4],
                        };
                        out.set_color(0, color);
                    }
                }
                writes.push(((y * targets.width + x) as usize, out));
            }
        }

        for (index, out) in writes {
            for (location, dest) in targets.colors.iter().enumerate() {
                if let (Some(dest), Some(color)) = (dest, out.colors.get(location).copied().flatten())
                {
                    self.write_dest(*dest, index, color)?;
                }
            }
            if let Some(dest) = targets.depth {
                let depth = out.depth.unwrap_or(DEFAULT_FRAGMENT_DEPTH);
                self.write_dest(dest, index, [depth; 4])?;
            }
        }
        self.draw_count += 1;
        Ok(())
    }
}
