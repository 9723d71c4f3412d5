//! A single fragment-program step inside an effect.
//!
//! Passes are created by [`Effect::add_pass`](crate::Effect::add_pass) and
//! addressed through a [`PassHandle`]. A pass declares:
//!
//! - **inputs**: uniforms, arbitrary textures, the running color and depth
//!   buffers (bound by name, resolved every frame) and auxiliary buffers of
//!   earlier passes;
//! - **outputs**: the running color buffer, the running depth buffer and any
//!   number of auxiliary ("user") buffers at numbered attachment points.
//!
//! Color output and an auxiliary buffer cannot share attachment point 0; the
//! running color buffer is always attached there.
//!
//! Binding methods return `&mut Self` (or `Result<&mut Self>` when they can
//! fail) so a pass can be configured in one expression:
//!
//! ```ignore
//! fx.pass_mut(blur)?
//!     .bind_color_buffer("scene")?
//!     .bind_float("radius", 4.0)
//!     .enable_color_output()?;
//! ```

use crate::effect::EffectId;
use crate::error::{FxError, Result};
use crate::framebuffer::FramebufferTarget;
use crate::graphics::{Graphics, Limits, TextureId};
use crate::program::{FragmentProgram, UniformValue};
use crate::texture::{Filter, TexelFormat, TextureDesc, Wrap};
use crate::texture_pair::PingPong;
use crate::viewport::ViewportRect;

use slotmap::Key;

/// Identifies a pass: its effect and its position in that effect's pass list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PassHandle {
    pub(crate) effect: EffectId,
    pub(crate) index: usize,
}

impl PassHandle {
    /// The effect this pass belongs to.
    pub fn effect(&self) -> EffectId {
        self.effect
    }

    /// Execution order within the effect, starting at 0.
    pub fn index(&self) -> usize {
        self.index
    }
}

/// One fragment-program invocation with its own framebuffer.
#[derive(Debug)]
pub struct Pass {
    handle: PassHandle,
    label: String,
    target: FramebufferTarget,
    program: FragmentProgram,
    color_output: bool,
    depth_output: bool,
    color_input: Option<String>,
    depth_input: Option<String>,
    aux_buffers: Vec<Option<TextureId>>,
    width: u32,
    height: u32,
}

impl Pass {
    pub(crate) fn new(
        gfx: &mut dyn Graphics,
        handle: PassHandle,
        label: String,
        sources: &[&str],
        limits: Limits,
        (width, height): (u32, u32),
    ) -> Result<Self> {
        let program = FragmentProgram::compile(gfx, &label, sources)?;
        let target = match FramebufferTarget::new(gfx, &label) {
            Ok(target) => target,
            Err(err) => {
                program.destroy(gfx);
                return Err(err);
            }
        };
        log::debug!("Created pass '{}' at {}x{}", label, width, height);
        Ok(Self {
            handle,
            label,
            target,
            program,
            color_output: false,
            depth_output: false,
            color_input: None,
            depth_input: None,
            aux_buffers: vec![None; limits.max_color_attachments as usize],
            width,
            height,
        })
    }

    /// Handle addressing this pass through its effect.
    pub fn handle(&self) -> PassHandle {
        self.handle
    }

    /// Position in the effect's execution order.
    pub fn index(&self) -> usize {
        self.handle.index
    }

    /// Name used for the program, framebuffer and log messages.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The program and the values bound to it.
    pub fn program(&self) -> &FragmentProgram {
        &self.program
    }

    /// Whether the pass writes the running color buffer.
    pub fn writes_color(&self) -> bool {
        self.color_output
    }

    /// Whether the pass writes the running depth buffer.
    pub fn writes_depth(&self) -> bool {
        self.depth_output
    }

    /// Number of attachment points available to auxiliary buffers.
    pub fn max_color_attachments(&self) -> u32 {
        self.aux_buffers.len() as u32
    }

    // ------------------------------------------------------------------
    // Uniform inputs
    // ------------------------------------------------------------------

    /// Binds a `float` uniform.
    pub fn bind_float(&mut self, name: &str, value: f32) -> &mut Self {
        self.program.set_uniform(name, UniformValue::float(value));
        self
    }

    /// Binds an `int` uniform.
    pub fn bind_int(&mut self, name: &str, value: i32) -> &mut Self {
        self.program.set_uniform(name, UniformValue::int(value));
        self
    }

    /// Binds a `float`..`vec4`; the dimension is the slice length.
    pub fn bind_float_vector(&mut self, name: &str, values: &[f32]) -> Result<&mut Self> {
        self.program
            .set_uniform(name, UniformValue::float_vector(values)?);
        Ok(self)
    }

    /// Binds an `int`..`ivec4`; the dimension is the slice length.
    pub fn bind_int_vector(&mut self, name: &str, values: &[i32]) -> Result<&mut Self> {
        self.program
            .set_uniform(name, UniformValue::int_vector(values)?);
        Ok(self)
    }

    /// Binds an array of equally sized float vectors. An empty array binds nothing.
    pub fn bind_float_vectors<V: AsRef<[f32]>>(
        &mut self,
        name: &str,
        vectors: &[V],
    ) -> Result<&mut Self> {
        if let Some(value) = UniformValue::float_vectors(vectors)? {
            self.program.set_uniform(name, value);
        }
        Ok(self)
    }

    /// Binds an array of equally sized int vectors. An empty array binds nothing.
    pub fn bind_int_vectors<V: AsRef<[i32]>>(
        &mut self,
        name: &str,
        vectors: &[V],
    ) -> Result<&mut Self> {
        if let Some(value) = UniformValue::int_vectors(vectors)? {
            self.program.set_uniform(name, value);
        }
        Ok(self)
    }

    /// Binds a `rows` x `cols` matrix, column-major unless `transpose`.
    pub fn bind_matrix(
        &mut self,
        name: &str,
        rows: u32,
        cols: u32,
        values: &[f32],
        transpose: bool,
    ) -> Result<&mut Self> {
        self.program
            .set_uniform(name, UniformValue::matrix(rows, cols, values, transpose)?);
        Ok(self)
    }

    /// Binds an array of `rows` x `cols` matrices. An empty array binds nothing.
    pub fn bind_matrices<V: AsRef<[f32]>>(
        &mut self,
        name: &str,
        rows: u32,
        cols: u32,
        matrices: &[V],
        transpose: bool,
    ) -> Result<&mut Self> {
        if let Some(value) = UniformValue::matrices(rows, cols, matrices, transpose)? {
            self.program.set_uniform(name, value);
        }
        Ok(self)
    }

    /// Binds any value convertible to a uniform, e.g. `glam::Vec3` or `glam::Mat4`.
    pub fn bind_uniform(&mut self, name: &str, value: impl Into<UniformValue>) -> &mut Self {
        self.program.set_uniform(name, value.into());
        self
    }

    // ------------------------------------------------------------------
    // Texture inputs
    // ------------------------------------------------------------------

    /// Binds an arbitrary texture to a sampler. The pass only borrows it.
    pub fn bind_texture(&mut self, name: &str, texture: TextureId) -> Result<&mut Self> {
        if texture.is_null() {
            return Err(FxError::config(format!(
                "pass '{}': null texture bound to '{}'",
                self.label, name
            )));
        }
        self.program.set_texture(name, Some(texture))?;
        Ok(self)
    }

    /// Feeds the running color buffer to sampler `name`.
    pub fn bind_color_buffer(&mut self, name: &str) -> Result<&mut Self> {
        if let Some(existing) = &self.color_input {
            return Err(FxError::config(format!(
                "pass '{}': color buffer already bound to '{}'",
                self.label, existing
            )));
        }
        self.program.set_texture(name, None)?;
        self.color_input = Some(name.to_owned());
        Ok(self)
    }

    /// Feeds the running depth buffer to sampler `name`.
    pub fn bind_depth_buffer(&mut self, name: &str) -> Result<&mut Self> {
        if let Some(existing) = &self.depth_input {
            return Err(FxError::config(format!(
                "pass '{}': depth buffer already bound to '{}'",
                self.label, existing
            )));
        }
        self.program.set_texture(name, None)?;
        self.depth_input = Some(name.to_owned());
        Ok(self)
    }

    // ------------------------------------------------------------------
    // Outputs
    // ------------------------------------------------------------------

    /// Writes the running color buffer through attachment point 0.
    pub fn enable_color_output(&mut self) -> Result<&mut Self> {
        if self.aux_buffers.first().copied().flatten().is_some() {
            return Err(FxError::config(format!(
                "pass '{}': color output and auxiliary buffer cannot share attachment point 0",
                self.label
            )));
        }
        self.color_output = true;
        Ok(self)
    }

    /// Writes the running depth buffer.
    pub fn enable_depth_output(&mut self) -> &mut Self {
        self.depth_output = true;
        self
    }

    fn check_slot(&self, slot: u32) -> Result<()> {
        if slot < self.max_color_attachments() {
            Ok(())
        } else {
            Err(FxError::config(format!(
                "pass '{}': attachment point {} too large (max {})",
                self.label,
                slot,
                self.max_color_attachments()
            )))
        }
    }

    /// Allocates a new auxiliary output buffer at `slot` and returns it.
    pub fn attach_aux_buffer(
        &mut self,
        gfx: &mut dyn Graphics,
        slot: u32,
        float: bool,
    ) -> Result<TextureId> {
        self.check_slot(slot)?;
        if slot == 0 && self.color_output {
            return Err(FxError::config(format!(
                "pass '{}': color output and auxiliary buffer cannot share attachment point 0",
                self.label
            )));
        }
        if self.aux_buffers[slot as usize].is_some() {
            return Err(FxError::config(format!(
                "pass '{}': attachment point {} already holds an auxiliary buffer",
                self.label, slot
            )));
        }

        let desc = TextureDesc::new(
            format!("{} aux{}", self.label, slot),
            self.width,
            self.height,
            TexelFormat::rgba(float),
        );
        let texture = gfx.create_texture(&desc)?;
        if let Err(err) = self.target.attach_color(gfx, texture, slot) {
            gfx.destroy_texture(texture);
            return Err(err);
        }
        self.aux_buffers[slot as usize] = Some(texture);
        log::debug!("Pass '{}' attached auxiliary buffer at {}", self.label, slot);
        Ok(texture)
    }

    /// Whether an auxiliary buffer sits at `slot`.
    pub fn has_aux_buffer(&self, slot: u32) -> bool {
        self.aux_buffers.get(slot as usize).copied().flatten().is_some()
    }

    /// The live auxiliary buffer at `slot`.
    ///
    /// Its content is overwritten every frame; clone it to keep a snapshot.
    pub fn aux_buffer(&self, slot: u32) -> Result<TextureId> {
        self.check_slot(slot)?;
        self.aux_buffers[slot as usize].ok_or_else(|| {
            FxError::config(format!(
                "pass '{}' has no auxiliary buffer at attachment point {}",
                self.label, slot
            ))
        })
    }

    /// A new texture holding a copy of the auxiliary buffer at `slot`.
    pub fn aux_buffer_clone(&self, gfx: &mut dyn Graphics, slot: u32) -> Result<TextureId> {
        let texture = self.aux_buffer(slot)?;
        gfx.clone_texture(texture)
    }

    /// Overwrites `dst` with a copy of the auxiliary buffer at `slot`.
    pub fn aux_buffer_into(&self, gfx: &mut dyn Graphics, slot: u32, dst: TextureId) -> Result<()> {
        let texture = self.aux_buffer(slot)?;
        gfx.clone_texture_into(texture, dst)
    }

    /// Sets the wrap mode of the auxiliary buffer at `slot`.
    pub fn set_aux_buffer_wrap(
        &self,
        gfx: &mut dyn Graphics,
        slot: u32,
        wrap_s: Wrap,
        wrap_t: Wrap,
    ) -> Result<()> {
        let texture = self.aux_buffer(slot)?;
        let sampling = gfx.texture_desc(texture)?.sampling.with_wrap(wrap_s, wrap_t);
        gfx.set_sampling(texture, sampling)
    }

    /// Sets the filters of the auxiliary buffer at `slot`.
    pub fn set_aux_buffer_filter(
        &self,
        gfx: &mut dyn Graphics,
        slot: u32,
        mag: Filter,
        min: Filter,
    ) -> Result<()> {
        let texture = self.aux_buffer(slot)?;
        let sampling = gfx.texture_desc(texture)?.sampling.with_filter(mag, min);
        gfx.set_sampling(texture, sampling)
    }

    // ------------------------------------------------------------------
    // Effect-driven lifecycle
    // ------------------------------------------------------------------

    /// Renders this pass: reads `color.read()` / `depth.read()` and writes the
    /// `write()` side of whichever buffers it outputs.
    pub(crate) fn execute(
        &mut self,
        gfx: &mut dyn Graphics,
        color: PingPong,
        depth: PingPong,
    ) -> Result<()> {
        log::trace!("Executing pass '{}'", self.label);
        if self.color_output {
            self.target.attach_color(gfx, color.write(), 0)?;
        }
        if self.depth_output {
            self.target.attach_depth(gfx, depth.write())?;
        }
        self.target.select_draw_targets(gfx)?;
        self.target.check_status(gfx)?;

        if let Some(name) = &self.color_input {
            self.program.set_texture(name, Some(color.read()))?;
        }
        if let Some(name) = &self.depth_input {
            self.program.set_texture(name, Some(depth.read()))?;
        }

        gfx.bind_framebuffer(Some(self.target.id()))?;
        gfx.set_viewport(ViewportRect::sized(self.width, self.height));
        self.program.apply(gfx)?;
        gfx.draw_quad()
    }

    pub(crate) fn resize(&mut self, gfx: &mut dyn Graphics, width: u32, height: u32) -> Result<()> {
        self.width = width;
        self.height = height;
        for texture in self.aux_buffers.iter().flatten() {
            gfx.resize_texture(*texture, width, height)?;
        }
        Ok(())
    }

    pub(crate) fn destroy(self, gfx: &mut dyn Graphics) {
        for texture in self.aux_buffers.into_iter().flatten() {
            gfx.destroy_texture(texture);
        }
        self.target.destroy(gfx);
        self.program.destroy(gfx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareGraphics;
    use crate::error::ErrorKind;

    fn pass(gfx: &mut SoftwareGraphics) -> Pass {
        gfx.register_kernel("copy", &["src", "depth"], |frag, out| {
            out.set_color(0, frag.sample("src"))
        });
        let handle = PassHandle {
            effect: EffectId::default(),
            index: 0,
        };
        let limits = gfx.limits();
        Pass::new(gfx, handle, "copy".into(), &["copy"], limits, (4, 4)).unwrap()
    }

    #[test]
    fn running_buffers_bind_once() {
        let mut gfx = SoftwareGraphics::new(4, 4);
        let mut pass = pass(&mut gfx);
        pass.bind_color_buffer("src").unwrap();
        let err = pass.bind_color_buffer("other").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        pass.bind_depth_buffer("depth").unwrap();
        assert!(pass.bind_depth_buffer("depth").is_err());
    }

    #[test]
    fn attachment_point_zero_is_exclusive_in_both_orders() {
        let mut gfx = SoftwareGraphics::new(4, 4);

        let mut a = pass(&mut gfx);
        a.enable_color_output().unwrap();
        let err = a.attach_aux_buffer(&mut gfx, 0, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let mut b = pass(&mut gfx);
        b.attach_aux_buffer(&mut gfx, 0, false).unwrap();
        let err = b.enable_color_output().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn aux_buffers_are_range_checked_and_unique() {
        let mut gfx = SoftwareGraphics::new(4, 4);
        let mut pass = pass(&mut gfx);
        let max = pass.max_color_attachments();
        assert!(pass.attach_aux_buffer(&mut gfx, max, true).is_err());

        let tex = pass.attach_aux_buffer(&mut gfx, 1, true).unwrap();
        assert_eq!(
            gfx.texture_desc(tex).unwrap().format,
            TexelFormat::RgbaFloat
        );
        assert!(pass.attach_aux_buffer(&mut gfx, 1, false).is_err());
        assert_eq!(pass.aux_buffer(1).unwrap(), tex);
        assert!(pass.aux_buffer(2).is_err());
    }

    #[test]
    fn null_texture_binding_fails() {
        let mut gfx = SoftwareGraphics::new(4, 4);
        let mut pass = pass(&mut gfx);
        let err = pass.bind_texture("src", TextureId::null()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn invalid_uniforms_fail_without_binding() {
        let mut gfx = SoftwareGraphics::new(4, 4);
        let mut pass = pass(&mut gfx);
        assert!(pass.bind_float_vector("v", &[0.0; 5]).is_err());
        assert!(pass.bind_matrix("m", 3, 3, &[0.0; 4], false).is_err());
        assert!(pass.program().uniform("v").is_none());
        assert!(pass.program().uniform("m").is_none());
    }

    #[test]
    fn aux_buffer_settings_and_resize() {
        let mut gfx = SoftwareGraphics::new(4, 4);
        let mut pass = pass(&mut gfx);
        let tex = pass.attach_aux_buffer(&mut gfx, 2, false).unwrap();
        pass.set_aux_buffer_wrap(&mut gfx, 2, Wrap::Repeat, Wrap::Repeat)
            .unwrap();
        pass.set_aux_buffer_filter(&mut gfx, 2, Filter::Nearest, Filter::Nearest)
            .unwrap();
        pass.resize(&mut gfx, 8, 2).unwrap();

        let desc = gfx.texture_desc(tex).unwrap();
        assert_eq!((desc.width, desc.height), (8, 2));
        assert_eq!(desc.sampling.wrap_s, Wrap::Repeat);
        assert_eq!(desc.sampling.mag_filter, Filter::Nearest);

        let copy = pass.aux_buffer_clone(&mut gfx, 2).unwrap();
        assert_ne!(copy, tex);
        pass.destroy(&mut gfx);
        assert!(gfx.texture_desc(tex).is_err());
        assert!(gfx.texture_desc(copy).is_ok());
    }
}
