//! Multi-pass post-processing effects.
//!
//! An [`Effect`] captures a rendered scene into an off-screen target and runs
//! an ordered list of [`Pass`]es over it, alternating between the two halves
//! of a color pair and a depth pair so that every pass reads the previous
//! result and writes a fresh one. Effects are configured with closures
//! instead of subclassing:
//!
//! ```
//! use hoplite_fx::{Effect, EffectGraph, SoftwareGraphics, Viewport};
//!
//! let mut gfx = SoftwareGraphics::new(8, 8);
//! gfx.register_kernel("invert", &["scene"], |frag, out| {
//!     let c = frag.sample("scene");
//!     out.set_color(0, [1.0 - c[0], 1.0 - c[1], 1.0 - c[2], c[3]]);
//! });
//!
//! let viewport = Viewport::sized(8, 8);
//! let effect = Effect::builder("invert")
//!     .setup(|fx, gfx| {
//!         let pass = fx.add_pass(gfx, &["invert"])?;
//!         fx.pass_mut(pass)?
//!             .bind_color_buffer("scene")?
//!             .enable_color_output()?;
//!         Ok(())
//!     })
//!     .build(&viewport);
//!
//! let mut graph = EffectGraph::new();
//! let id = graph.insert(effect);
//! graph.pre_render(id, &mut gfx)?;
//! // ... render the scene here ...
//! graph.post_render(id, &mut gfx)?;
//! # Ok::<(), hoplite_fx::FxError>(())
//! ```
//!
//! Frame-level operations that recurse through chained effects live on
//! [`EffectGraph`](crate::EffectGraph); everything that touches a single
//! effect lives here.

use crate::error::{FxError, Result};
use crate::framebuffer::FramebufferTarget;
use crate::graphics::{FramebufferId, Graphics, Limits, TextureId};
use crate::pass::{Pass, PassHandle};
use crate::texture::{Filter, Sampling, TexelFormat, TextureDesc, Wrap};
use crate::texture_pair::{PingPong, TexturePair};
use crate::viewport::Viewport;

slotmap::new_key_type! {
    /// Handle to an [`Effect`] stored in an [`EffectGraph`](crate::EffectGraph).
    pub struct EffectId;
}

type SetupFn = Box<dyn FnOnce(&mut Effect, &mut dyn Graphics) -> Result<()>>;
type PerFrameFn = Box<dyn FnMut(&mut Effect, f32) -> Result<()>>;

/// Lifecycle of an effect. Destruction removes it from its graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EffectState {
    /// No graphics resources yet; the first pre-render sets it up.
    Uninitialized,
    /// Resources are allocated and the setup closure completed.
    Ready,
    /// The setup closure failed. Resources were released and every later
    /// frame reports the failure.
    Failed,
}

/// The off-screen target the scene is captured into, plus both ping-pong pairs.
struct Capture {
    target: FramebufferTarget,
    color: TexturePair,
    depth: TexturePair,
}

impl Capture {
    fn new(gfx: &mut dyn Graphics, label: &str, width: u32, height: u32, float: bool) -> Result<Self> {
        let color = TexturePair::new(
            gfx,
            &TextureDesc::new(format!("{label} color"), width, height, TexelFormat::rgba(float)),
        )?;
        let depth_desc = TextureDesc::new(format!("{label} depth"), width, height, TexelFormat::Depth)
            .with_sampling(Sampling::nearest());
        let depth = match TexturePair::new(gfx, &depth_desc) {
            Ok(depth) => depth,
            Err(err) => {
                color.destroy(gfx);
                return Err(err);
            }
        };
        let mut target = match FramebufferTarget::new(gfx, &format!("{label} capture")) {
            Ok(target) => target,
            Err(err) => {
                color.destroy(gfx);
                depth.destroy(gfx);
                return Err(err);
            }
        };

        if let Err(err) = Self::attach(gfx, &mut target, &color, &depth) {
            target.destroy(gfx);
            color.destroy(gfx);
            depth.destroy(gfx);
            return Err(err);
        }
        Ok(Self {
            target,
            color,
            depth,
        })
    }

    fn attach(
        gfx: &mut dyn Graphics,
        target: &mut FramebufferTarget,
        color: &TexturePair,
        depth: &TexturePair,
    ) -> Result<()> {
        target.attach_color(gfx, color.front(), 0)?;
        target.attach_depth(gfx, depth.front())?;
        target.select_draw_targets(gfx)?;
        target.check_status(gfx)
    }

    fn destroy(self, gfx: &mut dyn Graphics) {
        self.target.destroy(gfx);
        self.color.destroy(gfx);
        self.depth.destroy(gfx);
    }
}

/// Builder for [`Effect`]; start with [`Effect::builder`].
pub struct EffectBuilder {
    label: String,
    float_buffers: bool,
    enabled: bool,
    screen_output: bool,
    clear_color: [f32; 4],
    setup: Option<SetupFn>,
    per_frame: Option<PerFrameFn>,
}

impl EffectBuilder {
    /// Store the color pair as floating-point RGBA instead of 8-bit.
    pub fn float_buffers(mut self, float: bool) -> Self {
        self.float_buffers = float;
        self
    }

    /// Starts enabled unless set to `false`.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Whether the final color buffer is drawn to the screen after each frame.
    pub fn screen_output(mut self, screen_output: bool) -> Self {
        self.screen_output = screen_output;
        self
    }

    /// Color the capture target is cleared to in pre-render.
    pub fn clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    /// Runs once, right after the effect allocates its resources. This is
    /// where passes are added and configured.
    pub fn setup<F>(mut self, setup: F) -> Self
    where
        F: FnOnce(&mut Effect, &mut dyn Graphics) -> Result<()> + 'static,
    {
        self.setup = Some(Box::new(setup));
        self
    }

    /// Runs from [`EffectGraph::tick`](crate::EffectGraph::tick) after every
    /// frame in which the effect executed, with the elapsed time in seconds.
    pub fn per_frame<F>(mut self, per_frame: F) -> Self
    where
        F: FnMut(&mut Effect, f32) -> Result<()> + 'static,
    {
        self.per_frame = Some(Box::new(per_frame));
        self
    }

    /// Creates the effect; it allocates nothing until its first pre-render.
    pub fn build(self, viewport: &Viewport) -> Effect {
        Effect {
            id: EffectId::default(),
            label: self.label,
            viewport: viewport.clone(),
            width: 0,
            height: 0,
            float_buffers: self.float_buffers,
            enabled: self.enabled,
            screen_output: self.screen_output,
            clear_color: self.clear_color,
            limits: None,
            capture: None,
            passes: Vec::new(),
            chained: Vec::new(),
            executing: false,
            run_per_frame: false,
            setup_failure: None,
            final_buffers: None,
            saved_framebuffer: None,
            setup: self.setup,
            per_frame: self.per_frame,
        }
    }
}

/// A chain of passes applied to a captured scene.
pub struct Effect {
    id: EffectId,
    label: String,
    viewport: Viewport,
    width: u32,
    height: u32,
    float_buffers: bool,
    enabled: bool,
    screen_output: bool,
    clear_color: [f32; 4],
    limits: Option<Limits>,
    capture: Option<Capture>,
    passes: Vec<Pass>,
    chained: Vec<EffectId>,
    pub(crate) executing: bool,
    pub(crate) run_per_frame: bool,
    setup_failure: Option<String>,
    final_buffers: Option<(TextureId, TextureId)>,
    // Outer `Some` between pre-render and post-render; inner `None` is the screen.
    pub(crate) saved_framebuffer: Option<Option<FramebufferId>>,
    setup: Option<SetupFn>,
    pub(crate) per_frame: Option<PerFrameFn>,
}

impl Effect {
    /// Starts configuring a new effect named `label`.
    pub fn builder(label: impl Into<String>) -> EffectBuilder {
        EffectBuilder {
            label: label.into(),
            float_buffers: false,
            enabled: true,
            screen_output: true,
            clear_color: [0.0; 4],
            setup: None,
            per_frame: None,
        }
    }

    /// Id assigned by the graph the effect was inserted into.
    pub fn id(&self) -> EffectId {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: EffectId) {
        self.id = id;
    }

    /// Name used in logs, resource labels and error messages.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The shared viewport whose size the buffers follow.
    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    /// Where the effect is in its lifecycle.
    pub fn state(&self) -> EffectState {
        if self.setup_failure.is_some() {
            EffectState::Failed
        } else if self.capture.is_some() {
            EffectState::Ready
        } else {
            EffectState::Uninitialized
        }
    }

    /// Current buffer dimensions; `(0, 0)` before setup.
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn require_setup(&self, operation: &str) -> Result<&Capture> {
        self.capture.as_ref().ok_or_else(|| {
            FxError::usage(format!(
                "{} called on effect '{}' before setup",
                operation, self.label
            ))
        })
    }

    // ------------------------------------------------------------------
    // Passes
    // ------------------------------------------------------------------

    /// Appends a pass running the fragment program built from `sources`.
    pub fn add_pass(&mut self, gfx: &mut dyn Graphics, sources: &[&str]) -> Result<PassHandle> {
        self.require_setup("add_pass")?;
        let limits = self.limits.unwrap_or_default();
        let handle = PassHandle {
            effect: self.id,
            index: self.passes.len(),
        };
        let label = format!("{} pass {}", self.label, handle.index);
        let pass = Pass::new(gfx, handle, label, sources, limits, (self.width, self.height))?;
        self.passes.push(pass);
        Ok(handle)
    }

    /// Passes in execution order.
    pub fn passes(&self) -> &[Pass] {
        &self.passes
    }

    fn check_handle(&self, handle: PassHandle) -> Result<usize> {
        if handle.effect != self.id || handle.index >= self.passes.len() {
            return Err(FxError::config(format!(
                "pass {} does not belong to effect '{}'",
                handle.index, self.label
            )));
        }
        Ok(handle.index)
    }

    /// Looks up a pass of this effect.
    pub fn pass(&self, handle: PassHandle) -> Result<&Pass> {
        let index = self.check_handle(handle)?;
        Ok(&self.passes[index])
    }

    /// Looks up a pass of this effect for configuration.
    pub fn pass_mut(&mut self, handle: PassHandle) -> Result<&mut Pass> {
        let index = self.check_handle(handle)?;
        Ok(&mut self.passes[index])
    }

    /// Feeds the auxiliary buffer `slot` of `source` into sampler `name` of
    /// `target`. The source must run strictly before the target.
    pub fn bind_aux_buffer(
        &mut self,
        target: PassHandle,
        name: &str,
        source: PassHandle,
        slot: u32,
    ) -> Result<()> {
        let target_index = self.check_handle(target)?;
        let source_index = self.check_handle(source)?;
        if source_index >= target_index {
            return Err(FxError::config(format!(
                "effect '{}': pass {} cannot read an auxiliary buffer of pass {}, which does not run before it",
                self.label, target_index, source_index
            )));
        }
        let texture = self.passes[source_index].aux_buffer(slot)?;
        self.passes[target_index].bind_texture(name, texture)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Results
    // ------------------------------------------------------------------

    fn final_buffers(&self) -> Result<(TextureId, TextureId)> {
        self.final_buffers.ok_or_else(|| {
            FxError::usage(format!(
                "effect '{}' has not completed a frame yet",
                self.label
            ))
        })
    }

    /// The live texture holding the last frame's color result.
    ///
    /// It is overwritten by the next frame and may alternate between the two
    /// halves of the color pair from one frame to the next. Clone it to keep it.
    pub fn final_color_buffer(&self) -> Result<TextureId> {
        Ok(self.final_buffers()?.0)
    }

    /// The live texture holding the last frame's depth result.
    pub fn final_depth_buffer(&self) -> Result<TextureId> {
        Ok(self.final_buffers()?.1)
    }

    /// A new caller-owned copy of the last color result.
    pub fn final_color_buffer_clone(&self, gfx: &mut dyn Graphics) -> Result<TextureId> {
        gfx.clone_texture(self.final_color_buffer()?)
    }

    /// A new caller-owned copy of the last depth result.
    pub fn final_depth_buffer_clone(&self, gfx: &mut dyn Graphics) -> Result<TextureId> {
        gfx.clone_texture(self.final_depth_buffer()?)
    }

    /// Copies the last color result into `dst`, which keeps its handle.
    pub fn final_color_buffer_into(&self, gfx: &mut dyn Graphics, dst: TextureId) -> Result<()> {
        gfx.clone_texture_into(self.final_color_buffer()?, dst)
    }

    /// Copies the last depth result into `dst`, which keeps its handle.
    pub fn final_depth_buffer_into(&self, gfx: &mut dyn Graphics, dst: TextureId) -> Result<()> {
        gfx.clone_texture_into(self.final_depth_buffer()?, dst)
    }

    // ------------------------------------------------------------------
    // Sampling of the ping-pong pairs
    // ------------------------------------------------------------------

    /// Sets the wrap mode of both halves of the color pair.
    pub fn set_color_buffer_wrap(&self, gfx: &mut dyn Graphics, wrap_s: Wrap, wrap_t: Wrap) -> Result<()> {
        self.require_setup("set_color_buffer_wrap")?
            .color
            .set_wrap(gfx, wrap_s, wrap_t)
    }

    /// Sets the magnification and minification filter of the color pair.
    pub fn set_color_buffer_filter(&self, gfx: &mut dyn Graphics, filter: Filter) -> Result<()> {
        self.require_setup("set_color_buffer_filter")?
            .color
            .set_filter(gfx, filter, filter)
    }

    /// Sets the wrap mode of both halves of the depth pair.
    pub fn set_depth_buffer_wrap(&self, gfx: &mut dyn Graphics, wrap_s: Wrap, wrap_t: Wrap) -> Result<()> {
        self.require_setup("set_depth_buffer_wrap")?
            .depth
            .set_wrap(gfx, wrap_s, wrap_t)
    }

    /// Sets the magnification and minification filter of the depth pair.
    pub fn set_depth_buffer_filter(&self, gfx: &mut dyn Graphics, filter: Filter) -> Result<()> {
        self.require_setup("set_depth_buffer_filter")?
            .depth
            .set_filter(gfx, filter, filter)
    }

    // ------------------------------------------------------------------
    // Limits
    // ------------------------------------------------------------------

    /// Color attachment points the platform offers, queried at setup.
    pub fn max_color_attachments(&self) -> Result<u32> {
        self.require_setup("max_color_attachments")?;
        Ok(self.limits.unwrap_or_default().max_color_attachments)
    }

    /// Texture units one pass program can use, queried at setup.
    pub fn max_texture_bindings(&self) -> Result<u32> {
        self.require_setup("max_texture_bindings")?;
        Ok(self.limits.unwrap_or_default().max_texture_bindings)
    }

    // ------------------------------------------------------------------
    // Switches and chaining
    // ------------------------------------------------------------------

    /// A disabled effect passes its input through unchanged; chained effects
    /// and screen output still run.
    pub fn enable(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Whether the passes run each frame.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Turns drawing the final color buffer after each frame on or off.
    pub fn enable_screen_output(&mut self, enabled: bool) {
        self.screen_output = enabled;
    }

    /// Whether the final color buffer is drawn after each frame.
    pub fn screen_output(&self) -> bool {
        self.screen_output
    }

    /// Appends `child`; it runs after this effect's passes, on their result.
    pub fn chain(&mut self, child: EffectId) {
        self.chained.push(child);
    }

    /// Removes every occurrence of `child` from the chain.
    pub fn unchain(&mut self, child: EffectId) {
        self.chained.retain(|id| *id != child);
    }

    /// Removes every chained effect.
    pub fn unchain_all(&mut self) {
        self.chained.clear();
    }

    /// Chained effects in execution order.
    pub fn chained(&self) -> &[EffectId] {
        &self.chained
    }

    // ------------------------------------------------------------------
    // Frame protocol, driven by EffectGraph
    // ------------------------------------------------------------------

    /// Allocates resources and runs the setup closure the first time.
    pub(crate) fn ensure_setup(&mut self, gfx: &mut dyn Graphics) -> Result<()> {
        if let Some(failure) = &self.setup_failure {
            return Err(FxError::usage(format!(
                "effect '{}' failed to set up: {}",
                self.label, failure
            )));
        }
        if self.capture.is_some() {
            return Ok(());
        }
        let (width, height) = self.viewport.size();
        if width == 0 || height == 0 {
            return Err(FxError::config(format!(
                "effect '{}' cannot be set up for an empty viewport",
                self.label
            )));
        }
        self.limits = Some(gfx.limits());
        self.capture = Some(Capture::new(
            gfx,
            &self.label,
            width,
            height,
            self.float_buffers,
        )?);
        self.width = width;
        self.height = height;
        log::debug!("Set up effect '{}' at {}x{}", self.label, width, height);

        if let Some(setup) = self.setup.take()
            && let Err(err) = setup(self, gfx)
        {
            log::error!("Setup of effect '{}' failed: {}", self.label, err);
            self.release(gfx);
            self.setup_failure = Some(err.to_string());
            return Err(err);
        }
        Ok(())
    }

    /// Drops passes and the capture, returning to the pre-setup dimensions.
    fn release(&mut self, gfx: &mut dyn Graphics) {
        for pass in std::mem::take(&mut self.passes) {
            pass.destroy(gfx);
        }
        if let Some(capture) = self.capture.take() {
            capture.destroy(gfx);
        }
        self.limits = None;
        self.width = 0;
        self.height = 0;
        self.final_buffers = None;
    }

    /// Whether the viewport changed size since the buffers were allocated.
    /// An empty viewport (a minimized window) keeps the current buffers.
    pub(crate) fn pending_resize(&self) -> Option<(u32, u32)> {
        let (width, height) = self.viewport.size();
        (self.capture.is_some()
            && width > 0
            && height > 0
            && (width, height) != (self.width, self.height))
            .then_some((width, height))
    }

    /// Resizes this effect's own buffers; chained effects are left to the caller.
    pub(crate) fn resize_own(&mut self, gfx: &mut dyn Graphics, width: u32, height: u32) -> Result<()> {
        let capture = self.require_setup("resize")?;
        capture.color.resize(gfx, width, height)?;
        capture.depth.resize(gfx, width, height)?;
        for pass in &mut self.passes {
            pass.resize(gfx, width, height)?;
        }
        self.width = width;
        self.height = height;
        log::debug!("Resized effect '{}' to {}x{}", self.label, width, height);
        Ok(())
    }

    /// Binds the capture target and clears it, remembering the previous binding.
    pub(crate) fn begin_capture(&mut self, gfx: &mut dyn Graphics) -> Result<()> {
        if self.saved_framebuffer.is_some() {
            return Err(FxError::usage(format!(
                "pre_render called twice on effect '{}' without post_render",
                self.label
            )));
        }
        let target = self.require_setup("pre_render")?.target.id();
        let previous = gfx.bound_framebuffer();
        gfx.bind_framebuffer(Some(target))?;
        if let Err(err) = gfx.clear(self.clear_color, 1.0) {
            gfx.bind_framebuffer(previous)?;
            return Err(err);
        }
        self.saved_framebuffer = Some(previous);
        Ok(())
    }

    /// Runs the passes over `input`, or over the captured scene when `None`,
    /// and returns the resulting color and depth textures.
    pub(crate) fn run_passes(
        &mut self,
        gfx: &mut dyn Graphics,
        input: Option<(TextureId, TextureId)>,
    ) -> Result<(TextureId, TextureId)> {
        let capture = self.require_setup("post_render")?;
        let (color_in, depth_in) = match input {
            Some(buffers) => {
                inherit_sampling(gfx, capture.color.front(), buffers.0)?;
                inherit_sampling(gfx, capture.depth.front(), buffers.1)?;
                buffers
            }
            None => (capture.color.front(), capture.depth.front()),
        };
        let mut color = PingPong::new(color_in, capture.color.scratch_for(color_in));
        let mut depth = PingPong::new(depth_in, capture.depth.scratch_for(depth_in));

        if self.enabled {
            for pass in &mut self.passes {
                pass.execute(gfx, color, depth)?;
                if pass.writes_color() {
                    color.flip();
                }
                if pass.writes_depth() {
                    depth.flip();
                }
            }
        }

        let result = (color.latest(), depth.latest());
        self.final_buffers = Some(result);
        self.run_per_frame = true;
        Ok(result)
    }

    /// Records the result of the chained effects as this effect's result.
    pub(crate) fn set_final_buffers(&mut self, buffers: (TextureId, TextureId)) {
        self.final_buffers = Some(buffers);
    }

    pub(crate) fn destroy(self, gfx: &mut dyn Graphics) {
        for pass in self.passes {
            pass.destroy(gfx);
        }
        if let Some(capture) = self.capture {
            capture.destroy(gfx);
        }
        log::debug!("Destroyed effect '{}'", self.label);
    }
}

/// Gives `input` the sampling of `own` so a chained effect reads its parent's
/// result with its own wrap and filter settings.
fn inherit_sampling(gfx: &mut dyn Graphics, own: TextureId, input: TextureId) -> Result<()> {
    if own == input {
        return Ok(());
    }
    let sampling = gfx.texture_desc(own)?.sampling;
    if gfx.texture_desc(input)?.sampling != sampling {
        gfx.set_sampling(input, sampling)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareGraphics;
    use crate::error::ErrorKind;

    fn gfx() -> SoftwareGraphics {
        let mut gfx = SoftwareGraphics::new(4, 4);
        gfx.register_kernel("copy", &["src"], |frag, out| {
            out.set_color(0, frag.sample("src"))
        });
        gfx
    }

    #[test]
    fn builder_defaults() {
        let effect = Effect::builder("fx").build(&Viewport::sized(4, 4));
        assert!(effect.is_enabled());
        assert!(effect.screen_output());
        assert_eq!(effect.state(), EffectState::Uninitialized);
        assert_eq!(effect.size(), (0, 0));
    }

    #[test]
    fn operations_before_setup_are_usage_errors() {
        let mut gfx = gfx();
        let mut effect = Effect::builder("fx").build(&Viewport::sized(4, 4));

        let err = effect.add_pass(&mut gfx, &["copy"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UsageOrder);
        let err = effect
            .set_color_buffer_wrap(&mut gfx, Wrap::Repeat, Wrap::Repeat)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UsageOrder);
        assert!(effect.set_depth_buffer_filter(&mut gfx, Filter::Linear).is_err());
        assert!(effect.max_color_attachments().is_err());
        assert!(effect.max_texture_bindings().is_err());
        assert_eq!(
            effect.final_color_buffer().unwrap_err().kind(),
            ErrorKind::UsageOrder
        );
        assert!(effect.final_depth_buffer_clone(&mut gfx).is_err());
    }

    #[test]
    fn setup_allocates_capture_and_runs_closure_once() {
        let mut gfx = gfx();
        let mut effect = Effect::builder("fx")
            .float_buffers(true)
            .setup(|fx, gfx| {
                fx.add_pass(gfx, &["copy"])?;
                Ok(())
            })
            .build(&Viewport::sized(4, 2));

        effect.ensure_setup(&mut gfx).unwrap();
        effect.ensure_setup(&mut gfx).unwrap();
        assert_eq!(effect.state(), EffectState::Ready);
        assert_eq!(effect.size(), (4, 2));
        assert_eq!(effect.passes().len(), 1);
        assert_eq!(effect.max_color_attachments().unwrap(), gfx.limits().max_color_attachments);

        let capture = effect.capture.as_ref().unwrap();
        let color = gfx.texture_desc(capture.color.front()).unwrap();
        assert_eq!(color.format, TexelFormat::RgbaFloat);
        let depth = gfx.texture_desc(capture.depth.back()).unwrap();
        assert_eq!(depth.format, TexelFormat::Depth);
        assert_eq!(depth.sampling.mag_filter, Filter::Nearest);
    }

    #[test]
    fn failed_setup_releases_resources_and_keeps_failing() {
        let mut gfx = gfx();
        let mut effect = Effect::builder("fx")
            .setup(|fx, gfx| {
                fx.add_pass(gfx, &["copy"])?;
                fx.add_pass(gfx, &["missing"])?;
                Ok(())
            })
            .build(&Viewport::sized(4, 4));

        let err = effect.ensure_setup(&mut gfx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceCreation);
        assert_eq!(effect.state(), EffectState::Failed);
        assert!(effect.passes().is_empty());
        assert_eq!(effect.size(), (0, 0));
        assert_eq!(gfx.texture_count(), 0);
        assert_eq!(gfx.framebuffer_count(), 0);
        assert_eq!(gfx.program_count(), 0);

        let err = effect.ensure_setup(&mut gfx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UsageOrder);
        assert!(err.to_string().contains("failed to set up"));
        assert_eq!(gfx.texture_count(), 0);
    }

    #[test]
    fn minimized_viewport_keeps_buffers() {
        let mut gfx = gfx();
        let viewport = Viewport::sized(4, 4);
        let mut effect = Effect::builder("fx").build(&viewport);
        effect.ensure_setup(&mut gfx).unwrap();

        viewport.resize(0, 0);
        assert_eq!(effect.pending_resize(), None);
        viewport.resize(3, 0);
        assert_eq!(effect.pending_resize(), None);
        viewport.resize(2, 2);
        assert_eq!(effect.pending_resize(), Some((2, 2)));
    }

    #[test]
    fn empty_viewport_cannot_be_set_up() {
        let mut gfx = gfx();
        let mut effect = Effect::builder("fx").build(&Viewport::sized(0, 4));
        let err = effect.ensure_setup(&mut gfx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(gfx.texture_count(), 0);
    }

    #[test]
    fn unchain_removes_every_occurrence() {
        let mut ids = slotmap::SlotMap::<EffectId, ()>::with_key();
        let a = ids.insert(());
        let b = ids.insert(());
        let mut effect = Effect::builder("fx").build(&Viewport::sized(1, 1));
        effect.chain(a);
        effect.chain(b);
        effect.chain(a);
        effect.unchain(a);
        assert_eq!(effect.chained(), &[b]);
        effect.unchain_all();
        assert!(effect.chained().is_empty());
    }

    #[test]
    fn aux_buffers_only_flow_forward() {
        let mut gfx = gfx();
        let mut effect = Effect::builder("fx").build(&Viewport::sized(4, 4));
        effect.ensure_setup(&mut gfx).unwrap();
        let first = effect.add_pass(&mut gfx, &["copy"]).unwrap();
        let second = effect.add_pass(&mut gfx, &["copy"]).unwrap();
        effect
            .pass_mut(first)
            .unwrap()
            .attach_aux_buffer(&mut gfx, 1, false)
            .unwrap();

        let err = effect.bind_aux_buffer(first, "src", second, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(effect.bind_aux_buffer(first, "src", first, 1).is_err());
        assert!(effect.bind_aux_buffer(second, "src", first, 2).is_err());
        assert!(effect.bind_aux_buffer(second, "src", first, 99).is_err());

        effect.bind_aux_buffer(second, "src", first, 1).unwrap();
        let aux = effect.pass(first).unwrap().aux_buffer(1).unwrap();
        assert_eq!(effect.pass(second).unwrap().program().texture("src"), Some(aux));
    }

    #[test]
    fn resize_reaches_pairs_and_aux_buffers() {
        let mut gfx = gfx();
        let viewport = Viewport::sized(4, 4);
        let mut effect = Effect::builder("fx").build(&viewport);
        effect.ensure_setup(&mut gfx).unwrap();
        let pass = effect.add_pass(&mut gfx, &["copy"]).unwrap();
        let aux = effect
            .pass_mut(pass)
            .unwrap()
            .attach_aux_buffer(&mut gfx, 1, true)
            .unwrap();

        assert_eq!(effect.pending_resize(), None);
        viewport.resize(6, 3);
        assert_eq!(effect.pending_resize(), Some((6, 3)));
        effect.resize_own(&mut gfx, 6, 3).unwrap();
        assert_eq!(effect.pending_resize(), None);

        let capture = effect.capture.as_ref().unwrap();
        for texture in [capture.color.front(), capture.depth.back(), aux] {
            let desc = gfx.texture_desc(texture).unwrap();
            assert_eq!((desc.width, desc.height), (6, 3));
        }
    }

    #[test]
    fn destroy_releases_everything() {
        let mut gfx = gfx();
        let mut effect = Effect::builder("fx").build(&Viewport::sized(4, 4));
        effect.ensure_setup(&mut gfx).unwrap();
        let pass = effect.add_pass(&mut gfx, &["copy"]).unwrap();
        effect
            .pass_mut(pass)
            .unwrap()
            .attach_aux_buffer(&mut gfx, 2, false)
            .unwrap();
        effect.destroy(&mut gfx);
        assert_eq!(gfx.texture_count(), 0);
        assert_eq!(gfx.framebuffer_count(), 0);
        assert_eq!(gfx.program_count(), 0);
    }
}
