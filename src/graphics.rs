//! The graphics-API capability surface consumed by effects and passes.
//!
//! [`Graphics`] is the one seam between the effect engine and a concrete
//! graphics API. It is deliberately stateful in the way classic immediate-mode
//! APIs are: there is a bound framebuffer, an active program, a set of texture
//! units and a viewport, and [`Graphics::draw_quad`] consumes all of them.
//! [`Graphics::push_state`] / [`Graphics::pop_state`] save and restore that
//! ambient state so nested operations can leave it exactly as they found it.
//!
//! Two implementations ship with the crate:
//!
//! - [`WgpuGraphics`](crate::WgpuGraphics) drives a real GPU through wgpu.
//! - [`SoftwareGraphics`](crate::SoftwareGraphics) rasterizes on the CPU with
//!   Rust closures standing in for fragment programs, which makes pipelines
//!   testable without a device.
//!
//! Resources are addressed by `slotmap` keys. A key outliving its resource is
//! reported as [`FxError::UnknownHandle`](crate::FxError::UnknownHandle), never
//! as a dangling access.

use std::fmt;

use crate::error::Result;
use crate::program::UniformValue;
use crate::texture::{ImageKind, RenderbufferDesc, Sampling, TextureDesc};
use crate::viewport::ViewportRect;

slotmap::new_key_type! {
    /// Handle to a 2D texture owned by a [`Graphics`] backend.
    pub struct TextureId;
    /// Handle to a renderbuffer owned by a [`Graphics`] backend.
    pub struct RenderbufferId;
    /// Handle to an off-screen framebuffer owned by a [`Graphics`] backend.
    pub struct FramebufferId;
    /// Handle to a linked fragment program owned by a [`Graphics`] backend.
    pub struct ProgramId;
}

/// Anything that can be attached to a framebuffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Image {
    Texture(TextureId),
    Renderbuffer(RenderbufferId),
}

impl From<TextureId> for Image {
    fn from(texture: TextureId) -> Self {
        Image::Texture(texture)
    }
}

impl From<RenderbufferId> for Image {
    fn from(renderbuffer: RenderbufferId) -> Self {
        Image::Renderbuffer(renderbuffer)
    }
}

/// A framebuffer attachment point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AttachmentPoint {
    Color(u32),
    Depth,
    Stencil,
}

impl fmt::Display for AttachmentPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachmentPoint::Color(slot) => write!(f, "color{}", slot),
            AttachmentPoint::Depth => write!(f, "depth"),
            AttachmentPoint::Stencil => write!(f, "stencil"),
        }
    }
}

/// Result of a framebuffer completeness check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FramebufferStatus {
    Complete,
    /// Nothing is attached.
    MissingAttachment,
    /// Attached images differ in size.
    SizeMismatch,
    /// An image sits at an attachment point its format cannot serve.
    FormatMismatch,
    /// A selected draw target refers to an empty color slot.
    DrawTargetMissing,
    /// The combination is legal but the backend cannot render to it.
    Unsupported,
}

impl FramebufferStatus {
    pub fn is_complete(self) -> bool {
        self == FramebufferStatus::Complete
    }
}

impl fmt::Display for FramebufferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FramebufferStatus::Complete => "complete",
            FramebufferStatus::MissingAttachment => "no images attached",
            FramebufferStatus::SizeMismatch => "attached images differ in size",
            FramebufferStatus::FormatMismatch => "attachment format does not match its point",
            FramebufferStatus::DrawTargetMissing => "draw target selects an empty color slot",
            FramebufferStatus::Unsupported => "attachment combination unsupported",
        };
        f.write_str(text)
    }
}

/// Platform limits queried once per effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    /// Simultaneous color attachments per framebuffer.
    pub max_color_attachments: u32,
    /// Texture units available to one fragment program.
    pub max_texture_bindings: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_color_attachments: 4,
            max_texture_bindings: 8,
        }
    }
}

/// What a backend framebuffer holds, borrowed for a completeness check.
pub(crate) struct Attachments<'a> {
    pub colors: &'a [Option<Image>],
    pub depth: Option<Image>,
    pub stencil: Option<Image>,
    pub draw_targets: &'a [Option<u32>],
}

impl Attachments<'_> {
    /// Completeness rules shared by every backend: at least one image, every
    /// image alive, formats that suit their attachment points, equal sizes
    /// and no draw target naming an empty color slot.
    pub(crate) fn status(&self, gfx: &dyn Graphics) -> FramebufferStatus {
        let mut attached: Vec<(AttachmentPoint, Image)> = self
            .colors
            .iter()
            .enumerate()
            .filter_map(|(slot, image)| image.map(|i| (AttachmentPoint::Color(slot as u32), i)))
            .collect();
        attached.extend(self.depth.map(|i| (AttachmentPoint::Depth, i)));
        attached.extend(self.stencil.map(|i| (AttachmentPoint::Stencil, i)));
        if attached.is_empty() {
            return FramebufferStatus::MissingAttachment;
        }

        let mut size = None;
        for (point, image) in attached {
            let Ok((kind, width, height)) = gfx.image_info(image) else {
                return FramebufferStatus::MissingAttachment;
            };
            let fits = match point {
                AttachmentPoint::Color(_) => kind.is_color(),
                AttachmentPoint::Depth => kind.has_depth(),
                AttachmentPoint::Stencil => kind.has_stencil(),
            };
            if !fits {
                return FramebufferStatus::FormatMismatch;
            }
            match size {
                None => size = Some((width, height)),
                Some(s) if s != (width, height) => return FramebufferStatus::SizeMismatch,
                Some(_) => {}
            }
        }

        let dangling = self.draw_targets.iter().flatten().any(|slot| {
            self.colors
                .get(*slot as usize)
                .copied()
                .flatten()
                .is_none()
        });
        if dangling {
            return FramebufferStatus::DrawTargetMissing;
        }
        FramebufferStatus::Complete
    }
}

/// Graphics-API capability interface.
///
/// All calls are blocking and complete before returning; implementations
/// submit work to a single serial command stream.
pub trait Graphics {
    fn limits(&self) -> Limits;

    // ------------------------------------------------------------------
    // Textures
    // ------------------------------------------------------------------

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId>;
    fn destroy_texture(&mut self, texture: TextureId);
    fn texture_desc(&self, texture: TextureId) -> Result<TextureDesc>;

    /// Reallocates storage at a new size. Content is not preserved.
    fn resize_texture(&mut self, texture: TextureId, width: u32, height: u32) -> Result<()>;

    fn set_sampling(&mut self, texture: TextureId, sampling: Sampling) -> Result<()>;

    /// Makes `dst` an exact copy of `src`: size, format, sampling and content.
    /// `dst` keeps its handle.
    fn copy_texture(&mut self, src: TextureId, dst: TextureId) -> Result<()>;

    /// Replaces the whole content, one RGBA value per texel in row-major order.
    fn write_texels(&mut self, texture: TextureId, texels: &[[f32; 4]]) -> Result<()>;

    /// Reads the whole content, one RGBA value per texel in row-major order.
    fn read_texels(&mut self, texture: TextureId) -> Result<Vec<[f32; 4]>>;

    /// Creates an independent copy of `src` under a new handle.
    fn clone_texture(&mut self, src: TextureId) -> Result<TextureId> {
        let desc = self.texture_desc(src)?;
        let dst = self.create_texture(&desc)?;
        if let Err(err) = self.copy_texture(src, dst) {
            self.destroy_texture(dst);
            return Err(err);
        }
        Ok(dst)
    }

    /// Refreshes a caller-held texture in place from `src`.
    fn clone_texture_into(&mut self, src: TextureId, dst: TextureId) -> Result<()> {
        if src == dst {
            return Ok(());
        }
        self.copy_texture(src, dst)
    }

    // ------------------------------------------------------------------
    // Renderbuffers
    // ------------------------------------------------------------------

    fn create_renderbuffer(&mut self, desc: &RenderbufferDesc) -> Result<RenderbufferId>;
    fn destroy_renderbuffer(&mut self, renderbuffer: RenderbufferId);
    fn renderbuffer_desc(&self, renderbuffer: RenderbufferId) -> Result<RenderbufferDesc>;
    fn resize_renderbuffer(
        &mut self,
        renderbuffer: RenderbufferId,
        width: u32,
        height: u32,
    ) -> Result<()>;

    /// Attachment kind and size of any attachable image.
    fn image_info(&self, image: Image) -> Result<(ImageKind, u32, u32)> {
        match image {
            Image::Texture(id) => {
                let desc = self.texture_desc(id)?;
                Ok((desc.format.kind(), desc.width, desc.height))
            }
            Image::Renderbuffer(id) => {
                let desc = self.renderbuffer_desc(id)?;
                Ok((desc.format.kind(), desc.width, desc.height))
            }
        }
    }

    // ------------------------------------------------------------------
    // Framebuffers
    // ------------------------------------------------------------------

    fn create_framebuffer(&mut self, label: &str) -> Result<FramebufferId>;
    fn destroy_framebuffer(&mut self, framebuffer: FramebufferId);

    /// Places `image` at `point`, or clears the point with `None`.
    fn attach(
        &mut self,
        framebuffer: FramebufferId,
        point: AttachmentPoint,
        image: Option<Image>,
    ) -> Result<()>;

    fn attachment(&self, framebuffer: FramebufferId, point: AttachmentPoint)
    -> Result<Option<Image>>;

    /// Routes fragment output location `i` to color slot `targets[i]`;
    /// `None` discards that output.
    fn set_draw_targets(&mut self, framebuffer: FramebufferId, targets: &[Option<u32>])
    -> Result<()>;

    fn framebuffer_status(&self, framebuffer: FramebufferId) -> Result<FramebufferStatus>;

    /// Currently bound render destination; `None` is the screen.
    fn bound_framebuffer(&self) -> Option<FramebufferId>;
    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferId>) -> Result<()>;

    /// Clears the color draw targets and depth of the bound destination.
    fn clear(&mut self, color: [f32; 4], depth: f32) -> Result<()>;

    // ------------------------------------------------------------------
    // Programs
    // ------------------------------------------------------------------

    /// Compiles and links a fragment program from one or more sources.
    fn create_program(&mut self, label: &str, sources: &[&str]) -> Result<ProgramId>;
    fn destroy_program(&mut self, program: ProgramId);

    /// Sets a uniform. Returns `Ok(false)` when the program does not declare
    /// `name`, which callers report as a diagnostic.
    fn set_uniform(&mut self, program: ProgramId, name: &str, value: &UniformValue)
    -> Result<bool>;

    fn active_program(&self) -> Option<ProgramId>;
    fn use_program(&mut self, program: Option<ProgramId>) -> Result<()>;
    fn bind_texture_unit(&mut self, unit: u32, texture: Option<TextureId>) -> Result<()>;

    // ------------------------------------------------------------------
    // Ambient state and drawing
    // ------------------------------------------------------------------

    fn viewport(&self) -> ViewportRect;
    fn set_viewport(&mut self, rect: ViewportRect);

    /// Saves bound framebuffer, active program, texture units and viewport.
    fn push_state(&mut self);

    /// Restores the most recently pushed state.
    fn pop_state(&mut self) -> Result<()>;

    /// Draws a quad covering the viewport of the bound destination.
    ///
    /// With an active program every covered pixel runs the program once.
    /// Without one the texture on unit 0 is copied onto the quad.
    fn draw_quad(&mut self) -> Result<()>;
}
