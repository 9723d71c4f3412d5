//! Off-screen render targets with checked attachment slots.
//!
//! [`FramebufferTarget`] wraps a backend framebuffer and mirrors what is
//! attached where. Every attachment is validated before it reaches the
//! backend: the slot must exist on this platform and the image format must
//! suit the attachment point. After attaching, the backend is queried again
//! to make sure the image really landed in the slot.
//!
//! Operations that touch the framebuffer bind it for their duration and put
//! back whatever was bound before, so callers never see the active render
//! destination change underneath them.

use crate::error::{FxError, Result};
use crate::graphics::{AttachmentPoint, FramebufferId, Graphics, Image};

/// One off-screen render destination.
#[derive(Debug)]
pub struct FramebufferTarget {
    id: FramebufferId,
    label: String,
    colors: Vec<Option<Image>>,
    depth: Option<Image>,
    stencil: Option<Image>,
}

impl FramebufferTarget {
    /// Creates an empty framebuffer sized for the platform's color attachment limit.
    pub fn new(gfx: &mut dyn Graphics, label: &str) -> Result<Self> {
        let max = gfx.limits().max_color_attachments;
        let id = gfx.create_framebuffer(label)?;
        Ok(Self {
            id,
            label: label.to_owned(),
            colors: vec![None; max as usize],
            depth: None,
            stencil: None,
        })
    }

    /// Backend handle of the framebuffer.
    pub fn id(&self) -> FramebufferId {
        self.id
    }

    /// Name used in error messages.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Number of color attachment points on this platform.
    pub fn max_color_attachments(&self) -> u32 {
        self.colors.len() as u32
    }

    fn check_slot(&self, slot: u32) -> Result<()> {
        if slot < self.max_color_attachments() {
            Ok(())
        } else {
            Err(FxError::config(format!(
                "framebuffer '{}': color attachment point {} out of range (max {})",
                self.label,
                slot,
                self.max_color_attachments()
            )))
        }
    }

    /// Runs `f` with this framebuffer bound, restoring the previous binding.
    fn guarded<T>(
        &self,
        gfx: &mut dyn Graphics,
        f: impl FnOnce(&mut dyn Graphics) -> Result<T>,
    ) -> Result<T> {
        let previous = gfx.bound_framebuffer();
        gfx.bind_framebuffer(Some(self.id))?;
        let result = f(gfx);
        gfx.bind_framebuffer(previous)?;
        result
    }

    fn attach_checked(
        &mut self,
        gfx: &mut dyn Graphics,
        point: AttachmentPoint,
        image: Image,
    ) -> Result<()> {
        let id = self.id;
        self.guarded(gfx, |gfx| {
            gfx.attach(id, point, Some(image))?;
            if gfx.attachment(id, point)? != Some(image) {
                return Err(FxError::creation(format!(
                    "attaching {:?} at {} failed",
                    image, point
                )));
            }
            Ok(())
        })?;
        match point {
            AttachmentPoint::Color(slot) => self.colors[slot as usize] = Some(image),
            AttachmentPoint::Depth => self.depth = Some(image),
            AttachmentPoint::Stencil => self.stencil = Some(image),
        }
        Ok(())
    }

    /// Attaches a color-format image at `slot`, replacing what was there.
    pub fn attach_color(
        &mut self,
        gfx: &mut dyn Graphics,
        image: impl Into<Image>,
        slot: u32,
    ) -> Result<()> {
        let image = image.into();
        self.check_slot(slot)?;
        let (kind, _, _) = gfx.image_info(image)?;
        if !kind.is_color() {
            return Err(FxError::config(format!(
                "framebuffer '{}': {:?} image cannot be a color attachment",
                self.label, kind
            )));
        }
        self.attach_checked(gfx, AttachmentPoint::Color(slot), image)
    }

    /// Attaches a depth or depth+stencil image.
    pub fn attach_depth(&mut self, gfx: &mut dyn Graphics, image: impl Into<Image>) -> Result<()> {
        let image = image.into();
        let (kind, _, _) = gfx.image_info(image)?;
        if !kind.has_depth() {
            return Err(FxError::config(format!(
                "framebuffer '{}': {:?} image cannot be a depth attachment",
                self.label, kind
            )));
        }
        self.attach_checked(gfx, AttachmentPoint::Depth, image)
    }

    /// Attaches a stencil or depth+stencil image.
    pub fn attach_stencil(
        &mut self,
        gfx: &mut dyn Graphics,
        image: impl Into<Image>,
    ) -> Result<()> {
        let image = image.into();
        let (kind, _, _) = gfx.image_info(image)?;
        if !kind.has_stencil() {
            return Err(FxError::config(format!(
                "framebuffer '{}': {:?} image cannot be a stencil attachment",
                self.label, kind
            )));
        }
        self.attach_checked(gfx, AttachmentPoint::Stencil, image)
    }

    fn detach(&mut self, gfx: &mut dyn Graphics, point: AttachmentPoint) -> Result<()> {
        let id = self.id;
        self.guarded(gfx, |gfx| gfx.attach(id, point, None))?;
        match point {
            AttachmentPoint::Color(slot) => self.colors[slot as usize] = None,
            AttachmentPoint::Depth => self.depth = None,
            AttachmentPoint::Stencil => self.stencil = None,
        }
        Ok(())
    }

    /// Empties color attachment point `slot`.
    pub fn detach_color(&mut self, gfx: &mut dyn Graphics, slot: u32) -> Result<()> {
        self.check_slot(slot)?;
        self.detach(gfx, AttachmentPoint::Color(slot))
    }

    /// Empties the depth attachment point.
    pub fn detach_depth(&mut self, gfx: &mut dyn Graphics) -> Result<()> {
        self.detach(gfx, AttachmentPoint::Depth)
    }

    /// Empties the stencil attachment point.
    pub fn detach_stencil(&mut self, gfx: &mut dyn Graphics) -> Result<()> {
        self.detach(gfx, AttachmentPoint::Stencil)
    }

    /// Empties every occupied attachment point.
    pub fn detach_all(&mut self, gfx: &mut dyn Graphics) -> Result<()> {
        for slot in 0..self.max_color_attachments() {
            if self.colors[slot as usize].is_some() {
                self.detach_color(gfx, slot)?;
            }
        }
        if self.depth.is_some() {
            self.detach_depth(gfx)?;
        }
        if self.stencil.is_some() {
            self.detach_stencil(gfx)?;
        }
        Ok(())
    }

    /// Image attached at color point `slot`, if any.
    pub fn color_attachment(&self, slot: u32) -> Option<Image> {
        self.colors.get(slot as usize).copied().flatten()
    }

    /// Image attached at the depth point, if any.
    pub fn depth_attachment(&self) -> Option<Image> {
        self.depth
    }

    /// Image attached at the stencil point, if any.
    pub fn stencil_attachment(&self) -> Option<Image> {
        self.stencil
    }

    /// Routes fragment output `i` to color slot `i` for every attached slot,
    /// discarding outputs whose slot is empty.
    pub fn select_draw_targets(&self, gfx: &mut dyn Graphics) -> Result<()> {
        let last = self.colors.iter().rposition(Option::is_some);
        let targets: Vec<Option<u32>> = match last {
            Some(last) => self.colors[..=last]
                .iter()
                .enumerate()
                .map(|(slot, image)| image.map(|_| slot as u32))
                .collect(),
            None => Vec::new(),
        };
        let id = self.id;
        self.guarded(gfx, |gfx| gfx.set_draw_targets(id, &targets))
    }

    /// Routes fragment output 0 to `slot` only.
    pub fn select_draw_target(&self, gfx: &mut dyn Graphics, slot: u32) -> Result<()> {
        self.check_slot(slot)?;
        let id = self.id;
        self.guarded(gfx, |gfx| gfx.set_draw_targets(id, &[Some(slot)]))
    }

    /// Fails with a configuration error unless the attachments form a
    /// complete, renderable combination.
    pub fn check_status(&self, gfx: &mut dyn Graphics) -> Result<()> {
        let status = gfx.framebuffer_status(self.id)?;
        if status.is_complete() {
            Ok(())
        } else {
            Err(FxError::config(format!(
                "framebuffer '{}' is incomplete: {}",
                self.label, status
            )))
        }
    }

    /// Releases the backend framebuffer. Attached images stay alive.
    pub fn destroy(self, gfx: &mut dyn Graphics) {
        gfx.destroy_framebuffer(self.id);
    }
}
