//! Front/back texture pairs for ping-pong rendering.

use crate::error::Result;
use crate::graphics::{Graphics, TextureId};
use crate::texture::{Filter, Sampling, TextureDesc, Wrap};

/// Two equally sized textures of one format.
///
/// The front texture is the capture target; the back texture is the first
/// pass output. Wrap and filter changes always apply to both halves so that
/// whichever one ends up holding a frame's result samples the same way.
#[derive(Debug)]
pub struct TexturePair {
    label: String,
    front: TextureId,
    back: TextureId,
}

impl TexturePair {
    /// Allocates both halves from `desc`; the labels get `(front)` and `(back)` suffixes.
    pub fn new(gfx: &mut dyn Graphics, desc: &TextureDesc) -> Result<Self> {
        let mut front_desc = desc.clone();
        front_desc.label = format!("{} (front)", desc.label);
        let front = gfx.create_texture(&front_desc)?;

        let mut back_desc = desc.clone();
        back_desc.label = format!("{} (back)", desc.label);
        let back = match gfx.create_texture(&back_desc) {
            Ok(back) => back,
            Err(err) => {
                gfx.destroy_texture(front);
                return Err(err);
            }
        };

        Ok(Self {
            label: desc.label.clone(),
            front,
            back,
        })
    }

    /// Name shared by both halves.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The half the scene is captured into.
    pub fn front(&self) -> TextureId {
        self.front
    }

    /// The second half, scratch space for the passes.
    pub fn back(&self) -> TextureId {
        self.back
    }

    /// Whether `texture` is one of the two halves.
    pub fn contains(&self, texture: TextureId) -> bool {
        self.front == texture || self.back == texture
    }

    /// The half that may be written while `input` is being read.
    pub fn scratch_for(&self, input: TextureId) -> TextureId {
        if input == self.back {
            self.front
        } else {
            self.back
        }
    }

    /// Resizes both halves. Content is discarded.
    pub fn resize(&self, gfx: &mut dyn Graphics, width: u32, height: u32) -> Result<()> {
        gfx.resize_texture(self.front, width, height)?;
        gfx.resize_texture(self.back, width, height)
    }

    /// Sampling of the front half, which both halves share.
    pub fn sampling(&self, gfx: &dyn Graphics) -> Result<Sampling> {
        Ok(gfx.texture_desc(self.front)?.sampling)
    }

    fn update_sampling(
        &self,
        gfx: &mut dyn Graphics,
        f: impl Fn(Sampling) -> Sampling,
    ) -> Result<()> {
        for texture in [self.front, self.back] {
            let sampling = gfx.texture_desc(texture)?.sampling;
            gfx.set_sampling(texture, f(sampling))?;
        }
        Ok(())
    }

    /// Sets the wrap mode of both halves.
    pub fn set_wrap(&self, gfx: &mut dyn Graphics, wrap_s: Wrap, wrap_t: Wrap) -> Result<()> {
        self.update_sampling(gfx, |s| s.with_wrap(wrap_s, wrap_t))
    }

    /// Sets the filters of both halves.
    pub fn set_filter(&self, gfx: &mut dyn Graphics, mag: Filter, min: Filter) -> Result<()> {
        self.update_sampling(gfx, |s| s.with_filter(mag, min))
    }

    /// Releases both textures.
    pub fn destroy(self, gfx: &mut dyn Graphics) {
        gfx.destroy_texture(self.front);
        gfx.destroy_texture(self.back);
    }
}

/// Read/write roles over two textures during a pass sequence.
///
/// `read` always holds the most recent result. A pass reads `read`, writes
/// `write`, and [`flip`](Self::flip) afterwards makes its output the new
/// `read`. Passes that do not write this buffer leave the roles alone, so
/// after any number of passes `read` is the latest result with no trailing
/// correction needed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PingPong {
    read: TextureId,
    write: TextureId,
}

impl PingPong {
    /// Pairs the latest result `read` with the scratch texture `write`.
    pub fn new(read: TextureId, write: TextureId) -> Self {
        Self { read, write }
    }

    /// The latest result, read by the next pass.
    pub fn read(&self) -> TextureId {
        self.read
    }

    /// The texture the next writing pass renders into.
    pub fn write(&self) -> TextureId {
        self.write
    }

    /// Swaps roles after a pass wrote `write`.
    pub fn flip(&mut self) {
        std::mem::swap(&mut self.read, &mut self.write);
    }

    /// The texture holding the most recent result.
    pub fn latest(&self) -> TextureId {
        self.read
    }
}
