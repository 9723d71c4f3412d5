//! Texture and renderbuffer descriptions.
//!
//! Textures themselves live inside the graphics backend and are addressed by
//! [`TextureId`]. This module holds the plain-data side: pixel formats, wrap
//! and filter modes, and the descriptors passed to
//! [`Graphics::create_texture`](crate::Graphics::create_texture).
//!
//! It also bridges to the `image` crate so results can be inspected or fed
//! back in as ordinary RGBA images.

use crate::error::{FxError, Result};
use crate::graphics::{Graphics, TextureId};

/// Pixel format of a 2D texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TexelFormat {
    /// 8-bit normalized RGBA.
    Rgba8,
    /// Floating-point RGBA.
    RgbaFloat,
    /// 8-bit normalized single channel, read back replicated into RGB.
    Luminance8,
    /// Floating-point single channel.
    LuminanceFloat,
    /// Depth only.
    Depth,
    /// Combined depth and stencil.
    DepthStencil,
}

/// What a texture or renderbuffer can be attached as.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageKind {
    Color,
    Depth,
    DepthStencil,
    Stencil,
}

impl ImageKind {
    pub fn is_color(self) -> bool {
        self == ImageKind::Color
    }

    pub fn has_depth(self) -> bool {
        matches!(self, ImageKind::Depth | ImageKind::DepthStencil)
    }

    pub fn has_stencil(self) -> bool {
        matches!(self, ImageKind::Stencil | ImageKind::DepthStencil)
    }
}

impl TexelFormat {
    pub fn kind(self) -> ImageKind {
        match self {
            TexelFormat::Rgba8
            | TexelFormat::RgbaFloat
            | TexelFormat::Luminance8
            | TexelFormat::LuminanceFloat => ImageKind::Color,
            TexelFormat::Depth => ImageKind::Depth,
            TexelFormat::DepthStencil => ImageKind::DepthStencil,
        }
    }

    pub fn is_color(self) -> bool {
        self.kind().is_color()
    }

    pub fn is_float(self) -> bool {
        matches!(self, TexelFormat::RgbaFloat | TexelFormat::LuminanceFloat)
    }

    /// The RGBA format matching a float-buffer preference.
    pub fn rgba(float: bool) -> Self {
        if float {
            TexelFormat::RgbaFloat
        } else {
            TexelFormat::Rgba8
        }
    }
}

/// Texture coordinate wrap mode, per axis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Wrap {
    Clamp,
    #[default]
    ClampToEdge,
    ClampToBorder,
    Repeat,
    MirroredRepeat,
}

/// Magnification / minification filter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Filter {
    Nearest,
    #[default]
    Linear,
}

/// Sampling parameters carried by every texture.
///
/// Defaults to clamp-to-edge with linear filtering, the usual choice for
/// screen-sized post-processing buffers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Sampling {
    pub wrap_s: Wrap,
    pub wrap_t: Wrap,
    pub mag_filter: Filter,
    pub min_filter: Filter,
}

impl Sampling {
    pub fn with_wrap(mut self, wrap_s: Wrap, wrap_t: Wrap) -> Self {
        self.wrap_s = wrap_s;
        self.wrap_t = wrap_t;
        self
    }

    pub fn with_filter(mut self, mag_filter: Filter, min_filter: Filter) -> Self {
        self.mag_filter = mag_filter;
        self.min_filter = min_filter;
        self
    }

    /// Nearest filtering on both axes.
    pub fn nearest() -> Self {
        Self::default().with_filter(Filter::Nearest, Filter::Nearest)
    }
}

/// Everything needed to allocate a 2D texture.
#[derive(Clone, Debug, PartialEq)]
pub struct TextureDesc {
    /// Debug label forwarded to the backend.
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub format: TexelFormat,
    pub sampling: Sampling,
}

impl TextureDesc {
    pub fn new(label: impl Into<String>, width: u32, height: u32, format: TexelFormat) -> Self {
        Self {
            label: label.into(),
            width,
            height,
            format,
            sampling: Sampling::default(),
        }
    }

    pub fn with_sampling(mut self, sampling: Sampling) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn texel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Pixel format of a renderbuffer (an attachable image that cannot be sampled).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RenderbufferFormat {
    Rgb,
    Rgba,
    Depth,
    Stencil,
}

impl RenderbufferFormat {
    pub fn kind(self) -> ImageKind {
        match self {
            RenderbufferFormat::Rgb | RenderbufferFormat::Rgba => ImageKind::Color,
            RenderbufferFormat::Depth => ImageKind::Depth,
            RenderbufferFormat::Stencil => ImageKind::Stencil,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderbufferDesc {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub format: RenderbufferFormat,
}

impl RenderbufferDesc {
    pub fn new(
        label: impl Into<String>,
        width: u32,
        height: u32,
        format: RenderbufferFormat,
    ) -> Self {
        Self {
            label: label.into(),
            width,
            height,
            format,
        }
    }
}

/// Reads a texture back into a floating-point RGBA image.
pub fn read_image(gfx: &mut dyn Graphics, texture: TextureId) -> Result<image::Rgba32FImage> {
    let desc = gfx.texture_desc(texture)?;
    let texels = gfx.read_texels(texture)?;
    let raw: Vec<f32> = texels.iter().flat_map(|t| t.iter().copied()).collect();
    image::Rgba32FImage::from_raw(desc.width, desc.height, raw).ok_or_else(|| {
        FxError::creation(format!(
            "texture '{}' returned {} texels for {}x{}",
            desc.label,
            texels.len(),
            desc.width,
            desc.height
        ))
    })
}

/// Uploads an 8-bit RGBA image into a new [`TexelFormat::Rgba8`] texture.
pub fn upload_image(
    gfx: &mut dyn Graphics,
    label: &str,
    img: &image::RgbaImage,
    sampling: Sampling,
) -> Result<TextureId> {
    let (width, height) = img.dimensions();
    let desc = TextureDesc::new(label, width, height, TexelFormat::Rgba8).with_sampling(sampling);
    let texture = gfx.create_texture(&desc)?;
    let texels: Vec<[f32; 4]> = img
        .pixels()
        .map(|p| p.0.map(|c| c as f32 / 255.0))
        .collect();
    if let Err(err) = gfx.write_texels(texture, &texels) {
        gfx.destroy_texture(texture);
        return Err(err);
    }
    Ok(texture)
}
