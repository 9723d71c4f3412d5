//! # Hoplite FX
//!
//! **Chainable multi-pass post-processing for Rust.**
//!
//! An [`Effect`] captures whatever is rendered between
//! [`pre_render`](EffectGraph::pre_render) and
//! [`post_render`](EffectGraph::post_render), runs it through an ordered list
//! of fullscreen [`Pass`]es that ping-pong between two buffer pairs, and
//! either draws the result to the screen or hands it to the effects chained
//! after it.
//!
//! ## Quick Start
//!
//! ```
//! use hoplite_fx::*;
//!
//! # fn main() -> Result<()> {
//! let mut gfx = SoftwareGraphics::new(64, 64);
//! gfx.register_kernel("invert", &["scene"], |frag, out| {
//!     let c = frag.sample("scene");
//!     out.set_color(0, [1.0 - c[0], 1.0 - c[1], 1.0 - c[2], c[3]]);
//! });
//!
//! let viewport = Viewport::sized(64, 64);
//! let mut graph = EffectGraph::new();
//! let invert = graph.insert(
//!     Effect::builder("invert")
//!         .setup(|fx, gfx| {
//!             let pass = fx.add_pass(gfx, &["invert"])?;
//!             let pass = fx.pass_mut(pass)?;
//!             pass.bind_color_buffer("scene")?;
//!             pass.enable_color_output()?;
//!             Ok(())
//!         })
//!         .build(&viewport),
//! );
//!
//! graph.pre_render(invert, &mut gfx)?;
//! // ... draw the scene ...
//! graph.post_render(invert, &mut gfx)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Backends
//!
//! Everything above the [`Graphics`] trait is backend-agnostic.
//! [`WgpuGraphics`] renders on the GPU with WGSL fragment programs;
//! [`SoftwareGraphics`] is a CPU rasterizer whose programs are Rust closures,
//! used for tests and headless tooling.

mod effect;
mod effect_graph;
mod error;
mod framebuffer;
mod gpu;
mod graphics;
mod pass;
mod program;
mod texture;
mod texture_pair;
mod viewport;

pub mod backend;

pub use backend::software::{Fragment, FragmentOutput, SoftwareGraphics};
pub use backend::wgpu::WgpuGraphics;
pub use effect::{Effect, EffectBuilder, EffectId, EffectState};
pub use effect_graph::EffectGraph;
pub use error::{ErrorKind, FxError, Result};
pub use framebuffer::FramebufferTarget;
pub use gpu::{GpuContext, HEADLESS_FORMAT};
pub use graphics::{
    AttachmentPoint, FramebufferId, FramebufferStatus, Graphics, Image, Limits, ProgramId,
    RenderbufferId, TextureId,
};
pub use pass::{Pass, PassHandle};
pub use program::{FragmentProgram, UniformValue};
pub use texture::{
    Filter, ImageKind, RenderbufferDesc, RenderbufferFormat, Sampling, TexelFormat, TextureDesc,
    Wrap, read_image, upload_image,
};
pub use texture_pair::{PingPong, TexturePair};
pub use viewport::{Viewport, ViewportRect};
