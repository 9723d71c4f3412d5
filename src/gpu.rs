//! Core GPU context and device management.
//!
//! [`GpuContext`] holds the wgpu device and queue that
//! [`WgpuGraphics`](crate::WgpuGraphics) renders with, plus the surface it
//! presents to. It is created either from a winit [`Window`] or headless with
//! an explicit size, in which case the "screen" is an off-screen texture that
//! can be read back.
//!
//! # Example
//!
//! ```no_run
//! use hoplite_fx::{GpuContext, WgpuGraphics};
//!
//! let gpu = GpuContext::headless(640, 480)?;
//! let gfx = WgpuGraphics::new(gpu)?;
//! # Ok::<(), hoplite_fx::FxError>(())
//! ```
//!
//! [`Window`]: winit::window::Window

use std::sync::Arc;
use winit::window::Window;

use crate::error::{FxError, Result};

/// Format of the off-screen "screen" of a headless context.
pub const HEADLESS_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// Core GPU context holding wgpu resources.
///
/// All fields are public to allow direct access to wgpu APIs when needed.
pub struct GpuContext {
    /// The window surface, or `None` for a headless context.
    pub surface: Option<wgpu::Surface<'static>>,
    /// The logical GPU device for creating resources and pipelines.
    pub device: wgpu::Device,
    /// The command queue for submitting work to the GPU.
    pub queue: wgpu::Queue,
    /// Screen configuration (format, size, present mode). Headless contexts
    /// keep it too, as the description of their off-screen screen.
    pub config: wgpu::SurfaceConfiguration,
}

impl GpuContext {
    /// Create a new GPU context from a winit window.
    ///
    /// Creates the instance and surface, requests an adapter that can present
    /// to it, then configures the surface with an sRGB format and Fifo present
    /// mode.
    pub fn new(window: Arc<Window>) -> Result<Self> {
        let size = window.inner_size();
        let instance = Self::instance();

        let surface = instance
            .create_surface(window)
            .map_err(|e| FxError::creation(format!("failed to create surface: {e}")))?;
        let (adapter, device, queue) = Self::request_device(&instance, Some(&surface))?;

        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .or(surface_caps.formats.first())
            .copied()
            .ok_or_else(|| FxError::creation("surface reports no supported formats"))?;
        let alpha_mode = surface_caps
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(wgpu::CompositeAlphaMode::Auto);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::Fifo,
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);
        log::debug!(
            "Created windowed GPU context {}x{} ({:?})",
            config.width,
            config.height,
            config.format
        );

        Ok(Self {
            surface: Some(surface),
            device,
            queue,
            config,
        })
    }

    /// Create a GPU context without a window.
    pub fn headless(width: u32, height: u32) -> Result<Self> {
        let instance = Self::instance();
        let (_, device, queue) = Self::request_device(&instance, None)?;
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            format: HEADLESS_FORMAT,
            width: width.max(1),
            height: height.max(1),
            present_mode: wgpu::PresentMode::Fifo,
            alpha_mode: wgpu::CompositeAlphaMode::Opaque,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        log::debug!("Created headless GPU context {}x{}", config.width, config.height);
        Ok(Self {
            surface: None,
            device,
            queue,
            config,
        })
    }

    fn instance() -> wgpu::Instance {
        wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        })
    }

    fn request_device(
        instance: &wgpu::Instance,
        surface: Option<&wgpu::Surface<'static>>,
    ) -> Result<(wgpu::Adapter, wgpu::Device, wgpu::Queue)> {
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::default(),
            compatible_surface: surface,
            force_fallback_adapter: false,
        }))
        .map_err(|e| FxError::creation(format!("no suitable GPU adapter: {e}")))?;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("Hoplite FX Device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: Default::default(),
            trace: Default::default(),
            experimental_features: Default::default(),
        }))
        .map_err(|e| FxError::creation(format!("failed to create device: {e}")))?;

        Ok((adapter, device, queue))
    }

    pub fn is_headless(&self) -> bool {
        self.surface.is_none()
    }

    /// Resize the screen to new dimensions.
    ///
    /// Ignores zero-sized dimensions (which occur during window minimize).
    pub fn resize(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.config.width = width;
            self.config.height = height;
            if let Some(surface) = &self.surface {
                surface.configure(&self.device, &self.config);
            }
        }
    }

    /// Returns the current screen width in pixels.
    pub fn width(&self) -> u32 {
        self.config.width
    }

    /// Returns the current screen height in pixels.
    pub fn height(&self) -> u32 {
        self.config.height
    }

    /// Returns the current aspect ratio (width / height).
    pub fn aspect(&self) -> f32 {
        self.config.width as f32 / self.config.height as f32
    }
}
