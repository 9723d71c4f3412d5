//! Animated scene with a three-pass bloom.
//!
//! Pass 0 copies the scene and writes its bright parts into auxiliary buffer 1,
//! pass 1 blurs that buffer horizontally into its own auxiliary buffer, and
//! pass 2 blurs vertically and adds the glow back onto the scene.
//!
//! Run with `cargo run --example bloom`.

use std::sync::Arc;
use std::time::Instant;

use hoplite_fx::{
    Effect, EffectGraph, EffectId, FragmentProgram, Graphics, GpuContext, Pass, Result,
    UniformValue, Viewport, WgpuGraphics,
};
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowAttributes, WindowId};

const SCENE: &str = r#"
@group(0) @binding(0) var<uniform> time: f32;

@fragment
fn fs(in: QuadOutput) -> @location(0) vec4f {
    let p = in.uv * 2.0 - 1.0;
    let orbit = vec2f(cos(time), sin(time * 1.3)) * 0.5;
    let glow = 0.02 / max(length(p - orbit), 0.001);
    let stripes = 0.15 + 0.1 * sin(p.y * 30.0 + time * 2.0);
    return vec4f(vec3f(stripes, stripes * 0.6, stripes * 1.4) + glow * vec3f(1.0, 0.7, 0.3), 1.0);
}
"#;

const BRIGHT: &str = r#"
@group(0) @binding(0) var scene: texture_2d<f32>;
@group(0) @binding(1) var scene_sampler: sampler;
@group(0) @binding(2) var<uniform> threshold: f32;

struct Out {
    @location(0) color: vec4f,
    @location(1) bright: vec4f,
}

@fragment
fn fs(in: QuadOutput) -> Out {
    let c = textureSample(scene, scene_sampler, in.uv);
    let luma = dot(c.rgb, vec3f(0.2126, 0.7152, 0.0722));
    var out: Out;
    out.color = c;
    out.bright = vec4f(c.rgb * max(luma - threshold, 0.0), 1.0);
    return out;
}
"#;

const BLUR: &str = r#"
@group(0) @binding(0) var source: texture_2d<f32>;
@group(0) @binding(1) var source_sampler: sampler;
@group(0) @binding(2) var<uniform> blur_step: vec2f;

fn blur(uv: vec2f) -> vec4f {
    var sum = textureSample(source, source_sampler, uv) * 0.227;
    sum += textureSample(source, source_sampler, uv + blur_step * 1.385) * 0.316;
    sum += textureSample(source, source_sampler, uv - blur_step * 1.385) * 0.316;
    sum += textureSample(source, source_sampler, uv + blur_step * 3.231) * 0.070;
    sum += textureSample(source, source_sampler, uv - blur_step * 3.231) * 0.070;
    return sum;
}
"#;

const BLUR_H: &str = r#"
@fragment
fn fs(in: QuadOutput) -> @location(1) vec4f {
    return blur(in.uv);
}
"#;

const COMPOSITE: &str = r#"
@group(0) @binding(3) var scene: texture_2d<f32>;
@group(0) @binding(4) var scene_sampler: sampler;
@group(0) @binding(5) var<uniform> intensity: f32;

@fragment
fn fs(in: QuadOutput) -> @location(0) vec4f {
    let base = textureSample(scene, scene_sampler, in.uv);
    return vec4f(base.rgb + blur(in.uv).rgb * intensity, base.a);
}
"#;

fn bloom(viewport: &Viewport) -> Effect {
    Effect::builder("bloom")
        .float_buffers(true)
        .setup(|fx, gfx| {
            let bright = fx.add_pass(gfx, &[BRIGHT])?;
            let pass = fx.pass_mut(bright)?;
            pass.bind_color_buffer("scene")?
                .enable_color_output()?
                .bind_float("threshold", 0.6);
            pass.attach_aux_buffer(gfx, 1, true)?;

            let horizontal = fx.add_pass(gfx, &[BLUR, BLUR_H])?;
            fx.pass_mut(horizontal)?.attach_aux_buffer(gfx, 1, true)?;
            fx.bind_aux_buffer(horizontal, "source", bright, 1)?;

            let composite = fx.add_pass(gfx, &[BLUR, COMPOSITE])?;
            fx.pass_mut(composite)?
                .bind_color_buffer("scene")?
                .enable_color_output()?;
            fx.bind_aux_buffer(composite, "source", horizontal, 1)?;
            Ok(())
        })
        .per_frame({
            let mut time = 0.0f32;
            move |fx: &mut Effect, dt: f32| {
                time += dt;
                let (width, height) = fx.size();
                let texel = [1.0 / width as f32, 1.0 / height as f32];
                let handles: Vec<_> = fx.passes().iter().map(Pass::handle).collect();
                if let [_, horizontal, composite] = handles[..] {
                    fx.pass_mut(horizontal)?
                        .bind_float_vector("blur_step", &[texel[0], 0.0])?;
                    fx.pass_mut(composite)?
                        .bind_float_vector("blur_step", &[0.0, texel[1]])?
                        .bind_float("intensity", 1.2 + 0.4 * (time * 0.7).sin());
                }
                Ok(())
            }
        })
        .build(viewport)
}

struct Running {
    window: Arc<Window>,
    gfx: WgpuGraphics,
    viewport: Viewport,
    graph: EffectGraph,
    bloom: EffectId,
    scene: FragmentProgram,
    start_time: Instant,
    last_frame: Instant,
}

impl Running {
    fn new(event_loop: &ActiveEventLoop) -> Result<Self> {
        let attrs = WindowAttributes::default()
            .with_title("hoplite-fx bloom")
            .with_inner_size(winit::dpi::LogicalSize::new(960, 540));
        let window = Arc::new(
            event_loop
                .create_window(attrs)
                .map_err(|e| hoplite_fx::FxError::ResourceCreation(e.to_string()))?,
        );
        let mut gfx = WgpuGraphics::new(GpuContext::new(window.clone())?)?;
        let (width, height) = gfx.screen_size();
        let viewport = Viewport::sized(width, height);

        let mut graph = EffectGraph::new();
        let bloom = graph.insert(bloom(&viewport));
        let scene = FragmentProgram::compile(&mut gfx, "scene", &[SCENE])?;

        Ok(Self {
            window,
            gfx,
            viewport,
            graph,
            bloom,
            scene,
            start_time: Instant::now(),
            last_frame: Instant::now(),
        })
    }

    fn redraw(&mut self) -> Result<()> {
        let now = Instant::now();
        let dt = now.duration_since(self.last_frame).as_secs_f32();
        self.last_frame = now;

        self.gfx.begin_frame()?;
        self.graph.pre_render(self.bloom, &mut self.gfx)?;
        self.scene.set_uniform(
            "time",
            UniformValue::float(self.start_time.elapsed().as_secs_f32()),
        );
        self.scene.apply(&mut self.gfx)?;
        self.gfx.set_viewport(self.viewport.rect());
        self.gfx.draw_quad()?;
        self.graph.post_render(self.bloom, &mut self.gfx)?;
        self.graph.tick(dt)?;
        self.gfx.present();
        Ok(())
    }
}

enum App {
    Pending,
    Running(Box<Running>),
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if let App::Pending = self {
            match Running::new(event_loop) {
                Ok(running) => {
                    running.window.request_redraw();
                    *self = App::Running(Box::new(running));
                }
                Err(err) => {
                    log::error!("failed to start: {err}");
                    event_loop.exit();
                }
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        let App::Running(app) = self else {
            return;
        };

        match event {
            WindowEvent::CloseRequested => {
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if size.width > 0 && size.height > 0 {
                    app.gfx.resize_screen(size.width, size.height);
                    app.viewport.resize(size.width, size.height);
                }
            }
            WindowEvent::RedrawRequested => {
                if let Err(err) = app.redraw() {
                    log::error!("frame failed: {err}");
                    event_loop.exit();
                    return;
                }
                app.window.request_redraw();
            }
            _ => {}
        }
    }
}

fn main() {
    env_logger::init();
    let event_loop = match EventLoop::new() {
        Ok(event_loop) => event_loop,
        Err(err) => {
            log::error!("failed to create event loop: {err}");
            return;
        }
    };
    event_loop.set_control_flow(ControlFlow::Poll);
    if let Err(err) = event_loop.run_app(&mut App::Pending) {
        log::error!("event loop failed: {err}");
    }
}
