use std::cell::Cell;
use std::rc::Rc;

use hoplite_fx::*;

const SIZE: (u32, u32) = (4, 3);
const TOLERANCE: f32 = 1.0 / 255.0;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A software backend with a procedural scene and a few pass kernels.
fn graphics() -> SoftwareGraphics {
    init_logger();
    let mut gfx = SoftwareGraphics::new(SIZE.0, SIZE.1);
    gfx.register_kernel("scene", &[], |frag, out| {
        let (x, y) = frag.position();
        out.set_color(0, [x as f32 * 0.2, y as f32 * 0.3, 0.4, 1.0]);
        out.set_depth(0.25 + x as f32 * 0.1);
    });
    gfx.register_kernel("invert", &["scene"], |frag, out| {
        let c = frag.sample("scene");
        out.set_color(0, [1.0 - c[0], 1.0 - c[1], 1.0 - c[2], c[3]]);
    });
    gfx.register_kernel("darken", &["scene", "amount"], |frag, out| {
        let c = frag.sample("scene");
        let k = 1.0 - frag.float("amount");
        out.set_color(0, [c[0] * k, c[1] * k, c[2] * k, c[3]]);
    });
    gfx.register_kernel("mrt", &["scene"], |frag, out| {
        let c = frag.sample("scene");
        out.set_color(0, c);
        out.set_color(1, [c[3], c[2], c[1], c[0]]);
    });
    gfx
}

/// The texels `scene` renders at the standard size.
fn expected_scene() -> Vec<[f32; 4]> {
    let mut texels = Vec::new();
    for y in 0..SIZE.1 {
        for x in 0..SIZE.0 {
            texels.push([x as f32 * 0.2, y as f32 * 0.3, 0.4, 1.0]);
        }
    }
    texels
}

fn inverted(texels: &[[f32; 4]]) -> Vec<[f32; 4]> {
    texels
        .iter()
        .map(|c| [1.0 - c[0], 1.0 - c[1], 1.0 - c[2], c[3]])
        .collect()
}

fn assert_texels_eq(actual: &[[f32; 4]], expected: &[[f32; 4]]) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        for c in 0..4 {
            assert!(
                (a[c] - e[c]).abs() <= TOLERANCE,
                "texel {i} channel {c}: {a:?} != {e:?}"
            );
        }
    }
}

/// Runs one frame of `id`, rendering the procedural scene into its capture target.
fn frame(graph: &mut EffectGraph, gfx: &mut SoftwareGraphics, id: EffectId) -> Result<()> {
    graph.pre_render(id, gfx)?;
    let scene = gfx.create_program("scene", &["scene"])?;
    gfx.use_program(Some(scene))?;
    let (width, height) = graph.get(id).map(Effect::size).unwrap_or(SIZE);
    gfx.set_viewport(ViewportRect::sized(width, height));
    gfx.draw_quad()?;
    gfx.use_program(None)?;
    gfx.destroy_program(scene);
    graph.post_render(id, gfx)
}

fn single_pass(kernel: &'static str) -> impl FnOnce(&mut Effect, &mut dyn Graphics) -> Result<()> {
    move |fx, gfx| {
        let pass = fx.add_pass(gfx, &[kernel])?;
        fx.pass_mut(pass)?
            .bind_color_buffer("scene")?
            .enable_color_output()?;
        Ok(())
    }
}

#[test]
fn final_color_buffer_is_the_pass_output() {
    let mut gfx = graphics();
    let viewport = Viewport::sized(SIZE.0, SIZE.1);
    let mut graph = EffectGraph::new();
    let id = graph.insert(
        Effect::builder("invert")
            .setup(single_pass("invert"))
            .build(&viewport),
    );

    frame(&mut graph, &mut gfx, id).unwrap();
    let color = graph.get(id).unwrap().final_color_buffer().unwrap();
    assert_texels_eq(
        &gfx.read_texels(color).unwrap(),
        &inverted(&expected_scene()),
    );
    // The screen received the same result.
    assert_texels_eq(gfx.read_screen(), &inverted(&expected_scene()));

    // A second frame must not swap back onto the captured input.
    frame(&mut graph, &mut gfx, id).unwrap();
    let color = graph.get(id).unwrap().final_color_buffer().unwrap();
    assert_texels_eq(
        &gfx.read_texels(color).unwrap(),
        &inverted(&expected_scene()),
    );
}

#[test]
fn passes_compose_in_order() {
    let mut gfx = graphics();
    let viewport = Viewport::sized(SIZE.0, SIZE.1);
    let mut graph = EffectGraph::new();
    let id = graph.insert(
        Effect::builder("invert then darken")
            .float_buffers(true)
            .setup(|fx, gfx| {
                let invert = fx.add_pass(gfx, &["invert"])?;
                fx.pass_mut(invert)?
                    .bind_color_buffer("scene")?
                    .enable_color_output()?;
                let darken = fx.add_pass(gfx, &["darken"])?;
                fx.pass_mut(darken)?
                    .bind_color_buffer("scene")?
                    .enable_color_output()?
                    .bind_float("amount", 0.5);
                Ok(())
            })
            .build(&viewport),
    );

    frame(&mut graph, &mut gfx, id).unwrap();
    let expected: Vec<[f32; 4]> = inverted(&expected_scene())
        .iter()
        .map(|c| [c[0] * 0.5, c[1] * 0.5, c[2] * 0.5, c[3]])
        .collect();
    let color = graph.get(id).unwrap().final_color_buffer().unwrap();
    assert_texels_eq(&gfx.read_texels(color).unwrap(), &expected);
}

#[test]
fn disabled_effect_passes_input_through() {
    for pass_count in 0..4 {
        let mut gfx = graphics();
        let viewport = Viewport::sized(SIZE.0, SIZE.1);
        let mut graph = EffectGraph::new();
        let id = graph.insert(
            Effect::builder("disabled")
                .enabled(false)
                .setup(move |fx, gfx| {
                    for _ in 0..pass_count {
                        let pass = fx.add_pass(gfx, &["invert"])?;
                        fx.pass_mut(pass)?
                            .bind_color_buffer("scene")?
                            .enable_color_output()?
                            .enable_depth_output();
                    }
                    Ok(())
                })
                .build(&viewport),
        );

        frame(&mut graph, &mut gfx, id).unwrap();
        let effect = graph.get(id).unwrap();
        let color = gfx.read_texels(effect.final_color_buffer().unwrap()).unwrap();
        assert_texels_eq(&color, &expected_scene());

        let depth = gfx.read_texels(effect.final_depth_buffer().unwrap()).unwrap();
        for (i, texel) in depth.iter().enumerate() {
            let x = (i as u32 % SIZE.0) as f32;
            assert!((texel[0] - (0.25 + x * 0.1)).abs() < 1e-6);
        }
    }
}

#[test]
fn aux_buffers_bind_only_from_earlier_passes() {
    let mut gfx = graphics();
    let viewport = Viewport::sized(SIZE.0, SIZE.1);
    let mut graph = EffectGraph::new();
    let id = graph.insert(Effect::builder("aux").build(&viewport));
    frame(&mut graph, &mut gfx, id).unwrap();

    let effect = graph.get_mut(id).unwrap();
    let mut handles = Vec::new();
    for _ in 0..3 {
        let pass = effect.add_pass(&mut gfx, &["mrt"]).unwrap();
        effect
            .pass_mut(pass)
            .unwrap()
            .attach_aux_buffer(&mut gfx, 1, false)
            .unwrap();
        handles.push(pass);
    }

    for &target in &handles {
        for &source in &handles {
            let result = effect.bind_aux_buffer(target, "aux", source, 1);
            if target.index() > source.index() {
                assert!(result.is_ok(), "{} <- {}", target.index(), source.index());
            } else {
                let err = result.unwrap_err();
                assert_eq!(err.kind(), ErrorKind::Configuration);
            }
        }
    }

    // Reading a slot the earlier pass never attached.
    let err = effect
        .bind_aux_buffer(handles[2], "aux", handles[0], 2)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    // Handles are not transferable between effects.
    let other = graph.insert(Effect::builder("other").build(&viewport));
    frame(&mut graph, &mut gfx, other).unwrap();
    let foreign = graph
        .get_mut(other)
        .unwrap()
        .add_pass(&mut gfx, &["invert"])
        .unwrap();
    let err = graph
        .get_mut(id)
        .unwrap()
        .bind_aux_buffer(handles[2], "aux", foreign, 1)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn aux_buffer_receives_second_output() {
    let mut gfx = graphics();
    let viewport = Viewport::sized(SIZE.0, SIZE.1);
    let mut graph = EffectGraph::new();
    let handle = Rc::new(Cell::new(None));
    let stored = handle.clone();
    let id = graph.insert(
        Effect::builder("mrt")
            .setup(move |fx, gfx| {
                let pass = fx.add_pass(gfx, &["mrt"])?;
                let p = fx.pass_mut(pass)?;
                p.bind_color_buffer("scene")?.enable_color_output()?;
                p.attach_aux_buffer(gfx, 1, false)?;
                stored.set(Some(pass));
                Ok(())
            })
            .build(&viewport),
    );

    frame(&mut graph, &mut gfx, id).unwrap();
    let pass = handle.get().unwrap();
    let aux = graph.get(id).unwrap().pass(pass).unwrap().aux_buffer(1).unwrap();
    let expected: Vec<[f32; 4]> = expected_scene()
        .iter()
        .map(|c| [c[3], c[2], c[1], c[0]])
        .collect();
    assert_texels_eq(&gfx.read_texels(aux).unwrap(), &expected);
}

#[test]
fn attachment_point_zero_is_exclusive() {
    let mut gfx = graphics();
    let viewport = Viewport::sized(SIZE.0, SIZE.1);
    let mut graph = EffectGraph::new();
    let id = graph.insert(Effect::builder("exclusive").build(&viewport));
    frame(&mut graph, &mut gfx, id).unwrap();
    let effect = graph.get_mut(id).unwrap();

    let first = effect.add_pass(&mut gfx, &["invert"]).unwrap();
    let pass = effect.pass_mut(first).unwrap();
    pass.enable_color_output().unwrap();
    let err = pass.attach_aux_buffer(&mut gfx, 0, false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let second = effect.add_pass(&mut gfx, &["invert"]).unwrap();
    let pass = effect.pass_mut(second).unwrap();
    pass.attach_aux_buffer(&mut gfx, 0, false).unwrap();
    let err = pass.enable_color_output().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn self_chain_is_a_cycle() {
    let mut gfx = graphics();
    let viewport = Viewport::sized(SIZE.0, SIZE.1);
    let mut graph = EffectGraph::new();
    let a = graph.insert(Effect::builder("a").build(&viewport));
    graph.chain(a, a).unwrap();

    let err = graph.pre_render(a, &mut gfx).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cycle);
    assert_eq!(gfx.bound_framebuffer(), None);

    // The guard is released, so the effect is usable once the loop is gone.
    graph.get_mut(a).unwrap().unchain(a);
    frame(&mut graph, &mut gfx, a).unwrap();
}

#[test]
fn transitive_chain_is_a_cycle() {
    let mut gfx = graphics();
    let viewport = Viewport::sized(SIZE.0, SIZE.1);
    let mut graph = EffectGraph::new();
    let a = graph.insert(Effect::builder("a").build(&viewport));
    let b = graph.insert(Effect::builder("b").build(&viewport));
    graph.chain(a, b).unwrap();
    graph.chain(b, a).unwrap();

    let err = graph.pre_render(a, &mut gfx).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cycle);
    let err = graph.pre_render(b, &mut gfx).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cycle);
}

#[test]
fn clone_matches_source_and_stays_independent() {
    let mut gfx = graphics();
    let sampling = Sampling::default()
        .with_wrap(Wrap::Repeat, Wrap::MirroredRepeat)
        .with_filter(Filter::Nearest, Filter::Linear);
    let desc = TextureDesc::new("source", 2, 2, TexelFormat::RgbaFloat).with_sampling(sampling);
    let source = gfx.create_texture(&desc).unwrap();
    let texels = [
        [0.1, 0.2, 0.3, 0.4],
        [1.5, -2.0, 0.0, 1.0],
        [0.0, 0.0, 0.0, 0.0],
        [9.0, 8.0, 7.0, 6.0],
    ];
    gfx.write_texels(source, &texels).unwrap();

    let clone = gfx.clone_texture(source).unwrap();
    assert_ne!(clone, source);
    let clone_desc = gfx.texture_desc(clone).unwrap();
    assert_eq!(clone_desc.format, TexelFormat::RgbaFloat);
    assert_eq!(clone_desc.sampling, sampling);
    assert_eq!((clone_desc.width, clone_desc.height), (2, 2));
    assert_eq!(gfx.read_texels(clone).unwrap(), texels.to_vec());

    gfx.write_texels(source, &[[0.5; 4]; 4]).unwrap();
    assert_eq!(gfx.read_texels(clone).unwrap(), texels.to_vec());

    // Clone-into keeps the destination handle but takes everything else.
    let dst = gfx
        .create_texture(&TextureDesc::new("dst", 1, 1, TexelFormat::Rgba8))
        .unwrap();
    gfx.clone_texture_into(source, dst).unwrap();
    let dst_desc = gfx.texture_desc(dst).unwrap();
    assert_eq!(dst_desc.format, TexelFormat::RgbaFloat);
    assert_eq!(dst_desc.sampling, sampling);
    assert_eq!(gfx.read_texels(dst).unwrap(), vec![[0.5; 4]; 4]);
}

#[test]
fn disabled_parent_feeds_chained_child() {
    let mut gfx = graphics();
    let viewport = Viewport::sized(SIZE.0, SIZE.1);
    let mut graph = EffectGraph::new();
    let parent = graph.insert(
        Effect::builder("parent")
            .enabled(false)
            .setup(single_pass("darken"))
            .build(&viewport),
    );
    let child = graph.insert(
        Effect::builder("child")
            .screen_output(false)
            .setup(single_pass("invert"))
            .build(&viewport),
    );
    graph.chain(parent, child).unwrap();

    frame(&mut graph, &mut gfx, parent).unwrap();
    let expected = inverted(&expected_scene());
    let parent_color = graph.get(parent).unwrap().final_color_buffer().unwrap();
    assert_texels_eq(&gfx.read_texels(parent_color).unwrap(), &expected);
    let child_color = graph.get(child).unwrap().final_color_buffer().unwrap();
    assert_eq!(parent_color, child_color);
    assert_texels_eq(gfx.read_screen(), &expected);
}

#[test]
fn same_child_chained_twice_applies_twice() {
    let mut gfx = graphics();
    let viewport = Viewport::sized(SIZE.0, SIZE.1);
    let mut graph = EffectGraph::new();
    let parent = graph.insert(Effect::builder("parent").build(&viewport));
    let child = graph.insert(
        Effect::builder("invert")
            .setup(single_pass("invert"))
            .build(&viewport),
    );
    graph.chain(parent, child).unwrap();
    graph.chain(parent, child).unwrap();

    frame(&mut graph, &mut gfx, parent).unwrap();
    let color = graph.get(parent).unwrap().final_color_buffer().unwrap();
    assert_texels_eq(&gfx.read_texels(color).unwrap(), &expected_scene());
}

#[test]
fn operations_before_first_frame_are_usage_errors() {
    let mut gfx = graphics();
    let viewport = Viewport::sized(SIZE.0, SIZE.1);
    let mut graph = EffectGraph::new();
    let id = graph.insert(Effect::builder("fresh").build(&viewport));

    let usage = |result: Result<()>| {
        assert_eq!(result.unwrap_err().kind(), ErrorKind::UsageOrder);
    };
    let effect = graph.get_mut(id).unwrap();
    usage(effect.add_pass(&mut gfx, &["invert"]).map(drop));
    usage(effect.final_color_buffer().map(drop));
    usage(effect.final_depth_buffer().map(drop));
    usage(effect.final_color_buffer_clone(&mut gfx).map(drop));
    usage(effect.final_depth_buffer_clone(&mut gfx).map(drop));
    let dst = gfx
        .create_texture(&TextureDesc::new("dst", 1, 1, TexelFormat::Rgba8))
        .unwrap();
    let effect = graph.get(id).unwrap();
    usage(effect.final_color_buffer_into(&mut gfx, dst));
    usage(effect.final_depth_buffer_into(&mut gfx, dst));
    usage(graph.resize(id, &mut gfx, 8, 8));
}

#[test]
fn every_buffer_follows_the_viewport() {
    let mut gfx = graphics();
    let viewport = Viewport::sized(SIZE.0, SIZE.1);
    let mut graph = EffectGraph::new();
    let parent = graph.insert(
        Effect::builder("parent")
            .setup(|fx, gfx| {
                let pass = fx.add_pass(gfx, &["mrt"])?;
                let pass = fx.pass_mut(pass)?;
                pass.bind_color_buffer("scene")?.enable_color_output()?;
                pass.attach_aux_buffer(gfx, 1, true)?;
                pass.attach_aux_buffer(gfx, 2, false)?;
                Ok(())
            })
            .build(&viewport),
    );
    let child = graph.insert(
        Effect::builder("child")
            .setup(single_pass("invert"))
            .build(&viewport),
    );
    graph.chain(parent, child).unwrap();
    frame(&mut graph, &mut gfx, parent).unwrap();

    let check = |graph: &EffectGraph, gfx: &SoftwareGraphics, size: (u32, u32)| {
        for id in [parent, child] {
            let effect = graph.get(id).unwrap();
            assert_eq!(effect.size(), size);
            for texture in [
                effect.final_color_buffer().unwrap(),
                effect.final_depth_buffer().unwrap(),
            ] {
                let desc = gfx.texture_desc(texture).unwrap();
                assert_eq!((desc.width, desc.height), size);
            }
            for pass in effect.passes() {
                for slot in 1..3 {
                    if let Ok(aux) = pass.aux_buffer(slot) {
                        let desc = gfx.texture_desc(aux).unwrap();
                        assert_eq!((desc.width, desc.height), size);
                    }
                }
            }
        }
    };

    // Observed during pre-render.
    viewport.resize(6, 5);
    frame(&mut graph, &mut gfx, parent).unwrap();
    check(&graph, &gfx, (6, 5));

    // Explicit resize, then a frame once the viewport agrees.
    graph.resize(parent, &mut gfx, 2, 7).unwrap();
    check(&graph, &gfx, (2, 7));
    viewport.resize(2, 7);
    frame(&mut graph, &mut gfx, parent).unwrap();
    check(&graph, &gfx, (2, 7));
}

#[test]
fn post_render_restores_graphics_state() {
    let mut gfx = graphics();
    let viewport = Viewport::sized(SIZE.0, SIZE.1);
    let mut graph = EffectGraph::new();
    let id = graph.insert(
        Effect::builder("invert")
            .setup(single_pass("invert"))
            .build(&viewport),
    );

    let outer = gfx.create_framebuffer("outer").unwrap();
    let target = gfx
        .create_texture(&TextureDesc::new("outer color", SIZE.0, SIZE.1, TexelFormat::Rgba8))
        .unwrap();
    gfx.attach(outer, AttachmentPoint::Color(0), Some(Image::Texture(target)))
        .unwrap();
    gfx.bind_framebuffer(Some(outer)).unwrap();
    let rect = ViewportRect::new(1, 1, 2, 2);
    gfx.set_viewport(rect);

    graph.pre_render(id, &mut gfx).unwrap();
    assert_ne!(gfx.bound_framebuffer(), Some(outer));
    gfx.set_viewport(rect);
    graph.post_render(id, &mut gfx).unwrap();

    assert_eq!(gfx.bound_framebuffer(), Some(outer));
    assert_eq!(gfx.viewport(), rect);
    assert_eq!(gfx.active_program(), None);
    assert_eq!(gfx.state_depth(), 0);
    // The inverted clear color went to the framebuffer bound before pre-render.
    let texels = gfx.read_texels(target).unwrap();
    assert_texels_eq(&texels, &vec![[1.0, 1.0, 1.0, 0.0]; texels.len()]);
}

#[test]
fn per_frame_runs_once_per_executed_frame() {
    let mut gfx = graphics();
    let viewport = Viewport::sized(SIZE.0, SIZE.1);
    let mut graph = EffectGraph::new();
    let calls = Rc::new(Cell::new(0));
    let counter = calls.clone();
    let id = graph.insert(
        Effect::builder("ticking")
            .per_frame(move |_, dt| {
                assert!(dt > 0.0);
                counter.set(counter.get() + 1);
                Ok(())
            })
            .build(&viewport),
    );

    graph.tick(0.016).unwrap();
    assert_eq!(calls.get(), 0);
    frame(&mut graph, &mut gfx, id).unwrap();
    graph.tick(0.016).unwrap();
    graph.tick(0.016).unwrap();
    assert_eq!(calls.get(), 1);
}

#[test]
fn limits_are_reported_after_setup() {
    init_logger();
    let mut gfx = SoftwareGraphics::new(2, 2).with_limits(Limits {
        max_color_attachments: 2,
        max_texture_bindings: 1,
    });
    gfx.register_kernel("two", &["a", "b"], |frag, out| {
        out.set_color(0, frag.sample("a"));
    });
    let viewport = Viewport::sized(2, 2);
    let mut graph = EffectGraph::new();
    let id = graph.insert(Effect::builder("limited").screen_output(false).build(&viewport));
    graph.pre_render(id, &mut gfx).unwrap();
    graph.post_render(id, &mut gfx).unwrap();

    let effect = graph.get_mut(id).unwrap();
    assert_eq!(effect.max_color_attachments().unwrap(), 2);
    assert_eq!(effect.max_texture_bindings().unwrap(), 1);

    let pass = effect.add_pass(&mut gfx, &["two"]).unwrap();
    let pass = effect.pass_mut(pass).unwrap();
    let err = pass.attach_aux_buffer(&mut gfx, 2, false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    pass.enable_color_output().unwrap();
    pass.bind_color_buffer("a").unwrap();
    // The only texture unit is taken by the color buffer.
    let err = pass.bind_depth_buffer("b").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    frame(&mut graph, &mut gfx, id).unwrap();
    assert_eq!(gfx.state_depth(), 0);
}

#[test]
fn depth_output_ping_pongs_independently_of_color() {
    let mut gfx = graphics();
    gfx.register_kernel("halve_depth", &["depth"], |frag, out| {
        out.set_depth(frag.sample("depth")[0] * 0.5);
    });
    gfx.register_kernel("show_depth", &["depth"], |frag, out| {
        let d = frag.sample("depth")[0];
        out.set_color(0, [d, d, d, 1.0]);
    });
    let viewport = Viewport::sized(SIZE.0, SIZE.1);
    let mut graph = EffectGraph::new();
    let id = graph.insert(
        Effect::builder("depth")
            .float_buffers(true)
            .setup(|fx, gfx| {
                let halve = fx.add_pass(gfx, &["halve_depth"])?;
                fx.pass_mut(halve)?
                    .bind_depth_buffer("depth")?
                    .enable_depth_output();
                let show = fx.add_pass(gfx, &["show_depth"])?;
                fx.pass_mut(show)?
                    .bind_depth_buffer("depth")?
                    .enable_color_output()?;
                Ok(())
            })
            .build(&viewport),
    );

    frame(&mut graph, &mut gfx, id).unwrap();
    let effect = graph.get(id).unwrap();
    let passes = effect.passes();
    assert!(passes[0].writes_depth() && !passes[0].writes_color());
    assert!(passes[1].writes_color() && !passes[1].writes_depth());

    let mut halved = Vec::new();
    for _ in 0..SIZE.1 {
        for x in 0..SIZE.0 {
            let d = (0.25 + x as f32 * 0.1) * 0.5;
            halved.push([d, d, d, 1.0]);
        }
    }
    // Only the first pass swapped depth, so the result is its output.
    let depth = effect.final_depth_buffer().unwrap();
    assert_texels_eq(&gfx.read_texels(depth).unwrap(), &halved);
    let color = effect.final_color_buffer().unwrap();
    assert_ne!(color, depth);
    assert_texels_eq(&gfx.read_texels(color).unwrap(), &halved);

    // The next frame halves the freshly captured depth again, not the last result.
    frame(&mut graph, &mut gfx, id).unwrap();
    let depth = graph.get(id).unwrap().final_depth_buffer().unwrap();
    assert_texels_eq(&gfx.read_texels(depth).unwrap(), &halved);
}

#[test]
fn failed_setup_is_reported_on_every_frame() {
    let mut gfx = graphics();
    let viewport = Viewport::sized(SIZE.0, SIZE.1);
    let mut graph = EffectGraph::new();
    let id = graph.insert(
        Effect::builder("broken")
            .setup(|fx, gfx| {
                single_pass("invert")(&mut *fx, &mut *gfx)?;
                fx.add_pass(gfx, &["not registered"])?;
                Ok(())
            })
            .build(&viewport),
    );

    let err = graph.pre_render(id, &mut gfx).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceCreation);
    let err = graph.pre_render(id, &mut gfx).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UsageOrder);
    let err = graph.post_render(id, &mut gfx).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UsageOrder);

    let effect = graph.get(id).unwrap();
    assert_eq!(effect.state(), EffectState::Failed);
    assert!(effect.passes().is_empty());
    assert!(effect.final_color_buffer().is_err());
    assert_eq!(gfx.texture_count(), 0);
    assert_eq!(gfx.bound_framebuffer(), None);
    assert_eq!(gfx.draw_count(), 0);
}
