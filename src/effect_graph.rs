//! Ownership of effects and the recursive frame protocol.
//!
//! Effects reference the effects chained after them by [`EffectId`], so a
//! chain is a graph over the arena held by [`EffectGraph`]. Each frame the
//! application brackets its scene rendering with
//! [`pre_render`](EffectGraph::pre_render) and
//! [`post_render`](EffectGraph::post_render) on a root effect:
//!
//! 1. `pre_render` sets up the root and everything chained to it on first
//!    use, follows viewport size changes, then binds and clears the root's
//!    capture target.
//! 2. The scene is rendered into that target.
//! 3. `post_render` runs the root's passes, hands the result down the chain,
//!    draws the final color buffer to whatever was bound before step 1 and
//!    restores all graphics state.
//!
//! Every recursive walk marks the effects it is inside of; reaching a marked
//! effect again means the chain loops back on itself and the walk fails with
//! [`FxError::Cycle`].

use slotmap::SlotMap;

use crate::effect::{Effect, EffectId, EffectState};
use crate::error::{FxError, Result};
use crate::graphics::{FramebufferId, Graphics, TextureId};

/// Arena of effects addressed by [`EffectId`].
#[derive(Default)]
pub struct EffectGraph {
    effects: SlotMap<EffectId, Effect>,
}

impl EffectGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of `effect` and returns its id.
    pub fn insert(&mut self, effect: Effect) -> EffectId {
        self.effects.insert_with_key(|id| {
            let mut effect = effect;
            effect.set_id(id);
            effect
        })
    }

    /// The effect stored under `id`, if it is still alive.
    pub fn get(&self, id: EffectId) -> Option<&Effect> {
        self.effects.get(id)
    }

    /// Mutable access to the effect stored under `id`.
    pub fn get_mut(&mut self, id: EffectId) -> Option<&mut Effect> {
        self.effects.get_mut(id)
    }

    /// Whether `id` refers to a live effect.
    pub fn contains(&self, id: EffectId) -> bool {
        self.effects.contains_key(id)
    }

    /// Number of live effects.
    pub fn len(&self) -> usize {
        self.effects.len()
    }

    /// Whether the graph holds no effects.
    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    /// Ids of all live effects, in no particular order.
    pub fn ids(&self) -> impl Iterator<Item = EffectId> + '_ {
        self.effects.keys()
    }

    fn effect(&self, id: EffectId) -> Result<&Effect> {
        self.effects
            .get(id)
            .ok_or(FxError::UnknownHandle { kind: "effect" })
    }

    fn effect_mut(&mut self, id: EffectId) -> Result<&mut Effect> {
        self.effects
            .get_mut(id)
            .ok_or(FxError::UnknownHandle { kind: "effect" })
    }

    /// Chains `child` after `parent`. Loops are reported when a frame walks them.
    pub fn chain(&mut self, parent: EffectId, child: EffectId) -> Result<()> {
        self.effect(child)?;
        self.effect_mut(parent)?.chain(child);
        Ok(())
    }

    /// Releases every resource of `id` and removes it from all chains.
    pub fn destroy(&mut self, id: EffectId, gfx: &mut dyn Graphics) -> Result<()> {
        let effect = self
            .effects
            .remove(id)
            .ok_or(FxError::UnknownHandle { kind: "effect" })?;
        for other in self.effects.values_mut() {
            other.unchain(id);
        }
        effect.destroy(gfx);
        Ok(())
    }

    /// Runs `f` with `id` marked as executing, clearing the mark on every path.
    fn guarded<T>(
        &mut self,
        id: EffectId,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let effect = self.effect_mut(id)?;
        if effect.executing {
            return Err(FxError::Cycle(format!(
                "effect '{}' is chained to itself",
                effect.label()
            )));
        }
        effect.executing = true;
        let result = f(self);
        if let Some(effect) = self.effects.get_mut(id) {
            effect.executing = false;
        }
        result
    }

    // ------------------------------------------------------------------
    // Pre-render
    // ------------------------------------------------------------------

    /// Prepares `id` for a frame and redirects rendering into its capture target.
    pub fn pre_render(&mut self, id: EffectId, gfx: &mut dyn Graphics) -> Result<()> {
        self.guarded(id, |graph| {
            graph.prepare(id, gfx)?;
            graph.effect_mut(id)?.begin_capture(gfx)
        })
    }

    /// Setup, viewport tracking and recursive preparation of chained effects.
    /// Called with `id` already marked.
    fn prepare(&mut self, id: EffectId, gfx: &mut dyn Graphics) -> Result<()> {
        let effect = self.effect_mut(id)?;
        effect.ensure_setup(gfx)?;
        if let Some((width, height)) = effect.pending_resize() {
            self.resize_tree(id, gfx, width, height)?;
        }
        for child in self.effect(id)?.chained().to_vec() {
            self.guarded(child, |graph| graph.prepare(child, gfx))?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Resize
    // ------------------------------------------------------------------

    /// Resizes `id` and, recursively, every chained effect that is set up.
    pub fn resize(
        &mut self,
        id: EffectId,
        gfx: &mut dyn Graphics,
        width: u32,
        height: u32,
    ) -> Result<()> {
        self.guarded(id, |graph| graph.resize_tree(id, gfx, width, height))
    }

    fn resize_tree(
        &mut self,
        id: EffectId,
        gfx: &mut dyn Graphics,
        width: u32,
        height: u32,
    ) -> Result<()> {
        let effect = self.effect_mut(id)?;
        effect.resize_own(gfx, width, height)?;
        for child in effect.chained().to_vec() {
            if self.effect(child)?.state() != EffectState::Ready {
                continue;
            }
            self.guarded(child, |graph| graph.resize_tree(child, gfx, width, height))?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Post-render
    // ------------------------------------------------------------------

    /// Runs the effect chain over the captured scene and, if enabled, draws
    /// the result to the framebuffer that was bound before [`pre_render`].
    ///
    /// [`pre_render`]: EffectGraph::pre_render
    pub fn post_render(&mut self, id: EffectId, gfx: &mut dyn Graphics) -> Result<()> {
        let effect = self.effect_mut(id)?;
        let saved = effect.saved_framebuffer.take().ok_or_else(|| {
            FxError::usage(format!(
                "post_render called on effect '{}' without pre_render",
                effect.label()
            ))
        })?;
        gfx.bind_framebuffer(saved)?;

        gfx.push_state();
        let result = self
            .execute(id, gfx, None)
            .and_then(|(color, _)| self.present(id, gfx, saved, color));
        let popped = gfx.pop_state();
        let restored = gfx.bind_framebuffer(saved);
        result?;
        popped?;
        restored
    }

    /// Runs `id` and everything chained to it, returning the final buffers.
    fn execute(
        &mut self,
        id: EffectId,
        gfx: &mut dyn Graphics,
        input: Option<(TextureId, TextureId)>,
    ) -> Result<(TextureId, TextureId)> {
        self.guarded(id, |graph| {
            let effect = graph.effect_mut(id)?;
            effect.ensure_setup(gfx)?;
            let mut buffers = effect.run_passes(gfx, input)?;
            let chained = effect.chained().to_vec();
            if chained.is_empty() {
                return Ok(buffers);
            }
            for child in chained {
                buffers = graph.execute(child, gfx, Some(buffers))?;
            }
            graph.effect_mut(id)?.set_final_buffers(buffers);
            Ok(buffers)
        })
    }

    fn present(
        &self,
        id: EffectId,
        gfx: &mut dyn Graphics,
        saved: Option<FramebufferId>,
        color: TextureId,
    ) -> Result<()> {
        let effect = self.effect(id)?;
        if !effect.screen_output() {
            return Ok(());
        }
        log::trace!("Presenting effect '{}'", effect.label());
        gfx.bind_framebuffer(saved)?;
        gfx.use_program(None)?;
        gfx.bind_texture_unit(0, Some(color))?;
        gfx.set_viewport(effect.viewport().rect());
        gfx.draw_quad()
    }

    // ------------------------------------------------------------------
    // Per-frame
    // ------------------------------------------------------------------

    /// Calls the per-frame closure of every effect that executed since the
    /// last tick.
    pub fn tick(&mut self, dt: f32) -> Result<()> {
        for effect in self.effects.values_mut() {
            if !std::mem::take(&mut effect.run_per_frame) {
                continue;
            }
            let Some(mut per_frame) = effect.per_frame.take() else {
                continue;
            };
            let result = per_frame(effect, dt);
            effect.per_frame = Some(per_frame);
            result?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareGraphics;
    use crate::error::ErrorKind;
    use crate::viewport::Viewport;

    #[test]
    fn destroy_strips_chains_and_frees_resources() {
        let mut gfx = SoftwareGraphics::new(2, 2);
        let viewport = Viewport::sized(2, 2);
        let mut graph = EffectGraph::new();
        let parent = graph.insert(Effect::builder("parent").build(&viewport));
        let child = graph.insert(Effect::builder("child").build(&viewport));
        graph.chain(parent, child).unwrap();
        graph.chain(parent, child).unwrap();

        graph.pre_render(parent, &mut gfx).unwrap();
        graph.post_render(parent, &mut gfx).unwrap();
        let textures = gfx.texture_count();

        graph.destroy(child, &mut gfx).unwrap();
        assert!(graph.get(parent).unwrap().chained().is_empty());
        assert_eq!(gfx.texture_count(), textures - 4);
        assert!(!graph.contains(child));
        assert!(graph.destroy(child, &mut gfx).is_err());
    }

    #[test]
    fn chaining_an_unknown_effect_fails() {
        let viewport = Viewport::sized(2, 2);
        let mut graph = EffectGraph::new();
        let a = graph.insert(Effect::builder("a").build(&viewport));
        let b = graph.insert(Effect::builder("b").build(&viewport));
        let mut gfx = SoftwareGraphics::new(2, 2);
        graph.destroy(b, &mut gfx).unwrap();
        assert!(graph.chain(a, b).is_err());
    }

    #[test]
    fn post_render_requires_pre_render() {
        let mut gfx = SoftwareGraphics::new(2, 2);
        let mut graph = EffectGraph::new();
        let id = graph.insert(Effect::builder("fx").build(&Viewport::sized(2, 2)));
        let err = graph.post_render(id, &mut gfx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UsageOrder);

        graph.pre_render(id, &mut gfx).unwrap();
        let err = graph.pre_render(id, &mut gfx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UsageOrder);
        graph.post_render(id, &mut gfx).unwrap();
        assert_eq!(gfx.bound_framebuffer(), None);
    }

    #[test]
    fn resize_before_setup_is_a_usage_error() {
        let mut gfx = SoftwareGraphics::new(2, 2);
        let mut graph = EffectGraph::new();
        let id = graph.insert(Effect::builder("fx").build(&Viewport::sized(2, 2)));
        let err = graph.resize(id, &mut gfx, 4, 4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UsageOrder);
        assert!(!graph.get(id).unwrap().executing);
    }

    #[test]
    fn tick_restores_closure_after_error() {
        let mut gfx = SoftwareGraphics::new(2, 2);
        let mut graph = EffectGraph::new();
        let id = graph.insert(
            Effect::builder("fx")
                .screen_output(false)
                .per_frame(|_, _| Err(FxError::config("boom")))
                .build(&Viewport::sized(2, 2)),
        );
        graph.pre_render(id, &mut gfx).unwrap();
        graph.post_render(id, &mut gfx).unwrap();
        assert!(graph.tick(0.1).is_err());
        assert!(graph.get(id).unwrap().per_frame.is_some());
        // The flag was consumed even though the closure failed.
        assert!(graph.tick(0.1).is_ok());
    }
}
