//! Viewport rectangle shared between the application and its effects.
//!
//! Effects never own window dimensions. They hold a [`Viewport`] handle that
//! the application updates when the window resizes, and compare it against
//! their allocated buffers at the start of every frame.

use std::cell::Cell;
use std::rc::Rc;

/// A pixel rectangle `(x, y, width, height)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ViewportRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl ViewportRect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// A rectangle anchored at the origin.
    pub fn sized(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Returns the aspect ratio (width / height), or 1.0 for an empty rectangle.
    pub fn aspect(&self) -> f32 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x
            && y >= self.y
            && (x - self.x) < self.width as i32
            && (y - self.y) < self.height as i32
    }
}

/// Shared, mutable viewport handle.
///
/// Cloning a `Viewport` yields another handle onto the same rectangle, so an
/// application can hand one to every effect and update them all with a single
/// [`Viewport::resize`] call from its window-event handler.
///
/// # Example
///
/// ```
/// use hoplite_fx::Viewport;
///
/// let viewport = Viewport::sized(800, 600);
/// let seen_by_effect = viewport.clone();
///
/// viewport.resize(1024, 768);
/// assert_eq!(seen_by_effect.size(), (1024, 768));
/// ```
#[derive(Clone, Debug, Default)]
pub struct Viewport(Rc<Cell<ViewportRect>>);

impl Viewport {
    pub fn new(rect: ViewportRect) -> Self {
        Self(Rc::new(Cell::new(rect)))
    }

    pub fn sized(width: u32, height: u32) -> Self {
        Self::new(ViewportRect::sized(width, height))
    }

    pub fn rect(&self) -> ViewportRect {
        self.0.get()
    }

    pub fn size(&self) -> (u32, u32) {
        self.0.get().size()
    }

    pub fn set(&self, rect: ViewportRect) {
        self.0.set(rect);
    }

    /// Changes the dimensions, keeping the origin.
    pub fn resize(&self, width: u32, height: u32) {
        let mut rect = self.0.get();
        rect.width = width;
        rect.height = height;
        self.0.set(rect);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_rectangle() {
        let a = Viewport::new(ViewportRect::new(10, 20, 64, 32));
        let b = a.clone();
        a.resize(128, 64);
        assert_eq!(b.rect(), ViewportRect::new(10, 20, 128, 64));
    }

    #[test]
    fn contains_respects_origin() {
        let rect = ViewportRect::new(4, 4, 2, 2);
        assert!(rect.contains(4, 4));
        assert!(rect.contains(5, 5));
        assert!(!rect.contains(6, 5));
        assert!(!rect.contains(3, 4));
    }

    #[test]
    fn empty_rect_has_unit_aspect() {
        assert_eq!(ViewportRect::sized(0, 0).aspect(), 1.0);
        assert_eq!(ViewportRect::sized(200, 100).aspect(), 2.0);
    }
}
