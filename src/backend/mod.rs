//! Implementations of [`Graphics`](crate::Graphics).

pub mod software;
pub mod wgpu;
mod wgsl;
