//! Binding discovery and uniform packing for WGSL fragment programs.
//!
//! Programs declare every input as a `@group(0)` global:
//!
//! ```wgsl
//! @group(0) @binding(0) var<uniform> radius: f32;
//! @group(0) @binding(1) var<uniform> weights: array<vec4f, 4>;
//! @group(0) @binding(2) var scene: texture_2d<f32>;
//! @group(0) @binding(3) var scene_sampler: sampler;
//! @group(0) @binding(4) var depth: texture_depth_2d;
//! ```
//!
//! One uniform per global (no structs), so a uniform name maps to exactly one
//! buffer. A sampler named `<texture>_sampler` samples `<texture>` with that
//! texture's own wrap and filter settings.

use crate::error::{FxError, Result};
use crate::program::UniformValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Scalar {
    Float,
    Int,
    Uint,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UniformType {
    Vector { scalar: Scalar, len: u8 },
    Matrix { cols: u8, rows: u8 },
}

impl UniformType {
    fn size(self) -> u64 {
        match self {
            UniformType::Vector { len, .. } => 4 * len as u64,
            UniformType::Matrix { cols, rows } => cols as u64 * column_stride(rows),
        }
    }

    fn align(self) -> u64 {
        match self {
            UniformType::Vector { len: 1, .. } => 4,
            UniformType::Vector { len: 2, .. } => 8,
            UniformType::Vector { .. } => 16,
            UniformType::Matrix { rows, .. } => column_stride(rows),
        }
    }
}

fn column_stride(rows: u8) -> u64 {
    if rows == 2 { 8 } else { 16 }
}

fn round_up(value: u64, to: u64) -> u64 {
    value.div_ceil(to) * to
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct UniformDecl {
    pub name: String,
    pub binding: u32,
    pub ty: UniformType,
    pub array: Option<u32>,
}

impl UniformDecl {
    fn stride(&self) -> u64 {
        round_up(round_up(self.ty.size(), self.ty.align()), 16)
    }

    pub fn buffer_size(&self) -> u64 {
        match self.array {
            Some(n) => n as u64 * self.stride(),
            None => round_up(self.ty.size(), 16),
        }
    }

    /// Lays `value` out as this uniform's buffer contents.
    pub fn pack(&self, value: &UniformValue) -> Result<Vec<u8>> {
        let capacity = self.array.unwrap_or(1) as usize;
        if value.count() > capacity {
            return Err(FxError::config(format!(
                "uniform '{}' holds {} element(s), {} given",
                self.name,
                capacity,
                value.count()
            )));
        }

        let mut bytes = vec![0u8; self.buffer_size() as usize];
        let stride = self.stride() as usize;
        match (self.ty, value) {
            (
                UniformType::Vector {
                    scalar: Scalar::Float,
                    len,
                },
                UniformValue::Float { components, values },
            ) if len == *components => {
                for (i, element) in values.chunks(len as usize).enumerate() {
                    write(&mut bytes, i * stride, bytemuck::cast_slice(element));
                }
            }
            (
                UniformType::Vector {
                    scalar: Scalar::Int | Scalar::Uint,
                    len,
                },
                UniformValue::Int { components, values },
            ) if len == *components => {
                for (i, element) in values.chunks(len as usize).enumerate() {
                    write(&mut bytes, i * stride, bytemuck::cast_slice(element));
                }
            }
            (UniformType::Matrix { cols, rows }, UniformValue::Matrix { rows: r, cols: c, values })
                if (rows, cols) == (*r, *c) =>
            {
                let column = column_stride(rows) as usize;
                let per_matrix = rows as usize * cols as usize;
                for (i, matrix) in values.chunks(per_matrix).enumerate() {
                    for (col, entries) in matrix.chunks(rows as usize).enumerate() {
                        write(
                            &mut bytes,
                            i * stride + col * column,
                            bytemuck::cast_slice(entries),
                        );
                    }
                }
            }
            _ => {
                return Err(FxError::config(format!(
                    "value {:?} does not fit uniform '{}' of type {:?}",
                    value, self.name, self.ty
                )));
            }
        }
        Ok(bytes)
    }
}

fn write(bytes: &mut [u8], offset: usize, data: &[u8]) {
    bytes[offset..offset + data.len()].copy_from_slice(data);
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct TextureDecl {
    pub name: String,
    pub binding: u32,
    pub depth: bool,
    pub sampler: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct Reflection {
    pub uniforms: Vec<UniformDecl>,
    pub textures: Vec<TextureDecl>,
    /// `@location` indices the fragment stage writes.
    pub outputs: Vec<u32>,
}

impl Reflection {
    pub fn uniform_index(&self, name: &str) -> Option<usize> {
        self.uniforms.iter().position(|u| u.name == name)
    }

    pub fn texture_index(&self, name: &str) -> Option<usize> {
        self.textures.iter().position(|t| t.name == name)
    }
}

fn strip_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("//") {
            rest = after.find('\n').map_or("", |i| &after[i..]);
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.find("*/").map_or("", |i| &after[i + 2..]);
            out.push(' ');
        } else {
            let mut chars = rest.chars();
            if let Some(c) = chars.next() {
                out.push(c);
            }
            rest = chars.as_str();
        }
    }
    out
}

/// Value of the first `@name(N)` attribute in `text`.
fn attribute(text: &str, name: &str) -> Option<u32> {
    let start = text.find(name)? + name.len();
    let rest = text[start..].trim_start().strip_prefix('(')?;
    let end = rest.find(')')?;
    rest[..end].trim().trim_end_matches('u').parse().ok()
}

fn parse_scalar(text: &str) -> Option<Scalar> {
    match text {
        "f32" | "f" => Some(Scalar::Float),
        "i32" | "i" => Some(Scalar::Int),
        "u32" | "u" => Some(Scalar::Uint),
        _ => None,
    }
}

/// `vec3<f32>` / `vec3f` style: returns the dimension text and scalar.
fn split_generic<'a>(text: &'a str, prefix: &str) -> Option<(&'a str, Scalar)> {
    let rest = text.strip_prefix(prefix)?;
    if let Some(open) = rest.find('<') {
        let inner = rest[open + 1..].strip_suffix('>')?;
        Some((&rest[..open], parse_scalar(inner.trim())?))
    } else {
        let split = rest.len().checked_sub(1)?;
        Some((&rest[..split], parse_scalar(&rest[split..])?))
    }
}

fn parse_type(text: &str) -> Option<UniformType> {
    let text = text.trim();
    if let Some(scalar) = parse_scalar(text).filter(|_| text.len() == 3) {
        return Some(UniformType::Vector { scalar, len: 1 });
    }
    if let Some((dim, scalar)) = split_generic(text, "vec") {
        let len: u8 = dim.parse().ok()?;
        return (2..=4)
            .contains(&len)
            .then_some(UniformType::Vector { scalar, len });
    }
    if let Some((dim, Scalar::Float)) = split_generic(text, "mat") {
        let (cols, rows) = dim.split_once('x')?;
        let (cols, rows): (u8, u8) = (cols.parse().ok()?, rows.parse().ok()?);
        return ((2..=4).contains(&cols) && (2..=4).contains(&rows))
            .then_some(UniformType::Matrix { cols, rows });
    }
    None
}

/// Element type and length of `array<T, N>`.
fn parse_array(text: &str) -> Option<(UniformType, u32)> {
    let inner = text.trim().strip_prefix("array<")?.strip_suffix('>')?;
    let (ty, len) = inner.rsplit_once(',')?;
    let len = len.trim().trim_end_matches('u').parse().ok()?;
    Some((parse_type(ty)?, len))
}

/// Scans `source` for `@group(0)` declarations and fragment outputs.
pub(crate) fn reflect(source: &str) -> Result<Reflection> {
    let source = strip_comments(source);
    let mut reflection = Reflection::default();
    let mut samplers = Vec::new();

    for statement in source.split(';') {
        let Some(start) = statement.find("@group").or_else(|| statement.find("@binding")) else {
            continue;
        };
        let decl = &statement[start..];
        let (Some(binding), Some(var)) = (attribute(decl, "@binding"), decl.find("var")) else {
            continue;
        };
        if attribute(decl, "@group").unwrap_or(0) != 0 {
            return Err(FxError::creation(format!(
                "binding {} is outside @group(0)",
                binding
            )));
        }

        let mut rest = decl[var + 3..].trim_start();
        let mut space = "";
        if let Some(after) = rest.strip_prefix('<') {
            let close = after.find('>').unwrap_or(after.len());
            space = after[..close].trim();
            rest = after.get(close + 1..).unwrap_or("");
        }
        let Some((name, ty)) = rest.split_once(':') else {
            continue;
        };
        let (name, ty) = (name.trim().to_owned(), ty.trim());

        if space == "uniform" {
            let (ty, array) = match parse_array(ty) {
                Some((ty, len)) => (Some(ty), Some(len)),
                None => (parse_type(ty), None),
            };
            let ty = ty.ok_or_else(|| {
                FxError::creation(format!(
                    "uniform '{}' has unsupported type; use scalars, vectors, matrices or arrays of them",
                    name
                ))
            })?;
            reflection.uniforms.push(UniformDecl {
                name,
                binding,
                ty,
                array,
            });
        } else if ty.starts_with("texture_2d") {
            reflection.textures.push(TextureDecl {
                name,
                binding,
                depth: false,
                sampler: None,
            });
        } else if ty == "texture_depth_2d" {
            reflection.textures.push(TextureDecl {
                name,
                binding,
                depth: true,
                sampler: None,
            });
        } else if ty == "sampler" {
            samplers.push((name, binding));
        } else {
            return Err(FxError::creation(format!(
                "global '{}' of type '{}' is not supported",
                name, ty
            )));
        }
    }

    for (name, binding) in samplers {
        let texture = name
            .strip_suffix("_sampler")
            .and_then(|t| reflection.textures.iter_mut().find(|d| d.name == t))
            .ok_or_else(|| {
                FxError::creation(format!(
                    "sampler '{}' has no matching texture declaration",
                    name
                ))
            })?;
        texture.sampler = Some(binding);
    }

    let mut rest = source.as_str();
    while let Some(index) = rest.find("@location") {
        if let Some(location) = attribute(&rest[index..], "@location") {
            if !reflection.outputs.contains(&location) {
                reflection.outputs.push(location);
            }
        }
        rest = &rest[index + "@location".len()..];
    }
    Ok(reflection)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"
        // blur weights
        @group(0) @binding(0) var<uniform> radius: f32;
        @group(0) @binding(1) var<uniform> weights: array<vec4f, 3>;
        @group(0) @binding(2) var<uniform> tint: vec3<f32>;
        @group(0) @binding(3) var<uniform> transform: mat3x3f;
        @group(0) @binding(4) var<uniform> steps: vec2i;
        @group(0) @binding(5) var scene: texture_2d<f32>;
        @group(0) @binding(6) var scene_sampler: sampler;
        @group(0) @binding(7) var depth: texture_depth_2d;

        struct Out { @location(0) color: vec4f, @location(1) glow: vec4f }

        @fragment
        fn fs(in: QuadOutput) -> Out {
            var out: Out;
            let c = textureSample(scene, scene_sampler, in.uv);
            out.color = c;
            out.glow = c * radius;
            return out;
        }
    "#;

    #[test]
    fn finds_every_declaration() {
        let r = reflect(SOURCE).unwrap();
        assert_eq!(r.uniforms.len(), 5);
        let uniform = |name| &r.uniforms[r.uniform_index(name).unwrap()];
        assert_eq!(
            uniform("weights").ty,
            UniformType::Vector {
                scalar: Scalar::Float,
                len: 4
            }
        );
        assert_eq!(uniform("weights").array, Some(3));
        assert_eq!(
            uniform("transform").ty,
            UniformType::Matrix { cols: 3, rows: 3 }
        );
        assert_eq!(uniform("steps").binding, 4);

        let scene = &r.textures[r.texture_index("scene").unwrap()];
        assert_eq!((scene.binding, scene.sampler, scene.depth), (5, Some(6), false));
        let depth = &r.textures[r.texture_index("depth").unwrap()];
        assert!(depth.depth);
        assert_eq!(depth.sampler, None);
        assert_eq!(r.outputs, vec![0, 1]);
    }

    #[test]
    fn rejects_struct_uniforms_and_orphan_samplers() {
        let err = reflect("@group(0) @binding(0) var<uniform> u: Params;").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ResourceCreation);
        assert!(reflect("@group(0) @binding(0) var lonely_sampler: sampler;").is_err());
        assert!(reflect("@group(1) @binding(0) var<uniform> x: f32;").is_err());
    }

    #[test]
    fn array_elements_pad_to_sixteen_bytes() {
        let decl = UniformDecl {
            name: "offsets".into(),
            binding: 0,
            ty: UniformType::Vector {
                scalar: Scalar::Float,
                len: 2,
            },
            array: Some(2),
        };
        assert_eq!(decl.buffer_size(), 32);
        let value = UniformValue::float_vectors(&[[1.0, 2.0], [3.0, 4.0]])
            .unwrap()
            .unwrap();
        let bytes = decl.pack(&value).unwrap();
        let floats: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes);
        assert_eq!(floats, [1.0, 2.0, 0.0, 0.0, 3.0, 4.0, 0.0, 0.0]);
    }

    #[test]
    fn mat3_columns_pad_to_vec4() {
        let decl = UniformDecl {
            name: "m".into(),
            binding: 0,
            ty: UniformType::Matrix { cols: 3, rows: 3 },
            array: None,
        };
        assert_eq!(decl.buffer_size(), 48);
        let value = UniformValue::matrix(3, 3, &[1., 2., 3., 4., 5., 6., 7., 8., 9.], false).unwrap();
        let bytes = decl.pack(&value).unwrap();
        let floats: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes);
        assert_eq!(&floats[4..7], &[4.0, 5.0, 6.0]);
        assert_eq!(floats[7], 0.0);
    }

    #[test]
    fn mismatched_values_are_rejected() {
        let decl = UniformDecl {
            name: "tint".into(),
            binding: 0,
            ty: UniformType::Vector {
                scalar: Scalar::Float,
                len: 3,
            },
            array: None,
        };
        assert!(decl.pack(&UniformValue::float(1.0)).is_err());
        assert!(decl.pack(&UniformValue::int_vector(&[1, 2, 3]).unwrap()).is_err());
        let two = UniformValue::float_vectors(&[[0.0; 3], [0.0; 3]]).unwrap().unwrap();
        assert!(decl.pack(&two).is_err());
        assert_eq!(decl.buffer_size(), 16);
    }
}
