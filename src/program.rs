//! Fragment programs and their uniform bindings.
//!
//! A [`FragmentProgram`] pairs a backend program handle with the values bound
//! to it. Values are validated when bound (so a bad vector size fails during
//! setup, not mid-frame) and uploaded lazily the next time the program is
//! applied for a draw. Texture bindings are assigned texture units in the
//! order their names were first bound.
//!
//! A uniform name the program does not declare is only a diagnostic: compilers
//! routinely strip unused uniforms, so the miss is logged once per bind and the
//! draw goes ahead.

use crate::error::{FxError, Result};
use crate::graphics::{Graphics, ProgramId, TextureId};

/// A validated uniform value in backend-neutral form.
///
/// Arrays are flattened: `components` values per element, `count()` elements.
/// Matrices are stored column-major regardless of how they were supplied.
#[derive(Clone, Debug, PartialEq)]
pub enum UniformValue {
    Int { components: u8, values: Vec<i32> },
    Float { components: u8, values: Vec<f32> },
    Matrix { rows: u8, cols: u8, values: Vec<f32> },
    /// Texture unit index for a sampler uniform.
    Sampler(u32),
}

fn check_vector_len(len: usize) -> Result<u8> {
    if (1..=4).contains(&len) {
        Ok(len as u8)
    } else {
        Err(FxError::config(format!(
            "vector dimension {} unsupported, expected 1 to 4",
            len
        )))
    }
}

fn flatten_vectors<T: Copy, V: AsRef<[T]>>(vectors: &[V]) -> Result<Option<(u8, Vec<T>)>> {
    let Some(first) = vectors.first() else {
        return Ok(None);
    };
    let components = check_vector_len(first.as_ref().len())?;
    let mut values = Vec::with_capacity(components as usize * vectors.len());
    for (i, vector) in vectors.iter().enumerate() {
        let vector = vector.as_ref();
        if vector.len() != components as usize {
            return Err(FxError::config(format!(
                "array element {} has {} components, expected {}",
                i,
                vector.len(),
                components
            )));
        }
        values.extend_from_slice(vector);
    }
    Ok(Some((components, values)))
}

impl UniformValue {
    pub fn float(value: f32) -> Self {
        UniformValue::Float {
            components: 1,
            values: vec![value],
        }
    }

    pub fn int(value: i32) -> Self {
        UniformValue::Int {
            components: 1,
            values: vec![value],
        }
    }

    /// A single `float`..`vec4`.
    pub fn float_vector(values: &[f32]) -> Result<Self> {
        let components = check_vector_len(values.len())?;
        Ok(UniformValue::Float {
            components,
            values: values.to_vec(),
        })
    }

    /// A single `int`..`ivec4`.
    pub fn int_vector(values: &[i32]) -> Result<Self> {
        let components = check_vector_len(values.len())?;
        Ok(UniformValue::Int {
            components,
            values: values.to_vec(),
        })
    }

    /// An array of float vectors sharing one dimension.
    ///
    /// Returns `Ok(None)` for an empty array, which binds nothing.
    pub fn float_vectors<V: AsRef<[f32]>>(vectors: &[V]) -> Result<Option<Self>> {
        Ok(flatten_vectors(vectors)?
            .map(|(components, values)| UniformValue::Float { components, values }))
    }

    /// An array of int vectors sharing one dimension.
    pub fn int_vectors<V: AsRef<[i32]>>(vectors: &[V]) -> Result<Option<Self>> {
        Ok(flatten_vectors(vectors)?
            .map(|(components, values)| UniformValue::Int { components, values }))
    }

    /// A `rows` x `cols` matrix.
    ///
    /// `values` are column-major unless `transpose` is set, in which case
    /// they are read row-major.
    pub fn matrix(rows: u32, cols: u32, values: &[f32], transpose: bool) -> Result<Self> {
        Self::matrices(rows, cols, &[values], transpose)?
            .ok_or_else(|| FxError::config("matrix binding without values"))
    }

    /// An array of equally sized matrices. Returns `Ok(None)` for an empty array.
    pub fn matrices<V: AsRef<[f32]>>(
        rows: u32,
        cols: u32,
        matrices: &[V],
        transpose: bool,
    ) -> Result<Option<Self>> {
        if !(2..=4).contains(&rows) || !(2..=4).contains(&cols) {
            return Err(FxError::config(format!(
                "matrix dimensions {}x{} unsupported, rows and columns must be 2 to 4",
                rows, cols
            )));
        }
        if matrices.is_empty() {
            return Ok(None);
        }
        let size = (rows * cols) as usize;
        let mut values = Vec::with_capacity(size * matrices.len());
        for (i, matrix) in matrices.iter().enumerate() {
            let matrix = matrix.as_ref();
            if matrix.len() != size {
                return Err(FxError::config(format!(
                    "matrix {} has {} entries, {}x{} needs {}",
                    i,
                    matrix.len(),
                    rows,
                    cols,
                    size
                )));
            }
            if transpose {
                for c in 0..cols as usize {
                    for r in 0..rows as usize {
                        values.push(matrix[r * cols as usize + c]);
                    }
                }
            } else {
                values.extend_from_slice(matrix);
            }
        }
        Ok(Some(UniformValue::Matrix {
            rows: rows as u8,
            cols: cols as u8,
            values,
        }))
    }

    /// Number of array elements.
    pub fn count(&self) -> usize {
        match self {
            UniformValue::Int { components, values } => values.len() / *components as usize,
            UniformValue::Float { components, values } => values.len() / *components as usize,
            UniformValue::Matrix { rows, cols, values } => {
                values.len() / (*rows as usize * *cols as usize)
            }
            UniformValue::Sampler(_) => 1,
        }
    }

    /// First float component, or `None` for non-float values.
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            UniformValue::Float { values, .. } | UniformValue::Matrix { values, .. } => {
                values.first().copied()
            }
            UniformValue::Int { values, .. } => values.first().map(|v| *v as f32),
            UniformValue::Sampler(_) => None,
        }
    }
}

impl From<f32> for UniformValue {
    fn from(value: f32) -> Self {
        UniformValue::float(value)
    }
}

impl From<i32> for UniformValue {
    fn from(value: i32) -> Self {
        UniformValue::int(value)
    }
}

macro_rules! float_vector_from {
    ($($ty:ty => $n:expr),*) => {
        $(impl From<$ty> for UniformValue {
            fn from(value: $ty) -> Self {
                UniformValue::Float { components: $n, values: value.to_array().to_vec() }
            }
        })*
    };
}

float_vector_from!(glam::Vec2 => 2, glam::Vec3 => 3, glam::Vec4 => 4);

macro_rules! matrix_from {
    ($($ty:ty => $n:expr),*) => {
        $(impl From<$ty> for UniformValue {
            fn from(value: $ty) -> Self {
                UniformValue::Matrix { rows: $n, cols: $n, values: value.to_cols_array().to_vec() }
            }
        })*
    };
}

matrix_from!(glam::Mat2 => 2, glam::Mat3 => 3, glam::Mat4 => 4);

#[derive(Debug)]
struct PendingUniform {
    name: String,
    value: UniformValue,
    dirty: bool,
}

/// A compiled fragment program plus everything bound to it.
#[derive(Debug)]
pub struct FragmentProgram {
    id: ProgramId,
    label: String,
    uniforms: Vec<PendingUniform>,
    // Index is the texture unit.
    textures: Vec<(String, Option<TextureId>)>,
    max_texture_bindings: u32,
}

impl FragmentProgram {
    /// Compiles and links `sources` into a new program.
    pub fn compile(gfx: &mut dyn Graphics, label: &str, sources: &[&str]) -> Result<Self> {
        if sources.is_empty() {
            return Err(FxError::creation(format!(
                "program '{}' has no sources",
                label
            )));
        }
        let id = gfx.create_program(label, sources)?;
        log::debug!("Compiled program '{}' from {} source(s)", label, sources.len());
        Ok(Self {
            id,
            label: label.to_owned(),
            uniforms: Vec::new(),
            textures: Vec::new(),
            max_texture_bindings: gfx.limits().max_texture_bindings,
        })
    }

    pub fn id(&self) -> ProgramId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Records a uniform value for upload on the next [`apply`](Self::apply).
    pub fn set_uniform(&mut self, name: &str, value: UniformValue) {
        match self.uniforms.iter_mut().find(|u| u.name == name) {
            Some(slot) => {
                slot.value = value;
                slot.dirty = true;
            }
            None => self.uniforms.push(PendingUniform {
                name: name.to_owned(),
                value,
                dirty: true,
            }),
        }
    }

    pub fn uniform(&self, name: &str) -> Option<&UniformValue> {
        self.uniforms
            .iter()
            .find(|u| u.name == name)
            .map(|u| &u.value)
    }

    /// Binds `texture` to the sampler `name`, replacing any earlier binding of
    /// that name. `None` keeps the unit reserved with nothing bound.
    pub fn set_texture(&mut self, name: &str, texture: Option<TextureId>) -> Result<u32> {
        if let Some(unit) = self.textures.iter().position(|(n, _)| n == name) {
            self.textures[unit].1 = texture;
            return Ok(unit as u32);
        }
        if self.textures.len() as u32 >= self.max_texture_bindings {
            return Err(FxError::config(format!(
                "program '{}' cannot bind texture '{}': all {} texture units in use",
                self.label, name, self.max_texture_bindings
            )));
        }
        let unit = self.textures.len() as u32;
        self.textures.push((name.to_owned(), texture));
        self.set_uniform(name, UniformValue::Sampler(unit));
        Ok(unit)
    }

    pub fn texture(&self, name: &str) -> Option<TextureId> {
        self.textures
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, t)| *t)
    }

    pub fn texture_binding_count(&self) -> usize {
        self.textures.len()
    }

    /// Makes this the active program, uploads changed uniforms and binds the
    /// texture units.
    pub fn apply(&mut self, gfx: &mut dyn Graphics) -> Result<()> {
        gfx.use_program(Some(self.id))?;
        for uniform in self.uniforms.iter_mut().filter(|u| u.dirty) {
            if !gfx.set_uniform(self.id, &uniform.name, &uniform.value)? {
                log::warn!(
                    "Program '{}' does not declare uniform '{}'",
                    self.label,
                    uniform.name
                );
            }
            uniform.dirty = false;
        }
        for (unit, (_, texture)) in self.textures.iter().enumerate() {
            gfx.bind_texture_unit(unit as u32, *texture)?;
        }
        Ok(())
    }

    pub fn destroy(self, gfx: &mut dyn Graphics) {
        gfx.destroy_program(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareGraphics;
    use crate::error::ErrorKind;
    use crate::graphics::Limits;

    #[test]
    fn vector_dimensions_are_checked() {
        assert!(UniformValue::float_vector(&[1.0, 2.0, 3.0, 4.0]).is_ok());
        let err = UniformValue::float_vector(&[0.0; 5]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(UniformValue::int_vector(&[]).is_err());
    }

    #[test]
    fn array_elements_must_share_a_dimension() {
        let ok = UniformValue::float_vectors(&[[1.0, 2.0], [3.0, 4.0]])
            .unwrap()
            .unwrap();
        assert_eq!(ok.count(), 2);

        let mixed: [&[f32]; 2] = [&[1.0, 2.0], &[3.0]];
        let err = UniformValue::float_vectors(&mixed).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let empty: [[i32; 2]; 0] = [];
        assert!(UniformValue::int_vectors(&empty).unwrap().is_none());
    }

    #[test]
    fn matrix_dimensions_and_counts() {
        assert!(UniformValue::matrix(2, 3, &[0.0; 6], false).is_ok());
        assert!(UniformValue::matrix(1, 3, &[0.0; 3], false).is_err());
        assert!(UniformValue::matrix(4, 5, &[0.0; 20], false).is_err());
        let err = UniformValue::matrix(3, 3, &[0.0; 8], false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn transposed_matrices_are_stored_column_major() {
        // Row-major 2x3: [1 2 3; 4 5 6]
        let value = UniformValue::matrix(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], true).unwrap();
        assert_eq!(
            value,
            UniformValue::Matrix {
                rows: 2,
                cols: 3,
                values: vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0],
            }
        );
    }

    #[test]
    fn glam_conversions() {
        let v: UniformValue = glam::Vec3::new(1.0, 2.0, 3.0).into();
        assert_eq!(v.count(), 1);
        let m: UniformValue = glam::Mat4::IDENTITY.into();
        assert!(matches!(m, UniformValue::Matrix { rows: 4, cols: 4, .. }));
    }

    #[test]
    fn texture_units_follow_first_binding_order() {
        let mut gfx = SoftwareGraphics::new(1, 1);
        gfx.register_kernel("noop", &["a", "b"], |_, _| {});
        let mut program = FragmentProgram::compile(&mut gfx, "noop", &["noop"]).unwrap();
        assert_eq!(program.set_texture("a", None).unwrap(), 0);
        assert_eq!(program.set_texture("b", None).unwrap(), 1);
        assert_eq!(program.set_texture("a", None).unwrap(), 0);
        assert_eq!(program.uniform("b"), Some(&UniformValue::Sampler(1)));
    }

    #[test]
    fn texture_units_are_limited() {
        let mut gfx = SoftwareGraphics::new(1, 1).with_limits(Limits {
            max_color_attachments: 2,
            max_texture_bindings: 1,
        });
        gfx.register_kernel("noop", &[], |_, _| {});
        let mut program = FragmentProgram::compile(&mut gfx, "noop", &["noop"]).unwrap();
        program.set_texture("a", None).unwrap();
        let err = program.set_texture("b", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn undeclared_uniforms_do_not_fail_apply() {
        let mut gfx = SoftwareGraphics::new(1, 1);
        gfx.register_kernel("tint", &["strength"], |_, _| {});
        let mut program = FragmentProgram::compile(&mut gfx, "tint", &["tint"]).unwrap();
        program.set_uniform("strength", UniformValue::float(0.5));
        program.set_uniform("optimized_away", UniformValue::float(1.0));
        program.apply(&mut gfx).unwrap();
        assert_eq!(gfx.active_program(), Some(program.id()));
    }

    #[test]
    fn empty_source_list_is_a_creation_error() {
        let mut gfx = SoftwareGraphics::new(1, 1);
        let err = FragmentProgram::compile(&mut gfx, "empty", &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceCreation);
    }
}
