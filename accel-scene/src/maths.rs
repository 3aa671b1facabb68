use bytemuck::{Pod, Zeroable};
pub use ultraviolet as uv;

pub type Vec3 = uv::Vec3;
pub type Vec4 = uv::Vec4;
pub type Mat4 = uv::Mat4;

/// The upper 3x4 part of an affine transform stored row-major, which is the
/// layout ray tracing hardware expects for per-instance and per-geometry
/// transforms.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Zeroable, Pod)]
pub struct TransposedTransform3(pub [[f32; 4]; 3]);

impl TransposedTransform3 {
    pub const IDENTITY: Self = Self([[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0]]);

    /// Drops the projective row of a column-major matrix.
    pub fn from_mat4(m: &Mat4) -> Self {
        let c = &m.cols;
        Self([
            [c[0].x, c[1].x, c[2].x, c[3].x],
            [c[0].y, c[1].y, c[2].y, c[3].y],
            [c[0].z, c[1].z, c[2].z, c[3].z],
        ])
    }

    pub fn translation(&self) -> Vec3 {
        Vec3::new(self.0[0][3], self.0[1][3], self.0[2][3])
    }
}

impl Default for TransposedTransform3 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl From<Mat4> for TransposedTransform3 {
    fn from(m: Mat4) -> Self {
        Self::from_mat4(&m)
    }
}

pub trait AlignUp {
    fn align_up(self, alignment: Self) -> Self;
}

impl AlignUp for u64 {
    fn align_up(self, alignment: Self) -> Self {
        debug_assert!(alignment.is_power_of_two());
        (self + alignment - 1) & !(alignment - 1)
    }
}
