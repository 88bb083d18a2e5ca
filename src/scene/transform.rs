//! Transform conversion for acceleration structure instances

use glam::Mat4;

/// Convert a column-major affine matrix to the row-major 3x4 layout of
/// `VkTransformMatrixKHR`. The projective bottom row is dropped.
pub fn to_transform_matrix(matrix: &Mat4) -> [f32; 12] {
    let mut out = [0.0; 12];
    for row in 0..3 {
        out[row * 4..row * 4 + 4].copy_from_slice(&matrix.row(row).to_array());
    }
    out
}
