//! Per-instance metadata read by hit shaders

use bytemuck::{Pod, Zeroable};
use glam::Vec4;
use static_assertions::const_assert_eq;

/// Shader-visible description of one TLAS instance.
///
/// Indexed by the instance's custom index. Matches the std430 layout
/// ```glsl
/// struct MeshInstance {
///     uint64_t vertexAddress;
///     uint64_t indexAddress;
///     uint materialIndex;
///     float textureTilingFactor;
///     vec4 textureTintColor;
/// };
/// ```
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MeshInstanceData {
    pub vertex_buffer_address: u64,
    pub index_buffer_address: u64,
    pub material_index: u32,
    pub texture_tiling_factor: f32,
    pub _padding: [u32; 2],
    pub texture_tint_color: [f32; 4],
}

const_assert_eq!(std::mem::size_of::<MeshInstanceData>(), 48);
const_assert_eq!(std::mem::offset_of!(MeshInstanceData, material_index), 16);
const_assert_eq!(std::mem::offset_of!(MeshInstanceData, texture_tiling_factor), 20);
const_assert_eq!(std::mem::offset_of!(MeshInstanceData, texture_tint_color), 32);

impl MeshInstanceData {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;
    /// Required element alignment inside the storage buffer.
    pub const ALIGNMENT: u64 = 16;

    pub fn new(
        vertex_buffer_address: u64,
        index_buffer_address: u64,
        material_index: u32,
        texture_tiling_factor: f32,
        texture_tint_color: Vec4,
    ) -> Self {
        Self {
            vertex_buffer_address,
            index_buffer_address,
            material_index,
            texture_tiling_factor,
            _padding: [0; 2],
            texture_tint_color: texture_tint_color.to_array(),
        }
    }

    pub fn tint(&self) -> Vec4 {
        Vec4::from_array(self.texture_tint_color)
    }
}
