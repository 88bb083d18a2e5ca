//! Scene-side inputs of the ray-tracing builder
//!
//! The entity store, material registry and BLAS registry live outside this
//! crate. The builder reaches them through the small traits defined here.

mod mesh_instance;
mod raytracing;
mod transform;

use std::collections::HashMap;

use glam::{Mat4, Vec4};

use crate::backend::AccelerationStructureHandle;
use crate::MAX_FRAMES_IN_FLIGHT;

pub use mesh_instance::MeshInstanceData;
pub use raytracing::{RayTracingSceneManager, SceneBuilderConfig, MAX_INSTANCE_COUNT};
pub use transform::to_transform_matrix;

/// Identifies a mesh asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeshHandle(pub u64);

/// Identifies a material asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MaterialHandle(pub u64);

/// One renderable entity as seen by the builder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Renderable {
    /// Object-to-world transform.
    pub transform: Mat4,
    pub mesh: MeshHandle,
    pub material: MaterialHandle,
    pub texture_tiling_factor: f32,
    pub texture_tint_color: Vec4,
}

impl Renderable {
    pub fn new(transform: Mat4, mesh: MeshHandle, material: MaterialHandle) -> Self {
        Self {
            transform,
            mesh,
            material,
            texture_tiling_factor: 1.0,
            texture_tint_color: Vec4::ONE,
        }
    }

    pub fn with_tiling(mut self, texture_tiling_factor: f32) -> Self {
        self.texture_tiling_factor = texture_tiling_factor;
        self
    }

    pub fn with_tint(mut self, texture_tint_color: Vec4) -> Self {
        self.texture_tint_color = texture_tint_color;
        self
    }
}

/// Source of renderable entities, iterated once per frame.
pub trait RenderScene {
    fn renderables(&self) -> Vec<Renderable>;
}

impl RenderScene for [Renderable] {
    fn renderables(&self) -> Vec<Renderable> {
        self.to_vec()
    }
}

impl RenderScene for Vec<Renderable> {
    fn renderables(&self) -> Vec<Renderable> {
        self.clone()
    }
}

/// Maps materials to the stable indices shaders use.
pub trait MaterialRegistry {
    fn index_of(&self, material: MaterialHandle) -> Option<u32>;
}

impl MaterialRegistry for HashMap<MaterialHandle, u32> {
    fn index_of(&self, material: MaterialHandle) -> Option<u32> {
        self.get(&material).copied()
    }
}

/// A bottom-level acceleration structure built for one mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BottomLevelEntry {
    pub handle: AccelerationStructureHandle,
    /// Device address referenced by TLAS instances.
    pub device_address: u64,
    pub vertex_buffer_address: u64,
    pub index_buffer_address: u64,
}

/// Maps meshes to their prebuilt bottom-level structures.
pub trait BlasRegistry {
    fn get(&self, mesh: MeshHandle) -> Option<BottomLevelEntry>;
}

impl BlasRegistry for HashMap<MeshHandle, BottomLevelEntry> {
    fn get(&self, mesh: MeshHandle) -> Option<BottomLevelEntry> {
        HashMap::get(self, &mesh).copied()
    }
}

/// Per-frame input of the builder.
#[derive(Clone, Copy)]
pub struct FrameInfo<'a> {
    /// Monotonic frame counter.
    pub frame_index: u64,
    /// Seconds since the previous frame.
    pub frame_time: f32,
    pub scene: &'a dyn RenderScene,
}

impl<'a> FrameInfo<'a> {
    pub fn new(frame_index: u64, frame_time: f32, scene: &'a dyn RenderScene) -> Self {
        Self {
            frame_index,
            frame_time,
            scene,
        }
    }

    /// Frame-in-flight slot this frame uses.
    pub fn slot(&self) -> usize {
        (self.frame_index % MAX_FRAMES_IN_FLIGHT as u64) as usize
    }
}

impl std::fmt::Debug for FrameInfo<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameInfo")
            .field("frame_index", &self.frame_index)
            .field("frame_time", &self.frame_time)
            .finish()
    }
}
