//! Per-frame top-level acceleration structure builder
//!
//! Every call to [`RayTracingSceneManager::create_tlas`] rebuilds the TLAS
//! from scratch over the scene's renderables and uploads the matching
//! [`MeshInstanceData`] records. Each frame slot owns its own pair of
//! descriptor sets, so rewriting slot `f` never touches a set the GPU may
//! still be reading for the other slot.
//!
//! Builds and uploads are submitted without waiting. A generation keeps its
//! submissions, and with them the staging, instance and scratch buffers,
//! until its slot is rebuilt, by which time the caller has waited on that
//! slot's fence.

use std::sync::Arc;

use bytemuck::Zeroable;

use crate::backend::{
    AccelerationStructureInstance, BufferUsage, DescriptorSet, DescriptorType, GpuDevice,
    MemoryProperties, ShaderStages, INSTANCE_TRIANGLE_FACING_CULL_DISABLE, WHOLE_SIZE,
};
use crate::descriptors::{DescriptorSetLayout, DescriptorWriter, GrowableDescriptorAllocator};
use crate::error::{GraphicsError, GraphicsResult};
use crate::resources::{AccelerationStructure, Buffer, Submission};
use crate::scene::{
    to_transform_matrix, BlasRegistry, FrameInfo, MaterialRegistry, MeshInstanceData,
};
use crate::MAX_FRAMES_IN_FLIGHT;

/// Instances addressable through the 24-bit custom index.
pub const MAX_INSTANCE_COUNT: usize = 1 << 24;

/// Instance settings applied to every TLAS instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneBuilderConfig {
    /// Visibility mask tested against the ray's cull mask.
    pub instance_mask: u8,
    /// `INSTANCE_*` flags.
    pub instance_flags: u8,
    /// Hit group offset into the shader binding table.
    pub sbt_record_offset: u32,
}

impl Default for SceneBuilderConfig {
    fn default() -> Self {
        Self {
            instance_mask: 0xFF,
            instance_flags: INSTANCE_TRIANGLE_FACING_CULL_DISABLE,
            sbt_record_offset: 0,
        }
    }
}

/// GPU objects produced by one rebuild.
struct SceneGeneration {
    /// TLAS build and mesh-instance upload. Dropped first.
    submissions: [Submission; 2],
    tlas: AccelerationStructure,
    mesh_instances: Buffer,
}

/// Builds the TLAS and mesh-instance buffer each frame and keeps the
/// descriptor sets that expose them.
pub struct RayTracingSceneManager {
    device: Arc<dyn GpuDevice>,
    materials: Arc<dyn MaterialRegistry>,
    blas: Arc<dyn BlasRegistry>,
    config: SceneBuilderConfig,

    tlas_layout: Arc<DescriptorSetLayout>,
    mesh_instance_layout: Arc<DescriptorSetLayout>,
    tlas_sets: [DescriptorSet; MAX_FRAMES_IN_FLIGHT],
    mesh_instance_sets: [DescriptorSet; MAX_FRAMES_IN_FLIGHT],

    /// Generation the sets of each slot currently point at.
    current: [Option<SceneGeneration>; MAX_FRAMES_IN_FLIGHT],

    mesh_instances: Vec<MeshInstanceData>,
    instance_count: u32,
}

impl RayTracingSceneManager {
    /// Create the layouts and allocate one set of each per frame slot.
    ///
    /// The sets come from `allocator`'s persistent pools, so the allocator
    /// must outlive the manager.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        materials: Arc<dyn MaterialRegistry>,
        blas: Arc<dyn BlasRegistry>,
        allocator: &mut GrowableDescriptorAllocator,
        config: SceneBuilderConfig,
    ) -> GraphicsResult<Self> {
        let tlas_layout = DescriptorSetLayout::builder(Arc::clone(&device))
            .add_binding(
                0,
                DescriptorType::AccelerationStructure,
                ShaderStages::RAYGEN | ShaderStages::CLOSEST_HIT,
                1,
            )
            .build()?;
        let mesh_instance_layout = DescriptorSetLayout::builder(Arc::clone(&device))
            .add_binding(
                0,
                DescriptorType::StorageBuffer,
                ShaderStages::CLOSEST_HIT | ShaderStages::ANY_HIT,
                1,
            )
            .build()?;

        let mut tlas_sets = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        let mut mesh_instance_sets = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            tlas_sets.push(allocator.allocate(&tlas_layout)?);
            mesh_instance_sets.push(allocator.allocate(&mesh_instance_layout)?);
        }

        log::info!("Ray tracing scene manager created on {} device", device.name());

        Ok(Self {
            device,
            materials,
            blas,
            config,
            tlas_layout,
            mesh_instance_layout,
            tlas_sets: std::array::from_fn(|i| tlas_sets[i]),
            mesh_instance_sets: std::array::from_fn(|i| mesh_instance_sets[i]),
            current: std::array::from_fn(|_| None),
            mesh_instances: Vec::new(),
            instance_count: 0,
        })
    }

    /// Rebuild the TLAS and mesh-instance buffer for `frame` and point the
    /// frame slot's descriptor sets at them.
    ///
    /// The caller must have waited for the GPU work last submitted from the
    /// same frame slot; the slot's previous generation is dropped once the
    /// new one is in place. On error the slot's sets keep pointing at the
    /// previous generation.
    pub fn create_tlas(&mut self, frame: &FrameInfo) -> GraphicsResult<()> {
        let slot = frame.slot();
        let renderables = frame.scene.renderables();
        check_instance_count(renderables.len())?;
        let mut instances = Vec::with_capacity(renderables.len());
        let mut records = Vec::with_capacity(renderables.len());
        for (index, renderable) in renderables.iter().enumerate() {
            let entry = self
                .blas
                .get(renderable.mesh)
                .ok_or(GraphicsError::MissingBottomLevel(renderable.mesh))?;
            let material_index = self
                .materials
                .index_of(renderable.material)
                .ok_or(GraphicsError::UnknownMaterial(renderable.material))?;

            instances.push(AccelerationStructureInstance::new(
                to_transform_matrix(&renderable.transform),
                index as u32,
                self.config.instance_mask,
                self.config.sbt_record_offset,
                self.config.instance_flags,
                entry.device_address,
            ));
            records.push(MeshInstanceData::new(
                entry.vertex_buffer_address,
                entry.index_buffer_address,
                material_index,
                renderable.texture_tiling_factor,
                renderable.texture_tint_color,
            ));
        }
        let instance_count = instances.len() as u32;

        let generation = self.build_generation(&instances, &records)?;

        DescriptorWriter::new(&self.tlas_layout)
            .write_acceleration_structure(0, generation.tlas.handle())
            .overwrite(self.tlas_sets[slot]);
        let mesh_instances = &generation.mesh_instances;
        DescriptorWriter::new(&self.mesh_instance_layout)
            .write_buffer(0, mesh_instances.descriptor_info(mesh_instances.buffer_size(), 0))
            .overwrite(self.mesh_instance_sets[slot]);

        // The slot's fence has been waited on, so nothing reads the old generation.
        if self.current[slot].replace(generation).is_some() {
            log::trace!("Released previous scene generation of slot {}", slot);
        }
        self.mesh_instances = records;
        self.instance_count = instance_count;

        log::debug!(
            "Rebuilt TLAS for frame {} (slot {}, dt {:.4}s) with {} instances",
            frame.frame_index,
            slot,
            frame.frame_time,
            instance_count
        );
        Ok(())
    }

    /// Upload instances and records and build a new TLAS over them.
    ///
    /// An empty scene still gets one zeroed padding element in each buffer
    /// so descriptor ranges stay non-zero; the TLAS is built with a
    /// primitive count of 0.
    fn build_generation(
        &self,
        instances: &[AccelerationStructureInstance],
        records: &[MeshInstanceData],
    ) -> GraphicsResult<SceneGeneration> {
        let instance_count = instances.len() as u32;
        let element_count = instance_count.max(1);

        let mut instance_buffer = Buffer::with_label(
            Arc::clone(&self.device),
            "tlas-instances",
            AccelerationStructureInstance::SIZE,
            element_count,
            BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT | BufferUsage::SHADER_DEVICE_ADDRESS,
            MemoryProperties::STAGING,
            16,
        )?;
        if !instances.is_empty() {
            instance_buffer.map(WHOLE_SIZE, 0)?;
            instance_buffer.write_to_buffer(bytemuck::cast_slice(instances), WHOLE_SIZE, 0)?;
            instance_buffer.unmap();
        }

        let tlas = AccelerationStructure::top_level(&self.device, instance_count)?;
        let build = tlas.build(instance_buffer, instance_count)?;

        let padding = [MeshInstanceData::zeroed()];
        let record_bytes: &[u8] = if records.is_empty() {
            bytemuck::cast_slice(&padding)
        } else {
            bytemuck::cast_slice(records)
        };
        let (mesh_instances, upload) = Buffer::upload_device_local(
            &self.device,
            record_bytes,
            Buffer::get_alignment(MeshInstanceData::SIZE, MeshInstanceData::ALIGNMENT),
            element_count,
            BufferUsage::STORAGE,
        )?;

        Ok(SceneGeneration {
            submissions: [build, upload],
            tlas,
            mesh_instances,
        })
    }

    pub fn tlas_descriptor_set(&self, slot: usize) -> DescriptorSet {
        self.tlas_sets[slot % MAX_FRAMES_IN_FLIGHT]
    }

    pub fn tlas_descriptor_set_layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.tlas_layout
    }

    pub fn mesh_instance_descriptor_set(&self, slot: usize) -> DescriptorSet {
        self.mesh_instance_sets[slot % MAX_FRAMES_IN_FLIGHT]
    }

    pub fn mesh_instance_descriptor_set_layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.mesh_instance_layout
    }

    /// Records emitted by the last rebuild, in scene iteration order.
    pub fn mesh_instances(&self) -> &[MeshInstanceData] {
        &self.mesh_instances
    }

    /// Number of TLAS instances in the last rebuild.
    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    /// TLAS the sets of `slot` point at, if that slot was built.
    pub fn tlas(&self, slot: usize) -> Option<&AccelerationStructure> {
        self.current[slot % MAX_FRAMES_IN_FLIGHT]
            .as_ref()
            .map(|g| &g.tlas)
    }

    /// Mesh-instance storage buffer the sets of `slot` point at.
    pub fn mesh_instance_buffer(&self, slot: usize) -> Option<&Buffer> {
        self.current[slot % MAX_FRAMES_IN_FLIGHT]
            .as_ref()
            .map(|g| &g.mesh_instances)
    }

    /// True once the GPU has finished building and uploading the generation
    /// of `slot`. False if the slot was never built.
    pub fn is_slot_ready(&self, slot: usize) -> bool {
        self.current[slot % MAX_FRAMES_IN_FLIGHT]
            .as_ref()
            .is_some_and(|g| g.submissions.iter().all(Submission::is_complete))
    }
}

/// Reject scenes whose iteration positions overflow the 24-bit custom index.
fn check_instance_count(count: usize) -> GraphicsResult<()> {
    if count > MAX_INSTANCE_COUNT {
        return Err(GraphicsError::InvalidParameter(format!(
            "{} renderables exceed the {} instances a TLAS custom index can address",
            count, MAX_INSTANCE_COUNT
        )));
    }
    Ok(())
}
