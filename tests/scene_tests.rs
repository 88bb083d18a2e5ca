//! Scene builder integration tests: TLAS contents, mesh-instance records
//! and the descriptor sets that expose them.

mod common;

use glam::{Mat4, Vec3, Vec4};

use common::{blas_entry, Registries, TestContext};
use rt_scene_core::backend::{
    DescriptorResources, INSTANCE_FORCE_OPAQUE, INSTANCE_TRIANGLE_FACING_CULL_DISABLE,
};
use rt_scene_core::scene::{to_transform_matrix, MaterialHandle, MeshHandle, Renderable};
use rt_scene_core::{FrameInfo, MeshInstanceData, SceneBuilderConfig, MAX_FRAMES_IN_FLIGHT};

fn decode_records(bytes: &[u8]) -> Vec<MeshInstanceData> {
    bytes
        .chunks_exact(MeshInstanceData::SIZE as usize)
        .map(bytemuck::pod_read_unaligned::<MeshInstanceData>)
        .collect()
}

// ============================================================================
// Empty scene
// ============================================================================

#[test]
fn test_empty_scene_builds_valid_descriptors() {
    let ctx = TestContext::new();
    let mut context = ctx.scene_context(&Registries::default());
    let scene: Vec<Renderable> = Vec::new();

    context.begin_frame(&FrameInfo::new(0, 0.016, &scene)).unwrap();

    assert_eq!(context.scene().instance_count(), 0);
    assert!(context.scene().mesh_instances().is_empty());

    let tlas = context.scene().tlas(0).unwrap();
    assert_eq!(ctx.dummy.built_instances(tlas.handle()), Some(Vec::new()));

    let buffer = context.scene().mesh_instance_buffer(0).unwrap();
    assert_eq!(buffer.buffer_size(), MeshInstanceData::SIZE);
    let padding = ctx.dummy.read_buffer(buffer.handle()).unwrap();
    assert!(padding.iter().all(|b| *b == 0));

    let tlas_set = ctx
        .dummy
        .descriptor_set_contents(context.scene().tlas_descriptor_set(0))
        .unwrap();
    assert_eq!(
        tlas_set[&0],
        DescriptorResources::AccelerationStructures(vec![tlas.handle()])
    );
    let records_set = ctx
        .dummy
        .descriptor_set_contents(context.scene().mesh_instance_descriptor_set(0))
        .unwrap();
    match &records_set[&0] {
        DescriptorResources::Buffers(infos) => {
            assert_eq!(infos[0].buffer, buffer.handle());
            assert_eq!(infos[0].range, MeshInstanceData::SIZE);
        }
        other => panic!("unexpected resources {:?}", other),
    }
}

// ============================================================================
// Populated scenes
// ============================================================================

#[test]
fn test_three_entities_in_iteration_order() {
    let ctx = TestContext::new();
    let registries = Registries::default()
        .with_mesh(1)
        .with_mesh(2)
        .with_mesh(3)
        .with_material(10, 0)
        .with_material(11, 1)
        .with_material(12, 2);
    let mut context = ctx.scene_context(&registries);

    let transforms = [
        Mat4::IDENTITY,
        Mat4::from_translation(Vec3::new(4.0, 0.0, -2.0)),
        Mat4::from_scale(Vec3::splat(10.0)),
    ];
    let scene = vec![
        Renderable::new(transforms[0], MeshHandle(1), MaterialHandle(10)),
        Renderable::new(transforms[1], MeshHandle(2), MaterialHandle(12)),
        Renderable::new(transforms[2], MeshHandle(3), MaterialHandle(11))
            .with_tiling(50.0)
            .with_tint(Vec4::new(0.2, 0.4, 0.6, 1.0)),
    ];

    context.begin_frame(&FrameInfo::new(0, 0.016, &scene)).unwrap();
    assert_eq!(context.scene().instance_count(), 3);

    let tlas = context.scene().tlas(0).unwrap();
    let instances = ctx.dummy.built_instances(tlas.handle()).unwrap();
    assert_eq!(instances.len(), 3);
    let meshes = [1, 2, 3];
    for (index, instance) in instances.iter().enumerate() {
        assert_eq!(instance.custom_index(), index as u32);
        assert_eq!(instance.mask(), 0xFF);
        assert_eq!(instance.flags(), INSTANCE_TRIANGLE_FACING_CULL_DISABLE);
        assert_eq!(instance.transform, to_transform_matrix(&transforms[index]));
        assert_eq!(
            instance.acceleration_structure_reference,
            blas_entry(meshes[index]).device_address
        );
    }

    let buffer = context.scene().mesh_instance_buffer(0).unwrap();
    assert_eq!(buffer.buffer_size(), 3 * 48);
    let records = decode_records(&ctx.dummy.read_buffer(buffer.handle()).unwrap());
    assert_eq!(records, context.scene().mesh_instances());
    assert_eq!(
        records.iter().map(|r| r.material_index).collect::<Vec<_>>(),
        vec![0, 2, 1]
    );
    assert_eq!(
        records.iter().map(|r| r.texture_tiling_factor).collect::<Vec<_>>(),
        vec![1.0, 1.0, 50.0]
    );
    assert_eq!(records[0].tint(), Vec4::ONE);
    assert_eq!(records[2].tint(), Vec4::new(0.2, 0.4, 0.6, 1.0));
    for (record, mesh) in records.iter().zip(meshes) {
        assert_eq!(record.vertex_buffer_address, blas_entry(mesh).vertex_buffer_address);
        assert_eq!(record.index_buffer_address, blas_entry(mesh).index_buffer_address);
    }
}

#[test]
fn test_instance_settings_from_config() {
    let ctx = TestContext::new();
    let registries = Registries::default().with_mesh(1).with_material(1, 0);
    let config = SceneBuilderConfig {
        instance_mask: 0x0F,
        instance_flags: INSTANCE_FORCE_OPAQUE,
        sbt_record_offset: 2,
    };
    let mut context = ctx.scene_context_with(&registries, config);

    let scene = vec![Renderable::new(Mat4::IDENTITY, MeshHandle(1), MaterialHandle(1))];
    context.begin_frame(&FrameInfo::new(0, 0.016, &scene)).unwrap();

    let tlas = context.scene().tlas(0).unwrap();
    let instances = ctx.dummy.built_instances(tlas.handle()).unwrap();
    assert_eq!(instances[0].mask(), 0x0F);
    assert_eq!(instances[0].flags(), INSTANCE_FORCE_OPAQUE);
    assert_eq!(instances[0].sbt_record_offset(), 2);
}

#[test]
fn test_many_entities() {
    let ctx = TestContext::new();
    let registries = Registries::default()
        .with_mesh(1)
        .with_mesh(2)
        .with_mesh(3)
        .with_material(1, 7);
    let mut context = ctx.scene_context(&registries);

    let scene: Vec<Renderable> = (0..100)
        .map(|i| {
            Renderable::new(
                Mat4::from_translation(Vec3::new(i as f32, 0.0, 0.0)),
                MeshHandle(1 + i % 3),
                MaterialHandle(1),
            )
        })
        .collect();

    context.begin_frame(&FrameInfo::new(5, 0.016, &scene)).unwrap();
    let slot = 5 % MAX_FRAMES_IN_FLIGHT;

    let instances = ctx
        .dummy
        .built_instances(context.scene().tlas(slot).unwrap().handle())
        .unwrap();
    assert_eq!(instances.len(), 100);
    for (index, instance) in instances.iter().enumerate() {
        assert_eq!(instance.custom_index(), index as u32);
        assert_eq!(instance.transform[3], index as f32);
        assert_eq!(
            instance.acceleration_structure_reference,
            blas_entry(1 + index as u64 % 3).device_address
        );
    }
    let buffer = context.scene().mesh_instance_buffer(slot).unwrap();
    assert_eq!(buffer.buffer_size(), 100 * MeshInstanceData::SIZE);
    assert!(context.scene().mesh_instances().iter().all(|r| r.material_index == 7));
}

// ============================================================================
// Frame slots
// ============================================================================

#[test]
fn test_slots_keep_their_own_generation() {
    let ctx = TestContext::new();
    let registries = Registries::default().with_mesh(1).with_material(1, 0);
    let mut context = ctx.scene_context(&registries);

    let one = vec![Renderable::new(Mat4::IDENTITY, MeshHandle(1), MaterialHandle(1))];
    let two = vec![one[0], one[0]];

    context.begin_frame(&FrameInfo::new(0, 0.016, &one)).unwrap();
    context.begin_frame(&FrameInfo::new(1, 0.016, &two)).unwrap();

    let slot0 = context.scene().tlas(0).unwrap().handle();
    let slot1 = context.scene().tlas(1).unwrap().handle();
    assert_ne!(slot0, slot1);
    assert_eq!(ctx.dummy.built_instances(slot0).unwrap().len(), 1);
    assert_eq!(ctx.dummy.built_instances(slot1).unwrap().len(), 2);

    // Rebuilding slot 0 leaves slot 1's set untouched.
    let before = ctx
        .dummy
        .descriptor_set_contents(context.scene().tlas_descriptor_set(1))
        .unwrap();
    context.begin_frame(&FrameInfo::new(2, 0.016, &two)).unwrap();
    assert_eq!(
        ctx.dummy
            .descriptor_set_contents(context.scene().tlas_descriptor_set(1))
            .unwrap(),
        before
    );
    assert_ne!(context.scene().tlas(0).unwrap().handle(), slot0);

    // The replaced slot 0 generation is released right away.
    assert_eq!(ctx.dummy.live_acceleration_structure_count(), MAX_FRAMES_IN_FLIGHT);
    assert_eq!(ctx.dummy.live_submission_count(), MAX_FRAMES_IN_FLIGHT * 2);
    assert_eq!(ctx.dummy.premature_destroy_count(), 0);
}

#[test]
fn test_rebuild_does_not_wait_for_gpu() {
    let ctx = TestContext::new();
    let registries = Registries::default().with_mesh(1).with_material(1, 0);
    let mut context = ctx.scene_context(&registries);
    let scene = vec![Renderable::new(Mat4::IDENTITY, MeshHandle(1), MaterialHandle(1))];

    context.begin_frame(&FrameInfo::new(0, 0.016, &scene)).unwrap();

    // Build and upload are still owned by the slot, with their buffers.
    assert_eq!(ctx.dummy.live_submission_count(), 2);
    assert!(context.scene().is_slot_ready(0));
    assert!(!context.scene().is_slot_ready(1));
    // TLAS storage, mesh instances, plus instances, scratch and staging
    assert_eq!(ctx.dummy.live_buffer_count(), 5);
}
