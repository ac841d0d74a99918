//! Orchestration scenarios run against the mock device.

use crate::harness::{compute_shader, fragment_shader, vertex_shader, MockImages, TestRig};
use crate::mock::{add_kernel, Command, Kernel, KernelContext, ObjectKind};
use ash::vk;
use crossbeam::channel;
use std::sync::Arc;
use std::time::Duration;
use strata_gpu::{
    BufferAllocator, BufferBinding, BufferKind, ComputePipeline, DescriptorBinding, DrawParams,
    GpuError, GraphicsPipeline, ImageSlot, MemoryBarrier, MemoryKind, PipelineStateKey, RenderTarget,
    ShaderStages, SlotState, Workload,
};

const WAIT: Duration = Duration::from_secs(5);

fn noop() -> Kernel {
    Arc::new(|_: &mut KernelContext<'_>| {})
}

fn storage(index: u32, bytes: u64) -> DescriptorBinding {
    DescriptorBinding::storage(index, ShaderStages::COMPUTE, bytes)
}

fn read_u32s(buffer: &BufferAllocator, offset: u64, count: usize) -> anyhow::Result<Vec<u32>> {
    let bytes = buffer.read(offset, count * 4)?;
    Ok(bytes
        .chunks_exact(4)
        .map(bytemuck::pod_read_unaligned::<u32>)
        .collect())
}

fn bound_sets(commands: &[Command]) -> Vec<vk::DescriptorSet> {
    commands
        .iter()
        .filter_map(|command| match command {
            Command::BindDescriptorSet { set, .. } => Some(*set),
            _ => None,
        })
        .collect()
}

fn count(commands: &[Command], predicate: impl Fn(&Command) -> bool) -> usize {
    commands.iter().filter(|command| predicate(command)).count()
}

fn with_images<'a>(
    pipeline: &'a ComputePipeline,
    buffer: &'a BufferAllocator,
    offset: u64,
    images: &'a MockImages,
) -> Workload<'a> {
    Workload::dispatch(pipeline, [1, 1, 1])
        .with_buffer(buffer, &[offset])
        .with_images(images)
}

#[test]
fn append_offsets_accumulate() -> anyhow::Result<()> {
    let rig = TestRig::auto();
    let mut buffer = rig.buffer("linear", MemoryKind::HostVisible, 64)?;

    let chunks: [&[u8]; 4] = [&[1; 3], &[2; 5], &[3; 8], &[4; 16]];
    let mut expected = Vec::new();
    for chunk in chunks {
        let offset = buffer.append(chunk)?;
        assert_eq!(offset, expected.len() as u64);
        assert_eq!(buffer.last_write_offset(), offset);
        expected.extend_from_slice(chunk);
    }

    assert_eq!(buffer.used_bytes(), 32);
    assert_eq!(buffer.read(0, 32)?, expected);

    // An empty append still counts as the most recent one.
    assert_eq!(buffer.append(&[])?, 32);
    assert_eq!(buffer.last_write_offset(), 32);
    assert_eq!(buffer.used_bytes(), 32);

    buffer.truncate(8);
    assert_eq!(buffer.used_bytes(), 8);
    assert_eq!(buffer.last_write_offset(), 8);
    assert_eq!(buffer.append(&[5; 2])?, 8);
    assert_eq!(buffer.read(0, 10)?, [1, 1, 1, 2, 2, 2, 2, 2, 5, 5]);

    buffer.reset();
    assert_eq!(buffer.used_bytes(), 0);
    assert_eq!(buffer.append(&[9])?, 0);
    Ok(())
}

#[test]
fn ensure_then_append_never_fails_from_zero_capacity() -> anyhow::Result<()> {
    let rig = TestRig::auto();
    let mut buffer = rig.buffer("lazy", MemoryKind::HostVisible, 0)?;
    assert_eq!(buffer.capacity(), 0);
    assert!(buffer.raw().is_none());

    let mut used = 0u64;
    for size in (0..64usize).chain([1000, 4096, 65_537]) {
        let data = vec![(size % 251) as u8; size];
        buffer.ensure_capacity(size as u64)?;
        assert_eq!(buffer.append(&data)?, used);
        used += size as u64;
        assert!(buffer.capacity() >= used);
    }
    assert_eq!(buffer.used_bytes(), used);
    assert_eq!(buffer.read(used - 3, 3)?, vec![(65_537 % 251) as u8; 3]);
    Ok(())
}

#[test]
fn growth_from_16_bytes_preserves_written_prefix() -> anyhow::Result<()> {
    let rig = TestRig::auto();
    let mut buffer = rig.buffer("small", MemoryKind::HostVisible, 16)?;
    let prefix: Vec<u8> = (1..=12).collect();
    buffer.append(&prefix)?;
    let original = buffer.id();

    let tail = [0xAB; 8];
    assert!(matches!(
        buffer.append(&tail),
        Err(GpuError::CapacityExceeded {
            requested: 8,
            available: 4
        })
    ));

    buffer.ensure_capacity(8)?;
    assert_eq!(buffer.capacity(), 48);
    assert_eq!(buffer.append(&tail)?, 12);

    // Mappable buffers carry their contents across growth.
    assert_eq!(buffer.read(0, 12)?, prefix);
    assert_eq!(buffer.read(12, 8)?, tail);
    assert_ne!(buffer.id(), original);

    // The old allocation waits for the retirement queue.
    assert_eq!(rig.ctx.retirement().lock().pending_count(), 1);
    assert_eq!(rig.device.live(ObjectKind::Buffer), 2);
    Ok(())
}

#[test]
fn device_local_buffers_grow_but_reject_host_writes() -> anyhow::Result<()> {
    let rig = TestRig::auto();
    let mut buffer = rig.buffer("gpu-only", MemoryKind::DeviceLocal, 0)?;

    buffer.ensure_capacity(32)?;
    assert_eq!(buffer.capacity(), 64);
    assert!(buffer.pointer().is_none());
    assert!(matches!(
        buffer.append(&[1, 2, 3, 4]),
        Err(GpuError::InvalidState(_))
    ));
    assert!(buffer.read(0, 4).is_err());
    Ok(())
}

#[test]
fn identical_binds_reuse_the_descriptor_set() -> anyhow::Result<()> {
    let rig = TestRig::auto();
    let pipeline = rig.compute(
        "sample",
        1,
        noop(),
        [
            storage(0, 16),
            DescriptorBinding::sampled_image(1, ShaderStages::COMPUTE, ImageSlot(0)),
        ],
    )?;
    let first = rig.buffer("first", MemoryKind::HostVisible, 1024)?;
    let second = rig.buffer("second", MemoryKind::HostVisible, 1024)?;
    let images = MockImages::new();
    images.assign(ImageSlot(0));

    let mut scheduler = rig.scheduler()?;
    let mut frame = scheduler.begin_frame()?;
    let slot = frame.slot();
    let writes = || pipeline.pool_stats(slot).map_or(0, |stats| stats.writes);

    frame.record(&with_images(&pipeline, &first, 0, &images))?;
    assert_eq!(writes(), 1);

    frame.record(&with_images(&pipeline, &first, 0, &images))?;
    assert_eq!(writes(), 1);

    // Dynamic offsets travel with the bind, not the set.
    frame.record(&with_images(&pipeline, &first, 256, &images))?;
    assert_eq!(writes(), 1);

    images.replace_view(ImageSlot(0));
    frame.record(&with_images(&pipeline, &first, 0, &images))?;
    assert_eq!(writes(), 2);

    images.replace_sampler(ImageSlot(0));
    frame.record(&with_images(&pipeline, &first, 0, &images))?;
    assert_eq!(writes(), 3);

    frame.record(&with_images(&pipeline, &second, 0, &images))?;
    assert_eq!(writes(), 4);

    frame.submit()?;

    assert_eq!(rig.device.descriptor_writes(), 4);
    assert_eq!(images.read_only_requests(ImageSlot(0)), 6);
    assert_eq!(pipeline.pool_stats(slot).map(|stats| stats.pool_size), Some(4));

    let commands = rig.device.stats().submitted.pop().unwrap_or_default();
    let offsets: Vec<Vec<u32>> = commands
        .iter()
        .filter_map(|command| match command {
            Command::BindDescriptorSet {
                dynamic_offsets, ..
            } => Some(dynamic_offsets.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(offsets, vec![vec![0], vec![0], vec![256], vec![0], vec![0], vec![0]]);

    rig.check()?;
    pipeline.teardown();
    Ok(())
}

#[test]
fn static_offsets_are_part_of_the_set() -> anyhow::Result<()> {
    let rig = TestRig::auto();
    let binding = DescriptorBinding::Buffer(BufferBinding {
        index: 0,
        stages: ShaderStages::COMPUTE,
        byte_size: 16,
        dynamic_offset: false,
        kind: BufferKind::Uniform,
    });
    let pipeline = rig.compute("uniforms", 2, noop(), [binding])?;
    let buffer = rig.buffer("constants", MemoryKind::HostVisible, 1024)?;

    let mut scheduler = rig.scheduler()?;
    let mut frame = scheduler.begin_frame()?;
    let slot = frame.slot();
    for offset in [0, 0, 256] {
        frame.record(&Workload::dispatch(&pipeline, [1, 1, 1]).with_buffer(&buffer, &[offset]))?;
    }
    frame.submit()?;

    assert_eq!(pipeline.pool_stats(slot).map(|stats| stats.writes), Some(2));
    let commands = rig.device.stats().submitted.pop().unwrap_or_default();
    let sets = bound_sets(&commands);
    assert_eq!(sets.len(), 3);
    assert_eq!(sets[0], sets[1]);
    assert_ne!(sets[1], sets[2]);
    assert!(commands.iter().all(|command| match command {
        Command::BindDescriptorSet {
            dynamic_offsets, ..
        } => dynamic_offsets.is_empty(),
        _ => true,
    }));

    rig.check()?;
    pipeline.teardown();
    Ok(())
}

#[test]
fn grown_pool_outlives_the_frame_that_used_it() -> anyhow::Result<()> {
    let rig = TestRig::manual(1);
    let pipeline = rig.compute("grow", 3, noop(), [storage(0, 16)])?;
    let a = rig.buffer("a", MemoryKind::HostVisible, 256)?;
    let b = rig.buffer("b", MemoryKind::HostVisible, 256)?;
    let mut scheduler = rig.scheduler()?;
    let pools = rig.device.live(ObjectKind::DescriptorPool);

    let mut frame = scheduler.begin_frame()?;
    frame.record(&Workload::dispatch(&pipeline, [1, 1, 1]).with_buffer(&a, &[0]))?;
    frame.record(&Workload::dispatch(&pipeline, [1, 1, 1]).with_buffer(&b, &[0]))?;
    let submission = frame.submit()?;

    assert_eq!(pipeline.pool_stats(0).map(|stats| stats.pool_size), Some(2));
    assert_eq!(rig.device.live(ObjectKind::DescriptorPool), pools + 1);

    let commands = rig.device.stats().submitted.pop().unwrap_or_default();
    let sets = bound_sets(&commands);
    assert_eq!(sets.len(), 2);
    let retired_set = sets[0];
    assert!(rig.device.is_live(retired_set));

    // Executing the submission touches the set from the replaced pool.
    rig.device.signal_fence(submission.fence());
    rig.check()?;
    assert!(rig.device.is_live(retired_set));

    drop(scheduler.begin_frame()?);
    assert!(!rig.device.is_live(retired_set));
    assert_eq!(rig.device.live(ObjectKind::DescriptorPool), pools);

    rig.check()?;
    pipeline.teardown();
    Ok(())
}

#[test]
fn dispatch_beyond_frames_in_flight_blocks_on_oldest_fence() -> anyhow::Result<()> {
    let rig = TestRig::manual(2);
    let pipeline = rig.compute("tick", 4, noop(), [])?;
    let mut scheduler = rig.scheduler()?;
    let (tx, rx) = channel::unbounded();

    let (first, second, blocked, in_flight, third, worker) = std::thread::scope(|s| {
        let scheduler = &mut scheduler;
        let pipeline = &pipeline;
        let worker = s.spawn(move || -> anyhow::Result<()> {
            let workload = Workload::dispatch(pipeline, [1, 1, 1]);
            for _ in 0..3 {
                tx.send(scheduler.dispatch(&workload)?)?;
            }
            Ok(())
        });

        let first = rx.recv_timeout(WAIT);
        let second = rx.recv_timeout(WAIT);
        let blocked = rx.recv_timeout(Duration::from_millis(100)).is_err();
        let in_flight = rig.device.pending_fences().len();
        if let Ok(first) = &first {
            rig.device.signal_fence(first.fence());
        }
        let third = rx.recv_timeout(WAIT);
        rig.device.signal_all();
        (first, second, blocked, in_flight, third, worker.join())
    });

    let (first, second, third) = (first?, second?, third?);
    assert!(matches!(worker, Ok(Ok(()))));
    assert!(blocked, "third dispatch returned before any fence signaled");
    assert_eq!(in_flight, 2);
    assert_eq!(
        [first.slot(), second.slot(), third.slot()],
        [0, 1, 0]
    );
    assert_eq!(
        [first.generation(), second.generation(), third.generation()],
        [1, 2, 3]
    );
    assert_eq!(third.fence(), first.fence());

    pipeline.teardown();
    Ok(())
}

#[test]
fn compute_kernel_adds_42_to_34() -> anyhow::Result<()> {
    let rig = TestRig::manual(1);
    let pipeline = rig.compute("add", 42, add_kernel(42), [storage(0, 4)])?;
    let mut values = rig.buffer("values", MemoryKind::HostVisible, 4)?;
    values.append_pod(&[34u32])?;

    let mut scheduler = rig.scheduler()?;
    let submission =
        scheduler.dispatch(&Workload::dispatch(&pipeline, [1, 1, 1]).with_buffer(&values, &[0]))?;
    assert!(!scheduler.is_complete(&submission)?);
    assert_eq!(read_u32s(&values, 0, 1)?, [34]);

    rig.device.signal_fence(submission.fence());
    scheduler.wait_for(&submission)?;
    assert!(scheduler.is_complete(&submission)?);
    assert_eq!(read_u32s(&values, 0, 1)?, [76]);

    rig.check()?;
    pipeline.teardown();
    Ok(())
}

#[test]
fn staged_blocks_land_at_aligned_offsets() -> anyhow::Result<()> {
    let rig = TestRig::auto();
    let pipeline = rig.compute("staged", 10, add_kernel(10), [storage(0, 16)])?;
    let input = [1u32, 2, 3, 4];
    let workload = Workload::dispatch(&pipeline, [1, 1, 1]).with_data(bytemuck::cast_slice(&input));

    let mut scheduler = rig.scheduler()?;
    let mut frame = scheduler.begin_frame()?;
    let slot = frame.slot();
    assert_eq!(frame.record(&workload)?, [0]);
    assert_eq!(frame.record(&workload)?, [256]);
    let submission = frame.submit()?;
    assert_eq!(submission.staged_offsets(), [0, 256]);

    scheduler.wait_for(&submission)?;
    let staging = scheduler
        .staging(slot)
        .ok_or_else(|| anyhow::anyhow!("slot {slot} has no staging buffer"))?;
    assert_eq!(read_u32s(staging, 0, 4)?, [11, 12, 13, 14]);
    assert_eq!(read_u32s(staging, 256, 4)?, [11, 12, 13, 14]);

    // One bind of the pipeline and one descriptor write for both dispatches.
    let commands = rig.device.stats().submitted.pop().unwrap_or_default();
    assert_eq!(count(&commands, |c| matches!(c, Command::BindPipeline { .. })), 1);
    assert_eq!(count(&commands, |c| matches!(c, Command::Dispatch(_))), 2);
    assert_eq!(rig.device.descriptor_writes(), 1);

    // A new frame starts with nothing bound.
    scheduler.dispatch(&workload)?;
    let commands = rig.device.stats().submitted.pop().unwrap_or_default();
    assert_eq!(count(&commands, |c| matches!(c, Command::BindPipeline { .. })), 1);

    rig.check()?;
    drop(workload);
    pipeline.teardown();
    Ok(())
}

#[test]
fn staged_data_must_fit_its_binding() -> anyhow::Result<()> {
    let rig = TestRig::auto();
    let pipeline = rig.compute("bounded", 11, noop(), [storage(0, 16)])?;
    let mut scheduler = rig.scheduler()?;

    let oversized = [0u8; 32];
    let result = scheduler.dispatch(&Workload::dispatch(&pipeline, [1, 1, 1]).with_data(&oversized));
    assert!(matches!(
        result,
        Err(GpuError::CapacityExceeded {
            requested: 32,
            available: 16
        })
    ));

    let block = [0u8; 4];
    let result = scheduler.dispatch(
        &Workload::dispatch(&pipeline, [1, 1, 1])
            .with_data(&block)
            .with_data(&block),
    );
    assert!(matches!(result, Err(GpuError::InvalidState(_))));
    assert_eq!(scheduler.slot_state(0), Some(SlotState::Idle));

    // Missing blocks still reserve space for the binding.
    let submission = scheduler.dispatch(&Workload::dispatch(&pipeline, [1, 1, 1]))?;
    assert_eq!(submission.staged_offsets(), [0]);

    pipeline.teardown();
    Ok(())
}

#[test]
fn missing_image_fails_the_bind() -> anyhow::Result<()> {
    let rig = TestRig::auto();
    let pipeline = rig.compute(
        "textured",
        12,
        noop(),
        [DescriptorBinding::storage_image(0, ShaderStages::COMPUTE, ImageSlot(3))],
    )?;
    let images = MockImages::new();
    let mut scheduler = rig.scheduler()?;

    let result = scheduler.dispatch(&Workload::dispatch(&pipeline, [1, 1, 1]).with_images(&images));
    assert!(matches!(result, Err(GpuError::ResourceNotFound(_))));

    images.assign(ImageSlot(3));
    scheduler.dispatch(&Workload::dispatch(&pipeline, [1, 1, 1]).with_images(&images))?;
    // Storage images stay in their current layout.
    assert_eq!(images.read_only_requests(ImageSlot(3)), 0);

    pipeline.teardown();
    Ok(())
}

#[test]
fn graphics_variants_are_cached_per_state_key() -> anyhow::Result<()> {
    let rig = TestRig::auto();
    let pipeline = GraphicsPipeline::builder("mesh")
        .vertex_shader(vertex_shader())
        .fragment_shader(fragment_shader())
        .build(&rig.ctx)?;
    assert_eq!(pipeline.variant_count(), 0);

    let opaque = PipelineStateKey::default();
    let handle = pipeline.handle(&opaque)?;
    assert_eq!(pipeline.handle(&opaque)?, handle);
    assert_eq!(pipeline.variant_count(), 1);

    let wireframe = opaque
        .with_polygon_mode(vk::PolygonMode::LINE)?
        .with_cull_mode(vk::CullModeFlags::NONE)?;
    let wire_handle = pipeline.handle(&wireframe)?;
    assert_ne!(wire_handle, handle);
    assert_eq!(pipeline.variant_count(), 2);
    assert_eq!(rig.device.pipeline_state(wire_handle), Some(wireframe));

    let vertices = rig.buffer("vertices", MemoryKind::HostVisible, 256)?;
    let raw = vertices
        .raw()
        .ok_or_else(|| anyhow::anyhow!("vertex buffer has no storage"))?;
    let extent = vk::Extent2D {
        width: 64,
        height: 64,
    };
    let target = RenderTarget {
        color_view: vk::ImageView::null(),
        depth_view: None,
        extent,
        clear_color: Some([0.0; 4]),
        clear_depth: None,
    };

    let mut scheduler = rig.scheduler()?;
    scheduler.dispatch(
        &Workload::draw(&pipeline, wireframe, target, DrawParams::vertices(3))
            .with_vertex_buffer(raw, 0),
    )?;

    let commands = rig.device.stats().submitted.pop().unwrap_or_default();
    assert_eq!(
        commands,
        vec![
            Command::BindPipeline {
                bind_point: vk::PipelineBindPoint::GRAPHICS,
                pipeline: wire_handle,
            },
            Command::BeginRendering(extent),
            Command::BindVertexBuffers(vec![raw]),
            Command::Draw(DrawParams::vertices(3)),
            Command::EndRendering,
            Command::Barrier(MemoryBarrier::before_host_read()),
        ]
    );
    assert_eq!(pipeline.variant_count(), 2);

    rig.check()?;
    pipeline.teardown();
    Ok(())
}

#[test]
fn teardown_unregisters_and_retires_everything() -> anyhow::Result<()> {
    let rig = TestRig::auto();
    let pipeline = rig.compute("temporary", 13, noop(), [storage(0, 16)])?;
    let id = pipeline.id();
    pipeline.handle()?;
    assert!(pipeline.is_compiled());
    assert!(rig.ctx.pipelines().contains(id));

    let mut scheduler = rig.scheduler()?;
    scheduler.dispatch(&Workload::dispatch(&pipeline, [1, 1, 1]))?;

    pipeline.teardown();
    assert!(rig.ctx.pipelines().is_empty());
    assert_eq!(rig.device.live(ObjectKind::Pipeline), 1);

    scheduler.wait_idle()?;
    for kind in [
        ObjectKind::Pipeline,
        ObjectKind::PipelineLayout,
        ObjectKind::DescriptorSetLayout,
        ObjectKind::DescriptorPool,
    ] {
        assert_eq!(rig.device.live(kind), 0, "{kind:?} still alive");
    }

    // Dropping without teardown still leaves the registry.
    let dropped = rig.compute("dropped", 14, noop(), [])?;
    assert_eq!(rig.ctx.pipelines().len(), 1);
    drop(dropped);
    assert!(rig.ctx.pipelines().is_empty());

    rig.check()?;
    Ok(())
}

#[test]
fn changing_frames_in_flight_recreates_pools() -> anyhow::Result<()> {
    let rig = TestRig::auto();
    let pipeline = rig.compute("resize", 15, noop(), [storage(0, 16)])?;
    let mut scheduler = rig.scheduler()?;
    assert_eq!(scheduler.frames_in_flight(), 2);
    assert!(pipeline.pool_stats(2).is_none());

    scheduler.set_frames_in_flight(3)?;
    assert_eq!(scheduler.frames_in_flight(), 3);
    assert_eq!(rig.ctx.frames_in_flight(), 3);
    assert_eq!(pipeline.pool_stats(2).map(|stats| stats.pool_size), Some(1));
    assert_eq!(rig.device.live(ObjectKind::DescriptorPool), 3);
    assert_eq!(rig.device.live(ObjectKind::Fence), 3);

    let block = [0u8; 16];
    for expected in [0, 1, 2, 0] {
        let submission =
            scheduler.dispatch(&Workload::dispatch(&pipeline, [1, 1, 1]).with_data(&block))?;
        assert_eq!(submission.slot(), expected);
    }

    scheduler.set_frames_in_flight(1)?;
    assert_eq!(rig.device.live(ObjectKind::DescriptorPool), 1);
    assert!(pipeline.pool_stats(1).is_none());

    rig.check()?;
    pipeline.teardown();
    Ok(())
}

#[test]
fn compile_failures_name_the_pipeline() -> anyhow::Result<()> {
    let rig = TestRig::auto();
    rig.device.fail_pipelines(true);

    let pipeline = rig.compute("broken", 16, noop(), [])?;
    match pipeline.handle() {
        Err(GpuError::PipelineCreation(message)) => assert!(message.starts_with("broken:")),
        other => panic!("expected a pipeline creation error, got {other:?}"),
    }

    let eager = ComputePipeline::builder("eager")
        .shader(compute_shader(17))
        .prewarm(true)
        .build(&rig.ctx);
    assert!(matches!(eager, Err(GpuError::PipelineCreation(_))));

    let mut scheduler = rig.scheduler()?;
    let result = scheduler.dispatch(&Workload::dispatch(&pipeline, [1, 1, 1]));
    assert!(matches!(result, Err(GpuError::PipelineCreation(_))));
    assert_eq!(scheduler.slot_state(0), Some(SlotState::Idle));
    assert_eq!(scheduler.next_generation(), 1);

    rig.device.fail_pipelines(false);
    let submission = scheduler.dispatch(&Workload::dispatch(&pipeline, [1, 1, 1]))?;
    assert_eq!((submission.slot(), submission.generation()), (0, 1));

    let mismatched = ComputePipeline::builder("mismatched")
        .shader(vertex_shader())
        .build(&rig.ctx);
    assert!(matches!(mismatched, Err(GpuError::ShaderCompilation(_))));

    pipeline.teardown();
    Ok(())
}

#[test]
fn push_constants_are_validated() -> anyhow::Result<()> {
    let rig = TestRig::auto();
    for bytes in [6, 256] {
        let result = ComputePipeline::builder("invalid-push")
            .binding(DescriptorBinding::push_constants(bytes, ShaderStages::COMPUTE))
            .shader(compute_shader(18))
            .build(&rig.ctx);
        assert!(matches!(result, Err(GpuError::InvalidState(_))), "{bytes} bytes accepted");
    }

    let pushed = rig.compute(
        "pushed",
        19,
        noop(),
        [DescriptorBinding::push_constants(16, ShaderStages::COMPUTE)],
    )?;
    let plain = rig.compute("plain", 20, noop(), [])?;
    let mut scheduler = rig.scheduler()?;

    let data = [7u8; 16];
    scheduler.dispatch(&Workload::dispatch(&pushed, [1, 1, 1]).with_push_constants(&data))?;
    let commands = rig.device.stats().submitted.pop().unwrap_or_default();
    assert!(commands.contains(&Command::PushConstants(data.to_vec())));

    let oversized = [0u8; 32];
    let result =
        scheduler.dispatch(&Workload::dispatch(&pushed, [1, 1, 1]).with_push_constants(&oversized));
    assert!(matches!(
        result,
        Err(GpuError::CapacityExceeded {
            requested: 32,
            available: 16
        })
    ));

    let result = scheduler.dispatch(&Workload::dispatch(&plain, [1, 1, 1]).with_push_constants(&data));
    assert!(matches!(result, Err(GpuError::InvalidState(_))));

    pushed.teardown();
    plain.teardown();
    Ok(())
}

#[test]
fn waiting_on_a_recycled_slot_returns_immediately() -> anyhow::Result<()> {
    let rig = TestRig::manual(1);
    let pipeline = rig.compute("cycle", 21, noop(), [])?;
    let mut scheduler = rig.scheduler()?;
    let workload = Workload::dispatch(&pipeline, [1, 1, 1]);

    let first = scheduler.dispatch(&workload)?;
    rig.device.signal_fence(first.fence());
    let second = scheduler.dispatch(&workload)?;
    assert_eq!(second.fence(), first.fence());

    // Would block forever if it waited on the shared fence.
    scheduler.wait_for(&first)?;
    assert!(scheduler.is_complete(&first)?);
    assert!(!scheduler.is_complete(&second)?);

    rig.device.signal_all();
    scheduler.wait_for(&second)?;
    assert!(scheduler.is_complete(&second)?);

    drop(workload);
    pipeline.teardown();
    Ok(())
}

#[test]
fn abandoned_frame_returns_slot_to_idle() -> anyhow::Result<()> {
    let rig = TestRig::auto();
    let pipeline = rig.compute("abandon", 22, noop(), [])?;
    let mut scheduler = rig.scheduler()?;

    {
        let mut frame = scheduler.begin_frame()?;
        frame.record(&Workload::dispatch(&pipeline, [1, 1, 1]))?;
    }
    assert_eq!(scheduler.slot_state(0), Some(SlotState::Idle));
    assert_eq!(scheduler.current_slot(), 0);
    assert_eq!(rig.device.stats().submits, 0);

    let submission = scheduler.dispatch(&Workload::dispatch(&pipeline, [1, 1, 1]))?;
    assert_eq!(submission.generation(), 1);

    // The abandoned frame's pipeline bind does not carry over.
    let commands = rig.device.stats().submitted.pop().unwrap_or_default();
    assert_eq!(count(&commands, |c| matches!(c, Command::BindPipeline { .. })), 1);

    pipeline.teardown();
    Ok(())
}

#[test]
fn buffer_dropped_in_flight_outlives_its_submission() -> anyhow::Result<()> {
    let rig = TestRig::manual(2);
    let pipeline = rig.compute("reader", 23, add_kernel(1), [storage(0, 4)])?;
    let mut scheduler = rig.scheduler()?;

    let mut values = rig.buffer("transient", MemoryKind::HostVisible, 4)?;
    values.append_pod(&[1u32])?;
    let raw = values
        .raw()
        .ok_or_else(|| anyhow::anyhow!("transient buffer has no storage"))?;
    scheduler.dispatch(&Workload::dispatch(&pipeline, [1, 1, 1]).with_buffer(&values, &[0]))?;
    drop(values);

    let block = [0u8; 4];
    scheduler.dispatch(&Workload::dispatch(&pipeline, [1, 1, 1]).with_data(&block))?;
    assert!(rig.device.is_live(raw));

    rig.device.signal_all();
    rig.check()?;
    assert!(rig.device.is_live(raw));

    scheduler.dispatch(&Workload::dispatch(&pipeline, [1, 1, 1]).with_data(&block))?;
    assert!(!rig.device.is_live(raw));
    assert_eq!(scheduler.completed_generation(), 2);

    rig.device.signal_all();
    rig.check()?;
    pipeline.teardown();
    Ok(())
}

#[test]
fn shader_writes_are_made_visible_by_barriers() -> anyhow::Result<()> {
    let rig = TestRig::auto();
    let pipeline = rig.compute("chained", 24, add_kernel(3), [storage(0, 4)])?;
    let mut values = rig.buffer("chain", MemoryKind::HostVisible, 4)?;
    values.append_pod(&[0u32])?;
    let workload = Workload::dispatch(&pipeline, [1, 1, 1]).with_buffer(&values, &[0]);

    let mut scheduler = rig.scheduler()?;
    let mut frame = scheduler.begin_frame()?;
    frame.record(&workload)?;
    frame.record(&workload)?;
    let submission = frame.submit()?;
    scheduler.wait_for(&submission)?;
    assert_eq!(read_u32s(&values, 0, 1)?, [6]);

    let commands = rig.device.stats().submitted.pop().unwrap_or_default();
    let ordering: Vec<&Command> = commands
        .iter()
        .filter(|c| matches!(c, Command::Dispatch(_) | Command::Barrier(_)))
        .collect();
    assert_eq!(
        ordering,
        [
            &Command::Dispatch([1, 1, 1]),
            &Command::Barrier(MemoryBarrier::between_workloads()),
            &Command::Dispatch([1, 1, 1]),
            &Command::Barrier(MemoryBarrier::before_host_read()),
        ]
    );
    assert_eq!(
        commands.last(),
        Some(&Command::Barrier(MemoryBarrier::before_host_read()))
    );

    let host = MemoryBarrier::before_host_read();
    assert!(host.src_access.contains(vk::AccessFlags2::SHADER_WRITE));
    assert!(host.dst_stages.contains(vk::PipelineStageFlags2::HOST));
    assert!(host.dst_access.contains(vk::AccessFlags2::HOST_READ));

    // Nothing recorded, nothing to make visible.
    scheduler.begin_frame()?.submit()?;
    let commands = rig.device.stats().submitted.pop().unwrap_or_default();
    assert_eq!(count(&commands, |c| matches!(c, Command::Barrier(_))), 0);

    rig.check()?;
    drop(workload);
    pipeline.teardown();
    Ok(())
}

#[test]
fn failed_record_leaves_no_staging_behind() -> anyhow::Result<()> {
    let rig = TestRig::auto();
    let pushed = rig.compute(
        "pushed-staged",
        25,
        add_kernel(1),
        [storage(0, 16), DescriptorBinding::push_constants(16, ShaderStages::COMPUTE)],
    )?;
    let textured = rig.compute(
        "textured-staged",
        26,
        noop(),
        [
            storage(0, 16),
            DescriptorBinding::storage_image(1, ShaderStages::COMPUTE, ImageSlot(5)),
        ],
    )?;
    let images = MockImages::new();
    let input = [1u32, 2, 3, 4];
    let data: &[u8] = bytemuck::cast_slice(&input);
    let oversized = [0u8; 32];

    let mut scheduler = rig.scheduler()?;
    let mut frame = scheduler.begin_frame()?;
    let slot = frame.slot();

    let result = frame.record(
        &Workload::dispatch(&pushed, [1, 1, 1])
            .with_data(data)
            .with_push_constants(&oversized),
    );
    assert!(matches!(
        result,
        Err(GpuError::CapacityExceeded {
            requested: 32,
            available: 16
        })
    ));
    assert_eq!(frame.staging().used_bytes(), 0);

    // Fails after its block was staged.
    let result = frame.record(
        &Workload::dispatch(&textured, [1, 1, 1])
            .with_data(data)
            .with_images(&images),
    );
    assert!(matches!(result, Err(GpuError::ResourceNotFound(_))));
    assert_eq!(frame.staging().used_bytes(), 0);

    assert_eq!(frame.record(&Workload::dispatch(&pushed, [1, 1, 1]).with_data(data))?, [0]);
    let submission = frame.submit()?;
    assert_eq!(submission.staged_offsets(), [0]);

    scheduler.wait_for(&submission)?;
    let commands = rig.device.stats().submitted.pop().unwrap_or_default();
    assert_eq!(count(&commands, |c| matches!(c, Command::Dispatch(_))), 1);
    let staging = scheduler
        .staging(slot)
        .ok_or_else(|| anyhow::anyhow!("slot {slot} has no staging buffer"))?;
    assert_eq!(read_u32s(staging, 0, 4)?, [2, 3, 4, 5]);

    rig.check()?;
    pushed.teardown();
    textured.teardown();
    Ok(())
}

#[test]
fn leaked_frame_keeps_its_slot_busy_until_reset() -> anyhow::Result<()> {
    let rig = TestRig::auto();
    let pipeline = rig.compute("leaked", 27, noop(), [])?;
    let workload = Workload::dispatch(&pipeline, [1, 1, 1]);
    let mut scheduler = rig.scheduler()?;

    std::mem::forget(scheduler.begin_frame()?);
    assert_eq!(scheduler.slot_state(0), Some(SlotState::Recording));
    for _ in 0..2 {
        let result = scheduler.dispatch(&workload);
        assert!(matches!(result, Err(GpuError::SlotBusy { slot: 0 })));
        assert_eq!(scheduler.current_slot(), 0);
    }

    assert!(!scheduler.reset_slot(1));
    assert!(scheduler.reset_slot(0));
    assert_eq!(scheduler.slot_state(0), Some(SlotState::Idle));

    let submission = scheduler.dispatch(&workload)?;
    assert_eq!((submission.slot(), submission.generation()), (0, 1));
    // Only a recording slot can be reset.
    assert!(!scheduler.reset_slot(0));
    assert_eq!(rig.device.stats().submits, 1);

    rig.check()?;
    drop(workload);
    pipeline.teardown();
    Ok(())
}

#[test]
fn failed_submit_returns_the_slot_to_idle() -> anyhow::Result<()> {
    let rig = TestRig::manual(2);
    let pipeline = rig.compute("resubmit", 28, add_kernel(1), [storage(0, 4)])?;
    let mut values = rig.buffer("counter", MemoryKind::HostVisible, 4)?;
    values.append_pod(&[5u32])?;
    let mut scheduler = rig.scheduler()?;

    let first =
        scheduler.dispatch(&Workload::dispatch(&pipeline, [1, 1, 1]).with_buffer(&values, &[0]))?;
    rig.device.fail_submits(true);
    let result =
        scheduler.dispatch(&Workload::dispatch(&pipeline, [1, 1, 1]).with_buffer(&values, &[0]));
    assert!(matches!(
        result,
        Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))
    ));
    assert_eq!(scheduler.slot_state(1), Some(SlotState::Idle));
    assert_eq!(scheduler.current_slot(), 1);
    assert_eq!(scheduler.next_generation(), 2);
    assert_eq!(rig.device.pending_fences(), [first.fence()]);

    // The abandoned slot's fence never signals; waiting must not block on it.
    rig.device.fail_submits(false);
    rig.device.signal_fence(first.fence());
    scheduler.wait_idle()?;
    assert_eq!(read_u32s(&values, 0, 1)?, [6]);

    let second =
        scheduler.dispatch(&Workload::dispatch(&pipeline, [1, 1, 1]).with_buffer(&values, &[0]))?;
    assert_eq!((second.slot(), second.generation()), (1, 2));
    rig.device.signal_all();
    scheduler.wait_for(&second)?;
    assert_eq!(read_u32s(&values, 0, 1)?, [7]);
    assert_eq!(rig.device.stats().submits, 2);

    rig.check()?;
    pipeline.teardown();
    Ok(())
}
