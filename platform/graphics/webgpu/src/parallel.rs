use gpu::util::DeviceExt;

use crate::*;

pub const PARALLEL_TASK_WORKGROUP_SIZE: u32 = 64;

#[derive(thiserror::Error, Debug)]
pub enum DeviceFault {
  #[error("device validation error: {0}")]
  Validation(String),
  #[error("device out of memory: {0}")]
  OutOfMemory(String),
  #[error("failed to wait for device: {0}")]
  Poll(#[from] PollError),
  #[error("failed to map read back buffer: {0}")]
  ReadBack(#[from] BufferAsyncError),
  #[error(transparent)]
  StaleAllocation(#[from] StaleAllocation),
  #[error("{task_count} parallel tasks exceed the device dispatch limit")]
  LaunchTooLarge { task_count: u32 },
}

/// A device resource that can be bound into a parallel task.
pub trait ShaderBindable {
  /// WGSL emitted at module scope for the resource placed at `@group(0) @binding(binding)`.
  fn wgsl_declaration(&self, binding: u32) -> String;
  fn storage(&self) -> DeviceAllocation;
  fn read_only(&self) -> bool {
    false
  }
}

/// Binds an allocation as a plain `array<u32>` named `name`.
#[derive(Debug, Clone)]
pub struct StorageArrayAccess {
  name: String,
  storage: DeviceAllocation,
  read_only: bool,
}

impl StorageArrayAccess {
  pub fn read_write_u32(name: impl Into<String>, storage: DeviceAllocation) -> Self {
    Self {
      name: name.into(),
      storage,
      read_only: false,
    }
  }

  pub fn read_only_u32(name: impl Into<String>, storage: DeviceAllocation) -> Self {
    Self {
      name: name.into(),
      storage,
      read_only: true,
    }
  }
}

impl ShaderBindable for StorageArrayAccess {
  fn wgsl_declaration(&self, binding: u32) -> String {
    let access = if self.read_only { "read" } else { "read_write" };
    format!(
      "@group(0) @binding({binding}) var<storage, {access}> {}: array<u32>;\n",
      self.name
    )
  }

  fn storage(&self) -> DeviceAllocation {
    self.storage
  }

  fn read_only(&self) -> bool {
    self.read_only
  }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct ParallelLaunchInfo {
  task_count: u32,
  row_pitch: u32,
  reserved: [u32; 2],
}

const PARALLEL_TASK_PRELUDE: &str = "struct ParallelLaunchInfo {
  task_count: u32,
  row_pitch: u32,
  reserved: vec2<u32>,
}

@group(0) @binding(0) var<uniform> parallel_launch: ParallelLaunchInfo;

";

struct BoundResource {
  declaration: String,
  storage: DeviceAllocation,
  read_only: bool,
}

/// Describes a launch of many independent tasks, each running `body` with its own `task_id`.
///
/// ```ignore
/// ParallelTaskBuilder::new("fill")
///   .with_bind(&StorageArrayAccess::read_write_u32("output", storage))
///   .with_task_body("output[task_id] = task_id;")
///   .dispatch(&gpu, 1024)?;
/// ```
pub struct ParallelTaskBuilder {
  label: String,
  bindings: Vec<BoundResource>,
  body: String,
}

impl ParallelTaskBuilder {
  pub fn new(label: impl Into<String>) -> Self {
    Self {
      label: label.into(),
      bindings: Vec::new(),
      body: String::new(),
    }
  }

  /// resources are bound in call order starting from binding 1, binding 0 is the launch info.
  pub fn with_bind(mut self, resource: &impl ShaderBindable) -> Self {
    let binding = self.bindings.len() as u32 + 1;
    self.bindings.push(BoundResource {
      declaration: resource.wgsl_declaration(binding),
      storage: resource.storage(),
      read_only: resource.read_only(),
    });
    self
  }

  pub fn with_task_body(mut self, body: impl Into<String>) -> Self {
    self.body = body.into();
    self
  }

  pub fn shader_source(&self) -> String {
    let mut source = String::from(PARALLEL_TASK_PRELUDE);
    for binding in &self.bindings {
      source.push_str(&binding.declaration);
      source.push('\n');
    }

    source.push_str("fn parallel_task(task_id: u32) {\n");
    source.push_str(&self.body);
    source.push_str("\n}\n\n");

    source.push_str(&format!(
      "@compute @workgroup_size({PARALLEL_TASK_WORKGROUP_SIZE})
fn main(@builtin(global_invocation_id) global_id: vec3<u32>) {{
  let task_id = global_id.y * parallel_launch.row_pitch + global_id.x;
  if (task_id >= parallel_launch.task_count) {{
    return;
  }}
  parallel_task(task_id);
}}
"
    ));
    source
  }

  fn layout_entries(&self) -> Vec<gpu::BindGroupLayoutEntry> {
    let entry = |binding, ty| gpu::BindGroupLayoutEntry {
      binding,
      visibility: gpu::ShaderStages::COMPUTE,
      ty: gpu::BindingType::Buffer {
        ty,
        has_dynamic_offset: false,
        min_binding_size: None,
      },
      count: None,
    };

    let mut entries = vec![entry(0, gpu::BufferBindingType::Uniform)];
    entries.extend(self.bindings.iter().enumerate().map(|(i, binding)| {
      entry(
        i as u32 + 1,
        gpu::BufferBindingType::Storage {
          read_only: binding.read_only,
        },
      )
    }));
    entries
  }

  fn get_or_create_pipeline(&self, device: &GPUDevice) -> Result<GPUComputePipeline, DeviceFault> {
    let source = self.shader_source();
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    self.layout_entries().hash(&mut hasher);

    device.get_or_cache_create_compute_pipeline_by(hasher.finish(), |device| {
      log::debug!("compile parallel task `{}`", self.label);
      let label = Some(self.label.as_str());
      device.capture_errors(|| {
        let module = device.create_shader_module(gpu::ShaderModuleDescriptor {
          label,
          source: gpu::ShaderSource::Wgsl(Cow::Owned(source)),
        });
        let bind_group_layout =
          device.create_bind_group_layout(&gpu::BindGroupLayoutDescriptor {
            label,
            entries: &self.layout_entries(),
          });
        let layout = device.create_pipeline_layout(&gpu::PipelineLayoutDescriptor {
          label,
          bind_group_layouts: &[&bind_group_layout],
          push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&gpu::ComputePipelineDescriptor {
          label,
          layout: Some(&layout),
          module: &module,
          entry_point: Some("main"),
          compilation_options: Default::default(),
          cache: None,
        });
        Ok(GPUComputePipeline {
          pipeline: Arc::new(pipeline),
          bind_group_layout: Arc::new(bind_group_layout),
        })
      })
    })
  }

  /// Launch `task_count` tasks and block until they, and everything queued before them, have
  /// completed.
  pub fn dispatch(&self, gpu: &GPU, task_count: u32) -> Result<(), DeviceFault> {
    if task_count == 0 {
      return gpu.wait_idle();
    }

    let max_per_dimension = gpu.device.limits().max_compute_workgroups_per_dimension;
    let (x, y) = compute_dispatch_size(task_count, max_per_dimension)
      .ok_or(DeviceFault::LaunchTooLarge { task_count })?;

    let buffers = self
      .bindings
      .iter()
      .map(|binding| {
        gpu
          .device
          .resolve_storage(binding.storage)
          .ok_or(StaleAllocation(binding.storage))
      })
      .collect::<Result<Vec<_>, _>>()?;

    let pipeline = self.get_or_create_pipeline(&gpu.device)?;

    let launch_info = ParallelLaunchInfo {
      task_count,
      row_pitch: x * PARALLEL_TASK_WORKGROUP_SIZE,
      reserved: [0; 2],
    };

    gpu.device.capture_errors(|| {
      let launch_buffer = gpu
        .device
        .create_buffer_init(&gpu::util::BufferInitDescriptor {
          label: Some("parallel-launch-info"),
          contents: bytemuck::bytes_of(&launch_info),
          usage: gpu::BufferUsages::UNIFORM,
        });

      let mut entries = vec![gpu::BindGroupEntry {
        binding: 0,
        resource: launch_buffer.as_entire_binding(),
      }];
      entries.extend(
        buffers
          .iter()
          .enumerate()
          .map(|(i, buffer)| gpu::BindGroupEntry {
            binding: i as u32 + 1,
            resource: buffer.as_entire_binding(),
          }),
      );

      let bind_group = gpu.device.create_bind_group(&gpu::BindGroupDescriptor {
        label: Some(self.label.as_str()),
        layout: &pipeline.bind_group_layout,
        entries: &entries,
      });

      let encoder = gpu.create_encoder().with_compute_pass_scoped(|mut pass| {
        pass.set_pipeline(&pipeline.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(x, y, 1);
      });

      gpu.submit_and_wait(encoder)
    })
  }
}

/// Workgroup counts covering `task_count` tasks, spilling into the y dimension when x would
/// exceed `max_per_dimension`. None if the launch can not be expressed without the linearized
/// task id overflowing.
pub fn compute_dispatch_size(task_count: u32, max_per_dimension: u32) -> Option<(u32, u32)> {
  let workgroups = task_count.div_ceil(PARALLEL_TASK_WORKGROUP_SIZE);
  if workgroups == 0 {
    return Some((0, 0));
  }
  let x = workgroups.min(max_per_dimension);
  let y = workgroups.div_ceil(x);
  if y > max_per_dimension {
    return None;
  }

  // row pitch is uploaded as u32
  if x as u64 * PARALLEL_TASK_WORKGROUP_SIZE as u64 > u32::MAX as u64 {
    return None;
  }

  let invocations = x as u64 * y as u64 * PARALLEL_TASK_WORKGROUP_SIZE as u64;
  if invocations > u32::MAX as u64 + 1 {
    return None;
  }
  Some((x, y))
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn dispatch_size_fits_one_row() {
    assert_eq!(compute_dispatch_size(1, 65535), Some((1, 1)));
    assert_eq!(compute_dispatch_size(64, 65535), Some((1, 1)));
    assert_eq!(compute_dispatch_size(65, 65535), Some((2, 1)));
    assert_eq!(compute_dispatch_size(1024, 65535), Some((16, 1)));
    assert_eq!(compute_dispatch_size(0, 65535), Some((0, 0)));
  }

  #[test]
  fn dispatch_size_spills_into_rows() {
    assert_eq!(compute_dispatch_size(64 * 65535 + 1, 65535), Some((65535, 2)));
    assert_eq!(compute_dispatch_size(64 * 16, 4), Some((4, 4)));
    assert_eq!(compute_dispatch_size(64 * 17, 4), None);
    assert_eq!(compute_dispatch_size(u32::MAX, 65535), None);
  }

  #[test]
  fn dispatch_size_keeps_row_pitch_in_range() {
    assert_eq!(compute_dispatch_size(u32::MAX, 1 << 30), None);
    assert_eq!(
      compute_dispatch_size(u32::MAX / 2, 1 << 30),
      Some((1 << 25, 1))
    );
  }

  #[test]
  fn shader_source_binds_in_call_order() {
    let mut table = DeviceMemoryTable::default();
    let a = table.insert((), 16);
    let b = table.insert((), 16);

    let builder = ParallelTaskBuilder::new("copy")
      .with_bind(&StorageArrayAccess::read_only_u32("input", a))
      .with_bind(&StorageArrayAccess::read_write_u32("output", b))
      .with_task_body("output[task_id] = input[task_id];");
    let source = builder.shader_source();

    assert!(source.contains("@group(0) @binding(0) var<uniform> parallel_launch"));
    assert!(source.contains("@group(0) @binding(1) var<storage, read> input: array<u32>;"));
    assert!(source.contains("@group(0) @binding(2) var<storage, read_write> output: array<u32>;"));
    assert!(source.contains("fn parallel_task(task_id: u32) {\noutput[task_id] = input[task_id];\n}"));
    assert!(source.contains("@workgroup_size(64)"));

    let entries = builder.layout_entries();
    assert_eq!(entries.len(), 3);
    assert!(matches!(
      entries[1].ty,
      gpu::BindingType::Buffer {
        ty: gpu::BufferBindingType::Storage { read_only: true },
        ..
      }
    ));
  }

  #[pollster::test]
  async fn fills_and_reads_back() {
    let Some(gpu) = test_gpu().await else {
      return;
    };

    let storage = gpu.device.allocate_storage("fill", 300 * 4).unwrap();
    ParallelTaskBuilder::new("fill")
      .with_bind(&StorageArrayAccess::read_write_u32("output", storage))
      .with_task_body("output[task_id] = task_id * 2u;")
      .dispatch(&gpu, 300)
      .unwrap();

    let result = gpu.read_storage_u32(storage).unwrap();
    let expect: Vec<u32> = (0..300).map(|i| i * 2).collect();
    assert_eq!(result, expect);

    gpu.device.release_storage(storage).unwrap();
  }

  #[pollster::test]
  async fn launch_spanning_several_workgroup_rows() {
    let Some(gpu) = test_gpu().await else {
      return;
    };

    // one row holds at most 64 * 65535 tasks on the default limits
    const TASKS: u32 = 64 * 65535 + 1000;
    let max_per_dimension = gpu.device.limits().max_compute_workgroups_per_dimension;
    let (_, rows) = compute_dispatch_size(TASKS, max_per_dimension).unwrap();
    if max_per_dimension <= 65535 {
      assert_eq!(rows, 2);
    }

    let storage = gpu.device.allocate_storage("ids", TASKS as u64 * 4).unwrap();
    ParallelTaskBuilder::new("ids")
      .with_bind(&StorageArrayAccess::read_write_u32("ids", storage))
      .with_task_body("  ids[task_id] = task_id + 1u;")
      .dispatch(&gpu, TASKS)
      .unwrap();

    let result = gpu.read_storage_u32(storage).unwrap();
    assert_eq!(result.len(), TASKS as usize);
    assert!(result.iter().enumerate().all(|(i, v)| *v == i as u32 + 1));

    gpu.device.release_storage(storage).unwrap();
  }

  #[pollster::test]
  async fn empty_launch_only_waits() {
    let Some(gpu) = test_gpu().await else {
      return;
    };

    let storage = gpu.device.allocate_storage("untouched", 4).unwrap();
    ParallelTaskBuilder::new("nothing")
      .with_bind(&StorageArrayAccess::read_write_u32("output", storage))
      .with_task_body("output[task_id] = 7u;")
      .dispatch(&gpu, 0)
      .unwrap();
    assert_eq!(gpu.device.live_allocation_count(), 1);

    gpu.device.release_storage(storage).unwrap();
  }

  #[pollster::test]
  async fn invalid_body_is_a_fault() {
    let Some(gpu) = test_gpu().await else {
      return;
    };

    let storage = gpu.device.allocate_storage("broken", 4).unwrap();
    let result = ParallelTaskBuilder::new("broken")
      .with_bind(&StorageArrayAccess::read_write_u32("output", storage))
      .with_task_body("output[task_id] = not_declared;")
      .dispatch(&gpu, 1);
    assert!(matches!(result, Err(DeviceFault::Validation(_))));

    gpu.device.release_storage(storage).unwrap();
  }

  #[pollster::test]
  async fn released_binding_is_a_fault() {
    let Some(gpu) = test_gpu().await else {
      return;
    };

    let storage = gpu.device.allocate_storage("released", 4).unwrap();
    gpu.device.release_storage(storage).unwrap();

    let result = ParallelTaskBuilder::new("released")
      .with_bind(&StorageArrayAccess::read_write_u32("output", storage))
      .with_task_body("output[task_id] = 1u;")
      .dispatch(&gpu, 1);
    assert!(matches!(result, Err(DeviceFault::StaleAllocation(_))));
    assert!(gpu.read_storage_u32(storage).is_err());
  }

  #[pollster::test]
  async fn allocation_limits() {
    let Some(gpu) = test_gpu().await else {
      return;
    };

    assert!(matches!(
      gpu.device.allocate_storage("zero", 0),
      Err(GPUAllocationError::ZeroSized)
    ));
    assert!(matches!(
      gpu.device.allocate_storage("huge", u64::MAX / 2),
      Err(GPUAllocationError::ExceedLimit { .. })
    ));

    let storage = gpu.device.allocate_storage("unaligned", 5).unwrap();
    assert_eq!(storage.byte_size(), 8);
    assert_eq!(gpu.device.live_allocation_bytes(), 8);
    gpu.device.release_storage(storage).unwrap();
    assert_eq!(
      gpu.device.release_storage(storage),
      Err(StaleAllocation(storage))
    );
    assert_eq!(gpu.device.live_allocation_count(), 0);
  }
}
