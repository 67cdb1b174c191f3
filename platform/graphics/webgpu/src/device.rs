use parking_lot::{Mutex, RwLock};

use crate::*;

#[derive(Clone)]
pub struct GPUDevice {
  inner: Arc<GPUDeviceInner>,
}

struct GPUDeviceInner {
  device: gpu::Device,
  pipeline_cache: ComputePipelineCache,
  memory: Mutex<DeviceMemoryTable<Arc<gpu::Buffer>>>,
}

#[derive(Clone)]
pub struct GPUComputePipeline {
  pub pipeline: Arc<gpu::ComputePipeline>,
  pub bind_group_layout: Arc<gpu::BindGroupLayout>,
}

#[derive(Default)]
pub struct ComputePipelineCache {
  cache: RwLock<HashMap<u64, GPUComputePipeline>>,
}

impl GPUDevice {
  pub fn new(device: gpu::Device) -> Self {
    let inner = GPUDeviceInner {
      device,
      pipeline_cache: Default::default(),
      memory: Mutex::new(DeviceMemoryTable::default()),
    };

    Self {
      inner: Arc::new(inner),
    }
  }

  pub fn create_encoder(&self) -> GPUCommandEncoder {
    let encoder = self.create_command_encoder(&gpu::CommandEncoderDescriptor { label: None });
    GPUCommandEncoder::new(encoder)
  }

  pub fn get_or_cache_create_compute_pipeline_by(
    &self,
    key: u64,
    creator: impl FnOnce(&Self) -> Result<GPUComputePipeline, DeviceFault>,
  ) -> Result<GPUComputePipeline, DeviceFault> {
    if let Some(pipeline) = self.inner.pipeline_cache.cache.read().get(&key) {
      return Ok(pipeline.clone());
    }
    let pipeline = creator(self)?;
    self
      .inner
      .pipeline_cache
      .cache
      .write()
      .insert(key, pipeline.clone());
    Ok(pipeline)
  }

  /// Run `f` inside validation and out of memory error scopes, any error the device reports in
  /// between is returned as a fault.
  pub fn capture_errors<R>(
    &self,
    f: impl FnOnce() -> Result<R, DeviceFault>,
  ) -> Result<R, DeviceFault> {
    self.push_error_scope(gpu::ErrorFilter::OutOfMemory);
    self.push_error_scope(gpu::ErrorFilter::Validation);
    let result = f();
    let validation = pollster::block_on(self.pop_error_scope());
    let out_of_memory = pollster::block_on(self.pop_error_scope());

    if let Some(err) = validation {
      return Err(DeviceFault::Validation(err.to_string()));
    }
    if let Some(err) = out_of_memory {
      return Err(DeviceFault::OutOfMemory(err.to_string()));
    }
    result
  }

  /// Allocate a storage buffer of at least `byte_size` bytes. The content is not initialized by
  /// this call.
  pub fn allocate_storage(
    &self,
    label: &str,
    byte_size: u64,
  ) -> Result<DeviceAllocation, GPUAllocationError> {
    if byte_size == 0 {
      return Err(GPUAllocationError::ZeroSized);
    }
    let byte_size = byte_size.next_multiple_of(gpu::COPY_BUFFER_ALIGNMENT);

    let limits = self.limits();
    let limit = limits
      .max_buffer_size
      .min(limits.max_storage_buffer_binding_size as u64);
    if byte_size > limit {
      return Err(GPUAllocationError::ExceedLimit {
        requested: byte_size,
        limit,
      });
    }

    let buffer = self
      .capture_errors(|| {
        Ok(self.create_buffer(&gpu::BufferDescriptor {
          label: Some(label),
          size: byte_size,
          usage: gpu::BufferUsages::STORAGE
            | gpu::BufferUsages::COPY_SRC
            | gpu::BufferUsages::COPY_DST,
          mapped_at_creation: false,
        }))
      })
      .map_err(|fault| match fault {
        DeviceFault::OutOfMemory(msg) => GPUAllocationError::OutOfMemory(msg),
        other => GPUAllocationError::Rejected(other.to_string()),
      })?;

    let allocation = self.inner.memory.lock().insert(Arc::new(buffer), byte_size);
    log::debug!("allocated `{label}` {allocation:?}");
    Ok(allocation)
  }

  /// Destroy the buffer behind `allocation`. Every copy of the handle is invalid afterwards,
  /// releasing through any of them again is reported as stale.
  pub fn release_storage(&self, allocation: DeviceAllocation) -> Result<(), StaleAllocation> {
    let buffer = self.inner.memory.lock().remove(allocation)?;
    buffer.destroy();
    log::debug!("released {allocation:?}");
    Ok(())
  }

  pub fn resolve_storage(&self, allocation: DeviceAllocation) -> Option<Arc<gpu::Buffer>> {
    self.inner.memory.lock().get(allocation).cloned()
  }

  pub fn live_allocation_count(&self) -> usize {
    self.inner.memory.lock().live_count()
  }

  pub fn live_allocation_bytes(&self) -> u64 {
    self.inner.memory.lock().live_bytes()
  }
}

impl Deref for GPUDevice {
  type Target = gpu::Device;

  fn deref(&self) -> &Self::Target {
    &self.inner.device
  }
}
