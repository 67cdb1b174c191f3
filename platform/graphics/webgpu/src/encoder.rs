use crate::*;

pub struct GPUCommandEncoder {
  encoder: gpu::CommandEncoder,
}

impl Deref for GPUCommandEncoder {
  type Target = gpu::CommandEncoder;

  fn deref(&self) -> &Self::Target {
    &self.encoder
  }
}

impl DerefMut for GPUCommandEncoder {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.encoder
  }
}

impl GPUCommandEncoder {
  pub fn new(encoder: gpu::CommandEncoder) -> Self {
    Self { encoder }
  }

  pub fn finish(self) -> gpu::CommandBuffer {
    self.encoder.finish()
  }

  pub fn with_compute_pass_scoped(mut self, f: impl FnOnce(gpu::ComputePass)) -> Self {
    let pass = self
      .encoder
      .begin_compute_pass(&gpu::ComputePassDescriptor {
        label: None,
        timestamp_writes: None,
      });
    f(pass);
    self
  }

  /// Record a copy of the first `byte_size` bytes of `source` into a new host mappable buffer.
  /// The returned buffer can be mapped once the encoder has been submitted.
  pub fn copy_to_staging(
    &mut self,
    device: &GPUDevice,
    source: &gpu::Buffer,
    byte_size: u64,
  ) -> gpu::Buffer {
    let output_buffer = device.create_buffer(&gpu::BufferDescriptor {
      label: Some("read-back-staging"),
      size: byte_size,
      usage: gpu::BufferUsages::MAP_READ | gpu::BufferUsages::COPY_DST,
      mapped_at_creation: false,
    });

    self
      .encoder
      .copy_buffer_to_buffer(source, 0, &output_buffer, 0, byte_size);

    output_buffer
  }
}
