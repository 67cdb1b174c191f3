use crate::*;

#[derive(Clone)]
pub struct GPUQueue {
  inner: Arc<gpu::Queue>,
}

impl GPUQueue {
  pub fn new(queue: gpu::Queue) -> Self {
    Self {
      inner: Arc::new(queue),
    }
  }

  pub fn submit_encoder(&self, encoder: GPUCommandEncoder) -> gpu::SubmissionIndex {
    self.inner.submit(Some(encoder.finish()))
  }
}

impl Deref for GPUQueue {
  type Target = gpu::Queue;

  fn deref(&self) -> &Self::Target {
    &self.inner
  }
}

impl GPU {
  /// Submit the encoder and block the calling thread until it, and all the work queued before
  /// it, has finished executing.
  pub fn submit_and_wait(&self, encoder: GPUCommandEncoder) -> Result<(), DeviceFault> {
    let index = self.queue.submit_encoder(encoder);
    self
      .device
      .poll(gpu::PollType::WaitForSubmissionIndex(index))?;
    Ok(())
  }

  /// Block until everything queued so far has finished executing.
  pub fn wait_idle(&self) -> Result<(), DeviceFault> {
    self.device.poll(gpu::PollType::Wait)?;
    Ok(())
  }
}
