use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

use crate::*;

pub struct ReadableBuffer {
  buffer: gpu::Buffer,
}

impl ReadableBuffer {
  pub fn read_raw(&self) -> gpu::BufferView<'_> {
    self.buffer.slice(..).get_mapped_range()
  }

  pub fn read_u32(&self) -> Vec<u32> {
    let view = self.read_raw();
    bytemuck::cast_slice::<u8, u32>(&view).to_vec()
  }
}

impl Drop for ReadableBuffer {
  fn drop(&mut self) {
    self.buffer.unmap();
  }
}

pub struct ReadBufferTask {
  buffer: Option<gpu::Buffer>,
  inner: futures::channel::oneshot::Receiver<Result<(), BufferAsyncError>>,
}

impl ReadBufferTask {
  /// Request the mapping of a staging buffer. The copy into it must already be submitted, the
  /// task resolves when the device is polled after that copy completes.
  pub fn map_staging(buffer: gpu::Buffer) -> Self {
    let (sender, receiver) = futures::channel::oneshot::channel();
    buffer.slice(..).map_async(gpu::MapMode::Read, move |v| {
      // the receiver is only gone when the task itself was dropped
      let _ = sender.send(v);
    });

    Self {
      buffer: Some(buffer),
      inner: receiver,
    }
  }
}

impl Future for ReadBufferTask {
  type Output = Result<ReadableBuffer, BufferAsyncError>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    match Pin::new(&mut self.inner).poll(cx) {
      Poll::Ready(r) => match r {
        Ok(Ok(())) => match self.buffer.take() {
          Some(buffer) => Poll::Ready(Ok(ReadableBuffer { buffer })),
          None => panic!("already resolved"),
        },
        Ok(Err(err)) => Poll::Ready(Err(err)),
        Err(_) => Poll::Ready(Err(BufferAsyncError)),
      },
      Poll::Pending => Poll::Pending,
    }
  }
}

impl GPU {
  /// Copy the whole allocation into host memory and decode it as `u32`s. Blocks until the copy
  /// and everything queued before it has completed.
  pub fn read_storage_u32(&self, allocation: DeviceAllocation) -> Result<Vec<u32>, DeviceFault> {
    let source = self
      .device
      .resolve_storage(allocation)
      .ok_or(DeviceFault::StaleAllocation(StaleAllocation(allocation)))?;

    let task = self.device.capture_errors(|| {
      let mut encoder = self.create_encoder();
      let staging = encoder.copy_to_staging(&self.device, &source, allocation.byte_size());
      self.submit_and_wait(encoder)?;
      Ok(ReadBufferTask::map_staging(staging))
    })?;

    self.wait_idle()?;
    let readable = pollster::block_on(task)?;
    Ok(readable.read_u32())
  }
}
