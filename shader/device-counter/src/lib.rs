//! An array of counters living in device memory, incremented atomically by parallel tasks and
//! reset/read back from the host.
//!
//! [`CounterArray`] is a plain copyable descriptor: the context it borrows, the counter count and
//! the handle of the device allocation. Copying it does not copy the allocation, every copy
//! addresses the same counters, which is what makes it cheap to hand to any number of launches.
//! Ownership of the allocation is not tracked by the descriptor. One copy, chosen by the caller,
//! calls [`CounterArray::release`] exactly once after all device work touching it has completed.

use std::fmt;

use tally_webgpu::*;

mod access;
pub use access::*;


/// counters are `atomic<u32>` on the device
pub const COUNTER_BYTE_SIZE: u64 = 4;

#[derive(thiserror::Error, Debug)]
pub enum CounterArrayError {
  #[error("counter array must hold at least one counter")]
  ZeroSized,
  #[error("failed to allocate counter storage: {0}")]
  Allocation(#[from] GPUAllocationError),
}

#[derive(Clone, Copy)]
pub struct CounterArray<'a> {
  gpu: &'a GPU,
  count: u32,
  storage: Option<DeviceAllocation>,
}

// the descriptor is copied into every launch, keep it that way
const _: () = {
  const fn assert_copy<T: Copy>() {}
  assert_copy::<CounterArray<'static>>();
};

impl fmt::Debug for CounterArray<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CounterArray")
      .field("count", &self.count)
      .field("storage", &self.storage)
      .finish()
  }
}

impl<'a> CounterArray<'a> {
  /// Allocate `count` counters on the device of `gpu`.
  ///
  /// The initial content is unspecified, call [`Self::reset`] before relying on any value.
  pub fn new(gpu: &'a GPU, count: u32) -> Result<Self, CounterArrayError> {
    if count == 0 {
      return Err(CounterArrayError::ZeroSized);
    }
    let storage = gpu
      .device
      .allocate_storage("counter-array", count as u64 * COUNTER_BYTE_SIZE)?;

    Ok(Self {
      gpu,
      count,
      storage: Some(storage),
    })
  }

  pub fn count(&self) -> u32 {
    self.count
  }

  pub fn is_released(&self) -> bool {
    self.storage.is_none()
  }

  pub fn storage(&self) -> Option<DeviceAllocation> {
    self.storage
  }

  fn expect_storage(&self) -> DeviceAllocation {
    match self.storage {
      Some(storage) => storage,
      None => panic!("counter array used after release"),
    }
  }

  /// Zero every counter, one parallel task per counter. Returns once the reset and everything
  /// queued before it has executed. A device fault here is fatal.
  pub fn reset(&self) {
    let result = ParallelTaskBuilder::new("counter-array-reset")
      .with_bind(&self.device_access("counter"))
      .with_task_body("  atomicStore(&counter_slots[task_id], 0u);")
      .dispatch(self.gpu, self.count);

    if let Err(fault) = result {
      device_fault("reset", fault)
    }
  }

  /// Current value of every counter, index aligned with the device slots. Does not modify the
  /// counters. A device fault here is fatal.
  pub fn read_all(&self) -> Vec<u32> {
    match self.gpu.read_storage_u32(self.expect_storage()) {
      Ok(counts) => counts,
      Err(fault) => device_fault("read back", fault),
    }
  }

  /// Free the device allocation. Calling it again on the same descriptor does nothing.
  ///
  /// Copies made before the release still hold the freed handle, using or releasing through
  /// them panics. The caller must also make sure no device work using the counters is in flight.
  pub fn release(&mut self) {
    if let Some(storage) = self.storage.take() {
      if let Err(stale) = self.gpu.device.release_storage(storage) {
        panic!("counter array released twice through aliasing copies: {stale}");
      }
    }
  }

  /// Device side access for parallel tasks, see [`CounterArrayDeviceAccess`].
  pub fn device_access(&self, name: &str) -> CounterArrayDeviceAccess {
    CounterArrayDeviceAccess::new(name, self.expect_storage())
  }
}

fn device_fault(operation: &str, fault: DeviceFault) -> ! {
  log::error!("device fault during counter array {operation}: {fault}");
  panic!("device fault during counter array {operation}: {fault}")
}
