/// Plain copyable name of a device allocation, the wgpu counterpart of a raw device address.
///
/// Copies alias the same device memory. The generation lets the table tell a handle to a
/// released allocation apart from the one that later reuses its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAllocation {
  index: u32,
  generation: u64,
  byte_size: u64,
}

impl DeviceAllocation {
  pub fn byte_size(&self) -> u64 {
    self.byte_size
  }
}

#[derive(thiserror::Error, Debug)]
pub enum GPUAllocationError {
  #[error("can not allocate zero sized device storage")]
  ZeroSized,
  #[error("requested {requested} bytes, the device allows at most {limit} bytes per storage buffer")]
  ExceedLimit { requested: u64, limit: u64 },
  #[error("device is out of memory: {0}")]
  OutOfMemory(String),
  #[error("device rejected the allocation: {0}")]
  Rejected(String),
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("device allocation {0:?} is already released")]
pub struct StaleAllocation(pub DeviceAllocation);

struct DeviceMemorySlot<T> {
  generation: u64,
  byte_size: u64,
  resource: T,
}

pub(crate) struct DeviceMemoryTable<T> {
  slots: slab::Slab<DeviceMemorySlot<T>>,
  next_generation: u64,
  live_bytes: u64,
}

impl<T> Default for DeviceMemoryTable<T> {
  fn default() -> Self {
    Self {
      slots: Default::default(),
      next_generation: 0,
      live_bytes: 0,
    }
  }
}

impl<T> DeviceMemoryTable<T> {
  pub fn insert(&mut self, resource: T, byte_size: u64) -> DeviceAllocation {
    let generation = self.next_generation;
    self.next_generation += 1;
    self.live_bytes += byte_size;

    let index = self.slots.insert(DeviceMemorySlot {
      generation,
      byte_size,
      resource,
    }) as u32;

    DeviceAllocation {
      index,
      generation,
      byte_size,
    }
  }

  pub fn get(&self, allocation: DeviceAllocation) -> Option<&T> {
    self
      .slots
      .get(allocation.index as usize)
      .filter(|slot| slot.generation == allocation.generation)
      .map(|slot| &slot.resource)
  }

  pub fn remove(&mut self, allocation: DeviceAllocation) -> Result<T, StaleAllocation> {
    if self.get(allocation).is_none() {
      return Err(StaleAllocation(allocation));
    }
    let slot = self.slots.remove(allocation.index as usize);
    self.live_bytes -= slot.byte_size;
    Ok(slot.resource)
  }

  pub fn live_count(&self) -> usize {
    self.slots.len()
  }

  pub fn live_bytes(&self) -> u64 {
    self.live_bytes
  }
}
