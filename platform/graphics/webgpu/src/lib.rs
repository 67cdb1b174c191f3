//! A small execution context on top of wgpu: device/queue creation, a device memory table that
//! hands out plain copyable allocation handles, parallel task kernels and blocking read back.

mod device;
mod encoder;
mod memory;
mod parallel;
mod queue;
mod read;

use std::{
  borrow::Cow,
  collections::HashMap,
  hash::{DefaultHasher, Hash, Hasher},
  ops::{Deref, DerefMut},
  sync::Arc,
};

pub use device::*;
pub use encoder::*;
pub use memory::*;
pub use parallel::*;
pub use queue::*;
pub use read::*;
use wgpu as gpu;
// note: we can not just use * because it cause core conflict
pub use gpu::{
  AdapterInfo, Backends, BufferAsyncError, Features, Limits, PollError, PowerPreference,
  RequestAdapterError, RequestDeviceError,
};

#[derive(Clone)]
pub struct GPU {
  _instance: Arc<gpu::Instance>,
  _adaptor: Arc<gpu::Adapter>,
  pub info: GPUInfo,
  pub device: GPUDevice,
  pub queue: GPUQueue,
}

pub struct GPUCreateConfig {
  pub backends: Backends,
  pub power_preference: PowerPreference,
  /// try the software adapter when no hardware adapter is available
  pub allow_fallback_adapter: bool,
  pub minimal_required_features: Features,
  pub minimal_required_limits: Limits,
}

impl Default for GPUCreateConfig {
  fn default() -> Self {
    Self {
      backends: Backends::from_env().unwrap_or(Backends::all()),
      power_preference: PowerPreference::HighPerformance,
      allow_fallback_adapter: true,
      minimal_required_features: Features::empty(),
      minimal_required_limits: Limits::downlevel_defaults(),
    }
  }
}

#[derive(Clone, Debug)]
pub struct GPUInfo {
  pub requested_backend_type: Backends,
  pub power_preference: PowerPreference,
  pub adapter: AdapterInfo,
  pub supported_features: Features,
  pub supported_limits: Limits,
}

impl GPUInfo {
  pub fn describe(&self) -> String {
    format!(
      "{} ({:?}, {:?})",
      self.adapter.name, self.adapter.backend, self.adapter.device_type
    )
  }
}

#[derive(thiserror::Error, Debug)]
pub enum GPUCreateFailure {
  #[error("Failed to request adapter: {0}")]
  AdapterRequestFailed(#[from] RequestAdapterError),
  #[error(
    "Failed to create device because the the adaptor can not meet the minimal feature requirement"
  )]
  UnableToMeetFeatureMinimalRequirement(Features),
  #[error(
    "Failed to create device because the the adaptor can not meet the minimal limit requirement"
  )]
  UnableToMeetLimitMinimalRequirement(Limits),
  #[error("Failed to create device: {0}")]
  DeviceQueueCreateFailed(#[from] RequestDeviceError),
}

async fn request_adapter(
  instance: &gpu::Instance,
  power_preference: PowerPreference,
  force_fallback_adapter: bool,
) -> Result<gpu::Adapter, RequestAdapterError> {
  instance
    .request_adapter(&gpu::RequestAdapterOptions {
      power_preference,
      force_fallback_adapter,
      compatible_surface: None,
    })
    .await
}

impl GPU {
  pub async fn new(config: GPUCreateConfig) -> Result<Self, GPUCreateFailure> {
    let _instance = gpu::Instance::new(&gpu::InstanceDescriptor {
      backends: config.backends,
      ..Default::default()
    });

    let _adaptor = match request_adapter(&_instance, config.power_preference, false).await {
      Ok(adaptor) => adaptor,
      Err(err) if config.allow_fallback_adapter => {
        log::warn!("no hardware adapter available ({err}), requesting the fallback adapter");
        request_adapter(&_instance, config.power_preference, true).await?
      }
      Err(err) => return Err(err.into()),
    };

    let adapter = _adaptor.get_info();
    let supported_features = _adaptor.features();
    let supported_limits = _adaptor.limits();

    if !config
      .minimal_required_limits
      .check_limits(&supported_limits)
    {
      return Err(GPUCreateFailure::UnableToMeetLimitMinimalRequirement(
        supported_limits,
      ));
    }
    if !supported_features.contains(config.minimal_required_features) {
      return Err(GPUCreateFailure::UnableToMeetFeatureMinimalRequirement(
        config.minimal_required_features - supported_features,
      ));
    }

    let (device, queue) = _adaptor
      .request_device(&gpu::DeviceDescriptor {
        label: Some("tally-device"),
        required_features: config.minimal_required_features,
        required_limits: supported_limits.clone(),
        memory_hints: gpu::MemoryHints::Performance,
        ..Default::default()
      })
      .await?;

    let info = GPUInfo {
      requested_backend_type: config.backends,
      power_preference: config.power_preference,
      adapter,
      supported_features,
      supported_limits,
    };
    log::info!("using {}", info.describe());

    Ok(Self {
      _instance: Arc::new(_instance),
      _adaptor: Arc::new(_adaptor),
      info,
      device: GPUDevice::new(device),
      queue: GPUQueue::new(queue),
    })
  }

  pub fn create_encoder(&self) -> GPUCommandEncoder {
    self.device.create_encoder()
  }
}

/// for testing only. returns none when the machine exposes no adapter at all, so device tests
/// can bail out instead of failing on headless machines.
pub async fn test_gpu() -> Option<GPU> {
  match GPU::new(Default::default()).await {
    Ok(gpu) => Some(gpu),
    Err(err) => {
      log::warn!("skip device test, no gpu available: {err}");
      None
    }
  }
}
