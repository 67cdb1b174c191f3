use tally_webgpu::*;

/// Binds a counter array into a parallel task under `name`, making these available to the task
/// body:
///
/// - `<name>_increment(index: u32) -> u32`: atomically add one to counter `index` and return the
///   value it held before. Concurrent callers on the same index each get a distinct ticket in
///   `0..n`. Relaxed ordering, device scope. No bounds check, the caller validates indices when
///   it builds the launch.
/// - `<name>_len() -> u32`: the number of counters.
/// - `<name>_slots`: the raw `array<atomic<u32>>`.
#[derive(Debug, Clone)]
pub struct CounterArrayDeviceAccess {
  name: String,
  storage: DeviceAllocation,
}

impl CounterArrayDeviceAccess {
  pub fn new(name: &str, storage: DeviceAllocation) -> Self {
    assert!(
      is_wgsl_identifier(name),
      "`{name}` can not be used as a shader identifier"
    );
    Self {
      name: name.to_string(),
      storage,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}

impl ShaderBindable for CounterArrayDeviceAccess {
  fn wgsl_declaration(&self, binding: u32) -> String {
    format!(
      "@group(0) @binding({binding}) var<storage, read_write> {name}_slots: array<atomic<u32>>;

fn {name}_increment(index: u32) -> u32 {{
  return atomicAdd(&{name}_slots[index], 1u);
}}

fn {name}_len() -> u32 {{
  return arrayLength(&{name}_slots);
}}
",
      name = self.name
    )
  }

  fn storage(&self) -> DeviceAllocation {
    self.storage
  }
}

fn is_wgsl_identifier(name: &str) -> bool {
  let mut chars = name.chars();
  let head_ok = match chars.next() {
    Some(c) => c.is_ascii_alphabetic() || (c == '_' && name.len() > 1),
    None => false,
  };
  head_ok && !name.starts_with("__") && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[test]
fn identifier_validation() {
  assert!(is_wgsl_identifier("counter"));
  assert!(is_wgsl_identifier("bucket_2"));
  assert!(is_wgsl_identifier("_hits"));
  assert!(!is_wgsl_identifier(""));
  assert!(!is_wgsl_identifier("_"));
  assert!(!is_wgsl_identifier("__reserved"));
  assert!(!is_wgsl_identifier("2d"));
  assert!(!is_wgsl_identifier("with space"));
}
