use tally_device_counter::*;
use tally_webgpu::*;

const TASK_COUNT: u32 = 1024;

#[pollster::main]
pub async fn main() -> anyhow::Result<()> {
  env_logger::builder().init();

  let gpu = GPU::new(Default::default()).await?;
  println!("Using {}", gpu.info.describe());

  let mut counter = CounterArray::new(&gpu, 4)?;
  counter.reset();

  // each task bumps counter `task_id % 4`, the returned ticket is its position among the tasks
  // that hit the same counter
  ParallelTaskBuilder::new("modulo-counter")
    .with_bind(&counter.device_access("counter"))
    .with_task_body("  let ticket = counter_increment(task_id % 4u);")
    .dispatch(&gpu, TASK_COUNT)?;

  for count in counter.read_all() {
    println!("{count}");
  }

  counter.release();
  Ok(())
}
