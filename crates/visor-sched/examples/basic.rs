//! Basic single-stage pipeline example
//!
//! This example demonstrates:
//! - Binding a scheduler to the software loopback adapter
//! - Opening, initializing, building and starting one stage
//! - Queueing frames and watching them complete in order
//! - Stopping with a clean drain
//!
//! No hardware is required; the loopback adapter completes every shot
//! after a short latency.
//!
//! Run with: cargo run --example basic

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use visor_hw::{
    BufferConsumer, DoneStatus, LoopbackAdapter, NullVotf, Sensor, Slot, StageId, StreamId,
};
use visor_sched::{GroupInput, GroupManager, SchedConfig};

struct DemoSensor;

impl Sensor for DemoSensor {
    fn current_fcount(&self) -> u32 {
        0
    }
    fn width(&self) -> u32 {
        1920
    }
    fn height(&self) -> u32 {
        1080
    }
    fn is_streaming(&self) -> bool {
        true
    }
}

#[derive(Default)]
struct PrintingConsumer {
    finished: Mutex<Vec<u32>>,
}

impl BufferConsumer for PrintingConsumer {
    fn done(&self, stream: StreamId, stage: StageId, index: u32, status: DoneStatus) {
        println!("  done: stream {stream} stage {stage} frame {index} -> {status:?}");
        self.finished.lock().push(index);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing for debug output
    tracing_subscriber::fmt::init();

    println!("=== visor-sched Basic Example ===\n");

    // Loopback backend: every shot completes after 5 ms
    let (adapter, mut completions) = LoopbackAdapter::new(Duration::from_millis(5));
    let adapter = Arc::new(adapter);
    let consumer = Arc::new(PrintingConsumer::default());

    let config = SchedConfig::builder().asyn_shots(2).sync_shots(0).queue_capacity(8).build();
    println!("Configuration:");
    println!("  Admission budget: {}", config.asyn_shots + config.sync_shots);
    println!("  Queue capacity:   {}\n", config.queue_capacity);

    let manager = GroupManager::new(
        config,
        Arc::clone(&adapter) as Arc<dyn visor_hw::HardwareAdapter>,
        Arc::new(DemoSensor),
        Arc::clone(&consumer) as Arc<dyn BufferConsumer>,
        Arc::new(NullVotf),
    );

    // Forward loopback completions into the scheduler's done entry point
    let pump = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            while let Some(shot) = completions.recv().await {
                let _ = manager.done(shot.stream, shot.stage.slot(), shot.index, DoneStatus::Done);
            }
        })
    };

    // One memory-fed stage
    println!("Opening stage...");
    manager.open(0, Slot::Stat, StageId::new(Slot::Stat, 0))?;
    manager.init(0, Slot::Stat, GroupInput::Memory, true)?;
    manager.build(0)?;
    manager.start(0, Slot::Stat)?;
    println!("Stage started.\n");

    println!("Queueing 5 frames:");
    for index in 0..5 {
        manager.buffer_queue(0, Slot::Stat, index, Default::default())?;
    }
    while consumer.finished.lock().len() < 5 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    println!("\nAll frames completed:");
    println!("  shots issued:   {}", adapter.shots_issued());
    println!("  max in flight:  {}", adapter.max_in_flight());
    let (available, budget) = manager.admission(0, Slot::Stat)?;
    println!("  admission:      {available}/{budget} permits available");

    for index in 0..5 {
        manager.buffer_finish(0, Slot::Stat, index)?;
    }
    println!("  queue counts:   {:?}", manager.queue_counts(0, Slot::Stat)?);

    println!("\nStopping...");
    manager.stop(0, Slot::Stat).await?;
    manager.close(0, Slot::Stat)?;
    pump.abort();
    println!("Stopped clean. Done.");
    Ok(())
}
