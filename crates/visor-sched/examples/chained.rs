//! Chained two-stage pipeline with sensor synchronization
//!
//! This example demonstrates:
//! - A segment head with an OTF-fed member sharing one transaction
//! - Sensor-synchronized dispatch driven by sensor ticks
//! - The forced drain when the sensor stops before the stream does
//!
//! Run with: cargo run --example chained

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use visor_hw::{
    BufferConsumer, DoneStatus, LoopbackAdapter, NullVotf, Sensor, Slot, StageId, StreamId,
};
use visor_sched::{GroupInput, GroupManager, SchedConfig, SchedError};

struct TickingSensor {
    fcount: AtomicU32,
    streaming: AtomicBool,
}

impl Sensor for TickingSensor {
    fn current_fcount(&self) -> u32 {
        self.fcount.load(Ordering::SeqCst)
    }
    fn width(&self) -> u32 {
        1920
    }
    fn height(&self) -> u32 {
        1080
    }
    fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }
}

struct QuietConsumer;

impl BufferConsumer for QuietConsumer {
    fn done(&self, _stream: StreamId, stage: StageId, index: u32, status: DoneStatus) {
        match status {
            DoneStatus::Done => println!("  frame {index} completed on {stage}"),
            DoneStatus::Error(code) => println!("  frame {index} cancelled on {stage} (code {code})"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("=== visor-sched Chained Example ===\n");

    let (adapter, mut completions) = LoopbackAdapter::new(Duration::from_millis(3));
    let adapter = Arc::new(adapter);
    let sensor = Arc::new(TickingSensor {
        fcount: AtomicU32::new(0),
        streaming: AtomicBool::new(true),
    });

    // No asynchronous slack: every shot waits for its sensor tick.
    let config = SchedConfig::builder().asyn_shots(0).sync_shots(2).build();
    let manager = GroupManager::new(
        config,
        Arc::clone(&adapter) as Arc<dyn visor_hw::HardwareAdapter>,
        Arc::clone(&sensor) as Arc<dyn Sensor>,
        Arc::new(QuietConsumer),
        Arc::new(NullVotf),
    );

    let pump = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            while let Some(shot) = completions.recv().await {
                let _ = manager.done(shot.stream, shot.stage.slot(), shot.index, DoneStatus::Done);
            }
        })
    };

    // Sensor-synchronized head with an OTF member: one hardware
    // transaction covers both stages, dispatched from the head's queue.
    println!("Building Stat -> Isp (OTF) chain...");
    manager.open(0, Slot::Stat, StageId::new(Slot::Stat, 0))?;
    manager.open(0, Slot::Isp, StageId::new(Slot::Isp, 0))?;
    manager.init(0, Slot::Stat, GroupInput::Otf, true)?;
    manager.init(0, Slot::Isp, GroupInput::Otf, false)?;
    manager.build(0)?;
    manager.start(0, Slot::Stat)?;
    manager.start(0, Slot::Isp)?;
    manager.start_stream(0)?;
    println!("Chain started.\n");

    println!("Queueing 4 frames against sensor ticks:");
    for index in 0..4 {
        manager.buffer_queue(0, Slot::Stat, index, Default::default())?;
        let tick = sensor.fcount.fetch_add(1, Ordering::SeqCst) + 1;
        manager.sensor_tick(0, tick);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(30)).await;
    println!("\n  shots issued: {}", adapter.shots_issued());

    // Queue two more, then lose the sensor: the stop protocol must force
    // the parked shots through instead of waiting for ticks.
    println!("\nSensor stops; 2 frames still queued:");
    manager.buffer_queue(0, Slot::Stat, 4, Default::default())?;
    manager.buffer_queue(0, Slot::Stat, 5, Default::default())?;
    sensor.streaming.store(false, Ordering::SeqCst);

    match manager.stop(0, Slot::Stat).await {
        Ok(()) => println!("\nDrain finished with nothing to force."),
        Err(SchedError::DrainTimeout { errors, .. }) => {
            println!("\nDrain forced {errors} time(s); group is stopped and clean.");
        }
        Err(err) => return Err(err.into()),
    }
    println!(
        "  outstanding requests after stop: {}",
        manager.outstanding_requests(0, Slot::Stat)?
    );

    manager.stop_stream(0)?;
    manager.close(0, Slot::Isp)?;
    manager.close(0, Slot::Stat)?;
    pump.abort();
    println!("\nDone.");
    Ok(())
}
