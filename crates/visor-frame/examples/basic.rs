//! Basic frame lifecycle example
//!
//! This example demonstrates:
//! - Creating a frame queue with all frames FREE
//! - Walking frames through the four-state lifecycle
//! - Reading per-bucket counts and the finish-time snapshot
//!
//! Run with: cargo run --example basic

use visor_frame::{FrameQueue, FrameState};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing for logging
    tracing_subscriber::fmt::init();

    println!("=== visor-frame Basic Example ===\n");

    // Four frames, all FREE
    let mut queue = FrameQueue::new(0, 4);
    println!("Queue created: {} frames, counts = {:?}\n", queue.capacity(), queue.counts());

    // Queue two frames and dispatch the first
    queue.transition(0, FrameState::Request)?;
    queue.transition(1, FrameState::Request)?;
    queue.transition(0, FrameState::Process)?;
    println!("After queueing 0 and 1, dispatching 0:");
    println!("  counts = {:?}", queue.counts());
    println!("  REQUEST head = frame {:?}", queue.peek(FrameState::Request).map(|f| f.index));
    println!("  PROCESS head = frame {:?}\n", queue.peek(FrameState::Process).map(|f| f.index));

    // Hardware finishes frame 0; the consumer takes it back
    queue.transition(0, FrameState::Complete)?;
    queue.transition(0, FrameState::Free)?;
    println!("Frame 0 completed and finished:");
    println!("  counts = {:?}", queue.counts());
    println!(
        "  snapshot recorded on the frame = {:?}\n",
        queue.frame(0)?.queue_counts
    );

    // Illegal transitions are the fatal class, rejected up front
    let err = queue.transition(1, FrameState::Complete).expect_err("REQUEST -> COMPLETE");
    println!("Illegal transition rejected: {err}");

    queue.check_consistency()?;
    println!("\nQueue consistent. Done.");
    Ok(())
}
