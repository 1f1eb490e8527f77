//! End-to-end scheduler scenarios against the software loopback adapter
//!
//! Each test builds a real pipeline, runs frames through it, and checks
//! the externally observable contract: completion order, admission
//! balance, forced-drain behavior, and error-path bookkeeping.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use visor_frame::{FrameState, ShotMeta, StripeInfo};
use visor_hw::{
    BufferConsumer, DoneStatus, LoopbackAdapter, NullVotf, Sensor, ShotRequest, Slot, StageId,
    StreamId,
};
use visor_sched::{GroupInput, GroupManager, SchedConfig, SchedError, RESULT_CANCELLED};

// =============================================================================
// HARNESS
// =============================================================================

struct TestSensor {
    fcount: AtomicU32,
    streaming: AtomicBool,
}

impl TestSensor {
    fn streaming() -> Self {
        Self { fcount: AtomicU32::new(0), streaming: AtomicBool::new(true) }
    }

    fn stopped() -> Self {
        Self { fcount: AtomicU32::new(0), streaming: AtomicBool::new(false) }
    }
}

impl Sensor for TestSensor {
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

#[derive(Debug, Clone, Copy)]
struct DoneEvent {
    stream: StreamId,
    index: u32,
    status: DoneStatus,
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<DoneEvent>>,
}

impl Recorder {
    fn count(&self) -> usize {
        self.events.lock().len()
    }

    fn events(&self) -> Vec<DoneEvent> {
        self.events.lock().clone()
    }

    fn for_stream(&self, stream: StreamId) -> Vec<DoneEvent> {
        self.events.lock().iter().copied().filter(|e| e.stream == stream).collect()
    }
}

impl BufferConsumer for Recorder {
    fn done(&self, stream: StreamId, _stage: StageId, index: u32, status: DoneStatus) {
        self.events.lock().push(DoneEvent { stream, index, status });
    }
}

struct Harness {
    manager: Arc<GroupManager>,
    adapter: Arc<LoopbackAdapter>,
    sensor: Arc<TestSensor>,
    recorder: Arc<Recorder>,
    /// (stage, fcount) per accepted shot, in completion order
    shots: Arc<Mutex<Vec<(StageId, u32)>>>,
    _pump: JoinHandle<()>,
}

fn pump(
    manager: &Arc<GroupManager>,
    mut rx: UnboundedReceiver<ShotRequest>,
    shots: Arc<Mutex<Vec<(StageId, u32)>>>,
) -> JoinHandle<()> {
    let weak = Arc::downgrade(manager);
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            shots.lock().push((request.stage, request.fcount));
            let Some(manager) = weak.upgrade() else { break };
            let _ = manager.done(request.stream, request.stage.slot(), request.index, DoneStatus::Done);
        }
    })
}

fn harness(config: SchedConfig, latency: Duration) -> Harness {
    harness_with_sensor(config, latency, TestSensor::streaming())
}

fn harness_with_sensor(config: SchedConfig, latency: Duration, sensor: TestSensor) -> Harness {
    let (adapter, rx) = LoopbackAdapter::new(latency);
    let adapter = Arc::new(adapter);
    let sensor = Arc::new(sensor);
    let recorder = Arc::new(Recorder::default());
    let manager = GroupManager::new(
        config,
        Arc::clone(&adapter) as Arc<dyn visor_hw::HardwareAdapter>,
        Arc::clone(&sensor) as Arc<dyn Sensor>,
        Arc::clone(&recorder) as Arc<dyn BufferConsumer>,
        Arc::new(NullVotf),
    );
    let shots = Arc::new(Mutex::new(Vec::new()));
    let _pump = pump(&manager, rx, Arc::clone(&shots));
    Harness { manager, adapter, sensor, recorder, shots, _pump }
}

async fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    cond()
}

// =============================================================================
// SCENARIOS
// =============================================================================

/// Scenario: a budget of two caps concurrency and five frames complete in
/// queue order; the full queue/finish round trip restores the bucket
/// counts and admission balances out.
#[tokio::test(flavor = "multi_thread")]
async fn test_budget_caps_concurrency_and_orders_completions() {
    let config = SchedConfig::builder().asyn_shots(2).sync_shots(0).build();
    let h = harness(config, Duration::from_millis(5));
    let id = StageId::new(Slot::Stat, 0);

    h.manager.open(0, Slot::Stat, id).expect("open");
    h.manager.init(0, Slot::Stat, GroupInput::Memory, true).expect("init");
    h.manager.build(0).expect("build");
    h.manager.start(0, Slot::Stat).expect("start");

    for index in 0..5 {
        h.manager
            .buffer_queue(0, Slot::Stat, index, ShotMeta::default())
            .expect("queue");
    }

    assert!(
        wait_for(Duration::from_secs(2), || h.recorder.count() == 5).await,
        "five completions expected, saw {}",
        h.recorder.count()
    );

    let events = h.recorder.events();
    let mut indices: Vec<u32> = events.iter().map(|e| e.index).collect();
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    assert!(events.iter().all(|e| !e.status.is_error()));
    assert!(h.adapter.max_in_flight() <= 2, "admission budget exceeded");

    // Dispatch order is the queue order: the stamped sequence runs 1..=5
    // across the frames in index order.
    {
        let group = h.manager.group(0, Slot::Stat).expect("group");
        let queue = group.queue().expect("queue");
        let q = queue.lock();
        for index in 0..5 {
            assert_eq!(q.frame(index).expect("frame").fcount, index + 1);
        }
    }

    // Permit balance: everything acquired came back.
    assert_eq!(h.manager.admission(0, Slot::Stat).expect("admission"), (2, 2));
    let counters = h.manager.group(0, Slot::Stat).expect("group").counters();
    assert_eq!(counters.scount, 5);
    assert_eq!(counters.smp_shot, 2);
    assert_eq!(counters.rcount, 0);

    for index in 0..5 {
        h.manager.buffer_finish(0, Slot::Stat, index).expect("finish");
    }
    let counts = h.manager.queue_counts(0, Slot::Stat).expect("counts");
    assert_eq!(counts.free, h.manager.config().queue_capacity);

    h.manager.stop(0, Slot::Stat).await.expect("clean stop");
}

/// Scenario: stop with three requests parked on the trigger and the
/// sensor reported not-streaming force-completes all of them with error
/// status and zeroes the outstanding-request count. A second stop is a
/// state violation.
#[tokio::test(flavor = "multi_thread")]
async fn test_stop_force_completes_parked_requests() {
    let config = SchedConfig::builder()
        .asyn_shots(0)
        .sync_shots(2)
        .drain_retry(150)
        .drain_escalation(100)
        .build();
    let h = harness(config, Duration::from_millis(5));
    let id = StageId::new(Slot::Stat, 0);

    h.manager.open(0, Slot::Stat, id).expect("open");
    h.manager.init(0, Slot::Stat, GroupInput::Otf, true).expect("init");
    h.manager.build(0).expect("build");
    h.manager.start(0, Slot::Stat).expect("start");

    // No sensor ticks ever arrive: every shot parks on the trigger.
    for index in 0..3 {
        h.manager
            .buffer_queue(0, Slot::Stat, index, ShotMeta::default())
            .expect("queue");
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.adapter.shots_issued(), 0, "nothing should dispatch without the sensor");

    // The sensor goes away before stop: the drain must force the trigger
    // immediately rather than waiting out the escalation window.
    h.sensor.streaming.store(false, Ordering::SeqCst);

    let err = h.manager.stop(0, Slot::Stat).await.expect_err("forced drain reports");
    assert!(matches!(err, SchedError::DrainTimeout { errors, .. } if errors >= 1));

    let events = h.recorder.events();
    assert_eq!(events.len(), 3);
    assert!(events
        .iter()
        .all(|e| e.status == DoneStatus::Error(RESULT_CANCELLED)));
    assert_eq!(h.manager.outstanding_requests(0, Slot::Stat).expect("rcount"), 0);

    let counts = h.manager.queue_counts(0, Slot::Stat).expect("counts");
    assert_eq!(counts.request, 0);
    assert_eq!(counts.complete, 3);

    let err = h.manager.stop(0, Slot::Stat).await.expect_err("double stop");
    assert!(matches!(err, SchedError::StateViolation { .. }));
}

/// Before the sensor starts streaming, the first init shots of a
/// synchronized stage self-advance the frame counter instead of waiting
/// for a trigger that cannot arrive yet.
#[tokio::test(flavor = "multi_thread")]
async fn test_bootstrap_dispatches_before_sensor_streams() {
    let config = SchedConfig::builder().asyn_shots(1).sync_shots(2).build();
    let h = harness_with_sensor(config, Duration::from_millis(3), TestSensor::stopped());
    let id = StageId::new(Slot::Stat, 0);

    h.manager.open(0, Slot::Stat, id).expect("open");
    h.manager.init(0, Slot::Stat, GroupInput::Otf, true).expect("init");
    h.manager.build(0).expect("build");
    h.manager.start(0, Slot::Stat).expect("start");

    // init budget is asyn + sync = 3: all three run without a single tick.
    for index in 0..3 {
        h.manager
            .buffer_queue(0, Slot::Stat, index, ShotMeta::default())
            .expect("queue");
    }

    assert!(
        wait_for(Duration::from_secs(2), || h.recorder.count() == 3).await,
        "bootstrap shots expected to complete, saw {}",
        h.recorder.count()
    );
    assert_eq!(h.adapter.shots_issued(), 3);
    assert!(h.recorder.events().iter().all(|e| !e.status.is_error()));

    // The self-advanced sequence lands on the frames in queue order.
    {
        let group = h.manager.group(0, Slot::Stat).expect("group");
        let queue = group.queue().expect("queue");
        let q = queue.lock();
        for index in 0..3 {
            assert_eq!(q.frame(index).expect("frame").fcount, index + 1);
        }
    }

    assert_eq!(h.manager.admission(0, Slot::Stat).expect("admission"), (3, 3));
    h.manager.stop(0, Slot::Stat).await.expect("clean stop");
}

/// Scenario: a buffered head claims its peer-input member's admission for
/// the whole transaction, so another stream sharing the member's physical
/// stage blocks until the first transaction completes.
#[tokio::test(flavor = "multi_thread")]
async fn test_downstream_blocks_until_upstream_completion() {
    let config = SchedConfig::builder().asyn_shots(1).sync_shots(0).build();
    let h = harness(config, Duration::from_millis(80));
    let isp = StageId::new(Slot::Isp, 0);

    // Stream 0: Stat (buffered head) with an OTF Isp member.
    h.manager.open(0, Slot::Stat, StageId::new(Slot::Stat, 0)).expect("open stat");
    h.manager.open(0, Slot::Isp, isp).expect("open isp member");
    h.manager.init(0, Slot::Stat, GroupInput::Memory, true).expect("init stat");
    h.manager.init(0, Slot::Isp, GroupInput::Otf, false).expect("init isp");
    h.manager.build(0).expect("build 0");

    // Stream 1: its own head bound to the same physical Isp stage.
    h.manager.open(1, Slot::Isp, isp).expect("open shared isp");
    h.manager.init(1, Slot::Isp, GroupInput::Memory, true).expect("init shared");
    h.manager.build(1).expect("build 1");

    h.manager.start(0, Slot::Stat).expect("start stat");
    h.manager.start(0, Slot::Isp).expect("start isp");
    h.manager.start(1, Slot::Isp).expect("start shared");

    h.manager.buffer_queue(0, Slot::Stat, 0, ShotMeta::default()).expect("queue upstream");
    assert!(
        wait_for(Duration::from_millis(200), || h.adapter.shots_issued() == 1).await,
        "upstream shot should dispatch"
    );

    h.manager.buffer_queue(1, Slot::Isp, 0, ShotMeta::default()).expect("queue downstream");
    tokio::time::sleep(Duration::from_millis(25)).await;
    assert_eq!(
        h.adapter.shots_issued(),
        1,
        "downstream must wait for the upstream transaction"
    );

    // Upstream completion releases the member permit.
    assert!(
        wait_for(Duration::from_secs(2), || h.recorder.for_stream(1).len() == 1).await,
        "downstream completion expected"
    );
    assert_eq!(h.adapter.shots_issued(), 2);
    assert!(h.recorder.for_stream(1).iter().all(|e| !e.status.is_error()));
    assert_eq!(h.manager.admission(1, Slot::Isp).expect("admission"), (1, 1));
}

/// Scenario: a shot parked on admission when stop arrives ends as a
/// Complete-with-error frame, and no permit leaks.
#[tokio::test(flavor = "multi_thread")]
async fn test_interrupted_admission_completes_with_error() {
    let config = SchedConfig::builder()
        .asyn_shots(1)
        .sync_shots(0)
        .drain_retry(150)
        .drain_escalation(100)
        .build();
    // Latency long enough that frame 0 is still in flight when the drain
    // gives up waiting for it.
    let h = harness(config, Duration::from_millis(800));
    let id = StageId::new(Slot::Stat, 0);

    h.manager.open(0, Slot::Stat, id).expect("open");
    h.manager.init(0, Slot::Stat, GroupInput::Memory, true).expect("init");
    h.manager.build(0).expect("build");
    h.manager.start(0, Slot::Stat).expect("start");

    // Frame 0 takes the only permit; frame 1 parks on admission.
    h.manager.buffer_queue(0, Slot::Stat, 0, ShotMeta::default()).expect("queue 0");
    h.manager.buffer_queue(0, Slot::Stat, 1, ShotMeta::default()).expect("queue 1");
    assert!(
        wait_for(Duration::from_millis(200), || h.adapter.shots_issued() == 1).await,
        "first frame dispatches"
    );

    let err = h.manager.stop(0, Slot::Stat).await.expect_err("residual work reported");
    assert!(matches!(err, SchedError::DrainTimeout { .. }));

    // The interrupted frame was cancelled during the drain; the in-flight
    // one completes normally once the loopback latency elapses.
    assert!(
        wait_for(Duration::from_secs(3), || h.recorder.count() == 2).await,
        "both frames reach the consumer"
    );
    let events = h.recorder.events();
    let frame1 = events.iter().find(|e| e.index == 1).expect("frame 1 event");
    assert_eq!(frame1.status, DoneStatus::Error(RESULT_CANCELLED));
    let frame0 = events.iter().find(|e| e.index == 0).expect("frame 0 event");
    assert!(!frame0.status.is_error());

    // The held permit came back with the completion; the interrupted
    // wait released nothing it did not own.
    assert_eq!(h.manager.admission(0, Slot::Stat).expect("admission"), (1, 1));
    let counters = h.manager.group(0, Slot::Stat).expect("group").counters();
    assert_eq!(counters.smp_shot, 1);
}

/// Scenario: two streams share one physical stage. One stream's forced
/// drain escalates while the other stream has a frame in flight and a
/// frame parked on admission; the escalation wake must not cancel the
/// healthy stream's parked frame.
#[tokio::test(flavor = "multi_thread")]
async fn test_stop_on_shared_stage_leaves_other_stream_running() {
    let config = SchedConfig::builder()
        .asyn_shots(1)
        .sync_shots(0)
        .drain_retry(40)
        .drain_escalation(20)
        .build();
    // Latency long enough that stream 1's first frame is still in flight
    // for the whole of stream 0's drain.
    let h = harness(config, Duration::from_millis(600));
    let isp = StageId::new(Slot::Isp, 0);

    h.manager.open(0, Slot::Isp, isp).expect("open 0");
    h.manager.init(0, Slot::Isp, GroupInput::Memory, true).expect("init 0");
    h.manager.build(0).expect("build 0");
    h.manager.open(1, Slot::Isp, isp).expect("open 1");
    h.manager.init(1, Slot::Isp, GroupInput::Memory, true).expect("init 1");
    h.manager.build(1).expect("build 1");
    h.manager.start(0, Slot::Isp).expect("start 0");
    h.manager.start(1, Slot::Isp).expect("start 1");

    // Stream 1 frame 0 takes the only permit; frame 1 parks on admission.
    h.manager.buffer_queue(1, Slot::Isp, 0, ShotMeta::default()).expect("queue 1/0");
    h.manager.buffer_queue(1, Slot::Isp, 1, ShotMeta::default()).expect("queue 1/1");
    assert!(
        wait_for(Duration::from_millis(200), || h.adapter.shots_issued() == 1).await,
        "stream 1 frame 0 dispatches"
    );
    h.manager.buffer_queue(0, Slot::Isp, 0, ShotMeta::default()).expect("queue 0/0");

    // Stream 0 cannot drain while stream 1 holds the stage: its frame is
    // force-completed and the drain reports.
    let err = h.manager.stop(0, Slot::Isp).await.expect_err("forced drain reports");
    assert!(matches!(err, SchedError::DrainTimeout { stream: 0, .. }));

    // Stream 1 is untouched: both frames complete clean once the latency
    // elapses and the permit comes back.
    assert!(
        wait_for(Duration::from_secs(5), || h.recorder.for_stream(1).len() == 2).await,
        "stream 1 completions expected, saw {:?}",
        h.recorder.for_stream(1)
    );
    assert!(
        h.recorder.for_stream(1).iter().all(|e| !e.status.is_error()),
        "stream 1 must not see cancellations: {:?}",
        h.recorder.for_stream(1)
    );

    let stopped = h.recorder.for_stream(0);
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].status, DoneStatus::Error(RESULT_CANCELLED));

    assert_eq!(h.adapter.shots_issued(), 2, "only stream 1's frames dispatch");
    assert_eq!(h.manager.admission(1, Slot::Isp).expect("admission"), (1, 1));

    h.manager.buffer_finish(1, Slot::Isp, 0).expect("finish 0");
    h.manager.buffer_finish(1, Slot::Isp, 1).expect("finish 1");
    h.manager.stop(1, Slot::Isp).await.expect("clean stop");
}

/// Invariant: a sensor-synchronized stage's frame count never decreases,
/// with or without explicit sensor ticks.
#[tokio::test(flavor = "multi_thread")]
async fn test_synchronized_fcount_never_regresses() {
    let config = SchedConfig::builder().asyn_shots(2).sync_shots(2).build();
    let h = harness(config, Duration::from_millis(3));
    let id = StageId::new(Slot::Stat, 0);

    h.manager.open(0, Slot::Stat, id).expect("open");
    h.manager.init(0, Slot::Stat, GroupInput::Otf, true).expect("init");
    h.manager.build(0).expect("build");
    h.manager.start(0, Slot::Stat).expect("start");

    for index in 0..4 {
        h.manager
            .buffer_queue(0, Slot::Stat, index, ShotMeta::default())
            .expect("queue");
        h.sensor.fcount.fetch_add(1, Ordering::SeqCst);
        h.manager.sensor_tick(0, h.sensor.fcount.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(
        wait_for(Duration::from_secs(2), || h.recorder.count() == 4).await,
        "four completions expected"
    );
    let fcounts: Vec<u32> = h.shots.lock().iter().map(|&(_, fcount)| fcount).collect();
    assert_eq!(fcounts.len(), 4);
    assert!(
        fcounts.windows(2).all(|w| w[0] <= w[1]),
        "fcount regressed: {fcounts:?}"
    );

    h.manager.stop(0, Slot::Stat).await.expect("clean stop");
}

/// A stripe pass left on a completed frame re-triggers dispatch for the
/// same frame instead of finishing it.
#[tokio::test(flavor = "multi_thread")]
async fn test_stripe_retrigger_runs_second_pass() {
    let config = SchedConfig::builder().asyn_shots(1).sync_shots(0).build();
    let h = harness(config, Duration::from_millis(30));
    let id = StageId::new(Slot::Stat, 0);

    h.manager.open(0, Slot::Stat, id).expect("open");
    h.manager.init(0, Slot::Stat, GroupInput::Memory, true).expect("init");
    h.manager.build(0).expect("build");
    h.manager.start(0, Slot::Stat).expect("start");

    h.manager.buffer_queue(0, Slot::Stat, 0, ShotMeta::default()).expect("queue");
    assert!(
        wait_for(Duration::from_millis(200), || h.adapter.shots_issued() == 1).await,
        "first pass dispatches"
    );

    // Mark a two-region stripe while the first pass is in flight.
    {
        let group = h.manager.group(0, Slot::Stat).expect("group");
        let queue = group.queue().expect("queue");
        let mut q = queue.lock();
        q.frame_mut(0).expect("frame").stripe = StripeInfo { region_num: 2, region_id: 0 };
    }

    assert!(
        wait_for(Duration::from_secs(2), || h.recorder.count() == 1).await,
        "one completion after both passes"
    );
    assert_eq!(h.adapter.shots_issued(), 2, "second stripe pass expected");
    assert_eq!(h.manager.outstanding_requests(0, Slot::Stat).expect("rcount"), 0);

    let group = h.manager.group(0, Slot::Stat).expect("group");
    let queue = group.queue().expect("queue");
    assert_eq!(queue.lock().frame(0).expect("frame").state(), FrameState::Complete);

    h.manager.buffer_finish(0, Slot::Stat, 0).expect("finish");
    h.manager.stop(0, Slot::Stat).await.expect("clean stop");
}
