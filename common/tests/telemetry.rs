use core::sync::atomic::{AtomicBool, Ordering};

use embassy_executor::{Executor, Spawner};
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Instant, Timer};
use static_cell::StaticCell;

use solaris_common::RawMutex;
use solaris_common::fuel_gauge::{ChargerSample, FakeCharger, FuelGauge, RecordingEstimator};
use solaris_common::status::FakeModemInfo;
use solaris_common::telemetry::{
    COMMAND_CHANNEL, SENSOR_PATH, Telemetry, TelemetryCommand, TelemetryConfig,
};
use solaris_common::uplink::{
    CONNECTION_EVENTS, ContentType, PUBLISH_REPORTS, PublishStatus, TxCounters, Uplink,
    publish_report_loop,
};

const LOOP_DELAY: Duration = Duration::from_millis(400);

static CONNECTED: AtomicBool = AtomicBool::new(false);
static PUBLISHES: Channel<RawMutex, (bool, Instant), 8> = Channel::new();
static COUNTERS: TxCounters = TxCounters::new();
static EXECUTOR: StaticCell<Executor> = StaticCell::new();

/// Uplink double that timestamps every submission and completes it right away.
struct TimedUplink {}

impl Uplink for TimedUplink {
    fn is_connected(&self) -> bool {
        CONNECTED.load(Ordering::Acquire)
    }

    async fn publish(
        &mut self,
        path: &str,
        _content_type: ContentType,
        _payload: &[u8],
    ) -> solaris_common::Result<()> {
        PUBLISHES.send((path == SENSOR_PATH, Instant::now())).await;
        PUBLISH_REPORTS.send(PublishStatus::Published).await;
        Ok(())
    }

    async fn reconnect(&mut self) -> solaris_common::Result<()> {
        // Connectivity comes back asynchronously, driven by the main task.
        Ok(())
    }
}

type TestTelemetry = Telemetry<FakeCharger, RecordingEstimator, FakeModemInfo, TimedUplink>;

#[test]
fn telemetry_loop_test() {
    let _ = env_logger::builder().is_test(true).try_init();
    let executor = EXECUTOR.init(Executor::new());
    executor.run(|spawner| {
        spawner.spawn(main(spawner).unwrap());
    });
}

#[embassy_executor::task]
async fn telemetry_task(mut telemetry: TestTelemetry) {
    telemetry.run(0).await;
}

#[embassy_executor::task]
async fn report_task(counters: &'static TxCounters) {
    publish_report_loop(counters).await;
}

#[embassy_executor::task]
async fn main(spawner: Spawner) {
    let sample = ChargerSample {
        voltage: 3.7,
        current: -0.5,
        temperature: 25.0,
        status: 0,
    };
    let mut charger = FakeCharger::new(sample, 0.8);
    let mut estimator = RecordingEstimator {
        charge_pct: 87.5,
        tte: 3600.0,
        ..Default::default()
    };
    let gauge = FuelGauge::init(&mut charger, &mut estimator).await.unwrap();
    let telemetry = Telemetry::new(
        gauge,
        charger,
        estimator,
        FakeModemInfo::new(3600, 23),
        TimedUplink {},
        &COUNTERS,
        TelemetryConfig {
            loop_delay: LOOP_DELAY,
        },
    );

    let start = Instant::now();
    spawner.spawn(telemetry_task(telemetry).unwrap());
    spawner.spawn(report_task(&COUNTERS).unwrap());

    // The loop must wait cooperatively until connectivity is signalled.
    Timer::after_millis(100).await;
    assert!(PUBLISHES.is_empty());
    CONNECTED.store(true, Ordering::Release);
    CONNECTION_EVENTS.signal(true);

    // First the one-shot startup report, then the periodic sensor frames.
    let (sensor, startup_sent) = PUBLISHES.receive().await;
    assert!(!sensor);
    assert!(startup_sent - start >= Duration::from_millis(100));

    let (sensor, first) = PUBLISHES.receive().await;
    assert!(sensor);
    let (sensor, second) = PUBLISHES.receive().await;
    assert!(sensor);
    assert!(second - first >= LOOP_DELAY);

    // Every submission got exactly one completion report.
    Timer::after_millis(50).await;
    assert_eq!(COUNTERS.snapshot(), (3, 0));

    // A loop-delay change wakes the sleeping loop right away.
    COMMAND_CHANNEL
        .send(TelemetryCommand::SetLoopDelay(Duration::from_millis(100)))
        .await;
    let (sensor, third) = PUBLISHES.receive().await;
    assert!(sensor);
    assert!(third - second < LOOP_DELAY);

    std::process::exit(0); // Exit from executor
}
