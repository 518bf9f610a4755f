//! Tests for aurabridge-acquisition: arbiter invariant, session rollback,
//! calibration flow, failure isolation and stop timeouts

use aurabridge_acquisition::arbiter::{CaptureDevice, DeviceOpener, Frame};
use aurabridge_acquisition::sink::CsvSink;
use aurabridge_acquisition::source::{GazeEstimator, PointerEvent, PointerSource};
use aurabridge_acquisition::*;
use aurabridge_core::{CameraConfig, SessionConfig, SourceConfig, WorkerConfig};
use proptest::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn camera_config() -> CameraConfig {
    CameraConfig {
        frame_period_ms: 2,
        join_timeout_ms: 200,
        ..Default::default()
    }
}

fn controller_with(
    dir: &TempDir,
    workers: WorkerConfig,
    collaborators: Collaborators,
) -> SessionController {
    let config = ControllerConfig {
        session: SessionConfig {
            output_root: dir.path().to_path_buf(),
            participant: "p01".into(),
        },
        workers,
        camera: camera_config(),
    };
    SessionController::new(config, collaborators)
}

fn simulated() -> Collaborators {
    Collaborators::simulated(&SourceConfig::default(), &camera_config())
}

fn data_rows(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .skip(1)
        .map(str::to_string)
        .collect()
}

// ===========================================================================
// Shared Device Arbiter
// ===========================================================================

#[derive(Default)]
struct DeviceLedger {
    live: AtomicUsize,
    max_live: AtomicUsize,
    opens: AtomicUsize,
}

struct LedgerOpener(Arc<DeviceLedger>);

struct LedgerDevice(Arc<DeviceLedger>);

impl DeviceOpener for LedgerOpener {
    fn open(&self) -> Result<Box<dyn CaptureDevice>> {
        let live = self.0.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.0.max_live.fetch_max(live, Ordering::SeqCst);
        self.0.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LedgerDevice(self.0.clone())))
    }
}

impl CaptureDevice for LedgerDevice {
    fn read_frame(&mut self) -> Result<Option<Frame>> {
        Ok(Some(Frame::new(1, 1, vec![0])))
    }

    fn release(&mut self) {
        self.0.live.fetch_sub(1, Ordering::SeqCst);
    }
}

const CONSUMERS: [&str; 4] = ["gaze", "emotion", "gaze_calibration", "camera_view"];

#[derive(Clone, Copy, Debug)]
enum ArbiterOp {
    Register(usize),
    Unregister(usize),
    Shutdown,
}

fn arbiter_op() -> impl Strategy<Value = ArbiterOp> {
    prop_oneof![
        6 => (0usize..CONSUMERS.len()).prop_map(ArbiterOp::Register),
        5 => (0usize..CONSUMERS.len()).prop_map(ArbiterOp::Unregister),
        1 => Just(ArbiterOp::Shutdown),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn device_open_iff_consumers_present(
        batches in proptest::collection::vec(proptest::collection::vec(arbiter_op(), 1..8), 1..8)
    ) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let ledger = Arc::new(DeviceLedger::default());
            let arbiter = Arc::new(CameraArbiter::new(
                Arc::new(LedgerOpener(ledger.clone())),
                &camera_config(),
            ));

            // Each batch runs concurrently; the invariant is checked once it settles.
            for batch in batches {
                let tasks: Vec<_> = batch
                    .into_iter()
                    .map(|op| {
                        let arbiter = arbiter.clone();
                        tokio::spawn(async move {
                            match op {
                                ArbiterOp::Register(idx) => {
                                    let _ = arbiter.register_consumer(CONSUMERS[idx]).await;
                                }
                                ArbiterOp::Unregister(idx) => {
                                    arbiter.unregister_consumer(CONSUMERS[idx]).await;
                                }
                                ArbiterOp::Shutdown => arbiter.shutdown().await,
                            }
                        })
                    })
                    .collect();
                for result in futures::future::join_all(tasks).await {
                    result.unwrap();
                }

                let consumers = arbiter.consumer_count().await;
                assert_eq!(arbiter.is_open().await, consumers > 0);
                assert_eq!(ledger.live.load(Ordering::SeqCst), usize::from(consumers > 0));
                assert!(ledger.max_live.load(Ordering::SeqCst) <= 1);
            }

            arbiter.shutdown().await;
            assert_eq!(arbiter.consumer_count().await, 0);
            assert_eq!(ledger.live.load(Ordering::SeqCst), 0);
            assert!(ledger.max_live.load(Ordering::SeqCst) <= 1);
        });
    }
}

#[tokio::test]
async fn arbiter_gaze_then_emotion_scenario() {
    let ledger = Arc::new(DeviceLedger::default());
    let arbiter = CameraArbiter::new(Arc::new(LedgerOpener(ledger.clone())), &camera_config());

    arbiter.register_consumer("gaze").await.unwrap();
    arbiter.register_consumer("emotion").await.unwrap();
    arbiter.unregister_consumer("gaze").await;
    assert!(arbiter.is_open().await);
    assert_eq!(arbiter.consumers().await, vec!["emotion".to_string()]);

    arbiter.unregister_consumer("emotion").await;
    assert!(!arbiter.is_open().await);
    assert_eq!(ledger.opens.load(Ordering::SeqCst), 1);
    assert_eq!(ledger.live.load(Ordering::SeqCst), 0);
}

// ===========================================================================
// Session Controller: start / stop
// ===========================================================================

#[tokio::test]
async fn start_twice_returns_already_active() {
    let dir = TempDir::new().unwrap();
    let c = controller_with(&dir, WorkerConfig::default(), simulated());
    c.update_signal_enabled(SignalKind::Aura, true).await.unwrap();
    c.update_signal_enabled(SignalKind::Pointer, true).await.unwrap();
    let first = c.start_collection().await.unwrap();

    let err = c.start_collection().await.unwrap_err();
    assert!(matches!(err, Error::AlreadyActive));
    assert_eq!(err.kind(), "already_active");

    assert!(c.workers().is_running("aura"));
    assert!(c.workers().is_running("pointer"));
    assert_eq!(c.status().await.session_id, first.session_id);
    c.stop_collection().await.unwrap();
}

/// Counts opens and closes per sink; fails creating the n-th sink.
struct TrackingFactory {
    fail_on: usize,
    created: AtomicUsize,
    log: Arc<Mutex<Vec<(PathBuf, usize, usize)>>>,
}

struct TrackingSink {
    inner: CsvSink,
    index: usize,
    log: Arc<Mutex<Vec<(PathBuf, usize, usize)>>>,
}

impl Sink for TrackingSink {
    fn create_new_file(&mut self) -> Result<()> {
        self.log.lock().unwrap()[self.index].1 += 1;
        self.inner.create_new_file()
    }

    fn write(&mut self, timestamp: Option<f64>, fields: &[Field]) -> Result<()> {
        self.inner.write(timestamp, fields)
    }

    fn close_file(&mut self) -> Result<()> {
        if self.inner.is_open() {
            self.log.lock().unwrap()[self.index].2 += 1;
        }
        self.inner.close_file()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn path(&self) -> &Path {
        self.inner.path()
    }
}

impl SinkFactory for TrackingFactory {
    fn create(&self, path: &Path, header: &[String]) -> Result<Box<dyn Sink>> {
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fail_on {
            return Err(Error::Sink(format!("disk full creating {}", path.display())));
        }
        let mut log = self.log.lock().unwrap();
        log.push((path.to_path_buf(), 0, 0));
        Ok(Box::new(TrackingSink {
            inner: CsvSink::new(path, header.to_vec()),
            index: log.len() - 1,
            log: self.log.clone(),
        }))
    }
}

#[tokio::test]
async fn failed_third_signal_rolls_back_everything() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let c = controller_with(&dir, WorkerConfig::default(), simulated()).with_sink_factory(
        Arc::new(TrackingFactory {
            fail_on: 3,
            created: AtomicUsize::new(0),
            log: log.clone(),
        }),
    );
    for kind in [
        SignalKind::Aura,
        SignalKind::Pointer,
        SignalKind::Keyboard,
        SignalKind::Screen,
    ] {
        c.update_signal_enabled(kind, true).await.unwrap();
    }

    let err = c.start_collection().await.unwrap_err();
    match &err {
        Error::SignalStartFailed { signal, source } => {
            assert_eq!(*signal, SignalKind::Keyboard);
            assert!(matches!(**source, Error::Sink(_)));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(err.to_string().contains("keyboard"));

    assert_eq!(c.workers().live_count(), 0);
    assert!(c.workers().names().is_empty());
    assert!(!c.is_active().await);

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 2);
    for (path, opens, closes) in log.iter() {
        assert_eq!((*opens, *closes), (1, 1), "sink {} not closed once", path.display());
    }

    // The controller is usable again after the rollback.
    drop(log);
    c.update_signal_enabled(SignalKind::Keyboard, false).await.unwrap();
}

#[tokio::test]
async fn timestamps_are_monotonic_and_non_negative() {
    let dir = TempDir::new().unwrap();
    let c = controller_with(&dir, WorkerConfig::default(), simulated());
    c.update_signal_enabled(SignalKind::Aura, true).await.unwrap();
    c.update_signal_enabled(SignalKind::Pointer, true).await.unwrap();
    c.update_signal_enabled(SignalKind::Screen, true).await.unwrap();
    c.start_collection().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let report = c.stop_collection().await.unwrap();
    assert_eq!(report.files.len(), 3);

    for file in &report.files {
        let stamps: Vec<f64> = data_rows(file)
            .iter()
            .map(|row| row.split(',').next().unwrap().parse().unwrap())
            .collect();
        assert!(stamps.iter().all(|t| *t >= 0.0), "{}", file.display());
        assert!(
            stamps.windows(2).all(|w| w[0] <= w[1]),
            "{} not monotonic",
            file.display()
        );
    }
}

// ===========================================================================
// Failure isolation and timeouts
// ===========================================================================

struct BrokenPointer;

impl PointerSource for BrokenPointer {
    fn drain(&mut self) -> Result<Vec<PointerEvent>> {
        Err(Error::Internal("mouse hook lost".into()))
    }
}

#[tokio::test]
async fn failing_source_is_isolated() {
    let dir = TempDir::new().unwrap();
    let mut collaborators = simulated();
    collaborators.pointer = Arc::new(|| Ok(Box::new(BrokenPointer) as Box<dyn PointerSource>));
    let c = controller_with(&dir, WorkerConfig::default(), collaborators);
    let mut events = c.events().subscribe();

    c.update_signal_enabled(SignalKind::Pointer, true).await.unwrap();
    c.update_signal_enabled(SignalKind::Aura, true).await.unwrap();
    c.start_collection().await.unwrap();

    let failed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(AcquisitionEvent::Worker {
                name,
                status: WorkerStatus::Failed,
                message,
                ..
            }) = events.recv().await
            {
                return (name, message);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(failed.0, "pointer");
    assert!(failed.1.unwrap().contains("mouse hook lost"));

    assert!(c.workers().is_running("aura"));
    assert_eq!(c.workers().status("pointer"), Some(WorkerStatus::Failed));
    let report = c.stop_collection().await.unwrap();
    assert_eq!(report.stopped.len(), 2);
}

struct StalledPointer;

impl PointerSource for StalledPointer {
    fn drain(&mut self) -> Result<Vec<PointerEvent>> {
        std::thread::sleep(Duration::from_millis(400));
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn stalled_worker_surfaces_shutdown_timeout() {
    let dir = TempDir::new().unwrap();
    let mut collaborators = simulated();
    collaborators.pointer = Arc::new(|| Ok(Box::new(StalledPointer) as Box<dyn PointerSource>));
    let workers = WorkerConfig {
        stop_timeout_ms: 50,
        ..Default::default()
    };
    let c = controller_with(&dir, workers, collaborators);
    c.update_signal_enabled(SignalKind::Pointer, true).await.unwrap();
    c.start_collection().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The stalled read runs off the runtime, so the bounded stop returns on time
    // even on a single-threaded runtime.
    let started = Instant::now();
    let err = c.stop_collection().await.unwrap_err();
    assert!(started.elapsed() < Duration::from_millis(300));
    match err {
        Error::ShutdownTimeout { names } => assert_eq!(names, vec!["pointer".to_string()]),
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(!c.is_active().await);
    assert_eq!(c.status().await.zombies, vec!["pointer".to_string()]);

    // The zombie blocks reuse of its name until it exits.
    let restart = c.start_collection().await.unwrap_err();
    assert!(matches!(restart, Error::SignalStartFailed { .. }));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(c.workers().zombies().is_empty());
    c.start_collection().await.unwrap();

    // Shutdown still completes and reports the stalled worker.
    let err = c.shutdown().await.unwrap_err();
    assert!(matches!(err, Error::ShutdownTimeout { .. }));
    assert!(!c.arbiter().is_open().await);
}

// ===========================================================================
// Calibration flow
// ===========================================================================

/// One eye for the first `partial` samples of each instance, then both eyes
/// with features that vary per sample.
struct ScriptedGaze {
    partial: usize,
    calls: usize,
    restarts: Arc<AtomicUsize>,
}

impl GazeEstimator for ScriptedGaze {
    fn gaze_vector(&mut self, _frame: &Frame) -> Result<GazeSample> {
        self.calls += 1;
        if self.calls <= self.partial {
            return Ok(GazeSample::new(Some([0.1, 0.2, -1.0]), None));
        }
        let t = self.calls as f64;
        let left = [(t * 0.31).sin(), (t * 0.17).cos(), -1.0 + (t * 0.05).sin() * 0.1];
        let right = [(t * 0.23).cos(), (t * 0.41).sin(), -1.0 + (t * 0.07).cos() * 0.1];
        Ok(GazeSample::new(Some(left), Some(right)))
    }

    fn restart(&mut self) -> Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn scripted(partial: usize) -> (Collaborators, Arc<AtomicUsize>) {
    let restarts = Arc::new(AtomicUsize::new(0));
    let mut collaborators = simulated();
    let counter = restarts.clone();
    collaborators.gaze = Arc::new(move || {
        Ok(Box::new(ScriptedGaze {
            partial,
            calls: 0,
            restarts: counter.clone(),
        }) as Box<dyn GazeEstimator>)
    });
    (collaborators, restarts)
}

#[tokio::test]
async fn training_before_calibration_is_rejected() {
    let dir = TempDir::new().unwrap();
    let c = controller_with(&dir, WorkerConfig::default(), simulated());
    let err = c.start_training_collection().await.unwrap_err();
    assert!(matches!(
        err,
        Error::NotCalibrated {
            state: CalibrationState::Idle
        }
    ));
    assert!(err.to_string().contains("not calibrated"));
}

#[tokio::test]
async fn full_calibration_flow_reaches_prediction() {
    let dir = TempDir::new().unwrap();
    let (collaborators, restarts) = scripted(3);
    let c = controller_with(&dir, WorkerConfig::default(), collaborators);

    c.start_eye_gaze().await.unwrap();
    assert!(matches!(
        c.start_eye_gaze().await,
        Err(Error::AlreadyCalibrating { .. })
    ));
    assert!(
        c.calibration()
            .wait_for(CalibrationState::Calibrated, Duration::from_secs(2))
            .await
    );
    assert_eq!(restarts.load(Ordering::SeqCst), 3);

    c.start_training_collection().await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    c.set_coordinates(100.0, 200.0);
    tokio::time::sleep(Duration::from_millis(150)).await;
    c.set_coordinates(800.0, 600.0);
    tokio::time::sleep(Duration::from_millis(150)).await;
    let counts = c.stop_training_collection().await.unwrap();
    assert!(counts.collected >= 8, "collected {}", counts.collected);
    assert!(counts.discarded >= 1, "discarded {}", counts.discarded);
    assert_eq!(c.calibration().state(), CalibrationState::Ready);

    let history = c.calibration().history();
    for pair in history.windows(2) {
        assert_eq!(pair[0].next(), Some(pair[1]), "history {:?}", history);
    }

    let training = dir.path().join("p01/training/p01_gaze.csv");
    let rows = data_rows(&training);
    assert_eq!(rows.len() as u64, counts.collected);
    assert!(rows.iter().all(|r| r.split(',').count() == 8));

    c.update_signal_enabled(SignalKind::Gaze, true).await.unwrap();
    c.start_collection().await.unwrap();
    assert!(matches!(c.stop_eye_gaze().await, Err(Error::SessionActive)));
    tokio::time::sleep(Duration::from_millis(150)).await;
    c.stop_collection().await.unwrap();
    let predicted = data_rows(&dir.path().join("p01/collected/p01_gaze.csv"));
    assert!(!predicted.is_empty());
    assert!(predicted.iter().all(|r| r.split(',').count() == 3));

    c.stop_eye_gaze().await.unwrap();
    assert_eq!(c.calibration().state(), CalibrationState::Idle);
    assert!(!c.arbiter().is_open().await);
}

#[tokio::test]
async fn too_few_training_samples_fall_back_to_calibrated() {
    let dir = TempDir::new().unwrap();
    let (collaborators, _) = scripted(0);
    let c = controller_with(&dir, WorkerConfig::default(), collaborators);
    c.start_eye_gaze().await.unwrap();
    assert!(
        c.calibration()
            .wait_for(CalibrationState::Calibrated, Duration::from_secs(2))
            .await
    );

    c.start_training_collection().await.unwrap();
    let err = c.stop_training_collection().await.unwrap_err();
    assert!(matches!(err, Error::TrainingFailed(_)));
    assert_eq!(err.kind(), "training_failed");
    assert_eq!(c.calibration().state(), CalibrationState::Calibrated);

    // More samples can be collected after a failed fit.
    c.start_training_collection().await.unwrap();
    c.stop_eye_gaze().await.unwrap();
}

#[tokio::test]
async fn new_participant_resets_session_and_calibration() {
    let dir = TempDir::new().unwrap();
    let (collaborators, _) = scripted(0);
    let c = controller_with(&dir, WorkerConfig::default(), collaborators);
    c.update_signal_enabled(SignalKind::Keyboard, true).await.unwrap();
    c.start_eye_gaze().await.unwrap();
    c.calibration()
        .wait_for(CalibrationState::Calibrated, Duration::from_secs(2))
        .await;
    c.start_collection().await.unwrap();

    c.update_participant("p02").await.unwrap();
    let status = c.status().await;
    assert!(!status.active);
    assert_eq!(status.participant, "p02");
    assert_eq!(status.calibration, CalibrationState::Idle);
    assert!(!status.camera_open);

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["calibration"], "idle");
    assert_eq!(json["enabled"][0], "keyboard");
}
