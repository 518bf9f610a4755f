//! Session controller, the control-plane actor.
//!
//! All mutable session fields live in one `SessionState` owned by the actor
//! lock. Every command handler holds that lock for its whole run, so handlers
//! are serialized and never observe each other's partial mutations. Readers
//! (`status`, `is_active`) never take it: each handler publishes a
//! `Published` copy under a short std lock before any slow work, so a query
//! answers at once even while a bounded stop is in progress. Workers see
//! neither: they only get the `ChannelContext` handed to them at spawn.

use crate::arbiter::CameraArbiter;
use crate::calibration::{CalibrationMachine, TrainingCounts};
use crate::channels::{
    run_camera_view, run_fitting, ChannelContext, Prepared, SessionClock, SignalSpec,
    CALIBRATION_CONSUMER, VIEW_CONSUMER,
};
use crate::events::{AcquisitionEvent, EventBus};
use crate::sink::{CsvSinkFactory, SinkFactory, SinkHandle};
use crate::source::Collaborators;
use crate::workers::WorkerManager;
use crate::lock;
use aurabridge_core::{
    CalibrationState, CameraConfig, Error, Result, SessionConfig, SignalKind, WorkerConfig,
    WorkerStatus,
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// Worker name of the gaze fitting loop.
pub const FITTING_WORKER: &str = "gaze_calibration";

/// Worker name of the live camera view.
pub const VIEW_WORKER: &str = "camera_view";

/// Settings the controller needs at construction.
#[derive(Clone, Debug, Default)]
pub struct ControllerConfig {
    pub session: SessionConfig,
    pub workers: WorkerConfig,
    pub camera: CameraConfig,
}

/// Check that a participant name is a single path component. Returns it trimmed.
pub fn validate_participant(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(Error::invalid_params(
            "update_participant_name",
            format!("invalid participant name: {:?}", name),
        ));
    }
    Ok(name)
}

/// Result of a stop request.
#[derive(Clone, Debug, Default, Serialize)]
pub struct StopReport {
    /// `false` when there was nothing to stop.
    pub was_active: bool,
    pub stopped: Vec<String>,
    pub files: Vec<PathBuf>,
    pub duration_secs: Option<f64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct WorkerInfo {
    pub name: String,
    pub status: WorkerStatus,
}

/// Snapshot answered by the `status` command.
#[derive(Clone, Debug, Serialize)]
pub struct SessionStatus {
    pub active: bool,
    pub session_id: Option<String>,
    pub started_at: Option<String>,
    pub elapsed_secs: Option<f64>,
    pub participant: String,
    pub output_root: PathBuf,
    pub enabled: Vec<SignalKind>,
    pub workers: Vec<WorkerInfo>,
    pub zombies: Vec<String>,
    pub calibration: CalibrationState,
    pub camera_open: bool,
    pub camera_consumers: Vec<String>,
}

/// A started channel: its worker, its sink and the camera consumer it holds.
struct RunningChannel {
    worker: String,
    sink: SinkHandle,
    camera_consumer: Option<&'static str>,
}

struct SessionState {
    active: bool,
    clock: Option<SessionClock>,
    session_id: Option<String>,
    started_at: Option<DateTime<Utc>>,
    output_root: PathBuf,
    participant: String,
    enabled: BTreeSet<SignalKind>,
    running: Vec<RunningChannel>,
    training: Vec<RunningChannel>,
    eye_gaze: bool,
    camera_view: bool,
}

/// Session fields visible to readers without the actor lock.
#[derive(Clone, Default)]
struct Published {
    active: bool,
    clock: Option<SessionClock>,
    session_id: Option<String>,
    started_at: Option<DateTime<Utc>>,
    participant: String,
    output_root: PathBuf,
    enabled: Vec<SignalKind>,
}

impl SessionState {
    fn published(&self) -> Published {
        Published {
            active: self.active,
            clock: self.clock,
            session_id: self.session_id.clone(),
            started_at: self.started_at,
            participant: self.participant.clone(),
            output_root: self.output_root.clone(),
            enabled: self.enabled.iter().copied().collect(),
        }
    }

    fn participant_dir(&self) -> PathBuf {
        self.output_root.join(&self.participant)
    }

    fn collected_dir(&self) -> PathBuf {
        self.participant_dir().join("collected")
    }

    fn training_dir(&self) -> PathBuf {
        self.participant_dir().join("training")
    }
}

pub struct SessionController {
    state: tokio::sync::Mutex<SessionState>,
    view: Mutex<Published>,
    workers: Arc<WorkerManager>,
    arbiter: Arc<CameraArbiter>,
    calibration: Arc<CalibrationMachine>,
    collaborators: Collaborators,
    sinks: Arc<dyn SinkFactory>,
    events: EventBus,
    config: WorkerConfig,
    shut_down: AtomicBool,
}

impl SessionController {
    pub fn new(config: ControllerConfig, collaborators: Collaborators) -> Self {
        let events = EventBus::default();
        let arbiter = Arc::new(CameraArbiter::new(
            collaborators.camera.clone(),
            &config.camera,
        ));
        let state = SessionState {
            active: false,
            clock: None,
            session_id: None,
            started_at: None,
            output_root: config.session.output_root.clone(),
            participant: config.session.participant.clone(),
            enabled: BTreeSet::new(),
            running: Vec::new(),
            training: Vec::new(),
            eye_gaze: false,
            camera_view: false,
        };
        Self {
            view: Mutex::new(state.published()),
            state: tokio::sync::Mutex::new(state),
            workers: Arc::new(WorkerManager::with_events(events.clone())),
            arbiter,
            calibration: Arc::new(CalibrationMachine::new(events.clone())),
            collaborators,
            sinks: Arc::new(CsvSinkFactory),
            events,
            config: config.workers,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Replace the sink factory (tests inject failing or in-memory sinks).
    pub fn with_sink_factory(mut self, sinks: Arc<dyn SinkFactory>) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn workers(&self) -> &Arc<WorkerManager> {
        &self.workers
    }

    pub fn arbiter(&self) -> &Arc<CameraArbiter> {
        &self.arbiter
    }

    pub fn calibration(&self) -> &Arc<CalibrationMachine> {
        &self.calibration
    }

    pub async fn is_active(&self) -> bool {
        lock(&self.view).active
    }

    fn publish(&self, state: &SessionState) {
        *lock(&self.view) = state.published();
    }

    /// Reject commands that would start work after shutdown began.
    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(Error::Internal("controller is shut down".into()));
        }
        Ok(())
    }

    // ========================================================================
    // Settings
    // ========================================================================

    /// Enable or disable a signal for the next session.
    pub async fn update_signal_enabled(&self, kind: SignalKind, enabled: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.active {
            return Err(Error::SessionActive);
        }
        if enabled {
            state.enabled.insert(kind);
        } else {
            state.enabled.remove(&kind);
        }
        self.publish(&state);
        info!(signal = %kind, enabled, "Signal toggled");
        Ok(())
    }

    pub async fn enabled_signals(&self) -> Vec<SignalKind> {
        self.state.lock().await.enabled.iter().copied().collect()
    }

    pub async fn update_output_path(&self, path: PathBuf) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.active {
            return Err(Error::SessionActive);
        }
        info!(path = %path.display(), "Output root changed");
        state.output_root = path;
        self.publish(&state);
        Ok(())
    }

    /// Switch to a new participant: stops any running session and training,
    /// drops calibration, then sets the name.
    pub async fn update_participant(&self, name: &str) -> Result<()> {
        let name = validate_participant(name)?;
        let mut state = self.state.lock().await;
        let mut zombies = Vec::new();
        if let Err(Error::ShutdownTimeout { names }) = self.stop_locked(&mut state).await {
            zombies.extend(names);
        }
        zombies.extend(self.stop_calibration_locked(&mut state).await);
        state.participant = name.to_string();
        self.publish(&state);
        info!(participant = %name, "Participant changed");
        if zombies.is_empty() {
            Ok(())
        } else {
            Err(Error::ShutdownTimeout { names: zombies })
        }
    }

    // ========================================================================
    // Collection
    // ========================================================================

    /// Start a session with every enabled signal. On any failure everything
    /// started by this call is torn down and the failing signal is reported.
    pub async fn start_collection(&self) -> Result<SessionStatus> {
        let mut state = self.state.lock().await;
        self.ensure_running()?;
        if state.active {
            return Err(Error::AlreadyActive);
        }

        validate_participant(&state.participant)?;
        let collected = state.collected_dir();
        std::fs::create_dir_all(&collected)?;
        std::fs::create_dir_all(state.training_dir())?;

        let clock = SessionClock::start();
        state.active = true;
        state.clock = Some(clock);
        let ctx = self.context(clock);

        if state.enabled.is_empty() {
            warn!("Starting a session with no signals enabled");
        }

        let kinds: Vec<SignalKind> = state.enabled.iter().copied().collect();
        let mut started = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let spec = SignalSpec::get(kind);
            let path = collected.join(spec.file_name(&state.participant));
            let launched = match spec.prepare(&ctx) {
                Ok(prepared) => {
                    self.launch(prepared, &path, spec.worker_name(), spec.camera_consumer)
                        .await
                }
                Err(e) => Err(e),
            };
            match launched {
                Ok(channel) => started.push(channel),
                Err(e) => {
                    error!(signal = %kind, error = %e, "Signal failed to start, rolling back");
                    let zombies = self.teardown(started).await;
                    if !zombies.is_empty() {
                        error!(workers = ?zombies, "Rollback left workers running");
                    }
                    state.active = false;
                    state.clock = None;
                    self.publish(&state);
                    return Err(Error::signal_start_failed(kind, e));
                }
            }
        }

        state.running = started;
        state.session_id = Some(uuid::Uuid::new_v4().to_string());
        state.started_at = Some(Utc::now());
        self.publish(&state);
        info!(
            session = ?state.session_id,
            participant = %state.participant,
            signals = state.running.len(),
            "Collection started"
        );
        self.events.emit(AcquisitionEvent::Session {
            active: true,
            participant: state.participant.clone(),
            session_id: state.session_id.clone(),
        });
        drop(state);
        Ok(self.snapshot().await)
    }

    /// Stop the session. Stopping an inactive session succeeds and does nothing.
    pub async fn stop_collection(&self) -> Result<StopReport> {
        let mut state = self.state.lock().await;
        self.stop_locked(&mut state).await
    }

    async fn stop_locked(&self, state: &mut SessionState) -> Result<StopReport> {
        if !state.active && state.running.is_empty() {
            return Ok(StopReport::default());
        }
        state.active = false;
        let duration_secs = state.clock.take().map(|c| c.now());
        let channels = std::mem::take(&mut state.running);
        let session_id = state.session_id.take();
        state.started_at = None;
        self.publish(state);

        let stopped: Vec<String> = channels.iter().map(|c| c.worker.clone()).collect();
        let files: Vec<PathBuf> = channels.iter().map(|c| c.sink.path().to_path_buf()).collect();
        let zombies = self.teardown(channels).await;

        info!(session = ?session_id, duration_secs, "Collection stopped");
        self.events.emit(AcquisitionEvent::Session {
            active: false,
            participant: state.participant.clone(),
            session_id,
        });

        if !zombies.is_empty() {
            return Err(Error::ShutdownTimeout { names: zombies });
        }
        Ok(StopReport {
            was_active: true,
            stopped,
            files,
            duration_secs,
        })
    }

    // ========================================================================
    // Calibration
    // ========================================================================

    /// Begin a calibration cycle: hold the camera and fit the gaze estimator.
    pub async fn start_eye_gaze(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_running()?;
        if state.active && state.enabled.contains(&SignalKind::Gaze) {
            return Err(Error::SessionActive);
        }
        self.calibration.begin_fitting()?;

        if let Err(e) = self.arbiter.register_consumer(CALIBRATION_CONSUMER).await {
            self.calibration.reset();
            return Err(e);
        }
        state.eye_gaze = true;

        let ctx = self.context(SessionClock::start());
        let timeout = self.config.fitting_timeout();
        let spawned = (self.collaborators.gaze)()
            .map_err(|e| Error::source_failure(SignalKind::Gaze, e.to_string()))
            .and_then(|estimator| {
                self.workers.spawn(FITTING_WORKER, move |stop| {
                    run_fitting(ctx, estimator, stop, timeout)
                })
            });
        if let Err(e) = spawned {
            self.arbiter.unregister_consumer(CALIBRATION_CONSUMER).await;
            state.eye_gaze = false;
            self.calibration.reset();
            return Err(e);
        }
        info!("Eye gaze fitting started");
        Ok(())
    }

    /// Abandon calibration: stop fitting and training, release the camera.
    pub async fn stop_eye_gaze(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.active && state.enabled.contains(&SignalKind::Gaze) {
            return Err(Error::SessionActive);
        }
        let zombies = self.stop_calibration_locked(&mut state).await;
        if zombies.is_empty() {
            Ok(())
        } else {
            Err(Error::ShutdownTimeout { names: zombies })
        }
    }

    async fn stop_calibration_locked(&self, state: &mut SessionState) -> Vec<String> {
        let mut zombies = self.teardown(std::mem::take(&mut state.training)).await;
        if !self
            .workers
            .stop(FITTING_WORKER, self.config.stop_timeout())
            .await
        {
            zombies.push(FITTING_WORKER.to_string());
        }
        if state.eye_gaze {
            self.arbiter.unregister_consumer(CALIBRATION_CONSUMER).await;
            state.eye_gaze = false;
        }
        self.calibration.reset();
        zombies
    }

    /// Start recording `(gaze, target)` pairs. Requires `Calibrated`.
    pub async fn start_training_collection(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_running()?;
        let current = self.calibration.state();
        if current != CalibrationState::Calibrated {
            return Err(Error::NotCalibrated { state: current });
        }

        validate_participant(&state.participant)?;
        let dir = state.training_dir();
        std::fs::create_dir_all(&dir)?;
        let ctx = self.context(SessionClock::start());

        let mut kinds = vec![SignalKind::Gaze];
        if state.enabled.contains(&SignalKind::Aura) {
            kinds.insert(0, SignalKind::Aura);
        }

        let mut started = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let spec = SignalSpec::get(kind);
            let path = dir.join(spec.file_name(&state.participant));
            let launched = match spec.prepare_training(&ctx) {
                Some(Ok(prepared)) => {
                    self.launch(prepared, &path, spec.training_worker_name(), None)
                        .await
                }
                Some(Err(e)) => Err(e),
                None => continue,
            };
            match launched {
                Ok(channel) => started.push(channel),
                Err(e) => {
                    error!(signal = %kind, error = %e, "Training channel failed to start");
                    self.teardown(started).await;
                    return Err(Error::signal_start_failed(kind, e));
                }
            }
        }

        if let Err(e) = self.calibration.begin_training_collection() {
            self.teardown(started).await;
            return Err(e);
        }
        state.training = started;
        info!("Training data collection started");
        Ok(())
    }

    /// Stop recording and fit the regression on a blocking thread. On failure
    /// calibration falls back to `Calibrated`.
    pub async fn stop_training_collection(&self) -> Result<TrainingCounts> {
        let mut state = self.state.lock().await;
        let current = self.calibration.state();
        if current != CalibrationState::CollectingTrainingData {
            return Err(Error::NotCalibrated { state: current });
        }

        let zombies = self.teardown(std::mem::take(&mut state.training)).await;
        let counts = self.calibration.end_training_collection()?;
        if !zombies.is_empty() {
            self.calibration.fail_training();
            return Err(Error::ShutdownTimeout { names: zombies });
        }

        let path = state
            .training_dir()
            .join(SignalSpec::get(SignalKind::Gaze).file_name(&state.participant));
        let factory = self.collaborators.regressor.clone();
        info!(
            collected = counts.collected,
            discarded = counts.discarded,
            path = %path.display(),
            "Training gaze regression"
        );
        let trained = tokio::task::spawn_blocking(move || {
            let mut regressor = factory();
            regressor.train_from_file(&path).map(|_| regressor)
        })
        .await;

        match trained {
            Ok(Ok(regressor)) => {
                self.calibration.finish_training(Arc::from(regressor))?;
                Ok(counts)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Gaze regression training failed");
                self.calibration.fail_training();
                Err(match e {
                    e @ Error::TrainingFailed(_) => e,
                    other => Error::TrainingFailed(other.to_string()),
                })
            }
            Err(join) => {
                error!(error = %join, "Training task aborted");
                self.calibration.fail_training();
                Err(Error::TrainingFailed(join.to_string()))
            }
        }
    }

    /// Set the on-screen point the participant is looking at.
    pub fn set_coordinates(&self, x: f64, y: f64) -> bool {
        self.calibration.set_target(x, y)
    }

    // ========================================================================
    // Camera view
    // ========================================================================

    pub async fn view_camera(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_running()?;
        if state.camera_view {
            return Err(Error::already_running(VIEW_WORKER));
        }
        self.arbiter.register_consumer(VIEW_CONSUMER).await?;
        let arbiter = self.arbiter.clone();
        let events = self.events.clone();
        if let Err(e) = self.workers.spawn(VIEW_WORKER, move |stop| {
            run_camera_view(arbiter, events, stop)
        }) {
            self.arbiter.unregister_consumer(VIEW_CONSUMER).await;
            return Err(e);
        }
        state.camera_view = true;
        Ok(())
    }

    /// Stop the live view. Does nothing if it is not running.
    pub async fn stop_camera_view(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.camera_view {
            return Ok(());
        }
        let stopped = self
            .workers
            .stop(VIEW_WORKER, self.config.stop_timeout())
            .await;
        self.arbiter.unregister_consumer(VIEW_CONSUMER).await;
        state.camera_view = false;
        if stopped {
            Ok(())
        } else {
            Err(Error::ShutdownTimeout {
                names: vec![VIEW_WORKER.to_string()],
            })
        }
    }

    // ========================================================================
    // Status and shutdown
    // ========================================================================

    /// Current status. Never waits on a running command.
    pub async fn status(&self) -> SessionStatus {
        self.snapshot().await
    }

    async fn snapshot(&self) -> SessionStatus {
        let state = lock(&self.view).clone();
        SessionStatus {
            active: state.active,
            session_id: state.session_id.clone(),
            started_at: state.started_at.map(|t| t.to_rfc3339()),
            elapsed_secs: state.clock.map(|c| c.now()),
            participant: state.participant.clone(),
            output_root: state.output_root.clone(),
            enabled: state.enabled,
            workers: self
                .workers
                .list()
                .into_iter()
                .map(|(name, status)| WorkerInfo { name, status })
                .collect(),
            zombies: self.workers.zombies(),
            calibration: self.calibration.state(),
            camera_open: self.arbiter.is_open().await,
            camera_consumers: self.arbiter.consumers().await,
        }
    }

    /// Stop everything and release the camera. Runs once; later calls return
    /// immediately.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Shutting down acquisition");
        let timeout = self.config.stop_timeout();
        let mut zombies = BTreeSet::new();
        {
            let mut state = self.state.lock().await;
            if let Err(Error::ShutdownTimeout { names }) = self.stop_locked(&mut state).await {
                zombies.extend(names);
            }
            zombies.extend(self.teardown(std::mem::take(&mut state.training)).await);
            state.eye_gaze = false;
            state.camera_view = false;
        }
        self.calibration.reset();
        if !self.workers.stop_all(timeout).await {
            zombies.extend(self.workers.zombies());
        }
        self.arbiter.shutdown().await;
        if zombies.is_empty() {
            info!("Acquisition shut down cleanly");
            Ok(())
        } else {
            error!(workers = ?zombies, "Shutdown left workers running");
            Err(Error::ShutdownTimeout {
                names: zombies.into_iter().collect(),
            })
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn context(&self, clock: SessionClock) -> ChannelContext {
        ChannelContext {
            clock,
            arbiter: self.arbiter.clone(),
            calibration: self.calibration.clone(),
            collaborators: self.collaborators.clone(),
            events: self.events.clone(),
            poll_interval: self.config.poll_interval(),
        }
    }

    /// Register the camera consumer (if any), open the sink, spawn the worker.
    /// Undoes its own partial work on failure.
    async fn launch(
        &self,
        prepared: Prepared,
        path: &Path,
        worker: String,
        camera_consumer: Option<&'static str>,
    ) -> Result<RunningChannel> {
        if let Some(id) = camera_consumer {
            self.arbiter.register_consumer(id).await?;
        }
        let sink = match self.open_sink(path, &prepared.header) {
            Ok(sink) => sink,
            Err(e) => {
                if let Some(id) = camera_consumer {
                    self.arbiter.unregister_consumer(id).await;
                }
                return Err(e);
            }
        };
        let task = prepared.task;
        let task_sink = sink.clone();
        if let Err(e) = self
            .workers
            .spawn(&worker, move |stop| task(task_sink, stop))
        {
            if let Err(close) = sink.close() {
                warn!(path = %path.display(), error = %close, "Failed to close sink");
            }
            if let Some(id) = camera_consumer {
                self.arbiter.unregister_consumer(id).await;
            }
            return Err(e);
        }
        Ok(RunningChannel {
            worker,
            sink,
            camera_consumer,
        })
    }

    fn open_sink(&self, path: &Path, header: &[String]) -> Result<SinkHandle> {
        let sink = SinkHandle::new(self.sinks.create(path, header)?);
        sink.open()?;
        Ok(sink)
    }

    /// Stop channels concurrently, close their sinks and release their camera
    /// consumers. Returns the workers that did not stop in time.
    async fn teardown(&self, channels: Vec<RunningChannel>) -> Vec<String> {
        let timeout = self.config.stop_timeout();
        let results = join_all(
            channels
                .iter()
                .map(|channel| self.workers.stop(&channel.worker, timeout)),
        )
        .await;

        let mut zombies = Vec::new();
        for (channel, stopped) in channels.iter().zip(results) {
            if !stopped {
                zombies.push(channel.worker.clone());
            }
            if let Err(e) = channel.sink.close() {
                warn!(worker = %channel.worker, error = %e, "Failed to close sink");
            }
            if let Some(id) = channel.camera_consumer {
                self.arbiter.unregister_consumer(id).await;
            }
        }
        zombies
    }
}
