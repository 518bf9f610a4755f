//! Signal channels: one producer loop per signal kind.
//!
//! Each loop pulls from its source on the blocking pool, stamps rows with session-relative seconds
//! (rounded to milliseconds, never negative, never decreasing), writes to its
//! sink, and sleeps `poll_interval` between iterations. The sleep is raced
//! against the stop token, so `poll_interval` bounds stop latency. Every loop
//! holds a close-on-drop guard: its sink is closed on every exit path.
//!
//! [`SignalSpec`] is the table from kind to source setup, sink header and task,
//! so the session controller never branches on the kind itself.

use crate::arbiter::{CameraArbiter, Frame};
use crate::calibration::CalibrationMachine;
use crate::events::{AcquisitionEvent, EventBus};
use crate::sink::{Field, SinkHandle};
use crate::source::{
    Collaborators, EegStream, EmotionClassifier, GazeEstimator, KeyboardSource, PointerSource,
    ScreenSource,
};
use crate::workers::TaskFuture;
use aurabridge_core::{CalibrationState, Error, Result, SignalKind};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Columns of the gaze training file.
pub const TRAINING_GAZE_HEADER: [&str; 8] = ["l_x", "l_y", "l_z", "r_x", "r_y", "r_z", "x", "y"];

/// Camera consumer id of the calibration and training loops.
pub const CALIBRATION_CONSUMER: &str = "gaze_calibration";

/// Camera consumer id of the live view.
pub const VIEW_CONSUMER: &str = "camera_view";

/// Round seconds to millisecond precision.
pub fn round_ms(secs: f64) -> f64 {
    (secs * 1000.0).round() / 1000.0
}

/// Shared time base of one session.
#[derive(Clone, Copy, Debug)]
pub struct SessionClock {
    start: Instant,
}

impl SessionClock {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn started_at(&self) -> Instant {
        self.start
    }

    /// Seconds since start, unrounded.
    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Seconds since start, rounded to milliseconds.
    pub fn now(&self) -> f64 {
        round_ms(self.elapsed_secs())
    }
}

/// Keeps one stream's timestamps non-negative and non-decreasing.
#[derive(Debug, Default)]
pub struct Monotonic {
    last: f64,
}

impl Monotonic {
    pub fn stamp(&mut self, ts: f64) -> f64 {
        let ts = ts.max(0.0).max(self.last);
        self.last = ts;
        ts
    }
}

/// Everything a channel loop needs besides its source and sink.
#[derive(Clone)]
pub struct ChannelContext {
    pub clock: SessionClock,
    pub arbiter: Arc<CameraArbiter>,
    pub calibration: Arc<CalibrationMachine>,
    pub collaborators: Collaborators,
    pub events: EventBus,
    pub poll_interval: Duration,
}

/// Task body of a channel, given its opened sink and stop token.
pub type ChannelTask = Box<dyn FnOnce(SinkHandle, CancellationToken) -> TaskFuture + Send>;

/// A channel whose source is constructed and ready to run.
pub struct Prepared {
    pub header: Vec<String>,
    pub task: ChannelTask,
}

type PrepareFn = fn(&ChannelContext) -> Result<Prepared>;

/// Table entry for one signal kind.
pub struct SignalSpec {
    pub kind: SignalKind,
    /// Arbiter consumer id for camera-backed kinds.
    pub camera_consumer: Option<&'static str>,
    prepare: PrepareFn,
    prepare_training: Option<PrepareFn>,
}

static AURA: SignalSpec = SignalSpec {
    kind: SignalKind::Aura,
    camera_consumer: None,
    prepare: prepare_aura,
    prepare_training: Some(prepare_aura),
};

static GAZE: SignalSpec = SignalSpec {
    kind: SignalKind::Gaze,
    camera_consumer: Some("gaze"),
    prepare: prepare_gaze,
    prepare_training: Some(prepare_gaze_training),
};

static EMOTION: SignalSpec = SignalSpec {
    kind: SignalKind::Emotion,
    camera_consumer: Some("emotion"),
    prepare: prepare_emotion,
    prepare_training: None,
};

static POINTER: SignalSpec = SignalSpec {
    kind: SignalKind::Pointer,
    camera_consumer: None,
    prepare: prepare_pointer,
    prepare_training: None,
};

static KEYBOARD: SignalSpec = SignalSpec {
    kind: SignalKind::Keyboard,
    camera_consumer: None,
    prepare: prepare_keyboard,
    prepare_training: None,
};

static SCREEN: SignalSpec = SignalSpec {
    kind: SignalKind::Screen,
    camera_consumer: None,
    prepare: prepare_screen,
    prepare_training: None,
};

impl SignalSpec {
    pub fn get(kind: SignalKind) -> &'static SignalSpec {
        match kind {
            SignalKind::Aura => &AURA,
            SignalKind::Gaze => &GAZE,
            SignalKind::Emotion => &EMOTION,
            SignalKind::Pointer => &POINTER,
            SignalKind::Keyboard => &KEYBOARD,
            SignalKind::Screen => &SCREEN,
        }
    }

    pub fn worker_name(&self) -> String {
        self.kind.as_str().to_string()
    }

    pub fn training_worker_name(&self) -> String {
        format!("{}_training", self.kind)
    }

    /// `{participant}_{signal}.csv`
    pub fn file_name(&self, participant: &str) -> String {
        format!("{}_{}.csv", participant, self.kind)
    }

    pub fn has_training(&self) -> bool {
        self.prepare_training.is_some()
    }

    /// Construct the source for a session run.
    pub fn prepare(&self, ctx: &ChannelContext) -> Result<Prepared> {
        (self.prepare)(ctx)
    }

    /// Construct the source for the training variant, if the kind has one.
    pub fn prepare_training(&self, ctx: &ChannelContext) -> Option<Result<Prepared>> {
        self.prepare_training.map(|prepare| prepare(ctx))
    }
}

fn upstream(kind: SignalKind) -> impl Fn(Error) -> Error {
    move |e| match e {
        e @ Error::SourceFailure { .. } => e,
        other => Error::source_failure(kind, other.to_string()),
    }
}

/// Sleep for `interval` unless stopped first. Returns `true` when stopped.
pub async fn pause(stop: &CancellationToken, interval: Duration) -> bool {
    tokio::select! {
        _ = stop.cancelled() => true,
        _ = tokio::time::sleep(interval) => false,
    }
}

/// Run one collaborator call on the blocking pool. Sources block on
/// hardware and inference, so they never run on a runtime worker. The source
/// is moved in and handed back with the result.
async fn offload<S, T, F>(kind: SignalKind, mut source: S, call: F) -> Result<(S, T)>
where
    S: Send + 'static,
    T: Send + 'static,
    F: FnOnce(&mut S) -> Result<T> + Send + 'static,
{
    let (source, out) = tokio::task::spawn_blocking(move || {
        let out = call(&mut source);
        (source, out)
    })
    .await
    .map_err(|e| Error::source_failure(kind, format!("collaborator call aborted: {}", e)))?;
    Ok((source, out.map_err(upstream(kind))?))
}

/// Tracks the last frame a loop consumed so each frame is processed once.
#[derive(Default)]
struct FrameCursor {
    last_seq: Option<u64>,
}

impl FrameCursor {
    fn next(&mut self, arbiter: &CameraArbiter) -> Option<Frame> {
        let frame = arbiter.get_frame()?;
        if self.last_seq == Some(frame.seq) {
            return None;
        }
        self.last_seq = Some(frame.seq);
        Some(frame)
    }
}

// ============================================================================
// Setup
// ============================================================================

fn prepare_aura(ctx: &ChannelContext) -> Result<Prepared> {
    let stream = (ctx.collaborators.eeg)().map_err(upstream(SignalKind::Aura))?;
    let header = std::iter::once("timestamp".to_string())
        .chain(stream.channel_names())
        .collect();
    let ctx = ctx.clone();
    Ok(Prepared {
        header,
        task: Box::new(move |sink, stop| Box::pin(aura_loop(ctx, stream, sink, stop))),
    })
}

fn prepare_gaze(ctx: &ChannelContext) -> Result<Prepared> {
    let state = ctx.calibration.state();
    if state != CalibrationState::Ready {
        return Err(Error::NotCalibrated { state });
    }
    let estimator = (ctx.collaborators.gaze)().map_err(upstream(SignalKind::Gaze))?;
    let ctx = ctx.clone();
    Ok(Prepared {
        header: columns(&["timestamp", "x", "y"]),
        task: Box::new(move |sink, stop| Box::pin(gaze_loop(ctx, estimator, sink, stop))),
    })
}

fn prepare_gaze_training(ctx: &ChannelContext) -> Result<Prepared> {
    let estimator = (ctx.collaborators.gaze)().map_err(upstream(SignalKind::Gaze))?;
    let ctx = ctx.clone();
    Ok(Prepared {
        header: columns(&TRAINING_GAZE_HEADER),
        task: Box::new(move |sink, stop| {
            Box::pin(gaze_training_loop(ctx, estimator, sink, stop))
        }),
    })
}

fn prepare_emotion(ctx: &ChannelContext) -> Result<Prepared> {
    let classifier = (ctx.collaborators.emotion)().map_err(upstream(SignalKind::Emotion))?;
    let ctx = ctx.clone();
    Ok(Prepared {
        header: columns(&["timestamp", "emotion"]),
        task: Box::new(move |sink, stop| Box::pin(emotion_loop(ctx, classifier, sink, stop))),
    })
}

fn prepare_pointer(ctx: &ChannelContext) -> Result<Prepared> {
    let source = (ctx.collaborators.pointer)().map_err(upstream(SignalKind::Pointer))?;
    let ctx = ctx.clone();
    Ok(Prepared {
        header: columns(&["timestamp", "x", "y", "clicked"]),
        task: Box::new(move |sink, stop| Box::pin(pointer_loop(ctx, source, sink, stop))),
    })
}

fn prepare_keyboard(ctx: &ChannelContext) -> Result<Prepared> {
    let source = (ctx.collaborators.keyboard)().map_err(upstream(SignalKind::Keyboard))?;
    let ctx = ctx.clone();
    Ok(Prepared {
        header: columns(&["timestamp", "key", "is_pressed"]),
        task: Box::new(move |sink, stop| Box::pin(keyboard_loop(ctx, source, sink, stop))),
    })
}

fn prepare_screen(ctx: &ChannelContext) -> Result<Prepared> {
    let source = (ctx.collaborators.screen)().map_err(upstream(SignalKind::Screen))?;
    let ctx = ctx.clone();
    Ok(Prepared {
        header: columns(&["timestamp", "frame", "width", "height"]),
        task: Box::new(move |sink, stop| Box::pin(screen_loop(ctx, source, sink, stop))),
    })
}

fn columns(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

// ============================================================================
// Session loops
// ============================================================================

async fn aura_loop(
    ctx: ChannelContext,
    mut stream: Box<dyn EegStream>,
    sink: SinkHandle,
    stop: CancellationToken,
) -> Result<()> {
    let _close = sink.close_on_drop();
    let mut stamps = Monotonic::default();
    let mut rows = 0u64;
    while !stop.is_cancelled() {
        let (returned, pulled) = offload(SignalKind::Aura, stream, |s| {
            if s.is_ready() {
                s.get_data().map(Some)
            } else {
                Ok(None)
            }
        })
        .await?;
        stream = returned;
        if let Some(chunk) = pulled {
            let now = ctx.clock.elapsed_secs();
            let newest = chunk.timestamps.last().copied();
            let aligned = chunk.timestamps.len() == chunk.samples.len();
            for (i, sample) in chunk.samples.iter().enumerate() {
                // Offset each sample back from "now" by its distance to the newest one.
                let ts = match (aligned, newest) {
                    (true, Some(newest)) => now - (newest - chunk.timestamps[i]),
                    _ => now,
                };
                let fields: Vec<Field> = sample.iter().copied().map(Field::Float).collect();
                sink.write(Some(stamps.stamp(round_ms(ts))), &fields)?;
                rows += 1;
            }
        }
        if pause(&stop, ctx.poll_interval).await {
            break;
        }
    }
    debug!(rows, "Aura loop exited");
    Ok(())
}

async fn gaze_loop(
    ctx: ChannelContext,
    mut estimator: Box<dyn GazeEstimator>,
    sink: SinkHandle,
    stop: CancellationToken,
) -> Result<()> {
    let _close = sink.close_on_drop();
    let mut stamps = Monotonic::default();
    let mut frames = FrameCursor::default();
    while !stop.is_cancelled() {
        if let Some(frame) = frames.next(&ctx.arbiter) {
            let (returned, sample) =
                offload(SignalKind::Gaze, estimator, move |e| e.gaze_vector(&frame)).await?;
            estimator = returned;
            if let Some(features) = sample.features() {
                match ctx.calibration.predict(&features) {
                    Ok((x, y)) => {
                        let ts = stamps.stamp(ctx.clock.now());
                        sink.write(Some(ts), &[Field::Float(x), Field::Float(y)])?;
                    }
                    Err(Error::NotCalibrated { state }) => {
                        debug!(%state, "Skipping gaze prediction, calibration not ready");
                    }
                    Err(e) => return Err(upstream(SignalKind::Gaze)(e)),
                }
            }
        }
        if pause(&stop, ctx.poll_interval).await {
            break;
        }
    }
    Ok(())
}

async fn emotion_loop(
    ctx: ChannelContext,
    mut classifier: Box<dyn EmotionClassifier>,
    sink: SinkHandle,
    stop: CancellationToken,
) -> Result<()> {
    let _close = sink.close_on_drop();
    let mut stamps = Monotonic::default();
    let mut frames = FrameCursor::default();
    while !stop.is_cancelled() {
        if let Some(frame) = frames.next(&ctx.arbiter) {
            let (returned, label) = offload(SignalKind::Emotion, classifier, move |c| {
                c.recognize_emotion(&frame)
            })
            .await?;
            classifier = returned;
            if let Some(label) = label {
                let ts = stamps.stamp(ctx.clock.now());
                sink.write(Some(ts), &[Field::Text(label)])?;
            }
        }
        if pause(&stop, ctx.poll_interval).await {
            break;
        }
    }
    Ok(())
}

async fn pointer_loop(
    ctx: ChannelContext,
    mut source: Box<dyn PointerSource>,
    sink: SinkHandle,
    stop: CancellationToken,
) -> Result<()> {
    let _close = sink.close_on_drop();
    let mut stamps = Monotonic::default();
    while !stop.is_cancelled() {
        let (returned, drained) = offload(SignalKind::Pointer, source, |s| s.drain()).await?;
        source = returned;
        for event in drained {
            let ts = stamps.stamp(ctx.clock.now());
            sink.write(
                Some(ts),
                &[
                    Field::Int(event.x),
                    Field::Int(event.y),
                    Field::Bool(event.clicked),
                ],
            )?;
        }
        if pause(&stop, ctx.poll_interval).await {
            break;
        }
    }
    Ok(())
}

async fn keyboard_loop(
    ctx: ChannelContext,
    mut source: Box<dyn KeyboardSource>,
    sink: SinkHandle,
    stop: CancellationToken,
) -> Result<()> {
    let _close = sink.close_on_drop();
    let mut stamps = Monotonic::default();
    while !stop.is_cancelled() {
        let (returned, drained) = offload(SignalKind::Keyboard, source, |s| s.drain()).await?;
        source = returned;
        for event in drained {
            let ts = stamps.stamp(ctx.clock.now());
            sink.write(Some(ts), &[Field::Text(event.key), Field::Bool(event.pressed)])?;
        }
        if pause(&stop, ctx.poll_interval).await {
            break;
        }
    }
    Ok(())
}

async fn screen_loop(
    ctx: ChannelContext,
    mut source: Box<dyn ScreenSource>,
    sink: SinkHandle,
    stop: CancellationToken,
) -> Result<()> {
    let _close = sink.close_on_drop();
    let mut stamps = Monotonic::default();
    while !stop.is_cancelled() {
        let (returned, grabbed) = offload(SignalKind::Screen, source, |s| s.grab()).await?;
        source = returned;
        if let Some(grab) = grabbed {
            let ts = stamps.stamp(ctx.clock.now());
            sink.write(
                Some(ts),
                &[
                    Field::from(grab.frame),
                    Field::Int(grab.width as i64),
                    Field::Int(grab.height as i64),
                ],
            )?;
        }
        if pause(&stop, ctx.poll_interval).await {
            break;
        }
    }
    Ok(())
}

// ============================================================================
// Calibration loops
// ============================================================================

/// Poll the gaze estimator until both eyes are seen, then mark the machine
/// calibrated. A one-eye sample restarts the estimator and fitting continues.
pub async fn run_fitting(
    ctx: ChannelContext,
    mut estimator: Box<dyn GazeEstimator>,
    stop: CancellationToken,
    timeout: Option<Duration>,
) -> Result<()> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut frames = FrameCursor::default();
    let mut restarts = 0u32;
    while !stop.is_cancelled() {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            let message = format!(
                "no two-eye gaze sample within {} ms",
                timeout.unwrap_or_default().as_millis()
            );
            warn!(%message, "Gaze fitting timed out");
            ctx.calibration.reset();
            ctx.events.error(CALIBRATION_CONSUMER, message.clone());
            return Err(Error::source_failure(SignalKind::Gaze, message));
        }
        if let Some(frame) = frames.next(&ctx.arbiter) {
            let (returned, sample) =
                offload(SignalKind::Gaze, estimator, move |e| e.gaze_vector(&frame)).await?;
            estimator = returned;
            if sample.both().is_some() {
                if ctx.calibration.mark_calibrated() {
                    info!(restarts, "Gaze fitted");
                }
                return Ok(());
            }
            if sample.is_partial() {
                restarts += 1;
                debug!(restarts, "Only one eye detected, restarting estimator");
                let (returned, ()) =
                    offload(SignalKind::Gaze, estimator, |e| e.restart()).await?;
                estimator = returned;
            }
        }
        if pause(&stop, ctx.poll_interval).await {
            break;
        }
    }
    Ok(())
}

/// Pair gaze features with the current target. Samples taken while no
/// target is set are counted and dropped.
async fn gaze_training_loop(
    ctx: ChannelContext,
    mut estimator: Box<dyn GazeEstimator>,
    sink: SinkHandle,
    stop: CancellationToken,
) -> Result<()> {
    let _close = sink.close_on_drop();
    let mut frames = FrameCursor::default();
    while !stop.is_cancelled() {
        if let Some(frame) = frames.next(&ctx.arbiter) {
            let (returned, sample) =
                offload(SignalKind::Gaze, estimator, move |e| e.gaze_vector(&frame)).await?;
            estimator = returned;
            if let Some(features) = sample.features() {
                if let Some((x, y)) = ctx.calibration.label_sample() {
                    let mut row: Vec<Field> = features.iter().copied().map(Field::Float).collect();
                    row.push(Field::Float(x));
                    row.push(Field::Float(y));
                    sink.write(None, &row)?;
                }
            }
        }
        if pause(&stop, ctx.poll_interval).await {
            break;
        }
    }
    Ok(())
}

/// Forward every new frame as a push event until stopped.
pub async fn run_camera_view(
    arbiter: Arc<CameraArbiter>,
    events: EventBus,
    stop: CancellationToken,
) -> Result<()> {
    let mut latest = arbiter.subscribe();
    let mut sent = 0u64;
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            changed = latest.changed() => {
                if changed.is_err() {
                    break;
                }
                let frame = latest.borrow_and_update().clone();
                if let Some(frame) = frame {
                    events.emit(AcquisitionEvent::Frame {
                        width: frame.width,
                        height: frame.height,
                        data: frame.data,
                    });
                    sent += 1;
                }
            }
        }
    }
    debug!(frames = sent, "Camera view exited");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{CsvSink, Sink};
    use aurabridge_core::{CameraConfig, SourceConfig};
    use tempfile::TempDir;

    fn context() -> ChannelContext {
        let camera = CameraConfig {
            frame_period_ms: 2,
            ..Default::default()
        };
        let collaborators = Collaborators::simulated(&SourceConfig::default(), &camera);
        let events = EventBus::default();
        ChannelContext {
            clock: SessionClock::start(),
            arbiter: Arc::new(CameraArbiter::new(collaborators.camera.clone(), &camera)),
            calibration: Arc::new(CalibrationMachine::new(events.clone())),
            collaborators,
            events,
            poll_interval: Duration::from_millis(1),
        }
    }

    fn open_sink(dir: &TempDir, name: &str, header: &[String]) -> SinkHandle {
        let mut sink = CsvSink::new(dir.path().join(name), header.to_vec());
        sink.create_new_file().unwrap();
        SinkHandle::new(Box::new(sink))
    }

    #[test]
    fn rounding_and_monotonic_stamps() {
        assert_eq!(round_ms(1.23456), 1.235);
        let mut stamps = Monotonic::default();
        assert_eq!(stamps.stamp(-0.5), 0.0);
        assert_eq!(stamps.stamp(0.2), 0.2);
        assert_eq!(stamps.stamp(0.1), 0.2);
        assert_eq!(stamps.stamp(0.3), 0.3);
    }

    #[test]
    fn table_covers_every_kind() {
        for kind in SignalKind::ALL {
            let spec = SignalSpec::get(kind);
            assert_eq!(spec.kind, kind);
            assert_eq!(spec.camera_consumer.is_some(), kind.uses_camera());
        }
        assert!(SignalSpec::get(SignalKind::Aura).has_training());
        assert!(SignalSpec::get(SignalKind::Gaze).has_training());
        assert!(!SignalSpec::get(SignalKind::Pointer).has_training());
        assert_eq!(
            SignalSpec::get(SignalKind::Gaze).file_name("p01"),
            "p01_gaze.csv"
        );
    }

    #[test]
    fn gaze_prediction_requires_ready() {
        let ctx = context();
        let err = SignalSpec::get(SignalKind::Gaze)
            .prepare(&ctx)
            .err()
            .unwrap();
        assert!(matches!(err, Error::NotCalibrated { .. }));
    }

    #[tokio::test]
    async fn aura_loop_writes_monotonic_rows_and_closes() {
        let dir = TempDir::new().unwrap();
        let ctx = context();
        let prepared = SignalSpec::get(SignalKind::Aura).prepare(&ctx).unwrap();
        assert_eq!(prepared.header.len(), 9);
        let sink = open_sink(&dir, "p_aura.csv", &prepared.header);

        let stop = CancellationToken::new();
        let handle = tokio::spawn((prepared.task)(sink.clone(), stop.clone()));
        tokio::time::sleep(Duration::from_millis(300)).await;
        stop.cancel();
        handle.await.unwrap().unwrap();
        assert!(!sink.is_open());

        let text = std::fs::read_to_string(dir.path().join("p_aura.csv")).unwrap();
        let stamps: Vec<f64> = text
            .lines()
            .skip(1)
            .map(|l| l.split(',').next().unwrap().parse().unwrap())
            .collect();
        assert!(!stamps.is_empty());
        assert!(stamps.iter().all(|t| *t >= 0.0));
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn loop_error_still_closes_sink() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context();
        ctx.collaborators.pointer = Arc::new(|| {
            struct Broken;
            impl PointerSource for Broken {
                fn drain(&mut self) -> Result<Vec<crate::source::PointerEvent>> {
                    Err(Error::Internal("device unplugged".into()))
                }
            }
            Ok(Box::new(Broken) as Box<dyn PointerSource>)
        });
        let prepared = SignalSpec::get(SignalKind::Pointer).prepare(&ctx).unwrap();
        let sink = open_sink(&dir, "p_pointer.csv", &prepared.header);
        let result = (prepared.task)(sink.clone(), CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(Error::SourceFailure {
                signal: SignalKind::Pointer,
                ..
            })
        ));
        assert!(!sink.is_open());
    }

    #[tokio::test]
    async fn fitting_marks_calibrated() {
        let ctx = context();
        ctx.arbiter.register_consumer(CALIBRATION_CONSUMER).await.unwrap();
        ctx.calibration.begin_fitting().unwrap();
        let estimator = (ctx.collaborators.gaze)().unwrap();
        tokio::time::timeout(
            Duration::from_secs(2),
            run_fitting(ctx.clone(), estimator, CancellationToken::new(), None),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(ctx.calibration.state(), CalibrationState::Calibrated);
        ctx.arbiter.shutdown().await;
    }

    #[tokio::test]
    async fn fitting_timeout_resets_to_idle() {
        let ctx = context();
        // No consumer registered: no frames ever arrive.
        ctx.calibration.begin_fitting().unwrap();
        let mut errors = ctx.events.subscribe();
        let estimator = (ctx.collaborators.gaze)().unwrap();
        let result = run_fitting(
            ctx.clone(),
            estimator,
            CancellationToken::new(),
            Some(Duration::from_millis(30)),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(ctx.calibration.state(), CalibrationState::Idle);

        let mut saw_error = false;
        while let Ok(event) = errors.try_recv() {
            if matches!(event, AcquisitionEvent::Error { .. }) {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn camera_view_pushes_frames() {
        let ctx = context();
        let mut rx = ctx.events.subscribe();
        ctx.arbiter.register_consumer(VIEW_CONSUMER).await.unwrap();
        let stop = CancellationToken::new();
        let view = tokio::spawn(run_camera_view(
            ctx.arbiter.clone(),
            ctx.events.clone(),
            stop.clone(),
        ));

        let frame = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Ok(AcquisitionEvent::Frame { width, height, data }) = rx.recv().await {
                    return (width, height, data.len());
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(frame, (64, 48, 64 * 48));

        stop.cancel();
        view.await.unwrap().unwrap();
        ctx.arbiter.shutdown().await;
    }
}
