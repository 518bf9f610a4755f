//! Simulated collaborators so the service runs without hardware.
//!
//! Everything here is synthetic but behaves like the real producers: the
//! camera emits frames, the EEG stream becomes ready at its sample rate, and
//! input sources yield bursts of events. [`LinearRegressor`] is a real
//! least-squares fit and is used as the default gaze regression.

use crate::arbiter::{CaptureDevice, DeviceOpener, Frame};
use crate::source::{
    aura_channel_names, Collaborators, EegChunk, EegStream, EmotionClassifier, GazeEstimator,
    GazeSample, KeyEvent, KeyboardSource, PointerEvent, PointerSource, Regressor, ScreenGrab,
    ScreenSource,
};
use aurabridge_core::{CameraConfig, Error, Result, SourceConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Minimum rows needed to fit the gaze regression.
pub const MIN_TRAINING_SAMPLES: usize = 8;

impl Collaborators {
    /// Wire every collaborator to its simulated implementation.
    pub fn simulated(sources: &SourceConfig, camera: &CameraConfig) -> Self {
        let channels = sources.aura_channels;
        let chunk = sources.aura_chunk.max(1);
        let rate = sources.aura_rate_hz;
        Self {
            camera: Arc::new(SyntheticCameraOpener::new(camera)),
            gaze: Arc::new(|| Ok(Box::new(SimulatedGaze::new()) as Box<dyn GazeEstimator>)),
            emotion: Arc::new(|| Ok(Box::new(SimulatedEmotion) as Box<dyn EmotionClassifier>)),
            eeg: Arc::new(move || {
                Ok(Box::new(SimulatedEeg::new(channels, chunk, rate)) as Box<dyn EegStream>)
            }),
            pointer: Arc::new(|| Ok(Box::new(SimulatedPointer::new()) as Box<dyn PointerSource>)),
            keyboard: Arc::new(|| {
                Ok(Box::new(SimulatedKeyboard::new()) as Box<dyn KeyboardSource>)
            }),
            screen: Arc::new(|| {
                Ok(Box::new(SimulatedScreen::new(1920, 1080, Duration::from_millis(100)))
                    as Box<dyn ScreenSource>)
            }),
            regressor: Arc::new(|| Box::new(LinearRegressor::default()) as Box<dyn Regressor>),
        }
    }
}

// ============================================================================
// Camera
// ============================================================================

pub struct SyntheticCameraOpener {
    device_index: u32,
    width: u32,
    height: u32,
}

impl SyntheticCameraOpener {
    pub fn new(config: &CameraConfig) -> Self {
        Self {
            device_index: config.device_index,
            width: config.width.max(1),
            height: config.height.max(1),
        }
    }
}

impl DeviceOpener for SyntheticCameraOpener {
    fn open(&self) -> Result<Box<dyn CaptureDevice>> {
        info!(device = self.device_index, "Opening synthetic capture device");
        Ok(Box::new(SyntheticCamera {
            width: self.width,
            height: self.height,
            tick: 0,
        }))
    }
}

/// Produces a moving gradient.
pub struct SyntheticCamera {
    width: u32,
    height: u32,
    tick: u64,
}

impl CaptureDevice for SyntheticCamera {
    fn read_frame(&mut self) -> Result<Option<Frame>> {
        self.tick = self.tick.wrapping_add(1);
        let (w, h) = (self.width as u64, self.height as u64);
        let data = (0..h)
            .flat_map(|y| (0..w).map(move |x| (x, y)))
            .map(|(x, y)| ((x + y + self.tick) % 256) as u8)
            .collect();
        Ok(Some(Frame::new(self.width, self.height, data)))
    }

    fn release(&mut self) {
        debug!(frames = self.tick, "Synthetic capture device released");
    }
}

// ============================================================================
// Camera-backed estimators
// ============================================================================

pub struct SimulatedGaze {
    rng: StdRng,
}

impl SimulatedGaze {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }
}

impl Default for SimulatedGaze {
    fn default() -> Self {
        Self::new()
    }
}

impl GazeEstimator for SimulatedGaze {
    fn gaze_vector(&mut self, frame: &Frame) -> Result<GazeSample> {
        let phase = frame.seq as f64 / 30.0;
        let mut eye = |offset: f64| {
            [
                phase.sin() * 0.2 + offset + self.rng.gen_range(-0.01..0.01),
                phase.cos() * 0.1 + self.rng.gen_range(-0.01..0.01),
                -1.0 + self.rng.gen_range(-0.01..0.01),
            ]
        };
        let left = eye(-0.03);
        let right = eye(0.03);
        Ok(GazeSample::new(Some(left), Some(right)))
    }

    fn restart(&mut self) -> Result<()> {
        Ok(())
    }
}

const EMOTIONS: [&str; 5] = ["neutral", "happy", "surprise", "neutral", "sad"];

pub struct SimulatedEmotion;

impl EmotionClassifier for SimulatedEmotion {
    fn recognize_emotion(&mut self, frame: &Frame) -> Result<Option<String>> {
        let idx = (frame.seq / 30) as usize % EMOTIONS.len();
        Ok(Some(EMOTIONS[idx].to_string()))
    }
}

// ============================================================================
// EEG
// ============================================================================

/// Emits `chunk` samples every `chunk / rate` seconds.
pub struct SimulatedEeg {
    names: Vec<String>,
    chunk: usize,
    period: Duration,
    started: Instant,
    last_pull: Instant,
    sent: u64,
    rate: f64,
    rng: StdRng,
}

impl SimulatedEeg {
    pub fn new(channels: usize, chunk: usize, rate_hz: f64) -> Self {
        let rate = if rate_hz > 0.0 { rate_hz } else { 256.0 };
        let now = Instant::now();
        Self {
            names: aura_channel_names(channels),
            chunk,
            period: Duration::from_secs_f64(chunk as f64 / rate),
            started: now,
            last_pull: now,
            sent: 0,
            rate,
            rng: StdRng::from_entropy(),
        }
    }
}

impl EegStream for SimulatedEeg {
    fn channel_names(&self) -> Vec<String> {
        self.names.clone()
    }

    fn is_ready(&mut self) -> bool {
        self.last_pull.elapsed() >= self.period
    }

    fn get_data(&mut self) -> Result<EegChunk> {
        self.last_pull = Instant::now();
        let base = self.started.elapsed().as_secs_f64();
        let mut chunk = EegChunk::default();
        for i in 0..self.chunk {
            let t = self.sent as f64 / self.rate;
            chunk
                .timestamps
                .push(base - (self.chunk - 1 - i) as f64 / self.rate);
            chunk.samples.push(
                (0..self.names.len())
                    .map(|c| (t * (8.0 + c as f64)).sin() * 20.0 + self.rng.gen_range(-1.0..1.0))
                    .collect(),
            );
            self.sent += 1;
        }
        Ok(chunk)
    }
}

// ============================================================================
// Input devices and screen
// ============================================================================

pub struct SimulatedPointer {
    rng: StdRng,
    x: i64,
    y: i64,
}

impl SimulatedPointer {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
            x: 960,
            y: 540,
        }
    }
}

impl Default for SimulatedPointer {
    fn default() -> Self {
        Self::new()
    }
}

impl PointerSource for SimulatedPointer {
    fn drain(&mut self) -> Result<Vec<PointerEvent>> {
        let count = self.rng.gen_range(0..3);
        let mut events = Vec::with_capacity(count);
        for _ in 0..count {
            self.x = (self.x + self.rng.gen_range(-15..=15)).clamp(0, 1919);
            self.y = (self.y + self.rng.gen_range(-15..=15)).clamp(0, 1079);
            events.push(PointerEvent {
                x: self.x,
                y: self.y,
                clicked: self.rng.gen_bool(0.05),
            });
        }
        Ok(events)
    }
}

pub struct SimulatedKeyboard {
    rng: StdRng,
    held: Option<char>,
}

impl SimulatedKeyboard {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
            held: None,
        }
    }
}

impl Default for SimulatedKeyboard {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyboardSource for SimulatedKeyboard {
    fn drain(&mut self) -> Result<Vec<KeyEvent>> {
        if !self.rng.gen_bool(0.02) {
            return Ok(Vec::new());
        }
        Ok(match self.held.take() {
            Some(key) => vec![KeyEvent {
                key: key.to_string(),
                pressed: false,
            }],
            None => {
                let key = self.rng.gen_range(b'a'..=b'z') as char;
                self.held = Some(key);
                vec![KeyEvent {
                    key: key.to_string(),
                    pressed: true,
                }]
            }
        })
    }
}

pub struct SimulatedScreen {
    width: u32,
    height: u32,
    period: Duration,
    last: Option<Instant>,
    frame: u64,
}

impl SimulatedScreen {
    pub fn new(width: u32, height: u32, period: Duration) -> Self {
        Self {
            width,
            height,
            period,
            last: None,
            frame: 0,
        }
    }
}

impl ScreenSource for SimulatedScreen {
    fn grab(&mut self) -> Result<Option<ScreenGrab>> {
        if self.last.is_some_and(|t| t.elapsed() < self.period) {
            return Ok(None);
        }
        self.last = Some(Instant::now());
        self.frame += 1;
        Ok(Some(ScreenGrab {
            frame: self.frame,
            width: self.width,
            height: self.height,
        }))
    }
}

// ============================================================================
// Regression
// ============================================================================

/// Ordinary least squares from the six gaze features (plus bias) to `x` and `y`.
#[derive(Clone, Debug, Default)]
pub struct LinearRegressor {
    weights: Option<[[f64; 7]; 2]>,
    samples: usize,
}

impl LinearRegressor {
    pub fn is_trained(&self) -> bool {
        self.weights.is_some()
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    /// Fit from in-memory rows of `[l_x, l_y, l_z, r_x, r_y, r_z, x, y]`.
    pub fn fit(&mut self, rows: &[[f64; 8]]) -> Result<()> {
        if rows.len() < MIN_TRAINING_SAMPLES {
            return Err(Error::TrainingFailed(format!(
                "need at least {} samples, got {}",
                MIN_TRAINING_SAMPLES,
                rows.len()
            )));
        }

        // Normal equations with a tiny ridge term so constant features stay solvable.
        let mut xtx = [[0.0f64; 7]; 7];
        let mut xty = [[0.0f64; 2]; 7];
        for row in rows {
            let mut features = [1.0f64; 7];
            features[..6].copy_from_slice(&row[..6]);
            for i in 0..7 {
                for j in 0..7 {
                    xtx[i][j] += features[i] * features[j];
                }
                xty[i][0] += features[i] * row[6];
                xty[i][1] += features[i] * row[7];
            }
        }
        for (i, r) in xtx.iter_mut().enumerate() {
            r[i] += 1e-6;
        }

        let mut weights = [[0.0f64; 7]; 2];
        for (target, w) in weights.iter_mut().enumerate() {
            let rhs: [f64; 7] = std::array::from_fn(|i| xty[i][target]);
            *w = solve(xtx, rhs)?;
        }
        self.weights = Some(weights);
        self.samples = rows.len();
        info!(samples = rows.len(), "Gaze regression fitted");
        Ok(())
    }
}

impl Regressor for LinearRegressor {
    fn train_from_file(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)?;
        let mut rows = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("l_x") {
                continue;
            }
            let values: Vec<f64> = line
                .split(',')
                .map(|v| v.trim().parse::<f64>())
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| {
                    Error::TrainingFailed(format!("line {}: {}", line_no + 1, e))
                })?;
            let row: [f64; 8] = values.try_into().map_err(|v: Vec<f64>| {
                Error::TrainingFailed(format!(
                    "line {}: expected 8 columns, got {}",
                    line_no + 1,
                    v.len()
                ))
            })?;
            rows.push(row);
        }
        self.fit(&rows)
    }

    fn predict(&self, features: &[f64; 6]) -> Result<(f64, f64)> {
        let weights = self
            .weights
            .as_ref()
            .ok_or_else(|| Error::TrainingFailed("model not trained".into()))?;
        let eval = |w: &[f64; 7]| {
            w[6] + features
                .iter()
                .zip(w.iter())
                .map(|(f, w)| f * w)
                .sum::<f64>()
        };
        Ok((eval(&weights[0]), eval(&weights[1])))
    }
}

/// Gaussian elimination with partial pivoting.
fn solve(mut a: [[f64; 7]; 7], mut b: [f64; 7]) -> Result<[f64; 7]> {
    const N: usize = 7;
    for col in 0..N {
        let pivot = (col..N)
            .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
            .unwrap_or(col);
        if a[pivot][col].abs() < 1e-12 {
            return Err(Error::TrainingFailed(
                "training samples are degenerate".into(),
            ));
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..N {
            let factor = a[row][col] / a[col][col];
            for k in col..N {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = [0.0f64; N];
    for row in (0..N).rev() {
        let tail: f64 = (row + 1..N).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Ok(x)
}
