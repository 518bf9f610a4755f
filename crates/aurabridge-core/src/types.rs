//! Core types for AuraBridge

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// A category of collected data. Each kind maps to one worker and one sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Aura,
    Gaze,
    Emotion,
    Pointer,
    Keyboard,
    Screen,
}

impl SignalKind {
    pub const ALL: [SignalKind; 6] = [
        SignalKind::Aura,
        SignalKind::Gaze,
        SignalKind::Emotion,
        SignalKind::Pointer,
        SignalKind::Keyboard,
        SignalKind::Screen,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aura => "aura",
            Self::Gaze => "gaze",
            Self::Emotion => "emotion",
            Self::Pointer => "pointer",
            Self::Keyboard => "keyboard",
            Self::Screen => "screen",
        }
    }

    /// Kinds whose frames come from the shared capture device.
    pub fn uses_camera(&self) -> bool {
        matches!(self, Self::Gaze | Self::Emotion)
    }

    /// Recover the signal from a worker name such as `aura` or `gaze_training`.
    pub fn from_worker_name(name: &str) -> Option<Self> {
        name.split('_').next().and_then(|prefix| prefix.parse().ok())
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aura" | "eeg" => Ok(Self::Aura),
            "gaze" | "eye_gaze" => Ok(Self::Gaze),
            "emotion" | "emotions" => Ok(Self::Emotion),
            "pointer" | "mouse" => Ok(Self::Pointer),
            "keyboard" => Ok(Self::Keyboard),
            "screen" => Ok(Self::Screen),
            other => Err(format!("unknown signal: {}", other)),
        }
    }
}

/// Calibration progress. Advances strictly in declaration order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationState {
    #[default]
    Idle,
    Fitting,
    Calibrated,
    CollectingTrainingData,
    TrainingModel,
    Ready,
}

impl CalibrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Fitting => "fitting",
            Self::Calibrated => "calibrated",
            Self::CollectingTrainingData => "collecting_training_data",
            Self::TrainingModel => "training_model",
            Self::Ready => "ready",
        }
    }

    /// The only state this one may advance to.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Idle => Some(Self::Fitting),
            Self::Fitting => Some(Self::Calibrated),
            Self::Calibrated => Some(Self::CollectingTrainingData),
            Self::CollectingTrainingData => Some(Self::TrainingModel),
            Self::TrainingModel => Some(Self::Ready),
            Self::Ready => None,
        }
    }

    /// A new calibration cycle may only begin from a resting state.
    pub fn can_begin_cycle(&self) -> bool {
        matches!(self, Self::Idle | Self::Ready)
    }

    /// Live gaze vectors are available (an estimator has been fitted).
    pub fn has_gaze(&self) -> bool {
        !matches!(self, Self::Idle | Self::Fitting)
    }
}

impl std::fmt::Display for CalibrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a managed worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl WorkerStatus {
    /// Whether a worker in this status still owns a live task.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Idle | Self::Running | Self::Stopping)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Gateway configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub port: u16,
    pub bind: BindMode,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 5556,
            bind: BindMode::default(),
        }
    }
}

/// Bind mode for the gateway
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    #[default]
    Loopback,
    Lan,
}

impl BindMode {
    pub fn to_addr(&self) -> &str {
        match self {
            BindMode::Loopback => "127.0.0.1",
            BindMode::Lan => "0.0.0.0",
        }
    }
}

/// Where session output lands.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Root folder; each participant gets `{output_root}/{participant}/`.
    pub output_root: PathBuf,
    pub participant: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("AuraBridge"),
            participant: "participant".to_string(),
        }
    }
}

/// Worker timing. `poll_interval_ms` is the sleep between loop iterations and
/// therefore the latency bound for a worker to observe its stop signal.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub stop_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Upper bound on the gaze fitting loop. `None` waits forever.
    pub fitting_timeout_ms: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: 2_000,
            poll_interval_ms: 1,
            fitting_timeout_ms: None,
        }
    }
}

impl WorkerConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn fitting_timeout(&self) -> Option<Duration> {
        self.fitting_timeout_ms.map(Duration::from_millis)
    }
}

/// Shared capture device settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub device_index: u32,
    /// Pump period; 33 ms is roughly 30 frames per second.
    pub frame_period_ms: u64,
    pub join_timeout_ms: u64,
    pub width: u32,
    pub height: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            frame_period_ms: 33,
            join_timeout_ms: 1_000,
            width: 64,
            height: 48,
        }
    }
}

impl CameraConfig {
    pub fn frame_period(&self) -> Duration {
        Duration::from_millis(self.frame_period_ms.max(1))
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

/// Parameters of the signal sources.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// 8 for raw electrodes, 40 for band-power streams.
    pub aura_channels: usize,
    /// Samples returned per EEG pull.
    pub aura_chunk: usize,
    pub aura_rate_hz: f64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            aura_channels: 8,
            aura_chunk: 32,
            aura_rate_hz: 256.0,
        }
    }
}
