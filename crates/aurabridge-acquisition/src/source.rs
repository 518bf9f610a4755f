//! Collaborator interfaces for the signal producers.
//!
//! The acquisition layer only orchestrates; estimating gaze, classifying
//! emotions, pulling EEG samples and fitting the gaze regression are done by
//! implementations of these traits. [`Collaborators`] bundles factories for
//! all of them so every worker builds its own instance on its own task.

use crate::arbiter::{DeviceOpener, Frame};
use aurabridge_core::Result;
use std::path::Path;
use std::sync::Arc;

/// Electrode order of the 8-channel headset.
pub const ELECTRODES: [&str; 8] = ["F3", "F4", "Cz", "C3", "Pz", "C4", "P3", "P4"];

/// Frequency bands of the 40-channel band-power stream.
pub const BANDS: [&str; 5] = ["Delta", "Theta", "Alpha", "Beta", "Gamma"];

/// Column names for an EEG stream with `count` channels.
pub fn aura_channel_names(count: usize) -> Vec<String> {
    match count {
        8 => ELECTRODES.iter().map(|e| e.to_string()).collect(),
        40 => BANDS
            .iter()
            .flat_map(|band| {
                ["F3", "F4", "Cz", "C3", "C4", "Pz", "P3", "P4"]
                    .iter()
                    .map(move |e| format!("{}_{}", band, e))
            })
            .collect(),
        n => (0..n).map(|i| format!("ch{}", i)).collect(),
    }
}

/// Per-eye gaze direction vectors; either eye may be missing.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GazeSample {
    pub left: Option<[f64; 3]>,
    pub right: Option<[f64; 3]>,
}

impl GazeSample {
    pub fn new(left: Option<[f64; 3]>, right: Option<[f64; 3]>) -> Self {
        Self { left, right }
    }

    pub fn both(&self) -> Option<([f64; 3], [f64; 3])> {
        Some((self.left?, self.right?))
    }

    /// Exactly one eye was found.
    pub fn is_partial(&self) -> bool {
        self.left.is_some() != self.right.is_some()
    }

    /// `[l_x, l_y, l_z, r_x, r_y, r_z]`, the regression input.
    pub fn features(&self) -> Option<[f64; 6]> {
        let (l, r) = self.both()?;
        Some([l[0], l[1], l[2], r[0], r[1], r[2]])
    }
}

pub trait GazeEstimator: Send {
    fn gaze_vector(&mut self, frame: &Frame) -> Result<GazeSample>;

    /// Reinitialise after a partial detection.
    fn restart(&mut self) -> Result<()>;
}

pub trait EmotionClassifier: Send {
    fn recognize_emotion(&mut self, frame: &Frame) -> Result<Option<String>>;
}

/// A chunk pulled from an EEG stream. `timestamps` are stream-local seconds,
/// one per row of `samples`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EegChunk {
    pub timestamps: Vec<f64>,
    pub samples: Vec<Vec<f64>>,
}

impl EegChunk {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

pub trait EegStream: Send {
    fn channel_names(&self) -> Vec<String>;

    fn is_ready(&mut self) -> bool;

    fn get_data(&mut self) -> Result<EegChunk>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct PointerEvent {
    pub x: i64,
    pub y: i64,
    pub clicked: bool,
}

pub trait PointerSource: Send {
    /// Events since the last drain.
    fn drain(&mut self) -> Result<Vec<PointerEvent>>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct KeyEvent {
    pub key: String,
    pub pressed: bool,
}

pub trait KeyboardSource: Send {
    fn drain(&mut self) -> Result<Vec<KeyEvent>>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct ScreenGrab {
    pub frame: u64,
    pub width: u32,
    pub height: u32,
}

pub trait ScreenSource: Send {
    /// `None` when no new frame is due yet.
    fn grab(&mut self) -> Result<Option<ScreenGrab>>;
}

/// Maps gaze features to screen coordinates.
pub trait Regressor: Send + Sync {
    /// Fit from a training file with columns `l_x,l_y,l_z,r_x,r_y,r_z,x,y`.
    fn train_from_file(&mut self, path: &Path) -> Result<()>;

    fn predict(&self, features: &[f64; 6]) -> Result<(f64, f64)>;
}

pub type GazeFactory = Arc<dyn Fn() -> Result<Box<dyn GazeEstimator>> + Send + Sync>;
pub type EmotionFactory = Arc<dyn Fn() -> Result<Box<dyn EmotionClassifier>> + Send + Sync>;
pub type EegFactory = Arc<dyn Fn() -> Result<Box<dyn EegStream>> + Send + Sync>;
pub type PointerFactory = Arc<dyn Fn() -> Result<Box<dyn PointerSource>> + Send + Sync>;
pub type KeyboardFactory = Arc<dyn Fn() -> Result<Box<dyn KeyboardSource>> + Send + Sync>;
pub type ScreenFactory = Arc<dyn Fn() -> Result<Box<dyn ScreenSource>> + Send + Sync>;
pub type RegressorFactory = Arc<dyn Fn() -> Box<dyn Regressor> + Send + Sync>;

/// Factories for every external collaborator.
#[derive(Clone)]
pub struct Collaborators {
    pub camera: Arc<dyn DeviceOpener>,
    pub gaze: GazeFactory,
    pub emotion: EmotionFactory,
    pub eeg: EegFactory,
    pub pointer: PointerFactory,
    pub keyboard: KeyboardFactory,
    pub screen: ScreenFactory,
    pub regressor: RegressorFactory,
}
