//! Gaze calibration state machine.
//!
//! `Idle -> Fitting -> Calibrated -> CollectingTrainingData -> TrainingModel -> Ready`
//!
//! Every transition is checked against the current state under one lock, so
//! states never skip. Two moves leave the chain on purpose: a failed training
//! run falls back to `Calibrated` so more samples can be collected, and
//! `reset` returns to `Idle`. A new cycle may start from `Idle` or `Ready`.

use crate::events::{AcquisitionEvent, EventBus};
use crate::lock;
use crate::source::Regressor;
use aurabridge_core::{CalibrationState, Error, Result};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Default)]
struct Inner {
    regressor: Option<Arc<dyn Regressor>>,
    target: Option<(f64, f64)>,
    collected: u64,
    discarded: u64,
    history: Vec<CalibrationState>,
}

/// Counts from one training-collection phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TrainingCounts {
    pub collected: u64,
    pub discarded: u64,
}

pub struct CalibrationMachine {
    state: watch::Sender<CalibrationState>,
    inner: Mutex<Inner>,
    events: EventBus,
}

impl CalibrationMachine {
    pub fn new(events: EventBus) -> Self {
        let (state, _) = watch::channel(CalibrationState::Idle);
        Self {
            state,
            inner: Mutex::new(Inner {
                history: vec![CalibrationState::Idle],
                ..Default::default()
            }),
            events,
        }
    }

    pub fn state(&self) -> CalibrationState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CalibrationState> {
        self.state.subscribe()
    }

    /// Every state entered so far, starting with `Idle`.
    pub fn history(&self) -> Vec<CalibrationState> {
        lock(&self.inner).history.clone()
    }

    /// Start a calibration cycle. Only one may be in flight.
    pub fn begin_fitting(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        let current = self.state();
        if !current.can_begin_cycle() {
            return Err(Error::AlreadyCalibrating { state: current });
        }
        inner.regressor = None;
        inner.target = None;
        self.enter(&mut inner, CalibrationState::Fitting);
        Ok(())
    }

    /// A valid two-eye sample was observed. Returns `false` if fitting was
    /// cancelled in the meantime.
    pub fn mark_calibrated(&self) -> bool {
        let mut inner = lock(&self.inner);
        if self.state() != CalibrationState::Fitting {
            debug!(state = %self.state(), "Ignoring calibrated mark outside fitting");
            return false;
        }
        self.enter(&mut inner, CalibrationState::Calibrated);
        true
    }

    pub fn begin_training_collection(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        let current = self.state();
        if current != CalibrationState::Calibrated {
            return Err(Error::NotCalibrated { state: current });
        }
        inner.target = None;
        inner.collected = 0;
        inner.discarded = 0;
        self.enter(&mut inner, CalibrationState::CollectingTrainingData);
        Ok(())
    }

    pub fn end_training_collection(&self) -> Result<TrainingCounts> {
        let mut inner = lock(&self.inner);
        let current = self.state();
        if current != CalibrationState::CollectingTrainingData {
            return Err(Error::NotCalibrated { state: current });
        }
        inner.target = None;
        self.enter(&mut inner, CalibrationState::TrainingModel);
        Ok(TrainingCounts {
            collected: inner.collected,
            discarded: inner.discarded,
        })
    }

    /// Install the trained mapping and move to `Ready`.
    pub fn finish_training(&self, regressor: Arc<dyn Regressor>) -> Result<()> {
        let mut inner = lock(&self.inner);
        let current = self.state();
        if current != CalibrationState::TrainingModel {
            return Err(Error::Internal(format!(
                "training finished while calibration was {}",
                current
            )));
        }
        inner.regressor = Some(regressor);
        self.enter(&mut inner, CalibrationState::Ready);
        Ok(())
    }

    /// Training failed; go back to `Calibrated`.
    pub fn fail_training(&self) {
        let mut inner = lock(&self.inner);
        if self.state() == CalibrationState::TrainingModel {
            self.enter(&mut inner, CalibrationState::Calibrated);
        }
    }

    /// Drop all calibration progress.
    pub fn reset(&self) {
        let mut inner = lock(&self.inner);
        inner.regressor = None;
        inner.target = None;
        inner.collected = 0;
        inner.discarded = 0;
        if self.state() != CalibrationState::Idle {
            self.enter(&mut inner, CalibrationState::Idle);
        }
    }

    /// Set the on-screen target. A pair with a zero coordinate clears it.
    pub fn set_target(&self, x: f64, y: f64) -> bool {
        let mut inner = lock(&self.inner);
        inner.target = (x != 0.0 && y != 0.0).then_some((x, y));
        inner.target.is_some()
    }

    pub fn target(&self) -> Option<(f64, f64)> {
        lock(&self.inner).target
    }

    /// Account for one training sample: returns the target to label it with,
    /// or `None` (and counts a discard) when no target is set.
    /// Samples seen outside `CollectingTrainingData` are ignored entirely.
    pub fn label_sample(&self) -> Option<(f64, f64)> {
        let mut inner = lock(&self.inner);
        if self.state() != CalibrationState::CollectingTrainingData {
            return None;
        }
        match inner.target {
            Some(target) => {
                inner.collected += 1;
                Some(target)
            }
            None => {
                inner.discarded += 1;
                None
            }
        }
    }

    pub fn counts(&self) -> TrainingCounts {
        let inner = lock(&self.inner);
        TrainingCounts {
            collected: inner.collected,
            discarded: inner.discarded,
        }
    }

    /// Predict screen coordinates. Only allowed in `Ready`.
    pub fn predict(&self, features: &[f64; 6]) -> Result<(f64, f64)> {
        let regressor = {
            let inner = lock(&self.inner);
            let current = self.state();
            match (&inner.regressor, current) {
                (Some(r), CalibrationState::Ready) => r.clone(),
                _ => return Err(Error::NotCalibrated { state: current }),
            }
        };
        regressor.predict(features)
    }

    /// Wait until the machine reaches `target`, up to `timeout`.
    pub async fn wait_for(&self, target: CalibrationState, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        let reached = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| *s == target)).await,
            Ok(Ok(_))
        );
        reached
    }

    fn enter(&self, inner: &mut Inner, next: CalibrationState) {
        let previous = self.state.send_replace(next);
        inner.history.push(next);
        info!(from = %previous, to = %next, "Calibration state changed");
        self.events
            .emit(AcquisitionEvent::Calibration { state: next });
    }
}
