//! AuraBridge Acquisition - worker lifecycle, shared camera arbitration,
//! signal channels, gaze calibration, and the session controller

pub mod arbiter;
pub mod calibration;
pub mod channels;
pub mod events;
pub mod session;
pub mod simulated;
pub mod sink;
pub mod source;
pub mod workers;

pub use arbiter::{CameraArbiter, CaptureDevice, DeviceOpener, Frame};
pub use calibration::{CalibrationMachine, TrainingCounts};
pub use channels::{SessionClock, SignalSpec, TRAINING_GAZE_HEADER};
pub use events::{AcquisitionEvent, EventBus};
pub use session::{
    validate_participant, ControllerConfig, SessionController, SessionStatus, StopReport,
};
pub use sink::{CsvSinkFactory, Field, Sink, SinkFactory, SinkHandle};
pub use source::{Collaborators, GazeSample, Regressor};
pub use workers::{TaskFuture, WorkerManager};

pub use aurabridge_core::{CalibrationState, Error, Result, SignalKind, WorkerStatus};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the data if a worker panicked while holding it.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
