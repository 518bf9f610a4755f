//! Status events fanned out to every connected control client.

use aurabridge_core::{CalibrationState, SignalKind, WorkerStatus};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Events emitted by the acquisition layer.
#[derive(Debug, Clone)]
pub enum AcquisitionEvent {
    /// A worker changed lifecycle status.
    Worker {
        name: String,
        signal: Option<SignalKind>,
        status: WorkerStatus,
        message: Option<String>,
    },
    /// Calibration advanced or was reset.
    Calibration { state: CalibrationState },
    /// Latest camera frame for the live view.
    Frame {
        width: u32,
        height: u32,
        data: Arc<[u8]>,
    },
    /// Session activated or deactivated.
    Session {
        active: bool,
        participant: String,
        session_id: Option<String>,
    },
    /// Failure outside any command's response path.
    Error { source: String, message: String },
}

/// Broadcast bus for [`AcquisitionEvent`]s. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AcquisitionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: AcquisitionEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AcquisitionEvent> {
        self.tx.subscribe()
    }

    pub fn worker(&self, name: &str, status: WorkerStatus, message: Option<String>) {
        self.emit(AcquisitionEvent::Worker {
            name: name.to_string(),
            signal: SignalKind::from_worker_name(name),
            status,
            message,
        });
    }

    pub fn error(&self, source: &str, message: impl Into<String>) {
        self.emit(AcquisitionEvent::Error {
            source: source.to_string(),
            message: message.into(),
        });
    }
}
