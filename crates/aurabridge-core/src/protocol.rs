//! Control protocol: JSON request/response plus asynchronous push messages
//!
//! Wire format:
//!
//! Client → Server (request):
//!   { "command": "update_signal", "params": { "signal": "aura", "status": true } }
//!   An optional "id" is echoed back on the response.
//!
//! Server → Client (response):
//!   { "status": "success", "message": "Signal aura enabled" }
//!   { "status": "error", "message": "unknown command: fly", "error": "unknown_command" }
//!
//! Server → Client (push, may arrive at any time):
//!   { "type": "signal_update", "worker": "aura", "signal": "aura", "status": "running" }
//!   { "type": "calibration", "state": "calibrated" }
//!   { "type": "frame", "width": 64, "height": 48, "data": "<base64>" }

use crate::error::{Error, Result};
use crate::types::{CalibrationState, SignalKind, WorkerStatus};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

/// Raw request as it arrives on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub command: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(command: impl Into<String>, params: Value) -> Self {
        Self {
            id: None,
            command: command.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SetCoordinatesParams {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpdateSignalParams {
    pub signal: SignalKind,
    pub status: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpdateOutputPathParams {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpdateParticipantParams {
    pub name: String,
}

/// Every control command with its typed parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start,
    Stop,
    StartEyeGaze,
    StopEyeGaze,
    StartRecordingTrainingData,
    StopRecordingTrainingData,
    SetCoordinates(SetCoordinatesParams),
    UpdateSignal(UpdateSignalParams),
    UpdateOutputPath(UpdateOutputPathParams),
    UpdateParticipantName(UpdateParticipantParams),
    ViewCamera,
    StopCameraView,
    Status,
    Ping,
    Shutdown,
}

impl Command {
    /// Names accepted on the wire.
    pub const NAMES: [&'static str; 15] = [
        "start",
        "stop",
        "start_eye_gaze",
        "stop_eye_gaze",
        "start_recording_training_data",
        "stop_recording_training_data",
        "set_coordinates",
        "update_signal",
        "update_output_path",
        "update_participant_name",
        "view_camera",
        "stop_camera_view",
        "status",
        "ping",
        "shutdown",
    ];

    /// Resolve a command name and validate its params against that command's schema.
    pub fn from_request(name: &str, params: Value) -> Result<Self> {
        let command = match name {
            "start" => Self::Start,
            "stop" => Self::Stop,
            "start_eye_gaze" => Self::StartEyeGaze,
            "stop_eye_gaze" => Self::StopEyeGaze,
            "start_recording_training_data" => Self::StartRecordingTrainingData,
            "stop_recording_training_data" => Self::StopRecordingTrainingData,
            "set_coordinates" => Self::SetCoordinates(parse_params(name, params)?),
            "update_signal" => Self::UpdateSignal(parse_params(name, params)?),
            "update_output_path" => Self::UpdateOutputPath(parse_params(name, params)?),
            "update_participant_name" => Self::UpdateParticipantName(parse_params(name, params)?),
            "view_camera" => Self::ViewCamera,
            "stop_camera_view" => Self::StopCameraView,
            "status" => Self::Status,
            "ping" => Self::Ping,
            "shutdown" => Self::Shutdown,
            other => return Err(Error::UnknownCommand(other.to_string())),
        };
        Ok(command)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::StartEyeGaze => "start_eye_gaze",
            Self::StopEyeGaze => "stop_eye_gaze",
            Self::StartRecordingTrainingData => "start_recording_training_data",
            Self::StopRecordingTrainingData => "stop_recording_training_data",
            Self::SetCoordinates(_) => "set_coordinates",
            Self::UpdateSignal(_) => "update_signal",
            Self::UpdateOutputPath(_) => "update_output_path",
            Self::UpdateParticipantName(_) => "update_participant_name",
            Self::ViewCamera => "view_camera",
            Self::StopCameraView => "stop_camera_view",
            Self::Status => "status",
            Self::Ping => "ping",
            Self::Shutdown => "shutdown",
        }
    }
}

fn parse_params<T: DeserializeOwned>(command: &str, params: Value) -> Result<T> {
    if params.is_null() {
        return Err(Error::invalid_params(command, "missing params"));
    }
    serde_json::from_value(params).map_err(|e| Error::invalid_params(command, e.to_string()))
}

// ---------------------------------------------------------------------------
// Server → Client: responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// Structured reply to every command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub status: Status,
    pub message: String,
    /// Machine-readable error tag, see [`Error::kind`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Signal a failure is attributed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<SignalKind>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Response {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            id: None,
            status: Status::Success,
            message: message.into(),
            error: None,
            signal: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn from_error(err: &Error) -> Self {
        Self {
            id: None,
            status: Status::Error,
            message: err.to_string(),
            error: Some(err.kind().to_string()),
            signal: err.signal(),
            extra: serde_json::Map::new(),
        }
    }

    /// Attach an extra top-level field.
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        if let Ok(value) = serde_json::to_value(value) {
            self.extra.insert(key.to_string(), value);
        }
        self
    }

    pub fn with_id(mut self, id: Option<String>) -> Self {
        self.id = id;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

// ---------------------------------------------------------------------------
// Server → Client: pushes
// ---------------------------------------------------------------------------

/// Server-pushed notification (never a reply to a request).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    SignalUpdate {
        worker: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<SignalKind>,
        status: WorkerStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Calibration {
        state: CalibrationState,
    },
    Frame {
        width: u32,
        height: u32,
        /// Base64 of the raw frame bytes.
        data: String,
    },
    Session {
        active: bool,
        participant: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Error {
        source: String,
        message: String,
    },
    Info {
        version: String,
    },
}

impl PushMessage {
    pub fn info(version: &str) -> Self {
        Self::Info {
            version: version.to_string(),
        }
    }
}
