//! Command dispatch
//!
//! Every request is validated into a [`Command`] before anything runs, then
//! executed against the session controller. Failures become error responses;
//! nothing here ever takes the connection down.

use crate::server::GatewayState;
use aurabridge_acquisition::AcquisitionEvent;
use aurabridge_core::{Command, Error, PushMessage, Request, Response, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::{debug, warn};

/// Parse one text frame and answer it.
pub async fn handle_text(text: &str, state: &GatewayState) -> Response {
    match serde_json::from_str::<Request>(text) {
        Ok(request) => dispatch(request, state).await,
        Err(e) => {
            warn!("Malformed request: {}", e);
            Response::from_error(&Error::invalid_params("request", e.to_string()))
        }
    }
}

pub async fn dispatch(request: Request, state: &GatewayState) -> Response {
    let Request {
        id,
        command,
        params,
    } = request;
    debug!(command = %command, "Dispatching");

    let response = match Command::from_request(&command, params) {
        Ok(cmd) => match execute(cmd, state).await {
            Ok(response) => response,
            Err(e) => {
                warn!(command = %command, error = %e, "Command failed");
                Response::from_error(&e)
            }
        },
        Err(e) => Response::from_error(&e),
    };
    response.with_id(id)
}

async fn execute(command: Command, state: &GatewayState) -> Result<Response> {
    let controller = &state.controller;
    match command {
        Command::Start => {
            let status = controller.start_collection().await?;
            Ok(Response::success("Data collection started")
                .with("session_id", &status.session_id)
                .with("signals", &status.enabled))
        }

        Command::Stop => {
            let report = controller.stop_collection().await?;
            if !report.was_active {
                return Ok(Response::success("No active session"));
            }
            Ok(Response::success("Data collection stopped")
                .with("stopped", &report.stopped)
                .with("files", &report.files)
                .with("duration_secs", report.duration_secs))
        }

        Command::StartEyeGaze => {
            controller.start_eye_gaze().await?;
            Ok(Response::success("Eye gaze calibration started")
                .with("calibration", controller.calibration().state()))
        }

        Command::StopEyeGaze => {
            controller.stop_eye_gaze().await?;
            Ok(Response::success("Eye gaze calibration stopped"))
        }

        Command::StartRecordingTrainingData => {
            controller.start_training_collection().await?;
            Ok(Response::success("Training data collection started"))
        }

        Command::StopRecordingTrainingData => {
            let counts = controller.stop_training_collection().await?;
            Ok(Response::success("Training data collection stopped")
                .with("collected", counts.collected)
                .with("discarded", counts.discarded)
                .with("calibration", controller.calibration().state()))
        }

        Command::SetCoordinates(p) => {
            let accepted = controller.set_coordinates(p.x, p.y);
            let message = if accepted {
                format!("Target set to ({}, {})", p.x, p.y)
            } else {
                "Target cleared".to_string()
            };
            Ok(Response::success(message).with("accepted", accepted))
        }

        Command::UpdateSignal(p) => {
            controller.update_signal_enabled(p.signal, p.status).await?;
            let verb = if p.status { "enabled" } else { "disabled" };
            Ok(Response::success(format!("Signal {} {}", p.signal, verb)))
        }

        Command::UpdateOutputPath(p) => {
            let message = format!("Output path set to {}", p.path.display());
            controller.update_output_path(p.path).await?;
            Ok(Response::success(message))
        }

        Command::UpdateParticipantName(p) => {
            controller.update_participant(&p.name).await?;
            Ok(Response::success(format!("Participant set to {}", p.name)))
        }

        Command::ViewCamera => {
            controller.view_camera().await?;
            Ok(Response::success("Camera view started"))
        }

        Command::StopCameraView => {
            controller.stop_camera_view().await?;
            Ok(Response::success("Camera view stopped"))
        }

        Command::Status => {
            let status = controller.status().await;
            Ok(Response::success("ok").with("session", status))
        }

        Command::Ping => Ok(Response::success("pong")),

        Command::Shutdown => {
            let result = controller.shutdown().await;
            state.shutdown.cancel();
            result.map(|_| Response::success("Shutting down"))
        }
    }
}

/// Convert an acquisition event into its wire push.
pub fn event_to_push(event: &AcquisitionEvent) -> PushMessage {
    match event {
        AcquisitionEvent::Worker {
            name,
            signal,
            status,
            message,
        } => PushMessage::SignalUpdate {
            worker: name.clone(),
            signal: *signal,
            status: *status,
            message: message.clone(),
        },
        AcquisitionEvent::Calibration { state } => PushMessage::Calibration { state: *state },
        AcquisitionEvent::Frame {
            width,
            height,
            data,
        } => PushMessage::Frame {
            width: *width,
            height: *height,
            data: STANDARD.encode(data),
        },
        AcquisitionEvent::Session {
            active,
            participant,
            session_id,
        } => PushMessage::Session {
            active: *active,
            participant: participant.clone(),
            session_id: session_id.clone(),
        },
        AcquisitionEvent::Error { source, message } => PushMessage::Error {
            source: source.clone(),
            message: message.clone(),
        },
    }
}
