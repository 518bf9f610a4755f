//! Shared camera arbitration.
//!
//! One physical capture device serves every camera consumer (gaze, emotion,
//! calibration, live view). The device is open exactly while at least one
//! consumer is registered. A single pump on the blocking pool owns the device,
//! reads frames at a fixed period and publishes the latest one on a `watch`
//! channel; consumers take immutable snapshots and never touch the device.

use aurabridge_core::{CameraConfig, Error, Result};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// An immutable captured frame. Cloning shares the pixel buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Arc<[u8]>,
    /// Pump sequence number; increases by one per captured frame.
    pub seq: u64,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            data: data.into(),
            seq: 0,
        }
    }
}

/// An opened capture device.
pub trait CaptureDevice: Send {
    /// Read one frame. `Ok(None)` means no frame was ready this tick.
    fn read_frame(&mut self) -> Result<Option<Frame>>;

    /// Release the underlying hardware handle.
    fn release(&mut self);
}

/// Opens the capture device on demand.
pub trait DeviceOpener: Send + Sync {
    fn open(&self) -> Result<Box<dyn CaptureDevice>>;
}

/// Longest single sleep of the pump, so a stop is seen within this bound
/// whatever the frame period.
const PUMP_TICK: Duration = Duration::from_millis(10);

struct Pump {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct ArbiterState {
    consumers: BTreeSet<String>,
    pump: Option<Pump>,
}

/// Reference-counted owner of the shared capture device.
pub struct CameraArbiter {
    opener: Arc<dyn DeviceOpener>,
    frame_period: Duration,
    join_timeout: Duration,
    state: tokio::sync::Mutex<ArbiterState>,
    latest: watch::Sender<Option<Frame>>,
    shut_down: AtomicBool,
}

impl CameraArbiter {
    pub fn new(opener: Arc<dyn DeviceOpener>, config: &CameraConfig) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            opener,
            frame_period: config.frame_period(),
            join_timeout: config.join_timeout(),
            state: tokio::sync::Mutex::new(ArbiterState::default()),
            latest,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Add a consumer, opening the device if it is the first one.
    ///
    /// If the device cannot be opened the consumer set is left unchanged and
    /// `DeviceUnavailable` is returned. Registering an existing id is a no-op.
    pub async fn register_consumer(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(Error::device_unavailable("camera arbiter is shut down"));
        }
        if state.consumers.contains(id) {
            debug!(consumer = %id, "Camera consumer already registered");
            return Ok(());
        }
        if state.pump.is_none() {
            let opener = self.opener.clone();
            let device = tokio::task::spawn_blocking(move || opener.open())
                .await
                .map_err(|e| Error::device_unavailable(format!("open aborted: {}", e)))?
                .map_err(|e| match e {
                    Error::DeviceUnavailable { .. } => e,
                    other => Error::device_unavailable(other.to_string()),
                })?;
            state.pump = Some(self.start_pump(device));
            info!(consumer = %id, "Capture device opened");
        }
        state.consumers.insert(id.to_string());
        info!(consumer = %id, consumers = state.consumers.len(), "Camera consumer registered");
        Ok(())
    }

    /// Remove a consumer. The last one out stops the pump and releases the
    /// device. Unknown ids are ignored.
    pub async fn unregister_consumer(&self, id: &str) {
        let mut state = self.state.lock().await;
        if !state.consumers.remove(id) {
            return;
        }
        info!(consumer = %id, consumers = state.consumers.len(), "Camera consumer unregistered");
        if state.consumers.is_empty() {
            if let Some(pump) = state.pump.take() {
                self.close_pump(pump).await;
            }
        }
    }

    /// Most recent frame, or `None` before the first capture or after shutdown.
    pub fn get_frame(&self) -> Option<Frame> {
        if self.shut_down.load(Ordering::SeqCst) {
            return None;
        }
        self.latest.borrow().clone()
    }

    /// Watch the latest-frame slot.
    pub fn subscribe(&self) -> watch::Receiver<Option<Frame>> {
        self.latest.subscribe()
    }

    pub async fn is_open(&self) -> bool {
        self.state.lock().await.pump.is_some()
    }

    pub async fn consumer_count(&self) -> usize {
        self.state.lock().await.consumers.len()
    }

    pub async fn consumers(&self) -> Vec<String> {
        self.state.lock().await.consumers.iter().cloned().collect()
    }

    /// Drop every consumer and release the device. Idempotent; later
    /// registrations are rejected.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        let already = self.shut_down.swap(true, Ordering::SeqCst);
        state.consumers.clear();
        if let Some(pump) = state.pump.take() {
            self.close_pump(pump).await;
        }
        if !already {
            info!("Camera arbiter shut down");
        }
    }

    fn start_pump(&self, device: Box<dyn CaptureDevice>) -> Pump {
        let stop = CancellationToken::new();
        let latest = self.latest.clone();
        let period = self.frame_period;
        let token = stop.clone();
        let handle = tokio::task::spawn_blocking(move || run_pump(device, latest, period, token));
        Pump { stop, handle }
    }

    /// Stop the pump and wait up to `join_timeout` for it to release the
    /// device. A pump stuck in a read is left to release on its own once the
    /// read returns; it publishes nothing after the stop.
    async fn close_pump(&self, pump: Pump) {
        let Pump { stop, mut handle } = pump;
        stop.cancel();
        match tokio::time::timeout(self.join_timeout, &mut handle).await {
            Ok(Ok(())) => info!("Capture device released"),
            Ok(Err(e)) => warn!(error = %e, "Frame pump panicked"),
            Err(_) => warn!(
                timeout_ms = self.join_timeout.as_millis() as u64,
                "Frame pump did not exit in time, device release deferred"
            ),
        }
        self.latest.send_replace(None);
    }
}

/// Sleep `period` in short ticks. Returns `true` when stopped.
fn nap(stop: &CancellationToken, period: Duration) -> bool {
    let deadline = Instant::now() + period;
    loop {
        if stop.is_cancelled() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep((deadline - now).min(PUMP_TICK));
    }
}

fn run_pump(
    mut device: Box<dyn CaptureDevice>,
    latest: watch::Sender<Option<Frame>>,
    period: Duration,
    stop: CancellationToken,
) {
    let mut seq = 0u64;
    let mut failures = 0u64;
    while !nap(&stop, period) {
        let read = device.read_frame();
        if stop.is_cancelled() {
            break;
        }
        match read {
            Ok(Some(mut frame)) => {
                seq += 1;
                frame.seq = seq;
                latest.send_replace(Some(frame));
            }
            Ok(None) => {}
            Err(e) => {
                failures += 1;
                if failures == 1 {
                    warn!(error = %e, "Frame read failed");
                } else {
                    debug!(error = %e, failures, "Frame read failed");
                }
            }
        }
    }
    device.release();
    debug!(frames = seq, "Frame pump exited");
}
