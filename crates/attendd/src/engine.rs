//! Capture engine: camera frames in, face observations out.
//!
//! Camera capture and ONNX inference are blocking, so both live on one
//! dedicated OS thread. The thread streams observations to the coordinator
//! over a capacity-1 channel with `try_send`: if the coordinator is still
//! chewing on the previous observation, the frame is simply dropped. That
//! channel is the whole "one attempt in flight" policy.
//!
//! Enrollment requests arrive on a side channel and are served between
//! frames so the kiosk loop never stalls the admin surface for long.

use crate::coordinator::FaceObservation;
use attend_core::{EmbedderError, FaceEmbedder};
use attend_hw::{Camera, CameraError, Frame, FrameStream};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("embedder error: {0}")]
    Embedder(#[from] EmbedderError),
    #[error("no usable face in {0} captured frames")]
    NoFaceCaptured(usize),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread is gone")]
    Gone,
}

/// Result of an enrollment capture.
#[derive(Debug)]
pub struct EnrollCapture {
    pub embedding: attend_core::Embedding,
    /// Mean luma of the frame the embedding came from.
    pub brightness: f32,
}

enum EngineRequest {
    Enroll {
        frames: usize,
        reply: oneshot::Sender<Result<EnrollCapture, EngineError>>,
    },
}

#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Capture `frames` frames and embed the brightest usable one.
    pub async fn enroll(&self, frames: usize) -> Result<EnrollCapture, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll { frames, reply })
            .await
            .map_err(|_| EngineError::Gone)?;
        rx.await.map_err(|_| EngineError::Gone)?
    }
}

pub struct EngineConfig {
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    pub warmup_frames: usize,
    /// Minimum spacing between match attempts from the camera stream.
    pub min_match_interval_ms: i64,
}

/// Open the camera and model, then hand them to a dedicated thread.
/// Fails fast if either is unusable; the kiosk is pointless without them.
pub fn spawn_engine(
    config: EngineConfig,
    model_path: &str,
    obs_tx: mpsc::Sender<FaceObservation>,
) -> Result<EngineHandle, EngineError> {
    let camera = Camera::open(
        &config.camera_device,
        config.camera_width,
        config.camera_height,
    )?;
    let embedder = FaceEmbedder::load(model_path)?;

    let (tx, rx) = mpsc::channel(4);
    std::thread::Builder::new()
        .name("attend-engine".into())
        .spawn(move || engine_loop(camera, embedder, rx, obs_tx, config))?;

    Ok(EngineHandle { tx })
}

fn engine_loop(
    camera: Camera,
    mut embedder: FaceEmbedder,
    mut requests: mpsc::Receiver<EngineRequest>,
    obs_tx: mpsc::Sender<FaceObservation>,
    config: EngineConfig,
) {
    // One stream for the engine's whole lifetime; per-frame stream setup
    // would requeue the driver's mmap buffers on every capture.
    let mut stream = match camera.stream() {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(error = %e, "failed to start capture stream");
            return;
        }
    };

    for _ in 0..config.warmup_frames {
        // Exposure settles over the first few frames; failures here are
        // not fatal.
        let _ = stream.capture();
    }

    tracing::info!(device = %config.camera_device, "capture engine running");
    let mut last_attempt_ms = i64::MIN;

    loop {
        match requests.try_recv() {
            Ok(EngineRequest::Enroll { frames, reply }) => {
                let result = capture_enrollment(&mut stream, &mut embedder, frames);
                let _ = reply.send(result);
                continue;
            }
            Err(mpsc::error::TryRecvError::Disconnected) => break,
            Err(mpsc::error::TryRecvError::Empty) => {}
        }

        let frame = match stream.capture() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "frame capture failed; backing off");
                std::thread::sleep(std::time::Duration::from_millis(500));
                continue;
            }
        };
        if frame.is_dark {
            continue;
        }
        if frame.captured_at_ms.saturating_sub(last_attempt_ms) < config.min_match_interval_ms {
            continue;
        }
        last_attempt_ms = frame.captured_at_ms;

        match embedder.extract(&frame.data, frame.width, frame.height) {
            Ok(embedding) => {
                let obs = FaceObservation {
                    embedding,
                    detected_at_ms: frame.captured_at_ms,
                };
                match obs_tx.try_send(obs) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::trace!("coordinator busy; dropping observation");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "frame produced no embedding");
            }
        }
    }
    tracing::info!("capture engine stopped");
}

/// Burst-capture for enrollment: prefer the brightest frame, fall back to
/// dimmer ones if it fails to embed.
fn capture_enrollment(
    stream: &mut FrameStream<'_>,
    embedder: &mut FaceEmbedder,
    frames: usize,
) -> Result<EnrollCapture, EngineError> {
    let (mut captured, skipped_dark): (Vec<Frame>, usize) = stream.capture_burst(frames)?;
    if skipped_dark > 0 {
        tracing::debug!(skipped_dark, "dark frames discarded during enrollment");
    }
    captured.sort_by(|a, b| {
        b.avg_brightness()
            .partial_cmp(&a.avg_brightness())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let total = captured.len();
    for frame in captured {
        match embedder.extract(&frame.data, frame.width, frame.height) {
            Ok(embedding) => {
                return Ok(EnrollCapture {
                    embedding,
                    brightness: frame.avg_brightness(),
                })
            }
            Err(e) => tracing::debug!(error = %e, "enrollment frame rejected"),
        }
    }
    Err(EngineError::NoFaceCaptured(total))
}
