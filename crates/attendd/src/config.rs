use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Capture resolution requested from the camera.
    pub camera_width: u32,
    pub camera_height: u32,
    /// Line-oriented card reader device (default: /dev/ttyACM0).
    pub tag_device: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Path to the embedding encryption key file.
    pub key_path: PathBuf,
    /// Directory CSV exports are written into.
    pub export_dir: PathBuf,
    /// Open-gallery cosine similarity threshold.
    pub match_threshold: f32,
    /// Single-identity threshold for card-first verification.
    pub strict_threshold: f32,
    /// How long one half of a sign-in waits for the other, in ms.
    pub pairing_window_ms: i64,
    /// Repeat sign-ins inside this window are suppressed, in ms.
    pub duplicate_window_ms: i64,
    /// Minimum spacing between match attempts from the camera stream, in ms.
    pub min_match_interval_ms: i64,
    /// Number of warmup frames to discard at startup (camera AGC/AE stabilization).
    pub warmup_frames: usize,
    /// Number of frames to capture per enroll attempt.
    pub frames_per_enroll: usize,
    /// Serve on the system bus instead of the session bus.
    pub use_system_bus: bool,
}

impl Config {
    /// Load configuration from `ATTEND_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("ATTEND_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| attend_core::default_model_dir());

        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("attend");

        let db_path = std::env::var("ATTEND_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attend.db"));
        let key_path = std::env::var("ATTEND_KEY_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("embedding.key"));
        let export_dir = std::env::var("ATTEND_EXPORT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("exports"));

        Self {
            camera_device: std::env::var("ATTEND_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            camera_width: env_u32("ATTEND_CAMERA_WIDTH", 640),
            camera_height: env_u32("ATTEND_CAMERA_HEIGHT", 360),
            tag_device: std::env::var("ATTEND_TAG_DEVICE")
                .unwrap_or_else(|_| "/dev/ttyACM0".to_string()),
            model_dir,
            db_path,
            key_path,
            export_dir,
            match_threshold: env_f32(
                "ATTEND_MATCH_THRESHOLD",
                attend_core::DEFAULT_MATCH_THRESHOLD,
            ),
            strict_threshold: env_f32(
                "ATTEND_STRICT_THRESHOLD",
                attend_core::STRICT_MATCH_THRESHOLD,
            ),
            pairing_window_ms: env_i64("ATTEND_PAIRING_WINDOW_MS", 30_000),
            duplicate_window_ms: env_i64("ATTEND_DUPLICATE_WINDOW_MS", 10_000),
            min_match_interval_ms: env_i64("ATTEND_MIN_MATCH_INTERVAL_MS", 1_500),
            warmup_frames: env_usize("ATTEND_WARMUP_FRAMES", 4),
            frames_per_enroll: env_usize("ATTEND_FRAMES_PER_ENROLL", 5),
            use_system_bus: std::env::var("ATTEND_SYSTEM_BUS")
                .map(|v| v != "0")
                .unwrap_or(false),
        }
    }

    /// Path to the face embedding model.
    pub fn embed_model_path(&self) -> String {
        self.model_dir
            .join("mobile_face_net.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
