use facegate_core::{Tunables, DETECTOR_MODEL_FILE, EMBEDDER_MODEL_FILE};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Address the HTTP server binds to.
    pub bind_addr: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub gallery_path: PathBuf,
    pub samples_dir: PathBuf,
    /// Path to the SQLite user record database.
    pub db_path: PathBuf,
    /// TrueType font for on-frame labels. Without one only boxes are drawn.
    pub font_path: Option<PathBuf>,
    pub tunables: Tunables,
    /// Identification runs the models on every n-th frame.
    pub identify_every: u32,
    /// Delay after opening the camera before the first read.
    pub settle: Duration,
    pub read_retry: Duration,
    /// Consecutive failed reads before a stream gives up.
    pub max_read_failures: u32,
    pub jpeg_quality: u8,
}

impl Config {
    /// Load configuration from `FACEGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let path = |key: &str| var(key).filter(|v| !v.is_empty()).map(PathBuf::from);

        let data_dir = path("FACEGATE_DATA_DIR").unwrap_or_else(facegate_core::default_data_dir);
        let model_dir = path("FACEGATE_MODEL_DIR").unwrap_or_else(|| data_dir.join("models"));
        let defaults = Tunables::default();

        Self {
            camera_device: var("FACEGATE_CAMERA_DEVICE").unwrap_or_else(|| "/dev/video0".to_string()),
            bind_addr: var("FACEGATE_BIND_ADDR").unwrap_or_else(|| "127.0.0.1:5000".to_string()),
            model_dir,
            gallery_path: path("FACEGATE_GALLERY_PATH")
                .unwrap_or_else(|| data_dir.join("gallery.json")),
            samples_dir: path("FACEGATE_SAMPLES_DIR").unwrap_or_else(|| data_dir.join("dataset")),
            db_path: path("FACEGATE_DB_PATH").unwrap_or_else(|| data_dir.join("users.db")),
            font_path: path("FACEGATE_FONT_PATH"),
            tunables: Tunables {
                min_face_size: parse_or(&var, "FACEGATE_MIN_FACE_SIZE", defaults.min_face_size),
                required_streak: parse_or(&var, "FACEGATE_REQUIRED_STREAK", defaults.required_streak)
                    .max(1),
                match_threshold: parse_or(&var, "FACEGATE_MATCH_THRESHOLD", defaults.match_threshold),
            },
            identify_every: parse_or(&var, "FACEGATE_IDENTIFY_EVERY", 2u32).max(1),
            settle: Duration::from_millis(parse_or(&var, "FACEGATE_SETTLE_MS", 500)),
            read_retry: Duration::from_millis(parse_or(&var, "FACEGATE_READ_RETRY_MS", 100)),
            max_read_failures: parse_or(&var, "FACEGATE_MAX_READ_FAILURES", 50u32).max(1),
            jpeg_quality: parse_or(&var, "FACEGATE_JPEG_QUALITY", 80u8).clamp(1, 100),
        }
    }

    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(DETECTOR_MODEL_FILE)
    }

    pub fn embedder_model_path(&self) -> PathBuf {
        self.model_dir.join(EMBEDDER_MODEL_FILE)
    }
}

fn parse_or<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match var(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparsable setting");
            default
        }),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("FACEGATE_DATA_DIR", "/var/lib/facegate")]);
        assert_eq!(config.camera_device, "/dev/video0");
        assert_eq!(config.bind_addr, "127.0.0.1:5000");
        assert_eq!(config.gallery_path, PathBuf::from("/var/lib/facegate/gallery.json"));
        assert_eq!(config.samples_dir, PathBuf::from("/var/lib/facegate/dataset"));
        assert_eq!(config.db_path, PathBuf::from("/var/lib/facegate/users.db"));
        assert_eq!(
            config.detector_model_path(),
            PathBuf::from("/var/lib/facegate/models/det_10g.onnx")
        );
        assert_eq!(config.font_path, None);
        assert_eq!(config.tunables.min_face_size, 120);
        assert_eq!(config.tunables.required_streak, 5);
        assert!((config.tunables.match_threshold - 0.60).abs() < 1e-6);
        assert_eq!(config.identify_every, 2);
        assert_eq!(config.settle, Duration::from_millis(500));
        assert_eq!(config.read_retry, Duration::from_millis(100));
        assert_eq!(config.max_read_failures, 50);
        assert_eq!(config.jpeg_quality, 80);
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let config = load(&[
            ("FACEGATE_DATA_DIR", "/data"),
            ("FACEGATE_MODEL_DIR", "/models"),
            ("FACEGATE_MATCH_THRESHOLD", "0.45"),
            ("FACEGATE_REQUIRED_STREAK", "0"),
            ("FACEGATE_IDENTIFY_EVERY", "often"),
            ("FACEGATE_FONT_PATH", "/fonts/DejaVuSans.ttf"),
        ]);
        assert_eq!(config.embedder_model_path(), PathBuf::from("/models/facenet128.onnx"));
        assert!((config.tunables.match_threshold - 0.45).abs() < 1e-6);
        assert_eq!(config.tunables.required_streak, 1);
        assert_eq!(config.identify_every, 2);
        assert_eq!(config.font_path, Some(PathBuf::from("/fonts/DejaVuSans.ttf")));
    }
}
