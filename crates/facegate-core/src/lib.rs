//! facegate-core: face enrollment and identification engine.
//!
//! Capture quality gating, the enrollment state machine, the embedding
//! gallery, user records and nearest-neighbour matching. Detection and
//! embedding sit behind the traits in [`vision`]; SCRFD and a 128-d ONNX
//! embedder are the bundled implementations.

pub mod detector;
pub mod encode;
pub mod enrollment;
pub mod gallery;
pub mod matcher;
pub mod quality;
pub mod records;
pub mod recognizer;
pub mod samples;
pub mod types;
pub mod vision;

use std::path::PathBuf;

pub use detector::{LandmarkEyeDetector, ScrfdFaceDetector};
pub use encode::{encode_samples, EncodeReport};
pub use enrollment::{EnrollmentSession, EnrollmentState, Observation};
pub use gallery::{Gallery, GalleryStore};
pub use matcher::{EuclideanMatcher, MatchResult, Matcher};
pub use quality::{QualityFilter, QualityVerdict, Rejection};
pub use records::{SqliteUserRecords, UserRecordStore};
pub use recognizer::OnnxFaceEmbedder;
pub use samples::SampleStore;
pub use types::{BoundingBox, Embedding, Identity, Tunables};
pub use vision::{DetectingEmbedder, Vision};

/// File name of the SCRFD detection model inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// File name of the 128-d embedding model inside the model directory.
pub const EMBEDDER_MODEL_FILE: &str = "facenet128.onnx";

/// `$XDG_DATA_HOME/facegate`, falling back to `~/.local/share/facegate`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegate")
}
