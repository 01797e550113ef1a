//! 128-dimensional face embedder via ONNX Runtime.
//!
//! Takes an already cropped face, resizes it to the model's square input and
//! returns one L2-normalized embedding.

use crate::types::{Embedding, EMBEDDING_DIM};
use crate::vision::{CapabilityError, FaceEmbedder};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const EMBEDDER_INPUT_SIZE: u32 = 160;
const EMBEDDER_MEAN: f32 = 127.5;
const EMBEDDER_STD: f32 = 127.5;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<RecognizerError> for CapabilityError {
    fn from(err: RecognizerError) -> Self {
        CapabilityError::Embedding(err.to_string())
    }
}

pub struct OnnxFaceEmbedder {
    session: Session,
}

impl OnnxFaceEmbedder {
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded embedding model"
        );

        Ok(Self { session })
    }

    pub fn extract(&mut self, face: &RgbImage) -> Result<Embedding, RecognizerError> {
        let input = preprocess(face);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Embedding::new(l2_normalize(raw)).map_err(|e| RecognizerError::InferenceFailed(e.to_string()))
    }
}

impl FaceEmbedder for OnnxFaceEmbedder {
    fn embed(&mut self, face: &RgbImage) -> Result<Vec<Embedding>, CapabilityError> {
        if face.width() == 0 || face.height() == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![self.extract(face)?])
    }
}

fn preprocess(face: &RgbImage) -> Array4<f32> {
    let size = EMBEDDER_INPUT_SIZE;
    let resized = imageops::resize(face, size, size, FilterType::Triangle);
    let mut tensor = Array4::<f32>::zeros((1, 3, size as usize, size as usize));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - EMBEDDER_MEAN) / EMBEDDER_STD;
        }
    }
    tensor
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}
