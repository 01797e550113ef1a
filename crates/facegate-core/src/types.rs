use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Dimension of every face embedding stored in the gallery.
pub const EMBEDDING_DIM: usize = 128;

const IDENTITY_PREFIX: &str = "USR";
const IDENTITY_SUFFIX_LEN: usize = 6;
const IDENTITY_ALPHABET: &[u8; 36] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Opaque identity token joining a gallery entry to its user record.
///
/// Freshly generated tokens look like `USR-7K2Q9A`. Tokens read back from
/// storage are treated as opaque and only required to be non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Allocate a new random token from the thread-local RNG.
    pub fn generate() -> Self {
        Self::generate_with(&mut rand::thread_rng())
    }

    /// Allocate a new random token. Collisions with existing tokens are not checked.
    pub fn generate_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let suffix: String = (0..IDENTITY_SUFFIX_LEN)
            .map(|_| IDENTITY_ALPHABET[rng.gen_range(0..IDENTITY_ALPHABET.len())] as char)
            .collect();
        Self(format!("{IDENTITY_PREFIX}-{suffix}"))
    }

    /// Wrap an existing token. Returns `None` for blank input.
    pub fn from_token(token: impl Into<String>) -> Option<Self> {
        let token = token.into();
        let trimmed = token.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if the token has the `USR-XXXXXX` shape produced by [`Identity::generate`].
    pub fn is_well_formed(&self) -> bool {
        let Some(suffix) = self
            .0
            .strip_prefix(IDENTITY_PREFIX)
            .and_then(|rest| rest.strip_prefix('-'))
        else {
            return false;
        };
        suffix.len() == IDENTITY_SUFFIX_LEN
            && suffix.bytes().all(|b| IDENTITY_ALPHABET.contains(&b))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bounding box for a detected face or eye, in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Box without confidence or landmarks, as produced by cascade-style detectors.
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence: 1.0,
            landmarks: None,
        }
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn contains(&self, (px, py): (f32, f32)) -> bool {
        px >= self.x && px <= self.x + self.width && py >= self.y && py <= self.y + self.height
    }

    /// Integer pixel rectangle `(x, y, w, h)` clipped to a `frame_w` x `frame_h` frame.
    ///
    /// Returns `None` when nothing of the box lies inside the frame.
    pub fn clamp_to(&self, frame_w: u32, frame_h: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.max(0.0).floor();
        let y0 = self.y.max(0.0).floor();
        let x1 = (self.x + self.width).min(frame_w as f32).ceil();
        let y1 = (self.y + self.height).min(frame_h as f32).ceil();
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum EmbeddingError {
    #[error("expected {EMBEDDING_DIM}-dim embedding, got {0}")]
    WrongDimension(usize),
    #[error("embedding contains a non-finite value")]
    NonFinite,
}

/// Face embedding vector of exactly [`EMBEDDING_DIM`] values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Result<Self, EmbeddingError> {
        if values.len() != EMBEDDING_DIM {
            return Err(EmbeddingError::WrongDimension(values.len()));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(EmbeddingError::NonFinite);
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl TryFrom<Vec<f32>> for Embedding {
    type Error = EmbeddingError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<Embedding> for Vec<f32> {
    fn from(embedding: Embedding) -> Self {
        embedding.values
    }
}

/// Runtime knobs shared by the quality filter, enrollment and matching.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tunables {
    /// Minimum face box width and height in pixels.
    pub min_face_size: u32,
    /// Consecutive good frames needed before a sample is captured.
    pub required_streak: u32,
    /// Euclidean distance below which a gallery entry counts as a match.
    pub match_threshold: f32,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            min_face_size: 120,
            required_streak: 5,
            match_threshold: 0.60,
        }
    }
}

#[cfg(test)]
pub(crate) fn embedding_filled(value: f32) -> Embedding {
    Embedding::new(vec![value; EMBEDDING_DIM]).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_generated_identity_is_well_formed() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let id = Identity::generate_with(&mut rng);
            assert!(id.is_well_formed(), "bad token {id}");
            assert_eq!(id.as_str().len(), 10);
        }
    }

    #[test]
    fn test_identity_shape_check() {
        assert!(Identity::from_token("USR-AB12CD").unwrap().is_well_formed());
        assert!(!Identity::from_token("USR-ab12cd").unwrap().is_well_formed());
        assert!(!Identity::from_token("USR-AB12C").unwrap().is_well_formed());
        assert!(!Identity::from_token("alice").unwrap().is_well_formed());
    }

    #[test]
    fn test_identity_from_blank_token() {
        assert!(Identity::from_token("   ").is_none());
        assert_eq!(Identity::from_token(" x ").unwrap().as_str(), "x");
    }

    #[test]
    fn test_embedding_dimension_enforced() {
        assert_eq!(
            Embedding::new(vec![0.0; 3]),
            Err(EmbeddingError::WrongDimension(3))
        );
        let mut values = vec![0.0; EMBEDDING_DIM];
        values[5] = f32::NAN;
        assert_eq!(Embedding::new(values), Err(EmbeddingError::NonFinite));
    }

    #[test]
    fn test_euclidean_distance() {
        let a = embedding_filled(0.0);
        let mut values = vec![0.0; EMBEDDING_DIM];
        values[0] = 3.0;
        values[1] = 4.0;
        let b = Embedding::new(values).unwrap();
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn test_embedding_deserialize_rejects_wrong_length() {
        let parsed: Result<Embedding, _> = serde_json::from_str("[1.0, 2.0]");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_bbox_clamp_to_frame() {
        let b = BoundingBox::new(-10.0, 20.0, 100.0, 500.0);
        assert_eq!(b.clamp_to(640, 480), Some((0, 20, 90, 460)));
        let outside = BoundingBox::new(700.0, 0.0, 10.0, 10.0);
        assert_eq!(outside.clamp_to(640, 480), None);
    }
}
