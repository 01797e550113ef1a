//! Capture quality filter for enrollment frames.
//!
//! Rules are applied in order and the first failing rule decides the verdict:
//! exactly one face, face at least `min_face_size` on both sides, and at least
//! two eyes inside the face.

use crate::types::BoundingBox;
use serde::Serialize;

const MIN_VISIBLE_EYES: usize = 2;

/// Why a frame was not usable as an enrollment sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Rejection {
    NoFace,
    MultiFace,
    TooFar,
    EyesNotVisible,
}

impl Rejection {
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::NoFace => "NO_FACE",
            Rejection::MultiFace => "MULTI_FACE",
            Rejection::TooFar => "TOO_FAR",
            Rejection::EyesNotVisible => "EYES_NOT_VISIBLE",
        }
    }

    /// Short instruction overlaid on the preview frame.
    pub fn guidance(&self) -> &'static str {
        match self {
            Rejection::NoFace | Rejection::MultiFace => "Show only ONE face!",
            Rejection::TooFar => "Come closer!",
            Rejection::EyesNotVisible => "Eyes not visible!",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QualityVerdict {
    /// The single face that passed every rule.
    Ok(BoundingBox),
    /// `face` is set when exactly one face was found but it failed a later rule.
    Rejected {
        reason: Rejection,
        face: Option<BoundingBox>,
    },
}

impl QualityVerdict {
    pub fn is_ok(&self) -> bool {
        matches!(self, QualityVerdict::Ok(_))
    }

    pub fn reason(&self) -> Option<Rejection> {
        match self {
            QualityVerdict::Ok(_) => None,
            QualityVerdict::Rejected { reason, .. } => Some(*reason),
        }
    }

    pub fn face(&self) -> Option<&BoundingBox> {
        match self {
            QualityVerdict::Ok(face) => Some(face),
            QualityVerdict::Rejected { face, .. } => face.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QualityFilter {
    min_face_size: f32,
}

impl QualityFilter {
    pub fn new(min_face_size: u32) -> Self {
        Self {
            min_face_size: min_face_size as f32,
        }
    }

    /// Judge one frame from its face boxes.
    ///
    /// `eyes_of` is only called once a single, large enough face was found.
    /// Eye boxes count when their centre lies inside the face box.
    pub fn evaluate<F>(&self, faces: &[BoundingBox], mut eyes_of: F) -> QualityVerdict
    where
        F: FnMut(&BoundingBox) -> Vec<BoundingBox>,
    {
        let face = match faces {
            [] => {
                return QualityVerdict::Rejected {
                    reason: Rejection::NoFace,
                    face: None,
                }
            }
            [face] => face,
            _ => {
                return QualityVerdict::Rejected {
                    reason: Rejection::MultiFace,
                    face: None,
                }
            }
        };

        if face.width < self.min_face_size || face.height < self.min_face_size {
            return QualityVerdict::Rejected {
                reason: Rejection::TooFar,
                face: Some(face.clone()),
            };
        }

        let visible_eyes = eyes_of(face)
            .iter()
            .filter(|eye| face.contains(eye.center()))
            .count();
        if visible_eyes < MIN_VISIBLE_EYES {
            return QualityVerdict::Rejected {
                reason: Rejection::EyesNotVisible,
                face: Some(face.clone()),
            };
        }

        QualityVerdict::Ok(face.clone())
    }
}

impl Default for QualityFilter {
    fn default() -> Self {
        Self::new(crate::types::Tunables::default().min_face_size)
    }
}
