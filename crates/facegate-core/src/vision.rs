//! Detection and embedding capabilities.
//!
//! The streaming pipeline only talks to these traits; concrete models live in
//! [`crate::detector`] and [`crate::recognizer`].

use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CapabilityError {
    #[error("face detection failed: {0}")]
    FaceDetection(String),
    #[error("eye detection failed: {0}")]
    EyeDetection(String),
    #[error("embedding failed: {0}")]
    Embedding(String),
}

/// `DetectFaces(frame) -> [BoundingBox]`
pub trait FaceDetector: Send {
    fn detect_faces(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, CapabilityError>;
}

/// `DetectEyes(regionOfInterest) -> [BoundingBox]`
///
/// The region of interest is `face` within `frame`; returned boxes are in
/// frame coordinates.
pub trait EyeDetector: Send {
    fn detect_eyes(
        &mut self,
        frame: &RgbImage,
        face: &BoundingBox,
    ) -> Result<Vec<BoundingBox>, CapabilityError>;
}

/// `Embed(faceImage) -> Vector128`
///
/// Returns one embedding per face found in the image; an empty result means
/// no face could be encoded.
pub trait FaceEmbedder: Send {
    fn embed(&mut self, face: &RgbImage) -> Result<Vec<Embedding>, CapabilityError>;
}

/// The three capabilities bundled for a capture pipeline.
pub struct Vision {
    pub faces: Box<dyn FaceDetector>,
    pub eyes: Box<dyn EyeDetector>,
    pub embedder: Box<dyn FaceEmbedder>,
}

/// Margin added around a face crop before re-detection, as a fraction of its size.
const REDETECT_MARGIN: f32 = 0.25;

/// Embedder that only encodes faces it can find again in the given image.
///
/// Enrollment samples are tight crops; an image the detector sees no face in
/// yields no embeddings, which enrollment reports as `ENCODING_FAILED`.
pub struct DetectingEmbedder {
    detector: Box<dyn FaceDetector>,
    embedder: Box<dyn FaceEmbedder>,
}

impl DetectingEmbedder {
    pub fn new(detector: Box<dyn FaceDetector>, embedder: Box<dyn FaceEmbedder>) -> Self {
        Self { detector, embedder }
    }
}

impl FaceEmbedder for DetectingEmbedder {
    fn embed(&mut self, face: &RgbImage) -> Result<Vec<Embedding>, CapabilityError> {
        if face.width() == 0 || face.height() == 0 {
            return Ok(Vec::new());
        }
        // Detectors miss faces that touch every edge of the image.
        let padded = pad(face, REDETECT_MARGIN);
        let found = self.detector.detect_faces(&padded)?;
        if found.is_empty() {
            tracing::debug!(width = face.width(), height = face.height(), "no face in sample");
        }

        let mut embeddings = Vec::with_capacity(found.len());
        for bbox in &found {
            if let Some(crop) = crop_face(&padded, bbox) {
                embeddings.extend(self.embedder.embed(&crop)?);
            }
        }
        Ok(embeddings)
    }
}

/// `src` centred on a mid-grey canvas with `margin` of its size on each side.
fn pad(src: &RgbImage, margin: f32) -> RgbImage {
    let dx = (src.width() as f32 * margin).round() as u32;
    let dy = (src.height() as f32 * margin).round() as u32;
    let mut canvas = RgbImage::from_pixel(
        src.width() + 2 * dx,
        src.height() + 2 * dy,
        image::Rgb([128, 128, 128]),
    );
    image::imageops::replace(&mut canvas, src, i64::from(dx), i64::from(dy));
    canvas
}

/// Copy the region under `face` out of `frame`, clipped to the frame bounds.
pub fn crop_face(frame: &RgbImage, face: &BoundingBox) -> Option<RgbImage> {
    let (x, y, w, h) = face.clamp_to(frame.width(), frame.height())?;
    Some(image::imageops::crop_imm(frame, x, y, w, h).to_image())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::sync::{Arc, Mutex};

    /// Reports a fixed set of boxes and remembers the image sizes it saw.
    struct ScriptedDetector {
        boxes: Vec<BoundingBox>,
        seen: Arc<Mutex<Vec<(u32, u32)>>>,
    }

    impl FaceDetector for ScriptedDetector {
        fn detect_faces(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, CapabilityError> {
            self.seen.lock().unwrap().push(frame.dimensions());
            Ok(self.boxes.clone())
        }
    }

    /// Encodes the crop width into the first component.
    struct WidthEmbedder;

    impl FaceEmbedder for WidthEmbedder {
        fn embed(&mut self, face: &RgbImage) -> Result<Vec<Embedding>, CapabilityError> {
            let mut values = vec![0.0; crate::types::EMBEDDING_DIM];
            values[0] = face.width() as f32;
            Ok(vec![Embedding::new(values).unwrap()])
        }
    }

    fn detecting(boxes: Vec<BoundingBox>) -> (DetectingEmbedder, Arc<Mutex<Vec<(u32, u32)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let detector = ScriptedDetector {
            boxes,
            seen: Arc::clone(&seen),
        };
        (DetectingEmbedder::new(Box::new(detector), Box::new(WidthEmbedder)), seen)
    }

    #[test]
    fn test_detecting_embedder_without_face_is_empty() {
        let (mut embedder, seen) = detecting(vec![]);
        let sample = RgbImage::from_pixel(160, 160, Rgb([128, 128, 128]));
        assert!(embedder.embed(&sample).unwrap().is_empty());
        assert_eq!(seen.lock().unwrap().as_slice(), &[(240, 240)]);
    }

    #[test]
    fn test_detecting_embedder_encodes_found_faces() {
        let (mut embedder, _) = detecting(vec![
            BoundingBox::new(40.0, 40.0, 100.0, 120.0),
            BoundingBox::new(0.0, 0.0, 30.0, 30.0),
        ]);
        let found = embedder.embed(&RgbImage::new(160, 160)).unwrap();
        let widths: Vec<f32> = found.iter().map(|e| e.values()[0]).collect();
        assert_eq!(widths, vec![100.0, 30.0]);

        assert!(embedder.embed(&RgbImage::new(0, 0)).unwrap().is_empty());
    }

    #[test]
    fn test_pad_centres_image() {
        let image = RgbImage::from_pixel(8, 4, Rgb([255, 0, 0]));
        let padded = pad(&image, 0.25);
        assert_eq!(padded.dimensions(), (12, 6));
        assert_eq!(padded.get_pixel(0, 0), &Rgb([128, 128, 128]));
        assert_eq!(padded.get_pixel(2, 1), &Rgb([255, 0, 0]));
        assert_eq!(padded.get_pixel(10, 5), &Rgb([128, 128, 128]));
    }

    #[test]
    fn test_crop_face_copies_region() {
        let mut frame = RgbImage::new(40, 30);
        frame.put_pixel(12, 8, Rgb([9, 9, 9]));
        let crop = crop_face(&frame, &BoundingBox::new(10.0, 5.0, 20.0, 10.0)).unwrap();
        assert_eq!(crop.dimensions(), (20, 10));
        assert_eq!(crop.get_pixel(2, 3), &Rgb([9, 9, 9]));
    }

    #[test]
    fn test_crop_face_outside_frame() {
        let frame = RgbImage::new(40, 30);
        assert!(crop_face(&frame, &BoundingBox::new(50.0, 5.0, 20.0, 10.0)).is_none());
    }
}
