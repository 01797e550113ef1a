//! Identification frame processing.

use crate::annotate::{Annotator, Mark, BAD, GOOD, UNRECORDED};
use crate::enroll::lock;
use crate::stream::FrameProcessor;
use facegate_core::records::{resolve_label, IdentityLabel};
use facegate_core::vision::crop_face;
use facegate_core::{EuclideanMatcher, Gallery, Matcher, UserRecordStore, Vision};
use image::RgbImage;
use std::sync::{Arc, Mutex};

const UNKNOWN_LABEL: &str = "Unknown";

/// Classifies every detected face on every `every`-th frame and redraws the
/// last result on the frames in between.
pub struct IdentifyProcessor {
    vision: Arc<Mutex<Vision>>,
    matcher: EuclideanMatcher,
    gallery: Gallery,
    records: Arc<dyn UserRecordStore>,
    annotator: Arc<Annotator>,
    every: u32,
    frames: u64,
    marks: Vec<Mark>,
}

impl IdentifyProcessor {
    pub fn new(
        vision: Arc<Mutex<Vision>>,
        matcher: EuclideanMatcher,
        gallery: Gallery,
        records: Arc<dyn UserRecordStore>,
        annotator: Arc<Annotator>,
        every: u32,
    ) -> Self {
        Self {
            vision,
            matcher,
            gallery,
            records,
            annotator,
            every: every.max(1),
            frames: 0,
            marks: Vec::new(),
        }
    }

    /// Marks from the most recent classified frame.
    pub fn marks(&self) -> &[Mark] {
        &self.marks
    }

    fn classify(&self, frame: &RgbImage) -> Vec<Mark> {
        let mut vision = lock(&self.vision);
        let faces = vision.faces.detect_faces(frame).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "face detection failed");
            Vec::new()
        });

        let mut marks = Vec::with_capacity(faces.len());
        for face in faces {
            let Some(crop) = crop_face(frame, &face) else {
                continue;
            };
            let probe = match vision.embedder.embed(&crop) {
                Ok(found) => found.into_iter().next(),
                Err(err) => {
                    tracing::warn!(error = %err, "embedding failed");
                    None
                }
            };

            let (color, caption) = match probe.map(|p| self.matcher.find(&p, &self.gallery)) {
                Some(result) => match &result.identity {
                    Some(identity) => {
                        tracing::debug!(identity = %identity, distance = ?result.distance, "face matched");
                        match resolve_label(self.records.as_ref(), identity) {
                            IdentityLabel::Recorded(text) => (GOOD, text),
                            IdentityLabel::Unrecorded(text) => (UNRECORDED, text),
                        }
                    }
                    None => {
                        tracing::debug!(nearest = ?result.distance, "face unknown");
                        (BAD, UNKNOWN_LABEL.to_string())
                    }
                },
                None => (BAD, UNKNOWN_LABEL.to_string()),
            };
            marks.push(Mark {
                face,
                color,
                caption: Some(caption),
            });
        }
        marks
    }
}

impl FrameProcessor for IdentifyProcessor {
    fn process(&mut self, frame: &mut RgbImage) {
        if self.frames % u64::from(self.every) == 0 {
            self.marks = self.classify(frame);
        }
        self.frames += 1;

        for mark in &self.marks {
            self.annotator.draw_mark(frame, mark);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facegate_core::vision::{CapabilityError, EyeDetector, FaceDetector, FaceEmbedder};
    use facegate_core::{BoundingBox, Embedding, SqliteUserRecords};
    use image::Rgb;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const GREY: Rgb<u8> = Rgb([90, 90, 90]);

    /// Finds one face and counts how often it was asked.
    struct CountingFaces(Arc<AtomicUsize>);

    impl FaceDetector for CountingFaces {
        fn detect_faces(&mut self, _frame: &RgbImage) -> Result<Vec<BoundingBox>, CapabilityError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(vec![BoundingBox::new(100.0, 80.0, 150.0, 150.0)])
        }
    }

    struct NoEyes;

    impl EyeDetector for NoEyes {
        fn detect_eyes(
            &mut self,
            _frame: &RgbImage,
            _face: &BoundingBox,
        ) -> Result<Vec<BoundingBox>, CapabilityError> {
            Ok(Vec::new())
        }
    }

    struct FixedEmbedder;

    impl FaceEmbedder for FixedEmbedder {
        fn embed(&mut self, _face: &RgbImage) -> Result<Vec<Embedding>, CapabilityError> {
            Ok(vec![Embedding::new(vec![0.3; 128]).unwrap()])
        }
    }

    #[test]
    fn test_models_run_on_every_other_frame() {
        let calls = Arc::new(AtomicUsize::new(0));
        let vision = Vision {
            faces: Box::new(CountingFaces(Arc::clone(&calls))),
            eyes: Box::new(NoEyes),
            embedder: Box::new(FixedEmbedder),
        };
        let mut identify = IdentifyProcessor::new(
            Arc::new(Mutex::new(vision)),
            EuclideanMatcher::new(0.6),
            Gallery::new(),
            Arc::new(SqliteUserRecords::open_in_memory().unwrap()),
            Arc::new(Annotator::without_text()),
            2,
        );

        let mut seen = Vec::new();
        for frame_no in 0..5 {
            let mut frame = RgbImage::from_pixel(320, 240, GREY);
            identify.process(&mut frame);
            seen.push(calls.load(Ordering::SeqCst));

            // Skipped frames still carry the last result.
            assert_eq!(frame.get_pixel(100, 120), &BAD, "frame {frame_no}");
            assert_eq!(identify.marks().len(), 1);
            assert_eq!(identify.marks()[0].caption.as_deref(), Some(UNKNOWN_LABEL));
        }
        assert_eq!(seen, vec![1, 1, 2, 2, 3]);
    }

    #[test]
    fn test_zero_interval_classifies_every_frame() {
        let calls = Arc::new(AtomicUsize::new(0));
        let vision = Vision {
            faces: Box::new(CountingFaces(Arc::clone(&calls))),
            eyes: Box::new(NoEyes),
            embedder: Box::new(FixedEmbedder),
        };
        let mut identify = IdentifyProcessor::new(
            Arc::new(Mutex::new(vision)),
            EuclideanMatcher::new(0.6),
            Gallery::new(),
            Arc::new(SqliteUserRecords::open_in_memory().unwrap()),
            Arc::new(Annotator::without_text()),
            0,
        );
        for _ in 0..3 {
            identify.process(&mut RgbImage::new(320, 240));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
