//! Enrollment frame processing: quality gate, streak, capture and commit.

use crate::annotate::{Annotator, Mark, BAD, GOOD};
use crate::stream::FrameProcessor;
use facegate_core::enrollment::{CommitContext, EnrollmentError, Observation};
use facegate_core::{
    EnrollmentSession, EnrollmentState, GalleryStore, QualityFilter, SampleStore, UserRecordStore,
    Vision,
};
use image::RgbImage;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Minimum spacing between automatic commit retries after a record failure.
const COMMIT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Last commit failure, kept for status reporting.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CommitFailure {
    pub code: &'static str,
    pub message: String,
}

/// The enrollment session shared between the HTTP handlers and the stream.
#[derive(Default)]
pub struct EnrollmentSlot {
    pub session: Option<EnrollmentSession>,
    pub guidance: Option<String>,
    pub last_error: Option<CommitFailure>,
}

pub type SharedEnrollment = Arc<Mutex<EnrollmentSlot>>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct EnrollProcessor {
    pub(crate) vision: Arc<Mutex<Vision>>,
    pub(crate) filter: QualityFilter,
    pub(crate) slot: SharedEnrollment,
    pub(crate) samples: SampleStore,
    pub(crate) gallery: Arc<GalleryStore>,
    pub(crate) records: Arc<dyn UserRecordStore>,
    pub(crate) annotator: Arc<Annotator>,
    pub(crate) last_commit_attempt: Option<Instant>,
}

impl EnrollProcessor {
    fn retry_due(&self) -> bool {
        self.last_commit_attempt
            .map_or(true, |at| at.elapsed() >= COMMIT_RETRY_INTERVAL)
    }
}

impl FrameProcessor for EnrollProcessor {
    fn process(&mut self, frame: &mut RgbImage) {
        let mut vision = lock(&self.vision);
        let faces = vision.faces.detect_faces(frame).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "face detection failed; treating frame as empty");
            Vec::new()
        });
        let verdict = {
            let eyes = &mut vision.eyes;
            self.filter.evaluate(&faces, |face| {
                eyes.detect_eyes(frame, face).unwrap_or_else(|err| {
                    tracing::warn!(error = %err, "eye detection failed");
                    Vec::new()
                })
            })
        };

        let mut guard = lock(&self.slot);
        let slot = &mut *guard;
        if let Some(session) = slot.session.as_mut() {
            let observation = session.observe(frame, &verdict);
            let commit_now = match observation {
                Observation::Captured => true,
                Observation::AlreadyComplete => {
                    session.state() == EnrollmentState::Captured && self.retry_due()
                }
                _ => false,
            };

            match &observation {
                Observation::Rejected(reason) => {
                    slot.guidance = Some(reason.guidance().to_string());
                }
                Observation::Progress { streak, required } => {
                    slot.guidance = Some(format!("Hold still... {streak}/{required}"));
                }
                Observation::AlreadyComplete if session.state() == EnrollmentState::Committed => {
                    slot.guidance = Some("Registration Complete!".to_string());
                }
                _ => {}
            }

            if commit_now {
                self.last_commit_attempt = Some(Instant::now());
                let result = session.commit(CommitContext {
                    samples: &self.samples,
                    embedder: vision.embedder.as_mut(),
                    gallery: &self.gallery,
                    records: self.records.as_ref(),
                });
                match result {
                    Ok(outcome) => {
                        tracing::info!(identity = %outcome.identity, record_id = outcome.record_id, "registration complete");
                        slot.guidance = Some("SUCCESS! Registration Complete!".to_string());
                        slot.last_error = None;
                    }
                    Err(err) => {
                        tracing::warn!(code = err.code(), error = %err, "enrollment commit failed");
                        slot.guidance = Some(commit_guidance(&err).to_string());
                        slot.last_error = Some(CommitFailure {
                            code: err.code(),
                            message: err.to_string(),
                        });
                    }
                }
            }
        }
        let guidance = slot.guidance.clone();
        // Once registered only the completion text is shown.
        let show_faces = slot
            .session
            .as_ref()
            .map_or(true, |s| s.state() != EnrollmentState::Committed);
        drop(guard);
        drop(vision);

        let color = if verdict.is_ok() { GOOD } else { BAD };
        for face in faces.iter().filter(|_| show_faces) {
            self.annotator.draw_mark(
                frame,
                &Mark {
                    face: face.clone(),
                    color,
                    caption: None,
                },
            );
        }
        if let Some(text) = guidance {
            self.annotator.draw_guidance(frame, &[&text]);
        }
    }
}

fn commit_guidance(err: &EnrollmentError) -> &'static str {
    match err {
        EnrollmentError::EncodingFailed => "Encoding Failed! Try again",
        EnrollmentError::RecordStore { .. } => "DB Error!",
        EnrollmentError::SampleIo(_) | EnrollmentError::GalleryIo(_) => "Save Failed! Try again",
        EnrollmentError::NameRequired | EnrollmentError::NotCaptured(_) => "Enrollment not ready",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facegate_core::vision::{CapabilityError, EyeDetector, FaceDetector, FaceEmbedder};
    use facegate_core::{BoundingBox, Embedding, SqliteUserRecords};
    use image::Rgb;
    use tempfile::TempDir;

    const GREY: Rgb<u8> = Rgb([90, 90, 90]);

    struct OneFace;

    impl FaceDetector for OneFace {
        fn detect_faces(&mut self, _frame: &RgbImage) -> Result<Vec<BoundingBox>, CapabilityError> {
            Ok(vec![BoundingBox::new(200.0, 100.0, 200.0, 200.0)])
        }
    }

    struct TwoEyes;

    impl EyeDetector for TwoEyes {
        fn detect_eyes(
            &mut self,
            _frame: &RgbImage,
            _face: &BoundingBox,
        ) -> Result<Vec<BoundingBox>, CapabilityError> {
            Ok(vec![
                BoundingBox::new(240.0, 140.0, 40.0, 40.0),
                BoundingBox::new(320.0, 140.0, 40.0, 40.0),
            ])
        }
    }

    struct FixedEmbedder;

    impl FaceEmbedder for FixedEmbedder {
        fn embed(&mut self, _face: &RgbImage) -> Result<Vec<Embedding>, CapabilityError> {
            Ok(vec![Embedding::new(vec![0.2; 128]).unwrap()])
        }
    }

    fn processor(tmp: &TempDir, required: u32) -> EnrollProcessor {
        let slot = SharedEnrollment::default();
        lock(&slot).session = Some(EnrollmentSession::start("Alice", None, required).unwrap());
        EnrollProcessor {
            vision: Arc::new(Mutex::new(Vision {
                faces: Box::new(OneFace),
                eyes: Box::new(TwoEyes),
                embedder: Box::new(FixedEmbedder),
            })),
            filter: QualityFilter::new(120),
            slot,
            samples: SampleStore::new(tmp.path().join("dataset")),
            gallery: Arc::new(GalleryStore::open(tmp.path().join("gallery.json")).unwrap()),
            records: Arc::new(SqliteUserRecords::open_in_memory().unwrap()),
            annotator: Arc::new(Annotator::without_text()),
            last_commit_attempt: None,
        }
    }

    #[test]
    fn test_boxes_hidden_after_registration() {
        let tmp = TempDir::new().unwrap();
        let mut enroll = processor(&tmp, 2);

        let mut frame = RgbImage::from_pixel(640, 480, GREY);
        enroll.process(&mut frame);
        assert_eq!(frame.get_pixel(200, 150), &GOOD);
        assert_eq!(lock(&enroll.slot).guidance.as_deref(), Some("Hold still... 1/2"));

        let mut frame = RgbImage::from_pixel(640, 480, GREY);
        enroll.process(&mut frame);
        let state = lock(&enroll.slot).session.as_ref().map(|s| s.state());
        assert_eq!(state, Some(EnrollmentState::Committed));
        assert_eq!(frame.get_pixel(200, 150), &GREY);

        let mut frame = RgbImage::from_pixel(640, 480, GREY);
        enroll.process(&mut frame);
        assert_eq!(frame.get_pixel(200, 150), &GREY);
        assert_eq!(
            lock(&enroll.slot).guidance.as_deref(),
            Some("Registration Complete!")
        );
    }

    #[test]
    fn test_rejected_frame_draws_red_box() {
        let tmp = TempDir::new().unwrap();
        let mut enroll = processor(&tmp, 5);
        enroll.filter = QualityFilter::new(300);

        let mut frame = RgbImage::from_pixel(640, 480, GREY);
        enroll.process(&mut frame);
        assert_eq!(frame.get_pixel(200, 150), &BAD);
        assert_eq!(lock(&enroll.slot).guidance.as_deref(), Some("Come closer!"));
    }
}
