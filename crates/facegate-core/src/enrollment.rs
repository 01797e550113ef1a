//! Enrollment session state machine.
//!
//! ```text
//! IDLE -> ACCUMULATING -> CAPTURED -> COMMITTED
//!              ^              |
//!              +--------------+  sample, encoding or gallery failure
//! ```
//!
//! A session starts in `Accumulating` with a fresh identity. Consecutive good
//! frames build a streak; any rejected frame resets it. When the streak reaches
//! the required length the face crop of that frame becomes the canonical
//! sample and the session moves to `Captured`, at most once. [`commit`]
//! persists the sample, embeds it, upserts the gallery and creates the user
//! record. A record failure leaves the gallery step done and the session in
//! `Captured`, so the next `commit` only retries the record.
//!
//! [`commit`]: EnrollmentSession::commit

use crate::gallery::{GalleryError, GalleryStore, Upsert};
use crate::quality::{QualityVerdict, Rejection};
use crate::records::{RecordError, RecordId, UserRecordStore};
use crate::samples::{SampleError, SampleStore};
use crate::types::Identity;
use crate::vision::{crop_face, FaceEmbedder};
use image::RgbImage;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnrollmentState {
    Idle,
    Accumulating,
    Captured,
    Committed,
}

/// What a single frame did to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// Good frame; the streak grew.
    Progress { streak: u32, required: u32 },
    /// Bad frame; the streak was reset.
    Rejected(Rejection),
    /// This frame completed the streak and its crop is now the canonical sample.
    Captured,
    /// Capture already happened; the frame was ignored.
    AlreadyComplete,
    /// The session was cancelled.
    Inactive,
}

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("a display name is required")]
    NameRequired,
    #[error("no captured sample to commit (state {0:?})")]
    NotCaptured(EnrollmentState),
    #[error("failed to persist canonical sample: {0}")]
    SampleIo(#[from] SampleError),
    #[error("no face could be encoded from the captured sample")]
    EncodingFailed,
    #[error("gallery write failed: {0}")]
    GalleryIo(#[from] GalleryError),
    #[error("user record for {identity} could not be created: {source}")]
    RecordStore {
        identity: Identity,
        #[source]
        source: RecordError,
    },
}

impl EnrollmentError {
    pub fn code(&self) -> &'static str {
        match self {
            EnrollmentError::NameRequired => "INVALID_REQUEST",
            EnrollmentError::NotCaptured(_) => "NOT_CAPTURED",
            EnrollmentError::SampleIo(_) => "SAMPLE_IO_ERROR",
            EnrollmentError::EncodingFailed => "ENCODING_FAILED",
            EnrollmentError::GalleryIo(_) => "GALLERY_IO_ERROR",
            EnrollmentError::RecordStore { .. } => "RECORD_STORE_ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommitOutcome {
    pub identity: Identity,
    pub record_id: RecordId,
    /// True when an existing gallery entry was overwritten.
    pub replaced: bool,
    pub gallery_len: usize,
}

/// Collaborators needed to turn a captured sample into a committed identity.
pub struct CommitContext<'a> {
    pub samples: &'a SampleStore,
    pub embedder: &'a mut dyn FaceEmbedder,
    pub gallery: &'a GalleryStore,
    pub records: &'a dyn UserRecordStore,
}

pub struct EnrollmentSession {
    identity: Identity,
    name: String,
    email: Option<String>,
    required_streak: u32,
    streak: u32,
    state: EnrollmentState,
    sample: Option<RgbImage>,
    sample_saved: bool,
    gallery_write: Option<Upsert>,
    outcome: Option<CommitOutcome>,
}

impl EnrollmentSession {
    /// Begin enrollment under a freshly allocated identity.
    pub fn start(
        name: &str,
        email: Option<&str>,
        required_streak: u32,
    ) -> Result<Self, EnrollmentError> {
        Self::resume(Identity::generate(), name, email, required_streak)
    }

    /// Begin enrollment under an existing identity; committing overwrites
    /// whatever the gallery holds for it.
    pub fn resume(
        identity: Identity,
        name: &str,
        email: Option<&str>,
        required_streak: u32,
    ) -> Result<Self, EnrollmentError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EnrollmentError::NameRequired);
        }
        let email = email.map(str::trim).filter(|e| !e.is_empty());

        tracing::info!(identity = %identity, name, "enrollment started");
        Ok(Self {
            identity,
            name: name.to_string(),
            email: email.map(str::to_string),
            required_streak: required_streak.max(1),
            streak: 0,
            state: EnrollmentState::Accumulating,
            sample: None,
            sample_saved: false,
            gallery_write: None,
            outcome: None,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn state(&self) -> EnrollmentState {
        self.state
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }

    pub fn required_streak(&self) -> u32 {
        self.required_streak
    }

    /// Canonical sample, present once captured.
    pub fn sample(&self) -> Option<&RgbImage> {
        self.sample.as_ref()
    }

    pub fn outcome(&self) -> Option<&CommitOutcome> {
        self.outcome.as_ref()
    }

    /// Feed one frame and its quality verdict.
    pub fn observe(&mut self, frame: &RgbImage, verdict: &QualityVerdict) -> Observation {
        match self.state {
            EnrollmentState::Idle => return Observation::Inactive,
            EnrollmentState::Captured | EnrollmentState::Committed => {
                return Observation::AlreadyComplete
            }
            EnrollmentState::Accumulating => {}
        }

        let face = match verdict {
            QualityVerdict::Ok(face) => face,
            QualityVerdict::Rejected { reason, .. } => {
                self.streak = 0;
                return Observation::Rejected(*reason);
            }
        };

        self.streak += 1;
        if self.streak < self.required_streak {
            return Observation::Progress {
                streak: self.streak,
                required: self.required_streak,
            };
        }

        let Some(crop) = crop_face(frame, face) else {
            tracing::warn!(identity = %self.identity, "face box lies outside the frame; restarting streak");
            self.streak = 0;
            return Observation::Rejected(Rejection::NoFace);
        };

        self.sample = Some(crop);
        self.state = EnrollmentState::Captured;
        tracing::info!(identity = %self.identity, streak = self.streak, "enrollment sample captured");
        Observation::Captured
    }

    /// Persist, embed and register the captured sample.
    ///
    /// Sample, encoding and gallery failures send the session back to
    /// `Accumulating` with a zero streak. A record failure keeps it in
    /// `Captured` with the gallery write done; calling `commit` again retries
    /// only the record.
    pub fn commit(&mut self, ctx: CommitContext<'_>) -> Result<CommitOutcome, EnrollmentError> {
        if self.state == EnrollmentState::Committed {
            if let Some(outcome) = &self.outcome {
                return Ok(outcome.clone());
            }
        }
        if self.state != EnrollmentState::Captured {
            return Err(EnrollmentError::NotCaptured(self.state));
        }
        let Some(sample) = self.sample.as_ref() else {
            return Err(EnrollmentError::NotCaptured(self.state));
        };

        let prior_write = self.gallery_write;
        let upsert = match prior_write {
            Some(upsert) => upsert,
            None => {
                if !self.sample_saved {
                    if let Err(err) = ctx.samples.save(&self.identity, sample) {
                        self.rewind();
                        return Err(err.into());
                    }
                    self.sample_saved = true;
                }

                let embedding = match ctx.embedder.embed(sample) {
                    Ok(found) => found.into_iter().next(),
                    Err(err) => {
                        tracing::warn!(identity = %self.identity, error = %err, "embedding capability failed");
                        None
                    }
                };
                let Some(embedding) = embedding else {
                    tracing::warn!(identity = %self.identity, "no face encoded from sample; capture must be retried");
                    self.rewind();
                    return Err(EnrollmentError::EncodingFailed);
                };

                match ctx.gallery.upsert(self.identity.clone(), embedding) {
                    Ok(upsert) => {
                        self.gallery_write = Some(upsert);
                        upsert
                    }
                    Err(err) => {
                        tracing::error!(identity = %self.identity, error = %err, "gallery commit failed");
                        self.rewind();
                        return Err(err.into());
                    }
                }
            }
        };

        let record_id = ctx
            .records
            .create_user(&self.name, self.email.as_deref(), &self.identity)
            .map_err(|source| {
                tracing::error!(
                    identity = %self.identity,
                    error = %source,
                    "gallery holds identity but user record creation failed"
                );
                EnrollmentError::RecordStore {
                    identity: self.identity.clone(),
                    source,
                }
            })?;

        let outcome = CommitOutcome {
            identity: self.identity.clone(),
            record_id,
            replaced: matches!(upsert, Upsert::Replaced(_)),
            gallery_len: ctx.gallery.len(),
        };
        self.state = EnrollmentState::Committed;
        self.outcome = Some(outcome.clone());
        tracing::info!(identity = %self.identity, record_id, "enrollment committed");
        Ok(outcome)
    }

    /// Abandon the session. The identity is discarded.
    pub fn cancel(&mut self) {
        if self.state != EnrollmentState::Committed {
            tracing::info!(identity = %self.identity, state = ?self.state, "enrollment cancelled");
        }
        self.state = EnrollmentState::Idle;
        self.streak = 0;
        self.sample = None;
    }

    fn rewind(&mut self) {
        self.state = EnrollmentState::Accumulating;
        self.streak = 0;
        self.sample = None;
        self.sample_saved = false;
        self.gallery_write = None;
    }
}
