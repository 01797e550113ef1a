//! Mode orchestration behind the HTTP handlers.
//!
//! Every method here is blocking: camera open sleeps for the settle delay and
//! gallery reloads touch the disk. The HTTP layer runs them on the blocking
//! pool.

use crate::annotate::Annotator;
use crate::enroll::{lock, CommitFailure, EnrollProcessor, EnrollmentSlot, SharedEnrollment};
use crate::identify::IdentifyProcessor;
use crate::modes::{Mode, ModeBusy, ModeController, StopSignal};
use crate::stream::{FrameStream, StreamSettings};
use facegate_core::enrollment::{CommitOutcome, EnrollmentError};
use facegate_core::gallery::GalleryError;
use facegate_core::{
    EnrollmentSession, EnrollmentState, EuclideanMatcher, GalleryStore, Identity, QualityFilter,
    SampleStore, Tunables, UserRecordStore, Vision,
};
use facegate_hw::{CameraError, CameraManager, SharedCamera};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    ModeBusy(#[from] ModeBusy),
    #[error("{0:?} mode is not active")]
    NotStarted(Mode),
    #[error(transparent)]
    Enrollment(#[from] EnrollmentError),
    #[error("no enrolled identities; enroll someone first")]
    NoEnrolledIdentities,
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::ModeBusy(_) => "MODE_BUSY",
            ServiceError::NotStarted(_) => "NOT_STARTED",
            ServiceError::Enrollment(err) => err.code(),
            ServiceError::NoEnrolledIdentities => "NO_ENROLLED_IDENTITIES",
            ServiceError::Camera(_) => "CAMERA_UNAVAILABLE",
            ServiceError::Gallery(_) => "GALLERY_IO_ERROR",
            ServiceError::Internal(_) => "INTERNAL",
        }
    }
}

/// Persistent state the modes read and write.
pub struct Stores {
    pub gallery: Arc<GalleryStore>,
    pub samples: SampleStore,
    pub records: Arc<dyn UserRecordStore>,
}

#[derive(Debug, Clone, Copy)]
pub struct ServiceSettings {
    pub tunables: Tunables,
    pub identify_every: u32,
    pub stream: StreamSettings,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentStatus {
    pub active: bool,
    pub state: EnrollmentState,
    pub uid: Option<Identity>,
    pub name: Option<String>,
    pub streak: u32,
    pub required: u32,
    pub guidance: Option<String>,
    pub outcome: Option<CommitOutcome>,
    pub error: Option<CommitFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub version: &'static str,
    pub mode: Mode,
    pub camera_open: bool,
    pub gallery_size: usize,
}

pub struct Service {
    settings: ServiceSettings,
    cameras: CameraManager,
    modes: Arc<ModeController>,
    vision: Arc<Mutex<Vision>>,
    stores: Stores,
    enrollment: SharedEnrollment,
    annotator: Arc<Annotator>,
}

impl Service {
    pub fn new(
        settings: ServiceSettings,
        cameras: CameraManager,
        vision: Vision,
        stores: Stores,
        annotator: Annotator,
    ) -> Self {
        Self {
            settings,
            cameras,
            modes: ModeController::new(),
            vision: Arc::new(Mutex::new(vision)),
            stores,
            enrollment: Arc::new(Mutex::new(EnrollmentSlot::default())),
            annotator: Arc::new(annotator),
        }
    }

    /// Begin enrolling `name` under a fresh identity.
    pub fn start_enrollment(&self, name: &str, email: Option<&str>) -> Result<Identity, ServiceError> {
        let session =
            EnrollmentSession::start(name, email, self.settings.tunables.required_streak)?;
        let identity = session.identity().clone();

        self.enter(Mode::Enrolling)?;

        let mut slot = lock(&self.enrollment);
        if let Some(previous) = slot.session.as_mut() {
            if previous.state() != EnrollmentState::Committed {
                previous.cancel();
            }
        }
        *slot = EnrollmentSlot {
            session: Some(session),
            guidance: None,
            last_error: None,
        };
        Ok(identity)
    }

    /// Stop enrolling. Safe to call when enrollment is not running.
    pub fn stop_enrollment(&self) {
        if let Some(session) = lock(&self.enrollment).session.as_mut() {
            if session.state() != EnrollmentState::Committed {
                session.cancel();
            }
        }
        self.leave(Mode::Enrolling);
    }

    pub fn enrollment_status(&self) -> EnrollmentStatus {
        let slot = lock(&self.enrollment);
        let session = slot.session.as_ref();
        EnrollmentStatus {
            active: self.modes.current() == Mode::Enrolling,
            state: session.map_or(EnrollmentState::Idle, |s| s.state()),
            uid: session.map(|s| s.identity().clone()),
            name: session.map(|s| s.name().to_string()),
            streak: session.map_or(0, |s| s.streak()),
            required: session.map_or(self.settings.tunables.required_streak, |s| s.required_streak()),
            guidance: slot.guidance.clone(),
            outcome: session.and_then(|s| s.outcome().cloned()),
            error: slot.last_error.clone(),
        }
    }

    pub fn enrollment_stream(&self) -> Result<FrameStream<EnrollProcessor>, ServiceError> {
        let (camera, stop) = self.attach(Mode::Enrolling)?;
        let processor = EnrollProcessor {
            vision: Arc::clone(&self.vision),
            filter: QualityFilter::new(self.settings.tunables.min_face_size),
            slot: Arc::clone(&self.enrollment),
            samples: self.stores.samples.clone(),
            gallery: Arc::clone(&self.stores.gallery),
            records: Arc::clone(&self.stores.records),
            annotator: Arc::clone(&self.annotator),
            last_commit_attempt: None,
        };
        Ok(FrameStream::new(camera, processor, stop, self.settings.stream))
    }

    /// Begin identification. Returns the number of enrolled identities.
    pub fn start_identification(&self) -> Result<usize, ServiceError> {
        let gallery = self.stores.gallery.reload()?;
        if gallery.is_empty() {
            return Err(ServiceError::NoEnrolledIdentities);
        }
        self.enter(Mode::Identifying)?;
        Ok(gallery.len())
    }

    /// Stop identifying. Safe to call when identification is not running.
    pub fn stop_identification(&self) {
        self.leave(Mode::Identifying);
    }

    pub fn identification_stream(&self) -> Result<FrameStream<IdentifyProcessor>, ServiceError> {
        let (camera, stop) = self.attach(Mode::Identifying)?;
        // Pick up identities committed since identification started.
        let gallery = self.stores.gallery.reload().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "gallery reload failed; matching against cached copy");
            self.stores.gallery.snapshot()
        });
        tracing::info!(identities = gallery.len(), "identification stream started");

        let processor = IdentifyProcessor::new(
            Arc::clone(&self.vision),
            EuclideanMatcher::new(self.settings.tunables.match_threshold),
            gallery,
            Arc::clone(&self.stores.records),
            Arc::clone(&self.annotator),
            self.settings.identify_every,
        );
        Ok(FrameStream::new(camera, processor, stop, self.settings.stream))
    }

    pub fn status(&self) -> DaemonStatus {
        DaemonStatus {
            version: env!("CARGO_PKG_VERSION"),
            mode: self.modes.current(),
            camera_open: self.cameras.is_open(),
            gallery_size: self.stores.gallery.len(),
        }
    }

    fn enter(&self, mode: Mode) -> Result<(), ServiceError> {
        self.modes.begin(mode)?;
        if let Err(err) = self.cameras.acquire() {
            self.modes.end(mode);
            return Err(err.into());
        }
        Ok(())
    }

    fn leave(&self, mode: Mode) {
        if self.modes.end(mode) {
            self.cameras.release();
        }
    }

    fn attach(&self, mode: Mode) -> Result<(SharedCamera, StopSignal), ServiceError> {
        let stop = self.modes.attach(mode).ok_or(ServiceError::NotStarted(mode))?;
        let camera = self.cameras.acquire()?;
        if stop.is_stopped() && self.modes.current() == Mode::Idle {
            // Stopped while the camera was being reopened.
            self.cameras.release();
        }
        Ok((camera, stop))
    }
}
