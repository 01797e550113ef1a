//! Rebuild gallery entries from the stored face samples.
//!
//! Used to reconcile the gallery with the sample directory, for example after
//! an enrollment that saved its sample but never reached the gallery.

use crate::gallery::{GalleryError, GalleryStore, Upsert};
use crate::samples::{SampleError, SampleStore};
use crate::types::Identity;
use crate::vision::FaceEmbedder;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error(transparent)]
    Samples(#[from] SampleError),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
}

/// What happened to each sample.
#[derive(Debug, Default)]
pub struct EncodeReport {
    pub added: Vec<Identity>,
    pub replaced: Vec<Identity>,
    /// Samples the embedder found no face in.
    pub no_face: Vec<Identity>,
    /// Samples that could not be decoded or embedded, with the reason.
    pub failed: Vec<(Identity, String)>,
}

impl EncodeReport {
    pub fn encoded(&self) -> usize {
        self.added.len() + self.replaced.len()
    }
}

/// Embed every stored sample and upsert it into `gallery` under its identity.
///
/// Bad samples are reported and skipped. Only a sample listing or gallery
/// write failure stops the run.
pub fn encode_samples(
    samples: &SampleStore,
    embedder: &mut dyn FaceEmbedder,
    gallery: &GalleryStore,
) -> Result<EncodeReport, EncodeError> {
    let mut report = EncodeReport::default();

    for (identity, path) in samples.list()? {
        let face = match image::open(&path) {
            Ok(img) => img.to_rgb8(),
            Err(err) => {
                tracing::warn!(identity = %identity, path = %path.display(), error = %err, "unreadable sample");
                report.failed.push((identity, err.to_string()));
                continue;
            }
        };
        let embedding = match embedder.embed(&face) {
            Ok(found) => found.into_iter().next(),
            Err(err) => {
                tracing::warn!(identity = %identity, error = %err, "sample embedding failed");
                report.failed.push((identity, err.to_string()));
                continue;
            }
        };
        let Some(embedding) = embedding else {
            tracing::warn!(identity = %identity, "no face in sample");
            report.no_face.push(identity);
            continue;
        };

        match gallery.upsert(identity.clone(), embedding)? {
            Upsert::Inserted(_) => report.added.push(identity),
            Upsert::Replaced(_) => report.replaced.push(identity),
        }
    }

    tracing::info!(
        encoded = report.encoded(),
        no_face = report.no_face.len(),
        failed = report.failed.len(),
        "samples encoded"
    );
    Ok(report)
}
