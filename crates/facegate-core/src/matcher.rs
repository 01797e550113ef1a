use crate::gallery::Gallery;
use crate::types::{Embedding, Identity, Tunables};

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Matched identity, or `None` for UNKNOWN.
    pub identity: Option<Identity>,
    /// Distance to the nearest gallery entry; `None` for an empty gallery.
    pub distance: Option<f32>,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        self.identity.is_some()
    }
}

/// Strategy for comparing a probe embedding against the gallery.
pub trait Matcher {
    fn find(&self, probe: &Embedding, gallery: &Gallery) -> MatchResult;
}

/// Nearest neighbour by Euclidean distance with a strict acceptance threshold.
///
/// Ties on the minimum distance resolve to the earliest gallery entry.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub threshold: f32,
}

impl EuclideanMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self::new(Tunables::default().match_threshold)
    }
}

impl Matcher for EuclideanMatcher {
    fn find(&self, probe: &Embedding, gallery: &Gallery) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;

        for (i, entry) in gallery.entries().iter().enumerate() {
            let distance = probe.euclidean_distance(&entry.embedding);
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((i, distance));
            }
        }

        match best {
            Some((idx, distance)) if distance < self.threshold => MatchResult {
                identity: Some(gallery.entries()[idx].identity.clone()),
                distance: Some(distance),
            },
            _ => MatchResult {
                identity: None,
                distance: best.map(|(_, d)| d),
            },
        }
    }
}
