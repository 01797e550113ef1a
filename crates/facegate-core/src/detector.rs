//! SCRFD face detector via ONNX Runtime, plus landmark-derived eye boxes.
//!
//! SCRFD is anchor-free over three strides; each detection carries five
//! landmarks, the first two of which are the eyes. [`LandmarkEyeDetector`]
//! checks those against the head pose and the pixels under them so the
//! quality filter's eye check does not need a second model.

use crate::types::BoundingBox;
use crate::vision::{CapabilityError, EyeDetector, FaceDetector};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// Eye box edge as a fraction of the face width.
const EYE_BOX_FRACTION: f32 = 0.2;
/// Minimum horizontal eye spacing as a fraction of the face width. SCRFD
/// still regresses both eye points on a profile face, just squeezed together.
const MIN_EYE_SPACING: f32 = 0.25;
/// Minimum luma standard deviation inside an eye box.
const MIN_EYE_CONTRAST: f32 = 12.0;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<DetectorError> for CapabilityError {
    fn from(err: DetectorError) -> Self {
        CapabilityError::FaceDetection(err.to_string())
    }
}

/// Maps letterboxed model coordinates back to frame coordinates.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl LetterboxInfo {
    fn fit(width: u32, height: u32, target: usize) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: (target as f32 - new_w) / 2.0,
            pad_y: (target as f32 - new_h) / 2.0,
        }
    }

    fn to_frame(&self, (x, y): (f32, f32)) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor indices for one stride: (score, bbox, kps).
type StrideOutputIndices = (usize, usize, usize);

pub struct ScrfdFaceDetector {
    session: Session,
    input_size: usize,
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdFaceDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs 9 outputs (score/bbox/kps per stride), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::info!(path = %model_path.display(), outputs = ?output_names, ?stride_indices, "loaded SCRFD model");

        Ok(Self {
            session,
            input_size: SCRFD_INPUT_SIZE,
            stride_indices,
        })
    }

    /// Detect faces in an RGB frame, highest confidence first.
    pub fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = preprocess(frame, self.input_size);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut detections = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[pos];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = extract(score_idx, "scores")?;
            let bboxes = extract(bbox_idx, "bboxes")?;
            let kps = extract(kps_idx, "kps")?;

            detections.extend(decode_stride(
                StrideOutputs { scores, bboxes, kps },
                stride,
                self.input_size,
                &letterbox,
                SCRFD_CONFIDENCE_THRESHOLD,
            ));
        }

        Ok(nms(detections, SCRFD_NMS_THRESHOLD))
    }
}

impl FaceDetector for ScrfdFaceDetector {
    fn detect_faces(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, CapabilityError> {
        Ok(self.detect(frame)?)
    }
}

/// Letterbox an RGB frame into a normalized NCHW tensor.
///
/// Padding is filled with the mean so it normalizes to zero.
fn preprocess(frame: &RgbImage, size: usize) -> (Array4<f32>, LetterboxInfo) {
    let letterbox = LetterboxInfo::fit(frame.width(), frame.height(), size);
    let new_w = ((frame.width() as f32 * letterbox.scale).round() as u32).max(1);
    let new_h = ((frame.height() as f32 * letterbox.scale).round() as u32).max(1);
    let resized = imageops::resize(frame, new_w, new_h, FilterType::Triangle);

    let pad_x = letterbox.pad_x.floor() as usize;
    let pad_y = letterbox.pad_y.floor() as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = (x as usize + pad_x, y as usize + pad_y);
        if tx >= size || ty >= size {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, letterbox)
}

/// Map output tensors to strides by name (`score_8`, `bbox_16`, ...), falling
/// back to the positional layout `[scores 8/16/32, bboxes 8/16/32, kps 8/16/32]`.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let mut named = [(0, 0, 0); 3];
    for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride), find("kps", stride)) {
            (Some(s), Some(b), Some(k)) => named[slot] = (s, b, k),
            _ => {
                tracing::debug!(?names, "SCRFD output names not recognized; using positional mapping");
                return [(0, 3, 6), (1, 4, 7), (2, 5, 8)];
            }
        }
    }
    named
}

struct StrideOutputs<'a> {
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

fn decode_stride(
    out: StrideOutputs<'_>,
    stride: usize,
    input_size: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid = input_size / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;
    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        let score = out.scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }
        let Some(offsets) = out.bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let ax = (cell % grid) as f32 * step;
        let ay = (cell / grid) as f32 * step;

        let (x1, y1) = letterbox.to_frame((ax - offsets[0] * step, ay - offsets[1] * step));
        let (x2, y2) = letterbox.to_frame((ax + offsets[2] * step, ay + offsets[3] * step));

        let landmarks = out.kps.get(idx * 10..idx * 10 + 10).map(|k| {
            std::array::from_fn(|i| letterbox.to_frame((ax + k[i * 2] * step, ay + k[i * 2 + 1] * step)))
        });

        detections.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }

    detections
}

/// Greedy non-maximum suppression; the result is sorted by confidence.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<BoundingBox> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

/// Eye boxes from the face detector's landmarks.
///
/// A landmark counts as a visible eye only when:
/// - it lies inside the face box,
/// - the pair is spread across the face and sits above the nose (frontal pose),
/// - the frame region around it has enough contrast to hold an eye.
///
/// Faces without landmarks yield no eyes, which the quality filter reports as
/// `EYES_NOT_VISIBLE`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LandmarkEyeDetector;

impl EyeDetector for LandmarkEyeDetector {
    fn detect_eyes(
        &mut self,
        frame: &RgbImage,
        face: &BoundingBox,
    ) -> Result<Vec<BoundingBox>, CapabilityError> {
        let Some(landmarks) = face.landmarks else {
            return Ok(Vec::new());
        };
        if !is_frontal(face, &landmarks) {
            tracing::trace!("eye landmarks not frontal");
            return Ok(Vec::new());
        }
        let edge = (face.width * EYE_BOX_FRACTION).max(1.0);

        Ok(landmarks[..2]
            .iter()
            .filter(|&&point| face.contains(point))
            .map(|&(x, y)| BoundingBox::new(x - edge / 2.0, y - edge / 2.0, edge, edge))
            .filter(|eye| luma_contrast(frame, eye) >= MIN_EYE_CONTRAST)
            .collect())
    }
}

/// Eyes far enough apart, both above the nose, nose between them.
fn is_frontal(face: &BoundingBox, landmarks: &[(f32, f32); 5]) -> bool {
    let [left, right, nose, ..] = *landmarks;
    let (lo, hi) = (left.0.min(right.0), left.0.max(right.0));
    hi - lo >= face.width * MIN_EYE_SPACING
        && left.1 < nose.1
        && right.1 < nose.1
        && (lo..=hi).contains(&nose.0)
}

/// Standard deviation of luma over `region`, clipped to the frame.
fn luma_contrast(frame: &RgbImage, region: &BoundingBox) -> f32 {
    let Some((x0, y0, w, h)) = region.clamp_to(frame.width(), frame.height()) else {
        return 0.0;
    };
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for y in y0..y0 + h {
        for x in x0..x0 + w {
            let [r, g, b] = frame.get_pixel(x, y).0;
            let luma = 0.299 * f64::from(r) + 0.587 * f64::from(g) + 0.114 * f64::from(b);
            sum += luma;
            sum_sq += luma * luma;
        }
    }
    let n = f64::from(w * h);
    let mean = sum / n;
    ((sum_sq / n - mean * mean).max(0.0).sqrt()) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox {
            confidence: conf,
            ..BoundingBox::new(x, y, w, h)
        }
    }

    #[test]
    fn test_iou_identical() {
        let a = make_bbox(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = make_bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = make_bbox(5.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
        let far = make_bbox(20.0, 20.0, 10.0, 10.0, 1.0);
        assert_eq!(iou(&a, &far), 0.0);
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let result = nms(
            vec![
                make_bbox(5.0, 5.0, 100.0, 100.0, 0.8),
                make_bbox(200.0, 200.0, 50.0, 50.0, 0.7),
                make_bbox(0.0, 0.0, 100.0, 100.0, 0.9),
            ],
            0.4,
        );
        let confidences: Vec<f32> = result.iter().map(|b| b.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.7]);
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_discover_output_indices() {
        let shuffled: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32",
            "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(
            discover_output_indices(&shuffled),
            [(2, 0, 1), (5, 3, 4), (8, 6, 7)]
        );

        let numeric: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(
            discover_output_indices(&numeric),
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        );
    }

    #[test]
    fn test_letterbox_maps_back_to_frame() {
        let letterbox = LetterboxInfo::fit(320, 240, 640);
        assert_eq!(letterbox.scale, 2.0);
        assert_eq!((letterbox.pad_x, letterbox.pad_y), (0.0, 80.0));
        let (x, y) = letterbox.to_frame((100.0 * 2.0, 50.0 * 2.0 + 80.0));
        assert!((x - 100.0).abs() < 1e-4 && (y - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_preprocess_pads_with_zero() {
        let frame = RgbImage::from_pixel(64, 32, image::Rgb([255, 255, 255]));
        let (tensor, letterbox) = preprocess(&frame, 64);
        assert_eq!(tensor.shape(), &[1, 3, 64, 64]);
        assert_eq!(letterbox.pad_y, 16.0);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        let inside = tensor[[0, 1, 32, 32]];
        assert!((inside - (255.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-3);
    }

    #[test]
    fn test_decode_stride_single_anchor() {
        // 64px input, stride 32: 2x2 grid, 8 anchors. Anchor 3 sits in cell (1, 0).
        let mut scores = vec![0.0; 8];
        scores[3] = 0.9;
        let mut bboxes = vec![0.0; 32];
        bboxes[12..16].copy_from_slice(&[0.5, 0.5, 0.5, 0.5]);
        let kps = vec![0.0; 80];
        let letterbox = LetterboxInfo { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };

        let dets = decode_stride(
            StrideOutputs { scores: &scores, bboxes: &bboxes, kps: &kps },
            32,
            64,
            &letterbox,
            0.5,
        );
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert_eq!((d.x, d.y, d.width, d.height), (16.0, -16.0, 32.0, 32.0));
        assert_eq!(d.landmarks.unwrap()[0], (32.0, 0.0));
    }

    const FRONTAL: [(f32, f32); 5] = [
        (150.0, 160.0),
        (250.0, 160.0),
        (200.0, 210.0),
        (160.0, 260.0),
        (240.0, 260.0),
    ];

    /// Grey frame with a light patch and dark pupil under each point.
    fn frame_with_eyes(points: &[(f32, f32)]) -> RgbImage {
        let mut frame = RgbImage::from_pixel(640, 480, image::Rgb([120, 120, 120]));
        for &(cx, cy) in points {
            let (cx, cy) = (cx as i32, cy as i32);
            for dy in -20i32..20 {
                for dx in -20i32..20 {
                    let shade = if dx.abs() < 8 && dy.abs() < 8 { 20 } else { 220 };
                    frame.put_pixel((cx + dx) as u32, (cy + dy) as u32, image::Rgb([shade; 3]));
                }
            }
        }
        frame
    }

    fn face_with(landmarks: [(f32, f32); 5]) -> BoundingBox {
        BoundingBox {
            landmarks: Some(landmarks),
            ..BoundingBox::new(100.0, 100.0, 200.0, 200.0)
        }
    }

    #[test]
    fn test_landmark_eyes_inside_face() {
        let frame = frame_with_eyes(&FRONTAL[..2]);
        let mut face = face_with(FRONTAL);
        let eyes = LandmarkEyeDetector.detect_eyes(&frame, &face).unwrap();
        assert_eq!(eyes.len(), 2);
        assert_eq!(eyes[0].center(), (150.0, 160.0));
        assert_eq!(eyes[0].width, 40.0);

        // Right eye pushed outside the face box.
        let mut shifted = FRONTAL;
        shifted[1] = (310.0, 160.0);
        face.landmarks = Some(shifted);
        let frame = frame_with_eyes(&shifted[..2]);
        assert_eq!(LandmarkEyeDetector.detect_eyes(&frame, &face).unwrap().len(), 1);

        face.landmarks = None;
        assert!(LandmarkEyeDetector.detect_eyes(&frame, &face).unwrap().is_empty());
    }

    #[test]
    fn test_flat_frame_has_no_eyes() {
        let frame = RgbImage::new(640, 480);
        let face = face_with(FRONTAL);
        assert!(LandmarkEyeDetector.detect_eyes(&frame, &face).unwrap().is_empty());
    }

    #[test]
    fn test_profile_landmarks_fail_quality_check() {
        use crate::quality::{QualityFilter, Rejection};

        // Head turned: eyes bunched on one side, nose outside their span.
        let profile = [
            (230.0, 160.0),
            (262.0, 162.0),
            (285.0, 210.0),
            (240.0, 260.0),
            (270.0, 260.0),
        ];
        let frame = frame_with_eyes(&profile[..2]);
        let face = face_with(profile);
        let mut eyes = LandmarkEyeDetector;
        let verdict = QualityFilter::new(120)
            .evaluate(&[face], |f| eyes.detect_eyes(&frame, f).unwrap());
        assert_eq!(verdict.reason(), Some(Rejection::EyesNotVisible));

        // Eyes below the nose point.
        let mut upside = FRONTAL;
        upside[2] = (200.0, 140.0);
        assert!(!is_frontal(&face_with(upside), &upside));
        assert!(is_frontal(&face_with(FRONTAL), &FRONTAL));
    }

    #[test]
    fn test_luma_contrast() {
        let flat = RgbImage::from_pixel(50, 50, image::Rgb([90, 90, 90]));
        assert_eq!(luma_contrast(&flat, &BoundingBox::new(10.0, 10.0, 20.0, 20.0)), 0.0);
        let eyes = frame_with_eyes(&[(100.0, 100.0)]);
        assert!(luma_contrast(&eyes, &BoundingBox::new(80.0, 80.0, 40.0, 40.0)) > MIN_EYE_CONTRAST);
        assert_eq!(luma_contrast(&flat, &BoundingBox::new(80.0, 80.0, 5.0, 5.0)), 0.0);
    }
}
