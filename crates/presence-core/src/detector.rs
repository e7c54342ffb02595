//! Face location.
//!
//! [`FaceLocator`] is the capability the session loop depends on. The shipped
//! implementation wraps an SCRFD model run through ONNX Runtime: letterbox to a
//! square input, decode three anchor-free strides, suppress overlaps.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (place det_10g.onnx in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Finds face regions in a grayscale frame.
///
/// An empty result is a normal outcome, not an error.
pub trait FaceLocator {
    fn locate(&mut self, frame: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Detector sensitivity knobs.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct LocatorParams {
    /// Minimum anchor score for a candidate box.
    pub confidence_threshold: f32,
    /// Overlap above which the weaker of two boxes is dropped.
    pub nms_threshold: f32,
}

impl Default for LocatorParams {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            nms_threshold: 0.4,
        }
    }
}

/// Scale and padding applied when fitting the frame into the model input.
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: usize, height: usize) -> Self {
        let scale = (SCRFD_INPUT_SIZE as f32 / width as f32).min(SCRFD_INPUT_SIZE as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: (SCRFD_INPUT_SIZE as f32 - new_w) / 2.0,
            pad_y: (SCRFD_INPUT_SIZE as f32 - new_h) / 2.0,
        }
    }

    /// Map a point from model input space back to the source frame.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// (score tensor, bbox tensor) output positions for one stride.
type StrideOutputs = (usize, usize);

/// SCRFD-based face locator.
pub struct ScrfdLocator {
    session: Session,
    params: LocatorParams,
    stride_outputs: [StrideOutputs; 3],
}

impl ScrfdLocator {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str, params: LocatorParams) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let stride_outputs = map_stride_outputs(&output_names);
        tracing::info!(
            path = model_path,
            outputs = ?output_names,
            ?stride_outputs,
            confidence = params.confidence_threshold,
            nms = params.nms_threshold,
            "loaded SCRFD model"
        );

        Ok(Self {
            session,
            params,
            stride_outputs,
        })
    }

    fn input_tensor(frame: &GrayImage, letterbox: &Letterbox) -> Array4<f32> {
        let new_w = (frame.width() as f32 * letterbox.scale).round().max(1.0) as u32;
        let new_h = (frame.height() as f32 * letterbox.scale).round().max(1.0) as u32;
        let resized = imageops::resize(frame, new_w, new_h, FilterType::Triangle);

        let off_x = letterbox.pad_x.floor() as usize;
        let off_y = letterbox.pad_y.floor() as usize;

        // Padding is zero after normalisation, so only the image area is written.
        let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (tx, ty) = (x as usize + off_x, y as usize + off_y);
            if tx >= SCRFD_INPUT_SIZE || ty >= SCRFD_INPUT_SIZE {
                continue;
            }
            let value = (pixel.0[0] as f32 - SCRFD_MEAN) / SCRFD_STD;
            for channel in 0..3 {
                tensor[[0, channel, ty, tx]] = value;
            }
        }
        tensor
    }
}

impl FaceLocator for ScrfdLocator {
    fn locate(&mut self, frame: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }

        let letterbox = Letterbox::fit(frame.width() as usize, frame.height() as usize);
        let input = Self::input_tensor(frame, &letterbox);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_outputs[slot];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, boxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("boxes stride {stride}: {e}")))?;

            candidates.extend(decode_stride(
                scores,
                boxes,
                stride,
                &letterbox,
                self.params.confidence_threshold,
            ));
        }

        let faces = nms(candidates, self.params.nms_threshold);
        tracing::trace!(count = faces.len(), "faces located");
        Ok(faces)
    }
}

/// Find which outputs carry scores and boxes for each stride.
///
/// Exports named like `score_8`/`bbox_8` are mapped by name; anything else
/// uses the conventional order (scores 0-2, boxes 3-5, keypoints 6-8).
fn map_stride_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let position = |prefix: &str, stride: usize| {
        let wanted = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let by_name: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((position("score", stride)?, position("bbox", stride)?)))
        .collect();

    match by_name {
        Some(found) => [found[0], found[1], found[2]],
        None => [(0, 3), (1, 4), (2, 5)],
    }
}

/// Decode anchor-free boxes for one stride level, in source frame coordinates.
fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid = SCRFD_INPUT_SIZE / stride;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    (0..anchors)
        .filter_map(|idx| {
            let score = *scores.get(idx)?;
            if score <= threshold {
                return None;
            }
            let offsets = boxes.get(idx * 4..idx * 4 + 4)?;

            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid) as f32 * step;
            let cy = (cell / grid) as f32 * step;

            let (x1, y1) = letterbox.unmap(cx - offsets[0] * step, cy - offsets[1] * step);
            let (x2, y2) = letterbox.unmap(cx + offsets[2] * step, cy + offsets[3] * step);

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
            })
        })
        .collect()
}

/// Keep the strongest box of every overlapping group, strongest first.
fn nms(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
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
