//! Nearest-template identification.
//!
//! Every face and reference is resampled to the same 100x100 grid and compared
//! by the sum of squared pixel differences. The closest reference wins, but only
//! if it is strictly under a single global threshold.

use crate::gallery::Gallery;
use crate::types::{DetectedFace, MatchResult};
use image::imageops::{self, FilterType};
use image::GrayImage;

/// Side length of the comparison grid.
pub const TEMPLATE_SIZE: u32 = 100;

/// Distances at or above this are rejected as `Unknown`.
pub const ACCEPTANCE_THRESHOLD: u64 = 1_000_000;

/// Strategy for identifying a detected face against the gallery.
pub trait Matcher {
    fn identify(&self, face: &DetectedFace, gallery: &Gallery) -> MatchResult;
}

/// Sum-of-squared-difference matcher over fixed-size templates.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateMatcher;

impl TemplateMatcher {
    /// Resample to the comparison grid. `None` for images with no pixels.
    pub fn template(image: &GrayImage) -> Option<GrayImage> {
        if image.width() == 0 || image.height() == 0 {
            return None;
        }
        Some(imageops::resize(image, TEMPLATE_SIZE, TEMPLATE_SIZE, FilterType::Triangle))
    }

    /// Distance between two images after resampling both to the template grid.
    pub fn distance(a: &GrayImage, b: &GrayImage) -> Option<u64> {
        Some(ssd(&Self::template(a)?, &Self::template(b)?))
    }
}

impl Matcher for TemplateMatcher {
    fn identify(&self, face: &DetectedFace, gallery: &Gallery) -> MatchResult {
        let Some(query) = Self::template(&face.crop) else {
            return MatchResult::Unknown;
        };

        let mut best: Option<(&str, u64)> = None;
        for (name, reference) in gallery.iter() {
            let Some(candidate) = Self::template(reference) else {
                tracing::debug!(name, "skipping degenerate reference image");
                continue;
            };
            let distance = ssd(&query, &candidate);
            // Strict comparison: the first of equally close candidates stays.
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((name, distance));
            }
        }

        match best {
            Some((name, distance)) if distance < ACCEPTANCE_THRESHOLD => {
                tracing::debug!(name, distance, "face identified");
                MatchResult::Identified {
                    name: name.to_string(),
                    distance,
                }
            }
            Some((name, distance)) => {
                tracing::debug!(closest = name, distance, "face rejected");
                MatchResult::Unknown
            }
            None => MatchResult::Unknown,
        }
    }
}

fn ssd(a: &GrayImage, b: &GrayImage) -> u64 {
    a.as_raw()
        .iter()
        .zip(b.as_raw())
        .map(|(&p, &q)| {
            let d = p.abs_diff(q) as u64;
            d * d
        })
        .sum()
}
