use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, in source frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Whole-pixel region inside a concrete image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    /// Box with full confidence, for callers that already know where the face is.
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence: 1.0,
        }
    }

    /// Round to whole pixels and clamp to an image of the given size.
    ///
    /// Returns `None` when the clamped region has no area, which is how a
    /// degenerate detection is recognised.
    pub fn to_pixel_rect(&self, image_width: u32, image_height: u32) -> Option<PixelRect> {
        let clamp_x = |v: f32| (v.round() as i64).clamp(0, image_width as i64);
        let clamp_y = |v: f32| (v.round() as i64).clamp(0, image_height as i64);

        let x0 = clamp_x(self.x);
        let y0 = clamp_y(self.y);
        let x1 = clamp_x(self.x + self.width);
        let y1 = clamp_y(self.y + self.height);

        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        Some(PixelRect {
            x: x0 as u32,
            y: y0 as u32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        })
    }

    /// Copy the pixels under this box out of `image`.
    pub fn crop(&self, image: &GrayImage) -> Option<GrayImage> {
        let rect = self.to_pixel_rect(image.width(), image.height())?;
        Some(image::imageops::crop_imm(image, rect.x, rect.y, rect.width, rect.height).to_image())
    }
}

/// A face found in one frame, pending identification. Never outlives the frame loop iteration.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub crop: GrayImage,
}

impl DetectedFace {
    pub fn from_frame(frame: &GrayImage, bbox: BoundingBox) -> Option<Self> {
        let crop = bbox.crop(frame)?;
        Some(Self { bbox, crop })
    }
}

/// Outcome of comparing one detected face against the gallery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchResult {
    Identified {
        name: String,
        /// Sum of squared pixel differences at the template resolution.
        distance: u64,
    },
    Unknown,
}

impl MatchResult {
    pub fn name(&self) -> Option<&str> {
        match self {
            MatchResult::Identified { name, .. } => Some(name),
            MatchResult::Unknown => None,
        }
    }

    /// Text drawn next to the face box.
    pub fn label(&self) -> &str {
        self.name().unwrap_or("Unknown")
    }
}

/// Annotation handed to the shell for display: a box and what to write next to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Overlay {
    pub bbox: BoundingBox,
    pub label: String,
}
