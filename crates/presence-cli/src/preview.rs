//! Annotated preview frames written to disk for an external image viewer.

use image::{DynamicImage, GrayImage, ImageFormat, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use presence_core::{MatchResult, Overlay};
use std::path::Path;

const KNOWN: Rgb<u8> = Rgb([0, 255, 0]);
const UNKNOWN: Rgb<u8> = Rgb([255, 0, 0]);
const BORDER: u32 = 2;

/// Draw a box around every overlay. Unknown faces are red, everything else green.
pub fn annotate(frame: &GrayImage, overlays: &[Overlay]) -> RgbImage {
    let mut canvas = DynamicImage::ImageLuma8(frame.clone()).to_rgb8();
    for overlay in overlays {
        let Some(rect) = overlay.bbox.to_pixel_rect(frame.width(), frame.height()) else {
            continue;
        };
        let color = if overlay.label == MatchResult::Unknown.label() { UNKNOWN } else { KNOWN };
        for inset in 0..BORDER {
            if rect.width <= 2 * inset || rect.height <= 2 * inset {
                break;
            }
            let r = Rect::at((rect.x + inset) as i32, (rect.y + inset) as i32)
                .of_size(rect.width - 2 * inset, rect.height - 2 * inset);
            draw_hollow_rect_mut(&mut canvas, r, color);
        }
    }
    canvas
}

/// Write the annotated frame as PNG, replacing the previous one in a single rename.
pub fn write(path: &Path, frame: &GrayImage, overlays: &[Overlay]) -> anyhow::Result<()> {
    let tmp = path.with_extension("partial");
    annotate(frame, overlays).save_with_format(&tmp, ImageFormat::Png)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use presence_core::BoundingBox;

    fn overlay(label: &str, x: f32, y: f32) -> Overlay {
        Overlay {
            bbox: BoundingBox::new(x, y, 10.0, 10.0),
            label: label.to_string(),
        }
    }

    #[test]
    fn test_annotate_colors_by_label() {
        let frame = GrayImage::from_pixel(40, 40, Luma([50]));
        let canvas = annotate(&frame, &[overlay("Alice", 2.0, 2.0), overlay("Unknown", 20.0, 20.0)]);

        assert_eq!(canvas.get_pixel(2, 2), &KNOWN);
        assert_eq!(canvas.get_pixel(3, 3), &KNOWN);
        assert_eq!(canvas.get_pixel(20, 25), &UNKNOWN);
        // Interior and background stay gray.
        assert_eq!(canvas.get_pixel(7, 7), &Rgb([50, 50, 50]));
        assert_eq!(canvas.get_pixel(35, 5), &Rgb([50, 50, 50]));
    }

    #[test]
    fn test_annotate_skips_boxes_outside_frame() {
        let frame = GrayImage::from_pixel(10, 10, Luma([9]));
        let canvas = annotate(&frame, &[overlay("Alice", 50.0, 50.0)]);
        assert!(canvas.pixels().all(|p| *p == Rgb([9, 9, 9])));
    }

    #[test]
    fn test_write_creates_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preview.png");
        let frame = GrayImage::from_pixel(16, 12, Luma([128]));
        write(&path, &frame, &[overlay("Alice", 1.0, 1.0)]).unwrap();

        let saved = image::open(&path).unwrap();
        assert_eq!((saved.width(), saved.height()), (16, 12));
        assert!(!dir.path().join("preview.partial").exists());
    }
}
