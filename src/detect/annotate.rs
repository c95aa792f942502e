use image::Rgb;

use crate::detect::result::Detection;
use crate::frame::Frame;

const BOX_THICKNESS: u32 = 2;

const PALETTE: [[u8; 3]; 6] = [
    [255, 56, 56],
    [255, 157, 151],
    [255, 112, 31],
    [255, 178, 29],
    [207, 210, 49],
    [72, 249, 10],
];

/// Copy of `frame` with every boxed detection outlined in its class color.
pub fn draw_detections(frame: &Frame, detections: &[Detection]) -> Frame {
    let mut annotated = frame.clone();
    let (width, height) = annotated.dimensions();
    if width == 0 || height == 0 {
        return annotated;
    }
    let image = annotated.image_mut();

    for det in detections {
        let Some(bbox) = det.bbox else {
            continue;
        };
        let color = Rgb(PALETTE[det.class_id as usize % PALETTE.len()]);
        let x1 = clamp_coord(bbox.x1, width);
        let y1 = clamp_coord(bbox.y1, height);
        let x2 = clamp_coord(bbox.x2, width);
        let y2 = clamp_coord(bbox.y2, height);
        if x2 <= x1 || y2 <= y1 {
            continue;
        }

        for t in 0..BOX_THICKNESS {
            let top = (y1 + t).min(height - 1);
            let bottom = y2.saturating_sub(t).max(y1);
            for x in x1..=x2 {
                image.put_pixel(x, top, color);
                image.put_pixel(x, bottom, color);
            }
            let left = (x1 + t).min(width - 1);
            let right = x2.saturating_sub(t).max(x1);
            for y in y1..=y2 {
                image.put_pixel(left, y, color);
                image.put_pixel(right, y, color);
            }
        }
    }

    annotated
}

fn clamp_coord(value: f32, extent: u32) -> u32 {
    if !value.is_finite() {
        return 0;
    }
    (value.round().max(0.0) as u32).min(extent - 1)
}
