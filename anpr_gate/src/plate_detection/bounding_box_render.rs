use opencv::core::Point;
use opencv::core::Scalar;
use opencv::core::Vector;
use opencv::imgcodecs::imencode;
use opencv::imgcodecs::IMWRITE_JPEG_QUALITY;
use opencv::imgproc::put_text;
use opencv::imgproc::FONT_HERSHEY_SIMPLEX;
use opencv::imgproc::LINE_8;
use opencv::imgproc::{rectangle, LineTypes};
use opencv::prelude::Mat;

use super::overlay::OverlayEntry;

const THICKNESS_PX: i32 = 2;
const FONT_SCALE: f64 = 0.9;
const LABEL_OFFSET_PX: i32 = 10;

fn green() -> Scalar {
    // BGR
    Scalar::from((0.0, 255.0, 0.0))
}

/// Draws the plate box and its text above it.
pub fn draw_overlay(image: &mut Mat, entry: &OverlayEntry) -> opencv::Result<()> {
    rectangle(
        image,
        entry.bbox.to_rect(),
        green(),
        THICKNESS_PX,
        LineTypes::LINE_8 as i32,
        0,
    )?;
    put_text(
        image,
        &entry.text,
        Point::new(entry.bbox.x1, (entry.bbox.y1 - LABEL_OFFSET_PX).max(0)),
        FONT_HERSHEY_SIMPLEX,
        FONT_SCALE,
        green(),
        THICKNESS_PX,
        LINE_8,
        false,
    )
}

pub fn encode_jpeg(image: &Mat, quality: i32) -> opencv::Result<Vec<u8>> {
    let mut buffer = Vector::<u8>::new();
    let params = Vector::<i32>::from_slice(&[IMWRITE_JPEG_QUALITY, quality]);
    imencode(".jpg", image, &mut buffer, &params)?;
    Ok(buffer.to_vec())
}
