//! Frame annotation and JPEG encoding
//!
//! Draws recognition results onto frames before they are published: box per
//! face, label bar with name and similarity, bitmap-font text.

use anyhow::{anyhow, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};

use crate::engine::BoundingBox;

const MATCH_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
const UNKNOWN_COLOR: Rgb<u8> = Rgb([220, 40, 40]);
const LABEL_TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const GLYPH_ADVANCE: i32 = 6;
const LABEL_HEIGHT: i32 = 11;

/// One rendered recognition result.
#[derive(Debug, Clone)]
pub struct FaceMatch {
    pub bbox: BoundingBox,
    /// Matched identity, or None for an unknown face.
    pub name: Option<String>,
    pub similarity: Option<f32>,
}

impl FaceMatch {
    fn label(&self) -> String {
        match (&self.name, self.similarity) {
            (Some(name), Some(similarity)) => format!("{name} ({similarity:.2})"),
            (Some(name), None) => name.clone(),
            _ => "Unknown".to_string(),
        }
    }

    fn color(&self) -> Rgb<u8> {
        if self.name.is_some() {
            MATCH_COLOR
        } else {
            UNKNOWN_COLOR
        }
    }
}

/// Draw all results onto the frame in place.
pub fn annotate(frame: &mut RgbImage, results: &[FaceMatch]) {
    for result in results {
        let color = result.color();
        let (width, height) = frame.dimensions();
        let left = result.bbox.x1.clamp(0.0, (width - 1) as f32).round() as i32;
        let top = result.bbox.y1.clamp(0.0, (height - 1) as f32).round() as i32;
        let right = result.bbox.x2.clamp(0.0, (width - 1) as f32).round() as i32;
        let bottom = result.bbox.y2.clamp(0.0, (height - 1) as f32).round() as i32;

        draw_rectangle(frame, left, top, right, bottom, color);

        let label = result.label();
        let label_w = label.chars().count() as i32 * GLYPH_ADVANCE + 4;
        let label_y = (top - LABEL_HEIGHT).max(0);
        fill_rect(frame, left, label_y, left + label_w, label_y + LABEL_HEIGHT - 1, color);
        draw_text(frame, left + 2, label_y + 2, &label, LABEL_TEXT_COLOR);
    }
}

/// Encode a frame as a JPEG byte buffer.
pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(frame)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

fn draw_rectangle(frame: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let width = frame.width() as i32;
    let height = frame.height() as i32;
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);

    for x in left..=right {
        frame.put_pixel(x as u32, top as u32, color);
        frame.put_pixel(x as u32, bottom as u32, color);
    }
    for y in top..=bottom {
        frame.put_pixel(left as u32, y as u32, color);
        frame.put_pixel(right as u32, y as u32, color);
    }
}

fn fill_rect(frame: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let width = frame.width() as i32;
    let height = frame.height() as i32;
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);

    for y in top..=bottom {
        for x in left..=right {
            frame.put_pixel(x as u32, y as u32, color);
        }
    }
}

fn draw_text(frame: &mut RgbImage, mut x: i32, y: i32, text: &str, color: Rgb<u8>) {
    let width = frame.width() as i32;
    let height = frame.height() as i32;
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                let py = y + row as i32;
                if py < 0 || py >= height {
                    continue;
                }
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 1 {
                        let px = x + col;
                        if px >= 0 && px < width {
                            frame.put_pixel(px as u32, py as u32, color);
                        }
                    }
                }
            }
        }
        x += GLYPH_ADVANCE;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    match ch {
        'A' => Some([0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001]),
        'B' => Some([0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110]),
        'C' => Some([0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110]),
        'D' => Some([0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100]),
        'E' => Some([0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111]),
        'F' => Some([0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000]),
        'G' => Some([0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111]),
        'H' => Some([0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001]),
        'I' => Some([0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110]),
        'J' => Some([0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100]),
        'K' => Some([0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001]),
        'L' => Some([0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111]),
        'M' => Some([0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001]),
        'N' => Some([0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001]),
        'O' => Some([0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110]),
        'P' => Some([0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000]),
        'Q' => Some([0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101]),
        'R' => Some([0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001]),
        'S' => Some([0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110]),
        'T' => Some([0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100]),
        'U' => Some([0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110]),
        'V' => Some([0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100]),
        'W' => Some([0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010]),
        'X' => Some([0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001]),
        'Y' => Some([0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100]),
        'Z' => Some([0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111]),
        '0' => Some([0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110]),
        '1' => Some([0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110]),
        '2' => Some([0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111]),
        '3' => Some([0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110]),
        '4' => Some([0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010]),
        '5' => Some([0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110]),
        '6' => Some([0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110]),
        '7' => Some([0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000]),
        '8' => Some([0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110]),
        '9' => Some([0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100]),
        '.' => Some([0, 0, 0, 0, 0, 0b00110, 0b00110]),
        '-' => Some([0, 0, 0, 0b01110, 0, 0, 0]),
        '(' => Some([0b00010, 0b00100, 0b01000, 0b01000, 0b01000, 0b00100, 0b00010]),
        ')' => Some([0b01000, 0b00100, 0b00010, 0b00010, 0b00010, 0b00100, 0b01000]),
        ' ' => Some([0, 0, 0, 0, 0, 0, 0]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_match(name: Option<&str>) -> FaceMatch {
        FaceMatch {
            bbox: BoundingBox {
                x1: 10.0,
                y1: 20.0,
                x2: 60.0,
                y2: 70.0,
            },
            name: name.map(str::to_string),
            similarity: name.map(|_| 0.87),
        }
    }

    #[test]
    fn test_annotate_draws_box_pixels() {
        let mut frame = RgbImage::new(100, 100);
        annotate(&mut frame, &[sample_match(Some("Alice"))]);

        assert_eq!(*frame.get_pixel(10, 45), MATCH_COLOR);
        assert_eq!(*frame.get_pixel(60, 45), MATCH_COLOR);
        assert_eq!(*frame.get_pixel(35, 70), MATCH_COLOR);
    }

    #[test]
    fn test_unknown_faces_use_alert_color() {
        let mut frame = RgbImage::new(100, 100);
        annotate(&mut frame, &[sample_match(None)]);
        assert_eq!(*frame.get_pixel(10, 45), UNKNOWN_COLOR);
    }

    #[test]
    fn test_label_text() {
        assert_eq!(sample_match(Some("Alice")).label(), "Alice (0.87)");
        assert_eq!(sample_match(None).label(), "Unknown");
    }

    #[test]
    fn test_encode_jpeg_produces_marker() {
        let frame = RgbImage::from_pixel(32, 32, Rgb([120, 10, 200]));
        let jpeg = encode_jpeg(&frame, 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}
