//! Image preprocessing for the inference graph
//!
//! Frame decode, letterboxed resize, NCHW tensor conversion, and the 5-point
//! similarity alignment applied before recognition.

use anyhow::Result;
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use ndarray::Array4;

/// Detector input size (SCRFD).
pub const DETECTOR_INPUT_SIZE: (u32, u32) = (640, 640);

/// Recognizer input size (ArcFace).
pub const RECOGNIZER_INPUT_SIZE: (u32, u32) = (112, 112);

/// ArcFace reference landmarks for a 112x112 aligned face:
/// left eye, right eye, nose, left mouth corner, right mouth corner.
pub const ARCFACE_REF_LANDMARKS: [[f32; 2]; 5] = [
    [38.2946, 51.6963],
    [73.5318, 51.5014],
    [56.0252, 71.7366],
    [41.5493, 92.3655],
    [70.7299, 92.2041],
];

/// Max reprojection error, in pixels, for a landmark to count as an inlier
/// of the estimated transform.
const INLIER_TOLERANCE: f32 = 1000.0;

/// Decode an encoded still into an RGB frame, honoring any EXIF orientation
/// tag (phones often tag instead of rotating pixels).
pub fn decode_image(data: &[u8]) -> Result<RgbImage> {
    let image = image::load_from_memory(data)?;
    Ok(apply_exif_orientation(data, image).to_rgb8())
}

fn apply_exif_orientation(data: &[u8], image: DynamicImage) -> DynamicImage {
    use std::io::Cursor;

    let orientation = match exif::Reader::new().read_from_container(&mut Cursor::new(data)) {
        Ok(exif_data) => exif_data
            .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
            .and_then(|field| field.value.get_uint(0))
            .unwrap_or(1) as u8,
        Err(_) => 1,
    };

    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}

/// Resize keeping aspect ratio, centering the result on a black canvas.
pub fn resize_with_padding(frame: &RgbImage, target_w: u32, target_h: u32) -> RgbImage {
    let (orig_w, orig_h) = frame.dimensions();

    let scale = f32::min(
        target_w as f32 / orig_w as f32,
        target_h as f32 / orig_h as f32,
    );
    let new_w = ((orig_w as f32 * scale) as u32).max(1);
    let new_h = ((orig_h as f32 * scale) as u32).max(1);

    let resized = image::imageops::resize(frame, new_w, new_h, FilterType::Triangle);

    let mut padded = RgbImage::new(target_w, target_h);
    let offset_x = (target_w - new_w) / 2;
    let offset_y = (target_h - new_h) / 2;
    image::imageops::overlay(&mut padded, &resized, offset_x as i64, offset_y as i64);
    padded
}

/// Convert a frame to a 1xCxHxW tensor with InsightFace normalization:
/// BGR channel order, (x - 127.5) / 128.
pub fn image_to_nchw(frame: &RgbImage) -> Array4<f32> {
    let (width, height) = frame.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
    fill_nchw_slot(&mut tensor, 0, frame);
    tensor
}

/// Stack several same-sized crops into one NxCxHxW tensor.
pub fn batch_to_nchw(crops: &[RgbImage], target_w: u32, target_h: u32) -> Array4<f32> {
    let mut tensor = Array4::<f32>::zeros((
        crops.len(),
        3,
        target_h as usize,
        target_w as usize,
    ));
    for (i, crop) in crops.iter().enumerate() {
        if crop.dimensions() == (target_w, target_h) {
            fill_nchw_slot(&mut tensor, i, crop);
        } else {
            let resized = image::imageops::resize(crop, target_w, target_h, FilterType::Triangle);
            fill_nchw_slot(&mut tensor, i, &resized);
        }
    }
    tensor
}

fn fill_nchw_slot(tensor: &mut Array4<f32>, slot: usize, frame: &RgbImage) {
    for (x, y, pixel) in frame.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        tensor[[slot, 0, y, x]] = (pixel[2] as f32 - 127.5) / 128.0; // B
        tensor[[slot, 1, y, x]] = (pixel[1] as f32 - 127.5) / 128.0; // G
        tensor[[slot, 2, y, x]] = (pixel[0] as f32 - 127.5) / 128.0; // R
    }
}

/// Mapping between letterboxed detector coordinates and frame coordinates.
pub struct ResizeInfo {
    pub scale: f32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub original_width: u32,
    pub original_height: u32,
}

impl ResizeInfo {
    pub fn new(original: (u32, u32), target: (u32, u32)) -> Self {
        let (orig_w, orig_h) = original;
        let (target_w, target_h) = target;

        let scale = f32::min(
            target_w as f32 / orig_w as f32,
            target_h as f32 / orig_h as f32,
        );
        let new_w = (orig_w as f32 * scale) as u32;
        let new_h = (orig_h as f32 * scale) as u32;

        Self {
            scale,
            offset_x: (target_w - new_w) / 2,
            offset_y: (target_h - new_h) / 2,
            original_width: orig_w,
            original_height: orig_h,
        }
    }

    pub fn to_original(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.offset_x as f32) / self.scale,
            (y - self.offset_y as f32) / self.scale,
        )
    }
}

/// Align a face onto the canonical reference template and crop it.
///
/// `image_size` must be a multiple of 112 or 128. 112-multiples scale the
/// reference landmarks without horizontal offset; 128-multiples also shift
/// them right by `8 * ratio`. A degenerate fit (landmarks that cannot be
/// mapped onto the template with enough inlier support) yields an all-zero
/// crop of the target size and a zero matrix rather than an error, so one
/// bad detection never fails the frame's batch.
pub fn align_and_crop(
    frame: &RgbImage,
    landmarks: &[[f32; 2]; 5],
    image_size: u32,
) -> (RgbImage, [[f32; 3]; 2]) {
    assert!(
        image_size % 112 == 0 || image_size % 128 == 0,
        "aligned crop size must be a multiple of 112 or 128"
    );

    let (ratio, diff_x) = if image_size % 112 == 0 {
        (image_size as f32 / 112.0, 0.0)
    } else {
        let ratio = image_size as f32 / 128.0;
        (ratio, 8.0 * ratio)
    };

    let mut reference = ARCFACE_REF_LANDMARKS;
    for point in reference.iter_mut() {
        point[0] = point[0] * ratio + diff_x;
        point[1] *= ratio;
    }

    let blank = || (RgbImage::new(image_size, image_size), [[0.0f32; 3]; 2]);

    let Some(transform) = estimate_similarity(landmarks, &reference) else {
        return blank();
    };

    for (src, reference_point) in landmarks.iter().zip(&reference) {
        let px = transform[0][0] * src[0] + transform[0][1] * src[1] + transform[0][2];
        let py = transform[1][0] * src[0] + transform[1][1] * src[1] + transform[1][2];
        let err = ((px - reference_point[0]).powi(2) + (py - reference_point[1]).powi(2)).sqrt();
        if !err.is_finite() || err > INLIER_TOLERANCE {
            return blank();
        }
    }

    (
        warp_affine(frame, &transform, image_size, image_size),
        transform,
    )
}

/// Least-squares similarity transform from `src` onto `dst` (Umeyama).
/// Returns None when the source points carry no spread to estimate from.
fn estimate_similarity(src: &[[f32; 2]; 5], dst: &[[f32; 2]; 5]) -> Option<[[f32; 3]; 2]> {
    let n = src.len() as f32;

    let mut src_mean = [0.0f32; 2];
    let mut dst_mean = [0.0f32; 2];
    for i in 0..src.len() {
        src_mean[0] += src[i][0];
        src_mean[1] += src[i][1];
        dst_mean[0] += dst[i][0];
        dst_mean[1] += dst[i][1];
    }
    src_mean[0] /= n;
    src_mean[1] /= n;
    dst_mean[0] /= n;
    dst_mean[1] /= n;

    // Source variance and dst-src cross-covariance of the centered points.
    let mut var_src = 0.0f32;
    let (mut s00, mut s01, mut s10, mut s11) = (0.0f32, 0.0f32, 0.0f32, 0.0f32);
    for i in 0..src.len() {
        let sx = src[i][0] - src_mean[0];
        let sy = src[i][1] - src_mean[1];
        let dx = dst[i][0] - dst_mean[0];
        let dy = dst[i][1] - dst_mean[1];

        var_src += sx * sx + sy * sy;
        s00 += dx * sx;
        s01 += dx * sy;
        s10 += dy * sx;
        s11 += dy * sy;
    }
    var_src /= n;
    s00 /= n;
    s01 /= n;
    s10 /= n;
    s11 /= n;

    if var_src <= f32::EPSILON {
        return None;
    }

    // Closed-form 2x2 SVD of the covariance matrix.
    let e = (s00 + s11) / 2.0;
    let f = (s00 - s11) / 2.0;
    let g = (s10 + s01) / 2.0;
    let h = (s10 - s01) / 2.0;

    let q = (e * e + h * h).sqrt();
    let r = (f * f + g * g).sqrt();
    let sv1 = q + r;
    let sv2 = (q - r).abs();

    let a1 = h.atan2(e);
    let a2 = g.atan2(f);
    let theta = (a2 - a1) / 2.0;
    let phi = (a2 + a1) / 2.0;

    let det = s00 * s11 - s01 * s10;

    // R = U * diag(1, sign(det)) * V^T, preventing reflections.
    let (r00, r01, r10, r11) = if det >= 0.0 {
        let angle = phi - theta;
        (angle.cos(), -angle.sin(), angle.sin(), angle.cos())
    } else {
        let angle = phi + theta;
        (angle.cos(), angle.sin(), angle.sin(), -angle.cos())
    };

    let trace = if det >= 0.0 { sv1 + sv2 } else { sv1 - sv2 };
    let scale = trace / var_src;

    let tx = dst_mean[0] - scale * (r00 * src_mean[0] + r01 * src_mean[1]);
    let ty = dst_mean[1] - scale * (r10 * src_mean[0] + r11 * src_mean[1]);

    let transform = [
        [scale * r00, scale * r01, tx],
        [scale * r10, scale * r11, ty],
    ];
    if transform.iter().flatten().all(|v| v.is_finite()) {
        Some(transform)
    } else {
        None
    }
}

/// Backward-mapping affine warp with bilinear sampling; out-of-range pixels
/// stay black.
fn warp_affine(
    frame: &RgbImage,
    transform: &[[f32; 3]; 2],
    out_width: u32,
    out_height: u32,
) -> RgbImage {
    let mut output = RgbImage::new(out_width, out_height);

    let det = transform[0][0] * transform[1][1] - transform[0][1] * transform[1][0];
    if det.abs() <= f32::EPSILON {
        return output;
    }
    let inv = [
        [transform[1][1] / det, -transform[0][1] / det],
        [-transform[1][0] / det, transform[0][0] / det],
    ];

    let (src_w, src_h) = frame.dimensions();
    for y in 0..out_height {
        for x in 0..out_width {
            let dx = x as f32 - transform[0][2];
            let dy = y as f32 - transform[1][2];

            let src_x = inv[0][0] * dx + inv[0][1] * dy;
            let src_y = inv[1][0] * dx + inv[1][1] * dy;

            if src_x < 0.0
                || src_y < 0.0
                || src_x >= (src_w - 1) as f32
                || src_y >= (src_h - 1) as f32
            {
                continue;
            }

            let x0 = src_x as u32;
            let y0 = src_y as u32;
            let fx = src_x - x0 as f32;
            let fy = src_y - y0 as f32;

            let p00 = frame.get_pixel(x0, y0);
            let p01 = frame.get_pixel(x0, y0 + 1);
            let p10 = frame.get_pixel(x0 + 1, y0);
            let p11 = frame.get_pixel(x0 + 1, y0 + 1);

            let mut pixel = [0u8; 3];
            for c in 0..3 {
                let value = p00[c] as f32 * (1.0 - fx) * (1.0 - fy)
                    + p10[c] as f32 * fx * (1.0 - fy)
                    + p01[c] as f32 * (1.0 - fx) * fy
                    + p11[c] as f32 * fx * fy;
                pixel[c] = value.clamp(0.0, 255.0) as u8;
            }
            output.put_pixel(x, y, image::Rgb(pixel));
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkerboard(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            if (x / 8 + y / 8) % 2 == 0 {
                image::Rgb([200, 200, 200])
            } else {
                image::Rgb([40, 40, 40])
            }
        })
    }

    #[test]
    fn test_align_at_reference_is_near_identity() {
        let frame = checkerboard(160, 160);
        let (aligned, transform) = align_and_crop(&frame, &ARCFACE_REF_LANDMARKS, 112);

        assert_eq!(aligned.dimensions(), (112, 112));
        assert!((transform[0][0] - 1.0).abs() < 1e-3);
        assert!((transform[1][1] - 1.0).abs() < 1e-3);
        assert!(transform[0][1].abs() < 1e-3);
        assert!(transform[0][2].abs() < 1e-2);
        assert!(transform[1][2].abs() < 1e-2);
        // Non-degenerate: the matrix is not all zeros and pixels survive.
        assert!(transform.iter().flatten().any(|v| v.abs() > 0.5));
        assert!(aligned.pixels().any(|p| p[0] > 0));
    }

    #[test]
    fn test_align_224_doubles_scale() {
        let frame = checkerboard(160, 160);
        let (aligned, transform) = align_and_crop(&frame, &ARCFACE_REF_LANDMARKS, 224);

        assert_eq!(aligned.dimensions(), (224, 224));
        assert!((transform[0][0] - 2.0).abs() < 1e-3);
        assert!((transform[1][1] - 2.0).abs() < 1e-3);
    }

    #[test]
    fn test_align_128_applies_horizontal_offset() {
        let frame = checkerboard(200, 200);
        let mut shifted = ARCFACE_REF_LANDMARKS;
        for point in shifted.iter_mut() {
            point[0] += 8.0;
        }
        let (aligned, transform) = align_and_crop(&frame, &shifted, 128);

        assert_eq!(aligned.dimensions(), (128, 128));
        // Landmarks already placed at the 128-template positions map back
        // onto themselves.
        assert!((transform[0][0] - 1.0).abs() < 1e-3);
        assert!(transform[0][2].abs() < 1e-2);
    }

    #[test]
    fn test_degenerate_landmarks_yield_blank_crop() {
        let frame = checkerboard(160, 160);
        let collapsed = [[50.0f32, 50.0]; 5];
        let (aligned, transform) = align_and_crop(&frame, &collapsed, 112);

        assert_eq!(aligned.dimensions(), (112, 112));
        assert!(aligned.pixels().all(|p| p[0] == 0 && p[1] == 0 && p[2] == 0));
        assert!(transform.iter().flatten().all(|v| *v == 0.0));
    }

    #[test]
    fn test_resize_info_round_trip() {
        let info = ResizeInfo::new((1280, 720), DETECTOR_INPUT_SIZE);
        let (x, y) = info.to_original(320.0, 240.0);
        assert!(x >= 0.0 && x <= 1280.0);
        assert!(y >= 0.0 && y <= 720.0);

        // A full-width frame maps the left padding edge back to x = 0.
        let (left, _) = info.to_original(info.offset_x as f32, info.offset_y as f32);
        assert!(left.abs() < 1e-3);
    }

    #[test]
    fn test_nchw_normalization_range() {
        let frame = checkerboard(16, 16);
        let tensor = image_to_nchw(&frame);
        assert_eq!(tensor.shape(), &[1, 3, 16, 16]);
        assert!(tensor.iter().all(|v| (-1.0..=1.0).contains(v)));
    }
}
