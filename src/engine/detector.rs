//! SCRFD face detector
//!
//! InsightFace SCRFD family: anchor-free detection heads at several strides,
//! each emitting scores, distance-encoded boxes and optional 5-point
//! landmarks.

use anyhow::{Context, Result};
use image::RgbImage;
use openvino::{ElementType, InferRequest, Shape, Tensor};

use super::openvino::SafeCompiledModel;
use super::preprocess::{image_to_nchw, resize_with_padding, ResizeInfo, DETECTOR_INPUT_SIZE};
use super::{BoundingBox, Detection, FaceDetector};

pub struct ScrfdDetector {
    model: SafeCompiledModel,
    confidence_threshold: f32,
    nms_threshold: f32,
}

impl ScrfdDetector {
    pub fn new(model: SafeCompiledModel, confidence_threshold: f32) -> Self {
        Self {
            model,
            confidence_threshold,
            nms_threshold: 0.4,
        }
    }

    fn run_inference(&self, frame: &RgbImage) -> Result<InferRequest> {
        let (target_w, target_h) = DETECTOR_INPUT_SIZE;
        let letterboxed = resize_with_padding(frame, target_w, target_h);
        let input_tensor = image_to_nchw(&letterboxed);

        let mut request = self.model.create_infer_request()?;

        let input_shape = Shape::new(&[1, 3, target_h as i64, target_w as i64])?;
        let mut input = Tensor::new(ElementType::F32, &input_shape)?;
        let input_data = input_tensor
            .as_slice()
            .context("detector input tensor not contiguous")?;
        unsafe {
            let tensor_data = input.get_raw_data_mut()?.as_mut_ptr() as *mut f32;
            std::ptr::copy_nonoverlapping(input_data.as_ptr(), tensor_data, input_data.len());
        }
        request.set_input_tensor(&input)?;
        request.infer()?;
        Ok(request)
    }

    /// SCRFD models expose `strides * (scores, boxes[, landmarks])` outputs;
    /// the output count identifies the head layout.
    fn head_layout(request: &InferRequest) -> (usize, bool, usize) {
        let mut output_count = 0;
        for i in 0..20 {
            if request.get_output_tensor_by_index(i).is_ok() {
                output_count += 1;
            } else {
                break;
            }
        }
        match output_count {
            6 => (3, false, 2),
            9 => (3, true, 2),
            10 => (5, false, 1),
            15 => (5, true, 1),
            other => {
                tracing::warn!("unexpected SCRFD output count {other}, assuming 3-stride layout");
                (3, true, 2)
            }
        }
    }

    fn parse_outputs(&self, request: &InferRequest, resize_info: &ResizeInfo) -> Result<Vec<Detection>> {
        let (stride_count, has_landmarks, anchors_per_cell) = Self::head_layout(request);
        let strides: &[i32] = if stride_count == 3 {
            &[8, 16, 32]
        } else {
            &[8, 16, 32, 64, 128]
        };

        let (input_w, input_h) = (DETECTOR_INPUT_SIZE.0 as i32, DETECTOR_INPUT_SIZE.1 as i32);
        let mut detections = Vec::new();

        for (idx, &stride) in strides.iter().enumerate() {
            let scores = read_tensor_f32(&request.get_output_tensor_by_index(idx)?)?;
            let boxes = read_tensor_f32(&request.get_output_tensor_by_index(idx + stride_count)?)?;
            let landmarks = if has_landmarks {
                Some(read_tensor_f32(
                    &request.get_output_tensor_by_index(idx + stride_count * 2)?,
                )?)
            } else {
                None
            };

            let feat_w = input_w / stride;
            let feat_h = input_h / stride;

            for cell in 0..(feat_w * feat_h) {
                let cx = ((cell % feat_w) * stride) as f32;
                let cy = ((cell / feat_w) * stride) as f32;

                for anchor in 0..anchors_per_cell {
                    let i = cell as usize * anchors_per_cell + anchor;
                    let Some(&score) = scores.get(i) else { continue };
                    if score < self.confidence_threshold {
                        continue;
                    }
                    let Some(distances) = boxes.get(i * 4..i * 4 + 4) else {
                        continue;
                    };

                    // Distance-to-border box encoding, scaled by stride.
                    let x1 = cx - distances[0] * stride as f32;
                    let y1 = cy - distances[1] * stride as f32;
                    let x2 = cx + distances[2] * stride as f32;
                    let y2 = cy + distances[3] * stride as f32;

                    let points = landmarks
                        .as_ref()
                        .and_then(|data| data.get(i * 10..i * 10 + 10))
                        .map(|chunk| {
                            chunk
                                .chunks_exact(2)
                                .map(|point| {
                                    let (px, py) = resize_info.to_original(
                                        cx + point[0] * stride as f32,
                                        cy + point[1] * stride as f32,
                                    );
                                    [px, py]
                                })
                                .collect::<Vec<[f32; 2]>>()
                        })
                        .unwrap_or_default();

                    let (ox1, oy1) = resize_info.to_original(x1, y1);
                    let (ox2, oy2) = resize_info.to_original(x2, y2);
                    let max_w = resize_info.original_width as f32;
                    let max_h = resize_info.original_height as f32;

                    detections.push(Detection {
                        bbox: BoundingBox {
                            x1: ox1.clamp(0.0, max_w),
                            y1: oy1.clamp(0.0, max_h),
                            x2: ox2.clamp(0.0, max_w),
                            y2: oy2.clamp(0.0, max_h),
                        },
                        landmarks: points,
                        score,
                    });
                }
            }
        }

        Ok(self.nms(detections))
    }

    fn nms(&self, mut detections: Vec<Detection>) -> Vec<Detection> {
        if detections.is_empty() {
            return detections;
        }
        detections.sort_by(|a, b| b.score.total_cmp(&a.score));

        let mut keep: Vec<Detection> = Vec::new();
        for candidate in detections {
            if keep
                .iter()
                .all(|kept| kept.bbox.iou(&candidate.bbox) <= self.nms_threshold)
            {
                keep.push(candidate);
            }
        }
        keep
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&self, frame: &RgbImage) -> Result<Vec<Detection>> {
        let resize_info = ResizeInfo::new(frame.dimensions(), DETECTOR_INPUT_SIZE);
        let request = self.run_inference(frame)?;
        let detections = self.parse_outputs(&request, &resize_info)?;
        tracing::debug!("detected {} face(s)", detections.len());
        Ok(detections)
    }
}

fn read_tensor_f32(tensor: &Tensor) -> Result<Vec<f32>> {
    let shape = tensor.get_shape()?;
    let total: i64 = shape.get_dimensions().iter().product();
    let data = unsafe {
        let ptr = tensor.get_raw_data()?.as_ptr() as *const f32;
        std::slice::from_raw_parts(ptr, total as usize).to_vec()
    };
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_overlap() {
        let a = BoundingBox {
            x1: 0.0,
            y1: 0.0,
            x2: 10.0,
            y2: 10.0,
        };
        let b = BoundingBox {
            x1: 5.0,
            y1: 5.0,
            x2: 15.0,
            y2: 15.0,
        };
        // Intersection 25, union 175.
        assert!((a.iou(&b) - 25.0 / 175.0).abs() < 1e-4);
    }

    #[test]
    fn test_iou_disjoint_is_zero() {
        let a = BoundingBox {
            x1: 0.0,
            y1: 0.0,
            x2: 4.0,
            y2: 4.0,
        };
        let b = BoundingBox {
            x1: 10.0,
            y1: 10.0,
            x2: 14.0,
            y2: 14.0,
        };
        assert_eq!(a.iou(&b), 0.0);
    }
}
