//! ArcFace face recognizer
//!
//! Embeds aligned 112x112 crops into L2-normalized feature vectors; one
//! batched inference call covers all faces of a frame.

use anyhow::{Context, Result};
use image::RgbImage;
use openvino::{ElementType, Shape, Tensor};

use super::openvino::SafeCompiledModel;
use super::preprocess::{batch_to_nchw, RECOGNIZER_INPUT_SIZE};
use super::FaceRecognizer;

/// An L2-normalized face embedding.
#[derive(Debug, Clone)]
pub struct FaceEmbedding {
    vector: Vec<f32>,
}

impl FaceEmbedding {
    pub fn new(mut vector: Vec<f32>) -> Self {
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in vector.iter_mut() {
                *v /= norm;
            }
        }
        Self { vector }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.vector
    }

    /// Dot product of two normalized vectors is their cosine similarity.
    pub fn cosine_similarity(&self, other: &FaceEmbedding) -> f32 {
        self.vector
            .iter()
            .zip(other.vector.iter())
            .map(|(a, b)| a * b)
            .sum()
    }
}

pub struct ArcFaceRecognizer {
    model: SafeCompiledModel,
    embedding_dim: usize,
}

impl ArcFaceRecognizer {
    pub fn new(model: SafeCompiledModel, embedding_dim: usize) -> Self {
        Self {
            model,
            embedding_dim,
        }
    }
}

impl FaceRecognizer for ArcFaceRecognizer {
    fn recognize_batch(&self, crops: &[RgbImage]) -> Result<Vec<FaceEmbedding>> {
        if crops.is_empty() {
            return Ok(Vec::new());
        }

        let (target_w, target_h) = RECOGNIZER_INPUT_SIZE;
        let batch = batch_to_nchw(crops, target_w, target_h);

        let mut request = self.model.create_infer_request()?;

        let input_shape = Shape::new(&[
            crops.len() as i64,
            3,
            target_h as i64,
            target_w as i64,
        ])?;
        let mut input = Tensor::new(ElementType::F32, &input_shape)?;
        let input_data = batch
            .as_slice()
            .context("recognizer batch tensor not contiguous")?;
        unsafe {
            let tensor_data = input.get_raw_data_mut()?.as_mut_ptr() as *mut f32;
            std::ptr::copy_nonoverlapping(input_data.as_ptr(), tensor_data, input_data.len());
        }

        request.set_input_tensor(&input)?;
        request.infer()?;

        let output = request.get_output_tensor()?;
        let output_data: Vec<f32> = unsafe {
            let ptr = output.get_raw_data()?.as_ptr() as *const f32;
            std::slice::from_raw_parts(ptr, crops.len() * self.embedding_dim).to_vec()
        };

        Ok(output_data
            .chunks_exact(self.embedding_dim)
            .map(|chunk| FaceEmbedding::new(chunk.to_vec()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_is_normalized() {
        let embedding = FaceEmbedding::new(vec![3.0, 4.0]);
        assert!((embedding.as_slice()[0] - 0.6).abs() < 1e-6);
        assert!((embedding.as_slice()[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_of_normalized_vectors() {
        let a = FaceEmbedding::new(vec![1.0, 0.0, 0.0]);
        let b = FaceEmbedding::new(vec![2.0, 0.0, 0.0]);
        let c = FaceEmbedding::new(vec![0.0, 5.0, 0.0]);

        assert!((a.cosine_similarity(&b) - 1.0).abs() < 1e-6);
        assert!(a.cosine_similarity(&c).abs() < 1e-6);
    }

    #[test]
    fn test_zero_vector_stays_zero() {
        let embedding = FaceEmbedding::new(vec![0.0, 0.0]);
        assert!(embedding.as_slice().iter().all(|v| *v == 0.0));
    }
}
