//! MobileFaceNet embedding extractor via ONNX Runtime.
//!
//! Turns a roughly-frontal grayscale face crop into a 128-dimensional
//! unit-length vector. The kiosk frames its users with an on-screen guide, so
//! the crop is the full captured frame; no landmark alignment is performed.

use crate::types::Embedding;
use image::imageops::FilterType;
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const EMBED_INPUT_SIZE: usize = 112;
const EMBED_PIXEL_MEAN: f32 = 127.5;
const EMBED_PIXEL_STD: f32 = 127.5; // symmetric normalization, pixels land in [-1, 1]
const EMBEDDING_DIM: usize = 128;
const EMBED_MODEL_VERSION: &str = "mobile_face_net";

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("frame does not match declared dimensions: {width}x{height} needs {expected} bytes, got {actual}")]
    BadFrame {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Face embedder holding a loaded ONNX session.
pub struct FaceEmbedder {
    session: Session,
}

impl FaceEmbedder {
    /// Load the embedding model from the given path.
    pub fn load(model_path: &str) -> Result<Self, EmbedderError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded embedding model"
        );

        Ok(Self { session })
    }

    /// Extract an L2-normalized embedding from a grayscale frame.
    ///
    /// Any failure means "no embedding available for this frame"; callers
    /// skip the frame rather than surfacing an error to the user.
    pub fn extract(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Embedding, EmbedderError> {
        let resized = resize_to_input(frame, width, height)?;
        let input = Self::preprocess(&resized);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();

        if raw.len() != EMBEDDING_DIM {
            return Err(EmbedderError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: l2_normalize(raw),
            model_version: Some(EMBED_MODEL_VERSION.to_string()),
        })
    }

    /// Preprocess a 112x112 grayscale crop into an NCHW float tensor with
    /// pixels rescaled to [-1, 1] and the gray channel replicated to RGB.
    fn preprocess(resized: &[u8]) -> Array4<f32> {
        let size = EMBED_INPUT_SIZE;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for y in 0..size {
            for x in 0..size {
                let pixel = resized.get(y * size + x).copied().unwrap_or(0) as f32;
                let normalized = (pixel - EMBED_PIXEL_MEAN) / EMBED_PIXEL_STD;
                tensor[[0, 0, y, x]] = normalized;
                tensor[[0, 1, y, x]] = normalized;
                tensor[[0, 2, y, x]] = normalized;
            }
        }

        tensor
    }
}

/// Bilinear-resize a grayscale frame to the model input resolution.
fn resize_to_input(frame: &[u8], width: u32, height: u32) -> Result<Vec<u8>, EmbedderError> {
    let expected = (width * height) as usize;
    if frame.len() < expected || expected == 0 {
        return Err(EmbedderError::BadFrame {
            width,
            height,
            expected,
            actual: frame.len(),
        });
    }

    let img = GrayImage::from_raw(width, height, frame[..expected].to_vec()).ok_or(
        EmbedderError::BadFrame {
            width,
            height,
            expected,
            actual: frame.len(),
        },
    )?;
    let resized = image::imageops::resize(
        &img,
        EMBED_INPUT_SIZE as u32,
        EMBED_INPUT_SIZE as u32,
        FilterType::Triangle,
    );
    Ok(resized.into_raw())
}

fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preprocess_output_shape() {
        let crop = vec![128u8; EMBED_INPUT_SIZE * EMBED_INPUT_SIZE];
        let tensor = FaceEmbedder::preprocess(&crop);
        assert_eq!(tensor.shape(), &[1, 3, EMBED_INPUT_SIZE, EMBED_INPUT_SIZE]);
    }

    #[test]
    fn preprocess_rescales_to_unit_range() {
        let crop = vec![255u8; EMBED_INPUT_SIZE * EMBED_INPUT_SIZE];
        let tensor = FaceEmbedder::preprocess(&crop);
        let expected = (255.0 - EMBED_PIXEL_MEAN) / EMBED_PIXEL_STD;
        assert!((tensor[[0, 0, 0, 0]] - expected).abs() < 1e-6);

        let dark = vec![0u8; EMBED_INPUT_SIZE * EMBED_INPUT_SIZE];
        let tensor = FaceEmbedder::preprocess(&dark);
        assert!((tensor[[0, 0, 0, 0]] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn preprocess_replicates_gray_into_all_channels() {
        let crop = vec![100u8; EMBED_INPUT_SIZE * EMBED_INPUT_SIZE];
        let tensor = FaceEmbedder::preprocess(&crop);
        for y in 0..EMBED_INPUT_SIZE {
            for x in 0..EMBED_INPUT_SIZE {
                assert_eq!(tensor[[0, 0, y, x]], tensor[[0, 1, y, x]]);
                assert_eq!(tensor[[0, 1, y, x]], tensor[[0, 2, y, x]]);
            }
        }
    }

    #[test]
    fn resize_produces_input_resolution() {
        let frame = vec![50u8; 640 * 480];
        let resized = resize_to_input(&frame, 640, 480).unwrap();
        assert_eq!(resized.len(), EMBED_INPUT_SIZE * EMBED_INPUT_SIZE);
        // uniform input stays uniform through bilinear resampling
        assert!(resized.iter().all(|&p| p == 50));
    }

    #[test]
    fn resize_rejects_short_buffer() {
        let frame = vec![0u8; 10];
        assert!(matches!(
            resize_to_input(&frame, 640, 480),
            Err(EmbedderError::BadFrame { .. })
        ));
    }

    #[test]
    fn l2_normalize_unit_length() {
        let out = l2_normalize(vec![3.0, 4.0]);
        let norm: f32 = out.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn l2_normalize_zero_vector_unchanged() {
        let out = l2_normalize(vec![0.0, 0.0]);
        assert_eq!(out, vec![0.0, 0.0]);
    }
}
