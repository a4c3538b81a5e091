//! Inference backend seam.
//!
//! The core owns call sequencing and session lifecycle; the backend only knows
//! how to turn a model file into a handle and run tensors through it. Inputs
//! and outputs are plain owned buffers so that a handle can be driven from a
//! blocking thread without borrowing anything from the caller.

use std::path::Path;

use ort::session::Session;
use ort::session::builder::GraphOptimizationLevel;
use ort::value::Tensor;
use tracing::debug;

use crate::error::{EmbedError, Result};

/// Options applied when a session is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub intra_threads: usize,
}

/// A named `i64` input tensor, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor {
    pub name: String,
    pub shape: Vec<i64>,
    pub data: Vec<i64>,
}

impl InputTensor {
    /// A `[1, len]` tensor holding one sequence.
    pub fn sequence(name: impl Into<String>, data: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            shape: vec![1, data.len() as i64],
            data,
        }
    }
}

/// An `f32` output tensor, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Native inference backend.
///
/// Implementations must be usable from `spawn_blocking` threads. A handle is
/// only ever used by one thread at a time; the session manager guarantees it.
pub trait InferenceBackend: Send + Sync + 'static {
    type Handle: Send + 'static;

    fn create_session(&self, model_path: &Path, options: &SessionOptions) -> Result<Self::Handle>;

    /// Names of the inputs the loaded graph declares.
    fn input_names(&self, handle: &Self::Handle) -> Vec<String>;

    /// Runs one inference call. Outputs are returned in graph order.
    fn run(&self, handle: &mut Self::Handle, inputs: Vec<InputTensor>) -> Result<Vec<OutputTensor>>;

    fn close(&self, handle: Self::Handle);
}

/// ONNX Runtime backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrtBackend;

impl InferenceBackend for OrtBackend {
    type Handle = Session;

    fn create_session(&self, model_path: &Path, options: &SessionOptions) -> Result<Session> {
        if !model_path.exists() {
            return Err(EmbedError::ModelFileNotFound {
                path: model_path.to_path_buf(),
            });
        }

        let session = Session::builder()
            .map_err(|e| EmbedError::model_load(model_path, e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| EmbedError::model_load(model_path, e.to_string()))?
            .with_intra_threads(options.intra_threads.max(1))
            .map_err(|e| EmbedError::model_load(model_path, e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| EmbedError::model_load(model_path, e.to_string()))?;

        debug!(
            model = %model_path.display(),
            threads = options.intra_threads,
            "ONNX session created"
        );
        Ok(session)
    }

    fn input_names(&self, handle: &Session) -> Vec<String> {
        handle
            .inputs()
            .iter()
            .map(|input| input.name().to_string())
            .collect()
    }

    fn run(&self, handle: &mut Session, inputs: Vec<InputTensor>) -> Result<Vec<OutputTensor>> {
        let mut values = Vec::with_capacity(inputs.len());
        for input in inputs {
            let tensor = Tensor::from_array((input.shape, input.data))
                .map_err(|e| EmbedError::inference(format!("tensor creation error: {e}")))?;
            values.push((input.name, ort::session::SessionInputValue::from(tensor)));
        }

        let outputs = handle
            .run(values)
            .map_err(|e| EmbedError::inference(e.to_string()))?;

        let mut tensors = Vec::with_capacity(outputs.len());
        for (_name, value) in outputs.iter() {
            let (shape, data) = value
                .try_extract_tensor::<f32>()
                .map_err(|e| EmbedError::inference(format!("tensor extraction failed: {e}")))?;
            tensors.push(OutputTensor {
                shape: shape.iter().map(|&d| d.max(0) as usize).collect(),
                data: data.to_vec(),
            });
        }
        Ok(tensors)
    }

    fn close(&self, handle: Session) {
        drop(handle);
    }
}
