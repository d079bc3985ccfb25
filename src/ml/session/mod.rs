//! Compute sessions: the runtime-specific half of an inference engine.
//!
//! The backend is picked from the model file the checkpoint carries.

pub mod onnx;
pub mod plane;

use crate::core::Device;
use crate::ml::checkpoint::{Checkpoint, ONNX_EXT, PLANE_EXT};
use crate::ml::config::{ModelConfig, PolicyFormat, ValueRange};
use crate::ml::error::ModelError;
use ndarray::Array4;

pub use onnx::OnnxSession;
pub use plane::{PlaneSession, PlaneWeights};

/// Flat outputs of one pass, before the engine applies the output convention
#[derive(Debug, Clone, PartialEq)]
pub struct RawOutput {
    /// N * POLICY_WIDTH, row-major
    pub policy: Vec<f32>,
    /// N
    pub value: Vec<f32>,
}

/// What a session's heads emit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputFormat {
    pub policy: PolicyFormat,
    pub value: ValueRange,
}

/// A loaded network bound to one device.
///
/// `run` takes `&mut self`; the engine serializes access behind a mutex.
pub trait ComputeSession: Send {
    fn backend(&self) -> &'static str;

    fn output_format(&self) -> OutputFormat;

    /// One forward pass over the whole `[N, ...]` input tensor
    fn run(&mut self, input: Array4<f32>) -> Result<RawOutput, ModelError>;
}

/// Open the model file of `checkpoint` on `device`.
pub fn open_session(
    checkpoint: &Checkpoint,
    device: Device,
    config: &ModelConfig,
) -> Result<Box<dyn ComputeSession>, ModelError> {
    if checkpoint.has_file(ONNX_EXT) {
        let session = OnnxSession::open(&checkpoint.file(ONNX_EXT), device, config)?;
        return Ok(Box::new(session));
    }
    if checkpoint.has_file(PLANE_EXT) {
        let session = PlaneSession::open(&checkpoint.file(PLANE_EXT), device, config)?;
        return Ok(Box::new(session));
    }
    Err(ModelError::load(
        checkpoint.path(),
        format!("no .{} or .{} model file", ONNX_EXT, PLANE_EXT),
    ))
}
