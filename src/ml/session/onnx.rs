//! ONNX Runtime backend

use super::{ComputeSession, OutputFormat, RawOutput};
use crate::core::Device;
use crate::ml::config::ModelConfig;
use crate::ml::error::ModelError;
use ndarray::Array4;
use std::path::Path;

#[cfg(feature = "ml")]
use ort::{
    execution_providers::ExecutionProviderDispatch,
    inputs,
    session::{builder::GraphOptimizationLevel, Session},
    value::Value,
};
#[cfg(feature = "ml")]
use std::path::PathBuf;

#[cfg(feature = "ml")]
pub struct OnnxSession {
    session: Session,
    device: Device,
    model_path: PathBuf,
    input_name: String,
    policy_output: String,
    value_output: String,
    format: OutputFormat,
}

#[cfg(feature = "ml")]
impl OnnxSession {
    /// Load an ONNX model and bind it to `device`.
    ///
    /// A GPU device registers its execution provider with
    /// `error_on_failure`, so a missing accelerator fails here instead of
    /// silently falling back to the CPU.
    pub fn open(
        model_path: &Path,
        device: Device,
        config: &ModelConfig,
    ) -> Result<Self, ModelError> {
        let tuning = &config.tuning;
        let level = match tuning.optimization_level {
            0 => GraphOptimizationLevel::Disable,
            1 => GraphOptimizationLevel::Level1,
            2 => GraphOptimizationLevel::Level2,
            _ => GraphOptimizationLevel::Level3,
        };

        let mut builder = Session::builder()
            .map_err(load_err(model_path))?
            .with_optimization_level(level)
            .map_err(load_err(model_path))?
            .with_parallel_execution(tuning.parallel_execution)
            .map_err(load_err(model_path))?
            .with_memory_pattern(tuning.memory_pattern)
            .map_err(load_err(model_path))?;
        if tuning.intra_op_threads > 0 {
            builder = builder
                .with_intra_threads(tuning.intra_op_threads)
                .map_err(load_err(model_path))?;
        }
        if tuning.inter_op_threads > 0 {
            builder = builder
                .with_inter_threads(tuning.inter_op_threads)
                .map_err(load_err(model_path))?;
        }
        if let Device::Gpu(index) = device {
            builder = builder
                .with_execution_providers([accelerator(index)])
                .map_err(|e| ModelError::device(device, e))?;
        }

        let session = builder.commit_from_file(model_path).map_err(|e| {
            // provider registration failures surface at commit time
            let reason = e.to_string();
            if !device.is_cpu() && reason.contains("xecution provider") {
                ModelError::device(device, reason)
            } else {
                ModelError::load(model_path, reason)
            }
        })?;

        // Try to read version metadata
        if let Ok(metadata) = session.metadata() {
            if let Ok(Some(version)) = metadata.custom("version") {
                log::info!(
                    "loaded onnx model {} (v{}) on {}",
                    model_path.display(),
                    version,
                    device
                );
            } else {
                log::info!(
                    "loaded onnx model {} (no version) on {}",
                    model_path.display(),
                    device
                );
            }
        }

        Ok(Self {
            session,
            device,
            model_path: model_path.to_path_buf(),
            input_name: config.input_name.clone(),
            policy_output: config.policy_output.clone(),
            value_output: config.value_output.clone(),
            format: OutputFormat {
                policy: config.policy_format,
                value: config.value_range,
            },
        })
    }
}

#[cfg(feature = "ml")]
impl ComputeSession for OnnxSession {
    fn backend(&self) -> &'static str {
        "onnx"
    }

    fn output_format(&self) -> OutputFormat {
        self.format
    }

    fn run(&mut self, input: Array4<f32>) -> Result<RawOutput, ModelError> {
        let device = self.device;
        let input_value = Value::from_array(input).map_err(|e| ModelError::device(device, e))?;

        let outputs = self
            .session
            .run(inputs![self.input_name.as_str() => input_value])
            .map_err(|e| ModelError::device(device, e))?;

        let model_path = &self.model_path;
        let head = |name: &str| -> Result<Vec<f32>, ModelError> {
            let tensor = outputs.get(name).ok_or_else(|| {
                ModelError::load(model_path, format!("graph has no output named '{}'", name))
            })?;
            let (_shape, data) = tensor
                .try_extract_tensor::<f32>()
                .map_err(|e| ModelError::load(model_path, e))?;
            Ok(data.to_vec())
        };

        let policy = head(&self.policy_output)?;
        let value = head(&self.value_output)?;
        Ok(RawOutput { policy, value })
    }
}

#[cfg(feature = "ml")]
fn load_err<E: std::fmt::Display>(path: &Path) -> impl Fn(E) -> ModelError + '_ {
    move |e| ModelError::load(path, e)
}

#[cfg(all(feature = "ml", windows))]
fn accelerator(index: u32) -> ExecutionProviderDispatch {
    ort::execution_providers::DirectMLExecutionProvider::default()
        .with_device_id(index as i32)
        .build()
        .error_on_failure()
}

#[cfg(all(feature = "ml", not(windows)))]
fn accelerator(index: u32) -> ExecutionProviderDispatch {
    ort::execution_providers::CUDAExecutionProvider::default()
        .with_device_id(index as i32)
        .build()
        .error_on_failure()
}

// Stub when ml feature disabled
#[cfg(not(feature = "ml"))]
pub struct OnnxSession;

#[cfg(not(feature = "ml"))]
impl OnnxSession {
    pub fn open(
        model_path: &Path,
        _device: Device,
        _config: &ModelConfig,
    ) -> Result<Self, ModelError> {
        Err(ModelError::load(
            model_path,
            "ML feature not enabled. Rebuild with --features ml",
        ))
    }
}

#[cfg(not(feature = "ml"))]
impl ComputeSession for OnnxSession {
    fn backend(&self) -> &'static str {
        "onnx (disabled)"
    }

    fn output_format(&self) -> OutputFormat {
        OutputFormat {
            policy: crate::ml::config::PolicyFormat::Logits,
            value: crate::ml::config::ValueRange::Symmetric,
        }
    }

    fn run(&mut self, _input: Array4<f32>) -> Result<RawOutput, ModelError> {
        Err(ModelError::Failed {
            reason: "ML feature not enabled".to_string(),
        })
    }
}
