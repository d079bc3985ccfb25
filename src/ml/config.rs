use crate::core::Device;
use crate::ml::error::ModelError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Resolved configuration handed to `ZeroModel::init`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Directory holding the checkpoint to load (normally the serving dir)
    pub model_dir: PathBuf,
    pub device: Device,
    pub tuning: RuntimeTuning,
    pub input_layout: TensorLayout,
    pub input_name: String,
    pub policy_output: String,
    pub value_output: String,
    /// What the graph's policy head emits
    pub policy_format: PolicyFormat,
    /// What the graph's value head emits
    pub value_range: ValueRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeTuning {
    /// 0 lets the runtime decide
    pub intra_op_threads: usize,
    pub inter_op_threads: usize,
    pub parallel_execution: bool,
    /// Graph optimization level, 0 (off) to 3 (all)
    pub optimization_level: u8,
    /// Reuse allocation plans across runs with the same input shape
    pub memory_pattern: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// [N, planes, 19, 19]
    #[default]
    Nchw,
    /// [N, 19, 19, planes]
    Nhwc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyFormat {
    #[default]
    Logits,
    Probabilities,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueRange {
    /// [-1, 1]
    #[default]
    Symmetric,
    /// [0, 1]
    Unit,
}

impl ModelConfig {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let config_err = |reason: String| ModelError::Config {
            path: path.to_path_buf(),
            reason,
        };

        let config_str = std::fs::read_to_string(path).map_err(|e| config_err(e.to_string()))?;
        let config: ModelConfig =
            serde_json::from_str(&config_str).map_err(|e| config_err(e.to_string()))?;
        config.validate().map_err(|e| config_err(e.to_string()))?;
        Ok(config)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            log::warn!("{}, falling back to defaults", e);
            Self::default()
        })
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.model_dir.as_os_str().is_empty() {
            return Err(ModelError::InvalidArgument("model_dir is empty".into()));
        }
        if self.tuning.optimization_level > 3 {
            return Err(ModelError::InvalidArgument(format!(
                "optimization_level must be 0..=3, got {}",
                self.tuning.optimization_level
            )));
        }
        for (field, name) in [
            ("input_name", &self.input_name),
            ("policy_output", &self.policy_output),
            ("value_output", &self.value_output),
        ] {
            if name.is_empty() {
                return Err(ModelError::InvalidArgument(format!("{} is empty", field)));
            }
        }
        Ok(())
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            model_dir: PathBuf::from("model"),
            device: Device::Cpu,
            tuning: RuntimeTuning::default(),
            input_layout: TensorLayout::Nchw,
            input_name: "inputs".to_string(),
            policy_output: "policy".to_string(),
            value_output: "value".to_string(),
            policy_format: PolicyFormat::Logits,
            value_range: ValueRange::Symmetric,
        }
    }
}

impl Default for RuntimeTuning {
    fn default() -> Self {
        RuntimeTuning {
            intra_op_threads: 0,
            inter_op_threads: 0,
            parallel_execution: false,
            optimization_level: 3,
            memory_pattern: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "model_dir": "/srv/go/model",
            "device": "gpu:1",
            "policy_format": "probabilities"
        }"#;
        let config: ModelConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.model_dir, PathBuf::from("/srv/go/model"));
        assert_eq!(config.device, Device::Gpu(1));
        assert_eq!(config.policy_format, PolicyFormat::Probabilities);
        assert_eq!(config.value_range, ValueRange::Symmetric);
        assert_eq!(config.input_name, "inputs");
        assert_eq!(config.tuning.optimization_level, 3);
    }

    #[test]
    fn test_load_rejects_bad_level() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        std::fs::write(&path, r#"{ "tuning": { "optimization_level": 9 } }"#).unwrap();

        let err = ModelConfig::load(&path).unwrap_err();
        assert!(matches!(err, ModelError::Config { .. }));
        assert!(err.to_string().contains("optimization_level"));
    }

    #[test]
    fn test_load_or_default_on_missing_file() {
        let config = ModelConfig::load_or_default("/nonexistent/zero-go.json");
        assert_eq!(config, ModelConfig::default());
    }

    #[test]
    fn test_round_trip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let config = ModelConfig::new(dir.path().join("serving")).with_device(Device::Gpu(0));
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        assert_eq!(ModelConfig::load(&path).unwrap(), config);
    }
}
