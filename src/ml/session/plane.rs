//! Pure-Rust plane-linear network.
//!
//! Every cell's policy logit is a weighted sum of that cell's 17 plane bits
//! plus a per-cell bias; the value is `tanh` of a weighted sum of plane
//! densities. Small enough to ship as JSON and to evaluate on the CPU
//! without a runtime, which makes it the reference backend for tests and
//! for machines without ONNX Runtime.

use super::{ComputeSession, OutputFormat, RawOutput};
use crate::core::{Device, NUM_CELLS, NUM_PLANES, POLICY_WIDTH};
use crate::ml::config::{ModelConfig, PolicyFormat, TensorLayout, ValueRange};
use crate::ml::error::ModelError;
use ndarray::{Array1, Array4, ArrayView2, ArrayView3, Axis};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// `<prefix>.plane.json` contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaneWeights {
    pub policy_plane_weights: Vec<f32>,
    /// Empty means zero bias
    #[serde(default)]
    pub policy_cell_bias: Vec<f32>,
    #[serde(default)]
    pub pass_logit: f32,
    pub value_plane_weights: Vec<f32>,
    #[serde(default)]
    pub value_bias: f32,
}

impl PlaneWeights {
    pub fn validate(&self) -> Result<(), String> {
        if self.policy_plane_weights.len() != NUM_PLANES {
            return Err(format!(
                "policy_plane_weights has {} entries, expected {}",
                self.policy_plane_weights.len(),
                NUM_PLANES
            ));
        }
        if self.value_plane_weights.len() != NUM_PLANES {
            return Err(format!(
                "value_plane_weights has {} entries, expected {}",
                self.value_plane_weights.len(),
                NUM_PLANES
            ));
        }
        if !self.policy_cell_bias.is_empty() && self.policy_cell_bias.len() != NUM_CELLS {
            return Err(format!(
                "policy_cell_bias has {} entries, expected {}",
                self.policy_cell_bias.len(),
                NUM_CELLS
            ));
        }
        let all = self
            .policy_plane_weights
            .iter()
            .chain(&self.policy_cell_bias)
            .chain(&self.value_plane_weights)
            .chain([&self.pass_logit, &self.value_bias]);
        if let Some(bad) = all.into_iter().find(|w| !w.is_finite()) {
            return Err(format!("non-finite weight {}", bad));
        }
        Ok(())
    }

    /// Write as `<dir>/<prefix>.plane.json`.
    pub fn write(&self, dir: &Path, prefix: &str) -> std::io::Result<PathBuf> {
        let path = dir.join(format!("{}.plane.json", prefix));
        fs::write(&path, serde_json::to_string(self)?)?;
        Ok(path)
    }
}

pub struct PlaneSession {
    policy_weights: Array1<f32>,
    cell_bias: Array1<f32>,
    pass_logit: f32,
    value_weights: Array1<f32>,
    value_bias: f32,
    layout: TensorLayout,
}

impl PlaneSession {
    pub fn open(
        model_path: &Path,
        device: Device,
        config: &ModelConfig,
    ) -> Result<Self, ModelError> {
        if !device.is_cpu() {
            return Err(ModelError::device(device, "plane backend only runs on cpu"));
        }

        let weights_str =
            fs::read_to_string(model_path).map_err(|e| ModelError::load(model_path, e))?;
        let weights: PlaneWeights =
            serde_json::from_str(&weights_str).map_err(|e| ModelError::load(model_path, e))?;
        weights
            .validate()
            .map_err(|reason| ModelError::load(model_path, reason))?;

        Ok(Self::from_weights(weights, config.input_layout))
    }

    pub fn from_weights(weights: PlaneWeights, layout: TensorLayout) -> Self {
        let cell_bias = if weights.policy_cell_bias.is_empty() {
            Array1::zeros(NUM_CELLS)
        } else {
            Array1::from_vec(weights.policy_cell_bias)
        };

        Self {
            policy_weights: Array1::from_vec(weights.policy_plane_weights),
            cell_bias,
            pass_logit: weights.pass_logit,
            value_weights: Array1::from_vec(weights.value_plane_weights),
            value_bias: weights.value_bias,
            layout,
        }
    }
}

/// Plane `p` of one position as a 19x19 view, whatever the layout
fn plane_view<'a>(
    position: &'a ArrayView3<'_, f32>,
    layout: TensorLayout,
    p: usize,
) -> ArrayView2<'a, f32> {
    match layout {
        TensorLayout::Nchw => position.index_axis(Axis(0), p),
        TensorLayout::Nhwc => position.index_axis(Axis(2), p),
    }
}

impl ComputeSession for PlaneSession {
    fn backend(&self) -> &'static str {
        "plane-linear"
    }

    fn output_format(&self) -> OutputFormat {
        OutputFormat {
            policy: PolicyFormat::Logits,
            value: ValueRange::Symmetric,
        }
    }

    fn run(&mut self, input: Array4<f32>) -> Result<RawOutput, ModelError> {
        let batch = input.len_of(Axis(0));
        let mut policy = Vec::with_capacity(batch * POLICY_WIDTH);
        let mut value = Vec::with_capacity(batch);

        for position in input.outer_iter() {
            let mut logits = self.cell_bias.clone();
            let mut value_sum = self.value_bias;

            for p in 0..NUM_PLANES {
                let plane = plane_view(&position, self.layout, p);
                let w = self.policy_weights[p];
                // logical iteration order is row-major, i.e. cell = y * 19 + x
                for (logit, &bit) in logits.iter_mut().zip(plane.iter()) {
                    *logit += w * bit;
                }
                value_sum += self.value_weights[p] * (plane.sum() / NUM_CELLS as f32);
            }

            policy.extend(logits.iter());
            policy.push(self.pass_logit);
            value.push(value_sum.tanh());
        }

        Ok(RawOutput { policy, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EncodedBoard;
    use crate::ml::features::PlaneEncoder;

    fn weights() -> PlaneWeights {
        let mut policy_plane_weights = vec![0.0; NUM_PLANES];
        policy_plane_weights[0] = 2.0;
        let mut value_plane_weights = vec![0.0; NUM_PLANES];
        value_plane_weights[16] = 0.5;
        PlaneWeights {
            policy_plane_weights,
            policy_cell_bias: Vec::new(),
            pass_logit: -1.0,
            value_plane_weights,
            value_bias: 0.1,
        }
    }

    #[test]
    fn test_run_same_in_both_layouts() {
        let mut board = EncodedBoard::empty();
        board.set(0, 42, true);
        board.fill_plane(16, true);

        for layout in [TensorLayout::Nchw, TensorLayout::Nhwc] {
            let mut session = PlaneSession::from_weights(weights(), layout);
            let raw = session
                .run(PlaneEncoder::to_tensor(std::slice::from_ref(&board), layout))
                .unwrap();

            assert_eq!(raw.policy.len(), POLICY_WIDTH);
            assert_eq!(raw.policy[42], 2.0);
            assert_eq!(raw.policy[41], 0.0);
            assert_eq!(raw.policy[NUM_CELLS], -1.0);
            assert!((raw.value[0] - 0.6f32.tanh()).abs() < 1e-6);
        }
    }

    #[test]
    fn test_validate_rejects_bad_shapes() {
        let mut w = weights();
        w.policy_plane_weights.pop();
        assert!(w.validate().is_err());

        let mut w = weights();
        w.policy_cell_bias = vec![0.0; 5];
        assert!(w.validate().is_err());

        let mut w = weights();
        w.value_bias = f32::NAN;
        assert!(w.validate().is_err());

        assert!(weights().validate().is_ok());
    }

    #[test]
    fn test_open_rejects_gpu_and_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = weights().write(dir.path(), "zero-1").unwrap();
        let config = ModelConfig::new(dir.path());

        assert!(PlaneSession::open(&path, Device::Cpu, &config).is_ok());
        assert!(matches!(
            PlaneSession::open(&path, Device::Gpu(0), &config),
            Err(ModelError::Device { device: Device::Gpu(0), .. })
        ));

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            PlaneSession::open(&path, Device::Cpu, &config),
            Err(ModelError::Load { .. })
        ));
    }
}
