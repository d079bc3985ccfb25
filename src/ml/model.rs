//! Capability interface every inference backend satisfies.

use crate::core::{EncodedBoard, POLICY_WIDTH};
use crate::ml::config::ModelConfig;
use crate::ml::error::ModelError;
use ndarray::{Array1, Array2, ArrayView1};

/// Trait for policy/value networks consumed by the search
pub trait ZeroModel: Send + Sync {
    /// Bind to `config.model_dir` and load the checkpoint found there.
    ///
    /// Takes `&mut self`, so it can never overlap a `forward` on the same
    /// instance.
    fn init(&mut self, config: &ModelConfig) -> Result<(), ModelError>;

    /// Evaluate a non-empty batch.
    ///
    /// Policy rows are probabilities over the 361 cells plus pass (index
    /// 361) summing to 1; values are in [-1, 1] from the side to move.
    /// Rows come back in input order.
    ///
    /// Non-finite network outputs are mapped, never passed through: NaN
    /// scores get probability 0, `+inf` scores split the row's mass evenly,
    /// a row with nothing usable is uniform, and a NaN value becomes 0.
    fn forward(&self, batch: &[EncodedBoard]) -> Result<ForwardOutput, ModelError>;

    /// Global step of the checkpoint loaded by the last successful `init`
    fn global_step(&self) -> Result<u64, ModelError>;

    /// Backend name for debugging
    fn name(&self) -> &str;
}

/// Per-position results of one forward pass
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardOutput {
    /// [N, 362]
    pub policy: Array2<f32>,
    /// [N]
    pub value: Array1<f32>,
}

impl ForwardOutput {
    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn policy_row(&self, index: usize) -> ArrayView1<'_, f32> {
        self.policy.row(index)
    }

    pub fn value(&self, index: usize) -> f32 {
        self.value[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = (ArrayView1<'_, f32>, f32)> + '_ {
        self.policy.rows().into_iter().zip(self.value.iter().copied())
    }

    /// Split into one `(policy, value)` pair per position.
    pub fn into_rows(self) -> Vec<(Vec<f32>, f32)> {
        self.iter().map(|(p, v)| (p.to_vec(), v)).collect()
    }

    pub(crate) fn check_shape(&self, batch_len: usize) -> Result<(), ModelError> {
        if self.policy.dim() != (batch_len, POLICY_WIDTH) {
            return Err(ModelError::InvalidOutput {
                expected: batch_len * POLICY_WIDTH,
                actual: self.policy.len(),
            });
        }
        if self.value.len() != batch_len {
            return Err(ModelError::InvalidOutput {
                expected: batch_len,
                actual: self.value.len(),
            });
        }
        Ok(())
    }
}
