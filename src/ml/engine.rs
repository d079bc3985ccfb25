//! The concrete inference engine.
//!
//! ```text
//! Uninitialized --init ok--> Ready --forward--> Ready
//!       |                      |
//!       +--load/device error---+--> Failed (terminal, discard the instance)
//! ```
//!
//! Checkpoint upgrades build a new engine and swap the reference (see
//! [`crate::ml::slot::ModelSlot`]); a live engine's weights never change
//! under a running `forward`.

use crate::core::{Device, EncodedBoard, POLICY_WIDTH};
use crate::ml::checkpoint::{self, Checkpoint, CheckpointMeta};
use crate::ml::config::{ModelConfig, PolicyFormat, TensorLayout, ValueRange};
use crate::ml::error::ModelError;
use crate::ml::features::PlaneEncoder;
use crate::ml::model::{ForwardOutput, ZeroModel};
use crate::ml::session::{self, ComputeSession, OutputFormat, RawOutput};
use ndarray::{Array1, Array2};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

pub struct InferenceEngine {
    device: Device,
    state: EngineState,
}

enum EngineState {
    Uninitialized,
    Ready(Loaded),
    Failed(String),
}

struct Loaded {
    session: Mutex<Box<dyn ComputeSession>>,
    backend: &'static str,
    format: OutputFormat,
    layout: TensorLayout,
    checkpoint: Checkpoint,
    meta: Option<CheckpointMeta>,
}

impl InferenceEngine {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            state: EngineState::Uninitialized,
        }
    }

    /// Build an engine on `config.device` and initialize it.
    pub fn from_config(config: &ModelConfig) -> Result<Self, ModelError> {
        let mut engine = Self::new(config.device);
        engine.init(config)?;
        Ok(engine)
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, EngineState::Ready(_))
    }

    pub fn state_name(&self) -> &'static str {
        match self.state {
            EngineState::Uninitialized => "uninitialized",
            EngineState::Ready(_) => "ready",
            EngineState::Failed(_) => "failed",
        }
    }

    /// Checkpoint the engine is serving
    pub fn checkpoint(&self) -> Result<&Checkpoint, ModelError> {
        Ok(&self.loaded()?.checkpoint)
    }

    pub fn checkpoint_path(&self) -> Result<PathBuf, ModelError> {
        Ok(self.loaded()?.checkpoint.path())
    }

    pub fn meta(&self) -> Result<Option<&CheckpointMeta>, ModelError> {
        Ok(self.loaded()?.meta.as_ref())
    }

    fn loaded(&self) -> Result<&Loaded, ModelError> {
        match &self.state {
            EngineState::Ready(loaded) => Ok(loaded),
            EngineState::Uninitialized => Err(ModelError::NotInitialized),
            EngineState::Failed(reason) => Err(ModelError::Failed {
                reason: reason.clone(),
            }),
        }
    }

    /// Point a ready engine at a copy of its checkpoint that moved to
    /// another directory. The loaded weights are kept.
    pub(crate) fn relocate(&mut self, moved: Checkpoint) -> Result<(), ModelError> {
        let EngineState::Ready(loaded) = &mut self.state else {
            return Err(ModelError::NotInitialized);
        };
        if moved.prefix != loaded.checkpoint.prefix
            || moved.global_step != loaded.checkpoint.global_step
        {
            return Err(ModelError::InvalidArgument(format!(
                "{} is not a copy of {}",
                moved.path().display(),
                loaded.checkpoint.path().display()
            )));
        }
        loaded.checkpoint = moved;
        Ok(())
    }

    fn load(&self, config: &ModelConfig) -> Result<Loaded, ModelError> {
        config.validate()?;

        let checkpoint = checkpoint::locate(&config.model_dir)?;
        let meta = checkpoint.verify_meta()?;
        let session = session::open_session(&checkpoint, self.device, config)?;

        Ok(Loaded {
            backend: session.backend(),
            format: session.output_format(),
            layout: config.input_layout,
            session: Mutex::new(session),
            checkpoint,
            meta,
        })
    }
}

impl ZeroModel for InferenceEngine {
    /// Load the newest checkpoint in `config.model_dir` on this engine's
    /// device; `config.device` is only used by [`InferenceEngine::from_config`].
    ///
    /// A ready engine may be re-initialized. Load and device errors put the
    /// engine into the terminal failed state.
    fn init(&mut self, config: &ModelConfig) -> Result<(), ModelError> {
        if let EngineState::Failed(reason) = &self.state {
            return Err(ModelError::Failed {
                reason: reason.clone(),
            });
        }

        match self.load(config) {
            Ok(loaded) => {
                log::info!(
                    "model ready: {} (step {}, {} backend) on {}",
                    loaded.checkpoint.path().display(),
                    loaded.checkpoint.global_step,
                    loaded.backend,
                    self.device
                );
                self.state = EngineState::Ready(loaded);
                Ok(())
            }
            Err(e) => {
                if e.is_terminal() {
                    log::error!("model init failed on {}: {}", self.device, e);
                    self.state = EngineState::Failed(e.to_string());
                }
                Err(e)
            }
        }
    }

    fn forward(&self, batch: &[EncodedBoard]) -> Result<ForwardOutput, ModelError> {
        let loaded = self.loaded()?;
        if batch.is_empty() {
            return Err(ModelError::InvalidArgument(
                "batch must contain at least one position".to_string(),
            ));
        }

        let start = Instant::now();
        let input = PlaneEncoder::to_tensor(batch, loaded.layout);
        let raw = {
            let mut session = loaded.session.lock().map_err(|_| ModelError::Failed {
                reason: "compute session lock poisoned".to_string(),
            })?;
            session.run(input)?
        };
        let output = apply_convention(raw, loaded.format, batch.len())?;

        log::debug!(
            "forward batch={} step={} took {:?}",
            batch.len(),
            loaded.checkpoint.global_step,
            start.elapsed()
        );
        Ok(output)
    }

    fn global_step(&self) -> Result<u64, ModelError> {
        Ok(self.loaded()?.checkpoint.global_step)
    }

    fn name(&self) -> &str {
        match &self.state {
            EngineState::Ready(loaded) => loaded.backend,
            _ => "InferenceEngine (not ready)",
        }
    }
}

/// Turn raw head outputs into probabilities and side-to-move values in [-1, 1].
fn apply_convention(
    mut raw: RawOutput,
    format: OutputFormat,
    batch_len: usize,
) -> Result<ForwardOutput, ModelError> {
    let expected = batch_len * POLICY_WIDTH;
    if raw.policy.len() != expected {
        return Err(ModelError::InvalidOutput {
            expected,
            actual: raw.policy.len(),
        });
    }
    if raw.value.len() != batch_len {
        return Err(ModelError::InvalidOutput {
            expected: batch_len,
            actual: raw.value.len(),
        });
    }

    for row in raw.policy.chunks_mut(POLICY_WIDTH) {
        match format.policy {
            PolicyFormat::Logits => softmax(row),
            PolicyFormat::Probabilities => renormalize(row),
        }
    }
    let policy = Array2::from_shape_vec((batch_len, POLICY_WIDTH), raw.policy)
        .map_err(|_| ModelError::InvalidOutput { expected, actual: 0 })?;

    let value: Array1<f32> = raw
        .value
        .into_iter()
        .map(|v| {
            if v.is_nan() {
                return 0.0;
            }
            let v = match format.value {
                ValueRange::Symmetric => v,
                ValueRange::Unit => 2.0 * v - 1.0,
            };
            v.clamp(-1.0, 1.0)
        })
        .collect();

    let output = ForwardOutput { policy, value };
    output.check_shape(batch_len)?;
    Ok(output)
}

/// NaN logits get zero probability; `+inf` logits share the whole mass.
fn softmax(row: &mut [f32]) {
    if split_infinite(row) {
        return;
    }
    let max = row
        .iter()
        .copied()
        .filter(|x| !x.is_nan())
        .fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        uniform(row);
        return;
    }
    let mut sum = 0.0;
    for x in row.iter_mut() {
        *x = if x.is_nan() { 0.0 } else { (*x - max).exp() };
        sum += *x;
    }
    for x in row.iter_mut() {
        *x /= sum;
    }
}

fn renormalize(row: &mut [f32]) {
    if split_infinite(row) {
        return;
    }
    for x in row.iter_mut() {
        if x.is_nan() || *x < 0.0 {
            *x = 0.0;
        }
    }
    let sum: f32 = row.iter().sum();
    if sum > 0.0 && sum.is_finite() {
        for x in row.iter_mut() {
            *x /= sum;
        }
    } else {
        uniform(row);
    }
}

/// Spread the mass evenly over `+inf` entries, if there are any.
fn split_infinite(row: &mut [f32]) -> bool {
    let count = row.iter().filter(|&&x| x == f32::INFINITY).count();
    if count == 0 {
        return false;
    }
    let p = 1.0 / count as f32;
    for x in row.iter_mut() {
        *x = if *x == f32::INFINITY { p } else { 0.0 };
    }
    true
}

fn uniform(row: &mut [f32]) {
    let p = 1.0 / row.len() as f32;
    row.fill(p);
}
