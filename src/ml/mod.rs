pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod features;
pub mod model;
pub mod session;
pub mod slot;

pub use checkpoint::{Checkpoint, CheckpointMeta};
pub use config::{ModelConfig, PolicyFormat, RuntimeTuning, TensorLayout, ValueRange};
pub use engine::InferenceEngine;
pub use error::ModelError;
pub use model::{ForwardOutput, ZeroModel};
pub use slot::ModelSlot;
