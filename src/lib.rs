//! Inference boundary of a Go engine.
//!
//! Loads a trained policy/value network from a versioned checkpoint
//! directory, binds it to a compute device and evaluates batches of
//! encoded board positions for the search workers above it.

pub mod common;
pub mod core;
pub mod ml;

pub use crate::core::{Device, EncodedBoard};
pub use crate::ml::{
    checkpoint::{deploy, deploy_latest, locate, Checkpoint},
    config::ModelConfig,
    engine::InferenceEngine,
    error::ModelError,
    model::{ForwardOutput, ZeroModel},
    slot::ModelSlot,
};
