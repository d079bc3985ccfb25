use crate::core::{Device, EncodedBoard};
use crate::ml::checkpoint::{self, deploy, locate, Checkpoint};
use crate::ml::config::ModelConfig;
use crate::ml::engine::InferenceEngine;
use crate::ml::error::ModelError;
use crate::ml::model::{ForwardOutput, ZeroModel};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Holds the engine search workers should use and swaps in newer ones.
///
/// Workers grab an `Arc` per call (or per batch of calls); a swap only
/// redirects later grabs, so in-flight calls finish on the engine they
/// started with and the old engine is dropped when its last `Arc` goes.
pub struct ModelSlot {
    current: RwLock<Arc<InferenceEngine>>,
    refresh_lock: Mutex<()>,
}

impl ModelSlot {
    /// Wrap a ready engine.
    pub fn new(engine: InferenceEngine) -> Result<Self, ModelError> {
        engine.global_step()?;
        Ok(Self {
            current: RwLock::new(Arc::new(engine)),
            refresh_lock: Mutex::new(()),
        })
    }

    pub fn open(config: &ModelConfig) -> Result<Self, ModelError> {
        Self::new(InferenceEngine::from_config(config)?)
    }

    pub fn current(&self) -> Arc<InferenceEngine> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn global_step(&self) -> Result<u64, ModelError> {
        self.current().global_step()
    }

    pub fn forward(&self, batch: &[EncodedBoard]) -> Result<ForwardOutput, ModelError> {
        self.current().forward(batch)
    }

    /// Swap in `engine`, returning the one it replaces.
    pub fn replace(&self, engine: InferenceEngine) -> Result<Arc<InferenceEngine>, ModelError> {
        let step = engine.global_step()?;
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let old = std::mem::replace(&mut *current, Arc::new(engine));
        log::info!(
            "model slot switched from step {} to step {}",
            old.global_step().unwrap_or_default(),
            step
        );
        Ok(old)
    }

    /// Whether `train_dir` holds a checkpoint newer than the one served.
    pub fn is_stale(&self, train_dir: impl AsRef<Path>) -> Result<bool, ModelError> {
        Ok(locate(train_dir)?.global_step > self.global_step()?)
    }

    /// Promote the newest checkpoint in `train_dir` if it is newer than the
    /// served one and swap in an engine for it on the current device.
    ///
    /// The checkpoint is first copied into a hidden sibling of
    /// `config.model_dir` and loaded from there; only a checkpoint that
    /// loads is deployed over `config.model_dir`. Returns the new step, or
    /// `None` when already up to date. On error the slot keeps serving the
    /// old engine and `config.model_dir` is unchanged.
    pub fn refresh(
        &self,
        train_dir: impl AsRef<Path>,
        config: &ModelConfig,
    ) -> Result<Option<u64>, ModelError> {
        let _guard = self.refresh_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let latest = locate(train_dir)?;
        let served = self.current();
        let served_step = served.global_step()?;
        if latest.global_step <= served_step {
            return Ok(None);
        }

        let candidate = checkpoint::hidden_sibling(&config.model_dir, "candidate").map_err(
            |reason| ModelError::Deploy {
                from: latest.path(),
                to: config.model_dir.clone(),
                reason,
            },
        )?;
        let promoted = promote(&latest, &candidate, served.device(), config);
        checkpoint::discard(&candidate);

        let engine = promoted?;
        let step = engine.global_step()?;
        self.replace(engine)?;
        Ok(Some(step))
    }
}

/// Load `latest` from `candidate`, then deploy it to `config.model_dir`.
fn promote(
    latest: &Checkpoint,
    candidate: &Path,
    device: Device,
    config: &ModelConfig,
) -> Result<InferenceEngine, ModelError> {
    deploy(latest.path(), candidate)?;

    let mut trial = config.clone();
    trial.model_dir = candidate.to_path_buf();
    let mut engine = InferenceEngine::new(device);
    if let Err(e) = engine.init(&trial) {
        log::warn!("checkpoint {} rejected: {}", latest.path().display(), e);
        return Err(e);
    }

    let served = deploy(engine.checkpoint_path()?, &config.model_dir)?;
    engine.relocate(served)?;
    Ok(engine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{NUM_CELLS, NUM_PLANES};
    use crate::ml::session::PlaneWeights;

    fn write_checkpoint(dir: &Path, step: u64) {
        std::fs::create_dir_all(dir).unwrap();
        PlaneWeights {
            policy_plane_weights: vec![step as f32 * 0.1; NUM_PLANES],
            policy_cell_bias: vec![0.0; NUM_CELLS],
            pass_logit: 0.0,
            value_plane_weights: vec![0.05; NUM_PLANES],
            value_bias: step as f32 * 0.01,
        }
        .write(dir, &format!("zero-{}", step))
        .unwrap();
    }

    #[test]
    fn test_new_rejects_uninitialized_engine() {
        assert!(matches!(
            ModelSlot::new(InferenceEngine::new(Device::Cpu)),
            Err(ModelError::NotInitialized)
        ));
    }

    #[test]
    fn test_refresh_swaps_to_newer_checkpoint() {
        let root = tempfile::tempdir().unwrap();
        let train = root.path().join("train");
        let config = ModelConfig::new(root.path().join("serve"));

        write_checkpoint(&train, 3);
        deploy(train.join("zero-3"), &config.model_dir).unwrap();
        let slot = ModelSlot::open(&config).unwrap();
        let old = slot.current();

        assert!(!slot.is_stale(&train).unwrap());
        assert_eq!(slot.refresh(&train, &config).unwrap(), None);

        write_checkpoint(&train, 7);
        assert!(slot.is_stale(&train).unwrap());
        assert_eq!(slot.refresh(&train, &config).unwrap(), Some(7));
        assert_eq!(slot.global_step().unwrap(), 7);

        // the old engine still serves callers holding it
        let board = EncodedBoard::empty();
        assert_eq!(old.global_step().unwrap(), 3);
        assert!(old.forward(std::slice::from_ref(&board)).is_ok());
        assert_eq!(slot.forward(std::slice::from_ref(&board)).unwrap().len(), 1);
        assert!(!slot.is_stale(&train).unwrap());
        assert_eq!(
            slot.current().checkpoint_path().unwrap(),
            config.model_dir.join("zero-7")
        );
        assert!(hidden_entries(root.path()).is_empty());
    }

    fn hidden_entries(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with('.'))
            .collect()
    }

    #[test]
    fn test_failed_refresh_keeps_serving() {
        let root = tempfile::tempdir().unwrap();
        let train = root.path().join("train");
        let config = ModelConfig::new(root.path().join("serve"));

        write_checkpoint(&train, 3);
        deploy(train.join("zero-3"), &config.model_dir).unwrap();
        let slot = ModelSlot::open(&config).unwrap();

        std::fs::write(train.join("zero-9.plane.json"), "{ broken").unwrap();
        assert!(matches!(
            slot.refresh(&train, &config),
            Err(ModelError::Load { .. })
        ));
        assert_eq!(slot.global_step().unwrap(), 3);

        // the broken checkpoint never reached the serving directory
        let restarted = InferenceEngine::from_config(&config).unwrap();
        assert_eq!(restarted.global_step().unwrap(), 3);
        assert!(!config.model_dir.join("zero-9.plane.json").exists());
        assert!(hidden_entries(root.path()).is_empty());
    }
}
