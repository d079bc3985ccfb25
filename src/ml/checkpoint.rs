//! Checkpoint discovery and deployment.
//!
//! A checkpoint is the set of files in one directory that share a
//! `<name>-<global_step>` stem, e.g.
//!
//! ```text
//! train/
//!   zero-000120.onnx
//!   zero-000120.meta.json
//!   zero-000130.plane.json
//!   zero-000140.meta.json (ignored, no model file yet)
//!   events-1700000000.log (ignored)
//! ```

use crate::common::split_str;
use crate::ml::error::ModelError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

pub const ONNX_EXT: &str = "onnx";
pub const PLANE_EXT: &str = "plane.json";
pub const META_EXT: &str = "meta.json";

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub dir: PathBuf,
    /// `<name>-<step>` stem shared by all files of the checkpoint
    pub prefix: String,
    pub global_step: u64,
    /// Sorted full paths
    pub files: Vec<PathBuf>,
}

/// Optional `<prefix>.meta.json` sidecar written by the trainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub global_step: u64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: Option<String>,
}

impl Checkpoint {
    /// `dir/prefix`, the form accepted by [`deploy`]
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.prefix)
    }

    pub fn file(&self, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", self.prefix, ext))
    }

    pub fn has_file(&self, ext: &str) -> bool {
        let wanted = self.file(ext);
        self.files.iter().any(|f| *f == wanted)
    }

    /// Whether a backend can load this checkpoint.
    pub fn has_model(&self) -> bool {
        self.has_file(ONNX_EXT) || self.has_file(PLANE_EXT)
    }

    pub fn read_meta(&self) -> Result<Option<CheckpointMeta>, ModelError> {
        if !self.has_file(META_EXT) {
            return Ok(None);
        }
        let path = self.file(META_EXT);
        let meta_str = fs::read_to_string(&path).map_err(|e| ModelError::load(&path, e))?;
        let meta = serde_json::from_str(&meta_str).map_err(|e| ModelError::load(&path, e))?;
        Ok(Some(meta))
    }

    /// Reject a sidecar that disagrees with the step in the file name.
    pub fn verify_meta(&self) -> Result<Option<CheckpointMeta>, ModelError> {
        let meta = self.read_meta()?;
        if let Some(meta) = &meta {
            if meta.global_step != self.global_step {
                return Err(ModelError::load(
                    self.path(),
                    format!(
                        "metadata records global step {} but the name says {}",
                        meta.global_step, self.global_step
                    ),
                ));
            }
        }
        Ok(meta)
    }
}

impl CheckpointMeta {
    pub fn new(global_step: u64) -> Self {
        Self {
            global_step,
            created_at: Some(Utc::now()),
            version: None,
        }
    }

    pub fn write(&self, dir: &Path, prefix: &str) -> std::io::Result<PathBuf> {
        let path = dir.join(format!("{}.{}", prefix, META_EXT));
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }
}

/// Split a checkpoint file name into its `<name>-<step>` prefix and step.
///
/// The stem is everything before the first `.`; its last `-` separated
/// field must be a decimal step and something must precede it.
pub fn parse_checkpoint_name(file_name: &str) -> Option<(&str, u64)> {
    let stem = split_str(file_name, '.')[0];
    let fields = split_str(stem, '-');
    if fields.len() < 2 {
        return None;
    }

    let step_field = fields[fields.len() - 1];
    if step_field.is_empty() || !step_field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if stem.len() == step_field.len() + 1 {
        return None;
    }

    let step = step_field.parse().ok()?;
    Some((stem, step))
}

/// All checkpoints in `dir`, ascending by `(global_step, prefix)`.
///
/// Groups without a model file (logs, sidecars written ahead of their
/// weights) are skipped.
pub fn scan(dir: impl AsRef<Path>) -> Result<Vec<Checkpoint>, ModelError> {
    let dir = dir.as_ref();
    let not_found = || ModelError::NotFound {
        dir: dir.to_path_buf(),
    };

    let entries = fs::read_dir(dir).map_err(|e| {
        log::debug!("cannot read checkpoint dir {}: {}", dir.display(), e);
        not_found()
    })?;

    let mut groups: BTreeMap<(u64, String), Vec<PathBuf>> = BTreeMap::new();
    for entry in entries {
        let entry = entry.map_err(|_| not_found())?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Some((prefix, step)) = parse_checkpoint_name(file_name) {
            groups
                .entry((step, prefix.to_string()))
                .or_default()
                .push(path.clone());
        }
    }

    Ok(groups
        .into_iter()
        .map(|((global_step, prefix), mut files)| {
            files.sort();
            Checkpoint {
                dir: dir.to_path_buf(),
                prefix,
                global_step,
                files,
            }
        })
        .filter(|checkpoint| {
            let usable = checkpoint.has_model();
            if !usable {
                log::debug!("skipping {}: no model file", checkpoint.path().display());
            }
            usable
        })
        .collect())
}

/// Newest checkpoint in `train_dir`.
///
/// Equal steps under different prefixes (`zero-12` vs `zero-012`) resolve
/// to the lexicographically last prefix.
pub fn locate(train_dir: impl AsRef<Path>) -> Result<Checkpoint, ModelError> {
    let train_dir = train_dir.as_ref();
    scan(train_dir)?
        .pop()
        .ok_or_else(|| ModelError::NotFound {
            dir: train_dir.to_path_buf(),
        })
}

/// Resolve a `dir/prefix` checkpoint path.
pub fn checkpoint_at(path: impl AsRef<Path>) -> Result<Checkpoint, ModelError> {
    let path = path.as_ref();
    let not_found = || ModelError::NotFound {
        dir: path.to_path_buf(),
    };
    let prefix = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(not_found)?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    scan(dir)?
        .into_iter()
        .find(|c| c.prefix == prefix)
        .ok_or_else(not_found)
}

/// Copy the checkpoint at `from` (a `dir/prefix` path) into the serving
/// directory `to`, replacing whatever was served there.
///
/// Files are staged in a hidden sibling of `to` and swapped in by rename,
/// so a failure before the swap leaves the previous serving directory as
/// it was. Callers should still init an engine against `to` before
/// relying on it.
pub fn deploy(from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<Checkpoint, ModelError> {
    let (from, to) = (from.as_ref(), to.as_ref());
    let deploy_err = |reason: String| ModelError::Deploy {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        reason,
    };

    let source = checkpoint_at(from).map_err(|e| deploy_err(e.to_string()))?;
    if same_dir(&source.dir, to) {
        return Err(deploy_err(
            "source and destination are the same directory".to_string(),
        ));
    }

    let staging = hidden_sibling(to, "staging").map_err(deploy_err)?;
    let retired = hidden_sibling(to, "old").map_err(deploy_err)?;

    if let Err(reason) = stage_files(&source, &staging) {
        discard(&staging);
        return Err(deploy_err(reason));
    }

    let had_previous = to.exists();
    if had_previous {
        if let Err(e) = fs::rename(to, &retired) {
            discard(&staging);
            return Err(deploy_err(format!("cannot retire previous serving dir: {}", e)));
        }
    }
    if let Err(e) = fs::rename(&staging, to) {
        discard(&staging);
        let mut reason = format!("cannot move staged checkpoint in place: {}", e);
        if had_previous {
            if let Err(stranded) = restore_previous(&retired, to) {
                reason = format!("{}; {}", reason, stranded);
            }
        }
        return Err(deploy_err(reason));
    }
    if had_previous {
        discard(&retired);
    }

    log::info!(
        "deployed checkpoint {} (step {}) to {}",
        source.prefix,
        source.global_step,
        to.display()
    );

    let files = source
        .files
        .iter()
        .filter_map(|f| f.file_name())
        .map(|name| to.join(name))
        .collect();
    Ok(Checkpoint {
        dir: to.to_path_buf(),
        prefix: source.prefix,
        global_step: source.global_step,
        files,
    })
}

/// [`locate`] the newest checkpoint in `train_dir` and [`deploy`] it to `to`.
pub fn deploy_latest(
    train_dir: impl AsRef<Path>,
    to: impl AsRef<Path>,
) -> Result<Checkpoint, ModelError> {
    let latest = locate(train_dir)?;
    deploy(latest.path(), to)
}

fn stage_files(source: &Checkpoint, staging: &Path) -> Result<(), String> {
    fs::create_dir_all(staging).map_err(|e| format!("cannot create staging dir: {}", e))?;

    for file in &source.files {
        let name = file
            .file_name()
            .ok_or_else(|| format!("bad checkpoint file {}", file.display()))?;
        let expected = fs::metadata(file)
            .map_err(|e| format!("cannot read {}: {}", file.display(), e))?
            .len();
        let copied = fs::copy(file, staging.join(name))
            .map_err(|e| format!("cannot copy {}: {}", file.display(), e))?;
        if copied != expected {
            return Err(format!(
                "short copy of {}: {} of {} bytes",
                file.display(),
                copied,
                expected
            ));
        }
    }
    Ok(())
}

/// Unique hidden path next to `to`, creating `to`'s parent if needed.
pub(crate) fn hidden_sibling(to: &Path, kind: &str) -> Result<PathBuf, String> {
    let to_name = to
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| "destination has no directory name".to_string())?;
    let parent = match to.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(|e| e.to_string())?;

    let seq = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
    Ok(parent.join(format!(
        ".{}.{}-{}-{}",
        to_name,
        kind,
        std::process::id(),
        seq
    )))
}

/// Move a retired serving dir back to `to`; the error names where it was left.
fn restore_previous(retired: &Path, to: &Path) -> Result<(), String> {
    fs::rename(retired, to).map_err(|e| {
        log::error!("previous serving dir left at {}: {}", retired.display(), e);
        format!(
            "previous serving dir could not be restored and is at {}: {}",
            retired.display(),
            e
        )
    })
}

pub(crate) fn discard(dir: &Path) {
    if dir.exists() {
        if let Err(e) = fs::remove_dir_all(dir) {
            log::warn!("failed to remove {}: {}", dir.display(), e);
        }
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn test_parse_checkpoint_name() {
        assert_eq!(parse_checkpoint_name("zero-12.onnx"), Some(("zero-12", 12)));
        assert_eq!(
            parse_checkpoint_name("zero-000120.meta.json"),
            Some(("zero-000120", 120))
        );
        assert_eq!(parse_checkpoint_name("go-net-7"), Some(("go-net-7", 7)));
        assert_eq!(parse_checkpoint_name("checkpoint"), None);
        assert_eq!(parse_checkpoint_name("-12.onnx"), None);
        assert_eq!(parse_checkpoint_name("zero-.onnx"), None);
        assert_eq!(parse_checkpoint_name("zero-1a.onnx"), None);
        assert_eq!(parse_checkpoint_name(".zero-3.onnx"), None);
        assert_eq!(parse_checkpoint_name("zero-99999999999999999999999.onnx"), None);
    }

    #[test]
    fn test_locate_picks_highest_step() {
        let dir = tempfile::tempdir().unwrap();
        for step in [3, 7, 12] {
            touch(dir.path(), &format!("zero-{}.onnx", step), "w");
            touch(dir.path(), &format!("zero-{}.meta.json", step), "{}");
        }
        touch(dir.path(), "checkpoint", "zero-7");
        fs::create_dir(dir.path().join("zero-99.onnx")).unwrap();

        let latest = locate(dir.path()).unwrap();
        assert_eq!(latest.global_step, 12);
        assert_eq!(latest.prefix, "zero-12");
        assert_eq!(latest.path(), dir.path().join("zero-12"));
        assert_eq!(latest.files.len(), 2);
        assert!(latest.has_file(ONNX_EXT));
        assert!(latest.has_file(META_EXT));

        let steps: Vec<u64> = scan(dir.path()).unwrap().iter().map(|c| c.global_step).collect();
        assert_eq!(steps, vec![3, 7, 12]);
    }

    #[test]
    fn test_locate_numeric_not_lexicographic() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "zero-9.onnx", "w");
        touch(dir.path(), "zero-10.onnx", "w");
        assert_eq!(locate(dir.path()).unwrap().global_step, 10);
    }

    #[test]
    fn test_locate_duplicate_step_tie_break() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "zero-012.onnx", "w");
        touch(dir.path(), "zero-12.onnx", "w");
        touch(dir.path(), "alpha-12.onnx", "w");

        let latest = locate(dir.path()).unwrap();
        assert_eq!(latest.prefix, "zero-12");
    }

    #[test]
    fn test_locate_empty_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "notes.txt", "hello");
        assert!(matches!(locate(dir.path()), Err(ModelError::NotFound { .. })));

        let missing = dir.path().join("nope");
        match locate(&missing) {
            Err(ModelError::NotFound { dir }) => assert_eq!(dir, missing),
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_deploy_replaces_serving_dir() {
        let root = tempfile::tempdir().unwrap();
        let train = root.path().join("train");
        let serve = root.path().join("serve");
        fs::create_dir_all(&train).unwrap();
        fs::create_dir_all(&serve).unwrap();
        touch(&serve, "zero-1.onnx", "old");
        touch(&train, "zero-5.onnx", "weights");
        touch(&train, "zero-5.meta.json", r#"{"global_step":5}"#);
        touch(&train, "zero-4.onnx", "older");

        let deployed = deploy_latest(&train, &serve).unwrap();
        assert_eq!(deployed.global_step, 5);
        assert_eq!(deployed.dir, serve);

        let served = scan(&serve).unwrap();
        assert_eq!(served.len(), 1);
        assert_eq!(served[0], deployed);
        assert_eq!(fs::read_to_string(serve.join("zero-5.onnx")).unwrap(), "weights");
        assert_eq!(deployed.verify_meta().unwrap().unwrap().global_step, 5);

        // no staging leftovers next to the serving dir
        let leftovers: Vec<_> = fs::read_dir(root.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_deploy_creates_missing_destination() {
        let root = tempfile::tempdir().unwrap();
        touch(root.path(), "zero-2.plane.json", "{}");

        let serve = root.path().join("a").join("serve");
        let deployed = deploy(root.path().join("zero-2"), &serve).unwrap();
        assert!(deployed.has_file(PLANE_EXT));
        assert!(serve.join("zero-2.plane.json").is_file());
    }

    #[test]
    fn test_deploy_failure_keeps_previous_serving_state() {
        let root = tempfile::tempdir().unwrap();
        let serve = root.path().join("serve");
        fs::create_dir_all(&serve).unwrap();
        touch(&serve, "zero-1.onnx", "old");

        let err = deploy(root.path().join("train").join("zero-9"), &serve).unwrap_err();
        match &err {
            ModelError::Deploy { from, to, .. } => {
                assert_eq!(from, &root.path().join("train").join("zero-9"));
                assert_eq!(to, &serve);
            }
            other => panic!("expected Deploy, got {:?}", other),
        }
        assert_eq!(locate(&serve).unwrap().global_step, 1);
    }

    #[test]
    fn test_deploy_rejects_same_directory() {
        let root = tempfile::tempdir().unwrap();
        touch(root.path(), "zero-3.onnx", "w");
        let err = deploy(root.path().join("zero-3"), root.path()).unwrap_err();
        assert!(matches!(err, ModelError::Deploy { .. }));
        assert!(root.path().join("zero-3.onnx").is_file());
    }

    #[test]
    fn test_meta_mismatch_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "zero-8.onnx", "w");
        CheckpointMeta::new(9).write(dir.path(), "zero-8").unwrap();

        let checkpoint = locate(dir.path()).unwrap();
        assert!(matches!(checkpoint.verify_meta(), Err(ModelError::Load { .. })));
    }

    #[test]
    fn test_locate_ignores_groups_without_model() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "zero-12.plane.json", "{}");
        touch(dir.path(), "events-1700000000.log", "loss=0.3");
        touch(dir.path(), "zero-13.meta.json", r#"{"global_step":13}"#);

        let latest = locate(dir.path()).unwrap();
        assert_eq!(latest.prefix, "zero-12");
        assert_eq!(latest.global_step, 12);
        assert_eq!(scan(dir.path()).unwrap().len(), 1);
    }

    #[test]
    fn test_stray_numbered_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "notes-1.txt", "hello");
        assert!(matches!(locate(dir.path()), Err(ModelError::NotFound { .. })));

        // deploy refuses a group without weights too
        let serve = dir.path().join("serve");
        let err = deploy(dir.path().join("notes-1"), &serve).unwrap_err();
        assert!(matches!(err, ModelError::Deploy { .. }));
        assert!(!serve.exists());
    }

    #[test]
    fn test_restore_failure_names_stranded_dir() {
        let root = tempfile::tempdir().unwrap();
        let retired = root.path().join(".serve.old-test");
        let to = root.path().join("serve");

        let reason = restore_previous(&retired, &to).unwrap_err();
        assert!(reason.contains(&retired.display().to_string()));

        fs::create_dir(&retired).unwrap();
        restore_previous(&retired, &to).unwrap();
        assert!(to.is_dir());
        assert!(!retired.exists());
    }

    #[test]
    fn test_hidden_sibling_is_unique_and_hidden() {
        let root = tempfile::tempdir().unwrap();
        let to = root.path().join("nested").join("serve");
        let a = hidden_sibling(&to, "staging").unwrap();
        let b = hidden_sibling(&to, "staging").unwrap();
        assert_ne!(a, b);
        assert_eq!(a.parent(), to.parent());
        assert!(a.file_name().unwrap().to_string_lossy().starts_with(".serve.staging-"));
        assert!(root.path().join("nested").is_dir());
    }
}
