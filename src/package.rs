//! Packages: the container of targets declared by one build file
//! (`spec.md` §3.5, §4.3).

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::warn;

use crate::error::CoreError;
use crate::label::BuildLabel;
use crate::target::Target;

pub struct Package {
    pub name: String,
    pub filename: PathBuf,
    pub subincludes: Vec<BuildLabel>,
    targets: Mutex<HashMap<String, Arc<Target>>>,
    /// Reverse index: which target declared this output filename.
    /// Filegroup targets may overlap with non-filegroup ones; the
    /// non-filegroup target wins the reverse index.
    outputs: Mutex<HashMap<String, Arc<Target>>>,
    /// Serialises pre-/post-build callback execution for this
    /// package; callbacks mutate the graph and must not run
    /// concurrently with each other within one package.
    callback_lock: Mutex<()>,
    modified_targets: Mutex<HashSet<String>>,
}

impl Package {
    pub fn new(name: impl Into<String>, filename: impl Into<PathBuf>) -> Package {
        Package {
            name: name.into(),
            filename: filename.into(),
            subincludes: Vec::new(),
            targets: Mutex::new(HashMap::new()),
            outputs: Mutex::new(HashMap::new()),
            callback_lock: Mutex::new(()),
            modified_targets: Mutex::new(HashSet::new()),
        }
    }

    pub fn add_target(&self, target: Arc<Target>) -> Result<(), CoreError> {
        let name = target.label.name().to_string();
        let mut targets = self.targets.lock().unwrap();
        if targets.contains_key(&name) {
            return Err(CoreError::DuplicateLabel { label: target.label });
        }
        targets.insert(name, target);
        Ok(())
    }

    pub fn target(&self, name: &str) -> Option<Arc<Target>> {
        self.targets.lock().unwrap().get(name).cloned()
    }

    pub fn all_targets(&self) -> Vec<Arc<Target>> {
        let targets = self.targets.lock().unwrap();
        let mut v: Vec<_> = targets.values().cloned().collect();
        v.sort_by(|a, b| a.label.cmp(&b.label));
        v
    }

    /// Registers that `target` produces `filename`. Two non-filegroup
    /// targets claiming the same output is an error; a filegroup may
    /// overlap with a non-filegroup target, in which case the
    /// non-filegroup target keeps ownership of the reverse index.
    pub fn register_output(&self, filename: &str, target: Arc<Target>) -> Result<(), CoreError> {
        let mut outputs = self.outputs.lock().unwrap();
        match outputs.get(filename) {
            None => {
                outputs.insert(filename.to_string(), target);
                Ok(())
            }
            Some(existing) => {
                if existing.label == target.label {
                    return Ok(());
                }
                if existing.is_filegroup && !target.is_filegroup {
                    outputs.insert(filename.to_string(), target);
                    Ok(())
                } else if target.is_filegroup && !existing.is_filegroup {
                    Ok(())
                } else if existing.is_filegroup && target.is_filegroup {
                    Ok(())
                } else {
                    Err(CoreError::DuplicateOutput {
                        path: filename.to_string(),
                        target: existing.label,
                        other: target.label,
                    })
                }
            }
        }
    }

    pub fn output_owner(&self, filename: &str) -> Option<Arc<Target>> {
        self.outputs.lock().unwrap().get(filename).cloned()
    }

    /// Every target whose `label.parent()` equals `target.label.parent()`.
    pub fn all_children(&self, target: &Target) -> Vec<Arc<Target>> {
        let parent = target.label.parent();
        let mut children: Vec<_> = self
            .all_targets()
            .into_iter()
            .filter(|t| t.label.parent() == parent)
            .collect();
        children.sort_by(|a, b| a.label.cmp(&b.label));
        children
    }

    /// Warn (informational only) when two targets place files into
    /// overlapping subdirectories without a declared dependency
    /// between them.
    pub fn verify_outputs(&self) {
        let targets = self.all_targets();
        for (i, a) in targets.iter().enumerate() {
            for b in targets.iter().skip(i + 1) {
                let a_outputs = a.outputs();
                let a_dirs: HashSet<&str> = a_outputs
                    .iter()
                    .filter_map(|o| o.rsplit_once('/').map(|(d, _)| d))
                    .collect();
                let depends = a.dependencies().iter().any(|d| d.declared == b.label)
                    || b.dependencies().iter().any(|d| d.declared == a.label);
                if depends {
                    continue;
                }
                for output in b.outputs() {
                    if let Some((dir, _)) = output.rsplit_once('/') {
                        if a_dirs.contains(dir) {
                            warn!(
                                "{} and {} both write into `{}` without a declared dependency",
                                a.label, b.label, dir
                            );
                        }
                    }
                }
            }
        }
    }

    /// Serialises pre-/post-build callback execution for this package
    /// and tracks which targets `f` modifies via `record_modified`.
    pub fn enter_build_callback<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&dyn Fn(&str)) -> R,
    {
        let _guard = self.callback_lock.lock().unwrap();
        self.modified_targets.lock().unwrap().clear();
        let record = |name: &str| {
            self.modified_targets.lock().unwrap().insert(name.to_string());
        };
        f(&record)
    }

    pub fn modified_targets(&self) -> Vec<String> {
        self.modified_targets.lock().unwrap().iter().cloned().collect()
    }
}
