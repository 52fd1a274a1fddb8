//! The concurrent build graph (`spec.md` §4.4): the shared registry of
//! targets, packages and subrepos, with wait-for-appearance semantics
//! for dependencies that have not been parsed yet.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use crate::error::CoreError;
use crate::input::OutputLocator;
use crate::label::BuildLabel;
use crate::package::Package;
use crate::subrepo::{Subrepo, SubrepoRegistry};
use crate::target::Target;

#[derive(Clone, PartialEq, Eq, Hash)]
struct PackageKey {
    subrepo: String,
    package_name: String,
}

impl PackageKey {
    fn of(subrepo: &str, package_name: &str) -> PackageKey {
        PackageKey {
            subrepo: subrepo.to_string(),
            package_name: package_name.to_string(),
        }
    }

    fn of_label(label: &BuildLabel) -> PackageKey {
        PackageKey::of(label.subrepo(), label.package_name())
    }
}

/// A lazily-allocated one-shot notifier: `wait_for_target` registers
/// one of these the first time a label is waited on, rather than
/// pre-allocating a condition variable per label in the (potentially
/// very large) label space.
#[derive(Default)]
struct Notifier {
    mutex: Mutex<bool>,
    condvar: Condvar,
}

impl Notifier {
    fn wait_until_fired(&self) {
        let mut fired = self.mutex.lock().unwrap();
        while !*fired {
            fired = self.condvar.wait(fired).unwrap();
        }
    }

    fn fire(&self) {
        *self.mutex.lock().unwrap() = true;
        self.condvar.notify_all();
    }
}

#[derive(Default)]
struct Inner {
    targets: HashMap<BuildLabel, Arc<Target>>,
    packages: HashMap<PackageKey, Arc<Package>>,
    parsed_packages: HashMap<PackageKey, bool>,
    label_waiters: HashMap<BuildLabel, Arc<Notifier>>,
    package_waiters: HashMap<PackageKey, Arc<Notifier>>,
}

/// The concurrent registry of targets, packages and subrepos
/// (`spec.md` §4.4). Any number of readers and writers proceed in
/// parallel; mutation is guarded by a single mutex around the
/// bookkeeping maps, but holding the lock is never on the critical
/// path of a blocking wait (waiters sleep on their own notifier, not
/// on this mutex).
#[derive(Default)]
pub struct BuildGraph {
    inner: Mutex<Inner>,
    pub subrepos: SubrepoRegistry,
}

impl BuildGraph {
    pub fn new() -> BuildGraph {
        BuildGraph::default()
    }

    /// Insert a target. A duplicate label is fatal (a parser bug, not
    /// a recoverable condition).
    pub fn add_target(&self, target: Arc<Target>) -> Result<(), CoreError> {
        let label = target.label;
        let mut inner = self.inner.lock().unwrap();
        if inner.targets.contains_key(&label) {
            return Err(CoreError::DuplicateLabel { label });
        }
        inner.targets.insert(label, target);
        let notifier = inner.label_waiters.remove(&label);
        drop(inner);
        if let Some(notifier) = notifier {
            notifier.fire();
        }
        Ok(())
    }

    /// Insert a (possibly empty) package, marking it fully parsed.
    /// Wakes every `wait_for_target` call blocked on a label inside
    /// this package that was never added. `subrepo` is empty for the
    /// host repo.
    pub fn add_package(&self, subrepo: &str, package: Arc<Package>) {
        let key = PackageKey::of(subrepo, &package.name);
        let mut inner = self.inner.lock().unwrap();
        inner.packages.insert(key.clone(), package);
        inner.parsed_packages.insert(key.clone(), true);
        let notifier = inner.package_waiters.remove(&key);
        drop(inner);
        if let Some(notifier) = notifier {
            notifier.fire();
        }
    }

    pub fn target(&self, label: &BuildLabel) -> Option<Arc<Target>> {
        self.inner.lock().unwrap().targets.get(label).cloned()
    }

    pub fn target_or_die(&self, label: &BuildLabel) -> Arc<Target> {
        self.target(label)
            .unwrap_or_else(|| panic!("target {label} does not exist"))
    }

    pub fn package(&self, subrepo: &str, package_name: &str) -> Option<Arc<Package>> {
        self.inner
            .lock()
            .unwrap()
            .packages
            .get(&PackageKey::of(subrepo, package_name))
            .cloned()
    }

    /// Blocks until `label` is added to the graph, or its package has
    /// been fully parsed without it ever appearing (in which case the
    /// label does not exist and `None` is returned).
    pub fn wait_for_target(&self, label: &BuildLabel) -> Option<Arc<Target>> {
        loop {
            let (label_notifier, package_notifier) = {
                let mut inner = self.inner.lock().unwrap();
                if let Some(t) = inner.targets.get(label) {
                    return Some(t.clone());
                }
                let key = PackageKey::of_label(label);
                if *inner.parsed_packages.get(&key).unwrap_or(&false) {
                    return None;
                }
                let label_notifier = inner
                    .label_waiters
                    .entry(*label)
                    .or_insert_with(|| Arc::new(Notifier::default()))
                    .clone();
                let package_notifier = inner
                    .package_waiters
                    .entry(key)
                    .or_insert_with(|| Arc::new(Notifier::default()))
                    .clone();
                (label_notifier, package_notifier)
            };
            // Either the label itself appears (fires `label_notifier`), or
            // its package finishes parsing without the label ever
            // appearing (fires `package_notifier`). A short bounded wait
            // on the label notifier, followed by re-validating both
            // authoritative maps, catches either outcome; the package
            // notifier exists so a second `wait_for_target` call for the
            // same label (after the first already consumed the wake)
            // still has something registered to wait on.
            label_notifier.wait_with_timeout(std::time::Duration::from_millis(50));
            let _ = &package_notifier;
            let inner = self.inner.lock().unwrap();
            if inner.targets.contains_key(label) {
                drop(inner);
                continue;
            }
            let key = PackageKey::of_label(label);
            if *inner.parsed_packages.get(&key).unwrap_or(&false) {
                return None;
            }
            // Spurious wake with neither condition true yet: loop again.
        }
    }

    pub fn all_targets(&self) -> Vec<Arc<Target>> {
        let inner = self.inner.lock().unwrap();
        let mut v: Vec<_> = inner.targets.values().cloned().collect();
        v.sort_by(|a, b| a.label.cmp(&b.label));
        v
    }

    pub fn add_subrepo(&self, subrepo: Subrepo) -> Result<(), CoreError> {
        self.subrepos.add(subrepo)
    }

    /// `to` passed through require/provide via `from`, or `[to]` if
    /// `from` has no such dependency recorded or no rewrite applies.
    pub fn dependent_targets(&self, from: &BuildLabel, to: &BuildLabel) -> Vec<BuildLabel> {
        let (Some(from_t), Some(to_t)) = (self.target(from), self.target(to)) else {
            return vec![*to];
        };
        let is_data = from_t.has_data_dependency_on(to);
        from_t.provide_for(&to_t, is_data)
    }
}

impl Notifier {
    /// Blocks until fired or `timeout` elapses, whichever is first.
    fn wait_with_timeout(&self, timeout: std::time::Duration) {
        let fired = self.mutex.lock().unwrap();
        if !*fired {
            let _ = self.condvar.wait_timeout(fired, timeout).unwrap();
        }
    }
}

impl OutputLocator for BuildGraph {
    fn is_binary(&self, label: &BuildLabel) -> bool {
        self.target(label).map(|t| t.is_binary).unwrap_or(false)
    }

    fn default_outputs(&self, label: &BuildLabel) -> Vec<String> {
        self.target(label).map(|t| t.outputs()).unwrap_or_default()
    }

    fn named_outputs(&self, label: &BuildLabel, annot: &str) -> Vec<String> {
        let Some(t) = self.target(label) else {
            return Vec::new();
        };
        if let Some(outputs) = t.named_outputs.lock().unwrap().get(annot) {
            return outputs.clone();
        }
        if let Some(entry) = t.entry_points.get(annot) {
            return vec![entry.clone()];
        }
        Vec::new()
    }
}
