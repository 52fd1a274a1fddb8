//! The build target: the atomic unit of build (`spec.md` §3.3, §4.2).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::graph::BuildGraph;
use crate::input::BuildInput;
use crate::label::BuildLabel;

/// Target lifecycle state. Ordered: the scheduler's invariants rely on
/// the numeric ordering matching the table in `spec.md` §4.2 (`Failed`
/// and `Stopped` are sinks reachable from any earlier state, so they
/// sort last but are not "greater" in the monotonicity sense — callers
/// compare with `State::is_terminal`/`State::at_least` rather than
/// raw `<`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum State {
    Inactive = 0,
    Semiactive = 1,
    Active = 2,
    Pending = 3,
    Building = 4,
    Built = 5,
    Cached = 6,
    Unchanged = 7,
    Reused = 8,
    Stopped = 9,
    Failed = 10,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Inactive,
            1 => State::Semiactive,
            2 => State::Active,
            3 => State::Pending,
            4 => State::Building,
            5 => State::Built,
            6 => State::Cached,
            7 => State::Unchanged,
            8 => State::Reused,
            9 => State::Stopped,
            10 => State::Failed,
            _ => unreachable!("invalid target state byte {v}"),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            State::Built | State::Cached | State::Unchanged | State::Reused | State::Stopped | State::Failed
        )
    }

    pub fn is_built(self) -> bool {
        matches!(self, State::Built | State::Cached | State::Unchanged | State::Reused)
    }

    /// True iff this state is at least as advanced as `other` along
    /// the build-completion axis (`Built`/`Cached`/`Unchanged`/`Reused`
    /// all count as ">= Built"; `Failed`/`Stopped` never satisfy this).
    pub fn at_least(self, other: State) -> bool {
        if matches!(other, State::Built) && self.is_built() {
            return true;
        }
        !matches!(self, State::Failed | State::Stopped) && self as u8 >= other as u8
    }
}

/// An atomic, lock-free holder of a target's lifecycle state.
#[derive(Debug)]
pub struct AtomicState(AtomicU8);

impl AtomicState {
    pub fn new(initial: State) -> AtomicState {
        AtomicState(AtomicU8::new(initial as u8))
    }

    pub fn get(&self) -> State {
        State::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, new: State) {
        self.0.store(new as u8, Ordering::Release);
    }

    /// Compare-and-swap from `before` to `after`. This is the
    /// synchronisation primitive multiple scheduler threads race on
    /// when two dependencies of the same target complete
    /// simultaneously: only one wins and proceeds past the CAS.
    pub fn sync_update_state(&self, before: State, after: State) -> bool {
        self.0
            .compare_exchange(before as u8, after as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// CAS from any state `< floor` to `target`. Used by the scheduler
    /// to activate a target exactly once regardless of which state it
    /// was found in (the de-duplication point for diamond
    /// dependencies, `spec.md` §4.5 step 2).
    pub fn cas_below(&self, floor: State, target: State) -> bool {
        loop {
            let current = self.get();
            if current as u8 >= floor as u8 {
                return false;
            }
            if self.sync_update_state(current, target) {
                return true;
            }
        }
    }
}

/// One declared dependency edge, plus the flags that govern
/// require/provide rewriting and visibility checks.
#[derive(Clone, Debug)]
pub struct Dependency {
    pub declared: BuildLabel,
    /// The resolved set of actual targets this edge points at, after
    /// require/provide rewriting. Usually a single element; more than
    /// one when several provided tags match.
    pub resolved: Vec<BuildLabel>,
    pub exported: bool,
    pub source_only: bool,
    pub data_only: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutKind {
    Build,
    Test,
}

/// The declarative data and lifecycle state of one target.
pub struct Target {
    pub label: BuildLabel,
    dependencies: Mutex<Vec<Dependency>>,
    pub sources: Mutex<Vec<BuildInput>>,
    pub named_sources: Mutex<HashMap<String, Vec<BuildInput>>>,
    pub data: Mutex<Vec<BuildInput>>,
    pub named_data: Mutex<HashMap<String, Vec<BuildInput>>>,
    outputs: Mutex<Vec<String>>,
    pub named_outputs: Mutex<HashMap<String, Vec<String>>>,
    pub optional_outputs: Vec<String>,
    pub command: Option<String>,
    pub commands: HashMap<String, String>,
    pub test_command: Option<String>,
    pub test_commands: HashMap<String, String>,
    pub tools: Mutex<Vec<BuildInput>>,
    pub named_tools: Mutex<HashMap<String, Vec<BuildInput>>>,
    pub entry_points: HashMap<String, String>,
    pub visibility: Vec<BuildLabel>,
    pub licences: Vec<String>,
    pub labels: Vec<String>,
    pub requires: Vec<String>,
    pub provides: HashMap<String, BuildLabel>,
    pub is_binary: bool,
    pub is_test: bool,
    pub is_filegroup: bool,
    pub test_only: bool,
    pub needs_transitive_deps: bool,
    pub output_is_complete: bool,
    pub stamp: bool,
    pub building_description: String,
    pub flakiness: u32,
    pub build_timeout: Option<Duration>,
    pub test_timeout: Option<Duration>,
    state: AtomicState,
}

impl Target {
    pub fn new(label: BuildLabel) -> Target {
        Target {
            label,
            dependencies: Mutex::new(Vec::new()),
            sources: Mutex::new(Vec::new()),
            named_sources: Mutex::new(HashMap::new()),
            data: Mutex::new(Vec::new()),
            named_data: Mutex::new(HashMap::new()),
            outputs: Mutex::new(Vec::new()),
            named_outputs: Mutex::new(HashMap::new()),
            optional_outputs: Vec::new(),
            command: None,
            commands: HashMap::new(),
            test_command: None,
            test_commands: HashMap::new(),
            tools: Mutex::new(Vec::new()),
            named_tools: Mutex::new(HashMap::new()),
            entry_points: HashMap::new(),
            visibility: Vec::new(),
            licences: Vec::new(),
            labels: Vec::new(),
            requires: Vec::new(),
            provides: HashMap::new(),
            is_binary: false,
            is_test: false,
            is_filegroup: false,
            test_only: false,
            needs_transitive_deps: false,
            output_is_complete: false,
            stamp: false,
            building_description: "Building...".to_string(),
            flakiness: 0,
            build_timeout: None,
            test_timeout: None,
            state: AtomicState::new(State::Inactive),
        }
    }

    pub fn state(&self) -> State {
        self.state.get()
    }

    pub fn set_state(&self, new: State) {
        self.state.set(new);
    }

    pub fn sync_update_state(&self, before: State, after: State) -> bool {
        self.state.sync_update_state(before, after)
    }

    pub fn cas_below(&self, floor: State, target: State) -> bool {
        self.state.cas_below(floor, target)
    }

    /// Add `input` as a source. If it carries a label, also records a
    /// (non-exported, non-source-only, non-data-only) dependency edge
    /// on that label.
    pub fn add_source(&self, input: BuildInput) {
        let label = input.label().copied();
        {
            let mut sources = self.sources.lock().unwrap();
            if sources.contains(&input) {
                return;
            }
            sources.push(input);
        }
        if let Some(label) = label {
            self.add_dependency(label, false, false, false);
        }
    }

    /// Add an output, keeping the list sorted and deduplicated.
    /// Duplicate `add_output` calls are silent no-ops.
    pub fn add_output(&self, path: impl Into<String>) {
        let path = path.into();
        let mut outputs = self.outputs.lock().unwrap();
        if let Err(idx) = outputs.binary_search(&path) {
            outputs.insert(idx, path);
        }
    }

    pub fn outputs(&self) -> Vec<String> {
        self.outputs.lock().unwrap().clone()
    }

    /// Record a declared dependency.
    ///
    /// Deduplicates by declared label. A later call with
    /// `exported=true` upgrades an existing entry to exported. As a
    /// documented quirk that the test suite relies on, a later call
    /// with `source_only=false` cancels a prior `source_only` flag
    /// even if the new call did not explicitly ask for that — once any
    /// call says "this is a real (non-source-only) dependency", it
    /// stays that way.
    pub fn add_dependency(&self, declared: BuildLabel, exported: bool, source_only: bool, data_only: bool) {
        assert!(
            declared != self.label,
            "{} may not depend on itself",
            self.label
        );
        let mut deps = self.dependencies.lock().unwrap();
        if let Some(existing) = deps.iter_mut().find(|d| d.declared == declared) {
            if exported {
                existing.exported = true;
            }
            if !source_only {
                existing.source_only = false;
            }
            if data_only {
                existing.data_only = true;
            }
            return;
        }
        deps.push(Dependency {
            declared,
            resolved: vec![declared],
            exported,
            source_only,
            data_only,
        });
    }

    pub fn dependencies(&self) -> Vec<Dependency> {
        self.dependencies.lock().unwrap().clone()
    }

    pub fn set_resolved(&self, declared: BuildLabel, resolved: Vec<BuildLabel>) {
        let mut deps = self.dependencies.lock().unwrap();
        if let Some(dep) = deps.iter_mut().find(|d| d.declared == declared) {
            dep.resolved = resolved;
        }
    }

    pub fn has_data_dependency_on(&self, declared: &BuildLabel) -> bool {
        self.dependencies
            .lock()
            .unwrap()
            .iter()
            .any(|d| &d.declared == declared && d.data_only)
            || self
                .data
                .lock()
                .unwrap()
                .iter()
                .any(|input| input.label().as_ref() == Some(&declared))
    }

    /// Visibility check (`spec.md` §4.2): `other` is the dependency
    /// being considered, `self` is the target declaring the
    /// dependency. `experimental` names the set of experimental-tree
    /// package prefixes, config-defined.
    pub fn can_see(&self, other: &Target, experimental: &dyn Fn(&str) -> bool) -> bool {
        if self.label.package_name() == other.label.package_name() {
            return true;
        }
        let other_experimental = experimental(other.label.package_name());
        let self_experimental = experimental(self.label.package_name());
        if other_experimental && !self_experimental {
            warn!(
                "{} cannot see {}: {} is experimental",
                self.label, other.label, other.label
            );
            return false;
        }
        let parent = self.label.parent();
        if other.visibility.iter().any(|v| v.includes(&parent)) {
            return true;
        }
        if self_experimental {
            warn!(
                "{} is in an experimental package, ignoring visibility of {}",
                self.label, other.label
            );
            return true;
        }
        false
    }

    /// `spec.md` §4.2: runs `can_see` over every declared dependency
    /// resolved against `graph`, and additionally rejects a test-only
    /// dependency pulled in by a target that is neither a test nor
    /// itself `test_only`.
    pub fn check_dependency_visibility(
        &self,
        graph: &BuildGraph,
        experimental: &dyn Fn(&str) -> bool,
    ) -> CoreResult<()> {
        let may_depend_on_test_only = self.is_test || self.test_only;
        for dep in self.dependencies() {
            for resolved in &dep.resolved {
                let Some(other) = graph.target(resolved) else {
                    continue;
                };
                if !self.can_see(&other, experimental) {
                    return Err(CoreError::VisibilityError {
                        dependent: self.label,
                        dependency: other.label,
                    });
                }
                if other.test_only && !may_depend_on_test_only {
                    return Err(CoreError::VisibilityError {
                        dependent: self.label,
                        dependency: other.label,
                    });
                }
            }
        }
        Ok(())
    }

    /// `spec.md` §3.4 require/provide. `other` is the declared
    /// dependency target; returns the set of targets `self` should
    /// actually depend on.
    pub fn provide_for(&self, other: &Target, other_is_data: bool) -> Vec<BuildLabel> {
        if other_is_data {
            return vec![other.label];
        }
        if self.requires.is_empty() || other.provides.is_empty() {
            return vec![other.label];
        }
        let matches: Vec<BuildLabel> = self
            .requires
            .iter()
            .filter_map(|tag| other.provides.get(tag).copied())
            .collect();
        if matches.is_empty() {
            vec![other.label]
        } else {
            matches
        }
    }

    pub fn add_label(&mut self, label: impl Into<String>) {
        self.labels.push(label.into());
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("label", &self.label)
            .field("state", &self.state())
            .finish()
    }
}

/// Logs and returns the transitions a build-timeout/test-timeout maps
/// to: a `Failed` terminal state carrying the elapsed duration.
pub fn timeout_transition(target: &Target, kind: TimeoutKind, elapsed: Duration) {
    debug!("{} timed out ({:?}) after {:?}", target.label, kind, elapsed);
    target.set_state(State::Failed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn outputs_are_sorted_and_deduplicated() {
        let t = Target::new(BuildLabel::must_parse("//p:t"));
        t.add_output("b.txt");
        t.add_output("a.txt");
        t.add_output("a.txt");
        assert_eq!(t.outputs(), vec!["a.txt".to_string(), "b.txt".to_string()]);
    }

    #[test]
    fn cannot_depend_on_self() {
        let t = Target::new(BuildLabel::must_parse("//p:t"));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            t.add_dependency(t.label, false, false, false);
        }));
        assert!(result.is_err());
    }

    #[test]
    fn later_exported_call_upgrades_existing_dependency() {
        let t = Target::new(BuildLabel::must_parse("//p:t"));
        let dep = BuildLabel::must_parse("//p:dep");
        t.add_dependency(dep, false, true, false);
        t.add_dependency(dep, true, false, false);
        let deps = t.dependencies();
        assert_eq!(deps.len(), 1);
        assert!(deps[0].exported);
        assert!(!deps[0].source_only, "a later non-source-only call cancels the flag");
    }

    #[test]
    fn state_cas_is_exactly_once_under_race() {
        let t = Target::new(BuildLabel::must_parse("//p:t"));
        let wins: usize = (0..8)
            .map(|_| t.cas_below(State::Active, State::Active))
            .filter(|w| *w)
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn state_monotonicity_failed_is_a_sink() {
        let t = Target::new(BuildLabel::must_parse("//p:t"));
        t.set_state(State::Building);
        assert!(t.sync_update_state(State::Building, State::Failed));
        assert!(!State::Failed.at_least(State::Built));
    }

    #[test]
    fn provide_for_rewrites_when_tags_match() {
        let mut a = Target::new(BuildLabel::must_parse("//pkg:a"));
        a.requires.push("go".to_string());
        let mut b = Target::new(BuildLabel::must_parse("//pkg:b"));
        let b_go = BuildLabel::must_parse("//pkg:b_go_part");
        b.provides.insert("go".to_string(), b_go);
        assert_eq!(a.provide_for(&b, false), vec![b_go]);
    }

    #[test]
    fn provide_for_suppressed_by_data_override() {
        let mut a = Target::new(BuildLabel::must_parse("//pkg:a"));
        a.requires.push("go".to_string());
        let mut b = Target::new(BuildLabel::must_parse("//pkg:b"));
        b.provides.insert("go".to_string(), BuildLabel::must_parse("//pkg:b_go"));
        assert_eq!(a.provide_for(&b, true), vec![b.label]);
    }

    #[test]
    fn can_see_same_package() {
        let a = Target::new(BuildLabel::must_parse("//pkg:a"));
        let b = Target::new(BuildLabel::must_parse("//pkg:b"));
        assert!(a.can_see(&b, &|_| false));
    }

    #[test]
    fn can_see_respects_visibility_list() {
        let a = Target::new(BuildLabel::must_parse("//app/ui:u"));
        let mut lib = Target::new(BuildLabel::must_parse("//lib:l"));
        lib.visibility.push(BuildLabel::must_parse("//app/..."));
        assert!(a.can_see(&lib, &|_| false));

        let other = Target::new(BuildLabel::must_parse("//other:o"));
        assert!(!other.can_see(&lib, &|_| false));
    }

    #[test]
    fn check_dependency_visibility_passes_and_fails_per_declared_patterns() {
        let graph = BuildGraph::new();
        let mut lib = Target::new(BuildLabel::must_parse("//lib:l"));
        lib.visibility.push(BuildLabel::must_parse("//app/..."));
        graph.add_target(Arc::new(lib)).unwrap();

        let ui = Target::new(BuildLabel::must_parse("//app/ui:u"));
        ui.add_dependency(BuildLabel::must_parse("//lib:l"), false, false, false);
        assert!(ui.check_dependency_visibility(&graph, &|_| false).is_ok());

        let other = Target::new(BuildLabel::must_parse("//other:o"));
        other.add_dependency(BuildLabel::must_parse("//lib:l"), false, false, false);
        assert!(matches!(
            other.check_dependency_visibility(&graph, &|_| false),
            Err(CoreError::VisibilityError { .. })
        ));
    }

    #[test]
    fn check_dependency_visibility_rejects_test_only_dep_of_non_test() {
        let graph = BuildGraph::new();
        let mut helper = Target::new(BuildLabel::must_parse("//pkg:helper"));
        helper.test_only = true;
        graph.add_target(Arc::new(helper)).unwrap();

        let bin = Target::new(BuildLabel::must_parse("//pkg:bin"));
        bin.add_dependency(BuildLabel::must_parse("//pkg:helper"), false, false, false);
        assert!(matches!(
            bin.check_dependency_visibility(&graph, &|_| false),
            Err(CoreError::VisibilityError { .. })
        ));

        let mut test = Target::new(BuildLabel::must_parse("//pkg:test"));
        test.is_test = true;
        test.add_dependency(BuildLabel::must_parse("//pkg:helper"), false, false, false);
        assert!(test.check_dependency_visibility(&graph, &|_| false).is_ok());
    }
}
