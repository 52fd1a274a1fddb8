//! The dependency scheduler (`spec.md` §4.5): drives `queue_target`,
//! the state machine that turns a requested label into a fully built
//! (or failed) target, dispatching dependencies concurrently and
//! applying require/provide rewriting along the way.
//!
//! The parser and executor are out-of-scope collaborators (`spec.md`
//! §6); they are injected here as the [`Parser`] and [`Executor`]
//! traits rather than driven through literal OS-level queues, since
//! the scheduler's own concurrency (one OS thread per dependency fan
//! out) already gives the externally observable ordering and overlap
//! guarantees the design calls for.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use serde_json::{json, Value};

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::graph::BuildGraph;
use crate::label::BuildLabel;
use crate::target::{State, Target};

/// What a `BuildTask` asks the executor to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskMode {
    Build,
    Test,
}

/// A package the parser must load before the target it names can be
/// resolved (`spec.md` §4.5 step 1, §6 "Parser contract").
#[derive(Clone, Debug)]
pub struct ParseTask {
    pub subrepo: String,
    pub package_name: String,
    pub label: BuildLabel,
}

/// A target ready to execute (`spec.md` §4.5 step 6, §6 "Executor
/// contract").
pub struct BuildTask {
    pub target: Arc<Target>,
    pub mode: TaskMode,
}

/// What the executor reports back (`spec.md` §6).
pub struct ExecutionResult {
    pub target: BuildLabel,
    pub terminal_state: State,
    pub output_hash: Option<String>,
    pub test_results: Option<String>,
    pub error: Option<String>,
}

/// Loads a package on demand. Must eventually add every target it
/// declares to the graph (possibly zero) via `graph.add_package`.
pub trait Parser: Send + Sync {
    fn parse(&self, task: ParseTask) -> CoreResult<()>;
}

/// Builds or tests one target.
pub trait Executor: Send + Sync {
    fn execute(&self, task: BuildTask) -> ExecutionResult;
}

/// The settings a run is configured with (`spec.md` §6).
pub struct BuildState {
    pub graph: Arc<BuildGraph>,
    pub config: Config,
    pub need_build: bool,
    pub need_tests: bool,
    pub parse_only: bool,
    pub need_hashes_only: bool,
    pub include_labels: Vec<String>,
    pub exclude_labels: Vec<String>,
    pub test_args: Vec<String>,
    pub debug_tests: bool,
    pub need_coverage: bool,
    pub aborted: AtomicBool,
    pub original_targets: Mutex<Vec<BuildLabel>>,
}

impl BuildState {
    pub fn new(graph: Arc<BuildGraph>, config: Config) -> BuildState {
        BuildState {
            graph,
            config,
            need_build: true,
            need_tests: false,
            parse_only: false,
            need_hashes_only: false,
            include_labels: Vec::new(),
            exclude_labels: Vec::new(),
            test_args: Vec::new(),
            debug_tests: false,
            need_coverage: false,
            aborted: AtomicBool::new(false),
            original_targets: Mutex::new(Vec::new()),
        }
    }

    /// Cooperative cancellation (`spec.md` §5): new CAS attempts at
    /// activation short-circuit; in-flight executions are left to
    /// finish.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

pub struct Scheduler {
    pub state: Arc<BuildState>,
    parser: Arc<dyn Parser>,
    executor: Arc<dyn Executor>,
}

impl Scheduler {
    pub fn new(state: Arc<BuildState>, parser: Arc<dyn Parser>, executor: Arc<dyn Executor>) -> Arc<Scheduler> {
        Arc::new(Scheduler { state, parser, executor })
    }

    /// Entry point for a requested or dependency-discovered target
    /// (`spec.md` §4.5, "Main operation").
    pub fn queue_target(
        scheduler: &Arc<Scheduler>,
        label: BuildLabel,
        dependent: Option<BuildLabel>,
        force_build: bool,
        mode: TaskMode,
    ) -> CoreResult<()> {
        Scheduler::queue_target_on_path(scheduler, label, dependent, force_build, mode, &[])
    }

    /// `path` is the chain of ancestor labels currently being
    /// activated on this call stack; re-entering a label already on
    /// it is a real dependency cycle, as opposed to a sibling branch
    /// independently racing to activate the same (diamond-shared)
    /// target, which the activation CAS alone cannot distinguish.
    fn queue_target_on_path(
        scheduler: &Arc<Scheduler>,
        label: BuildLabel,
        dependent: Option<BuildLabel>,
        force_build: bool,
        mode: TaskMode,
        path: &[BuildLabel],
    ) -> CoreResult<()> {
        if path.contains(&label) {
            if let Some(t) = scheduler.state.graph.target(&label) {
                t.set_state(State::Failed);
            }
            let mut cycle = path.to_vec();
            cycle.push(label);
            return Err(CoreError::CycleDetected(cycle));
        }
        if scheduler.state.is_aborted() {
            if let Some(t) = scheduler.state.graph.target(&label) {
                t.cas_below(State::Stopped, State::Stopped);
            }
            return Ok(());
        }

        // Step 1: resolution.
        let target = match scheduler.state.graph.target(&label) {
            Some(t) => t,
            None => {
                let task = ParseTask {
                    subrepo: label.subrepo().to_string(),
                    package_name: label.package_name().to_string(),
                    label,
                };
                scheduler.parser.parse(task)?;
                scheduler
                    .state
                    .graph
                    .target(&label)
                    .ok_or(CoreError::TargetNotFound(label))?
            }
        };

        // Step 2: activation.
        if !scheduler.state.need_build {
            target.set_state(State::Semiactive);
            return Ok(());
        }
        if !target.cas_below(State::Active, State::Active) {
            return Ok(());
        }

        let next_path: Vec<BuildLabel> = path.iter().copied().chain(std::iter::once(label)).collect();

        // Step 3: require/provide projection.
        if let Some(dep_label) = dependent {
            if let Some(dependent_target) = scheduler.state.graph.target(&dep_label) {
                let rewritten = scheduler.state.graph.dependent_targets(&dep_label, &label);
                dependent_target.set_resolved(label, rewritten.clone());
                for resolved_label in &rewritten {
                    if *resolved_label != label {
                        if let Err(e) =
                            Scheduler::queue_target_on_path(scheduler, *resolved_label, Some(dep_label), force_build, mode, &next_path)
                        {
                            target.set_state(State::Failed);
                            return Err(e);
                        }
                    }
                }
            }
        }

        // Step 4: recursive dispatch, one OS thread per dependency.
        let deps = target.dependencies();
        let handles: Vec<_> = deps
            .iter()
            .map(|dep| {
                let scheduler = Arc::clone(scheduler);
                let declared = dep.declared;
                let path_clone = next_path.clone();
                thread::spawn(move || Scheduler::queue_target_on_path(&scheduler, declared, Some(label), force_build, mode, &path_clone))
            })
            .collect();
        for handle in handles {
            if let Err(e) = handle.join().expect("dependency thread panicked") {
                target.set_state(State::Failed);
                return Err(e);
            }
        }

        // Step 4b: visibility, once every declared dependency has been
        // resolved into the graph by the fan-out above.
        if let Err(e) = target.check_dependency_visibility(&scheduler.state.graph, &|pkg| scheduler.state.config.is_experimental(pkg)) {
            target.set_state(State::Failed);
            return Err(e);
        }

        // Step 5: wait for resolved dependencies to reach >= Built.
        let resolved: Vec<BuildLabel> = target.dependencies().iter().flat_map(|d| d.resolved.clone()).collect();
        let mut failed = false;
        for dep_label in &resolved {
            let Some(dep_target) = scheduler.state.graph.wait_for_target(dep_label) else {
                failed = true;
                continue;
            };
            loop {
                let s = dep_target.state();
                if s.at_least(State::Built) {
                    break;
                }
                if matches!(s, State::Failed | State::Stopped) {
                    if !(target.is_test && target.has_data_dependency_on(dep_label)) {
                        failed = true;
                    }
                    break;
                }
                thread::sleep(Duration::from_millis(2));
            }
        }
        if failed {
            target.set_state(State::Failed);
            return Err(CoreError::BuildError {
                target: label,
                reason: "a dependency of this target failed".to_string(),
            });
        }

        // Step 6: emit the build task.
        if !target.sync_update_state(State::Active, State::Pending) {
            return Ok(());
        }
        let outcome = scheduler.executor.execute(BuildTask {
            target: Arc::clone(&target),
            mode,
        });

        // Step 7: handle completion.
        Scheduler::handle_completion(scheduler, &target, outcome, mode)
    }

    fn handle_completion(scheduler: &Arc<Scheduler>, target: &Arc<Target>, outcome: ExecutionResult, mode: TaskMode) -> CoreResult<()> {
        target.set_state(outcome.terminal_state);
        if outcome.terminal_state == State::Failed {
            let reason = outcome.error.unwrap_or_else(|| "build failed".to_string());
            warn!("{} failed: {reason}", target.label);
            return Err(CoreError::BuildError { target: target.label, reason });
        }
        debug!("{} reached {:?}", target.label, outcome.terminal_state);
        if scheduler.state.need_tests && target.is_test && mode == TaskMode::Build {
            Scheduler::queue_target(scheduler, target.label, None, true, TaskMode::Test)?;
        }
        Ok(())
    }
}

/// Stamp file (`spec.md` §6): `{ "targets": { "<label>": { "labels":
/// [...], "licences": [...] }, ... } }` over `root` and every
/// transitive dependency, keyed by canonical label string.
pub fn stamp_json(graph: &BuildGraph, root: &BuildLabel) -> Value {
    let mut seen = HashSet::new();
    let mut targets = serde_json::Map::new();
    let mut stack = vec![*root];
    while let Some(label) = stack.pop() {
        if !seen.insert(label) {
            continue;
        }
        let Some(target) = graph.target(&label) else {
            continue;
        };
        targets.insert(
            label.to_string(),
            json!({
                "labels": target.labels,
                "licences": target.licences,
            }),
        );
        for dep in target.dependencies() {
            stack.extend(dep.resolved);
        }
    }
    json!({ "targets": targets })
}

/// Include/exclude label filtering on the original target set
/// (`spec.md` §4.5). A comma-separated clause requires *all* of its
/// members to be present among the target's labels; `include` passes
/// if *any* clause matches, `exclude` rejects if *any* clause matches.
/// Tests carry the implicit label `test`; `manual` targets are always
/// excluded from a wildcard build.
pub fn is_included(target: &Target, include: &[String], exclude: &[String]) -> bool {
    let mut labels = target.labels.clone();
    if target.is_test {
        labels.push("test".to_string());
    }
    if labels.iter().any(|l| l == "manual") {
        return false;
    }
    let matches_clause = |clause: &str| clause.split(',').all(|part| labels.iter().any(|l| l == part.trim()));
    if exclude.iter().any(|c| matches_clause(c)) {
        return false;
    }
    include.is_empty() || include.iter().any(|c| matches_clause(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PanicParser;
    impl Parser for PanicParser {
        fn parse(&self, task: ParseTask) -> CoreResult<()> {
            panic!("parser should not be invoked for {}/{}", task.subrepo, task.package_name);
        }
    }

    struct RecordingExecutor {
        order: Mutex<Vec<BuildLabel>>,
    }

    impl Executor for RecordingExecutor {
        fn execute(&self, task: BuildTask) -> ExecutionResult {
            self.order.lock().unwrap().push(task.target.label);
            ExecutionResult {
                target: task.target.label,
                terminal_state: State::Built,
                output_hash: None,
                test_results: None,
                error: None,
            }
        }
    }

    fn target(label: &str) -> Arc<Target> {
        Arc::new(Target::new(BuildLabel::must_parse(label)))
    }

    #[test]
    fn diamond_builds_each_target_exactly_once_in_dependency_order() {
        let graph = Arc::new(BuildGraph::new());
        let a = target("//p:a");
        let b = target("//p:b");
        let c = target("//p:c");
        let d = target("//p:d");
        a.add_dependency(b.label, false, false, false);
        a.add_dependency(c.label, false, false, false);
        b.add_dependency(d.label, false, false, false);
        c.add_dependency(d.label, false, false, false);
        for t in [&a, &b, &c, &d] {
            graph.add_target(t.clone()).unwrap();
        }

        let state = Arc::new(BuildState::new(graph, Config::default()));
        let executor = Arc::new(RecordingExecutor { order: Mutex::new(Vec::new()) });
        let scheduler = Scheduler::new(state, Arc::new(PanicParser), executor.clone());

        Scheduler::queue_target(&scheduler, a.label, None, false, TaskMode::Build).unwrap();

        assert_eq!(a.state(), State::Built);
        assert_eq!(b.state(), State::Built);
        assert_eq!(c.state(), State::Built);
        assert_eq!(d.state(), State::Built);

        let order = executor.order.lock().unwrap();
        let pos = |l: BuildLabel| order.iter().position(|x| *x == l).unwrap();
        assert!(pos(d.label) < pos(b.label), "d must build before b");
        assert!(pos(d.label) < pos(c.label), "d must build before c");
        assert!(pos(b.label) < pos(a.label), "b must build before a");
        assert!(pos(c.label) < pos(a.label), "c must build before a");
    }

    #[test]
    fn indirect_cycle_fails_without_deadlocking() {
        let graph = Arc::new(BuildGraph::new());
        let a = target("//p:a");
        let b = target("//p:b");
        a.add_dependency(b.label, false, false, false);
        b.add_dependency(a.label, false, false, false);
        graph.add_target(a.clone()).unwrap();
        graph.add_target(b.clone()).unwrap();

        let state = Arc::new(BuildState::new(graph, Config::default()));
        let executor = Arc::new(RecordingExecutor { order: Mutex::new(Vec::new()) });
        let scheduler = Scheduler::new(state, Arc::new(PanicParser), executor);

        let result = Scheduler::queue_target(&scheduler, a.label, None, false, TaskMode::Build);
        assert!(matches!(result, Err(CoreError::CycleDetected(_))));
    }

    #[test]
    fn include_requires_all_members_of_a_clause() {
        let mut t = Target::new(BuildLabel::must_parse("//p:t"));
        t.labels.push("go".to_string());
        t.labels.push("slow".to_string());
        assert!(is_included(&t, &["go,slow".to_string()], &[]));
        assert!(!is_included(&t, &["go,fast".to_string()], &[]));
        assert!(is_included(&t, &[], &[]));
    }

    #[test]
    fn exclude_wins_over_include_and_manual_is_always_excluded() {
        let mut t = Target::new(BuildLabel::must_parse("//p:t"));
        t.labels.push("go".to_string());
        assert!(!is_included(&t, &["go".to_string()], &["go".to_string()]));

        let mut manual = Target::new(BuildLabel::must_parse("//p:m"));
        manual.labels.push("manual".to_string());
        assert!(!is_included(&manual, &[], &[]));
    }

    #[test]
    fn queue_target_fails_with_visibility_error_for_an_invisible_dependency() {
        let graph = Arc::new(BuildGraph::new());
        let mut lib = Target::new(BuildLabel::must_parse("//lib:l"));
        lib.visibility.push(BuildLabel::must_parse("//app/..."));
        let lib = Arc::new(lib);
        let other = target("//other:o");
        other.add_dependency(lib.label, false, false, false);
        graph.add_target(lib.clone()).unwrap();
        graph.add_target(other.clone()).unwrap();

        let state = Arc::new(BuildState::new(graph, Config::default()));
        let executor = Arc::new(RecordingExecutor { order: Mutex::new(Vec::new()) });
        let scheduler = Scheduler::new(state, Arc::new(PanicParser), executor);

        let result = Scheduler::queue_target(&scheduler, other.label, None, false, TaskMode::Build);
        assert!(matches!(result, Err(CoreError::VisibilityError { .. })));
        assert_eq!(other.state(), State::Failed);
    }

    #[test]
    fn stamp_json_covers_target_and_transitive_deps() {
        let graph = BuildGraph::new();
        let mut a = Target::new(BuildLabel::must_parse("//p:a"));
        a.labels.push("go".to_string());
        let mut b = Target::new(BuildLabel::must_parse("//p:b"));
        b.licences.push("MIT".to_string());
        a.add_dependency(b.label, false, false, false);
        graph.add_target(Arc::new(a)).unwrap();
        graph.add_target(Arc::new(b)).unwrap();

        let stamp = stamp_json(&graph, &BuildLabel::must_parse("//p:a"));
        let targets = stamp["targets"].as_object().unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets["//p:a"]["labels"], serde_json::json!(["go"]));
        assert_eq!(targets["//p:b"]["licences"], serde_json::json!(["MIT"]));
    }

    #[test]
    fn tests_carry_the_implicit_test_label() {
        let mut t = Target::new(BuildLabel::must_parse("//p:t"));
        t.is_test = true;
        assert!(is_included(&t, &["test".to_string()], &[]));
    }
}
