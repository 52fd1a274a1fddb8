//! End-to-end scenarios driving the public API together: the graph,
//! the scheduler, and the command expander.

use std::sync::{Arc, Mutex};

use please_core::command::Expander;
use please_core::config::Config;
use please_core::error::CoreError;
use please_core::graph::BuildGraph;
use please_core::input::BuildInput;
use please_core::label::BuildLabel;
use please_core::output::OutputLayout;
use please_core::scheduler::{stamp_json, BuildState, BuildTask, ExecutionResult, Executor, Parser, ParseTask, Scheduler, TaskMode};
use please_core::target::{State, Target};

fn label(s: &str) -> BuildLabel {
    BuildLabel::must_parse(s)
}

fn target(s: &str) -> Arc<Target> {
    Arc::new(Target::new(label(s)))
}

struct PanicParser;
impl Parser for PanicParser {
    fn parse(&self, task: ParseTask) -> please_core::error::CoreResult<()> {
        panic!("no package should need parsing in this scenario: {}", task.package_name);
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

/// Scenario A — diamond: `a -> b, a -> c, b -> d, c -> d`. Building
/// `a` must build each target exactly once, with `d` ahead of `b`/`c`
/// ahead of `a`.
#[test]
fn scenario_a_diamond_builds_each_target_once() {
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

    for t in [&a, &b, &c, &d] {
        assert_eq!(t.state(), State::Built);
    }
    let order = executor.order.lock().unwrap();
    assert_eq!(order.iter().filter(|l| **l == d.label).count(), 1, "d builds exactly once");
    let pos = |l: BuildLabel| order.iter().position(|x| *x == l).unwrap();
    assert!(pos(d.label) < pos(b.label));
    assert!(pos(d.label) < pos(c.label));
    assert!(pos(b.label) < pos(a.label));
    assert!(pos(c.label) < pos(a.label));
}

/// Scenario B — provide rewrite: `a.requires = ["go"]`, `b.provides =
/// {"go": //x:b_go}`, `a -> b`. Resolution should rewrite the edge to
/// `b_go` and build it in place of `b`.
#[test]
fn scenario_b_provide_rewrite_resolves_to_provided_target() {
    let graph = BuildGraph::new();
    let mut a = Target::new(label("//p:a"));
    a.requires.push("go".to_string());
    let b_go = label("//x:b_go");
    let mut b = Target::new(label("//p:b"));
    b.provides.insert("go".to_string(), b_go);
    let a_label = a.label;
    graph.add_target(Arc::new(a)).unwrap();
    graph.add_target(Arc::new(b)).unwrap();

    assert_eq!(graph.dependent_targets(&a_label, &label("//p:b")), vec![b_go]);
}

/// Scenario C — data override of provide: as B, but `a.data` also
/// contains `b`, so `dependent_targets` must not rewrite.
#[test]
fn scenario_c_data_dependency_suppresses_provide_rewrite() {
    let graph = BuildGraph::new();
    let mut a = Target::new(label("//p:a"));
    a.requires.push("go".to_string());
    a.data.get_mut().unwrap().push(BuildInput::Label(label("//p:b")));
    let b_label = label("//p:b");
    let mut b = Target::new(b_label);
    b.provides.insert("go".to_string(), label("//x:b_go"));
    graph.add_target(Arc::new(a)).unwrap();
    graph.add_target(Arc::new(b)).unwrap();

    assert_eq!(graph.dependent_targets(&label("//p:a"), &b_label), vec![b_label]);
}

/// Scenario D — visibility: `//lib:l` is visible to `//app/...`, so
/// `//app/ui:u` can see it but `//other:o` cannot.
/// `u.check_dependency_visibility()` passes; `o.check_dependency_visibility()`
/// returns `VisibilityError`.
#[test]
fn scenario_d_visibility_restricts_to_declared_patterns() {
    let graph = BuildGraph::new();
    let mut lib = Target::new(label("//lib:l"));
    lib.visibility.push(label("//app/..."));
    graph.add_target(Arc::new(lib)).unwrap();

    let u = Target::new(label("//app/ui:u"));
    u.add_dependency(label("//lib:l"), false, false, false);
    assert!(u.check_dependency_visibility(&graph, &|_| false).is_ok());

    let o = Target::new(label("//other:o"));
    o.add_dependency(label("//lib:l"), false, false, false);
    assert!(matches!(
        o.check_dependency_visibility(&graph, &|_| false),
        Err(CoreError::VisibilityError { .. })
    ));
}

/// Scenario E — command substitution: `$(location)` is package
/// relative, `$(out_location)` is `plz-out`-relative.
#[test]
fn scenario_e_location_and_out_location_render_different_roots() {
    let graph = BuildGraph::new();
    let t2 = Arc::new(Target::new(label("//p:t2")));
    t2.add_output("t2.py");
    graph.add_target(t2).unwrap();

    let t1 = Target::new(label("//p:t1"));
    t1.add_dependency(label("//p:t2"), false, false, false);

    let layout = OutputLayout::new("/repo");
    let config = Config::default();
    let expander = Expander {
        target: &t1,
        graph: &graph,
        layout: &layout,
        config: &config,
        local: true,
    };

    assert_eq!(expander.expand("ln -s $(location //p:t2) ${OUT}").unwrap(), "ln -s p/t2.py ${OUT}");
    assert_eq!(
        expander.expand("ln -s $(out_location //p:t2) ${OUT}").unwrap(),
        "ln -s plz-out/gen/p/t2.py ${OUT}"
    );
}

/// Scenario F — a `$(worker ...)` invocation resolves to an absolute
/// tool path and splits the remote/local command parts.
#[test]
fn scenario_f_worker_splits_remote_and_local_commands() {
    let graph = BuildGraph::new();
    let mut w = Target::new(label("//t:w"));
    w.is_binary = true;
    w.add_output("w");
    graph.add_target(Arc::new(w)).unwrap();

    let mut t1 = Target::new(label("//p:t1"));
    t1.tools.get_mut().unwrap().push(BuildInput::Label(label("//t:w")));

    let layout = OutputLayout::new("/repo");
    let config = Config::default();
    let expander = Expander {
        target: &t1,
        graph: &graph,
        layout: &layout,
        config: &config,
        local: true,
    };

    let cmd = expander.expand_worker("$(worker //t:w) --arg && echo done").unwrap();
    assert_eq!(cmd.worker, "/repo/plz-out/bin/t/w");
    assert_eq!(cmd.remote_args, "--arg");
    assert_eq!(cmd.local_cmd.as_deref(), Some("echo done"));
}

/// Scenario G — the stamp file covers a target and its transitive
/// dependencies, keyed by canonical label string.
#[test]
fn scenario_g_stamp_file_covers_transitive_dependencies() {
    let graph = BuildGraph::new();
    let mut a = Target::new(label("//p:a"));
    a.labels.push("go".to_string());
    let mut b = Target::new(label("//p:b"));
    b.licences.push("Apache-2.0".to_string());
    let c = Target::new(label("//p:c"));
    a.add_dependency(b.label, false, false, false);
    b.add_dependency(c.label, false, false, false);
    graph.add_target(Arc::new(a)).unwrap();
    graph.add_target(Arc::new(b)).unwrap();
    graph.add_target(Arc::new(c)).unwrap();

    let stamp = stamp_json(&graph, &label("//p:a"));
    let targets = stamp["targets"].as_object().unwrap();
    assert_eq!(targets.len(), 3);
    assert!(targets.contains_key("//p:a"));
    assert!(targets.contains_key("//p:b"));
    assert!(targets.contains_key("//p:c"));
    assert_eq!(targets["//p:b"]["licences"][0], "Apache-2.0");
}

/// A genuine cycle (`a -> b -> a`) must fail both participants instead
/// of deadlocking the scheduler.
#[test]
fn cyclic_graph_fails_instead_of_hanging() {
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
