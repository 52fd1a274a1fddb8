//! Command and environment expansion (`spec.md` §4.6): turns a user
//! command string containing `$(…)` sequences, plus a target and the
//! graph, into the concrete argv and environment handed to an
//! executor.

mod subst;

use std::collections::HashMap;

use base64::Engine;
use indexmap::IndexMap;

use crate::error::CoreError;
use crate::graph::BuildGraph;
use crate::input::{BuildInput, OutputLocator};
use crate::label::{split_annotation, BuildLabel};
use crate::output::OutputLayout;
use crate::target::Target;

pub type Env = IndexMap<String, String>;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Build,
    Test,
}

/// A fully expanded `$(worker …)` invocation (`spec.md` §4.6, scenario F).
pub struct WorkerCommand {
    pub worker: String,
    pub remote_args: String,
    pub local_cmd: Option<String>,
}

/// Expands `$(…)` sequences in `target`'s command against `graph`,
/// and builds its environment.
pub struct Expander<'a> {
    pub target: &'a Target,
    pub graph: &'a BuildGraph,
    pub layout: &'a OutputLayout,
    pub config: &'a crate::config::Config,
    /// Whether the build will run locally (tool paths are made
    /// absolute) or remotely (package-relative paths are retained).
    pub local: bool,
}

impl<'a> Expander<'a> {
    fn dependency_labels(&self) -> Vec<BuildLabel> {
        self.target
            .dependencies()
            .iter()
            .flat_map(|d| d.resolved.clone())
            .collect()
    }

    fn tool_labels(&self) -> Vec<BuildLabel> {
        let mut labels: Vec<BuildLabel> = self
            .target
            .tools
            .lock()
            .unwrap()
            .iter()
            .filter_map(|i| i.label().copied())
            .collect();
        for tools in self.target.named_tools.lock().unwrap().values() {
            labels.extend(tools.iter().filter_map(|i| i.label().copied()));
        }
        labels
    }

    fn require_visible(&self, label: &BuildLabel, among: &[BuildLabel]) -> Result<(), CoreError> {
        if among.contains(label) {
            Ok(())
        } else {
            Err(CoreError::CommandSubstError {
                target: self.target.label,
                reason: format!("{label} is not declared as a dependency or tool of {}", self.target.label),
            })
        }
    }

    fn resolve_label(&self, text: &str) -> Result<(BuildLabel, Option<String>), CoreError> {
        let (name, annot) = split_annotation(text);
        let label = BuildLabel::parse(name, Some(self.target.label.package_name()), Some(self.target.label.subrepo()))
            .map_err(|e| CoreError::CommandSubstError {
                target: self.target.label,
                reason: e.to_string(),
            })?;
        Ok((label, annot.map(str::to_string)))
    }

    fn single_output(&self, label: &BuildLabel, annot: Option<&str>) -> Result<String, CoreError> {
        let outputs = match annot {
            Some(a) => self.graph.named_outputs(label, a),
            None => self.graph.default_outputs(label),
        };
        match outputs.as_slice() {
            [single] => Ok(single.clone()),
            [] => Err(CoreError::CommandSubstError {
                target: self.target.label,
                reason: format!("{label} has no outputs"),
            }),
            _ => Err(CoreError::CommandSubstError {
                target: self.target.label,
                reason: format!("{label} has multiple outputs; use the plural form"),
            }),
        }
    }

    fn all_outputs(&self, label: &BuildLabel, annot: Option<&str>) -> Vec<String> {
        match annot {
            Some(a) => self.graph.named_outputs(label, a),
            None => self.graph.default_outputs(label),
        }
    }

    /// `$(location)`/`$(locations)`/non-local `$(exe)` render paths
    /// relative to the repo root (package dir + filename), as opposed
    /// to the `plz-out`-prefixed forms (`spec.md` §4.6 scenario E).
    fn package_relative(label: &BuildLabel, filename: &str) -> String {
        if label.package_name().is_empty() {
            filename.to_string()
        } else {
            format!("{}/{}", label.package_name(), filename)
        }
    }

    fn exe_path(&self, label: &BuildLabel, prefixed: bool) -> Result<String, CoreError> {
        let target = self
            .graph
            .target(label)
            .ok_or_else(|| CoreError::CommandSubstError {
                target: self.target.label,
                reason: format!("{label} does not exist"),
            })?;
        if !target.is_binary {
            return Err(CoreError::CommandSubstError {
                target: self.target.label,
                reason: format!("{label} is not a binary, cannot be used as $(exe ...)"),
            });
        }
        let rel = self.single_output(label, None)?;
        let path = if prefixed || self.local {
            self.layout
                .out_dir(label, true)
                .join(&rel)
                .to_string_lossy()
                .into_owned()
        } else {
            Self::package_relative(label, &rel)
        };
        if target.has_label("java_non_exe") {
            Ok(format!("java -jar {path}"))
        } else {
            Ok(path)
        }
    }

    /// Expand every `$(…)` sequence in `command`, except a leading
    /// `$(worker …)`, which `expand_worker` handles separately because
    /// it changes the shape of the whole command.
    pub fn expand(&self, command: &str) -> Result<String, CoreError> {
        let mut out = String::with_capacity(command.len());
        let mut last = 0;
        for occ in subst::scan(command) {
            out.push_str(&command[last..occ.start]);
            out.push_str(&self.expand_one(occ.kind, occ.args)?);
            last = occ.end;
        }
        out.push_str(&command[last..]);
        Ok(out)
    }

    fn expand_one(&self, kind: &str, args: &str) -> Result<String, CoreError> {
        let (label, annot) = self.resolve_label(args)?;
        let deps = self.dependency_labels();
        let tools = self.tool_labels();
        let value = match kind {
            "location" => {
                self.require_visible(&label, &deps)?;
                let rel = self.single_output(&label, annot.as_deref())?;
                Self::package_relative(&label, &rel)
            }
            "locations" => {
                self.require_visible(&label, &deps)?;
                self.all_outputs(&label, annot.as_deref())
                    .iter()
                    .map(|o| Self::package_relative(&label, o))
                    .collect::<Vec<_>>()
                    .join(" ")
            }
            "exe" => {
                self.require_visible(&label, &tools)?;
                self.exe_path(&label, false)?
            }
            "out_exe" => {
                self.require_visible(&label, &tools)?;
                self.exe_path(&label, true)?
            }
            "out_location" => {
                self.require_visible(&label, &deps)?;
                let t = self.target_of(&label)?;
                let rel = self.single_output(&label, annot.as_deref())?;
                relative_layout().out_dir(&label, t.is_binary).join(rel).to_string_lossy().into_owned()
            }
            "out_locations" => {
                self.require_visible(&label, &deps)?;
                let t = self.target_of(&label)?;
                let dir = relative_layout().out_dir(&label, t.is_binary);
                self.all_outputs(&label, annot.as_deref())
                    .into_iter()
                    .map(|o| dir.join(o).to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join(" ")
            }
            "dir" => {
                self.require_visible(&label, &deps)?;
                label.package_name().to_string()
            }
            "out_dir" => {
                self.require_visible(&label, &deps)?;
                let t = self.target_of(&label)?;
                relative_layout().out_dir(&label, t.is_binary).to_string_lossy().into_owned()
            }
            "hash" => {
                self.require_visible(&label, &deps)?;
                transitive_hash_base64(&label)
            }
            "worker" => {
                self.require_visible(&label, &tools)?;
                self.exe_path(&label, true)?
            }
            other => {
                return Err(CoreError::CommandSubstError {
                    target: self.target.label,
                    reason: format!("unrecognised substitution `$({other} ...)`"),
                })
            }
        };
        Ok(subst::quote_if_needed(&value))
    }

    fn target_of(&self, label: &BuildLabel) -> Result<std::sync::Arc<Target>, CoreError> {
        self.graph.target(label).ok_or_else(|| CoreError::CommandSubstError {
            target: self.target.label,
            reason: format!("{label} does not exist"),
        })
    }

    /// A command of the shape `$(worker L) <remote-args> [&& <local-cmd>]`
    /// must have the worker sequence first; this splits it into its
    /// three parts (`spec.md` §4.6, scenario F).
    pub fn expand_worker(&self, command: &str) -> Result<WorkerCommand, CoreError> {
        let occurrences = subst::scan(command);
        let first = occurrences.first().filter(|o| o.kind == "worker" && o.start == 0).ok_or_else(|| {
            CoreError::CommandSubstError {
                target: self.target.label,
                reason: "$(worker ...) must be the first thing in the command".to_string(),
            }
        })?;
        let worker = self.expand_one(first.kind, first.args)?;
        let rest = command[first.end..].trim_start();
        let (remote_args, local_cmd) = match rest.split_once("&&") {
            Some((remote, local)) => (remote.trim().to_string(), Some(local.trim().to_string())),
            None => (rest.to_string(), None),
        };
        Ok(WorkerCommand {
            worker,
            remote_args,
            local_cmd,
        })
    }

    /// Build the environment for a build or test command
    /// (`spec.md` §4.6).
    pub fn env(&self, mode: Mode, tmp_dir: &std::path::Path) -> Env {
        let mut env = Env::new();
        let label = self.target.label;
        env.insert("PKG".into(), label.package_name().to_string());
        env.insert("PKG_DIR".into(), label.package_name().to_string());
        env.insert("NAME".into(), label.name().to_string());
        env.insert("CONFIG".into(), self.config.build_config.clone());
        env.insert("BUILD_CONFIG".into(), self.config.build_config.clone());

        let tmp_dir_str = tmp_dir.to_string_lossy().into_owned();
        match mode {
            Mode::Build => {
                env.insert("TMP_DIR".into(), tmp_dir_str.clone());
                env.insert("TMPDIR".into(), tmp_dir_str.clone());
            }
            Mode::Test => {
                env.insert("TEST_DIR".into(), tmp_dir_str.clone());
                env.insert("TMPDIR".into(), tmp_dir_str.clone());
            }
        }
        env.insert("HOME".into(), tmp_dir_str);

        let sources = self.joined_full_paths(&self.target.sources.lock().unwrap());
        env.insert("SRCS".into(), sources.join(" "));
        if sources.len() == 1 {
            env.insert("SRC".into(), sources[0].clone());
        }
        for (name, inputs) in self.target.named_sources.lock().unwrap().iter() {
            env.insert(format!("SRCS_{name}"), self.joined_full_paths(inputs).join(" "));
        }

        let outputs = self.target.outputs();
        env.insert("OUTS".into(), outputs.join(" "));
        if outputs.len() == 1 {
            env.insert("OUT".into(), outputs[0].clone());
        }
        for (name, outs) in self.target.named_outputs.lock().unwrap().iter() {
            env.insert(format!("OUTS_{name}"), outs.join(" "));
        }

        let tools = self.joined_full_paths(&self.target.tools.lock().unwrap());
        env.insert("TOOLS".into(), tools.join(" "));
        if tools.len() == 1 {
            env.insert("TOOL".into(), tools[0].clone());
        }
        for (name, inputs) in self.target.named_tools.lock().unwrap().iter() {
            env.insert(format!("TOOLS_{name}"), self.joined_full_paths(inputs).join(" "));
        }

        env.insert(
            "PATH".into(),
            self.config.path.iter().map(|p| expand_tilde(p)).collect::<Vec<_>>().join(":"),
        );
        env.insert("LANG".into(), self.config.lang.clone());
        env.insert("ARCH".into(), std::env::consts::ARCH.to_string());
        env.insert("OS".into(), std::env::consts::OS.to_string());
        env.insert("XARCH".into(), self.config.xarch.clone());
        env.insert("XOS".into(), self.config.xos.clone());
        if let Ok(goroot) = std::env::var("GOROOT") {
            env.insert("GOROOT".into(), goroot);
        }

        if self.target.stamp {
            env.insert("STAMP".into(), transitive_hash_base64(&label));
        }

        if mode == Mode::Test {
            env.insert("RESULTS_FILE".into(), "test.results".to_string());
            env.insert("TEST_ARGS".into(), String::new());
            env.insert("GTEST_OUTPUT".into(), "xml:test.results".to_string());
            let data = self.joined_full_paths(&self.target.data.lock().unwrap());
            env.insert("DATA".into(), data.join(" "));
        }

        for (k, v) in &self.config.build_env {
            env.insert(k.clone(), v.clone());
        }
        env
    }

    fn joined_full_paths(&self, inputs: &[BuildInput]) -> Vec<String> {
        inputs.iter().flat_map(|i| i.full_paths(self.graph, self.layout)).collect()
    }
}

/// `out_location`/`out_locations`/`out_dir` render a `plz-out/…` path
/// relative to the repo root, unlike `out_exe`/`worker`, which are
/// documented as absolute-from-repo (`spec.md` §4.6 scenario E/F).
fn relative_layout() -> OutputLayout {
    OutputLayout::new("")
}

fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{home}{rest}");
        }
    }
    path.to_string()
}

/// Placeholder for the transitive output/stamp hash an executor
/// computes; the core only defines the shape (base64url, 27 chars for
/// a 160-bit hash) and commissions the actual hasher.
fn transitive_hash_base64(label: &BuildLabel) -> String {
    // The real hash is supplied by the hasher collaborator (out of
    // scope, `spec.md` §1); this renders a deterministic placeholder
    // of the documented length so callers can rely on the shape.
    let mut digest = [0u8; 20];
    for (i, chunk) in digest.chunks_mut(8).enumerate() {
        let mut acc: u64 = 0xcbf29ce484222325 ^ (i as u64).wrapping_mul(0x100000001b3);
        for byte in label.to_string().bytes() {
            acc ^= byte as u64;
            acc = acc.wrapping_mul(0x100000001b3);
        }
        let bytes = acc.to_be_bytes();
        chunk.copy_from_slice(&bytes[..chunk.len()]);
    }
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

/// Masks any environment value whose key contains `SECRET` or
/// `PASSWORD` (`spec.md` §4.6, §8 property 9).
pub fn redact(env: &Env) -> HashMap<String, String> {
    env.iter()
        .map(|(k, v)| {
            let upper = k.to_uppercase();
            if upper.contains("SECRET") || upper.contains("PASSWORD") {
                (k.clone(), "************".to_string())
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}
