//! Build inputs: polymorphic values standing for "something whose
//! contents contribute to a rule" (`spec.md` §3.2).
//!
//! Modelled as a tagged `enum` rather than a boxed trait object per
//! the explicit guidance in `spec.md` §9: inputs are created in bulk
//! at parse time and queried in hot loops, so a match on a small fixed
//! set of variants beats dynamic dispatch.

use std::path::{Path, PathBuf};

use crate::label::BuildLabel;
use crate::output::OutputLayout;

/// Looks up a target's default-output-directory placement. Implemented
/// by `graph::BuildGraph`; kept as a narrow trait here so `BuildInput`
/// does not need to depend on the whole graph module.
pub trait OutputLocator {
    /// Whether `label`'s outputs are binary (published to
    /// `plz-out/bin/…`) or not (`plz-out/gen/…`).
    fn is_binary(&self, label: &BuildLabel) -> bool;

    /// The default (unannotated) outputs of `label`, as filenames
    /// relative to its package.
    fn default_outputs(&self, label: &BuildLabel) -> Vec<String>;

    /// The outputs of a named output group, or of an entry point.
    fn named_outputs(&self, label: &BuildLabel, annot: &str) -> Vec<String>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildInput {
    /// A filename plus its owning package.
    LocalFile { package: String, file: String },
    /// As `LocalFile`, but rooted inside a subrepo's tree.
    SubrepoFile {
        package: String,
        file: String,
        subrepo_root: PathBuf,
    },
    /// An absolute or `~`-prefixed path outside the build's control.
    SystemFile { path: String },
    /// A bare tool name (`bash`), resolved against the configured
    /// search path at access time.
    SystemPathTool { name: String },
    /// Another target's default outputs.
    Label(BuildLabel),
    /// A named output group of another target, or a declared entry
    /// point annotation.
    AnnotatedOutputLabel { label: BuildLabel, annot: String },
    /// A remote URL, meaningful only for remote-file targets.
    Url(String),
}

impl BuildInput {
    pub fn label(&self) -> Option<&BuildLabel> {
        match self {
            BuildInput::Label(l) => Some(l),
            BuildInput::AnnotatedOutputLabel { label, .. } => Some(label),
            _ => None,
        }
    }

    /// Package-relative paths suitable for placing inside the
    /// target's sandbox.
    pub fn paths(&self, outputs: &dyn OutputLocator) -> Vec<String> {
        match self {
            BuildInput::LocalFile { file, .. } | BuildInput::SubrepoFile { file, .. } => {
                vec![file.clone()]
            }
            BuildInput::SystemFile { path } => vec![path.clone()],
            BuildInput::SystemPathTool { name } => vec![name.clone()],
            BuildInput::Url(url) => vec![url.clone()],
            BuildInput::Label(label) => outputs.default_outputs(label),
            BuildInput::AnnotatedOutputLabel { label, annot } => outputs.named_outputs(label, annot),
        }
    }

    /// `paths()`, but label-kind inputs are prefixed with
    /// `plz-out/{gen,bin}/…`.
    pub fn full_paths(&self, outputs: &dyn OutputLocator, layout: &OutputLayout) -> Vec<String> {
        match self {
            BuildInput::Label(label) | BuildInput::AnnotatedOutputLabel { label, .. } => {
                let dir = layout.out_dir(label, outputs.is_binary(label));
                self.paths(outputs)
                    .into_iter()
                    .map(|p| dir.join(p).to_string_lossy().into_owned())
                    .collect()
            }
            _ => self.paths(outputs),
        }
    }

    /// Paths relative to the owning package (file-kind inputs only
    /// have a meaningful owning package; label-kind inputs fall back
    /// to `paths()`).
    pub fn local_paths(&self, outputs: &dyn OutputLocator) -> Vec<String> {
        match self {
            BuildInput::LocalFile { package, file } => vec![Path::new(package).join(file).to_string_lossy().into_owned()],
            BuildInput::SubrepoFile {
                package,
                file,
                subrepo_root,
            } => vec![subrepo_root.join(package).join(file).to_string_lossy().into_owned()],
            _ => self.paths(outputs),
        }
    }
}
