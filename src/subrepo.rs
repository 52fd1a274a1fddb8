//! Subrepos: named alternate source trees, possibly for a different
//! architecture (`spec.md` §3.6, §4.3).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::error::CoreError;
use crate::label::BuildLabel;

#[derive(Debug, Clone)]
pub struct Subrepo {
    pub name: String,
    pub root: PathBuf,
    /// The rule that materialised this subrepo, if any (subrepos can
    /// also be declared purely by an architecture-prefixed label).
    pub target: Option<BuildLabel>,
    pub arch: Option<String>,
    pub is_cross_compile: bool,
    /// Each subrepo carries its own build configuration, since it may
    /// target a different architecture than the host repo.
    pub build_state: Arc<Config>,
}

impl PartialEq for Subrepo {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.root == other.root
            && self.target == other.target
            && self.arch == other.arch
            && self.is_cross_compile == other.is_cross_compile
    }
}

/// Flat, thread-safe `name -> Subrepo` registry.
#[derive(Default)]
pub struct SubrepoRegistry {
    inner: Mutex<HashMap<String, Subrepo>>,
}

impl SubrepoRegistry {
    pub fn new() -> SubrepoRegistry {
        SubrepoRegistry::default()
    }

    /// Registers `subrepo`. A name collision is only an error if the
    /// two definitions are not deep-equal; re-declaring the same
    /// subrepo (e.g. two packages both depending on it) is a no-op.
    pub fn add(&self, subrepo: Subrepo) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.get(&subrepo.name) {
            Some(existing) if *existing == subrepo => Ok(()),
            Some(_) => Err(CoreError::ParseError {
                text: subrepo.name.clone(),
                reason: "multiple conflicting definitions of this subrepo".to_string(),
            }),
            None => {
                inner.insert(subrepo.name.clone(), subrepo);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Subrepo> {
        self.inner.lock().unwrap().get(name).cloned()
    }
}
