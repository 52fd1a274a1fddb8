//! The settings the scheduler and command expander consume.
//!
//! Reading a configuration *file* is out of scope (`spec.md` §1); this
//! struct is the shape those settings take once some out-of-scope
//! layer has parsed them.

use std::sync::atomic::{AtomicBool, Ordering};

/// Capability probes that can be silently downgraded at runtime (the
/// `CheckXattrsSupported`-style pattern named in `spec.md` §9). The
/// downgrade is sticky for the process lifetime; we do not re-probe.
#[derive(Debug, Default)]
pub struct Capabilities {
    hardlink_allowed: AtomicBool,
    hardlink_probed: AtomicBool,
}

impl Capabilities {
    pub fn new() -> Capabilities {
        Capabilities {
            hardlink_allowed: AtomicBool::new(true),
            hardlink_probed: AtomicBool::new(false),
        }
    }

    pub fn hardlink_allowed(&self) -> bool {
        self.hardlink_allowed.load(Ordering::Acquire)
    }

    /// Record a capability probe result. Once downgraded to `false`,
    /// later calls with `true` have no effect: downgrades are sticky.
    pub fn record_hardlink_probe(&self, supported: bool) {
        self.hardlink_probed.store(true, Ordering::Release);
        if !supported {
            self.hardlink_allowed.store(false, Ordering::Release);
        }
    }

    pub fn hardlink_probed(&self) -> bool {
        self.hardlink_probed.load(Ordering::Acquire)
    }
}

/// Read-only-after-initialisation settings (`spec.md` §6).
#[derive(Debug, Clone)]
pub struct Config {
    pub num_threads: usize,
    pub build_config: String,
    pub fallback_config: Option<String>,
    /// Search path for system tools (`BuildInput::SystemPathTool`).
    pub path: Vec<String>,
    pub lang: String,
    pub build_env: Vec<(String, String)>,
    pub xarch: String,
    pub xos: String,
    /// Package-path prefixes treated as "experimental" for
    /// `Target::can_see` (`spec.md` §4.2).
    pub experimental_dirs: Vec<String>,
}

impl Config {
    /// True iff `package` is at or below one of `experimental_dirs`.
    pub fn is_experimental(&self, package: &str) -> bool {
        self.experimental_dirs.iter().any(|dir| {
            package == dir || package.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
        })
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            num_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            build_config: "opt".to_string(),
            fallback_config: None,
            path: vec!["/usr/local/bin".to_string(), "/usr/bin".to_string(), "/bin".to_string()],
            lang: "en_GB.UTF-8".to_string(),
            build_env: Vec::new(),
            xarch: "x86_64".to_string(),
            xos: std::env::consts::OS.to_string(),
            experimental_dirs: Vec::new(),
        }
    }
}
