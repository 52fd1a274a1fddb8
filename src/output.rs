//! Layout of the `plz-out/` output tree and the inter-process repo
//! lock (`spec.md` §4.7).

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use log::info;

use crate::error::CoreError;
use crate::label::BuildLabel;

const CACHEDIR_TAG_CONTENTS: &str = "Signature: 8a477f597d28d172789f06886806bc55\n\
     # This file is a cache directory tag created by please-core.\n\
     # For information about cache directory tags see https://bford.info/cachedir/\n";

/// Root-relative layout of `plz-out/…`, parameterised on the repo
/// root so tests can point it at a temp directory.
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(repo_root: impl Into<PathBuf>) -> OutputLayout {
        OutputLayout {
            root: repo_root.into().join("plz-out"),
        }
    }

    pub fn plz_out(&self) -> &Path {
        &self.root
    }

    fn subrepo_component(subrepo: &str) -> PathBuf {
        if subrepo.is_empty() {
            PathBuf::new()
        } else {
            PathBuf::from(subrepo)
        }
    }

    /// `plz-out/tmp/<subrepo?>/<pkg>/<name>._build/`
    pub fn build_tmp_dir(&self, label: &BuildLabel) -> PathBuf {
        self.root
            .join("tmp")
            .join(Self::subrepo_component(label.subrepo()))
            .join(label.package_name())
            .join(format!("{}._build", label.name()))
    }

    /// `plz-out/tmp/<subrepo?>/<pkg>/<name>._test/run_N/`
    pub fn test_tmp_dir(&self, label: &BuildLabel, run: u32) -> PathBuf {
        self.root
            .join("tmp")
            .join(Self::subrepo_component(label.subrepo()))
            .join(label.package_name())
            .join(format!("{}._test", label.name()))
            .join(format!("run_{run}"))
    }

    /// `plz-out/gen/<subrepo?>/<pkg>/` — non-binary outputs.
    pub fn gen_dir(&self, subrepo: &str, package_name: &str) -> PathBuf {
        self.root
            .join("gen")
            .join(Self::subrepo_component(subrepo))
            .join(package_name)
    }

    /// `plz-out/bin/<subrepo?>/<pkg>/` — binary outputs.
    pub fn bin_dir(&self, subrepo: &str, package_name: &str) -> PathBuf {
        self.root
            .join("bin")
            .join(Self::subrepo_component(subrepo))
            .join(package_name)
    }

    /// The directory a target's default outputs are published under,
    /// selected by whether the target is a binary.
    pub fn out_dir(&self, label: &BuildLabel, is_binary: bool) -> PathBuf {
        if is_binary {
            self.bin_dir(label.subrepo(), label.package_name())
        } else {
            self.gen_dir(label.subrepo(), label.package_name())
        }
    }

    /// `plz-out/exec/<subrepo?>/<pkg>/<name>/` — `run` sandbox.
    pub fn exec_dir(&self, label: &BuildLabel) -> PathBuf {
        self.root
            .join("exec")
            .join(Self::subrepo_component(label.subrepo()))
            .join(label.package_name())
            .join(label.name())
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(".lock")
    }

    pub fn cachedir_tag_path(&self) -> PathBuf {
        self.root.join("CACHEDIR.TAG")
    }

    /// File mode for a published output: binary targets get 0555,
    /// everything else 0444.
    #[cfg(unix)]
    pub fn output_mode(is_binary: bool) -> u32 {
        if is_binary {
            0o555
        } else {
            0o444
        }
    }

    pub fn write_cachedir_tag(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.root)?;
        let path = self.cachedir_tag_path();
        if path.exists() {
            return Ok(());
        }
        fs::write(path, CACHEDIR_TAG_CONTENTS)
    }
}

/// An advisory lock on `plz-out/.lock`, shared or exclusive.
///
/// Grounded on the `fs2::FileExt` + PID-in-lock-file idiom used for
/// workspace locking elsewhere in the corpus: the lock file is opened
/// once, truncated and stamped with the holder's PID on acquisition,
/// and the same descriptor is reused to upgrade/downgrade within one
/// process.
pub struct RepoLock {
    file: File,
    path: PathBuf,
}

impl RepoLock {
    pub fn open(layout: &OutputLayout) -> Result<RepoLock, CoreError> {
        let path = layout.lock_path();
        fs::create_dir_all(&layout.root)?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        Ok(RepoLock { file, path })
    }

    fn holder_pid(&self) -> Option<u32> {
        fs::read_to_string(&self.path)
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    pub fn acquire_shared(&mut self) -> Result<(), CoreError> {
        if self.file.try_lock_shared().is_err() {
            if let Some(pid) = self.holder_pid() {
                info!("plz-out/.lock held by pid {pid}, waiting for a shared lock");
            }
            self.file
                .lock_shared()
                .map_err(|e| CoreError::LockAcquireError(e.to_string()))?;
        }
        Ok(())
    }

    pub fn acquire_exclusive(&mut self) -> Result<(), CoreError> {
        if self.file.try_lock_exclusive().is_err() {
            if let Some(pid) = self.holder_pid() {
                info!("plz-out/.lock held by pid {pid}, waiting for an exclusive lock");
            }
            self.file
                .lock_exclusive()
                .map_err(|e| CoreError::LockAcquireError(e.to_string()))?;
        }
        self.stamp_pid()?;
        Ok(())
    }

    fn stamp_pid(&mut self) -> std::io::Result<()> {
        self.file.set_len(0)?;
        use std::io::Seek;
        self.file.seek(std::io::SeekFrom::Start(0))?;
        write!(self.file, "{}", std::process::id())?;
        self.file.flush()
    }

    pub fn release(&mut self) -> std::io::Result<()> {
        fs2::FileExt::unlock(&self.file)
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_follow_convention() {
        let layout = OutputLayout::new("/repo");
        let label = BuildLabel::must_parse("//pkg/sub:name");
        assert_eq!(
            layout.build_tmp_dir(&label),
            PathBuf::from("/repo/plz-out/tmp/pkg/sub/name._build")
        );
        assert_eq!(
            layout.test_tmp_dir(&label, 3),
            PathBuf::from("/repo/plz-out/tmp/pkg/sub/name._test/run_3")
        );
        assert_eq!(
            layout.out_dir(&label, false),
            PathBuf::from("/repo/plz-out/gen/pkg/sub")
        );
        assert_eq!(
            layout.out_dir(&label, true),
            PathBuf::from("/repo/plz-out/bin/pkg/sub")
        );
    }

    #[test]
    fn subrepo_prefixes_path() {
        let layout = OutputLayout::new("/repo");
        let label = BuildLabel::must_parse("@sub//pkg:name");
        assert_eq!(
            layout.out_dir(&label, false),
            PathBuf::from("/repo/plz-out/gen/sub/pkg")
        );
    }

    #[test]
    fn lock_upgrades_within_one_process() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path());
        let mut lock = RepoLock::open(&layout).unwrap();
        lock.acquire_shared().unwrap();
        lock.release().unwrap();
        lock.acquire_exclusive().unwrap();
        let pid = fs::read_to_string(layout.lock_path()).unwrap();
        assert_eq!(pid, std::process::id().to_string());
    }

    #[test]
    fn writes_cachedir_tag_once() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path());
        layout.write_cachedir_tag().unwrap();
        layout.write_cachedir_tag().unwrap();
        let contents = fs::read_to_string(layout.cachedir_tag_path()).unwrap();
        assert!(contents.starts_with("Signature: 8a477f597d28d172789f06886806bc55"));
    }
}
