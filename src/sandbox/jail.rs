//! Jail construction for one child process.
//!
//! The jail replicates two template trees by hardlinking (copying when the
//! link is refused), creates the random-device nodes, and is entered with
//! chroot before any document-engine initialization. Cleanup on child exit
//! is left to external tooling.

use crate::config::types::{ChildId, GatewayError, Result};
use crate::config::GatewayConfig;
use filetime::FileTime;
use log::{error, info, warn};
use nix::unistd::{chdir, chroot};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Builds `child_root/<ChildId>/` for one child.
pub struct JailBuilder<'a> {
    config: &'a GatewayConfig,
    child_id: ChildId,
}

impl<'a> JailBuilder<'a> {
    pub fn new(config: &'a GatewayConfig, child_id: ChildId) -> Self {
        Self { config, child_id }
    }

    pub fn jail_path(&self) -> PathBuf {
        self.config.child_root.join(self.child_id.to_string())
    }

    /// Materialize the jail: replicate the system template into the root and
    /// the engine template under the configured subpath, then create the
    /// device nodes.
    pub fn build(&self) -> Result<PathBuf> {
        let jail = self.jail_path();
        let engine_dir = jail.join(&self.config.lo_subpath);
        fs::create_dir_all(&engine_dir)?;

        info!(
            "building jail {} from {} and {}",
            jail.display(),
            self.config.sys_template.display(),
            self.config.lo_template.display()
        );
        replicate_tree(&self.config.sys_template, &jail)?;
        replicate_tree(&self.config.lo_template, &engine_dir)?;
        create_device_nodes(&jail);
        Ok(jail)
    }
}

/// Enter the jail: chroot then move to its root.
pub fn enter(jail: &Path) -> Result<()> {
    info!("chroot(\"{}\")", jail.display());
    chroot(jail)
        .map_err(|e| GatewayError::Jail(format!("chroot(\"{}\") failed: {e}", jail.display())))?;
    chdir("/").map_err(|e| GatewayError::Jail(format!("chdir(\"/\") in jail failed: {e}")))?;
    Ok(())
}

/// Source and destination roots threaded through the tree walk explicitly.
struct TreeReplicator<'a> {
    source: &'a Path,
    destination: &'a Path,
}

/// Replicate `source` into `destination`, hardlinking files with a copy
/// fallback. The walk is depth-first post-order so directory timestamps can
/// be restored after their contents are populated.
pub fn replicate_tree(source: &Path, destination: &Path) -> Result<()> {
    let replicator = TreeReplicator {
        source,
        destination,
    };
    for entry in WalkDir::new(source).follow_links(true).contents_first(true) {
        match entry {
            Ok(entry) => replicator.replicate_entry(&entry)?,
            Err(err) => {
                // A symlink whose target is missing: note it and move on.
                if let Some(path) = err.path() {
                    let dangling = fs::symlink_metadata(path)
                        .map(|meta| meta.file_type().is_symlink())
                        .unwrap_or(false);
                    if dangling {
                        info!(
                            "symlink to nonexistent target: {}, ignored",
                            path.display()
                        );
                        continue;
                    }
                }
                return Err(GatewayError::Jail(format!(
                    "cannot read template tree under {}: {err}",
                    source.display()
                )));
            }
        }
    }
    Ok(())
}

impl TreeReplicator<'_> {
    fn replicate_entry(&self, entry: &DirEntry) -> Result<()> {
        let relative = entry.path().strip_prefix(self.source).map_err(|_| {
            GatewayError::Jail(format!(
                "walked outside the template tree: {}",
                entry.path().display()
            ))
        })?;
        if relative.as_os_str().is_empty() {
            return Ok(()); // the template root itself
        }
        #[cfg(target_os = "macos")]
        if relative == Path::new("PkgInfo") {
            return Ok(());
        }

        let target = self.destination.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
            let metadata = entry.metadata().map_err(|e| {
                GatewayError::Jail(format!("stat failed for {}: {e}", entry.path().display()))
            })?;
            let atime = FileTime::from_last_access_time(&metadata);
            let mtime = FileTime::from_last_modification_time(&metadata);
            filetime::set_file_times(&target, atime, mtime).map_err(|e| {
                GatewayError::Jail(format!(
                    "restoring times on {} failed: {e}",
                    target.display()
                ))
            })?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            link_or_copy_file(entry.path(), &target)?;
        }
        Ok(())
    }
}

/// Hardlink `source` to `target`; fall back to a byte copy when the link is
/// refused (different filesystem, existing target, permissions).
pub fn link_or_copy_file(source: &Path, target: &Path) -> Result<()> {
    match fs::hard_link(source, target) {
        Ok(()) => Ok(()),
        Err(err) => {
            warn!(
                "link(\"{}\", \"{}\") failed: {err}, copying instead",
                source.display(),
                target.display()
            );
            fs::copy(source, target).map(|_| ()).map_err(|e| {
                GatewayError::Jail(format!(
                    "copy(\"{}\", \"{}\") failed: {e}",
                    source.display(),
                    target.display()
                ))
            })
        }
    }
}

/// Create `/dev/random` and `/dev/urandom` inside the jail. Failures are
/// logged and non-fatal; the engine degrades without them.
#[cfg(target_os = "linux")]
fn create_device_nodes(jail: &Path) {
    use nix::sys::stat::{makedev, mknod, Mode, SFlag};

    let dev = jail.join("dev");
    if let Err(err) = fs::create_dir_all(&dev) {
        error!("mkdir({}) failed: {err}", dev.display());
        return;
    }
    for (name, minor) in [("random", 8), ("urandom", 9)] {
        let node = dev.join(name);
        if let Err(err) = mknod(
            &node,
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(0o666),
            makedev(1, minor),
        ) {
            error!("mknod({}) failed: {err}", node.display());
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn create_device_nodes(_jail: &Path) {}
