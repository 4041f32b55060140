//! Installing UID/GID mappings into a freshly created user namespace.

use std::ffi::{OsStr, OsString};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, span, warn, Level};

use crate::error::{Error, Result};
use crate::id_map::{IdMap, IdMappings};

/// How one axis (UIDs or GIDs) ended up mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingMethod {
    /// The setuid helper mapped the full set of ranges.
    Helper,
    /// Only the caller's own ID was mapped, by writing the map file directly.
    SingleIdentity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallReport {
    pub uid: MappingMethod,
    pub gid: MappingMethod,
}

/// Writes UID/GID maps for a child in a new user namespace, preferring `newuidmap` and
/// `newgidmap`, and falling back to mapping just the caller's own IDs.
#[derive(Debug, Clone)]
pub struct MappingInstaller {
    proc_root: PathBuf,
    newuidmap: OsString,
    newgidmap: OsString,
    search_path: Option<OsString>,
}

impl Default for MappingInstaller {
    fn default() -> Self {
        Self::new()
    }
}

impl MappingInstaller {
    pub fn new() -> MappingInstaller {
        MappingInstaller {
            proc_root: PathBuf::from("/proc"),
            newuidmap: "newuidmap".into(),
            newgidmap: "newgidmap".into(),
            search_path: std::env::var_os("PATH"),
        }
    }

    /// Where to find `PID/uid_map` and friends. By default, `/proc`.
    pub fn proc_root(&mut self, path: impl Into<PathBuf>) -> &mut MappingInstaller {
        self.proc_root = path.into();
        self
    }

    /// Override the helper programs. Bare names are looked up on the search path.
    pub fn helpers(
        &mut self,
        newuidmap: impl Into<OsString>,
        newgidmap: impl Into<OsString>,
    ) -> &mut MappingInstaller {
        self.newuidmap = newuidmap.into();
        self.newgidmap = newgidmap.into();
        self
    }

    /// Override the directories searched for helpers. By default, `PATH`.
    pub fn search_path(&mut self, path: Option<OsString>) -> &mut MappingInstaller {
        self.search_path = path;
        self
    }

    /// Map `host_uid`/`host_gid` to root in the user namespace of `pid`, along with any ranges
    /// in `mappings`.
    ///
    /// This must happen before `pid` is allowed to run, and can only happen once per namespace.
    pub fn install(
        &self,
        pid: libc::pid_t,
        host_uid: u32,
        host_gid: u32,
        mappings: &IdMappings,
    ) -> Result<InstallReport> {
        let span = span!(Level::DEBUG, "install", pid);
        let _span_guard = span.enter();

        let uid = if self.try_helper(&self.newuidmap, pid, host_uid, &mappings.uids) {
            MappingMethod::Helper
        } else {
            // The kernel only lets us write a gid_map once setgroups(2) is denied.
            self.write_control_file(pid, "setgroups", "deny\n")?;
            self.write_control_file(
                pid,
                "uid_map",
                &IdMap::single(host_uid).into_idmap_file_contents(),
            )?;
            MappingMethod::SingleIdentity
        };

        let gid = if self.try_helper(&self.newgidmap, pid, host_gid, &mappings.gids) {
            MappingMethod::Helper
        } else {
            self.write_control_file(
                pid,
                "gid_map",
                &IdMap::single(host_gid).into_idmap_file_contents(),
            )?;
            MappingMethod::SingleIdentity
        };

        debug!(?uid, ?gid, "installed mappings");
        Ok(InstallReport { uid, gid })
    }

    /// Run a mapping helper, returning whether it mapped the ranges. Never an error: a missing
    /// or failing helper just means we fall back.
    fn try_helper(&self, tool: &OsStr, pid: libc::pid_t, host_id: u32, ranges: &IdMap) -> bool {
        if ranges.is_empty() {
            return false;
        }
        let Some(path) = self.find_helper(tool) else {
            debug!(?tool, "helper not found");
            return false;
        };

        let output = Command::new(&path)
            .args(helper_args(pid, host_id, ranges))
            .stdin(Stdio::null())
            .output();
        match output {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!(?path, status = %output.status, stderr = %stderr.trim(), "helper failed");
                false
            }
            Err(err) => {
                warn!(?path, %err, "cannot run helper");
                false
            }
        }
    }

    fn find_helper(&self, tool: &OsStr) -> Option<PathBuf> {
        let tool = Path::new(tool);
        if tool.components().count() > 1 {
            return is_executable(tool).then(|| tool.to_owned());
        }
        let search_path = self.search_path.as_ref()?;
        std::env::split_paths(search_path)
            .map(|dir| dir.join(tool))
            .find(|candidate| is_executable(candidate))
    }

    fn write_control_file(&self, pid: libc::pid_t, name: &str, contents: &str) -> Result<()> {
        let path = self.proc_root.join(pid.to_string()).join(name);
        debug!(?path, contents = contents.trim_end(), "writing");
        std::fs::write(&path, contents).map_err(|source| Error::MappingWrite { path, source })
    }
}

/// Arguments to `newuidmap`/`newgidmap`: the target pid followed by flattened triplets.
pub fn helper_args(pid: libc::pid_t, host_id: u32, ranges: &IdMap) -> Vec<String> {
    let mut args = vec![pid.to_string()];
    for triplet in ranges.helper_triplets(host_id) {
        args.push(triplet.container_id.to_string());
        args.push(triplet.host_id.to_string());
        args.push(triplet.size.to_string());
    }
    args
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
