//! Finding which of our child user namespaces a process descends from.
//!
//! Each container gets a user namespace of its own, created as a child of ours. Processes in the
//! container may have created further user namespaces below that one, so the namespace read
//! from a container process's pid can sit several levels down:
//!
//! ```text
//!                       current ns
//!                        /      \
//!          wanted ->    a    [other containers]
//!                      /
//!                     b
//!                    /
//!    read from pid ->  c
//! ```

use std::ffi::c_ulong;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use tracing::{debug, span, Level};

use crate::error::{Error, Result};

/// `ioctl(2)` request returning a descriptor for the parent of a user namespace.
const NS_GET_PARENT: c_ulong = 0xb702;

/// The kernel limits user namespace nesting to 32 levels.
const MAX_DEPTH: usize = 32;

/// An open user namespace, along with its identity (e.g. `user:[4026531837]`).
///
/// The descriptor stays open across `exec(2)`, so it can be handed to a program that joins
/// the namespace. It is closed on drop.
#[derive(Debug)]
pub struct NamespaceHandle {
    fd: OwnedFd,
    identity: String,
}

impl NamespaceHandle {
    pub fn identity(&self) -> &str {
        &self.identity
    }
}

impl AsFd for NamespaceHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for NamespaceHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl IntoRawFd for NamespaceHandle {
    fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }
}

impl From<NamespaceHandle> for OwnedFd {
    fn from(handle: NamespaceHandle) -> OwnedFd {
        handle.fd
    }
}

/// Access to user namespaces and their ancestry.
///
/// Handles are owned: dropping one releases whatever it refers to.
pub trait NamespaceSource {
    type Handle;

    /// Identity of the caller's own user namespace.
    fn current(&self) -> io::Result<String>;

    /// Open the user namespace of `pid`.
    fn open(&self, pid: libc::pid_t) -> io::Result<Self::Handle>;

    fn identity(&self, ns: &Self::Handle) -> io::Result<String>;

    /// Open the parent of `ns`.
    fn parent(&self, ns: &Self::Handle) -> io::Result<Self::Handle>;

    /// Make `ns` survive `exec(2)`.
    fn inherit(&self, ns: &Self::Handle) -> io::Result<()>;
}

/// User namespaces as the kernel exposes them under `/proc`.
#[derive(Debug, Clone)]
pub struct ProcNamespaces {
    proc_root: PathBuf,
}

impl Default for ProcNamespaces {
    fn default() -> Self {
        ProcNamespaces {
            proc_root: PathBuf::from("/proc"),
        }
    }
}

impl NamespaceSource for ProcNamespaces {
    type Handle = OwnedFd;

    fn current(&self) -> io::Result<String> {
        link_target(self.proc_root.join("self/ns/user"))
    }

    fn open(&self, pid: libc::pid_t) -> io::Result<OwnedFd> {
        let path = self.proc_root.join(pid.to_string()).join("ns/user");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)?;
        Ok(file.into())
    }

    fn identity(&self, ns: &OwnedFd) -> io::Result<String> {
        link_target(self.proc_root.join(format!("self/fd/{}", ns.as_raw_fd())))
    }

    fn parent(&self, ns: &OwnedFd) -> io::Result<OwnedFd> {
        let fd @ 0.. = (unsafe { libc::ioctl(ns.as_raw_fd(), NS_GET_PARENT as _) }) else {
            return Err(io::Error::last_os_error());
        };
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn inherit(&self, ns: &OwnedFd) -> io::Result<()> {
        let 0.. = (unsafe { libc::fcntl(ns.as_raw_fd(), libc::F_SETFD, 0) }) else {
            return Err(io::Error::last_os_error());
        };
        Ok(())
    }
}

fn link_target(path: PathBuf) -> io::Result<String> {
    let target = std::fs::read_link(path)?;
    Ok(target.to_string_lossy().into_owned())
}

/// Find the user namespace that is a direct child of ours and an ancestor of (or equal to) the
/// user namespace of `pid`.
///
/// The returned descriptor is not close-on-exec.
pub fn find_child_namespace(pid: libc::pid_t) -> Result<NamespaceHandle> {
    let (fd, identity) = find_child_namespace_in(&ProcNamespaces::default(), pid)?;
    Ok(NamespaceHandle { fd, identity })
}

/// [`find_child_namespace`] against any [`NamespaceSource`], returning the handle and its
/// identity.
///
/// Only one handle is held at a time besides the one being examined; each is dropped as soon as
/// we step past it, whichever way we return.
pub fn find_child_namespace_in<S: NamespaceSource>(
    source: &S,
    pid: libc::pid_t,
) -> Result<(S::Handle, String)> {
    let span = span!(Level::DEBUG, "find_child_namespace", pid);
    let _span_guard = span.enter();

    let current = source
        .current()
        .map_err(Error::walk("cannot read current user namespace"))?;

    let mut held = source
        .open(pid)
        .map_err(Error::walk("cannot open user namespace of process"))?;
    let mut held_identity = source
        .identity(&held)
        .map_err(Error::walk("cannot read user namespace"))?;
    if held_identity == current {
        return Err(Error::SameNamespace { pid });
    }

    for _ in 0..MAX_DEPTH {
        let parent = source
            .parent(&held)
            .map_err(Error::walk("cannot get parent user namespace"))?;
        let parent_identity = source
            .identity(&parent)
            .map_err(Error::walk("cannot read user namespace"))?;

        if parent_identity == current {
            drop(parent);
            source
                .inherit(&held)
                .map_err(Error::walk("cannot clear close-on-exec"))?;
            debug!(identity = %held_identity, "found child user namespace");
            return Ok((held, held_identity));
        }

        debug!(identity = %parent_identity, "stepping up");
        held = parent;
        held_identity = parent_identity;
    }

    Err(Error::AncestryWalk {
        context: "user namespaces nested too deeply",
        source: io::Error::from_raw_os_error(libc::ELOOP),
    })
}
