//! The boundary between the orchestrator and the process that actually lives in the new user
//! namespace.

use alloc_counter::no_alloc;
use c_str_macro::c_str;
use std::ffi::{c_char, c_int, c_void, CString};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::os::unix::ffi::OsStringExt;
use std::ptr;

use tracing::debug;

use crate::libc_util::*;
use crate::state::{CONFIGURED_ENV, ROOTLESS_UID_ENV};

/// Size of the stack for cloned children.
const STACK_SIZE: usize = 1024 * 1024; // 1 MB

/// Creates and reaps the single child that runs inside the new user namespace.
///
/// Implementations must not be called concurrently for the same pid.
pub trait Launcher: Sync {
    /// Create a child in a new user namespace. The child must not do anything that needs its
    /// IDs mapped until it has read one byte from `ready`.
    ///
    /// `parent_end` is the write end of the same pipe. The child must not keep a copy of it, so
    /// that it reads EOF from `ready` if the parent closes the pipe without writing.
    fn create_in_user_namespace(
        &self,
        ready: BorrowedFd<'_>,
        parent_end: BorrowedFd<'_>,
    ) -> io::Result<libc::pid_t>;

    /// Block until the child exits, returning its exit code, or 128 plus the signal that killed
    /// it.
    fn wait_in_user_namespace(&self, pid: libc::pid_t) -> io::Result<c_int>;

    /// Deliver a signal to the child.
    fn signal(&self, pid: libc::pid_t, sig: c_int) -> io::Result<()> {
        let 0 = (unsafe { libc::kill(pid, sig) }) else {
            return Err(io::Error::last_os_error());
        };
        Ok(())
    }
}

/// Re-executes the current program, with its original arguments, as root in a new user
/// namespace.
///
/// The child's environment carries the `init` marker, so the re-executed program knows it has
/// already arrived.
#[derive(Debug, Default)]
pub struct CloneLauncher {
    _private: (),
}

impl CloneLauncher {
    pub fn new() -> CloneLauncher {
        CloneLauncher { _private: () }
    }
}

impl Launcher for CloneLauncher {
    fn create_in_user_namespace(
        &self,
        ready: BorrowedFd<'_>,
        parent_end: BorrowedFd<'_>,
    ) -> io::Result<libc::pid_t> {
        // Everything the child touches is prepared here, since it cannot allocate.
        let cmdline = std::fs::read("/proc/self/cmdline")?;
        let args_buf: Vec<CString> = cmdline
            .strip_suffix(b"\0")
            .unwrap_or(&cmdline)
            .split(|b| *b == 0)
            .map(|arg| CString::new(arg).map_err(invalid_input))
            .collect::<io::Result<_>>()?;
        let mut args: Vec<*const c_char> = args_buf.iter().map(|a| a.as_ptr()).collect();
        args.push(ptr::null());

        let uid = unsafe { libc::getuid() };
        let envp_buf: Vec<CString> = std::env::vars_os()
            .filter(|(k, _)| k != CONFIGURED_ENV && k != ROOTLESS_UID_ENV)
            .map(|(k, v)| {
                let mut kv = k.into_vec();
                kv.push(b'=');
                kv.extend(v.into_vec());
                CString::new(kv).map_err(invalid_input)
            })
            .chain([
                CString::new(format!("{CONFIGURED_ENV}=init")).map_err(invalid_input),
                CString::new(format!("{ROOTLESS_UID_ENV}={uid}")).map_err(invalid_input),
            ])
            .collect::<io::Result<_>>()?;
        let mut envp: Vec<*const c_char> = envp_buf.iter().map(|e| e.as_ptr()).collect();
        envp.push(ptr::null());

        let mut stack = vec![0u8; STACK_SIZE];
        let stack_ptr = unsafe { get_topmost_stack_pointer(stack.as_mut()) };

        let mut child_arg = ChildArg {
            ready_fd: ready.as_raw_fd(),
            parent_end_fd: parent_end.as_raw_fd(),
            exe: c_str!("/proc/self/exe").as_ptr(),
            args: args.as_ptr(),
            envp: envp.as_ptr(),
        };

        // NOTE: You MUST set `SIGCHLD` in order for `waitpid()` after `clone()` to work properly.
        let clone_flags = libc::CLONE_NEWUSER | libc::SIGCHLD;

        let pid @ 0.. = (unsafe {
            libc::clone(
                child_extern,
                stack_ptr,
                clone_flags,
                &mut child_arg as *mut ChildArg as *mut c_void,
            )
        }) else {
            return Err(io::Error::last_os_error());
        };
        debug!(%pid, "cloned into new user namespace");

        Ok(pid)
    }

    fn wait_in_user_namespace(&self, pid: libc::pid_t) -> io::Result<c_int> {
        let status = waitpid(pid)?;
        debug!(%pid, ?status, "re-executed child exited");
        Ok(status.code())
    }
}

fn invalid_input(err: std::ffi::NulError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, err)
}

struct ChildArg {
    ready_fd: c_int,
    parent_end_fd: c_int,
    exe: *const c_char,
    args: *const *const c_char,
    envp: *const *const c_char,
}

#[cfg_attr(debug_assertions, no_alloc)]
extern "C" fn child_extern(arg: *mut c_void) -> c_int {
    let arg: &ChildArg = unsafe { &*(arg as *const ChildArg) };

    // Catch any panics.
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| unsafe {
        child_entrypoint(arg)
    })) {
        Ok(Ok(())) => 0,
        Ok(Err(_)) => 1,
        Err(_) => 126,
    }
}

/// Handler for the clone.
/// - Runs inside the new user namespace, with a copy of the parent's memory.
#[cfg_attr(debug_assertions, no_alloc)]
unsafe fn child_entrypoint(arg: &ChildArg) -> io::Result<()> {
    // Our copy of the write end would keep the pipe open forever.
    libc::close(arg.parent_end_fd);

    // Wait for the parent to write our uid_map and gid_map.
    fd_recv::<u8>(arg.ready_fd)?;

    let 0 = libc::setresgid(0, 0, 0) else {
        return Err(io::Error::last_os_error());
    };
    let 0 = libc::setresuid(0, 0, 0) else {
        return Err(io::Error::last_os_error());
    };

    libc::execve(arg.exe, arg.args, arg.envp);
    Err(io::Error::last_os_error())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;
    use std::time::{Duration, Instant};

    struct KillOnly;

    impl Launcher for KillOnly {
        fn create_in_user_namespace(
            &self,
            _ready: BorrowedFd<'_>,
            _parent_end: BorrowedFd<'_>,
        ) -> io::Result<libc::pid_t> {
            unimplemented!()
        }

        fn wait_in_user_namespace(&self, _pid: libc::pid_t) -> io::Result<c_int> {
            unimplemented!()
        }
    }

    #[test]
    fn default_signal_uses_kill() {
        let child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id() as libc::pid_t;

        KillOnly.signal(pid, libc::SIGTERM).unwrap();

        let status = waitpid(pid).unwrap();
        assert_eq!(status, ExitStatus::Signal(libc::SIGTERM));
        assert_eq!(status.code(), 128 + libc::SIGTERM);
    }

    /// Poll for `pid` to exit, for up to `timeout`.
    fn wait_with_timeout(pid: libc::pid_t, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let mut status: c_int = 0;
            let reaped = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
            if reaped == pid {
                return Some(ExitStatus::from_wait_status(status).unwrap());
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        None
    }

    #[test]
    fn cloned_child_sees_eof_when_pipe_closed_unreleased() {
        let (ready, parent_end) = pipe(libc::O_CLOEXEC).unwrap();

        let pid = match CloneLauncher::new()
            .create_in_user_namespace(ready.as_fd(), parent_end.as_fd())
        {
            Ok(pid) => pid,
            Err(err) if err.raw_os_error() == Some(libc::EPERM) => {
                eprintln!("unprivileged user namespaces unavailable, skipping: {err}");
                return;
            }
            Err(err) => panic!("clone failed: {err}"),
        };
        drop(ready);
        drop(parent_end);

        let status = wait_with_timeout(pid, Duration::from_secs(5));
        if status.is_none() {
            unsafe { libc::kill(pid, libc::SIGKILL) };
            waitpid(pid).unwrap();
        }
        // The child gives up on EOF without ever exec'ing.
        assert_eq!(status, Some(ExitStatus::Code(1)));
    }
}
