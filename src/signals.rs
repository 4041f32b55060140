//! Forwarding the signals we receive to the child in the user namespace.

use std::ffi::{c_int, c_void};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::libc_util::{fd_send, pipe};

/// Write end of the self-pipe the signal handler reports to, or -1 when nobody is listening.
static RELAY_FD: AtomicI32 = AtomicI32::new(-1);

/// Signal dispositions are process-wide, so only one proxy may exist at a time.
static PROXY_LOCK: Mutex<()> = Mutex::new(());

/// Catches every catchable signal sent to this process while it exists, so they can be passed
/// on to a child with [`SignalProxy::forward`].
///
/// Dropping the proxy restores the signal dispositions it replaced.
pub struct SignalProxy {
    previous: Vec<(c_int, libc::sigaction)>,
    signal_rx: OwnedFd,
    signal_tx: OwnedFd,
    stop_rx: OwnedFd,
    stop_tx: OwnedFd,
    _lock: MutexGuard<'static, ()>,
}

impl SignalProxy {
    /// Start catching signals.
    pub fn install() -> io::Result<SignalProxy> {
        let lock = PROXY_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        // The handler must never block, so the write end is non-blocking.
        let (signal_rx, signal_tx) = pipe(libc::O_CLOEXEC | libc::O_NONBLOCK)?;
        let (stop_rx, stop_tx) = pipe(libc::O_CLOEXEC)?;

        let mut proxy = SignalProxy {
            previous: Vec::new(),
            signal_rx,
            signal_tx,
            stop_rx,
            stop_tx,
            _lock: lock,
        };
        RELAY_FD.store(proxy.signal_tx.as_raw_fd(), Ordering::SeqCst);

        for sig in catchable_signals() {
            let mut action: libc::sigaction = unsafe { mem::zeroed() };
            action.sa_sigaction = relay_signal as extern "C" fn(c_int) as libc::sighandler_t;
            action.sa_flags = libc::SA_RESTART;
            unsafe { libc::sigemptyset(&mut action.sa_mask) };

            let mut previous: libc::sigaction = unsafe { mem::zeroed() };
            let 0 = (unsafe { libc::sigaction(sig, &action, &mut previous) }) else {
                // Dropping the proxy puts back whatever we've replaced so far.
                return Err(io::Error::last_os_error());
            };
            proxy.previous.push((sig, previous));
        }
        debug!(count = proxy.previous.len(), "catching signals");

        Ok(proxy)
    }

    /// Call `deliver` once for every signal caught, until [`SignalProxy::shutdown`] is called.
    ///
    /// `SIGCHLD` and `SIGPIPE` are concerns of this process alone, and are never delivered.
    pub fn forward(&self, mut deliver: impl FnMut(c_int)) {
        let mut buf = [0u8; 64];
        loop {
            let mut fds = [
                libc::pollfd {
                    fd: self.signal_rx.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: self.stop_rx.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];
            let 0.. = (unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) })
            else {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(%err, "signal forwarding stopped");
                return;
            };

            if fds[1].revents != 0 {
                return;
            }
            if fds[0].revents & libc::POLLIN == 0 {
                continue;
            }

            let n = unsafe {
                libc::read(
                    self.signal_rx.as_raw_fd(),
                    buf.as_mut_ptr() as *mut c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                continue;
            }
            for &sig in &buf[..n as usize] {
                let sig = c_int::from(sig);
                if sig == libc::SIGCHLD || sig == libc::SIGPIPE {
                    continue;
                }
                deliver(sig);
            }
        }
    }

    /// Make [`SignalProxy::forward`] return.
    pub fn shutdown(&self) {
        if let Err(err) = unsafe { fd_send::<u8>(self.stop_tx.as_raw_fd(), 0) } {
            warn!(%err, "failed to stop signal forwarding");
        }
    }
}

impl Drop for SignalProxy {
    fn drop(&mut self) {
        RELAY_FD.store(-1, Ordering::SeqCst);
        for (sig, previous) in self.previous.drain(..).rev() {
            unsafe { libc::sigaction(sig, &previous, std::ptr::null_mut()) };
        }
    }
}

/// Every signal a handler can be installed for, minus the ones raised synchronously by faults
/// in this process, which must keep their default behavior.
fn catchable_signals() -> impl Iterator<Item = c_int> {
    const UNCATCHABLE: [c_int; 8] = [
        libc::SIGKILL,
        libc::SIGSTOP,
        libc::SIGSEGV,
        libc::SIGBUS,
        libc::SIGILL,
        libc::SIGFPE,
        libc::SIGTRAP,
        libc::SIGSYS,
    ];
    (1..32)
        .filter(|sig| !UNCATCHABLE.contains(sig))
        .chain(libc::SIGRTMIN()..=libc::SIGRTMAX())
}

/// Async-signal-safe: report the signal number down the self-pipe.
extern "C" fn relay_signal(sig: c_int) {
    let fd = RELAY_FD.load(Ordering::SeqCst);
    if fd < 0 {
        return;
    }
    unsafe {
        let saved_errno = *libc::__errno_location();
        let byte = sig as u8;
        libc::write(fd, &byte as *const u8 as *const c_void, 1);
        *libc::__errno_location() = saved_errno;
    }
}
