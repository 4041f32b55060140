//! Re-executing the current program as root in a new user namespace.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use tracing::{debug, span, warn, Level};

use crate::error::{Error, Result};
use crate::install::MappingInstaller;
use crate::launcher::{CloneLauncher, Launcher};
use crate::libc_util::{fd_send, pipe};
use crate::signals::SignalProxy;
use crate::state::{Configured, NamespaceState};
use crate::subid::{resolve_mappings, IdentityProvider, SubIdFiles};

/// Outcome of [`Reexec::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RexecResult {
    /// Whether a child was re-executed. If so, the caller should exit with `exit_code`.
    pub re_executed: bool,
    pub exit_code: i32,
}

impl RexecResult {
    const NOT_REEXECUTED: RexecResult = RexecResult {
        re_executed: false,
        exit_code: 0,
    };
}

/// One-shot channel telling the child its IDs are mapped.
pub struct SyncPipe {
    rx: OwnedFd,
    tx: OwnedFd,
}

impl SyncPipe {
    pub fn new() -> Result<SyncPipe> {
        let (rx, tx) = pipe(libc::O_CLOEXEC).map_err(Error::SyncPipe)?;
        Ok(SyncPipe { rx, tx })
    }

    /// The end the child reads from.
    pub fn ready_fd(&self) -> BorrowedFd<'_> {
        self.rx.as_fd()
    }

    /// The end we write to. The child must not hold on to it.
    pub fn parent_end(&self) -> BorrowedFd<'_> {
        self.tx.as_fd()
    }

    /// Let the child proceed, closing both ends.
    ///
    /// Our read end is closed first, so this fails if the child is no longer listening.
    pub fn release(self) -> Result<()> {
        let SyncPipe { rx, tx } = self;
        drop(rx);
        unsafe { fd_send::<u8>(tx.as_raw_fd(), b'1') }.map_err(Error::SyncPipe)
    }
}

/// Drives a child through creation, ID mapping, release and reaping, forwarding our signals to
/// it in the meantime.
pub struct Reexec<'a> {
    launcher: &'a dyn Launcher,
    identities: &'a dyn IdentityProvider,
    installer: MappingInstaller,
}

impl<'a> Reexec<'a> {
    pub fn new(launcher: &'a dyn Launcher, identities: &'a dyn IdentityProvider) -> Reexec<'a> {
        Reexec {
            launcher,
            identities,
            installer: MappingInstaller::new(),
        }
    }

    /// Replace the installer used to map IDs into the child's namespace.
    pub fn installer(&mut self, installer: MappingInstaller) -> &mut Reexec<'a> {
        self.installer = installer;
        self
    }

    /// Re-execute into a new user namespace, unless `state` says we're already there.
    ///
    /// If a child was re-executed, this returns only once it has exited.
    pub fn run(&self, state: &mut NamespaceState) -> Result<RexecResult> {
        if state.ids().uid == 0 || state.configured().is_some() {
            if state.configured() == Some(Configured::Init) {
                state.mark_configured();
            }
            return Ok(RexecResult::NOT_REEXECUTED);
        }

        let span = span!(Level::DEBUG, "reexec");
        let _span_guard = span.enter();

        let sync = SyncPipe::new()?;
        let pid = self
            .launcher
            .create_in_user_namespace(sync.ready_fd(), sync.parent_end())
            .map_err(Error::Create)?;
        debug!(%pid, "created child");

        // Until the pipe is released the child sits blocked; if we fail before then, it's ours
        // to clean up.
        let proxy = match self.map_ids(state, pid).and_then(|()| {
            SignalProxy::install().map_err(Error::Signals)
        }) {
            Ok(proxy) => proxy,
            Err(err) => {
                drop(sync);
                self.abandon(pid, &err);
                return Err(err);
            }
        };

        std::thread::scope(|s| {
            let proxy = &proxy;
            let launcher = self.launcher;
            let forwarder = s.spawn(move || {
                proxy.forward(|sig| {
                    debug!(%pid, sig, "forwarding signal");
                    if let Err(err) = launcher.signal(pid, sig) {
                        debug!(%pid, sig, %err, "cannot forward signal");
                    }
                })
            });

            let result = match sync.release() {
                Ok(()) => {
                    debug!("released child");
                    self.launcher
                        .wait_in_user_namespace(pid)
                        .map_err(Error::Wait)
                }
                Err(err) => {
                    self.abandon(pid, &err);
                    Err(err)
                }
            };

            proxy.shutdown();
            if forwarder.join().is_err() {
                warn!("signal forwarder panicked");
            }

            let exit_code = result?;
            debug!(exit_code, "child exited");
            Ok(RexecResult {
                re_executed: true,
                exit_code,
            })
        })
    }

    fn map_ids(&self, state: &NamespaceState, pid: libc::pid_t) -> Result<()> {
        let mappings = resolve_mappings(state, self.identities)?;
        let ids = state.ids();
        self.installer.install(pid, ids.uid, ids.gid, &mappings)?;
        Ok(())
    }

    /// Best-effort cleanup of a child we will never release.
    fn abandon(&self, pid: libc::pid_t, err: &Error) {
        warn!(%pid, error = %err, "abandoning child blocked in new user namespace");
        if let Err(err) = self.launcher.signal(pid, libc::SIGKILL) {
            warn!(%pid, %err, "cannot kill abandoned child");
            return;
        }
        if let Err(err) = self.launcher.wait_in_user_namespace(pid) {
            warn!(%pid, %err, "cannot reap abandoned child");
        }
    }
}

/// Become root in a new user namespace by re-executing the current program with
/// [`CloneLauncher`], mapping ranges from `/etc/subuid` and `/etc/subgid`.
///
/// If this returns `re_executed`, the program has already run to completion in the child, and
/// the caller should exit with `exit_code`.
pub fn become_root_in_user_ns(state: &mut NamespaceState) -> Result<RexecResult> {
    let launcher = CloneLauncher::new();
    let identities = SubIdFiles::default();
    Reexec::new(&launcher, &identities).run(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResolveError;
    use crate::id_map::{IdMap, IdMappings};
    use crate::libc_util::fd_recv;
    use crate::state::{HostIds, CONFIGURED_ENV, USER_ENV};
    use std::ffi::c_int;
    use std::io;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use std::thread::JoinHandle;
    use std::time::{Duration, Instant};

    const FAKE_PID: libc::pid_t = 4242;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Created,
        /// The child read its release byte; records what its uid_map and gid_map held then.
        Released {
            uid_map: Option<String>,
            gid_map: Option<String>,
        },
        Waited,
        Signaled(c_int),
    }

    /// Pretends to be a child in a new user namespace: a thread that blocks on the sync pipe.
    struct FakeLauncher {
        proc_dir: PathBuf,
        events: Arc<Mutex<Vec<Event>>>,
        child: Mutex<Option<JoinHandle<()>>>,
        exit_code: c_int,
        /// Signal to raise in ourselves while waiting for the child.
        raise: Option<c_int>,
        /// The child goes away before it can be released.
        vanish: bool,
    }

    impl FakeLauncher {
        fn new(proc_dir: PathBuf) -> FakeLauncher {
            FakeLauncher {
                proc_dir,
                events: Arc::new(Mutex::new(Vec::new())),
                child: Mutex::new(None),
                exit_code: 0,
                raise: None,
                vanish: false,
            }
        }

        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        fn record(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl Launcher for FakeLauncher {
        fn create_in_user_namespace(
            &self,
            ready: BorrowedFd<'_>,
            _parent_end: BorrowedFd<'_>,
        ) -> io::Result<libc::pid_t> {
            self.record(Event::Created);
            if self.vanish {
                return Ok(FAKE_PID);
            }
            let ready = ready.try_clone_to_owned()?;
            let pid_dir = self.proc_dir.join(FAKE_PID.to_string());
            let events = Arc::clone(&self.events);
            let child = std::thread::spawn(move || {
                // EOF: we were abandoned.
                if unsafe { fd_recv::<u8>(ready.as_raw_fd()) }.is_err() {
                    return;
                }
                let read = |name: &str| std::fs::read_to_string(pid_dir.join(name)).ok();
                events.lock().unwrap().push(Event::Released {
                    uid_map: read("uid_map"),
                    gid_map: read("gid_map"),
                });
            });
            *self.child.lock().unwrap() = Some(child);
            Ok(FAKE_PID)
        }

        fn wait_in_user_namespace(&self, pid: libc::pid_t) -> io::Result<c_int> {
            assert_eq!(pid, FAKE_PID);
            if let Some(sig) = self.raise {
                unsafe { libc::raise(sig) };
                let deadline = Instant::now() + Duration::from_secs(5);
                while !self.events().contains(&Event::Signaled(sig)) && Instant::now() < deadline
                {
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
            if let Some(child) = self.child.lock().unwrap().take() {
                child.join().unwrap();
            }
            self.record(Event::Waited);
            Ok(self.exit_code)
        }

        fn signal(&self, pid: libc::pid_t, sig: c_int) -> io::Result<()> {
            assert_eq!(pid, FAKE_PID);
            self.record(Event::Signaled(sig));
            Ok(())
        }
    }

    struct FakeIdentities(Option<IdMappings>);

    impl IdentityProvider for FakeIdentities {
        fn username_for_uid(&self, _uid: u32) -> Option<String> {
            Some("alice".to_owned())
        }

        fn sub_ids(&self, user: &str) -> std::result::Result<IdMappings, ResolveError> {
            self.0.clone().ok_or_else(|| ResolveError::NoRanges {
                user: user.to_owned(),
                path: "/etc/subuid".into(),
            })
        }
    }

    fn ranges() -> IdMappings {
        let mut map = IdMap::new();
        map.map_many(100000, 0, 65536);
        IdMappings {
            uids: map.clone(),
            gids: map,
        }
    }

    fn unprivileged(vars: &[(&str, &str)]) -> NamespaceState {
        let ids = HostIds {
            uid: 1000,
            gid: 1001,
            euid: 1000,
        };
        NamespaceState::from_vars(ids, vars.iter().copied())
    }

    /// A fake /proc with a directory for the fake child, and an installer that writes there
    /// because no helper can be found.
    fn fake_proc() -> (tempfile::TempDir, MappingInstaller) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(FAKE_PID.to_string())).unwrap();
        let mut installer = MappingInstaller::new();
        installer.proc_root(dir.path()).search_path(None);
        (dir, installer)
    }

    #[test]
    fn already_configured_is_not_reexecuted() {
        let launcher = FakeLauncher::new(PathBuf::from("/nonexistent"));
        let identities = FakeIdentities(Some(ranges()));
        let mut state = unprivileged(&[(CONFIGURED_ENV, "done")]);

        let result = Reexec::new(&launcher, &identities).run(&mut state).unwrap();

        assert_eq!(result, RexecResult::NOT_REEXECUTED);
        assert!(launcher.events().is_empty());
    }

    #[test]
    fn host_root_is_not_reexecuted() {
        let launcher = FakeLauncher::new(PathBuf::from("/nonexistent"));
        let identities = FakeIdentities(Some(ranges()));
        let mut state = NamespaceState::from_vars(
            HostIds {
                uid: 0,
                gid: 0,
                euid: 0,
            },
            [(USER_ENV, "root")],
        );

        let result = Reexec::new(&launcher, &identities).run(&mut state).unwrap();

        assert!(!result.re_executed);
        assert!(launcher.events().is_empty());
    }

    #[test]
    fn init_marker_marks_configured() {
        let launcher = FakeLauncher::new(PathBuf::from("/nonexistent"));
        let identities = FakeIdentities(Some(ranges()));
        let mut state = unprivileged(&[(CONFIGURED_ENV, "init")]);

        let result = Reexec::new(&launcher, &identities).run(&mut state).unwrap();

        assert!(!result.re_executed);
        assert_eq!(state.configured(), Some(Configured::Done));
        assert!(launcher.events().is_empty());
    }

    #[test]
    fn mappings_are_written_before_release() {
        let (dir, installer) = fake_proc();
        let mut launcher = FakeLauncher::new(dir.path().to_owned());
        launcher.exit_code = 3;
        let identities = FakeIdentities(Some(ranges()));
        let mut state = unprivileged(&[]);

        let result = Reexec::new(&launcher, &identities)
            .installer(installer)
            .run(&mut state)
            .unwrap();

        assert_eq!(
            result,
            RexecResult {
                re_executed: true,
                exit_code: 3
            }
        );
        assert_eq!(
            launcher.events(),
            vec![
                Event::Created,
                Event::Released {
                    uid_map: Some("0 1000 1\n".to_owned()),
                    gid_map: Some("0 1001 1\n".to_owned()),
                },
                Event::Waited,
            ]
        );
    }

    #[test]
    fn signals_are_forwarded_once() {
        let (dir, installer) = fake_proc();
        let mut launcher = FakeLauncher::new(dir.path().to_owned());
        launcher.raise = Some(libc::SIGUSR1);
        let identities = FakeIdentities(Some(ranges()));
        let mut state = unprivileged(&[]);

        let result = Reexec::new(&launcher, &identities)
            .installer(installer)
            .run(&mut state)
            .unwrap();

        assert!(result.re_executed);
        let signaled: Vec<_> = launcher
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Signaled(_)))
            .collect();
        assert_eq!(signaled, vec![Event::Signaled(libc::SIGUSR1)]);
    }

    #[test]
    fn resolution_failure_abandons_child() {
        let (dir, installer) = fake_proc();
        let launcher = FakeLauncher::new(dir.path().to_owned());
        let identities = FakeIdentities(None);
        let mut state = unprivileged(&[]);

        let err = Reexec::new(&launcher, &identities)
            .installer(installer)
            .run(&mut state)
            .unwrap_err();

        assert!(matches!(err, Error::MappingResolution(_)));
        // Killed and reaped, but never released: the child saw EOF instead of a byte.
        assert_eq!(
            launcher.events(),
            vec![
                Event::Created,
                Event::Signaled(libc::SIGKILL),
                Event::Waited
            ]
        );
        assert!(!dir.path().join("4242/uid_map").exists());
    }

    #[test]
    fn write_failure_abandons_child() {
        let dir = tempfile::tempdir().unwrap();
        // No directory for the child, so every control file write fails.
        let mut installer = MappingInstaller::new();
        installer.proc_root(dir.path()).search_path(None);
        let launcher = FakeLauncher::new(dir.path().to_owned());
        let identities = FakeIdentities(Some(ranges()));
        let mut state = unprivileged(&[]);

        let err = Reexec::new(&launcher, &identities)
            .installer(installer)
            .run(&mut state)
            .unwrap_err();

        assert!(matches!(err, Error::MappingWrite { .. }));
        assert!(!launcher
            .events()
            .iter()
            .any(|e| matches!(e, Event::Released { .. })));
    }

    #[test]
    fn release_failure_abandons_child() {
        let (dir, installer) = fake_proc();
        let mut launcher = FakeLauncher::new(dir.path().to_owned());
        launcher.vanish = true;
        let identities = FakeIdentities(Some(ranges()));
        let mut state = unprivileged(&[]);

        let err = Reexec::new(&launcher, &identities)
            .installer(installer)
            .run(&mut state)
            .unwrap_err();

        assert!(matches!(err, Error::SyncPipe(_)));
        assert_eq!(
            launcher.events(),
            vec![
                Event::Created,
                Event::Signaled(libc::SIGKILL),
                Event::Waited
            ]
        );
    }
}
