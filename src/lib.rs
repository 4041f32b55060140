//! Become root in a new user namespace, as an unprivileged user.
//!
//! Call [`become_root_in_user_ns`] early in `main`. The first time through, it re-executes the
//! program inside a fresh user namespace with the caller mapped to root, waits for that copy to
//! finish, and reports its exit code. Inside the namespace, the same call returns straight away
//! and the program carries on as root.
//!
//! [`find_child_namespace`] locates the user namespace of an already-running container process,
//! relative to our own, so it can be joined.

mod libc_util;

mod error;
mod id_map;
mod install;
mod launcher;
mod reexec;
mod signals;
mod state;
mod subid;
mod userns;

pub use error::{Error, ResolveError, Result};
pub use id_map::{IdMap, IdMapping, IdMappings};
pub use install::{helper_args, InstallReport, MappingInstaller, MappingMethod};
pub use launcher::{CloneLauncher, Launcher};
pub use reexec::{become_root_in_user_ns, Reexec, RexecResult, SyncPipe};
pub use signals::SignalProxy;
pub use state::{Configured, HostIds, NamespaceState};
pub use subid::{resolve_mappings, IdentityProvider, SubIdFiles};
pub use userns::{
    find_child_namespace, find_child_namespace_in, NamespaceHandle, NamespaceSource,
    ProcNamespaces,
};

/// Environment variables understood by [`NamespaceState::from_env`].
pub mod env {
    pub use crate::state::{
        ALLOW_SINGLE_MAPPING_ENV, CONFIGURED_ENV, ROOTLESS_UID_ENV, USER_ENV,
    };
}

/// In test builds, use alloc_counter to verify at runtime that the functions which must be
/// async-signal-safe do not allocate.
#[cfg(debug_assertions)]
#[global_allocator]
static ALLOC: alloc_counter::AllocCounterSystem = alloc_counter::AllocCounterSystem;
