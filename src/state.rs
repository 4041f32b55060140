//! Process-level facts about whether we're already inside our own user namespace.

use std::collections::HashMap;

/// Marker recording that the user namespace has been configured. Absent in the original
/// process, `init` in a freshly re-executed child, `done` once that child has settled in.
pub const CONFIGURED_ENV: &str = "_ROOTLESS_USERNS_CONFIGURED";

/// The caller's UID in the parent user namespace, passed down to the re-executed child.
pub const ROOTLESS_UID_ENV: &str = "_ROOTLESS_UID";

/// Username used to look up sub-UID/sub-GID ranges.
pub const USER_ENV: &str = "USER";

/// If set, a failed range lookup falls back to mapping only the caller's own UID/GID.
pub const ALLOW_SINGLE_MAPPING_ENV: &str = "ROOTLESS_ALLOW_SINGLE_ID_MAPPING";

/// Value of the configuration marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Configured {
    /// We were just re-executed into the namespace and have not marked ourselves yet.
    Init,
    Done,
}

/// Real IDs of the calling process on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostIds {
    pub uid: u32,
    pub gid: u32,
    pub euid: u32,
}

impl HostIds {
    pub fn current() -> HostIds {
        unsafe {
            HostIds {
                uid: libc::getuid(),
                gid: libc::getgid(),
                euid: libc::geteuid(),
            }
        }
    }
}

/// Everything the bootstrap consults about the calling process, captured once at startup.
#[derive(Debug, Clone)]
pub struct NamespaceState {
    ids: HostIds,
    configured: Option<Configured>,
    rootless_uid: Option<String>,
    user: Option<String>,
    allow_single_mapping: bool,
    skip_storage_setup: bool,
}

impl NamespaceState {
    /// Capture the state of the current process from its real IDs and environment.
    pub fn from_env() -> NamespaceState {
        let vars = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)));
        NamespaceState::from_vars(HostIds::current(), vars)
    }

    /// Build the state from explicit IDs and environment variables.
    pub fn from_vars(
        ids: HostIds,
        vars: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> NamespaceState {
        let mut vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(_, v)| !v.is_empty())
            .collect();

        let configured = vars.remove(CONFIGURED_ENV).map(|v| match v.as_str() {
            "init" => Configured::Init,
            _ => Configured::Done,
        });

        NamespaceState {
            ids,
            configured,
            rootless_uid: vars.remove(ROOTLESS_UID_ENV),
            user: vars.remove(USER_ENV),
            allow_single_mapping: vars.contains_key(ALLOW_SINGLE_MAPPING_ENV),
            skip_storage_setup: false,
        }
    }

    pub fn ids(&self) -> HostIds {
        self.ids
    }

    pub fn configured(&self) -> Option<Configured> {
        self.configured
    }

    /// True unless we are host root and nobody has configured a namespace for us.
    pub fn is_rootless(&self) -> bool {
        self.ids.uid != 0 || self.configured.is_some()
    }

    /// The UID of the user in the parent user namespace.
    ///
    /// A malformed override is ignored in favor of the real UID.
    pub fn rootless_uid(&self) -> u32 {
        self.rootless_uid
            .as_deref()
            .and_then(|uid| uid.parse().ok())
            .unwrap_or(self.ids.uid)
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn allow_single_mapping(&self) -> bool {
        self.allow_single_mapping
    }

    /// Tell the engine not to set up its storage.
    pub fn set_skip_storage_setup(&mut self, skip: bool) {
        self.skip_storage_setup = skip;
    }

    pub fn skip_storage_setup(&self) -> bool {
        self.skip_storage_setup
    }

    /// Record that this process has finished settling into the namespace, both here and in the
    /// environment inherited by our own children.
    pub fn mark_configured(&mut self) {
        std::env::set_var(CONFIGURED_ENV, "done");
        self.configured = Some(Configured::Done);
    }
}
