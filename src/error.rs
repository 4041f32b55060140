use std::io;
use std::path::PathBuf;

/// Result type for our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while bootstrapping into, or searching for, a user namespace.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The native boundary could not create the child in a new user namespace.
    #[error("cannot re-exec process in a new user namespace")]
    Create(#[source] io::Error),

    /// No usable UID/GID mapping could be resolved for the caller.
    #[error("cannot resolve id mappings")]
    MappingResolution(#[from] ResolveError),

    /// The kernel rejected a write to one of the child's namespace control files.
    #[error("cannot write {}", path.display())]
    MappingWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot use sync pipe")]
    SyncPipe(#[source] io::Error),

    #[error("cannot subscribe to signals for forwarding")]
    Signals(#[source] io::Error),

    #[error("error waiting for the re-exec process")]
    Wait(#[source] io::Error),

    /// The target process already lives in the caller's user namespace.
    #[error("process {pid} is running in the same user namespace")]
    SameNamespace { pid: libc::pid_t },

    #[error("{context}")]
    AncestryWalk {
        context: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Failure to produce sub-UID/sub-GID ranges for the caller.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("could not find user by UID {uid} nor was USER set")]
    NoUsername { uid: u32 },

    #[error("no ranges found for user {user:?} in {}", path.display())]
    NoRanges { user: String, path: PathBuf },

    #[error("cannot read {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed entry in {}: {line:?}", path.display())]
    Malformed { path: PathBuf, line: String },
}

impl Error {
    /// Wrap an OS error raised while walking namespace ancestry, with a note on what we were doing.
    pub(crate) fn walk(context: &'static str) -> impl FnOnce(io::Error) -> Error {
        move |source| Error::AncestryWalk { context, source }
    }
}
