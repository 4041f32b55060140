//! Resolving the sub-UID/sub-GID ranges a user may map into their namespace.

use std::ffi::{c_char, CStr};
use std::path::{Path, PathBuf};
use std::{mem, ptr};

use tracing::{debug, warn};

use crate::error::ResolveError;
use crate::id_map::{IdMap, IdMappings};
use crate::state::NamespaceState;

/// Source of user identities and the ID ranges they have been granted.
pub trait IdentityProvider {
    /// Reverse-lookup the name of a user.
    fn username_for_uid(&self, uid: u32) -> Option<String>;

    /// Look up the sub-UID and sub-GID ranges granted to `user`, numbered from container ID 0.
    fn sub_ids(&self, user: &str) -> Result<IdMappings, ResolveError>;
}

/// Resolve the ranges to map for the calling user.
///
/// The username comes from `USER`, or else from the effective UID. Without one there is nothing
/// to map, so that is always an error. A failed range lookup is an error too, unless single-ID
/// mapping is allowed, in which case we return empty maps.
pub fn resolve_mappings(
    state: &NamespaceState,
    provider: &dyn IdentityProvider,
) -> Result<IdMappings, ResolveError> {
    let euid = state.ids().euid;
    let user = match state.user() {
        Some(user) => user.to_owned(),
        None => provider
            .username_for_uid(euid)
            .ok_or(ResolveError::NoUsername { uid: euid })?,
    };
    debug!(%user, "resolving sub-id ranges");

    match provider.sub_ids(&user) {
        Ok(mappings) => Ok(mappings),
        Err(err) if state.allow_single_mapping() => {
            warn!(%user, error = %err, "no sub-id ranges, mapping a single identity");
            Ok(IdMappings::default())
        }
        Err(err) => Err(err),
    }
}

/// Reads ranges from shadow-utils style `/etc/subuid` and `/etc/subgid` files, and usernames
/// from the system password database.
#[derive(Debug, Clone)]
pub struct SubIdFiles {
    subuid: PathBuf,
    subgid: PathBuf,
}

impl Default for SubIdFiles {
    fn default() -> Self {
        SubIdFiles::new("/etc/subuid", "/etc/subgid")
    }
}

impl SubIdFiles {
    pub fn new(subuid: impl Into<PathBuf>, subgid: impl Into<PathBuf>) -> SubIdFiles {
        SubIdFiles {
            subuid: subuid.into(),
            subgid: subgid.into(),
        }
    }
}

impl IdentityProvider for SubIdFiles {
    fn username_for_uid(&self, uid: u32) -> Option<String> {
        passwd_name(uid)
    }

    fn sub_ids(&self, user: &str) -> Result<IdMappings, ResolveError> {
        Ok(IdMappings {
            uids: read_ranges(&self.subuid, user)?,
            gids: read_ranges(&self.subgid, user)?,
        })
    }
}

/// Read the ranges granted to `user` in a sub-ID file, lowest host ID first, and give them
/// consecutive container IDs starting at 0.
fn read_ranges(path: &Path, user: &str) -> Result<IdMap, ResolveError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ResolveError::Read {
        path: path.to_owned(),
        source,
    })?;

    let mut ranges = parse_ranges(path, &contents, user)?;
    if ranges.is_empty() {
        return Err(ResolveError::NoRanges {
            user: user.to_owned(),
            path: path.to_owned(),
        });
    }
    ranges.sort_unstable();

    let mut map = IdMap::new();
    let mut container_id: u32 = 0;
    for (start, count) in ranges {
        map.map_many(start, container_id, count);
        match container_id.checked_add(count) {
            Some(next) => container_id = next,
            None => break,
        }
    }
    Ok(map)
}

/// Parse `name:start:count` entries, returning `(start, count)` for those matching `user`.
fn parse_ranges(path: &Path, contents: &str, user: &str) -> Result<Vec<(u32, u32)>, ResolveError> {
    let malformed = |line: &str| ResolveError::Malformed {
        path: path.to_owned(),
        line: line.to_owned(),
    };

    let mut ranges = Vec::new();
    for line in contents.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(':').collect();
        let [name, start, count] = fields[..] else {
            return Err(malformed(line));
        };
        let (Ok(start), Ok(count)) = (start.parse::<u32>(), count.parse::<u32>()) else {
            return Err(malformed(line));
        };
        if (name == user || name == "ALL") && count > 0 {
            ranges.push((start, count));
        }
    }
    Ok(ranges)
}

/// Look up a user's name with `getpwuid_r(3)`.
fn passwd_name(uid: u32) -> Option<String> {
    let mut buf: Vec<c_char> = vec![0; 1024];
    loop {
        let mut pwd: libc::passwd = unsafe { mem::zeroed() };
        let mut result: *mut libc::passwd = ptr::null_mut();
        let rc = unsafe {
            libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
        };
        if rc == libc::ERANGE && buf.len() < 1 << 20 {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 || result.is_null() {
            return None;
        }
        let name = unsafe { CStr::from_ptr(pwd.pw_name) };
        return name.to_str().ok().map(str::to_owned);
    }
}
