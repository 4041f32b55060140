//! # Demo: Rootless
//!
//! Becomes root in a new user namespace, then runs a command there.
//!
//! ```text
//! cargo run --example rootless -- id
//! cargo run --example rootless -- cat /proc/self/uid_map
//! ```
//!
//! With no command, prints the IDs we ended up with. Set `USER` to pick whose `/etc/subuid` and
//! `/etc/subgid` ranges are mapped, or `ROOTLESS_ALLOW_SINGLE_ID_MAPPING=1` to get by without
//! any.

use std::process::Command;

use eyre::WrapErr;
use tracing::info;

mod common;

pub fn main() -> eyre::Result<()> {
    common::configure_logging();

    let mut state = rootless::NamespaceState::from_env();
    let result = rootless::become_root_in_user_ns(&mut state)
        .wrap_err("failed to become root in a user namespace")?;
    if result.re_executed {
        info!(exit_code = result.exit_code, "re-executed copy finished");
        std::process::exit(result.exit_code);
    }

    // From here on, we're the copy inside the namespace.
    let ids = rootless::HostIds::current();
    info!(uid = ids.uid, gid = ids.gid, configured = ?state.configured(), "inside user namespace");

    let mut args = std::env::args().skip(1);
    let Some(program) = args.next() else {
        println!("uid={} gid={} euid={}", ids.uid, ids.gid, ids.euid);
        return Ok(());
    };

    let status = Command::new(&program)
        .args(args)
        .status()
        .wrap_err_with(|| format!("failed to run {program}"))?;
    std::process::exit(status.code().unwrap_or(1));
}
