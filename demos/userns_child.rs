//! # Demo: Find a container's user namespace
//!
//! Given the pid of a process running in a container, finds the container's user namespace (the
//! child of ours that the process descends from) and runs `nsenter` in it.
//!
//! ```text
//! cargo run --example userns_child -- <pid> [command...]
//! ```

use std::os::fd::AsRawFd;
use std::process::Command;

use eyre::{eyre, WrapErr};
use tracing::info;

mod common;

pub fn main() -> eyre::Result<()> {
    common::configure_logging();

    let mut args = std::env::args().skip(1);
    let pid: libc::pid_t = args
        .next()
        .ok_or_else(|| eyre!("usage: userns_child <pid> [command...]"))?
        .parse()
        .wrap_err("pid must be a number")?;

    let ns = rootless::find_child_namespace(pid)
        .wrap_err_with(|| format!("failed to find the user namespace of {pid}"))?;
    info!(identity = ns.identity(), fd = ns.as_raw_fd(), "found user namespace");

    let command: Vec<String> = args.collect();
    if command.is_empty() {
        println!("{}", ns.identity());
        return Ok(());
    }

    // The descriptor survives exec, so nsenter can join it through our /proc entry.
    let status = Command::new("nsenter")
        .arg(format!("--user=/proc/self/fd/{}", ns.as_raw_fd()))
        .arg("--preserve-credentials")
        .args(&command)
        .status()
        .wrap_err("failed to run nsenter")?;
    std::process::exit(status.code().unwrap_or(1));
}
