#![forbid(unsafe_code)]

//! Process-level safety checks shared by the tubegrab binaries.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Refuses to start when invoked as root. The backend writes staged download
/// files into a user-provided directory and should never do so with elevated
/// privileges.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!("{process} refuses to run as root; start it under a regular user account");
    }
    Ok(())
}
