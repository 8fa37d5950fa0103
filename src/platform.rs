//! Functions to determine the host platform.
//!
//! Use the functions where possible instead of `#[cfg(...)]` so that
//! code for all platforms gets checked at compile time.

use std::env::consts;
use std::path::Path;

pub fn is_linux() -> bool {
    consts::OS == "linux"
}

/// Whether KVM can be used to accelerate QEMU.
pub fn has_kvm() -> bool {
    is_linux()
        && fs_err::OpenOptions::new()
            .read(true)
            .write(true)
            .open(Path::new("/dev/kvm"))
            .is_ok()
}

/// `PATH` with the sbin directories appended, since `mkfs.fat` is
/// usually installed there and those are often missing for
/// unprivileged users.
pub fn path_with_sbin() -> std::ffi::OsString {
    let mut path = std::env::var_os("PATH").unwrap_or_default();
    path.push(":/sbin:/usr/sbin");
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_with_sbin() {
        let path = path_with_sbin();
        let path = path.to_string_lossy();
        assert!(path.ends_with(":/sbin:/usr/sbin"));
    }
}
