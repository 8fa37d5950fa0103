// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stand-ins for the external image tools.

use std::ffi::OsString;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Write an executable shell script called `name` into `dir`.
pub fn fake_tool(dir: &Path, name: &str, script: &str) {
    let path = dir.join(name);
    fs_err::write(&path, script).unwrap();
    fs_err::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Put `dir` first on `PATH` for the rest of the process.
///
/// Each test binary that calls this holds a single test, so no other
/// test sees the changed `PATH`.
pub fn prepend_path(dir: &Path) {
    let mut path = OsString::from(dir);
    path.push(":");
    path.push(std::env::var_os("PATH").unwrap_or_default());
    std::env::set_var("PATH", path);
}
