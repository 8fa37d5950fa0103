// SPDX-License-Identifier: MIT OR Apache-2.0

#![cfg(unix)]

mod common;

use tempfile::TempDir;
use uefi_boot_check::fat::FatVolume;
use uefi_boot_check::fixture::ESP_SIZE_MB;

/// Records its arguments, then runs the real `mmd` further down `PATH`.
const LOGGING_MMD: &str = r#"#!/bin/sh
echo "$@" >> "$(dirname "$0")/mmd.log"
PATH=${PATH#*:} exec mmd "$@"
"#;

#[test_with::executable(mkfs.fat, mmd)]
#[test]
fn test_existing_directories_are_not_recreated() {
    let tools = TempDir::new().unwrap();
    common::fake_tool(tools.path(), "mmd", LOGGING_MMD);
    common::prepend_path(tools.path());

    let mut volume = FatVolume::create(ESP_SIZE_MB).unwrap();
    volume.makedirs("EFI/BOOT").unwrap();
    volume.makedirs("EFI/BOOT").unwrap();
    volume.mkdir("EFI").unwrap();

    let log = fs_err::read_to_string(tools.path().join("mmd.log")).unwrap();
    let calls: Vec<&str> = log.lines().collect();
    assert_eq!(calls.len(), 2, "{log}");
    assert!(calls[0].ends_with("-D s ::EFI"), "{log}");
    assert!(calls[1].ends_with("-D s ::EFI/BOOT"), "{log}");

    let reader = volume.reader().unwrap();
    assert!(reader.is_dir("EFI/BOOT").unwrap());
}
