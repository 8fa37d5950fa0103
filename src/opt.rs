// SPDX-License-Identifier: MIT OR Apache-2.0

use clap::{Parser, Subcommand, ValueEnum};
use std::ffi::OsString;
use std::path::PathBuf;
use uefi_boot_check::console::Expected;
use uefi_boot_check::qemu::{FlashSize, Machine, Variant};
use uefi_boot_check::EfiArch;

/// Boot UEFI firmware under QEMU and check what its console does.
#[derive(Debug, Parser)]
pub struct Opt {
    /// Seconds to wait for each console prompt.
    #[clap(
        long,
        global = true,
        default_value_t = 60,
        env = "UEFI_BOOT_CHECK_TIMEOUT"
    )]
    pub timeout: u64,

    /// Don't copy the raw console output to stdout.
    #[clap(long, global = true, action)]
    pub no_echo: bool,

    /// Directory containing the `OVMF` and `AAVMF` firmware directories.
    #[clap(long, global = true, default_value = "/usr/share")]
    pub firmware_dir: PathBuf,

    /// Directory containing the shim binaries.
    #[clap(long, global = true, default_value = "/usr/lib/shim")]
    pub shim_dir: PathBuf,

    /// Directory containing the GRUB platform directories.
    #[clap(long, global = true, default_value = "/usr/lib/grub")]
    pub grub_dir: PathBuf,

    #[clap(subcommand)]
    pub action: Action,
}

#[derive(Debug, Subcommand)]
pub enum Action {
    Run(RunOpt),
    Check(CheckOpt),
    Fixture(FixtureOpt),
    Sign(SignOpt),
}

/// Run the built-in firmware scenarios.
#[derive(Debug, Parser)]
pub struct RunOpt {
    /// Only run scenarios for this machine.
    #[clap(long, action)]
    pub machine: Option<Machine>,

    /// Only run scenarios using this firmware variant.
    #[clap(long, action)]
    pub variant: Option<Variant>,

    /// Only run scenarios using this flash size.
    #[clap(long, action)]
    pub flash_size: Option<FlashSize>,

    /// Only run scenarios whose name contains this string.
    #[clap(long, action)]
    pub filter: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CheckMode {
    /// Expect the firmware to reach the UEFI shell.
    Shell,
    /// Launch the removable-media loader with Secure Boot enforced.
    SecureBoot,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ExpectOpt {
    Verified,
    Rejected,
}

impl From<ExpectOpt> for Expected {
    fn from(expect: ExpectOpt) -> Self {
        match expect {
            ExpectOpt::Verified => Self::Verified,
            ExpectOpt::Rejected => Self::Rejected,
        }
    }
}

/// Check the console of an arbitrary VM command.
#[derive(Debug, Parser)]
pub struct CheckOpt {
    #[clap(long, value_enum, default_value_t = CheckMode::Shell)]
    pub mode: CheckMode,

    /// Architecture of the loader to launch in secure-boot mode.
    #[clap(long, action, default_value_t = EfiArch::X64)]
    pub arch: EfiArch,

    /// Expected Secure Boot verdict.
    #[clap(long, value_enum, required_if_eq("mode", "secure-boot"))]
    pub expect: Option<ExpectOpt>,

    /// Raw disk image to attach to the VM. May be repeated.
    #[clap(long = "disk", action)]
    pub disks: Vec<PathBuf>,

    /// The VM command line.
    #[clap(last = true, required = true)]
    pub command: Vec<OsString>,
}

/// Build a removable-media ISO holding a two-stage loader.
#[derive(Debug, Parser)]
pub struct FixtureOpt {
    #[clap(long, action)]
    pub arch: EfiArch,

    /// Installed as `EFI/BOOT/BOOT<ARCH>.EFI`.
    #[clap(long, action)]
    pub first_stage: PathBuf,

    /// Installed as `EFI/BOOT/GRUB<ARCH>.EFI`.
    #[clap(long, action)]
    pub second_stage: PathBuf,

    /// Where to write the ISO.
    #[clap(long, action)]
    pub output: PathBuf,
}

/// Sign an EFI binary with `sbsign`.
#[derive(Debug, Parser)]
pub struct SignOpt {
    #[clap(long, action)]
    pub key: PathBuf,

    #[clap(long, action)]
    pub cert: PathBuf,

    /// Distinguishes signatures made with different keys.
    #[clap(long, action)]
    pub label: String,

    #[clap(long, action)]
    pub out_dir: PathBuf,

    pub input: PathBuf,
}
