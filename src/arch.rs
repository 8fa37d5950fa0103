// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;
use std::str::FromStr;

/// EFI architectures with a removable-media boot path.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EfiArch {
    X64,
    AA64,
}

/// Row of the architecture table.
struct ArchInfo {
    arch: EfiArch,
    /// Token used in `EFI/BOOT/BOOT<token>.EFI`.
    token: &'static str,
    /// Architecture name used by the GRUB packaging.
    grub: &'static str,
    /// `std::env::consts::ARCH` of a host that runs this architecture.
    host: &'static str,
}

const ARCHES: &[ArchInfo] = &[
    ArchInfo {
        arch: EfiArch::X64,
        token: "X64",
        grub: "x86_64",
        host: "x86_64",
    },
    ArchInfo {
        arch: EfiArch::AA64,
        token: "AA64",
        grub: "arm64",
        host: "aarch64",
    },
];

impl EfiArch {
    pub fn all() -> impl Iterator<Item = Self> {
        ARCHES.iter().map(|info| info.arch)
    }

    fn info(self) -> &'static ArchInfo {
        match self {
            Self::X64 => &ARCHES[0],
            Self::AA64 => &ARCHES[1],
        }
    }

    /// Uppercase token, e.g. `X64`.
    pub fn token(self) -> &'static str {
        self.info().token
    }

    /// Lowercase token, e.g. `x64`, as used in shim file names and in
    /// the shell command that launches the removable-media loader.
    pub fn lower(self) -> String {
        self.token().to_ascii_lowercase()
    }

    /// GRUB architecture name, e.g. `x86_64`.
    pub fn grub_arch(self) -> &'static str {
        self.info().grub
    }

    /// Architecture of the host, if it is one of ours.
    pub fn host() -> Option<Self> {
        ARCHES
            .iter()
            .find(|info| info.host == std::env::consts::ARCH)
            .map(|info| info.arch)
    }

    /// Removable-media default boot path inside the ESP.
    pub fn removable_media_path(self) -> String {
        format!("EFI/BOOT/BOOT{}.EFI", self.token())
    }

    /// Path the first-stage loader chain-loads next.
    pub fn second_stage_path(self) -> String {
        format!("EFI/BOOT/GRUB{}.EFI", self.token())
    }

    /// The removable-media loader as typed at the UEFI shell.
    pub fn shell_boot_path(self) -> String {
        format!(r"\efi\boot\boot{}.efi", self.lower())
    }
}

impl fmt::Display for EfiArch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.token())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid EFI architecture: {0}")]
pub struct ParseArchError(String);

impl FromStr for EfiArch {
    type Err = ParseArchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ARCHES
            .iter()
            .find(|info| info.token.eq_ignore_ascii_case(s))
            .map(|info| info.arch)
            .ok_or_else(|| ParseArchError(s.to_string()))
    }
}
