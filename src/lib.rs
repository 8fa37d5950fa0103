// SPDX-License-Identifier: MIT OR Apache-2.0

//! Boot checks for UEFI firmware builds.
//!
//! The crate boots OVMF and AAVMF images under QEMU and drives the
//! firmware's serial console to confirm that it reaches the UEFI shell,
//! or that Secure Boot accepts signed loaders and refuses unsigned ones.
//!
//! The pieces can be used on their own:
//!
//! - [`fat`] and [`iso`] build the removable media a loader boots from.
//! - [`fixture`] combines them into a ready-to-boot image.
//! - [`sign`] signs EFI binaries with `sbsign`.
//! - [`console`] drives a firmware console and classifies the result.
//! - [`qemu`] assembles the virtual machine command line.
//! - [`scenario`] lists the stock firmware scenarios and runs them.

pub mod arch;
pub mod console;
pub mod error;
pub mod fat;
pub mod fixture;
pub mod iso;
pub mod platform;
pub mod qemu;
pub mod scenario;
pub mod sign;
pub mod util;

pub use arch::EfiArch;
pub use error::{Error, Result};
