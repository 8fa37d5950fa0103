// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::arch::EfiArch;
use crate::error::Result;
use crate::fat::FatVolume;
use crate::iso::BootableIsoImage;
use std::path::Path;

/// Size of the ESP image in MiB.
pub const ESP_SIZE_MB: u64 = 64;

/// Directory holding the removable-media loaders.
pub const BOOT_DIR: &str = "EFI/BOOT";

/// Bootable removable media carrying a first-stage loader at the UEFI
/// removable-media path and the second stage it chain-loads next.
///
/// Owns both the ESP image and the ISO built from it; dropping the
/// fixture deletes both files.
#[derive(Debug)]
pub struct RemovableMedia {
    arch: EfiArch,
    esp: FatVolume,
    iso: BootableIsoImage,
}

impl RemovableMedia {
    /// Build the fixture from already-resolved loader binaries.
    pub fn build(arch: EfiArch, first_stage: &Path, second_stage: &Path) -> Result<Self> {
        log::info!(
            "building {arch} removable media from {} and {}",
            first_stage.display(),
            second_stage.display()
        );

        let mut esp = FatVolume::create(ESP_SIZE_MB)?;
        esp.makedirs(BOOT_DIR)?;
        esp.insert_file(first_stage, &arch.removable_media_path())?;
        esp.insert_file(second_stage, &arch.second_stage_path())?;

        let iso = BootableIsoImage::wrap(esp.path())?;
        Ok(Self { arch, esp, iso })
    }

    pub fn arch(&self) -> EfiArch {
        self.arch
    }

    /// The ESP image the ISO was built from.
    pub fn esp(&self) -> &FatVolume {
        &self.esp
    }

    pub fn iso(&self) -> &BootableIsoImage {
        &self.iso
    }

    /// Path of the bootable image to attach to the VM.
    pub fn path(&self) -> &Path {
        self.iso.path()
    }
}
