// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::error::{Error, Result, StepError};
use crate::fat::FatReader;
use crate::util::run_cmd;
use mbrman::MBR;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::Path;
use std::process::Command;
use tempfile::{NamedTempFile, TempDir, TempPath};

const SECTOR_SIZE: u64 = 512;

/// MBR partition type of an EFI System Partition.
const ESP_PARTITION_TYPE: u8 = 0xef;

/// Index of the appended ESP in the hybrid MBR.
const ESP_PARTITION_INDEX: usize = 2;

/// Location of the boot image inside the ISO tree.
const ELTORITO_DIR: &str = "boot";
const ELTORITO_IMAGE: &str = "efi.img";

/// An ISO9660 image that boots straight into an appended EFI System
/// Partition. The image file is deleted on drop.
#[derive(Debug)]
pub struct BootableIsoImage {
    path: TempPath,
}

impl BootableIsoImage {
    /// Build an ISO whose El Torito entry is `boot_image`, appended as
    /// partition 2 with type `0xEF` and booted without emulation.
    pub fn wrap(boot_image: &Path) -> Result<Self> {
        let iso_error = |source: StepError| Error::IsoBuild {
            source_image: boot_image.to_path_buf(),
            source,
        };

        // Staging tree, removed once the ISO has been mastered.
        let iso_root = TempDir::new().map_err(|err| iso_error(err.into()))?;
        let eltorito_dir = iso_root.path().join(ELTORITO_DIR);
        let eltorito_path = eltorito_dir.join(ELTORITO_IMAGE);
        fs_err::create_dir_all(&eltorito_dir).map_err(|err| iso_error(err.into()))?;
        fs_err::copy(boot_image, &eltorito_path).map_err(|err| iso_error(err.into()))?;

        // Dropping this on an early return removes the partial output.
        let path = NamedTempFile::new()
            .map_err(|err| iso_error(err.into()))?
            .into_temp_path();

        let mut cmd = Command::new("xorriso");
        cmd.args(["-as", "mkisofs", "-J", "-l"]);
        cmd.args(["-c", &format!("{ELTORITO_DIR}/boot.cat")]);
        cmd.args(["-partition_offset", "16"]);
        cmd.args(["-append_partition", &ESP_PARTITION_INDEX.to_string()]);
        cmd.arg(format!("{ESP_PARTITION_TYPE:#x}")).arg(&eltorito_path);
        cmd.args([
            "-e",
            &format!("--interval:appended_partition_{ESP_PARTITION_INDEX}:all::"),
        ]);
        cmd.arg("-no-emul-boot");
        cmd.arg("-o").arg(&*path);
        cmd.arg(iso_root.path());
        run_cmd(cmd).map_err(|err| iso_error(err.into()))?;

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes of the appended EFI System Partition.
    pub fn read_esp(&self) -> Result<Vec<u8>> {
        let esp_error = |source: StepError| Error::IsoBuild {
            source_image: self.path.to_path_buf(),
            source,
        };

        let mut file = fs_err::File::open(self.path())?;
        let mbr = MBR::read_from(&mut file, SECTOR_SIZE as u32)
            .map_err(|err| esp_error(io::Error::new(io::ErrorKind::InvalidData, err).into()))?;

        let entry = &mbr[ESP_PARTITION_INDEX];
        if !entry.is_used() || entry.sys != ESP_PARTITION_TYPE {
            return Err(esp_error(StepError::NoEsp));
        }

        let start = u64::from(entry.starting_lba) * SECTOR_SIZE;
        let len = u64::from(entry.sectors) * SECTOR_SIZE;
        log::debug!("ESP at byte {start}, {len} bytes");

        file.seek(SeekFrom::Start(start))?;
        let mut esp = Vec::new();
        file.take(len).read_to_end(&mut esp)?;
        if esp.len() as u64 != len {
            return Err(esp_error(StepError::NoEsp));
        }
        Ok(esp)
    }

    /// Open the appended EFI System Partition as a FAT filesystem.
    pub fn open_esp(&self) -> Result<FatReader<Cursor<Vec<u8>>>> {
        Ok(FatReader::new(Cursor::new(self.read_esp()?))?)
    }
}
