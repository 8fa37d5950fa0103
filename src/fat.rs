// SPDX-License-Identifier: MIT OR Apache-2.0

//! FAT32 volume images built without mounting.
//!
//! Writes go through `mkfs.fat` and mtools (`mmd`, `mcopy`) operating
//! directly on the image file. Reads are done in-process with `fatfs`.

use crate::error::{Error, Result, StepError};
use crate::platform;
use crate::util::run_cmd;
use fatfs::{Dir, FileSystem, FsOptions, ReadWriteSeek};
use std::io::{self, Read};
use std::path::Path;
use std::process::Command;
use tempfile::{NamedTempFile, TempPath};

const MIB: u64 = 1024 * 1024;

/// A FAT32 filesystem image backed by a temporary file.
///
/// The backing file is deleted when the volume is dropped, including
/// when [`FatVolume::create`] fails part way through.
#[derive(Debug)]
pub struct FatVolume {
    path: TempPath,
    size_in_mb: u64,
}

impl FatVolume {
    /// Allocate a sparse image of `size_in_mb` MiB and format it as FAT32.
    pub fn create(size_in_mb: u64) -> Result<Self> {
        let path = NamedTempFile::new()
            .map_err(|err| Error::ImageCreation {
                path: std::env::temp_dir(),
                source: err.into(),
            })?
            .into_temp_path();
        let creation_error = |source: StepError| Error::ImageCreation {
            path: path.to_path_buf(),
            source,
        };

        // Setting the length leaves a hole rather than writing zeros.
        fs_err::OpenOptions::new()
            .write(true)
            .open(&*path)
            .and_then(|file| file.set_len(size_in_mb * MIB))
            .map_err(|err| creation_error(err.into()))?;

        let mut cmd = Command::new("mkfs.fat");
        cmd.env("PATH", platform::path_with_sbin());
        cmd.args(["-F", "32"]).arg(&*path);
        run_cmd(cmd).map_err(|err| creation_error(err.into()))?;

        Ok(Self { path, size_in_mb })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_in_mb(&self) -> u64 {
        self.size_in_mb
    }

    fn mtools_cmd(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        // The image has no partition table, so there is no disk
        // geometry for mtools to sanity check.
        cmd.env("MTOOLS_SKIP_CHECK", "1");
        cmd.arg("-i").arg(self.path());
        cmd
    }

    fn write_error(&self, dest: &str, source: StepError) -> Error {
        Error::ImageWrite {
            path: self.path.to_path_buf(),
            dest: dest.to_string(),
            source,
        }
    }

    /// Create a single directory level. The parent must already exist.
    /// Creating a directory that already exists is not an error.
    pub fn mkdir(&mut self, dir: &str) -> Result<()> {
        let dir = normalize(dir);
        let exists = self
            .open_reader()
            .and_then(|fs| fs.is_dir(&dir))
            .map_err(|err| self.write_error(&dir, err.into()))?;
        if exists {
            log::debug!("directory {dir} already exists");
            return Ok(());
        }

        let mut cmd = self.mtools_cmd("mmd");
        // Skip on a name clash instead of asking on the terminal.
        cmd.args(["-D", "s"]);
        cmd.arg(format!("::{dir}"));
        run_cmd(cmd).map_err(|err| self.write_error(&dir, err.into()))
    }

    /// Create `dir` and all of its parents, one level at a time from the
    /// root down.
    pub fn makedirs(&mut self, dir: &str) -> Result<()> {
        let dir = normalize(dir);
        let components: Vec<&str> = dir.split('/').filter(|c| !c.is_empty()).collect();
        for depth in 1..=components.len() {
            self.mkdir(&components[..depth].join("/"))?;
        }
        Ok(())
    }

    /// Copy the host file `src` into the image at `dest`, replacing any
    /// file already there.
    pub fn insert_file(&mut self, src: &Path, dest: &str) -> Result<()> {
        let dest = normalize(dest);
        if let Some((parent, _)) = dest.rsplit_once('/') {
            let parent_exists = self
                .open_reader()
                .and_then(|fs| fs.is_dir(parent))
                .map_err(|err| self.write_error(&dest, err.into()))?;
            if !parent_exists {
                let source = StepError::MissingParent(parent.to_string());
                return Err(self.write_error(&dest, source));
            }
        }

        let mut cmd = self.mtools_cmd("mcopy");
        // Overwrite on a name clash instead of prompting.
        cmd.args(["-D", "o"]);
        cmd.arg(src).arg(format!("::{dest}"));
        run_cmd(cmd).map_err(|err| self.write_error(&dest, err.into()))
    }

    /// Open the image for reading.
    pub fn reader(&self) -> Result<FatReader<fs_err::File>> {
        Ok(self.open_reader()?)
    }

    fn open_reader(&self) -> io::Result<FatReader<fs_err::File>> {
        let file = fs_err::OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.path())?;
        FatReader::new(file)
    }
}

/// Strip leading slashes and convert host separators so that paths in
/// the image are always `/`-separated and relative to the root.
fn normalize(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches('/').to_string()
}

/// Read-only view of a FAT filesystem.
pub struct FatReader<T: ReadWriteSeek> {
    fs: FileSystem<T>,
}

impl<T: ReadWriteSeek> FatReader<T> {
    pub fn new(storage: T) -> io::Result<Self> {
        let fs = FileSystem::new(storage, FsOptions::new().update_accessed_date(false))?;
        Ok(Self { fs })
    }

    /// Whether `path` names an existing directory. The root always exists.
    pub fn is_dir(&self, path: &str) -> io::Result<bool> {
        let path = normalize(path);
        if path.is_empty() {
            return Ok(true);
        }
        match self.fs.root_dir().open_dir(&path) {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            // A regular file with that name is not a directory either.
            Err(err) => match self.fs.root_dir().open_file(&path) {
                Ok(_) => Ok(false),
                Err(_) => Err(err),
            },
        }
    }

    /// Whether `path` names an existing file or directory.
    pub fn exists(&self, path: &str) -> io::Result<bool> {
        if self.is_dir(path)? {
            return Ok(true);
        }
        match self.fs.root_dir().open_file(&normalize(path)) {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
        let mut file = self.fs.root_dir().open_file(&normalize(path))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    /// Every regular file in the filesystem, as sorted `/`-separated paths.
    pub fn list_files(&self) -> io::Result<Vec<String>> {
        let mut files = Vec::new();
        collect_files(&self.fs.root_dir(), "", &mut files)?;
        files.sort();
        Ok(files)
    }
}

fn collect_files<T: ReadWriteSeek>(
    dir: &Dir<'_, T>,
    prefix: &str,
    out: &mut Vec<String>,
) -> io::Result<()> {
    for entry in dir.iter() {
        let entry = entry?;
        let name = entry.file_name();
        if name == "." || name == ".." {
            continue;
        }
        let path = format!("{prefix}{name}");
        if entry.is_dir() {
            collect_files(&entry.to_dir(), &format!("{path}/"), out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}
