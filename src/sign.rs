// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::error::{Error, Result, StepError};
use crate::util::run_cmd;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

/// A signed EFI executable and the identity used to sign it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SignedBinary {
    path: PathBuf,
    key: PathBuf,
    cert: PathBuf,
    label: String,
}

impl SignedBinary {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key(&self) -> &Path {
        &self.key
    }

    pub fn cert(&self) -> &Path {
        &self.cert
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Produces signed EFI executables with `sbsign`.
#[derive(Clone, Debug)]
pub struct Signer {
    out_dir: PathBuf,
    program: String,
}

impl Signer {
    /// Create a signer that writes its output into `out_dir`.
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            program: "sbsign".to_string(),
        }
    }

    /// Use a different signing tool with an `sbsign`-compatible command
    /// line.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Output path for `input` signed as `label`. The same input and
    /// label always map to the same path.
    pub fn output_path(&self, input: &Path, label: &str) -> PathBuf {
        let file_name = input
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.out_dir.join(format!("{file_name}.{label}.signed"))
    }

    /// Sign `input` with `key` and `cert`.
    ///
    /// Any failure removes whatever the tool managed to write, so a
    /// truncated output is never mistaken for a signed binary.
    pub fn sign(&self, input: &Path, key: &Path, cert: &Path, label: &str) -> Result<SignedBinary> {
        let signing_error = |source: StepError| Error::Signing {
            input: input.to_path_buf(),
            label: label.to_string(),
            source,
        };

        fs_err::create_dir_all(&self.out_dir).map_err(|err| signing_error(err.into()))?;
        let output = self.output_path(input, label);

        let mut cmd = Command::new(&self.program);
        cmd.arg("--key").arg(key);
        cmd.arg("--cert").arg(cert);
        cmd.arg("--output").arg(&output);
        cmd.arg(input);

        if let Err(err) = run_cmd(cmd) {
            discard(&output);
            return Err(signing_error(err.into()));
        }

        Ok(SignedBinary {
            path: output,
            key: key.to_path_buf(),
            cert: cert.to_path_buf(),
            label: label.to_string(),
        })
    }
}

fn discard(path: &Path) {
    match fs_err::remove_file(path) {
        Ok(()) => log::debug!("removed partial output {}", path.display()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => log::warn!("{err}"),
    }
}
