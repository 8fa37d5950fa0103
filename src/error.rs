// SPDX-License-Identifier: MIT OR Apache-2.0

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

/// Failure of an external tool invocation.
///
/// The rendered command line, exit status and captured stderr are kept
/// as-is so that the caller sees exactly what the tool reported.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The tool could not be launched at all.
    #[error("failed to launch `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The tool ran but did not exit successfully.
    #[error("`{command}` failed: {status}{}", stderr_suffix(.stderr))]
    Failed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
}

fn stderr_suffix(stderr: &str) -> String {
    let stderr = stderr.trim_end();
    if stderr.is_empty() {
        String::new()
    } else {
        format!("\n{stderr}")
    }
}

/// Reason a step of fixture construction failed.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("parent directory `{0}` does not exist in the image")]
    MissingParent(String),

    #[error("no EFI system partition found in the image")]
    NoEsp,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to create FAT image {}", path.display())]
    ImageCreation {
        path: PathBuf,
        #[source]
        source: StepError,
    },

    #[error("failed to write `{dest}` into FAT image {}", path.display())]
    ImageWrite {
        path: PathBuf,
        dest: String,
        #[source]
        source: StepError,
    },

    #[error("failed to build ISO image from {}", source_image.display())]
    IsoBuild {
        source_image: PathBuf,
        #[source]
        source: StepError,
    },

    #[error("failed to sign {} as `{label}`", input.display())]
    Signing {
        input: PathBuf,
        label: String,
        #[source]
        source: StepError,
    },

    #[error("console session failed")]
    Console(#[source] io::Error),

    #[error("firmware file does not exist: {}", .0.display())]
    MissingFirmware(PathBuf),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
