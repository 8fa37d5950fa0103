// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::error::CommandError;
use std::process::{Command, Stdio};

/// Format a `Command` as a `String`.
///
/// Example: "VAR=val program --arg1 arg2".
pub fn command_to_string(cmd: &Command) -> String {
    // Format env vars as "name=val".
    let ignore_var = ["PATH"];
    let mut parts = cmd
        .get_envs()
        // Filter out some internally-set variables that would just
        // clutter the output.
        .filter(|(name, _)| !ignore_var.contains(&name.to_str().unwrap_or_default()))
        .map(|(name, val)| {
            format!(
                "{}={}",
                name.to_string_lossy(),
                val.unwrap_or_default().to_string_lossy()
            )
        })
        .collect::<Vec<_>>();

    // Add the program name.
    parts.push(cmd.get_program().to_string_lossy().to_string());

    // Add each argument.
    parts.extend(cmd.get_args().map(|arg| arg.to_string_lossy().to_string()));

    parts.join(" ")
}

/// Log a `Command` and run it, then check that it completes
/// successfully.
///
/// Stdin is closed and stderr is captured and returned with the error
/// on failure. Closing stdin does not stop every prompt: mtools asks
/// about name clashes on `/dev/tty`, so callers pass a clash action
/// (`-D`) or avoid the clash.
pub fn run_cmd(mut cmd: Command) -> Result<(), CommandError> {
    let command = command_to_string(&cmd);
    log::info!("{command}");

    let output = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::piped())
        .output()
        .map_err(|source| CommandError::Spawn {
            command: command.clone(),
            source,
        })?;

    if output.status.success() {
        Ok(())
    } else {
        Err(CommandError::Failed {
            command,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
