// SPDX-License-Identifier: MIT OR Apache-2.0

//! Prompt-driven verification protocols.
//!
//! A [`Check`] reacts to prompts seen on the console by following a
//! static transition table. Keeping the table separate from process
//! handling means a protocol can be exercised against any [`Console`],
//! including a scripted one.

use super::{Console, Expectation, Termination};
use crate::arch::EfiArch;
use crate::error::{Error, Result};
use regex::bytes::Regex;
use std::fmt;
use std::time::{Duration, Instant};

/// Command that shuts the VM down so the session ends with EOF.
const RESET: &str = "reset -s\r";

/// Text the console may show that a check reacts to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Prompt {
    /// Firmware splash or shell startup countdown.
    PressAnyKey,
    /// UEFI shell with no filesystem selected.
    Shell,
    /// UEFI shell on the first filesystem.
    MountedFs,
    /// The second-stage bootloader was reached.
    Bootloader,
    /// The firmware refused to execute an image.
    AccessDenied,
}

impl Prompt {
    pub fn pattern(self) -> &'static str {
        match self {
            Self::PressAnyKey => "Press .* or any other key to continue",
            Self::Shell => "Shell> ",
            Self::MountedFs => r"FS0:\\> ",
            Self::Bootloader => "grub> ",
            Self::AccessDenied => "Command Error Status: Access Denied",
        }
    }

    fn regex(self) -> Regex {
        Regex::new(self.pattern()).expect("invalid prompt pattern")
    }
}

/// Where a check is in its protocol.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    /// Waiting for prompts; the only phase of the boot-to-shell check.
    Await,
    /// The removable-media loader has not been launched yet.
    PreExec,
    /// The loader was launched. Seeing the filesystem prompt again
    /// means control came back to the shell.
    PostExec,
}

/// Input sent in response to a prompt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Action {
    Nothing,
    /// A lone escape keystroke.
    Escape,
    Line(&'static str),
    /// The shell path of the architecture's removable-media loader.
    LaunchLoader,
}

/// One row of a protocol table.
#[derive(Clone, Copy, Debug)]
pub struct Transition {
    /// Phase the row applies in; `None` matches any phase.
    pub from: Option<Phase>,
    pub on: Prompt,
    /// Next phase; `None` stays in the current one.
    pub to: Option<Phase>,
    pub action: Action,
    /// Secure Boot verdict recorded by this transition.
    pub verdict: Option<bool>,
}

const fn row(
    from: Option<Phase>,
    on: Prompt,
    to: Option<Phase>,
    action: Action,
    verdict: Option<bool>,
) -> Transition {
    Transition {
        from,
        on,
        to,
        action,
        verdict,
    }
}

/// Boot to the UEFI shell, then shut down.
///
/// The "press any key" prompt may repeat and is answered every time.
pub const BOOT_TO_SHELL: &[Transition] = &[
    row(None, Prompt::PressAnyKey, None, Action::Escape, None),
    row(None, Prompt::Shell, None, Action::Line(RESET), None),
];

/// Launch the removable-media loader from the shell and classify
/// whether the firmware let the chain reach the bootloader.
///
/// Rows are listed in pattern priority order.
pub const SECURE_BOOT: &[Transition] = &[
    row(None, Prompt::PressAnyKey, None, Action::Escape, None),
    row(None, Prompt::Shell, None, Action::Line("fs0:\r"), None),
    row(
        Some(Phase::PreExec),
        Prompt::MountedFs,
        Some(Phase::PostExec),
        Action::LaunchLoader,
        None,
    ),
    row(
        Some(Phase::PostExec),
        Prompt::MountedFs,
        None,
        Action::Line(RESET),
        None,
    ),
    row(
        None,
        Prompt::Bootloader,
        None,
        Action::Line("halt\r"),
        Some(true),
    ),
    row(None, Prompt::AccessDenied, None, Action::Nothing, Some(false)),
];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CheckKind {
    BootToShell,
    SecureBoot(EfiArch),
}

/// State of one verification run.
#[derive(Clone, Debug)]
pub struct Check {
    kind: CheckKind,
    phase: Phase,
    verdict: Option<bool>,
    last_prompt: Option<Prompt>,
}

impl Check {
    pub fn boot_to_shell() -> Self {
        Self::new(CheckKind::BootToShell)
    }

    pub fn secure_boot(arch: EfiArch) -> Self {
        Self::new(CheckKind::SecureBoot(arch))
    }

    pub fn new(kind: CheckKind) -> Self {
        let phase = match kind {
            CheckKind::BootToShell => Phase::Await,
            CheckKind::SecureBoot(_) => Phase::PreExec,
        };
        Self {
            kind,
            phase,
            verdict: None,
            last_prompt: None,
        }
    }

    pub fn kind(&self) -> CheckKind {
        self.kind
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn verdict(&self) -> Option<bool> {
        self.verdict
    }

    pub fn last_prompt(&self) -> Option<Prompt> {
        self.last_prompt
    }

    fn table(&self) -> &'static [Transition] {
        match self.kind {
            CheckKind::BootToShell => BOOT_TO_SHELL,
            CheckKind::SecureBoot(_) => SECURE_BOOT,
        }
    }

    /// Prompts this check waits for, in priority order.
    pub fn prompts(&self) -> Vec<Prompt> {
        let mut prompts = Vec::new();
        for transition in self.table() {
            if !prompts.contains(&transition.on) {
                prompts.push(transition.on);
            }
        }
        prompts
    }

    /// Apply the transition for `prompt` and return the line to send,
    /// if any.
    pub fn step(&mut self, prompt: Prompt) -> Option<String> {
        self.last_prompt = Some(prompt);

        let phase = self.phase;
        let Some(transition) = self
            .table()
            .iter()
            .find(|t| t.on == prompt && t.from.map_or(true, |from| from == phase))
        else {
            log::warn!("no transition for {prompt:?} in {phase:?}");
            return None;
        };

        if let Some(to) = transition.to {
            log::debug!("{phase:?} -> {to:?}");
            self.phase = to;
        }
        if let Some(verdict) = transition.verdict {
            log::debug!("secure boot verdict: verified={verdict}");
            self.verdict = Some(verdict);
        }

        match transition.action {
            Action::Nothing => None,
            Action::Escape => Some("\x1b".to_string()),
            Action::Line(line) => Some(line.to_string()),
            Action::LaunchLoader => match self.kind {
                CheckKind::SecureBoot(arch) => Some(format!("{}\r", arch.shell_boot_path())),
                CheckKind::BootToShell => None,
            },
        }
    }

    /// Outcome once the session has ended with `termination`.
    ///
    /// A failed exit always wins over a recorded verdict.
    pub fn finish(&self, termination: Termination) -> Outcome {
        match termination {
            Termination::Code(0) => {}
            Termination::Code(code) => return self.abnormal_exit(Some(code)),
            Termination::Signal => return self.abnormal_exit(None),
        }

        match (self.kind, self.verdict) {
            (CheckKind::BootToShell, _) => Outcome::Success,
            (CheckKind::SecureBoot(_), Some(true)) => Outcome::SecureBootVerified,
            (CheckKind::SecureBoot(_), Some(false)) => Outcome::SecureBootRejected,
            (CheckKind::SecureBoot(_), None) => Outcome::SecureBootUnknown,
        }
    }

    fn abnormal_exit(&self, code: Option<i32>) -> Outcome {
        Outcome::AbnormalExit(ExitDetail {
            code,
            last_prompt: self.last_prompt,
            verdict: self.verdict,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TimeoutDetail {
    /// Per-wait timeout that was exceeded.
    pub timeout: Duration,
    /// Time since the session started.
    pub elapsed: Duration,
    pub last_prompt: Option<Prompt>,
    pub phase: Phase,
    pub verdict: Option<bool>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExitDetail {
    /// Exit code, or `None` if the process was killed by a signal.
    pub code: Option<i32>,
    pub last_prompt: Option<Prompt>,
    /// Verdict recorded before the exit. It does not count.
    pub verdict: Option<bool>,
}

/// Result of a verification run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// Reached the shell and shut down cleanly.
    Success,
    SecureBootVerified,
    SecureBootRejected,
    /// The session ended cleanly without either Secure Boot prompt.
    SecureBootUnknown,
    Timeout(TimeoutDetail),
    AbnormalExit(ExitDetail),
}

fn describe_prompt(prompt: Option<Prompt>) -> String {
    match prompt {
        Some(prompt) => format!("{prompt:?}"),
        None => "none".to_string(),
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Success => write!(f, "booted to shell"),
            Self::SecureBootVerified => write!(f, "secure boot verified"),
            Self::SecureBootRejected => write!(f, "secure boot rejected"),
            Self::SecureBootUnknown => write!(f, "secure boot verdict unknown"),
            Self::Timeout(detail) => write!(
                f,
                "timed out after {:?} waiting for a prompt ({:.1?} into the session, \
                 last prompt: {}, phase: {:?})",
                detail.timeout,
                detail.elapsed,
                describe_prompt(detail.last_prompt),
                detail.phase
            ),
            Self::AbnormalExit(detail) => {
                match detail.code {
                    Some(code) => write!(f, "exited with code {code}")?,
                    None => write!(f, "terminated by a signal")?,
                }
                write!(f, " (last prompt: {})", describe_prompt(detail.last_prompt))
            }
        }
    }
}

/// Outcome a scenario expects.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Expected {
    Boot,
    Verified,
    Rejected,
}

impl fmt::Display for Expected {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let outcome = match self {
            Self::Boot => Outcome::Success,
            Self::Verified => Outcome::SecureBootVerified,
            Self::Rejected => Outcome::SecureBootRejected,
        };
        write!(f, "{outcome}")
    }
}

#[derive(Debug, thiserror::Error)]
#[error("expected {expected}, but {outcome}")]
pub struct UnexpectedOutcome {
    pub expected: Expected,
    pub outcome: Outcome,
}

impl Outcome {
    /// Compare against what a scenario expects.
    pub fn expect(self, expected: Expected) -> Result<(), UnexpectedOutcome> {
        let ok = matches!(
            (&self, expected),
            (Self::Success, Expected::Boot)
                | (Self::SecureBootVerified, Expected::Verified)
                | (Self::SecureBootRejected, Expected::Rejected)
        );
        if ok {
            Ok(())
        } else {
            Err(UnexpectedOutcome {
                expected,
                outcome: self,
            })
        }
    }
}

/// Drive `console` with `check` until the session ends.
///
/// Every wait for the next prompt gets its own `timeout`. Running out
/// of time terminates the session; it is never retried.
pub fn run<C: Console>(console: &mut C, check: &mut Check, timeout: Duration) -> Result<Outcome> {
    let prompts = check.prompts();
    let patterns: Vec<Regex> = prompts.iter().map(|p| p.regex()).collect();
    let start = Instant::now();

    let timed_out = |console: &mut C, check: &Check| {
        console.terminate();
        Outcome::Timeout(TimeoutDetail {
            timeout,
            elapsed: start.elapsed(),
            last_prompt: check.last_prompt(),
            phase: check.phase(),
            verdict: check.verdict(),
        })
    };

    loop {
        match console.expect(&patterns, timeout).map_err(Error::Console)? {
            Expectation::Matched(index) => {
                let prompt = prompts[index];
                log::debug!("prompt: {prompt:?}");
                if let Some(line) = check.step(prompt) {
                    log::debug!("sending {line:?}");
                    console.send_line(&line).map_err(Error::Console)?;
                }
            }
            Expectation::Eof => {
                let outcome = match console.wait(timeout).map_err(Error::Console)? {
                    Some(termination) => check.finish(termination),
                    None => timed_out(console, check),
                };
                return Ok(outcome);
            }
            Expectation::Timeout => return Ok(timed_out(console, check)),
        }
    }
}
