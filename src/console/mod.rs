// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interactive console sessions.
//!
//! A [`Session`] owns the process under test and a reader thread that
//! forwards its output. The verification protocols in [`protocol`] only
//! see the [`Console`] trait.

mod buffer;
pub mod protocol;

pub use buffer::ConsoleBuffer;
pub use protocol::{Check, CheckKind, Expected, Outcome, Phase, Prompt};

use crate::error::Result;
use crate::util::command_to_string;
use regex::bytes::Regex;
use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

/// Result of waiting for the next prompt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Expectation {
    /// Index of the pattern that matched.
    Matched(usize),
    /// The output stream ended.
    Eof,
    /// Nothing matched before the deadline.
    Timeout,
}

/// How the process under test ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Termination {
    Code(i32),
    Signal,
}

/// A text console that can be waited on and typed into.
pub trait Console {
    /// Wait up to `timeout` for the earliest match of any of `patterns`.
    fn expect(&mut self, patterns: &[Regex], timeout: Duration) -> io::Result<Expectation>;

    /// Send `line` followed by a newline.
    fn send_line(&mut self, line: &str) -> io::Result<()>;

    /// Wait up to `timeout` for the process to exit. `None` means it is
    /// still running.
    fn wait(&mut self, timeout: Duration) -> io::Result<Option<Termination>>;

    /// Stop the process and release its resources.
    fn terminate(&mut self);
}

/// Wrap a child process to automatically kill it when dropped.
struct ChildWrapper(Child);

impl ChildWrapper {
    fn terminate(&mut self) {
        // Do nothing if child has already exited (this call doesn't block).
        if matches!(self.0.try_wait(), Ok(Some(_))) {
            return;
        }

        // Try to stop the process, then wait for it to exit. Log errors
        // but otherwise ignore.
        if let Err(err) = self.0.kill() {
            log::warn!("failed to kill process: {err}");
        }
        if let Err(err) = self.0.wait() {
            log::warn!("failed to wait for process exit: {err}");
        }
    }
}

impl Drop for ChildWrapper {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Interval at which an exiting process is polled.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A live console session on a spawned process's stdin and stdout.
///
/// Dropping the session kills the process if it is still running.
pub struct Session {
    child: ChildWrapper,
    stdin: Option<ChildStdin>,
    output: Receiver<Vec<u8>>,
    buffer: ConsoleBuffer,
    eof: bool,
    echo: bool,
}

impl Session {
    /// Spawn `cmd` with piped stdin and stdout. Stderr is inherited.
    ///
    /// With `echo` set, everything the process prints is copied to our
    /// stdout as it arrives.
    pub fn spawn(mut cmd: Command, echo: bool) -> io::Result<Self> {
        log::info!("{}", command_to_string(&cmd));

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        let mut child = ChildWrapper(cmd.spawn()?);

        let stdin = child.0.stdin.take();
        let stdout = child
            .0
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdout not captured"))?;

        let (sender, output) = mpsc::channel();
        thread::Builder::new()
            .name("console-reader".into())
            .spawn(move || forward_output(stdout, sender))?;

        Ok(Self {
            child,
            stdin,
            output,
            buffer: ConsoleBuffer::new(),
            eof: false,
            echo,
        })
    }

    /// Whether the process is still running.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.0.try_wait(), Ok(None))
    }

    pub fn id(&self) -> u32 {
        self.child.0.id()
    }

    fn receive(&mut self, chunk: Vec<u8>) {
        if self.echo {
            let mut stdout = io::stdout().lock();
            // Echo is best effort.
            let _ = stdout.write_all(&chunk).and_then(|()| stdout.flush());
        }
        self.buffer.push(&chunk);
    }
}

/// Body of the reader thread: forward chunks until EOF or until the
/// session goes away.
fn forward_output(mut stdout: impl Read, sender: mpsc::Sender<Vec<u8>>) {
    let mut chunk = [0; 4096];
    loop {
        match stdout.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                if sender.send(chunk[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                log::debug!("console read failed: {err}");
                break;
            }
        }
    }
}

impl Console for Session {
    fn expect(&mut self, patterns: &[Regex], timeout: Duration) -> io::Result<Expectation> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(index) = self.buffer.find(patterns) {
                return Ok(Expectation::Matched(index));
            }
            if self.eof {
                return Ok(Expectation::Eof);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.output.recv_timeout(remaining) {
                Ok(chunk) => self.receive(chunk),
                Err(RecvTimeoutError::Timeout) => return Ok(Expectation::Timeout),
                Err(RecvTimeoutError::Disconnected) => {
                    self.eof = true;
                    self.buffer.flush();
                }
            }
        }
    }

    fn send_line(&mut self, line: &str) -> io::Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Ok(());
        };
        let result = stdin
            .write_all(line.as_bytes())
            .and_then(|()| stdin.write_all(b"\n"))
            .and_then(|()| stdin.flush());
        match result {
            // The process may already be on its way out; its exit status
            // decides the outcome, not this write.
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                log::debug!("input closed, dropped {line:?}");
                self.stdin = None;
                Ok(())
            }
            other => other,
        }
    }

    fn wait(&mut self, timeout: Duration) -> io::Result<Option<Termination>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.0.try_wait()? {
                log::debug!("process exited: {status}");
                return Ok(Some(match status.code() {
                    Some(code) => Termination::Code(code),
                    None => Termination::Signal,
                }));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    fn terminate(&mut self) {
        self.stdin = None;
        self.child.terminate();
    }
}

/// Spawn `cmd` and run `check` against its console.
pub fn verify(cmd: Command, check: &mut Check, timeout: Duration, echo: bool) -> Result<Outcome> {
    let mut session = Session::spawn(cmd, echo).map_err(crate::error::Error::Console)?;
    protocol::run(&mut session, check, timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::EfiArch;
    use crate::console::protocol::{run, ExitDetail};
    use std::collections::VecDeque;

    /// A console whose output is fixed in advance.
    enum Step {
        Output(&'static str),
        Exit(i32),
        Hang,
    }

    struct ScriptedConsole {
        script: VecDeque<Step>,
        buffer: ConsoleBuffer,
        exit: Option<i32>,
        hung: bool,
        sent: Vec<String>,
        terminated: bool,
    }

    impl ScriptedConsole {
        fn new(script: Vec<Step>) -> Self {
            Self {
                script: script.into(),
                buffer: ConsoleBuffer::new(),
                exit: None,
                hung: false,
                sent: Vec::new(),
                terminated: false,
            }
        }

        fn count_sent(&self, line: &str) -> usize {
            self.sent.iter().filter(|sent| *sent == line).count()
        }
    }

    impl Console for ScriptedConsole {
        fn expect(&mut self, patterns: &[Regex], _timeout: Duration) -> io::Result<Expectation> {
            loop {
                if let Some(index) = self.buffer.find(patterns) {
                    return Ok(Expectation::Matched(index));
                }
                match self.script.pop_front() {
                    Some(Step::Output(text)) => self.buffer.push(text.as_bytes()),
                    Some(Step::Exit(code)) => {
                        self.exit = Some(code);
                        return Ok(Expectation::Eof);
                    }
                    Some(Step::Hang) | None => {
                        self.hung = true;
                        return Ok(Expectation::Timeout);
                    }
                }
            }
        }

        fn send_line(&mut self, line: &str) -> io::Result<()> {
            self.sent.push(line.to_string());
            Ok(())
        }

        fn wait(&mut self, _timeout: Duration) -> io::Result<Option<Termination>> {
            Ok(self.exit.map(Termination::Code))
        }

        fn terminate(&mut self) {
            self.terminated = true;
        }
    }

    const PRESS_ANY_KEY: &str =
        "Press ESC in 5 seconds to skip startup.nsh or any other key to continue.\r\n";
    const TIMEOUT: Duration = Duration::from_secs(60);

    #[test]
    fn test_boot_to_shell_success() {
        let mut console = ScriptedConsole::new(vec![
            Step::Output(PRESS_ANY_KEY),
            Step::Output(PRESS_ANY_KEY),
            Step::Output(PRESS_ANY_KEY),
            Step::Output("\x1b[0m\x1b[37m\x1b[40mShell> "),
            Step::Exit(0),
        ]);
        let mut check = Check::boot_to_shell();

        let outcome = run(&mut console, &mut check, TIMEOUT).unwrap();
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(console.count_sent("\x1b"), 3);
        assert_eq!(console.count_sent("reset -s\r"), 1);
        assert_eq!(console.sent.len(), 4);
    }

    #[test]
    fn test_press_any_key_in_one_chunk() {
        let mut console = ScriptedConsole::new(vec![
            Step::Output(
                "Press ESC or any other key to continue\r\nPress ESC or any other key to continue\r\n",
            ),
            Step::Output("Shell> "),
            Step::Exit(0),
        ]);
        let outcome = run(&mut console, &mut Check::boot_to_shell(), TIMEOUT).unwrap();
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(console.count_sent("\x1b"), 2);
    }

    #[test]
    fn test_secure_boot_rejected() {
        let mut console = ScriptedConsole::new(vec![
            Step::Output("Shell> "),
            Step::Output("FS0:\\> "),
            Step::Output("Command Error Status: Access Denied\r\n"),
            Step::Exit(0),
        ]);
        let mut check = Check::secure_boot(EfiArch::X64);

        let outcome = run(&mut console, &mut check, TIMEOUT).unwrap();
        assert_eq!(outcome, Outcome::SecureBootRejected);
        assert_eq!(console.sent, ["fs0:\r", "\\efi\\boot\\bootx64.efi\r"]);
    }

    #[test]
    fn test_secure_boot_verified() {
        let mut console = ScriptedConsole::new(vec![
            Step::Output(PRESS_ANY_KEY),
            Step::Output("Shell> "),
            Step::Output("FS0:\\> "),
            Step::Output("GNU GRUB  version 2.06\r\n\r\ngrub> "),
            Step::Exit(0),
        ]);
        let mut check = Check::secure_boot(EfiArch::AA64);

        let outcome = run(&mut console, &mut check, TIMEOUT).unwrap();
        assert_eq!(outcome, Outcome::SecureBootVerified);
        assert_eq!(
            console.sent,
            ["\x1b", "fs0:\r", "\\efi\\boot\\bootaa64.efi\r", "halt\r"]
        );
    }

    #[test]
    fn test_secure_boot_bounce_back() {
        // The loader returned to the shell without reaching GRUB and
        // without an explicit denial.
        let mut console = ScriptedConsole::new(vec![
            Step::Output("Shell> "),
            Step::Output("FS0:\\> "),
            Step::Output("FS0:\\> "),
            Step::Exit(0),
        ]);
        let mut check = Check::secure_boot(EfiArch::X64);

        let outcome = run(&mut console, &mut check, TIMEOUT).unwrap();
        assert_eq!(outcome, Outcome::SecureBootUnknown);
        assert!(outcome.expect(Expected::Rejected).is_err());
        assert_eq!(console.sent.last().map(String::as_str), Some("reset -s\r"));
    }

    #[test]
    fn test_abnormal_exit_overrides_verdict() {
        let mut console = ScriptedConsole::new(vec![
            Step::Output("Shell> "),
            Step::Output("FS0:\\> "),
            Step::Output("grub> "),
            Step::Exit(1),
        ]);
        let mut check = Check::secure_boot(EfiArch::X64);

        let outcome = run(&mut console, &mut check, TIMEOUT).unwrap();
        assert_eq!(
            outcome,
            Outcome::AbnormalExit(ExitDetail {
                code: Some(1),
                last_prompt: Some(Prompt::Bootloader),
                verdict: Some(true),
            })
        );

        let mut console = ScriptedConsole::new(vec![Step::Output("Shell> "), Step::Exit(2)]);
        let outcome = run(&mut console, &mut Check::boot_to_shell(), TIMEOUT).unwrap();
        assert!(matches!(
            outcome,
            Outcome::AbnormalExit(ExitDetail { code: Some(2), .. })
        ));
    }

    #[test]
    fn test_timeout_terminates() {
        let mut console = ScriptedConsole::new(vec![Step::Output("Shell> "), Step::Hang]);
        let mut check = Check::secure_boot(EfiArch::X64);

        let outcome = run(&mut console, &mut check, TIMEOUT).unwrap();
        match outcome {
            Outcome::Timeout(detail) => {
                assert_eq!(detail.timeout, TIMEOUT);
                assert_eq!(detail.last_prompt, Some(Prompt::Shell));
                assert_eq!(detail.phase, Phase::PreExec);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(console.hung);
        assert!(console.terminated);
    }

    #[cfg(unix)]
    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }

    #[cfg(unix)]
    #[test]
    fn test_session_boot_to_shell() {
        // Answers are read back so that the test fails if the keystrokes
        // never arrive.
        let script = r#"
            printf 'Press ESC in 1 seconds or any other key to continue\r\n'
            read key
            printf 'Shell> '
            read cmd
            [ "$cmd" = "$(printf 'reset -s\r')" ] || exit 9
        "#;
        let mut check = Check::boot_to_shell();
        let outcome = verify(sh(script), &mut check, Duration::from_secs(10), false).unwrap();
        assert_eq!(outcome, Outcome::Success);
    }

    #[cfg(unix)]
    #[test]
    fn test_session_reports_exit_code() {
        let mut check = Check::boot_to_shell();
        let outcome = verify(sh("exit 3"), &mut check, Duration::from_secs(10), false).unwrap();
        assert!(matches!(
            outcome,
            Outcome::AbnormalExit(ExitDetail { code: Some(3), last_prompt: None, .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_session_secure_boot_rejected() {
        let script = r#"
            printf 'Shell> '
            read cmd
            printf 'FS0:\\> '
            read cmd
            printf 'Command Error Status: Access Denied\r\n'
        "#;
        let mut check = Check::secure_boot(EfiArch::X64);
        let outcome = verify(sh(script), &mut check, Duration::from_secs(10), false).unwrap();
        assert_eq!(outcome, Outcome::SecureBootRejected);
    }

    #[cfg(unix)]
    #[test]
    fn test_session_timeout_releases_process() {
        let mut session = Session::spawn(sh("exec sleep 30"), false).unwrap();
        let mut check = Check::boot_to_shell();
        let timeout = Duration::from_millis(200);

        let start = Instant::now();
        let outcome = run(&mut session, &mut check, timeout).unwrap();
        assert!(start.elapsed() < Duration::from_secs(10));
        match outcome {
            Outcome::Timeout(detail) => {
                assert_eq!(detail.timeout, timeout);
                assert_eq!(detail.last_prompt, None);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!session.is_running());
    }
}
