// SPDX-License-Identifier: MIT OR Apache-2.0

use regex::bytes::Regex;
use std::sync::OnceLock;

/// Longest escape sequence that is held back waiting for its final
/// byte. Anything longer is treated as plain output.
const MAX_ESCAPE_LEN: usize = 32;

/// Detect ANSI escape codes. These are added by the console output
/// protocol when the firmware writes to the serial device.
fn ansi_escape() -> &'static Regex {
    static ANSI_ESCAPE: OnceLock<Regex> = OnceLock::new();
    ANSI_ESCAPE.get_or_init(|| {
        Regex::new(r"(?-u)(?:\x9b|\x1b\[)[0-?]*[ -/]*[@-~]").expect("invalid regex")
    })
}

/// Matches a tail that may still grow into a complete escape sequence.
fn escape_prefix() -> &'static Regex {
    static ESCAPE_PREFIX: OnceLock<Regex> = OnceLock::new();
    ESCAPE_PREFIX.get_or_init(|| {
        Regex::new(r"(?-u)^(?:\x9b|\x1b(?:\[[0-?]*[ -/]*)?)$").expect("invalid regex")
    })
}

/// Accumulated console output, searched for prompts.
///
/// Output arrives in arbitrary chunks, so an escape sequence may be
/// split across two of them. The unfinished tail is kept in `pending`
/// until it completes (or clearly isn't an escape sequence) and only
/// then stripped into `text`.
#[derive(Debug, Default)]
pub struct ConsoleBuffer {
    pending: Vec<u8>,
    text: Vec<u8>,
}

impl ConsoleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw output.
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        let split = unfinished_escape_start(&self.pending).unwrap_or(self.pending.len());
        let complete: Vec<u8> = self.pending.drain(..split).collect();
        self.append_stripped(&complete);
    }

    /// Release any held-back bytes. Called once the stream has ended.
    pub fn flush(&mut self) {
        let rest = std::mem::take(&mut self.pending);
        self.append_stripped(&rest);
    }

    fn append_stripped(&mut self, bytes: &[u8]) {
        let stripped = ansi_escape().replace_all(bytes, &b""[..]);
        self.text.extend_from_slice(&stripped);
    }

    /// Search for the earliest match of any of `patterns`.
    ///
    /// When two patterns match at the same offset the one listed first
    /// wins. Everything up to the end of the match is consumed, so the
    /// same prompt text is never matched twice. Returns the index of the
    /// matching pattern.
    pub fn find(&mut self, patterns: &[Regex]) -> Option<usize> {
        let (index, _, end) = patterns
            .iter()
            .enumerate()
            .filter_map(|(i, re)| re.find(&self.text).map(|m| (i, m.start(), m.end())))
            .min_by_key(|&(i, start, _)| (start, i))?;

        log::trace!(
            "consumed {:?}",
            String::from_utf8_lossy(&self.text[..end])
        );
        self.text.drain(..end);
        Some(index)
    }

    /// Stripped output that has not been consumed by a match yet.
    pub fn unmatched(&self) -> &[u8] {
        &self.text
    }
}

/// Offset of a trailing escape sequence that has not received its
/// final byte yet. Other escapes, such as `ESC 7`, are never held back.
fn unfinished_escape_start(bytes: &[u8]) -> Option<usize> {
    let start = bytes.iter().rposition(|&b| b == 0x1b || b == 0x9b)?;
    if bytes.len() - start >= MAX_ESCAPE_LEN {
        return None;
    }
    escape_prefix().is_match(&bytes[start..]).then_some(start)
}
