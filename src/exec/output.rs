//! Output capture with a combined character cap, plus telemetry excerpts.

/// Combined stdout + stderr characters kept for the invoke response.
pub const DEFAULT_OUTPUT_CAP_CHARS: usize = 200_000;

/// Characters of combined output carried by the `exec.finished` event.
pub const DEFAULT_EVENT_TAIL_CHARS: usize = 20_000;

/// Appended to the stream that holds output once the cap is hit.
pub const TRUNCATION_MARKER: &str = "\n... (output truncated)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Accumulates both streams up to a shared character cap.
///
/// Characters beyond the cap are dropped and `truncated` is latched.
#[derive(Debug)]
pub struct OutputCapture {
    cap: usize,
    used: usize,
    stdout: String,
    stderr: String,
    truncated: bool,
}

/// Final captured output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
}

impl OutputCapture {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            used: 0,
            stdout: String::new(),
            stderr: String::new(),
            truncated: false,
        }
    }

    pub fn push(&mut self, stream: OutputStream, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        let remaining = self.cap.saturating_sub(self.used);
        if remaining == 0 {
            self.truncated = true;
            return;
        }

        let (kept, kept_chars) = take_chars(chunk, remaining);
        if kept.len() < chunk.len() {
            self.truncated = true;
        }
        self.used += kept_chars;
        match stream {
            OutputStream::Stdout => self.stdout.push_str(kept),
            OutputStream::Stderr => self.stderr.push_str(kept),
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn finish(self) -> CapturedOutput {
        let mut stdout = self.stdout;
        let mut stderr = self.stderr;
        if self.truncated {
            if !stdout.is_empty() || stderr.is_empty() {
                stdout.push_str(TRUNCATION_MARKER);
            } else {
                stderr.push_str(TRUNCATION_MARKER);
            }
        }
        CapturedOutput {
            stdout,
            stderr,
            truncated: self.truncated,
        }
    }
}

/// Longest prefix of `s` with at most `max` chars, and its char count.
fn take_chars(s: &str, max: usize) -> (&str, usize) {
    match s.char_indices().nth(max) {
        Some((idx, _)) => (&s[..idx], max),
        None => (s, s.chars().count()),
    }
}

/// The last `max_chars` characters of `text`.
pub fn tail_excerpt(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    text.chars().skip(total - max_chars).collect()
}

/// stdout and stderr joined for telemetry.
pub fn combine_output(stdout: &str, stderr: &str) -> String {
    match (stdout.is_empty(), stderr.is_empty()) {
        (_, true) => stdout.to_string(),
        (true, false) => stderr.to_string(),
        (false, false) => format!("{stdout}\n{stderr}"),
    }
}

/// Incremental UTF-8 decoding of a byte stream.
///
/// A multi-byte sequence split across reads is held back until completed;
/// invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush whatever is still held back.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
