//! Secret masking for log output.
//!
//! The pairing token is a bearer secret and the approvals socket token gates
//! the local approver; neither may reach a log sink or a printed config.

use regex::Regex;
use serde_json::Value;
use std::io::{self, Write};
use std::sync::LazyLock;
use tracing_subscriber::fmt::MakeWriter;

pub const REDACTED: &str = "[REDACTED]";

const SECRET_KEY_NAMES: &[&str] = &[
    "token",
    "secret",
    "password",
    "apikey",
    "api_key",
    "credentials",
];

static RE_BEARER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Bearer [a-zA-Z0-9._\-]+").expect("failed to compile regex: bearer")
});

static RE_BASIC_AUTH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Basic [a-zA-Z0-9+/=]+").expect("failed to compile regex: basic_auth")
});

static RE_QUERY_SECRET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(key|token)=([a-zA-Z0-9._\-]{8,})").expect("failed to compile regex: query_secret")
});

static RE_JSON_SECRET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(token|secret|password)"(\s*):(\s*)"[^"]*""#)
        .expect("failed to compile regex: json_secret")
});

/// Line-buffering writer that scrubs each line before passing it on.
pub struct RedactingWriter<W: Write> {
    inner: W,
    buffer: Vec<u8>,
}

const MAX_BUFFER_BYTES: usize = 8192;

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
        }
    }

    fn flush_buffer(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&self.buffer);
        let redacted = redact_string(&text);
        self.inner.write_all(redacted.as_bytes())?;
        self.buffer.fill(0);
        self.buffer.clear();
        Ok(())
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        self.buffer.extend_from_slice(buf);
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line = self.buffer.drain(..=pos).collect::<Vec<u8>>();
            line.pop();
            let text = String::from_utf8_lossy(&line);
            let redacted = redact_string(&text);
            self.inner.write_all(redacted.as_bytes())?;
            self.inner.write_all(b"\n")?;
            line.fill(0);
        }
        if self.buffer.len() > MAX_BUFFER_BYTES {
            self.flush_buffer()?;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer()?;
        self.inner.flush()
    }
}

impl<W: Write> Drop for RedactingWriter<W> {
    fn drop(&mut self) {
        let _ = self.flush_buffer();
        let _ = self.inner.flush();
    }
}

/// [`MakeWriter`] wrapper producing [`RedactingWriter`]s.
pub struct RedactingMakeWriter<M> {
    inner: M,
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
    M::Writer: Write,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer())
    }
}

pub fn redact_string(input: &str) -> String {
    if input.is_empty() {
        return String::new();
    }

    let mut result = RE_BEARER.replace_all(input, REDACTED).into_owned();
    result = RE_BASIC_AUTH.replace_all(&result, REDACTED).into_owned();
    result = RE_QUERY_SECRET
        .replace_all(&result, "$1=[REDACTED]")
        .into_owned();
    result = RE_JSON_SECRET
        .replace_all(&result, "\"$1\"$2:$3\"[REDACTED]\"")
        .into_owned();
    result
}

/// Replace string values under secret-looking keys, recursively.
pub fn redact_json_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                let lower = key.to_lowercase();
                if SECRET_KEY_NAMES.iter().any(|s| lower.contains(s)) && child.is_string() {
                    *child = Value::String(REDACTED.to_string());
                } else {
                    redact_json_value(child);
                }
            }
        }
        Value::Array(arr) => {
            for item in arr.iter_mut() {
                redact_json_value(item);
            }
        }
        _ => {}
    }
}
