use std::io::{self, Write};
use std::sync::LazyLock;

use regex::Regex;
use tracing_subscriber::fmt::MakeWriter;

/// Log writer that scrubs API keys and bot tokens before they reach the sink.
///
/// Wraps any [`MakeWriter`], so it sits in front of stderr, a file appender
/// or a test buffer alike.
pub struct RedactingWriter<M> {
    inner: M,
}

impl<M> RedactingWriter<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl RedactingWriter<fn() -> io::Stderr> {
    pub fn stderr() -> Self {
        Self::new(io::stderr)
    }
}

/// Per-event writer handed out by [`RedactingWriter`].
pub struct Redacted<W> {
    inner: W,
}

impl<W: Write> Write for Redacted<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let original = String::from_utf8_lossy(buf);
        let redacted = redact_secrets(&original);
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<'a, M> MakeWriter<'a> for RedactingWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = Redacted<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        Redacted {
            inner: self.inner.make_writer(),
        }
    }
}

/// Replace OpenAI keys, Telegram bot tokens and bearer credentials with `[REDACTED]`.
pub fn redact_secrets(input: &str) -> String {
    static PATTERNS: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"(?x)
              sk-(?:proj-)?[A-Za-z0-9_\-]{20,}     # OpenAI keys
            | \d{6,12}:[A-Za-z0-9_\-]{30,}        # Telegram bot tokens
            | Bearer\s+[A-Za-z0-9_\-\.]{16,}        # Authorization headers
            ",
        )
        .expect("redaction regex should compile")
    });

    PATTERNS.replace_all(input, "[REDACTED]").into_owned()
}
