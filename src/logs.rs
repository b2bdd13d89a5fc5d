//! # Bounded, redacting capture of worker output.
//!
//! [`LogBuffer`] is an [`io::Write`] sink for a child's combined stdout/stderr.
//! It keeps the last `N` complete lines in a ring and exposes them with
//! [`LogBuffer::latest`].
//!
//! ## Line pipeline
//! ```text
//! write(bytes) ──► pending buffer ──► split on '\n'
//!                                        │ (per complete line)
//!                                        ├─► strip '\n'
//!                                        ├─► redact sensitive literals → "***"   (skipped in debug mode)
//!                                        ├─► debug!(parent: span, line)          (if a span is attached)
//!                                        └─► ring[i % N] = line; i += 1
//! ```
//!
//! A trailing partial line stays in the pending buffer and is never exposed
//! until its newline arrives, or until it reaches [`MAX_PENDING`] bytes: then
//! it is cut and stored as a line of its own. Clones share the same ring.

use std::io;
use std::sync::{Arc, RwLock};

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use tracing::Span;

/// Replacement for every redacted literal.
pub const REDACTED: &str = "***";

/// Longest unterminated line kept before it is cut.
pub const MAX_PENDING: usize = 64 * 1024;

struct Ring {
    lines: Vec<Option<String>>,
    next: usize,
    pending: Vec<u8>,
}

struct Redactor {
    matcher: AhoCorasick,
    with: Vec<&'static str>,
}

struct Inner {
    ring: RwLock<Ring>,
    redactor: Option<Redactor>,
    span: Option<Span>,
}

/// Fixed-capacity ring of the most recent output lines.
#[derive(Clone)]
pub struct LogBuffer {
    inner: Arc<Inner>,
}

impl LogBuffer {
    /// Creates a buffer retaining up to `capacity` lines (at least one).
    ///
    /// Every occurrence of a `redact` word is replaced with [`REDACTED`] unless
    /// `debug` is set.
    ///
    /// # Panics
    /// If any `redact` word is empty: it would match everywhere.
    pub fn new<S: AsRef<str>>(capacity: usize, redact: &[S], debug: bool) -> Self {
        for w in redact {
            assert!(!w.as_ref().is_empty(), "cannot redact an empty string");
        }

        let redactor = if debug || redact.is_empty() {
            None
        } else {
            match AhoCorasickBuilder::new()
                .match_kind(MatchKind::LeftmostFirst)
                .build(redact.iter().map(AsRef::as_ref))
            {
                Ok(matcher) => Some(Redactor {
                    matcher,
                    with: vec![REDACTED; redact.len()],
                }),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to build redaction matcher; redaction disabled");
                    None
                }
            }
        };

        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Inner {
                ring: RwLock::new(Ring {
                    lines: vec![None; capacity],
                    next: 0,
                    pending: Vec::new(),
                }),
                redactor,
                span: None,
            }),
        }
    }

    /// Returns a buffer that also forwards every stored line to `span` at `DEBUG`.
    ///
    /// Must be called before the buffer is cloned or written to.
    pub fn with_span(mut self, span: Span) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.span = Some(span);
        }
        self
    }

    /// Returns retained lines, oldest first.
    ///
    /// Fewer than `capacity` lines are returned until the ring has wrapped once.
    pub fn latest(&self) -> Vec<String> {
        let ring = self.inner.ring.read().unwrap_or_else(|e| e.into_inner());
        let n = ring.lines.len();
        (0..n)
            .filter_map(|j| ring.lines[(ring.next + j) % n].clone())
            .collect()
    }

    fn push(&self, ring: &mut Ring, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw);
        let line = match &self.inner.redactor {
            Some(r) => r.matcher.replace_all(&line, &r.with),
            None => line.into_owned(),
        };

        if let Some(span) = &self.inner.span {
            tracing::debug!(parent: span, "{line}");
        }

        let n = ring.lines.len();
        let slot = ring.next % n;
        ring.lines[slot] = Some(line);
        ring.next = (slot + 1) % n;
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut ring = self.inner.ring.write().unwrap_or_else(|e| e.into_inner());
        ring.pending.extend_from_slice(buf);

        let mut start = 0;
        while let Some(pos) = ring.pending[start..].iter().position(|&b| b == b'\n') {
            let end = start + pos;
            let raw = ring.pending[start..end].to_vec();
            self.push(&mut ring, &raw);
            start = end + 1;
        }
        ring.pending.drain(..start);

        while ring.pending.len() >= MAX_PENDING {
            let raw: Vec<u8> = ring.pending.drain(..MAX_PENDING).collect();
            self.push(&mut ring, &raw);
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for LogBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBuffer")
            .field("redacting", &self.inner.redactor.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const NONE: &[&str] = &[];

    #[test]
    fn test_keeps_last_n_lines_in_order() {
        let mut b = LogBuffer::new(3, NONE, false);
        for i in 1..=5 {
            writeln!(b, "line {i}").unwrap();
        }
        assert_eq!(b.latest(), vec!["line 3", "line 4", "line 5"]);
    }

    #[test]
    fn test_returns_fewer_lines_before_wrap() {
        let mut b = LogBuffer::new(10, NONE, false);
        b.write_all(b"a\nb\n").unwrap();
        assert_eq!(b.latest(), vec!["a", "b"]);
    }

    #[test]
    fn test_partial_line_is_not_exposed() {
        let mut b = LogBuffer::new(10, NONE, false);
        b.write_all(b"hello wo").unwrap();
        assert!(b.latest().is_empty());

        b.write_all(b"rld\nnext").unwrap();
        assert_eq!(b.latest(), vec!["hello world"]);

        b.write_all(b"\n").unwrap();
        assert_eq!(b.latest(), vec!["hello world", "next"]);
    }

    #[test]
    fn test_unterminated_output_is_cut_at_max_pending() {
        let mut b = LogBuffer::new(10, NONE, false);
        b.write_all(&vec![b'x'; MAX_PENDING - 1]).unwrap();
        assert!(b.latest().is_empty());

        b.write_all(b"yz").unwrap();
        let lines = b.latest();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), MAX_PENDING);
        assert!(lines[0].ends_with('y'));

        b.write_all(b"\n").unwrap();
        assert_eq!(b.latest()[1], "z");
    }

    #[test]
    fn test_redacts_every_occurrence() {
        let mut b = LogBuffer::new(10, &["s3cret", "hunter2"], false);
        b.write_all(b"dsn=user:s3cret@host pass=hunter2 again s3cret\nclean\n")
            .unwrap();
        assert_eq!(
            b.latest(),
            vec!["dsn=user:***@host pass=*** again ***", "clean"]
        );
    }

    #[test]
    fn test_debug_mode_disables_redaction() {
        let mut b = LogBuffer::new(10, &["s3cret"], true);
        b.write_all(b"password s3cret\n").unwrap();
        assert_eq!(b.latest(), vec!["password s3cret"]);
    }

    #[test]
    #[should_panic(expected = "cannot redact an empty string")]
    fn test_empty_redact_word_panics() {
        let _ = LogBuffer::new(10, &["ok", ""], false);
    }

    #[test]
    fn test_clones_share_the_ring() {
        let b = LogBuffer::new(2, NONE, false);
        let mut w = b.clone();
        w.write_all(b"x\ny\nz\n").unwrap();
        assert_eq!(b.latest(), vec!["y", "z"]);
    }

    #[test]
    fn test_concurrent_writers() {
        let b = LogBuffer::new(1000, NONE, false);
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let mut w = b.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        writeln!(w, "t{t} {i}").unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(b.latest().len(), 400);
    }
}
