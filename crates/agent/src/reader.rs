//! Bounded line reader for the agent's stream-json stdout.
//!
//! `BufReader::lines` would buffer an arbitrarily long line in memory; a
//! misbehaving agent could emit megabytes with no newline. This reader
//! accepts at most `max_line_bytes` per line. An over-long line yields a
//! single [`LineOutcome::TooLong`] and the rest of that line is discarded
//! without buffering.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

#[derive(Debug, PartialEq, Eq)]
pub enum LineOutcome {
    Line(String),
    TooLong { limit: usize },
}

pub struct BoundedLineReader<R> {
    inner: R,
    max_line_bytes: usize,
    buf: Vec<u8>,
    /// True while discarding the remainder of an over-long line.
    skipping: bool,
}

impl<R: AsyncBufRead + Unpin> BoundedLineReader<R> {
    pub fn new(inner: R, max_line_bytes: usize) -> Self {
        Self {
            inner,
            max_line_bytes,
            buf: Vec::with_capacity(4096),
            skipping: false,
        }
    }

    /// Read the next line. Returns `None` at EOF.
    pub async fn next_line(&mut self) -> std::io::Result<Option<LineOutcome>> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                // EOF. Flush a trailing unterminated line if one is buffered.
                if self.skipping {
                    self.skipping = false;
                    return Ok(Some(LineOutcome::TooLong {
                        limit: self.max_line_bytes,
                    }));
                }
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let line = String::from_utf8_lossy(&self.buf).into_owned();
                self.buf.clear();
                return Ok(Some(LineOutcome::Line(line)));
            }

            let newline_pos = available.iter().position(|&b| b == b'\n');

            if self.skipping {
                match newline_pos {
                    Some(pos) => {
                        self.inner.consume(pos + 1);
                        self.skipping = false;
                        return Ok(Some(LineOutcome::TooLong {
                            limit: self.max_line_bytes,
                        }));
                    }
                    None => {
                        let len = available.len();
                        self.inner.consume(len);
                        continue;
                    }
                }
            }

            match newline_pos {
                Some(pos) => {
                    if self.buf.len() + pos > self.max_line_bytes {
                        self.inner.consume(pos + 1);
                        self.buf.clear();
                        return Ok(Some(LineOutcome::TooLong {
                            limit: self.max_line_bytes,
                        }));
                    }
                    self.buf.extend_from_slice(&available[..pos]);
                    self.inner.consume(pos + 1);
                    let mut line = String::from_utf8_lossy(&self.buf).into_owned();
                    if line.ends_with('\r') {
                        line.pop();
                    }
                    self.buf.clear();
                    return Ok(Some(LineOutcome::Line(line)));
                }
                None => {
                    if self.buf.len() + available.len() > self.max_line_bytes {
                        // Over budget with no newline in sight: discard until one.
                        let len = available.len();
                        self.inner.consume(len);
                        self.buf.clear();
                        self.skipping = true;
                        continue;
                    }
                    self.buf.extend_from_slice(available);
                    let len = available.len();
                    self.inner.consume(len);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    async fn collect(input: &[u8], max: usize) -> Vec<LineOutcome> {
        let mut reader = BoundedLineReader::new(BufReader::new(Cursor::new(input.to_vec())), max);
        let mut out = Vec::new();
        while let Some(outcome) = reader.next_line().await.unwrap() {
            out.push(outcome);
        }
        out
    }

    #[tokio::test]
    async fn splits_lines_and_strips_cr() {
        let lines = collect(b"one\r\ntwo\nthree", 64).await;
        assert_eq!(
            lines,
            vec![
                LineOutcome::Line("one".into()),
                LineOutcome::Line("two".into()),
                LineOutcome::Line("three".into()),
            ]
        );
    }

    #[tokio::test]
    async fn over_long_line_reported_once_and_discarded() {
        let mut input = vec![b'x'; 100];
        input.push(b'\n');
        input.extend_from_slice(b"ok\n");
        let lines = collect(&input, 10).await;
        assert_eq!(
            lines,
            vec![
                LineOutcome::TooLong { limit: 10 },
                LineOutcome::Line("ok".into()),
            ]
        );
    }

    #[tokio::test]
    async fn over_long_trailing_line_without_newline() {
        let input = vec![b'y'; 50];
        let lines = collect(&input, 10).await;
        assert_eq!(lines, vec![LineOutcome::TooLong { limit: 10 }]);
    }

    #[tokio::test]
    async fn exact_limit_is_accepted() {
        let lines = collect(b"abcde\n", 5).await;
        assert_eq!(lines, vec![LineOutcome::Line("abcde".into())]);
    }
}
