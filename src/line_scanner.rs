//! `LineScanner` (C3): byte-segment to UTF-8 line splitter.
//!
//! Splits on `CR`, `LF`, and `CRLF`, dispatching each completed line, then a
//! residual line (if any) and a final EOS marker on close.

use crate::error::Result;

const CR: u8 = b'\r';
const LF: u8 = b'\n';

/// Streaming UTF-8 decoder. `CR`/`LF` bytes can never appear as part of a
/// multi-byte sequence, so line boundaries never bisect a codepoint; a
/// sequence left incomplete at `flush` is replaced with U+FFFD, matching the
/// external UTF-8 oracle's "doFinal" contract.
#[derive(Default)]
struct Utf8Incremental {
    pending: Vec<u8>,
}

impl Utf8Incremental {
    fn consume(&mut self, byte: u8, builder: &mut String) {
        self.pending.push(byte);
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    builder.push_str(valid);
                    self.pending.clear();
                    return;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    if valid_up_to > 0 {
                        // SAFETY: `valid_up_to` bytes were just confirmed valid by `from_utf8`.
                        let valid = unsafe {
                            std::str::from_utf8_unchecked(&self.pending[..valid_up_to])
                        };
                        builder.push_str(valid);
                    }
                    match e.error_len() {
                        None => {
                            // Incomplete sequence at the end; wait for more bytes.
                            self.pending.drain(..valid_up_to);
                            return;
                        }
                        Some(bad_len) => {
                            builder.push('\u{FFFD}');
                            self.pending.drain(..valid_up_to + bad_len);
                            if self.pending.is_empty() {
                                return;
                            }
                            // Reprocess whatever remains after the invalid run.
                        }
                    }
                }
            }
        }
    }

    fn flush(&mut self, builder: &mut String) {
        if !self.pending.is_empty() {
            builder.push('\u{FFFD}');
            self.pending.clear();
        }
    }
}

/// Splits a byte stream into UTF-8 lines on `CR`/`LF`/`CRLF` boundaries.
///
/// The scanner owns only the splitting state (builder, decoder, `skip_lf`);
/// it does *not* own where completed lines go. Each call to [`on_data`] or
/// [`close`] takes a `sink` closure, so a caller whose set of downstream
/// line feeds can change between calls (the dispatcher, §4.4) always routes
/// through the current set without the scanner needing to know about it.
///
/// [`on_data`]: LineScanner::on_data
/// [`close`]: LineScanner::close
pub struct LineScanner {
    skip_lf: bool,
    decoder: Utf8Incremental,
    builder: String,
    closed: bool,
    max_len_watermark: usize,
}

impl LineScanner {
    pub fn new() -> Self {
        LineScanner {
            skip_lf: false,
            decoder: Utf8Incremental::default(),
            builder: String::new(),
            closed: false,
            max_len_watermark: 0,
        }
    }

    /// Feed a byte segment, calling `sink` once per completed line. A
    /// segment may contain zero, one, or many complete lines; consumers
    /// must not assume any particular granularity beyond CR/LF/CRLF
    /// splitting.
    pub fn on_data(&mut self, bytes: &[u8], mut sink: impl FnMut(Option<String>) -> Result<()>) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        for &byte in bytes {
            let was_skip_lf = self.skip_lf;
            self.skip_lf = false;
            if was_skip_lf && byte == LF {
                // Completes a CRLF pair whose CR already emitted a line.
                continue;
            }
            match byte {
                CR => {
                    self.emit(&mut sink)?;
                    self.skip_lf = true;
                }
                LF => self.emit(&mut sink)?,
                other => self.decoder.consume(other, &mut self.builder),
            }
            self.max_len_watermark = self.max_len_watermark.max(self.builder.len());
        }
        Ok(())
    }

    fn emit(&mut self, sink: &mut impl FnMut(Option<String>) -> Result<()>) -> Result<()> {
        self.decoder.flush(&mut self.builder);
        let line = std::mem::take(&mut self.builder);
        sink(Some(line))
    }

    /// Finalize: flush any pending partial line, then dispatch EOS (`None`).
    /// Idempotent — re-entry after close is a no-op.
    pub fn close(&mut self, mut sink: impl FnMut(Option<String>) -> Result<()>) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.decoder.flush(&mut self.builder);
        let result = if !self.builder.is_empty() {
            let line = std::mem::take(&mut self.builder);
            sink(Some(line)).and_then(|()| sink(None))
        } else {
            sink(None)
        };
        self.zero_builder();
        self.closed = true;
        result
    }

    /// Zero the builder's backing bytes up to the longest length ever
    /// observed, so a line containing secrets does not linger in the heap
    /// after the scanner is done with it.
    fn zero_builder(&mut self) {
        if self.max_len_watermark == 0 {
            return;
        }
        // SAFETY: we extend to `zero_len <= capacity`, overwrite every byte
        // with 0 (valid UTF-8, trivially), then shrink back to an empty,
        // valid `String` before any other code can observe it.
        unsafe {
            let vec = self.builder.as_mut_vec();
            let zero_len = self.max_len_watermark.min(vec.capacity());
            vec.set_len(zero_len);
            for b in vec.iter_mut() {
                *b = 0;
            }
            vec.set_len(0);
        }
    }
}

impl Default for LineScanner {
    fn default() -> Self {
        LineScanner::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn collect_lines(input: &[u8]) -> Vec<Option<String>> {
        let lines = RefCell::new(Vec::new());
        let mut scanner = LineScanner::new();
        scanner
            .on_data(input, |line| {
                lines.borrow_mut().push(line);
                Ok(())
            })
            .unwrap();
        scanner
            .close(|line| {
                lines.borrow_mut().push(line);
                Ok(())
            })
            .unwrap();
        lines.into_inner()
    }

    #[test]
    fn splits_cr_lf_and_crlf_then_eos() {
        let lines = collect_lines(b"a\rb\nc\r\nd");
        assert_eq!(
            lines,
            vec![
                Some("a".to_string()),
                Some("b".to_string()),
                Some("c".to_string()),
                Some("d".to_string()),
                None,
            ]
        );
    }

    #[test]
    fn segment_with_zero_complete_lines_buffers() {
        let lines = RefCell::new(Vec::new());
        let mut scanner = LineScanner::new();
        scanner
            .on_data(b"partial", |line| {
                lines.borrow_mut().push(line);
                Ok(())
            })
            .unwrap();
        assert!(lines.borrow().is_empty());
        scanner
            .close(|line| {
                lines.borrow_mut().push(line);
                Ok(())
            })
            .unwrap();
        assert_eq!(*lines.borrow(), vec![Some("partial".to_string()), None]);
    }

    #[test]
    fn close_is_idempotent() {
        let calls = RefCell::new(0);
        let mut scanner = LineScanner::new();
        let sink = |_: Option<String>| -> Result<()> {
            Ok(())
        };
        scanner.on_data(b"x\n", sink).unwrap();
        scanner
            .close(|_| {
                *calls.borrow_mut() += 1;
                Ok(())
            })
            .unwrap();
        let after_first = *calls.borrow();
        scanner
            .close(|_| {
                *calls.borrow_mut() += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(*calls.borrow(), after_first, "second close must be a no-op");
    }

    #[test]
    fn multibyte_utf8_split_across_data_calls_decodes_correctly() {
        let bytes = "héllo\n".as_bytes().to_vec();
        let (first, second) = bytes.split_at(2); // splits inside the 2-byte 'é'
        let lines = RefCell::new(Vec::new());
        let mut scanner = LineScanner::new();
        let push = |line: Option<String>| -> Result<()> {
            lines.borrow_mut().push(line);
            Ok(())
        };
        scanner.on_data(first, push).unwrap();
        scanner.on_data(second, push).unwrap();
        scanner.close(push).unwrap();
        assert_eq!(*lines.borrow(), vec![Some("héllo".to_string()), None]);
    }

    #[test]
    fn empty_input_still_dispatches_eos_on_close() {
        let lines = collect_lines(b"");
        assert_eq!(lines, vec![None]);
    }
}
