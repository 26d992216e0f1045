//! # Line Reader
//!
//! Non-blocking line assembly over the RX queue. Lines end at `\n`, `\r`
//! or `\r\n`; a CRLF pair counts as a single terminator even when the two
//! bytes arrive in separate reads. A line that reaches `max_len` bytes
//! without a terminator is emitted as is.

use crate::queue::ByteQueue;

pub const DEFAULT_MAX_LINE: usize = 256;

/// Accumulates bytes across calls until a full line is available.
#[derive(Debug, Clone)]
pub struct LineReader {
    line: Vec<u8>,
    max_len: usize,
    /// Last terminator was `\r`; swallow a following `\n`.
    after_cr: bool,
}

impl Default for LineReader {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE)
    }
}

impl LineReader {
    pub fn new(max_len: usize) -> Self {
        let max_len = max_len.max(1);
        LineReader {
            line: Vec::with_capacity(max_len),
            max_len,
            after_cr: false,
        }
    }

    /// Feed one byte. Returns a completed line, without its terminator.
    pub fn push_byte(&mut self, byte: u8) -> Option<String> {
        let after_cr = std::mem::replace(&mut self.after_cr, false);
        match byte {
            b'\n' if after_cr => None,
            b'\r' => {
                self.after_cr = true;
                Some(self.take())
            }
            b'\n' => Some(self.take()),
            _ => {
                self.line.push(byte);
                (self.line.len() >= self.max_len).then(|| self.take())
            }
        }
    }

    /// Drain `queue` until a line completes or the queue runs dry.
    pub fn next_line(&mut self, queue: &mut ByteQueue) -> Option<String> {
        while let Some(byte) = queue.peek_byte() {
            queue.consume(1);
            if let Some(line) = self.push_byte(byte) {
                return Some(line);
            }
        }
        None
    }

    /// Bytes buffered towards the next line.
    pub fn pending(&self) -> usize {
        self.line.len()
    }

    pub fn clear(&mut self) {
        self.line.clear();
        self.after_cr = false;
    }

    fn take(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.line).into_owned();
        self.line.clear();
        line
    }
}
