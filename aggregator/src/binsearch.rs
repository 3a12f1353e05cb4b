//! Binary search over sorted, line-oriented index files
//!
//! The search visits block-aligned offsets: seek to `n * block_size`, discard
//! the partial line, read the next full line and compare. Once the interval
//! collapses to one block, scanning restarts from the start of that block, so
//! a match straddling a block boundary is never skipped. A lookup costs
//! O(log(size / block_size)) seeks plus the lines actually returned.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

/// Default search granularity.
pub const DEFAULT_BLOCK_SIZE: u64 = 8192;

pub struct BinarySearchReader<R> {
    reader: BufReader<R>,
    size: u64,
    block_size: u64,
}

impl BinarySearchReader<File> {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::new(File::open(path)?)
    }
}

impl<R: Read + Seek> BinarySearchReader<R> {
    pub fn new(mut inner: R) -> io::Result<Self> {
        let size = inner.seek(SeekFrom::End(0))?;
        Ok(Self {
            reader: BufReader::new(inner),
            size,
            block_size: DEFAULT_BLOCK_SIZE,
        })
    }

    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    /// Byte offset of the block from which the first line `>= key` is found
    /// by a forward scan. Zero if the key sorts before the first line.
    pub fn locate(&mut self, key: &str) -> io::Result<u64> {
        let mut min = 0u64;
        let mut max = self.size / self.block_size;
        let mut line = Vec::new();

        while max - min > 1 {
            let mid = min + (max - min) / 2;
            self.reader.seek(SeekFrom::Start(mid * self.block_size))?;
            // mid > 0 always holds here: skip the partial line
            line.clear();
            self.reader.read_until(b'\n', &mut line)?;
            line.clear();
            let n = self.reader.read_until(b'\n', &mut line)?;

            if n > 0 && trim_newline(&line) < key.as_bytes() {
                min = mid;
            } else {
                max = mid;
            }
        }
        Ok(min * self.block_size)
    }

    /// Lazy line iterator from `offset` to EOF. A nonzero offset is assumed
    /// to be mid-line and the partial line is dropped.
    pub fn scan_from(mut self, offset: u64) -> io::Result<LineScanner<R>> {
        self.reader.seek(SeekFrom::Start(offset))?;
        if offset > 0 {
            let mut skipped = Vec::new();
            self.reader.read_until(b'\n', &mut skipped)?;
        }
        Ok(LineScanner {
            reader: self.reader,
            buf: Vec::new(),
        })
    }

    /// Lines in `[start, end)`, stopping at the first line past `end`.
    pub fn iter_range(self, start: &str, end: &str) -> io::Result<RangeScan<R>> {
        self.iter_range_with_prev(start, end, 0)
    }

    /// Like `iter_range` but also yields up to `prev` lines immediately before
    /// the first line `>= start` (from the located block). Summary indexes use
    /// `prev = 1` to include the block that contains `start`.
    pub fn iter_range_with_prev(
        mut self,
        start: &str,
        end: &str,
        prev: usize,
    ) -> io::Result<RangeScan<R>> {
        let offset = self.locate(start)?;
        let lines = self.scan_from(offset)?;
        Ok(RangeScan {
            lines,
            start: start.to_string(),
            stop: Stop::Before(end.to_string()),
            prev,
            pending: VecDeque::new(),
            started: false,
            done: false,
        })
    }

    /// Lines beginning with `key`. Stops at the first non-matching line.
    pub fn iter_prefix(mut self, key: &str) -> io::Result<RangeScan<R>> {
        let offset = self.locate(key)?;
        let lines = self.scan_from(offset)?;
        Ok(RangeScan {
            lines,
            start: key.to_string(),
            stop: Stop::UnlessPrefix(key.to_string()),
            prev: 0,
            pending: VecDeque::new(),
            started: false,
            done: false,
        })
    }
}

fn trim_newline(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

/// Single-pass forward line iterator.
pub struct LineScanner<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: Read> Iterator for LineScanner<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => None,
            Ok(_) => Some(Ok(String::from_utf8_lossy(trim_newline(&self.buf)).into_owned())),
            Err(e) => Some(Err(e)),
        }
    }
}

enum Stop {
    Before(String),
    UnlessPrefix(String),
}

impl Stop {
    fn should_stop(&self, line: &str) -> bool {
        match self {
            Stop::Before(end) => line >= end.as_str(),
            Stop::UnlessPrefix(prefix) => !line.starts_with(prefix.as_str()),
        }
    }
}

/// Bounded forward scan produced by `iter_range` / `iter_prefix`.
pub struct RangeScan<R> {
    lines: LineScanner<R>,
    start: String,
    stop: Stop,
    prev: usize,
    pending: VecDeque<String>,
    started: bool,
    done: bool,
}

impl<R: Read> RangeScan<R> {
    fn seek_first(&mut self) -> Option<io::Error> {
        self.started = true;
        for line in self.lines.by_ref() {
            let line = match line {
                Ok(line) => line,
                Err(e) => return Some(e),
            };
            if line.as_str() < self.start.as_str() {
                if self.prev > 0 {
                    self.pending.push_back(line);
                    if self.pending.len() > self.prev {
                        self.pending.pop_front();
                    }
                }
                continue;
            }
            if self.stop.should_stop(&line) {
                self.done = true;
            } else {
                self.pending.push_back(line);
            }
            return None;
        }
        self.done = true;
        None
    }
}

impl<R: Read> Iterator for RangeScan<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            if let Some(e) = self.seek_first() {
                self.done = true;
                return Some(Err(e));
            }
        }
        if let Some(line) = self.pending.pop_front() {
            return Some(Ok(line));
        }
        if self.done {
            return None;
        }
        match self.lines.next() {
            None => {
                self.done = true;
                None
            }
            Some(Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
            Some(Ok(line)) => {
                if self.stop.should_stop(&line) {
                    self.done = true;
                    None
                } else {
                    Some(Ok(line))
                }
            }
        }
    }
}
