//! Read adapter that mirrors consumed bytes into a secondary sink
//!
//! The delta generator parses the new tar through this adapter. While in
//! `PassThrough` mode every byte the tar reader consumes is also appended to
//! the delta as literal data, which reproduces headers, padding and
//! unmatched payloads exactly. Switching to `Discard` lets the generator
//! read file payloads it intends to encode differently.

use std::cell::Cell;
use std::io::{self, Read, Write};
use std::rc::Rc;

/// Forwarding state of a [`StealerReader`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StealMode {
    /// Bytes read are also written to the sink
    PassThrough,
    /// Bytes read are consumed silently
    Discard,
}

/// Shared handle used to toggle a reader's [`StealMode`]
#[derive(Clone)]
pub struct StealSwitch(Rc<Cell<StealMode>>);

impl StealSwitch {
    pub fn new() -> Self {
        StealSwitch(Rc::new(Cell::new(StealMode::PassThrough)))
    }

    pub fn set(&self, mode: StealMode) {
        self.0.set(mode);
    }

    pub fn mode(&self) -> StealMode {
        self.0.get()
    }
}

impl Default for StealSwitch {
    fn default() -> Self {
        Self::new()
    }
}

/// Reader wrapper feeding consumed bytes to `sink` unless switched off
pub struct StealerReader<R, S> {
    inner: R,
    sink: S,
    switch: StealSwitch,
}

impl<R: Read, S: Write> StealerReader<R, S> {
    pub fn new(inner: R, sink: S, switch: StealSwitch) -> Self {
        StealerReader {
            inner,
            sink,
            switch,
        }
    }
}

impl<R: Read, S: Write> Read for StealerReader<R, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 && self.switch.mode() == StealMode::PassThrough {
            self.sink.write_all(&buf[..n])?;
        }
        Ok(n)
    }
}
