//! In-memory port and delay used by the unit tests.

use crate::error::Result;
use crate::port::Port;
use crate::protocol::bootloader::Delay;
use crate::protocol::frame::Frame;
use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::time::Duration;

/// What the device does after receiving one request frame.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    /// Answer with a well-formed, escaped frame.
    Frame(Frame),
    /// Answer with these wire bytes verbatim.
    Raw(Vec<u8>),
    /// Do not answer.
    Silence,
    /// Fail the next read that finds no data.
    ReadError(ErrorKind),
    /// Fail every read that finds no data from now on.
    Stalled(ErrorKind),
}

/// Scripted port: each flushed request releases the next queued reply.
pub(crate) struct MockPort {
    replies: VecDeque<Reply>,
    rx: VecDeque<u8>,
    current: Vec<u8>,
    frames: Vec<Vec<u8>>,
    read_error: Option<ErrorKind>,
    stalled: Option<ErrorKind>,
    fail_writes_after: Option<usize>,
    timeout: Duration,
}

impl MockPort {
    pub(crate) fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: replies.into(),
            rx: VecDeque::new(),
            current: Vec::new(),
            frames: Vec::new(),
            read_error: None,
            stalled: None,
            fail_writes_after: None,
            timeout: Duration::from_millis(1000),
        }
    }

    /// Bytes already waiting before the first request.
    pub(crate) fn with_pending(mut self, bytes: Vec<u8>) -> Self {
        self.rx.extend(bytes);
        self
    }

    /// Accept `frames` requests, then fail every write.
    pub(crate) fn fail_writes_after(mut self, frames: usize) -> Self {
        self.fail_writes_after = Some(frames);
        self
    }

    /// Wire bytes of every request written so far.
    pub(crate) fn frames(&self) -> &[Vec<u8>] {
        &self.frames
    }

    fn release_reply(&mut self) {
        match self.replies.pop_front() {
            Some(Reply::Frame(frame)) => self.rx.extend(frame.encode()),
            Some(Reply::Raw(bytes)) => self.rx.extend(bytes),
            Some(Reply::ReadError(kind)) => self.read_error = Some(kind),
            Some(Reply::Stalled(kind)) => self.stalled = Some(kind),
            Some(Reply::Silence) | None => {},
        }
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.rx.is_empty() {
            return match self.read_error.take().or(self.stalled) {
                Some(kind) => Err(io::Error::new(kind, "injected read failure")),
                None => Err(io::Error::new(ErrorKind::TimedOut, "no data")),
            };
        }

        let n = buf.len().min(self.rx.len());
        for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self
            .fail_writes_after
            .is_some_and(|limit| self.frames.len() >= limit)
        {
            return Err(io::Error::new(ErrorKind::BrokenPipe, "port unplugged"));
        }
        self.current.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.current.is_empty() {
            self.frames.push(std::mem::take(&mut self.current));
            self.release_reply();
        }
        Ok(())
    }
}

impl Port for MockPort {
    fn bytes_available(&mut self) -> Result<usize> {
        Ok(self.rx.len())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Delay that only records what was requested.
#[derive(Debug, Default)]
pub(crate) struct RecordingDelay {
    pub(crate) total: Duration,
    pub(crate) calls: usize,
}

impl Delay for RecordingDelay {
    fn delay(&mut self, duration: Duration) {
        self.total += duration;
        self.calls += 1;
    }
}
