// SPDX-License-Identifier: MPL-2.0

//! The bounded pipe: a fixed-size circular byte buffer shared by a reader
//! and a writer endpoint.
//!
//! Grounded on `examples/original_source/tinyos3/kernel_pipe.c`
//! (`pipe_write`/`pipe_read`/`pipe_reader_close`/`pipe_writer_close`) for the
//! blocking contract, and on the reader/writer-endpoint split in
//! `examples/asterinas-asterinas/kernel/src/fs/pipe/common.rs` for the shape
//! of the Rust types (`PipeReader`/`PipeWriter` wrapping a shared inner
//! state rather than the C version's single `PIPE_CB` reached through two
//! different FCBs). Endpoint lifetime is reference-counted by `Arc` rather
//! than an explicit C-style free: once both `PipeReader` and `PipeWriter`
//! (and their FCB wrappers) have dropped, the buffer itself is freed.

use std::any::Any;
use std::sync::{Arc, Condvar, Mutex};

use crate::config::PIPE_BUFFER_SIZE;
use crate::error::Errno;
use crate::ids::Fid;
use crate::prelude::Result;
use crate::return_errno_with_message;
use crate::stream::{self, Stream};

struct PipeInner {
    buffer: Box<[u8; PIPE_BUFFER_SIZE]>,
    read_pos: usize,
    write_pos: usize,
    byte_count: usize,
    reader_present: bool,
    writer_present: bool,
}

pub(crate) struct PipeHandle {
    inner: Mutex<PipeInner>,
    has_space: Condvar,
    has_data: Condvar,
}

impl PipeHandle {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(PipeHandle {
            inner: Mutex::new(PipeInner {
                buffer: Box::new([0u8; PIPE_BUFFER_SIZE]),
                read_pos: 0,
                write_pos: 0,
                byte_count: 0,
                reader_present: true,
                writer_present: true,
            }),
            has_space: Condvar::new(),
            has_data: Condvar::new(),
        })
    }
}

pub(crate) fn blocking_write(h: &PipeHandle, buf: &[u8]) -> Result<usize> {
    let mut inner = h.inner.lock().unwrap();
    if !inner.writer_present || !inner.reader_present {
        return_errno_with_message!(Errno::EPIPE, "no reader for this pipe");
    }
    if buf.is_empty() {
        return Ok(0);
    }
    while inner.byte_count == PIPE_BUFFER_SIZE {
        h.has_data.notify_all();
        inner = h.has_space.wait(inner).unwrap();
        if !inner.writer_present || !inner.reader_present {
            return_errno_with_message!(Errno::EPIPE, "reader closed while writer was blocked");
        }
    }
    let free = PIPE_BUFFER_SIZE - inner.byte_count;
    let n = buf.len().min(free);
    let mask = PIPE_BUFFER_SIZE - 1;
    for (i, &b) in buf[..n].iter().enumerate() {
        let pos = (inner.write_pos + i) & mask;
        inner.buffer[pos] = b;
    }
    inner.write_pos = (inner.write_pos + n) & mask;
    inner.byte_count += n;
    h.has_data.notify_all();
    Ok(n)
}

pub(crate) fn blocking_read(h: &PipeHandle, buf: &mut [u8]) -> Result<usize> {
    let mut inner = h.inner.lock().unwrap();
    if !inner.reader_present {
        return_errno_with_message!(Errno::EBADF, "reader endpoint already closed");
    }
    if buf.is_empty() {
        return Ok(0);
    }
    while inner.byte_count == 0 && inner.writer_present {
        h.has_space.notify_all();
        inner = h.has_data.wait(inner).unwrap();
    }
    if inner.byte_count == 0 {
        // Writer is gone and the buffer is drained: end of stream.
        return Ok(0);
    }
    let n = buf.len().min(inner.byte_count);
    let mask = PIPE_BUFFER_SIZE - 1;
    for i in 0..n {
        let pos = (inner.read_pos + i) & mask;
        buf[i] = inner.buffer[pos];
    }
    inner.read_pos = (inner.read_pos + n) & mask;
    inner.byte_count -= n;
    h.has_space.notify_all();
    Ok(n)
}

pub(crate) fn writer_close(h: &PipeHandle) {
    let mut inner = h.inner.lock().unwrap();
    if !inner.writer_present {
        return;
    }
    inner.writer_present = false;
    if inner.reader_present {
        h.has_data.notify_all();
    }
}

pub(crate) fn reader_close(h: &PipeHandle) {
    let mut inner = h.inner.lock().unwrap();
    if !inner.reader_present {
        return;
    }
    inner.reader_present = false;
    if inner.writer_present {
        h.has_space.notify_all();
    }
}

pub(crate) struct PipeReader(Arc<PipeHandle>);
pub(crate) struct PipeWriter(Arc<PipeHandle>);

impl Stream for PipeReader {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        blocking_read(&self.0, buf)
    }

    fn close(&self) -> Result<()> {
        reader_close(&self.0);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Stream for PipeWriter {
    fn write(&self, buf: &[u8]) -> Result<usize> {
        blocking_write(&self.0, buf)
    }

    fn close(&self) -> Result<()> {
        writer_close(&self.0);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Creates a pipe: two fids in the calling process, one readable, one
/// writable, sharing one buffer. Reservation of both fids is atomic with
/// installing the streams — if either step after reservation fails, both
/// are released rather than leaking a half-built pipe.
pub fn pipe_create() -> Result<(Fid, Fid)> {
    let pairs = stream::reserve(2)?;
    let handle = PipeHandle::new();
    let reader: Arc<dyn Stream> = Arc::new(PipeReader(handle.clone()));
    let writer: Arc<dyn Stream> = Arc::new(PipeWriter(handle));
    stream::install_stream(pairs[0].1, reader);
    stream::install_stream(pairs[1].1, writer);
    Ok((pairs[0].0, pairs[1].0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let h = PipeHandle::new();
        let n = blocking_write(&h, b"hello").unwrap();
        assert_eq!(n, 5);
        let mut buf = [0u8; 5];
        let n = blocking_read(&h, &mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn read_after_writer_close_drains_then_eof() {
        let h = PipeHandle::new();
        blocking_write(&h, b"ab").unwrap();
        writer_close(&h);
        let mut buf = [0u8; 2];
        assert_eq!(blocking_read(&h, &mut buf).unwrap(), 2);
        let mut buf = [0u8; 1];
        assert_eq!(blocking_read(&h, &mut buf).unwrap(), 0);
    }

    #[test]
    fn write_after_reader_close_is_epipe() {
        let h = PipeHandle::new();
        reader_close(&h);
        let err = blocking_write(&h, b"x").unwrap_err();
        assert_eq!(err.error(), Errno::EPIPE);
    }

    #[test]
    fn empty_buffer_is_a_no_op() {
        let h = PipeHandle::new();
        assert_eq!(blocking_write(&h, &[]).unwrap(), 0);
        assert_eq!(blocking_read(&h, &mut []).unwrap(), 0);
    }

    #[test]
    fn empty_write_still_fails_once_the_reader_is_gone() {
        let h = PipeHandle::new();
        reader_close(&h);
        let err = blocking_write(&h, &[]).unwrap_err();
        assert_eq!(err.error(), Errno::EPIPE);
    }

    #[test]
    fn empty_read_still_fails_on_an_already_closed_reader_endpoint() {
        let h = PipeHandle::new();
        reader_close(&h);
        let err = blocking_read(&h, &mut []).unwrap_err();
        assert_eq!(err.error(), Errno::EBADF);
    }

    #[test]
    fn fills_and_drains_across_the_wraparound_boundary() {
        let h = PipeHandle::new();
        let chunk = vec![0xAAu8; PIPE_BUFFER_SIZE - 4];
        blocking_write(&h, &chunk).unwrap();
        let mut drain = vec![0u8; PIPE_BUFFER_SIZE - 4];
        blocking_read(&h, &mut drain).unwrap();
        // write_pos/read_pos are now near the end; this write wraps around.
        let n = blocking_write(&h, b"wraparound").unwrap();
        assert_eq!(n, 10);
        let mut out = vec![0u8; 10];
        assert_eq!(blocking_read(&h, &mut out).unwrap(), 10);
        assert_eq!(out, b"wraparound");
    }
}
