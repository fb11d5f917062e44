// SPDX-License-Identifier: MPL-2.0

//! The stream layer: a process-wide pool of file control blocks (FCBs), a
//! per-process table of file ids (fids) pointing into that pool, and the
//! `Stream` capability every concrete stream (pipe endpoint, socket, the
//! process-info stream) implements.
//!
//! Grounded on `examples/original_source/tinyos3/kernel_streams.h`'s
//! documented contract for `FCB_reserve`/`FCB_unreserve`/`get_fcb`/
//! `FCB_incref`/`FCB_decref`. The C header dispatches through a `file_ops`
//! struct of four function pointers; a trait object is the natural Rust
//! stand-in. `Arc<dyn Stream>` rather than
//! `Box<dyn Stream>` so the pool can hand out a cheap clone of the handle and
//! let the actual blocking read/write happen without holding the table lock.

use std::any::Any;
use std::sync::Arc;

use log::{trace, warn};

use crate::error::{Errno, Error};
use crate::ids::{Fid, Pid};
use crate::prelude::Result;
use crate::process::{self, TABLES};
use crate::return_errno_with_message;

/// A stream capability: something an fid can point at. `read`/`write` block
/// the calling OS thread as needed; `close` never blocks (it only severs
/// this endpoint and wakes whoever was waiting on the other side).
pub trait Stream: Send + Sync {
    fn read(&self, _buf: &mut [u8]) -> Result<usize> {
        return_errno_with_message!(Errno::EINVAL, "stream does not support read")
    }

    fn write(&self, _buf: &[u8]) -> Result<usize> {
        return_errno_with_message!(Errno::EINVAL, "stream does not support write")
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Lets socket syscalls recover the concrete `SocketHandle` behind a
    /// `Stream` trait object without a second, stream-kind-specific table.
    fn as_any(&self) -> &dyn Any;
}

pub(crate) struct FcbSlot {
    pub(crate) refcount: usize,
    pub(crate) stream: Option<Arc<dyn Stream>>,
}

fn no_fcb() -> Error {
    Error::with_message(Errno::ENFILE, "fcb pool exhausted")
}

fn no_fid() -> Error {
    Error::with_message(Errno::EMFILE, "no free file-id slots in the calling process")
}

fn bad_fid() -> Error {
    Error::with_message(Errno::EBADF, "fid not open in the calling process")
}

/// Atomically reserves `n` fids in the calling process and `n` matching
/// slots in the global FCB pool. The returned pairs have `refcount == 1` and
/// no installed stream; the caller must follow up with [`install_stream`]
/// for each one, or [`unreserve`] to give them back on a later failure.
pub(crate) fn reserve(n: usize) -> Result<Vec<(Fid, usize)>> {
    let pcb = process::current_pcb()?;
    let mut tables = TABLES.lock().unwrap();
    if tables.fcb_free.len() < n {
        warn!("stream::reserve: fcb pool exhausted ({n} slot(s) requested)");
        return Err(no_fcb());
    }

    let mut inner = pcb.inner.lock().unwrap();
    let mut fids = Vec::with_capacity(n);
    for (fid, slot) in inner.fids.iter().enumerate() {
        if slot.is_none() {
            fids.push(fid);
            if fids.len() == n {
                break;
            }
        }
    }
    if fids.len() < n {
        warn!("stream::reserve: pid {} has no free fid slots", pcb.pid);
        return Err(no_fid());
    }

    let mut pairs = Vec::with_capacity(n);
    for fid in fids {
        let fcb_idx = tables.fcb_free.pop().expect("checked above");
        tables.fcbs[fcb_idx] = Some(FcbSlot {
            refcount: 1,
            stream: None,
        });
        inner.fids[fid] = Some(fcb_idx);
        pairs.push((fid, fcb_idx));
    }
    Ok(pairs)
}

/// Rolls back a partial or whole [`reserve`] that a construction failed to
/// finish (e.g. `Pipe` allocating two endpoints and failing on the second).
pub(crate) fn unreserve(pairs: &[(Fid, usize)]) {
    if pairs.is_empty() {
        return;
    }
    let pcb = match process::current_pcb() {
        Ok(p) => p,
        Err(_) => return,
    };
    let mut tables = TABLES.lock().unwrap();
    let mut inner = pcb.inner.lock().unwrap();
    for &(fid, fcb_idx) in pairs {
        tables.fcbs[fcb_idx] = None;
        tables.fcb_free.push(fcb_idx);
        inner.fids[fid] = None;
    }
}

pub(crate) fn install_stream(fcb_idx: usize, stream: Arc<dyn Stream>) {
    let mut tables = TABLES.lock().unwrap();
    if let Some(slot) = tables.fcbs[fcb_idx].as_mut() {
        slot.stream = Some(stream);
    }
}

fn fcb_idx_for(pid: Pid, fid: Fid) -> Result<usize> {
    let pcb = process::pcb_for(pid)?;
    let inner = pcb.inner.lock().unwrap();
    inner.fids.get(fid).copied().flatten().ok_or_else(bad_fid)
}

pub(crate) fn stream_for(pid: Pid, fid: Fid) -> Result<Arc<dyn Stream>> {
    let fcb_idx = fcb_idx_for(pid, fid)?;
    let tables = TABLES.lock().unwrap();
    tables.fcbs[fcb_idx]
        .as_ref()
        .and_then(|slot| slot.stream.clone())
        .ok_or_else(bad_fid)
}

/// Increments an FCB's reference count, e.g. when a second fid is pointed at
/// the same stream (not currently exposed as a syscall but kept for
/// completeness, mirroring `FCB_incref` in the source contract).
#[allow(dead_code)]
pub(crate) fn incref(fcb_idx: usize) {
    let mut tables = TABLES.lock().unwrap();
    if let Some(slot) = tables.fcbs[fcb_idx].as_mut() {
        slot.refcount += 1;
    }
}

/// Decrements an FCB's reference count; once it reaches zero, closes the
/// underlying stream and returns the slot to the pool's free list.
pub(crate) fn decref(fcb_idx: usize) {
    let closing = {
        let mut tables = TABLES.lock().unwrap();
        let slot = match tables.fcbs[fcb_idx].as_mut() {
            Some(s) => s,
            None => return,
        };
        slot.refcount = slot.refcount.saturating_sub(1);
        if slot.refcount > 0 {
            return;
        }
        let stream = tables.fcbs[fcb_idx].take().and_then(|s| s.stream);
        tables.fcb_free.push(fcb_idx);
        stream
    };
    if let Some(stream) = closing {
        let _ = stream.close();
    }
}

/// Reads from the stream bound to `fid` in the calling process.
pub fn read(fid: Fid, buf: &mut [u8]) -> Result<usize> {
    let pid = process::getpid()?;
    stream_for(pid, fid)?.read(buf)
}

/// Writes to the stream bound to `fid` in the calling process.
pub fn write(fid: Fid, buf: &[u8]) -> Result<usize> {
    let pid = process::getpid()?;
    stream_for(pid, fid)?.write(buf)
}

/// Closes `fid` in process `pid`: unbinds it from the process's fid table
/// and decrefs the underlying FCB. Used both by the public `Close` syscall
/// (on the calling process) and by process teardown (on an exiting, not
/// necessarily current, process).
pub(crate) fn close(pid: Pid, fid: Fid) -> Result<()> {
    let pcb = process::pcb_for(pid)?;
    let fcb_idx = {
        let mut inner = pcb.inner.lock().unwrap();
        inner
            .fids
            .get_mut(fid)
            .and_then(|slot| slot.take())
            .ok_or_else(bad_fid)?
    };
    trace!("stream::close: pid {pid} closing fid {fid} (fcb {fcb_idx})");
    decref(fcb_idx);
    Ok(())
}

/// Closes `fid` in the calling process. The public `Close` syscall.
pub fn close_fid(fid: Fid) -> Result<()> {
    close(process::getpid()?, fid)
}
