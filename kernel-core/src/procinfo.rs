// SPDX-License-Identifier: MPL-2.0

//! The process-info stream: a read-only snapshot of the process table,
//! exposed as an ordinary stream that yields one fixed-size [`ProcInfo`]
//! record per `read` call, in ascending pid order.
//!
//! Grounded on `examples/original_source/tinyos3/kernel_proc.c`'s
//! `procinfo_read`/`sys_OpenInfo`. That `procinfo_read` silently truncates
//! the copy when the caller's buffer is smaller than one record — a latent
//! bug, since a caller reading a truncated record would misread every field
//! past the cut. `read` below rejects undersized buffers outright instead.

use std::any::Any;
use std::sync::Mutex;

use crate::config::{MAX_PROC, PROCINFO_MAX_ARGS_SIZE};
use crate::error::Errno;
use crate::ids::Fid;
use crate::prelude::Result;
use crate::process;
use crate::return_errno_with_message;
use crate::stream::{self, Stream};

/// A fixed-layout snapshot of one process table entry. `write_into` is the
/// wire format `read` hands back; there is no `repr(C)` struct behind it; the
/// layout below is the whole contract.
#[derive(Debug, Clone)]
pub struct ProcInfo {
    pub pid: u32,
    /// `u32::MAX` when the process has no parent (pid 0, or already reaped).
    pub ppid: u32,
    pub alive: bool,
    pub thread_count: u32,
    pub argl: u32,
    pub args: [u8; PROCINFO_MAX_ARGS_SIZE],
}

impl ProcInfo {
    pub const SIZE: usize = 4 + 4 + 1 + 4 + 4 + PROCINFO_MAX_ARGS_SIZE;

    fn write_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= Self::SIZE);
        let mut off = 0;
        buf[off..off + 4].copy_from_slice(&self.pid.to_le_bytes());
        off += 4;
        buf[off..off + 4].copy_from_slice(&self.ppid.to_le_bytes());
        off += 4;
        buf[off] = self.alive as u8;
        off += 1;
        buf[off..off + 4].copy_from_slice(&self.thread_count.to_le_bytes());
        off += 4;
        buf[off..off + 4].copy_from_slice(&self.argl.to_le_bytes());
        off += 4;
        buf[off..off + PROCINFO_MAX_ARGS_SIZE].copy_from_slice(&self.args);
    }
}

fn snapshot(pid: crate::ids::Pid) -> Option<ProcInfo> {
    let pcb = process::pcb_for(pid).ok()?;
    let inner = pcb.inner.lock().unwrap();
    let mut args = [0u8; PROCINFO_MAX_ARGS_SIZE];
    let n = inner.args.len().min(PROCINFO_MAX_ARGS_SIZE);
    args[..n].copy_from_slice(&inner.args[..n]);
    Some(ProcInfo {
        pid: pid as u32,
        ppid: inner.parent.map(|p| p as u32).unwrap_or(u32::MAX),
        alive: matches!(inner.state, process::ProcState::Alive),
        thread_count: inner.live_threads as u32,
        argl: inner.args.len() as u32,
        args,
    })
}

struct ProcInfoStream {
    next_pid: Mutex<usize>,
}

impl Stream for ProcInfoStream {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < ProcInfo::SIZE {
            return_errno_with_message!(
                Errno::EINVAL,
                "buffer is smaller than one process-info record"
            );
        }
        let mut next = self.next_pid.lock().unwrap();
        while *next < MAX_PROC {
            let pid = *next;
            *next += 1;
            if let Some(info) = snapshot(pid) {
                info.write_into(buf);
                return Ok(ProcInfo::SIZE);
            }
        }
        Ok(0)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Opens a fresh process-info stream in the calling process, positioned at
/// pid 0.
pub fn open_info() -> Result<Fid> {
    let pairs = stream::reserve(1)?;
    let s: std::sync::Arc<dyn Stream> = std::sync::Arc::new(ProcInfoStream {
        next_pid: Mutex::new(0),
    });
    stream::install_stream(pairs[0].1, s);
    Ok(pairs[0].0)
}
