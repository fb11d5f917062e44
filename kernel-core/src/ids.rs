// SPDX-License-Identifier: MPL-2.0

//! Identifier types threaded through the syscall surface.
//!
//! `Pid` and `Fid` stay plain indices (a process id is an index into the
//! fixed process table; a file id is an index into a process's fixed fid
//! table). `Tid` is reworked: the original encodes a thread id as a PTCB
//! pointer reinterpreted as an integer, which can't detect a dangling
//! handle. Here it's a generational handle into the owning process's thread
//! slab instead.

use std::fmt;

/// A process id: an index into the fixed-size process table.
pub type Pid = usize;

/// A file id: an index into the current process's fid table.
pub type Fid = usize;

/// A port number. `NOPORT` (see [`crate::config::NOPORT`]) is reserved.
pub type Port = usize;

/// A thread id, valid only within the process that created it.
///
/// Pairs a thread-slab index with a generation counter bumped every time the
/// slot is reused, so a stale `Tid` from an already-recycled slot is
/// distinguishable from a live one instead of silently aliasing it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tid {
    pub(crate) index: usize,
    pub(crate) generation: u64,
}

impl fmt::Debug for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tid({}#{})", self.index, self.generation)
    }
}

/// Sentinel returned in place of a [`Pid`] when a process-creating or
/// process-waiting call fails.
pub const NOPROC: isize = -1;

/// Sentinel returned in place of a [`Fid`] when a file-creating call fails.
pub const NOFILE: isize = -1;
