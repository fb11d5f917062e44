// SPDX-License-Identifier: MPL-2.0

//! Kernel-wide sizing constants.
//!
//! Mirrors `aster_frame::config`'s approach: compile-time sizing for a core
//! that is never reconfigured at runtime.

/// Capacity of the process table. Process ids are indices into it.
pub const MAX_PROC: usize = 128;

/// Number of file-id slots in a single process's file table.
pub const MAX_FILEID: usize = 64;

/// Capacity of the process-wide FCB pool. Shared across all processes, so it
/// is sized well above a single process's `MAX_FILEID` to avoid spurious
/// `ENFILE` under concurrent load.
pub const MAX_FCB: usize = MAX_PROC * MAX_FILEID;

/// Highest legal port number for [`crate::socket`]. Port `0` is [`NOPORT`].
pub const MAX_PORT: usize = 1024;

/// The port value meaning "no port" — a socket with this port can never listen.
pub const NOPORT: usize = 0;

/// Capacity, in bytes, of a single pipe's circular buffer. Power of two so
/// positions can wrap with a bitwise AND.
pub const PIPE_BUFFER_SIZE: usize = 4096;

/// Maximum number of argument bytes copied verbatim into a [`crate::procinfo::ProcInfo`]
/// record; longer argument blobs are truncated and zero-padded.
pub const PROCINFO_MAX_ARGS_SIZE: usize = 128;
