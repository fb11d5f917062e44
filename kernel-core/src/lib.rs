// SPDX-License-Identifier: MPL-2.0

//! A small cooperative kernel core: process and thread lifecycle, a stream
//! layer with FCB-style reference counting, a bounded pipe, and a port/socket
//! rendezvous layer built on top of it.
//!
//! Grounded on `examples/original_source/tinyos3`, re-architected for a
//! hosted, multi-core setting. Every kernel thread this crate creates is
//! realized as its own `std::thread`; there is no scheduler here (spawning,
//! sleeping and waking a kernel thread is left to whatever hosts it), so
//! each call that "blocks a kernel thread" really blocks the `std` thread
//! backing it, via an ordinary `Condvar`.

pub mod config;
mod current;
pub mod error;
pub mod ids;
mod pipe;
mod prelude;
mod process;
mod procinfo;
mod socket;
mod stream;
mod thread;

pub use error::{Errno, Error};
pub use ids::{Fid, Pid, Port, Tid};
pub use prelude::Result;

pub use process::{boot_idle, exec, exit, getpid, getppid, wait_child};
pub use socket::{accept, connect, listen, shutdown, socket, ShutdownMode};
pub use stream::{close_fid as close, read, write};
pub use thread::{create_thread, thread_detach, thread_exit, thread_join, thread_self};

pub use pipe::pipe_create as pipe;
pub use procinfo::{open_info, ProcInfo};

/// Initializes the `log` backend used by this crate's `trace!`/`debug!`/
/// `warn!`/`error!` calls. A thin convenience wrapper around `env_logger`,
/// provided so embedders (and this crate's own tests) don't have to depend
/// on `env_logger` directly just to see kernel-core's log output.
pub fn init_logging() {
    let _ = env_logger::try_init();
}
