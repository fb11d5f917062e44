// SPDX-License-Identifier: MPL-2.0

//! Per-OS-thread "which kernel thread am I" context.
//!
//! The original design assumes a single CPU core and a `CURPROC`/`CURTHREAD`
//! pair the scheduler swaps on every context switch. This core has no
//! scheduler of its own — spawning, sleeping and waking a kernel thread is
//! left to whatever hosts it — so every kernel thread is realized as its own
//! `std::thread`, and each such OS thread tracks its own `(Pid, Tid)` in
//! thread-local storage instead of consulting a shared current-thread pointer.

use std::cell::Cell;

use crate::ids::{Pid, Tid};

#[derive(Clone, Copy)]
pub(crate) struct CurrentContext {
    pub pid: Pid,
    pub tid: Tid,
}

thread_local! {
    static CURRENT: Cell<Option<CurrentContext>> = const { Cell::new(None) };
}

pub(crate) fn set_current(ctx: CurrentContext) {
    CURRENT.with(|c| c.set(Some(ctx)));
}

pub(crate) fn current() -> Option<CurrentContext> {
    CURRENT.with(|c| c.get())
}

pub(crate) fn current_ctx() -> crate::prelude::Result<CurrentContext> {
    current().ok_or_else(|| {
        crate::error::Error::with_message(
            crate::error::Errno::ESRCH,
            "no kernel thread context on this OS thread",
        )
    })
}

/// Id of the process running on the calling OS thread, if any.
pub fn current_pid() -> Option<Pid> {
    current().map(|c| c.pid)
}

/// Id of the thread running on the calling OS thread, if any.
pub fn current_tid() -> Option<Tid> {
    current().map(|c| c.tid)
}
