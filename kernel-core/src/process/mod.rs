// SPDX-License-Identifier: MPL-2.0

//! Process table and process-lifecycle syscalls: `Exec`, `Exit`, `WaitChild`,
//! `GetPid`, `GetPPid`.
//!
//! Grounded on `examples/original_source/tinyos3/kernel_proc.c`: the fixed
//! `PT[MAX_PROC]` array, `acquire_PCB`/`release_PCB`, `cleanup_zombie`,
//! `wait_for_specific_child`/`wait_for_any_child` and the reparent-to-init
//! dance in `sys_Exit`. The free list that C version threads through the PCB's
//! own `parent` field — a dead process and a live orphan become
//! indistinguishable if a stray read ever hits that field mid-reuse — is
//! replaced here by a plain `Vec<Pid>` stack owned by the table, so there is
//! no shared field to misread in the first place.

use std::sync::{Arc, Condvar, Mutex};

use lazy_static::lazy_static;

use crate::config::{MAX_FILEID, MAX_PROC};
use crate::current;
use crate::error::{Errno, Error};
use crate::ids::Pid;
use crate::prelude::Result;
use crate::return_errno_with_message;
use crate::thread::PtcbHandle;
use log::{debug, error, trace, warn};

/// A process's ten-thousand-foot state. `Free` slots never appear in
/// `Tables::processes` (a `None` there means free); this enum only
/// distinguishes the two states a populated slot can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcState {
    Alive,
    Zombie,
}

/// The body of a process's initial task: `Exec`'s `args` copied into storage
/// the new process owns. Construction is atomic: nothing about the new
/// process is visible to `WaitChild` until this body is fully populated and
/// the table slot is published.
pub(crate) type Task = Arc<dyn Fn(&[u8]) -> i32 + Send + Sync>;

pub(crate) struct PcbInner {
    pub(crate) state: ProcState,
    pub(crate) parent: Option<Pid>,
    /// The parentless process at the top of this process's tree — whichever
    /// pid [`boot_idle`] created it under. A literal tinyos3 boots a single
    /// pid-0 idle process followed by a single pid-1 init, and every orphan
    /// reparents to that one init; this crate can have many independent
    /// trees live in the same table at once (`boot_idle`'s own doc comment
    /// invites one per test), so each tree reparents its own orphans to its
    /// own root rather than to a table-wide pid that might belong to a
    /// different tree entirely.
    pub(crate) root: Pid,
    pub(crate) children: Vec<Pid>,
    pub(crate) exited_children: Vec<(Pid, i32)>,
    pub(crate) exit_status: i32,
    pub(crate) main_task: Option<Task>,
    pub(crate) args: Box<[u8]>,
    pub(crate) fids: [Option<usize>; MAX_FILEID],
    pub(crate) threads: Vec<Option<Arc<PtcbHandle>>>,
    /// Parallel to `threads`: bumped every time a slot is reused, so a
    /// stale `Tid` pointing at a recycled slot can be told apart from a
    /// live one instead of silently aliasing it.
    pub(crate) thread_generations: Vec<u64>,
    pub(crate) live_threads: usize,
}

/// A process control block. Long-lived handles to this type are held by the
/// process table and by every thread spawned for the process; everything
/// else reaches it through a fresh table lookup.
pub struct PcbHandle {
    pub(crate) pid: Pid,
    pub(crate) inner: Mutex<PcbInner>,
    /// Woken whenever a child of this process becomes a zombie.
    pub(crate) child_exit: Condvar,
}

pub(crate) struct Tables {
    pub(crate) processes: Vec<Option<Arc<PcbHandle>>>,
    free_list: Vec<Pid>,
    pub(crate) process_count: usize,
    pub(crate) fcbs: Vec<Option<crate::stream::FcbSlot>>,
    pub(crate) fcb_free: Vec<usize>,
    pub(crate) ports: std::collections::BTreeMap<crate::ids::Port, std::sync::Weak<crate::socket::SocketHandle>>,
}

impl Tables {
    fn new() -> Self {
        Tables {
            processes: (0..MAX_PROC).map(|_| None).collect(),
            free_list: (0..MAX_PROC).rev().collect(),
            process_count: 0,
            fcbs: (0..crate::config::MAX_FCB).map(|_| None).collect(),
            fcb_free: (0..crate::config::MAX_FCB).rev().collect(),
            ports: std::collections::BTreeMap::new(),
        }
    }
}

lazy_static! {
    pub(crate) static ref TABLES: Mutex<Tables> = Mutex::new(Tables::new());
}

fn no_context() -> Error {
    Error::with_message(Errno::ESRCH, "no kernel thread context on this OS thread")
}

/// Returns the current OS thread's owning [`PcbHandle`].
pub(crate) fn current_pcb() -> Result<Arc<PcbHandle>> {
    let pid = current::current_pid().ok_or_else(no_context)?;
    let tables = TABLES.lock().unwrap();
    tables.processes[pid]
        .clone()
        .ok_or_else(|| Error::with_message(Errno::ESRCH, "current process missing from table"))
}

pub(crate) fn pcb_for(pid: Pid) -> Result<Arc<PcbHandle>> {
    if pid >= MAX_PROC {
        return_errno_with_message!(Errno::ESRCH, "pid out of range");
    }
    let tables = TABLES.lock().unwrap();
    tables.processes[pid]
        .clone()
        .ok_or_else(|| Error::with_message(Errno::ESRCH, "no such process"))
}

/// Creates a new process whose single initial thread runs `task(args)` and,
/// on returning, exits the process with that return value as status.
///
/// `args` is copied into storage the new process owns and construction is
/// atomic: either the whole new process is registered or none of it is.
/// (Unlike [`crate::thread::create_thread`], whose argument block is
/// shared, not copied — a process's initial arguments are a one-shot
/// handoff, while a thread's block may be inspected by its creator after
/// the thread starts.)
pub fn exec<F>(task: F, args: &[u8]) -> Result<Pid>
where
    F: Fn(&[u8]) -> i32 + Send + Sync + 'static,
{
    let task: Task = Arc::new(task);
    let owned_args: Box<[u8]> = args.to_vec().into_boxed_slice();
    let parent_pid = current::current_pid();

    let (pcb, inherited_fcbs) = {
        let mut tables = TABLES.lock().unwrap();
        let pid = tables.free_list.pop().ok_or_else(|| {
            warn!("process table exhausted ({MAX_PROC} slots in use)");
            Error::with_message(Errno::EAGAIN, "process table is full")
        })?;

        let root = match parent_pid {
            Some(ppid) => tables.processes[ppid]
                .as_ref()
                .map(|p| p.inner.lock().unwrap().root)
                .unwrap_or(pid),
            None => pid,
        };

        // Inherit every open fid from the parent's file-id table: the child
        // gets its own fid slot pointing at the same FCB, with that FCB's
        // refcount bumped to account for the new reference. Done directly
        // against `tables.fcbs` (already locked here) rather than through
        // `stream::incref`, which would try to re-lock `TABLES`.
        let mut fids: [Option<usize>; MAX_FILEID] = std::array::from_fn(|_| None);
        let mut inherited_fcbs: Vec<usize> = Vec::new();
        if let Some(ppid) = parent_pid {
            if let Some(parent) = tables.processes[ppid].clone() {
                let parent_fids = parent.inner.lock().unwrap().fids;
                for (fid, slot) in parent_fids.iter().enumerate() {
                    if let Some(fcb_idx) = slot {
                        if let Some(fcb) = tables.fcbs[*fcb_idx].as_mut() {
                            fcb.refcount += 1;
                            fids[fid] = Some(*fcb_idx);
                            inherited_fcbs.push(*fcb_idx);
                        }
                    }
                }
            }
        }

        let pcb = Arc::new(PcbHandle {
            pid,
            inner: Mutex::new(PcbInner {
                state: ProcState::Alive,
                parent: parent_pid,
                root,
                children: Vec::new(),
                exited_children: Vec::new(),
                exit_status: 0,
                main_task: Some(task),
                args: owned_args.clone(),
                fids,
                threads: Vec::new(),
                thread_generations: Vec::new(),
                live_threads: 0,
            }),
            child_exit: Condvar::new(),
        });
        tables.processes[pid] = Some(pcb.clone());
        tables.process_count += 1;

        if let Some(ppid) = parent_pid {
            if let Some(parent) = tables.processes[ppid].clone() {
                parent.inner.lock().unwrap().children.push(pid);
            }
        }
        debug!(
            "exec: pid {} created{}{}",
            pid,
            parent_pid.map(|p| format!(" (parent {p})")).unwrap_or_default(),
            if inherited_fcbs.is_empty() {
                String::new()
            } else {
                format!(", inherited {} open fid(s)", inherited_fcbs.len())
            }
        );
        (pcb, inherited_fcbs)
    };

    let pid = pcb.pid;
    if let Err(e) = crate::thread::spawn_main_thread(&pcb, owned_args) {
        // Roll the reservation back; nothing else has observed this pid yet.
        let mut tables = TABLES.lock().unwrap();
        tables.processes[pid] = None;
        tables.free_list.push(pid);
        tables.process_count -= 1;
        for fcb_idx in inherited_fcbs {
            if let Some(fcb) = tables.fcbs[fcb_idx].as_mut() {
                fcb.refcount = fcb.refcount.saturating_sub(1);
            }
        }
        warn!("exec: failed to spawn main thread for pid {pid}: {e}");
        return Err(e);
    }
    Ok(pid)
}

/// Boots a fresh, parentless root process (the idle process, on the first
/// call in a given table) and registers the calling OS thread as its main
/// thread. Mirrors `initialize_processes()` in the original kernel, which
/// creates pid 0 once at boot time on the boot CPU itself rather than
/// handing it off to a freshly scheduled thread. Every other process
/// created via [`exec`] on the calling OS thread is, transitively, a
/// descendant of this one, and this one is its own [`PcbInner::root`].
///
/// Calling this more than once from different OS threads each creates an
/// independent root process; callers that want a single shared root should
/// call it exactly once per OS thread that needs to act as a kernel thread
/// (for instance, once per test).
pub fn boot_idle() -> Result<Pid> {
    let pcb = {
        let mut tables = TABLES.lock().unwrap();
        let pid = tables.free_list.pop().ok_or_else(|| {
            warn!("process table exhausted ({MAX_PROC} slots in use)");
            Error::with_message(Errno::EAGAIN, "process table is full")
        })?;
        let pcb = Arc::new(PcbHandle {
            pid,
            inner: Mutex::new(PcbInner {
                state: ProcState::Alive,
                parent: None,
                root: pid,
                children: Vec::new(),
                exited_children: Vec::new(),
                exit_status: 0,
                main_task: None,
                args: Box::new([]),
                fids: std::array::from_fn(|_| None),
                threads: Vec::new(),
                thread_generations: Vec::new(),
                live_threads: 0,
            }),
            child_exit: Condvar::new(),
        });
        tables.processes[pid] = Some(pcb.clone());
        tables.process_count += 1;
        pcb
    };
    let tid = crate::thread::register_current_as_main_thread(&pcb);
    current::set_current(current::CurrentContext { pid: pcb.pid, tid });
    debug!("boot_idle: booted root process pid {}", pcb.pid);
    Ok(pcb.pid)
}

pub fn getpid() -> Result<Pid> {
    current::current_pid().ok_or_else(no_context)
}

pub fn getppid() -> Result<Option<Pid>> {
    let pcb = current_pcb()?;
    Ok(pcb.inner.lock().unwrap().parent)
}

/// Process-level teardown, run once the last live thread of `pid` finishes.
/// Mirrors `sys_Exit` in the original: close every open fid, reparent live
/// children to this process's own tree root, hand the caller's own exit
/// record to its parent. Terminates the calling process immediately,
/// regardless of how many threads it still has running. Tears down
/// process-wide state (fids, child reparenting, the zombie record) right
/// away; any sibling OS thread still executing discovers the process
/// already gone the next time it touches shared state, and unwinds through
/// its own `ThreadExit` path.
///
/// This is the one place a single-CPU "kill everything now" semantics
/// can't be reproduced literally: safe Rust has no way to force an
/// arbitrary OS thread to stop, so the teardown below is immediate but
/// the other threads' own termination is not.
pub fn exit(status: i32) -> ! {
    if let Some(pid) = current::current_pid() {
        let is_root = pcb_for(pid)
            .map(|p| p.inner.lock().unwrap().root == pid)
            .unwrap_or(false);
        if is_root {
            // The root of a process tree plays init's role for its own
            // descendants: drain every remaining child before tearing itself
            // down, so none of them are left stranded as unreapable zombies.
            while wait_child(None).is_ok() {}
        }
        do_exit(pid, status);
    }
    crate::thread::thread_exit(status);
}

/// Process-level teardown, run once the last live thread of `pid` finishes,
/// or immediately by [`exit`]. Mirrors `sys_Exit` in the original: close
/// every open fid, reparent live children to this process's own tree root,
/// hand the caller's own exit record to its parent. Idempotent: a process already torn down is
/// left alone, so a later `ThreadExit` on the same process after `exit` was
/// called directly does not hand the same zombie record to the parent twice.
pub(crate) fn do_exit(pid: Pid, status: i32) {
    let pcb = match pcb_for(pid) {
        Ok(p) => p,
        Err(_) => return,
    };
    if pcb.inner.lock().unwrap().state == ProcState::Zombie {
        return;
    }
    debug!("exit: pid {pid} tearing down with status {status}");

    let open_fids: Vec<usize> = {
        let inner = pcb.inner.lock().unwrap();
        inner
            .fids
            .iter()
            .enumerate()
            .filter_map(|(fid, slot)| slot.map(|_| fid))
            .collect()
    };
    for fid in open_fids {
        let _ = crate::stream::close(pid, fid);
    }

    let (children, parent_pid, root) = {
        let mut inner = pcb.inner.lock().unwrap();
        inner.state = ProcState::Zombie;
        inner.exit_status = status;
        (std::mem::take(&mut inner.children), inner.parent, inner.root)
    };

    // Reparent to this process's own tree root (its "init"), not to a
    // table-wide pid: several independent trees can coexist in one table.
    if pid != root {
        match pcb_for(root) {
            Ok(init) => init.inner.lock().unwrap().children.extend(children.iter().copied()),
            // A tree's root outlives every descendant by construction
            // (`boot_idle` never reaps itself); reaching this means a
            // process was torn down while children still pointed at it.
            Err(_) => error!("exit: pid {pid}'s tree root {root} is gone, orphans leak"),
        }
    }
    for &child in &children {
        if let Ok(child_pcb) = pcb_for(child) {
            child_pcb.inner.lock().unwrap().parent = if pid == root { None } else { Some(root) };
        }
    }

    if let Some(ppid) = parent_pid {
        match pcb_for(ppid) {
            Ok(parent) => {
                let mut parent_inner = parent.inner.lock().unwrap();
                parent_inner.children.retain(|&c| c != pid);
                parent_inner.exited_children.push((pid, status));
                drop(parent_inner);
                parent.child_exit.notify_all();
            }
            Err(_) => error!("exit: pid {pid}'s recorded parent {ppid} is gone, zombie record dropped"),
        }
    }
}

fn reap(pid: Pid) {
    let mut tables = TABLES.lock().unwrap();
    tables.processes[pid] = None;
    tables.free_list.push(pid);
    tables.process_count -= 1;
}

/// Blocks until a child matching `target` (or any child, if `None`) becomes
/// a zombie, then reaps it and returns its pid and exit status.
pub fn wait_child(target: Option<Pid>) -> Result<(Pid, i32)> {
    let pcb = current_pcb()?;
    let mut inner = pcb.inner.lock().unwrap();
    loop {
        match target {
            Some(want) => {
                if let Some(pos) = inner.exited_children.iter().position(|&(p, _)| p == want) {
                    let (p, status) = inner.exited_children.remove(pos);
                    drop(inner);
                    reap(p);
                    return Ok((p, status));
                }
                if !inner.children.contains(&want) {
                    return_errno_with_message!(Errno::ECHILD, "not a child of the calling process");
                }
            }
            None => {
                if let Some((p, status)) = inner.exited_children.pop() {
                    drop(inner);
                    reap(p);
                    return Ok((p, status));
                }
                if inner.children.is_empty() {
                    return_errno_with_message!(Errno::ECHILD, "calling process has no children");
                }
            }
        }
        trace!("wait_child: pid {} blocking on child_exit", pcb.pid);
        inner = pcb.child_exit.wait(inner).unwrap();
    }
}
