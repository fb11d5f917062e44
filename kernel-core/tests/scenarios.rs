// SPDX-License-Identifier: MPL-2.0

//! End-to-end scenarios against the public syscall surface, one per
//! situation the kernel core is meant to get right: a single pipe
//! hand-off, backpressure under a bounded buffer, a socket rendezvous, a
//! connect timeout, parent/child reaping, reparenting to a tree's own
//! root, and a thread detach/join race.
//!
//! Each test calls [`kernel_core::boot_idle`] once to become a process
//! of its own before touching anything else — every syscall here needs a
//! calling process, exactly as on the real kernel. Tests run on
//! independent OS threads and share one process table, so each one boots
//! its own root rather than assuming pid 0 is "the" root (see
//! `boot_idle`'s doc comment).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use kernel_core::{
    accept, boot_idle, close, config::NOPORT, connect, create_thread, exec, listen, pipe, read,
    socket, thread_join, wait_child, write, Errno,
};

#[test]
fn e1_pipe_single_shot() {
    boot_idle().unwrap();
    let (r, w) = pipe().unwrap();
    assert_eq!(write(w, b"hello").unwrap(), 5);
    close(w).unwrap();

    let mut buf = [0u8; 10];
    let n = read(r, &mut buf).unwrap();
    assert_eq!(n, 5);
    assert_eq!(&buf[..5], b"hello");
    assert_eq!(read(r, &mut buf).unwrap(), 0);
}

#[test]
fn e2_pipe_backpressure() {
    boot_idle().unwrap();
    let pid = exec(
        |_| {
            let (r, w) = pipe().unwrap();
            let writer = create_thread(
                move |_| {
                    let mut sent = 0usize;
                    while sent < 5000 {
                        let chunk = vec![0xABu8; (5000 - sent).min(1000)];
                        let mut off = 0;
                        while off < chunk.len() {
                            off += write(w, &chunk[off..]).unwrap();
                        }
                        sent += chunk.len();
                    }
                    close(w).unwrap();
                    0
                },
                Arc::from(Vec::new()),
            )
            .unwrap();

            let mut total = 0usize;
            loop {
                let mut buf = [0u8; 1000];
                let n = read(r, &mut buf).unwrap();
                if n == 0 {
                    break;
                }
                total += n;
            }
            close(r).unwrap();
            thread_join(writer).unwrap();
            total as i32
        },
        &[],
    )
    .unwrap();

    let (exited, status) = wait_child(Some(pid)).unwrap();
    assert_eq!(exited, pid);
    assert_eq!(status, 5000);
}

#[test]
fn e3_socket_echo() {
    boot_idle().unwrap();
    let connector_saw = Arc::new(Mutex::new(Vec::new()));
    let acceptor_saw = Arc::new(Mutex::new(Vec::new()));
    let (cs, ac) = (connector_saw.clone(), acceptor_saw.clone());

    let pid = exec(
        move |_| {
            let s1 = socket(7).unwrap();
            listen(s1).unwrap();

            let cs = cs.clone();
            let connector = create_thread(
                move |_| {
                    let s2 = socket(NOPORT).unwrap();
                    connect(s2, 7, None).unwrap();
                    let mut buf = [0u8; 4];
                    let n = read(s2, &mut buf).unwrap();
                    cs.lock().unwrap().extend_from_slice(&buf[..n]);
                    write(s2, b"pong").unwrap();
                    0
                },
                Arc::from(Vec::new()),
            )
            .unwrap();

            let a = accept(s1).unwrap();
            write(a, b"ping").unwrap();
            let mut buf = [0u8; 4];
            let n = read(a, &mut buf).unwrap();
            ac.lock().unwrap().extend_from_slice(&buf[..n]);
            thread_join(connector).unwrap();
            0
        },
        &[],
    )
    .unwrap();

    let (_exited, status) = wait_child(Some(pid)).unwrap();
    assert_eq!(status, 0);
    assert_eq!(&connector_saw.lock().unwrap()[..], b"ping");
    assert_eq!(&acceptor_saw.lock().unwrap()[..], b"pong");
}

#[test]
fn e4_connect_timeout() {
    boot_idle().unwrap();
    let start = Instant::now();
    let pid = exec(
        |_| {
            let s = socket(NOPORT).unwrap();
            match connect(s, 9, Some(Duration::from_millis(50))) {
                Err(e) => e.error() as i32,
                Ok(()) => -999,
            }
        },
        &[],
    )
    .unwrap();

    let (_exited, status) = wait_child(Some(pid)).unwrap();
    let elapsed = start.elapsed();
    assert_eq!(status, Errno::ETIMEDOUT as i32);
    assert!(elapsed >= Duration::from_millis(40), "returned too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "took far longer than the timeout: {elapsed:?}");
}

#[test]
fn e5_process_wait() {
    boot_idle().unwrap();
    let pid = exec(|_| 42, &[]).unwrap();

    let (exited, status) = wait_child(None).unwrap();
    assert_eq!(exited, pid);
    assert_eq!(status, 42);

    let err = wait_child(None).unwrap_err();
    assert_eq!(err.error(), Errno::ECHILD);
}

#[test]
fn e6_reparent_to_tree_root() {
    let grandparent = boot_idle().unwrap();

    // parent execs a child, waits long enough for the grandchild to still
    // be alive, then exits without reaping it — the grandchild must be
    // reparented to `grandparent`, this tree's own root, not to whatever
    // other test happens to own pid 0.
    let started = Arc::new(AtomicUsize::new(0));
    let s = started.clone();
    let parent = exec(
        move |_| {
            let _child = exec(
                {
                    let s = s.clone();
                    move |_| {
                        s.store(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(150));
                        7
                    }
                },
                &[],
            )
            .unwrap();
            0
        },
        &[],
    )
    .unwrap();

    while started.load(Ordering::SeqCst) == 0 {
        std::thread::sleep(Duration::from_millis(1));
    }

    let (exited_parent, parent_status) = wait_child(Some(parent)).unwrap();
    assert_eq!(exited_parent, parent);
    assert_eq!(parent_status, 0);

    // The grandchild outlived its parent; grandparent reaps it directly.
    let (reparented, status) = wait_child(None).unwrap();
    assert_eq!(status, 7);
    assert_ne!(reparented, parent);

    let err = wait_child(None).unwrap_err();
    assert_eq!(err.error(), Errno::ECHILD);
    let _ = grandparent;
}

#[test]
fn e7_thread_join_detach_race() {
    boot_idle().unwrap();
    let pid = exec(
        |_| {
            let tid = create_thread(|_| 5, Arc::from(Vec::new())).unwrap();
            // The new thread may already have exited by the time this runs,
            // so `ThreadDetach` racing its own exit is allowed to land
            // either way: detach-wins (thread not yet exited) or
            // exit-wins (detach then fails because it already exited).
            match kernel_core::thread_detach(tid) {
                Ok(()) => assert!(thread_join(tid).is_err()),
                Err(_) => assert_eq!(thread_join(tid).unwrap(), 5),
            }
            std::thread::sleep(Duration::from_millis(20));
            0
        },
        &[],
    )
    .unwrap();

    let (_exited, status) = wait_child(Some(pid)).unwrap();
    assert_eq!(status, 0);
}
