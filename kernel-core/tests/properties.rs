// SPDX-License-Identifier: MPL-2.0

//! Property-based and invariant checks against the public syscall
//! surface, grounded on `proptest`'s presence as a dev-dependency across
//! the example pack (e.g. `jguida941-voiceterm`'s `Cargo.toml`).
//!
//! Each `#[test]` boots its own process-tree root once, then feeds many
//! randomized cases through the same kernel-thread context via
//! `proptest!`'s block form — booting per-case would eventually exhaust
//! the shared, table-wide `MAX_PROC` across a few hundred iterations,
//! since a root process is never itself reaped.

use std::cell::Cell;
use std::time::Duration;

use proptest::prelude::*;

use kernel_core::config::PIPE_BUFFER_SIZE;
use kernel_core::{boot_idle, close, connect, listen, pipe, read, socket, write, Errno};

thread_local! {
    /// One root process per OS thread is enough: `proptest!` runs every
    /// case of a given `#[test]` on the same thread, and a root process is
    /// never itself reaped, so booting on every case would eventually
    /// exhaust the table-wide `MAX_PROC` a few hundred iterations in.
    static BOOTED: Cell<bool> = const { Cell::new(false) };
}

fn ensure_booted() {
    BOOTED.with(|b| {
        if !b.get() {
            boot_idle().unwrap();
            b.set(true);
        }
    });
}

proptest! {
    /// Writing a sequence of up to `PIPE_BUFFER_SIZE` bytes into
    /// an empty pipe, then reading it back to exhaustion, reproduces it
    /// exactly.
    #[test]
    fn pipe_round_trips_any_payload_up_to_capacity(
        data in proptest::collection::vec(any::<u8>(), 0..=PIPE_BUFFER_SIZE)
    ) {
        ensure_booted();
        let (r, w) = pipe().unwrap();
        let n = write(w, &data).unwrap();
        prop_assert_eq!(n, data.len(), "a single write into an empty pipe is never partial below capacity");
        close(w).unwrap();

        let mut got = Vec::with_capacity(data.len());
        let mut buf = vec![0u8; (data.len() + 1).max(1)];
        loop {
            let n = read(r, &mut buf).unwrap();
            if n == 0 {
                break;
            }
            got.extend_from_slice(&buf[..n]);
        }
        close(r).unwrap();
        prop_assert_eq!(got, data);
    }

    /// Once the writer has closed and the buffer is drained,
    /// every subsequent read returns end-of-stream (`0`), not an error.
    #[test]
    fn end_of_stream_after_writer_close_is_sticky(
        data in proptest::collection::vec(any::<u8>(), 0..=512)
    ) {
        ensure_booted();
        let (r, w) = pipe().unwrap();
        write(w, &data).unwrap();
        close(w).unwrap();

        let mut buf = vec![0u8; data.len().max(1)];
        let _ = read(r, &mut buf).unwrap();
        prop_assert_eq!(read(r, &mut buf).unwrap(), 0);
        prop_assert_eq!(read(r, &mut buf).unwrap(), 0);
        close(r).unwrap();
    }

    /// A write to a pipe whose reader has already closed fails,
    /// even though the buffer has free space.
    #[test]
    fn write_to_reader_closed_pipe_always_fails(
        data in proptest::collection::vec(any::<u8>(), 1..=512)
    ) {
        ensure_booted();
        let (r, w) = pipe().unwrap();
        close(r).unwrap();
        let err = write(w, &data).unwrap_err();
        prop_assert_eq!(err.error(), Errno::EPIPE);
        close(w).unwrap();
    }

    /// Zero-length reads and writes are legal no-ops regardless of payload
    /// shape elsewhere in the same pipe's lifetime.
    #[test]
    fn zero_length_io_is_always_a_no_op(prefix in proptest::collection::vec(any::<u8>(), 0..=64)) {
        ensure_booted();
        let (r, w) = pipe().unwrap();
        prop_assert_eq!(write(w, &prefix).unwrap(), prefix.len());
        prop_assert_eq!(write(w, &[]).unwrap(), 0);
        prop_assert_eq!(read(r, &mut []).unwrap(), 0);
        close(w).unwrap();
        close(r).unwrap();
    }
}

/// At most one listener may be registered per non-`NOPORT`
/// port at any time.
#[test]
fn port_registry_allows_only_one_listener_per_port() {
    boot_idle().unwrap();
    let s1 = socket(600).unwrap();
    listen(s1).unwrap();

    let s2 = socket(600).unwrap();
    let err = listen(s2).unwrap_err();
    assert_eq!(err.error(), Errno::EADDRINUSE);
}

/// After `Listen` fails, the socket is left exactly as it was
/// (still unbound, not silently promoted to listener or peer).
#[test]
fn failed_listen_leaves_the_socket_unbound() {
    boot_idle().unwrap();
    let s1 = socket(601).unwrap();
    listen(s1).unwrap();

    let s2 = socket(601).unwrap();
    assert!(listen(s2).is_err());

    // `s2` is still plain Unbound: a second `Listen` attempt fails the same
    // way (not, say, "already listening"), and it can still act as a
    // connector on an unrelated port.
    let err_second_listen = listen(s2).unwrap_err();
    assert_eq!(err_second_listen.error(), Errno::EADDRINUSE);
    let err_connect = connect(s2, 59999, Some(Duration::from_millis(10))).unwrap_err();
    assert_eq!(err_connect.error(), Errno::ECONNREFUSED);
}
