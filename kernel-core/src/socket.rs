// SPDX-License-Identifier: MPL-2.0

//! The port/socket layer: a small rendezvous mechanism layered on top of
//! pipes. A socket starts `Unbound`, can be turned into a `Listener` bound
//! to a port, and a `Connect` against that port plus a matching `Accept`
//! turns both ends into a connected `Peer` backed by a pair of pipes (one
//! per direction).
//!
//! Grounded on `examples/original_source/tinyos3/kernel_socket.c`: the
//! `PORT_MAP` table, the listener's request queue, and the per-request
//! completion handshake. `sys_Accept`/`sys_Connect` were left as stubs in
//! that file (its own comments flag the queue management as unfinished);
//! the full listener-queue protocol is implemented below instead. The C
//! `socket_type` union (`listener_s` / `peer_s`) becomes the `SocketKind`
//! enum here.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::config::{MAX_PORT, NOPORT};
use crate::error::Errno;
use crate::ids::{Fid, Port};
use crate::pipe::{self, PipeHandle};
use crate::prelude::Result;
use crate::process::{self, TABLES};
use crate::return_errno_with_message;
use crate::stream::{self, Stream};
use log::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    Read,
    Write,
    Both,
}

enum ConnectState {
    Pending,
    Accepted,
    Refused,
}

struct ConnectOutcome {
    state: Mutex<ConnectState>,
    done: Condvar,
}

struct ConnectRequest {
    connector: Arc<SocketHandle>,
    outcome: Arc<ConnectOutcome>,
}

enum SocketKind {
    Unbound,
    Listener { queue: VecDeque<ConnectRequest> },
    Peer {
        read_pipe: Arc<PipeHandle>,
        write_pipe: Arc<PipeHandle>,
    },
}

struct SocketInner {
    port: Port,
    kind: SocketKind,
}

pub(crate) struct SocketHandle {
    inner: Mutex<SocketInner>,
    /// Woken whenever a connect request is pushed onto this socket's
    /// listener queue, or a pending request is resolved.
    req_available: Condvar,
}

impl SocketHandle {
    fn new(port: Port) -> Arc<Self> {
        Arc::new(SocketHandle {
            inner: Mutex::new(SocketInner {
                port,
                kind: SocketKind::Unbound,
            }),
            req_available: Condvar::new(),
        })
    }
}

pub(crate) struct SocketStream(pub(crate) Arc<SocketHandle>);

impl Stream for SocketStream {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let read_pipe = match &self.0.inner.lock().unwrap().kind {
            SocketKind::Peer { read_pipe, .. } => read_pipe.clone(),
            _ => return_errno_with_message!(Errno::ENOTCONN, "socket is not connected"),
        };
        pipe::blocking_read(&read_pipe, buf)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        let write_pipe = match &self.0.inner.lock().unwrap().kind {
            SocketKind::Peer { write_pipe, .. } => write_pipe.clone(),
            _ => return_errno_with_message!(Errno::ENOTCONN, "socket is not connected"),
        };
        pipe::blocking_write(&write_pipe, buf)
    }

    fn close(&self) -> Result<()> {
        close_socket(&self.0);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn close_socket(handle: &Arc<SocketHandle>) {
    let mut inner = handle.inner.lock().unwrap();
    match &mut inner.kind {
        SocketKind::Peer {
            read_pipe,
            write_pipe,
        } => {
            pipe::reader_close(read_pipe);
            pipe::writer_close(write_pipe);
        }
        SocketKind::Listener { queue } => {
            let mut tables = TABLES.lock().unwrap();
            tables.ports.remove(&inner.port);
            drop(tables);
            for req in queue.drain(..) {
                *req.outcome.state.lock().unwrap() = ConnectState::Refused;
                req.outcome.done.notify_all();
            }
            // Wake any acceptor blocked on this listener so it observes the
            // now-missing port registration instead of waiting forever.
            handle.req_available.notify_all();
        }
        SocketKind::Unbound => {}
    }
}

fn get_socket(fid: Fid) -> Result<Arc<SocketHandle>> {
    let pid = process::getpid()?;
    let s = stream::stream_for(pid, fid)?;
    s.as_any()
        .downcast_ref::<SocketStream>()
        .map(|s| s.0.clone())
        .ok_or_else(|| {
            crate::error::Error::with_message(Errno::EINVAL, "fid does not refer to a socket")
        })
}

fn check_port(port: Port) -> Result<()> {
    if port != NOPORT && port > MAX_PORT {
        return_errno_with_message!(Errno::EINVAL, "port out of range");
    }
    Ok(())
}

/// Creates a new, unbound socket on `port` (or [`NOPORT`](crate::config::NOPORT)
/// for a socket that will only ever `Connect`, never `Listen`).
pub fn socket(port: Port) -> Result<Fid> {
    check_port(port)?;
    let pairs = stream::reserve(1)?;
    let handle = SocketHandle::new(port);
    let s: Arc<dyn Stream> = Arc::new(SocketStream(handle));
    stream::install_stream(pairs[0].1, s);
    Ok(pairs[0].0)
}

/// Turns an unbound socket into a listener on its own port.
pub fn listen(fid: Fid) -> Result<()> {
    let handle = get_socket(fid)?;
    let mut inner = handle.inner.lock().unwrap();
    if inner.port == NOPORT {
        return_errno_with_message!(Errno::EINVAL, "cannot listen on NOPORT");
    }
    if !matches!(inner.kind, SocketKind::Unbound) {
        return_errno_with_message!(Errno::EINVAL, "socket is already listening or connected");
    }
    let mut tables = TABLES.lock().unwrap();
    if tables
        .ports
        .get(&inner.port)
        .and_then(Weak::upgrade)
        .is_some()
    {
        warn!("listen: fid {fid} refused, port {} already has a listener", inner.port);
        return_errno_with_message!(Errno::EADDRINUSE, "port already has a listener");
    }
    tables.ports.insert(inner.port, Arc::downgrade(&handle));
    inner.kind = SocketKind::Listener {
        queue: VecDeque::new(),
    };
    debug!("listen: fid {fid} now listening on port {}", inner.port);
    Ok(())
}

/// Blocks until a pending connect request arrives on a listening socket,
/// then completes the handshake and returns a fid for the new peer.
pub fn accept(fid: Fid) -> Result<Fid> {
    let listener = get_socket(fid)?;
    let request = {
        let mut inner = listener.inner.lock().unwrap();
        loop {
            match &mut inner.kind {
                SocketKind::Listener { queue } => {
                    if let Some(req) = queue.pop_front() {
                        break req;
                    }
                }
                _ => return_errno_with_message!(Errno::EINVAL, "socket is not listening"),
            }
            trace!("accept: fid {fid} blocking on req_available");
            inner = listener.req_available.wait(inner).unwrap();
            // The listener may have been closed (its last fid dropped) while
            // we were asleep; a closed listener's port entry is gone even
            // though `inner.kind` is still nominally `Listener`, so check the
            // registry rather than the socket's own kind.
            let still_registered = {
                let tables = TABLES.lock().unwrap();
                tables
                    .ports
                    .get(&inner.port)
                    .and_then(Weak::upgrade)
                    .map(|registered| Arc::ptr_eq(&registered, &listener))
                    .unwrap_or(false)
            };
            if !still_registered {
                return_errno_with_message!(
                    Errno::ENOTCONN,
                    "listener was shut down while accept was blocked"
                );
            }
        }
    };

    let pairs = match stream::reserve(1) {
        Ok(pairs) => pairs,
        Err(e) => {
            // Reject the request back to the connector rather than leaving
            // it dangling in `Pending` forever.
            *request.outcome.state.lock().unwrap() = ConnectState::Refused;
            request.outcome.done.notify_all();
            return Err(e);
        }
    };

    let connector_to_acceptor = PipeHandle::new();
    let acceptor_to_connector = PipeHandle::new();

    {
        let mut connector_inner = request.connector.inner.lock().unwrap();
        connector_inner.kind = SocketKind::Peer {
            read_pipe: acceptor_to_connector.clone(),
            write_pipe: connector_to_acceptor.clone(),
        };
    }

    let accepted = SocketHandle::new(NOPORT);
    {
        let mut accepted_inner = accepted.inner.lock().unwrap();
        accepted_inner.kind = SocketKind::Peer {
            read_pipe: connector_to_acceptor,
            write_pipe: acceptor_to_connector,
        };
    }
    stream::install_stream(
        pairs[0].1,
        Arc::new(SocketStream(accepted)) as Arc<dyn Stream>,
    );

    *request.outcome.state.lock().unwrap() = ConnectState::Accepted;
    request.outcome.done.notify_all();

    debug!("accept: fid {fid} accepted connection as fid {}", pairs[0].0);
    Ok(pairs[0].0)
}

/// Connects an unbound socket to a listener on `port`, blocking until the
/// listener accepts, refuses (e.g. the port is shut down while queued), or
/// `timeout` elapses.
pub fn connect(fid: Fid, port: Port, timeout: Option<Duration>) -> Result<()> {
    check_port(port)?;
    let connector = get_socket(fid)?;
    {
        let inner = connector.inner.lock().unwrap();
        if !matches!(inner.kind, SocketKind::Unbound) {
            return_errno_with_message!(Errno::EINVAL, "socket is already in use");
        }
    }

    let listener = {
        let tables = TABLES.lock().unwrap();
        tables
            .ports
            .get(&port)
            .and_then(Weak::upgrade)
            .ok_or_else(|| {
                crate::error::Error::with_message(Errno::ECONNREFUSED, "no listener on that port")
            })?
    };

    let outcome = Arc::new(ConnectOutcome {
        state: Mutex::new(ConnectState::Pending),
        done: Condvar::new(),
    });
    {
        let mut listener_inner = listener.inner.lock().unwrap();
        match &mut listener_inner.kind {
            SocketKind::Listener { queue } => queue.push_back(ConnectRequest {
                connector: connector.clone(),
                outcome: outcome.clone(),
            }),
            _ => return_errno_with_message!(Errno::ECONNREFUSED, "listener shut down"),
        }
        listener.req_available.notify_all();
    }

    let mut guard = outcome.state.lock().unwrap();
    let deadline = timeout.map(|d| Instant::now() + d);
    loop {
        match *guard {
            ConnectState::Accepted => return Ok(()),
            ConnectState::Refused => {
                return_errno_with_message!(Errno::ECONNREFUSED, "connection was refused")
            }
            ConnectState::Pending => {}
        }
        trace!("connect: fid {fid} blocking on port {port}'s connect outcome");
        guard = match deadline {
            None => outcome.done.wait(guard).unwrap(),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    warn!("connect: fid {fid} timed out waiting on port {port}");
                    return_errno_with_message!(Errno::ETIMEDOUT, "connect timed out");
                }
                let (g, result) = outcome.done.wait_timeout(guard, deadline - now).unwrap();
                if result.timed_out() && matches!(*g, ConnectState::Pending) {
                    warn!("connect: fid {fid} timed out waiting on port {port}");
                    return_errno_with_message!(Errno::ETIMEDOUT, "connect timed out");
                }
                g
            }
        };
    }
}

/// Shuts down a socket's read side, write side, or both. Only legal on a
/// connected `PEER` socket; a listener or an unbound socket fails instead
/// of being torn down as a side effect.
pub fn shutdown(fid: Fid, mode: ShutdownMode) -> Result<()> {
    let handle = get_socket(fid)?;
    let mut inner = handle.inner.lock().unwrap();
    match &mut inner.kind {
        SocketKind::Peer {
            read_pipe,
            write_pipe,
        } => {
            match mode {
                ShutdownMode::Read => pipe::reader_close(read_pipe),
                ShutdownMode::Write => pipe::writer_close(write_pipe),
                ShutdownMode::Both => {
                    pipe::reader_close(read_pipe);
                    pipe::writer_close(write_pipe);
                }
            }
            Ok(())
        }
        SocketKind::Listener { .. } => {
            return_errno_with_message!(Errno::EINVAL, "ShutDown is only legal on a connected PEER socket")
        }
        SocketKind::Unbound => {
            return_errno_with_message!(Errno::ENOTCONN, "socket is neither listening nor connected")
        }
    }
}
