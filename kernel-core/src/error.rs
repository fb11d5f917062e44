// SPDX-License-Identifier: MPL-2.0

#![allow(dead_code)]

/// Error number.
///
/// Only the subset of POSIX errno values this kernel core actually returns.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Errno {
    EAGAIN = 11,      /* Try again */
    EBADF = 9,        /* Bad file number */
    ECHILD = 10,      /* No child processes */
    ECONNREFUSED = 111, /* Connection refused */
    EADDRINUSE = 98,  /* Address already in use */
    EINVAL = 22,      /* Invalid argument */
    ENFILE = 23,      /* File table overflow */
    EMFILE = 24,      /* Too many open files */
    ENXIO = 6,        /* No such device or address */
    ENOTCONN = 107,   /* Transport endpoint is not connected */
    EPIPE = 32,       /* Broken pipe */
    ESHUTDOWN = 108,  /* Cannot send after transport endpoint shutdown */
    ESRCH = 3,        /* No such process */
    ETIMEDOUT = 110,  /* Connection timed out */
}

/// The error type used throughout this crate.
#[derive(Debug, Clone, Copy)]
pub struct Error {
    errno: Errno,
    msg: Option<&'static str>,
}

impl Error {
    pub const fn new(errno: Errno) -> Self {
        Error { errno, msg: None }
    }

    pub const fn with_message(errno: Errno, msg: &'static str) -> Self {
        Error {
            errno,
            msg: Some(msg),
        }
    }

    pub const fn error(&self) -> Errno {
        self.errno
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::new(errno)
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.msg {
            Some(msg) => write!(f, "{:?}: {}", self.errno, msg),
            None => write!(f, "{:?}", self.errno),
        }
    }
}

impl std::error::Error for Error {}

#[macro_export]
macro_rules! return_errno {
    ($errno:expr) => {
        return Err($crate::error::Error::new($errno))
    };
}

#[macro_export]
macro_rules! return_errno_with_message {
    ($errno:expr, $message:expr) => {
        return Err($crate::error::Error::with_message($errno, $message))
    };
}
