// SPDX-License-Identifier: MPL-2.0

/// Error number.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Errno {
    EPERM = 1,    /* Operation not permitted */
    ENOENT = 2,   /* No such file or directory */
    EIO = 5,      /* I/O error */
    EAGAIN = 11,  /* Try again */
    ENOMEM = 12,  /* Out of memory */
    EBUSY = 16,   /* Device or resource busy */
    EEXIST = 17,  /* File exists */
    ENOTDIR = 20, /* Not a directory */
    EISDIR = 21,  /* Is a directory */
    EINVAL = 22,  /* Invalid argument */
    ENOSPC = 28,  /* No space left on device */
    EMLINK = 31,  /* Too many links */

    ENAMETOOLONG = 36, /* File name too long */
    ENOTEMPTY = 39,    /* Directory not empty */
    ELOOP = 40,        /* Too many symbolic links encountered */
    ENODATA = 61,      /* No data available */
    EOVERFLOW = 75,    /* Value too large for defined data type */
    EOPNOTSUPP = 95,   /* Operation not supported on transport endpoint */
    ETIMEDOUT = 110,   /* Connection timed out */
}

/// Error used across this crate.
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

    pub const fn message(&self) -> Option<&'static str> {
        self.msg
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::new(errno)
    }
}

impl AsRef<Error> for Error {
    fn as_ref(&self) -> &Error {
        self
    }
}

impl From<std::io::Error> for Error {
    fn from(io_error: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match io_error.kind() {
            ErrorKind::NotFound => Error::new(Errno::ENOENT),
            ErrorKind::AlreadyExists => Error::new(Errno::EEXIST),
            ErrorKind::InvalidInput => Error::new(Errno::EINVAL),
            ErrorKind::TimedOut => Error::new(Errno::ETIMEDOUT),
            ErrorKind::OutOfMemory => Error::new(Errno::ENOMEM),
            _ => Error::with_message(Errno::EIO, "I/O operation fails"),
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self.msg {
            Some(msg) => write!(f, "{:?}: {}", self.errno, msg),
            None => write!(f, "{:?}", self.errno),
        }
    }
}

impl std::error::Error for Error {}

#[macro_export]
macro_rules! return_errno {
    ($errno: expr) => {
        return Err($crate::error::Error::new($errno))
    };
}

#[macro_export]
macro_rules! return_errno_with_message {
    ($errno: expr, $message: expr) => {
        return Err($crate::error::Error::with_message($errno, $message))
    };
}
