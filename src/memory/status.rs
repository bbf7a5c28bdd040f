//! Status codes shared by the page source, its providers and the fault loop.
//!
//! Everything is expressed as an errno so results compose with the rest of the
//! kernel's `syscall::error::Result` plumbing. A few codes carry a meaning that
//! is specific to paging and get named aliases here.

pub use syscall::error::{
    Error, Result, EAGAIN, EBADFD, EBADMSG, ECANCELED, EEXIST, EFAULT, EINTR, EINVAL, EIO, ENOBUFS,
    ENOENT, ENOMEM, ENOSPC, EOPNOTSUPP, ERESTART, ETIMEDOUT,
};

/// Work was handed off; block on the populated request, then retry.
pub const SHOULD_WAIT: i32 = EAGAIN;

/// The waiting thread was killed.
pub const INTR_KILLED: i32 = EINTR;

/// The waiting thread was suspended; the caller should unwind and retry.
pub const INTR_RETRY: i32 = ERESTART;

/// The request was dropped because its source went away.
pub const REQUEST_CANCELED: i32 = ECANCELED;

pub fn should_wait() -> Error {
    Error::new(SHOULD_WAIT)
}

pub fn is_should_wait(result: &Result<()>) -> bool {
    matches!(result, Err(err) if err.errno == SHOULD_WAIT)
}
