//! Crate-wide error type.
//!
//! Mirrors the taxonomy in the reference: OS/libuv errors are recoverable
//! and carried in [`Error::Uv`], resource exhaustion is recoverable (unlike
//! the reference, which treats it as fatal), and contract violations are
//! not represented here at all — they fail fast via `panic!`/`debug_assert!`
//! at the call site instead of being returned.

use uv::uv_errno_t;

pub type Result<T> = std::result::Result<T, Error>;

/// A libuv errno, mapped to its symbolic name.
///
/// Only the handful of codes this crate's watchers and loop driver actually
/// surface are named; everything else round-trips through `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UvErrno {
    Eof,
    Enomem,
    Eagain,
    Ecanceled,
    Ebusy,
    Einval,
    Esrch,
    Other(i32),
}

impl UvErrno {
    pub(crate) fn from_raw(code: std::os::raw::c_int) -> UvErrno {
        match code as uv_errno_t {
            uv::uv_errno_t_UV_EOF => UvErrno::Eof,
            uv::uv_errno_t_UV_ENOMEM => UvErrno::Enomem,
            uv::uv_errno_t_UV_EAGAIN => UvErrno::Eagain,
            uv::uv_errno_t_UV_ECANCELED => UvErrno::Ecanceled,
            uv::uv_errno_t_UV_EBUSY => UvErrno::Ebusy,
            uv::uv_errno_t_UV_EINVAL => UvErrno::Einval,
            uv::uv_errno_t_UV_ESRCH => UvErrno::Esrch,
            other => UvErrno::Other(other as i32),
        }
    }
}

impl std::fmt::Display for UvErrno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UvErrno::Eof => write!(f, "EOF"),
            UvErrno::Enomem => write!(f, "out of memory"),
            UvErrno::Eagain => write!(f, "resource temporarily unavailable"),
            UvErrno::Ecanceled => write!(f, "operation canceled"),
            UvErrno::Ebusy => write!(f, "resource busy or locked"),
            UvErrno::Einval => write!(f, "invalid argument"),
            UvErrno::Esrch => write!(f, "no such process"),
            UvErrno::Other(code) => write!(f, "libuv error {code}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("libuv error: {0}")]
    Uv(UvErrno),

    #[error("allocation failed: {0}")]
    ResourceExhausted(&'static str),

    #[error("process spawn failed: {0}")]
    SpawnFailed(UvErrno),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn from_code(code: std::os::raw::c_int) -> Error {
        Error::Uv(UvErrno::from_raw(code))
    }
}

#[inline]
pub(crate) fn uvret(code: std::os::raw::c_int) -> Result<()> {
    if code < 0 {
        Err(Error::from_code(code))
    } else {
        Ok(())
    }
}
