use std::io;

use tracing::{debug, error};

/// Get the last os error, log with note and return the error
#[cfg(feature = "ibverbs")]
pub(crate) fn log_ret_last_os_err_with_note(note: &str) -> io::Error {
    let err = io::Error::last_os_error();
    if note.is_empty() {
        error!("OS error {:?}", err);
    } else {
        error!("OS error {:?}. Note: {}", err, note);
    }
    err
}

/// Logs the outcome of a release call made from `drop`.
///
/// Release failures can not be propagated out of `drop`, so they are only logged.
pub(crate) fn log_release(ret: io::Result<()>, what: &str) {
    match ret {
        Ok(()) => debug!("released {}", what),
        Err(err) => error!("failed to release {}: {:?}", what, err),
    }
}

/// Logs a result and return it back
pub(crate) fn log_ret<T>(ret: io::Result<T>, note: &str) -> io::Result<T> {
    if let Err(ref err) = ret {
        if note.is_empty() {
            error!("OS error {:?}", err);
        } else {
            error!("OS error {:?}. Note: {}", err, note);
        }
    }
    ret
}
