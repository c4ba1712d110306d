// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Nonblocking I/O wrappers over the reactor.
//!
//! Sockets and pipes here add no scheduling semantics of their own: every operation is a syscall loop that parks the
//! task through a [`Poller`] whenever the kernel reports the descriptor as not ready. Descriptors are armed one-shot
//! per wait, so each wrapper supports one in-flight operation at a time.

pub mod pipe;
pub mod socket;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    deadline::Deadline,
    fail::Fail,
    reactor::{
        EventFlags,
        PollStatus,
        Poller,
    },
};
use ::std::{
    io,
    os::fd::RawFd,
};

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Whether a syscall that failed with `errno` should be retried after the descriptor becomes ready again.
pub(crate) fn should_retry(errno: i32) -> bool {
    errno == libc::EINPROGRESS
        || errno == libc::EWOULDBLOCK
        || errno == libc::EAGAIN
        || errno == libc::EALREADY
        || errno == libc::EINTR
}

/// Extracts the raw errno from an I/O error.
pub(crate) fn last_errno(error: &io::Error) -> i32 {
    error.raw_os_error().unwrap_or(libc::EIO)
}

/// Arms a one-shot watch for `events` on `fd` and parks until an event for that descriptor arrives. Events for
/// other descriptors sharing the poller are discarded; their owners re-arm before every wait. Error-class events
/// complete the wait normally, leaving the follow-up syscall to surface the actual errno.
pub(crate) async fn wait_ready(
    poller: &Poller,
    fd: RawFd,
    events: EventFlags,
    what: &str,
    deadline: Deadline,
) -> Result<(), Fail> {
    poller.add(fd, events)?;
    loop {
        match poller.next_event(deadline).await? {
            PollStatus::Event(event) => {
                if event.fd == fd {
                    return Ok(());
                }
            },
            PollStatus::NoEvents => {
                let cause: String = format!("{}: descriptor {} not ready before the deadline", what, fd);
                return Err(Fail::timed_out(&cause));
            },
            PollStatus::Interrupted => continue,
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        last_errno,
        should_retry,
    };
    use ::anyhow::Result;
    use ::std::io;

    #[test]
    fn test_should_retry_classification() -> Result<()> {
        crate::ensure_eq!(should_retry(libc::EWOULDBLOCK), true);
        crate::ensure_eq!(should_retry(libc::EINPROGRESS), true);
        crate::ensure_eq!(should_retry(libc::EINTR), true);
        crate::ensure_eq!(should_retry(libc::ECONNRESET), false);
        crate::ensure_eq!(should_retry(libc::EPIPE), false);
        Ok(())
    }

    #[test]
    fn test_last_errno_falls_back_to_eio() -> Result<()> {
        let os_error: io::Error = io::Error::from_raw_os_error(libc::ECONNREFUSED);
        crate::ensure_eq!(last_errno(&os_error), libc::ECONNREFUSED);

        let synthetic: io::Error = io::Error::other("no errno attached");
        crate::ensure_eq!(last_errno(&synthetic), libc::EIO);
        Ok(())
    }
}
