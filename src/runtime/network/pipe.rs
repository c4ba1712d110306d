// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    deadline::Deadline,
    fail::Fail,
    network::{
        should_retry,
        wait_ready,
    },
    reactor::{
        EventFlags,
        Poller,
    },
};
use ::std::os::fd::{
    AsRawFd,
    FromRawFd,
    OwnedFd,
    RawFd,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Both ends of an anonymous pipe, nonblocking and close-on-exec. The poller field comes first so the reactor
/// registrations are gone before the descriptors close.
///
/// Tests use these to drive readiness deterministically: nothing becomes readable until this process writes.
pub struct Pipe {
    poller: Poller,
    reader: OwnedFd,
    writer: Option<OwnedFd>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Pipe {
    pub fn open() -> Result<Self, Fail> {
        let poller: Poller = Poller::new()?;
        let mut fds: [RawFd; 2] = [-1, -1];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
            let errno: libc::c_int = unsafe { *libc::__errno_location() };
            let cause: String = format!("failed to create pipe: {}", errno);
            error!("open(): {}", &cause);
            return Err(Fail::new(errno, &cause));
        }
        Ok(Self {
            poller,
            reader: unsafe { OwnedFd::from_raw_fd(fds[0]) },
            writer: Some(unsafe { OwnedFd::from_raw_fd(fds[1]) }),
        })
    }

    /// Reads whatever is available into `buf`, parking until at least one byte arrives. Returns the number of
    /// bytes read; zero means the write end is closed and drained.
    pub async fn read_some(&self, buf: &mut [u8], deadline: Deadline) -> Result<usize, Fail> {
        if buf.is_empty() {
            return Err(Fail::new(libc::EINVAL, "read_some(): zero-length buffer"));
        }
        let fd: RawFd = self.reader.as_raw_fd();
        loop {
            let nread: isize = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if nread >= 0 {
                trace!("data read ({:?}/{:?} bytes)", nread, buf.len());
                return Ok(nread as usize);
            }
            let errno: libc::c_int = unsafe { *libc::__errno_location() };
            if !should_retry(errno) {
                let cause: String = format!("failed to read from pipe: {}", errno);
                error!("read_some(): {}", &cause);
                return Err(Fail::new(errno, &cause));
            }
            wait_ready(&self.poller, fd, EventFlags::READ, "read_some", deadline).await?;
        }
    }

    /// Writes all of `buf`, parking whenever the pipe buffer is full.
    pub async fn write_all(&self, buf: &[u8], deadline: Deadline) -> Result<(), Fail> {
        let fd: RawFd = match &self.writer {
            Some(writer) => writer.as_raw_fd(),
            None => return Err(Fail::new(libc::EBADF, "write_all(): write end is closed")),
        };
        let mut written: usize = 0;
        while written < buf.len() {
            let nwritten: isize = unsafe {
                libc::write(
                    fd,
                    buf[written..].as_ptr() as *const libc::c_void,
                    buf.len() - written,
                )
            };
            if nwritten >= 0 {
                trace!("data written ({:?}/{:?} bytes)", nwritten, buf.len());
                written += nwritten as usize;
                continue;
            }
            let errno: libc::c_int = unsafe { *libc::__errno_location() };
            if !should_retry(errno) {
                let cause: String = format!("failed to write to pipe: {}", errno);
                error!("write_all(): {}", &cause);
                return Err(Fail::new(errno, &cause));
            }
            wait_ready(&self.poller, fd, EventFlags::WRITE, "write_all", deadline).await?;
        }
        Ok(())
    }

    /// Closes the write end, so readers see end-of-file once the buffer drains.
    pub fn close_write(&mut self) {
        if let Some(writer) = self.writer.take() {
            self.poller.remove(writer.as_raw_fd());
        }
    }
}
