// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    deadline::Deadline,
    fail::Fail,
    network::{
        last_errno,
        should_retry,
        wait_ready,
    },
    reactor::{
        EventFlags,
        Poller,
    },
};
use ::socket2::{
    Domain,
    Protocol,
    SockAddr,
    Type,
};
use ::std::{
    mem::MaybeUninit,
    net::SocketAddr,
    os::fd::{
        AsRawFd,
        RawFd,
    },
    slice,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A connected, nonblocking TCP stream. Closing is dropping: the poller field comes first, so the reactor
/// registration is gone before the descriptor is.
pub struct Socket {
    poller: Poller,
    socket: ::socket2::Socket,
}

/// A listening TCP socket.
pub struct Listener {
    poller: Poller,
    socket: ::socket2::Socket,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Socket {
    /// Opens a connection to `remote`, suspending the calling task until the handshake finishes. A nonblocking
    /// connect reports completion through writability, after which `SO_ERROR` tells success from failure.
    pub async fn connect(remote: SocketAddr, deadline: Deadline) -> Result<Self, Fail> {
        let poller: Poller = Poller::new()?;
        let socket: ::socket2::Socket = new_stream_socket(Domain::for_address(remote))?;
        let me: Self = Self { poller, socket };
        let fd: RawFd = me.socket.as_raw_fd();
        match me.socket.connect(&SockAddr::from(remote)) {
            Ok(()) => {},
            Err(error) => {
                let errno: i32 = last_errno(&error);
                if !should_retry(errno) {
                    let cause: String = format!("failed to connect to {}: {}", remote, errno);
                    error!("connect(): {}", &cause);
                    return Err(Fail::new(errno, &cause));
                }
                wait_ready(&me.poller, fd, EventFlags::WRITE, "connect", deadline).await?;
                check_connect_outcome(&me.socket, remote)?;
            },
        }
        if me.socket.set_nodelay(true).is_err() {
            warn!("connect(): cannot set TCP_NODELAY option");
        }
        trace!("connection established ({:?})", me.socket);
        Ok(me)
    }

    /// Wraps a freshly accepted descriptor.
    fn from_accepted(socket: ::socket2::Socket) -> Result<Self, Fail> {
        Ok(Self {
            poller: Poller::new()?,
            socket,
        })
    }

    /// Parks the calling task until the socket has readable data (or an error condition to report).
    pub async fn wait_readable(&self, deadline: Deadline) -> Result<(), Fail> {
        let fd: RawFd = self.socket.as_raw_fd();
        wait_ready(&self.poller, fd, EventFlags::READ, "wait_readable", deadline).await
    }

    /// Parks the calling task until the socket accepts more outgoing data.
    pub async fn wait_writable(&self, deadline: Deadline) -> Result<(), Fail> {
        let fd: RawFd = self.socket.as_raw_fd();
        wait_ready(&self.poller, fd, EventFlags::WRITE, "wait_writable", deadline).await
    }

    /// Receives whatever is available into `buf`, parking until at least one byte arrives. Returns the number of
    /// bytes received; zero means the peer closed its end.
    pub async fn recv_some(&self, buf: &mut [u8], deadline: Deadline) -> Result<usize, Fail> {
        if buf.is_empty() {
            return Err(Fail::new(libc::EINVAL, "recv_some(): zero-length buffer"));
        }
        let fd: RawFd = self.socket.as_raw_fd();
        loop {
            // The kernel only writes into this slice, so viewing the initialized buffer as uninitialized is sound.
            let spare: &mut [MaybeUninit<u8>] =
                unsafe { slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut MaybeUninit<u8>, buf.len()) };
            match self.socket.recv(spare) {
                Ok(nbytes) => {
                    trace!("data received ({:?}/{:?} bytes)", nbytes, buf.len());
                    return Ok(nbytes);
                },
                Err(error) => {
                    let errno: i32 = last_errno(&error);
                    if !should_retry(errno) {
                        let cause: String = format!("failed to receive on socket: {}", errno);
                        error!("recv_some(): {}", &cause);
                        return Err(Fail::new(errno, &cause));
                    }
                },
            }
            wait_ready(&self.poller, fd, EventFlags::READ, "recv_some", deadline).await?;
        }
    }

    /// Fills `buf` completely. A peer that closes before the fill completes turns into `ECONNRESET`.
    pub async fn recv_all(&self, buf: &mut [u8], deadline: Deadline) -> Result<(), Fail> {
        let total: usize = buf.len();
        let mut received: usize = 0;
        while received < total {
            let nbytes: usize = self.recv_some(&mut buf[received..], deadline).await?;
            if nbytes == 0 {
                let cause: String = format!("connection closed after {} of {} bytes", received, total);
                error!("recv_all(): {}", &cause);
                return Err(Fail::new(libc::ECONNRESET, &cause));
            }
            received += nbytes;
        }
        Ok(())
    }

    /// Sends all of `buf`, parking whenever the kernel buffer is full.
    pub async fn send_all(&self, buf: &[u8], deadline: Deadline) -> Result<(), Fail> {
        let fd: RawFd = self.socket.as_raw_fd();
        let mut sent: usize = 0;
        while sent < buf.len() {
            match self.socket.send(&buf[sent..]) {
                Ok(nbytes) => {
                    trace!("data pushed ({:?}/{:?} bytes)", nbytes, buf.len());
                    sent += nbytes;
                },
                Err(error) => {
                    let errno: i32 = last_errno(&error);
                    if !should_retry(errno) {
                        let cause: String = format!("failed to send on socket: {}", errno);
                        error!("send_all(): {}", &cause);
                        return Err(Fail::new(errno, &cause));
                    }
                    wait_ready(&self.poller, fd, EventFlags::WRITE, "send_all", deadline).await?;
                },
            }
        }
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Fail> {
        as_inet_addr(self.socket.local_addr().map_err(Fail::from)?, "local_addr")
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, Fail> {
        as_inet_addr(self.socket.peer_addr().map_err(Fail::from)?, "peer_addr")
    }

    pub fn set_nodelay(&self, enable: bool) -> Result<(), Fail> {
        self.socket.set_nodelay(enable).map_err(Fail::from)
    }
}

impl Listener {
    /// Binds a listening socket to `local`. Must run on a task, since accepted connections report readiness
    /// through the calling runtime's reactor.
    pub fn bind(local: SocketAddr, backlog: i32) -> Result<Self, Fail> {
        let poller: Poller = Poller::new()?;
        let socket: ::socket2::Socket = new_stream_socket(Domain::for_address(local))?;
        if socket.set_reuse_address(true).is_err() {
            warn!("bind(): cannot set SO_REUSEADDR option");
        }
        if let Err(error) = socket.bind(&SockAddr::from(local)) {
            let errno: i32 = last_errno(&error);
            let cause: String = format!("failed to bind to {}: {}", local, errno);
            error!("bind(): {}", &cause);
            return Err(Fail::new(errno, &cause));
        }
        if let Err(error) = socket.listen(backlog) {
            let errno: i32 = last_errno(&error);
            let cause: String = format!("failed to listen on {}: {}", local, errno);
            error!("bind(): {}", &cause);
            return Err(Fail::new(errno, &cause));
        }
        Ok(Self { poller, socket })
    }

    /// Takes the next incoming connection, parking the calling task until one arrives.
    pub async fn accept(&self, deadline: Deadline) -> Result<(Socket, SocketAddr), Fail> {
        let fd: RawFd = self.socket.as_raw_fd();
        loop {
            match self.socket.accept() {
                Ok((accepted, peer)) => {
                    trace!("connection accepted ({:?})", accepted);
                    if let Err(error) = accepted.set_nonblocking(true) {
                        let errno: i32 = last_errno(&error);
                        let cause: String = format!("cannot make accepted socket nonblocking: {}", errno);
                        error!("accept(): {}", &cause);
                        return Err(Fail::new(errno, &cause));
                    }
                    if accepted.set_nodelay(true).is_err() {
                        warn!("accept(): cannot set TCP_NODELAY option");
                    }
                    let peer: SocketAddr = as_inet_addr(peer, "accept")?;
                    return Ok((Socket::from_accepted(accepted)?, peer));
                },
                Err(error) => {
                    let errno: i32 = last_errno(&error);
                    if !should_retry(errno) {
                        let cause: String = format!("failed to accept: {}", errno);
                        error!("accept(): {}", &cause);
                        return Err(Fail::new(errno, &cause));
                    }
                },
            }
            wait_ready(&self.poller, fd, EventFlags::READ, "accept", deadline).await?;
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Fail> {
        as_inet_addr(self.socket.local_addr().map_err(Fail::from)?, "local_addr")
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

fn new_stream_socket(domain: Domain) -> Result<::socket2::Socket, Fail> {
    let socket: ::socket2::Socket = match ::socket2::Socket::new(domain, Type::STREAM, Some(Protocol::TCP)) {
        Ok(socket) => socket,
        Err(error) => {
            let errno: i32 = last_errno(&error);
            let cause: String = format!("failed to create socket: {}", errno);
            error!("new_stream_socket(): {}", &cause);
            return Err(Fail::new(errno, &cause));
        },
    };
    if let Err(error) = socket.set_nonblocking(true) {
        let errno: i32 = last_errno(&error);
        let cause: String = format!("cannot make socket nonblocking: {}", errno);
        error!("new_stream_socket(): {}", &cause);
        return Err(Fail::new(errno, &cause));
    }
    Ok(socket)
}

/// Reads `SO_ERROR` after a writability event ended an in-progress connect.
fn check_connect_outcome(socket: &::socket2::Socket, remote: SocketAddr) -> Result<(), Fail> {
    match socket.take_error() {
        Ok(None) => Ok(()),
        Ok(Some(error)) => {
            let errno: i32 = last_errno(&error);
            let cause: String = format!("failed to connect to {}: {}", remote, errno);
            error!("connect(): {}", &cause);
            Err(Fail::new(errno, &cause))
        },
        Err(error) => {
            let cause: String = format!("cannot read SO_ERROR: {}", error);
            error!("connect(): {}", &cause);
            Err(Fail::from(error))
        },
    }
}

fn as_inet_addr(addr: SockAddr, what: &str) -> Result<SocketAddr, Fail> {
    match addr.as_socket() {
        Some(addr) => Ok(addr),
        None => {
            let cause: String = format!("{}(): not an inet address", what);
            error!("{}", &cause);
            Err(Fail::new(libc::EAFNOSUPPORT, &cause))
        },
    }
}
