//! The privileged relay process side.
//!
//! The relay holds the elevated privilege the worker gave up.  Its entire
//! job is to receive a tagged request, perform the one corresponding kernel
//! operation and send back the raw result or an error code.  The command
//! set is one entry long so the privileged surface stays auditable in full.

use crate::{
    error::Error,
    imsg::{Command, Handler, Request, Response},
    net::Fd,
};
use derive_more::From;
use log::{debug, warn};
use nix::{
    errno::Errno,
    sys::socket::{bind, recv, send, MsgFlags, NetlinkAddr, SockAddr},
};
use std::{convert::TryFrom, os::unix::io::AsRawFd};

/// Receive buffer for one kernel routing reply.
const REPLY_BUFFER: usize = 16 * 1024;

/// Privileged request handler on the relay's end of the channel.
#[derive(Debug, From)]
pub struct Relay {
    handler: Handler,
}

impl Relay {
    /// Serve requests one at a time until the worker closes the channel.
    ///
    /// No new request is read before the current response has been sent.
    pub async fn serve(&self) -> Result<(), Error> {
        while let Some(request) = self.handler.recv_request().await? {
            let response = handle(&request);
            self.handler.send_response(&response).await?;
        }
        Ok(())
    }
}

/// Dispatch a single request to its privileged operation.
///
/// Unrecognized commands are refused explicitly; the relay never silently
/// ignores a request and never executes one speculatively.
pub fn handle(request: &Request) -> Response {
    match Command::try_from(request.cmd) {
        Ok(Command::Route) => {
            debug!(
                "routing request, protocol {}, {} bytes",
                request.flags as libc::c_int,
                request.data.len()
            );
            match send_netlink(request.flags as libc::c_int, &request.data) {
                Ok(reply) => Response::ok(reply),
                Err(err) => {
                    warn!("routing request failed: {}", err);
                    Response::error(err)
                }
            }
        }
        Err(cmd) => {
            warn!("refusing unsupported privileged command {}", cmd);
            Response::error(nix::Error::Sys(Errno::EOPNOTSUPP))
        }
    }
}

/// Perform one netlink transaction on a dedicated socket.
///
/// The socket lives exactly as long as this call: the `Fd` wrapper closes
/// it on success and on every failing path.
fn send_netlink(protocol: libc::c_int, message: &[u8]) -> Result<Vec<u8>, nix::Error> {
    let fd = netlink_socket(protocol)?;

    bind(fd.as_raw_fd(), &SockAddr::Netlink(NetlinkAddr::new(0, 0)))?;
    send(fd.as_raw_fd(), message, MsgFlags::empty())?;

    let mut buf = vec![0u8; REPLY_BUFFER];
    let n = recv(fd.as_raw_fd(), &mut buf, MsgFlags::empty())?;
    buf.truncate(n);

    Ok(buf)
}

/// Open a kernel routing socket for the given protocol selector.
fn netlink_socket(protocol: libc::c_int) -> Result<Fd, nix::Error> {
    // `nix` only models the well-known netlink protocols, but the selector
    // is relayed verbatim from the request.
    let fd = unsafe {
        libc::socket(
            libc::AF_NETLINK,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC,
            protocol,
        )
    };
    if fd == -1 {
        return Err(nix::Error::Sys(Errno::last()));
    }
    Ok(Fd::from(fd))
}
