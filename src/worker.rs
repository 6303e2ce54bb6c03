//! The unprivileged worker process side.
//!
//! All kernel routing access goes through [`Worker::request_route`]; the
//! worker never opens a routing socket itself.  The syscall sandbox
//! enforces this by leaving `socket(2)` off the allow-list.

use crate::{
    error::Error,
    imsg::{Command, Handler, Response},
};
use derive_more::From;
use nix::errno::Errno;

/// Client for privileged operations on the worker's end of the channel.
#[derive(Debug, From)]
pub struct Worker {
    handler: Handler,
}

impl Worker {
    /// Relay a routing message to the kernel through the privileged process.
    ///
    /// `protocol` selects the kernel routing protocol family; `message` is
    /// the raw outbound routing message.  The call suspends until the
    /// relay's response arrives; there is never more than one privileged
    /// request in flight per worker.
    pub async fn request_route(&self, protocol: u64, message: &[u8]) -> Result<Vec<u8>, Error> {
        self.request(Command::Route.into(), protocol, message).await
    }

    async fn request(&self, cmd: u32, flags: u64, data: &[u8]) -> Result<Vec<u8>, Error> {
        self.handler.send_request(cmd, flags, data).await?;

        let response = self
            .handler
            .recv_response()
            .await?
            .ok_or(Error::ClosedChannel)?;

        response_result(response)
    }
}

/// Translate a relay response back into a local result.
fn response_result(response: Response) -> Result<Vec<u8>, Error> {
    if response.status == 0 {
        return Ok(response.data);
    }

    match Errno::from_i32(response.status) {
        Errno::EOPNOTSUPP => Err(Error::Unsupported),
        errno => Err(Error::Relay(nix::Error::from_errno(errno))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::Relay;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_command_surfaces_exactly() {
        let (a, b) = Handler::pair().unwrap();
        let relay = Relay::from(a);
        tokio::spawn(async move { relay.serve().await });

        let worker = Worker::from(b);
        let err = worker.request(0xbeef, 0, b"").await.unwrap_err();
        assert!(matches!(err, Error::Unsupported));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_closed_channel() {
        let (a, b) = Handler::pair().unwrap();
        drop(a);

        let worker = Worker::from(b);
        assert!(worker.request_route(0, b"").await.is_err());
    }

    #[test]
    fn test_response_mapping() {
        assert!(matches!(
            response_result(Response::ok(b"reply".to_vec())),
            Ok(data) if data == b"reply"
        ));
        assert!(matches!(
            response_result(Response::error(nix::Error::Sys(Errno::EOPNOTSUPP))),
            Err(Error::Unsupported)
        ));
        assert!(matches!(
            response_result(Response::error(nix::Error::Sys(Errno::ENOBUFS))),
            Err(Error::Relay(Errno::ENOBUFS))
        ));
    }
}
