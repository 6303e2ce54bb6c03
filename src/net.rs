//! Owned, droppable file descriptors.

use crate::error::Error;
use derive_more::{From, Into};
use nix::{
    fcntl::{fcntl, FcntlArg},
    unistd::close,
};
use std::{
    io,
    mem,
    os::unix::io::{AsRawFd, IntoRawFd, RawFd},
};

/// Wrapper for `RawFd` that closes the file descriptor when dropped.
///
/// The relay wraps every privileged socket in an `Fd` right after it is
/// opened, so all exit paths of a privileged operation release it.
#[derive(Debug, From, Into)]
pub struct Fd(RawFd);

impl Fd {
    /// Check if the file descriptor is valid.
    pub fn is_open(&self) -> Result<(), Error> {
        fcntl(self.0, FcntlArg::F_GETFD)
            .map(|_| ())
            .map_err(|err| io::Error::new(io::ErrorKind::NotConnected, err).into())
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        let _ = close(self.0);
    }
}

impl IntoRawFd for Fd {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.0;
        mem::forget(self);
        fd
    }
}

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;

    #[test]
    fn test_close_on_drop() {
        let (r, w) = pipe().unwrap();
        let fd = Fd::from(r);

        assert!(fd.is_open().is_ok());
        drop(fd);

        // The descriptor must be gone after the drop.
        assert!(fcntl(r, FcntlArg::F_GETFD).is_err());
        let _ = close(w);
    }
}
