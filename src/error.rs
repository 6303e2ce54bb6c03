use derive_more::{Display, From};
use std::io;

/// Common errors.
#[derive(Debug, Display, From)]
pub enum Error {
    #[display(fmt = "I/O error: {}", "_0")]
    IoError(io::Error),
    #[display(fmt = "{}", "_0")]
    UnixError(nix::Error),
    #[display(fmt = "Unsupported privileged operation")]
    #[from(ignore)]
    Unsupported,
    #[display(fmt = "Privileged operation failed: {}", "_0")]
    #[from(ignore)]
    Relay(nix::Error),
    #[display(fmt = "Syscall filtering is not supported by this kernel")]
    #[from(ignore)]
    SandboxUnsupported,
    #[display(fmt = "Failed to install the syscall filter: {}", "_0")]
    #[from(ignore)]
    Sandbox(nix::Error),
    #[display(fmt = "Privsep channel closed")]
    #[from(ignore)]
    ClosedChannel,
}

impl std::error::Error for Error {}
