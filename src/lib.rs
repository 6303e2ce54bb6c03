//! Privilege-separation boundary of a network configuration daemon.
//!
//! The daemon splits into an unprivileged *worker* running all protocol
//! and policy logic and a privileged *relay* that sends messages on a
//! kernel routing socket on the worker's behalf.  The two sides exchange
//! typed request/response envelopes over a Unix socketpair.
//!
//! The [`relay`] executes one privileged command per request on a socket
//! that lives no longer than the call and refuses everything it does not
//! recognize.  The [`sandbox`] confines the worker, once privilege is
//! dropped, to a fixed syscall allow-list that excludes the syscall needed
//! to open routing sockets.
//!
//! Process setup (forking, privilege dropping, daemonization) is the
//! daemon's business.  Wire an inherited socketpair end into an
//! [`imsg::Handler`] on each side and hand it to [`Relay`] or [`Worker`].

mod error;
pub mod imsg;
pub mod net;
pub mod relay;
pub mod sandbox;
pub mod worker;

pub use {error::Error, relay::Relay, worker::Worker};
