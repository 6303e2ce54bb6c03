//! Request/response envelopes between the worker and the privileged relay.
//!
//! The channel below the envelope is an ordered, reliable Unix socketpair;
//! the [`Handler`] only defines the payload framing: a fixed-layout header
//! followed by a variable-length, command-specific byte buffer.

use bytes::{BufMut, BytesMut};
use derive_more::Into;
use nix::{errno::Errno, unistd::close};
use parking_lot::Mutex;
use std::{
    io::{self, Result},
    mem,
    os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd},
    slice,
    sync::atomic::{AtomicBool, Ordering},
};
use tokio::net::UnixStream;
use zerocopy::{AsBytes, FromBytes};

/// Privileged commands served by the relay.
///
/// The set is closed on purpose: any new privileged capability has to be
/// added here explicitly and audited, never inferred from payload content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    /// Send a message on a kernel routing socket and relay the reply.
    Route = 1,
}

impl From<Command> for u32 {
    fn from(cmd: Command) -> Self {
        cmd as u32
    }
}

impl std::convert::TryFrom<u32> for Command {
    type Error = u32;

    fn try_from(value: u32) -> std::result::Result<Self, u32> {
        match value {
            v if v == Command::Route as u32 => Ok(Command::Route),
            v => Err(v),
        }
    }
}

/// Request frame header.
#[derive(Debug, AsBytes, FromBytes, Default)]
#[repr(C)]
pub struct RequestHeader {
    /// Command-specific scalar argument, e.g. a protocol selector.
    pub flags: u64,
    /// Requested command.
    pub cmd: u32,
    /// Payload length in bytes.
    pub length: u32,
}

impl RequestHeader {
    pub const LENGTH: usize = mem::size_of::<Self>();
}

/// Response frame header.
#[derive(Debug, AsBytes, FromBytes, Default)]
#[repr(C)]
pub struct ResponseHeader {
    /// Zero on success, the privileged side's OS error otherwise.
    pub status: i32,
    /// Result length in bytes.
    pub length: u32,
}

impl ResponseHeader {
    pub const LENGTH: usize = mem::size_of::<Self>();
}

/// A decoded request envelope.
#[derive(Debug)]
pub struct Request {
    pub cmd: u32,
    pub flags: u64,
    pub data: Vec<u8>,
}

/// A decoded response.
#[derive(Debug)]
pub struct Response {
    pub status: i32,
    pub data: Vec<u8>,
}

impl Response {
    /// Successful response carrying the privileged operation's result.
    pub fn ok(data: Vec<u8>) -> Self {
        Self { status: 0, data }
    }

    /// Failed response carrying the underlying OS error.
    pub fn error(err: nix::Error) -> Self {
        Self {
            status: err.as_errno().unwrap_or(Errno::EIO) as i32,
            data: Vec::new(),
        }
    }
}

/// Envelope handler on one end of the worker/relay socketpair.
#[derive(Debug, Into)]
pub struct Handler {
    /// Async half of a UNIX socketpair.
    socket: UnixStream,
    /// Set after the stream was shut down.
    shutdown: AtomicBool,
    /// Read buffer.
    read_buffer: Mutex<BytesMut>,
}

impl From<UnixStream> for Handler {
    fn from(socket: UnixStream) -> Self {
        Self {
            socket,
            shutdown: Default::default(),
            read_buffer: Mutex::new(BytesMut::with_capacity(Self::BUFFER_LENGTH)),
        }
    }
}

impl Handler {
    pub const BUFFER_LENGTH: usize = 0xffff;

    /// Maximum payload length of a single frame.
    pub const MAX_PAYLOAD: usize = 0xffff;

    /// Create a new handler pair.
    pub fn pair() -> Result<(Self, Self)> {
        UnixStream::pair().map(|(a, b)| (a.into(), b.into()))
    }

    /// Create one half of a handler pair from an inherited file descriptor.
    pub fn from_raw_fd<T: IntoRawFd>(fd: T) -> Result<Handler> {
        let socket = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd.into_raw_fd()) };
        socket.set_nonblocking(true)?;
        UnixStream::from_std(socket).map(Into::into)
    }

    /// Send a request envelope to the relay.
    pub async fn send_request(&self, cmd: u32, flags: u64, data: &[u8]) -> Result<()> {
        let header = RequestHeader {
            flags,
            cmd,
            length: payload_length(data)?,
        };
        self.send_frame(header.as_bytes(), data).await
    }

    /// Send a response back to the worker.
    pub async fn send_response(&self, response: &Response) -> Result<()> {
        let header = ResponseHeader {
            status: response.status,
            length: payload_length(&response.data)?,
        };
        self.send_frame(header.as_bytes(), &response.data).await
    }

    /// Receive the next request envelope; `None` once the peer is gone.
    pub async fn recv_request(&self) -> Result<Option<Request>> {
        let frame = match self
            .recv_frame(RequestHeader::LENGTH, |bytes| {
                let mut header = RequestHeader::default();
                header.as_bytes_mut().copy_from_slice(bytes);
                frame_length(RequestHeader::LENGTH, header.length)
            })
            .await?
        {
            Some(frame) => frame,
            None => return Ok(None),
        };

        let mut header = RequestHeader::default();
        header
            .as_bytes_mut()
            .copy_from_slice(&frame[..RequestHeader::LENGTH]);

        Ok(Some(Request {
            cmd: header.cmd,
            flags: header.flags,
            data: frame[RequestHeader::LENGTH..].to_vec(),
        }))
    }

    /// Receive the response to the request in flight.
    pub async fn recv_response(&self) -> Result<Option<Response>> {
        let frame = match self
            .recv_frame(ResponseHeader::LENGTH, |bytes| {
                let mut header = ResponseHeader::default();
                header.as_bytes_mut().copy_from_slice(bytes);
                frame_length(ResponseHeader::LENGTH, header.length)
            })
            .await?
        {
            Some(frame) => frame,
            None => return Ok(None),
        };

        let mut header = ResponseHeader::default();
        header
            .as_bytes_mut()
            .copy_from_slice(&frame[..ResponseHeader::LENGTH]);

        Ok(Some(Response {
            status: header.status,
            data: frame[ResponseHeader::LENGTH..].to_vec(),
        }))
    }

    /// Write one header-plus-payload frame, handling partial writes.
    async fn send_frame(&self, header: &[u8], data: &[u8]) -> Result<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "Handler is closed",
            ));
        }

        let mut frame = Vec::with_capacity(header.len() + data.len());
        frame.extend_from_slice(header);
        frame.extend_from_slice(data);

        let mut sent = 0;
        while sent < frame.len() {
            self.socket.writable().await?;

            match self.socket.try_write(&frame[sent..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => sent += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    /// Read from the socket until a complete frame is buffered.
    ///
    /// `total` maps the raw header bytes to the full frame length.
    async fn recv_frame<F>(&self, header_length: usize, total: F) -> Result<Option<BytesMut>>
    where
        F: Fn(&[u8]) -> Result<usize>,
    {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "Handler is closed",
            ));
        }

        loop {
            {
                let mut buf = self.read_buffer.lock();
                if buf.len() >= header_length {
                    let length = total(&buf[..header_length])?;
                    if buf.len() >= length {
                        return Ok(Some(buf.split_to(length)));
                    }
                }
            }

            // The buffer lock is never held across this yield point.
            self.socket.readable().await?;

            let mut buf = self.read_buffer.lock();
            buf.reserve(Self::BUFFER_LENGTH);
            let chunk = unsafe {
                let chunk = buf.chunk_mut();
                slice::from_raw_parts_mut(chunk.as_mut_ptr(), chunk.len())
            };

            match self.socket.try_read(chunk) {
                Ok(0) => {
                    return if buf.is_empty() {
                        Ok(None)
                    } else {
                        Err(io::ErrorKind::UnexpectedEof.into())
                    };
                }
                Ok(n) => unsafe { buf.advance_mut(n) },
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err),
            }
        }
    }

    /// Forcefully close the handler without dropping it.
    pub fn shutdown(&self) {
        let fd = self.as_raw_fd();
        let _ = close(fd);
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

impl AsRawFd for Handler {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

fn payload_length(data: &[u8]) -> Result<u32> {
    if data.len() > Handler::MAX_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "payload too large",
        ));
    }
    Ok(data.len() as u32)
}

fn frame_length(header_length: usize, payload: u32) -> Result<usize> {
    if payload as usize > Handler::MAX_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame too large",
        ));
    }
    Ok(header_length + payload as usize)
}
