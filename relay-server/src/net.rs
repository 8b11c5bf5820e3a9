//! Transport glue: the `mio`-backed socket handle shared between the acceptor's readiness
//! loop and the [`relay_core::ClientSink`] a `Client` uses to push frames out.

use std::io::{self, Read, Write};
use std::sync::Mutex;

use mio::net::TcpStream;
use mio::{Poll, PollOpt, Ready, Token};
use relay_wire::Frame;

/// Everything a worker needs to read from and write to one connection, shared between the
/// acceptor's connection table and the `Client`'s sink so that a broadcast fan-out task can
/// write to a socket a dispatcher task is concurrently reading from.
pub struct ConnectionIo {
    stream: Mutex<TcpStream>,
    read_buf: Mutex<Vec<u8>>,
}

impl ConnectionIo {
    pub fn new(stream: TcpStream) -> ConnectionIo {
        ConnectionIo { stream: Mutex::new(stream), read_buf: Mutex::new(Vec::new()) }
    }

    /// Drains whatever is currently available on the socket into the connection's read
    /// buffer. Returns `Ok(false)` on a clean EOF (peer closed), `Err` on any other I/O
    /// failure; both are fatal for the connection. `Ok(true)` means the read stopped only
    /// because it would have blocked, which is the expected steady state for an edge
    /// triggered, non-blocking socket.
    pub fn pump_readable(&self) -> io::Result<bool> {
        let mut stream = self.stream.lock().unwrap();
        let mut buf = self.read_buf.lock().unwrap();
        let mut chunk = [0u8; 8192];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => return Ok(false),
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Runs `f` over the read buffer, consuming however many bytes it reports having used.
    /// `f` is expected to parse zero or more complete frames and report total bytes consumed.
    pub fn with_read_buf<F: FnOnce(&[u8]) -> usize>(&self, f: F) {
        let mut buf = self.read_buf.lock().unwrap();
        let consumed = f(&buf);
        if consumed > 0 {
            buf.drain(..consumed);
        }
    }

    pub fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        self.stream.lock().unwrap().write_all(bytes)
    }

    pub fn shutdown(&self) {
        let _ = self.stream.lock().unwrap().shutdown(std::net::Shutdown::Both);
    }

    /// Registers this connection's socket for one-shot, edge-triggered readability. Locking
    /// happens here rather than handing the stream out, matching every other accessor on this
    /// type.
    pub fn register(&self, poll: &Poll, token: Token) -> io::Result<()> {
        poll.register(&*self.stream.lock().unwrap(), token, Ready::readable(), PollOpt::edge() | PollOpt::oneshot())
    }

    pub fn reregister(&self, poll: &Poll, token: Token) -> io::Result<()> {
        poll.reregister(&*self.stream.lock().unwrap(), token, Ready::readable(), PollOpt::edge() | PollOpt::oneshot())
    }

    pub fn deregister(&self, poll: &Poll) -> io::Result<()> {
        poll.deregister(&*self.stream.lock().unwrap())
    }
}

/// The `relay_core::ClientSink` implementation backing every real connection.
pub struct TcpSink {
    io: std::sync::Arc<ConnectionIo>,
}

impl TcpSink {
    pub fn new(io: std::sync::Arc<ConnectionIo>) -> TcpSink {
        TcpSink { io }
    }
}

impl relay_core::ClientSink for TcpSink {
    fn send_frame(&self, frame: &Frame) -> io::Result<()> {
        let bytes = relay_wire::encode(frame.id, frame.frame_type, &frame.payload);
        self.io.write_all(&bytes)
    }
}
