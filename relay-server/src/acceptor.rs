//! Single-threaded readiness loop: accepts sockets and dispatches read-ready events to the
//! worker pool (spec.md §4.7). Ancestor: `RcServer::listen`
//! (`examples/original_source/src/server.cpp`), rebuilt on `mio::Poll` in place of `epoll_wait`
//! directly, with `EPOLLONESHOT` played by `PollOpt::oneshot()`.

use std::io;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Poll, PollOpt, Ready, Token};
use slog::Logger;

use relay_core::ClientRegistry;
use relay_wire::{decode_one, DecodeOutcome, FrameType, ERR_CAPACITY};

use crate::dispatcher::{Dispatcher, Outcome};
use crate::net::{ConnectionIo, TcpSink};
use crate::worker::ThreadPool;

const SERVER_TOKEN: Token = Token(0);
const FIRST_CLIENT_TOKEN: usize = 1;

/// Default ceiling on a single frame's declared `size` (spec.md §4.1); guards against a
/// malicious or buggy peer claiming an unbounded frame and exhausting memory.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// One-shot re-arm / teardown request a worker thread posts back to the acceptor after
/// handling a connection's readiness event. `mio::Poll`'s registration table is treated as
/// owned solely by the acceptor thread (spec.md §5); this is the funnel workers use instead
/// of touching `Poll` themselves.
enum Control {
    Rearm(Token),
    Close(Token),
}

struct Connection {
    io: Arc<ConnectionIo>,
    client: Arc<relay_core::Client>,
}

pub struct Acceptor {
    poll: Poll,
    listener: TcpListener,
    connections: std::collections::HashMap<Token, Connection>,
    next_token: usize,
    control_tx: mpsc::Sender<Control>,
    control_rx: mpsc::Receiver<Control>,
    clients: Arc<ClientRegistry>,
    dispatcher: Arc<Dispatcher>,
    workers: Arc<ThreadPool>,
    log: Logger,
}

impl Acceptor {
    /// Binds the listening socket. Exit codes follow spec.md §6: `1` if the readiness
    /// notifier itself cannot be created, `2` on an address/bind failure, `3` if the bound
    /// listener cannot be registered for readiness (the nearest equivalent this stack has to
    /// the original's separate `listen()` step, since `mio::net::TcpListener::bind` folds
    /// socket/bind/listen into one call).
    pub fn bind(
        addr: &str,
        clients: Arc<ClientRegistry>,
        dispatcher: Arc<Dispatcher>,
        workers: Arc<ThreadPool>,
        log: Logger,
    ) -> Acceptor {
        let poll = Poll::new().unwrap_or_else(|err| {
            eprintln!("could not create readiness notifier: {err}");
            std::process::exit(1);
        });

        let socket_addr: SocketAddr = addr.parse().unwrap_or_else(|err| {
            eprintln!("invalid bind address {addr}: {err}");
            std::process::exit(2);
        });

        let listener = TcpListener::bind(&socket_addr).unwrap_or_else(|err| {
            eprintln!("could not bind to {addr}: {err}");
            std::process::exit(2);
        });

        poll.register(&listener, SERVER_TOKEN, Ready::readable(), PollOpt::edge()).unwrap_or_else(|err| {
            eprintln!("could not register listener for readiness: {err}");
            std::process::exit(3);
        });

        let (control_tx, control_rx) = mpsc::channel();

        slog::info!(log, "relay listening"; "addr" => addr);

        Acceptor {
            poll,
            listener,
            connections: std::collections::HashMap::new(),
            next_token: FIRST_CLIENT_TOKEN,
            control_tx,
            control_rx,
            clients,
            dispatcher,
            workers,
            log,
        }
    }

    /// The address actually bound, useful when `bind` was given port `0` (tests rely on this
    /// to discover the ephemeral port the OS assigned).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the readiness loop forever. A short poll timeout lets the loop periodically
    /// drain `control_rx` without a dedicated wakeup mechanism for the control channel.
    pub fn run(&mut self) -> ! {
        let mut events = Events::with_capacity(1024);
        loop {
            self.poll.poll(&mut events, Some(Duration::from_millis(100))).expect("poll failed");

            for event in &events {
                if event.token() == SERVER_TOKEN {
                    self.accept_all();
                } else {
                    self.on_readable(event.token());
                }
            }

            self.drain_control();
        }
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => self.accept_one(stream, addr),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    slog::warn!(self.log, "accept failed"; "error" => %err);
                    break;
                }
            }
        }
    }

    fn accept_one(&mut self, stream: TcpStream, addr: SocketAddr) {
        let io = Arc::new(ConnectionIo::new(stream));
        let sink = Box::new(TcpSink::new(Arc::clone(&io)));

        let client = match self.clients.add(sink) {
            Ok(client) => client,
            Err(_) => {
                // Mirrors `ClientRegistry::add`'s contract (spec.md §4.5): over capacity, the
                // connection never gets a `Client`/dispatcher at all, so the error frame is
                // written directly to the raw socket.
                let response = relay_wire::encode(ERR_CAPACITY, FrameType::SvrConnect, b"server is full");
                let _ = io.write_all(&response);
                io.shutdown();
                slog::warn!(self.log, "rejected connection: server full"; "addr" => %addr);
                return;
            }
        };

        let token = Token(self.next_token);
        self.next_token += 1;

        io.register(&self.poll, token).expect("registering a fresh connection cannot fail");

        slog::debug!(self.log, "accepted connection"; "addr" => %addr, "client_id" => client.id());
        self.connections.insert(token, Connection { io, client });
    }

    fn on_readable(&mut self, token: Token) {
        let conn = match self.connections.get(&token) {
            Some(conn) => conn,
            None => return,
        };
        let io = Arc::clone(&conn.io);
        let client = Arc::clone(&conn.client);
        let dispatcher = Arc::clone(&self.dispatcher);
        let control_tx = self.control_tx.clone();

        self.workers.execute(move || {
            let outcome = service_connection(&io, &client, &dispatcher);
            let control = match outcome {
                ConnOutcome::KeepOpen => Control::Rearm(token),
                ConnOutcome::Close => {
                    dispatcher.disconnect(&client);
                    io.shutdown();
                    Control::Close(token)
                }
            };
            let _ = control_tx.send(control);
        });
    }

    fn drain_control(&mut self) {
        while let Ok(control) = self.control_rx.try_recv() {
            match control {
                Control::Rearm(token) => {
                    if let Some(conn) = self.connections.get(&token) {
                        let _ = conn.io.reregister(&self.poll, token);
                    }
                }
                Control::Close(token) => {
                    if let Some(conn) = self.connections.remove(&token) {
                        let _ = conn.io.deregister(&self.poll);
                    }
                }
            }
        }
    }
}

enum ConnOutcome {
    KeepOpen,
    Close,
}

/// Reads everything currently available, decodes as many complete frames as are buffered,
/// and runs each through the dispatcher in order. Runs entirely off the acceptor thread
/// (spec.md §4.7: "do not read on the acceptor thread").
fn service_connection(io: &Arc<ConnectionIo>, client: &Arc<relay_core::Client>, dispatcher: &Arc<Dispatcher>) -> ConnOutcome {
    match io.pump_readable() {
        Ok(true) => {}
        Ok(false) | Err(_) => return ConnOutcome::Close,
    }

    let mut should_close = false;
    io.with_read_buf(|buf| {
        let mut offset = 0;
        loop {
            match decode_one(&buf[offset..], MAX_FRAME_SIZE) {
                Ok(DecodeOutcome::Frame { frame, consumed }) => {
                    offset += consumed;
                    if dispatcher.handle_frame(client, frame) == Outcome::Disconnect {
                        should_close = true;
                        break;
                    }
                }
                Ok(DecodeOutcome::Incomplete) => break,
                Err(_) => {
                    should_close = true;
                    break;
                }
            }
        }
        offset
    });

    if should_close {
        ConnOutcome::Close
    } else {
        ConnOutcome::KeepOpen
    }
}
