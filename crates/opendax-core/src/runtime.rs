// SPDX-License-Identifier: MIT

//! The single-threaded, non-blocking connection loop.
//!
//! Every client connection, Unix-domain or TCP, is driven from one
//! `mio::Poll` on one thread: there is exactly one mutable [`Dispatcher`]
//! (and so exactly one [`crate::store::TagServer`]), so there is nothing to
//! lock. This mirrors the I/O-thread poll loop the transport layer this
//! crate's ambient stack is grounded on uses, collapsed onto a single
//! thread since the tag store itself is not `Sync`.

use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use mio::net::{UnixListener, UnixStream};
use mio::{Events, Interest, Poll, Token};

use crate::dispatch::Dispatcher;
use crate::events::ModuleId;
use crate::protocol::{self, MAX_FRAME_SIZE};

const TCP_LISTENER_TOKEN: Token = Token(0);
#[cfg(unix)]
const UNIX_LISTENER_TOKEN: Token = Token(1);
const CONNECTION_TOKEN_START: usize = 2;
const MAX_EVENTS: usize = 128;
const POLL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Where the server listens. Either address may be omitted.
#[derive(Debug, Clone, Default)]
pub struct ListenConfig {
    pub tcp_addr: Option<SocketAddr>,
    #[cfg(unix)]
    pub unix_path: Option<PathBuf>,
    #[cfg(not(unix))]
    pub unix_path: Option<PathBuf>,
}

enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Stream {
    fn register(&mut self, poll: &Poll, token: Token) -> io::Result<()> {
        let interest = Interest::READABLE | Interest::WRITABLE;
        match self {
            Stream::Tcp(s) => poll.registry().register(s, token, interest),
            #[cfg(unix)]
            Stream::Unix(s) => poll.registry().register(s, token, interest),
        }
    }

    fn deregister(&mut self, poll: &Poll) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => poll.registry().deregister(s),
            #[cfg(unix)]
            Stream::Unix(s) => poll.registry().deregister(s),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Stream::Unix(s) => s.flush(),
        }
    }
}

struct Connection {
    stream: Stream,
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
    module: Option<ModuleId>,
    /// True once this connection has completed a `MOD_REG(event)`
    /// registration — it carries only async notifications, and losing it
    /// must not tear down the module's sync-side registration.
    is_event_channel: bool,
}

/// Drives the poll loop. Construct once with a ready [`Dispatcher`] and a
/// [`ListenConfig`], then call [`Runtime::run`].
pub struct Runtime {
    poll: Poll,
    tcp_listener: Option<TcpListener>,
    #[cfg(unix)]
    unix_listener: Option<UnixListener>,
    connections: HashMap<Token, Connection>,
    module_tokens: HashMap<ModuleId, Token>,
    next_token: usize,
    dispatcher: Dispatcher,
}

impl Runtime {
    pub fn new(dispatcher: Dispatcher, config: ListenConfig) -> io::Result<Self> {
        let poll = Poll::new()?;

        let tcp_listener = match config.tcp_addr {
            Some(addr) => {
                let mut listener = TcpListener::bind(addr)?;
                poll.registry()
                    .register(&mut listener, TCP_LISTENER_TOKEN, Interest::READABLE)?;
                Some(listener)
            }
            None => None,
        };

        #[cfg(unix)]
        let unix_listener = match &config.unix_path {
            Some(path) => {
                let _ = std::fs::remove_file(path);
                let mut listener = UnixListener::bind(path)?;
                poll.registry()
                    .register(&mut listener, UNIX_LISTENER_TOKEN, Interest::READABLE)?;
                Some(listener)
            }
            None => None,
        };

        Ok(Runtime {
            poll,
            tcp_listener,
            #[cfg(unix)]
            unix_listener,
            connections: HashMap::new(),
            module_tokens: HashMap::new(),
            next_token: CONNECTION_TOKEN_START,
            dispatcher,
        })
    }

    /// Runs until `should_stop` returns `true`, checked once per poll tick.
    pub fn run(&mut self, mut should_stop: impl FnMut() -> bool) -> io::Result<()> {
        let mut events = Events::with_capacity(MAX_EVENTS);
        while !should_stop() {
            match self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                match event.token() {
                    TCP_LISTENER_TOKEN => self.accept_tcp(),
                    #[cfg(unix)]
                    UNIX_LISTENER_TOKEN => self.accept_unix(),
                    token => {
                        if event.is_readable() {
                            self.handle_readable(token);
                        }
                        if event.is_writable() {
                            self.flush(token);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn accept_tcp(&mut self) {
        let Some(listener) = &self.tcp_listener else { return };
        loop {
            match listener.accept() {
                Ok((stream, _addr)) => self.insert_connection(Stream::Tcp(stream)),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("tcp accept failed: {e}");
                    break;
                }
            }
        }
    }

    #[cfg(unix)]
    fn accept_unix(&mut self) {
        let Some(listener) = &self.unix_listener else { return };
        loop {
            match listener.accept() {
                Ok((stream, _addr)) => self.insert_connection(Stream::Unix(stream)),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("unix accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn insert_connection(&mut self, mut stream: Stream) {
        let token = Token(self.next_token);
        self.next_token += 1;
        if let Err(e) = stream.register(&self.poll, token) {
            log::warn!("failed to register connection: {e}");
            return;
        }
        self.connections.insert(
            token,
            Connection {
                stream,
                inbuf: Vec::new(),
                outbuf: Vec::new(),
                module: None,
                is_event_channel: false,
            },
        );
    }

    fn handle_readable(&mut self, token: Token) {
        let mut closed = false;
        {
            let Some(conn) = self.connections.get_mut(&token) else { return };
            let mut buf = [0u8; 4096];
            loop {
                match conn.stream.read(&mut buf) {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(n) => conn.inbuf.extend_from_slice(&buf[..n]),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        log::warn!("read error on token {:?}: {e}", token);
                        closed = true;
                        break;
                    }
                }
            }
        }

        self.drain_requests(token);

        if closed {
            self.close_connection(token);
        } else {
            self.flush(token);
        }
    }

    fn drain_requests(&mut self, token: Token) {
        loop {
            let decoded = {
                let Some(conn) = self.connections.get(&token) else { return };
                if conn.inbuf.len() > MAX_FRAME_SIZE * 4 {
                    log::warn!("connection {:?} exceeded inbound backlog, closing", token);
                    self.close_connection(token);
                    return;
                }
                match protocol::try_decode_request(&conn.inbuf) {
                    Ok(Some((req, consumed))) => Some((req, consumed)),
                    Ok(None) => None,
                    Err(_) => {
                        log::warn!("frame decode error on {:?}, closing connection", token);
                        self.close_connection(token);
                        return;
                    }
                }
            };

            let Some((req, consumed)) = decoded else { break };

            let from = self.connections.get(&token).and_then(|c| c.module);
            let is_mod_reg = matches!(req.command, protocol::Command::ModReg);
            // Both MOD_REG payload shapes (sync: timeout, flags, name; event:
            // module_id, flags) put the registration-channel flags in the
            // second u32, so this peek is shape-agnostic.
            let registers_event = is_mod_reg
                && req.payload.len() >= 8
                && u32::from_ne_bytes(req.payload[4..8].try_into().unwrap()) & protocol::REGISTER_EVENT != 0;
            let event_module_id = if registers_event {
                Some(u32::from_ne_bytes(req.payload[0..4].try_into().unwrap()))
            } else {
                None
            };
            let (frame, notifications) = self.dispatcher.handle(from, &req);

            if let Some(conn) = self.connections.get_mut(&token) {
                conn.inbuf.drain(0..consumed);
                if let Some(id) = event_module_id {
                    conn.module = Some(id);
                    conn.is_event_channel = true;
                    self.module_tokens.insert(id, token);
                } else if is_mod_reg
                    && conn.module.is_none()
                    && frame.len() >= protocol::FRAME_HEADER_SIZE + 4
                {
                    let id = u32::from_ne_bytes(
                        frame[protocol::FRAME_HEADER_SIZE..protocol::FRAME_HEADER_SIZE + 4]
                            .try_into()
                            .unwrap(),
                    );
                    conn.module = Some(id);
                }
                conn.outbuf.extend_from_slice(&frame);
            }

            for n in &notifications {
                if let Some(&target) = self.module_tokens.get(&n.module) {
                    if let Some(conn) = self.connections.get_mut(&target) {
                        conn.outbuf.extend_from_slice(&protocol::encode_notify(n));
                    }
                }
            }
        }
    }

    fn flush(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else { return };
        while !conn.outbuf.is_empty() {
            match conn.stream.write(&conn.outbuf) {
                Ok(0) => break,
                Ok(n) => {
                    conn.outbuf.drain(0..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("write error on token {:?}: {e}", token);
                    self.close_connection(token);
                    return;
                }
            }
        }
    }

    fn close_connection(&mut self, token: Token) {
        if let Some(mut conn) = self.connections.remove(&token) {
            let _ = conn.stream.deregister(&self.poll);
            if let Some(module) = conn.module {
                if conn.is_event_channel {
                    // Only the notification route dies; the module's sync
                    // registration and events stay live until its sync
                    // channel closes.
                    self.module_tokens.remove(&module);
                } else {
                    self.dispatcher.on_disconnect(module);
                    self.module_tokens.remove(&module);
                }
            }
        }
    }
}
