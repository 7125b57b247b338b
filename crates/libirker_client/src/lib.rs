//! One TCP (or TLS) socket to one IRC daemon.
//!
//! `ServerConnection::open` resolves the host, connects, and spawns two tasks: a writer task that
//! owns the send side and ships complete IRC lines in order, and a reader task that owns the
//! receive side and turns the byte stream into parsed [`Event`]s. Everything above this layer
//! (registration, joins, delivery, timeouts) belongs to the caller.

mod stream;

pub use stream::{StreamError, TlsError, TlsOptions};
pub use libirker_wire as wire;

use libirker_common::ChanNameRef;
use stream::Stream;

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf};
use tokio::sync::mpsc;

#[macro_use]
extern crate log;

/// How many outgoing lines may be in flight to one socket before we start shedding. The layer
/// above paces PRIVMSGs with an anti-flood delay, so this bound is only ever reached when the
/// peer has stalled, and stalled peers are exactly the ones we refuse to block on.
const SEND_QUEUE_LINES: usize = 100;

/// Events coming off one server socket. After `Disconnected` no further events arrive.
#[derive(Debug)]
pub enum Event {
    /// A complete line from the server. `raw` keeps the exact text for traffic capture.
    Line { raw: String, msg: wire::Msg },
    /// A line that couldn't be decoded or parsed.
    WireError(String),
    /// Read error or EOF; the socket is gone.
    Disconnected,
}

#[derive(Debug)]
pub enum ServerConnectionError {
    /// The host resolved to no usable address.
    CantResolveAddr { host: String },
    Io(io::Error),
    Tls(TlsError),
    BadPem(String),
}

impl From<io::Error> for ServerConnectionError {
    fn from(err: io::Error) -> Self {
        ServerConnectionError::Io(err)
    }
}

impl From<StreamError> for ServerConnectionError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Io(err) => ServerConnectionError::Io(err),
            StreamError::Tls(err) => ServerConnectionError::Tls(err),
            StreamError::BadPem(msg) => ServerConnectionError::BadPem(msg),
        }
    }
}

impl std::fmt::Display for ServerConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ServerConnectionError::CantResolveAddr { host } => {
                write!(f, "can't resolve address: {:?}", host)
            }
            ServerConnectionError::Io(err) => write!(f, "couldn't connect to socket: {}", err),
            ServerConnectionError::Tls(err) => write!(f, "TLS error: {}", err),
            ServerConnectionError::BadPem(msg) => write!(f, "{}", msg),
        }
    }
}

/// A PRIVMSG that can't be framed in a single 512-byte IRC line.
#[derive(Debug)]
pub struct OverlongLine {
    pub line_bytes: usize,
}

impl std::fmt::Display for OverlongLine {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "message would need a {}-byte line", self.line_bytes)
    }
}

/// The send side of one socket. Cloning shares the underlying socket.
#[derive(Debug, Clone)]
pub struct ServerConnection {
    snd_line: mpsc::Sender<String>,
}

impl ServerConnection {
    /// Resolves `host`, connects to the first address that accepts (wrapping in TLS when `tls` is
    /// given), and spawns the reader and writer tasks. Must be called from within a
    /// `tokio::task::LocalSet`.
    pub async fn open(
        host: &str,
        port: u16,
        tls: Option<&TlsOptions>,
    ) -> Result<(ServerConnection, mpsc::Receiver<Event>), ServerConnectionError> {
        let addrs: Vec<_> = tokio::net::lookup_host((host, port)).await?.collect();
        if addrs.is_empty() {
            return Err(ServerConnectionError::CantResolveAddr {
                host: host.to_owned(),
            });
        }

        let mut last_err: Option<StreamError> = None;
        let mut stream: Option<Stream> = None;
        for addr in addrs {
            debug!("connecting to {}", addr);
            let attempt = match tls {
                Some(opts) => Stream::new_tls(addr, host, opts).await,
                None => Stream::new_tcp(addr).await,
            };
            match attempt {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(err) => {
                    debug!("connecting to {} failed: {}", addr, err);
                    last_err = Some(err);
                }
            }
        }
        let stream = match stream {
            Some(stream) => stream,
            None => {
                // `addrs` was nonempty, so there is always a last error here.
                return Err(match last_err {
                    Some(err) => err.into(),
                    None => ServerConnectionError::CantResolveAddr {
                        host: host.to_owned(),
                    },
                });
            }
        };

        let (read_half, mut write_half) = tokio::io::split(stream);
        let (snd_line, mut rcv_line) = mpsc::channel::<String>(SEND_QUEUE_LINES);
        let (snd_ev, rcv_ev) = mpsc::channel::<Event>(SEND_QUEUE_LINES);

        tokio::task::spawn_local(async move {
            while let Some(line) = rcv_line.recv().await {
                if let Err(io_err) = write_half.write_all(line.as_bytes()).await {
                    debug!("write failed: {}", io_err);
                    return;
                }
            }
        });
        tokio::task::spawn_local(reader_task(read_half, snd_ev));

        Ok((ServerConnection { snd_line }, rcv_ev))
    }

    /// Ship a complete IRC line (including "\r\n"). Never blocks: when the writer can't keep up,
    /// the line is dropped.
    pub fn ship(&self, line: String) {
        if self.snd_line.try_send(line).is_err() {
            warn!("send queue full or closed, dropping a line");
        }
    }

    pub fn pass(&self, pass: &str) {
        self.ship(wire::pass(pass));
    }

    pub fn nick(&self, nick: &str) {
        self.ship(wire::nick(nick));
    }

    pub fn user(&self, username: &str, realname: &str) {
        self.ship(wire::user(username, realname));
    }

    pub fn join(&self, chan: &ChanNameRef, key: Option<&str>) {
        self.ship(wire::join(chan, key));
    }

    pub fn part(&self, chan: &ChanNameRef, reason: Option<&str>) {
        self.ship(wire::part(chan, reason));
    }

    /// Ship a PRIVMSG. IRC lines are capped at 512 bytes (RFC 1459); the relay truncates by
    /// character count before calling this, which can still overshoot on multi-byte text, so the
    /// check is here where the byte length is known.
    pub fn privmsg(&self, target: &str, msg: &str) -> Result<(), OverlongLine> {
        let line = wire::privmsg(target, msg);
        if line.len() > 512 {
            return Err(OverlongLine {
                line_bytes: line.len(),
            });
        }
        self.ship(line);
        Ok(())
    }

    pub fn mode(&self, target: &str, modes: &str) {
        self.ship(wire::mode(target, modes));
    }

    pub fn pong(&self, target: &str) {
        self.ship(wire::pong(target));
    }

    pub fn quit(&self, reason: Option<&str>) {
        self.ship(wire::quit(reason));
    }
}

async fn reader_task(mut read_half: ReadHalf<Stream>, snd_ev: mpsc::Sender<Event>) {
    let mut parse_buf: Vec<u8> = Vec::with_capacity(1024);
    let mut read_buf: [u8; 16384] = [0; 16384];

    'read: loop {
        match read_half.read(&mut read_buf).await {
            Err(io_err) => {
                debug!("error when reading from socket: {}", io_err);
                break;
            }
            Ok(0) => {
                debug!("read 0 bytes");
                break;
            }
            Ok(bytes) => {
                parse_buf.extend_from_slice(&read_buf[..bytes]);
                while let Some(line) = wire::take_line(&mut parse_buf) {
                    let ev = match line {
                        Err(err) => Event::WireError(err),
                        Ok(raw) => {
                            if raw.is_empty() {
                                continue;
                            }
                            match wire::parse_line(&raw) {
                                Ok(msg) => Event::Line { raw, msg },
                                Err(err) => Event::WireError(err),
                            }
                        }
                    };
                    if snd_ev.send(ev).await.is_err() {
                        // Receiver is gone; nobody cares about this socket any more.
                        break 'read;
                    }
                }
            }
        }
    }
    let _ = snd_ev.send(Event::Disconnected).await;
}
