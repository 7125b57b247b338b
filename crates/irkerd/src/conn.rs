//! One logical IRC client session: nick negotiation, joined-channel accounting, the
//! unseen/handshaking/ready/disconnected/expired state machine, the FIFO message queue, and the
//! consumer task that drains it.
//!
//! Sessions are timed out rather than cancelled: a session expires when the server stops pinging
//! it, when there has been no transmission for a long time, or when a nonempty queue can't be
//! connected anywhere. The consumer task observes every deadline itself, so there is no external
//! reaper.

use crate::config::{self, Config};
use crate::target::Target;
use crate::watcher::Watcher;

use libirker_client::{Event, ServerConnection, TlsOptions};
use libirker_common::{ChanName, ChanNameRef};
use libirker_wire::{Cmd, Msg, Pfx};

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

/// Time to live, from the last transmit.
pub(crate) const XMIT_TTL: Duration = Duration::from_secs(3 * 60 * 60);
/// Time to live, from the last server PING.
pub(crate) const PING_TTL: Duration = Duration::from_secs(15 * 60);
/// Time allowed between the nick transmit and the welcome.
pub(crate) const HANDSHAKE_TTL: Duration = Duration::from_secs(60);
/// A joined channel idle longer than this may be scavenged.
pub(crate) const CHANNEL_TTL: Duration = Duration::from_secs(3 * 60 * 60);
/// How long a disconnected session may sit on queued traffic before it expires.
pub(crate) const DISCONNECT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// How long a session that never managed a successful open may live. Bounds the damage of a
/// flood of requests naming bogus servers.
pub(crate) const UNSEEN_TTL: Duration = Duration::from_secs(60);
/// Max channels joined per socket when the server doesn't advertise a limit.
pub(crate) const CHANNEL_MAX: usize = 18;
/// Pause after each PRIVMSG so the server doesn't mistake us for a flooder.
pub(crate) const ANTI_FLOOD_DELAY: Duration = Duration::from_millis(1000);
/// Pause after a queue-empty check. Shorter than a human reflex arc, so nobody notices the
/// latency; long enough that an idle consumer doesn't hog the CPU.
pub(crate) const ANTI_BUZZ_DELAY: Duration = Duration::from_millis(90);

const DEFAULT_USERNAME: &str = "irker";
const REALNAME: &str = "irker relaying client";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    /// Created, never had a successful open. The queue may be nonempty.
    Unseen,
    /// NICK and USER sent, welcome not seen yet.
    Handshaking,
    /// Welcome received with a non-conflicting nick; transmission allowed.
    Ready,
    /// The server hung up. May reconnect when the queue has new items.
    Disconnected,
    /// Terminal.
    Expired,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct QueueItem {
    pub(crate) channel: ChanName,
    /// `None` asks the consumer to QUIT the server when delivery reaches this item.
    pub(crate) message: Option<String>,
    pub(crate) key: Option<String>,
}

/// What the consumer decided to do with one tick. Decisions are made under the state borrow;
/// the actual I/O and sleeps happen with the borrow released.
enum Step {
    Expire,
    Idle,
    TimeoutQuit {
        xmit_timeout: bool,
        ping_timeout: bool,
    },
    Connect,
    Deliver(QueueItem),
}

#[derive(Clone)]
pub(crate) struct Connection {
    inner: Rc<RefCell<ConnInner>>,
}

struct ConnInner {
    target: Target,
    config: Rc<Config>,
    watcher: Option<Watcher>,

    status: Status,
    nick_trial: u32,
    conn: Option<ServerConnection>,
    /// Bumped on every (re)open and on timeout-quit so that events from a stale socket's reader
    /// can't touch the state of its replacement.
    conn_epoch: u64,
    /// The server's name for itself, from the first prefixed line. Used as the source field of
    /// traffic-capture lines.
    real_server_name: String,

    last_xmit: Instant,
    last_ping: Instant,
    /// Joined channels and when we last transmitted to each.
    channels_joined: HashMap<ChanName, Instant>,
    /// Per-channel-type join limits from ISUPPORT (MAXCHANNELS / CHANLIMIT).
    channel_limits: HashMap<char, usize>,

    queue: VecDeque<QueueItem>,
    consumer_running: bool,
}

impl Connection {
    pub(crate) fn new(target: Target, config: Rc<Config>, watcher: Option<Watcher>) -> Connection {
        let now = Instant::now();
        Connection {
            inner: Rc::new(RefCell::new(ConnInner {
                target,
                config,
                watcher,
                status: Status::Unseen,
                nick_trial: 1,
                conn: None,
                conn_epoch: 0,
                real_server_name: String::new(),
                last_xmit: now,
                last_ping: now,
                channels_joined: HashMap::new(),
                channel_limits: HashMap::new(),
                queue: VecDeque::new(),
                consumer_running: false,
            })),
        }
    }

    /// Enqueue a message for transmission, starting the consumer task on first use. Must be
    /// called from within a `tokio::task::LocalSet`.
    pub(crate) fn enqueue(
        &self,
        channel: &ChanNameRef,
        message: Option<String>,
        key: Option<String>,
        quit_after: bool,
    ) {
        let start_consumer = {
            let mut inner = self.inner.borrow_mut();
            inner.queue.push_back(QueueItem {
                channel: channel.to_owned(),
                message,
                key: key.clone(),
            });
            if quit_after {
                inner.queue.push_back(QueueItem {
                    channel: channel.to_owned(),
                    message: None,
                    key,
                });
            }
            if inner.consumer_running {
                false
            } else {
                inner.consumer_running = true;
                inner.status = Status::Unseen;
                inner.last_xmit = Instant::now();
                true
            }
        };
        if start_consumer {
            tokio::task::spawn_local(consume(self.clone()));
        }
    }

    /// Should this session not be scavenged?
    pub(crate) fn live(&self) -> bool {
        self.inner.borrow().status != Status::Expired
    }

    pub(crate) fn joined_to(&self, channel: &ChanNameRef) -> bool {
        self.inner.borrow().channels_joined.contains_key(channel)
    }

    /// Can this session accept a join of this channel? Limits are partitioned by channel-type
    /// prefix; a server that advertised none gets the conservative default.
    pub(crate) fn accepting(&self, channel: &ChanNameRef) -> bool {
        self.inner.borrow().accepting(channel)
    }

    /// Queue drained and the socket gone (or going). Used by immediate mode to decide when the
    /// process may exit.
    pub(crate) fn quiesced(&self) -> bool {
        let inner = self.inner.borrow();
        inner.status == Status::Expired
            || (inner.queue.is_empty()
                && (inner.conn.is_none() || inner.status == Status::Disconnected))
    }

    pub(crate) fn last_xmit(&self) -> Instant {
        self.inner.borrow().last_xmit
    }

    /// The joined channel that has been idle past `CHANNEL_TTL` the longest, if any.
    pub(crate) fn oldest_idle_channel(&self, now: Instant) -> Option<(ChanName, Instant)> {
        let inner = self.inner.borrow();
        inner
            .channels_joined
            .iter()
            .filter(|(_, last)| now > **last + CHANNEL_TTL)
            .min_by_key(|(_, last)| **last)
            .map(|(chan, last)| (chan.clone(), *last))
    }

    /// PART a channel to make room for another one.
    pub(crate) fn part_channel(&self, channel: &ChanNameRef, reason: &str) {
        let mut inner = self.inner.borrow_mut();
        if let Some(conn) = &inner.conn {
            conn.part(channel, Some(reason));
        }
        inner.channels_joined.remove(channel);
    }

    fn handle_msg(&self, epoch: u64, raw: &str, msg: Msg) {
        let mut inner = self.inner.borrow_mut();
        if inner.conn_epoch != epoch {
            debug!("dropping event from a stale socket of {}", inner.target);
            return;
        }

        if inner.real_server_name.is_empty() {
            if let Some(pfx) = &msg.pfx {
                inner.real_server_name = match pfx {
                    Pfx::Server(name) | Pfx::Ambiguous(name) => name.clone(),
                    Pfx::User { nick, .. } => nick.clone(),
                };
            }
        }
        if let Some(watcher) = &inner.watcher {
            watcher.log_line(&inner.real_server_name, raw);
        }

        match msg.cmd {
            Cmd::PING { server } => {
                // Reflex: the PONG goes out before anything else a handler might write.
                inner.last_ping = Instant::now();
                if let Some(conn) = &inner.conn {
                    conn.pong(&server);
                }
            }
            Cmd::KICK { chan, .. } => inner.handle_kick(&chan),
            Cmd::Reply { num, params } => match num {
                1 => inner.handle_welcome(),
                5 => inner.handle_features(&params),
                // erroneous nickname / in use / collision / unavailable
                432 | 433 | 436 | 437 => inner.handle_bad_nick(),
                _ => {}
            },
            Cmd::ERROR { msg } => {
                info!("server error from {}: {}", inner.target, msg);
            }
            _ => {}
        }
    }

    fn handle_disconnect(&self, epoch: u64) {
        let mut inner = self.inner.borrow_mut();
        if inner.conn_epoch != epoch {
            return;
        }
        info!("server {} disconnected", inner.target);
        inner.conn = None;
        if inner.status != Status::Expired {
            inner.status = Status::Disconnected;
        }
    }

    fn next_step(&self, now: Instant) -> Step {
        let mut inner = self.inner.borrow_mut();
        if inner.status == Status::Expired {
            error!(
                "irkerd: consumer for {} still running after expiry, this is a bug",
                inner.target
            );
            return Step::Expire;
        }

        if inner.queue.is_empty() {
            // We want to be kind to the IRC servers and not hold unused sockets open forever.
            let xmit_timeout = now > inner.last_xmit + XMIT_TTL;
            let ping_timeout = now > inner.last_ping + PING_TTL;
            if inner.status == Status::Disconnected {
                inner.status = Status::Expired;
                Step::Expire
            } else if xmit_timeout || ping_timeout {
                Step::TimeoutQuit {
                    xmit_timeout,
                    ping_timeout,
                }
            } else {
                Step::Idle
            }
        } else if inner.status == Status::Disconnected
            && now > inner.last_xmit + DISCONNECT_TTL
        {
            // Queue is nonempty but the server has been unreachable for a day. Letting failed
            // sessions retain queue space forever would be a memory leak.
            inner.status = Status::Expired;
            Step::Expire
        } else if inner.status == Status::Unseen && now > inner.last_xmit + UNSEEN_TTL {
            inner.status = Status::Expired;
            Step::Expire
        } else if inner.conn.is_none() {
            Step::Connect
        } else if inner.status == Status::Handshaking {
            if now > inner.last_xmit + HANDSHAKE_TTL {
                inner.status = Status::Expired;
                Step::Expire
            } else {
                Step::Idle
            }
        } else if inner.status == Status::Ready {
            match inner.queue.pop_front() {
                Some(item) => Step::Deliver(item),
                None => Step::Idle,
            }
        } else {
            Step::Idle
        }
    }

    fn timeout_quit(&self, xmit_timeout: bool, ping_timeout: bool) {
        let mut inner = self.inner.borrow_mut();
        info!(
            "timing out connection to {} (ping_timeout={}, xmit_timeout={})",
            inner.target, ping_timeout, xmit_timeout
        );
        if let Some(conn) = inner.conn.take() {
            conn.quit(Some("transmission timeout"));
        }
        inner.conn_epoch += 1;
        inner.status = Status::Disconnected;
    }

    fn expire(&self, reason: &str) {
        let mut inner = self.inner.borrow_mut();
        error!("irkerd: {}: {}", inner.target, reason);
        inner.status = Status::Expired;
    }
}

impl ConnInner {
    fn nickname(&self) -> String {
        config::format_nick(&self.config.nick_template, self.nick_trial)
    }

    fn accepting(&self, channel: &ChanNameRef) -> bool {
        if self.channel_limits.is_empty() {
            return self.channels_joined.len() < CHANNEL_MAX;
        }
        // The RFCs allow separate limits by channel type (the first character of the name), a
        // feature that is almost never actually used.
        let prefix = channel.prefix();
        let match_count = self
            .channels_joined
            .keys()
            .filter(|joined| joined.prefix() == prefix)
            .count();
        match_count < self.channel_limits.get(&prefix).copied().unwrap_or(CHANNEL_MAX)
    }

    /// The server says we're OK, with a non-conflicting nick.
    fn handle_welcome(&mut self) {
        self.status = Status::Ready;
        info!("nick {} accepted", self.nickname());
        if let Some(password) = &self.config.nickserv_pass {
            if let Some(conn) = &self.conn {
                if let Err(err) = conn.privmsg("nickserv", &format!("identify {}", password)) {
                    warn!("couldn't identify to nickserv on {}: {}", self.target, err);
                }
            }
        }
    }

    /// The server says our nick is ill-formed or has a conflict.
    fn handle_bad_nick(&mut self) {
        info!("nick {} rejected", self.nickname());
        if self.config.nick_needs_number {
            // Randomness prevents a malicious user or bot from anticipating the next trial name
            // in order to block us from completing the handshake.
            self.nick_trial += rand::thread_rng().gen_range(1..=3);
            self.last_xmit = Instant::now();
            let nickname = self.nickname();
            if let Some(conn) = &self.conn {
                conn.nick(&nickname);
            }
        }
        // Otherwise fall through; it might be possible to recover manually.
    }

    /// ISUPPORT feature line: learn join limits, and go deaf unless we're watching traffic.
    fn handle_features(&mut self, params: &[String]) {
        for lump in params {
            if let Some(deaf_char) = lump.strip_prefix("DEAF=") {
                if self.watcher.is_none() {
                    let nickname = self.nickname();
                    if let Some(conn) = &self.conn {
                        conn.mode(&nickname, &format!("+{}", deaf_char));
                    }
                }
            } else if let Some(rest) = lump.strip_prefix("MAXCHANNELS=") {
                if let Ok(max) = rest.parse::<usize>() {
                    for prefix in ['#', '&', '+'] {
                        self.channel_limits.insert(prefix, max);
                    }
                    info!("{} maxchannels is {}", self.target, max);
                }
            } else if let Some(rest) = lump.strip_prefix("CHANLIMIT=") {
                match parse_chanlimit(rest) {
                    Ok(limits) => {
                        self.channel_limits.extend(limits);
                        info!("{} channel limit map is {:?}", self.target, self.channel_limits);
                    }
                    Err(()) => error!("irkerd: ill-formed CHANLIMIT property"),
                }
            }
        }
    }

    /// We've been kicked. Flip through handshaking while the books are inconsistent, drop the
    /// channel, and throw away traffic queued for it.
    fn handle_kick(&mut self, outof: &ChanNameRef) {
        self.status = Status::Handshaking;
        if self.channels_joined.remove(outof).is_none() {
            error!(
                "irkerd: kicked by {} from {} that's not joined",
                self.target,
                outof.display()
            );
        }
        self.queue.retain(|item| item.channel != *outof);
        self.status = Status::Ready;
    }
}

/// `CHANLIMIT=<prefixes>:<n>[,<prefixes>:<n>...]`
fn parse_chanlimit(value: &str) -> Result<Vec<(char, usize)>, ()> {
    let mut limits = Vec::new();
    for token in value.split(',') {
        let (prefixes, limit) = token.split_once(':').ok_or(())?;
        let limit = limit.parse::<usize>().map_err(|_| ())?;
        for prefix in prefixes.chars() {
            limits.push((prefix, limit));
        }
    }
    Ok(limits)
}

/// Truncate to at most `max` characters. We're counting characters, not bytes, so multi-byte
/// text can still overshoot the wire limit; the client rejects those lines and we log it.
fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        None => s,
        Some((idx, _)) => &s[..idx],
    }
}

/// The consumer task. Tries to ship pending messages from the queue, opening (and re-opening)
/// the server connection on demand, and expires the session when any of its deadlines pass.
async fn consume(conn: Connection) {
    loop {
        match conn.next_step(Instant::now()) {
            Step::Expire => break,
            Step::Idle => sleep(ANTI_BUZZ_DELAY).await,
            Step::TimeoutQuit {
                xmit_timeout,
                ping_timeout,
            } => conn.timeout_quit(xmit_timeout, ping_timeout),
            Step::Connect => {
                if open_server_connection(&conn).await.is_err() {
                    break;
                }
            }
            Step::Deliver(item) => deliver(&conn, item).await,
        }
    }

    // Make sure we don't leave a zombie socket behind.
    let mut inner = conn.inner.borrow_mut();
    inner.conn = None;
    inner.conn_epoch += 1;
    inner.consumer_running = false;
}

/// Open a socket to the target server and start the handshake. On failure the session expires;
/// its queued messages are lost, which is the documented trade for never blocking.
async fn open_server_connection(conn: &Connection) -> Result<(), ()> {
    let (target, config) = {
        let mut inner = conn.inner.borrow_mut();
        // Try to avoid colliding with other relay instances.
        inner.nick_trial = rand::thread_rng().gen_range(1..=990);
        inner.channels_joined.clear();
        (inner.target.clone(), inner.config.clone())
    };
    let tls_opts = if target.ssl {
        Some(TlsOptions {
            ca_file: config.ca_file.clone(),
            cert_file: config.cert_file.clone(),
        })
    } else {
        None
    };

    debug!(
        "connect(server={:?}, port={:?}, ssl={:?})",
        target.servername, target.port, target.ssl
    );
    let opened = timeout(
        UNSEEN_TTL,
        ServerConnection::open(&target.servername, target.port, tls_opts.as_ref()),
    )
    .await;
    let (server_conn, rcv_ev) = match opened {
        Err(_elapsed) => {
            conn.expire("connection attempt timed out");
            return Err(());
        }
        Ok(Err(err)) => {
            conn.expire(&err.to_string());
            return Err(());
        }
        Ok(Ok(opened)) => opened,
    };

    let (nickname, epoch) = {
        let mut inner = conn.inner.borrow_mut();
        inner.conn = Some(server_conn.clone());
        inner.conn_epoch += 1;
        inner.status = Status::Handshaking;
        inner.real_server_name.clear();
        let now = Instant::now();
        inner.last_xmit = now;
        inner.last_ping = now;
        (inner.nickname(), inner.conn_epoch)
    };
    info!("XMIT_TTL bump ({} connection)", target);

    if let Some(password) = &target.password {
        server_conn.pass(password);
    }
    server_conn.nick(&nickname);
    server_conn.user(
        target.username.as_deref().unwrap_or(DEFAULT_USERNAME),
        REALNAME,
    );

    tokio::task::spawn_local(handle_events(conn.clone(), epoch, rcv_ev));
    Ok(())
}

/// Ship one queue item: JOIN on first traffic to the channel, then the PRIVMSG lines with the
/// anti-flood pause after each. A `None` message quits the server; an empty message is a
/// join-only keepalive and ships nothing.
async fn deliver(conn: &Connection, item: QueueItem) {
    let (server_conn, needs_join, target_name) = {
        let inner = conn.inner.borrow();
        match &inner.conn {
            // The socket went away between the tick decision and now; the item is lost.
            None => return,
            Some(server_conn) => (
                server_conn.clone(),
                !inner.channels_joined.contains_key(&item.channel),
                inner.target.to_string(),
            ),
        }
    };

    if needs_join {
        server_conn.join(&item.channel, item.key.as_deref());
        info!("joining {} on {}.", item.channel.display(), target_name);
    }

    match &item.message {
        None => {
            server_conn.quit(None);
        }
        Some(message) => {
            if !message.is_empty() {
                // 500 = 512 - CRLF - 'PRIVMSG ' - ' :'
                let maxlength = 500usize.saturating_sub(item.channel.display().len());
                for segment in message.split('\n') {
                    let segment = truncate_chars(segment, maxlength);
                    if let Err(err) = server_conn.privmsg(item.channel.display(), segment) {
                        warn!(
                            "rejected a message to {} on {} because: {}",
                            item.channel.display(),
                            target_name,
                            err
                        );
                    }
                    sleep(ANTI_FLOOD_DELAY).await;
                }
            }
        }
    }

    let mut inner = conn.inner.borrow_mut();
    let now = Instant::now();
    inner.last_xmit = now;
    inner.channels_joined.insert(item.channel, now);
    debug!("XMIT_TTL bump ({} transmission)", inner.target);
}

/// Routes events from one socket's reader into the session state. Stops at `Disconnected` or
/// when the session has moved on to a newer socket.
async fn handle_events(conn: Connection, epoch: u64, rcv_ev: mpsc::Receiver<Event>) {
    let mut rcv_ev = ReceiverStream::new(rcv_ev);
    while let Some(ev) = rcv_ev.next().await {
        match ev {
            Event::Line { raw, msg } => conn.handle_msg(epoch, &raw, msg),
            Event::WireError(err) => {
                warn!("{}: {}", conn.inner.borrow().target, err);
            }
            Event::Disconnected => {
                conn.handle_disconnect(epoch);
                break;
            }
        }
        if conn.inner.borrow().conn_epoch != epoch {
            break;
        }
    }
}

#[cfg(test)]
impl Connection {
    /// Fabricate a ready session with the given joined channels, bypassing the network. The
    /// consumer task is *not* started.
    pub(crate) fn fake_ready(target: Target, config: Rc<Config>, chans: &[&str]) -> Connection {
        let conn = Connection::new(target, config, None);
        {
            let mut inner = conn.inner.borrow_mut();
            inner.status = Status::Ready;
            inner.consumer_running = true;
            let now = Instant::now();
            for chan in chans {
                inner
                    .channels_joined
                    .insert(ChanNameRef::new(chan).to_owned(), now);
            }
        }
        conn
    }

    pub(crate) fn set_channel_limits(&self, limits: &[(char, usize)]) {
        let mut inner = self.inner.borrow_mut();
        inner.channel_limits.extend(limits.iter().copied());
    }

    pub(crate) fn set_channel_age(&self, chan: &str, last_xmit: Instant) {
        let mut inner = self.inner.borrow_mut();
        inner
            .channels_joined
            .insert(ChanNameRef::new(chan).to_owned(), last_xmit);
    }

    pub(crate) fn queued_channels(&self) -> Vec<String> {
        self.inner
            .borrow()
            .queue
            .iter()
            .map(|item| item.channel.display().to_owned())
            .collect()
    }
}
