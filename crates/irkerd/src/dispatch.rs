//! Routes messages for one `(server, port)` target onto a pool of sessions. IRC daemons cap how
//! many channels one socket may join, so a busy server needs a flock of Connection instances;
//! the Dispatcher decides which one gets each message.

use crate::config::Config;
use crate::conn::Connection;
use crate::target::Target;
use crate::watcher::Watcher;

use libirker_common::ChanNameRef;

use std::rc::Rc;
use std::time::Instant;

const SCAVENGE_REASON: &str = "scavenged by irkerd";

pub(crate) struct Dispatcher {
    /// The target that created this dispatcher. Later messages reuse its server credentials.
    target: Target,
    config: Rc<Config>,
    watcher: Option<Watcher>,
    connections: Vec<Connection>,
}

impl Dispatcher {
    pub(crate) fn new(target: Target, config: Rc<Config>, watcher: Option<Watcher>) -> Dispatcher {
        Dispatcher {
            target,
            config,
            watcher,
            connections: Vec::new(),
        }
    }

    /// Place one message. In order of preference: a session already joined to the channel (keeps
    /// per-channel ordering and saves a JOIN), any session with room for another channel, a
    /// session that can scavenge a long-idle channel, and finally a fresh session.
    pub(crate) fn dispatch(
        &mut self,
        channel: &ChanNameRef,
        message: &str,
        key: Option<&str>,
        quit_after: bool,
    ) {
        self.dispatch_at(Instant::now(), channel, message, key, quit_after)
    }

    pub(crate) fn dispatch_at(
        &mut self,
        now: Instant,
        channel: &ChanNameRef,
        message: &str,
        key: Option<&str>,
        quit_after: bool,
    ) {
        let live: Vec<&Connection> = self.connections.iter().filter(|c| c.live()).collect();

        let eligible = live
            .iter()
            .find(|c| c.joined_to(channel))
            .or_else(|| live.iter().find(|c| c.accepting(channel)));
        if let Some(conn) = eligible {
            conn.enqueue(
                channel,
                Some(message.to_owned()),
                key.map(str::to_owned),
                quit_after,
            );
            return;
        }

        // All sessions are full up. Look for a channel idle long enough to be scavenged, oldest
        // first across the whole pool.
        let mut ancient: Option<(Connection, libirker_common::ChanName, Instant)> = None;
        for conn in &live {
            if let Some((chan, age)) = conn.oldest_idle_channel(now) {
                let older = match &ancient {
                    None => true,
                    Some((_, _, oldest_age)) => age < *oldest_age,
                };
                if older {
                    ancient = Some(((**conn).clone(), chan, age));
                }
            }
        }
        if let Some((conn, drop_channel, _)) = ancient {
            conn.part_channel(&drop_channel, SCAVENGE_REASON);
            conn.enqueue(
                channel,
                Some(message.to_owned()),
                key.map(str::to_owned),
                quit_after,
            );
            return;
        }

        // Every joined channel everywhere has recent activity; open another socket.
        let conn = Connection::new(self.target.clone(), self.config.clone(), self.watcher.clone());
        conn.enqueue(
            channel,
            Some(message.to_owned()),
            key.map(str::to_owned),
            quit_after,
        );
        self.connections.push(conn);
    }

    /// Does this server-port combination have any live sessions? Prunes dead ones as a side
    /// effect.
    pub(crate) fn live(&mut self) -> bool {
        self.connections.retain(|c| c.live());
        !self.connections.is_empty()
    }

    pub(crate) fn quiesced(&self) -> bool {
        self.connections.iter().all(|c| c.quiesced())
    }

    /// The time of the most recent transmission by any session in the pool.
    pub(crate) fn last_xmit(&self) -> Option<Instant> {
        self.connections.iter().map(|c| c.last_xmit()).max()
    }
}

#[cfg(test)]
impl Dispatcher {
    pub(crate) fn push_connection(&mut self, conn: Connection) {
        self.connections.push(conn);
    }

    pub(crate) fn connections(&self) -> &[Connection] {
        &self.connections
    }
}
