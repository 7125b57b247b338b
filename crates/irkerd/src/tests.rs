//! Scenario tests that run the relay against a fake in-process IRC server.

use crate::config::{self, Config};
use crate::conn::Connection;
use crate::dispatch::Dispatcher;
use crate::relay::Relay;
use crate::target::Target;

use libirker_common::ChanNameRef;

use std::future::Future;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::timeout;

fn run_test<F, Fut>(test: F)
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, test());
}

fn test_config() -> Rc<Config> {
    Rc::new(Config {
        host: "127.0.0.1".to_owned(),
        port: config::PORT,
        nick_template: config::NICK_TEMPLATE.to_owned(),
        nick_needs_number: true,
        nickserv_pass: None,
        ca_file: None,
        cert_file: None,
        log_file: None,
    })
}

fn request(port: u16, chan: &str, text: &str) -> String {
    format!(
        r#"{{"to":"irc://127.0.0.1:{}/{}","privmsg":"{}"}}"#,
        port, chan, text
    )
}

struct FakeServer {
    listener: TcpListener,
}

impl FakeServer {
    async fn start() -> (FakeServer, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (FakeServer { listener }, port)
    }

    async fn session(&self) -> FakeSession {
        let (sock, _) = timeout(Duration::from_secs(10), self.listener.accept())
            .await
            .expect("no connection arrived")
            .unwrap();
        let (read_half, write_half) = sock.into_split();
        FakeSession {
            lines: BufReader::new(read_half).lines(),
            write_half,
        }
    }
}

struct FakeSession {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write_half: OwnedWriteHalf,
}

impl FakeSession {
    async fn expect_line(&mut self) -> String {
        timeout(Duration::from_secs(10), self.lines.next_line())
            .await
            .expect("no line arrived")
            .unwrap()
            .expect("connection closed")
    }

    async fn send_line(&mut self, line: &str) {
        self.write_half
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .unwrap();
    }

    /// Plays the server side of registration and returns the nick it accepted.
    async fn accept_registration(&mut self) -> String {
        let nick_line = self.expect_line().await;
        assert!(nick_line.starts_with("NICK irker"), "{:?}", nick_line);
        let nick = nick_line["NICK ".len()..].to_owned();
        assert_eq!(
            self.expect_line().await,
            "USER irker 0 * :irker relaying client"
        );
        self.send_line(&format!(":fake.example.net 001 {} :Welcome to the fake IRC network", nick))
            .await;
        nick
    }
}

// The basic end-to-end transcript, with the request arriving over UDP the way a
// hook submits it.
#[test]
fn simple_relay_delivers_privmsg() {
    run_test(|| async {
        let (server, irc_port) = FakeServer::start().await;
        let relay = Relay::new(test_config());

        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let udp_port = udp.local_addr().unwrap().port();
        tokio::task::spawn_local(crate::listen::udp_task(udp, relay.clone()));

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(
                request(irc_port, "devel", "hello").as_bytes(),
                ("127.0.0.1", udp_port),
            )
            .await
            .unwrap();

        // No JOIN or PRIVMSG may appear before registration completes.
        let mut session = server.session().await;
        session.accept_registration().await;
        assert_eq!(session.expect_line().await, "JOIN #devel");
        assert_eq!(session.expect_line().await, "PRIVMSG #devel :hello");
    });
}

#[test]
fn fan_out_uses_one_dispatcher_per_server() {
    run_test(|| async {
        let (server1, port1) = FakeServer::start().await;
        let (server2, port2) = FakeServer::start().await;
        let relay = Relay::new(test_config());

        relay.handle(
            &format!(
                r#"{{"to":["irc://127.0.0.1:{p1}/a","irc://127.0.0.1:{p1}/b","irc://127.0.0.1:{p2}/a"],"privmsg":"hi"}}"#,
                p1 = port1,
                p2 = port2
            ),
            false,
        );

        let mut s1 = server1.session().await;
        s1.accept_registration().await;
        assert_eq!(s1.expect_line().await, "JOIN #a");
        assert_eq!(s1.expect_line().await, "PRIVMSG #a :hi");
        assert_eq!(s1.expect_line().await, "JOIN #b");
        assert_eq!(s1.expect_line().await, "PRIVMSG #b :hi");

        let mut s2 = server2.session().await;
        s2.accept_registration().await;
        assert_eq!(s2.expect_line().await, "JOIN #a");
        assert_eq!(s2.expect_line().await, "PRIVMSG #a :hi");
    });
}

// With MAXCHANNELS=2 advertised, a third channel forces a second
// socket to the same server.
#[test]
fn channel_limit_overflow_opens_second_connection() {
    run_test(|| async {
        let (server, irc_port) = FakeServer::start().await;
        let relay = Relay::new(test_config());

        relay.handle(&request(irc_port, "a", "hi"), false);
        let mut s1 = server.session().await;
        let nick = s1.accept_registration().await;
        s1.send_line(&format!(
            ":fake.example.net 005 {} MAXCHANNELS=2 :are supported by this server",
            nick
        ))
        .await;
        assert_eq!(s1.expect_line().await, "JOIN #a");
        assert_eq!(s1.expect_line().await, "PRIVMSG #a :hi");

        relay.handle(&request(irc_port, "b", "hi"), false);
        assert_eq!(s1.expect_line().await, "JOIN #b");
        assert_eq!(s1.expect_line().await, "PRIVMSG #b :hi");

        // Let the delivery bookkeeping for #b finish before placing #c.
        tokio::time::sleep(crate::conn::ANTI_FLOOD_DELAY + Duration::from_millis(200)).await;

        relay.handle(&request(irc_port, "c", "hi"), false);
        let mut s2 = server.session().await;
        s2.accept_registration().await;
        assert_eq!(s2.expect_line().await, "JOIN #c");
        assert_eq!(s2.expect_line().await, "PRIVMSG #c :hi");
    });
}

// A 433 makes the session try a new, unpredictable nick, and
// registration still completes.
#[test]
fn nick_collision_retries_with_new_nick() {
    run_test(|| async {
        let (server, irc_port) = FakeServer::start().await;
        let relay = Relay::new(test_config());
        relay.handle(&request(irc_port, "devel", "hello"), false);

        let mut session = server.session().await;
        let first_nick_line = session.expect_line().await;
        assert!(first_nick_line.starts_with("NICK irker"));
        let first_nick = first_nick_line["NICK ".len()..].to_owned();
        let _user_line = session.expect_line().await;

        session
            .send_line(&format!(
                ":fake.example.net 433 * {} :Nickname is already in use.",
                first_nick
            ))
            .await;

        let second_nick_line = session.expect_line().await;
        assert!(second_nick_line.starts_with("NICK irker"));
        let second_nick = second_nick_line["NICK ".len()..].to_owned();
        assert_ne!(first_nick, second_nick);

        session
            .send_line(&format!(":fake.example.net 001 {} :Welcome", second_nick))
            .await;
        assert_eq!(session.expect_line().await, "JOIN #devel");
        assert_eq!(session.expect_line().await, "PRIVMSG #devel :hello");
    });
}

// Two messages for the same channel reach the wire in enqueue order, and a PING answered in
// between gets its PONG ahead of the queued traffic.
#[test]
fn per_channel_ordering_and_ping_reflex() {
    run_test(|| async {
        let (server, irc_port) = FakeServer::start().await;
        let relay = Relay::new(test_config());
        relay.handle(&request(irc_port, "devel", "one"), false);
        relay.handle(&request(irc_port, "devel", "two"), false);

        let mut session = server.session().await;
        session.accept_registration().await;
        assert_eq!(session.expect_line().await, "JOIN #devel");
        assert_eq!(session.expect_line().await, "PRIVMSG #devel :one");

        // The consumer is in its anti-flood pause; the reflex must not wait for it.
        session.send_line("PING :tok123").await;
        assert_eq!(session.expect_line().await, "PONG tok123");

        assert_eq!(session.expect_line().await, "PRIVMSG #devel :two");
    });
}

#[test]
fn multiline_message_splits_into_privmsgs() {
    run_test(|| async {
        let (server, irc_port) = FakeServer::start().await;
        let relay = Relay::new(test_config());
        relay.handle(
            &format!(
                r#"{{"to":"irc://127.0.0.1:{}/devel","privmsg":"line one\nline two"}}"#,
                irc_port
            ),
            false,
        );

        let mut session = server.session().await;
        session.accept_registration().await;
        assert_eq!(session.expect_line().await, "JOIN #devel");
        assert_eq!(session.expect_line().await, "PRIVMSG #devel :line one");
        assert_eq!(session.expect_line().await, "PRIVMSG #devel :line two");
    });
}

// Bad requests cost a log line, nothing more.
#[test]
fn malformed_request_leaves_daemon_serving() {
    run_test(|| async {
        let (server, irc_port) = FakeServer::start().await;
        let relay = Relay::new(test_config());

        relay.handle(r#"{"privmsg":"hi"}"#, false);
        relay.handle("{definitely not json", false);
        relay.handle(r#"{"to":42,"privmsg":"hi"}"#, false);

        relay.handle(&request(irc_port, "devel", "still alive"), false);
        let mut session = server.session().await;
        session.accept_registration().await;
        assert_eq!(session.expect_line().await, "JOIN #devel");
        assert_eq!(session.expect_line().await, "PRIVMSG #devel :still alive");
    });
}

#[test]
fn join_key_is_sent_with_join() {
    run_test(|| async {
        let (server, irc_port) = FakeServer::start().await;
        let relay = Relay::new(test_config());
        relay.handle(
            &format!(
                r#"{{"to":"irc://127.0.0.1:{}/sekrit?key=hunter2","privmsg":"hi"}}"#,
                irc_port
            ),
            false,
        );

        let mut session = server.session().await;
        session.accept_registration().await;
        assert_eq!(session.expect_line().await, "JOIN #sekrit hunter2");
        assert_eq!(session.expect_line().await, "PRIVMSG #sekrit :hi");
    });
}

// The dispatcher population stays bounded no matter how many distinct servers are named.
#[test]
fn global_cap_bounds_live_dispatchers() {
    run_test(|| async {
        let relay = Relay::new(test_config());
        for n in 0..crate::relay::CONNECTION_MAX + 10 {
            relay.handle(
                &format!(r#"{{"to":"irc://server{}.example.net/chan","privmsg":"hi"}}"#, n),
                false,
            );
            assert!(relay.server_count() <= crate::relay::CONNECTION_MAX);
        }
    });
}

//
// Placement-policy tests against fabricated sessions (no sockets involved).
//

#[test]
fn placement_prefers_joined_then_accepting() {
    run_test(|| async {
        let target = Target::parse("irc://irc.example.net/devel").unwrap();
        let mut dispatcher = Dispatcher::new(target.clone(), test_config(), None);
        let a = Connection::fake_ready(target.clone(), test_config(), &["#a"]);
        let b = Connection::fake_ready(target, test_config(), &["#b"]);
        dispatcher.push_connection(a.clone());
        dispatcher.push_connection(b.clone());

        // A session already joined wins even when it isn't first in the list.
        dispatcher.dispatch(ChanNameRef::new("#b"), "hi", None, false);
        assert_eq!(b.queued_channels(), vec!["#b"]);
        assert!(a.queued_channels().is_empty());

        // An unjoined channel goes to the first session with room.
        dispatcher.dispatch(ChanNameRef::new("#c"), "hi", None, false);
        assert_eq!(a.queued_channels(), vec!["#c"]);
    });
}

#[test]
fn placement_scavenges_globally_oldest_idle_channel() {
    run_test(|| async {
        let target = Target::parse("irc://irc.example.net/devel").unwrap();
        let mut dispatcher = Dispatcher::new(target.clone(), test_config(), None);
        let a = Connection::fake_ready(target.clone(), test_config(), &["#old", "#busy1"]);
        let b = Connection::fake_ready(target, test_config(), &["#ancient", "#busy2"]);
        a.set_channel_limits(&[('#', 2)]);
        b.set_channel_limits(&[('#', 2)]);

        let base = Instant::now();
        a.set_channel_age("#old", base + Duration::from_secs(30 * 60));
        a.set_channel_age("#busy1", base + Duration::from_secs(3 * 60 * 60));
        b.set_channel_age("#ancient", base);
        b.set_channel_age("#busy2", base + Duration::from_secs(3 * 60 * 60));
        dispatcher.push_connection(a.clone());
        dispatcher.push_connection(b.clone());

        // Four hours on: both pools are full, #ancient has been idle the longest, so it gets
        // parted to make room.
        let later = base + Duration::from_secs(4 * 60 * 60);
        dispatcher.dispatch_at(later, ChanNameRef::new("#new"), "hi", None, false);

        assert!(!b.joined_to(ChanNameRef::new("#ancient")));
        assert_eq!(b.queued_channels(), vec!["#new"]);
        assert!(a.joined_to(ChanNameRef::new("#old")));
        assert!(a.queued_channels().is_empty());
    });
}

#[test]
fn placement_opens_new_connection_when_nothing_is_scavengeable() {
    run_test(|| async {
        let target = Target::parse("irc://irc.example.net/devel").unwrap();
        let mut dispatcher = Dispatcher::new(target.clone(), test_config(), None);
        let a = Connection::fake_ready(target, test_config(), &["#a", "#b"]);
        a.set_channel_limits(&[('#', 2)]);
        dispatcher.push_connection(a.clone());

        // Everything is full and recently active; the pool has to grow. The new session will
        // try to open a socket and expire; that's fine, we only check the placement here.
        dispatcher.dispatch(ChanNameRef::new("#c"), "hi", None, false);
        assert_eq!(dispatcher.connections().len(), 2);
        assert!(a.queued_channels().is_empty());
        assert_eq!(dispatcher.connections()[1].queued_channels(), vec!["#c"]);
    });
}
