//! IRC wire protocol message parsers and generators. This library implements the strict subset of
//! RFC 1459 that a message relay needs: enough generators to register, join, and deliver, and
//! enough parsing to drive the session state machine. Numeric replies are kept generic; the
//! handful we react to are matched at the point of use.

use std::str;

use libirker_common::{ChanName, ChanNameRef};

pub fn pass(pass: &str) -> String {
    format!("PASS {}\r\n", pass)
}

pub fn nick(arg: &str) -> String {
    format!("NICK {}\r\n", arg)
}

// irker-style registration: mode 0, unused middle parameter.
pub fn user(username: &str, realname: &str) -> String {
    format!("USER {} 0 * :{}\r\n", username, realname)
}

pub fn ping(arg: &str) -> String {
    format!("PING {}\r\n", arg)
}

pub fn pong(arg: &str) -> String {
    format!("PONG {}\r\n", arg)
}

pub fn join(chan: &ChanNameRef, key: Option<&str>) -> String {
    match key {
        None => format!("JOIN {}\r\n", chan.display()),
        Some(key) => format!("JOIN {} {}\r\n", chan.display(), key),
    }
}

pub fn part(chan: &ChanNameRef, reason: Option<&str>) -> String {
    match reason {
        None => format!("PART {}\r\n", chan.display()),
        Some(reason) => format!("PART {} :{}\r\n", chan.display(), reason),
    }
}

pub fn privmsg(msgtarget: &str, msg: &str) -> String {
    format!("PRIVMSG {} :{}\r\n", msgtarget, msg)
}

pub fn mode(target: &str, modes: &str) -> String {
    format!("MODE {} {}\r\n", target, modes)
}

pub fn quit(reason: Option<&str>) -> String {
    match reason {
        None => "QUIT\r\n".to_string(),
        Some(reason) => format!("QUIT :{}\r\n", reason),
    }
}

/// Sender of a message ("prefix" in the RFC). The RFC grammar is ambiguous: a prefix like
/// "localhost" could be a server or a nick, and there is no way to tell. We classify what we can
/// and return `Ambiguous` for the rest.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Pfx {
    /// Sender is a server.
    Server(String),

    /// Sender is a nick.
    User {
        /// Nick of the sender
        nick: String,
        /// `user@host` part
        user: String,
    },

    /// Could be a server or a nick.
    Ambiguous(String),
}

// RFC 2812 section 2.3.1
fn parse_pfx(pfx: &str) -> Pfx {
    if let Some(idx) = pfx.find(['!', '@']) {
        return Pfx::User {
            nick: pfx[..idx].to_owned(),
            user: pfx[idx + 1..].to_owned(),
        };
    }
    // Chars that nicks can have but servernames cannot
    if pfx.contains(['[', ']', '\\', '`', '_', '^', '{', '|', '}']) {
        Pfx::User {
            nick: pfx.to_owned(),
            user: "".to_owned(),
        }
    } else if pfx.contains('.') {
        // Nicks can't have '.'
        Pfx::Server(pfx.to_owned())
    } else {
        Pfx::Ambiguous(pfx.to_owned())
    }
}

/// An IRC message
#[derive(Debug, PartialEq, Eq)]
pub struct Msg {
    /// Sender of the message. Optional; when missing the message originated from the connection
    /// it was received on.
    pub pfx: Option<Pfx>,
    pub cmd: Cmd,
}

/// An IRC command or reply
#[derive(Debug, PartialEq, Eq)]
pub enum Cmd {
    /// A PRIVMSG or NOTICE. Check `is_notice`.
    PRIVMSG {
        target: String,
        msg: String,
        is_notice: bool,
    },

    JOIN {
        chan: ChanName,
    },

    PART {
        chan: ChanName,
        msg: Option<String>,
    },

    KICK {
        chan: ChanName,
        nick: String,
        msg: Option<String>,
    },

    QUIT {
        msg: Option<String>,
    },

    NICK {
        nick: String,
    },

    PING {
        server: String,
    },

    PONG {
        server: String,
    },

    ERROR {
        msg: String,
    },

    /// Numeric replies are kept generic; there are far too many to enumerate and the relay only
    /// reacts to a few (001, 005, 432, 433, 436, 437).
    Reply {
        num: u16,
        params: Vec<String>,
    },

    /// Any other IRC message.
    Other {
        cmd: String,
        params: Vec<String>,
    },
}

/// Removes the first complete line from the buffer. Lines are terminated by CRLF or, from sloppy
/// servers, bare LF. Returns `None` when the buffer holds no complete line yet. A line that is
/// not valid UTF-8 is dropped from the buffer and surfaced as an error.
pub fn take_line(buf: &mut Vec<u8>) -> Option<Result<String, String>> {
    let nl_idx = buf.iter().position(|b| *b == b'\n')?;

    let mut end = nl_idx;
    if end > 0 && buf[end - 1] == b'\r' {
        end -= 1;
    }

    let ret = match str::from_utf8(&buf[..end]) {
        Ok(line) => Ok(line.to_owned()),
        Err(err) => Err(format!("invalid encoding ({})", err)),
    };
    buf.drain(0..nl_idx + 1);
    Some(ret)
}

/// An intermediate type used during parsing.
enum MsgType<'a> {
    Cmd(&'a str),
    Num(u16),
}

/// Parses one complete line (without the line terminator).
pub fn parse_line(mut msg: &str) -> Result<Msg, String> {
    let pfx: Option<Pfx> = match msg.strip_prefix(':') {
        Some(rest) => {
            let ws_idx = rest
                .find(' ')
                .ok_or_else(|| format!("can't find prefix terminator in msg: {:?}", msg))?;
            msg = rest[ws_idx + 1..].trim_start_matches(' ');
            Some(parse_pfx(&rest[..ws_idx]))
        }
        None => None,
    };

    let msg_ty: MsgType = {
        let cmd = match msg.find(' ') {
            Some(ws_idx) => {
                let cmd = &msg[..ws_idx];
                msg = &msg[ws_idx + 1..];
                cmd
            }
            None => {
                // A command with no parameters at all, e.g. a bare "QUIT".
                let cmd = msg;
                msg = "";
                cmd
            }
        };
        if cmd.is_empty() {
            return Err("empty command".to_owned());
        }
        match cmd.parse::<u16>() {
            Ok(num) => MsgType::Num(num),
            Err(_) => MsgType::Cmd(cmd),
        }
    };

    let params = parse_params(msg);
    let cmd = match msg_ty {
        MsgType::Cmd("PRIVMSG") | MsgType::Cmd("NOTICE") if params.len() == 2 => Cmd::PRIVMSG {
            target: params[0].to_owned(),
            msg: params[1].to_owned(),
            is_notice: matches!(msg_ty, MsgType::Cmd("NOTICE")),
        },
        MsgType::Cmd("JOIN") if params.len() == 1 => Cmd::JOIN {
            chan: ChanName::new(params[0].to_owned()),
        },
        MsgType::Cmd("PART") if params.len() == 1 || params.len() == 2 => Cmd::PART {
            chan: ChanName::new(params[0].to_owned()),
            msg: params.get(1).map(|s| (*s).to_owned()),
        },
        MsgType::Cmd("KICK") if params.len() == 2 || params.len() == 3 => Cmd::KICK {
            chan: ChanName::new(params[0].to_owned()),
            nick: params[1].to_owned(),
            msg: params.get(2).map(|s| (*s).to_owned()),
        },
        MsgType::Cmd("QUIT") if params.len() <= 1 => Cmd::QUIT {
            msg: params.first().map(|s| (*s).to_owned()),
        },
        MsgType::Cmd("NICK") if params.len() == 1 => Cmd::NICK {
            nick: params[0].to_owned(),
        },
        MsgType::Cmd("PING") if !params.is_empty() => Cmd::PING {
            server: params[0].to_owned(),
        },
        MsgType::Cmd("PONG") if !params.is_empty() => Cmd::PONG {
            server: params[0].to_owned(),
        },
        MsgType::Cmd("ERROR") if params.len() == 1 => Cmd::ERROR {
            msg: params[0].to_owned(),
        },
        MsgType::Num(n) => Cmd::Reply {
            num: n,
            params: params.into_iter().map(str::to_owned).collect(),
        },
        MsgType::Cmd(cmd) => Cmd::Other {
            cmd: cmd.to_owned(),
            params: params.into_iter().map(str::to_owned).collect(),
        },
    };

    Ok(Msg { pfx, cmd })
}

// RFC 2812:
//
//     params     =  *14( SPACE middle ) [ SPACE ":" trailing ]
//                =/ 14( SPACE middle ) [ SPACE [ ":" ] trailing ]
//
// A ':' at the start of a parameter makes the rest of the line a single trailing parameter, and
// after 14 middles the remainder is taken verbatim.
fn parse_params(mut rest: &str) -> Vec<&str> {
    let mut params: Vec<&str> = Vec::new();
    while !rest.is_empty() {
        if let Some(trailing) = rest.strip_prefix(':') {
            params.push(trailing);
            break;
        }
        if params.len() == 14 {
            params.push(rest);
            break;
        }
        match rest.find(' ') {
            None => {
                params.push(rest);
                break;
            }
            Some(idx) => {
                if idx > 0 {
                    params.push(&rest[..idx]);
                }
                rest = &rest[idx + 1..];
            }
        }
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(buf: &mut Vec<u8>) -> Msg {
        parse_line(&take_line(buf).unwrap().unwrap()).unwrap()
    }

    #[test]
    fn test_parse_params() {
        assert_eq!(parse_params("p1 p2 p3"), vec!["p1", "p2", "p3"]);
        let empty: Vec<&str> = vec![];
        assert_eq!(parse_params(""), empty);
        assert_eq!(parse_params("   "), empty);
        assert_eq!(parse_params(":foo bar baz "), vec!["foo bar baz "]);
        assert_eq!(
            parse_params(":foo : bar : baz :"),
            vec!["foo : bar : baz :"]
        );
        assert_eq!(parse_params(":"), vec![""]);
        assert_eq!(parse_params("x:"), vec!["x:"]);
        assert_eq!(parse_params("x:y:z"), vec!["x:y:z"]);
        assert_eq!(parse_params(":::::"), vec!["::::"]);
        assert_eq!(parse_params("x y : : :"), vec!["x", "y", " : :"]);
        assert_eq!(parse_params("aaa://aaa"), vec!["aaa://aaa"]);

        let params = parse_params("1 2 3 4 5 6 7 8 9 10 11 12 13 14 blah blah blah");
        assert_eq!(params.len(), 15);
        assert_eq!(params[params.len() - 1], "blah blah blah");
    }

    #[test]
    fn test_take_line_framing() {
        let mut buf: Vec<u8> = b"PING :a\r\nPING :b\nPING".to_vec();
        assert_eq!(take_line(&mut buf).unwrap().unwrap(), "PING :a");
        assert_eq!(take_line(&mut buf).unwrap().unwrap(), "PING :b");
        // No terminator yet; the partial line stays buffered.
        assert!(take_line(&mut buf).is_none());
        assert_eq!(buf, b"PING");

        buf.extend_from_slice(b" :c\r\n");
        assert_eq!(take_line(&mut buf).unwrap().unwrap(), "PING :c");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_take_line_invalid_utf8() {
        let mut buf: Vec<u8> = b"PING :\xff\xfe\r\nPING :ok\r\n".to_vec();
        assert!(take_line(&mut buf).unwrap().is_err());
        // The bad line is dropped; parsing resumes on the next one.
        assert_eq!(take_line(&mut buf).unwrap().unwrap(), "PING :ok");
    }

    #[test]
    fn test_privmsg_parsing() {
        let mut buf = b":nick!~nick@unaffiliated/nick PRIVMSG irker001 :a b c\r\n".to_vec();
        assert_eq!(
            parse_one(&mut buf),
            Msg {
                pfx: Some(Pfx::User {
                    nick: "nick".to_owned(),
                    user: "~nick@unaffiliated/nick".to_owned(),
                }),
                cmd: Cmd::PRIVMSG {
                    target: "irker001".to_owned(),
                    msg: "a b c".to_owned(),
                    is_notice: false,
                },
            }
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_notice_parsing() {
        let mut buf = b":hitchcock.freenode.net NOTICE * :*** Looking up your hostname...\r\n".to_vec();
        assert_eq!(
            parse_one(&mut buf),
            Msg {
                pfx: Some(Pfx::Server("hitchcock.freenode.net".to_owned())),
                cmd: Cmd::PRIVMSG {
                    target: "*".to_owned(),
                    msg: "*** Looking up your hostname...".to_owned(),
                    is_notice: true,
                },
            }
        );
    }

    #[test]
    fn test_numeric_parsing() {
        let mut buf = Vec::new();
        buf.extend_from_slice(
            b":hitchcock.freenode.net 001 irker001 :Welcome to the freenode IRC Network irker001\r\n",
        );
        buf.extend_from_slice(
            b":hitchcock.freenode.net 005 irker001 CHANTYPES=# DEAF=D \
              CHANLIMIT=#:120 MAXCHANNELS=120 :are supported by this server\r\n",
        );
        buf.extend_from_slice(b":hitchcock.freenode.net 433 * irker001 :Nickname is already in use.\r\n");

        match parse_one(&mut buf).cmd {
            Cmd::Reply { num: 1, params } => assert_eq!(params.len(), 2),
            cmd => panic!("unexpected cmd: {:?}", cmd),
        }
        match parse_one(&mut buf).cmd {
            Cmd::Reply { num: 5, params } => {
                assert!(params.iter().any(|p| p == "DEAF=D"));
                assert!(params.iter().any(|p| p == "CHANLIMIT=#:120"));
            }
            cmd => panic!("unexpected cmd: {:?}", cmd),
        }
        match parse_one(&mut buf).cmd {
            Cmd::Reply { num: 433, .. } => {}
            cmd => panic!("unexpected cmd: {:?}", cmd),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_kick_parsing() {
        let mut buf = b":op!op@example.com KICK #devel irker001 :go away\r\n".to_vec();
        assert_eq!(
            parse_one(&mut buf),
            Msg {
                pfx: Some(Pfx::User {
                    nick: "op".to_owned(),
                    user: "op@example.com".to_owned(),
                }),
                cmd: Cmd::KICK {
                    chan: ChanName::new("#devel".to_owned()),
                    nick: "irker001".to_owned(),
                    msg: Some("go away".to_owned()),
                },
            }
        );

        let mut buf = b":op!op@example.com KICK #devel irker001\r\n".to_vec();
        match parse_one(&mut buf).cmd {
            Cmd::KICK { msg: None, .. } => {}
            cmd => panic!("unexpected cmd: {:?}", cmd),
        }
    }

    #[test]
    fn test_ping_and_error_parsing() {
        let mut buf = b"PING :wolfe.freenode.net\r\n".to_vec();
        assert_eq!(
            parse_one(&mut buf),
            Msg {
                pfx: None,
                cmd: Cmd::PING {
                    server: "wolfe.freenode.net".to_owned(),
                },
            }
        );

        let mut buf = b"ERROR :Closing Link: 10.0.0.1 (Excess Flood)\r\n".to_vec();
        assert_eq!(
            parse_one(&mut buf),
            Msg {
                pfx: None,
                cmd: Cmd::ERROR {
                    msg: "Closing Link: 10.0.0.1 (Excess Flood)".to_owned(),
                },
            }
        );
    }

    #[test]
    fn test_bare_command_parsing() {
        let mut buf = b":somenick QUIT\r\n".to_vec();
        assert_eq!(
            parse_one(&mut buf).cmd,
            Cmd::QUIT { msg: None }
        );
    }

    #[test]
    fn test_parse_pfx() {
        use Pfx::*;
        assert_eq!(parse_pfx("xyz"), Ambiguous("xyz".to_string()));
        assert_eq!(parse_pfx("xy.z"), Server("xy.z".to_string()));
        assert_eq!(
            parse_pfx("xyz[m]"),
            User {
                nick: "xyz[m]".to_string(),
                user: "".to_string()
            }
        );
        assert_eq!(
            parse_pfx("irker!irker@fe-00106.example.net"),
            User {
                nick: "irker".to_string(),
                user: "irker@fe-00106.example.net".to_string(),
            }
        );
    }

    #[test]
    fn test_generators() {
        assert_eq!(nick("irker001"), "NICK irker001\r\n");
        assert_eq!(
            user("irker", "irker relaying client"),
            "USER irker 0 * :irker relaying client\r\n"
        );
        assert_eq!(join(ChanNameRef::new("#devel"), None), "JOIN #devel\r\n");
        assert_eq!(
            join(ChanNameRef::new("#devel"), Some("hunter2")),
            "JOIN #devel hunter2\r\n"
        );
        assert_eq!(
            part(ChanNameRef::new("#devel"), Some("scavenged by irkerd")),
            "PART #devel :scavenged by irkerd\r\n"
        );
        assert_eq!(quit(None), "QUIT\r\n");
        assert_eq!(
            quit(Some("transmission timeout")),
            "QUIT :transmission timeout\r\n"
        );
        assert_eq!(mode("irker001", "+D"), "MODE irker001 +D\r\n");
        assert_eq!(pong("wolfe.freenode.net"), "PONG wolfe.freenode.net\r\n");
    }
}
