//! The persistent IRC multiplexer: parses JSON relay requests, routes each target URL to the
//! dispatcher for its server, and keeps the dispatcher population bounded.

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::target::{InvalidRequest, Target};
use crate::watcher::Watcher;

use libirker_common::ChanNameRef;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Cap on live dispatchers, to head off DoS attacks that aim at exhausting sockets or file
/// descriptors.
pub(crate) const CONNECTION_MAX: usize = 200;

#[derive(Clone)]
pub(crate) struct Relay {
    inner: Rc<RefCell<RelayInner>>,
}

struct RelayInner {
    config: Rc<Config>,
    watcher: Option<Watcher>,
    servers: HashMap<(String, u16), Dispatcher>,
}

impl Relay {
    pub(crate) fn new(config: Rc<Config>) -> Relay {
        let watcher = config.log_file.clone().map(Watcher::new);
        Relay {
            inner: Rc::new(RefCell::new(RelayInner {
                config,
                watcher,
                servers: HashMap::new(),
            })),
        }
    }

    /// Perform one JSON relay request. The transports are fire-and-forget, so every failure mode
    /// ends in a log line rather than a response.
    pub(crate) fn handle(&self, line: &str, quit_after: bool) {
        let (targets, message) = match parse_request(line) {
            Ok(parsed) => parsed,
            Err(err) => {
                error!("irkerd: {}", err);
                return;
            }
        };

        let mut inner = self.inner.borrow_mut();
        let RelayInner {
            config,
            watcher,
            servers,
        } = &mut *inner;
        for target in targets {
            let dispatcher = servers.entry(target.server_key()).or_insert_with(|| {
                Dispatcher::new(target.clone(), config.clone(), watcher.clone())
            });
            dispatcher.dispatch(
                ChanNameRef::new(&target.channel),
                &message,
                target.key.as_deref(),
                quit_after,
            );
        }

        // GC dispatchers with no live sessions, then enforce the global cap. The session
        // longest idle goes first, on the assumption that message activity is clumpy.
        servers.retain(|_, dispatcher| dispatcher.live());
        if servers.len() >= CONNECTION_MAX {
            let oldest = servers
                .iter()
                .min_by_key(|(_, dispatcher)| dispatcher.last_xmit())
                .map(|(server, _)| server.clone());
            if let Some(server) = oldest {
                info!("dropping longest-idle session pool {:?}", server);
                servers.remove(&server);
            }
        }
    }

    /// All queues drained and all sockets closed or closing. Immediate mode exits when this
    /// turns true.
    pub(crate) fn quiesced(&self) -> bool {
        self.inner
            .borrow()
            .servers
            .values()
            .all(|dispatcher| dispatcher.quiesced())
    }
}

#[cfg(test)]
impl Relay {
    pub(crate) fn server_count(&self) -> usize {
        self.inner.borrow().servers.len()
    }
}

fn parse_request(line: &str) -> Result<(Vec<Target>, String), InvalidRequest> {
    let request: serde_json::Value = serde_json::from_str(line.trim()).map_err(|err| {
        InvalidRequest(format!("can't recognize JSON on input {:?}: {}", line, err))
    })?;
    let request = request
        .as_object()
        .ok_or_else(|| InvalidRequest(format!("request is not a JSON object: {:?}", line)))?;

    let to = request.get("to").ok_or_else(|| {
        InvalidRequest(format!("malformed request - 'to' missing: {:?}", line))
    })?;
    let message = request
        .get("privmsg")
        .ok_or_else(|| InvalidRequest(format!("malformed request - 'privmsg' missing: {:?}", line)))?
        .as_str()
        .ok_or_else(|| InvalidRequest(format!("malformed request - unexpected message type: {:?}", line)))?;

    let urls: Vec<&serde_json::Value> = match to {
        serde_json::Value::Array(elems) => elems.iter().collect(),
        url @ serde_json::Value::String(_) => vec![url],
        other => {
            return Err(InvalidRequest(format!(
                "malformed request - unexpected channel type: {}",
                other
            )))
        }
    };

    let mut targets = Vec::with_capacity(urls.len());
    for url in urls {
        // A bad URL loses only itself; the rest of the request still goes out.
        let target = match url.as_str() {
            None => Err(InvalidRequest(format!(
                "malformed request - URL has unexpected type: {}",
                url
            ))),
            Some(url) => Target::parse(url),
        };
        match target {
            Ok(target) => targets.push(target),
            Err(err) => error!("irkerd: {}", err),
        }
    }
    Ok((targets, message.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(line: &str) -> Result<(Vec<Target>, String), InvalidRequest> {
        parse_request(line)
    }

    #[test]
    fn single_url_request() {
        let (targets, message) =
            targets(r#"{"to":"irc://irc.example.net/devel","privmsg":"hello"}"#).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].channel, "#devel");
        assert_eq!(message, "hello");
    }

    #[test]
    fn url_list_request() {
        let (targets, _) = targets(
            r#"{"to":["irc://s1/a","irc://s1/b","irc://s2/a"],"privmsg":"hi"}"#,
        )
        .unwrap();
        assert_eq!(targets.len(), 3);
        assert_eq!(targets[2].servername, "s2");
    }

    #[test]
    fn extra_fields_are_ignored() {
        let (targets, _) = targets(
            r#"{"to":"irc://h/c","privmsg":"hi","version":2,"origin":"hook"}"#,
        )
        .unwrap();
        assert_eq!(targets.len(), 1);
    }

    #[test]
    fn malformed_requests() {
        assert!(targets("not json").is_err());
        assert!(targets(r#""just a string""#).is_err());
        assert!(targets(r#"{"privmsg":"hi"}"#).is_err());
        assert!(targets(r#"{"to":"irc://h/c"}"#).is_err());
        assert!(targets(r#"{"to":42,"privmsg":"hi"}"#).is_err());
        assert!(targets(r#"{"to":"irc://h/c","privmsg":17}"#).is_err());
    }

    #[test]
    fn bad_url_in_list_loses_only_itself() {
        let (targets, _) = targets(
            r#"{"to":["irc://s1/a",42,"irc://no-channel-here","irc://s2/b"],"privmsg":"hi"}"#,
        )
        .unwrap();
        let servers: Vec<&str> = targets.iter().map(|t| t.servername.as_str()).collect();
        assert_eq!(servers, vec!["s1", "s2"]);
    }
}
