//! irkerd - a persistent IRC relay daemon.
//!
//! Listens for JSON objects of the form `{"to": <irc-url>, "privmsg": <text>}` and relays the
//! text to IRC channels, holding sessions open across requests so that delivery latency isn't
//! dominated by connection setup. The value of `to` may be a single IRC URL or a list of them;
//! each request must be followed by a newline.

mod cli;
mod config;
mod conn;
mod dispatch;
mod listen;
mod relay;
mod target;
mod watcher;

#[cfg(test)]
mod tests;

use crate::config::Config;
use crate::relay::Relay;

use std::process::exit;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::LevelFilter;
use tokio::net::{TcpListener, UdpSocket};

#[macro_use]
extern crate log;

fn main() {
    let args = cli::parse();

    let file_cfg = match &args.config_path {
        Some(path) => match config::parse_config(path) {
            Ok(file_cfg) => file_cfg,
            Err(err) => {
                eprintln!("Can't parse config file:");
                eprintln!("{}", err);
                exit(1);
            }
        },
        None => Default::default(),
    };

    let log_level = args.log_level.clone().or(file_cfg.log_level);
    init_logging(log_level.as_deref());

    if args.message.is_some() && args.immediate.is_none() {
        error!(
            "irkerd: message argument given ({:?}), but --immediate not set",
            args.message
        );
        exit(1);
    }

    let nick_template = args
        .nick
        .or(file_cfg.nick)
        .unwrap_or_else(|| config::NICK_TEMPLATE.to_owned());
    let config = Rc::new(Config {
        host: args.host.or(file_cfg.host).unwrap_or_else(|| config::HOST.to_owned()),
        port: file_cfg.port.unwrap_or(config::PORT),
        nick_needs_number: config::nick_needs_number(&nick_template),
        nick_template,
        nickserv_pass: args.password.or(file_cfg.password),
        ca_file: args.ca_file.or(file_cfg.ca_file),
        cert_file: args.cert_file.or(file_cfg.cert_file),
        log_file: args.log_file.or(file_cfg.log_file),
    });
    info!("irkerd version {}", env!("CARGO_PKG_VERSION"));

    // One task per request listener, one consumer task per session, and a reader and writer
    // task per socket, all cooperating on a single thread.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let local = tokio::task::LocalSet::new();

    local.block_on(&runtime, async move {
        let relay = Relay::new(config.clone());

        match args.immediate {
            Some(url) => immediate(relay, &url, args.message).await,
            None => serve(relay, &config).await,
        }
    });
}

/// Map the irkerd log-level names onto `log` filters and install the logger. The `IRKER_LOG`
/// environment variable takes precedence, with the usual `env_logger` filter syntax.
fn init_logging(log_level: Option<&str>) {
    let filter = match log_level {
        None => LevelFilter::Error,
        Some("critical") | Some("error") => LevelFilter::Error,
        Some("warning") => LevelFilter::Warn,
        Some("info") => LevelFilter::Info,
        Some("debug") => LevelFilter::Debug,
        Some(other) => {
            eprintln!("irkerd: unknown log level {:?}", other);
            exit(1);
        }
    };
    let mut builder = env_logger::Builder::new();
    builder.filter_level(filter);
    builder.parse_env("IRKER_LOG");
    builder.init();
}

/// Normal operation: bind the two request listeners and serve forever.
async fn serve(relay: Relay, config: &Config) {
    let bind_addr = (config.host.as_str(), config.port);
    let tcp = match TcpListener::bind(bind_addr).await {
        Ok(tcp) => tcp,
        Err(err) => {
            error!("irkerd: server launch failed: {}", err);
            exit(1);
        }
    };
    let udp = match UdpSocket::bind(bind_addr).await {
        Ok(udp) => udp,
        Err(err) => {
            error!("irkerd: server launch failed: {}", err);
            exit(1);
        }
    };
    info!("listening on {}:{}", config.host, config.port);

    tokio::task::spawn_local(listen::tcp_task(tcp, relay.clone()));
    tokio::task::spawn_local(listen::udp_task(udp, relay));
    std::future::pending::<()>().await
}

/// One-shot mode: relay a single message, wait for delivery to finish, and exit. The message
/// comes from the command line or, failing that, stdin.
async fn immediate(relay: Relay, url: &str, message: Option<String>) {
    let message = match message {
        Some(message) => message,
        None => {
            let mut text = String::new();
            use std::io::Read;
            if let Err(err) = std::io::stdin().read_to_string(&mut text) {
                error!("irkerd: can't read message from stdin: {}", err);
                exit(1);
            }
            text
        }
    };

    let request = serde_json::json!({ "to": url, "privmsg": message }).to_string();
    relay.handle(&request, true);

    // Wait for the queue to drain and the QUIT to go out; don't wait on a hung server forever.
    let deadline = Instant::now() + Duration::from_secs(60);
    while !relay.quiesced() && Instant::now() < deadline {
        tokio::time::sleep(conn::ANTI_BUZZ_DELAY).await;
    }
}
