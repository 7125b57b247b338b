use serde::Deserialize;

use std::fmt::Write;
use std::path::{Path, PathBuf};

pub(crate) const HOST: &str = "localhost";
pub(crate) const PORT: u16 = 6659;
pub(crate) const NICK_TEMPLATE: &str = "irker%03d";

/// Runtime configuration, assembled in `main` from the command line and the optional config
/// file (flags win).
#[derive(Debug)]
pub(crate) struct Config {
    /// Address the request listeners bind to.
    pub(crate) host: String,

    /// Port the request listeners bind to (one TCP and one UDP listener, same port).
    pub(crate) port: u16,

    /// Nick template, with an optional `%d`-style marker for the connection index.
    pub(crate) nick_template: String,

    /// Whether `nick_template` carries a marker. Without one every session uses the template
    /// verbatim and nick collisions can't be recovered by renumbering.
    pub(crate) nick_needs_number: bool,

    /// NickServ password, sent as `identify` right after the welcome.
    pub(crate) nickserv_pass: Option<String>,

    /// File of trusted certificates for `ircs://` targets. `None` uses the system trust store.
    pub(crate) ca_file: Option<PathBuf>,

    /// PEM file used to authenticate to TLS servers.
    pub(crate) cert_file: Option<PathBuf>,

    /// Traffic capture file. Setting this also puts the relay in watcher mode: it skips setting
    /// the DEAF user mode so that channel traffic stays observable.
    pub(crate) log_file: Option<PathBuf>,
}

/// The optional YAML config file. Every field mirrors a command line flag.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ConfigFile {
    pub(crate) host: Option<String>,
    pub(crate) port: Option<u16>,
    pub(crate) nick: Option<String>,
    pub(crate) password: Option<String>,
    pub(crate) ca_file: Option<PathBuf>,
    pub(crate) cert_file: Option<PathBuf>,
    pub(crate) log_file: Option<PathBuf>,
    pub(crate) log_level: Option<String>,
}

pub(crate) fn parse_config(path: &Path) -> Result<ConfigFile, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|err| format!("can't read {:?}: {}", path, err))?;
    serde_yaml::from_str(&contents).map_err(|err| err.to_string())
}

/// Expands the `%d` / `%0Nd` connection-index marker in a nick template. A template without a
/// marker is returned verbatim.
pub(crate) fn format_nick(template: &str, n: u32) -> String {
    match nick_marker(template) {
        None => template.to_owned(),
        Some((start, end, width)) => {
            let mut nick = String::with_capacity(template.len() + 8);
            nick.push_str(&template[..start]);
            let _ = write!(nick, "{:01$}", n, width);
            nick.push_str(&template[end..]);
            nick
        }
    }
}

pub(crate) fn nick_needs_number(template: &str) -> bool {
    nick_marker(template).is_some()
}

/// Byte range and zero-pad width of the first `%d`-style marker, if any.
fn nick_marker(template: &str) -> Option<(usize, usize, usize)> {
    let start = template.find('%')?;
    let rest = &template[start + 1..];
    let digits_len = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if rest[digits_len..].starts_with('d') {
        let width = rest[..digits_len].parse().unwrap_or(0);
        Some((start, start + 1 + digits_len + 1, width))
    } else {
        None
    }
}
