use std::path::PathBuf;

/// Command line arguments.
#[derive(Debug, Default)]
pub(crate) struct Args {
    /// Path to an optional YAML config file; flags override its values.
    pub(crate) config_path: Option<PathBuf>,

    /// File of trusted certificates for SSL/TLS.
    pub(crate) ca_file: Option<PathBuf>,

    /// PEM file used to authenticate to the server.
    pub(crate) cert_file: Option<PathBuf>,

    /// How much to log (critical, error, warning, info, debug).
    pub(crate) log_level: Option<String>,

    /// IP address to listen on.
    pub(crate) host: Option<String>,

    /// File for saving captured message traffic.
    pub(crate) log_file: Option<PathBuf>,

    /// Nickname, optionally with a `%d`-style server-connection marker.
    pub(crate) nick: Option<String>,

    /// NickServ password.
    pub(crate) password: Option<String>,

    /// Send a single message to this IRC URL and exit.
    pub(crate) immediate: Option<String>,

    /// Message for immediate mode. When omitted the message is read from stdin.
    pub(crate) message: Option<String>,
}

/// Parses command line arguments and handles `--version` and `--help`.
pub(crate) fn parse() -> Args {
    let mut parsed = Args::default();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "-V" || arg == "--version" {
            print_version();
            std::process::exit(0);
        }

        if arg == "-h" || arg == "--help" {
            print_help();
            std::process::exit(0);
        }

        let mut take_value = |name: &str| match args.next() {
            Some(value) => value,
            None => {
                eprintln!("Error: The argument '{}' requires a value but none was supplied", name);
                eprintln!();
                eprintln!("For more information try --help");
                std::process::exit(1);
            }
        };

        match arg.as_str() {
            "--config" => parsed.config_path = Some(take_value("--config").into()),
            "-c" | "--ca-file" => parsed.ca_file = Some(take_value("--ca-file").into()),
            "-e" | "--cert-file" => parsed.cert_file = Some(take_value("--cert-file").into()),
            "-d" | "--log-level" => parsed.log_level = Some(take_value("--log-level")),
            "-H" | "--host" => parsed.host = Some(take_value("--host")),
            "-l" | "--log-file" => parsed.log_file = Some(take_value("--log-file").into()),
            "-n" | "--nick" => parsed.nick = Some(take_value("--nick")),
            "-p" | "--password" => parsed.password = Some(take_value("--password")),
            "-i" | "--immediate" => parsed.immediate = Some(take_value("--immediate")),
            _ => {
                if arg.starts_with('-') {
                    eprintln!("Error: Found argument '{}' which wasn't expected", arg);
                    eprintln!();
                    eprintln!("For more information try --help");
                    std::process::exit(1);
                }
                if parsed.message.is_some() {
                    eprintln!("Error: Found a second message argument '{}'", arg);
                    std::process::exit(1);
                }
                parsed.message = Some(arg);
            }
        }
    }

    parsed
}

fn print_version() {
    println!("irkerd {}", env!("CARGO_PKG_VERSION"));
}

fn print_help() {
    print_version();
    let crate_description = env!("CARGO_PKG_DESCRIPTION");
    println!(
        "\
{crate_description}

USAGE:
    irkerd [OPTIONS] [MESSAGE]

ARGS:
    <MESSAGE>       message for --immediate mode (read from stdin when omitted)

OPTIONS:
    --config <FILE>            Read settings from a YAML config file (flags win)
    -c, --ca-file <PATH>       File of trusted certificates for SSL/TLS
    -e, --cert-file <PATH>     PEM file used to authenticate to the server
    -d, --log-level <LEVEL>    One of critical, error, warning, info, debug
    -H, --host <ADDRESS>       IP address to listen on
    -l, --log-file <PATH>      File for saving captured message traffic
    -n, --nick <NAME>          Nickname (optionally with a '%d' connection marker)
    -p, --password <PASSWORD>  NickServ password
    -i, --immediate <IRC-URL>  Send a single message to IRC-URL and exit
    -h, --help                 Print help information
    -V, --version              Print version information",
    )
}
