//! protomux server binary
//!
//! All configuration comes from the command line:
//!
//! ```bash
//! protomux -l http+socks4+socks5://0.0.0.0:8080
//! protomux -l socks5://0.0.0.0:1080#user:pass -r socks5://10.0.0.1:1080
//! protomux -l http://0.0.0.0:8080 --httpget /proxy.pac=./wpad.dat
//! ```

use std::{collections::HashMap, process::ExitCode};

use clap::{Arg, ArgAction, Command};
use log::error;

use protomux::{config::UpstreamConfig, Server, ServerConfig};

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = Command::new("protomux")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Multi-protocol sniffing proxy: SOCKS4/SOCKS5/HTTP/Shadowsocks(R)/transparent on one port")
        .arg(
            Arg::new("LISTEN")
                .short('l')
                .long("listen")
                .required(true)
                .value_name("URI")
                .help("Listener as proto[+proto...]://host:port[#secret]"),
        )
        .arg(
            Arg::new("REMOTE")
                .short('r')
                .long("remote")
                .value_name("URI")
                .help("Chain every outbound connection through proto://host:port[#secret]"),
        )
        .arg(
            Arg::new("HTTPGET")
                .long("httpget")
                .action(ArgAction::Append)
                .value_name("PATH=FILE")
                .help("Serve FILE for plain GET PATH requests (repeatable; %(host)s expands in FILE)"),
        )
        .get_matches();

    let uri = matches.get_one::<String>("LISTEN").expect("required");
    let mut config = match ServerConfig::from_uri(uri) {
        Ok(config) => config,
        Err(err) => {
            error!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    if let Some(remote) = matches.get_one::<String>("REMOTE") {
        match UpstreamConfig::from_uri(remote) {
            Ok(upstream) => config = config.with_upstream(upstream),
            Err(err) => {
                error!("{}", err);
                return ExitCode::FAILURE;
            }
        }
    }

    if let Some(entries) = matches.get_many::<String>("HTTPGET") {
        let mut httpget = HashMap::new();
        for entry in entries {
            let Some((path, file)) = entry.split_once('=') else {
                error!("invalid --httpget {:?}, expected PATH=FILE", entry);
                return ExitCode::FAILURE;
            };
            match std::fs::read_to_string(file) {
                Ok(body) => {
                    httpget.insert(path.to_owned(), body);
                }
                Err(err) => {
                    error!("cannot read {:?}: {}", file, err);
                    return ExitCode::FAILURE;
                }
            }
        }
        config = config.with_httpget(httpget);
    }

    if !config.auth.required() {
        log::warn!("no credential configured, accepting unauthenticated clients");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("cannot build runtime: {}", err);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(Server::new(config).run()) {
        Ok(..) => ExitCode::SUCCESS,
        Err(err) => {
            error!("server exited: {}", err);
            ExitCode::FAILURE
        }
    }
}
