//! protomux is a protocol-sniffing relay proxy.
//!
//! One listener terminates SOCKS4, SOCKS5, HTTP (CONNECT and plain
//! proxying), Shadowsocks, ShadowsocksR and transparently redirected
//! connections, picks the protocol from the first byte on the wire or from
//! socket metadata, and relays to the destination — optionally chained
//! through a second proxy speaking any of the same protocols.
//!
//! ```no_run
//! use protomux::{config::ServerConfig, server::Server};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let config = ServerConfig::from_uri("http+socks4+socks5://127.0.0.1:8080").unwrap();
//!     Server::new(config).run().await
//! }
//! ```

pub use crate::{
    auth::AuthConfig,
    config::{ConfigError, ServerConfig, UpstreamConfig},
    proto::{get_protos, Protocol, RegistryError},
    relay::{Address, FlowStat, SharedFlowStat},
    server::Server,
};

pub mod auth;
pub mod config;
pub mod proto;
pub mod relay;
pub mod server;
