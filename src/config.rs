//! Server and upstream configuration consumed by the core
//!
//! Construction is the caller's job (CLI, file loader); this module only
//! defines the structs and a listener-URI shorthand of the form
//! `proto[+proto...]://host:port[#secret]`, e.g.
//! `http+socks4+socks5://0.0.0.0:8080#user:pass`.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use crate::{
    auth::AuthConfig,
    proto::{get_protos, Protocol, RegistryError},
    relay::Address,
};

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid listener uri {0:?}, expected proto[+proto]://host:port[#secret]")]
    InvalidUri(String),
    #[error("invalid listen address {0:?}")]
    InvalidAddress(String),
    #[error("{0}")]
    Registry(#[from] RegistryError),
}

/// Second-hop proxy every outbound connection is chained through
pub struct UpstreamConfig {
    /// Upstream proxy address
    pub addr: Address,
    /// Protocol spoken to the upstream
    pub proto: Arc<dyn Protocol>,
    /// Credential presented to the upstream
    pub auth: Arc<AuthConfig>,
}

impl UpstreamConfig {
    pub fn new(addr: Address, proto: Arc<dyn Protocol>) -> UpstreamConfig {
        UpstreamConfig {
            addr,
            proto,
            auth: Arc::new(AuthConfig::none()),
        }
    }

    pub fn with_auth(mut self, auth: AuthConfig) -> UpstreamConfig {
        self.auth = Arc::new(auth);
        self
    }

    /// Parse `proto://host:port[#secret]`
    pub fn from_uri(uri: &str) -> Result<UpstreamConfig, ConfigError> {
        let (tokens, addr, auth) = split_uri(uri)?;
        let mut protos = get_protos(&tokens)?;
        if protos.len() != 1 {
            return Err(ConfigError::InvalidUri(uri.to_owned()));
        }
        let addr: Address = addr
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(addr.to_owned()))?;

        Ok(UpstreamConfig {
            addr,
            proto: protos.remove(0),
            auth: Arc::new(auth),
        })
    }
}

/// One listener and everything its connections need
pub struct ServerConfig {
    /// Listen address
    pub listen: SocketAddr,
    /// Accepted protocols, in sniffing order
    pub protos: Vec<Arc<dyn Protocol>>,
    /// Credential required from clients
    pub auth: Arc<AuthConfig>,
    /// Static GET path -> body template map served by the http handler;
    /// `%(host)s` in a body expands to the request's Host header
    pub httpget: Arc<HashMap<String, String>>,
    /// Optional chained upstream for all outbound connections
    pub upstream: Option<UpstreamConfig>,
}

impl ServerConfig {
    pub fn new(listen: SocketAddr, protos: Vec<Arc<dyn Protocol>>) -> ServerConfig {
        ServerConfig {
            listen,
            protos,
            auth: Arc::new(AuthConfig::none()),
            httpget: Arc::new(HashMap::new()),
            upstream: None,
        }
    }

    /// Parse `proto[+proto...]://host:port[#secret]`
    pub fn from_uri(uri: &str) -> Result<ServerConfig, ConfigError> {
        let (tokens, addr, auth) = split_uri(uri)?;
        let protos = get_protos(&tokens)?;
        let listen: SocketAddr = addr
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(addr.to_owned()))?;

        Ok(ServerConfig {
            listen,
            protos,
            auth: Arc::new(auth),
            httpget: Arc::new(HashMap::new()),
            upstream: None,
        })
    }

    pub fn with_auth(mut self, auth: AuthConfig) -> ServerConfig {
        self.auth = Arc::new(auth);
        self
    }

    pub fn with_httpget(mut self, httpget: HashMap<String, String>) -> ServerConfig {
        self.httpget = Arc::new(httpget);
        self
    }

    pub fn with_upstream(mut self, upstream: UpstreamConfig) -> ServerConfig {
        self.upstream = Some(upstream);
        self
    }
}

fn split_uri(uri: &str) -> Result<(Vec<String>, &str, AuthConfig), ConfigError> {
    let (scheme, rest) = uri
        .split_once("://")
        .ok_or_else(|| ConfigError::InvalidUri(uri.to_owned()))?;

    let (addr, secret) = match rest.split_once('#') {
        Some((addr, secret)) => (addr, Some(secret)),
        None => (rest, None),
    };
    if addr.is_empty() {
        return Err(ConfigError::InvalidUri(uri.to_owned()));
    }

    let tokens: Vec<String> = scheme.split('+').map(str::to_owned).collect();
    let auth = match secret {
        Some(secret) => AuthConfig::with_secret(secret.as_bytes()),
        None => AuthConfig::none(),
    };

    Ok((tokens, addr, auth))
}
