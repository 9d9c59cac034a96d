//! Protocol handlers, sniffing dispatcher and registry
//!
//! Every supported wire protocol implements [`Protocol`]: a cheap
//! `correct_header` predicate used by the dispatcher to claim an incoming
//! connection, a `parse` that consumes the inbound handshake, and a `connect`
//! that frames the outbound handshake when this protocol is used as an
//! upstream chain hop. Handlers are stateless; everything per-connection
//! lives in [`ConnContext`].

use std::{collections::HashMap, io, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, BufReader},
    net::TcpStream,
};

use crate::{
    auth::{AuthConfig, AuthState},
    relay::Address,
};

pub mod direct;
pub mod http;
pub mod shadow;
pub mod socks4;
pub mod socks5;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        pub mod redir;
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "openbsd"))] {
        pub mod pf;
    }
}

/// Buffered view of an accepted or outbound socket
///
/// `BufReader` supplies `read_exact` / `read_until` for handshake parsing and
/// forwards `AsyncWrite`, so handshake responses go through the same value.
pub type ClientStream = BufReader<TcpStream>;

/// How the post-handshake bytes are relayed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayMode {
    /// Opaque byte-for-byte relay
    Tunnel,
    /// Plain HTTP proxying: every request head on the persistent connection
    /// is re-parsed and rewritten to origin-form before forwarding
    HttpForward,
}

/// Result of a successful inbound handshake
pub struct Handshake {
    /// Destination the client asked for
    pub addr: Address,
    /// Inline payload already consumed from the client, to be written to the
    /// upstream before relaying
    pub payload: Bytes,
    /// Relay loop variant
    pub mode: RelayMode,
    /// One-time-auth decode layer for the client->upstream direction,
    /// negotiated by the shadowsocks handler
    pub ota: Option<shadow::OtaVerifier>,
}

impl Handshake {
    /// Plain tunnel handshake with no inline payload
    pub fn to(addr: Address) -> Handshake {
        Handshake {
            addr,
            payload: Bytes::new(),
            mode: RelayMode::Tunnel,
            ota: None,
        }
    }
}

/// Per-connection state threaded through parsing
pub struct ConnContext {
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub auth: AuthState,
    /// Static GET path -> body template map served by the HTTP handler
    pub httpget: Arc<HashMap<String, String>>,
}

impl ConnContext {
    pub fn new(
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        auth: Arc<AuthConfig>,
        httpget: Arc<HashMap<String, String>>,
    ) -> ConnContext {
        ConnContext {
            peer_addr,
            local_addr,
            auth: AuthState::new(auth),
            httpget,
        }
    }
}

/// One wire protocol: sniff, parse, outbound-connect
#[async_trait]
pub trait Protocol: Send + Sync {
    /// Registry token and log name
    fn name(&self) -> &'static str;

    /// Whether this handler claims the connection
    ///
    /// Called twice by the dispatcher: first with `header = None` so handlers
    /// that need only socket metadata (transparent proxying) can match
    /// without consuming bytes, then with the first byte read from the wire.
    /// Must be side-effect-free and must not consume stream bytes.
    fn correct_header(&self, header: Option<u8>, socket: &TcpStream, auth: &AuthConfig) -> bool;

    /// Consume the inbound handshake
    ///
    /// `header` is the byte the dispatcher already consumed, if any. May
    /// write handshake responses back through `stream`. Fails on malformed
    /// or unauthorized peers; the failure closes the connection.
    async fn parse(
        &self,
        header: Option<u8>,
        stream: &mut ClientStream,
        ctx: &mut ConnContext,
    ) -> io::Result<Handshake>;

    /// Frame the outbound handshake on a freshly connected upstream
    ///
    /// Returns the one-time-auth encode layer when this hop negotiated one.
    async fn connect(
        &self,
        upstream: &mut ClientStream,
        auth: &AuthConfig,
        addr: &Address,
    ) -> io::Result<Option<shadow::OtaSigner>>;
}

/// Dispatch failure
#[derive(Debug, thiserror::Error)]
pub enum SniffError {
    #[error("connection closed before a protocol was determined")]
    ConnectionClosed,
    #[error("unsupported protocol, first byte {0:#04x}")]
    UnsupportedProtocol(u8),
    #[error("{0}")]
    IoError(#[from] io::Error),
}

impl From<SniffError> for io::Error {
    fn from(err: SniffError) -> io::Error {
        match err {
            SniffError::IoError(err) => err,
            SniffError::ConnectionClosed => io::Error::new(io::ErrorKind::UnexpectedEof, err.to_string()),
            SniffError::UnsupportedProtocol(..) => io::Error::new(io::ErrorKind::Unsupported, err.to_string()),
        }
    }
}

/// Select the handler for an accepted connection
///
/// Metadata pass first, then exactly one byte is read and re-offered. The
/// selected handler's `parse` must receive the returned byte so it is not
/// lost.
pub async fn sniff(
    protos: &[Arc<dyn Protocol>],
    stream: &mut ClientStream,
    auth: &AuthConfig,
) -> Result<(Arc<dyn Protocol>, Option<u8>), SniffError> {
    for proto in protos {
        if proto.correct_header(None, stream.get_ref(), auth) {
            log::trace!("sniffed {} from socket metadata", proto.name());
            return Ok((proto.clone(), None));
        }
    }

    let mut first = [0u8; 1];
    match stream.read_exact(&mut first).await {
        Ok(..) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(SniffError::ConnectionClosed);
        }
        Err(err) => return Err(err.into()),
    }

    for proto in protos {
        if proto.correct_header(Some(first[0]), stream.get_ref(), auth) {
            log::trace!("sniffed {} from header {:#04x}", proto.name(), first[0]);
            return Ok((proto.clone(), Some(first[0])));
        }
    }

    Err(SniffError::UnsupportedProtocol(first[0]))
}

/// Registry failure
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown protocol {token:?}, expected one of {valid}")]
    UnknownToken { token: String, valid: &'static str },
    #[error("no protocol specified")]
    NoProtocolSpecified,
    #[error("protocol {0:?} is not supported on this platform")]
    UnsupportedPlatform(&'static str),
    #[error("cannot open packet filter device: {0}")]
    PfDevice(#[source] io::Error),
}

/// Valid registry tokens, for error messages
pub const VALID_TOKENS: &str = "direct, http, socks5, socks, socks4, ss, ssr, redir, pf, ssl, secure";

#[cfg(any(target_os = "linux", target_os = "android"))]
fn redir_handler() -> Result<Arc<dyn Protocol>, RegistryError> {
    Ok(Arc::new(redir::Redir))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn redir_handler() -> Result<Arc<dyn Protocol>, RegistryError> {
    Err(RegistryError::UnsupportedPlatform("redir"))
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "openbsd"))]
fn pf_handler() -> Result<Arc<dyn Protocol>, RegistryError> {
    let handler = pf::Pf::open().map_err(RegistryError::PfDevice)?;
    Ok(Arc::new(handler))
}

#[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "openbsd")))]
fn pf_handler() -> Result<Arc<dyn Protocol>, RegistryError> {
    Err(RegistryError::UnsupportedPlatform("pf"))
}

/// Map configuration tokens to an ordered, de-duplicated handler list
///
/// `ssl` and `secure` are reserved for an outer TLS-wrapping layer and
/// contribute no handler here.
pub fn get_protos<I, S>(tokens: I) -> Result<Vec<Arc<dyn Protocol>>, RegistryError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut protos: Vec<Arc<dyn Protocol>> = Vec::new();

    for token in tokens {
        let handler: Option<Arc<dyn Protocol>> = match token.as_ref() {
            "direct" => Some(Arc::new(direct::Direct)),
            "http" => Some(Arc::new(http::Http)),
            "socks5" | "socks" => Some(Arc::new(socks5::Socks5)),
            "socks4" => Some(Arc::new(socks4::Socks4)),
            "ss" => Some(Arc::new(shadow::Shadowsocks::new())),
            "ssr" => Some(Arc::new(shadow::ShadowsocksR)),
            "redir" => Some(redir_handler()?),
            "pf" => Some(pf_handler()?),
            // Reserved for the outer TLS layer
            "ssl" | "secure" => None,
            unknown => {
                return Err(RegistryError::UnknownToken {
                    token: unknown.to_owned(),
                    valid: VALID_TOKENS,
                });
            }
        };

        if let Some(handler) = handler {
            if !protos.iter().any(|p| p.name() == handler.name()) {
                protos.push(handler);
            }
        }
    }

    if protos.is_empty() {
        return Err(RegistryError::NoProtocolSpecified);
    }

    Ok(protos)
}
