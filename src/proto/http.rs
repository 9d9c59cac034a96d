//! HTTP proxy protocol handler
//!
//! Inbound, three shapes share the handler:
//! - `CONNECT host:port` opens an opaque tunnel (a bare `200 OK` is sent and
//!   everything after it is relayed byte-for-byte);
//! - any other method with an absolute-URI target is plain proxying: the
//!   request line is rewritten to origin-form, `Proxy-*` headers are
//!   stripped, and the connection relays in [`forward_channel`] mode, which
//!   re-parses and rewrites every subsequent request head on the same
//!   keep-alive connection;
//! - a bare `GET /path` serves the configured static-content map (landing
//!   page / PAC file) and closes.
//!
//! Outbound, `connect` establishes a tunnel through an upstream HTTP proxy
//! with `CONNECT`, optionally with Basic credentials.

use std::{
    borrow::Cow,
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use log::{debug, trace, warn};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};

use crate::{
    auth::AuthConfig,
    relay::{Address, SharedFlowStat, RELAY_BUFFER_SIZE},
};

use super::{shadow::OtaSigner, ClientStream, ConnContext, Handshake, Protocol, RelayMode};

/// Upper bound on a request or reply head
const MAX_HEAD_SIZE: usize = 64 * 1024;

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Read a request/reply head through the `\r\n\r\n` terminator
///
/// `first` is a byte the dispatcher already consumed, prepended to the head.
async fn read_head<R>(stream: &mut R, first: Option<u8>) -> io::Result<Vec<u8>>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut head = Vec::with_capacity(512);
    if let Some(b) = first {
        head.push(b);
    }

    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read_until(b'\n', &mut head).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside an http head",
            ));
        }
        if head.len() > MAX_HEAD_SIZE {
            return Err(invalid("http head too large"));
        }
    }

    Ok(head)
}

/// Parse `host[:port]`, with brackets for IPv6 literals
fn parse_authority(s: &str, default_port: u16) -> io::Result<Address> {
    if s.is_empty() {
        return Err(invalid("empty authority"));
    }

    if let Some(rest) = s.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| invalid("unterminated IPv6 literal"))?;
        let ip: Ipv6Addr = host.parse().map_err(|_| invalid("malformed IPv6 literal"))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().map_err(|_| invalid("malformed port"))?,
            None if tail.is_empty() => default_port,
            None => return Err(invalid("garbage after IPv6 literal")),
        };
        return Ok(Address::SocketAddress(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0))));
    }

    let (host, port) = match s.rsplit_once(':') {
        Some((host, p)) => (host, p.parse::<u16>().map_err(|_| invalid("malformed port"))?),
        None => (s, default_port),
    };

    if let Ok(v4) = host.parse::<Ipv4Addr>() {
        return Ok(Address::SocketAddress(SocketAddr::V4(SocketAddrV4::new(v4, port))));
    }
    Ok(Address::DomainNameAddress(host.to_owned(), port))
}

/// Case-insensitive header lookup over raw header lines
fn header_value<'a>(lines: &[&'a str], name: &str) -> Option<&'a str> {
    lines.iter().find_map(|line| {
        let (n, v) = line.split_once(':')?;
        if n.trim().eq_ignore_ascii_case(name) {
            Some(v.trim())
        } else {
            None
        }
    })
}

/// Rewrite an absolute-URI request head to origin-form
///
/// Returns the destination and the rewritten head with `Proxy-*` headers
/// removed, or `None` when the head is not an absolute-form http request.
fn rewrite_absolute(head: &str) -> Option<(Address, Vec<u8>)> {
    let (line, rest) = head.split_once("\r\n")?;
    let mut parts = line.splitn(3, ' ');
    let method = parts.next()?;
    let target = parts.next()?;
    let version = parts.next()?;

    if target.len() < 7 || !target.as_bytes()[..7].eq_ignore_ascii_case(b"http://") {
        return None;
    }
    let tail = &target[7..];
    let (authority, path) = match tail.find('/') {
        Some(i) => (&tail[..i], &tail[i..]),
        None => (tail, "/"),
    };
    let addr = parse_authority(authority, 80).ok()?;

    let mut out = format!("{method} {path} {version}\r\n");
    for header in rest.split("\r\n") {
        if header.is_empty() {
            continue;
        }
        let name = header.split(':').next().unwrap_or("").trim();
        if name.len() >= 6 && name.as_bytes()[..6].eq_ignore_ascii_case(b"proxy-") {
            continue;
        }
        out.push_str(header);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");

    Some((addr, out.into_bytes()))
}

/// Rewrite a relay chunk that begins with an absolute-form request head
///
/// Anything else (body bytes, non-absolute requests, binary data) is
/// forwarded verbatim. Request heads are assumed to start at chunk
/// boundaries, which holds for interactively driven keep-alive connections.
pub(crate) fn rewrite_chunk(chunk: &[u8]) -> Cow<'_, [u8]> {
    let head_end = match chunk.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(i) => i + 4,
        None => return Cow::Borrowed(chunk),
    };
    let head = match std::str::from_utf8(&chunk[..head_end]) {
        Ok(head) => head,
        Err(..) => return Cow::Borrowed(chunk),
    };
    match rewrite_absolute(head) {
        Some((_, mut rewritten)) => {
            rewritten.extend_from_slice(&chunk[head_end..]);
            Cow::Owned(rewritten)
        }
        None => Cow::Borrowed(chunk),
    }
}

/// Client->upstream relay loop for plain (non-CONNECT) HTTP proxying
///
/// Unlike the generic byte pump, every chunk that starts a new request head
/// is re-parsed so absolute-URI targets keep getting rewritten for the
/// origin server.
pub async fn forward_channel<R, W>(
    mut reader: R,
    mut writer: crate::relay::RelayWrite<W>,
    stat: SharedFlowStat,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stat.incr_tx(n as u64);
        let out = rewrite_chunk(&buf[..n]);
        writer.write_chunk(&out).await?;
    }
    writer.shutdown().await
}

async fn respond<W>(stream: &mut W, head: &str, body: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let msg = format!("{head}Content-Length: {}\r\n\r\n{body}", body.len());
    stream.write_all(msg.as_bytes()).await?;
    stream.flush().await
}

pub struct Http;

#[async_trait]
impl Protocol for Http {
    fn name(&self) -> &'static str {
        "http"
    }

    fn correct_header(&self, header: Option<u8>, _socket: &TcpStream, _auth: &AuthConfig) -> bool {
        header.is_some_and(|b| b.is_ascii_alphabetic())
    }

    async fn parse(
        &self,
        header: Option<u8>,
        stream: &mut ClientStream,
        ctx: &mut ConnContext,
    ) -> io::Result<Handshake> {
        let head = read_head(stream, header).await?;
        let head = std::str::from_utf8(&head).map_err(|_| invalid("http head is not UTF-8"))?;

        let (line, rest) = head.split_once("\r\n").ok_or_else(|| invalid("missing request line"))?;
        let mut parts = line.splitn(3, ' ');
        let method = parts.next().unwrap_or("");
        let target = parts.next().ok_or_else(|| invalid("missing request target"))?;
        parts.next().ok_or_else(|| invalid("missing http version"))?;
        let headers: Vec<&str> = rest.split("\r\n").filter(|l| !l.is_empty()).collect();

        // Static content for bare GETs with no authority (landing page, PAC
        // file); serving it ends the connection
        if method == "GET" && target.starts_with('/') {
            return match ctx.httpget.get(target) {
                Some(template) => {
                    ctx.auth.set_authed();
                    let host = header_value(&headers, "Host").unwrap_or("");
                    let body = template.replace("%(host)s", host);
                    respond(stream, "HTTP/1.1 200 OK\r\nConnection: close\r\n", &body).await?;
                    debug!("http static GET {} served, peer: {}", target, ctx.peer_addr);
                    Err(io::Error::other("static content served"))
                }
                None => {
                    respond(stream, "HTTP/1.1 404 Not Found\r\nConnection: close\r\n", "").await?;
                    Err(invalid(format!("no static content for {target}")))
                }
            };
        }

        if ctx.auth.needs_auth() {
            let expected = ctx.auth.config().secret().map(|s| BASE64.encode(s));
            let supplied = header_value(&headers, "Proxy-Authorization")
                .and_then(|v| v.split_once(' '))
                .filter(|(scheme, ..)| scheme.eq_ignore_ascii_case("basic"))
                .map(|(.., token)| token.trim());

            if expected.as_deref() != supplied || supplied.is_none() {
                respond(
                    stream,
                    "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"protomux\"\r\nConnection: close\r\n",
                    "",
                )
                .await?;
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "http proxy authorization rejected",
                ));
            }
            ctx.auth.set_authed();
        }

        if method.eq_ignore_ascii_case("CONNECT") {
            let addr = parse_authority(target, 443)?;
            stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;
            stream.flush().await?;

            debug!("http CONNECT {} peer: {}", addr, ctx.peer_addr);
            return Ok(Handshake::to(addr));
        }

        // Plain proxying: rewrite to origin-form and forward the head as
        // inline payload
        let (addr, rewritten) =
            rewrite_absolute(head).ok_or_else(|| invalid(format!("unsupported request target {target:?}")))?;

        debug!("http {} {} peer: {}", method, addr, ctx.peer_addr);
        Ok(Handshake {
            addr,
            payload: Bytes::from(rewritten),
            mode: RelayMode::HttpForward,
            ota: None,
        })
    }

    async fn connect(
        &self,
        upstream: &mut ClientStream,
        auth: &AuthConfig,
        addr: &Address,
    ) -> io::Result<Option<OtaSigner>> {
        let authority = match *addr {
            Address::SocketAddress(sa) => sa.to_string(),
            Address::DomainNameAddress(ref dname, port) => format!("{dname}:{port}"),
        };

        let mut req = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
        if let Some(secret) = auth.secret() {
            req.push_str(&format!("Proxy-Authorization: Basic {}\r\n", BASE64.encode(secret)));
        }
        req.push_str("\r\n");
        upstream.write_all(req.as_bytes()).await?;
        upstream.flush().await?;

        // The reply is consumed through the blank line; its status is not
        // acted upon, only logged when surprising
        let reply = read_head(upstream, None).await?;
        if let Ok(text) = std::str::from_utf8(&reply) {
            let status_2xx = text.split_whitespace().nth(1).is_some_and(|c| c.starts_with('2'));
            if !status_2xx {
                let line = text.split("\r\n").next().unwrap_or("");
                warn!("http upstream CONNECT reply not 2xx: {line:?}");
            }
        }

        trace!("http upstream tunnel ready for {}", addr);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_forms() {
        assert_eq!(
            parse_authority("example.com:8080", 80).unwrap(),
            Address::DomainNameAddress("example.com".to_owned(), 8080)
        );
        assert_eq!(
            parse_authority("example.com", 80).unwrap(),
            Address::DomainNameAddress("example.com".to_owned(), 80)
        );
        assert_eq!(
            parse_authority("10.0.0.1:443", 80).unwrap(),
            Address::SocketAddress("10.0.0.1:443".parse().unwrap())
        );
        assert_eq!(
            parse_authority("[2001:db8::2]:8443", 80).unwrap(),
            Address::SocketAddress("[2001:db8::2]:8443".parse().unwrap())
        );
        assert!(parse_authority("example.com:notaport", 80).is_err());
    }

    #[test]
    fn absolute_uri_is_rewritten_to_origin_form() {
        let head = "GET http://example.com:8080/a/b?q=1 HTTP/1.1\r\n\
                    Host: example.com:8080\r\n\
                    Proxy-Connection: keep-alive\r\n\
                    Accept: */*\r\n\r\n";
        let (addr, rewritten) = rewrite_absolute(head).unwrap();
        assert_eq!(addr, Address::DomainNameAddress("example.com".to_owned(), 8080));
        assert_eq!(
            std::str::from_utf8(&rewritten).unwrap(),
            "GET /a/b?q=1 HTTP/1.1\r\nHost: example.com:8080\r\nAccept: */*\r\n\r\n"
        );
    }

    #[test]
    fn origin_form_is_left_alone() {
        assert!(rewrite_absolute("GET /index HTTP/1.1\r\nHost: x\r\n\r\n").is_none());
    }

    #[test]
    fn chunk_rewrite_passes_non_requests_through() {
        let body = b"\x00\x01binary body data";
        assert!(matches!(rewrite_chunk(body), Cow::Borrowed(..)));

        let chunk = b"POST http://h/submit HTTP/1.1\r\nProxy-Authorization: Basic eDp5\r\n\r\nBODY";
        let out = rewrite_chunk(chunk);
        assert_eq!(&*out, b"POST /submit HTTP/1.1\r\n\r\nBODY");
    }
}
