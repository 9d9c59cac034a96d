//! SOCKS5 protocol handler (RFC 1928 CONNECT subset, RFC 1929 auth)

use std::{io, str};

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use log::{debug, error, trace};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::{auth::AuthConfig, relay::Address};

use super::{shadow::OtaSigner, ClientStream, ConnContext, Handshake, Protocol};

#[rustfmt::skip]
mod consts {
    pub const SOCKS5_VERSION:                    u8 = 0x05;

    pub const SOCKS5_AUTH_METHOD_NONE:           u8 = 0x00;
    pub const SOCKS5_AUTH_METHOD_PASSWORD:       u8 = 0x02;
    pub const SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE: u8 = 0xff;

    pub const SOCKS5_CMD_TCP_CONNECT:            u8 = 0x01;

    pub const SOCKS5_ADDR_TYPE_IPV4:             u8 = 0x01;
    pub const SOCKS5_ADDR_TYPE_DOMAIN_NAME:      u8 = 0x03;
    pub const SOCKS5_ADDR_TYPE_IPV6:             u8 = 0x04;

    pub const SOCKS5_AUTH_VERSION:               u8 = 0x01;
    pub const SOCKS5_AUTH_SUCCEEDED:             u8 = 0x00;
    pub const SOCKS5_AUTH_FAILURE:               u8 = 0x01;
}

pub struct Socks5;

impl Socks5 {
    /// RFC 1929 username/password subnegotiation, server side
    async fn check_auth_password(stream: &mut ClientStream, ctx: &mut ConnContext) -> io::Result<()> {
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await?;
        if head[0] != consts::SOCKS5_AUTH_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported auth version {:#04x}", head[0]),
            ));
        }

        let mut uname = vec![0u8; head[1] as usize];
        stream.read_exact(&mut uname).await?;

        let mut plen = [0u8; 1];
        stream.read_exact(&mut plen).await?;
        let mut passwd = vec![0u8; plen[0] as usize];
        stream.read_exact(&mut passwd).await?;

        let ok = match (str::from_utf8(&uname), str::from_utf8(&passwd)) {
            (Ok(user), Ok(pass)) => ctx.auth.config().check_user(user, pass),
            _ => false,
        };

        if !ok {
            stream
                .write_all(&[consts::SOCKS5_AUTH_VERSION, consts::SOCKS5_AUTH_FAILURE])
                .await?;
            stream.flush().await?;
            error!("socks5 rejected username/password from {}", ctx.peer_addr);
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "socks5 username/password rejected",
            ));
        }

        ctx.auth.set_authed();
        stream
            .write_all(&[consts::SOCKS5_AUTH_VERSION, consts::SOCKS5_AUTH_SUCCEEDED])
            .await?;
        stream.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Protocol for Socks5 {
    fn name(&self) -> &'static str {
        "socks5"
    }

    fn correct_header(&self, header: Option<u8>, _socket: &TcpStream, _auth: &AuthConfig) -> bool {
        header == Some(consts::SOCKS5_VERSION)
    }

    async fn parse(
        &self,
        _header: Option<u8>,
        stream: &mut ClientStream,
        ctx: &mut ConnContext,
    ) -> io::Result<Handshake> {
        // Method negotiation; the version byte was consumed by the dispatcher
        let mut nmethods = [0u8; 1];
        stream.read_exact(&mut nmethods).await?;
        let mut methods = vec![0u8; nmethods[0] as usize];
        stream.read_exact(&mut methods).await?;

        if ctx.auth.needs_auth() {
            if !methods.contains(&consts::SOCKS5_AUTH_METHOD_PASSWORD) {
                stream
                    .write_all(&[consts::SOCKS5_VERSION, consts::SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE])
                    .await?;
                stream.flush().await?;
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "socks5 client does not offer username/password auth",
                ));
            }

            stream
                .write_all(&[consts::SOCKS5_VERSION, consts::SOCKS5_AUTH_METHOD_PASSWORD])
                .await?;
            stream.flush().await?;
            Socks5::check_auth_password(stream, ctx).await?;
        } else {
            stream
                .write_all(&[consts::SOCKS5_VERSION, consts::SOCKS5_AUTH_METHOD_NONE])
                .await?;
            stream.flush().await?;
        }

        // Fixed request preamble VER CMD RSV
        let mut req = [0u8; 3];
        stream.read_exact(&mut req).await?;
        if req != [consts::SOCKS5_VERSION, consts::SOCKS5_CMD_TCP_CONNECT, 0x00] {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported socks5 request {req:02x?}"),
            ));
        }

        let mut atyp = [0u8; 1];
        stream.read_exact(&mut atyp).await?;
        let addr = Address::read_body(atyp[0], stream).await?;

        // Succeeded; the bound address is reported as 0.0.0.0 with the
        // requested port, sent before the outbound connect is attempted
        let mut reply = BytesMut::with_capacity(10);
        reply.put_slice(&[consts::SOCKS5_VERSION, 0x00, 0x00, consts::SOCKS5_ADDR_TYPE_IPV4]);
        reply.put_slice(&[0, 0, 0, 0]);
        reply.put_u16(addr.port());
        stream.write_all(&reply).await?;
        stream.flush().await?;

        debug!("socks5 CONNECT {} peer: {}", addr, ctx.peer_addr);
        Ok(Handshake::to(addr))
    }

    async fn connect(
        &self,
        upstream: &mut ClientStream,
        auth: &AuthConfig,
        addr: &Address,
    ) -> io::Result<Option<OtaSigner>> {
        // Method negotiation as a client
        if auth.required() {
            upstream
                .write_all(&[
                    consts::SOCKS5_VERSION,
                    0x02,
                    consts::SOCKS5_AUTH_METHOD_NONE,
                    consts::SOCKS5_AUTH_METHOD_PASSWORD,
                ])
                .await?;
        } else {
            upstream
                .write_all(&[consts::SOCKS5_VERSION, 0x01, consts::SOCKS5_AUTH_METHOD_NONE])
                .await?;
        }
        upstream.flush().await?;

        let mut chosen = [0u8; 2];
        upstream.read_exact(&mut chosen).await?;
        match chosen[1] {
            consts::SOCKS5_AUTH_METHOD_NONE => {}
            consts::SOCKS5_AUTH_METHOD_PASSWORD => {
                let (user, pass) = auth.user_pass().ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        "upstream requires username/password but none is configured",
                    )
                })?;

                let mut subneg = BytesMut::with_capacity(3 + user.len() + pass.len());
                subneg.put_u8(consts::SOCKS5_AUTH_VERSION);
                subneg.put_u8(user.len() as u8);
                subneg.put_slice(user.as_bytes());
                subneg.put_u8(pass.len() as u8);
                subneg.put_slice(pass.as_bytes());
                upstream.write_all(&subneg).await?;
                upstream.flush().await?;

                let mut status = [0u8; 2];
                upstream.read_exact(&mut status).await?;
                if status[1] != consts::SOCKS5_AUTH_SUCCEEDED {
                    return Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        "upstream rejected username/password",
                    ));
                }
            }
            method => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("upstream chose unsupported auth method {method:#04x}"),
                ));
            }
        }

        // CONNECT with the destination as a domain name; an upstream resolves
        // it, sparing this hop the DNS lookup
        let host = addr.host();
        let mut req = BytesMut::with_capacity(7 + host.len());
        req.put_slice(&[consts::SOCKS5_VERSION, consts::SOCKS5_CMD_TCP_CONNECT, 0x00]);
        req.put_u8(consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME);
        req.put_u8(host.len() as u8);
        req.put_slice(host.as_bytes());
        req.put_u16(addr.port());
        upstream.write_all(&req).await?;
        upstream.flush().await?;

        let mut reply = [0u8; 3];
        upstream.read_exact(&mut reply).await?;
        if reply[0] != consts::SOCKS5_VERSION || reply[1] != 0x00 {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("socks5 upstream replied {:#04x}", reply[1]),
            ));
        }

        // Skip the bound-address body; its length depends on the reply's tag
        let mut atyp = [0u8; 1];
        upstream.read_exact(&mut atyp).await?;
        let skip = match atyp[0] {
            consts::SOCKS5_ADDR_TYPE_IPV4 => 4 + 2,
            consts::SOCKS5_ADDR_TYPE_IPV6 => 16 + 2,
            consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME => {
                let mut len = [0u8; 1];
                upstream.read_exact(&mut len).await?;
                len[0] as usize + 2
            }
            tag => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("socks5 upstream reply has unknown address tag {tag:#04x}"),
                ));
            }
        };
        let mut body = vec![0u8; skip];
        upstream.read_exact(&mut body).await?;

        trace!("socks5 upstream tunnel ready for {}", addr);
        Ok(None)
    }
}
