//! SOCKS4 protocol handler
//!
//! <http://ftp.icm.edu.pl/packages/socks/socks4/SOCKS4.protocol>
//!
//! Request: VN(0x04) CD(0x01) DSTPORT(2) DSTIP(4) USERID NUL.
//! Reply: VN(0x00) CD(0x5a) DSTPORT(2) DSTIP(4). The grant reply is written
//! immediately after parsing, before the outbound connection is attempted;
//! SOCKS4 clients expect the ack first.

use std::{
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
};

use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use log::{debug, trace};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt},
    net::{lookup_host, TcpStream},
};

use crate::{auth::AuthConfig, relay::Address};

use super::{shadow::OtaSigner, ClientStream, ConnContext, Handshake, Protocol};

#[rustfmt::skip]
mod consts {
    pub const SOCKS4_VERSION:                u8 = 0x04;
    pub const SOCKS4_COMMAND_CONNECT:        u8 = 0x01;
    pub const SOCKS4_RESULT_REQUEST_GRANTED: u8 = 0x5a;
}

pub struct Socks4;

impl Socks4 {
    /// Resolve a destination to an IPv4 socket address; SOCKS4 carries no
    /// other address family on the wire
    async fn resolve_v4(addr: &Address) -> io::Result<SocketAddrV4> {
        match *addr {
            Address::SocketAddress(SocketAddr::V4(v4)) => Ok(v4),
            Address::SocketAddress(SocketAddr::V6(..)) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "socks4 cannot address an IPv6 destination",
            )),
            Address::DomainNameAddress(ref dname, port) => {
                let mut addrs = lookup_host((dname.as_str(), port)).await?;
                addrs
                    .find_map(|sa| match sa {
                        SocketAddr::V4(v4) => Some(v4),
                        SocketAddr::V6(..) => None,
                    })
                    .ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::NotFound,
                            format!("no IPv4 address for {dname}"),
                        )
                    })
            }
        }
    }
}

#[async_trait]
impl Protocol for Socks4 {
    fn name(&self) -> &'static str {
        "socks4"
    }

    fn correct_header(&self, header: Option<u8>, _socket: &TcpStream, _auth: &AuthConfig) -> bool {
        header == Some(consts::SOCKS4_VERSION)
    }

    async fn parse(
        &self,
        _header: Option<u8>,
        stream: &mut ClientStream,
        ctx: &mut ConnContext,
    ) -> io::Result<Handshake> {
        // CD + DSTPORT + DSTIP
        let mut buf = [0u8; 7];
        stream.read_exact(&mut buf).await?;

        if buf[0] != consts::SOCKS4_COMMAND_CONNECT {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported socks4 command {:#04x}", buf[0]),
            ));
        }

        let port = BigEndian::read_u16(&buf[1..3]);
        let ip = Ipv4Addr::new(buf[3], buf[4], buf[5], buf[6]);

        let mut user_id = Vec::new();
        let n = stream.read_until(0, &mut user_id).await?;
        if n == 0 || user_id.last() != Some(&0) {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "socks4 user-id not terminated",
            ));
        }
        user_id.pop();

        if ctx.auth.needs_auth() {
            if !ctx.auth.config().verify(&user_id) {
                // No negative reply defined for a credential mismatch; drop
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "socks4 user-id rejected",
                ));
            }
            ctx.auth.set_authed();
        }

        // Grant before connecting; required by the protocol
        let mut reply = BytesMut::with_capacity(8);
        reply.put_u8(0x00);
        reply.put_u8(consts::SOCKS4_RESULT_REQUEST_GRANTED);
        reply.put_slice(&buf[1..7]);
        stream.write_all(&reply).await?;
        stream.flush().await?;

        let addr = Address::SocketAddress(SocketAddr::V4(SocketAddrV4::new(ip, port)));
        debug!("socks4 CONNECT {} peer: {}", addr, ctx.peer_addr);

        Ok(Handshake::to(addr))
    }

    async fn connect(
        &self,
        upstream: &mut ClientStream,
        auth: &AuthConfig,
        addr: &Address,
    ) -> io::Result<Option<OtaSigner>> {
        let dest = Socks4::resolve_v4(addr).await?;

        let mut req = BytesMut::with_capacity(9 + auth.secret().map_or(0, <[u8]>::len));
        req.put_u8(consts::SOCKS4_VERSION);
        req.put_u8(consts::SOCKS4_COMMAND_CONNECT);
        req.put_u16(dest.port());
        req.put_slice(&dest.ip().octets());
        if let Some(secret) = auth.secret() {
            req.put_slice(secret);
        }
        req.put_u8(0x00);
        upstream.write_all(&req).await?;
        upstream.flush().await?;

        let mut reply = [0u8; 8];
        upstream.read_exact(&mut reply).await?;
        if reply[0] != 0x00 || reply[1] != consts::SOCKS4_RESULT_REQUEST_GRANTED {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("socks4 upstream rejected request, code {:#04x}", reply[1]),
            ));
        }

        trace!("socks4 upstream granted {}", addr);
        Ok(None)
    }
}
