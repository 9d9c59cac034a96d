//! SOCKS-style address header codec
//!
//! The wire representation is shared by SOCKS5 (RFC1928 §4), Shadowsocks and
//! ShadowsocksR: a one-byte address-type tag, the address body, then a 2-byte
//! big-endian port. Shadowsocks additionally sets bit 0x10 on the tag to
//! signal one-time-auth mode; the codec accepts the flagged variants and
//! leaves their interpretation to the shadowsocks handler.

use std::{
    fmt::{self, Debug, Display, Formatter},
    io::{self, ErrorKind},
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs},
    str::FromStr,
    vec,
};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[rustfmt::skip]
mod consts {
    pub const ADDR_TYPE_IPV4:        u8 = 0x01;
    pub const ADDR_TYPE_DOMAIN_NAME: u8 = 0x03;
    pub const ADDR_TYPE_IPV6:        u8 = 0x04;
}

/// One-time-auth flag bit carried on the address-type tag (Shadowsocks)
pub const ADDR_OTA_FLAG: u8 = 0x10;

/// Address codec error
#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("{0}")]
    IoError(#[from] io::Error),
    #[error("unknown address header {0:#04x}")]
    UnknownAddressHeader(u8),
    #[error("address domain name must be UTF-8 encoding")]
    InvalidDomainEncoding,
}

impl From<AddressError> for io::Error {
    fn from(err: AddressError) -> io::Error {
        match err {
            AddressError::IoError(err) => err,
            e => io::Error::new(ErrorKind::InvalidData, e),
        }
    }
}

/// Destination address parsed from a protocol handshake
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// Socket address (IP address)
    SocketAddress(SocketAddr),
    /// Domain name address, resolved at connect time
    DomainNameAddress(String, u16),
}

impl Address {
    /// Read a full address header (tag, body, port) from `stream`
    pub async fn read_from<R>(stream: &mut R) -> Result<Address, AddressError>
    where
        R: AsyncRead + Unpin,
    {
        let mut atyp = [0u8; 1];
        stream.read_exact(&mut atyp).await?;
        Self::read_body(atyp[0], stream).await
    }

    /// Read the address body and port for an already-consumed tag byte
    ///
    /// Accepts both the canonical tags (1/3/4) and their one-time-auth
    /// variants (17/19/20). EOF from the reader propagates as the underlying
    /// `io::Error`, not as a malformed-header error.
    pub async fn read_body<R>(atyp: u8, stream: &mut R) -> Result<Address, AddressError>
    where
        R: AsyncRead + Unpin,
    {
        match atyp & !ADDR_OTA_FLAG {
            consts::ADDR_TYPE_IPV4 => {
                let mut buf = [0u8; 6];
                stream.read_exact(&mut buf).await?;

                let addr = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
                let port = u16::from_be_bytes([buf[4], buf[5]]);
                Ok(Address::SocketAddress(SocketAddr::V4(SocketAddrV4::new(addr, port))))
            }
            consts::ADDR_TYPE_IPV6 => {
                let mut buf = [0u8; 18];
                stream.read_exact(&mut buf).await?;

                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[..16]);
                let addr = Ipv6Addr::from(octets);
                let port = u16::from_be_bytes([buf[16], buf[17]]);
                Ok(Address::SocketAddress(SocketAddr::V6(SocketAddrV6::new(addr, port, 0, 0))))
            }
            consts::ADDR_TYPE_DOMAIN_NAME => {
                let mut length_buf = [0u8; 1];
                stream.read_exact(&mut length_buf).await?;
                let length = length_buf[0] as usize;

                let mut raw_addr = vec![0u8; length + 2];
                stream.read_exact(&mut raw_addr).await?;

                let port = u16::from_be_bytes([raw_addr[length], raw_addr[length + 1]]);
                raw_addr.truncate(length);

                let addr = match String::from_utf8(raw_addr) {
                    Ok(addr) => addr,
                    Err(..) => return Err(AddressError::InvalidDomainEncoding),
                };

                Ok(Address::DomainNameAddress(addr, port))
            }
            _ => Err(AddressError::UnknownAddressHeader(atyp)),
        }
    }

    /// Write the canonical wire form to `writer`
    pub async fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.write_to_buf(&mut buf);
        writer.write_all(&buf).await
    }

    /// Serialize into a buffer with the canonical (low) tag
    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        match *self {
            Address::SocketAddress(SocketAddr::V4(ref addr)) => {
                buf.put_u8(consts::ADDR_TYPE_IPV4);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::SocketAddress(SocketAddr::V6(ref addr)) => {
                buf.put_u8(consts::ADDR_TYPE_IPV6);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::DomainNameAddress(ref dnaddr, port) => {
                debug_assert!(dnaddr.len() <= u8::MAX as usize, "domain name longer than 255");
                buf.put_u8(consts::ADDR_TYPE_DOMAIN_NAME);
                buf.put_u8(dnaddr.len() as u8);
                buf.put_slice(dnaddr.as_bytes());
                buf.put_u16(port);
            }
        }
    }

    /// Buffer size required by `write_to_buf`
    #[inline]
    pub fn serialized_len(&self) -> usize {
        match *self {
            Address::SocketAddress(SocketAddr::V4(..)) => 1 + 4 + 2,
            Address::SocketAddress(SocketAddr::V6(..)) => 1 + 16 + 2,
            Address::DomainNameAddress(ref dmname, _) => 1 + 1 + dmname.len() + 2,
        }
    }

    /// Associated port number
    pub fn port(&self) -> u16 {
        match *self {
            Address::SocketAddress(addr) => addr.port(),
            Address::DomainNameAddress(.., port) => port,
        }
    }

    /// Host part as a string
    pub fn host(&self) -> String {
        match *self {
            Address::SocketAddress(ref addr) => addr.ip().to_string(),
            Address::DomainNameAddress(ref domain, ..) => domain.clone(),
        }
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            Address::SocketAddress(ref addr) => write!(f, "{addr}"),
            Address::DomainNameAddress(ref addr, ref port) => write!(f, "{addr}:{port}"),
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            Address::SocketAddress(ref addr) => write!(f, "{addr}"),
            Address::DomainNameAddress(ref addr, ref port) => write!(f, "{addr}:{port}"),
        }
    }
}

impl ToSocketAddrs for Address {
    type Iter = vec::IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> io::Result<vec::IntoIter<SocketAddr>> {
        match self.clone() {
            Address::SocketAddress(addr) => Ok(vec![addr].into_iter()),
            Address::DomainNameAddress(addr, port) => (addr.as_str(), port).to_socket_addrs(),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(s: SocketAddr) -> Address {
        Address::SocketAddress(s)
    }
}

impl From<(String, u16)> for Address {
    fn from((dn, port): (String, u16)) -> Address {
        Address::DomainNameAddress(dn, port)
    }
}

/// `Address` parse error for `FromStr`
#[derive(Debug)]
pub struct AddressParseError;

impl Display for AddressParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("invalid address")
    }
}

impl std::error::Error for AddressParseError {}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Address, AddressParseError> {
        match s.parse::<SocketAddr>() {
            Ok(addr) => Ok(Address::SocketAddress(addr)),
            Err(..) => {
                let mut sp = s.split(':');
                match (sp.next(), sp.next()) {
                    (Some(dn), Some(port)) => match port.parse::<u16>() {
                        Ok(port) => Ok(Address::DomainNameAddress(dn.to_owned(), port)),
                        Err(..) => Err(AddressParseError),
                    },
                    (Some(dn), None) => Ok(Address::DomainNameAddress(dn.to_owned(), 80)),
                    _ => Err(AddressParseError),
                }
            }
        }
    }
}
