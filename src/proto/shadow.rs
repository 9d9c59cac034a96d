//! Shadowsocks / ShadowsocksR protocol handlers
//!
//! Both speak the bare SOCKS-style address header. Shadowsocks additionally
//! supports one-time-auth: the address header carries flag 0x10 and a 10-byte
//! truncated HMAC-SHA1, and every following chunk is framed as
//! `len(2, BE) || hmac(10) || payload` with the chunk HMAC keyed by
//! `iv || seq(4, BE)`. A checksum mismatch anywhere is fatal for the
//! connection.
//!
//! The stream-cipher layer is out of scope here, so the `iv` component of the
//! HMAC keys is empty and the pre-shared secret stands in for the cipher key;
//! the key layout keeps the `iv || key` split so a cipher layer can supply a
//! real IV without touching the framing.

use std::io;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use hmac::{Hmac, Mac};
use log::{debug, trace};
use sha1::Sha1;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};

use crate::{
    auth::AuthConfig,
    relay::{Address, ADDR_OTA_FLAG},
};

use super::{ClientStream, ConnContext, Handshake, Protocol};

const OTA_HMAC_LEN: usize = 10;

#[rustfmt::skip]
mod tags {
    pub const SSR: &[u8] = &[0x01, 0x03, 0x04];
    pub const SS:  &[u8] = &[0x01, 0x03, 0x04, 0x11, 0x13, 0x14];
}

fn hmac_sha1_trunc(key: &[u8], msg: &[u8]) -> [u8; OTA_HMAC_LEN] {
    let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("hmac-sha1 accepts any key length");
    mac.update(msg);
    let digest = mac.finalize().into_bytes();
    let mut trunc = [0u8; OTA_HMAC_LEN];
    trunc.copy_from_slice(&digest[..OTA_HMAC_LEN]);
    trunc
}

fn header_hmac(iv: &[u8], key: &[u8], msg: &[u8]) -> [u8; OTA_HMAC_LEN] {
    let mut k = Vec::with_capacity(iv.len() + key.len());
    k.extend_from_slice(iv);
    k.extend_from_slice(key);
    hmac_sha1_trunc(&k, msg)
}

fn chunk_hmac(iv: &[u8], seq: u32, payload: &[u8]) -> [u8; OTA_HMAC_LEN] {
    let mut k = Vec::with_capacity(iv.len() + 4);
    k.extend_from_slice(iv);
    k.extend_from_slice(&seq.to_be_bytes());
    hmac_sha1_trunc(&k, payload)
}

/// Decode side of the one-time-auth chunk stream
pub struct OtaVerifier {
    iv: Vec<u8>,
    seq: u32,
}

impl OtaVerifier {
    pub fn new(iv: Vec<u8>) -> OtaVerifier {
        OtaVerifier { iv, seq: 0 }
    }

    /// Read and verify one framed chunk into `buf`; 0 means the peer closed
    /// at a chunk boundary
    pub async fn read_chunk<R>(&mut self, r: &mut R, buf: &mut Vec<u8>) -> io::Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        let mut head = [0u8; 2 + OTA_HMAC_LEN];
        if r.read(&mut head[..1]).await? == 0 {
            return Ok(0);
        }
        r.read_exact(&mut head[1..]).await?;

        let len = u16::from_be_bytes([head[0], head[1]]) as usize;
        if buf.len() < len {
            buf.resize(len, 0);
        }
        r.read_exact(&mut buf[..len]).await?;

        let expected = chunk_hmac(&self.iv, self.seq, &buf[..len]);
        if expected[..] != head[2..] {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("one-time-auth checksum mismatch on chunk {}", self.seq),
            ));
        }

        self.seq = self.seq.wrapping_add(1);
        Ok(len)
    }
}

/// Encode side of the one-time-auth chunk stream
pub struct OtaSigner {
    iv: Vec<u8>,
    seq: u32,
}

impl OtaSigner {
    pub fn new(iv: Vec<u8>) -> OtaSigner {
        OtaSigner { iv, seq: 0 }
    }

    /// Frame, sign and write one chunk
    pub async fn write_chunk<W>(&mut self, w: &mut W, payload: &[u8]) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        debug_assert!(payload.len() <= u16::MAX as usize);

        let mut frame = BytesMut::with_capacity(2 + OTA_HMAC_LEN + payload.len());
        frame.put_u16(payload.len() as u16);
        frame.put_slice(&chunk_hmac(&self.iv, self.seq, payload));
        frame.put_slice(payload);
        self.seq = self.seq.wrapping_add(1);

        w.write_all(&frame).await?;
        w.flush().await
    }
}

/// Read and check the remainder of the pre-shared key
///
/// The dispatcher already consumed (and matched) the first key byte; the
/// peer must follow with the rest of the key before its request. Shared by
/// the shadowsocks family and the transparent handlers.
pub(crate) async fn check_shared_key(stream: &mut ClientStream, ctx: &mut ConnContext) -> io::Result<()> {
    let secret = match ctx.auth.config().secret() {
        Some(secret) => secret.to_vec(),
        None => return Ok(()),
    };

    let mut tail = vec![0u8; secret.len() - 1];
    stream.read_exact(&mut tail).await?;
    if tail != secret[1..] {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "shared key rejected",
        ));
    }

    ctx.auth.set_authed();
    Ok(())
}

fn sniff_tagged(header: Option<u8>, auth: &AuthConfig, accepted: &[u8]) -> bool {
    match (header, auth.first_byte()) {
        (Some(b), Some(key0)) => b == key0,
        (Some(b), None) => accepted.contains(&b),
        (None, ..) => false,
    }
}

/// Serialize `addr` in domain form, as sent to an upstream hop
fn domain_form(addr: &Address, ota: bool) -> BytesMut {
    let host = addr.host();
    let mut buf = BytesMut::with_capacity(4 + host.len());
    buf.put_u8(if ota { 0x03 | ADDR_OTA_FLAG } else { 0x03 });
    buf.put_u8(host.len() as u8);
    buf.put_slice(host.as_bytes());
    buf.put_u16(addr.port());
    buf
}

async fn parse_shadow(
    name: &'static str,
    ota_capable: bool,
    header: Option<u8>,
    stream: &mut ClientStream,
    ctx: &mut ConnContext,
) -> io::Result<Handshake> {
    let atyp = if ctx.auth.needs_auth() {
        // The consumed byte was the first key byte; the address tag follows
        // the key on the wire
        check_shared_key(stream, ctx).await?;
        let mut atyp = [0u8; 1];
        stream.read_exact(&mut atyp).await?;
        atyp[0]
    } else {
        header.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "missing address header byte")
        })?
    };

    let addr = Address::read_body(atyp, stream).await?;

    let ota = if ota_capable && atyp & ADDR_OTA_FLAG != 0 {
        // Verify the header checksum over the exact bytes the peer sent
        let mut encoded = BytesMut::with_capacity(addr.serialized_len());
        addr.write_to_buf(&mut encoded);
        let mut msg = Vec::with_capacity(encoded.len());
        msg.push(atyp);
        msg.extend_from_slice(&encoded[1..]);

        let key = ctx.auth.config().secret().unwrap_or_default();
        let mut checksum = [0u8; OTA_HMAC_LEN];
        stream.read_exact(&mut checksum).await?;
        if header_hmac(&[], key, &msg) != checksum {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "one-time-auth header checksum mismatch",
            ));
        }

        trace!("{} one-time-auth enabled, peer: {}", name, ctx.peer_addr);
        Some(OtaVerifier::new(Vec::new()))
    } else {
        None
    };

    debug!("{} request {} peer: {}", name, addr, ctx.peer_addr);

    Ok(Handshake {
        addr,
        payload: bytes::Bytes::new(),
        mode: super::RelayMode::Tunnel,
        ota,
    })
}

async fn connect_shadow(
    upstream: &mut ClientStream,
    auth: &AuthConfig,
    addr: &Address,
    ota: bool,
) -> io::Result<Option<OtaSigner>> {
    let mut req = BytesMut::new();
    if let Some(secret) = auth.secret() {
        req.put_slice(secret);
    }

    let encoded = domain_form(addr, ota);
    req.put_slice(&encoded);
    if ota {
        let key = auth.secret().unwrap_or_default();
        req.put_slice(&header_hmac(&[], key, &encoded));
    }

    upstream.write_all(&req).await?;
    upstream.flush().await?;

    Ok(if ota { Some(OtaSigner::new(Vec::new())) } else { None })
}

/// Shadowsocks handler; `with_ota` enables one-time-auth framing on the
/// outbound hop (inbound one-time-auth is always honored when the peer
/// requests it via the flagged address tag)
pub struct Shadowsocks {
    ota: bool,
}

impl Shadowsocks {
    pub fn new() -> Shadowsocks {
        Shadowsocks { ota: false }
    }

    pub fn with_ota() -> Shadowsocks {
        Shadowsocks { ota: true }
    }
}

impl Default for Shadowsocks {
    fn default() -> Shadowsocks {
        Shadowsocks::new()
    }
}

#[async_trait]
impl Protocol for Shadowsocks {
    fn name(&self) -> &'static str {
        "ss"
    }

    fn correct_header(&self, header: Option<u8>, _socket: &TcpStream, auth: &AuthConfig) -> bool {
        sniff_tagged(header, auth, tags::SS)
    }

    async fn parse(
        &self,
        header: Option<u8>,
        stream: &mut ClientStream,
        ctx: &mut ConnContext,
    ) -> io::Result<Handshake> {
        parse_shadow("ss", true, header, stream, ctx).await
    }

    async fn connect(
        &self,
        upstream: &mut ClientStream,
        auth: &AuthConfig,
        addr: &Address,
    ) -> io::Result<Option<OtaSigner>> {
        connect_shadow(upstream, auth, addr, self.ota).await
    }
}

/// ShadowsocksR handler; same address header, no one-time-auth mode
pub struct ShadowsocksR;

#[async_trait]
impl Protocol for ShadowsocksR {
    fn name(&self) -> &'static str {
        "ssr"
    }

    fn correct_header(&self, header: Option<u8>, _socket: &TcpStream, auth: &AuthConfig) -> bool {
        sniff_tagged(header, auth, tags::SSR)
    }

    async fn parse(
        &self,
        header: Option<u8>,
        stream: &mut ClientStream,
        ctx: &mut ConnContext,
    ) -> io::Result<Handshake> {
        parse_shadow("ssr", false, header, stream, ctx).await
    }

    async fn connect(
        &self,
        upstream: &mut ClientStream,
        auth: &AuthConfig,
        addr: &Address,
    ) -> io::Result<Option<OtaSigner>> {
        connect_shadow(upstream, auth, addr, false).await
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[tokio::test]
    async fn ota_chunks_roundtrip() {
        let mut wire = Cursor::new(Vec::new());
        let mut signer = OtaSigner::new(Vec::new());
        signer.write_chunk(&mut wire, b"first chunk").await.unwrap();
        signer.write_chunk(&mut wire, b"second").await.unwrap();

        let mut verifier = OtaVerifier::new(Vec::new());
        let mut cur = Cursor::new(wire.into_inner());
        let mut buf = Vec::new();

        let n = verifier.read_chunk(&mut cur, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"first chunk");
        let n = verifier.read_chunk(&mut cur, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"second");
        assert_eq!(verifier.read_chunk(&mut cur, &mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ota_detects_payload_corruption() {
        let mut cur = Cursor::new(Vec::new());
        let mut signer = OtaSigner::new(Vec::new());
        signer.write_chunk(&mut cur, b"payload bytes").await.unwrap();

        // Flip one payload byte
        let mut wire = cur.into_inner();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;

        let mut verifier = OtaVerifier::new(Vec::new());
        let mut buf = Vec::new();
        let err = verifier
            .read_chunk(&mut Cursor::new(wire), &mut buf)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn ota_detects_checksum_corruption() {
        let mut cur = Cursor::new(Vec::new());
        let mut signer = OtaSigner::new(Vec::new());
        signer.write_chunk(&mut cur, b"payload bytes").await.unwrap();

        // Flip one checksum byte (offset 2 is the first hmac byte)
        let mut wire = cur.into_inner();
        wire[2] ^= 0x80;

        let mut verifier = OtaVerifier::new(Vec::new());
        let mut buf = Vec::new();
        let err = verifier
            .read_chunk(&mut Cursor::new(wire), &mut buf)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn ota_sequence_is_enforced() {
        let mut chunk_a = Cursor::new(Vec::new());
        let mut chunk_b = Cursor::new(Vec::new());
        let mut signer = OtaSigner::new(Vec::new());
        signer.write_chunk(&mut chunk_a, b"aaa").await.unwrap();
        signer.write_chunk(&mut chunk_b, b"bbb").await.unwrap();

        // Replaying chunk 1 first fails: its hmac is keyed by seq 1, the
        // verifier expects seq 0
        let mut verifier = OtaVerifier::new(Vec::new());
        let mut buf = Vec::new();
        let err = verifier
            .read_chunk(&mut Cursor::new(chunk_b.into_inner()), &mut buf)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn sniff_respects_configured_key() {
        let auth = AuthConfig::with_secret(&b"Kxyz"[..]);
        assert!(sniff_tagged(Some(b'K'), &auth, tags::SS));
        assert!(!sniff_tagged(Some(0x03), &auth, tags::SS));

        let open = AuthConfig::none();
        assert!(sniff_tagged(Some(0x03), &open, tags::SS));
        assert!(sniff_tagged(Some(0x13), &open, tags::SS));
        assert!(!sniff_tagged(Some(0x13), &open, tags::SSR));
        assert!(!sniff_tagged(Some(0x05), &open, tags::SS));
    }
}
