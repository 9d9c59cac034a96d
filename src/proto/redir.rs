//! Transparent proxying for Linux iptables/ip6tables REDIRECT
//!
//! The REDIRECT target rewrites the packet destination to this listener and
//! stashes the original destination in conntrack, retrievable with
//! `getsockopt(SOL_IP, SO_ORIGINAL_DST)` (or the ip6tables equivalent). No
//! handshake bytes are involved unless a shared key is configured, in which
//! case the client prefixes its stream with the key.

use std::{
    io, mem,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    os::unix::io::AsRawFd,
};

use async_trait::async_trait;
use log::debug;
use tokio::net::TcpStream;

use crate::{auth::AuthConfig, relay::Address};

use super::{shadow::check_shared_key, ClientStream, ConnContext, Handshake, Protocol};

fn sockaddr_to_std(saddr: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match saddr.ss_family as libc::c_int {
        libc::AF_INET => {
            let addr: &libc::sockaddr_in = unsafe { &*(saddr as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            let port = u16::from_be(addr.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            let addr: &libc::sockaddr_in6 = unsafe { &*(saddr as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, addr.sin6_scope_id)))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported address family {family}"),
        )),
    }
}

fn get_original_destination_addr(s: &TcpStream) -> io::Result<SocketAddr> {
    let fd = s.as_raw_fd();

    unsafe {
        let mut target_addr: libc::sockaddr_storage = mem::zeroed();
        let mut target_addr_len = mem::size_of_val(&target_addr) as libc::socklen_t;

        let ret = match s.local_addr()? {
            SocketAddr::V4(..) => libc::getsockopt(
                fd,
                libc::SOL_IP,
                libc::SO_ORIGINAL_DST,
                &mut target_addr as *mut _ as *mut _,
                &mut target_addr_len,
            ),
            SocketAddr::V6(..) => libc::getsockopt(
                fd,
                libc::SOL_IPV6,
                libc::IP6T_SO_ORIGINAL_DST,
                &mut target_addr as *mut _ as *mut _,
                &mut target_addr_len,
            ),
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        sockaddr_to_std(&target_addr)
    }
}

pub struct Redir;

#[async_trait]
impl Protocol for Redir {
    fn name(&self) -> &'static str {
        "redir"
    }

    fn correct_header(&self, header: Option<u8>, socket: &TcpStream, auth: &AuthConfig) -> bool {
        // A failed query means the connection was not redirected here; let
        // dispatch continue with the other candidates
        let original = match get_original_destination_addr(socket) {
            Ok(addr) => addr,
            Err(..) => return false,
        };
        let local = match socket.local_addr() {
            Ok(addr) => addr,
            Err(..) => return false,
        };
        if original == local {
            return false;
        }

        match (header, auth.first_byte()) {
            // Claimable from metadata alone only without a credential
            (None, None) => true,
            (Some(..), None) => true,
            (Some(b), Some(key0)) => b == key0,
            (None, Some(..)) => false,
        }
    }

    async fn parse(
        &self,
        header: Option<u8>,
        stream: &mut ClientStream,
        ctx: &mut ConnContext,
    ) -> io::Result<Handshake> {
        let payload = if ctx.auth.needs_auth() {
            check_shared_key(stream, ctx).await?;
            bytes::Bytes::new()
        } else {
            // A byte consumed during dispatch is client payload, not ours
            match header {
                Some(b) => bytes::Bytes::copy_from_slice(&[b]),
                None => bytes::Bytes::new(),
            }
        };

        let original = get_original_destination_addr(stream.get_ref())?;
        debug!("redir {} -> {} original destination", ctx.peer_addr, original);

        let mut handshake = Handshake::to(Address::SocketAddress(original));
        handshake.payload = payload;
        Ok(handshake)
    }

    async fn connect(
        &self,
        _upstream: &mut ClientStream,
        _auth: &AuthConfig,
        _addr: &Address,
    ) -> io::Result<Option<super::shadow::OtaSigner>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "transparent redirect cannot frame an outbound handshake",
        ))
    }
}
