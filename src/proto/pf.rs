//! Transparent proxying for the BSD packet filter
//!
//! An rdr rule sends intercepted connections here; the real destination is
//! recovered with a DIOCNATLOOK ioctl on `/dev/pf`, keyed by the connection
//! 4-tuple. The device is opened once when the handler is built and shared by
//! every connection; access is serialized because concurrent ioctls on one
//! descriptor are not documented as safe.

use std::{
    ffi::CString,
    io, mem,
    net::{SocketAddr, SocketAddrV4, SocketAddrV6},
    ptr,
    sync::Mutex,
};

use async_trait::async_trait;
use log::{debug, trace};
use tokio::net::TcpStream;

use crate::{auth::AuthConfig, relay::Address};

use super::{shadow::check_shared_key, ClientStream, ConnContext, Handshake, Protocol};

mod ffi {
    use cfg_if::cfg_if;
    use nix::ioctl_readwrite;

    #[repr(C)]
    #[derive(Copy, Clone)]
    pub struct pf_addr {
        pub pfa: pf_addr_union,
    }

    #[repr(C)]
    #[derive(Copy, Clone)]
    pub union pf_addr_union {
        pub v4: libc::in_addr,
        pub v6: libc::in6_addr,
        pub addr8: [u8; 16usize],
        pub addr16: [u16; 8usize],
        pub addr32: [u32; 4usize],
    }

    cfg_if! {
        if #[cfg(any(target_os = "macos", target_os = "ios"))] {
            #[repr(C)]
            #[derive(Copy, Clone)]
            pub union pf_state_xport {
                pub port: u16,
                pub call_id: u16,
                pub spi: u32,
            }

            // Apple's XNU layout
            // https://github.com/opensource-apple/xnu/blob/master/bsd/net/pfvar.h
            #[repr(C)]
            #[derive(Copy, Clone)]
            pub struct pfioc_natlook {
                pub saddr: pf_addr,
                pub daddr: pf_addr,
                pub rsaddr: pf_addr,
                pub rdaddr: pf_addr,
                pub sxport: pf_state_xport,
                pub dxport: pf_state_xport,
                pub rsxport: pf_state_xport,
                pub rdxport: pf_state_xport,
                pub af: libc::sa_family_t,
                pub proto: u8,
                pub proto_variant: u8,
                pub direction: u8,
            }

            impl pfioc_natlook {
                pub unsafe fn set_sport(&mut self, port: u16) {
                    self.sxport.port = port;
                }

                pub unsafe fn set_dport(&mut self, port: u16) {
                    self.dxport.port = port;
                }

                pub unsafe fn rdport(&self) -> u16 {
                    self.rdxport.port
                }
            }
        } else {
            // FreeBSD/OpenBSD layout
            // https://github.com/freebsd/freebsd/blob/master/sys/net/pfvar.h
            #[repr(C)]
            #[derive(Copy, Clone)]
            pub struct pfioc_natlook {
                pub saddr: pf_addr,
                pub daddr: pf_addr,
                pub rsaddr: pf_addr,
                pub rdaddr: pf_addr,
                pub sport: u16,
                pub dport: u16,
                pub rsport: u16,
                pub rdport: u16,
                pub af: libc::sa_family_t,
                pub proto: u8,
                pub proto_variant: u8,
                pub direction: u8,
            }

            impl pfioc_natlook {
                pub unsafe fn set_sport(&mut self, port: u16) {
                    self.sport = port;
                }

                pub unsafe fn set_dport(&mut self, port: u16) {
                    self.dport = port;
                }

                pub unsafe fn rdport(&self) -> u16 {
                    self.rdport
                }
            }
        }
    }

    pub const PF_OUT: libc::c_int = 2;

    ioctl_readwrite!(ioc_natlook, 'D', 23, pfioc_natlook);
}

fn sockaddr_to_std(saddr: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    use std::net::{Ipv4Addr, Ipv6Addr};

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

struct PacketFilter {
    fd: libc::c_int,
}

impl PacketFilter {
    fn open() -> io::Result<PacketFilter> {
        unsafe {
            let dev_path = CString::new("/dev/pf").expect("CString::new");

            let fd = libc::open(dev_path.as_ptr(), libc::O_RDONLY);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }

            let ret = libc::fcntl(fd, libc::F_SETFD, libc::fcntl(fd, libc::F_GETFD) | libc::FD_CLOEXEC);
            if ret != 0 {
                let err = io::Error::last_os_error();
                let _ = libc::close(fd);
                return Err(err);
            }

            Ok(PacketFilter { fd })
        }
    }

    fn natlook(&self, bind_addr: &SocketAddr, peer_addr: &SocketAddr) -> io::Result<SocketAddr> {
        trace!("pf natlook peer: {}, bind: {}", peer_addr, bind_addr);

        unsafe {
            let mut pnl: ffi::pfioc_natlook = mem::zeroed();

            match *bind_addr {
                SocketAddr::V4(ref v4) => {
                    pnl.af = libc::AF_INET as libc::sa_family_t;

                    let sockaddr: *const libc::sockaddr_in = v4 as *const SocketAddrV4 as *const _;
                    let addr: *const libc::in_addr = &((*sockaddr).sin_addr) as *const _;
                    let port: libc::in_port_t = (*sockaddr).sin_port;

                    ptr::copy_nonoverlapping(addr, &mut pnl.daddr.pfa.v4, 1);
                    pnl.set_dport(port);
                }
                SocketAddr::V6(ref v6) => {
                    pnl.af = libc::AF_INET6 as libc::sa_family_t;

                    let sockaddr: *const libc::sockaddr_in6 = v6 as *const SocketAddrV6 as *const _;
                    let addr: *const libc::in6_addr = &((*sockaddr).sin6_addr) as *const _;
                    let port: libc::in_port_t = (*sockaddr).sin6_port;

                    ptr::copy_nonoverlapping(addr, &mut pnl.daddr.pfa.v6, 1);
                    pnl.set_dport(port);
                }
            }

            match *peer_addr {
                SocketAddr::V4(ref v4) => {
                    if pnl.af != libc::AF_INET as libc::sa_family_t {
                        return Err(io::Error::new(io::ErrorKind::InvalidInput, "peer addr must be ipv4"));
                    }

                    let sockaddr: *const libc::sockaddr_in = v4 as *const SocketAddrV4 as *const _;
                    let addr: *const libc::in_addr = &((*sockaddr).sin_addr) as *const _;
                    let port: libc::in_port_t = (*sockaddr).sin_port;

                    ptr::copy_nonoverlapping(addr, &mut pnl.saddr.pfa.v4, 1);
                    pnl.set_sport(port);
                }
                SocketAddr::V6(ref v6) => {
                    if pnl.af != libc::AF_INET6 as libc::sa_family_t {
                        return Err(io::Error::new(io::ErrorKind::InvalidInput, "peer addr must be ipv6"));
                    }

                    let sockaddr: *const libc::sockaddr_in6 = v6 as *const SocketAddrV6 as *const _;
                    let addr: *const libc::in6_addr = &((*sockaddr).sin6_addr) as *const _;
                    let port: libc::in_port_t = (*sockaddr).sin6_port;

                    ptr::copy_nonoverlapping(addr, &mut pnl.saddr.pfa.v6, 1);
                    pnl.set_sport(port);
                }
            }

            pnl.proto = libc::IPPROTO_TCP as u8;
            pnl.direction = ffi::PF_OUT as u8;

            if let Err(errno) = ffi::ioc_natlook(self.fd, &mut pnl as *mut _) {
                return Err(io::Error::from_raw_os_error(errno as i32));
            }

            let mut dst_addr: libc::sockaddr_storage = mem::zeroed();

            if pnl.af == libc::AF_INET as libc::sa_family_t {
                let dst_addr: &mut libc::sockaddr_in = &mut *(&mut dst_addr as *mut _ as *mut _);
                dst_addr.sin_family = pnl.af;
                dst_addr.sin_port = pnl.rdport();
                ptr::copy_nonoverlapping(&pnl.rdaddr.pfa.v4, &mut dst_addr.sin_addr, 1);
            } else {
                let dst_addr: &mut libc::sockaddr_in6 = &mut *(&mut dst_addr as *mut _ as *mut _);
                dst_addr.sin6_family = pnl.af;
                dst_addr.sin6_port = pnl.rdport();
                ptr::copy_nonoverlapping(&pnl.rdaddr.pfa.v6, &mut dst_addr.sin6_addr, 1);
            }

            sockaddr_to_std(&dst_addr)
        }
    }
}

impl Drop for PacketFilter {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Transparent pf handler holding the shared `/dev/pf` handle
pub struct Pf {
    device: Mutex<PacketFilter>,
}

impl Pf {
    /// Open `/dev/pf`; usually requires root
    pub fn open() -> io::Result<Pf> {
        let device = PacketFilter::open()?;
        Ok(Pf {
            device: Mutex::new(device),
        })
    }

    fn query(&self, socket: &TcpStream) -> io::Result<SocketAddr> {
        let local = socket.local_addr()?;
        let peer = socket.peer_addr()?;
        let device = self
            .device
            .lock()
            .map_err(|_| io::Error::other("pf device mutex poisoned"))?;
        device.natlook(&local, &peer)
    }
}

#[async_trait]
impl Protocol for Pf {
    fn name(&self) -> &'static str {
        "pf"
    }

    fn correct_header(&self, header: Option<u8>, socket: &TcpStream, auth: &AuthConfig) -> bool {
        // natlook fails for connections pf did not rdr to us; decline and
        // let dispatch continue
        let original = match self.query(socket) {
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
            match header {
                Some(b) => bytes::Bytes::copy_from_slice(&[b]),
                None => bytes::Bytes::new(),
            }
        };

        let original = self.query(stream.get_ref())?;
        debug!("pf {} -> {} original destination", ctx.peer_addr, original);

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
            "transparent pf cannot frame an outbound handshake",
        ))
    }
}
