//! The responder's IPv6 UDP socket.
//!
//! The socket is opened with `IPV6_RECVPKTINFO` so every datagram carries
//! its arrival interface, which is what the responder keys its answers on.

use std::io;
use std::mem;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr;

use crate::bail;
use crate::error::Result;
use crate::wire;

/// The IPv6 LLMNR multicast group, FF02::1:3.
pub const LLMNR_MULTICAST_ADDR: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0x1, 0x3);

/// Longest response sent without truncation (RFC 4795 §2.1).
pub const MAX_UNTRUNCATED: usize = 512;

// Not exported by the libc crate; from linux/in6.h.
const IPV6_DONTFRAG: libc::c_int = 62;

/// Control messages need cmsghdr alignment, which a bare byte array does
/// not guarantee.
#[repr(C, align(8))]
struct CmsgBuf {
    data: [u8; 128],
}

pub struct LlmnrSocket {
    fd: OwnedFd,
}

impl LlmnrSocket {
    /// Open, configure and bind the responder socket.
    ///
    /// `IPV6_RECVPKTINFO` is mandatory; the remaining options are set
    /// best-effort with a warning on failure.
    pub fn open(port: u16) -> Result<LlmnrSocket> {
        // SAFETY: plain socket(2) call; the fd is checked before use and
        // owned below.
        let raw = unsafe {
            libc::socket(
                libc::AF_INET6,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
                libc::IPPROTO_UDP,
            )
        };
        if raw < 0 {
            bail!(
                "could not open an IPv6 UDP socket: {}",
                io::Error::last_os_error()
            );
        }
        // SAFETY: raw is a freshly opened, valid fd that nothing else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let socket = LlmnrSocket { fd };

        if let Err(e) = socket.set_option(libc::IPV6_RECVPKTINFO, 1) {
            bail!("could not set socket option 'IPV6_RECVPKTINFO': {}", e);
        }

        if let Err(e) = socket.set_option(libc::IPV6_V6ONLY, 1) {
            log::warn!("could not set socket option 'IPV6_V6ONLY': {}", e);
        }
        // The unicast hop limit SHOULD be 1 (RFC 4795 §2.5).
        if let Err(e) = socket.set_option(libc::IPV6_UNICAST_HOPS, 1) {
            log::warn!("could not set socket option 'IPV6_UNICAST_HOPS': {}", e);
        }
        if let Err(e) = socket.set_option(IPV6_DONTFRAG, 1) {
            log::warn!("could not set socket option 'IPV6_DONTFRAG': {}", e);
        }

        let addr = to_sockaddr(&SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0));
        // SAFETY: fd is valid and addr is a properly initialized
        // sockaddr_in6 of the size passed.
        let ret = unsafe {
            libc::bind(
                socket.fd.as_raw_fd(),
                &addr as *const libc::sockaddr_in6 as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            bail!(
                "could not bind the UDP socket: {}",
                io::Error::last_os_error()
            );
        }

        Ok(socket)
    }

    /// Size of the next pending datagram.
    pub fn peek_len(&self) -> io::Result<usize> {
        // SAFETY: a null buffer of length zero is valid for a peek.
        let n = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                ptr::null_mut(),
                0,
                libc::MSG_PEEK | libc::MSG_TRUNC,
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    /// Receive one datagram, returning its length, the sender, and the
    /// index of the interface it arrived on.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV6, u32)> {
        let mut sender: libc::sockaddr_in6 = unsafe { mem::zeroed() };
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut control = CmsgBuf { data: [0; 128] };
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_name = &mut sender as *mut libc::sockaddr_in6 as *mut libc::c_void;
        msg.msg_namelen = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.data.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = control.data.len() as _;

        // SAFETY: msg points at live buffers of the advertised sizes.
        let received = unsafe { libc::recvmsg(self.fd.as_raw_fd(), &mut msg, 0) };
        if received < 0 {
            return Err(io::Error::last_os_error());
        }
        if (msg.msg_namelen as usize) < mem::size_of::<libc::sockaddr_in6>() {
            return Err(io::Error::from_raw_os_error(libc::ENOMSG));
        }

        let mut ifindex = 0;
        // SAFETY: msg describes the control buffer filled in by recvmsg;
        // the CMSG_* macros walk it the way the kernel laid it out.
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                let level = (*cmsg).cmsg_level;
                let kind = (*cmsg).cmsg_type;
                let len = (*cmsg).cmsg_len;
                if level == libc::IPPROTO_IPV6
                    && kind == libc::IPV6_PKTINFO
                    && len as usize
                        >= libc::CMSG_LEN(mem::size_of::<libc::in6_pktinfo>() as u32) as usize
                {
                    let info: libc::in6_pktinfo =
                        ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::in6_pktinfo);
                    ifindex = info.ipi6_ifindex;
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        Ok((received as usize, from_sockaddr(&sender), ifindex))
    }

    /// Send a response.
    ///
    /// When the kernel refuses an oversized datagram, resend the first 512
    /// octets with the TC flag set so the peer falls back to TCP.
    pub fn send_to(&self, buf: &mut Vec<u8>, dest: &SocketAddrV6) -> io::Result<()> {
        match self.send_raw(buf, dest) {
            Err(e)
                if e.raw_os_error() == Some(libc::EMSGSIZE) && buf.len() > MAX_UNTRUNCATED =>
            {
                let flags = wire::get_u16(buf, 2);
                wire::set_u16(buf, 2, flags | wire::FLAG_TC);
                self.send_raw(&buf[..MAX_UNTRUNCATED], dest).map(|_| ())
            }
            other => other.map(|_| ()),
        }
    }

    pub fn join_multicast(&self, index: u32) -> io::Result<()> {
        self.membership(index, libc::IPV6_ADD_MEMBERSHIP)
    }

    pub fn leave_multicast(&self, index: u32) -> io::Result<()> {
        self.membership(index, libc::IPV6_DROP_MEMBERSHIP)
    }

    /// Local port the socket is bound to.
    pub fn local_port(&self) -> io::Result<u16> {
        let mut addr: libc::sockaddr_in6 = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
        // SAFETY: addr is a live sockaddr_in6 of the advertised size.
        let ret = unsafe {
            libc::getsockname(
                self.fd.as_raw_fd(),
                &mut addr as *mut libc::sockaddr_in6 as *mut libc::sockaddr,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(u16::from_be(addr.sin6_port))
    }

    fn send_raw(&self, buf: &[u8], dest: &SocketAddrV6) -> io::Result<usize> {
        let addr = to_sockaddr(dest);
        // SAFETY: fd is valid, buf is live for the length passed, and addr
        // is a properly initialized sockaddr_in6.
        let n = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
                &addr as *const libc::sockaddr_in6 as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn membership(&self, index: u32, option: libc::c_int) -> io::Result<()> {
        let mreq = libc::ipv6_mreq {
            ipv6mr_multiaddr: libc::in6_addr {
                s6_addr: LLMNR_MULTICAST_ADDR.octets(),
            },
            ipv6mr_interface: index,
        };
        // SAFETY: fd is valid and mreq is a properly initialized ipv6_mreq
        // of the size passed.
        let ret = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::IPPROTO_IPV6,
                option,
                &mreq as *const libc::ipv6_mreq as *const libc::c_void,
                mem::size_of::<libc::ipv6_mreq>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn set_option(&self, option: libc::c_int, value: libc::c_int) -> io::Result<()> {
        // SAFETY: fd is valid and value is a live c_int of the size passed.
        let ret = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::IPPROTO_IPV6,
                option,
                &value as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

fn to_sockaddr(addr: &SocketAddrV6) -> libc::sockaddr_in6 {
    libc::sockaddr_in6 {
        sin6_family: libc::AF_INET6 as libc::sa_family_t,
        sin6_port: addr.port().to_be(),
        sin6_flowinfo: addr.flowinfo(),
        sin6_addr: libc::in6_addr {
            s6_addr: addr.ip().octets(),
        },
        sin6_scope_id: addr.scope_id(),
    }
}

fn from_sockaddr(addr: &libc::sockaddr_in6) -> SocketAddrV6 {
    SocketAddrV6::new(
        Ipv6Addr::from(addr.sin6_addr.s6_addr),
        u16::from_be(addr.sin6_port),
        addr.sin6_flowinfo,
        addr.sin6_scope_id,
    )
}

#[cfg(test)]
mod tests {
    use std::net::UdpSocket;

    use super::*;

    #[test]
    fn sockaddr_conversion_roundtrip() {
        let addr = SocketAddrV6::new(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1), 5355, 0, 2);
        assert_eq!(from_sockaddr(&to_sockaddr(&addr)), addr);
    }

    #[test]
    fn open_binds_an_ephemeral_port() {
        let socket = LlmnrSocket::open(0).unwrap();
        assert_ne!(socket.local_port().unwrap(), 0);
    }

    #[test]
    fn recv_reports_sender_and_interface() {
        let socket = LlmnrSocket::open(0).unwrap();
        let port = socket.local_port().unwrap();

        let peer = UdpSocket::bind("[::1]:0").unwrap();
        peer.send_to(b"hello", format!("[::1]:{}", port)).unwrap();

        assert_eq!(socket.peek_len().unwrap(), 5);
        let mut buf = [0u8; 16];
        let (len, sender, ifindex) = socket.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(*sender.ip(), Ipv6Addr::LOCALHOST);
        assert_eq!(sender.port(), peer.local_addr().unwrap().port());
        assert_ne!(ifindex, 0);
    }

    #[test]
    fn small_sends_are_not_truncated() {
        let socket = LlmnrSocket::open(0).unwrap();
        let peer = UdpSocket::bind("[::1]:0").unwrap();
        let dest = SocketAddrV6::new(
            Ipv6Addr::LOCALHOST,
            peer.local_addr().unwrap().port(),
            0,
            0,
        );

        let mut buf = vec![0u8; 511];
        socket.send_to(&mut buf, &dest).unwrap();

        assert_eq!(wire::get_u16(&buf, 2) & wire::FLAG_TC, 0);
        let mut received = [0u8; 1024];
        let (len, _) = peer.recv_from(&mut received).unwrap();
        assert_eq!(len, 511);
    }

    #[test]
    fn oversized_sends_are_retried_truncated() {
        let socket = LlmnrSocket::open(0).unwrap();
        let peer = UdpSocket::bind("[::1]:0").unwrap();
        let dest = SocketAddrV6::new(
            Ipv6Addr::LOCALHOST,
            peer.local_addr().unwrap().port(),
            0,
            0,
        );

        // larger than any UDP datagram, so the first sendto gets EMSGSIZE
        let mut buf = vec![0u8; 70000];
        socket.send_to(&mut buf, &dest).unwrap();

        assert_eq!(wire::get_u16(&buf, 2) & wire::FLAG_TC, wire::FLAG_TC);
        let mut received = [0u8; 1024];
        let (len, _) = peer.recv_from(&mut received).unwrap();
        assert_eq!(len, MAX_UNTRUNCATED);
    }

    #[test]
    fn loopback_multicast_membership() {
        let socket = LlmnrSocket::open(0).unwrap();
        let lo = unsafe { libc::if_nametoindex(b"lo\0".as_ptr() as *const libc::c_char) };
        if lo == 0 {
            return; // no loopback interface to test against
        }
        socket.join_multicast(lo).unwrap();
        socket.leave_multicast(lo).unwrap();
    }
}
