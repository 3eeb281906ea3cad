//! rtnetlink message layout.
//!
//! The structs mirror the kernel's `struct nlmsghdr`, `struct ifaddrmsg`
//! and `struct rtattr` so that receive buffers can be walked in place.
//! See: https://man7.org/linux/man-pages/man7/rtnetlink.7.html

use std::mem;

// Message types
pub const NLMSG_NOOP: u16 = 1;
pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;
pub const RTM_NEWADDR: u16 = 20;
pub const RTM_DELADDR: u16 = 21;
pub const RTM_GETADDR: u16 = 22;

// Message flags
pub const NLM_F_REQUEST: u16 = 0x01;
pub const NLM_F_MULTI: u16 = 0x02;
pub const NLM_F_ROOT: u16 = 0x100;

// Multicast groups for address notifications
pub const RTMGRP_IPV4_IFADDR: u32 = 0x10;
pub const RTMGRP_IPV6_IFADDR: u32 = 0x100;

// Address attribute carrying the address octets
pub const IFA_ADDRESS: u16 = 1;

const NLMSG_ALIGNTO: usize = 4;

/// Netlink message header.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct NlMsgHdr {
    pub nlmsg_len: u32,
    pub nlmsg_type: u16,
    pub nlmsg_flags: u16,
    pub nlmsg_seq: u32,
    pub nlmsg_pid: u32,
}

/// Interface address message header.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct IfAddrMsg {
    pub ifa_family: u8,
    pub ifa_prefixlen: u8,
    pub ifa_flags: u8,
    pub ifa_scope: u8,
    pub ifa_index: u32,
}

/// Attribute header.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct RtAttr {
    pub rta_len: u16,
    pub rta_type: u16,
}

/// Round up to the netlink alignment boundary.
pub fn nlmsg_align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

/// Read a message header, if the buffer still holds one at `offset`.
pub fn read_header(buf: &[u8], offset: usize) -> Option<NlMsgHdr> {
    if offset + mem::size_of::<NlMsgHdr>() > buf.len() {
        return None;
    }
    // SAFETY: the bounds check above guarantees a full header is available;
    // read_unaligned copes with the buffer's arbitrary alignment.
    Some(unsafe { std::ptr::read_unaligned(buf[offset..].as_ptr() as *const NlMsgHdr) })
}

/// Read the `ifaddrmsg` at the front of a message payload.
pub fn read_ifaddrmsg(payload: &[u8]) -> Option<IfAddrMsg> {
    if payload.len() < mem::size_of::<IfAddrMsg>() {
        return None;
    }
    // SAFETY: bounds checked above.
    Some(unsafe { std::ptr::read_unaligned(payload.as_ptr() as *const IfAddrMsg) })
}

/// Iterator over the attributes trailing an `ifaddrmsg`.
pub struct AttrIter<'a> {
    data: &'a [u8],
    offset: usize,
}

/// Walk attributes, yielding `(rta_type, payload)` pairs.
pub fn attrs(data: &[u8]) -> AttrIter<'_> {
    AttrIter { data, offset: 0 }
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let header_size = mem::size_of::<RtAttr>();
        if self.offset + header_size > self.data.len() {
            return None;
        }
        // SAFETY: bounds checked above.
        let attr: RtAttr = unsafe {
            std::ptr::read_unaligned(self.data[self.offset..].as_ptr() as *const RtAttr)
        };
        if (attr.rta_len as usize) < header_size {
            return None;
        }
        let end = self.offset + attr.rta_len as usize;
        if end > self.data.len() {
            return None;
        }
        let payload = &self.data[self.offset + header_size..end];
        self.offset = nlmsg_align(end);
        Some((attr.rta_type, payload))
    }
}

/// Serialize an RTM_GETADDR dump request for one address family.
///
/// Netlink uses host byte order on the wire.
pub fn getaddr_request(family: u8) -> Vec<u8> {
    let len = mem::size_of::<NlMsgHdr>() + nlmsg_align(mem::size_of::<IfAddrMsg>());
    let mut buf = Vec::with_capacity(len);
    buf.extend_from_slice(&(len as u32).to_ne_bytes());
    buf.extend_from_slice(&RTM_GETADDR.to_ne_bytes());
    buf.extend_from_slice(&(NLM_F_REQUEST | NLM_F_ROOT).to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_seq
    buf.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_pid
    buf.push(family);
    buf.extend_from_slice(&[0; 3]); // prefixlen, flags, scope
    buf.extend_from_slice(&0u32.to_ne_bytes()); // ifa_index
    buf
}
