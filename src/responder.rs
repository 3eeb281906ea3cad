//! The LLMNR responder.
//!
//! A single-threaded receive loop that validates queries, matches them
//! against the host's short name, and answers with the addresses of the
//! interface each query arrived on. Interface events drive the socket's
//! multicast group memberships.

use std::io;
use std::net::SocketAddrV6;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::interfaces::{interface_name, InterfaceEvent, InterfaceListener, InterfaceTable};
use crate::socket::LlmnrSocket;
use crate::wire;

pub struct Responder {
    socket: LlmnrSocket,
    table: Arc<InterfaceTable>,
    host_name: Vec<u8>,
    running: AtomicBool,
}

impl Responder {
    /// `host_name` is the host's short name, matched case-insensitively
    /// against incoming single-label queries.
    pub fn new(socket: LlmnrSocket, table: Arc<InterfaceTable>, host_name: Vec<u8>) -> Responder {
        Responder {
            socket,
            table,
            host_name,
            running: AtomicBool::new(true),
        }
    }

    /// Receive and answer queries until [`terminate`](Responder::terminate)
    /// is called.
    ///
    /// Bad datagrams are logged and dropped; only termination ends the
    /// loop.
    pub fn run(&self) {
        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.process_next() {
                log::error!("could not receive a packet: {}", e);
            }
        }
    }

    /// Ask the receive loop to stop.
    ///
    /// Only performs an atomic store, so it is safe to call from a signal
    /// handler. A signal must reach the receiving thread to break the
    /// blocking `recv`.
    pub fn terminate(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn process_next(&self) -> io::Result<()> {
        let pending = match self.socket.peek_len() {
            Ok(len) => len,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        };

        let mut buf = vec![0u8; pending];
        let (received, sender, ifindex) = match self.socket.recv_from(&mut buf) {
            Ok(result) => result,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        };
        buf.truncate(received);

        if let Some(mut response) = respond(&self.table, &self.host_name, &buf, &sender, ifindex) {
            if let Err(e) = self.socket.send_to(&mut response, &sender) {
                log::error!("could not send a response to {}: {}", sender, e);
            }
        }
        Ok(())
    }
}

impl InterfaceListener for Responder {
    fn interface_enabled(&self, event: &InterfaceEvent) {
        if event.index == 0 {
            return;
        }
        let name = interface_name(event.index);
        match self.socket.join_multicast(event.index) {
            Ok(()) => log::info!("joined the IPv6 LLMNR multicast group on {}", name),
            Err(e) => log::error!(
                "could not join the IPv6 LLMNR multicast group on {}: {}",
                name,
                e
            ),
        }
    }

    fn interface_disabled(&self, event: &InterfaceEvent) {
        if event.index == 0 {
            return;
        }
        let name = interface_name(event.index);
        match self.socket.leave_multicast(event.index) {
            Ok(()) => log::info!("left the IPv6 LLMNR multicast group on {}", name),
            Err(e) => log::error!(
                "could not leave the IPv6 LLMNR multicast group on {}: {}",
                name,
                e
            ),
        }
    }
}

/// Validate one datagram and compose the response to it; `None` means the
/// packet is dropped.
fn respond(
    table: &InterfaceTable,
    host_name: &[u8],
    packet: &[u8],
    sender: &SocketAddrV6,
    ifindex: u32,
) -> Option<Vec<u8>> {
    // Responses are unicast, so a multicast source is never legitimate.
    if sender.ip().is_multicast() {
        log::info!("dropped a packet with a multicast source, sent from {}", sender);
        return None;
    }

    let header = match wire::Header::parse(packet) {
        Some(header) => header,
        None => {
            log::info!("dropped a short packet, sent from {}", sender);
            return None;
        }
    };
    if !header.is_valid_query() {
        log::info!("dropped a non-query packet, sent from {}", sender);
        return None;
    }
    // Conflict-flagged queries are not answered.
    if header.flags & wire::FLAG_C != 0 {
        return None;
    }

    let qname_end = match wire::skip_name(packet, wire::HEADER_SIZE) {
        Some(end) if packet.len() - end >= 4 => end,
        _ => {
            log::info!("dropped a packet with an invalid question, sent from {}", sender);
            return None;
        }
    };

    let name = matching_name(host_name, &packet[wire::HEADER_SIZE..qname_end])?;
    Some(compose(table, packet, qname_end, &name, ifindex))
}

/// The encoded owner label, if the query name is a single label equal to
/// the host's short name under ASCII case folding.
fn matching_name(host_name: &[u8], qname: &[u8]) -> Option<Vec<u8>> {
    let length = *qname.first()? as usize;
    if length != host_name.len() || length == 0 {
        return None;
    }
    if qname.len() != length + 2 || qname[1 + length] != 0 {
        return None;
    }
    if !qname[1..1 + length].eq_ignore_ascii_case(host_name) {
        return None;
    }

    let mut name = Vec::with_capacity(length + 2);
    name.push(length as u8);
    name.extend_from_slice(host_name);
    name.push(0);
    Some(name)
}

/// Build the response: the received header and question echoed, QR set,
/// then one RR per address of the arrival interface, IPv4 first.
fn compose(
    table: &InterfaceTable,
    packet: &[u8],
    qname_end: usize,
    name: &[u8],
    ifindex: u32,
) -> Vec<u8> {
    let qtype = wire::get_u16(packet, qname_end);
    let qclass = wire::get_u16(packet, qname_end + 2);

    let mut in_addrs = Default::default();
    let mut in6_addrs = Default::default();
    if qclass == wire::CLASS_IN {
        if qtype == wire::TYPE_A || qtype == wire::QTYPE_ANY {
            in_addrs = table.in_addresses(ifindex);
        }
        if qtype == wire::TYPE_AAAA || qtype == wire::QTYPE_ANY {
            in6_addrs = table.in6_addresses(ifindex);
        }
    }

    let mut buffer = packet[..qname_end + 4].to_vec();
    wire::set_u16(&mut buffer, 2, wire::FLAG_QR);
    wire::set_u16(&mut buffer, 6, 0); // ancount
    wire::set_u16(&mut buffer, 8, 0); // nscount
    wire::set_u16(&mut buffer, 10, 0); // arcount

    let mut ancount = 0;
    for addr in &in_addrs {
        append_owner(&mut buffer, name, ancount);
        wire::put_u16(&mut buffer, wire::TYPE_A);
        wire::put_u16(&mut buffer, wire::CLASS_IN);
        wire::put_u32(&mut buffer, wire::TIME_TO_LIVE);
        wire::put_u16(&mut buffer, 4);
        buffer.extend_from_slice(&addr.octets());
        ancount += 1;
        wire::set_u16(&mut buffer, 6, ancount);
    }
    for addr in &in6_addrs {
        append_owner(&mut buffer, name, ancount);
        wire::put_u16(&mut buffer, wire::TYPE_AAAA);
        wire::put_u16(&mut buffer, wire::CLASS_IN);
        wire::put_u32(&mut buffer, wire::TIME_TO_LIVE);
        wire::put_u16(&mut buffer, 16);
        buffer.extend_from_slice(&addr.octets());
        ancount += 1;
        wire::set_u16(&mut buffer, 6, ancount);
    }

    buffer
}

/// The first answer carries its owner name inline; later answers point
/// back at the question name, which sits right after the header.
fn append_owner(buffer: &mut Vec<u8>, name: &[u8], ancount: u16) {
    if ancount == 0 {
        buffer.extend_from_slice(name);
    } else {
        wire::put_u16(buffer, 0xc000 | wire::HEADER_SIZE as u16);
    }
}
