//! In-memory view of the addresses configured on each network interface.
//!
//! The table is fed by the netlink source and read by the responder. An
//! interface entry exists only while it has at least one address; the
//! transitions into and out of that state fire enabled/disabled events so
//! the responder can keep its multicast group memberships in step.

use std::collections::{BTreeSet, HashMap};
use std::ffi::CStr;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};

/// Address family of the mutation that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
    Unspecified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Enabled,
    Disabled,
}

/// An interface gaining its first address or losing its last one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceEvent {
    pub kind: EventKind,
    pub index: u32,
    pub family: AddressFamily,
}

/// Sink for interface events.
///
/// Callbacks run on the mutating thread while the table lock is held, in
/// mutation order, so membership changes cannot race with later mutations
/// for the same interface. They must not call back into the table.
pub trait InterfaceListener: Send + Sync {
    fn interface_enabled(&self, event: &InterfaceEvent);
    fn interface_disabled(&self, event: &InterfaceEvent);
}

#[derive(Debug, Default)]
struct Interface {
    in_addrs: BTreeSet<Ipv4Addr>,
    in6_addrs: BTreeSet<Ipv6Addr>,
}

impl Interface {
    fn is_empty(&self) -> bool {
        self.in_addrs.is_empty() && self.in6_addrs.is_empty()
    }
}

#[derive(Default)]
struct State {
    interfaces: HashMap<u32, Interface>,
    listeners: Vec<Arc<dyn InterfaceListener>>,
}

/// Map from interface indices to their configured addresses.
#[derive(Default)]
pub struct InterfaceTable {
    state: Mutex<State>,
}

impl InterfaceTable {
    pub fn new() -> InterfaceTable {
        InterfaceTable::default()
    }

    /// Record an address for an interface, as reported by the kernel.
    ///
    /// `family` and `addr` are raw netlink values; short or unknown-family
    /// input is logged and ignored. Fires an enabled event when this is the
    /// interface's first address.
    pub fn add_address(&self, index: u32, family: u8, addr: &[u8]) {
        let (ip, event_family) = match decode_address(index, family, addr) {
            Some(decoded) => decoded,
            None => return,
        };

        let mut state = self.state.lock().unwrap();
        let was_empty = {
            let interface = state.interfaces.entry(index).or_default();
            let was_empty = interface.is_empty();
            let inserted = match ip {
                IpAddr::V4(v4) => interface.in_addrs.insert(v4),
                IpAddr::V6(v6) => interface.in6_addrs.insert(v6),
            };
            if inserted {
                log::debug!("added {} on {}", ip, interface_name(index));
            }
            was_empty
        };

        if was_empty {
            dispatch(
                &state,
                InterfaceEvent {
                    kind: EventKind::Enabled,
                    index,
                    family: event_family,
                },
            );
        }
    }

    /// Erase an address; fires a disabled event and drops the entry when
    /// the interface loses its last address.
    pub fn remove_address(&self, index: u32, family: u8, addr: &[u8]) {
        let (ip, event_family) = match decode_address(index, family, addr) {
            Some(decoded) => decoded,
            None => return,
        };

        let mut state = self.state.lock().unwrap();
        let now_empty = {
            let interface = match state.interfaces.get_mut(&index) {
                Some(interface) => interface,
                None => return,
            };
            let removed = match ip {
                IpAddr::V4(v4) => interface.in_addrs.remove(&v4),
                IpAddr::V6(v6) => interface.in6_addrs.remove(&v6),
            };
            if removed {
                log::debug!("removed {} on {}", ip, interface_name(index));
            }
            removed && interface.is_empty()
        };

        if now_empty {
            state.interfaces.remove(&index);
            dispatch(
                &state,
                InterfaceEvent {
                    kind: EventKind::Disabled,
                    index,
                    family: event_family,
                },
            );
        }
    }

    /// A copy of the IPv4 addresses of an interface, empty if it has none.
    pub fn in_addresses(&self, index: u32) -> BTreeSet<Ipv4Addr> {
        let state = self.state.lock().unwrap();
        state
            .interfaces
            .get(&index)
            .map(|interface| interface.in_addrs.clone())
            .unwrap_or_default()
    }

    /// A copy of the IPv6 addresses of an interface, empty if it has none.
    pub fn in6_addresses(&self, index: u32) -> BTreeSet<Ipv6Addr> {
        let state = self.state.lock().unwrap();
        state
            .interfaces
            .get(&index)
            .map(|interface| interface.in6_addrs.clone())
            .unwrap_or_default()
    }

    pub fn add_listener(&self, listener: Arc<dyn InterfaceListener>) {
        let mut state = self.state.lock().unwrap();
        state.listeners.push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn InterfaceListener>) {
        let mut state = self.state.lock().unwrap();
        state.listeners.retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Drop every interface, firing a disabled event for each.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        let mut indices: Vec<u32> = state.interfaces.keys().copied().collect();
        indices.sort_unstable();
        state.interfaces.clear();
        for index in indices {
            dispatch(
                &state,
                InterfaceEvent {
                    kind: EventKind::Disabled,
                    index,
                    family: AddressFamily::Unspecified,
                },
            );
        }
    }
}

fn dispatch(state: &State, event: InterfaceEvent) {
    for listener in &state.listeners {
        match event.kind {
            EventKind::Enabled => listener.interface_enabled(&event),
            EventKind::Disabled => listener.interface_disabled(&event),
        }
    }
}

fn decode_address(index: u32, family: u8, addr: &[u8]) -> Option<(IpAddr, AddressFamily)> {
    match family as libc::c_int {
        libc::AF_INET => {
            if addr.len() < 4 {
                log::info!(
                    "ignored a short IPv4 address on {} (size = {})",
                    interface_name(index),
                    addr.len()
                );
                return None;
            }
            let octets: [u8; 4] = addr[..4].try_into().ok()?;
            Some((IpAddr::V4(Ipv4Addr::from(octets)), AddressFamily::V4))
        }
        libc::AF_INET6 => {
            if addr.len() < 16 {
                log::info!(
                    "ignored a short IPv6 address on {} (size = {})",
                    interface_name(index),
                    addr.len()
                );
                return None;
            }
            let octets: [u8; 16] = addr[..16].try_into().ok()?;
            Some((IpAddr::V6(Ipv6Addr::from(octets)), AddressFamily::V6))
        }
        other => {
            log::info!(
                "ignored an address of unknown family {} on {}",
                other,
                interface_name(index)
            );
            None
        }
    }
}

/// Resolve an interface index to its name for log output.
pub fn interface_name(index: u32) -> String {
    let mut buf = [0u8; libc::IF_NAMESIZE];
    // SAFETY: buf is IF_NAMESIZE bytes and if_indextoname writes at most
    // that much, including the NUL terminator.
    let ret = unsafe { libc::if_indextoname(index, buf.as_mut_ptr() as *mut libc::c_char) };
    if ret.is_null() {
        return format!("#{}", index);
    }
    // SAFETY: ret is non-null, so buf holds a NUL-terminated string.
    unsafe { CStr::from_ptr(buf.as_ptr() as *const libc::c_char) }
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const AF_INET: u8 = libc::AF_INET as u8;
    const AF_INET6: u8 = libc::AF_INET6 as u8;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<InterfaceEvent>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<InterfaceEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl InterfaceListener for Recorder {
        fn interface_enabled(&self, event: &InterfaceEvent) {
            self.events.lock().unwrap().push(*event);
        }

        fn interface_disabled(&self, event: &InterfaceEvent) {
            self.events.lock().unwrap().push(*event);
        }
    }

    const V4_A: [u8; 4] = [192, 0, 2, 7];
    const V4_B: [u8; 4] = [192, 0, 2, 8];
    const V6_A: [u8; 16] = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 7];

    #[test]
    fn adds_and_removes_balance_out() {
        let table = InterfaceTable::new();

        table.add_address(2, AF_INET, &V4_A);
        table.add_address(2, AF_INET, &V4_B);
        table.add_address(2, AF_INET6, &V6_A);
        table.remove_address(2, AF_INET, &V4_A);

        assert_eq!(
            table.in_addresses(2),
            BTreeSet::from([Ipv4Addr::from(V4_B)])
        );
        assert_eq!(
            table.in6_addresses(2),
            BTreeSet::from([Ipv6Addr::from(V6_A)])
        );

        table.remove_address(2, AF_INET, &V4_B);
        table.remove_address(2, AF_INET6, &V6_A);
        assert!(table.in_addresses(2).is_empty());
        assert!(table.in6_addresses(2).is_empty());
    }

    #[test]
    fn duplicate_insertions_are_a_no_op() {
        let table = InterfaceTable::new();
        let recorder = Arc::new(Recorder::default());
        table.add_listener(recorder.clone());

        table.add_address(3, AF_INET, &V4_A);
        table.add_address(3, AF_INET, &V4_A);

        assert_eq!(table.in_addresses(3).len(), 1);
        assert_eq!(recorder.events().len(), 1);
    }

    #[test]
    fn events_fire_only_on_empty_transitions() {
        let table = InterfaceTable::new();
        let recorder = Arc::new(Recorder::default());
        table.add_listener(recorder.clone());

        table.add_address(2, AF_INET, &V4_A);
        table.add_address(2, AF_INET, &V4_B);
        table.add_address(2, AF_INET6, &V6_A);
        table.remove_address(2, AF_INET, &V4_B);
        table.remove_address(2, AF_INET, &V4_A);
        table.remove_address(2, AF_INET6, &V6_A);
        table.add_address(2, AF_INET, &V4_A);

        let events = recorder.events();
        assert_eq!(
            events,
            vec![
                InterfaceEvent {
                    kind: EventKind::Enabled,
                    index: 2,
                    family: AddressFamily::V4,
                },
                InterfaceEvent {
                    kind: EventKind::Disabled,
                    index: 2,
                    family: AddressFamily::V6,
                },
                InterfaceEvent {
                    kind: EventKind::Enabled,
                    index: 2,
                    family: AddressFamily::V4,
                },
            ]
        );
    }

    #[test]
    fn removing_an_unknown_address_fires_nothing() {
        let table = InterfaceTable::new();
        let recorder = Arc::new(Recorder::default());
        table.add_listener(recorder.clone());

        table.remove_address(2, AF_INET, &V4_A);
        table.add_address(2, AF_INET, &V4_A);
        table.remove_address(2, AF_INET, &V4_B);

        assert_eq!(recorder.events().len(), 1);
        assert_eq!(table.in_addresses(2).len(), 1);
    }

    #[test]
    fn short_and_unknown_family_input_is_ignored() {
        let table = InterfaceTable::new();

        table.add_address(2, AF_INET, &[192, 0, 2]);
        table.add_address(2, AF_INET6, &V6_A[..15]);
        table.add_address(2, libc::AF_PACKET as u8, &[0; 6]);

        assert!(table.in_addresses(2).is_empty());
        assert!(table.in6_addresses(2).is_empty());
    }

    #[test]
    fn reads_return_copies() {
        let table = InterfaceTable::new();
        table.add_address(2, AF_INET, &V4_A);

        let snapshot = table.in_addresses(2);
        table.add_address(2, AF_INET, &V4_B);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(table.in_addresses(2).len(), 2);
    }

    #[test]
    fn address_iteration_order_is_deterministic() {
        let table = InterfaceTable::new();
        table.add_address(2, AF_INET, &V4_B);
        table.add_address(2, AF_INET, &V4_A);

        let addrs: Vec<Ipv4Addr> = table.in_addresses(2).into_iter().collect();
        assert_eq!(addrs, vec![Ipv4Addr::from(V4_A), Ipv4Addr::from(V4_B)]);
    }

    #[test]
    fn removed_listeners_stop_receiving_events() {
        let table = InterfaceTable::new();
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn InterfaceListener> = recorder.clone();
        table.add_listener(listener.clone());

        table.add_address(2, AF_INET, &V4_A);
        table.remove_listener(&listener);
        table.remove_address(2, AF_INET, &V4_A);

        assert_eq!(recorder.events().len(), 1);
    }

    #[test]
    fn clear_fires_disabled_for_every_interface() {
        let table = InterfaceTable::new();
        let recorder = Arc::new(Recorder::default());
        table.add_listener(recorder.clone());

        table.add_address(2, AF_INET, &V4_A);
        table.add_address(5, AF_INET6, &V6_A);
        table.clear();

        let events = recorder.events();
        assert_eq!(events.len(), 4);
        assert_eq!(
            events[2..],
            [
                InterfaceEvent {
                    kind: EventKind::Disabled,
                    index: 2,
                    family: AddressFamily::Unspecified,
                },
                InterfaceEvent {
                    kind: EventKind::Disabled,
                    index: 5,
                    family: AddressFamily::Unspecified,
                },
            ]
        );
        assert!(table.in_addresses(2).is_empty());
        assert!(table.in6_addresses(5).is_empty());
    }
}
