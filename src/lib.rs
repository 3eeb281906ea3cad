//! An IPv6 LLMNR (RFC 4795) responder for Linux.
//!
//! The crate answers single-label name queries for the host's own short
//! name with the A/AAAA records of the interface each query arrived on.
//! Interface addresses are tracked live over rtnetlink; multicast group
//! membership follows interfaces as they gain and lose addresses.

pub mod error;
pub mod hostname;
pub mod interfaces;
pub mod netlink;
pub mod responder;
pub mod signals;
pub mod socket;
pub mod wire;
