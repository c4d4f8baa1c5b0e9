//! Utilities for testing code that runs on top of a [crate::peer::Peer]. They are used for the
//!  crate's own tests, and they are part of the regular (non-#[cfg(test)]) code so that
//!  applications can use them as well.

pub mod loopback;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// convenience for test code: a distinct loopback address per number
pub fn test_addr_from_number(number: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, number))
}
