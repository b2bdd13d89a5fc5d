//! # Listen port arbitration.
//!
//! [`PortRegistry`] hands out TCP ports from an inclusive range so that no two
//! process workers ever hold the same port.
//!
//! ## Rules
//! - A port is handed out only if it is not reserved here **and** a live bind
//!   probe on `127.0.0.1` succeeds (something outside this registry may own it).
//! - Scanning starts right after the last handed-out port and wraps, so
//!   sequential `reserve()` calls visit `min, min+1, …, max` before reusing a
//!   port that was released in between.
//! - `release()` re-probes the port and refuses while something still listens on it.
//!
//! ## Pre-busy ports
//! Ports passed as `reserved` at construction start out marked reserved and are
//! never handed out. Releasing one succeeds once (if nothing is bound to it) and
//! reports [`PortError::NotReserved`] afterwards.
//!
//! Bookkeeping sits behind its own lock; probing is a synchronous bind, so the
//! supervisor never needs to hold its own lock around it.

use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::Mutex;

use crate::error::PortError;

struct Inner {
    reserved: HashSet<u16>,
    last: u16,
}

/// Thread-safe registry of reserved listen ports.
pub struct PortRegistry {
    min: u16,
    max: u16,
    inner: Mutex<Inner>,
}

impl PortRegistry {
    /// Creates a registry over `[min, max]` with `reserved` ports treated as permanently busy.
    ///
    /// `min` and `max` are swapped if given in the wrong order.
    pub fn new(min: u16, max: u16, reserved: impl IntoIterator<Item = u16>) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Self {
            min,
            max,
            inner: Mutex::new(Inner {
                reserved: reserved.into_iter().collect(),
                last: max,
            }),
        }
    }

    /// Reserves a free port, preferring ports that were never handed out before.
    pub fn reserve(&self) -> Result<u16, PortError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let span = u32::from(self.max - self.min) + 1;
        let mut port = inner.last;
        for _ in 0..span {
            port = if port >= self.max || port < self.min {
                self.min
            } else {
                port + 1
            };

            if inner.reserved.contains(&port) {
                continue;
            }
            if probe(port) {
                inner.reserved.insert(port);
                inner.last = port;
                return Ok(port);
            }
        }

        Err(PortError::NoFreePort)
    }

    /// Releases a previously reserved port.
    ///
    /// Fails with [`PortError::Busy`] (and keeps the reservation) while
    /// something is still bound to the port.
    pub fn release(&self, port: u16) -> Result<(), PortError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if !inner.reserved.contains(&port) {
            return Err(PortError::NotReserved(port));
        }
        if !probe(port) {
            return Err(PortError::Busy(port));
        }

        inner.reserved.remove(&port);
        Ok(())
    }

    /// Returns `true` if the port is currently marked reserved.
    pub fn is_reserved(&self, port: u16) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.reserved.contains(&port)
    }
}

/// Returns `true` if nothing is listening on `port`.
fn probe(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    // 651xx keeps these away from the supervisor integration tests (650xx).

    #[test]
    fn test_reserve_returns_distinct_ports_until_exhausted() {
        let r = PortRegistry::new(65100, 65104, []);
        let mut seen = HashSet::new();
        for _ in 0..5 {
            let p = r.reserve().unwrap();
            assert!((65100..=65104).contains(&p));
            assert!(seen.insert(p), "port {p} handed out twice");
        }
        assert_eq!(r.reserve(), Err(PortError::NoFreePort));
    }

    #[test]
    fn test_reserve_prefers_new_ports() {
        let r = PortRegistry::new(65110, 65112, []);
        assert_eq!(r.reserve(), Ok(65110));
        assert_eq!(r.release(65110), Ok(()));
        assert_eq!(r.reserve(), Ok(65111));
        assert_eq!(r.reserve(), Ok(65112));
        assert_eq!(r.reserve(), Ok(65110));
    }

    #[test]
    fn test_release_not_reserved() {
        let r = PortRegistry::new(65120, 65121, []);
        assert_eq!(r.release(65120), Err(PortError::NotReserved(65120)));

        let p = r.reserve().unwrap();
        assert_eq!(r.release(p), Ok(()));
        assert_eq!(r.release(p), Err(PortError::NotReserved(p)));
    }

    #[test]
    fn test_release_busy_keeps_reservation() {
        let r = PortRegistry::new(65130, 65130, []);
        let p = r.reserve().unwrap();

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, p)).unwrap();
        assert_eq!(r.release(p), Err(PortError::Busy(p)));
        assert!(r.is_reserved(p));
        assert_eq!(r.reserve(), Err(PortError::NoFreePort));

        drop(listener);
        assert_eq!(r.release(p), Ok(()));
        assert_eq!(r.reserve(), Ok(p));
    }

    #[test]
    fn test_externally_bound_port_is_skipped() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 65140)).unwrap();
        let r = PortRegistry::new(65140, 65141, []);
        assert_eq!(r.reserve(), Ok(65141));
        assert_eq!(r.reserve(), Err(PortError::NoFreePort));
        drop(listener);
    }

    #[test]
    fn test_pre_busy_ports_are_never_handed_out() {
        let r = PortRegistry::new(65150, 65152, [65151]);
        assert_eq!(r.reserve(), Ok(65150));
        assert_eq!(r.reserve(), Ok(65152));
        assert_eq!(r.reserve(), Err(PortError::NoFreePort));

        assert_eq!(r.release(65151), Ok(()));
        assert_eq!(r.release(65151), Err(PortError::NotReserved(65151)));
    }
}
