use crate::error::{Error, Result};
use crate::template::PortRange;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::net::TcpListener;

/// Whether `port` can be bound right now.
///
/// Checks both 127.0.0.1 and 0.0.0.0: on some platforms a loopback bind
/// succeeds even though another process listens on all interfaces.
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok() && TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// Picks free host ports from a template's range.
///
/// Ports handed out are held in `reserved` until the caller has persisted them,
/// so two concurrent creates never receive the same port.
pub struct PortAllocator {
    reserved: Mutex<HashSet<u16>>,
    probe: fn(u16) -> bool,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::with_probe(is_port_available)
    }

    /// Allocator with a custom availability probe instead of a bind check.
    pub fn with_probe(probe: fn(u16) -> bool) -> Self {
        Self {
            reserved: Mutex::new(HashSet::new()),
            probe,
        }
    }

    /// Allocate `1 + range.extra` distinct ports from `range`.
    ///
    /// Skips ports in `excluded` (attached to containers or held by other
    /// services), ports already reserved, and ports that fail the probe. The
    /// scan starts at a random offset and wraps once around the range.
    pub fn allocate(&self, range: &PortRange, excluded: &HashSet<u16>) -> Result<Vec<u16>> {
        if range.start == 0 || range.end < range.start {
            return Err(Error::PortAllocation(format!(
                "invalid port range {}-{}",
                range.start, range.end
            )));
        }
        let wanted = 1 + range.extra as usize;
        let span = (range.end - range.start) as u32 + 1;
        let offset = rand::thread_rng().gen_range(0..span);

        let mut reserved = self.reserved.lock();
        let mut picked = Vec::with_capacity(wanted);
        for i in 0..span {
            let port = range.start + ((offset + i) % span) as u16;
            if excluded.contains(&port) || reserved.contains(&port) {
                continue;
            }
            if !(self.probe)(port) {
                tracing::trace!("port {} failed bind probe", port);
                continue;
            }
            picked.push(port);
            if picked.len() == wanted {
                reserved.extend(picked.iter().copied());
                tracing::debug!("allocated ports {:?} from {}-{}", picked, range.start, range.end);
                return Ok(picked);
            }
        }

        Err(Error::PortAllocation(format!(
            "no {} free port(s) left in range {}-{}",
            wanted, range.start, range.end
        )))
    }

    /// Drop reservations once the ports are persisted (or the create failed).
    pub fn release(&self, ports: &[u16]) {
        let mut reserved = self.reserved.lock();
        for port in ports {
            reserved.remove(port);
        }
    }

    pub fn reserved(&self) -> Vec<u16> {
        self.reserved.lock().iter().copied().collect()
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}
