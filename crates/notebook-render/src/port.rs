//! Free-port selection for the render tool.
//!
//! Candidates are drawn uniformly from a fixed range and probed with a TCP
//! connect to localhost. A refused connection means nobody is listening, so
//! the port is handed out. Nothing is reserved: another process can still bind
//! the port before the render tool does, which surfaces as a failed run that
//! the caller may retry.

use std::net::Ipv4Addr;
use std::time::Duration;

use log::{debug, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

use crate::error::{RenderError, Result};

/// Default candidate range.
pub const DEFAULT_PORT_RANGE: PortRange = PortRange {
    start: 7000,
    end: 7999,
};

/// Default cap on probe attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 256;

/// Inclusive range of candidate ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

impl Default for PortRange {
    fn default() -> Self {
        DEFAULT_PORT_RANGE
    }
}

/// Picks an unused local TCP port.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: PortRange,
    max_attempts: u32,
    probe_timeout: Duration,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_PORT_RANGE, DEFAULT_MAX_ATTEMPTS)
    }
}

impl PortAllocator {
    pub fn new(range: PortRange, max_attempts: u32) -> Self {
        Self {
            range,
            max_attempts: max_attempts.max(1),
            probe_timeout: Duration::from_millis(250),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Return a port in the configured range that nothing answered on.
    pub async fn allocate(&self) -> Result<u16> {
        for attempt in 1..=self.max_attempts {
            let candidate = rand::thread_rng().gen_range(self.range.start..=self.range.end);

            if self.is_occupied(candidate).await {
                debug!(
                    "[port] {} is occupied (attempt {}/{})",
                    candidate, attempt, self.max_attempts
                );
                continue;
            }

            debug!("[port] Allocated {} after {} attempt(s)", candidate, attempt);
            return Ok(candidate);
        }

        warn!(
            "[port] Gave up after {} attempts in {}-{}",
            self.max_attempts, self.range.start, self.range.end
        );
        Err(RenderError::PortUnavailable {
            start: self.range.start,
            end: self.range.end,
            attempts: self.max_attempts,
        })
    }

    async fn is_occupied(&self, port: u16) -> bool {
        match tokio::time::timeout(
            self.probe_timeout,
            TcpStream::connect((Ipv4Addr::LOCALHOST, port)),
        )
        .await
        {
            Ok(Ok(_stream)) => true,
            Ok(Err(_)) => false,
            // A listener with a full backlog can stall the handshake
            Err(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_port_range_normalizes_order() {
        let range = PortRange::new(7100, 7000);
        assert_eq!(range.start, 7000);
        assert_eq!(range.end, 7100);
        assert!(range.contains(7050));
    }

    #[test]
    fn test_default_range() {
        let range = PortRange::default();
        assert!(range.contains(7000));
        assert!(range.contains(7999));
        assert!(!range.contains(8000));
    }

    #[tokio::test]
    async fn test_allocate_single_free_port() {
        // Grab an OS-assigned port, then release it so it is free again
        let port = {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
            listener.local_addr().unwrap().port()
        };

        let allocator = PortAllocator::new(PortRange::new(port, port), 4);
        assert_eq!(allocator.allocate().await.unwrap(), port);
    }

    #[tokio::test]
    async fn test_allocate_skips_occupied_ports() {
        let base = {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
            listener.local_addr().unwrap().port().min(u16::MAX - 8)
        };
        let range = PortRange::new(base, base + 7);

        // Occupy every other port in the range
        let listeners: Vec<TcpListener> = (range.start..=range.end)
            .step_by(2)
            .filter_map(|port| TcpListener::bind((Ipv4Addr::LOCALHOST, port)).ok())
            .collect();
        let occupied: Vec<u16> = listeners
            .iter()
            .map(|l| l.local_addr().unwrap().port())
            .collect();

        let allocator = PortAllocator::new(range, 256);
        for _ in 0..50 {
            let port = allocator.allocate().await.unwrap();
            assert!(range.contains(port));
            assert!(!occupied.contains(&port), "allocated occupied port {}", port);
        }
    }

    #[tokio::test]
    async fn test_allocate_fails_when_range_is_taken() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let allocator = PortAllocator::new(PortRange::new(port, port), 5);
        let err = allocator.allocate().await.unwrap_err();
        assert!(matches!(
            err,
            RenderError::PortUnavailable { attempts: 5, .. }
        ));
    }
}
