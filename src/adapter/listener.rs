//! Loopback listener with port probing

use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::TcpListener;
use tracing::debug;

use super::AdapterError;
use crate::config::PORT_PROBE_ATTEMPTS;
use crate::observer::{Event, Observer};

/// Bind `127.0.0.1`, starting at `preferred` and probing higher ports
///
/// Every failed attempt is reported. Gives up after the preferred port and
/// [`PORT_PROBE_ATTEMPTS`] further ports have been tried.
pub async fn bind_loopback(
    preferred: u16,
    observer: &dyn Observer,
) -> Result<(TcpListener, u16), AdapterError> {
    let mut port = preferred;
    for _ in 0..=PORT_PROBE_ATTEMPTS {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                let bound = listener.local_addr()?.port();
                debug!("[adapter] bound {}", addr);
                return Ok((listener, bound));
            }
            Err(e) => observer.report(&Event::BindFailed {
                port,
                error: e.to_string(),
            }),
        }

        port = match port.checked_add(1) {
            Some(next) => next,
            None => break,
        };
    }

    Err(AdapterError::NoPortAvailable {
        first: preferred,
        last: port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::MemoryObserver;

    #[tokio::test]
    async fn test_skips_taken_port() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken_port = taken.local_addr().unwrap().port();
        let observer = MemoryObserver::new();

        match bind_loopback(taken_port, &observer).await {
            Ok((_listener, port)) => {
                assert!(port > taken_port);
                assert!(port as u32 <= taken_port as u32 + PORT_PROBE_ATTEMPTS as u32);
                assert!(observer.lines()[0].contains(&taken_port.to_string()));
            }
            // Every probed port may be taken on a busy machine.
            Err(AdapterError::NoPortAvailable { .. }) => {
                assert_eq!(observer.lines().len(), PORT_PROBE_ATTEMPTS as usize + 1);
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    #[tokio::test]
    async fn test_top_of_range_does_not_overflow() {
        let observer = MemoryObserver::new();
        // Either u16::MAX is free or probing stops without wrapping to 0.
        match bind_loopback(u16::MAX, &observer).await {
            Ok((_listener, port)) => assert_eq!(port, u16::MAX),
            Err(AdapterError::NoPortAvailable { first, .. }) => {
                assert_eq!(first, u16::MAX);
                assert_eq!(observer.lines().len(), 1);
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
}
