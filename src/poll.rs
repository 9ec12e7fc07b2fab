//! Readiness gating: probe a condition at a fixed interval until it holds
//! or the attempt budget runs out.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::{LabError, LabResult};

/// Fixed-interval, bounded-attempt poller.
#[derive(Debug, Clone, Copy)]
pub struct Poller {
    pub interval: Duration,
    pub attempts: u32,
}

impl Poller {
    pub fn new(interval: Duration, attempts: u32) -> Self {
        Self { interval, attempts }
    }

    /// Run `probe` until it yields a value.
    ///
    /// `Ok(None)` means "not yet". An `Err` from the probe ends polling at once.
    /// There is no sleep after the last attempt.
    pub async fn until<T, F, Fut>(&self, what: &str, mut probe: F) -> LabResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LabResult<Option<T>>>,
    {
        let attempts = self.attempts.max(1);

        for attempt in 1..=attempts {
            if let Some(value) = probe().await? {
                debug!("{} ready after {} attempt(s)", what, attempt);
                return Ok(value);
            }

            if attempt < attempts {
                debug!(
                    "{} not ready (attempt {}/{}), retrying in {:?}",
                    what, attempt, attempts, self.interval
                );
                tokio::time::sleep(self.interval).await;
            }
        }

        Err(LabError::Timeout {
            what: what.to_string(),
            attempts,
            interval: self.interval,
        })
    }
}

/// Single connect attempt. Refused, unreachable and timed out all count as closed.
pub async fn port_open(addr: SocketAddr, connect_timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Poll until `addr` accepts TCP connections.
pub async fn wait_for_port(
    poller: &Poller,
    what: &str,
    addr: SocketAddr,
    connect_timeout: Duration,
) -> LabResult<()> {
    poller
        .until(what, move || async move {
            Ok(port_open(addr, connect_timeout).await.then_some(()))
        })
        .await?;
    info!("{} is accepting connections on {}", what, addr);
    Ok(())
}
