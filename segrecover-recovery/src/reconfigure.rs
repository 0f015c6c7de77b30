//! Cluster reconfiguration
//!
//! After primaries are stopped, the coordinator has to notice and promote
//! their mirrors. A distributed probe query touches every segment and only
//! succeeds once the cluster view is consistent again, so it is retried
//! until it succeeds or the wall-clock budget runs out.
//!
//! The two ways of running out of time are kept distinct: never getting a
//! connection points at promotion, a probe that hangs points at FTS.

use segrecover_catalog::{DbConnector, DbUrl};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, instrument, warn};

/// Query touching every segment through the dispatcher
pub const PROBE_QUERY: &str = "SELECT * FROM gp_dist_random('gp_id')";

/// Asks the coordinator to run an FTS probe scan now
pub const FTS_PROBE_SCAN: &str = "SELECT gp_request_fts_probe_scan()";

/// Reconfiguration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconfigureError {
    #[error("Mirror promotion did not complete in {secs} seconds.")]
    PromotionTimeout { secs: u64 },

    #[error("FTS probing did not complete in {secs} seconds.")]
    FtsProbeTimeout { secs: u64 },
}

pub type Result<T> = std::result::Result<T, ReconfigureError>;

/// Drives the probe loop against the coordinator
pub struct SegmentReconfigurer {
    connector: Arc<dyn DbConnector>,
    url: DbUrl,
    timeout: Duration,
}

impl SegmentReconfigurer {
    pub fn new(connector: Arc<dyn DbConnector>, url: DbUrl, timeout: Duration) -> Self {
        Self {
            connector,
            url,
            timeout,
        }
    }

    /// Retry connect + probe until it succeeds or the budget is spent
    #[instrument(skip(self), fields(coordinator = %self.url, timeout_secs = self.timeout.as_secs()))]
    pub async fn reconfigure(&self) -> Result<()> {
        // reported in whole seconds, rounded up so a partial second never reads as 0
        let secs = self.timeout.as_secs() + u64::from(self.timeout.subsec_nanos() > 0);
        let deadline = Instant::now() + self.timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(attempts, "Gave up waiting for mirror promotion");
                return Err(ReconfigureError::PromotionTimeout { secs });
            }

            let mut conn = match timeout(remaining, self.connector.connect(&self.url)).await {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => {
                    debug!(attempts, error = %e, "Coordinator not accepting connections yet");
                    tokio::task::yield_now().await;
                    continue;
                }
                Err(_) => return Err(ReconfigureError::PromotionTimeout { secs }),
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            let probe = timeout(remaining, conn.query_rows(PROBE_QUERY)).await;
            match probe {
                Ok(Ok(_)) => {
                    if let Err(e) = conn.close().await {
                        warn!(error = %e, "Failed to close probe connection");
                    }
                    info!(attempts, "Cluster reconfigured");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    debug!(attempts, error = %e, "Probe failed, retrying");
                    if let Err(e) = conn.close().await {
                        debug!(error = %e, "Failed to close probe connection");
                    }
                    tokio::task::yield_now().await;
                }
                Err(_) => {
                    if let Err(e) = conn.close().await {
                        debug!(error = %e, "Failed to close probe connection");
                    }
                    return Err(ReconfigureError::FtsProbeTimeout { secs });
                }
            }
        }
    }
}
