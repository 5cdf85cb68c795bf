//! Default timing constants and an async timeout wrapper.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;

/// Inactivity window after which a connection is force-closed
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between keep-alive frames on an idle connection
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Grace period `close()` gives outstanding certified messages
pub const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Default wait for remote invocations and proxy lookups
pub const REMOTE_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval a background driver sleeps between updates
pub const UPDATE_INTERVAL: Duration = Duration::from_millis(10);

/// Run a future with a deadline, mapping expiry to `ProtocolError::Timeout`.
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}
