//! Bounded polling.
//!
//! Expected-failure conditions (a node that has not finished starting yet)
//! are polled with an explicit attempt budget instead of catch-and-continue
//! control flow. The last error is returned when the budget runs out.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::errors::HttpError;
use crate::Error;
use crate::Result;

/// Poll `condition` up to `attempts` times, sleeping `interval` between
/// tries, until it returns `Ok`.
pub async fn wait_until<T, F, Fut>(
    attempts: usize,
    interval: Duration,
    what: &str,
    mut condition: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;
    for attempt in 1..=attempts {
        match condition().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                debug!("wait_until {what}: attempt {attempt}/{attempts} failed: {e}");
                last_error = Some(e);
            }
        }
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    Err(last_error.unwrap_or(Error::Http(HttpError::RetriesExhausted {
        condition: what.to_owned(),
        attempts,
    })))
}
