//! spec.md §7 "Transient: network retry, log-busy, lock-conflict retry. The
//! client library retries transparently with exponential backoff." This is
//! the one tier a caller of this crate never has to handle itself --
//! [`crate::cluster::Cluster::call`] already wraps every RPC with
//! [`with_backoff`] before the error reaches `btree`'s generic algorithms.
use std::time::Duration;

use errors::{
    ErrorMetadata,
    Tier,
};
use rand::Rng;

/// Bounds on the exponential backoff applied to `Tier::Transient` errors
/// (`SERVER_DOWN`, a connection reset, ...). `MAX_ATTEMPTS` failures in a
/// row stop being retried and surface to the caller -- a prepare conflict
/// (`Tier::Conflict`) is a distinct code path in `txn`, never retried here.
pub const MAX_ATTEMPTS: u32 = 5;
const BASE_DELAY: Duration = Duration::from_millis(20);
const MAX_DELAY: Duration = Duration::from_secs(2);

/// Runs `op` up to [`MAX_ATTEMPTS`] times, sleeping with full-jitter
/// exponential backoff between attempts classified `Tier::Transient`. Any
/// other tier (or success) returns immediately.
pub async fn with_backoff<T, F, Fut>(mut op: F) -> Result<T, ErrorMetadata>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ErrorMetadata>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.tier == Tier::Transient && attempt + 1 < MAX_ATTEMPTS => {
                let backoff = BASE_DELAY * 2u32.pow(attempt).min(1 << 10);
                let capped = backoff.min(MAX_DELAY);
                let jittered = Duration::from_micros(rand::rng().random_range(0..=capped.as_micros() as u64));
                tracing::debug!(attempt, ?jittered, ?e, "retrying transient error");
                tokio::time::sleep(jittered).await;
                attempt += 1;
            },
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{
        AtomicU32,
        Ordering,
    };

    use super::*;

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(|| async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(ErrorMetadata::server_down("not yet"))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ErrorMetadata> = with_backoff(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ErrorMetadata::wrong_type("nope"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ErrorMetadata> = with_backoff(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ErrorMetadata::server_down("always down"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }
}
