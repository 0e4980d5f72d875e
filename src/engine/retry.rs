use std::future::Future;

use tracing::{debug, warn};
use ulid::Ulid;

use super::EngineError;

/// Run `op` until it stops failing with [`EngineError::StaleObject`], up to
/// `max_attempts` tries. `op` receives the 1-based attempt number and must
/// reload whatever it saves on every call.
///
/// Any other error is returned as is. Running out of attempts is
/// [`EngineError::RetryExhausted`].
pub async fn with_optimistic_retry<T, F, Fut>(
    id: Ulid,
    max_attempts: u32,
    mut op: F,
) -> Result<T, EngineError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let max_attempts = max_attempts.max(1);
    for attempt in 1..=max_attempts {
        match op(attempt).await {
            Err(EngineError::StaleObject(stale)) => {
                metrics::counter!(crate::observability::OPTIMISTIC_RETRIES_TOTAL).increment(1);
                debug!(%id, %stale, attempt, "optimistic lock conflict, retrying");
                tokio::task::yield_now().await;
            }
            other => return other,
        }
    }
    warn!(%id, attempts = max_attempts, "optimistic retry exhausted");
    Err(EngineError::RetryExhausted {
        id,
        attempts: max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_transient_conflicts() {
        let id = Ulid::new();
        let calls = AtomicU32::new(0);
        let result = with_optimistic_retry(id, 5, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(EngineError::StaleObject(id))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_is_reported() {
        let id = Ulid::new();
        let result: Result<(), _> =
            with_optimistic_retry(id, 4, |_| async move { Err(EngineError::StaleObject(id)) }).await;
        assert_eq!(result, Err(EngineError::RetryExhausted { id, attempts: 4 }));
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let id = Ulid::new();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_optimistic_retry(id, 5, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(EngineError::NotFound(id)) }
        })
        .await;
        assert_eq!(result, Err(EngineError::NotFound(id)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
