//! Small fallback combinators stacked around resilient calls.

use std::future::Future;

/// Run `primary`; on failure run `fallback` and return its result.
pub async fn with_fallback<T, E, P, F, Fut>(primary: P, fallback: F) -> Result<T, E>
where
    P: Future<Output = Result<T, E>>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    match primary.await {
        Ok(value) => Ok(value),
        Err(_) => fallback().await,
    }
}

/// Run `op`; on failure return `default` instead of the error.
pub async fn with_default<T, E, Fut>(op: Fut, default: T) -> T
where
    Fut: Future<Output = Result<T, E>>,
{
    op.await.unwrap_or(default)
}
