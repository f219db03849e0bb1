use std::future::Future;
use std::time::Duration;

use crate::error::{AppError, Result};

/// Run `fut` to completion or fail with `Timeout` after `limit`.
/// On timeout the future is dropped, which runs its rollback guards.
pub async fn bounded<T, F>(limit: Duration, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(AppError::Timeout(format!(
            "{} did not finish within {}s",
            operation,
            limit.as_secs_f64()
        ))),
    }
}
