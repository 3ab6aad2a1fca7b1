//! Scoped database transactions
//!
//! [`with_transaction`] commits only when the body returns `Ok`. Every other
//! exit path, including an error from the body or a failed commit, ends in a
//! rollback, and errors come back as values.

use crate::database::error::DatabaseError;
use futures::future::BoxFuture;
use sqlx::{PgConnection, PgPool};
use tracing::warn;

/// Run `body` inside a transaction on a connection from `pool`.
///
/// ```ignore
/// with_transaction(&pool, move |conn| {
///     Box::pin(async move {
///         sqlx::query("UPDATE ...").execute(&mut *conn).await?;
///         Ok(())
///     })
/// })
/// .await?;
/// ```
pub async fn with_transaction<T, F>(pool: &PgPool, body: F) -> Result<T, DatabaseError>
where
    T: Send,
    F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T, DatabaseError>> + Send,
{
    let mut tx = pool.begin().await?;

    match body(&mut *tx).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Rollback failed after error: {}", err);
            }
            Err(err)
        }
    }
}
