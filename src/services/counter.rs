//! AggregateCounter: signed deltas on `buckets.count` / `buckets.size`,
//! applied inside the transaction of the structural mutation.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::{debug, warn};

use super::error::{NamespaceError, NamespaceResult};

/// Signed change to a bucket's aggregates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub count: i64,
    pub size: i64,
}

impl CounterDelta {
    pub fn new(count: i64, size: i64) -> Self {
        Self { count, size }
    }

    pub fn is_zero(&self) -> bool {
        self.count == 0 && self.size == 0
    }
}

impl std::ops::AddAssign for CounterDelta {
    fn add_assign(&mut self, other: Self) {
        self.count += other.count;
        self.size += other.size;
    }
}

/// Apply `delta` to `bucket`.
///
/// The update is guarded so neither aggregate can drop below zero. A guarded
/// update that matches no row aborts the caller's transaction with
/// `CounterInconsistency`.
pub async fn adjust(
    conn: &mut SqliteConnection,
    bucket: &str,
    delta: CounterDelta,
    now: DateTime<Utc>,
) -> NamespaceResult<()> {
    if delta.is_zero() {
        return Ok(());
    }

    let result = sqlx::query(
        "UPDATE buckets SET count = count + ?, size = size + ?, updated_at = ?
         WHERE name = ? AND count + ? >= 0 AND size + ? >= 0",
    )
    .bind(delta.count)
    .bind(delta.size)
    .bind(now)
    .bind(bucket)
    .bind(delta.count)
    .bind(delta.size)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        warn!(
            bucket,
            count = delta.count,
            size = delta.size,
            "bucket counters cannot absorb delta"
        );
        return Err(NamespaceError::CounterInconsistency {
            bucket: bucket.to_string(),
            count: delta.count,
            size: delta.size,
        });
    }

    debug!(bucket, count = delta.count, size = delta.size, "adjusted bucket counters");
    Ok(())
}
