//! VersionLedger: writes a new current row for an identity and decides what
//! the superseded row leaves behind in `object_history`.
//!
//! Rules, applied inside the caller's transaction:
//! - directories and buckets not in `Enabled` mode store the `"null"` version,
//!   everything else gets a fresh version id;
//! - with `Enabled`, a superseded live `"null"` leaf is archived before the
//!   overwrite and every new leaf version is appended;
//! - with `Suspended`, history keeps exactly one `"null"` row per identity;
//! - ancestors are materialized before the leaf is written, and marker
//!   ancestors are recovered.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use uuid::Uuid;

use super::{
    counter::CounterDelta,
    deletion,
    error::{NamespaceError, NamespaceResult},
    lock::HeldLocks,
    materializer::DirectoryMaterializer,
    paths, store,
    store::Table,
};
use crate::models::{
    bucket::{Bucket, Versioning},
    object::{NULL_VERSION, ObjectInfo},
};

/// Fresh version id: md5 over the timestamp and a random uuid.
pub fn new_version_id(now: DateTime<Utc>) -> String {
    let seed = format!(
        "{}-{}",
        now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp_micros()),
        Uuid::new_v4()
    );
    format!("{:x}", md5::compute(seed))
}

/// Result of one put.
#[derive(Debug)]
pub struct PutOutcome {
    /// The row as stored in `objects`.
    pub stored: ObjectInfo,
    /// Change to apply to the bucket aggregates.
    pub delta: CounterDelta,
}

#[derive(Clone)]
pub struct VersionLedger {
    materializer: DirectoryMaterializer,
}

impl VersionLedger {
    pub fn new(materializer: DirectoryMaterializer) -> Self {
        Self { materializer }
    }

    /// Store `obj` as the current state of its identity.
    ///
    /// `obj.dirname` must already be normalized. Counter deltas are returned,
    /// not applied. Locks taken while materializing land in `held` and must be
    /// released by the caller once the transaction is finished.
    pub async fn put(
        &self,
        conn: &mut SqliteConnection,
        bucket: &Bucket,
        mut obj: ObjectInfo,
        now: DateTime<Utc>,
        held: &mut HeldLocks,
    ) -> NamespaceResult<PutOutcome> {
        let existing = store::fetch_current(conn, &bucket.name, &obj.dirname, &obj.name).await?;
        if let Some(prev) = existing.as_ref() {
            if !prev.is_marker && prev.is_dir != obj.is_dir {
                let kind = if prev.is_dir { "a directory" } else { "an object" };
                return Err(NamespaceError::InvalidArgument(format!(
                    "`{}` already exists as {}",
                    prev.path(),
                    kind
                )));
            }
        }

        obj.bucket = bucket.name.clone();
        if obj.is_dir {
            obj.into_directory();
        } else {
            obj.version = if bucket.versioning.is_enabled() {
                new_version_id(now)
            } else {
                NULL_VERSION.to_string()
            };
        }
        obj.is_marker = false;
        obj.updated_at = now;
        if obj.storage_class.is_empty() {
            obj.storage_class = bucket.storage_class.clone();
        }

        let materialized = self
            .materializer
            .materialize(conn, &bucket.name, &obj.dirname, now, held)
            .await?;
        let mut delta = CounterDelta::new(materialized.inserted, 0);

        let prev_marker_dir = existing.as_ref().is_some_and(|p| p.is_marker && p.is_dir);
        if materialized.marker_ancestors > 0 || prev_marker_dir {
            delta.count += deletion::recover_ancestors(conn, &bucket.name, &obj.dirname, now).await?;
        }

        match existing {
            None => {
                obj.created_at = now;
                store::insert_row(conn, Table::Current, &obj).await?;
                delta += CounterDelta::new(1, obj.live_size());
            }
            Some(prev) => {
                if bucket.versioning.is_enabled()
                    && prev.is_null_version()
                    && !prev.is_marker
                    && !prev.is_dir
                {
                    archive_null(conn, &prev).await?;
                }
                obj.id = prev.id;
                obj.created_at = prev.created_at;
                store::overwrite_current(conn, prev.id, &obj).await?;

                let revived = if prev.is_marker { 1 } else { 0 };
                delta += CounterDelta::new(revived, obj.live_size() - prev.live_size());
            }
        }

        record_history(conn, bucket.versioning, &obj).await?;

        let stored = store::fetch_current(conn, &bucket.name, &obj.dirname, &obj.name)
            .await?
            .ok_or_else(|| NamespaceError::object_not_found(&bucket.name, paths::join(&obj.dirname, &obj.name)))?;
        Ok(PutOutcome { stored, delta })
    }
}

/// Append the history row a freshly written leaf needs under `versioning`.
async fn record_history(
    conn: &mut SqliteConnection,
    versioning: Versioning,
    row: &ObjectInfo,
) -> NamespaceResult<()> {
    if row.is_dir {
        return Ok(());
    }
    match versioning {
        Versioning::Enabled => store::insert_row(conn, Table::History, row).await?,
        Versioning::Suspended => {
            store::delete_history_version(conn, &row.bucket, &row.dirname, &row.name, NULL_VERSION)
                .await?;
            store::insert_row(conn, Table::History, row).await?;
        }
        Versioning::Unset => {}
    }
    Ok(())
}

/// Move a superseded `"null"` row into history, replacing any older `"null"`
/// record of the same identity.
pub(crate) async fn archive_null(conn: &mut SqliteConnection, prev: &ObjectInfo) -> NamespaceResult<()> {
    store::delete_history_version(conn, &prev.bucket, &prev.dirname, &prev.name, NULL_VERSION).await?;
    store::insert_row(conn, Table::History, prev).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ids_are_hex_and_distinct() {
        let now = Utc::now();
        let a = new_version_id(now);
        let b = new_version_id(now);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
        assert_ne!(a, NULL_VERSION);
    }
}
