//! DeletionEngine: removes entries by tombstoning, purging history versions,
//! or undeleting a tombstone.
//!
//! Per-identity behaviour, for a delete without an explicit version:
//!
//! | versioning         | current row           | effect                                     |
//! |--------------------|-----------------------|--------------------------------------------|
//! | Enabled            | live                  | marker written to current and history      |
//! | Suspended / Unset  | live, `"null"`        | current and `"null"` history become marker |
//! | Suspended / Unset  | live, real version    | marker written to current and history      |
//! | any                | marker                | newest marker purged, previous promoted    |
//!
//! With an explicit version the history row is purged; if it was also the
//! current row, the next most recent history row is promoted.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use super::{
    counter::{self, CounterDelta},
    error::{NamespaceError, NamespaceResult},
    ledger::{archive_null, new_version_id},
    paths, store,
    store::Table,
};
use crate::models::{
    bucket::Bucket,
    object::{DeletedObjects, NULL_VERSION, ObjectInfo},
};

/// Everything a deletion changed.
#[derive(Debug, Default)]
pub struct DeleteOutcome {
    /// Live rows and bytes taken away.
    pub deleted: DeletedObjects,
    /// Rows and bytes brought back by undeletes and ancestor recovery.
    pub restored: CounterDelta,
    /// Paths whose cached state is now stale.
    pub touched: Vec<String>,
}

impl DeleteOutcome {
    pub fn counter_delta(&self) -> CounterDelta {
        CounterDelta::new(
            self.restored.count - self.deleted.count,
            self.restored.size - self.deleted.size,
        )
    }
}

/// Delete `(dirname, name)` or one of its versions and settle the bucket
/// counters. `dirname` must already be normalized.
pub async fn delete_object(
    conn: &mut SqliteConnection,
    bucket: &Bucket,
    dirname: &str,
    name: &str,
    version: &str,
    is_dir: bool,
    now: DateTime<Utc>,
) -> NamespaceResult<DeleteOutcome> {
    let current = store::fetch_current(conn, &bucket.name, dirname, name).await?;
    let mut outcome = DeleteOutcome::default();

    match current {
        Some(target) if version.is_empty() && !target.is_marker && target.is_dir => {
            if bucket.versioning.is_enabled() {
                delete_subtree_versioned(conn, bucket, &target, now, &mut outcome).await?;
            } else {
                delete_subtree_marked(conn, bucket, &target, now, &mut outcome).await?;
            }
        }
        Some(target) if is_dir && !target.is_dir && !target.is_marker => {
            return Err(NamespaceError::InvalidArgument(format!(
                "`{}` is not a directory",
                target.path()
            )));
        }
        current => {
            delete_identity(conn, bucket, dirname, name, version, current, now, &mut outcome)
                .await?;
        }
    }

    counter::adjust(conn, &bucket.name, outcome.counter_delta(), now).await?;
    Ok(outcome)
}

/// Tombstone every live row at or below `target` in both tables.
///
/// Only directory rows are counted in the returned totals.
async fn delete_subtree_versioned(
    conn: &mut SqliteConnection,
    bucket: &Bucket,
    target: &ObjectInfo,
    now: DateTime<Utc>,
    outcome: &mut DeleteOutcome,
) -> NamespaceResult<()> {
    let rows =
        store::fetch_subtree(conn, Table::Current, &bucket.name, &target.path(), Some(false)).await?;

    // directories not yet historized, and "null" leaves, must survive the purge
    let mut archive = Vec::new();
    for row in &rows {
        if row.is_dir {
            if !store::history_exists(conn, &row.bucket, &row.dirname, &row.name).await? {
                archive.push(row.clone());
            }
        } else if row.is_null_version() {
            store::delete_history_version(conn, &row.bucket, &row.dirname, &row.name, NULL_VERSION)
                .await?;
            archive.push(row.clone());
        }
    }
    store::insert_rows(conn, Table::History, &archive).await?;

    let tombstones: Vec<ObjectInfo> = rows
        .iter()
        .map(|row| {
            let version = if row.is_dir {
                NULL_VERSION.to_string()
            } else {
                new_version_id(now)
            };
            row.tombstone(&version, now)
        })
        .collect();
    let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
    store::delete_by_ids(conn, Table::Current, &ids).await?;
    store::insert_rows(conn, Table::Current, &tombstones).await?;
    store::insert_rows(conn, Table::History, &tombstones).await?;

    let dirs = rows.iter().filter(|row| row.is_dir).count() as i64;
    outcome.deleted.add(dirs, 0);
    outcome.touched.extend(rows.iter().map(ObjectInfo::path));
    tracing::debug!(
        bucket = %bucket.name,
        path = %target.path(),
        rows = rows.len(),
        "tombstoned versioned subtree"
    );
    Ok(())
}

/// Tombstone every live row at or below `target` one by one.
async fn delete_subtree_marked(
    conn: &mut SqliteConnection,
    bucket: &Bucket,
    target: &ObjectInfo,
    now: DateTime<Utc>,
    outcome: &mut DeleteOutcome,
) -> NamespaceResult<()> {
    let rows =
        store::fetch_subtree(conn, Table::Current, &bucket.name, &target.path(), Some(false)).await?;
    for row in &rows {
        mark_object(conn, row, now).await?;
        outcome.deleted.add(1, row.live_size());
        outcome.touched.push(row.path());
    }
    Ok(())
}

/// Turn a live current row into a marker when versioning is not enabled.
///
/// A `"null"` row is converted in place together with its `"null"` history
/// record; a row carrying a real version gets a fresh marker appended.
pub async fn mark_object(
    conn: &mut SqliteConnection,
    row: &ObjectInfo,
    now: DateTime<Utc>,
) -> NamespaceResult<()> {
    let version = if row.is_dir {
        NULL_VERSION.to_string()
    } else {
        new_version_id(now)
    };
    let marker = row.tombstone(&version, now);
    store::overwrite_current(conn, row.id, &marker).await?;

    if row.is_null_version() {
        store::mark_history_null(conn, &row.bucket, &row.dirname, &row.name, &version, now).await?;
    } else {
        store::insert_row(conn, Table::History, &marker).await?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn delete_identity(
    conn: &mut SqliteConnection,
    bucket: &Bucket,
    dirname: &str,
    name: &str,
    version: &str,
    current: Option<ObjectInfo>,
    now: DateTime<Utc>,
    outcome: &mut DeleteOutcome,
) -> NamespaceResult<()> {
    let path = paths::join(dirname, name);
    outcome.touched.push(path.clone());

    if version.is_empty() {
        let current =
            current.ok_or_else(|| NamespaceError::object_not_found(&bucket.name, path.clone()))?;

        if current.is_marker {
            return undelete(conn, &current, now, outcome).await;
        }

        if bucket.versioning.is_enabled() {
            if current.is_null_version() && !current.is_dir {
                archive_null(conn, &current).await?;
            }
            archive_ancestor_dirs(conn, &bucket.name, dirname).await?;
            let marker = current.tombstone(&new_version_id(now), now);
            store::overwrite_current(conn, current.id, &marker).await?;
            store::insert_row(conn, Table::History, &marker).await?;
        } else {
            mark_object(conn, &current, now).await?;
        }
        outcome.deleted.add(1, current.live_size());
        return Ok(());
    }

    if let Some(current) = current.as_ref() {
        if current.is_dir && !current.is_marker && current.version == version {
            return Err(NamespaceError::InvalidArgument(format!(
                "`{}` is a directory, delete it without a version",
                path
            )));
        }
    }

    let removed = store::delete_current_version(conn, &bucket.name, dirname, name, version).await?;
    let purged = store::delete_history_version(conn, &bucket.name, dirname, name, version).await?;

    match current {
        Some(current) if removed == 1 => {
            if let Some(next) = store::fetch_history_latest(conn, &bucket.name, dirname, name, 1)
                .await?
                .into_iter()
                .next()
            {
                store::insert_row(conn, Table::Current, &next).await?;
                if !next.is_marker {
                    outcome.restored += CounterDelta::new(1, next.live_size());
                }
            }

            if current.is_marker {
                outcome.restored.count +=
                    recover_ancestors(conn, &bucket.name, dirname, now).await?;
            } else {
                outcome.deleted.add(1, current.live_size());
            }
            Ok(())
        }
        _ if purged > 0 => Ok(()),
        _ => Err(NamespaceError::VersionNotFound {
            bucket: bucket.name.clone(),
            path,
            version: version.to_string(),
        }),
    }
}

/// Copy live ancestor directories that have no history yet into
/// `object_history`, so version listings still show the directories leading
/// to a deleted leaf.
async fn archive_ancestor_dirs(
    conn: &mut SqliteConnection,
    bucket: &str,
    dirname: &str,
) -> NamespaceResult<()> {
    let dirs = store::fetch_current_dirs(conn, bucket, &paths::ancestors(dirname)).await?;
    let mut archive = Vec::new();
    for dir in dirs.into_iter().filter(|dir| !dir.is_marker) {
        if !store::history_exists(conn, bucket, &dir.dirname, &dir.name).await? {
            archive.push(dir);
        }
    }
    store::insert_rows(conn, Table::History, &archive).await?;
    Ok(())
}

/// Deleting a tombstone: drop the newest history marker and put the record
/// before it back in place. Without any earlier record the tombstone is
/// simply purged.
async fn undelete(
    conn: &mut SqliteConnection,
    current: &ObjectInfo,
    now: DateTime<Utc>,
    outcome: &mut DeleteOutcome,
) -> NamespaceResult<()> {
    let history =
        store::fetch_history_latest(conn, &current.bucket, &current.dirname, &current.name, 2)
            .await?;

    let mut remaining = history.as_slice();
    if let Some(newest) = history.first() {
        if newest.is_marker {
            store::delete_by_ids(conn, Table::History, &[newest.id]).await?;
            remaining = &history[1..];
        }
    }

    match remaining.first() {
        Some(previous) => {
            store::overwrite_current(conn, current.id, previous).await?;
            if !previous.is_marker {
                outcome.restored += CounterDelta::new(1, previous.live_size());
            }
        }
        None => {
            store::delete_by_ids(conn, Table::Current, &[current.id]).await?;
        }
    }

    outcome.restored.count +=
        recover_ancestors(conn, &current.bucket, &current.dirname, now).await?;
    Ok(())
}

/// Flip every marker directory on the ancestor chain of `dir_path` back to a
/// live `"null"` directory and drop its history. Returns how many were
/// recovered.
pub async fn recover_ancestors(
    conn: &mut SqliteConnection,
    bucket: &str,
    dir_path: &str,
    now: DateTime<Utc>,
) -> NamespaceResult<i64> {
    let chain = paths::ancestors(dir_path);
    let markers: Vec<ObjectInfo> = store::fetch_current_dirs(conn, bucket, &chain)
        .await?
        .into_iter()
        .filter(|row| row.is_marker)
        .collect();
    if markers.is_empty() {
        return Ok(0);
    }

    let ids: Vec<i64> = markers.iter().map(|row| row.id).collect();
    store::unmark_dirs(conn, &ids, now).await?;
    for row in &markers {
        store::delete_history_identity(conn, bucket, &row.dirname, &row.name).await?;
    }
    tracing::debug!(bucket, dir_path, recovered = markers.len(), "recovered marker ancestors");
    Ok(markers.len() as i64)
}

/// Physically remove tombstones at `(dirname, name)`, or every tombstone at
/// or below it when `recursive`, together with their history.
///
/// Tombstones are not part of the bucket aggregates, so counters are left
/// untouched.
pub async fn purge_markers(
    conn: &mut SqliteConnection,
    bucket: &Bucket,
    dirname: &str,
    name: &str,
    recursive: bool,
) -> NamespaceResult<DeleteOutcome> {
    let path = paths::join(dirname, name);
    let rows = if recursive {
        store::fetch_subtree(conn, Table::Current, &bucket.name, &path, Some(true)).await?
    } else {
        match store::fetch_current(conn, &bucket.name, dirname, name).await? {
            Some(row) if row.is_marker => vec![row],
            Some(_) => {
                return Err(NamespaceError::InvalidArgument(format!(
                    "`{}` is not deleted",
                    path
                )));
            }
            None => Vec::new(),
        }
    };
    if rows.is_empty() {
        return Err(NamespaceError::object_not_found(&bucket.name, path));
    }

    let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
    store::delete_by_ids(conn, Table::Current, &ids).await?;
    for row in &rows {
        store::delete_history_identity(conn, &row.bucket, &row.dirname, &row.name).await?;
    }

    let mut outcome = DeleteOutcome::default();
    outcome.deleted.add(rows.len() as i64, 0);
    outcome.touched = rows.iter().map(ObjectInfo::path).collect();
    Ok(outcome)
}
