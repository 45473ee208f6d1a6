//! DirectoryMaterializer: keeps a directory row in `objects` for every
//! ancestor of every stored path.
//!
//! Ancestors that are missing get inserted, ancestors that exist as markers
//! only get their timestamp refreshed. First-time inserts are serialized per
//! `bucket + top-level segment` through the distributed lock and re-checked
//! once the lock is held. The lock is handed to the caller and stays held
//! until the enclosing transaction has committed or rolled back, otherwise
//! the next writer's re-check could miss rows that are not yet visible.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use std::{collections::HashSet, sync::Arc};
use tracing::debug;
use uuid::Uuid;

use super::{
    error::NamespaceResult,
    lock::{self, DistributedLock, HeldLocks, LockBackoff},
    paths, store,
    store::Table,
};
use crate::models::object::ObjectInfo;

/// Directory rows that need work for one materialization.
#[derive(Debug, Default)]
pub struct MaterializePlan {
    /// Existing ancestors currently flagged as markers.
    pub to_update: Vec<ObjectInfo>,
    /// Missing ancestors, outermost first.
    pub to_insert: Vec<ObjectInfo>,
}

/// What a materialization changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Materialized {
    pub inserted: i64,
    pub marker_ancestors: usize,
}

#[derive(Clone)]
pub struct DirectoryMaterializer {
    lock: Arc<dyn DistributedLock>,
    backoff: LockBackoff,
}

impl DirectoryMaterializer {
    pub fn new(lock: Arc<dyn DistributedLock>, backoff: LockBackoff) -> Self {
        Self { lock, backoff }
    }

    /// Compare the ancestor chain of `dir_path` with the stored directory rows.
    pub async fn plan(
        conn: &mut SqliteConnection,
        bucket: &str,
        dir_path: &str,
        now: DateTime<Utc>,
    ) -> NamespaceResult<MaterializePlan> {
        let chain = paths::ancestors(dir_path);
        if chain.is_empty() {
            return Ok(MaterializePlan::default());
        }

        let existing = store::fetch_current_dirs(conn, bucket, &chain).await?;
        let present: HashSet<(&str, &str)> = existing
            .iter()
            .map(|row| (row.dirname.as_str(), row.name.as_str()))
            .collect();

        let to_insert = chain
            .iter()
            .filter(|(dirname, name)| !present.contains(&(dirname.as_str(), name.as_str())))
            .map(|(dirname, name)| ObjectInfo::directory(bucket, dirname.as_str(), name.as_str(), now))
            .collect();
        let to_update = existing.into_iter().filter(|row| row.is_marker).collect();

        Ok(MaterializePlan {
            to_update,
            to_insert,
        })
    }

    /// Ensure every ancestor of `dir_path` has a directory row. A lock taken
    /// for the insert is pushed onto `held`.
    pub async fn materialize(
        &self,
        conn: &mut SqliteConnection,
        bucket: &str,
        dir_path: &str,
        now: DateTime<Utc>,
        held: &mut HeldLocks,
    ) -> NamespaceResult<Materialized> {
        let plan = Self::plan(conn, bucket, dir_path, now).await?;

        if !plan.to_update.is_empty() {
            let ids: Vec<i64> = plan.to_update.iter().map(|row| row.id).collect();
            store::touch_current(conn, &ids, now).await?;
        }

        let mut outcome = Materialized {
            inserted: 0,
            marker_ancestors: plan.to_update.len(),
        };
        if plan.to_insert.is_empty() {
            return Ok(outcome);
        }

        let Some(segment) = paths::first_segment(dir_path) else {
            return Ok(outcome);
        };
        let lock_name = format!("{}_{}", bucket, segment);
        let holder = Uuid::new_v4().to_string();
        lock::acquire(self.lock.as_ref(), &lock_name, &holder, self.backoff).await?;
        held.push(self.lock.clone(), lock_name, holder);

        outcome.inserted = self.insert_missing(conn, bucket, dir_path, now).await?;
        Ok(outcome)
    }

    /// Re-check under the lock and insert whatever is still missing.
    async fn insert_missing(
        &self,
        conn: &mut SqliteConnection,
        bucket: &str,
        dir_path: &str,
        now: DateTime<Utc>,
    ) -> NamespaceResult<i64> {
        let plan = Self::plan(conn, bucket, dir_path, now).await?;
        if plan.to_insert.is_empty() {
            debug!(bucket, dir_path, "ancestors created concurrently");
            return Ok(0);
        }
        store::insert_rows(conn, Table::Current, &plan.to_insert).await?;
        debug!(bucket, dir_path, inserted = plan.to_insert.len(), "materialized ancestors");
        Ok(plan.to_insert.len() as i64)
    }
}
