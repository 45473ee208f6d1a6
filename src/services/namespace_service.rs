//! NamespaceService: the operations the nameserver exposes.
//!
//! Each mutation runs in one SQLite transaction: ancestors are materialized,
//! then the leaf rows are written, then the bucket counters are adjusted. Any
//! error drops the transaction, which rolls everything back. Point lookups go
//! through the cache-aside layer; mutations read through the transaction and
//! invalidate the cache before and after the write.

use crate::models::{
    bucket::{Bucket, BucketExternal, ExternalKind, Versioning},
    object::{DeletedObjects, ObjectInfo, ObjectOptions},
};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{
    cache::{CacheAside, CacheStore, bucket_key, object_key},
    clock::Clock,
    counter,
    deletion::{self, DeleteOutcome},
    error::{NamespaceError, NamespaceResult},
    ledger::VersionLedger,
    lock::{DistributedLock, HeldLocks, LockBackoff},
    materializer::DirectoryMaterializer,
    paths, store,
    store::Table,
};

const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const MAX_PAGE_SIZE: i64 = 1000;

/// Tunables of the namespace core.
#[derive(Debug, Clone, Copy)]
pub struct NamespaceSettings {
    pub cache_ttl: Duration,
    pub lock_backoff: LockBackoff,
}

impl Default for NamespaceSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(30),
            lock_backoff: LockBackoff::default(),
        }
    }
}

#[derive(Clone)]
pub struct NamespaceService {
    /// Shared SQLite pool holding all namespace tables.
    pub db: Arc<SqlitePool>,
    cache: CacheAside,
    ledger: VersionLedger,
    clock: Arc<dyn Clock>,
}

impl NamespaceService {
    pub fn new(
        db: Arc<SqlitePool>,
        cache_store: Arc<dyn CacheStore>,
        lock: Arc<dyn DistributedLock>,
        clock: Arc<dyn Clock>,
        settings: NamespaceSettings,
    ) -> Self {
        let materializer = DirectoryMaterializer::new(lock, settings.lock_backoff);
        Self {
            db,
            cache: CacheAside::new(cache_store, settings.cache_ttl),
            ledger: VersionLedger::new(materializer),
            clock,
        }
    }

    /// Write transactions take the database write lock up front so concurrent
    /// writers queue on the busy timeout instead of failing on upgrade.
    async fn begin_write(&self) -> NamespaceResult<Transaction<'static, Sqlite>> {
        Ok(self.db.begin_with("BEGIN IMMEDIATE").await?)
    }

    // -----------------------------------------------------------------------
    // Buckets
    // -----------------------------------------------------------------------

    /// Create a bucket. Counters always start at zero.
    #[instrument(skip(self, bucket), fields(bucket = %bucket.name))]
    pub async fn put_bucket_info(&self, mut bucket: Bucket) -> NamespaceResult<Bucket> {
        ensure_bucket_name_safe(&bucket.name)?;
        if bucket.owner.is_empty() {
            return Err(NamespaceError::InvalidArgument("bucket owner is empty".into()));
        }

        let now = self.clock.now();
        bucket.bucket_id = Uuid::new_v4().to_string();
        bucket.count = 0;
        bucket.size = 0;
        bucket.created_at = now;
        bucket.updated_at = now;
        if bucket.storage_class.is_empty() {
            bucket.storage_class = crate::models::object::DEFAULT_STORAGE_CLASS.into();
        }

        let keys = [bucket_key(&bucket.name)];
        self.cache
            .write(&keys, || async {
                let mut conn = self.db.acquire().await?;
                match store::insert_bucket(&mut conn, &bucket).await {
                    Ok(()) => Ok(()),
                    Err(err) if is_unique_violation(&err) => {
                        Err(NamespaceError::BucketAlreadyExists(bucket.name.clone()))
                    }
                    Err(err) => Err(err.into()),
                }
            })
            .await?;

        info!(bucket = %bucket.name, "created bucket");
        Ok(bucket)
    }

    /// Change owner, versioning, storage class or location of a bucket.
    #[instrument(skip(self, bucket), fields(bucket = %bucket.name))]
    pub async fn update_bucket_info(&self, mut bucket: Bucket) -> NamespaceResult<Bucket> {
        ensure_bucket_name_present(&bucket.name)?;
        let keys = [bucket_key(&bucket.name)];
        self.cache
            .write(&keys, || async move {
                let now = self.clock.now();
                let mut tx = self.begin_write().await?;
                let existing = load_bucket(&mut tx, &bucket.name).await?;
                if existing.versioning != Versioning::Unset && bucket.versioning == Versioning::Unset {
                    return Err(NamespaceError::InvalidArgument(
                        "versioning cannot return to Unset once configured".into(),
                    ));
                }
                if bucket.owner.is_empty() {
                    bucket.owner = existing.owner.clone();
                }
                if bucket.storage_class.is_empty() {
                    bucket.storage_class = existing.storage_class.clone();
                }
                if bucket.location.is_empty() {
                    bucket.location = existing.location.clone();
                }
                bucket.updated_at = now;
                store::update_bucket_settings(&mut tx, &bucket).await?;
                let updated = load_bucket(&mut tx, &bucket.name).await?;
                tx.commit().await?;
                Ok(updated)
            })
            .await
    }

    /// Remove a bucket. Refused while the bucket still counts live entries.
    #[instrument(skip(self))]
    pub async fn delete_bucket_info(&self, name: &str) -> NamespaceResult<()> {
        ensure_bucket_name_present(name)?;
        let keys = [bucket_key(name)];
        self.cache
            .write(&keys, || async {
                let mut tx = self.begin_write().await?;
                let bucket = load_bucket(&mut tx, name).await?;
                if bucket.count > 0 {
                    return Err(NamespaceError::BucketNotEmpty(name.to_string()));
                }
                store::delete_bucket(&mut tx, name).await?;
                tx.commit().await?;
                Ok(())
            })
            .await?;
        info!(bucket = name, "deleted bucket");
        Ok(())
    }

    pub async fn query_bucket_info(&self, name: &str) -> NamespaceResult<Bucket> {
        ensure_bucket_name_present(name)?;
        self.cache
            .read(&bucket_key(name), || async {
                let mut conn = self.db.acquire().await?;
                Ok(store::fetch_bucket(&mut conn, name).await?)
            })
            .await?
            .ok_or_else(|| NamespaceError::BucketNotFound(name.to_string()))
    }

    pub async fn list_buckets(&self, owner: Option<&str>) -> NamespaceResult<Vec<Bucket>> {
        let mut conn = self.db.acquire().await?;
        Ok(store::list_buckets(&mut conn, owner).await?)
    }

    /// Set one side-table blob (policy, acl, tags, logging) of a bucket.
    pub async fn put_bucket_external(
        &self,
        name: &str,
        kind: ExternalKind,
        value: Option<&str>,
    ) -> NamespaceResult<()> {
        ensure_bucket_name_present(name)?;
        let mut tx = self.begin_write().await?;
        load_bucket(&mut tx, name).await?;
        store::upsert_bucket_external(&mut tx, name, kind, value, self.clock.now()).await?;
        tx.commit().await?;
        debug!(bucket = name, attribute = kind.column(), "updated bucket attribute");
        Ok(())
    }

    pub async fn query_bucket_external(
        &self,
        name: &str,
        kind: ExternalKind,
    ) -> NamespaceResult<Option<String>> {
        ensure_bucket_name_present(name)?;
        let mut conn = self.db.acquire().await?;
        load_bucket(&mut conn, name).await?;
        let external = store::fetch_bucket_external(&mut conn, name)
            .await?
            .unwrap_or_else(|| BucketExternal {
                bucket: name.to_string(),
                ..Default::default()
            });
        Ok(external.get(kind).map(str::to_string))
    }

    pub async fn delete_bucket_external(&self, name: &str, kind: ExternalKind) -> NamespaceResult<()> {
        self.put_bucket_external(name, kind, None).await
    }

    // -----------------------------------------------------------------------
    // Object mutations
    // -----------------------------------------------------------------------

    /// Store `obj` as the current state of `(obj.dirname, obj.name)`.
    #[instrument(skip(self, obj), fields(bucket = %obj.bucket, dirname = %obj.dirname, name = %obj.name))]
    pub async fn put_object_info(&self, mut obj: ObjectInfo) -> NamespaceResult<ObjectInfo> {
        ensure_bucket_name_present(&obj.bucket)?;
        let (dirname, name) = paths::normalize_entry(&obj.dirname, &obj.name)?;
        obj.dirname = dirname;
        obj.name = name;
        if obj.content_length < 0 || obj.cipher_text_size < 0 {
            return Err(NamespaceError::InvalidArgument("negative content length".into()));
        }

        let keys = entry_keys(&obj.bucket, &obj.dirname, &obj.name);
        self.cache
            .write(&keys, || async {
                let mut held = HeldLocks::default();
                let stored = self.put_in_tx(&obj, &mut held).await;
                held.release().await;
                stored
            })
            .await
    }

    /// One put transaction. Directory locks taken along the way stay in `held`
    /// until the caller releases them, after commit or rollback.
    async fn put_in_tx(&self, obj: &ObjectInfo, held: &mut HeldLocks) -> NamespaceResult<ObjectInfo> {
        let now = self.clock.now();
        let mut tx = self.begin_write().await?;
        let bucket = load_bucket(&mut tx, &obj.bucket).await?;
        let outcome = self.ledger.put(&mut tx, &bucket, obj.clone(), now, held).await?;
        counter::adjust(&mut tx, &bucket.name, outcome.delta, now).await?;
        tx.commit().await?;
        debug!(version = %outcome.stored.version, delta = ?outcome.delta, "stored object");
        Ok(outcome.stored)
    }

    /// Delete an entry, a directory subtree, or a single version.
    #[instrument(skip(self, opts), fields(bucket = %opts.bucket, prefix = %opts.prefix, object = %opts.object))]
    pub async fn delete_object_info(&self, opts: ObjectOptions) -> NamespaceResult<DeletedObjects> {
        ensure_bucket_name_present(&opts.bucket)?;
        let (dirname, name) = paths::normalize_entry(&opts.prefix, &opts.object)?;
        let version = opts.version_id.trim();
        ensure_version_well_formed(version)?;

        let keys = entry_keys(&opts.bucket, &dirname, &name);
        let outcome = self
            .cache
            .write(&keys, || async {
                let now = self.clock.now();
                let mut tx = self.begin_write().await?;
                let bucket = load_bucket(&mut tx, &opts.bucket).await?;
                let outcome = deletion::delete_object(
                    &mut tx,
                    &bucket,
                    &dirname,
                    &name,
                    version,
                    opts.is_dir,
                    now,
                )
                .await?;
                tx.commit().await?;
                Ok(outcome)
            })
            .await?;

        self.invalidate_touched(&opts.bucket, &outcome).await;
        debug!(deleted = ?outcome.deleted, restored = ?outcome.restored, "deleted object");
        Ok(outcome.deleted)
    }

    /// Physically purge tombstoned entries at the target, or below it when
    /// `recursive`.
    #[instrument(skip(self, opts), fields(bucket = %opts.bucket, prefix = %opts.prefix, object = %opts.object))]
    pub async fn delete_object_fetch_delete(
        &self,
        opts: ObjectOptions,
        recursive: bool,
    ) -> NamespaceResult<DeletedObjects> {
        ensure_bucket_name_present(&opts.bucket)?;
        let (dirname, name) = paths::normalize_entry(&opts.prefix, &opts.object)?;

        let keys = entry_keys(&opts.bucket, &dirname, &name);
        let outcome = self
            .cache
            .write(&keys, || async {
                let mut tx = self.begin_write().await?;
                let bucket = load_bucket(&mut tx, &opts.bucket).await?;
                let outcome =
                    deletion::purge_markers(&mut tx, &bucket, &dirname, &name, recursive).await?;
                tx.commit().await?;
                Ok(outcome)
            })
            .await?;

        self.invalidate_touched(&opts.bucket, &outcome).await;
        Ok(outcome.deleted)
    }

    async fn invalidate_touched(&self, bucket: &str, outcome: &DeleteOutcome) {
        let keys: Vec<String> = outcome
            .touched
            .iter()
            .map(|path| object_key(bucket, path))
            .collect();
        self.cache.invalidate(&keys).await;
    }

    // -----------------------------------------------------------------------
    // Object queries
    // -----------------------------------------------------------------------

    /// Current state of an entry, or a specific version of it.
    pub async fn query_object_info(
        &self,
        bucket: &str,
        prefix: &str,
        name: &str,
        version: &str,
    ) -> NamespaceResult<ObjectInfo> {
        ensure_bucket_name_present(bucket)?;
        let (dirname, name) = paths::normalize_entry(prefix, name)?;
        let path = paths::join(&dirname, &name);

        if version.is_empty() {
            let row = self
                .cache
                .read(&object_key(bucket, &path), || async {
                    let mut conn = self.db.acquire().await?;
                    load_bucket(&mut conn, bucket).await?;
                    Ok(store::fetch_current(&mut conn, bucket, &dirname, &name).await?)
                })
                .await?;
            return match row {
                Some(row) if !row.is_marker => Ok(row),
                _ => Err(NamespaceError::object_not_found(bucket, path)),
            };
        }

        let mut conn = self.db.acquire().await?;
        load_bucket(&mut conn, bucket).await?;
        if let Some(current) = store::fetch_current(&mut conn, bucket, &dirname, &name).await? {
            if current.version == version {
                return Ok(current);
            }
        }
        store::fetch_history_version(&mut conn, bucket, &dirname, &name, version)
            .await?
            .ok_or_else(|| NamespaceError::VersionNotFound {
                bucket: bucket.to_string(),
                path,
                version: version.to_string(),
            })
    }

    /// A history record of an entry; the most recent one when `version` is empty.
    pub async fn query_object_history_info(
        &self,
        bucket: &str,
        prefix: &str,
        name: &str,
        version: &str,
    ) -> NamespaceResult<ObjectInfo> {
        ensure_bucket_name_present(bucket)?;
        let (dirname, name) = paths::normalize_entry(prefix, name)?;
        let mut conn = self.db.acquire().await?;
        load_bucket(&mut conn, bucket).await?;

        let row = if version.is_empty() {
            store::fetch_history_latest(&mut conn, bucket, &dirname, &name, 1)
                .await?
                .into_iter()
                .next()
        } else {
            store::fetch_history_version(&mut conn, bucket, &dirname, &name, version).await?
        };
        row.ok_or_else(|| NamespaceError::VersionNotFound {
            bucket: bucket.to_string(),
            path: paths::join(&dirname, &name),
            version: version.to_string(),
        })
    }

    /// One page of the children of `prefix`, directories first, newest first.
    ///
    /// With `fetch_deleted`, tombstones are listed too, merged with entries
    /// that only survive in history.
    pub async fn query_object_infos_by_prefix(
        &self,
        bucket: &str,
        prefix: &str,
        offset: i64,
        limit: i64,
        fetch_deleted: bool,
    ) -> NamespaceResult<(Vec<ObjectInfo>, i64)> {
        ensure_bucket_name_present(bucket)?;
        let dirname = paths::normalize_dir(prefix)?;
        let offset = offset.max(0);
        let limit = limit.clamp(1, MAX_PAGE_SIZE);

        let mut conn = self.db.acquire().await?;
        load_bucket(&mut conn, bucket).await?;

        if !fetch_deleted {
            let rows =
                store::list_children(&mut conn, bucket, &dirname, false, offset, limit).await?;
            let total = store::count_children(&mut conn, bucket, &dirname, false).await?;
            return Ok((rows, total));
        }

        let current = store::fetch_children(&mut conn, Table::Current, bucket, &dirname, None).await?;
        let history = store::fetch_children(&mut conn, Table::History, bucket, &dirname, None).await?;
        let mut entries: BTreeMap<String, ObjectInfo> = current
            .into_iter()
            .map(|row| (row.name.clone(), row))
            .collect();
        for row in history {
            entries.entry(row.name.clone()).or_insert(row);
        }

        let mut rows: Vec<ObjectInfo> = entries.into_values().collect();
        rows.sort_by(|a, b| {
            b.is_dir
                .cmp(&a.is_dir)
                .then(b.updated_at.cmp(&a.updated_at))
                .then(a.name.cmp(&b.name))
        });
        let total = rows.len() as i64;
        let page = rows
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        Ok((page, total))
    }

    /// Version listing of the children of `prefix` (or of one `object`),
    /// by name, newest version first, resuming after
    /// `(marker, version_marker)`.
    #[allow(clippy::too_many_arguments)]
    pub async fn query_object_info_all(
        &self,
        bucket: &str,
        prefix: &str,
        object: &str,
        marker: &str,
        version_marker: &str,
        max_keys: i64,
        fetch_deleted: bool,
    ) -> NamespaceResult<Vec<ObjectInfo>> {
        ensure_bucket_name_present(bucket)?;
        let dirname = paths::normalize_dir(prefix)?;
        let name_filter = if object.is_empty() {
            None
        } else {
            paths::validate_name(object)?;
            Some(object)
        };
        let max_keys = max_keys.clamp(1, MAX_PAGE_SIZE) as usize;

        let mut conn = self.db.acquire().await?;
        load_bucket(&mut conn, bucket).await?;
        let current =
            store::fetch_children(&mut conn, Table::Current, bucket, &dirname, name_filter).await?;
        let history =
            store::fetch_children(&mut conn, Table::History, bucket, &dirname, name_filter).await?;

        let current_versions: HashMap<String, String> = current
            .iter()
            .map(|row| (row.name.clone(), row.version.clone()))
            .collect();
        let mut grouped: BTreeMap<String, Vec<ObjectInfo>> = BTreeMap::new();
        for row in current {
            grouped.entry(row.name.clone()).or_default().push(row);
        }
        for row in history {
            if current_versions.get(&row.name) == Some(&row.version) {
                continue;
            }
            grouped.entry(row.name.clone()).or_default().push(row);
        }

        let versions = grouped
            .into_values()
            .flatten()
            .filter(|row| fetch_deleted || !row.is_marker);

        let mut out = Vec::new();
        let mut resumed = marker.is_empty();
        for row in versions {
            if !resumed {
                if row.name.as_str() < marker {
                    continue;
                }
                if row.name == marker {
                    if row.version == version_marker {
                        resumed = true;
                    }
                    continue;
                }
                resumed = true;
            }
            out.push(row);
            if out.len() == max_keys {
                break;
            }
        }
        Ok(out)
    }

    /// Live entries strictly below the directory `path`.
    pub async fn count_objects_by_prefix(&self, bucket: &str, path: &str) -> NamespaceResult<i64> {
        ensure_bucket_name_present(bucket)?;
        let path = paths::normalize_dir(path)?;
        let mut conn = self.db.acquire().await?;
        load_bucket(&mut conn, bucket).await?;
        Ok(store::count_by_prefix(&mut conn, bucket, &path).await?)
    }
}

async fn load_bucket(conn: &mut SqliteConnection, name: &str) -> NamespaceResult<Bucket> {
    store::fetch_bucket(conn, name)
        .await?
        .ok_or_else(|| NamespaceError::BucketNotFound(name.to_string()))
}

/// Cache keys made stale by a write to `(dirname, name)`: the entry, its
/// ancestors, and the bucket aggregates.
fn entry_keys(bucket: &str, dirname: &str, name: &str) -> Vec<String> {
    let mut keys = vec![bucket_key(bucket), object_key(bucket, &paths::join(dirname, name))];
    keys.extend(
        paths::ancestors(dirname)
            .iter()
            .map(|(parent, segment)| object_key(bucket, &paths::join(parent, segment))),
    );
    keys
}

fn ensure_bucket_name_present(name: &str) -> NamespaceResult<()> {
    if name.is_empty() {
        return Err(NamespaceError::InvalidArgument("bucket name is empty".into()));
    }
    Ok(())
}

/// Version ids are either `"null"` or a 32-digit lowercase hex digest.
fn ensure_version_well_formed(version: &str) -> NamespaceResult<()> {
    if version.is_empty() || version == crate::models::object::NULL_VERSION {
        return Ok(());
    }
    let hex = |b: u8| b.is_ascii_digit() || (b'a'..=b'f').contains(&b);
    if version.len() == 32 && version.bytes().all(hex) {
        return Ok(());
    }
    Err(NamespaceError::InvalidArgument(format!(
        "malformed version id `{}`",
        version
    )))
}

/// Validate bucket name format.
///
/// Enforces S3-like naming rules:
/// - 3–63 characters
/// - lowercase letters, digits, dots, hyphens only
/// - cannot start/end with dot or hyphen
/// - cannot contain consecutive dots or dot-hyphen patterns
/// - cannot look like an IPv4 address
fn ensure_bucket_name_safe(name: &str) -> NamespaceResult<()> {
    let invalid = |reason: &str| NamespaceError::InvalidBucketName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let len = name.len();
    if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
        return Err(invalid("must be between 3 and 63 characters"));
    }
    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
    {
        return Err(invalid(
            "allowed characters are lowercase letters, digits, dots, and hyphens",
        ));
    }
    if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
        return Err(invalid("must start and end with a lowercase letter or digit"));
    }
    if name.contains("..") || name.contains("-.") || name.contains(".-") {
        return Err(invalid(
            "cannot contain consecutive dots or dot-hyphen combinations",
        ));
    }
    if is_ipv4_like(name) {
        return Err(invalid("must not be formatted like an IP address"));
    }
    Ok(())
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::{create_bucket, file_service, live_totals, service};
    use chrono::Utc;

    async fn put_file(
        service: &NamespaceService,
        bucket: &str,
        dirname: &str,
        name: &str,
        len: i64,
    ) -> ObjectInfo {
        let obj = ObjectInfo::file(bucket, dirname, name, format!("cid-{}-{}", name, len), len, Utc::now());
        service.put_object_info(obj).await.unwrap()
    }

    fn opts(bucket: &str, prefix: &str, object: &str, version: &str) -> ObjectOptions {
        ObjectOptions {
            bucket: bucket.into(),
            prefix: prefix.into(),
            object: object.into(),
            version_id: version.into(),
            is_dir: false,
        }
    }

    async fn totals(service: &NamespaceService, bucket: &str) -> (i64, i64) {
        let bucket = service.query_bucket_info(bucket).await.unwrap();
        (bucket.count, bucket.size)
    }

    #[tokio::test]
    async fn put_materializes_every_ancestor() {
        let service = service().await;
        create_bucket(&service, "docs", Versioning::Unset).await;

        put_file(&service, "docs", "/a/b", "c.txt", 10).await;

        let a = service.query_object_info("docs", "/", "a", "").await.unwrap();
        let b = service.query_object_info("docs", "/a", "b", "").await.unwrap();
        assert!(a.is_dir && b.is_dir);
        assert_eq!(b.version, "null");
        assert_eq!(totals(&service, "docs").await, (3, 10));
        assert_eq!(service.count_objects_by_prefix("docs", "/a").await.unwrap(), 2);
        assert_eq!(service.count_objects_by_prefix("docs", "/").await.unwrap(), 3);

        // siblings reuse the existing chain
        put_file(&service, "docs", "/a/b", "d.txt", 5).await;
        assert_eq!(totals(&service, "docs").await, (4, 15));
    }

    #[tokio::test]
    async fn unversioned_delete_and_rewrite_keeps_counters() {
        let service = service().await;
        create_bucket(&service, "plain", Versioning::Unset).await;

        let stored = put_file(&service, "plain", "/", "f.txt", 10).await;
        assert_eq!(stored.version, "null");
        assert_eq!(totals(&service, "plain").await, (1, 10));

        let deleted = service
            .delete_object_info(opts("plain", "/", "f.txt", ""))
            .await
            .unwrap();
        assert_eq!(deleted, DeletedObjects { count: 1, size: 10 });
        assert_eq!(totals(&service, "plain").await, (0, 0));
        {
            let mut conn = service.db.acquire().await.unwrap();
            let tombstone = store::fetch_current(&mut conn, "plain", "/", "f.txt")
                .await
                .unwrap()
                .unwrap();
            assert!(tombstone.is_marker);
            assert_ne!(tombstone.version, "null");
        }
        assert!(
            service
                .query_object_info("plain", "/", "f.txt", "")
                .await
                .unwrap_err()
                .is_not_found()
        );

        put_file(&service, "plain", "/", "f.txt", 20).await;
        assert_eq!(totals(&service, "plain").await, (1, 20));
        let current = service.query_object_info("plain", "/", "f.txt", "").await.unwrap();
        assert_eq!(current.content_length, 20);
    }

    #[tokio::test]
    async fn second_delete_of_a_tombstone_is_not_found() {
        let service = service().await;
        create_bucket(&service, "plain", Versioning::Unset).await;
        put_file(&service, "plain", "/", "f.txt", 10).await;

        service
            .delete_object_info(opts("plain", "/", "f.txt", ""))
            .await
            .unwrap();
        // no earlier record to restore, so the tombstone is purged
        let deleted = service
            .delete_object_info(opts("plain", "/", "f.txt", ""))
            .await
            .unwrap();
        assert_eq!(deleted, DeletedObjects::default());

        let err = service
            .delete_object_info(opts("plain", "/", "f.txt", ""))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(totals(&service, "plain").await, (0, 0));
    }

    #[tokio::test]
    async fn counters_match_live_rows() {
        let service = service().await;
        for (bucket, versioning) in [
            ("mixed-unset", Versioning::Unset),
            ("mixed-enabled", Versioning::Enabled),
            ("mixed-suspended", Versioning::Suspended),
        ] {
            create_bucket(&service, bucket, versioning).await;
            put_file(&service, bucket, "/a/b", "one", 3).await;
            put_file(&service, bucket, "/a/b", "one", 8).await;
            put_file(&service, bucket, "/a", "two", 5).await;
            put_file(&service, bucket, "/c", "three", 2).await;
            service
                .delete_object_info(opts(bucket, "/a", "two", ""))
                .await
                .unwrap();
            service
                .delete_object_info(opts(bucket, "/a", "two", ""))
                .await
                .unwrap();
            service
                .delete_object_info(opts(bucket, "/c", "three", ""))
                .await
                .unwrap();
            put_file(&service, bucket, "/c/d", "four", 4).await;

            let mut conn = service.db.acquire().await.unwrap();
            let (live, bytes): (i64, i64) = sqlx::query_as(
                "SELECT COUNT(*), COALESCE(SUM(CASE WHEN is_dir = 0 THEN content_length ELSE 0 END), 0)
                 FROM objects WHERE bucket = ? AND is_marker = 0",
            )
            .bind(bucket)
            .fetch_one(&mut *conn)
            .await
            .unwrap();
            drop(conn);

            assert_eq!(totals(&service, bucket).await, (live, bytes), "{}", bucket);
        }
    }

    #[tokio::test]
    async fn enabled_bucket_keeps_every_version() {
        let service = service().await;
        create_bucket(&service, "vers", Versioning::Enabled).await;

        let v1 = put_file(&service, "vers", "/", "v.txt", 5).await;
        let v2 = put_file(&service, "vers", "/", "v.txt", 7).await;
        assert_ne!(v1.version, v2.version);
        assert_ne!(v1.version, "null");
        assert_eq!(totals(&service, "vers").await, (1, 7));

        let old = service
            .query_object_info("vers", "/", "v.txt", &v1.version)
            .await
            .unwrap();
        assert_eq!(old.content_length, 5);
        let latest = service
            .query_object_history_info("vers", "/", "v.txt", "")
            .await
            .unwrap();
        assert_eq!(latest.version, v2.version);
    }

    #[tokio::test]
    async fn deleting_the_marker_restores_the_previous_version() {
        let service = service().await;
        create_bucket(&service, "vers", Versioning::Enabled).await;
        put_file(&service, "vers", "/", "v.txt", 5).await;
        let v2 = put_file(&service, "vers", "/", "v.txt", 7).await;

        service
            .delete_object_info(opts("vers", "/", "v.txt", ""))
            .await
            .unwrap();
        assert_eq!(totals(&service, "vers").await, (0, 0));
        assert!(service.query_object_info("vers", "/", "v.txt", "").await.is_err());

        // deleting the tombstone undeletes
        let deleted = service
            .delete_object_info(opts("vers", "/", "v.txt", ""))
            .await
            .unwrap();
        assert_eq!(deleted, DeletedObjects::default());
        let restored = service.query_object_info("vers", "/", "v.txt", "").await.unwrap();
        assert_eq!(restored.version, v2.version);
        assert_eq!(totals(&service, "vers").await, (1, 7));

        // the history holds no marker anymore
        let history = service
            .query_object_info_all("vers", "/", "v.txt", "", "", 1000, true)
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|row| !row.is_marker));
    }

    #[tokio::test]
    async fn version_delete_promotes_the_next_most_recent() {
        let service = service().await;
        create_bucket(&service, "vers", Versioning::Enabled).await;
        let v1 = put_file(&service, "vers", "/", "v.txt", 5).await;
        let v2 = put_file(&service, "vers", "/", "v.txt", 7).await;

        let deleted = service
            .delete_object_info(opts("vers", "/", "v.txt", &v2.version))
            .await
            .unwrap();
        assert_eq!(deleted, DeletedObjects { count: 1, size: 7 });

        let current = service.query_object_info("vers", "/", "v.txt", "").await.unwrap();
        assert_eq!(current.version, v1.version);
        assert_eq!(totals(&service, "vers").await, (1, 5));

        let err = service
            .query_object_info("vers", "/", "v.txt", &v2.version)
            .await
            .unwrap_err();
        assert!(matches!(err, NamespaceError::VersionNotFound { .. }));
    }

    #[tokio::test]
    async fn deleting_an_unknown_version_fails() {
        let service = service().await;
        create_bucket(&service, "vers", Versioning::Enabled).await;
        put_file(&service, "vers", "/", "v.txt", 5).await;

        let err = service
            .delete_object_info(opts("vers", "/", "v.txt", "0123456789abcdef0123456789abcdef"))
            .await
            .unwrap_err();
        assert!(matches!(err, NamespaceError::VersionNotFound { .. }));

        let err = service
            .delete_object_info(opts("vers", "/", "v.txt", "not-a-version"))
            .await
            .unwrap_err();
        assert!(matches!(err, NamespaceError::InvalidArgument(_)));
        assert_eq!(totals(&service, "vers").await, (1, 5));
    }

    #[tokio::test]
    async fn suspended_bucket_keeps_one_null_record() {
        let service = service().await;
        create_bucket(&service, "susp", Versioning::Suspended).await;
        for len in [1, 2, 3] {
            put_file(&service, "susp", "/", "s.txt", len).await;
        }

        let mut conn = service.db.acquire().await.unwrap();
        let history = store::fetch_children(&mut conn, Table::History, "susp", "/", Some("s.txt"))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].version, "null");
        assert_eq!(history[0].content_length, 3);
        drop(conn);
        assert_eq!(totals(&service, "susp").await, (1, 3));
    }

    #[tokio::test]
    async fn enabled_subtree_delete_counts_directories_only() {
        let service = service().await;
        create_bucket(&service, "tree", Versioning::Enabled).await;
        put_file(&service, "tree", "/d", "x.txt", 4).await;
        put_file(&service, "tree", "/d", "y.txt", 6).await;
        assert_eq!(totals(&service, "tree").await, (3, 10));

        let mut request = opts("tree", "/", "d", "");
        request.is_dir = true;
        let deleted = service.delete_object_info(request).await.unwrap();
        assert_eq!(deleted, DeletedObjects { count: 1, size: 0 });
        assert_eq!(totals(&service, "tree").await, (2, 10));

        for (dirname, name) in [("/", "d"), ("/d", "x.txt"), ("/d", "y.txt")] {
            assert!(service.query_object_info("tree", dirname, name, "").await.is_err());
        }
        let (listed, _) = service
            .query_object_infos_by_prefix("tree", "/d", 0, 100, true)
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|row| row.is_marker));
    }

    #[tokio::test]
    async fn unversioned_subtree_delete_and_recovery() {
        let service = service().await;
        create_bucket(&service, "flat", Versioning::Unset).await;
        put_file(&service, "flat", "/d", "x.txt", 4).await;
        put_file(&service, "flat", "/d", "y.txt", 6).await;

        let mut request = opts("flat", "/", "d", "");
        request.is_dir = true;
        let deleted = service.delete_object_info(request).await.unwrap();
        assert_eq!(deleted, DeletedObjects { count: 3, size: 10 });
        assert_eq!(totals(&service, "flat").await, (0, 0));

        // writing below a tombstoned directory brings the directory back
        put_file(&service, "flat", "/d", "z.txt", 2).await;
        let dir = service.query_object_info("flat", "/", "d", "").await.unwrap();
        assert!(dir.is_dir && !dir.is_marker);
        assert!(service.query_object_info("flat", "/d", "x.txt", "").await.is_err());
        assert_eq!(totals(&service, "flat").await, (2, 2));
    }

    #[tokio::test]
    async fn directory_delete_of_a_leaf_is_rejected() {
        let service = service().await;
        create_bucket(&service, "flat", Versioning::Unset).await;
        put_file(&service, "flat", "/", "f.txt", 1).await;

        let mut request = opts("flat", "/", "f.txt", "");
        request.is_dir = true;
        let err = service.delete_object_info(request).await.unwrap_err();
        assert!(matches!(err, NamespaceError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn root_is_never_an_entry() {
        let service = service().await;
        create_bucket(&service, "docs", Versioning::Unset).await;

        let root = ObjectInfo::directory("docs", "/", "", Utc::now());
        assert!(matches!(
            service.put_object_info(root).await.unwrap_err(),
            NamespaceError::Root
        ));
        assert!(matches!(
            service.delete_object_info(opts("docs", "/", "", "")).await.unwrap_err(),
            NamespaceError::Root
        ));
        assert_eq!(totals(&service, "docs").await, (0, 0));
    }

    #[tokio::test]
    async fn leaf_cannot_replace_a_directory() {
        let service = service().await;
        create_bucket(&service, "docs", Versioning::Unset).await;
        put_file(&service, "docs", "/q", "inner.txt", 1).await;

        let err = service
            .put_object_info(ObjectInfo::file("docs", "/", "q", "cid", 1, Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, NamespaceError::InvalidArgument(_)));
        assert_eq!(totals(&service, "docs").await, (2, 1));
    }

    #[tokio::test]
    async fn purge_removes_tombstones_only() {
        let service = service().await;
        create_bucket(&service, "purge", Versioning::Unset).await;
        put_file(&service, "purge", "/", "p.txt", 3).await;
        put_file(&service, "purge", "/", "live.txt", 1).await;
        service
            .delete_object_info(opts("purge", "/", "p.txt", ""))
            .await
            .unwrap();

        let err = service
            .delete_object_fetch_delete(opts("purge", "/", "live.txt", ""), false)
            .await
            .unwrap_err();
        assert!(matches!(err, NamespaceError::InvalidArgument(_)));

        let purged = service
            .delete_object_fetch_delete(opts("purge", "/", "p.txt", ""), false)
            .await
            .unwrap();
        assert_eq!(purged.count, 1);
        assert_eq!(totals(&service, "purge").await, (1, 1));

        let (listed, total) = service
            .query_object_infos_by_prefix("purge", "/", 0, 100, true)
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(listed[0].name, "live.txt");

        let err = service
            .delete_object_fetch_delete(opts("purge", "/", "p.txt", ""), false)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn listing_puts_directories_first_and_hides_tombstones() {
        let service = service().await;
        create_bucket(&service, "list", Versioning::Unset).await;
        put_file(&service, "list", "/", "b.txt", 1).await;
        put_file(&service, "list", "/", "c.txt", 1).await;
        put_file(&service, "list", "/dir1", "a.txt", 1).await;
        service
            .delete_object_info(opts("list", "/", "c.txt", ""))
            .await
            .unwrap();

        let (rows, total) = service
            .query_object_infos_by_prefix("list", "/", 0, 100, false)
            .await
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(rows[0].name, "dir1");
        assert!(rows[0].is_dir);
        assert_eq!(rows[1].name, "b.txt");

        let (rows, total) = service
            .query_object_infos_by_prefix("list", "/", 0, 100, true)
            .await
            .unwrap();
        assert_eq!(total, 3);
        assert!(rows[0].is_dir);
        assert!(rows.iter().any(|row| row.name == "c.txt" && row.is_marker));

        let (page, total) = service
            .query_object_infos_by_prefix("list", "/", 1, 1, false)
            .await
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].name, "b.txt");
    }

    #[tokio::test]
    async fn version_listing_paginates_by_marker() {
        let service = service().await;
        create_bucket(&service, "vlist", Versioning::Enabled).await;
        let v1 = put_file(&service, "vlist", "/", "k.txt", 1).await;
        let v2 = put_file(&service, "vlist", "/", "k.txt", 2).await;
        service
            .delete_object_info(opts("vlist", "/", "k.txt", ""))
            .await
            .unwrap();

        let live = service
            .query_object_info_all("vlist", "/", "", "", "", 1000, false)
            .await
            .unwrap();
        let versions: Vec<&str> = live.iter().map(|row| row.version.as_str()).collect();
        assert_eq!(versions, vec![v2.version.as_str(), v1.version.as_str()]);

        let first = service
            .query_object_info_all("vlist", "/", "", "", "", 1, true)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert!(first[0].is_marker);

        let rest = service
            .query_object_info_all("vlist", "/", "", "k.txt", &first[0].version, 1000, true)
            .await
            .unwrap();
        let versions: Vec<&str> = rest.iter().map(|row| row.version.as_str()).collect();
        assert_eq!(versions, vec![v2.version.as_str(), v1.version.as_str()]);
    }

    #[tokio::test]
    async fn bucket_lifecycle() {
        let service = service().await;
        let created = create_bucket(&service, "life", Versioning::Unset).await;
        assert!(!created.bucket_id.is_empty());

        let err = service
            .put_bucket_info(Bucket::new("life", "tester", Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, NamespaceError::BucketAlreadyExists(_)));
        let err = service
            .put_bucket_info(Bucket::new("Bad_Name", "tester", Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, NamespaceError::InvalidBucketName { .. }));

        // cached aggregates follow writes
        assert_eq!(totals(&service, "life").await, (0, 0));
        put_file(&service, "life", "/", "f.txt", 9).await;
        assert_eq!(totals(&service, "life").await, (1, 9));

        let err = service.delete_bucket_info("life").await.unwrap_err();
        assert!(matches!(err, NamespaceError::BucketNotEmpty(_)));

        service
            .delete_object_info(opts("life", "/", "f.txt", ""))
            .await
            .unwrap();
        service.delete_bucket_info("life").await.unwrap();
        assert!(matches!(
            service.query_bucket_info("life").await.unwrap_err(),
            NamespaceError::BucketNotFound(_)
        ));
        assert!(service.list_buckets(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn versioning_never_returns_to_unset() {
        let service = service().await;
        let mut bucket = create_bucket(&service, "mode", Versioning::Enabled).await;

        bucket.versioning = Versioning::Suspended;
        let updated = service.update_bucket_info(bucket.clone()).await.unwrap();
        assert_eq!(updated.versioning, Versioning::Suspended);
        assert_eq!(
            service.query_bucket_info("mode").await.unwrap().versioning,
            Versioning::Suspended
        );

        bucket.versioning = Versioning::Unset;
        let err = service.update_bucket_info(bucket).await.unwrap_err();
        assert!(matches!(err, NamespaceError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn external_attributes_round_trip() {
        let service = service().await;
        create_bucket(&service, "ext", Versioning::Unset).await;

        assert_eq!(
            service.query_bucket_external("ext", ExternalKind::Policy).await.unwrap(),
            None
        );
        service
            .put_bucket_external("ext", ExternalKind::Policy, Some("{\"Statement\":[]}"))
            .await
            .unwrap();
        assert_eq!(
            service
                .query_bucket_external("ext", ExternalKind::Policy)
                .await
                .unwrap()
                .as_deref(),
            Some("{\"Statement\":[]}")
        );
        service
            .delete_bucket_external("ext", ExternalKind::Policy)
            .await
            .unwrap();
        assert_eq!(
            service.query_bucket_external("ext", ExternalKind::Policy).await.unwrap(),
            None
        );

        let err = service
            .put_bucket_external("missing", ExternalKind::Acl, Some("private"))
            .await
            .unwrap_err();
        assert!(matches!(err, NamespaceError::BucketNotFound(_)));
    }

    #[tokio::test]
    async fn operations_on_missing_bucket_fail() {
        let service = service().await;
        let err = service
            .put_object_info(ObjectInfo::file("ghost", "/", "f.txt", "cid", 1, Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, NamespaceError::BucketNotFound(_)));
        let err = service
            .query_object_info("ghost", "/", "f.txt", "")
            .await
            .unwrap_err();
        assert!(matches!(err, NamespaceError::BucketNotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_writers_share_one_ancestor_chain() {
        let db = file_service(5).await;
        create_bucket(&db.service, "busy", Versioning::Unset).await;

        let mut tasks = Vec::new();
        for i in 1..=16i64 {
            let service = db.service.clone();
            tasks.push(tokio::spawn(async move {
                let obj = ObjectInfo::file("busy", "/a/b", &format!("f{}", i), "cid", i, Utc::now());
                service.put_object_info(obj).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        for (dirname, name) in [("/", "a"), ("/a", "b")] {
            let rows: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM objects WHERE bucket = ? AND dirname = ? AND name = ?",
            )
            .bind("busy")
            .bind(dirname)
            .bind(name)
            .fetch_one(db.service.db.as_ref())
            .await
            .unwrap();
            assert_eq!(rows, 1, "{}/{}", dirname, name);
        }
        assert_eq!(totals(&db.service, "busy").await, (18, 136));
        assert_eq!(live_totals(&db.service, "busy").await, (18, 136));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_deletes_of_unrelated_subtrees() {
        let db = file_service(5).await;
        create_bucket(&db.service, "busy", Versioning::Unset).await;
        for i in 0..8 {
            put_file(&db.service, "busy", &format!("/d{}", i), "x", 3).await;
        }
        put_file(&db.service, "busy", "/", "keep.txt", 5).await;
        assert_eq!(totals(&db.service, "busy").await, (17, 29));

        let mut tasks = Vec::new();
        for i in 0..8 {
            let service = db.service.clone();
            tasks.push(tokio::spawn(async move {
                let mut request = opts("busy", "/", &format!("d{}", i), "");
                request.is_dir = true;
                service.delete_object_info(request).await
            }));
        }
        for task in tasks {
            let deleted = task.await.unwrap().unwrap();
            assert_eq!(deleted, DeletedObjects { count: 2, size: 3 });
        }

        assert_eq!(totals(&db.service, "busy").await, (1, 5));
        assert_eq!(live_totals(&db.service, "busy").await, (1, 5));
    }

    #[tokio::test]
    async fn suspending_then_deleting_appends_a_marker() {
        let service = service().await;
        create_bucket(&service, "sus", Versioning::Enabled).await;
        let v1 = put_file(&service, "sus", "/", "s.txt", 4).await;
        assert_ne!(v1.version, "null");

        let mut bucket = service.query_bucket_info("sus").await.unwrap();
        bucket.versioning = Versioning::Suspended;
        service.update_bucket_info(bucket).await.unwrap();

        let deleted = service
            .delete_object_info(opts("sus", "/", "s.txt", ""))
            .await
            .unwrap();
        assert_eq!(deleted, DeletedObjects { count: 1, size: 4 });
        assert_eq!(totals(&service, "sus").await, (0, 0));
        {
            let mut conn = service.db.acquire().await.unwrap();
            let history = store::fetch_history_latest(&mut conn, "sus", "/", "s.txt", 10)
                .await
                .unwrap();
            assert_eq!(history.len(), 2);
            assert!(history[0].is_marker);
            assert_ne!(history[0].version, "null");
            assert_ne!(history[0].version, v1.version);
            assert_eq!(history[1].version, v1.version);
        }

        // deleting the marker brings the Enabled-era version back
        service
            .delete_object_info(opts("sus", "/", "s.txt", ""))
            .await
            .unwrap();
        let current = service.query_object_info("sus", "/", "s.txt", "").await.unwrap();
        assert_eq!(current.version, v1.version);
        assert_eq!(totals(&service, "sus").await, (1, 4));
    }

    #[tokio::test]
    async fn undeleting_a_leaf_recovers_its_tombstoned_directory() {
        let service = service().await;
        create_bucket(&service, "flat", Versioning::Unset).await;
        put_file(&service, "flat", "/d", "x.txt", 4).await;

        let mut request = opts("flat", "/", "d", "");
        request.is_dir = true;
        service.delete_object_info(request).await.unwrap();
        assert_eq!(totals(&service, "flat").await, (0, 0));

        let deleted = service
            .delete_object_info(opts("flat", "/d", "x.txt", ""))
            .await
            .unwrap();
        assert_eq!(deleted, DeletedObjects::default());

        let dir = service.query_object_info("flat", "/", "d", "").await.unwrap();
        assert!(dir.is_dir && !dir.is_marker);
        assert!(
            service
                .query_object_info("flat", "/d", "x.txt", "")
                .await
                .unwrap_err()
                .is_not_found()
        );
        assert_eq!(totals(&service, "flat").await, (1, 0));
        assert_eq!(live_totals(&service, "flat").await, (1, 0));
    }

    #[tokio::test]
    async fn enabled_leaf_delete_archives_its_directories() {
        let service = service().await;
        create_bucket(&service, "ver", Versioning::Enabled).await;
        put_file(&service, "ver", "/docs", "r.txt", 4).await;
        put_file(&service, "ver", "/docs", "s.txt", 2).await;

        for name in ["r.txt", "s.txt"] {
            service
                .delete_object_info(opts("ver", "/docs", name, ""))
                .await
                .unwrap();
        }
        assert_eq!(totals(&service, "ver").await, (1, 0));

        {
            let mut conn = service.db.acquire().await.unwrap();
            let history = store::fetch_history_latest(&mut conn, "ver", "/", "docs", 10)
                .await
                .unwrap();
            assert_eq!(history.len(), 1);
            assert!(history[0].is_dir && !history[0].is_marker);
        }

        let (listed, _) = service
            .query_object_infos_by_prefix("ver", "/", 0, 100, true)
            .await
            .unwrap();
        assert_eq!(listed.iter().filter(|row| row.name == "docs").count(), 1);
    }
}
