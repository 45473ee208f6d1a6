//! NamespaceStore: parameterized statements over `buckets`,
//! `bucket_external`, `objects` (current) and `object_history`.
//!
//! Every function runs on a borrowed connection so callers decide the
//! transaction boundary. No business rules live here.

use crate::models::{
    bucket::{Bucket, BucketExternal, ExternalKind},
    object::ObjectInfo,
};
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, SqliteConnection, sqlite::Sqlite};
use tracing::debug;

/// Column list shared by both object tables.
const OBJECT_COLUMNS: &str = "id, bucket, dirname, name, cid, etag, content_length, \
     cipher_text_size, content_type, version, is_dir, is_marker, storage_class, acl, tags, \
     created_at, updated_at";

const INSERT_COLUMNS: &str = "bucket, dirname, name, cid, etag, content_length, \
     cipher_text_size, content_type, version, is_dir, is_marker, storage_class, acl, tags, \
     created_at, updated_at";

const BUCKET_COLUMNS: &str =
    "name, bucket_id, count, size, owner, versioning, storage_class, location, created_at, updated_at";

/// Rows per multi-row INSERT. Sixteen binds per row keeps a statement well
/// under SQLite's host-parameter limit.
pub const INSERT_BATCH_SIZE: usize = 50;

/// Rows per `IN (...)` list.
const ID_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Current,
    History,
}

impl Table {
    fn name(&self) -> &'static str {
        match self {
            Table::Current => "objects",
            Table::History => "object_history",
        }
    }
}

// ---------------------------------------------------------------------------
// Buckets
// ---------------------------------------------------------------------------

pub async fn fetch_bucket(conn: &mut SqliteConnection, name: &str) -> sqlx::Result<Option<Bucket>> {
    sqlx::query_as::<_, Bucket>(&format!(
        "SELECT {} FROM buckets WHERE name = ?",
        BUCKET_COLUMNS
    ))
    .bind(name)
    .fetch_optional(&mut *conn)
    .await
}

pub async fn list_buckets(
    conn: &mut SqliteConnection,
    owner: Option<&str>,
) -> sqlx::Result<Vec<Bucket>> {
    let mut builder =
        QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM buckets", BUCKET_COLUMNS));
    if let Some(owner) = owner {
        builder.push(" WHERE owner = ");
        builder.push_bind(owner.to_string());
    }
    builder.push(" ORDER BY name ASC");
    builder
        .build_query_as::<Bucket>()
        .fetch_all(&mut *conn)
        .await
}

pub async fn insert_bucket(conn: &mut SqliteConnection, bucket: &Bucket) -> sqlx::Result<()> {
    sqlx::query(&format!(
        "INSERT INTO buckets ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        BUCKET_COLUMNS
    ))
    .bind(&bucket.name)
    .bind(&bucket.bucket_id)
    .bind(bucket.count)
    .bind(bucket.size)
    .bind(&bucket.owner)
    .bind(bucket.versioning.as_str())
    .bind(&bucket.storage_class)
    .bind(&bucket.location)
    .bind(bucket.created_at)
    .bind(bucket.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Overwrite the mutable settings of a bucket. Counters are left alone.
pub async fn update_bucket_settings(
    conn: &mut SqliteConnection,
    bucket: &Bucket,
) -> sqlx::Result<u64> {
    let result = sqlx::query(
        "UPDATE buckets SET owner = ?, versioning = ?, storage_class = ?, location = ?, updated_at = ?
         WHERE name = ?",
    )
    .bind(&bucket.owner)
    .bind(bucket.versioning.as_str())
    .bind(&bucket.storage_class)
    .bind(&bucket.location)
    .bind(bucket.updated_at)
    .bind(&bucket.name)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Remove a bucket together with every row that still references it.
pub async fn delete_bucket(conn: &mut SqliteConnection, name: &str) -> sqlx::Result<u64> {
    for table in ["objects", "object_history", "bucket_external"] {
        sqlx::query(&format!("DELETE FROM {} WHERE bucket = ?", table))
            .bind(name)
            .execute(&mut *conn)
            .await?;
    }
    let result = sqlx::query("DELETE FROM buckets WHERE name = ?")
        .bind(name)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

pub async fn fetch_bucket_external(
    conn: &mut SqliteConnection,
    bucket: &str,
) -> sqlx::Result<Option<BucketExternal>> {
    sqlx::query_as::<_, BucketExternal>(
        "SELECT bucket, policy, acl, tags, logging FROM bucket_external WHERE bucket = ?",
    )
    .bind(bucket)
    .fetch_optional(&mut *conn)
    .await
}

/// Set (or clear, with `None`) one blob of the bucket side table.
pub async fn upsert_bucket_external(
    conn: &mut SqliteConnection,
    bucket: &str,
    kind: ExternalKind,
    value: Option<&str>,
    now: DateTime<Utc>,
) -> sqlx::Result<()> {
    let column = kind.column();
    sqlx::query(&format!(
        "INSERT INTO bucket_external (bucket, {column}, updated_at) VALUES (?, ?, ?)
         ON CONFLICT(bucket) DO UPDATE SET {column} = excluded.{column}, updated_at = excluded.updated_at"
    ))
    .bind(bucket)
    .bind(value)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Point lookups
// ---------------------------------------------------------------------------

pub async fn fetch_current(
    conn: &mut SqliteConnection,
    bucket: &str,
    dirname: &str,
    name: &str,
) -> sqlx::Result<Option<ObjectInfo>> {
    sqlx::query_as::<_, ObjectInfo>(&format!(
        "SELECT {} FROM objects WHERE bucket = ? AND dirname = ? AND name = ?",
        OBJECT_COLUMNS
    ))
    .bind(bucket)
    .bind(dirname)
    .bind(name)
    .fetch_optional(&mut *conn)
    .await
}

/// Directory rows of `objects` matching any of the `(dirname, name)` pairs.
pub async fn fetch_current_dirs(
    conn: &mut SqliteConnection,
    bucket: &str,
    pairs: &[(String, String)],
) -> sqlx::Result<Vec<ObjectInfo>> {
    if pairs.is_empty() {
        return Ok(Vec::new());
    }
    let mut builder = QueryBuilder::<Sqlite>::new(format!(
        "SELECT {} FROM objects WHERE bucket = ",
        OBJECT_COLUMNS
    ));
    builder.push_bind(bucket.to_string());
    builder.push(" AND is_dir = 1 AND (");
    for (i, (dirname, name)) in pairs.iter().enumerate() {
        if i > 0 {
            builder.push(" OR ");
        }
        builder.push("(dirname = ");
        builder.push_bind(dirname.clone());
        builder.push(" AND name = ");
        builder.push_bind(name.clone());
        builder.push(")");
    }
    builder.push(") ORDER BY length(dirname) ASC");
    builder
        .build_query_as::<ObjectInfo>()
        .fetch_all(&mut *conn)
        .await
}

/// The `limit` most recent history rows of an identity, newest first.
pub async fn fetch_history_latest(
    conn: &mut SqliteConnection,
    bucket: &str,
    dirname: &str,
    name: &str,
    limit: i64,
) -> sqlx::Result<Vec<ObjectInfo>> {
    sqlx::query_as::<_, ObjectInfo>(&format!(
        "SELECT {} FROM object_history WHERE bucket = ? AND dirname = ? AND name = ?
         ORDER BY id DESC LIMIT ?",
        OBJECT_COLUMNS
    ))
    .bind(bucket)
    .bind(dirname)
    .bind(name)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await
}

pub async fn fetch_history_version(
    conn: &mut SqliteConnection,
    bucket: &str,
    dirname: &str,
    name: &str,
    version: &str,
) -> sqlx::Result<Option<ObjectInfo>> {
    sqlx::query_as::<_, ObjectInfo>(&format!(
        "SELECT {} FROM object_history
         WHERE bucket = ? AND dirname = ? AND name = ? AND version = ?
         ORDER BY id DESC LIMIT 1",
        OBJECT_COLUMNS
    ))
    .bind(bucket)
    .bind(dirname)
    .bind(name)
    .bind(version)
    .fetch_optional(&mut *conn)
    .await
}

pub async fn history_exists(
    conn: &mut SqliteConnection,
    bucket: &str,
    dirname: &str,
    name: &str,
) -> sqlx::Result<bool> {
    let found: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM object_history WHERE bucket = ? AND dirname = ? AND name = ? LIMIT 1",
    )
    .bind(bucket)
    .bind(dirname)
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(found.is_some())
}

// ---------------------------------------------------------------------------
// Range reads
// ---------------------------------------------------------------------------

/// Push the predicate "row is `path` itself or lives below it".
fn push_subtree_filter(builder: &mut QueryBuilder<'_, Sqlite>, path: &str, include_self: bool) {
    let below = format!("{}/", path);
    builder.push(" AND (dirname = ");
    builder.push_bind(path.to_string());
    builder.push(" OR substr(dirname, 1, ");
    builder.push_bind(below.chars().count() as i64);
    builder.push(") = ");
    builder.push_bind(below);
    if include_self {
        let (dirname, name) = match path.rsplit_once('/') {
            Some(("", name)) => ("/".to_string(), name.to_string()),
            Some((dirname, name)) => (dirname.to_string(), name.to_string()),
            None => ("/".to_string(), path.to_string()),
        };
        builder.push(" OR (dirname = ");
        builder.push_bind(dirname);
        builder.push(" AND name = ");
        builder.push_bind(name);
        builder.push(")");
    }
    builder.push(")");
}

/// Rows of `table` at or below `path`, shallowest first.
pub async fn fetch_subtree(
    conn: &mut SqliteConnection,
    table: Table,
    bucket: &str,
    path: &str,
    markers: Option<bool>,
) -> sqlx::Result<Vec<ObjectInfo>> {
    let mut builder = QueryBuilder::<Sqlite>::new(format!(
        "SELECT {} FROM {} WHERE bucket = ",
        OBJECT_COLUMNS,
        table.name()
    ));
    builder.push_bind(bucket.to_string());
    push_subtree_filter(&mut builder, path, true);
    if let Some(is_marker) = markers {
        builder.push(" AND is_marker = ");
        builder.push_bind(is_marker);
    }
    builder.push(" ORDER BY length(dirname) ASC, id ASC");
    builder
        .build_query_as::<ObjectInfo>()
        .fetch_all(&mut *conn)
        .await
}

/// Live rows strictly below the directory `path`.
pub async fn count_by_prefix(
    conn: &mut SqliteConnection,
    bucket: &str,
    path: &str,
) -> sqlx::Result<i64> {
    let mut builder =
        QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM objects WHERE is_marker = 0 AND bucket = ");
    builder.push_bind(bucket.to_string());
    if path != "/" {
        push_subtree_filter(&mut builder, path, false);
    }
    builder
        .build_query_scalar::<i64>()
        .fetch_one(&mut *conn)
        .await
}

/// One page of the children of `dirname`, directories first, newest first.
pub async fn list_children(
    conn: &mut SqliteConnection,
    bucket: &str,
    dirname: &str,
    include_markers: bool,
    offset: i64,
    limit: i64,
) -> sqlx::Result<Vec<ObjectInfo>> {
    let mut builder = QueryBuilder::<Sqlite>::new(format!(
        "SELECT {} FROM objects WHERE bucket = ",
        OBJECT_COLUMNS
    ));
    builder.push_bind(bucket.to_string());
    builder.push(" AND dirname = ");
    builder.push_bind(dirname.to_string());
    if !include_markers {
        builder.push(" AND is_marker = 0");
    }
    builder.push(" ORDER BY is_dir DESC, updated_at DESC, name ASC LIMIT ");
    builder.push_bind(limit);
    builder.push(" OFFSET ");
    builder.push_bind(offset);
    builder
        .build_query_as::<ObjectInfo>()
        .fetch_all(&mut *conn)
        .await
}

pub async fn count_children(
    conn: &mut SqliteConnection,
    bucket: &str,
    dirname: &str,
    include_markers: bool,
) -> sqlx::Result<i64> {
    let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM objects WHERE bucket = ");
    builder.push_bind(bucket.to_string());
    builder.push(" AND dirname = ");
    builder.push_bind(dirname.to_string());
    if !include_markers {
        builder.push(" AND is_marker = 0");
    }
    builder
        .build_query_scalar::<i64>()
        .fetch_one(&mut *conn)
        .await
}

/// Every row of `table` whose parent is `dirname`, optionally narrowed to one
/// name. History rows come newest first within a name.
pub async fn fetch_children(
    conn: &mut SqliteConnection,
    table: Table,
    bucket: &str,
    dirname: &str,
    name: Option<&str>,
) -> sqlx::Result<Vec<ObjectInfo>> {
    let mut builder = QueryBuilder::<Sqlite>::new(format!(
        "SELECT {} FROM {} WHERE bucket = ",
        OBJECT_COLUMNS,
        table.name()
    ));
    builder.push_bind(bucket.to_string());
    builder.push(" AND dirname = ");
    builder.push_bind(dirname.to_string());
    if let Some(name) = name {
        builder.push(" AND name = ");
        builder.push_bind(name.to_string());
    }
    builder.push(" ORDER BY name ASC, id DESC");
    builder
        .build_query_as::<ObjectInfo>()
        .fetch_all(&mut *conn)
        .await
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

/// Multi-row insert, split into statements of `INSERT_BATCH_SIZE` rows.
pub async fn insert_rows(
    conn: &mut SqliteConnection,
    table: Table,
    rows: &[ObjectInfo],
) -> sqlx::Result<()> {
    for chunk in rows.chunks(INSERT_BATCH_SIZE) {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "INSERT INTO {} ({}) ",
            table.name(),
            INSERT_COLUMNS
        ));
        builder.push_values(chunk, |mut b, row| {
            b.push_bind(row.bucket.clone())
                .push_bind(row.dirname.clone())
                .push_bind(row.name.clone())
                .push_bind(row.cid.clone())
                .push_bind(row.etag.clone())
                .push_bind(row.content_length)
                .push_bind(row.cipher_text_size)
                .push_bind(row.content_type.clone())
                .push_bind(row.version.clone())
                .push_bind(row.is_dir)
                .push_bind(row.is_marker)
                .push_bind(row.storage_class.clone())
                .push_bind(row.acl.clone())
                .push_bind(row.tags.clone())
                .push_bind(row.created_at)
                .push_bind(row.updated_at);
        });
        builder.build().execute(&mut *conn).await?;
    }
    debug!(table = table.name(), rows = rows.len(), "inserted rows");
    Ok(())
}

pub async fn insert_row(
    conn: &mut SqliteConnection,
    table: Table,
    row: &ObjectInfo,
) -> sqlx::Result<()> {
    insert_rows(conn, table, std::slice::from_ref(row)).await
}

/// Overwrite every content column of the current row `id` with `row`.
pub async fn overwrite_current(
    conn: &mut SqliteConnection,
    id: i64,
    row: &ObjectInfo,
) -> sqlx::Result<u64> {
    let result = sqlx::query(
        "UPDATE objects SET cid = ?, etag = ?, content_length = ?, cipher_text_size = ?,
                content_type = ?, version = ?, is_dir = ?, is_marker = ?, storage_class = ?,
                acl = ?, tags = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(&row.cid)
    .bind(&row.etag)
    .bind(row.content_length)
    .bind(row.cipher_text_size)
    .bind(&row.content_type)
    .bind(&row.version)
    .bind(row.is_dir)
    .bind(row.is_marker)
    .bind(&row.storage_class)
    .bind(&row.acl)
    .bind(&row.tags)
    .bind(row.updated_at)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

pub async fn touch_current(
    conn: &mut SqliteConnection,
    ids: &[i64],
    now: DateTime<Utc>,
) -> sqlx::Result<u64> {
    let mut affected = 0;
    for chunk in ids.chunks(ID_BATCH_SIZE) {
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE objects SET updated_at = ");
        builder.push_bind(now);
        builder.push(" WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in chunk {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
        affected += builder.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(affected)
}

/// Flip marker directories back to live `"null"` directories.
pub async fn unmark_dirs(
    conn: &mut SqliteConnection,
    ids: &[i64],
    now: DateTime<Utc>,
) -> sqlx::Result<u64> {
    let mut affected = 0;
    for chunk in ids.chunks(ID_BATCH_SIZE) {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "UPDATE objects SET is_marker = 0, version = 'null', updated_at = ",
        );
        builder.push_bind(now);
        builder.push(" WHERE is_dir = 1 AND id IN (");
        let mut separated = builder.separated(", ");
        for id in chunk {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
        affected += builder.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(affected)
}

pub async fn delete_by_ids(
    conn: &mut SqliteConnection,
    table: Table,
    ids: &[i64],
) -> sqlx::Result<u64> {
    let mut affected = 0;
    for chunk in ids.chunks(ID_BATCH_SIZE) {
        let mut builder =
            QueryBuilder::<Sqlite>::new(format!("DELETE FROM {} WHERE id IN (", table.name()));
        let mut separated = builder.separated(", ");
        for id in chunk {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
        affected += builder.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(affected)
}

/// Delete the current row of an identity only if it carries `version`.
pub async fn delete_current_version(
    conn: &mut SqliteConnection,
    bucket: &str,
    dirname: &str,
    name: &str,
    version: &str,
) -> sqlx::Result<u64> {
    let result = sqlx::query(
        "DELETE FROM objects WHERE bucket = ? AND dirname = ? AND name = ? AND version = ?",
    )
    .bind(bucket)
    .bind(dirname)
    .bind(name)
    .bind(version)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

pub async fn delete_history_version(
    conn: &mut SqliteConnection,
    bucket: &str,
    dirname: &str,
    name: &str,
    version: &str,
) -> sqlx::Result<u64> {
    let result = sqlx::query(
        "DELETE FROM object_history WHERE bucket = ? AND dirname = ? AND name = ? AND version = ?",
    )
    .bind(bucket)
    .bind(dirname)
    .bind(name)
    .bind(version)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

pub async fn delete_history_identity(
    conn: &mut SqliteConnection,
    bucket: &str,
    dirname: &str,
    name: &str,
) -> sqlx::Result<u64> {
    let result =
        sqlx::query("DELETE FROM object_history WHERE bucket = ? AND dirname = ? AND name = ?")
            .bind(bucket)
            .bind(dirname)
            .bind(name)
            .execute(&mut *conn)
            .await?;
    Ok(result.rows_affected())
}

/// Turn the `"null"` history rows of an identity into a marker stamped with
/// `version`.
pub async fn mark_history_null(
    conn: &mut SqliteConnection,
    bucket: &str,
    dirname: &str,
    name: &str,
    version: &str,
    now: DateTime<Utc>,
) -> sqlx::Result<u64> {
    let result = sqlx::query(
        "UPDATE object_history
         SET is_marker = 1, version = ?, cid = '-', etag = '-', content_length = 0,
             cipher_text_size = 0, updated_at = ?
         WHERE bucket = ? AND dirname = ? AND name = ? AND version = 'null' AND is_marker = 0",
    )
    .bind(version)
    .bind(now)
    .bind(bucket)
    .bind(dirname)
    .bind(name)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}
