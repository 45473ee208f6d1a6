use sqlx::sqlite::SqlitePoolOptions;
use std::{path::PathBuf, sync::Arc};
use uuid::Uuid;

use super::{
    cache::MemoryCacheStore,
    clock::SystemClock,
    lock::LocalLock,
    namespace_service::{NamespaceService, NamespaceSettings},
};
use crate::models::bucket::{Bucket, Versioning};

/// Service over a fresh in-memory database. A single connection that never
/// expires keeps the database alive for the whole test.
pub async fn service() -> NamespaceService {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    crate::db::run_migrations(&pool).await.unwrap();
    build(pool)
}

fn build(pool: sqlx::SqlitePool) -> NamespaceService {
    NamespaceService::new(
        Arc::new(pool),
        Arc::new(MemoryCacheStore::new()),
        Arc::new(LocalLock::new()),
        Arc::new(SystemClock),
        NamespaceSettings::default(),
    )
}

/// Service over a database file in the temp directory, opened the way the
/// server opens it. The files are removed on drop.
pub struct FileBacked {
    pub service: NamespaceService,
    path: PathBuf,
}

impl Drop for FileBacked {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", self.path.display(), suffix));
        }
    }
}

pub async fn file_service(max_connections: u32) -> FileBacked {
    let path = std::env::temp_dir().join(format!("nameserver-{}.db", Uuid::new_v4()));
    let url = format!("sqlite://{}", path.display());
    let pool = crate::db::connect(&url, max_connections).await.unwrap();
    crate::db::run_migrations(&pool).await.unwrap();
    FileBacked {
        service: build(pool),
        path,
    }
}

/// `(count, size)` recomputed from the live rows of `objects`.
pub async fn live_totals(service: &NamespaceService, bucket: &str) -> (i64, i64) {
    sqlx::query_as(
        "SELECT COUNT(*), COALESCE(SUM(CASE WHEN is_dir = 0 THEN content_length ELSE 0 END), 0)
         FROM objects WHERE bucket = ? AND is_marker = 0",
    )
    .bind(bucket)
    .fetch_one(service.db.as_ref())
    .await
    .unwrap()
}

pub async fn create_bucket(service: &NamespaceService, name: &str, versioning: Versioning) -> Bucket {
    let mut bucket = Bucket::new(name, "tester", chrono::Utc::now());
    bucket.versioning = versioning;
    service.put_bucket_info(bucket).await.unwrap()
}
