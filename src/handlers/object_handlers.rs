//! HTTP handlers for object entries, listings and version queries.
//!
//! Object paths arrive as the wildcard tail of the route and are split into
//! `(dirname, name)` before reaching `NamespaceService`.

use crate::{
    errors::AppError,
    models::object::{DeletedObjects, ObjectInfo, ObjectOptions},
    services::{namespace_service::NamespaceService, paths},
};
use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Body of `PUT /buckets/{bucket}/objects/{*path}`.
#[derive(Debug, Deserialize)]
pub struct PutObjectReq {
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default)]
    pub cid: String,
    #[serde(default)]
    pub etag: String,
    #[serde(default)]
    pub content_length: i64,
    #[serde(default)]
    pub cipher_text_size: i64,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub storage_class: String,
    #[serde(default)]
    pub acl: String,
    #[serde(default)]
    pub tags: String,
}

#[derive(Debug, Deserialize)]
pub struct GetObjectQuery {
    #[serde(default)]
    pub version: String,
    /// Read from the history ledger instead of the current table.
    #[serde(default)]
    pub history: bool,
}

#[derive(Debug, Deserialize)]
pub struct DeleteObjectQuery {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub dir: bool,
    /// Physically remove tombstones instead of writing new ones.
    #[serde(default)]
    pub purge: bool,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub offset: i64,
    pub limit: Option<i64>,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Deserialize)]
pub struct VersionsQuery {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub marker: String,
    #[serde(default)]
    pub version_marker: String,
    pub max_keys: Option<i64>,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Deserialize)]
pub struct CountQuery {
    #[serde(default)]
    pub prefix: String,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub objects: Vec<ObjectInfo>,
    pub total: i64,
}

pub async fn put_object(
    State(service): State<NamespaceService>,
    Path((bucket, path)): Path<(String, String)>,
    Json(req): Json<PutObjectReq>,
) -> Result<Json<ObjectInfo>, AppError> {
    let (dirname, name) = paths::split(&path)?;
    let now = chrono::Utc::now();
    let mut obj = if req.is_dir {
        ObjectInfo::directory(&bucket, dirname, name, now)
    } else {
        let mut obj = ObjectInfo::file(&bucket, dirname, name, req.cid, req.content_length, now);
        obj.etag = req.etag;
        obj.cipher_text_size = req.cipher_text_size;
        if !req.content_type.is_empty() {
            obj.content_type = req.content_type;
        }
        obj
    };
    obj.storage_class = req.storage_class;
    obj.acl = req.acl;
    obj.tags = req.tags;

    Ok(Json(service.put_object_info(obj).await?))
}

pub async fn get_object(
    State(service): State<NamespaceService>,
    Path((bucket, path)): Path<(String, String)>,
    Query(query): Query<GetObjectQuery>,
) -> Result<Json<ObjectInfo>, AppError> {
    let (dirname, name) = paths::split(&path)?;
    let obj = if query.history {
        service
            .query_object_history_info(&bucket, &dirname, &name, &query.version)
            .await?
    } else {
        service
            .query_object_info(&bucket, &dirname, &name, &query.version)
            .await?
    };
    Ok(Json(obj))
}

pub async fn delete_object(
    State(service): State<NamespaceService>,
    Path((bucket, path)): Path<(String, String)>,
    Query(query): Query<DeleteObjectQuery>,
) -> Result<Json<DeletedObjects>, AppError> {
    let (prefix, object) = paths::split(&path)?;
    let opts = ObjectOptions {
        bucket,
        prefix,
        object,
        version_id: query.version,
        is_dir: query.dir,
    };
    let deleted = if query.purge {
        service
            .delete_object_fetch_delete(opts, query.recursive)
            .await?
    } else {
        service.delete_object_info(opts).await?
    };
    Ok(Json(deleted))
}

pub async fn list_objects(
    State(service): State<NamespaceService>,
    Path(bucket): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, AppError> {
    let (objects, total) = service
        .query_object_infos_by_prefix(
            &bucket,
            &query.prefix,
            query.offset,
            query.limit.unwrap_or(100),
            query.deleted,
        )
        .await?;
    Ok(Json(ListResponse { objects, total }))
}

pub async fn list_versions(
    State(service): State<NamespaceService>,
    Path(bucket): Path<String>,
    Query(query): Query<VersionsQuery>,
) -> Result<Json<Vec<ObjectInfo>>, AppError> {
    let versions = service
        .query_object_info_all(
            &bucket,
            &query.prefix,
            &query.object,
            &query.marker,
            &query.version_marker,
            query.max_keys.unwrap_or(1000),
            query.deleted,
        )
        .await?;
    Ok(Json(versions))
}

pub async fn count_objects(
    State(service): State<NamespaceService>,
    Path(bucket): Path<String>,
    Query(query): Query<CountQuery>,
) -> Result<Json<Value>, AppError> {
    let count = service
        .count_objects_by_prefix(&bucket, &query.prefix)
        .await?;
    Ok(Json(json!({ "bucket": bucket, "prefix": query.prefix, "count": count })))
}
