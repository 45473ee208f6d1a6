//! HTTP handlers for bucket records and their side-table attributes.

use crate::{
    errors::AppError,
    models::bucket::{Bucket, ExternalKind, Versioning},
    services::namespace_service::NamespaceService,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;

/// Body of `PUT /buckets/{bucket}`.
#[derive(Debug, Deserialize)]
pub struct CreateBucketReq {
    pub owner: String,
    #[serde(default)]
    pub versioning: Option<Versioning>,
    pub storage_class: Option<String>,
    pub location: Option<String>,
}

/// Body of `POST /buckets/{bucket}`. Missing fields keep their stored value.
#[derive(Debug, Deserialize)]
pub struct UpdateBucketReq {
    pub owner: Option<String>,
    pub versioning: Option<Versioning>,
    pub storage_class: Option<String>,
    pub location: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListBucketsQuery {
    pub owner: Option<String>,
}

/// Body of `PUT /buckets/{bucket}/external/{kind}`.
#[derive(Debug, Deserialize)]
pub struct ExternalReq {
    pub value: String,
}

pub async fn create_bucket(
    State(service): State<NamespaceService>,
    Path(name): Path<String>,
    Json(req): Json<CreateBucketReq>,
) -> Result<impl IntoResponse, AppError> {
    let mut bucket = Bucket::new(name, req.owner, chrono::Utc::now());
    bucket.versioning = req.versioning.unwrap_or_default();
    if let Some(storage_class) = req.storage_class {
        bucket.storage_class = storage_class;
    }
    if let Some(location) = req.location {
        bucket.location = location;
    }
    let created = service.put_bucket_info(bucket).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn update_bucket(
    State(service): State<NamespaceService>,
    Path(name): Path<String>,
    Json(req): Json<UpdateBucketReq>,
) -> Result<Json<Bucket>, AppError> {
    let current = service.query_bucket_info(&name).await?;
    let bucket = Bucket {
        owner: req.owner.unwrap_or_default(),
        versioning: req.versioning.unwrap_or(current.versioning),
        storage_class: req.storage_class.unwrap_or_default(),
        location: req.location.unwrap_or_default(),
        ..current
    };
    Ok(Json(service.update_bucket_info(bucket).await?))
}

pub async fn get_bucket(
    State(service): State<NamespaceService>,
    Path(name): Path<String>,
) -> Result<Json<Bucket>, AppError> {
    Ok(Json(service.query_bucket_info(&name).await?))
}

pub async fn list_buckets(
    State(service): State<NamespaceService>,
    Query(query): Query<ListBucketsQuery>,
) -> Result<Json<Vec<Bucket>>, AppError> {
    Ok(Json(service.list_buckets(query.owner.as_deref()).await?))
}

pub async fn delete_bucket(
    State(service): State<NamespaceService>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    service.delete_bucket_info(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn put_external(
    State(service): State<NamespaceService>,
    Path((name, kind)): Path<(String, String)>,
    Json(req): Json<ExternalReq>,
) -> Result<StatusCode, AppError> {
    let kind = parse_kind(&kind)?;
    service
        .put_bucket_external(&name, kind, Some(&req.value))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_external(
    State(service): State<NamespaceService>,
    Path((name, kind)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let kind = parse_kind(&kind)?;
    match service.query_bucket_external(&name, kind).await? {
        Some(value) => Ok(Json(json!({ "bucket": name, "kind": kind, "value": value }))),
        None => Err(AppError::new(
            StatusCode::NOT_FOUND,
            format!("bucket `{}` has no {}", name, kind.column()),
        )),
    }
}

pub async fn delete_external(
    State(service): State<NamespaceService>,
    Path((name, kind)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    let kind = parse_kind(&kind)?;
    service.delete_bucket_external(&name, kind).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn parse_kind(kind: &str) -> Result<ExternalKind, AppError> {
    kind.parse().map_err(AppError::bad_request)
}
